//! BFT2f protocol messages.
//!
//! This module defines all messages used in the protocol:
//!
//! ## Normal Operation
//! - [`Request`] - Client → Primary: execute this operation
//! - [`PrePrepare`] - Primary → Backups: sequence this request
//! - [`Prepare`] - Backup → All: I accepted this pre-prepare
//! - [`Commit`] - Replica → All: I hold a prepared certificate
//! - [`Reply`] - Replica → Client: result plus my hash-chain version
//!
//! ## Checkpointing
//! - [`Checkpoint`] - Replica → All: state digest at a sequence multiple
//!
//! ## View Change
//! - [`ViewChange`] - Replica → All: signed evidence for a new view
//! - [`NewView`] - New Primary → All: the reconstructed log prefix
//!
//! Every message travels in a [`Message`] envelope carrying the sender
//! and an [`Authenticator`]. Which authenticator a message needs is a
//! property of its kind, decided by the total match in
//! [`Payload::auth_kind`]: the high-volume agreement traffic uses a
//! per-recipient MAC vector, while REQUEST, VIEW-CHANGE, and NEW-VIEW
//! are authenticated by payload-level Ed25519 signatures, because those
//! messages must remain convincing when replayed to third parties (a
//! VIEW-CHANGE embedded inside a NEW-VIEW must still verify, and a
//! request forwarded by a backup still speaks for its client).

use serde::{Deserialize, Serialize};

use pyrite_crypto::{AuthVector, CryptoError, MacKeychain, Signature, SigningKey, VerifyingKey};
use pyrite_crypto::digest::hash_bytes;
use pyrite_types::{ClientId, Hash, ReplicaId, RequestTimestamp, SeqNumber, ViewNumber};
use pyrite_wire::canonical_request_bytes;

// ============================================================================
// Peer
// ============================================================================

/// A protocol participant: either a replica or a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Peer {
    Replica(ReplicaId),
    Client(ClientId),
}

impl std::fmt::Display for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Peer::Replica(id) => write!(f, "{id}"),
            Peer::Client(id) => write!(f, "{id}"),
        }
    }
}

impl From<ReplicaId> for Peer {
    fn from(id: ReplicaId) -> Self {
        Peer::Replica(id)
    }
}

impl From<ClientId> for Peer {
    fn from(id: ClientId) -> Self {
        Peer::Client(id)
    }
}

// ============================================================================
// Authenticator
// ============================================================================

/// How a message kind proves its origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthKind {
    /// Per-hop MAC vector, one authenticator per recipient.
    MacVector,

    /// The payload embeds an Ed25519 signature that any future recipient
    /// can check; the envelope adds nothing.
    PayloadSignature,
}

/// The authenticator attached to an envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Authenticator {
    /// MAC vector over the canonical serialization of (sender, payload).
    Macs(AuthVector<Peer>),

    /// Marker for payload-signed kinds; the proof itself lives in the
    /// payload's signature field.
    Signed,
}

// ============================================================================
// Message Envelope
// ============================================================================

/// A protocol message with routing and authentication information.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// The participant that sent this message.
    pub sender: Peer,

    /// The message payload.
    pub payload: Payload,

    /// The attached authenticator. `None` only before
    /// [`Message::authenticate`]; payload-signed kinds are accepted with
    /// or without the marker since their proof travels in the payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<Authenticator>,
}

impl Message {
    /// Creates an unauthenticated message. Call [`Message::authenticate`]
    /// before handing it to a transport.
    pub fn new(sender: impl Into<Peer>, payload: Payload) -> Self {
        Self {
            sender: sender.into(),
            payload,
            auth: None,
        }
    }

    /// The bytes the MAC vector covers: canonical serialization of
    /// (sender, payload). The authenticator never covers itself.
    pub fn authenticated_bytes(&self) -> Vec<u8> {
        let to_auth = (&self.sender, &self.payload);
        postcard::to_allocvec(&to_auth)
            .expect("message serialization should never fail (all fields are serializable)")
    }

    /// Attaches the authenticator this payload kind calls for: one MAC
    /// per recipient for agreement traffic, the signed marker for kinds
    /// whose payload already carries a signature.
    pub fn authenticate(
        mut self,
        keychain: &MacKeychain<Peer>,
        recipients: impl IntoIterator<Item = Peer>,
    ) -> Result<Self, CryptoError> {
        self.auth = None;
        self.auth = Some(match self.payload.auth_kind() {
            AuthKind::MacVector => {
                let bytes = self.authenticated_bytes();
                Authenticator::Macs(keychain.authenticate_all(recipients, &bytes)?)
            }
            AuthKind::PayloadSignature => Authenticator::Signed,
        });
        Ok(self)
    }

    /// Checks this envelope's authenticity as seen by `me`.
    ///
    /// MAC-vector kinds must carry a MAC addressed to `me` that verifies
    /// against the claimed sender. Payload-signed kinds pass when the
    /// payload's signature field is populated — the signature itself is
    /// verified against the right public key by the protocol handler
    /// (the engine looks up client keys for REQUESTs and replica keys
    /// for VIEW-CHANGE/NEW-VIEW), so a stripped signature is rejected
    /// here and a forged one is rejected there.
    pub fn verify(&self, keychain: &MacKeychain<Peer>, me: Peer) -> bool {
        match self.payload.auth_kind() {
            AuthKind::MacVector => {
                let Some(Authenticator::Macs(auth)) = &self.auth else {
                    return false;
                };
                let Some(mac) = auth.for_peer(me) else {
                    return false;
                };
                keychain.verify(self.sender, &self.authenticated_bytes(), mac)
            }
            AuthKind::PayloadSignature => self.payload.carries_signature(),
        }
    }
}

// ============================================================================
// Payload
// ============================================================================

/// The payload of a protocol message. A closed set: dispatch is a total
/// `match`, and omitting a variant anywhere is a compile error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    /// Client → Primary: execute this operation.
    Request(Request),

    /// Primary → Backups: sequence this request in the current view.
    PrePrepare(PrePrepare),

    /// Backup → All: I accepted this pre-prepare.
    Prepare(Prepare),

    /// Replica → All: I hold a prepared certificate.
    Commit(Commit),

    /// Replica → Client: execution result plus the sender's HCV.
    Reply(Reply),

    /// Replica → All: state digest at a checkpoint sequence.
    Checkpoint(Checkpoint),

    /// Replica → All: signed evidence for moving to a new view.
    ViewChange(ViewChange),

    /// New Primary → All: the reconstructed log for the new view.
    NewView(NewView),
}

/// Wire tag values, part of the frame preamble.
pub mod tag {
    pub const REQUEST: u8 = 0x01;
    pub const PRE_PREPARE: u8 = 0x02;
    pub const PREPARE: u8 = 0x03;
    pub const COMMIT: u8 = 0x04;
    pub const REPLY: u8 = 0x05;
    pub const CHECKPOINT: u8 = 0x06;
    pub const VIEW_CHANGE: u8 = 0x07;
    pub const NEW_VIEW: u8 = 0x08;
}

impl Payload {
    /// Returns the view number associated with this message, if any.
    /// Requests are view-agnostic; everything else is view-scoped.
    pub fn view(&self) -> Option<ViewNumber> {
        match self {
            Payload::Request(_) => None,
            Payload::PrePrepare(m) => Some(m.view),
            Payload::Prepare(m) => Some(m.view),
            Payload::Commit(m) => Some(m.view),
            Payload::Reply(m) => Some(m.view),
            Payload::Checkpoint(_) => None,
            Payload::ViewChange(m) => Some(m.new_view),
            Payload::NewView(m) => Some(m.view),
        }
    }

    /// Returns the sequence number this message is about, if any.
    pub fn seq(&self) -> Option<SeqNumber> {
        match self {
            Payload::PrePrepare(m) => Some(m.seq),
            Payload::Prepare(m) => Some(m.seq),
            Payload::Commit(m) => Some(m.seq),
            Payload::Checkpoint(m) => Some(m.seq),
            Payload::Request(_)
            | Payload::Reply(_)
            | Payload::ViewChange(_)
            | Payload::NewView(_) => None,
        }
    }

    /// Returns a human-readable name for the message type.
    pub fn name(&self) -> &'static str {
        match self {
            Payload::Request(_) => "Request",
            Payload::PrePrepare(_) => "PrePrepare",
            Payload::Prepare(_) => "Prepare",
            Payload::Commit(_) => "Commit",
            Payload::Reply(_) => "Reply",
            Payload::Checkpoint(_) => "Checkpoint",
            Payload::ViewChange(_) => "ViewChange",
            Payload::NewView(_) => "NewView",
        }
    }

    /// Returns the wire tag byte.
    pub fn tag(&self) -> u8 {
        match self {
            Payload::Request(_) => tag::REQUEST,
            Payload::PrePrepare(_) => tag::PRE_PREPARE,
            Payload::Prepare(_) => tag::PREPARE,
            Payload::Commit(_) => tag::COMMIT,
            Payload::Reply(_) => tag::REPLY,
            Payload::Checkpoint(_) => tag::CHECKPOINT,
            Payload::ViewChange(_) => tag::VIEW_CHANGE,
            Payload::NewView(_) => tag::NEW_VIEW,
        }
    }

    /// How this message kind is authenticated. A total match: a new kind
    /// cannot be added without deciding its authentication.
    pub fn auth_kind(&self) -> AuthKind {
        match self {
            // Convincing any future recipient requires a signature.
            Payload::Request(_) | Payload::ViewChange(_) | Payload::NewView(_) => {
                AuthKind::PayloadSignature
            }
            // Per-hop MACs suffice for the agreement traffic.
            Payload::PrePrepare(_)
            | Payload::Prepare(_)
            | Payload::Commit(_)
            | Payload::Reply(_)
            | Payload::Checkpoint(_) => AuthKind::MacVector,
        }
    }

    /// Whether this payload's embedded signature field is populated.
    /// Always false for MAC-authenticated kinds, which have none.
    fn carries_signature(&self) -> bool {
        match self {
            Payload::Request(m) => m.signature.is_some(),
            Payload::ViewChange(m) => m.signature.is_some(),
            Payload::NewView(m) => m.signature.is_some(),
            Payload::PrePrepare(_)
            | Payload::Prepare(_)
            | Payload::Commit(_)
            | Payload::Reply(_)
            | Payload::Checkpoint(_) => false,
        }
    }
}

// ============================================================================
// Request
// ============================================================================

/// A client operation.
///
/// `timestamp` is a monotonic per-client counter, used for at-most-once
/// execution on the replica side and reply matching on the client side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub client_id: ClientId,
    pub timestamp: RequestTimestamp,
    pub operation: Vec<u8>,

    /// Client signature over [`Request::signed_bytes`].
    pub signature: Option<Signature>,
}

impl Request {
    pub fn new(client_id: ClientId, timestamp: RequestTimestamp, operation: Vec<u8>) -> Self {
        Self {
            client_id,
            timestamp,
            operation,
            signature: None,
        }
    }

    /// The canonical preimage for both the digest and the client
    /// signature. The signature itself is excluded so every replica
    /// derives the same digest.
    pub fn signed_bytes(&self) -> Vec<u8> {
        canonical_request_bytes(
            self.client_id.as_u64(),
            self.timestamp.as_u64(),
            &self.operation,
        )
    }

    /// The request digest carried in PRE-PREPARE / PREPARE / COMMIT.
    pub fn digest(&self) -> Hash {
        hash_bytes(&self.signed_bytes())
    }

    /// Signs the request with the client's key.
    pub fn sign(mut self, key: &SigningKey) -> Self {
        self.signature = Some(key.sign(&self.signed_bytes()));
        self
    }

    /// Verifies the client signature.
    pub fn verify(&self, key: &VerifyingKey) -> Result<(), CryptoError> {
        let sig = self.signature.as_ref().ok_or(CryptoError::BadSignature)?;
        key.verify(&self.signed_bytes(), sig)
    }
}

// ============================================================================
// Normal Operation Messages
// ============================================================================

/// Primary → Backups: assign `seq` to the piggybacked request.
///
/// `request` is `None` only for the null no-op slots a NEW-VIEW inserts
/// to fill gaps; a no-op's digest is [`Hash::ZERO`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrePrepare {
    pub view: ViewNumber,
    pub seq: SeqNumber,

    /// The view in which this request was first sequenced.
    ///
    /// Equal to `view` in normal operation. When a NEW-VIEW re-proposes a
    /// prepared request, `view` advances but `origin_view` keeps the
    /// original sequencing view — the hash chain extends over
    /// `origin_view`, so replicas that executed before the view change
    /// and replicas that execute after it derive identical chains.
    pub origin_view: ViewNumber,

    pub digest: Hash,

    /// The primary's HCV extrapolated as if this request executes next.
    /// Informational: backups recompute their own chain at execution.
    pub hcv_primary: Hash,

    /// The piggybacked request.
    pub request: Option<Request>,
}

impl PrePrepare {
    pub fn new(
        view: ViewNumber,
        seq: SeqNumber,
        hcv_primary: Hash,
        request: Request,
    ) -> Self {
        let digest = request.digest();
        Self {
            view,
            seq,
            origin_view: view,
            digest,
            hcv_primary,
            request: Some(request),
        }
    }

    /// Re-proposes a previously prepared request in a later view,
    /// preserving its original sequencing view for the hash chain.
    pub fn repropose(self, view: ViewNumber, hcv_primary: Hash) -> Self {
        Self {
            view,
            hcv_primary,
            ..self
        }
    }

    /// Creates a null no-op pre-prepare, used to fill sequence gaps
    /// during view change.
    pub fn noop(view: ViewNumber, seq: SeqNumber, hcv_primary: Hash) -> Self {
        Self {
            view,
            seq,
            origin_view: view,
            digest: Hash::ZERO,
            hcv_primary,
            request: None,
        }
    }

    pub fn is_noop(&self) -> bool {
        self.request.is_none()
    }

    /// Checks the internal digest/request consistency rule.
    pub fn digest_matches_request(&self) -> bool {
        match &self.request {
            Some(request) => request.digest() == self.digest,
            None => self.digest.is_zero(),
        }
    }
}

/// Backup → All: I accepted the pre-prepare for `(view, seq, digest)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prepare {
    pub view: ViewNumber,
    pub seq: SeqNumber,
    pub digest: Hash,

    /// The sender's HCV at its highest executed sequence.
    pub hcv_sender: Hash,

    pub sender: ReplicaId,
}

impl Prepare {
    pub fn new(
        view: ViewNumber,
        seq: SeqNumber,
        digest: Hash,
        hcv_sender: Hash,
        sender: ReplicaId,
    ) -> Self {
        Self {
            view,
            seq,
            digest,
            hcv_sender,
            sender,
        }
    }
}

/// Replica → All: I hold a prepared certificate for `(view, seq, digest)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub view: ViewNumber,
    pub seq: SeqNumber,
    pub digest: Hash,

    /// The sender's HCV at its highest executed sequence.
    pub hcv_sender: Hash,

    pub sender: ReplicaId,
}

impl Commit {
    pub fn new(
        view: ViewNumber,
        seq: SeqNumber,
        digest: Hash,
        hcv_sender: Hash,
        sender: ReplicaId,
    ) -> Self {
        Self {
            view,
            seq,
            digest,
            hcv_sender,
            sender,
        }
    }
}

/// Replica → Client: the outcome of an executed request.
///
/// The client accepts once `2f + 1` replies agree on
/// `(view, timestamp, result, hcv_sender)`; agreement on the result but
/// divergence in `hcv_sender` is a fork-* alarm.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub view: ViewNumber,
    pub timestamp: RequestTimestamp,
    pub client_id: ClientId,
    pub sender: ReplicaId,
    pub result: Vec<u8>,

    /// The sender's HCV after executing this request.
    pub hcv_sender: Hash,
}

// ============================================================================
// Checkpoint
// ============================================================================

/// Replica → All: application state digest at checkpoint sequence `seq`.
///
/// `2f + 1` matching checkpoints make `seq` stable, advancing the
/// watermarks and letting the log truncate below it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub seq: SeqNumber,
    pub state_digest: Hash,

    /// The sender's HCV at `seq`.
    pub hcv: Hash,

    pub sender: ReplicaId,
}

// ============================================================================
// View Change Messages
// ============================================================================

/// A prepared certificate carried as view-change evidence: the
/// PRE-PREPARE plus `2f` matching PREPAREs from distinct replicas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreparedProof {
    pub pre_prepare: PrePrepare,
    pub prepares: Vec<Prepare>,
}

impl PreparedProof {
    pub fn seq(&self) -> SeqNumber {
        self.pre_prepare.seq
    }

    pub fn view(&self) -> ViewNumber {
        self.pre_prepare.view
    }

    /// Structural validity: prepares match the pre-prepare on
    /// `(view, seq, digest)`, come from distinct senders, and number at
    /// least `quorum` of them.
    pub fn is_valid(&self, quorum: usize) -> bool {
        let pp = &self.pre_prepare;
        if !pp.digest_matches_request() {
            return false;
        }
        let mut senders = std::collections::HashSet::new();
        for prepare in &self.prepares {
            if prepare.view != pp.view || prepare.seq != pp.seq || prepare.digest != pp.digest {
                return false;
            }
            senders.insert(prepare.sender);
        }
        senders.len() >= quorum
    }
}

/// Replica → All: signed evidence for moving to `new_view`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewChange {
    pub new_view: ViewNumber,

    /// The sender's last stable checkpoint sequence.
    pub last_stable: SeqNumber,

    /// `2f + 1` matching CHECKPOINTs proving `last_stable` stable.
    /// Empty when `last_stable` is zero (nothing checkpointed yet).
    pub checkpoint_proof: Vec<Checkpoint>,

    /// Prepared certificates the sender holds above `last_stable`.
    pub prepared: Vec<PreparedProof>,

    /// The sender's current HCV.
    pub hcv_latest: Hash,

    pub sender: ReplicaId,

    /// Ed25519 signature over the canonical serialization of every other
    /// field; payload-level so the message stays convincing inside a
    /// NEW-VIEW.
    pub signature: Option<Signature>,
}

impl ViewChange {
    fn signable_bytes(&self) -> Vec<u8> {
        let mut unsigned = self.clone();
        unsigned.signature = None;
        postcard::to_allocvec(&unsigned)
            .expect("message serialization should never fail (all fields are serializable)")
    }

    pub fn sign(mut self, key: &SigningKey) -> Self {
        self.signature = None;
        let bytes = self.signable_bytes();
        self.signature = Some(key.sign(&bytes));
        self
    }

    pub fn verify(&self, key: &VerifyingKey) -> Result<(), CryptoError> {
        let sig = self.signature.as_ref().ok_or(CryptoError::BadSignature)?;
        key.verify(&self.signable_bytes(), sig)
    }
}

/// New Primary → All: the union of `2f + 1` VIEW-CHANGEs plus the
/// pre-prepares (real or no-op) reconstructing every sequence in range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewView {
    pub view: ViewNumber,
    pub view_changes: Vec<ViewChange>,
    pub pre_prepares: Vec<PrePrepare>,

    /// New primary's signature, payload-level like [`ViewChange`]'s.
    pub signature: Option<Signature>,
}

impl NewView {
    fn signable_bytes(&self) -> Vec<u8> {
        let mut unsigned = self.clone();
        unsigned.signature = None;
        postcard::to_allocvec(&unsigned)
            .expect("message serialization should never fail (all fields are serializable)")
    }

    pub fn sign(mut self, key: &SigningKey) -> Self {
        self.signature = None;
        let bytes = self.signable_bytes();
        self.signature = Some(key.sign(&bytes));
        self
    }

    pub fn verify(&self, key: &VerifyingKey) -> Result<(), CryptoError> {
        let sig = self.signature.as_ref().ok_or(CryptoError::BadSignature)?;
        key.verify(&self.signable_bytes(), sig)
    }
}

// ============================================================================
// Wire
// ============================================================================

impl Message {
    /// Encodes this message as a wire frame.
    ///
    /// The frame preamble carries the tag, the payload's view (0 for
    /// view-agnostic messages), and the sender byte — a replica id, or
    /// `0xFF` for clients whose full id lives in the payload.
    pub fn to_wire(&self) -> Result<Vec<u8>, pyrite_wire::WireError> {
        let sender_byte = match self.sender {
            Peer::Replica(id) => id.as_u8(),
            Peer::Client(_) => 0xFF,
        };
        let view = self.payload.view().unwrap_or(ViewNumber::ZERO).as_u64();
        let auth_bytes = match &self.auth {
            Some(auth) => postcard::to_allocvec(auth)
                .map_err(|e| pyrite_wire::WireError::Payload(e.to_string()))?,
            None => Vec::new(),
        };
        pyrite_wire::encode_frame(self.payload.tag(), view, sender_byte, &self.payload, &auth_bytes)
    }

    /// Decodes a message from wire bytes, checking preamble consistency
    /// against the payload.
    pub fn from_wire(bytes: &[u8]) -> Result<Self, pyrite_wire::WireError> {
        let frame = pyrite_wire::decode_frame(bytes)?;
        let payload: Payload = frame.decode_payload()?;

        if frame.tag != payload.tag() {
            return Err(pyrite_wire::WireError::BadTag { tag: frame.tag });
        }
        let expected_view = payload.view().unwrap_or(ViewNumber::ZERO).as_u64();
        if frame.view != expected_view {
            return Err(pyrite_wire::WireError::Payload(format!(
                "preamble view {} contradicts payload view {expected_view}",
                frame.view
            )));
        }

        let sender = if frame.sender == 0xFF {
            match &payload {
                Payload::Request(r) => Peer::Client(r.client_id),
                _ => {
                    return Err(pyrite_wire::WireError::Payload(
                        "client sender byte on a non-request payload".into(),
                    ));
                }
            }
        } else {
            Peer::Replica(ReplicaId::new(frame.sender))
        };

        let auth = if frame.auth.is_empty() {
            None
        } else {
            Some(
                postcard::from_bytes(&frame.auth)
                    .map_err(|e| pyrite_wire::WireError::Payload(e.to_string()))?,
            )
        };

        Ok(Self {
            sender,
            payload,
            auth,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
