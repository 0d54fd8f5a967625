//! Replica state structure and event dispatch.
//!
//! [`ReplicaState`] owns everything a replica knows: identity, keys, view
//! state, the message log, the client table, checkpoint tracking, and the
//! misbehavior evidence it has collected. It is cloneable so simulation
//! tests can snapshot and fork histories.

use std::collections::{BTreeMap, HashMap};

use pyrite_crypto::{MacKeychain, SigningKey, VerifyingKey};
use pyrite_types::{ClientId, Hash, ReplicaId, RequestTimestamp, SeqNumber, ViewNumber};
use serde::{Deserialize, Serialize};

use crate::config::ClusterConfig;
use crate::contracts::StateMachine;
use crate::hcv::{self, MisbehaviorKind, MisbehaviorProof};
use crate::instrumentation::METRICS;
use crate::log::MessageLog;
use crate::message::{Checkpoint, Message, Payload, Peer, Reply, Request, ViewChange};

use super::{ReplicaEvent, ReplicaOutput, TimeoutKind, TimerToken};

// ============================================================================
// Replica Status
// ============================================================================

/// The replica's protocol mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaStatus {
    /// Normal operation in the current view.
    Active,

    /// A view change is in progress; agreement traffic for the old view
    /// is no longer accepted.
    ViewChanging,

    /// Restarted from persisted state; catching up to the stable
    /// checkpoint before participating again.
    Recovering,

    /// A fatal internal invariant was violated. The replica refuses all
    /// further events rather than risk contradicting its own hash chain.
    Halted,
}

impl ReplicaStatus {
    /// True when agreement messages for the current view are processed.
    pub fn can_participate(self) -> bool {
        matches!(self, ReplicaStatus::Active)
    }

    /// True when view-change traffic is processed.
    pub fn can_view_change(self) -> bool {
        matches!(self, ReplicaStatus::Active | ReplicaStatus::ViewChanging)
    }
}

// ============================================================================
// Keys
// ============================================================================

/// The replica's cryptographic material, read-only after initialization.
#[derive(Clone)]
pub struct ReplicaKeys {
    /// Our Ed25519 key, for VIEW-CHANGE and NEW-VIEW.
    pub signing: SigningKey,

    /// Every replica's public key.
    pub replica_keys: BTreeMap<ReplicaId, VerifyingKey>,

    /// Known clients' public keys, for REQUEST validation.
    pub client_keys: BTreeMap<ClientId, VerifyingKey>,

    /// Pairwise MAC keys with replicas and clients.
    pub keychain: MacKeychain<Peer>,
}

impl std::fmt::Debug for ReplicaKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaKeys")
            .field("replicas", &self.replica_keys.len())
            .field("clients", &self.client_keys.len())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Client Table
// ============================================================================

/// Per-client execution record, making requests at-most-once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientEntry {
    /// Greatest timestamp executed for this client.
    pub last_timestamp: RequestTimestamp,

    /// The reply sent for that timestamp, replayed on duplicates.
    pub last_reply: Option<Reply>,
}

// ============================================================================
// Replica State
// ============================================================================

/// The full state of one BFT2f replica.
///
/// All transitions are `fn(self, event) -> (Self, ReplicaOutput)`; the
/// runtime owns exactly one value of this type per replica and threads it
/// through the event loop.
#[derive(Debug, Clone)]
pub struct ReplicaState<S> {
    // ========================================================================
    // Identity
    // ========================================================================
    pub(crate) replica_id: ReplicaId,
    pub(crate) config: ClusterConfig,
    pub(crate) keys: ReplicaKeys,

    // ========================================================================
    // View State
    // ========================================================================
    pub(crate) view: ViewNumber,
    pub(crate) status: ReplicaStatus,

    // ========================================================================
    // Log State
    // ========================================================================
    pub(crate) log: MessageLog,

    /// Highest sequence this replica assigned as primary.
    pub(crate) last_assigned: SeqNumber,

    /// Primary-side chain extrapolation over assigned-but-unexecuted
    /// requests; becomes `hcv_primary` in outgoing pre-prepares.
    pub(crate) speculative_hcv: Hash,

    /// Highest executed sequence.
    pub(crate) last_executed: SeqNumber,

    /// The chain value after `last_executed`.
    pub(crate) hcv: Hash,

    // ========================================================================
    // Application
    // ========================================================================
    pub(crate) state_machine: S,

    // ========================================================================
    // Client State
    // ========================================================================
    pub(crate) client_table: HashMap<ClientId, ClientEntry>,

    /// Requests assigned by this primary but not yet executed; prevents
    /// double-assignment of an in-flight duplicate.
    pub(crate) in_flight: HashMap<ClientId, RequestTimestamp>,

    /// Requests this backup forwarded to the primary, awaiting the
    /// matching pre-prepare under a timer.
    pub(crate) pending_forwards: HashMap<ClientId, Request>,

    // ========================================================================
    // Checkpoints
    // ========================================================================
    /// Collected CHECKPOINT messages by sequence and sender.
    pub(crate) checkpoints: BTreeMap<SeqNumber, BTreeMap<ReplicaId, Checkpoint>>,

    pub(crate) last_stable: SeqNumber,

    /// The `2f + 1` matching checkpoints proving `last_stable`.
    pub(crate) stable_proof: Vec<Checkpoint>,

    // ========================================================================
    // View Change Tracking
    // ========================================================================
    /// Valid VIEW-CHANGE messages by target view and sender.
    pub(crate) view_change_votes: BTreeMap<ViewNumber, BTreeMap<ReplicaId, ViewChange>>,

    /// Consecutive failed view changes; drives timeout backoff.
    pub(crate) view_change_attempts: u32,

    // ========================================================================
    // Misbehavior Evidence
    // ========================================================================
    /// HCVs observed per (message kind, peer, view, seq); a second,
    /// different value is a divergence proof.
    pub(crate) observed_hcvs: HashMap<(u8, Peer, ViewNumber, SeqNumber), Hash>,

    /// All proofs collected so far.
    pub(crate) proofs: Vec<MisbehaviorProof>,

    /// Why the replica halted, if it did.
    pub(crate) halt_reason: Option<String>,
}

impl<S: StateMachine> ReplicaState<S> {
    /// Creates a replica in the initial view with an empty log.
    pub fn new(
        replica_id: ReplicaId,
        config: ClusterConfig,
        keys: ReplicaKeys,
        state_machine: S,
    ) -> Self {
        assert!(config.is_member(replica_id), "replica not in config");
        let genesis = hcv::genesis();
        Self {
            replica_id,
            log: MessageLog::new(config.watermark_window),
            config,
            keys,
            view: ViewNumber::ZERO,
            status: ReplicaStatus::Active,
            last_assigned: SeqNumber::ZERO,
            speculative_hcv: genesis,
            last_executed: SeqNumber::ZERO,
            hcv: genesis,
            state_machine,
            client_table: HashMap::new(),
            in_flight: HashMap::new(),
            pending_forwards: HashMap::new(),
            checkpoints: BTreeMap::new(),
            last_stable: SeqNumber::ZERO,
            stable_proof: Vec::new(),
            view_change_votes: BTreeMap::new(),
            view_change_attempts: 0,
            observed_hcvs: HashMap::new(),
            proofs: Vec::new(),
            halt_reason: None,
        }
    }

    /// Restores a replica from its persisted superblock record.
    ///
    /// The replica re-enters in `Recovering` status: it will not
    /// participate in agreement until it observes a stable checkpoint at
    /// or past its recorded one.
    pub fn recover(
        replica_id: ReplicaId,
        config: ClusterConfig,
        keys: ReplicaKeys,
        state_machine: S,
        record: &crate::superblock::SuperblockRecord,
    ) -> Self {
        let mut state = Self::new(replica_id, config, keys, state_machine);
        state.view = record.view;
        state.last_executed = record.last_executed;
        state.hcv = record.hcv;
        state.speculative_hcv = record.hcv;
        state.last_stable = record.last_stable;
        state.stable_proof = record.stable_proof.clone();
        state.log.truncate_below(record.last_stable);
        state.status = ReplicaStatus::Recovering;
        state
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn replica_id(&self) -> ReplicaId {
        self.replica_id
    }

    pub fn view(&self) -> ViewNumber {
        self.view
    }

    pub fn status(&self) -> ReplicaStatus {
        self.status
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// The primary of the current view.
    pub fn primary(&self) -> ReplicaId {
        self.config.primary_for(self.view)
    }

    pub fn is_primary(&self) -> bool {
        self.primary() == self.replica_id
    }

    pub fn last_executed(&self) -> SeqNumber {
        self.last_executed
    }

    /// The replica's current hash-chain version.
    pub fn hcv(&self) -> Hash {
        self.hcv
    }

    pub fn last_stable(&self) -> SeqNumber {
        self.last_stable
    }

    /// The application state machine (read-only).
    pub fn state_machine(&self) -> &S {
        &self.state_machine
    }

    /// Misbehavior proofs retained so far.
    pub fn proofs(&self) -> &[MisbehaviorProof] {
        &self.proofs
    }

    pub fn halt_reason(&self) -> Option<&str> {
        self.halt_reason.as_deref()
    }

    // ========================================================================
    // Event Dispatch
    // ========================================================================

    /// Processes one event. The single entry point of the state machine.
    pub fn on_event(self, event: ReplicaEvent) -> (Self, ReplicaOutput) {
        if self.status == ReplicaStatus::Halted {
            return (self, ReplicaOutput::empty());
        }

        match event {
            ReplicaEvent::Message(msg) => self.on_message(msg),
            ReplicaEvent::Timeout(token) => self.on_timeout(token),
        }
    }

    /// Dispatches a message by payload kind. Total match: adding a
    /// message variant without a handler is a compile error.
    fn on_message(self, msg: Message) -> (Self, ReplicaOutput) {
        METRICS.increment_messages_received();

        // Requests come from clients; everything else must come from a
        // replica that is actually a cluster member.
        match msg.payload {
            Payload::Request(request) => self.on_request(msg.sender, request),
            Payload::PrePrepare(pp) => match self.replica_sender(msg.sender) {
                Some(from) => self.on_pre_prepare(from, pp),
                None => self.drop_malformed("PrePrepare from non-member"),
            },
            Payload::Prepare(prepare) => match self.replica_sender(msg.sender) {
                Some(from) => self.on_prepare(from, prepare),
                None => self.drop_malformed("Prepare from non-member"),
            },
            Payload::Commit(commit) => match self.replica_sender(msg.sender) {
                Some(from) => self.on_commit(from, commit),
                None => self.drop_malformed("Commit from non-member"),
            },
            Payload::Checkpoint(cp) => match self.replica_sender(msg.sender) {
                Some(from) => self.on_checkpoint(from, cp),
                None => self.drop_malformed("Checkpoint from non-member"),
            },
            Payload::ViewChange(vc) => match self.replica_sender(msg.sender) {
                Some(from) => self.on_view_change(from, vc),
                None => self.drop_malformed("ViewChange from non-member"),
            },
            Payload::NewView(nv) => match self.replica_sender(msg.sender) {
                Some(from) => self.on_new_view(from, nv),
                None => self.drop_malformed("NewView from non-member"),
            },
            // Replicas do not consume replies.
            Payload::Reply(_) => (self, ReplicaOutput::empty()),
        }
    }

    fn on_timeout(self, token: TimerToken) -> (Self, ReplicaOutput) {
        // Stale fire from an earlier view: the cancellation raced the
        // fire, or the view moved on. Either way it is meaningless now.
        if token.view != self.view {
            return (self, ReplicaOutput::empty());
        }

        match token.kind {
            TimeoutKind::Request(client) => self.on_request_timeout(client),
            TimeoutKind::ViewChange => self.on_view_change_timeout(),
        }
    }

    // ========================================================================
    // Shared Helpers
    // ========================================================================

    /// Extracts a member replica id from a peer, or `None`.
    fn replica_sender(&self, sender: Peer) -> Option<ReplicaId> {
        match sender {
            Peer::Replica(id) if self.config.is_member(id) => Some(id),
            _ => None,
        }
    }

    /// Drops a message per error kind 1 (malformed): silently, counted.
    pub(crate) fn drop_malformed(self, reason: &str) -> (Self, ReplicaOutput) {
        tracing::debug!(replica = %self.replica_id, reason, "dropping malformed message");
        METRICS.increment_dropped_malformed();
        (self, ReplicaOutput::empty())
    }

    /// Drops a message per error kind 2 (out of range): silently, counted.
    pub(crate) fn drop_out_of_range(self, seq: SeqNumber) -> (Self, ReplicaOutput) {
        tracing::debug!(
            replica = %self.replica_id,
            seq = %seq,
            low = %self.log.low_watermark(),
            high = %self.log.high_watermark(),
            "dropping message outside watermarks"
        );
        METRICS.increment_dropped_out_of_range();
        (self, ReplicaOutput::empty())
    }

    /// Records an HCV observation from a peer. Returns a proof if the
    /// peer previously published a *different* HCV for the same
    /// (message kind, view, seq) — evidence it is showing different
    /// histories to different parties.
    pub(crate) fn observe_hcv(
        &mut self,
        msg_kind: u8,
        peer: Peer,
        view: ViewNumber,
        seq: SeqNumber,
        observed: Hash,
    ) -> Option<MisbehaviorProof> {
        let key = (msg_kind, peer, view, seq);
        let Some(prior) = self.observed_hcvs.get(&key).copied() else {
            self.observed_hcvs.insert(key, observed);
            return None;
        };
        if prior == observed {
            return None;
        }

        tracing::warn!(
            replica = %self.replica_id,
            peer = %peer,
            view = %view,
            seq = %seq,
            "conflicting HCVs observed from one peer"
        );
        METRICS.increment_hcv_divergences();
        let proof = MisbehaviorProof {
            kind: MisbehaviorKind::DivergentHcv,
            accused: peer,
            view,
            seq,
            first: prior,
            second: observed,
        };
        self.proofs.push(proof.clone());
        Some(proof)
    }

    /// Records a digest-equivocation proof against a peer.
    pub(crate) fn record_equivocation(
        &mut self,
        accused: Peer,
        view: ViewNumber,
        seq: SeqNumber,
        first: Hash,
        second: Hash,
    ) -> MisbehaviorProof {
        tracing::warn!(
            replica = %self.replica_id,
            accused = %accused,
            view = %view,
            seq = %seq,
            first = %first,
            second = %second,
            "equivocation detected"
        );
        METRICS.increment_equivocations();
        let proof = MisbehaviorProof {
            kind: MisbehaviorKind::ConflictingDigest,
            accused,
            view,
            seq,
            first,
            second,
        };
        self.proofs.push(proof.clone());
        proof
    }

    /// Transitions to `Halted` on a fatal internal invariant violation
    /// (error kind 6). The replica stops rather than emit a
    /// contradiction, which protects its hash chain.
    pub(crate) fn halt(mut self, reason: String) -> (Self, ReplicaOutput) {
        tracing::error!(
            replica = %self.replica_id,
            view = %self.view,
            reason,
            "fatal invariant violation; halting replica"
        );
        self.status = ReplicaStatus::Halted;
        self.halt_reason = Some(reason);
        (self, ReplicaOutput::empty())
    }
}
