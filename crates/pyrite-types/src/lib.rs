//! # pyrite-types: Core types for `Pyrite`
//!
//! This crate contains the shared scalar types used across the Pyrite
//! BFT2f replication system:
//! - Protocol identities ([`ReplicaId`], [`ClientId`])
//! - Protocol counters ([`ViewNumber`], [`SeqNumber`], [`RequestTimestamp`])
//! - Cryptographic types ([`struct@Hash`])
//! - Quorum arithmetic for `N = 3f + 1` clusters ([`quorum_prepare`],
//!   [`quorum_commit`], [`quorum_weak`], [`max_faulty`])
//!
//! All identifier types are cheap `Copy` newtypes over fixed-width
//! integers. Wire widths are pinned by `pyrite-wire`, not here.

use std::fmt::{Debug, Display};

use serde::{Deserialize, Serialize};

// ============================================================================
// Replica Identity
// ============================================================================

/// Stable identifier of a replica, in `[0, N)`.
///
/// The primary of view `v` is the replica with id `v mod N`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct ReplicaId(u8);

impl ReplicaId {
    pub fn new(id: u8) -> Self {
        Self(id)
    }

    pub fn as_u8(self) -> u8 {
        self.0
    }

    /// Returns this replica's index into per-replica vectors.
    pub fn as_usize(self) -> usize {
        usize::from(self.0)
    }
}

impl Display for ReplicaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "R{}", self.0)
    }
}

impl From<u8> for ReplicaId {
    fn from(value: u8) -> Self {
        Self(value)
    }
}

impl From<ReplicaId> for u8 {
    fn from(id: ReplicaId) -> Self {
        id.0
    }
}

// ============================================================================
// Client Identity
// ============================================================================

/// Unique identifier for a client of the replicated service.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct ClientId(u64);

impl ClientId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "client#{}", self.0)
    }
}

impl From<u64> for ClientId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

// ============================================================================
// View Number
// ============================================================================

/// Monotonically increasing view (epoch) number.
///
/// Each view has a fixed primary (`view mod N`). Views only ever advance;
/// a correct replica never observes its own view number decrease.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct ViewNumber(u64);

impl ViewNumber {
    /// The initial view, with primary `R0`.
    pub const ZERO: Self = Self(0);

    pub fn new(view: u64) -> Self {
        Self(view)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the next view.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the primary replica for this view in a cluster of `n` replicas.
    pub fn primary_for(self, cluster_size: usize) -> ReplicaId {
        debug_assert!(cluster_size > 0 && cluster_size <= usize::from(u8::MAX));
        ReplicaId::new((self.0 % cluster_size as u64) as u8)
    }
}

impl Display for ViewNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl From<u64> for ViewNumber {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

// ============================================================================
// Sequence Number
// ============================================================================

/// Position of an operation in the totally ordered log.
///
/// Sequence numbers are assigned by the primary starting at 1; sequence 0
/// is reserved for "nothing executed yet" and the hash-chain genesis.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct SeqNumber(u64);

impl SeqNumber {
    /// The sequence number before the first assigned operation.
    pub const ZERO: Self = Self(0);

    pub fn new(seq: u64) -> Self {
        Self(seq)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the next sequence number.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the previous sequence number, saturating at zero.
    pub fn prev(self) -> Self {
        Self(self.0.saturating_sub(1))
    }
}

impl Display for SeqNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "n{}", self.0)
    }
}

impl From<u64> for SeqNumber {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

// ============================================================================
// Request Timestamp
// ============================================================================

/// Monotonic per-client request counter.
///
/// Used both for at-most-once execution on the replica side and for reply
/// matching on the client side. Not wall-clock time.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct RequestTimestamp(u64);

impl RequestTimestamp {
    pub const ZERO: Self = Self(0);

    pub fn new(ts: u64) -> Self {
        Self(ts)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl Display for RequestTimestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "t{}", self.0)
    }
}

impl From<u64> for RequestTimestamp {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

// ============================================================================
// Hash
// ============================================================================

/// A 256-bit collision-resistant hash.
///
/// Used for request digests, hash-chain versions, and checkpoint state
/// digests. The concrete function (BLAKE3) lives in `pyrite-crypto`; this
/// is just the value type.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    /// The all-zero hash. Never produced by the hash function; used as a
    /// sentinel for "no digest" (e.g. null no-op slots).
    pub const ZERO: Self = Self([0u8; 32]);

    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl Debug for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash({self})")
    }
}

impl Display for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short form: first 8 hex chars, enough to tell values apart in logs.
        for byte in &self.0[..4] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl From<[u8; 32]> for Hash {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

// ============================================================================
// Quorum Arithmetic
// ============================================================================
//
// For a cluster of N = 3f + 1 replicas:
//   - f          faults tolerated with full linearizability
//   - 2f         matching Prepares (plus the PrePrepare) form a prepared
//                certificate
//   - 2f + 1     matching Commits form a committed certificate; matching
//                Replies let a client accept a result
//   - f + 1      the weak quorum: at least one correct replica

/// Returns `f`, the number of Byzantine faults tolerated by a cluster of
/// `cluster_size` replicas.
///
/// # Panics
///
/// Panics if `cluster_size < 4` — the protocol requires `N >= 3f + 1` with
/// `f >= 1`.
pub fn max_faulty(cluster_size: usize) -> usize {
    assert!(
        cluster_size >= 4,
        "BFT2f requires at least 4 replicas, got {cluster_size}"
    );
    (cluster_size - 1) / 3
}

/// Returns `2f`: the number of matching Prepares (from distinct replicas,
/// excluding the PrePrepare) needed for a prepared certificate.
pub fn quorum_prepare(cluster_size: usize) -> usize {
    2 * max_faulty(cluster_size)
}

/// Returns `2f + 1`: the size of a committed certificate and of a client
/// reply quorum.
pub fn quorum_commit(cluster_size: usize) -> usize {
    2 * max_faulty(cluster_size) + 1
}

/// Returns `f + 1`: the weak quorum guaranteeing at least one correct
/// member. Used for the view-change catch-up rule.
pub fn quorum_weak(cluster_size: usize) -> usize {
    max_faulty(cluster_size) + 1
}

// ============================================================================
// Tests
// ============================================================================
