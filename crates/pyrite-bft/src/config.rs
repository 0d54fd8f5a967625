//! Cluster configuration.
//!
//! A [`ClusterConfig`] is an explicit value handed to every replica and
//! client at construction; there is no global or module-level state, and
//! several replicas with distinct configs can coexist in one process.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use pyrite_types::{ReplicaId, ViewNumber, max_faulty, quorum_commit, quorum_prepare, quorum_weak};

/// Static configuration of a BFT2f cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Member replica ids, in id order.
    replicas: Vec<ReplicaId>,

    /// Width of the sequence window a replica accepts above its low
    /// watermark. Bounds in-flight work and buffering.
    pub watermark_window: u64,

    /// Checkpoint interval `K`: a CHECKPOINT message is emitted every `K`
    /// executed sequence numbers.
    pub checkpoint_interval: u64,

    /// How long a backup waits for the primary to pre-prepare a forwarded
    /// request before suspecting the primary.
    pub request_timeout: Duration,

    /// Base view-change timeout; doubles per consecutive failed view
    /// change (see [`ClusterConfig::view_change_timeout_for`]).
    pub view_change_timeout: Duration,
}

/// Cap on view-change backoff doublings (64x base).
const VIEW_CHANGE_BACKOFF_CAP: u32 = 6;

impl ClusterConfig {
    /// Creates a configuration with default tuning for the given members.
    ///
    /// # Panics
    ///
    /// Panics if fewer than 4 replicas are given; BFT2f requires
    /// `N >= 3f + 1` with `f >= 1`.
    pub fn new(replicas: Vec<ReplicaId>) -> Self {
        assert!(
            replicas.len() >= 4,
            "BFT2f requires at least 4 replicas, got {}",
            replicas.len()
        );
        Self {
            replicas,
            watermark_window: 256,
            checkpoint_interval: 128,
            request_timeout: Duration::from_millis(500),
            view_change_timeout: Duration::from_secs(2),
        }
    }

    /// Number of replicas `N`.
    pub fn cluster_size(&self) -> usize {
        self.replicas.len()
    }

    /// Member replica ids.
    pub fn replicas(&self) -> &[ReplicaId] {
        &self.replicas
    }

    pub fn is_member(&self, id: ReplicaId) -> bool {
        self.replicas.contains(&id)
    }

    /// `f`: the number of Byzantine replicas tolerated with full safety.
    pub fn max_faulty(&self) -> usize {
        max_faulty(self.cluster_size())
    }

    /// `2f`: matching PREPAREs needed (besides the PRE-PREPARE) for a
    /// prepared certificate.
    pub fn quorum_prepare(&self) -> usize {
        quorum_prepare(self.cluster_size())
    }

    /// `2f + 1`: matching COMMITs for a committed certificate, matching
    /// CHECKPOINTs for stability, matching REPLIEs for client acceptance.
    pub fn quorum_commit(&self) -> usize {
        quorum_commit(self.cluster_size())
    }

    /// `f + 1`: the weak quorum used by the view-change catch-up rule.
    pub fn quorum_weak(&self) -> usize {
        quorum_weak(self.cluster_size())
    }

    /// The primary of `view`: replica `view mod N`.
    pub fn primary_for(&self, view: ViewNumber) -> ReplicaId {
        self.replicas[(view.as_u64() % self.cluster_size() as u64) as usize]
    }

    /// View-change timeout for the `attempt`-th consecutive view change:
    /// geometric backoff, base 2, capped at 64x the configured base.
    pub fn view_change_timeout_for(&self, attempt: u32) -> Duration {
        let shift = attempt.min(VIEW_CHANGE_BACKOFF_CAP);
        self.view_change_timeout * (1u32 << shift)
    }
}
