//! Production instrumentation for the BFT2f protocol.
//!
//! Counters cover every drop class of the error taxonomy (malformed,
//! out-of-range, equivocation, timeout escalation) plus message traffic by
//! type; gauges track the replica's position in the protocol. All metrics
//! are lock-free atomics so the hot path pays a handful of relaxed
//! increments and nothing else.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics instance for the protocol core.
pub static METRICS: Metrics = Metrics::new();

/// Protocol metrics.
///
/// All fields use atomic operations for thread-safety without locks.
#[derive(Debug)]
pub struct Metrics {
    // === Drop Counters (error taxonomy) ===
    /// Messages dropped: decode or authentication failure.
    dropped_malformed: AtomicU64,
    /// Messages dropped: sequence outside watermarks or view not accepted.
    dropped_out_of_range: AtomicU64,
    /// Messages dropped: stale or mismatched view.
    dropped_wrong_view: AtomicU64,
    /// Prepares whose digest contradicted the accepted pre-prepare.
    mismatched_prepares: AtomicU64,

    // === Byzantine Evidence ===
    /// Equivocation proofs retained.
    equivocations_detected: AtomicU64,
    /// Conflicting HCVs observed from one peer at the same (view, seq).
    hcv_divergences_observed: AtomicU64,

    // === Throughput Counters ===
    /// Total messages received (pre-validation).
    messages_received: AtomicU64,
    /// Messages sent, by type.
    sent_pre_prepare: AtomicU64,
    sent_prepare: AtomicU64,
    sent_commit: AtomicU64,
    sent_reply: AtomicU64,
    sent_checkpoint: AtomicU64,
    sent_view_change: AtomicU64,
    sent_new_view: AtomicU64,
    /// Operations executed against the application state machine.
    operations_executed: AtomicU64,
    /// Duplicate client requests answered from the client table.
    duplicate_requests_replayed: AtomicU64,

    // === Protocol Progress ===
    /// View changes started (any trigger).
    view_changes_started: AtomicU64,
    /// View changes completed (NEW-VIEW accepted).
    view_changes_completed: AtomicU64,
    /// Checkpoints that became stable.
    checkpoints_stable: AtomicU64,

    // === Gauges ===
    view_number: AtomicU64,
    last_executed_seq: AtomicU64,
    low_watermark: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            dropped_malformed: AtomicU64::new(0),
            dropped_out_of_range: AtomicU64::new(0),
            dropped_wrong_view: AtomicU64::new(0),
            mismatched_prepares: AtomicU64::new(0),
            equivocations_detected: AtomicU64::new(0),
            hcv_divergences_observed: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            sent_pre_prepare: AtomicU64::new(0),
            sent_prepare: AtomicU64::new(0),
            sent_commit: AtomicU64::new(0),
            sent_reply: AtomicU64::new(0),
            sent_checkpoint: AtomicU64::new(0),
            sent_view_change: AtomicU64::new(0),
            sent_new_view: AtomicU64::new(0),
            operations_executed: AtomicU64::new(0),
            duplicate_requests_replayed: AtomicU64::new(0),
            view_changes_started: AtomicU64::new(0),
            view_changes_completed: AtomicU64::new(0),
            checkpoints_stable: AtomicU64::new(0),
            view_number: AtomicU64::new(0),
            last_executed_seq: AtomicU64::new(0),
            low_watermark: AtomicU64::new(0),
        }
    }

    // === Counter increments ===

    pub fn increment_dropped_malformed(&self) {
        self.dropped_malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_dropped_out_of_range(&self) {
        self.dropped_out_of_range.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_dropped_wrong_view(&self) {
        self.dropped_wrong_view.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_mismatched_prepares(&self) {
        self.mismatched_prepares.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_equivocations(&self) {
        self.equivocations_detected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_hcv_divergences(&self) {
        self.hcv_divergences_observed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_messages_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an outgoing message by payload name.
    pub fn increment_messages_sent(&self, name: &str) {
        let counter = match name {
            "PrePrepare" => &self.sent_pre_prepare,
            "Prepare" => &self.sent_prepare,
            "Commit" => &self.sent_commit,
            "Reply" => &self.sent_reply,
            "Checkpoint" => &self.sent_checkpoint,
            "ViewChange" => &self.sent_view_change,
            "NewView" => &self.sent_new_view,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_operations_executed(&self) {
        self.operations_executed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_duplicate_requests(&self) {
        self.duplicate_requests_replayed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_view_changes_started(&self) {
        self.view_changes_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_view_changes_completed(&self) {
        self.view_changes_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_checkpoints_stable(&self) {
        self.checkpoints_stable.fetch_add(1, Ordering::Relaxed);
    }

    // === Gauges ===

    pub fn set_view_number(&self, view: u64) {
        self.view_number.store(view, Ordering::Relaxed);
    }

    pub fn set_last_executed_seq(&self, seq: u64) {
        self.last_executed_seq.store(seq, Ordering::Relaxed);
    }

    pub fn set_low_watermark(&self, seq: u64) {
        self.low_watermark.store(seq, Ordering::Relaxed);
    }

    /// Takes a point-in-time copy of every metric.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            dropped_malformed: self.dropped_malformed.load(Ordering::Relaxed),
            dropped_out_of_range: self.dropped_out_of_range.load(Ordering::Relaxed),
            dropped_wrong_view: self.dropped_wrong_view.load(Ordering::Relaxed),
            mismatched_prepares: self.mismatched_prepares.load(Ordering::Relaxed),
            equivocations_detected: self.equivocations_detected.load(Ordering::Relaxed),
            hcv_divergences_observed: self.hcv_divergences_observed.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            operations_executed: self.operations_executed.load(Ordering::Relaxed),
            duplicate_requests_replayed: self.duplicate_requests_replayed.load(Ordering::Relaxed),
            view_changes_started: self.view_changes_started.load(Ordering::Relaxed),
            view_changes_completed: self.view_changes_completed.load(Ordering::Relaxed),
            checkpoints_stable: self.checkpoints_stable.load(Ordering::Relaxed),
            view_number: self.view_number.load(Ordering::Relaxed),
            last_executed_seq: self.last_executed_seq.load(Ordering::Relaxed),
            low_watermark: self.low_watermark.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of the metrics, as returned by `Replica::metrics()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub dropped_malformed: u64,
    pub dropped_out_of_range: u64,
    pub dropped_wrong_view: u64,
    pub mismatched_prepares: u64,
    pub equivocations_detected: u64,
    pub hcv_divergences_observed: u64,
    pub messages_received: u64,
    pub operations_executed: u64,
    pub duplicate_requests_replayed: u64,
    pub view_changes_started: u64,
    pub view_changes_completed: u64,
    pub checkpoints_stable: u64,
    pub view_number: u64,
    pub last_executed_seq: u64,
    pub low_watermark: u64,
}
