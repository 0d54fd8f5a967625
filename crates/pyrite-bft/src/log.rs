//! The replica's indexed store of protocol messages and quorum witnesses.
//!
//! One [`Slot`] per sequence number, created on first evidence (a valid
//! PRE-PREPARE, PREPARE, or COMMIT) and discarded when it falls below the
//! stable checkpoint. Slots advance monotonically through
//! `Empty → PrePrepared → Prepared → Committed → Executed`, with the one
//! sanctioned shortcut `Empty → Committed` when a commit certificate
//! arrives before the earlier phases.
//!
//! Watermarks bound the sequence range a replica buffers: evidence for
//! `n` is accepted only when `low_watermark < n ≤ low_watermark + window`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use pyrite_types::{Hash, ReplicaId, SeqNumber, ViewNumber};

use crate::message::{Commit, PrePrepare, Prepare, PreparedProof, Request};

// ============================================================================
// Slot Status
// ============================================================================

/// Agreement progress of one sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SlotStatus {
    /// Evidence exists but no accepted pre-prepare.
    Empty,
    /// A pre-prepare was accepted for this `(view, seq)`.
    PrePrepared,
    /// Pre-prepare plus `2f` matching prepares.
    Prepared,
    /// `2f + 1` matching commits.
    Committed,
    /// Applied to the state machine; HCV recorded.
    Executed,
}

// ============================================================================
// Slot
// ============================================================================

/// Everything known about one sequence number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Slot {
    /// The view the accepted pre-prepare belongs to (or the view of the
    /// first evidence seen, before acceptance).
    pub view: ViewNumber,

    /// The accepted pre-prepare, with its piggybacked request.
    pub pre_prepare: Option<PrePrepare>,

    /// Prepares by sender; insertion is idempotent per sender.
    pub prepares: BTreeMap<ReplicaId, Prepare>,

    /// Commits by sender; may accumulate before a pre-prepare arrives.
    pub commits: BTreeMap<ReplicaId, Commit>,

    pub status: SlotStatus,

    /// The chain value after executing this slot. Immutable once set.
    pub hcv: Option<Hash>,
}

impl Slot {
    fn new(view: ViewNumber) -> Self {
        Self {
            view,
            pre_prepare: None,
            prepares: BTreeMap::new(),
            commits: BTreeMap::new(),
            status: SlotStatus::Empty,
            hcv: None,
        }
    }

    /// The digest accepted for this slot, if a pre-prepare was accepted.
    pub fn accepted_digest(&self) -> Option<Hash> {
        self.pre_prepare.as_ref().map(|pp| pp.digest)
    }

    /// The request body, if the accepted pre-prepare carried one.
    pub fn request(&self) -> Option<&Request> {
        self.pre_prepare.as_ref().and_then(|pp| pp.request.as_ref())
    }

    /// True when the accepted pre-prepare is a null no-op.
    pub fn is_noop(&self) -> bool {
        self.pre_prepare.as_ref().is_some_and(PrePrepare::is_noop)
    }

    /// Counts prepares matching the accepted `(view, digest)`.
    pub fn matching_prepares(&self) -> usize {
        let Some(pp) = &self.pre_prepare else { return 0 };
        self.prepares
            .values()
            .filter(|p| p.view == pp.view && p.digest == pp.digest)
            .count()
    }

    /// Finds a `(view, digest)` pair carried by at least `quorum`
    /// distinct commit senders, if any.
    ///
    /// Works without an accepted pre-prepare, which is what permits the
    /// `Empty → Committed` catch-up transition.
    pub fn commit_certificate(&self, quorum: usize) -> Option<(ViewNumber, Hash)> {
        let mut counts: BTreeMap<(ViewNumber, Hash), usize> = BTreeMap::new();
        for commit in self.commits.values() {
            *counts.entry((commit.view, commit.digest)).or_default() += 1;
        }
        counts
            .into_iter()
            .find(|(_, count)| *count >= quorum)
            .map(|(key, _)| key)
    }

    /// Resets agreement state when the slot is re-proposed in a higher
    /// view. Execution results are never rolled back.
    pub fn reset_for_view(&mut self, view: ViewNumber) {
        debug_assert!(self.status != SlotStatus::Executed);
        self.view = view;
        self.pre_prepare = None;
        self.prepares.clear();
        self.commits.clear();
        self.status = SlotStatus::Empty;
    }
}

// ============================================================================
// MessageLog
// ============================================================================

/// The indexed store of slots, bounded by watermarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageLog {
    slots: BTreeMap<SeqNumber, Slot>,

    /// The last stable checkpoint sequence. Evidence at or below it is
    /// out of range.
    low_watermark: SeqNumber,

    /// Width of the acceptance window above the low watermark.
    window: u64,
}

impl MessageLog {
    pub fn new(window: u64) -> Self {
        Self {
            slots: BTreeMap::new(),
            low_watermark: SeqNumber::ZERO,
            window,
        }
    }

    pub fn low_watermark(&self) -> SeqNumber {
        self.low_watermark
    }

    pub fn high_watermark(&self) -> SeqNumber {
        SeqNumber::new(self.low_watermark.as_u64() + self.window)
    }

    /// True when `seq` is inside the acceptance window.
    pub fn in_window(&self, seq: SeqNumber) -> bool {
        seq > self.low_watermark && seq <= self.high_watermark()
    }

    pub fn slot(&self, seq: SeqNumber) -> Option<&Slot> {
        self.slots.get(&seq)
    }

    pub fn slot_mut(&mut self, seq: SeqNumber) -> Option<&mut Slot> {
        self.slots.get_mut(&seq)
    }

    /// Returns the slot for `seq`, creating it on first evidence.
    ///
    /// # Panics
    ///
    /// Debug-asserts that `seq` is inside the window; callers gate on
    /// [`MessageLog::in_window`] first.
    pub fn slot_entry(&mut self, seq: SeqNumber, view: ViewNumber) -> &mut Slot {
        debug_assert!(self.in_window(seq), "slot {seq} outside watermarks");
        self.slots.entry(seq).or_insert_with(|| Slot::new(view))
    }

    /// Iterates over populated slots in sequence order.
    pub fn slots(&self) -> impl Iterator<Item = (SeqNumber, &Slot)> {
        self.slots.iter().map(|(seq, slot)| (*seq, slot))
    }

    /// True when a prepared certificate exists for `seq`: an accepted
    /// pre-prepare plus `quorum` matching prepares from distinct senders.
    pub fn has_prepared_certificate(&self, seq: SeqNumber, quorum: usize) -> bool {
        self.slots
            .get(&seq)
            .is_some_and(|slot| slot.pre_prepare.is_some() && slot.matching_prepares() >= quorum)
    }

    /// Extracts the prepared certificates above `floor`, as view-change
    /// evidence.
    pub fn prepared_proofs_above(&self, floor: SeqNumber, quorum: usize) -> Vec<PreparedProof> {
        self.slots
            .iter()
            .filter(|(seq, _)| **seq > floor)
            .filter_map(|(_, slot)| {
                let pp = slot.pre_prepare.as_ref()?;
                if slot.matching_prepares() < quorum {
                    return None;
                }
                let prepares = slot
                    .prepares
                    .values()
                    .filter(|p| p.view == pp.view && p.digest == pp.digest)
                    .cloned()
                    .collect();
                Some(PreparedProof {
                    pre_prepare: pp.clone(),
                    prepares,
                })
            })
            .collect()
    }

    /// Advances the low watermark to a newly stable checkpoint and
    /// discards every slot at or below it.
    pub fn truncate_below(&mut self, stable: SeqNumber) {
        debug_assert!(stable >= self.low_watermark);
        self.low_watermark = stable;
        self.slots.retain(|seq, _| *seq > stable);
    }

    /// Number of populated slots (for metrics and bounds checks).
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

// ============================================================================
// Tests
// ============================================================================
