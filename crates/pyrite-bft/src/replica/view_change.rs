//! View change protocol handlers.
//!
//! 1. A replica that suspects the primary (request timeout, observed
//!    equivocation) or learns of a newer view (`f + 1` catch-up rule)
//!    stops accepting agreement traffic, signs a VIEW-CHANGE for the next
//!    view carrying its stable checkpoint proof and prepared
//!    certificates, and broadcasts it.
//! 2. The prospective primary collects `2f + 1` VIEW-CHANGEs and emits a
//!    NEW-VIEW with the union plus, for every sequence in the
//!    reconstructed range, either the prepared request (highest prepared
//!    view wins) or a null no-op.
//! 3. Every replica recomputes the pre-prepare set and the HCV chain
//!    deterministically from the VIEW-CHANGE set itself — nothing is
//!    taken on the new primary's word. A NEW-VIEW that disagrees with the
//!    recomputation is Byzantine and answered with another view change.
//!
//! # Safety Properties
//!
//! - Requests prepared in earlier views keep their sequence numbers and
//!   digests
//! - The hash chain extends over each request's original sequencing view,
//!   so replicas that executed before the change and replicas that
//!   execute after it derive identical chains
//! - View numbers observed by a correct replica never decrease

use std::collections::HashSet;

use pyrite_types::{Hash, ReplicaId, SeqNumber, ViewNumber};

use crate::contracts::StateMachine;
use crate::hcv;
use crate::instrumentation::METRICS;
use crate::log::SlotStatus;
use crate::message::{NewView, Payload, PrePrepare, Prepare, ViewChange};

use super::{ReplicaOutput, ReplicaState, ReplicaStatus, TimeoutKind, TimerRequest, TimerToken, msg_broadcast};

// ============================================================================
// New-View Plan
// ============================================================================

/// The deterministic reconstruction of the log for a new view, computed
/// identically by the new primary (to build the NEW-VIEW) and by every
/// backup (to check it).
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct NewViewPlan {
    /// The checkpoint the new log starts from (the highest `last_stable`
    /// among the view changes).
    pub start: SeqNumber,

    /// The highest re-proposed sequence; equals `start` when nothing was
    /// prepared above the checkpoint.
    pub end: SeqNumber,

    /// The chain value at `start`.
    pub base_hcv: Hash,

    /// The chain value after `end` — the new primary's speculative chain
    /// head.
    pub cursor: Hash,

    /// One implied pre-prepare per sequence in `(start, end]`.
    pub pre_prepares: Vec<PrePrepare>,
}

/// Computes the new-view plan from a set of validated VIEW-CHANGEs.
///
/// Selection rule for a contested sequence: the request prepared in the
/// highest view wins; sequences nobody prepared become null no-ops. The
/// chain is replayed from the checkpoint's HCV over each selection's
/// original sequencing view.
pub(crate) fn compute_new_view_plan<'a>(
    target: ViewNumber,
    votes: impl Iterator<Item = &'a ViewChange> + Clone,
) -> NewViewPlan {
    let start = votes
        .clone()
        .map(|vc| vc.last_stable)
        .max()
        .unwrap_or(SeqNumber::ZERO);

    let base_hcv = votes
        .clone()
        .filter(|vc| vc.last_stable == start)
        .find_map(|vc| vc.checkpoint_proof.first().map(|cp| cp.hcv))
        .unwrap_or_else(hcv::genesis);

    let end = votes
        .clone()
        .flat_map(|vc| vc.prepared.iter().map(crate::message::PreparedProof::seq))
        .max()
        .unwrap_or(start)
        .max(start);

    let mut pre_prepares = Vec::new();
    let mut cursor = base_hcv;

    let mut seq = start.next();
    while seq <= end {
        let selected = votes
            .clone()
            .flat_map(|vc| vc.prepared.iter())
            .filter(|proof| proof.seq() == seq)
            .max_by_key(|proof| (proof.view(), proof.pre_prepare.digest));

        let pp = match selected {
            Some(proof) => {
                let pp = proof.pre_prepare.clone();
                cursor = hcv::extend(cursor, pp.digest, seq, pp.origin_view);
                pp.repropose(target, cursor)
            }
            None => {
                cursor = hcv::extend(cursor, Hash::ZERO, seq, target);
                PrePrepare::noop(target, seq, cursor)
            }
        };
        pre_prepares.push(pp);
        seq = seq.next();
    }

    NewViewPlan {
        start,
        end,
        base_hcv,
        cursor,
        pre_prepares,
    }
}

impl<S: StateMachine> ReplicaState<S> {
    // ========================================================================
    // View Change Initiation
    // ========================================================================

    /// Leaves the current view for `target`: stops agreement traffic,
    /// broadcasts a signed VIEW-CHANGE, and arms the backed-off
    /// view-change timer.
    pub(crate) fn start_view_change_to(mut self, target: ViewNumber) -> (Self, ReplicaOutput) {
        if target <= self.view && self.status == ReplicaStatus::ViewChanging {
            return (self, ReplicaOutput::empty());
        }

        tracing::info!(
            replica = %self.replica_id,
            from_view = %self.view,
            to_view = %target,
            "starting view change"
        );
        METRICS.increment_view_changes_started();

        let mut output = ReplicaOutput::empty();

        // Per-request timers of the abandoned view are dead weight now.
        // The pending requests themselves survive: they are re-driven
        // toward the new primary once the view change completes.
        for client in self.pending_forwards.keys() {
            output.timers.push(TimerRequest::Cancel {
                token: TimerToken {
                    kind: TimeoutKind::Request(*client),
                    view: self.view,
                },
            });
        }
        self.in_flight.clear();

        self.view = target;
        self.status = ReplicaStatus::ViewChanging;
        METRICS.set_view_number(target.as_u64());

        let vc = ViewChange {
            new_view: target,
            last_stable: self.last_stable,
            checkpoint_proof: self.stable_proof.clone(),
            prepared: self
                .log
                .prepared_proofs_above(self.last_stable, self.config.quorum_prepare()),
            hcv_latest: self.hcv,
            sender: self.replica_id,
            signature: None,
        }
        .sign(&self.keys.signing);

        self.view_change_votes
            .entry(target)
            .or_default()
            .insert(self.replica_id, vc.clone());

        output
            .messages
            .push(msg_broadcast(self.replica_id, Payload::ViewChange(vc)));

        output.timers.push(TimerRequest::Schedule {
            token: TimerToken {
                kind: TimeoutKind::ViewChange,
                view: target,
            },
            delay: self
                .config
                .view_change_timeout_for(self.view_change_attempts),
        });
        self.view_change_attempts += 1;

        // Votes for this view may already be buffered (we are catching
        // up); the quorum might be complete the moment we join it.
        let (next, assembled) = self.try_assemble_new_view(target);
        output.merge(assembled);
        (next, output)
    }

    /// The view change stalled; move to the next candidate view with a
    /// doubled timeout.
    pub(crate) fn on_view_change_timeout(self) -> (Self, ReplicaOutput) {
        if self.status != ReplicaStatus::ViewChanging {
            return (self, ReplicaOutput::empty());
        }

        tracing::info!(
            replica = %self.replica_id,
            view = %self.view,
            attempts = self.view_change_attempts,
            "view change timed out; advancing"
        );

        let target = self.view.next();
        self.start_view_change_to(target)
    }

    // ========================================================================
    // ViewChange Handler
    // ========================================================================

    /// Handles a VIEW-CHANGE message.
    pub(crate) fn on_view_change(mut self, from: ReplicaId, vc: ViewChange) -> (Self, ReplicaOutput) {
        if !self.status.can_view_change() {
            return (self, ReplicaOutput::empty());
        }
        if vc.sender != from {
            return self.drop_malformed("ViewChange sender field contradicts envelope");
        }
        let Some(key) = self.keys.replica_keys.get(&from) else {
            return self.drop_malformed("ViewChange from replica with no known key");
        };
        if vc.verify(key).is_err() {
            return self.drop_malformed("ViewChange signature invalid");
        }
        if !self.view_change_contents_valid(&vc) {
            return self.drop_malformed("ViewChange carries invalid proofs");
        }

        // Stale: a view we have fully moved past.
        if vc.new_view < self.view
            || (vc.new_view == self.view && self.status == ReplicaStatus::Active)
        {
            METRICS.increment_dropped_wrong_view();
            return (self, ReplicaOutput::empty());
        }

        self.view_change_votes
            .entry(vc.new_view)
            .or_default()
            .insert(from, vc.clone());

        let mut output = ReplicaOutput::empty();

        // Catch-up rule: f + 1 distinct replicas ahead of us cannot all
        // be faulty; join the smallest view they are moving to.
        if vc.new_view > self.view {
            let mut ahead: HashSet<ReplicaId> = HashSet::new();
            let mut smallest: Option<ViewNumber> = None;
            for (view, votes) in self.view_change_votes.range(self.view.next()..) {
                for sender in votes.keys() {
                    if *sender != self.replica_id {
                        ahead.insert(*sender);
                    }
                }
                if !votes.is_empty() && smallest.is_none() {
                    smallest = Some(*view);
                }
            }

            if ahead.len() >= self.config.quorum_weak() {
                let target = smallest.expect("non-empty vote set implies a smallest view");
                tracing::info!(
                    replica = %self.replica_id,
                    view = %self.view,
                    target = %target,
                    "catch-up: joining view change already in progress"
                );
                let (next, catchup) = self.start_view_change_to(target);
                output.merge(catchup);
                return (next, output);
            }

            // Not enough evidence yet to abandon the current view.
            return (self, output);
        }

        // vc.new_view == self.view while view-changing: maybe we are the
        // primary-elect and this vote completes the quorum.
        let (next, assembled) = self.try_assemble_new_view(vc.new_view);
        output.merge(assembled);
        (next, output)
    }

    /// Structural validation of a VIEW-CHANGE's embedded evidence.
    fn view_change_contents_valid(&self, vc: &ViewChange) -> bool {
        // Checkpoint proof: 2f + 1 matching checkpoints at last_stable
        // from distinct members (absent only for the empty checkpoint).
        if vc.last_stable > SeqNumber::ZERO {
            let mut senders = HashSet::new();
            let Some(first) = vc.checkpoint_proof.first() else {
                return false;
            };
            for cp in &vc.checkpoint_proof {
                if cp.seq != vc.last_stable
                    || cp.state_digest != first.state_digest
                    || cp.hcv != first.hcv
                    || !self.config.is_member(cp.sender)
                {
                    return false;
                }
                senders.insert(cp.sender);
            }
            if senders.len() < self.config.quorum_commit() {
                return false;
            }
        } else if !vc.checkpoint_proof.is_empty() {
            return false;
        }

        // Prepared certificates: valid, above the checkpoint, one per
        // sequence, and never carrying a request the client did not sign
        // (a Byzantine view change must not smuggle invented operations
        // into the next view).
        let quorum = self.config.quorum_prepare();
        let mut seqs = HashSet::new();
        for proof in &vc.prepared {
            if proof.seq() <= vc.last_stable
                || !proof.is_valid(quorum)
                || !seqs.insert(proof.seq())
            {
                return false;
            }
            if let Some(request) = &proof.pre_prepare.request {
                let Some(key) = self.keys.client_keys.get(&request.client_id) else {
                    return false;
                };
                if request.verify(key).is_err() {
                    return false;
                }
            }
        }

        true
    }

    // ========================================================================
    // New-View Assembly (Primary-Elect)
    // ========================================================================

    /// If this replica is the primary-elect of `target` and holds a
    /// `2f + 1` vote quorum, assembles and broadcasts the NEW-VIEW and
    /// enters the view.
    fn try_assemble_new_view(mut self, target: ViewNumber) -> (Self, ReplicaOutput) {
        if self.view != target
            || self.status != ReplicaStatus::ViewChanging
            || self.config.primary_for(target) != self.replica_id
        {
            return (self, ReplicaOutput::empty());
        }
        let votes = self.view_change_votes.get(&target).cloned().unwrap_or_default();
        if votes.len() < self.config.quorum_commit() {
            return (self, ReplicaOutput::empty());
        }

        let plan = compute_new_view_plan(target, votes.values());

        tracing::info!(
            replica = %self.replica_id,
            view = %target,
            start = %plan.start,
            end = %plan.end,
            "assembling new view"
        );

        let nv = NewView {
            view: target,
            view_changes: votes.values().cloned().collect(),
            pre_prepares: plan.pre_prepares.clone(),
            signature: None,
        }
        .sign(&self.keys.signing);

        let mut output =
            ReplicaOutput::with_messages(vec![msg_broadcast(self.replica_id, Payload::NewView(nv))]);

        let (next, entered) = self.enter_view(target, plan);
        output.merge(entered);
        (next, output)
    }

    // ========================================================================
    // NewView Handler (Backup)
    // ========================================================================

    /// Handles a NEW-VIEW from the claimed primary of the new view.
    pub(crate) fn on_new_view(mut self, from: ReplicaId, nv: NewView) -> (Self, ReplicaOutput) {
        if !self.status.can_view_change() {
            return (self, ReplicaOutput::empty());
        }
        if from != self.config.primary_for(nv.view) {
            return self.drop_malformed("NewView from a replica that is not its primary");
        }
        if nv.view < self.view || (nv.view == self.view && self.status == ReplicaStatus::Active) {
            METRICS.increment_dropped_wrong_view();
            return (self, ReplicaOutput::empty());
        }
        let Some(key) = self.keys.replica_keys.get(&from) else {
            return self.drop_malformed("NewView from replica with no known key");
        };
        if nv.verify(key).is_err() {
            return self.drop_malformed("NewView signature invalid");
        }

        // The embedded view changes must themselves be a valid quorum.
        let mut senders = HashSet::new();
        for vc in &nv.view_changes {
            let Some(vc_key) = self.keys.replica_keys.get(&vc.sender) else {
                return self.drop_malformed("NewView embeds ViewChange from unknown replica");
            };
            if vc.new_view != nv.view
                || vc.verify(vc_key).is_err()
                || !self.view_change_contents_valid(vc)
            {
                return self.drop_malformed("NewView embeds an invalid ViewChange");
            }
            senders.insert(vc.sender);
        }
        if senders.len() < self.config.quorum_commit() {
            return self.drop_malformed("NewView lacks a view-change quorum");
        }

        // Recompute the plan ourselves; the primary's word counts for
        // nothing. A disagreeing NEW-VIEW is Byzantine: answer it with
        // the next view change.
        let plan = compute_new_view_plan(nv.view, nv.view_changes.iter());
        if plan.pre_prepares != nv.pre_prepares {
            tracing::warn!(
                replica = %self.replica_id,
                view = %nv.view,
                primary = %from,
                "NewView contradicts deterministic reconstruction"
            );
            METRICS.increment_equivocations();
            return self.start_view_change_to(nv.view.next());
        }

        self.enter_view(nv.view, plan)
    }

    // ========================================================================
    // View Entry
    // ========================================================================

    /// Enters `target` as the active view and installs the implied
    /// pre-prepares. Backups answer each installed slot with a PREPARE;
    /// the new primary's pre-prepares speak for themselves.
    fn enter_view(mut self, target: ViewNumber, plan: NewViewPlan) -> (Self, ReplicaOutput) {
        let mut output = ReplicaOutput::empty();

        output.timers.push(TimerRequest::Cancel {
            token: TimerToken {
                kind: TimeoutKind::ViewChange,
                view: self.view,
            },
        });

        self.view = target;
        self.status = ReplicaStatus::Active;
        self.view_change_attempts = 0;
        self.view_change_votes.retain(|view, _| *view > target);
        METRICS.set_view_number(target.as_u64());
        METRICS.increment_view_changes_completed();

        // The reconstructed log starts at a checkpoint we never reached:
        // the executed prefix between ours and the cluster's is gone from
        // the network. Without state transfer we cannot participate.
        if plan.start > self.last_executed {
            tracing::warn!(
                replica = %self.replica_id,
                view = %target,
                plan_start = %plan.start,
                last_executed = %self.last_executed,
                "missing executed prefix; entering recovery"
            );
            self.status = ReplicaStatus::Recovering;
            return (self, output);
        }

        let is_primary = self.is_primary();

        for pp in &plan.pre_prepares {
            if pp.seq <= self.last_executed {
                // Already executed; the selection rule must agree with
                // history or the chain itself is compromised.
                let ours = self.log.slot(pp.seq).and_then(|slot| slot.accepted_digest());
                if let Some(ours) = ours {
                    if ours != pp.digest {
                        return self.halt(format!(
                            "new view re-proposes {} with digest {} over executed {}",
                            pp.seq, pp.digest, ours
                        ));
                    }
                }
                continue;
            }
            if !self.log.in_window(pp.seq) {
                continue;
            }

            let seq = pp.seq;
            let slot = self.log.slot_entry(seq, target);
            if slot.status == SlotStatus::Executed {
                continue;
            }
            slot.reset_for_view(target);
            slot.pre_prepare = Some(pp.clone());
            slot.status = SlotStatus::PrePrepared;

            if !is_primary {
                let prepare = Prepare::new(target, seq, pp.digest, self.hcv, self.replica_id);
                self.log
                    .slot_entry(seq, target)
                    .prepares
                    .insert(self.replica_id, prepare.clone());
                output
                    .messages
                    .push(msg_broadcast(self.replica_id, Payload::Prepare(prepare)));
            }
        }

        if is_primary {
            self.last_assigned = plan.end.max(self.last_executed);
            self.speculative_hcv = plan.cursor;
        }

        tracing::info!(
            replica = %self.replica_id,
            view = %target,
            primary = %self.primary(),
            installed = plan.pre_prepares.len(),
            "entered view"
        );

        // Requests that were waiting on the old primary get re-driven:
        // the new primary sequences them, backups re-forward and re-arm.
        let pending: Vec<_> = self.pending_forwards.drain().map(|(_, req)| req).collect();
        let mut state = self;
        for request in pending {
            let (next, driven) = if is_primary {
                state.primary_assign(request)
            } else {
                state.backup_forward(request)
            };
            state = next;
            output.merge(driven);
        }

        (state, output)
    }
}
