//! Normal operation protocol handlers.
//!
//! The three-phase agreement path:
//! - Request (client → primary, possibly relayed by a backup)
//! - PrePrepare (primary → backups)
//! - Prepare (backup → all)
//! - Commit (all → all)
//!
//! plus in-order execution and REPLY emission.

use pyrite_types::{ClientId, ReplicaId, SeqNumber};

use crate::instrumentation::METRICS;
use crate::log::SlotStatus;
use crate::message::{Commit, Payload, Peer, PrePrepare, Prepare, Reply, Request, tag};
use crate::{contracts::StateMachine, hcv};

use super::{ExecutedOp, ReplicaOutput, ReplicaState, TimeoutKind, TimerRequest, TimerToken, msg_broadcast, msg_to};

impl<S: StateMachine> ReplicaState<S> {
    // ========================================================================
    // Request Handler
    // ========================================================================

    /// Handles a client REQUEST, from the client itself or relayed by a
    /// backup.
    ///
    /// The primary assigns the next sequence number and pre-prepares; a
    /// backup forwards to the primary and arms a timer so a dead or
    /// censoring primary is eventually suspected.
    pub(crate) fn on_request(self, _sender: Peer, request: Request) -> (Self, ReplicaOutput) {
        // Client signature first: an unauthenticated request is noise.
        let Some(client_key) = self.keys.client_keys.get(&request.client_id) else {
            return self.drop_malformed("request from unknown client");
        };
        if request.verify(client_key).is_err() {
            return self.drop_malformed("request signature invalid");
        }

        // At-most-once: old timestamps are answered from the client table.
        if let Some(entry) = self.client_table.get(&request.client_id) {
            if request.timestamp <= entry.last_timestamp {
                METRICS.increment_duplicate_requests();
                tracing::debug!(
                    replica = %self.replica_id,
                    client = %request.client_id,
                    ts = %request.timestamp,
                    "duplicate request; replaying last reply"
                );
                let reply = entry.last_reply.clone();
                let output = match reply {
                    Some(reply) => ReplicaOutput::with_messages(vec![msg_to(
                        self.replica_id,
                        request.client_id,
                        Payload::Reply(reply),
                    )]),
                    None => ReplicaOutput::empty(),
                };
                return (self, output);
            }
        }

        if !self.status.can_participate() {
            return (self, ReplicaOutput::empty());
        }

        if self.is_primary() {
            self.primary_assign(request)
        } else {
            self.backup_forward(request)
        }
    }

    /// Primary: assign the next sequence number and emit PRE-PREPARE.
    pub(crate) fn primary_assign(mut self, request: Request) -> (Self, ReplicaOutput) {
        // An in-flight duplicate must not be sequenced twice, and neither
        // must a request that already holds a slot (for instance one
        // re-proposed by the NEW-VIEW this primary just installed).
        if self.in_flight.get(&request.client_id) == Some(&request.timestamp)
            || self.request_already_sequenced(&request)
        {
            METRICS.increment_duplicate_requests();
            return (self, ReplicaOutput::empty());
        }

        let seq = self.last_assigned.next();
        if !self.log.in_window(seq) {
            // The window is full; client retransmission will land after a
            // checkpoint advances the watermarks.
            tracing::warn!(
                replica = %self.replica_id,
                seq = %seq,
                high = %self.log.high_watermark(),
                "sequence window exhausted; deferring request"
            );
            return self.drop_out_of_range(seq);
        }

        let digest = request.digest();
        self.speculative_hcv = hcv::extend(self.speculative_hcv, digest, seq, self.view);
        let pp = PrePrepare::new(self.view, seq, self.speculative_hcv, request.clone());

        tracing::debug!(
            replica = %self.replica_id,
            view = %self.view,
            seq = %seq,
            digest = %digest,
            client = %request.client_id,
            "assigning sequence number"
        );

        self.last_assigned = seq;
        self.in_flight.insert(request.client_id, request.timestamp);

        let view = self.view;
        let slot = self.log.slot_entry(seq, view);
        slot.pre_prepare = Some(pp.clone());
        slot.status = SlotStatus::PrePrepared;

        let msg = msg_broadcast(self.replica_id, Payload::PrePrepare(pp));
        (self, ReplicaOutput::with_messages(vec![msg]))
    }

    /// True when some live slot already carries this exact request.
    fn request_already_sequenced(&self, request: &Request) -> bool {
        self.log.slots().any(|(_, slot)| {
            slot.request().is_some_and(|r| {
                r.client_id == request.client_id && r.timestamp == request.timestamp
            })
        })
    }

    /// Backup: relay the request to the primary and arm the suspicion
    /// timer.
    pub(crate) fn backup_forward(mut self, request: Request) -> (Self, ReplicaOutput) {
        let client = request.client_id;
        let primary = self.primary();

        // One pending forward per client; a retransmission does not
        // re-arm the timer.
        let already_pending = self.pending_forwards.contains_key(&client);
        self.pending_forwards.insert(client, request.clone());

        let mut output = ReplicaOutput::with_messages(vec![msg_to(
            self.replica_id,
            primary,
            Payload::Request(request),
        )]);

        if !already_pending {
            output.timers.push(TimerRequest::Schedule {
                token: TimerToken {
                    kind: TimeoutKind::Request(client),
                    view: self.view,
                },
                delay: self.config.request_timeout,
            });
        }

        (self, output)
    }

    // ========================================================================
    // PrePrepare Handler (Backup)
    // ========================================================================

    /// Handles a PRE-PREPARE from the primary.
    ///
    /// Acceptance: view matches, sequence in window, no conflicting
    /// pre-prepare already accepted for this `(view, seq)`, piggybacked
    /// request matches the digest. Two different digests from the primary
    /// for one slot are proof of equivocation and trigger a view change.
    pub(crate) fn on_pre_prepare(mut self, from: ReplicaId, pp: PrePrepare) -> (Self, ReplicaOutput) {
        if !self.status.can_participate() {
            return (self, ReplicaOutput::empty());
        }
        if pp.view != self.view {
            METRICS.increment_dropped_wrong_view();
            return (self, ReplicaOutput::empty());
        }
        if from != self.primary() {
            return self.drop_malformed("PrePrepare not from the primary");
        }
        if !self.log.in_window(pp.seq) {
            return self.drop_out_of_range(pp.seq);
        }
        if !pp.digest_matches_request() {
            return self.drop_malformed("PrePrepare digest contradicts piggybacked request");
        }
        // In normal operation the primary sequences in its own view;
        // re-proposals with older origin views only arrive via NEW-VIEW.
        if pp.origin_view > pp.view {
            return self.drop_malformed("PrePrepare origin view beyond its view");
        }
        // The primary cannot invent requests: the piggybacked body must
        // carry a valid client signature.
        if let Some(request) = &pp.request {
            let Some(client_key) = self.keys.client_keys.get(&request.client_id) else {
                return self.drop_malformed("PrePrepare piggybacks request from unknown client");
            };
            if request.verify(client_key).is_err() {
                return self.drop_malformed("PrePrepare piggybacks request with invalid signature");
            }
        }

        let accepted_in_view = self
            .log
            .slot(pp.seq)
            .filter(|slot| slot.view == pp.view)
            .and_then(|slot| slot.accepted_digest());
        if let Some(accepted) = accepted_in_view {
            if accepted == pp.digest {
                // Duplicate pre-prepare: our prepare may have been lost;
                // answer it again.
                let prepare = self.own_prepare(pp.seq, accepted);
                let msg = msg_broadcast(self.replica_id, Payload::Prepare(prepare));
                return (self, ReplicaOutput::with_messages(vec![msg]));
            }

            // Same (view, seq), different digest: the primary is
            // equivocating. Keep the proof and leave the view.
            let proof = self.record_equivocation(
                Peer::Replica(from),
                pp.view,
                pp.seq,
                accepted,
                pp.digest,
            );
            let (next, mut output) = self.start_view_change_to(pp.view.next());
            output.proofs.push(proof);
            return (next, output);
        }

        tracing::trace!(
            replica = %self.replica_id,
            view = %pp.view,
            seq = %pp.seq,
            digest = %pp.digest,
            "accepting pre-prepare"
        );

        let seq = pp.seq;
        let view = self.view;
        let slot = self.log.slot_entry(seq, view);
        slot.view = view;
        slot.pre_prepare = Some(pp.clone());
        if slot.status < SlotStatus::PrePrepared {
            slot.status = SlotStatus::PrePrepared;
        }

        let mut output = ReplicaOutput::empty();

        // The pre-prepare answers a forwarded request; stand down the
        // suspicion timer.
        if let Some(request) = &pp.request {
            if self
                .pending_forwards
                .get(&request.client_id)
                .is_some_and(|pending| pending.timestamp <= request.timestamp)
            {
                self.pending_forwards.remove(&request.client_id);
                output.timers.push(TimerRequest::Cancel {
                    token: TimerToken {
                        kind: TimeoutKind::Request(request.client_id),
                        view: self.view,
                    },
                });
            }
        }

        let prepare = self.own_prepare(seq, pp.digest);
        let seq_view = self.view;
        self.log
            .slot_entry(seq, seq_view)
            .prepares
            .insert(self.replica_id, prepare.clone());
        output
            .messages
            .push(msg_broadcast(self.replica_id, Payload::Prepare(prepare)));

        // Buffered prepares/commits may already complete a certificate.
        let (next, advance) = self.try_advance(seq);
        let mut merged = output;
        merged.merge(advance);
        (next, merged)
    }

    /// Builds this replica's PREPARE for `(view, seq, digest)`, carrying
    /// its current HCV.
    fn own_prepare(&self, seq: SeqNumber, digest: pyrite_types::Hash) -> Prepare {
        Prepare::new(self.view, seq, digest, self.hcv, self.replica_id)
    }

    // ========================================================================
    // Prepare Handler
    // ========================================================================

    /// Handles a PREPARE from a backup.
    pub(crate) fn on_prepare(mut self, from: ReplicaId, prepare: Prepare) -> (Self, ReplicaOutput) {
        if !self.status.can_participate() {
            return (self, ReplicaOutput::empty());
        }
        if prepare.view != self.view {
            METRICS.increment_dropped_wrong_view();
            return (self, ReplicaOutput::empty());
        }
        if prepare.sender != from {
            return self.drop_malformed("Prepare sender field contradicts envelope");
        }
        if from == self.primary() {
            // The primary's pre-prepare stands in for its prepare; an
            // explicit one is protocol noise.
            return self.drop_malformed("Prepare from the primary");
        }
        if !self.log.in_window(prepare.seq) {
            return self.drop_out_of_range(prepare.seq);
        }

        let mut output = ReplicaOutput::empty();

        // Divergence is a discovery, not an authentication failure: the
        // message is still processed below.
        if let Some(proof) = self.observe_hcv(
            tag::PREPARE,
            Peer::Replica(from),
            prepare.view,
            prepare.seq,
            prepare.hcv_sender,
        ) {
            output.proofs.push(proof);
        }

        let seq = prepare.seq;
        let view = self.view;

        // A prepare contradicting the accepted digest is dropped but
        // counted for misbehavior accounting.
        let accepted = self.log.slot(seq).and_then(|slot| slot.accepted_digest());
        if accepted.is_some_and(|accepted| prepare.digest != accepted) {
            METRICS.increment_mismatched_prepares();
            tracing::debug!(
                replica = %self.replica_id,
                from = %from,
                seq = %seq,
                "prepare digest contradicts accepted pre-prepare"
            );
            return (self, output);
        }

        let existing = self.log.slot_entry(seq, view).prepares.get(&from).cloned();
        match existing {
            // Idempotent: the same prepare again is a no-op.
            Some(existing) if existing == prepare => return (self, output),
            Some(existing) if existing.digest != prepare.digest => {
                let proof = self.record_equivocation(
                    Peer::Replica(from),
                    view,
                    seq,
                    existing.digest,
                    prepare.digest,
                );
                output.proofs.push(proof);
                return (self, output);
            }
            _ => {
                self.log.slot_entry(seq, view).prepares.insert(from, prepare);
            }
        }

        let (next, advance) = self.try_advance(seq);
        output.merge(advance);
        (next, output)
    }

    // ========================================================================
    // Commit Handler
    // ========================================================================

    /// Handles a COMMIT.
    ///
    /// Commits whose pre-prepare has not arrived are buffered in the slot
    /// (subject to watermarks); when the earlier evidence shows up out of
    /// order, `try_advance` re-examines them.
    pub(crate) fn on_commit(mut self, from: ReplicaId, commit: Commit) -> (Self, ReplicaOutput) {
        if !self.status.can_participate() {
            return (self, ReplicaOutput::empty());
        }
        if commit.view != self.view {
            METRICS.increment_dropped_wrong_view();
            return (self, ReplicaOutput::empty());
        }
        if commit.sender != from {
            return self.drop_malformed("Commit sender field contradicts envelope");
        }
        if !self.log.in_window(commit.seq) {
            return self.drop_out_of_range(commit.seq);
        }

        let mut output = ReplicaOutput::empty();

        if let Some(proof) = self.observe_hcv(
            tag::COMMIT,
            Peer::Replica(from),
            commit.view,
            commit.seq,
            commit.hcv_sender,
        ) {
            output.proofs.push(proof);
        }

        let seq = commit.seq;
        let view = self.view;
        let existing = self.log.slot_entry(seq, view).commits.get(&from).cloned();
        match existing {
            Some(existing) if existing == commit => return (self, output),
            Some(existing) if existing.digest != commit.digest => {
                let proof = self.record_equivocation(
                    Peer::Replica(from),
                    view,
                    seq,
                    existing.digest,
                    commit.digest,
                );
                output.proofs.push(proof);
                return (self, output);
            }
            _ => {
                self.log.slot_entry(seq, view).commits.insert(from, commit);
            }
        }

        let (next, advance) = self.try_advance(seq);
        output.merge(advance);
        (next, output)
    }

    // ========================================================================
    // Certificate Advancement
    // ========================================================================

    /// Re-examines one slot's evidence and advances its status as far as
    /// the certificates allow, then executes anything newly ready.
    pub(crate) fn try_advance(mut self, seq: SeqNumber) -> (Self, ReplicaOutput) {
        let mut output = ReplicaOutput::empty();

        let quorum_prepare = self.config.quorum_prepare();
        let quorum_commit = self.config.quorum_commit();

        let Some(status) = self.log.slot(seq).map(|slot| slot.status) else {
            return (self, output);
        };

        // Prepared: pre-prepare plus 2f matching prepares.
        if status == SlotStatus::PrePrepared
            && self.log.has_prepared_certificate(seq, quorum_prepare)
        {
            let digest = self
                .log
                .slot(seq)
                .and_then(|slot| slot.accepted_digest())
                .expect("prepared certificate implies accepted digest");

            tracing::debug!(
                replica = %self.replica_id,
                view = %self.view,
                seq = %seq,
                "prepared certificate complete; committing"
            );

            let commit = Commit::new(self.view, seq, digest, self.hcv, self.replica_id);
            let view = self.view;
            let slot = self.log.slot_entry(seq, view);
            slot.status = SlotStatus::Prepared;
            slot.commits.insert(self.replica_id, commit.clone());

            output
                .messages
                .push(msg_broadcast(self.replica_id, Payload::Commit(commit)));
        }

        // Committed: 2f+1 matching commits. The `Empty → Committed`
        // shortcut is taken when the certificate formed from buffered
        // commits before the earlier phases arrived.
        let certificate = self.log.slot(seq).and_then(|slot| {
            if slot.status < SlotStatus::Committed {
                slot.commit_certificate(quorum_commit)
                    .map(|cert| (cert, slot.accepted_digest()))
            } else {
                None
            }
        });
        if let Some(((cert_view, cert_digest), accepted)) = certificate {
            if let Some(accepted) = accepted {
                if accepted != cert_digest {
                    // A commit certificate contradicting our accepted
                    // pre-prepare means agreement itself has forked beyond
                    // what this replica can reconcile.
                    return self.halt(format!(
                        "commit certificate digest {cert_digest} contradicts accepted {accepted} at {seq}"
                    ));
                }
            }

            tracing::debug!(
                replica = %self.replica_id,
                view = %cert_view,
                seq = %seq,
                "committed certificate complete"
            );

            let view = self.view;
            self.log.slot_entry(seq, view).status = SlotStatus::Committed;
        }

        let (next, exec) = self.try_execute_ready();
        output.merge(exec);
        (next, output)
    }

    // ========================================================================
    // Execution
    // ========================================================================

    /// Executes committed slots strictly in sequence order.
    ///
    /// A committed slot with no request body (the commit certificate
    /// arrived before the pre-prepare) blocks here until the body shows
    /// up; execution never skips or reorders.
    pub(crate) fn try_execute_ready(mut self) -> (Self, ReplicaOutput) {
        let mut output = ReplicaOutput::empty();

        loop {
            let next = self.last_executed.next();
            let Some(slot) = self.log.slot(next) else { break };
            if slot.status != SlotStatus::Committed {
                break;
            }
            let Some(pp) = slot.pre_prepare.clone() else {
                // Committed via catch-up but the body is still missing.
                break;
            };

            let reply = match &pp.request {
                Some(request) => {
                    let result = self.state_machine.apply(&request.operation);
                    METRICS.increment_operations_executed();
                    Some((request.clone(), result))
                }
                // Null no-op: nothing to apply, nobody to answer.
                None => None,
            };

            // The chain extends over the origin view, so replicas that
            // executed before a view change and replicas executing after
            // it derive the same value.
            self.hcv = hcv::extend(self.hcv, pp.digest, next, pp.origin_view);
            self.last_executed = next;
            METRICS.set_last_executed_seq(next.as_u64());

            let view = self.view;
            let slot = self.log.slot_entry(next, view);
            slot.status = SlotStatus::Executed;
            slot.hcv = Some(self.hcv);

            tracing::debug!(
                replica = %self.replica_id,
                seq = %next,
                hcv = %self.hcv,
                noop = reply.is_none(),
                "executed"
            );

            match reply {
                Some((request, result)) => {
                    let reply = Reply {
                        view: self.view,
                        timestamp: request.timestamp,
                        client_id: request.client_id,
                        sender: self.replica_id,
                        result,
                        hcv_sender: self.hcv,
                    };

                    self.client_table.insert(
                        request.client_id,
                        super::ClientEntry {
                            last_timestamp: request.timestamp,
                            last_reply: Some(reply.clone()),
                        },
                    );
                    self.in_flight.remove(&request.client_id);

                    // A forward satisfied by execution (the pre-prepare
                    // may have arrived via a NEW-VIEW instead of the
                    // normal path) must stand its suspicion timer down.
                    if self
                        .pending_forwards
                        .get(&request.client_id)
                        .is_some_and(|pending| pending.timestamp <= request.timestamp)
                    {
                        self.pending_forwards.remove(&request.client_id);
                        output.timers.push(TimerRequest::Cancel {
                            token: TimerToken {
                                kind: TimeoutKind::Request(request.client_id),
                                view: self.view,
                            },
                        });
                    }

                    output.executed.push(ExecutedOp {
                        seq: next,
                        client: Some((request.client_id, request.timestamp)),
                    });
                    output.messages.push(msg_to(
                        self.replica_id,
                        request.client_id,
                        Payload::Reply(reply),
                    ));
                }
                None => {
                    output.executed.push(ExecutedOp {
                        seq: next,
                        client: None,
                    });
                }
            }

            // Checkpoint every K executions.
            if next.as_u64() % self.config.checkpoint_interval == 0 {
                let (state, cp_output) = self.emit_checkpoint(next);
                self = state;
                output.merge(cp_output);
            }
        }

        (self, output)
    }

    // ========================================================================
    // Timeout Handler
    // ========================================================================

    /// A forwarded request saw no matching pre-prepare in time: the
    /// primary is suspected and the replica leaves the view.
    pub(crate) fn on_request_timeout(self, client: ClientId) -> (Self, ReplicaOutput) {
        if !self.status.can_participate() {
            return (self, ReplicaOutput::empty());
        }
        if !self.pending_forwards.contains_key(&client) {
            // Answered in the meantime; the cancel raced the fire.
            return (self, ReplicaOutput::empty());
        }

        tracing::info!(
            replica = %self.replica_id,
            view = %self.view,
            client = %client,
            "request timeout; suspecting primary"
        );

        let target = self.view.next();
        self.start_view_change_to(target)
    }
}
