//! Checkpointing and log truncation.
//!
//! Every `K` executed sequences a replica broadcasts a CHECKPOINT with
//! its application state digest and HCV. Once `2f + 1` matching
//! checkpoints for one sequence are collected the checkpoint is *stable*:
//! the watermarks slide up, the log truncates below it, and the proof is
//! retained for view-change evidence.
//!
//! Checkpoints are processed in every non-halted status — they are how a
//! recovering replica learns the cluster has reached its own position.

use pyrite_types::{ReplicaId, SeqNumber};

use crate::contracts::StateMachine;
use crate::instrumentation::METRICS;
use crate::message::{Checkpoint, Payload, Peer};

use super::{Effect, ReplicaOutput, ReplicaState, ReplicaStatus, msg_broadcast};

impl<S: StateMachine> ReplicaState<S> {
    // ========================================================================
    // Checkpoint Emission
    // ========================================================================

    /// Broadcasts this replica's checkpoint at `seq` (called from the
    /// execution path at every multiple of the checkpoint interval).
    pub(crate) fn emit_checkpoint(mut self, seq: SeqNumber) -> (Self, ReplicaOutput) {
        let cp = Checkpoint {
            seq,
            state_digest: self.state_machine.state_digest(),
            hcv: self.hcv,
            sender: self.replica_id,
        };

        tracing::debug!(
            replica = %self.replica_id,
            seq = %seq,
            state_digest = %cp.state_digest,
            "emitting checkpoint"
        );

        self.checkpoints
            .entry(seq)
            .or_default()
            .insert(self.replica_id, cp.clone());

        let mut output = ReplicaOutput::with_messages(vec![msg_broadcast(
            self.replica_id,
            Payload::Checkpoint(cp),
        )]);

        // Peers that executed faster may already have completed the
        // quorum for us.
        let (next, stabilized) = self.try_stabilize(seq);
        output.merge(stabilized);
        (next, output)
    }

    // ========================================================================
    // Checkpoint Handler
    // ========================================================================

    /// Handles a CHECKPOINT from a peer.
    pub(crate) fn on_checkpoint(mut self, from: ReplicaId, cp: Checkpoint) -> (Self, ReplicaOutput) {
        if cp.sender != from {
            return self.drop_malformed("Checkpoint sender field contradicts envelope");
        }
        if cp.seq <= self.last_stable {
            // Already stable; nothing left to learn from it.
            return (self, ReplicaOutput::empty());
        }
        if cp.seq > self.log.high_watermark() {
            return self.drop_out_of_range(cp.seq);
        }

        let mut output = ReplicaOutput::empty();

        let existing = self
            .checkpoints
            .get(&cp.seq)
            .and_then(|by_sender| by_sender.get(&from))
            .cloned();
        match existing {
            Some(existing) if existing == cp => return (self, output),
            Some(existing) => {
                // Two different checkpoints from one sender at one
                // sequence: it is publishing two histories.
                let proof = self.record_equivocation(
                    Peer::Replica(from),
                    pyrite_types::ViewNumber::ZERO,
                    cp.seq,
                    existing.state_digest,
                    cp.state_digest,
                );
                output.proofs.push(proof);
                return (self, output);
            }
            None => {
                self.checkpoints.entry(cp.seq).or_default().insert(from, cp.clone());
            }
        }

        let (next, stabilized) = self.try_stabilize(cp.seq);
        output.merge(stabilized);
        (next, output)
    }

    // ========================================================================
    // Stability
    // ========================================================================

    /// Checks whether `seq` has a `2f + 1` matching checkpoint quorum;
    /// if so, makes it stable.
    fn try_stabilize(mut self, seq: SeqNumber) -> (Self, ReplicaOutput) {
        let quorum = self.config.quorum_commit();

        let matching: Vec<Checkpoint> = {
            let Some(by_sender) = self.checkpoints.get(&seq) else {
                return (self, ReplicaOutput::empty());
            };

            // Group by (state_digest, hcv); stability needs full
            // agreement on both.
            let mut best: Option<Vec<Checkpoint>> = None;
            for candidate in by_sender.values() {
                let group: Vec<Checkpoint> = by_sender
                    .values()
                    .filter(|cp| {
                        cp.state_digest == candidate.state_digest && cp.hcv == candidate.hcv
                    })
                    .cloned()
                    .collect();
                if group.len() >= quorum {
                    best = Some(group);
                    break;
                }
            }
            match best {
                Some(group) => group,
                None => return (self, ReplicaOutput::empty()),
            }
        };

        let state_digest = matching[0].state_digest;

        tracing::info!(
            replica = %self.replica_id,
            seq = %seq,
            state_digest = %state_digest,
            "checkpoint stable; advancing watermarks"
        );
        METRICS.increment_checkpoints_stable();
        METRICS.set_low_watermark(seq.as_u64());

        self.last_stable = seq;
        self.stable_proof = matching;
        self.log.truncate_below(seq);
        self.checkpoints.retain(|cp_seq, _| *cp_seq > seq);
        self.observed_hcvs.retain(|(_, _, _, obs_seq), _| *obs_seq > seq);

        let mut output = ReplicaOutput::empty();
        output.effects.push(Effect::SaveCheckpoint { seq, state_digest });
        output.effects.push(Effect::TruncateBelow { seq });

        // A recovering replica that was already at or past the cluster's
        // stable point has nothing left to fetch.
        if self.status == ReplicaStatus::Recovering && self.last_executed >= seq {
            tracing::info!(
                replica = %self.replica_id,
                seq = %seq,
                "recovery complete; rejoining"
            );
            self.status = ReplicaStatus::Active;
        }

        (self, output)
    }
}
