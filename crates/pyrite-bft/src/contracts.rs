//! Contracts the protocol core consumes.
//!
//! The core never talks to a socket, a disk, or a clock directly. The
//! embedding runtime supplies implementations of these traits and wires
//! their callbacks back into the replica's input queue. In-memory
//! implementations live here too; they power the simulation tests and
//! double as reference semantics.

use std::collections::VecDeque;
use std::time::Duration;

use pyrite_crypto::digest::hash_bytes;
use pyrite_types::{Hash, SeqNumber};

use crate::message::Peer;
use crate::replica::TimerToken;

// ============================================================================
// Transport
// ============================================================================

/// Best-effort authenticated datagram transport.
///
/// The network may drop, duplicate, and reorder; the protocol tolerates
/// all three. `frame` is a fully encoded wire frame
/// ([`crate::message::Message::to_wire`]).
pub trait Transport {
    /// Sends a frame to one participant.
    fn send(&mut self, to: Peer, frame: Vec<u8>);

    /// Sends a frame to every replica except the local one.
    fn multicast(&mut self, frame: Vec<u8>);
}

/// Collects outgoing frames in a queue for the test harness to deliver
/// (or drop, duplicate, reorder) as the scenario dictates.
#[derive(Debug, Default)]
pub struct QueueTransport {
    pub sent: VecDeque<(Option<Peer>, Vec<u8>)>,
}

impl QueueTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drains everything sent so far.
    pub fn drain(&mut self) -> Vec<(Option<Peer>, Vec<u8>)> {
        self.sent.drain(..).collect()
    }
}

impl Transport for QueueTransport {
    fn send(&mut self, to: Peer, frame: Vec<u8>) {
        self.sent.push_back((Some(to), frame));
    }

    fn multicast(&mut self, frame: Vec<u8>) {
        self.sent.push_back((None, frame));
    }
}

// ============================================================================
// Timer
// ============================================================================

/// Deadline scheduling.
///
/// Fires are delivered as [`crate::replica::ReplicaEvent::Timeout`]
/// events into the input queue. Tokens carry the view they were armed
/// in, so a late fire of a canceled or superseded timer is ignored by
/// the engine rather than racing the cancellation.
pub trait TimerService {
    fn schedule(&mut self, token: TimerToken, delay: Duration);
    fn cancel(&mut self, token: TimerToken);
}

/// Records schedule/cancel calls without any real clock.
#[derive(Debug, Default)]
pub struct RecordingTimers {
    pub scheduled: Vec<(TimerToken, Duration)>,
    pub canceled: Vec<TimerToken>,
}

impl RecordingTimers {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when `token` was scheduled and not subsequently canceled.
    pub fn is_armed(&self, token: TimerToken) -> bool {
        self.scheduled.iter().any(|(t, _)| *t == token)
            && !self.canceled.contains(&token)
    }
}

impl TimerService for RecordingTimers {
    fn schedule(&mut self, token: TimerToken, delay: Duration) {
        self.scheduled.push((token, delay));
    }

    fn cancel(&mut self, token: TimerToken) {
        self.canceled.push(token);
    }
}

// ============================================================================
// State Machine
// ============================================================================

/// The replicated application.
///
/// `apply` must be deterministic and pure over the committed sequence:
/// two replicas applying the same operations in the same order must
/// produce the same results and the same state digests.
pub trait StateMachine {
    /// Applies one committed operation and returns its result.
    fn apply(&mut self, operation: &[u8]) -> Vec<u8>;

    /// A digest of the current application state, used in CHECKPOINTs.
    fn state_digest(&self) -> Hash;
}

/// Test application: echoes each operation back and digests the applied
/// history.
#[derive(Debug, Clone, Default)]
pub struct EchoStateMachine {
    applied: Vec<Vec<u8>>,
}

impl EchoStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Operations applied so far, in order.
    pub fn applied(&self) -> &[Vec<u8>] {
        &self.applied
    }
}

impl StateMachine for EchoStateMachine {
    fn apply(&mut self, operation: &[u8]) -> Vec<u8> {
        self.applied.push(operation.to_vec());
        operation.to_vec()
    }

    fn state_digest(&self) -> Hash {
        let mut bytes = Vec::new();
        for op in &self.applied {
            bytes.extend_from_slice(&(op.len() as u32).to_be_bytes());
            bytes.extend_from_slice(op);
        }
        hash_bytes(&bytes)
    }
}

// ============================================================================
// Checkpoint Store
// ============================================================================

/// Durable record of stable checkpoints.
pub trait CheckpointStore {
    /// Persists the state digest of a newly stable checkpoint.
    fn save(&mut self, seq: SeqNumber, state_digest: Hash);

    /// Discards persisted log state below `seq`.
    fn truncate_below(&mut self, seq: SeqNumber);
}

/// In-memory checkpoint store for tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryCheckpointStore {
    pub saved: Vec<(SeqNumber, Hash)>,
    pub truncated_below: Option<SeqNumber>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn save(&mut self, seq: SeqNumber, state_digest: Hash) {
        self.saved.push((seq, state_digest));
    }

    fn truncate_below(&mut self, seq: SeqNumber) {
        self.truncated_below = Some(seq);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echo_state_machine_is_deterministic() {
        let mut a = EchoStateMachine::new();
        let mut b = EchoStateMachine::new();
        assert_eq!(a.apply(b"x"), b"x");
        let _ = b.apply(b"x");
        assert_eq!(a.state_digest(), b.state_digest());

        let _ = a.apply(b"y");
        assert_ne!(a.state_digest(), b.state_digest());
    }

    #[test]
    fn queue_transport_preserves_order() {
        let mut transport = QueueTransport::new();
        transport.multicast(vec![1]);
        transport.send(Peer::Replica(pyrite_types::ReplicaId::new(2)), vec![2]);
        let sent = transport.drain();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0], (None, vec![1]));
    }
}
