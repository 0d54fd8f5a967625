//! BFT2f replica state machine.
//!
//! The protocol engine is a pure, deterministic state machine: it takes
//! one event at a time and returns the successor state plus everything
//! the runtime should do — messages to send, timers to arm or cancel,
//! checkpoint effects, misbehavior proofs, executed operations. No I/O,
//! no clocks, no randomness happen in here, which is what makes the
//! `(view, seq, digest, hcv)` invariants locally checkable without locks
//! and lets many replicas coexist in one test process.
//!
//! # Protocol Overview
//!
//! ## Normal Operation
//!
//! ```text
//! Client ──Request──► Primary
//!                       │
//!                       ├──PrePrepare──► Backups
//!                       │                  │
//!                       │◄────Prepare──────┤  (all-to-all)
//!                       │                  │
//!                       │◄────Commit───────┤  (all-to-all)
//!                       │                  │
//! Client ◄────Reply─────┴──────────────────┘  (each replica, post-execution)
//! ```
//!
//! ## View Change
//!
//! ```text
//! Backup ──ViewChange(v+1, prepared certs, checkpoint proof)──► All
//!            │
//!            ▼ (2f+1 at the new primary)
//! Primary(v+1) ──NewView(view-change set, implied pre-prepares)──► All
//! ```
//!
//! # Key Types
//!
//! - [`ReplicaState`]: the core state machine
//! - [`ReplicaEvent`]: inputs (messages, timer fires)
//! - [`ReplicaOutput`]: outputs (messages, timers, effects, proofs)

mod checkpoint;
mod normal;
mod state;
mod view_change;

pub use state::{ClientEntry, ReplicaKeys, ReplicaState, ReplicaStatus};

use std::time::Duration;

use pyrite_types::{ClientId, Hash, ReplicaId, RequestTimestamp, SeqNumber, ViewNumber};

use crate::hcv::MisbehaviorProof;
use crate::message::{Message, Payload, Peer};

// ============================================================================
// Replica Event
// ============================================================================

/// Inputs that can drive replica state transitions.
///
/// The runtime serializes all inputs — network messages, timer fires —
/// onto one queue and feeds them in one at a time.
#[derive(Debug, Clone)]
pub enum ReplicaEvent {
    /// A protocol message arrived (already MAC-verified by the shell).
    Message(Message),

    /// A timer armed by a previous output fired.
    Timeout(TimerToken),
}

// ============================================================================
// Timers
// ============================================================================

/// Identifies one armed timer.
///
/// Tokens carry the view they were armed in: a fire whose view no longer
/// matches the replica's is stale and ignored, which is how late fires of
/// canceled timers are made harmless.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerToken {
    pub kind: TimeoutKind,
    pub view: ViewNumber,
}

/// Types of timeouts that can fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimeoutKind {
    /// A backup forwarded this client's request to the primary and is
    /// waiting for the matching pre-prepare.
    Request(ClientId),

    /// The view change in progress has not completed in time.
    ViewChange,
}

/// A timer action requested from the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerRequest {
    Schedule { token: TimerToken, delay: Duration },
    Cancel { token: TimerToken },
}

// ============================================================================
// Effects
// ============================================================================

/// Side effects for the runtime's checkpoint store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// A checkpoint became stable; persist its state digest.
    SaveCheckpoint { seq: SeqNumber, state_digest: Hash },

    /// Log state below `seq` is garbage; drop it from durable storage.
    TruncateBelow { seq: SeqNumber },
}

// ============================================================================
// Outbound Messages
// ============================================================================

/// Where an outgoing message should go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    /// One specific participant.
    Peer(Peer),

    /// Every replica except the sender.
    Broadcast,
}

/// An outgoing message plus its destination.
///
/// Messages leave the engine unauthenticated; the shell attaches the MAC
/// vector when it knows the concrete recipient set.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub to: Destination,
    pub message: Message,
}

/// A record of one executed operation, for the runtime and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutedOp {
    pub seq: SeqNumber,
    /// `None` for null no-op slots inserted by a view change.
    pub client: Option<(ClientId, RequestTimestamp)>,
}

// ============================================================================
// Replica Output
// ============================================================================

/// Everything a state transition asks the runtime to do.
#[derive(Debug, Default)]
pub struct ReplicaOutput {
    /// Messages to hand to the transport.
    pub messages: Vec<Outbound>,

    /// Timers to arm or cancel.
    pub timers: Vec<TimerRequest>,

    /// Checkpoint store effects.
    pub effects: Vec<Effect>,

    /// Misbehavior evidence collected while processing this event.
    /// Retained in the state as well; surfaced here so the runtime can
    /// gossip it if its policy says to.
    pub proofs: Vec<MisbehaviorProof>,

    /// Operations executed against the application, in sequence order.
    pub executed: Vec<ExecutedOp>,
}

impl ReplicaOutput {
    /// Creates an empty output.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Creates output carrying only messages.
    pub fn with_messages(messages: Vec<Outbound>) -> Self {
        Self {
            messages,
            ..Self::default()
        }
    }

    /// Returns true if nothing was produced.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
            && self.timers.is_empty()
            && self.effects.is_empty()
            && self.proofs.is_empty()
            && self.executed.is_empty()
    }

    /// Merges another output into this one, preserving order.
    pub fn merge(&mut self, other: ReplicaOutput) {
        self.messages.extend(other.messages);
        self.timers.extend(other.timers);
        self.effects.extend(other.effects);
        self.proofs.extend(other.proofs);
        self.executed.extend(other.executed);
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Creates an outbound message to a specific participant.
pub(crate) fn msg_to(from: ReplicaId, to: impl Into<Peer>, payload: Payload) -> Outbound {
    crate::instrumentation::METRICS.increment_messages_sent(payload.name());
    Outbound {
        to: Destination::Peer(to.into()),
        message: Message::new(from, payload),
    }
}

/// Creates an outbound broadcast to all other replicas.
pub(crate) fn msg_broadcast(from: ReplicaId, payload: Payload) -> Outbound {
    crate::instrumentation::METRICS.increment_messages_sent(payload.name());
    Outbound {
        to: Destination::Broadcast,
        message: Message::new(from, payload),
    }
}
