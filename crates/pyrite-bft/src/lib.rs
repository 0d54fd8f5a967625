//! # pyrite-bft: BFT2f replication core
//!
//! A Byzantine-fault-tolerant state-machine replication engine
//! implementing BFT2f: PBFT's three-phase agreement extended with a
//! hash-chain version vector (HCV). With at most `f` of `N = 3f + 1`
//! replicas Byzantine the protocol is live and linearizable; with more
//! than `f` but at most `2f` faulty it degrades to *fork-\** consistency —
//! histories may diverge, but never silently, because every reply carries
//! the sender's chain head and clients cross-check them.
//!
//! ## Architecture
//!
//! The protocol engine ([`replica::ReplicaState`]) is a pure, single
//! ordering-point state machine: events in, `(state, output)` out, no
//! I/O and no clocks. The [`engine::Replica`] shell feeds it from a
//! bounded queue and dispatches its outputs to the runtime contracts in
//! [`contracts`]. The client side ([`client::ClientDriver`]) is the same
//! shape.
//!
//! - [`message`]: the eight protocol messages and their authenticated
//!   envelope
//! - [`hcv`]: the hash-chain version vector and misbehavior evidence
//! - [`log`]: per-sequence slots, certificates, watermarks
//! - [`replica`]: the three-phase agreement engine, view changes,
//!   checkpointing
//! - [`client`]: request submission, reply collation, fork-* detection
//! - [`superblock`]: the minimal persisted state
//! - [`config`] / [`contracts`] / [`instrumentation`]: the ambient pieces

pub mod client;
pub mod config;
pub mod contracts;
pub mod engine;
pub mod hcv;
pub mod instrumentation;
pub mod log;
pub mod message;
pub mod replica;
pub mod superblock;

#[cfg(test)]
mod tests;

// Re-export commonly used items
pub use client::{ClientAction, ClientDriver, ClientError, SubmitOutcome};
pub use config::ClusterConfig;
pub use contracts::{CheckpointStore, StateMachine, TimerService, Transport};
pub use engine::{EngineError, Replica};
pub use hcv::{MisbehaviorKind, MisbehaviorProof};
pub use instrumentation::{METRICS, MetricsSnapshot};
pub use log::{MessageLog, Slot, SlotStatus};
pub use message::{
    AuthKind, Authenticator, Checkpoint, Commit, Message, NewView, Payload, Peer, PrePrepare,
    Prepare, PreparedProof, Reply, Request, ViewChange,
};
pub use replica::{
    ClientEntry, Destination, Effect, ExecutedOp, Outbound, ReplicaEvent, ReplicaKeys,
    ReplicaOutput, ReplicaState, ReplicaStatus, TimeoutKind, TimerRequest, TimerToken,
};
pub use superblock::{
    MemorySuperblock, Superblock, SuperblockError, SuperblockRecord, SuperblockStorage,
};

// Re-export the scalar types callers need at every call site.
pub use pyrite_types::{
    ClientId, Hash, ReplicaId, RequestTimestamp, SeqNumber, ViewNumber,
};
