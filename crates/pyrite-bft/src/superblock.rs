//! Minimal persisted replica state.
//!
//! Per replica the protocol persists only what §restart needs: current
//! view, highest executed sequence and its HCV, and the last stable
//! checkpoint with its `2f + 1` proof. Records are written round-robin
//! across a few fixed slots, each carrying a monotonic write sequence and
//! a BLAKE3 checksum — a write torn by a crash invalidates one slot and
//! recovery falls back to the newest intact copy.
//!
//! The restarted replica re-enters with `Recovering` status
//! ([`crate::replica::ReplicaState::recover`]) and rejoins once it
//! observes the cluster's stable checkpoint reach its own position. The
//! caller must pair the record with an application state machine at the
//! recorded executed prefix.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use pyrite_crypto::digest::hash_bytes;
use pyrite_types::{Hash, ReplicaId, SeqNumber, ViewNumber};
use pyrite_wire::{CanonicalReader, CanonicalWriter};

use crate::message::Checkpoint;

/// Number of redundant record slots.
pub const SUPERBLOCK_COPIES: usize = 4;

// ============================================================================
// Errors
// ============================================================================

/// Errors from superblock persistence.
#[derive(Debug, Error)]
pub enum SuperblockError {
    /// The underlying storage failed.
    #[error("superblock storage: {0}")]
    Storage(String),

    /// No slot held an intact record.
    #[error("no valid superblock copy found")]
    NoValidCopy,

    /// Record serialization failed.
    #[error("superblock encode: {0}")]
    Encode(String),
}

// ============================================================================
// Record
// ============================================================================

/// One persisted snapshot of a replica's durable protocol state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuperblockRecord {
    pub replica_id: ReplicaId,

    /// Monotonic write counter; recovery picks the highest intact one.
    pub sequence: u64,

    pub view: ViewNumber,
    pub last_executed: SeqNumber,

    /// The chain value after `last_executed`.
    pub hcv: Hash,

    pub last_stable: SeqNumber,

    /// The `2f + 1` matching checkpoints proving `last_stable`.
    pub stable_proof: Vec<Checkpoint>,
}

// ============================================================================
// Storage Contract
// ============================================================================

/// Raw slot storage beneath the superblock.
pub trait SuperblockStorage {
    /// Reads slot `index`, or `None` if never written.
    fn read_slot(&self, index: usize) -> Option<Vec<u8>>;

    /// Overwrites slot `index`.
    fn write_slot(&mut self, index: usize, bytes: &[u8]) -> Result<(), SuperblockError>;
}

/// In-memory slot storage for tests, with data cloning hooks so crash
/// scenarios can snapshot and restore raw bytes.
#[derive(Debug, Clone, Default)]
pub struct MemorySuperblock {
    slots: Vec<Option<Vec<u8>>>,
}

impl MemorySuperblock {
    pub fn new() -> Self {
        Self {
            slots: vec![None; SUPERBLOCK_COPIES],
        }
    }

    /// Reconstructs storage from previously captured raw bytes.
    pub fn from_data(slots: Vec<Option<Vec<u8>>>) -> Self {
        Self { slots }
    }

    /// Captures the raw slot bytes.
    pub fn clone_data(&self) -> Vec<Option<Vec<u8>>> {
        self.slots.clone()
    }
}

impl SuperblockStorage for MemorySuperblock {
    fn read_slot(&self, index: usize) -> Option<Vec<u8>> {
        self.slots.get(index).cloned().flatten()
    }

    fn write_slot(&mut self, index: usize, bytes: &[u8]) -> Result<(), SuperblockError> {
        if index >= self.slots.len() {
            return Err(SuperblockError::Storage(format!("slot {index} out of range")));
        }
        self.slots[index] = Some(bytes.to_vec());
        Ok(())
    }
}

// ============================================================================
// Superblock
// ============================================================================

/// The replica's durable state, maintained over redundant checksummed
/// slots.
#[derive(Debug)]
pub struct Superblock<S: SuperblockStorage> {
    storage: S,
    current: SuperblockRecord,
}

impl<S: SuperblockStorage> Superblock<S> {
    /// Initializes fresh storage for a new replica.
    pub fn create(storage: S, replica_id: ReplicaId) -> Result<Self, SuperblockError> {
        let record = SuperblockRecord {
            replica_id,
            sequence: 1,
            view: ViewNumber::ZERO,
            last_executed: SeqNumber::ZERO,
            hcv: crate::hcv::genesis(),
            last_stable: SeqNumber::ZERO,
            stable_proof: Vec::new(),
        };
        let mut sb = Self {
            storage,
            current: record,
        };
        sb.write_current()?;
        Ok(sb)
    }

    /// Opens existing storage, recovering the newest intact record.
    pub fn open(storage: S) -> Result<Self, SuperblockError> {
        let mut best: Option<SuperblockRecord> = None;
        for index in 0..SUPERBLOCK_COPIES {
            let Some(bytes) = storage.read_slot(index) else {
                continue;
            };
            let Some(record) = decode_record(&bytes) else {
                // Torn or corrupt write; fall back to an older copy.
                continue;
            };
            if best.as_ref().is_none_or(|b| record.sequence > b.sequence) {
                best = Some(record);
            }
        }

        let current = best.ok_or(SuperblockError::NoValidCopy)?;
        Ok(Self { storage, current })
    }

    /// Persists a new durable state snapshot.
    pub fn update(
        &mut self,
        view: ViewNumber,
        last_executed: SeqNumber,
        hcv: Hash,
        last_stable: SeqNumber,
        stable_proof: Vec<Checkpoint>,
    ) -> Result<(), SuperblockError> {
        self.current = SuperblockRecord {
            replica_id: self.current.replica_id,
            sequence: self.current.sequence + 1,
            view,
            last_executed,
            hcv,
            last_stable,
            stable_proof,
        };
        self.write_current()
    }

    fn write_current(&mut self) -> Result<(), SuperblockError> {
        let index = (self.current.sequence as usize) % SUPERBLOCK_COPIES;
        let bytes = encode_record(&self.current)?;
        self.storage.write_slot(index, &bytes)
    }

    pub fn record(&self) -> &SuperblockRecord {
        &self.current
    }

    pub fn view(&self) -> ViewNumber {
        self.current.view
    }

    pub fn last_executed(&self) -> SeqNumber {
        self.current.last_executed
    }

    pub fn hcv(&self) -> Hash {
        self.current.hcv
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }
}

// ============================================================================
// Slot Encoding
// ============================================================================

// Slot layout: payload length, postcard payload, BLAKE3 checksum of the
// payload. A partial write fails either the length or the checksum.
fn encode_record(record: &SuperblockRecord) -> Result<Vec<u8>, SuperblockError> {
    let payload =
        postcard::to_allocvec(record).map_err(|e| SuperblockError::Encode(e.to_string()))?;
    let checksum = hash_bytes(&payload);
    let mut writer = CanonicalWriter::with_capacity(4 + payload.len() + 32);
    writer.put_bytes(&payload).put_hash(&checksum);
    Ok(writer.finish())
}

fn decode_record(bytes: &[u8]) -> Option<SuperblockRecord> {
    let mut reader = CanonicalReader::new(bytes);
    let payload = reader.get_bytes().ok()?;
    let checksum = reader.get_hash().ok()?;
    reader.expect_end().ok()?;
    if hash_bytes(&payload) != checksum {
        return None;
    }
    postcard::from_bytes(&payload).ok()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn hcv_at(n: u64) -> Hash {
        Hash::new([n as u8; 32])
    }

    #[test]
    fn create_then_open_roundtrip() {
        let sb = Superblock::create(MemorySuperblock::new(), ReplicaId::new(2)).expect("create");
        let reopened =
            Superblock::open(MemorySuperblock::from_data(sb.storage().clone_data())).expect("open");
        assert_eq!(reopened.record(), sb.record());
        assert_eq!(reopened.view(), ViewNumber::ZERO);
    }

    #[test]
    fn survives_partial_write() {
        // Simulate a crash during a superblock update.
        let mut sb = Superblock::create(MemorySuperblock::new(), ReplicaId::new(0)).expect("create");

        sb.update(
            ViewNumber::new(1),
            SeqNumber::new(10),
            hcv_at(10),
            SeqNumber::ZERO,
            vec![],
        )
        .expect("update");
        sb.update(
            ViewNumber::new(2),
            SeqNumber::new(20),
            hcv_at(20),
            SeqNumber::ZERO,
            vec![],
        )
        .expect("update");

        // Capture storage before the next write, then "crash" mid-write
        // by reverting to it.
        let stable_data = sb.storage().clone_data();
        sb.update(
            ViewNumber::new(3),
            SeqNumber::new(30),
            hcv_at(30),
            SeqNumber::ZERO,
            vec![],
        )
        .expect("update");

        let recovered = Superblock::open(MemorySuperblock::from_data(stable_data)).expect("open");
        assert_eq!(recovered.view(), ViewNumber::new(2));
        assert_eq!(recovered.last_executed(), SeqNumber::new(20));
        assert_eq!(recovered.hcv(), hcv_at(20));
    }

    #[test]
    fn corrupt_newest_copy_falls_back() {
        let mut sb = Superblock::create(MemorySuperblock::new(), ReplicaId::new(0)).expect("create");
        for n in 1..=3u64 {
            sb.update(
                ViewNumber::new(n),
                SeqNumber::new(n * 10),
                hcv_at(n),
                SeqNumber::ZERO,
                vec![],
            )
            .expect("update");
        }

        // Flip a byte in the newest copy (sequence 4 lives in slot 0).
        let mut data = sb.storage().clone_data();
        let newest = (sb.record().sequence as usize) % SUPERBLOCK_COPIES;
        if let Some(Some(bytes)) = data.get_mut(newest) {
            let last = bytes.len() - 1;
            bytes[last] ^= 0xFF;
        }

        let recovered = Superblock::open(MemorySuperblock::from_data(data)).expect("open");
        assert_eq!(recovered.view(), ViewNumber::new(2));
    }

    #[test]
    fn all_copies_cycled() {
        let mut sb = Superblock::create(MemorySuperblock::new(), ReplicaId::new(0)).expect("create");
        for n in 1..=5u64 {
            sb.update(
                ViewNumber::new(n),
                SeqNumber::new(n * 10),
                hcv_at(n),
                SeqNumber::ZERO,
                vec![],
            )
            .expect("update");
        }

        let recovered =
            Superblock::open(MemorySuperblock::from_data(sb.storage().clone_data())).expect("open");
        assert_eq!(recovered.view(), ViewNumber::new(5));
        assert_eq!(recovered.record().sequence, 6);
    }

    #[test]
    fn empty_storage_refuses_open() {
        assert!(matches!(
            Superblock::open(MemorySuperblock::new()),
            Err(SuperblockError::NoValidCopy)
        ));
    }
}
