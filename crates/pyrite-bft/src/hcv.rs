//! Hash-chain version vector.
//!
//! The HCV is what distinguishes BFT2f from plain PBFT: a per-replica
//! scalar digest summarizing the executed prefix,
//!
//! ```text
//! hcv_n = H(hcv_{n-1} ‖ digest_n ‖ n ‖ view_n)        hcv_0 = genesis
//! ```
//!
//! propagated in every PREPARE, COMMIT, and REPLY. Two honest replicas
//! that executed the same prefix publish identical HCVs, so any fork of
//! the history leaves conflicting HCVs behind — divergence is detectable
//! even when more than `f` (but at most `2f`) replicas are Byzantine.
//!
//! Divergence is a *discovery*, not an authentication failure: the engine
//! never rejects a message because its HCV disagrees, it records the
//! conflict as evidence.

use serde::{Deserialize, Serialize};

use pyrite_crypto::digest::hash_bytes;
use pyrite_types::{Hash, SeqNumber, ViewNumber};
use pyrite_wire::CanonicalWriter;

use crate::message::Peer;

// ============================================================================
// Chain Operations
// ============================================================================

/// The well-known chain head before any operation has executed.
pub fn genesis() -> Hash {
    hash_bytes(b"pyrite:hcv:genesis:v1")
}

/// Extends the chain by one executed operation.
///
/// The preimage uses the canonical encoding so every implementation
/// derives bit-identical chains: `prev (32) ‖ digest (32) ‖ seq (u64 BE)
/// ‖ view (u64 BE)`.
pub fn extend(prev: Hash, digest: Hash, seq: SeqNumber, view: ViewNumber) -> Hash {
    let mut writer = CanonicalWriter::with_capacity(32 + 32 + 8 + 8);
    writer
        .put_hash(&prev)
        .put_hash(&digest)
        .put_u64(seq.as_u64())
        .put_u64(view.as_u64());
    hash_bytes(&writer.finish())
}

/// Replays a chain over an ordered run of `(seq, view, digest)` links.
///
/// Used on NEW-VIEW acceptance: each replica recomputes the chain over
/// the reconstructed log instead of trusting the new primary's value.
pub fn recompute(
    base: Hash,
    links: impl IntoIterator<Item = (SeqNumber, ViewNumber, Hash)>,
) -> Hash {
    let mut hcv = base;
    for (seq, view, digest) in links {
        hcv = extend(hcv, digest, seq, view);
    }
    hcv
}

// ============================================================================
// Misbehavior Evidence
// ============================================================================

/// What a retained piece of evidence demonstrates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MisbehaviorKind {
    /// Two different digests authenticated by the same sender for the
    /// same `(view, seq)` — primary equivocation when the sender is the
    /// primary.
    ConflictingDigest,

    /// Two different HCVs from the same sender at the same `(view, seq)`
    /// — the sender is presenting different histories to different peers.
    DivergentHcv,
}

/// Proof that a peer misbehaved: two conflicting values it authenticated
/// for the same slot.
///
/// Proofs are retained locally and surfaced in the engine output; whether
/// to gossip them is the embedding runtime's policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MisbehaviorProof {
    pub kind: MisbehaviorKind,
    pub accused: Peer,
    pub view: ViewNumber,
    pub seq: SeqNumber,
    /// The two conflicting values (digests or HCVs).
    pub first: Hash,
    pub second: Hash,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(byte: u8) -> Hash {
        Hash::new([byte; 32])
    }

    #[test]
    fn genesis_is_stable_and_nonzero() {
        assert_eq!(genesis(), genesis());
        assert!(!genesis().is_zero());
    }

    #[test]
    fn extend_is_deterministic() {
        let a = extend(genesis(), d(1), SeqNumber::new(1), ViewNumber::ZERO);
        let b = extend(genesis(), d(1), SeqNumber::new(1), ViewNumber::ZERO);
        assert_eq!(a, b);
    }

    #[test]
    fn every_input_matters() {
        let base = extend(genesis(), d(1), SeqNumber::new(1), ViewNumber::ZERO);
        assert_ne!(
            base,
            extend(genesis(), d(2), SeqNumber::new(1), ViewNumber::ZERO)
        );
        assert_ne!(
            base,
            extend(genesis(), d(1), SeqNumber::new(2), ViewNumber::ZERO)
        );
        assert_ne!(
            base,
            extend(genesis(), d(1), SeqNumber::new(1), ViewNumber::new(1))
        );
        assert_ne!(base, extend(d(9), d(1), SeqNumber::new(1), ViewNumber::ZERO));
    }

    #[test]
    fn recompute_matches_stepwise_extension() {
        let links = [
            (SeqNumber::new(1), ViewNumber::ZERO, d(1)),
            (SeqNumber::new(2), ViewNumber::ZERO, d(2)),
            (SeqNumber::new(3), ViewNumber::new(1), d(3)),
        ];

        let mut stepwise = genesis();
        for (seq, view, digest) in links {
            stepwise = extend(stepwise, digest, seq, view);
        }

        assert_eq!(recompute(genesis(), links), stepwise);
    }

    proptest::proptest! {
        #[test]
        fn flipping_any_link_changes_the_head(
            bytes in proptest::collection::vec(proptest::prelude::any::<[u8; 32]>(), 1..8),
            flip in 0usize..8,
        ) {
            let links: Vec<_> = bytes
                .iter()
                .enumerate()
                .map(|(i, b)| (SeqNumber::new(i as u64 + 1), ViewNumber::ZERO, Hash::new(*b)))
                .collect();

            // Determinism: replay yields the same head.
            proptest::prop_assert_eq!(
                recompute(genesis(), links.clone()),
                recompute(genesis(), links.clone())
            );

            // Tamper-evidence: corrupting one digest anywhere in the
            // prefix changes the head.
            let flip = flip % links.len();
            let mut mutated = links.clone();
            mutated[flip].2 = Hash::new([!bytes[flip][0]; 32]);
            proptest::prop_assert_ne!(recompute(genesis(), links), recompute(genesis(), mutated));
        }
    }

    #[test]
    fn same_prefix_same_chain_different_prefix_different_chain() {
        let prefix_a = [
            (SeqNumber::new(1), ViewNumber::ZERO, d(1)),
            (SeqNumber::new(2), ViewNumber::ZERO, d(2)),
        ];
        let prefix_b = [
            (SeqNumber::new(1), ViewNumber::ZERO, d(1)),
            (SeqNumber::new(2), ViewNumber::ZERO, d(3)),
        ];
        assert_eq!(recompute(genesis(), prefix_a), recompute(genesis(), prefix_a));
        assert_ne!(recompute(genesis(), prefix_a), recompute(genesis(), prefix_b));
    }
}
