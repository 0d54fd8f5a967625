//! BLAKE3 digests.
//!
//! All protocol digests (request digests, hash-chain links, checkpoint
//! state digests) go through [`hash_bytes`] so the hash function is chosen
//! in exactly one place.

use blake3::Hasher;
use pyrite_types::Hash;

/// Hashes `bytes` with BLAKE3 into a protocol [`struct@Hash`].
pub fn hash_bytes(bytes: &[u8]) -> Hash {
    let mut hasher = Hasher::new();
    hasher.update(bytes);
    Hash::new(*hasher.finalize().as_bytes())
}

/// Hashes several byte slices as if concatenated.
///
/// Callers that already hold the pieces avoid building an intermediate
/// buffer. The result equals `hash_bytes` of the concatenation.
pub fn hash_parts(parts: &[&[u8]]) -> Hash {
    let mut hasher = Hasher::new();
    for part in parts {
        hasher.update(part);
    }
    Hash::new(*hasher.finalize().as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic() {
        assert_eq!(hash_bytes(b"pyrite"), hash_bytes(b"pyrite"));
        assert_ne!(hash_bytes(b"pyrite"), hash_bytes(b"pyrit"));
    }

    #[test]
    fn parts_match_concatenation() {
        assert_eq!(hash_parts(&[b"ab", b"cd"]), hash_bytes(b"abcd"));
        assert_eq!(hash_parts(&[b"", b"abcd"]), hash_bytes(b"abcd"));
    }

    #[test]
    fn never_zero() {
        // The zero hash is reserved as a sentinel; real digests must differ.
        assert!(!hash_bytes(b"").is_zero());
    }
}
