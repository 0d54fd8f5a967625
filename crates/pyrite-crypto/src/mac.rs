//! Pairwise message authenticators.
//!
//! The agreement-phase messages (PRE-PREPARE, PREPARE, COMMIT, REPLY,
//! CHECKPOINT) are authenticated with per-pair symmetric keys rather than
//! signatures: the sender computes one HMAC per intended recipient and
//! ships the whole vector, and each recipient checks only its own entry.
//! This is the classic PBFT authenticator construction; it is cheap but
//! cannot convince a third party, which is why view-change evidence is
//! signed instead (see [`crate::sign`]).
//!
//! The keychain is generic over the peer identifier so replicas can key
//! it by replica id and clients by replica id as well, while a replica's
//! chain can also hold client keys.

use std::collections::HashMap;
use std::hash::Hash as StdHash;

use hmac::{Hmac, Mac as HmacMac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::CryptoError;

type HmacSha256 = Hmac<Sha256>;

/// Truncated-HMAC output length. 16 bytes keeps authenticator vectors
/// small while leaving a 128-bit forgery bound.
pub const MAC_LEN: usize = 16;

// ============================================================================
// MacKey
// ============================================================================

/// A 256-bit pairwise symmetric key.
///
/// Both endpoints of a pair hold the same key; direction is not encoded.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct MacKey([u8; 32]);

impl std::fmt::Debug for MacKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        f.debug_struct("MacKey").finish_non_exhaustive()
    }
}

impl MacKey {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Generates a fresh random key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        getrandom::fill(&mut bytes).expect("OS entropy source unavailable");
        Self(bytes)
    }
}

// ============================================================================
// Mac
// ============================================================================

/// A single truncated HMAC-SHA256 authenticator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mac(pub [u8; MAC_LEN]);

// ============================================================================
// MacKeychain
// ============================================================================

/// Holds this party's pairwise keys, indexed by peer identifier.
#[derive(Debug, Clone)]
pub struct MacKeychain<P: Eq + StdHash + Copy> {
    keys: HashMap<P, MacKey>,
}

impl<P: Eq + StdHash + Copy> Default for MacKeychain<P> {
    fn default() -> Self {
        Self {
            keys: HashMap::new(),
        }
    }
}

impl<P: Eq + StdHash + Copy> MacKeychain<P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the pairwise key shared with `peer`.
    pub fn insert(&mut self, peer: P, key: MacKey) {
        self.keys.insert(peer, key);
    }

    /// Computes the authenticator for `bytes` addressed to `peer`.
    pub fn authenticate(&self, peer: P, bytes: &[u8]) -> Result<Mac, CryptoError> {
        let key = self.keys.get(&peer).ok_or(CryptoError::UnknownPeer)?;
        let mut hmac =
            HmacSha256::new_from_slice(&key.0).expect("HMAC accepts any key length");
        hmac.update(bytes);
        let tag = hmac.finalize().into_bytes();
        let mut out = [0u8; MAC_LEN];
        out.copy_from_slice(&tag[..MAC_LEN]);
        Ok(Mac(out))
    }

    /// Computes one authenticator per peer in `recipients`, in order.
    pub fn authenticate_all(
        &self,
        recipients: impl IntoIterator<Item = P>,
        bytes: &[u8],
    ) -> Result<AuthVector<P>, CryptoError> {
        let mut macs = Vec::new();
        for peer in recipients {
            macs.push((peer, self.authenticate(peer, bytes)?));
        }
        Ok(AuthVector { macs })
    }

    /// Checks the authenticator claimed by `peer` over `bytes`.
    ///
    /// Unknown peers verify as false rather than erroring: an authenticator
    /// from a party we share no key with is simply not authentic.
    pub fn verify(&self, peer: P, bytes: &[u8], mac: &Mac) -> bool {
        let Some(key) = self.keys.get(&peer) else {
            return false;
        };
        let mut hmac =
            HmacSha256::new_from_slice(&key.0).expect("HMAC accepts any key length");
        hmac.update(bytes);
        // Constant-time comparison over the truncated tag.
        hmac.finalize().into_bytes()[..MAC_LEN]
            .iter()
            .zip(mac.0.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

// ============================================================================
// AuthVector
// ============================================================================

/// One authenticator per intended recipient.
///
/// Recipients look up their own entry with [`AuthVector::for_peer`] and
/// ignore the rest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthVector<P: Eq + StdHash + Copy> {
    macs: Vec<(P, Mac)>,
}

impl<P: Eq + StdHash + Copy> AuthVector<P> {
    /// Returns the authenticator addressed to `peer`, if present.
    pub fn for_peer(&self, peer: P) -> Option<&Mac> {
        self.macs.iter().find(|(p, _)| *p == peer).map(|(_, m)| m)
    }

    pub fn len(&self) -> usize {
        self.macs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.macs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paired_chains() -> (MacKeychain<u8>, MacKeychain<u8>) {
        let key = MacKey::generate();
        let mut a = MacKeychain::new();
        let mut b = MacKeychain::new();
        a.insert(1, key);
        b.insert(0, key);
        (a, b)
    }

    #[test]
    fn authenticate_verify_roundtrip() {
        let (a, b) = paired_chains();
        let mac = a.authenticate(1, b"prepare bytes").unwrap();
        assert!(b.verify(0, b"prepare bytes", &mac));
    }

    #[test]
    fn tampered_bytes_rejected() {
        let (a, b) = paired_chains();
        let mac = a.authenticate(1, b"prepare bytes").unwrap();
        assert!(!b.verify(0, b"commit bytes", &mac));
    }

    #[test]
    fn wrong_key_rejected() {
        let (a, _) = paired_chains();
        let mut c = MacKeychain::new();
        c.insert(0, MacKey::generate());
        let mac = a.authenticate(1, b"prepare bytes").unwrap();
        assert!(!c.verify(0, b"prepare bytes", &mac));
    }

    #[test]
    fn unknown_peer_errors_on_send_and_fails_on_verify() {
        let chain: MacKeychain<u8> = MacKeychain::new();
        assert_eq!(
            chain.authenticate(7, b"x").unwrap_err(),
            CryptoError::UnknownPeer
        );
        assert!(!chain.verify(7, b"x", &Mac([0u8; MAC_LEN])));
    }

    #[test]
    fn auth_vector_lookup() {
        let key = MacKey::generate();
        let mut chain = MacKeychain::new();
        chain.insert(1, key);
        chain.insert(2, key);
        let vector = chain.authenticate_all([1u8, 2u8], b"broadcast").unwrap();
        assert_eq!(vector.len(), 2);
        assert!(vector.for_peer(1).is_some());
        assert!(vector.for_peer(3).is_none());
    }
}
