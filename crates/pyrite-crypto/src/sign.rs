//! Ed25519 signing for requests and view-change evidence.
//!
//! Public-key signatures are used where a single message must convince any
//! future recipient: client REQUESTs, VIEW-CHANGE, and NEW-VIEW. The
//! per-hop agreement traffic uses [`crate::mac`] instead.
//!
//! Signatures are computed over caller-supplied canonical bytes; the
//! canonical encodings themselves are pinned by `pyrite-wire`.

use ed25519_dalek::{Signer, Verifier};
use serde::{Deserialize, Serialize};

use crate::CryptoError;

/// An Ed25519 signing (private) key.
#[derive(Clone)]
pub struct SigningKey {
    inner: ed25519_dalek::SigningKey,
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        f.debug_struct("SigningKey").finish_non_exhaustive()
    }
}

impl SigningKey {
    /// Generates a fresh random key.
    pub fn generate() -> Self {
        let mut rng = rand::rngs::OsRng;
        Self {
            inner: ed25519_dalek::SigningKey::generate(&mut rng),
        }
    }

    /// Reconstructs a key from its 32 secret bytes.
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            inner: ed25519_dalek::SigningKey::from_bytes(bytes),
        }
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.inner.to_bytes()
    }

    /// Returns the matching public key.
    pub fn verifying_key(&self) -> VerifyingKey {
        VerifyingKey {
            inner: self.inner.verifying_key(),
        }
    }

    /// Signs the given canonical bytes.
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature {
            bytes: self.inner.sign(message).to_bytes(),
        }
    }
}

/// An Ed25519 verifying (public) key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyingKey {
    inner: ed25519_dalek::VerifyingKey,
}

impl VerifyingKey {
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, CryptoError> {
        let inner = ed25519_dalek::VerifyingKey::from_bytes(bytes)
            .map_err(|_| CryptoError::MalformedKey)?;
        Ok(Self { inner })
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.inner.to_bytes()
    }

    /// Verifies `signature` over `message`.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<(), CryptoError> {
        let sig = ed25519_dalek::Signature::from_bytes(&signature.bytes);
        self.inner
            .verify(message, &sig)
            .map_err(|_| CryptoError::BadSignature)
    }
}

/// A detached Ed25519 signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    #[serde(with = "serde_sig_bytes")]
    bytes: [u8; 64],
}

impl Signature {
    pub fn from_bytes(bytes: &[u8; 64]) -> Self {
        Self { bytes: *bytes }
    }

    /// Parses a signature from a variable-length slice.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; 64] = bytes
            .try_into()
            .map_err(|_| CryptoError::MalformedSignature {
                expected: 64,
                actual: bytes.len(),
            })?;
        Ok(Self { bytes: arr })
    }

    pub fn to_bytes(&self) -> [u8; 64] {
        self.bytes
    }
}

// serde does not derive for [u8; 64]; encode as a byte sequence.
mod serde_sig_bytes {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 64], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<[u8; 64], D::Error> {
        let v: Vec<u8> = Deserialize::deserialize(de)?;
        v.try_into()
            .map_err(|v: Vec<u8>| D::Error::custom(format!("expected 64 bytes, got {}", v.len())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_roundtrip() {
        let key = SigningKey::generate();
        let sig = key.sign(b"request bytes");
        assert!(key.verifying_key().verify(b"request bytes", &sig).is_ok());
    }

    #[test]
    fn tampered_message_rejected() {
        let key = SigningKey::generate();
        let sig = key.sign(b"request bytes");
        assert_eq!(
            key.verifying_key().verify(b"other bytes", &sig),
            Err(CryptoError::BadSignature)
        );
    }

    #[test]
    fn wrong_key_rejected() {
        let key = SigningKey::generate();
        let other = SigningKey::generate();
        let sig = key.sign(b"request bytes");
        assert_eq!(
            other.verifying_key().verify(b"request bytes", &sig),
            Err(CryptoError::BadSignature)
        );
    }

    #[test]
    fn signature_slice_length_checked() {
        assert_eq!(
            Signature::from_slice(&[0u8; 63]),
            Err(CryptoError::MalformedSignature {
                expected: 64,
                actual: 63
            })
        );
    }

    #[test]
    fn key_bytes_roundtrip() {
        let key = SigningKey::generate();
        let restored = SigningKey::from_bytes(&key.to_bytes());
        assert_eq!(key.verifying_key(), restored.verifying_key());
    }
}
