//! # pyrite-crypto: Cryptographic primitives for `Pyrite`
//!
//! Three capabilities, matching what the protocol core consumes:
//!
//! - [`digest`]: BLAKE3 hashing for request digests, hash-chain versions,
//!   and checkpoint state digests
//! - [`sign`]: Ed25519 signatures for messages that must convince any
//!   future recipient (client requests, view-change evidence)
//! - [`mac`]: pairwise HMAC-SHA256 authenticators for the high-volume
//!   agreement messages, one authenticator per intended recipient
//!
//! Keys are read-only after initialization; nothing in this crate holds
//! mutable shared state.

pub mod digest;
pub mod mac;
pub mod sign;

pub use digest::hash_bytes;
pub use mac::{AuthVector, Mac, MacKey, MacKeychain};
pub use sign::{Signature, SigningKey, VerifyingKey};

use thiserror::Error;

/// Errors from key or signature material handling.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    /// Key bytes did not form a valid public key.
    #[error("malformed verifying key")]
    MalformedKey,

    /// Signature bytes had the wrong length.
    #[error("malformed signature: expected {expected} bytes, got {actual}")]
    MalformedSignature { expected: usize, actual: usize },

    /// Signature verification failed.
    #[error("signature verification failed")]
    BadSignature,

    /// No pairwise MAC key is held for the named peer.
    #[error("no MAC key for peer")]
    UnknownPeer,
}
