//! # pyrite-wire: Canonical binary encoding for `Pyrite`
//!
//! Two layers live here:
//!
//! - [`canonical`]: the pinned deterministic encoding used for every byte
//!   string that gets hashed or signed — fixed big-endian integer widths,
//!   `u32` length prefixes, no padding, no optionality. Two
//!   implementations on two machines must produce identical bytes or the
//!   hash chain falls apart, so nothing self-describing is allowed here.
//! - [`frame`]: the transport framing for whole messages — a fixed
//!   preamble `{tag, view, sender}`, a length-prefixed `postcard` payload,
//!   and a trailing length-prefixed authenticator.
//!
//! Digests are computed over canonical request bytes only, never over
//! transport framing.

pub mod canonical;
pub mod frame;

pub use canonical::{CanonicalReader, CanonicalWriter, canonical_request_bytes};
pub use frame::{Frame, decode_frame, encode_frame};

use thiserror::Error;

/// Errors raised while decoding wire bytes.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    /// Input ended before the declared structure was complete.
    #[error("truncated input: needed {needed} more bytes")]
    Truncated { needed: usize },

    /// Unknown message tag byte.
    #[error("unknown message tag {tag:#04x}")]
    BadTag { tag: u8 },

    /// A length prefix exceeded the remaining input or a sanity bound.
    #[error("implausible length prefix {length}")]
    BadLength { length: u64 },

    /// Input had bytes left over after the structure was fully decoded.
    #[error("{0} trailing bytes after frame")]
    TrailingBytes(usize),

    /// The framed payload failed `postcard` deserialization.
    #[error("payload decode failed: {0}")]
    Payload(String),
}
