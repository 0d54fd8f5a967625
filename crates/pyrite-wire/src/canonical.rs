//! The pinned canonical encoding.
//!
//! Rules:
//! - integers in fixed big-endian widths
//! - variable-length byte strings prefixed with a `u32` length
//! - fields in declaration order, no padding, nothing optional
//!
//! Every digest and signature preimage in the protocol is produced by a
//! [`CanonicalWriter`]; changing anything here is a wire-format break.

use bytes::{Buf, BufMut, BytesMut};
use pyrite_types::Hash;

use crate::WireError;

/// Maximum accepted length prefix (16 MiB). Bounds allocation when
/// decoding input from untrusted peers.
pub const MAX_FIELD_LEN: u32 = 16 * 1024 * 1024;

// ============================================================================
// CanonicalWriter
// ============================================================================

/// Appends canonically encoded fields to a growable buffer.
#[derive(Debug, Default)]
pub struct CanonicalWriter {
    buf: BytesMut,
}

impl CanonicalWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    pub fn put_u8(&mut self, value: u8) -> &mut Self {
        self.buf.put_u8(value);
        self
    }

    pub fn put_u32(&mut self, value: u32) -> &mut Self {
        self.buf.put_u32(value);
        self
    }

    pub fn put_u64(&mut self, value: u64) -> &mut Self {
        self.buf.put_u64(value);
        self
    }

    /// Writes a `u32` length prefix followed by the bytes.
    pub fn put_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        debug_assert!(bytes.len() <= MAX_FIELD_LEN as usize);
        self.buf.put_u32(bytes.len() as u32);
        self.buf.put_slice(bytes);
        self
    }

    /// Writes a fixed-width 32-byte hash, no length prefix.
    pub fn put_hash(&mut self, hash: &Hash) -> &mut Self {
        self.buf.put_slice(hash.as_bytes());
        self
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf.to_vec()
    }
}

// ============================================================================
// CanonicalReader
// ============================================================================

/// Reads canonically encoded fields back out of a byte slice.
#[derive(Debug)]
pub struct CanonicalReader<'a> {
    buf: &'a [u8],
}

impl<'a> CanonicalReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn need(&self, len: usize) -> Result<(), WireError> {
        if self.buf.remaining() < len {
            return Err(WireError::Truncated {
                needed: len - self.buf.remaining(),
            });
        }
        Ok(())
    }

    pub fn get_u8(&mut self) -> Result<u8, WireError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn get_u32(&mut self) -> Result<u32, WireError> {
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    pub fn get_u64(&mut self) -> Result<u64, WireError> {
        self.need(8)?;
        Ok(self.buf.get_u64())
    }

    /// Reads a `u32`-length-prefixed byte string.
    pub fn get_bytes(&mut self) -> Result<Vec<u8>, WireError> {
        let len = self.get_u32()?;
        if len > MAX_FIELD_LEN {
            return Err(WireError::BadLength {
                length: u64::from(len),
            });
        }
        self.need(len as usize)?;
        let mut out = vec![0u8; len as usize];
        self.buf.copy_to_slice(&mut out);
        Ok(out)
    }

    /// Reads a fixed-width 32-byte hash.
    pub fn get_hash(&mut self) -> Result<Hash, WireError> {
        self.need(32)?;
        let mut bytes = [0u8; 32];
        self.buf.copy_to_slice(&mut bytes);
        Ok(Hash::new(bytes))
    }

    /// Returns the number of unread bytes.
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    /// Fails unless every byte has been consumed.
    pub fn expect_end(&self) -> Result<(), WireError> {
        if self.remaining() > 0 {
            return Err(WireError::TrailingBytes(self.remaining()));
        }
        Ok(())
    }
}

// ============================================================================
// Request Preimage
// ============================================================================

/// The canonical digest preimage of a client request:
/// `client_id (u64) ‖ timestamp (u64) ‖ len(op) (u32) ‖ op`.
///
/// The client signature is deliberately excluded so all replicas derive
/// the same digest regardless of signature encoding.
pub fn canonical_request_bytes(client_id: u64, timestamp: u64, operation: &[u8]) -> Vec<u8> {
    let mut writer = CanonicalWriter::with_capacity(8 + 8 + 4 + operation.len());
    writer
        .put_u64(client_id)
        .put_u64(timestamp)
        .put_bytes(operation);
    writer.finish()
}
