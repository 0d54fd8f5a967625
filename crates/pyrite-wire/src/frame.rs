//! Transport framing.
//!
//! Every protocol message travels as one frame:
//!
//! ```text
//! +------+----------+--------+-------------+-------------------+
//! | tag  | view u64 | sender | payload len | payload (postcard)|
//! | u8   | BE       | u8     | u32 BE      | ...               |
//! +------+----------+--------+-------------+-------------------+
//! | auth len u32 BE | authenticator bytes                      |
//! +-----------------+------------------------------------------+
//! ```
//!
//! The preamble is readable without deserializing the payload, which lets
//! a receiver drop wrong-view traffic before paying for `postcard` or MAC
//! work. The authenticator trails the frame and covers tag, view, sender,
//! and payload — not itself.

use serde::{Serialize, de::DeserializeOwned};

use crate::canonical::{CanonicalReader, CanonicalWriter};
use crate::WireError;

/// A decoded frame: preamble fields plus raw payload and authenticator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub tag: u8,
    pub view: u64,
    pub sender: u8,
    pub payload: Vec<u8>,
    pub auth: Vec<u8>,
}

impl Frame {
    /// The bytes the authenticator covers: everything up to it.
    pub fn authenticated_bytes(&self) -> Vec<u8> {
        preamble_and_payload(self.tag, self.view, self.sender, &self.payload)
    }

    /// Deserializes the payload into a concrete message body.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, WireError> {
        postcard::from_bytes(&self.payload).map_err(|e| WireError::Payload(e.to_string()))
    }
}

fn preamble_and_payload(tag: u8, view: u64, sender: u8, payload: &[u8]) -> Vec<u8> {
    let mut writer = CanonicalWriter::with_capacity(1 + 8 + 1 + 4 + payload.len());
    writer
        .put_u8(tag)
        .put_u64(view)
        .put_u8(sender)
        .put_bytes(payload);
    writer.finish()
}

/// Encodes a message body and wraps it in a frame.
///
/// `auth` is the already-computed authenticator (MAC vector or signature
/// bytes) over [`Frame::authenticated_bytes`].
pub fn encode_frame<T: Serialize>(
    tag: u8,
    view: u64,
    sender: u8,
    body: &T,
    auth: &[u8],
) -> Result<Vec<u8>, WireError> {
    let payload = postcard::to_allocvec(body).map_err(|e| WireError::Payload(e.to_string()))?;
    let mut bytes = preamble_and_payload(tag, view, sender, &payload);
    let mut writer = CanonicalWriter::with_capacity(4 + auth.len());
    writer.put_bytes(auth);
    bytes.extend_from_slice(&writer.finish());
    Ok(bytes)
}

/// Decodes a frame, consuming the whole input.
pub fn decode_frame(bytes: &[u8]) -> Result<Frame, WireError> {
    let mut reader = CanonicalReader::new(bytes);
    let tag = reader.get_u8()?;
    let view = reader.get_u64()?;
    let sender = reader.get_u8()?;
    let payload = reader.get_bytes()?;
    let auth = reader.get_bytes()?;
    reader.expect_end()?;
    Ok(Frame {
        tag,
        view,
        sender,
        payload,
        auth,
    })
}
