//! # Frame Codec
//!
//! A frame is an opcode immediately followed by raw payload bytes. The enclosing
//! transport record already delimits the message, so a frame carries no length
//! prefix of its own.
//!
//! ```rust
//! use framelink::core::frame;
//!
//! let bytes = frame::encode(0x0102, b"hello");
//! let decoded = frame::decode(&bytes).unwrap();
//! assert_eq!(decoded.opcode, 0x0102);
//! assert_eq!(&decoded.payload[..], b"hello");
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::FrameError;

/// Width of the opcode field in bytes
pub const OPCODE_WIDTH: usize = 2;

/// Opcode identifying a message type
pub type Opcode = u16;

/// One opcode + payload unit of the application protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: Opcode,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(opcode: Opcode, payload: impl Into<Bytes>) -> Self {
        Self {
            opcode,
            payload: payload.into(),
        }
    }

    /// Serialize this frame into a fresh buffer
    pub fn to_bytes(&self) -> Bytes {
        encode(self.opcode, &self.payload)
    }
}

/// Encode `opcode` and `payload` into one contiguous buffer
pub fn encode(opcode: Opcode, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(OPCODE_WIDTH + payload.len());
    encode_into(opcode, payload, &mut buf);
    buf.freeze()
}

/// Append an encoded frame to `dst`
pub fn encode_into(opcode: Opcode, payload: &[u8], dst: &mut BytesMut) {
    dst.reserve(OPCODE_WIDTH + payload.len());
    dst.put_u16(opcode);
    dst.put_slice(payload);
}

/// Split `bytes` into opcode and a borrowed payload without copying
#[inline]
pub fn decode_borrowed(bytes: &[u8]) -> Result<(Opcode, &[u8]), FrameError> {
    if bytes.len() < OPCODE_WIDTH {
        return Err(FrameError::TooShort { len: bytes.len() });
    }
    let (head, payload) = bytes.split_at(OPCODE_WIDTH);
    Ok((u16::from_be_bytes([head[0], head[1]]), payload))
}

/// Decode `bytes` into an owned [`Frame`]
pub fn decode(bytes: &[u8]) -> Result<Frame, FrameError> {
    let (opcode, payload) = decode_borrowed(bytes)?;
    Ok(Frame {
        opcode,
        payload: Bytes::copy_from_slice(payload),
    })
}
