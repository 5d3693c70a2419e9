//! # Transport Records
//!
//! A record is one transport-level message. Both client strategies and the server
//! deliver records atomically, which is what lets a [`Frame`](super::frame::Frame)
//! travel without its own length prefix.
//!
//! ```text
//! [Kind(1)] [Length(4, BE)] [Body(Length)]
//! ```
//!
//! | Kind | Body |
//! |------|------|
//! | `0x01` Handshake | comma-separated sub-protocols (offer) or the selected one (answer) |
//! | `0x02` Binary | one encoded frame |
//! | `0x08` Close | `[code(2, BE)] [reason(UTF-8)]`, or empty |

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{ProtocolError, Result};

/// Size of the kind + length header
pub const RECORD_HEADER_LEN: usize = 5;

/// Machine-readable close codes carried by Close records and events
pub mod close_code {
    /// Normal closure
    pub const NORMAL: u16 = 1000;
    /// Endpoint going away (server shutdown)
    pub const GOING_AWAY: u16 = 1001;
    /// Protocol violation (bad record, rejected handshake)
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// Close record without a status code
    pub const NO_STATUS: u16 = 1005;
    /// Connection lost without a close handshake
    pub const ABNORMAL: u16 = 1006;
    /// A record exceeded the maximum message size
    pub const MESSAGE_TOO_BIG: u16 = 1009;
}

/// Record type discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordKind {
    Handshake = 0x01,
    Binary = 0x02,
    Close = 0x08,
}

impl TryFrom<u8> for RecordKind {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::Handshake),
            0x02 => Ok(Self::Binary),
            0x08 => Ok(Self::Close),
            _ => Err(ProtocolError::InvalidHeader),
        }
    }
}

/// A decoded record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Handshake(String),
    Binary(Bytes),
    Close { code: u16, reason: String },
}

impl Record {
    pub fn kind(&self) -> RecordKind {
        match self {
            Record::Handshake(_) => RecordKind::Handshake,
            Record::Binary(_) => RecordKind::Binary,
            Record::Close { .. } => RecordKind::Close,
        }
    }

    pub fn close(code: u16, reason: impl Into<String>) -> Self {
        Record::Close {
            code,
            reason: reason.into(),
        }
    }

    /// Serialize into a fresh buffer
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf);
        buf.to_vec()
    }

    /// Append the encoded record to `dst`
    pub fn encode_into(&self, dst: &mut BytesMut) {
        match self {
            Record::Handshake(protocols) => {
                write_header(RecordKind::Handshake, protocols.len(), dst);
                dst.put_slice(protocols.as_bytes());
            }
            Record::Binary(body) => {
                write_header(RecordKind::Binary, body.len(), dst);
                dst.put_slice(body);
            }
            Record::Close { code, reason } => {
                write_header(RecordKind::Close, 2 + reason.len(), dst);
                dst.put_u16(*code);
                dst.put_slice(reason.as_bytes());
            }
        }
    }

    /// Build a record from a validated header and its complete body
    pub fn from_parts(kind: RecordKind, body: &[u8]) -> Self {
        match kind {
            RecordKind::Handshake => Record::Handshake(String::from_utf8_lossy(body).into_owned()),
            RecordKind::Binary => Record::Binary(Bytes::copy_from_slice(body)),
            RecordKind::Close => {
                let (code, reason) = parse_close_body(body);
                Record::Close { code, reason }
            }
        }
    }

    /// Incrementally parse one record from the front of `buf`.
    ///
    /// Returns `Ok(None)` when more bytes are needed, otherwise the record and the
    /// number of bytes it consumed.
    pub fn parse(buf: &[u8], max_message_size: usize) -> Result<Option<(Record, usize)>> {
        let Some(header) = RecordHeader::peek(buf, max_message_size)? else {
            return Ok(None);
        };
        let total = header.total_len();
        if buf.len() < total {
            return Ok(None);
        }
        let record = Record::from_parts(header.kind, &buf[RECORD_HEADER_LEN..total]);
        Ok(Some((record, total)))
    }
}

/// Kind and body length of a record whose header has been read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub kind: RecordKind,
    pub body_len: usize,
}

impl RecordHeader {
    /// Read the header at the front of `buf`, validating kind and length
    pub fn peek(buf: &[u8], max_message_size: usize) -> Result<Option<Self>> {
        if buf.len() < RECORD_HEADER_LEN {
            return Ok(None);
        }
        let kind = RecordKind::try_from(buf[0])?;
        let body_len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
        if body_len > max_message_size {
            return Err(ProtocolError::OversizedMessage(body_len));
        }
        Ok(Some(Self { kind, body_len }))
    }

    #[inline]
    pub fn total_len(&self) -> usize {
        RECORD_HEADER_LEN + self.body_len
    }
}

/// Header bytes for a record of `kind` carrying `body_len` bytes
pub fn encode_header(kind: RecordKind, body_len: usize) -> [u8; RECORD_HEADER_LEN] {
    let len = (body_len as u32).to_be_bytes();
    [kind as u8, len[0], len[1], len[2], len[3]]
}

/// Split a Close body into code and reason
pub fn parse_close_body(body: &[u8]) -> (u16, String) {
    if body.len() < 2 {
        return (close_code::NO_STATUS, String::new());
    }
    let code = u16::from_be_bytes([body[0], body[1]]);
    (code, String::from_utf8_lossy(&body[2..]).into_owned())
}

fn write_header(kind: RecordKind, body_len: usize, dst: &mut BytesMut) {
    dst.reserve(RECORD_HEADER_LEN + body_len);
    dst.put_u8(kind as u8);
    dst.put_u32(body_len as u32);
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: usize = 1024;

    #[test]
    fn partial_header_needs_more() {
        let bytes = Record::Binary(Bytes::from_static(b"abc")).to_bytes();
        assert!(Record::parse(&bytes[..3], MAX).unwrap().is_none());
        assert!(Record::parse(&bytes[..6], MAX).unwrap().is_none());
    }

    #[test]
    fn parse_reports_consumed_length() {
        let mut bytes = Record::Binary(Bytes::from_static(b"abc")).to_bytes();
        bytes.extend(Record::close(close_code::NORMAL, "bye").to_bytes());

        let (first, used) = Record::parse(&bytes, MAX).unwrap().unwrap();
        assert_eq!(first, Record::Binary(Bytes::from_static(b"abc")));
        assert_eq!(used, RECORD_HEADER_LEN + 3);

        let (second, _) = Record::parse(&bytes[used..], MAX).unwrap().unwrap();
        assert_eq!(second, Record::close(close_code::NORMAL, "bye"));
    }

    #[test]
    fn unknown_kind_is_invalid_header() {
        let bytes = [0x7F, 0, 0, 0, 0];
        assert!(matches!(
            Record::parse(&bytes, MAX),
            Err(ProtocolError::InvalidHeader)
        ));
    }

    #[test]
    fn oversized_length_is_rejected_from_header_alone() {
        let mut bytes = vec![RecordKind::Binary as u8];
        bytes.extend_from_slice(&((MAX + 1) as u32).to_be_bytes());
        assert!(matches!(
            RecordHeader::peek(&bytes, MAX),
            Err(ProtocolError::OversizedMessage(n)) if n == MAX + 1
        ));
    }

    #[test]
    fn empty_close_body_means_no_status() {
        let bytes = [RecordKind::Close as u8, 0, 0, 0, 0];
        let (record, _) = Record::parse(&bytes, MAX).unwrap().unwrap();
        assert_eq!(record, Record::close(close_code::NO_STATUS, ""));
    }

    #[test]
    fn handshake_carries_protocol_list() {
        let bytes = Record::Handshake("chat.v2,chat.v1".into()).to_bytes();
        let (record, _) = Record::parse(&bytes, MAX).unwrap().unwrap();
        assert_eq!(record, Record::Handshake("chat.v2,chat.v1".into()));
    }
}
