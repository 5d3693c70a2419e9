use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::config::MAX_MESSAGE_SIZE;
use crate::core::record::{Record, RecordHeader, RecordKind, RECORD_HEADER_LEN};
use crate::error::{ProtocolError, Result};

/// Tokio codec framing [`Record`]s over a byte stream.
///
/// Used by every socket that lives on a tokio runtime: the bridged client
/// transport and the frame server.
#[derive(Debug, Clone, Copy)]
pub struct RecordCodec {
    max_message_size: usize,
}

impl RecordCodec {
    pub fn new(max_message_size: usize) -> Self {
        Self { max_message_size }
    }
}

impl Default for RecordCodec {
    fn default() -> Self {
        Self::new(MAX_MESSAGE_SIZE)
    }
}

impl Decoder for RecordCodec {
    type Item = Record;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Record>> {
        let Some(header) = RecordHeader::peek(src, self.max_message_size)? else {
            return Ok(None);
        };

        let total = header.total_len();
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(RECORD_HEADER_LEN);
        let body = src.split_to(header.body_len);
        Ok(Some(match header.kind {
            RecordKind::Binary => Record::Binary(body.freeze()),
            kind => Record::from_parts(kind, &body),
        }))
    }
}

impl Encoder<Record> for RecordCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Record, dst: &mut BytesMut) -> Result<()> {
        let body_len = match &item {
            Record::Handshake(p) => p.len(),
            Record::Binary(b) => b.len(),
            Record::Close { reason, .. } => 2 + reason.len(),
        };
        if body_len > self.max_message_size {
            return Err(ProtocolError::OversizedMessage(body_len));
        }
        item.encode_into(dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn decode_waits_for_full_body() {
        let mut codec = RecordCodec::new(64);
        let bytes = Record::Binary(Bytes::from_static(b"hello")).to_bytes();

        let mut buf = BytesMut::from(&bytes[..7]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 7);

        buf.extend_from_slice(&bytes[7..]);
        let record = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(record, Record::Binary(Bytes::from_static(b"hello")));
        assert!(buf.is_empty());
    }

    #[test]
    fn encode_rejects_oversized_body() {
        let mut codec = RecordCodec::new(4);
        let mut buf = BytesMut::new();
        let result = codec.encode(Record::Binary(Bytes::from_static(b"too long")), &mut buf);
        assert!(matches!(result, Err(ProtocolError::OversizedMessage(8))));
        assert!(buf.is_empty());
    }
}
