//! Integration tests for zero-copy record codec operations
//!
//! These tests validate that Binary record bodies are split out of the read
//! buffer rather than copied, and that frames decode straight from those bodies.

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use bytes::{Bytes, BytesMut};
use framelink::core::codec::RecordCodec;
use framelink::core::frame;
use framelink::core::record::{Record, RECORD_HEADER_LEN};
use tokio_util::codec::{Decoder, Encoder};

fn binary_body(record: Record) -> Bytes {
    match record {
        Record::Binary(body) => body,
        other => panic!("expected a binary record, got {other:?}"),
    }
}

#[test]
fn test_codec_decode_zero_copy_split() {
    let mut codec = RecordCodec::default();
    let bytes = Record::Binary(frame::encode(0x0101, &[1, 2, 3, 4, 5])).to_bytes();

    let mut buffer = BytesMut::from(&bytes[..]);
    let base = buffer.as_ptr() as usize;

    let body = binary_body(codec.decode(&mut buffer).expect("Failed to decode").unwrap());

    // The body points into the original allocation, just past the header
    assert_eq!(body.as_ptr() as usize, base + RECORD_HEADER_LEN);
    assert_eq!(buffer.len(), 0);

    let (opcode, payload) = frame::decode_borrowed(&body).unwrap();
    assert_eq!(opcode, 0x0101);
    assert_eq!(payload, &[1, 2, 3, 4, 5]);
}

#[test]
fn test_codec_partial_decode_preserves_buffer() {
    let mut codec = RecordCodec::default();

    // Complete header, body still missing
    let mut buffer = BytesMut::from(&[0x02, 0x00, 0x00, 0x00, 0x04][..]);

    let result = codec.decode(&mut buffer).expect("Decode should not error");
    assert!(result.is_none());
    assert_eq!(buffer.len(), 5);
}

#[test]
fn test_codec_encode_writes_exact_length() {
    let mut codec = RecordCodec::default();
    let payload = frame::encode(7, &[0u8; 100]);

    let mut buffer = BytesMut::new();
    codec
        .encode(Record::Binary(payload.clone()), &mut buffer)
        .expect("Failed to encode");

    assert_eq!(buffer.len(), RECORD_HEADER_LEN + payload.len());
    assert_eq!(buffer[0], 0x02);
    assert_eq!(&buffer[1..5], &(payload.len() as u32).to_be_bytes());
}

#[test]
fn test_codec_multiple_records_in_buffer() {
    let mut codec = RecordCodec::default();
    let mut buffer = BytesMut::new();
    for i in 0..5u16 {
        codec
            .encode(Record::Binary(frame::encode(i, &[i as u8; 8])), &mut buffer)
            .unwrap();
    }
    codec.encode(Record::close(1000, "bye"), &mut buffer).unwrap();

    for i in 0..5u16 {
        let body = binary_body(codec.decode(&mut buffer).unwrap().unwrap());
        assert_eq!(frame::decode(&body).unwrap().opcode, i);
    }
    assert_eq!(
        codec.decode(&mut buffer).unwrap().unwrap(),
        Record::close(1000, "bye")
    );
    assert!(codec.decode(&mut buffer).unwrap().is_none());
}

#[test]
fn test_codec_incremental_buffer_fill() {
    let mut codec = RecordCodec::default();
    let bytes = Record::Binary(frame::encode(9, b"incremental")).to_bytes();

    let mut buffer = BytesMut::new();
    for (i, byte) in bytes.iter().enumerate() {
        buffer.extend_from_slice(&[*byte]);
        let result = codec.decode(&mut buffer).unwrap();
        if i + 1 < bytes.len() {
            assert!(result.is_none(), "decoded early at byte {i}");
        } else {
            let body = binary_body(result.unwrap());
            assert_eq!(&body[2..], b"incremental");
        }
    }
}

#[test]
fn test_codec_decode_reserves_for_announced_body() {
    let mut codec = RecordCodec::default();
    let mut buffer = BytesMut::from(&[0x02, 0x00, 0x00, 0x10, 0x00][..]);

    assert!(codec.decode(&mut buffer).unwrap().is_none());
    assert!(buffer.capacity() >= RECORD_HEADER_LEN + 0x1000);
}

#[test]
fn test_codec_large_payload() {
    let mut codec = RecordCodec::default();
    let payload = frame::encode(1, &vec![0xAB; 1024 * 1024]);

    let mut buffer = BytesMut::new();
    codec.encode(Record::Binary(payload.clone()), &mut buffer).unwrap();
    let body = binary_body(codec.decode(&mut buffer).unwrap().unwrap());
    assert_eq!(body.len(), payload.len());
    assert_eq!(body, payload);
}

#[test]
fn test_codec_oversized_header_rejected_before_body() {
    let mut codec = RecordCodec::new(1024);
    let mut buffer = BytesMut::from(&[0x02, 0x00, 0x01, 0x00, 0x00][..]);
    assert!(codec.decode(&mut buffer).is_err());
}

#[test]
fn test_bytes_reference_counting() {
    let mut codec = RecordCodec::default();
    let bytes = Record::Binary(frame::encode(3, b"shared")).to_bytes();
    let mut buffer = BytesMut::from(&bytes[..]);

    let body = binary_body(codec.decode(&mut buffer).unwrap().unwrap());
    let clone = body.clone();
    assert_eq!(body.as_ptr(), clone.as_ptr());

    let payload = body.slice(frame::OPCODE_WIDTH..);
    assert_eq!(payload.as_ptr() as usize, body.as_ptr() as usize + frame::OPCODE_WIDTH);
}
