#![no_main]

use bytes::BytesMut;
use framelink::core::codec::RecordCodec;
use framelink::core::frame;
use framelink::core::record::Record;
use libfuzzer_sys::fuzz_target;
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    // Frame and record decoding must never panic, loop or over-allocate
    let _ = frame::decode(data);

    let mut offset = 0;
    while let Ok(Some((record, used))) = Record::parse(&data[offset..], 64 * 1024) {
        if let Record::Binary(body) = record {
            let _ = frame::decode_borrowed(&body);
        }
        offset += used;
    }

    let mut buf = BytesMut::from(data);
    let mut codec = RecordCodec::new(64 * 1024);
    while let Ok(Some(_)) = codec.decode(&mut buf) {}
});
