use std::sync::Arc;

use bytes::BytesMut;
use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use framelink::core::codec::RecordCodec;
use framelink::core::frame;
use framelink::core::record::Record;
use framelink::transport::{DispatchQueue, TransportSink};
use framelink::utils::{BufferPool, Metrics};
use tokio_util::codec::{Decoder, Encoder};

struct Discard(usize);

impl TransportSink for Discard {
    fn on_open(&mut self, _protocol: &str) {}
    fn on_connect_failed(&mut self, _reason: &str) {}
    fn on_error(&mut self, _message: &str) {}
    fn on_close(&mut self, _code: u16, _reason: &str) {}
    fn on_message(&mut self, _session_id: u64, message: &[u8]) {
        self.0 += message.len();
    }
}

#[allow(clippy::unwrap_used)]
fn bench_frame_encode_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_encode_decode");
    let payload_sizes = [64usize, 512, 4096, 65536, 1024 * 1024];

    for &size in &payload_sizes {
        let payload = vec![0u8; size];
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_function(format!("encode_{size}b"), |b| {
            let mut buf = BytesMut::with_capacity(size + 8);
            b.iter(|| {
                buf.clear();
                frame::encode_into(0x0102, &payload, &mut buf);
            })
        });

        let encoded = frame::encode(0x0102, &payload);
        group.bench_function(format!("decode_borrowed_{size}b"), |b| {
            b.iter(|| {
                let decoded = frame::decode_borrowed(&encoded);
                assert!(decoded.is_ok());
            })
        });

        let record = Record::Binary(encoded.clone()).to_bytes();
        group.bench_function(format!("record_codec_{size}b"), |b| {
            b.iter_batched(
                || BytesMut::from(&record[..]),
                |mut buf| {
                    let mut codec = RecordCodec::default();
                    let decoded = codec.decode(&mut buf).unwrap();
                    assert!(decoded.is_some());
                },
                BatchSize::SmallInput,
            )
        });

        group.bench_function(format!("record_encode_{size}b"), |b| {
            let mut buf = BytesMut::with_capacity(size + 16);
            let mut codec = RecordCodec::default();
            b.iter(|| {
                buf.clear();
                codec.encode(Record::Binary(encoded.clone()), &mut buf).unwrap();
            })
        });
    }

    group.finish();
}

fn bench_dispatch_queue(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch_queue");
    let message = frame::encode(1, &[0u8; 256]);

    for &batch in &[1usize, 64, 1024] {
        group.throughput(Throughput::Elements(batch as u64));
        group.bench_function(format!("enqueue_drain_{batch}"), |b| {
            let queue = DispatchQueue::new(batch, BufferPool::new(batch), Arc::new(Metrics::new()));
            let mut sink = Discard(0);
            b.iter(|| {
                for _ in 0..batch {
                    queue.enqueue_message(1, 1, &message);
                }
                queue.drain(1, &mut sink);
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_frame_encode_decode, bench_dispatch_queue);
criterion_main!(benches);
