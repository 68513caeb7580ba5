use bytes::BytesMut;
use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use framewire::{FrameCodec, Message};
use tokio_util::codec::{Decoder, Encoder};

#[allow(clippy::unwrap_used)]
fn bench_frame_encode_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_encode_decode");
    let body_sizes = [0usize, 64, 4096, 65536, 1024 * 1024];

    for &size in &body_sizes {
        let message = Message::new(3u16).with(&vec![0u8; size]);
        group.throughput(Throughput::Bytes(message.size() as u64));

        group.bench_function(format!("encode_{size}b"), |b| {
            b.iter_batched(
                || message.clone(),
                |msg| {
                    let mut buf = BytesMut::with_capacity(size + 32);
                    FrameCodec::<u16>::new().encode(msg, &mut buf).unwrap();
                },
                BatchSize::SmallInput,
            )
        });

        let mut encoded = BytesMut::new();
        FrameCodec::<u16>::new()
            .encode(message.clone(), &mut encoded)
            .unwrap();

        group.bench_function(format!("decode_{size}b"), |b| {
            b.iter_batched(
                || encoded.clone(),
                |mut buf| {
                    let decoded = FrameCodec::<u16>::new().decode(&mut buf).unwrap();
                    assert!(decoded.is_some());
                },
                BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

criterion_group!(benches, bench_frame_encode_decode);
criterion_main!(benches);
