//! Frame codec benchmarks.

use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use pacer_protocol::{crc8, Control, Decoder, Direction, Encoder, Frame, Order, MAX_PARAMS_LEN};

fn bench_crc8(c: &mut Criterion) {
    let mut group = c.benchmark_group("crc8");

    for size in [4, 64, MAX_PARAMS_LEN] {
        let data = vec![0xA5u8; size];

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &data, |b, data| {
            b.iter(|| black_box(crc8(data)));
        });
    }

    group.finish();
}

fn bench_frame_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_encode");

    for size in [0, 32, MAX_PARAMS_LEN] {
        let params = vec![0x11u8; size];

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &params, |b, params| {
            b.iter(|| {
                black_box(
                    Encoder::encode_request(Control::new(3), Order::QueueCommandBlocks, params)
                        .unwrap(),
                )
            });
        });
    }

    group.finish();
}

fn bench_frame_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_decode");

    for size in [0, 32, MAX_PARAMS_LEN] {
        let params = vec![0x22u8; size];
        let encoded =
            Encoder::encode_request(Control::new(5), Order::QueueCommandBlocks, &params).unwrap();

        group.throughput(Throughput::Bytes(encoded.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &encoded, |b, encoded| {
            b.iter(|| {
                let mut buf = BytesMut::from(&encoded[..]);
                black_box(Frame::decode(&mut buf, Direction::HostToClient).unwrap())
            });
        });
    }

    group.finish();
}

fn bench_decoder_stream(c: &mut Criterion) {
    let mut group = c.benchmark_group("decoder_stream");

    // 100 small frames with a burst of line noise between each
    let mut stream = Vec::new();
    for i in 0..100u8 {
        stream.extend_from_slice(&[0x00, 0xFF, 0x17]);
        let frame = Encoder::encode_request(Control::new(i), Order::RequestInput, &[1, i]).unwrap();
        stream.extend_from_slice(&frame);
    }

    group.throughput(Throughput::Elements(100));
    group.bench_function("noisy_100", |b| {
        b.iter(|| {
            let mut decoder = Decoder::for_requests();
            decoder.extend(&stream);
            let mut frames = 0;
            while let Ok(Some(_)) = decoder.decode_frame() {
                frames += 1;
            }
            black_box(frames)
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_crc8,
    bench_frame_encode,
    bench_frame_decode,
    bench_decoder_stream,
);

criterion_main!(benches);
