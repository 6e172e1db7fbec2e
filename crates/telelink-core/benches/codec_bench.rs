//! Criterion benchmarks for the frame codec and CryptoBox.
//!
//! Run with:
//! ```bash
//! cargo bench --package telelink-core --bench codec_bench
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use telelink_core::protocol::payload::{encode_values, Values};
use telelink_core::{decode_frame, encode_frame, CryptoBox, Frame, MessageType};

const SERIAL: &[u8; 16] = b"TL-BENCH-0000001";
const KEY: &[u8; 16] = b"bench-key-16byte";

fn telemetry_text(datasets: usize) -> Vec<u8> {
    let values: Values = (0..datasets)
        .map(|i| (format!("dataset_{i}"), Some(i as f64 * 1.5)))
        .collect();
    encode_values(&values).unwrap()
}

fn bench_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_codec");
    for size in [0usize, 64, 1024] {
        let frame = Frame::new(SERIAL, 1, MessageType::Data, [0; 8], vec![0x5A; size]).unwrap();
        let bytes = encode_frame(&frame).unwrap();
        group.bench_with_input(BenchmarkId::new("encode", size), &frame, |b, f| {
            b.iter(|| encode_frame(black_box(f)).unwrap())
        });
        group.bench_with_input(BenchmarkId::new("decode", size), &bytes, |b, buf| {
            b.iter(|| decode_frame(black_box(buf)).unwrap())
        });
    }
    group.finish();
}

fn bench_crypto(c: &mut Criterion) {
    let crypto = CryptoBox::new();
    let mut group = c.benchmark_group("crypto_box");
    for datasets in [4usize, 32] {
        let text = telemetry_text(datasets);
        let sealed = crypto.encrypt(KEY, &text).unwrap();
        group.bench_with_input(BenchmarkId::new("encrypt", datasets), &text, |b, t| {
            b.iter(|| crypto.encrypt(KEY, black_box(t)).unwrap())
        });
        group.bench_with_input(BenchmarkId::new("decrypt", datasets), &sealed, |b, s| {
            b.iter(|| crypto.decrypt(KEY, &s.iv, black_box(&s.ciphertext)).unwrap())
        });
    }
    group.finish();
}

criterion_group!(benches, bench_codec, bench_crypto);
criterion_main!(benches);
