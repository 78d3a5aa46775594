#![allow(clippy::unwrap_used, clippy::uninlined_format_args)]

use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use udp_messenger::utils::compression::{maybe_compress, CompressionKind};

fn bench_compression(c: &mut Criterion) {
    let mut group = c.benchmark_group("compression");
    let sizes = [512usize, 4096, 65536, 1024 * 1024];

    for &size in &sizes {
        // repetitive text, the kind of payload that passes the entropy gate
        let data: Vec<u8> = b"player:42 x=10.5 y=3.25 hp=100;"
            .iter()
            .copied()
            .cycle()
            .take(size)
            .collect();
        group.throughput(Throughput::Bytes(size as u64));

        for kind in [CompressionKind::Lz4, CompressionKind::Zstd] {
            let compressor = kind.compressor();
            let name = format!("{:?}", kind).to_lowercase();

            group.bench_function(format!("{}_compress_{}b", name, size), |b| {
                b.iter_batched(
                    || data.clone(),
                    |d| compressor.compress(&d).unwrap(),
                    BatchSize::SmallInput,
                )
            });
            group.bench_function(format!("{}_decompress_{}b", name, size), |b| {
                let compressed = compressor.compress(&data).unwrap();
                b.iter(|| {
                    let out = compressor.decompress(&compressed, size).unwrap();
                    assert_eq!(out.len(), data.len());
                })
            });
        }
    }

    group.finish();
}

fn bench_entropy_gate(c: &mut Criterion) {
    let mut group = c.benchmark_group("entropy_gate");
    let compressor = CompressionKind::Lz4.compressor();

    // near-random bytes, mostly rejected before the compressor runs
    let mut state = 0x9E37_79B9u32;
    let noisy: Vec<u8> = (0..4096)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state as u8
        })
        .collect();
    group.bench_function("skip_high_entropy_4096b", |b| {
        b.iter(|| maybe_compress(&noisy, compressor.as_ref(), 512).unwrap())
    });

    group.finish();
}

criterion_group!(benches, bench_compression, bench_entropy_gate);
criterion_main!(benches);
