//! Hash Accumulator Benchmarks
//!
//! Cost of folding chunks into the whole-file digest, in order and with
//! chunks arriving out of order as concurrent workers deliver them.
//!
//! Run with: `cargo bench --bench hash_accumulator`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use ferry::hash::{compute_hash, HashAccumulator};

const CHUNK: u64 = 256 * 1024;

fn content(len: u64) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Pairs of adjacent chunks swapped, the usual shape with two workers
fn interleaved(chunks: u64) -> Vec<u64> {
    let mut order: Vec<u64> = (0..chunks).collect();
    for pair in order.chunks_mut(2) {
        pair.reverse();
    }
    order
}

fn bench_accumulator(c: &mut Criterion) {
    let mut group = c.benchmark_group("hash_accumulator");

    for size_mib in [1u64, 16, 64] {
        let size = size_mib * 1024 * 1024;
        let data = content(size);
        let chunks = size.div_ceil(CHUNK);
        group.throughput(Throughput::Bytes(size));

        group.bench_with_input(BenchmarkId::new("one_shot", size_mib), &data, |b, data| {
            b.iter(|| compute_hash(black_box(data)))
        });

        group.bench_with_input(BenchmarkId::new("in_order", size_mib), &data, |b, data| {
            b.iter(|| {
                let acc = HashAccumulator::new(size, CHUNK);
                for (index, chunk) in data.chunks(CHUNK as usize).enumerate() {
                    acc.write_chunk(index as u64, chunk).unwrap();
                }
                black_box(acc.finalize().unwrap())
            })
        });

        let order = interleaved(chunks);
        group.bench_with_input(BenchmarkId::new("interleaved", size_mib), &data, |b, data| {
            b.iter(|| {
                let acc = HashAccumulator::new(size, CHUNK);
                for &index in &order {
                    let start = (index * CHUNK) as usize;
                    let end = (start + CHUNK as usize).min(data.len());
                    acc.write_chunk(index, &data[start..end]).unwrap();
                }
                black_box(acc.finalize().unwrap())
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_accumulator);
criterion_main!(benches);
