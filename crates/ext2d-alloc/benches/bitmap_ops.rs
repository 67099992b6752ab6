//! Benchmark: bitmap search and accounting primitives.
//!
//! The allocator's hot path is `bitmap_find_free` near a goal bit and
//! `bitmap_find_free_byte` for preallocation; `bitmap_count_free` only runs
//! during consistency checks.

use criterion::{criterion_group, criterion_main, Criterion};
use ext2d_alloc::{bitmap_count_free, bitmap_find_free, bitmap_find_free_byte};
use std::hint::black_box;

const BITS: u32 = 32768;

/// A mostly-full 4096-byte bitmap with small free clusters scattered
/// through it, roughly what an aged group looks like.
fn aged_bitmap() -> Vec<u8> {
    let mut bm = vec![0xFF_u8; 4096];
    let mut pos = 100_usize;
    while pos + 32 < BITS as usize {
        for bit in pos..pos + 32 {
            bm[bit / 8] &= !(1 << (bit % 8));
        }
        pos += 650;
    }
    bm
}

fn bench_find_free(c: &mut Criterion) {
    let bm = aged_bitmap();
    let mut group = c.benchmark_group("find_free");

    group.bench_function("bit_near_goal", |b| {
        b.iter(|| black_box(bitmap_find_free(black_box(&bm), BITS, black_box(16000))));
    });

    group.bench_function("bit_wrap_around", |b| {
        b.iter(|| black_box(bitmap_find_free(black_box(&bm), BITS, black_box(BITS - 1))));
    });

    group.bench_function("free_byte", |b| {
        b.iter(|| black_box(bitmap_find_free_byte(black_box(&bm), BITS, black_box(16000))));
    });

    group.finish();
}

fn bench_count_free(c: &mut Criterion) {
    let bm = aged_bitmap();

    c.bench_function("count_free", |b| {
        b.iter(|| black_box(bitmap_count_free(black_box(&bm), BITS)));
    });
}

criterion_group!(benches, bench_find_free, bench_count_free);
criterion_main!(benches);
