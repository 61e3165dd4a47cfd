// Copyright 2023 TiKV Project Authors. Licensed under Apache-2.0.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use minimon::{IntDist, SeriesKey};

fn bench_insert(c: &mut Criterion) {
    c.bench_function("dist_insert", |b| {
        let mut dist = IntDist::new(SeriesKey::new("bench"));
        let mut val = 0i64;
        b.iter(|| {
            val = val.wrapping_add(1);
            dist.insert(black_box(val));
        });
    });
}

fn bench_query(c: &mut Criterion) {
    c.bench_function("dist_query_sorted", |b| {
        let mut dist = IntDist::new(SeriesKey::new("bench"));
        for val in 0..10_000 {
            dist.insert(val);
        }
        b.iter(|| black_box(dist.query(black_box(0.9))));
    });

    c.bench_function("dist_query_resort", |b| {
        let mut dist = IntDist::new(SeriesKey::new("bench"));
        for val in 0..10_000 {
            dist.insert(val);
        }
        let mut val = 10_000i64;
        b.iter(|| {
            // every insert invalidates the sorted reservoir
            val += 1;
            dist.insert(val);
            black_box(dist.query(0.5))
        });
    });
}

criterion_group!(benches, bench_insert, bench_query);
criterion_main!(benches);
