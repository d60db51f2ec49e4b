//! Microbenchmarks for the response decode and consolidation hot path.
//!
//! Run with: `cargo bench -p rollgate -- decode`

#![allow(missing_docs, clippy::cast_possible_truncation)]

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use rollgate::decode::{RowDecoder, RowShape, encode_row};
use rollgate::points::PointStore;

/// Encodes `metrics` rows of `points` raw points each.
fn build_body(metrics: u32, points: u32) -> Vec<u8> {
    let mut body = Vec::new();
    let times: Vec<u32> = (0..points).map(|i| 1_700_000_000 + i * 10).collect();
    let values: Vec<f64> = (0..points).map(f64::from).collect();
    for m in 0..metrics {
        let name = format!("servers.host{m}.cpu.user");
        encode_row(&mut body, name.as_bytes(), &times, &values, Some(&times));
    }
    body
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");

    for (metrics, points) in [(10u32, 1_000u32), (1_000, 10), (100, 360)] {
        let body = build_body(metrics, points);
        group.throughput(Throughput::Bytes(body.len() as u64));

        group.bench_with_input(
            BenchmarkId::new("rows", format!("{metrics}x{points}")),
            &body,
            |b, body| {
                b.iter(|| {
                    let mut decoder = RowDecoder::new(RowShape::Unaggregated);
                    let mut count = 0;
                    for chunk in body.chunks(16 * 1024) {
                        decoder.feed(chunk);
                        while let Some(row) = decoder.next_row(false).unwrap() {
                            count += row.len();
                        }
                    }
                    while let Some(row) = decoder.next_row(true).unwrap() {
                        count += row.len();
                    }
                    black_box(count)
                });
            },
        );
    }
    group.finish();
}

fn bench_consolidate(c: &mut Criterion) {
    let body = build_body(100, 360);
    let mut decoder = RowDecoder::new(RowShape::Unaggregated);
    decoder.feed(&body);
    let mut rows = Vec::new();
    while let Some(row) = decoder.next_row(true).unwrap() {
        rows.push(row);
    }

    c.bench_function("consolidate/100x360", |b| {
        b.iter(|| {
            let mut store = PointStore::new();
            for row in &rows {
                let id = store.append_row(row, false);
                store.set_step(id, 60);
            }
            store.sort();
            store.uniq();
            store.rollup(1_700_000_000, 0);
            black_box(store.len())
        });
    });
}

criterion_group!(benches, bench_decode, bench_consolidate);
criterion_main!(benches);
