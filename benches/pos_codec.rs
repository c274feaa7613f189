//! Criterion benchmarks for the order-preserving position codec and the
//! MessagePack value codec.

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use num_bigint::BigInt;
use veles::codec::{self, pos};
use veles::{NodeID, Value};

fn positions() -> Vec<(&'static str, BigInt)> {
    vec![
        ("zero", BigInt::from(0)),
        ("small", BigInt::from(-4096)),
        ("i64", BigInt::from(i64::MAX)),
        ("huge", BigInt::from(1) << 800usize),
    ]
}

fn bench_pos_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("pos_encode");
    for (name, value) in positions() {
        group.bench_with_input(BenchmarkId::from_parameter(name), &value, |b, v| {
            b.iter(|| pos::encode(black_box(v)))
        });
    }
    group.finish();
}

fn bench_pos_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("pos_decode");
    for (name, value) in positions() {
        let bytes = pos::encode(&value);
        group.bench_with_input(BenchmarkId::from_parameter(name), &bytes, |b, bytes| {
            b.iter(|| pos::decode(black_box(bytes)))
        });
    }
    group.finish();
}

fn bench_value_codec(c: &mut Criterion) {
    let node = Value::map([
        ("id", Value::from(NodeID::random())),
        ("name", Value::from("chunk")),
        ("start", Value::from(BigInt::from(1) << 70usize)),
        ("tags", Value::List(vec![Value::from("file"), Value::from("elf")])),
    ]);
    let bytes = codec::encode(&node);
    c.bench_function("value_encode", |b| b.iter(|| codec::encode(black_box(&node))));
    c.bench_function("value_decode", |b| b.iter(|| codec::decode(black_box(&bytes))));
}

criterion_group!(benches, bench_pos_encode, bench_pos_decode, bench_value_codec);
criterion_main!(benches);
