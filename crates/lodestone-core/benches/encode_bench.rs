//! Micro-benchmarks for the hot encode paths: varint marshalling, pool
//! churn, and snapshot compression.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use lodestone_core::id::{fields::*, PropId};
use lodestone_core::log::compress::{compress_block, decompress_block};
use lodestone_core::pool::PoolSet;
use lodestone_core::propdb::{PropDb, PropEntry, ATTR_PERSIST};
use lodestone_core::serialize::{varint_decode, varint_encode};

fn bench_varint(c: &mut Criterion) {
    let mut buf = [0u8; 8];
    c.bench_function("varint_encode_decode", |b| {
        b.iter(|| {
            for n in [0u32, 127, 128, 0x3FFF, 0xFFFF_FFFF] {
                let len = varint_encode(black_box(n), &mut buf).unwrap();
                let (v, _) = varint_decode(&buf[..len]).unwrap();
                black_box(v);
            }
        });
    });
}

fn bench_pool_churn(c: &mut Criterion) {
    let pools = PoolSet::new();
    pools.add_pool(32, 64);
    pools.add_pool(8, 512);

    c.bench_function("pool_alloc_free_cycle", |b| {
        b.iter(|| {
            let a = pools.alloc(black_box(48)).unwrap();
            let s = pools.alloc_shared_from(black_box(b"payload")).unwrap();
            let clone = s.clone();
            black_box((&*a, &*clone));
        });
    });
}

fn bench_snapshot(c: &mut Criterion) {
    let pools = PoolSet::new();
    pools.add_pool(64, 64);
    let db = PropDb::new(pools);
    for i in 1..=60u32 {
        db.set_entry(
            PropId(P1_SENSOR | P2_INFO | i << 8 | (i % 24 + 1)),
            PropEntry::uint(i * 1000).with_attrs(ATTR_PERSIST),
            PropId::NONE,
        );
    }

    c.bench_function("serialize_compress_snapshot", |b| {
        b.iter(|| {
            let data = db.serialize();
            if let Some(payload) = compress_block(&data) {
                black_box(decompress_block(&payload));
            } else {
                black_box(None::<Vec<u8>>);
            }
        });
    });
}

criterion_group!(benches, bench_varint, bench_pool_churn, bench_snapshot);
criterion_main!(benches);
