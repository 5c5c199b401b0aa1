//! Field Access Benchmarks
//!
//! Measures the hot paths of the object model: reads through precomputed
//! layout offsets, transactional writes (undo logging plus the write),
//! and cache-mediated dereference of object references.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;
use strata::{Heap, HeapConfig, IntField, LayoutBuilder, LongField, Mutability, PersistentObject};
use tempfile::TempDir;

fn bench_heap(dir: &TempDir) -> Arc<Heap> {
    Heap::open_file(dir.path().join("bench.strata"), HeapConfig::default()).unwrap()
}

fn bench_scalar_access(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let heap = bench_heap(&dir);

    let mut b = LayoutBuilder::new("bench.record");
    let id: LongField = b.long_field(Mutability::Mutable);
    let count: IntField = b.int_field(Mutability::Mutable);
    let layout = b.build(heap.registry()).unwrap();

    let obj = PersistentObject::new(&heap, &layout, |o| {
        o.set_long(&id, 7)?;
        o.set_int(&count, 1)
    })
    .unwrap();

    let mut group = c.benchmark_group("scalar_access");

    group.bench_function("read_long", |b| {
        b.iter(|| black_box(obj.get_long(&id).unwrap()))
    });

    group.bench_function("write_long_untracked", |b| {
        b.iter(|| obj.set_long(&id, black_box(42)).unwrap())
    });

    group.bench_function("write_long_in_transaction", |b| {
        b.iter(|| {
            heap.run_in_transaction(|| obj.set_long(&id, black_box(42)))
                .unwrap()
        })
    });

    group.finish();
}

fn bench_reference_access(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let heap = bench_heap(&dir);

    let leaf_layout = LayoutBuilder::new("bench.leaf").build(heap.registry()).unwrap();
    let mut b = LayoutBuilder::new("bench.holder");
    let child = b.object_field(Mutability::Mutable);
    let holder_layout = b.build(heap.registry()).unwrap();

    let leaf = PersistentObject::new(&heap, &leaf_layout, |_| Ok(())).unwrap();
    let holder = PersistentObject::new(&heap, &holder_layout, |_| Ok(())).unwrap();
    heap.run_in_transaction(|| holder.set_object(&child, Some(&leaf)))
        .unwrap();

    let mut group = c.benchmark_group("reference_access");

    // The referent handle is alive, so this hits the cache.
    group.bench_function("deref_cached", |b| {
        b.iter(|| black_box(holder.get_object(&child).unwrap()))
    });

    group.finish();
}

fn bench_construction(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let heap = bench_heap(&dir);

    let mut b = LayoutBuilder::new("bench.point");
    let x = b.int_field(Mutability::WriteOnce);
    let y = b.int_field(Mutability::WriteOnce);
    let layout = b.build(heap.registry()).unwrap();

    c.bench_function("construct_and_free", |b| {
        b.iter(|| {
            let p = PersistentObject::new(&heap, &layout, |o| {
                o.init_int(&x, black_box(3))?;
                o.init_int(&y, black_box(4))
            })
            .unwrap();
            black_box(&p);
        })
    });
}

criterion_group!(
    benches,
    bench_scalar_access,
    bench_reference_access,
    bench_construction
);
criterion_main!(benches);
