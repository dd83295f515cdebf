//! Allocation and sweep benchmarks

use cellgc::{
    set_blocktype, AllocationStrategy, Allocator, AllocatorSettings, Arena, Blocktype, CellPtr,
};

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};

/// Fill a fresh allocator with small objects
fn bump_small(count: usize) -> Allocator {
    let mut allocator = Allocator::new();
    for i in 0..count {
        black_box(allocator.allocate(16 * (1 + i % 4)).unwrap());
    }
    allocator
}

/// Allocator with an 8000 cell free block, held in place by a live
/// anchor object that separates it from the bump run
fn swept_fit_allocator() -> (Allocator, CellPtr) {
    let mut allocator = Allocator::with_settings(
        AllocatorSettings::default().with_strategy(AllocationStrategy::Fit),
    );
    let p = allocator.allocate(16 * 8000).unwrap();
    let anchor = allocator.allocate(16).unwrap();
    set_blocktype(anchor, Blocktype::Black);
    allocator.sweep(Arena::addr_of(p));
    (allocator, anchor)
}

/// Allocate from the free lists then sweep everything back
fn fit_cycle(allocator: &mut Allocator, anchor: CellPtr, count: usize) {
    for i in 0..count {
        black_box(allocator.allocate(16 * (1 + i % 7)).unwrap());
    }
    set_blocktype(anchor, Blocktype::Black);
    allocator.sweep(Arena::addr_of(anchor));
}

fn allocate_objects(allocator: &mut Allocator, count: usize) -> Vec<CellPtr> {
    (0..count).map(|_| allocator.allocate(32).unwrap()).collect()
}

pub fn criterion_benchmark(c: &mut Criterion) {
    c.bench_function("bump_small_1000", |b| {
        b.iter_batched(|| (), |_| bump_small(1000), BatchSize::SmallInput)
    });

    let (mut allocator, anchor) = swept_fit_allocator();
    c.bench_function("fit_cycle_1000", |b| {
        b.iter(|| fit_cycle(&mut allocator, anchor, 1000))
    });

    let mut allocator = Allocator::new();
    let objects = allocate_objects(&mut allocator, 10_000);
    let arena = Arena::addr_of(objects[0]);
    c.bench_function("sweep_checkerboard", |b| {
        b.iter(|| {
            // every other object survives
            for (i, p) in objects.iter().enumerate() {
                if i % 2 == 0 {
                    set_blocktype(*p, Blocktype::Black);
                }
            }
            black_box(arena.sweep())
        })
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
