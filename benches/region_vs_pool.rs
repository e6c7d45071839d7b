use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use regionpool::{
    Address, AllocateDescription, HeapRegion, MemoryPool, PoolConfig, RawAllocator, Region,
    SystemSegmentProvider,
};

const HEAP_SIZE: usize = 64 * 1024 * 1024;

fn region_create(c: &mut Criterion) {
    let mut group = c.benchmark_group("region_create");
    let provider = SystemSegmentProvider::new(RawAllocator);

    for count in [100, 1_000, 10_000] {
        group.bench_with_input(BenchmarkId::new("u64", count), &count, |b, &count| {
            b.iter(|| {
                let region = Region::new(&provider, RawAllocator);
                for index in 0..count {
                    black_box(region.create(index as u64));
                }
                black_box(region.bytes_allocated())
            });
        });

        group.bench_with_input(BenchmarkId::new("with_drop", count), &count, |b, &count| {
            b.iter(|| {
                let region = Region::new(&provider, RawAllocator);
                for index in 0..count {
                    black_box(region.create(vec![index as u8; 4]));
                }
                black_box(region.provided_segments())
            });
        });
    }

    group.finish();
}

fn pool_with_free_entries(entries: usize) -> MemoryPool {
    let pool = MemoryPool::new(PoolConfig::default()).unwrap();
    let stride = HEAP_SIZE / entries;
    for index in 0..entries {
        let low = Address::new(index * stride);
        pool.expand_with_range(stride / 2, low, low + stride / 2, false);
    }
    pool
}

fn pool_allocate(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool_allocate");

    for size in [1024, 16 * 1024, 256 * 1024] {
        group.bench_with_input(BenchmarkId::new("object", size), &size, |b, &size| {
            let pool = MemoryPool::new(PoolConfig::default()).unwrap();
            b.iter(|| {
                pool.rebuild_free_list_in_region(HeapRegion::new(Address::ZERO, Address::new(HEAP_SIZE)));
                let mut desc = AllocateDescription::new(size);
                while let Some(addr) = pool.allocate_object(&mut desc) {
                    black_box(addr);
                }
            });
        });

        group.bench_with_input(BenchmarkId::new("tlh", size), &size, |b, &size| {
            let pool = MemoryPool::new(PoolConfig::default()).unwrap();
            b.iter(|| {
                pool.rebuild_free_list_in_region(HeapRegion::new(Address::ZERO, Address::new(HEAP_SIZE)));
                let mut desc = AllocateDescription::default();
                while let Some(tlh) = pool.allocate_tlh(&mut desc, size) {
                    black_box(tlh);
                }
            });
        });
    }

    group.finish();
}

fn pool_fragmented(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool_fragmented");

    for entries in [64, 1024] {
        group.bench_with_input(BenchmarkId::new("first_fit", entries), &entries, |b, &entries| {
            b.iter_batched(
                || pool_with_free_entries(entries),
                |pool| {
                    // leftovers pile up at the head and every later request walks past them
                    let mut desc = AllocateDescription::new(HEAP_SIZE / entries * 3 / 8);
                    while let Some(addr) = pool.allocate_object(&mut desc) {
                        black_box(addr);
                    }
                },
                criterion::BatchSize::SmallInput,
            );
        });

        group.bench_with_input(BenchmarkId::new("recycle", entries), &entries, |b, &entries| {
            b.iter_batched(
                || pool_with_free_entries(entries),
                |pool| {
                    let stride = HEAP_SIZE / entries;
                    for index in 0..entries {
                        let base = Address::new(index * stride + stride / 2);
                        black_box(pool.recycle_heap_chunk(base, base + stride / 2));
                    }
                },
                criterion::BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

criterion_group!(benches, region_create, pool_allocate, pool_fragmented);
criterion_main!(benches);
