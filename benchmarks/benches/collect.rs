//! Measures full collections over heaps of different shapes.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use sweepgc::{CollectMode, Context, Heap, HeapConfig, RootLocation, Value, OBJECT_CLASS};

const SIZES: [usize; 3] = [1_000, 10_000, 100_000];

fn criterion_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("collect");
    for size in SIZES {
        // A single rooted chain, marked mostly through the deferred stack.
        group.bench_with_input(BenchmarkId::new("live-chain", size), &size, |b, &size| {
            let heap = Heap::new(HeapConfig::default());
            let mut context = Context::new(&heap);
            let mut request = context.begin_request();
            let root = RootLocation::default();
            heap.register_root(&root, None);
            for _ in 0..size {
                let link = request
                    .new_object(&OBJECT_CLASS, vec![root.get()])
                    .expect("heap exhausted");
                root.set(Value::Object(link));
            }
            b.iter(|| black_box(request.collect(CollectMode::Normal)));
            heap.unregister_root(&root);
        });

        // Unreachable objects, refilled before every collection.
        group.bench_with_input(BenchmarkId::new("garbage", size), &size, |b, &size| {
            let heap = Heap::new(HeapConfig::default());
            let mut context = Context::new(&heap);
            let mut request = context.begin_request();
            b.iter(|| {
                for i in 0..size {
                    request
                        .new_object(&OBJECT_CLASS, vec![Value::Int(i32::try_from(i).unwrap_or(0))])
                        .expect("heap exhausted");
                }
                black_box(request.collect(CollectMode::Normal))
            });
        });
    }
    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
