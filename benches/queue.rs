//! Microbenchmarks for the bounded MPMC queue.

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use fiberloom::BoundedQueue;
use std::sync::Arc;
use std::thread;

fn bench_spsc(c: &mut Criterion) {
    const BATCH: usize = 1024;
    let queue: BoundedQueue<usize> = BoundedQueue::new(BATCH);

    let mut group = c.benchmark_group("queue");
    group.throughput(Throughput::Elements(BATCH as u64));

    group.bench_function("spsc_push_pop", |b| {
        b.iter(|| {
            for i in 0..BATCH {
                queue.push(i);
            }
            for _ in 0..BATCH {
                std::hint::black_box(queue.pop());
            }
        })
    });

    group.bench_function("try_push_try_pop", |b| {
        b.iter(|| {
            for i in 0..BATCH {
                assert!(queue.try_push(i).is_ok());
            }
            for _ in 0..BATCH {
                std::hint::black_box(queue.try_pop().unwrap());
            }
        })
    });

    group.finish();
}

fn bench_contended(c: &mut Criterion) {
    const PER_THREAD: usize = 10_000;
    const THREADS: usize = 4;

    let mut group = c.benchmark_group("queue_contended");
    group.throughput(Throughput::Elements((PER_THREAD * THREADS) as u64));
    group.sample_size(20);

    group.bench_function("mpmc_4x4", |b| {
        b.iter(|| {
            let queue = Arc::new(BoundedQueue::new(1024));
            let producers: Vec<_> = (0..THREADS)
                .map(|_| {
                    let queue = Arc::clone(&queue);
                    thread::spawn(move || {
                        for i in 0..PER_THREAD {
                            queue.push(i);
                        }
                    })
                })
                .collect();
            let consumers: Vec<_> = (0..THREADS)
                .map(|_| {
                    let queue = Arc::clone(&queue);
                    thread::spawn(move || {
                        for _ in 0..PER_THREAD {
                            std::hint::black_box(queue.pop());
                        }
                    })
                })
                .collect();
            for handle in producers.into_iter().chain(consumers) {
                handle.join().unwrap();
            }
        })
    });

    group.finish();
}

criterion_group!(benches, bench_spsc, bench_contended);
criterion_main!(benches);
