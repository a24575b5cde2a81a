use fiberloom::BoundedQueue;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

#[test]
fn mpmc_no_loss_no_duplication() {
    const PRODUCERS: usize = 4;
    const CONSUMERS: usize = 4;
    const PER_PRODUCER: usize = 10_000;
    const TOTAL: usize = PRODUCERS * PER_PRODUCER;

    let queue = Arc::new(BoundedQueue::new(TOTAL));
    let popped = Arc::new(AtomicUsize::new(0));

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    queue.push(p * PER_PRODUCER + i);
                }
            })
        })
        .collect();

    let consumers: Vec<_> = (0..CONSUMERS)
        .map(|_| {
            let queue = Arc::clone(&queue);
            let popped = Arc::clone(&popped);
            thread::spawn(move || {
                let mut seen = Vec::new();
                loop {
                    if let Some(value) = queue.try_pop() {
                        popped.fetch_add(1, Ordering::Relaxed);
                        seen.push(value);
                    } else if popped.load(Ordering::Relaxed) >= TOTAL {
                        break;
                    } else {
                        std::hint::spin_loop();
                    }
                }
                seen
            })
        })
        .collect();

    for producer in producers {
        producer.join().expect("producer panicked");
    }

    let mut all = HashSet::new();
    let mut count = 0;
    for consumer in consumers {
        for value in consumer.join().expect("consumer panicked") {
            assert!(all.insert(value), "duplicate item {value}");
            count += 1;
        }
    }

    assert_eq!(count, TOTAL, "items lost");
    assert_eq!(all.len(), TOTAL);
    assert!(queue.try_pop().is_none());
}

#[test]
fn blocking_ops_under_contention_on_small_queue() {
    const PRODUCERS: usize = 2;
    const CONSUMERS: usize = 2;
    const PER_PRODUCER: usize = 20_000;

    // Much smaller than the item count, so producers genuinely block on
    // full slots and consumers on empty ones.
    let queue = Arc::new(BoundedQueue::new(64));
    let sum = Arc::new(AtomicUsize::new(0));

    let consumers: Vec<_> = (0..CONSUMERS)
        .map(|_| {
            let queue = Arc::clone(&queue);
            let sum = Arc::clone(&sum);
            thread::spawn(move || {
                for _ in 0..(PRODUCERS * PER_PRODUCER / CONSUMERS) {
                    sum.fetch_add(queue.pop(), Ordering::Relaxed);
                }
            })
        })
        .collect();

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|_| {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                for i in 1..=PER_PRODUCER {
                    queue.push(i);
                }
            })
        })
        .collect();

    for handle in producers.into_iter().chain(consumers) {
        handle.join().expect("thread panicked");
    }

    let expected = PRODUCERS * (PER_PRODUCER * (PER_PRODUCER + 1) / 2);
    assert_eq!(sum.load(Ordering::Relaxed), expected);
}
