use fiberloom::{Job, JobSystem, JobSystemConfig};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

fn main() {
    println!("fiberloom - fiber-based cooperative job scheduler\n");

    let system = JobSystem::with_config(JobSystemConfig {
        thread_count: 4,
        memory_budget: 4,
        pin_workers: false,
    })
    .expect("scheduler init failed");
    println!("Initialized with {} worker threads\n", system.worker_count());

    // Simple batch
    println!("Example 1: a batch of parallel jobs");
    let sum = Arc::new(AtomicUsize::new(0));
    let mut jobs = Vec::new();
    for i in 0..100 {
        let sum = Arc::clone(&sum);
        jobs.push(Job::new(move |_| {
            sum.fetch_add(i, Ordering::Relaxed);
        }));
    }
    let start = Instant::now();
    let batch = system.submit(jobs);
    system.wait(&batch);
    drop(batch);
    println!(
        "  100 jobs in {:?}, sum = {} (expected {})\n",
        start.elapsed(),
        sum.load(Ordering::Relaxed),
        (0..100).sum::<usize>()
    );

    // Nested dependency: a parent job forks children and waits on them
    println!("Example 2: dependent jobs via fiber parking");
    let order = Arc::new(AtomicUsize::new(0));
    let order_outer = Arc::clone(&order);
    let batch = system.submit(vec![Job::new(move |ctx| {
        let order_b = Arc::clone(&order_outer);
        let order_c = Arc::clone(&order_outer);
        let children = ctx.submit(vec![
            Job::new(move |_| {
                order_b.fetch_add(1, Ordering::SeqCst);
            }),
            Job::new(move |_| {
                order_c.fetch_add(1, Ordering::SeqCst);
            }),
        ]);
        ctx.wait(&children);
        assert_eq!(order_outer.load(Ordering::SeqCst), 2);
        println!("  parent resumed after both children finished");
    })]);
    system.wait(&batch);
    drop(batch);

    system.shutdown().expect("shutdown failed");
    println!("\nDone.");
}
