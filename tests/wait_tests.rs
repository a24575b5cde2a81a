//! Dependency-shaped waiting: fibers parking on batches submitted by their
//! own jobs, driven both from worker fibers and from plain threads.

use fiberloom::{Job, JobSystem, JobSystemConfig, WaitCondition};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

fn system(threads: usize) -> JobSystem {
    JobSystem::with_config(JobSystemConfig {
        thread_count: threads,
        memory_budget: 1,
        pin_workers: false,
    })
    .expect("init failed")
}

/// Job A submits B and C and waits on them; returns only after both ran.
fn diamond(done: &Arc<AtomicUsize>) -> Job {
    let done = Arc::clone(done);
    Job::new(move |ctx| {
        let done_b = Arc::clone(&done);
        let done_c = Arc::clone(&done);
        let children = ctx.submit(vec![
            Job::new(move |_| {
                done_b.fetch_add(1, Ordering::SeqCst);
            }),
            Job::new(move |_| {
                done_c.fetch_add(1, Ordering::SeqCst);
            }),
        ]);
        ctx.wait(&children);
        assert_eq!(done.load(Ordering::SeqCst) % 10, 2);
        done.fetch_add(10, Ordering::SeqCst);
    })
}

#[test]
fn diamond_driven_from_plain_thread() {
    let sys = system(2);
    let done = Arc::new(AtomicUsize::new(0));

    let batch = sys.submit(vec![diamond(&done)]);
    sys.wait(&batch);

    assert_eq!(done.load(Ordering::SeqCst), 12);
    drop(batch);
    sys.shutdown().expect("shutdown failed");
}

#[test]
fn diamond_resolves_on_a_single_worker() {
    // One worker must interleave A (parked) with B and C on the same thread.
    let sys = system(1);
    let done = Arc::new(AtomicUsize::new(0));

    let batch = sys.submit(vec![diamond(&done)]);
    sys.wait(&batch);

    assert_eq!(done.load(Ordering::SeqCst), 12);
    drop(batch);
    sys.shutdown().expect("shutdown failed");
}

#[test]
fn diamond_driven_from_a_worker_fiber() {
    let sys = system(2);
    let done = Arc::new(AtomicUsize::new(0));
    let outer_done = Arc::new(AtomicUsize::new(0));

    let done_inner = Arc::clone(&done);
    let outer_flag = Arc::clone(&outer_done);
    let batch = sys.submit(vec![Job::new(move |ctx| {
        // The diamond root itself runs on a fiber, so its wait parks
        // cooperatively instead of blocking a worker.
        let done = Arc::clone(&done_inner);
        let inner = ctx.submit(vec![{
            let done = Arc::clone(&done);
            Job::new(move |ctx| {
                let done_b = Arc::clone(&done);
                let done_c = Arc::clone(&done);
                let children = ctx.submit(vec![
                    Job::new(move |_| {
                        done_b.fetch_add(1, Ordering::SeqCst);
                    }),
                    Job::new(move |_| {
                        done_c.fetch_add(1, Ordering::SeqCst);
                    }),
                ]);
                ctx.wait(&children);
                done.fetch_add(10, Ordering::SeqCst);
            })
        }]);
        ctx.wait(&inner);
        outer_flag.fetch_add(1, Ordering::SeqCst);
    })]);

    sys.wait(&batch);
    assert_eq!(done.load(Ordering::SeqCst), 12);
    assert_eq!(outer_done.load(Ordering::SeqCst), 1);
    drop(batch);
    sys.shutdown().expect("shutdown failed");
}

#[test]
fn fibers_can_park_on_borrowed_conditions() {
    // The condition handed to wait is a short-lived borrow living on the
    // parked fiber's own stack, not a 'static value.
    struct Flag<'a>(&'a AtomicBool);

    impl WaitCondition for Flag<'_> {
        fn is_satisfied(&self) -> bool {
            self.0.load(Ordering::Acquire)
        }
    }

    let sys = system(2);
    let done = Arc::new(AtomicUsize::new(0));

    let done_clone = Arc::clone(&done);
    let batch = sys.submit(vec![Job::new(move |ctx| {
        let flag = Arc::new(AtomicBool::new(false));
        let setter = Arc::clone(&flag);
        let inner = ctx.submit(vec![Job::new(move |_| {
            setter.store(true, Ordering::Release);
        })]);

        ctx.wait(&Flag(&flag));
        assert!(flag.load(Ordering::Acquire));
        ctx.wait(&inner);
        done_clone.fetch_add(1, Ordering::SeqCst);
    })]);

    sys.wait(&batch);
    assert_eq!(done.load(Ordering::SeqCst), 1);
    drop(batch);
    sys.shutdown().expect("shutdown failed");
}

#[test]
fn deep_nesting_chain() {
    // Four levels of submit-and-wait, comfortably inside a 32-entry pool.
    let sys = system(2);
    let depth_sum = Arc::new(AtomicUsize::new(0));

    fn descend(ctx: &fiberloom::Context, depth: usize, sum: Arc<AtomicUsize>) {
        sum.fetch_add(depth, Ordering::SeqCst);
        if depth == 0 {
            return;
        }
        let child_sum = Arc::clone(&sum);
        let child = ctx.submit(vec![Job::new(move |ctx| {
            descend(ctx, depth - 1, child_sum);
        })]);
        ctx.wait(&child);
    }

    let sum = Arc::clone(&depth_sum);
    let batch = sys.submit(vec![Job::new(move |ctx| descend(ctx, 4, sum))]);
    sys.wait(&batch);

    assert_eq!(depth_sum.load(Ordering::SeqCst), 4 + 3 + 2 + 1);
    drop(batch);
    sys.shutdown().expect("shutdown failed");
}
