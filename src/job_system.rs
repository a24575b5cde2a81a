//! The job scheduler: fixed pools of fibers and counters, the ready and
//! sleeping queues, and the submit/wait surface.
//!
//! The whole scheduler is one explicit handle. Constructing a [`JobSystem`]
//! spawns the worker threads; [`JobSystem::shutdown`] signals the quit
//! counter and joins them. There is no process-wide singleton, and every
//! pool entry is addressed by an explicit index rather than recovered from a
//! pointer.
//!
//! Capacity planning is the caller's contract: every pool and queue holds
//! `memory_budget * 32` entries, and pool exhaustion stalls submission until
//! an entry frees up. It is never an error.

use crate::counter::{Counter, WaitCondition};
use crate::fiber::{ConditionPtr, Fiber};
use crate::job::Job;
use crate::queue::BoundedQueue;
use crate::worker::{self, Worker};
use serde::{Deserialize, Serialize};
use std::cell::UnsafeCell;
use std::sync::Arc;
use std::thread;

/// Pool entries per unit of memory budget. One unit is roughly one megabyte
/// of fiber stacks (32 fibers at 32 KiB each).
const ENTRIES_PER_BUDGET_UNIT: usize = 32;

/// Configuration for a [`JobSystem`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSystemConfig {
    /// Worker threads to spawn. Zero means hardware concurrency minus one,
    /// leaving a core for the submitting thread.
    pub thread_count: usize,
    /// Pool sizing knob: every pool and queue gets `memory_budget * 32`
    /// entries. Size it for the worst-case number of in-flight jobs.
    pub memory_budget: usize,
    /// Pin each worker to a CPU core.
    pub pin_workers: bool,
}

impl Default for JobSystemConfig {
    fn default() -> Self {
        JobSystemConfig {
            thread_count: 0,
            memory_budget: 100,
            pin_workers: false,
        }
    }
}

/// Fatal startup failures. Anything here means the scheduler never existed;
/// there is no partial initialization to clean up.
#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("memory budget must be at least 1")]
    ZeroMemoryBudget,
    #[error("failed to query hardware concurrency")]
    HardwareConcurrency(#[source] std::io::Error),
    #[error("failed to allocate a fiber stack")]
    StackAllocation(#[source] std::io::Error),
    #[error("failed to spawn worker thread")]
    SpawnWorker(#[source] std::io::Error),
}

/// Teardown failures reported by [`JobSystem::shutdown`].
#[derive(Debug, thiserror::Error)]
pub enum ShutdownError {
    #[error("{0} worker thread(s) panicked")]
    WorkerPanicked(usize),
}

/// How a ready job context should enter its fiber.
pub(crate) enum Run {
    /// First dispatch: the fiber starts the job from its trampoline.
    Start(Job),
    /// The fiber previously parked and resumes mid-job.
    Resume,
}

/// The currently-bound triple of a scheduled job: which fiber hosts it,
/// which counter it decrements, and whether it starts or resumes. Lives only
/// while queued or running.
pub(crate) struct JobContext {
    pub fiber: usize,
    pub counter: usize,
    pub run: Run,
}

/// A parked job and the condition it is blocked on.
pub(crate) struct SleepingJob {
    pub ctx: JobContext,
    pub waiting_on: ConditionPtr,
}

/// Interior-mutable pool cell for a fiber.
struct FiberCell(UnsafeCell<Fiber>);

// SAFETY: a fiber is only accessed by the thread that currently holds its
// pool index (via the free list, a job context, or a sleeping record), so
// access is externally serialized.
unsafe impl Sync for FiberCell {}
unsafe impl Send for FiberCell {}

/// State shared between the handle, the workers, and running fibers.
pub(crate) struct Shared {
    fibers: Box<[FiberCell]>,
    free_fibers: BoundedQueue<usize>,
    counters: Box<[Counter]>,
    free_counters: BoundedQueue<usize>,
    pub(crate) ready: BoundedQueue<JobContext>,
    pub(crate) sleeping: BoundedQueue<SleepingJob>,
    /// Workers run until this reaches zero.
    quit: Counter,
}

impl Shared {
    fn new(pool_size: usize) -> Result<Self, InitError> {
        let fibers = (0..pool_size)
            .map(|_| Fiber::new().map(|f| FiberCell(UnsafeCell::new(f))))
            .collect::<Result<Box<[_]>, _>>()
            .map_err(InitError::StackAllocation)?;
        let counters: Box<[Counter]> = (0..pool_size).map(|_| Counter::default()).collect();

        let free_fibers = BoundedQueue::new(pool_size);
        let free_counters = BoundedQueue::new(pool_size);
        for i in 0..pool_size {
            free_fibers.push(i);
            free_counters.push(i);
        }

        Ok(Shared {
            fibers,
            free_fibers,
            counters,
            free_counters,
            ready: BoundedQueue::new(pool_size),
            sleeping: BoundedQueue::new(pool_size),
            quit: Counter::new(1),
        })
    }

    /// Exclusive access to a pooled fiber.
    ///
    /// # Safety
    ///
    /// The caller must hold the fiber's index, i.e. have popped it from the
    /// free list or taken it out of a job context or sleeping record.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn fiber_mut(&self, index: usize) -> &mut Fiber {
        unsafe { &mut *self.fibers[index].0.get() }
    }

    pub(crate) fn counter(&self, index: usize) -> &Counter {
        &self.counters[index]
    }

    pub(crate) fn should_quit(&self) -> bool {
        self.quit.is_satisfied()
    }

    fn signal_quit(&self) {
        self.quit.decrement();
    }

    /// Allocates a counter, arms it for the batch, and queues one ready job
    /// context per job. Stalls while the fiber or counter pool is exhausted.
    fn submit(&self, jobs: Vec<Job>) -> usize {
        let counter = self.free_counters.pop();
        self.counters[counter].prepare(jobs.len() as u64);

        for job in jobs {
            let fiber = self.free_fibers.pop();
            self.ready.push(JobContext {
                fiber,
                counter,
                run: Run::Start(job),
            });
        }

        counter
    }

    /// Blocks the calling execution until the condition is satisfied.
    ///
    /// On a fiber this parks cooperatively: the hosting worker files the
    /// sleeping record and goes on executing unrelated jobs. On a plain
    /// thread it runs a private copy of the scheduling loop, so an outside
    /// waiter can never deadlock the pool.
    pub(crate) fn wait(&self, condition: &dyn WaitCondition) {
        if condition.is_satisfied() {
            return;
        }

        if Fiber::is_current() {
            // SAFETY: `condition` lives on this fiber's stack or beyond, and
            // the fiber's stack stays alive for exactly as long as it is
            // parked, so erasing the borrow's lifetime cannot outlive the
            // referent.
            unsafe {
                let condition: &'static dyn WaitCondition = std::mem::transmute(condition);
                Fiber::park_on(condition);
            }
            debug_assert!(condition.is_satisfied());
        } else {
            while !condition.is_satisfied() {
                if !worker::drive_once(self) {
                    thread::sleep(worker::IDLE_INTERVAL);
                }
            }
        }
    }

    /// Completion bookkeeping for one finished job: decrement the batch
    /// counter, then release the job's reference on it. Called from the
    /// fiber trampoline.
    pub(crate) fn complete_batch_job(&self, counter: usize) {
        self.counters[counter].decrement();
        self.release_counter(counter);
    }

    /// Drops one reference on a pooled counter, recycling it on the last.
    pub(crate) fn release_counter(&self, index: usize) {
        if self.counters[index].release_ref() {
            self.free_counters.push(index);
        }
    }

    pub(crate) fn recycle_fiber(&self, index: usize) {
        self.free_fibers.push(index);
    }
}

/// An opaque "batch done" handle returned by [`JobSystem::submit`].
///
/// Implements [`WaitCondition`]; pass it to [`JobSystem::wait`] or
/// [`Context::wait`]. Dropping the handle releases the caller's reference on
/// the underlying pooled counter.
pub struct BatchHandle<'a> {
    shared: &'a Shared,
    index: usize,
}

impl BatchHandle<'_> {
    /// Jobs in the batch that have not finished yet.
    pub fn remaining(&self) -> u64 {
        self.shared.counter(self.index).value()
    }
}

impl WaitCondition for BatchHandle<'_> {
    fn is_satisfied(&self) -> bool {
        self.shared.counter(self.index).is_satisfied()
    }
}

impl Drop for BatchHandle<'_> {
    fn drop(&mut self) {
        self.shared.release_counter(self.index);
    }
}

/// Capability handed to running jobs for nested submission and waiting.
///
/// Waiting through a `Context` parks the calling fiber instead of blocking
/// its worker thread, which is what makes dependent job graphs safe to
/// express from inside jobs.
pub struct Context<'a> {
    shared: &'a Shared,
}

impl<'a> Context<'a> {
    pub(crate) fn new(shared: &'a Shared) -> Self {
        Context { shared }
    }

    /// Submits a batch of jobs. See [`JobSystem::submit`].
    pub fn submit(&self, jobs: Vec<Job>) -> BatchHandle<'a> {
        BatchHandle {
            shared: self.shared,
            index: self.shared.submit(jobs),
        }
    }

    /// Blocks the current fiber until the condition is satisfied, yielding
    /// its worker to other jobs in the meantime.
    pub fn wait(&self, condition: &dyn WaitCondition) {
        self.shared.wait(condition);
    }
}

/// A fiber-based cooperative job scheduler.
///
/// See the [crate docs](crate) for an overview and an example.
pub struct JobSystem {
    shared: Arc<Shared>,
    workers: Vec<Worker>,
}

impl JobSystem {
    /// Creates a scheduler with `thread_count` workers (0 = auto-detect) and
    /// the default memory budget.
    pub fn new(thread_count: usize) -> Result<Self, InitError> {
        JobSystem::with_config(JobSystemConfig {
            thread_count,
            ..JobSystemConfig::default()
        })
    }

    /// Creates a scheduler from an explicit configuration.
    pub fn with_config(config: JobSystemConfig) -> Result<Self, InitError> {
        if config.memory_budget == 0 {
            return Err(InitError::ZeroMemoryBudget);
        }

        let thread_count = if config.thread_count == 0 {
            thread::available_parallelism()
                .map_err(InitError::HardwareConcurrency)?
                .get()
                .saturating_sub(1)
                .max(1)
        } else {
            config.thread_count
        };

        let pool_size = config.memory_budget * ENTRIES_PER_BUDGET_UNIT;
        let shared = Arc::new(Shared::new(pool_size)?);

        let workers = (0..thread_count)
            .map(|id| Worker::spawn(id, Arc::clone(&shared), config.pin_workers))
            .collect::<Result<Vec<_>, _>>()?;

        log::debug!(
            "job system up: {thread_count} workers, {pool_size} fibers/counters"
        );

        Ok(JobSystem { shared, workers })
    }

    /// Submits a batch of jobs and returns a handle that is satisfied once
    /// every job in the batch has finished.
    ///
    /// May stall (not fail) while the fiber or counter pool is exhausted.
    pub fn submit(&self, jobs: Vec<Job>) -> BatchHandle<'_> {
        BatchHandle {
            index: self.shared.submit(jobs),
            shared: &self.shared,
        }
    }

    /// Blocks the calling execution until the condition is satisfied.
    ///
    /// Callable from anywhere: inside a job it parks the fiber, outside it
    /// drives a private scheduling loop on the calling thread.
    pub fn wait(&self, condition: &dyn WaitCondition) {
        self.shared.wait(condition);
    }

    /// Number of worker threads.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Signals the quit counter and joins all workers.
    ///
    /// Jobs still queued when quit is signaled are dropped unrun; callers
    /// that care must wait on their batches first.
    pub fn shutdown(mut self) -> Result<(), ShutdownError> {
        let panicked = self.teardown();
        if panicked > 0 {
            Err(ShutdownError::WorkerPanicked(panicked))
        } else {
            Ok(())
        }
    }

    fn teardown(&mut self) -> usize {
        if self.workers.is_empty() {
            return 0;
        }
        self.shared.signal_quit();
        let mut panicked = 0;
        for worker in std::mem::take(&mut self.workers) {
            if worker.join().is_err() {
                panicked += 1;
            }
        }
        panicked
    }
}

impl Drop for JobSystem {
    fn drop(&mut self) {
        let panicked = self.teardown();
        if panicked > 0 {
            log::error!("{panicked} worker thread(s) panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn small_system(threads: usize) -> JobSystem {
        JobSystem::with_config(JobSystemConfig {
            thread_count: threads,
            memory_budget: 1,
            pin_workers: false,
        })
        .expect("init failed")
    }

    #[test]
    fn zero_memory_budget_is_rejected() {
        let result = JobSystem::with_config(JobSystemConfig {
            memory_budget: 0,
            ..JobSystemConfig::default()
        });
        assert!(matches!(result, Err(InitError::ZeroMemoryBudget)));
    }

    #[test]
    fn worker_count_matches_config() {
        let system = small_system(3);
        assert_eq!(system.worker_count(), 3);
        system.shutdown().expect("shutdown failed");
    }

    #[test]
    fn single_job_runs() {
        let system = small_system(2);
        let ran = Arc::new(AtomicUsize::new(0));

        let ran_clone = Arc::clone(&ran);
        let batch = system.submit(vec![Job::new(move |_| {
            ran_clone.fetch_add(1, Ordering::SeqCst);
        })]);
        system.wait(&batch);

        assert_eq!(ran.load(Ordering::SeqCst), 1);
        drop(batch);
        system.shutdown().expect("shutdown failed");
    }

    #[test]
    fn empty_batch_is_immediately_satisfied() {
        let system = small_system(1);
        let batch = system.submit(Vec::new());
        assert!(batch.is_satisfied());
        system.wait(&batch);
        drop(batch);
        system.shutdown().expect("shutdown failed");
    }

    #[test]
    fn batch_handle_reports_remaining() {
        let system = small_system(1);
        let batch = system.submit(Vec::new());
        assert_eq!(batch.remaining(), 0);
        drop(batch);
        system.shutdown().expect("shutdown failed");
    }
}
