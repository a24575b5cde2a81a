//! Worker threads and the scheduling loop.
//!
//! Each worker repeats the same step until the quit counter is signaled:
//! run one ready job context on its fiber, then rescan the sleeping queue
//! and move newly-satisfied jobs back to the ready queue. The identical step
//! also backs the plain-thread wait path, so an outside caller waiting on a
//! batch helps drain the queues instead of deadlocking the pool.

use crate::fiber::{Fiber, FiberInput, FiberPtr, FiberYield, SharedPtr};
use crate::job_system::{JobContext, Run, Shared, SleepingJob};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Sleep between loop iterations that found no work.
pub(crate) const IDLE_INTERVAL: Duration = Duration::from_millis(2);

/// A worker thread driving the scheduling loop.
pub(crate) struct Worker {
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    pub(crate) fn spawn(
        id: usize,
        shared: Arc<Shared>,
        pin_to_core: bool,
    ) -> Result<Self, crate::InitError> {
        let handle = thread::Builder::new()
            .name(format!("fiber-worker-{id}"))
            .spawn(move || {
                if pin_to_core {
                    if let Some(core_ids) = core_affinity::get_core_ids() {
                        if let Some(core) = core_ids.get(id) {
                            core_affinity::set_for_current(*core);
                        }
                    }
                }
                run_loop(&shared);
            })
            .map_err(crate::InitError::SpawnWorker)?;

        Ok(Worker {
            handle: Some(handle),
        })
    }

    pub(crate) fn join(mut self) -> thread::Result<()> {
        match self.handle.take() {
            Some(handle) => handle.join(),
            None => Ok(()),
        }
    }
}

fn run_loop(shared: &Shared) {
    while !shared.should_quit() {
        if !drive_once(shared) {
            thread::sleep(IDLE_INTERVAL);
        }
    }
}

/// One iteration of the scheduling loop. Returns whether any work was done.
pub(crate) fn drive_once(shared: &Shared) -> bool {
    let mut did_work = false;

    if let Some(ctx) = shared.ready.try_pop() {
        run_job(shared, ctx);
        did_work = true;
    }

    // Rescan the sleeping queue: wake everything that became satisfied. The
    // first unsatisfied record is pushed back and ends the pass, so the
    // queue rotates and every record keeps getting rechecked without this
    // pass ever chasing its own re-pushes.
    while let Some(sleeping) = shared.sleeping.try_pop() {
        // SAFETY: the condition outlives the record (pool counters live in
        // Shared; ad-hoc conditions live on the still-parked fiber's stack).
        let satisfied = unsafe { (*sleeping.waiting_on.0).is_satisfied() };
        if satisfied {
            shared.ready.push(sleeping.ctx);
            did_work = true;
        } else {
            shared.sleeping.push(sleeping);
            break;
        }
    }

    did_work
}

/// Swaps into a fiber and files the outcome: recycle on completion, file a
/// sleeping record on park.
fn run_job(shared: &Shared, ctx: JobContext) {
    let JobContext {
        fiber,
        counter,
        run,
    } = ctx;

    // SAFETY: we popped this context off the ready queue, so we hold the
    // fiber's index exclusively until we file it somewhere else.
    let fiber_ref = unsafe { shared.fiber_mut(fiber) };
    let fiber_ptr = FiberPtr(fiber_ref as *mut Fiber);

    let input = match run {
        Run::Start(job) => FiberInput::Start {
            job,
            shared: SharedPtr(shared as *const Shared),
            counter,
            fiber: fiber_ptr,
        },
        Run::Resume => FiberInput::Resume,
    };

    match fiber_ref.resume(input) {
        FiberYield::Complete => {
            // The trampoline already decremented the batch counter.
            shared.recycle_fiber(fiber);
        }
        FiberYield::Parked(condition) => {
            // Filed only now, after the swap back has fully completed, so a
            // racing wake can never resume a fiber that is still running.
            shared.sleeping.push(SleepingJob {
                ctx: JobContext {
                    fiber,
                    counter,
                    run: Run::Resume,
                },
                waiting_on: condition,
            });
        }
    }
}
