//! Fibers: stackful execution contexts for jobs.
//!
//! Each fiber owns one fixed-size stack and one saved execution context. The
//! register-level save/restore is the one layer that cannot be written
//! portably, so it is isolated behind `corosensei`, which provides exactly
//! the two primitives the scheduler needs: a two-way cooperative swap
//! (`resume`/`suspend`) and a one-way hand-back when a job finishes (the
//! trampoline's final `suspend(Complete)`, after which the coroutine is not
//! resumed again for that job).
//!
//! Every fiber runs the same trampoline: receive a job, execute it with
//! panics contained, decrement the batch counter, then yield `Complete` and
//! loop for the next job. The coroutine is created once and reused for the
//! fiber's whole lifetime.

use crate::counter::WaitCondition;
use crate::job::Job;
use crate::job_system::{Context, Shared};
use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};
use std::cell::Cell;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Stack budget for every fiber. Job bodies must not exceed it.
pub const FIBER_STACK_SIZE: usize = 32 * 1024;

/// Raw pointer to the scheduler's shared state, smuggled into the trampoline.
#[derive(Clone, Copy)]
pub(crate) struct SharedPtr(pub *const Shared);

// SAFETY: the shared state outlives every fiber and is itself Sync.
unsafe impl Send for SharedPtr {}

/// Non-owning pointer to a wait condition. The referenced storage must
/// outlive the sleeping record that carries it: pooled counters live inside
/// the scheduler, ad-hoc conditions live on the parked fiber's own stack.
#[derive(Clone, Copy)]
pub(crate) struct ConditionPtr(pub *const dyn WaitCondition);

// SAFETY: WaitCondition is Send + Sync and the lifetime invariant above
// holds for every place a ConditionPtr is created.
unsafe impl Send for ConditionPtr {}

#[derive(Clone, Copy)]
pub(crate) struct FiberPtr(pub *mut Fiber);

// SAFETY: fibers sit in the scheduler's pool; the pointer is only
// dereferenced by the thread currently holding the fiber's index.
unsafe impl Send for FiberPtr {}

/// What a worker hands to a fiber when swapping into it.
pub(crate) enum FiberInput {
    /// Begin a fresh job on this fiber.
    Start {
        job: Job,
        shared: SharedPtr,
        /// Pool index of the batch counter to decrement on completion.
        counter: usize,
        /// Back-pointer so the trampoline can publish its yielder.
        fiber: FiberPtr,
    },
    /// Continue a fiber that parked in `wait`.
    Resume,
}

/// Why control came back to the hosting worker.
pub(crate) enum FiberYield {
    /// The job called `wait` on an unsatisfied condition. The worker files
    /// the sleeping record; doing it only after the swap has fully completed
    /// is what makes a concurrent wake-and-resume safe.
    Parked(ConditionPtr),
    /// The job ran to completion; the fiber may be returned to the free pool.
    Complete,
}

#[derive(Clone, Copy)]
pub(crate) struct FiberHandle(pub *mut Fiber);

thread_local! {
    /// The fiber currently executing on this thread, if any. Used to decide
    /// between the cooperative and the polling wait path.
    static CURRENT_FIBER: Cell<Option<FiberHandle>> = const { Cell::new(None) };

    /// Set while a suspended fiber is being unwound for teardown. The
    /// trampoline rethrows that unwind instead of containing it, so the
    /// coroutine observes its own cleanup.
    static FIBER_TEARDOWN: Cell<bool> = const { Cell::new(false) };
}

/// Signals batch completion when dropped, so the decrement happens on every
/// exit path out of a job: normal return, contained panic, and the teardown
/// unwind. A lost decrement would strand every waiter on the batch.
struct CompletionGuard<'a> {
    shared: &'a Shared,
    counter: usize,
}

impl Drop for CompletionGuard<'_> {
    fn drop(&mut self) {
        self.shared.complete_batch_job(self.counter);
    }
}

/// A lightweight stackful execution context.
pub struct Fiber {
    // Declared before `stack`: the coroutine must drop first.
    coroutine: Coroutine<FiberInput, FiberYield, (), &'static mut DefaultStack>,
    #[allow(dead_code)]
    stack: Box<DefaultStack>,
    /// Set by the trampoline on each job start; valid only while the fiber
    /// is running.
    yielder: Cell<*const Yielder<FiberInput, FiberYield>>,
}

// SAFETY: a fiber migrates between worker threads only while suspended, and
// is only ever touched by the single thread holding its pool index.
unsafe impl Send for Fiber {}

impl Fiber {
    /// Creates a fiber with a private [`FIBER_STACK_SIZE`] stack and
    /// bootstraps its context to the job trampoline.
    pub(crate) fn new() -> std::io::Result<Self> {
        let mut stack = Box::new(DefaultStack::new(FIBER_STACK_SIZE)?);

        // SAFETY: the coroutine field drops before the stack field, so the
        // 'static promise is never observed broken.
        let stack_ref = unsafe {
            std::mem::transmute::<&mut DefaultStack, &'static mut DefaultStack>(stack.as_mut())
        };

        let coroutine = Coroutine::with_stack(stack_ref, move |yielder, mut input: FiberInput| {
            loop {
                if let FiberInput::Start {
                    job,
                    shared,
                    counter,
                    fiber,
                } = input
                {
                    // SAFETY: the worker that built this input holds the
                    // fiber's index, so the back-pointer is valid and ours.
                    unsafe {
                        (*fiber.0).yielder.set(yielder as *const _);
                    }

                    // SAFETY: Shared outlives all fibers (workers are joined
                    // before the pools drop).
                    let shared = unsafe { &*shared.0 };
                    let ctx = Context::new(shared);

                    let _completion = CompletionGuard { shared, counter };

                    // Panics must not cross the context-switch boundary:
                    // contain them here, log, and keep the fiber. The one
                    // exception is the unwind that tears down a parked
                    // fiber, which has to keep going.
                    let result = catch_unwind(AssertUnwindSafe(|| job.run(&ctx)));
                    if let Err(payload) = result {
                        if FIBER_TEARDOWN.get() {
                            std::panic::resume_unwind(payload);
                        }
                        if let Some(s) = payload.downcast_ref::<&str>() {
                            log::error!("job panicked on fiber: {s}");
                        } else if let Some(s) = payload.downcast_ref::<String>() {
                            log::error!("job panicked on fiber: {s}");
                        } else {
                            log::error!("job panicked on fiber with a non-string payload");
                        }
                    }
                }

                input = yielder.suspend(FiberYield::Complete);
            }
        });

        Ok(Fiber {
            coroutine,
            stack,
            yielder: Cell::new(std::ptr::null()),
        })
    }

    /// Swaps the calling worker into this fiber. Control returns here when
    /// the fiber completes its job or parks in `wait`.
    pub(crate) fn resume(&mut self, input: FiberInput) -> FiberYield {
        let self_ptr = self as *mut Fiber;
        CURRENT_FIBER.set(Some(FiberHandle(self_ptr)));
        let result = self.coroutine.resume(input);
        CURRENT_FIBER.set(None);

        match result {
            CoroutineResult::Yield(yielded) => yielded,
            // The trampoline loops forever; a return can only mean the
            // coroutine was torn down, which we treat as completion.
            CoroutineResult::Return(()) => FiberYield::Complete,
        }
    }

    /// True when the calling code is executing on a fiber.
    pub(crate) fn is_current() -> bool {
        CURRENT_FIBER.get().is_some()
    }

    /// Unwinds a suspended coroutine through whatever job stack it holds.
    ///
    /// Runs under the teardown flag so the trampoline's panic containment
    /// lets the unwind pass instead of swallowing it.
    fn unwind_for_teardown(&mut self) {
        if self.coroutine.started() && !self.coroutine.done() {
            FIBER_TEARDOWN.set(true);
            self.coroutine.force_unwind();
            FIBER_TEARDOWN.set(false);
        }
    }

    /// Suspends the current fiber until the condition is satisfied and a
    /// scheduling loop resumes it.
    ///
    /// # Safety
    ///
    /// Must be called from fiber context, and `condition` must stay valid
    /// until the fiber is resumed (guaranteed for pool counters, and for
    /// conditions on the parked fiber's own stack).
    pub(crate) unsafe fn park_on(condition: *const dyn WaitCondition) {
        let handle = CURRENT_FIBER
            .get()
            .expect("park_on called outside a fiber");
        // SAFETY: the handle was published by the resume that is hosting us,
        // and the yielder was set by our own trampoline.
        unsafe {
            let fiber = &*handle.0;
            let yielder = fiber.yielder.get();
            let _input = (*yielder).suspend(FiberYield::Parked(ConditionPtr(condition)));
            debug_assert!(matches!(_input, FiberInput::Resume));
        }
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        self.unwind_for_teardown();
    }
}
