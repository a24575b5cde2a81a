//! Job definitions.
//!
//! A job is one unit of work: an owned callable that receives a [`Context`]
//! for nested submission and waiting. The closure owns whatever argument the
//! caller wants to pass; batches of jobs are consumed exactly once by
//! [`submit`](crate::JobSystem::submit).

use crate::job_system::Context;

/// A unit of work to be executed on a fiber.
///
/// The record is aligned to the cache line so that jobs queued back to back
/// never share a line, keeping concurrent producers from false sharing.
#[repr(align(64))]
pub struct Job {
    work: Box<dyn FnOnce(&Context) + Send + 'static>,
}

impl Job {
    /// Creates a job from a closure.
    ///
    /// The closure runs on a fiber with a 32 KiB stack; see
    /// [`FIBER_STACK_SIZE`](crate::fiber::FIBER_STACK_SIZE). Work that needs
    /// deeper recursion should be split into nested submissions instead.
    pub fn new<F>(work: F) -> Self
    where
        F: FnOnce(&Context) + Send + 'static,
    {
        Job {
            work: Box::new(work),
        }
    }

    pub(crate) fn run(self, ctx: &Context) {
        (self.work)(ctx)
    }
}
