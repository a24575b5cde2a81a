//! # fiberloom: a fiber-based cooperative job scheduler
//!
//! A fixed pool of worker threads executes jobs hosted on lightweight
//! stackful fibers, coordinated through a bounded lock-free MPMC queue and
//! atomic-counter completion signals.
//!
//! ## Architecture
//!
//! - **Fibers**: stackful execution contexts with a private 32 KiB stack,
//!   suspended and resumed cooperatively; the only suspension point is
//!   [`Context::wait`].
//! - **Bounded queue**: a from-scratch lock-free MPMC ring buffer with
//!   per-slot turn counters; it carries ready jobs, sleeping jobs, and the
//!   free-index lists of both pools.
//! - **Counters**: atomic down-counters implementing [`WaitCondition`],
//!   satisfied when every job of a batch has finished.
//! - **Workers**: OS threads looping over "run one ready job, rescan the
//!   sleeping queue".
//!
//! Waiting adapts to the caller: a job waiting on another batch parks its
//! fiber and frees the worker for unrelated work, while a plain thread runs
//! a private copy of the scheduling loop so it can never deadlock the pool.
//!
//! ## Example
//!
//! ```no_run
//! use fiberloom::{Job, JobSystem};
//!
//! let system = JobSystem::new(4).expect("scheduler init");
//!
//! let batch = system.submit(vec![
//!     Job::new(|_ctx| println!("job a")),
//!     Job::new(|ctx| {
//!         // Jobs can submit and wait on nested batches.
//!         let inner = ctx.submit(vec![Job::new(|_| println!("nested"))]);
//!         ctx.wait(&inner);
//!     }),
//! ]);
//!
//! system.wait(&batch);
//! drop(batch);
//! system.shutdown().expect("clean shutdown");
//! ```
//!
//! ## Capacity planning
//!
//! All pools and queues are sized at construction to `memory_budget * 32`
//! entries and never grow. Exhaustion stalls submission until entries are
//! recycled; size the budget for the worst-case number of in-flight jobs.

pub mod counter;
pub mod fiber;
pub mod job;
pub mod job_system;
pub mod queue;
mod worker;

pub use counter::{Counter, WaitCondition};
pub use fiber::FIBER_STACK_SIZE;
pub use job::Job;
pub use job_system::{
    BatchHandle, Context, InitError, JobSystem, JobSystemConfig, ShutdownError,
};
pub use queue::BoundedQueue;
