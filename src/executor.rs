//! Execution context abstraction.
//!
//! The promise layer asks exactly one thing of an execution context: accept
//! a zero-argument unit of work for later or elsewhere execution. A worker
//! pool satisfies it, and so does a UI-thread dispatcher.

use std::sync::Arc;

/// A unit of work accepted by an [`Executor`].
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Capability to run a unit of work on a caller-determined thread or queue.
pub trait Executor: Send + Sync {
    /// Accept `job` for execution on this context.
    fn execute(&self, job: Job);
}

impl<E: Executor + ?Sized> Executor for Arc<E> {
    fn execute(&self, job: Job) {
        (**self).execute(job)
    }
}
