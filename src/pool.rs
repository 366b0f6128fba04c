//! Bounded worker pool with a saturating admission policy.
//!
//! Workers are spawned lazily and retire after sitting idle for the
//! configured keep-alive. Admission prefers handing work to an idle worker,
//! then grows the pool; once every worker up to the maximum is busy, work
//! queues behind them on an unbounded queue. The process-wide pool is
//! created on first use via [`WorkerPool::shared`] and is never torn down.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::executor::{Executor, Job};

/// Configuration for a [`WorkerPool`].
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Resident worker target; growth beyond it requires every worker busy.
    pub core_size: usize,
    /// Hard ceiling on concurrent workers. Must be at least 1.
    pub max_size: usize,
    /// How long an idle worker waits for work before retiring. Applies to
    /// core workers too; a drained pool may shrink to zero and regrow.
    pub keep_alive: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let cpus = num_cpus::get();
        Self {
            core_size: (cpus / 2).max(1),
            max_size: cpus * 2 + 1,
            keep_alive: Duration::from_secs(60),
        }
    }
}

/// Snapshot of a pool's occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Live worker threads.
    pub workers: usize,
    /// Workers currently running a job.
    pub busy: usize,
    /// Jobs waiting in the queue.
    pub queued: usize,
}

static SHARED: Lazy<WorkerPool> = Lazy::new(WorkerPool::new);

/// Bounded pool of worker threads executing boxed jobs.
///
/// Handles are cheap to clone and share the same pool.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    config: PoolConfig,
    tx: Sender<Job>,
    rx: Receiver<Job>,
    /// Live worker count. Every transition happens under this lock, so the
    /// pool never admits past `config.max_size`.
    admission: Mutex<usize>,
    busy: AtomicUsize,
    next_worker_id: AtomicUsize,
}

impl WorkerPool {
    /// Create a pool with the default configuration.
    pub fn new() -> Self {
        Self::with_config(PoolConfig::default())
    }

    /// Create a pool with a custom configuration.
    pub fn with_config(config: PoolConfig) -> Self {
        let (tx, rx) = unbounded();
        Self {
            inner: Arc::new(PoolInner {
                config,
                tx,
                rx,
                admission: Mutex::new(0),
                busy: AtomicUsize::new(0),
                next_worker_id: AtomicUsize::new(0),
            }),
        }
    }

    /// The process-wide pool, constructed on first call.
    pub fn shared() -> &'static WorkerPool {
        &SHARED
    }

    /// Enqueue `work` for execution. Never blocks the caller.
    ///
    /// If a worker is idle the work queues for it. Otherwise the pool grows
    /// toward `max_size` before any work waits behind a busy worker; only a
    /// pool already at its ceiling queues new work. If a worker cannot be
    /// spawned the rejection is logged and the work is dropped; the caller
    /// is not notified.
    pub fn submit<F>(&self, work: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit_job(Box::new(work));
    }

    pub(crate) fn submit_job(&self, job: Job) {
        let inner = &self.inner;
        let mut workers = inner.admission.lock();
        let busy = inner.busy.load(Ordering::Relaxed).min(*workers);

        // Grow unless an idle worker can take the job. Between core and max
        // the queue refuses to absorb work for busy workers, so saturation
        // drives the pool to its ceiling before backpressure applies.
        if busy == *workers && *workers < inner.config.max_size {
            if let Err(err) = self.spawn_worker(&mut workers) {
                log::warn!("worker pool rejected a job: {err}");
                return;
            }
        }

        // The pool owns the receiver, so the send cannot fail.
        let _ = inner.tx.send(job);
    }

    fn spawn_worker(&self, workers: &mut usize) -> std::io::Result<()> {
        let id = self.inner.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::clone(&self.inner);
        thread::Builder::new()
            .name(format!("pact-worker-{id}"))
            .spawn(move || worker_loop(inner))?;
        *workers += 1;
        Ok(())
    }

    /// Current occupancy snapshot.
    pub fn status(&self) -> PoolStatus {
        let workers = *self.inner.admission.lock();
        PoolStatus {
            workers,
            busy: self.inner.busy.load(Ordering::Relaxed).min(workers),
            queued: self.inner.rx.len(),
        }
    }

    /// This pool's configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor for WorkerPool {
    fn execute(&self, job: Job) {
        self.submit_job(job);
    }
}

fn worker_loop(inner: Arc<PoolInner>) {
    loop {
        match inner.rx.recv_timeout(inner.config.keep_alive) {
            Ok(job) => {
                inner.busy.fetch_add(1, Ordering::Relaxed);
                let outcome = panic::catch_unwind(AssertUnwindSafe(job));
                inner.busy.fetch_sub(1, Ordering::Relaxed);
                if outcome.is_err() {
                    log::error!("a pooled job panicked; the worker continues");
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                let mut workers = inner.admission.lock();
                // A job may have been admitted against this worker while we
                // timed out; stay alive until the queue is visibly drained.
                if inner.rx.is_empty() {
                    *workers -= 1;
                    return;
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                let mut workers = inner.admission.lock();
                *workers -= 1;
                return;
            }
        }
    }
}
