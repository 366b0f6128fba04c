//! Resolvable promise over a pooled computation.
//!
//! A [`Promise`] tracks the eventual single outcome of one computation
//! submitted to a [`WorkerPool`]. Success and failure callbacks can be
//! registered at any point in its lifetime, each optionally bound to an
//! [`Executor`] that the delivery is marshaled to. Callbacks registered
//! before the outcome is known fire when the promise settles, in
//! registration order; callbacks registered afterward fire immediately on
//! the registering thread, before the registration call returns.

use std::any::Any;
use std::fmt;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::TaskError;
use crate::executor::{Executor, Job};
use crate::pool::WorkerPool;

type SuccessCallback<T> = Box<dyn FnOnce(T) + Send + 'static>;
type FailureCallback = Box<dyn FnOnce(TaskError) + Send + 'static>;
type Context = Option<Box<dyn Executor>>;

enum State<T> {
    Pending,
    Fulfilled(T),
    Failed(TaskError),
}

/// State and callback registries, guarded as one unit. The lock is released
/// before any user callback is invoked, so a callback may itself register
/// on the same promise.
struct Inner<T> {
    state: State<T>,
    on_ok: Vec<(Context, SuccessCallback<T>)>,
    on_err: Vec<(Context, FailureCallback)>,
}

/// Handle to the eventual single outcome of a pooled computation.
///
/// Handles are cheap to clone; every clone observes the same outcome and
/// appends to the same registries.
pub struct Promise<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> Promise<T> {
    /// Schedule `computation` on the shared pool.
    pub fn submit<F>(computation: F) -> Self
    where
        F: FnOnce() -> Result<T, TaskError> + Send + 'static,
    {
        Self::submit_on(WorkerPool::shared(), computation)
    }

    /// Schedule `computation` on `pool`.
    ///
    /// Returns immediately with a pending promise; the only side effect on
    /// the calling thread is the scheduling itself. The pool keeps no
    /// reference to the promise; the submitted job owns the completion
    /// side and reports the outcome through it. A panicking computation
    /// settles the promise with [`TaskError::Panicked`].
    pub fn submit_on<F>(pool: &WorkerPool, computation: F) -> Self
    where
        F: FnOnce() -> Result<T, TaskError> + Send + 'static,
    {
        let promise = Self {
            inner: Arc::new(Mutex::new(Inner {
                state: State::Pending,
                on_ok: Vec::new(),
                on_err: Vec::new(),
            })),
        };
        let inner = Arc::clone(&promise.inner);
        pool.submit(move || {
            let outcome = match panic::catch_unwind(AssertUnwindSafe(computation)) {
                Ok(result) => result,
                Err(payload) => Err(TaskError::Panicked(panic_message(payload))),
            };
            settle(&inner, outcome);
        });
        promise
    }

    /// Register `callback` for the success outcome.
    ///
    /// While the promise is pending the callback is recorded and later runs
    /// on the thread that resolves the promise. If the promise is already
    /// fulfilled it runs right here, before this call returns. If the
    /// promise failed it never runs.
    pub fn on_success<F>(&self, callback: F) -> &Self
    where
        F: FnOnce(T) + Send + 'static,
    {
        self.register_success(None, Box::new(callback))
    }

    /// Register `callback` for the success outcome, marshaled to `context`.
    ///
    /// The context only applies to deliveries that happen at resolution
    /// time; an already-fulfilled promise still delivers inline on the
    /// registering thread.
    pub fn on_success_via<E, F>(&self, context: E, callback: F) -> &Self
    where
        E: Executor + 'static,
        F: FnOnce(T) + Send + 'static,
    {
        self.register_success(Some(Box::new(context)), Box::new(callback))
    }

    /// Register `callback` for the failure outcome.
    ///
    /// Mirror of [`Promise::on_success`]: pending registrations run when
    /// the promise fails, an already-failed promise delivers inline before
    /// this call returns, and a fulfilled promise never invokes it.
    pub fn on_failure<F>(&self, callback: F) -> &Self
    where
        F: FnOnce(TaskError) + Send + 'static,
    {
        self.register_failure(None, Box::new(callback))
    }

    /// Register `callback` for the failure outcome, marshaled to `context`.
    pub fn on_failure_via<E, F>(&self, context: E, callback: F) -> &Self
    where
        E: Executor + 'static,
        F: FnOnce(TaskError) + Send + 'static,
    {
        self.register_failure(Some(Box::new(context)), Box::new(callback))
    }

    /// Whether the promise has settled.
    pub fn is_settled(&self) -> bool {
        !matches!(self.inner.lock().state, State::Pending)
    }

    /// The settled outcome, if any. Non-blocking.
    pub fn outcome(&self) -> Option<Result<T, TaskError>> {
        match &self.inner.lock().state {
            State::Pending => None,
            State::Fulfilled(value) => Some(Ok(value.clone())),
            State::Failed(error) => Some(Err(error.clone())),
        }
    }

    fn register_success(&self, context: Context, callback: SuccessCallback<T>) -> &Self {
        let mut inner = self.inner.lock();
        match &inner.state {
            State::Pending => inner.on_ok.push((context, callback)),
            State::Fulfilled(value) => {
                let value = value.clone();
                drop(inner);
                // Late subscriber: deliver now, on this thread, ignoring
                // any context. A panic here is swallowed so registration
                // never unwinds into the caller.
                let _ = panic::catch_unwind(AssertUnwindSafe(move || callback(value)));
            }
            State::Failed(_) => {}
        }
        self
    }

    fn register_failure(&self, context: Context, callback: FailureCallback) -> &Self {
        let mut inner = self.inner.lock();
        match &inner.state {
            State::Pending => inner.on_err.push((context, callback)),
            State::Failed(error) => {
                let error = error.clone();
                drop(inner);
                let _ = panic::catch_unwind(AssertUnwindSafe(move || callback(error)));
            }
            State::Fulfilled(_) => {}
        }
        self
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        let state = match inner.state {
            State::Pending => "pending",
            State::Fulfilled(_) => "fulfilled",
            State::Failed(_) => "failed",
        };
        f.debug_struct("Promise")
            .field("state", &state)
            .field("success_subscribers", &inner.on_ok.len())
            .field("failure_subscribers", &inner.on_err.len())
            .finish()
    }
}

/// Transition the promise out of `Pending` and notify the matching
/// registry, in registration order. The registry snapshot is taken under
/// the lock and iterated outside it; the opposite registry is left
/// untouched and simply never fires.
fn settle<T: Clone + Send + 'static>(inner: &Arc<Mutex<Inner<T>>>, outcome: Result<T, TaskError>) {
    let mut guard = inner.lock();
    if !matches!(guard.state, State::Pending) {
        // Settled is final.
        return;
    }
    match outcome {
        Ok(value) => {
            guard.state = State::Fulfilled(value.clone());
            let callbacks = mem::take(&mut guard.on_ok);
            drop(guard);
            for (context, callback) in callbacks {
                let value = value.clone();
                dispatch(context, Box::new(move || callback(value)));
            }
        }
        Err(error) => {
            guard.state = State::Failed(error.clone());
            let callbacks = mem::take(&mut guard.on_err);
            drop(guard);
            for (context, callback) in callbacks {
                let error = error.clone();
                dispatch(context, Box::new(move || callback(error)));
            }
        }
    }
}

/// Hand one delivery to its context, or run it inline on the resolving
/// thread. Each inline delivery gets its own isolation boundary so one
/// panicking subscriber cannot suppress notification of the rest.
fn dispatch(context: Context, delivery: Job) {
    match context {
        Some(context) => context.execute(delivery),
        None => {
            if panic::catch_unwind(AssertUnwindSafe(delivery)).is_err() {
                log::warn!("a promise callback panicked during delivery");
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => match payload.downcast::<&'static str>() {
            Ok(message) => (*message).to_string(),
            Err(_) => "opaque panic payload".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolConfig;
    use crossbeam_channel::{Sender, bounded, unbounded};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    fn test_pool() -> WorkerPool {
        WorkerPool::with_config(PoolConfig {
            core_size: 2,
            max_size: 4,
            keep_alive: Duration::from_millis(100),
        })
    }

    fn wait_until_settled<T: Clone + Send + 'static>(promise: &Promise<T>) {
        let deadline = Instant::now() + Duration::from_secs(1);
        while !promise.is_settled() {
            assert!(Instant::now() < deadline, "promise should settle");
            std::thread::yield_now();
        }
    }

    /// Records deliveries without running them until drained.
    struct QueueExecutor {
        jobs: Sender<Job>,
    }

    impl Executor for QueueExecutor {
        fn execute(&self, job: Job) {
            let _ = self.jobs.send(job);
        }
    }

    #[test]
    fn delivers_value_to_early_subscriber() {
        let pool = test_pool();
        let (tx, rx) = bounded(1);
        let promise = Promise::submit_on(&pool, || Ok(42));
        promise.on_success(move |value| {
            let _ = tx.send(value);
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)), Ok(42));
    }

    #[test]
    fn late_subscriber_is_delivered_inline() {
        let pool = test_pool();
        let promise = Promise::submit_on(&pool, || Ok(7));
        wait_until_settled(&promise);

        let delivered = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&delivered);
        promise.on_success(move |value| {
            seen.store(value as usize, Ordering::SeqCst);
        });
        // Inline delivery completed before registration returned.
        assert_eq!(delivered.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn failure_reaches_failure_subscribers_verbatim() {
        let pool = test_pool();
        let (tx, rx) = bounded(1);
        let promise =
            Promise::submit_on(&pool, || -> Result<i64, TaskError> {
                Err(TaskError::failed("boom"))
            });
        promise.on_failure(move |error| {
            let _ = tx.send(error);
        });
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(1)),
            Ok(TaskError::Failed("boom".into()))
        );
    }

    #[test]
    fn panic_payload_is_unwrapped() {
        let pool = test_pool();
        let (tx, rx) = bounded(1);
        let promise = Promise::submit_on(&pool, || -> Result<i64, TaskError> { panic!("boom") });
        promise.on_failure(move |error| {
            let _ = tx.send(error);
        });
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(1)),
            Ok(TaskError::Panicked("boom".into()))
        );
    }

    #[test]
    fn success_never_reaches_failure_subscribers() {
        let pool = test_pool();
        let fired = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = bounded(1);
        let promise = Promise::submit_on(&pool, || Ok(1));
        let failure_fired = Arc::clone(&fired);
        promise
            .on_failure(move |_| {
                failure_fired.fetch_add(1, Ordering::SeqCst);
            })
            .on_success(move |value| {
                let _ = tx.send(value);
            });
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)), Ok(1));

        // A failure registration on a fulfilled promise is equally inert.
        let failure_fired = Arc::clone(&fired);
        promise.on_failure(move |_| {
            failure_fired.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn callbacks_fire_in_registration_order() {
        let pool = test_pool();
        let (gate_tx, gate_rx) = bounded::<()>(0);
        let (tx, rx) = bounded(4);
        let promise = Promise::submit_on(&pool, move || {
            let _ = gate_rx.recv();
            Ok(0)
        });
        for i in 1..=4 {
            let tx = tx.clone();
            promise.on_success(move |_| {
                let _ = tx.send(i);
            });
        }
        drop(gate_tx);
        let order: Vec<i32> = (0..4)
            .map(|_| {
                rx.recv_timeout(Duration::from_secs(1))
                    .expect("callback should fire")
            })
            .collect();
        assert_eq!(order, vec![1, 2, 3, 4]);
    }

    #[test]
    fn pending_registration_with_context_is_marshaled() {
        let pool = test_pool();
        let (jobs_tx, jobs_rx) = unbounded();
        let (gate_tx, gate_rx) = bounded::<()>(0);
        let (tx, rx) = bounded(1);
        let promise = Promise::submit_on(&pool, move || {
            let _ = gate_rx.recv();
            Ok(5)
        });
        promise.on_success_via(QueueExecutor { jobs: jobs_tx }, move |value| {
            let _ = tx.send(value);
        });
        drop(gate_tx);

        // The delivery lands on the context; the callback itself does not
        // run until the context drains its queue.
        let delivery = jobs_rx
            .recv_timeout(Duration::from_secs(1))
            .expect("delivery should be marshaled to the context");
        assert!(rx.try_recv().is_err());
        delivery();
        assert_eq!(rx.try_recv(), Ok(5));
    }

    #[test]
    fn pending_failure_registration_with_context_is_marshaled() {
        let pool = test_pool();
        let (jobs_tx, jobs_rx) = unbounded();
        let (gate_tx, gate_rx) = bounded::<()>(0);
        let (tx, rx) = bounded(1);
        let promise = Promise::submit_on(&pool, move || -> Result<i64, TaskError> {
            let _ = gate_rx.recv();
            Err(TaskError::failed("late"))
        });
        promise.on_failure_via(QueueExecutor { jobs: jobs_tx }, move |error| {
            let _ = tx.send(error);
        });
        drop(gate_tx);

        let delivery = jobs_rx
            .recv_timeout(Duration::from_secs(1))
            .expect("delivery should be marshaled to the context");
        delivery();
        assert_eq!(rx.try_recv(), Ok(TaskError::Failed("late".into())));
    }

    #[test]
    fn settled_registration_ignores_context() {
        let pool = test_pool();
        let (jobs_tx, jobs_rx) = unbounded();
        let promise = Promise::submit_on(&pool, || Ok(3));
        wait_until_settled(&promise);

        let (tx, rx) = bounded(1);
        promise.on_success_via(QueueExecutor { jobs: jobs_tx }, move |value| {
            let _ = tx.send(value);
        });
        // Inline delivery happened before the call returned; nothing was
        // handed to the context.
        assert_eq!(rx.try_recv(), Ok(3));
        assert!(jobs_rx.try_recv().is_err());
    }

    #[test]
    fn late_subscriber_panic_is_swallowed() {
        let pool = test_pool();
        let promise = Promise::submit_on(&pool, || Ok(1));
        wait_until_settled(&promise);
        promise.on_success(|_| panic!("subscriber blew up"));
        // Registration returned normally and the promise is still usable.
        assert_eq!(promise.outcome(), Some(Ok(1)));
    }

    #[test]
    fn outcome_reports_the_settled_result() {
        let pool = test_pool();
        let promise = Promise::submit_on(&pool, || Ok("done".to_string()));
        wait_until_settled(&promise);
        assert!(promise.is_settled());
        assert_eq!(promise.outcome(), Some(Ok("done".to_string())));
    }
}
