//! # pact
//!
//! Resolvable promises over a bounded worker pool.
//!
//! A [`Promise`] wraps one asynchronous computation submitted to a
//! [`WorkerPool`]. Any number of interested parties may register success or
//! failure callbacks before, during or after completion; each registered
//! callback runs exactly once. Deliveries happen on the thread that
//! resolved the promise or on a caller-chosen [`Executor`]; when the
//! outcome is already known at registration time, delivery is inline on
//! the registering thread.
//!
//! ```
//! use pact::Promise;
//!
//! let promise = Promise::submit(|| Ok(21 * 2));
//! promise.on_success(|value| println!("computed {value}"));
//! ```

pub mod error;
pub mod executor;
pub mod pool;
pub mod promise;

pub use error::TaskError;
pub use executor::{Executor, Job};
pub use pool::{PoolConfig, PoolStatus, WorkerPool};
pub use promise::Promise;
