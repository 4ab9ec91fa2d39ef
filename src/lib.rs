//! Minimal cooperative task runtime on a virtual clock.
//!
//! This crate runs futures as tasks that suspend voluntarily, either on a delay measured in
//! virtual time or on each other's results. It supports structured scopes that wait for
//! their children and fail fast, detached work in the runtime's global scope, and the
//! fan-out/await pattern for parallel decomposition.
//!
//! # Architecture
//!
//! - **Runtime**: Entry point; `run_blocking` drives a body to completion on virtual time
//! - **Scheduler**: Decision loop over per-dispatcher ready queues, the wake inbox and the clock
//! - **Dispatcher**: `Main` (the caller's single context) or `Default` (pool of worker slots)
//! - **Scope**: Structured (join-all, fail-fast) or unstructured (detached) task ownership
//! - **Task / Deferred**: Explicit task state machine and the handle to its eventual result
//! - **Clock / Delay**: Virtual time and the suspension point built on it
//! - **RuntimeBuilder**: Fluent builder, optionally seeded from `COTASK_*` variables
//!
//! # Example
//!
//! ```ignore
//! use cotask::{Dispatcher, Error, Runtime};
//! use std::time::Duration;
//!
//! let mut rt = Runtime::new();
//! let sum = rt.run_blocking(|scope| async move {
//!     let mut handles = Vec::new();
//!     for n in [10, 20, 30] {
//!         let child = scope.clone();
//!         handles.push(scope.spawn(Dispatcher::Default, async move {
//!             child.delay(Duration::from_secs(1)).await;
//!             Ok::<_, Error>(n * 10)
//!         }));
//!     }
//!
//!     let mut sum = 0;
//!     for handle in &handles {
//!         sum += handle.value().await?;
//!     }
//!     Ok::<_, Error>(sum)
//! });
//!
//! assert_eq!(sum.unwrap(), 600);
//! assert_eq!(rt.now(), Duration::from_secs(1));
//! ```

mod builder;
mod config;
mod error;
mod runtime;
mod scope;
mod task;
pub mod time;
mod timer;

pub use builder::RuntimeBuilder;
pub use config::{ConfigError, ENV_DEFAULT_WORKERS, ENV_TIME_MODE, RuntimeConfig, TimeMode};
pub use error::{BoxError, CancelReason, Error, Result};
pub use runtime::{Dispatcher, Runtime, WorkerId, YieldNow, yield_now};
pub use scope::{Scope, ScopeId, ScopeMode};
pub use task::{Deferred, TaskId, TaskState};
pub use time::Timed;
pub use timer::{Clock, Delay};
