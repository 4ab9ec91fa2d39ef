//! Runtime that drives tasks on virtual time.
//!
//! The runtime owns the scheduler and the global (unstructured) scope. Entering it with
//! [`Runtime::run_blocking`] opens a root structured scope, runs the body as its first task
//! and keeps scheduling rounds going until the body and every child of the root scope are
//! terminal. Detached work spawned on [`Runtime::global`] is not waited for; it keeps running
//! during later `run_blocking` calls or [`Runtime::run_until_idle`] and is cancelled by
//! [`Runtime::shutdown`].

use crate::builder::RuntimeBuilder;
use crate::config::RuntimeConfig;
use crate::error::{BoxError, CancelReason, Result};
use crate::runtime::Dispatcher;
use crate::runtime::scheduler::{Shared, UnhandledSink};
use crate::scope::{Scope, ScopeMode};
use crate::timer::Clock;

use std::future::Future;
use std::rc::Rc;
use std::time::Duration;

/// Cooperative task runtime with a virtual clock.
///
/// A runtime is bound to the thread that created it; its scopes and handles are `!Send`.
pub struct Runtime {
    shared: Rc<Shared>,
    global: Scope,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime {
    /// Creates a runtime with the default configuration.
    ///
    /// # Example
    /// ```ignore
    /// let mut rt = Runtime::new();
    /// ```
    pub fn new() -> Self {
        RuntimeBuilder::new().build()
    }

    /// Returns a builder for a customised runtime.
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    pub(crate) fn with_config(config: RuntimeConfig, sink: Option<UnhandledSink>) -> Self {
        let shared = Shared::new(config, sink);
        let global_id = shared.open_scope(ScopeMode::Unstructured, None);
        let global = Scope::new(global_id, ScopeMode::Unstructured, Rc::downgrade(&shared));

        tracing::debug!(
            workers = shared.config().default_workers,
            time_mode = ?shared.config().time_mode,
            "runtime created"
        );

        Self { shared, global }
    }

    /// The configuration this runtime was built with.
    pub fn config(&self) -> &RuntimeConfig {
        self.shared.config()
    }

    /// The unstructured scope for detached work.
    pub fn global(&self) -> Scope {
        self.global.clone()
    }

    /// Handle to the virtual clock, usable outside of any task.
    ///
    /// # Example
    /// ```ignore
    /// let rt = Runtime::new();
    /// assert_eq!(rt.clock().now(), Duration::ZERO);
    /// ```
    pub fn clock(&self) -> Clock {
        Clock::new(Rc::downgrade(&self.shared))
    }

    /// Current virtual time.
    pub fn now(&self) -> Duration {
        self.shared.now()
    }

    /// Number of tasks that are not terminal yet, in any scope.
    pub fn live_tasks(&self) -> usize {
        self.shared.live_tasks()
    }

    /// Runs `body` on the main context until it and all of its children are done.
    ///
    /// The body receives the root structured scope. Returns the body's value, or the first
    /// failure in the root scope, or [`Error::Stalled`] if tasks remain that nothing can
    /// ever wake.
    ///
    /// # Example
    /// ```ignore
    /// let mut rt = Runtime::new();
    /// let sum = rt.run_blocking(|scope| async move {
    ///     let a = scope.spawn(Dispatcher::Default, async { Ok::<_, Error>(1) });
    ///     let b = scope.spawn(Dispatcher::Default, async { Ok::<_, Error>(2) });
    ///     Ok::<_, Error>(a.value().await? + b.value().await?)
    /// });
    /// assert_eq!(sum.unwrap(), 3);
    /// ```
    ///
    /// [`Error::Stalled`]: crate::Error::Stalled
    pub fn run_blocking<F, Fut, T, E>(&mut self, body: F) -> Result<T>
    where
        F: FnOnce(Scope) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>> + 'static,
        T: 'static,
        E: Into<BoxError> + 'static,
    {
        self.run_blocking_on(Dispatcher::Main, body)
    }

    /// Like [`run_blocking`](Self::run_blocking), with the body's task placed on `dispatcher`.
    pub fn run_blocking_on<F, Fut, T, E>(&mut self, dispatcher: Dispatcher, body: F) -> Result<T>
    where
        F: FnOnce(Scope) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>> + 'static,
        T: 'static,
        E: Into<BoxError> + 'static,
    {
        let span = tracing::debug_span!("run_blocking", %dispatcher);
        let _enter = span.enter();

        let scope_id = self.shared.open_scope(ScopeMode::Structured, None);
        let scope = Scope::new(scope_id, ScopeMode::Structured, Rc::downgrade(&self.shared));
        let root = self.shared.spawn(scope_id, dispatcher, body(scope));

        let driven = self.shared.drive(root.header(), scope_id);
        if driven.is_err() {
            self.shared.cancel_scope(scope_id, CancelReason::ParentCancelled);
            self.shared.drain_scope(scope_id);
        }

        let outcome = self.shared.close_scope(scope_id);
        driven?;

        if let Some(failure) = outcome.failure {
            return Err(failure);
        }
        if let Some(cancelled) = outcome.cancelled {
            return Err(cancelled);
        }

        tracing::debug!(task = %root.id(), now = ?self.now(), "run finished");
        root.take_now()
    }

    /// Runs scheduling rounds until nothing is runnable and no delay is pending.
    ///
    /// Returns the number of tasks still alive, i.e. parked with no way to be woken.
    pub fn run_until_idle(&mut self) -> usize {
        self.shared.run_until_idle()
    }

    /// Cancels every detached task and runs until the cancellations have landed.
    ///
    /// Returns how many tasks were cancelled. Spawning on [`global`](Self::global)
    /// afterwards yields tasks that are already cancelled. Calling it again is harmless.
    pub fn shutdown(&mut self) -> usize {
        let cancelled = self.shared.shutdown();
        if cancelled > 0 {
            tracing::info!(cancelled, "runtime shut down");
        }
        cancelled
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}
