//! Scopes: where tasks are spawned and who waits for them.
//!
//! A [`Scope`] is the capability to create tasks. Every task belongs to exactly one scope.
//!
//! - A **structured** scope is opened by [`Runtime::run_blocking`] and by
//!   [`Scope::structured`]. It does not complete until every child is terminal, and the first
//!   child failure cancels every sibling (fail-fast).
//! - The **unstructured** scope is the runtime's [`global`](crate::Runtime::global) scope.
//!   Its tasks are detached: no caller waits for them and their failures are reported to the
//!   runtime's unhandled-error sink unless someone awaited them.
//!
//! Scopes hold only a weak reference to the runtime. Spawning on a scope whose runtime is
//! gone yields a handle that is already cancelled.
//!
//! [`Runtime::run_blocking`]: crate::Runtime::run_blocking

use crate::error::{BoxError, CancelReason, Error, Result};
use crate::runtime::Dispatcher;
use crate::runtime::WorkerId;
use crate::runtime::scheduler::{ScopeOutcome, Shared};
use crate::task::{Deferred, TaskId};
use crate::timer::{Clock, Delay};

use std::fmt;
use std::future::{Future, poll_fn};
use std::rc::Weak;
use std::task::{Poll, Waker};
use std::time::Duration;

/// Opaque scope identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(pub(crate) u64);

impl ScopeId {
    pub(crate) const NONE: ScopeId = ScopeId(0);
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scope#{}", self.0)
    }
}

/// Whether a scope waits for its children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScopeMode {
    /// Waits for every child; first failure cancels the siblings.
    Structured,
    /// Detached tasks; nobody waits.
    Unstructured,
}

/// Capability to spawn tasks into a scope.
///
/// Cheap to clone; clones refer to the same scope.
#[derive(Clone)]
pub struct Scope {
    id: ScopeId,
    mode: ScopeMode,
    shared: Weak<Shared>,
}

impl Scope {
    pub(crate) fn new(id: ScopeId, mode: ScopeMode, shared: Weak<Shared>) -> Self {
        Self { id, mode, shared }
    }

    /// The scope's identity.
    pub fn id(&self) -> ScopeId {
        self.id
    }

    /// Whether this scope waits for its children.
    pub fn mode(&self) -> ScopeMode {
        self.mode
    }

    /// Creates a task running `future` on `dispatcher` and returns its handle.
    ///
    /// Never suspends: the task is only enqueued and starts on a later scheduling round.
    /// Spawning into a cancelled scope returns a handle that is already cancelled.
    pub fn spawn<F, T, E>(&self, dispatcher: Dispatcher, future: F) -> Deferred<T>
    where
        F: Future<Output = std::result::Result<T, E>> + 'static,
        T: 'static,
        E: Into<BoxError> + 'static,
    {
        match self.shared.upgrade() {
            Some(shared) => shared.spawn(self.id, dispatcher, future),
            None => Deferred::orphaned(dispatcher),
        }
    }

    /// Runs `future` as a child on `dispatcher` and suspends the caller until it finishes.
    ///
    /// Equivalent to spawning and immediately taking the result.
    pub async fn with_dispatcher<F, T, E>(&self, dispatcher: Dispatcher, future: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, E>> + 'static,
        T: 'static,
        E: Into<BoxError> + 'static,
    {
        self.spawn(dispatcher, future).take().await
    }

    /// Opens a nested structured scope, runs `driver` in it and waits for every child.
    ///
    /// Returns the driver's value once all children are terminal. If a child (or the driver
    /// itself) fails, the remaining children are cancelled, the driver is dropped and the
    /// first failure is returned. If the nested scope was cancelled, the cancellation is
    /// returned instead of the value.
    ///
    /// Dropping the returned future before it completes cancels the nested scope.
    pub async fn structured<F, Fut, T, E>(&self, driver: F) -> Result<T>
    where
        F: FnOnce(Scope) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Into<BoxError>,
    {
        let Some(shared) = self.shared.upgrade() else {
            return Err(Error::Cancelled {
                task: TaskId::NONE,
                reason: CancelReason::Shutdown,
            });
        };
        let caller = shared.current().map_or(TaskId::NONE, |(task, _)| task);
        let id = shared.open_scope(ScopeMode::Structured, Some(self.id));
        drop(shared);

        let inner = Scope::new(id, ScopeMode::Structured, self.shared.clone());
        let mut guard = CloseGuard {
            scope: inner.clone(),
            armed: true,
        };

        let mut body = Some(Box::pin(driver(inner.clone())));
        let mut value = None;

        poll_fn(|cx| {
            if inner.has_failed() {
                body = None;
                return Poll::Ready(());
            }
            let Some(future) = body.as_mut() else {
                return Poll::Ready(());
            };

            match future.as_mut().poll(cx) {
                Poll::Ready(Ok(output)) => {
                    value = Some(output);
                    body = None;
                    Poll::Ready(())
                }
                Poll::Ready(Err(error)) => {
                    body = None;
                    inner.fail(Error::from_body(caller, error.into()));
                    Poll::Ready(())
                }
                Poll::Pending => {
                    inner.watch(cx.waker());
                    Poll::Pending
                }
            }
        })
        .await;

        poll_fn(|cx| {
            if inner.live_tasks() == 0 {
                return Poll::Ready(());
            }
            inner.watch(cx.waker());
            Poll::Pending
        })
        .await;

        guard.armed = false;
        let outcome = inner.close();
        if let Some(failure) = outcome.failure {
            return Err(failure);
        }
        if let Some(cancelled) = outcome.cancelled {
            return Err(cancelled);
        }

        value.ok_or(Error::Cancelled {
            task: caller,
            reason: CancelReason::ParentCancelled,
        })
    }

    /// Suspends the calling task for `duration` of virtual time.
    pub fn delay(&self, duration: Duration) -> Delay {
        Delay::new(self.shared.clone(), duration)
    }

    /// The runtime's virtual clock.
    pub fn clock(&self) -> Clock {
        Clock::new(self.shared.clone())
    }

    /// Current virtual time.
    pub fn now(&self) -> Duration {
        self.clock().now()
    }

    /// Cancels every live child of this scope and of the scopes nested in it.
    ///
    /// Returns how many tasks were newly asked to stop. Tasks spawned afterwards start out
    /// cancelled.
    pub fn cancel(&self) -> usize {
        match self.shared.upgrade() {
            Some(shared) => shared.cancel_scope(self.id, CancelReason::Requested),
            None => 0,
        }
    }

    /// Whether the scope was cancelled, directly or through a parent.
    ///
    /// A scope whose runtime is gone counts as cancelled.
    pub fn is_cancelled(&self) -> bool {
        match self.shared.upgrade() {
            Some(shared) => shared.scope_is_cancelled(self.id),
            None => true,
        }
    }

    /// Number of tasks in this scope and its nested scopes that are not terminal yet.
    pub fn live_tasks(&self) -> usize {
        self.shared
            .upgrade()
            .map_or(0, |shared| shared.scope_live(self.id))
    }

    /// The task being polled right now, if any.
    pub fn current_task(&self) -> Option<TaskId> {
        self.shared
            .upgrade()
            .and_then(|shared| shared.current())
            .map(|(task, _)| task)
    }

    /// The logical worker polling the current task, if any.
    pub fn current_worker(&self) -> Option<WorkerId> {
        self.shared
            .upgrade()
            .and_then(|shared| shared.current())
            .map(|(_, worker)| worker)
    }

    fn has_failed(&self) -> bool {
        self.shared
            .upgrade()
            .is_some_and(|shared| shared.scope_failed(self.id))
    }

    fn fail(&self, error: Error) {
        if let Some(shared) = self.shared.upgrade() {
            shared.fail_scope(self.id, error);
        }
    }

    fn watch(&self, waker: &Waker) {
        if let Some(shared) = self.shared.upgrade() {
            shared.watch_scope(self.id, waker);
        }
    }

    fn close(&self) -> ScopeOutcome {
        self.shared
            .upgrade()
            .map(|shared| shared.close_scope(self.id))
            .unwrap_or_default()
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("live_tasks", &self.live_tasks())
            .finish()
    }
}

/// Cancels and closes a nested scope whose driving future was dropped early.
struct CloseGuard {
    scope: Scope,
    armed: bool,
}

impl Drop for CloseGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        if let Some(shared) = self.scope.shared.upgrade() {
            shared.cancel_scope(self.scope.id, CancelReason::ParentCancelled);
            shared.close_scope(self.scope.id);
        }
    }
}
