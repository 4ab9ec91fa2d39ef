//! Tasks: identity, state machine, result slot and the [`Deferred`] handle.
//!
//! A task is a future owned by the scheduler together with a small shared header. The header
//! carries the task's state and its error slot; the typed value slot is shared with the
//! [`Deferred`] handle returned at spawn time.
//!
//! # Lifecycle
//!
//! ```text
//! Created ──► Running ──► Completed
//!    │         │  ▲  └──► Failed
//!    │         ▼  │
//!    │       Suspended
//!    │         │
//!    └─────────┴──► Cancelled
//! ```
//!
//! 1. [`Scope::spawn`] creates the task in `Created` and enqueues it on its dispatcher
//! 2. The scheduler polls it for the first time (`Running`)
//! 3. A pending poll parks it (`Suspended`) until a delay fires or a waker is called
//! 4. The body's output is written into the result slot, then the task turns terminal
//!
//! Cancellation is only ever observed between polls: right before a resume or right after
//! a poll that left the task pending.
//!
//! # Deferred handles
//!
//! ```ignore
//! use cotask::{Dispatcher, Error, Runtime};
//!
//! let mut rt = Runtime::new();
//! let value = rt.run_blocking(|scope| async move {
//!     let handle = scope.spawn(Dispatcher::Default, async { Ok::<_, Error>(42) });
//!     handle.value().await
//! });
//! assert_eq!(value.unwrap(), 42);
//! ```
//!
//! [`Scope::spawn`]: crate::Scope::spawn

use crate::error::{BoxError, CancelReason, Error, Result};
use crate::runtime::Dispatcher;
use crate::runtime::scheduler::Shared;
use crate::scope::ScopeId;

use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll, Waker};

/// Opaque task identity.
///
/// Identifiers are handed out in spawn order, which is also the tie-breaker between tasks
/// whose delays expire at the same virtual instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub(crate) u64);

impl TaskId {
    /// Identity given to work requested after the runtime went away.
    pub(crate) const NONE: TaskId = TaskId(0);

    /// Returns the raw numeric identifier.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    /// Spawned, never polled.
    Created,
    /// Currently being polled.
    Running,
    /// Parked at a suspension point.
    Suspended,
    /// Returned a value.
    Completed,
    /// Observed a cancellation request.
    Cancelled,
    /// Returned an error or panicked.
    Failed,
}

impl TaskState {
    /// Terminal states never change again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Cancelled | TaskState::Failed
        )
    }

    fn can_become(self, next: TaskState) -> bool {
        use TaskState::*;

        matches!(
            (self, next),
            (Created, Running)
                | (Running, Suspended)
                | (Suspended, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Created | Running | Suspended, Cancelled)
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskState::Created => "created",
            TaskState::Running => "running",
            TaskState::Suspended => "suspended",
            TaskState::Completed => "completed",
            TaskState::Cancelled => "cancelled",
            TaskState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Type-erased task body as stored by the scheduler.
pub(crate) type TaskFuture = Pin<Box<dyn Future<Output = ()>>>;

/// Untyped, shared part of a task.
///
/// Owned jointly by the scheduler's task table, the owning scope and the task's handle.
/// The continuation itself is never stored here, so holding a header does not keep the
/// body alive.
pub(crate) struct TaskHeader {
    pub(crate) id: TaskId,
    pub(crate) scope: ScopeId,
    pub(crate) dispatcher: Dispatcher,
    /// Spawned into the unstructured scope.
    pub(crate) detached: bool,
    /// Sitting in a ready queue.
    pub(crate) queued: Cell<bool>,
    state: Cell<TaskState>,
    cancel: Cell<Option<CancelReason>>,
    error: RefCell<Option<Error>>,
    waiters: RefCell<Vec<Waker>>,
    handle_alive: Cell<bool>,
    observed: Cell<bool>,
}

impl TaskHeader {
    pub(crate) fn new(id: TaskId, scope: ScopeId, dispatcher: Dispatcher, detached: bool) -> Rc<Self> {
        Rc::new(Self {
            id,
            scope,
            dispatcher,
            detached,
            queued: Cell::new(false),
            state: Cell::new(TaskState::Created),
            cancel: Cell::new(None),
            error: RefCell::new(None),
            waiters: RefCell::new(Vec::new()),
            handle_alive: Cell::new(true),
            observed: Cell::new(false),
        })
    }

    pub(crate) fn state(&self) -> TaskState {
        self.state.get()
    }

    fn transition(&self, next: TaskState, operation: &'static str) -> Result<()> {
        let current = self.state.get();
        if !current.can_become(next) {
            return Err(Error::InvalidState {
                task: self.id,
                state: current,
                operation,
            });
        }

        tracing::trace!(task = %self.id, from = %current, to = %next, "task transition");
        self.state.set(next);
        Ok(())
    }

    /// First poll.
    pub(crate) fn start(&self) -> Result<()> {
        self.transition(TaskState::Running, "start")
    }

    /// Resumes a parked task; anything but `Suspended` is a scheduler bug.
    pub(crate) fn resume(&self) -> Result<()> {
        if self.state.get() != TaskState::Suspended {
            return Err(Error::InvalidState {
                task: self.id,
                state: self.state.get(),
                operation: "resume",
            });
        }
        self.transition(TaskState::Running, "resume")
    }

    pub(crate) fn suspend(&self) -> Result<()> {
        self.transition(TaskState::Suspended, "suspend")
    }

    pub(crate) fn complete(&self) -> Result<()> {
        self.transition(TaskState::Completed, "complete")
    }

    pub(crate) fn fail(&self) -> Result<()> {
        self.transition(TaskState::Failed, "fail")
    }

    pub(crate) fn cancel_with(&self, reason: CancelReason) -> Result<()> {
        self.transition(TaskState::Cancelled, "cancel")?;
        self.record_error(Error::Cancelled {
            task: self.id,
            reason,
        });
        Ok(())
    }

    /// Marks the task for cancellation. Returns `false` if it already was, or is terminal.
    pub(crate) fn request_cancel(&self, reason: CancelReason) -> bool {
        if self.state.get().is_terminal() || self.cancel.get().is_some() {
            return false;
        }
        self.cancel.set(Some(reason));
        true
    }

    pub(crate) fn cancel_requested(&self) -> Option<CancelReason> {
        self.cancel.get()
    }

    /// Writes the error slot. The first write wins.
    pub(crate) fn record_error(&self, error: Error) {
        let mut slot = self.error.borrow_mut();
        if slot.is_none() {
            *slot = Some(error);
        }
    }

    pub(crate) fn has_error(&self) -> bool {
        self.error.borrow().is_some()
    }

    pub(crate) fn error(&self) -> Option<Error> {
        self.error.borrow().clone()
    }

    pub(crate) fn add_waiter(&self, waker: &Waker) {
        let mut waiters = self.waiters.borrow_mut();
        if !waiters.iter().any(|w| w.will_wake(waker)) {
            waiters.push(waker.clone());
        }
    }

    pub(crate) fn wake_waiters(&self) {
        let waiters = std::mem::take(&mut *self.waiters.borrow_mut());
        for waker in waiters {
            waker.wake();
        }
    }

    pub(crate) fn handle_alive(&self) -> bool {
        self.handle_alive.get()
    }

    fn outcome_error(&self, operation: &'static str) -> Error {
        self.error().unwrap_or(Error::InvalidState {
            task: self.id,
            state: self.state.get(),
            operation,
        })
    }
}

enum Slot<T> {
    Empty,
    Value(T),
    Taken,
}

/// Typed result slot, written once by the task body.
pub(crate) struct ValueSlot<T> {
    slot: RefCell<Slot<T>>,
}

impl<T> ValueSlot<T> {
    pub(crate) fn new() -> Rc<Self> {
        Rc::new(Self {
            slot: RefCell::new(Slot::Empty),
        })
    }

    fn fill(&self, value: T) {
        let mut slot = self.slot.borrow_mut();
        if matches!(*slot, Slot::Empty) {
            *slot = Slot::Value(value);
        }
    }

    fn take(&self) -> Option<T> {
        match std::mem::replace(&mut *self.slot.borrow_mut(), Slot::Taken) {
            Slot::Value(value) => Some(value),
            Slot::Empty | Slot::Taken => None,
        }
    }
}

impl<T: Clone> ValueSlot<T> {
    fn cloned(&self) -> Option<T> {
        match &*self.slot.borrow() {
            Slot::Value(value) => Some(value.clone()),
            Slot::Empty | Slot::Taken => None,
        }
    }
}

/// Wraps a user body so that its output lands in the task's slots.
///
/// The wrapper is the only writer of the value slot, and it writes before the scheduler
/// moves the task to a terminal state.
pub(crate) fn task_body<F, T, E>(header: Rc<TaskHeader>, slot: Rc<ValueSlot<T>>, future: F) -> TaskFuture
where
    F: Future<Output = std::result::Result<T, E>> + 'static,
    T: 'static,
    E: Into<BoxError> + 'static,
{
    Box::pin(async move {
        match future.await {
            Ok(value) => slot.fill(value),
            Err(error) => header.record_error(Error::from_body(header.id, error.into())),
        }
    })
}

/// Handle to a spawned task's eventual result.
///
/// The handle keeps the task's header and result alive, never its body: once the task is
/// terminal the scheduler drops the continuation whether or not a handle still exists.
///
/// Awaiting goes through [`value`](Self::value) (idempotent, needs `T: Clone`),
/// [`take`](Self::take) (moves the value out, once) or [`join`](Self::join) (discards it).
///
/// Dropping the handle of a detached task that failed without anyone looking at the error
/// sends the error to the runtime's unhandled-error sink.
pub struct Deferred<T> {
    header: Rc<TaskHeader>,
    slot: Rc<ValueSlot<T>>,
    runtime: Weak<Shared>,
}

impl<T> Deferred<T> {
    pub(crate) fn new(header: Rc<TaskHeader>, slot: Rc<ValueSlot<T>>, runtime: Weak<Shared>) -> Self {
        Self {
            header,
            slot,
            runtime,
        }
    }

    /// Handle for work that could not be spawned because the runtime is gone.
    pub(crate) fn orphaned(dispatcher: Dispatcher) -> Self {
        let header = TaskHeader::new(TaskId::NONE, ScopeId::NONE, dispatcher, false);
        if let Err(error) = header.cancel_with(CancelReason::Shutdown) {
            tracing::error!(%error, "could not cancel orphaned task");
        }
        header.handle_alive.set(false);

        Self::new(header, ValueSlot::new(), Weak::new())
    }

    pub(crate) fn header(&self) -> &Rc<TaskHeader> {
        &self.header
    }

    /// The task's identity.
    pub fn id(&self) -> TaskId {
        self.header.id
    }

    /// The task's current state.
    pub fn state(&self) -> TaskState {
        self.header.state()
    }

    /// Returns `true` once the task reached a terminal state.
    pub fn is_finished(&self) -> bool {
        self.header.state().is_terminal()
    }

    /// The dispatcher the task was spawned on.
    pub fn dispatcher(&self) -> Dispatcher {
        self.header.dispatcher
    }

    /// Requests cooperative cancellation of the task.
    ///
    /// The request takes effect the next time the task is about to be resumed, or right
    /// after its current poll if it is running. Returns `false` if the task already finished
    /// or was already asked to stop.
    pub fn cancel(&self) -> bool {
        match self.runtime.upgrade() {
            Some(shared) => shared.cancel_task(&self.header, CancelReason::Requested),
            None => false,
        }
    }

    /// Suspends until the task is terminal, discarding its value.
    pub async fn join(&self) -> Result<()> {
        self.finished().await;
        self.header.observed.set(true);

        match self.header.state() {
            TaskState::Completed => Ok(()),
            _ => Err(self.header.outcome_error("join")),
        }
    }

    /// Suspends until the task is terminal and moves its value out.
    ///
    /// Only one `take` can succeed; later calls to `take` or [`value`](Self::value) fail with
    /// [`Error::InvalidState`].
    pub async fn take(&self) -> Result<T> {
        self.finished().await;
        self.take_now()
    }

    /// Non-suspending [`take`](Self::take) for a task known to be terminal.
    pub(crate) fn take_now(&self) -> Result<T> {
        self.header.observed.set(true);

        match self.header.state() {
            TaskState::Completed => self.slot.take().ok_or(Error::InvalidState {
                task: self.header.id,
                state: TaskState::Completed,
                operation: "take the value of",
            }),
            TaskState::Created | TaskState::Running | TaskState::Suspended => {
                Err(Error::InvalidState {
                    task: self.header.id,
                    state: self.header.state(),
                    operation: "take the value of",
                })
            }
            TaskState::Cancelled | TaskState::Failed => Err(self.header.outcome_error("take")),
        }
    }

    fn finished(&self) -> Finished<'_> {
        Finished {
            header: &self.header,
        }
    }
}

impl<T: Clone> Deferred<T> {
    /// Suspends until the task is terminal and returns a clone of its value.
    ///
    /// Awaiting the same handle again returns the same value, or the same error.
    pub async fn value(&self) -> Result<T> {
        self.finished().await;
        self.header.observed.set(true);

        match self.header.state() {
            TaskState::Completed => self.slot.cloned().ok_or(Error::InvalidState {
                task: self.header.id,
                state: TaskState::Completed,
                operation: "await the taken value of",
            }),
            _ => Err(self.header.outcome_error("await")),
        }
    }
}

impl<T> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred")
            .field("id", &self.header.id)
            .field("state", &self.header.state())
            .field("dispatcher", &self.header.dispatcher)
            .finish()
    }
}

impl<T> Drop for Deferred<T> {
    fn drop(&mut self) {
        self.header.handle_alive.set(false);

        let unobserved_failure = self.header.detached
            && self.header.state() == TaskState::Failed
            && !self.header.observed.get();
        if !unobserved_failure {
            return;
        }

        if let Some(error) = self.header.error() {
            match self.runtime.upgrade() {
                Some(shared) => shared.report_unhandled(&error),
                None => tracing::error!(task = %self.header.id, %error, "unhandled failure in detached task"),
            }
        }
    }
}

/// Resolves once the header reaches a terminal state.
struct Finished<'a> {
    header: &'a TaskHeader,
}

impl Future for Finished<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.header.state().is_terminal() {
            return Poll::Ready(());
        }

        self.header.add_waiter(cx.waker());
        Poll::Pending
    }
}
