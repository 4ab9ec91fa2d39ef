//! The decision loop.
//!
//! [`Shared`] owns everything the scheduler mutates: the task table, the scope table, the
//! per-dispatcher ready queues and the timer queue. It is reference-counted so that scopes,
//! clocks and handles can reach it through weak references; none of them ever keeps the
//! runtime alive.
//!
//! # Rounds
//!
//! Every [`step`](Shared::step):
//!
//! 1. moves tasks woken since the last step from the wake inbox to their ready queues
//! 2. polls one task on the main context and up to `default_workers` on the default pool
//! 3. if nothing was runnable, advances virtual time to the earliest deadline
//!
//! A task future is always taken out of the table before it is polled or dropped, so user
//! code (bodies, destructors, wakers) never runs while the scheduler state is borrowed.

use crate::config::{RuntimeConfig, TimeMode};
use crate::error::{BoxError, CancelReason, Error, Result};
use crate::runtime::queue::{Dispatcher, ReadyQueues, WorkerId};
use crate::runtime::waker::{WakeInbox, make_waker};
use crate::scope::{ScopeId, ScopeMode};
use crate::task::{Deferred, TaskFuture, TaskHeader, TaskId, TaskState, ValueSlot, task_body};
use crate::timer::TimerQueue;

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

/// Callback receiving failures of detached tasks nobody observed.
pub(crate) type UnhandledSink = Rc<dyn Fn(&Error)>;

struct TaskEntry {
    header: Rc<TaskHeader>,
    future: Option<TaskFuture>,
    waker: Waker,
}

struct ScopeEntry {
    mode: ScopeMode,
    parent: Option<ScopeId>,
    /// Children that are not terminal yet, in spawn order.
    children: BTreeMap<TaskId, Rc<TaskHeader>>,
    /// Scopes opened inside this one that have not been released.
    nested: Vec<ScopeId>,
    cancelled: Option<CancelReason>,
    /// Children whose cancellation was requested through this scope.
    signalled: HashSet<TaskId>,
    /// First child actually stopped by this scope's cancellation.
    interrupted: Option<Error>,
    failure: Option<Error>,
    closed: bool,
    waiters: Vec<Waker>,
}

impl ScopeEntry {
    fn new(mode: ScopeMode, parent: Option<ScopeId>, cancelled: Option<CancelReason>) -> Self {
        Self {
            mode,
            parent,
            children: BTreeMap::new(),
            nested: Vec::new(),
            cancelled,
            signalled: HashSet::new(),
            interrupted: None,
            failure: None,
            closed: false,
            waiters: Vec::new(),
        }
    }

    fn is_done(&self) -> bool {
        self.closed && self.children.is_empty() && self.nested.is_empty()
    }
}

/// What a structured scope ended with, read when it is closed.
#[derive(Debug, Default)]
pub(crate) struct ScopeOutcome {
    /// First failure among children (or the driving body).
    pub(crate) failure: Option<Error>,
    /// Set when the scope's own cancellation actually stopped a child.
    pub(crate) cancelled: Option<Error>,
}

enum End {
    Completed,
    Failed,
    Cancelled(CancelReason),
}

pub(crate) enum Step {
    Ran,
    Advanced,
    Idle,
}

struct SchedulerState {
    tasks: HashMap<TaskId, TaskEntry>,
    scopes: BTreeMap<ScopeId, ScopeEntry>,
    queues: ReadyQueues,
    timers: TimerQueue,
    current: Option<(TaskId, WorkerId)>,
    next_task: u64,
    next_scope: u64,
}

impl SchedulerState {
    fn new() -> Self {
        Self {
            tasks: HashMap::new(),
            scopes: BTreeMap::new(),
            queues: ReadyQueues::new(),
            timers: TimerQueue::new(),
            current: None,
            next_task: 0,
            next_scope: 0,
        }
    }

    fn enqueue(&mut self, header: &TaskHeader) {
        if header.queued.get() {
            return;
        }
        header.queued.set(true);
        self.queues.push(header.dispatcher, header.id);
    }

    /// Enqueues a parked task if it is still parked.
    fn wake(&mut self, task: TaskId) {
        let Some(header) = self.tasks.get(&task).map(|entry| entry.header.clone()) else {
            return;
        };
        if header.state() == TaskState::Suspended {
            self.enqueue(&header);
        }
    }

    fn cancel_task(&mut self, header: &TaskHeader, reason: CancelReason) -> bool {
        if !header.request_cancel(reason) {
            return false;
        }

        tracing::debug!(task = %header.id, %reason, "cancellation requested");

        // Parked tasks observe the request when they are next resumed, which is now.
        if header.state() == TaskState::Suspended {
            self.timers.remove(header.id);
            self.enqueue(header);
        }
        true
    }

    /// Cancels every live child of `scope` and of its nested scopes.
    fn cancel_scope(&mut self, scope: ScopeId, reason: CancelReason) -> usize {
        let mut signalled = 0;
        let mut pending = vec![(scope, reason)];

        while let Some((id, reason)) = pending.pop() {
            let Some(entry) = self.scopes.get_mut(&id) else {
                continue;
            };
            entry.cancelled.get_or_insert(reason);
            let children: Vec<_> = entry.children.values().cloned().collect();
            pending.extend(
                entry
                    .nested
                    .iter()
                    .map(|nested| (*nested, CancelReason::ParentCancelled)),
            );

            let mut stopped = Vec::new();
            for child in &children {
                if self.cancel_task(child, reason) {
                    stopped.push(child.id);
                }
            }

            signalled += stopped.len();
            if let Some(entry) = self.scopes.get_mut(&id) {
                entry.signalled.extend(stopped);
            }
        }

        signalled
    }

    /// Live tasks in `scope` and in every scope nested in it.
    fn live_within(&self, scope: ScopeId) -> usize {
        let mut live = 0;
        let mut pending = vec![scope];

        while let Some(id) = pending.pop() {
            if let Some(entry) = self.scopes.get(&id) {
                live += entry.children.len();
                pending.extend(entry.nested.iter().copied());
            }
        }
        live
    }

    /// Releases `scope` once it is closed and empty, then retries its parent.
    fn release_scope_if_done(&mut self, scope: ScopeId) {
        let mut next = Some(scope);

        while let Some(id) = next.take() {
            if !self.scopes.get(&id).is_some_and(ScopeEntry::is_done) {
                break;
            }
            let Some(entry) = self.scopes.remove(&id) else {
                break;
            };
            tracing::trace!(scope = %id, "scope released");

            if let Some(parent) = entry.parent
                && let Some(outer) = self.scopes.get_mut(&parent)
            {
                outer.nested.retain(|nested| *nested != id);
                next = Some(parent);
            }
        }
    }
}

/// Scheduler state shared by the runtime and every scope, clock and handle.
pub(crate) struct Shared {
    state: RefCell<SchedulerState>,
    inbox: Arc<WakeInbox>,
    config: RuntimeConfig,
    sink: Option<UnhandledSink>,
}

impl Shared {
    pub(crate) fn new(config: RuntimeConfig, sink: Option<UnhandledSink>) -> Rc<Self> {
        Rc::new(Self {
            state: RefCell::new(SchedulerState::new()),
            inbox: WakeInbox::new(),
            config,
            sink,
        })
    }

    pub(crate) fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub(crate) fn now(&self) -> Duration {
        self.state.borrow().timers.now()
    }

    /// The task being polled right now, and where.
    pub(crate) fn current(&self) -> Option<(TaskId, WorkerId)> {
        self.state.borrow().current
    }

    pub(crate) fn live_tasks(&self) -> usize {
        self.state.borrow().tasks.len()
    }

    pub(crate) fn open_scope(&self, mode: ScopeMode, parent: Option<ScopeId>) -> ScopeId {
        let mut state = self.state.borrow_mut();
        state.next_scope += 1;
        let id = ScopeId(state.next_scope);

        // A scope opened under a cancelled parent starts out cancelled.
        let cancelled = parent
            .and_then(|parent| state.scopes.get(&parent))
            .and_then(|parent| parent.cancelled)
            .map(|_| CancelReason::ParentCancelled);

        let parent = parent.filter(|parent| state.scopes.contains_key(parent));
        if let Some(outer) = parent.and_then(|parent| state.scopes.get_mut(&parent)) {
            outer.nested.push(id);
        }
        state.scopes.insert(id, ScopeEntry::new(mode, parent, cancelled));

        tracing::trace!(scope = %id, ?mode, ?parent, "scope opened");
        id
    }

    /// Creates a task in `scope` and enqueues it on `dispatcher`. Never suspends.
    pub(crate) fn spawn<F, T, E>(
        self: &Rc<Self>,
        scope: ScopeId,
        dispatcher: Dispatcher,
        future: F,
    ) -> Deferred<T>
    where
        F: Future<Output = std::result::Result<T, E>> + 'static,
        T: 'static,
        E: Into<BoxError> + 'static,
    {
        let mut state = self.state.borrow_mut();
        state.next_task += 1;
        let id = TaskId(state.next_task);

        let (detached, cancelled) = match state.scopes.get(&scope) {
            Some(entry) => (entry.mode == ScopeMode::Unstructured, entry.cancelled),
            None => (false, Some(CancelReason::ParentCancelled)),
        };

        let header = TaskHeader::new(id, scope, dispatcher, detached);
        let slot = ValueSlot::new();
        let handle = Deferred::new(header.clone(), slot.clone(), Rc::downgrade(self));

        if let Some(reason) = cancelled {
            if let Err(error) = header.cancel_with(reason) {
                tracing::error!(task = %id, %error, "could not cancel new task");
            }
            if let Some(entry) = state.scopes.get_mut(&scope)
                && entry.interrupted.is_none()
            {
                entry.interrupted = header.error();
            }
            drop(state);

            tracing::debug!(task = %id, %scope, %reason, "spawned into a cancelled scope");
            drop(future);
            return handle;
        }

        let future = task_body(header.clone(), slot, future);
        let waker = make_waker(id, self.inbox.clone());

        if let Some(entry) = state.scopes.get_mut(&scope) {
            entry.children.insert(id, header.clone());
        }
        state.tasks.insert(
            id,
            TaskEntry {
                header: header.clone(),
                future: Some(future),
                waker,
            },
        );
        state.enqueue(&header);

        tracing::trace!(task = %id, %scope, %dispatcher, detached, "task spawned");
        handle
    }

    /// Registers the current task to be woken at `due`. Returns `false` outside of a task.
    pub(crate) fn register_delay(&self, due: Duration) -> bool {
        let mut state = self.state.borrow_mut();
        let Some((task, _)) = state.current else {
            return false;
        };

        state.timers.insert(task, due);
        true
    }

    pub(crate) fn cancel_task(&self, header: &TaskHeader, reason: CancelReason) -> bool {
        self.state.borrow_mut().cancel_task(header, reason)
    }

    pub(crate) fn cancel_scope(&self, scope: ScopeId, reason: CancelReason) -> usize {
        let signalled = self.state.borrow_mut().cancel_scope(scope, reason);
        tracing::debug!(%scope, %reason, signalled, "scope cancelled");
        signalled
    }

    pub(crate) fn scope_is_cancelled(&self, scope: ScopeId) -> bool {
        self.state
            .borrow()
            .scopes
            .get(&scope)
            .is_none_or(|entry| entry.cancelled.is_some())
    }

    /// Live tasks in `scope`, including those of its nested scopes.
    pub(crate) fn scope_live(&self, scope: ScopeId) -> usize {
        self.state.borrow().live_within(scope)
    }

    pub(crate) fn scope_failed(&self, scope: ScopeId) -> bool {
        self.state
            .borrow()
            .scopes
            .get(&scope)
            .is_some_and(|entry| entry.failure.is_some())
    }

    /// Wakes `waker` the next time a task in `scope` or in a nested scope finishes.
    pub(crate) fn watch_scope(&self, scope: ScopeId, waker: &Waker) {
        let mut state = self.state.borrow_mut();
        if let Some(entry) = state.scopes.get_mut(&scope)
            && !entry.waiters.iter().any(|w| w.will_wake(waker))
        {
            entry.waiters.push(waker.clone());
        }
    }

    /// Records `error` as the scope's failure (unless it already failed) and cancels it.
    pub(crate) fn fail_scope(&self, scope: ScopeId, error: Error) {
        let mut state = self.state.borrow_mut();
        if let Some(entry) = state.scopes.get_mut(&scope) {
            entry.failure.get_or_insert(error);
        }
        state.cancel_scope(scope, CancelReason::FailFast);
    }

    /// Marks a structured scope as closed and reads its outcome.
    ///
    /// The entry is released as soon as no task in it or in a nested scope is live.
    pub(crate) fn close_scope(&self, scope: ScopeId) -> ScopeOutcome {
        let mut state = self.state.borrow_mut();
        let Some(entry) = state.scopes.get_mut(&scope) else {
            return ScopeOutcome::default();
        };

        entry.closed = true;
        let outcome = ScopeOutcome {
            failure: entry.failure.clone(),
            cancelled: entry.interrupted.clone(),
        };

        state.release_scope_if_done(scope);
        outcome
    }

    /// Logs an unobserved failure of a detached task and hands it to the sink.
    pub(crate) fn report_unhandled(&self, error: &Error) {
        tracing::error!(task = %error.task(), %error, "unhandled failure in detached task");

        if let Some(sink) = &self.sink {
            sink(error);
        }
    }

    /// Runs the loop until `root` and every task in `scope` or its nested scopes are terminal.
    pub(crate) fn drive(&self, root: &TaskHeader, scope: ScopeId) -> Result<()> {
        loop {
            if root.state().is_terminal() && self.scope_live(scope) == 0 {
                return Ok(());
            }

            if let Step::Idle = self.step() {
                tracing::warn!(task = %root.id, %scope, "run stalled with unfinished tasks");
                return Err(Error::Stalled { task: root.id });
            }
        }
    }

    /// Steps until the tasks of `scope` and its nested scopes are gone or nothing can move.
    pub(crate) fn drain_scope(&self, scope: ScopeId) {
        while self.scope_live(scope) > 0 {
            if let Step::Idle = self.step() {
                break;
            }
        }
    }

    /// Steps until nothing is runnable or timed. Returns the number of live tasks left.
    pub(crate) fn run_until_idle(&self) -> usize {
        while !matches!(self.step(), Step::Idle) {}
        self.live_tasks()
    }

    /// Cancels every live detached task and lets the cancellations land.
    pub(crate) fn shutdown(&self) -> usize {
        let detached: Vec<ScopeId> = {
            let state = self.state.borrow();
            for entry in state.scopes.values() {
                if entry.mode != ScopeMode::Unstructured {
                    continue;
                }
                for child in entry.children.values() {
                    tracing::warn!(task = %child.id, state = %child.state(), "cancelling detached task at shutdown");
                }
            }
            state
                .scopes
                .iter()
                .filter(|(_, entry)| entry.mode == ScopeMode::Unstructured)
                .map(|(id, _)| *id)
                .collect()
        };

        let mut cancelled = 0;
        for scope in detached {
            cancelled += self.state.borrow_mut().cancel_scope(scope, CancelReason::Shutdown);
            self.drain_scope(scope);
        }
        cancelled
    }

    pub(crate) fn step(&self) -> Step {
        self.drain_inbox();

        let round = {
            let mut state = self.state.borrow_mut();
            if state.queues.is_empty() {
                Vec::new()
            } else {
                tracing::trace!(
                    ready = state.queues.len(),
                    timers = state.timers.len(),
                    "scheduling round"
                );
                state.queues.next_round(self.config.default_workers)
            }
        };

        if !round.is_empty() {
            for (worker, task) in round {
                self.run_task(worker, task);
            }
            return Step::Ran;
        }

        if self.advance_clock() {
            Step::Advanced
        } else {
            Step::Idle
        }
    }

    fn drain_inbox(&self) {
        if self.inbox.is_empty() {
            return;
        }
        let woken = self.inbox.drain();

        let mut state = self.state.borrow_mut();
        for task in woken {
            state.wake(task);
        }
    }

    fn advance_clock(&self) -> bool {
        let (now, due) = {
            let state = self.state.borrow();
            if state.timers.is_empty() {
                return false;
            }
            (state.timers.now(), state.timers.next_due())
        };
        let Some(due) = due else {
            return false;
        };

        if self.config.time_mode == TimeMode::Paced && due > now {
            std::thread::sleep(due - now);
        }

        let mut state = self.state.borrow_mut();
        let fired = state.timers.advance_to(due);
        tracing::debug!(now = ?due, fired = fired.len(), "virtual time advanced");

        for task in fired {
            state.wake(task);
        }
        true
    }

    fn restore(&self, task: TaskId, future: TaskFuture) {
        if let Some(entry) = self.state.borrow_mut().tasks.get_mut(&task) {
            entry.future = Some(future);
        }
    }

    fn run_task(&self, worker: WorkerId, task: TaskId) {
        let (header, mut future, waker) = {
            let mut state = self.state.borrow_mut();
            let Some(entry) = state.tasks.get_mut(&task) else {
                return;
            };
            let Some(future) = entry.future.take() else {
                return;
            };
            (entry.header.clone(), future, entry.waker.clone())
        };
        header.queued.set(false);

        if let Some(reason) = header.cancel_requested() {
            drop(future);
            self.finish(&header, End::Cancelled(reason));
            return;
        }

        let entered = match header.state() {
            TaskState::Created => header.start(),
            _ => header.resume(),
        };
        if let Err(error) = entered {
            tracing::error!(task = %task, %error, "refusing to poll task");
            self.restore(task, future);
            return;
        }

        tracing::trace!(task = %task, %worker, "polling task");
        self.state.borrow_mut().current = Some((task, worker));
        let mut cx = Context::from_waker(&waker);
        let polled = panic::catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx)));
        self.state.borrow_mut().current = None;

        match polled {
            Ok(Poll::Pending) => {
                if let Some(reason) = header.cancel_requested() {
                    self.state.borrow_mut().timers.remove(task);
                    drop(future);
                    self.finish(&header, End::Cancelled(reason));
                    return;
                }

                if let Err(error) = header.suspend() {
                    tracing::error!(task = %task, %error, "could not park task");
                }
                self.restore(task, future);
            }
            Ok(Poll::Ready(())) => {
                drop(future);
                let end = if header.has_error() {
                    End::Failed
                } else {
                    End::Completed
                };
                self.finish(&header, end);
            }
            Err(payload) => {
                drop(future);
                header.record_error(Error::from_panic(task, payload));
                self.finish(&header, End::Failed);
            }
        }
    }

    fn finish(&self, header: &Rc<TaskHeader>, end: End) {
        let task = header.id;
        let transitioned = match end {
            End::Completed => header.complete(),
            End::Failed => header.fail(),
            End::Cancelled(reason) => header.cancel_with(reason),
        };
        if let Err(error) = transitioned {
            tracing::error!(task = %task, %error, "invalid terminal transition");
        }
        header.wake_waiters();

        let failure = match header.state() {
            TaskState::Failed => header.error(),
            _ => None,
        };

        let mut watchers = Vec::new();
        let mut unhandled = None;
        {
            let mut state = self.state.borrow_mut();
            state.tasks.remove(&task);
            state.timers.remove(task);

            let mut fail_fast = false;
            if let Some(scope) = state.scopes.get_mut(&header.scope) {
                scope.children.remove(&task);
                if scope.signalled.remove(&task)
                    && header.state() == TaskState::Cancelled
                    && scope.interrupted.is_none()
                {
                    scope.interrupted = header.error();
                }

                match scope.mode {
                    ScopeMode::Structured => {
                        if let Some(error) = failure
                            && scope.failure.is_none()
                        {
                            scope.failure = Some(error);
                            fail_fast = true;
                        }
                    }
                    ScopeMode::Unstructured => {
                        if !header.handle_alive() {
                            unhandled = failure;
                        }
                    }
                }
            }

            // Scopes waiting on this task directly or through a nested scope.
            let mut next = Some(header.scope);
            while let Some(id) = next.take() {
                if let Some(scope) = state.scopes.get_mut(&id) {
                    watchers.append(&mut scope.waiters);
                    next = scope.parent;
                }
            }

            if fail_fast {
                let cancelled = state.cancel_scope(header.scope, CancelReason::FailFast);
                tracing::debug!(task = %task, scope = %header.scope, cancelled, "structured child failed");
            }
            state.release_scope_if_done(header.scope);
        }

        tracing::debug!(task = %task, state = %header.state(), "task finished");

        for watcher in watchers {
            watcher.wake();
        }
        if let Some(error) = unhandled {
            self.report_unhandled(&error);
        }
    }
}
