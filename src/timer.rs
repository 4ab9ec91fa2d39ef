//! Virtual clock and the delay suspension point.
//!
//! Time inside the runtime is virtual: it starts at zero when the runtime is created and only
//! moves when the scheduler has nothing left to run, jumping straight to the earliest pending
//! deadline. A delay never blocks a thread; only the outermost driving loop may sleep, and
//! only when the runtime is configured with [`TimeMode::Paced`].
//!
//! [`TimeMode::Paced`]: crate::TimeMode::Paced

use crate::runtime::scheduler::Shared;
use crate::task::TaskId;
use crate::time::Timed;

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::rc::Weak;
use std::task::{Context, Poll};
use std::time::Duration;

/// Pending deadlines, ordered by due time then by task id.
///
/// A task has at most one entry. Registering again keeps whichever deadline is earlier; the
/// task re-registers anything still outstanding when it is polled after waking.
#[derive(Debug, Default)]
pub(crate) struct TimerQueue {
    now: Duration,
    entries: BTreeSet<(Duration, TaskId)>,
    index: HashMap<TaskId, Duration>,
}

impl TimerQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn now(&self) -> Duration {
        self.now
    }

    /// Registers `task` to be woken at `due`.
    pub(crate) fn insert(&mut self, task: TaskId, due: Duration) {
        if let Some(&existing) = self.index.get(&task) {
            if existing <= due {
                return;
            }
            self.entries.remove(&(existing, task));
        }

        self.entries.insert((due, task));
        self.index.insert(task, due);
    }

    pub(crate) fn remove(&mut self, task: TaskId) -> bool {
        match self.index.remove(&task) {
            Some(due) => self.entries.remove(&(due, task)),
            None => false,
        }
    }

    /// Earliest pending deadline.
    pub(crate) fn next_due(&self) -> Option<Duration> {
        self.entries.first().map(|(due, _)| *due)
    }

    /// Moves virtual time to `to` (never backwards) and returns every task due by then,
    /// earliest first, ties in spawn order.
    pub(crate) fn advance_to(&mut self, to: Duration) -> Vec<TaskId> {
        self.now = self.now.max(to);

        let mut fired = Vec::new();
        while let Some(&(due, task)) = self.entries.first() {
            if due > self.now {
                break;
            }
            self.entries.pop_first();
            self.index.remove(&task);
            fired.push(task);
        }
        fired
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Read access to a runtime's virtual clock.
///
/// Obtained from [`Runtime::clock`](crate::Runtime::clock) or [`Scope::clock`](crate::Scope::clock).
#[derive(Clone)]
pub struct Clock {
    shared: Weak<Shared>,
}

impl Clock {
    pub(crate) fn new(shared: Weak<Shared>) -> Self {
        Self { shared }
    }

    /// Virtual time elapsed since the runtime was created.
    ///
    /// Reads as zero once the runtime is gone.
    pub fn now(&self) -> Duration {
        self.shared
            .upgrade()
            .map(|shared| shared.now())
            .unwrap_or_default()
    }

    /// Returns a suspension point that completes `duration` from now.
    pub fn after(&self, duration: Duration) -> Delay {
        Delay::new(self.shared.clone(), duration)
    }

    /// Wraps `future` so that it also reports how much virtual time it took.
    pub fn timed<F: Future>(&self, future: F) -> Timed<F> {
        Timed::new(self.clone(), future)
    }
}

impl std::fmt::Debug for Clock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Clock").field("now", &self.now()).finish()
    }
}

/// A future that completes once virtual time reaches its deadline.
///
/// The deadline is fixed when the delay is created. Polling registers the current task in
/// the runtime's timer queue and yields; the scheduler wakes the task when the deadline is
/// reached. A zero delay completes on the first poll without suspending.
///
/// # Panics
///
/// Polling a non-zero delay outside of a task driven by its runtime panics.
#[derive(Debug)]
#[must_use = "delays do nothing unless awaited"]
pub struct Delay {
    shared: Weak<Shared>,
    duration: Duration,
    due: Option<Duration>,
}

impl Delay {
    pub(crate) fn new(shared: Weak<Shared>, duration: Duration) -> Self {
        let due = shared.upgrade().map(|shared| shared.now() + duration);

        Self {
            shared,
            duration,
            due,
        }
    }

    /// The virtual instant at which the delay completes.
    pub fn deadline(&self) -> Option<Duration> {
        self.due
    }
}

impl Future for Delay {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.duration.is_zero() {
            return Poll::Ready(());
        }

        // The runtime is gone: nothing will ever advance this clock.
        let Some(shared) = self.shared.upgrade() else {
            return Poll::Pending;
        };

        let duration = self.duration;
        let due = *self.due.get_or_insert_with(|| shared.now() + duration);
        if shared.now() >= due {
            return Poll::Ready(());
        }

        if !shared.register_delay(due) {
            panic!("delay polled outside of a task driven by its runtime");
        }

        Poll::Pending
    }
}
