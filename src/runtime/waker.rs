//! Waker implementation for task wake-up notifications.
//!
//! A task's waker does not touch the scheduler directly: it records the task id in a
//! thread-safe inbox that the decision loop drains at the start of every round. This keeps
//! the wakers `Send + Sync` as the standard protocol requires while every scheduling
//! decision stays inside the single loop.

use crate::task::TaskId;

use parking_lot::Mutex;

use std::sync::Arc;
use std::task::{Wake, Waker};

/// Task ids woken since the last time the loop looked.
#[derive(Debug, Default)]
pub(crate) struct WakeInbox {
    woken: Mutex<Vec<TaskId>>,
}

impl WakeInbox {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn push(&self, task: TaskId) {
        self.woken.lock().push(task);
    }

    /// Takes every pending wake-up in the order they happened.
    pub(crate) fn drain(&self) -> Vec<TaskId> {
        std::mem::take(&mut *self.woken.lock())
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.woken.lock().is_empty()
    }
}

/// Waker that posts its task id to the inbox.
struct TaskWaker {
    task: TaskId,
    inbox: Arc<WakeInbox>,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.inbox.push(self.task);
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.inbox.push(self.task);
    }
}

/// Creates the waker handed to every poll of `task`.
pub(crate) fn make_waker(task: TaskId, inbox: Arc<WakeInbox>) -> Waker {
    Waker::from(Arc::new(TaskWaker { task, inbox }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wakes_land_in_inbox_in_order() {
        let inbox = WakeInbox::new();
        let first = make_waker(TaskId(1), inbox.clone());
        let second = make_waker(TaskId(2), inbox.clone());

        second.wake_by_ref();
        first.clone().wake();
        second.wake();

        assert_eq!(inbox.drain(), vec![TaskId(2), TaskId(1), TaskId(2)]);
        assert!(inbox.is_empty());
    }
}
