//! Per-dispatcher ready queues.
//!
//! Each dispatcher owns a FIFO of runnable task ids. The scheduler drains them in rounds:
//! one task for the single `Main` context and up to `default_workers` tasks for the shared
//! `Default` pool.

use crate::task::TaskId;

use std::collections::VecDeque;
use std::fmt;

/// Named pool of execution contexts a task runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Dispatcher {
    /// Shared worker pool, for latency- or compute-bound work.
    #[default]
    Default,
    /// The caller's own single context.
    Main,
}

impl fmt::Display for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dispatcher::Default => f.write_str("default"),
            Dispatcher::Main => f.write_str("main"),
        }
    }
}

/// The logical execution context a task was polled on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId {
    /// Dispatcher the context belongs to.
    pub dispatcher: Dispatcher,
    /// Slot within the dispatcher; always `0` for `Main`.
    pub index: usize,
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.dispatcher {
            Dispatcher::Main => f.write_str("main"),
            Dispatcher::Default => write!(f, "default-worker-{}", self.index),
        }
    }
}

/// FIFO queues of runnable tasks, one per dispatcher.
#[derive(Debug, Default)]
pub(crate) struct ReadyQueues {
    main: VecDeque<TaskId>,
    default: VecDeque<TaskId>,
}

impl ReadyQueues {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Enqueues a task at the back of its dispatcher's queue.
    pub(crate) fn push(&mut self, dispatcher: Dispatcher, task: TaskId) {
        match dispatcher {
            Dispatcher::Main => self.main.push_back(task),
            Dispatcher::Default => self.default.push_back(task),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.main.is_empty() && self.default.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.main.len() + self.default.len()
    }

    /// Takes the tasks for the next scheduling round.
    ///
    /// The main context gets at most one task; the default pool gets at most `workers`,
    /// each assigned to its own worker slot. Whatever does not fit waits for the next round
    /// in order.
    pub(crate) fn next_round(&mut self, workers: usize) -> Vec<(WorkerId, TaskId)> {
        let mut round = Vec::with_capacity(workers + 1);

        if let Some(task) = self.main.pop_front() {
            let worker = WorkerId {
                dispatcher: Dispatcher::Main,
                index: 0,
            };
            round.push((worker, task));
        }

        for index in 0..workers.max(1) {
            let Some(task) = self.default.pop_front() else {
                break;
            };
            let worker = WorkerId {
                dispatcher: Dispatcher::Default,
                index,
            };
            round.push((worker, task));
        }

        round
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_respects_worker_count_and_order() {
        let mut queues = ReadyQueues::new();
        for id in 1..=5 {
            queues.push(Dispatcher::Default, TaskId(id));
        }
        queues.push(Dispatcher::Main, TaskId(6));
        queues.push(Dispatcher::Main, TaskId(7));

        let round: Vec<_> = queues
            .next_round(2)
            .into_iter()
            .map(|(worker, task)| (worker.to_string(), task))
            .collect();

        assert_eq!(
            round,
            vec![
                ("main".to_string(), TaskId(6)),
                ("default-worker-0".to_string(), TaskId(1)),
                ("default-worker-1".to_string(), TaskId(2)),
            ]
        );
        assert_eq!(queues.len(), 4);
    }

    #[test]
    fn test_empty_round() {
        let mut queues = ReadyQueues::new();

        assert!(queues.next_round(4).is_empty());
        assert!(queues.is_empty());
    }
}
