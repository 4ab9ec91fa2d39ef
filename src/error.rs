//! Error taxonomy for the runtime.
//!
//! Every failure a caller can observe goes through [`Error`]:
//!
//! - [`Error::InvalidState`]: an operation was attempted on a task in an incompatible state
//! - [`Error::TaskFailed`]: a task body returned an error or panicked
//! - [`Error::Cancelled`]: the task observed a cancellation request
//! - [`Error::Stalled`]: the driven task can never make progress again
//!
//! Errors are cheap to clone so that awaiting the same handle twice yields the same error.

use crate::task::{TaskId, TaskState};

use std::fmt;
use std::sync::Arc;

/// Boxed error type accepted from task bodies.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Why a task was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CancelReason {
    /// Explicit request through a handle or a scope.
    Requested,
    /// A sibling in the same structured scope failed.
    FailFast,
    /// The enclosing scope or the task driving it was cancelled.
    ParentCancelled,
    /// The runtime shut down while the task was still live.
    Shutdown,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Requested => write!(f, "requested"),
            Self::FailFast => write!(f, "sibling failed"),
            Self::ParentCancelled => write!(f, "parent cancelled"),
            Self::Shutdown => write!(f, "runtime shutdown"),
        }
    }
}

/// Errors surfaced by the runtime.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The operation is not valid for the task's current state.
    #[error("cannot {operation} {task}: task is {state}")]
    InvalidState {
        task: TaskId,
        state: TaskState,
        operation: &'static str,
    },

    /// The task body failed; `source` is the original error.
    #[error("{task} failed: {source}")]
    TaskFailed {
        task: TaskId,
        #[source]
        source: Arc<dyn std::error::Error + Send + Sync + 'static>,
    },

    /// The task was cancelled before it could complete.
    #[error("{task} was cancelled ({reason})")]
    Cancelled { task: TaskId, reason: CancelReason },

    /// Nothing is ready, no delay is pending and `task` is still not finished.
    #[error("{task} can never complete: no runnable or timed work left")]
    Stalled { task: TaskId },
}

impl Error {
    /// Wraps an error returned by the body of `task`.
    ///
    /// Errors that already are runtime errors (typically re-raised with `?` after awaiting
    /// another task) are passed through unchanged, so the first failure keeps its identity.
    pub(crate) fn from_body(task: TaskId, error: BoxError) -> Self {
        match error.downcast::<Error>() {
            Ok(error) => *error,
            Err(other) => Error::TaskFailed {
                task,
                source: Arc::from(other),
            },
        }
    }

    /// Builds a failure from a caught panic payload.
    pub(crate) fn from_panic(task: TaskId, payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "task panicked".to_string()
        };

        Error::TaskFailed {
            task,
            source: Arc::new(Panicked(message)),
        }
    }

    /// Returns `true` for [`Error::Cancelled`].
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled { .. })
    }

    /// Returns `true` for [`Error::TaskFailed`].
    pub fn is_failure(&self) -> bool {
        matches!(self, Error::TaskFailed { .. })
    }

    /// The task the error is about.
    pub fn task(&self) -> TaskId {
        match self {
            Error::InvalidState { task, .. }
            | Error::TaskFailed { task, .. }
            | Error::Cancelled { task, .. }
            | Error::Stalled { task } => *task,
        }
    }
}

/// Message of a panic caught while polling a task body.
#[derive(Debug, thiserror::Error)]
#[error("panicked: {0}")]
pub struct Panicked(pub String);
