//! Runtime subsystem modules.

mod core;
pub(crate) mod queue;
pub(crate) mod scheduler;
pub(crate) mod waker;
mod yield_now;

pub use self::core::Runtime;
pub use queue::{Dispatcher, WorkerId};
pub use yield_now::{YieldNow, yield_now};
