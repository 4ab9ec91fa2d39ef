//! Time utilities on top of the virtual clock.
//!
//! - [`Clock`](crate::Clock) and [`Delay`](crate::Delay) are the suspension primitive
//! - [`Timed`] measures how much virtual time a future took
//!
//! # Example: Timing concurrent work
//!
//! ```ignore
//! use cotask::{Dispatcher, Error, Runtime};
//! use std::time::Duration;
//!
//! let mut rt = Runtime::new();
//! let elapsed = rt.run_blocking(|scope| async move {
//!     let clock = scope.clock();
//!     let a = scope.spawn(Dispatcher::Default, {
//!         let scope = scope.clone();
//!         async move { scope.delay(Duration::from_secs(1)).await; Ok::<_, Error>(1) }
//!     });
//!     let (_value, elapsed) = clock.timed(a.value()).await;
//!     Ok::<_, Error>(elapsed)
//! });
//! assert_eq!(elapsed.unwrap(), Duration::from_secs(1));
//! ```

pub mod wrapper;

pub use wrapper::Timed;
