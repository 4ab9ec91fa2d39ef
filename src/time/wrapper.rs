//! Virtual-time measurement wrapper for futures.
//!
//! [`Timed`] records the clock reading when it is created and, once the wrapped future
//! completes, reports how much virtual time passed. Time only moves while every task is
//! parked, so the measurement is exact and reproducible.

use crate::timer::Clock;

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

/// A future that wraps another one and measures elapsed virtual time until it completes.
///
/// When awaited, returns `(F::Output, Duration)`, where the duration is counted from the
/// creation of the wrapper.
pub struct Timed<F> {
    clock: Clock,
    /// Clock reading when the wrapper was created.
    start: Duration,
    future: Pin<Box<F>>,
}

impl<F: Future> Timed<F> {
    /// Wraps `future`, starting the measurement at the clock's current reading.
    ///
    /// # Example
    /// ```ignore
    /// let (value, elapsed) = Timed::new(scope.clock(), handle.value()).await;
    /// ```
    pub fn new(clock: Clock, future: F) -> Self {
        Self {
            start: clock.now(),
            clock,
            future: Box::pin(future),
        }
    }

    /// Virtual time at which the measurement started.
    pub fn started_at(&self) -> Duration {
        self.start
    }
}

impl<F: Future> Future for Timed<F> {
    type Output = (F::Output, Duration);

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        match this.future.as_mut().poll(cx) {
            Poll::Ready(output) => {
                let elapsed = this.clock.now().saturating_sub(this.start);
                Poll::Ready((output, elapsed))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<F> std::fmt::Debug for Timed<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timed").field("start", &self.start).finish()
    }
}
