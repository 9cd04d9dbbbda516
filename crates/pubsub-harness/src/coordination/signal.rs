//! Count-down correlation signal.
//!
//! A signal is armed with a count `N`. Every [`CorrelationSignal::signal`]
//! decrements it; at zero the signal is released and every waiter wakes.
//! Signaling never blocks and may happen from any thread, including a
//! delivery callback running on a session's event-loop task.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::{HarnessError, Result};

/// Result of a bounded wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The count reached zero before the timeout.
    Signaled,
    /// The timeout elapsed first.
    TimedOut,
}

impl WaitOutcome {
    /// Whether the wait ended with the signal released.
    #[must_use]
    pub fn is_signaled(self) -> bool {
        self == Self::Signaled
    }
}

#[derive(Debug)]
struct Inner {
    remaining: AtomicUsize,
    released: Notify,
}

/// One-shot count-down latch shared between producers and a waiter.
///
/// Cloning yields another handle to the same latch.
#[derive(Debug, Clone)]
pub struct CorrelationSignal {
    inner: Arc<Inner>,
}

impl CorrelationSignal {
    /// Arm a signal that releases after `count` calls to [`signal`](Self::signal).
    ///
    /// A count of zero yields an already-released signal.
    #[must_use]
    pub fn new(count: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                remaining: AtomicUsize::new(count),
                released: Notify::new(),
            }),
        }
    }

    /// Arm a signal that releases on the first [`signal`](Self::signal).
    #[must_use]
    pub fn one() -> Self {
        Self::new(1)
    }

    /// Count down by one. A no-op once released.
    pub fn signal(&self) {
        let previous = self
            .inner
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));

        if previous == Ok(1) {
            self.inner.released.notify_waiters();
        }
    }

    /// Signals still needed before release.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.inner.remaining.load(Ordering::Acquire)
    }

    /// Whether the count has reached zero.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.remaining() == 0
    }

    /// Wait until released or until `timeout` elapses.
    ///
    /// Suspends the calling task without polling. A zero timeout on an
    /// unreleased signal returns [`WaitOutcome::TimedOut`] immediately.
    pub async fn wait(&self, timeout: Duration) -> WaitOutcome {
        if self.is_released() {
            return WaitOutcome::Signaled;
        }
        if timeout.is_zero() {
            return WaitOutcome::TimedOut;
        }

        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.inner.released.notified();
            tokio::pin!(notified);
            // Register before re-checking so a release in between is not lost
            notified.as_mut().enable();

            if self.is_released() {
                return WaitOutcome::Signaled;
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return if self.is_released() {
                    WaitOutcome::Signaled
                } else {
                    WaitOutcome::TimedOut
                };
            }
        }
    }

    /// Wait like [`wait`](Self::wait), turning a timeout into an error.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Timeout`] if the signal is not released within
    /// `timeout`.
    pub async fn expect(&self, timeout: Duration) -> Result<()> {
        match self.wait(timeout).await {
            WaitOutcome::Signaled => Ok(()),
            WaitOutcome::TimedOut => Err(HarnessError::Timeout {
                what: format!("correlation signal ({} outstanding)", self.remaining()),
                elapsed: timeout,
            }),
        }
    }
}

impl Default for CorrelationSignal {
    fn default() -> Self {
        Self::one()
    }
}
