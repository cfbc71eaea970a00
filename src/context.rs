//! Deadlines and cancellation for blocking or network-bound operations
//!
//! Every pool, executor and transaction operation takes a [`Context`]. A
//! context carries an optional deadline and an optional cancellation signal;
//! whichever fires first interrupts the operation.

use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Deadline + cancellation carried through an operation
#[derive(Debug, Clone, Default)]
pub struct Context {
    deadline: Option<Instant>,
    cancel: Option<watch::Receiver<bool>>,
}

/// Cancels every [`Context`] derived from the pair it was created with
///
/// Dropping the handle does not cancel.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

/// Why an operation was interrupted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Interrupted {
    Deadline,
    Cancelled,
}

impl From<Interrupted> for crate::Error {
    fn from(i: Interrupted) -> Self {
        match i {
            Interrupted::Deadline => crate::Error::DeadlineExceeded,
            Interrupted::Cancelled => crate::Error::Cancelled,
        }
    }
}

impl Context {
    /// No deadline, never cancelled
    pub fn background() -> Self {
        Self::default()
    }

    /// Deadline `timeout` from now
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::background().timeout(timeout)
    }

    /// Absolute deadline
    pub fn with_deadline(deadline: Instant) -> Self {
        Self::background().deadline_at(deadline)
    }

    /// A cancellable context and the handle that cancels it
    pub fn cancellable() -> (Self, CancelHandle) {
        Self::background().child_cancellable()
    }

    /// Derive a context whose deadline is the earlier of the current one and
    /// `timeout` from now
    pub fn timeout(&self, timeout: Duration) -> Self {
        self.deadline_at(Instant::now() + timeout)
    }

    /// Derive a context whose deadline is the earlier of the current one and `deadline`
    pub fn deadline_at(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(current) if current < deadline => current,
            _ => deadline,
        };
        Self {
            deadline: Some(deadline),
            cancel: self.cancel.clone(),
        }
    }

    /// Derive a context cancelled by the returned handle
    ///
    /// Replaces any cancellation signal inherited from `self`; the deadline is kept.
    pub fn child_cancellable(&self) -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        let ctx = Self {
            deadline: self.deadline,
            cancel: Some(rx),
        };
        (ctx, CancelHandle { tx })
    }

    /// Deadline, if any
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline (`None` = unbounded)
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Whether the cancel handle has fired
    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
    }

    /// Whether the deadline has passed
    pub fn is_expired(&self) -> bool {
        self.deadline.map(|d| Instant::now() >= d).unwrap_or(false)
    }

    /// Drive `fut` until it completes or the context fires
    ///
    /// When the context fires first, `fut` is dropped mid-flight.
    pub(crate) async fn run<F: Future>(&self, fut: F) -> Result<F::Output, Interrupted> {
        if self.is_cancelled() {
            return Err(Interrupted::Cancelled);
        }
        if self.is_expired() {
            return Err(Interrupted::Deadline);
        }

        let deadline = async {
            match self.deadline {
                Some(d) => tokio::time::sleep_until(d).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = cancelled(self.cancel.clone()) => Err(Interrupted::Cancelled),
            _ = deadline => Err(Interrupted::Deadline),
            out = fut => Ok(out),
        }
    }

    /// Sleep for `duration`, waking early with an error if the context fires
    pub(crate) async fn sleep(&self, duration: Duration) -> Result<(), Interrupted> {
        self.run(tokio::time::sleep(duration)).await
    }
}

impl CancelHandle {
    /// Cancel the associated contexts
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

async fn cancelled(rx: Option<watch::Receiver<bool>>) {
    match rx {
        Some(mut rx) => {
            if rx.wait_for(|cancelled| *cancelled).await.is_err() {
                // Handle dropped without cancelling
                std::future::pending::<()>().await;
            }
        }
        None => std::future::pending::<()>().await,
    }
}
