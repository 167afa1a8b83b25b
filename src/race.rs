//! Deadline race.
//!
//! Runs a callback on its own task and races its completion against a
//! deadline and a cancellation token, resolving on whichever is first.
//!
//! A callback that loses the race is not aborted: its task keeps running to
//! completion and the result is dropped. `Racer` bounds how many of those
//! tasks one connection may have outstanding at a time, so a handler that
//! stalls forever degrades into a capped number of parked tasks instead of
//! an unbounded pile.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{warn, Instrument};

/// Outcome of a deadline race.
#[derive(Debug, PartialEq, Eq)]
pub enum Race<T> {
    /// The callback finished first.
    Completed(T),
    /// The deadline passed first.
    Elapsed,
    /// The token was cancelled first.
    Cancelled,
    /// The callback's task panicked before producing a value.
    Panicked,
}

/// Why a race was lost before the callback could be started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lost {
    Elapsed,
    Cancelled,
}

impl<T> From<Lost> for Race<T> {
    fn from(lost: Lost) -> Self {
        match lost {
            Lost::Elapsed => Race::Elapsed,
            Lost::Cancelled => Race::Cancelled,
        }
    }
}

/// A callback running on its own task.
///
/// The completion can be raced repeatedly until it resolves, which lets a
/// caller keep waiting on the same in-flight operation after a deadline
/// passes instead of starting a second one.
pub struct Completion<T> {
    rx: oneshot::Receiver<T>,
}

impl<T: Send + 'static> Completion<T> {
    /// Spawn `fut` on the runtime. `permit` is held until `fut` finishes.
    pub fn spawn<F>(permit: Option<OwnedSemaphorePermit>, fut: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        tokio::spawn(
            async move {
                let value = fut.await;
                drop(permit);
                // Receiver is gone when the race was lost.
                let _ = tx.send(value);
            }
            .in_current_span(),
        );
        Self { rx }
    }

    /// Race the callback against `deadline` and `token`.
    ///
    /// Cancellation is checked first, then completion, then the deadline.
    /// Must not be called again after it returned `Completed` or `Panicked`.
    pub async fn race(&mut self, deadline: Instant, token: &CancellationToken) -> Race<T> {
        tokio::select! {
            biased;
            _ = token.cancelled() => Race::Cancelled,
            res = &mut self.rx => match res {
                Ok(value) => Race::Completed(value),
                Err(_) => Race::Panicked,
            },
            _ = sleep_until(deadline) => Race::Elapsed,
        }
    }
}

/// Per-connection race runner: a cancellation token plus a cap on
/// outstanding callback tasks.
#[derive(Clone)]
pub struct Racer {
    token: CancellationToken,
    slots: Arc<Semaphore>,
    max_outstanding: usize,
}

impl Racer {
    /// Create a racer. A cap of zero is treated as one.
    pub fn new(token: CancellationToken, max_outstanding: usize) -> Self {
        let max_outstanding = max_outstanding.max(1);
        Self {
            token,
            slots: Arc::new(Semaphore::new(max_outstanding)),
            max_outstanding,
        }
    }

    /// Number of callback tasks still running, including abandoned ones.
    pub fn outstanding(&self) -> usize {
        self.max_outstanding - self.slots.available_permits()
    }

    /// Start `fut` once a slot is free.
    ///
    /// Waiting for the slot counts against `deadline`; if it passes first
    /// the callback is never started.
    pub async fn start<F, T>(&self, deadline: Instant, fut: F) -> Result<Completion<T>, Lost>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let permit = tokio::select! {
            biased;
            _ = self.token.cancelled() => return Err(Lost::Cancelled),
            permit = Arc::clone(&self.slots).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return Err(Lost::Cancelled),
            },
            _ = sleep_until(deadline) => {
                warn!(
                    outstanding = self.outstanding(),
                    "stalled callback limit reached, callback not started"
                );
                return Err(Lost::Elapsed);
            }
        };
        Ok(Completion::spawn(Some(permit), fut))
    }

    /// Run `fut` on its own task and race it against `timeout`.
    pub async fn race<F, T>(&self, timeout: Duration, fut: F) -> Race<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let deadline = Instant::now() + timeout;
        match self.start(deadline, fut).await {
            Ok(mut completion) => completion.race(deadline, &self.token).await,
            Err(lost) => lost.into(),
        }
    }
}
