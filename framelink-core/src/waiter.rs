//! Cooperative wake primitive combining a deadline with notification.
//!
//! One side calls [`Waiter::notify`]; another side waits with a
//! deadline and learns whether it was woken or timed out. Receive tasks
//! notify on every decoded envelope, which lets a pacing loop react to
//! an ACK immediately while still honouring its frame deadline.
//!
//! A notification issued while nobody is waiting is kept as a single
//! pending permit, so the next wait returns at once and no wakeup is
//! lost. Several notifications collapse into one permit: a `Notified`
//! result never promises new data, so callers drain their inboxes and
//! re-check their own condition before waiting again.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

/// Outcome of a bounded wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    Notified,
    TimedOut,
}

impl WaitResult {
    pub fn is_notified(self) -> bool {
        matches!(self, WaitResult::Notified)
    }

    pub fn is_timed_out(self) -> bool {
        matches!(self, WaitResult::TimedOut)
    }
}

/// Shared notify/wait handle. Clones share one notification state.
#[derive(Debug, Clone, Default)]
pub struct Waiter {
    notify: Arc<Notify>,
}

impl Waiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake one blocked waiter, or leave a permit for the next wait.
    pub fn notify(&self) {
        self.notify.notify_one();
    }

    /// Wait until notified, with no deadline.
    pub async fn wait(&self) {
        self.notify.notified().await;
    }

    /// Wait until notified or until `timeout` has elapsed.
    pub async fn wait_for(&self, timeout: Duration) -> WaitResult {
        match tokio::time::timeout(timeout, self.notify.notified()).await {
            Ok(()) => WaitResult::Notified,
            Err(_) => WaitResult::TimedOut,
        }
    }

    /// Wait until notified or until `deadline` is reached.
    pub async fn wait_until(&self, deadline: Instant) -> WaitResult {
        match tokio::time::timeout_at(deadline, self.notify.notified()).await {
            Ok(()) => WaitResult::Notified,
            Err(_) => WaitResult::TimedOut,
        }
    }
}
