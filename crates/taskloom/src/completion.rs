//! One-shot completion rendezvous.
//!
//! Every registered task owns a [`Completion`]; the runtime signals it
//! exactly once, when the task reaches a terminal state.  Any number of
//! [`CompletionWaiter`]s may be taken from it — queue `wait` calls, local
//! dependency awaits, and federated dependency watchers all block on the
//! same signal.  A waiter subscribed after the signal observes it
//! immediately, which is what makes late-joining dependents race-free.
//!
//! Backed by [`tokio::sync::watch`] rather than `Notify`: `watch` retains
//! the signalled value, so there is no lost-wakeup window between checking
//! and awaiting.

use std::time::Duration;

use tokio::sync::watch;

/// The producing side of a completion signal.
#[derive(Debug)]
pub struct Completion {
    tx: watch::Sender<bool>,
}

impl Completion {
    /// Create an unsignalled completion.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Signal completion.  Idempotent.
    pub fn signal(&self) {
        self.tx.send_replace(true);
    }

    /// Whether the signal has fired.
    #[must_use]
    pub fn is_signalled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Take a new waiter on this signal.
    #[must_use]
    pub fn waiter(&self) -> CompletionWaiter {
        CompletionWaiter {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}

/// The consuming side of a completion signal.
#[derive(Debug, Clone)]
pub struct CompletionWaiter {
    rx: watch::Receiver<bool>,
}

impl CompletionWaiter {
    /// Whether the signal has fired.
    #[must_use]
    pub fn is_signalled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Block until the signal fires.
    ///
    /// A [`Completion`] dropped without signalling releases its waiters, so
    /// a vanished producer cannot park a waiter forever.
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        let _ = rx.wait_for(|signalled| *signalled).await;
    }

    /// Block until the signal fires or `timeout` elapses.
    ///
    /// Returns `true` when the signal fired in time.
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait()).await.is_ok()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
