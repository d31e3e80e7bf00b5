//! Worker-pool handle.
//!
//! [`WorkerPool`] is the queue's dispatch surface: closures are spawned onto
//! the tokio runtime inside a span carrying the task's quality-of-service
//! hint, and a suspend gate holds dispatched-but-unstarted work while the
//! owning queue is paused.  Work that has already begun keeps running — the
//! model is cooperative, never preemptive.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::task::QualityOfService;

/// Dispatch handle over the tokio runtime.
///
/// Cheaply cloneable (`Arc`-backed) and `Send + Sync`.  Every queue owns
/// one; callers may also hand their own pool to
/// [`TaskQueue::notify_on`](crate::TaskQueue::notify_on).
#[derive(Debug, Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

#[derive(Debug)]
struct PoolInner {
    /// `true` while the pool is suspended.
    gate: watch::Sender<bool>,
}

impl WorkerPool {
    /// Create a running (unsuspended) pool handle.
    #[must_use]
    pub fn new() -> Self {
        let (gate, _rx) = watch::channel(false);
        Self {
            inner: Arc::new(PoolInner { gate }),
        }
    }

    /// Spawn `future` under the given quality-of-service hint.
    ///
    /// The hint is attached to the task's tracing span; scheduling-class
    /// mapping is left to the platform, which need only honour it
    /// monotonically.  If the pool is suspended the future holds at the gate
    /// until [`resume`](Self::resume).
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<F>(&self, qos: QualityOfService, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let mut gate = self.inner.gate.subscribe();
        let gated = async move {
            // Hold here while suspended; a closed gate means the pool handle
            // is gone and the work may proceed.
            let _ = gate.wait_for(|suspended| !suspended).await;
            future.await
        };
        tokio::spawn(gated.instrument(tracing::trace_span!("pool_task", qos = qos.as_str())))
    }

    /// Suspend the pool: dispatched-but-unstarted work holds at the gate.
    pub fn suspend(&self) {
        self.inner.gate.send_replace(true);
        tracing::debug!("worker pool suspended");
    }

    /// Resume the pool, releasing gated work.
    pub fn resume(&self) {
        self.inner.gate.send_replace(false);
        tracing::debug!("worker pool resumed");
    }

    /// Whether the pool is currently suspended.
    #[must_use]
    pub fn is_suspended(&self) -> bool {
        *self.inner.gate.borrow()
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
