//! Queue error types.
//!
//! Recoverable API misuse surfaces through [`QueueError`].  Task failures are
//! *states*, not errors: a task whose `execute` returns `false` transitions to
//! a failed state and is observable through the queue's view accessors, never
//! through a `Result`.  Invariant violations (illegal state transitions,
//! terminal-state re-entry) are programmer errors and panic instead.

use uuid::Uuid;

/// Unified error type for the task queue runtime.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The referenced task does not exist in the queue.
    #[error("task not found: {task_id}")]
    TaskNotFound {
        /// The [`Uuid`] that was looked up.
        task_id: Uuid,
    },

    /// The task is not in a state that permits the requested operation.
    #[error("invalid task state for {task_id}: {reason}")]
    InvalidTaskState { task_id: Uuid, reason: String },
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, QueueError>;
