//! taskloom — a priority task queue runtime.
//!
//! This crate schedules user-defined units of work across one or more
//! queues:
//!
//! - **[`priority`]** -- Numeric priority ranks (0-255) with five named
//!   bands and saturating band-stepping operators.
//! - **[`state`]** -- The per-task state machine with asserted transition
//!   preconditions.
//! - **[`task`]** -- The [`Task`] contract and optional capability
//!   contracts ([`Configurable`], [`Pausable`], [`Cancellable`],
//!   [`Dependent`]), plus the registered [`TaskHandle`].
//! - **[`queue`]** -- The core runtime: priority-sorted waiting list,
//!   concurrency cap, lifecycle driver, pause/resume/cancel protocol,
//!   wait/notify rendezvous, and a state-transition event stream.
//! - **[`linked`]** -- [`LinkedTaskQueue`]: dependency resolution across a
//!   federation of symmetrically linked peer queues.
//! - **[`pool`]** -- The worker-pool handle dispatching lifecycles onto
//!   tokio under a quality-of-service hint.
//! - **[`completion`]** -- One-shot completion signals used for every
//!   cross-task rendezvous.
//! - **[`error`]** -- Library error types via [`thiserror`].
//!
//! All public types are `Send + Sync` and designed for use within a
//! multi-threaded tokio runtime.
//!
//! # Example
//!
//! ```rust,no_run
//! use taskloom::{Band, Priority, Task, TaskHandle, TaskQueue};
//!
//! struct Greet;
//!
//! #[async_trait::async_trait]
//! impl Task for Greet {
//!     fn priority(&self) -> Priority {
//!         Priority::from_band(Band::High)
//!     }
//!
//!     async fn execute(&self) -> bool {
//!         println!("hello");
//!         true
//!     }
//! }
//!
//! # async fn example() {
//! let queue = TaskQueue::new("greetings");
//! queue.add(TaskHandle::new(Greet));
//! queue.start();
//! queue.wait().await;
//! assert!(queue.is_done());
//! # }
//! ```

pub mod completion;
pub mod error;
pub mod linked;
pub mod pool;
pub mod priority;
pub mod queue;
pub mod state;
pub mod task;

// Re-export the most commonly used types at the crate root for convenience.
pub use completion::{Completion, CompletionWaiter};
pub use error::{QueueError, Result};
pub use linked::{DependencyOptions, Federation, LinkedTaskQueue};
pub use pool::WorkerPool;
pub use priority::{Band, Priority};
pub use queue::{TaskEvent, TaskQueue};
pub use state::{Failure, Phase, TaskState};
pub use task::{
    Cancellable, Capabilities, Configurable, Dependent, Pausable, QualityOfService, Task,
    TaskHandle, TaskId, TaskSnapshot,
};
