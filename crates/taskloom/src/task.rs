//! Task contracts and the registered task handle.
//!
//! Consumers implement [`Task`] (required) plus any combination of the
//! capability contracts — [`Configurable`], [`Pausable`], [`Cancellable`],
//! [`Dependent`].  Capabilities are advertised through the `as_*` accessors
//! on [`Task`] and recorded once into a [`Capabilities`] flag set when the
//! task is wrapped in a [`TaskHandle`]; the scheduler dispatches only to the
//! capabilities a task advertises and performs no runtime type queries.
//!
//! A [`TaskHandle`] is the registered form of a task: an `Arc`-backed,
//! clone-cheap handle owning the task object together with its identity,
//! mutable priority and state, completion signal, dependency snapshot, and
//! timestamps.  Two handles compare equal iff their ids match.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::completion::{Completion, CompletionWaiter};
use crate::priority::{Band, Priority};
use crate::state::TaskState;

/// Unique, random (128-bit) task identifier.
pub type TaskId = Uuid;

// ---------------------------------------------------------------------------
// Quality of service
// ---------------------------------------------------------------------------

/// Per-task scheduling-class hint, lowest to highest urgency.
///
/// The worker pool is only required to honour the hint monotonically; the
/// concrete mapping is platform-dependent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityOfService {
    /// Invisible maintenance work.
    Background,
    /// Long-running work the user is not waiting on.
    Utility,
    /// The default class.
    Default,
    /// Work the user asked for and is waiting on.
    UserInitiated,
    /// Work blocking the interactive surface.
    UserInteractive,
}

impl QualityOfService {
    /// Short machine-readable name, used in tracing spans.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            QualityOfService::Background => "background",
            QualityOfService::Utility => "utility",
            QualityOfService::Default => "default",
            QualityOfService::UserInitiated => "user_initiated",
            QualityOfService::UserInteractive => "user_interactive",
        }
    }
}

impl Default for QualityOfService {
    fn default() -> Self {
        QualityOfService::Default
    }
}

impl fmt::Display for QualityOfService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Contracts
// ---------------------------------------------------------------------------

/// A unit of user-supplied work.
///
/// `execute` is the only required hook.  Hooks take `&self` because the
/// runtime may deliver a pause or cancel request *while* `execute` is in
/// flight; tasks keep whatever internal mutability they need (atomics,
/// locks).  Stage-advancing hooks (`configure`, `execute`, `finish`) are
/// never invoked concurrently with each other on the same task, though
/// consecutive calls may land on different threads.
#[async_trait]
pub trait Task: Send + Sync {
    /// The priority this task enters the queue with.
    fn priority(&self) -> Priority {
        Priority::default()
    }

    /// The scheduling-class hint for this task's lifecycle dispatch.
    fn qos(&self) -> QualityOfService {
        QualityOfService::Default
    }

    /// Perform the work.  `true` means success.
    async fn execute(&self) -> bool;

    /// Invoked exactly once after the task reaches a terminal state
    /// (succeeded, failed, or cancelled).
    async fn finish(&self) {}

    /// Advertise the [`Configurable`] capability.
    fn as_configurable(&self) -> Option<&dyn Configurable> {
        None
    }

    /// Advertise the [`Pausable`] capability.
    fn as_pausable(&self) -> Option<&dyn Pausable> {
        None
    }

    /// Advertise the [`Cancellable`] capability.
    fn as_cancellable(&self) -> Option<&dyn Cancellable> {
        None
    }

    /// Advertise the [`Dependent`] capability.
    fn as_dependent(&self) -> Option<&dyn Dependent> {
        None
    }
}

/// A task with a one-time configuration stage between prepare and execute.
#[async_trait]
pub trait Configurable: Send + Sync {
    /// Invoked once after prepare and before execute.  `false` fails the
    /// task with `failed(configuring)`.
    async fn configure(&self) -> bool;
}

/// A task that can suspend and resume cooperatively.
#[async_trait]
pub trait Pausable: Send + Sync {
    /// Delivered while the task is `current(executing)`.  `false` fails the
    /// task with `failed(pausing)`.
    async fn pause(&self) -> bool;

    /// Delivered while the task is `done(pausing)`.  `false` fails the task
    /// with `failed(resuming)`.
    async fn resume(&self) -> bool;
}

/// A task that can abort cooperatively.
#[async_trait]
pub trait Cancellable: Send + Sync {
    /// Delivered while the task is `current(executing)`.  `false` fails the
    /// task with `failed(cancelling)`.
    async fn cancel(&self) -> bool;
}

/// A task that cannot execute until other tasks have succeeded.
#[async_trait]
pub trait Dependent: Send + Sync {
    /// The tasks this one depends on.
    ///
    /// Consulted once, when the task is wrapped in a [`TaskHandle`]; the
    /// snapshot lives on the handle from then on.
    fn dependencies(&self) -> Vec<TaskHandle>;

    /// Invoked once per dependency, after that dependency completes.
    async fn dependency_finished(&self, dependency: &TaskHandle) {
        let _ = dependency;
    }
}

// ---------------------------------------------------------------------------
// Capability record
// ---------------------------------------------------------------------------

/// Which optional contracts a task advertises, recorded at registration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub configurable: bool,
    pub pausable: bool,
    pub cancellable: bool,
    pub dependent: bool,
}

// ---------------------------------------------------------------------------
// TaskHandle
// ---------------------------------------------------------------------------

/// The registered form of a task.
///
/// Cheaply cloneable; all clones refer to the same task.  Equality and
/// hashing are by task id.
#[derive(Clone)]
pub struct TaskHandle {
    cell: Arc<TaskCell>,
}

struct TaskCell {
    id: TaskId,
    qos: QualityOfService,
    caps: Capabilities,
    priority: Mutex<Priority>,
    state: Mutex<TaskState>,
    /// Dependency snapshot taken at registration.
    dependencies: Vec<TaskHandle>,
    completion: Completion,
    /// Guards the exactly-once terminal protocol.
    finalized: std::sync::atomic::AtomicBool,
    work: Box<dyn Task>,
    created_at: DateTime<Utc>,
    started_at: Mutex<Option<DateTime<Utc>>>,
    completed_at: Mutex<Option<DateTime<Utc>>>,
}

impl TaskHandle {
    /// Register `task`, assigning it a fresh random id and recording its
    /// capabilities and dependency snapshot.
    #[must_use]
    pub fn new(task: impl Task + 'static) -> Self {
        let work: Box<dyn Task> = Box::new(task);
        let caps = Capabilities {
            configurable: work.as_configurable().is_some(),
            pausable: work.as_pausable().is_some(),
            cancellable: work.as_cancellable().is_some(),
            dependent: work.as_dependent().is_some(),
        };
        let dependencies = work
            .as_dependent()
            .map(|dependent| dependent.dependencies())
            .unwrap_or_default();
        let priority = work.priority();
        let qos = work.qos();

        Self {
            cell: Arc::new(TaskCell {
                id: Uuid::new_v4(),
                qos,
                caps,
                priority: Mutex::new(priority),
                state: Mutex::new(TaskState::new()),
                dependencies,
                completion: Completion::new(),
                finalized: std::sync::atomic::AtomicBool::new(false),
                work,
                created_at: Utc::now(),
                started_at: Mutex::new(None),
                completed_at: Mutex::new(None),
            }),
        }
    }

    /// The task's stable id.
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.cell.id
    }

    /// The task's scheduling-class hint.
    #[must_use]
    pub fn qos(&self) -> QualityOfService {
        self.cell.qos
    }

    /// The capability record.
    #[must_use]
    pub fn capabilities(&self) -> Capabilities {
        self.cell.caps
    }

    /// Current priority.
    #[must_use]
    pub fn priority(&self) -> Priority {
        *self.cell.priority.lock().expect("priority lock poisoned")
    }

    /// Replace the priority.  The owning queue re-sorts on its next pass.
    pub fn set_priority(&self, priority: Priority) {
        *self.cell.priority.lock().expect("priority lock poisoned") = priority;
    }

    /// Bump the priority one band up.  Returns whether it changed.
    pub fn increase_priority(&self) -> bool {
        self.cell
            .priority
            .lock()
            .expect("priority lock poisoned")
            .increase()
    }

    /// Drop the priority one band down.  Returns whether it changed.
    pub fn decrease_priority(&self) -> bool {
        self.cell
            .priority
            .lock()
            .expect("priority lock poisoned")
            .decrease()
    }

    /// Snapshot of the current state.
    #[must_use]
    pub fn state(&self) -> TaskState {
        *self.cell.state.lock().expect("state lock poisoned")
    }

    /// Mutate the state under its lock.
    pub(crate) fn update_state<R>(&self, mutate: impl FnOnce(&mut TaskState) -> R) -> R {
        let mut state = self.cell.state.lock().expect("state lock poisoned");
        mutate(&mut state)
    }

    /// The dependency snapshot recorded at registration.
    #[must_use]
    pub fn dependencies(&self) -> &[TaskHandle] {
        &self.cell.dependencies
    }

    /// Dependencies that have not yet succeeded.
    #[must_use]
    pub fn incomplete_dependencies(&self) -> Vec<TaskHandle> {
        self.cell
            .dependencies
            .iter()
            .filter(|dep| !dep.state().did_succeed())
            .cloned()
            .collect()
    }

    /// The first incomplete, non-failed dependency.
    #[must_use]
    pub fn up_next(&self) -> Option<TaskHandle> {
        self.cell
            .dependencies
            .iter()
            .find(|dep| {
                let state = dep.state();
                !state.did_succeed() && !state.did_fail()
            })
            .cloned()
    }

    /// The user task object, for hook dispatch.
    pub(crate) fn work(&self) -> &dyn Task {
        self.cell.work.as_ref()
    }

    /// A new waiter on this task's completion signal.
    #[must_use]
    pub fn completion_waiter(&self) -> CompletionWaiter {
        self.cell.completion.waiter()
    }

    /// Fire the completion signal.  Idempotent.
    pub(crate) fn signal_completion(&self) {
        self.cell.completion.signal();
    }

    /// Claim the exactly-once terminal protocol.  Returns `true` for the
    /// first caller only.
    pub(crate) fn claim_finalize(&self) -> bool {
        !self
            .cell
            .finalized
            .swap(true, std::sync::atomic::Ordering::SeqCst)
    }

    pub(crate) fn mark_started(&self) {
        let mut started = self.cell.started_at.lock().expect("timestamp lock");
        if started.is_none() {
            *started = Some(Utc::now());
        }
    }

    pub(crate) fn mark_completed(&self) {
        let mut completed = self.cell.completed_at.lock().expect("timestamp lock");
        if completed.is_none() {
            *completed = Some(Utc::now());
        }
    }

    /// A serializable point-in-time view of the task.
    #[must_use]
    pub fn snapshot(&self) -> TaskSnapshot {
        let priority = self.priority();
        TaskSnapshot {
            id: self.id(),
            rank: priority.rank(),
            band: priority.band(),
            qos: self.qos(),
            state: self.state(),
            created_at: self.cell.created_at,
            started_at: *self.cell.started_at.lock().expect("timestamp lock"),
            completed_at: *self.cell.completed_at.lock().expect("timestamp lock"),
        }
    }
}

impl PartialEq for TaskHandle {
    fn eq(&self, other: &Self) -> bool {
        self.cell.id == other.cell.id
    }
}

impl Eq for TaskHandle {}

impl Hash for TaskHandle {
    fn hash<H: Hasher>(&self, hasher: &mut H) {
        self.cell.id.hash(hasher);
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.cell.id)
            .field("priority", &self.priority())
            .field("qos", &self.cell.qos)
            .field("state", &self.state())
            .field("capabilities", &self.cell.caps)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Serializable metadata snapshot of a task, for external observers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub rank: u8,
    pub band: Option<Band>,
    pub qos: QualityOfService,
    pub state: TaskState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
