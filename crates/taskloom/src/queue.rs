//! The task queue runtime.
//!
//! [`TaskQueue`] owns a priority-sorted waiting list, a concurrency gate, and
//! the per-task lifecycle driver.  A background scheduling loop parked on a
//! [`Notify`] repeatedly picks the highest-ranked ready task, claims it, and
//! dispatches its lifecycle onto the worker pool under the task's
//! quality-of-service hint:
//!
//! ```text
//! beginning --> preparing --> configuring --> executing --> done(executing)
//!                     \-(any hook returns false)----------> failed(phase)
//! ```
//!
//! # Pick order
//!
//! The waiting list is kept sorted by a three-key comparator, applied stably:
//! higher priority first; on equal priority plain tasks before dependents;
//! among dependents, fewer incomplete dependencies first.  Ties preserve
//! insertion order.  Dependents whose dependencies have all signalled (the
//! "waited" set) outrank every fresh pick.
//!
//! # Views
//!
//! All view accessors return consistent snapshots that may be momentarily
//! stale; each underlying structure is guarded independently and the waiting
//! list is re-sorted before its guard is released.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use crossbeam::queue::SegQueue;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, broadcast};

use crate::completion::CompletionWaiter;
use crate::error::{QueueError, Result};
use crate::linked::LinkState;
use crate::pool::WorkerPool;
use crate::state::{Failure, Phase};
use crate::task::{QualityOfService, TaskHandle, TaskId};

/// Capacity of the state-transition event channel.
const EVENT_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// A task state transition, published on the queue's event stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    /// Name of the queue that drove the transition.
    pub queue: String,
    /// The task whose state changed.
    pub task_id: TaskId,
    /// The state after the transition.
    pub state: crate::state::TaskState,
    /// When the transition occurred.
    pub at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Core
// ---------------------------------------------------------------------------

pub(crate) enum PrepareOutcome {
    /// Dependencies resolved; proceed to configure/execute.
    Proceed,
    /// Parked in `current(waiting)`; the lifecycle will be re-dispatched
    /// once the waited set re-admits the task.
    Parked,
    /// A dependency failed; the task is already in a terminal failed state.
    Failed,
}

enum LifecycleEnd {
    Terminal,
    Parked,
}

pub(crate) struct QueueCore {
    pub(crate) name: String,
    pub(crate) max_simultaneous: usize,
    pub(crate) pool: WorkerPool,
    /// Every task this queue owns, keyed by id.  Tasks stay here after
    /// reaching a terminal state so the views can expose them.
    pub(crate) tasks: DashMap<TaskId, TaskHandle>,
    /// Priority-sorted pick list.
    waiting: Mutex<Vec<TaskHandle>>,
    /// Completion waiters for every non-terminal task, consumed by
    /// `wait`/`notify`.
    tracked: Mutex<HashMap<TaskId, CompletionWaiter>>,
    /// Tasks whose lifecycle is currently dispatched (occupying a slot).
    running_slots: AtomicUsize,
    active: AtomicBool,
    loop_started: AtomicBool,
    /// Wakes the scheduling loop: capacity freed, work added, queue started.
    pub(crate) get_next: Arc<Notify>,
    /// Dependents whose dependencies have all signalled, awaiting re-pick.
    pub(crate) waited: SegQueue<TaskId>,
    /// Running tasks abandoned by `cancel`; they transition to cancelled at
    /// natural exit.
    abandoned: Mutex<Vec<TaskId>>,
    events: broadcast::Sender<TaskEvent>,
    /// Present on linked queues only.
    pub(crate) link: OnceLock<LinkState>,
}

impl QueueCore {
    fn new(name: String, max_simultaneous: usize, pool: WorkerPool) -> Arc<Self> {
        let (events, _rx) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            name,
            max_simultaneous: max_simultaneous.max(1),
            pool,
            tasks: DashMap::new(),
            waiting: Mutex::new(Vec::new()),
            tracked: Mutex::new(HashMap::new()),
            running_slots: AtomicUsize::new(0),
            active: AtomicBool::new(false),
            loop_started: AtomicBool::new(false),
            get_next: Arc::new(Notify::new()),
            waited: SegQueue::new(),
            abandoned: Mutex::new(Vec::new()),
            events,
            link: OnceLock::new(),
        })
    }

    // -- Ordering -----------------------------------------------------------

    fn compare(a: &TaskHandle, b: &TaskHandle) -> std::cmp::Ordering {
        b.priority()
            .cmp(&a.priority())
            .then_with(|| a.capabilities().dependent.cmp(&b.capabilities().dependent))
            .then_with(|| {
                if a.capabilities().dependent && b.capabilities().dependent {
                    a.incomplete_dependencies()
                        .len()
                        .cmp(&b.incomplete_dependencies().len())
                } else {
                    std::cmp::Ordering::Equal
                }
            })
    }

    fn sort_waiting(waiting: &mut [TaskHandle]) {
        // Stable, so insertion order survives beyond the three keys.
        waiting.sort_by(Self::compare);
    }

    /// Re-apply the sort order, e.g. after a priority adjustment.
    pub(crate) fn resort(&self) {
        let mut waiting = self.waiting.lock().expect("waiting lock poisoned");
        Self::sort_waiting(&mut waiting);
    }

    // -- Admission ----------------------------------------------------------

    pub(crate) fn add(self: &Arc<Self>, task: TaskHandle) -> bool {
        let id = task.id();
        match self.tasks.entry(id) {
            Entry::Occupied(_) => {
                tracing::debug!(queue = %self.name, task_id = %id, "duplicate add ignored");
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(task.clone());
                self.tracked
                    .lock()
                    .expect("tracked lock poisoned")
                    .insert(id, task.completion_waiter());
                {
                    let mut waiting = self.waiting.lock().expect("waiting lock poisoned");
                    waiting.push(task.clone());
                    Self::sort_waiting(&mut waiting);
                }
                tracing::debug!(
                    queue = %self.name,
                    task_id = %id,
                    priority = %task.priority(),
                    "task added"
                );
                self.publish(&task);
                self.get_next.notify_one();
                true
            }
        }
    }

    /// Admit a dependency that was never `add`ed, so it shows up in the
    /// views and in the wait rendezvous.
    fn admit_dependency(&self, dependency: &TaskHandle) {
        if let Entry::Vacant(slot) = self.tasks.entry(dependency.id()) {
            slot.insert(dependency.clone());
        }
        self.tracked
            .lock()
            .expect("tracked lock poisoned")
            .entry(dependency.id())
            .or_insert_with(|| dependency.completion_waiter());
    }

    pub(crate) fn remove_from_waiting(&self, id: TaskId) {
        self.waiting
            .lock()
            .expect("waiting lock poisoned")
            .retain(|task| task.id() != id);
    }

    // -- Activation and the scheduling loop ---------------------------------

    pub(crate) fn start(self: &Arc<Self>) {
        if self.active.swap(true, Ordering::SeqCst) {
            return;
        }
        self.pool.resume();
        if !self.loop_started.swap(true, Ordering::SeqCst) {
            let weak = Arc::downgrade(self);
            let get_next = Arc::clone(&self.get_next);
            tokio::spawn(run_loop(weak, get_next));
        }
        tracing::info!(
            queue = %self.name,
            max_simultaneous = self.max_simultaneous,
            "queue started"
        );
        self.get_next.notify_one();
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub(crate) fn running_count(&self) -> usize {
        self.running_slots.load(Ordering::SeqCst)
    }

    /// Claim a pickable task: `ready` or `done(waiting)` flips to
    /// `current(beginning)` atomically, so a task can be started by exactly
    /// one path even when it sits in the waiting list while a dependent
    /// tries to start it inline.
    pub(crate) fn try_claim(&self, task: &TaskHandle) -> bool {
        task.update_state(|state| {
            if state.is_ready() || state.has_waited() {
                state.start_to(Phase::Beginning);
                true
            } else {
                false
            }
        })
    }

    fn next_task(&self) -> Option<TaskHandle> {
        // Waited dependents outrank every fresh pick.
        while let Some(id) = self.waited.pop() {
            if let Some(task) = self.tasks.get(&id).map(|entry| entry.value().clone()) {
                if self.try_claim(&task) {
                    tracing::trace!(queue = %self.name, task_id = %id, "picked waited task");
                    return Some(task);
                }
            }
        }
        let mut waiting = self.waiting.lock().expect("waiting lock poisoned");
        let position = waiting.iter().position(|task| self.try_claim(task))?;
        Some(waiting.remove(position))
    }

    /// Fill free slots.  Runs only on the scheduling loop, so the
    /// capacity check cannot over-dispatch.
    fn drain(self: &Arc<Self>) {
        while self.is_active() && self.running_count() < self.max_simultaneous {
            let Some(task) = self.next_task() else { return };
            self.dispatch(task);
        }
    }

    fn dispatch(self: &Arc<Self>, task: TaskHandle) {
        self.running_slots.fetch_add(1, Ordering::SeqCst);
        self.tracked
            .lock()
            .expect("tracked lock poisoned")
            .entry(task.id())
            .or_insert_with(|| task.completion_waiter());
        task.mark_started();
        tracing::debug!(queue = %self.name, task_id = %task.id(), qos = %task.qos(), "task dispatched");
        self.publish(&task);

        let core = Arc::clone(self);
        let qos = task.qos();
        self.pool.spawn(qos, async move {
            let _end = core.run_lifecycle(&task).await;
            core.running_slots.fetch_sub(1, Ordering::SeqCst);
            core.get_next.notify_one();
        });
    }

    // -- Per-task lifecycle -------------------------------------------------

    /// Boxed entry point, so a dependency's lifecycle can recurse through
    /// its dependent's prepare stage.
    fn lifecycle_boxed(self: &Arc<Self>, task: TaskHandle) -> BoxFuture<'static, ()> {
        let core = Arc::clone(self);
        Box::pin(async move {
            let _end = core.run_lifecycle(&task).await;
        })
    }

    async fn run_lifecycle(self: &Arc<Self>, task: &TaskHandle) -> LifecycleEnd {
        // Prepare.
        task.update_state(|state| state.start_to(Phase::Preparing));
        self.publish(task);
        if task.capabilities().dependent {
            match self.prepare(task).await {
                PrepareOutcome::Proceed => {}
                PrepareOutcome::Parked => return LifecycleEnd::Parked,
                PrepareOutcome::Failed => {
                    self.finalize(task).await;
                    return LifecycleEnd::Terminal;
                }
            }
        }
        task.update_state(|state| state.finish());
        self.publish(task);

        // Configure.
        if task.capabilities().configurable {
            task.update_state(|state| state.start_to(Phase::Configuring));
            self.publish(task);
            let configured = task
                .work()
                .as_configurable()
                .expect("advertised capability")
                .configure()
                .await;
            if !configured {
                task.update_state(|state| state.fail(Failure::Phase(Phase::Configuring)));
                self.finalize(task).await;
                return LifecycleEnd::Terminal;
            }
            task.update_state(|state| state.finish());
            self.publish(task);
        }

        // Execute.
        task.update_state(|state| state.start_to(Phase::Executing));
        self.publish(task);
        let succeeded = task.work().execute().await;

        // An abandoned task transitions to cancelled at natural exit.
        if self.take_abandoned(task.id()) {
            task.update_state(|state| {
                if state.is_executing() {
                    state.cancel();
                    state.finish();
                }
            });
        }

        self.conclude_execution(task, succeeded).await;
        self.finalize(task).await;
        LifecycleEnd::Terminal
    }

    /// Settle the execute outcome against any pause/cancel/resume delivery
    /// racing with it.  Only an executing (or settled-paused) task may be
    /// concluded; while a control request is mid-delivery we yield until it
    /// lands.
    async fn conclude_execution(&self, task: &TaskHandle, succeeded: bool) {
        loop {
            let concluded = task.update_state(|state| {
                if state.is_done() {
                    return true;
                }
                if state.is_paused() {
                    // Execute returned while flagged paused; walk the legal
                    // path back before concluding.
                    state.resume();
                    state.start_to(Phase::Executing);
                }
                if state.is_executing() {
                    if succeeded {
                        state.finish();
                    } else {
                        state.fail(Failure::Phase(Phase::Executing));
                    }
                    return true;
                }
                false
            });
            if concluded {
                return;
            }
            tokio::task::yield_now().await;
        }
    }

    /// Terminal protocol: release the tracked handle, fire the completion
    /// signal, run the post-terminal callback, wake the loop.  Exactly once
    /// per task.
    pub(crate) async fn finalize(self: &Arc<Self>, task: &TaskHandle) {
        if !task.claim_finalize() {
            return;
        }
        task.mark_completed();
        let state = task.state();
        debug_assert!(state.is_done());

        self.tracked
            .lock()
            .expect("tracked lock poisoned")
            .remove(&task.id());
        self.take_abandoned(task.id());
        self.publish(task);
        task.signal_completion();

        match state.failure() {
            Some(failure) => {
                tracing::warn!(queue = %self.name, task_id = %task.id(), ?failure, "task failed");
            }
            None if state.was_cancelled() => {
                tracing::info!(queue = %self.name, task_id = %task.id(), "task cancelled");
            }
            None => {
                tracing::info!(queue = %self.name, task_id = %task.id(), "task succeeded");
            }
        }

        task.work().finish().await;
        self.get_next.notify_one();
    }

    // -- Dependency resolution (local mode) ----------------------------------

    async fn prepare(self: &Arc<Self>, task: &TaskHandle) -> PrepareOutcome {
        if self.link.get().is_some() {
            self.prepare_linked(task).await
        } else {
            self.prepare_local(task).await
        }
    }

    /// Walk unfinished dependencies, starting each one inline (without
    /// consuming a queue slot) or awaiting an in-flight one, in dependency
    /// order.
    async fn prepare_local(self: &Arc<Self>, task: &TaskHandle) -> PrepareOutcome {
        for dependency in task.dependencies() {
            let dep_state = dependency.state();
            if dep_state.did_succeed() {
                continue;
            }
            if dep_state.did_fail() || dep_state.was_cancelled() {
                return self.fail_on_dependency(task, dependency);
            }

            task.update_state(|state| state.set_dependency(dependency.id()));
            self.publish(task);

            if self.try_claim(dependency) {
                self.remove_from_waiting(dependency.id());
                self.admit_dependency(dependency);
                dependency.mark_started();
                tracing::debug!(
                    queue = %self.name,
                    task_id = %task.id(),
                    dependency = %dependency.id(),
                    "starting dependency inline"
                );
                self.lifecycle_boxed(dependency.clone()).await;
            } else {
                tracing::trace!(
                    queue = %self.name,
                    task_id = %task.id(),
                    dependency = %dependency.id(),
                    "awaiting in-flight dependency"
                );
                dependency.completion_waiter().wait().await;
            }

            if dependency.state().did_succeed() {
                if let Some(dependent) = task.work().as_dependent() {
                    dependent.dependency_finished(dependency).await;
                }
            } else {
                return self.fail_on_dependency(task, dependency);
            }
        }
        task.update_state(|state| state.clear_dependency());
        PrepareOutcome::Proceed
    }

    pub(crate) fn fail_on_dependency(
        &self,
        task: &TaskHandle,
        dependency: &TaskHandle,
    ) -> PrepareOutcome {
        task.update_state(|state| {
            state.set_dependency(dependency.id());
            state.fail(Failure::Dependency(dependency.id()));
        });
        tracing::warn!(
            queue = %self.name,
            task_id = %task.id(),
            dependency = %dependency.id(),
            "dependency failed; failing dependent"
        );
        PrepareOutcome::Failed
    }

    // -- Pause / resume / cancel ---------------------------------------------

    fn executing_tasks(&self) -> Vec<TaskHandle> {
        self.tasks
            .iter()
            .filter(|entry| entry.value().state().is_executing())
            .map(|entry| entry.value().clone())
            .collect()
    }

    fn paused_tasks(&self) -> Vec<TaskHandle> {
        self.tasks
            .iter()
            .filter(|entry| entry.value().state().is_paused())
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub(crate) async fn pause(self: &Arc<Self>) {
        self.active.store(false, Ordering::SeqCst);
        self.pool.suspend();
        tracing::info!(queue = %self.name, "queue paused");

        for task in self.executing_tasks() {
            if !task.capabilities().pausable {
                // Keeps running to completion; no new tasks are drawn.
                continue;
            }
            let delivering = task.update_state(|state| {
                if state.is_executing() {
                    state.pause();
                    true
                } else {
                    false
                }
            });
            if !delivering {
                continue;
            }
            self.publish(&task);
            let paused = task
                .work()
                .as_pausable()
                .expect("advertised capability")
                .pause()
                .await;
            if paused {
                task.update_state(|state| {
                    if state.current_phase() == Some(Phase::Pausing) {
                        state.finish();
                    }
                });
                self.publish(&task);
                tracing::debug!(queue = %self.name, task_id = %task.id(), "task paused");
            } else {
                task.update_state(|state| state.fail(Failure::Phase(Phase::Pausing)));
                self.finalize(&task).await;
            }
        }
    }

    pub(crate) async fn resume(self: &Arc<Self>) {
        for task in self.paused_tasks() {
            let delivering = task.update_state(|state| {
                if state.is_paused() {
                    state.resume();
                    true
                } else {
                    false
                }
            });
            if !delivering {
                continue;
            }
            self.publish(&task);
            let resumed = task
                .work()
                .as_pausable()
                .expect("advertised capability")
                .resume()
                .await;
            if resumed {
                task.update_state(|state| {
                    if state.current_phase() == Some(Phase::Resuming) {
                        state.start_to(Phase::Executing);
                    }
                });
                self.publish(&task);
                tracing::debug!(queue = %self.name, task_id = %task.id(), "task resumed");
            } else {
                task.update_state(|state| state.fail(Failure::Phase(Phase::Resuming)));
                self.finalize(&task).await;
            }
        }

        self.active.store(true, Ordering::SeqCst);
        self.pool.resume();
        tracing::info!(queue = %self.name, "queue resumed");
        self.get_next.notify_one();
    }

    pub(crate) async fn cancel(self: &Arc<Self>, pause: bool) -> Vec<TaskHandle> {
        if pause {
            self.active.store(false, Ordering::SeqCst);
            self.pool.suspend();
            tracing::info!(queue = %self.name, "queue deactivated by cancel");
        }

        let mut cancelled = Vec::new();
        for task in self.executing_tasks() {
            if task.capabilities().cancellable {
                if self.cancel_one(&task).await {
                    cancelled.push(task);
                }
            } else {
                self.abandon(task.id());
                tracing::debug!(
                    queue = %self.name,
                    task_id = %task.id(),
                    "non-cancellable task abandoned"
                );
            }
        }
        cancelled
    }

    pub(crate) async fn cancel_one(self: &Arc<Self>, task: &TaskHandle) -> bool {
        let delivering = task.update_state(|state| {
            if state.is_executing() {
                state.cancel();
                true
            } else {
                false
            }
        });
        if !delivering {
            return false;
        }
        self.publish(task);
        let accepted = task
            .work()
            .as_cancellable()
            .expect("advertised capability")
            .cancel()
            .await;
        if accepted {
            task.update_state(|state| {
                if state.current_phase() == Some(Phase::Cancelling) {
                    state.finish();
                }
            });
            self.finalize(task).await;
            true
        } else {
            task.update_state(|state| state.fail(Failure::Phase(Phase::Cancelling)));
            self.finalize(task).await;
            false
        }
    }

    fn abandon(&self, id: TaskId) {
        let mut abandoned = self.abandoned.lock().expect("abandoned lock poisoned");
        if !abandoned.contains(&id) {
            abandoned.push(id);
        }
    }

    fn take_abandoned(&self, id: TaskId) -> bool {
        let mut abandoned = self.abandoned.lock().expect("abandoned lock poisoned");
        match abandoned.iter().position(|entry| *entry == id) {
            Some(position) => {
                abandoned.remove(position);
                true
            }
            None => false,
        }
    }

    // -- Rendezvous ----------------------------------------------------------

    fn tracked_waiters(&self) -> Vec<CompletionWaiter> {
        self.tracked
            .lock()
            .expect("tracked lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub(crate) async fn wait_all(&self) {
        let waiters = self.tracked_waiters();
        if waiters.is_empty() {
            return;
        }
        futures::future::join_all(waiters.iter().map(CompletionWaiter::wait)).await;
    }

    // -- Events ---------------------------------------------------------------

    pub(crate) fn publish(&self, task: &TaskHandle) {
        // No active subscribers is fine; the stream is best-effort.
        let _ = self.events.send(TaskEvent {
            queue: self.name.clone(),
            task_id: task.id(),
            state: task.state(),
            at: Utc::now(),
        });
    }
}

impl Drop for QueueCore {
    fn drop(&mut self) {
        // Wake the parked scheduling loop so it observes the dead core and
        // exits.
        self.get_next.notify_one();
    }
}

async fn run_loop(core: Weak<QueueCore>, get_next: Arc<Notify>) {
    loop {
        match core.upgrade() {
            Some(core) => core.drain(),
            None => return,
        }
        get_next.notified().await;
    }
}

// ---------------------------------------------------------------------------
// TaskQueue
// ---------------------------------------------------------------------------

/// A priority task queue with a concurrency cap.
///
/// Cheaply cloneable (`Arc`-backed) and `Send + Sync`; all clones drive the
/// same queue.  [`start`](Self::start) must be called from within a tokio
/// runtime — it spawns the scheduling loop onto it.
#[derive(Clone)]
pub struct TaskQueue {
    core: Arc<QueueCore>,
}

impl TaskQueue {
    /// Create a serial queue (`max_simultaneous = 1`).
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_capacity(name, 1)
    }

    /// Create a queue running up to `max_simultaneous` tasks at once
    /// (clamped to at least 1).
    #[must_use]
    pub fn with_capacity(name: impl Into<String>, max_simultaneous: usize) -> Self {
        Self {
            core: QueueCore::new(name.into(), max_simultaneous, WorkerPool::new()),
        }
    }

    /// Create a queue pre-loaded with `tasks`.
    #[must_use]
    pub fn with_tasks(
        name: impl Into<String>,
        max_simultaneous: usize,
        tasks: impl IntoIterator<Item = TaskHandle>,
    ) -> Self {
        let queue = Self::with_capacity(name, max_simultaneous);
        queue.add_all(tasks);
        queue
    }

    pub(crate) fn core(&self) -> &Arc<QueueCore> {
        &self.core
    }

    /// The queue's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// The concurrency cap.
    #[must_use]
    pub fn max_simultaneous(&self) -> usize {
        self.core.max_simultaneous
    }

    /// Whether the queue is drawing new tasks.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.core.is_active()
    }

    /// This queue's worker pool.
    #[must_use]
    pub fn pool(&self) -> &WorkerPool {
        &self.core.pool
    }

    // -- Admission -----------------------------------------------------------

    /// Insert a task into the waiting list, preserving the sort order.
    ///
    /// Idempotent on task id: returns `false` (and changes nothing) when the
    /// task was already added.
    pub fn add(&self, task: TaskHandle) -> bool {
        self.core.add(task)
    }

    /// Insert several tasks.
    pub fn add_all(&self, tasks: impl IntoIterator<Item = TaskHandle>) {
        for task in tasks {
            self.core.add(task);
        }
    }

    // -- Lifecycle -----------------------------------------------------------

    /// Mark the queue active and begin draining the waiting list up to the
    /// concurrency cap.  No-op when already active.
    pub fn start(&self) {
        self.core.start();
    }

    /// Suspend the queue: executing [`Pausable`](crate::Pausable) tasks are
    /// asked to pause (failures fail the task); other running tasks keep
    /// running to completion; no new tasks are drawn.
    pub async fn pause(&self) {
        self.core.pause().await;
    }

    /// Ask paused tasks to resume (failures fail the task), reactivate the
    /// queue, and resume drawing.
    pub async fn resume(&self) {
        self.core.resume().await;
    }

    /// Ask executing [`Cancellable`](crate::Cancellable) tasks to cancel;
    /// non-cancellable running tasks are abandoned and transition to
    /// cancelled at their natural exit.  Returns the tasks that cancelled
    /// cooperatively.  With `pause = true` the queue is also deactivated and
    /// needs [`start`](Self::start) to run again.
    pub async fn cancel(&self, pause: bool) -> Vec<TaskHandle> {
        self.core.cancel(pause).await
    }

    /// Cooperatively cancel a single executing task.
    ///
    /// # Errors
    ///
    /// [`QueueError::TaskNotFound`] when the id is unknown to this queue;
    /// [`QueueError::InvalidTaskState`] when the task does not advertise
    /// [`Cancellable`](crate::Cancellable) or is not currently executing.
    pub async fn cancel_task(&self, id: TaskId) -> Result<TaskHandle> {
        let task = self
            .core
            .tasks
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(QueueError::TaskNotFound { task_id: id })?;
        if !task.capabilities().cancellable {
            return Err(QueueError::InvalidTaskState {
                task_id: id,
                reason: "task is not cancellable".into(),
            });
        }
        if !task.state().is_executing() {
            return Err(QueueError::InvalidTaskState {
                task_id: id,
                reason: format!("cannot cancel task in state {:?}", task.state()),
            });
        }
        self.core.cancel_one(&task).await;
        Ok(task)
    }

    // -- Rendezvous ----------------------------------------------------------

    /// Block until every currently tracked completion handle signals.
    pub async fn wait(&self) {
        self.core.wait_all().await;
    }

    /// Like [`wait`](Self::wait), bounded by `timeout`.  Returns `true`
    /// when everything completed in time.
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait()).await.is_ok()
    }

    /// Like [`wait`](Self::wait), bounded by a wall-clock `deadline`.
    pub async fn wait_deadline(&self, deadline: SystemTime) -> bool {
        let timeout = deadline
            .duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO);
        self.wait_timeout(timeout).await
    }

    /// Schedule `work` on this queue's pool once every currently tracked
    /// task has completed.
    pub fn notify<F>(&self, qos: QualityOfService, work: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.notify_on(&self.core.pool, qos, work);
    }

    /// Schedule `work` on the supplied pool once every currently tracked
    /// task has completed.
    pub fn notify_on<F>(&self, pool: &WorkerPool, qos: QualityOfService, work: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let waiters = self.core.tracked_waiters();
        pool.spawn(qos, async move {
            futures::future::join_all(waiters.iter().map(CompletionWaiter::wait)).await;
            work();
        });
    }

    /// Subscribe to this queue's state-transition events.
    ///
    /// Events published before this call are not replayed.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.core.events.subscribe()
    }

    // -- Views ---------------------------------------------------------------

    fn collect(&self, keep: impl Fn(&TaskHandle) -> bool) -> Vec<TaskHandle> {
        self.core
            .tasks
            .iter()
            .filter(|entry| keep(entry.value()))
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Snapshot of the waiting list, in pick order.
    #[must_use]
    pub fn waiting(&self) -> Vec<TaskHandle> {
        self.core.waiting.lock().expect("waiting lock poisoned").clone()
    }

    /// Tasks with a lifecycle phase in flight (excluding parked dependents).
    #[must_use]
    pub fn running(&self) -> Vec<TaskHandle> {
        self.collect(|task| {
            task.state()
                .current_phase()
                .is_some_and(|phase| phase != Phase::Waiting)
        })
    }

    /// Tasks in a failed terminal state.
    #[must_use]
    pub fn failed(&self) -> Vec<TaskHandle> {
        self.collect(|task| task.state().did_fail())
    }

    /// Tasks that executed to completion.
    #[must_use]
    pub fn succeeded(&self) -> Vec<TaskHandle> {
        self.collect(|task| task.state().did_succeed())
    }

    /// Tasks paused and awaiting resume.
    #[must_use]
    pub fn paused(&self) -> Vec<TaskHandle> {
        self.collect(|task| task.state().is_paused())
    }

    /// Tasks cancelled cooperatively or after abandonment.
    #[must_use]
    pub fn cancelled(&self) -> Vec<TaskHandle> {
        self.collect(|task| task.state().was_cancelled())
    }

    /// Every owned task not yet in a terminal state.
    #[must_use]
    pub fn remaining(&self) -> Vec<TaskHandle> {
        self.collect(|task| !task.state().is_done())
    }

    /// Whether every owned task has reached a terminal state.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.core
            .tasks
            .iter()
            .all(|entry| entry.value().state().is_done())
    }

    /// Total number of tasks this queue owns, terminal ones included.
    #[must_use]
    pub fn count(&self) -> usize {
        self.core.tasks.len()
    }

    /// Number of lifecycles currently occupying a slot.
    #[must_use]
    pub fn running_count(&self) -> usize {
        self.core.running_count()
    }

    /// Look up a task by id.
    #[must_use]
    pub fn task(&self, id: TaskId) -> Option<TaskHandle> {
        self.core.tasks.get(&id).map(|entry| entry.value().clone())
    }

    /// Serializable snapshots of every owned task, keyed by id.
    #[must_use]
    pub fn snapshots(&self) -> HashMap<TaskId, crate::task::TaskSnapshot> {
        self.core
            .tasks
            .iter()
            .map(|entry| (*entry.key(), entry.value().snapshot()))
            .collect()
    }

    /// Number of active event-stream subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.core.events.receiver_count()
    }
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("name", &self.core.name)
            .field("max_simultaneous", &self.core.max_simultaneous)
            .field("active", &self.is_active())
            .field("count", &self.count())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::priority::{Band, Priority};
    use crate::task::{Cancellable, Configurable, Dependent, Pausable, Task};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;

    type Log = Arc<Mutex<Vec<&'static str>>>;

    fn new_log() -> Log {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn logged(log: &Log) -> Vec<&'static str> {
        log.lock().unwrap().clone()
    }

    /// Plain task that records its execution and returns a fixed outcome.
    struct Probe {
        name: &'static str,
        priority: Priority,
        succeed: bool,
        log: Log,
    }

    impl Probe {
        fn new(name: &'static str, band: Band, log: &Log) -> Self {
            Self {
                name,
                priority: Priority::from_band(band),
                succeed: true,
                log: Arc::clone(log),
            }
        }

        fn failing(name: &'static str, band: Band, log: &Log) -> Self {
            Self {
                succeed: false,
                ..Self::new(name, band, log)
            }
        }
    }

    #[async_trait]
    impl Task for Probe {
        fn priority(&self) -> Priority {
            self.priority
        }

        async fn execute(&self) -> bool {
            self.log.lock().unwrap().push(self.name);
            self.succeed
        }
    }

    /// Configurable + Dependent task recording its configure call and the
    /// per-dependency finish callbacks.
    struct Chained {
        name: &'static str,
        priority: Priority,
        deps: Vec<TaskHandle>,
        log: Log,
        configured: Arc<AtomicBool>,
        finished_deps: Arc<Mutex<Vec<TaskId>>>,
    }

    impl Chained {
        fn new(name: &'static str, band: Band, deps: Vec<TaskHandle>, log: &Log) -> Self {
            Self {
                name,
                priority: Priority::from_band(band),
                deps,
                log: Arc::clone(log),
                configured: Arc::new(AtomicBool::new(false)),
                finished_deps: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    #[async_trait]
    impl Task for Chained {
        fn priority(&self) -> Priority {
            self.priority
        }

        async fn execute(&self) -> bool {
            self.log.lock().unwrap().push(self.name);
            true
        }

        fn as_configurable(&self) -> Option<&dyn Configurable> {
            Some(self)
        }

        fn as_dependent(&self) -> Option<&dyn Dependent> {
            Some(self)
        }
    }

    #[async_trait]
    impl Configurable for Chained {
        async fn configure(&self) -> bool {
            self.configured.store(true, Ordering::SeqCst);
            true
        }
    }

    #[async_trait]
    impl Dependent for Chained {
        fn dependencies(&self) -> Vec<TaskHandle> {
            self.deps.clone()
        }

        async fn dependency_finished(&self, dependency: &TaskHandle) {
            self.finished_deps.lock().unwrap().push(dependency.id());
        }
    }

    /// Cooperative task: spins until released, honouring pause and cancel
    /// requests through shared flags.
    #[derive(Default)]
    struct SpinFlags {
        entered: AtomicBool,
        paused: AtomicBool,
        release: AtomicBool,
        cancelled: AtomicBool,
    }

    struct Spin {
        flags: Arc<SpinFlags>,
        pausable: bool,
        cancellable: bool,
    }

    impl Spin {
        fn new(flags: &Arc<SpinFlags>, pausable: bool, cancellable: bool) -> Self {
            Self {
                flags: Arc::clone(flags),
                pausable,
                cancellable,
            }
        }
    }

    #[async_trait]
    impl Task for Spin {
        async fn execute(&self) -> bool {
            self.flags.entered.store(true, Ordering::SeqCst);
            loop {
                if self.flags.cancelled.load(Ordering::SeqCst) {
                    return false;
                }
                if self.flags.release.load(Ordering::SeqCst)
                    && !self.flags.paused.load(Ordering::SeqCst)
                {
                    return true;
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        }

        fn as_pausable(&self) -> Option<&dyn Pausable> {
            if self.pausable { Some(self) } else { None }
        }

        fn as_cancellable(&self) -> Option<&dyn Cancellable> {
            if self.cancellable { Some(self) } else { None }
        }
    }

    #[async_trait]
    impl Pausable for Spin {
        async fn pause(&self) -> bool {
            self.flags.paused.store(true, Ordering::SeqCst);
            true
        }

        async fn resume(&self) -> bool {
            self.flags.paused.store(false, Ordering::SeqCst);
            true
        }
    }

    #[async_trait]
    impl Cancellable for Spin {
        async fn cancel(&self) -> bool {
            self.flags.cancelled.store(true, Ordering::SeqCst);
            true
        }
    }

    /// Pausable spinner whose control hooks can be made to refuse.
    struct Defiant {
        flags: Arc<SpinFlags>,
        refuse_pause: bool,
        refuse_resume: bool,
    }

    #[async_trait]
    impl Task for Defiant {
        async fn execute(&self) -> bool {
            self.flags.entered.store(true, Ordering::SeqCst);
            loop {
                if self.flags.release.load(Ordering::SeqCst)
                    && !self.flags.paused.load(Ordering::SeqCst)
                {
                    return true;
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        }

        fn as_pausable(&self) -> Option<&dyn Pausable> {
            Some(self)
        }
    }

    #[async_trait]
    impl Pausable for Defiant {
        async fn pause(&self) -> bool {
            if self.refuse_pause {
                return false;
            }
            self.flags.paused.store(true, Ordering::SeqCst);
            true
        }

        async fn resume(&self) -> bool {
            if self.refuse_resume {
                return false;
            }
            self.flags.paused.store(false, Ordering::SeqCst);
            true
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("condition not reached within deadline");
    }

    // -- End-to-end scenarios ------------------------------------------------

    #[tokio::test]
    async fn fifo_within_a_band() {
        let log = new_log();
        let queue = TaskQueue::new("serial");
        queue.add(TaskHandle::new(Probe::new("a", Band::Medium, &log)));
        queue.add(TaskHandle::new(Probe::new("b", Band::Medium, &log)));
        queue.add(TaskHandle::new(Probe::new("c", Band::Medium, &log)));

        queue.start();
        queue.start(); // no-op on an active queue
        queue.wait().await;

        assert_eq!(logged(&log), vec!["a", "b", "c"]);
        assert_eq!(queue.succeeded().len(), 3);
        assert!(queue.is_done());
        assert!(queue.failed().is_empty());
    }

    #[tokio::test]
    async fn priority_preempts_pick() {
        let log = new_log();
        let queue = TaskQueue::new("ranked");
        queue.add(TaskHandle::new(Probe::new("low", Band::Low, &log)));
        queue.add(TaskHandle::new(Probe::new("critical", Band::Critical, &log)));

        queue.start();
        queue.wait().await;

        assert_eq!(logged(&log), vec!["critical", "low"]);
    }

    #[tokio::test]
    async fn local_dependency_chain() {
        let log = new_log();
        let x = TaskHandle::new(Probe::new("x", Band::Medium, &log));
        let y = TaskHandle::new(Probe::new("y", Band::Medium, &log));
        let chained = Chained::new("d", Band::Medium, vec![x.clone(), y.clone()], &log);
        let configured = Arc::clone(&chained.configured);
        let finished_deps = Arc::clone(&chained.finished_deps);
        let dependent = TaskHandle::new(chained);

        let queue = TaskQueue::with_capacity("deps", 2);
        queue.add(dependent.clone());
        queue.start();
        queue.wait().await;

        // Dependencies run inside the dependent's own lifecycle, in order.
        assert_eq!(logged(&log), vec!["x", "y", "d"]);
        assert!(x.state().did_succeed());
        assert!(y.state().did_succeed());
        assert!(dependent.state().did_succeed());
        assert!(configured.load(Ordering::SeqCst));
        assert_eq!(*finished_deps.lock().unwrap(), vec![x.id(), y.id()]);
        // The inline dependencies were admitted into the queue's views.
        assert_eq!(queue.count(), 3);
        assert_eq!(queue.succeeded().len(), 3);
    }

    #[tokio::test]
    async fn dependency_failure_fails_dependent() {
        let log = new_log();
        let x = TaskHandle::new(Probe::failing("x", Band::Medium, &log));
        let chained = Chained::new("d", Band::Medium, vec![x.clone()], &log);
        let configured = Arc::clone(&chained.configured);
        let dependent = TaskHandle::new(chained);

        let queue = TaskQueue::new("doomed");
        queue.add(x.clone());
        queue.add(dependent.clone());
        queue.start();
        queue.wait().await;

        assert_eq!(
            x.state().failure(),
            Some(Failure::Phase(Phase::Executing)),
            "the dependency itself fails in execute"
        );
        assert_eq!(
            dependent.state().failure(),
            Some(Failure::Dependency(x.id())),
            "the dependent fails without ever executing"
        );
        assert_eq!(logged(&log), vec!["x"]);
        assert!(!configured.load(Ordering::SeqCst));
        assert_eq!(queue.failed().len(), 2);
    }

    #[tokio::test]
    async fn pause_and_resume_round_trip() {
        let flags = Arc::new(SpinFlags::default());
        let handle = TaskHandle::new(Spin::new(&flags, true, false));

        let queue = TaskQueue::new("pausable");
        queue.add(handle.clone());
        queue.start();
        wait_until(|| flags.entered.load(Ordering::SeqCst)).await;
        assert!(handle.state().is_executing());

        queue.pause().await;
        assert!(handle.state().is_paused());
        assert!(!queue.is_active());
        assert_eq!(queue.paused().len(), 1);

        // Releasing the task while paused must not let it finish.
        flags.release.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!handle.state().is_done());

        queue.resume().await;
        queue.wait().await;
        assert!(handle.state().did_succeed());
        assert!(queue.is_done());
    }

    #[tokio::test]
    async fn cooperative_cancel() {
        let flags = Arc::new(SpinFlags::default());
        let handle = TaskHandle::new(Spin::new(&flags, false, true));

        let queue = TaskQueue::new("cancellable");
        queue.add(handle.clone());
        queue.start();
        wait_until(|| flags.entered.load(Ordering::SeqCst)).await;

        let cancelled = queue.cancel(false).await;
        assert_eq!(cancelled.len(), 1);
        assert_eq!(cancelled[0], handle);
        assert!(handle.state().was_cancelled());

        queue.wait().await;
        assert_eq!(queue.cancelled().len(), 1);
        assert!(queue.is_active(), "cancel without pause keeps the queue active");
    }

    #[tokio::test]
    async fn cancel_abandons_non_cancellable_tasks() {
        let flags = Arc::new(SpinFlags::default());
        let handle = TaskHandle::new(Spin::new(&flags, false, false));

        let queue = TaskQueue::new("stubborn");
        queue.add(handle.clone());
        queue.start();
        wait_until(|| flags.entered.load(Ordering::SeqCst)).await;

        let cancelled = queue.cancel(false).await;
        assert!(cancelled.is_empty());
        // Abandoned, but still running until its natural exit.
        assert!(handle.state().is_executing());
        assert_eq!(queue.running().len(), 1);

        flags.release.store(true, Ordering::SeqCst);
        queue.wait().await;
        assert!(handle.state().was_cancelled());
        assert!(queue.succeeded().is_empty());
    }

    #[tokio::test]
    async fn cancel_with_pause_deactivates_queue() {
        let log = new_log();
        let flags = Arc::new(SpinFlags::default());
        let spinner = TaskHandle::new(Spin::new(&flags, false, true));
        let follower = TaskHandle::new(Probe::new("later", Band::Medium, &log));

        let queue = TaskQueue::new("halting");
        queue.add(spinner.clone());
        queue.add(follower.clone());
        queue.start();
        wait_until(|| flags.entered.load(Ordering::SeqCst)).await;

        let cancelled = queue.cancel(true).await;
        assert_eq!(cancelled.len(), 1);
        assert!(!queue.is_active());

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(logged(&log).is_empty(), "no new tasks drawn while deactivated");
        assert!(follower.state().is_ready());

        queue.start();
        queue.wait().await;
        assert_eq!(logged(&log), vec!["later"]);
        assert!(follower.state().did_succeed());
    }

    // -- Invariants ----------------------------------------------------------

    /// Task that tracks how many lifecycles overlap.
    struct Gauge {
        current: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Task for Gauge {
        async fn execute(&self) -> bool {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            true
        }
    }

    #[tokio::test]
    async fn concurrency_cap_is_respected() {
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let queue = TaskQueue::with_capacity("capped", 2);
        for _ in 0..6 {
            queue.add(TaskHandle::new(Gauge {
                current: Arc::clone(&current),
                peak: Arc::clone(&peak),
            }));
        }
        queue.start();
        queue.wait().await;

        assert_eq!(queue.succeeded().len(), 6);
        assert!(
            peak.load(Ordering::SeqCst) <= 2,
            "peak concurrency {} exceeded the cap",
            peak.load(Ordering::SeqCst)
        );
    }

    #[tokio::test]
    async fn add_is_idempotent_on_task_id() {
        let log = new_log();
        let handle = TaskHandle::new(Probe::new("once", Band::Medium, &log));

        let queue = TaskQueue::new("dedup");
        assert!(queue.add(handle.clone()));
        assert!(!queue.add(handle.clone()));
        assert_eq!(queue.waiting().len(), 1);
        assert_eq!(queue.count(), 1);
    }

    #[tokio::test]
    async fn waiting_list_sort_order() {
        let log = new_log();
        let dep_a = TaskHandle::new(Probe::new("da", Band::Medium, &log));
        let dep_b = TaskHandle::new(Probe::new("db", Band::Medium, &log));

        let plain_one = TaskHandle::new(Probe::new("p1", Band::Medium, &log));
        let two_deps = TaskHandle::new(Chained::new(
            "d2",
            Band::Medium,
            vec![dep_a.clone(), dep_b.clone()],
            &log,
        ));
        let critical = TaskHandle::new(Probe::new("c", Band::Critical, &log));
        let one_dep = TaskHandle::new(Chained::new("d1", Band::Medium, vec![dep_a], &log));
        let plain_two = TaskHandle::new(Probe::new("p2", Band::Medium, &log));

        let queue = TaskQueue::new("sorted");
        queue.add(plain_one.clone());
        queue.add(two_deps.clone());
        queue.add(critical.clone());
        queue.add(one_dep.clone());
        queue.add(plain_two.clone());

        let order: Vec<TaskId> = queue.waiting().iter().map(TaskHandle::id).collect();
        assert_eq!(
            order,
            vec![
                critical.id(),  // highest band first
                plain_one.id(), // plain before dependent, insertion order kept
                plain_two.id(),
                one_dep.id(), // fewer incomplete dependencies first
                two_deps.id(),
            ]
        );
    }

    #[tokio::test]
    async fn configure_failure_skips_execute() {
        struct BadConfig {
            log: Log,
        }

        #[async_trait]
        impl Task for BadConfig {
            async fn execute(&self) -> bool {
                self.log.lock().unwrap().push("executed");
                true
            }

            fn as_configurable(&self) -> Option<&dyn Configurable> {
                Some(self)
            }
        }

        #[async_trait]
        impl Configurable for BadConfig {
            async fn configure(&self) -> bool {
                false
            }
        }

        let log = new_log();
        let handle = TaskHandle::new(BadConfig {
            log: Arc::clone(&log),
        });

        let queue = TaskQueue::new("misconfigured");
        queue.add(handle.clone());
        queue.start();
        queue.wait().await;

        assert_eq!(
            handle.state().failure(),
            Some(Failure::Phase(Phase::Configuring))
        );
        assert!(logged(&log).is_empty());
    }

    #[tokio::test]
    async fn finish_callback_runs_once_after_terminal_state() {
        struct Finishing {
            finishes: Arc<AtomicUsize>,
        }

        #[async_trait]
        impl Task for Finishing {
            async fn execute(&self) -> bool {
                true
            }

            async fn finish(&self) {
                self.finishes.fetch_add(1, Ordering::SeqCst);
            }
        }

        let finishes = Arc::new(AtomicUsize::new(0));
        let queue = TaskQueue::new("finishing");
        queue.add(TaskHandle::new(Finishing {
            finishes: Arc::clone(&finishes),
        }));
        queue.start();
        queue.wait().await;

        wait_until(|| finishes.load(Ordering::SeqCst) == 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(finishes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn wait_timeout_reports_incomplete_work() {
        struct Slow;

        #[async_trait]
        impl Task for Slow {
            async fn execute(&self) -> bool {
                tokio::time::sleep(Duration::from_millis(150)).await;
                true
            }
        }

        let queue = TaskQueue::new("slow");
        queue.add(TaskHandle::new(Slow));
        queue.start();

        assert!(!queue.wait_timeout(Duration::from_millis(20)).await);
        queue.wait().await;
        assert!(queue.is_done());
        assert!(queue.wait_timeout(Duration::from_millis(20)).await);
    }

    #[tokio::test]
    async fn notify_runs_after_tracked_tasks_complete() {
        let log = new_log();
        let done = Arc::new(AtomicBool::new(false));
        let observed = Arc::clone(&done);

        let queue = TaskQueue::new("notified");
        queue.add(TaskHandle::new(Probe::new("work", Band::Medium, &log)));
        queue.notify(QualityOfService::Default, move || {
            observed.store(true, Ordering::SeqCst);
        });
        queue.start();
        queue.wait().await;

        wait_until(|| done.load(Ordering::SeqCst)).await;
        assert_eq!(logged(&log), vec!["work"]);
    }

    #[tokio::test]
    async fn event_stream_reports_transitions() {
        let log = new_log();
        let queue = TaskQueue::new("observed");
        let mut events = queue.subscribe();

        let handle = TaskHandle::new(Probe::new("seen", Band::Medium, &log));
        queue.add(handle.clone());
        queue.start();
        queue.wait().await;

        let mut states = Vec::new();
        while let Ok(event) = events.try_recv() {
            assert_eq!(event.queue, "observed");
            assert_eq!(event.task_id, handle.id());
            states.push(event.state);
        }
        assert!(states.first().is_some_and(|state| state.is_ready()));
        assert!(states.iter().any(|state| state.did_succeed()));
    }

    #[tokio::test]
    async fn cancel_task_rejects_bad_targets() {
        let log = new_log();
        let queue = TaskQueue::new("strict");

        let missing = uuid::Uuid::new_v4();
        assert!(matches!(
            queue.cancel_task(missing).await,
            Err(QueueError::TaskNotFound { task_id }) if task_id == missing
        ));

        let plain = TaskHandle::new(Probe::new("plain", Band::Medium, &log));
        queue.add(plain.clone());
        assert!(matches!(
            queue.cancel_task(plain.id()).await,
            Err(QueueError::InvalidTaskState { .. })
        ));
    }

    #[tokio::test]
    async fn cancel_task_cancels_one_executing_task() {
        let flags = Arc::new(SpinFlags::default());
        let handle = TaskHandle::new(Spin::new(&flags, false, true));

        let queue = TaskQueue::new("surgical");
        queue.add(handle.clone());
        queue.start();
        wait_until(|| flags.entered.load(Ordering::SeqCst)).await;

        let cancelled = queue.cancel_task(handle.id()).await.expect("cancellable");
        assert_eq!(cancelled, handle);
        queue.wait().await;
        assert!(handle.state().was_cancelled());
    }

    #[tokio::test]
    async fn with_tasks_preloads_the_waiting_list() {
        let log = new_log();
        let queue = TaskQueue::with_tasks(
            "preloaded",
            2,
            vec![
                TaskHandle::new(Probe::new("a", Band::Medium, &log)),
                TaskHandle::new(Probe::new("b", Band::Low, &log)),
            ],
        );
        assert_eq!(queue.waiting().len(), 2);
        assert_eq!(queue.count(), 2);
        assert!(!queue.is_active());

        queue.start();
        queue.wait().await;
        assert!(queue.is_done());
    }

    #[tokio::test]
    async fn refused_pause_fails_the_task() {
        let flags = Arc::new(SpinFlags::default());
        let handle = TaskHandle::new(Defiant {
            flags: Arc::clone(&flags),
            refuse_pause: true,
            refuse_resume: false,
        });

        let queue = TaskQueue::new("unpausable");
        queue.add(handle.clone());
        queue.start();
        wait_until(|| flags.entered.load(Ordering::SeqCst)).await;

        queue.pause().await;
        assert_eq!(
            handle.state().failure(),
            Some(Failure::Phase(Phase::Pausing))
        );
        queue.wait().await;
        assert_eq!(queue.failed().len(), 1);

        // Let the spinner exit; the terminal state must not change.
        flags.release.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(handle.state().did_fail());
    }

    #[tokio::test]
    async fn refused_resume_fails_the_task() {
        let flags = Arc::new(SpinFlags::default());
        let handle = TaskHandle::new(Defiant {
            flags: Arc::clone(&flags),
            refuse_pause: false,
            refuse_resume: true,
        });

        let queue = TaskQueue::new("unresumable");
        queue.add(handle.clone());
        queue.start();
        wait_until(|| flags.entered.load(Ordering::SeqCst)).await;

        queue.pause().await;
        assert!(handle.state().is_paused());

        queue.resume().await;
        assert_eq!(
            handle.state().failure(),
            Some(Failure::Phase(Phase::Resuming))
        );
        queue.wait().await;

        // Unstick the leaked execute loop.
        flags.release.store(true, Ordering::SeqCst);
        flags.paused.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(handle.state().did_fail());
    }

    #[tokio::test]
    async fn nested_dependency_chain_terminates() {
        let log = new_log();
        let a = TaskHandle::new(Probe::new("a", Band::Medium, &log));
        let b = TaskHandle::new(Chained::new("b", Band::Medium, vec![a.clone()], &log));
        let c = TaskHandle::new(Chained::new("c", Band::Medium, vec![b.clone()], &log));

        let queue = TaskQueue::new("nested");
        queue.add(c.clone());
        queue.start();
        queue.wait().await;

        assert_eq!(logged(&log), vec!["a", "b", "c"]);
        assert!(a.state().did_succeed());
        assert!(b.state().did_succeed());
        assert!(c.state().did_succeed());
        assert_eq!(queue.count(), 3);
        assert!(queue.is_done());
    }

    #[tokio::test]
    async fn wait_deadline_uses_wall_clock() {
        struct Slow;

        #[async_trait]
        impl Task for Slow {
            async fn execute(&self) -> bool {
                tokio::time::sleep(Duration::from_millis(150)).await;
                true
            }
        }

        let queue = TaskQueue::new("deadlined");
        queue.add(TaskHandle::new(Slow));
        queue.start();

        let soon = SystemTime::now() + Duration::from_millis(20);
        assert!(!queue.wait_deadline(soon).await);

        let later = SystemTime::now() + Duration::from_secs(5);
        assert!(queue.wait_deadline(later).await);
        assert!(queue.is_done());
    }

    #[tokio::test]
    async fn notify_on_an_external_pool() {
        let log = new_log();
        let done = Arc::new(AtomicBool::new(false));
        let observed = Arc::clone(&done);

        let queue = TaskQueue::new("externally-notified");
        let pool = WorkerPool::new();
        queue.add(TaskHandle::new(Probe::new("work", Band::Medium, &log)));
        queue.notify_on(&pool, QualityOfService::Utility, move || {
            observed.store(true, Ordering::SeqCst);
        });

        queue.start();
        queue.wait().await;
        wait_until(|| done.load(Ordering::SeqCst)).await;
    }

    #[tokio::test]
    async fn snapshots_capture_every_owned_task() {
        let log = new_log();
        let succeeding = TaskHandle::new(Probe::new("ok", Band::High, &log));
        let failing = TaskHandle::new(Probe::failing("bad", Band::Low, &log));

        let queue = TaskQueue::with_capacity("snapshotted", 2);
        queue.add(succeeding.clone());
        queue.add(failing.clone());
        queue.start();
        queue.wait().await;

        let snapshots = queue.snapshots();
        assert_eq!(snapshots.len(), 2);
        assert!(snapshots[&succeeding.id()].state.did_succeed());
        assert!(snapshots[&failing.id()].state.did_fail());
        assert_eq!(snapshots[&succeeding.id()].band, Some(Band::High));
        assert!(snapshots[&succeeding.id()].completed_at.is_some());
    }

    #[tokio::test]
    async fn task_events_serialize() {
        let log = new_log();
        let queue = TaskQueue::new("wired");
        let mut events = queue.subscribe();

        queue.add(TaskHandle::new(Probe::new("payload", Band::Medium, &log)));
        queue.start();
        queue.wait().await;

        let event = events.recv().await.expect("at least the add event");
        let json = serde_json::to_string(&event).unwrap();
        let back: TaskEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.task_id, event.task_id);
        assert_eq!(back.queue, "wired");
        assert_eq!(back.state, event.state);
    }
}
