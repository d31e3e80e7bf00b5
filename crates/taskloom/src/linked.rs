//! Linked queues and federation.
//!
//! A [`LinkedTaskQueue`] resolves dependencies that may live in *other*
//! queues it is linked to.  Links are symmetric and idempotent: after
//! `a.link(&b)`, each queue's [`Federation`] contains the other.  A
//! dependent task in a linked queue never starts its own dependencies —
//! they are assumed to be enqueued somewhere in the federation — and
//! instead parks in `current(waiting)` on their completion signals.  Once
//! every dependency signals, the task flips to `done(waiting)` and outranks
//! every plain `ready` task at the next pick.
//!
//! A dependency that cannot be found in the owning queue or any peer is
//! unrecoverable: the dependent could never make progress, so the runtime
//! treats it as fatal and panics at the point of discovery.

use std::ops::{BitOr, BitOrAssign, Deref};
use std::sync::{Arc, Mutex, Weak};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::queue::{PrepareOutcome, QueueCore, TaskQueue};
use crate::state::Phase;
use crate::task::{TaskHandle, TaskId};

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Priority-adjustment options applied while resolving a dependent task's
/// dependencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DependencyOptions(u8);

impl DependencyOptions {
    /// No adjustments.
    pub const NONE: Self = Self(0);
    /// Bump each incomplete dependency one band up.
    pub const INCREASE_DEPENDENCY_PRIORITY: Self = Self(1);
    /// Drop the dependent one band down, once per incomplete dependency.
    pub const DECREASE_DEPENDENT_PRIORITY: Self = Self(1 << 1);

    /// Whether every flag in `options` is set.
    #[must_use]
    pub const fn contains(self, options: Self) -> bool {
        self.0 & options.0 == options.0
    }

    /// Whether no flag is set.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for DependencyOptions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for DependencyOptions {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

// ---------------------------------------------------------------------------
// Federation
// ---------------------------------------------------------------------------

/// The symmetric set of peer queues a linked queue tracks.
///
/// Peers are held weakly: a dropped queue falls out of the federation
/// instead of being kept alive by its former peers.
pub struct Federation {
    peers: Mutex<Vec<Weak<QueueCore>>>,
}

impl Federation {
    pub(crate) fn new() -> Self {
        Self {
            peers: Mutex::new(Vec::new()),
        }
    }

    /// Add a peer.  Returns `false` when it was already a member.
    pub(crate) fn insert(&self, peer: &Arc<QueueCore>) -> bool {
        let mut peers = self.peers.lock().expect("federation lock poisoned");
        peers.retain(|member| member.strong_count() > 0);
        let present = peers
            .iter()
            .any(|member| member.upgrade().is_some_and(|core| Arc::ptr_eq(&core, peer)));
        if present {
            return false;
        }
        peers.push(Arc::downgrade(peer));
        true
    }

    fn live_peers(&self) -> Vec<Arc<QueueCore>> {
        self.peers
            .lock()
            .expect("federation lock poisoned")
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// The peer owning the given task, if any.
    pub(crate) fn find_owner(&self, id: TaskId) -> Option<Arc<QueueCore>> {
        self.live_peers()
            .into_iter()
            .find(|core| core.tasks.contains_key(&id))
    }

    /// Whether `peer` is a member.
    #[must_use]
    pub fn contains(&self, peer: &LinkedTaskQueue) -> bool {
        let target = peer.queue.core();
        self.live_peers()
            .iter()
            .any(|core| Arc::ptr_eq(core, target))
    }

    /// Number of live peers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.live_peers().len()
    }

    /// Whether the federation has no live peers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Names of the live peers.
    #[must_use]
    pub fn peer_names(&self) -> Vec<String> {
        self.live_peers()
            .iter()
            .map(|core| core.name.clone())
            .collect()
    }
}

impl std::fmt::Debug for Federation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Federation")
            .field("peers", &self.peer_names())
            .finish()
    }
}

/// Per-queue federated state, present on linked queues only.
pub(crate) struct LinkState {
    pub(crate) options: DependencyOptions,
    pub(crate) federation: Federation,
    /// Dependencies each parked dependent is blocked on.
    pub(crate) pending: DashMap<TaskId, Vec<TaskHandle>>,
}

// ---------------------------------------------------------------------------
// Federated dependency resolution
// ---------------------------------------------------------------------------

impl QueueCore {
    /// Federated prepare: never starts dependencies, only waits on them.
    ///
    /// For each incomplete dependency the task is dependency-flagged, the
    /// priority options are applied (re-sorting the affected waiting list on
    /// change), and the dependency's owner is located across the federation.
    /// The task then parks in `current(waiting)` while a watcher awaits the
    /// completion signals.
    ///
    /// # Panics
    ///
    /// Panics when a dependency is not present in this queue or any linked
    /// peer; such a dependent can never make progress.
    pub(crate) async fn prepare_linked(self: &Arc<Self>, task: &TaskHandle) -> PrepareOutcome {
        let link = self.link.get().expect("linked queue has link state");

        let mut watched = Vec::new();
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

            let owner = self.find_dependency_owner(link, dependency.id());

            if link
                .options
                .contains(DependencyOptions::INCREASE_DEPENDENCY_PRIORITY)
                && dependency.increase_priority()
            {
                owner.resort();
                tracing::debug!(
                    queue = %self.name,
                    dependency = %dependency.id(),
                    priority = %dependency.priority(),
                    "raised dependency priority"
                );
            }
            if link
                .options
                .contains(DependencyOptions::DECREASE_DEPENDENT_PRIORITY)
                && task.decrease_priority()
            {
                self.resort();
                tracing::debug!(
                    queue = %self.name,
                    task_id = %task.id(),
                    priority = %task.priority(),
                    "lowered dependent priority"
                );
            }

            watched.push(dependency.clone());
        }

        if watched.is_empty() {
            task.update_state(|state| state.clear_dependency());
            return PrepareOutcome::Proceed;
        }

        // Park; the watcher re-admits the task through the waited set.
        task.update_state(|state| state.wait_to(Phase::Waiting));
        self.publish(task);
        link.pending.insert(task.id(), watched.clone());
        tracing::debug!(
            queue = %self.name,
            task_id = %task.id(),
            dependencies = watched.len(),
            "dependent parked on federation"
        );
        self.spawn_dependency_watcher(task.clone(), watched);
        PrepareOutcome::Parked
    }

    fn find_dependency_owner(self: &Arc<Self>, link: &LinkState, id: TaskId) -> Arc<QueueCore> {
        if self.tasks.contains_key(&id) {
            return Arc::clone(self);
        }
        match link.federation.find_owner(id) {
            Some(owner) => owner,
            None => {
                tracing::error!(
                    queue = %self.name,
                    dependency = %id,
                    "dependency not found in federation"
                );
                panic!(
                    "dependency {id} not found in queue '{}' or any linked peer",
                    self.name
                );
            }
        }
    }

    /// Await each watched dependency in order, delivering the per-dependency
    /// finish callback as it completes; when all succeed, flip the task to
    /// `done(waiting)` and hand it to the scheduling loop.
    fn spawn_dependency_watcher(self: &Arc<Self>, task: TaskHandle, dependencies: Vec<TaskHandle>) {
        let core = Arc::clone(self);
        self.pool.spawn(task.qos(), async move {
            for dependency in &dependencies {
                dependency.completion_waiter().wait().await;
                if dependency.state().did_succeed() {
                    if let Some(dependent) = task.work().as_dependent() {
                        dependent.dependency_finished(dependency).await;
                    }
                } else {
                    let _ = core.fail_on_dependency(&task, dependency);
                    if let Some(link) = core.link.get() {
                        link.pending.remove(&task.id());
                    }
                    core.finalize(&task).await;
                    return;
                }
            }

            task.update_state(|state| state.finish());
            core.publish(&task);
            if let Some(link) = core.link.get() {
                link.pending.remove(&task.id());
            }
            core.waited.push(task.id());
            tracing::debug!(queue = %core.name, task_id = %task.id(), "dependencies satisfied");
            core.get_next.notify_one();
        });
    }
}

// ---------------------------------------------------------------------------
// LinkedTaskQueue
// ---------------------------------------------------------------------------

/// A [`TaskQueue`] that resolves dependencies across a federation of linked
/// peers.
///
/// Dereferences to [`TaskQueue`], so every queue operation (`add`, `start`,
/// `wait`, the views, …) is available directly.
#[derive(Debug, Clone)]
pub struct LinkedTaskQueue {
    queue: TaskQueue,
}

impl LinkedTaskQueue {
    /// Create a linked queue with no peers yet.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        max_simultaneous: usize,
        options: DependencyOptions,
    ) -> Self {
        let queue = TaskQueue::with_capacity(name, max_simultaneous);
        let _ = queue.core().link.set(LinkState {
            options,
            federation: Federation::new(),
            pending: DashMap::new(),
        });
        Self { queue }
    }

    /// Create a linked queue and link it to each of `peers`.
    #[must_use]
    pub fn linked_to<'a>(
        name: impl Into<String>,
        max_simultaneous: usize,
        peers: impl IntoIterator<Item = &'a LinkedTaskQueue>,
        options: DependencyOptions,
    ) -> Self {
        let queue = Self::new(name, max_simultaneous, options);
        for peer in peers {
            queue.link(peer);
        }
        queue
    }

    fn link_state(&self) -> &LinkState {
        self.queue
            .core()
            .link
            .get()
            .expect("linked queue has link state")
    }

    /// Link this queue and `peer` symmetrically.  Idempotent; linking a
    /// queue to itself is a no-op.
    pub fn link(&self, peer: &LinkedTaskQueue) {
        let own = self.queue.core();
        let other = peer.queue.core();
        if Arc::ptr_eq(own, other) {
            return;
        }
        let added_here = self.link_state().federation.insert(other);
        let added_there = peer.link_state().federation.insert(own);
        if added_here || added_there {
            tracing::info!(queue = %own.name, peer = %other.name, "queues linked");
        }
    }

    /// The dependency-adjustment options this queue applies.
    #[must_use]
    pub fn options(&self) -> DependencyOptions {
        self.link_state().options
    }

    /// The peer set.
    #[must_use]
    pub fn federation(&self) -> &Federation {
        &self.link_state().federation
    }

    /// Names of the linked peers.
    #[must_use]
    pub fn peers(&self) -> Vec<String> {
        self.federation().peer_names()
    }

    /// Ids of parked dependents and the dependencies they are blocked on.
    #[must_use]
    pub fn pending_dependencies(&self) -> Vec<(TaskId, Vec<TaskHandle>)> {
        self.link_state()
            .pending
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }
}

impl Deref for LinkedTaskQueue {
    type Target = TaskQueue;

    fn deref(&self) -> &TaskQueue {
        &self.queue
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
