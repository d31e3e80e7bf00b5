//! Per-task state machine.
//!
//! A task's progress is described by a flat discriminated union of phases
//! ([`TaskState`]) plus one decoration: the id of the dependency the task is
//! currently stalled on.  The runtime drives every task through
//!
//! ```text
//! ready --> beginning --> preparing --> configuring --> executing --> done(executing)
//!                   \                                         \-> failed(...)
//!                    \-> waiting --> done(waiting) --> beginning (re-pick)
//! ```
//!
//! with cooperative detours through `pausing`/`resuming`/`cancelling` while
//! the task is executing.
//!
//! # Transition contract
//!
//! Transition methods assert their preconditions: calling one from the wrong
//! state is a programmer error and panics.  Terminal states
//! (`done(executing)`, `done(cancelling)`, any `failed`) reject every further
//! transition.

use serde::{Deserialize, Serialize};

use crate::task::TaskId;

// ---------------------------------------------------------------------------
// Phases and failures
// ---------------------------------------------------------------------------

/// A lifecycle phase a task can currently be in or have finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Enqueued, not yet picked.
    Ready,
    /// Picked by the scheduling loop, lifecycle dispatch in flight.
    Beginning,
    /// Resolving dependencies.
    Preparing,
    /// Running the task's `configure` hook.
    Configuring,
    /// Running the task's `execute` hook.
    Executing,
    /// A pause request is being delivered.
    Pausing,
    /// A resume request is being delivered.
    Resuming,
    /// A cancel request is being delivered.
    Cancelling,
    /// Parked until all dependencies signal completion.
    Waiting,
}

/// Why a task failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Failure {
    /// A lifecycle hook for this phase returned `false`.
    Phase(Phase),
    /// The given dependency failed or was cancelled, so this task can never
    /// run.
    Dependency(TaskId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Repr {
    Ready,
    Current(Phase),
    Done(Phase),
    Failed(Failure),
}

// ---------------------------------------------------------------------------
// TaskState
// ---------------------------------------------------------------------------

/// The state of a single task.
///
/// `Copy`, so reads hand out a snapshot; the authoritative value lives behind
/// the owning task handle's lock and is mutated only through the transition
/// methods below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskState {
    repr: Repr,
    /// Set while the task is stalled on a dependency.
    blocked_on: Option<TaskId>,
}

impl TaskState {
    /// A fresh `ready` state.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            repr: Repr::Ready,
            blocked_on: None,
        }
    }

    // -- Queries ------------------------------------------------------------

    /// Still waiting to be picked for the first time.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self.repr, Repr::Ready)
    }

    /// Has left `ready` (in any direction).
    #[must_use]
    pub fn is_started(&self) -> bool {
        !self.is_ready()
    }

    /// Currently inside the `execute` hook.
    #[must_use]
    pub fn is_executing(&self) -> bool {
        matches!(self.repr, Repr::Current(Phase::Executing))
    }

    /// Paused successfully; not terminal.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        matches!(self.repr, Repr::Done(Phase::Pausing))
    }

    /// Parked on unfinished dependencies.
    #[must_use]
    pub fn is_waiting(&self) -> bool {
        matches!(self.repr, Repr::Current(Phase::Waiting))
    }

    /// All dependencies signalled; eligible for the priority pick ahead of
    /// plain `ready` tasks.
    #[must_use]
    pub fn has_waited(&self) -> bool {
        matches!(self.repr, Repr::Done(Phase::Waiting))
    }

    /// Finished dependency resolution.
    #[must_use]
    pub fn is_prepared(&self) -> bool {
        matches!(self.repr, Repr::Done(Phase::Preparing))
    }

    /// Finished the `configure` hook.
    #[must_use]
    pub fn is_configured(&self) -> bool {
        matches!(self.repr, Repr::Done(Phase::Configuring))
    }

    /// Cancelled cooperatively; terminal.
    #[must_use]
    pub fn was_cancelled(&self) -> bool {
        matches!(self.repr, Repr::Done(Phase::Cancelling))
    }

    /// Failed in some phase or through a dependency; terminal.
    #[must_use]
    pub fn did_fail(&self) -> bool {
        matches!(self.repr, Repr::Failed(_))
    }

    /// Executed to completion; terminal.
    #[must_use]
    pub fn did_succeed(&self) -> bool {
        matches!(self.repr, Repr::Done(Phase::Executing))
    }

    /// In one of the three terminal states.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.did_succeed() || self.did_fail() || self.was_cancelled()
    }

    /// The phase currently in flight, if any.
    #[must_use]
    pub fn current_phase(&self) -> Option<Phase> {
        match self.repr {
            Repr::Current(phase) => Some(phase),
            _ => None,
        }
    }

    /// The failure reason, if the task failed.
    #[must_use]
    pub fn failure(&self) -> Option<Failure> {
        match self.repr {
            Repr::Failed(failure) => Some(failure),
            _ => None,
        }
    }

    /// The dependency this task is stalled on, if any.
    #[must_use]
    pub fn blocked_on(&self) -> Option<TaskId> {
        self.blocked_on
    }

    // -- Transitions --------------------------------------------------------

    /// Enter `phase`.
    ///
    /// Entering [`Phase::Beginning`] requires `ready` or `done(waiting)`;
    /// any other phase requires a started, non-terminal, non-paused state.
    ///
    /// # Panics
    ///
    /// Panics when the precondition does not hold.
    pub fn start_to(&mut self, phase: Phase) {
        if phase == Phase::Beginning {
            assert!(
                self.is_ready() || self.has_waited(),
                "illegal transition: {:?} -> current({phase:?})",
                self.repr
            );
        } else {
            assert!(
                self.is_started() && !self.is_done() && !self.is_paused(),
                "illegal transition: {:?} -> current({phase:?})",
                self.repr
            );
        }
        self.repr = Repr::Current(phase);
    }

    /// Mark the phase in flight as finished: `current(p)` becomes `done(p)`.
    ///
    /// Finishing [`Phase::Waiting`] also clears the dependency decoration.
    ///
    /// # Panics
    ///
    /// Panics unless a phase is currently in flight.
    pub fn finish(&mut self) {
        match self.repr {
            Repr::Current(phase) => {
                if phase == Phase::Waiting {
                    self.blocked_on = None;
                }
                self.repr = Repr::Done(phase);
            }
            other => panic!("illegal transition: {other:?} -> done"),
        }
    }

    /// Fail the task; terminal.
    ///
    /// # Panics
    ///
    /// Panics unless the task is started or dependency-flagged, and not
    /// already terminal.
    pub fn fail(&mut self, failure: Failure) {
        assert!(
            (self.is_started() || self.blocked_on.is_some()) && !self.is_done(),
            "illegal transition: {:?} -> failed({failure:?})",
            self.repr
        );
        self.blocked_on = None;
        self.repr = Repr::Failed(failure);
    }

    /// Park in `current(phase)` without the `ready` precondition.
    ///
    /// Used to suspend a started task into [`Phase::Waiting`] while its
    /// dependencies run elsewhere.
    ///
    /// # Panics
    ///
    /// Panics when the task has not started or is terminal.
    pub fn wait_to(&mut self, phase: Phase) {
        assert!(
            self.is_started() && !self.is_done(),
            "illegal transition: {:?} -> waiting({phase:?})",
            self.repr
        );
        self.repr = Repr::Current(phase);
    }

    /// Begin delivering a pause request.
    ///
    /// # Panics
    ///
    /// Panics unless the task is `current(executing)`.
    pub fn pause(&mut self) {
        assert!(
            self.is_executing(),
            "illegal transition: {:?} -> current(pausing)",
            self.repr
        );
        self.repr = Repr::Current(Phase::Pausing);
    }

    /// Begin delivering a resume request.
    ///
    /// # Panics
    ///
    /// Panics unless the task is paused.
    pub fn resume(&mut self) {
        assert!(
            self.is_paused(),
            "illegal transition: {:?} -> current(resuming)",
            self.repr
        );
        self.repr = Repr::Current(Phase::Resuming);
    }

    /// Begin delivering a cancel request.
    ///
    /// # Panics
    ///
    /// Panics unless the task is `current(executing)`.
    pub fn cancel(&mut self) {
        assert!(
            self.is_executing(),
            "illegal transition: {:?} -> current(cancelling)",
            self.repr
        );
        self.repr = Repr::Current(Phase::Cancelling);
    }

    /// Flag the task as stalled on `dependency`.
    ///
    /// # Panics
    ///
    /// Panics when the task is already terminal.
    pub fn set_dependency(&mut self, dependency: TaskId) {
        assert!(
            !self.is_done(),
            "illegal transition: {:?} -> dependency({dependency})",
            self.repr
        );
        self.blocked_on = Some(dependency);
    }

    /// Drop the dependency decoration.
    pub fn clear_dependency(&mut self) {
        self.blocked_on = None;
    }
}

impl Default for TaskState {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Phase::Ready => "ready",
            Phase::Beginning => "beginning",
            Phase::Preparing => "preparing",
            Phase::Configuring => "configuring",
            Phase::Executing => "executing",
            Phase::Pausing => "pausing",
            Phase::Resuming => "resuming",
            Phase::Cancelling => "cancelling",
            Phase::Waiting => "waiting",
        };
        f.write_str(name)
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Failure::Phase(phase) => write!(f, "{phase}"),
            Failure::Dependency(id) => write!(f, "dependency({id})"),
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.repr {
            Repr::Ready => f.write_str("ready")?,
            Repr::Current(phase) => write!(f, "current({phase})")?,
            Repr::Done(phase) => write!(f, "done({phase})")?,
            Repr::Failed(failure) => write!(f, "failed({failure})")?,
        }
        if let Some(id) = self.blocked_on {
            write!(f, " (blocked on {id})")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
