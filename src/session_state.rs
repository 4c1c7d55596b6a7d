//! Migration state machines
//!
//! Owns the authoritative stage of a migration session and of each disk
//! pipeline inside it. Transitions are validated: stages only move forward
//! one step at a time, and the two absorbing states (`Failed`, `Cancelled`)
//! can be entered from any non-terminal stage.
//!
//! # Stage Flow
//!
//! ```text
//! Pending
//!     ↓
//! ChangeResolved
//!     ↓
//! Exporting
//!     ↓
//! Copying
//!     ↓
//! Converting      (sessions only, skipped when conversion is off)
//!     ↓
//! Completed
//!
//! (Any non-terminal stage can transition to Failed or Cancelled)
//! ```
//!
//! A disk's pipeline ends at `Completed` straight after `Copying`: for a
//! disk, "completed" means its copy is done.

use serde::Serialize;
use strum::{Display, EnumIter};
use thiserror::Error;

/// Pipeline stages in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display, EnumIter)]
#[repr(u8)]
pub enum Stage {
    Pending = 0,
    ChangeResolved = 1,
    Exporting = 2,
    Copying = 3,
    Converting = 4,
    Completed = 5,
    Failed = 254,
    Cancelled = 255,
}

impl Stage {
    #[inline]
    pub const fn order(self) -> u8 {
        self as u8
    }

    /// Completed, Failed or Cancelled
    #[inline]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// What a state machine tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// One disk's change/export/copy pipeline
    Disk,
    /// A whole VM; `converts` says whether `Converting` is part of the flow
    Session { converts: bool },
}

impl Scope {
    /// Stage following `stage` in this scope's flow
    pub const fn next(self, stage: Stage) -> Option<Stage> {
        match (self, stage) {
            (_, Stage::Pending) => Some(Stage::ChangeResolved),
            (_, Stage::ChangeResolved) => Some(Stage::Exporting),
            (_, Stage::Exporting) => Some(Stage::Copying),
            (Self::Session { converts: true }, Stage::Copying) => Some(Stage::Converting),
            (_, Stage::Copying) => Some(Stage::Completed),
            (Self::Session { .. }, Stage::Converting) => Some(Stage::Completed),
            _ => None,
        }
    }
}

/// Errors that can occur during state transitions
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("Cannot move from {from} to {to} (stages advance one at a time)")]
    InvalidTransition { from: Stage, to: Stage },

    #[error("Cannot go backwards from {from} to {to}")]
    BackwardTransition { from: Stage, to: Stage },

    #[error("Cannot transition from terminal state {from}")]
    FromTerminalState { from: Stage },

    #[error("Already at stage {stage}")]
    AlreadyAtStage { stage: Stage },
}

impl From<TransitionError> for crate::error::MigrationError {
    fn from(err: TransitionError) -> Self {
        crate::error::MigrationError::Transition(err.to_string())
    }
}

/// Validated stage tracker with history.
#[derive(Debug, Clone)]
pub struct StageMachine {
    scope: Scope,
    current: Stage,
    /// Stage that was active when Failed/Cancelled was entered
    interrupted_at: Option<Stage>,
    reason: Option<String>,
    history: Vec<(Stage, u64)>,
}

impl StageMachine {
    pub fn new(scope: Scope) -> Self {
        Self {
            scope,
            current: Stage::Pending,
            interrupted_at: None,
            reason: None,
            history: vec![(Stage::Pending, unix_now())],
        }
    }

    pub fn for_disk() -> Self {
        Self::new(Scope::Disk)
    }

    pub fn for_session(converts: bool) -> Self {
        Self::new(Scope::Session { converts })
    }

    #[inline]
    pub fn current(&self) -> Stage {
        self.current
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn interrupted_at(&self) -> Option<Stage> {
        self.interrupted_at
    }

    /// First fatal cause, if the machine failed or was cancelled
    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    pub fn history(&self) -> &[(Stage, u64)] {
        &self.history
    }

    pub fn is_terminal(&self) -> bool {
        self.current.is_terminal()
    }

    /// Advance to the next stage of this scope's flow.
    pub fn advance(&mut self) -> Result<Stage, TransitionError> {
        if self.current.is_terminal() {
            return Err(TransitionError::FromTerminalState { from: self.current });
        }
        let Some(next) = self.scope.next(self.current) else {
            return Err(TransitionError::FromTerminalState { from: self.current });
        };
        self.record(next);
        Ok(next)
    }

    /// Transition to `target`, which must be the immediate next stage.
    pub fn transition_to(&mut self, target: Stage) -> Result<Stage, TransitionError> {
        if self.current.is_terminal() {
            return Err(TransitionError::FromTerminalState { from: self.current });
        }
        if target == self.current {
            return Err(TransitionError::AlreadyAtStage { stage: target });
        }
        if target.order() < self.current.order() {
            return Err(TransitionError::BackwardTransition {
                from: self.current,
                to: target,
            });
        }
        if self.scope.next(self.current) != Some(target) {
            return Err(TransitionError::InvalidTransition {
                from: self.current,
                to: target,
            });
        }
        self.record(target);
        Ok(target)
    }

    /// Enter `Failed` with the first fatal cause.
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), TransitionError> {
        self.interrupt(Stage::Failed, reason.into())
    }

    /// Enter `Cancelled`.
    pub fn cancel(&mut self, reason: impl Into<String>) -> Result<(), TransitionError> {
        self.interrupt(Stage::Cancelled, reason.into())
    }

    fn interrupt(&mut self, target: Stage, reason: String) -> Result<(), TransitionError> {
        if self.current.is_terminal() {
            return Err(TransitionError::FromTerminalState { from: self.current });
        }
        self.interrupted_at = Some(self.current);
        self.reason = Some(reason);
        self.record(target);
        Ok(())
    }

    fn record(&mut self, stage: Stage) {
        self.history.push((stage, unix_now()));
        self.current = stage;
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
