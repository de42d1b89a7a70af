//! Shutdown state, outcomes and hook errors.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Coordinator state. Moves forward only: `Idle → Cleaning → Terminated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitState {
    /// Accepting hook registrations.
    Idle,
    /// Hooks are running; registrations are dropped.
    Cleaning,
    /// The outcome has been decided and handed to the terminator.
    Terminated,
}

/// Process-level result of a cleanup run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Every hook succeeded.
    Success,
    /// At least one hook failed and the deadline was met.
    HookFailed,
    /// The aggregate deadline expired before every hook settled.
    TimedOut,
}

impl ExitOutcome {
    /// Process exit code for this outcome.
    pub fn code(self) -> i32 {
        match self {
            ExitOutcome::Success => 0,
            ExitOutcome::HookFailed => 1,
            ExitOutcome::TimedOut => 2,
        }
    }
}

/// Failure reported by a single cleanup hook.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HookError {
    /// The hook returned an error.
    #[error("{0}")]
    Failed(String),

    /// The hook task panicked or was aborted.
    #[error("hook panicked: {0}")]
    Panicked(String),
}

impl HookError {
    pub fn failed(reason: impl fmt::Display) -> Self {
        HookError::Failed(reason.to_string())
    }
}

/// How one hook ended, indexed by registration order in [`ExitReport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookStatus {
    Succeeded,
    Failed(HookError),
    /// Still running when the deadline expired.
    Abandoned,
}

/// Everything the coordinator learned while cleaning up.
#[derive(Debug, Clone)]
pub struct ExitReport {
    /// Reason passed to the trigger that won.
    pub reason: String,
    pub outcome: ExitOutcome,
    /// Per-hook status in registration order.
    pub hooks: Vec<HookStatus>,
    /// Wall time spent waiting on hooks.
    pub elapsed: Duration,
}

impl ExitReport {
    pub fn code(&self) -> i32 {
        self.outcome.code()
    }

    /// Failed hooks as `(registration index, error)`.
    pub fn failures(&self) -> Vec<(usize, &HookError)> {
        self.hooks
            .iter()
            .enumerate()
            .filter_map(|(i, status)| match status {
                HookStatus::Failed(e) => Some((i, e)),
                _ => None,
            })
            .collect()
    }

    /// Registration indices of hooks still running at the deadline.
    pub fn abandoned(&self) -> Vec<usize> {
        self.hooks
            .iter()
            .enumerate()
            .filter(|(_, status)| **status == HookStatus::Abandoned)
            .map(|(i, _)| i)
            .collect()
    }
}

/// Final action taken once the outcome is known.
pub trait Terminator: Send + Sync + 'static {
    fn terminate(&self, code: i32);
}

/// Ends the process with the outcome's exit code.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessExit;

impl Terminator for ProcessExit {
    fn terminate(&self, code: i32) {
        std::process::exit(code);
    }
}
