//! Cooperative cancellation: the interrupt signal and its typed error.
//!
//! An operator (through some UI bridge) sets an interrupt on a run's
//! [`JobState`](super::job::JobState). Long-running work polls
//! [`InterruptSignal::check`] at its safe points: rate-limiter sleeps,
//! approval polls, ticket waits, run-loop iterations. A set interrupt surfaces
//! as [`Interrupted`], which every layer propagates with `?` until the
//! [`RunLoop`](super::runner::RunLoop) decides what to do with it.

use serde::{Deserialize, Serialize};
use std::fmt;

/// What the operator asked the run to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptAction {
    /// Suspend at the next safe point and wait for a resume.
    Pause,
    /// Abandon the run.
    Stop,
    /// Abandon the current work and restart with new guidance.
    Redirect,
}

impl fmt::Display for InterruptAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pause => write!(f, "pause"),
            Self::Stop => write!(f, "stop"),
            Self::Redirect => write!(f, "redirect"),
        }
    }
}

/// The interrupt raised at a safe point.
///
/// This is the only error that intentionally aborts a run. Generic error
/// handlers must re-raise it rather than fold it into a tool failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[error("run interrupted: {action}{}", message_suffix(.message))]
pub struct Interrupted {
    pub action: InterruptAction,
    pub message: Option<String>,
}

impl Interrupted {
    pub fn new(action: InterruptAction, message: Option<String>) -> Self {
        Self { action, message }
    }
}

fn message_suffix(message: &Option<String>) -> String {
    message
        .as_deref()
        .map(|m| format!(" ({m})"))
        .unwrap_or_default()
}

/// Something long-running work can poll for an operator interrupt.
///
/// Implemented by [`JobHandle`](super::job::JobHandle); use [`NoInterrupt`]
/// where no run context exists.
pub trait InterruptSignal: Send + Sync {
    /// The pending interrupt, if any. Does not clear it.
    fn pending(&self) -> Option<Interrupted>;

    /// `Err` when an interrupt is pending. Call at every safe point.
    fn check(&self) -> Result<(), Interrupted> {
        match self.pending() {
            Some(interrupt) => Err(interrupt),
            None => Ok(()),
        }
    }
}

/// A signal that is never set.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoInterrupt;

impl InterruptSignal for NoInterrupt {
    fn pending(&self) -> Option<Interrupted> {
        None
    }
}
