//! Per-run control state.
//!
//! - [`interrupt`]: [`InterruptAction`], [`Interrupted`] and the
//!   [`InterruptSignal`] checked at every safe point.
//! - [`todo`]: [`TodoList`], a status-checked checklist of a run's work.
//! - [`job`]: [`JobHandle`] holding one run's interrupt, approval and todo
//!   state; [`JobRegistry`] of live runs.
//! - [`approval`]: [`ApprovalGate`] blocking a step on a human decision.
//! - [`runner`]: [`RunLoop`] driving the todo list and reacting to
//!   pause, stop and redirect.

pub mod approval;
pub mod interrupt;
pub mod job;
pub mod runner;
pub mod todo;

pub use approval::{
    ApprovalAction, ApprovalConfig, ApprovalError, ApprovalGate, ApprovalRequest, ApprovalResult,
    GateDecision, gate_prompt,
};
pub use interrupt::{InterruptAction, InterruptSignal, Interrupted, NoInterrupt};
pub use job::{JobHandle, JobRegistry, JobSnapshot, JobState};
pub use runner::{FnStep, RunError, RunLoop, RunOutcome, Step, StepFuture, StepOutcome, ToolCallStep};
pub use todo::{TodoError, TodoItem, TodoList, TodoProgress, TodoStatus};
