//! Tools a run invokes by name.
//!
//! - [`core`]: [`Tool`] trait, [`ToolSet`] dispatch, [`FnTool`] for closures.
//! - [`approval`]: [`ApprovalRequired`] middleware putting a tool behind the
//!   [`ApprovalGate`](crate::agent::approval::ApprovalGate).
//! - [`todo`]: [`TodoTool`] over the run's status-checked todo list.
//! - [`generate`]: [`GenerateTool`] submitting batches to the ticket pool.

pub mod approval;
pub mod core;
pub mod generate;
pub mod todo;

pub use approval::{ApprovalRequired, approval_required};
pub use core::{FnTool, Tool, ToolFuture, ToolResult, ToolSet, parse_tool_args, truncate_result};
pub use generate::GenerateTool;
pub use todo::TodoTool;
