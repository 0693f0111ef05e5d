//! Convenience re-exports for common `kiln` types.
//!
//! ```ignore
//! use kiln::prelude::*;
//! ```
//!
//! Covers building a runtime, driving a run and writing generators and
//! tools. Lower-level pieces (approval requests, ticket events, budget
//! reports) are imported from their modules when needed.

// ── Core types ──────────────────────────────────────────────────────
pub use crate::clock::{Clock, ManualClock, SystemClock};
pub use crate::config::RuntimeConfig;
pub use crate::runtime::GenerationRuntime;
pub use crate::{ToolDef, json_schema_for};

// ── Service access ──────────────────────────────────────────────────
pub use crate::api::{GenerationError, RateLimitConfig, RateLimiter, RetryConfig};
pub use crate::generation::{
    BatchSummary, FnGenerator, Generator, LoggingSink, NoopSink, Params, PoolConfig,
    ProgressSink, Ticket, TicketPool, TicketStatus,
};

// ── Run control ─────────────────────────────────────────────────────
pub use crate::agent::{
    ApprovalAction, ApprovalConfig, ApprovalGate, ApprovalResult, FnStep, InterruptAction,
    InterruptSignal, Interrupted, JobHandle, JobRegistry, RunLoop, RunOutcome, Step,
    StepOutcome, TodoItem, TodoList, TodoStatus, ToolCallStep,
};

// ── Context management ──────────────────────────────────────────────
pub use crate::context::{ContextBudgetConfig, ContextBudgetManager};

// ── Tools ───────────────────────────────────────────────────────────
pub use crate::tools::{
    FnTool, GenerateTool, TodoTool, Tool, ToolFuture, ToolResult, ToolSet, approval_required,
    parse_tool_args,
};
