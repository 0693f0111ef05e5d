//! Runtime plumbing for agents that drive a rate-limited image generation
//! service under human supervision.
//!
//! `kiln` does not talk to a model itself. It provides the shared machinery
//! an agent loop needs around a slow, quota-bound generator: a sliding-window
//! [`RateLimiter`](api::rate_limit::RateLimiter), a worker
//! [`TicketPool`](generation::pool::TicketPool) with batch cancel and wait,
//! an [`ApprovalGate`](agent::approval::ApprovalGate) that blocks a step on
//! an operator decision, cooperative pause/stop/redirect
//! [interrupts](agent::interrupt), a status-checked
//! [`TodoList`](agent::todo::TodoList), and a
//! [`ContextBudgetManager`](context::budget::ContextBudgetManager) that trims
//! a turn's context to fit the model window.
//!
//! # Getting started
//!
//! ```ignore
//! use kiln::prelude::*;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let generator = FnGenerator(|ticket: Ticket| async move {
//!         my_backend::render(&ticket.prompt, &ticket.params).await
//!     });
//!     let runtime = GenerationRuntime::build(
//!         RuntimeConfig::default().with_limits(10, 4),
//!         Arc::new(generator),
//!         Arc::new(LoggingSink),
//!     );
//!
//!     let job = runtime.start_run("run-1", "campaign");
//!     job.with_todo(|list| {
//!         list.add_item("hero image");
//!         list.add_item("banner");
//!     });
//!
//!     let tools = runtime.tool_set(&job);
//!     let step = ToolCallStep::new(tools, |item: &TodoItem| {
//!         ("generate_image".into(), json!({"prompt": item.description}))
//!     });
//!     let outcome = RunLoop::new(job).run(&step).await;
//! }
//! ```
//!
//! # Where to find things
//!
//! - **Throttle calls to the service:** [`api::rate_limit`], and
//!   [`api::retry`] for backoff that takes a fresh slot per attempt.
//! - **Queue and track generations:** [`generation::pool`] for the pool,
//!   [`generation::ticket`] for the lifecycle, [`generation::progress`] for
//!   event sinks.
//! - **Control a run:** [`agent::job`] holds per-run state,
//!   [`agent::approval`] the human gate, [`agent::runner`] the loop that
//!   reacts to interrupts.
//! - **Expose it to a model:** [`tools`] (`todo`, `generate_image`, and the
//!   [`ApprovalRequired`](tools::approval::ApprovalRequired) wrapper).
//! - **Fit a prompt into the window:** [`context::budget`].
//! - **Wire it all up:** [`runtime::GenerationRuntime`] from a
//!   [`config::RuntimeConfig`].

pub mod agent;
pub mod api;
pub mod clock;
pub mod config;
pub mod context;
pub mod generation;
pub mod ids;
pub mod prelude;
pub mod runtime;
pub mod tools;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Generate a JSON Schema for a tool's argument struct.
///
/// ```
/// use kiln::json_schema_for;
/// use schemars::JsonSchema;
/// use serde::Deserialize;
///
/// #[derive(Deserialize, JsonSchema)]
/// struct ApproveArgs {
///     request_id: String,
///     #[serde(default)]
///     prompt: Option<String>,
/// }
///
/// let schema = json_schema_for::<ApproveArgs>();
/// assert_eq!(schema["type"], "object");
/// assert!(schema["required"].as_array().unwrap().contains(&"request_id".into()));
/// ```
pub fn json_schema_for<T: JsonSchema>() -> serde_json::Value {
    let schema = schemars::schema_for!(T);
    serde_json::to_value(schema)
        .unwrap_or_else(|_| serde_json::json!({"type": "object", "properties": {}}))
}

// ── Tool types ─────────────────────────────────────────────────────

/// The type of a tool definition. Always `Function` in the
/// function-calling format.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum ToolType {
    #[serde(rename = "function")]
    Function,
}

/// Tool definition in function-calling format, as handed to a model.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ToolDef {
    #[serde(rename = "type")]
    pub tool_type: ToolType,
    pub function: FunctionDef,
}

impl ToolDef {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            tool_type: ToolType::Function,
            function: FunctionDef {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct FunctionDef {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_def_serializes_in_function_format() {
        let def = ToolDef::new("todo", "Manage the checklist.", serde_json::json!({"type": "object"}));
        let value = serde_json::to_value(&def).unwrap();
        assert_eq!(value["type"], "function");
        assert_eq!(value["function"]["name"], "todo");
        assert_eq!(value["function"]["parameters"]["type"], "object");
    }
}
