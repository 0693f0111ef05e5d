//! Approval middleware for tools that take a `prompt` argument.

use serde_json::Value;
use std::sync::Arc;

use super::core::{Tool, ToolFuture};
use crate::ToolDef;
use crate::agent::approval::{ApprovalGate, GateDecision, gate_prompt};
use crate::agent::job::JobHandle;

/// Wraps a tool so every call first goes through the [`ApprovalGate`].
///
/// Rejected or timed-out calls return a refusal message without running the
/// tool. An edited prompt replaces the `prompt` argument. The optional
/// `preview` argument is forwarded to the approver.
pub struct ApprovalRequired<T> {
    inner: T,
    gate: Arc<ApprovalGate>,
    job: Option<JobHandle>,
}

/// Wrap `tool` with approval. With `job = None` the gate is skipped.
pub fn approval_required<T: Tool>(
    tool: T,
    gate: Arc<ApprovalGate>,
    job: Option<JobHandle>,
) -> ApprovalRequired<T> {
    ApprovalRequired {
        inner: tool,
        gate,
        job,
    }
}

impl<T: Tool> ApprovalRequired<T> {
    pub fn inner(&self) -> &T {
        &self.inner
    }
}

impl<T: Tool> Tool for ApprovalRequired<T> {
    fn definition(&self) -> ToolDef {
        self.inner.definition()
    }

    fn execute(&self, arguments: &str) -> ToolFuture<'_> {
        let arguments = arguments.to_string();
        Box::pin(async move {
            let mut args: Value = match serde_json::from_str(&arguments) {
                Ok(v) => v,
                Err(e) => return Ok(format!("Error: invalid tool arguments: {e}")),
            };
            let Some(prompt) = args.get("prompt").and_then(Value::as_str).map(str::to_string)
            else {
                return Ok("Error: 'prompt' is required.".into());
            };
            let preview = args.get("preview").and_then(Value::as_str).map(str::to_string);
            let name = self.inner.name();

            let decision = gate_prompt(
                &self.gate,
                self.job.as_ref(),
                &name,
                &prompt,
                preview.as_deref(),
            )
            .await?;

            match decision {
                GateDecision::Refused(message) => Ok(message),
                GateDecision::Proceed { prompt: approved, .. } if approved == prompt => {
                    self.inner.execute(&arguments).await
                }
                GateDecision::Proceed { prompt: approved, .. } => {
                    args["prompt"] = Value::String(approved);
                    self.inner.execute(&args.to_string()).await
                }
            }
        })
    }
}
