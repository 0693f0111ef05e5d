//! The `generate_image` tool: submit a batch to the pool and wait for it.

use schemars::JsonSchema;
use serde::Deserialize;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::core::{Tool, ToolFuture, parse_tool_args};
use crate::ToolDef;
use crate::agent::job::JobHandle;
use crate::generation::pool::{BatchSummary, Params, TicketPool};
use crate::generation::progress::artifact_reference;
use crate::generation::ticket::TicketStatus;

/// Upper bound on variations per call.
pub const MAX_VARIATIONS: u32 = 8;

/// Typed arguments for the `generate_image` tool.
#[derive(Deserialize, JsonSchema)]
pub struct GenerateArgs {
    /// What to generate.
    pub prompt: String,
    /// Number of variations to produce (1-8). Default: 1.
    #[serde(default = "default_variations")]
    pub variations: u32,
    /// Extra generator parameters (size, style, seed, ...).
    #[serde(default)]
    pub params: Params,
    /// Reference to an existing preview shown to the approver.
    #[serde(default)]
    pub preview: Option<String>,
}

fn default_variations() -> u32 {
    1
}

/// Submits one batch per call and waits for it, observing the run's
/// interrupt signal.
///
/// On interrupt the batch's queued tickets are cancelled before the
/// interrupt propagates. Terminal tickets are removed from the pool once
/// the result is reported.
pub struct GenerateTool {
    pool: Arc<TicketPool>,
    job: JobHandle,
    wait_timeout: Option<Duration>,
}

impl GenerateTool {
    pub fn new(pool: Arc<TicketPool>, job: JobHandle) -> Self {
        Self {
            pool,
            job,
            wait_timeout: Some(Duration::from_secs(600)),
        }
    }

    /// Bound the batch wait. On timeout the partial result is reported.
    pub fn with_wait_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.wait_timeout = timeout;
        self
    }

    /// Remove the batch's terminal tickets now, and the rest once they
    /// finish. Nothing else cleans a batch the tool has returned from.
    fn cleanup(&self, batch: &str) {
        self.pool.cleanup_batch(batch);
        if self.pool.batch_summary(batch).is_finished() {
            return;
        }
        let pool = self.pool.clone();
        let batch = batch.to_string();
        tokio::spawn(async move {
            let summary = pool.wait_for_batch(&batch, None).await;
            let removed = pool.cleanup_batch(&batch);
            debug!(
                "Late cleanup of {}: removed {removed} tickets",
                summary.to_log_string()
            );
        });
    }

    fn format_summary(summary: &BatchSummary) -> String {
        let mut out = format!("Generated {}.\n", summary.to_log_string());
        for ticket in &summary.tickets {
            let detail = match ticket.status {
                TicketStatus::Completed => ticket
                    .artifact
                    .as_deref()
                    .map(|p| artifact_reference(p).unwrap_or_else(|| p.display().to_string()))
                    .unwrap_or_default(),
                _ => ticket.error.clone().unwrap_or_default(),
            };
            let _ = writeln!(out, "  - {} {}: {detail}", ticket.id, ticket.status);
        }
        if !summary.is_finished() {
            out.push_str("Some tickets are still running; their results will arrive later.\n");
        }
        out
    }
}

impl Tool for GenerateTool {
    fn definition(&self) -> ToolDef {
        ToolDef::new(
            "generate_image",
            "Generate image variations from a prompt. Runs through the shared \
             rate-limited generation pool and returns one line per variation \
             with its artifact reference or error.",
            crate::json_schema_for::<GenerateArgs>(),
        )
    }

    fn execute(&self, arguments: &str) -> ToolFuture<'_> {
        let parsed = parse_tool_args::<GenerateArgs>(arguments);
        Box::pin(async move {
            let args = match parsed {
                Ok(a) => a,
                Err(e) => return Ok(e),
            };
            if args.prompt.trim().is_empty() {
                return Ok("Error: 'prompt' must not be empty.".into());
            }
            if !(1..=MAX_VARIATIONS).contains(&args.variations) {
                return Ok(format!(
                    "Error: 'variations' must be between 1 and {MAX_VARIATIONS}."
                ));
            }

            let batch = TicketPool::new_batch_id();
            let signal = Arc::new(self.job.clone());
            for _ in 0..args.variations {
                if let Err(e) = self.pool.submit_with_signal(
                    args.prompt.clone(),
                    args.params.clone(),
                    Some(&batch),
                    signal.clone(),
                ) {
                    self.pool.cancel_batch(&batch);
                    return Ok(format!("Error: {e}"));
                }
            }
            info!("Submitted {} variations as {batch}", args.variations);

            let summary = match self
                .pool
                .wait_for_batch_interruptible(&batch, self.wait_timeout, &self.job)
                .await
            {
                Ok(summary) => summary,
                Err(interrupt) => {
                    let cancelled = self.pool.cancel_batch(&batch);
                    info!("Batch {batch} interrupted ({interrupt}); {cancelled} queued tickets cancelled");
                    self.cleanup(&batch);
                    return Err(interrupt);
                }
            };
            let report = Self::format_summary(&summary);
            self.cleanup(&batch);
            Ok(report)
        })
    }
}
