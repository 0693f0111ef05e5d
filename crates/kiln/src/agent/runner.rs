//! The top-level run loop: walk the todo list and react to interrupts.
//!
//! Each pending item is started, handed to a [`Step`], and completed or
//! failed from the step's outcome. An [`Interrupted`] raised anywhere below
//! the step lands here:
//!
//! - **pause**: the item moves to `paused`, the loop waits for
//!   [`JobHandle::resume`], then restarts the item;
//! - **stop**: the item and every pending item are cancelled;
//! - **redirect**: the item is cancelled and the run returns the new
//!   guidance to its caller.

use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::interrupt::{InterruptAction, InterruptSignal, Interrupted};
use super::job::JobHandle;
use super::todo::{TodoError, TodoItem, TodoProgress};
use crate::clock::{Clock, SystemClock};
use crate::tools::core::ToolSet;

/// What a step produced for one todo item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// Finished; the references become the item's outputs.
    Done(Vec<String>),
    /// Finished unsuccessfully with this error.
    Failed(String),
}

pub type StepFuture<'a> =
    Pin<Box<dyn Future<Output = Result<StepOutcome, Interrupted>> + Send + 'a>>;

/// Executes one todo item.
pub trait Step: Send + Sync {
    fn run<'a>(&'a self, job: &'a JobHandle, item: &'a TodoItem) -> StepFuture<'a>;
}

/// Adapts an async closure into a [`Step`].
pub struct FnStep<F>(pub F);

impl<F, Fut> Step for FnStep<F>
where
    F: Fn(JobHandle, TodoItem) -> Fut + Send + Sync,
    Fut: Future<Output = Result<StepOutcome, Interrupted>> + Send + 'static,
{
    fn run<'a>(&'a self, job: &'a JobHandle, item: &'a TodoItem) -> StepFuture<'a> {
        Box::pin((self.0)(job.clone(), item.clone()))
    }
}

/// Runs each item as a tool call chosen by `plan`.
///
/// `plan` maps an item to `(tool name, arguments)`. Tool output starting
/// with `"Error:"` fails the item; anything else completes it with the
/// output as its single reference.
pub struct ToolCallStep<P> {
    tools: ToolSet,
    plan: P,
}

impl<P> ToolCallStep<P>
where
    P: Fn(&TodoItem) -> (String, serde_json::Value) + Send + Sync,
{
    pub fn new(tools: ToolSet, plan: P) -> Self {
        Self { tools, plan }
    }
}

impl<P> Step for ToolCallStep<P>
where
    P: Fn(&TodoItem) -> (String, serde_json::Value) + Send + Sync,
{
    fn run<'a>(&'a self, _job: &'a JobHandle, item: &'a TodoItem) -> StepFuture<'a> {
        let (name, args) = (self.plan)(item);
        Box::pin(async move {
            let output = self.tools.execute(&name, &args.to_string()).await?;
            Ok(if output.starts_with("Error:") {
                StepOutcome::Failed(output)
            } else {
                StepOutcome::Done(vec![output])
            })
        })
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    /// No pending items remain.
    Completed { progress: TodoProgress },
    Stopped {
        message: Option<String>,
        progress: TodoProgress,
    },
    /// Abandoned with new guidance for the caller.
    Redirected {
        message: Option<String>,
        progress: TodoProgress,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Todo(#[from] TodoError),
}

enum Reaction {
    Retry,
    Finish(RunOutcome),
}

/// Drives one run's todo list to completion.
///
/// ```ignore
/// let job = registry.start_run("run-1", "campaign");
/// job.with_todo(|list| { list.add_item("hero image"); list.add_item("banner"); });
/// let outcome = RunLoop::new(job).run(&step).await?;
/// ```
pub struct RunLoop {
    job: JobHandle,
    clock: Arc<dyn Clock>,
    resume_poll: Duration,
}

impl RunLoop {
    pub fn new(job: JobHandle) -> Self {
        Self::with_clock(job, SystemClock::shared())
    }

    pub fn with_clock(job: JobHandle, clock: Arc<dyn Clock>) -> Self {
        Self {
            job,
            clock,
            resume_poll: Duration::from_millis(100),
        }
    }

    /// How often a paused run checks for resume. Default: 100ms.
    pub fn with_resume_poll(mut self, interval: Duration) -> Self {
        self.resume_poll = interval;
        self
    }

    pub fn job(&self) -> &JobHandle {
        &self.job
    }

    fn progress(&self) -> TodoProgress {
        self.job.with_todo(|list| list.progress())
    }

    pub async fn run(&self, step: &dyn Step) -> Result<RunOutcome, RunError> {
        let run_id = self.job.run_id();
        info!("Run {run_id}: starting ({})", self.progress());
        loop {
            // Safe point between items.
            if let Some(interrupt) = self.job.clear_interrupt()
                && let Reaction::Finish(outcome) = self.react(interrupt, None).await?
            {
                return Ok(outcome);
            }

            let Some(item) = self.job.with_todo(|list| list.next_pending().cloned()) else {
                let progress = self.progress();
                info!("Run {run_id}: completed ({progress})");
                return Ok(RunOutcome::Completed { progress });
            };
            self.job.with_todo(|list| list.start(&item.id))?;
            info!("Run {run_id}: started '{}'", item.description);

            loop {
                match step.run(&self.job, &item).await {
                    Ok(StepOutcome::Done(outputs)) => {
                        self.job.with_todo(|list| list.complete(&item.id, outputs))?;
                        debug!("Run {run_id}: finished '{}'", item.description);
                        break;
                    }
                    Ok(StepOutcome::Failed(error)) => {
                        warn!("Run {run_id}: '{}' failed: {error}", item.description);
                        self.job.with_todo(|list| list.fail(&item.id, error))?;
                        break;
                    }
                    Err(seen) => {
                        // A request made after the step observed `seen` wins.
                        let interrupt = self.job.clear_interrupt().unwrap_or(seen);
                        match self.react(interrupt, Some(&item)).await? {
                            Reaction::Retry => continue,
                            Reaction::Finish(outcome) => return Ok(outcome),
                        }
                    }
                }
            }
        }
    }

    /// Apply an interrupt to the run and, when given, the current item.
    async fn react(
        &self,
        interrupt: Interrupted,
        current: Option<&TodoItem>,
    ) -> Result<Reaction, RunError> {
        let mut interrupt = interrupt;
        loop {
            match interrupt.action {
                InterruptAction::Pause => {
                    if let Some(item) = current {
                        self.job.with_todo(|list| list.pause(&item.id))?;
                    }
                    info!("Run {}: paused", self.job.run_id());
                    match self.wait_for_resume().await {
                        Some(next) => interrupt = next,
                        None => {
                            if let Some(item) = current {
                                self.job.with_todo(|list| list.start(&item.id))?;
                            }
                            return Ok(Reaction::Retry);
                        }
                    }
                }
                InterruptAction::Stop => {
                    let cancelled = self.job.with_todo(|list| {
                        if let Some(item) = current {
                            let _ = list.cancel(&item.id);
                        }
                        list.cancel_remaining()
                    });
                    info!(
                        "Run {}: stopped ({cancelled} pending items cancelled)",
                        self.job.run_id()
                    );
                    return Ok(Reaction::Finish(RunOutcome::Stopped {
                        message: interrupt.message,
                        progress: self.progress(),
                    }));
                }
                InterruptAction::Redirect => {
                    if let Some(item) = current {
                        self.job.with_todo(|list| list.cancel(&item.id))?;
                    }
                    info!("Run {}: redirected", self.job.run_id());
                    return Ok(Reaction::Finish(RunOutcome::Redirected {
                        message: interrupt.message,
                        progress: self.progress(),
                    }));
                }
            }
        }
    }

    /// Wait until the run is resumed. A stop or redirect arriving meanwhile
    /// is returned instead.
    async fn wait_for_resume(&self) -> Option<Interrupted> {
        loop {
            match self.job.pending() {
                Some(next) if next.action != InterruptAction::Pause => {
                    self.job.clear_interrupt();
                    return Some(next);
                }
                Some(_) => {
                    self.job.clear_interrupt();
                }
                None => {}
            }
            if !self.job.is_paused() {
                return None;
            }
            self.clock.sleep(self.resume_poll).await;
        }
    }
}
