//! Owned bundle of the shared components a deployment runs with.
//!
//! There are no process-wide singletons: one [`GenerationRuntime`] owns the
//! rate limiter, the ticket pool, the approval gate, the job registry and the
//! context budget manager. Everything that needs one of them receives an
//! `Arc` from here. [`GenerationRuntime::rebuild`] swaps in fresh instances,
//! which is how tests isolate themselves.

use std::sync::Arc;
use tracing::info;

use crate::agent::approval::ApprovalGate;
use crate::agent::job::{JobHandle, JobRegistry};
use crate::api::rate_limit::RateLimiter;
use crate::clock::{Clock, SystemClock};
use crate::config::RuntimeConfig;
use crate::context::budget::ContextBudgetManager;
use crate::generation::pool::{Generator, RateLimitedGenerator, TicketPool};
use crate::generation::progress::ProgressSink;
use crate::tools::approval::approval_required;
use crate::tools::core::ToolSet;
use crate::tools::generate::GenerateTool;
use crate::tools::todo::TodoTool;

pub struct GenerationRuntime {
    config: RuntimeConfig,
    generator: Arc<dyn Generator>,
    sink: Arc<dyn ProgressSink>,
    clock: Arc<dyn Clock>,
    limiter: Arc<RateLimiter>,
    pool: Arc<TicketPool>,
    approvals: Arc<ApprovalGate>,
    jobs: JobRegistry,
    context: ContextBudgetManager,
}

impl GenerationRuntime {
    /// Build a runtime. Must be called inside a tokio runtime (the pool
    /// spawns its workers immediately).
    pub fn build(
        config: RuntimeConfig,
        generator: Arc<dyn Generator>,
        sink: Arc<dyn ProgressSink>,
    ) -> Self {
        Self::build_with_clock(config, generator, sink, SystemClock::shared())
    }

    /// Build with an injected clock shared by the limiter, the pool's wait
    /// loops and the approval gate.
    pub fn build_with_clock(
        config: RuntimeConfig,
        generator: Arc<dyn Generator>,
        sink: Arc<dyn ProgressSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        info!("Building generation runtime: {}", config.to_log_string());
        let (limiter, pool, approvals) = Self::components(&config, &generator, &sink, &clock);
        Self {
            context: ContextBudgetManager::new(config.context.clone()),
            config,
            generator,
            sink,
            clock,
            limiter,
            pool,
            approvals,
            jobs: JobRegistry::new(),
        }
    }

    fn components(
        config: &RuntimeConfig,
        generator: &Arc<dyn Generator>,
        sink: &Arc<dyn ProgressSink>,
        clock: &Arc<dyn Clock>,
    ) -> (Arc<RateLimiter>, Arc<TicketPool>, Arc<ApprovalGate>) {
        let limiter = Arc::new(RateLimiter::with_clock(
            config.rate_limit.clone(),
            clock.clone(),
        ));
        // Every attempt, retries included, goes through the limiter.
        let limited = RateLimitedGenerator::new(
            generator.clone(),
            limiter.clone(),
            config.retry.clone(),
            config.acquire_timeout(),
        );
        let pool = Arc::new(TicketPool::start_with_clock(
            config.pool.clone(),
            Arc::new(limited),
            sink.clone(),
            clock.clone(),
        ));
        let approvals = Arc::new(ApprovalGate::with_clock(
            config.approval.clone(),
            clock.clone(),
        ));
        (limiter, pool, approvals)
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn pool(&self) -> &Arc<TicketPool> {
        &self.pool
    }

    pub fn approvals(&self) -> &Arc<ApprovalGate> {
        &self.approvals
    }

    pub fn jobs(&self) -> &JobRegistry {
        &self.jobs
    }

    pub fn context(&self) -> &ContextBudgetManager {
        &self.context
    }

    /// Register a run and return its handle.
    pub fn start_run(&self, run_id: impl Into<String>, job_type: impl Into<String>) -> JobHandle {
        self.jobs.start_run(run_id, job_type)
    }

    /// The standard tool set for one run: `todo`, and `generate_image`
    /// behind the approval gate.
    pub fn tool_set(&self, job: &JobHandle) -> ToolSet {
        let generate = GenerateTool::new(self.pool.clone(), job.clone());
        ToolSet::new()
            .with(TodoTool::new(job.clone()))
            .with(approval_required(
                generate,
                self.approvals.clone(),
                Some(job.clone()),
            ))
    }

    /// Shut everything down and start over with fresh components.
    ///
    /// Queued tickets are cancelled, in-flight ones are allowed to finish,
    /// the limiter forgets its grants and all runs are dropped.
    pub async fn rebuild(&mut self) {
        self.shutdown().await;
        let (limiter, pool, approvals) =
            Self::components(&self.config, &self.generator, &self.sink, &self.clock);
        self.limiter = limiter;
        self.pool = pool;
        self.approvals = approvals;
        self.jobs = JobRegistry::new();
        self.context = ContextBudgetManager::new(self.config.context.clone());
        info!("Generation runtime rebuilt");
    }

    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
        self.limiter.reset();
        self.jobs.clear();
    }
}

impl std::fmt::Debug for GenerationRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationRuntime")
            .field("pool", &self.pool)
            .field("limiter", &self.limiter)
            .field("runs", &self.jobs.run_ids())
            .finish_non_exhaustive()
    }
}
