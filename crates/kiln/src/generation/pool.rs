//! Bounded worker pool executing generation tickets.
//!
//! [`TicketPool::submit`] records a ticket as `QUEUED` and pushes its id onto
//! an unbounded FIFO queue. A fixed number of worker tasks pull ids off the
//! queue, move the ticket to `PROCESSING`, and call the injected
//! [`Generator`]. Failures and panics are recorded on the ticket; they never
//! take down a worker.
//!
//! The ticket table is the single source of truth. Every status change goes
//! through it under one lock, then a [`TicketEvent`] is emitted to the
//! [`ProgressSink`] with the lock released.

use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::progress::{ProgressSink, TicketEvent};
use super::ticket::{Ticket, TicketStatus};
use crate::agent::interrupt::{InterruptSignal, Interrupted, NoInterrupt};
use crate::api::rate_limit::RateLimiter;
use crate::api::retry::{GenerationError, RetryConfig, retry_rate_limited};
use crate::clock::{Clock, Deadline, SystemClock};
use crate::ids::generate_id;

/// Opaque generator parameters.
pub type Params = serde_json::Map<String, serde_json::Value>;

/// Boxed future returned by [`Generator::generate`].
pub type GenerateFuture<'a> =
    Pin<Box<dyn Future<Output = Result<PathBuf, GenerationError>> + Send + 'a>>;

/// The external generation call: given a ticket, produce an artifact path.
///
/// Implementations that reach the network must take a rate-limit slot first;
/// wrap them in [`RateLimitedGenerator`].
pub trait Generator: Send + Sync {
    fn generate<'a>(
        &'a self,
        ticket: &'a Ticket,
        signal: &'a dyn InterruptSignal,
    ) -> GenerateFuture<'a>;
}

/// Adapts an async closure into a [`Generator`].
pub struct FnGenerator<F>(pub F);

impl<F, Fut> Generator for FnGenerator<F>
where
    F: Fn(Ticket) -> Fut + Send + Sync,
    Fut: Future<Output = Result<PathBuf, GenerationError>> + Send + 'static,
{
    fn generate<'a>(
        &'a self,
        ticket: &'a Ticket,
        _signal: &'a dyn InterruptSignal,
    ) -> GenerateFuture<'a> {
        Box::pin((self.0)(ticket.clone()))
    }
}

impl<G: Generator + ?Sized> Generator for Arc<G> {
    fn generate<'a>(
        &'a self,
        ticket: &'a Ticket,
        signal: &'a dyn InterruptSignal,
    ) -> GenerateFuture<'a> {
        (**self).generate(ticket, signal)
    }
}

/// Takes a rate-limit slot before every attempt of the wrapped generator,
/// retrying transient failures.
pub struct RateLimitedGenerator<G> {
    inner: G,
    limiter: Arc<RateLimiter>,
    retry: RetryConfig,
    acquire_timeout: Option<Duration>,
}

impl<G: Generator> RateLimitedGenerator<G> {
    pub fn new(
        inner: G,
        limiter: Arc<RateLimiter>,
        retry: RetryConfig,
        acquire_timeout: Option<Duration>,
    ) -> Self {
        Self {
            inner,
            limiter,
            retry,
            acquire_timeout,
        }
    }
}

impl<G: Generator> Generator for RateLimitedGenerator<G> {
    fn generate<'a>(
        &'a self,
        ticket: &'a Ticket,
        signal: &'a dyn InterruptSignal,
    ) -> GenerateFuture<'a> {
        Box::pin(retry_rate_limited(
            &self.limiter,
            &self.retry,
            self.acquire_timeout,
            signal,
            move || self.inner.generate(ticket, signal),
        ))
    }
}

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of worker tasks. Default: 4.
    pub workers: usize,
    /// Longest a single generation may run before the ticket ends in
    /// `TIMEOUT`. `None` disables the limit. Default: 10 minutes.
    pub ticket_timeout: Option<Duration>,
    /// Polling interval for `wait_for_*`. Default: 100ms.
    pub poll_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            ticket_timeout: Some(Duration::from_secs(600)),
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl PoolConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_ticket_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.ticket_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("ticket pool is shut down")]
    ShutDown,
}

/// Aggregate state of a batch, correlated by ticket id.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchSummary {
    pub batch_id: String,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub timed_out: usize,
    /// Tickets still queued or processing.
    pub pending: usize,
    pub tickets: Vec<Ticket>,
}

impl BatchSummary {
    fn from_tickets(batch_id: &str, mut tickets: Vec<Ticket>) -> Self {
        tickets.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        let mut summary = Self {
            batch_id: batch_id.to_string(),
            total: tickets.len(),
            ..Default::default()
        };
        for ticket in &tickets {
            match ticket.status {
                TicketStatus::Completed => summary.completed += 1,
                TicketStatus::Failed => summary.failed += 1,
                TicketStatus::Cancelled => summary.cancelled += 1,
                TicketStatus::Timeout => summary.timed_out += 1,
                TicketStatus::Queued | TicketStatus::Processing => summary.pending += 1,
            }
        }
        summary.tickets = tickets;
        summary
    }

    /// Every ticket reached a terminal state.
    pub fn is_finished(&self) -> bool {
        self.pending == 0
    }

    pub fn ticket(&self, id: &str) -> Option<&Ticket> {
        self.tickets.iter().find(|t| t.id == id)
    }

    /// Artifact paths of completed tickets.
    pub fn artifacts(&self) -> Vec<PathBuf> {
        self.tickets
            .iter()
            .filter(|t| t.status == TicketStatus::Completed)
            .filter_map(|t| t.artifact.clone())
            .collect()
    }

    /// One-line summary, e.g. `batch b1: 3/4 completed, 1 failed, 0 cancelled`.
    pub fn to_log_string(&self) -> String {
        let mut s = format!(
            "batch {}: {}/{} completed, {} failed, {} cancelled",
            self.batch_id, self.completed, self.total, self.failed, self.cancelled
        );
        if self.timed_out > 0 {
            s.push_str(&format!(", {} timed out", self.timed_out));
        }
        if self.pending > 0 {
            s.push_str(&format!(", {} pending", self.pending));
        }
        s
    }
}

struct Entry {
    ticket: Ticket,
    signal: Arc<dyn InterruptSignal>,
}

struct PoolInner {
    table: Mutex<HashMap<String, Entry>>,
    generator: Arc<dyn Generator>,
    sink: Arc<dyn ProgressSink>,
    config: PoolConfig,
}

impl PoolInner {
    fn table(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, ticket: &Ticket) {
        let event = TicketEvent::from_ticket(ticket);
        let delivered =
            std::panic::catch_unwind(AssertUnwindSafe(|| self.sink.on_event(&event)));
        if delivered.is_err() {
            warn!("Progress sink panicked on {} for {}", event.status, event.ticket_id);
        }
    }

    /// Apply a lifecycle move and emit it. `None` if the ticket is gone or
    /// the move is not allowed from its current status.
    fn transition(
        &self,
        id: &str,
        to: TicketStatus,
        update: impl FnOnce(&mut Ticket),
    ) -> Option<Ticket> {
        let mut table = self.table();
        let ticket = &mut table.get_mut(id)?.ticket;
        if !ticket.advance(to) {
            trace!("Ticket {id}: {} -> {to} refused", ticket.status);
            return None;
        }
        update(ticket);
        // Emitted under the table lock so a ticket's events stay ordered.
        self.emit(ticket);
        Some(ticket.clone())
    }

    async fn process(&self, worker: usize, id: &str) {
        let signal = match self.table().get(id) {
            Some(entry) => entry.signal.clone(),
            None => return,
        };
        if let Err(interrupt) = signal.check() {
            self.transition(id, TicketStatus::Cancelled, |t| {
                t.error = Some(interrupt.to_string());
            });
            return;
        }
        let Some(ticket) = self.transition(id, TicketStatus::Processing, |_| {}) else {
            debug!("Worker {worker}: skipping ticket {id} (no longer queued)");
            return;
        };
        debug!("Worker {worker}: processing ticket {id}");

        let run = AssertUnwindSafe(self.generator.generate(&ticket, signal.as_ref())).catch_unwind();
        let outcome = match self.config.ticket_timeout {
            Some(limit) => tokio::time::timeout(limit, run).await.ok(),
            None => Some(run.await),
        };

        let finished = match outcome {
            Some(Ok(Ok(path))) => self.transition(id, TicketStatus::Completed, |t| {
                t.artifact = Some(path);
            }),
            Some(Ok(Err(e))) => self.transition(id, TicketStatus::Failed, |t| {
                t.error = Some(e.to_string());
            }),
            Some(Err(payload)) => {
                let message = panic_message(payload.as_ref());
                warn!("Worker {worker}: generator panicked on ticket {id}: {message}");
                self.transition(id, TicketStatus::Failed, |t| {
                    t.error = Some(format!("generator panicked: {message}"));
                })
            }
            None => self.transition(id, TicketStatus::Timeout, |t| {
                let secs = self.config.ticket_timeout.unwrap_or_default().as_secs();
                t.error = Some(format!("generation timed out after {secs}s"));
            }),
        };
        if finished.is_none() {
            debug!("Worker {worker}: ticket {id} was removed before it finished");
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".into()
    }
}

type SharedReceiver = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>>;

async fn worker_loop(worker: usize, inner: Arc<PoolInner>, queue: SharedReceiver) {
    trace!("Worker {worker} started");
    loop {
        let next = queue.lock().await.recv().await;
        let Some(id) = next else { break };
        inner.process(worker, &id).await;
    }
    trace!("Worker {worker} stopped");
}

/// Fixed-size pool of generation workers.
///
/// Must be started inside a tokio runtime.
///
/// # Example
///
/// ```ignore
/// let pool = TicketPool::start(PoolConfig::default(), generator, Arc::new(LoggingSink));
/// let batch = TicketPool::new_batch_id();
/// for prompt in prompts {
///     pool.submit(prompt, Params::new(), Some(&batch))?;
/// }
/// let summary = pool.wait_for_batch(&batch, Some(Duration::from_secs(300))).await;
/// pool.cleanup_batch(&batch);
/// ```
pub struct TicketPool {
    inner: Arc<PoolInner>,
    queue: Mutex<Option<mpsc::UnboundedSender<String>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for TicketPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TicketPool")
            .field("config", &self.inner.config)
            .field("tickets", &self.inner.table().len())
            .finish()
    }
}

impl TicketPool {
    pub fn start(
        config: PoolConfig,
        generator: Arc<dyn Generator>,
        sink: Arc<dyn ProgressSink>,
    ) -> Self {
        Self::start_with_clock(config, generator, sink, SystemClock::shared())
    }

    /// Start the pool with an injected clock for the `wait_for_*` loops.
    pub fn start_with_clock(
        config: PoolConfig,
        generator: Arc<dyn Generator>,
        sink: Arc<dyn ProgressSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let workers = config.workers.max(1);
        let (tx, rx) = mpsc::unbounded_channel();
        let queue: SharedReceiver = Arc::new(tokio::sync::Mutex::new(rx));
        let inner = Arc::new(PoolInner {
            table: Mutex::new(HashMap::new()),
            generator,
            sink,
            config,
        });
        let handles = (0..workers)
            .map(|n| tokio::spawn(worker_loop(n, inner.clone(), queue.clone())))
            .collect();
        info!("Ticket pool started with {workers} workers");
        Self {
            inner,
            queue: Mutex::new(Some(tx)),
            workers: Mutex::new(handles),
            clock,
        }
    }

    /// A fresh batch id.
    pub fn new_batch_id() -> String {
        generate_id("batch")
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    // ── Submission ──────────────────────────────────────────────────

    /// Enqueue a ticket. Never blocks.
    pub fn submit(
        &self,
        prompt: impl Into<String>,
        params: Params,
        batch_id: Option<&str>,
    ) -> Result<String, PoolError> {
        self.submit_with_signal(prompt, params, batch_id, Arc::new(NoInterrupt))
    }

    /// Enqueue a ticket whose generation observes `signal`.
    ///
    /// A ticket whose signal is set when a worker picks it up is cancelled
    /// without calling the generator.
    pub fn submit_with_signal(
        &self,
        prompt: impl Into<String>,
        params: Params,
        batch_id: Option<&str>,
        signal: Arc<dyn InterruptSignal>,
    ) -> Result<String, PoolError> {
        let tx = self
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(PoolError::ShutDown)?;

        let id = generate_id("tk");
        let ticket = Ticket::new(
            id.clone(),
            prompt.into(),
            params,
            batch_id.map(str::to_string),
        );
        {
            let mut table = self.inner.table();
            self.inner.emit(&ticket);
            table.insert(id.clone(), Entry { ticket, signal });
        }

        if tx.send(id.clone()).is_err() {
            self.inner.transition(&id, TicketStatus::Cancelled, |t| {
                t.error = Some(PoolError::ShutDown.to_string());
            });
            return Err(PoolError::ShutDown);
        }
        debug!("Ticket {id} queued (batch {})", batch_id.unwrap_or("-"));
        Ok(id)
    }

    // ── Cancellation ────────────────────────────────────────────────

    /// Cancel every still-queued ticket of the batch. Tickets already
    /// processing run to completion. Returns how many were cancelled.
    pub fn cancel_batch(&self, batch_id: &str) -> usize {
        let cancelled = self.cancel_where(|t| t.in_batch(batch_id));
        if !cancelled.is_empty() {
            info!("Cancelled {} queued tickets in batch {batch_id}", cancelled.len());
        }
        cancelled.len()
    }

    /// Cancel one ticket if it is still queued.
    pub fn cancel_ticket(&self, id: &str) -> bool {
        self.inner
            .transition(id, TicketStatus::Cancelled, |t| {
                t.error = Some("cancelled".into());
            })
            .is_some()
    }

    fn cancel_where(&self, select: impl Fn(&Ticket) -> bool) -> Vec<Ticket> {
        let mut cancelled = Vec::new();
        let mut table = self.inner.table();
        for ticket in table.values_mut().map(|entry| &mut entry.ticket) {
            if select(ticket) && ticket.advance(TicketStatus::Cancelled) {
                ticket.error = Some("cancelled".into());
                self.inner.emit(ticket);
                cancelled.push(ticket.clone());
            }
        }
        cancelled
    }

    // ── Queries ─────────────────────────────────────────────────────

    pub fn get(&self, id: &str) -> Option<Ticket> {
        self.inner.table().get(id).map(|e| e.ticket.clone())
    }

    pub fn batch_summary(&self, batch_id: &str) -> BatchSummary {
        let tickets = self
            .inner
            .table()
            .values()
            .filter(|e| e.ticket.in_batch(batch_id))
            .map(|e| e.ticket.clone())
            .collect();
        BatchSummary::from_tickets(batch_id, tickets)
    }

    /// Number of tickets in the table.
    pub fn len(&self) -> usize {
        self.inner.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ── Waiting ─────────────────────────────────────────────────────

    /// Wait until the ticket is terminal or `timeout` elapses.
    ///
    /// Returns the ticket as last seen, terminal or not. `None` if the id is
    /// unknown (or was cleaned up).
    pub async fn wait_for_ticket(&self, id: &str, timeout: Option<Duration>) -> Option<Ticket> {
        let deadline = Deadline::after(self.clock.as_ref(), timeout);
        loop {
            let ticket = self.get(id)?;
            if ticket.is_terminal() || deadline.is_expired(self.clock.as_ref()) {
                return Some(ticket);
            }
            self.pause(&deadline).await;
        }
    }

    /// Wait until every ticket in the batch is terminal or `timeout` elapses.
    ///
    /// On timeout the partial summary is returned; check
    /// [`BatchSummary::is_finished`].
    pub async fn wait_for_batch(&self, batch_id: &str, timeout: Option<Duration>) -> BatchSummary {
        match self
            .wait_for_batch_interruptible(batch_id, timeout, &NoInterrupt)
            .await
        {
            Ok(summary) => summary,
            Err(_) => self.batch_summary(batch_id),
        }
    }

    /// Like [`wait_for_batch`](Self::wait_for_batch), checking `signal` on
    /// every poll. Cancels nothing by itself.
    pub async fn wait_for_batch_interruptible(
        &self,
        batch_id: &str,
        timeout: Option<Duration>,
        signal: &dyn InterruptSignal,
    ) -> Result<BatchSummary, Interrupted> {
        let deadline = Deadline::after(self.clock.as_ref(), timeout);
        loop {
            signal.check()?;
            let summary = self.batch_summary(batch_id);
            if summary.is_finished() {
                return Ok(summary);
            }
            if deadline.is_expired(self.clock.as_ref()) {
                debug!("Wait for batch timed out: {}", summary.to_log_string());
                return Ok(summary);
            }
            self.pause(&deadline).await;
        }
    }

    async fn pause(&self, deadline: &Deadline) {
        let step = deadline.clamp(self.clock.as_ref(), self.inner.config.poll_interval);
        self.clock.sleep(step).await;
    }

    // ── Housekeeping ────────────────────────────────────────────────

    /// Drop the batch's terminal tickets from the table. Tickets still
    /// queued or processing are kept. Returns how many were removed.
    pub fn cleanup_batch(&self, batch_id: &str) -> usize {
        let mut table = self.inner.table();
        let before = table.len();
        table.retain(|_, e| !(e.ticket.in_batch(batch_id) && e.ticket.is_terminal()));
        let removed = before - table.len();
        debug!("Cleaned up {removed} tickets from batch {batch_id}");
        removed
    }

    /// Stop accepting work, cancel queued tickets, and wait for workers to
    /// finish their in-flight tickets.
    pub async fn shutdown(&self) {
        let sender = self.queue.lock().unwrap_or_else(|e| e.into_inner()).take();
        if sender.is_none() {
            return;
        }
        drop(sender);
        let cancelled = self.cancel_where(|_| true);
        let handles = std::mem::take(&mut *self.workers.lock().unwrap_or_else(|e| e.into_inner()));
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Pool worker ended abnormally: {e}");
            }
        }
        info!(
            "Ticket pool shut down ({} queued tickets cancelled)",
            cancelled.len()
        );
    }

    pub fn is_shut_down(&self) -> bool {
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::interrupt::InterruptAction;
    use crate::agent::job::JobHandle;
    use crate::api::rate_limit::RateLimitConfig;
    use crate::clock::ManualClock;
    use crate::generation::progress::FnProgressSink;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    type Events = Arc<Mutex<Vec<TicketEvent>>>;

    fn recording_sink() -> (Arc<dyn ProgressSink>, Events) {
        let events: Events = Arc::default();
        let sink: Arc<dyn ProgressSink> = {
            let events = events.clone();
            Arc::new(FnProgressSink(move |e: &TicketEvent| {
                events.lock().unwrap().push(e.clone())
            }))
        };
        (sink, events)
    }

    fn pool(workers: usize, generator: impl Generator + 'static) -> (TicketPool, Events) {
        let (sink, events) = recording_sink();
        let config = PoolConfig::default().with_workers(workers);
        let pool = TicketPool::start_with_clock(
            config,
            Arc::new(generator),
            sink,
            Arc::new(ManualClock::new()),
        );
        (pool, events)
    }

    fn ok_generator(calls: Arc<AtomicUsize>) -> impl Generator {
        FnGenerator(move |ticket: Ticket| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok::<_, GenerationError>(PathBuf::from(format!("/tmp/{}.png", ticket.id))) }
        })
    }

    fn statuses_for(events: &Events, id: &str) -> Vec<TicketStatus> {
        events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.ticket_id == id)
            .map(|e| e.status)
            .collect()
    }

    #[tokio::test]
    async fn batch_completes_and_reports_each_transition() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (pool, events) = pool(3, ok_generator(calls.clone()));
        let batch = TicketPool::new_batch_id();
        let ids: Vec<String> = (0..5)
            .map(|i| pool.submit(format!("shot {i}"), Params::new(), Some(&batch)).unwrap())
            .collect();

        let summary = pool.wait_for_batch(&batch, None).await;
        assert!(summary.is_finished());
        assert_eq!(summary.completed, 5);
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        for id in &ids {
            assert_eq!(
                statuses_for(&events, id),
                vec![TicketStatus::Queued, TicketStatus::Processing, TicketStatus::Completed]
            );
            let ticket = summary.ticket(id).unwrap();
            assert_eq!(ticket.artifact, Some(PathBuf::from(format!("/tmp/{id}.png"))));
        }
        assert_eq!(summary.artifacts().len(), 5);
    }

    #[tokio::test]
    async fn cancel_before_start_never_invokes_generator() {
        // Hold every worker on a gate ticket so the batch stays queued.
        let gate = Arc::new(Notify::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let generator = {
            let (gate, calls) = (gate.clone(), calls.clone());
            FnGenerator(move |ticket: Ticket| {
                let gate = gate.clone();
                if ticket.batch_id.as_deref() != Some("gate") {
                    calls.fetch_add(1, Ordering::SeqCst);
                }
                async move {
                    gate.notified().await;
                    Ok::<_, GenerationError>(PathBuf::from("/tmp/gate.png"))
                }
            })
        };
        let (pool, _) = pool(1, generator);
        let blocker = pool.submit("blocker", Params::new(), Some("gate")).unwrap();
        while pool.get(&blocker).unwrap().status != TicketStatus::Processing {
            tokio::task::yield_now().await;
        }

        for i in 0..4 {
            pool.submit(format!("shot {i}"), Params::new(), Some("b1")).unwrap();
        }
        assert_eq!(pool.cancel_batch("b1"), 4);
        gate.notify_one();

        let summary = pool.wait_for_batch("b1", None).await;
        assert_eq!(summary.cancelled, 4);
        assert_eq!(summary.completed + summary.failed + summary.cancelled, 4);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(pool.wait_for_ticket(&blocker, None).await.unwrap().is_terminal());
    }

    #[tokio::test]
    async fn failures_and_panics_are_captured_per_ticket() {
        let generator = FnGenerator(|ticket: Ticket| async move {
            match ticket.prompt.as_str() {
                "fail" => Err(GenerationError::http(400, "bad prompt")),
                "panic" => panic!("generator blew up"),
                _ => Ok::<_, GenerationError>(PathBuf::from("/tmp/ok.png")),
            }
        });
        let (pool, _) = pool(2, generator);
        let fail = pool.submit("fail", Params::new(), Some("b")).unwrap();
        let boom = pool.submit("panic", Params::new(), Some("b")).unwrap();
        let ok = pool.submit("ok", Params::new(), Some("b")).unwrap();

        let summary = pool.wait_for_batch("b", None).await;
        assert_eq!((summary.completed, summary.failed), (1, 2));
        assert_eq!(
            summary.ticket(&fail).unwrap().error.as_deref(),
            Some("HTTP 400: bad prompt")
        );
        assert!(summary.ticket(&boom).unwrap().error.as_deref().unwrap().contains("generator blew up"));
        assert_eq!(summary.ticket(&ok).unwrap().status, TicketStatus::Completed);

        // Workers survive: the pool still processes new work.
        let after = pool.submit("ok", Params::new(), None).unwrap();
        let ticket = pool.wait_for_ticket(&after, None).await.unwrap();
        assert_eq!(ticket.status, TicketStatus::Completed);
    }

    #[tokio::test]
    async fn slow_generation_times_out() {
        let generator = FnGenerator(|_: Ticket| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<_, GenerationError>(PathBuf::from("/tmp/never.png"))
        });
        let (sink, _) = recording_sink();
        let config = PoolConfig::default()
            .with_workers(1)
            .with_ticket_timeout(Some(Duration::from_millis(20)))
            .with_poll_interval(Duration::from_millis(5));
        let pool = TicketPool::start(config, Arc::new(generator), sink);

        let id = pool.submit("slow", Params::new(), None).unwrap();
        let ticket = pool.wait_for_ticket(&id, Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(ticket.status, TicketStatus::Timeout);
    }

    #[tokio::test]
    async fn wait_returns_partial_state_on_timeout() {
        let gate = Arc::new(Notify::new());
        let generator = {
            let gate = gate.clone();
            FnGenerator(move |_: Ticket| {
                let gate = gate.clone();
                async move {
                    gate.notified().await;
                    Ok::<_, GenerationError>(PathBuf::from("/tmp/x.png"))
                }
            })
        };
        let (pool, _) = pool(1, generator);
        let id = pool.submit("held", Params::new(), Some("b")).unwrap();

        let summary = pool.wait_for_batch("b", Some(Duration::from_secs(1))).await;
        assert!(!summary.is_finished());
        assert_eq!(summary.pending, 1);

        let ticket = pool.wait_for_ticket(&id, Some(Duration::from_secs(1))).await.unwrap();
        assert!(!ticket.is_terminal());
        assert!(pool.wait_for_ticket("tk-unknown", None).await.is_none());
        gate.notify_one();
    }

    #[tokio::test]
    async fn cleanup_keeps_in_flight_tickets() {
        let gate = Arc::new(Notify::new());
        let generator = {
            let gate = gate.clone();
            FnGenerator(move |ticket: Ticket| {
                let gate = gate.clone();
                async move {
                    if ticket.prompt == "slow" {
                        gate.notified().await;
                    }
                    Ok::<_, GenerationError>(PathBuf::from("/tmp/x.png"))
                }
            })
        };
        let (pool, _) = pool(2, generator);
        let fast = pool.submit("fast", Params::new(), Some("b")).unwrap();
        let slow = pool.submit("slow", Params::new(), Some("b")).unwrap();
        pool.wait_for_ticket(&fast, None).await;
        while pool.get(&slow).unwrap().status != TicketStatus::Processing {
            tokio::task::yield_now().await;
        }

        assert_eq!(pool.cleanup_batch("b"), 1);
        assert!(pool.get(&fast).is_none());
        assert_eq!(pool.get(&slow).unwrap().status, TicketStatus::Processing);

        gate.notify_one();
        let done = pool.wait_for_ticket(&slow, None).await.unwrap();
        assert_eq!(done.status, TicketStatus::Completed);
        assert_eq!(pool.cleanup_batch("b"), 1);
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn interrupted_wait_propagates_and_signal_cancels_unstarted_work() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (pool, _) = pool(1, ok_generator(calls.clone()));
        let job = JobHandle::new("run-1", "campaign");
        job.request_interrupt(InterruptAction::Stop, None);

        let id = pool
            .submit_with_signal("shot", Params::new(), Some("b"), Arc::new(job.clone()))
            .unwrap();
        let err = pool
            .wait_for_batch_interruptible("b", None, &job)
            .await
            .unwrap_err();
        assert_eq!(err.action, InterruptAction::Stop);

        let ticket = pool.wait_for_ticket(&id, None).await.unwrap();
        assert_eq!(ticket.status, TicketStatus::Cancelled);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn rate_limited_generator_takes_a_slot_per_ticket() {
        let clock = Arc::new(ManualClock::new());
        let limiter = Arc::new(RateLimiter::with_clock(
            RateLimitConfig::default().with_max_per_minute(2),
            clock.clone(),
        ));
        let calls = Arc::new(AtomicUsize::new(0));
        let generator = RateLimitedGenerator::new(
            ok_generator(calls.clone()),
            limiter.clone(),
            RetryConfig::with_retries(0),
            Some(Duration::from_secs(1)),
        );
        let (pool, _) = pool(1, generator);
        for i in 0..3 {
            pool.submit(format!("shot {i}"), Params::new(), Some("b")).unwrap();
        }

        let summary = pool.wait_for_batch("b", None).await;
        assert_eq!((summary.completed, summary.failed), (2, 1));
        let failed = summary
            .tickets
            .iter()
            .find(|t| t.status == TicketStatus::Failed)
            .unwrap();
        assert!(failed.error.as_deref().unwrap().contains("rate-limit slot"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn shutdown_cancels_queue_and_rejects_submissions() {
        let gate = Arc::new(Notify::new());
        let generator = {
            let gate = gate.clone();
            FnGenerator(move |_: Ticket| {
                let gate = gate.clone();
                async move {
                    gate.notified().await;
                    Ok::<_, GenerationError>(PathBuf::from("/tmp/x.png"))
                }
            })
        };
        let (pool, _) = pool(1, generator);
        let running = pool.submit("running", Params::new(), Some("b")).unwrap();
        while pool.get(&running).unwrap().status != TicketStatus::Processing {
            tokio::task::yield_now().await;
        }
        let queued = pool.submit("queued", Params::new(), Some("b")).unwrap();

        gate.notify_one();
        pool.shutdown().await;

        assert!(pool.is_shut_down());
        assert_eq!(pool.get(&queued).unwrap().status, TicketStatus::Cancelled);
        assert_eq!(pool.get(&running).unwrap().status, TicketStatus::Completed);
        assert_eq!(
            pool.submit("late", Params::new(), None),
            Err(PoolError::ShutDown)
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn queued_event_precedes_a_racing_cancel() {
        let generator =
            FnGenerator(|_: Ticket| std::future::pending::<Result<PathBuf, GenerationError>>());
        let (pool, events) = pool(1, generator);
        let pool = Arc::new(pool);
        let done = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let canceller = {
            let (pool, done) = (pool.clone(), done.clone());
            std::thread::spawn(move || {
                while !done.load(Ordering::SeqCst) {
                    pool.cancel_batch("b");
                }
            })
        };

        let ids: Vec<String> = (0..200)
            .map(|i| pool.submit(format!("shot {i}"), Params::new(), Some("b")).unwrap())
            .collect();
        done.store(true, Ordering::SeqCst);
        canceller.join().unwrap();
        pool.cancel_batch("b");

        for id in &ids {
            let seen = statuses_for(&events, id);
            assert_eq!(seen.first(), Some(&TicketStatus::Queued), "{id}: {seen:?}");
            if pool.get(id).unwrap().status == TicketStatus::Cancelled {
                assert_eq!(seen, vec![TicketStatus::Queued, TicketStatus::Cancelled]);
            }
        }
    }
}
