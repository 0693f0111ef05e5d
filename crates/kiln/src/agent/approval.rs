//! Human approval gate: publish a request, poll for a decision.
//!
//! The protocol mirrors a question-and-poll flow between the run and an
//! approval-delivering side (usually a UI bridge):
//!
//! ```text
//! run (tool call) ──publish──▶ JobState.pending_approval ◀──reads── UI
//! run (polling)   ◀──reads─── JobState.approval_response ◀──writes── UI
//! ```
//!
//! [`ApprovalGate::request_approval`] blocks the calling task, polling every
//! [`ApprovalConfig::poll_interval`] against a monotonic deadline. Each poll
//! also checks the run's interrupt signal. The pending slot is cleared by a
//! drop guard, so it is released on success, timeout, interrupt, and when the
//! waiting future is dropped mid-poll.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::interrupt::{InterruptSignal, Interrupted};
use super::job::JobHandle;
use crate::clock::{Clock, Deadline, SystemClock};
use crate::ids::generate_id;

/// Default time a request waits for a decision.
pub const DEFAULT_APPROVAL_TIMEOUT: Duration = Duration::from_secs(300);

/// Default polling interval while waiting.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Approval gate configuration.
#[derive(Debug, Clone)]
pub struct ApprovalConfig {
    /// How long a request waits before timing out. Default: 5 minutes.
    pub timeout: Duration,
    /// How often the waiting task re-checks the slot. Default: 100ms.
    pub poll_interval: Duration,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_APPROVAL_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl ApprovalConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// The decision delivered for an approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalAction {
    Approve,
    Reject,
    /// Approve with a replacement prompt.
    Edit,
    /// Approve this and every later request in the run.
    ApproveAll,
    /// Granted without asking because the run is in autonomy mode.
    AutoApproved,
}

impl fmt::Display for ApprovalAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Approve => write!(f, "approve"),
            Self::Reject => write!(f, "reject"),
            Self::Edit => write!(f, "edit"),
            Self::ApproveAll => write!(f, "approve_all"),
            Self::AutoApproved => write!(f, "auto_approved"),
        }
    }
}

/// A decision plus the edited prompt when the action is [`ApprovalAction::Edit`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalResult {
    pub action: ApprovalAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_prompt: Option<String>,
}

impl ApprovalResult {
    fn of(action: ApprovalAction) -> Self {
        Self {
            action,
            modified_prompt: None,
        }
    }

    pub fn approve() -> Self {
        Self::of(ApprovalAction::Approve)
    }

    pub fn reject() -> Self {
        Self::of(ApprovalAction::Reject)
    }

    pub fn approve_all() -> Self {
        Self::of(ApprovalAction::ApproveAll)
    }

    pub fn auto_approved() -> Self {
        Self::of(ApprovalAction::AutoApproved)
    }

    pub fn edit(prompt: impl Into<String>) -> Self {
        Self {
            action: ApprovalAction::Edit,
            modified_prompt: Some(prompt.into()),
        }
    }

    /// Whether the gated work should run.
    pub fn allows_execution(&self) -> bool {
        self.action != ApprovalAction::Reject
    }

    /// A modified prompt is present exactly when the action is `Edit`.
    pub(crate) fn validate(&self) -> Result<(), ApprovalError> {
        match (self.action, &self.modified_prompt) {
            (ApprovalAction::Edit, Some(_)) => Ok(()),
            (ApprovalAction::Edit, None) => Err(ApprovalError::InvalidResponse(
                "edit requires a modified prompt".into(),
            )),
            (_, Some(_)) => Err(ApprovalError::InvalidResponse(format!(
                "modified prompt is only allowed with edit, got {}",
                self.action
            ))),
            (_, None) => Ok(()),
        }
    }
}

/// A published request waiting for a decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub run_id: String,
    pub tool_name: String,
    pub prompt: String,
    /// Reference to a preview artifact the approver can inspect.
    pub preview: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Errors from the approval protocol.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApprovalError {
    /// Another request is already outstanding for this run.
    #[error("approval for '{pending_tool}' is already pending on run '{run_id}'")]
    AlreadyPending { run_id: String, pending_tool: String },

    #[error("approval for '{tool_name}' timed out after {}s", .timeout.as_secs())]
    TimedOut { tool_name: String, timeout: Duration },

    #[error(transparent)]
    Interrupted(#[from] Interrupted),

    #[error("no approval is pending on run '{run_id}'")]
    NoPendingRequest { run_id: String },

    #[error("approval request '{request_id}' is not the pending request")]
    UnknownRequest { request_id: String },

    #[error("invalid approval response: {0}")]
    InvalidResponse(String),
}

/// Blocking request/response gate for sensitive actions.
///
/// # Example
///
/// ```ignore
/// let gate = ApprovalGate::new(ApprovalConfig::default());
/// match gate.request_approval(&job, "generate_video", prompt, None, None).await {
///     Ok(result) if result.allows_execution() => { /* run it */ }
///     Ok(_) => { /* rejected */ }
///     Err(ApprovalError::Interrupted(i)) => return Err(i),
///     Err(e) => { /* report e to the caller */ }
/// }
/// ```
#[derive(Debug)]
pub struct ApprovalGate {
    config: ApprovalConfig,
    clock: Arc<dyn Clock>,
}

impl ApprovalGate {
    pub fn new(config: ApprovalConfig) -> Self {
        Self::with_clock(config, SystemClock::shared())
    }

    pub fn with_clock(config: ApprovalConfig, clock: Arc<dyn Clock>) -> Self {
        Self { config, clock }
    }

    pub fn config(&self) -> &ApprovalConfig {
        &self.config
    }

    /// Ask for a decision and wait for it.
    ///
    /// `timeout` overrides [`ApprovalConfig::timeout`] when given. Autonomy
    /// mode returns [`ApprovalAction::AutoApproved`] without publishing.
    pub async fn request_approval(
        &self,
        job: &JobHandle,
        tool_name: &str,
        prompt: &str,
        preview: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<ApprovalResult, ApprovalError> {
        let timeout = timeout.unwrap_or(self.config.timeout);
        let slot = {
            let mut state = job.lock();
            if state.autonomous {
                debug!("Auto-approving {tool_name} (autonomy mode)");
                return Ok(ApprovalResult::auto_approved());
            }
            if let Some(ref pending) = state.pending_approval {
                warn!(
                    "Rejecting approval for {tool_name}: {} already pending",
                    pending.tool_name
                );
                return Err(ApprovalError::AlreadyPending {
                    run_id: state.run_id.clone(),
                    pending_tool: pending.tool_name.clone(),
                });
            }
            let created_at = Utc::now();
            let request = ApprovalRequest {
                id: generate_id("ap"),
                run_id: state.run_id.clone(),
                tool_name: tool_name.to_string(),
                prompt: prompt.to_string(),
                preview: preview.map(str::to_string),
                created_at,
                expires_at: chrono::Duration::from_std(timeout)
                    .ok()
                    .and_then(|t| created_at.checked_add_signed(t))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC),
            };
            info!("Approval requested for {tool_name} ({})", request.id);
            let slot = PendingSlot {
                job,
                request_id: request.id.clone(),
            };
            state.approval_response = None;
            state.pending_approval = Some(request);
            slot
        };

        let deadline = Deadline::after(self.clock.as_ref(), Some(timeout));
        loop {
            job.check()?;

            if let Some(result) = slot.take_response() {
                info!("Approval for {tool_name}: {}", result.action);
                if result.action == ApprovalAction::ApproveAll {
                    job.set_autonomous(true);
                }
                return Ok(result);
            }

            if deadline.is_expired(self.clock.as_ref()) {
                warn!("Approval for {tool_name} timed out after {timeout:?}");
                return Err(ApprovalError::TimedOut {
                    tool_name: tool_name.to_string(),
                    timeout,
                });
            }

            let step = deadline.clamp(self.clock.as_ref(), self.config.poll_interval);
            self.clock.sleep(step).await;
        }
    }
}

/// Outcome of [`gate_prompt`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    /// Run the work with this prompt (edited when the approver changed it).
    Proceed { prompt: String, action: ApprovalAction },
    /// Do not run the work; report this message instead.
    Refused(String),
}

/// The approval pre-step for a unit of work that takes a `prompt`.
///
/// Without a run context (`job` is `None`) the work proceeds unchanged.
/// Rejections, timeouts and protocol errors become a user-visible refusal.
/// Only an interrupt is returned as `Err`.
pub async fn gate_prompt(
    gate: &ApprovalGate,
    job: Option<&JobHandle>,
    tool_name: &str,
    prompt: &str,
    preview: Option<&str>,
) -> Result<GateDecision, Interrupted> {
    let Some(job) = job else {
        return Ok(GateDecision::Proceed {
            prompt: prompt.to_string(),
            action: ApprovalAction::Approve,
        });
    };

    match gate
        .request_approval(job, tool_name, prompt, preview, None)
        .await
    {
        Ok(result) => Ok(match result.action {
            ApprovalAction::Reject => GateDecision::Refused(format!(
                "Error: '{tool_name}' was rejected by the operator and was not run."
            )),
            ApprovalAction::Edit => GateDecision::Proceed {
                prompt: result.modified_prompt.unwrap_or_else(|| prompt.to_string()),
                action: ApprovalAction::Edit,
            },
            action => GateDecision::Proceed {
                prompt: prompt.to_string(),
                action,
            },
        }),
        Err(ApprovalError::Interrupted(interrupt)) => Err(interrupt),
        Err(ApprovalError::TimedOut { timeout, .. }) => Ok(GateDecision::Refused(format!(
            "Error: approval for '{tool_name}' timed out after {}s; the action was not run.",
            timeout.as_secs()
        ))),
        Err(e) => Ok(GateDecision::Refused(format!("Error: {e}"))),
    }
}

/// Owns the run's pending-approval slot for the duration of one request.
struct PendingSlot<'a> {
    job: &'a JobHandle,
    request_id: String,
}

impl PendingSlot<'_> {
    fn take_response(&self) -> Option<ApprovalResult> {
        let mut state = self.job.lock();
        let ours = state
            .pending_approval
            .as_ref()
            .is_some_and(|r| r.id == self.request_id);
        if ours { state.approval_response.take() } else { None }
    }
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        let mut state = self.job.lock();
        if state
            .pending_approval
            .as_ref()
            .is_some_and(|r| r.id == self.request_id)
        {
            state.pending_approval = None;
            state.approval_response = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::interrupt::InterruptAction;
    use crate::clock::ManualClock;

    fn gate(clock: Arc<ManualClock>) -> ApprovalGate {
        ApprovalGate::with_clock(ApprovalConfig::default(), clock)
    }

    /// Deliver `result` as soon as a request shows up.
    fn respond_when_published(job: JobHandle, result: ApprovalResult) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if let Some(request) = job.pending_approval() {
                    job.respond_to_approval(&request.id, result).unwrap();
                    return;
                }
                tokio::task::yield_now().await;
            }
        })
    }

    #[tokio::test]
    async fn autonomy_mode_auto_approves_without_publishing() {
        let clock = Arc::new(ManualClock::new());
        let job = JobHandle::new("run-1", "campaign");
        job.set_autonomous(true);

        let result = gate(clock)
            .request_approval(&job, "generate_image", "a red fox", None, None)
            .await
            .unwrap();

        assert_eq!(result.action, ApprovalAction::AutoApproved);
        assert!(job.pending_approval().is_none());
    }

    #[tokio::test]
    async fn decision_is_returned_verbatim_and_slot_cleared() {
        let clock = Arc::new(ManualClock::new());
        let job = JobHandle::new("run-1", "campaign");
        let responder = respond_when_published(job.clone(), ApprovalResult::edit("a blue fox"));

        let result = gate(clock)
            .request_approval(&job, "generate_image", "a red fox", Some("preview.png"), None)
            .await
            .unwrap();
        responder.await.unwrap();

        assert_eq!(result, ApprovalResult::edit("a blue fox"));
        assert!(job.pending_approval().is_none());
        assert!(job.lock().approval_response.is_none());
    }

    #[tokio::test]
    async fn no_decision_times_out_and_clears_slot() {
        let clock = Arc::new(ManualClock::new());
        let job = JobHandle::new("run-1", "campaign");

        let err = gate(clock.clone())
            .request_approval(
                &job,
                "generate_video",
                "a timelapse",
                None,
                Some(Duration::from_secs(2)),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ApprovalError::TimedOut { .. }));
        assert!(clock.now() >= Duration::from_secs(2));
        assert!(job.pending_approval().is_none());
    }

    #[tokio::test]
    async fn interrupt_aborts_wait_and_clears_slot() {
        let clock = Arc::new(ManualClock::new());
        let job = JobHandle::new("run-1", "campaign");
        job.request_interrupt(InterruptAction::Stop, Some("operator quit".into()));

        let err = gate(clock)
            .request_approval(&job, "generate_image", "a red fox", None, None)
            .await
            .unwrap_err();

        assert_eq!(
            err,
            ApprovalError::Interrupted(Interrupted::new(
                InterruptAction::Stop,
                Some("operator quit".into())
            ))
        );
        assert!(job.pending_approval().is_none());
    }

    #[tokio::test]
    async fn second_request_while_pending_is_rejected() {
        let clock = Arc::new(ManualClock::new());
        let job = JobHandle::new("run-1", "campaign");
        let gate = Arc::new(gate(clock));

        let first = {
            let (gate, job) = (gate.clone(), job.clone());
            tokio::spawn(async move {
                gate.request_approval(&job, "generate_image", "first", None, None)
                    .await
            })
        };
        while job.pending_approval().is_none() {
            tokio::task::yield_now().await;
        }

        let err = gate
            .request_approval(&job, "generate_video", "second", None, None)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ApprovalError::AlreadyPending {
                run_id: "run-1".into(),
                pending_tool: "generate_image".into(),
            }
        );

        let pending = job.pending_approval().unwrap();
        assert_eq!(pending.tool_name, "generate_image");
        job.respond_to_approval(&pending.id, ApprovalResult::reject())
            .unwrap();
        let result = first.await.unwrap().unwrap();
        assert!(!result.allows_execution());
        assert!(job.pending_approval().is_none());
    }

    #[tokio::test]
    async fn approve_all_switches_run_to_autonomy() {
        let clock = Arc::new(ManualClock::new());
        let job = JobHandle::new("run-1", "campaign");
        let gate = gate(clock);
        let responder = respond_when_published(job.clone(), ApprovalResult::approve_all());

        let first = gate
            .request_approval(&job, "generate_image", "one", None, None)
            .await
            .unwrap();
        responder.await.unwrap();
        assert_eq!(first.action, ApprovalAction::ApproveAll);

        let second = gate
            .request_approval(&job, "generate_image", "two", None, None)
            .await
            .unwrap();
        assert_eq!(second.action, ApprovalAction::AutoApproved);
    }

    #[tokio::test]
    async fn dropped_wait_releases_slot() {
        let clock = Arc::new(ManualClock::new());
        let job = JobHandle::new("run-1", "campaign");
        let gate = gate(clock);

        {
            let fut = gate.request_approval(&job, "generate_image", "x", None, None);
            tokio::pin!(fut);
            // Poll once so the request is published, then drop the future.
            assert!(futures::poll!(fut.as_mut()).is_pending());
            assert!(job.pending_approval().is_some());
        }
        assert!(job.pending_approval().is_none());
    }

    #[tokio::test]
    async fn gate_prompt_without_run_context_proceeds() {
        let gate = gate(Arc::new(ManualClock::new()));
        let decision = gate_prompt(&gate, None, "generate_image", "a fox", None)
            .await
            .unwrap();
        assert_eq!(
            decision,
            GateDecision::Proceed {
                prompt: "a fox".into(),
                action: ApprovalAction::Approve
            }
        );
    }

    #[tokio::test]
    async fn gate_prompt_maps_decisions() {
        let clock = Arc::new(ManualClock::new());
        let gate = ApprovalGate::with_clock(
            ApprovalConfig::default().with_timeout(Duration::from_secs(1)),
            clock,
        );
        let job = JobHandle::new("run-1", "campaign");

        let responder = respond_when_published(job.clone(), ApprovalResult::edit("a blue fox"));
        let edited = gate_prompt(&gate, Some(&job), "generate_image", "a fox", None)
            .await
            .unwrap();
        responder.await.unwrap();
        assert_eq!(
            edited,
            GateDecision::Proceed {
                prompt: "a blue fox".into(),
                action: ApprovalAction::Edit
            }
        );

        let responder = respond_when_published(job.clone(), ApprovalResult::reject());
        let rejected = gate_prompt(&gate, Some(&job), "generate_image", "a fox", None)
            .await
            .unwrap();
        responder.await.unwrap();
        assert!(matches!(rejected, GateDecision::Refused(ref m) if m.contains("rejected")));

        let timed_out = gate_prompt(&gate, Some(&job), "generate_image", "a fox", None)
            .await
            .unwrap();
        assert!(matches!(timed_out, GateDecision::Refused(ref m) if m.contains("timed out")));

        job.request_interrupt(InterruptAction::Pause, None);
        let err = gate_prompt(&gate, Some(&job), "generate_image", "a fox", None)
            .await
            .unwrap_err();
        assert_eq!(err.action, InterruptAction::Pause);
    }

    #[test]
    fn result_validation() {
        assert!(ApprovalResult::edit("x").validate().is_ok());
        assert!(ApprovalResult::approve().validate().is_ok());
        let bad_edit = ApprovalResult {
            action: ApprovalAction::Edit,
            modified_prompt: None,
        };
        assert!(bad_edit.validate().is_err());
        let stray_prompt = ApprovalResult {
            action: ApprovalAction::Approve,
            modified_prompt: Some("y".into()),
        };
        assert!(stray_prompt.validate().is_err());
    }
}
