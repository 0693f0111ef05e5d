//! Per-run shared state and the registry of live runs.
//!
//! A [`JobState`] is created when a run starts and dropped when it ends. It
//! is shared between the task executing the run and whatever delivers
//! operator input (approvals, interrupts). Every field lives behind one
//! mutex; [`JobHandle`] is the cheap cloneable handle to it.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

use super::approval::{ApprovalError, ApprovalRequest, ApprovalResult};
use super::interrupt::{InterruptAction, InterruptSignal, Interrupted};
use super::todo::{TodoList, TodoProgress};

/// Mutable state of one run.
#[derive(Debug)]
pub struct JobState {
    pub run_id: String,
    pub job_type: String,
    pub pending_approval: Option<ApprovalRequest>,
    pub approval_response: Option<ApprovalResult>,
    pub interrupt_requested: Option<InterruptAction>,
    pub interrupt_message: Option<String>,
    pub todo_list: Option<TodoList>,
    pub is_paused: bool,
    /// Autonomy mode: approvals are granted without asking.
    pub autonomous: bool,
    pub started_at: DateTime<Utc>,
}

impl JobState {
    fn new(run_id: String, job_type: String) -> Self {
        Self {
            run_id,
            job_type,
            pending_approval: None,
            approval_response: None,
            interrupt_requested: None,
            interrupt_message: None,
            todo_list: None,
            is_paused: false,
            autonomous: false,
            started_at: Utc::now(),
        }
    }
}

/// Point-in-time view of a run for UI bridges.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub run_id: String,
    pub job_type: String,
    pub pending_approval: Option<ApprovalRequest>,
    pub interrupt_requested: Option<InterruptAction>,
    pub is_paused: bool,
    pub autonomous: bool,
    pub todo_progress: Option<TodoProgress>,
    pub started_at: DateTime<Utc>,
}

/// Shared handle to a run's [`JobState`].
#[derive(Debug, Clone)]
pub struct JobHandle(Arc<Mutex<JobState>>);

impl JobHandle {
    pub fn new(run_id: impl Into<String>, job_type: impl Into<String>) -> Self {
        Self(Arc::new(Mutex::new(JobState::new(
            run_id.into(),
            job_type.into(),
        ))))
    }

    /// Lock the state. A poisoned lock is recovered, not propagated.
    ///
    /// Never hold the guard across an `.await`.
    pub fn lock(&self) -> MutexGuard<'_, JobState> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn run_id(&self) -> String {
        self.lock().run_id.clone()
    }

    pub fn is_autonomous(&self) -> bool {
        self.lock().autonomous
    }

    pub fn set_autonomous(&self, autonomous: bool) {
        let mut state = self.lock();
        if state.autonomous != autonomous {
            info!("Run {}: autonomy mode {}", state.run_id, on_off(autonomous));
        }
        state.autonomous = autonomous;
    }

    // ── Interrupts ──────────────────────────────────────────────────

    /// Ask the run to pause, stop or redirect at its next safe point.
    ///
    /// A later request replaces an earlier one that was not yet observed.
    pub fn request_interrupt(&self, action: InterruptAction, message: Option<String>) {
        let mut state = self.lock();
        info!("Run {}: interrupt requested ({action})", state.run_id);
        state.interrupt_requested = Some(action);
        state.interrupt_message = message;
        if action == InterruptAction::Pause {
            state.is_paused = true;
        }
    }

    /// Take the pending interrupt, leaving the signal clear.
    pub fn clear_interrupt(&self) -> Option<Interrupted> {
        let mut state = self.lock();
        let action = state.interrupt_requested.take()?;
        let message = state.interrupt_message.take();
        debug!("Run {}: interrupt {action} consumed", state.run_id);
        Some(Interrupted::new(action, message))
    }

    pub fn is_paused(&self) -> bool {
        self.lock().is_paused
    }

    /// Resume a paused run. A pause that has not been observed yet is dropped.
    pub fn resume(&self) {
        let mut state = self.lock();
        if state.interrupt_requested == Some(InterruptAction::Pause) {
            state.interrupt_requested = None;
            state.interrupt_message = None;
        }
        if state.is_paused {
            info!("Run {}: resumed", state.run_id);
        }
        state.is_paused = false;
    }

    // ── Approvals ───────────────────────────────────────────────────

    pub fn pending_approval(&self) -> Option<ApprovalRequest> {
        self.lock().pending_approval.clone()
    }

    /// Deliver a decision for the pending request `request_id`.
    pub fn respond_to_approval(
        &self,
        request_id: &str,
        result: ApprovalResult,
    ) -> Result<(), ApprovalError> {
        result.validate()?;
        let mut state = self.lock();
        match state.pending_approval {
            None => Err(ApprovalError::NoPendingRequest {
                run_id: state.run_id.clone(),
            }),
            Some(ref pending) if pending.id != request_id => Err(ApprovalError::UnknownRequest {
                request_id: request_id.to_string(),
            }),
            Some(_) => {
                debug!("Run {}: approval {request_id} answered", state.run_id);
                state.approval_response = Some(result);
                Ok(())
            }
        }
    }

    // ── Todo list ───────────────────────────────────────────────────

    /// Replace the run's todo list.
    pub fn set_todo_list(&self, list: TodoList) {
        self.lock().todo_list = Some(list);
    }

    /// Run `f` against the run's todo list, creating an empty one on first use.
    pub fn with_todo<R>(&self, f: impl FnOnce(&mut TodoList) -> R) -> R {
        let mut state = self.lock();
        let run_id = state.run_id.clone();
        let list = state.todo_list.get_or_insert_with(|| TodoList::new(run_id));
        f(list)
    }

    pub fn snapshot(&self) -> JobSnapshot {
        let state = self.lock();
        JobSnapshot {
            run_id: state.run_id.clone(),
            job_type: state.job_type.clone(),
            pending_approval: state.pending_approval.clone(),
            interrupt_requested: state.interrupt_requested,
            is_paused: state.is_paused,
            autonomous: state.autonomous,
            todo_progress: state.todo_list.as_ref().map(TodoList::progress),
            started_at: state.started_at,
        }
    }
}

impl InterruptSignal for JobHandle {
    fn pending(&self) -> Option<Interrupted> {
        let state = self.lock();
        state
            .interrupt_requested
            .map(|action| Interrupted::new(action, state.interrupt_message.clone()))
    }
}

fn on_off(flag: bool) -> &'static str {
    if flag { "on" } else { "off" }
}

/// Live runs, keyed by run id.
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: Mutex<HashMap<String, JobHandle>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn jobs(&self) -> MutexGuard<'_, HashMap<String, JobHandle>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a new run. An existing run with the same id is replaced.
    pub fn start_run(&self, run_id: impl Into<String>, job_type: impl Into<String>) -> JobHandle {
        let run_id = run_id.into();
        let handle = JobHandle::new(run_id.clone(), job_type);
        info!("Run {run_id} started");
        self.jobs().insert(run_id, handle.clone());
        handle
    }

    pub fn get(&self, run_id: &str) -> Option<JobHandle> {
        self.jobs().get(run_id).cloned()
    }

    /// Drop a finished run's state.
    pub fn end_run(&self, run_id: &str) -> Option<JobHandle> {
        let removed = self.jobs().remove(run_id);
        if removed.is_some() {
            info!("Run {run_id} ended");
        }
        removed
    }

    pub fn run_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.jobs().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn clear(&self) {
        self.jobs().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pause_sets_flag_and_resume_clears_unobserved_pause() {
        let job = JobHandle::new("run-1", "campaign");
        job.request_interrupt(InterruptAction::Pause, None);
        assert!(job.is_paused());
        assert_eq!(
            job.check(),
            Err(Interrupted::new(InterruptAction::Pause, None))
        );

        job.resume();
        assert!(!job.is_paused());
        assert!(job.check().is_ok());
    }

    #[test]
    fn resume_keeps_a_later_stop() {
        let job = JobHandle::new("run-1", "campaign");
        job.request_interrupt(InterruptAction::Pause, None);
        job.request_interrupt(InterruptAction::Stop, Some("done".into()));
        job.resume();
        assert_eq!(
            job.pending(),
            Some(Interrupted::new(InterruptAction::Stop, Some("done".into())))
        );
    }

    #[test]
    fn clear_interrupt_consumes_signal() {
        let job = JobHandle::new("run-1", "campaign");
        job.request_interrupt(InterruptAction::Redirect, Some("go darker".into()));
        let taken = job.clear_interrupt().unwrap();
        assert_eq!(taken.action, InterruptAction::Redirect);
        assert_eq!(taken.message.as_deref(), Some("go darker"));
        assert!(job.clear_interrupt().is_none());
        assert!(job.pending().is_none());
    }

    #[test]
    fn respond_without_pending_request_is_rejected() {
        let job = JobHandle::new("run-1", "campaign");
        assert_eq!(
            job.respond_to_approval("ap-1", ApprovalResult::approve()),
            Err(ApprovalError::NoPendingRequest {
                run_id: "run-1".into()
            })
        );
    }

    #[test]
    fn respond_to_wrong_request_is_rejected() {
        let job = JobHandle::new("run-1", "campaign");
        job.lock().pending_approval = Some(ApprovalRequest {
            id: "ap-real".into(),
            run_id: "run-1".into(),
            tool_name: "generate_image".into(),
            prompt: "fox".into(),
            preview: None,
            created_at: Utc::now(),
            expires_at: Utc::now(),
        });
        assert!(matches!(
            job.respond_to_approval("ap-stale", ApprovalResult::approve()),
            Err(ApprovalError::UnknownRequest { .. })
        ));
        assert!(job
            .respond_to_approval("ap-real", ApprovalResult::approve())
            .is_ok());
        assert_eq!(job.lock().approval_response, Some(ApprovalResult::approve()));
    }

    #[test]
    fn with_todo_creates_list_lazily() {
        let job = JobHandle::new("run-1", "campaign");
        assert!(job.snapshot().todo_progress.is_none());
        let id = job.with_todo(|list| list.add_item("hero image"));
        job.with_todo(|list| list.start(&id)).unwrap();

        let snapshot = job.snapshot();
        assert_eq!(snapshot.todo_progress.map(|p| p.total), Some(1));
        assert_eq!(job.with_todo(|list| list.run_id.clone()), "run-1");
    }

    #[test]
    fn registry_lifecycle() {
        let registry = JobRegistry::new();
        let job = registry.start_run("run-b", "campaign");
        registry.start_run("run-a", "chat");
        assert_eq!(registry.run_ids(), vec!["run-a", "run-b"]);

        job.set_autonomous(true);
        assert!(registry.get("run-b").unwrap().is_autonomous());

        assert!(registry.end_run("run-b").is_some());
        assert!(registry.get("run-b").is_none());
        assert!(registry.end_run("run-b").is_none());
    }
}
