//! Per-run ordered task list with a strict status state machine.
//!
//! Insertion order is significant: [`TodoList::next_pending`] returns the
//! first pending item in list order, which is how the
//! [`RunLoop`](super::runner::RunLoop) picks its next unit of work.
//!
//! State machine transitions:
//! - Pending → InProgress | Cancelled | Skipped
//! - InProgress → Done | Error | Paused | Cancelled
//! - Paused → InProgress | Cancelled
//!
//! Done, Error, Cancelled and Skipped are terminal. A rejected transition
//! leaves the item untouched and returns [`TodoError::InvalidTransition`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, warn};

use crate::ids::generate_id;

/// Status of a todo item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Pending,
    InProgress,
    Paused,
    Done,
    Error,
    Cancelled,
    Skipped,
}

impl TodoStatus {
    /// Every status, for exhaustive checks.
    pub const ALL: [TodoStatus; 7] = [
        Self::Pending,
        Self::InProgress,
        Self::Paused,
        Self::Done,
        Self::Error,
        Self::Cancelled,
        Self::Skipped,
    ];

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Done | Self::Error | Self::Cancelled | Self::Skipped
        )
    }

    #[must_use]
    pub fn can_transition_to(&self, to: TodoStatus) -> bool {
        matches!(
            (self, to),
            (TodoStatus::Pending, TodoStatus::InProgress)
                | (TodoStatus::Pending, TodoStatus::Cancelled)
                | (TodoStatus::Pending, TodoStatus::Skipped)
                | (TodoStatus::InProgress, TodoStatus::Done)
                | (TodoStatus::InProgress, TodoStatus::Error)
                | (TodoStatus::InProgress, TodoStatus::Paused)
                | (TodoStatus::InProgress, TodoStatus::Cancelled)
                | (TodoStatus::Paused, TodoStatus::InProgress)
                | (TodoStatus::Paused, TodoStatus::Cancelled)
        )
    }

    /// Checklist marker used when rendering the list.
    fn marker(&self) -> &'static str {
        match self {
            Self::Pending => "[ ]",
            Self::InProgress => "[~]",
            Self::Paused => "[=]",
            Self::Done => "[x]",
            Self::Error => "[!]",
            Self::Cancelled => "[-]",
            Self::Skipped => "[>]",
        }
    }
}

impl fmt::Display for TodoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Paused => write!(f, "paused"),
            Self::Done => write!(f, "done"),
            Self::Error => write!(f, "error"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// Errors from todo list operations. No mutation happens when one is returned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TodoError {
    #[error("todo item '{id}' not found")]
    NotFound { id: String },

    #[error("invalid transition for todo item '{id}': {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: TodoStatus,
        to: TodoStatus,
    },
}

/// A single unit of work within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TodoItem {
    pub id: String,
    pub description: String,
    pub status: TodoStatus,
    /// References to artifacts or results produced by this item.
    pub outputs: Vec<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Count of finished items against the total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TodoProgress {
    /// Items in a terminal state.
    pub finished: usize,
    pub total: usize,
}

impl TodoProgress {
    pub fn is_complete(&self) -> bool {
        self.finished == self.total
    }
}

impl fmt::Display for TodoProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.finished, self.total)
    }
}

/// Ordered todo list owned by one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TodoList {
    pub id: String,
    pub run_id: String,
    items: Vec<TodoItem>,
    /// Last item sequence number handed out.
    #[serde(default)]
    next_seq: usize,
}

impl TodoList {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            id: generate_id("todo"),
            run_id: run_id.into(),
            items: Vec::new(),
            next_seq: 0,
        }
    }

    /// Append a pending item and return its id.
    pub fn add_item(&mut self, description: impl Into<String>) -> String {
        // Lists restored without a counter still never reuse an id.
        let id = loop {
            self.next_seq += 1;
            let id = format!("{}-{}", self.id, self.next_seq);
            if self.get_item(&id).is_none() {
                break id;
            }
        };
        let now = Utc::now();
        self.items.push(TodoItem {
            id: id.clone(),
            description: description.into(),
            status: TodoStatus::Pending,
            outputs: Vec::new(),
            error: None,
            created_at: now,
            updated_at: now,
        });
        id
    }

    pub fn get_item(&self, id: &str) -> Option<&TodoItem> {
        self.items.iter().find(|i| i.id == id)
    }

    /// Items in insertion order.
    pub fn items(&self) -> &[TodoItem] {
        &self.items
    }

    /// Item by 1-based position, as shown in the rendered checklist.
    pub fn item_at(&self, number: usize) -> Option<&TodoItem> {
        number.checked_sub(1).and_then(|idx| self.items.get(idx))
    }

    /// First pending item in list order.
    pub fn next_pending(&self) -> Option<&TodoItem> {
        self.items
            .iter()
            .find(|i| i.status == TodoStatus::Pending)
    }

    pub fn progress(&self) -> TodoProgress {
        TodoProgress {
            finished: self
                .items
                .iter()
                .filter(|i| i.status.is_terminal())
                .count(),
            total: self.items.len(),
        }
    }

    /// Apply a status transition if the state machine allows it.
    pub fn transition(&mut self, id: &str, to: TodoStatus) -> Result<(), TodoError> {
        self.apply(id, to, |_| {})
    }

    /// Pending or paused → in progress.
    pub fn start(&mut self, id: &str) -> Result<(), TodoError> {
        self.transition(id, TodoStatus::InProgress)
    }

    /// In progress → done, recording the produced outputs.
    pub fn complete(&mut self, id: &str, outputs: Vec<String>) -> Result<(), TodoError> {
        self.apply(id, TodoStatus::Done, |item| item.outputs.extend(outputs))
    }

    /// In progress → error, recording the failure.
    pub fn fail(&mut self, id: &str, error: impl Into<String>) -> Result<(), TodoError> {
        let error = error.into();
        self.apply(id, TodoStatus::Error, |item| item.error = Some(error))
    }

    pub fn pause(&mut self, id: &str) -> Result<(), TodoError> {
        self.transition(id, TodoStatus::Paused)
    }

    pub fn skip(&mut self, id: &str) -> Result<(), TodoError> {
        self.transition(id, TodoStatus::Skipped)
    }

    pub fn cancel(&mut self, id: &str) -> Result<(), TodoError> {
        self.transition(id, TodoStatus::Cancelled)
    }

    /// Cancel every item that has not started yet. Returns how many changed.
    pub fn cancel_remaining(&mut self) -> usize {
        let pending: Vec<String> = self
            .items
            .iter()
            .filter(|i| i.status == TodoStatus::Pending)
            .map(|i| i.id.clone())
            .collect();
        pending
            .iter()
            .filter(|id| self.cancel(id).is_ok())
            .count()
    }

    fn apply(
        &mut self,
        id: &str,
        to: TodoStatus,
        on_success: impl FnOnce(&mut TodoItem),
    ) -> Result<(), TodoError> {
        let Some(item) = self.items.iter_mut().find(|i| i.id == id) else {
            return Err(TodoError::NotFound { id: id.to_string() });
        };
        let from = item.status;
        if !from.can_transition_to(to) {
            warn!("Rejected todo transition {id}: {from} -> {to}");
            return Err(TodoError::InvalidTransition {
                id: id.to_string(),
                from,
                to,
            });
        }
        item.status = to;
        item.updated_at = Utc::now();
        on_success(item);
        debug!("Todo {id}: {from} -> {to}");
        Ok(())
    }

    /// Render as a numbered checklist.
    pub fn format_checklist(&self) -> String {
        if self.items.is_empty() {
            return "Todo list is empty.".into();
        }
        let mut out = format!("Todo list ({} done):\n", self.progress());
        for (i, item) in self.items.iter().enumerate() {
            out.push_str(&format!(
                "  {}. {} {}",
                i + 1,
                item.status.marker(),
                item.description
            ));
            if let Some(ref err) = item.error {
                out.push_str(&format!(" (error: {err})"));
            }
            out.push('\n');
        }
        out
    }
}
