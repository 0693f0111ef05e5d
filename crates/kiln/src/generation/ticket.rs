//! Ticket records owned by the [`TicketPool`](super::pool::TicketPool).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Lifecycle of a ticket.
///
/// ```text
/// Queued ──▶ Processing ──▶ Completed | Failed | Timeout
///   └──────▶ Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TicketStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl TicketStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Queued | Self::Processing)
    }

    pub fn can_transition_to(&self, to: TicketStatus) -> bool {
        use TicketStatus::*;
        matches!(
            (self, to),
            (Queued, Processing)
                | (Queued, Cancelled)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Timeout)
        )
    }
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "QUEUED",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
            Self::Timeout => "TIMEOUT",
        };
        f.write_str(s)
    }
}

/// One unit of generation work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
    pub id: String,
    pub prompt: String,
    /// Opaque generator parameters.
    pub params: serde_json::Map<String, serde_json::Value>,
    pub batch_id: Option<String>,
    pub status: TicketStatus,
    /// Artifact path once completed.
    pub artifact: Option<PathBuf>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Ticket {
    pub(crate) fn new(
        id: String,
        prompt: String,
        params: serde_json::Map<String, serde_json::Value>,
        batch_id: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            prompt,
            params,
            batch_id,
            status: TicketStatus::Queued,
            artifact: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn in_batch(&self, batch_id: &str) -> bool {
        self.batch_id.as_deref() == Some(batch_id)
    }

    /// Move to `to` if the lifecycle allows it. Returns whether it moved.
    pub(crate) fn advance(&mut self, to: TicketStatus) -> bool {
        if !self.status.can_transition_to(to) {
            return false;
        }
        self.status = to;
        self.updated_at = Utc::now();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [TicketStatus; 6] = [
        TicketStatus::Queued,
        TicketStatus::Processing,
        TicketStatus::Completed,
        TicketStatus::Failed,
        TicketStatus::Cancelled,
        TicketStatus::Timeout,
    ];

    #[test]
    fn terminal_states_have_no_exits() {
        for from in ALL.into_iter().filter(TicketStatus::is_terminal) {
            for to in ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn processing_cannot_be_cancelled() {
        assert!(!TicketStatus::Processing.can_transition_to(TicketStatus::Cancelled));
        assert!(TicketStatus::Queued.can_transition_to(TicketStatus::Cancelled));
    }

    #[test]
    fn advance_refuses_illegal_moves() {
        let mut ticket = Ticket::new("tk-1".into(), "fox".into(), Default::default(), None);
        assert!(!ticket.advance(TicketStatus::Completed));
        assert_eq!(ticket.status, TicketStatus::Queued);
        assert!(ticket.advance(TicketStatus::Processing));
        assert!(ticket.advance(TicketStatus::Completed));
        assert!(!ticket.advance(TicketStatus::Failed));
        assert!(ticket.is_terminal());
    }

    #[test]
    fn status_serializes_upper_case() {
        let json = serde_json::to_string(&TicketStatus::Processing).unwrap();
        assert_eq!(json, "\"PROCESSING\"");
    }
}
