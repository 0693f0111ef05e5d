//! Ticket progress events and the sinks that receive them.
//!
//! The pool emits one [`TicketEvent`] per status transition. Delivery is
//! best-effort: a sink must return quickly and never block a worker.

use serde::Serialize;
use std::path::Path;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::ticket::{Ticket, TicketStatus};

/// A ticket status change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TicketEvent {
    pub ticket_id: String,
    pub batch_id: Option<String>,
    pub status: TicketStatus,
    /// Raw artifact path, for direct consumers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_path: Option<String>,
    /// Stable `file://` reference with special characters percent-encoded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TicketEvent {
    pub fn from_ticket(ticket: &Ticket) -> Self {
        let artifact = ticket.artifact.as_deref();
        Self {
            ticket_id: ticket.id.clone(),
            batch_id: ticket.batch_id.clone(),
            status: ticket.status,
            artifact_path: artifact.map(|p| p.display().to_string()),
            artifact_uri: artifact.and_then(artifact_reference),
            error: ticket.error.clone(),
        }
    }
}

/// Encode an artifact path as a `file://` URI.
///
/// Relative paths are resolved against the working directory first. Returns
/// `None` when the path cannot be expressed as a file URL.
pub fn artifact_reference(path: &Path) -> Option<String> {
    let absolute = std::path::absolute(path).ok()?;
    reqwest::Url::from_file_path(absolute)
        .ok()
        .map(String::from)
}

/// Receiver of ticket progress events.
///
/// Called with the pool's ticket table locked, so events for one ticket
/// arrive in lifecycle order. Implementations must not block or call back
/// into the pool.
pub trait ProgressSink: Send + Sync {
    fn on_event(&self, event: &TicketEvent);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl ProgressSink for NoopSink {
    fn on_event(&self, _event: &TicketEvent) {}
}

/// Logs events through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingSink;

impl ProgressSink for LoggingSink {
    fn on_event(&self, event: &TicketEvent) {
        let batch = event.batch_id.as_deref().unwrap_or("-");
        match event.status {
            TicketStatus::Failed | TicketStatus::Timeout => warn!(
                "[ticket {} batch {batch}] {}: {}",
                event.ticket_id,
                event.status,
                event.error.as_deref().unwrap_or("unknown error")
            ),
            TicketStatus::Completed => info!(
                "[ticket {} batch {batch}] COMPLETED -> {}",
                event.ticket_id,
                event.artifact_uri.as_deref().unwrap_or("(no artifact)")
            ),
            status => debug!("[ticket {} batch {batch}] {status}", event.ticket_id),
        }
    }
}

/// Adapts a closure into a sink.
pub struct FnProgressSink<F>(pub F);

impl<F> ProgressSink for FnProgressSink<F>
where
    F: Fn(&TicketEvent) + Send + Sync,
{
    fn on_event(&self, event: &TicketEvent) {
        (self.0)(event)
    }
}

/// Forwards events into a bounded channel, dropping them when it is full.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<TicketEvent>,
}

impl ChannelSink {
    /// Create a sink and the receiver it feeds.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<TicketEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl ProgressSink for ChannelSink {
    fn on_event(&self, event: &TicketEvent) {
        match self.tx.try_send(event.clone()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(dropped)) => {
                warn!(
                    "Progress channel full, dropping {} event for {}",
                    dropped.status, dropped.ticket_id
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Progress channel closed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Mutex;

    fn completed(artifact: PathBuf) -> Ticket {
        let mut ticket = Ticket::new("tk-1".into(), "fox".into(), Default::default(), Some("b1".into()));
        ticket.advance(TicketStatus::Processing);
        ticket.advance(TicketStatus::Completed);
        ticket.artifact = Some(artifact);
        ticket
    }

    #[test]
    fn special_characters_are_encoded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("red fox #1 (final).png");
        let uri = artifact_reference(&path).unwrap();

        assert!(uri.starts_with("file:///"));
        assert!(uri.contains("red%20fox%20%231%20(final).png"), "{uri}");
    }

    #[test]
    fn event_keeps_raw_path_and_uri() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a b.png");
        let event = TicketEvent::from_ticket(&completed(path.clone()));

        assert_eq!(event.artifact_path, Some(path.display().to_string()));
        assert!(event.artifact_uri.unwrap().ends_with("a%20b.png"));
        assert_eq!(event.batch_id.as_deref(), Some("b1"));
        assert!(event.error.is_none());
    }

    #[test]
    fn fn_sink_receives_events() {
        let seen = Mutex::new(Vec::new());
        let sink = FnProgressSink(|e: &TicketEvent| seen.lock().unwrap().push(e.status));
        sink.on_event(&TicketEvent::from_ticket(&completed(PathBuf::from("/tmp/x.png"))));
        assert_eq!(*seen.lock().unwrap(), vec![TicketStatus::Completed]);
    }

    #[test]
    fn channel_sink_drops_when_full() {
        let (sink, mut rx) = ChannelSink::new(1);
        let event = TicketEvent::from_ticket(&completed(PathBuf::from("/tmp/x.png")));
        sink.on_event(&event);
        sink.on_event(&event);

        assert_eq!(rx.try_recv().unwrap(), event);
        assert!(rx.try_recv().is_err());
    }
}
