// =============================================================================
// Client Notice Service — operator-facing warning fan-out
// =============================================================================
//
// Advisory conditions (clock skew, exit triggers fired) are surfaced to
// connected observers as notices, never as command errors. Delivery is
// best-effort: a notice sent while no observer is subscribed is simply
// dropped, and a slow observer sees drop-oldest semantics from the broadcast
// channel.
// =============================================================================

use chrono::Utc;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

/// Severity of a client notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NoticeLevel {
    Info,
    Warning,
}

/// A single operator-facing notice.
#[derive(Debug, Clone, Serialize)]
pub struct ClientNotice {
    pub level: NoticeLevel,
    pub message: String,
    /// ISO 8601 timestamp.
    pub at: String,
}

impl ClientNotice {
    pub fn new(level: NoticeLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            at: Utc::now().to_rfc3339(),
        }
    }
}

/// Fan-out of notices to all connected observers.
pub struct ClientNoticeService {
    tx: broadcast::Sender<ClientNotice>,
}

impl ClientNoticeService {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Broadcast a notice to every subscriber.
    pub fn broadcast(&self, level: NoticeLevel, message: impl Into<String>) {
        let notice = ClientNotice::new(level, message);
        debug!(level = ?notice.level, message = %notice.message, "client notice");
        // No subscribers is fine; notices never gate correctness.
        let _ = self.tx.send(notice);
    }

    /// Obtain a dedicated receiver for this observer.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientNotice> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_broadcast() {
        let svc = ClientNoticeService::new(8);
        let mut rx = svc.subscribe();
        svc.broadcast(NoticeLevel::Warning, "clock skew too large");

        let notice = rx.recv().await.unwrap();
        assert_eq!(notice.level, NoticeLevel::Warning);
        assert_eq!(notice.message, "clock skew too large");
    }

    #[test]
    fn broadcast_without_subscribers_is_a_noop() {
        let svc = ClientNoticeService::new(8);
        svc.broadcast(NoticeLevel::Info, "nobody listening");
    }
}
