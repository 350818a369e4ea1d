//! Progress notifications.
//!
//! The session manager publishes a [`ProgressEvent`] whenever a part is newly
//! recorded or a session changes state. Delivery is fire-and-forget and
//! decoupled from persistence: a slow or absent listener never affects the
//! operation that produced the event.

use crate::models::session::{SessionStatus, UploadSession};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

/// A `ProgressChanged` event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub session_id: Uuid,
    pub status: SessionStatus,
    pub parts_reported: u32,
    pub part_count: u32,
    pub percentage: f64,
}

impl ProgressEvent {
    pub fn from_session(session: &UploadSession) -> Self {
        let parts_reported = session.parts_reported();
        Self {
            session_id: session.id,
            status: session.status,
            parts_reported,
            part_count: session.part_count,
            percentage: percentage(parts_reported, session.part_count),
        }
    }
}

/// Share of reported parts, in percent with two decimals.
pub fn percentage(parts_reported: u32, part_count: u32) -> f64 {
    if part_count == 0 {
        return 0.0;
    }
    let raw = f64::from(parts_reported) / f64::from(part_count) * 100.0;
    (raw * 100.0).round() / 100.0
}

pub trait ProgressNotifier: Send + Sync {
    fn publish(&self, event: ProgressEvent);
}

/// Writes events to the log.
pub struct TracingNotifier;

impl ProgressNotifier for TracingNotifier {
    fn publish(&self, event: ProgressEvent) {
        tracing::debug!(
            session_id = %event.session_id,
            status = %event.status,
            parts_reported = event.parts_reported,
            part_count = event.part_count,
            percentage = event.percentage,
            "upload progress"
        );
    }
}

/// Fans events out to in-process subscribers. Events published while nobody
/// is subscribed are dropped.
pub struct BroadcastNotifier {
    tx: broadcast::Sender<ProgressEvent>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }
}

impl ProgressNotifier for BroadcastNotifier {
    fn publish(&self, event: ProgressEvent) {
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentage_rounds_to_two_decimals() {
        assert_eq!(percentage(0, 4), 0.0);
        assert_eq!(percentage(1, 3), 33.33);
        assert_eq!(percentage(4, 4), 100.0);
        assert_eq!(percentage(0, 0), 0.0);
    }

    #[tokio::test]
    async fn broadcast_reaches_subscribers() {
        let notifier = BroadcastNotifier::new(8);
        // No subscriber yet: dropped silently.
        notifier.publish(ProgressEvent {
            session_id: Uuid::nil(),
            status: SessionStatus::Uploading,
            parts_reported: 0,
            part_count: 2,
            percentage: 0.0,
        });

        let mut rx = notifier.subscribe();
        let event = ProgressEvent {
            session_id: Uuid::new_v4(),
            status: SessionStatus::Uploading,
            parts_reported: 1,
            part_count: 2,
            percentage: 50.0,
        };
        notifier.publish(event.clone());
        assert_eq!(rx.recv().await.unwrap(), event);
    }
}
