//! EventBus: fans out crawl-loop lifecycle events to any number of
//! subscribers (the WebSocket observability surface, future log sinks)
//! without coupling CrawlLoop to any particular consumer.
//!
//! Generalizes the teacher's `broadcast::Sender<String>` event channel into a
//! typed event enum so consumers don't have to re-parse loosely-shaped JSON.

use serde::Serialize;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CrawlEvent {
    RunStarted { run_id: i64, target_package: String },
    StepStarted { step: i64, screen_id: Option<i64> },
    ScreenshotReady { step: i64, path: String },
    ActionExecuted { step: i64, action_desc: String, success: bool },
    StatusChanged { status: String },
    StuckDetected { step: i64, reason: String },
    Log { level: String, message: String },
    RunFinished { run_id: i64, status: String },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CrawlEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CrawlEvent> {
        self.tx.subscribe()
    }

    /// Silently dropped when there are no subscribers — the loop never
    /// blocks or fails because nobody is watching.
    pub fn publish(&self, event: CrawlEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(CrawlEvent::StatusChanged { status: "RUNNING".into() });
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, CrawlEvent::StatusChanged { status } if status == "RUNNING"));
    }

    #[test]
    fn publish_without_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish(CrawlEvent::RunStarted { run_id: 1, target_package: "com.example".into() });
    }
}
