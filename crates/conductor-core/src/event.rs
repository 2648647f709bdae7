use tokio::sync::broadcast;
use tracing::trace;

use crate::types::RunEvent;

/// Default number of events buffered per subscriber.
pub const DEFAULT_CAPACITY: usize = 256;

/// Broadcast channel for run lifecycle events.
///
/// One bus may be shared by several engines and observed by any number of
/// subscribers (the JSONL run logger is one). A subscriber that falls more
/// than `capacity` events behind loses the oldest ones.
pub struct EventBus {
    tx: broadcast::Sender<RunEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: RunEvent) {
        if self.tx.send(event).is_err() {
            trace!("No event subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.tx.subscribe()
    }

    /// Whether anyone is listening. Lets publishers skip building events
    /// that would be dropped.
    pub fn has_subscribers(&self) -> bool {
        self.tx.receiver_count() > 0
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RunId;

    #[tokio::test]
    async fn test_subscribers_receive_published_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let run_id = RunId::from_str("r1");
        bus.publish(RunEvent::RouteTaken {
            run_id: run_id.clone(),
            from: "check".into(),
            to: "done".into(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.run_id(), &run_id);
        assert!(matches!(event, RunEvent::RouteTaken { ref to, .. } if to == "done"));
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let bus = EventBus::new(4);
        assert!(!bus.has_subscribers());
        bus.publish(RunEvent::RunFinished {
            run_id: RunId::new(),
            success: true,
            error: None,
        });
    }
}
