//! Event fan-out to subscribers.
//!
//! Each subscriber owns a broadcast receiver. A subscriber that lags or goes
//! away only affects itself; emitting never blocks and never fails.

use tokio::sync::broadcast;
use tracing::trace;

use crate::kg::domain::KgEvent;

const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<KgEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn emit(&self, event: KgEvent) {
        trace!(event = event.name(), "Emitting event");
        // No subscribers is not an error.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<KgEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completed(id: &str) -> KgEvent {
        KgEvent::TaskCompleted {
            task_id: id.to_string(),
            kb_id: "kb".to_string(),
        }
    }

    #[tokio::test]
    async fn test_emit_without_subscribers() {
        let bus = EventBus::default();
        bus.emit(completed("t1"));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_subscriber_does_not_affect_others() {
        let bus = EventBus::new(8);
        let mut kept = bus.subscribe();
        let dropped = bus.subscribe();
        drop(dropped);

        bus.emit(completed("t1"));
        assert_eq!(kept.recv().await.unwrap(), completed("t1"));
    }

    #[tokio::test]
    async fn test_lagging_subscriber_only_loses_its_own_events() {
        let bus = EventBus::new(2);
        let mut slow = bus.subscribe();
        let mut fast = bus.subscribe();

        for i in 0..3 {
            bus.emit(completed(&format!("t{i}")));
            assert_eq!(fast.recv().await.unwrap(), completed(&format!("t{i}")));
        }
        assert!(matches!(
            slow.recv().await,
            Err(broadcast::error::RecvError::Lagged(1))
        ));
        assert_eq!(slow.recv().await.unwrap(), completed("t1"));
    }
}
