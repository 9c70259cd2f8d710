//! Live event fan-out to dashboard observers
//!
//! Decouples the protocol path from observers: `publish` never blocks and
//! never fails a caller. Subscribers sit behind a bounded ring; a slow
//! subscriber lags and skips the oldest events rather than stalling
//! publication. Observers are expected to recover from gaps with a
//! point-in-time snapshot pull.

use tokio::sync::broadcast;
use tracing::trace;

use crate::types::LiveEvent;

/// Default ring capacity per broadcaster
pub const DEFAULT_CAPACITY: usize = 256;

/// Fan-out publisher for [`LiveEvent`]s
#[derive(Debug, Clone)]
pub struct EventBroadcaster {
    tx: broadcast::Sender<LiveEvent>,
}

impl EventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event to all current subscribers. Fire-and-forget:
    /// with no subscribers the event is dropped silently.
    pub fn publish(&self, event: LiveEvent) {
        trace!("publish {}", event.event);
        let _ = self.tx.send(event);
    }

    /// Subscribe to the live feed. The receiver observes events published
    /// after this call; on overflow it reports a lag and resumes at the
    /// oldest retained event.
    pub fn subscribe(&self) -> broadcast::Receiver<LiveEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EventKind, LiveEvent};

    #[tokio::test]
    async fn test_publish_without_subscribers_is_noop() {
        let events = EventBroadcaster::new(8);
        // Must not panic or block.
        events.publish(LiveEvent::charger_connected("CHG-1"));
        assert_eq!(events.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_all_subscribers_receive() {
        let events = EventBroadcaster::new(8);
        let mut a = events.subscribe();
        let mut b = events.subscribe();

        events.publish(LiveEvent::charger_connected("CHG-1"));

        assert_eq!(a.recv().await.unwrap().event, EventKind::ChargerConnected);
        assert_eq!(b.recv().await.unwrap().event, EventKind::ChargerConnected);
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_oldest() {
        let events = EventBroadcaster::new(2);
        let mut rx = events.subscribe();

        for _ in 0..5 {
            events.publish(LiveEvent::charger_connected("CHG-1"));
        }

        // The first recv reports the lag, then delivery resumes from the
        // oldest retained event.
        match rx.recv().await {
            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => assert_eq!(n, 3),
            other => panic!("expected lag, got {:?}", other),
        }
        assert!(rx.recv().await.is_ok());
    }
}
