use slackline_common::Result;
use tokio::sync::broadcast;
use tracing::debug;

use crate::event::PlatformEvent;
use crate::traits::{EventFeed, FeedStatus};

/// Default number of events buffered per subscriber before it starts lagging.
pub const DEFAULT_FEED_CAPACITY: usize = 1024;

/// In-process fan-out of platform events.
///
/// The socket connection publishes into it; every in-flight session holds
/// one receiver.
#[derive(Clone)]
pub struct BroadcastFeed {
    tx: broadcast::Sender<PlatformEvent>,
}

impl BroadcastFeed {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Deliver an event to every current subscriber. Returns how many
    /// received it; events published with nobody listening are dropped.
    pub fn publish(&self, event: PlatformEvent) -> usize {
        match self.tx.send(event) {
            Ok(receivers) => receivers,
            Err(_) => {
                debug!("no active sessions, dropping real-time event");
                0
            }
        }
    }

    /// Parse and publish one raw frame.
    pub fn publish_raw(&self, raw: &str) -> Result<usize> {
        let event = PlatformEvent::parse(raw)?;
        Ok(self.publish(event))
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for BroadcastFeed {
    fn default() -> Self {
        Self::new(DEFAULT_FEED_CAPACITY)
    }
}

impl EventFeed for BroadcastFeed {
    fn subscribe(&self) -> broadcast::Receiver<PlatformEvent> {
        self.tx.subscribe()
    }

    fn status(&self) -> FeedStatus {
        FeedStatus::Connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_subscriber_sees_every_event() {
        let feed = BroadcastFeed::default();
        let mut a = feed.subscribe();
        let mut b = feed.subscribe();

        let delivered = feed.publish(PlatformEvent::edit("U1", "1.2", "1.1", "hi"));
        assert_eq!(delivered, 2);

        assert_eq!(a.recv().await.unwrap().message.unwrap().text, "hi");
        assert_eq!(b.recv().await.unwrap().message.unwrap().text, "hi");
    }

    #[test]
    fn publishing_without_subscribers_is_a_noop() {
        let feed = BroadcastFeed::default();
        assert_eq!(feed.publish(PlatformEvent::default()), 0);
    }

    #[test]
    fn dropping_receiver_unsubscribes() {
        let feed = BroadcastFeed::default();
        let rx = feed.subscribe();
        assert_eq!(feed.subscriber_count(), 1);
        drop(rx);
        assert_eq!(feed.subscriber_count(), 0);
    }

    #[test]
    fn publish_raw_rejects_garbage() {
        let feed = BroadcastFeed::default();
        let _rx = feed.subscribe();
        assert!(feed.publish_raw("not json").is_err());
        assert_eq!(feed.publish_raw(r#"{"type":"hello"}"#).unwrap(), 1);
    }
}
