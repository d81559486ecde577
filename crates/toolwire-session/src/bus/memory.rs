//! In-process pub/sub bus.
//!
//! Every `StreamManager` holding a clone of the same `Arc<MemoryBus>` behaves
//! like an instance attached to one shared bus. Valid inside a single process
//! only; a multi-process deployment plugs in an external bus behind
//! `PubSubBus`.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};
use toolwire_core::{BusError, BusSubscription, PubSubBus};

/// Per-channel buffer before slow subscribers start lagging.
const CHANNEL_CAPACITY: usize = 1024;

/// Broadcast-backed bus.
pub struct MemoryBus {
    channels: Mutex<HashMap<String, broadcast::Sender<Bytes>>>,
    capacity: usize,
}

impl MemoryBus {
    /// Create a bus.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(CHANNEL_CAPACITY)
    }

    /// Create a bus with a custom per-channel buffer.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<String, broadcast::Sender<Bytes>>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current subscriber count on a channel.
    #[must_use]
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels()
            .get(channel)
            .map_or(0, broadcast::Sender::receiver_count)
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PubSubBus for MemoryBus {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<usize, BusError> {
        let mut channels = self.channels();
        let Some(sender) = channels.get(channel) else {
            return Ok(0);
        };
        if sender.receiver_count() == 0 {
            channels.remove(channel);
            return Ok(0);
        }
        Ok(sender.send(payload).unwrap_or(0))
    }

    async fn subscribe(&self, channel: &str) -> Result<BusSubscription, BusError> {
        let receiver = self
            .channels()
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();

        let name = channel.to_string();
        let messages = BroadcastStream::new(receiver)
            .filter_map(move |result| {
                let name = name.clone();
                async move {
                    match result {
                        Ok(payload) => Some(payload),
                        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                            tracing::warn!(channel = %name, skipped, "bus subscriber lagged");
                            None
                        }
                    }
                }
            })
            .boxed();

        Ok(BusSubscription::new(channel, messages))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let bus = MemoryBus::new();
        let mut first = bus.subscribe("c").await.unwrap();
        let mut second = bus.subscribe("c").await.unwrap();

        let delivered = bus.publish("c", Bytes::from_static(b"hi")).await.unwrap();
        assert_eq!(delivered, 2);
        assert_eq!(first.next().await.unwrap(), Bytes::from_static(b"hi"));
        assert_eq!(second.next().await.unwrap(), Bytes::from_static(b"hi"));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_reports_zero() {
        let bus = MemoryBus::new();
        assert_eq!(bus.publish("nobody", Bytes::new()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_dropping_subscription_unsubscribes() {
        let bus = MemoryBus::new();
        let subscription = bus.subscribe("c").await.unwrap();
        assert_eq!(bus.subscriber_count("c"), 1);
        drop(subscription);
        assert_eq!(bus.subscriber_count("c"), 0);
        assert_eq!(bus.publish("c", Bytes::new()).await.unwrap(), 0);
    }
}
