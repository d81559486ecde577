//! Per-session delivery of server-originated messages.
//!
//! Every session has one bus channel (`toolwire:stream:{id}`). Any instance
//! may publish to it; the instance that called [`StreamManager::create_stream`]
//! queues what arrives for its live consumer. Creating a stream publishes a
//! claim on the channel, and any other instance still holding that session
//! closes its copy, so exactly one instance forwards at a time. A new stream
//! forwards nothing until its own claim comes back off the bus; the bus
//! keeps per-channel order, so anything published earlier reaches the
//! previous owner before that owner sees the claim.
//!
//! Delivery is at-most-once: nothing is retried, a message published while no
//! instance holds the stream is rejected with [`DeliveryError::NoSubscriber`],
//! and a full queue discards according to its [`OverflowPolicy`].
//!
//! [`OverflowPolicy`]: toolwire_core::OverflowPolicy

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use bytes::Bytes;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinHandle;
use toolwire_core::{
    BusError, BusSubscription, PubSubBus, PushOutcome, SessionId, StreamMessage, StreamQueue,
    session::session_channel,
};
use uuid::Uuid;

use crate::config::StreamConfig;

/// Stream delivery error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("No live subscriber for session {0}")]
    NoSubscriber(SessionId),
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),
    #[error("Envelope encoding error: {0}")]
    Encode(String),
}

/// Outcome of a successful publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishReceipt {
    /// Instances that received the message from the bus.
    pub subscribers: usize,
}

/// Delivery counters for one local stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StreamStats {
    /// Messages taken off the bus.
    pub received: u64,
    /// Messages handed to the consumer.
    pub delivered: u64,
    /// Messages discarded by the overflow policy.
    pub dropped: u64,
    /// Messages waiting in the queue.
    pub queued: usize,
}

/// What travels on a session channel.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum BusEnvelope {
    Message { message: StreamMessage },
    Claim { instance: String, generation: u64 },
}

impl BusEnvelope {
    fn encode(&self) -> Result<Bytes, DeliveryError> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| DeliveryError::Encode(e.to_string()))
    }
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    delivered: AtomicU64,
}

struct LocalStream {
    generation: u64,
    queue: Arc<StreamQueue<StreamMessage>>,
    counters: Arc<Counters>,
    forwarder: JoinHandle<()>,
}

impl LocalStream {
    fn stats(&self) -> StreamStats {
        stats_of(&self.queue, &self.counters)
    }

    /// Close the queue. The forwarder is left to finish on its own.
    fn release(self) -> usize {
        self.queue.close()
    }

    /// Stop the forwarder (unsubscribing from the bus) and close the queue.
    fn shutdown(self) -> usize {
        self.forwarder.abort();
        self.release()
    }
}

fn stats_of(queue: &StreamQueue<StreamMessage>, counters: &Counters) -> StreamStats {
    StreamStats {
        received: counters.received.load(Ordering::Relaxed),
        delivered: counters.delivered.load(Ordering::Relaxed),
        dropped: queue.dropped(),
        queued: queue.len(),
    }
}

/// Streams held by this instance.
#[derive(Default)]
struct Registry {
    streams: Mutex<HashMap<SessionId, LocalStream>>,
}

impl Registry {
    fn lock(&self) -> MutexGuard<'_, HashMap<SessionId, LocalStream>> {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, session_id: &str, stream: LocalStream) -> Option<LocalStream> {
        self.lock().insert(session_id.to_string(), stream)
    }

    fn remove(&self, session_id: &str) -> Option<LocalStream> {
        self.lock().remove(session_id)
    }

    /// Remove the stream only if it is still the given generation.
    fn remove_if(&self, session_id: &str, generation: u64) -> Option<LocalStream> {
        let mut streams = self.lock();
        if streams.get(session_id)?.generation == generation {
            streams.remove(session_id)
        } else {
            None
        }
    }
}

/// Per-session stream fan-out over a [`PubSubBus`].
pub struct StreamManager {
    instance_id: String,
    bus: Arc<dyn PubSubBus>,
    config: StreamConfig,
    registry: Arc<Registry>,
    generations: AtomicU64,
}

impl StreamManager {
    /// Create a manager with a random instance identifier.
    #[must_use]
    pub fn new(bus: Arc<dyn PubSubBus>, config: StreamConfig) -> Self {
        Self {
            instance_id: Uuid::new_v4().to_string(),
            bus,
            config,
            registry: Arc::new(Registry::default()),
            generations: AtomicU64::new(0),
        }
    }

    /// Override the instance identifier used in ownership claims.
    #[must_use]
    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = instance_id.into();
        self
    }

    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Subscribe this instance to the session's channel and take ownership
    /// of delivery.
    ///
    /// Replaces any stream this instance already holds for the session.
    ///
    /// # Errors
    /// Returns error if the bus rejects the subscription or the claim.
    pub async fn create_stream(&self, session_id: &str) -> Result<SessionStream, DeliveryError> {
        let channel = session_channel(session_id);
        let subscription = self.bus.subscribe(&channel).await?;
        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;

        let queue = Arc::new(StreamQueue::new(
            self.config.queue_capacity,
            self.config.overflow,
        ));
        let counters = Arc::new(Counters::default());
        let forwarder = tokio::spawn(forward(Forwarder {
            session_id: session_id.to_string(),
            generation,
            instance_id: self.instance_id.clone(),
            subscription,
            queue: Arc::clone(&queue),
            counters: Arc::clone(&counters),
            registry: Arc::clone(&self.registry),
        }));

        let local = LocalStream {
            generation,
            queue: Arc::clone(&queue),
            counters: Arc::clone(&counters),
            forwarder,
        };
        if let Some(previous) = self.registry.insert(session_id, local) {
            let released = previous.shutdown();
            tracing::debug!(session_id, released, "replaced local stream");
        }

        let claim = BusEnvelope::Claim {
            instance: self.instance_id.clone(),
            generation,
        };
        if let Err(e) = self.publish_envelope(&channel, &claim).await {
            if let Some(stream) = self.registry.remove_if(session_id, generation) {
                stream.shutdown();
            }
            return Err(e);
        }

        tracing::info!(session_id, generation, instance = %self.instance_id, "stream created");
        Ok(SessionStream {
            session_id: session_id.to_string(),
            generation,
            queue,
            counters,
            registry: Arc::clone(&self.registry),
        })
    }

    /// Publish a message to whichever instance holds the session's stream.
    ///
    /// # Errors
    /// Returns [`DeliveryError::NoSubscriber`] when no instance holds the
    /// stream, or the bus error if publishing fails.
    pub async fn publish(
        &self,
        session_id: &str,
        payload: Value,
    ) -> Result<PublishReceipt, DeliveryError> {
        let envelope = BusEnvelope::Message {
            message: StreamMessage::new(session_id, payload),
        };
        let subscribers = self
            .publish_envelope(&session_channel(session_id), &envelope)
            .await?;
        if subscribers == 0 {
            tracing::debug!(session_id, "no live subscriber, message dropped");
            return Err(DeliveryError::NoSubscriber(session_id.to_string()));
        }
        Ok(PublishReceipt { subscribers })
    }

    async fn publish_envelope(
        &self,
        channel: &str,
        envelope: &BusEnvelope,
    ) -> Result<usize, DeliveryError> {
        Ok(self.bus.publish(channel, envelope.encode()?).await?)
    }

    /// Unsubscribe from the session's channel and release queued messages.
    ///
    /// Returns how many undelivered messages were released.
    pub fn close_stream(&self, session_id: &str) -> usize {
        let Some(stream) = self.registry.remove(session_id) else {
            return 0;
        };
        let released = stream.shutdown();
        tracing::info!(session_id, released, "stream closed");
        released
    }

    /// Whether this instance holds a stream for the session.
    #[must_use]
    pub fn has_stream(&self, session_id: &str) -> bool {
        self.registry.lock().contains_key(session_id)
    }

    /// Counters for a locally held stream.
    #[must_use]
    pub fn stats(&self, session_id: &str) -> Option<StreamStats> {
        self.registry.lock().get(session_id).map(LocalStream::stats)
    }

    /// Sessions with a stream on this instance.
    #[must_use]
    pub fn active_streams(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.registry.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Close every local stream. Returns how many were closed.
    pub fn close_all(&self) -> usize {
        let streams: Vec<(SessionId, LocalStream)> = self.registry.lock().drain().collect();
        let count = streams.len();
        for (session_id, stream) in streams {
            let released = stream.shutdown();
            tracing::debug!(session_id = %session_id, released, "stream closed");
        }
        count
    }
}

impl Drop for StreamManager {
    fn drop(&mut self) {
        self.close_all();
    }
}

struct Forwarder {
    session_id: SessionId,
    generation: u64,
    instance_id: String,
    subscription: BusSubscription,
    queue: Arc<StreamQueue<StreamMessage>>,
    counters: Arc<Counters>,
    registry: Arc<Registry>,
}

/// Bus-to-queue loop for one local stream.
async fn forward(mut task: Forwarder) {
    let session_id = task.session_id.as_str();
    let mut claimed = false;
    let reason = loop {
        let Some(bytes) = task.subscription.next().await else {
            break "bus subscription ended";
        };
        match serde_json::from_slice::<BusEnvelope>(&bytes) {
            Ok(BusEnvelope::Message { .. }) if !claimed => {
                tracing::debug!(session_id, "message predates our claim, left to the previous owner");
            }
            Ok(BusEnvelope::Message { message }) => {
                task.counters.received.fetch_add(1, Ordering::Relaxed);
                match task.queue.push(message) {
                    PushOutcome::Queued => {}
                    PushOutcome::DroppedOldest | PushOutcome::DroppedNewest => {
                        tracing::warn!(
                            session_id,
                            capacity = task.queue.capacity(),
                            dropped = task.queue.dropped(),
                            "stream queue full, message dropped"
                        );
                    }
                    PushOutcome::Closed => break "queue closed",
                }
            }
            Ok(BusEnvelope::Claim {
                instance,
                generation,
            }) if instance == task.instance_id => {
                if generation == task.generation {
                    claimed = true;
                }
            }
            Ok(BusEnvelope::Claim {
                instance,
                generation,
            }) => {
                tracing::info!(
                    session_id,
                    owner = %instance,
                    owner_generation = generation,
                    "stream claimed by another instance"
                );
                break "superseded";
            }
            Err(e) => {
                tracing::warn!(session_id, error = %e, "malformed bus envelope");
            }
        }
    };

    drop(task.subscription);
    if let Some(stream) = task.registry.remove_if(session_id, task.generation) {
        let released = stream.release();
        tracing::debug!(session_id, released, reason, "stream ended");
    }
}

/// Consumer handle for a local stream.
///
/// Dropping the handle closes the stream, unless it has since been replaced.
pub struct SessionStream {
    session_id: SessionId,
    generation: u64,
    queue: Arc<StreamQueue<StreamMessage>>,
    counters: Arc<Counters>,
    registry: Arc<Registry>,
}

impl SessionStream {
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Wait for the next message. Returns `None` once the stream is closed
    /// or superseded.
    pub async fn recv(&self) -> Option<StreamMessage> {
        let message = self.queue.recv().await?;
        self.counters.delivered.fetch_add(1, Ordering::Relaxed);
        Some(message)
    }

    /// Take the next message without waiting.
    pub fn try_recv(&self) -> Option<StreamMessage> {
        let message = self.queue.try_recv()?;
        self.counters.delivered.fetch_add(1, Ordering::Relaxed);
        Some(message)
    }

    #[must_use]
    pub fn stats(&self) -> StreamStats {
        stats_of(&self.queue, &self.counters)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }

    /// Adapt into a `Stream` of messages.
    pub fn into_stream(self) -> impl Stream<Item = StreamMessage> + Send {
        futures::stream::unfold(self, |stream| async move {
            let message = stream.recv().await?;
            Some((message, stream))
        })
    }
}

impl Drop for SessionStream {
    fn drop(&mut self) {
        if let Some(stream) = self.registry.remove_if(&self.session_id, self.generation) {
            let released = stream.shutdown();
            tracing::debug!(session_id = %self.session_id, released, "stream handle dropped");
        }
    }
}
