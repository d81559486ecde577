//! Inbound message routing.
//!
//! Frames that are not responses (peer notifications and peer-initiated
//! requests) go to registered handlers in registration order, then to every
//! stream subscriber. Both see messages in arrival order.

use std::sync::{
    Arc, Mutex, PoisonError, RwLock,
    atomic::{AtomicU64, Ordering},
};

use tokio::sync::mpsc;
use toolwire_core::{Notification, Request};

/// Message initiated by the peer.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Notification(Notification),
    /// Expects a reply through `Connector::respond`.
    Request(Request),
}

impl InboundMessage {
    #[must_use]
    pub fn method(&self) -> &str {
        match self {
            Self::Notification(n) => &n.method,
            Self::Request(r) => &r.method,
        }
    }

    #[must_use]
    pub const fn params(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Notification(n) => n.params.as_ref(),
            Self::Request(r) => r.params.as_ref(),
        }
    }
}

/// Callback for inbound messages.
///
/// Runs on the connection's receive loop and must not block.
pub trait NotificationHandler: Send + Sync {
    fn handle(&self, message: &InboundMessage);
}

impl<F> NotificationHandler for F
where
    F: Fn(&InboundMessage) + Send + Sync,
{
    fn handle(&self, message: &InboundMessage) {
        self(message);
    }
}

/// Registration handle returned by [`NotificationRouter::add_handler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

struct Registration {
    id: HandlerId,
    method: Option<String>,
    handler: Arc<dyn NotificationHandler>,
}

/// Ordered handler registry plus stream subscribers.
#[derive(Default)]
pub struct NotificationRouter {
    handlers: RwLock<Vec<Registration>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<InboundMessage>>>,
    next_id: AtomicU64,
}

impl NotificationRouter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive every inbound message from now on, in arrival order.
    ///
    /// Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<InboundMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    fn register(&self, method: Option<String>, handler: Arc<dyn NotificationHandler>) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Registration {
                id,
                method,
                handler,
            });
        id
    }

    /// Register a handler for every inbound message.
    pub fn add_handler(&self, handler: impl NotificationHandler + 'static) -> HandlerId {
        self.register(None, Arc::new(handler))
    }

    /// Register a handler for one method only.
    pub fn add_method_handler(
        &self,
        method: impl Into<String>,
        handler: impl NotificationHandler + 'static,
    ) -> HandlerId {
        self.register(Some(method.into()), Arc::new(handler))
    }

    /// Returns whether a handler was removed.
    pub fn remove_handler(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        let before = handlers.len();
        handlers.retain(|r| r.id != id);
        handlers.len() != before
    }

    /// Deliver one message to handlers, then to subscribers.
    pub fn dispatch(&self, message: &InboundMessage) {
        let matching: Vec<Arc<dyn NotificationHandler>> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| r.method.as_deref().is_none_or(|m| m == message.method()))
            .map(|r| Arc::clone(&r.handler))
            .collect();
        let handled = !matching.is_empty();
        for handler in matching {
            handler.handle(message);
        }

        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| tx.send(message.clone()).is_ok());
        if !handled && subscribers.is_empty() && matches!(message, InboundMessage::Request(_)) {
            tracing::warn!(method = %message.method(), "peer request has nobody to answer it");
        }
    }

    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn note(method: &str, seq: i64) -> InboundMessage {
        InboundMessage::Notification(Notification::new(method, Some(json!({ "seq": seq }))))
    }

    #[test]
    fn test_handlers_run_in_registration_order_with_filters() {
        let router = NotificationRouter::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let log = Arc::clone(&seen);
        router.add_handler(move |m: &InboundMessage| {
            log.lock().unwrap().push(format!("all:{}", m.method()));
        });
        let log = Arc::clone(&seen);
        router.add_method_handler("progress", move |m: &InboundMessage| {
            log.lock().unwrap().push(format!("progress:{}", m.method()));
        });

        router.dispatch(&note("progress", 1));
        router.dispatch(&note("log", 2));

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["all:progress", "progress:progress", "all:log"]
        );
    }

    #[test]
    fn test_remove_handler() {
        let router = NotificationRouter::new();
        let id = router.add_handler(|_: &InboundMessage| {});
        assert_eq!(router.handler_count(), 1);
        assert!(router.remove_handler(id));
        assert!(!router.remove_handler(id));
        assert_eq!(router.handler_count(), 0);
    }

    #[tokio::test]
    async fn test_every_subscriber_sees_every_message_in_order() {
        let router = NotificationRouter::new();
        let mut first = router.subscribe();
        let mut second = router.subscribe();

        for seq in 0..10 {
            router.dispatch(&note("tick", seq));
        }

        for rx in [&mut first, &mut second] {
            for seq in 0..10 {
                assert_eq!(rx.recv().await.unwrap(), note("tick", seq));
            }
        }
    }

    #[test]
    fn test_dropped_subscriber_is_pruned() {
        let router = NotificationRouter::new();
        let rx = router.subscribe();
        drop(rx);
        router.dispatch(&note("tick", 0));
        assert_eq!(router.subscriber_count(), 0);
    }
}
