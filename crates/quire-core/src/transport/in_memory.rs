use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use super::{BoxFuture, Subscription, Transport, TransportResult};

type CommandHandler = Box<dyn Fn(Value) -> TransportResult<Value> + Send + Sync>;

struct Subscriber {
    id: u64,
    sender: mpsc::UnboundedSender<Value>,
}

#[derive(Default)]
struct Inner {
    handlers: Mutex<HashMap<String, CommandHandler>>,
    topics: Mutex<HashMap<String, Vec<Subscriber>>>,
    invocations: Mutex<Vec<(String, Value)>>,
    next_subscriber_id: AtomicU64,
}

/// In-memory transport for testing and development.
///
/// Commands resolve synchronously against scripted handlers (unscripted
/// commands succeed with `null`); every invocation is recorded for
/// assertions. Events are published manually, and closing a topic ends its
/// subscriptions so event pumps terminate deterministically.
#[derive(Clone, Default)]
pub struct InMemoryTransport {
    inner: Arc<Inner>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the result of a command.
    pub fn on_command<F>(&self, command: &str, handler: F)
    where
        F: Fn(Value) -> TransportResult<Value> + Send + Sync + 'static,
    {
        self.inner
            .handlers
            .lock()
            .insert(command.to_string(), Box::new(handler));
    }

    /// Deliver an event to every subscriber of `topic`.
    pub fn publish(&self, topic: &str, payload: Value) {
        let mut topics = self.inner.topics.lock();
        if let Some(subscribers) = topics.get_mut(topic) {
            subscribers.retain(|s| s.sender.send(payload.clone()).is_ok());
        }
    }

    /// Close a topic, ending all of its subscriptions.
    pub fn close_topic(&self, topic: &str) {
        self.inner.topics.lock().remove(topic);
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner
            .topics
            .lock()
            .get(topic)
            .map_or(0, |subscribers| subscribers.len())
    }

    /// Recorded `(command, args)` pairs, in invocation order.
    pub fn invocations(&self) -> Vec<(String, Value)> {
        self.inner.invocations.lock().clone()
    }

    pub fn invocation_count(&self, command: &str) -> usize {
        self.inner
            .invocations
            .lock()
            .iter()
            .filter(|(name, _)| name == command)
            .count()
    }
}

impl Transport for InMemoryTransport {
    fn invoke(&self, command: &str, args: Value) -> BoxFuture<'static, TransportResult<Value>> {
        self.inner
            .invocations
            .lock()
            .push((command.to_string(), args.clone()));

        let result = match self.inner.handlers.lock().get(command) {
            Some(handler) => handler(args),
            None => Ok(Value::Null),
        };

        Box::pin(async move { result })
    }

    fn subscribe(&self, topic: &str) -> Subscription {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = self.inner.next_subscriber_id.fetch_add(1, Ordering::Relaxed);

        self.inner
            .topics
            .lock()
            .entry(topic.to_string())
            .or_default()
            .push(Subscriber { id, sender });

        let inner = self.inner.clone();
        let topic = topic.to_string();
        Subscription::new(
            receiver,
            Box::new(move || {
                let mut topics = inner.topics.lock();
                if let Some(subscribers) = topics.get_mut(&topic) {
                    subscribers.retain(|s| s.id != id);
                }
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::transport::{TransportError, call};

    #[tokio::test]
    async fn test_unscripted_command_returns_null() {
        let transport = InMemoryTransport::new();
        let result = transport.invoke("anything", json!({})).await.unwrap();
        assert_eq!(result, Value::Null);
        assert_eq!(transport.invocation_count("anything"), 1);
    }

    #[tokio::test]
    async fn test_scripted_command_result_and_rejection() {
        let transport = InMemoryTransport::new();
        transport.on_command("echo", |args| Ok(args));
        transport.on_command("fail", |_| Err(TransportError::command("nope")));

        let result = transport.invoke("echo", json!({"a": 1})).await.unwrap();
        assert_eq!(result, json!({"a": 1}));

        let err = transport.invoke("fail", json!({})).await.unwrap_err();
        assert!(matches!(err, TransportError::Command { .. }));
    }

    #[tokio::test]
    async fn test_typed_call_round_trip() {
        let transport = InMemoryTransport::new();
        transport.on_command("sum", |_| Ok(json!(3)));

        let result: u32 = call(&transport, "sum", &json!({"a": 1, "b": 2}))
            .await
            .unwrap();
        assert_eq!(result, 3);
    }

    #[tokio::test]
    async fn test_publish_reaches_only_topic_subscribers() {
        let transport = InMemoryTransport::new();
        let mut a = transport.subscribe("topic-a");
        let mut b = transport.subscribe("topic-b");

        transport.publish("topic-a", json!(1));
        transport.close_topic("topic-a");
        transport.close_topic("topic-b");

        assert_eq!(a.recv().await, Some(json!(1)));
        assert_eq!(a.recv().await, None);
        assert_eq!(b.recv().await, None);
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let transport = InMemoryTransport::new();
        let subscription = transport.subscribe("topic");
        assert_eq!(transport.subscriber_count("topic"), 1);

        drop(subscription);
        assert_eq!(transport.subscriber_count("topic"), 0);
    }
}
