pub mod in_memory;

pub use in_memory::InMemoryTransport;

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("command rejected: {message}")]
    Command { message: String },

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport closed")]
    Closed,
}

impl TransportError {
    pub fn command(message: impl Into<String>) -> Self {
        Self::Command {
            message: message.into(),
        }
    }
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Boundary to the backend: a request/response command call plus named,
/// topic-scoped push-event subscriptions. Everything behind it (ingestion,
/// search, inference, sync) is owned by the backend; this layer only projects
/// its state.
pub trait Transport: Send + Sync + 'static {
    /// Issue a command and await its result.
    fn invoke(&self, command: &str, args: Value) -> BoxFuture<'static, TransportResult<Value>>;

    /// Open a push-event subscription for a topic.
    /// Dropping the returned [`Subscription`] unsubscribes.
    fn subscribe(&self, topic: &str) -> Subscription;
}

/// Serialize args, invoke, deserialize the result.
pub async fn call<A, R>(
    transport: &dyn Transport,
    command: &str,
    args: &A,
) -> TransportResult<R>
where
    A: Serialize,
    R: DeserializeOwned,
{
    let args = serde_json::to_value(args)?;
    let result = transport.invoke(command, args).await?;
    Ok(serde_json::from_value(result)?)
}

type UnsubscribeFn = Box<dyn FnOnce() + Send>;

/// Live subscription to one event topic. Events arrive in emission order.
///
/// The subscription ends when the transport closes the topic; dropping it
/// unregisters the subscriber (idempotent).
pub struct Subscription {
    receiver: mpsc::UnboundedReceiver<Value>,
    unsubscribe: Option<UnsubscribeFn>,
}

impl Subscription {
    pub fn new(receiver: mpsc::UnboundedReceiver<Value>, unsubscribe: UnsubscribeFn) -> Self {
        Self {
            receiver,
            unsubscribe: Some(unsubscribe),
        }
    }

    /// Receive the next event payload; `None` once the topic is closed.
    pub async fn recv(&mut self) -> Option<Value> {
        self.receiver.recv().await
    }
}

impl Stream for Subscription {
    type Item = Value;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Value>> {
        self.receiver.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}
