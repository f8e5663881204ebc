use std::sync::{Arc, Weak};

use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::json;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::transport::{Subscription, Transport, TransportError, call};

use super::conversation::{
    AgentEvent, BlockDelta, ChatMessage, ContentBlock, Conversation, Role, agent_event_topic,
};

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("no active conversation")]
    NoConversation,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Streaming buffer for one generation turn.
///
/// `seq` increases monotonically per session; events arriving after the turn
/// was closed (completion, error, or local cancellation) find no active turn
/// and are dropped.
struct ActiveTurn {
    seq: u64,
    blocks: Vec<ContentBlock>,
}

struct SessionInner {
    conversation_id: Option<String>,
    transcript: Vec<ChatMessage>,
    turn: Option<ActiveTurn>,
    turn_seq: u64,
    last_error: Option<String>,
}

/// Per-conversation reconciler: turns the ordered `agent-event-{id}` stream
/// into a transcript of role-tagged content blocks, coordinating with the
/// persisted snapshot fetched from the backend.
///
/// Holds at most one live topic subscription; attaching a conversation
/// replaces any previous one.
pub struct ChatSession {
    transport: Arc<dyn Transport>,
    inner: Mutex<SessionInner>,
    generating: watch::Sender<bool>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl ChatSession {
    pub fn new(transport: Arc<dyn Transport>) -> Arc<Self> {
        let (generating, _) = watch::channel(false);
        Arc::new(Self {
            transport,
            inner: Mutex::new(SessionInner {
                conversation_id: None,
                transcript: Vec::new(),
                turn: None,
                turn_seq: 0,
                last_error: None,
            }),
            generating,
            pump: Mutex::new(None),
        })
    }

    /// Create a fresh conversation on the backend and attach to it.
    pub async fn start_new(self: &Arc<Self>, model_id: &str) -> Result<Conversation, ChatError> {
        let conversation: Conversation = call(
            &*self.transport,
            "start_chat",
            &json!({"modelId": model_id}),
        )
        .await?;
        self.attach(&conversation);
        Ok(conversation)
    }

    /// Load a persisted conversation by id and attach to it.
    pub async fn load(self: &Arc<Self>, conversation_id: &str) -> Result<Conversation, ChatError> {
        let conversation: Conversation = call(
            &*self.transport,
            "load_conversation",
            &json!({"conversationId": conversation_id}),
        )
        .await?;
        self.attach(&conversation);
        Ok(conversation)
    }

    /// Attach to a conversation snapshot: flatten its stored messages into
    /// the transcript and (re)subscribe to its event topic.
    pub fn attach(self: &Arc<Self>, conversation: &Conversation) {
        if let Some(previous) = self.pump.lock().take() {
            previous.abort();
        }

        {
            let mut inner = self.inner.lock();
            inner.conversation_id = Some(conversation.id.clone());
            inner.transcript = conversation.flatten_messages();
            inner.turn = None;
            inner.last_error = None;
        }
        self.generating.send_replace(false);

        let subscription = self
            .transport
            .subscribe(&agent_event_topic(&conversation.id));
        let session = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            Self::pump_events(session, subscription).await;
        });
        *self.pump.lock() = Some(handle);
    }

    /// Send a user message and open a new generation turn.
    ///
    /// The user message is appended optimistically and never rolled back;
    /// the turn itself is torn down if the command is rejected.
    pub async fn send(&self, text: &str) -> Result<(), ChatError> {
        let (conversation_id, seq) = {
            let mut inner = self.inner.lock();
            let conversation_id = inner
                .conversation_id
                .clone()
                .ok_or(ChatError::NoConversation)?;

            inner.transcript.push(ChatMessage {
                role: Role::User,
                block: ContentBlock::text(text),
            });
            inner.turn_seq += 1;
            let seq = inner.turn_seq;
            inner.turn = Some(ActiveTurn {
                seq,
                blocks: Vec::new(),
            });
            inner.last_error = None;
            (conversation_id, seq)
        };
        self.generating.send_replace(true);

        let args = json!({"conversationId": conversation_id, "message": text});
        if let Err(e) = self.transport.invoke("send_message", args).await {
            let mut inner = self.inner.lock();
            if inner.turn.as_ref().is_some_and(|turn| turn.seq == seq) {
                inner.turn = None;
                inner.last_error = Some(e.to_string());
                self.generating.send_replace(false);
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// Request cancellation and stop locally right away.
    ///
    /// The local stop is optimistic: the backend may still emit events for
    /// the cancelled turn, which the closed turn sequence then drops.
    pub async fn cancel(&self) -> Result<(), ChatError> {
        let conversation_id = {
            let mut inner = self.inner.lock();
            let conversation_id = inner
                .conversation_id
                .clone()
                .ok_or(ChatError::NoConversation)?;
            if let Some(turn) = inner.turn.take() {
                debug!(turn = turn.seq, "Cancelled turn locally");
            }
            conversation_id
        };
        self.generating.send_replace(false);

        self.transport
            .invoke(
                "cancel_generation",
                json!({"conversationId": conversation_id}),
            )
            .await?;
        Ok(())
    }

    pub fn conversation_id(&self) -> Option<String> {
        self.inner.lock().conversation_id.clone()
    }

    pub fn transcript(&self) -> Vec<ChatMessage> {
        self.inner.lock().transcript.clone()
    }

    pub fn is_generating(&self) -> bool {
        *self.generating.borrow()
    }

    pub fn watch_generating(&self) -> watch::Receiver<bool> {
        self.generating.subscribe()
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.lock().last_error.clone()
    }

    async fn pump_events(session: Weak<Self>, mut subscription: Subscription) {
        while let Some(payload) = subscription.next().await {
            let Some(session) = session.upgrade() else {
                return;
            };
            match serde_json::from_value::<AgentEvent>(payload) {
                Ok(event) => session.handle_event(event),
                Err(e) => warn!(error = %e, "Undecodable agent event, dropped"),
            }
        }
    }

    fn handle_event(&self, event: AgentEvent) {
        let mut inner = self.inner.lock();
        if inner.turn.is_none() {
            debug!("Agent event with no active turn, dropped");
            return;
        }

        match event {
            AgentEvent::ContentBlockStart { block } => {
                if let Some(turn) = inner.turn.as_mut() {
                    turn.blocks.push(block);
                }
            }
            AgentEvent::ContentBlockDelta { delta } => {
                if let Some(turn) = inner.turn.as_mut() {
                    match (turn.blocks.last_mut(), delta) {
                        (Some(ContentBlock::Text { text }), BlockDelta::Text { text: chunk }) => {
                            text.push_str(&chunk);
                        }
                        (_, BlockDelta::Text { .. }) => {
                            debug!("Delta without a matching trailing block, dropped");
                        }
                    }
                }
            }
            // Advisory: the buffer already holds the finished block.
            AgentEvent::ContentBlockStop => {}
            AgentEvent::Done => {
                if let Some(turn) = inner.turn.take() {
                    debug!(turn = turn.seq, blocks = turn.blocks.len(), "Turn completed");
                    for block in turn.blocks {
                        inner.transcript.push(ChatMessage {
                            role: Role::Assistant,
                            block,
                        });
                    }
                }
                self.generating.send_replace(false);
            }
            AgentEvent::Error { message } => {
                if let Some(turn) = inner.turn.take() {
                    warn!(
                        turn = turn.seq,
                        dropped_blocks = turn.blocks.len(),
                        error = %message,
                        "Turn failed, streamed content discarded"
                    );
                }
                inner.last_error = Some(message);
                self.generating.send_replace(false);
            }
        }
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }
}
