use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Who authored a content block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// One unit of conversation content.
///
/// Immutable once finalized; `Text` blocks grow by delta concatenation only
/// while they sit in a turn's streaming buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        arguments: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
    Thinking {
        text: String,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

/// Streamed addition to the trailing block of a turn buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum BlockDelta {
    Text { text: String },
}

/// One transcript entry. A turn with several blocks becomes several
/// `ChatMessage`s sharing a role, in emission order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub block: ContentBlock,
}

/// Backend storage groups a turn's blocks under one message; the transcript
/// flattens them back out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedMessage {
    pub role: Role,
    pub blocks: Vec<ContentBlock>,
}

/// Authoritative conversation snapshot, owned by the backend. Fetched whole;
/// never reconstructed locally from deltas except for the in-flight turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub messages: Vec<PersistedMessage>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Conversation {
    /// Flatten stored messages into ordered role+block transcript entries.
    pub fn flatten_messages(&self) -> Vec<ChatMessage> {
        self.messages
            .iter()
            .flat_map(|message| {
                message.blocks.iter().map(|block| ChatMessage {
                    role: message.role,
                    block: block.clone(),
                })
            })
            .collect()
    }
}

/// Push event on a conversation's `agent-event-{id}` topic.
///
/// The transport delivers these in emission order per topic; exactly one
/// terminal event (`Done` or `Error`) ends a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum AgentEvent {
    ContentBlockStart { block: ContentBlock },
    ContentBlockDelta { delta: BlockDelta },
    ContentBlockStop,
    Done,
    Error { message: String },
}

pub fn agent_event_topic(conversation_id: &str) -> String {
    format!("agent-event-{conversation_id}")
}
