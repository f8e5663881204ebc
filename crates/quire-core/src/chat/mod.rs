pub mod conversation;
pub mod session;

pub use conversation::{
    AgentEvent, BlockDelta, ChatMessage, ContentBlock, Conversation, PersistedMessage, Role,
    agent_event_topic,
};
pub use session::{ChatError, ChatSession};
