//! Client-side state layer for the quire document workspace.
//!
//! The backend (document ingestion, embedding, search, P2P sync, inference)
//! is reached only through the [`transport::Transport`] port: request/response
//! commands plus topic-scoped push events. The stores here are volatile
//! projections of backend state, rebuilt from RPC snapshots and kept live by
//! per-topic event pumps.

pub mod boot;
pub mod chat;
pub mod library;
pub mod models;
pub mod transport;

pub use boot::{AppPhase, BootEvent, BootSequencer};
pub use chat::{AgentEvent, ChatMessage, ChatSession, ContentBlock, Conversation, Role};
pub use library::{BatchProgress, Collection, Document, LibraryStore, ProgressStore};
pub use models::{ModelClass, ModelState, ModelStore, ProviderConfig, ProviderStore};
pub use transport::{
    BoxFuture, InMemoryTransport, Subscription, Transport, TransportError, TransportResult,
};
