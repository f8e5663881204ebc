//! Stdio JSON-line transport to the quire backend sidecar.
//!
//! Implements [`quire_core::transport::Transport`] over the stdin/stdout of a
//! spawned `quired` process: requests carry integer ids and resolve from the
//! matching response line; push events are routed by topic to subscriptions.

mod proto;
mod transport;

pub use transport::{
    BACKEND_BIN_ENV, IpcConfig, IpcReader, IpcTransport, IpcWriter, is_backend_available,
};
