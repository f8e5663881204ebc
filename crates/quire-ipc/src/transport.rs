use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex as SyncMutex;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, info, warn};

use quire_core::transport::{
    BoxFuture, Subscription, Transport, TransportError, TransportResult,
};

use crate::proto::{Frame, encode_request, parse_frame};

pub type IpcWriter = Box<dyn AsyncWrite + Send + Unpin>;
pub type IpcReader = Box<dyn AsyncRead + Send + Unpin>;

/// Environment variable overriding backend sidecar discovery.
pub const BACKEND_BIN_ENV: &str = "QUIRED_BIN";

const BACKEND_BIN: &str = "quired";

#[derive(Default)]
pub struct IpcConfig {
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

struct TopicSubscriber {
    id: u64,
    sender: mpsc::UnboundedSender<Value>,
}

type PendingRequests = HashMap<i64, oneshot::Sender<TransportResult<Value>>>;

struct IpcInner {
    writer: Mutex<IpcWriter>,
    pending: SyncMutex<PendingRequests>,
    topics: SyncMutex<HashMap<String, Vec<TopicSubscriber>>>,
    request_counter: AtomicI64,
    subscriber_counter: AtomicU64,
    closed: AtomicBool,
}

/// [`Transport`] over the stdio of the `quired` backend sidecar.
///
/// Requests are line-delimited JSON with integer ids; a reader task routes
/// responses to their pending request and push events to per-topic
/// subscriber channels. When the connection ends, pending requests fail and
/// open subscriptions close.
pub struct IpcTransport {
    inner: Arc<IpcInner>,
    process: SyncMutex<Option<Child>>,
    reader_task: SyncMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl IpcTransport {
    /// Spawn the backend sidecar and connect to its stdio.
    pub async fn spawn(config: IpcConfig) -> Result<Self> {
        let program = resolve_backend_bin().context("unable to find quired backend executable")?;
        info!(program = %program.display(), "Spawning quire backend");

        let mut cmd = Command::new(program);
        cmd.arg("serve")
            .kill_on_drop(true)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        if let Some(cwd) = config.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in config.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().context("failed to spawn quired")?;
        let stdin = child.stdin.take().context("quired stdin missing")?;
        let stdout = child.stdout.take().context("quired stdout missing")?;

        let transport = Self::connect_with_io(Box::new(stdin), Box::new(stdout));
        *transport.process.lock() = Some(child);
        Ok(transport)
    }

    /// Connect over arbitrary byte streams. Test seam; `spawn` uses it with
    /// the child's stdio.
    pub fn connect_with_io(writer: IpcWriter, reader: IpcReader) -> Self {
        let inner = Arc::new(IpcInner {
            writer: Mutex::new(writer),
            pending: SyncMutex::new(PendingRequests::new()),
            topics: SyncMutex::new(HashMap::new()),
            request_counter: AtomicI64::new(1),
            subscriber_counter: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });

        let reader_inner = inner.clone();
        let reader_task = tokio::spawn(async move {
            read_loop(reader_inner, reader).await;
        });

        Self {
            inner,
            process: SyncMutex::new(None),
            reader_task: SyncMutex::new(Some(reader_task)),
        }
    }

    /// Kill the sidecar (if we spawned one) and wait for the reader to stop.
    pub async fn shutdown(&self) -> Result<()> {
        let process = self.process.lock().take();
        if let Some(mut process) = process {
            let _ = process.kill().await;
            let _ = process.wait().await;
        }
        let task = self.reader_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        Ok(())
    }
}

impl Transport for IpcTransport {
    fn invoke(&self, command: &str, args: Value) -> BoxFuture<'static, TransportResult<Value>> {
        let inner = self.inner.clone();
        let command = command.to_string();
        Box::pin(async move { inner.request(&command, args).await })
    }

    fn subscribe(&self, topic: &str) -> Subscription {
        self.inner.subscribe(topic)
    }
}

impl Drop for IpcTransport {
    fn drop(&mut self) {
        if let Some(task) = self.reader_task.lock().take() {
            task.abort();
        }
    }
}

impl IpcInner {
    async fn request(&self, command: &str, args: Value) -> TransportResult<Value> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }

        let id = self.request_counter.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let line = encode_request(id, command, &args);
        debug!(id, command, "Backend request");
        if let Err(e) = self.send_line(&line).await {
            self.pending.lock().remove(&id);
            return Err(e);
        }

        match rx.await {
            Ok(result) => result,
            // Reader dropped the sender: connection went away mid-request.
            Err(_) => Err(TransportError::Closed),
        }
    }

    async fn send_line(&self, line: &str) -> TransportResult<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok(())
    }

    fn subscribe(self: &Arc<Self>, topic: &str) -> Subscription {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = self.subscriber_counter.fetch_add(1, Ordering::Relaxed);

        self.topics
            .lock()
            .entry(topic.to_string())
            .or_default()
            .push(TopicSubscriber { id, sender });

        let inner = Arc::downgrade(self);
        let topic = topic.to_string();
        Subscription::new(
            receiver,
            Box::new(move || {
                if let Some(inner) = inner.upgrade() {
                    let mut topics = inner.topics.lock();
                    if let Some(subscribers) = topics.get_mut(&topic) {
                        subscribers.retain(|s| s.id != id);
                    }
                }
            }),
        )
    }
}

async fn read_loop(inner: Arc<IpcInner>, reader: IpcReader) {
    let mut lines = BufReader::new(reader).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        match parse_frame(trimmed) {
            Some(Frame::Response { id, result }) => {
                let sender = inner.pending.lock().remove(&id);
                match sender {
                    Some(sender) => {
                        let result =
                            result.map_err(|message| TransportError::Command { message });
                        let _ = sender.send(result);
                    }
                    None => warn!(id, "Backend response without pending request"),
                }
            }
            Some(Frame::Event { topic, payload }) => {
                let mut topics = inner.topics.lock();
                if let Some(subscribers) = topics.get_mut(&topic) {
                    subscribers.retain(|s| s.sender.send(payload.clone()).is_ok());
                }
            }
            None => warn!(line = %trimmed, "Unparseable backend frame, skipped"),
        }
    }

    // Connection gone: fail everything that was still waiting on it.
    inner.closed.store(true, Ordering::Release);
    let pending: Vec<_> = inner.pending.lock().drain().collect();
    for (_, sender) in pending {
        let _ = sender.send(Err(TransportError::Closed));
    }
    inner.topics.lock().clear();
    debug!("Backend connection closed");
}

fn common_bin_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Some(home) = dirs::home_dir() {
        dirs.push(home.join(".local/bin"));
        dirs.push(home.join(".cargo/bin"));
    }
    for path in ["/opt/homebrew/bin", "/usr/local/bin", "/usr/bin"] {
        dirs.push(PathBuf::from(path));
    }
    dirs
}

fn resolve_backend_bin() -> Option<PathBuf> {
    if let Ok(value) = std::env::var(BACKEND_BIN_ENV) {
        let trimmed = value.trim();
        if !trimmed.is_empty() {
            let candidate = PathBuf::from(trimmed);
            if candidate.is_file() {
                return Some(candidate);
            }
            if let Ok(found) = which::which(trimmed) {
                return Some(found);
            }
        }
    }

    if let Ok(found) = which::which(BACKEND_BIN) {
        return Some(found);
    }

    common_bin_dirs()
        .into_iter()
        .map(|dir| dir.join(BACKEND_BIN))
        .find(|candidate| candidate.is_file())
}

/// Check whether the backend sidecar is installed on this system.
pub fn is_backend_available() -> bool {
    resolve_backend_bin().is_some()
}
