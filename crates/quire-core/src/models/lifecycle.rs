use std::sync::{Arc, Weak};

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::sync::{OnceCell, watch};
use tracing::{debug, warn};

use crate::transport::{Subscription, Transport, TransportError};

/// Model class served by the backend. Each class has its own command pair
/// and download topics, and its own [`ModelStore`] instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelClass {
    Language,
    Embedding,
}

impl ModelClass {
    pub fn download_command(self) -> &'static str {
        match self {
            Self::Language => "download_model",
            Self::Embedding => "download_embedding_model",
        }
    }

    pub fn configure_command(self) -> &'static str {
        match self {
            Self::Language => "configure_model",
            Self::Embedding => "configure_embedding_model",
        }
    }

    pub fn progress_topic(self) -> &'static str {
        match self {
            Self::Language => "model-download-progress",
            Self::Embedding => "embedding-model-download-progress",
        }
    }

    pub fn complete_topic(self) -> &'static str {
        match self {
            Self::Language => "model-download-complete",
            Self::Embedding => "embedding-model-download-complete",
        }
    }
}

/// Progress of the download session in flight. Monotonic non-decreasing
/// within one session; cleared between sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadProgress {
    pub file: String,
    pub downloaded: u64,
    pub total: u64,
    pub overall_progress: f64,
    pub file_index: u32,
    pub total_files: u32,
}

/// Terminal event on a class's download-complete topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum DownloadOutcome {
    Completed { model_id: String },
    Failed { model_id: String, error: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelStatus {
    Idle,
    Downloading,
    Configuring,
}

/// Download/configure lifecycle state for one model class.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelState {
    pub status: ModelStatus,
    pub progress: Option<DownloadProgress>,
    pub downloading_model_id: Option<String>,
    pub downloaded_model_id: Option<String>,
    pub loaded_model_id: Option<String>,
    pub last_error: Option<String>,
}

impl Default for ModelState {
    fn default() -> Self {
        Self {
            status: ModelStatus::Idle,
            progress: None,
            downloading_model_id: None,
            downloaded_model_id: None,
            loaded_model_id: None,
            last_error: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("another operation is in progress for this model class")]
    Busy,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Lifecycle store for one model class. Lives for the whole process;
/// constructed once at application start and mutated in place.
///
/// Downloads are single-flight per class: a second `download` while one is
/// running fails with [`ModelError::Busy`]. No operation retries; failures
/// return the store to `Idle` and the user retries explicitly.
pub struct ModelStore {
    transport: Arc<dyn Transport>,
    class: ModelClass,
    state: watch::Sender<ModelState>,
    listeners: OnceCell<()>,
}

impl ModelStore {
    pub fn new(transport: Arc<dyn Transport>, class: ModelClass) -> Arc<Self> {
        let (state, _) = watch::channel(ModelState::default());
        Arc::new(Self {
            transport,
            class,
            state,
            listeners: OnceCell::new(),
        })
    }

    pub fn class(&self) -> ModelClass {
        self.class
    }

    pub fn state(&self) -> ModelState {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ModelState> {
        self.state.subscribe()
    }

    /// Start downloading a model. Progress and completion arrive on the
    /// class topics; the store stays `Downloading` until the terminal event.
    pub async fn download(self: &Arc<Self>, model_id: &str) -> Result<(), ModelError> {
        self.ensure_listeners().await;

        let mut started = false;
        self.state.send_if_modified(|state| {
            if state.status == ModelStatus::Idle {
                state.status = ModelStatus::Downloading;
                state.downloading_model_id = Some(model_id.to_string());
                state.progress = None;
                state.last_error = None;
                started = true;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(ModelError::Busy);
        }

        let command = self.class.download_command();
        if let Err(e) = self
            .transport
            .invoke(command, json!({"modelId": model_id}))
            .await
        {
            self.state.send_modify(|state| {
                state.status = ModelStatus::Idle;
                state.downloading_model_id = None;
                state.last_error = Some(e.to_string());
            });
            return Err(e.into());
        }
        Ok(())
    }

    /// Configure which model the backend serves for this class; `None`
    /// disables it. Failure leaves the previously loaded model untouched.
    pub async fn configure(&self, model_id: Option<&str>) -> Result<(), ModelError> {
        let mut started = false;
        self.state.send_if_modified(|state| {
            if state.status == ModelStatus::Idle {
                state.status = ModelStatus::Configuring;
                state.last_error = None;
                started = true;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(ModelError::Busy);
        }

        let command = self.class.configure_command();
        let result = self
            .transport
            .invoke(command, json!({"modelId": model_id}))
            .await;

        self.state.send_modify(|state| {
            state.status = ModelStatus::Idle;
            match &result {
                Ok(_) => state.loaded_model_id = model_id.map(str::to_string),
                Err(e) => state.last_error = Some(e.to_string()),
            }
        });

        result?;
        Ok(())
    }

    /// Register the class topic listeners exactly once per store.
    /// Concurrent callers share the in-flight setup.
    async fn ensure_listeners(self: &Arc<Self>) {
        self.listeners
            .get_or_init(|| async {
                let progress = self.transport.subscribe(self.class.progress_topic());
                let complete = self.transport.subscribe(self.class.complete_topic());

                let store = Arc::downgrade(self);
                tokio::spawn(async move {
                    Self::pump_progress(store, progress).await;
                });
                let store = Arc::downgrade(self);
                tokio::spawn(async move {
                    Self::pump_outcomes(store, complete).await;
                });
            })
            .await;
    }

    async fn pump_progress(store: Weak<Self>, mut subscription: Subscription) {
        while let Some(payload) = subscription.next().await {
            let Some(store) = store.upgrade() else { return };
            match serde_json::from_value::<DownloadProgress>(payload) {
                Ok(progress) => store.handle_progress(progress),
                Err(e) => warn!(error = %e, "Undecodable download progress, dropped"),
            }
        }
    }

    async fn pump_outcomes(store: Weak<Self>, mut subscription: Subscription) {
        while let Some(payload) = subscription.next().await {
            let Some(store) = store.upgrade() else { return };
            match serde_json::from_value::<DownloadOutcome>(payload) {
                Ok(outcome) => store.handle_outcome(outcome),
                Err(e) => warn!(error = %e, "Undecodable download outcome, dropped"),
            }
        }
    }

    fn handle_progress(&self, progress: DownloadProgress) {
        self.state.send_if_modified(|state| {
            if state.status == ModelStatus::Downloading {
                state.progress = Some(progress);
                true
            } else {
                debug!(class = ?self.class, "Progress event outside a download, dropped");
                false
            }
        });
    }

    fn handle_outcome(&self, outcome: DownloadOutcome) {
        self.state.send_if_modified(|state| {
            if state.status != ModelStatus::Downloading {
                // Duplicate or late terminal event; the first one won.
                debug!(class = ?self.class, "Download outcome outside a download, dropped");
                return false;
            }
            state.status = ModelStatus::Idle;
            state.progress = None;
            state.downloading_model_id = None;
            match outcome {
                DownloadOutcome::Completed { model_id } => {
                    debug!(class = ?self.class, model_id = %model_id, "Download completed");
                    state.downloaded_model_id = Some(model_id);
                }
                DownloadOutcome::Failed { model_id, error } => {
                    warn!(class = ?self.class, model_id = %model_id, error = %error, "Download failed");
                    state.last_error = Some(error);
                }
            }
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InMemoryTransport;

    fn store(transport: &InMemoryTransport) -> Arc<ModelStore> {
        ModelStore::new(Arc::new(transport.clone()), ModelClass::Language)
    }

    fn progress(downloaded: u64, total: u64) -> DownloadProgress {
        DownloadProgress {
            file: "weights.gguf".to_string(),
            downloaded,
            total,
            overall_progress: downloaded as f64 / total as f64,
            file_index: 0,
            total_files: 1,
        }
    }

    #[tokio::test]
    async fn test_download_lifecycle_progress_then_completion() {
        let transport = InMemoryTransport::new();
        let store = store(&transport);

        store.download("llama-3").await.unwrap();
        assert_eq!(store.state().status, ModelStatus::Downloading);
        assert_eq!(
            store.state().downloading_model_id,
            Some("llama-3".to_string())
        );
        assert_eq!(transport.invocation_count("download_model"), 1);

        store.handle_progress(progress(50, 100));
        assert_eq!(store.state().progress, Some(progress(50, 100)));

        store.handle_progress(progress(100, 100));
        assert_eq!(store.state().progress, Some(progress(100, 100)));

        store.handle_outcome(DownloadOutcome::Completed {
            model_id: "llama-3".to_string(),
        });
        let state = store.state();
        assert_eq!(state.status, ModelStatus::Idle);
        assert_eq!(state.progress, None);
        assert_eq!(state.downloading_model_id, None);
        assert_eq!(state.downloaded_model_id, Some("llama-3".to_string()));
    }

    #[tokio::test]
    async fn test_download_is_single_flight_per_class() {
        let transport = InMemoryTransport::new();
        let store = store(&transport);

        store.download("llama-3").await.unwrap();
        assert!(matches!(
            store.download("mistral").await,
            Err(ModelError::Busy)
        ));
        assert_eq!(transport.invocation_count("download_model"), 1);
    }

    #[tokio::test]
    async fn test_download_rejection_returns_to_idle() {
        let transport = InMemoryTransport::new();
        transport.on_command("download_model", |_| {
            Err(TransportError::command("disk full"))
        });
        let store = store(&transport);

        assert!(store.download("llama-3").await.is_err());
        let state = store.state();
        assert_eq!(state.status, ModelStatus::Idle);
        assert_eq!(state.downloading_model_id, None);
        assert_eq!(state.last_error, Some("command rejected: disk full".to_string()));
    }

    #[tokio::test]
    async fn test_failed_outcome_surfaces_error_and_clears_progress() {
        let transport = InMemoryTransport::new();
        let store = store(&transport);

        store.download("llama-3").await.unwrap();
        store.handle_progress(progress(10, 100));
        store.handle_outcome(DownloadOutcome::Failed {
            model_id: "llama-3".to_string(),
            error: "checksum mismatch".to_string(),
        });

        let state = store.state();
        assert_eq!(state.status, ModelStatus::Idle);
        assert_eq!(state.progress, None);
        assert_eq!(state.downloaded_model_id, None);
        assert_eq!(state.last_error, Some("checksum mismatch".to_string()));
    }

    #[tokio::test]
    async fn test_configure_sets_and_clears_loaded_model() {
        let transport = InMemoryTransport::new();
        let store = store(&transport);

        store.configure(Some("llama-3")).await.unwrap();
        assert_eq!(store.state().loaded_model_id, Some("llama-3".to_string()));

        store.configure(None).await.unwrap();
        assert_eq!(store.state().loaded_model_id, None);
        assert_eq!(transport.invocation_count("configure_model"), 2);
    }

    #[tokio::test]
    async fn test_configure_failure_keeps_previous_model() {
        let transport = InMemoryTransport::new();
        let store = store(&transport);
        store.configure(Some("llama-3")).await.unwrap();

        transport.on_command("configure_model", |_| {
            Err(TransportError::command("unsupported"))
        });
        assert!(store.configure(Some("mistral")).await.is_err());

        let state = store.state();
        assert_eq!(state.status, ModelStatus::Idle);
        assert_eq!(state.loaded_model_id, Some("llama-3".to_string()));
        assert!(state.last_error.is_some());
    }

    #[tokio::test]
    async fn test_concurrent_downloads_register_listeners_once() {
        let transport = InMemoryTransport::new();
        let store = ModelStore::new(Arc::new(transport.clone()), ModelClass::Embedding);

        let results = futures::future::join_all((0..4).map(|i| {
            let store = store.clone();
            async move { store.download(&format!("embed-{i}")).await }
        }))
        .await;

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(
            transport.subscriber_count("embedding-model-download-progress"),
            1
        );
        assert_eq!(
            transport.subscriber_count("embedding-model-download-complete"),
            1
        );
        assert_eq!(transport.invocation_count("download_embedding_model"), 1);
    }

    #[test]
    fn test_embedding_class_uses_its_own_commands_and_topics() {
        assert_eq!(
            ModelClass::Embedding.download_command(),
            "download_embedding_model"
        );
        assert_eq!(
            ModelClass::Embedding.configure_command(),
            "configure_embedding_model"
        );
        assert_eq!(ModelClass::Language.progress_topic(), "model-download-progress");
        assert_eq!(ModelClass::Language.complete_topic(), "model-download-complete");
    }

    #[tokio::test]
    async fn test_progress_and_outcome_events_flow_through_pumps() {
        let transport = InMemoryTransport::new();
        let store = store(&transport);
        store.download("llama-3").await.unwrap();
        let mut state = store.watch_state();

        transport.publish(
            "model-download-progress",
            serde_json::json!({
                "file": "weights.gguf",
                "downloaded": 50,
                "total": 100,
                "overallProgress": 0.5,
                "fileIndex": 0,
                "totalFiles": 1,
            }),
        );
        transport.publish(
            "model-download-complete",
            serde_json::json!({"type": "Completed", "modelId": "llama-3"}),
        );

        state
            .wait_for(|state| state.downloaded_model_id.is_some())
            .await
            .unwrap();
        assert_eq!(store.state().status, ModelStatus::Idle);
    }
}
