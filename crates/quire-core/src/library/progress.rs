use std::collections::HashMap;
use std::sync::{Arc, Weak};

use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::transport::{Subscription, Transport, call};

pub const IMPORT_PROGRESS_TOPIC: &str = "import-progress";
pub const PROCESSING_PROGRESS_TOPIC: &str = "processing-progress";

/// Progress of one collection's batch pipeline (ingestion or
/// indexing/embedding).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchProgress {
    pub collection_id: String,
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub pending: u64,
    pub in_progress: u64,
}

impl BatchProgress {
    /// A settled pipeline has nothing queued and nothing running.
    pub fn is_settled(&self) -> bool {
        self.pending == 0 && self.in_progress == 0
    }
}

/// Per-collection progress map. Entry absence means "not active", not
/// "never run": settled entries are deleted, never status-flagged.
#[derive(Default)]
struct ProgressMap {
    entries: HashMap<String, BatchProgress>,
}

impl ProgressMap {
    fn update(&mut self, progress: BatchProgress) {
        if progress.is_settled() {
            self.entries.remove(&progress.collection_id);
        } else {
            self.entries
                .insert(progress.collection_id.clone(), progress);
        }
    }

    fn seed(&mut self, records: Vec<BatchProgress>) {
        self.entries.clear();
        for record in records {
            self.update(record);
        }
    }
}

/// Progress aggregator for the two independent batch pipelines. Seeded from
/// RPC snapshots at initialization (reconciling work that predates this
/// process), then kept live from the progress topics.
pub struct ProgressStore {
    transport: Arc<dyn Transport>,
    imports: Mutex<ProgressMap>,
    processing: Mutex<ProgressMap>,
    started: OnceCell<()>,
}

impl ProgressStore {
    pub fn new(transport: Arc<dyn Transport>) -> Arc<Self> {
        Arc::new(Self {
            transport,
            imports: Mutex::new(ProgressMap::default()),
            processing: Mutex::new(ProgressMap::default()),
            started: OnceCell::new(),
        })
    }

    /// Seed both maps and subscribe to both topics, exactly once; concurrent
    /// callers share the in-flight setup. Seeding failures degrade silently
    /// to an empty map (logged only).
    pub async fn init(self: &Arc<Self>) {
        self.started
            .get_or_init(|| async {
                match call::<_, Vec<BatchProgress>>(&*self.transport, "get_import_progress", &json!({}))
                    .await
                {
                    Ok(records) => self.imports.lock().seed(records),
                    Err(e) => warn!(error = %e, "Import progress seed failed"),
                }
                match call::<_, Vec<BatchProgress>>(
                    &*self.transport,
                    "get_processing_progress",
                    &json!({}),
                )
                .await
                {
                    Ok(records) => self.processing.lock().seed(records),
                    Err(e) => warn!(error = %e, "Processing progress seed failed"),
                }

                let imports = self.transport.subscribe(IMPORT_PROGRESS_TOPIC);
                let store = Arc::downgrade(self);
                tokio::spawn(async move {
                    Self::pump(store, imports, Pipeline::Import).await;
                });
                let processing = self.transport.subscribe(PROCESSING_PROGRESS_TOPIC);
                let store = Arc::downgrade(self);
                tokio::spawn(async move {
                    Self::pump(store, processing, Pipeline::Processing).await;
                });
            })
            .await;
    }

    pub fn has_active_imports(&self) -> bool {
        !self.imports.lock().entries.is_empty()
    }

    pub fn is_importing(&self, collection_id: &str) -> bool {
        self.imports.lock().entries.contains_key(collection_id)
    }

    pub fn import_progress(&self, collection_id: &str) -> Option<BatchProgress> {
        self.imports.lock().entries.get(collection_id).cloned()
    }

    pub fn has_active_processing(&self) -> bool {
        !self.processing.lock().entries.is_empty()
    }

    pub fn is_processing(&self, collection_id: &str) -> bool {
        self.processing.lock().entries.contains_key(collection_id)
    }

    pub fn processing_progress(&self, collection_id: &str) -> Option<BatchProgress> {
        self.processing.lock().entries.get(collection_id).cloned()
    }

    async fn pump(store: Weak<Self>, mut subscription: Subscription, pipeline: Pipeline) {
        while let Some(payload) = subscription.next().await {
            let Some(store) = store.upgrade() else { return };
            match serde_json::from_value::<BatchProgress>(payload) {
                Ok(progress) => store.handle_progress(pipeline, progress),
                Err(e) => warn!(error = %e, pipeline = ?pipeline, "Undecodable progress event, dropped"),
            }
        }
    }

    fn handle_progress(&self, pipeline: Pipeline, progress: BatchProgress) {
        debug!(
            pipeline = ?pipeline,
            collection_id = %progress.collection_id,
            pending = progress.pending,
            in_progress = progress.in_progress,
            "Progress update"
        );
        let map = match pipeline {
            Pipeline::Import => &self.imports,
            Pipeline::Processing => &self.processing,
        };
        map.lock().update(progress);
    }
}

#[derive(Debug, Clone, Copy)]
enum Pipeline {
    Import,
    Processing,
}
