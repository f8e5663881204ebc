use std::sync::{Arc, Weak};

use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::transport::{Subscription, Transport, TransportError, call};

pub const DOCUMENT_ADDED_TOPIC: &str = "document-added";

/// Locally cached projection of a backend-owned collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Collection {
    pub id: String,
    pub name: String,
    pub document_count: u64,
}

/// Locally cached projection of a backend-owned document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: String,
    pub name: String,
    pub file_type: String,
    #[serde(default)]
    pub page_count: Option<u32>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: i64,
}

/// Push event on `document-added`: serves both locally triggered imports and
/// remotely synced additions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentAdded {
    pub collection_id: String,
    pub document: Document,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ShareTicket {
    ticket: String,
}

#[derive(Debug, Error)]
pub enum LibraryError {
    #[error("unknown collection: {0}")]
    UnknownCollection(String),

    #[error("unknown document: {0}")]
    UnknownDocument(String),

    #[error("no collection is open")]
    NoOpenCollection,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

struct ViewedCollection {
    collection_id: String,
    documents: Vec<Document>,
}

#[derive(Default)]
struct LibraryInner {
    collections: Vec<Collection>,
    viewed: Option<ViewedCollection>,
}

/// Eventually consistent cache of collection and document metadata.
///
/// Mutations go through the backend: creation and import are pessimistic
/// (cached only after success), deletion is optimistic with a structural
/// inverse rollback that re-inserts exactly the removed entry, so mutations
/// that landed while the delete was in flight survive a failure.
pub struct LibraryStore {
    transport: Arc<dyn Transport>,
    inner: Mutex<LibraryInner>,
    started: OnceCell<()>,
}

impl LibraryStore {
    pub fn new(transport: Arc<dyn Transport>) -> Arc<Self> {
        Arc::new(Self {
            transport,
            inner: Mutex::new(LibraryInner::default()),
            started: OnceCell::new(),
        })
    }

    /// Subscribe to `document-added` exactly once; concurrent callers share
    /// the in-flight setup.
    pub async fn start(self: &Arc<Self>) {
        self.started
            .get_or_init(|| async {
                let subscription = self.transport.subscribe(DOCUMENT_ADDED_TOPIC);
                let store = Arc::downgrade(self);
                tokio::spawn(async move {
                    Self::pump_events(store, subscription).await;
                });
            })
            .await;
    }

    pub fn collections(&self) -> Vec<Collection> {
        self.inner.lock().collections.clone()
    }

    pub fn collection(&self, id: &str) -> Option<Collection> {
        self.inner
            .lock()
            .collections
            .iter()
            .find(|c| c.id == id)
            .cloned()
    }

    /// Documents of the currently viewed collection, if any.
    pub fn viewed_documents(&self) -> Option<Vec<Document>> {
        self.inner
            .lock()
            .viewed
            .as_ref()
            .map(|viewed| viewed.documents.clone())
    }

    pub fn viewed_collection_id(&self) -> Option<String> {
        self.inner
            .lock()
            .viewed
            .as_ref()
            .map(|viewed| viewed.collection_id.clone())
    }

    /// Replace the cached collection list with a fresh snapshot.
    pub async fn refresh(&self) -> Result<Vec<Collection>, LibraryError> {
        let collections: Vec<Collection> =
            call(&*self.transport, "get_collections", &json!({})).await?;
        self.inner.lock().collections = collections.clone();
        Ok(collections)
    }

    /// Load and view a collection's documents.
    pub async fn open_collection(&self, collection_id: &str) -> Result<Vec<Document>, LibraryError> {
        let documents: Vec<Document> = call(
            &*self.transport,
            "get_documents",
            &json!({"collectionId": collection_id}),
        )
        .await?;
        self.inner.lock().viewed = Some(ViewedCollection {
            collection_id: collection_id.to_string(),
            documents: documents.clone(),
        });
        Ok(documents)
    }

    pub fn close_collection(&self) {
        self.inner.lock().viewed = None;
    }

    /// Create a collection. Pessimistic: cached only after the backend
    /// confirms.
    pub async fn create(&self, name: &str) -> Result<Collection, LibraryError> {
        let collection: Collection = call(
            &*self.transport,
            "create_collection",
            &json!({"name": name}),
        )
        .await?;
        self.inner.lock().collections.push(collection.clone());
        Ok(collection)
    }

    /// Delete a collection. Optimistic: removed from the cache immediately;
    /// a failing RPC re-inserts the removed entry at its original index.
    pub async fn delete(&self, collection_id: &str) -> Result<(), LibraryError> {
        let (index, removed, viewed) = {
            let mut inner = self.inner.lock();
            let index = inner
                .collections
                .iter()
                .position(|c| c.id == collection_id)
                .ok_or_else(|| LibraryError::UnknownCollection(collection_id.to_string()))?;
            let removed = inner.collections.remove(index);
            let viewed = if inner
                .viewed
                .as_ref()
                .is_some_and(|viewed| viewed.collection_id == collection_id)
            {
                inner.viewed.take()
            } else {
                None
            };
            (index, removed, viewed)
        };

        let result = self
            .transport
            .invoke(
                "delete_collection",
                json!({"collectionId": collection_id}),
            )
            .await;

        if let Err(e) = result {
            let mut inner = self.inner.lock();
            let index = index.min(inner.collections.len());
            inner.collections.insert(index, removed);
            // Don't clobber a view opened while the delete was in flight.
            if viewed.is_some() && inner.viewed.is_none() {
                inner.viewed = viewed;
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// Delete a document from the viewed collection, optimistically, with
    /// the same structural inverse rollback as collection deletion.
    pub async fn delete_document(&self, document_id: &str) -> Result<(), LibraryError> {
        let (index, removed, collection_id) = {
            let mut inner = self.inner.lock();
            let viewed = inner.viewed.as_mut().ok_or(LibraryError::NoOpenCollection)?;
            let index = viewed
                .documents
                .iter()
                .position(|d| d.id == document_id)
                .ok_or_else(|| LibraryError::UnknownDocument(document_id.to_string()))?;
            let removed = viewed.documents.remove(index);
            let collection_id = viewed.collection_id.clone();
            Self::adjust_document_count(&mut inner, &collection_id, -1);
            (index, removed, collection_id)
        };

        let result = self
            .transport
            .invoke("delete_document", json!({"documentId": document_id}))
            .await;

        if let Err(e) = result {
            let mut inner = self.inner.lock();
            if let Some(viewed) = inner
                .viewed
                .as_mut()
                .filter(|viewed| viewed.collection_id == collection_id)
            {
                let index = index.min(viewed.documents.len());
                viewed.documents.insert(index, removed);
            }
            Self::adjust_document_count(&mut inner, &collection_id, 1);
            return Err(e.into());
        }
        Ok(())
    }

    /// Share a collection, returning the ticket peers import it with.
    pub async fn share(&self, collection_id: &str) -> Result<String, LibraryError> {
        let ticket: ShareTicket = call(
            &*self.transport,
            "share_collection",
            &json!({"collectionId": collection_id}),
        )
        .await?;
        Ok(ticket.ticket)
    }

    /// Import a shared collection by ticket. Pessimistic, like `create`.
    pub async fn import(&self, ticket: &str) -> Result<Collection, LibraryError> {
        let collection: Collection = call(
            &*self.transport,
            "import_collection",
            &json!({"ticket": ticket}),
        )
        .await?;
        self.inner.lock().collections.push(collection.clone());
        Ok(collection)
    }

    async fn pump_events(store: Weak<Self>, mut subscription: Subscription) {
        while let Some(payload) = subscription.next().await {
            let Some(store) = store.upgrade() else { return };
            match serde_json::from_value::<DocumentAdded>(payload) {
                Ok(event) => store.handle_document_added(event),
                Err(e) => warn!(error = %e, "Undecodable document-added event, dropped"),
            }
        }
    }

    /// Merge a pushed document by identity: appended to the displayed list
    /// only when the viewed collection matches and the id is unseen, while
    /// the parent collection's count is incremented unconditionally.
    fn handle_document_added(&self, event: DocumentAdded) {
        let mut inner = self.inner.lock();

        if let Some(viewed) = inner
            .viewed
            .as_mut()
            .filter(|viewed| viewed.collection_id == event.collection_id)
        {
            if viewed.documents.iter().any(|d| d.id == event.document.id) {
                debug!(document_id = %event.document.id, "Document already displayed, merge skipped");
            } else {
                viewed.documents.push(event.document.clone());
            }
        }

        Self::adjust_document_count(&mut inner, &event.collection_id, 1);
    }

    fn adjust_document_count(inner: &mut LibraryInner, collection_id: &str, delta: i64) {
        match inner.collections.iter_mut().find(|c| c.id == collection_id) {
            Some(collection) => {
                collection.document_count = collection.document_count.saturating_add_signed(delta);
            }
            None => debug!(collection_id = %collection_id, "Count change for uncached collection"),
        }
    }
}
