use std::sync::Arc;

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};

use quire_core::boot::{AppPhase, BOOT_TOPIC, BootSequencer};
use quire_core::transport::{Transport, TransportError};
use quire_ipc::IpcTransport;

fn init_logging() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Scripted peer on the far side of the duplex pipe.
struct FakeBackend {
    lines: tokio::io::Lines<BufReader<ReadHalf<DuplexStream>>>,
    writer: WriteHalf<DuplexStream>,
}

impl FakeBackend {
    fn new(io: DuplexStream) -> Self {
        let (read, writer) = tokio::io::split(io);
        Self {
            lines: BufReader::new(read).lines(),
            writer,
        }
    }

    async fn next_request(&mut self) -> Value {
        loop {
            let line = self
                .lines
                .next_line()
                .await
                .unwrap()
                .expect("client closed the connection");
            if !line.trim().is_empty() {
                return serde_json::from_str(&line).unwrap();
            }
        }
    }

    async fn send(&mut self, frame: Value) {
        self.writer
            .write_all(frame.to_string().as_bytes())
            .await
            .unwrap();
        self.writer.write_all(b"\n").await.unwrap();
        self.writer.flush().await.unwrap();
    }
}

fn connect() -> (Arc<IpcTransport>, FakeBackend) {
    init_logging();
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let (read, write) = tokio::io::split(client_io);
    let transport = IpcTransport::connect_with_io(Box::new(write), Box::new(read));
    (Arc::new(transport), FakeBackend::new(server_io))
}

#[tokio::test]
async fn request_resolves_from_matching_response() {
    let (transport, mut backend) = connect();

    let invoke = transport.invoke("get_collections", json!({}));
    let serve = async {
        let request = backend.next_request().await;
        assert_eq!(request["command"], "get_collections");
        assert_eq!(request["args"], json!({}));
        let id = request["id"].clone();
        backend
            .send(json!({"id": id, "result": [{"id": "c1", "name": "Papers", "documentCount": 0}]}))
            .await;
    };

    let (result, ()) = tokio::join!(invoke, serve);
    let collections = result.unwrap();
    assert_eq!(collections[0]["name"], "Papers");
}

#[tokio::test]
async fn error_response_surfaces_as_command_rejection() {
    let (transport, mut backend) = connect();

    let invoke = transport.invoke("delete_collection", json!({"collectionId": "c1"}));
    let serve = async {
        let request = backend.next_request().await;
        let id = request["id"].clone();
        backend
            .send(json!({"id": id, "error": {"message": "no such collection"}}))
            .await;
    };

    let (result, ()) = tokio::join!(invoke, serve);
    match result.unwrap_err() {
        TransportError::Command { message } => assert_eq!(message, "no such collection"),
        other => panic!("expected command rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn out_of_order_responses_resolve_their_own_requests() {
    let (transport, mut backend) = connect();

    let first = transport.invoke("get_import_progress", json!({}));
    let second = transport.invoke("get_processing_progress", json!({}));
    let serve = async {
        let a = backend.next_request().await;
        let b = backend.next_request().await;
        // Answer in reverse order.
        backend
            .send(json!({"id": b["id"], "result": "second"}))
            .await;
        backend
            .send(json!({"id": a["id"], "result": "first"}))
            .await;
    };

    let (first, second, ()) = tokio::join!(first, second, serve);
    assert_eq!(first.unwrap(), json!("first"));
    assert_eq!(second.unwrap(), json!("second"));
}

#[tokio::test]
async fn events_reach_only_their_topic_subscribers() {
    let (transport, mut backend) = connect();

    let mut documents = transport.subscribe("document-added");
    let mut imports = transport.subscribe("import-progress");

    backend
        .send(json!({"topic": "document-added", "payload": {"collectionId": "c1"}}))
        .await;
    backend
        .send(json!({"topic": "model-download-progress", "payload": {"file": "weights"}}))
        .await;
    backend
        .send(json!({"topic": "import-progress", "payload": {"collectionId": "c2"}}))
        .await;

    assert_eq!(
        documents.recv().await,
        Some(json!({"collectionId": "c1"}))
    );
    assert_eq!(
        imports.recv().await,
        Some(json!({"collectionId": "c2"}))
    );
}

#[tokio::test]
async fn closed_connection_fails_pending_and_future_requests() {
    let (transport, mut backend) = connect();

    let mut subscription = transport.subscribe("boot-phase");
    let invoke = transport.invoke("get_collections", json!({}));
    let serve = async {
        let _ = backend.next_request().await;
        drop(backend);
    };

    let (result, ()) = tokio::join!(invoke, serve);
    assert!(matches!(result.unwrap_err(), TransportError::Closed));

    // Open subscriptions end with the connection.
    assert_eq!(subscription.recv().await, None);

    let late = transport.invoke("get_collections", json!({})).await;
    assert!(matches!(late.unwrap_err(), TransportError::Closed));
}

#[tokio::test]
async fn boot_sequencer_runs_over_the_ipc_transport() {
    let (transport, mut backend) = connect();

    let sequencer = BootSequencer::new(transport.clone());
    sequencer.start().await;
    let mut phase = sequencer.watch_phase();

    backend
        .send(json!({
            "topic": BOOT_TOPIC,
            "payload": {"type": "StorageReady", "embeddingConfigured": false, "embeddingModelId": null},
        }))
        .await;

    phase
        .wait_for(|phase| *phase == AppPhase::SetupRequired)
        .await
        .unwrap();
}
