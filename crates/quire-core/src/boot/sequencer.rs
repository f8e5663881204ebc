use std::sync::{Arc, Weak};

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{OnceCell, watch};
use tracing::{debug, warn};

use crate::transport::{Subscription, Transport};

pub const BOOT_TOPIC: &str = "boot-phase";

/// Push event on the global `boot-phase` topic. Transient; not retained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum BootEvent {
    StorageReady {
        embedding_configured: bool,
        #[serde(default)]
        embedding_model_id: Option<String>,
    },
    EmbedderLoading {
        model_id: String,
        model_name: String,
    },
    EmbedderReady {
        model_id: String,
    },
    EmbedderFailed {
        model_id: String,
        error: String,
    },
    AppReady,
}

/// Application phase derived from the boot event stream.
///
/// Progression is monotonic except `EmbedderFailed`, which only an explicit
/// user action ([`BootSequencer::reset_to_setup`]) leaves.
#[derive(Debug, Clone, PartialEq)]
pub enum AppPhase {
    Booting,
    SetupRequired,
    LoadingEmbedder { model_name: String },
    EmbedderFailed { model_id: String, error: String },
    Ready,
}

/// Consumes the boot topic once and exposes the current [`AppPhase`]
/// reactively via a watch channel.
pub struct BootSequencer {
    transport: Arc<dyn Transport>,
    phase: watch::Sender<AppPhase>,
    started: OnceCell<()>,
}

impl BootSequencer {
    pub fn new(transport: Arc<dyn Transport>) -> Arc<Self> {
        let (phase, _) = watch::channel(AppPhase::Booting);
        Arc::new(Self {
            transport,
            phase,
            started: OnceCell::new(),
        })
    }

    /// Subscribe to the boot topic and start deriving phases.
    ///
    /// Idempotent: concurrent callers share one in-flight setup, so the
    /// topic ends up with exactly one subscription.
    pub async fn start(self: &Arc<Self>) {
        self.started
            .get_or_init(|| async {
                let subscription = self.transport.subscribe(BOOT_TOPIC);
                let sequencer = Arc::downgrade(self);
                tokio::spawn(async move {
                    Self::pump_events(sequencer, subscription).await;
                });
            })
            .await;
    }

    pub fn phase(&self) -> AppPhase {
        self.phase.borrow().clone()
    }

    pub fn watch_phase(&self) -> watch::Receiver<AppPhase> {
        self.phase.subscribe()
    }

    /// Explicit user action recovering from `EmbedderFailed` (or abandoning
    /// the current boot) into the setup flow. Does not re-arm backend
    /// loading; the user must re-trigger configuration.
    pub fn reset_to_setup(&self) {
        self.phase.send_replace(AppPhase::SetupRequired);
    }

    async fn pump_events(sequencer: Weak<Self>, mut subscription: Subscription) {
        while let Some(payload) = subscription.next().await {
            let Some(sequencer) = sequencer.upgrade() else {
                return;
            };
            match serde_json::from_value::<BootEvent>(payload) {
                Ok(event) => sequencer.apply(event),
                Err(e) => warn!(error = %e, "Undecodable boot event, dropped"),
            }
        }
    }

    fn apply(&self, event: BootEvent) {
        self.phase.send_if_modified(|phase| {
            match next_phase(phase, &event) {
                Some(next) => {
                    debug!(from = ?phase, to = ?next, "Boot phase transition");
                    *phase = next;
                    true
                }
                None => {
                    debug!(phase = ?phase, event = ?event, "Boot event ignored");
                    false
                }
            }
        });
    }
}

/// Transition table. `None` means the event does not change the phase.
fn next_phase(current: &AppPhase, event: &BootEvent) -> Option<AppPhase> {
    match event {
        BootEvent::StorageReady {
            embedding_configured,
            ..
        } => match current {
            // Unconfigured storage sends first-run users into the wizard;
            // configured storage keeps booting until the embedder reports.
            AppPhase::Booting if !embedding_configured => Some(AppPhase::SetupRequired),
            _ => None,
        },
        BootEvent::EmbedderLoading { model_name, .. } => match current {
            AppPhase::Booting | AppPhase::SetupRequired | AppPhase::LoadingEmbedder { .. } => {
                Some(AppPhase::LoadingEmbedder {
                    model_name: model_name.clone(),
                })
            }
            AppPhase::EmbedderFailed { .. } | AppPhase::Ready => None,
        },
        // Wait for AppReady; the embedder being up is not the whole app.
        BootEvent::EmbedderReady { .. } => None,
        BootEvent::EmbedderFailed { model_id, error } => Some(AppPhase::EmbedderFailed {
            model_id: model_id.clone(),
            error: error.clone(),
        }),
        BootEvent::AppReady => match current {
            // A backend "ready" issued mid-wizard must not short-circuit it,
            // and a failed embedder recovers only through user action.
            AppPhase::SetupRequired | AppPhase::EmbedderFailed { .. } => None,
            _ => Some(AppPhase::Ready),
        },
    }
}
