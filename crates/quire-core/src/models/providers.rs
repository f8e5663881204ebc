use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::transport::{Transport, TransportError, call};

use super::lifecycle::{ModelError, ModelStore};

/// Selectable inference provider family: the locally served model or a
/// remote API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderFamily {
    Local,
    #[serde(rename = "openai")]
    OpenAi,
    Anthropic,
}

impl ProviderFamily {
    pub fn display_name(self) -> &'static str {
        match self {
            Self::Local => "Local model",
            Self::OpenAi => "OpenAI",
            Self::Anthropic => "Anthropic",
        }
    }

    pub fn requires_api_key(self) -> bool {
        !matches!(self, Self::Local)
    }

    fn list_models_command(self) -> Option<&'static str> {
        match self {
            Self::Local => None,
            Self::OpenAi => Some("list_openai_models"),
            Self::Anthropic => Some("list_anthropic_models"),
        }
    }

    fn configure_command(self) -> &'static str {
        match self {
            // Activating the local family routes through the language
            // model lifecycle, not a provider command.
            Self::Local => "configure_model",
            Self::OpenAi => "configure_openai",
            Self::Anthropic => "configure_anthropic",
        }
    }
}

/// The active provider configuration, mirrored to the backend on activation.
/// At most one is active at a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ProviderConfig {
    Local {
        model_id: String,
    },
    #[serde(rename = "OpenAI")]
    OpenAi {
        api_key: String,
        model: String,
    },
    Anthropic {
        api_key: String,
        model: String,
    },
}

impl ProviderConfig {
    pub fn family(&self) -> ProviderFamily {
        match self {
            Self::Local { .. } => ProviderFamily::Local,
            Self::OpenAi { .. } => ProviderFamily::OpenAi,
            Self::Anthropic { .. } => ProviderFamily::Anthropic,
        }
    }
}

/// A model offered by a remote provider API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteModel {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("an API key is required for this provider")]
    MissingApiKey,

    #[error("no model selected")]
    MissingModel,

    #[error("the local provider has no remote models to verify")]
    NotRemote,

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// In-progress credentials/model choice for one family, kept across family
/// switches so returning to a family restores what was entered.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderDraft {
    pub api_key: String,
    pub model: Option<String>,
}

struct ProviderInner {
    selected: ProviderFamily,
    drafts: HashMap<ProviderFamily, ProviderDraft>,
    remote_models: Vec<RemoteModel>,
    verified: bool,
    last_verified: Option<(ProviderFamily, String)>,
}

/// Provider-selection overlay on the model lifecycle: which family serves
/// chat, with credentials and remote model choice for the API families.
pub struct ProviderStore {
    transport: Arc<dyn Transport>,
    language_models: Arc<ModelStore>,
    inner: Mutex<ProviderInner>,
    active: watch::Sender<Option<ProviderConfig>>,
}

impl ProviderStore {
    pub fn new(transport: Arc<dyn Transport>, language_models: Arc<ModelStore>) -> Arc<Self> {
        let (active, _) = watch::channel(None);
        Arc::new(Self {
            transport,
            language_models,
            inner: Mutex::new(ProviderInner {
                selected: ProviderFamily::Local,
                drafts: HashMap::new(),
                remote_models: Vec::new(),
                verified: false,
                last_verified: None,
            }),
            active,
        })
    }

    pub fn selected_family(&self) -> ProviderFamily {
        self.inner.lock().selected
    }

    pub fn draft(&self) -> ProviderDraft {
        let inner = self.inner.lock();
        inner.drafts.get(&inner.selected).cloned().unwrap_or_default()
    }

    pub fn remote_models(&self) -> Vec<RemoteModel> {
        self.inner.lock().remote_models.clone()
    }

    pub fn is_verified(&self) -> bool {
        self.inner.lock().verified
    }

    pub fn active(&self) -> Option<ProviderConfig> {
        self.active.borrow().clone()
    }

    pub fn watch_active(&self) -> watch::Receiver<Option<ProviderConfig>> {
        self.active.subscribe()
    }

    /// Switch the selection UI to a family. A previously edited draft is
    /// restored; re-selecting the currently active family pulls the active
    /// configuration's fields into the draft instead.
    pub fn select_family(&self, family: ProviderFamily) {
        let active = self.active.borrow().clone();
        let mut inner = self.inner.lock();
        inner.selected = family;
        inner.remote_models.clear();
        inner.verified = false;

        if let Some(config) = active.filter(|config| config.family() == family) {
            let draft = inner.drafts.entry(family).or_default();
            match config {
                ProviderConfig::Local { model_id } => draft.model = Some(model_id),
                ProviderConfig::OpenAi { api_key, model }
                | ProviderConfig::Anthropic { api_key, model } => {
                    draft.api_key = api_key;
                    draft.model = Some(model);
                }
            }
        }
    }

    pub fn set_model(&self, model: &str) {
        let mut inner = self.inner.lock();
        let selected = inner.selected;
        inner.drafts.entry(selected).or_default().model = Some(model.to_string());
    }

    pub fn set_api_key(&self, api_key: &str) {
        let mut inner = self.inner.lock();
        let selected = inner.selected;
        inner.drafts.entry(selected).or_default().api_key = api_key.to_string();
    }

    /// Check an API key against the selected remote family by listing its
    /// models. Success records the key as verified.
    pub async fn verify(&self, api_key: &str) -> Result<Vec<RemoteModel>, ProviderError> {
        let family = {
            let mut inner = self.inner.lock();
            let selected = inner.selected;
            inner.drafts.entry(selected).or_default().api_key = api_key.to_string();
            selected
        };
        let command = family.list_models_command().ok_or(ProviderError::NotRemote)?;
        if api_key.trim().is_empty() {
            return Err(ProviderError::MissingApiKey);
        }

        let models: Vec<RemoteModel> =
            call(&*self.transport, command, &json!({"apiKey": api_key})).await?;
        info!(family = family.display_name(), count = models.len(), "Provider verified");

        let mut inner = self.inner.lock();
        inner.remote_models = models.clone();
        inner.verified = true;
        inner.last_verified = Some((family, api_key.to_string()));
        Ok(models)
    }

    /// Activate the selected family: configure the backend, then publish the
    /// new active configuration.
    pub async fn activate(&self) -> Result<ProviderConfig, ProviderError> {
        let (family, draft) = {
            let inner = self.inner.lock();
            (
                inner.selected,
                inner.drafts.get(&inner.selected).cloned().unwrap_or_default(),
            )
        };
        let model = draft.model.clone().ok_or(ProviderError::MissingModel)?;

        let config = match family {
            ProviderFamily::Local => {
                self.language_models.configure(Some(&model)).await?;
                ProviderConfig::Local { model_id: model }
            }
            ProviderFamily::OpenAi | ProviderFamily::Anthropic => {
                if draft.api_key.trim().is_empty() {
                    return Err(ProviderError::MissingApiKey);
                }
                self.transport
                    .invoke(
                        family.configure_command(),
                        json!({"apiKey": draft.api_key, "model": model}),
                    )
                    .await?;
                match family {
                    ProviderFamily::OpenAi => ProviderConfig::OpenAi {
                        api_key: draft.api_key,
                        model,
                    },
                    _ => ProviderConfig::Anthropic {
                        api_key: draft.api_key,
                        model,
                    },
                }
            }
        };

        info!(family = family.display_name(), "Provider activated");
        self.active.send_replace(Some(config.clone()));
        Ok(config)
    }

    /// Mirror a backend-reported active provider into the selection state.
    ///
    /// Returns whether the caller should re-verify the credentials: false
    /// when they match the last verified key, so a verify → configure →
    /// report round trip cannot loop back into another verify.
    pub fn sync_from_backend(&self, config: Option<ProviderConfig>) -> bool {
        self.active.send_replace(config.clone());

        let Some(config) = config else {
            return false;
        };
        let family = config.family();

        let mut inner = self.inner.lock();
        inner.selected = family;
        let draft = inner.drafts.entry(family).or_default();
        let needs_verify = match &config {
            ProviderConfig::Local { model_id } => {
                draft.model = Some(model_id.clone());
                false
            }
            ProviderConfig::OpenAi { api_key, model }
            | ProviderConfig::Anthropic { api_key, model } => {
                draft.api_key = api_key.clone();
                draft.model = Some(model.clone());
                inner.last_verified != Some((family, api_key.clone()))
            }
        };
        debug!(family = family.display_name(), needs_verify, "Synced active provider from backend");
        needs_verify
    }
}
