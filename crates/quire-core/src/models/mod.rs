pub mod lifecycle;
pub mod providers;

pub use lifecycle::{
    DownloadOutcome, DownloadProgress, ModelClass, ModelError, ModelState, ModelStatus, ModelStore,
};
pub use providers::{
    ProviderConfig, ProviderDraft, ProviderError, ProviderFamily, ProviderStore, RemoteModel,
};
