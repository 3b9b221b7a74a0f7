//! dlbridge Core - one download lifecycle over two engine download APIs
//!
//! This crate hides whether the engine hands out legacy or modern download
//! objects. Callers start, resume and cancel downloads through a
//! [`DownloadCoordinator`] and observe them through one [`DownloadDelegate`]
//! or the [`DownloadEvent`] stream.

mod delegate;
mod engine;
mod error;
pub mod filename;
pub mod scripted;
mod storage;

pub use delegate::*;
pub use engine::*;
pub use error::*;
pub use storage::*;

use dlbridge_types::{DownloadEvent, DownloadSnapshot, Settings};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// The main dlbridge instance: a coordinator backed by a data directory
pub struct DlbridgeCore {
    coordinator: Arc<DownloadCoordinator>,
    /// Settings file and database location
    pub storage: Storage,
    /// Finished and failed downloads
    pub store: DownloadStore,
}

impl DlbridgeCore {
    /// Create a new instance over `factory`, loading settings from `data_dir`
    pub async fn new(data_dir: PathBuf, factory: Arc<dyn NativeDownloadFactory>) -> Result<Self> {
        let storage = Storage::new(data_dir).await?;
        let settings = storage.load_settings().await?;
        let store = DownloadStore::new(storage.database_path()).await?;

        info!("dlbridge data directory: {:?}", storage.data_dir());

        Ok(Self {
            coordinator: Arc::new(DownloadCoordinator::new(factory, settings)),
            storage,
            store,
        })
    }

    pub fn coordinator(&self) -> &Arc<DownloadCoordinator> {
        &self.coordinator
    }

    pub fn settings(&self) -> &Settings {
        self.coordinator.settings()
    }

    /// Persist the outcome carried by a terminal event; other events are ignored
    pub async fn record(&self, event: &DownloadEvent) -> Result<()> {
        match event {
            DownloadEvent::Finished { download } | DownloadEvent::Failed { download, .. } => {
                self.store.upsert(download).await
            }
            _ => Ok(()),
        }
    }

    /// Stored downloads, newest first
    pub async fn history(&self) -> Result<Vec<DownloadSnapshot>> {
        self.store.load_all().await
    }

    /// Retry a stored download by id
    pub async fn retry(&self, id: Uuid) -> Result<DownloadHandle> {
        let snapshot = self.store.load(id).await?.ok_or(DownloadError::NotFound(id))?;
        self.coordinator.retry(&snapshot, None).await
    }

    /// Drop a stored download
    pub async fn forget(&self, id: Uuid) -> Result<()> {
        if self.store.remove(id).await? {
            Ok(())
        } else {
            Err(DownloadError::NotFound(id))
        }
    }
}
