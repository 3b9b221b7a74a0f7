//! Download Coordinator - the call-site facing entry point
//!
//! This is the top-level coordinator that:
//! - Detects which native download generations the engine exposes
//! - Starts/resumes/cancels downloads
//! - Owns the single canonical delegate and the event broadcaster
//! - Tracks downloads that have not reached a terminal state

use crate::delegate::DownloadDelegate;
use crate::engine::adapter::{
    ActiveDownloads, DelegateSlot, DispatchContext, Dispatcher, DownloadDelegateAdapter,
    NativeCallback,
};
use crate::engine::handle::DownloadHandle;
use crate::engine::native::{
    EngineCapabilities, InitiatingView, LegacyDownloadDelegate, ModernDownloadDelegate,
    NativeDownload, NativeDownloadFactory,
};
use crate::error::{DownloadError, Result};
use dlbridge_types::{DownloadEvent, DownloadRequest, DownloadSnapshot, ResumeData, Settings, TransportError};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, RwLock as AsyncRwLock};
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Coordinates all downloads of one view/session
pub struct DownloadCoordinator {
    factory: Arc<dyn NativeDownloadFactory>,
    /// Probed once at construction
    capabilities: EngineCapabilities,
    /// Started downloads that have not reached a terminal state
    active: ActiveDownloads,
    delegate: DelegateSlot,
    settings: Arc<Settings>,
    /// Event broadcaster
    event_tx: broadcast::Sender<DownloadEvent>,
    /// Cancelled on drop; stops dispatchers whose engine never reported a terminal callback
    shutdown: CancellationToken,
}

impl DownloadCoordinator {
    /// Create a new coordinator
    pub fn new(factory: Arc<dyn NativeDownloadFactory>, settings: Settings) -> Self {
        let capabilities = factory.capabilities();
        if capabilities.any() {
            info!(
                "Download capabilities: legacy={}, modern={}",
                capabilities.legacy, capabilities.modern
            );
        } else {
            warn!("Engine exposes no download API; downloads are disabled");
        }

        let (event_tx, _) = broadcast::channel(settings.event_channel_capacity.max(1));

        Self {
            factory,
            capabilities,
            active: Arc::new(AsyncRwLock::new(HashMap::new())),
            delegate: Arc::new(RwLock::new(None)),
            settings: Arc::new(settings),
            event_tx,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn capabilities(&self) -> EngineCapabilities {
        self.capabilities
    }

    /// Whether download-initiating UI should be offered at all
    pub fn downloads_supported(&self) -> bool {
        self.capabilities.any()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Subscribe to download events
    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.event_tx.subscribe()
    }

    /// Download events as a stream; lagged receivers yield an error item
    pub fn events(&self) -> BroadcastStream<DownloadEvent> {
        BroadcastStream::new(self.subscribe())
    }

    /// Replace the delegate receiving events for every download of this coordinator
    pub fn set_delegate(&self, delegate: Arc<dyn DownloadDelegate>) {
        *self.delegate.write() = Some(delegate);
        debug!("Download delegate replaced");
    }

    pub fn clear_delegate(&self) {
        *self.delegate.write() = None;
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start a download for `request`
    pub async fn start(
        &self,
        request: DownloadRequest,
        view: Option<Arc<dyn InitiatingView>>,
    ) -> Result<DownloadHandle> {
        self.ensure_supported()?;
        url::Url::parse(&request.url).map_err(|_| DownloadError::InvalidUrl(request.url.clone()))?;

        info!("Starting download: {} {}", request.method, request.url);
        let native = self
            .factory
            .start_download(&request, view.clone())
            .await
            .map_err(|e| {
                warn!("Engine refused download of {}: {}", request.url, e);
                DownloadError::Transport(e)
            })?;

        Ok(self.adopt(native, None, view).await)
    }

    /// Resume a download from resume data
    pub async fn resume(
        &self,
        resume_data: &ResumeData,
        destination: &Path,
        view: Option<Arc<dyn InitiatingView>>,
    ) -> Result<DownloadHandle> {
        self.ensure_supported()?;

        info!(
            "Resuming download into {:?} ({} bytes of resume data)",
            destination,
            resume_data.len()
        );
        let native = self
            .factory
            .resume_download(resume_data, destination, view.clone())
            .await
            .ok_or_else(|| {
                warn!("Engine rejected resume data for {:?}", destination);
                DownloadError::InvalidResumeData
            })?;

        Ok(self.adopt(native, Some(destination.to_path_buf()), view).await)
    }

    /// Request cancellation.
    ///
    /// Returns resume data when the engine hands it over synchronously (modern
    /// generation). Completion is reported through the delegate's `did_fail`.
    /// Cancelling a terminal or already-cancelling download does nothing.
    pub async fn cancel(&self, handle: &DownloadHandle) -> Option<ResumeData> {
        if !handle.mark_cancel_requested() {
            debug!("Download {}: cancel ignored ({})", handle.id(), handle.state());
            return None;
        }
        info!("Cancelling download {}", handle.id());

        match handle.native() {
            NativeDownload::Legacy(download) => {
                download.cancel();
                None
            }
            NativeDownload::Modern(download) => {
                let (tx, rx) = oneshot::channel();
                let adapter = Arc::downgrade(handle.adapter());
                download.cancel(Box::new(move |data: Option<Vec<u8>>| {
                    if let Some(adapter) = adapter.upgrade() {
                        adapter.enqueue(NativeCallback::Failed {
                            error: TransportError::cancelled(),
                            resume_data: data.clone(),
                        });
                    }
                    let _ = tx.send(data);
                }));

                let timeout = Duration::from_millis(self.settings.cancel_resume_data_timeout_ms);
                match tokio::time::timeout(timeout, rx).await {
                    Ok(Ok(data)) => data.and_then(ResumeData::new),
                    Ok(Err(_)) => None,
                    Err(_) => {
                        warn!("Download {}: no resume data within {:?}", handle.id(), timeout);
                        None
                    }
                }
            }
        }
    }

    /// Retry a stored download: resume from its resume data when possible,
    /// otherwise start the original request again
    pub async fn retry(
        &self,
        snapshot: &DownloadSnapshot,
        view: Option<Arc<dyn InitiatingView>>,
    ) -> Result<DownloadHandle> {
        if let (Some(resume_data), Some(destination)) =
            (snapshot.resume_data.as_ref(), snapshot.destination.as_deref())
        {
            match self.resume(resume_data, destination, view.clone()).await {
                Ok(handle) => return Ok(handle),
                Err(DownloadError::InvalidResumeData) => {
                    info!("Download {}: resume rejected, restarting", snapshot.id);
                }
                Err(e) => return Err(e),
            }
        }

        let mut request = snapshot.request.clone();
        if request.destination.is_none() {
            request.destination = snapshot.destination.clone();
        }
        self.start(request, view).await
    }

    // ========================================================================
    // Enumeration
    // ========================================================================

    pub async fn handle(&self, id: Uuid) -> Option<DownloadHandle> {
        self.active.read().await.get(&id).cloned()
    }

    /// Snapshots of downloads that have not reached a terminal state
    pub async fn active_downloads(&self) -> Vec<DownloadSnapshot> {
        let handles: Vec<DownloadHandle> = self.active.read().await.values().cloned().collect();
        handles.iter().map(DownloadHandle::snapshot).collect()
    }

    pub async fn active_count(&self) -> usize {
        self.active.read().await.len()
    }

    /// Cancel every active download
    pub async fn cancel_all(&self) {
        let handles: Vec<DownloadHandle> = self.active.read().await.values().cloned().collect();
        for handle in handles {
            self.cancel(&handle).await;
        }
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn ensure_supported(&self) -> Result<()> {
        if self.capabilities.any() {
            Ok(())
        } else {
            Err(DownloadError::UnsupportedCapability)
        }
    }

    /// Wrap a native object in a handle and route its callbacks through an adapter
    async fn adopt(
        &self,
        native: NativeDownload,
        destination: Option<PathBuf>,
        view: Option<Arc<dyn InitiatingView>>,
    ) -> DownloadHandle {
        let generation = native.generation();
        let (adapter, rx) = DownloadDelegateAdapter::new(generation);
        let handle = DownloadHandle::new(native.clone(), destination, view.as_ref(), adapter.clone());
        let id = handle.id();

        self.active.write().await.insert(id, handle.clone());
        let _ = self.event_tx.send(DownloadEvent::Started {
            id,
            generation,
            url: handle.original_request().url.clone(),
        });

        Dispatcher::new(
            handle.clone(),
            rx,
            DispatchContext {
                delegate: self.delegate.clone(),
                events: self.event_tx.clone(),
                settings: self.settings.clone(),
                active: self.active.clone(),
                shutdown: self.shutdown.clone(),
            },
        )
        .spawn();

        match &native {
            NativeDownload::Legacy(download) => {
                let weak = Arc::downgrade(&adapter);
                let delegate: Weak<dyn LegacyDownloadDelegate> = weak;
                download.set_delegate(delegate);
            }
            NativeDownload::Modern(download) => {
                let weak = Arc::downgrade(&adapter);
                let delegate: Weak<dyn ModernDownloadDelegate> = weak;
                download.set_delegate(delegate);
            }
        }

        info!(
            "Download {}: adopted {} download of {}",
            id,
            generation,
            handle.original_request().url
        );

        handle
    }
}

impl Drop for DownloadCoordinator {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for DownloadCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadCoordinator")
            .field("capabilities", &self.capabilities)
            .finish()
    }
}
