//! Download handle - identity and accumulated state of one download
//!
//! Mutation happens only from the adapter's dispatcher; callers read
//! through accessors or [`DownloadHandle::snapshot`].

use crate::engine::adapter::DownloadDelegateAdapter;
use crate::engine::native::{InitiatingView, NativeDownload};
use chrono::{DateTime, Utc};
use dlbridge_types::{
    DownloadRequest, DownloadSnapshot, DownloadState, Generation, ResumeData, TransportError,
};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use uuid::Uuid;

/// Cheaply clonable reference to an in-flight or finished download
#[derive(Clone)]
pub struct DownloadHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    id: Uuid,
    request: DownloadRequest,
    preset_destination: Option<PathBuf>,
    view: Option<Weak<dyn InitiatingView>>,
    was_user_initiated: bool,
    native: NativeDownload,
    adapter: Arc<DownloadDelegateAdapter>,
    created_at: DateTime<Utc>,
    state: Mutex<HandleState>,
}

struct HandleState {
    state: DownloadState,
    redirects: Vec<String>,
    resume_data: Option<ResumeData>,
    suggested_filename: Option<String>,
    mime_type: Option<String>,
    destination: Option<PathBuf>,
    total_received: u64,
    expected: Option<u64>,
    error: Option<TransportError>,
    cancel_requested: bool,
    finished_at: Option<DateTime<Utc>>,
}

impl DownloadHandle {
    /// `preset_destination` wins over the destination of the native request
    pub(crate) fn new(
        native: NativeDownload,
        preset_destination: Option<PathBuf>,
        view: Option<&Arc<dyn InitiatingView>>,
        adapter: Arc<DownloadDelegateAdapter>,
    ) -> Self {
        let request = native.original_request();
        let preset_destination = preset_destination.or_else(|| request.destination.clone());

        Self {
            inner: Arc::new(HandleInner {
                id: adapter.id(),
                was_user_initiated: native.was_user_initiated(),
                view: view.map(Arc::downgrade),
                request,
                preset_destination: preset_destination.clone(),
                native,
                adapter,
                created_at: Utc::now(),
                state: Mutex::new(HandleState {
                    state: DownloadState::Created,
                    redirects: Vec::new(),
                    resume_data: None,
                    suggested_filename: None,
                    mime_type: None,
                    destination: preset_destination,
                    total_received: 0,
                    expected: None,
                    error: None,
                    cancel_requested: false,
                    finished_at: None,
                }),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn generation(&self) -> Generation {
        self.inner.native.generation()
    }

    pub fn original_request(&self) -> &DownloadRequest {
        &self.inner.request
    }

    /// Destination fixed before the engine asked for one
    pub fn preset_destination(&self) -> Option<&Path> {
        self.inner.preset_destination.as_deref()
    }

    /// The initiating view, or `None` once it has been torn down
    pub fn initiating_view(&self) -> Option<Arc<dyn InitiatingView>> {
        self.inner.view.as_ref().and_then(Weak::upgrade)
    }

    pub fn was_user_initiated(&self) -> bool {
        self.inner.was_user_initiated
    }

    pub fn state(&self) -> DownloadState {
        self.inner.state.lock().state
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// Redirect targets in arrival order
    pub fn redirect_history(&self) -> Vec<String> {
        self.inner.state.lock().redirects.clone()
    }

    /// Last known good resume data
    pub fn resume_data(&self) -> Option<ResumeData> {
        self.inner.state.lock().resume_data.clone()
    }

    pub fn destination(&self) -> Option<PathBuf> {
        self.inner.state.lock().destination.clone()
    }

    pub fn total_received(&self) -> u64 {
        self.inner.state.lock().total_received
    }

    pub fn snapshot(&self) -> DownloadSnapshot {
        let state = self.inner.state.lock();
        DownloadSnapshot {
            id: self.inner.id,
            generation: self.generation(),
            request: self.inner.request.clone(),
            redirects: state.redirects.clone(),
            was_user_initiated: self.inner.was_user_initiated,
            state: state.state,
            suggested_filename: state.suggested_filename.clone(),
            mime_type: state.mime_type.clone(),
            destination: state.destination.clone(),
            total_received: state.total_received,
            expected: state.expected,
            resume_data: state.resume_data.clone(),
            error: state.error.clone(),
            created_at: self.inner.created_at,
            finished_at: state.finished_at,
        }
    }

    // ========================================================================
    // Dispatcher-side mutation
    // ========================================================================

    pub(crate) fn native(&self) -> &NativeDownload {
        &self.inner.native
    }

    pub(crate) fn adapter(&self) -> &Arc<DownloadDelegateAdapter> {
        &self.inner.adapter
    }

    /// Move to `next`; terminal states are final. Returns false if ignored.
    pub(crate) fn transition(&self, next: DownloadState) -> bool {
        let mut state = self.inner.state.lock();
        if state.state.is_terminal() {
            return false;
        }
        state.state = next;
        if next.is_terminal() {
            state.finished_at = Some(Utc::now());
        }
        true
    }

    pub(crate) fn push_redirect(&self, url: String) {
        self.inner.state.lock().redirects.push(url);
    }

    /// Keeps the previous value unless `data` is present
    pub(crate) fn store_resume_data(&self, data: Option<ResumeData>) {
        if let Some(data) = data {
            self.inner.state.lock().resume_data = Some(data);
        }
    }

    pub(crate) fn set_response_info(&self, suggested_filename: String, mime_type: Option<String>, expected: Option<u64>) {
        let mut state = self.inner.state.lock();
        state.suggested_filename = Some(suggested_filename);
        state.mime_type = mime_type;
        if expected.is_some() {
            state.expected = expected;
        }
    }

    pub(crate) fn set_destination(&self, destination: Option<PathBuf>) {
        self.inner.state.lock().destination = destination;
    }

    pub(crate) fn set_progress(&self, total_received: u64, expected: Option<u64>) {
        let mut state = self.inner.state.lock();
        state.total_received = total_received;
        if expected.is_some() {
            state.expected = expected;
        }
    }

    pub(crate) fn set_error(&self, error: TransportError) {
        self.inner.state.lock().error = Some(error);
    }

    pub(crate) fn cancel_requested(&self) -> bool {
        self.inner.state.lock().cancel_requested
    }

    /// Flags the handle as cancelling. False if it already was, or is terminal.
    pub(crate) fn mark_cancel_requested(&self) -> bool {
        let mut state = self.inner.state.lock();
        if state.state.is_terminal() || state.cancel_requested {
            return false;
        }
        state.cancel_requested = true;
        true
    }
}

impl PartialEq for DownloadHandle {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for DownloadHandle {}

impl std::fmt::Debug for DownloadHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadHandle")
            .field("id", &self.inner.id)
            .field("generation", &self.generation())
            .field("url", &self.inner.request.url)
            .field("state", &self.state())
            .finish()
    }
}
