//! Native engine seams
//!
//! The engine hands out download objects in one of two shapes:
//! - Legacy: passive redirect notifications, cumulative progress, plain cancel
//! - Modern: per-redirect policy decisions, auth challenges, incremental
//!   progress and a cancel that yields resume data
//!
//! Engine bindings implement the object and factory traits; the adapter
//! implements the delegate traits.
//!
//! Every native object must end with a terminal callback. Until it does, the
//! coordinator keeps its dispatcher and its active entry.

use async_trait::async_trait;
use dlbridge_types::{
    AuthenticationChallenge, AuthenticationResponse, DownloadRequest, DownloadResponse,
    Generation, ResumeData, TransportError,
};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use uuid::Uuid;

/// Completion for a destination request; `None` cancels the download
pub type DestinationHandler = Box<dyn FnOnce(Option<PathBuf>) + Send>;
/// Completion for a modern redirect; takes the raw native policy value
pub type RedirectHandler = Box<dyn FnOnce(i64) + Send>;
pub type ChallengeHandler = Box<dyn FnOnce(AuthenticationResponse) + Send>;
/// Completion for a modern cancel; receives resume data when available
pub type CancelHandler = Box<dyn FnOnce(Option<Vec<u8>>) + Send>;

/// The view a download was started from
pub trait InitiatingView: Send + Sync {
    fn id(&self) -> Uuid;

    fn title(&self) -> Option<String> {
        None
    }
}

/// Which download API generations the engine build exposes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineCapabilities {
    pub legacy: bool,
    pub modern: bool,
}

impl EngineCapabilities {
    pub fn legacy_only() -> Self {
        Self {
            legacy: true,
            modern: false,
        }
    }

    pub fn modern_only() -> Self {
        Self {
            legacy: false,
            modern: true,
        }
    }

    pub fn all() -> Self {
        Self {
            legacy: true,
            modern: true,
        }
    }

    pub fn none() -> Self {
        Self::default()
    }

    pub fn any(&self) -> bool {
        self.legacy || self.modern
    }

    pub fn supports(&self, generation: Generation) -> bool {
        match generation {
            Generation::Legacy => self.legacy,
            Generation::Modern => self.modern,
        }
    }
}

/// Callbacks delivered by a legacy download object
pub trait LegacyDownloadDelegate: Send + Sync {
    fn download_did_start(&self);

    fn decide_destination(
        &self,
        response: DownloadResponse,
        suggested_filename: String,
        completion: DestinationHandler,
    );

    fn did_receive_server_redirect(&self, url: String);

    fn did_receive_authentication_challenge(
        &self,
        challenge: AuthenticationChallenge,
        completion: ChallengeHandler,
    );

    /// Cumulative byte count; a value below the previous one means the
    /// engine restarted the transfer
    fn did_update_progress(&self, completed: u64, expected: Option<u64>);

    fn did_finish(&self);

    fn did_fail(&self, error: TransportError, resume_data: Option<Vec<u8>>);

    fn did_cancel(&self);
}

/// Callbacks delivered by a modern download object
pub trait ModernDownloadDelegate: Send + Sync {
    fn decide_destination(
        &self,
        response: DownloadResponse,
        suggested_filename: String,
        completion: DestinationHandler,
    );

    fn will_perform_http_redirection(
        &self,
        response: DownloadResponse,
        new_request: DownloadRequest,
        decision_handler: RedirectHandler,
    );

    fn did_receive_authentication_challenge(
        &self,
        challenge: AuthenticationChallenge,
        completion: ChallengeHandler,
    );

    /// Incremental byte count
    fn did_receive_data(&self, length: u64);

    fn did_finish(&self);

    fn did_fail(&self, error: TransportError, resume_data: Option<Vec<u8>>);
}

pub trait LegacyDownload: Send + Sync {
    /// The engine keeps the delegate weakly
    fn set_delegate(&self, delegate: Weak<dyn LegacyDownloadDelegate>);

    fn original_request(&self) -> DownloadRequest;

    fn was_user_initiated(&self) -> bool;

    /// Fire-and-forget; the engine answers later with `did_cancel` or `did_fail`
    fn cancel(&self);
}

pub trait ModernDownload: Send + Sync {
    /// The engine keeps the delegate weakly
    fn set_delegate(&self, delegate: Weak<dyn ModernDownloadDelegate>);

    fn original_request(&self) -> DownloadRequest;

    fn was_user_initiated(&self) -> bool;

    /// The engine does not report `did_fail` for a cancel it completed here
    fn cancel(&self, completion: CancelHandler);
}

/// A native download object of either generation
#[derive(Clone)]
pub enum NativeDownload {
    Legacy(Arc<dyn LegacyDownload>),
    Modern(Arc<dyn ModernDownload>),
}

impl NativeDownload {
    pub fn generation(&self) -> Generation {
        match self {
            NativeDownload::Legacy(_) => Generation::Legacy,
            NativeDownload::Modern(_) => Generation::Modern,
        }
    }

    pub fn original_request(&self) -> DownloadRequest {
        match self {
            NativeDownload::Legacy(d) => d.original_request(),
            NativeDownload::Modern(d) => d.original_request(),
        }
    }

    pub fn was_user_initiated(&self) -> bool {
        match self {
            NativeDownload::Legacy(d) => d.was_user_initiated(),
            NativeDownload::Modern(d) => d.was_user_initiated(),
        }
    }
}

impl std::fmt::Debug for NativeDownload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NativeDownload::{:?}", self.generation())
    }
}

/// Engine-side factory for native download objects
#[async_trait]
pub trait NativeDownloadFactory: Send + Sync {
    /// Probed once when a coordinator is built
    fn capabilities(&self) -> EngineCapabilities;

    async fn start_download(
        &self,
        request: &DownloadRequest,
        view: Option<Arc<dyn InitiatingView>>,
    ) -> Result<NativeDownload, TransportError>;

    /// `None` when the engine rejects the resume data
    async fn resume_download(
        &self,
        resume_data: &ResumeData,
        destination: &Path,
        view: Option<Arc<dyn InitiatingView>>,
    ) -> Option<NativeDownload>;
}
