//! Delegate adapter - normalizes native callbacks of either generation
//!
//! Native callbacks are queued on a per-download channel and handled by a
//! single dispatcher task, so all handle mutation and delegate calls for one
//! download happen strictly in engine order:
//! - Legacy redirects are surfaced for observation; decisions are ignored
//! - Modern redirects forward the caller's decision to the engine once
//! - Legacy auth challenges get default handling without a delegate call
//! - Progress is turned into a running total that never goes negative
//! - Empty resume data is dropped, never reported as a token

use crate::delegate::DownloadDelegate;
use crate::engine::handle::DownloadHandle;
use crate::engine::native::{
    ChallengeHandler, DestinationHandler, LegacyDownloadDelegate, ModernDownloadDelegate,
    RedirectHandler,
};
use crate::engine::policy::RedirectPolicy;
use crate::filename;
use dlbridge_types::{
    AuthFailurePolicy, AuthenticationChallenge, AuthenticationResponse, ByteProgress,
    DownloadEvent, DownloadRequest, DownloadResponse, DownloadState, Generation, Redirect,
    RedirectDecision, ResumeData, Settings, TransportError,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, RwLock as AsyncRwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// The delegate slot shared by a coordinator and all of its adapters
pub(crate) type DelegateSlot = Arc<RwLock<Option<Arc<dyn DownloadDelegate>>>>;
pub(crate) type ActiveDownloads = Arc<AsyncRwLock<HashMap<Uuid, DownloadHandle>>>;

/// A native callback waiting to be dispatched
pub(crate) enum NativeCallback {
    Started,
    DecideDestination {
        response: DownloadResponse,
        suggested_filename: String,
        completion: DestinationHandler,
    },
    Redirect {
        url: String,
        response: Option<DownloadResponse>,
        decision_handler: Option<RedirectHandler>,
    },
    Challenge {
        challenge: AuthenticationChallenge,
        completion: ChallengeHandler,
    },
    Progress(ProgressSignal),
    Finished,
    Failed {
        error: TransportError,
        resume_data: Option<Vec<u8>>,
    },
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProgressSignal {
    Cumulative { completed: u64, expected: Option<u64> },
    Increment(u64),
}

/// Receives native callbacks and queues them for the dispatcher
pub struct DownloadDelegateAdapter {
    id: Uuid,
    generation: Generation,
    tx: mpsc::UnboundedSender<NativeCallback>,
}

impl DownloadDelegateAdapter {
    pub(crate) fn new(generation: Generation) -> (Arc<Self>, mpsc::UnboundedReceiver<NativeCallback>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let adapter = Arc::new(Self {
            id: Uuid::new_v4(),
            generation,
            tx,
        });
        (adapter, rx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub(crate) fn enqueue(&self, callback: NativeCallback) {
        // The dispatcher is gone once the download is terminal
        if self.tx.send(callback).is_err() {
            debug!("Download {}: callback after terminal state dropped", self.id);
        }
    }
}

impl LegacyDownloadDelegate for DownloadDelegateAdapter {
    fn download_did_start(&self) {
        self.enqueue(NativeCallback::Started);
    }

    fn decide_destination(
        &self,
        response: DownloadResponse,
        suggested_filename: String,
        completion: DestinationHandler,
    ) {
        self.enqueue(NativeCallback::DecideDestination {
            response,
            suggested_filename,
            completion,
        });
    }

    fn did_receive_server_redirect(&self, url: String) {
        self.enqueue(NativeCallback::Redirect {
            url,
            response: None,
            decision_handler: None,
        });
    }

    fn did_receive_authentication_challenge(
        &self,
        challenge: AuthenticationChallenge,
        completion: ChallengeHandler,
    ) {
        debug!(
            "Download {}: legacy challenge for {} gets default handling",
            self.id, challenge.host
        );
        completion(AuthenticationResponse::default_handling());
    }

    fn did_update_progress(&self, completed: u64, expected: Option<u64>) {
        self.enqueue(NativeCallback::Progress(ProgressSignal::Cumulative {
            completed,
            expected,
        }));
    }

    fn did_finish(&self) {
        self.enqueue(NativeCallback::Finished);
    }

    fn did_fail(&self, error: TransportError, resume_data: Option<Vec<u8>>) {
        self.enqueue(NativeCallback::Failed { error, resume_data });
    }

    fn did_cancel(&self) {
        self.enqueue(NativeCallback::Cancelled);
    }
}

impl ModernDownloadDelegate for DownloadDelegateAdapter {
    fn decide_destination(
        &self,
        response: DownloadResponse,
        suggested_filename: String,
        completion: DestinationHandler,
    ) {
        self.enqueue(NativeCallback::DecideDestination {
            response,
            suggested_filename,
            completion,
        });
    }

    fn will_perform_http_redirection(
        &self,
        response: DownloadResponse,
        new_request: DownloadRequest,
        decision_handler: RedirectHandler,
    ) {
        self.enqueue(NativeCallback::Redirect {
            url: new_request.url,
            response: Some(response),
            decision_handler: Some(decision_handler),
        });
    }

    fn did_receive_authentication_challenge(
        &self,
        challenge: AuthenticationChallenge,
        completion: ChallengeHandler,
    ) {
        self.enqueue(NativeCallback::Challenge {
            challenge,
            completion,
        });
    }

    fn did_receive_data(&self, length: u64) {
        self.enqueue(NativeCallback::Progress(ProgressSignal::Increment(length)));
    }

    fn did_finish(&self) {
        self.enqueue(NativeCallback::Finished);
    }

    fn did_fail(&self, error: TransportError, resume_data: Option<Vec<u8>>) {
        self.enqueue(NativeCallback::Failed { error, resume_data });
    }
}

// ============================================================================
// Progress
// ============================================================================

/// Running byte total built from whichever signal the generation delivers
#[derive(Debug, Default)]
pub(crate) struct ProgressCounter {
    last_cumulative: u64,
    total: u64,
    expected: Option<u64>,
}

impl ProgressCounter {
    /// Returns `None` when nothing new arrived
    pub(crate) fn apply(&mut self, signal: ProgressSignal) -> Option<ByteProgress> {
        let mut restarted = false;
        let received = match signal {
            ProgressSignal::Cumulative {
                completed,
                expected,
            } => {
                if expected.is_some() {
                    self.expected = expected;
                }
                if completed < self.last_cumulative {
                    // transfer restarted
                    self.last_cumulative = 0;
                    self.total = 0;
                    restarted = true;
                }
                let delta = completed - self.last_cumulative;
                self.last_cumulative = completed;
                delta
            }
            ProgressSignal::Increment(length) => length,
        };

        if received == 0 && !restarted {
            return None;
        }
        self.total = self.total.saturating_add(received);

        Some(ByteProgress {
            received,
            total_received: self.total,
            expected: self.expected,
        })
    }

    pub(crate) fn set_expected(&mut self, expected: Option<u64>) {
        if self.expected.is_none() {
            self.expected = expected;
        }
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Everything the dispatcher shares with its coordinator
#[derive(Clone)]
pub(crate) struct DispatchContext {
    pub delegate: DelegateSlot,
    pub events: broadcast::Sender<DownloadEvent>,
    pub settings: Arc<Settings>,
    pub active: ActiveDownloads,
    pub shutdown: CancellationToken,
}

pub(crate) struct Dispatcher {
    handle: DownloadHandle,
    rx: mpsc::UnboundedReceiver<NativeCallback>,
    ctx: DispatchContext,
    progress: ProgressCounter,
}

impl Dispatcher {
    pub(crate) fn new(
        handle: DownloadHandle,
        rx: mpsc::UnboundedReceiver<NativeCallback>,
        ctx: DispatchContext,
    ) -> Self {
        Self {
            handle,
            rx,
            ctx,
            progress: ProgressCounter::default(),
        }
    }

    pub(crate) fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        loop {
            let callback = tokio::select! {
                callback = self.rx.recv() => callback,
                _ = self.ctx.shutdown.cancelled() => {
                    debug!("Download {}: coordinator dropped, stopping dispatch", self.handle.id());
                    None
                }
            };
            let Some(callback) = callback else {
                break;
            };
            self.dispatch(callback).await;
            if self.handle.is_terminal() {
                break;
            }
        }
        // Anything still queued gets answered so the engine is not left waiting
        self.rx.close();
        while let Ok(callback) = self.rx.try_recv() {
            Self::answer_after_terminal(callback);
        }
        debug!("Download {}: dispatcher finished", self.handle.id());
    }

    fn delegate(&self) -> Option<Arc<dyn DownloadDelegate>> {
        self.ctx.delegate.read().clone()
    }

    fn emit(&self, event: DownloadEvent) {
        let _ = self.ctx.events.send(event);
    }

    async fn dispatch(&mut self, callback: NativeCallback) {
        if self.handle.is_terminal() {
            Self::answer_after_terminal(callback);
            return;
        }
        if self.handle.state() == DownloadState::Created {
            self.handle.transition(DownloadState::Requested);
        }

        match callback {
            NativeCallback::Started => {}
            NativeCallback::DecideDestination {
                response,
                suggested_filename,
                completion,
            } => {
                self.decide_destination(response, suggested_filename, completion)
                    .await
            }
            NativeCallback::Redirect {
                url,
                response,
                decision_handler,
            } => self.redirect(url, response, decision_handler).await,
            NativeCallback::Challenge {
                challenge,
                completion,
            } => self.challenge(challenge, completion).await,
            NativeCallback::Progress(signal) => self.progress(signal).await,
            NativeCallback::Finished => self.finish().await,
            NativeCallback::Failed { error, resume_data } => self.fail(error, resume_data).await,
            NativeCallback::Cancelled => self.fail(TransportError::cancelled(), None).await,
        }
    }

    fn answer_after_terminal(callback: NativeCallback) {
        match callback {
            NativeCallback::DecideDestination { completion, .. } => completion(None),
            NativeCallback::Redirect {
                decision_handler: Some(handler),
                ..
            } => handler(RedirectPolicy::to_native(RedirectDecision::Cancel).raw()),
            NativeCallback::Challenge { completion, .. } => completion(AuthenticationResponse::cancel()),
            _ => {}
        }
    }

    async fn decide_destination(
        &mut self,
        response: DownloadResponse,
        suggested_filename: String,
        completion: DestinationHandler,
    ) {
        let id = self.handle.id();
        let name = filename::suggested_filename(&response, &suggested_filename);
        let mime_type = response.mime_type.as_deref().map(filename::normalize_mime_type);
        self.handle
            .set_response_info(name.clone(), mime_type, response.expected_content_length);
        self.progress.set_expected(response.expected_content_length);

        let destination = if let Some(preset) = self.handle.preset_destination().map(Path::to_path_buf) {
            debug!("Download {}: using preset destination {:?}", id, preset);
            Some(preset)
        } else if let Some(delegate) = self.delegate() {
            delegate
                .decide_destination(&self.handle, &response, &name)
                .await
                .map(|path| resolve_destination(&self.ctx.settings, path))
        } else {
            Some(self.ctx.settings.download_directory.join(&name))
        };

        match &destination {
            Some(path) => {
                info!("Download {}: destination {:?}", id, path);
                self.handle.transition(DownloadState::InProgress);
            }
            None => info!("Download {}: no destination chosen, engine will cancel", id),
        }
        self.handle.set_destination(destination.clone());
        self.emit(DownloadEvent::DestinationDecided {
            id,
            destination: destination.clone(),
        });
        completion(destination);
    }

    async fn redirect(
        &mut self,
        url: String,
        response: Option<DownloadResponse>,
        decision_handler: Option<RedirectHandler>,
    ) {
        let id = self.handle.id();
        self.handle.transition(DownloadState::RedirectPending);
        self.handle.push_redirect(url.clone());
        self.emit(DownloadEvent::Redirected {
            id,
            url: url.clone(),
        });

        let redirect = Redirect {
            url,
            response,
            decision_required: decision_handler.is_some(),
        };
        let decision = match self.delegate() {
            Some(delegate) => delegate.will_redirect(&self.handle, &redirect).await,
            None => RedirectDecision::Allow,
        };

        match decision_handler {
            Some(handler) => {
                let policy = RedirectPolicy::to_native(decision);
                info!("Download {}: redirect to {} -> {:?}", id, redirect.url, decision);
                handler(policy.raw());
            }
            None => debug!(
                "Download {}: observed redirect to {}, decision {:?} not applicable",
                id, redirect.url, decision
            ),
        }
    }

    async fn challenge(&mut self, challenge: AuthenticationChallenge, completion: ChallengeHandler) {
        let id = self.handle.id();
        self.handle.transition(DownloadState::Authenticating);

        let response = match self.delegate() {
            Some(delegate) => match delegate
                .did_receive_authentication_challenge(&self.handle, &challenge)
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    warn!(
                        "Download {}: challenge handler for {} failed: {}",
                        id, challenge.host, e
                    );
                    match self.ctx.settings.auth_failure_policy {
                        AuthFailurePolicy::PerformDefaultHandling => {
                            AuthenticationResponse::default_handling()
                        }
                        AuthFailurePolicy::Cancel => AuthenticationResponse::cancel(),
                    }
                }
            },
            None => AuthenticationResponse::default_handling(),
        };

        debug!(
            "Download {}: challenge for {} answered with {:?}",
            id,
            challenge.host,
            response.disposition()
        );
        completion(response);
    }

    async fn progress(&mut self, signal: ProgressSignal) {
        let Some(progress) = self.progress.apply(signal) else {
            return;
        };
        self.handle.transition(DownloadState::InProgress);
        self.handle
            .set_progress(progress.total_received, progress.expected);
        self.emit(DownloadEvent::Progress {
            id: self.handle.id(),
            progress,
        });
        if let Some(delegate) = self.delegate() {
            delegate.did_receive_bytes(&self.handle, progress).await;
        }
    }

    async fn finish(&mut self) {
        info!("Download {}: finished", self.handle.id());
        self.handle.transition(DownloadState::Finished);
        self.retire().await;

        if let Some(delegate) = self.delegate() {
            delegate.did_finish(&self.handle).await;
        }
        self.emit(DownloadEvent::Finished {
            download: self.handle.snapshot(),
        });
    }

    async fn fail(&mut self, error: TransportError, resume_data: Option<Vec<u8>>) {
        let resume_data = resume_data.and_then(ResumeData::new);
        let state = if error.is_cancellation() || self.handle.cancel_requested() {
            DownloadState::Cancelled
        } else {
            DownloadState::Failed
        };
        info!(
            "Download {}: {} ({}), resume data: {}",
            self.handle.id(),
            state,
            error,
            resume_data.as_ref().map(|d| d.len()).unwrap_or(0)
        );

        self.handle.store_resume_data(resume_data.clone());
        self.handle.set_error(error.clone());
        self.handle.transition(state);
        self.retire().await;

        if let Some(delegate) = self.delegate() {
            delegate
                .did_fail(&self.handle, &error, resume_data.as_ref())
                .await;
        }
        self.emit(DownloadEvent::Failed {
            download: self.handle.snapshot(),
            error,
        });
    }

    /// Drop the handle from the coordinator's active set
    async fn retire(&self) {
        self.ctx.active.write().await.remove(&self.handle.id());
    }
}

/// Route a destination the delegate picked relative to the configured directory
pub(crate) fn resolve_destination(settings: &Settings, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        settings.download_directory.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cumulative_progress_deltas() {
        let mut counter = ProgressCounter::default();
        let p = counter
            .apply(ProgressSignal::Cumulative {
                completed: 100,
                expected: Some(1000),
            })
            .unwrap();
        assert_eq!((p.received, p.total_received, p.expected), (100, 100, Some(1000)));

        let p = counter
            .apply(ProgressSignal::Cumulative {
                completed: 250,
                expected: None,
            })
            .unwrap();
        assert_eq!((p.received, p.total_received, p.expected), (150, 250, Some(1000)));
    }

    #[test]
    fn test_cumulative_restart_resets_counter() {
        let mut counter = ProgressCounter::default();
        counter.apply(ProgressSignal::Cumulative {
            completed: 500,
            expected: None,
        });
        let p = counter
            .apply(ProgressSignal::Cumulative {
                completed: 40,
                expected: None,
            })
            .unwrap();
        assert_eq!(p.received, 40);
        assert_eq!(p.total_received, 40);
    }

    #[test]
    fn test_unchanged_cumulative_is_silent() {
        let mut counter = ProgressCounter::default();
        counter.apply(ProgressSignal::Cumulative {
            completed: 10,
            expected: None,
        });
        assert!(counter
            .apply(ProgressSignal::Cumulative {
                completed: 10,
                expected: None,
            })
            .is_none());
        assert!(counter.apply(ProgressSignal::Increment(0)).is_none());
    }

    #[test]
    fn test_increments_accumulate() {
        let mut counter = ProgressCounter::default();
        counter.set_expected(Some(30));
        counter.apply(ProgressSignal::Increment(10));
        let p = counter.apply(ProgressSignal::Increment(20)).unwrap();
        assert_eq!(p.total_received, 30);
        assert_eq!(p.fraction(), Some(1.0));
    }

    #[test]
    fn test_relative_destination_resolved() {
        let settings = Settings {
            download_directory: PathBuf::from("/downloads"),
            ..Settings::default()
        };
        assert_eq!(
            resolve_destination(&settings, PathBuf::from("a.zip")),
            PathBuf::from("/downloads/a.zip")
        );
        assert_eq!(
            resolve_destination(&settings, PathBuf::from("/tmp/a.zip")),
            PathBuf::from("/tmp/a.zip")
        );
    }
}
