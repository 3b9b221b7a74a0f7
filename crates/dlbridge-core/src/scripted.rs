//! Scripted engine
//!
//! A deterministic [`NativeDownloadFactory`] that plays back recorded native
//! callbacks for either generation. Scripts are plain JSON so they can be
//! written by hand and replayed from the CLI:
//!
//! ```json
//! {
//!   "generation": "modern",
//!   "request": { "method": "GET", "url": "https://example.com/a", "headers": [] },
//!   "expected_length": 2048,
//!   "steps": [
//!     { "step": "redirect", "url": "https://example.com/file2.zip" },
//!     { "step": "decide_destination", "suggested_filename": "file2.zip" },
//!     { "step": "data", "bytes": 2048 },
//!     { "step": "finish" }
//!   ]
//! }
//! ```
//!
//! Everything the engine receives back (redirect policies, challenge
//! answers, destinations, cancels) is written to a journal.

use crate::engine::{
    CancelHandler, EngineCapabilities, InitiatingView, LegacyDownload, LegacyDownloadDelegate,
    ModernDownload, ModernDownloadDelegate, NativeDownload, NativeDownloadFactory,
    RedirectPolicy,
};
use async_trait::async_trait;
use dlbridge_types::{
    AuthChallengeDisposition, AuthenticationChallenge, AuthenticationResponse, DownloadRequest,
    DownloadResponse, Generation, RedirectDecision, ResumeData, TransportError, TransportErrorKind,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

fn default_true() -> bool {
    true
}

/// A recorded download: how the engine behaves from start to terminal callback
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadScript {
    pub generation: Generation,
    /// Request to start with when the script is replayed on its own
    #[serde(default)]
    pub request: Option<DownloadRequest>,
    #[serde(default = "default_true")]
    pub user_initiated: bool,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub expected_length: Option<u64>,
    /// Bytes handed back when the download is cancelled
    #[serde(default)]
    pub resume_data_on_cancel: Option<Vec<u8>>,
    pub steps: Vec<ScriptStep>,
}

impl DownloadScript {
    pub fn new(generation: Generation) -> Self {
        Self {
            generation,
            request: None,
            user_initiated: true,
            mime_type: None,
            expected_length: None,
            resume_data_on_cancel: None,
            steps: Vec::new(),
        }
    }

    pub fn with_request(mut self, request: DownloadRequest) -> Self {
        self.request = Some(request);
        self
    }

    pub fn with_expected_length(mut self, length: u64) -> Self {
        self.expected_length = Some(length);
        self
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    pub fn with_resume_data_on_cancel(mut self, bytes: Vec<u8>) -> Self {
        self.resume_data_on_cancel = Some(bytes);
        self
    }

    pub fn step(mut self, step: ScriptStep) -> Self {
        self.steps.push(step);
        self
    }
}

/// One native event of a script
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum ScriptStep {
    Redirect { url: String },
    DecideDestination { suggested_filename: String },
    Challenge { challenge: AuthenticationChallenge },
    Data { bytes: u64 },
    /// Legacy only: the transfer starts over from zero
    Restart,
    Sleep { ms: u64 },
    /// Wait until the download is cancelled
    Hold,
    Finish,
    Fail {
        error: TransportError,
        #[serde(default)]
        resume_data: Option<Vec<u8>>,
    },
}

/// What the engine was told by the layer above it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NativeRecord {
    Started { generation: Generation, url: String },
    RedirectPolicy(i64),
    ChallengeAnswered(AuthChallengeDisposition),
    Destination(Option<PathBuf>),
    Cancelled,
}

type Journal = Arc<Mutex<Vec<NativeRecord>>>;

// ============================================================================
// Factory
// ============================================================================

/// Native download factory playing queued scripts
pub struct ScriptedEngine {
    capabilities: EngineCapabilities,
    scripts: Mutex<VecDeque<DownloadScript>>,
    resumable: Mutex<HashMap<Vec<u8>, DownloadScript>>,
    journal: Journal,
}

impl ScriptedEngine {
    pub fn new(capabilities: EngineCapabilities) -> Self {
        Self {
            capabilities,
            scripts: Mutex::new(VecDeque::new()),
            resumable: Mutex::new(HashMap::new()),
            journal: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Queue a script for the next `start_download`
    pub fn push(&self, script: DownloadScript) {
        self.scripts.lock().push_back(script);
    }

    /// Accept `resume_data` once, playing `script` for the resumed download
    pub fn push_resume(&self, resume_data: Vec<u8>, script: DownloadScript) {
        self.resumable.lock().insert(resume_data, script);
    }

    pub fn journal(&self) -> Vec<NativeRecord> {
        self.journal.lock().clone()
    }

    fn build(&self, script: DownloadScript, request: DownloadRequest) -> NativeDownload {
        let download = ScriptedDownload {
            request,
            user_initiated: script.user_initiated,
            token: CancellationToken::new(),
            journal: self.journal.clone(),
            script: Mutex::new(Some(script.clone())),
            resume_data_on_cancel: script.resume_data_on_cancel.clone(),
        };
        match script.generation {
            Generation::Legacy => NativeDownload::Legacy(Arc::new(ScriptedLegacy(download))),
            Generation::Modern => NativeDownload::Modern(Arc::new(ScriptedModern(download))),
        }
    }
}

#[async_trait]
impl NativeDownloadFactory for ScriptedEngine {
    fn capabilities(&self) -> EngineCapabilities {
        self.capabilities
    }

    async fn start_download(
        &self,
        request: &DownloadRequest,
        _view: Option<Arc<dyn InitiatingView>>,
    ) -> Result<NativeDownload, TransportError> {
        let script = self.scripts.lock().pop_front().ok_or_else(|| {
            TransportError::new(TransportErrorKind::Other, "no script queued for download")
        })?;

        if !self.capabilities.supports(script.generation) {
            return Err(TransportError::new(
                TransportErrorKind::Other,
                format!("{} downloads are not available", script.generation),
            ));
        }

        Ok(self.build(script, request.clone()))
    }

    async fn resume_download(
        &self,
        resume_data: &ResumeData,
        _destination: &Path,
        _view: Option<Arc<dyn InitiatingView>>,
    ) -> Option<NativeDownload> {
        let script = self.resumable.lock().remove(resume_data.as_bytes())?;
        if !self.capabilities.supports(script.generation) {
            return None;
        }

        let request = script
            .request
            .clone()
            .unwrap_or_else(|| DownloadRequest::get("about:blank"));
        Some(self.build(script, request))
    }
}

// ============================================================================
// Native objects
// ============================================================================

struct ScriptedDownload {
    request: DownloadRequest,
    user_initiated: bool,
    token: CancellationToken,
    journal: Journal,
    /// Taken when playback starts
    script: Mutex<Option<DownloadScript>>,
    resume_data_on_cancel: Option<Vec<u8>>,
}

impl ScriptedDownload {
    fn play(&self, sink: Sink) {
        let Some(script) = self.script.lock().take() else {
            return;
        };
        self.journal.lock().push(NativeRecord::Started {
            generation: script.generation,
            url: self.request.url.clone(),
        });

        let playback = Playback {
            url: self.request.url.clone(),
            script,
            sink,
            token: self.token.clone(),
            journal: self.journal.clone(),
            cumulative: 0,
        };
        tokio::spawn(playback.run());
    }

    fn record_cancel(&self) -> bool {
        if self.token.is_cancelled() {
            return false;
        }
        self.journal.lock().push(NativeRecord::Cancelled);
        self.token.cancel();
        true
    }
}

struct ScriptedLegacy(ScriptedDownload);

impl LegacyDownload for ScriptedLegacy {
    fn set_delegate(&self, delegate: Weak<dyn LegacyDownloadDelegate>) {
        self.0.play(Sink::Legacy(delegate));
    }

    fn original_request(&self) -> DownloadRequest {
        self.0.request.clone()
    }

    fn was_user_initiated(&self) -> bool {
        self.0.user_initiated
    }

    fn cancel(&self) {
        self.0.record_cancel();
    }
}

struct ScriptedModern(ScriptedDownload);

impl ModernDownload for ScriptedModern {
    fn set_delegate(&self, delegate: Weak<dyn ModernDownloadDelegate>) {
        self.0.play(Sink::Modern(delegate));
    }

    fn original_request(&self) -> DownloadRequest {
        self.0.request.clone()
    }

    fn was_user_initiated(&self) -> bool {
        self.0.user_initiated
    }

    fn cancel(&self, completion: CancelHandler) {
        if self.0.record_cancel() {
            completion(self.0.resume_data_on_cancel.clone());
        } else {
            completion(None);
        }
    }
}

// ============================================================================
// Playback
// ============================================================================

enum Sink {
    Legacy(Weak<dyn LegacyDownloadDelegate>),
    Modern(Weak<dyn ModernDownloadDelegate>),
}

/// Result of one step
enum Flow {
    Continue,
    Stop,
}

struct Playback {
    url: String,
    script: DownloadScript,
    sink: Sink,
    token: CancellationToken,
    journal: Journal,
    /// Legacy running total
    cumulative: u64,
}

impl Playback {
    async fn run(mut self) {
        if let Sink::Legacy(delegate) = &self.sink {
            match delegate.upgrade() {
                Some(delegate) => delegate.download_did_start(),
                None => return,
            }
        }

        let steps = std::mem::take(&mut self.script.steps);
        for step in steps {
            if self.token.is_cancelled() {
                break;
            }
            match self.step(step).await {
                Flow::Continue => {}
                Flow::Stop => return,
            }
        }

        if self.token.is_cancelled() {
            self.cancelled();
        }
    }

    async fn step(&mut self, step: ScriptStep) -> Flow {
        debug!("Scripted {} download: {:?}", self.script.generation, step);
        match step {
            ScriptStep::Redirect { url } => self.redirect(url).await,
            ScriptStep::DecideDestination { suggested_filename } => {
                self.decide_destination(suggested_filename).await
            }
            ScriptStep::Challenge { challenge } => self.challenge(challenge).await,
            ScriptStep::Data { bytes } => {
                match &self.sink {
                    Sink::Legacy(delegate) => {
                        self.cumulative += bytes;
                        let Some(delegate) = delegate.upgrade() else {
                            return Flow::Stop;
                        };
                        delegate.did_update_progress(self.cumulative, self.script.expected_length);
                    }
                    Sink::Modern(delegate) => {
                        let Some(delegate) = delegate.upgrade() else {
                            return Flow::Stop;
                        };
                        delegate.did_receive_data(bytes);
                    }
                }
                Flow::Continue
            }
            ScriptStep::Restart => {
                self.cumulative = 0;
                Flow::Continue
            }
            ScriptStep::Sleep { ms } => {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(ms)) => {}
                    _ = self.token.cancelled() => {}
                }
                Flow::Continue
            }
            ScriptStep::Hold => {
                self.token.cancelled().await;
                Flow::Continue
            }
            ScriptStep::Finish => {
                match &self.sink {
                    Sink::Legacy(d) => {
                        if let Some(d) = d.upgrade() {
                            d.did_finish();
                        }
                    }
                    Sink::Modern(d) => {
                        if let Some(d) = d.upgrade() {
                            d.did_finish();
                        }
                    }
                }
                Flow::Stop
            }
            ScriptStep::Fail { error, resume_data } => {
                self.fail(error, resume_data);
                Flow::Stop
            }
        }
    }

    fn response(&self, status_code: u16) -> DownloadResponse {
        DownloadResponse {
            url: self.url.clone(),
            mime_type: self.script.mime_type.clone(),
            expected_content_length: self.script.expected_length,
            status_code: Some(status_code),
        }
    }

    async fn redirect(&mut self, url: String) -> Flow {
        let response = self.response(302);
        self.url = url.clone();

        match &self.sink {
            Sink::Legacy(delegate) => {
                let Some(delegate) = delegate.upgrade() else {
                    return Flow::Stop;
                };
                delegate.did_receive_server_redirect(url);
                Flow::Continue
            }
            Sink::Modern(delegate) => {
                let (tx, rx) = oneshot::channel();
                {
                    let Some(delegate) = delegate.upgrade() else {
                        return Flow::Stop;
                    };
                    delegate.will_perform_http_redirection(
                        response,
                        DownloadRequest::get(url),
                        Box::new(move |raw: i64| {
                            let _ = tx.send(raw);
                        }),
                    );
                }

                let Some(raw) = self.answer(rx).await else {
                    return Flow::Continue;
                };
                self.journal.lock().push(NativeRecord::RedirectPolicy(raw));

                match RedirectPolicy::decision_from_raw(raw) {
                    Ok(RedirectDecision::Allow) => Flow::Continue,
                    Ok(RedirectDecision::Cancel) => {
                        self.fail(TransportError::cancelled(), None);
                        Flow::Stop
                    }
                    Err(e) => {
                        error!("Scripted download received a bad redirect policy: {}", e);
                        self.fail(TransportError::new(TransportErrorKind::Other, e.to_string()), None);
                        Flow::Stop
                    }
                }
            }
        }
    }

    async fn decide_destination(&mut self, suggested_filename: String) -> Flow {
        let response = self.response(200);
        let (tx, rx) = oneshot::channel();
        let completion = Box::new(move |destination: Option<PathBuf>| {
            let _ = tx.send(destination);
        });

        match &self.sink {
            Sink::Legacy(d) => match d.upgrade() {
                Some(d) => d.decide_destination(response, suggested_filename, completion),
                None => return Flow::Stop,
            },
            Sink::Modern(d) => match d.upgrade() {
                Some(d) => d.decide_destination(response, suggested_filename, completion),
                None => return Flow::Stop,
            },
        }

        let Some(destination) = self.answer(rx).await else {
            return Flow::Continue;
        };
        self.journal
            .lock()
            .push(NativeRecord::Destination(destination.clone()));

        if destination.is_none() {
            self.abort();
            return Flow::Stop;
        }
        Flow::Continue
    }

    async fn challenge(&mut self, challenge: AuthenticationChallenge) -> Flow {
        let (tx, rx) = oneshot::channel();
        let completion = Box::new(move |response: AuthenticationResponse| {
            let _ = tx.send(response);
        });

        match &self.sink {
            Sink::Legacy(d) => match d.upgrade() {
                Some(d) => d.did_receive_authentication_challenge(challenge, completion),
                None => return Flow::Stop,
            },
            Sink::Modern(d) => match d.upgrade() {
                Some(d) => d.did_receive_authentication_challenge(challenge, completion),
                None => return Flow::Stop,
            },
        }

        let Some(response) = self.answer(rx).await else {
            return Flow::Continue;
        };
        let disposition = response.disposition();
        self.journal
            .lock()
            .push(NativeRecord::ChallengeAnswered(disposition));

        if disposition == AuthChallengeDisposition::CancelAuthenticationChallenge {
            self.fail(TransportError::cancelled(), None);
            return Flow::Stop;
        }
        Flow::Continue
    }

    /// Wait for a completion handler; `None` when cancelled first or dropped
    async fn answer<T>(&self, rx: oneshot::Receiver<T>) -> Option<T> {
        tokio::select! {
            answer = rx => answer.ok(),
            _ = self.token.cancelled() => None,
        }
    }

    fn fail(&self, error: TransportError, resume_data: Option<Vec<u8>>) {
        match &self.sink {
            Sink::Legacy(d) => {
                if let Some(d) = d.upgrade() {
                    d.did_fail(error, resume_data);
                }
            }
            Sink::Modern(d) => {
                if let Some(d) = d.upgrade() {
                    d.did_fail(error, resume_data);
                }
            }
        }
    }

    /// The layer above declined to continue
    fn abort(&self) {
        match &self.sink {
            Sink::Legacy(d) => {
                if let Some(d) = d.upgrade() {
                    d.did_cancel();
                }
            }
            Sink::Modern(_) => self.fail(TransportError::cancelled(), None),
        }
    }

    /// Report a cancel the way each generation does
    fn cancelled(&self) {
        match &self.sink {
            Sink::Legacy(d) => {
                let Some(d) = d.upgrade() else {
                    return;
                };
                match self.script.resume_data_on_cancel.clone() {
                    Some(data) => d.did_fail(TransportError::cancelled(), Some(data)),
                    None => d.did_cancel(),
                }
            }
            // the cancel completion handler already carried the outcome
            Sink::Modern(_) => {}
        }
    }
}
