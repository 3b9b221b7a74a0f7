//! Shared helpers for the coordinator scenarios

#![allow(dead_code)]

use async_trait::async_trait;
use dlbridge_core::scripted::ScriptedEngine;
use dlbridge_core::{DownloadCoordinator, DownloadDelegate, DownloadHandle, EngineCapabilities};
use dlbridge_types::{
    AuthenticationChallenge, AuthenticationResponse, ByteProgress, DownloadEvent,
    DownloadResponse, Redirect, RedirectDecision, ResumeData, Settings, TransportError,
};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

/// A delegate callback as observed by the test
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Destination { suggested: String },
    Redirect { url: String, decision_required: bool },
    Challenge { host: String },
    Bytes(ByteProgress),
    Finished,
    Failed {
        error: TransportError,
        resume_data: Option<Vec<u8>>,
    },
}

pub enum AuthBehavior {
    Respond(AuthenticationResponse),
    Error,
}

pub struct RecordingDelegate {
    calls: Mutex<Vec<Call>>,
    pub directory: PathBuf,
    pub accept_destination: bool,
    pub redirect_decision: RedirectDecision,
    pub auth: AuthBehavior,
}

impl RecordingDelegate {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            directory: PathBuf::from("/downloads"),
            accept_destination: true,
            redirect_decision: RedirectDecision::Allow,
            auth: AuthBehavior::Respond(AuthenticationResponse::default_handling()),
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    fn push(&self, call: Call) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl DownloadDelegate for RecordingDelegate {
    async fn decide_destination(
        &self,
        _download: &DownloadHandle,
        _response: &DownloadResponse,
        suggested_filename: &str,
    ) -> Option<PathBuf> {
        self.push(Call::Destination {
            suggested: suggested_filename.to_string(),
        });
        self.accept_destination
            .then(|| self.directory.join(suggested_filename))
    }

    async fn will_redirect(&self, _download: &DownloadHandle, redirect: &Redirect) -> RedirectDecision {
        self.push(Call::Redirect {
            url: redirect.url.clone(),
            decision_required: redirect.decision_required,
        });
        self.redirect_decision
    }

    async fn did_receive_authentication_challenge(
        &self,
        _download: &DownloadHandle,
        challenge: &AuthenticationChallenge,
    ) -> anyhow::Result<AuthenticationResponse> {
        self.push(Call::Challenge {
            host: challenge.host.clone(),
        });
        match &self.auth {
            AuthBehavior::Respond(response) => Ok(response.clone()),
            AuthBehavior::Error => Err(anyhow::anyhow!("keychain unavailable")),
        }
    }

    async fn did_receive_bytes(&self, _download: &DownloadHandle, progress: ByteProgress) {
        self.push(Call::Bytes(progress));
    }

    async fn did_finish(&self, _download: &DownloadHandle) {
        self.push(Call::Finished);
    }

    async fn did_fail(
        &self,
        _download: &DownloadHandle,
        error: &TransportError,
        resume_data: Option<&ResumeData>,
    ) {
        self.push(Call::Failed {
            error: error.clone(),
            resume_data: resume_data.map(|d| d.as_bytes().to_vec()),
        });
    }
}

pub struct Harness {
    pub engine: Arc<ScriptedEngine>,
    pub coordinator: DownloadCoordinator,
    pub delegate: Arc<RecordingDelegate>,
    pub events: broadcast::Receiver<DownloadEvent>,
}

pub fn harness(capabilities: EngineCapabilities) -> Harness {
    harness_with(capabilities, RecordingDelegate::new(), test_settings())
}

pub fn harness_with(
    capabilities: EngineCapabilities,
    delegate: RecordingDelegate,
    settings: Settings,
) -> Harness {
    let engine = Arc::new(ScriptedEngine::new(capabilities));
    let coordinator = DownloadCoordinator::new(engine.clone(), settings);
    let delegate = Arc::new(delegate);
    coordinator.set_delegate(delegate.clone());
    let events = coordinator.subscribe();

    Harness {
        engine,
        coordinator,
        delegate,
        events,
    }
}

pub fn test_settings() -> Settings {
    Settings {
        cancel_resume_data_timeout_ms: 500,
        download_directory: PathBuf::from("/downloads"),
        ..Settings::default()
    }
}

/// Next event for `id` matching `pred`
pub async fn wait_for(
    events: &mut broadcast::Receiver<DownloadEvent>,
    id: Uuid,
    pred: impl Fn(&DownloadEvent) -> bool,
) -> DownloadEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(event) if event.download_id() == id && pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for download event")
}

pub async fn wait_terminal(events: &mut broadcast::Receiver<DownloadEvent>, id: Uuid) -> DownloadEvent {
    wait_for(events, id, DownloadEvent::is_terminal).await
}

/// Drain whatever is queued and return the events belonging to `id`
pub fn drain(events: &mut broadcast::Receiver<DownloadEvent>, id: Uuid) -> Vec<DownloadEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        if event.download_id() == id {
            out.push(event);
        }
    }
    out
}
