//! Shared types for dlbridge
//!
//! This crate contains the data structures shared between the core
//! coordinator, the CLI, and anything observing download events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

// ============================================================================
// Request / Response Types
// ============================================================================

/// The request a download was started from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRequest {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    /// Destination chosen ahead of time; skips asking the delegate
    #[serde(default)]
    pub destination: Option<PathBuf>,
}

impl DownloadRequest {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            headers: Vec::new(),
            destination: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new("GET", url)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_destination(mut self, destination: impl Into<PathBuf>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Response metadata handed over when the engine asks for a destination
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadResponse {
    pub url: String,
    pub mime_type: Option<String>,
    pub expected_content_length: Option<u64>,
    pub status_code: Option<u16>,
}

/// A redirect observed (legacy) or offered for decision (modern)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Redirect {
    /// Redirect target
    pub url: String,
    /// Response that triggered the redirect, when the engine provides it
    pub response: Option<DownloadResponse>,
    /// False when the engine only notifies; any decision is then ignored
    pub decision_required: bool,
}

/// Caller verdict for a single redirect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RedirectDecision {
    Allow,
    Cancel,
}

// ============================================================================
// Authentication Types
// ============================================================================

/// Protection space and history of an authentication challenge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticationChallenge {
    pub host: String,
    pub port: u16,
    pub protocol: String,
    pub realm: Option<String>,
    /// e.g. "basic", "digest", "client-certificate"
    pub authentication_method: String,
    #[serde(default)]
    pub previous_failure_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthChallengeDisposition {
    UseCredential,
    PerformDefaultHandling,
    CancelAuthenticationChallenge,
    RejectProtectionSpace,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub user: String,
    pub password: String,
}

impl Credential {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }
}

/// Answer to an authentication challenge.
///
/// A credential is carried only with [`AuthChallengeDisposition::UseCredential`];
/// the constructors are the only way to build one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticationResponse {
    disposition: AuthChallengeDisposition,
    credential: Option<Credential>,
}

impl AuthenticationResponse {
    pub fn use_credential(credential: Credential) -> Self {
        Self {
            disposition: AuthChallengeDisposition::UseCredential,
            credential: Some(credential),
        }
    }

    pub fn default_handling() -> Self {
        Self::without_credential(AuthChallengeDisposition::PerformDefaultHandling)
    }

    pub fn cancel() -> Self {
        Self::without_credential(AuthChallengeDisposition::CancelAuthenticationChallenge)
    }

    pub fn reject_protection_space() -> Self {
        Self::without_credential(AuthChallengeDisposition::RejectProtectionSpace)
    }

    fn without_credential(disposition: AuthChallengeDisposition) -> Self {
        Self {
            disposition,
            credential: None,
        }
    }

    pub fn disposition(&self) -> AuthChallengeDisposition {
        self.disposition
    }

    pub fn credential(&self) -> Option<&Credential> {
        self.credential.as_ref()
    }
}

// ============================================================================
// Resume Data
// ============================================================================

/// Opaque engine-produced blob that allows resuming an interrupted transfer.
///
/// Never empty: an empty blob means "no resume possible" and is represented
/// by the absence of a `ResumeData`.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<u8>", into = "Vec<u8>")]
pub struct ResumeData(Vec<u8>);

impl ResumeData {
    pub fn new(bytes: Vec<u8>) -> Option<Self> {
        if bytes.is_empty() {
            None
        } else {
            Some(Self(bytes))
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for ResumeData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResumeData({} bytes)", self.0.len())
    }
}

impl TryFrom<Vec<u8>> for ResumeData {
    type Error = String;

    fn try_from(bytes: Vec<u8>) -> Result<Self, Self::Error> {
        Self::new(bytes).ok_or_else(|| "resume data must not be empty".to_string())
    }
}

impl From<ResumeData> for Vec<u8> {
    fn from(data: ResumeData) -> Self {
        data.0
    }
}

// ============================================================================
// Download State Types
// ============================================================================

/// Which native download API backs a download
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Generation {
    Legacy,
    Modern,
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Generation::Legacy => f.write_str("legacy"),
            Generation::Modern => f.write_str("modern"),
        }
    }
}

/// Lifecycle state of a single download
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadState {
    Created,
    Requested,
    RedirectPending,
    Authenticating,
    InProgress,
    Finished,
    Failed,
    Cancelled,
}

impl DownloadState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DownloadState::Finished | DownloadState::Failed | DownloadState::Cancelled
        )
    }
}

impl fmt::Display for DownloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DownloadState::Created => "created",
            DownloadState::Requested => "requested",
            DownloadState::RedirectPending => "redirect pending",
            DownloadState::Authenticating => "authenticating",
            DownloadState::InProgress => "in progress",
            DownloadState::Finished => "finished",
            DownloadState::Failed => "failed",
            DownloadState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Byte progress reported to the delegate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteProgress {
    /// Bytes added since the previous report
    pub received: u64,
    /// Running total; only goes down when the engine restarts the transfer
    pub total_received: u64,
    pub expected: Option<u64>,
}

impl ByteProgress {
    pub fn fraction(&self) -> Option<f64> {
        match self.expected {
            Some(expected) if expected > 0 => Some(self.total_received as f64 / expected as f64),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportErrorKind {
    Cancelled,
    Network,
    Http,
    Filesystem,
    Other,
}

/// Error reported by the engine while transferring
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportError {
    pub kind: TransportErrorKind,
    #[serde(default)]
    pub code: Option<i64>,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: None,
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(TransportErrorKind::Cancelled, "cancelled")
    }

    pub fn with_code(mut self, code: i64) -> Self {
        self.code = Some(code);
        self
    }

    pub fn is_cancellation(&self) -> bool {
        self.kind == TransportErrorKind::Cancelled
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{:?} ({}): {}", self.kind, code, self.message),
            None => write!(f, "{:?}: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for TransportError {}

/// Point-in-time copy of a download's state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadSnapshot {
    pub id: Uuid,
    pub generation: Generation,
    pub request: DownloadRequest,
    pub redirects: Vec<String>,
    pub was_user_initiated: bool,
    pub state: DownloadState,
    pub suggested_filename: Option<String>,
    pub mime_type: Option<String>,
    pub destination: Option<PathBuf>,
    pub total_received: u64,
    pub expected: Option<u64>,
    #[serde(default)]
    pub resume_data: Option<ResumeData>,
    pub error: Option<TransportError>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl DownloadSnapshot {
    /// URL the transfer ended up at after all redirects
    pub fn final_url(&self) -> &str {
        self.redirects.last().unwrap_or(&self.request.url)
    }

    pub fn progress(&self) -> f64 {
        match self.expected {
            Some(size) if size > 0 => (self.total_received as f64 / size as f64) * 100.0,
            _ => 0.0,
        }
    }
}

// ============================================================================
// Event Types
// ============================================================================

/// Events broadcast by the coordinator to observers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum DownloadEvent {
    Started {
        id: Uuid,
        generation: Generation,
        url: String,
    },
    Redirected {
        id: Uuid,
        url: String,
    },
    DestinationDecided {
        id: Uuid,
        destination: Option<PathBuf>,
    },
    Progress {
        id: Uuid,
        progress: ByteProgress,
    },
    Finished {
        download: DownloadSnapshot,
    },
    Failed {
        download: DownloadSnapshot,
        error: TransportError,
    },
}

impl DownloadEvent {
    pub fn download_id(&self) -> Uuid {
        match self {
            DownloadEvent::Started { id, .. }
            | DownloadEvent::Redirected { id, .. }
            | DownloadEvent::DestinationDecided { id, .. }
            | DownloadEvent::Progress { id, .. } => *id,
            DownloadEvent::Finished { download } | DownloadEvent::Failed { download, .. } => {
                download.id
            }
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DownloadEvent::Finished { .. } | DownloadEvent::Failed { .. }
        )
    }
}

// ============================================================================
// Settings Types
// ============================================================================

/// What to do when the delegate's challenge handler returns an error
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthFailurePolicy {
    #[default]
    PerformDefaultHandling,
    Cancel,
}

/// Coordinator settings; keys missing from a saved file take their defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// How long `cancel` waits for the engine to hand back resume data
    pub cancel_resume_data_timeout_ms: u64,
    pub auth_failure_policy: AuthFailurePolicy,
    pub event_channel_capacity: usize,
    /// Fallback destination directory when no delegate is registered
    pub download_directory: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cancel_resume_data_timeout_ms: 2000,
            auth_failure_policy: AuthFailurePolicy::default(),
            event_channel_capacity: 256,
            download_directory: dirs::download_dir().unwrap_or_else(|| PathBuf::from(".")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_settings_fill_in_defaults() {
        let settings: Settings =
            serde_json::from_str(r#"{ "cancel_resume_data_timeout_ms": 500 }"#).unwrap();
        assert_eq!(settings.cancel_resume_data_timeout_ms, 500);
        assert_eq!(settings.event_channel_capacity, 256);
        assert_eq!(settings.auth_failure_policy, AuthFailurePolicy::PerformDefaultHandling);
        assert_eq!(settings.download_directory, Settings::default().download_directory);
    }

    #[test]
    fn test_resume_data_rejects_empty() {
        assert!(ResumeData::new(Vec::new()).is_none());
        assert!(serde_json::from_str::<ResumeData>("[]").is_err());

        let data = ResumeData::new(vec![1, 2, 3]).unwrap();
        let json = serde_json::to_string(&data).unwrap();
        assert_eq!(json, "[1,2,3]");
        assert_eq!(serde_json::from_str::<ResumeData>(&json).unwrap(), data);
    }

    #[test]
    fn test_credential_only_with_use_credential() {
        let response = AuthenticationResponse::use_credential(Credential::new("u", "p"));
        assert_eq!(response.disposition(), AuthChallengeDisposition::UseCredential);
        assert!(response.credential().is_some());

        for response in [
            AuthenticationResponse::default_handling(),
            AuthenticationResponse::cancel(),
            AuthenticationResponse::reject_protection_space(),
        ] {
            assert!(response.credential().is_none());
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(DownloadState::Finished.is_terminal());
        assert!(DownloadState::Failed.is_terminal());
        assert!(DownloadState::Cancelled.is_terminal());
        assert!(!DownloadState::InProgress.is_terminal());
        assert!(!DownloadState::RedirectPending.is_terminal());
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let id = Uuid::new_v4();
        let event = DownloadEvent::Redirected {
            id,
            url: "https://example.com/file2.zip".to_string(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "Redirected");
        assert_eq!(value["payload"]["url"], "https://example.com/file2.zip");
        assert_eq!(event.download_id(), id);
        assert!(!event.is_terminal());
    }

    #[test]
    fn test_settings_defaults_fill_missing_policy() {
        let json = r#"{
            "cancel_resume_data_timeout_ms": 500,
            "event_channel_capacity": 16,
            "download_directory": "/tmp"
        }"#;
        let settings: Settings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.auth_failure_policy, AuthFailurePolicy::PerformDefaultHandling);
        assert_eq!(settings.cancel_resume_data_timeout_ms, 500);
    }
}
