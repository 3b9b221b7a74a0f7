//! Canonical download delegate
//!
//! One interface for both engine generations. Only `decide_destination` is
//! required; every other callback defaults to the engine's own behavior.

use crate::engine::DownloadHandle;
use async_trait::async_trait;
use dlbridge_types::{
    AuthenticationChallenge, AuthenticationResponse, ByteProgress, DownloadResponse, Redirect,
    RedirectDecision, ResumeData, TransportError,
};
use std::path::PathBuf;

#[async_trait]
pub trait DownloadDelegate: Send + Sync {
    /// Choose where the file goes; `None` cancels the download
    async fn decide_destination(
        &self,
        download: &DownloadHandle,
        response: &DownloadResponse,
        suggested_filename: &str,
    ) -> Option<PathBuf>;

    /// Called for every redirect. The returned decision is only applied when
    /// `redirect.decision_required` is set.
    async fn will_redirect(&self, _download: &DownloadHandle, _redirect: &Redirect) -> RedirectDecision {
        RedirectDecision::Allow
    }

    /// Errors are resolved through the configured `AuthFailurePolicy`
    async fn did_receive_authentication_challenge(
        &self,
        _download: &DownloadHandle,
        _challenge: &AuthenticationChallenge,
    ) -> anyhow::Result<AuthenticationResponse> {
        Ok(AuthenticationResponse::default_handling())
    }

    async fn did_receive_bytes(&self, _download: &DownloadHandle, _progress: ByteProgress) {}

    async fn did_finish(&self, _download: &DownloadHandle) {}

    async fn did_fail(
        &self,
        _download: &DownloadHandle,
        _error: &TransportError,
        _resume_data: Option<&ResumeData>,
    ) {
    }
}
