//! Progress display and the delegate answering engine questions for the CLI

use async_trait::async_trait;
use console::style;
use dlbridge_core::{DownloadDelegate, DownloadHandle};
use dlbridge_types::{
    AuthenticationChallenge, AuthenticationResponse, Credential, DownloadEvent, DownloadResponse,
    DownloadState, Redirect, RedirectDecision,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;

/// Progress bar of a single download, driven by coordinator events
pub struct DownloadProgress {
    pb: ProgressBar,
}

impl DownloadProgress {
    pub fn new(url: &str) -> Self {
        let pb = ProgressBar::new(0);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}) {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("█▓▒░  "),
        );
        pb.set_message(url.to_string());
        Self { pb }
    }

    /// A bar that draws nothing, for machine-readable output
    pub fn hidden() -> Self {
        Self {
            pb: ProgressBar::hidden(),
        }
    }

    pub fn handle_event(&self, event: &DownloadEvent) {
        match event {
            DownloadEvent::Started { generation, .. } => {
                self.pb
                    .println(format!("{} {} download started", style("↓").cyan(), generation));
            }

            DownloadEvent::Redirected { url, .. } => {
                self.pb.println(format!("{} redirected to {}", style("↪").yellow(), url));
                self.pb.set_message(url.clone());
            }

            DownloadEvent::DestinationDecided { destination, .. } => match destination {
                Some(path) => self.pb.println(format!("  saving to {}", path.display())),
                None => self.pb.println(format!("  {}", style("no destination chosen").dim())),
            },

            DownloadEvent::Progress { progress, .. } => {
                if let Some(total) = progress.expected {
                    self.pb.set_length(total);
                }
                self.pb.set_position(progress.total_received);
            }

            DownloadEvent::Finished { .. } => {
                self.pb.finish_with_message(format!(
                    "{} Download complete",
                    style("✓").green().bold()
                ));
            }

            DownloadEvent::Failed { download, error } => {
                if download.state == DownloadState::Cancelled {
                    self.pb
                        .abandon_with_message(format!("{} Cancelled", style("○").dim()));
                } else {
                    self.pb.abandon_with_message(format!(
                        "{} Failed: {}",
                        style("✗").red().bold(),
                        error
                    ));
                }
            }
        }
    }
}

/// Answers the coordinator's questions from command-line options
pub struct CliDelegate {
    pub directory: PathBuf,
    pub decline_redirects: bool,
    pub credential: Option<Credential>,
}

#[async_trait]
impl DownloadDelegate for CliDelegate {
    async fn decide_destination(
        &self,
        _download: &DownloadHandle,
        _response: &DownloadResponse,
        suggested_filename: &str,
    ) -> Option<PathBuf> {
        Some(self.directory.join(suggested_filename))
    }

    async fn will_redirect(&self, _download: &DownloadHandle, redirect: &Redirect) -> RedirectDecision {
        if self.decline_redirects && redirect.decision_required {
            RedirectDecision::Cancel
        } else {
            RedirectDecision::Allow
        }
    }

    async fn did_receive_authentication_challenge(
        &self,
        _download: &DownloadHandle,
        challenge: &AuthenticationChallenge,
    ) -> anyhow::Result<AuthenticationResponse> {
        match &self.credential {
            // give up after a rejected credential instead of looping
            Some(_) if challenge.previous_failure_count > 0 => Ok(AuthenticationResponse::cancel()),
            Some(credential) => Ok(AuthenticationResponse::use_credential(credential.clone())),
            None => Ok(AuthenticationResponse::default_handling()),
        }
    }
}
