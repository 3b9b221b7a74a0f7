//! Output formatting utilities

use console::{style, StyledObject};
use dlbridge_types::{DownloadSnapshot, DownloadState};

/// Format bytes as human-readable
pub fn format_bytes(bytes: u64) -> String {
    human_bytes::human_bytes(bytes as f64)
}

pub fn state_icon(state: DownloadState) -> StyledObject<&'static str> {
    match state {
        DownloadState::Finished => style("✓").green(),
        DownloadState::InProgress => style("↓").cyan(),
        DownloadState::Failed => style("✗").red(),
        DownloadState::Cancelled => style("○").dim(),
        _ => style("·").dim(),
    }
}

/// Display name of a download: the file name it was saved as, else its URL
pub fn display_name(download: &DownloadSnapshot) -> String {
    download
        .destination
        .as_ref()
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().to_string())
        .or_else(|| download.suggested_filename.clone())
        .unwrap_or_else(|| download.request.url.clone())
}

/// Shorten to `max` characters, keeping the start
pub fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        let head: String = text.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", head)
    } else {
        text.to_string()
    }
}

pub fn print_download_summary(download: &DownloadSnapshot, detailed: bool) {
    let size = match download.expected {
        Some(total) => format!("{} / {}", format_bytes(download.total_received), format_bytes(total)),
        None => format_bytes(download.total_received),
    };

    println!(
        "{} {} {} [{}]",
        state_icon(download.state),
        style(display_name(download)).bold(),
        style(&size).dim(),
        style(download.state).dim()
    );

    if detailed {
        println!("    ID: {}", download.id);
        println!("    API: {}", download.generation);
        println!("    URL: {}", download.request.url);
        for (i, url) in download.redirects.iter().enumerate() {
            println!("    Redirect {}: {}", i + 1, url);
        }
        if let Some(ref destination) = download.destination {
            println!("    Saved to: {}", destination.display());
        }
        if let Some(ref mime_type) = download.mime_type {
            println!("    Type: {}", mime_type);
        }
        if let Some(ref resume_data) = download.resume_data {
            println!("    Resumable: {} of resume data", format_bytes(resume_data.len() as u64));
        }
        if let Some(ref error) = download.error {
            println!("    Error: {}", style(error).red());
        }
        println!();
    }
}
