//! CLI command implementations

use crate::output::{display_name, format_bytes, print_download_summary, truncate};
use crate::progress::{CliDelegate, DownloadProgress};
use crate::{ConfigAction, OutputFormat, ReplayOptions};
use anyhow::{anyhow, Context, Result};
use console::style;
use dlbridge_core::scripted::{DownloadScript, ScriptedEngine};
use dlbridge_core::{DlbridgeCore, DownloadHandle};
use dlbridge_types::{AuthFailurePolicy, Credential, DownloadEvent, DownloadSnapshot, Settings};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

// ============================================================================
// Download Commands
// ============================================================================

async fn load_script(path: &Path) -> Result<DownloadScript> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))
}

fn install_delegate(core: &DlbridgeCore, options: &ReplayOptions) {
    let credential = match (&options.user, &options.password) {
        (Some(user), Some(password)) => Some(Credential::new(user, password)),
        _ => None,
    };
    core.coordinator().set_delegate(Arc::new(CliDelegate {
        directory: options
            .dest
            .clone()
            .unwrap_or_else(|| core.settings().download_directory.clone()),
        decline_redirects: options.decline_redirects,
        credential,
    }));
}

pub async fn replay(
    core: &DlbridgeCore,
    engine: &ScriptedEngine,
    script_path: &Path,
    url: Option<String>,
    options: &ReplayOptions,
    format: OutputFormat,
) -> Result<()> {
    let script = load_script(script_path).await?;
    let request = match url {
        Some(url) => dlbridge_types::DownloadRequest::get(url),
        None => script
            .request
            .clone()
            .ok_or_else(|| anyhow!("Script has no request; pass --url"))?,
    };

    engine.push(script);
    install_delegate(core, options);

    let events = core.coordinator().subscribe();
    let handle = core.coordinator().start(request, None).await?;
    follow(core, handle, events, options, format).await
}

pub async fn retry(
    core: &DlbridgeCore,
    engine: &ScriptedEngine,
    id: &str,
    script_path: &Path,
    options: &ReplayOptions,
    format: OutputFormat,
) -> Result<()> {
    let uuid = Uuid::parse_str(id)?;
    let stored = core
        .store
        .load(uuid)
        .await?
        .ok_or_else(|| anyhow!("Download not found: {}", id))?;
    let script = load_script(script_path).await?;

    // The engine accepts the stored bytes; if there are none the request starts over
    if let Some(resume_data) = &stored.resume_data {
        engine.push_resume(resume_data.as_bytes().to_vec(), script.clone());
    }
    engine.push(script);
    install_delegate(core, options);

    let events = core.coordinator().subscribe();
    let handle = core.retry(uuid).await?;
    follow(core, handle, events, options, format).await
}

/// Show events of `handle` until it is terminal, then store the outcome
async fn follow(
    core: &DlbridgeCore,
    handle: DownloadHandle,
    mut events: broadcast::Receiver<DownloadEvent>,
    options: &ReplayOptions,
    format: OutputFormat,
) -> Result<()> {
    let progress = match format {
        OutputFormat::Json => DownloadProgress::hidden(),
        _ => DownloadProgress::new(&handle.original_request().url),
    };

    let canceller = options.cancel_after.map(|ms| {
        let coordinator = core.coordinator().clone();
        let handle = handle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            coordinator.cancel(&handle).await
        })
    });

    let download = loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!("Skipped {} download events", n);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => {
                return Err(anyhow!("Event stream closed before the download ended"))
            }
        };
        if event.download_id() != handle.id() {
            continue;
        }

        progress.handle_event(&event);
        if let DownloadEvent::Finished { download } | DownloadEvent::Failed { download, .. } = &event {
            core.record(&event).await?;
            break download.clone();
        }
    };

    if let Some(canceller) = canceller {
        canceller.abort();
    }

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&download)?),
        OutputFormat::Human | OutputFormat::Table => {
            println!();
            print_download_summary(&download, true);
            if download.resume_data.is_some() {
                println!(
                    "  Retry with: dlbridge retry {} <script>",
                    style(download.id).cyan()
                );
            }
        }
    }

    Ok(())
}

// ============================================================================
// History Commands
// ============================================================================

pub async fn history(
    core: &DlbridgeCore,
    state_filter: Option<String>,
    show_all: bool,
    format: OutputFormat,
) -> Result<()> {
    let downloads = core.history().await?;

    let filtered: Vec<DownloadSnapshot> = downloads
        .into_iter()
        .filter(|d| match &state_filter {
            Some(state) => d
                .state
                .to_string()
                .to_lowercase()
                .contains(&state.to_lowercase()),
            None => true,
        })
        .collect();

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&filtered)?);
        }
        OutputFormat::Table => {
            use tabled::{Table, Tabled};

            #[derive(Tabled)]
            struct DownloadRow {
                id: String,
                name: String,
                api: String,
                redirects: usize,
                size: String,
                state: String,
            }

            let rows: Vec<DownloadRow> = filtered
                .iter()
                .map(|d| DownloadRow {
                    id: d.id.to_string()[..8].to_string(),
                    name: truncate(&display_name(d), 30),
                    api: d.generation.to_string(),
                    redirects: d.redirects.len(),
                    size: format_bytes(d.total_received),
                    state: d.state.to_string(),
                })
                .collect();

            println!("{}", Table::new(rows));
        }
        OutputFormat::Human => {
            if filtered.is_empty() {
                println!("{}", style("No downloads found").dim());
                return Ok(());
            }

            for download in &filtered {
                print_download_summary(download, show_all);
            }
            println!();
            println!("{} download(s) total", style(filtered.len()).bold());
        }
    }

    Ok(())
}

pub async fn show(core: &DlbridgeCore, id: &str, format: OutputFormat) -> Result<()> {
    let uuid = Uuid::parse_str(id)?;
    let download = core
        .store
        .load(uuid)
        .await?
        .ok_or_else(|| anyhow!("Download not found: {}", id))?;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&download)?);
        }
        _ => {
            print_download_summary(&download, true);
        }
    }

    Ok(())
}

pub async fn forget(core: &DlbridgeCore, id: &str, _format: OutputFormat) -> Result<()> {
    let uuid = Uuid::parse_str(id)?;
    core.forget(uuid).await?;
    println!("{} Download forgotten", style("✓").green().bold());
    Ok(())
}

// ============================================================================
// Config Commands
// ============================================================================

fn config_value(settings: &Settings, key: &str) -> Result<String> {
    Ok(match key {
        "cancel_resume_data_timeout_ms" => settings.cancel_resume_data_timeout_ms.to_string(),
        "auth_failure_policy" => match settings.auth_failure_policy {
            AuthFailurePolicy::PerformDefaultHandling => "perform_default_handling".to_string(),
            AuthFailurePolicy::Cancel => "cancel".to_string(),
        },
        "event_channel_capacity" => settings.event_channel_capacity.to_string(),
        "download_directory" => settings.download_directory.display().to_string(),
        _ => return Err(anyhow!("Unknown config key: {}", key)),
    })
}

fn set_config_value(settings: &mut Settings, key: &str, value: &str) -> Result<()> {
    match key {
        "cancel_resume_data_timeout_ms" => settings.cancel_resume_data_timeout_ms = value.parse()?,
        "auth_failure_policy" => {
            settings.auth_failure_policy = match value {
                "perform_default_handling" | "default" => AuthFailurePolicy::PerformDefaultHandling,
                "cancel" => AuthFailurePolicy::Cancel,
                _ => return Err(anyhow!("Unknown auth failure policy: {}", value)),
            }
        }
        "event_channel_capacity" => {
            let capacity: usize = value.parse()?;
            if capacity == 0 {
                return Err(anyhow!("event_channel_capacity must be at least 1"));
            }
            settings.event_channel_capacity = capacity;
        }
        "download_directory" => settings.download_directory = PathBuf::from(value),
        _ => return Err(anyhow!("Unknown config key: {}", key)),
    }
    Ok(())
}

pub async fn config_action(
    core: &DlbridgeCore,
    action: Option<ConfigAction>,
    format: OutputFormat,
) -> Result<()> {
    match action {
        None | Some(ConfigAction::Show) => {
            let settings = core.storage.load_settings().await?;

            match format {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&settings)?);
                }
                _ => {
                    println!("dlbridge Configuration:");
                    println!();
                    println!(
                        "  Download directory: {}",
                        settings.download_directory.display()
                    );
                    println!(
                        "  Cancel resume data timeout: {} ms",
                        settings.cancel_resume_data_timeout_ms
                    );
                    println!("  Auth failure policy: {}", config_value(&settings, "auth_failure_policy")?);
                    println!("  Event channel capacity: {}", settings.event_channel_capacity);
                    println!("  Data directory: {}", core.storage.data_dir().display());
                }
            }
        }

        Some(ConfigAction::Get { key }) => {
            let settings = core.storage.load_settings().await?;
            println!("{}", config_value(&settings, &key)?);
        }

        Some(ConfigAction::Set { key, value }) => {
            let mut settings = core.storage.load_settings().await?;
            set_config_value(&mut settings, &key, &value)?;
            core.storage.save_settings(&settings).await?;
            println!("{} Config updated", style("✓").green().bold());
        }

        Some(ConfigAction::Reset { yes }) => {
            use dialoguer::Confirm;

            let confirmed = yes
                || Confirm::new()
                    .with_prompt("Reset all settings to defaults?")
                    .default(false)
                    .interact()?;

            if confirmed {
                core.storage.reset_settings().await?;
                println!("{} Settings reset to defaults", style("✓").green().bold());
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_keys_round_trip_through_strings() {
        let mut settings = Settings::default();
        set_config_value(&mut settings, "auth_failure_policy", "cancel").unwrap();
        set_config_value(&mut settings, "cancel_resume_data_timeout_ms", "750").unwrap();

        assert_eq!(config_value(&settings, "auth_failure_policy").unwrap(), "cancel");
        assert_eq!(config_value(&settings, "cancel_resume_data_timeout_ms").unwrap(), "750");
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut settings = Settings::default();
        assert!(set_config_value(&mut settings, "event_channel_capacity", "0").is_err());
        assert!(set_config_value(&mut settings, "theme", "dark").is_err());
        assert!(config_value(&settings, "theme").is_err());
    }
}
