//! Storage layer for the data directory (settings JSON and the download database)

use crate::error::Result;
use dlbridge_types::Settings;
use std::path::{Path, PathBuf};
use tokio::fs;

const SETTINGS_FILE: &str = "settings.json";
const DATABASE_FILE: &str = "downloads.db";

/// Storage manager for dlbridge data
#[derive(Clone, Debug)]
pub struct Storage {
    data_dir: PathBuf,
}

impl Storage {
    /// Create a new storage instance, creating the data directory if needed
    pub async fn new(data_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&data_dir).await?;
        Ok(Self { data_dir })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Location of the SQLite download database
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(DATABASE_FILE)
    }

    // ========================================================================
    // Settings
    // ========================================================================

    /// Load settings, falling back to defaults when none were saved
    pub async fn load_settings(&self) -> Result<Settings> {
        let path = self.data_dir.join(SETTINGS_FILE);
        if !path.exists() {
            return Ok(Settings::default());
        }

        let content = fs::read_to_string(&path).await?;
        Ok(serde_json::from_str(&content)?)
    }

    pub async fn save_settings(&self, settings: &Settings) -> Result<()> {
        let content = serde_json::to_string_pretty(settings)?;
        fs::write(self.data_dir.join(SETTINGS_FILE), content).await?;
        Ok(())
    }

    /// Remove saved settings so defaults apply again
    pub async fn reset_settings(&self) -> Result<()> {
        let path = self.data_dir.join(SETTINGS_FILE);
        if path.exists() {
            fs::remove_file(&path).await?;
        }
        Ok(())
    }
}

/// Platform data directory for dlbridge
pub fn default_data_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "dlbridge")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".dlbridge"))
}
