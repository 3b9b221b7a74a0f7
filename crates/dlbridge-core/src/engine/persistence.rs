//! SQLite-based persistence for download records
//!
//! Stores download snapshots and their redirect history so a caller can list
//! past downloads and retry them from stored resume data. Resume data is kept
//! as a BLOB, byte for byte.

use crate::error::{DownloadError, Result};
use chrono::{DateTime, Utc};
use dlbridge_types::{
    DownloadRequest, DownloadSnapshot, DownloadState, Generation, ResumeData, TransportError,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqliteRow};
use sqlx::Row;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Database connection pool for download records
#[derive(Clone, Debug)]
pub struct DownloadStore {
    pool: SqlitePool,
}

impl DownloadStore {
    /// Open (or create) the database at `db_path`
    pub async fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path = db_path.as_ref();

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePool::connect_with(options).await?;
        Self::migrate(&pool).await?;

        Ok(Self { pool })
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS downloads (
                id TEXT PRIMARY KEY,
                generation TEXT NOT NULL,
                method TEXT NOT NULL,
                url TEXT NOT NULL,
                headers TEXT NOT NULL,
                request_destination TEXT,
                was_user_initiated INTEGER NOT NULL,
                state TEXT NOT NULL,
                suggested_filename TEXT,
                mime_type TEXT,
                destination TEXT,
                total_received INTEGER NOT NULL DEFAULT 0,
                expected INTEGER,
                resume_data BLOB,
                error TEXT,
                created_at TEXT NOT NULL,
                finished_at TEXT
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS redirects (
                download_id TEXT NOT NULL,
                position INTEGER NOT NULL,
                url TEXT NOT NULL,
                PRIMARY KEY (download_id, position),
                FOREIGN KEY (download_id) REFERENCES downloads(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_downloads_state ON downloads(state)")
            .execute(pool)
            .await?;

        Ok(())
    }

    /// Save or update a download record
    pub async fn upsert(&self, download: &DownloadSnapshot) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let id = download.id.to_string();

        sqlx::query(
            r#"
            INSERT INTO downloads (
                id, generation, method, url, headers, request_destination,
                was_user_initiated, state, suggested_filename, mime_type, destination,
                total_received, expected, resume_data, error, created_at, finished_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                state = excluded.state,
                suggested_filename = excluded.suggested_filename,
                mime_type = excluded.mime_type,
                destination = excluded.destination,
                total_received = excluded.total_received,
                expected = excluded.expected,
                resume_data = COALESCE(excluded.resume_data, downloads.resume_data),
                error = excluded.error,
                finished_at = excluded.finished_at
            "#,
        )
        .bind(&id)
        .bind(generation_name(download.generation))
        .bind(&download.request.method)
        .bind(&download.request.url)
        .bind(serde_json::to_string(&download.request.headers)?)
        .bind(download.request.destination.as_deref().map(path_string))
        .bind(download.was_user_initiated as i64)
        .bind(state_name(download.state))
        .bind(download.suggested_filename.as_deref())
        .bind(download.mime_type.as_deref())
        .bind(download.destination.as_deref().map(path_string))
        .bind(download.total_received as i64)
        .bind(download.expected.map(|e| e as i64))
        .bind(download.resume_data.as_ref().map(|d| d.as_bytes().to_vec()))
        .bind(download.error.as_ref().map(serde_json::to_string).transpose()?)
        .bind(download.created_at.to_rfc3339())
        .bind(download.finished_at.map(|d| d.to_rfc3339()))
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM redirects WHERE download_id = ?")
            .bind(&id)
            .execute(&mut *tx)
            .await?;

        for (position, url) in download.redirects.iter().enumerate() {
            sqlx::query("INSERT INTO redirects (download_id, position, url) VALUES (?, ?, ?)")
                .bind(&id)
                .bind(position as i64)
                .bind(url)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Load a download record by ID
    pub async fn load(&self, id: Uuid) -> Result<Option<DownloadSnapshot>> {
        let row = sqlx::query("SELECT * FROM downloads WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let redirects = sqlx::query("SELECT url FROM redirects WHERE download_id = ? ORDER BY position")
            .bind(id.to_string())
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(|r| r.get::<String, _>("url"))
            .collect();

        Ok(Some(row_to_snapshot(row, redirects)?))
    }

    /// Load all download records, newest first
    pub async fn load_all(&self) -> Result<Vec<DownloadSnapshot>> {
        let rows = sqlx::query("SELECT * FROM downloads ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await?;

        let redirect_rows = sqlx::query("SELECT * FROM redirects ORDER BY download_id, position")
            .fetch_all(&self.pool)
            .await?;

        let mut redirects: HashMap<String, Vec<String>> = HashMap::new();
        for row in redirect_rows {
            redirects
                .entry(row.get("download_id"))
                .or_default()
                .push(row.get("url"));
        }

        let mut downloads = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.get("id");
            let history = redirects.remove(&id).unwrap_or_default();
            downloads.push(row_to_snapshot(row, history)?);
        }

        Ok(downloads)
    }

    /// Stored resume data of a download, if any
    pub async fn resume_data(&self, id: Uuid) -> Result<Option<ResumeData>> {
        let row = sqlx::query("SELECT resume_data FROM downloads WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        Ok(row
            .and_then(|r| r.get::<Option<Vec<u8>>, _>("resume_data"))
            .and_then(ResumeData::new))
    }

    /// Delete a download record and its redirect history
    pub async fn remove(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM downloads WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

fn generation_name(generation: Generation) -> &'static str {
    match generation {
        Generation::Legacy => "legacy",
        Generation::Modern => "modern",
    }
}

fn state_name(state: DownloadState) -> &'static str {
    match state {
        DownloadState::Created => "created",
        DownloadState::Requested => "requested",
        DownloadState::RedirectPending => "redirect_pending",
        DownloadState::Authenticating => "authenticating",
        DownloadState::InProgress => "in_progress",
        DownloadState::Finished => "finished",
        DownloadState::Failed => "failed",
        DownloadState::Cancelled => "cancelled",
    }
}

fn parse_state(s: &str) -> Result<DownloadState> {
    Ok(match s {
        "created" => DownloadState::Created,
        "requested" => DownloadState::Requested,
        "redirect_pending" => DownloadState::RedirectPending,
        "authenticating" => DownloadState::Authenticating,
        "in_progress" => DownloadState::InProgress,
        "finished" => DownloadState::Finished,
        "failed" => DownloadState::Failed,
        "cancelled" => DownloadState::Cancelled,
        other => return Err(DownloadError::CorruptRecord(format!("unknown state {}", other))),
    })
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DownloadError::CorruptRecord(e.to_string()))
}

/// Convert a database row to a snapshot
fn row_to_snapshot(row: SqliteRow, redirects: Vec<String>) -> Result<DownloadSnapshot> {
    let generation = match row.get::<String, _>("generation").as_str() {
        "legacy" => Generation::Legacy,
        "modern" => Generation::Modern,
        other => {
            return Err(DownloadError::CorruptRecord(format!(
                "unknown generation {}",
                other
            )))
        }
    };

    let headers: Vec<(String, String)> = serde_json::from_str(&row.get::<String, _>("headers"))?;
    let error: Option<TransportError> = row
        .get::<Option<String>, _>("error")
        .map(|e| serde_json::from_str(&e))
        .transpose()?;

    Ok(DownloadSnapshot {
        id: Uuid::parse_str(&row.get::<String, _>("id"))
            .map_err(|e| DownloadError::CorruptRecord(e.to_string()))?,
        generation,
        request: DownloadRequest {
            method: row.get("method"),
            url: row.get("url"),
            headers,
            destination: row
                .get::<Option<String>, _>("request_destination")
                .map(PathBuf::from),
        },
        redirects,
        was_user_initiated: row.get::<i64, _>("was_user_initiated") != 0,
        state: parse_state(&row.get::<String, _>("state"))?,
        suggested_filename: row.get("suggested_filename"),
        mime_type: row.get("mime_type"),
        destination: row.get::<Option<String>, _>("destination").map(PathBuf::from),
        total_received: row.get::<i64, _>("total_received") as u64,
        expected: row.get::<Option<i64>, _>("expected").map(|e| e as u64),
        resume_data: row
            .get::<Option<Vec<u8>>, _>("resume_data")
            .and_then(ResumeData::new),
        error,
        created_at: parse_time(&row.get::<String, _>("created_at"))?,
        finished_at: row
            .get::<Option<String>, _>("finished_at")
            .map(|s| parse_time(&s))
            .transpose()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use dlbridge_types::TransportErrorKind;

    fn snapshot() -> DownloadSnapshot {
        DownloadSnapshot {
            id: Uuid::new_v4(),
            generation: Generation::Modern,
            request: DownloadRequest::get("https://example.com/file.zip").with_header("Accept", "*/*"),
            redirects: vec![
                "https://example.com/a".to_string(),
                "https://example.com/a".to_string(),
                "https://example.com/file2.zip".to_string(),
            ],
            was_user_initiated: true,
            state: DownloadState::Failed,
            suggested_filename: Some("file2.zip".to_string()),
            mime_type: Some("application/zip".to_string()),
            destination: Some(PathBuf::from("/tmp/file2.zip")),
            total_received: 1024,
            expected: Some(4096),
            resume_data: ResumeData::new(vec![0, 1, 2, 255]),
            error: Some(TransportError::new(TransportErrorKind::Network, "connection reset").with_code(-1005)),
            created_at: Utc::now(),
            finished_at: Some(Utc::now()),
        }
    }

    async fn open_store() -> (tempfile::TempDir, DownloadStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = DownloadStore::new(dir.path().join("downloads.db")).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_snapshot_survives_storage() {
        let (_dir, store) = open_store().await;
        let download = snapshot();
        store.upsert(&download).await.unwrap();

        let loaded = store.load(download.id).await.unwrap().unwrap();
        assert_eq!(loaded.redirects, download.redirects);
        assert_eq!(loaded.request, download.request);
        assert_eq!(loaded.resume_data, download.resume_data);
        assert_eq!(loaded.error, download.error);
        assert_eq!(loaded.state, DownloadState::Failed);
        assert_eq!(loaded.expected, Some(4096));
    }

    #[tokio::test]
    async fn test_upsert_keeps_resume_data_when_new_snapshot_has_none() {
        let (_dir, store) = open_store().await;
        let mut download = snapshot();
        store.upsert(&download).await.unwrap();

        download.resume_data = None;
        download.state = DownloadState::Cancelled;
        store.upsert(&download).await.unwrap();

        let stored = store.resume_data(download.id).await.unwrap().unwrap();
        assert_eq!(stored.as_bytes(), &[0, 1, 2, 255]);
        let loaded = store.load(download.id).await.unwrap().unwrap();
        assert_eq!(loaded.state, DownloadState::Cancelled);
    }

    #[tokio::test]
    async fn test_remove() {
        let (_dir, store) = open_store().await;
        let download = snapshot();
        tokio_test::assert_ok!(store.upsert(&download).await);
        assert_eq!(store.load_all().await.unwrap().len(), 1);

        assert!(store.remove(download.id).await.unwrap());
        assert!(!store.remove(download.id).await.unwrap());
        assert!(store.load(download.id).await.unwrap().is_none());
        assert!(store.load_all().await.unwrap().is_empty());
    }
}
