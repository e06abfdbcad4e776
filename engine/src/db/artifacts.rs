/// Artifact persistence operations
///
/// Artifacts are written once and never updated. Expiry is stored as an
/// absolute millisecond timestamp; a NULL expiry never expires.
use anyhow::{Context, Result};
use sdk::types::ArtifactKind;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};

/// Artifact metadata row (bytes are fetched separately)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub id: String,
    pub kind: ArtifactKind,
    pub mime: String,
    pub filename: String,
    pub size_bytes: i64,
    pub sha256: String,
    pub created_at: i64,
    pub expires_at: Option<i64>,
}

impl ArtifactRecord {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at.is_some_and(|at| at <= now_ms)
    }
}

/// Artifact repository for database operations
pub struct ArtifactRepository {
    pool: SqlitePool,
}

impl ArtifactRepository {
    /// Create a new artifact repository
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a new artifact with its bytes
    pub async fn insert(&self, record: &ArtifactRecord, bytes: &[u8]) -> Result<()> {
        sqlx::query(
            "INSERT INTO artifacts (id, kind, mime, filename, size_bytes, sha256, bytes, created_at, expires_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.id)
        .bind(record.kind.as_str())
        .bind(&record.mime)
        .bind(&record.filename)
        .bind(record.size_bytes)
        .bind(&record.sha256)
        .bind(bytes)
        .bind(record.created_at)
        .bind(record.expires_at)
        .execute(&self.pool)
        .await
        .context("Failed to insert artifact")?;

        Ok(())
    }

    /// Fetch metadata and bytes for an artifact
    pub async fn fetch(&self, id: &str) -> Result<Option<(ArtifactRecord, Vec<u8>)>> {
        let row = sqlx::query(
            "SELECT id, kind, mime, filename, size_bytes, sha256, bytes, created_at, expires_at
             FROM artifacts WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch artifact")?;

        match row {
            Some(row) => {
                let bytes: Vec<u8> = row.get("bytes");
                Ok(Some((record_from_row(&row)?, bytes)))
            }
            None => Ok(None),
        }
    }

    /// List artifact metadata, newest first
    pub async fn list(&self, limit: i64) -> Result<Vec<ArtifactRecord>> {
        let rows = sqlx::query(
            "SELECT id, kind, mime, filename, size_bytes, sha256, created_at, expires_at
             FROM artifacts ORDER BY created_at DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list artifacts")?;

        rows.iter().map(record_from_row).collect()
    }

    /// Delete an artifact. Returns whether a row was removed.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM artifacts WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to delete artifact")?;

        Ok(result.rows_affected() > 0)
    }

    /// Delete every artifact whose expiry is at or before `now_ms`
    pub async fn purge_expired(&self, now_ms: i64) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM artifacts WHERE expires_at IS NOT NULL AND expires_at <= ?")
                .bind(now_ms)
                .execute(&self.pool)
                .await
                .context("Failed to purge expired artifacts")?;

        Ok(result.rows_affected())
    }
}

fn record_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<ArtifactRecord> {
    let kind: String = row.get("kind");
    let kind = ArtifactKind::parse(&kind)
        .with_context(|| format!("Unknown artifact kind in database: {}", kind))?;

    Ok(ArtifactRecord {
        id: row.get("id"),
        kind,
        mime: row.get("mime"),
        filename: row.get("filename"),
        size_bytes: row.get("size_bytes"),
        sha256: row.get("sha256"),
        created_at: row.get("created_at"),
        expires_at: row.get("expires_at"),
    })
}
