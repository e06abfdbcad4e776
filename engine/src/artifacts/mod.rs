//! Artifact Manager
//!
//! Sole owner of generated files. A file-producing step hands its bytes to
//! [`ArtifactManager::store`] and keeps only the returned reference; the bytes
//! never travel in a conversational response. Stored artifacts are never
//! mutated. Retrieval of an absent or expired artifact fails with
//! [`EngineError::ArtifactNotFound`].

use crate::db::{ArtifactRecord, ArtifactRepository};
use chrono::{DateTime, TimeZone, Utc};
use sdk::errors::EngineError;
use sdk::types::{ArtifactKind, ArtifactRef};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::{debug, info};

/// Path prefix of the external retrieval endpoint
pub const DOWNLOAD_PREFIX: &str = "/artifacts";

/// Stored artifact metadata
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Artifact {
    pub id: String,
    pub kind: ArtifactKind,
    pub mime: String,
    pub filename: String,
    pub size_bytes: u64,
    pub sha256: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Artifact {
    /// Retrieval handle exposed to callers
    pub fn download_url(&self) -> String {
        format!("{}/{}", DOWNLOAD_PREFIX, self.id)
    }

    pub fn to_ref(&self) -> ArtifactRef {
        ArtifactRef {
            artifact_id: self.id.clone(),
            kind: self.kind,
            mime: self.mime.clone(),
            filename: self.filename.clone(),
            size_bytes: self.size_bytes,
            download_url: self.download_url(),
        }
    }

    fn from_record(record: ArtifactRecord) -> Self {
        Self {
            id: record.id,
            kind: record.kind,
            mime: record.mime,
            filename: record.filename,
            size_bytes: record.size_bytes.max(0) as u64,
            sha256: record.sha256,
            created_at: millis_to_datetime(record.created_at),
            expires_at: record.expires_at.map(millis_to_datetime),
        }
    }
}

/// Durable artifact storage backed by the engine database
pub struct ArtifactManager {
    repo: ArtifactRepository,
    ttl: Option<Duration>,
}

impl ArtifactManager {
    /// `ttl` of `None` keeps artifacts until deleted
    pub fn new(repo: ArtifactRepository, ttl: Option<Duration>) -> Self {
        Self { repo, ttl }
    }

    /// Build from the `[artifacts] ttl_secs` setting (0 disables expiry)
    pub fn with_ttl_secs(repo: ArtifactRepository, ttl_secs: u64) -> Self {
        let ttl = (ttl_secs > 0).then(|| Duration::from_secs(ttl_secs));
        Self::new(repo, ttl)
    }

    /// Persist `bytes` as a new artifact
    pub async fn store(
        &self,
        bytes: &[u8],
        mime: &str,
        kind: ArtifactKind,
        filename: &str,
    ) -> Result<Artifact, EngineError> {
        let now = Utc::now().timestamp_millis();
        let expires_at = self
            .ttl
            .map(|ttl| now.saturating_add(ttl.as_millis().min(i64::MAX as u128) as i64));

        let record = ArtifactRecord {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            mime: mime.to_string(),
            filename: filename.to_string(),
            size_bytes: bytes.len() as i64,
            sha256: hex::encode(Sha256::digest(bytes)),
            created_at: now,
            expires_at,
        };

        self.repo
            .insert(&record, bytes)
            .await
            .map_err(|e| EngineError::Database(e.to_string()))?;

        info!(
            "Stored artifact {} ({}, {} bytes)",
            record.id,
            kind.as_str(),
            bytes.len()
        );

        Ok(Artifact::from_record(record))
    }

    /// Bytes of a live artifact
    pub async fn retrieve(&self, id: &str) -> Result<Vec<u8>, EngineError> {
        self.fetch(id).await.map(|(_, bytes)| bytes)
    }

    /// Metadata and bytes of a live artifact
    pub async fn fetch(&self, id: &str) -> Result<(Artifact, Vec<u8>), EngineError> {
        let (record, bytes) = self
            .repo
            .fetch(id)
            .await
            .map_err(|e| EngineError::Database(e.to_string()))?
            .ok_or_else(|| EngineError::ArtifactNotFound(id.to_string()))?;

        if record.is_expired(Utc::now().timestamp_millis()) {
            debug!("Artifact {} requested after expiry", id);
            return Err(EngineError::ArtifactNotFound(id.to_string()));
        }

        Ok((Artifact::from_record(record), bytes))
    }

    /// Live artifacts, newest first
    pub async fn list(&self, limit: usize) -> Result<Vec<Artifact>, EngineError> {
        let now = Utc::now().timestamp_millis();
        let records = self
            .repo
            .list(limit as i64)
            .await
            .map_err(|e| EngineError::Database(e.to_string()))?;

        Ok(records
            .into_iter()
            .filter(|r| !r.is_expired(now))
            .map(Artifact::from_record)
            .collect())
    }

    /// Remove an artifact
    pub async fn delete(&self, id: &str) -> Result<(), EngineError> {
        let removed = self
            .repo
            .delete(id)
            .await
            .map_err(|e| EngineError::Database(e.to_string()))?;

        if removed {
            info!("Deleted artifact {}", id);
            Ok(())
        } else {
            Err(EngineError::ArtifactNotFound(id.to_string()))
        }
    }

    /// Drop expired artifacts. Returns how many were removed.
    pub async fn purge_expired(&self) -> Result<u64, EngineError> {
        let removed = self
            .repo
            .purge_expired(Utc::now().timestamp_millis())
            .await
            .map_err(|e| EngineError::Database(e.to_string()))?;

        if removed > 0 {
            info!("Purged {} expired artifacts", removed);
        }
        Ok(removed)
    }
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use sdk::errors::{CrmflowErrorExt, ErrorKind};
    use tempfile::TempDir;

    async fn manager(ttl: Option<Duration>) -> (TempDir, ArtifactManager) {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::new(&temp_dir.path().join("test.db")).await.unwrap();
        (temp_dir, ArtifactManager::new(db.artifacts(), ttl))
    }

    #[tokio::test]
    async fn test_store_then_retrieve_byte_for_byte() {
        let (_dir, manager) = manager(None).await;
        let bytes: Vec<u8> = (0..=255).collect();

        let artifact = manager
            .store(&bytes, "image/png", ArtifactKind::ChartImage, "chart.png")
            .await
            .unwrap();

        assert_eq!(artifact.size_bytes, 256);
        assert_eq!(artifact.download_url(), format!("/artifacts/{}", artifact.id));
        assert_eq!(manager.retrieve(&artifact.id).await.unwrap(), bytes);
    }

    #[tokio::test]
    async fn test_retrieve_unknown_is_not_found() {
        let (_dir, manager) = manager(None).await;
        let err = manager.retrieve("nope").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_expired_artifact_is_not_found() {
        let (_dir, manager) = manager(Some(Duration::from_millis(1))).await;
        let artifact = manager
            .store(b"a,b\n", "text/csv", ArtifactKind::TableExport, "x.csv")
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(matches!(
            manager.retrieve(&artifact.id).await,
            Err(EngineError::ArtifactNotFound(_))
        ));
        assert!(manager.list(10).await.unwrap().is_empty());
        assert_eq!(manager.purge_expired().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_delete_then_retrieve_fails() {
        let (_dir, manager) = manager(None).await;
        let artifact = manager
            .store(b"x", "text/csv", ArtifactKind::TableExport, "x.csv")
            .await
            .unwrap();

        manager.delete(&artifact.id).await.unwrap();
        assert!(manager.retrieve(&artifact.id).await.is_err());
        assert!(manager.delete(&artifact.id).await.is_err());
    }
}
