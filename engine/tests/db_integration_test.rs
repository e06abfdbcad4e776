/// Integration tests for database module
///
/// Tests the complete database lifecycle including:
/// - Database creation and initialization
/// - WAL mode configuration
/// - Schema creation via migrations
/// - Artifact and plan persistence across reopen
use crmflow_engine::artifacts::ArtifactManager;
use crmflow_engine::db::{Database, PlanRecord, StepRecord};
use sdk::errors::EngineError;
use sdk::types::ArtifactKind;
use std::time::Duration;
use tempfile::TempDir;

#[tokio::test]
async fn test_database_lifecycle() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("crmflow.db");

    let db = Database::new(&db_path).await.unwrap();
    assert!(db_path.exists());

    // Verify WAL file exists (created when WAL mode is enabled)
    let wal_path = temp_dir.path().join("crmflow.db-wal");
    assert!(wal_path.exists());

    let tables: Vec<String> =
        sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .fetch_all(db.pool())
            .await
            .unwrap();
    assert_eq!(tables, vec!["artifacts", "plan_steps", "plans"]);

    db.close().await.unwrap();
}

#[tokio::test]
async fn test_reopen_is_idempotent() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("crmflow.db");

    Database::new(&db_path).await.unwrap().close().await.unwrap();
    Database::new(&db_path).await.unwrap().close().await.unwrap();
}

#[tokio::test]
async fn test_artifact_survives_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("crmflow.db");

    let id = {
        let db = Database::new(&db_path).await.unwrap();
        let manager = ArtifactManager::new(db.artifacts(), None);
        let artifact = manager
            .store(b"owner,total\nPriya,67000\n", "text/csv", ArtifactKind::TableExport, "pipeline.csv")
            .await
            .unwrap();
        db.close().await.unwrap();
        artifact.id
    };

    let db = Database::new(&db_path).await.unwrap();
    let manager = ArtifactManager::new(db.artifacts(), None);
    let (artifact, bytes) = manager.fetch(&id).await.unwrap();
    assert_eq!(artifact.filename, "pipeline.csv");
    assert_eq!(artifact.size_bytes, bytes.len() as u64);
    assert_eq!(bytes, b"owner,total\nPriya,67000\n");
}

#[tokio::test]
async fn test_expired_artifacts_are_hidden_then_purged() {
    let temp_dir = TempDir::new().unwrap();
    let db = Database::new(&temp_dir.path().join("crmflow.db")).await.unwrap();

    let short = ArtifactManager::new(db.artifacts(), Some(Duration::from_millis(1)));
    let keep = ArtifactManager::new(db.artifacts(), None);

    let gone = short
        .store(b"x", "text/csv", ArtifactKind::TableExport, "a.csv")
        .await
        .unwrap();
    let kept = keep
        .store(b"y", "text/csv", ArtifactKind::TableExport, "b.csv")
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(matches!(
        keep.retrieve(&gone.id).await,
        Err(EngineError::ArtifactNotFound(_))
    ));
    let listed: Vec<String> = keep.list(10).await.unwrap().into_iter().map(|a| a.id).collect();
    assert_eq!(listed, vec![kept.id.clone()]);

    assert_eq!(keep.purge_expired().await.unwrap(), 1);
    assert_eq!(keep.purge_expired().await.unwrap(), 0);
    assert!(keep.retrieve(&kept.id).await.is_ok());
}

#[tokio::test]
async fn test_plan_audit_round_trip() {
    let temp_dir = TempDir::new().unwrap();
    let db = Database::new(&temp_dir.path().join("crmflow.db")).await.unwrap();
    let plans = db.plans();

    let plan = PlanRecord {
        id: "plan-1".to_string(),
        session_id: "s1".to_string(),
        user_id: "priya".to_string(),
        message: "Group leads by status".to_string(),
        intent: "aggregation".to_string(),
        status: "completed".to_string(),
        summary: "Leads grouped by status".to_string(),
        created_at: 1_000,
        completed_at: 1_250,
    };
    let steps = vec![
        StepRecord {
            plan_id: "plan-1".to_string(),
            step_id: 1,
            tool: "store.read".to_string(),
            args: r#"{"collection":"leads"}"#.to_string(),
            status: "completed".to_string(),
            rows: Some(12),
            size_bytes: Some(2048),
            duration_ms: Some(3),
            artifact_id: None,
            error_kind: None,
            error_message: None,
        },
        StepRecord {
            plan_id: "plan-1".to_string(),
            step_id: 2,
            tool: "table.transform".to_string(),
            args: r#"{"operation":"group","by":["status"]}"#.to_string(),
            status: "completed".to_string(),
            rows: Some(6),
            size_bytes: Some(300),
            duration_ms: Some(1),
            artifact_id: None,
            error_kind: None,
            error_message: None,
        },
    ];

    plans.record(&plan, &steps).await.unwrap();

    let recent = plans.recent(10).await.unwrap();
    assert_eq!(recent, vec![plan]);
    assert_eq!(plans.steps("plan-1").await.unwrap(), steps);
    assert!(plans.steps("missing").await.unwrap().is_empty());
}
