/// Plan audit trail
///
/// Every executed plan is recorded with its steps once it reaches a terminal
/// status. Records are append-only.
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};

/// Plan row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanRecord {
    pub id: String,
    pub session_id: String,
    pub user_id: String,
    pub message: String,
    pub intent: String,
    pub status: String,
    pub summary: String,
    pub created_at: i64,
    pub completed_at: i64,
}

/// Step row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub plan_id: String,
    pub step_id: i64,
    pub tool: String,
    pub args: String,
    pub status: String,
    pub rows: Option<i64>,
    pub size_bytes: Option<i64>,
    pub duration_ms: Option<i64>,
    pub artifact_id: Option<String>,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
}

/// Plan repository for database operations
pub struct PlanRepository {
    pool: SqlitePool,
}

impl PlanRepository {
    /// Create a new plan repository
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Record a plan and its steps in one transaction
    pub async fn record(&self, plan: &PlanRecord, steps: &[StepRecord]) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin plan transaction")?;

        sqlx::query(
            "INSERT INTO plans (id, session_id, user_id, message, intent, status, summary, created_at, completed_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&plan.id)
        .bind(&plan.session_id)
        .bind(&plan.user_id)
        .bind(&plan.message)
        .bind(&plan.intent)
        .bind(&plan.status)
        .bind(&plan.summary)
        .bind(plan.created_at)
        .bind(plan.completed_at)
        .execute(&mut *tx)
        .await
        .context("Failed to insert plan")?;

        for step in steps {
            sqlx::query(
                "INSERT INTO plan_steps (plan_id, step_id, tool, args, status, rows, size_bytes, duration_ms, artifact_id, error_kind, error_message)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&step.plan_id)
            .bind(step.step_id)
            .bind(&step.tool)
            .bind(&step.args)
            .bind(&step.status)
            .bind(step.rows)
            .bind(step.size_bytes)
            .bind(step.duration_ms)
            .bind(&step.artifact_id)
            .bind(&step.error_kind)
            .bind(&step.error_message)
            .execute(&mut *tx)
            .await
            .context("Failed to insert plan step")?;
        }

        tx.commit().await.context("Failed to commit plan")?;
        Ok(())
    }

    /// Most recent plans, newest first
    pub async fn recent(&self, limit: i64) -> Result<Vec<PlanRecord>> {
        let rows = sqlx::query(
            "SELECT id, session_id, user_id, message, intent, status, summary, created_at, completed_at
             FROM plans ORDER BY created_at DESC, rowid DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch recent plans")?;

        Ok(rows
            .iter()
            .map(|row| PlanRecord {
                id: row.get("id"),
                session_id: row.get("session_id"),
                user_id: row.get("user_id"),
                message: row.get("message"),
                intent: row.get("intent"),
                status: row.get("status"),
                summary: row.get("summary"),
                created_at: row.get("created_at"),
                completed_at: row.get("completed_at"),
            })
            .collect())
    }

    /// Steps of a plan in execution order
    pub async fn steps(&self, plan_id: &str) -> Result<Vec<StepRecord>> {
        let rows = sqlx::query(
            "SELECT plan_id, step_id, tool, args, status, rows, size_bytes, duration_ms, artifact_id, error_kind, error_message
             FROM plan_steps WHERE plan_id = ? ORDER BY step_id ASC",
        )
        .bind(plan_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch plan steps")?;

        Ok(rows
            .iter()
            .map(|row| StepRecord {
                plan_id: row.get("plan_id"),
                step_id: row.get("step_id"),
                tool: row.get("tool"),
                args: row.get("args"),
                status: row.get("status"),
                rows: row.get("rows"),
                size_bytes: row.get("size_bytes"),
                duration_ms: row.get("duration_ms"),
                artifact_id: row.get("artifact_id"),
                error_kind: row.get("error_kind"),
                error_message: row.get("error_message"),
            })
            .collect())
    }
}
