/// Saved report definitions
///
/// A saved report is a named `report.build` argument document owned by the
/// user who created it. Running one only touches `last_run`.
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

/// Saved report row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedReportRecord {
    pub id: String,
    pub name: String,
    pub description: String,
    /// `report.build` arguments as JSON text
    pub spec: String,
    pub created_by: String,
    pub created_at: i64,
    pub last_run: Option<i64>,
}

fn from_row(row: &SqliteRow) -> SavedReportRecord {
    SavedReportRecord {
        id: row.get("id"),
        name: row.get("name"),
        description: row.get("description"),
        spec: row.get("spec"),
        created_by: row.get("created_by"),
        created_at: row.get("created_at"),
        last_run: row.get("last_run"),
    }
}

pub struct ReportRepository {
    pool: SqlitePool,
}

impl ReportRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, report: &SavedReportRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO saved_reports (id, name, description, spec, created_by, created_at, last_run)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&report.id)
        .bind(&report.name)
        .bind(&report.description)
        .bind(&report.spec)
        .bind(&report.created_by)
        .bind(report.created_at)
        .bind(report.last_run)
        .execute(&self.pool)
        .await
        .context("Failed to insert saved report")?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<SavedReportRecord>> {
        let row = sqlx::query(
            "SELECT id, name, description, spec, created_by, created_at, last_run
             FROM saved_reports WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch saved report")?;
        Ok(row.as_ref().map(from_row))
    }

    /// Reports created by `owner`, newest first
    pub async fn list(&self, owner: &str) -> Result<Vec<SavedReportRecord>> {
        let rows = sqlx::query(
            "SELECT id, name, description, spec, created_by, created_at, last_run
             FROM saved_reports WHERE created_by = ? ORDER BY created_at DESC, rowid DESC",
        )
        .bind(owner)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list saved reports")?;
        Ok(rows.iter().map(from_row).collect())
    }

    /// Returns whether a row was removed
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM saved_reports WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to delete saved report")?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn mark_run(&self, id: &str, at: i64) -> Result<()> {
        sqlx::query("UPDATE saved_reports SET last_run = ? WHERE id = ?")
            .bind(at)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to update saved report")?;
        Ok(())
    }
}
