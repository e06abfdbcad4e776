//! Command handlers for CLI operations
//!
//! This module implements the handlers for all CLI commands:
//! - ask: one exchange, printed as text or JSON
//! - chat: line-by-line conversation on one session
//! - plan: plan preview without execution
//! - report: save, list, run, delete
//! - tools: registry listing
//! - artifact: get, list, delete, purge
//! - history: plan audit trail
//!
//! Every handler that opens the engine shuts it down before returning so the
//! database WAL is checkpointed.

use anyhow::{Context, Result};
use serde_json::json;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::cli::{ArtifactAction, ReportAction};
use crate::conductor::{ChatRequest, ChatResponse, Conductor, Plan};
use crate::db::SavedReportRecord;
use crate::tools::ToolName;
use crate::config::Config;
use crate::store::value::display;

/// Output format for command results
#[derive(Debug, Clone, Copy)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output for machine consumption
    Json,
}

async fn conductor(config: &Config) -> Result<Conductor> {
    Conductor::from_config(config)
        .await
        .context("Failed to start the engine")
}

/// Send one message and print the response
pub async fn handle_ask(
    message: String,
    session: Option<String>,
    user: String,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let conductor = conductor(config).await?;
    let response = conductor
        .handle_message(ChatRequest::new(session, user, message))
        .await?;
    print_response(&response, format)?;
    conductor.shutdown().await
}

/// Interactive conversation; every line goes to the same session
pub async fn handle_chat(user: String, config: &Config, format: OutputFormat) -> Result<()> {
    let conductor = conductor(config).await?;
    let session_id = uuid::Uuid::new_v4().to_string();

    println!("CRMFlow chat (session {}). Type 'exit' to quit.", session_id);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;

        let Some(line) = lines.next_line().await.context("Failed to read input")? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if matches!(line, "exit" | "quit") {
            break;
        }

        let response = conductor
            .handle_message(ChatRequest::new(Some(session_id.clone()), user.clone(), line))
            .await?;
        print_response(&response, format)?;
    }

    conductor.evict_session(&session_id, &user).await?;
    conductor.shutdown().await
}

/// Print the plan a message would produce
pub async fn handle_plan(message: String, user: String, config: &Config, format: OutputFormat) -> Result<()> {
    let conductor = conductor(config).await?;
    let plan = conductor.plan_only(None, &user, &message).await?;

    match format {
        OutputFormat::Text => print_plan(&plan, conductor.planner_name()),
        OutputFormat::Json => {
            let output = json!({
                "planner": conductor.planner_name(),
                "summary": plan.summary,
                "plan": plan.report(),
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }
    conductor.shutdown().await
}

/// Saved report management
pub async fn handle_report(action: ReportAction, config: &Config, format: OutputFormat) -> Result<()> {
    let conductor = conductor(config).await?;

    match action {
        ReportAction::Save {
            name,
            message,
            spec,
            description,
            user,
        } => {
            let spec = match (spec, message) {
                (Some(spec), _) => serde_json::from_str(&spec).context("--spec is not valid JSON")?,
                (None, Some(message)) => {
                    let plan = conductor.plan_only(None, &user, &message).await?;
                    plan.steps
                        .iter()
                        .find(|step| step.tool == ToolName::ReportBuild)
                        .map(|step| step.args.clone())
                        .with_context(|| format!("'{}' does not describe a report", message))?
                }
                (None, None) => anyhow::bail!("Either --message or --spec is required"),
            };
            let saved = conductor.save_report(&user, &name, &description, spec).await?;
            match format {
                OutputFormat::Text => println!("Saved report {} as {}", saved.name, saved.id),
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&saved)?),
            }
        }
        ReportAction::List { user } => {
            let reports = conductor.list_reports(&user).await?;
            match format {
                OutputFormat::Text => {
                    if reports.is_empty() {
                        println!("No saved reports");
                    }
                    for report in &reports {
                        print_saved_report(report);
                    }
                }
                OutputFormat::Json => {
                    let output = json!({ "reports": reports, "count": reports.len() });
                    println!("{}", serde_json::to_string_pretty(&output)?);
                }
            }
        }
        ReportAction::Run { id, user } => {
            let response = conductor.run_report(&id, &user).await?;
            print_response(&response, format)?;
        }
        ReportAction::Delete { id, user } => {
            conductor.delete_report(&id, &user).await?;
            println!("Deleted report {}", id);
        }
    }
    conductor.shutdown().await
}

/// List the tool registry
pub async fn handle_tools(config: &Config, format: OutputFormat) -> Result<()> {
    let registry = crate::tools::ToolRegistry::from_config(&config.store);
    let specs = registry.specs();

    match format {
        OutputFormat::Text => {
            println!("Tools ({}):", specs.len());
            println!();
            for spec in specs {
                println!("{}", spec.name);
                println!("  {}", spec.description);
                println!("  Collaborator: {}  Output: {:?}", spec.collaborator, spec.output);
                println!("  Args: {}", spec.params);
                println!();
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&json!({ "tools": specs }))?);
        }
    }
    Ok(())
}

/// Artifact management
pub async fn handle_artifact(action: ArtifactAction, config: &Config, format: OutputFormat) -> Result<()> {
    let conductor = conductor(config).await?;
    artifact_action(&conductor, action, format).await?;
    conductor.shutdown().await
}

async fn artifact_action(conductor: &Conductor, action: ArtifactAction, format: OutputFormat) -> Result<()> {
    let artifacts = conductor.artifacts();

    match action {
        ArtifactAction::Get { id, out } => {
            let (artifact, bytes) = artifacts.fetch(&id).await?;
            let path = out.unwrap_or_else(|| PathBuf::from(&artifact.filename));
            tokio::fs::write(&path, &bytes)
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
            match format {
                OutputFormat::Text => println!("Wrote {} bytes to {}", bytes.len(), path.display()),
                OutputFormat::Json => println!(
                    "{}",
                    serde_json::to_string_pretty(&json!({ "artifact": artifact, "path": path }))?
                ),
            }
        }
        ArtifactAction::List { limit } => {
            let list = artifacts.list(limit).await?;
            match format {
                OutputFormat::Text => {
                    if list.is_empty() {
                        println!("No artifacts stored");
                        return Ok(());
                    }
                    for artifact in list {
                        println!(
                            "{}  {:<12} {:>8} B  {}  {}",
                            artifact.id,
                            artifact.kind.as_str(),
                            artifact.size_bytes,
                            artifact.created_at.format("%Y-%m-%d %H:%M:%S"),
                            artifact.filename
                        );
                    }
                }
                OutputFormat::Json => {
                    let output = json!({ "artifacts": list, "count": list.len() });
                    println!("{}", serde_json::to_string_pretty(&output)?);
                }
            }
        }
        ArtifactAction::Delete { id } => {
            artifacts.delete(&id).await?;
            println!("Deleted artifact {}", id);
        }
        ArtifactAction::Purge => {
            let removed = artifacts.purge_expired().await?;
            println!("Purged {} expired artifact(s)", removed);
        }
    }
    Ok(())
}

/// Show the plan audit trail
pub async fn handle_history(limit: usize, config: &Config, format: OutputFormat) -> Result<()> {
    let conductor = conductor(config).await?;
    print_history(&conductor, limit, format).await?;
    conductor.shutdown().await
}

async fn print_history(conductor: &Conductor, limit: usize, format: OutputFormat) -> Result<()> {
    let plans = conductor
        .history(limit as i64)
        .await
        .context("Failed to fetch plan history")?;

    match format {
        OutputFormat::Text => {
            if plans.is_empty() {
                println!("No plans in history");
                return Ok(());
            }

            println!("Plan History (last {} plans):", limit);
            println!();

            for plan in plans {
                println!("Plan ID: {}", plan.id);
                println!("  Message: {}", plan.message);
                println!("  User: {}  Session: {}", plan.user_id, plan.session_id);
                println!("  Intent: {}  Status: {}", plan.intent, plan.status);

                let steps = conductor.history_steps(&plan.id).await?;
                for step in steps {
                    let detail = match (&step.error_kind, step.rows) {
                        (Some(kind), _) => format!("{}", kind),
                        (None, Some(rows)) => format!("{} rows", rows),
                        (None, None) => String::new(),
                    };
                    println!("    {}. {} [{}] {}", step.step_id, step.tool, step.status, detail);
                }

                let created = chrono::DateTime::from_timestamp_millis(plan.created_at)
                    .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "Unknown".to_string());
                println!("  Created: {}", created);
                println!();
            }
        }
        OutputFormat::Json => {
            let output = json!({
                "plans": plans,
                "count": plans.len(),
                "limit": limit
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }
    Ok(())
}

fn print_saved_report(report: &SavedReportRecord) {
    let when = |millis: i64| {
        chrono::DateTime::from_timestamp_millis(millis)
            .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "Unknown".to_string())
    };
    println!("{}  {}", report.id, report.name);
    if !report.description.is_empty() {
        println!("  {}", report.description);
    }
    println!(
        "  Created: {}  Last run: {}",
        when(report.created_at),
        report.last_run.map(when).unwrap_or_else(|| "never".to_string())
    );
}

fn print_plan(plan: &Plan, planner: &str) {
    println!("Planner: {}", planner);
    println!("Intent: {}", plan.intent);
    if let Some(summary) = &plan.summary {
        println!("Summary: {}", summary);
    }
    if plan.is_empty() {
        println!("No steps");
        return;
    }
    for step in &plan.steps {
        println!("  {}. {} {}", step.id, step.tool, step.args);
    }
}

fn print_response(response: &ChatResponse, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(response)?);
        }
        OutputFormat::Text => {
            println!("{}", response.message);

            if !response.preview_rows.is_empty() {
                println!();
                print_table(&response.columns, &response.preview_rows);
            }
            for metric in &response.metrics {
                println!("  {} = {}", metric.name, metric.value);
            }
            for (name, artifact) in &response.artifacts {
                println!(
                    "  {}: {} ({} bytes) -> crmflow artifact get {}",
                    name, artifact.filename, artifact.size_bytes, artifact.artifact_id
                );
            }
            for url in &response.embed_urls {
                println!("  embed: {}", url);
            }
            for write in &response.writes {
                println!(
                    "  {}: {}",
                    write.action,
                    write.record_id.as_deref().unwrap_or("(no id)")
                );
            }
            println!();
        }
    }
    Ok(())
}

fn print_table(columns: &[String], rows: &[sdk::types::Row]) {
    const MAX_WIDTH: usize = 24;
    let cells: Vec<Vec<String>> = rows
        .iter()
        .map(|row| {
            columns
                .iter()
                .map(|c| {
                    let text = row.get(c).map(display).unwrap_or_default();
                    text.chars().take(MAX_WIDTH).collect()
                })
                .collect()
        })
        .collect();

    let widths: Vec<usize> = columns
        .iter()
        .enumerate()
        .map(|(i, c)| {
            cells
                .iter()
                .map(|r| r[i].chars().count())
                .chain(std::iter::once(c.chars().count().min(MAX_WIDTH)))
                .max()
                .unwrap_or(0)
        })
        .collect();

    let line = |values: Vec<&str>| {
        values
            .iter()
            .zip(&widths)
            .map(|(v, w)| format!("{:<width$}", v, width = *w))
            .collect::<Vec<_>>()
            .join("  ")
    };

    println!("{}", line(columns.iter().map(String::as_str).collect()));
    for row in &cells {
        println!("{}", line(row.iter().map(String::as_str).collect()));
    }
}
