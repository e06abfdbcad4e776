//! Conductor System
//!
//! Plan, execute, observe. One exchange holds the session's lock from
//! planning until the last result and both turns are stored, so messages on
//! one session never interleave while different sessions run side by side.
//!
//! A session belongs to the user who sent its first message; messages from
//! anyone else are refused. Saved reports run through the same exchange path
//! on a fresh session owned by the caller.

pub mod executor;
pub mod memory;
pub mod planner;
pub mod types;

pub use executor::{Collaborators, Executor, StepResult};
pub use memory::{Session, SessionInfo, SessionStore, Turn, TurnRole};
pub use planner::{CollectionSchema, Planner, PlanningContext, ReasoningPlanner, RulePlanner};
pub use types::{Intent, Plan, PlanReport, PlanStatus, Step, StepInput, StepStatus};

use crate::artifacts::ArtifactManager;
use crate::bi::MetabaseClient;
use crate::config::Config;
use crate::crm::HttpCrmClient;
use crate::db::plans::{PlanRecord, PlanRepository, StepRecord};
use crate::db::reports::{ReportRepository, SavedReportRecord};
use crate::db::Database;
use crate::llm::ollama::OllamaProvider;
use crate::llm::openai::OpenAIProvider;
use crate::llm::LLMProvider;
use crate::rbac::{ConfigPolicySource, Rbac};
use crate::render::{PngChartRenderer, SpreadsheetWriter};
use crate::store::{DocumentStore, InMemoryDocumentStore};
use crate::tools::{ToolName, ToolRegistry, ToolSpec};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sdk::errors::{CrmflowErrorExt, EngineError};
use sdk::types::{ArtifactKind, ArtifactRef, Metric, RecordRef, Row, Table, ToolResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tracing::{info, warn};

/// How long startup waits for the reasoning service to answer a health check
const HEALTH_DEADLINE: Duration = Duration::from_secs(5);

/// One user message
#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    /// Absent or empty starts a new session
    #[serde(default)]
    pub session_id: Option<String>,
    pub user_id: String,
    pub message: String,
}

impl ChatRequest {
    pub fn new(session_id: Option<String>, user_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            session_id,
            user_id: user_id.into(),
            message: message.into(),
        }
    }
}

/// What the user gets back for one message
#[derive(Debug, Clone, Serialize)]
pub struct ChatResponse {
    pub session_id: String,
    pub message: String,
    pub preview_rows: Vec<Row>,
    pub columns: Vec<String>,
    pub artifacts: BTreeMap<String, ArtifactRef>,
    pub embed_urls: Vec<String>,
    pub writes: Vec<RecordRef>,
    pub metrics: Vec<Metric>,
    pub plan: PlanReport,
    pub timestamp: DateTime<Utc>,
}

pub struct Conductor {
    sessions: SessionStore,
    planner: Arc<dyn Planner>,
    executor: Executor,
    plans: Option<PlanRepository>,
    reports: Option<ReportRepository>,
    db: Option<Database>,
    preview_rows: usize,
}

fn database_error(e: anyhow::Error) -> EngineError {
    EngineError::Database(format!("{:#}", e))
}

impl Conductor {
    pub fn new(planner: Arc<dyn Planner>, executor: Executor) -> Self {
        Self {
            sessions: SessionStore::new(),
            planner,
            executor,
            plans: None,
            reports: None,
            db: None,
            preview_rows: 10,
        }
    }

    /// Audit trail and saved reports in `db`, which is closed on [`Conductor::shutdown`]
    pub fn with_database(mut self, db: Database) -> Self {
        self.plans = Some(db.plans());
        self.reports = Some(db.reports());
        self.db = Some(db);
        self
    }

    pub fn with_preview_rows(mut self, preview_rows: usize) -> Self {
        self.preview_rows = preview_rows.max(1);
        self
    }

    /// Wire every collaborator from configuration
    pub async fn from_config(config: &Config) -> Result<Self> {
        let db = Database::new(&config.database_path())
            .await
            .context("Failed to open database")?;

        let store: Arc<dyn DocumentStore> = match &config.store.fixtures {
            Some(path) => Arc::new(
                InMemoryDocumentStore::from_file(path)
                    .with_context(|| format!("Failed to load fixtures from {}", path.display()))?,
            ),
            None => Arc::new(InMemoryDocumentStore::demo()),
        };

        let crm = HttpCrmClient::from_config(&config.crm).load_catalog().await;
        let collaborators = Collaborators {
            store,
            bi: Arc::new(MetabaseClient::from_config(&config.bi)),
            crm: Arc::new(crm),
            charts: Arc::new(PngChartRenderer::new()),
            spreadsheets: SpreadsheetWriter::new(),
            artifacts: Arc::new(ArtifactManager::with_ttl_secs(
                db.artifacts(),
                config.artifacts.ttl_secs,
            )),
        };

        let registry = ToolRegistry::from_config(&config.store);
        let rbac = Rbac::new(Arc::new(ConfigPolicySource::from_config(
            &config.store,
            &config.rbac,
        )));

        let provider: Option<Arc<dyn LLMProvider>> = match config.reasoning.provider.as_str() {
            "ollama" => Some(Arc::new(OllamaProvider::from_config(&config.reasoning.ollama))),
            "openai" => Some(Arc::new(OpenAIProvider::new(config.reasoning.openai.clone()))),
            _ => None,
        };
        let provider = match provider {
            Some(provider) => {
                let healthy = tokio::time::timeout(HEALTH_DEADLINE, provider.check_health())
                    .await
                    .unwrap_or(false);
                if healthy {
                    Some(provider)
                } else {
                    warn!(
                        "Reasoning service '{}' is not reachable, planning with rules instead",
                        provider.name()
                    );
                    None
                }
            }
            None => None,
        };
        let planner: Arc<dyn Planner> = match provider {
            Some(provider) => {
                info!("Planning with reasoning service '{}'", provider.name());
                Arc::new(ReasoningPlanner::new(provider, registry.clone()))
            }
            None => {
                info!("Planning with deterministic rules");
                Arc::new(RulePlanner::new())
            }
        };

        Ok(Self::new(planner, Executor::new(registry, rbac, collaborators))
            .with_database(db)
            .with_preview_rows(config.core.preview_rows))
    }

    /// Flush and close the database, if this conductor owns one
    pub async fn shutdown(self) -> Result<()> {
        if let Some(db) = self.db {
            db.close().await?;
        }
        Ok(())
    }

    pub fn planner_name(&self) -> &str {
        self.planner.name()
    }

    pub fn tools(&self) -> Vec<ToolSpec> {
        self.executor.registry().specs()
    }

    pub fn artifacts(&self) -> &Arc<ArtifactManager> {
        self.executor.artifacts()
    }

    /// Plan, execute and answer one message.
    ///
    /// Fails only when the session belongs to another user; every other
    /// problem is reported inside the response.
    pub async fn handle_message(&self, request: ChatRequest) -> Result<ChatResponse, EngineError> {
        let session_id = request
            .session_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let mut session = self.sessions.lock(&session_id).await;
        if !session.claim(&request.user_id) {
            warn!(
                "Refused message from {} on session {} owned by another user",
                request.user_id, session_id
            );
            return Err(EngineError::SessionAccess { session: session_id });
        }

        let schema = self.executor.schema_for(&request.user_id).await;
        let ctx = PlanningContext::new(request.message.clone())
            .with_history(session.turns.clone())
            .with_last_result(session.last_result.clone())
            .with_schema(schema);
        let plan = self.planner.plan(&ctx).await;

        Ok(self
            .exchange(session, plan, &request.user_id, &request.message)
            .await)
    }

    /// Run `plan` on a claimed session: record both turns, keep the last
    /// table as the session's context, then audit once the lock is released
    async fn exchange(
        &self,
        mut session: OwnedMutexGuard<Session>,
        mut plan: Plan,
        user_id: &str,
        message: &str,
    ) -> ChatResponse {
        let session_id = session.id.clone();
        session.append(TurnRole::User, message);

        let results = self.executor.execute(&mut plan, user_id).await;
        let response = self.respond(&session_id, &plan, &results);

        if let Some(table) = last_table(&results) {
            session.set_last_result(table.clone());
        }
        session.append(TurnRole::Agent, response.message.as_str());
        drop(session);

        info!(
            "Session {}: intent={} steps={} status={}",
            session_id,
            plan.intent,
            plan.steps.len(),
            plan.status().as_str()
        );

        self.audit(&plan, &session_id, user_id, message).await;
        response
    }

    /// The plan a message would produce, without running it or touching the session
    pub async fn plan_only(
        &self,
        session_id: Option<&str>,
        user_id: &str,
        message: &str,
    ) -> Result<Plan, EngineError> {
        let (history, last_result) = match session_id {
            Some(id) => self.sessions.peek(id, user_id).await?,
            None => (Vec::new(), None),
        };
        let ctx = PlanningContext::new(message)
            .with_history(history)
            .with_last_result(last_result)
            .with_schema(self.executor.schema_for(user_id).await);
        Ok(self.planner.plan(&ctx).await)
    }

    pub async fn session_info(&self, session_id: &str) -> Option<SessionInfo> {
        self.sessions.info(session_id).await
    }

    /// Non-empty sessions owned by `user_id`, most recently active first
    pub async fn list_sessions(&self, user_id: &str) -> Vec<SessionInfo> {
        self.sessions.list_owned(user_id).await
    }

    /// Conversation of a session; unknown sessions are empty
    pub async fn session_turns(&self, session_id: &str, user_id: &str) -> Result<Vec<Turn>, EngineError> {
        let (turns, _) = self.sessions.peek(session_id, user_id).await?;
        Ok(turns)
    }

    /// Forget a session; returns whether it existed
    pub async fn evict_session(&self, session_id: &str, user_id: &str) -> Result<bool, EngineError> {
        if let Some(info) = self.sessions.info(session_id).await {
            if info.user_id.as_deref().is_some_and(|owner| owner != user_id) {
                return Err(EngineError::SessionAccess {
                    session: session_id.to_string(),
                });
            }
        }
        Ok(self.sessions.evict(session_id))
    }

    fn reports(&self) -> Result<&ReportRepository, EngineError> {
        self.reports
            .as_ref()
            .ok_or_else(|| EngineError::Config("saved reports need a database".to_string()))
    }

    /// Store `spec` (arguments of `report.build`) under `name` for `user_id`
    pub async fn save_report(
        &self,
        user_id: &str,
        name: &str,
        description: &str,
        spec: Value,
    ) -> Result<SavedReportRecord, EngineError> {
        let reports = self.reports()?;
        if name.trim().is_empty() {
            return Err(EngineError::validation(
                ToolName::ReportBuild.as_str(),
                "a saved report needs a name",
            ));
        }
        self.executor.registry().parse(ToolName::ReportBuild, &spec)?;

        let record = SavedReportRecord {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.trim().to_string(),
            description: description.to_string(),
            spec: spec.to_string(),
            created_by: user_id.to_string(),
            created_at: Utc::now().timestamp_millis(),
            last_run: None,
        };
        reports.insert(&record).await.map_err(database_error)?;
        info!("User {} saved report {} ({})", user_id, record.id, record.name);
        Ok(record)
    }

    /// Reports saved by `user_id`, newest first
    pub async fn list_reports(&self, user_id: &str) -> Result<Vec<SavedReportRecord>, EngineError> {
        self.reports()?.list(user_id).await.map_err(database_error)
    }

    /// A report saved by `user_id`; someone else's report is reported as missing
    pub async fn get_report(&self, report_id: &str, user_id: &str) -> Result<SavedReportRecord, EngineError> {
        match self.reports()?.get(report_id).await.map_err(database_error)? {
            Some(report) if report.created_by == user_id => Ok(report),
            _ => Err(EngineError::ReportNotFound(report_id.to_string())),
        }
    }

    pub async fn delete_report(&self, report_id: &str, user_id: &str) -> Result<(), EngineError> {
        self.get_report(report_id, user_id).await?;
        self.reports()?.delete(report_id).await.map_err(database_error)?;
        info!("User {} deleted report {}", user_id, report_id);
        Ok(())
    }

    /// Build a saved report on a new session owned by `user_id`.
    ///
    /// The sheets are read under the caller's current policy. `last_run` moves
    /// only when the workbook was produced.
    pub async fn run_report(
        &self,
        report_id: &str,
        user_id: &str,
    ) -> Result<ChatResponse, EngineError> {
        let report = self.get_report(report_id, user_id).await?;
        let spec: Value = serde_json::from_str(&report.spec).map_err(|e| {
            EngineError::Database(format!("saved report {} is unreadable: {}", report_id, e))
        })?;
        let plan = Plan::new(Intent::Report)
            .then(ToolName::ReportBuild, spec)
            .with_summary(format!("Run saved report {}", report.name));

        let session_id = uuid::Uuid::new_v4().to_string();
        let mut session = self.sessions.lock(&session_id).await;
        session.claim(user_id);
        let message = format!("run saved report {}", report.name);
        let response = self.exchange(session, plan, user_id, &message).await;

        if response.plan.status == PlanStatus::Completed {
            self.reports()?
                .mark_run(report_id, Utc::now().timestamp_millis())
                .await
                .map_err(database_error)?;
        }
        Ok(response)
    }

    /// Most recent audited plans, newest first
    pub async fn history(&self, limit: i64) -> Result<Vec<PlanRecord>> {
        match &self.plans {
            Some(plans) => plans.recent(limit).await,
            None => Ok(Vec::new()),
        }
    }

    pub async fn history_steps(&self, plan_id: &str) -> Result<Vec<StepRecord>> {
        match &self.plans {
            Some(plans) => plans.steps(plan_id).await,
            None => Ok(Vec::new()),
        }
    }

    fn respond(&self, session_id: &str, plan: &Plan, results: &[StepResult]) -> ChatResponse {
        let mut artifacts = BTreeMap::new();
        let mut embed_urls = Vec::new();
        let mut writes = Vec::new();
        let mut metrics = Vec::new();

        for step in results {
            match &step.result {
                ToolResult::File(artifact) => {
                    let mut name = artifact_name(artifact).to_string();
                    if artifacts.contains_key(&name) {
                        name = format!("{}_{}", name, step.step_id);
                    }
                    artifacts.insert(name, artifact.clone());
                }
                ToolResult::Url(url) => embed_urls.push(url.clone()),
                ToolResult::Record(record) => writes.push(record.clone()),
                ToolResult::Scalar(metric) => metrics.push(metric.clone()),
                ToolResult::Table(_) => {}
            }
        }

        let preview = last_table(results).map(|t| t.head(self.preview_rows));
        let message = compose_message(plan, results, last_table(results));

        ChatResponse {
            session_id: session_id.to_string(),
            message,
            columns: preview.as_ref().map(Table::column_names).unwrap_or_default(),
            preview_rows: preview.map(|t| t.rows).unwrap_or_default(),
            artifacts,
            embed_urls,
            writes,
            metrics,
            plan: plan.report(),
            timestamp: Utc::now(),
        }
    }

    async fn audit(&self, plan: &Plan, session_id: &str, user_id: &str, message: &str) {
        let Some(plans) = &self.plans else {
            return;
        };

        let record = PlanRecord {
            id: plan.id.clone(),
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
            message: message.to_string(),
            intent: plan.intent.as_str().to_string(),
            status: plan.status().as_str().to_string(),
            summary: plan.summary.clone().unwrap_or_default(),
            created_at: plan.created_at.timestamp_millis(),
            completed_at: Utc::now().timestamp_millis(),
        };
        let steps: Vec<StepRecord> = plan
            .steps
            .iter()
            .map(|step| {
                let output = step.output();
                let error = step.error();
                StepRecord {
                    plan_id: plan.id.clone(),
                    step_id: step.id as i64,
                    tool: step.tool.as_str().to_string(),
                    args: step.args.to_string(),
                    status: step.status().as_str().to_string(),
                    rows: output.map(|o| o.rows as i64),
                    size_bytes: output.map(|o| o.size_bytes as i64),
                    duration_ms: output.map(|o| o.duration_ms as i64),
                    artifact_id: output.and_then(|o| o.artifact_id.clone()),
                    error_kind: error.map(|e| e.kind.as_str().to_string()),
                    error_message: error.map(|e| e.message.clone()),
                }
            })
            .collect();

        if let Err(e) = plans.record(&record, &steps).await {
            warn!("Failed to record plan {}: {:#}", plan.id, e);
        }
    }
}

fn last_table(results: &[StepResult]) -> Option<&Table> {
    results.iter().rev().find_map(|r| r.result.as_table())
}

fn artifact_name(artifact: &ArtifactRef) -> &'static str {
    match artifact.kind {
        ArtifactKind::ChartImage => "chart",
        ArtifactKind::Report => "report",
        ArtifactKind::TableExport if artifact.filename.ends_with(".csv") => "csv",
        ArtifactKind::TableExport => "excel",
    }
}

fn format_metric(metric: &Metric) -> String {
    let label = metric.name.replace('_', " ");
    match metric.unit.as_deref() {
        Some("percent") => format!("{}: {:.1}%", label, metric.value),
        Some("currency") => format!("{}: {:.2}", label, metric.value),
        _ => format!("{}: {}", label, metric.value),
    }
}

fn compose_message(plan: &Plan, results: &[StepResult], table: Option<&Table>) -> String {
    if plan.is_empty() {
        let unrecognized = EngineError::UnrecognizedIntent;
        return format!("No action taken. {}.", unrecognized.user_hint().trim_end_matches('.'));
    }

    let mut parts: Vec<String> = Vec::new();
    if let Some(summary) = &plan.summary {
        parts.push(format!("{}.", summary.trim_end_matches('.')));
    }

    if let Some(failed) = plan.steps.iter().find(|s| s.status() == StepStatus::Error) {
        if let Some(error) = failed.error() {
            parts.push(format!(
                "Step {} ({}) failed: {}. {}",
                failed.id, failed.tool, error.message, error.hint
            ));
        }
        if !results.is_empty() {
            parts.push(format!("{} earlier step(s) completed.", results.len()));
        }
        return parts.join(" ");
    }

    if let Some(table) = table {
        parts.push(format!("{} row(s).", table.len()));
    }
    for step in results {
        match &step.result {
            ToolResult::Scalar(metric) => parts.push(format!("{}.", format_metric(metric))),
            ToolResult::File(artifact) => parts.push(format!("Created {}.", artifact.filename)),
            ToolResult::Url(_) => parts.push("Embed link ready.".to_string()),
            ToolResult::Record(record) => parts.push(match &record.record_id {
                Some(id) => format!("{} done (record {}).", record.action.replace('_', " "), id),
                None => format!("{} done.", record.action.replace('_', " ")),
            }),
            ToolResult::Table(_) => {}
        }
    }
    if parts.is_empty() {
        parts.push("Done.".to_string());
    }
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bi::ResourceType;
    use crate::config::{RbacConfig, StoreConfig, UserPolicyConfig};
    use crate::crm::CrmAction;
    use async_trait::async_trait;
    use sdk::errors::ErrorKind;
    use serde_json::Map;
    use tempfile::TempDir;

    struct NoBi;

    #[async_trait]
    impl crate::bi::BiService for NoBi {
        fn embed_url(
            &self,
            _resource_type: ResourceType,
            _resource_id: i64,
            _params: &Map<String, Value>,
            _theme: Option<&str>,
        ) -> std::result::Result<String, EngineError> {
            Err(EngineError::unavailable("bi", "not configured"))
        }

        async fn query_card(&self, _card_id: i64, _params: &Map<String, Value>) -> std::result::Result<Table, EngineError> {
            Err(EngineError::unavailable("bi", "not configured"))
        }
    }

    struct NoCrm;

    #[async_trait]
    impl crate::crm::CrmActions for NoCrm {
        async fn execute(
            &self,
            _action: CrmAction,
            _path_params: &Map<String, Value>,
            _body: &Value,
        ) -> std::result::Result<RecordRef, EngineError> {
            Err(EngineError::unavailable("crm", "not configured"))
        }
    }

    async fn conductor() -> (Conductor, TempDir) {
        conductor_with(RbacConfig::default()).await
    }

    async fn conductor_with(rbac: RbacConfig) -> (Conductor, TempDir) {
        let dir = TempDir::new().unwrap();
        let db = Database::new(&dir.path().join("c.db")).await.unwrap();
        let collaborators = Collaborators {
            store: Arc::new(InMemoryDocumentStore::demo()),
            bi: Arc::new(NoBi),
            crm: Arc::new(NoCrm),
            charts: Arc::new(PngChartRenderer::new()),
            spreadsheets: SpreadsheetWriter::new(),
            artifacts: Arc::new(ArtifactManager::new(db.artifacts(), None)),
        };
        let rbac = Rbac::new(Arc::new(ConfigPolicySource::from_config(&StoreConfig::default(), &rbac)));
        let executor = Executor::new(ToolRegistry::default(), rbac, collaborators);
        let conductor = Conductor::new(Arc::new(RulePlanner::new()), executor)
            .with_database(db)
            .with_preview_rows(2);
        (conductor, dir)
    }

    #[tokio::test]
    async fn test_read_sets_last_result_and_preview() {
        let (conductor, _dir) = conductor().await;
        let response = conductor
            .handle_message(ChatRequest::new(Some("s1".into()), "priya", "Show me all qualified leads"))
            .await
            .unwrap();

        assert_eq!(response.session_id, "s1");
        assert_eq!(response.plan.status, PlanStatus::Completed);
        assert_eq!(response.preview_rows.len(), 2);
        assert!(!response.columns.contains(&"ssn".to_string()));
        assert!(response.message.contains("3 row(s)"));

        let info = conductor.session_info("s1").await.unwrap();
        assert_eq!(info.turns, 2);
        assert_eq!(info.last_result_rows, Some(3));
    }

    #[tokio::test]
    async fn test_referential_export_follow_up() {
        let (conductor, _dir) = conductor().await;
        conductor
            .handle_message(ChatRequest::new(Some("s1".into()), "priya", "Show me all qualified leads"))
            .await
            .unwrap();
        let response = conductor
            .handle_message(ChatRequest::new(Some("s1".into()), "priya", "export this filtered list to Excel"))
            .await
            .unwrap();

        assert_eq!(response.plan.steps.len(), 1);
        let excel = &response.artifacts["excel"];
        let bytes = conductor.artifacts().retrieve(&excel.artifact_id).await.unwrap();
        assert_eq!(bytes.len() as u64, excel.size_bytes);
        // The export does not replace the tabular context
        assert_eq!(conductor.session_info("s1").await.unwrap().last_result_rows, Some(3));
    }

    #[tokio::test]
    async fn test_follow_up_from_another_user_is_refused() {
        let mut rbac = RbacConfig::default();
        rbac.users.insert(
            "bob".to_string(),
            UserPolicyConfig {
                collections: Some(vec!["tasks".to_string()]),
                deny_fields: vec!["email".to_string()],
            },
        );
        let (conductor, _dir) = conductor_with(rbac).await;
        conductor
            .handle_message(ChatRequest::new(Some("s1".into()), "priya", "Show me all qualified leads"))
            .await
            .unwrap();

        let err = conductor
            .handle_message(ChatRequest::new(Some("s1".into()), "bob", "export this filtered list to Excel"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::SessionAccess { ref session } if session == "s1"));
        assert_eq!(err.kind(), ErrorKind::AuthorizationError);

        // Nothing was recorded for the refused message
        let info = conductor.session_info("s1").await.unwrap();
        assert_eq!(info.turns, 2);
        assert_eq!(info.user_id.as_deref(), Some("priya"));
        assert_eq!(conductor.history(10).await.unwrap().len(), 1);
        assert!(conductor.artifacts().list(10).await.unwrap().is_empty());
        assert!(conductor.session_turns("s1", "bob").await.is_err());
        assert!(conductor.plan_only(Some("s1"), "bob", "export those").await.is_err());
        assert!(conductor.evict_session("s1", "bob").await.is_err());

        // On a session of their own bob has no previous result to lean on
        let response = conductor
            .handle_message(ChatRequest::new(Some("b1".into()), "bob", "export this filtered list to Excel"))
            .await
            .unwrap();
        assert_eq!(response.plan.status, PlanStatus::Error);
        assert!(response.artifacts.is_empty());
    }

    #[tokio::test]
    async fn test_list_sessions_is_per_user() {
        let (conductor, _dir) = conductor().await;
        for (session, user) in [("a", "priya"), ("b", "bob"), ("c", "priya")] {
            conductor
                .handle_message(ChatRequest::new(Some(session.into()), user, "Group leads by status"))
                .await
                .unwrap();
        }

        let sessions = conductor.list_sessions("priya").await;
        let mut ids: Vec<&str> = sessions.iter().map(|s| s.session_id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["a", "c"]);
        assert!(sessions.iter().all(|s| s.turns == 2));

        let turns = conductor.session_turns("b", "bob").await.unwrap();
        assert_eq!(turns[0].text, "Group leads by status");
        assert!(conductor.session_turns("unknown", "bob").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_saved_report_lifecycle() {
        let (conductor, _dir) = conductor().await;
        let spec = serde_json::json!({
            "title": "Pipeline",
            "sheets": [{"name": "Qualified", "source": "store", "collection": "leads", "filter": {"status": "Qualified"}}]
        });
        let saved = conductor
            .save_report("priya", "Weekly pipeline", "Qualified leads", spec)
            .await
            .unwrap();
        assert_eq!(saved.created_by, "priya");
        assert!(saved.last_run.is_none());

        let listed = conductor.list_reports("priya").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(conductor.list_reports("bob").await.unwrap().is_empty());

        let response = conductor.run_report(&saved.id, "priya").await.unwrap();
        assert_eq!(response.plan.status, PlanStatus::Completed);
        let report = &response.artifacts["report"];
        assert!(report.size_bytes > 0);
        let info = conductor.session_info(&response.session_id).await.unwrap();
        assert_eq!(info.user_id.as_deref(), Some("priya"));
        assert!(conductor.get_report(&saved.id, "priya").await.unwrap().last_run.is_some());

        // Another user cannot see, run or delete it
        for err in [
            conductor.get_report(&saved.id, "bob").await.unwrap_err(),
            conductor.run_report(&saved.id, "bob").await.unwrap_err(),
            conductor.delete_report(&saved.id, "bob").await.unwrap_err(),
        ] {
            assert_eq!(err.kind(), ErrorKind::NotFound);
        }

        conductor.delete_report(&saved.id, "priya").await.unwrap();
        assert!(conductor.list_reports("priya").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_report_is_not_saved() {
        let (conductor, _dir) = conductor().await;
        let err = conductor
            .save_report("priya", "Broken", "", serde_json::json!({"title": "x", "colour": "red"}))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationError);

        let err = conductor
            .save_report("priya", "  ", "", serde_json::json!({"title": "x", "sheets": []}))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationError);
        assert!(conductor.list_reports("priya").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unrecognized_is_not_a_failure() {
        let (conductor, _dir) = conductor().await;
        let response = conductor
            .handle_message(ChatRequest::new(None, "priya", "sing me a song"))
            .await
            .unwrap();
        assert!(response.plan.steps.is_empty());
        assert_eq!(response.plan.intent, Intent::Unrecognized);
        assert!(response.message.starts_with("No action taken"));
        assert!(!response.session_id.is_empty());
    }

    #[tokio::test]
    async fn test_audit_trail_records_steps() {
        let (conductor, _dir) = conductor().await;
        let response = conductor
            .handle_message(ChatRequest::new(None, "priya", "Group leads by status"))
            .await
            .unwrap();

        let history = conductor.history(10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, response.plan.id);
        assert_eq!(history[0].intent, "aggregation");

        let steps = conductor.history_steps(&response.plan.id).await.unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[1].tool, "table.transform");
        assert_eq!(steps[1].status, "completed");
    }

    #[tokio::test]
    async fn test_plan_only_leaves_session_alone() {
        let (conductor, _dir) = conductor().await;
        let plan = conductor
            .plan_only(Some("fresh"), "priya", "Group leads by status")
            .await
            .unwrap();
        assert_eq!(plan.steps.len(), 2);
        assert!(conductor.session_info("fresh").await.is_none());
        assert!(conductor.plan_only(None, "priya", "sing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_collaborator_message_has_hint() {
        let (conductor, _dir) = conductor().await;
        let response = conductor
            .handle_message(ChatRequest::new(None, "priya", "Mark lead 2 as won"))
            .await
            .unwrap();
        assert_eq!(response.plan.status, PlanStatus::Error);
        assert!(response.message.contains("failed"));
        assert!(response.writes.is_empty());
        assert!(conductor.evict_session(&response.session_id, "priya").await.unwrap());
    }
}
