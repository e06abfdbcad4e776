//! Conductor Executor
//!
//! Runs the steps of a plan in order. Per step:
//!
//! 1. validate arguments against the tool's schema (no collaborator call on failure)
//! 2. resolve the table input: explicit edge, carried last result, or the previous step;
//!    a carried table is authorized and redacted again for the current user
//! 3. authorize every collection the step reads, including `$lookup` targets
//! 4. call the collaborator under a fixed deadline
//! 5. redact record-reading output before anything else sees it
//! 6. record rows, size and duration whatever the outcome
//!
//! The first failing step halts the plan; completed steps keep their results.

use crate::artifacts::ArtifactManager;
use crate::bi::BiService;
use crate::conductor::planner::CollectionSchema;
use crate::conductor::types::{InvalidTransition, Plan, Step, StepError, StepInput, StepOutput};
use crate::crm::CrmActions;
use crate::rbac::Rbac;
use crate::render::{slugify, ChartRenderer, Sheet, SpreadsheetWriter};
use crate::store::{DocumentStore, StoreQuery};
use crate::tools::{ExportParams, ReportParams, SheetSource, ToolName, ToolParams, ToolRegistry};
use crate::transform::{self, metrics};
use sdk::errors::EngineError;
use sdk::types::{ArtifactKind, Table, ToolResult};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Fixed deadline for one collaborator call
pub const STEP_DEADLINE: Duration = Duration::from_secs(30);

/// External services a plan may call
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn DocumentStore>,
    pub bi: Arc<dyn BiService>,
    pub crm: Arc<dyn CrmActions>,
    pub charts: Arc<dyn ChartRenderer>,
    pub spreadsheets: SpreadsheetWriter,
    pub artifacts: Arc<ArtifactManager>,
}

/// Result of one completed step
#[derive(Debug, Clone, PartialEq)]
pub struct StepResult {
    pub step_id: usize,
    pub tool: ToolName,
    pub result: ToolResult,
}

pub struct Executor {
    registry: ToolRegistry,
    rbac: Rbac,
    collaborators: Collaborators,
    deadline: Duration,
}

fn record(transition: Result<(), InvalidTransition>) {
    if let Err(e) = transition {
        error!("{}", e);
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis().min(u64::MAX as u128) as u64
}

/// Failure of a step before it reached its collaborator
struct Rejection(EngineError);

impl Executor {
    pub fn new(registry: ToolRegistry, rbac: Rbac, collaborators: Collaborators) -> Self {
        Self {
            registry,
            rbac,
            collaborators,
            deadline: STEP_DEADLINE,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn artifacts(&self) -> &Arc<ArtifactManager> {
        &self.collaborators.artifacts
    }

    /// Collections `user_id` may read, each with the sorted keys of one
    /// sample document after redaction. A failed sample lists no fields.
    pub async fn schema_for(&self, user_id: &str) -> Vec<CollectionSchema> {
        let policy = self.rbac.policy(user_id);
        let sample = StoreQuery {
            limit: 1,
            ..Default::default()
        };

        let mut schema = Vec::with_capacity(policy.collections.len());
        for collection in &policy.collections {
            let fields = match self.collaborators.store.query(collection, &sample).await {
                Ok(rows) => {
                    let mut fields: Vec<String> = self
                        .rbac
                        .redact(user_id, rows)
                        .first()
                        .map(|row| row.keys().cloned().collect())
                        .unwrap_or_default();
                    fields.sort();
                    fields
                }
                Err(e) => {
                    debug!("No sample from {} for the schema catalog: {}", collection, e);
                    Vec::new()
                }
            };
            schema.push(CollectionSchema {
                collection: collection.clone(),
                fields,
            });
        }
        schema
    }

    /// Execute `plan` on behalf of `user_id`, updating each step in place.
    ///
    /// Returns the results of the completed steps in order.
    pub async fn execute(&self, plan: &mut Plan, user_id: &str) -> Vec<StepResult> {
        let mut results: Vec<Option<ToolResult>> = Vec::with_capacity(plan.steps.len());
        let plan_id = plan.id.clone();

        for index in 0..plan.steps.len() {
            let step = &mut plan.steps[index];
            let span = info_span!("step", plan = %plan_id, step = step.id, tool = %step.tool);
            let result = self
                .run_step(step, &results, user_id)
                .instrument(span)
                .await;

            let failed = result.is_none();
            results.push(result);
            if failed {
                let skipped = plan.steps.len() - index - 1;
                if skipped > 0 {
                    info!("Plan {} halted at step {}; {} step(s) not run", plan_id, index + 1, skipped);
                }
                break;
            }
        }

        results
            .into_iter()
            .zip(plan.steps.iter())
            .filter_map(|(result, step)| {
                result.map(|result| StepResult {
                    step_id: step.id,
                    tool: step.tool,
                    result,
                })
            })
            .collect()
    }

    async fn run_step(
        &self,
        step: &mut Step,
        previous: &[Option<ToolResult>],
        user_id: &str,
    ) -> Option<ToolResult> {
        let started = Instant::now();

        let (params, input) = match self.prepare(step, previous, user_id) {
            Ok(prepared) => prepared,
            Err(Rejection(e)) => {
                warn!("Step {} rejected: {}", step.id, e);
                let output = StepOutput {
                    duration_ms: elapsed_ms(started),
                    ..Default::default()
                };
                record(step.reject(StepError::from(&e), output));
                return None;
            }
        };

        record(step.start());
        debug!("Step {} running", step.id);

        let outcome = match tokio::time::timeout(
            self.deadline,
            self.invoke(step.tool, params, input, user_id),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(EngineError::CollaboratorTimeout {
                collaborator: step.tool.collaborator().to_string(),
                secs: self.deadline.as_secs(),
            }),
        };

        let duration_ms = elapsed_ms(started);
        match outcome {
            Ok(result) => {
                let output = StepOutput {
                    rows: result.row_count(),
                    size_bytes: result.byte_size(),
                    duration_ms,
                    artifact_id: match &result {
                        ToolResult::File(artifact) => Some(artifact.artifact_id.clone()),
                        _ => None,
                    },
                };
                info!(
                    "Step {} completed: {} rows, {} bytes in {}ms",
                    step.id, output.rows, output.size_bytes, duration_ms
                );
                record(step.complete(output));
                Some(result)
            }
            Err(e) => {
                warn!("Step {} failed after {}ms: {}", step.id, duration_ms, e);
                let output = StepOutput {
                    duration_ms,
                    ..Default::default()
                };
                record(step.fail(StepError::from(&e), output));
                None
            }
        }
    }

    /// Everything that can fail before the collaborator is called
    fn prepare(
        &self,
        step: &Step,
        previous: &[Option<ToolResult>],
        user_id: &str,
    ) -> Result<(ToolParams, Option<Table>), Rejection> {
        let params = self.registry.parse(step.tool, &step.args).map_err(Rejection)?;

        let input = if step.tool.consumes_table() {
            Some(self.resolve_input(step, previous, user_id).map_err(Rejection)?)
        } else {
            None
        };

        for collection in params.collections() {
            self.rbac
                .check_collection(user_id, &collection)
                .map_err(Rejection)?;
        }

        Ok((params, input))
    }

    async fn invoke(
        &self,
        tool: ToolName,
        params: ToolParams,
        input: Option<Table>,
        user_id: &str,
    ) -> Result<ToolResult, EngineError> {
        let c = &self.collaborators;
        let sources = params.collections();
        let table = || {
            input
                .clone()
                .ok_or_else(|| EngineError::validation(tool.as_str(), "no table input"))
        };

        match params {
            ToolParams::StoreRead { collection, query } => {
                let rows = c.store.query(&collection, &query).await?;
                let table = Table::from_rows(rows).with_sources(sources);
                let table = self.rbac.redact_table(user_id, table);
                Ok(ToolResult::Table(table))
            }
            ToolParams::Transform(op) => Ok(ToolResult::Table(transform::apply(table()?, &op)?)),
            ToolParams::Metric(kind) => Ok(ToolResult::Scalar(metrics::calculate(kind, &table()?)?)),
            ToolParams::Chart(spec) => {
                let renderer = Arc::clone(&c.charts);
                let filename = format!(
                    "{}.{}",
                    slugify(spec.title.as_deref().unwrap_or("chart")),
                    renderer.extension()
                );
                let mime = renderer.mime();
                let rows = table()?;
                let bytes = blocking(move || renderer.render(&rows, &spec)).await?;
                let artifact = c
                    .artifacts
                    .store(&bytes, mime, ArtifactKind::ChartImage, &filename)
                    .await?;
                Ok(ToolResult::File(artifact.to_ref()))
            }
            ToolParams::Export(export) => self.export(table()?, export).await,
            ToolParams::BiQuery(query) => {
                let table = c.bi.query_card(query.card_id, &query.params).await?;
                Ok(ToolResult::Table(self.rbac.redact_table(user_id, table)))
            }
            ToolParams::BiEmbed(embed) => {
                let url = c.bi.embed_url(
                    embed.resource_type,
                    embed.resource_id,
                    &embed.params,
                    embed.theme.as_deref(),
                )?;
                Ok(ToolResult::Url(url))
            }
            ToolParams::Report(report) => self.report(report, user_id).await,
            ToolParams::Crm {
                action,
                path_params,
                body,
            } => {
                let record = c.crm.execute(action, &path_params, &body).await?;
                Ok(ToolResult::Record(record))
            }
        }
    }

    async fn export(&self, table: Table, export: ExportParams) -> Result<ToolResult, EngineError> {
        let c = &self.collaborators;
        let extension = export.format.extension();
        let filename = match &export.filename {
            Some(name) if name.ends_with(&format!(".{}", extension)) => name.clone(),
            Some(name) => format!("{}.{}", slugify(name), extension),
            None => format!("{}.{}", slugify(&export.sheet_name), extension),
        };

        let writer = c.spreadsheets.clone();
        let format = export.format;
        let sheet_name = export.sheet_name;
        let bytes = blocking(move || writer.write(&table, format, &sheet_name)).await?;

        let artifact = c
            .artifacts
            .store(&bytes, format.mime(), ArtifactKind::TableExport, &filename)
            .await?;
        Ok(ToolResult::File(artifact.to_ref()))
    }

    /// One workbook, one sheet per source, every sheet redacted
    async fn report(&self, report: ReportParams, user_id: &str) -> Result<ToolResult, EngineError> {
        let c = &self.collaborators;
        let mut sheets = Vec::with_capacity(report.sheets.len());
        for sheet in report.sheets {
            let table = match &sheet.source {
                SheetSource::Store { collection, query } => {
                    Table::from_rows(c.store.query(collection, query).await?)
                }
                SheetSource::BiCard { card_id, params } => c.bi.query_card(*card_id, params).await?,
            };
            debug!("Report sheet '{}': {} rows", sheet.name, table.len());
            sheets.push(Sheet::new(sheet.name, self.rbac.redact_table(user_id, table)));
        }

        let writer = c.spreadsheets.clone();
        let bytes = blocking(move || writer.xlsx(&sheets)).await?;
        let filename = format!("{}.xlsx", slugify(&report.title));
        let artifact = c
            .artifacts
            .store(&bytes, crate::render::XLSX_MIME, ArtifactKind::Report, &filename)
            .await?;
        Ok(ToolResult::File(artifact.to_ref()))
    }

    /// The table a consuming step reads.
    ///
    /// A table carried from an earlier exchange was read under whatever
    /// policy applied then, so it must pass this user's policy again.
    fn resolve_input(
        &self,
        step: &Step,
        previous: &[Option<ToolResult>],
        user_id: &str,
    ) -> Result<Table, EngineError> {
        let invalid = |message: String| EngineError::validation(step.tool.as_str(), message);
        match &step.input {
            StepInput::Carried(table) => {
                for collection in &table.sources {
                    self.rbac.check_collection(user_id, collection)?;
                }
                Ok(self.rbac.redact_table(user_id, table.clone()))
            }
            StepInput::Step(source) => previous
                .get(source.wrapping_sub(1))
                .and_then(Option::as_ref)
                .and_then(ToolResult::as_table)
                .cloned()
                .ok_or_else(|| invalid(format!("step {} produced no table", source))),
            StepInput::None => previous
                .last()
                .and_then(Option::as_ref)
                .and_then(ToolResult::as_table)
                .cloned()
                .ok_or_else(|| invalid("no previous step produced a table".to_string())),
        }
    }
}

/// Run CPU-bound rendering on the blocking pool
async fn blocking<T, F>(work: F) -> Result<T, EngineError>
where
    F: FnOnce() -> Result<T, EngineError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| EngineError::Render(format!("render task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bi::ResourceType;
    use crate::config::{RbacConfig, StoreConfig, UserPolicyConfig};
    use crate::conductor::types::{Intent, StepStatus};
    use crate::crm::CrmAction;
    use crate::db::Database;
    use crate::rbac::ConfigPolicySource;
    use crate::render::PngChartRenderer;
    use crate::store::{InMemoryDocumentStore, StoreQuery};
    use async_trait::async_trait;
    use sdk::errors::ErrorKind;
    use sdk::types::{RecordRef, Row};
    use serde_json::{json, Map, Value};
    use tempfile::TempDir;

    struct OfflineBi;

    #[async_trait]
    impl BiService for OfflineBi {
        fn embed_url(
            &self,
            _resource_type: ResourceType,
            resource_id: i64,
            _params: &Map<String, Value>,
            _theme: Option<&str>,
        ) -> Result<String, EngineError> {
            Ok(format!("https://bi.test/embed/dashboard/{}", resource_id))
        }

        async fn query_card(&self, _card_id: i64, _params: &Map<String, Value>) -> Result<Table, EngineError> {
            Err(EngineError::unavailable("bi", "offline"))
        }
    }

    struct RecordingCrm;

    #[async_trait]
    impl CrmActions for RecordingCrm {
        async fn execute(
            &self,
            action: CrmAction,
            _path_params: &Map<String, Value>,
            _body: &Value,
        ) -> Result<RecordRef, EngineError> {
            Ok(RecordRef {
                action: action.as_str().to_string(),
                record_id: Some("rec_1".to_string()),
                status: 201,
            })
        }
    }

    /// Never answers
    struct StuckStore;

    #[async_trait]
    impl DocumentStore for StuckStore {
        fn name(&self) -> &str {
            "stuck"
        }

        async fn query(&self, _collection: &str, _query: &StoreQuery) -> Result<Vec<Row>, EngineError> {
            std::future::pending().await
        }
    }

    struct FailingStore;

    #[async_trait]
    impl DocumentStore for FailingStore {
        async fn query(&self, collection: &str, _query: &StoreQuery) -> Result<Vec<Row>, EngineError> {
            Err(EngineError::unavailable("store", format!("{} is offline", collection)))
        }
    }

    async fn executor_with(store: Arc<dyn DocumentStore>, rbac: RbacConfig) -> (Executor, TempDir) {
        let dir = TempDir::new().unwrap();
        let db = Database::new(&dir.path().join("test.db")).await.unwrap();
        let artifacts = Arc::new(ArtifactManager::new(db.artifacts(), None));
        let collaborators = Collaborators {
            store,
            bi: Arc::new(OfflineBi),
            crm: Arc::new(RecordingCrm),
            charts: Arc::new(PngChartRenderer::new()),
            spreadsheets: SpreadsheetWriter::new(),
            artifacts,
        };
        let source = ConfigPolicySource::from_config(&StoreConfig::default(), &rbac);
        let executor = Executor::new(
            ToolRegistry::default(),
            Rbac::new(Arc::new(source)),
            collaborators,
        );
        (executor, dir)
    }

    async fn executor() -> (Executor, TempDir) {
        executor_with(Arc::new(InMemoryDocumentStore::demo()), RbacConfig::default()).await
    }

    #[tokio::test]
    async fn test_read_then_group() {
        let (executor, _dir) = executor().await;
        let mut plan = Plan::new(Intent::Aggregation)
            .then(ToolName::StoreRead, json!({"collection": "leads"}))
            .then(ToolName::TableTransform, json!({"operation": "group", "by": ["status"]}));

        let results = executor.execute(&mut plan, "priya").await;
        assert_eq!(results.len(), 2);
        assert!(plan.steps.iter().all(|s| s.status() == StepStatus::Completed));

        let leads = results[0].result.as_table().unwrap();
        assert!(leads.rows.iter().all(|r| !r.contains_key("ssn")));
        let grouped = results[1].result.as_table().unwrap();
        assert!(grouped.column("count").is_some());
        let total: i64 = grouped.rows.iter().filter_map(|r| r["count"].as_i64()).sum();
        assert_eq!(total as usize, leads.len());
    }

    #[tokio::test]
    async fn test_validation_failure_never_starts_step() {
        let (executor, _dir) = executor().await;
        let mut plan = Plan::new(Intent::Mutation).then(ToolName::CrmCreateNote, json!({"body": "hi"}));
        let results = executor.execute(&mut plan, "priya").await;
        assert!(results.is_empty());
        let step = &plan.steps[0];
        assert_eq!(step.status(), StepStatus::Error);
        assert_eq!(step.error().unwrap().kind, ErrorKind::ValidationError);
    }

    #[tokio::test]
    async fn test_unauthorized_collection() {
        let mut rbac = RbacConfig::default();
        rbac.users.insert(
            "intern".to_string(),
            UserPolicyConfig {
                collections: Some(vec!["tasks".to_string()]),
                deny_fields: Vec::new(),
            },
        );
        let (executor, _dir) = executor_with(Arc::new(InMemoryDocumentStore::demo()), rbac).await;

        let mut plan = Plan::new(Intent::RecordQuery).then(ToolName::StoreRead, json!({"collection": "leads"}));
        let results = executor.execute(&mut plan, "intern").await;
        assert!(results.is_empty());
        assert_eq!(plan.steps[0].error().unwrap().kind, ErrorKind::AuthorizationError);

        // A lookup into a forbidden collection is caught the same way
        let mut plan = Plan::new(Intent::RecordQuery).then(
            ToolName::StoreRead,
            json!({"collection": "tasks", "pipeline": [
                {"$lookup": {"from": "leads", "localField": "lead_id", "foreignField": "_id", "as": "lead"}}
            ]}),
        );
        executor.execute(&mut plan, "intern").await;
        assert_eq!(plan.steps[0].error().unwrap().kind, ErrorKind::AuthorizationError);
    }

    #[tokio::test]
    async fn test_failure_halts_plan() {
        let (executor, _dir) = executor().await;
        let mut plan = Plan::new(Intent::Chart)
            .then(ToolName::StoreRead, json!({"collection": "leads"}))
            .then(ToolName::TableTransform, json!({"operation": "select", "columns": ["no_such_column"]}))
            .then(ToolName::ChartRender, json!({"kind": "pie", "x": "status"}));

        let results = executor.execute(&mut plan, "priya").await;
        assert_eq!(results.len(), 1);
        assert_eq!(plan.steps[0].status(), StepStatus::Completed);
        assert_eq!(plan.steps[1].status(), StepStatus::Error);
        assert_eq!(plan.steps[2].status(), StepStatus::Pending);
        assert_eq!(plan.status(), crate::conductor::types::PlanStatus::Error);
    }

    #[tokio::test]
    async fn test_export_artifact_round_trip() {
        let (executor, _dir) = executor().await;
        let mut plan = Plan::new(Intent::Export)
            .then(ToolName::StoreRead, json!({"collection": "leads", "filter": {"status": "Qualified"}}))
            .then(ToolName::TableExport, json!({"format": "csv", "sheet_name": "Qualified"}));

        let results = executor.execute(&mut plan, "priya").await;
        let ToolResult::File(artifact) = &results[1].result else {
            panic!("expected a file result");
        };
        assert_eq!(artifact.filename, "qualified.csv");
        assert_eq!(plan.steps[1].output().unwrap().artifact_id.as_deref(), Some(artifact.artifact_id.as_str()));

        let bytes = executor.artifacts().retrieve(&artifact.artifact_id).await.unwrap();
        assert_eq!(bytes.len() as u64, artifact.size_bytes);
        let text = String::from_utf8(bytes).unwrap();
        assert_eq!(text.lines().count(), 4);
    }

    #[tokio::test]
    async fn test_chart_and_report_store_artifacts() {
        let (executor, _dir) = executor().await;
        let mut plan = Plan::new(Intent::Chart)
            .then(ToolName::StoreRead, json!({"collection": "leads"}))
            .then(ToolName::TableTransform, json!({"operation": "group", "by": ["owner"]}))
            .then(ToolName::ChartRender, json!({"kind": "bar", "x": "owner", "y": "total_amount", "title": "By owner"}));
        let results = executor.execute(&mut plan, "priya").await;
        assert!(matches!(&results[2].result, ToolResult::File(a) if a.mime == "image/png"));

        let mut plan = Plan::new(Intent::Report).then(
            ToolName::ReportBuild,
            json!({"title": "Weekly", "sheets": [
                {"name": "Leads", "source": "store", "collection": "leads"},
                {"name": "Tasks", "source": "store", "collection": "tasks"}
            ]}),
        );
        let results = executor.execute(&mut plan, "priya").await;
        let ToolResult::File(report) = &results[0].result else {
            panic!("expected a report");
        };
        assert_eq!(report.kind, ArtifactKind::Report);
        assert_eq!(report.filename, "weekly.xlsx");
    }

    #[tokio::test]
    async fn test_collaborator_unavailable_and_embed() {
        let (executor, _dir) = executor().await;
        let mut plan = Plan::new(Intent::RecordQuery).then(ToolName::BiQuery, json!({"card_id": 7}));
        executor.execute(&mut plan, "priya").await;
        assert_eq!(plan.steps[0].error().unwrap().kind, ErrorKind::CollaboratorUnavailable);

        let mut plan = Plan::new(Intent::BiEmbed)
            .then(ToolName::BiEmbed, json!({"resource_type": "dashboard", "resource_id": 2}));
        let results = executor.execute(&mut plan, "priya").await;
        assert_eq!(results[0].result, ToolResult::Url("https://bi.test/embed/dashboard/2".to_string()));
    }

    #[tokio::test]
    async fn test_crm_mutation_returns_record() {
        let (executor, _dir) = executor().await;
        let mut plan = Plan::new(Intent::Mutation)
            .then(ToolName::CrmUpdateRecord, json!({"lead_id": "lead_001", "fields": {"status": "Won"}}));
        let results = executor.execute(&mut plan, "priya").await;
        let ToolResult::Record(record) = &results[0].result else {
            panic!("expected a record");
        };
        assert_eq!(record.action, "update_record");
        assert_eq!(record.status, 201);
    }

    #[tokio::test]
    async fn test_stuck_collaborator_times_out() {
        let (executor, _dir) = executor_with(Arc::new(StuckStore), RbacConfig::default()).await;
        let executor = executor.with_deadline(Duration::from_millis(50));
        let mut plan = Plan::new(Intent::RecordQuery).then(ToolName::StoreRead, json!({"collection": "leads"}));
        executor.execute(&mut plan, "priya").await;
        let step = &plan.steps[0];
        assert_eq!(step.error().unwrap().kind, ErrorKind::CollaboratorTimeout);
        assert!(step.output().unwrap().duration_ms >= 50);
    }

    #[tokio::test]
    async fn test_carried_input_is_used() {
        let (executor, _dir) = executor().await;
        let rows: Vec<Row> = (0..5)
            .map(|i| json!({"name": format!("L{}", i), "amount": 10 * i}).as_object().cloned().unwrap())
            .collect();
        let carried = Table::from_rows(rows);
        let mut plan = Plan::new(Intent::Metric).then_carried(
            ToolName::MetricCalculate,
            json!({"metric": "total_pipeline"}),
            carried,
        );
        let results = executor.execute(&mut plan, "priya").await;
        let ToolResult::Scalar(metric) = &results[0].result else {
            panic!("expected a metric");
        };
        assert_eq!(metric.value, 100.0);
    }

    #[tokio::test]
    async fn test_carried_input_passes_current_policy() {
        let mut rbac = RbacConfig::default();
        rbac.users.insert(
            "bob".to_string(),
            UserPolicyConfig {
                collections: Some(vec!["tasks".to_string()]),
                deny_fields: vec!["email".to_string()],
            },
        );
        rbac.users.insert(
            "sales".to_string(),
            UserPolicyConfig {
                collections: None,
                deny_fields: vec!["email".to_string()],
            },
        );
        let (executor, _dir) = executor_with(Arc::new(InMemoryDocumentStore::demo()), rbac).await;

        let mut read = Plan::new(Intent::RecordQuery)
            .then(ToolName::StoreRead, json!({"collection": "leads", "filter": {"status": "Qualified"}}));
        let results = executor.execute(&mut read, "priya").await;
        let leads = results[0].result.as_table().unwrap().clone();
        assert_eq!(leads.sources, vec!["leads"]);
        assert!(leads.rows.iter().all(|r| r.contains_key("email")));

        // A user who cannot read leads is refused before the export runs
        let mut export = Plan::new(Intent::Export).then_carried(
            ToolName::TableExport,
            json!({"format": "csv"}),
            leads.clone(),
        );
        let results = executor.execute(&mut export, "bob").await;
        assert!(results.is_empty());
        let step = &export.steps[0];
        assert_eq!(step.error().unwrap().kind, ErrorKind::AuthorizationError);
        assert_eq!(step.output().unwrap().rows, 0);

        // A user who may read leads gets their own deny list applied
        let mut filter = Plan::new(Intent::Transform).then_carried(
            ToolName::TableTransform,
            json!({"operation": "sort", "by": ["amount"]}),
            leads,
        );
        let results = executor.execute(&mut filter, "sales").await;
        let sorted = results[0].result.as_table().unwrap();
        assert_eq!(sorted.len(), 3);
        assert!(sorted.rows.iter().all(|r| !r.contains_key("email")));
        assert!(sorted.column("email").is_none());
    }

    #[tokio::test]
    async fn test_schema_lists_only_readable_fields() {
        let mut rbac = RbacConfig::default();
        rbac.users.insert(
            "bob".to_string(),
            UserPolicyConfig {
                collections: Some(vec!["leads".to_string(), "tasks".to_string()]),
                deny_fields: vec!["email".to_string()],
            },
        );
        let (executor, _dir) = executor_with(Arc::new(InMemoryDocumentStore::demo()), rbac).await;

        let schema = executor.schema_for("priya").await;
        assert_eq!(schema.len(), 5);
        let leads = schema.iter().find(|c| c.collection == "leads").unwrap();
        assert!(leads.fields.contains(&"email".to_string()));
        assert!(!leads.fields.contains(&"ssn".to_string()));
        let mut sorted = leads.fields.clone();
        sorted.sort();
        assert_eq!(leads.fields, sorted);

        let schema = executor.schema_for("bob").await;
        let names: Vec<&str> = schema.iter().map(|c| c.collection.as_str()).collect();
        assert_eq!(names, vec!["leads", "tasks"]);
        assert!(!schema[0].fields.contains(&"email".to_string()));
        assert!(schema[1].fields.contains(&"due_date".to_string()));
    }

    #[tokio::test]
    async fn test_schema_survives_store_failure() {
        let (executor, _dir) = executor_with(Arc::new(FailingStore), RbacConfig::default()).await;
        let schema = executor.schema_for("priya").await;
        assert_eq!(schema.len(), 5);
        assert!(schema.iter().all(|c| c.fields.is_empty()));
    }
}
