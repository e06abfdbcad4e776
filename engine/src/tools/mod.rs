//! Tool registry
//!
//! The closed vocabulary of operations a plan may contain. Each tool has a
//! typed parameter schema; [`ToolRegistry::parse`] turns a step's JSON
//! arguments into [`ToolParams`] or a validation error, before any
//! collaborator is contacted.

use crate::bi::ResourceType;
use crate::config::StoreConfig;
use crate::crm::CrmAction;
use crate::render::{ChartKind, ChartSpec, ExportFormat};
use crate::store::{validate_filter, validate_pipeline, StoreQuery};
use crate::transform::{de_string_list, AggFunc, FilterExpr, MetricKind, TransformOp};
use sdk::errors::EngineError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ToolName {
    #[serde(rename = "store.read")]
    StoreRead,
    #[serde(rename = "table.transform")]
    TableTransform,
    #[serde(rename = "metric.calculate")]
    MetricCalculate,
    #[serde(rename = "chart.render")]
    ChartRender,
    #[serde(rename = "table.export")]
    TableExport,
    #[serde(rename = "bi.query")]
    BiQuery,
    #[serde(rename = "bi.embed")]
    BiEmbed,
    #[serde(rename = "report.build")]
    ReportBuild,
    #[serde(rename = "crm.create_task")]
    CrmCreateTask,
    #[serde(rename = "crm.create_note")]
    CrmCreateNote,
    #[serde(rename = "crm.log_call")]
    CrmLogCall,
    #[serde(rename = "crm.create_activity")]
    CrmCreateActivity,
    #[serde(rename = "crm.update_record")]
    CrmUpdateRecord,
}

/// Shape of a tool's successful output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    Table,
    File,
    Url,
    Scalar,
    Record,
}

impl ToolName {
    pub const ALL: [ToolName; 13] = [
        ToolName::StoreRead,
        ToolName::TableTransform,
        ToolName::MetricCalculate,
        ToolName::ChartRender,
        ToolName::TableExport,
        ToolName::BiQuery,
        ToolName::BiEmbed,
        ToolName::ReportBuild,
        ToolName::CrmCreateTask,
        ToolName::CrmCreateNote,
        ToolName::CrmLogCall,
        ToolName::CrmCreateActivity,
        ToolName::CrmUpdateRecord,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolName::StoreRead => "store.read",
            ToolName::TableTransform => "table.transform",
            ToolName::MetricCalculate => "metric.calculate",
            ToolName::ChartRender => "chart.render",
            ToolName::TableExport => "table.export",
            ToolName::BiQuery => "bi.query",
            ToolName::BiEmbed => "bi.embed",
            ToolName::ReportBuild => "report.build",
            ToolName::CrmCreateTask => "crm.create_task",
            ToolName::CrmCreateNote => "crm.create_note",
            ToolName::CrmLogCall => "crm.log_call",
            ToolName::CrmCreateActivity => "crm.create_activity",
            ToolName::CrmUpdateRecord => "crm.update_record",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == name)
    }

    pub fn collaborator(&self) -> &'static str {
        match self {
            ToolName::StoreRead => "document_store",
            ToolName::TableTransform | ToolName::MetricCalculate => "in_process",
            ToolName::ChartRender => "chart_renderer",
            ToolName::TableExport => "spreadsheet_writer",
            ToolName::BiQuery | ToolName::BiEmbed => "bi_service",
            ToolName::ReportBuild => "report_builder",
            _ => "crm",
        }
    }

    pub fn output(&self) -> OutputKind {
        match self {
            ToolName::StoreRead | ToolName::TableTransform | ToolName::BiQuery => OutputKind::Table,
            ToolName::MetricCalculate => OutputKind::Scalar,
            ToolName::ChartRender | ToolName::TableExport | ToolName::ReportBuild => OutputKind::File,
            ToolName::BiEmbed => OutputKind::Url,
            _ => OutputKind::Record,
        }
    }

    /// Takes a table produced earlier (prior step or session result)
    pub fn consumes_table(&self) -> bool {
        matches!(
            self,
            ToolName::TableTransform
                | ToolName::MetricCalculate
                | ToolName::ChartRender
                | ToolName::TableExport
        )
    }

    /// Returns record data that must pass field redaction
    pub fn reads_records(&self) -> bool {
        matches!(
            self,
            ToolName::StoreRead | ToolName::BiQuery | ToolName::ReportBuild
        )
    }

    pub fn crm_action(&self) -> Option<CrmAction> {
        match self {
            ToolName::CrmCreateTask => Some(CrmAction::CreateTask),
            ToolName::CrmCreateNote => Some(CrmAction::CreateNote),
            ToolName::CrmLogCall => Some(CrmAction::LogCall),
            ToolName::CrmCreateActivity => Some(CrmAction::CreateActivity),
            ToolName::CrmUpdateRecord => Some(CrmAction::UpdateRecord),
            _ => None,
        }
    }

    pub fn is_mutation(&self) -> bool {
        self.crm_action().is_some()
    }

    pub fn description(&self) -> &'static str {
        match self {
            ToolName::StoreRead => "Read records from a collection with a filter and/or aggregation pipeline",
            ToolName::TableTransform => "Select, filter, sort, group or pivot the previous table",
            ToolName::MetricCalculate => "Compute a named metric over the previous table",
            ToolName::ChartRender => "Render the previous table as a bar, line or pie chart (PNG)",
            ToolName::TableExport => "Export the previous table to XLSX or CSV",
            ToolName::BiQuery => "Run a saved BI card and return its rows",
            ToolName::BiEmbed => "Create a signed embed URL for a BI dashboard or question",
            ToolName::ReportBuild => "Build a multi-sheet workbook from store reads and BI cards",
            ToolName::CrmCreateTask => "Create a follow-up task",
            ToolName::CrmCreateNote => "Add a note to a lead",
            ToolName::CrmLogCall => "Log a phone call with a lead",
            ToolName::CrmCreateActivity => "Record an activity (email, meeting, demo, followup)",
            ToolName::CrmUpdateRecord => "Update fields on a lead",
        }
    }

    pub fn params_help(&self) -> &'static str {
        match self {
            ToolName::StoreRead => r#"{"collection": str, "filter"?: object, "pipeline"?: [stage], "limit"?: int}"#,
            ToolName::TableTransform => r#"{"operation": "select|filter|sort|group|pivot", "columns"?: [str], "where"?: str, "by"?: [str], "ascending"?: bool, "limit"?: int, "agg"?: "sum|count|mean|min|max", "value"?: str, "index"?: str, "values"?: str}"#,
            ToolName::MetricCalculate => r#"{"metric": "total_pipeline|conversion_rate|avg_deal_size|row_count"}"#,
            ToolName::ChartRender => r#"{"kind": "bar|line|pie", "x": str, "y"?: str, "title"?: str}"#,
            ToolName::TableExport => r#"{"format"?: "xlsx|csv", "sheet_name"?: str, "filename"?: str}"#,
            ToolName::BiQuery => r#"{"card_id": int, "params"?: object}"#,
            ToolName::BiEmbed => r#"{"resource_type": "dashboard|question", "resource_id": int, "params"?: object, "theme"?: str}"#,
            ToolName::ReportBuild => r#"{"title": str, "sheets": [{"name": str, "source": "store|bi_card", "collection"?: str, "filter"?: object, "pipeline"?: [stage], "card_id"?: int, "params"?: object}]}"#,
            ToolName::CrmCreateTask => r#"{"title": str, "lead_id"?: str, "due_date"?: str, "owner_id"?: str, "priority"?: str}"#,
            ToolName::CrmCreateNote => r#"{"lead_id": str, "body": str}"#,
            ToolName::CrmLogCall => r#"{"lead_id": str, "direction": "inbound|outbound", "duration_seconds"?: int, "summary"?: str}"#,
            ToolName::CrmCreateActivity => r#"{"lead_id": str, "type": str, "when"?: str, "notes"?: str}"#,
            ToolName::CrmUpdateRecord => r#"{"lead_id": str, "fields": object}"#,
        }
    }
}

impl fmt::Display for ToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Parameter schemas
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct StoreReadArgs {
    collection: String,
    #[serde(default)]
    filter: Map<String, Value>,
    #[serde(default)]
    pipeline: Vec<Value>,
    limit: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum TransformKind {
    Select,
    Filter,
    Sort,
    Group,
    Pivot,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct TransformArgs {
    operation: TransformKind,
    #[serde(default, deserialize_with = "de_string_list")]
    columns: Vec<String>,
    #[serde(rename = "where")]
    condition: Option<String>,
    #[serde(default, deserialize_with = "de_string_list")]
    by: Vec<String>,
    #[serde(default = "default_true")]
    ascending: bool,
    limit: Option<usize>,
    #[serde(alias = "aggfunc")]
    agg: Option<AggFunc>,
    value: Option<String>,
    index: Option<String>,
    values: Option<String>,
}

fn default_true() -> bool {
    true
}

fn missing(tool: ToolName, field: &str) -> EngineError {
    EngineError::validation(tool.as_str(), format!("missing required parameter '{}'", field))
}

impl TransformArgs {
    fn into_op(self) -> Result<TransformOp, EngineError> {
        let tool = ToolName::TableTransform;
        match self.operation {
            TransformKind::Select => {
                if self.columns.is_empty() {
                    return Err(missing(tool, "columns"));
                }
                Ok(TransformOp::Select {
                    columns: self.columns,
                })
            }
            TransformKind::Filter => {
                let condition = self.condition.ok_or_else(|| missing(tool, "where"))?;
                Ok(TransformOp::Filter {
                    expr: FilterExpr::parse(&condition)?,
                })
            }
            TransformKind::Sort => {
                if self.by.is_empty() {
                    return Err(missing(tool, "by"));
                }
                Ok(TransformOp::Sort {
                    by: self.by,
                    ascending: self.ascending,
                    limit: self.limit,
                })
            }
            TransformKind::Group => {
                if self.by.is_empty() {
                    return Err(missing(tool, "by"));
                }
                Ok(TransformOp::Group {
                    by: self.by,
                    agg: self.agg.unwrap_or_default(),
                    value: self.value,
                })
            }
            TransformKind::Pivot => {
                let index = self.index.ok_or_else(|| missing(tool, "index"))?;
                let values = self.values.ok_or_else(|| missing(tool, "values"))?;
                let columns = match self.columns.as_slice() {
                    [one] => one.clone(),
                    _ => {
                        return Err(EngineError::validation(
                            tool.as_str(),
                            "pivot takes exactly one 'columns' field",
                        ))
                    }
                };
                Ok(TransformOp::Pivot {
                    index,
                    columns,
                    values,
                    agg: self.agg.unwrap_or_default(),
                })
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct MetricArgs {
    metric: MetricKind,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ChartArgs {
    kind: ChartKind,
    x: Option<String>,
    y: Option<String>,
    title: Option<String>,
}

impl ChartArgs {
    fn into_spec(self) -> Result<ChartSpec, EngineError> {
        let tool = ToolName::ChartRender;
        let x = self.x.ok_or_else(|| missing(tool, "x"))?;
        if self.kind != ChartKind::Pie && self.y.is_none() {
            return Err(missing(tool, "y"));
        }
        Ok(ChartSpec {
            kind: self.kind,
            x,
            y: self.y,
            title: self.title,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExportParams {
    #[serde(default)]
    pub format: ExportFormat,
    #[serde(default = "default_sheet_name")]
    pub sheet_name: String,
    pub filename: Option<String>,
}

fn default_sheet_name() -> String {
    "Sheet1".to_string()
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BiQueryParams {
    pub card_id: i64,
    #[serde(default)]
    pub params: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BiEmbedParams {
    pub resource_type: ResourceType,
    pub resource_id: i64,
    #[serde(default)]
    pub params: Map<String, Value>,
    pub theme: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum SheetSourceKind {
    Store,
    BiCard,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ReportSheetArgs {
    name: String,
    source: SheetSourceKind,
    collection: Option<String>,
    #[serde(default)]
    filter: Map<String, Value>,
    #[serde(default)]
    pipeline: Vec<Value>,
    limit: Option<u32>,
    card_id: Option<i64>,
    #[serde(default)]
    params: Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ReportArgs {
    title: String,
    sheets: Vec<ReportSheetArgs>,
}

/// Where one report sheet gets its rows
#[derive(Debug, Clone, PartialEq)]
pub enum SheetSource {
    Store {
        collection: String,
        query: StoreQuery,
    },
    BiCard {
        card_id: i64,
        params: Map<String, Value>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReportSheet {
    pub name: String,
    pub source: SheetSource,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReportParams {
    pub title: String,
    pub sheets: Vec<ReportSheet>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct CreateTaskArgs {
    title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    lead_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    due_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    owner_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    priority: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct CreateNoteArgs {
    lead_id: String,
    body: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum CallDirection {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct LogCallArgs {
    lead_id: String,
    direction: CallDirection,
    #[serde(skip_serializing_if = "Option::is_none")]
    duration_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    summary: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct CreateActivityArgs {
    lead_id: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    when: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct UpdateRecordArgs {
    lead_id: String,
    fields: Map<String, Value>,
}

/// Validated arguments, one variant per tool family
#[derive(Debug, Clone, PartialEq)]
pub enum ToolParams {
    StoreRead {
        collection: String,
        query: StoreQuery,
    },
    Transform(TransformOp),
    Metric(MetricKind),
    Chart(ChartSpec),
    Export(ExportParams),
    BiQuery(BiQueryParams),
    BiEmbed(BiEmbedParams),
    Report(ReportParams),
    Crm {
        action: CrmAction,
        path_params: Map<String, Value>,
        body: Value,
    },
}

impl ToolParams {
    /// Collections this step reads, including `$lookup` targets
    pub fn collections(&self) -> Vec<String> {
        fn with_lookups(collection: &str, query: &StoreQuery) -> Vec<String> {
            let mut names = vec![collection.to_string()];
            names.extend(crate::store::referenced_collections(&query.pipeline));
            names
        }
        match self {
            ToolParams::StoreRead { collection, query } => with_lookups(collection, query),
            ToolParams::Report(report) => report
                .sheets
                .iter()
                .flat_map(|sheet| match &sheet.source {
                    SheetSource::Store { collection, query } => with_lookups(collection, query),
                    SheetSource::BiCard { .. } => Vec::new(),
                })
                .collect(),
            _ => Vec::new(),
        }
    }
}

fn decode<T: DeserializeOwned>(tool: ToolName, args: &Value) -> Result<T, EngineError> {
    let args = match args {
        Value::Null => Value::Object(Map::new()),
        other => other.clone(),
    };
    if !args.is_object() {
        return Err(EngineError::validation(tool.as_str(), "arguments must be a JSON object"));
    }
    serde_json::from_value(args).map_err(|e| EngineError::validation(tool.as_str(), e.to_string()))
}

fn require_text(tool: ToolName, field: &str, value: &str) -> Result<(), EngineError> {
    if value.trim().is_empty() {
        Err(EngineError::validation(
            tool.as_str(),
            format!("'{}' must not be empty", field),
        ))
    } else {
        Ok(())
    }
}

fn to_body<T: Serialize>(tool: ToolName, args: &T) -> Result<Value, EngineError> {
    serde_json::to_value(args).map_err(|e| EngineError::validation(tool.as_str(), e.to_string()))
}

/// Listing entry for one tool
#[derive(Debug, Clone, Serialize)]
pub struct ToolSpec {
    pub name: ToolName,
    pub collaborator: &'static str,
    pub output: OutputKind,
    pub description: &'static str,
    pub params: &'static str,
}

/// Registry of the closed tool set plus the store row-limit bounds
#[derive(Debug, Clone)]
pub struct ToolRegistry {
    default_limit: u32,
    max_limit: u32,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::from_config(&StoreConfig::default())
    }
}

impl ToolRegistry {
    pub fn from_config(config: &StoreConfig) -> Self {
        Self {
            default_limit: config.default_limit,
            max_limit: config.max_limit,
        }
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        ToolName::ALL
            .into_iter()
            .map(|name| ToolSpec {
                name,
                collaborator: name.collaborator(),
                output: name.output(),
                description: name.description(),
                params: name.params_help(),
            })
            .collect()
    }

    /// Tool catalog for the reasoning-service prompt
    pub fn catalog(&self) -> String {
        self.specs()
            .iter()
            .map(|spec| format!("- {}: {}\n  args: {}", spec.name, spec.description, spec.params))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn resolve(&self, name: &str) -> Result<ToolName, EngineError> {
        ToolName::parse(name).ok_or_else(|| EngineError::UnknownTool(name.to_string()))
    }

    fn store_query(
        &self,
        tool: ToolName,
        filter: Map<String, Value>,
        pipeline: Vec<Value>,
        limit: Option<u32>,
    ) -> Result<StoreQuery, EngineError> {
        let limit = limit.unwrap_or(self.default_limit);
        if limit == 0 || limit > self.max_limit {
            return Err(EngineError::validation(
                tool.as_str(),
                format!("limit must be between 1 and {}", self.max_limit),
            ));
        }
        validate_filter(&filter)?;
        validate_pipeline(&pipeline)?;
        Ok(StoreQuery {
            filter,
            pipeline,
            limit,
        })
    }

    /// Validate `args` against the schema of `tool`
    pub fn parse(&self, tool: ToolName, args: &Value) -> Result<ToolParams, EngineError> {
        debug!("Validating {} arguments", tool);
        match tool {
            ToolName::StoreRead => {
                let a: StoreReadArgs = decode(tool, args)?;
                require_text(tool, "collection", &a.collection)?;
                let query = self.store_query(tool, a.filter, a.pipeline, a.limit)?;
                Ok(ToolParams::StoreRead {
                    collection: a.collection,
                    query,
                })
            }
            ToolName::TableTransform => {
                let a: TransformArgs = decode(tool, args)?;
                Ok(ToolParams::Transform(a.into_op()?))
            }
            ToolName::MetricCalculate => {
                let a: MetricArgs = decode(tool, args)?;
                Ok(ToolParams::Metric(a.metric))
            }
            ToolName::ChartRender => {
                let a: ChartArgs = decode(tool, args)?;
                Ok(ToolParams::Chart(a.into_spec()?))
            }
            ToolName::TableExport => {
                let a: ExportParams = decode(tool, args)?;
                require_text(tool, "sheet_name", &a.sheet_name)?;
                Ok(ToolParams::Export(a))
            }
            ToolName::BiQuery => Ok(ToolParams::BiQuery(decode(tool, args)?)),
            ToolName::BiEmbed => Ok(ToolParams::BiEmbed(decode(tool, args)?)),
            ToolName::ReportBuild => {
                let a: ReportArgs = decode(tool, args)?;
                require_text(tool, "title", &a.title)?;
                if a.sheets.is_empty() {
                    return Err(EngineError::validation(tool.as_str(), "'sheets' must not be empty"));
                }
                let sheets = a
                    .sheets
                    .into_iter()
                    .map(|s| {
                        let source = match s.source {
                            SheetSourceKind::Store => {
                                let collection =
                                    s.collection.ok_or_else(|| missing(tool, "sheets[].collection"))?;
                                let query = self.store_query(tool, s.filter, s.pipeline, s.limit)?;
                                SheetSource::Store { collection, query }
                            }
                            SheetSourceKind::BiCard => SheetSource::BiCard {
                                card_id: s.card_id.ok_or_else(|| missing(tool, "sheets[].card_id"))?,
                                params: s.params,
                            },
                        };
                        Ok(ReportSheet {
                            name: s.name,
                            source,
                        })
                    })
                    .collect::<Result<Vec<_>, EngineError>>()?;
                Ok(ToolParams::Report(ReportParams {
                    title: a.title,
                    sheets,
                }))
            }
            ToolName::CrmCreateTask => {
                let a: CreateTaskArgs = decode(tool, args)?;
                require_text(tool, "title", &a.title)?;
                self.crm(tool, Map::new(), to_body(tool, &a)?)
            }
            ToolName::CrmCreateNote => {
                let a: CreateNoteArgs = decode(tool, args)?;
                require_text(tool, "lead_id", &a.lead_id)?;
                require_text(tool, "body", &a.body)?;
                self.crm(tool, Map::new(), to_body(tool, &a)?)
            }
            ToolName::CrmLogCall => {
                let a: LogCallArgs = decode(tool, args)?;
                require_text(tool, "lead_id", &a.lead_id)?;
                self.crm(tool, Map::new(), to_body(tool, &a)?)
            }
            ToolName::CrmCreateActivity => {
                let a: CreateActivityArgs = decode(tool, args)?;
                require_text(tool, "lead_id", &a.lead_id)?;
                require_text(tool, "type", &a.kind)?;
                self.crm(tool, Map::new(), to_body(tool, &a)?)
            }
            ToolName::CrmUpdateRecord => {
                let a: UpdateRecordArgs = decode(tool, args)?;
                require_text(tool, "lead_id", &a.lead_id)?;
                if a.fields.is_empty() {
                    return Err(EngineError::validation(tool.as_str(), "'fields' must not be empty"));
                }
                let mut path_params = Map::new();
                path_params.insert("lead_id".to_string(), Value::String(a.lead_id));
                self.crm(tool, path_params, Value::Object(a.fields))
            }
        }
    }

    fn crm(
        &self,
        tool: ToolName,
        path_params: Map<String, Value>,
        body: Value,
    ) -> Result<ToolParams, EngineError> {
        let action = tool
            .crm_action()
            .ok_or_else(|| EngineError::UnknownTool(tool.as_str().to_string()))?;
        Ok(ToolParams::Crm {
            action,
            path_params,
            body,
        })
    }
}
