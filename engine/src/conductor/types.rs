//! Plan and step data model
//!
//! A [`Plan`] is created fresh per user message and never restructured
//! afterwards; only step status moves. Each [`Step`] follows
//! `pending -> running -> {completed, error}`, with `pending -> error` for
//! steps rejected before their collaborator is called. Terminal states are
//! final.

use crate::tools::ToolName;
use chrono::{DateTime, Utc};
use sdk::errors::{CrmflowErrorExt, EngineError, ErrorKind};
use sdk::types::Table;
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use serde_json::Value;
use std::fmt;

/// Closed set of request categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    RecordQuery,
    Aggregation,
    Transform,
    Metric,
    Chart,
    Export,
    Mutation,
    BiEmbed,
    Report,
    Unrecognized,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::RecordQuery => "record_query",
            Intent::Aggregation => "aggregation",
            Intent::Transform => "transform",
            Intent::Metric => "metric",
            Intent::Chart => "chart",
            Intent::Export => "export",
            Intent::Mutation => "mutation",
            Intent::BiEmbed => "bi_embed",
            Intent::Report => "report",
            Intent::Unrecognized => "unrecognized",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        serde_json::from_value(Value::String(s.to_string())).ok()
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Error,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Running,
    Completed,
    Error,
}

impl PlanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanStatus::Running => "running",
            PlanStatus::Completed => "completed",
            PlanStatus::Error => "error",
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("step {step}: illegal transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub step: usize,
    pub from: StepStatus,
    pub to: StepStatus,
}

/// Where a table-consuming step gets its rows
#[derive(Debug, Clone, Default, PartialEq)]
pub enum StepInput {
    /// Nothing explicit; the executor falls back to the previous step
    #[default]
    None,
    /// Output of an earlier step in the same plan (1-based id)
    Step(usize),
    /// The session's last tabular result, captured at planning time
    Carried(Table),
}

impl Serialize for StepInput {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            StepInput::None => serializer.serialize_none(),
            StepInput::Step(id) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("step", id)?;
                map.end()
            }
            StepInput::Carried(table) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("last_result_rows", &table.len())?;
                map.end()
            }
        }
    }
}

/// Output summary; never the raw bytes
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StepOutput {
    pub rows: usize,
    pub size_bytes: u64,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepError {
    pub kind: ErrorKind,
    pub message: String,
    pub hint: String,
}

impl From<&EngineError> for StepError {
    fn from(e: &EngineError) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
            hint: e.user_hint().to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Step {
    pub id: usize,
    pub tool: ToolName,
    pub args: Value,
    pub input: StepInput,
    status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    output: Option<StepOutput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<StepError>,
}

impl Step {
    pub fn new(id: usize, tool: ToolName, args: Value, input: StepInput) -> Self {
        Self {
            id,
            tool,
            args,
            input,
            status: StepStatus::Pending,
            output: None,
            error: None,
        }
    }

    pub fn status(&self) -> StepStatus {
        self.status
    }

    pub fn output(&self) -> Option<&StepOutput> {
        self.output.as_ref()
    }

    pub fn error(&self) -> Option<&StepError> {
        self.error.as_ref()
    }

    fn transition(&mut self, to: StepStatus) -> Result<(), InvalidTransition> {
        let legal = matches!(
            (self.status, to),
            (StepStatus::Pending, StepStatus::Running)
                | (StepStatus::Pending, StepStatus::Error)
                | (StepStatus::Running, StepStatus::Completed)
                | (StepStatus::Running, StepStatus::Error)
        );
        if !legal {
            return Err(InvalidTransition {
                step: self.id,
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    /// Immediately before the collaborator call
    pub fn start(&mut self) -> Result<(), InvalidTransition> {
        self.transition(StepStatus::Running)
    }

    /// Failed before any collaborator call (validation, authorization)
    pub fn reject(&mut self, error: StepError, output: StepOutput) -> Result<(), InvalidTransition> {
        self.transition(StepStatus::Error)?;
        self.error = Some(error);
        self.output = Some(output);
        Ok(())
    }

    pub fn complete(&mut self, output: StepOutput) -> Result<(), InvalidTransition> {
        self.transition(StepStatus::Completed)?;
        self.output = Some(output);
        Ok(())
    }

    pub fn fail(&mut self, error: StepError, output: StepOutput) -> Result<(), InvalidTransition> {
        self.transition(StepStatus::Error)?;
        self.error = Some(error);
        self.output = Some(output);
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Plan {
    pub id: String,
    pub intent: Intent,
    pub steps: Vec<Step>,
    /// Planner's one-line description of what the plan does
    pub summary: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Plan {
    pub fn new(intent: Intent) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            intent,
            steps: Vec::new(),
            summary: None,
            created_at: Utc::now(),
        }
    }

    /// No actionable request recognized
    pub fn unrecognized() -> Self {
        Self::new(Intent::Unrecognized)
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    /// Append a step. Table consumers are wired to the previous step.
    pub fn then(mut self, tool: ToolName, args: Value) -> Self {
        let id = self.steps.len() + 1;
        let input = if tool.consumes_table() && id > 1 {
            StepInput::Step(id - 1)
        } else {
            StepInput::None
        };
        self.steps.push(Step::new(id, tool, args, input));
        self
    }

    /// Append a step fed from a table captured outside the plan
    pub fn then_carried(mut self, tool: ToolName, args: Value, table: Table) -> Self {
        let id = self.steps.len() + 1;
        self.steps.push(Step::new(id, tool, args, StepInput::Carried(table)));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Running while any step is pending or running, error once any failed
    pub fn status(&self) -> PlanStatus {
        if self.steps.iter().any(|s| s.status == StepStatus::Error) {
            PlanStatus::Error
        } else if self.steps.iter().all(|s| s.status == StepStatus::Completed) {
            PlanStatus::Completed
        } else {
            PlanStatus::Running
        }
    }

    pub fn report(&self) -> PlanReport {
        PlanReport {
            id: self.id.clone(),
            intent: self.intent,
            status: self.status(),
            steps: self.steps.clone(),
        }
    }
}

/// Serializable view of a plan with its derived status
#[derive(Debug, Clone, Serialize)]
pub struct PlanReport {
    pub id: String,
    pub intent: Intent,
    pub status: PlanStatus,
    pub steps: Vec<Step>,
}
