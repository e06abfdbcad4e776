//! Planners
//!
//! Turn one user message plus session context into a [`Plan`]. Two
//! interchangeable implementations exist: [`RulePlanner`] (deterministic
//! phrase matching) and [`ReasoningPlanner`] (a reasoning service whose
//! output is re-validated and replaced by the rules when invalid).
//!
//! Reasoning drafts go through [`validate_plan_strict`]; rule plans are built
//! well-formed and checked against [`validate_plan`] in debug builds. The
//! executor checks every step's arguments again before running it.

pub mod reasoning;
pub mod rules;

use crate::conductor::memory::Turn;
use crate::conductor::types::{Plan, StepInput};
use crate::tools::{OutputKind, ToolRegistry};
use async_trait::async_trait;
use sdk::errors::EngineError;
use sdk::types::Table;

pub use reasoning::ReasoningPlanner;
pub use rules::RulePlanner;

/// A collection the requesting user may read, with field names from a sample document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionSchema {
    pub collection: String,
    pub fields: Vec<String>,
}

/// Everything a planner may look at
#[derive(Debug, Clone, Default)]
pub struct PlanningContext {
    pub message: String,
    pub history: Vec<Turn>,
    /// Most recent tabular result of the session
    pub last_result: Option<Table>,
    /// Readable collections for the requesting user, denied fields already removed
    pub schema: Vec<CollectionSchema>,
}

impl PlanningContext {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_history(mut self, history: Vec<Turn>) -> Self {
        self.history = history;
        self
    }

    pub fn with_last_result(mut self, last_result: Option<Table>) -> Self {
        self.last_result = last_result;
        self
    }

    pub fn with_schema(mut self, schema: Vec<CollectionSchema>) -> Self {
        self.schema = schema;
        self
    }
}

#[async_trait]
pub trait Planner: Send + Sync {
    fn name(&self) -> &str;

    /// Never fails: an empty plan means nothing actionable was recognized
    async fn plan(&self, ctx: &PlanningContext) -> Plan;
}

fn invalid_plan(message: impl Into<String>) -> EngineError {
    EngineError::validation("plan", message)
}

/// Structural checks shared by both planners
///
/// - step ids are 1-based positions
/// - a mutation only ever appears as the single step of its plan
/// - explicit inputs point at an earlier step that produces a table
/// - every table consumer has a source (explicit, carried, or the step before)
pub fn validate_plan(plan: &Plan) -> Result<(), EngineError> {
    let has_mutation = plan.steps.iter().any(|s| s.tool.is_mutation());
    if has_mutation && plan.steps.len() > 1 {
        return Err(invalid_plan("record mutations cannot be chained with other steps"));
    }

    for (index, step) in plan.steps.iter().enumerate() {
        if step.id != index + 1 {
            return Err(invalid_plan(format!(
                "step at position {} has id {}",
                index + 1,
                step.id
            )));
        }

        match &step.input {
            StepInput::Step(source) => {
                if *source == 0 || *source >= step.id {
                    return Err(invalid_plan(format!(
                        "step {} reads from step {}, which does not precede it",
                        step.id, source
                    )));
                }
                let producer = &plan.steps[source - 1];
                if producer.tool.output() != OutputKind::Table {
                    return Err(invalid_plan(format!(
                        "step {} reads from step {} ({}), which produces no table",
                        step.id, source, producer.tool
                    )));
                }
            }
            StepInput::Carried(_) => {}
            StepInput::None => {
                if step.tool.consumes_table() {
                    let previous_is_table = index
                        .checked_sub(1)
                        .map(|i| plan.steps[i].tool.output() == OutputKind::Table)
                        .unwrap_or(false);
                    if !previous_is_table {
                        return Err(invalid_plan(format!(
                            "step {} ({}) has no table to consume",
                            step.id, step.tool
                        )));
                    }
                }
            }
        }

        if !step.tool.consumes_table() && step.input != StepInput::None {
            return Err(invalid_plan(format!(
                "step {} ({}) does not take a table input",
                step.id, step.tool
            )));
        }
    }
    Ok(())
}

/// [`validate_plan`] plus schema validation of every step's arguments
pub fn validate_plan_strict(plan: &Plan, registry: &ToolRegistry) -> Result<(), EngineError> {
    validate_plan(plan)?;
    for step in &plan.steps {
        registry.parse(step.tool, &step.args)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conductor::types::{Intent, Step};
    use crate::tools::ToolName;
    use serde_json::json;

    #[test]
    fn test_chained_plan_is_valid() {
        let plan = Plan::new(Intent::Chart)
            .then(ToolName::StoreRead, json!({"collection": "leads"}))
            .then(ToolName::TableTransform, json!({"operation": "group", "by": ["status"]}))
            .then(ToolName::ChartRender, json!({"kind": "bar", "x": "status", "y": "count"}));
        validate_plan_strict(&plan, &ToolRegistry::default()).unwrap();
    }

    #[test]
    fn test_mutation_must_stand_alone() {
        let plan = Plan::new(Intent::Mutation)
            .then(ToolName::StoreRead, json!({"collection": "leads"}))
            .then(ToolName::CrmCreateTask, json!({"title": "Call back"}));
        assert!(validate_plan(&plan).is_err());

        let single = Plan::new(Intent::Mutation).then(ToolName::CrmCreateTask, json!({"title": "x"}));
        assert!(validate_plan(&single).is_ok());
    }

    #[test]
    fn test_consumer_without_source_rejected() {
        let plan = Plan::new(Intent::Export).then(ToolName::TableExport, json!({}));
        assert!(validate_plan(&plan).is_err());
    }

    #[test]
    fn test_forward_and_non_table_references_rejected() {
        let mut plan = Plan::new(Intent::Chart)
            .then(ToolName::StoreRead, json!({"collection": "leads"}))
            .then(ToolName::ChartRender, json!({"kind": "pie", "x": "status"}));
        plan.steps[1].input = StepInput::Step(2);
        assert!(validate_plan(&plan).is_err());

        let mut plan = Plan::new(Intent::Export)
            .then(ToolName::BiEmbed, json!({"resource_type": "dashboard", "resource_id": 1}));
        plan.steps.push(Step::new(2, ToolName::TableExport, json!({}), StepInput::Step(1)));
        assert!(validate_plan(&plan).is_err());
    }

    #[test]
    fn test_strict_validation_checks_arguments() {
        let plan = Plan::new(Intent::RecordQuery).then(ToolName::StoreRead, json!({"collection": "leads", "colour": "red"}));
        assert!(validate_plan(&plan).is_ok());
        assert!(validate_plan_strict(&plan, &ToolRegistry::default()).is_err());
    }
}
