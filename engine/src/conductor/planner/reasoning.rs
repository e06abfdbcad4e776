//! Reasoning-service planner
//!
//! Asks the configured model to draft a plan as JSON, then holds the draft
//! to the same rules as the deterministic planner: closed tool vocabulary,
//! parameter schemas and data-flow edges. A draft that fails any check is
//! discarded and the rule planner answers instead.

use super::rules::RulePlanner;
use super::{validate_plan_strict, CollectionSchema, Planner, PlanningContext};
use crate::conductor::memory::TurnRole;
use crate::conductor::types::{Intent, Plan, Step, StepInput};
use crate::llm::{extract_json, LLMProvider, Message};
use crate::tools::ToolRegistry;
use async_trait::async_trait;
use sdk::errors::EngineError;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Fixed deadline for one completion
const REASONING_DEADLINE: Duration = Duration::from_secs(20);

/// Most recent turns included in the prompt
const HISTORY_TURNS: usize = 6;

#[derive(Debug, Deserialize)]
struct RawPlan {
    intent: Option<String>,
    summary: Option<String>,
    #[serde(default)]
    steps: Vec<RawStep>,
}

#[derive(Debug, Deserialize)]
struct RawStep {
    tool: String,
    #[serde(default)]
    args: Value,
    #[serde(default)]
    input: Value,
}

pub struct ReasoningPlanner {
    provider: Arc<dyn LLMProvider>,
    registry: ToolRegistry,
    fallback: RulePlanner,
    deadline: Duration,
}

impl ReasoningPlanner {
    pub fn new(provider: Arc<dyn LLMProvider>, registry: ToolRegistry) -> Self {
        Self {
            provider,
            registry,
            fallback: RulePlanner::new(),
            deadline: REASONING_DEADLINE,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    fn system_prompt(&self, ctx: &PlanningContext) -> String {
        let last_result = if ctx.last_result.is_some() {
            "The session holds a previous tabular result. A step may read it with \"input\": \"last_result\" \
             when the user refers to it (those, this list, the results) without naming a collection."
        } else {
            "The session holds no previous result; never use \"input\": \"last_result\"."
        };
        format!(
            "You plan actions for a CRM assistant. Turn the user's message into a JSON plan.\n\
             Output ONLY one JSON object:\n\
             {{\"intent\": one of record_query|aggregation|transform|metric|chart|export|mutation|bi_embed|report|unrecognized,\n \
             \"summary\": one sentence,\n \
             \"steps\": [{{\"tool\": name, \"args\": object, \"input\"?: step number | \"last_result\"}}]}}\n\n\
             Rules:\n\
             - Use only these tools, with exactly these parameters:\n{}\n\
             - Read only these collections (sample fields shown):\n{}\n\
             - A step that consumes a table reads the previous step unless \"input\" says otherwise.\n\
             - Reads come before transforms; transforms come before charts and exports.\n\
             - A crm.* step is always the only step of its plan.\n\
             - {}\n\
             - If nothing in the message is actionable, return intent \"unrecognized\" and no steps.\n\
             No markdown, no explanation.",
            self.registry.catalog(),
            schema_catalog(&ctx.schema),
            last_result
        )
    }

    fn messages(&self, ctx: &PlanningContext) -> Vec<Message> {
        let mut messages = vec![Message::system(self.system_prompt(ctx))];
        let skip = ctx.history.len().saturating_sub(HISTORY_TURNS);
        for turn in ctx.history.iter().skip(skip) {
            messages.push(match turn.role {
                TurnRole::User => Message::user(turn.text.clone()),
                TurnRole::Agent => Message::assistant(turn.text.clone()),
            });
        }
        messages.push(Message::user(ctx.message.clone()));
        messages
    }

    /// Ask the model for a draft and validate it
    pub async fn draft(&self, ctx: &PlanningContext) -> Result<Plan, EngineError> {
        let messages = self.messages(ctx);
        let completion = tokio::time::timeout(self.deadline, self.provider.complete(&messages))
            .await
            .map_err(|_| EngineError::Reasoning(format!("no answer within {}s", self.deadline.as_secs())))?
            .map_err(|e| EngineError::Reasoning(e.to_string()))?;

        let value = extract_json(&completion)
            .ok_or_else(|| EngineError::Reasoning("completion holds no JSON object".to_string()))?;
        let raw: RawPlan = serde_json::from_value(value)
            .map_err(|e| EngineError::Reasoning(format!("malformed plan: {}", e)))?;

        let plan = self.to_plan(raw, ctx)?;
        validate_plan_strict(&plan, &self.registry)?;
        Ok(plan)
    }

    fn to_plan(&self, raw: RawPlan, ctx: &PlanningContext) -> Result<Plan, EngineError> {
        let intent = match raw.intent.as_deref() {
            Some(name) => Intent::parse(name)
                .ok_or_else(|| EngineError::Reasoning(format!("unknown intent '{}'", name)))?,
            None => return Err(EngineError::Reasoning("draft names no intent".to_string())),
        };

        if raw.steps.is_empty() {
            return Err(EngineError::Reasoning(format!(
                "draft for intent '{}' has no steps",
                intent
            )));
        }
        if intent == Intent::Unrecognized {
            return Err(EngineError::Reasoning("unrecognized draft carries steps".to_string()));
        }

        let mut plan = Plan::new(intent);
        plan.summary = raw.summary.filter(|s| !s.trim().is_empty());

        for (index, raw_step) in raw.steps.into_iter().enumerate() {
            let id = index + 1;
            let tool = self.registry.resolve(&raw_step.tool)?;
            let input = match &raw_step.input {
                Value::Null => {
                    if tool.consumes_table() && id > 1 {
                        StepInput::Step(id - 1)
                    } else {
                        StepInput::None
                    }
                }
                Value::Number(n) => match n.as_u64() {
                    Some(source) => StepInput::Step(source as usize),
                    None => {
                        return Err(EngineError::validation(
                            "plan",
                            format!("step {} reads from step {}, which is not a step number", id, n),
                        ))
                    }
                },
                Value::Object(map) => match map.get("step").and_then(Value::as_u64) {
                    Some(n) => StepInput::Step(n as usize),
                    None => return Err(EngineError::validation("plan", format!("step {} has an unreadable input", id))),
                },
                Value::String(s) if s == "last_result" => match &ctx.last_result {
                    Some(table) => StepInput::Carried(table.clone()),
                    None => {
                        return Err(EngineError::validation(
                            "plan",
                            format!("step {} refers to a previous result the session does not have", id),
                        ))
                    }
                },
                other => {
                    return Err(EngineError::validation(
                        "plan",
                        format!("step {} has an unreadable input {}", id, other),
                    ))
                }
            };
            let args = match raw_step.args {
                Value::Null => Value::Object(Default::default()),
                args => args,
            };
            plan.steps.push(Step::new(id, tool, args, input));
        }
        Ok(plan)
    }
}

fn schema_catalog(schema: &[CollectionSchema]) -> String {
    if schema.is_empty() {
        return "  (none)".to_string();
    }
    schema
        .iter()
        .map(|c| {
            if c.fields.is_empty() {
                format!("  - {}", c.collection)
            } else {
                format!("  - {}: {}", c.collection, c.fields.join(", "))
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[async_trait]
impl Planner for ReasoningPlanner {
    fn name(&self) -> &str {
        self.provider.name()
    }

    async fn plan(&self, ctx: &PlanningContext) -> Plan {
        match self.draft(ctx).await {
            Ok(plan) => {
                info!(
                    "Reasoning plan accepted from {}: intent={} steps={}",
                    self.provider.name(),
                    plan.intent,
                    plan.steps.len()
                );
                plan
            }
            Err(e) => {
                warn!("Reasoning plan rejected ({}), using rules", e);
                let plan = self.fallback.build(ctx);
                debug!("Fallback plan: intent={}", plan.intent);
                plan
            }
        }
    }
}
