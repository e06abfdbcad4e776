//! Deterministic planner
//!
//! Phrase matching over a closed set of phrasings. Precedence, highest
//! first: record mutation, BI embed, BI card query, report, then analytics.
//! An analytic plan is a source (a collection read, or the session's last
//! result for referential phrases), an optional transform, and an optional
//! terminal step (chart, export or metric). Anything else is unrecognized.

use super::{validate_plan, Planner, PlanningContext};
use crate::conductor::types::{Intent, Plan};
use crate::tools::ToolName;
use crate::transform::MetricKind;
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use regex::Regex;
use sdk::types::Table;
use serde_json::{json, Map, Value};
use std::sync::OnceLock;
use tracing::debug;

const STATUSES: &[(&str, &str)] = &[
    ("qualified", "Qualified"),
    ("proposal", "Proposal"),
    ("negotiation", "Negotiation"),
    ("discovery", "Discovery"),
    ("won", "Won"),
    ("lost", "Lost"),
    ("open", "Open"),
    ("done", "Done"),
];

/// Lead stages counted in a pipeline forecast
const FORECAST_STAGES: [&str; 3] = ["Qualified", "Proposal", "Negotiation"];

const REGIONS: [&str; 4] = ["north", "south", "east", "west"];

const STALE_DEFAULT_DAYS: i64 = 14;

fn compiled(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("Invalid planner pattern"))
}

macro_rules! pattern {
    ($name:ident, $re:expr) => {
        fn $name() -> &'static Regex {
            static RE: OnceLock<Regex> = OnceLock::new();
            compiled(&RE, $re)
        }
    };
}

// Mutations
pattern!(task_re, r"(?i)\b(?:create|add|make|schedule|set\s+up|open)\b.*?\btask\b");
pattern!(note_re, r"(?i)\b(?:add|create|write|leave|attach|post)\b.*?\bnote\b");
pattern!(call_re, r"(?i)\blog(?:ged)?\b.*?\bcall\b");
pattern!(
    activity_re,
    r"(?i)\b(?:log|record|add|create)\b.*?\b(meeting|email|demo|follow[\s-]?up|activity)\b"
);
pattern!(update_re, r"(?i)\b(?:update|mark|set|move|change)\b.*?\blead\b");
pattern!(lead_re, r"(?i)\blead[_\s#-]*(\d+)\b");
pattern!(task_title_re, r"(?i)\btask\b\s*(?:to\b|:|called\b|titled\b|named\b|for\s+me\s+to\b)?\s*(.*)$");
pattern!(
    task_cut_re,
    r"(?i)\s*,?\s+(?:(?:for|on|with|about)\s+lead[_\s#-]*\d+|due\b|assign(?:ed)?\s+to\b|(?:with\s+)?(?:high|medium|low)\s+priority)"
);
pattern!(
    due_re,
    r"(?i)\bdue\s+(?:on\s+)?(today|tomorrow|next\s+week|in\s+(\d+)\s+days?|\d{4}-\d{2}-\d{2})"
);
pattern!(priority_re, r"(?i)\b(high|medium|low)\s+priority\b|\bpriority\s+(high|medium|low)\b");
pattern!(assignee_re, r"(?i)\bassign(?:ed)?\s+to\s+([a-z][a-z'-]*)");
pattern!(said_re, r"(?i)\b(?:saying|that\s+says|reading)\s+(.+)$");
pattern!(direction_re, r"(?i)\b(inbound|outbound|incoming|outgoing)\b");
pattern!(minutes_re, r"(?i)\b(\d+)\s*(?:min|mins|minute|minutes)\b");
pattern!(status_to_re, r"(?i)\b(?:status\s+(?:to|=|as)?|as|to)\s+([a-z]+)\b");

// BI and reports
pattern!(embed_re, r"(?i)\b(embed|embedded|metabase)\b");
pattern!(resource_re, r"(?i)\b(dashboard|question)\b\s*(?:#|no\.?|number|id)?\s*(\d+)?");
pattern!(card_re, r"(?i)\b(?:card|saved\s+question)\s*#?\s*(\d+)\b");
pattern!(report_re, r"(?i)\breport\b");
pattern!(build_re, r"(?i)\b(build|create|generate|make|prepare|produce|compile)\b");
pattern!(
    report_title_re,
    r"(?i)\b(?:build|create|generate|make|prepare|produce|compile)\s+(?:me\s+)?(?:a|an|the)?\s*(.*?)\s*\breport\b"
);

// Analytics
pattern!(referential_re, r"(?i)\b(those|these|them|this\s+list|that\s+list|this\s+filtered\s+list|the\s+results|these\s+results|this\s+table|that\s+table|the\s+same)\b");
pattern!(chart_re, r"(?i)\b(chart|plot|graph|visuali[sz]e|histogram)\b");
pattern!(pie_re, r"(?i)\bpie\b");
pattern!(line_re, r"(?i)\b(line|trend|over\s+time)\b");
pattern!(export_re, r"(?i)\b(export|excel|xlsx|csv|spreadsheet|download)\b");
pattern!(csv_re, r"(?i)\bcsv\b");
pattern!(pivot_re, r"(?i)\bpivot\b.*?\bby\s+([a-z_]+)\s+(?:and|vs\.?|x)\s+([a-z_]+)");
pattern!(group_re, r"(?i)\b(group(?:ed)?|breakdown|break\s+down|broken\s+down|summari[sz]e|split)\b");
pattern!(top_re, r"(?i)\b(top|bottom)\s+(\d+)\b");
pattern!(sort_re, r"(?i)\b(sort(?:ed)?|order(?:ed)?|rank(?:ed)?)\b");
pattern!(desc_re, r"(?i)\b(desc|descending|highest|largest|biggest|most)\b");
pattern!(dimension_re, r"(?i)(?:\b(\w+)\s+)?\b(?:by|per)\s+([a-z_]+)");
pattern!(forecast_re, r"(?i)\bforecast");
pattern!(
    stale_re,
    r"(?i)\b(stale|untouched|inactive|neglected|idle|no\s+(?:recent\s+)?activit(?:y|ies)|not\s+(?:been\s+)?contacted|without\s+(?:any\s+)?activit(?:y|ies))\b"
);
pattern!(days_re, r"(?i)\b(\d+)\s+days?\b");
pattern!(revenue_re, r"(?i)\brevenue\b");

// Metrics
pattern!(conversion_re, r"(?i)\b(conversion|win\s+rate|close\s+rate|won\s+rate)\b");
pattern!(avg_deal_re, r"(?i)\b(?:average|avg|mean)\s+(?:deal|amount|value|size)|\bdeal\s+size\b");
pattern!(
    total_re,
    r"(?i)\btotal\s+(?:pipeline|revenue|amount|value|deal\s+value)\b|\bpipeline\s+(?:value|total|worth)\b|\bhow\s+much\b"
);
pattern!(count_re, r"(?i)\bhow\s+many\b|\b(?:count|number)\s+of\b");

// Filters
pattern!(
    owner_re,
    r"(?i)\b(?:owner\s*(?:is|=|:)?|owned\s+by|belonging\s+to|for\s+rep)\s+([a-z][a-z'-]*)"
);
pattern!(possessive_re, r"\b([A-Z][a-z]+)'s\s+(?:leads|deals|tasks|pipeline|notes|calls|activity)");
pattern!(last_days_re, r"(?i)\b(?:last|past|previous)\s+(\d+)\s+days?\b");
pattern!(last_week_re, r"(?i)\b(?:last|past|this)\s+week\b");
pattern!(last_month_re, r"(?i)\b(?:last|past)\s+month\b");
pattern!(this_month_re, r"(?i)\b(?:this\s+month|mtd|month\s+to\s+date)\b");
pattern!(today_re, r"(?i)\btoday\b");
pattern!(
    amount_re,
    r"(?i)(over|above|greater\s+than|more\s+than|at\s+least|under|below|less\s+than|at\s+most|>=|<=|>|<)\s*\$?\s*(\d[\d,]*(?:\.\d+)?)\s*(k|m)?\b"
);

fn has(re: &Regex, text: &str) -> bool {
    re.is_match(text)
}

fn title_case(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

fn capitalize_first(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Text after the first colon, trimmed
fn after_colon(msg: &str) -> Option<String> {
    let (_, rest) = msg.split_once(':')?;
    let rest = rest.trim();
    (!rest.is_empty()).then(|| rest.to_string())
}

/// `lead 5`, `lead_005`, `lead #5` -> `lead_005`
pub fn lead_id(msg: &str) -> Option<String> {
    let caps = lead_re().captures(msg)?;
    let n: u32 = caps[1].parse().ok()?;
    Some(format!("lead_{:03}", n))
}

fn status_value(word: &str) -> Option<&'static str> {
    let word = word.to_lowercase();
    STATUSES
        .iter()
        .find(|(key, _)| *key == word)
        .map(|(_, value)| *value)
}

/// Earliest collection mentioned in the text
fn collection_in(lower: &str) -> Option<&'static str> {
    pattern!(call_logs_re, r"\b(?:call[\s_-]?logs?|calls)\b");
    pattern!(tasks_re, r"\btasks?\b");
    pattern!(notes_re, r"\bnotes?\b");
    pattern!(activity_words_re, r"\b(?:activity|activities)\b");
    pattern!(
        leads_re,
        r"\b(?:leads?|deals?|pipeline|opportunit(?:y|ies)|prospects?|revenue|sales)\b"
    );

    [
        ("call_logs", call_logs_re()),
        ("tasks", tasks_re()),
        ("notes", notes_re()),
        ("activity", activity_words_re()),
        ("leads", leads_re()),
    ]
    .into_iter()
    .filter_map(|(name, re)| re.find(lower).map(|m| (m.start(), name)))
    .min_by_key(|(start, _)| *start)
    .map(|(_, name)| name)
}

fn owner_field(collection: &str) -> &'static str {
    match collection {
        "leads" => "owner",
        "tasks" => "owner_id",
        _ => "created_by",
    }
}

fn time_field(collection: &str) -> &'static str {
    match collection {
        "activity" => "when",
        "tasks" => "due_date",
        _ => "created_date",
    }
}

fn default_dimension(collection: &str) -> &'static str {
    match collection {
        "notes" => "created_by",
        "call_logs" => "direction",
        "activity" => "type",
        _ => "status",
    }
}

fn dimension_field(word: &str, collection: &str) -> String {
    match word.to_lowercase().as_str() {
        "stage" | "stages" | "status" | "statuses" => "status".to_string(),
        "owner" | "owners" | "rep" | "reps" | "salesperson" | "user" => {
            owner_field(collection).to_string()
        }
        "region" | "regions" | "territory" => "region".to_string(),
        "source" | "sources" | "channel" => "source".to_string(),
        "type" | "types" => "type".to_string(),
        "lead" | "leads" => "lead_id".to_string(),
        other => other.to_string(),
    }
}

/// First `by X` / `per X` that is not `owned by`, `created by` and the like
fn dimension(lower: &str, collection: &str) -> Option<String> {
    dimension_re()
        .captures_iter(lower)
        .filter(|caps| {
            !matches!(
                caps.get(1).map(|m| m.as_str()),
                Some("owned" | "created" | "assigned" | "logged" | "written")
            )
        })
        .map(|caps| dimension_field(&caps[2], collection))
        .next()
}

/// One extracted condition, expressible as a filter document or a
/// transform expression
#[derive(Debug, Clone, PartialEq)]
struct Criterion {
    field: String,
    op: &'static str,
    value: Value,
}

impl Criterion {
    fn new(field: &str, op: &'static str, value: Value) -> Self {
        Self {
            field: field.to_string(),
            op,
            value,
        }
    }
}

fn filter_document(criteria: &[Criterion]) -> Map<String, Value> {
    let mut filter = Map::new();
    for c in criteria {
        let condition = if c.op == "$eq" {
            c.value.clone()
        } else {
            let mut op = Map::new();
            op.insert(c.op.to_string(), c.value.clone());
            Value::Object(op)
        };
        if let (Some(Value::Object(existing)), Value::Object(extra)) =
            (filter.get_mut(&c.field), &condition)
        {
            existing.extend(extra.clone());
            continue;
        }
        filter.insert(c.field.clone(), condition);
    }
    filter
}

fn literal(value: &Value) -> String {
    match value {
        Value::String(s) => format!("'{}'", s),
        other => other.to_string(),
    }
}

/// The same criteria as a row filter expression (OR of ANDs)
fn filter_expression(criteria: &[Criterion]) -> String {
    let mut groups: Vec<Vec<String>> = vec![Vec::new()];
    for c in criteria {
        match (c.op, &c.value) {
            ("$in", Value::Array(options)) => {
                groups = groups
                    .iter()
                    .flat_map(|g| {
                        options.iter().map(move |o| {
                            let mut g = g.clone();
                            g.push(format!("{} == {}", c.field, literal(o)));
                            g
                        })
                    })
                    .collect();
            }
            ("$nin", Value::Array(options)) => {
                for g in groups.iter_mut() {
                    g.extend(options.iter().map(|o| format!("{} != {}", c.field, literal(o))));
                }
            }
            (op, value) => {
                let symbol = match op {
                    "$gt" => ">",
                    "$gte" => ">=",
                    "$lt" => "<",
                    "$lte" => "<=",
                    "$ne" => "!=",
                    _ => "==",
                };
                for g in groups.iter_mut() {
                    g.push(format!("{} {} {}", c.field, symbol, literal(value)));
                }
            }
        }
    }
    groups
        .into_iter()
        .map(|g| g.join(" and "))
        .collect::<Vec<_>>()
        .join(" or ")
}

fn window_start(lower: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if let Some(caps) = last_days_re().captures(lower) {
        let days: i64 = caps[1].parse().ok()?;
        return Some(now - Duration::days(days));
    }
    if has(last_week_re(), lower) {
        return Some(now - Duration::days(7));
    }
    if has(last_month_re(), lower) {
        return Some(now - Duration::days(30));
    }
    if has(this_month_re(), lower) {
        return Utc
            .with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
            .single();
    }
    if has(today_re(), lower) {
        return Utc
            .with_ymd_and_hms(now.year(), now.month(), now.day(), 0, 0, 0)
            .single();
    }
    None
}

fn amount_criterion(lower: &str) -> Option<Criterion> {
    let caps = amount_re().captures(lower)?;
    let op = match caps[1].split_whitespace().collect::<Vec<_>>().join(" ").as_str() {
        "over" | "above" | "greater than" | "more than" | ">" => "$gt",
        "at least" | ">=" => "$gte",
        "under" | "below" | "less than" | "<" => "$lt",
        _ => "$lte",
    };
    let mut amount: f64 = caps[2].replace(',', "").parse().ok()?;
    match caps.get(3).map(|m| m.as_str()) {
        Some("k") => amount *= 1_000.0,
        Some("m") => amount *= 1_000_000.0,
        _ => {}
    }
    Some(Criterion::new("amount", op, crate::store::value::number_value(amount)))
}

/// Conditions stated in the message for `collection`
fn extract_criteria(
    msg: &str,
    lower: &str,
    collection: &str,
    now: DateTime<Utc>,
    with_window: bool,
) -> Vec<Criterion> {
    let mut criteria = Vec::new();

    // Status words
    let mut statuses: Vec<&str> = Vec::new();
    let mut exclude: Vec<&str> = Vec::new();
    for word in lower.split(|c: char| !c.is_ascii_alphanumeric()) {
        match (collection, word) {
            ("leads", "open" | "active") => exclude.extend(["Won", "Lost"]),
            ("leads", "closed") => statuses.extend(["Won", "Lost"]),
            ("tasks", "completed" | "finished") => statuses.push("Done"),
            ("tasks", "pending" | "outstanding") => statuses.push("Open"),
            ("leads", w) | ("tasks", w) => {
                if let Some(status) = status_value(w) {
                    let applies = match collection {
                        "tasks" => matches!(status, "Open" | "Done"),
                        _ => !matches!(status, "Open" | "Done"),
                    };
                    if applies {
                        statuses.push(status);
                    }
                }
            }
            _ => {}
        }
    }
    if collection == "leads" && statuses.is_empty() && has(revenue_re(), lower) {
        statuses.push("Won");
    }
    statuses.dedup();
    match statuses.as_slice() {
        [] => {}
        [one] => criteria.push(Criterion::new("status", "$eq", json!(one))),
        many => criteria.push(Criterion::new("status", "$in", json!(many))),
    }
    if !exclude.is_empty() && statuses.is_empty() {
        criteria.push(Criterion::new("status", "$nin", json!(exclude)));
    }

    // Owner
    let owner = owner_re()
        .captures(msg)
        .map(|c| c[1].to_string())
        .filter(|w| !matches!(w.to_lowercase().as_str(), "the" | "a" | "an" | "me" | "my"))
        .or_else(|| possessive_re().captures(msg).map(|c| c[1].to_string()));
    if let Some(owner) = owner {
        criteria.push(Criterion::new(owner_field(collection), "$eq", json!(title_case(&owner))));
    }

    // Lead reference on related collections
    if collection != "leads" {
        if let Some(id) = lead_id(msg) {
            criteria.push(Criterion::new("lead_id", "$eq", json!(id)));
        }
    }

    if collection == "leads" {
        for region in REGIONS {
            if lower.split(|c: char| !c.is_ascii_alphanumeric()).any(|w| w == region) {
                criteria.push(Criterion::new("region", "$eq", json!(title_case(region))));
                break;
            }
        }
        if let Some(amount) = amount_criterion(lower) {
            criteria.push(amount);
        }
    }

    if with_window {
        if let Some(start) = window_start(lower, now) {
            criteria.push(Criterion::new(time_field(collection), "$gte", json!(start.to_rfc3339())));
        }
    }

    criteria
}

/// Where an analytic plan gets its first table
enum Source {
    Read {
        collection: &'static str,
        args: Value,
    },
    Carried(Table),
}

impl Source {
    fn has_amount(&self) -> bool {
        match self {
            Source::Read { collection, .. } => *collection == "leads",
            Source::Carried(table) => table.column("amount").is_some_and(|c| c.kind.is_numeric()),
        }
    }
}

fn read_args(collection: &str, criteria: &[Criterion], pipeline: Vec<Value>) -> Value {
    let mut args = Map::new();
    args.insert("collection".to_string(), json!(collection));
    let filter = filter_document(criteria);
    if !filter.is_empty() {
        args.insert("filter".to_string(), Value::Object(filter));
    }
    if !pipeline.is_empty() {
        args.insert("pipeline".to_string(), Value::Array(pipeline));
    }
    Value::Object(args)
}

fn assemble(intent: Intent, source: Source, consumers: Vec<(ToolName, Value)>) -> Option<Plan> {
    let mut plan = Plan::new(intent);
    let mut consumers = consumers.into_iter();
    match source {
        Source::Read { args, .. } => plan = plan.then(ToolName::StoreRead, args),
        Source::Carried(table) => {
            let (tool, args) = consumers.next()?;
            plan = plan.then_carried(tool, args, table);
        }
    }
    for (tool, args) in consumers {
        plan = plan.then(tool, args);
    }
    Some(plan)
}

/// Transform chosen by the message, if any
enum Shape {
    Group(String),
    Pivot(String, String),
    Sort { by: String, ascending: bool, limit: Option<usize> },
}

impl Shape {
    fn args(&self, has_amount: bool) -> Value {
        match self {
            Shape::Group(by) => json!({"operation": "group", "by": [by]}),
            Shape::Pivot(index, columns) => {
                let (values, agg) = if has_amount { ("amount", "sum") } else { ("_id", "count") };
                json!({"operation": "pivot", "index": index, "columns": [columns], "values": values, "aggfunc": agg})
            }
            Shape::Sort { by, ascending, limit } => {
                let mut args = json!({"operation": "sort", "by": [by], "ascending": ascending});
                if let Some(limit) = limit {
                    args["limit"] = json!(limit);
                }
                args
            }
        }
    }

    fn intent(&self) -> Intent {
        match self {
            Shape::Group(_) => Intent::Aggregation,
            _ => Intent::Transform,
        }
    }
}

/// Deterministic phrase-matching planner
#[derive(Debug, Clone, Copy, Default)]
pub struct RulePlanner;

impl RulePlanner {
    pub fn new() -> Self {
        Self
    }

    pub fn build(&self, ctx: &PlanningContext) -> Plan {
        self.build_at(ctx, Utc::now())
    }

    /// Plan relative to a fixed clock
    pub fn build_at(&self, ctx: &PlanningContext, now: DateTime<Utc>) -> Plan {
        let msg = ctx.message.trim();
        if msg.is_empty() {
            return Plan::unrecognized();
        }
        let lower = msg.to_lowercase();

        let plan = mutation(msg, &lower, now)
            .or_else(|| bi_embed(&lower))
            .or_else(|| bi_query(&lower))
            .or_else(|| report(msg, &lower))
            .or_else(|| analytics(msg, &lower, ctx.last_result.as_ref(), now))
            .unwrap_or_else(Plan::unrecognized);
        debug_assert!(
            validate_plan(&plan).is_ok(),
            "rule plan for {:?} is malformed",
            msg
        );

        debug!(
            "Rule planner: intent={} steps={}",
            plan.intent,
            plan.steps.len()
        );
        plan
    }
}

#[async_trait]
impl Planner for RulePlanner {
    fn name(&self) -> &str {
        "rules"
    }

    async fn plan(&self, ctx: &PlanningContext) -> Plan {
        self.build(ctx)
    }
}

fn single(tool: ToolName, args: Value, summary: String) -> Option<Plan> {
    Some(Plan::new(Intent::Mutation).then(tool, args).with_summary(summary))
}

fn insert_opt(args: &mut Map<String, Value>, key: &str, value: Option<String>) {
    if let Some(value) = value {
        args.insert(key.to_string(), Value::String(value));
    }
}

fn due_date(lower: &str, now: DateTime<Utc>) -> Option<String> {
    let caps = due_re().captures(lower)?;
    let today = now.date_naive();
    let day = match &caps[1] {
        "today" => today,
        "tomorrow" => today + Duration::days(1),
        s if s.starts_with("next") => today + Duration::days(7),
        s if s.starts_with("in") => today + Duration::days(caps.get(2)?.as_str().parse().ok()?),
        s => NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()?,
    };
    Some(day.format("%Y-%m-%d").to_string())
}

fn mutation(msg: &str, lower: &str, now: DateTime<Utc>) -> Option<Plan> {
    let lead = lead_id(msg);

    if has(task_re(), msg) {
        let title = task_title_re()
            .captures(msg)
            .map(|caps| {
                let rest = caps[1].trim();
                let end = task_cut_re().find(rest).map(|m| m.start()).unwrap_or(rest.len());
                rest[..end].trim_matches(|c: char| c.is_whitespace() || ".,;:".contains(c)).to_string()
            })
            .filter(|t| !t.is_empty())
            .map(|t| capitalize_first(&t));

        let mut args = Map::new();
        insert_opt(&mut args, "title", title);
        insert_opt(&mut args, "lead_id", lead);
        insert_opt(&mut args, "due_date", due_date(lower, now));
        insert_opt(
            &mut args,
            "owner_id",
            assignee_re().captures(msg).map(|c| title_case(&c[1])),
        );
        insert_opt(
            &mut args,
            "priority",
            priority_re().captures(lower).and_then(|c| {
                c.get(1).or_else(|| c.get(2)).map(|m| title_case(m.as_str()))
            }),
        );
        return single(ToolName::CrmCreateTask, Value::Object(args), "Create a task".to_string());
    }

    if has(note_re(), msg) {
        let body = after_colon(msg).or_else(|| said_re().captures(msg).map(|c| c[1].trim().to_string()));
        let mut args = Map::new();
        insert_opt(&mut args, "lead_id", lead);
        insert_opt(&mut args, "body", body);
        return single(ToolName::CrmCreateNote, Value::Object(args), "Add a note".to_string());
    }

    if has(call_re(), msg) {
        let direction = direction_re().captures(lower).map(|c| match &c[1] {
            "incoming" | "inbound" => "inbound".to_string(),
            _ => "outbound".to_string(),
        });
        let mut args = Map::new();
        insert_opt(&mut args, "lead_id", lead);
        insert_opt(&mut args, "direction", direction);
        if let Some(minutes) = minutes_re().captures(lower).and_then(|c| c[1].parse::<u64>().ok()) {
            args.insert("duration_seconds".to_string(), json!(minutes * 60));
        }
        insert_opt(&mut args, "summary", after_colon(msg));
        return single(ToolName::CrmLogCall, Value::Object(args), "Log a call".to_string());
    }

    if let Some(caps) = activity_re().captures(msg) {
        let kind = match caps[1].to_lowercase().as_str() {
            "activity" => None,
            k if k.starts_with("follow") => Some("followup".to_string()),
            k => Some(k.to_string()),
        };
        let mut args = Map::new();
        insert_opt(&mut args, "lead_id", lead);
        insert_opt(&mut args, "type", kind);
        insert_opt(&mut args, "notes", after_colon(msg));
        return single(ToolName::CrmCreateActivity, Value::Object(args), "Record an activity".to_string());
    }

    if has(update_re(), msg) {
        let mut fields = Map::new();
        let status = status_to_re()
            .captures_iter(lower)
            .find_map(|c| status_value(&c[1]))
            .map(str::to_string);
        if let Some(status) = status {
            fields.insert("status".to_string(), Value::String(status));
        }
        let mut args = Map::new();
        insert_opt(&mut args, "lead_id", lead);
        args.insert("fields".to_string(), Value::Object(fields));
        return single(ToolName::CrmUpdateRecord, Value::Object(args), "Update a lead".to_string());
    }

    None
}

fn bi_embed(lower: &str) -> Option<Plan> {
    let embed_word = has(embed_re(), lower);
    if !embed_word && has(card_re(), lower) {
        return None;
    }
    let resource = resource_re().captures(lower);
    let triggered = embed_word
        || resource
            .as_ref()
            .is_some_and(|c| &c[1] == "dashboard" || c.get(2).is_some());
    if !triggered {
        return None;
    }

    let (resource_type, resource_id) = resource
        .map(|c| {
            let id = c.get(2).and_then(|m| m.as_str().parse::<i64>().ok()).unwrap_or(1);
            (c[1].to_string(), id)
        })
        .unwrap_or_else(|| ("dashboard".to_string(), 1));

    let mut args = json!({"resource_type": resource_type, "resource_id": resource_id});
    if lower.contains("dark") {
        args["theme"] = json!("dark");
    }
    Some(
        Plan::new(Intent::BiEmbed)
            .then(ToolName::BiEmbed, args)
            .with_summary(format!("Embed {} {}", resource_type, resource_id)),
    )
}

fn bi_query(lower: &str) -> Option<Plan> {
    let card_id: i64 = card_re().captures(lower)?[1].parse().ok()?;
    if has(report_re(), lower) {
        return None;
    }
    let plan = Plan::new(Intent::RecordQuery).then(ToolName::BiQuery, json!({"card_id": card_id}));
    if has(export_re(), lower) {
        let format = if has(csv_re(), lower) { "csv" } else { "xlsx" };
        let mut plan = plan.then(
            ToolName::TableExport,
            json!({"format": format, "sheet_name": format!("Card {}", card_id)}),
        );
        plan.intent = Intent::Export;
        return Some(plan.with_summary(format!("Export BI card {}", card_id)));
    }
    Some(plan.with_summary(format!("Run BI card {}", card_id)))
}

fn grouped_pipeline(field: &str) -> Value {
    let mut project = Map::new();
    project.insert("_id".to_string(), json!(0));
    project.insert(field.to_string(), json!("$_id"));
    project.insert("count".to_string(), json!(1));
    project.insert("total_amount".to_string(), json!(1));
    json!([
        {"$group": {"_id": format!("${}", field), "count": {"$sum": 1}, "total_amount": {"$sum": "$amount"}}},
        {"$project": project},
        {"$sort": {"total_amount": -1}}
    ])
}

fn report(msg: &str, lower: &str) -> Option<Plan> {
    if !(has(report_re(), lower) && has(build_re(), lower)) {
        return None;
    }
    let title = report_title_re()
        .captures(msg)
        .map(|c| c[1].trim().to_string())
        .filter(|t| !t.is_empty())
        .map(|t| {
            let words: Vec<String> = t.split_whitespace().map(title_case).collect();
            format!("{} Report", words.join(" "))
        })
        .unwrap_or_else(|| "Pipeline Report".to_string());

    let mut sheets = vec![
        json!({"name": "By Stage", "source": "store", "collection": "leads", "pipeline": grouped_pipeline("status")}),
        json!({"name": "By Owner", "source": "store", "collection": "leads", "pipeline": grouped_pipeline("owner")}),
    ];
    if let Some(card_id) = card_re().captures(lower).and_then(|c| c[1].parse::<i64>().ok()) {
        sheets.push(json!({"name": format!("Card {}", card_id), "source": "bi_card", "card_id": card_id}));
    }

    Some(
        Plan::new(Intent::Report)
            .then(ToolName::ReportBuild, json!({"title": title, "sheets": sheets}))
            .with_summary(format!("Build {}", title)),
    )
}

fn metric_in(lower: &str) -> Option<MetricKind> {
    if has(conversion_re(), lower) {
        Some(MetricKind::ConversionRate)
    } else if has(avg_deal_re(), lower) {
        Some(MetricKind::AvgDealSize)
    } else if has(total_re(), lower) {
        Some(MetricKind::TotalPipeline)
    } else if has(count_re(), lower) {
        Some(MetricKind::RowCount)
    } else {
        None
    }
}

fn shape_in(lower: &str, collection: &str, has_amount: bool) -> Option<Shape> {
    if let Some(caps) = pivot_re().captures(lower) {
        return Some(Shape::Pivot(
            dimension_field(&caps[1], collection),
            dimension_field(&caps[2], collection),
        ));
    }
    let by = dimension(lower, collection);
    if has(group_re(), lower) {
        return Some(Shape::Group(by.unwrap_or_else(|| default_dimension(collection).to_string())));
    }
    let default_sort = if has_amount { "amount".to_string() } else { default_dimension(collection).to_string() };
    if let Some(caps) = top_re().captures(lower) {
        let limit = caps[2].parse().ok();
        return Some(Shape::Sort {
            by: by.unwrap_or(default_sort),
            ascending: caps[1].eq_ignore_ascii_case("bottom"),
            limit,
        });
    }
    if has(sort_re(), lower) {
        return Some(Shape::Sort {
            by: by.unwrap_or(default_sort),
            ascending: !has(desc_re(), lower),
            limit: None,
        });
    }
    None
}

fn analytics(
    msg: &str,
    lower: &str,
    last_result: Option<&Table>,
    now: DateTime<Utc>,
) -> Option<Plan> {
    let named = collection_in(lower);
    let stale = has(stale_re(), lower);
    let forecast = has(forecast_re(), lower);
    let collection = if stale || forecast { "leads" } else { named.unwrap_or("leads") };

    let carried = match (named, last_result) {
        (None, Some(table)) if has(referential_re(), lower) => Some(table.clone()),
        _ => None,
    };

    let mut criteria = extract_criteria(msg, lower, collection, now, !stale);
    if forecast && !criteria.iter().any(|c| c.field == "status") {
        criteria.push(Criterion::new("status", "$in", json!(FORECAST_STAGES)));
    }

    let mut consumers: Vec<(ToolName, Value)> = Vec::new();
    let source = match carried {
        Some(table) => {
            if !criteria.is_empty() {
                consumers.push((
                    ToolName::TableTransform,
                    json!({"operation": "filter", "where": filter_expression(&criteria)}),
                ));
            }
            Source::Carried(table)
        }
        None => {
            let mut pipeline = Vec::new();
            if stale {
                let days = days_re()
                    .captures(lower)
                    .and_then(|c| c[1].parse::<i64>().ok())
                    .unwrap_or(STALE_DEFAULT_DAYS);
                let cutoff = (now - Duration::days(days)).to_rfc3339();
                pipeline = vec![
                    json!({"$lookup": {"from": "activity", "localField": "_id", "foreignField": "lead_id", "as": "activities"}}),
                    json!({"$match": {"$nor": [{"activities.when": {"$gte": cutoff}}]}}),
                    json!({"$project": {"activities": 0}}),
                ];
            }
            Source::Read {
                collection,
                args: read_args(collection, &criteria, pipeline),
            }
        }
    };

    let has_amount = source.has_amount();
    let shape = shape_in(lower, collection, has_amount);
    let value_column = if has_amount { "total_amount" } else { "count" };

    // Chart
    if has(chart_re(), lower) || (forecast && !has(export_re(), lower)) {
        let kind = if has(pie_re(), lower) {
            "pie"
        } else if has(line_re(), lower) {
            "line"
        } else {
            "bar"
        };
        let x = match &shape {
            Some(Shape::Group(by)) => by.clone(),
            _ => dimension(lower, collection).unwrap_or_else(|| default_dimension(collection).to_string()),
        };
        let already_grouped = matches!(&source, Source::Carried(t)
            if t.column(&x).is_some() && (t.column("count").is_some() || t.column("total_amount").is_some()));
        let y = match &source {
            Source::Carried(t) if already_grouped => {
                if t.column("total_amount").is_some() { "total_amount" } else { "count" }
            }
            _ => value_column,
        };
        if !already_grouped {
            consumers.push((ToolName::TableTransform, json!({"operation": "group", "by": [x]})));
        }
        let title = format!("{} by {}", title_case(collection).replace('_', " "), x);
        consumers.push((
            ToolName::ChartRender,
            json!({"kind": kind, "x": x, "y": y, "title": title}),
        ));
        return assemble(Intent::Chart, source, consumers).map(|p| p.with_summary(title));
    }

    // Export
    if has(export_re(), lower) {
        if let Some(shape) = &shape {
            consumers.push((ToolName::TableTransform, shape.args(has_amount)));
        } else if let Some(by) = dimension(lower, collection) {
            consumers.push((ToolName::TableTransform, json!({"operation": "group", "by": [by]})));
        }
        let mut args = Map::new();
        if has(csv_re(), lower) {
            args.insert("format".to_string(), json!("csv"));
        } else {
            args.insert("format".to_string(), json!("xlsx"));
        }
        if let Source::Read { collection, .. } = &source {
            args.insert("sheet_name".to_string(), json!(title_case(collection).replace('_', " ")));
        }
        consumers.push((ToolName::TableExport, Value::Object(args)));
        return assemble(Intent::Export, source, consumers)
            .map(|p| p.with_summary(format!("Export {}", collection.replace('_', " "))));
    }

    // Metric
    if let Some(metric) = metric_in(lower) {
        let grouped_count = metric == MetricKind::RowCount && dimension(lower, collection).is_some();
        if !grouped_count {
            consumers.push((ToolName::MetricCalculate, json!({"metric": metric.as_str()})));
            return assemble(Intent::Metric, source, consumers)
                .map(|p| p.with_summary(format!("Calculate {}", metric.as_str().replace('_', " "))));
        }
        let by = dimension(lower, collection).unwrap_or_else(|| default_dimension(collection).to_string());
        consumers.push((ToolName::TableTransform, json!({"operation": "group", "by": [by]})));
        return assemble(Intent::Aggregation, source, consumers)
            .map(|p| p.with_summary(format!("Count {} by {}", collection.replace('_', " "), by)));
    }

    // Transform
    if let Some(shape) = shape {
        consumers.push((ToolName::TableTransform, shape.args(has_amount)));
        return assemble(shape.intent(), source, consumers)
            .map(|p| p.with_summary(format!("Transform {}", collection.replace('_', " "))));
    }

    // Plain read, or a referential filter over the last result
    match source {
        Source::Carried(_) if !consumers.is_empty() => {
            assemble(Intent::Transform, source, consumers).map(|p| p.with_summary("Filter the previous result"))
        }
        Source::Read { .. } if named.is_some() || stale || forecast => {
            assemble(Intent::RecordQuery, source, consumers)
                .map(|p| p.with_summary(format!("Read {}", collection.replace('_', " "))))
        }
        _ => None,
    }
}
