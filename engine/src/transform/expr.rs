//! Row filter expressions
//!
//! Grammar (keywords case-insensitive):
//!
//! ```text
//! expr   := group (("or" | "||") group)*
//! group  := clause (("and" | "&&" | "&") clause)*
//! clause := field op literal
//! op     := == | = | != | > | >= | < | <= | contains
//! ```
//!
//! Literals are quoted strings, numbers, `true`, `false`, `null`, or a bare
//! word taken as a string.

use crate::store::value::{compare_values, get_path, values_equal};
use regex::Regex;
use sdk::errors::EngineError;
use sdk::types::Row;
use serde_json::Value;
use std::cmp::Ordering;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Clause {
    pub field: String,
    pub op: CompareOp,
    pub value: Value,
}

/// Disjunction of conjunctions
#[derive(Debug, Clone, PartialEq)]
pub struct FilterExpr {
    pub groups: Vec<Vec<Clause>>,
}

fn invalid(message: impl Into<String>) -> EngineError {
    EngineError::validation("table.transform", message)
}

fn token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"'[^']*'|"[^"]*"|\S+"#).expect("Invalid token pattern")
    })
}

fn clause_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?is)^\s*([A-Za-z_][\w.]*)\s*(==|!=|>=|<=|=|>|<|\bcontains\b)\s*(.+?)\s*$")
            .expect("Invalid clause pattern")
    })
}

impl FilterExpr {
    pub fn parse(input: &str) -> Result<Self, EngineError> {
        let mut groups: Vec<Vec<Clause>> = Vec::new();
        let mut group: Vec<Clause> = Vec::new();
        let mut current: Vec<&str> = Vec::new();

        for token in token_re().find_iter(input).map(|m| m.as_str()) {
            match token.to_lowercase().as_str() {
                "and" | "&&" | "&" => {
                    group.push(parse_clause(&current.join(" "))?);
                    current.clear();
                }
                "or" | "||" => {
                    group.push(parse_clause(&current.join(" "))?);
                    current.clear();
                    groups.push(std::mem::take(&mut group));
                }
                _ => current.push(token),
            }
        }
        group.push(parse_clause(&current.join(" "))?);
        groups.push(group);

        Ok(Self { groups })
    }

    pub fn matches(&self, row: &Row) -> bool {
        self.groups
            .iter()
            .any(|group| group.iter().all(|clause| clause.matches(row)))
    }
}

fn parse_clause(text: &str) -> Result<Clause, EngineError> {
    if text.trim().is_empty() {
        return Err(invalid("empty condition in filter expression"));
    }
    let caps = clause_re()
        .captures(text)
        .ok_or_else(|| invalid(format!("cannot parse condition '{}'", text)))?;

    let op = match caps[2].to_lowercase().as_str() {
        "==" | "=" => CompareOp::Eq,
        "!=" => CompareOp::Ne,
        ">" => CompareOp::Gt,
        ">=" => CompareOp::Gte,
        "<" => CompareOp::Lt,
        "<=" => CompareOp::Lte,
        _ => CompareOp::Contains,
    };

    Ok(Clause {
        field: caps[1].to_string(),
        op,
        value: parse_literal(&caps[3]),
    })
}

fn parse_literal(raw: &str) -> Value {
    let raw = raw.trim();
    let quoted = (raw.starts_with('\'') && raw.ends_with('\''))
        || (raw.starts_with('"') && raw.ends_with('"'));
    if quoted && raw.len() >= 2 {
        return Value::String(raw[1..raw.len() - 1].to_string());
    }
    match raw.to_lowercase().as_str() {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        "null" | "none" => return Value::Null,
        _ => {}
    }
    if let Ok(i) = raw.parse::<i64>() {
        return Value::from(i);
    }
    if let Ok(f) = raw.parse::<f64>() {
        if let Some(n) = serde_json::Number::from_f64(f) {
            return Value::Number(n);
        }
    }
    Value::String(raw.to_string())
}

impl Clause {
    pub fn matches(&self, row: &Row) -> bool {
        let actual = get_path(row, &self.field);
        match self.op {
            CompareOp::Eq => actual.map_or(self.value.is_null(), |v| values_equal(v, &self.value)),
            CompareOp::Ne => !actual.map_or(self.value.is_null(), |v| values_equal(v, &self.value)),
            CompareOp::Contains => match (actual, &self.value) {
                (Some(Value::String(s)), Value::String(needle)) => {
                    s.to_lowercase().contains(&needle.to_lowercase())
                }
                (Some(Value::Array(items)), target) => {
                    items.iter().any(|item| values_equal(item, target))
                }
                _ => false,
            },
            op => actual
                .and_then(|v| compare_values(v, &self.value))
                .is_some_and(|ord| match op {
                    CompareOp::Gt => ord == Ordering::Greater,
                    CompareOp::Gte => ord != Ordering::Less,
                    CompareOp::Lt => ord == Ordering::Less,
                    _ => ord != Ordering::Greater,
                }),
        }
    }
}
