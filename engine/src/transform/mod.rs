//! Tabular transform facility
//!
//! Pure functions over in-memory [`Table`]s: select, filter, sort, group and
//! pivot. Row order is preserved wherever the operation does not define one;
//! groups and pivot rows appear in order of first occurrence.

pub mod expr;
pub mod metrics;

use crate::store::value::{as_number, display, get_path, number_value, sort_order};
use sdk::errors::EngineError;
use sdk::types::{Row, Table};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;

pub use expr::FilterExpr;
pub use metrics::{calculate, MetricKind};

/// Aggregation applied to a value column
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggFunc {
    #[default]
    Sum,
    Count,
    #[serde(alias = "avg", alias = "average")]
    Mean,
    Min,
    Max,
}

impl AggFunc {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggFunc::Sum => "sum",
            AggFunc::Count => "count",
            AggFunc::Mean => "mean",
            AggFunc::Min => "min",
            AggFunc::Max => "max",
        }
    }

    /// Output column name for an aggregated value column
    pub fn column_name(&self, value: &str) -> String {
        match self {
            AggFunc::Sum => format!("total_{}", value),
            AggFunc::Count => "count".to_string(),
            AggFunc::Mean => format!("avg_{}", value),
            AggFunc::Min => format!("min_{}", value),
            AggFunc::Max => format!("max_{}", value),
        }
    }

    fn apply(&self, values: &[f64]) -> Value {
        match self {
            AggFunc::Count => Value::from(values.len() as u64),
            AggFunc::Sum => number_value(values.iter().sum()),
            AggFunc::Mean if values.is_empty() => Value::Null,
            AggFunc::Mean => number_value(values.iter().sum::<f64>() / values.len() as f64),
            AggFunc::Min => values
                .iter()
                .copied()
                .reduce(f64::min)
                .map(number_value)
                .unwrap_or(Value::Null),
            AggFunc::Max => values
                .iter()
                .copied()
                .reduce(f64::max)
                .map(number_value)
                .unwrap_or(Value::Null),
        }
    }
}

/// Validated transform operation
#[derive(Debug, Clone, PartialEq)]
pub enum TransformOp {
    Select {
        columns: Vec<String>,
    },
    Filter {
        expr: FilterExpr,
    },
    Sort {
        by: Vec<String>,
        ascending: bool,
        limit: Option<usize>,
    },
    Group {
        by: Vec<String>,
        agg: AggFunc,
        value: Option<String>,
    },
    Pivot {
        index: String,
        columns: String,
        values: String,
        agg: AggFunc,
    },
}

impl TransformOp {
    pub fn name(&self) -> &'static str {
        match self {
            TransformOp::Select { .. } => "select",
            TransformOp::Filter { .. } => "filter",
            TransformOp::Sort { .. } => "sort",
            TransformOp::Group { .. } => "group",
            TransformOp::Pivot { .. } => "pivot",
        }
    }
}

/// Accept either `"status"` or `["status", "owner"]`
pub fn de_string_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(s) => vec![s],
        OneOrMany::Many(v) => v,
    })
}

fn invalid(message: impl Into<String>) -> EngineError {
    EngineError::validation("table.transform", message)
}

fn require_columns(table: &Table, columns: &[String]) -> Result<(), EngineError> {
    if table.is_empty() {
        return Ok(());
    }
    let missing: Vec<&str> = columns
        .iter()
        .filter(|c| table.column(c).is_none() && !c.contains('.'))
        .map(String::as_str)
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(invalid(format!(
            "unknown column(s) {}; available: {}",
            missing.join(", "),
            table.column_names().join(", ")
        )))
    }
}

/// Apply one operation to a table; the result keeps the input's sources
pub fn apply(table: Table, op: &TransformOp) -> Result<Table, EngineError> {
    let sources = table.sources.clone();
    let result = match op {
        TransformOp::Select { columns } => select(table, columns),
        TransformOp::Filter { expr } => Ok(filter(table, expr)),
        TransformOp::Sort {
            by,
            ascending,
            limit,
        } => sort(table, by, *ascending, *limit),
        TransformOp::Group { by, agg, value } => group(table, by, *agg, value.as_deref()),
        TransformOp::Pivot {
            index,
            columns,
            values,
            agg,
        } => pivot(table, index, columns, values, *agg),
    }?;
    Ok(result.with_sources(sources))
}

pub fn select(table: Table, columns: &[String]) -> Result<Table, EngineError> {
    require_columns(&table, columns)?;
    let rows = table
        .rows
        .into_iter()
        .map(|row| {
            columns
                .iter()
                .filter_map(|c| get_path(&row, c).map(|v| (c.clone(), v.clone())))
                .collect::<Row>()
        })
        .collect();
    Ok(Table::from_rows(rows))
}

pub fn filter(table: Table, expr: &FilterExpr) -> Table {
    let Table {
        columns,
        rows,
        sources,
    } = table;
    Table {
        columns,
        rows: rows.into_iter().filter(|row| expr.matches(row)).collect(),
        sources,
    }
}

pub fn sort(
    table: Table,
    by: &[String],
    ascending: bool,
    limit: Option<usize>,
) -> Result<Table, EngineError> {
    require_columns(&table, by)?;
    let Table {
        columns,
        mut rows,
        sources,
    } = table;
    rows.sort_by(|a, b| {
        for key in by {
            let ord = sort_order(get_path(a, key), get_path(b, key));
            if ord != Ordering::Equal {
                return if ascending { ord } else { ord.reverse() };
            }
        }
        Ordering::Equal
    });
    if let Some(limit) = limit {
        rows.truncate(limit);
    }
    Ok(Table {
        columns,
        rows,
        sources,
    })
}

/// Resolve the value column of a group: explicit, else `amount` when numeric
fn group_value_column(table: &Table, agg: AggFunc, value: Option<&str>) -> Option<String> {
    match value {
        Some(v) => Some(v.to_string()),
        None if agg == AggFunc::Count => None,
        None => table
            .column("amount")
            .filter(|c| c.kind.is_numeric())
            .map(|c| c.name.clone()),
    }
}

/// Group rows by `by`. Output: the key columns, `count`, and the aggregated
/// value column when one applies.
pub fn group(
    table: Table,
    by: &[String],
    agg: AggFunc,
    value: Option<&str>,
) -> Result<Table, EngineError> {
    if by.is_empty() {
        return Err(invalid("group requires at least one 'by' column"));
    }
    require_columns(&table, by)?;
    let value_column = group_value_column(&table, agg, value);
    if let Some(v) = &value_column {
        require_columns(&table, std::slice::from_ref(v))?;
    }

    let mut keys: Vec<Vec<Value>> = Vec::new();
    let mut buckets: Vec<(usize, Vec<f64>)> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for row in &table.rows {
        let key: Vec<Value> = by
            .iter()
            .map(|c| get_path(row, c).cloned().unwrap_or(Value::Null))
            .collect();
        let slot = *index
            .entry(Value::Array(key.clone()).to_string())
            .or_insert_with(|| {
                keys.push(key);
                buckets.push((0, Vec::new()));
                keys.len() - 1
            });
        let bucket = &mut buckets[slot];
        bucket.0 += 1;
        if let Some(v) = value_column.as_deref().and_then(|c| get_path(row, c)).and_then(as_number) {
            bucket.1.push(v);
        }
    }

    let rows = keys
        .into_iter()
        .zip(buckets)
        .map(|(key, (count, values))| {
            let mut out = Row::new();
            for (column, value) in by.iter().zip(key) {
                out.insert(column.clone(), value);
            }
            out.insert("count".to_string(), Value::from(count as u64));
            if let Some(v) = &value_column {
                if agg != AggFunc::Count {
                    out.insert(agg.column_name(v), agg.apply(&values));
                }
            }
            out
        })
        .collect();

    Ok(Table::from_rows(rows))
}

/// Spread `columns` values into columns, one row per `index` value
pub fn pivot(
    table: Table,
    index: &str,
    columns: &str,
    values: &str,
    agg: AggFunc,
) -> Result<Table, EngineError> {
    require_columns(
        &table,
        &[index.to_string(), columns.to_string(), values.to_string()],
    )?;

    let mut headers: Vec<String> = Vec::new();
    let mut index_keys: Vec<Value> = Vec::new();
    let mut cells: HashMap<(String, String), Vec<f64>> = HashMap::new();

    for row in &table.rows {
        let idx = get_path(row, index).cloned().unwrap_or(Value::Null);
        let col = get_path(row, columns).map(display).unwrap_or_default();
        let idx_key = idx.to_string();
        if !index_keys.iter().any(|k| k.to_string() == idx_key) {
            index_keys.push(idx);
        }
        if !headers.contains(&col) {
            headers.push(col.clone());
        }
        let entry = cells.entry((idx_key, col)).or_default();
        if let Some(v) = get_path(row, values).and_then(as_number) {
            entry.push(v);
        } else if agg == AggFunc::Count {
            entry.push(0.0);
        }
    }

    let rows = index_keys
        .into_iter()
        .map(|idx| {
            let idx_key = idx.to_string();
            let mut out = Row::new();
            out.insert(index.to_string(), idx);
            for header in &headers {
                let value = cells
                    .get(&(idx_key.clone(), header.clone()))
                    .map(|vals| agg.apply(vals))
                    .unwrap_or(Value::from(0));
                out.insert(header.clone(), value);
            }
            out
        })
        .collect();

    Ok(Table::from_rows(rows))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn table(v: Value) -> Table {
        Table::from_rows(
            v.as_array()
                .unwrap()
                .iter()
                .map(|r| r.as_object().cloned().unwrap())
                .collect(),
        )
    }

    fn leads() -> Table {
        table(json!([
            {"name": "A", "status": "Won", "owner": "Priya", "amount": 100},
            {"name": "B", "status": "Qualified", "owner": "Aryan", "amount": 300},
            {"name": "C", "status": "Won", "owner": "Aryan", "amount": 50},
            {"name": "D", "status": "Lost", "owner": "Priya", "amount": 20},
        ]))
    }

    #[test]
    fn test_group_by_status_defaults_to_amount_sum() {
        let out = group(leads(), &["status".to_string()], AggFunc::Sum, None).unwrap();
        assert_eq!(out.column_names(), vec!["status", "count", "total_amount"]);
        assert_eq!(out.len(), 3);
        assert_eq!(out.rows[0]["status"], "Won");
        assert_eq!(out.rows[0]["count"], json!(2));
        assert_eq!(out.rows[0]["total_amount"], json!(150));
    }

    #[test]
    fn test_sources_survive_every_operation() {
        let sourced = leads().with_sources(["leads"]);
        let op = TransformOp::Group {
            by: vec!["owner".to_string()],
            agg: AggFunc::Count,
            value: None,
        };
        assert_eq!(apply(sourced.clone(), &op).unwrap().sources, vec!["leads"]);

        let expr = FilterExpr::parse("status == 'Won'").unwrap();
        let filtered = apply(sourced, &TransformOp::Filter { expr }).unwrap();
        assert_eq!(filtered.len(), 2);
        assert_eq!(filtered.sources, vec!["leads"]);
    }

    #[test]
    fn test_group_count_only() {
        let out = group(leads(), &["owner".to_string()], AggFunc::Count, None).unwrap();
        assert_eq!(out.column_names(), vec!["owner", "count"]);
    }

    #[test]
    fn test_group_unknown_column_rejected() {
        let err = group(leads(), &["stage".to_string()], AggFunc::Sum, None).unwrap_err();
        assert!(matches!(err, EngineError::Validation { .. }));
    }

    #[test]
    fn test_sort_descending_with_limit() {
        let out = sort(leads(), &["amount".to_string()], false, Some(2)).unwrap();
        let names: Vec<&str> = out.rows.iter().filter_map(|r| r["name"].as_str()).collect();
        assert_eq!(names, vec!["B", "A"]);
    }

    #[test]
    fn test_select_keeps_requested_order() {
        let out = select(leads(), &["amount".to_string(), "name".to_string()]).unwrap();
        assert_eq!(out.column_names(), vec!["amount", "name"]);
        assert_eq!(out.len(), 4);
    }

    #[test]
    fn test_filter_preserves_order() {
        let expr = FilterExpr::parse("owner == 'Priya'").unwrap();
        let out = filter(leads(), &expr);
        let names: Vec<&str> = out.rows.iter().filter_map(|r| r["name"].as_str()).collect();
        assert_eq!(names, vec!["A", "D"]);
    }

    #[test]
    fn test_pivot_owner_by_status() {
        let out = pivot(leads(), "owner", "status", "amount", AggFunc::Sum).unwrap();
        assert_eq!(out.column_names(), vec!["owner", "Won", "Qualified", "Lost"]);
        assert_eq!(out.rows[0]["owner"], "Priya");
        assert_eq!(out.rows[0]["Won"], json!(100));
        assert_eq!(out.rows[0]["Qualified"], json!(0));
        assert_eq!(out.rows[1]["Qualified"], json!(300));
    }

    #[test]
    fn test_empty_table_passes_through() {
        let out = group(Table::empty(), &["status".to_string()], AggFunc::Sum, None).unwrap();
        assert!(out.is_empty());
    }
}
