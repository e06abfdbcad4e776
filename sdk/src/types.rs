//! Tool result types
//!
//! Values that flow between steps of a plan: tabular results, artifact
//! references, embed URLs, scalar metrics and CRM record references.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One record of a tabular result. Key order is preserved.
pub type Row = serde_json::Map<String, Value>;

/// Column type inferred from the first row that carries the column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Text,
    Integer,
    Float,
    Boolean,
    Nested,
    Null,
}

impl ColumnType {
    /// Infer a column type from a single JSON value
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => ColumnType::Null,
            Value::Bool(_) => ColumnType::Boolean,
            Value::Number(n) if n.is_i64() || n.is_u64() => ColumnType::Integer,
            Value::Number(_) => ColumnType::Float,
            Value::String(_) => ColumnType::Text,
            Value::Array(_) | Value::Object(_) => ColumnType::Nested,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, ColumnType::Integer | ColumnType::Float)
    }
}

/// Named, typed column of a [`Table`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub kind: ColumnType,
}

/// Ordered rows with named columns
///
/// Column names are the union of row keys in order of first appearance.
/// A column's type comes from the first row; columns missing from the first
/// row take the type of their first occurrence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub columns: Vec<Column>,
    pub rows: Vec<Row>,
    /// Collections the rows were read from, kept through transforms
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<String>,
}

impl Table {
    /// Build a table from rows, inferring columns
    pub fn from_rows(rows: Vec<Row>) -> Self {
        let mut columns: Vec<Column> = Vec::new();
        for row in &rows {
            for (key, value) in row {
                if !columns.iter().any(|c| &c.name == key) {
                    columns.push(Column {
                        name: key.clone(),
                        kind: ColumnType::of(value),
                    });
                }
            }
        }
        Self {
            columns,
            rows,
            sources: Vec::new(),
        }
    }

    /// Record where the rows came from; duplicates are dropped
    pub fn with_sources<I, S>(mut self, sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for source in sources {
            let source = source.into();
            if !self.sources.contains(&source) {
                self.sources.push(source);
            }
        }
        self
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// First `n` rows as a new table with the same columns
    pub fn head(&self, n: usize) -> Table {
        Table {
            columns: self.columns.clone(),
            rows: self.rows.iter().take(n).cloned().collect(),
            sources: self.sources.clone(),
        }
    }

    /// Size of the JSON encoding of the rows
    pub fn byte_size(&self) -> usize {
        serde_json::to_vec(&self.rows).map(|v| v.len()).unwrap_or(0)
    }

    /// Recompute columns after rows were edited in place
    pub fn reindex(self) -> Self {
        Self {
            sources: self.sources,
            ..Self::from_rows(self.rows)
        }
    }
}

/// Logical type of a stored artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    TableExport,
    ChartImage,
    Report,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::TableExport => "table_export",
            ArtifactKind::ChartImage => "chart_image",
            ArtifactKind::Report => "report",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "table_export" => Some(ArtifactKind::TableExport),
            "chart_image" => Some(ArtifactKind::ChartImage),
            "report" => Some(ArtifactKind::Report),
            _ => None,
        }
    }
}

/// Reference to a stored artifact; never carries the bytes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub artifact_id: String,
    pub kind: ArtifactKind,
    pub mime: String,
    pub filename: String,
    pub size_bytes: u64,
    pub download_url: String,
}

/// Scalar metric computed over a tabular result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    pub value: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

/// Reference to a record created or updated through the CRM action surface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordRef {
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
    pub status: u16,
}

/// Typed output of a step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ToolResult {
    Table(Table),
    File(ArtifactRef),
    Url(String),
    Scalar(Metric),
    Record(RecordRef),
}

impl ToolResult {
    pub fn as_table(&self) -> Option<&Table> {
        match self {
            ToolResult::Table(t) => Some(t),
            _ => None,
        }
    }

    pub fn into_table(self) -> Option<Table> {
        match self {
            ToolResult::Table(t) => Some(t),
            _ => None,
        }
    }

    /// Row count for tabular results, 1 for everything else
    pub fn row_count(&self) -> usize {
        match self {
            ToolResult::Table(t) => t.len(),
            _ => 1,
        }
    }

    /// Approximate payload size; file results report the artifact size
    pub fn byte_size(&self) -> u64 {
        match self {
            ToolResult::Table(t) => t.byte_size() as u64,
            ToolResult::File(a) => a.size_bytes,
            ToolResult::Url(u) => u.len() as u64,
            ToolResult::Scalar(_) | ToolResult::Record(_) => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(v: Value) -> Row {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_columns_inferred_from_first_row() {
        let table = Table::from_rows(vec![
            row(json!({"name": "Acme", "amount": 1200, "score": 0.5})),
            row(json!({"name": "Globex", "amount": 3.5, "won": true})),
        ]);

        assert_eq!(table.column_names(), vec!["name", "amount", "score", "won"]);
        assert_eq!(table.column("amount").unwrap().kind, ColumnType::Integer);
        assert_eq!(table.column("won").unwrap().kind, ColumnType::Boolean);
    }

    #[test]
    fn test_head_keeps_columns() {
        let rows = (0..20).map(|i| row(json!({ "i": i }))).collect();
        let table = Table::from_rows(rows);
        let head = table.head(10);
        assert_eq!(head.len(), 10);
        assert_eq!(head.columns, table.columns);
    }

    #[test]
    fn test_tool_result_tagging() {
        let result = ToolResult::Url("https://bi.example.com/embed/x".to_string());
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["type"], "url");
    }
}
