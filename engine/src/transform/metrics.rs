//! Named scalar metrics over a table

use crate::store::value::{as_number, get_path};
use sdk::errors::EngineError;
use sdk::types::{Metric, Table};
use serde::{Deserialize, Serialize};

/// Status value counted as a conversion
pub const WON_STATUS: &str = "Won";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    TotalPipeline,
    ConversionRate,
    AvgDealSize,
    RowCount,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::TotalPipeline => "total_pipeline",
            MetricKind::ConversionRate => "conversion_rate",
            MetricKind::AvgDealSize => "avg_deal_size",
            MetricKind::RowCount => "row_count",
        }
    }

    fn unit(&self) -> &'static str {
        match self {
            MetricKind::TotalPipeline | MetricKind::AvgDealSize => "currency",
            MetricKind::ConversionRate => "percent",
            MetricKind::RowCount => "rows",
        }
    }
}

fn amounts(table: &Table, metric: MetricKind) -> Result<Vec<f64>, EngineError> {
    if !table.is_empty() && table.column("amount").is_none() {
        return Err(EngineError::validation(
            "metric.calculate",
            format!("{} needs an 'amount' column", metric.as_str()),
        ));
    }
    Ok(table
        .rows
        .iter()
        .filter_map(|row| get_path(row, "amount").and_then(as_number))
        .collect())
}

/// Compute `kind` over `table`; empty tables yield zero
pub fn calculate(kind: MetricKind, table: &Table) -> Result<Metric, EngineError> {
    let value = match kind {
        MetricKind::RowCount => table.len() as f64,
        MetricKind::TotalPipeline => amounts(table, kind)?.iter().sum(),
        MetricKind::AvgDealSize => {
            let values = amounts(table, kind)?;
            if values.is_empty() {
                0.0
            } else {
                values.iter().sum::<f64>() / values.len() as f64
            }
        }
        MetricKind::ConversionRate => {
            if table.is_empty() {
                0.0
            } else {
                let won = table
                    .rows
                    .iter()
                    .filter(|row| {
                        get_path(row, "status")
                            .and_then(|v| v.as_str())
                            .is_some_and(|s| s.eq_ignore_ascii_case(WON_STATUS))
                    })
                    .count();
                won as f64 * 100.0 / table.len() as f64
            }
        }
    };

    Ok(Metric {
        name: kind.as_str().to_string(),
        value,
        unit: Some(kind.unit().to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn table(v: serde_json::Value) -> Table {
        Table::from_rows(
            v.as_array()
                .unwrap()
                .iter()
                .map(|r| r.as_object().cloned().unwrap())
                .collect(),
        )
    }

    #[test]
    fn test_pipeline_and_average() {
        let t = table(json!([{"amount": 100}, {"amount": 300}, {"amount": "200"}]));
        assert_eq!(calculate(MetricKind::TotalPipeline, &t).unwrap().value, 600.0);
        assert_eq!(calculate(MetricKind::AvgDealSize, &t).unwrap().value, 200.0);
    }

    #[test]
    fn test_conversion_rate_percent() {
        let t = table(json!([
            {"status": "Won"}, {"status": "Lost"}, {"status": "Won"}, {"status": "Qualified"}
        ]));
        let m = calculate(MetricKind::ConversionRate, &t).unwrap();
        assert_eq!(m.value, 50.0);
        assert_eq!(m.unit.as_deref(), Some("percent"));
    }

    #[test]
    fn test_missing_amount_column() {
        let t = table(json!([{"status": "Won"}]));
        assert!(calculate(MetricKind::TotalPipeline, &t).is_err());
        assert_eq!(calculate(MetricKind::RowCount, &t).unwrap().value, 1.0);
    }

    #[test]
    fn test_empty_table_is_zero() {
        for kind in [
            MetricKind::TotalPipeline,
            MetricKind::ConversionRate,
            MetricKind::AvgDealSize,
            MetricKind::RowCount,
        ] {
            assert_eq!(calculate(kind, &Table::empty()).unwrap().value, 0.0);
        }
    }
}
