//! File renderers: chart images and spreadsheets
//!
//! Both facilities are synchronous and CPU-bound; the executor runs them on
//! the blocking pool.

pub mod chart;
pub mod spreadsheet;

use serde::{Deserialize, Serialize};

pub use chart::{ChartKind, ChartRenderer, ChartSpec, PngChartRenderer};
pub use spreadsheet::{Sheet, SpreadsheetWriter};

pub const XLSX_MIME: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";
pub const CSV_MIME: &str = "text/csv";
pub const PNG_MIME: &str = "image/png";

/// Output format of `table.export`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Xlsx,
    Csv,
}

impl ExportFormat {
    pub fn mime(&self) -> &'static str {
        match self {
            ExportFormat::Xlsx => XLSX_MIME,
            ExportFormat::Csv => CSV_MIME,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Xlsx => "xlsx",
            ExportFormat::Csv => "csv",
        }
    }
}

/// Lowercase, filesystem-safe stem for generated filenames
pub fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    for c in text.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('_') && !slug.is_empty() {
            slug.push('_');
        }
    }
    let slug = slug.trim_end_matches('_');
    if slug.is_empty() {
        "export".to_string()
    } else {
        slug.chars().take(48).collect()
    }
}
