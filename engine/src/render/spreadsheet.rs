//! Spreadsheet and CSV writer
//!
//! XLSX output is a minimal SpreadsheetML package: one worksheet per
//! [`Sheet`], a bold header row, inline strings and numeric cells, zipped
//! with deflate.

use super::ExportFormat;
use crate::store::value::display;
use sdk::errors::EngineError;
use sdk::types::Table;
use serde_json::Value;
use std::collections::HashSet;
use std::io::{Cursor, Write};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

const MAX_SHEET_NAME: usize = 31;
const MAX_COLUMN_WIDTH: usize = 60;

/// One named worksheet
#[derive(Debug, Clone)]
pub struct Sheet {
    pub name: String,
    pub table: Table,
}

impl Sheet {
    pub fn new(name: impl Into<String>, table: Table) -> Self {
        Self {
            name: name.into(),
            table,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SpreadsheetWriter;

fn render_error(e: impl std::fmt::Display) -> EngineError {
    EngineError::Render(format!("Spreadsheet write failed: {}", e))
}

impl SpreadsheetWriter {
    pub fn new() -> Self {
        Self
    }

    /// Single-table export in the requested format
    pub fn write(
        &self,
        table: &Table,
        format: ExportFormat,
        sheet_name: &str,
    ) -> Result<Vec<u8>, EngineError> {
        match format {
            ExportFormat::Csv => self.csv(table),
            ExportFormat::Xlsx => self.xlsx(&[Sheet::new(sheet_name, table.clone())]),
        }
    }

    pub fn csv(&self, table: &Table) -> Result<Vec<u8>, EngineError> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        let headers = table.column_names();
        writer.write_record(&headers).map_err(render_error)?;

        for row in &table.rows {
            let record: Vec<String> = headers
                .iter()
                .map(|h| row.get(h).map(display).unwrap_or_default())
                .collect();
            writer.write_record(&record).map_err(render_error)?;
        }

        writer.into_inner().map_err(render_error)
    }

    pub fn xlsx(&self, sheets: &[Sheet]) -> Result<Vec<u8>, EngineError> {
        if sheets.is_empty() {
            return Err(EngineError::Render("workbook needs at least one sheet".to_string()));
        }
        let names = unique_sheet_names(sheets);

        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        let options = FileOptions::default().compression_method(CompressionMethod::Deflated);

        let mut put = |path: &str, body: &str| -> Result<(), EngineError> {
            zip.start_file(path, options).map_err(render_error)?;
            zip.write_all(body.as_bytes()).map_err(render_error)
        };

        put("[Content_Types].xml", &content_types(sheets.len()))?;
        put("_rels/.rels", ROOT_RELS)?;
        put("xl/workbook.xml", &workbook(&names))?;
        put("xl/_rels/workbook.xml.rels", &workbook_rels(sheets.len()))?;
        put("xl/styles.xml", STYLES)?;
        for (i, sheet) in sheets.iter().enumerate() {
            put(&format!("xl/worksheets/sheet{}.xml", i + 1), &worksheet(&sheet.table))?;
        }

        let cursor = zip.finish().map_err(render_error)?;
        Ok(cursor.into_inner())
    }
}

/// Sheet names are at most 31 chars, free of `[]:*?/\`, and unique
fn unique_sheet_names(sheets: &[Sheet]) -> Vec<String> {
    let mut seen = HashSet::new();
    sheets
        .iter()
        .enumerate()
        .map(|(i, sheet)| {
            let cleaned: String = sheet
                .name
                .chars()
                .filter(|c| !matches!(c, '[' | ']' | ':' | '*' | '?' | '/' | '\\'))
                .take(MAX_SHEET_NAME)
                .collect();
            let mut name = if cleaned.trim().is_empty() {
                format!("Sheet{}", i + 1)
            } else {
                cleaned
            };
            let mut n = 2;
            while !seen.insert(name.to_lowercase()) {
                let suffix = format!(" ({})", n);
                let base: String = name.chars().take(MAX_SHEET_NAME - suffix.len()).collect();
                name = format!("{}{}", base, suffix);
                n += 1;
            }
            name
        })
        .collect()
}

pub fn column_letter(mut index: usize) -> String {
    let mut letters = Vec::new();
    loop {
        letters.push((b'A' + (index % 26) as u8) as char);
        if index < 26 {
            break;
        }
        index = index / 26 - 1;
    }
    letters.iter().rev().collect()
}

fn escape_xml(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

fn inline_string(reference: &str, text: &str, style: u8) -> String {
    format!(
        r#"<c r="{}" t="inlineStr" s="{}"><is><t xml:space="preserve">{}</t></is></c>"#,
        reference,
        style,
        escape_xml(text)
    )
}

fn cell(reference: &str, value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Number(n) => format!(r#"<c r="{}"><v>{}</v></c>"#, reference, n),
        Value::Bool(b) => format!(r#"<c r="{}" t="b"><v>{}</v></c>"#, reference, u8::from(*b)),
        other => inline_string(reference, &display(other), 0),
    }
}

fn worksheet(table: &Table) -> String {
    let headers = table.column_names();
    let mut widths: Vec<usize> = headers.iter().map(|h| h.chars().count()).collect();

    let mut rows = String::new();
    rows.push_str(r#"<row r="1">"#);
    for (c, header) in headers.iter().enumerate() {
        rows.push_str(&inline_string(&format!("{}1", column_letter(c)), header, 1));
    }
    rows.push_str("</row>");

    for (r, row) in table.rows.iter().enumerate() {
        let line = r + 2;
        rows.push_str(&format!(r#"<row r="{}">"#, line));
        for (c, header) in headers.iter().enumerate() {
            if let Some(value) = row.get(header) {
                widths[c] = widths[c].max(display(value).chars().count());
                rows.push_str(&cell(&format!("{}{}", column_letter(c), line), value));
            }
        }
        rows.push_str("</row>");
    }

    let cols = if widths.is_empty() {
        String::new()
    } else {
        let defs: String = widths
            .iter()
            .enumerate()
            .map(|(i, w)| {
                format!(
                    r#"<col min="{0}" max="{0}" width="{1}" customWidth="1"/>"#,
                    i + 1,
                    (*w + 2).min(MAX_COLUMN_WIDTH)
                )
            })
            .collect();
        format!("<cols>{}</cols>", defs)
    };

    format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main">{}<sheetData>{}</sheetData></worksheet>"#,
        cols, rows
    )
}

fn content_types(sheet_count: usize) -> String {
    let overrides: String = (1..=sheet_count)
        .map(|i| {
            format!(
                r#"<Override PartName="/xl/worksheets/sheet{}.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.worksheet+xml"/>"#,
                i
            )
        })
        .collect();
    format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/><Default Extension="xml" ContentType="application/xml"/><Override PartName="/xl/workbook.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.sheet.main+xml"/><Override PartName="/xl/styles.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.styles+xml"/>{}</Types>"#,
        overrides
    )
}

fn workbook(names: &[String]) -> String {
    let sheets: String = names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            format!(
                r#"<sheet name="{}" sheetId="{}" r:id="rId{}"/>"#,
                escape_xml(name),
                i + 1,
                i + 1
            )
        })
        .collect();
    format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<workbook xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"><sheets>{}</sheets></workbook>"#,
        sheets
    )
}

fn workbook_rels(sheet_count: usize) -> String {
    let mut rels: String = (1..=sheet_count)
        .map(|i| {
            format!(
                r#"<Relationship Id="rId{0}" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet" Target="worksheets/sheet{0}.xml"/>"#,
                i
            )
        })
        .collect();
    rels.push_str(&format!(
        r#"<Relationship Id="rId{}" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/styles" Target="styles.xml"/>"#,
        sheet_count + 1
    ));
    format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">{}</Relationships>"#,
        rels
    )
}

const ROOT_RELS: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument" Target="xl/workbook.xml"/></Relationships>"#;

// Style 0 is the default, style 1 the bold header font
const STYLES: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<styleSheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><fonts count="2"><font><sz val="11"/><name val="Calibri"/></font><font><b/><sz val="11"/><name val="Calibri"/></font></fonts><fills count="2"><fill><patternFill patternType="none"/></fill><fill><patternFill patternType="gray125"/></fill></fills><borders count="1"><border><left/><right/><top/><bottom/><diagonal/></border></borders><cellStyleXfs count="1"><xf numFmtId="0" fontId="0" fillId="0" borderId="0"/></cellStyleXfs><cellXfs count="2"><xf numFmtId="0" fontId="0" fillId="0" borderId="0" xfId="0"/><xf numFmtId="0" fontId="1" fillId="0" borderId="0" xfId="0" applyFont="1"/></cellXfs></styleSheet>"#;
