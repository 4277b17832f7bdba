use anyhow::Context;
use handlebars::Handlebars;
use serde::Serialize;
use std::path::Path;

use crate::calc::StatisticsModel;

const STATISTICS_TEMPLATE: &str = "statistics";

#[derive(Debug, Clone)]
pub struct ReportOptions {
    pub title: String,
    pub term_header_suffix: String,
    pub average_decimals: u32,
}

impl Default for ReportOptions {
    fn default() -> Self {
        Self {
            title: "Student Statistics Report".to_string(),
            term_header_suffix: " (Total)".to_string(),
            average_decimals: 2,
        }
    }
}

/// Renderer-agnostic table: header cells plus plain text rows.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportTable {
    pub title: String,
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Csv,
    Html,
}

impl ExportFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "csv" => Some(Self::Csv),
            "html" => Some(Self::Html),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Html => "html",
        }
    }
}

pub fn statistics_table(model: &StatisticsModel, opts: &ReportOptions) -> ReportTable {
    let mut header = Vec::with_capacity(model.terms.len() + 2);
    header.push("Student".to_string());
    for t in &model.terms {
        header.push(format!("{}{}", t.name, opts.term_header_suffix));
    }
    header.push("Average".to_string());

    let decimals = opts.average_decimals as usize;
    let rows = model
        .rows
        .iter()
        .map(|r| {
            let mut cells = Vec::with_capacity(r.term_totals.len() + 2);
            cells.push(r.display_name.clone());
            cells.extend(r.term_totals.iter().map(|v| v.to_string()));
            cells.push(format!("{:.*}", decimals, r.average));
            cells
        })
        .collect();

    ReportTable {
        title: opts.title.clone(),
        header,
        rows,
    }
}

pub fn render_csv(table: &ReportTable) -> anyhow::Result<String> {
    let mut w = csv::Writer::from_writer(Vec::new());
    w.write_record(&table.header)
        .context("failed to write report header")?;
    for row in &table.rows {
        w.write_record(row).context("failed to write report row")?;
    }
    let bytes = w
        .into_inner()
        .map_err(|e| anyhow::anyhow!("failed to flush report: {}", e))?;
    Ok(String::from_utf8(bytes)?)
}

/// Renders through the embedded handlebars template, which escapes every cell.
pub fn render_html(table: &ReportTable) -> anyhow::Result<String> {
    let mut hbs = Handlebars::new();
    hbs.set_strict_mode(true);
    hbs.register_template_string(STATISTICS_TEMPLATE, include_str!("../html/statistics.html.hbs"))
        .map_err(|e| anyhow::anyhow!("invalid report template: {}", e))?;
    hbs.render(STATISTICS_TEMPLATE, table)
        .map_err(|e| anyhow::anyhow!("failed to render html report: {}", e))
}

pub fn write_report(table: &ReportTable, format: ExportFormat, out_path: &Path) -> anyhow::Result<usize> {
    let body = match format {
        ExportFormat::Csv => render_csv(table)?,
        ExportFormat::Html => render_html(table)?,
    };
    if let Some(parent) = out_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create directory {}", parent.to_string_lossy())
            })?;
        }
    }
    std::fs::write(out_path, body.as_bytes())
        .with_context(|| format!("failed to write {}", out_path.to_string_lossy()))?;
    Ok(body.len())
}
