//! Renderers turning stats into CSV, Prometheus exposition text, and
//! JSON or HTML analysis reports.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::accumulator::{CallSiteRecord, SiteKey, Stats};
use crate::analyzer::{AnalysisReport, CostEntry};

pub const CSV_HEADER: &str = "key,file,line,level,message_template,count,bytes";

/// Records ordered by the text form of their key.
fn sorted_by_key(stats: &Stats) -> Vec<(String, &CallSiteRecord)> {
    let mut rows: Vec<_> = stats
        .iter()
        .map(|(key, record): (&SiteKey, _)| (key.to_string(), record))
        .collect();
    rows.sort_by(|a, b| a.0.cmp(&b.0));
    rows
}

fn escape_field(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

pub fn to_csv(stats: &Stats) -> String {
    let mut out = String::from(CSV_HEADER);
    out.push('\n');
    for (key, record) in sorted_by_key(stats) {
        let fields = [
            escape_field(&key),
            escape_field(&record.file),
            record.line.to_string(),
            record.level.to_string(),
            escape_field(&record.message_template),
            record.count.to_string(),
            record.bytes.to_string(),
        ];
        out.push_str(&fields.join(","));
        out.push('\n');
    }
    out
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('\n', "\\n")
        .replace('"', "\\\"")
}

fn labels(record: &CallSiteRecord) -> String {
    format!(
        "file=\"{}\",line=\"{}\",level=\"{}\"",
        escape_label(&record.file),
        record.line,
        record.level
    )
}

/// Renders both counters in the Prometheus text exposition format.
pub fn to_prometheus(stats: &Stats) -> String {
    let rows = sorted_by_key(stats);
    let mut lines = vec![
        "# HELP logcost_statement_bytes Total bytes emitted by log statement.".to_string(),
        "# TYPE logcost_statement_bytes counter".to_string(),
    ];
    lines.extend(rows.iter().map(|(_, record)| {
        format!("logcost_statement_bytes{{{}}} {}", labels(record), record.bytes)
    }));
    lines.push(
        "# HELP logcost_statement_count Total count of log invocations per statement.".to_string(),
    );
    lines.push("# TYPE logcost_statement_count counter".to_string());
    lines.extend(rows.iter().map(|(_, record)| {
        format!("logcost_statement_count{{{}}} {}", labels(record), record.count)
    }));

    let mut out = lines.join("\n");
    out.push('\n');
    out
}

#[derive(Serialize)]
pub struct JsonReport<'a> {
    pub generated_at: DateTime<Utc>,
    #[serde(flatten)]
    pub report: &'a AnalysisReport,
}

pub fn to_json(
    report: &AnalysisReport,
    generated_at: DateTime<Utc>,
) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(&JsonReport { generated_at, report })
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

fn html_list(items: &[String], empty: &str) -> String {
    if items.is_empty() {
        return format!("<li>{}</li>", empty);
    }
    items
        .iter()
        .map(|item| format!("<li>{}</li>", escape_html(item)))
        .collect()
}

fn html_row(entry: &CostEntry) -> String {
    let template: String = entry.message_template.chars().take(80).collect();
    format!(
        "<tr><td>{}:{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{:.4}</td></tr>",
        escape_html(&entry.file),
        entry.line,
        entry.level,
        escape_html(&template),
        entry.count,
        entry.bytes,
        entry.cost
    )
}

const HTML_STYLES: &str = r#"
    body { font-family: Arial, sans-serif; margin: 2rem; }
    table { border-collapse: collapse; width: 100%; }
    th, td { border: 1px solid #ddd; padding: 8px; }
    th { background: #f0f0f0; text-align: left; }
"#;

/// Renders a standalone HTML page with the totals, the top entries, the
/// detected anti-patterns and the recommendations.
pub fn to_html(report: &AnalysisReport) -> String {
    let currency = escape_html(&report.currency);
    let rows: Vec<String> = report.top_entries.iter().map(html_row).collect();

    format!(
        r#"<!doctype html>
<html>
<head>
  <meta charset="utf-8">
  <title>LogCost Report</title>
  <style>{styles}</style>
</head>
<body>
  <h1>LogCost Report</h1>
  <p>Provider: {provider} | Currency: {currency}</p>
  <p>Total bytes: {total_bytes} | Estimated cost: {total_cost:.2} {currency}</p>
  <h2>Top {top} Statements</h2>
  <table>
    <thead>
      <tr><th>Location</th><th>Level</th><th>Template</th><th>Count</th><th>Bytes</th><th>Cost ({currency})</th></tr>
    </thead>
    <tbody>
      {rows}
    </tbody>
  </table>
  <h2>Anti-patterns</h2>
  <ul>{anti_patterns}</ul>
  <h2>Recommendations</h2>
  <ul>{recommendations}</ul>
</body>
</html>
"#,
        styles = HTML_STYLES,
        provider = escape_html(&report.provider.to_uppercase()),
        currency = currency,
        total_bytes = report.total_bytes,
        total_cost = report.total_cost,
        top = report.top_entries.len(),
        rows = rows.join("\n      "),
        anti_patterns = html_list(&report.anti_patterns, "None detected"),
        recommendations = html_list(&report.recommendations, ""),
    )
}
