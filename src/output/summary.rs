use std::fmt::Write;

use comfy_table::Cell;

use crate::report::StageReport;
use crate::stages::results::ResultsDocument;

use super::styling::Tone;
use super::tables::{create_table, header, result_cell, status_cell};

/// Prints the merged test results as a color-coded table to stdout.
///
/// Color coding:
/// - Green: `pass`
/// - Red: `fail`
/// - Yellow: any other result (`error`, `info`, ...)
pub fn print_results_summary(document: &ResultsDocument) {
    println!("{}", render_results_summary(document));
}

/// Prints the outcome of a stage run to stdout.
pub fn print_stage_summary(stage: &str, report: &StageReport) {
    println!("{}", render_stage_summary(stage, report));
}

fn add_section_header(output: &mut String, emoji: &str, title: &str) {
    let _ = writeln!(output, "{emoji} {}", Tone::Heading.paint(title));
}

fn render_results_summary(document: &ResultsDocument) -> String {
    let mut output = String::new();
    add_section_header(&mut output, "🧪", "Test Results");

    let total = document.results.len();
    let failures = document.failures();
    let _ = writeln!(
        output,
        "  {} {}\n  {} {}\n",
        Tone::Muted.paint("Tests:"),
        Tone::Running.paint(total),
        Tone::Muted.paint("Not passed:"),
        Tone::for_failures(failures).paint(failures),
    );

    if total == 0 {
        let _ = writeln!(output, "  {}", Tone::Muted.paint("No test results"));
        return output;
    }

    let mut table = create_table();
    table.set_header(header(&["Test", "Result", "Logs"]));
    for result in &document.results {
        let logs = result
            .logs
            .as_deref()
            .map(|logs| logs.join("\n"))
            .unwrap_or_default();
        table.add_row(vec![
            Cell::new(&result.test),
            result_cell(&result.result),
            Cell::new(logs),
        ]);
    }
    let _ = writeln!(output, "{table}");
    output
}

fn render_stage_summary(stage: &str, report: &StageReport) -> String {
    let mut output = String::new();
    add_section_header(&mut output, "📋", stage);

    let mut table = create_table();
    table.set_header(header(&["Key", "Value"]));
    table.add_row(vec![Cell::new("status"), status_cell(report.status)]);
    if let Some(reason) = &report.error_reason {
        table.add_row(vec![Cell::new("error"), Cell::new(reason)]);
    }
    if let serde_json::Value::Object(fields) = report.to_json() {
        for (key, value) in fields {
            if matches!(key.as_str(), "status" | "error_reason" | "finished_at") || value.is_null() {
                continue;
            }
            let text = match value {
                serde_json::Value::String(s) => s,
                serde_json::Value::Array(items) => items
                    .iter()
                    .map(|item| item.as_str().map_or_else(|| item.to_string(), str::to_string))
                    .collect::<Vec<_>>()
                    .join("\n"),
                other => other.to_string(),
            };
            table.add_row(vec![Cell::new(key), Cell::new(text)]);
        }
    }
    let _ = writeln!(output, "{table}");
    output
}
