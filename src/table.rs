//! Plain-text rendering of the per-chunk outcome summary.

use std::borrow::Cow;
use std::fmt::Write as _;

use crate::batch::{BatchReport, ChunkStatus};

pub fn render_table(headers: &[String], rows: &[Vec<String>]) -> String {
    let mut widths = headers.iter().map(|h| display_width(h)).collect::<Vec<_>>();
    for row in rows {
        for (idx, cell) in row.iter().enumerate().take(widths.len()) {
            widths[idx] = widths[idx].max(display_width(cell));
        }
    }

    let mut output = String::new();
    let _ = writeln!(output, "{}", format_row(headers, &widths));
    let rule = widths.iter().map(|w| "-".repeat((*w).max(3))).collect::<Vec<_>>();
    let rule_widths = widths.iter().map(|w| (*w).max(3)).collect::<Vec<_>>();
    let _ = writeln!(output, "{}", format_row(&rule, &rule_widths));
    for row in rows {
        let _ = writeln!(output, "{}", format_row(row, &widths));
    }
    output
}

/// One line per chunk: index, row window, status, rows loaded and the error, if any.
pub fn render_report(report: &BatchReport) -> String {
    let headers = ["chunk", "rows", "status", "loaded", "error"]
        .iter()
        .map(|h| h.to_string())
        .collect::<Vec<_>>();
    let rows = report
        .chunks
        .iter()
        .map(|chunk| {
            vec![
                chunk.index.to_string(),
                format!("{}..{}", chunk.start_row, chunk.end_row),
                match chunk.status {
                    ChunkStatus::Succeeded => "ok".to_string(),
                    ChunkStatus::Failed => "FAILED".to_string(),
                },
                chunk.rows_loaded.to_string(),
                chunk.error.clone().unwrap_or_default(),
            ]
        })
        .collect::<Vec<_>>();
    let mut output = render_table(&headers, &rows);
    let _ = writeln!(
        output,
        "{} succeeded, {} failed, {} row(s) loaded",
        report.success_count(),
        report.failed_count(),
        report.rows_loaded()
    );
    output
}

pub fn print_report(report: &BatchReport) {
    print!("{}", render_report(report));
}

fn format_row(values: &[String], widths: &[usize]) -> String {
    let mut line = values
        .iter()
        .zip(widths)
        .map(|(value, width)| {
            let cell = sanitize_cell(value);
            let padding = width.saturating_sub(display_width(&cell));
            format!("{cell}{}", " ".repeat(padding))
        })
        .collect::<Vec<_>>()
        .join("  ");
    line.truncate(line.trim_end().len());
    line
}

/// Terminal columns taken by `value`; CJK and full-width forms count as two.
fn display_width(value: &str) -> usize {
    value.chars().map(|ch| if is_wide(ch) { 2 } else { 1 }).sum()
}

fn is_wide(ch: char) -> bool {
    matches!(ch as u32,
        0x1100..=0x115F
        | 0x2E80..=0x303E
        | 0x3041..=0x33FF
        | 0x3400..=0x4DBF
        | 0x4E00..=0x9FFF
        | 0xAC00..=0xD7A3
        | 0xF900..=0xFAFF
        | 0xFF00..=0xFF60
        | 0xFFE0..=0xFFE6)
}

fn sanitize_cell(value: &str) -> Cow<'_, str> {
    if value.contains(['\n', '\r', '\t']) {
        Cow::Owned(value.replace(['\n', '\r', '\t'], " "))
    } else {
        Cow::Borrowed(value)
    }
}
