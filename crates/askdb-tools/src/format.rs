//! Renders query results and failures as text for the model.

use askdb_types::Row;
use serde_json::Value;

pub const MAX_OUTPUT_CHARS: usize = 8_000;
const FULL_LISTING_ROWS: usize = 10;
const PREVIEW_ROWS: usize = 5;
const TRUNCATION_MARKER: &str = "...<truncated>";

pub fn format_rows(rows: &[Row]) -> String {
    let text = match rows {
        [] => "No results found.".to_string(),
        [row] if row.len() == 1 => {
            let value = row.values().next().unwrap_or(&Value::Null);
            format!("Result: {}", scalar_text(value))
        }
        [_] => format!("Found 1 row:\n{}", pretty(rows)),
        _ if rows.len() <= FULL_LISTING_ROWS => {
            format!("Found {} rows:\n{}", rows.len(), pretty(rows))
        }
        _ => format!(
            "Found {} rows. Showing the first {}:\n{}\nResults were capped; use filters or aggregates to narrow them down.",
            rows.len(),
            PREVIEW_ROWS,
            pretty(&rows[..PREVIEW_ROWS])
        ),
    };
    bound(text)
}

pub fn format_rejection(code: &str, reason: &str) -> String {
    bound(format!("Query rejected ({code}): {reason}"))
}

pub fn format_failure(detail: &str) -> String {
    bound(format!("Query failed: {detail}"))
}

pub fn format_timeout(timeout_ms: u128) -> String {
    format!("Query timed out after {timeout_ms}ms.")
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn pretty(rows: &[Row]) -> String {
    serde_json::to_string_pretty(rows).unwrap_or_else(|_| "[]".to_string())
}

/// Caps `text` at [`MAX_OUTPUT_CHARS`] characters, marker included.
pub fn bound(text: String) -> String {
    if text.chars().count() <= MAX_OUTPUT_CHARS {
        return text;
    }
    let keep = MAX_OUTPUT_CHARS - TRUNCATION_MARKER.len();
    let mut out: String = text.chars().take(keep).collect();
    out.push_str(TRUNCATION_MARKER);
    out
}
