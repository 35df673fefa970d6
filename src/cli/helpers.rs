//! Shared helper functions for CLI commands.

use console::style;

use crate::pipeline::{EventRecord, Severity};

/// Format a byte count for display.
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Truncate a string to a maximum number of characters.
pub fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}

/// One styled line for a pipeline event.
pub fn render_event(record: &EventRecord) -> String {
    let marker = match record.severity {
        Severity::Success => style("✓").green(),
        Severity::Warning => style("!").yellow(),
        Severity::Error => style("✗").red(),
        Severity::Info => style("→").dim(),
    };
    let worker = match record.worker {
        Some(w) => format!("{} ", style(format!("[w{}]", w)).cyan()),
        None => String::new(),
    };
    format!(
        "{} {} {}{}",
        style(record.timestamp.format("%H:%M:%S")).dim(),
        marker,
        worker,
        record.message
    )
}
