//! Status command.

use console::style;
use serde::Serialize;

use crate::config::Settings;
use crate::models::{GroupCounts, WorkItemCounts};

#[derive(Serialize)]
struct StatusReport {
    pages: WorkItemCounts,
    groups: GroupCounts,
}

/// Show page and group counters.
pub async fn cmd_status(settings: &Settings, json: bool) -> anyhow::Result<()> {
    let ctx = settings.create_db_context()?;
    let report = StatusReport {
        pages: ctx.work_items().counts().await?,
        groups: ctx.groups().counts().await?,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let pages = &report.pages;
    println!("\n{}", style("Pages").bold());
    println!("{}", "-".repeat(40));
    println!("{:<20} {}", "Total:", pages.total);
    println!("{:<20} {}", "Awaiting review:", pages.unreviewed);
    println!("{:<20} {}", "Pending OCR:", pages.pending);
    println!("{:<20} {}", "In flight:", pages.in_flight);
    println!("{:<20} {}", "Extracted:", pages.processed);
    println!("{:<20} {}", "Grouped:", pages.consumed);
    println!("{:<20} {}", "Bookmarks:", pages.bookmarks);
    if pages.failing > 0 {
        println!(
            "{:<20} {}",
            "Failing:",
            style(pages.failing).yellow()
        );
    }

    println!("\n{}", style("Groups").bold());
    println!("{}", "-".repeat(40));
    println!("{:<20} {}", "Complete:", report.groups.complete);
    println!("{:<20} {}", "Open:", report.groups.open);

    Ok(())
}
