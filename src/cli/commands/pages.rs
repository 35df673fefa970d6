//! Page listing command.

use console::style;

use crate::cli::helpers::truncate;
use crate::config::Settings;
use crate::models::WorkItemState;

/// List pages in sequence order with their lifecycle state.
pub async fn cmd_pages(settings: &Settings, after: i64, limit: i64) -> anyhow::Result<()> {
    let ctx = settings.create_db_context()?;
    let pages = ctx.work_items().list(after, limit).await?;

    if pages.is_empty() {
        println!("{} No pages after #{}", style("!").yellow(), after);
        return Ok(());
    }

    println!(
        "{:<8} {:<24} {:<11} {:>6} {:>5}  {}",
        "SEQ", "NAME", "STATE", "GROUP", "FAIL", "NOTE"
    );
    for page in &pages {
        let state = page.state();
        let styled = match state {
            WorkItemState::Consumed => style(state.as_str()).green(),
            WorkItemState::InFlight => style(state.as_str()).cyan(),
            WorkItemState::Unreviewed => style(state.as_str()).dim(),
            _ => style(state.as_str()).yellow(),
        };
        let group = page
            .group_id
            .map(|id| format!("{}:{}", id, page.position_in_group.unwrap_or_default()))
            .unwrap_or_else(|| "-".to_string());
        let note = if page.is_bookmark {
            "bookmark".to_string()
        } else {
            page.last_error
                .as_deref()
                .map(|e| truncate(e, 40))
                .unwrap_or_default()
        };
        println!(
            "{:<8} {:<24} {:<11} {:>6} {:>5}  {}",
            page.sequence_number,
            truncate(&page.original_name, 24),
            styled,
            group,
            page.failure_count,
            note
        );
    }

    if let Some(last) = pages.last() {
        if pages.len() as i64 == limit {
            println!(
                "\n{} More pages follow; use --after {}",
                style("→").dim(),
                last.sequence_number
            );
        }
    }
    Ok(())
}
