//! Group listing commands.

use console::style;

use crate::cli::helpers::truncate;
use crate::config::Settings;

/// List groups in allocation order.
pub async fn cmd_groups(settings: &Settings, limit: i64) -> anyhow::Result<()> {
    let ctx = settings.create_db_context()?;
    let groups = ctx.groups().list(limit).await?;

    if groups.is_empty() {
        println!("{} No groups yet", style("!").yellow());
        return Ok(());
    }

    println!("{:<8} {:<10} {:>6}  {}", "ID", "STATUS", "PAGES", "CREATED");
    for group in groups {
        let status = if group.is_complete {
            style("complete").green().to_string()
        } else {
            style("open").yellow().to_string()
        };
        println!(
            "{:<8} {:<10} {:>6}  {}",
            group.id,
            status,
            group.page_count,
            group.created_at.format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}

/// Show one group and its pages in order.
pub async fn cmd_group(settings: &Settings, group_id: i32) -> anyhow::Result<()> {
    let ctx = settings.create_db_context()?;
    let Some(group) = ctx.groups().get(group_id).await? else {
        anyhow::bail!("Group {} not found", group_id);
    };

    let status = if group.is_complete { "complete" } else { "open" };
    println!(
        "\n{}",
        style(format!("Group {} ({}, {} pages)", group.id, status, group.page_count)).bold()
    );
    println!("{}", "-".repeat(40));

    for page in ctx.groups().members(group_id).await? {
        let preview = page
            .extracted_text
            .as_deref()
            .map(|t| truncate(&t.replace('\n', " "), 50))
            .unwrap_or_default();
        println!(
            "{:>4}. #{:<6} {:<24} {}",
            page.position_in_group.unwrap_or_default(),
            page.sequence_number,
            truncate(&page.original_name, 24),
            style(preview).dim()
        );
    }
    Ok(())
}
