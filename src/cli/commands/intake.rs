//! Intake and review commands.

use std::path::{Path, PathBuf};

use console::style;

use crate::config::Settings;
use crate::models::IntakeFile;

use crate::cli::helpers::format_bytes;

/// Store page images in the order given.
pub async fn cmd_intake(
    settings: &Settings,
    files: &[PathBuf],
    review: bool,
) -> anyhow::Result<()> {
    let mut intake = Vec::with_capacity(files.len());
    let mut total_bytes = 0u64;
    for path in files {
        let data = tokio::fs::read(path)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
        total_bytes += data.len() as u64;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("page")
            .to_string();
        intake.push(IntakeFile::new(name, data));
    }

    let ctx = settings.create_db_context()?;
    let items = ctx.work_items();
    let stored = items.intake(intake).await?;

    if let (Some(first), Some(last)) = (stored.first(), stored.last()) {
        println!(
            "{} Stored {} page(s) ({}) as #{}..#{}",
            style("✓").green(),
            stored.len(),
            format_bytes(total_bytes),
            first.sequence_number,
            last.sequence_number
        );
        if review {
            let sequences: Vec<i64> = stored.iter().map(|i| i.sequence_number).collect();
            items.set_reviewed(&sequences, true).await?;
            println!("  {} Marked reviewed", style("→").dim());
        }
    }

    Ok(())
}

/// Set or clear the review flag, optionally attaching an edited image.
pub async fn cmd_review(
    settings: &Settings,
    sequences: &[i64],
    all: bool,
    reviewed: bool,
    edited: Option<&Path>,
) -> anyhow::Result<()> {
    let ctx = settings.create_db_context()?;
    let items = ctx.work_items();

    if let Some(path) = edited {
        let [sequence] = sequences else {
            anyhow::bail!("--edited needs exactly one sequence number");
        };
        let data = tokio::fs::read(path)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("edited");
        match items.attach_edited_image(*sequence, name, &data).await? {
            Some(stored) => println!(
                "{} Page #{} will be read from {}",
                style("✓").green(),
                sequence,
                stored
            ),
            None => anyhow::bail!("No page with sequence number {}", sequence),
        }
    }

    let updated = if all {
        items.set_all_reviewed(reviewed).await?
    } else if sequences.is_empty() {
        println!("{} Nothing to review; pass sequence numbers or --all", style("!").yellow());
        return Ok(());
    } else {
        items.set_reviewed(sequences, reviewed).await?
    };

    let verb = if reviewed { "reviewed" } else { "unreviewed" };
    println!("{} Marked {} page(s) {}", style("✓").green(), updated, verb);
    Ok(())
}
