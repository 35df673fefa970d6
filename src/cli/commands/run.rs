//! Pipeline run and reclaim commands.

use std::sync::Arc;
use std::time::Duration;

use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use crate::cli::helpers::{render_event, truncate};
use crate::config::Settings;
use crate::ocr::HttpOcrClient;
use crate::pipeline::{EventBus, PipelineEvent, PipelineRunner, Reclaimer};

/// Run the pipeline until Ctrl-C, or until nothing is left with `--once`.
pub async fn cmd_run(settings: &Settings, once: bool, workers: Option<usize>) -> anyhow::Result<()> {
    let ctx = settings.create_db_context()?;

    let mut credentials = settings.credentials();
    if let Some(limit) = workers {
        credentials.truncate(limit.max(1));
    }
    if credentials.is_empty() {
        println!("{} No OCR API keys configured", style("✗").red());
        println!("  Set OCR_API_KEY_1 (or OCR_API_KEYS) or add api_keys to the [ocr] section");
    }

    let client = HttpOcrClient::new(
        &settings.ocr.service_url,
        settings.ocr.request_timeout(),
        settings.ocr.request_options(),
    )?;
    println!(
        "{} OCR service {} with {} worker(s)",
        style("→").cyan(),
        client.endpoint(),
        credentials.len()
    );

    let events = EventBus::default();
    let mut rx = events.subscribe();
    let runner = PipelineRunner::new(
        ctx,
        Arc::new(client),
        credentials,
        settings.pipeline.clone(),
        events,
    );

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {wide_msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    spinner.enable_steady_tick(Duration::from_millis(120));
    spinner.set_message("Starting...");

    let view = spinner.clone();
    let printer = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(record) => {
                    // Per-attempt chatter goes to the spinner, everything else scrolls.
                    match record.event {
                        PipelineEvent::ItemClaimed { .. } | PipelineEvent::Idle { .. } => {
                            view.set_message(truncate(&record.message, 70));
                        }
                        _ => view.println(render_event(&record)),
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    view.println(format!("{} {} event(s) skipped", style("!").yellow(), skipped));
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let result = if once {
        runner.run_once(&cancel).await.map(|summary| {
            Some(format!(
                "{} batch(es): {} page(s) extracted, {} grouped, {} group(s) completed",
                summary.batches, summary.extracted, summary.consumed, summary.groups_completed
            ))
        })
    } else {
        runner.run(&cancel).await.map(|_| None)
    };

    // Dropping the runner closes the event channel and ends the printer.
    drop(runner);
    let _ = printer.await;
    spinner.finish_and_clear();

    match result? {
        Some(summary) => println!("{} {}", style("✓").green(), summary),
        None => println!("{} Pipeline stopped", style("✓").green()),
    }
    Ok(())
}

/// Run one stuck-job sweep.
pub async fn cmd_reclaim(settings: &Settings) -> anyhow::Result<()> {
    let ctx = settings.create_db_context()?;
    let reclaimer = Reclaimer::new(
        ctx.work_items(),
        settings.pipeline.stuck_timeout(),
        EventBus::default(),
    );
    let count = reclaimer.sweep().await?;
    println!(
        "{} Released {} claim(s) older than {}s",
        style("✓").green(),
        count,
        settings.pipeline.stuck_timeout_secs
    );
    Ok(())
}
