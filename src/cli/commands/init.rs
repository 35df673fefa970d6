//! Initialize command.

use console::style;

use crate::config::Settings;

/// Initialize the data directory and database.
pub async fn cmd_init(settings: &Settings) -> anyhow::Result<()> {
    settings.ensure_directories()?;

    let ctx = settings.create_db_context()?;
    ctx.init_schema().await?;

    if settings.ocr.api_keys.is_empty() {
        println!(
            "{} No OCR API keys configured",
            style("!").yellow()
        );
        println!("  Set OCR_API_KEY_1 (or OCR_API_KEYS) or add api_keys to the [ocr] section");
    }

    let location = if settings.is_postgres() {
        "PostgreSQL".to_string()
    } else {
        settings.data_dir.display().to_string()
    };
    println!("{} Initialized pagebind in {}", style("✓").green(), location);

    Ok(())
}
