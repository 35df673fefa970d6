//! Configuration management for pagebind using the prefer crate.
//!
//! Layers, lowest priority first: built-in defaults, the config file
//! (discovered by prefer or given with `--config`), environment variables,
//! then command-line flags applied by the CLI.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ocr::{group_credentials, Credential, OcrRequestOptions, RetryPolicy, DEFAULT_BOOKMARK_MARKER};
use crate::repository::util::is_postgres_url;
use crate::repository::DbContext;

/// Default database filename.
pub const DEFAULT_DATABASE_FILENAME: &str = "pagebind.db";

/// Default page image subdirectory name.
const PAGES_SUBDIR: &str = "pages";

/// Highest numbered `OCR_API_KEY_n` variable that is read.
const MAX_NUMBERED_KEYS: usize = 16;

/// OCR service settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OcrSettings {
    pub service_url: String,
    pub request_timeout_secs: u64,
    pub task_type: String,
    pub figure_language: String,
    pub api_keys: Vec<String>,
}

impl Default for OcrSettings {
    fn default() -> Self {
        let options = OcrRequestOptions::default();
        Self {
            service_url: "http://localhost:8000".to_string(),
            request_timeout_secs: 300,
            task_type: options.task_type,
            figure_language: options.figure_language,
            api_keys: Vec::new(),
        }
    }
}

impl OcrSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn request_options(&self) -> OcrRequestOptions {
        OcrRequestOptions {
            task_type: self.task_type.clone(),
            figure_language: self.figure_language.clone(),
        }
    }
}

/// Worker pool, grouping and polling settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub grouping_poll_ms: u64,
    /// Pause before retrying a failed grouping write.
    pub grouping_retry_ms: u64,
    pub idle_interval_secs: u64,
    pub stuck_timeout_secs: u64,
    pub reclaim_interval_secs: u64,
    pub batch_size: i64,
    pub keys_per_worker: usize,
    pub bookmark_marker: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_base_delay_ms: 1000,
            grouping_poll_ms: 250,
            grouping_retry_ms: 1000,
            idle_interval_secs: 2,
            stuck_timeout_secs: 600,
            reclaim_interval_secs: 300,
            batch_size: 500,
            keys_per_worker: 1,
            bookmark_marker: DEFAULT_BOOKMARK_MARKER.to_string(),
        }
    }
}

impl PipelineConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.retry_base_delay_ms),
        )
    }

    pub fn grouping_poll(&self) -> Duration {
        Duration::from_millis(self.grouping_poll_ms)
    }

    pub fn grouping_retry(&self) -> Duration {
        Duration::from_millis(self.grouping_retry_ms)
    }

    pub fn idle_interval(&self) -> Duration {
        Duration::from_secs(self.idle_interval_secs)
    }

    pub fn stuck_timeout(&self) -> Duration {
        Duration::from_secs(self.stuck_timeout_secs)
    }

    pub fn reclaim_interval(&self) -> Duration {
        Duration::from_secs(self.reclaim_interval_secs)
    }
}

/// Application settings.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Base data directory.
    pub data_dir: PathBuf,
    /// Database filename.
    pub database_filename: String,
    /// Database URL (overrides data_dir/database_filename if set).
    pub database_url: Option<String>,
    /// Directory for page images.
    pub pages_dir: PathBuf,
    pub ocr: OcrSettings,
    pub pipeline: PipelineConfig,
}

impl Default for Settings {
    fn default() -> Self {
        // ~/Documents/pagebind, falling back to home then the current dir
        let data_dir = dirs::document_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("pagebind");

        Self {
            pages_dir: data_dir.join(PAGES_SUBDIR),
            data_dir,
            database_filename: DEFAULT_DATABASE_FILENAME.to_string(),
            database_url: None,
            ocr: OcrSettings::default(),
            pipeline: PipelineConfig::default(),
        }
    }
}

impl Settings {
    /// Create settings with a custom data directory.
    pub fn with_data_dir(data_dir: PathBuf) -> Self {
        Self {
            pages_dir: data_dir.join(PAGES_SUBDIR),
            data_dir,
            ..Default::default()
        }
    }

    /// Get the database URL, constructing from path if not explicitly set.
    pub fn database_url(&self) -> String {
        if let Some(ref url) = self.database_url {
            url.clone()
        } else {
            format!("sqlite:{}", self.database_path().display())
        }
    }

    /// Check if using PostgreSQL (vs SQLite).
    pub fn is_postgres(&self) -> bool {
        self.database_url
            .as_ref()
            .is_some_and(|url| is_postgres_url(url))
    }

    /// Get the full path to the database (for SQLite file-based databases).
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(&self.database_filename)
    }

    /// Ensure the data and page directories exist.
    pub fn ensure_directories(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(&self.pages_dir)?;
        Ok(())
    }

    /// Create a database context using the configured database URL or path.
    pub fn create_db_context(&self) -> Result<DbContext, diesel::result::Error> {
        DbContext::from_url(&self.database_url(), &self.pages_dir)
    }

    /// OCR credentials, one per worker.
    pub fn credentials(&self) -> Vec<Credential> {
        group_credentials(&self.ocr.api_keys, self.pipeline.keys_per_worker)
    }

    /// Apply environment variable overrides.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    fn apply_env_from(&mut self, get: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| get(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = get("DATABASE_URL") {
            tracing::debug!("Using DATABASE_URL from environment");
            self.database_url = Some(url);
        }
        if let Some(url) = get("OCR_SERVICE_URL") {
            self.ocr.service_url = url;
        }

        let mut keys: Vec<String> = (1..=MAX_NUMBERED_KEYS)
            .filter_map(|n| get(&format!("OCR_API_KEY_{n}")))
            .collect();
        if let Some(list) = get("OCR_API_KEYS") {
            keys.extend(
                list.split(',')
                    .map(|k| k.trim().to_string())
                    .filter(|k| !k.is_empty()),
            );
        }
        if !keys.is_empty() {
            tracing::debug!("Using {} OCR API key(s) from environment", keys.len());
            self.ocr.api_keys = keys;
        }
    }
}

/// `ocr` section of the config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, prefer::FromValue)]
pub struct OcrFileConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub figure_language: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[prefer(default)]
    pub api_keys: Vec<String>,
}

/// `pipeline` section of the config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, prefer::FromValue)]
pub struct PipelineFileConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_base_delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grouping_poll_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grouping_retry_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_interval_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stuck_timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reclaim_interval_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keys_per_worker: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bookmark_marker: Option<String>,
}

/// Configuration file structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize, prefer::FromValue)]
pub struct Config {
    /// Data directory path.
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "target")]
    pub data_dir: Option<String>,
    /// Database filename.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    /// Database URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,
    #[serde(default)]
    #[prefer(default)]
    pub ocr: OcrFileConfig,
    #[serde(default)]
    #[prefer(default)]
    pub pipeline: PipelineFileConfig,
    /// Path to the config file this was loaded from (not serialized).
    #[serde(skip)]
    #[prefer(skip)]
    pub source_path: Option<PathBuf>,
}

impl Config {
    /// Load configuration using prefer crate for discovery.
    /// Automatically discovers pagebind config files in standard locations.
    pub async fn load() -> Self {
        match prefer::load("pagebind").await {
            Ok(pref_config) => match pref_config.source_path() {
                Some(path) => Self::load_from_path(path).await.unwrap_or_else(|e| {
                    tracing::warn!("{}", e);
                    Self::default()
                }),
                None => Self::default(),
            },
            // No config file found
            Err(_) => Self::default(),
        }
    }

    /// Load configuration from a specific file path.
    /// The format follows the extension: TOML, YAML, otherwise JSON.
    pub async fn load_from_path(path: &Path) -> Result<Self, String> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| format!("Failed to read config file: {}", e))?;

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("json");

        let mut config: Config = match ext {
            "toml" => toml::from_str(&contents)
                .map_err(|e| format!("Failed to parse TOML config: {}", e))?,
            "yaml" | "yml" => serde_yaml::from_str(&contents)
                .map_err(|e| format!("Failed to parse YAML config: {}", e))?,
            _ => serde_json::from_str(&contents)
                .map_err(|e| format!("Failed to parse JSON config: {}", e))?,
        };

        config.source_path = Some(path.to_path_buf());
        Ok(config)
    }

    /// Get the base directory for resolving relative paths.
    pub fn base_dir(&self) -> Option<PathBuf> {
        self.source_path
            .as_ref()
            .and_then(|p| p.parent().map(|p| p.to_path_buf()))
    }

    /// Resolve a path that may be relative to the config file.
    /// - Absolute paths are returned as-is
    /// - Paths starting with ~ are expanded
    /// - Relative paths are resolved relative to `base_dir`
    pub fn resolve_path(&self, path_str: &str, base_dir: &Path) -> PathBuf {
        let expanded = shellexpand::tilde(path_str);
        let path = Path::new(expanded.as_ref());

        if path.is_absolute() {
            path.to_path_buf()
        } else {
            base_dir.join(path)
        }
    }

    /// Apply configuration to settings.
    pub fn apply_to_settings(&self, settings: &mut Settings, base_dir: &Path) {
        if let Some(ref data_dir) = self.data_dir {
            settings.data_dir = self.resolve_path(data_dir, base_dir);
            settings.pages_dir = settings.data_dir.join(PAGES_SUBDIR);
        }
        if let Some(ref database) = self.database {
            settings.database_filename = database.clone();
        }
        if let Some(ref url) = self.database_url {
            settings.database_url = Some(url.clone());
        }

        let ocr = &mut settings.ocr;
        if let Some(ref url) = self.ocr.service_url {
            ocr.service_url = url.clone();
        }
        if let Some(timeout) = self.ocr.request_timeout_secs {
            ocr.request_timeout_secs = timeout;
        }
        if let Some(ref task_type) = self.ocr.task_type {
            ocr.task_type = task_type.clone();
        }
        if let Some(ref language) = self.ocr.figure_language {
            ocr.figure_language = language.clone();
        }
        if !self.ocr.api_keys.is_empty() {
            ocr.api_keys = self.ocr.api_keys.clone();
        }

        let file = &self.pipeline;
        let pipeline = &mut settings.pipeline;
        if let Some(n) = file.max_attempts {
            pipeline.max_attempts = u32::try_from(n).unwrap_or(u32::MAX).max(1);
        }
        if let Some(ms) = file.retry_base_delay_ms {
            pipeline.retry_base_delay_ms = ms;
        }
        if let Some(ms) = file.grouping_poll_ms {
            pipeline.grouping_poll_ms = ms;
        }
        if let Some(ms) = file.grouping_retry_ms {
            pipeline.grouping_retry_ms = ms;
        }
        if let Some(secs) = file.idle_interval_secs {
            pipeline.idle_interval_secs = secs;
        }
        if let Some(secs) = file.stuck_timeout_secs {
            pipeline.stuck_timeout_secs = secs;
        }
        if let Some(secs) = file.reclaim_interval_secs {
            pipeline.reclaim_interval_secs = secs;
        }
        if let Some(n) = file.batch_size {
            pipeline.batch_size = i64::try_from(n).unwrap_or(i64::MAX).max(1);
        }
        if let Some(n) = file.keys_per_worker {
            pipeline.keys_per_worker = usize::try_from(n).unwrap_or(1).max(1);
        }
        if let Some(ref marker) = file.bookmark_marker {
            pipeline.bookmark_marker = marker.clone();
        }
    }
}

/// Options for loading settings.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Explicit config file path (overrides auto-discovery).
    pub config_path: Option<PathBuf>,
    /// Data directory (--target flag).
    pub data_dir: Option<PathBuf>,
}

/// Load settings: defaults, then the config file, then the environment.
pub async fn load_settings_with_options(options: LoadOptions) -> anyhow::Result<(Settings, Config)> {
    let config = match options.config_path {
        Some(ref path) => Config::load_from_path(path)
            .await
            .map_err(|e| anyhow::anyhow!("{}: {}", path.display(), e))?,
        None => Config::load().await,
    };

    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let base_dir = config.base_dir().unwrap_or_else(|| cwd.clone());

    let mut settings = Settings::default();
    config.apply_to_settings(&mut settings, &base_dir);
    settings.apply_env();

    if let Some(data_dir) = options.data_dir {
        let data_dir = if data_dir.is_absolute() {
            data_dir
        } else {
            cwd.join(data_dir)
        };
        settings.pages_dir = data_dir.join(PAGES_SUBDIR);
        settings.data_dir = data_dir;
    }

    Ok((settings, config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let settings = Settings::with_data_dir(PathBuf::from("/data"));
        assert_eq!(settings.pages_dir, PathBuf::from("/data/pages"));
        assert_eq!(settings.database_url(), "sqlite:/data/pagebind.db");
        assert_eq!(settings.pipeline.stuck_timeout(), Duration::from_secs(600));
        assert_eq!(settings.pipeline.retry_policy().max_attempts, 3);
        assert_eq!(settings.ocr.service_url, "http://localhost:8000");
        assert!(!settings.is_postgres());
    }

    #[tokio::test]
    async fn test_load_toml_and_apply() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pagebind.toml");
        std::fs::write(
            &path,
            r#"
data_dir = "store"

[ocr]
service_url = "http://ocr:9000"
api_keys = ["a", "b", "c"]

[pipeline]
max_attempts = 5
keys_per_worker = 2
bookmark_marker = "SEPARATOR"
"#,
        )
        .unwrap();

        let config = Config::load_from_path(&path).await.unwrap();
        let mut settings = Settings::default();
        config.apply_to_settings(&mut settings, &config.base_dir().unwrap());

        assert_eq!(settings.data_dir, dir.path().join("store"));
        assert_eq!(settings.pages_dir, dir.path().join("store").join("pages"));
        assert_eq!(settings.ocr.service_url, "http://ocr:9000");
        assert_eq!(settings.pipeline.max_attempts, 5);
        assert_eq!(settings.pipeline.bookmark_marker, "SEPARATOR");
        assert_eq!(settings.pipeline.grouping_poll_ms, 250);

        let credentials = settings.credentials();
        assert_eq!(credentials.len(), 2);
        assert_eq!(credentials[1].keys(), ["c".to_string()]);
    }

    #[tokio::test]
    async fn test_load_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pagebind.yaml");
        std::fs::write(&path, "pipeline:\n  batch_size: 20\n  idle_interval_secs: 9\n").unwrap();

        let config = Config::load_from_path(&path).await.unwrap();
        let mut settings = Settings::default();
        config.apply_to_settings(&mut settings, dir.path());
        assert_eq!(settings.pipeline.batch_size, 20);
        assert_eq!(settings.pipeline.idle_interval(), Duration::from_secs(9));
    }

    #[tokio::test]
    async fn test_invalid_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(Config::load_from_path(&path).await.is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("DATABASE_URL", "postgres://db/pagebind"),
            ("OCR_SERVICE_URL", "http://ocr.internal"),
            ("OCR_API_KEY_1", "k1"),
            ("OCR_API_KEY_3", "k3"),
            ("OCR_API_KEYS", "k4, ,k5"),
        ]
        .into_iter()
        .collect();

        let mut settings = Settings::default();
        settings.apply_env_from(|key| env.get(key).map(|v| v.to_string()));

        assert!(settings.is_postgres());
        assert_eq!(settings.database_url(), "postgres://db/pagebind");
        assert_eq!(settings.ocr.service_url, "http://ocr.internal");
        assert_eq!(settings.ocr.api_keys, vec!["k1", "k3", "k4", "k5"]);
    }

    #[test]
    fn test_resolve_path() {
        let config = Config::default();
        let base = Path::new("/etc/pagebind");
        assert_eq!(
            config.resolve_path("/abs/data", base),
            PathBuf::from("/abs/data")
        );
        assert_eq!(
            config.resolve_path("rel", base),
            PathBuf::from("/etc/pagebind/rel")
        );
    }
}
