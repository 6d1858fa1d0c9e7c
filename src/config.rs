//! TOML configuration.
//!
//! ```toml
//! [db]
//! url = "sqlite:./data/target.db"      # BACKFILL_DATABASE_URL wins
//!
//! [progress]
//! backend = "file"                      # or "sqlite"
//! path = "./data/progress.json"
//!
//! [ingest]
//! min_batch_rows = 2000
//! max_batch_rows = 5000
//! date_floor = "2023-01-01"
//!
//! [datasets.transactions]
//! format = "csv"
//! path = "./exports/transactions.csv"
//! timestamp_field = "created_at"
//! key_fields = ["txn_id"]
//! ```

use anyhow::{bail, Context, Result};
use backfill_harness_core::engine::EngineConfig;
use backfill_harness_core::planner::BatchBudget;
use backfill_harness_core::retry::Backoff;
use backfill_harness_core::sink::KeyColumns;
use chrono::NaiveDate;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable carrying the target connection string.
pub const DATABASE_URL_ENV: &str = "BACKFILL_DATABASE_URL";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub progress: ProgressConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub dedupe: DedupeConfig,
    #[serde(default)]
    pub datasets: BTreeMap<String, DatasetConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
        }
    }
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProgressBackend {
    /// JSON file, rewritten atomically on every update.
    #[default]
    File,
    /// `ingestion_progress` table in the target database.
    Sqlite,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProgressConfig {
    #[serde(default)]
    pub backend: ProgressBackend,
    #[serde(default = "default_progress_path")]
    pub path: PathBuf,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            backend: ProgressBackend::default(),
            path: default_progress_path(),
        }
    }
}

fn default_progress_path() -> PathBuf {
    PathBuf::from("./data/progress.json")
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_min_batch_rows")]
    pub min_batch_rows: u64,
    #[serde(default = "default_max_batch_rows")]
    pub max_batch_rows: u64,
    /// Earliest date to ingest (`YYYY-MM-DD`). Datasets may override it.
    #[serde(default)]
    pub date_floor: Option<String>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            min_batch_rows: default_min_batch_rows(),
            max_batch_rows: default_max_batch_rows(),
            date_floor: None,
        }
    }
}

fn default_chunk_size() -> usize {
    1_000
}
fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    500
}
fn default_backoff_max_ms() -> u64 {
    30_000
}
fn default_min_batch_rows() -> u64 {
    2_000
}
fn default_max_batch_rows() -> u64 {
    50_000
}

impl IngestConfig {
    pub fn budget(&self) -> Result<BatchBudget> {
        BatchBudget::new(self.min_batch_rows, self.max_batch_rows)
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            chunk_size: self.chunk_size,
            max_attempts: self.max_attempts,
            backoff: Backoff::new(
                Duration::from_millis(self.backoff_base_ms),
                Duration::from_millis(self.backoff_max_ms),
            ),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MonitorConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
        }
    }
}

fn default_interval_secs() -> u64 {
    5
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct DedupeConfig {
    /// Target table columns forming the natural key.
    #[serde(default = "default_key_columns")]
    pub key_columns: Vec<String>,
}

impl Default for DedupeConfig {
    fn default() -> Self {
        Self {
            key_columns: default_key_columns(),
        }
    }
}

fn default_key_columns() -> Vec<String> {
    vec!["dataset".to_string(), "natural_key".to_string()]
}

impl DedupeConfig {
    pub fn key(&self) -> Result<KeyColumns> {
        KeyColumns::new(&self.key_columns)
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SourceFormat {
    Csv,
    Jsonl,
}

impl SourceFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceFormat::Csv => "csv",
            SourceFormat::Jsonl => "jsonl",
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatasetConfig {
    pub format: SourceFormat,
    pub path: PathBuf,
    pub timestamp_field: String,
    pub key_fields: Vec<String>,
    #[serde(default)]
    pub required_fields: Vec<String>,
    /// Overrides `[ingest].date_floor` for this dataset.
    #[serde(default)]
    pub date_floor: Option<String>,
}

impl Config {
    /// Connection string for the target store. `env_override` (normally
    /// `BACKFILL_DATABASE_URL`) wins over `[db].url`.
    pub fn database_url(&self, env_override: Option<&str>) -> Result<String> {
        match env_override.filter(|s| !s.trim().is_empty()).or(self.db.url.as_deref()) {
            Some(url) => Ok(url.to_string()),
            None => bail!(
                "no target database configured: set {} or [db].url",
                DATABASE_URL_ENV
            ),
        }
    }

    pub fn dataset(&self, name: &str) -> Result<&DatasetConfig> {
        match self.datasets.get(name) {
            Some(d) => Ok(d),
            None => bail!(
                "Unknown dataset: '{}'. Configured: {}",
                name,
                self.dataset_names().join(", ")
            ),
        }
    }

    pub fn dataset_names(&self) -> Vec<String> {
        self.datasets.keys().cloned().collect()
    }

    /// Resolve `all` or a single dataset name into a list of names.
    pub fn select_datasets(&self, selector: &str) -> Result<Vec<String>> {
        if selector == "all" {
            if self.datasets.is_empty() {
                bail!("no datasets configured");
            }
            return Ok(self.dataset_names());
        }
        self.dataset(selector)?;
        Ok(vec![selector.to_string()])
    }

    /// Effective date floor for a dataset.
    pub fn date_floor(&self, dataset: &str) -> Result<Option<NaiveDate>> {
        let raw = self
            .datasets
            .get(dataset)
            .and_then(|d| d.date_floor.as_deref())
            .or(self.ingest.date_floor.as_deref());
        raw.map(parse_date).transpose()
    }
}

fn parse_date(raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .with_context(|| format!("invalid date '{}': expected YYYY-MM-DD", raw))
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.db.max_connections == 0 {
        bail!("db.max_connections must be > 0");
    }

    // Validate ingest
    if config.ingest.chunk_size == 0 {
        bail!("ingest.chunk_size must be > 0");
    }
    if config.ingest.max_attempts == 0 {
        bail!("ingest.max_attempts must be >= 1");
    }
    if config.ingest.backoff_base_ms > config.ingest.backoff_max_ms {
        bail!("ingest.backoff_base_ms must be <= ingest.backoff_max_ms");
    }
    config
        .ingest
        .budget()
        .with_context(|| "invalid [ingest] batch bounds")?;
    if let Some(raw) = &config.ingest.date_floor {
        parse_date(raw).with_context(|| "invalid ingest.date_floor")?;
    }

    if config.monitor.interval_secs == 0 {
        bail!("monitor.interval_secs must be > 0");
    }

    config
        .dedupe
        .key()
        .with_context(|| "invalid dedupe.key_columns")?;

    // Validate datasets
    for (name, dataset) in &config.datasets {
        if dataset.timestamp_field.trim().is_empty() {
            bail!("datasets.{}.timestamp_field must not be empty", name);
        }
        if dataset.key_fields.is_empty() {
            bail!("datasets.{}.key_fields must name at least one field", name);
        }
        if let Some(raw) = &dataset.date_floor {
            parse_date(raw).with_context(|| format!("invalid datasets.{}.date_floor", name))?;
        }
    }

    Ok(())
}
