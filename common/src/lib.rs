/*!
common/src/lib.rs

Shared configuration types and DB helper functions for logfiler.

This file provides:
- Config data structures (deserialized from TOML)
- An async loader that merges a default file with an override file
- A helper to initialize the SQLite connection pool
*/

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

/// Database configuration section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the sqlite database file (e.g. "data/logfiler.db")
    pub path: String,
}

/// Where the daily list of changed pages comes from
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// URL of the daily change list, `{date}` is replaced by `YYYY-MM-DD`.
    /// The list is a CSV with a header and `loc,lastmod` columns.
    pub changes_url_format: Option<String>,
    /// RSS/Atom feeds consulted for news items (the only source in news-only mode)
    #[serde(default)]
    pub news_feeds: Vec<String>,
    pub fetch_timeout_seconds: Option<u64>,
}

/// Politeness / fetching configuration for the scrape stage
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolitenessConfig {
    pub concurrency: Option<usize>,
    pub min_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub fetch_timeout_seconds: Option<u64>,
    pub max_response_bytes: Option<u64>,
    /// Extractor calls allowed per record before a scrape failure is permanent
    pub max_attempts: Option<u32>,
    pub user_agent: Option<String>,
}

impl PolitenessConfig {
    pub fn concurrency(&self) -> usize {
        self.concurrency.unwrap_or(4).max(1)
    }

    /// Returns the (min, max) politeness delay, swapped if configured backwards.
    pub fn delay_range_ms(&self) -> (u64, u64) {
        let min = self.min_delay_ms.unwrap_or(1000);
        let max = self.max_delay_ms.unwrap_or(3000);
        if min <= max {
            (min, max)
        } else {
            (max, min)
        }
    }

    pub fn fetch_timeout_seconds(&self) -> u64 {
        self.fetch_timeout_seconds.unwrap_or(20)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts.unwrap_or(3).max(1)
    }

    pub fn max_response_bytes(&self) -> u64 {
        self.max_response_bytes.unwrap_or(20 * 1024 * 1024)
    }

    pub fn user_agent(&self) -> String {
        self.user_agent
            .clone()
            .unwrap_or_else(|| "logfiler/0.1.0".to_string())
    }
}

/// Model backend configuration: provider selection, the two rate tiers and retry knobs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmConfig {
    pub provider: Option<String>, // "gemini", "openrouter", "lmstudio"
    /// Cheaper/faster tier used for classification and meeting parsing
    pub flash_model: Option<String>,
    /// Costlier tier reserved for top-story ranking
    pub pro_model: Option<String>,
    pub flash_rpm: Option<u32>,
    pub pro_rpm: Option<u32>,
    /// Per-provider credentials; `<PROVIDER>_API_KEY` env vars take precedence
    #[serde(default)]
    pub api_keys: HashMap<String, String>,
    /// Per-provider endpoint URLs
    #[serde(default)]
    pub endpoints: HashMap<String, String>,
    pub timeout_seconds: Option<u64>,
    pub max_retries: Option<u32>,
    pub initial_backoff_ms: Option<u64>,
    pub max_backoff_ms: Option<u64>,
    /// Backend calls allowed per record before a classification failure is permanent
    pub max_attempts: Option<u32>,
    pub truncation_length: Option<usize>,
    pub temperature: Option<f32>,
}

impl LlmConfig {
    pub fn provider(&self) -> String {
        self.provider
            .as_deref()
            .unwrap_or("gemini")
            .trim()
            .to_lowercase()
    }

    pub fn flash_rpm(&self) -> u32 {
        self.flash_rpm.unwrap_or(15).max(1)
    }

    pub fn pro_rpm(&self) -> u32 {
        self.pro_rpm.unwrap_or(2).max(1)
    }

    pub fn timeout_seconds(&self) -> u64 {
        self.timeout_seconds.unwrap_or(60)
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries.unwrap_or(2)
    }

    pub fn initial_backoff_ms(&self) -> u64 {
        self.initial_backoff_ms.unwrap_or(2_000)
    }

    pub fn max_backoff_ms(&self) -> u64 {
        self.max_backoff_ms.unwrap_or(60_000)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts.unwrap_or(3).max(1)
    }

    pub fn truncation_length(&self) -> usize {
        self.truncation_length.unwrap_or(15_000)
    }

    /// Resolve the API key for a provider: `<PROVIDER>_API_KEY` first, then `api_keys`.
    pub fn api_key(&self, provider: &str) -> Option<String> {
        let env_name = format!("{}_API_KEY", provider.to_uppercase());
        match std::env::var(&env_name) {
            Ok(key) if !key.trim().is_empty() => Some(key),
            _ => self.api_keys.get(provider).cloned(),
        }
    }

    pub fn endpoint(&self, provider: &str) -> Option<String> {
        self.endpoints.get(provider).cloned()
    }
}

/// Pipeline-wide knobs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Content older than this is excluded automatically
    pub staleness_threshold_days: Option<i64>,
    /// Number of discovered pages processed in `--test` mode
    pub test_sample_size: Option<usize>,
}

impl PipelineConfig {
    pub fn staleness_threshold_days(&self) -> i64 {
        self.staleness_threshold_days.unwrap_or(60)
    }

    pub fn test_sample_size(&self) -> usize {
        self.test_sample_size.unwrap_or(10)
    }
}

/// Briefing output configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BriefingConfig {
    pub output_dir: Option<String>,
    pub title: Option<String>,
    pub top_stories: Option<usize>,
    /// Ask the pro tier to rank top stories
    pub rank: Option<bool>,
}

impl BriefingConfig {
    pub fn output_dir(&self) -> String {
        self.output_dir
            .clone()
            .unwrap_or_else(|| "briefings".to_string())
    }

    pub fn title(&self) -> String {
        self.title
            .clone()
            .unwrap_or_else(|| "The Commonwealth Log File".to_string())
    }

    pub fn top_stories(&self) -> usize {
        self.top_stories.unwrap_or(5)
    }

    pub fn rank(&self) -> bool {
        self.rank.unwrap_or(true)
    }
}

/// Top-level application configuration (deserialized from config.toml)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub politeness: PolitenessConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub briefing: BriefingConfig,
}

impl Config {
    /// Load configuration from a TOML file asynchronously.
    ///
    /// Example:
    ///   let cfg = Config::from_file("config.toml").await?;
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = tokio::fs::read_to_string(path.as_ref())
            .await
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;
        let cfg: Config = toml::from_str(&data).context("Failed to parse TOML configuration")?;
        Ok(cfg)
    }

    /// Load configuration with an optional default file and an optional override file.
    /// If both are present, they are merged (override takes precedence).
    pub async fn load_with_defaults(
        default_path: Option<&Path>,
        override_path: Option<&Path>,
    ) -> Result<Self> {
        let mut config_value = toml::Value::Table(toml::map::Map::new());

        for path in [default_path, override_path].into_iter().flatten() {
            if !path.exists() {
                continue;
            }
            let data = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read config: {}", path.display()))?;
            let val: toml::Value = toml::from_str(&data)
                .with_context(|| format!("Failed to parse configuration: {}", path.display()))?;
            merge_toml(&mut config_value, val);
        }

        let cfg: Config = config_value
            .try_into()
            .context("Failed to parse merged configuration")?;
        Ok(cfg)
    }
}

fn merge_toml(a: &mut toml::Value, b: toml::Value) {
    match (a, b) {
        (toml::Value::Table(a_map), toml::Value::Table(b_map)) => {
            for (k, v) in b_map {
                if let Some(a_val) = a_map.get_mut(&k) {
                    merge_toml(a_val, v);
                } else {
                    a_map.insert(k, v);
                }
            }
        }
        (a_val, b_val) => *a_val = b_val,
    }
}

/// Initialize an SQLite connection pool.
///
/// This function will create the parent directory if necessary, ensure the DB file exists
/// (attempting to create it if missing), and return a configured `SqlitePool`. The
/// journal runs in WAL mode so scrape workers can write while readers select candidates.
///
/// Example:
///   let pool = init_db_pool("data/logfiler.db").await?;
pub async fn init_db_pool(path: &str) -> Result<SqlitePool> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await.with_context(|| {
                format!("Failed to create DB parent directory: {}", parent.display())
            })?;
        }
    }

    // Creating the file up front surfaces permission or path problems with a clearer
    // error than the SQLite connection attempt would.
    tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(path)
        .await
        .with_context(|| format!("Failed to create or open DB file: {}", path))?;

    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to connect to sqlite database at path: {}", path))?;

    Ok(pool)
}
