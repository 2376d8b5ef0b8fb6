use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::aggregator::{AggregatorConfig, LatePolicy};

const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub source: SourceConfig,
    pub aggregator: AggregatorSection,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    pub sink: SinkConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceMode {
    Live,
    Replay,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub mode: SourceMode,
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    #[serde(default)]
    pub product_ids: Vec<String>,
    #[serde(default)]
    pub replay_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AggregatorSection {
    pub window: String,
    #[serde(default)]
    pub origin_ms: i64,
    #[serde(default = "default_patience_secs")]
    pub patience_secs: u64,
    #[serde(default)]
    pub late_policy: LatePolicy,
    #[serde(default = "default_history_len")]
    pub history_len: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    Memory,
    Sqlite,
    FeatureStore,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SinkConfig {
    pub kind: SinkKind,
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: PathBuf,
    #[serde(default)]
    pub feature_store_url: Option<String>,
    #[serde(default = "default_feature_group_name")]
    pub feature_group_name: String,
    #[serde(default = "default_feature_group_version")]
    pub feature_group_version: u32,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_retry_initial_ms")]
    pub retry_initial_ms: u64,
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

fn default_ws_url() -> String {
    "wss://ws.kraken.com/v2".to_string()
}

fn default_patience_secs() -> u64 {
    10
}

fn default_history_len() -> usize {
    16
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("data/ohlc.sqlite")
}

fn default_feature_group_name() -> String {
    "ohlc".to_string()
}

fn default_feature_group_version() -> u32 {
    1
}

fn default_buffer_size() -> usize {
    1
}

fn default_retry_initial_ms() -> u64 {
    200
}

fn default_retry_max_ms() -> u64 {
    5_000
}

fn default_max_retries() -> u32 {
    5
}

/// Parse a window length string (e.g. "500ms", "1s", "1m", "1h", "1d", "1w") into milliseconds.
pub fn parse_window_ms(s: &str) -> Result<u64> {
    let s = s.trim();
    let split_at = s
        .find(|c: char| !c.is_ascii_digit())
        .filter(|&idx| idx > 0);
    let Some(split_at) = split_at else {
        bail!("invalid window '{}': expected format like '1m'", s);
    };

    let (num_str, suffix) = s.split_at(split_at);
    let n: u64 = num_str
        .parse()
        .with_context(|| format!("invalid window '{}': quantity must be a positive integer", s))?;
    if n == 0 {
        bail!("invalid window '{}': quantity must be > 0", s);
    }

    let unit_ms = match suffix {
        "ms" => 1,
        "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        "w" => 7 * 86_400_000,
        _ => bail!(
            "invalid window '{}': unsupported suffix '{}', expected one of ms/s/m/h/d/w",
            s,
            suffix
        ),
    };

    n.checked_mul(unit_ms)
        .filter(|ms| *ms <= i64::MAX as u64)
        .with_context(|| format!("invalid window '{}': value is too large", s))
}

impl SourceConfig {
    /// Normalized product ids, trimmed and deduplicated in declaration order.
    pub fn products(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for id in &self.product_ids {
            let id = id.trim().to_ascii_uppercase();
            if !id.is_empty() && !out.iter().any(|v| v == &id) {
                out.push(id);
            }
        }
        out
    }
}

impl AggregatorSection {
    pub fn window_ms(&self) -> Result<i64> {
        Ok(parse_window_ms(&self.window)? as i64)
    }

    pub fn patience(&self) -> Duration {
        Duration::from_secs(self.patience_secs)
    }

    pub fn to_aggregator_config(&self) -> Result<AggregatorConfig> {
        Ok(AggregatorConfig {
            window_ms: self.window_ms()?,
            origin_ms: self.origin_ms,
            late_policy: self.late_policy,
            history_len: self.history_len,
        })
    }
}

impl SinkConfig {
    pub fn retry_initial(&self) -> Duration {
        Duration::from_millis(self.retry_initial_ms)
    }

    pub fn retry_max(&self) -> Duration {
        Duration::from_millis(self.retry_max_ms)
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config_path = std::env::var("CANDLE_PIPELINE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
        let mut config = Self::from_path(&config_path)?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&config_str).with_context(|| format!("failed to parse {}", path.display()))
    }

    /// Apply `OHLC_WINDOW_SECONDS`, `PRODUCT_IDS` and `FEATURE_STORE_URL`
    /// overrides, reading variables through `lookup`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(secs) = lookup("OHLC_WINDOW_SECONDS") {
            let secs: u64 = secs
                .trim()
                .parse()
                .with_context(|| format!("OHLC_WINDOW_SECONDS '{}' is not an integer", secs))?;
            self.aggregator.window = format!("{}s", secs);
        }
        if let Some(ids) = lookup("PRODUCT_IDS") {
            self.source.product_ids = ids.split(',').map(|s| s.trim().to_string()).collect();
        }
        if let Some(url) = lookup("FEATURE_STORE_URL") {
            self.sink.feature_store_url = Some(url.trim().to_string());
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.aggregator
            .window_ms()
            .context("aggregator.window is invalid")?;
        if self.aggregator.origin_ms < 0 {
            bail!("aggregator.origin_ms must be >= 0");
        }
        if self.aggregator.patience_secs == 0 {
            bail!("aggregator.patience_secs must be > 0");
        }
        if self.aggregator.late_policy == LatePolicy::Reopen && self.aggregator.history_len == 0 {
            bail!("aggregator.history_len must be > 0 with late_policy = \"reopen\"");
        }
        if self.pipeline.channel_capacity == 0 {
            bail!("pipeline.channel_capacity must be > 0");
        }
        match self.source.mode {
            SourceMode::Live => {
                if self.source.products().is_empty() {
                    bail!("source.product_ids must not be empty in live mode");
                }
                url::Url::parse(&self.source.ws_url)
                    .with_context(|| format!("source.ws_url '{}' is invalid", self.source.ws_url))?;
            }
            SourceMode::Replay => {
                if self.source.replay_path.is_none() {
                    bail!("source.replay_path is required in replay mode");
                }
            }
        }
        if self.sink.buffer_size == 0 {
            bail!("sink.buffer_size must be > 0");
        }
        if self.sink.retry_initial_ms == 0 || self.sink.retry_max_ms < self.sink.retry_initial_ms {
            bail!("sink retry delays must satisfy 0 < retry_initial_ms <= retry_max_ms");
        }
        if self.sink.kind == SinkKind::FeatureStore {
            let raw = self
                .sink
                .feature_store_url
                .as_deref()
                .context("sink.feature_store_url is required for the feature_store sink")?;
            url::Url::parse(raw)
                .with_context(|| format!("sink.feature_store_url '{}' is invalid", raw))?;
        }
        Ok(())
    }
}
