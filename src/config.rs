//! Runtime configuration from environment variables
//!
//! `.env` is honoured through `dotenv` in the binary. Unparseable values fall
//! back to their defaults; only the counter catalogue is validated strictly.

use crate::pipeline::aggregator::{AggregatorConfig, FieldSelector};
use crate::pipeline::delta::{CounterSpec, DeltaConfig};
use crate::pipeline::ingestion::GateConfig;
use crate::pipeline::series::SeriesCatalog;
use crate::store::RetryPolicy;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// Entry of `TIERFLOW_COUNTERS` that is not `name:monotonic` or `name:depleting[:ceiling]`
    InvalidCounter(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidCounter(entry) => write!(
                f,
                "Invalid counter '{}' (expected name:monotonic or name:depleting[:ceiling])",
                entry
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Clone)]
pub struct TierflowConfig {
    /// Hot-store SQLite database file
    pub db_path: String,
    /// Directory holding `*.sql` migrations
    pub schema_dir: String,
    /// Root directory of the filesystem cold store
    pub cold_root: String,

    pub staleness_secs: i64,
    pub duplicate_window_ms: i64,
    pub discarded_parameters: Vec<String>,

    pub excluded_station_classes: Vec<String>,

    pub fuel_reset_ceiling: f64,
    /// Raw `TIERFLOW_COUNTERS` value; default catalogue when unset
    pub counters: Option<String>,

    pub reading_retention_secs: i64,
    pub bucket_retention_secs: i64,
    pub summary_retention_secs: i64,
    pub archive_interval_secs: i64,

    pub cold_timeout_ms: u64,
    pub cold_max_retries: u32,
    pub cold_retry_initial_ms: u64,
    pub cold_retry_max_ms: u64,

    pub scheduler_poll_ms: u64,
    /// Ingestion channel buffer (message-bus adapter -> gate)
    pub channel_buffer: usize,
    pub webhook_url: Option<String>,

    /// Master enable flag
    pub enabled: bool,
}

fn parsed<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, var: &str, default: T) -> T {
    lookup(var)
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn list(lookup: &impl Fn(&str) -> Option<String>, var: &str) -> Vec<String> {
    lookup(var)
        .map(|s| {
            s.split(',')
                .map(|item| item.trim().to_string())
                .filter(|item| !item.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn non_blank(lookup: &impl Fn(&str) -> Option<String>, var: &str) -> Option<String> {
    lookup(var).filter(|s| !s.trim().is_empty())
}

impl TierflowConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `TIERFLOW_DB_PATH` (default: /var/lib/tierflow/tierflow.db)
    /// - `TIERFLOW_SCHEMA_DIR` (default: sql)
    /// - `TIERFLOW_COLD_ROOT` (default: /var/lib/tierflow/archive)
    /// - `TIERFLOW_STALENESS_SECS` (default: 900)
    /// - `TIERFLOW_DUPLICATE_WINDOW_MS` (default: 1000)
    /// - `TIERFLOW_DISCARDED_PARAMS` (comma-separated, default: none)
    /// - `TIERFLOW_EXCLUDED_STATION_CLASSES` (comma-separated, default: none)
    /// - `TIERFLOW_FUEL_RESET_CEILING` (default: 100)
    /// - `TIERFLOW_COUNTERS` (default: built-in catalogue)
    /// - `TIERFLOW_READING_RETENTION_SECS` (default: 3600)
    /// - `TIERFLOW_BUCKET_RETENTION_SECS` (default: 4500)
    /// - `TIERFLOW_SUMMARY_RETENTION_SECS` (default: 172800)
    /// - `TIERFLOW_ARCHIVE_INTERVAL_SECS` (default: 300)
    /// - `TIERFLOW_COLD_TIMEOUT_MS` (default: 5000)
    /// - `TIERFLOW_COLD_MAX_RETRIES` (default: 3)
    /// - `TIERFLOW_COLD_RETRY_INITIAL_MS` (default: 200)
    /// - `TIERFLOW_COLD_RETRY_MAX_MS` (default: 2000)
    /// - `TIERFLOW_SCHEDULER_POLL_MS` (default: 1000)
    /// - `TIERFLOW_CHANNEL_BUFFER` (default: 10000)
    /// - `TIERFLOW_WEBHOOK_URL` (optional)
    /// - `ENABLE_TIERFLOW` (default: false)
    pub fn from_env() -> Self {
        Self::from_lookup(|var| env::var(var).ok())
    }

    /// Build the configuration from any variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let lookup = &lookup;
        Self {
            db_path: lookup("TIERFLOW_DB_PATH")
                .unwrap_or_else(|| "/var/lib/tierflow/tierflow.db".to_string()),
            schema_dir: lookup("TIERFLOW_SCHEMA_DIR").unwrap_or_else(|| "sql".to_string()),
            cold_root: lookup("TIERFLOW_COLD_ROOT")
                .unwrap_or_else(|| "/var/lib/tierflow/archive".to_string()),

            staleness_secs: parsed(lookup, "TIERFLOW_STALENESS_SECS", 900),
            duplicate_window_ms: parsed(lookup, "TIERFLOW_DUPLICATE_WINDOW_MS", 1_000),
            discarded_parameters: list(lookup, "TIERFLOW_DISCARDED_PARAMS"),

            excluded_station_classes: list(lookup, "TIERFLOW_EXCLUDED_STATION_CLASSES"),

            fuel_reset_ceiling: parsed(lookup, "TIERFLOW_FUEL_RESET_CEILING", 100.0),
            counters: non_blank(lookup, "TIERFLOW_COUNTERS"),

            reading_retention_secs: parsed(lookup, "TIERFLOW_READING_RETENTION_SECS", 3_600),
            bucket_retention_secs: parsed(lookup, "TIERFLOW_BUCKET_RETENTION_SECS", 4_500),
            summary_retention_secs: parsed(lookup, "TIERFLOW_SUMMARY_RETENTION_SECS", 172_800),
            archive_interval_secs: parsed(lookup, "TIERFLOW_ARCHIVE_INTERVAL_SECS", 300),

            cold_timeout_ms: parsed(lookup, "TIERFLOW_COLD_TIMEOUT_MS", 5_000),
            cold_max_retries: parsed(lookup, "TIERFLOW_COLD_MAX_RETRIES", 3),
            cold_retry_initial_ms: parsed(lookup, "TIERFLOW_COLD_RETRY_INITIAL_MS", 200),
            cold_retry_max_ms: parsed(lookup, "TIERFLOW_COLD_RETRY_MAX_MS", 2_000),

            scheduler_poll_ms: parsed(lookup, "TIERFLOW_SCHEDULER_POLL_MS", 1_000),
            channel_buffer: parsed(lookup, "TIERFLOW_CHANNEL_BUFFER", 10_000),
            webhook_url: non_blank(lookup, "TIERFLOW_WEBHOOK_URL"),

            enabled: parsed(lookup, "ENABLE_TIERFLOW", false),
        }
    }

    pub fn gate_config(&self) -> GateConfig {
        GateConfig {
            staleness_limit: chrono::Duration::seconds(self.staleness_secs),
            duplicate_window: chrono::Duration::milliseconds(self.duplicate_window_ms),
            discarded_parameters: self.discarded_parameters.clone(),
        }
    }

    pub fn aggregator_config(&self) -> AggregatorConfig {
        AggregatorConfig {
            fields: FieldSelector::default(),
            excluded_station_classes: self.excluded_station_classes.clone(),
        }
    }

    pub fn delta_config(&self) -> Result<DeltaConfig, ConfigError> {
        let mut config = DeltaConfig::with_reset_ceiling(self.fuel_reset_ceiling);
        if let Some(spec) = &self.counters {
            config.counters = parse_counters(spec, self.fuel_reset_ceiling)?;
        }
        Ok(config)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            timeout: Duration::from_millis(self.cold_timeout_ms),
            max_retries: self.cold_max_retries,
            initial_delay: Duration::from_millis(self.cold_retry_initial_ms),
            max_delay: Duration::from_millis(self.cold_retry_max_ms),
        }
    }

    pub fn catalog(&self) -> SeriesCatalog {
        SeriesCatalog::new(
            chrono::Duration::seconds(self.reading_retention_secs),
            chrono::Duration::seconds(self.bucket_retention_secs),
            chrono::Duration::seconds(self.summary_retention_secs),
        )
    }

    pub fn archive_every(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.archive_interval_secs.max(1))
    }
}

/// Parse `name:monotonic,name:depleting[:ceiling],...`
pub fn parse_counters(spec: &str, default_ceiling: f64) -> Result<Vec<CounterSpec>, ConfigError> {
    spec.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let parts: Vec<&str> = entry.split(':').map(str::trim).collect();
            match parts.as_slice() {
                [name, kind] if !name.is_empty() && kind.eq_ignore_ascii_case("monotonic") => {
                    Ok(CounterSpec::monotonic(*name))
                }
                [name, kind] if !name.is_empty() && kind.eq_ignore_ascii_case("depleting") => {
                    Ok(CounterSpec::depleting(*name, default_ceiling))
                }
                [name, kind, ceiling] if !name.is_empty() && kind.eq_ignore_ascii_case("depleting") => {
                    match ceiling.parse::<f64>() {
                        Ok(c) if c.is_finite() && c > 0.0 => Ok(CounterSpec::depleting(*name, c)),
                        _ => Err(ConfigError::InvalidCounter(entry.to_string())),
                    }
                }
                _ => Err(ConfigError::InvalidCounter(entry.to_string())),
            }
        })
        .collect()
}
