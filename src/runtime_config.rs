// =============================================================================
// Runtime Configuration - feed, sink and backfill settings with atomic save
// =============================================================================
//
// Loaded once at startup from JSON and validated before any pipeline starts.
// Every field carries a serde default so that adding new settings never breaks
// loading an older config file. Persistence uses tmp + rename.
// =============================================================================

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::backfill::BackfillJob;
use crate::error::ConfigError;
use crate::exchanges::{adapter_for, SessionConfig, Subscription};
use crate::pipeline::PipelineSettings;
use crate::sink::transform::{output_columns, ColumnSpec, CANDLE_COLUMNS};
use crate::types::{ExchangeId, MarketType, Timeframe};
use crate::warmup::WarmupFailurePolicy;

pub const CONFIG_PATH_ENV: &str = "STREAMFORGE_CONFIG";
pub const BIND_ADDR_ENV: &str = "STREAMFORGE_BIND_ADDR";
const DEFAULT_CONFIG_PATH: &str = "streamforge.json";

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_subscriptions() -> Vec<Subscription> {
    vec![Subscription {
        exchange: ExchangeId::Binance,
        market_type: MarketType::Spot,
        symbols: vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()],
        base_timeframe: Timeframe::M1,
        aggregate_timeframes: vec![Timeframe::M5, Timeframe::M15],
        warmup: true,
    }]
}

fn default_sinks() -> Vec<SinkConfig> {
    vec![SinkConfig::Log {
        name: "log".to_string(),
        conflict_keys: None,
    }]
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_backoff_initial_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_stale_window_grace_secs() -> u64 {
    10
}

fn default_emit_timeout_ms() -> u64 {
    5_000
}

fn default_close_grace_ms() -> u64 {
    5_000
}

fn default_bind_addr() -> String {
    "127.0.0.1:3000".to_string()
}

fn default_true() -> bool {
    true
}

// =============================================================================
// Sinks
// =============================================================================

/// One configured output. `conflict_keys` overrides the advisory upsert key;
/// `columns` selects and renames the CSV columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SinkConfig {
    Log {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conflict_keys: Option<Vec<String>>,
    },
    Csv {
        name: String,
        path: PathBuf,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conflict_keys: Option<Vec<String>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        columns: Option<Vec<ColumnSpec>>,
    },
}

impl SinkConfig {
    pub fn name(&self) -> &str {
        match self {
            Self::Log { name, .. } | Self::Csv { name, .. } => name,
        }
    }

    pub fn conflict_keys(&self) -> Option<&[String]> {
        match self {
            Self::Log { conflict_keys, .. } | Self::Csv { conflict_keys, .. } => {
                conflict_keys.as_deref()
            }
        }
    }

    /// Conflict keys must name columns the sink actually writes.
    fn validate(&self) -> Result<(), ConfigError> {
        let columns = match self {
            Self::Csv {
                columns: Some(columns),
                ..
            } => output_columns(columns)?,
            _ => CANDLE_COLUMNS.iter().map(|c| c.to_string()).collect(),
        };
        if let Some(keys) = self.conflict_keys() {
            if keys.is_empty() {
                return Err(ConfigError::InvalidSetting {
                    field: "conflict_keys",
                    reason: format!("sink '{}' lists no keys", self.name()),
                });
            }
            if let Some(unknown) = keys.iter().find(|k| !columns.contains(k)) {
                return Err(ConfigError::InvalidSetting {
                    field: "conflict_keys",
                    reason: format!("sink '{}' has no column '{unknown}'", self.name()),
                });
            }
        }
        Ok(())
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Feeds ---------------------------------------------------------------
    #[serde(default = "default_subscriptions")]
    pub subscriptions: Vec<Subscription>,

    /// Capacity of every bounded channel in the pipeline.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// First reconnect delay; doubles per failed attempt.
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    // --- Warmup & aggregation ------------------------------------------------
    #[serde(default)]
    pub warmup_failure_policy: WarmupFailurePolicy,

    #[serde(default)]
    pub emit_warmup: bool,

    #[serde(default)]
    pub emit_in_progress: bool,

    /// Seconds an open window may outlive its end before it is flushed.
    #[serde(default = "default_stale_window_grace_secs")]
    pub stale_window_grace_secs: u64,

    // --- Sinks ---------------------------------------------------------------
    #[serde(default = "default_sinks")]
    pub sinks: Vec<SinkConfig>,

    #[serde(default = "default_emit_timeout_ms")]
    pub emit_timeout_ms: u64,

    #[serde(default = "default_close_grace_ms")]
    pub close_grace_ms: u64,

    // --- Backfill ------------------------------------------------------------
    #[serde(default)]
    pub backfill: Vec<BackfillJob>,

    // --- Status API ----------------------------------------------------------
    #[serde(default = "default_true")]
    pub api_enabled: bool,

    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            subscriptions: default_subscriptions(),
            channel_capacity: default_channel_capacity(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            warmup_failure_policy: WarmupFailurePolicy::default(),
            emit_warmup: false,
            emit_in_progress: false,
            stale_window_grace_secs: default_stale_window_grace_secs(),
            sinks: default_sinks(),
            emit_timeout_ms: default_emit_timeout_ms(),
            close_grace_ms: default_close_grace_ms(),
            backfill: Vec::new(),
            api_enabled: true,
            bind_addr: default_bind_addr(),
        }
    }
}

impl RuntimeConfig {
    /// Path from `STREAMFORGE_CONFIG`, else `streamforge.json`.
    pub fn default_path() -> PathBuf {
        std::env::var(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;
        info!(
            path = %path.display(),
            subscriptions = config.subscriptions.len(),
            sinks = config.sinks.len(),
            backfill_jobs = config.backfill.len(),
            "runtime config loaded"
        );
        Ok(config)
    }

    /// Apply environment overrides.
    pub fn apply_env(&mut self) {
        if let Ok(addr) = std::env::var(BIND_ADDR_ENV) {
            if !addr.trim().is_empty() {
                self.bind_addr = addr.trim().to_string();
            }
        }
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    /// Global setting checks. Subscription problems are reported per entry by
    /// [`validate_subscriptions`](Self::validate_subscriptions).
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channel_capacity == 0 {
            return Err(ConfigError::InvalidSetting {
                field: "channel_capacity",
                reason: "must be at least 1".into(),
            });
        }
        if self.backoff_initial_ms == 0 || self.backoff_initial_ms > self.backoff_max_ms {
            return Err(ConfigError::InvalidSetting {
                field: "backoff_initial_ms",
                reason: format!(
                    "must be positive and not above backoff_max_ms ({})",
                    self.backoff_max_ms
                ),
            });
        }
        if self.emit_timeout_ms == 0 {
            return Err(ConfigError::InvalidSetting {
                field: "emit_timeout_ms",
                reason: "must be positive".into(),
            });
        }
        let mut names = HashSet::new();
        for sink in &self.sinks {
            if !names.insert(sink.name()) {
                return Err(ConfigError::InvalidSetting {
                    field: "sinks",
                    reason: format!("sink name '{}' is used twice", sink.name()),
                });
            }
            sink.validate()?;
        }
        Ok(())
    }

    /// One result per subscription, in configured order.
    pub fn validate_subscriptions(&self) -> Vec<Result<(), ConfigError>> {
        self.subscriptions
            .iter()
            .map(|sub| sub.validate_for(adapter_for(sub.exchange, sub.market_type).as_ref()))
            .collect()
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            channel_capacity: self.channel_capacity,
            backoff_initial: Duration::from_millis(self.backoff_initial_ms),
            backoff_max: Duration::from_millis(self.backoff_max_ms),
            ..SessionConfig::default()
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            emit_in_progress: self.emit_in_progress,
            emit_warmup: self.emit_warmup,
            stale_window_grace: Duration::from_secs(self.stale_window_grace_secs),
            ..PipelineSettings::default()
        }
    }

    pub fn emit_timeout(&self) -> Duration {
        Duration::from_millis(self.emit_timeout_ms)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let cfg = RuntimeConfig::default();
        assert!(cfg.validate().is_ok());
        assert!(cfg.validate_subscriptions().iter().all(Result::is_ok));
        assert_eq!(cfg.session_config().backoff_max, Duration::from_secs(30));
        assert_eq!(cfg.warmup_failure_policy, WarmupFailurePolicy::Abort);
    }

    #[test]
    fn minimal_file_fills_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str(
            r#"{
                "subscriptions": [
                    {"exchange": "okx", "symbols": ["BTC-USDT"], "base_timeframe": "1m"}
                ],
                "sinks": [{"kind": "csv", "name": "file", "path": "out.csv"}]
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.subscriptions[0].market_type, MarketType::Spot);
        assert!(cfg.subscriptions[0].aggregate_timeframes.is_empty());
        assert_eq!(cfg.channel_capacity, 1024);
        assert_eq!(cfg.sinks[0].name(), "file");
        assert!(cfg.api_enabled);
    }

    #[test]
    fn bad_subscription_reported_alone() {
        let mut cfg = RuntimeConfig::default();
        let mut bad = cfg.subscriptions[0].clone();
        bad.aggregate_timeframes = vec![Timeframe::M3];
        bad.base_timeframe = Timeframe::M5;
        cfg.subscriptions.push(bad);

        let results = cfg.validate_subscriptions();
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(ConfigError::InvalidAggregate { .. })));
    }

    #[test]
    fn duplicate_sink_names_rejected() {
        let mut cfg = RuntimeConfig::default();
        cfg.sinks.push(SinkConfig::Log {
            name: "log".into(),
            conflict_keys: None,
        });
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidSetting { field: "sinks", .. })
        ));
    }

    #[test]
    fn sink_columns_and_conflict_keys_load_and_validate() {
        let cfg: RuntimeConfig = serde_json::from_str(
            r#"{
                "sinks": [{
                    "kind": "csv", "name": "db_export", "path": "out.csv",
                    "columns": [
                        {"field": "source", "rename": "exchange"},
                        {"field": "symbol", "rename": "ticker"},
                        {"field": "open_time", "rename": "timestamp"},
                        {"field": "close"}
                    ],
                    "conflict_keys": ["exchange", "ticker", "timestamp"]
                }]
            }"#,
        )
        .unwrap();
        assert!(cfg.validate().is_ok());
        assert_eq!(
            cfg.sinks[0].conflict_keys(),
            Some(&["exchange".to_string(), "ticker".to_string(), "timestamp".to_string()][..])
        );

        let mut bad = cfg.clone();
        if let SinkConfig::Csv { conflict_keys, .. } = &mut bad.sinks[0] {
            *conflict_keys = Some(vec!["symbol".into()]);
        }
        assert!(matches!(
            bad.validate(),
            Err(ConfigError::InvalidSetting { field: "conflict_keys", .. })
        ));

        let mut empty = cfg;
        if let SinkConfig::Csv { columns, .. } = &mut empty.sinks[0] {
            *columns = Some(Vec::new());
        }
        assert!(matches!(
            empty.validate(),
            Err(ConfigError::InvalidSetting { field: "columns", .. })
        ));
    }

    #[test]
    fn save_and_reload_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("streamforge.json");
        let mut cfg = RuntimeConfig::default();
        cfg.emit_in_progress = true;
        cfg.save(&path).unwrap();

        let loaded = RuntimeConfig::load(&path).unwrap();
        assert!(loaded.emit_in_progress);
        assert_eq!(loaded.subscriptions, cfg.subscriptions);
        assert!(!path.with_extension("json.tmp").exists());
    }
}
