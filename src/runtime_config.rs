// =============================================================================
// Pipeline Configuration: JSON settings with atomic save
// =============================================================================
//
// The library never reads files or the environment itself; the binary loads
// a `PipelineConfig` and passes the pieces to each component.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.  All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::broker::BackfillConfig;
use crate::feed::ReconnectConfig;
use crate::types::CandleInterval;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_max_history_length() -> usize {
    500
}

fn default_feed_url() -> String {
    "wss://feed.example.com/market-data".to_string()
}

fn default_broker_base_url() -> String {
    crate::broker::client::DEFAULT_BASE_URL.to_string()
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_instruments() -> Vec<String> {
    vec![
        "NSE_EQ|INE002A01018".to_string(),
        "NSE_EQ|INE467B01029".to_string(),
        "NSE_INDEX|Nifty 50".to_string(),
    ]
}

// =============================================================================
// PipelineConfig
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Candles retained per series, forming candle included.
    #[serde(default = "default_max_history_length")]
    pub max_history_length: usize,

    #[serde(default)]
    pub reconnect: ReconnectConfig,

    #[serde(default)]
    pub backfill: BackfillConfig,

    /// Streaming endpoint. Empty selects REST polling instead.
    #[serde(default = "default_feed_url")]
    pub feed_url: String,

    #[serde(default = "default_broker_base_url")]
    pub broker_base_url: String,

    /// Quote polling period when `feed_url` is empty.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_instruments")]
    pub instruments: Vec<String>,

    #[serde(default)]
    pub interval: CandleInterval,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_history_length: default_max_history_length(),
            reconnect: ReconnectConfig::default(),
            backfill: BackfillConfig::default(),
            feed_url: default_feed_url(),
            broker_base_url: default_broker_base_url(),
            poll_interval_ms: default_poll_interval_ms(),
            instruments: default_instruments(),
            interval: CandleInterval::default(),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read pipeline config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse pipeline config from {}", path.display()))?;

        info!(
            path = %path.display(),
            instruments = ?config.instruments,
            interval = %config.interval,
            "pipeline config loaded"
        );

        Ok(config)
    }

    /// Persist to `path` using an atomic write (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise pipeline config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "pipeline config saved (atomic)");
        Ok(())
    }

    /// Whether ticks come from REST polling rather than a stream.
    pub fn uses_polling(&self) -> bool {
        self.feed_url.trim().is_empty()
    }

    /// Replace the instrument list from a comma-separated value. Blank
    /// entries are ignored; an all-blank value leaves the list unchanged.
    pub fn override_instruments(&mut self, raw: &str) {
        let parsed: Vec<String> = raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if !parsed.is_empty() {
            self.instruments = parsed;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.max_history_length, 500);
        assert_eq!(cfg.reconnect.base_delay_ms, 1_000);
        assert_eq!(cfg.reconnect.cap_delay_ms, 30_000);
        assert_eq!(cfg.reconnect.max_attempts, 10);
        assert_eq!(cfg.backfill.timeout_ms, 10_000);
        assert_eq!(cfg.interval, CandleInterval::OneMinute);
        assert_eq!(cfg.instruments.len(), 3);
        assert!(!cfg.uses_polling());
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{
            "interval": "15minute",
            "feed_url": "",
            "reconnect": { "cap_delay_ms": 8000 },
            "instruments": ["NSE_EQ|INE009A01021"]
        }"#;
        let cfg: PipelineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.interval, CandleInterval::FifteenMinutes);
        assert!(cfg.uses_polling());
        assert_eq!(cfg.reconnect.cap_delay_ms, 8_000);
        assert_eq!(cfg.reconnect.base_delay_ms, 1_000);
        assert_eq!(cfg.instruments, vec!["NSE_EQ|INE009A01021"]);
        assert_eq!(cfg.backfill, BackfillConfig::default());
    }

    #[test]
    fn unknown_interval_is_rejected() {
        assert!(serde_json::from_str::<PipelineConfig>(r#"{"interval":"7minute"}"#).is_err());
    }

    #[test]
    fn instrument_override_parses_list() {
        let mut cfg = PipelineConfig::default();
        cfg.override_instruments(" NSE_EQ|A , ,NSE_EQ|B ");
        assert_eq!(cfg.instruments, vec!["NSE_EQ|A", "NSE_EQ|B"]);

        cfg.override_instruments(" , ");
        assert_eq!(cfg.instruments, vec!["NSE_EQ|A", "NSE_EQ|B"]);
    }

    #[test]
    fn save_then_load_roundtrips_atomically() {
        let dir = std::env::temp_dir().join(format!("live-candles-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("pipeline.json");

        let mut cfg = PipelineConfig::default();
        cfg.max_history_length = 42;
        cfg.interval = CandleInterval::Day;
        cfg.save(&path).unwrap();

        assert!(!path.with_extension("json.tmp").exists());
        assert_eq!(PipelineConfig::load(&path).unwrap(), cfg);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(PipelineConfig::load("/nonexistent/live-candles.json").is_err());
    }
}
