// =============================================================================
// Historical backfill fetcher
// =============================================================================
//
// One-shot history request used to seed a fresh candle series. Failures never
// propagate: the caller gets an empty list and registered sinks get the error.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::cache::TtlCache;
use super::data_source::{DataSource, HistoricalRequest};
use crate::clock::Clock;
use crate::error::PipelineError;
use crate::market_data::normalize_history;
use crate::types::{Candle, CandleInterval};

pub type ErrorSink = Arc<dyn Fn(&PipelineError) + Send + Sync>;

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_cache_ttl_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillConfig {
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Zero disables the history cache.
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            cache_ttl_secs: default_cache_ttl_secs(),
        }
    }
}

pub struct BackfillFetcher {
    source: Arc<dyn DataSource>,
    clock: Arc<dyn Clock>,
    cache: TtlCache<(String, CandleInterval), Vec<Candle>>,
    timeout: Duration,
    error_sinks: Mutex<Vec<ErrorSink>>,
}

impl BackfillFetcher {
    pub fn new(source: Arc<dyn DataSource>, clock: Arc<dyn Clock>, config: BackfillConfig) -> Self {
        // Longer TTLs than chrono can represent saturate to "never expires".
        let ttl = i64::try_from(config.cache_ttl_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::Duration::MAX);
        Self {
            source,
            cache: TtlCache::new(clock.clone(), ttl),
            clock,
            timeout: Duration::from_millis(config.timeout_ms),
            error_sinks: Mutex::new(Vec::new()),
        }
    }

    /// Register a callback for fetch failures.
    pub fn on_error<F>(&self, sink: F)
    where
        F: Fn(&PipelineError) + Send + Sync + 'static,
    {
        self.error_sinks.lock().push(Arc::new(sink));
    }

    /// Window of `interval.backfill_days()` days ending today on the clock.
    pub fn request_for(&self, instrument_key: &str, interval: CandleInterval) -> HistoricalRequest {
        let to_date = self.clock.now().date_naive();
        let from_date = to_date - chrono::Duration::days(interval.backfill_days());
        HistoricalRequest {
            instrument_key: instrument_key.to_string(),
            interval,
            from_date,
            to_date,
        }
    }

    /// Normalized history, or an error. Successful results are cached.
    pub async fn try_fetch(
        &self,
        instrument_key: &str,
        interval: CandleInterval,
    ) -> Result<Vec<Candle>, PipelineError> {
        let key = (instrument_key.to_string(), interval);
        if let Some(cached) = self.cache.get(&key) {
            debug!(instrument = %instrument_key, %interval, count = cached.len(), "backfill served from cache");
            return Ok(cached);
        }

        let request = self.request_for(instrument_key, interval);
        let rows = match tokio::time::timeout(self.timeout, self.source.fetch_historical(&request)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(PipelineError::BackfillTimeout {
                    instrument: instrument_key.to_string(),
                    timeout_ms: self.timeout.as_millis() as u64,
                })
            }
        };

        if rows.is_empty() {
            return Err(PipelineError::backfill(instrument_key, "empty history"));
        }

        let received = rows.len();
        let candles = normalize_history(interval, rows.into_iter().map(Candle::from).collect());
        if candles.is_empty() {
            return Err(PipelineError::backfill(instrument_key, "no valid candles in history"));
        }
        if candles.len() < received {
            debug!(
                instrument = %instrument_key,
                dropped = received - candles.len(),
                "invalid or duplicate history rows dropped"
            );
        }

        info!(instrument = %instrument_key, %interval, count = candles.len(), "backfill fetched");
        let purged = self.cache.purge_expired();
        if purged > 0 {
            debug!(purged, "expired history evicted from cache");
        }
        self.cache.insert(key, candles.clone());
        Ok(candles)
    }

    /// Like `try_fetch`, but failures degrade to an empty list.
    pub async fn fetch(&self, instrument_key: &str, interval: CandleInterval) -> Vec<Candle> {
        match self.try_fetch(instrument_key, interval).await {
            Ok(candles) => candles,
            Err(e) => {
                warn!(instrument = %instrument_key, %interval, error = %e, "backfill failed; continuing without history");
                self.notify(&e);
                Vec::new()
            }
        }
    }

    fn notify(&self, error: &PipelineError) {
        let sinks: Vec<ErrorSink> = self.error_sinks.lock().clone();
        for sink in sinks {
            sink(error);
        }
    }
}
