// =============================================================================
// Shared types used across the live candle pipeline
// =============================================================================

use serde::{Deserialize, Serialize};

/// Milliseconds in one minute.
const MINUTE_MS: i64 = 60_000;
const DAY_MS: i64 = 24 * 60 * MINUTE_MS;

/// Earliest tick timestamp accepted. Every interval's bucket start for it
/// stays inside `i64`.
pub const MIN_TICK_TIMESTAMP_MS: i64 = i64::MIN + DAY_MS;

// =============================================================================
// Tick
// =============================================================================

/// A single real-time price update for an instrument.
///
/// Wire shape: `{"instrumentKey", "lastTradedPrice", "volume"?, "timestamp"}`
/// with `timestamp` in milliseconds since the UNIX epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tick {
    pub instrument_key: String,
    pub last_traded_price: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<f64>,
    pub timestamp: i64,
}

impl Tick {
    pub fn new(instrument_key: impl Into<String>, price: f64, volume: Option<f64>, timestamp: i64) -> Self {
        Self {
            instrument_key: instrument_key.into(),
            last_traded_price: price,
            volume,
            timestamp,
        }
    }

    /// Volume carried by this tick, `0.0` when absent.
    pub fn volume_or_zero(&self) -> f64 {
        self.volume.unwrap_or(0.0)
    }

    /// Returns the reason this tick cannot be aggregated, if any.
    pub fn validate(&self) -> Result<(), String> {
        if self.instrument_key.is_empty() {
            return Err("empty instrumentKey".into());
        }
        if !self.last_traded_price.is_finite() || self.last_traded_price <= 0.0 {
            return Err(format!("invalid lastTradedPrice {}", self.last_traded_price));
        }
        if let Some(v) = self.volume {
            if !v.is_finite() || v < 0.0 {
                return Err(format!("invalid volume {v}"));
            }
        }
        if self.timestamp < MIN_TICK_TIMESTAMP_MS {
            return Err(format!("timestamp {} out of range", self.timestamp));
        }
        Ok(())
    }
}

// =============================================================================
// Candle
// =============================================================================

/// One OHLCV candle. `timestamp` is the bucket open time in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn new(timestamp: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// Open a fresh candle from the first tick of a bucket.
    pub fn opened_at(bucket_start: i64, price: f64, volume: f64) -> Self {
        Self::new(bucket_start, price, price, price, price, volume.max(0.0))
    }

    /// Fold a later tick of the same bucket into this candle.
    pub fn apply(&mut self, price: f64, volume: f64) {
        self.close = price;
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.volume += volume.max(0.0);
    }

    /// `true` when `low <= open, close <= high` and volume is non-negative.
    pub fn is_valid(&self) -> bool {
        let finite = [self.open, self.high, self.low, self.close, self.volume]
            .iter()
            .all(|v| v.is_finite());
        finite
            && self.low <= self.open.min(self.close)
            && self.high >= self.open.max(self.close)
            && self.volume >= 0.0
    }

    pub fn body(&self) -> f64 {
        (self.close - self.open).abs()
    }

    pub fn range(&self) -> f64 {
        self.high - self.low
    }

    pub fn upper_shadow(&self) -> f64 {
        self.high - self.open.max(self.close)
    }

    pub fn lower_shadow(&self) -> f64 {
        self.open.min(self.close) - self.low
    }

    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }

    pub fn is_bearish(&self) -> bool {
        self.close < self.open
    }
}

// =============================================================================
// CandleInterval
// =============================================================================

/// Candle width. Every interval has a fixed bucket width so that bucketing is
/// a pure floor division.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CandleInterval {
    #[serde(rename = "1minute")]
    OneMinute,
    #[serde(rename = "5minute")]
    FiveMinutes,
    #[serde(rename = "15minute")]
    FifteenMinutes,
    #[serde(rename = "30minute")]
    ThirtyMinutes,
    #[serde(rename = "60minute")]
    OneHour,
    #[serde(rename = "day")]
    Day,
}

impl CandleInterval {
    /// Interval code used on the historical-data boundary.
    pub fn code(self) -> &'static str {
        match self {
            Self::OneMinute => "1minute",
            Self::FiveMinutes => "5minute",
            Self::FifteenMinutes => "15minute",
            Self::ThirtyMinutes => "30minute",
            Self::OneHour => "60minute",
            Self::Day => "day",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "1minute" => Some(Self::OneMinute),
            "5minute" => Some(Self::FiveMinutes),
            "15minute" => Some(Self::FifteenMinutes),
            "30minute" => Some(Self::ThirtyMinutes),
            "60minute" => Some(Self::OneHour),
            "day" => Some(Self::Day),
            _ => None,
        }
    }

    /// Bucket width in milliseconds.
    pub fn duration_ms(self) -> i64 {
        match self {
            Self::OneMinute => MINUTE_MS,
            Self::FiveMinutes => 5 * MINUTE_MS,
            Self::FifteenMinutes => 15 * MINUTE_MS,
            Self::ThirtyMinutes => 30 * MINUTE_MS,
            Self::OneHour => 60 * MINUTE_MS,
            Self::Day => DAY_MS,
        }
    }

    /// Start of the bucket containing `timestamp_ms`.
    ///
    /// Uses floor division so timestamps before the epoch still land in the
    /// bucket that contains them. `None` when that bucket starts before
    /// `i64::MIN`.
    pub fn bucket_start(self, timestamp_ms: i64) -> Option<i64> {
        let width = self.duration_ms();
        timestamp_ms.div_euclid(width).checked_mul(width)
    }

    /// How many days of history the backfill requests for this interval.
    pub fn backfill_days(self) -> i64 {
        match self {
            Self::OneMinute => 5,
            Self::FiveMinutes | Self::FifteenMinutes | Self::ThirtyMinutes => 30,
            Self::OneHour => 90,
            Self::Day => 365,
        }
    }
}

impl Default for CandleInterval {
    fn default() -> Self {
        Self::OneMinute
    }
}

impl std::fmt::Display for CandleInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

// =============================================================================
// Patterns
// =============================================================================

/// Candlestick shapes the detector recognises. Declaration order is the
/// evaluation and emission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PatternKind {
    Doji,
    Hammer,
    BullishEngulfing,
    BearishEngulfing,
}

impl std::fmt::Display for PatternKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Doji => write!(f, "Doji"),
            Self::Hammer => write!(f, "Hammer"),
            Self::BullishEngulfing => write!(f, "BullishEngulfing"),
            Self::BearishEngulfing => write!(f, "BearishEngulfing"),
        }
    }
}

/// A detected pattern on a specific candle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternEvent {
    pub name: PatternKind,
    pub instrument_key: String,
    pub at_candle_timestamp: i64,
}
