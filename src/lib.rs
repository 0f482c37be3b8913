// =============================================================================
// Live Candles: real-time OHLCV aggregation and candlestick pattern alerts
// =============================================================================
//
// Ticks flow from a `TickTransport` through the reconnecting
// `SubscriptionManager` into one `CandleAggregator` per (instrument, interval).
// Each series is seeded once from broker history and checked for patterns
// after every change. `CandlePipeline` is the consumer-facing entry point.
// =============================================================================

pub mod auth;
pub mod broker;
pub mod clock;
pub mod error;
pub mod feed;
pub mod market_data;
pub mod pipeline;
pub mod runtime_config;
pub mod types;

pub use error::PipelineError;
pub use pipeline::{CandleHandlers, CandlePipeline, CandleSubscription, CandleUpdate, SeriesKey};
pub use runtime_config::PipelineConfig;
pub use types::{Candle, CandleInterval, PatternEvent, PatternKind, Tick};
