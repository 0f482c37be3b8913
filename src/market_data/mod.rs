pub mod aggregator;
pub mod patterns;

pub use aggregator::{normalize_history, CandleAggregator, TickOutcome};
pub use patterns::{detect as detect_patterns, PATTERN_WINDOW};
