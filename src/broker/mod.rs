pub mod backfill;
pub mod cache;
pub mod client;
pub mod data_source;
pub mod fake;

pub use backfill::{BackfillConfig, BackfillFetcher, ErrorSink};
pub use cache::TtlCache;
pub use client::BrokerRestClient;
pub use data_source::{DataSource, HistoricalRequest, OhlcvRow};
pub use fake::ScriptedDataSource;
