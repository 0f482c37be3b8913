use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::types::{Candle, CandleInterval, Tick};

/// Historical-data request sent to the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoricalRequest {
    pub instrument_key: String,
    #[serde(rename = "intervalCode")]
    pub interval: CandleInterval,
    pub from_date: NaiveDate,
    pub to_date: NaiveDate,
}

/// One row of the historical-data response.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OhlcvRow {
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(default)]
    pub volume: f64,
}

impl From<OhlcvRow> for Candle {
    fn from(row: OhlcvRow) -> Self {
        Candle::new(row.timestamp, row.open, row.high, row.low, row.close, row.volume)
    }
}

/// Market data collaborator: historical candles and polled quotes.
#[async_trait]
pub trait DataSource: Send + Sync {
    async fn fetch_historical(&self, request: &HistoricalRequest) -> Result<Vec<OhlcvRow>, PipelineError>;

    /// Latest quote for each instrument, as ticks.
    async fn fetch_ticks(&self, instruments: &[String]) -> Result<Vec<Tick>, PipelineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_wire_shape() {
        let req = HistoricalRequest {
            instrument_key: "NSE_EQ|INE002A01018".into(),
            interval: CandleInterval::ThirtyMinutes,
            from_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            to_date: NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["instrumentKey"], "NSE_EQ|INE002A01018");
        assert_eq!(json["intervalCode"], "30minute");
        assert_eq!(json["fromDate"], "2024-01-01");
        assert_eq!(json["toDate"], "2024-01-31");
    }

    #[test]
    fn row_without_volume_defaults_to_zero() {
        let row: OhlcvRow =
            serde_json::from_str(r#"{"timestamp":0,"open":1,"high":2,"low":0.5,"close":1.5}"#).unwrap();
        assert_eq!(Candle::from(row).volume, 0.0);
    }
}
