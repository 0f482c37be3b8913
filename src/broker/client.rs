// =============================================================================
// Broker REST API Client: historical candles and last-traded-price quotes
// =============================================================================
//
// SECURITY: The access token is never logged or serialized. It is sent only
// as a bearer Authorization header.
// =============================================================================

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::Url;
use tracing::{debug, instrument, warn};

use super::data_source::{DataSource, HistoricalRequest, OhlcvRow};
use crate::error::PipelineError;
use crate::types::Tick;

pub const DEFAULT_BASE_URL: &str = "https://api.upstox.com/v2/";

/// Everything outside RFC 3986 unreserved characters is escaped, so `|`
/// in instrument keys travels as `%7C`.
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_').remove(b'.').remove(b'~');

/// Broker REST client authenticated with a bearer access token.
#[derive(Clone)]
pub struct BrokerRestClient {
    base_url: Url,
    client: reqwest::Client,
}

impl BrokerRestClient {
    /// Create a new `BrokerRestClient`.
    ///
    /// # Arguments
    /// * `access_token`: bearer token, sent as a header only.
    /// * `base_url`    : API root; a trailing `/` is added when missing.
    pub fn new(access_token: &str, base_url: &str) -> Result<Self> {
        let mut base = base_url.to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base).with_context(|| format!("invalid broker base url '{base_url}'"))?;

        let mut default_headers = HeaderMap::new();
        default_headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        if !access_token.is_empty() {
            let mut bearer = HeaderValue::from_str(&format!("Bearer {access_token}"))
                .context("access token contains invalid header characters")?;
            bearer.set_sensitive(true);
            default_headers.insert(AUTHORIZATION, bearer);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("failed to build reqwest client")?;

        debug!(base_url = %base_url, "BrokerRestClient initialised");

        Ok(Self { base_url, client })
    }

    pub fn base_url(&self) -> &str {
        self.base_url.as_str()
    }

    // -------------------------------------------------------------------------
    // URL builders
    // -------------------------------------------------------------------------

    /// `historical-candle/{instrument}/{interval}/{to}/{from}`, each segment
    /// percent-encoded.
    pub fn historical_url(&self, request: &HistoricalRequest) -> Result<Url> {
        if self.base_url.cannot_be_a_base() {
            anyhow::bail!("broker base url cannot hold a path");
        }
        let segment = |s: &str| utf8_percent_encode(s, PATH_SEGMENT).to_string();
        let path = format!(
            "{}historical-candle/{}/{}/{}/{}",
            self.base_url.path(),
            segment(&request.instrument_key),
            segment(request.interval.code()),
            segment(&request.to_date.to_string()),
            segment(&request.from_date.to_string()),
        );
        let mut url = self.base_url.clone();
        url.set_path(&path);
        Ok(url)
    }

    pub fn quotes_url(&self, instruments: &[String]) -> Result<Url> {
        let mut url = self
            .base_url
            .join("market-quote/ltp")
            .context("failed to build quotes url")?;
        url.query_pairs_mut()
            .append_pair("instrument_key", &instruments.join(","));
        Ok(url)
    }

    // -------------------------------------------------------------------------
    // Endpoints
    // -------------------------------------------------------------------------

    /// GET historical-candle. Rows come back newest first from the broker;
    /// callers normalize ordering.
    #[instrument(skip(self), name = "broker::get_historical", fields(instrument = %request.instrument_key))]
    pub async fn get_historical(&self, request: &HistoricalRequest) -> Result<Vec<OhlcvRow>> {
        let url = self.historical_url(request)?;
        let body = self.get_json(url, "historical-candle").await?;
        let rows = parse_candle_rows(&body)?;
        debug!(count = rows.len(), "historical candles fetched");
        Ok(rows)
    }

    /// GET market-quote/ltp for a batch of instruments.
    #[instrument(skip(self), name = "broker::get_quotes")]
    pub async fn get_quotes(&self, instruments: &[String]) -> Result<Vec<Tick>> {
        if instruments.is_empty() {
            return Ok(Vec::new());
        }
        let url = self.quotes_url(instruments)?;
        let body = self.get_json(url, "market-quote/ltp").await?;
        let ticks = parse_quotes(&body, Utc::now().timestamp_millis())?;
        debug!(count = ticks.len(), "quotes fetched");
        Ok(ticks)
    }

    async fn get_json(&self, url: Url, endpoint: &str) -> Result<serde_json::Value> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("GET {endpoint} request failed"))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse {endpoint} response"))?;

        if !status.is_success() {
            anyhow::bail!("Broker GET {} returned {}: {}", endpoint, status, body);
        }
        Ok(body)
    }
}

#[async_trait]
impl DataSource for BrokerRestClient {
    async fn fetch_historical(&self, request: &HistoricalRequest) -> Result<Vec<OhlcvRow>, PipelineError> {
        self.get_historical(request)
            .await
            .map_err(|e| PipelineError::backfill(&request.instrument_key, format!("{e:#}")))
    }

    async fn fetch_ticks(&self, instruments: &[String]) -> Result<Vec<Tick>, PipelineError> {
        self.get_quotes(instruments)
            .await
            .map_err(|e| PipelineError::Connection(format!("{e:#}")))
    }
}

impl std::fmt::Debug for BrokerRestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerRestClient")
            .field("access_token", &"<redacted>")
            .field("base_url", &self.base_url.as_str())
            .finish()
    }
}

// -----------------------------------------------------------------------------
// Response parsing
// -----------------------------------------------------------------------------

/// `data.candles` is an array of `[timestamp, open, high, low, close, volume, ...]`
/// where the timestamp is RFC 3339 text or epoch milliseconds.
fn parse_candle_rows(body: &serde_json::Value) -> Result<Vec<OhlcvRow>> {
    let raw = body["data"]["candles"]
        .as_array()
        .context("historical response missing 'data.candles' array")?;

    let mut rows = Vec::with_capacity(raw.len());
    for entry in raw {
        let arr = entry.as_array().context("candle entry is not an array")?;
        if arr.len() < 5 {
            warn!("skipping malformed candle entry with {} elements", arr.len());
            continue;
        }
        rows.push(OhlcvRow {
            timestamp: parse_timestamp(&arr[0])?,
            open: parse_f64(&arr[1])?,
            high: parse_f64(&arr[2])?,
            low: parse_f64(&arr[3])?,
            close: parse_f64(&arr[4])?,
            volume: arr.get(5).map(parse_f64).transpose()?.unwrap_or(0.0),
        });
    }
    Ok(rows)
}

/// `data` maps a response key to `{instrument_token, last_price, timestamp?}`.
/// Quotes without a timestamp are stamped with `received_at`.
fn parse_quotes(body: &serde_json::Value, received_at: i64) -> Result<Vec<Tick>> {
    let data = body["data"]
        .as_object()
        .context("quote response missing 'data' object")?;

    let mut ticks = Vec::with_capacity(data.len());
    for (key, quote) in data {
        let instrument = quote["instrument_token"].as_str().unwrap_or(key.as_str());
        let price = match quote.get("last_price").map(parse_f64).transpose()? {
            Some(p) => p,
            None => {
                warn!(instrument, "quote without last_price skipped");
                continue;
            }
        };
        let timestamp = match quote.get("timestamp") {
            Some(ts) if !ts.is_null() => parse_timestamp(ts)?,
            _ => received_at,
        };
        let volume = quote.get("volume").and_then(|v| v.as_f64());
        ticks.push(Tick::new(instrument, price, volume, timestamp));
    }
    Ok(ticks)
}

fn parse_timestamp(val: &serde_json::Value) -> Result<i64> {
    if let Some(ms) = val.as_i64() {
        Ok(ms)
    } else if let Some(s) = val.as_str() {
        DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.timestamp_millis())
            .with_context(|| format!("failed to parse '{s}' as timestamp"))
    } else {
        anyhow::bail!("expected timestamp string or number, got: {val}")
    }
}

/// Parse a JSON value that may be either a string or a number into `f64`.
fn parse_f64(val: &serde_json::Value) -> Result<f64> {
    if let Some(s) = val.as_str() {
        s.parse::<f64>()
            .with_context(|| format!("failed to parse '{s}' as f64"))
    } else if let Some(n) = val.as_f64() {
        Ok(n)
    } else {
        anyhow::bail!("expected string or number, got: {val}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CandleInterval;
    use chrono::NaiveDate;
    use serde_json::json;

    fn client() -> BrokerRestClient {
        BrokerRestClient::new("secret-token", "https://broker.test/v2").unwrap()
    }

    #[test]
    fn historical_url_encodes_instrument_key() {
        let req = HistoricalRequest {
            instrument_key: "NSE_EQ|INE002A01018".into(),
            interval: CandleInterval::OneMinute,
            from_date: NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
            to_date: NaiveDate::from_ymd_opt(2024, 5, 6).unwrap(),
        };
        let url = client().historical_url(&req).unwrap();
        assert_eq!(
            url.as_str(),
            "https://broker.test/v2/historical-candle/NSE_EQ%7CINE002A01018/1minute/2024-05-06/2024-05-01"
        );
    }

    #[test]
    fn historical_url_escapes_spaces_and_keeps_unreserved() {
        let req = HistoricalRequest {
            instrument_key: "NSE_INDEX|Nifty 50".into(),
            interval: CandleInterval::ThirtyMinutes,
            from_date: NaiveDate::from_ymd_opt(2024, 4, 6).unwrap(),
            to_date: NaiveDate::from_ymd_opt(2024, 5, 6).unwrap(),
        };
        let url = client().historical_url(&req).unwrap();
        assert_eq!(
            url.path(),
            "/v2/historical-candle/NSE_INDEX%7CNifty%2050/30minute/2024-05-06/2024-04-06"
        );
        let decoded: Vec<String> = url
            .path_segments()
            .unwrap()
            .map(|s| percent_encoding::percent_decode_str(s).decode_utf8_lossy().into_owned())
            .collect();
        assert_eq!(decoded[2], "NSE_INDEX|Nifty 50");
    }

    #[test]
    fn quotes_url_joins_keys() {
        let url = client()
            .quotes_url(&["NSE_EQ|A".to_string(), "NSE_EQ|B".to_string()])
            .unwrap();
        assert_eq!(url.path(), "/v2/market-quote/ltp");
        let (k, v) = url.query_pairs().next().unwrap();
        assert_eq!(k, "instrument_key");
        assert_eq!(v, "NSE_EQ|A,NSE_EQ|B");
    }

    #[test]
    fn debug_redacts_token() {
        let printed = format!("{:?}", client());
        assert!(!printed.contains("secret-token"));
        assert!(printed.contains("<redacted>"));
    }

    #[test]
    fn parses_candle_rows_with_mixed_timestamps() {
        let body = json!({
            "status": "success",
            "data": { "candles": [
                ["2024-05-06T09:16:00+05:30", 101.0, 102.5, 100.5, 102.0, 1200, 0],
                [1714966500000i64, "100", "101.5", "99.5", "101", "900"],
                [1]
            ]}
        });
        let rows = parse_candle_rows(&body).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].timestamp, 1_714_967_160_000);
        assert_eq!(rows[0].volume, 1200.0);
        assert_eq!(rows[1].open, 100.0);
        assert_eq!(rows[1].timestamp, 1_714_966_500_000);
    }

    #[test]
    fn missing_candles_array_is_an_error() {
        assert!(parse_candle_rows(&json!({"data": {}})).is_err());
    }

    #[test]
    fn parses_quotes_and_stamps_missing_timestamps() {
        let body = json!({
            "data": {
                "NSE_EQ:RELIANCE": { "instrument_token": "NSE_EQ|INE002A01018", "last_price": 2901.5 },
                "NSE_EQ:TCS": { "instrument_token": "NSE_EQ|INE467B01029", "last_price": "3810.0", "timestamp": 5000 },
                "NSE_EQ:BAD": { "instrument_token": "NSE_EQ|X" }
            }
        });
        let mut ticks = parse_quotes(&body, 42).unwrap();
        ticks.sort_by(|a, b| a.instrument_key.cmp(&b.instrument_key));
        assert_eq!(ticks.len(), 2);
        assert_eq!(ticks[0].instrument_key, "NSE_EQ|INE002A01018");
        assert_eq!(ticks[0].timestamp, 42);
        assert_eq!(ticks[1].last_traded_price, 3810.0);
        assert_eq!(ticks[1].timestamp, 5000);
    }
}
