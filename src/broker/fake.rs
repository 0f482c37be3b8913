//! Deterministic in-memory [`DataSource`] for tests and offline runs.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::data_source::{DataSource, HistoricalRequest, OhlcvRow};
use crate::error::PipelineError;
use crate::types::Tick;

/// Replays queued responses in order. An exhausted queue answers with an
/// empty list. `latency` delays every historical response.
#[derive(Default)]
pub struct ScriptedDataSource {
    historical: Mutex<VecDeque<Result<Vec<OhlcvRow>, PipelineError>>>,
    ticks: Mutex<VecDeque<Result<Vec<Tick>, PipelineError>>>,
    historical_requests: Mutex<Vec<HistoricalRequest>>,
    tick_requests: Mutex<Vec<Vec<String>>>,
    latency: Duration,
}

impl ScriptedDataSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    pub fn push_historical(&self, response: Result<Vec<OhlcvRow>, PipelineError>) {
        self.historical.lock().push_back(response);
    }

    pub fn push_ticks(&self, response: Result<Vec<Tick>, PipelineError>) {
        self.ticks.lock().push_back(response);
    }

    pub fn historical_requests(&self) -> Vec<HistoricalRequest> {
        self.historical_requests.lock().clone()
    }

    pub fn tick_requests(&self) -> Vec<Vec<String>> {
        self.tick_requests.lock().clone()
    }
}

#[async_trait]
impl DataSource for ScriptedDataSource {
    async fn fetch_historical(&self, request: &HistoricalRequest) -> Result<Vec<OhlcvRow>, PipelineError> {
        self.historical_requests.lock().push(request.clone());
        let response = self.historical.lock().pop_front();
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        response.unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn fetch_ticks(&self, instruments: &[String]) -> Result<Vec<Tick>, PipelineError> {
        self.tick_requests.lock().push(instruments.to_vec());
        self.ticks.lock().pop_front().unwrap_or_else(|| Ok(Vec::new()))
    }
}
