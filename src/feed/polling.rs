// =============================================================================
// REST polling transport
// =============================================================================
//
// Presents a polled quote endpoint as a tick connection so that polling and
// streaming feeds share the same subscription manager, replay and backoff.
// A failed poll ends the connection; the manager reconnects it. Reconnecting
// re-polls the last known instruments before reporting success, so an
// unreachable source keeps failing connects and the backoff can run out.
// =============================================================================

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::transport::{ControlMessage, SubscriptionAction, TickConnection, TickTransport};
use crate::broker::DataSource;
use crate::error::PipelineError;

/// Polls `DataSource::fetch_ticks` for the subscribed instruments.
#[derive(Clone)]
pub struct PollingTransport {
    source: Arc<dyn DataSource>,
    poll_every: Duration,
    /// Instruments requested on the most recent connection.
    subscribed: Arc<Mutex<BTreeSet<String>>>,
}

impl PollingTransport {
    pub fn new(source: Arc<dyn DataSource>, poll_every: Duration) -> Self {
        Self {
            source,
            poll_every: poll_every.max(Duration::from_millis(1)),
            subscribed: Arc::default(),
        }
    }
}

/// Any fetch failure ends the polling "connection", so it must reach the
/// manager as a connection error.
fn connection_error(e: PipelineError) -> PipelineError {
    if e.is_transient() {
        e
    } else {
        PipelineError::Connection(e.to_string())
    }
}

#[async_trait]
impl TickTransport for PollingTransport {
    async fn connect(&self) -> Result<Box<dyn TickConnection>, PipelineError> {
        let known: Vec<String> = self.subscribed.lock().iter().cloned().collect();
        if !known.is_empty() {
            if let Err(e) = self.source.fetch_ticks(&known).await {
                warn!(error = %e, instruments = known.len(), "quote source unreachable");
                return Err(connection_error(e));
            }
        }

        let mut poll = interval(self.poll_every);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(poll_ms = self.poll_every.as_millis() as u64, "polling tick transport opened");
        Ok(Box::new(PollingConnection {
            source: self.source.clone(),
            subscribed: self.subscribed.clone(),
            poll,
            instruments: BTreeSet::new(),
            last_seen: HashMap::new(),
            pending: VecDeque::new(),
        }))
    }
}

struct PollingConnection {
    source: Arc<dyn DataSource>,
    subscribed: Arc<Mutex<BTreeSet<String>>>,
    poll: Interval,
    instruments: BTreeSet<String>,
    /// Newest timestamp delivered per instrument; repeated quotes are skipped.
    last_seen: HashMap<String, i64>,
    pending: VecDeque<String>,
}

#[async_trait]
impl TickConnection for PollingConnection {
    async fn send(&mut self, message: &ControlMessage) -> Result<(), PipelineError> {
        for key in &message.instruments {
            match message.action {
                SubscriptionAction::Subscribe => {
                    self.instruments.insert(key.clone());
                }
                SubscriptionAction::Unsubscribe => {
                    self.instruments.remove(key);
                    self.last_seen.remove(key);
                }
            }
        }
        *self.subscribed.lock() = self.instruments.clone();
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<String, PipelineError>> {
        loop {
            if let Some(text) = self.pending.pop_front() {
                return Some(Ok(text));
            }

            self.poll.tick().await;
            if self.instruments.is_empty() {
                continue;
            }

            let keys: Vec<String> = self.instruments.iter().cloned().collect();
            let ticks = match self.source.fetch_ticks(&keys).await {
                Ok(ticks) => ticks,
                Err(e) => return Some(Err(connection_error(e))),
            };

            for tick in ticks {
                if !self.instruments.contains(&tick.instrument_key) {
                    continue;
                }
                let newer = self
                    .last_seen
                    .get(&tick.instrument_key)
                    .map_or(true, |seen| tick.timestamp > *seen);
                if !newer {
                    debug!(instrument = %tick.instrument_key, "unchanged quote skipped");
                    continue;
                }
                match serde_json::to_string(&tick) {
                    Ok(text) => {
                        self.last_seen.insert(tick.instrument_key.clone(), tick.timestamp);
                        self.pending.push_back(text);
                    }
                    Err(e) => return Some(Err(PipelineError::malformed(e.to_string()))),
                }
            }
        }
    }
}
