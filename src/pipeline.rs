// =============================================================================
// Candle pipeline: consumer-facing facade
// =============================================================================
//
// One series per (instrument, interval). The first consumer of a series:
//
//   1. registers a tick callback with the subscription manager,
//   2. spawns a one-shot backfill, buffering live ticks until it lands,
//   3. seeds the aggregator and replays the buffered ticks in order.
//
// Every series carries a generation number. A backfill that completes after
// its series was torn down (or rebuilt) finds a different generation and is
// dropped. The state lock is released before any consumer handler runs.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::broker::BackfillFetcher;
use crate::error::PipelineError;
use crate::feed::{SubscriptionId, SubscriptionManager};
use crate::market_data::{detect_patterns, CandleAggregator, TickOutcome, PATTERN_WINDOW};
use crate::types::{Candle, CandleInterval, PatternEvent, PatternKind, Tick};

/// Live ticks held per series while its backfill is in flight. The oldest
/// tick is dropped beyond this.
pub const MAX_PENDING_TICKS: usize = 10_000;

pub type UpdateHandler = Arc<dyn Fn(&CandleUpdate) + Send + Sync>;
pub type PatternHandler = Arc<dyn Fn(&PatternEvent) + Send + Sync>;

/// Identifies one candle series.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeriesKey {
    pub instrument_key: String,
    pub interval: CandleInterval,
}

impl SeriesKey {
    pub fn new(instrument_key: impl Into<String>, interval: CandleInterval) -> Self {
        Self {
            instrument_key: instrument_key.into(),
            interval,
        }
    }
}

impl std::fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.instrument_key, self.interval)
    }
}

/// The forming candle after a change, plus the candle it closed, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct CandleUpdate {
    pub instrument_key: String,
    pub interval: CandleInterval,
    pub candle: Candle,
    pub closed: Option<Candle>,
}

/// Consumer callbacks. Either may be left unset.
#[derive(Clone, Default)]
pub struct CandleHandlers {
    update: Option<UpdateHandler>,
    pattern: Option<PatternHandler>,
}

impl CandleHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_update<F>(mut self, handler: F) -> Self
    where
        F: Fn(&CandleUpdate) + Send + Sync + 'static,
    {
        self.update = Some(Arc::new(handler));
        self
    }

    pub fn on_pattern<F>(mut self, handler: F) -> Self
    where
        F: Fn(&PatternEvent) + Send + Sync + 'static,
    {
        self.pattern = Some(Arc::new(handler));
        self
    }
}

// =============================================================================
// Series state
// =============================================================================

enum BackfillState {
    Pending(VecDeque<Tick>),
    Done,
}

enum Delivery {
    Update(CandleUpdate),
    Pattern(PatternEvent),
}

struct Consumer {
    id: u64,
    handlers: CandleHandlers,
}

struct Series {
    generation: u64,
    aggregator: CandleAggregator,
    consumers: Vec<Consumer>,
    feed_id: SubscriptionId,
    backfill: BackfillState,
    /// Patterns already emitted for the candle opened at `announced_at`.
    announced_at: Option<i64>,
    announced: Vec<PatternKind>,
}

impl Series {
    fn handlers(&self) -> Vec<CandleHandlers> {
        self.consumers.iter().map(|c| c.handlers.clone()).collect()
    }

    fn apply(&mut self, key: &SeriesKey, tick: &Tick, out: &mut Vec<Delivery>) {
        let outcome = self.aggregator.on_tick(tick);
        let closed = match &outcome {
            TickOutcome::Opened { closed } => *closed,
            TickOutcome::Updated => None,
            TickOutcome::Late => {
                debug!(series = %key, timestamp = tick.timestamp, "late tick ignored");
                return;
            }
            TickOutcome::Rejected => {
                debug!(series = %key, price = tick.last_traded_price, "invalid tick ignored");
                return;
            }
        };
        let Some(candle) = self.aggregator.current() else {
            return;
        };

        if let Some(done) = closed {
            debug!(series = %key, timestamp = done.timestamp, close = done.close, "candle closed");
        }
        out.push(Delivery::Update(CandleUpdate {
            instrument_key: key.instrument_key.clone(),
            interval: key.interval,
            candle,
            closed,
        }));

        self.reset_announced(candle.timestamp);
        for kind in detect_patterns(&self.aggregator.history(PATTERN_WINDOW)) {
            if self.announced.contains(&kind) {
                continue;
            }
            self.announced.push(kind);
            info!(series = %key, pattern = %kind, candle = candle.timestamp, "pattern detected");
            out.push(Delivery::Pattern(PatternEvent {
                name: kind,
                instrument_key: key.instrument_key.clone(),
                at_candle_timestamp: candle.timestamp,
            }));
        }
    }

    fn reset_announced(&mut self, candle_timestamp: i64) {
        if self.announced_at != Some(candle_timestamp) {
            self.announced_at = Some(candle_timestamp);
            self.announced.clear();
        }
    }

    /// Patterns already present in seeded history are not announced as live.
    fn suppress_seeded_patterns(&mut self) {
        if let Some(candle) = self.aggregator.current() {
            self.reset_announced(candle.timestamp);
            self.announced = detect_patterns(&self.aggregator.history(PATTERN_WINDOW));
        }
    }
}

/// Append `tick`, dropping the oldest when full. Returns `true` if one was
/// dropped.
fn buffer_tick(pending: &mut VecDeque<Tick>, tick: Tick) -> bool {
    let dropped = if pending.len() >= MAX_PENDING_TICKS {
        pending.pop_front();
        true
    } else {
        false
    };
    pending.push_back(tick);
    dropped
}

fn deliver(handlers: &[CandleHandlers], deliveries: &[Delivery]) {
    for delivery in deliveries {
        for h in handlers {
            match delivery {
                Delivery::Update(update) => {
                    if let Some(f) = &h.update {
                        f(update);
                    }
                }
                Delivery::Pattern(event) => {
                    if let Some(f) = &h.pattern {
                        f(event);
                    }
                }
            }
        }
    }
}

// =============================================================================
// CandlePipeline
// =============================================================================

struct State {
    next_generation: u64,
    next_consumer: u64,
    series: HashMap<SeriesKey, Series>,
}

struct Inner {
    feed: SubscriptionManager,
    backfill: Arc<BackfillFetcher>,
    max_history: usize,
    state: Mutex<State>,
}

/// Cloneable handle over all candle series fed by one subscription manager.
#[derive(Clone)]
pub struct CandlePipeline {
    inner: Arc<Inner>,
}

impl CandlePipeline {
    /// `max_history` bounds every series, forming candle included.
    pub fn new(feed: SubscriptionManager, backfill: Arc<BackfillFetcher>, max_history: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                feed,
                backfill,
                max_history,
                state: Mutex::new(State {
                    next_generation: 0,
                    next_consumer: 0,
                    series: HashMap::new(),
                }),
            }),
        }
    }

    pub fn feed(&self) -> &SubscriptionManager {
        &self.inner.feed
    }

    /// Register a callback for backfill failures.
    pub fn on_backfill_error<F>(&self, sink: F)
    where
        F: Fn(&PipelineError) + Send + Sync + 'static,
    {
        self.inner.backfill.on_error(sink);
    }

    /// Start receiving candle updates and patterns for one series. The series
    /// is created (and backfilled) on first use. Backfill needs a Tokio
    /// runtime; without one the series starts empty.
    pub fn subscribe_candles(
        &self,
        instrument_key: &str,
        interval: CandleInterval,
        handlers: CandleHandlers,
    ) -> CandleSubscription {
        let key = SeriesKey::new(instrument_key, interval);
        let runtime = tokio::runtime::Handle::try_current().ok();
        let mut spawn_generation = None;

        let consumer_id = {
            let mut state = self.inner.state.lock();
            let consumer_id = state.next_consumer;
            state.next_consumer += 1;

            if !state.series.contains_key(&key) {
                let generation = state.next_generation;
                state.next_generation += 1;

                let weak = Arc::downgrade(&self.inner);
                let tick_key = key.clone();
                let feed_id = self.inner.feed.subscribe(instrument_key, move |tick| {
                    if let Some(inner) = weak.upgrade() {
                        inner.on_tick(&tick_key, generation, tick);
                    }
                });

                let backfill = if runtime.is_some() {
                    spawn_generation = Some(generation);
                    BackfillState::Pending(VecDeque::new())
                } else {
                    warn!(series = %key, "no async runtime; series starts without history");
                    BackfillState::Done
                };

                info!(series = %key, generation, "candle series created");
                state.series.insert(
                    key.clone(),
                    Series {
                        generation,
                        aggregator: CandleAggregator::new(instrument_key, interval, self.inner.max_history),
                        consumers: Vec::new(),
                        feed_id,
                        backfill,
                        announced_at: None,
                        announced: Vec::new(),
                    },
                );
            }

            if let Some(series) = state.series.get_mut(&key) {
                series.consumers.push(Consumer {
                    id: consumer_id,
                    handlers,
                });
            }
            consumer_id
        };

        if let (Some(runtime), Some(generation)) = (runtime, spawn_generation) {
            let weak = Arc::downgrade(&self.inner);
            let fetcher = self.inner.backfill.clone();
            let task_key = key.clone();
            runtime.spawn(async move {
                let candles = fetcher.fetch(&task_key.instrument_key, task_key.interval).await;
                match weak.upgrade() {
                    Some(inner) => inner.complete_backfill(&task_key, generation, candles),
                    None => debug!(series = %task_key, "pipeline dropped before backfill completed"),
                }
            });
        }

        CandleSubscription {
            inner: Arc::downgrade(&self.inner),
            key,
            consumer_id,
            active: true,
        }
    }

    /// Up to `limit` most recent candles, oldest first, forming candle last.
    pub fn candle_history(&self, instrument_key: &str, interval: CandleInterval, limit: usize) -> Vec<Candle> {
        let key = SeriesKey::new(instrument_key, interval);
        self.inner
            .state
            .lock()
            .series
            .get(&key)
            .map(|s| s.aggregator.history(limit))
            .unwrap_or_default()
    }

    pub fn series_count(&self) -> usize {
        self.inner.state.lock().series.len()
    }

    pub fn consumer_count(&self, instrument_key: &str, interval: CandleInterval) -> usize {
        let key = SeriesKey::new(instrument_key, interval);
        self.inner
            .state
            .lock()
            .series
            .get(&key)
            .map_or(0, |s| s.consumers.len())
    }
}

impl Inner {
    fn on_tick(&self, key: &SeriesKey, generation: u64, tick: &Tick) {
        let mut deliveries = Vec::new();
        let handlers = {
            let mut state = self.state.lock();
            let Some(series) = state.series.get_mut(key).filter(|s| s.generation == generation) else {
                return;
            };
            if let BackfillState::Pending(pending) = &mut series.backfill {
                if buffer_tick(pending, tick.clone()) {
                    warn!(series = %key, limit = MAX_PENDING_TICKS, "pending tick buffer full; oldest tick dropped");
                }
                return;
            }
            series.apply(key, tick, &mut deliveries);
            if deliveries.is_empty() {
                return;
            }
            series.handlers()
        };
        deliver(&handlers, &deliveries);
    }

    fn complete_backfill(&self, key: &SeriesKey, generation: u64, candles: Vec<Candle>) {
        let mut deliveries = Vec::new();
        let handlers = {
            let mut state = self.state.lock();
            let Some(series) = state.series.get_mut(key).filter(|s| s.generation == generation) else {
                debug!(series = %key, generation, "stale backfill ignored");
                return;
            };
            let pending = match std::mem::replace(&mut series.backfill, BackfillState::Done) {
                BackfillState::Pending(pending) => pending,
                BackfillState::Done => return,
            };

            if !candles.is_empty() {
                match series.aggregator.seed(candles) {
                    Ok(()) => {
                        series.suppress_seeded_patterns();
                        if let Some(candle) = series.aggregator.current() {
                            deliveries.push(Delivery::Update(CandleUpdate {
                                instrument_key: key.instrument_key.clone(),
                                interval: key.interval,
                                candle,
                                closed: None,
                            }));
                        }
                    }
                    Err(e) => warn!(series = %key, error = %e, "backfill discarded"),
                }
            }

            info!(
                series = %key,
                seeded = series.aggregator.len(),
                buffered = pending.len(),
                "backfill applied"
            );
            for tick in &pending {
                series.apply(key, tick, &mut deliveries);
            }
            series.handlers()
        };
        deliver(&handlers, &deliveries);
    }

    fn remove_consumer(&self, key: &SeriesKey, consumer_id: u64) {
        let feed_id = {
            let mut state = self.state.lock();
            let Some(series) = state.series.get_mut(key) else {
                return;
            };
            series.consumers.retain(|c| c.id != consumer_id);
            if !series.consumers.is_empty() {
                return;
            }
            let feed_id = series.feed_id;
            state.series.remove(key);
            info!(series = %key, "candle series torn down");
            feed_id
        };
        self.feed.unsubscribe(&key.instrument_key, feed_id);
    }
}

// =============================================================================
// CandleSubscription
// =============================================================================

/// Guard for one consumer. Dropping it unsubscribes.
pub struct CandleSubscription {
    inner: Weak<Inner>,
    key: SeriesKey,
    consumer_id: u64,
    active: bool,
}

impl CandleSubscription {
    pub fn key(&self) -> &SeriesKey {
        &self.key
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !std::mem::take(&mut self.active) {
            return;
        }
        if let Some(inner) = self.inner.upgrade() {
            inner.remove_consumer(&self.key, self.consumer_id);
        }
    }
}

impl Drop for CandleSubscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for CandleSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CandleSubscription")
            .field("series", &self.key.to_string())
            .field("active", &self.active)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
