use std::collections::{BTreeMap, VecDeque};

use tracing::{debug, warn};

use crate::error::PipelineError;
use crate::types::{Candle, CandleInterval, Tick};

// ---------------------------------------------------------------------------
// Outcome of a single tick
// ---------------------------------------------------------------------------

/// What a tick did to the series.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TickOutcome {
    /// The tick opened a new bucket. `closed` is the candle it finalised.
    Opened { closed: Option<Candle> },
    /// The tick was folded into the current candle.
    Updated,
    /// The tick belongs to a bucket older than the current candle.
    Late,
    /// The tick failed validation or belongs to another instrument.
    Rejected,
}

impl TickOutcome {
    /// `true` when the current candle changed.
    pub fn changed(&self) -> bool {
        matches!(self, Self::Opened { .. } | Self::Updated)
    }
}

// ---------------------------------------------------------------------------
// CandleAggregator -- bounded OHLCV series for one (instrument, interval)
// ---------------------------------------------------------------------------

/// Folds a tick stream for one instrument into fixed-interval candles.
///
/// Holds at most `max_history` candles in total: the closed ring plus the
/// single in-progress candle. Closed candles are never touched again; a tick
/// whose bucket is older than the current candle is dropped.
#[derive(Debug, Clone)]
pub struct CandleAggregator {
    instrument: String,
    interval: CandleInterval,
    max_history: usize,
    closed: VecDeque<Candle>,
    current: Option<Candle>,
    ticks_aggregated: u64,
}

impl CandleAggregator {
    /// `max_history` is clamped to at least one so the current candle always
    /// fits.
    pub fn new(instrument: impl Into<String>, interval: CandleInterval, max_history: usize) -> Self {
        let max_history = max_history.max(1);
        Self {
            instrument: instrument.into(),
            interval,
            max_history,
            closed: VecDeque::with_capacity(max_history),
            current: None,
            ticks_aggregated: 0,
        }
    }

    pub fn instrument(&self) -> &str {
        &self.instrument
    }

    pub fn interval(&self) -> CandleInterval {
        self.interval
    }

    pub fn max_history(&self) -> usize {
        self.max_history
    }

    /// Apply one live tick.
    pub fn on_tick(&mut self, tick: &Tick) -> TickOutcome {
        if tick.instrument_key != self.instrument {
            warn!(
                expected = %self.instrument,
                got = %tick.instrument_key,
                "tick routed to the wrong series"
            );
            return TickOutcome::Rejected;
        }
        if let Err(reason) = tick.validate() {
            warn!(instrument = %self.instrument, %reason, "rejecting tick");
            return TickOutcome::Rejected;
        }

        let Some(bucket) = self.interval.bucket_start(tick.timestamp) else {
            warn!(
                instrument = %self.instrument,
                timestamp = tick.timestamp,
                "rejecting tick outside the bucketable range"
            );
            return TickOutcome::Rejected;
        };
        let price = tick.last_traded_price;
        let volume = tick.volume_or_zero();

        let outcome = match self.current.map(|c| c.timestamp) {
            Some(current) if bucket < current => {
                debug!(
                    instrument = %self.instrument,
                    bucket,
                    current,
                    "late tick ignored"
                );
                return TickOutcome::Late;
            }
            Some(current) if bucket == current => {
                if let Some(current) = self.current.as_mut() {
                    current.apply(price, volume);
                }
                TickOutcome::Updated
            }
            _ => {
                let closed = self.current.take();
                if let Some(candle) = closed {
                    self.closed.push_back(candle);
                }
                self.current = Some(Candle::opened_at(bucket, price, volume));
                self.enforce_capacity();
                TickOutcome::Opened { closed }
            }
        };

        self.ticks_aggregated += 1;
        outcome
    }

    /// Replace the initial history with backfilled candles.
    ///
    /// The input is normalised (invalid candles dropped, aligned, sorted,
    /// deduplicated) and the newest candle becomes the current one so that
    /// live ticks in the same bucket continue it. Rejected once any live tick
    /// has been aggregated.
    pub fn seed(&mut self, history: Vec<Candle>) -> Result<(), PipelineError> {
        if self.ticks_aggregated > 0 {
            return Err(PipelineError::SeedAfterTicks {
                instrument: self.instrument.clone(),
            });
        }

        let mut candles: VecDeque<Candle> = normalize_history(self.interval, history).into();
        self.current = candles.pop_back();
        self.closed = candles;
        self.enforce_capacity();

        debug!(
            instrument = %self.instrument,
            interval = %self.interval,
            retained = self.len(),
            "series seeded"
        );
        Ok(())
    }

    /// The in-progress candle, if any.
    pub fn current(&self) -> Option<Candle> {
        self.current
    }

    /// Up to `limit` most-recent candles, oldest first, ending with the
    /// current candle when one exists.
    pub fn history(&self, limit: usize) -> Vec<Candle> {
        let all = self.closed.iter().chain(self.current.iter());
        let skip = self.len().saturating_sub(limit);
        all.skip(skip).copied().collect()
    }

    /// Total retained candles, including the current one.
    pub fn len(&self) -> usize {
        self.closed.len() + usize::from(self.current.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether any live tick has been folded in.
    pub fn has_ticks(&self) -> bool {
        self.ticks_aggregated > 0
    }

    fn enforce_capacity(&mut self) {
        while self.len() > self.max_history {
            self.closed.pop_front();
        }
    }
}

/// Drop invalid candles, align timestamps to bucket starts, sort, and
/// deduplicate by timestamp (a later entry for the same bucket wins).
pub fn normalize_history(interval: CandleInterval, candles: Vec<Candle>) -> Vec<Candle> {
    let mut by_bucket: BTreeMap<i64, Candle> = BTreeMap::new();
    for mut candle in candles {
        if !candle.is_valid() {
            warn!(timestamp = candle.timestamp, "dropping candle that violates OHLCV invariants");
            continue;
        }
        let Some(bucket) = interval.bucket_start(candle.timestamp) else {
            warn!(timestamp = candle.timestamp, "dropping candle outside the bucketable range");
            continue;
        };
        candle.timestamp = bucket;
        by_bucket.insert(candle.timestamp, candle);
    }
    by_bucket.into_values().collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "NSE_EQ|INE002A01018";
    const MIN: i64 = 60_000;

    fn tick(price: f64, ts: i64) -> Tick {
        Tick::new(KEY, price, Some(1.0), ts)
    }

    fn agg(max: usize) -> CandleAggregator {
        CandleAggregator::new(KEY, CandleInterval::OneMinute, max)
    }

    #[test]
    fn first_tick_opens_candle() {
        let mut a = agg(10);
        let out = a.on_tick(&tick(100.0, 5_000));
        assert_eq!(out, TickOutcome::Opened { closed: None });
        let c = a.current().unwrap();
        assert_eq!(c.timestamp, 0);
        assert_eq!((c.open, c.high, c.low, c.close, c.volume), (100.0, 100.0, 100.0, 100.0, 1.0));
    }

    #[test]
    fn ticks_within_bucket_keep_ohlc_bounds() {
        let prices = [100.0, 104.5, 97.25, 101.0, 99.0, 105.0, 95.0, 102.0];
        let mut a = agg(10);
        for (i, p) in prices.iter().enumerate() {
            a.on_tick(&tick(*p, i as i64 * 1_000));
            let c = a.current().unwrap();
            assert!(c.low <= c.open.min(c.close));
            assert!(c.high >= c.open.max(c.close));
        }
        let c = a.current().unwrap();
        assert_eq!((c.open, c.high, c.low, c.close), (100.0, 105.0, 95.0, 102.0));
        assert_eq!(c.volume, prices.len() as f64);
        assert_eq!(a.len(), 1);
    }

    #[test]
    fn crossing_n_boundaries_yields_n_closed_plus_open() {
        let n = 7;
        let mut a = agg(100);
        for bucket in 0..=n {
            a.on_tick(&tick(100.0 + bucket as f64, bucket * MIN + 10));
            a.on_tick(&tick(101.0 + bucket as f64, bucket * MIN + 20));
        }
        let history = a.history(100);
        assert_eq!(history.len(), n as usize + 1);
        assert!(history.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
        assert_eq!(a.current().unwrap().timestamp, n * MIN);
    }

    #[test]
    fn opening_returns_the_closed_candle() {
        let mut a = agg(10);
        a.on_tick(&tick(100.0, 0));
        a.on_tick(&tick(103.0, 30_000));
        match a.on_tick(&tick(99.0, MIN)) {
            TickOutcome::Opened { closed: Some(c) } => {
                assert_eq!(c.timestamp, 0);
                assert_eq!(c.close, 103.0);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn late_tick_never_changes_history() {
        let mut a = agg(10);
        a.on_tick(&tick(100.0, 0));
        a.on_tick(&tick(101.0, MIN));
        a.on_tick(&tick(102.0, 2 * MIN));
        let before = a.history(10);

        assert_eq!(a.on_tick(&tick(500.0, MIN + 5)), TickOutcome::Late);
        assert_eq!(a.on_tick(&tick(1.0, 10)), TickOutcome::Late);
        assert_eq!(a.history(10), before);
    }

    #[test]
    fn tick_in_current_bucket_after_later_ticks_still_updates() {
        let mut a = agg(10);
        a.on_tick(&tick(100.0, MIN + 50_000));
        assert_eq!(a.on_tick(&tick(90.0, MIN + 1)), TickOutcome::Updated);
        assert_eq!(a.current().unwrap().low, 90.0);
    }

    #[test]
    fn history_limit_and_capacity_are_respected() {
        let mut a = agg(5);
        for i in 0..20 {
            a.on_tick(&tick(100.0 + i as f64, i * MIN));
            assert!(a.len() <= 5);
        }
        assert_eq!(a.history(3).len(), 3);
        assert_eq!(a.history(50).len(), 5);
        assert!(a.history(0).is_empty());
        // Oldest evicted first.
        let h = a.history(5);
        assert_eq!(h.first().unwrap().timestamp, 15 * MIN);
        assert_eq!(h.last().unwrap().timestamp, 19 * MIN);
    }

    #[test]
    fn volume_defaults_to_zero() {
        let mut a = agg(10);
        a.on_tick(&Tick::new(KEY, 10.0, None, 0));
        a.on_tick(&Tick::new(KEY, 11.0, None, 1));
        assert_eq!(a.current().unwrap().volume, 0.0);
    }

    #[test]
    fn invalid_and_foreign_ticks_are_rejected() {
        let mut a = agg(10);
        assert_eq!(a.on_tick(&Tick::new(KEY, -1.0, None, 0)), TickOutcome::Rejected);
        assert_eq!(a.on_tick(&Tick::new("OTHER", 1.0, None, 0)), TickOutcome::Rejected);
        assert!(a.is_empty());
        assert!(!a.has_ticks());
    }

    #[test]
    fn tick_at_the_bottom_of_time_is_rejected_without_touching_history() {
        let mut a = agg(10);
        a.on_tick(&tick(10.0, MIN));
        let before = a.history(10);

        assert_eq!(a.on_tick(&tick(11.0, i64::MIN)), TickOutcome::Rejected);
        assert_eq!(a.history(10), before);
        assert_eq!(a.on_tick(&tick(12.0, MIN + 1)), TickOutcome::Updated);
    }

    #[test]
    fn normalisation_drops_candles_that_cannot_be_bucketed() {
        let candles = vec![
            Candle::new(i64::MIN, 1.0, 2.0, 0.5, 1.5, 1.0),
            Candle::new(MIN + 5, 1.0, 2.0, 0.5, 1.5, 1.0),
        ];
        let out = normalize_history(CandleInterval::OneMinute, candles);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].timestamp, MIN);
    }

    #[test]
    fn seed_sorts_dedupes_and_continues_last_bucket() {
        let mut a = agg(10);
        let seeded = vec![
            Candle::new(2 * MIN, 12.0, 13.0, 11.0, 12.5, 5.0),
            Candle::new(0, 10.0, 11.0, 9.0, 10.5, 5.0),
            Candle::new(MIN, 10.5, 12.0, 10.0, 11.0, 5.0),
            Candle::new(MIN + 10, 10.5, 12.5, 10.0, 11.5, 6.0),
            Candle::new(3 * MIN, 10.0, 9.0, 11.0, 10.0, 1.0), // high < low
        ];
        a.seed(seeded).unwrap();
        let h = a.history(10);
        assert_eq!(h.iter().map(|c| c.timestamp).collect::<Vec<_>>(), vec![0, MIN, 2 * MIN]);
        assert_eq!(h[1].close, 11.5);

        assert_eq!(a.on_tick(&tick(14.0, 2 * MIN + 1)), TickOutcome::Updated);
        let c = a.current().unwrap();
        assert_eq!((c.open, c.high, c.close), (12.0, 14.0, 14.0));
        assert_eq!(a.on_tick(&tick(14.0, MIN)), TickOutcome::Late);
    }

    #[test]
    fn seed_is_truncated_to_capacity() {
        let mut a = agg(3);
        let seeded = (0..10)
            .map(|i| Candle::new(i * MIN, 1.0, 2.0, 0.5, 1.5, 1.0))
            .collect();
        a.seed(seeded).unwrap();
        assert_eq!(a.len(), 3);
        assert_eq!(a.history(3)[0].timestamp, 7 * MIN);
    }

    #[test]
    fn seed_after_ticks_is_rejected() {
        let mut a = agg(10);
        a.seed(Vec::new()).unwrap();
        a.on_tick(&tick(100.0, 0));
        let err = a.seed(vec![Candle::new(0, 1.0, 1.0, 1.0, 1.0, 0.0)]).unwrap_err();
        assert_eq!(err, PipelineError::SeedAfterTicks { instrument: KEY.into() });
        assert_eq!(a.current().unwrap().open, 100.0);
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let mut a = agg(0);
        a.on_tick(&tick(1.0, 0));
        a.on_tick(&tick(2.0, MIN));
        assert_eq!(a.max_history(), 1);
        assert_eq!(a.history(10).len(), 1);
        assert_eq!(a.current().unwrap().open, 2.0);
    }
}
