// =============================================================================
// Candlestick Pattern Detector: Doji, Hammer, Engulfing
// =============================================================================
//
// Stateless classification of the newest candle in a short window. Rules:
//
//   Doji              |close - open| <= 0.1 * (high - low),  high > low
//   Hammer            lower > 2 * body  AND  upper < 0.5 * body,  body > 0
//   Bullish Engulfing prev bearish, cur bullish,
//                     cur.open < prev.close AND cur.close > prev.open
//   Bearish Engulfing prev bullish, cur bearish,
//                     cur.open > prev.close AND cur.close < prev.open
//
// Several patterns may match the same candle. They are reported in the fixed
// order above.
// =============================================================================

use crate::types::{Candle, PatternKind};

/// Number of trailing candles handed to the detector.
pub const PATTERN_WINDOW: usize = 3;

/// Doji body must be within this fraction of the candle range.
const DOJI_BODY_RATIO: f64 = 0.1;
/// Hammer lower shadow must exceed this multiple of the body.
const HAMMER_LOWER_SHADOW_MULT: f64 = 2.0;
/// Hammer upper shadow must stay below this multiple of the body.
const HAMMER_UPPER_SHADOW_MULT: f64 = 0.5;

/// Classify the last candle of `window` (oldest first).
///
/// Only the trailing [`PATTERN_WINDOW`] candles are considered. Single-candle
/// rules need one candle, engulfing rules need two; an empty window yields
/// nothing.
pub fn detect(window: &[Candle]) -> Vec<PatternKind> {
    let start = window.len().saturating_sub(PATTERN_WINDOW);
    let window = &window[start..];

    let Some((current, earlier)) = window.split_last() else {
        return Vec::new();
    };
    let previous = earlier.last();

    let mut found = Vec::new();
    if is_doji(current) {
        found.push(PatternKind::Doji);
    }
    if is_hammer(current) {
        found.push(PatternKind::Hammer);
    }
    if let Some(prev) = previous {
        if is_bullish_engulfing(prev, current) {
            found.push(PatternKind::BullishEngulfing);
        }
        if is_bearish_engulfing(prev, current) {
            found.push(PatternKind::BearishEngulfing);
        }
    }
    found
}

/// A zero-range candle is not evaluated.
pub fn is_doji(c: &Candle) -> bool {
    let range = c.range();
    range > 0.0 && c.body() <= DOJI_BODY_RATIO * range
}

pub fn is_hammer(c: &Candle) -> bool {
    let body = c.body();
    body > 0.0
        && c.lower_shadow() > HAMMER_LOWER_SHADOW_MULT * body
        && c.upper_shadow() < HAMMER_UPPER_SHADOW_MULT * body
}

pub fn is_bullish_engulfing(prev: &Candle, cur: &Candle) -> bool {
    prev.is_bearish() && cur.is_bullish() && cur.open < prev.close && cur.close > prev.open
}

pub fn is_bearish_engulfing(prev: &Candle, cur: &Candle) -> bool {
    prev.is_bullish() && cur.is_bearish() && cur.open > prev.close && cur.close < prev.open
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c(open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle::new(0, open, high, low, close, 0.0)
    }

    #[test]
    fn empty_window_detects_nothing() {
        assert!(detect(&[]).is_empty());
    }

    #[test]
    fn wide_body_is_not_doji() {
        // |102-100| = 2 > 0.1 * (105-95) = 1
        let candle = c(100.0, 105.0, 95.0, 102.0);
        assert!(!is_doji(&candle));
        // The next bucket opens flat at 102: zero range, not evaluated.
        let flat = c(102.0, 102.0, 102.0, 102.0);
        assert!(detect(&[candle, flat]).is_empty());
    }

    #[test]
    fn tight_body_is_doji() {
        // |100.02-100| = 0.02 <= 0.1 * (100.3-99.9) = 0.04
        let candle = c(100.0, 100.3, 99.9, 100.02);
        assert_eq!(detect(&[candle]), vec![PatternKind::Doji]);
    }

    #[test]
    fn body_above_a_tenth_of_range_is_not_doji() {
        // |100.2-100| = 0.2 > 0.04
        assert!(!is_doji(&c(100.0, 100.3, 99.9, 100.2)));
    }

    #[test]
    fn zero_range_is_not_doji() {
        assert!(!is_doji(&c(10.0, 10.0, 10.0, 10.0)));
    }

    #[test]
    fn hammer_shape() {
        // body 1, lower shadow 3, upper shadow 0.2
        let hammer = c(10.0, 11.2, 7.0, 11.0);
        assert!(is_hammer(&hammer));
        assert_eq!(detect(&[hammer]), vec![PatternKind::Hammer]);

        // upper shadow too long
        assert!(!is_hammer(&c(10.0, 12.0, 7.0, 11.0)));
        // zero body
        assert!(!is_hammer(&c(10.0, 10.0, 7.0, 10.0)));
    }

    #[test]
    fn bullish_engulfing_scenario() {
        let prev = c(50.0, 51.0, 44.0, 45.0);
        let cur = c(44.0, 53.0, 43.0, 52.0);
        assert_eq!(detect(&[prev, cur]), vec![PatternKind::BullishEngulfing]);
    }

    #[test]
    fn bearish_engulfing_is_the_mirror() {
        let prev = c(45.0, 51.0, 44.0, 50.0);
        let cur = c(52.0, 53.0, 43.0, 44.0);
        assert_eq!(detect(&[prev, cur]), vec![PatternKind::BearishEngulfing]);
    }

    #[test]
    fn engulfing_needs_opposite_directions() {
        let prev = c(45.0, 51.0, 44.0, 50.0);
        let cur = c(44.0, 53.0, 43.0, 52.0);
        assert!(!is_bullish_engulfing(&prev, &cur));
        assert!(!is_bearish_engulfing(&prev, &cur));
    }

    #[test]
    fn multiple_patterns_in_fixed_order() {
        // Previous bearish; current bullish hammer that also engulfs.
        let prev = c(10.5, 10.6, 10.1, 10.2);
        let cur = c(10.0, 11.1, 7.0, 11.0);
        assert_eq!(
            detect(&[prev, cur]),
            vec![PatternKind::Hammer, PatternKind::BullishEngulfing]
        );
    }

    #[test]
    fn only_trailing_window_is_used() {
        let old = c(50.0, 51.0, 44.0, 45.0);
        let filler = c(100.0, 105.0, 95.0, 102.0);
        let doji = c(100.0, 100.3, 99.9, 100.02);
        let candles = [old, filler, filler, filler, doji];
        assert_eq!(detect(&candles), vec![PatternKind::Doji]);
    }
}
