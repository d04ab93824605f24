// =============================================================================
// Fair Value Gap Analyzer — 3-candle imbalance detection and fill tracking
// =============================================================================
//
// A bullish gap exists when candle1.high < candle3.low: the middle candle
// moved so fast that the range [candle1.high, candle3.low] never traded.
// Bearish is symmetric. Fill percentage tracks the maximum excursion back
// into the gap after creation; a gap is FILLED at exactly 100%.
// =============================================================================

use crate::types::{Candle, FairValueGap, GapDirection, GapFill};

/// Detect gaps over consecutive candle triples. Returned gaps carry `id = 0`;
/// the caller persists them and receives real row ids.
pub fn detect(candles: &[Candle]) -> Vec<FairValueGap> {
    let mut gaps = Vec::new();

    for window in candles.windows(3) {
        let first = &window[0];
        let third = &window[2];

        if first.high < third.low {
            gaps.push(FairValueGap {
                id: 0,
                direction: GapDirection::Bullish,
                gap_low: first.high,
                gap_high: third.low,
                fill_pct: 0.0,
                fill: GapFill::Unfilled,
                created_at: third.open_time,
            });
        } else if first.low > third.high {
            gaps.push(FairValueGap {
                id: 0,
                direction: GapDirection::Bearish,
                gap_low: third.high,
                gap_high: first.low,
                fill_pct: 0.0,
                fill: GapFill::Unfilled,
                created_at: third.open_time,
            });
        }
    }

    gaps
}

/// Fold one later candle into a gap's fill tracking. Returns the new
/// `(fill_pct, state)` when the excursion deepened, `None` otherwise.
pub fn apply_candle(gap: &FairValueGap, candle: &Candle) -> Option<(f64, GapFill)> {
    let height = gap.gap_high - gap.gap_low;
    if height <= 0.0 {
        return None;
    }

    // Bullish gaps sit below price and fill from the top down; bearish gaps
    // sit above price and fill from the bottom up.
    let excursion = match gap.direction {
        GapDirection::Bullish => (gap.gap_high - candle.low.max(gap.gap_low)).max(0.0),
        GapDirection::Bearish => (candle.high.min(gap.gap_high) - gap.gap_low).max(0.0),
    };

    let pct = (excursion / height * 100.0).min(100.0);
    if pct <= gap.fill_pct {
        return None;
    }

    let state = if pct >= 100.0 {
        GapFill::Filled
    } else {
        GapFill::Partial
    };

    Some((pct, state))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(open_time: i64, open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle {
            open_time,
            open,
            high,
            low,
            close,
            volume: 1.0,
            buy_volume: 0.5,
            sell_volume: 0.5,
        }
    }

    #[test]
    fn bullish_gap_detected() {
        let candles = vec![
            candle(0, 98.0, 98.5, 97.5, 98.4),
            candle(60_000, 98.4, 99.8, 98.3, 99.7),
            candle(120_000, 99.7, 100.5, 99.5, 100.3),
        ];
        let gaps = detect(&candles);
        assert_eq!(gaps.len(), 1);
        let gap = &gaps[0];
        assert_eq!(gap.direction, GapDirection::Bullish);
        assert!((gap.gap_low - 98.5).abs() < 1e-9);
        assert!((gap.gap_high - 99.5).abs() < 1e-9);
        assert_eq!(gap.fill, GapFill::Unfilled);
        assert_eq!(gap.created_at, 120_000);
    }

    #[test]
    fn bearish_gap_detected() {
        let candles = vec![
            candle(0, 102.0, 102.5, 101.5, 101.6),
            candle(60_000, 101.6, 101.7, 100.2, 100.3),
            candle(120_000, 100.3, 100.8, 99.9, 100.0),
        ];
        let gaps = detect(&candles);
        assert_eq!(gaps.len(), 1);
        let gap = &gaps[0];
        assert_eq!(gap.direction, GapDirection::Bearish);
        assert!((gap.gap_low - 100.8).abs() < 1e-9);
        assert!((gap.gap_high - 101.5).abs() < 1e-9);
    }

    #[test]
    fn contiguous_candles_leave_no_gap() {
        let candles = vec![
            candle(0, 100.0, 101.0, 99.0, 100.5),
            candle(60_000, 100.5, 101.5, 100.0, 101.0),
            candle(120_000, 101.0, 102.0, 100.8, 101.5),
        ];
        assert!(detect(&candles).is_empty());
    }

    fn bullish_gap() -> FairValueGap {
        FairValueGap {
            id: 1,
            direction: GapDirection::Bullish,
            gap_low: 98.5,
            gap_high: 99.5,
            fill_pct: 0.0,
            fill: GapFill::Unfilled,
            created_at: 0,
        }
    }

    #[test]
    fn partial_fill_tracks_max_excursion() {
        let gap = bullish_gap();
        // Price dips to 99.0: halfway into the gap.
        let dip = candle(180_000, 100.0, 100.2, 99.0, 100.1);
        let (pct, state) = apply_candle(&gap, &dip).unwrap();
        assert!((pct - 50.0).abs() < 1e-9);
        assert_eq!(state, GapFill::Partial);

        // A shallower dip later does not reduce the recorded fill.
        let mut gap = gap;
        gap.fill_pct = 50.0;
        gap.fill = GapFill::Partial;
        let shallow = candle(240_000, 100.0, 100.2, 99.3, 100.1);
        assert!(apply_candle(&gap, &shallow).is_none());
    }

    #[test]
    fn fill_at_exactly_hundred_is_filled() {
        let gap = bullish_gap();
        // Low lands exactly on the gap floor.
        let touch = candle(180_000, 100.0, 100.2, 98.5, 99.8);
        let (pct, state) = apply_candle(&gap, &touch).unwrap();
        assert!((pct - 100.0).abs() < 1e-9);
        assert_eq!(state, GapFill::Filled);
    }

    #[test]
    fn traversal_past_the_gap_caps_at_hundred() {
        let gap = bullish_gap();
        let plunge = candle(180_000, 100.0, 100.2, 97.0, 97.5);
        let (pct, state) = apply_candle(&gap, &plunge).unwrap();
        assert!((pct - 100.0).abs() < 1e-9);
        assert_eq!(state, GapFill::Filled);
    }

    #[test]
    fn bearish_gap_fills_from_below() {
        let gap = FairValueGap {
            id: 2,
            direction: GapDirection::Bearish,
            gap_low: 100.8,
            gap_high: 101.5,
            fill_pct: 0.0,
            fill: GapFill::Unfilled,
            created_at: 0,
        };
        // Price rallies into the lower part of the gap.
        let rally = candle(180_000, 100.0, 101.15, 99.9, 101.0);
        let (pct, state) = apply_candle(&gap, &rally).unwrap();
        assert!((pct - 50.0).abs() < 1e-6);
        assert_eq!(state, GapFill::Partial);
    }

    #[test]
    fn candle_outside_gap_changes_nothing() {
        let gap = bullish_gap();
        let above = candle(180_000, 100.0, 100.5, 99.8, 100.2);
        assert!(apply_candle(&gap, &above).is_none());
    }
}
