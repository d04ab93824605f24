// =============================================================================
// Microstructure Analyzer — rejection (pin-bar) detection
// =============================================================================
//
// body        = |close - open|
// upper wick  = high - max(open, close)
// lower wick  = min(open, close) - low
//
// Bullish rejection: lower wick >= 2x body AND close in the upper 20% of the
// candle range. Bearish rejection symmetric.
// =============================================================================

use crate::types::{Candle, RejectionSignal};

/// Wick must be at least this multiple of the body.
const WICK_BODY_FACTOR: f64 = 2.0;
/// Close must land in this outer fraction of the range.
const CLOSE_ZONE_FRACTION: f64 = 0.20;

/// Evaluate the latest candle for a rejection pattern.
pub fn rejection(candle: &Candle) -> RejectionSignal {
    let body = candle.body();
    let range = candle.range();

    if range <= 0.0 || body <= 0.0 {
        // A zero-range or zero-body candle carries no usable rejection read.
        return RejectionSignal {
            bullish: false,
            bearish: false,
            wick_body_ratio: 0.0,
        };
    }

    let upper = candle.upper_wick();
    let lower = candle.lower_wick();
    let close_position = (candle.close - candle.low) / range;

    let bullish = lower >= WICK_BODY_FACTOR * body && close_position >= 1.0 - CLOSE_ZONE_FRACTION;
    let bearish = upper >= WICK_BODY_FACTOR * body && close_position <= CLOSE_ZONE_FRACTION;

    RejectionSignal {
        bullish,
        bearish,
        wick_body_ratio: upper.max(lower) / body,
    }
}

// =============================================================================
// Tests
// =============================================================================
