// =============================================================================
// Multi-Timeframe Trend Analyzer — EMA stack direction per timeframe
// =============================================================================
//
// EMA formula:
//   multiplier = 2 / (period + 1)
//   EMA_t      = close_t * multiplier + EMA_{t-1} * (1 - multiplier)
//
// The first EMA value is seeded with the SMA of the first `period` closes.
// =============================================================================

use crate::types::{TimeframeTrends, TrendDirection};

/// Compute the EMA series for `closes` with look-back `period`.
///
/// Returns an empty `Vec` when the input is too short or the period is zero.
pub fn calculate_ema(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() < period {
        return Vec::new();
    }

    let multiplier = 2.0 / (period + 1) as f64;

    let sma: f64 = closes[..period].iter().sum::<f64>() / period as f64;
    if !sma.is_finite() {
        return Vec::new();
    }

    let mut result = Vec::with_capacity(closes.len() - period + 1);
    result.push(sma);

    let mut prev_ema = sma;
    for &close in &closes[period..] {
        let ema = close * multiplier + prev_ema * (1.0 - multiplier);
        if !ema.is_finite() {
            break;
        }
        result.push(ema);
        prev_ema = ema;
    }

    result
}

/// Short-vs-long EMA trend direction for one close series. `Flat` when there
/// is not enough data or the EMAs coincide.
pub fn direction(closes: &[f64], short: usize, long: usize) -> TrendDirection {
    let short_series = calculate_ema(closes, short);
    let long_series = calculate_ema(closes, long);

    match (short_series.last(), long_series.last()) {
        (Some(&s), Some(&l)) if s > l => TrendDirection::Up,
        (Some(&s), Some(&l)) if s < l => TrendDirection::Down,
        _ => TrendDirection::Flat,
    }
}

/// Combine per-timeframe directions into the snapshot read. The agreement
/// flag requires all three timeframes to share a non-flat direction.
pub fn combine(m1: TrendDirection, m5: TrendDirection, m15: TrendDirection) -> TimeframeTrends {
    let aligned = m1 != TrendDirection::Flat && m1 == m5 && m5 == m15;
    TimeframeTrends { m1, m5, m15, aligned }
}

// =============================================================================
// Tests
// =============================================================================
