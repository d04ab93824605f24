// =============================================================================
// Order Flow Analyzer — windowed CVD, imbalance, large-trade detection
// =============================================================================

use crate::types::{OrderFlowStats, Side, Tick};

/// Compute order-flow statistics over a tick window.
///
/// The imbalance ratio (buy volume / sell volume) is undefined when either
/// side is zero — it is reported as `None`, never as infinity, and the
/// decision engine treats an undefined ratio as a failed primary.
///
/// A tick counts as a large trade when its volume is at least
/// `large_trade_factor` times the median tick volume of the window.
pub fn compute(ticks: &[Tick], large_trade_factor: f64) -> OrderFlowStats {
    let mut buy_volume = 0.0;
    let mut sell_volume = 0.0;

    for tick in ticks {
        match tick.side {
            Side::Buy => buy_volume += tick.volume,
            Side::Sell => sell_volume += tick.volume,
        }
    }

    let imbalance = if buy_volume > 0.0 && sell_volume > 0.0 {
        Some(buy_volume / sell_volume)
    } else {
        None
    };

    let large_trades = count_large_trades(ticks, large_trade_factor);

    OrderFlowStats {
        cvd: buy_volume - sell_volume,
        buy_volume,
        sell_volume,
        imbalance,
        net_volume: buy_volume - sell_volume,
        large_trades,
    }
}

fn count_large_trades(ticks: &[Tick], factor: f64) -> u32 {
    if ticks.is_empty() || factor <= 0.0 {
        return 0;
    }

    let mut volumes: Vec<f64> = ticks.iter().map(|t| t.volume).collect();
    volumes.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let median = if volumes.len() % 2 == 1 {
        volumes[volumes.len() / 2]
    } else {
        let mid = volumes.len() / 2;
        (volumes[mid - 1] + volumes[mid]) / 2.0
    };

    if median <= 0.0 {
        return 0;
    }

    let threshold = median * factor;
    ticks.iter().filter(|t| t.volume >= threshold).count() as u32
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(price: f64, volume: f64, side: Side) -> Tick {
        Tick {
            timestamp: 0,
            price,
            volume,
            side,
            trade_id: String::new(),
        }
    }

    #[test]
    fn cvd_and_imbalance() {
        let ticks = vec![
            tick(100.0, 35.0, Side::Buy),
            tick(100.0, 10.0, Side::Sell),
        ];
        let stats = compute(&ticks, 3.0);
        assert!((stats.cvd - 25.0).abs() < f64::EPSILON);
        assert!((stats.imbalance.unwrap() - 3.5).abs() < f64::EPSILON);
        assert!((stats.net_volume - 25.0).abs() < f64::EPSILON);
    }

    #[test]
    fn imbalance_undefined_with_zero_side() {
        let ticks = vec![tick(100.0, 10.0, Side::Buy)];
        let stats = compute(&ticks, 3.0);
        assert!(stats.imbalance.is_none());

        let stats = compute(&[], 3.0);
        assert!(stats.imbalance.is_none());
        assert_eq!(stats.cvd, 0.0);
    }

    #[test]
    fn large_trades_against_median() {
        // Median volume = 1.0; the 5.0 tick is >= 3x median.
        let ticks = vec![
            tick(100.0, 1.0, Side::Buy),
            tick(100.0, 1.0, Side::Buy),
            tick(100.0, 1.0, Side::Sell),
            tick(100.0, 1.0, Side::Sell),
            tick(100.0, 5.0, Side::Buy),
        ];
        let stats = compute(&ticks, 3.0);
        assert_eq!(stats.large_trades, 1);
    }

    #[test]
    fn large_trade_at_exact_threshold_counts() {
        let ticks = vec![
            tick(100.0, 1.0, Side::Buy),
            tick(100.0, 1.0, Side::Buy),
            tick(100.0, 3.0, Side::Buy),
        ];
        let stats = compute(&ticks, 3.0);
        assert_eq!(stats.large_trades, 1);
    }
}
