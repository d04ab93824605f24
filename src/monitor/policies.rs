// =============================================================================
// Portfolio Risk Policies — dump, correlation, health, drawdown, hold time
// =============================================================================
//
// Pure policy logic, separated from the monitor's event plumbing so each rule
// is independently testable. The monitor evaluates these on its risk cadence
// and turns the verdicts into close intents and bus events.
// =============================================================================

use chrono::{DateTime, Utc};

use crate::config::DumpConfig;
use crate::types::{AssetClass, Candle, Direction, OrderFlowMetric, Position};

// ---------------------------------------------------------------------------
// 1. Dump detection
// ---------------------------------------------------------------------------

/// Verdict of the three dump signals for one position.
#[derive(Debug, Clone, Default)]
pub struct DumpVerdict {
    pub volume_reversal: bool,
    pub flow_flip: bool,
    pub momentum_break: bool,
}

impl DumpVerdict {
    pub fn fired(&self) -> usize {
        [self.volume_reversal, self.flow_flip, self.momentum_break]
            .iter()
            .filter(|&&b| b)
            .count()
    }
}

/// Adverse per-side volume for N consecutive closed 1m candles.
pub fn volume_reversal(candles_1m: &[Candle], direction: Direction, consecutive: usize) -> bool {
    if consecutive == 0 || candles_1m.len() < consecutive {
        return false;
    }
    candles_1m[candles_1m.len() - consecutive..]
        .iter()
        .all(|c| match direction {
            Direction::Long => c.sell_volume > c.buy_volume,
            Direction::Short => c.buy_volume > c.sell_volume,
        })
}

/// Order-flow dominance flipped against the position inside the window:
/// first dominance with the position, later dominance of at least the same
/// strength against it.
pub fn flow_flip(history: &[OrderFlowMetric], direction: Direction, dominance: f64) -> bool {
    let with_position = |imbalance: f64| match direction {
        Direction::Long => imbalance >= dominance,
        Direction::Short => imbalance <= 1.0 / dominance,
    };
    let against_position = |imbalance: f64| match direction {
        Direction::Long => imbalance <= 1.0 / dominance,
        Direction::Short => imbalance >= dominance,
    };

    let mut seen_with = false;
    for metric in history {
        let imbalance = match metric.imbalance {
            Some(i) if i > 0.0 => i,
            _ => continue,
        };
        if seen_with && against_position(imbalance) {
            return true;
        }
        if with_position(imbalance) {
            seen_with = true;
        }
    }
    false
}

/// Price broke the recent extreme by the configured margin.
pub fn momentum_break(
    price: f64,
    recent_high: f64,
    recent_low: f64,
    direction: Direction,
    break_pct: f64,
) -> bool {
    match direction {
        Direction::Long => price < recent_high * (1.0 - break_pct / 100.0),
        Direction::Short => price > recent_low * (1.0 + break_pct / 100.0),
    }
}

/// Combine the three signals for one position.
pub fn dump_verdict(
    config: &DumpConfig,
    direction: Direction,
    candles_1m: &[Candle],
    flow_history: &[OrderFlowMetric],
    price: f64,
    recent_extreme: Option<(f64, f64)>,
) -> DumpVerdict {
    let (recent_high, recent_low) = recent_extreme.unwrap_or((price, price));
    DumpVerdict {
        volume_reversal: volume_reversal(candles_1m, direction, config.consecutive_candles),
        flow_flip: flow_flip(flow_history, direction, config.flow_dominance),
        momentum_break: momentum_break(
            price,
            recent_high,
            recent_low,
            direction,
            config.momentum_break_pct,
        ),
    }
}

// ---------------------------------------------------------------------------
// 2. Leader moves (correlated dump)
// ---------------------------------------------------------------------------

/// Percent move of the latest price off the window high. Negative values are
/// drops; `None` without at least two samples.
pub fn leader_move_pct(window: &[(i64, f64)]) -> Option<f64> {
    if window.len() < 2 {
        return None;
    }
    let last = window.last()?.1;
    let high = window.iter().map(|&(_, p)| p).fold(f64::MIN, f64::max);
    if high <= 0.0 {
        return None;
    }
    Some((last - high) / high * 100.0)
}

// ---------------------------------------------------------------------------
// 3. Portfolio health
// ---------------------------------------------------------------------------

/// Weighted health score in [0, 100]. An empty portfolio is perfectly
/// healthy.
pub fn health_score(
    positions: &[Position],
    equity: f64,
    now: DateTime<Utc>,
    max_hold_secs: impl Fn(AssetClass) -> i64,
) -> f64 {
    if positions.is_empty() {
        return 100.0;
    }

    // 40%: total unrealized PnL normalized over [-5%, +5%] of equity.
    let total_upnl: f64 = positions.iter().map(|p| p.unrealized_pnl).sum();
    let upnl_pct = if equity > 0.0 {
        total_upnl / equity * 100.0
    } else {
        0.0
    };
    let pnl_component = ((upnl_pct + 5.0) / 10.0).clamp(0.0, 1.0) * 100.0;

    // 30%: fraction of positions in profit.
    let winners = positions.iter().filter(|p| p.unrealized_pnl > 0.0).count();
    let win_component = winners as f64 / positions.len() as f64 * 100.0;

    // 20%: concentration — the largest single-symbol share of exposure.
    let total_exposure: f64 = positions
        .iter()
        .map(|p| (p.mark_price * p.quantity).abs())
        .sum();
    let concentration_component = if total_exposure > 0.0 {
        let mut max_share = 0.0f64;
        for position in positions {
            let share: f64 = positions
                .iter()
                .filter(|p| p.pair.symbol == position.pair.symbol)
                .map(|p| (p.mark_price * p.quantity).abs())
                .sum::<f64>()
                / total_exposure;
            max_share = max_share.max(share);
        }
        100.0 - max_share * 100.0
    } else {
        100.0
    };

    // 10%: hold-time spread — penalize a book where everything is near its
    // maximum age.
    let avg_age_fraction = positions
        .iter()
        .map(|p| {
            let max_age = max_hold_secs(p.asset_class).max(1) as f64;
            (p.age_secs(now) as f64 / max_age).clamp(0.0, 1.0)
        })
        .sum::<f64>()
        / positions.len() as f64;
    let age_component = 100.0 - avg_age_fraction * 100.0;

    0.4 * pnl_component + 0.3 * win_component + 0.2 * concentration_component + 0.1 * age_component
}

// ---------------------------------------------------------------------------
// 4. Drawdown circuit breaker
// ---------------------------------------------------------------------------

/// Latched daily drawdown breaker. Levels are loss percentages of the
/// start-of-day equity; once a level fires it stays latched until a manual
/// reset, and a fired level never fires again.
#[derive(Debug)]
pub struct DrawdownBreaker {
    start_of_day_equity: f64,
    levels: Vec<f64>,
    latched_level: u8,
    day: String,
}

impl DrawdownBreaker {
    pub fn new(start_equity: f64, levels: Vec<f64>, now: DateTime<Utc>) -> Self {
        Self {
            start_of_day_equity: start_equity.max(f64::MIN_POSITIVE),
            levels,
            latched_level: 0,
            day: now.format("%Y-%m-%d").to_string(),
        }
    }

    pub fn latched_level(&self) -> u8 {
        self.latched_level
    }

    pub fn daily_pnl_pct(&self, current_equity: f64) -> f64 {
        (current_equity - self.start_of_day_equity) / self.start_of_day_equity * 100.0
    }

    /// Roll the equity baseline on a new calendar day. The latch survives:
    /// only a manual reset clears it.
    pub fn maybe_roll_day(&mut self, current_equity: f64, now: DateTime<Utc>) {
        let today = now.format("%Y-%m-%d").to_string();
        if today != self.day {
            self.day = today;
            self.start_of_day_equity = current_equity.max(f64::MIN_POSITIVE);
        }
    }

    /// Evaluate the current equity. Returns the newly latched level when the
    /// drawdown crossed a level not yet fired.
    pub fn evaluate(&mut self, current_equity: f64) -> Option<u8> {
        let loss_pct = -self.daily_pnl_pct(current_equity);
        let level = self
            .levels
            .iter()
            .filter(|&&threshold| loss_pct >= threshold)
            .count() as u8;

        if level > self.latched_level {
            self.latched_level = level;
            Some(level)
        } else {
            None
        }
    }

    /// Manual reset: clears the latch and re-bases the daily equity.
    pub fn reset(&mut self, current_equity: f64) {
        self.latched_level = 0;
        self.start_of_day_equity = current_equity.max(f64::MIN_POSITIVE);
    }
}

// ---------------------------------------------------------------------------
// 5. Hold time
// ---------------------------------------------------------------------------

pub fn hold_time_exceeded(
    position: &Position,
    now: DateTime<Utc>,
    max_hold_secs: impl Fn(AssetClass) -> i64,
) -> bool {
    position.age_secs(now) > max_hold_secs(position.asset_class)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MarketType, PairId, PositionSource, PositionState};
    use chrono::Duration;

    fn candle(buy: f64, sell: f64) -> Candle {
        Candle {
            open_time: 0,
            open: 100.0,
            high: 101.0,
            low: 99.0,
            close: 100.0,
            volume: buy + sell,
            buy_volume: buy,
            sell_volume: sell,
        }
    }

    fn metric(imbalance: Option<f64>) -> OrderFlowMetric {
        OrderFlowMetric {
            timestamp: 0,
            cvd: 0.0,
            imbalance,
            buy_volume: 0.0,
            sell_volume: 0.0,
            net_volume: 0.0,
            large_trades: 0,
        }
    }

    fn position(symbol: &str, entry: f64, quantity: f64, upnl: f64) -> Position {
        Position {
            id: format!("p-{symbol}"),
            pair: PairId::new("paper", MarketType::Spot, symbol),
            direction: Direction::Long,
            entry_price: entry,
            quantity,
            entry_time: Utc::now(),
            asset_class: AssetClass::Regular,
            source: PositionSource::Execution,
            trailing_distance_pct: 0.5,
            trailing_stop_price: None,
            highest_mark: None,
            lowest_mark: None,
            mark_price: entry,
            unrealized_pnl: upnl,
            unrealized_pnl_pct: 0.0,
            state: PositionState::Open,
            exit_reason: None,
            realized_pnl: None,
        }
    }

    // ---- dump signals ------------------------------------------------------

    #[test]
    fn volume_reversal_needs_full_streak() {
        let adverse = vec![candle(1.0, 2.0), candle(1.0, 3.0), candle(0.5, 2.0)];
        assert!(volume_reversal(&adverse, Direction::Long, 3));

        let broken = vec![candle(1.0, 2.0), candle(3.0, 1.0), candle(0.5, 2.0)];
        assert!(!volume_reversal(&broken, Direction::Long, 3));

        // A short is hurt by buy pressure.
        let buys = vec![candle(3.0, 1.0), candle(2.0, 1.0), candle(4.0, 1.0)];
        assert!(volume_reversal(&buys, Direction::Short, 3));

        assert!(!volume_reversal(&adverse[..2], Direction::Long, 3));
    }

    #[test]
    fn flow_flip_requires_both_phases() {
        // Buy-dominant then sell-dominant: flip against a long.
        let history = vec![
            metric(Some(3.0)),
            metric(Some(1.2)),
            metric(Some(0.3)),
        ];
        assert!(flow_flip(&history, Direction::Long, 2.5));

        // Never sell-dominant afterwards: no flip.
        let history = vec![metric(Some(3.0)), metric(Some(1.0))];
        assert!(!flow_flip(&history, Direction::Long, 2.5));

        // Sell-dominant first without prior buy dominance: no flip.
        let history = vec![metric(Some(0.3)), metric(Some(3.0))];
        assert!(!flow_flip(&history, Direction::Long, 2.5));

        // Undefined imbalances are skipped.
        let history = vec![metric(Some(3.0)), metric(None), metric(Some(0.3))];
        assert!(flow_flip(&history, Direction::Long, 2.5));
    }

    #[test]
    fn momentum_break_off_the_extreme() {
        // Long: high 100, 0.5% margin => break below 99.5.
        assert!(momentum_break(99.4, 100.0, 98.0, Direction::Long, 0.5));
        assert!(!momentum_break(99.6, 100.0, 98.0, Direction::Long, 0.5));

        // Short: low 98, break above 98.49.
        assert!(momentum_break(98.6, 100.0, 98.0, Direction::Short, 0.5));
        assert!(!momentum_break(98.3, 100.0, 98.0, Direction::Short, 0.5));
    }

    #[test]
    fn verdict_counts_two_of_three() {
        let config = DumpConfig::default();
        let candles = vec![candle(1.0, 2.0), candle(1.0, 3.0), candle(0.5, 2.0)];
        let history = vec![metric(Some(1.0))];
        let verdict = dump_verdict(
            &config,
            Direction::Long,
            &candles,
            &history,
            99.0,
            Some((100.0, 98.0)),
        );
        assert!(verdict.volume_reversal);
        assert!(!verdict.flow_flip);
        assert!(verdict.momentum_break);
        assert_eq!(verdict.fired(), 2);
    }

    // ---- leader moves ------------------------------------------------------

    #[test]
    fn leader_move_measures_drop_from_window_high() {
        let window = vec![(0, 60_000.0), (1, 60_500.0), (2, 59_500.0)];
        let drop = leader_move_pct(&window).unwrap();
        assert!((drop - (59_500.0 - 60_500.0) / 60_500.0 * 100.0).abs() < 1e-9);
        assert!(drop < -1.5);

        assert!(leader_move_pct(&[(0, 60_000.0)]).is_none());
    }

    // ---- health ------------------------------------------------------------

    #[test]
    fn empty_portfolio_is_healthy() {
        let score = health_score(&[], 100_000.0, Utc::now(), |_| 1_800);
        assert!((score - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn flat_fresh_diversified_book_scores_well() {
        let positions = vec![
            position("AAA", 100.0, 1.0, 0.0),
            position("BBB", 100.0, 1.0, 0.0),
        ];
        let score = health_score(&positions, 100_000.0, Utc::now(), |_| 1_800);
        // PnL 50 * 0.4 + winners 0 * 0.3 + concentration 50 * 0.2 + age 100 * 0.1
        assert!((score - 40.0).abs() < 1.0, "score {score}");
    }

    #[test]
    fn deep_losses_drag_the_score_down() {
        let losing = vec![
            position("AAA", 100.0, 1.0, -3_000.0),
            position("BBB", 100.0, 1.0, -2_500.0),
        ];
        let healthy = vec![
            position("AAA", 100.0, 1.0, 3_000.0),
            position("BBB", 100.0, 1.0, 2_500.0),
        ];
        let now = Utc::now();
        let bad = health_score(&losing, 100_000.0, now, |_| 1_800);
        let good = health_score(&healthy, 100_000.0, now, |_| 1_800);
        assert!(bad < good);
        // -5.5% unrealized saturates the PnL component at zero.
        assert!(bad < 50.0);
    }

    #[test]
    fn stale_positions_lose_age_credit() {
        let mut old = position("AAA", 100.0, 1.0, 0.0);
        old.entry_time = Utc::now() - Duration::seconds(1_800);
        let fresh = position("AAA", 100.0, 1.0, 0.0);

        let now = Utc::now();
        let old_score = health_score(&[old], 100_000.0, now, |_| 1_800);
        let fresh_score = health_score(&[fresh], 100_000.0, now, |_| 1_800);
        assert!(old_score < fresh_score);
    }

    // ---- drawdown breaker --------------------------------------------------

    #[test]
    fn breaker_levels_fire_in_order_and_latch() {
        let mut breaker = DrawdownBreaker::new(100_000.0, vec![3.0, 4.0, 5.0], Utc::now());

        assert!(breaker.evaluate(99_000.0).is_none()); // -1%
        assert_eq!(breaker.evaluate(96_900.0), Some(1)); // -3.1%
        // Same level never fires twice.
        assert!(breaker.evaluate(96_800.0).is_none());
        assert_eq!(breaker.evaluate(95_800.0), Some(2)); // -4.2%
        assert_eq!(breaker.evaluate(94_000.0), Some(3)); // -6%
        assert_eq!(breaker.latched_level(), 3);
    }

    #[test]
    fn drawdown_level_two_at_spec_equity() {
        // Session start 100 000, current 95 800: -4.2% => level 2.
        let mut breaker = DrawdownBreaker::new(100_000.0, vec![3.0, 4.0, 5.0], Utc::now());
        assert_eq!(breaker.evaluate(95_800.0), Some(2));
        assert!((breaker.daily_pnl_pct(95_800.0) - (-4.2)).abs() < 1e-9);
    }

    #[test]
    fn latch_survives_day_roll_until_manual_reset() {
        let now = Utc::now();
        let mut breaker = DrawdownBreaker::new(100_000.0, vec![3.0, 4.0, 5.0], now);
        breaker.evaluate(95_000.0);
        assert_eq!(breaker.latched_level(), 2);

        breaker.maybe_roll_day(95_000.0, now + Duration::days(1));
        assert_eq!(breaker.latched_level(), 2);
        // New baseline: a flat day no longer reads as a drawdown.
        assert!(breaker.daily_pnl_pct(95_000.0).abs() < 1e-9);

        breaker.reset(95_000.0);
        assert_eq!(breaker.latched_level(), 0);
        assert!(breaker.evaluate(91_000.0).is_some());
    }

    // ---- hold time ---------------------------------------------------------

    #[test]
    fn hold_time_respects_asset_class() {
        let now = Utc::now();
        let mut scalp = position("AAA", 100.0, 1.0, 0.0);
        scalp.entry_time = now - Duration::seconds(2_000);

        let mut meme = position("DOGE", 0.1, 1.0, 0.0);
        meme.asset_class = AssetClass::Meme;
        meme.entry_time = now - Duration::seconds(2_000);

        let limits = |class: AssetClass| match class {
            AssetClass::Meme => 86_400,
            _ => 1_800,
        };

        assert!(hold_time_exceeded(&scalp, now, limits));
        assert!(!hold_time_exceeded(&meme, now, limits));
    }
}
