// =============================================================================
// Decision Engine — two-stage confluence model
// =============================================================================
//
// Stage 1, the primary gate: order-flow dominance and a microstructure
// rejection must BOTH pass and agree on direction. Any failure or
// disagreement rejects immediately — no filter ever runs on a setup the
// primaries did not qualify.
//
// Stage 2, weighted filters: each contributes [0, weight] toward the
// confluence score. The signal is emitted when the score reaches the
// configured minimum, with the full per-filter breakdown attached for audit.
//
// The engine never throws to the bus: analyzer problems become failed
// primaries with the reason recorded.
// =============================================================================

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};

use crate::bus::{Component, Event, EventBus, EventHandler, EventKind};
use crate::config::DecisionConfig;
use crate::types::{
    AnalyticsSnapshot, Confidence, Direction, FilterScore, GapDirection, GapFill, PrimaryResult,
    TradeSignal, Zone, ZoneKind, ZoneState,
};

const HANDLER_NAME: &str = "decision";

/// Price structure (zones, value-area edges) participates when it sits
/// within this percentage of the entry price.
const STRUCTURE_PROXIMITY_PCT: f64 = 2.0;

/// Confidence bands over the confluence score.
const VERY_HIGH_SCORE: f64 = 7.0;
const HIGH_SCORE: f64 = 5.0;
const MEDIUM_SCORE: f64 = 4.0;

/// Fallback stop distance when no structural stop exists (percent).
const FALLBACK_STOP_PCT: f64 = 1.0;

// ---------------------------------------------------------------------------
// Evaluation outcome
// ---------------------------------------------------------------------------

/// Full audit of one evaluation, kept for observability and tests. When the
/// primary gate rejects, `filters` stays empty — stage 2 never ran.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub primaries: Vec<PrimaryResult>,
    pub filters: Vec<FilterScore>,
    pub confluence: f64,
    pub signal: Option<TradeSignal>,
}

// ---------------------------------------------------------------------------
// Stage 1 — primaries
// ---------------------------------------------------------------------------

fn flow_primary(config: &DecisionConfig, snapshot: &AnalyticsSnapshot) -> PrimaryResult {
    let name = "order_flow".to_string();

    let ratio = match snapshot.order_flow.imbalance {
        Some(r) if r > 0.0 => r,
        _ => {
            return PrimaryResult {
                name,
                passed: false,
                direction: None,
                reason: "imbalance undefined (one-sided or empty window)".to_string(),
            };
        }
    };

    let dominance = ratio.max(1.0 / ratio);
    if dominance < config.min_flow_dominance {
        return PrimaryResult {
            name,
            passed: false,
            direction: None,
            reason: format!(
                "dominance {:.2} below {:.2}",
                dominance, config.min_flow_dominance
            ),
        };
    }

    let direction = if ratio > 1.0 {
        Direction::Long
    } else {
        Direction::Short
    };

    PrimaryResult {
        name,
        passed: true,
        direction: Some(direction),
        reason: format!("dominance {dominance:.2} ({direction})"),
    }
}

fn microstructure_primary(config: &DecisionConfig, snapshot: &AnalyticsSnapshot) -> PrimaryResult {
    let name = "microstructure".to_string();
    let rejection = &snapshot.rejection;

    if !rejection.bullish && !rejection.bearish {
        return PrimaryResult {
            name,
            passed: false,
            direction: None,
            reason: "no rejection pattern".to_string(),
        };
    }

    if rejection.wick_body_ratio < config.min_wick_body_ratio {
        return PrimaryResult {
            name,
            passed: false,
            direction: None,
            reason: format!(
                "wick/body {:.2} below {:.2}",
                rejection.wick_body_ratio, config.min_wick_body_ratio
            ),
        };
    }

    let direction = if rejection.bullish {
        Direction::Long
    } else {
        Direction::Short
    };

    PrimaryResult {
        name,
        passed: true,
        direction: Some(direction),
        reason: format!(
            "{} rejection, wick/body {:.2}",
            if rejection.bullish { "bullish" } else { "bearish" },
            rejection.wick_body_ratio
        ),
    }
}

// ---------------------------------------------------------------------------
// Stage 2 — weighted filters
// ---------------------------------------------------------------------------

fn proximity(entry: f64) -> f64 {
    entry * STRUCTURE_PROXIMITY_PCT / 100.0
}

/// Demand zone for longs / supply zone for shorts: fresh at price scores the
/// full weight, tested once or twice scores 1.0.
fn zone_filter(weight: f64, direction: Direction, entry: f64, zones: &[Zone]) -> FilterScore {
    let name = "zone".to_string();
    let wanted = match direction {
        Direction::Long => ZoneKind::Demand,
        Direction::Short => ZoneKind::Supply,
    };

    let near = zones.iter().filter(|z| z.kind == wanted).find(|z| {
        z.contains(entry)
            || match direction {
                Direction::Long => entry >= z.price_high && entry - z.price_high <= proximity(entry),
                Direction::Short => entry <= z.price_low && z.price_low - entry <= proximity(entry),
            }
    });

    match near {
        Some(zone) if zone.state == ZoneState::Fresh => FilterScore {
            name,
            score: weight,
            weight,
            reason: format!("fresh {} zone {:.4}-{:.4}", zone.kind.as_str(), zone.price_low, zone.price_high),
        },
        Some(zone) => FilterScore {
            name,
            score: weight / 2.0,
            weight,
            reason: format!("zone tested {}x", zone.test_count),
        },
        None => FilterScore {
            name,
            score: 0.0,
            weight,
            reason: "no qualifying zone at price".to_string(),
        },
    }
}

/// Full weight at a value-area edge, half credit inside the value area.
fn profile_filter(weight: f64, entry: f64, snapshot: &AnalyticsSnapshot) -> FilterScore {
    let name = "market_profile".to_string();

    let profile = match &snapshot.profile {
        Some(p) => p,
        None => {
            return FilterScore {
                name,
                score: 0.0,
                weight,
                reason: "no profile".to_string(),
            };
        }
    };

    let tolerance = proximity(entry);
    let at_edge =
        (entry - profile.vah).abs() <= tolerance || (entry - profile.val).abs() <= tolerance;

    if at_edge {
        FilterScore {
            name,
            score: weight,
            weight,
            reason: format!("at value-area edge (vah {:.4}, val {:.4})", profile.vah, profile.val),
        }
    } else if entry > profile.val && entry < profile.vah {
        FilterScore {
            name,
            score: weight / 3.0,
            weight,
            reason: "inside value area".to_string(),
        }
    } else {
        FilterScore {
            name,
            score: 0.0,
            weight,
            reason: "outside value area".to_string(),
        }
    }
}

/// Extreme deviation opposing the entry side scores full; |z| >= 1 scores
/// half credit.
fn reversion_filter(weight: f64, direction: Direction, zscore: f64) -> FilterScore {
    let name = "mean_reversion".to_string();
    // A long wants price stretched below the mean, a short above it.
    let opposing = match direction {
        Direction::Long => -zscore,
        Direction::Short => zscore,
    };

    if opposing >= 2.0 {
        FilterScore {
            name,
            score: weight,
            weight,
            reason: format!("extreme deviation z={zscore:.2}"),
        }
    } else if opposing >= 1.0 {
        FilterScore {
            name,
            score: weight / 2.0,
            weight,
            reason: format!("moderate deviation z={zscore:.2}"),
        }
    } else {
        FilterScore {
            name,
            score: 0.0,
            weight,
            reason: format!("no opposing deviation (z={zscore:.2})"),
        }
    }
}

/// Unfilled gap aligned with the trade direction scores full, partially
/// filled scores half credit.
fn gap_filter(weight: f64, direction: Direction, snapshot: &AnalyticsSnapshot) -> FilterScore {
    let name = "fair_value_gap".to_string();
    let wanted = match direction {
        Direction::Long => GapDirection::Bullish,
        Direction::Short => GapDirection::Bearish,
    };

    let best = snapshot
        .gaps
        .iter()
        .filter(|g| g.direction == wanted && g.fill != GapFill::Filled)
        .min_by_key(|g| match g.fill {
            GapFill::Unfilled => 0,
            GapFill::Partial => 1,
            GapFill::Filled => 2,
        });

    match best {
        Some(gap) if gap.fill == GapFill::Unfilled => FilterScore {
            name,
            score: weight,
            weight,
            reason: format!("unfilled gap {:.4}-{:.4}", gap.gap_low, gap.gap_high),
        },
        Some(gap) => FilterScore {
            name,
            score: weight / 2.0,
            weight,
            reason: format!("partially filled gap ({:.0}%)", gap.fill_pct),
        },
        None => FilterScore {
            name,
            score: 0.0,
            weight,
            reason: "no aligned open gap".to_string(),
        },
    }
}

/// Clear trend (|r| > 0.6) or clear mean reversion (|r| < 0.3) both score
/// full; the mixed band scores half.
fn autocorrelation_filter(weight: f64, r: f64) -> FilterScore {
    let name = "autocorrelation".to_string();
    let magnitude = r.abs();

    if magnitude > 0.6 {
        FilterScore {
            name,
            score: weight,
            weight,
            reason: format!("trending returns (r={r:.2})"),
        }
    } else if magnitude < 0.3 {
        FilterScore {
            name,
            score: weight,
            weight,
            reason: format!("mean-reverting returns (r={r:.2})"),
        }
    } else {
        FilterScore {
            name,
            score: weight / 2.0,
            weight,
            reason: format!("mixed regime (r={r:.2})"),
        }
    }
}

/// An opposing-side zone beyond the entry gives the trade a structural
/// target. Returns the score plus the target price when present.
fn opposing_zone_filter(
    weight: f64,
    direction: Direction,
    entry: f64,
    zones: &[Zone],
) -> (FilterScore, Option<f64>) {
    let name = "opposing_zone".to_string();

    let target = match direction {
        Direction::Long => zones
            .iter()
            .filter(|z| z.kind == ZoneKind::Supply && z.price_low > entry)
            .map(|z| z.price_low)
            .fold(None::<f64>, |acc, p| Some(acc.map_or(p, |a| a.min(p)))),
        Direction::Short => zones
            .iter()
            .filter(|z| z.kind == ZoneKind::Demand && z.price_high < entry)
            .map(|z| z.price_high)
            .fold(None::<f64>, |acc, p| Some(acc.map_or(p, |a| a.max(p)))),
    };

    let score = match target {
        Some(price) => FilterScore {
            name,
            score: weight,
            weight,
            reason: format!("opposing zone target at {price:.4}"),
        },
        None => FilterScore {
            name,
            score: 0.0,
            weight,
            reason: "no opposing zone target".to_string(),
        },
    };

    (score, target)
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

fn confidence_for(score: f64) -> Confidence {
    if score >= VERY_HIGH_SCORE {
        Confidence::VeryHigh
    } else if score >= HIGH_SCORE {
        Confidence::High
    } else if score >= MEDIUM_SCORE {
        Confidence::Medium
    } else {
        Confidence::Low
    }
}

/// Stop at the protective structure when one exists, otherwise a fixed
/// fallback distance on the adverse side.
fn suggested_stop(direction: Direction, entry: f64, zones: &[Zone]) -> f64 {
    match direction {
        Direction::Long => zones
            .iter()
            .filter(|z| z.kind == ZoneKind::Demand && z.price_low < entry)
            .map(|z| z.price_low)
            .fold(None::<f64>, |acc, p| Some(acc.map_or(p, |a| a.max(p))))
            .unwrap_or(entry * (1.0 - FALLBACK_STOP_PCT / 100.0)),
        Direction::Short => zones
            .iter()
            .filter(|z| z.kind == ZoneKind::Supply && z.price_high > entry)
            .map(|z| z.price_high)
            .fold(None::<f64>, |acc, p| Some(acc.map_or(p, |a| a.min(p))))
            .unwrap_or(entry * (1.0 + FALLBACK_STOP_PCT / 100.0)),
    }
}

/// Evaluate one snapshot against the two-stage model.
pub fn evaluate(config: &DecisionConfig, snapshot: &AnalyticsSnapshot) -> Evaluation {
    let flow = flow_primary(config, snapshot);
    let micro = microstructure_primary(config, snapshot);

    let direction = match (flow.passed, micro.passed, flow.direction, micro.direction) {
        (true, true, Some(a), Some(b)) if a == b => a,
        _ => {
            debug!(
                pair = %snapshot.pair,
                flow = %flow.reason,
                micro = %micro.reason,
                "primary gate rejected"
            );
            return Evaluation {
                primaries: vec![flow, micro],
                filters: Vec::new(),
                confluence: 0.0,
                signal: None,
            };
        }
    };

    let entry = snapshot.last_price;
    let weights = &config.weights;

    let (opposing, target) =
        opposing_zone_filter(weights.opposing_zone, direction, entry, &snapshot.zones);

    let filters = vec![
        zone_filter(weights.zone, direction, entry, &snapshot.zones),
        profile_filter(weights.profile, entry, snapshot),
        reversion_filter(weights.reversion, direction, snapshot.zscore),
        gap_filter(weights.gap, direction, snapshot),
        autocorrelation_filter(weights.autocorrelation, snapshot.autocorrelation_lag1),
        opposing,
    ];

    let confluence: f64 = filters.iter().map(|f| f.score).sum();

    if confluence < config.min_confluence {
        debug!(
            pair = %snapshot.pair,
            confluence,
            min = config.min_confluence,
            "confluence below minimum"
        );
        return Evaluation {
            primaries: vec![flow, micro],
            filters,
            confluence,
            signal: None,
        };
    }

    let signal = TradeSignal {
        pair: snapshot.pair.clone(),
        direction,
        entry_price: entry,
        confluence_score: confluence,
        max_possible_score: weights.max_possible_score(),
        confidence: confidence_for(confluence),
        primary_results: vec![flow.clone(), micro.clone()],
        filter_scores: filters.clone(),
        suggested_stop: suggested_stop(direction, entry, &snapshot.zones),
        suggested_target: target,
        created_at: Utc::now(),
    };

    Evaluation {
        primaries: vec![flow, micro],
        filters,
        confluence,
        signal: Some(signal),
    }
}

// ---------------------------------------------------------------------------
// Reactive component
// ---------------------------------------------------------------------------

struct SignalEvaluator {
    config: DecisionConfig,
    bus: Arc<EventBus>,
}

#[async_trait]
impl EventHandler for SignalEvaluator {
    fn name(&self) -> &'static str {
        HANDLER_NAME
    }

    async fn handle(&self, event: &Event) -> Result<()> {
        let snapshot = match event {
            Event::AnalyticsUpdated { snapshot, .. } => snapshot,
            _ => return Ok(()),
        };

        let evaluation = evaluate(&self.config, snapshot);
        if let Some(signal) = evaluation.signal {
            info!(
                pair = %signal.pair,
                direction = %signal.direction,
                confluence = format!("{:.2}/{:.1}", signal.confluence_score, signal.max_possible_score),
                confidence = %signal.confidence,
                "trade signal generated"
            );
            self.bus
                .publish(Event::TradingSignalGenerated(signal))
                .await;
        }
        Ok(())
    }
}

/// Reactive decision component: installs the evaluator on start, detaches on
/// stop.
pub struct DecisionEngine {
    config: DecisionConfig,
    bus: Arc<EventBus>,
}

impl DecisionEngine {
    pub fn new(config: DecisionConfig, bus: Arc<EventBus>) -> Self {
        Self { config, bus }
    }
}

#[async_trait]
impl Component for DecisionEngine {
    fn name(&self) -> &'static str {
        "decision"
    }

    async fn start(&self) -> Result<()> {
        self.bus.subscribe(
            EventKind::AnalyticsUpdated,
            Arc::new(SignalEvaluator {
                config: self.config.clone(),
                bus: self.bus.clone(),
            }),
        );
        info!(
            min_confluence = self.config.min_confluence,
            max_possible = self.config.weights.max_possible_score(),
            "decision engine started"
        );
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.bus.unsubscribe(HANDLER_NAME);
        info!("decision engine stopped");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        Candle, FairValueGap, MarketProfile, MarketType, OrderFlowStats, PairId, RejectionSignal,
        TimeframeTrends, TrendDirection,
    };

    fn pair() -> PairId {
        PairId::new("binance", MarketType::Spot, "ETHUSDT")
    }

    fn base_snapshot() -> AnalyticsSnapshot {
        AnalyticsSnapshot {
            pair: pair(),
            computed_at: 0,
            last_price: 101.6,
            order_flow: OrderFlowStats {
                cvd: 25.0,
                buy_volume: 35.0,
                sell_volume: 10.0,
                imbalance: Some(3.5),
                net_volume: 25.0,
                large_trades: 0,
            },
            profile: None,
            rejection: RejectionSignal {
                bullish: true,
                bearish: false,
                wick_body_ratio: 2.5,
            },
            latest_candle: Some(Candle {
                open_time: 0,
                open: 100.0,
                high: 102.0,
                low: 96.0,
                close: 101.6,
                volume: 45.0,
                buy_volume: 35.0,
                sell_volume: 10.0,
            }),
            zones: Vec::new(),
            gaps: Vec::new(),
            price_mean_15m: 101.0,
            price_stddev_15m: 1.0,
            zscore: 0.0,
            autocorrelation_lag1: 0.2,
            trends: TimeframeTrends {
                m1: TrendDirection::Up,
                m5: TrendDirection::Up,
                m15: TrendDirection::Up,
                aligned: true,
            },
        }
    }

    fn demand_zone(low: f64, high: f64, state: ZoneState, tests: u32) -> Zone {
        Zone {
            id: 1,
            kind: ZoneKind::Demand,
            price_low: low,
            price_high: high,
            strength: 3.0,
            test_count: tests,
            state,
            created_at: 0,
        }
    }

    fn supply_zone(low: f64, high: f64) -> Zone {
        Zone {
            id: 2,
            kind: ZoneKind::Supply,
            price_low: low,
            price_high: high,
            strength: 3.0,
            test_count: 0,
            state: ZoneState::Fresh,
            created_at: 0,
        }
    }

    #[test]
    fn strong_bullish_setup_scores_full_confluence() {
        let mut snapshot = base_snapshot();
        snapshot.zones = vec![
            demand_zone(99.0, 100.0, ZoneState::Fresh, 0),
            supply_zone(103.5, 104.5),
        ];
        snapshot.profile = Some(MarketProfile {
            timestamp: 0,
            poc: 100.5,
            vah: 103.0,
            val: 100.0,
        });
        snapshot.zscore = -2.1;
        snapshot.gaps = vec![FairValueGap {
            id: 1,
            direction: GapDirection::Bullish,
            gap_low: 98.5,
            gap_high: 99.5,
            fill_pct: 0.0,
            fill: GapFill::Unfilled,
            created_at: 0,
        }];
        snapshot.autocorrelation_lag1 = 0.2;

        let evaluation = evaluate(&DecisionConfig::default(), &snapshot);
        let signal = evaluation.signal.expect("signal expected");

        assert_eq!(signal.direction, Direction::Long);
        assert!((signal.confluence_score - 8.0).abs() < 1e-9, "score {}", signal.confluence_score);
        assert_eq!(signal.confidence, Confidence::VeryHigh);
        assert!((signal.max_possible_score - 8.0).abs() < 1e-9);
        // Structural stop below entry, target at the supply zone.
        assert!(signal.suggested_stop < signal.entry_price);
        assert!((signal.suggested_target.unwrap() - 103.5).abs() < 1e-9);
        assert_eq!(signal.primary_results.len(), 2);
        assert_eq!(signal.filter_scores.len(), 6);
    }

    #[test]
    fn marginal_primaries_with_weak_filters_reject() {
        let mut snapshot = base_snapshot();
        snapshot.order_flow.imbalance = Some(2.6);
        snapshot.rejection.wick_body_ratio = 2.1;
        // Only the autocorrelation filter contributes (+1.0).
        snapshot.zscore = -0.5;

        let evaluation = evaluate(&DecisionConfig::default(), &snapshot);
        assert!(evaluation.signal.is_none());
        assert!((evaluation.confluence - 1.0).abs() < 1e-9);
        // Both primaries passed — rejection came from the confluence floor.
        assert!(evaluation.primaries.iter().all(|p| p.passed));
    }

    #[test]
    fn disagreeing_primaries_exit_before_filters() {
        let mut snapshot = base_snapshot();
        // Flow says long (3.0 buy-dominant), candle shows bearish rejection.
        snapshot.order_flow.imbalance = Some(3.0);
        snapshot.rejection = RejectionSignal {
            bullish: false,
            bearish: true,
            wick_body_ratio: 3.0,
        };

        let evaluation = evaluate(&DecisionConfig::default(), &snapshot);
        assert!(evaluation.signal.is_none());
        assert!(evaluation.filters.is_empty(), "filters must not run");
    }

    #[test]
    fn zero_sell_volume_fails_flow_primary() {
        let mut snapshot = base_snapshot();
        snapshot.order_flow.sell_volume = 0.0;
        snapshot.order_flow.imbalance = None;

        let evaluation = evaluate(&DecisionConfig::default(), &snapshot);
        assert!(evaluation.signal.is_none());
        assert!(evaluation.filters.is_empty());
        let flow = &evaluation.primaries[0];
        assert!(!flow.passed);
        assert!(flow.reason.contains("undefined"));
    }

    #[test]
    fn sell_dominance_yields_short() {
        let mut snapshot = base_snapshot();
        snapshot.order_flow.imbalance = Some(1.0 / 3.0);
        snapshot.rejection = RejectionSignal {
            bullish: false,
            bearish: true,
            wick_body_ratio: 2.5,
        };
        snapshot.zscore = 2.5;
        snapshot.zones = vec![supply_zone(101.6, 102.5)];

        let evaluation = evaluate(&DecisionConfig::default(), &snapshot);
        let signal = evaluation.signal.expect("short signal expected");
        assert_eq!(signal.direction, Direction::Short);
        assert!(signal.suggested_stop > signal.entry_price);
    }

    #[test]
    fn confluence_exactly_at_minimum_is_accepted() {
        let mut snapshot = base_snapshot();
        // zone fresh (+2.0), autocorr mixed (+0.5), opposing target (+0.5).
        snapshot.zones = vec![
            demand_zone(99.0, 100.0, ZoneState::Fresh, 0),
            supply_zone(104.0, 105.0),
        ];
        snapshot.autocorrelation_lag1 = 0.45;
        snapshot.zscore = 0.0;

        let evaluation = evaluate(&DecisionConfig::default(), &snapshot);
        let signal = evaluation.signal.expect("boundary signal expected");
        assert!((signal.confluence_score - 3.0).abs() < 1e-9);
        assert_eq!(signal.confidence, Confidence::Low);
    }

    #[test]
    fn tested_zone_scores_partial_credit() {
        let mut snapshot = base_snapshot();
        snapshot.zones = vec![demand_zone(99.0, 100.0, ZoneState::Tested, 2)];

        let evaluation = evaluate(&DecisionConfig::default(), &snapshot);
        let zone_score = evaluation
            .filters
            .iter()
            .find(|f| f.name == "zone")
            .unwrap();
        assert!((zone_score.score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn inside_value_area_scores_partial() {
        let mut snapshot = base_snapshot();
        snapshot.profile = Some(MarketProfile {
            timestamp: 0,
            poc: 101.0,
            vah: 110.0,
            val: 95.0,
        });

        let evaluation = evaluate(&DecisionConfig::default(), &snapshot);
        let profile_score = evaluation
            .filters
            .iter()
            .find(|f| f.name == "market_profile")
            .unwrap();
        assert!((profile_score.score - 0.5).abs() < 1e-9);
    }

    #[test]
    fn partial_gap_scores_half() {
        let mut snapshot = base_snapshot();
        snapshot.gaps = vec![FairValueGap {
            id: 1,
            direction: GapDirection::Bullish,
            gap_low: 98.5,
            gap_high: 99.5,
            fill_pct: 40.0,
            fill: GapFill::Partial,
            created_at: 0,
        }];

        let evaluation = evaluate(&DecisionConfig::default(), &snapshot);
        let gap_score = evaluation
            .filters
            .iter()
            .find(|f| f.name == "fair_value_gap")
            .unwrap();
        assert!((gap_score.score - 0.75).abs() < 1e-9);
    }

    #[test]
    fn moderate_deviation_scores_half_reversion() {
        let mut snapshot = base_snapshot();
        snapshot.zscore = -1.2;

        let evaluation = evaluate(&DecisionConfig::default(), &snapshot);
        let score = evaluation
            .filters
            .iter()
            .find(|f| f.name == "mean_reversion")
            .unwrap();
        assert!((score.score - 0.75).abs() < 1e-9);
    }

    #[test]
    fn trending_autocorrelation_scores_full() {
        let mut snapshot = base_snapshot();
        snapshot.autocorrelation_lag1 = 0.75;

        let evaluation = evaluate(&DecisionConfig::default(), &snapshot);
        let score = evaluation
            .filters
            .iter()
            .find(|f| f.name == "autocorrelation")
            .unwrap();
        assert!((score.score - 1.0).abs() < 1e-9);
    }
}
