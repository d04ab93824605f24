// =============================================================================
// Trailing Stops — mark tracking with a monotone ratchet
// =============================================================================
//
// For a long the stop trails the highest mark by the position's trailing
// distance and only ever moves up; shorts mirror. The stop can therefore
// never move against the position, and tightening the distance can only
// advance the stop further in the protective direction.
// =============================================================================

use crate::types::{Direction, Position};

/// Fold one price into the position's marks and trailing stop. Returns
/// `true` when the stop is hit and the position should close.
pub fn update_mark(position: &mut Position, price: f64) -> bool {
    position.mark_price = price;

    let sign = position.direction.sign();
    position.unrealized_pnl = sign * (price - position.entry_price) * position.quantity;
    position.unrealized_pnl_pct = if position.entry_price > 0.0 {
        sign * (price - position.entry_price) / position.entry_price * 100.0
    } else {
        0.0
    };

    let distance = position.trailing_distance_pct / 100.0;

    match position.direction {
        Direction::Long => {
            let highest = position.highest_mark.map_or(price, |h| h.max(price));
            position.highest_mark = Some(highest);

            let candidate = highest * (1.0 - distance);
            let stop = match position.trailing_stop_price {
                Some(existing) => existing.max(candidate),
                None => candidate,
            };
            position.trailing_stop_price = Some(stop);

            price <= stop
        }
        Direction::Short => {
            let lowest = position.lowest_mark.map_or(price, |l| l.min(price));
            position.lowest_mark = Some(lowest);

            let candidate = lowest * (1.0 + distance);
            let stop = match position.trailing_stop_price {
                Some(existing) => existing.min(candidate),
                None => candidate,
            };
            position.trailing_stop_price = Some(stop);

            price >= stop
        }
    }
}

/// Tighten the trailing distance (never widen) and advance the stop off the
/// best mark seen so far. The ratchet still applies: the stop only moves in
/// the protective direction.
pub fn tighten(position: &mut Position, new_distance_pct: f64) {
    if new_distance_pct >= position.trailing_distance_pct {
        return;
    }
    position.trailing_distance_pct = new_distance_pct;
    let distance = new_distance_pct / 100.0;

    match position.direction {
        Direction::Long => {
            if let Some(highest) = position.highest_mark {
                let candidate = highest * (1.0 - distance);
                let stop = position
                    .trailing_stop_price
                    .map_or(candidate, |s| s.max(candidate));
                position.trailing_stop_price = Some(stop);
            }
        }
        Direction::Short => {
            if let Some(lowest) = position.lowest_mark {
                let candidate = lowest * (1.0 + distance);
                let stop = position
                    .trailing_stop_price
                    .map_or(candidate, |s| s.min(candidate));
                position.trailing_stop_price = Some(stop);
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AssetClass, MarketType, PairId, PositionSource, PositionState};
    use chrono::Utc;

    fn long(entry: f64, trailing_pct: f64) -> Position {
        Position {
            id: "p1".into(),
            pair: PairId::new("paper", MarketType::Spot, "ETHUSDT"),
            direction: Direction::Long,
            entry_price: entry,
            quantity: 1.0,
            entry_time: Utc::now(),
            asset_class: AssetClass::Regular,
            source: PositionSource::Execution,
            trailing_distance_pct: trailing_pct,
            trailing_stop_price: None,
            highest_mark: None,
            lowest_mark: None,
            mark_price: entry,
            unrealized_pnl: 0.0,
            unrealized_pnl_pct: 0.0,
            state: PositionState::Open,
            exit_reason: None,
            realized_pnl: None,
        }
    }

    fn short(entry: f64, trailing_pct: f64) -> Position {
        let mut p = long(entry, trailing_pct);
        p.direction = Direction::Short;
        p
    }

    #[test]
    fn long_stop_follows_highest_mark_and_triggers() {
        // Entry 3000 with a 0.5% trail; the 3020 high puts the stop at
        // 3004.9, and 2999 trips it.
        let mut p = long(3000.0, 0.5);

        assert!(!update_mark(&mut p, 3000.0));
        assert!(!update_mark(&mut p, 3020.0));
        assert!((p.highest_mark.unwrap() - 3020.0).abs() < 1e-9);
        assert!((p.trailing_stop_price.unwrap() - 3004.9).abs() < 1e-9);

        assert!(!update_mark(&mut p, 3015.0));
        assert!(!update_mark(&mut p, 3010.0));
        // The stop never slipped back.
        assert!((p.trailing_stop_price.unwrap() - 3004.9).abs() < 1e-9);

        assert!(update_mark(&mut p, 2999.0));
        assert!((p.unrealized_pnl - (-1.0)).abs() < 1e-9);
    }

    #[test]
    fn long_stop_is_monotone_non_decreasing() {
        let mut p = long(100.0, 1.0);
        let mut last_stop = f64::MIN;
        for price in [100.0, 101.0, 100.4, 102.0, 101.1, 103.0, 102.2] {
            update_mark(&mut p, price);
            let stop = p.trailing_stop_price.unwrap();
            assert!(stop >= last_stop, "stop {stop} regressed below {last_stop}");
            last_stop = stop;
        }
    }

    #[test]
    fn short_stop_mirrors() {
        let mut p = short(3000.0, 0.5);

        assert!(!update_mark(&mut p, 3000.0));
        assert!(!update_mark(&mut p, 2950.0));
        assert!((p.lowest_mark.unwrap() - 2950.0).abs() < 1e-9);
        // Stop = 2950 * 1.005 = 2964.75.
        assert!((p.trailing_stop_price.unwrap() - 2964.75).abs() < 1e-9);

        // Rally through the stop closes the short.
        assert!(update_mark(&mut p, 2970.0));
    }

    #[test]
    fn short_stop_is_monotone_non_increasing() {
        let mut p = short(100.0, 1.0);
        let mut last_stop = f64::MAX;
        for price in [100.0, 99.0, 99.5, 98.0, 98.8, 97.0] {
            update_mark(&mut p, price);
            let stop = p.trailing_stop_price.unwrap();
            assert!(stop <= last_stop, "stop {stop} regressed above {last_stop}");
            last_stop = stop;
        }
    }

    #[test]
    fn stop_stays_on_the_protective_side_of_the_best_mark() {
        let mut p = long(100.0, 0.5);
        for price in [100.0, 101.0, 102.0, 101.5] {
            update_mark(&mut p, price);
            let stop = p.trailing_stop_price.unwrap();
            assert!(
                stop < p.highest_mark.unwrap(),
                "long stop {stop} must stay below the best mark"
            );
        }
    }

    #[test]
    fn tighten_advances_but_never_widens() {
        let mut p = long(3000.0, 0.5);
        update_mark(&mut p, 3020.0);
        let loose_stop = p.trailing_stop_price.unwrap();

        tighten(&mut p, 0.3);
        let tight_stop = p.trailing_stop_price.unwrap();
        assert!(tight_stop > loose_stop);
        assert!((tight_stop - 3020.0 * 0.997).abs() < 1e-9);

        // Widening is refused.
        tighten(&mut p, 5.0);
        assert!((p.trailing_distance_pct - 0.3).abs() < f64::EPSILON);
        assert!((p.trailing_stop_price.unwrap() - tight_stop).abs() < 1e-9);
    }

    #[test]
    fn unrealized_pnl_tracks_marks() {
        let mut p = long(100.0, 1.0);
        p.quantity = 2.0;
        update_mark(&mut p, 105.0);
        assert!((p.unrealized_pnl - 10.0).abs() < 1e-9);
        assert!((p.unrealized_pnl_pct - 5.0).abs() < 1e-9);

        let mut s = short(100.0, 1.0);
        s.quantity = 2.0;
        update_mark(&mut s, 105.0);
        assert!((s.unrealized_pnl - (-10.0)).abs() < 1e-9);
    }
}
