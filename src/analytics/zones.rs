// =============================================================================
// Supply/Demand Zone Analyzer — base-then-thrust detection and lifecycle
// =============================================================================
//
// A zone is born when a narrow base candle is followed by a thrust candle
// whose body dwarfs the base range. The base's price span becomes the zone.
//
// Lifecycle: FRESH until price first trades back into the zone, TESTED for
// the first two touches, BROKEN on a third touch or on any close through the
// far side of the zone.
// =============================================================================

use crate::types::{Candle, Zone, ZoneKind, ZoneState};

/// Thrust body must be at least this multiple of the base range.
const THRUST_FACTOR: f64 = 2.0;
/// Touches beyond this count invalidate the zone.
const MAX_TESTS: u32 = 2;

/// Detect new zones over consecutive candle pairs. Returned zones carry
/// `id = 0`; the caller persists them and receives real row ids.
pub fn detect(candles: &[Candle]) -> Vec<Zone> {
    let mut zones = Vec::new();

    for window in candles.windows(2) {
        let base = &window[0];
        let thrust = &window[1];

        let base_width = base.range();
        if base_width <= 0.0 {
            continue;
        }

        let magnitude = thrust.body();
        let strength = magnitude / base_width;
        if strength < THRUST_FACTOR {
            continue;
        }

        let kind = if thrust.is_bullish() {
            ZoneKind::Demand
        } else if thrust.close < thrust.open {
            ZoneKind::Supply
        } else {
            continue;
        };

        zones.push(Zone {
            id: 0,
            kind,
            price_low: base.low,
            price_high: base.high,
            strength,
            test_count: 0,
            state: ZoneState::Fresh,
            created_at: thrust.open_time,
        });
    }

    zones
}

/// Whether a candidate zone overlaps an existing active zone of the same
/// kind. Used to avoid stacking duplicates on every sweep.
pub fn overlaps(candidate: &Zone, existing: &Zone) -> bool {
    candidate.kind == existing.kind
        && candidate.price_low <= existing.price_high
        && candidate.price_high >= existing.price_low
}

/// Apply one later candle to an active zone. Returns the new
/// `(test_count, state)` when the candle changes the zone, `None` otherwise.
pub fn apply_candle(zone: &Zone, candle: &Candle) -> Option<(u32, ZoneState)> {
    match zone.kind {
        ZoneKind::Demand => {
            // Close below the zone invalidates it outright.
            if candle.close < zone.price_low {
                return Some((zone.test_count, ZoneState::Broken));
            }
            // A dip into the zone without a close-through is a test.
            if candle.low <= zone.price_high {
                let tests = zone.test_count + 1;
                let state = if tests > MAX_TESTS {
                    ZoneState::Broken
                } else {
                    ZoneState::Tested
                };
                return Some((tests, state));
            }
        }
        ZoneKind::Supply => {
            if candle.close > zone.price_high {
                return Some((zone.test_count, ZoneState::Broken));
            }
            if candle.high >= zone.price_low {
                let tests = zone.test_count + 1;
                let state = if tests > MAX_TESTS {
                    ZoneState::Broken
                } else {
                    ZoneState::Tested
                };
                return Some((tests, state));
            }
        }
    }
    None
}

// =============================================================================
// Tests
// =============================================================================
