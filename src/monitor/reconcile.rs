// =============================================================================
// Startup Reconciliation — the venue is the source of truth
// =============================================================================
//
// Before the monitor reacts to any live event, local position state is
// brought into agreement with every configured venue:
//
//   missing_local     — the venue holds a position we do not know: create it.
//   missing_exchange  — we hold a position the venue does not: close it
//                       locally with RECONCILED_MISSING.
//   quantity/price    — both sides know the position but disagree: overwrite
//                       local with the venue's values.
//
// Re-running against an already-consistent book makes no writes and reports
// nothing to emit.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::execution::VenueAdapter;
use crate::monitor::book::PositionBook;
use crate::types::{
    AssetClass, ExitReason, PairId, Position, PositionSource, PositionState,
};

/// Relative tolerance for quantity/price agreement.
const MATCH_EPSILON: f64 = 1e-9;

/// What a reconciliation pass changed. The monitor emits `PositionOpened`
/// for `created` and `PositionClosed` for `closed`; adjustments are silent.
#[derive(Debug, Default)]
pub struct ReconcileSummary {
    pub created: Vec<Position>,
    pub closed: Vec<Position>,
    pub adjusted: usize,
}

impl ReconcileSummary {
    pub fn is_noop(&self) -> bool {
        self.created.is_empty() && self.closed.is_empty() && self.adjusted == 0
    }
}

fn trailing_pct_for(config: &EngineConfig, class: AssetClass) -> f64 {
    let pct = config.trailing_pct(class);
    if class == AssetClass::Meme {
        pct.clamp(15.0, 20.0)
    } else {
        pct
    }
}

/// Reconcile the book against every venue. Each venue fetch is bounded by
/// the configured timeout; a venue that fails to answer is skipped with a
/// warning and its local positions are left untouched.
pub async fn run(
    book: &PositionBook,
    venues: &HashMap<String, Arc<dyn VenueAdapter>>,
    config: &EngineConfig,
) -> ReconcileSummary {
    let mut summary = ReconcileSummary::default();
    let timeout = Duration::from_secs(config.reconciliation.timeout_s.max(1));

    for (venue_name, venue) in venues {
        let fetched = match tokio::time::timeout(timeout, venue.get_positions()).await {
            Ok(Ok(positions)) => positions,
            Ok(Err(e)) => {
                warn!(venue = %venue_name, error = %e, "reconciliation fetch failed — skipping venue");
                continue;
            }
            Err(_) => {
                warn!(venue = %venue_name, timeout_s = timeout.as_secs(), "reconciliation fetch timed out — skipping venue");
                continue;
            }
        };

        let local: Vec<Position> = book
            .open_snapshots()
            .into_iter()
            .filter(|p| p.pair.venue == *venue_name)
            .collect();

        // missing_exchange: local positions the venue no longer has.
        for position in &local {
            let on_venue = fetched.iter().any(|v| {
                v.symbol == position.pair.symbol && v.direction == position.direction
            });
            if !on_venue {
                if let Some(closed) =
                    book.close_local(&position.id, ExitReason::ReconciledMissing)
                {
                    info!(
                        id = %closed.id,
                        pair = %closed.pair,
                        "reconciliation: closed position missing on exchange"
                    );
                    summary.closed.push(closed);
                }
            }
        }

        for venue_position in &fetched {
            let matched = local.iter().find(|p| {
                p.pair.symbol == venue_position.symbol
                    && p.direction == venue_position.direction
            });

            match matched {
                None => {
                    // missing_local: adopt the venue's position.
                    let pair = PairId::new(
                        venue_name.clone(),
                        venue_position.market_type,
                        venue_position.symbol.clone(),
                    );
                    let class = config
                        .symbol(&venue_position.symbol)
                        .map(|s| s.asset_class)
                        .unwrap_or(AssetClass::Regular);

                    let position = Position {
                        id: Uuid::new_v4().to_string(),
                        pair,
                        direction: venue_position.direction,
                        entry_price: venue_position.entry_price,
                        quantity: venue_position.quantity,
                        entry_time: Utc::now(),
                        asset_class: class,
                        source: PositionSource::Reconciled,
                        trailing_distance_pct: trailing_pct_for(config, class),
                        trailing_stop_price: None,
                        highest_mark: None,
                        lowest_mark: None,
                        mark_price: venue_position.entry_price,
                        unrealized_pnl: 0.0,
                        unrealized_pnl_pct: 0.0,
                        state: PositionState::Open,
                        exit_reason: None,
                        realized_pnl: None,
                    };
                    info!(
                        id = %position.id,
                        pair = %position.pair,
                        quantity = position.quantity,
                        "reconciliation: adopted position from exchange"
                    );
                    book.adopt(position.clone());
                    summary.created.push(position);
                }
                Some(local_position) => {
                    let qty_mismatch = (local_position.quantity - venue_position.quantity).abs()
                        > MATCH_EPSILON * venue_position.quantity.abs().max(1.0);
                    let price_mismatch = (local_position.entry_price
                        - venue_position.entry_price)
                        .abs()
                        > MATCH_EPSILON * venue_position.entry_price.abs().max(1.0);

                    if qty_mismatch || price_mismatch {
                        if let Some(handle) = book.get(&local_position.id) {
                            let mut position = handle.lock();
                            info!(
                                id = %position.id,
                                local_qty = position.quantity,
                                venue_qty = venue_position.quantity,
                                local_entry = position.entry_price,
                                venue_entry = venue_position.entry_price,
                                "reconciliation: overwriting local with exchange values"
                            );
                            position.quantity = venue_position.quantity;
                            position.entry_price = venue_position.entry_price;
                            summary.adjusted += 1;
                        }
                    }
                }
            }
        }
    }

    info!(
        created = summary.created.len(),
        closed = summary.closed.len(),
        adjusted = summary.adjusted,
        "startup reconciliation complete"
    );
    summary
}

// =============================================================================
// Tests
// =============================================================================
