// =============================================================================
// Position Book — the monitor's authoritative position store
// =============================================================================
//
// Positions are owned by the monitor from `PositionOpened` onward; every
// mutation happens here under the per-position lock. There is no global
// write lock: the outer map is only locked briefly for lookup or insert.
//
// A close is a two-phase affair: `begin_close` flips the position to CLOSING
// and registers the close order's client id; `finalize_close` matches the
// confirmation fill and produces the terminal CLOSED snapshot. A closed
// position is never reopened.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::types::{Direction, ExitReason, PairId, Position, PositionState};

/// Closed positions retained in memory for diagnostics.
const MAX_CLOSED: usize = 500;

/// Everything execution needs to drive a market close.
#[derive(Debug, Clone)]
pub struct CloseIntent {
    pub position_id: String,
    pub close_client_id: String,
    pub pair: PairId,
    pub direction: Direction,
    pub quantity: f64,
    pub reason: ExitReason,
}

struct PendingClose {
    position_id: String,
    reason: ExitReason,
}

pub struct PositionBook {
    positions: RwLock<HashMap<String, Arc<Mutex<Position>>>>,
    closed: RwLock<VecDeque<Position>>,
    pending_closes: Mutex<HashMap<String, PendingClose>>,
}

impl PositionBook {
    pub fn new() -> Self {
        Self {
            positions: RwLock::new(HashMap::new()),
            closed: RwLock::new(VecDeque::new()),
            pending_closes: Mutex::new(HashMap::new()),
        }
    }

    /// Take ownership of a position. Re-adoption of a known id is a no-op
    /// (reconciliation republished events are harmless).
    pub fn adopt(&self, position: Position) {
        let mut positions = self.positions.write();
        if positions.contains_key(&position.id) {
            debug!(id = %position.id, "position already adopted");
            return;
        }
        info!(
            id = %position.id,
            pair = %position.pair,
            direction = %position.direction,
            entry_price = position.entry_price,
            quantity = position.quantity,
            trailing_pct = position.trailing_distance_pct,
            "position adopted"
        );
        positions.insert(position.id.clone(), Arc::new(Mutex::new(position)));
    }

    pub fn get(&self, id: &str) -> Option<Arc<Mutex<Position>>> {
        self.positions.read().get(id).cloned()
    }

    /// Handles for every position on `symbol`.
    pub fn for_symbol(&self, symbol: &str) -> Vec<Arc<Mutex<Position>>> {
        self.positions
            .read()
            .values()
            .filter(|p| p.lock().pair.symbol == symbol)
            .cloned()
            .collect()
    }

    /// Snapshots of every position still open (OPEN or CLOSING).
    pub fn open_snapshots(&self) -> Vec<Position> {
        self.positions
            .read()
            .values()
            .map(|p| p.lock().clone())
            .filter(|p| matches!(p.state, PositionState::Open | PositionState::Closing))
            .collect()
    }

    pub fn open_count(&self) -> usize {
        self.positions
            .read()
            .values()
            .filter(|p| {
                matches!(
                    p.lock().state,
                    PositionState::Open | PositionState::Closing
                )
            })
            .count()
    }

    /// Recently closed positions, newest first.
    pub fn closed_snapshots(&self, count: usize) -> Vec<Position> {
        self.closed.read().iter().rev().take(count).cloned().collect()
    }

    /// Phase one of a close: flip OPEN -> CLOSING and register the close
    /// order's client id. Returns `None` when the position is not open (a
    /// close is already in flight, or it is gone).
    pub fn begin_close(&self, position_id: &str, reason: ExitReason) -> Option<CloseIntent> {
        let handle = self.get(position_id)?;
        let mut position = handle.lock();

        if position.state != PositionState::Open {
            return None;
        }
        position.state = PositionState::Closing;

        let close_client_id = format!("close-{}", Uuid::new_v4());
        self.pending_closes.lock().insert(
            close_client_id.clone(),
            PendingClose {
                position_id: position_id.to_string(),
                reason,
            },
        );

        info!(
            id = %position_id,
            reason = %reason,
            close_client_id = %close_client_id,
            "close initiated"
        );

        Some(CloseIntent {
            position_id: position_id.to_string(),
            close_client_id,
            pair: position.pair.clone(),
            direction: position.direction,
            quantity: position.quantity,
            reason,
        })
    }

    /// Whether `client_id` belongs to a close this book initiated.
    pub fn is_pending_close(&self, client_id: &str) -> bool {
        self.pending_closes.lock().contains_key(client_id)
    }

    /// Phase two: match the confirmation fill, compute realized PnL, move the
    /// position to CLOSED, and return the terminal snapshot.
    pub fn finalize_close(&self, close_client_id: &str, fill_price: f64) -> Option<Position> {
        let pending = self.pending_closes.lock().remove(close_client_id)?;

        let handle = self.positions.write().remove(&pending.position_id)?;
        let mut position = handle.lock();

        let realized = position.direction.sign()
            * (fill_price - position.entry_price)
            * position.quantity;

        position.state = PositionState::Closed;
        position.exit_reason = Some(pending.reason);
        position.realized_pnl = Some(realized);
        position.mark_price = fill_price;
        position.unrealized_pnl = 0.0;
        position.unrealized_pnl_pct = 0.0;

        let snapshot = position.clone();
        drop(position);

        info!(
            id = %snapshot.id,
            exit_reason = %pending.reason,
            fill_price,
            realized_pnl = realized,
            "position closed"
        );

        let mut closed = self.closed.write();
        closed.push_back(snapshot.clone());
        while closed.len() > MAX_CLOSED {
            closed.pop_front();
        }

        Some(snapshot)
    }

    /// A close order failed: put the position back in play so the trailing
    /// stop or a risk policy can retry.
    pub fn abort_close(&self, close_client_id: &str) {
        let pending = self.pending_closes.lock().remove(close_client_id);
        if let Some(pending) = pending {
            if let Some(handle) = self.get(&pending.position_id) {
                let mut position = handle.lock();
                if position.state == PositionState::Closing {
                    position.state = PositionState::Open;
                    warn!(
                        id = %pending.position_id,
                        "close order failed — position reopened for retry"
                    );
                }
            }
        }
    }

    /// Close a position locally without a venue round-trip. Used by startup
    /// reconciliation when the exchange no longer has the position; realized
    /// PnL settles at the last known mark.
    pub fn close_local(&self, position_id: &str, reason: ExitReason) -> Option<Position> {
        let handle = self.positions.write().remove(position_id)?;
        let mut position = handle.lock();

        let realized = position.direction.sign()
            * (position.mark_price - position.entry_price)
            * position.quantity;

        position.state = PositionState::Closed;
        position.exit_reason = Some(reason);
        position.realized_pnl = Some(realized);

        let snapshot = position.clone();
        drop(position);

        let mut closed = self.closed.write();
        closed.push_back(snapshot.clone());
        while closed.len() > MAX_CLOSED {
            closed.pop_front();
        }

        Some(snapshot)
    }
}

impl Default for PositionBook {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
