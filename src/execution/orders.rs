// =============================================================================
// Order Manager — live order tracking with a forward-only state machine
// =============================================================================
//
// The execution engine is the sole writer of order state. Orders are keyed by
// client id; submission is idempotent per client id, so replaying a validated
// signal with the same id cannot double-place. Terminal orders move to a
// bounded ring of recently closed orders.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use anyhow::{bail, Result};
use chrono::Utc;
use parking_lot::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::types::{Direction, Order, OrderState, OrderType, PairId};

/// Closed orders retained for audit queries.
const MAX_CLOSED: usize = 1000;

pub struct OrderManager {
    live: RwLock<HashMap<String, Order>>,
    closed: RwLock<VecDeque<Order>>,
}

impl OrderManager {
    pub fn new() -> Self {
        Self {
            live: RwLock::new(HashMap::new()),
            closed: RwLock::new(VecDeque::new()),
        }
    }

    /// Build a fresh Pending order.
    pub fn build_order(
        pair: PairId,
        direction: Direction,
        order_type: OrderType,
        quantity: f64,
        limit_price: Option<f64>,
        stop_price: Option<f64>,
        client_id: String,
    ) -> Order {
        let now = Utc::now();
        Order {
            id: Uuid::new_v4().to_string(),
            client_id,
            venue_order_id: None,
            pair,
            direction,
            order_type,
            quantity,
            limit_price,
            stop_price,
            state: OrderState::Pending,
            filled_qty: 0.0,
            avg_fill_price: 0.0,
            created_at: now,
            updated_at: now,
            retry_count: 0,
            last_error: None,
        }
    }

    /// Register a new order. Returns `false` when the client id is already
    /// known (live or recently closed) — the caller must not place again.
    pub fn register(&self, order: Order) -> bool {
        if self.contains(&order.client_id) {
            debug!(client_id = %order.client_id, "duplicate client id — order not registered");
            return false;
        }
        self.live.write().insert(order.client_id.clone(), order);
        true
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.live.read().contains_key(client_id)
            || self.closed.read().iter().any(|o| o.client_id == client_id)
    }

    pub fn get(&self, client_id: &str) -> Option<Order> {
        self.live
            .read()
            .get(client_id)
            .cloned()
            .or_else(|| {
                self.closed
                    .read()
                    .iter()
                    .find(|o| o.client_id == client_id)
                    .cloned()
            })
    }

    pub fn live_count(&self) -> usize {
        self.live.read().len()
    }

    /// Most recent closed orders, newest first.
    pub fn closed_orders(&self, count: usize) -> Vec<Order> {
        self.closed.read().iter().rev().take(count).cloned().collect()
    }

    /// Attach the venue-assigned id after submission.
    pub fn set_venue_order_id(&self, client_id: &str, venue_order_id: &str) {
        if let Some(order) = self.live.write().get_mut(client_id) {
            order.venue_order_id = Some(venue_order_id.to_string());
            order.updated_at = Utc::now();
        }
    }

    /// Record a retry attempt with its error.
    pub fn record_retry(&self, client_id: &str, error: &str) {
        if let Some(order) = self.live.write().get_mut(client_id) {
            order.retry_count += 1;
            order.last_error = Some(error.to_string());
            order.updated_at = Utc::now();
        }
    }

    /// Advance an order along the state machine. Fill data applies on
    /// `Partial` and `Filled`. Terminal orders move to the closed ring.
    pub fn transition(
        &self,
        client_id: &str,
        next: OrderState,
        filled_qty: Option<f64>,
        avg_fill_price: Option<f64>,
    ) -> Result<Order> {
        let mut live = self.live.write();

        let order = match live.get_mut(client_id) {
            Some(order) => order,
            None => bail!("unknown order {client_id}"),
        };

        if !order.state.can_transition(next) {
            bail!(
                "illegal order transition {} -> {} for {}",
                order.state,
                next,
                client_id
            );
        }

        order.state = next;
        order.updated_at = Utc::now();
        if let Some(qty) = filled_qty {
            order.filled_qty = qty;
        }
        if let Some(price) = avg_fill_price {
            order.avg_fill_price = price;
        }

        let snapshot = order.clone();

        if next.is_terminal() {
            let order = live.remove(client_id);
            drop(live);
            if let Some(order) = order {
                info!(
                    client_id = %order.client_id,
                    state = %order.state,
                    filled_qty = order.filled_qty,
                    avg_fill_price = order.avg_fill_price,
                    "order reached terminal state"
                );
                let mut closed = self.closed.write();
                closed.push_back(order);
                while closed.len() > MAX_CLOSED {
                    closed.pop_front();
                }
            }
        }

        Ok(snapshot)
    }
}

impl Default for OrderManager {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
