// =============================================================================
// Venue Adapter — the exchange contract and its error taxonomy
// =============================================================================
//
// Concrete REST/RPC adapters live outside the core. The engine depends only
// on this trait and on the finite error taxonomy below; every venue error an
// adapter can produce must be mapped into one of these variants before it
// reaches the pipeline.
//
// The built-in `PaperVenue` fills orders instantly against a settable mark
// price. It backs demo mode and the execution tests, which script failures
// and fill sequences through it.
// =============================================================================

use std::collections::HashMap;
use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use uuid::Uuid;

use crate::types::{Direction, MarketType, OrderState, OrderType, PairId};

// ---------------------------------------------------------------------------
// Error taxonomy
// ---------------------------------------------------------------------------

/// Every failure a venue adapter may surface.
#[derive(Debug, Clone, Error)]
pub enum VenueError {
    #[error("rate limited")]
    RateLimit { retry_after: Option<Duration> },
    #[error("insufficient balance")]
    InsufficientBalance,
    #[error("order not found: {0}")]
    OrderNotFound(String),
    #[error("invalid order: {0}")]
    InvalidOrder(String),
    #[error("transient venue error: {0}")]
    Transient(String),
    #[error("permanent venue error: {0}")]
    Permanent(String),
}

impl VenueError {
    /// Rate limits and transient faults are worth retrying; everything else
    /// fails the order outright.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::RateLimit { .. } | Self::Transient(_))
    }

    /// Suggested wait before the next attempt, when the venue provided one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimit { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Stable category string used in `OrderFailed` reasons.
    pub fn category(&self) -> &'static str {
        match self {
            Self::RateLimit { .. } => "rate_limit",
            Self::InsufficientBalance => "insufficient_balance",
            Self::OrderNotFound(_) => "order_not_found",
            Self::InvalidOrder(_) => "invalid_order",
            Self::Transient(_) => "transient",
            Self::Permanent(_) => "permanent",
        }
    }
}

// ---------------------------------------------------------------------------
// Contract types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub pair: PairId,
    pub direction: Direction,
    pub order_type: OrderType,
    pub quantity: f64,
    pub limit_price: Option<f64>,
    /// Client-assigned id; venues echo it so fills can be matched.
    pub client_id: String,
}

#[derive(Debug, Clone)]
pub struct OrderAck {
    pub venue_order_id: String,
}

/// Fill status as reported by the venue.
#[derive(Debug, Clone)]
pub struct OrderStatus {
    pub venue_order_id: String,
    pub state: OrderState,
    pub filled_qty: f64,
    pub avg_fill_price: f64,
}

/// An authoritative position as reported by the venue.
#[derive(Debug, Clone)]
pub struct VenuePosition {
    pub symbol: String,
    pub market_type: MarketType,
    pub direction: Direction,
    pub entry_price: f64,
    pub quantity: f64,
}

#[derive(Debug, Clone)]
pub struct SymbolInfo {
    pub min_qty: f64,
    pub qty_step: f64,
    pub price_step: f64,
}

// ---------------------------------------------------------------------------
// The adapter trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait VenueAdapter: Send + Sync {
    fn name(&self) -> &str;

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck, VenueError>;
    async fn cancel_order(&self, pair: &PairId, venue_order_id: &str) -> Result<(), VenueError>;
    async fn get_order(&self, pair: &PairId, venue_order_id: &str)
        -> Result<OrderStatus, VenueError>;
    async fn get_balance(&self, asset: &str) -> Result<f64, VenueError>;
    async fn get_positions(&self) -> Result<Vec<VenuePosition>, VenueError>;
    async fn get_ticker(&self, pair: &PairId) -> Result<f64, VenueError>;
    async fn get_symbol_info(&self, pair: &PairId) -> Result<SymbolInfo, VenueError>;
}

// ---------------------------------------------------------------------------
// PaperVenue
// ---------------------------------------------------------------------------

struct PaperState {
    marks: HashMap<String, f64>,
    orders: HashMap<String, OrderStatus>,
    positions: Vec<VenuePosition>,
    /// Errors returned by the next `place_order` calls, front first.
    place_failures: VecDeque<VenueError>,
    /// Statuses returned by the next `get_order` calls, front first. When
    /// empty, the stored (instantly filled) status is returned.
    status_script: VecDeque<OrderStatus>,
}

/// In-process venue with instant fills. Used by demo mode and tests.
pub struct PaperVenue {
    name: String,
    state: Mutex<PaperState>,
}

impl PaperVenue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(PaperState {
                marks: HashMap::new(),
                orders: HashMap::new(),
                positions: Vec::new(),
                place_failures: VecDeque::new(),
                status_script: VecDeque::new(),
            }),
        }
    }

    /// Set the mark price market orders fill at.
    pub fn set_mark(&self, symbol: &str, price: f64) {
        self.state.lock().marks.insert(symbol.to_string(), price);
    }

    /// Seed an authoritative venue position (reconciliation tests).
    pub fn seed_position(&self, position: VenuePosition) {
        self.state.lock().positions.push(position);
    }

    /// Queue an error for the next `place_order` call.
    pub fn fail_next_place(&self, error: VenueError) {
        self.state.lock().place_failures.push_back(error);
    }

    /// Queue a status for the next `get_order` call.
    pub fn script_status(&self, status: OrderStatus) {
        self.state.lock().status_script.push_back(status);
    }
}

#[async_trait]
impl VenueAdapter for PaperVenue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck, VenueError> {
        let mut state = self.state.lock();

        if let Some(error) = state.place_failures.pop_front() {
            return Err(error);
        }

        let fill_price = request
            .limit_price
            .or_else(|| state.marks.get(&request.pair.symbol).copied())
            .ok_or_else(|| {
                VenueError::InvalidOrder(format!("no mark price for {}", request.pair.symbol))
            })?;

        let venue_order_id = Uuid::new_v4().to_string();
        state.orders.insert(
            venue_order_id.clone(),
            OrderStatus {
                venue_order_id: venue_order_id.clone(),
                state: OrderState::Filled,
                filled_qty: request.quantity,
                avg_fill_price: fill_price,
            },
        );

        Ok(OrderAck { venue_order_id })
    }

    async fn cancel_order(&self, _pair: &PairId, venue_order_id: &str) -> Result<(), VenueError> {
        let mut state = self.state.lock();
        match state.orders.get_mut(venue_order_id) {
            Some(status) if !status.state.is_terminal() => {
                status.state = OrderState::Cancelled;
                Ok(())
            }
            Some(_) => Ok(()),
            None => Err(VenueError::OrderNotFound(venue_order_id.to_string())),
        }
    }

    async fn get_order(
        &self,
        _pair: &PairId,
        venue_order_id: &str,
    ) -> Result<OrderStatus, VenueError> {
        let mut state = self.state.lock();

        if let Some(scripted) = state.status_script.pop_front() {
            return Ok(scripted);
        }

        state
            .orders
            .get(venue_order_id)
            .cloned()
            .ok_or_else(|| VenueError::OrderNotFound(venue_order_id.to_string()))
    }

    async fn get_balance(&self, _asset: &str) -> Result<f64, VenueError> {
        Ok(0.0)
    }

    async fn get_positions(&self) -> Result<Vec<VenuePosition>, VenueError> {
        Ok(self.state.lock().positions.clone())
    }

    async fn get_ticker(&self, pair: &PairId) -> Result<f64, VenueError> {
        self.state
            .lock()
            .marks
            .get(&pair.symbol)
            .copied()
            .ok_or_else(|| VenueError::InvalidOrder(format!("no mark price for {}", pair.symbol)))
    }

    async fn get_symbol_info(&self, _pair: &PairId) -> Result<SymbolInfo, VenueError> {
        Ok(SymbolInfo {
            min_qty: 0.0,
            qty_step: 0.0,
            price_step: 0.0,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
