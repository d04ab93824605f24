// =============================================================================
// Execution Engine — signals in, orders and positions out
// =============================================================================
//
// Reactive component. Trade signals run through the handler chain
// (validate → risk-size → place → reconcile); close requests from the
// position monitor skip straight to placement, because a close must never be
// blocked by entry gating or risk caps. Each pipeline run is spawned so a
// slow venue cannot stall bus dispatch.
//
// `StopNewEntries` and `StopAllTrading` latch halt flags that suppress new
// entries; closes always pass.
// =============================================================================

pub mod orders;
pub mod pipeline;
pub mod venue;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::{Component, Event, EventBus, EventHandler, EventKind};
use crate::config::{ExecutionConfig, SymbolConfig};
use crate::storage::ConnectionPool;
use crate::types::{
    AssetClass, Confidence, Direction, ExitReason, Order, PairId, Position, PositionSource,
    PositionState, TradeSignal,
};

pub use orders::OrderManager;
pub use pipeline::{
    ExecutionContext, ExecutionHandler, Placer, Reconciler, RiskSizer, StageFailure, Validator,
    DUPLICATE_REASON,
};
pub use venue::{PaperVenue, VenueAdapter, VenueError, VenuePosition};

const HANDLER_NAME: &str = "execution";

// ---------------------------------------------------------------------------
// Read-only provider contracts
// ---------------------------------------------------------------------------

/// External read-only equity source consulted by the risk sizer.
pub trait BalanceProvider: Send + Sync {
    fn equity(&self, venue: &str) -> f64;
}

/// Fixed-equity provider used in demo mode and tests.
pub struct StaticBalance(pub f64);

impl BalanceProvider for StaticBalance {
    fn equity(&self, _venue: &str) -> f64 {
        self.0
    }
}

/// Read-only open-position count, provided by the position monitor.
pub trait OpenPositionSource: Send + Sync {
    fn open_position_count(&self) -> usize;
}

/// Zero-position source for wiring before the monitor exists, and for tests.
pub struct NoPositions;

impl OpenPositionSource for NoPositions {
    fn open_position_count(&self) -> usize {
        0
    }
}

// ---------------------------------------------------------------------------
// Core
// ---------------------------------------------------------------------------

struct ExecutionCore {
    config: ExecutionConfig,
    min_confluence: f64,
    bus: Arc<EventBus>,
    venues: HashMap<String, Arc<dyn VenueAdapter>>,
    orders: Arc<OrderManager>,
    balance: Arc<dyn BalanceProvider>,
    positions: Arc<dyn OpenPositionSource>,
    /// Execution-local audit rows (trades_history, positions) per pair.
    pool: Option<Arc<ConnectionPool>>,
    symbols: Vec<SymbolConfig>,
    entries_halted: AtomicBool,
    all_halted: AtomicBool,
}

impl ExecutionCore {
    fn asset_class(&self, symbol: &str) -> AssetClass {
        self.symbols
            .iter()
            .find(|s| s.symbol == symbol)
            .map(|s| s.asset_class)
            .unwrap_or(AssetClass::Regular)
    }

    fn audit_order(&self, order: &Order) {
        if let Some(pool) = &self.pool {
            match pool.acquire(&order.pair) {
                Ok(db) => {
                    if let Err(e) = db.upsert_trade_history(order) {
                        warn!(pair = %order.pair, error = %e, "trade history audit failed");
                    }
                }
                Err(e) => warn!(pair = %order.pair, error = %e, "audit acquire failed"),
            }
        }
    }

    fn audit_position(&self, position: &Position) {
        if let Some(pool) = &self.pool {
            match pool.acquire(&position.pair) {
                Ok(db) => {
                    if let Err(e) = db.upsert_position_audit(position) {
                        warn!(pair = %position.pair, error = %e, "position audit failed");
                    }
                }
                Err(e) => warn!(pair = %position.pair, error = %e, "audit acquire failed"),
            }
        }
    }

    /// Skeleton order used for failure events raised before the placer ever
    /// registered a real order.
    fn rejected_order(&self, signal: &TradeSignal, client_id: &str) -> Order {
        let mut order = OrderManager::build_order(
            signal.pair.clone(),
            signal.direction,
            crate::types::OrderType::Market,
            0.0,
            None,
            None,
            client_id.to_string(),
        );
        order.state = crate::types::OrderState::Rejected;
        order
    }

    async fn run_chain(
        &self,
        handlers: Vec<Box<dyn ExecutionHandler>>,
        ctx: &mut ExecutionContext,
    ) -> Result<(), StageFailure> {
        for handler in handlers {
            if let Err(failure) = handler.handle(ctx).await {
                debug!(
                    stage = handler.name(),
                    reason = %failure.reason,
                    detail = %failure.detail,
                    "pipeline short-circuited"
                );
                return Err(failure);
            }
        }
        Ok(())
    }

    async fn handle_signal(&self, signal: TradeSignal) {
        if self.all_halted.load(Ordering::SeqCst) {
            info!(pair = %signal.pair, "signal suppressed — all trading halted");
            return;
        }
        if self.entries_halted.load(Ordering::SeqCst) {
            info!(pair = %signal.pair, "signal suppressed — new entries halted");
            return;
        }

        let venue = match self.venues.get(&signal.pair.venue) {
            Some(v) => v.clone(),
            None => {
                let order = self.rejected_order(&signal, &Uuid::new_v4().to_string());
                self.bus
                    .publish(Event::OrderFailed {
                        order,
                        reason: "validation".to_string(),
                    })
                    .await;
                return;
            }
        };

        let client_id = Uuid::new_v4().to_string();
        let mut ctx = ExecutionContext::new(
            signal.clone(),
            client_id.clone(),
            self.balance.equity(&signal.pair.venue),
            self.positions.open_position_count(),
        );

        let handlers: Vec<Box<dyn ExecutionHandler>> = vec![
            Box::new(Validator {
                min_confluence: self.min_confluence,
                known_venues: self.venues.keys().cloned().collect(),
            }),
            Box::new(RiskSizer {
                config: self.config.clone(),
            }),
            Box::new(Placer {
                venue: venue.clone(),
                orders: self.orders.clone(),
                bus: self.bus.clone(),
                config: self.config.clone(),
            }),
            Box::new(Reconciler {
                venue,
                orders: self.orders.clone(),
                config: self.config.clone(),
            }),
        ];

        match self.run_chain(handlers, &mut ctx).await {
            Ok(()) => {
                let order = match ctx.order.clone() {
                    Some(order) => order,
                    None => return,
                };
                self.audit_order(&order);
                self.bus.publish(Event::OrderFilled(order.clone())).await;

                let position = Position {
                    id: Uuid::new_v4().to_string(),
                    pair: signal.pair.clone(),
                    direction: signal.direction,
                    entry_price: ctx.fill_price,
                    quantity: order.filled_qty,
                    entry_time: Utc::now(),
                    asset_class: self.asset_class(&signal.pair.symbol),
                    source: PositionSource::Execution,
                    trailing_distance_pct: 0.0,
                    trailing_stop_price: None,
                    highest_mark: None,
                    lowest_mark: None,
                    mark_price: ctx.fill_price,
                    unrealized_pnl: 0.0,
                    unrealized_pnl_pct: 0.0,
                    state: PositionState::Open,
                    exit_reason: None,
                    realized_pnl: None,
                };
                self.audit_position(&position);
                self.bus.publish(Event::PositionOpened(position)).await;
            }
            Err(failure) if failure.reason == DUPLICATE_REASON => {
                // Idempotent resubmission: the original order stands.
                debug!(client_id = %client_id, "duplicate submission ignored");
            }
            Err(failure) => {
                let order = self
                    .orders
                    .get(&client_id)
                    .unwrap_or_else(|| self.rejected_order(&signal, &client_id));
                self.audit_order(&order);
                self.bus
                    .publish(Event::OrderFailed {
                        order,
                        reason: failure.reason,
                    })
                    .await;
            }
        }
    }

    /// Drive a market close for the monitor. Skips validation and risk
    /// sizing: reducing exposure must never be vetoed.
    async fn handle_close_request(
        &self,
        pair: PairId,
        position_direction: Direction,
        quantity: f64,
        reason: ExitReason,
        close_client_id: String,
    ) {
        let venue = match self.venues.get(&pair.venue) {
            Some(v) => v.clone(),
            None => {
                warn!(pair = %pair, "close request for unknown venue");
                return;
            }
        };

        // Slippage in the reconciler is measured against the current mark.
        let reference_price = venue.get_ticker(&pair).await.unwrap_or(0.0);

        let close_signal = TradeSignal {
            pair: pair.clone(),
            direction: position_direction.opposite(),
            entry_price: reference_price,
            confluence_score: 0.0,
            max_possible_score: 0.0,
            confidence: Confidence::Low,
            primary_results: Vec::new(),
            filter_scores: Vec::new(),
            suggested_stop: 0.0,
            suggested_target: None,
            created_at: Utc::now(),
        };

        let mut ctx = ExecutionContext::new(close_signal, close_client_id.clone(), 0.0, 0);
        ctx.quantity = quantity;

        info!(
            pair = %pair,
            quantity,
            reason = %reason,
            close_client_id = %close_client_id,
            "processing close request"
        );

        let handlers: Vec<Box<dyn ExecutionHandler>> = vec![
            Box::new(Placer {
                venue: venue.clone(),
                orders: self.orders.clone(),
                bus: self.bus.clone(),
                config: self.config.clone(),
            }),
            Box::new(Reconciler {
                venue,
                orders: self.orders.clone(),
                config: self.config.clone(),
            }),
        ];

        match self.run_chain(handlers, &mut ctx).await {
            Ok(()) => {
                if let Some(order) = ctx.order.clone() {
                    self.audit_order(&order);
                    self.bus.publish(Event::OrderFilled(order)).await;
                }
            }
            Err(failure) if failure.reason == DUPLICATE_REASON => {
                debug!(close_client_id = %close_client_id, "duplicate close request ignored");
            }
            Err(failure) => {
                warn!(
                    pair = %pair,
                    reason = %failure.reason,
                    detail = %failure.detail,
                    "close order failed"
                );
                let order = self
                    .orders
                    .get(&close_client_id)
                    .unwrap_or_else(|| self.rejected_order(&ctx.signal, &close_client_id));
                self.bus
                    .publish(Event::OrderFailed {
                        order,
                        reason: failure.reason,
                    })
                    .await;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Router (bus handler)
// ---------------------------------------------------------------------------

struct ExecutionRouter {
    core: Arc<ExecutionCore>,
}

#[async_trait]
impl EventHandler for ExecutionRouter {
    fn name(&self) -> &'static str {
        HANDLER_NAME
    }

    async fn handle(&self, event: &Event) -> Result<()> {
        match event {
            Event::TradingSignalGenerated(signal) => {
                // Spawn so a slow venue cannot stall bus dispatch.
                let core = self.core.clone();
                let signal = signal.clone();
                tokio::spawn(async move { core.handle_signal(signal).await });
            }
            Event::ClosePositionRequested {
                pair,
                direction,
                quantity,
                reason,
                close_client_id,
                ..
            } => {
                let core = self.core.clone();
                let pair = pair.clone();
                let direction = *direction;
                let quantity = *quantity;
                let reason = *reason;
                let close_client_id = close_client_id.clone();
                tokio::spawn(async move {
                    core.handle_close_request(pair, direction, quantity, reason, close_client_id)
                        .await;
                });
            }
            Event::StopNewEntries => {
                self.core.entries_halted.store(true, Ordering::SeqCst);
                warn!("new entries halted");
            }
            Event::StopAllTrading => {
                self.core.all_halted.store(true, Ordering::SeqCst);
                warn!("all trading halted");
            }
            _ => {}
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ExecutionEngine
// ---------------------------------------------------------------------------

pub struct ExecutionEngine {
    core: Arc<ExecutionCore>,
}

impl ExecutionEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ExecutionConfig,
        min_confluence: f64,
        symbols: Vec<SymbolConfig>,
        venues: HashMap<String, Arc<dyn VenueAdapter>>,
        balance: Arc<dyn BalanceProvider>,
        positions: Arc<dyn OpenPositionSource>,
        pool: Option<Arc<ConnectionPool>>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            core: Arc::new(ExecutionCore {
                config,
                min_confluence,
                bus,
                venues,
                orders: Arc::new(OrderManager::new()),
                balance,
                positions,
                pool,
                symbols,
                entries_halted: AtomicBool::new(false),
                all_halted: AtomicBool::new(false),
            }),
        }
    }

    pub fn orders(&self) -> Arc<OrderManager> {
        self.core.orders.clone()
    }

    /// Clear the entry/trading halt latches. Manual operation.
    pub fn reset_halts(&self) {
        self.core.entries_halted.store(false, Ordering::SeqCst);
        self.core.all_halted.store(false, Ordering::SeqCst);
        info!("execution halts cleared");
    }
}

#[async_trait]
impl Component for ExecutionEngine {
    fn name(&self) -> &'static str {
        "execution"
    }

    async fn start(&self) -> Result<()> {
        self.core.bus.subscribe_many(
            &[
                EventKind::TradingSignalGenerated,
                EventKind::ClosePositionRequested,
                EventKind::StopNewEntries,
                EventKind::StopAllTrading,
            ],
            Arc::new(ExecutionRouter {
                core: self.core.clone(),
            }),
        );
        info!(
            venues = self.core.venues.len(),
            max_positions = self.core.config.max_concurrent_positions,
            "execution engine started"
        );
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.core.bus.unsubscribe(HANDLER_NAME);
        info!("execution engine stopped");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MarketType, OrderState};
    use parking_lot::Mutex;
    use std::time::Duration;

    struct EventLog {
        events: Mutex<Vec<Event>>,
    }

    #[async_trait]
    impl EventHandler for EventLog {
        fn name(&self) -> &'static str {
            "event_log"
        }

        async fn handle(&self, event: &Event) -> Result<()> {
            self.events.lock().push(event.clone());
            Ok(())
        }
    }

    fn pair() -> PairId {
        PairId::new("paper", MarketType::Spot, "ETHUSDT")
    }

    fn signal() -> TradeSignal {
        TradeSignal {
            pair: pair(),
            direction: Direction::Long,
            entry_price: 3000.0,
            confluence_score: 5.0,
            max_possible_score: 8.0,
            confidence: Confidence::High,
            primary_results: Vec::new(),
            filter_scores: Vec::new(),
            suggested_stop: 2940.0,
            suggested_target: None,
            created_at: Utc::now(),
        }
    }

    fn fast_config() -> ExecutionConfig {
        ExecutionConfig {
            retry_base_delay_ms: 1,
            retry_max_delay_ms: 5,
            fill_timeout_s: 1,
            fill_poll_ms: 5,
            ..ExecutionConfig::default()
        }
    }

    async fn engine_with_bus(
        venue: Arc<PaperVenue>,
    ) -> (ExecutionEngine, Arc<EventBus>, Arc<EventLog>) {
        let bus = Arc::new(EventBus::new(256, None));
        let log = Arc::new(EventLog {
            events: Mutex::new(Vec::new()),
        });
        bus.subscribe_many(
            &[
                EventKind::OrderPlaced,
                EventKind::OrderFilled,
                EventKind::OrderFailed,
                EventKind::PositionOpened,
            ],
            log.clone(),
        );

        let mut venues: HashMap<String, Arc<dyn VenueAdapter>> = HashMap::new();
        venues.insert("paper".to_string(), venue);

        let engine = ExecutionEngine::new(
            fast_config(),
            3.0,
            vec![SymbolConfig::new(
                "paper",
                "ETHUSDT",
                AssetClass::Major,
                0.1,
            )],
            venues,
            Arc::new(StaticBalance(100_000.0)),
            Arc::new(NoPositions),
            None,
            bus.clone(),
        );
        engine.start().await.unwrap();
        bus.start();
        (engine, bus, log)
    }

    async fn wait_for<F: Fn(&[Event]) -> bool>(log: &EventLog, predicate: F) {
        for _ in 0..200 {
            if predicate(&log.events.lock()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn kinds(events: &[Event]) -> Vec<EventKind> {
        events.iter().map(|e| e.kind()).collect()
    }

    #[tokio::test]
    async fn accepted_signal_produces_fill_and_position() {
        let venue = Arc::new(PaperVenue::new("paper"));
        venue.set_mark("ETHUSDT", 3000.0);
        let (_engine, bus, log) = engine_with_bus(venue).await;

        bus.publish(Event::TradingSignalGenerated(signal())).await;
        wait_for(&log, |events| {
            kinds(events).contains(&EventKind::PositionOpened)
        })
        .await;
        bus.stop().await;

        let events = log.events.lock();
        let kinds = kinds(&events);
        // OrderPlaced precedes OrderFilled precedes PositionOpened.
        let placed = kinds.iter().position(|k| *k == EventKind::OrderPlaced).unwrap();
        let filled = kinds.iter().position(|k| *k == EventKind::OrderFilled).unwrap();
        let opened = kinds.iter().position(|k| *k == EventKind::PositionOpened).unwrap();
        assert!(placed < filled && filled < opened);

        let position = events
            .iter()
            .find_map(|e| match e {
                Event::PositionOpened(p) => Some(p.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(position.state, PositionState::Open);
        assert_eq!(position.asset_class, AssetClass::Major);
        assert!((position.entry_price - 3000.0).abs() < f64::EPSILON);
        // 2% of 100k at 3000.
        assert!((position.quantity - 2000.0 / 3000.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn validation_failure_emits_order_failed() {
        let venue = Arc::new(PaperVenue::new("paper"));
        venue.set_mark("ETHUSDT", 3000.0);
        let (_engine, bus, log) = engine_with_bus(venue).await;

        let mut bad = signal();
        bad.suggested_stop = 3100.0; // wrong side for a long
        bus.publish(Event::TradingSignalGenerated(bad)).await;
        wait_for(&log, |events| {
            kinds(events).contains(&EventKind::OrderFailed)
        })
        .await;
        bus.stop().await;

        let events = log.events.lock();
        let reason = events
            .iter()
            .find_map(|e| match e {
                Event::OrderFailed { reason, .. } => Some(reason.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(reason, "validation");
        assert!(!kinds(&events).contains(&EventKind::OrderPlaced));
    }

    #[tokio::test]
    async fn stop_new_entries_suppresses_signals() {
        let venue = Arc::new(PaperVenue::new("paper"));
        venue.set_mark("ETHUSDT", 3000.0);
        let (_engine, bus, log) = engine_with_bus(venue).await;

        bus.publish(Event::StopNewEntries).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.publish(Event::TradingSignalGenerated(signal())).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        bus.stop().await;

        let events = log.events.lock();
        assert!(events.is_empty(), "no order events expected, got {:?}", kinds(&events));
    }

    #[tokio::test]
    async fn close_request_bypasses_entry_halt() {
        let venue = Arc::new(PaperVenue::new("paper"));
        venue.set_mark("ETHUSDT", 2999.0);
        let (_engine, bus, log) = engine_with_bus(venue).await;

        bus.publish(Event::StopAllTrading).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        bus.publish(Event::ClosePositionRequested {
            position_id: "p1".into(),
            pair: pair(),
            direction: Direction::Long,
            quantity: 0.5,
            reason: ExitReason::TrailingStop,
            close_client_id: "close-p1".into(),
        })
        .await;
        wait_for(&log, |events| {
            kinds(events).contains(&EventKind::OrderFilled)
        })
        .await;
        bus.stop().await;

        let events = log.events.lock();
        let order = events
            .iter()
            .find_map(|e| match e {
                Event::OrderFilled(o) => Some(o.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(order.client_id, "close-p1");
        assert_eq!(order.state, OrderState::Filled);
        // Closing a long sells.
        assert_eq!(order.direction, Direction::Short);
        // No position is opened for a close order.
        assert!(!kinds(&events).contains(&EventKind::PositionOpened));
    }
}
