// =============================================================================
// Position Monitor — trailing stops, portfolio risk, reconciliation
// =============================================================================
//
// The monitor owns every position from `PositionOpened` onward. Marks and
// trailing stops advance on each tick under the per-position lock; the
// portfolio risk loop evaluates the five sub-policies on its own cadence.
//
// Closes go out as `ClosePositionRequested` events — execution owns the venue
// call, and the confirmation comes back as the close order's `OrderFilled`,
// which the monitor matches by client id to finalize the position. No direct
// reference ties the monitor to the execution engine.
//
// Startup reconciliation runs to completion before any subscription is
// installed: the venue is the source of truth.
// =============================================================================

pub mod book;
pub mod policies;
pub mod reconcile;
pub mod trailing;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::bus::events::DumpEvidence;
use crate::bus::{Component, Event, EventBus, EventHandler, EventKind, Shutdown};
use crate::config::EngineConfig;
use crate::execution::{OpenPositionSource, VenueAdapter};
use crate::storage::ConnectionPool;
use crate::types::{
    AssetClass, ExitReason, Order, PairId, Position, PositionState, Tick, Timeframe,
};

pub use book::{CloseIntent, PositionBook};
pub use policies::DrawdownBreaker;

const HANDLER_NAME: &str = "monitor";

/// Consecutive failures of one sub-policy before a SystemError is raised.
const POLICY_FAILURE_LIMIT: u32 = 2;

// ---------------------------------------------------------------------------
// Core
// ---------------------------------------------------------------------------

struct MonitorCore {
    config: EngineConfig,
    bus: Arc<EventBus>,
    pool: Arc<ConnectionPool>,
    book: Arc<PositionBook>,
    venues: HashMap<String, Arc<dyn VenueAdapter>>,
    /// Rolling (timestamp_ms, price) windows for the market leaders.
    leaders: Mutex<HashMap<String, VecDeque<(i64, f64)>>>,
    breaker: Mutex<DrawdownBreaker>,
    realized_today: Mutex<f64>,
    policy_failures: Mutex<HashMap<&'static str, u32>>,
    /// Edge trigger so a degraded health score emits StopNewEntries once.
    health_alerted: AtomicBool,
}

impl MonitorCore {
    fn trailing_pct_for(&self, class: AssetClass) -> f64 {
        let pct = self.config.trailing_pct(class);
        if class == AssetClass::Meme {
            pct.clamp(15.0, 20.0)
        } else {
            pct
        }
    }

    /// Starting capital plus realized and unrealized PnL.
    fn current_equity(&self) -> f64 {
        let unrealized: f64 = self
            .book
            .open_snapshots()
            .iter()
            .map(|p| p.unrealized_pnl)
            .sum();
        self.config.starting_capital + *self.realized_today.lock() + unrealized
    }

    async fn publish_close(&self, intent: CloseIntent) {
        self.bus
            .publish(Event::ClosePositionRequested {
                position_id: intent.position_id,
                pair: intent.pair,
                direction: intent.direction,
                quantity: intent.quantity,
                reason: intent.reason,
                close_client_id: intent.close_client_id,
            })
            .await;
    }

    /// Force-close one position for `reason`; no-op when a close is already
    /// in flight.
    async fn force_close(&self, position_id: &str, reason: ExitReason) -> bool {
        match self.book.begin_close(position_id, reason) {
            Some(intent) => {
                self.publish_close(intent).await;
                true
            }
            None => false,
        }
    }

    // -------------------------------------------------------------------------
    // Event paths
    // -------------------------------------------------------------------------

    fn on_position_opened(&self, mut position: Position) {
        if position.trailing_distance_pct <= 0.0 {
            position.trailing_distance_pct = self.trailing_pct_for(position.asset_class);
        }
        self.book.adopt(position);
    }

    async fn on_tick(&self, pair: &PairId, tick: &Tick) {
        // Leader window upkeep.
        if self
            .config
            .position
            .leader_symbols
            .iter()
            .any(|s| s == &pair.symbol)
        {
            let cutoff = tick.timestamp - self.config.position.leader_window_s * 1000;
            let mut leaders = self.leaders.lock();
            let window = leaders.entry(pair.symbol.clone()).or_default();
            window.push_back((tick.timestamp, tick.price));
            while window.front().map(|&(t, _)| t < cutoff).unwrap_or(false) {
                window.pop_front();
            }
        }

        // Mark and trail every open position on this symbol. The lock is
        // held only for the in-place update, never across an await.
        let mut triggered: Vec<String> = Vec::new();
        for handle in self.book.for_symbol(&pair.symbol) {
            let mut position = handle.lock();
            if position.state != PositionState::Open {
                continue;
            }
            if trailing::update_mark(&mut position, tick.price) {
                triggered.push(position.id.clone());
            }
        }

        for position_id in triggered {
            if self
                .force_close(&position_id, ExitReason::TrailingStop)
                .await
            {
                info!(id = %position_id, price = tick.price, "trailing stop hit");
            }
        }
    }

    async fn on_order_filled(&self, order: &Order) {
        if !self.book.is_pending_close(&order.client_id) {
            return;
        }

        if let Some(position) = self
            .book
            .finalize_close(&order.client_id, order.avg_fill_price)
        {
            if let Some(realized) = position.realized_pnl {
                *self.realized_today.lock() += realized;
            }

            if let Ok(db) = self.pool.acquire(&position.pair) {
                if let Err(e) = db.upsert_position_audit(&position) {
                    warn!(pair = %position.pair, error = %e, "position audit failed");
                }
            }

            if position.exit_reason == Some(ExitReason::TrailingStop) {
                self.bus
                    .publish(Event::TrailingStopHit(position.clone()))
                    .await;
            }
            self.bus.publish(Event::PositionClosed(position)).await;
        }
    }

    fn on_order_failed(&self, order: &Order) {
        if self.book.is_pending_close(&order.client_id) {
            self.book.abort_close(&order.client_id);
        }
    }

    // -------------------------------------------------------------------------
    // Risk policies
    // -------------------------------------------------------------------------

    async fn risk_cycle(&self) {
        let dump = self.check_dumps().await;
        self.record_policy("dump_detector", dump).await;

        let correlated = self.check_correlated().await;
        self.record_policy("correlated_dump", correlated).await;

        let health = self.check_health().await;
        self.record_policy("portfolio_health", health).await;

        let breaker = self.check_breaker().await;
        self.record_policy("drawdown_breaker", breaker).await;

        let hold = self.check_hold_times().await;
        self.record_policy("hold_time", hold).await;
    }

    /// Sub-policy error isolation: one failure logs, two consecutive raise a
    /// SystemError; success resets the counter.
    async fn record_policy(&self, name: &'static str, result: Result<()>) {
        match result {
            Ok(()) => {
                self.policy_failures.lock().remove(name);
            }
            Err(e) => {
                let count = {
                    let mut failures = self.policy_failures.lock();
                    let count = failures.entry(name).or_insert(0);
                    *count += 1;
                    *count
                };
                error!(policy = name, count, error = %e, "risk policy failed");
                if count >= POLICY_FAILURE_LIMIT {
                    self.bus
                        .publish(Event::system_error(
                            HANDLER_NAME,
                            "policy_failure",
                            format!("{name} failed {count} consecutive times: {e:#}"),
                        ))
                        .await;
                }
            }
        }
    }

    /// Policy 1: per-position dump detection, 2-of-3 signals.
    async fn check_dumps(&self) -> Result<()> {
        let now_ms = Utc::now().timestamp_millis();
        let dump_cfg = self.config.position.dump.clone();

        for position in self.book.open_snapshots() {
            if position.state != PositionState::Open {
                continue;
            }

            let db = self
                .pool
                .acquire(&position.pair)
                .with_context(|| format!("dump check acquire failed for {}", position.pair))?;

            let candles = db.recent_candles(Timeframe::M1, dump_cfg.consecutive_candles)?;
            let window_start = now_ms - dump_cfg.flow_flip_window_s * 1000;
            let flow = db.order_flow_history(window_start)?;
            let extreme = db.recent_extreme(window_start)?;

            let verdict = policies::dump_verdict(
                &dump_cfg,
                position.direction,
                &candles,
                &flow,
                position.mark_price,
                extreme,
            );

            if verdict.fired() >= dump_cfg.min_signals {
                let evidence = DumpEvidence {
                    volume_reversal: verdict.volume_reversal,
                    flow_flip: verdict.flow_flip,
                    momentum_break: verdict.momentum_break,
                    detail: format!(
                        "{}/{} signals fired at mark {:.4}",
                        verdict.fired(),
                        3,
                        position.mark_price
                    ),
                };
                warn!(
                    id = %position.id,
                    pair = %position.pair,
                    volume_reversal = verdict.volume_reversal,
                    flow_flip = verdict.flow_flip,
                    momentum_break = verdict.momentum_break,
                    "dump detected — force closing"
                );
                self.bus
                    .publish(Event::DumpDetected {
                        pair: position.pair.clone(),
                        position_id: position.id.clone(),
                        evidence,
                    })
                    .await;
                self.force_close(&position.id, ExitReason::DumpDetected).await;
            }
        }
        Ok(())
    }

    /// Policy 2: a leader dropping hard closes every correlated position.
    async fn check_correlated(&self) -> Result<()> {
        let cfg = &self.config.position;
        let windows: Vec<(String, Vec<(i64, f64)>)> = {
            let leaders = self.leaders.lock();
            leaders
                .iter()
                .map(|(symbol, window)| (symbol.clone(), window.iter().copied().collect()))
                .collect()
        };

        for (leader, window) in windows {
            let move_pct = match policies::leader_move_pct(&window) {
                Some(pct) => pct,
                None => continue,
            };
            if move_pct > -cfg.leader_drop_pct {
                continue;
            }

            let mut closed_ids = Vec::new();
            for position in self.book.open_snapshots() {
                if position.state != PositionState::Open {
                    continue;
                }
                let correlation = self.config.correlation(position.asset_class);
                if correlation >= cfg.correlation_close_threshold
                    && self
                        .force_close(&position.id, ExitReason::CorrelatedDump)
                        .await
                {
                    closed_ids.push(position.id.clone());
                }
            }

            // The detection event fires on the leader drop alone; the list of
            // force-closed positions may well be empty.
            warn!(
                leader = %leader,
                move_pct = format!("{move_pct:.2}"),
                closed = closed_ids.len(),
                "correlated dump detected"
            );
            self.bus
                .publish(Event::CorrelatedDumpDetected {
                    leader,
                    move_pct,
                    closed_position_ids: closed_ids,
                })
                .await;
        }
        Ok(())
    }

    /// Policy 3: portfolio health score with graduated actions.
    async fn check_health(&self) -> Result<()> {
        let cfg = &self.config.position;
        let positions = self.book.open_snapshots();
        let equity = self.current_equity();
        let now = Utc::now();

        let score = policies::health_score(&positions, equity, now, |class| {
            self.config.max_hold_secs(class)
        });

        let thresholds = &cfg.health_thresholds;
        let mut actions: Vec<String> = Vec::new();

        if score < thresholds.stop_entries {
            actions.push("stop_new_entries".to_string());
            if !self.health_alerted.swap(true, Ordering::SeqCst) {
                self.bus.publish(Event::StopNewEntries).await;
            }
        } else {
            self.health_alerted.store(false, Ordering::SeqCst);
        }

        if score < thresholds.tighten_trails {
            actions.push("tighten_trails".to_string());
            for position in &positions {
                if let Some(handle) = self.book.get(&position.id) {
                    trailing::tighten(&mut handle.lock(), cfg.tightened_trail_pct);
                }
            }
        }

        if score < thresholds.force_close {
            actions.push("close_worst_two".to_string());
            let mut by_pnl = positions.clone();
            by_pnl.sort_by(|a, b| {
                a.unrealized_pnl
                    .partial_cmp(&b.unrealized_pnl)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            for position in by_pnl.iter().take(2) {
                self.force_close(&position.id, ExitReason::PortfolioHealth)
                    .await;
            }
        }

        if !actions.is_empty() {
            warn!(score = format!("{score:.1}"), actions = ?actions, "portfolio health degraded");
            self.bus
                .publish(Event::PortfolioHealthDegraded { score, actions })
                .await;
        }
        Ok(())
    }

    /// Policy 4: latched daily drawdown breaker.
    async fn check_breaker(&self) -> Result<()> {
        let equity = self.current_equity();
        let now = Utc::now();

        let fired = {
            let mut breaker = self.breaker.lock();
            breaker.maybe_roll_day(equity, now);
            breaker
                .evaluate(equity)
                .map(|level| (level, breaker.daily_pnl_pct(equity)))
        };

        let (level, daily_pnl_pct) = match fired {
            Some(fired) => fired,
            None => return Ok(()),
        };

        error!(
            level,
            daily_pnl_pct = format!("{daily_pnl_pct:.2}"),
            "drawdown circuit breaker triggered"
        );
        self.bus
            .publish(Event::CircuitBreakerTriggered {
                level,
                daily_pnl_pct,
            })
            .await;
        self.bus.publish(Event::StopNewEntries).await;

        let mut positions = self.book.open_snapshots();
        positions.sort_by(|a, b| {
            a.unrealized_pnl
                .partial_cmp(&b.unrealized_pnl)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let to_close: Vec<&Position> = if level >= 2 {
            positions.iter().collect()
        } else {
            // Worst half, rounded up.
            positions.iter().take(positions.len().div_ceil(2)).collect()
        };

        for position in to_close {
            self.force_close(&position.id, ExitReason::CircuitBreaker)
                .await;
        }

        if level >= 3 {
            self.bus.publish(Event::StopAllTrading).await;
        }
        Ok(())
    }

    /// Policy 5: per-asset-class maximum hold time.
    async fn check_hold_times(&self) -> Result<()> {
        let now = Utc::now();
        for position in self.book.open_snapshots() {
            if position.state != PositionState::Open {
                continue;
            }
            if policies::hold_time_exceeded(&position, now, |class| {
                self.config.max_hold_secs(class)
            }) {
                warn!(
                    id = %position.id,
                    pair = %position.pair,
                    age_secs = position.age_secs(now),
                    "maximum hold time exceeded — force closing"
                );
                self.bus
                    .publish(Event::MaxHoldTimeExceeded(position.clone()))
                    .await;
                self.force_close(&position.id, ExitReason::MaxHoldTime).await;
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Router (bus handler)
// ---------------------------------------------------------------------------

struct MonitorRouter {
    core: Arc<MonitorCore>,
}

#[async_trait]
impl EventHandler for MonitorRouter {
    fn name(&self) -> &'static str {
        HANDLER_NAME
    }

    async fn handle(&self, event: &Event) -> Result<()> {
        match event {
            Event::PositionOpened(position) => {
                self.core.on_position_opened(position.clone());
            }
            Event::TradeTickReceived { pair, tick } => {
                self.core.on_tick(pair, tick).await;
            }
            Event::OrderFilled(order) => {
                self.core.on_order_filled(order).await;
            }
            Event::OrderFailed { order, .. } => {
                self.core.on_order_failed(order);
            }
            _ => {}
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// PositionMonitor
// ---------------------------------------------------------------------------

pub struct PositionMonitor {
    core: Arc<MonitorCore>,
    shutdown: Shutdown,
    risk_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl PositionMonitor {
    pub fn new(
        config: EngineConfig,
        venues: HashMap<String, Arc<dyn VenueAdapter>>,
        pool: Arc<ConnectionPool>,
        bus: Arc<EventBus>,
    ) -> Self {
        let starting_capital = config.starting_capital;
        let levels = config.position.circuit_breaker_levels.clone();
        Self {
            core: Arc::new(MonitorCore {
                config,
                bus,
                pool,
                book: Arc::new(PositionBook::new()),
                venues,
                leaders: Mutex::new(HashMap::new()),
                breaker: Mutex::new(DrawdownBreaker::new(starting_capital, levels, Utc::now())),
                realized_today: Mutex::new(0.0),
                policy_failures: Mutex::new(HashMap::new()),
                health_alerted: AtomicBool::new(false),
            }),
            shutdown: Shutdown::new(),
            risk_task: Mutex::new(None),
        }
    }

    /// The monitor's position store, read-only for other components.
    pub fn book(&self) -> Arc<PositionBook> {
        self.core.book.clone()
    }

    /// Manual breaker reset. Clears the latch and re-bases daily equity.
    pub fn reset_circuit_breaker(&self) {
        let equity = self.core.current_equity();
        self.core.breaker.lock().reset(equity);
        info!(equity, "circuit breaker manually reset");
    }
}

impl OpenPositionSource for PositionMonitor {
    fn open_position_count(&self) -> usize {
        self.core.book.open_count()
    }
}

#[async_trait]
impl Component for PositionMonitor {
    fn name(&self) -> &'static str {
        HANDLER_NAME
    }

    async fn start(&self) -> Result<()> {
        // Reconciliation completes before any live event handling begins.
        let summary =
            reconcile::run(&self.core.book, &self.core.venues, &self.core.config).await;
        for position in &summary.created {
            self.core
                .bus
                .publish(Event::PositionOpened(position.clone()))
                .await;
        }
        for position in &summary.closed {
            self.core
                .bus
                .publish(Event::PositionClosed(position.clone()))
                .await;
        }

        self.core.bus.subscribe_many(
            &[
                EventKind::PositionOpened,
                EventKind::TradeTickReceived,
                EventKind::OrderFilled,
                EventKind::OrderFailed,
            ],
            Arc::new(MonitorRouter {
                core: self.core.clone(),
            }),
        );

        let core = self.core.clone();
        let shutdown = self.shutdown.clone();
        let period = Duration::from_secs(self.core.config.position.risk_check_interval_s.max(1));
        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // Skip the immediate first tick; the book is still empty.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = ticker.tick() => core.risk_cycle().await,
                }
            }
            info!("portfolio risk loop stopped");
        });
        *self.risk_task.lock() = Some(handle);

        info!(
            risk_interval_s = self.core.config.position.risk_check_interval_s,
            leaders = ?self.core.config.position.leader_symbols,
            "position monitor started"
        );
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.shutdown.trigger();
        let handle = self.risk_task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.core.bus.unsubscribe(HANDLER_NAME);
        info!("position monitor stopped");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SymbolConfig;
    use crate::execution::{
        ExecutionEngine, NoPositions, PaperVenue, StaticBalance, VenuePosition,
    };
    use crate::types::{Direction, MarketType, PositionSource, Side};
    use chrono::Duration as ChronoDuration;

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

    fn pair(symbol: &str) -> PairId {
        PairId::new("paper", MarketType::Spot, symbol)
    }

    fn test_config(dir: &std::path::Path) -> EngineConfig {
        let mut config = EngineConfig::default();
        config.storage.base_dir = dir.to_string_lossy().into_owned();
        config.symbols = vec![
            SymbolConfig::new("paper", "BTCUSDT", AssetClass::Major, 1.0),
            SymbolConfig::new("paper", "ETHUSDT", AssetClass::Regular, 0.1),
            SymbolConfig::new("paper", "EURUSD", AssetClass::Forex, 0.0001),
        ];
        config
    }

    fn open_position(id: &str, symbol: &str, class: AssetClass, entry: f64, quantity: f64) -> Position {
        Position {
            id: id.to_string(),
            pair: pair(symbol),
            direction: Direction::Long,
            entry_price: entry,
            quantity,
            entry_time: Utc::now(),
            asset_class: class,
            source: PositionSource::Execution,
            trailing_distance_pct: 0.0,
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

    fn tick(ts: i64, price: f64) -> Tick {
        Tick {
            timestamp: ts,
            price,
            volume: 1.0,
            side: Side::Buy,
            trade_id: format!("t{ts}"),
        }
    }

    struct Rig {
        bus: Arc<EventBus>,
        monitor: PositionMonitor,
        venue: Arc<PaperVenue>,
        log: Arc<EventLog>,
        _dir: tempfile::TempDir,
    }

    async fn rig() -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());

        let bus = Arc::new(EventBus::new(1024, None));
        let log = Arc::new(EventLog {
            events: Mutex::new(Vec::new()),
        });
        bus.subscribe_many(
            &[
                EventKind::PositionClosed,
                EventKind::TrailingStopHit,
                EventKind::ClosePositionRequested,
                EventKind::DumpDetected,
                EventKind::CorrelatedDumpDetected,
                EventKind::PortfolioHealthDegraded,
                EventKind::CircuitBreakerTriggered,
                EventKind::MaxHoldTimeExceeded,
                EventKind::StopNewEntries,
                EventKind::StopAllTrading,
                EventKind::PositionOpened,
            ],
            log.clone(),
        );

        let venue = Arc::new(PaperVenue::new("paper"));
        let mut venues: HashMap<String, Arc<dyn VenueAdapter>> = HashMap::new();
        venues.insert("paper".to_string(), venue.clone());

        let pool = Arc::new(ConnectionPool::new(dir.path(), 16));
        let monitor = PositionMonitor::new(config, venues, pool, bus.clone());

        Rig {
            bus,
            monitor,
            venue,
            log,
            _dir: dir,
        }
    }

    async fn drain(bus: &Arc<EventBus>) {
        for _ in 0..200 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            if bus.stats().queue_depth == 0 {
                return;
            }
        }
    }

    fn events_of(log: &EventLog, kind: EventKind) -> Vec<Event> {
        log.events
            .lock()
            .iter()
            .filter(|e| e.kind() == kind)
            .cloned()
            .collect()
    }

    // -------------------------------------------------------------------------
    // Trailing stop end to end (monitor + execution over the bus)
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn trailing_stop_closes_position_through_execution() {
        let rig = rig().await;
        let config = rig.monitor.core.config.clone();

        // Execution drives the paper venue when the monitor requests a close.
        let mut venues: HashMap<String, Arc<dyn VenueAdapter>> = HashMap::new();
        venues.insert("paper".to_string(), rig.venue.clone());
        let execution = ExecutionEngine::new(
            crate::config::ExecutionConfig {
                retry_base_delay_ms: 1,
                fill_poll_ms: 5,
                fill_timeout_s: 2,
                ..config.execution.clone()
            },
            config.decision.min_confluence,
            config.symbols.clone(),
            venues,
            Arc::new(StaticBalance(100_000.0)),
            Arc::new(NoPositions),
            None,
            rig.bus.clone(),
        );

        rig.monitor.start().await.unwrap();
        execution.start().await.unwrap();
        rig.bus.start();

        rig.bus
            .publish(Event::PositionOpened(open_position(
                "p1", "ETHUSDT", AssetClass::Regular, 3000.0, 1.0,
            )))
            .await;

        // Entry 3000, 0.5% trail. High 3020 puts the stop at 3004.9; the
        // 2999 print trips it.
        rig.venue.set_mark("ETHUSDT", 2999.0);
        for (i, price) in [3000.0, 3020.0, 3015.0, 3010.0, 2999.0].iter().enumerate() {
            rig.bus
                .publish(Event::TradeTickReceived {
                    pair: pair("ETHUSDT"),
                    tick: tick(1_000 + i as i64, *price),
                })
                .await;
        }

        // Wait for the full close round trip.
        for _ in 0..200 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            if !events_of(&rig.log, EventKind::PositionClosed).is_empty() {
                break;
            }
        }
        rig.bus.stop().await;

        let closed = events_of(&rig.log, EventKind::PositionClosed);
        assert_eq!(closed.len(), 1);
        let position = match &closed[0] {
            Event::PositionClosed(p) => p.clone(),
            _ => unreachable!(),
        };
        assert_eq!(position.state, PositionState::Closed);
        assert_eq!(position.exit_reason, Some(ExitReason::TrailingStop));
        // Filled at the 2999 mark: realized = (2999 - 3000) * 1.
        assert!((position.realized_pnl.unwrap() - (-1.0)).abs() < 1e-9);
        // Monitor assigned the regular-crypto trail.
        assert!((position.trailing_distance_pct - 0.5).abs() < f64::EPSILON);

        assert_eq!(events_of(&rig.log, EventKind::TrailingStopHit).len(), 1);

        execution.stop().await.unwrap();
        rig.monitor.stop().await.unwrap();
    }

    // -------------------------------------------------------------------------
    // Drawdown breaker (scenario: -4.2% on 100k)
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn drawdown_level_two_closes_everything_and_stops_entries() {
        let rig = rig().await;
        rig.bus.start();

        let core = &rig.monitor.core;
        core.on_position_opened(open_position("a", "ETHUSDT", AssetClass::Regular, 3000.0, 10.0));
        core.on_position_opened(open_position("b", "BTCUSDT", AssetClass::Major, 60_000.0, 0.5));

        // Marks: ETH -2100, BTC -2100 => equity 95 800 (-4.2%).
        core.on_tick(&pair("ETHUSDT"), &tick(1, 2790.0)).await;
        core.on_tick(&pair("BTCUSDT"), &tick(2, 55_800.0)).await;

        core.check_breaker().await.unwrap();
        drain(&rig.bus).await;
        rig.bus.stop().await;

        let fired = events_of(&rig.log, EventKind::CircuitBreakerTriggered);
        assert_eq!(fired.len(), 1);
        match &fired[0] {
            Event::CircuitBreakerTriggered {
                level,
                daily_pnl_pct,
            } => {
                assert_eq!(*level, 2);
                assert!((daily_pnl_pct - (-4.2)).abs() < 1e-6);
            }
            _ => unreachable!(),
        }

        // Level 2 closes every open position and halts new entries.
        assert_eq!(
            events_of(&rig.log, EventKind::ClosePositionRequested).len(),
            2
        );
        assert_eq!(events_of(&rig.log, EventKind::StopNewEntries).len(), 1);
        assert!(events_of(&rig.log, EventKind::StopAllTrading).is_empty());
    }

    #[tokio::test]
    async fn drawdown_level_three_halts_all_trading_and_latches() {
        let rig = rig().await;
        rig.bus.start();

        let core = &rig.monitor.core;
        core.on_position_opened(open_position("a", "ETHUSDT", AssetClass::Regular, 3000.0, 10.0));
        // -6% in one move.
        core.on_tick(&pair("ETHUSDT"), &tick(1, 2400.0)).await;

        core.check_breaker().await.unwrap();
        // Latched: a second evaluation fires nothing new.
        core.check_breaker().await.unwrap();
        drain(&rig.bus).await;
        rig.bus.stop().await;

        assert_eq!(
            events_of(&rig.log, EventKind::CircuitBreakerTriggered).len(),
            1
        );
        assert_eq!(events_of(&rig.log, EventKind::StopAllTrading).len(), 1);
    }

    // -------------------------------------------------------------------------
    // Dump detector
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn dump_two_of_three_force_closes() {
        let rig = rig().await;
        rig.bus.start();

        let core = &rig.monitor.core;
        core.on_position_opened(open_position("p1", "ETHUSDT", AssetClass::Regular, 3000.0, 1.0));

        // Seed adverse structure: 3 sell-heavy 1m candles and a price off
        // the recent high by more than 0.5%.
        let db = core.pool.acquire(&pair("ETHUSDT")).unwrap();
        let now_ms = Utc::now().timestamp_millis();
        for i in 0..3i64 {
            db.insert_candle(
                Timeframe::M1,
                &crate::types::Candle {
                    open_time: now_ms - (3 - i) * 60_000,
                    open: 3000.0,
                    high: 3005.0,
                    low: 2990.0,
                    close: 2995.0,
                    volume: 10.0,
                    buy_volume: 3.0,
                    sell_volume: 7.0,
                },
            )
            .unwrap();
        }
        db.insert_tick(&Tick {
            timestamp: now_ms - 60_000,
            price: 3010.0,
            volume: 1.0,
            side: Side::Buy,
            trade_id: "high".into(),
        })
        .unwrap();

        // Mark the position below the momentum-break level.
        core.on_tick(&pair("ETHUSDT"), &tick(now_ms, 2980.0)).await;

        core.check_dumps().await.unwrap();
        drain(&rig.bus).await;
        rig.bus.stop().await;

        let dumps = events_of(&rig.log, EventKind::DumpDetected);
        assert_eq!(dumps.len(), 1);
        match &dumps[0] {
            Event::DumpDetected { evidence, .. } => {
                assert!(evidence.fired() >= 2);
                assert!(evidence.volume_reversal);
                assert!(evidence.momentum_break);
            }
            _ => unreachable!(),
        }
        assert_eq!(
            events_of(&rig.log, EventKind::ClosePositionRequested).len(),
            1
        );
    }

    // -------------------------------------------------------------------------
    // Correlated dump
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn leader_drop_closes_correlated_positions_only() {
        let rig = rig().await;
        rig.bus.start();

        let core = &rig.monitor.core;
        // Major correlates at 0.75 (>= 0.7); forex at 0.0. The exposed
        // position sits on a non-leader symbol so only the correlation
        // policy, not its own trailing stop, can close it.
        core.on_position_opened(open_position("major", "SOLUSDT", AssetClass::Major, 150.0, 10.0));
        core.on_position_opened(open_position("fx", "EURUSD", AssetClass::Forex, 1.1, 1_000.0));

        // BTC leader window: -1.67% inside five minutes.
        let now_ms = Utc::now().timestamp_millis();
        core.on_tick(&pair("BTCUSDT"), &tick(now_ms - 60_000, 60_000.0)).await;
        core.on_tick(&pair("BTCUSDT"), &tick(now_ms, 59_000.0)).await;

        core.check_correlated().await.unwrap();
        drain(&rig.bus).await;
        rig.bus.stop().await;

        let detected = events_of(&rig.log, EventKind::CorrelatedDumpDetected);
        assert_eq!(detected.len(), 1);
        match &detected[0] {
            Event::CorrelatedDumpDetected {
                leader,
                move_pct,
                closed_position_ids,
            } => {
                assert_eq!(leader, "BTCUSDT");
                assert!(*move_pct <= -1.5);
                assert_eq!(closed_position_ids, &vec!["major".to_string()]);
            }
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn leader_drop_is_reported_even_without_correlated_exposure() {
        let rig = rig().await;
        rig.bus.start();

        let core = &rig.monitor.core;
        // Forex correlates at 0.0: nothing qualifies for a force close, but
        // the detection event must still fire.
        core.on_position_opened(open_position("fx", "EURUSD", AssetClass::Forex, 1.1, 1_000.0));

        let now_ms = Utc::now().timestamp_millis();
        core.on_tick(&pair("BTCUSDT"), &tick(now_ms - 60_000, 60_000.0)).await;
        core.on_tick(&pair("BTCUSDT"), &tick(now_ms, 59_000.0)).await;

        core.check_correlated().await.unwrap();
        drain(&rig.bus).await;
        rig.bus.stop().await;

        let detected = events_of(&rig.log, EventKind::CorrelatedDumpDetected);
        assert_eq!(detected.len(), 1);
        match &detected[0] {
            Event::CorrelatedDumpDetected {
                closed_position_ids,
                ..
            } => assert!(closed_position_ids.is_empty()),
            _ => unreachable!(),
        }
        // The uncorrelated position stays open.
        assert!(events_of(&rig.log, EventKind::ClosePositionRequested).is_empty());
        assert_eq!(core.book.open_count(), 1);
    }

    // -------------------------------------------------------------------------
    // Portfolio health
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn degraded_health_stops_entries_and_closes_worst() {
        let rig = rig().await;
        rig.bus.start();

        let core = &rig.monitor.core;
        core.on_position_opened(open_position("a", "ETHUSDT", AssetClass::Regular, 3000.0, 10.0));
        core.on_position_opened(open_position("b", "ETHUSDT", AssetClass::Regular, 3000.0, 10.0));
        core.on_position_opened(open_position("c", "BTCUSDT", AssetClass::Major, 60_000.0, 0.1));

        // Concentrated, deeply losing book.
        core.on_tick(&pair("ETHUSDT"), &tick(1, 2700.0)).await;
        core.on_tick(&pair("BTCUSDT"), &tick(2, 59_000.0)).await;

        core.check_health().await.unwrap();
        drain(&rig.bus).await;
        rig.bus.stop().await;

        let degraded = events_of(&rig.log, EventKind::PortfolioHealthDegraded);
        assert_eq!(degraded.len(), 1);
        match &degraded[0] {
            Event::PortfolioHealthDegraded { score, actions } => {
                assert!(*score < 30.0, "score {score}");
                assert!(actions.contains(&"stop_new_entries".to_string()));
                assert!(actions.contains(&"tighten_trails".to_string()));
                assert!(actions.contains(&"close_worst_two".to_string()));
            }
            _ => unreachable!(),
        }

        assert_eq!(events_of(&rig.log, EventKind::StopNewEntries).len(), 1);
        // The two worst (the ETH pair of positions) got close intents.
        let intents = events_of(&rig.log, EventKind::ClosePositionRequested);
        assert_eq!(intents.len(), 2);

        // Survivors carry the tightened trail distance.
        let survivor = core.book.get("c").unwrap().lock().clone();
        assert!((survivor.trailing_distance_pct - 0.3).abs() < f64::EPSILON);
    }

    // -------------------------------------------------------------------------
    // Hold-time enforcement
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn stale_position_is_closed_for_hold_time() {
        let rig = rig().await;
        rig.bus.start();

        let core = &rig.monitor.core;
        let mut stale = open_position("old", "ETHUSDT", AssetClass::Regular, 3000.0, 1.0);
        stale.entry_time = Utc::now() - ChronoDuration::seconds(3_600);
        core.on_position_opened(stale);

        let fresh = open_position("new", "ETHUSDT", AssetClass::Regular, 3000.0, 1.0);
        core.on_position_opened(fresh);

        core.check_hold_times().await.unwrap();
        drain(&rig.bus).await;
        rig.bus.stop().await;

        let exceeded = events_of(&rig.log, EventKind::MaxHoldTimeExceeded);
        assert_eq!(exceeded.len(), 1);
        let intents = events_of(&rig.log, EventKind::ClosePositionRequested);
        assert_eq!(intents.len(), 1);
        match &intents[0] {
            Event::ClosePositionRequested {
                position_id,
                reason,
                ..
            } => {
                assert_eq!(position_id, "old");
                assert_eq!(*reason, ExitReason::MaxHoldTime);
            }
            _ => unreachable!(),
        }
    }

    // -------------------------------------------------------------------------
    // Startup reconciliation through Component::start
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn start_adopts_venue_positions_before_going_live() {
        let rig = rig().await;
        rig.venue.seed_position(VenuePosition {
            symbol: "BTCUSDT".into(),
            market_type: MarketType::Spot,
            direction: Direction::Long,
            entry_price: 60_000.0,
            quantity: 0.1,
        });

        rig.bus.start();
        rig.monitor.start().await.unwrap();
        drain(&rig.bus).await;

        assert_eq!(rig.monitor.open_position_count(), 1);
        let opened = events_of(&rig.log, EventKind::PositionOpened);
        assert_eq!(opened.len(), 1);
        match &opened[0] {
            Event::PositionOpened(p) => {
                assert_eq!(p.source, PositionSource::Reconciled);
                assert_eq!(p.pair.symbol, "BTCUSDT");
            }
            _ => unreachable!(),
        }

        rig.bus.stop().await;
        rig.monitor.stop().await.unwrap();
    }

    // -------------------------------------------------------------------------
    // Policy failure escalation
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn two_consecutive_policy_failures_raise_system_error() {
        let rig = rig().await;
        let log = Arc::new(EventLog {
            events: Mutex::new(Vec::new()),
        });
        rig.bus.subscribe(EventKind::SystemError, log.clone());
        rig.bus.start();

        let core = &rig.monitor.core;
        let failure = || -> Result<()> { anyhow::bail!("query failed") };

        core.record_policy("dump_detector", failure()).await;
        drain(&rig.bus).await;
        assert!(events_of(&log, EventKind::SystemError).is_empty());

        core.record_policy("dump_detector", failure()).await;
        drain(&rig.bus).await;
        assert_eq!(events_of(&log, EventKind::SystemError).len(), 1);

        // Success resets the streak.
        core.record_policy("dump_detector", Ok(())).await;
        core.record_policy("dump_detector", failure()).await;
        drain(&rig.bus).await;
        assert_eq!(events_of(&log, EventKind::SystemError).len(), 1);

        rig.bus.stop().await;
    }
}
