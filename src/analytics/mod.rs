// =============================================================================
// Analytics Engine — periodic sweep over active symbols
// =============================================================================
//
// Every sweep interval the engine walks the symbols that received data within
// the activity window, computes a fresh snapshot per symbol from storage
// queries, and publishes `AnalyticsUpdated` when content changed or the
// publish interval elapsed. The latest snapshot per symbol is cached behind
// an `Arc` pointer swap: readers see either the old or the new snapshot,
// never a mix.
//
// Zone and gap analyzers are stateful: detections and lifecycle transitions
// persist to the pair database, and a per-pair watermark ensures each closed
// candle is processed exactly once.
// =============================================================================

pub mod fvg;
pub mod microstructure;
pub mod order_flow;
pub mod profile;
pub mod reversion;
pub mod trend;
pub mod zones;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::bus::{Component, Event, EventBus, EventHandler, EventKind, Shutdown};
use crate::config::{AnalyticsConfig, SymbolConfig};
use crate::storage::{ConnectionPool, PairDb};
use crate::types::{AnalyticsSnapshot, Candle, PairId, RejectionSignal, Timeframe};

/// How many recent candles each sweep loads for structure analysis.
const STRUCTURE_CANDLES: usize = 60;

const ACTIVITY_PROBE_NAME: &str = "analytics";

// ---------------------------------------------------------------------------
// Activity tracking
// ---------------------------------------------------------------------------

/// Marks symbols active as their ticks flow. The sweep only computes symbols
/// with data inside the activity window.
struct ActivityProbe {
    activity: Arc<RwLock<HashMap<PairId, i64>>>,
}

#[async_trait]
impl EventHandler for ActivityProbe {
    fn name(&self) -> &'static str {
        ACTIVITY_PROBE_NAME
    }

    async fn handle(&self, event: &Event) -> Result<()> {
        if let Event::TradeTickReceived { pair, tick } = event {
            self.activity.write().insert(pair.clone(), tick.timestamp);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Per-pair sweep state
// ---------------------------------------------------------------------------

/// Watermarks so each closed candle feeds zone/gap analysis exactly once.
#[derive(Debug, Default, Clone)]
struct PairTracker {
    processed_1m: i64,
    processed_5m: i64,
}

// ---------------------------------------------------------------------------
// Core (shared with the sweep task)
// ---------------------------------------------------------------------------

struct AnalyticsCore {
    config: AnalyticsConfig,
    symbols: Vec<SymbolConfig>,
    pool: Arc<ConnectionPool>,
    bus: Arc<EventBus>,
    cache: RwLock<HashMap<PairId, Arc<AnalyticsSnapshot>>>,
    activity: Arc<RwLock<HashMap<PairId, i64>>>,
    trackers: Mutex<HashMap<PairId, PairTracker>>,
    last_published: Mutex<HashMap<PairId, Instant>>,
}

impl AnalyticsCore {
    /// One full sweep over the active symbols.
    async fn sweep(&self) {
        let now_ms = Utc::now().timestamp_millis();
        let activity_cutoff = now_ms - self.config.order_flow_window_s * 1000;

        let active: Vec<SymbolConfig> = {
            let activity = self.activity.read();
            self.symbols
                .iter()
                .filter(|s| {
                    activity
                        .get(&s.pair())
                        .map(|&last| last >= activity_cutoff)
                        .unwrap_or(false)
                })
                .cloned()
                .collect()
        };

        for symbol in active {
            let pair = symbol.pair();
            let db = match self.pool.acquire(&pair) {
                Ok(db) => db,
                Err(e) => {
                    warn!(pair = %pair, error = %e, "analytics: pair acquire failed");
                    continue;
                }
            };

            let mut tracker = self
                .trackers
                .lock()
                .get(&pair)
                .cloned()
                .unwrap_or_default();

            match self.compute_snapshot(&db, &symbol, now_ms, &mut tracker) {
                Ok(snapshot) => {
                    self.trackers.lock().insert(pair.clone(), tracker);
                    self.maybe_publish(pair, snapshot).await;
                }
                Err(e) => {
                    debug!(pair = %pair, error = %e, "analytics: snapshot skipped");
                }
            }
        }
    }

    /// Publish when content changed or the publish interval elapsed; always
    /// refresh the cache pointer.
    async fn maybe_publish(&self, pair: PairId, snapshot: AnalyticsSnapshot) {
        let interval_elapsed = self
            .last_published
            .lock()
            .get(&pair)
            .map(|t| t.elapsed() >= Duration::from_secs(self.config.update_interval_s))
            .unwrap_or(true);

        let changed = self
            .cache
            .read()
            .get(&pair)
            .map(|prev| !prev.content_eq(&snapshot))
            .unwrap_or(true);

        if !changed && !interval_elapsed {
            return;
        }

        let snapshot = Arc::new(snapshot);
        self.cache.write().insert(pair.clone(), snapshot.clone());
        self.last_published.lock().insert(pair.clone(), Instant::now());

        self.bus
            .publish(Event::AnalyticsUpdated { pair, snapshot })
            .await;
    }

    /// Compute the full snapshot for one pair and advance its candle
    /// watermarks.
    fn compute_snapshot(
        &self,
        db: &PairDb,
        symbol: &SymbolConfig,
        now_ms: i64,
        tracker: &mut PairTracker,
    ) -> Result<AnalyticsSnapshot> {
        let cfg = &self.config;
        let pair = symbol.pair();

        // ── Tick windows ─────────────────────────────────────────────────
        let ticks_15m = db.recent_ticks(now_ms - cfg.reversion_window_s * 1000)?;
        let last_price = ticks_15m
            .last()
            .map(|t| t.price)
            .or_else(|| {
                db.latest_candle(Timeframe::M1)
                    .ok()
                    .flatten()
                    .map(|c| c.close)
            })
            .context("no market data for pair")?;

        let flow_cutoff = now_ms - cfg.order_flow_window_s * 1000;
        let flow_ticks: Vec<_> = ticks_15m
            .iter()
            .filter(|t| t.timestamp >= flow_cutoff)
            .cloned()
            .collect();

        // ── Order flow ───────────────────────────────────────────────────
        let flow = order_flow::compute(&flow_ticks, cfg.large_trade_factor);
        db.insert_order_flow(&crate::types::OrderFlowMetric {
            timestamp: now_ms,
            cvd: flow.cvd,
            imbalance: flow.imbalance,
            buy_volume: flow.buy_volume,
            sell_volume: flow.sell_volume,
            net_volume: flow.net_volume,
            large_trades: flow.large_trades,
        })?;

        // ── Market profile ───────────────────────────────────────────────
        let histogram =
            db.volume_by_price(now_ms - cfg.profile_window_s * 1000, symbol.profile_bucket)?;
        let profile = profile::compute(&histogram, now_ms);
        if let Some(ref p) = profile {
            let blob = serde_json::to_string(&histogram).unwrap_or_default();
            db.insert_market_profile(p, &blob)?;
        }

        // ── Microstructure ───────────────────────────────────────────────
        let latest_candle = db.latest_candle(Timeframe::M1)?;
        let rejection = latest_candle
            .as_ref()
            .map(microstructure::rejection)
            .unwrap_or(RejectionSignal {
                bullish: false,
                bearish: false,
                wick_body_ratio: 0.0,
            });

        // ── Zones and gaps (stateful) ────────────────────────────────────
        let candles_1m = db.recent_candles(Timeframe::M1, STRUCTURE_CANDLES)?;
        let candles_5m = db.recent_candles(Timeframe::M5, STRUCTURE_CANDLES)?;
        self.advance_structure(db, &candles_1m, &candles_5m, tracker)?;

        let zones = db.active_zones()?;
        let gaps = db.open_gaps()?;

        // ── Mean reversion & autocorrelation ─────────────────────────────
        let prices: Vec<f64> = ticks_15m.iter().map(|t| t.price).collect();
        let (mean, stddev) = reversion::mean_stddev(&prices);
        let zscore = reversion::zscore(last_price, mean, stddev);
        let autocorr = reversion::lag1_autocorrelation(&prices, cfg.autocorr_samples);

        // ── Multi-timeframe trend ────────────────────────────────────────
        let m1 = trend::direction(
            &candles_1m.iter().map(|c| c.close).collect::<Vec<_>>(),
            cfg.ema_short,
            cfg.ema_long,
        );
        let m5 = trend::direction(
            &candles_5m.iter().map(|c| c.close).collect::<Vec<_>>(),
            cfg.ema_short,
            cfg.ema_long,
        );
        let closes_15m = db.closes(Timeframe::M15, STRUCTURE_CANDLES)?;
        let m15 = trend::direction(&closes_15m, cfg.ema_short, cfg.ema_long);

        Ok(AnalyticsSnapshot {
            pair,
            computed_at: now_ms,
            last_price,
            order_flow: flow,
            profile,
            rejection,
            latest_candle,
            zones,
            gaps,
            price_mean_15m: mean,
            price_stddev_15m: stddev,
            zscore,
            autocorrelation_lag1: autocorr,
            trends: trend::combine(m1, m5, m15),
        })
    }

    /// Apply unprocessed candles to zone/gap lifecycle and run detection,
    /// then advance the watermarks.
    fn advance_structure(
        &self,
        db: &PairDb,
        candles_1m: &[Candle],
        candles_5m: &[Candle],
        tracker: &mut PairTracker,
    ) -> Result<()> {
        let new_1m: Vec<&Candle> = candles_1m
            .iter()
            .filter(|c| c.open_time > tracker.processed_1m)
            .collect();

        // Lifecycle transitions run on new 1m candles only.
        if !new_1m.is_empty() {
            for zone in db.active_zones()? {
                let mut current = zone;
                for candle in &new_1m {
                    if let Some((tests, state)) = zones::apply_candle(&current, candle) {
                        db.update_zone(current.id, tests, state)?;
                        current.test_count = tests;
                        current.state = state;
                        if state == crate::types::ZoneState::Broken {
                            break;
                        }
                    }
                }
            }

            for gap in db.open_gaps()? {
                let mut current = gap;
                for candle in &new_1m {
                    if let Some((pct, fill)) = fvg::apply_candle(&current, candle) {
                        db.update_gap(current.id, pct, fill)?;
                        current.fill_pct = pct;
                        current.fill = fill;
                        if fill == crate::types::GapFill::Filled {
                            break;
                        }
                    }
                }
            }
        }

        // Detection: only keep structures whose anchor candle is new.
        let active = db.active_zones()?;
        for candidate in zones::detect(candles_1m)
            .into_iter()
            .chain(zones::detect(candles_5m))
        {
            let anchored_1m = candidate.created_at > tracker.processed_1m
                && candles_1m.iter().any(|c| c.open_time == candidate.created_at);
            let anchored_5m = candidate.created_at > tracker.processed_5m
                && candles_5m.iter().any(|c| c.open_time == candidate.created_at);
            if !anchored_1m && !anchored_5m {
                continue;
            }
            if active.iter().any(|z| zones::overlaps(&candidate, z)) {
                continue;
            }
            db.insert_zone(&candidate)?;
        }

        for candidate in fvg::detect(candles_1m) {
            if candidate.created_at <= tracker.processed_1m {
                continue;
            }
            db.insert_gap(&candidate)?;
        }

        if let Some(last) = candles_1m.last() {
            tracker.processed_1m = last.open_time;
        }
        if let Some(last) = candles_5m.last() {
            tracker.processed_5m = last.open_time;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// AnalyticsEngine
// ---------------------------------------------------------------------------

pub struct AnalyticsEngine {
    core: Arc<AnalyticsCore>,
    shutdown: Shutdown,
    sweep_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl AnalyticsEngine {
    pub fn new(
        config: AnalyticsConfig,
        symbols: Vec<SymbolConfig>,
        pool: Arc<ConnectionPool>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            core: Arc::new(AnalyticsCore {
                config,
                symbols,
                pool,
                bus,
                cache: RwLock::new(HashMap::new()),
                activity: Arc::new(RwLock::new(HashMap::new())),
                trackers: Mutex::new(HashMap::new()),
                last_published: Mutex::new(HashMap::new()),
            }),
            shutdown: Shutdown::new(),
            sweep_task: Mutex::new(None),
        }
    }

    /// Latest published snapshot for a pair, if any. Cheap pointer clone.
    pub fn snapshot(&self, pair: &PairId) -> Option<Arc<AnalyticsSnapshot>> {
        self.core.cache.read().get(pair).cloned()
    }
}

#[async_trait]
impl Component for AnalyticsEngine {
    fn name(&self) -> &'static str {
        "analytics"
    }

    async fn start(&self) -> Result<()> {
        self.core.bus.subscribe(
            EventKind::TradeTickReceived,
            Arc::new(ActivityProbe {
                activity: self.core.activity.clone(),
            }),
        );

        let core = self.core.clone();
        let shutdown = self.shutdown.clone();
        let period = Duration::from_secs(self.core.config.update_interval_s.max(1));

        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            // A sweep that overruns the interval skips the missed cycles.
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = ticker.tick() => core.sweep().await,
                }
            }
            info!("analytics sweep loop stopped");
        });
        *self.sweep_task.lock() = Some(handle);

        info!(
            interval_s = self.core.config.update_interval_s,
            symbols = self.core.symbols.len(),
            "analytics engine started"
        );
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.shutdown.trigger();
        let handle = self.sweep_task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.core.bus.unsubscribe(ACTIVITY_PROBE_NAME);
        info!("analytics engine stopped");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MarketType, Side, Tick, TrendDirection};

    fn pair() -> PairId {
        PairId::new("binance", MarketType::Spot, "ETHUSDT")
    }

    fn symbol() -> SymbolConfig {
        SymbolConfig {
            venue: "binance".into(),
            market_type: MarketType::Spot,
            symbol: "ETHUSDT".into(),
            asset_class: crate::types::AssetClass::Major,
            profile_bucket: 0.5,
        }
    }

    fn engine_with_db() -> (AnalyticsEngine, Arc<PairDb>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(ConnectionPool::new(dir.path(), 8));
        let bus = Arc::new(EventBus::new(64, None));
        let engine = AnalyticsEngine::new(
            AnalyticsConfig::default(),
            vec![symbol()],
            pool.clone(),
            bus,
        );
        let db = pool.acquire(&pair()).unwrap();
        (engine, db, dir)
    }

    fn seed_ticks(db: &PairDb, now_ms: i64) {
        // Ten minutes of alternating ticks around 100, buy-heavy.
        for i in 0..200i64 {
            let ts = now_ms - 600_000 + i * 3_000;
            let side = if i % 3 == 0 { Side::Sell } else { Side::Buy };
            let price = 100.0 + (i % 7) as f64 * 0.1;
            db.insert_tick(&Tick {
                timestamp: ts,
                price,
                volume: 1.0,
                side,
                trade_id: format!("t{i}"),
            })
            .unwrap();
        }
    }

    fn seed_candles(db: &PairDb, now_ms: i64) {
        let base = now_ms - now_ms.rem_euclid(60_000);
        for i in 0..40i64 {
            let open_time = base - (40 - i) * 60_000;
            let close = 100.0 + i as f64 * 0.05;
            db.insert_candle(
                Timeframe::M1,
                &Candle {
                    open_time,
                    open: close - 0.05,
                    high: close + 0.1,
                    low: close - 0.15,
                    close,
                    volume: 10.0,
                    buy_volume: 6.0,
                    sell_volume: 4.0,
                },
            )
            .unwrap();
        }
    }

    #[test]
    fn snapshot_assembles_all_fields() {
        let (engine, db, _dir) = engine_with_db();
        let now_ms = Utc::now().timestamp_millis();
        seed_ticks(&db, now_ms);
        seed_candles(&db, now_ms);

        let mut tracker = PairTracker::default();
        let snapshot = engine
            .core
            .compute_snapshot(&db, &symbol(), now_ms, &mut tracker)
            .unwrap();

        assert_eq!(snapshot.pair, pair());
        assert!(snapshot.last_price > 0.0);
        assert!(snapshot.order_flow.buy_volume > snapshot.order_flow.sell_volume);
        assert!(snapshot.order_flow.imbalance.is_some());
        assert!(snapshot.profile.is_some());
        assert!(snapshot.price_stddev_15m > 0.0);
        assert!(snapshot.latest_candle.is_some());
        // A steadily rising candle series trends up on 1m.
        assert_eq!(snapshot.trends.m1, TrendDirection::Up);
        // Watermark advanced.
        assert!(tracker.processed_1m > 0);
    }

    #[test]
    fn snapshot_without_data_errors() {
        let (engine, db, _dir) = engine_with_db();
        let mut tracker = PairTracker::default();
        let result = engine
            .core
            .compute_snapshot(&db, &symbol(), 1_000_000, &mut tracker);
        assert!(result.is_err());
    }

    #[test]
    fn recomputation_without_new_candles_is_stable() {
        let (engine, db, _dir) = engine_with_db();
        let now_ms = Utc::now().timestamp_millis();
        seed_ticks(&db, now_ms);
        seed_candles(&db, now_ms);

        let mut tracker = PairTracker::default();
        let first = engine
            .core
            .compute_snapshot(&db, &symbol(), now_ms, &mut tracker)
            .unwrap();
        let zone_count = first.zones.len();
        let gap_count = first.gaps.len();

        // Second sweep with no new candles: structure must not duplicate.
        let second = engine
            .core
            .compute_snapshot(&db, &symbol(), now_ms, &mut tracker)
            .unwrap();
        assert_eq!(second.zones.len(), zone_count);
        assert_eq!(second.gaps.len(), gap_count);
        assert!(first.content_eq(&second));
    }

    #[tokio::test]
    async fn publish_replaces_cached_snapshot() {
        let (engine, db, _dir) = engine_with_db();
        let now_ms = Utc::now().timestamp_millis();
        seed_ticks(&db, now_ms);
        seed_candles(&db, now_ms);

        let mut tracker = PairTracker::default();
        let snapshot = engine
            .core
            .compute_snapshot(&db, &symbol(), now_ms, &mut tracker)
            .unwrap();

        assert!(engine.snapshot(&pair()).is_none());
        engine.core.maybe_publish(pair(), snapshot.clone()).await;

        let cached = engine.snapshot(&pair()).unwrap();
        assert!(cached.content_eq(&snapshot));
    }
}
