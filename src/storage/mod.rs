// =============================================================================
// Storage Engine — per-pair persistence with retention
// =============================================================================
//
// Reactive writer: subscribes to market-data events and persists them into
// the pair database addressed by the event's pair identity.
//
// Always-on cleanup: a background loop enforces the retention policy every
// cleanup interval, skipping a cycle when the previous one still runs.
// =============================================================================

pub mod pool;
pub mod queries;
pub mod schema;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

use crate::bus::{Component, Event, EventBus, EventHandler, EventKind, Shutdown};
use crate::config::StorageConfig;

pub use pool::{ConnectionPool, PairDb, PoolStats};
pub use queries::{FlowWindow, RetentionWindows};

/// Name under which the writer subscribes; also the component tag on
/// surfaced storage errors.
const WRITER_NAME: &str = "storage";

// ---------------------------------------------------------------------------
// Reactive writer
// ---------------------------------------------------------------------------

/// Persists market-data events. Acquire failures retry once inside the pool;
/// errors returned here surface as `SystemError(component="storage")` at the
/// bus boundary.
struct MarketDataWriter {
    pool: Arc<ConnectionPool>,
}

#[async_trait]
impl EventHandler for MarketDataWriter {
    fn name(&self) -> &'static str {
        WRITER_NAME
    }

    async fn handle(&self, event: &Event) -> Result<()> {
        match event {
            Event::TradeTickReceived { pair, tick } => {
                let db = self
                    .pool
                    .acquire(pair)
                    .with_context(|| format!("acquire failed for {pair}"))?;
                db.insert_tick(tick)
                    .with_context(|| format!("tick write failed for {pair}"))?;
            }
            Event::CandleCompleted {
                pair,
                timeframe,
                candle,
            } => {
                let db = self
                    .pool
                    .acquire(pair)
                    .with_context(|| format!("acquire failed for {pair}"))?;
                db.insert_candle(*timeframe, candle)
                    .with_context(|| format!("candle write failed for {pair}"))?;
            }
            _ => {}
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// StorageEngine
// ---------------------------------------------------------------------------

pub struct StorageEngine {
    config: StorageConfig,
    pool: Arc<ConnectionPool>,
    bus: Arc<EventBus>,
    shutdown: Shutdown,
    cleanup_running: Arc<AtomicBool>,
    cleanup_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl StorageEngine {
    pub fn new(config: StorageConfig, bus: Arc<EventBus>) -> Self {
        let pool = Arc::new(ConnectionPool::new(
            config.base_dir.clone(),
            config.pool_size,
        ));
        Self {
            config,
            pool,
            bus,
            shutdown: Shutdown::new(),
            cleanup_running: Arc::new(AtomicBool::new(false)),
            cleanup_task: Mutex::new(None),
        }
    }

    /// Shared connection pool, used by analytics reads and the dump detector.
    pub fn pool(&self) -> Arc<ConnectionPool> {
        self.pool.clone()
    }

    fn retention_windows(&self) -> RetentionWindows {
        RetentionWindows {
            tick_ms: self.config.tick_retention_s * 1000,
            candle_1m_ms: self.config.candle_1m_retention_s * 1000,
            candle_htf_ms: self.config.candle_htf_retention_s * 1000,
            order_flow_ms: self.config.order_flow_retention_s * 1000,
            profile_ms: self.config.profile_retention_s * 1000,
            gap_ms: self.config.gap_retention_s * 1000,
            max_zones: self.config.max_zones_per_pair,
        }
    }

    /// Run one retention pass over every open pair database.
    fn run_cleanup(pool: &ConnectionPool, windows: &RetentionWindows) {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let mut removed = 0usize;
        let mut pairs = 0usize;

        for db in pool.open_pairs() {
            match db.apply_retention(now_ms, windows) {
                Ok(n) => {
                    removed += n;
                    pairs += 1;
                }
                Err(e) => {
                    warn!(pair = %db.pair(), error = %e, "retention pass failed for pair");
                }
            }
        }

        debug!(pairs, removed, "retention pass complete");
    }
}

#[async_trait]
impl Component for StorageEngine {
    fn name(&self) -> &'static str {
        "storage"
    }

    async fn start(&self) -> Result<()> {
        let writer = Arc::new(MarketDataWriter {
            pool: self.pool.clone(),
        });
        self.bus.subscribe_many(
            &[EventKind::TradeTickReceived, EventKind::CandleCompleted],
            writer,
        );

        let pool = self.pool.clone();
        let windows = self.retention_windows();
        let running = self.cleanup_running.clone();
        let shutdown = self.shutdown.clone();
        let period = Duration::from_secs(self.config.cleanup_interval_s.max(1));

        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            // The immediate first tick would race startup writes.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = ticker.tick() => {
                        if running.swap(true, Ordering::SeqCst) {
                            warn!("retention pass still running — skipping cycle");
                            continue;
                        }
                        let pool = pool.clone();
                        let windows = windows.clone();
                        let running = running.clone();
                        let result = tokio::task::spawn_blocking(move || {
                            StorageEngine::run_cleanup(&pool, &windows);
                            running.store(false, Ordering::SeqCst);
                        })
                        .await;
                        if result.is_err() {
                            warn!("retention task panicked");
                        }
                    }
                }
            }
            info!("storage cleanup loop stopped");
        });
        *self.cleanup_task.lock() = Some(handle);

        info!(
            base_dir = %self.config.base_dir,
            pool_size = self.config.pool_size,
            cleanup_interval_s = self.config.cleanup_interval_s,
            "storage engine started"
        );
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.shutdown.trigger();
        let handle = self.cleanup_task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.bus.unsubscribe(WRITER_NAME);
        self.pool.close_all();
        info!("storage engine stopped");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MarketType, PairId, Side, Tick};

    fn pair() -> PairId {
        PairId::new("binance", MarketType::Spot, "BTCUSDT")
    }

    fn test_config(dir: &std::path::Path) -> StorageConfig {
        StorageConfig {
            base_dir: dir.to_string_lossy().into_owned(),
            ..StorageConfig::default()
        }
    }

    #[tokio::test]
    async fn writer_persists_ticks_from_bus_events() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(EventBus::new(64, None));
        let storage = Arc::new(StorageEngine::new(test_config(dir.path()), bus.clone()));

        storage.start().await.unwrap();
        bus.start();

        let tick = Tick {
            timestamp: 1_000,
            price: 100.0,
            volume: 2.0,
            side: Side::Buy,
            trade_id: "t1".into(),
        };
        bus.publish(Event::TradeTickReceived {
            pair: pair(),
            tick,
        })
        .await;

        // Let the dispatcher deliver.
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(2)).await;
            if bus.stats().queue_depth == 0 {
                break;
            }
        }

        let db = storage.pool().acquire(&pair()).unwrap();
        let ticks = db.recent_ticks(0).unwrap();
        assert_eq!(ticks.len(), 1);
        assert_eq!(ticks[0].trade_id, "t1");

        bus.stop().await;
        storage.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_is_clean_without_traffic() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(EventBus::new(8, None));
        let storage = StorageEngine::new(test_config(dir.path()), bus.clone());

        storage.start().await.unwrap();
        storage.stop().await.unwrap();
    }
}
