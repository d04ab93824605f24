// =============================================================================
// Meridian Flow Engine — Main Entry Point
// =============================================================================
//
// The engine starts in Demo mode against the built-in paper venue unless the
// config explicitly selects Live. Components communicate only through the
// event bus; startup wires them together and shutdown unwinds them in
// reverse, with the bus stopped last so late events from stopping components
// still flow.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod analytics;
mod binance;
mod bus;
mod config;
mod decision;
mod execution;
mod ingest;
mod monitor;
mod notify;
mod status;
mod storage;
mod types;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::analytics::AnalyticsEngine;
use crate::bus::{Component, Event, EventBus, EventHandler, EventKind};
use crate::config::EngineConfig;
use crate::decision::DecisionEngine;
use crate::execution::{ExecutionEngine, PaperVenue, StaticBalance, VenueAdapter};
use crate::ingest::Ingestor;
use crate::monitor::PositionMonitor;
use crate::notify::{LogTransport, Notifier};
use crate::status::StatusReporter;
use crate::storage::StorageEngine;
use crate::types::AccountMode;

/// Feeds live tick prices into the paper venue so demo-mode market orders
/// fill at the latest mark.
struct PaperMarkFeeder {
    venues: HashMap<String, Arc<PaperVenue>>,
}

#[async_trait]
impl EventHandler for PaperMarkFeeder {
    fn name(&self) -> &'static str {
        "paper_marks"
    }

    async fn handle(&self, event: &Event) -> Result<()> {
        if let Event::TradeTickReceived { pair, tick } = event {
            if let Some(venue) = self.venues.get(&pair.venue) {
                venue.set_mark(&pair.symbol, tick.price);
            }
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║          Meridian Flow Engine — Starting Up              ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = EngineConfig::load("engine_config.json").unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        EngineConfig::default()
    });

    // Override the watched symbols from the environment if provided.
    if let Ok(symbols) = std::env::var("MERIDIAN_SYMBOLS") {
        let wanted: Vec<String> = symbols
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
        if !wanted.is_empty() {
            config.symbols.retain(|s| wanted.contains(&s.symbol));
        }
    }
    if let Ok(dir) = std::env::var("MERIDIAN_DATA_DIR") {
        config.storage.base_dir = dir;
    }

    info!(
        symbols = ?config.symbols.iter().map(|s| s.symbol.clone()).collect::<Vec<_>>(),
        account_mode = %config.account_mode,
        data_dir = %config.storage.base_dir,
        "engine configured"
    );

    // ── 2. Event bus ─────────────────────────────────────────────────────
    let bus = Arc::new(EventBus::new(
        config.bus.queue_capacity,
        config.bus.publish_timeout_ms,
    ));
    bus.start();

    // ── 3. Storage ───────────────────────────────────────────────────────
    let storage = Arc::new(StorageEngine::new(config.storage.clone(), bus.clone()));
    storage.start().await?;
    let pool = storage.pool();

    // ── 4. Venues ────────────────────────────────────────────────────────
    let venue_names: Vec<String> = {
        let mut names: Vec<String> = config.symbols.iter().map(|s| s.venue.clone()).collect();
        names.sort();
        names.dedup();
        names
    };

    let mut venues: HashMap<String, Arc<dyn VenueAdapter>> = HashMap::new();
    let mut paper_venues: HashMap<String, Arc<PaperVenue>> = HashMap::new();

    for name in &venue_names {
        match config.account_mode {
            AccountMode::Live if name == "binance" => {
                let api_key = std::env::var("BINANCE_API_KEY").unwrap_or_default();
                let api_secret = std::env::var("BINANCE_API_SECRET").unwrap_or_default();
                if api_key.is_empty() || api_secret.is_empty() {
                    warn!("live mode without BINANCE_API_KEY/SECRET — falling back to paper");
                    let paper = Arc::new(PaperVenue::new(name.clone()));
                    paper_venues.insert(name.clone(), paper.clone());
                    venues.insert(name.clone(), paper);
                } else {
                    venues.insert(
                        name.clone(),
                        Arc::new(binance::BinanceClient::new(api_key, api_secret)),
                    );
                }
            }
            AccountMode::Live => {
                warn!(venue = %name, "no live adapter for venue — using paper");
                let paper = Arc::new(PaperVenue::new(name.clone()));
                paper_venues.insert(name.clone(), paper.clone());
                venues.insert(name.clone(), paper);
            }
            AccountMode::Demo => {
                let paper = Arc::new(PaperVenue::new(name.clone()));
                paper_venues.insert(name.clone(), paper.clone());
                venues.insert(name.clone(), paper);
            }
        }
    }

    if !paper_venues.is_empty() {
        bus.subscribe(
            EventKind::TradeTickReceived,
            Arc::new(PaperMarkFeeder {
                venues: paper_venues,
            }),
        );
    }

    // ── 5. Position monitor (reconciles on start) ────────────────────────
    let monitor = Arc::new(PositionMonitor::new(
        config.clone(),
        venues.clone(),
        pool.clone(),
        bus.clone(),
    ));
    monitor.start().await?;

    // ── 6. Execution ─────────────────────────────────────────────────────
    let execution = Arc::new(ExecutionEngine::new(
        config.execution.clone(),
        config.decision.min_confluence,
        config.symbols.clone(),
        venues,
        Arc::new(StaticBalance(config.starting_capital)),
        monitor.clone(),
        Some(pool.clone()),
        bus.clone(),
    ));
    execution.start().await?;

    // ── 7. Decision ──────────────────────────────────────────────────────
    let decision = Arc::new(DecisionEngine::new(config.decision.clone(), bus.clone()));
    decision.start().await?;

    // ── 8. Analytics ─────────────────────────────────────────────────────
    let analytics = Arc::new(AnalyticsEngine::new(
        config.analytics.clone(),
        config.symbols.clone(),
        pool.clone(),
        bus.clone(),
    ));
    analytics.start().await?;

    // ── 9. Notifications ─────────────────────────────────────────────────
    let notifier = Arc::new(Notifier::new(Arc::new(LogTransport), bus.clone()));
    notifier.start().await?;

    // ── 10. Ingestion ────────────────────────────────────────────────────
    let ingestor = Arc::new(Ingestor::new(bus.clone()));
    let binance_symbols: Vec<String> = config
        .symbols
        .iter()
        .filter(|s| s.venue == "binance")
        .map(|s| s.symbol.clone())
        .collect();
    if !binance_symbols.is_empty() {
        ingestor.add_stream(Arc::new(binance::BinanceStream::new(binance_symbols)));
    } else {
        warn!("no binance symbols configured — engine idles until a stream is registered");
    }
    ingestor.start().await?;

    // ── 11. Status reporting ─────────────────────────────────────────────
    let reporter = Arc::new(StatusReporter::new(
        config.account_mode,
        bus.clone(),
        pool.clone(),
        monitor.book(),
        execution.orders(),
    ));
    bus.subscribe(EventKind::SystemError, reporter.error_probe());

    let status_reporter = reporter.clone();
    let status_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(60));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let status = status_reporter.build();
            info!(
                uptime_s = status.uptime_s,
                events_processed = status.bus.processed,
                queue_depth = status.bus.queue_depth,
                open_positions = status.open_positions.len(),
                live_orders = status.live_orders,
                pool_open = status.pool.open,
                recent_errors = status.recent_errors.len(),
                "engine status"
            );
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 12. Graceful shutdown ────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");
    status_task.abort();

    // Producers first, consumers after, the bus last.
    let components: Vec<Arc<dyn Component>> = vec![
        ingestor,
        analytics,
        decision,
        execution,
        monitor,
        notifier,
        storage,
    ];
    let window = std::time::Duration::from_secs(config.shutdown_window_s.max(1));
    for component in components {
        match tokio::time::timeout(window, component.stop()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(component = component.name(), error = %e, "component stop failed"),
            Err(_) => error!(component = component.name(), "component stop timed out"),
        }
    }
    bus.stop().await;

    if let Err(e) = config.save("engine_config.json") {
        error!(error = %e, "Failed to save engine config on shutdown");
    }

    info!("Meridian Flow Engine shut down complete.");
    Ok(())
}
