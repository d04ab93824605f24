// =============================================================================
// Ingestion — venue stream contract, tick normalization, candle aggregation
// =============================================================================
//
// Concrete venue streams (exchange WebSockets, DEX subscriptions, mempool
// decoders) live outside the core; they implement `MarketStream` and push raw
// trades into the ingestor. The ingestor normalizes each trade into a `Tick`,
// publishes `TradeTickReceived`, folds ticks into 1m/5m/15m candles, and
// publishes `CandleCompleted` when a bucket closes.
//
// Side convention: venues that do not report the taker side (typically
// on-chain swaps) are normalized to BUY here. This is ingestion-layer policy;
// analytics consumes the side as given and never reclassifies.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::bus::{Component, Event, EventBus, Shutdown};
use crate::types::{Candle, PairId, Side, Tick, Timeframe};

/// Reconnect delay after a stream error.
const RECONNECT_DELAY_SECS: u64 = 5;

// ---------------------------------------------------------------------------
// Venue stream contract
// ---------------------------------------------------------------------------

/// A raw trade as reported by a venue, before normalization.
#[derive(Debug, Clone)]
pub struct RawTrade {
    pub pair: PairId,
    /// Milliseconds since the UNIX epoch.
    pub timestamp: i64,
    pub price: f64,
    pub quantity: f64,
    /// Taker side when the venue reports one. `None` defaults to BUY.
    pub taker_side: Option<Side>,
    pub trade_id: String,
}

/// One live market-data connection. Implementations are external; `run`
/// returns when the stream disconnects or errors, and the ingestor handles
/// reconnection.
#[async_trait]
pub trait MarketStream: Send + Sync {
    fn venue(&self) -> &str;
    async fn run(&self, sink: mpsc::Sender<RawTrade>) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Candle aggregation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct CandleBuild {
    candle: Candle,
}

impl CandleBuild {
    fn seed(open_time: i64, tick: &Tick) -> Self {
        let (buy, sell) = match tick.side {
            Side::Buy => (tick.volume, 0.0),
            Side::Sell => (0.0, tick.volume),
        };
        Self {
            candle: Candle {
                open_time,
                open: tick.price,
                high: tick.price,
                low: tick.price,
                close: tick.price,
                volume: tick.volume,
                buy_volume: buy,
                sell_volume: sell,
            },
        }
    }

    fn absorb(&mut self, tick: &Tick) {
        let c = &mut self.candle;
        c.high = c.high.max(tick.price);
        c.low = c.low.min(tick.price);
        c.close = tick.price;
        c.volume += tick.volume;
        match tick.side {
            Side::Buy => c.buy_volume += tick.volume,
            Side::Sell => c.sell_volume += tick.volume,
        }
    }
}

/// Folds ticks into candles per (pair, timeframe). A candle completes when a
/// tick lands in a later bucket; out-of-order ticks older than the current
/// bucket are dropped with a warning.
pub struct CandleAggregator {
    building: Mutex<HashMap<(PairId, Timeframe), CandleBuild>>,
}

impl CandleAggregator {
    pub fn new() -> Self {
        Self {
            building: Mutex::new(HashMap::new()),
        }
    }

    /// Fold one tick. Returns the candles completed by this tick, if any.
    pub fn absorb(&self, pair: &PairId, tick: &Tick) -> Vec<(Timeframe, Candle)> {
        let mut completed = Vec::new();
        let mut building = self.building.lock();

        for tf in Timeframe::ALL {
            let bucket = tick.timestamp - tick.timestamp.rem_euclid(tf.millis());
            let key = (pair.clone(), tf);

            match building.get_mut(&key) {
                Some(build) if build.candle.open_time == bucket => build.absorb(tick),
                Some(build) if build.candle.open_time < bucket => {
                    let done = build.candle.clone();
                    *build = CandleBuild::seed(bucket, tick);
                    completed.push((tf, done));
                }
                Some(build) => {
                    warn!(
                        pair = %pair,
                        timeframe = %tf,
                        tick_ts = tick.timestamp,
                        bucket_open = build.candle.open_time,
                        "dropping out-of-order tick older than current bucket"
                    );
                }
                None => {
                    building.insert(key, CandleBuild::seed(bucket, tick));
                }
            }
        }

        completed
    }
}

impl Default for CandleAggregator {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Ingestor
// ---------------------------------------------------------------------------

/// Always-on component that owns every configured market stream.
pub struct Ingestor {
    bus: Arc<EventBus>,
    streams: Mutex<Vec<Arc<dyn MarketStream>>>,
    aggregator: Arc<CandleAggregator>,
    shutdown: Shutdown,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Ingestor {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            bus,
            streams: Mutex::new(Vec::new()),
            aggregator: Arc::new(CandleAggregator::new()),
            shutdown: Shutdown::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Register a venue stream. Call before `start`.
    pub fn add_stream(&self, stream: Arc<dyn MarketStream>) {
        self.streams.lock().push(stream);
    }

    /// Normalize one raw trade and publish the resulting events. Exposed so
    /// replay tooling and tests can inject trades without a live stream.
    pub async fn ingest(
        bus: &EventBus,
        aggregator: &CandleAggregator,
        raw: RawTrade,
    ) {
        let tick = Tick {
            timestamp: raw.timestamp,
            price: raw.price,
            volume: raw.quantity,
            // BUY-default for venues that omit the taker side.
            side: raw.taker_side.unwrap_or(Side::Buy),
            trade_id: raw.trade_id,
        };

        for (timeframe, candle) in aggregator.absorb(&raw.pair, &tick) {
            bus.publish(Event::CandleCompleted {
                pair: raw.pair.clone(),
                timeframe,
                candle,
            })
            .await;
        }

        bus.publish(Event::TradeTickReceived {
            pair: raw.pair,
            tick,
        })
        .await;
    }
}

#[async_trait]
impl Component for Ingestor {
    fn name(&self) -> &'static str {
        "ingestor"
    }

    async fn start(&self) -> Result<()> {
        let streams = self.streams.lock().clone();
        let mut tasks = self.tasks.lock();

        for stream in streams {
            let bus = self.bus.clone();
            let aggregator = self.aggregator.clone();
            let shutdown = self.shutdown.clone();
            let venue = stream.venue().to_string();

            tasks.push(tokio::spawn(async move {
                loop {
                    if shutdown.is_triggered() {
                        break;
                    }

                    let (tx, mut rx) = mpsc::channel::<RawTrade>(1024);
                    let runner = stream.run(tx);
                    tokio::pin!(runner);

                    let disconnected_at = loop {
                        tokio::select! {
                            _ = shutdown.wait() => return,
                            maybe = rx.recv() => match maybe {
                                Some(raw) => Ingestor::ingest(&bus, &aggregator, raw).await,
                                None => break Utc::now(),
                            },
                            result = &mut runner => {
                                if let Err(e) = result {
                                    error!(venue = %venue, error = %e, "market stream error");
                                }
                                // Drain trades already queued by the stream.
                                while let Ok(raw) = rx.try_recv() {
                                    Ingestor::ingest(&bus, &aggregator, raw).await;
                                }
                                break Utc::now();
                            }
                        }
                    };

                    bus.publish(Event::MarketDataConnectionLost {
                        venue: venue.clone(),
                        since: disconnected_at,
                    })
                    .await;

                    warn!(
                        venue = %venue,
                        delay_secs = RECONNECT_DELAY_SECS,
                        "market stream disconnected — reconnecting"
                    );
                    tokio::select! {
                        _ = shutdown.wait() => return,
                        _ = tokio::time::sleep(std::time::Duration::from_secs(RECONNECT_DELAY_SECS)) => {}
                    }
                }
            }));
        }

        info!(streams = tasks.len(), "ingestor started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.shutdown.trigger();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        info!("ingestor stopped");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
