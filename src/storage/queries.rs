// =============================================================================
// Per-pair query templates — the storage read/write API
// =============================================================================
//
// Every function targets a single pair database. Writers batch by reusing one
// acquired `PairDb` for consecutive statements; the connection lock serializes
// them. Read templates are parameterized by lookback and return plain domain
// types.
// =============================================================================

use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension};

use crate::storage::pool::PairDb;
use crate::types::{
    Candle, FairValueGap, GapDirection, GapFill, Order, OrderFlowMetric, MarketProfile, Position,
    Side, Tick, Timeframe, Zone, ZoneKind, ZoneState,
};

/// Aggregate of one order-flow lookback window.
#[derive(Debug, Clone, Default)]
pub struct FlowWindow {
    pub buy_volume: f64,
    pub sell_volume: f64,
    pub cvd: f64,
    pub net_volume: f64,
}

/// Retention cutoffs applied by the cleanup task, all in milliseconds.
#[derive(Debug, Clone)]
pub struct RetentionWindows {
    pub tick_ms: i64,
    pub candle_1m_ms: i64,
    pub candle_htf_ms: i64,
    pub order_flow_ms: i64,
    pub profile_ms: i64,
    pub gap_ms: i64,
    pub max_zones: usize,
}

impl PairDb {
    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    pub fn insert_tick(&self, tick: &Tick) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "INSERT INTO ticks (timestamp, price, volume, side, trade_id)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    tick.timestamp,
                    tick.price,
                    tick.volume,
                    tick.side.as_str(),
                    tick.trade_id
                ],
            )
            .context("tick insert failed")?;
        Ok(())
    }

    pub fn insert_candle(&self, timeframe: Timeframe, candle: &Candle) -> Result<()> {
        let sql = format!(
            "INSERT OR REPLACE INTO {} (open_time, open, high, low, close, volume, buy_volume, sell_volume)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            timeframe.table()
        );
        self.conn
            .lock()
            .execute(
                &sql,
                params![
                    candle.open_time,
                    candle.open,
                    candle.high,
                    candle.low,
                    candle.close,
                    candle.volume,
                    candle.buy_volume,
                    candle.sell_volume
                ],
            )
            .context("candle insert failed")?;
        Ok(())
    }

    pub fn insert_order_flow(&self, metric: &OrderFlowMetric) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "INSERT INTO order_flow (timestamp, cvd, imbalance, buy_volume, sell_volume, net_volume)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    metric.timestamp,
                    metric.cvd,
                    metric.imbalance,
                    metric.buy_volume,
                    metric.sell_volume,
                    metric.net_volume
                ],
            )
            .context("order_flow insert failed")?;
        Ok(())
    }

    pub fn insert_market_profile(&self, profile: &MarketProfile, histogram_json: &str) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "INSERT INTO market_profile (timestamp, poc, vah, val, histogram_blob)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    profile.timestamp,
                    profile.poc,
                    profile.vah,
                    profile.val,
                    histogram_json
                ],
            )
            .context("market_profile insert failed")?;
        Ok(())
    }

    /// Insert a newly detected zone and return its row id.
    pub fn insert_zone(&self, zone: &Zone) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO supply_demand_zones (type, price_low, price_high, strength, test_count, state, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                zone.kind.as_str(),
                zone.price_low,
                zone.price_high,
                zone.strength,
                zone.test_count,
                zone.state.as_str(),
                zone.created_at
            ],
        )
        .context("zone insert failed")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn update_zone(&self, id: i64, test_count: u32, state: ZoneState) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "UPDATE supply_demand_zones SET test_count = ?2, state = ?3 WHERE id = ?1",
                params![id, test_count, state.as_str()],
            )
            .context("zone update failed")?;
        Ok(())
    }

    /// Insert a newly detected gap and return its row id.
    pub fn insert_gap(&self, gap: &FairValueGap) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO fair_value_gaps (direction, gap_low, gap_high, fill_pct, filled, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                gap.direction.as_str(),
                gap.gap_low,
                gap.gap_high,
                gap.fill_pct,
                gap.fill.as_str(),
                gap.created_at
            ],
        )
        .context("gap insert failed")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn update_gap(&self, id: i64, fill_pct: f64, fill: GapFill) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "UPDATE fair_value_gaps SET fill_pct = ?2, filled = ?3 WHERE id = ?1",
                params![id, fill_pct, fill.as_str()],
            )
            .context("gap update failed")?;
        Ok(())
    }

    /// Execution-local position audit row. The authoritative position store
    /// is the monitor; this exists for post-mortem queries only.
    pub fn upsert_position_audit(&self, position: &Position) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "INSERT OR REPLACE INTO positions (id, direction, entry_price, quantity, entry_time, state, exit_reason, realized_pnl)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    position.id,
                    position.direction.to_string(),
                    position.entry_price,
                    position.quantity,
                    position.entry_time.timestamp_millis(),
                    position.state.to_string(),
                    position.exit_reason.map(|r| r.to_string()),
                    position.realized_pnl
                ],
            )
            .context("position audit upsert failed")?;
        Ok(())
    }

    pub fn upsert_trade_history(&self, order: &Order) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "INSERT OR REPLACE INTO trades_history (id, client_id, direction, order_type, quantity, filled_qty, avg_fill_price, state, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    order.id,
                    order.client_id,
                    order.direction.to_string(),
                    order.order_type.to_string(),
                    order.quantity,
                    order.filled_qty,
                    order.avg_fill_price,
                    order.state.to_string(),
                    order.created_at.timestamp_millis(),
                    order.updated_at.timestamp_millis()
                ],
            )
            .context("trade history upsert failed")?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Reads — ticks and candles
    // -------------------------------------------------------------------------

    /// Ticks at or after `since_ms`, oldest first.
    pub fn recent_ticks(&self, since_ms: i64) -> Result<Vec<Tick>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT timestamp, price, volume, side, trade_id
                 FROM ticks WHERE timestamp >= ?1 ORDER BY timestamp ASC",
            )
            .context("recent_ticks prepare failed")?;

        let rows = stmt
            .query_map(params![since_ms], |row| {
                let side: String = row.get(3)?;
                Ok(Tick {
                    timestamp: row.get(0)?,
                    price: row.get(1)?,
                    volume: row.get(2)?,
                    side: Side::parse(&side).unwrap_or(Side::Buy),
                    trade_id: row.get(4)?,
                })
            })
            .context("recent_ticks query failed")?;

        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("recent_ticks row decode failed")
    }

    /// The newest `limit` candles of `timeframe`, oldest first.
    pub fn recent_candles(&self, timeframe: Timeframe, limit: usize) -> Result<Vec<Candle>> {
        let sql = format!(
            "SELECT open_time, open, high, low, close, volume, buy_volume, sell_volume
             FROM {} ORDER BY open_time DESC LIMIT ?1",
            timeframe.table()
        );
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql).context("recent_candles prepare failed")?;

        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok(Candle {
                    open_time: row.get(0)?,
                    open: row.get(1)?,
                    high: row.get(2)?,
                    low: row.get(3)?,
                    close: row.get(4)?,
                    volume: row.get(5)?,
                    buy_volume: row.get(6)?,
                    sell_volume: row.get(7)?,
                })
            })
            .context("recent_candles query failed")?;

        let mut candles = rows
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("recent_candles row decode failed")?;
        candles.reverse();
        Ok(candles)
    }

    /// Close prices of the newest `limit` candles, oldest first.
    pub fn closes(&self, timeframe: Timeframe, limit: usize) -> Result<Vec<f64>> {
        Ok(self
            .recent_candles(timeframe, limit)?
            .iter()
            .map(|c| c.close)
            .collect())
    }

    // -------------------------------------------------------------------------
    // Reads — flow and structure
    // -------------------------------------------------------------------------

    /// Per-side volume aggregate over ticks at or after `since_ms`.
    pub fn flow_window(&self, since_ms: i64) -> Result<FlowWindow> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT
                    COALESCE(SUM(CASE WHEN side = 'BUY'  THEN volume END), 0),
                    COALESCE(SUM(CASE WHEN side = 'SELL' THEN volume END), 0)
                 FROM ticks WHERE timestamp >= ?1",
                params![since_ms],
                |row| {
                    let buy: f64 = row.get(0)?;
                    let sell: f64 = row.get(1)?;
                    Ok((buy, sell))
                },
            )
            .context("flow_window query failed")?;

        let (buy_volume, sell_volume) = row;
        Ok(FlowWindow {
            buy_volume,
            sell_volume,
            cvd: buy_volume - sell_volume,
            net_volume: buy_volume - sell_volume,
        })
    }

    /// Stored order-flow metrics at or after `since_ms`, oldest first. Used by
    /// the dump detector to spot dominance flips.
    pub fn order_flow_history(&self, since_ms: i64) -> Result<Vec<OrderFlowMetric>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT timestamp, cvd, imbalance, buy_volume, sell_volume, net_volume
                 FROM order_flow WHERE timestamp >= ?1 ORDER BY timestamp ASC",
            )
            .context("order_flow_history prepare failed")?;

        let rows = stmt
            .query_map(params![since_ms], |row| {
                Ok(OrderFlowMetric {
                    timestamp: row.get(0)?,
                    cvd: row.get(1)?,
                    imbalance: row.get(2)?,
                    buy_volume: row.get(3)?,
                    sell_volume: row.get(4)?,
                    net_volume: row.get(5)?,
                    large_trades: 0,
                })
            })
            .context("order_flow_history query failed")?;

        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("order_flow_history row decode failed")
    }

    /// Highest and lowest tick price at or after `since_ms`, if any ticks
    /// exist in the window.
    pub fn recent_extreme(&self, since_ms: i64) -> Result<Option<(f64, f64)>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT MAX(price), MIN(price) FROM ticks WHERE timestamp >= ?1",
            params![since_ms],
            |row| {
                let high: Option<f64> = row.get(0)?;
                let low: Option<f64> = row.get(1)?;
                Ok(high.zip(low))
            },
        )
        .context("recent_extreme query failed")
    }

    /// Volume-by-price histogram over ticks at or after `since_ms`, bucketed
    /// by `bucket` price units. Returns (bucket_floor_price, volume) sorted by
    /// price ascending.
    pub fn volume_by_price(&self, since_ms: i64, bucket: f64) -> Result<Vec<(f64, f64)>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT CAST(price / ?2 AS INTEGER) AS b, SUM(volume)
                 FROM ticks WHERE timestamp >= ?1
                 GROUP BY b ORDER BY b ASC",
            )
            .context("volume_by_price prepare failed")?;

        let rows = stmt
            .query_map(params![since_ms, bucket], |row| {
                let b: i64 = row.get(0)?;
                let volume: f64 = row.get(1)?;
                Ok((b as f64 * bucket, volume))
            })
            .context("volume_by_price query failed")?;

        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("volume_by_price row decode failed")
    }

    /// All zones not yet broken, newest first.
    pub fn active_zones(&self) -> Result<Vec<Zone>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, type, price_low, price_high, strength, test_count, state, created_at
                 FROM supply_demand_zones WHERE state != 'BROKEN' ORDER BY created_at DESC",
            )
            .context("active_zones prepare failed")?;

        let rows = stmt
            .query_map([], |row| {
                let kind: String = row.get(1)?;
                let state: String = row.get(6)?;
                Ok(Zone {
                    id: row.get(0)?,
                    kind: ZoneKind::parse(&kind).unwrap_or(ZoneKind::Demand),
                    price_low: row.get(2)?,
                    price_high: row.get(3)?,
                    strength: row.get(4)?,
                    test_count: row.get(5)?,
                    state: ZoneState::parse(&state).unwrap_or(ZoneState::Fresh),
                    created_at: row.get(7)?,
                })
            })
            .context("active_zones query failed")?;

        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("active_zones row decode failed")
    }

    /// Gaps not yet fully filled, newest first.
    pub fn open_gaps(&self) -> Result<Vec<FairValueGap>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, direction, gap_low, gap_high, fill_pct, filled, created_at
                 FROM fair_value_gaps WHERE filled != 'FILLED' ORDER BY created_at DESC",
            )
            .context("open_gaps prepare failed")?;

        let rows = stmt
            .query_map([], |row| {
                let direction: String = row.get(1)?;
                let fill: String = row.get(5)?;
                Ok(FairValueGap {
                    id: row.get(0)?,
                    direction: GapDirection::parse(&direction).unwrap_or(GapDirection::Bullish),
                    gap_low: row.get(2)?,
                    gap_high: row.get(3)?,
                    fill_pct: row.get(4)?,
                    fill: GapFill::parse(&fill).unwrap_or(GapFill::Unfilled),
                    created_at: row.get(6)?,
                })
            })
            .context("open_gaps query failed")?;

        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("open_gaps row decode failed")
    }

    /// The latest closed candle of `timeframe`, if any.
    pub fn latest_candle(&self, timeframe: Timeframe) -> Result<Option<Candle>> {
        let sql = format!(
            "SELECT open_time, open, high, low, close, volume, buy_volume, sell_volume
             FROM {} ORDER BY open_time DESC LIMIT 1",
            timeframe.table()
        );
        let conn = self.conn.lock();
        conn.query_row(&sql, [], |row| {
            Ok(Candle {
                open_time: row.get(0)?,
                open: row.get(1)?,
                high: row.get(2)?,
                low: row.get(3)?,
                close: row.get(4)?,
                volume: row.get(5)?,
                buy_volume: row.get(6)?,
                sell_volume: row.get(7)?,
            })
        })
        .optional()
        .context("latest_candle query failed")
    }

    // -------------------------------------------------------------------------
    // Retention
    // -------------------------------------------------------------------------

    /// Delete rows older than the given cutoffs. Returns total rows removed.
    pub fn apply_retention(&self, now_ms: i64, windows: &RetentionWindows) -> Result<usize> {
        let conn = self.conn.lock();
        let mut removed = 0usize;

        removed += conn
            .execute(
                "DELETE FROM ticks WHERE timestamp < ?1",
                params![now_ms - windows.tick_ms],
            )
            .context("tick retention failed")?;

        removed += conn
            .execute(
                "DELETE FROM candles_1m WHERE open_time < ?1",
                params![now_ms - windows.candle_1m_ms],
            )
            .context("1m candle retention failed")?;

        for table in ["candles_5m", "candles_15m"] {
            removed += conn
                .execute(
                    &format!("DELETE FROM {table} WHERE open_time < ?1"),
                    params![now_ms - windows.candle_htf_ms],
                )
                .context("htf candle retention failed")?;
        }

        removed += conn
            .execute(
                "DELETE FROM order_flow WHERE timestamp < ?1",
                params![now_ms - windows.order_flow_ms],
            )
            .context("order_flow retention failed")?;

        removed += conn
            .execute(
                "DELETE FROM market_profile WHERE timestamp < ?1",
                params![now_ms - windows.profile_ms],
            )
            .context("market_profile retention failed")?;

        // Broken zones go immediately; beyond that, keep only the newest
        // `max_zones` per pair.
        removed += conn
            .execute("DELETE FROM supply_demand_zones WHERE state = 'BROKEN'", [])
            .context("broken zone retention failed")?;
        removed += conn
            .execute(
                "DELETE FROM supply_demand_zones WHERE id NOT IN
                 (SELECT id FROM supply_demand_zones ORDER BY created_at DESC, id DESC LIMIT ?1)",
                params![windows.max_zones as i64],
            )
            .context("zone cap retention failed")?;

        // Gaps go when filled or stale.
        removed += conn
            .execute(
                "DELETE FROM fair_value_gaps WHERE filled = 'FILLED' OR created_at < ?1",
                params![now_ms - windows.gap_ms],
            )
            .context("gap retention failed")?;

        Ok(removed)
    }

    /// Count ticks older than the retention cutoff. Used to verify cleanup.
    pub fn stale_tick_count(&self, now_ms: i64, tick_retention_ms: i64) -> Result<i64> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT COUNT(*) FROM ticks WHERE timestamp < ?1",
            params![now_ms - tick_retention_ms],
            |row| row.get(0),
        )
        .context("stale_tick_count query failed")
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MarketType, PairId};

    fn db() -> PairDb {
        PairDb::open_in_memory(&PairId::new("binance", MarketType::Spot, "BTCUSDT")).unwrap()
    }

    fn tick(ts: i64, price: f64, volume: f64, side: Side) -> Tick {
        Tick {
            timestamp: ts,
            price,
            volume,
            side,
            trade_id: format!("t{ts}"),
        }
    }

    fn candle(open_time: i64, close: f64) -> Candle {
        Candle {
            open_time,
            open: close - 1.0,
            high: close + 1.0,
            low: close - 2.0,
            close,
            volume: 10.0,
            buy_volume: 6.0,
            sell_volume: 4.0,
        }
    }

    #[test]
    fn ticks_round_trip_in_order() {
        let db = db();
        db.insert_tick(&tick(300, 101.0, 1.0, Side::Sell)).unwrap();
        db.insert_tick(&tick(100, 100.0, 2.0, Side::Buy)).unwrap();
        db.insert_tick(&tick(200, 100.5, 3.0, Side::Buy)).unwrap();

        let ticks = db.recent_ticks(0).unwrap();
        assert_eq!(ticks.len(), 3);
        assert_eq!(ticks[0].timestamp, 100);
        assert_eq!(ticks[2].timestamp, 300);
        assert_eq!(ticks[0].side, Side::Buy);

        // Lookback excludes older rows.
        let ticks = db.recent_ticks(150).unwrap();
        assert_eq!(ticks.len(), 2);
    }

    #[test]
    fn candle_insert_is_upsert_on_open_time() {
        let db = db();
        db.insert_candle(Timeframe::M1, &candle(60_000, 100.0)).unwrap();
        db.insert_candle(Timeframe::M1, &candle(60_000, 105.0)).unwrap();

        let candles = db.recent_candles(Timeframe::M1, 10).unwrap();
        assert_eq!(candles.len(), 1);
        assert!((candles[0].close - 105.0).abs() < f64::EPSILON);
    }

    #[test]
    fn flow_window_aggregates_by_side() {
        let db = db();
        db.insert_tick(&tick(100, 100.0, 35.0, Side::Buy)).unwrap();
        db.insert_tick(&tick(200, 100.0, 10.0, Side::Sell)).unwrap();

        let flow = db.flow_window(0).unwrap();
        assert!((flow.buy_volume - 35.0).abs() < f64::EPSILON);
        assert!((flow.sell_volume - 10.0).abs() < f64::EPSILON);
        assert!((flow.cvd - 25.0).abs() < f64::EPSILON);
    }

    #[test]
    fn flow_window_empty_is_zero() {
        let db = db();
        let flow = db.flow_window(0).unwrap();
        assert_eq!(flow.buy_volume, 0.0);
        assert_eq!(flow.sell_volume, 0.0);
    }

    #[test]
    fn volume_by_price_buckets() {
        let db = db();
        db.insert_tick(&tick(1, 100.04, 5.0, Side::Buy)).unwrap();
        db.insert_tick(&tick(2, 100.06, 3.0, Side::Sell)).unwrap();
        db.insert_tick(&tick(3, 100.14, 2.0, Side::Buy)).unwrap();

        let histogram = db.volume_by_price(0, 0.1).unwrap();
        assert_eq!(histogram.len(), 2);
        // 100.04 and 100.06 share the 100.0 bucket.
        assert!((histogram[0].1 - 8.0).abs() < f64::EPSILON);
        assert!((histogram[1].1 - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn zone_lifecycle_updates() {
        let db = db();
        let zone = Zone {
            id: 0,
            kind: ZoneKind::Demand,
            price_low: 99.0,
            price_high: 100.0,
            strength: 2.5,
            test_count: 0,
            state: ZoneState::Fresh,
            created_at: 1_000,
        };
        let id = db.insert_zone(&zone).unwrap();

        db.update_zone(id, 1, ZoneState::Tested).unwrap();
        let zones = db.active_zones().unwrap();
        assert_eq!(zones.len(), 1);
        assert_eq!(zones[0].test_count, 1);
        assert_eq!(zones[0].state, ZoneState::Tested);

        db.update_zone(id, 3, ZoneState::Broken).unwrap();
        assert!(db.active_zones().unwrap().is_empty());
    }

    #[test]
    fn gap_lifecycle_and_open_filter() {
        let db = db();
        let gap = FairValueGap {
            id: 0,
            direction: GapDirection::Bullish,
            gap_low: 98.5,
            gap_high: 99.5,
            fill_pct: 0.0,
            fill: GapFill::Unfilled,
            created_at: 1_000,
        };
        let id = db.insert_gap(&gap).unwrap();

        db.update_gap(id, 40.0, GapFill::Partial).unwrap();
        let open = db.open_gaps().unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].fill, GapFill::Partial);

        db.update_gap(id, 100.0, GapFill::Filled).unwrap();
        assert!(db.open_gaps().unwrap().is_empty());
    }

    fn windows() -> RetentionWindows {
        RetentionWindows {
            tick_ms: 10_000,
            candle_1m_ms: 10_000,
            candle_htf_ms: 10_000,
            order_flow_ms: 10_000,
            profile_ms: 10_000,
            gap_ms: 10_000_000,
            max_zones: 50,
        }
    }

    #[test]
    fn retention_removes_only_stale_rows() {
        let db = db();
        let now = 1_000_000;
        db.insert_tick(&tick(now - 20_000, 100.0, 1.0, Side::Buy)).unwrap();
        db.insert_tick(&tick(now - 5_000, 100.0, 1.0, Side::Buy)).unwrap();

        db.apply_retention(now, &windows()).unwrap();

        let ticks = db.recent_ticks(0).unwrap();
        assert_eq!(ticks.len(), 1);
        assert_eq!(ticks[0].timestamp, now - 5_000);
        assert_eq!(db.stale_tick_count(now, 10_000).unwrap(), 0);
    }

    #[test]
    fn retention_caps_zone_count() {
        let db = db();
        for i in 0..60 {
            let zone = Zone {
                id: 0,
                kind: ZoneKind::Supply,
                price_low: 100.0 + i as f64,
                price_high: 101.0 + i as f64,
                strength: 1.0,
                test_count: 0,
                state: ZoneState::Fresh,
                created_at: i,
            };
            db.insert_zone(&zone).unwrap();
        }

        db.apply_retention(1_000_000, &windows()).unwrap();

        let zones = db.active_zones().unwrap();
        assert_eq!(zones.len(), 50);
        // Newest survive.
        assert_eq!(zones[0].created_at, 59);
    }

    #[test]
    fn recent_extreme_tracks_window() {
        let db = db();
        assert!(db.recent_extreme(0).unwrap().is_none());

        db.insert_tick(&tick(100, 100.0, 1.0, Side::Buy)).unwrap();
        db.insert_tick(&tick(200, 105.0, 1.0, Side::Buy)).unwrap();
        db.insert_tick(&tick(300, 95.0, 1.0, Side::Sell)).unwrap();

        let (high, low) = db.recent_extreme(0).unwrap().unwrap();
        assert!((high - 105.0).abs() < f64::EPSILON);
        assert!((low - 95.0).abs() < f64::EPSILON);
    }

    #[test]
    fn latest_candle_returns_newest() {
        let db = db();
        assert!(db.latest_candle(Timeframe::M1).unwrap().is_none());

        db.insert_candle(Timeframe::M1, &candle(60_000, 100.0)).unwrap();
        db.insert_candle(Timeframe::M1, &candle(120_000, 101.0)).unwrap();

        let latest = db.latest_candle(Timeframe::M1).unwrap().unwrap();
        assert_eq!(latest.open_time, 120_000);
    }
}
