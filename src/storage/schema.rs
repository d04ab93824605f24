// =============================================================================
// Per-pair database schema
// =============================================================================
//
// One database file per trading pair. Symbol identity is encoded by the
// filesystem path (data/{venue}/{market_type}/{symbol}/trading.ddb), so no
// table carries a symbol column and every index stays single-dimensional.
// =============================================================================

use anyhow::{Context, Result};
use rusqlite::Connection;

/// Complete per-pair table set. WAL keeps readers unblocked during writes;
/// NORMAL sync is durable enough for data this short-lived.
pub const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA temp_store = MEMORY;
PRAGMA busy_timeout = 5000;

CREATE TABLE IF NOT EXISTS ticks (
    timestamp  INTEGER NOT NULL,
    price      REAL NOT NULL,
    volume     REAL NOT NULL,
    side       TEXT NOT NULL,
    trade_id   TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_ticks_timestamp ON ticks(timestamp);

CREATE TABLE IF NOT EXISTS candles_1m (
    open_time   INTEGER PRIMARY KEY,
    open        REAL NOT NULL,
    high        REAL NOT NULL,
    low         REAL NOT NULL,
    close       REAL NOT NULL,
    volume      REAL NOT NULL,
    buy_volume  REAL NOT NULL,
    sell_volume REAL NOT NULL
);

CREATE TABLE IF NOT EXISTS candles_5m (
    open_time   INTEGER PRIMARY KEY,
    open        REAL NOT NULL,
    high        REAL NOT NULL,
    low         REAL NOT NULL,
    close       REAL NOT NULL,
    volume      REAL NOT NULL,
    buy_volume  REAL NOT NULL,
    sell_volume REAL NOT NULL
);

CREATE TABLE IF NOT EXISTS candles_15m (
    open_time   INTEGER PRIMARY KEY,
    open        REAL NOT NULL,
    high        REAL NOT NULL,
    low         REAL NOT NULL,
    close       REAL NOT NULL,
    volume      REAL NOT NULL,
    buy_volume  REAL NOT NULL,
    sell_volume REAL NOT NULL
);

CREATE TABLE IF NOT EXISTS order_flow (
    timestamp   INTEGER NOT NULL,
    cvd         REAL NOT NULL,
    imbalance   REAL,
    buy_volume  REAL NOT NULL,
    sell_volume REAL NOT NULL,
    net_volume  REAL NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_order_flow_timestamp ON order_flow(timestamp);

CREATE TABLE IF NOT EXISTS market_profile (
    timestamp      INTEGER NOT NULL,
    poc            REAL NOT NULL,
    vah            REAL NOT NULL,
    val            REAL NOT NULL,
    histogram_blob TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_market_profile_timestamp ON market_profile(timestamp);

CREATE TABLE IF NOT EXISTS supply_demand_zones (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    type       TEXT NOT NULL,
    price_low  REAL NOT NULL,
    price_high REAL NOT NULL,
    strength   REAL NOT NULL,
    test_count INTEGER NOT NULL DEFAULT 0,
    state      TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS fair_value_gaps (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    direction  TEXT NOT NULL,
    gap_low    REAL NOT NULL,
    gap_high   REAL NOT NULL,
    fill_pct   REAL NOT NULL DEFAULT 0,
    filled     TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS positions (
    id           TEXT PRIMARY KEY,
    direction    TEXT NOT NULL,
    entry_price  REAL NOT NULL,
    quantity     REAL NOT NULL,
    entry_time   INTEGER NOT NULL,
    state        TEXT NOT NULL,
    exit_reason  TEXT,
    realized_pnl REAL
);

CREATE TABLE IF NOT EXISTS trades_history (
    id             TEXT PRIMARY KEY,
    client_id      TEXT NOT NULL,
    direction      TEXT NOT NULL,
    order_type     TEXT NOT NULL,
    quantity       REAL NOT NULL,
    filled_qty     REAL NOT NULL,
    avg_fill_price REAL NOT NULL,
    state          TEXT NOT NULL,
    created_at     INTEGER NOT NULL,
    updated_at     INTEGER NOT NULL
);
"#;

/// Apply pragmas and the schema to a freshly opened connection.
pub fn initialize(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA_SQL)
        .context("failed to apply schema")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_applies_to_fresh_database() {
        let conn = Connection::open_in_memory().unwrap();
        initialize(&conn).unwrap();

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        // ticks, 3 candle tables, order_flow, market_profile, zones, gaps,
        // positions, trades_history.
        assert!(count >= 10, "expected full table set, got {count}");
    }

    #[test]
    fn schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        initialize(&conn).unwrap();
        initialize(&conn).unwrap();
    }
}
