// =============================================================================
// Connection Pool — global LRU over per-pair databases
// =============================================================================
//
// One open connection per pair, shared by every writer and reader of that
// pair. `acquire` is create-on-miss / evict-LRU-on-full; callers hold an
// `Arc<PairDb>` and release it by dropping. Eviction removes the pool's
// reference; the underlying connection closes once the last holder drops,
// so a connection is never yanked out from under an in-flight query.
//
// The pool lock guards only the bookkeeping map. Pair SQL runs under the
// pair's own connection lock, which the pool never touches.
// =============================================================================

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::storage::schema;
use crate::types::PairId;

/// Database file name inside each pair directory.
const DB_FILE: &str = "trading.ddb";

// ---------------------------------------------------------------------------
// PairDb
// ---------------------------------------------------------------------------

/// An open per-pair database. The connection lock is reentrant-free and
/// serializes every statement against this pair, which is exactly the
/// per-connection write ordering the engine relies on.
pub struct PairDb {
    pair: PairId,
    pub(crate) conn: Mutex<Connection>,
}

impl PairDb {
    /// Open (creating directories and file as needed) and initialize the
    /// database for `pair` under `base_dir`.
    pub fn open(base_dir: &Path, pair: &PairId) -> Result<Self> {
        let dir = base_dir
            .join(&pair.venue)
            .join(pair.market_type.as_path())
            .join(&pair.symbol);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create pair directory {}", dir.display()))?;

        let path = dir.join(DB_FILE);
        let conn = Connection::open(&path)
            .with_context(|| format!("failed to open pair database {}", path.display()))?;
        schema::initialize(&conn)
            .with_context(|| format!("failed to initialize pair database {}", path.display()))?;

        debug!(pair = %pair, path = %path.display(), "pair database opened");

        Ok(Self {
            pair: pair.clone(),
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database. Test-only convenience.
    #[cfg(test)]
    pub fn open_in_memory(pair: &PairId) -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
        schema::initialize(&conn)?;
        Ok(Self {
            pair: pair.clone(),
            conn: Mutex::new(conn),
        })
    }

    pub fn pair(&self) -> &PairId {
        &self.pair
    }
}

// ---------------------------------------------------------------------------
// ConnectionPool
// ---------------------------------------------------------------------------

struct Entry {
    db: Arc<PairDb>,
    last_used: Instant,
}

/// Pool statistics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub open: usize,
    pub capacity: usize,
    pub utilization: f64,
}

/// Global LRU pool of per-pair connections.
pub struct ConnectionPool {
    base_dir: PathBuf,
    max_connections: usize,
    entries: Mutex<HashMap<PairId, Entry>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl ConnectionPool {
    pub fn new(base_dir: impl Into<PathBuf>, max_connections: usize) -> Self {
        Self {
            base_dir: base_dir.into(),
            max_connections: max_connections.max(1),
            entries: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Return the open connection for `pair`, opening it on a miss and
    /// evicting the least-recently-used pair when the pool is full. A failed
    /// open is retried once before the error surfaces.
    pub fn acquire(&self, pair: &PairId) -> Result<Arc<PairDb>> {
        // Evicted entry is dropped outside the pool lock; any current holder
        // keeps the connection alive until it releases.
        let mut evicted: Option<Arc<PairDb>> = None;

        let result = {
            let mut entries = self.entries.lock();

            if let Some(entry) = entries.get_mut(pair) {
                entry.last_used = Instant::now();
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(entry.db.clone());
            }

            self.misses.fetch_add(1, Ordering::Relaxed);

            if entries.len() >= self.max_connections {
                if let Some(lru) = entries
                    .iter()
                    .min_by_key(|(_, e)| e.last_used)
                    .map(|(k, _)| k.clone())
                {
                    if let Some(entry) = entries.remove(&lru) {
                        self.evictions.fetch_add(1, Ordering::Relaxed);
                        debug!(pair = %lru, "evicting least-recently-used pair connection");
                        evicted = Some(entry.db);
                    }
                }
            }

            let db = match PairDb::open(&self.base_dir, pair) {
                Ok(db) => Arc::new(db),
                Err(first) => {
                    warn!(pair = %pair, error = %first, "pair open failed — retrying once");
                    Arc::new(
                        PairDb::open(&self.base_dir, pair)
                            .with_context(|| format!("pair open retry failed for {pair}"))?,
                    )
                }
            };

            entries.insert(
                pair.clone(),
                Entry {
                    db: db.clone(),
                    last_used: Instant::now(),
                },
            );
            Ok(db)
        };

        drop(evicted);
        result
    }

    /// Snapshot of every currently open pair database. Used by the retention
    /// task; does not count as use for LRU purposes.
    pub fn open_pairs(&self) -> Vec<Arc<PairDb>> {
        self.entries.lock().values().map(|e| e.db.clone()).collect()
    }

    pub fn stats(&self) -> PoolStats {
        let open = self.entries.lock().len();
        PoolStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            open,
            capacity: self.max_connections,
            utilization: open as f64 / self.max_connections as f64,
        }
    }

    /// Drop every pooled connection. Called during shutdown after all writers
    /// have stopped.
    pub fn close_all(&self) {
        let mut entries = self.entries.lock();
        let count = entries.len();
        entries.clear();
        info!(closed = count, "connection pool drained");
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MarketType;

    fn pair(symbol: &str) -> PairId {
        PairId::new("binance", MarketType::Spot, symbol)
    }

    #[test]
    fn acquire_creates_on_miss_and_hits_after() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::new(dir.path(), 4);

        let a = pool.acquire(&pair("BTCUSDT")).unwrap();
        let b = pool.acquire(&pair("BTCUSDT")).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let stats = pool.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.open, 1);
    }

    #[test]
    fn database_file_lands_on_the_pair_path() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::new(dir.path(), 4);
        pool.acquire(&pair("ETHUSDT")).unwrap();

        let expected = dir
            .path()
            .join("binance")
            .join("spot")
            .join("ETHUSDT")
            .join("trading.ddb");
        assert!(expected.exists(), "missing {}", expected.display());
    }

    #[test]
    fn lru_eviction_when_full() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::new(dir.path(), 2);

        pool.acquire(&pair("AAA")).unwrap();
        pool.acquire(&pair("BBB")).unwrap();
        // Touch AAA so BBB becomes least recently used.
        pool.acquire(&pair("AAA")).unwrap();
        pool.acquire(&pair("CCC")).unwrap();

        let stats = pool.stats();
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.open, 2);
        assert!(stats.open <= stats.capacity);

        // BBB was evicted; re-acquiring is a miss that reopens it.
        let misses_before = stats.misses;
        pool.acquire(&pair("BBB")).unwrap();
        assert_eq!(pool.stats().misses, misses_before + 1);
    }

    #[test]
    fn evicted_connection_survives_for_existing_holder() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::new(dir.path(), 1);

        let held = pool.acquire(&pair("AAA")).unwrap();
        pool.acquire(&pair("BBB")).unwrap(); // evicts AAA from the pool

        // The held reference still works: the connection only closes when the
        // last holder drops.
        let count: i64 = held
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM ticks", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn pool_never_exceeds_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::new(dir.path(), 3);
        for symbol in ["A", "B", "C", "D", "E", "F"] {
            pool.acquire(&pair(symbol)).unwrap();
            assert!(pool.stats().open <= 3);
        }
    }
}
