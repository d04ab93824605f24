// =============================================================================
// Engine Status — read-only aggregate for any outer surface
// =============================================================================
//
// Collects bus statistics, pool statistics, open positions, and the recent
// error ring into one serialisable snapshot. No surface is wired here; an
// operator shell or exporter consumes this type.
// =============================================================================

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;

use crate::bus::{BusStats, Event, EventBus, EventHandler};
use crate::execution::OrderManager;
use crate::monitor::PositionBook;
use crate::storage::{ConnectionPool, PoolStats};
use crate::types::{AccountMode, Position};

const HANDLER_NAME: &str = "status";

/// Recent component errors retained for diagnostics.
const MAX_RECENT_ERRORS: usize = 50;

/// One recorded `SystemError`.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub component: String,
    pub reason: String,
    pub detail: String,
    pub at: String,
}

/// Full engine status snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub server_time: i64,
    pub uptime_s: u64,
    pub account_mode: AccountMode,
    pub bus: BusStats,
    pub pool: PoolStats,
    pub open_positions: Vec<Position>,
    pub closed_positions: Vec<Position>,
    pub live_orders: usize,
    pub recent_errors: Vec<ErrorRecord>,
}

/// Builds status snapshots and records `SystemError` events.
pub struct StatusReporter {
    account_mode: AccountMode,
    started_at: std::time::Instant,
    bus: Arc<EventBus>,
    pool: Arc<ConnectionPool>,
    book: Arc<PositionBook>,
    orders: Arc<OrderManager>,
    errors: Arc<RwLock<Vec<ErrorRecord>>>,
}

impl StatusReporter {
    pub fn new(
        account_mode: AccountMode,
        bus: Arc<EventBus>,
        pool: Arc<ConnectionPool>,
        book: Arc<PositionBook>,
        orders: Arc<OrderManager>,
    ) -> Self {
        Self {
            account_mode,
            started_at: std::time::Instant::now(),
            bus,
            pool,
            book,
            orders,
            errors: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// The bus handler that feeds the error ring. Subscribe it to
    /// `SystemError`.
    pub fn error_probe(&self) -> Arc<dyn EventHandler> {
        Arc::new(ErrorProbe {
            errors: self.errors.clone(),
        })
    }

    pub fn build(&self) -> EngineStatus {
        EngineStatus {
            server_time: Utc::now().timestamp_millis(),
            uptime_s: self.started_at.elapsed().as_secs(),
            account_mode: self.account_mode,
            bus: self.bus.stats(),
            pool: self.pool.stats(),
            open_positions: self.book.open_snapshots(),
            closed_positions: self.book.closed_snapshots(20),
            live_orders: self.orders.live_count(),
            recent_errors: self.errors.read().clone(),
        }
    }
}

struct ErrorProbe {
    errors: Arc<RwLock<Vec<ErrorRecord>>>,
}

#[async_trait]
impl EventHandler for ErrorProbe {
    fn name(&self) -> &'static str {
        HANDLER_NAME
    }

    async fn handle(&self, event: &Event) -> Result<()> {
        if let Event::SystemError {
            component,
            reason,
            detail,
        } = event
        {
            let mut errors = self.errors.write();
            errors.push(ErrorRecord {
                component: component.clone(),
                reason: reason.clone(),
                detail: detail.clone(),
                at: Utc::now().to_rfc3339(),
            });
            while errors.len() > MAX_RECENT_ERRORS {
                errors.remove(0);
            }
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
