// =============================================================================
// Notifications — priority routing with batching over a transport contract
// =============================================================================
//
// Reactive component. Failure and risk events are mapped to a priority;
// critical notifications go straight to the transport, everything else is
// batched and flushed as a digest on an interval. Concrete transports
// (email, chat webhooks) live outside the core behind the trait.
// =============================================================================

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::{interval, Duration};
use tracing::{info, warn};

use crate::bus::{Component, Event, EventBus, EventHandler, EventKind, Shutdown};

const HANDLER_NAME: &str = "notifier";

/// Seconds between digest flushes of non-critical notifications.
const FLUSH_INTERVAL_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Priority {
    Critical,
    Warning,
    Info,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Critical => write!(f, "CRITICAL"),
            Self::Warning => write!(f, "WARNING"),
            Self::Info => write!(f, "INFO"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub priority: Priority,
    pub subject: String,
    pub body: String,
    pub at: DateTime<Utc>,
}

/// External delivery channel. Implementations are outside the core.
#[async_trait]
pub trait NotificationTransport: Send + Sync {
    async fn deliver(&self, notification: &Notification) -> Result<()>;
    async fn deliver_digest(&self, notifications: &[Notification]) -> Result<()>;
}

/// Default transport: structured log lines only.
pub struct LogTransport;

#[async_trait]
impl NotificationTransport for LogTransport {
    async fn deliver(&self, notification: &Notification) -> Result<()> {
        warn!(
            priority = %notification.priority,
            subject = %notification.subject,
            body = %notification.body,
            "notification"
        );
        Ok(())
    }

    async fn deliver_digest(&self, notifications: &[Notification]) -> Result<()> {
        info!(count = notifications.len(), "notification digest");
        for n in notifications {
            info!(priority = %n.priority, subject = %n.subject, "digest entry");
        }
        Ok(())
    }
}

/// Map an event to a notification, or `None` when it is not user-visible.
fn classify(event: &Event) -> Option<Notification> {
    let at = Utc::now();
    let make = |priority, subject: String, body: String| {
        Some(Notification {
            priority,
            subject,
            body,
            at,
        })
    };

    match event {
        Event::SystemError {
            component,
            reason,
            detail,
        } => make(
            Priority::Critical,
            format!("system error in {component}"),
            format!("{reason}: {detail}"),
        ),
        Event::CircuitBreakerTriggered {
            level,
            daily_pnl_pct,
        } => make(
            Priority::Critical,
            format!("circuit breaker level {level}"),
            format!("daily pnl {daily_pnl_pct:.2}%"),
        ),
        Event::StopAllTrading => make(
            Priority::Critical,
            "all trading halted".to_string(),
            String::new(),
        ),
        Event::OrderFailed { order, reason } => make(
            Priority::Warning,
            format!("order failed: {}", order.pair),
            format!("client {} — {reason}", order.client_id),
        ),
        Event::MarketDataConnectionLost { venue, since } => make(
            Priority::Warning,
            format!("market data lost: {venue}"),
            format!("since {since}"),
        ),
        Event::DumpDetected { pair, evidence, .. } => make(
            Priority::Warning,
            format!("dump detected: {pair}"),
            evidence.detail.clone(),
        ),
        Event::CorrelatedDumpDetected {
            leader, move_pct, ..
        } => make(
            Priority::Warning,
            format!("correlated dump off {leader}"),
            format!("leader moved {move_pct:.2}%"),
        ),
        Event::StopNewEntries => make(
            Priority::Warning,
            "new entries halted".to_string(),
            String::new(),
        ),
        Event::PositionClosed(position) => make(
            Priority::Info,
            format!("position closed: {}", position.pair),
            format!(
                "{} — pnl {:.2}",
                position
                    .exit_reason
                    .map(|r| r.to_string())
                    .unwrap_or_default(),
                position.realized_pnl.unwrap_or(0.0)
            ),
        ),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Notifier
// ---------------------------------------------------------------------------

struct NotifierCore {
    transport: Arc<dyn NotificationTransport>,
    batch: Mutex<Vec<Notification>>,
}

impl NotifierCore {
    async fn flush(&self) {
        let pending: Vec<Notification> = std::mem::take(&mut *self.batch.lock());
        if pending.is_empty() {
            return;
        }
        if let Err(e) = self.transport.deliver_digest(&pending).await {
            warn!(error = %e, dropped = pending.len(), "digest delivery failed");
        }
    }
}

struct NotifierRouter {
    core: Arc<NotifierCore>,
}

#[async_trait]
impl EventHandler for NotifierRouter {
    fn name(&self) -> &'static str {
        HANDLER_NAME
    }

    async fn handle(&self, event: &Event) -> Result<()> {
        let notification = match classify(event) {
            Some(n) => n,
            None => return Ok(()),
        };

        if notification.priority == Priority::Critical {
            self.core.transport.deliver(&notification).await?;
        } else {
            self.core.batch.lock().push(notification);
        }
        Ok(())
    }
}

pub struct Notifier {
    core: Arc<NotifierCore>,
    bus: Arc<EventBus>,
    shutdown: Shutdown,
    flush_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Notifier {
    pub fn new(transport: Arc<dyn NotificationTransport>, bus: Arc<EventBus>) -> Self {
        Self {
            core: Arc::new(NotifierCore {
                transport,
                batch: Mutex::new(Vec::new()),
            }),
            bus,
            shutdown: Shutdown::new(),
            flush_task: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Component for Notifier {
    fn name(&self) -> &'static str {
        HANDLER_NAME
    }

    async fn start(&self) -> Result<()> {
        self.bus.subscribe_many(
            &[
                EventKind::SystemError,
                EventKind::CircuitBreakerTriggered,
                EventKind::StopAllTrading,
                EventKind::StopNewEntries,
                EventKind::OrderFailed,
                EventKind::MarketDataConnectionLost,
                EventKind::DumpDetected,
                EventKind::CorrelatedDumpDetected,
                EventKind::PositionClosed,
            ],
            Arc::new(NotifierRouter {
                core: self.core.clone(),
            }),
        );

        let core = self.core.clone();
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(FLUSH_INTERVAL_SECS));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = ticker.tick() => core.flush().await,
                }
            }
            // Final flush so shutdown does not drop queued notifications.
            core.flush().await;
        });
        *self.flush_task.lock() = Some(handle);

        info!(flush_interval_s = FLUSH_INTERVAL_SECS, "notifier started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.shutdown.trigger();
        let handle = self.flush_task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.bus.unsubscribe(HANDLER_NAME);
        info!("notifier stopped");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
