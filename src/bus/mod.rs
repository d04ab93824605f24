// =============================================================================
// Event Bus — bounded in-process pub/sub with error isolation
// =============================================================================
//
// The bus is the only channel between subsystems. Publishers enqueue into a
// bounded queue; a single dispatcher task dequeues and fans each event out to
// all handlers registered for its kind. Handlers for the same event run
// concurrently; the dispatcher awaits the whole fan-out before dequeuing the
// next event, so each handler sees events in publish order.
//
// A handler error never cancels its siblings: it is logged, counted, and
// surfaced as a SystemError event.
// =============================================================================

pub mod events;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

pub use events::{Event, EventKind};

// ---------------------------------------------------------------------------
// Component lifecycle
// ---------------------------------------------------------------------------

/// Common lifecycle of every subsystem.
///
/// Always-on components launch long-running loops in `start` and terminate
/// them in `stop`; reactive components install bus subscriptions in `start`
/// and detach in `stop`.
#[async_trait]
pub trait Component: Send + Sync {
    fn name(&self) -> &'static str;
    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
}

/// Cooperative stop signal shared between a component and its loops.
#[derive(Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    /// Signal every listening loop to wind down.
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve when the signal fires. Intended for `tokio::select!` arms.
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        // Already triggered — return immediately.
        if *rx.borrow() {
            return;
        }
        let _ = rx.changed().await;
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Handler trait
// ---------------------------------------------------------------------------

/// A subscriber. One handler may be registered for several kinds.
#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &'static str;
    async fn handle(&self, event: &Event) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

#[derive(Default)]
struct BusCounters {
    published: AtomicU64,
    processed: AtomicU64,
    dropped: AtomicU64,
    handler_errors: AtomicU64,
    dispatch_micros: AtomicU64,
    dispatches: AtomicU64,
}

/// Read-only statistics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct BusStats {
    pub published: u64,
    pub processed: u64,
    pub dropped: u64,
    pub handler_errors: u64,
    pub queue_depth: u64,
    pub avg_dispatch_micros: f64,
    pub events_per_sec: f64,
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

struct Envelope {
    event: Event,
    enqueued_at: Instant,
}

/// The in-process pub/sub bus.
pub struct EventBus {
    tx: mpsc::Sender<Envelope>,
    /// Held until `start` moves it into the dispatcher task.
    rx: Mutex<Option<mpsc::Receiver<Envelope>>>,
    handlers: RwLock<HashMap<EventKind, Vec<Arc<dyn EventHandler>>>>,
    counters: BusCounters,
    publish_timeout: Option<Duration>,
    shutdown: Shutdown,
    dispatcher: Mutex<Option<tokio::task::JoinHandle<()>>>,
    started_at: Instant,
}

impl EventBus {
    /// Create a bus with the given queue capacity and optional hard publish
    /// timeout.
    pub fn new(queue_capacity: usize, publish_timeout_ms: Option<u64>) -> Self {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            handlers: RwLock::new(HashMap::new()),
            counters: BusCounters::default(),
            publish_timeout: publish_timeout_ms.map(Duration::from_millis),
            shutdown: Shutdown::new(),
            dispatcher: Mutex::new(None),
            started_at: Instant::now(),
        }
    }

    /// Register `handler` for a single event kind. Handlers for the same kind
    /// fan out concurrently per delivery.
    pub fn subscribe(&self, kind: EventKind, handler: Arc<dyn EventHandler>) {
        debug!(kind = %kind, handler = handler.name(), "subscription added");
        self.handlers.write().entry(kind).or_default().push(handler);
    }

    /// Register `handler` for several kinds at once.
    pub fn subscribe_many(&self, kinds: &[EventKind], handler: Arc<dyn EventHandler>) {
        for kind in kinds {
            self.subscribe(*kind, handler.clone());
        }
    }

    /// Remove every subscription owned by `name`.
    pub fn unsubscribe(&self, name: &str) {
        let mut handlers = self.handlers.write();
        for list in handlers.values_mut() {
            list.retain(|h| h.name() != name);
        }
        handlers.retain(|_, list| !list.is_empty());
    }

    /// Enqueue an event. Blocks cooperatively while the queue is full; with a
    /// configured hard timeout the event is dropped on expiry and a
    /// `SystemError(queue_full)` is emitted on a best-effort basis.
    pub async fn publish(&self, event: Event) {
        let kind = event.kind();
        let envelope = Envelope {
            event,
            enqueued_at: Instant::now(),
        };

        // Published counts attempts; dropped events are the difference
        // between publishes and what the dispatcher will ever see.
        self.counters.published.fetch_add(1, Ordering::Relaxed);

        let result = match self.publish_timeout {
            Some(timeout) => self.tx.send_timeout(envelope, timeout).await.map_err(|e| {
                matches!(e, mpsc::error::SendTimeoutError::Timeout(_))
            }),
            None => self.tx.send(envelope).await.map_err(|_| false),
        };

        match result {
            Ok(()) => {}
            Err(timed_out) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(kind = %kind, timed_out, "event dropped — queue unavailable");
                if kind != EventKind::SystemError {
                    // Best-effort: never block on the failure report itself.
                    let report = self.tx.try_send(Envelope {
                        event: Event::system_error("bus", "queue_full", kind.to_string()),
                        enqueued_at: Instant::now(),
                    });
                    if report.is_ok() {
                        self.counters.published.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
    }

    /// Spawn the dispatcher task. Idempotent per bus instance.
    pub fn start(self: &Arc<Self>) {
        let mut rx = match self.rx.lock().take() {
            Some(rx) => rx,
            None => {
                warn!("bus dispatcher already started");
                return;
            }
        };

        let bus = Arc::clone(self);
        let shutdown = self.shutdown.clone();

        let handle = tokio::spawn(async move {
            info!("event bus dispatcher started");
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.wait() => break,
                    maybe = rx.recv() => match maybe {
                        Some(envelope) => bus.dispatch(envelope).await,
                        None => break,
                    },
                }
            }
            // Drain whatever is still queued before exiting.
            while let Ok(envelope) = rx.try_recv() {
                bus.dispatch(envelope).await;
            }
            info!("event bus dispatcher stopped");
        });

        *self.dispatcher.lock() = Some(handle);
    }

    /// Stop the dispatcher, draining the queue first. The bus is stopped last
    /// during engine shutdown so late events from stopping components still
    /// flow.
    pub async fn stop(&self) {
        self.shutdown.trigger();
        let handle = self.dispatcher.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "bus dispatcher join failed");
            }
        }
    }

    /// Deliver one event to every handler registered for its kind.
    async fn dispatch(&self, envelope: Envelope) {
        let kind = envelope.event.kind();
        let handlers: Vec<Arc<dyn EventHandler>> = self
            .handlers
            .read()
            .get(&kind)
            .map(|list| list.to_vec())
            .unwrap_or_default();

        if !handlers.is_empty() {
            let event = &envelope.event;
            let deliveries = handlers.iter().map(|handler| {
                let handler = handler.clone();
                async move {
                    let outcome = handler.handle(event).await;
                    (handler, outcome)
                }
            });

            for (handler, outcome) in futures_util::future::join_all(deliveries).await {
                if let Err(e) = outcome {
                    self.counters.handler_errors.fetch_add(1, Ordering::Relaxed);
                    error!(
                        kind = %kind,
                        handler = handler.name(),
                        error = %e,
                        "event handler failed"
                    );
                    if kind != EventKind::SystemError {
                        let report = self.tx.try_send(Envelope {
                            event: Event::system_error(
                                handler.name(),
                                "handler_error",
                                format!("{kind}: {e:#}"),
                            ),
                            enqueued_at: Instant::now(),
                        });
                        if report.is_ok() {
                            self.counters.published.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            }
        }

        self.counters.processed.fetch_add(1, Ordering::Relaxed);
        let micros = envelope.enqueued_at.elapsed().as_micros() as u64;
        self.counters.dispatch_micros.fetch_add(micros, Ordering::Relaxed);
        self.counters.dispatches.fetch_add(1, Ordering::Relaxed);
    }

    /// Read-only statistics.
    pub fn stats(&self) -> BusStats {
        let published = self.counters.published.load(Ordering::Relaxed);
        let processed = self.counters.processed.load(Ordering::Relaxed);
        let dropped = self.counters.dropped.load(Ordering::Relaxed);
        let dispatches = self.counters.dispatches.load(Ordering::Relaxed);
        let micros = self.counters.dispatch_micros.load(Ordering::Relaxed);

        let uptime = self.started_at.elapsed().as_secs_f64();

        BusStats {
            published,
            processed,
            dropped,
            handler_errors: self.counters.handler_errors.load(Ordering::Relaxed),
            queue_depth: published.saturating_sub(processed + dropped),
            avg_dispatch_micros: if dispatches > 0 {
                micros as f64 / dispatches as f64
            } else {
                0.0
            },
            events_per_sec: if uptime > 0.0 {
                processed as f64 / uptime
            } else {
                0.0
            },
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
