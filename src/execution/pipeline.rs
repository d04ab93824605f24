// =============================================================================
// Execution Pipeline — validate → risk-size → place → reconcile
// =============================================================================
//
// A chain of handlers passes one mutable `ExecutionContext` along; any
// handler short-circuits the chain with a categorized failure. The router
// turns failures into `OrderFailed` events; the handlers themselves only
// mutate the context, the order manager, and the venue.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::bus::{Event, EventBus};
use crate::config::ExecutionConfig;
use crate::execution::orders::OrderManager;
use crate::execution::venue::{OrderRequest, VenueAdapter};
use crate::types::{Direction, Order, OrderState, OrderType, TradeSignal};

/// Failure reason for a duplicate client id. The router swallows this
/// silently: idempotent resubmission is not an error.
pub const DUPLICATE_REASON: &str = "duplicate_client_id";

// ---------------------------------------------------------------------------
// Context and handler contract
// ---------------------------------------------------------------------------

/// Mutable state threaded through the chain.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub signal: TradeSignal,
    /// Idempotency key for the order about to be placed.
    pub client_id: String,
    /// Equity read from the balance provider before the chain ran.
    pub balance: f64,
    /// Open position count read from the monitor before the chain ran.
    pub open_positions: usize,
    /// Sized by the risk handler.
    pub quantity: f64,
    /// Stop after the risk handler applied the default-stop rule.
    pub effective_stop: f64,
    /// Latest order snapshot once the placer registered one.
    pub order: Option<Order>,
    pub fill_price: f64,
    pub slippage_pct: f64,
}

impl ExecutionContext {
    pub fn new(signal: TradeSignal, client_id: String, balance: f64, open_positions: usize) -> Self {
        Self {
            signal,
            client_id,
            balance,
            open_positions,
            quantity: 0.0,
            effective_stop: 0.0,
            order: None,
            fill_price: 0.0,
            slippage_pct: 0.0,
        }
    }
}

/// A categorized stage failure. `reason` lands in the `OrderFailed` event.
#[derive(Debug, Clone)]
pub struct StageFailure {
    pub reason: String,
    pub detail: String,
}

impl StageFailure {
    pub fn new(reason: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            detail: detail.into(),
        }
    }
}

#[async_trait]
pub trait ExecutionHandler: Send + Sync {
    fn name(&self) -> &'static str;
    async fn handle(&self, ctx: &mut ExecutionContext) -> Result<(), StageFailure>;
}

// ---------------------------------------------------------------------------
// 1. Validator
// ---------------------------------------------------------------------------

pub struct Validator {
    pub min_confluence: f64,
    pub known_venues: Vec<String>,
}

#[async_trait]
impl ExecutionHandler for Validator {
    fn name(&self) -> &'static str {
        "validator"
    }

    async fn handle(&self, ctx: &mut ExecutionContext) -> Result<(), StageFailure> {
        let signal = &ctx.signal;

        if signal.confluence_score < self.min_confluence {
            return Err(StageFailure::new(
                "validation",
                format!(
                    "confluence {:.2} below floor {:.2}",
                    signal.confluence_score, self.min_confluence
                ),
            ));
        }

        if signal.entry_price <= 0.0 {
            return Err(StageFailure::new("validation", "non-positive entry price"));
        }

        let symbol = &signal.pair.symbol;
        if symbol.is_empty() || !symbol.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
        {
            return Err(StageFailure::new(
                "validation",
                format!("malformed symbol {symbol:?}"),
            ));
        }

        if !self.known_venues.iter().any(|v| v == &signal.pair.venue) {
            return Err(StageFailure::new(
                "validation",
                format!("unknown venue {}", signal.pair.venue),
            ));
        }

        // A suggested stop of zero means "none given"; the risk handler will
        // impose the default. A non-zero stop must protect the correct side.
        if signal.suggested_stop > 0.0 {
            let wrong_side = match signal.direction {
                Direction::Long => signal.suggested_stop >= signal.entry_price,
                Direction::Short => signal.suggested_stop <= signal.entry_price,
            };
            if wrong_side {
                return Err(StageFailure::new(
                    "validation",
                    format!(
                        "stop {:.4} on the wrong side of entry {:.4} for {}",
                        signal.suggested_stop, signal.entry_price, signal.direction
                    ),
                ));
            }
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// 2. Risk sizer
// ---------------------------------------------------------------------------

pub struct RiskSizer {
    pub config: ExecutionConfig,
}

#[async_trait]
impl ExecutionHandler for RiskSizer {
    fn name(&self) -> &'static str {
        "risk_sizer"
    }

    async fn handle(&self, ctx: &mut ExecutionContext) -> Result<(), StageFailure> {
        let cfg = &self.config;
        let signal = &ctx.signal;

        if ctx.open_positions >= cfg.max_concurrent_positions {
            return Err(StageFailure::new(
                "risk",
                format!(
                    "{} open positions at the {} cap",
                    ctx.open_positions, cfg.max_concurrent_positions
                ),
            ));
        }

        if ctx.balance <= 0.0 {
            return Err(StageFailure::new("risk", "no available equity"));
        }

        let notional = (ctx.balance * cfg.default_position_size_pct / 100.0)
            .min(ctx.balance * cfg.max_position_size_pct / 100.0);
        let quantity = notional / signal.entry_price;
        if quantity <= 0.0 {
            return Err(StageFailure::new("risk", "sized quantity is zero"));
        }

        // Default stop at the configured adverse distance when none given.
        let stop = if signal.suggested_stop > 0.0 {
            signal.suggested_stop
        } else {
            match signal.direction {
                Direction::Long => signal.entry_price * (1.0 - cfg.default_stop_pct / 100.0),
                Direction::Short => signal.entry_price * (1.0 + cfg.default_stop_pct / 100.0),
            }
        };

        if let Some(target) = signal.suggested_target {
            let risk = (signal.entry_price - stop).abs();
            if risk <= 0.0 {
                return Err(StageFailure::new("risk", "zero stop distance"));
            }
            let reward = (target - signal.entry_price).abs();
            let rr = reward / risk;
            if rr < cfg.min_reward_risk {
                return Err(StageFailure::new(
                    "risk",
                    format!("reward/risk {:.2} below {:.2}", rr, cfg.min_reward_risk),
                ));
            }
        }

        ctx.quantity = quantity;
        ctx.effective_stop = stop;

        debug!(
            pair = %signal.pair,
            quantity,
            stop,
            balance = ctx.balance,
            "position sized"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// 3. Placer
// ---------------------------------------------------------------------------

pub struct Placer {
    pub venue: Arc<dyn VenueAdapter>,
    pub orders: Arc<OrderManager>,
    pub bus: Arc<EventBus>,
    pub config: ExecutionConfig,
}

impl Placer {
    /// Exponential backoff with ±jitter, honoring a venue-provided
    /// Retry-After when present.
    fn retry_delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let cfg = &self.config;
        let cap = Duration::from_millis(cfg.retry_max_delay_ms);

        let base = match retry_after {
            Some(hint) => hint,
            None => {
                let millis =
                    cfg.retry_base_delay_ms as f64 * cfg.retry_factor.powi(attempt as i32);
                Duration::from_millis(millis as u64)
            }
        };
        let capped = base.min(cap);

        let jitter_span = cfg.retry_jitter_pct / 100.0;
        let factor = 1.0 + rand::thread_rng().gen_range(-jitter_span..=jitter_span);
        capped.mul_f64(factor.max(0.0))
    }
}

#[async_trait]
impl ExecutionHandler for Placer {
    fn name(&self) -> &'static str {
        "placer"
    }

    async fn handle(&self, ctx: &mut ExecutionContext) -> Result<(), StageFailure> {
        let order = OrderManager::build_order(
            ctx.signal.pair.clone(),
            ctx.signal.direction,
            OrderType::Market,
            ctx.quantity,
            None,
            Some(ctx.effective_stop),
            ctx.client_id.clone(),
        );

        if !self.orders.register(order.clone()) {
            return Err(StageFailure::new(
                DUPLICATE_REASON,
                format!("client id {} already submitted", ctx.client_id),
            ));
        }

        let request = OrderRequest {
            pair: order.pair.clone(),
            direction: order.direction,
            order_type: order.order_type,
            quantity: order.quantity,
            limit_price: order.limit_price,
            client_id: order.client_id.clone(),
        };

        let mut attempt: u32 = 0;
        loop {
            match self.venue.place_order(&request).await {
                Ok(ack) => {
                    self.orders
                        .set_venue_order_id(&ctx.client_id, &ack.venue_order_id);
                    let snapshot = self
                        .orders
                        .transition(&ctx.client_id, OrderState::Submitted, None, None)
                        .map_err(|e| StageFailure::new("internal", e.to_string()))?;

                    info!(
                        client_id = %ctx.client_id,
                        venue_order_id = %ack.venue_order_id,
                        attempts = attempt + 1,
                        "order submitted"
                    );
                    self.bus.publish(Event::OrderPlaced(snapshot.clone())).await;
                    ctx.order = Some(snapshot);
                    return Ok(());
                }
                Err(error) if error.is_retriable() && attempt < self.config.max_retries => {
                    let delay = self.retry_delay(attempt, error.retry_after());
                    attempt += 1;
                    self.orders.record_retry(&ctx.client_id, &error.to_string());
                    warn!(
                        client_id = %ctx.client_id,
                        attempt,
                        max = self.config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "retriable placement failure — backing off"
                    );
                    sleep(delay).await;
                }
                Err(error) => {
                    let _ = self.orders.transition(
                        &ctx.client_id,
                        OrderState::Failed,
                        None,
                        None,
                    );
                    return Err(StageFailure::new(error.category(), error.to_string()));
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// 4. Reconciler
// ---------------------------------------------------------------------------

pub struct Reconciler {
    pub venue: Arc<dyn VenueAdapter>,
    pub orders: Arc<OrderManager>,
    pub config: ExecutionConfig,
}

#[async_trait]
impl ExecutionHandler for Reconciler {
    fn name(&self) -> &'static str {
        "reconciler"
    }

    async fn handle(&self, ctx: &mut ExecutionContext) -> Result<(), StageFailure> {
        let order = ctx
            .order
            .clone()
            .ok_or_else(|| StageFailure::new("internal", "no order to reconcile"))?;
        let venue_order_id = order
            .venue_order_id
            .clone()
            .ok_or_else(|| StageFailure::new("internal", "order has no venue id"))?;

        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(self.config.fill_timeout_s);
        let poll = Duration::from_millis(self.config.fill_poll_ms.max(1));

        loop {
            match self.venue.get_order(&order.pair, &venue_order_id).await {
                Ok(status) => {
                    let current = self
                        .orders
                        .get(&ctx.client_id)
                        .map(|o| o.state)
                        .unwrap_or(OrderState::Failed);

                    match status.state {
                        OrderState::Filled => {
                            let snapshot = self
                                .orders
                                .transition(
                                    &ctx.client_id,
                                    OrderState::Filled,
                                    Some(status.filled_qty),
                                    Some(status.avg_fill_price),
                                )
                                .map_err(|e| StageFailure::new("internal", e.to_string()))?;

                            ctx.fill_price = status.avg_fill_price;
                            // No reference price means no slippage read
                            // (close orders when the ticker was unavailable).
                            ctx.slippage_pct = if ctx.signal.entry_price > 0.0 {
                                (status.avg_fill_price - ctx.signal.entry_price).abs()
                                    / ctx.signal.entry_price
                                    * 100.0
                            } else {
                                0.0
                            };
                            ctx.order = Some(snapshot);

                            if ctx.slippage_pct > self.config.max_slippage_pct {
                                warn!(
                                    client_id = %ctx.client_id,
                                    slippage_pct = format!("{:.3}", ctx.slippage_pct),
                                    limit = self.config.max_slippage_pct,
                                    "slippage_excess recorded"
                                );
                                if self.config.reject_on_slippage {
                                    return Err(StageFailure::new(
                                        "slippage",
                                        format!("slippage {:.3}% over limit", ctx.slippage_pct),
                                    ));
                                }
                            }
                            return Ok(());
                        }
                        OrderState::Partial => {
                            // Partial may repeat; take fills as they come.
                            if current.can_transition(OrderState::Partial) {
                                if let Ok(snapshot) = self.orders.transition(
                                    &ctx.client_id,
                                    OrderState::Partial,
                                    Some(status.filled_qty),
                                    Some(status.avg_fill_price),
                                ) {
                                    ctx.order = Some(snapshot);
                                }
                            }
                        }
                        OrderState::Active => {
                            if current == OrderState::Submitted {
                                if let Ok(snapshot) = self.orders.transition(
                                    &ctx.client_id,
                                    OrderState::Active,
                                    None,
                                    None,
                                ) {
                                    ctx.order = Some(snapshot);
                                }
                            }
                        }
                        OrderState::Cancelled | OrderState::Rejected => {
                            let _ = self.orders.transition(
                                &ctx.client_id,
                                status.state,
                                Some(status.filled_qty),
                                Some(status.avg_fill_price),
                            );
                            return Err(StageFailure::new(
                                "venue",
                                format!("order ended {}", status.state),
                            ));
                        }
                        _ => {}
                    }
                }
                Err(error) => {
                    // Missing or unreadable status is transient until the
                    // fill window runs out.
                    debug!(
                        client_id = %ctx.client_id,
                        error = %error,
                        "fill poll failed — will retry"
                    );
                }
            }

            if tokio::time::Instant::now() + poll > deadline {
                let _ = self
                    .orders
                    .transition(&ctx.client_id, OrderState::Failed, None, None);
                return Err(StageFailure::new(
                    "fill_timeout",
                    format!("no fill within {}s", self.config.fill_timeout_s),
                ));
            }
            sleep(poll).await;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
