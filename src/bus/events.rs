// =============================================================================
// Event catalog — the authoritative contract between subsystems
// =============================================================================
//
// Events are immutable records. The bus routes on `EventKind` and never
// mutates payloads; subscribers receive shared references and copy what they
// keep. Heavyweight payloads (the analytics snapshot) travel as `Arc`.
// =============================================================================

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{
    AnalyticsSnapshot, Candle, Direction, ExitReason, Order, PairId, Position, Tick, TradeSignal,
    Timeframe,
};

// ---------------------------------------------------------------------------
// Kinds
// ---------------------------------------------------------------------------

/// Discriminant used for subscription routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    TradeTickReceived,
    CandleCompleted,
    AnalyticsUpdated,
    TradingSignalGenerated,
    OrderPlaced,
    OrderFilled,
    OrderFailed,
    OrderCancelled,
    PositionOpened,
    PositionClosed,
    TrailingStopHit,
    ClosePositionRequested,
    DumpDetected,
    CorrelatedDumpDetected,
    PortfolioHealthDegraded,
    CircuitBreakerTriggered,
    MaxHoldTimeExceeded,
    StopNewEntries,
    StopAllTrading,
    MarketDataConnectionLost,
    SystemError,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

// ---------------------------------------------------------------------------
// Payload fragments
// ---------------------------------------------------------------------------

/// Evidence collected by the dump detector. At least `min_signals` of the
/// three booleans are true when this is emitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DumpEvidence {
    /// Sell volume exceeded buy volume for N consecutive 1m candles.
    pub volume_reversal: bool,
    /// Order-flow dominance flipped against the position within the window.
    pub flow_flip: bool,
    /// Price broke the recent extreme by the configured margin.
    pub momentum_break: bool,
    pub detail: String,
}

impl DumpEvidence {
    pub fn fired(&self) -> usize {
        [self.volume_reversal, self.flow_flip, self.momentum_break]
            .iter()
            .filter(|&&b| b)
            .count()
    }
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// Every message that crosses the bus.
#[derive(Debug, Clone)]
pub enum Event {
    TradeTickReceived {
        pair: PairId,
        tick: Tick,
    },
    CandleCompleted {
        pair: PairId,
        timeframe: Timeframe,
        candle: Candle,
    },
    AnalyticsUpdated {
        pair: PairId,
        snapshot: Arc<AnalyticsSnapshot>,
    },
    TradingSignalGenerated(TradeSignal),
    OrderPlaced(Order),
    OrderFilled(Order),
    OrderFailed {
        order: Order,
        reason: String,
    },
    OrderCancelled(Order),
    PositionOpened(Position),
    PositionClosed(Position),
    TrailingStopHit(Position),
    /// The position monitor requests a market close; execution owns the venue
    /// call and reports back through the close order's `OrderFilled`.
    ClosePositionRequested {
        position_id: String,
        pair: PairId,
        direction: Direction,
        quantity: f64,
        reason: ExitReason,
        /// Client id execution must use for the close order, so the monitor
        /// can match the confirmation fill.
        close_client_id: String,
    },
    DumpDetected {
        pair: PairId,
        position_id: String,
        evidence: DumpEvidence,
    },
    CorrelatedDumpDetected {
        leader: String,
        move_pct: f64,
        closed_position_ids: Vec<String>,
    },
    PortfolioHealthDegraded {
        score: f64,
        actions: Vec<String>,
    },
    CircuitBreakerTriggered {
        level: u8,
        daily_pnl_pct: f64,
    },
    MaxHoldTimeExceeded(Position),
    StopNewEntries,
    StopAllTrading,
    MarketDataConnectionLost {
        venue: String,
        since: DateTime<Utc>,
    },
    SystemError {
        component: String,
        reason: String,
        detail: String,
    },
}

impl Event {
    /// The routing discriminant of this event.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::TradeTickReceived { .. } => EventKind::TradeTickReceived,
            Self::CandleCompleted { .. } => EventKind::CandleCompleted,
            Self::AnalyticsUpdated { .. } => EventKind::AnalyticsUpdated,
            Self::TradingSignalGenerated(_) => EventKind::TradingSignalGenerated,
            Self::OrderPlaced(_) => EventKind::OrderPlaced,
            Self::OrderFilled(_) => EventKind::OrderFilled,
            Self::OrderFailed { .. } => EventKind::OrderFailed,
            Self::OrderCancelled(_) => EventKind::OrderCancelled,
            Self::PositionOpened(_) => EventKind::PositionOpened,
            Self::PositionClosed(_) => EventKind::PositionClosed,
            Self::TrailingStopHit(_) => EventKind::TrailingStopHit,
            Self::ClosePositionRequested { .. } => EventKind::ClosePositionRequested,
            Self::DumpDetected { .. } => EventKind::DumpDetected,
            Self::CorrelatedDumpDetected { .. } => EventKind::CorrelatedDumpDetected,
            Self::PortfolioHealthDegraded { .. } => EventKind::PortfolioHealthDegraded,
            Self::CircuitBreakerTriggered { .. } => EventKind::CircuitBreakerTriggered,
            Self::MaxHoldTimeExceeded(_) => EventKind::MaxHoldTimeExceeded,
            Self::StopNewEntries => EventKind::StopNewEntries,
            Self::StopAllTrading => EventKind::StopAllTrading,
            Self::MarketDataConnectionLost { .. } => EventKind::MarketDataConnectionLost,
            Self::SystemError { .. } => EventKind::SystemError,
        }
    }

    /// Convenience constructor for component failure events.
    pub fn system_error(
        component: impl Into<String>,
        reason: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self::SystemError {
            component: component.into(),
            reason: reason.into(),
            detail: detail.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MarketType, Side};

    #[test]
    fn kind_matches_variant() {
        let pair = PairId::new("binance", MarketType::Spot, "BTCUSDT");
        let tick = Tick {
            timestamp: 0,
            price: 100.0,
            volume: 1.0,
            side: Side::Buy,
            trade_id: "t1".into(),
        };
        let event = Event::TradeTickReceived { pair, tick };
        assert_eq!(event.kind(), EventKind::TradeTickReceived);

        assert_eq!(Event::StopAllTrading.kind(), EventKind::StopAllTrading);
        assert_eq!(
            Event::system_error("storage", "write_failed", "disk full").kind(),
            EventKind::SystemError
        );
    }

    #[test]
    fn dump_evidence_counts_fired_signals() {
        let ev = DumpEvidence {
            volume_reversal: true,
            flow_flip: false,
            momentum_break: true,
            detail: String::new(),
        };
        assert_eq!(ev.fired(), 2);
    }
}
