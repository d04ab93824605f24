// =============================================================================
// Shared domain types used across the Meridian flow engine
// =============================================================================
//
// Everything here is a plain data type with serde derives. Behaviour lives in
// the owning subsystems: the execution engine owns order state transitions,
// the position monitor owns position lifecycle, analytics owns snapshot
// construction.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Market identity
// ---------------------------------------------------------------------------

/// Spot or perpetual-futures market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MarketType {
    Spot,
    Perp,
}

impl Default for MarketType {
    fn default() -> Self {
        Self::Spot
    }
}

impl MarketType {
    /// Lower-case path segment used by the storage layout.
    pub fn as_path(&self) -> &'static str {
        match self {
            Self::Spot => "spot",
            Self::Perp => "perp",
        }
    }
}

impl std::fmt::Display for MarketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Spot => write!(f, "spot"),
            Self::Perp => write!(f, "perp"),
        }
    }
}

/// Identity of a trading pair. The storage engine encodes this identity as a
/// filesystem path, so the three fields together are the primary key of
/// everything per-pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PairId {
    pub venue: String,
    pub market_type: MarketType,
    pub symbol: String,
}

impl PairId {
    pub fn new(venue: impl Into<String>, market_type: MarketType, symbol: impl Into<String>) -> Self {
        Self {
            venue: venue.into(),
            market_type,
            symbol: symbol.into(),
        }
    }
}

impl std::fmt::Display for PairId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.venue, self.market_type, self.symbol)
    }
}

/// Asset class of a traded instrument. Drives trailing distance, hold-time
/// limits, and configured leader correlation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AssetClass {
    Major,
    Regular,
    Meme,
    Forex,
    Commodity,
}

impl std::fmt::Display for AssetClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Major => write!(f, "Major"),
            Self::Regular => write!(f, "Regular"),
            Self::Meme => write!(f, "Meme"),
            Self::Forex => write!(f, "Forex"),
            Self::Commodity => write!(f, "Commodity"),
        }
    }
}

// ---------------------------------------------------------------------------
// Flow side and trade direction
// ---------------------------------------------------------------------------

/// Taker side of a trade tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "BUY" => Some(Self::Buy),
            "SELL" => Some(Self::Sell),
            _ => None,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Direction of a trade intent or an open position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// +1.0 for long, -1.0 for short. PnL = sign * (mark - entry) * qty.
    pub fn sign(&self) -> f64 {
        match self {
            Self::Long => 1.0,
            Self::Short => -1.0,
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            Self::Long => Self::Short,
            Self::Short => Self::Long,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

// ---------------------------------------------------------------------------
// Market data
// ---------------------------------------------------------------------------

/// A single normalized trade tick. Immutable once ingested.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tick {
    /// Milliseconds since the UNIX epoch.
    pub timestamp: i64,
    pub price: f64,
    pub volume: f64,
    pub side: Side,
    pub trade_id: String,
}

/// Candle timeframes the engine aggregates and stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    M1,
    M5,
    M15,
}

impl Timeframe {
    pub const ALL: [Timeframe; 3] = [Timeframe::M1, Timeframe::M5, Timeframe::M15];

    pub fn secs(&self) -> i64 {
        match self {
            Self::M1 => 60,
            Self::M5 => 300,
            Self::M15 => 900,
        }
    }

    pub fn millis(&self) -> i64 {
        self.secs() * 1000
    }

    /// Storage table carrying candles of this timeframe.
    pub fn table(&self) -> &'static str {
        match self {
            Self::M1 => "candles_1m",
            Self::M5 => "candles_5m",
            Self::M15 => "candles_15m",
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::M1 => write!(f, "1m"),
            Self::M5 => write!(f, "5m"),
            Self::M15 => write!(f, "15m"),
        }
    }
}

/// An OHLCV candle with per-side taker volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    /// Milliseconds since the UNIX epoch, aligned to the timeframe.
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub buy_volume: f64,
    pub sell_volume: f64,
}

impl Candle {
    pub fn body(&self) -> f64 {
        (self.close - self.open).abs()
    }

    pub fn upper_wick(&self) -> f64 {
        self.high - self.open.max(self.close)
    }

    pub fn lower_wick(&self) -> f64 {
        self.open.min(self.close) - self.low
    }

    pub fn range(&self) -> f64 {
        self.high - self.low
    }

    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }
}

// ---------------------------------------------------------------------------
// Derived analytics records
// ---------------------------------------------------------------------------

/// Rolling order-flow metrics over a window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderFlowMetric {
    pub timestamp: i64,
    /// Cumulative volume delta: buy volume minus sell volume.
    pub cvd: f64,
    /// buy_volume / sell_volume. `None` when either side is zero.
    pub imbalance: Option<f64>,
    pub buy_volume: f64,
    pub sell_volume: f64,
    pub net_volume: f64,
    /// Ticks whose volume was at least `large_trade_factor` times the median.
    pub large_trades: u32,
}

/// Point of control and value area over a volume-by-price window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketProfile {
    pub timestamp: i64,
    /// Price level with maximum traded volume.
    pub poc: f64,
    /// Value area high: upper edge of the contiguous 70% volume area.
    pub vah: f64,
    /// Value area low: lower edge of the contiguous 70% volume area.
    pub val: f64,
}

/// Demand (support) or supply (resistance) zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ZoneKind {
    Demand,
    Supply,
}

impl ZoneKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Demand => "DEMAND",
            Self::Supply => "SUPPLY",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "DEMAND" => Some(Self::Demand),
            "SUPPLY" => Some(Self::Supply),
            _ => None,
        }
    }
}

/// Lifecycle of a zone: untouched, touched once or twice, or invalidated by a
/// close through the far edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ZoneState {
    Fresh,
    Tested,
    Broken,
}

impl ZoneState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fresh => "FRESH",
            Self::Tested => "TESTED",
            Self::Broken => "BROKEN",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "FRESH" => Some(Self::Fresh),
            "TESTED" => Some(Self::Tested),
            "BROKEN" => Some(Self::Broken),
            _ => None,
        }
    }
}

/// A supply or demand zone produced by base-then-thrust detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Zone {
    pub id: i64,
    pub kind: ZoneKind,
    pub price_low: f64,
    pub price_high: f64,
    /// Thrust candle magnitude relative to base width.
    pub strength: f64,
    pub test_count: u32,
    pub state: ZoneState,
    pub created_at: i64,
}

impl Zone {
    pub fn contains(&self, price: f64) -> bool {
        price >= self.price_low && price <= self.price_high
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GapDirection {
    Bullish,
    Bearish,
}

impl GapDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bullish => "BULLISH",
            Self::Bearish => "BEARISH",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "BULLISH" => Some(Self::Bullish),
            "BEARISH" => Some(Self::Bearish),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GapFill {
    Unfilled,
    Partial,
    Filled,
}

impl GapFill {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unfilled => "UNFILLED",
            Self::Partial => "PARTIAL",
            Self::Filled => "FILLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "UNFILLED" => Some(Self::Unfilled),
            "PARTIAL" => Some(Self::Partial),
            "FILLED" => Some(Self::Filled),
            _ => None,
        }
    }
}

/// A fair value gap left by a 3-candle imbalance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FairValueGap {
    pub id: i64,
    pub direction: GapDirection,
    pub gap_low: f64,
    pub gap_high: f64,
    /// Maximum excursion into the gap since creation, as a percentage [0,100].
    pub fill_pct: f64,
    pub fill: GapFill,
    pub created_at: i64,
}

/// Per-timeframe EMA trend direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrendDirection {
    Up,
    Down,
    Flat,
}

impl std::fmt::Display for TrendDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Up => write!(f, "Up"),
            Self::Down => write!(f, "Down"),
            Self::Flat => write!(f, "Flat"),
        }
    }
}

// ---------------------------------------------------------------------------
// Analytics snapshot
// ---------------------------------------------------------------------------

/// Windowed order-flow aggregate carried inside the snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderFlowStats {
    pub cvd: f64,
    pub buy_volume: f64,
    pub sell_volume: f64,
    /// buy_volume / sell_volume; `None` when either side is zero.
    pub imbalance: Option<f64>,
    pub net_volume: f64,
    pub large_trades: u32,
}

/// Rejection (pin-bar) read of the latest candle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectionSignal {
    pub bullish: bool,
    pub bearish: bool,
    /// Dominant wick length divided by body length. 0 when no body context.
    pub wick_body_ratio: f64,
}

/// Per-timeframe trend read plus the cross-timeframe agreement flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeframeTrends {
    pub m1: TrendDirection,
    pub m5: TrendDirection,
    pub m15: TrendDirection,
    pub aligned: bool,
}

/// The complete derived state of one symbol at one instant. Immutable once
/// published; the analytics engine replaces the cached snapshot wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsSnapshot {
    pub pair: PairId,
    pub computed_at: i64,
    pub last_price: f64,
    pub order_flow: OrderFlowStats,
    pub profile: Option<MarketProfile>,
    pub rejection: RejectionSignal,
    pub latest_candle: Option<Candle>,
    pub zones: Vec<Zone>,
    pub gaps: Vec<FairValueGap>,
    pub price_mean_15m: f64,
    pub price_stddev_15m: f64,
    /// (last_price - mean) / stddev; 0 when stddev is 0.
    pub zscore: f64,
    pub autocorrelation_lag1: f64,
    pub trends: TimeframeTrends,
}

impl AnalyticsSnapshot {
    /// Field-wise equality ignoring `computed_at`. The analytics engine
    /// republishes only when content changed or the publish interval elapsed.
    pub fn content_eq(&self, other: &Self) -> bool {
        self.pair == other.pair
            && self.last_price == other.last_price
            && self.order_flow == other.order_flow
            && self.profile == other.profile
            && self.rejection == other.rejection
            && self.latest_candle == other.latest_candle
            && self.zones == other.zones
            && self.gaps == other.gaps
            && self.price_mean_15m == other.price_mean_15m
            && self.price_stddev_15m == other.price_stddev_15m
            && self.zscore == other.zscore
            && self.autocorrelation_lag1 == other.autocorrelation_lag1
            && self.trends == other.trends
    }
}

// Zone / FairValueGap / Candle / MarketProfile equality is needed for the
// publish-on-change check; f64 fields compare by value which is what the
// diff wants.
impl PartialEq for Zone {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.kind == other.kind
            && self.state == other.state
            && self.test_count == other.test_count
            && self.price_low == other.price_low
            && self.price_high == other.price_high
    }
}

impl PartialEq for FairValueGap {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.direction == other.direction
            && self.fill == other.fill
            && self.fill_pct == other.fill_pct
    }
}

impl PartialEq for Candle {
    fn eq(&self, other: &Self) -> bool {
        self.open_time == other.open_time
            && self.open == other.open
            && self.high == other.high
            && self.low == other.low
            && self.close == other.close
            && self.volume == other.volume
    }
}

impl PartialEq for MarketProfile {
    fn eq(&self, other: &Self) -> bool {
        self.poc == other.poc && self.vah == other.vah && self.val == other.val
    }
}

// ---------------------------------------------------------------------------
// Trade signals
// ---------------------------------------------------------------------------

/// Confidence band derived from the confluence score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Confidence {
    Low,
    Medium,
    High,
    VeryHigh,
}

impl std::fmt::Display for Confidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "LOW"),
            Self::Medium => write!(f, "MEDIUM"),
            Self::High => write!(f, "HIGH"),
            Self::VeryHigh => write!(f, "VERY_HIGH"),
        }
    }
}

/// Outcome of one primary gate check, retained on the signal for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrimaryResult {
    pub name: String,
    pub passed: bool,
    pub direction: Option<Direction>,
    pub reason: String,
}

/// Contribution of one weighted filter, retained on the signal for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterScore {
    pub name: String,
    pub score: f64,
    pub weight: f64,
    pub reason: String,
}

/// A fully-qualified trade signal emitted by the decision engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeSignal {
    pub pair: PairId,
    pub direction: Direction,
    pub entry_price: f64,
    pub confluence_score: f64,
    /// Sum of all configured filter weights; the ceiling of `confluence_score`.
    pub max_possible_score: f64,
    pub confidence: Confidence,
    pub primary_results: Vec<PrimaryResult>,
    pub filter_scores: Vec<FilterScore>,
    pub suggested_stop: f64,
    pub suggested_target: Option<f64>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
    Stop,
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Market => write!(f, "MARKET"),
            Self::Limit => write!(f, "LIMIT"),
            Self::Stop => write!(f, "STOP"),
        }
    }
}

/// Order lifecycle states. Transitions are forward-only except `Partial`,
/// which may repeat as successive partial fills arrive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderState {
    Pending,
    Submitted,
    Active,
    Partial,
    Filled,
    Cancelled,
    Rejected,
    Failed,
}

impl OrderState {
    /// Position in the canonical forward chain. Terminal states share a rank.
    fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Submitted => 1,
            Self::Active => 2,
            Self::Partial => 3,
            Self::Filled | Self::Cancelled | Self::Rejected | Self::Failed => 4,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Filled | Self::Cancelled | Self::Rejected | Self::Failed)
    }

    /// Whether moving from `self` to `next` respects the state machine:
    /// strictly forward, except Partial → Partial.
    pub fn can_transition(&self, next: OrderState) -> bool {
        if self.is_terminal() {
            return false;
        }
        if *self == Self::Partial && next == Self::Partial {
            return true;
        }
        next.rank() > self.rank()
    }
}

impl std::fmt::Display for OrderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Submitted => "SUBMITTED",
            Self::Active => "ACTIVE",
            Self::Partial => "PARTIAL",
            Self::Filled => "FILLED",
            Self::Cancelled => "CANCELLED",
            Self::Rejected => "REJECTED",
            Self::Failed => "FAILED",
        };
        write!(f, "{s}")
    }
}

/// A tracked order. Owned exclusively by the execution engine's order manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    /// Internal identifier (UUID v4).
    pub id: String,
    /// Client-assigned identifier used for idempotent submission.
    pub client_id: String,
    /// Venue-assigned identifier, known after submission.
    pub venue_order_id: Option<String>,
    pub pair: PairId,
    pub direction: Direction,
    pub order_type: OrderType,
    pub quantity: f64,
    pub limit_price: Option<f64>,
    pub stop_price: Option<f64>,
    pub state: OrderState,
    pub filled_qty: f64,
    pub avg_fill_price: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub retry_count: u32,
    pub last_error: Option<String>,
}

// ---------------------------------------------------------------------------
// Positions
// ---------------------------------------------------------------------------

/// Why a position was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    TrailingStop,
    DumpDetected,
    CorrelatedDump,
    PortfolioHealth,
    CircuitBreaker,
    MaxHoldTime,
    ReconciledMissing,
    Manual,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::TrailingStop => "TRAILING_STOP",
            Self::DumpDetected => "DUMP_DETECTED",
            Self::CorrelatedDump => "CORRELATED_DUMP",
            Self::PortfolioHealth => "PORTFOLIO_HEALTH",
            Self::CircuitBreaker => "CIRCUIT_BREAKER",
            Self::MaxHoldTime => "MAX_HOLD_TIME",
            Self::ReconciledMissing => "RECONCILED_MISSING",
            Self::Manual => "MANUAL",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionState {
    Open,
    Closing,
    Closed,
    Failed,
}

impl std::fmt::Display for PositionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Open => "OPEN",
            Self::Closing => "CLOSING",
            Self::Closed => "CLOSED",
            Self::Failed => "FAILED",
        };
        write!(f, "{s}")
    }
}

/// How a position came to exist locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionSource {
    Execution,
    Reconciled,
}

/// A tracked position. Created by execution, owned by the position monitor
/// from `PositionOpened` onward. A closed position is never reopened.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    /// Unique identifier (UUID v4).
    pub id: String,
    pub pair: PairId,
    pub direction: Direction,
    pub entry_price: f64,
    pub quantity: f64,
    pub entry_time: DateTime<Utc>,
    pub asset_class: AssetClass,
    pub source: PositionSource,
    /// Trailing distance as a fraction of the best mark (0.005 = 0.5%).
    pub trailing_distance_pct: f64,
    pub trailing_stop_price: Option<f64>,
    /// Best mark seen for a long. `None` until the first update.
    pub highest_mark: Option<f64>,
    /// Best mark seen for a short. `None` until the first update.
    pub lowest_mark: Option<f64>,
    pub mark_price: f64,
    pub unrealized_pnl: f64,
    pub unrealized_pnl_pct: f64,
    pub state: PositionState,
    pub exit_reason: Option<ExitReason>,
    pub realized_pnl: Option<f64>,
}

impl Position {
    /// Age of the position in seconds at `now`.
    pub fn age_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.entry_time).num_seconds()
    }
}

// ---------------------------------------------------------------------------
// Balances
// ---------------------------------------------------------------------------

/// Balance snapshot for a single asset from a venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceInfo {
    pub asset: String,
    #[serde(default)]
    pub free: f64,
    #[serde(default)]
    pub locked: f64,
}

/// Whether the engine runs against real funds or the built-in paper venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountMode {
    Demo,
    Live,
}

impl Default for AccountMode {
    fn default() -> Self {
        Self::Demo
    }
}

impl std::fmt::Display for AccountMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Demo => write!(f, "Demo"),
            Self::Live => write!(f, "Live"),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
