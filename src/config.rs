// =============================================================================
// Engine Configuration — per-subsystem settings with atomic save
// =============================================================================
//
// Every recognized option lives here with its default. All fields carry
// `#[serde(default)]` so that adding new fields never breaks loading an older
// config file. Persistence uses an atomic tmp + rename pattern to prevent
// corruption on crash.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::{AccountMode, AssetClass, MarketType, PairId};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_queue_capacity() -> usize {
    10_000
}

fn default_base_dir() -> String {
    "data".to_string()
}

fn default_pool_size() -> usize {
    200
}

fn default_cleanup_interval_s() -> u64 {
    300
}

fn default_tick_retention_s() -> i64 {
    900
}

fn default_candle_1m_retention_s() -> i64 {
    900
}

fn default_candle_htf_retention_s() -> i64 {
    3600
}

fn default_order_flow_retention_s() -> i64 {
    900
}

fn default_profile_retention_s() -> i64 {
    900
}

fn default_gap_retention_s() -> i64 {
    86_400
}

fn default_max_zones_per_pair() -> usize {
    50
}

fn default_update_interval_s() -> u64 {
    2
}

fn default_order_flow_window_s() -> i64 {
    300
}

fn default_large_trade_factor() -> f64 {
    3.0
}

fn default_reversion_window_s() -> i64 {
    900
}

fn default_autocorr_samples() -> usize {
    100
}

fn default_ema_short() -> usize {
    9
}

fn default_ema_long() -> usize {
    21
}

fn default_profile_window_s() -> i64 {
    900
}

fn default_profile_bucket() -> f64 {
    0.1
}

fn default_min_confluence() -> f64 {
    3.0
}

fn default_min_flow_dominance() -> f64 {
    2.5
}

fn default_min_wick_body_ratio() -> f64 {
    2.0
}

fn default_zone_weight() -> f64 {
    2.0
}

fn default_profile_weight() -> f64 {
    1.5
}

fn default_reversion_weight() -> f64 {
    1.5
}

fn default_gap_weight() -> f64 {
    1.5
}

fn default_autocorr_weight() -> f64 {
    1.0
}

fn default_opposing_zone_weight() -> f64 {
    0.5
}

fn default_max_concurrent_positions() -> usize {
    3
}

fn default_position_size_pct() -> f64 {
    2.0
}

fn default_max_position_size_pct() -> f64 {
    5.0
}

fn default_min_reward_risk() -> f64 {
    1.5
}

fn default_stop_pct() -> f64 {
    2.0
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    1_000
}

fn default_retry_factor() -> f64 {
    2.0
}

fn default_retry_max_delay_ms() -> u64 {
    30_000
}

fn default_retry_jitter_pct() -> f64 {
    25.0
}

fn default_fill_timeout_s() -> u64 {
    10
}

fn default_fill_poll_ms() -> u64 {
    500
}

fn default_max_slippage_pct() -> f64 {
    1.0
}

fn default_risk_check_interval_s() -> u64 {
    10
}

fn default_leader_symbols() -> Vec<String> {
    vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]
}

fn default_leader_drop_pct() -> f64 {
    1.5
}

fn default_leader_window_s() -> i64 {
    300
}

fn default_correlation_close_threshold() -> f64 {
    0.7
}

fn default_breaker_levels() -> Vec<f64> {
    vec![3.0, 4.0, 5.0]
}

fn default_health_stop_entries() -> f64 {
    70.0
}

fn default_health_tighten() -> f64 {
    50.0
}

fn default_health_force_close() -> f64 {
    30.0
}

fn default_tightened_trail_pct() -> f64 {
    0.3
}

fn default_dump_consecutive_candles() -> usize {
    3
}

fn default_dump_flow_window_s() -> i64 {
    180
}

fn default_dump_flow_dominance() -> f64 {
    2.5
}

fn default_dump_momentum_break_pct() -> f64 {
    0.5
}

fn default_dump_min_signals() -> usize {
    2
}

fn default_reconcile_timeout_s() -> u64 {
    30
}

fn default_starting_capital() -> f64 {
    100_000.0
}

fn default_storage_query_timeout_s() -> u64 {
    5
}

fn default_venue_timeout_s() -> u64 {
    10
}

fn default_shutdown_window_s() -> u64 {
    10
}

fn default_trailing_by_class() -> HashMap<AssetClass, f64> {
    HashMap::from([
        (AssetClass::Major, 0.3),
        (AssetClass::Regular, 0.5),
        (AssetClass::Meme, 17.5),
        (AssetClass::Forex, 0.5),
        (AssetClass::Commodity, 0.5),
    ])
}

fn default_max_hold_by_class() -> HashMap<AssetClass, i64> {
    HashMap::from([
        (AssetClass::Major, 1_800),
        (AssetClass::Regular, 1_800),
        (AssetClass::Meme, 86_400),
        (AssetClass::Forex, 14_400),
        (AssetClass::Commodity, 14_400),
    ])
}

fn default_correlation_by_class() -> HashMap<AssetClass, f64> {
    HashMap::from([
        (AssetClass::Major, 0.75),
        (AssetClass::Regular, 0.40),
        (AssetClass::Meme, 0.60),
        (AssetClass::Forex, 0.0),
        (AssetClass::Commodity, 0.0),
    ])
}

fn default_symbols() -> Vec<SymbolConfig> {
    vec![
        SymbolConfig::new("binance", "BTCUSDT", AssetClass::Major, 1.0),
        SymbolConfig::new("binance", "ETHUSDT", AssetClass::Major, 0.1),
        SymbolConfig::new("binance", "SOLUSDT", AssetClass::Regular, 0.01),
        SymbolConfig::new("binance", "XRPUSDT", AssetClass::Regular, 0.0001),
        SymbolConfig::new("binance", "DOGEUSDT", AssetClass::Meme, 0.00001),
    ]
}

// =============================================================================
// Sections
// =============================================================================

/// One instrument the engine watches and trades.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolConfig {
    pub venue: String,
    #[serde(default)]
    pub market_type: MarketType,
    pub symbol: String,
    pub asset_class: AssetClass,
    /// Price bucket width for the volume-by-price histogram.
    #[serde(default = "default_profile_bucket")]
    pub profile_bucket: f64,
}

impl SymbolConfig {
    pub fn new(venue: &str, symbol: &str, asset_class: AssetClass, bucket: f64) -> Self {
        Self {
            venue: venue.to_string(),
            market_type: MarketType::Spot,
            symbol: symbol.to_string(),
            asset_class,
            profile_bucket: bucket,
        }
    }

    pub fn pair(&self) -> PairId {
        PairId::new(self.venue.clone(), self.market_type, self.symbol.clone())
    }
}

/// Event bus settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Hard per-publish timeout in milliseconds. `None` blocks until capacity
    /// frees.
    #[serde(default)]
    pub publish_timeout_ms: Option<u64>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            publish_timeout_ms: None,
        }
    }
}

/// Storage engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_base_dir")]
    pub base_dir: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_cleanup_interval_s")]
    pub cleanup_interval_s: u64,
    #[serde(default = "default_tick_retention_s")]
    pub tick_retention_s: i64,
    #[serde(default = "default_candle_1m_retention_s")]
    pub candle_1m_retention_s: i64,
    #[serde(default = "default_candle_htf_retention_s")]
    pub candle_htf_retention_s: i64,
    #[serde(default = "default_order_flow_retention_s")]
    pub order_flow_retention_s: i64,
    #[serde(default = "default_profile_retention_s")]
    pub profile_retention_s: i64,
    #[serde(default = "default_gap_retention_s")]
    pub gap_retention_s: i64,
    #[serde(default = "default_max_zones_per_pair")]
    pub max_zones_per_pair: usize,
    #[serde(default = "default_storage_query_timeout_s")]
    pub query_timeout_s: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            pool_size: default_pool_size(),
            cleanup_interval_s: default_cleanup_interval_s(),
            tick_retention_s: default_tick_retention_s(),
            candle_1m_retention_s: default_candle_1m_retention_s(),
            candle_htf_retention_s: default_candle_htf_retention_s(),
            order_flow_retention_s: default_order_flow_retention_s(),
            profile_retention_s: default_profile_retention_s(),
            gap_retention_s: default_gap_retention_s(),
            max_zones_per_pair: default_max_zones_per_pair(),
            query_timeout_s: default_storage_query_timeout_s(),
        }
    }
}

/// Analytics pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyticsConfig {
    #[serde(default = "default_update_interval_s")]
    pub update_interval_s: u64,
    #[serde(default = "default_order_flow_window_s")]
    pub order_flow_window_s: i64,
    #[serde(default = "default_large_trade_factor")]
    pub large_trade_factor: f64,
    #[serde(default = "default_reversion_window_s")]
    pub reversion_window_s: i64,
    #[serde(default = "default_autocorr_samples")]
    pub autocorr_samples: usize,
    #[serde(default = "default_ema_short")]
    pub ema_short: usize,
    #[serde(default = "default_ema_long")]
    pub ema_long: usize,
    #[serde(default = "default_profile_window_s")]
    pub profile_window_s: i64,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            update_interval_s: default_update_interval_s(),
            order_flow_window_s: default_order_flow_window_s(),
            large_trade_factor: default_large_trade_factor(),
            reversion_window_s: default_reversion_window_s(),
            autocorr_samples: default_autocorr_samples(),
            ema_short: default_ema_short(),
            ema_long: default_ema_long(),
            profile_window_s: default_profile_window_s(),
        }
    }
}

/// Per-filter weights of the confluence model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterWeights {
    #[serde(default = "default_zone_weight")]
    pub zone: f64,
    #[serde(default = "default_profile_weight")]
    pub profile: f64,
    #[serde(default = "default_reversion_weight")]
    pub reversion: f64,
    #[serde(default = "default_gap_weight")]
    pub gap: f64,
    #[serde(default = "default_autocorr_weight")]
    pub autocorrelation: f64,
    #[serde(default = "default_opposing_zone_weight")]
    pub opposing_zone: f64,
}

impl FilterWeights {
    /// Ceiling of the confluence score under this weight set.
    pub fn max_possible_score(&self) -> f64 {
        self.zone
            + self.profile
            + self.reversion
            + self.gap
            + self.autocorrelation
            + self.opposing_zone
    }
}

impl Default for FilterWeights {
    fn default() -> Self {
        Self {
            zone: default_zone_weight(),
            profile: default_profile_weight(),
            reversion: default_reversion_weight(),
            gap: default_gap_weight(),
            autocorrelation: default_autocorr_weight(),
            opposing_zone: default_opposing_zone_weight(),
        }
    }
}

/// Decision engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionConfig {
    #[serde(default = "default_min_confluence")]
    pub min_confluence: f64,
    /// Minimum buy/sell (or sell/buy) dominance for the order-flow primary.
    #[serde(default = "default_min_flow_dominance")]
    pub min_flow_dominance: f64,
    /// Minimum wick-to-body ratio for the rejection primary.
    #[serde(default = "default_min_wick_body_ratio")]
    pub min_wick_body_ratio: f64,
    #[serde(default)]
    pub weights: FilterWeights,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            min_confluence: default_min_confluence(),
            min_flow_dominance: default_min_flow_dominance(),
            min_wick_body_ratio: default_min_wick_body_ratio(),
            weights: FilterWeights::default(),
        }
    }
}

/// Execution pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default = "default_max_concurrent_positions")]
    pub max_concurrent_positions: usize,
    #[serde(default = "default_position_size_pct")]
    pub default_position_size_pct: f64,
    #[serde(default = "default_max_position_size_pct")]
    pub max_position_size_pct: f64,
    #[serde(default = "default_min_reward_risk")]
    pub min_reward_risk: f64,
    /// Imposed stop distance (percent adverse from entry) when a signal
    /// carries none.
    #[serde(default = "default_stop_pct")]
    pub default_stop_pct: f64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_factor")]
    pub retry_factor: f64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    #[serde(default = "default_retry_jitter_pct")]
    pub retry_jitter_pct: f64,
    #[serde(default = "default_fill_timeout_s")]
    pub fill_timeout_s: u64,
    #[serde(default = "default_fill_poll_ms")]
    pub fill_poll_ms: u64,
    #[serde(default = "default_max_slippage_pct")]
    pub max_slippage_pct: f64,
    /// When true, fills whose slippage exceeds `max_slippage_pct` are rejected
    /// instead of merely recorded.
    #[serde(default)]
    pub reject_on_slippage: bool,
    #[serde(default = "default_venue_timeout_s")]
    pub venue_timeout_s: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_positions: default_max_concurrent_positions(),
            default_position_size_pct: default_position_size_pct(),
            max_position_size_pct: default_max_position_size_pct(),
            min_reward_risk: default_min_reward_risk(),
            default_stop_pct: default_stop_pct(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_factor: default_retry_factor(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            retry_jitter_pct: default_retry_jitter_pct(),
            fill_timeout_s: default_fill_timeout_s(),
            fill_poll_ms: default_fill_poll_ms(),
            max_slippage_pct: default_max_slippage_pct(),
            reject_on_slippage: false,
            venue_timeout_s: default_venue_timeout_s(),
        }
    }
}

/// Dump detector thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DumpConfig {
    #[serde(default = "default_dump_consecutive_candles")]
    pub consecutive_candles: usize,
    #[serde(default = "default_dump_flow_window_s")]
    pub flow_flip_window_s: i64,
    #[serde(default = "default_dump_flow_dominance")]
    pub flow_dominance: f64,
    #[serde(default = "default_dump_momentum_break_pct")]
    pub momentum_break_pct: f64,
    /// How many of the three signals must fire to force-close.
    #[serde(default = "default_dump_min_signals")]
    pub min_signals: usize,
}

impl Default for DumpConfig {
    fn default() -> Self {
        Self {
            consecutive_candles: default_dump_consecutive_candles(),
            flow_flip_window_s: default_dump_flow_window_s(),
            flow_dominance: default_dump_flow_dominance(),
            momentum_break_pct: default_dump_momentum_break_pct(),
            min_signals: default_dump_min_signals(),
        }
    }
}

/// Portfolio health score thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthThresholds {
    #[serde(default = "default_health_stop_entries")]
    pub stop_entries: f64,
    #[serde(default = "default_health_tighten")]
    pub tighten_trails: f64,
    #[serde(default = "default_health_force_close")]
    pub force_close: f64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            stop_entries: default_health_stop_entries(),
            tighten_trails: default_health_tighten(),
            force_close: default_health_force_close(),
        }
    }
}

/// Position monitor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionConfig {
    /// Trailing distance percent per asset class (0.3 means 0.3%).
    #[serde(default = "default_trailing_by_class")]
    pub trailing_distance_by_asset_class: HashMap<AssetClass, f64>,
    /// Maximum hold time in seconds per asset class.
    #[serde(default = "default_max_hold_by_class")]
    pub max_hold_by_asset_class: HashMap<AssetClass, i64>,
    /// Static leader correlation per asset class.
    #[serde(default = "default_correlation_by_class")]
    pub correlation_by_asset_class: HashMap<AssetClass, f64>,
    #[serde(default = "default_risk_check_interval_s")]
    pub risk_check_interval_s: u64,
    /// Market leaders tracked for the correlated-dump policy.
    #[serde(default = "default_leader_symbols")]
    pub leader_symbols: Vec<String>,
    /// Leader drop (percent, positive number) that triggers correlated exits.
    #[serde(default = "default_leader_drop_pct")]
    pub leader_drop_pct: f64,
    #[serde(default = "default_leader_window_s")]
    pub leader_window_s: i64,
    #[serde(default = "default_correlation_close_threshold")]
    pub correlation_close_threshold: f64,
    /// Daily drawdown percentages for breaker levels 1..=3.
    #[serde(default = "default_breaker_levels")]
    pub circuit_breaker_levels: Vec<f64>,
    #[serde(default)]
    pub health_thresholds: HealthThresholds,
    /// Trailing distance applied to all positions when health degrades.
    #[serde(default = "default_tightened_trail_pct")]
    pub tightened_trail_pct: f64,
    #[serde(default)]
    pub dump: DumpConfig,
}

impl Default for PositionConfig {
    fn default() -> Self {
        Self {
            trailing_distance_by_asset_class: default_trailing_by_class(),
            max_hold_by_asset_class: default_max_hold_by_class(),
            correlation_by_asset_class: default_correlation_by_class(),
            risk_check_interval_s: default_risk_check_interval_s(),
            leader_symbols: default_leader_symbols(),
            leader_drop_pct: default_leader_drop_pct(),
            leader_window_s: default_leader_window_s(),
            correlation_close_threshold: default_correlation_close_threshold(),
            circuit_breaker_levels: default_breaker_levels(),
            health_thresholds: HealthThresholds::default(),
            tightened_trail_pct: default_tightened_trail_pct(),
            dump: DumpConfig::default(),
        }
    }
}

/// Startup reconciliation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationConfig {
    /// Per-venue timeout for the authoritative position fetch.
    #[serde(default = "default_reconcile_timeout_s")]
    pub timeout_s: u64,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            timeout_s: default_reconcile_timeout_s(),
        }
    }
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Top-level engine configuration. Every field has a serde default so that
/// older JSON files missing new fields still deserialize.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub account_mode: AccountMode,

    /// Starting equity used by the drawdown breaker and demo sizing.
    #[serde(default = "default_starting_capital")]
    pub starting_capital: f64,

    #[serde(default = "default_symbols")]
    pub symbols: Vec<SymbolConfig>,

    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub analytics: AnalyticsConfig,
    #[serde(default)]
    pub decision: DecisionConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub position: PositionConfig,
    #[serde(default)]
    pub reconciliation: ReconciliationConfig,

    /// Bounded time each component gets to stop cleanly.
    #[serde(default = "default_shutdown_window_s")]
    pub shutdown_window_s: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            account_mode: AccountMode::default(),
            starting_capital: default_starting_capital(),
            symbols: default_symbols(),
            bus: BusConfig::default(),
            storage: StorageConfig::default(),
            analytics: AnalyticsConfig::default(),
            decision: DecisionConfig::default(),
            execution: ExecutionConfig::default(),
            position: PositionConfig::default(),
            reconciliation: ReconciliationConfig::default(),
            shutdown_window_s: default_shutdown_window_s(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse engine config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = config.symbols.len(),
            account_mode = %config.account_mode,
            "engine config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise engine config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "engine config saved (atomic)");
        Ok(())
    }

    /// Look up the config entry for `symbol`, if the engine watches it.
    pub fn symbol(&self, symbol: &str) -> Option<&SymbolConfig> {
        self.symbols.iter().find(|s| s.symbol == symbol)
    }

    /// Trailing distance percent for an asset class, falling back to the
    /// regular-crypto default.
    pub fn trailing_pct(&self, class: AssetClass) -> f64 {
        self.position
            .trailing_distance_by_asset_class
            .get(&class)
            .copied()
            .unwrap_or(0.5)
    }

    /// Maximum hold time in seconds for an asset class.
    pub fn max_hold_secs(&self, class: AssetClass) -> i64 {
        self.position
            .max_hold_by_asset_class
            .get(&class)
            .copied()
            .unwrap_or(1_800)
    }

    /// Configured leader correlation for an asset class.
    pub fn correlation(&self, class: AssetClass) -> f64 {
        self.position
            .correlation_by_asset_class
            .get(&class)
            .copied()
            .unwrap_or(0.0)
    }
}

// =============================================================================
// Tests
// =============================================================================
