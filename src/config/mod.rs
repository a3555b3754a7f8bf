//! Configuration management for the arbitrage engine.
//!
//! Loads settings from environment variables and config files; a failed
//! `validate()` refuses startup rather than proceeding with undefined
//! behavior.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;

/// Main engine configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Venue identifiers to trade across (e.g. "okx_perpetual").
    #[serde(default = "default_venues")]
    pub venues: Vec<String>,
    /// Tokens to scan (base assets, e.g. "BTC").
    #[serde(default = "default_tokens")]
    pub tokens: Vec<String>,
    /// Leverage applied to both legs.
    #[serde(default = "default_leverage")]
    pub leverage: u32,

    /// Lower bound on the daily-normalized funding differential.
    #[serde(default = "default_min_funding_rate_diff")]
    pub min_funding_rate_diff: Decimal,
    /// Lower bound on the decomposed edge (quote currency).
    #[serde(default = "default_min_edge_required")]
    pub min_edge_required: Decimal,
    /// Settlement buffer in the edge decomposition, as a rate.
    #[serde(default = "default_settlement_buffer_bps")]
    pub settlement_buffer_rate: Decimal,
    /// Combined PnL fraction of notional that triggers take-profit.
    #[serde(default = "default_profitability_to_take_profit")]
    pub profitability_to_take_profit: Decimal,
    /// Daily funding differential below which the position is stopped out.
    #[serde(default = "default_funding_rate_diff_stop_loss")]
    pub funding_rate_diff_stop_loss: Decimal,
    /// Also require non-negative trade profitability after round-trip fees.
    #[serde(default)]
    pub trade_profitability_condition_to_enter: bool,

    /// Sizing: fixed notional per position in quote currency.
    #[serde(default = "default_position_size_quote")]
    pub position_size_quote: Decimal,
    /// Sizing: fraction of initial balance (0 disables); split across
    /// positions when a per-connector cap is set.
    #[serde(default)]
    pub position_size_quote_pct: Decimal,
    /// 0 = unlimited.
    #[serde(default)]
    pub max_positions_per_connector: u32,

    #[serde(default = "default_max_slippage_pct")]
    pub max_slippage_pct: Decimal,
    #[serde(default = "default_min_order_book_depth_multiplier")]
    pub min_order_book_depth_multiplier: Decimal,
    #[serde(default = "default_true")]
    pub check_order_book_depth_enabled: bool,
    #[serde(default = "default_min_time_to_next_funding")]
    pub min_time_to_next_funding_seconds: u64,

    #[serde(default = "default_pending_validation_timeout")]
    pub pending_validation_timeout_seconds: u64,
    #[serde(default = "default_pending_validation_max_attempts")]
    pub pending_validation_max_attempts: u32,
    #[serde(default = "default_close_validation_timeout")]
    pub close_validation_timeout_seconds: u64,
    #[serde(default = "default_min_position_hold_minutes")]
    pub min_position_hold_time_minutes: u64,
    #[serde(default = "default_max_position_imbalance_pct")]
    pub max_position_imbalance_pct: Decimal,
    #[serde(default = "default_true")]
    pub position_validation_enabled: bool,
    #[serde(default = "default_true")]
    pub emergency_close_on_imbalance: bool,

    #[serde(default = "default_tick_interval")]
    pub tick_interval_seconds: u64,
    #[serde(default = "default_stats_interval")]
    pub stats_interval_seconds: u64,

    /// Per-venue taker fee estimates for the edge decomposition.
    #[serde(default)]
    pub taker_fees: HashMap<String, Decimal>,
    /// Hourly borrow rates per asset for leveraged legs.
    #[serde(default)]
    pub borrow_rates: HashMap<String, Decimal>,
    /// Slippage estimates per venue, as a rate.
    #[serde(default)]
    pub slippage_estimates: HashMap<String, Decimal>,

    #[serde(default)]
    pub risk: RiskLimitsConfig,
    #[serde(default)]
    pub reliability: ReliabilityConfig,
    #[serde(default)]
    pub margin: MarginConfig,
    #[serde(default)]
    pub reconciliation: ReconciliationConfig,
    #[serde(default)]
    pub demo: DemoConfig,
    #[serde(default)]
    pub health: HealthConfig,
}

/// Risk limit parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct RiskLimitsConfig {
    #[serde(default = "default_max_notional_per_exchange")]
    pub max_notional_per_exchange: Decimal,
    #[serde(default = "default_max_notional_per_subaccount")]
    pub max_notional_per_subaccount: Decimal,
    #[serde(default = "default_max_total_notional")]
    pub max_total_notional: Decimal,
    #[serde(default = "default_max_leverage")]
    pub max_leverage: Decimal,
    #[serde(default = "default_max_hedge_gap_pct")]
    pub max_hedge_gap_pct: Decimal,
    #[serde(default = "default_max_concentration_pct")]
    pub max_concentration_pct: Decimal,
    /// Fraction of a limit at which warnings fire.
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: Decimal,
    /// Hedge-gap warnings fire earlier than the other limits.
    #[serde(default = "default_hedge_gap_warning_threshold")]
    pub hedge_gap_warning_threshold: Decimal,
}

/// Reliability plane parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct ReliabilityConfig {
    #[serde(default = "default_true")]
    pub time_sync_enabled: bool,
    #[serde(default = "default_time_sync_drift_threshold_ms")]
    pub time_sync_drift_threshold_ms: f64,
    #[serde(default = "default_time_sync_check_interval")]
    pub time_sync_check_interval_seconds: u64,
    #[serde(default = "default_max_drift_violations")]
    pub max_drift_violations: u32,
    #[serde(default = "default_ntp_servers")]
    pub ntp_servers: Vec<String>,

    #[serde(default = "default_error_series_threshold")]
    pub error_series_threshold: u32,
    #[serde(default = "default_hedge_deviation_threshold")]
    pub hedge_deviation_threshold: u32,
    #[serde(default = "default_order_cancellation_threshold")]
    pub order_cancellation_threshold: u32,

    #[serde(default = "default_readiness_check_interval")]
    pub readiness_check_interval_seconds: u64,
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_seconds: u64,

    #[serde(default = "default_true")]
    pub rate_limiting_enabled: bool,
    #[serde(default = "default_rate_capacity")]
    pub default_rate_capacity: u32,
    #[serde(default = "default_rate_refill")]
    pub default_rate_refill: f64,
    /// Per-venue `{capacity, refill_rate}` overrides.
    #[serde(default)]
    pub venue_rate_limits: HashMap<String, VenueRateLimit>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VenueRateLimit {
    pub capacity: u32,
    pub refill_rate: f64,
}

/// Margin monitoring parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct MarginConfig {
    /// Buffer above maintenance margin when computing safe leverage.
    #[serde(default = "default_safety_buffer")]
    pub safety_buffer: Decimal,
    #[serde(default = "default_max_allowed_leverage")]
    pub max_allowed_leverage: Decimal,
    #[serde(default = "default_true")]
    pub auto_leverage_reduction: bool,
    #[serde(default = "default_margin_check_interval")]
    pub check_interval_seconds: u64,
}

/// Reconciliation parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct ReconciliationConfig {
    #[serde(default = "default_true")]
    pub auto_position_reconciliation: bool,
    #[serde(default = "default_reconciliation_interval")]
    pub interval_seconds: u64,
    #[serde(default = "default_true")]
    pub auto_fix_enabled: bool,
    #[serde(default = "default_max_auto_fix_amount")]
    pub max_auto_fix_amount: Decimal,
    #[serde(default = "default_true")]
    pub emergency_stop_on_critical_issues: bool,
}

/// Simulated-fill mode parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct DemoConfig {
    #[serde(default)]
    pub demo_mode: bool,
    #[serde(default = "default_demo_balance")]
    pub demo_account_balance_quote: Decimal,
    #[serde(default = "default_demo_fill_delay")]
    pub demo_fill_delay_seconds: u64,
    #[serde(default = "default_demo_close_delay")]
    pub demo_close_delay_seconds: u64,
}

/// Health endpoint parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_health_host")]
    pub host: String,
    #[serde(default = "default_health_port")]
    pub port: u16,
}

// Default value functions

fn default_venues() -> Vec<String> {
    vec![
        "okx_perpetual".to_string(),
        "bybit_perpetual".to_string(),
        "hyperliquid_perpetual".to_string(),
    ]
}

fn default_tokens() -> Vec<String> {
    vec!["WIF".to_string(), "FET".to_string()]
}

fn default_leverage() -> u32 {
    1
}

fn default_min_funding_rate_diff() -> Decimal {
    Decimal::new(1, 3) // 0.001 per day
}

fn default_min_edge_required() -> Decimal {
    Decimal::new(5, 4) // 0.0005 quote
}

fn default_settlement_buffer_bps() -> Decimal {
    Decimal::new(1, 4) // 0.0001
}

fn default_profitability_to_take_profit() -> Decimal {
    Decimal::new(1, 2) // 0.01 = 1% of notional
}

fn default_funding_rate_diff_stop_loss() -> Decimal {
    Decimal::new(-1, 3) // -0.001 per day
}

fn default_position_size_quote() -> Decimal {
    Decimal::new(100, 0)
}

fn default_max_slippage_pct() -> Decimal {
    Decimal::new(5, 3) // 0.005
}

fn default_min_order_book_depth_multiplier() -> Decimal {
    Decimal::new(3, 0)
}

fn default_min_time_to_next_funding() -> u64 {
    300
}

fn default_pending_validation_timeout() -> u64 {
    10
}

fn default_pending_validation_max_attempts() -> u32 {
    3
}

fn default_close_validation_timeout() -> u64 {
    60
}

fn default_min_position_hold_minutes() -> u64 {
    10
}

fn default_max_position_imbalance_pct() -> Decimal {
    Decimal::new(10, 2) // 0.10
}

fn default_tick_interval() -> u64 {
    1
}

fn default_stats_interval() -> u64 {
    300
}

fn default_max_notional_per_exchange() -> Decimal {
    Decimal::new(50_000, 0)
}

fn default_max_notional_per_subaccount() -> Decimal {
    Decimal::new(20_000, 0)
}

fn default_max_total_notional() -> Decimal {
    Decimal::new(200_000, 0)
}

fn default_max_leverage() -> Decimal {
    Decimal::new(10, 0)
}

fn default_max_hedge_gap_pct() -> Decimal {
    Decimal::new(5, 2) // 0.05
}

fn default_max_concentration_pct() -> Decimal {
    Decimal::new(30, 2) // 0.30
}

fn default_warning_threshold() -> Decimal {
    Decimal::new(80, 2) // 0.80
}

fn default_hedge_gap_warning_threshold() -> Decimal {
    Decimal::new(60, 2) // 0.60
}

fn default_time_sync_drift_threshold_ms() -> f64 {
    1000.0
}

fn default_time_sync_check_interval() -> u64 {
    60
}

fn default_max_drift_violations() -> u32 {
    3
}

fn default_ntp_servers() -> Vec<String> {
    vec![
        "pool.ntp.org".to_string(),
        "time.google.com".to_string(),
        "time.cloudflare.com".to_string(),
        "time.apple.com".to_string(),
    ]
}

fn default_error_series_threshold() -> u32 {
    5
}

fn default_hedge_deviation_threshold() -> u32 {
    3
}

fn default_order_cancellation_threshold() -> u32 {
    10
}

fn default_readiness_check_interval() -> u64 {
    30
}

fn default_connection_timeout() -> u64 {
    60
}

fn default_rate_capacity() -> u32 {
    100
}

fn default_rate_refill() -> f64 {
    10.0
}

fn default_safety_buffer() -> Decimal {
    Decimal::new(20, 2) // 0.20
}

fn default_max_allowed_leverage() -> Decimal {
    Decimal::new(5, 0)
}

fn default_margin_check_interval() -> u64 {
    30
}

fn default_reconciliation_interval() -> u64 {
    60
}

fn default_max_auto_fix_amount() -> Decimal {
    Decimal::new(1000, 0)
}

fn default_demo_balance() -> Decimal {
    Decimal::new(10_000, 0)
}

fn default_demo_fill_delay() -> u64 {
    2
}

fn default_demo_close_delay() -> u64 {
    2
}

fn default_health_host() -> String {
    "127.0.0.1".to_string()
}

fn default_health_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

impl Default for RiskLimitsConfig {
    fn default() -> Self {
        Self {
            max_notional_per_exchange: default_max_notional_per_exchange(),
            max_notional_per_subaccount: default_max_notional_per_subaccount(),
            max_total_notional: default_max_total_notional(),
            max_leverage: default_max_leverage(),
            max_hedge_gap_pct: default_max_hedge_gap_pct(),
            max_concentration_pct: default_max_concentration_pct(),
            warning_threshold: default_warning_threshold(),
            hedge_gap_warning_threshold: default_hedge_gap_warning_threshold(),
        }
    }
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            time_sync_enabled: true,
            time_sync_drift_threshold_ms: default_time_sync_drift_threshold_ms(),
            time_sync_check_interval_seconds: default_time_sync_check_interval(),
            max_drift_violations: default_max_drift_violations(),
            ntp_servers: default_ntp_servers(),
            error_series_threshold: default_error_series_threshold(),
            hedge_deviation_threshold: default_hedge_deviation_threshold(),
            order_cancellation_threshold: default_order_cancellation_threshold(),
            readiness_check_interval_seconds: default_readiness_check_interval(),
            connection_timeout_seconds: default_connection_timeout(),
            rate_limiting_enabled: true,
            default_rate_capacity: default_rate_capacity(),
            default_rate_refill: default_rate_refill(),
            venue_rate_limits: HashMap::new(),
        }
    }
}

impl Default for MarginConfig {
    fn default() -> Self {
        Self {
            safety_buffer: default_safety_buffer(),
            max_allowed_leverage: default_max_allowed_leverage(),
            auto_leverage_reduction: true,
            check_interval_seconds: default_margin_check_interval(),
        }
    }
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            auto_position_reconciliation: true,
            interval_seconds: default_reconciliation_interval(),
            auto_fix_enabled: true,
            max_auto_fix_amount: default_max_auto_fix_amount(),
            emergency_stop_on_critical_issues: true,
        }
    }
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            demo_mode: false,
            demo_account_balance_quote: default_demo_balance(),
            demo_fill_delay_seconds: default_demo_fill_delay(),
            demo_close_delay_seconds: default_demo_close_delay(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_health_host(),
            port: default_health_port(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            venues: default_venues(),
            tokens: default_tokens(),
            leverage: default_leverage(),
            min_funding_rate_diff: default_min_funding_rate_diff(),
            min_edge_required: default_min_edge_required(),
            settlement_buffer_rate: default_settlement_buffer_bps(),
            profitability_to_take_profit: default_profitability_to_take_profit(),
            funding_rate_diff_stop_loss: default_funding_rate_diff_stop_loss(),
            trade_profitability_condition_to_enter: false,
            position_size_quote: default_position_size_quote(),
            position_size_quote_pct: Decimal::ZERO,
            max_positions_per_connector: 0,
            max_slippage_pct: default_max_slippage_pct(),
            min_order_book_depth_multiplier: default_min_order_book_depth_multiplier(),
            check_order_book_depth_enabled: true,
            min_time_to_next_funding_seconds: default_min_time_to_next_funding(),
            pending_validation_timeout_seconds: default_pending_validation_timeout(),
            pending_validation_max_attempts: default_pending_validation_max_attempts(),
            close_validation_timeout_seconds: default_close_validation_timeout(),
            min_position_hold_time_minutes: default_min_position_hold_minutes(),
            max_position_imbalance_pct: default_max_position_imbalance_pct(),
            position_validation_enabled: true,
            emergency_close_on_imbalance: true,
            tick_interval_seconds: default_tick_interval(),
            stats_interval_seconds: default_stats_interval(),
            taker_fees: HashMap::new(),
            borrow_rates: HashMap::new(),
            slippage_estimates: HashMap::new(),
            risk: RiskLimitsConfig::default(),
            reliability: ReliabilityConfig::default(),
            margin: MarginConfig::default(),
            reconciliation: ReconciliationConfig::default(),
            demo: DemoConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from `config.*` files and `FAE__`-prefixed
    /// environment variables.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::default().separator("__").prefix("FAE"))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values. Bad input refuses startup.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.venues.len() >= 2, "at least two venues are required");
        anyhow::ensure!(!self.tokens.is_empty(), "at least one token is required");
        anyhow::ensure!(self.leverage >= 1, "leverage must be >= 1");
        anyhow::ensure!(
            Decimal::from(self.leverage) <= self.risk.max_leverage,
            "leverage exceeds risk.max_leverage"
        );
        anyhow::ensure!(
            self.max_position_imbalance_pct > Decimal::ZERO
                && self.max_position_imbalance_pct <= Decimal::ONE,
            "max_position_imbalance_pct must be in (0, 1]"
        );
        anyhow::ensure!(
            self.position_size_quote_pct >= Decimal::ZERO
                && self.position_size_quote_pct <= Decimal::ONE,
            "position_size_quote_pct must be in [0, 1]"
        );
        anyhow::ensure!(
            self.position_size_quote > Decimal::ZERO || self.position_size_quote_pct > Decimal::ZERO,
            "one of position_size_quote / position_size_quote_pct must be positive"
        );
        anyhow::ensure!(
            self.max_slippage_pct > Decimal::ZERO,
            "max_slippage_pct must be positive"
        );
        anyhow::ensure!(self.tick_interval_seconds >= 1, "tick interval must be >= 1s");
        anyhow::ensure!(
            self.risk.warning_threshold > Decimal::ZERO
                && self.risk.warning_threshold < Decimal::ONE,
            "risk.warning_threshold must be in (0, 1)"
        );
        anyhow::ensure!(
            self.margin.safety_buffer >= Decimal::ZERO,
            "margin.safety_buffer must be non-negative"
        );
        if self.demo.demo_mode {
            anyhow::ensure!(
                self.demo.demo_account_balance_quote > Decimal::ZERO,
                "demo_account_balance_quote must be positive in demo mode"
            );
        }
        Ok(())
    }

    /// Taker fee estimate for a venue; unknown venues use the
    /// conservative 0.1% default.
    pub fn taker_fee(&self, venue: &str) -> Decimal {
        self.taker_fees
            .get(venue)
            .copied()
            .unwrap_or_else(|| Decimal::new(1, 3))
    }

    /// Slippage estimate for a venue; unknown venues use 0.05%.
    pub fn slippage_estimate(&self, venue: &str) -> Decimal {
        self.slippage_estimates
            .get(venue)
            .copied()
            .unwrap_or_else(|| Decimal::new(5, 4))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_single_venue() {
        let config = EngineConfig {
            venues: vec!["okx_perpetual".to_string()],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_leverage() {
        let config = EngineConfig {
            leverage: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_sizing() {
        let config = EngineConfig {
            position_size_quote: Decimal::ZERO,
            position_size_quote_pct: Decimal::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_fee_fallbacks() {
        let mut config = EngineConfig::default();
        config
            .taker_fees
            .insert("okx_perpetual".to_string(), dec!(0.0005));
        assert_eq!(config.taker_fee("okx_perpetual"), dec!(0.0005));
        assert_eq!(config.taker_fee("unknown"), dec!(0.001));
        assert_eq!(config.slippage_estimate("unknown"), dec!(0.0005));
    }
}
