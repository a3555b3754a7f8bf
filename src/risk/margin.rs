//! Margin health monitoring and leverage protection.
//!
//! Classifies account and position margin health, computes safe leverage
//! from tiered margin requirements, assesses ADL risk, and drives the
//! reduce/close/exit action chain. Leverage reduction actually submits a
//! leverage change to the venue and falls back to a partial close when
//! the venue refuses.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};

use crate::venue::{
    OrderRequest, OrderSide, OrderType, PositionSide, TradingPair, Venue, VenueError, VenueId,
};

/// Margin health ladder by margin ratio (equity / used margin).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MarginStatus {
    /// ratio >= 2.0
    Healthy,
    /// ratio >= 1.5
    Warning,
    /// ratio >= 1.1
    Danger,
    /// ratio >= 1.0
    Critical,
    /// ratio < 1.0
    LiquidationRisk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdlRisk {
    Low,
    Medium,
    High,
    Imminent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MarginAction {
    Monitor,
    ReduceLeverage,
    ClosePositions,
    AddMargin,
    EmergencyExit,
}

/// Account-level margin snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct MarginInfo {
    pub venue: VenueId,
    pub account_id: Option<String>,
    pub total_equity: Decimal,
    pub used_margin: Decimal,
    pub free_margin: Decimal,
    /// total_equity / used_margin
    pub margin_ratio: Decimal,
    pub maintenance_margin: Decimal,
    pub initial_margin_req: Decimal,
    pub liquidation_price: Option<Decimal>,
    pub timestamp: DateTime<Utc>,
}

impl MarginInfo {
    pub fn margin_health(&self) -> MarginStatus {
        if self.margin_ratio >= dec!(2.0) {
            MarginStatus::Healthy
        } else if self.margin_ratio >= dec!(1.5) {
            MarginStatus::Warning
        } else if self.margin_ratio >= dec!(1.1) {
            MarginStatus::Danger
        } else if self.margin_ratio >= dec!(1.0) {
            MarginStatus::Critical
        } else {
            MarginStatus::LiquidationRisk
        }
    }

    pub fn utilization_pct(&self) -> Decimal {
        if self.total_equity == Decimal::ZERO {
            return Decimal::ZERO;
        }
        self.used_margin / self.total_equity * dec!(100)
    }
}

/// Per-position margin snapshot. Venue-specific fields (ADL indicator,
/// liquidation price) are optional; absence falls back conservatively.
#[derive(Debug, Clone, Serialize)]
pub struct PositionMarginInfo {
    pub position_id: String,
    pub venue: VenueId,
    pub pair: TradingPair,
    pub side: PositionSide,
    pub size: Decimal,
    pub notional_value: Decimal,
    pub leverage: Decimal,
    pub initial_margin: Decimal,
    pub maintenance_margin: Decimal,
    pub unrealized_pnl: Decimal,
    pub liquidation_price: Option<Decimal>,
    pub current_mark_price: Option<Decimal>,
    pub adl_indicator: Option<u8>,
    pub timestamp: DateTime<Utc>,
}

impl PositionMarginInfo {
    /// Distance to liquidation as a percentage of the mark price;
    /// positive means safe. Absent when either price is missing.
    pub fn distance_to_liquidation_pct(&self) -> Option<Decimal> {
        let liquidation = self.liquidation_price?;
        let mark = self.current_mark_price?;
        if mark == Decimal::ZERO {
            return None;
        }
        let distance = match self.side {
            PositionSide::Long => mark - liquidation,
            PositionSide::Short => liquidation - mark,
        };
        Some(distance / mark * dec!(100))
    }
}

const DEFAULT_INITIAL_MARGIN_RATE: Decimal = dec!(0.1);
const DEFAULT_MAINTENANCE_MARGIN_RATE: Decimal = dec!(0.05);
const CONSERVATIVE_DEFAULT_LEVERAGE: Decimal = dec!(3);

/// Margin requirements reported by (or configured for) one venue.
#[derive(Debug, Clone, Default)]
pub struct MarginRequirements {
    pub initial_margin_rates: HashMap<String, Decimal>,
    pub maintenance_margin_rates: HashMap<String, Decimal>,
    pub max_leverage: HashMap<String, Decimal>,
    /// symbol -> [(tier notional cap, initial rate)], ascending.
    pub tiers: HashMap<String, Vec<(Decimal, Decimal)>>,
}

impl MarginRequirements {
    pub fn initial_margin_rate(&self, symbol: &str, notional: Decimal) -> Decimal {
        if let Some(tiers) = self.tiers.get(symbol) {
            if let Some(rate) = Self::tier_rate(tiers, notional) {
                return rate;
            }
        }
        self.initial_margin_rates
            .get(symbol)
            .copied()
            .unwrap_or(DEFAULT_INITIAL_MARGIN_RATE)
    }

    pub fn maintenance_margin_rate(&self, symbol: &str, notional: Decimal) -> Decimal {
        if let Some(tiers) = self.tiers.get(symbol) {
            if let Some(rate) = Self::tier_rate(tiers, notional) {
                // Maintenance runs about half of initial per tier.
                return rate * dec!(0.5);
            }
        }
        self.maintenance_margin_rates
            .get(symbol)
            .copied()
            .unwrap_or(DEFAULT_MAINTENANCE_MARGIN_RATE)
    }

    fn tier_rate(tiers: &[(Decimal, Decimal)], notional: Decimal) -> Option<Decimal> {
        if tiers.is_empty() {
            return None;
        }
        for (cap, rate) in tiers {
            if notional <= *cap {
                return Some(*rate);
            }
        }
        tiers.last().map(|(_, rate)| *rate)
    }
}

/// What the margin loop decided needs doing.
#[derive(Debug, Clone)]
pub struct MarginActionContext {
    pub venue: VenueId,
    pub account_id: Option<String>,
    pub position: Option<PositionMarginInfo>,
    pub target_leverage: Option<Decimal>,
    pub reason: String,
}

/// Receiver for margin actions; the engine wires venue access here.
#[async_trait]
pub trait MarginActionHandler: Send + Sync {
    async fn on_action(&self, action: MarginAction, context: MarginActionContext);
}

#[derive(Default)]
struct MonitorState {
    requirements: HashMap<VenueId, MarginRequirements>,
    accounts: HashMap<(VenueId, Option<String>), MarginInfo>,
    positions: HashMap<String, PositionMarginInfo>,
}

/// Monitors margin health across venues and positions.
pub struct MarginMonitor {
    safety_buffer: Decimal,
    max_allowed_leverage: Decimal,
    auto_reduce_enabled: bool,
    check_interval: Duration,
    state: Mutex<MonitorState>,
}

impl MarginMonitor {
    pub fn new(
        safety_buffer: Decimal,
        max_allowed_leverage: Decimal,
        auto_reduce_enabled: bool,
        check_interval: Duration,
    ) -> Self {
        Self {
            safety_buffer,
            max_allowed_leverage,
            auto_reduce_enabled,
            check_interval,
            state: Mutex::new(MonitorState::default()),
        }
    }

    pub fn update_requirements(&self, venue: &VenueId, requirements: MarginRequirements) {
        self.state
            .lock()
            .expect("margin lock")
            .requirements
            .insert(venue.clone(), requirements);
        info!(venue = %venue, "updated margin requirements");
    }

    pub fn update_margin_info(&self, info: MarginInfo) {
        let key = (info.venue.clone(), info.account_id.clone());
        let health = info.margin_health();
        if health >= MarginStatus::Danger {
            warn!(
                venue = %info.venue,
                ratio = %info.margin_ratio,
                health = ?health,
                "margin health degraded"
            );
        }
        self.state
            .lock()
            .expect("margin lock")
            .accounts
            .insert(key, info);
    }

    pub fn update_position_margin(&self, info: PositionMarginInfo) {
        self.state
            .lock()
            .expect("margin lock")
            .positions
            .insert(info.position_id.clone(), info);
    }

    pub fn remove_position(&self, position_id: &str) {
        self.state
            .lock()
            .expect("margin lock")
            .positions
            .remove(position_id);
    }

    pub fn account_health(
        &self,
        venue: &VenueId,
        account_id: Option<&str>,
    ) -> Option<MarginStatus> {
        self.state
            .lock()
            .expect("margin lock")
            .accounts
            .get(&(venue.clone(), account_id.map(str::to_string)))
            .map(|info| info.margin_health())
    }

    /// Worst health across all tracked accounts on a venue.
    pub fn worst_health(&self, venue: &VenueId) -> Option<MarginStatus> {
        self.state
            .lock()
            .expect("margin lock")
            .accounts
            .iter()
            .filter(|((v, _), _)| v == venue)
            .map(|(_, info)| info.margin_health())
            .max()
    }

    /// Maximum safe leverage for a position given maintenance
    /// requirements and the safety buffer. Without requirements the
    /// conservative default applies.
    pub fn calculate_safe_leverage(
        &self,
        venue: &VenueId,
        symbol: &str,
        notional: Decimal,
    ) -> Decimal {
        let state = self.state.lock().expect("margin lock");
        let Some(requirements) = state.requirements.get(venue) else {
            return self.max_allowed_leverage.min(CONSERVATIVE_DEFAULT_LEVERAGE);
        };

        let maintenance_rate = requirements.maintenance_margin_rate(symbol, notional);
        let exchange_max = requirements
            .max_leverage
            .get(symbol)
            .copied()
            .unwrap_or(dec!(10));

        let safe = Decimal::ONE / (maintenance_rate * (Decimal::ONE + self.safety_buffer));
        let leverage = safe.min(exchange_max).min(self.max_allowed_leverage);
        debug!(
            venue = %venue,
            symbol,
            maintenance_rate = %maintenance_rate,
            safe_leverage = %leverage,
            "computed safe leverage"
        );
        leverage
    }

    /// Whether a position's leverage should be reduced, and to what.
    pub fn check_leverage_reduction_needed(&self, position_id: &str) -> Option<Decimal> {
        let position = {
            let state = self.state.lock().expect("margin lock");
            state.positions.get(position_id).cloned()?
        };
        let safe = self.calculate_safe_leverage(
            &position.venue,
            &position.pair.to_string(),
            position.notional_value,
        );
        if position.leverage > safe {
            return Some(safe);
        }
        // Degraded account health tightens the target further.
        let health = self.account_health(&position.venue, None);
        if matches!(
            health,
            Some(MarginStatus::Danger) | Some(MarginStatus::Critical)
        ) {
            return Some(safe * dec!(0.8));
        }
        None
    }

    /// ADL risk: explicit venue indicator when present, otherwise a
    /// leverage heuristic.
    pub fn adl_risk(&self, position_id: &str) -> AdlRisk {
        let state = self.state.lock().expect("margin lock");
        let Some(position) = state.positions.get(position_id) else {
            return AdlRisk::Low;
        };
        if let Some(indicator) = position.adl_indicator {
            return match indicator {
                5.. => AdlRisk::Imminent,
                4 => AdlRisk::High,
                3 => AdlRisk::Medium,
                _ => AdlRisk::Low,
            };
        }
        if position.leverage >= dec!(8) {
            AdlRisk::High
        } else if position.leverage >= dec!(5) {
            AdlRisk::Medium
        } else {
            AdlRisk::Low
        }
    }

    /// Ordered action recommendations for an account's current health.
    pub fn recommended_actions(
        &self,
        venue: &VenueId,
        account_id: Option<&str>,
    ) -> Vec<(MarginAction, String)> {
        let Some(health) = self.account_health(venue, account_id) else {
            return Vec::new();
        };
        match health {
            MarginStatus::LiquidationRisk => vec![
                (
                    MarginAction::EmergencyExit,
                    "immediate liquidation risk, close all positions".to_string(),
                ),
                (
                    MarginAction::AddMargin,
                    "add funds to prevent liquidation".to_string(),
                ),
            ],
            MarginStatus::Critical => vec![
                (
                    MarginAction::ClosePositions,
                    "close positions to reduce margin usage".to_string(),
                ),
                (
                    MarginAction::AddMargin,
                    "add funds to improve margin ratio".to_string(),
                ),
            ],
            MarginStatus::Danger => vec![
                (
                    MarginAction::ReduceLeverage,
                    "reduce leverage on existing positions".to_string(),
                ),
                (
                    MarginAction::ClosePositions,
                    "consider closing riskiest positions".to_string(),
                ),
            ],
            MarginStatus::Warning => vec![
                (
                    MarginAction::ReduceLeverage,
                    "consider reducing leverage".to_string(),
                ),
                (
                    MarginAction::Monitor,
                    "monitor for deterioration".to_string(),
                ),
            ],
            MarginStatus::Healthy => {
                vec![(MarginAction::Monitor, "continue monitoring".to_string())]
            }
        }
    }

    /// One monitoring cycle: dispatch the required actions for degraded
    /// accounts, then auto leverage reduction if enabled.
    pub async fn run_cycle(&self, handler: &dyn MarginActionHandler) {
        let accounts: Vec<((VenueId, Option<String>), MarginStatus)> = {
            let state = self.state.lock().expect("margin lock");
            state
                .accounts
                .iter()
                .map(|(key, info)| (key.clone(), info.margin_health()))
                .collect()
        };

        for ((venue, account_id), health) in accounts {
            match health {
                MarginStatus::LiquidationRisk => {
                    error!(venue = %venue, "liquidation risk, dispatching emergency exit");
                    handler
                        .on_action(
                            MarginAction::EmergencyExit,
                            MarginActionContext {
                                venue,
                                account_id,
                                position: None,
                                target_leverage: None,
                                reason: "liquidation risk".to_string(),
                            },
                        )
                        .await;
                }
                MarginStatus::Critical => {
                    handler
                        .on_action(
                            MarginAction::ClosePositions,
                            MarginActionContext {
                                venue,
                                account_id,
                                position: None,
                                target_leverage: None,
                                reason: "critical margin".to_string(),
                            },
                        )
                        .await;
                }
                MarginStatus::Danger | MarginStatus::Warning => {
                    handler
                        .on_action(
                            MarginAction::ReduceLeverage,
                            MarginActionContext {
                                venue,
                                account_id,
                                position: None,
                                target_leverage: None,
                                reason: format!("margin health {health:?}"),
                            },
                        )
                        .await;
                }
                MarginStatus::Healthy => {}
            }
        }

        if self.auto_reduce_enabled {
            let position_ids: Vec<String> = {
                let state = self.state.lock().expect("margin lock");
                state.positions.keys().cloned().collect()
            };
            for position_id in position_ids {
                let Some(target) = self.check_leverage_reduction_needed(&position_id) else {
                    continue;
                };
                let position = {
                    let state = self.state.lock().expect("margin lock");
                    state.positions.get(&position_id).cloned()
                };
                let Some(position) = position else { continue };
                info!(
                    position_id,
                    current = %position.leverage,
                    target = %target,
                    "auto leverage reduction"
                );
                handler
                    .on_action(
                        MarginAction::ReduceLeverage,
                        MarginActionContext {
                            venue: position.venue.clone(),
                            account_id: None,
                            position: Some(position),
                            target_leverage: Some(target),
                            reason: "leverage above safe level".to_string(),
                        },
                    )
                    .await;
            }
        }
    }

    /// Monitoring loop; exits on the shutdown flag.
    pub async fn run_loop(
        self: Arc<Self>,
        handler: Arc<dyn MarginActionHandler>,
        shutdown: Arc<AtomicBool>,
    ) {
        info!(
            interval_secs = self.check_interval.as_secs(),
            auto_reduce = self.auto_reduce_enabled,
            "margin monitoring started"
        );
        while !shutdown.load(Ordering::SeqCst) {
            self.run_cycle(handler.as_ref()).await;
            sleep(self.check_interval).await;
        }
        info!("margin monitoring stopped");
    }
}

/// Submit a leverage change for a position; when the venue refuses,
/// reduce exposure by partially closing the excess fraction instead.
pub async fn apply_leverage_reduction(
    venue: &dyn Venue,
    position: &PositionMarginInfo,
    target_leverage: Decimal,
) -> Result<(), VenueError> {
    if target_leverage >= position.leverage {
        return Ok(());
    }
    use rust_decimal::prelude::ToPrimitive;
    let rounded = target_leverage
        .floor()
        .max(Decimal::ONE)
        .to_u32()
        .unwrap_or(1);

    match venue.set_leverage(&position.pair, rounded).await {
        Ok(()) => {
            info!(
                venue = %venue.id(),
                pair = %position.pair,
                leverage = rounded,
                "leverage reduced"
            );
            Ok(())
        }
        Err(VenueError::UnsupportedLeverage) => {
            // Fall back: shed the fraction of the position the venue
            // refused to deleverage.
            let excess = Decimal::ONE - target_leverage / position.leverage;
            let reduce_base = position.size * excess;
            if reduce_base <= Decimal::ZERO {
                return Ok(());
            }
            warn!(
                venue = %venue.id(),
                pair = %position.pair,
                reduce_base = %reduce_base,
                "venue refused leverage change, partially closing instead"
            );
            let request = OrderRequest {
                pair: position.pair.clone(),
                side: match position.side {
                    PositionSide::Long => OrderSide::Sell,
                    PositionSide::Short => OrderSide::Buy,
                },
                order_type: OrderType::Market,
                amount_base: reduce_base,
                price: None,
                reduce_only: true,
            };
            venue.place_order(&request).await.map(|_| ())
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::venue::{SimVenue, SimVenueConfig};

    fn margin_info(ratio: Decimal) -> MarginInfo {
        MarginInfo {
            venue: VenueId::from("v1"),
            account_id: None,
            total_equity: ratio * dec!(1000),
            used_margin: dec!(1000),
            free_margin: Decimal::ZERO,
            margin_ratio: ratio,
            maintenance_margin: dec!(500),
            initial_margin_req: dec!(800),
            liquidation_price: None,
            timestamp: Utc::now(),
        }
    }

    fn position_info(id: &str, leverage: Decimal) -> PositionMarginInfo {
        PositionMarginInfo {
            position_id: id.to_string(),
            venue: VenueId::from("v1"),
            pair: TradingPair::new("BTC", "USDT"),
            side: PositionSide::Long,
            size: dec!(0.5),
            notional_value: dec!(25000),
            leverage,
            initial_margin: dec!(2500),
            maintenance_margin: dec!(1250),
            unrealized_pnl: Decimal::ZERO,
            liquidation_price: Some(dec!(45000)),
            current_mark_price: Some(dec!(50000)),
            adl_indicator: None,
            timestamp: Utc::now(),
        }
    }

    fn monitor() -> MarginMonitor {
        MarginMonitor::new(dec!(0.2), dec!(5), true, Duration::from_secs(30))
    }

    #[test]
    fn test_margin_health_ladder() {
        assert_eq!(margin_info(dec!(2.5)).margin_health(), MarginStatus::Healthy);
        assert_eq!(margin_info(dec!(1.7)).margin_health(), MarginStatus::Warning);
        assert_eq!(margin_info(dec!(1.2)).margin_health(), MarginStatus::Danger);
        assert_eq!(
            margin_info(dec!(1.05)).margin_health(),
            MarginStatus::Critical
        );
        assert_eq!(
            margin_info(dec!(0.9)).margin_health(),
            MarginStatus::LiquidationRisk
        );
    }

    #[test]
    fn test_distance_to_liquidation() {
        let long = position_info("p1", dec!(2));
        assert_eq!(long.distance_to_liquidation_pct(), Some(dec!(10)));

        let mut short = position_info("p2", dec!(2));
        short.side = PositionSide::Short;
        short.liquidation_price = Some(dec!(55000));
        assert_eq!(short.distance_to_liquidation_pct(), Some(dec!(10)));

        let mut missing = position_info("p3", dec!(2));
        missing.liquidation_price = None;
        assert_eq!(missing.distance_to_liquidation_pct(), None);
    }

    #[test]
    fn test_safe_leverage_without_requirements_is_conservative() {
        let m = monitor();
        let leverage = m.calculate_safe_leverage(&VenueId::from("v1"), "BTC-USDT", dec!(10000));
        assert_eq!(leverage, dec!(3));
    }

    #[test]
    fn test_safe_leverage_formula() {
        let m = monitor();
        let venue = VenueId::from("v1");
        let mut requirements = MarginRequirements::default();
        requirements
            .maintenance_margin_rates
            .insert("BTC-USDT".to_string(), dec!(0.05));
        requirements
            .max_leverage
            .insert("BTC-USDT".to_string(), dec!(50));
        m.update_requirements(&venue, requirements);
        // 1 / (0.05 * 1.2) = 16.67, clamped by max_allowed 5.
        assert_eq!(
            m.calculate_safe_leverage(&venue, "BTC-USDT", dec!(10000)),
            dec!(5)
        );
    }

    #[test]
    fn test_tier_lookup() {
        let mut requirements = MarginRequirements::default();
        requirements.tiers.insert(
            "BTC-USDT".to_string(),
            vec![(dec!(10000), dec!(0.01)), (dec!(100000), dec!(0.02))],
        );
        assert_eq!(
            requirements.initial_margin_rate("BTC-USDT", dec!(5000)),
            dec!(0.01)
        );
        assert_eq!(
            requirements.initial_margin_rate("BTC-USDT", dec!(50000)),
            dec!(0.02)
        );
        // Above all tiers: highest tier applies.
        assert_eq!(
            requirements.initial_margin_rate("BTC-USDT", dec!(500000)),
            dec!(0.02)
        );
        // Unknown symbol: defaults.
        assert_eq!(
            requirements.initial_margin_rate("ETH-USDT", dec!(1)),
            dec!(0.1)
        );
        assert_eq!(
            requirements.maintenance_margin_rate("ETH-USDT", dec!(1)),
            dec!(0.05)
        );
    }

    #[test]
    fn test_leverage_reduction_needed() {
        let m = monitor();
        m.update_position_margin(position_info("p1", dec!(8)));
        // No requirements: safe default is 3, position at 8 needs it.
        assert_eq!(m.check_leverage_reduction_needed("p1"), Some(dec!(3)));

        m.update_position_margin(position_info("p2", dec!(2)));
        assert_eq!(m.check_leverage_reduction_needed("p2"), None);
    }

    #[test]
    fn test_adl_risk_prefers_indicator() {
        let m = monitor();
        let mut p = position_info("p1", dec!(2));
        p.adl_indicator = Some(5);
        m.update_position_margin(p);
        assert_eq!(m.adl_risk("p1"), AdlRisk::Imminent);

        m.update_position_margin(position_info("p2", dec!(9)));
        assert_eq!(m.adl_risk("p2"), AdlRisk::High);
        m.update_position_margin(position_info("p3", dec!(5)));
        assert_eq!(m.adl_risk("p3"), AdlRisk::Medium);
        m.update_position_margin(position_info("p4", dec!(2)));
        assert_eq!(m.adl_risk("p4"), AdlRisk::Low);
    }

    #[test]
    fn test_recommended_actions_by_health() {
        let m = monitor();
        let venue = VenueId::from("v1");
        m.update_margin_info(margin_info(dec!(0.9)));
        let actions = m.recommended_actions(&venue, None);
        assert_eq!(actions[0].0, MarginAction::EmergencyExit);
        assert_eq!(actions[1].0, MarginAction::AddMargin);

        m.update_margin_info(margin_info(dec!(1.05)));
        assert_eq!(
            m.recommended_actions(&venue, None)[0].0,
            MarginAction::ClosePositions
        );

        m.update_margin_info(margin_info(dec!(1.2)));
        assert_eq!(
            m.recommended_actions(&venue, None)[0].0,
            MarginAction::ReduceLeverage
        );

        m.update_margin_info(margin_info(dec!(3)));
        assert_eq!(
            m.recommended_actions(&venue, None)[0].0,
            MarginAction::Monitor
        );
    }

    struct RecordingHandler {
        actions: Mutex<Vec<MarginAction>>,
    }

    #[async_trait]
    impl MarginActionHandler for RecordingHandler {
        async fn on_action(&self, action: MarginAction, _context: MarginActionContext) {
            self.actions.lock().unwrap().push(action);
        }
    }

    #[tokio::test]
    async fn test_cycle_dispatches_emergency_exit() {
        let m = monitor();
        m.update_margin_info(margin_info(dec!(0.8)));
        let handler = RecordingHandler {
            actions: Mutex::new(Vec::new()),
        };
        m.run_cycle(&handler).await;
        assert!(handler
            .actions
            .lock()
            .unwrap()
            .contains(&MarginAction::EmergencyExit));
    }

    #[tokio::test]
    async fn test_cycle_auto_reduces_over_leveraged_position() {
        let m = monitor();
        m.update_position_margin(position_info("p1", dec!(8)));
        let handler = RecordingHandler {
            actions: Mutex::new(Vec::new()),
        };
        m.run_cycle(&handler).await;
        assert!(handler
            .actions
            .lock()
            .unwrap()
            .contains(&MarginAction::ReduceLeverage));
    }

    #[tokio::test]
    async fn test_apply_leverage_reduction_sets_leverage() {
        let sim = SimVenue::new(VenueId::from("binance_perpetual"), SimVenueConfig::default());
        let position = position_info("p1", dec!(8));
        apply_leverage_reduction(&sim, &position, dec!(3))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_apply_leverage_reduction_falls_back_to_partial_close() {
        let sim = SimVenue::new(
            VenueId::from("binance_perpetual"),
            SimVenueConfig {
                fill_delay: Duration::ZERO,
                close_delay: Duration::ZERO,
                ..Default::default()
            },
        );
        sim.set_reject_leverage(true);
        sim.set_price(TradingPair::new("BTC", "USDT"), dec!(50000))
            .await;
        // Open a long so the reduce-only fallback has something to shed.
        sim.place_order(&OrderRequest {
            pair: TradingPair::new("BTC", "USDT"),
            side: OrderSide::Buy,
            order_type: OrderType::Market,
            amount_base: dec!(0.5),
            price: None,
            reduce_only: false,
        })
        .await
        .unwrap();

        let position = position_info("p1", dec!(8));
        apply_leverage_reduction(&sim, &position, dec!(4))
            .await
            .unwrap();

        let remaining = sim
            .get_position(&TradingPair::new("BTC", "USDT"))
            .await
            .unwrap()
            .unwrap();
        // Excess fraction 1 - 4/8 = 0.5 of the 0.5 size was closed.
        assert_eq!(remaining.size, dec!(0.25));
    }
}
