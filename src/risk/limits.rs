//! Position limits, liquidity risk, and hedge-gap monitoring.
//!
//! The risk manager tracks expected positions, enforces notional /
//! leverage / concentration limits with warning thresholds, scores
//! liquidity impact, and computes hedge gaps between paired legs. The
//! resulting risk level scales position sizing upstream.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, info};

use crate::config::RiskLimitsConfig;
use crate::venue::{PositionSide, TradingPair, VenueId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// Exposure-proportional sizing multiplier applied to the base
    /// position size.
    pub fn size_multiplier(&self) -> Decimal {
        match self {
            RiskLevel::Low => Decimal::ONE,
            RiskLevel::Medium => dec!(0.7),
            RiskLevel::High => dec!(0.3),
            RiskLevel::Critical => Decimal::ZERO,
        }
    }
}

/// An expected position from the risk manager's perspective.
#[derive(Debug, Clone, Serialize)]
pub struct PositionRecord {
    pub venue: VenueId,
    pub subaccount: Option<String>,
    pub pair: TradingPair,
    pub notional: Decimal,
    pub leverage: Decimal,
    pub side: PositionSide,
    pub opened_at: DateTime<Utc>,
}

/// Outcome of a position-limit check.
#[derive(Debug, Clone)]
pub struct LimitCheck {
    pub allow: bool,
    pub messages: Vec<String>,
    pub level: RiskLevel,
}

/// Hedge gap between a long and short leg of the same pair on different
/// venues.
#[derive(Debug, Clone, Serialize)]
pub struct HedgeGap {
    pub pair: TradingPair,
    pub long_venue: VenueId,
    pub short_venue: VenueId,
    pub long_notional: Decimal,
    pub short_notional: Decimal,
    pub gap_amount: Decimal,
    pub gap_pct: Decimal,
}

impl HedgeGap {
    /// Risk score combining relative gap and absolute size.
    pub fn gap_risk_score(&self) -> Decimal {
        let base = (self.gap_pct * dec!(10)).min(Decimal::ONE);
        let size_factor = (self.gap_amount / dec!(1000)).min(dec!(2.0));
        base * (Decimal::ONE + size_factor)
    }
}

/// Order book depth metrics for one venue/pair.
#[derive(Debug, Clone, Serialize)]
pub struct LiquidityMetrics {
    pub venue: VenueId,
    pub pair: TradingPair,
    pub bid_depth_1pct: Decimal,
    pub ask_depth_1pct: Decimal,
    pub bid_depth_5pct: Decimal,
    pub ask_depth_5pct: Decimal,
    pub avg_spread_bps: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Aggregate risk view for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct RiskSummary {
    pub total_positions: usize,
    pub total_notional: Decimal,
    pub venue_exposures: HashMap<String, Decimal>,
    pub hedge_gaps: usize,
    pub gap_violations: usize,
    pub max_gap_pct: Decimal,
}

/// Tracks expected positions and enforces risk limits.
#[derive(Debug)]
pub struct RiskManager {
    config: RiskLimitsConfig,
    positions: HashMap<String, PositionRecord>,
    hedge_pairs: HashMap<TradingPair, Vec<String>>,
    liquidity_cache: HashMap<(VenueId, TradingPair), LiquidityMetrics>,
    sequence: u64,
}

impl RiskManager {
    pub fn new(config: RiskLimitsConfig) -> Self {
        Self {
            config,
            positions: HashMap::new(),
            hedge_pairs: HashMap::new(),
            liquidity_cache: HashMap::new(),
            sequence: 0,
        }
    }

    pub fn config(&self) -> &RiskLimitsConfig {
        &self.config
    }

    /// Check whether a proposed position passes limits.
    ///
    /// Any hard violation denies with CRITICAL; otherwise the level
    /// scales with the number of warning-threshold crossings.
    pub fn check_position_limits(
        &self,
        venue: &VenueId,
        subaccount: Option<&str>,
        pair: &TradingPair,
        proposed_notional: Decimal,
        proposed_leverage: Decimal,
    ) -> LimitCheck {
        let mut violations = Vec::new();
        let mut warnings = Vec::new();
        let warn_at = |limit: Decimal| limit * self.config.warning_threshold;

        if proposed_leverage > self.config.max_leverage {
            violations.push(format!(
                "leverage {proposed_leverage} exceeds limit {}",
                self.config.max_leverage
            ));
        } else if proposed_leverage > warn_at(self.config.max_leverage) {
            warnings.push(format!(
                "leverage {proposed_leverage} approaching limit {}",
                self.config.max_leverage
            ));
        }

        let venue_notional = self.venue_notional(venue) + proposed_notional;
        if venue_notional > self.config.max_notional_per_exchange {
            violations.push(format!(
                "venue {venue} notional {venue_notional} exceeds limit {}",
                self.config.max_notional_per_exchange
            ));
        } else if venue_notional > warn_at(self.config.max_notional_per_exchange) {
            warnings.push(format!(
                "venue {venue} notional {venue_notional} approaching limit"
            ));
        }

        if let Some(subaccount) = subaccount {
            let subaccount_notional =
                self.subaccount_notional(venue, subaccount) + proposed_notional;
            if subaccount_notional > self.config.max_notional_per_subaccount {
                violations.push(format!(
                    "subaccount {subaccount} notional {subaccount_notional} exceeds limit {}",
                    self.config.max_notional_per_subaccount
                ));
            } else if subaccount_notional > warn_at(self.config.max_notional_per_subaccount) {
                warnings.push(format!(
                    "subaccount {subaccount} notional approaching limit"
                ));
            }
        }

        let existing_total = self.total_notional();
        let total_notional = existing_total + proposed_notional;
        if total_notional > self.config.max_total_notional {
            violations.push(format!(
                "total notional {total_notional} exceeds limit {}",
                self.config.max_total_notional
            ));
        } else if total_notional > warn_at(self.config.max_total_notional) {
            warnings.push("total notional approaching limit".to_string());
        }

        // Concentration is a share of the whole book; with no other
        // exposure the first position is trivially 100% and the check
        // would block every cold start, so it only applies once other
        // positions exist.
        if existing_total > Decimal::ZERO {
            let pair_notional = self.pair_notional(pair) + proposed_notional;
            let concentration = pair_notional / total_notional;
            if concentration > self.config.max_concentration_pct {
                violations.push(format!(
                    "concentration in {pair} ({concentration:.4}) exceeds limit {}",
                    self.config.max_concentration_pct
                ));
            } else if concentration > warn_at(self.config.max_concentration_pct) {
                warnings.push(format!("concentration in {pair} approaching limit"));
            }
        }

        let (allow, level) = if !violations.is_empty() {
            (false, RiskLevel::Critical)
        } else if warnings.len() >= 3 {
            (true, RiskLevel::High)
        } else if !warnings.is_empty() {
            (true, RiskLevel::Medium)
        } else {
            (true, RiskLevel::Low)
        };

        let mut messages = violations;
        messages.extend(warnings);
        LimitCheck {
            allow,
            messages,
            level,
        }
    }

    /// Check liquidity risk for a position size against cached depth.
    /// Returns `(acceptable, reason, impact_score)`.
    pub fn check_liquidity_risk(
        &self,
        venue: &VenueId,
        pair: &TradingPair,
        notional: Decimal,
    ) -> (bool, String, Decimal) {
        let Some(metrics) = self
            .liquidity_cache
            .get(&(venue.clone(), pair.clone()))
        else {
            return (false, "no liquidity data available".to_string(), Decimal::ONE);
        };

        let available = metrics.bid_depth_1pct.min(metrics.ask_depth_1pct);
        if available <= Decimal::ZERO {
            return (false, "empty liquidity within 1%".to_string(), Decimal::ONE);
        }
        let safe_limit = available * dec!(0.8);
        if notional > safe_limit {
            return (
                false,
                format!("position {notional} exceeds safe liquidity limit {safe_limit}"),
                Decimal::ONE,
            );
        }

        let impact = ((notional / available) * dec!(2)).min(Decimal::ONE);
        if impact > dec!(0.5) {
            return (
                false,
                format!("high market impact expected: {impact:.4}"),
                impact,
            );
        }
        (true, format!("acceptable liquidity, impact {impact:.4}"), impact)
    }

    /// Track an expected position; returns its id.
    pub fn add_position(&mut self, position: PositionRecord) -> String {
        self.sequence += 1;
        let id = format!(
            "{}_{}_{}_{}",
            position.venue, position.pair, position.side, self.sequence
        );
        info!(
            position_id = %id,
            notional = %position.notional,
            "tracking expected position"
        );
        self.hedge_pairs
            .entry(position.pair.clone())
            .or_default()
            .push(id.clone());
        self.positions.insert(id.clone(), position);
        id
    }

    pub fn remove_position(&mut self, position_id: &str) {
        if let Some(position) = self.positions.remove(position_id) {
            if let Some(ids) = self.hedge_pairs.get_mut(&position.pair) {
                ids.retain(|id| id != position_id);
            }
            debug!(position_id, "removed expected position");
        }
    }

    pub fn update_liquidity(&mut self, metrics: LiquidityMetrics) {
        self.liquidity_cache
            .insert((metrics.venue.clone(), metrics.pair.clone()), metrics);
    }

    /// Current hedge gaps: for every pair, aggregate notionals by
    /// (venue, side) and compare each cross-venue long/short pairing.
    pub fn hedge_gaps(&self) -> Vec<HedgeGap> {
        let mut gaps = Vec::new();

        for (pair, ids) in &self.hedge_pairs {
            if ids.len() < 2 {
                continue;
            }
            let mut longs: HashMap<VenueId, Decimal> = HashMap::new();
            let mut shorts: HashMap<VenueId, Decimal> = HashMap::new();
            for id in ids {
                let Some(position) = self.positions.get(id) else {
                    continue;
                };
                let bucket = match position.side {
                    PositionSide::Long => &mut longs,
                    PositionSide::Short => &mut shorts,
                };
                *bucket.entry(position.venue.clone()).or_default() += position.notional;
            }

            for (long_venue, long_notional) in &longs {
                for (short_venue, short_notional) in &shorts {
                    if long_venue == short_venue {
                        continue;
                    }
                    let gap_amount = (*long_notional - *short_notional).abs();
                    let larger = (*long_notional).max(*short_notional);
                    let gap_pct = if larger > Decimal::ZERO {
                        gap_amount / larger
                    } else {
                        Decimal::ZERO
                    };
                    gaps.push(HedgeGap {
                        pair: pair.clone(),
                        long_venue: long_venue.clone(),
                        short_venue: short_venue.clone(),
                        long_notional: *long_notional,
                        short_notional: *short_notional,
                        gap_amount,
                        gap_pct,
                    });
                }
            }
        }
        gaps
    }

    /// Gaps past the hard limit, plus warning-level gaps.
    pub fn hedge_gap_violations(&self) -> Vec<(HedgeGap, String)> {
        let warn_at = self.config.max_hedge_gap_pct * self.config.hedge_gap_warning_threshold;
        self.hedge_gaps()
            .into_iter()
            .filter_map(|gap| {
                if gap.gap_pct > self.config.max_hedge_gap_pct {
                    let message = format!(
                        "hedge gap {:.4} exceeds limit {:.4} for {}",
                        gap.gap_pct, self.config.max_hedge_gap_pct, gap.pair
                    );
                    Some((gap, message))
                } else if gap.gap_pct > warn_at {
                    let message =
                        format!("hedge gap {:.4} approaching limit for {}", gap.gap_pct, gap.pair);
                    Some((gap, message))
                } else {
                    None
                }
            })
            .collect()
    }

    pub fn total_notional(&self) -> Decimal {
        self.positions.values().map(|p| p.notional).sum()
    }

    pub fn venue_notional(&self, venue: &VenueId) -> Decimal {
        self.positions
            .values()
            .filter(|p| &p.venue == venue)
            .map(|p| p.notional)
            .sum()
    }

    fn subaccount_notional(&self, venue: &VenueId, subaccount: &str) -> Decimal {
        self.positions
            .values()
            .filter(|p| &p.venue == venue && p.subaccount.as_deref() == Some(subaccount))
            .map(|p| p.notional)
            .sum()
    }

    pub fn pair_notional(&self, pair: &TradingPair) -> Decimal {
        self.positions
            .values()
            .filter(|p| &p.pair == pair)
            .map(|p| p.notional)
            .sum()
    }

    pub fn position_count(&self) -> usize {
        self.positions.len()
    }

    pub fn summary(&self) -> RiskSummary {
        let gaps = self.hedge_gaps();
        let violations = self.hedge_gap_violations();
        let mut venue_exposures: HashMap<String, Decimal> = HashMap::new();
        for position in self.positions.values() {
            *venue_exposures
                .entry(position.venue.to_string())
                .or_default() += position.notional;
        }
        RiskSummary {
            total_positions: self.positions.len(),
            total_notional: self.total_notional(),
            venue_exposures,
            hedge_gaps: gaps.len(),
            gap_violations: violations.len(),
            max_gap_pct: gaps
                .iter()
                .map(|g| g.gap_pct)
                .max()
                .unwrap_or(Decimal::ZERO),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> RiskManager {
        RiskManager::new(RiskLimitsConfig {
            max_notional_per_exchange: dec!(50000),
            max_notional_per_subaccount: dec!(20000),
            max_total_notional: dec!(100000),
            max_leverage: dec!(10),
            max_hedge_gap_pct: dec!(0.10),
            max_concentration_pct: dec!(0.5),
            warning_threshold: dec!(0.8),
            hedge_gap_warning_threshold: dec!(0.6),
        })
    }

    fn record(venue: &str, side: PositionSide, notional: Decimal) -> PositionRecord {
        PositionRecord {
            venue: VenueId::from(venue),
            subaccount: None,
            pair: TradingPair::new("BTC", "USDT"),
            notional,
            leverage: Decimal::ONE,
            side,
            opened_at: Utc::now(),
        }
    }

    #[test]
    fn test_limits_pass_when_small() {
        let m = manager();
        let check = m.check_position_limits(
            &VenueId::from("v1"),
            None,
            &TradingPair::new("BTC", "USDT"),
            dec!(1000),
            Decimal::ONE,
        );
        assert!(check.allow);
        assert_eq!(check.level, RiskLevel::Low);
    }

    #[test]
    fn test_hard_violation_denies_critical() {
        let m = manager();
        let check = m.check_position_limits(
            &VenueId::from("v1"),
            None,
            &TradingPair::new("BTC", "USDT"),
            dec!(60000),
            Decimal::ONE,
        );
        assert!(!check.allow);
        assert_eq!(check.level, RiskLevel::Critical);
        assert_eq!(check.level.size_multiplier(), Decimal::ZERO);
    }

    #[test]
    fn test_warning_threshold_raises_level() {
        let m = manager();
        // 45k on a 50k venue limit crosses the 80% warning line.
        let check = m.check_position_limits(
            &VenueId::from("v1"),
            None,
            &TradingPair::new("BTC", "USDT"),
            dec!(45000),
            Decimal::ONE,
        );
        assert!(check.allow);
        assert_eq!(check.level, RiskLevel::Medium);
        assert_eq!(check.level.size_multiplier(), dec!(0.7));
    }

    #[test]
    fn test_concentration_applies_only_with_existing_exposure() {
        // A fresh book has no concentration baseline.
        let fresh = manager();
        let check = fresh.check_position_limits(
            &VenueId::from("v1"),
            None,
            &TradingPair::new("BTC", "USDT"),
            dec!(5000),
            Decimal::ONE,
        );
        assert!(check.allow);

        // With existing exposure, piling onto the same pair breaches the
        // concentration limit.
        let mut m = manager();
        m.add_position(record("v1", PositionSide::Long, dec!(10000)));
        m.add_position(record("v2", PositionSide::Short, dec!(10000)));
        let check = m.check_position_limits(
            &VenueId::from("v3"),
            None,
            &TradingPair::new("BTC", "USDT"),
            dec!(5000),
            Decimal::ONE,
        );
        assert!(!check.allow);
        assert_eq!(check.level, RiskLevel::Critical);
    }

    #[test]
    fn test_leverage_violation() {
        let m = manager();
        let check = m.check_position_limits(
            &VenueId::from("v1"),
            None,
            &TradingPair::new("BTC", "USDT"),
            dec!(1000),
            dec!(20),
        );
        assert!(!check.allow);
    }

    #[test]
    fn test_subaccount_limit() {
        let m = manager();
        let check = m.check_position_limits(
            &VenueId::from("v1"),
            Some("sub1"),
            &TradingPair::new("BTC", "USDT"),
            dec!(25000),
            Decimal::ONE,
        );
        assert!(!check.allow);
    }

    #[test]
    fn test_hedge_gap_detection() {
        let mut m = manager();
        m.add_position(record("v1", PositionSide::Long, dec!(10000)));
        m.add_position(record("v2", PositionSide::Short, dec!(8000)));
        let gaps = m.hedge_gaps();
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].gap_amount, dec!(2000));
        assert_eq!(gaps[0].gap_pct, dec!(0.2));

        let violations = m.hedge_gap_violations();
        assert_eq!(violations.len(), 1);
        assert!(violations[0].1.contains("exceeds limit"));
    }

    #[test]
    fn test_balanced_hedge_has_no_violation() {
        let mut m = manager();
        m.add_position(record("v1", PositionSide::Long, dec!(10000)));
        m.add_position(record("v2", PositionSide::Short, dec!(10000)));
        assert!(m.hedge_gap_violations().is_empty());
    }

    #[test]
    fn test_remove_position_clears_gap() {
        let mut m = manager();
        let id1 = m.add_position(record("v1", PositionSide::Long, dec!(10000)));
        m.add_position(record("v2", PositionSide::Short, dec!(8000)));
        m.remove_position(&id1);
        assert!(m.hedge_gaps().is_empty());
        assert_eq!(m.position_count(), 1);
    }

    #[test]
    fn test_liquidity_risk_rejects_without_data() {
        let m = manager();
        let (ok, _, impact) = m.check_liquidity_risk(
            &VenueId::from("v1"),
            &TradingPair::new("BTC", "USDT"),
            dec!(1000),
        );
        assert!(!ok);
        assert_eq!(impact, Decimal::ONE);
    }

    #[test]
    fn test_liquidity_risk_thresholds() {
        let mut m = manager();
        let pair = TradingPair::new("BTC", "USDT");
        let venue = VenueId::from("v1");
        m.update_liquidity(LiquidityMetrics {
            venue: venue.clone(),
            pair: pair.clone(),
            bid_depth_1pct: dec!(10000),
            ask_depth_1pct: dec!(12000),
            bid_depth_5pct: dec!(50000),
            ask_depth_5pct: dec!(60000),
            avg_spread_bps: dec!(2),
            timestamp: Utc::now(),
        });

        // Small order: fine.
        let (ok, _, impact) = m.check_liquidity_risk(&venue, &pair, dec!(1000));
        assert!(ok);
        assert_eq!(impact, dec!(0.2));

        // Over 80% of available depth: rejected.
        let (ok, _, _) = m.check_liquidity_risk(&venue, &pair, dec!(9000));
        assert!(!ok);

        // Impact over 0.5 (notional/avail > 0.25): rejected.
        let (ok, _, impact) = m.check_liquidity_risk(&venue, &pair, dec!(3000));
        assert!(!ok);
        assert_eq!(impact, dec!(0.6));
    }
}
