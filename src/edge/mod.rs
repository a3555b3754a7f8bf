//! Edge decomposition for funding arbitrage opportunities.
//!
//! Breaks a candidate position into its components (expected funding,
//! trading fees, borrow cost, slippage buffer, settlement buffer) and
//! decides profitability against a minimum required edge. All arithmetic
//! is exact decimal; the identity
//! `total_edge = funding_pnl - fees - borrow - slippage - settlement`
//! holds to full precision.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::venue::{FundingInfo, TradingPair, VenueId};

/// Seconds used to normalize funding differentials to a daily figure.
pub const FUNDING_PROFITABILITY_INTERVAL_SECONDS: u64 = 24 * 60 * 60;

const DEFAULT_TAKER_FEE: Decimal = dec!(0.001);
const DEFAULT_BORROW_RATE_HOURLY: Decimal = dec!(0.0001);
const DEFAULT_SLIPPAGE_RATE: Decimal = dec!(0.0005);

/// Immutable breakdown of one edge calculation.
#[derive(Debug, Clone, Serialize)]
pub struct EdgeDecomposition {
    pub pair: TradingPair,
    pub long_venue: VenueId,
    pub short_venue: VenueId,
    pub timestamp: DateTime<Utc>,

    /// `short_rate - long_rate`, per funding period.
    pub funding_diff: Decimal,
    pub expected_funding_pnl: Decimal,
    pub fees_total: Decimal,
    pub borrow_total: Decimal,
    pub slippage_total: Decimal,
    pub settlement_buffer: Decimal,

    pub fees_breakdown: HashMap<String, Decimal>,
    pub borrow_breakdown: HashMap<String, Decimal>,
    pub slippage_breakdown: HashMap<String, Decimal>,

    pub notional: Decimal,
    pub leverage_long: Decimal,
    pub leverage_short: Decimal,

    pub total_edge: Decimal,
    pub min_edge_required: Decimal,
    pub is_profitable: bool,

    pub hedge_gap_risk: Decimal,
    pub liquidity_risk_score: Decimal,
}

impl EdgeDecomposition {
    /// Margin above/below the minimum required edge.
    pub fn edge_margin(&self) -> Decimal {
        self.total_edge - self.min_edge_required
    }
}

/// Inputs to one edge calculation.
#[derive(Debug, Clone)]
pub struct EdgeParams {
    pub pair: TradingPair,
    pub long_venue: VenueId,
    pub short_venue: VenueId,
    /// Funding rates per settlement period on each leg's venue.
    pub funding_rate_long: Decimal,
    pub funding_rate_short: Decimal,
    pub notional: Decimal,
    /// Taker fee per venue; unknown venues fall back to 0.1%.
    pub taker_fees: HashMap<String, Decimal>,
    /// Hourly borrow rate per asset.
    pub borrow_rates: HashMap<String, Decimal>,
    /// Slippage estimate per venue, as a rate.
    pub slippage_estimates: HashMap<String, Decimal>,
    pub leverage_long: Decimal,
    pub leverage_short: Decimal,
    pub funding_period_hours: Decimal,
}

/// The venue-pair combination the selector ranked highest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VenueCombination {
    pub long_venue: VenueId,
    pub short_venue: VenueId,
    /// `|r_a - r_b|` normalized per second and scaled to a day.
    pub daily_rate_diff: Decimal,
}

/// Pure edge calculator; same inputs always produce the same output.
#[derive(Debug, Clone)]
pub struct EdgeCalculator {
    pub min_edge_required: Decimal,
    pub settlement_buffer_rate: Decimal,
}

impl EdgeCalculator {
    pub fn new(min_edge_required: Decimal, settlement_buffer_rate: Decimal) -> Self {
        Self {
            min_edge_required,
            settlement_buffer_rate,
        }
    }

    /// Full decomposition for one candidate.
    pub fn calculate_edge(&self, params: &EdgeParams) -> EdgeDecomposition {
        let funding_diff = params.funding_rate_short - params.funding_rate_long;
        let expected_funding_pnl = funding_diff * params.notional;

        let fees_breakdown = self.trading_fees(params);
        let fees_total: Decimal = fees_breakdown.values().copied().sum();

        let borrow_breakdown = self.borrow_costs(params);
        let borrow_total: Decimal = borrow_breakdown.values().copied().sum();

        let slippage_breakdown = self.slippage_buffers(params);
        let slippage_total: Decimal = slippage_breakdown.values().copied().sum();

        let settlement_buffer = params.notional * self.settlement_buffer_rate;

        let total_edge = expected_funding_pnl
            - fees_total
            - borrow_total
            - slippage_total
            - settlement_buffer;

        let decomposition = EdgeDecomposition {
            pair: params.pair.clone(),
            long_venue: params.long_venue.clone(),
            short_venue: params.short_venue.clone(),
            timestamp: Utc::now(),
            funding_diff,
            expected_funding_pnl,
            fees_total,
            borrow_total,
            slippage_total,
            settlement_buffer,
            fees_breakdown,
            borrow_breakdown,
            slippage_breakdown,
            notional: params.notional,
            leverage_long: params.leverage_long,
            leverage_short: params.leverage_short,
            total_edge,
            min_edge_required: self.min_edge_required,
            is_profitable: total_edge >= self.min_edge_required,
            hedge_gap_risk: self.hedge_gap_risk(params),
            liquidity_risk_score: self.liquidity_risk(params),
        };

        debug!(
            pair = %decomposition.pair,
            long = %decomposition.long_venue,
            short = %decomposition.short_venue,
            funding_pnl = %decomposition.expected_funding_pnl,
            fees = %decomposition.fees_total,
            borrow = %decomposition.borrow_total,
            slippage = %decomposition.slippage_total,
            total_edge = %decomposition.total_edge,
            profitable = decomposition.is_profitable,
            "edge decomposition"
        );

        decomposition
    }

    /// Taker fees on both legs, open and close.
    fn trading_fees(&self, params: &EdgeParams) -> HashMap<String, Decimal> {
        let mut fees = HashMap::new();
        for venue in [&params.long_venue, &params.short_venue] {
            let taker = params
                .taker_fees
                .get(venue.as_str())
                .copied()
                .unwrap_or(DEFAULT_TAKER_FEE);
            fees.insert(format!("{venue}_open"), params.notional * taker);
            fees.insert(format!("{venue}_close"), params.notional * taker);
        }
        fees
    }

    /// Borrow costs for leveraged legs: the borrowed fraction of notional
    /// times the asset's hourly rate over the funding period.
    fn borrow_costs(&self, params: &EdgeParams) -> HashMap<String, Decimal> {
        let mut costs = HashMap::new();
        let period_days = params.funding_period_hours / dec!(24);

        if params.leverage_long > Decimal::ONE {
            let borrowed =
                params.notional * (params.leverage_long - Decimal::ONE) / params.leverage_long;
            let rate = params
                .borrow_rates
                .get(&params.pair.quote)
                .copied()
                .unwrap_or(DEFAULT_BORROW_RATE_HOURLY);
            costs.insert("long_borrow".to_string(), borrowed * rate * period_days);
        }
        if params.leverage_short > Decimal::ONE {
            let borrowed =
                params.notional * (params.leverage_short - Decimal::ONE) / params.leverage_short;
            let rate = params
                .borrow_rates
                .get(&params.pair.base)
                .copied()
                .unwrap_or(DEFAULT_BORROW_RATE_HOURLY);
            costs.insert("short_borrow".to_string(), borrowed * rate * period_days);
        }
        costs
    }

    fn slippage_buffers(&self, params: &EdgeParams) -> HashMap<String, Decimal> {
        let mut buffers = HashMap::new();
        for venue in [&params.long_venue, &params.short_venue] {
            let rate = params
                .slippage_estimates
                .get(venue.as_str())
                .copied()
                .unwrap_or(DEFAULT_SLIPPAGE_RATE);
            buffers.insert(format!("{venue}_slippage"), params.notional * rate);
        }
        buffers
    }

    /// Execution risk from leverage and size.
    fn hedge_gap_risk(&self, params: &EdgeParams) -> Decimal {
        let leverage_factor = params.leverage_long.max(params.leverage_short);
        dec!(0.0001) * leverage_factor * (params.notional / dec!(1000))
    }

    /// Rough liquidity score by venue reputation, scaled with size.
    fn liquidity_risk(&self, params: &EdgeParams) -> Decimal {
        fn venue_score(venue: &VenueId) -> Decimal {
            let name = venue.as_str();
            if name.starts_with("binance") {
                dec!(0.1)
            } else if name.starts_with("okx") {
                dec!(0.15)
            } else if name.starts_with("bybit") {
                dec!(0.2)
            } else if name.starts_with("kucoin") {
                dec!(0.25)
            } else if name.starts_with("gate") {
                dec!(0.3)
            } else {
                dec!(0.5)
            }
        }
        let size_factor = (params.notional / dec!(10000)).min(dec!(2.0));
        (venue_score(&params.long_venue) + venue_score(&params.short_venue)) * size_factor
    }

    /// Rank all ordered venue pairs in a funding report by the
    /// daily-normalized absolute rate differential and return the best.
    ///
    /// Pairs whose quote currencies differ are skipped: a stablecoin
    /// depeg would otherwise read as free edge. The lower-rate venue
    /// becomes the long leg.
    pub fn most_profitable_combination(
        &self,
        report: &HashMap<VenueId, FundingInfo>,
    ) -> Option<VenueCombination> {
        let mut best: Option<VenueCombination> = None;

        let mut venues: Vec<&VenueId> = report.keys().collect();
        venues.sort();

        for (i, venue_a) in venues.iter().enumerate() {
            for venue_b in venues.iter().skip(i + 1) {
                let info_a = &report[*venue_a];
                let info_b = &report[*venue_b];

                if info_a.pair.quote != info_b.pair.quote {
                    warn!(
                        venue_a = %venue_a,
                        venue_b = %venue_b,
                        quote_a = %info_a.pair.quote,
                        quote_b = %info_b.pair.quote,
                        "skipping venue pair with mismatched quote currencies"
                    );
                    continue;
                }

                let (Some(rate_a), Some(rate_b)) =
                    (info_a.rate_per_second(), info_b.rate_per_second())
                else {
                    continue;
                };

                let daily_diff = (rate_a - rate_b).abs()
                    * Decimal::from(FUNDING_PROFITABILITY_INTERVAL_SECONDS);
                if best
                    .as_ref()
                    .map_or(true, |b| daily_diff > b.daily_rate_diff)
                    && daily_diff > Decimal::ZERO
                {
                    // Long the venue that pays less funding.
                    let (long_venue, short_venue) = if rate_a < rate_b {
                        ((*venue_a).clone(), (*venue_b).clone())
                    } else {
                        ((*venue_b).clone(), (*venue_a).clone())
                    };
                    best = Some(VenueCombination {
                        long_venue,
                        short_venue,
                        daily_rate_diff: daily_diff,
                    });
                }
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(notional: Decimal) -> EdgeParams {
        let mut taker_fees = HashMap::new();
        taker_fees.insert("v1".to_string(), dec!(0.0005));
        taker_fees.insert("v2".to_string(), dec!(0.0005));
        let mut slippage = HashMap::new();
        slippage.insert("v1".to_string(), dec!(0.0003));
        slippage.insert("v2".to_string(), dec!(0.0003));
        EdgeParams {
            pair: TradingPair::new("BTC", "USDT"),
            long_venue: VenueId::from("v1"),
            short_venue: VenueId::from("v2"),
            funding_rate_long: dec!(0.0001),
            funding_rate_short: dec!(0.0010),
            notional,
            taker_fees,
            borrow_rates: HashMap::new(),
            slippage_estimates: slippage,
            leverage_long: Decimal::ONE,
            leverage_short: Decimal::ONE,
            funding_period_hours: dec!(8),
        }
    }

    fn calculator() -> EdgeCalculator {
        EdgeCalculator::new(dec!(0.0005), dec!(0.0001))
    }

    fn funding(venue: &str, quote: &str, rate: Decimal, interval: u64) -> (VenueId, FundingInfo) {
        let id = VenueId::from(venue);
        (
            id.clone(),
            FundingInfo {
                venue: id,
                pair: TradingPair::new("BTC", quote),
                rate,
                interval_seconds: interval,
                next_settlement_utc: None,
                index_price: None,
                mark_price: None,
            },
        )
    }

    #[test]
    fn test_unprofitable_spread_is_rejected() {
        // funding_diff 0.0009 on $10k: 9 funding - 20 fees - 6 slippage
        // - 1 settlement buffer = -18.
        let decomposition = calculator().calculate_edge(&params(dec!(10000)));
        assert_eq!(decomposition.expected_funding_pnl, dec!(9));
        assert_eq!(decomposition.fees_total, dec!(20));
        assert_eq!(decomposition.slippage_total, dec!(6));
        assert_eq!(decomposition.settlement_buffer, dec!(1));
        assert_eq!(decomposition.total_edge, dec!(-18));
        assert!(!decomposition.is_profitable);
    }

    #[test]
    fn test_profitable_spread_clears_minimum() {
        let mut p = params(dec!(10000));
        p.funding_rate_short = dec!(0.0050);
        let decomposition = calculator().calculate_edge(&p);
        assert_eq!(decomposition.total_edge, dec!(22));
        assert!(decomposition.is_profitable);
    }

    #[test]
    fn test_total_edge_identity() {
        let mut p = params(dec!(12345.67));
        p.leverage_long = dec!(3);
        p.leverage_short = dec!(2);
        let d = calculator().calculate_edge(&p);
        assert_eq!(
            d.total_edge,
            d.expected_funding_pnl
                - d.fees_total
                - d.borrow_total
                - d.slippage_total
                - d.settlement_buffer
        );
        assert_eq!(d.is_profitable, d.total_edge >= d.min_edge_required);
    }

    #[test]
    fn test_borrow_only_for_leveraged_legs() {
        let mut p = params(dec!(10000));
        p.borrow_rates.insert("USDT".to_string(), dec!(0.0002));
        let d = calculator().calculate_edge(&p);
        assert!(d.borrow_breakdown.is_empty());

        p.leverage_long = dec!(4);
        let d = calculator().calculate_edge(&p);
        // borrowed = 10000 * 3/4 = 7500; 7500 * 0.0002 * (8/24) = 0.5
        assert_eq!(d.borrow_breakdown["long_borrow"], dec!(0.5));
        assert!(!d.borrow_breakdown.contains_key("short_borrow"));
    }

    #[test]
    fn test_calculator_is_deterministic() {
        let p = params(dec!(5000));
        let calc = calculator();
        let a = calc.calculate_edge(&p);
        let b = calc.calculate_edge(&p);
        assert_eq!(a.total_edge, b.total_edge);
        assert_eq!(a.fees_breakdown, b.fees_breakdown);
    }

    #[test]
    fn test_combination_prefers_widest_spread() {
        let calc = calculator();
        let report: HashMap<_, _> = [
            funding("v1", "USDT", dec!(0.0001), 28800),
            funding("v2", "USDT", dec!(0.0010), 28800),
            funding("v3", "USDT", dec!(0.0004), 28800),
        ]
        .into_iter()
        .collect();
        let combo = calc.most_profitable_combination(&report).unwrap();
        assert_eq!(combo.long_venue, VenueId::from("v1"));
        assert_eq!(combo.short_venue, VenueId::from("v2"));
    }

    #[test]
    fn test_combination_normalizes_by_interval() {
        let calc = calculator();
        // Hourly 0.0002 vs 8h 0.0004: per-second the hourly venue pays
        // far more, so it becomes the short leg despite the smaller raw
        // rate.
        let report: HashMap<_, _> = [
            funding("hourly", "USDT", dec!(0.0002), 3600),
            funding("eighthour", "USDT", dec!(0.0004), 28800),
        ]
        .into_iter()
        .collect();
        let combo = calc.most_profitable_combination(&report).unwrap();
        assert_eq!(combo.short_venue, VenueId::from("hourly"));
    }

    #[test]
    fn test_combination_skips_quote_mismatch() {
        let calc = calculator();
        let report: HashMap<_, _> = [
            funding("v1", "USDT", dec!(0.0001), 28800),
            funding("v3", "USD", dec!(0.0100), 28800),
        ]
        .into_iter()
        .collect();
        assert!(calc.most_profitable_combination(&report).is_none());
    }

    #[test]
    fn test_combination_empty_and_single_report() {
        let calc = calculator();
        assert!(calc.most_profitable_combination(&HashMap::new()).is_none());
        let report: HashMap<_, _> = [funding("v1", "USDT", dec!(0.0001), 28800)]
            .into_iter()
            .collect();
        assert!(calc.most_profitable_combination(&report).is_none());
    }
}
