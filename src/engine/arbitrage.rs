//! The arbitrage lifecycle entity.
//!
//! One `Arbitrage` pairs a long and short leg of the same token on two
//! venues. State moves strictly forward through
//! PENDING -> ACTIVE -> CLOSING -> CLOSED; CLOSED is absorbing, and
//! transitions are only possible through the methods here.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;

use crate::venue::{FundingPayment, OrderId, PositionSide, TradingPair, VenueId};

/// Maximum retained funding payments per arbitrage.
pub const MAX_FUNDING_PAYMENTS: usize = 100;
/// Maximum archived arbitrages kept per token.
pub const MAX_ARCHIVED_PER_TOKEN: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArbState {
    Pending,
    Active,
    Closing,
    Closed,
}

impl fmt::Display for ArbState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ArbState::Pending => "PENDING",
            ArbState::Active => "ACTIVE",
            ArbState::Closing => "CLOSING",
            ArbState::Closed => "CLOSED",
        };
        f.write_str(s)
    }
}

/// One leg of the delta-neutral pair.
#[derive(Debug, Clone, Serialize)]
pub struct Leg {
    pub venue: VenueId,
    pub pair: TradingPair,
    pub side: PositionSide,
    pub order_id: Option<OrderId>,
    pub close_order_id: Option<OrderId>,
    pub filled_base: Decimal,
    pub filled_quote: Decimal,
    /// Latest observed PnL for this leg in quote currency.
    pub last_pnl: Decimal,
}

impl Leg {
    pub fn new(venue: VenueId, pair: TradingPair, side: PositionSide) -> Self {
        Self {
            venue,
            pair,
            side,
            order_id: None,
            close_order_id: None,
            filled_base: Decimal::ZERO,
            filled_quote: Decimal::ZERO,
            last_pnl: Decimal::ZERO,
        }
    }
}

/// A funding arbitrage across two venues, exclusively owned by the
/// lifecycle engine.
#[derive(Debug, Clone, Serialize)]
pub struct Arbitrage {
    pub token: String,
    pub long: Leg,
    pub short: Leg,
    pub notional_quote: Decimal,
    pub leverage: u32,
    state: ArbState,
    pub entry_time: DateTime<Utc>,
    pub close_reason: Option<String>,
    pub close_time: Option<DateTime<Utc>>,
    pub last_close_alert: Option<DateTime<Utc>>,
    funding_payments: VecDeque<FundingPayment>,
    pub validation_attempts: u32,
    pub last_validation_error: Option<String>,
    pub demo: bool,
    pub demo_accrued_funding_pnl: Option<Decimal>,
    pub demo_last_accrual: Option<DateTime<Utc>>,
}

impl Arbitrage {
    pub fn new(
        token: impl Into<String>,
        long: Leg,
        short: Leg,
        notional_quote: Decimal,
        leverage: u32,
        demo: bool,
    ) -> Self {
        Self {
            token: token.into(),
            long,
            short,
            notional_quote,
            leverage,
            state: ArbState::Pending,
            entry_time: Utc::now(),
            close_reason: None,
            close_time: None,
            last_close_alert: None,
            funding_payments: VecDeque::new(),
            validation_attempts: 0,
            last_validation_error: None,
            demo,
            demo_accrued_funding_pnl: if demo { Some(Decimal::ZERO) } else { None },
            demo_last_accrual: None,
        }
    }

    pub fn state(&self) -> ArbState {
        self.state
    }

    pub fn is_live(&self) -> bool {
        self.state != ArbState::Closed
    }

    pub fn venues(&self) -> [VenueId; 2] {
        [self.long.venue.clone(), self.short.venue.clone()]
    }

    pub fn involves_venue(&self, venue: &VenueId) -> bool {
        &self.long.venue == venue || &self.short.venue == venue
    }

    /// PENDING -> ACTIVE, after a successful hedge validation.
    pub fn activate(&mut self) -> bool {
        if self.state == ArbState::Pending {
            self.state = ArbState::Active;
            true
        } else {
            false
        }
    }

    /// PENDING|ACTIVE -> CLOSING, recording the reason. A no-op on an
    /// already-terminal arbitrage.
    pub fn begin_close(&mut self, reason: impl Into<String>) -> bool {
        match self.state {
            ArbState::Pending | ArbState::Active => {
                self.state = ArbState::Closing;
                self.close_reason = Some(reason.into());
                self.close_time = Some(Utc::now());
                true
            }
            ArbState::Closing | ArbState::Closed => false,
        }
    }

    /// CLOSING -> CLOSED.
    pub fn mark_closed(&mut self) -> bool {
        if self.state == ArbState::Closing {
            self.state = ArbState::Closed;
            true
        } else {
            false
        }
    }

    /// Append a funding payment, dropping the oldest past the bound.
    pub fn record_funding_payment(&mut self, payment: FundingPayment) {
        self.funding_payments.push_back(payment);
        while self.funding_payments.len() > MAX_FUNDING_PAYMENTS {
            self.funding_payments.pop_front();
        }
    }

    pub fn funding_payment_count(&self) -> usize {
        self.funding_payments.len()
    }

    /// Sum of received funding payments (missing amounts count as zero)
    /// plus any analytically accrued demo funding.
    pub fn funding_payments_pnl(&self) -> Decimal {
        let received: Decimal = self
            .funding_payments
            .iter()
            .filter_map(|p| p.amount)
            .sum();
        received + self.demo_accrued_funding_pnl.unwrap_or(Decimal::ZERO)
    }

    /// Latest observed combined PnL of both legs.
    pub fn executors_pnl(&self) -> Decimal {
        self.long.last_pnl + self.short.last_pnl
    }

    pub fn age_minutes(&self, now: DateTime<Utc>) -> f64 {
        (now - self.entry_time).num_seconds() as f64 / 60.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn arbitrage() -> Arbitrage {
        let pair = TradingPair::new("BTC", "USDT");
        Arbitrage::new(
            "BTC",
            Leg::new(VenueId::from("v1"), pair.clone(), PositionSide::Long),
            Leg::new(VenueId::from("v2"), pair, PositionSide::Short),
            dec!(10000),
            1,
            false,
        )
    }

    fn payment(amount: Option<Decimal>) -> FundingPayment {
        FundingPayment {
            venue: VenueId::from("v1"),
            symbol: "BTC-USDT".to_string(),
            amount,
            rate: None,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_forward_transitions() {
        let mut arb = arbitrage();
        assert_eq!(arb.state(), ArbState::Pending);
        assert!(arb.activate());
        assert_eq!(arb.state(), ArbState::Active);
        assert!(arb.begin_close("take profit"));
        assert_eq!(arb.state(), ArbState::Closing);
        assert_eq!(arb.close_reason.as_deref(), Some("take profit"));
        assert!(arb.close_time.is_some());
        assert!(arb.mark_closed());
        assert_eq!(arb.state(), ArbState::Closed);
    }

    #[test]
    fn test_pending_can_close_directly() {
        let mut arb = arbitrage();
        assert!(arb.begin_close("pending validation timeout"));
        assert_eq!(arb.state(), ArbState::Closing);
        // Cannot become active after closing began.
        assert!(!arb.activate());
    }

    #[test]
    fn test_closed_is_absorbing() {
        let mut arb = arbitrage();
        arb.activate();
        arb.begin_close("stop loss");
        arb.mark_closed();
        assert!(!arb.activate());
        assert!(!arb.begin_close("again"));
        assert!(!arb.mark_closed());
        assert_eq!(arb.state(), ArbState::Closed);
        assert_eq!(arb.close_reason.as_deref(), Some("stop loss"));
    }

    #[test]
    fn test_closing_an_already_closing_arbitrage_is_noop() {
        let mut arb = arbitrage();
        arb.activate();
        assert!(arb.begin_close("first"));
        let close_time = arb.close_time;
        assert!(!arb.begin_close("second"));
        assert_eq!(arb.close_reason.as_deref(), Some("first"));
        assert_eq!(arb.close_time, close_time);
    }

    #[test]
    fn test_funding_ring_is_bounded() {
        let mut arb = arbitrage();
        for _ in 0..150 {
            arb.record_funding_payment(payment(Some(dec!(1))));
        }
        assert_eq!(arb.funding_payment_count(), MAX_FUNDING_PAYMENTS);
        assert_eq!(arb.funding_payments_pnl(), dec!(100));
    }

    #[test]
    fn test_missing_payment_amounts_are_skipped() {
        let mut arb = arbitrage();
        arb.record_funding_payment(payment(Some(dec!(3))));
        arb.record_funding_payment(payment(None));
        arb.record_funding_payment(payment(Some(dec!(2))));
        assert_eq!(arb.funding_payments_pnl(), dec!(5));
    }

    #[test]
    fn test_demo_accrual_adds_to_funding_pnl() {
        let pair = TradingPair::new("BTC", "USDT");
        let mut arb = Arbitrage::new(
            "BTC",
            Leg::new(VenueId::from("v1"), pair.clone(), PositionSide::Long),
            Leg::new(VenueId::from("v2"), pair, PositionSide::Short),
            dec!(10000),
            1,
            true,
        );
        arb.demo_accrued_funding_pnl = Some(dec!(7));
        arb.record_funding_payment(payment(Some(dec!(3))));
        assert_eq!(arb.funding_payments_pnl(), dec!(10));
    }
}
