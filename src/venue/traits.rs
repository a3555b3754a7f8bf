//! Venue-agnostic trait for perpetual-futures venues.
//!
//! The engine consumes this interface only; concrete REST/WS connectors
//! live outside the crate. [`crate::venue::sim::SimVenue`] implements it
//! for demo mode and tests.

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::mpsc;

use super::error::VenueError;
use super::types::{
    FundingInfo, OrderBookSnapshot, OrderId, OrderRequest, OrderSide, OrderState, Position,
    PositionAction, PositionMode, TradingPair, VenueEvent, VenueId,
};

/// Common interface for perpetual-futures venues.
///
/// All calls are suspension points with venue-side timeouts; missing data
/// surfaces as `VenueError::Unavailable`, never as a panic.
#[async_trait]
pub trait Venue: Send + Sync {
    fn id(&self) -> &VenueId;

    /// Quote currency this venue settles perpetuals in (USDT, USD, ...).
    fn quote_asset(&self) -> &str;

    /// Funding settlement interval in seconds.
    fn funding_interval_seconds(&self) -> u64;

    async fn get_funding_info(&self, pair: &TradingPair) -> Result<FundingInfo, VenueError>;

    async fn get_order_book(&self, pair: &TradingPair) -> Result<OrderBookSnapshot, VenueError>;

    async fn get_balance(&self, asset: &str) -> Result<Decimal, VenueError>;

    /// Fee rate (fraction of notional) for the given order shape.
    async fn get_fee(
        &self,
        pair: &TradingPair,
        side: OrderSide,
        action: PositionAction,
        amount: Decimal,
        price: Decimal,
        is_maker: bool,
    ) -> Result<Decimal, VenueError>;

    async fn get_mid_price(&self, pair: &TradingPair) -> Result<Decimal, VenueError>;

    /// Average execution price for consuming `quote_volume` from the book.
    async fn get_price_for_quote_volume(
        &self,
        pair: &TradingPair,
        quote_volume: Decimal,
        is_buy: bool,
    ) -> Result<Decimal, VenueError>;

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderId, VenueError>;

    async fn cancel_order(&self, pair: &TradingPair, order_id: &OrderId)
        -> Result<(), VenueError>;

    async fn get_order(
        &self,
        pair: &TradingPair,
        order_id: &OrderId,
    ) -> Result<OrderState, VenueError>;

    /// Current position for the pair, `None` when flat.
    async fn get_position(&self, pair: &TradingPair) -> Result<Option<Position>, VenueError>;

    /// May answer `UnsupportedLeverage`; the engine treats that as
    /// non-fatal per venue.
    async fn set_leverage(&self, pair: &TradingPair, leverage: u32) -> Result<(), VenueError>;

    /// May answer `UnsupportedMode` on ONEWAY-only venues.
    async fn set_position_mode(&self, mode: PositionMode) -> Result<(), VenueError>;

    /// Stream of fills, funding payments, order updates and connection
    /// status changes. Each call returns an independent receiver.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<VenueEvent>;
}

/// Default quote currency per known venue. Hyperliquid settles in USD,
/// everything else in USDT.
pub fn default_quote_asset(venue: &str) -> &'static str {
    if venue.starts_with("hyperliquid") {
        "USD"
    } else {
        "USDT"
    }
}

/// Default funding interval per known venue: hourly on Hyperliquid,
/// 8 hours everywhere else.
pub fn default_funding_interval_seconds(venue: &str) -> u64 {
    if venue.starts_with("hyperliquid") {
        3600
    } else {
        8 * 3600
    }
}

/// Venues that only support ONEWAY position mode; `set_position_mode(HEDGE)`
/// must be skipped for them.
pub fn is_oneway_only(venue: &str) -> bool {
    venue.starts_with("hyperliquid")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_venue_defaults() {
        assert_eq!(default_quote_asset("hyperliquid_perpetual"), "USD");
        assert_eq!(default_quote_asset("binance_perpetual"), "USDT");
        assert_eq!(default_funding_interval_seconds("hyperliquid_perpetual"), 3600);
        assert_eq!(default_funding_interval_seconds("okx_perpetual"), 28800);
        assert!(is_oneway_only("hyperliquid_perpetual"));
        assert!(!is_oneway_only("bybit_perpetual"));
    }
}
