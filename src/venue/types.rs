//! Core market data and order types shared across the engine.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identifier of a perpetual-futures venue (e.g. "binance_perpetual").
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VenueId(String);

impl VenueId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VenueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for VenueId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A base/quote trading pair. Displayed as `BASE-QUOTE`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TradingPair {
    pub base: String,
    pub quote: String,
}

impl TradingPair {
    pub fn new(base: impl Into<String>, quote: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            quote: quote.into(),
        }
    }

    /// Parse a raw venue symbol into base/quote.
    ///
    /// Accepts `BTC-USDT` style delimited symbols; for compact symbols
    /// like `BTCUSDT` the quote is matched by suffix, longest first
    /// (4-char stable quotes, then common 3-char quotes), falling back to
    /// the last three characters.
    pub fn parse(symbol: &str) -> Option<Self> {
        for sep in ['-', '/', '_'] {
            if let Some((base, quote)) = symbol.split_once(sep) {
                if base.is_empty() || quote.is_empty() {
                    return None;
                }
                return Some(Self::new(base, quote));
            }
        }

        const QUOTES_4: [&str; 4] = ["USDT", "USDC", "BUSD", "TUSD"];
        const QUOTES_3: [&str; 8] = ["USD", "EUR", "GBP", "JPY", "BTC", "ETH", "BNB", "DAI"];

        for quote in QUOTES_4 {
            if symbol.len() > 4 && symbol.ends_with(quote) {
                return Some(Self::new(&symbol[..symbol.len() - 4], quote));
            }
        }
        for quote in QUOTES_3 {
            if symbol.len() > 3 && symbol.ends_with(quote) {
                return Some(Self::new(&symbol[..symbol.len() - 3], quote));
            }
        }
        if symbol.len() > 3 {
            return Some(Self::new(
                &symbol[..symbol.len() - 3],
                &symbol[symbol.len() - 3..],
            ));
        }
        None
    }
}

impl fmt::Display for TradingPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.base, self.quote)
    }
}

/// Funding rate observation for one venue/pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingInfo {
    pub venue: VenueId,
    pub pair: TradingPair,
    /// Signed rate per settlement interval.
    pub rate: Decimal,
    /// Settlement interval in seconds. Must be > 0.
    pub interval_seconds: u64,
    pub next_settlement_utc: Option<DateTime<Utc>>,
    pub index_price: Option<Decimal>,
    pub mark_price: Option<Decimal>,
}

impl FundingInfo {
    /// Funding rate normalized to a per-second rate.
    /// Returns `None` for a degenerate interval.
    pub fn rate_per_second(&self) -> Option<Decimal> {
        if self.interval_seconds == 0 {
            return None;
        }
        Some(self.rate / Decimal::from(self.interval_seconds))
    }
}

/// One price level of an order book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: Decimal,
    pub amount: Decimal,
}

/// Order book snapshot with bids sorted by price descending and asks
/// ascending.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBookSnapshot {
    pub venue: VenueId,
    pub pair: TradingPair,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
}

impl OrderBookSnapshot {
    /// Mid price, `None` when either side of the book is empty.
    pub fn mid(&self) -> Option<Decimal> {
        let best_bid = self.bids.first()?.price;
        let best_ask = self.asks.first()?.price;
        Some((best_bid + best_ask) / Decimal::TWO)
    }

    /// Aggregate base volume over the top `levels` of one side.
    /// Returns `None` when the book side is empty.
    pub fn depth_base(&self, side: BookSide, levels: usize) -> Option<Decimal> {
        let entries = match side {
            BookSide::Bids => &self.bids,
            BookSide::Asks => &self.asks,
        };
        if entries.is_empty() {
            return None;
        }
        Some(entries.iter().take(levels).map(|l| l.amount).sum())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookSide {
    Bids,
    Asks,
}

/// Direction of one leg of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn opposite(&self) -> Self {
        match self {
            PositionSide::Long => PositionSide::Short,
            PositionSide::Short => PositionSide::Long,
        }
    }
}

impl fmt::Display for PositionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionSide::Long => f.write_str("long"),
            PositionSide::Short => f.write_str("short"),
        }
    }
}

/// Order side as submitted to a venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(&self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }

    /// Side that opens a position in the given direction.
    pub fn opening(side: PositionSide) -> Self {
        match side {
            PositionSide::Long => OrderSide::Buy,
            PositionSide::Short => OrderSide::Sell,
        }
    }
}

/// Whether an order opens or closes exposure; venues price fees by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionAction {
    Open,
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(String);

impl OrderId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// New order intent sent to a venue.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub pair: TradingPair,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub amount_base: Decimal,
    pub price: Option<Decimal>,
    pub reduce_only: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
}

/// Observed state of an order on a venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderState {
    pub id: OrderId,
    pub pair: TradingPair,
    pub side: OrderSide,
    pub status: OrderStatus,
    pub filled_base: Decimal,
    pub filled_quote: Decimal,
    pub avg_price: Option<Decimal>,
}

impl OrderState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Rejected
        )
    }
}

/// A venue-reported position for one pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub venue: VenueId,
    pub pair: TradingPair,
    pub side: PositionSide,
    /// Size in base currency, always positive.
    pub size: Decimal,
    pub notional_quote: Decimal,
    pub leverage: Decimal,
    pub entry_price: Decimal,
    pub mark_price: Option<Decimal>,
    pub unrealized_pnl: Option<Decimal>,
    pub liquidation_price: Option<Decimal>,
    /// Venue ADL queue indicator 1-5 when exposed.
    pub adl_indicator: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionMode {
    Oneway,
    Hedge,
}

impl fmt::Display for PositionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionMode::Oneway => f.write_str("ONEWAY"),
            PositionMode::Hedge => f.write_str("HEDGE"),
        }
    }
}

/// Connection channel classes tracked per venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionChannel {
    Rest,
    Websocket,
    UserStream,
}

impl fmt::Display for ConnectionChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionChannel::Rest => f.write_str("rest"),
            ConnectionChannel::Websocket => f.write_str("websocket"),
            ConnectionChannel::UserStream => f.write_str("user_stream"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connected,
    Disconnected,
    Error,
}

/// A completed funding payment as reported by a venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingPayment {
    pub venue: VenueId,
    /// Raw venue symbol; parsed with [`TradingPair::parse`].
    pub symbol: String,
    /// Signed payment in quote currency; venues occasionally omit it.
    pub amount: Option<Decimal>,
    pub rate: Option<Decimal>,
    pub timestamp: DateTime<Utc>,
}

/// Events pushed from venue connectors into the engine mailbox.
#[derive(Debug, Clone)]
pub enum VenueEvent {
    Fill {
        venue: VenueId,
        order: OrderState,
        fee_quote: Decimal,
    },
    FundingPayment(FundingPayment),
    OrderUpdate {
        venue: VenueId,
        order: OrderState,
    },
    Connection {
        venue: VenueId,
        channel: ConnectionChannel,
        state: ConnectionState,
    },
}
