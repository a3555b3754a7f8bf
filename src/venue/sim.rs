//! Simulated venue for demo mode and tests.
//!
//! Plays the role a live connector plays, behind the same [`Venue`] trait:
//! market orders fill after a configurable delay (reduce-only orders use
//! the close delay), positions track entry price and unrealized PnL from
//! the settable price map, and funding settles into the quote balance at
//! the configured interval. No network, no real orders.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

use super::error::VenueError;
use super::traits::{
    default_funding_interval_seconds, default_quote_asset, is_oneway_only, Venue,
};
use super::types::{
    BookSide, FundingInfo, FundingPayment, OrderBookSnapshot, OrderId, OrderRequest, OrderSide,
    OrderState, OrderStatus, OrderType, Position, PositionAction, PositionMode, PositionSide,
    TradingPair, VenueEvent, VenueId,
};

/// Tunables for the simulated venue.
#[derive(Debug, Clone)]
pub struct SimVenueConfig {
    pub initial_balance: Decimal,
    /// Flat taker fee charged on every fill.
    pub taker_fee: Decimal,
    /// Delay before an opening market order fills.
    pub fill_delay: Duration,
    /// Delay before a reduce-only market order fills.
    pub close_delay: Duration,
}

impl Default for SimVenueConfig {
    fn default() -> Self {
        Self {
            initial_balance: dec!(10000),
            taker_fee: dec!(0.0004),
            fill_delay: Duration::from_secs(2),
            close_delay: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone)]
struct SimOrder {
    state: OrderState,
    reduce_only: bool,
    placed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct SimPosition {
    side: PositionSide,
    size: Decimal,
    entry_price: Decimal,
    leverage: u32,
}

#[derive(Debug, Default)]
struct SimState {
    balance: Decimal,
    rates: HashMap<TradingPair, Decimal>,
    next_settlements: HashMap<TradingPair, DateTime<Utc>>,
    prices: HashMap<TradingPair, Decimal>,
    books: HashMap<TradingPair, OrderBookSnapshot>,
    orders: HashMap<OrderId, SimOrder>,
    positions: HashMap<TradingPair, SimPosition>,
    leverage: HashMap<TradingPair, u32>,
    fees_paid: Decimal,
}

/// Simulated venue.
pub struct SimVenue {
    id: VenueId,
    quote_asset: String,
    funding_interval_seconds: u64,
    oneway_only: bool,
    config: SimVenueConfig,
    state: RwLock<SimState>,
    order_seq: AtomicU64,
    fail_orders: AtomicBool,
    reject_leverage: AtomicBool,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<VenueEvent>>>,
}

impl SimVenue {
    pub fn new(id: VenueId, config: SimVenueConfig) -> Self {
        let name = id.as_str().to_string();
        let state = SimState {
            balance: config.initial_balance,
            ..Default::default()
        };
        Self {
            quote_asset: default_quote_asset(&name).to_string(),
            funding_interval_seconds: default_funding_interval_seconds(&name),
            oneway_only: is_oneway_only(&name),
            id,
            config,
            state: RwLock::new(state),
            order_seq: AtomicU64::new(1),
            fail_orders: AtomicBool::new(false),
            reject_leverage: AtomicBool::new(false),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Set the mid/mark price used for fills and PnL.
    pub async fn set_price(&self, pair: TradingPair, price: Decimal) {
        self.state.write().await.prices.insert(pair, price);
    }

    /// Set the funding rate and next settlement for a pair.
    pub async fn set_funding(
        &self,
        pair: TradingPair,
        rate: Decimal,
        next_settlement: Option<DateTime<Utc>>,
    ) {
        let mut state = self.state.write().await;
        if let Some(ts) = next_settlement {
            state.next_settlements.insert(pair.clone(), ts);
        }
        state.rates.insert(pair, rate);
    }

    pub async fn set_order_book(&self, book: OrderBookSnapshot) {
        self.state
            .write()
            .await
            .books
            .insert(book.pair.clone(), book);
    }

    pub async fn set_balance(&self, balance: Decimal) {
        self.state.write().await.balance = balance;
    }

    /// Make subsequent `place_order` calls fail with a network error.
    pub fn set_fail_orders(&self, fail: bool) {
        self.fail_orders.store(fail, Ordering::SeqCst);
    }

    /// Make `set_leverage` answer `UnsupportedLeverage`.
    pub fn set_reject_leverage(&self, reject: bool) {
        self.reject_leverage.store(reject, Ordering::SeqCst);
    }

    pub async fn total_fees_paid(&self) -> Decimal {
        self.state.read().await.fees_paid
    }

    fn emit(&self, event: VenueEvent) {
        let mut subs = self.subscribers.lock().expect("subscriber lock");
        subs.retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn delay_for(&self, reduce_only: bool) -> ChronoDuration {
        let d = if reduce_only {
            self.config.close_delay
        } else {
            self.config.fill_delay
        };
        ChronoDuration::milliseconds(d.as_millis() as i64)
    }

    /// Process due fills and funding settlements. Called from every
    /// observation method so simulated time moves with the caller.
    async fn advance(&self) {
        let now = Utc::now();
        let mut fills: Vec<(OrderState, Decimal)> = Vec::new();
        let mut payments: Vec<FundingPayment> = Vec::new();

        {
            let mut state = self.state.write().await;

            // Fill due orders.
            let due: Vec<OrderId> = state
                .orders
                .iter()
                .filter(|(_, o)| {
                    o.state.status == OrderStatus::New
                        && now - o.placed_at >= self.delay_for(o.reduce_only)
                })
                .map(|(id, _)| id.clone())
                .collect();

            for order_id in due {
                let (pair, side, amount, reduce_only) = {
                    let order = &state.orders[&order_id];
                    (
                        order.state.pair.clone(),
                        order.state.side,
                        order.state.filled_base, // stashed request amount
                        order.reduce_only,
                    )
                };
                let Some(price) = state.prices.get(&pair).copied() else {
                    continue; // no price, order stays open
                };

                let filled_quote = amount * price;
                let fee = filled_quote * self.config.taker_fee;
                state.balance -= fee;
                state.fees_paid += fee;

                Self::apply_fill(&mut state, &pair, side, amount, price, reduce_only);

                let order = state.orders.get_mut(&order_id).expect("due order");
                order.state.status = OrderStatus::Filled;
                order.state.filled_base = amount;
                order.state.filled_quote = filled_quote;
                order.state.avg_price = Some(price);
                fills.push((order.state.clone(), fee));
            }

            // Settle funding for open positions.
            let settle: Vec<TradingPair> = state
                .next_settlements
                .iter()
                .filter(|(pair, ts)| **ts <= now && state.positions.contains_key(*pair))
                .map(|(pair, _)| pair.clone())
                .collect();

            for pair in settle {
                let Some(rate) = state.rates.get(&pair).copied() else {
                    continue;
                };
                let Some(position) = state.positions.get(&pair) else {
                    continue;
                };
                let Some(price) = state.prices.get(&pair).copied() else {
                    continue;
                };
                let notional = position.size * price;
                // Longs pay shorts when the rate is positive.
                let amount = match position.side {
                    PositionSide::Long => -rate * notional,
                    PositionSide::Short => rate * notional,
                };
                state.balance += amount;
                payments.push(FundingPayment {
                    venue: self.id.clone(),
                    symbol: pair.to_string(),
                    amount: Some(amount),
                    rate: Some(rate),
                    timestamp: now,
                });
                let interval = ChronoDuration::seconds(self.funding_interval_seconds as i64);
                if let Some(ts) = state.next_settlements.get_mut(&pair) {
                    *ts = *ts + interval;
                }
            }
        }

        for (order, fee) in fills {
            debug!(venue = %self.id, order_id = %order.id, "simulated fill");
            self.emit(VenueEvent::Fill {
                venue: self.id.clone(),
                order,
                fee_quote: fee,
            });
        }
        for payment in payments {
            self.emit(VenueEvent::FundingPayment(payment));
        }
    }

    fn apply_fill(
        state: &mut SimState,
        pair: &TradingPair,
        side: OrderSide,
        amount: Decimal,
        price: Decimal,
        reduce_only: bool,
    ) {
        if reduce_only {
            let mut realized = Decimal::ZERO;
            let mut remove = false;
            if let Some(position) = state.positions.get_mut(pair) {
                let reduce = amount.min(position.size);
                realized = match position.side {
                    PositionSide::Long => (price - position.entry_price) * reduce,
                    PositionSide::Short => (position.entry_price - price) * reduce,
                };
                position.size -= reduce;
                remove = position.size <= Decimal::ZERO;
            }
            state.balance += realized;
            if remove {
                state.positions.remove(pair);
            }
            return;
        }

        let opening_side = match side {
            OrderSide::Buy => PositionSide::Long,
            OrderSide::Sell => PositionSide::Short,
        };
        let leverage = state.leverage.get(pair).copied().unwrap_or(1);
        match state.positions.get_mut(pair) {
            Some(position) if position.side == opening_side => {
                let total = position.size + amount;
                position.entry_price =
                    (position.entry_price * position.size + price * amount) / total;
                position.size = total;
            }
            Some(position) => {
                // Opposite-direction fill nets the position down.
                let reduce = amount.min(position.size);
                let realized = match position.side {
                    PositionSide::Long => (price - position.entry_price) * reduce,
                    PositionSide::Short => (position.entry_price - price) * reduce,
                };
                state.balance += realized;
                position.size -= reduce;
                if position.size <= Decimal::ZERO {
                    state.positions.remove(pair);
                }
            }
            None => {
                state.positions.insert(
                    pair.clone(),
                    SimPosition {
                        side: opening_side,
                        size: amount,
                        entry_price: price,
                        leverage,
                    },
                );
            }
        }
    }
}

#[async_trait]
impl Venue for SimVenue {
    fn id(&self) -> &VenueId {
        &self.id
    }

    fn quote_asset(&self) -> &str {
        &self.quote_asset
    }

    fn funding_interval_seconds(&self) -> u64 {
        self.funding_interval_seconds
    }

    async fn get_funding_info(&self, pair: &TradingPair) -> Result<FundingInfo, VenueError> {
        self.advance().await;
        let state = self.state.read().await;
        let rate = state
            .rates
            .get(pair)
            .copied()
            .ok_or(VenueError::Unavailable("funding rate"))?;
        Ok(FundingInfo {
            venue: self.id.clone(),
            pair: pair.clone(),
            rate,
            interval_seconds: self.funding_interval_seconds,
            next_settlement_utc: state.next_settlements.get(pair).copied(),
            index_price: state.prices.get(pair).copied(),
            mark_price: state.prices.get(pair).copied(),
        })
    }

    async fn get_order_book(&self, pair: &TradingPair) -> Result<OrderBookSnapshot, VenueError> {
        self.advance().await;
        self.state
            .read()
            .await
            .books
            .get(pair)
            .cloned()
            .ok_or(VenueError::Unavailable("order book"))
    }

    async fn get_balance(&self, asset: &str) -> Result<Decimal, VenueError> {
        self.advance().await;
        if asset == self.quote_asset {
            Ok(self.state.read().await.balance)
        } else {
            Ok(Decimal::ZERO)
        }
    }

    async fn get_fee(
        &self,
        _pair: &TradingPair,
        _side: OrderSide,
        _action: PositionAction,
        _amount: Decimal,
        _price: Decimal,
        _is_maker: bool,
    ) -> Result<Decimal, VenueError> {
        Ok(self.config.taker_fee)
    }

    async fn get_mid_price(&self, pair: &TradingPair) -> Result<Decimal, VenueError> {
        self.advance().await;
        let state = self.state.read().await;
        if let Some(book) = state.books.get(pair) {
            if let Some(mid) = book.mid() {
                return Ok(mid);
            }
        }
        state
            .prices
            .get(pair)
            .copied()
            .ok_or(VenueError::Unavailable("mid price"))
    }

    async fn get_price_for_quote_volume(
        &self,
        pair: &TradingPair,
        quote_volume: Decimal,
        is_buy: bool,
    ) -> Result<Decimal, VenueError> {
        self.advance().await;
        let state = self.state.read().await;
        if let Some(book) = state.books.get(pair) {
            let side = if is_buy { BookSide::Asks } else { BookSide::Bids };
            let levels = match side {
                BookSide::Asks => &book.asks,
                BookSide::Bids => &book.bids,
            };
            let mut remaining = quote_volume;
            let mut base_acc = Decimal::ZERO;
            let mut quote_acc = Decimal::ZERO;
            for level in levels {
                let level_quote = level.price * level.amount;
                let take_quote = remaining.min(level_quote);
                base_acc += take_quote / level.price;
                quote_acc += take_quote;
                remaining -= take_quote;
                if remaining <= Decimal::ZERO {
                    break;
                }
            }
            if base_acc > Decimal::ZERO && remaining <= Decimal::ZERO {
                return Ok(quote_acc / base_acc);
            }
        }
        state
            .prices
            .get(pair)
            .copied()
            .ok_or(VenueError::Unavailable("price for volume"))
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderId, VenueError> {
        if self.fail_orders.load(Ordering::SeqCst) {
            return Err(VenueError::Network("simulated order failure".into()));
        }
        if request.order_type == OrderType::Limit && request.price.is_none() {
            return Err(VenueError::OrderRejected("limit order without price".into()));
        }
        let id = OrderId::new(format!(
            "sim-{}-{}",
            self.id,
            self.order_seq.fetch_add(1, Ordering::SeqCst)
        ));
        let order = SimOrder {
            state: OrderState {
                id: id.clone(),
                pair: request.pair.clone(),
                side: request.side,
                status: OrderStatus::New,
                // Request amount is stashed here until the fill; reported
                // fill fields are rewritten when the order executes.
                filled_base: request.amount_base,
                filled_quote: Decimal::ZERO,
                avg_price: None,
            },
            reduce_only: request.reduce_only,
            placed_at: Utc::now(),
        };
        self.state.write().await.orders.insert(id.clone(), order);
        self.advance().await;
        Ok(id)
    }

    async fn cancel_order(
        &self,
        _pair: &TradingPair,
        order_id: &OrderId,
    ) -> Result<(), VenueError> {
        let mut state = self.state.write().await;
        match state.orders.get_mut(order_id) {
            Some(order) if !order.state.is_terminal() => {
                order.state.status = OrderStatus::Canceled;
                Ok(())
            }
            Some(_) => Ok(()),
            None => Err(VenueError::OrderRejected(format!(
                "unknown order {order_id}"
            ))),
        }
    }

    async fn get_order(
        &self,
        _pair: &TradingPair,
        order_id: &OrderId,
    ) -> Result<OrderState, VenueError> {
        self.advance().await;
        let state = self.state.read().await;
        let order = state
            .orders
            .get(order_id)
            .ok_or(VenueError::Unavailable("order"))?;
        let mut reported = order.state.clone();
        if reported.status == OrderStatus::New {
            // Not filled yet: nothing executed.
            reported.filled_base = Decimal::ZERO;
            reported.filled_quote = Decimal::ZERO;
        }
        Ok(reported)
    }

    async fn get_position(&self, pair: &TradingPair) -> Result<Option<Position>, VenueError> {
        self.advance().await;
        let state = self.state.read().await;
        let Some(position) = state.positions.get(pair) else {
            return Ok(None);
        };
        let mark = state.prices.get(pair).copied();
        let unrealized = mark.map(|price| match position.side {
            PositionSide::Long => (price - position.entry_price) * position.size,
            PositionSide::Short => (position.entry_price - price) * position.size,
        });
        let reference = mark.unwrap_or(position.entry_price);
        Ok(Some(Position {
            venue: self.id.clone(),
            pair: pair.clone(),
            side: position.side,
            size: position.size,
            notional_quote: position.size * reference,
            leverage: Decimal::from(position.leverage),
            entry_price: position.entry_price,
            mark_price: mark,
            unrealized_pnl: unrealized,
            liquidation_price: None,
            adl_indicator: None,
        }))
    }

    async fn set_leverage(&self, pair: &TradingPair, leverage: u32) -> Result<(), VenueError> {
        if self.reject_leverage.load(Ordering::SeqCst) {
            return Err(VenueError::UnsupportedLeverage);
        }
        self.state
            .write()
            .await
            .leverage
            .insert(pair.clone(), leverage);
        Ok(())
    }

    async fn set_position_mode(&self, mode: PositionMode) -> Result<(), VenueError> {
        if self.oneway_only && mode == PositionMode::Hedge {
            return Err(VenueError::UnsupportedMode);
        }
        Ok(())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<VenueEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().expect("subscriber lock").push(tx);
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instant_sim(name: &str) -> SimVenue {
        SimVenue::new(
            VenueId::from(name),
            SimVenueConfig {
                fill_delay: Duration::ZERO,
                close_delay: Duration::ZERO,
                ..Default::default()
            },
        )
    }

    fn pair() -> TradingPair {
        TradingPair::new("BTC", "USDT")
    }

    #[tokio::test]
    async fn test_market_order_fills_and_opens_position() {
        let sim = instant_sim("binance_perpetual");
        sim.set_price(pair(), dec!(50000)).await;

        let id = sim
            .place_order(&OrderRequest {
                pair: pair(),
                side: OrderSide::Buy,
                order_type: OrderType::Market,
                amount_base: dec!(0.2),
                price: None,
                reduce_only: false,
            })
            .await
            .unwrap();

        let order = sim.get_order(&pair(), &id).await.unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.filled_quote, dec!(10000));

        let position = sim.get_position(&pair()).await.unwrap().unwrap();
        assert_eq!(position.side, PositionSide::Long);
        assert_eq!(position.size, dec!(0.2));
    }

    #[tokio::test]
    async fn test_reduce_only_closes_position_and_realizes_pnl() {
        let sim = instant_sim("binance_perpetual");
        sim.set_price(pair(), dec!(50000)).await;
        sim.place_order(&OrderRequest {
            pair: pair(),
            side: OrderSide::Buy,
            order_type: OrderType::Market,
            amount_base: dec!(0.1),
            price: None,
            reduce_only: false,
        })
        .await
        .unwrap();

        sim.set_price(pair(), dec!(51000)).await;
        sim.place_order(&OrderRequest {
            pair: pair(),
            side: OrderSide::Sell,
            order_type: OrderType::Market,
            amount_base: dec!(0.1),
            price: None,
            reduce_only: true,
        })
        .await
        .unwrap();

        assert!(sim.get_position(&pair()).await.unwrap().is_none());
        // +$100 price move minus fees on both fills.
        let balance = sim.get_balance("USDT").await.unwrap();
        assert!(balance > dec!(10000) + dec!(95));
    }

    #[tokio::test]
    async fn test_funding_settlement_credits_short() {
        let sim = instant_sim("binance_perpetual");
        sim.set_price(pair(), dec!(10000)).await;
        sim.place_order(&OrderRequest {
            pair: pair(),
            side: OrderSide::Sell,
            order_type: OrderType::Market,
            amount_base: dec!(1),
            price: None,
            reduce_only: false,
        })
        .await
        .unwrap();

        let mut events = sim.subscribe();
        sim.set_funding(pair(), dec!(0.001), Some(Utc::now() - ChronoDuration::seconds(1)))
            .await;
        sim.get_position(&pair()).await.unwrap();

        // Drain to the funding payment event.
        let mut funding = None;
        while let Ok(event) = events.try_recv() {
            if let VenueEvent::FundingPayment(p) = event {
                funding = Some(p);
            }
        }
        let payment = funding.expect("funding payment emitted");
        assert_eq!(payment.amount, Some(dec!(10))); // 0.001 * 10_000, short receives
    }

    #[tokio::test]
    async fn test_delayed_order_reports_not_filled() {
        let sim = SimVenue::new(
            VenueId::from("binance_perpetual"),
            SimVenueConfig {
                fill_delay: Duration::from_secs(3600),
                ..Default::default()
            },
        );
        sim.set_price(pair(), dec!(100)).await;
        let id = sim
            .place_order(&OrderRequest {
                pair: pair(),
                side: OrderSide::Buy,
                order_type: OrderType::Market,
                amount_base: dec!(1),
                price: None,
                reduce_only: false,
            })
            .await
            .unwrap();
        let order = sim.get_order(&pair(), &id).await.unwrap();
        assert_eq!(order.status, OrderStatus::New);
        assert_eq!(order.filled_quote, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_oneway_only_rejects_hedge_mode() {
        let sim = instant_sim("hyperliquid_perpetual");
        assert!(matches!(
            sim.set_position_mode(PositionMode::Hedge).await,
            Err(VenueError::UnsupportedMode)
        ));
        assert!(sim.set_position_mode(PositionMode::Oneway).await.is_ok());
    }
}
