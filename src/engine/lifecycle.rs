//! The lifecycle engine: scan, enter, validate, monitor, close, confirm.
//!
//! A single actor owns all arbitrage state and drives the pipeline on a
//! seconds-cadence tick. Venue I/O happens through rate-limited calls;
//! fills and funding payments arrive through a mailbox and are applied
//! between ticks, so every tick sees a consistent snapshot.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};

use crate::alerts::{Alert, AlertSeverity, AlertSink};
use crate::config::EngineConfig;
use crate::edge::{EdgeCalculator, EdgeParams, VenueCombination};
use crate::metrics::{names, MetricsRegistry};
use crate::reliability::{BreakerKind, ReliabilityGate};
use crate::risk::{
    LiquidityMetrics, PositionBook, PositionKey, PositionMarginInfo, PositionRecord,
    ReconPositionSnapshot, RiskManager,
};
use crate::risk::MarginMonitor;
use crate::scheduler::SettlementScheduler;
use crate::utils::decimal::imbalance_pct;
use crate::venue::{
    BookSide, FundingInfo, OrderId, OrderRequest, OrderSide, OrderState, OrderType, PositionAction,
    PositionMode, PositionSide, TradingPair, Venue, VenueError, VenueEvent, VenueId,
};

use super::arbitrage::{ArbState, Arbitrage, Leg, MAX_ARCHIVED_PER_TOKEN};

/// Margin buffer required over `notional / leverage` when validating
/// balances before entry.
const BALANCE_BUFFER: Decimal = dec!(1.10);
/// Fraction of balance-derived capacity usable for fixed-size positions.
const BALANCE_HEADROOM: Decimal = dec!(0.95);
/// Order book levels aggregated for the depth gate.
const DEPTH_LEVELS: usize = 20;

const READ_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(1);
const ORDER_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

/// Control commands other subsystems (margin monitor, operators) can
/// send into the actor; applied at tick start like venue events.
#[derive(Debug, Clone)]
pub enum EngineCommand {
    /// Close every live arbitrage touching a venue.
    CloseVenuePositions { venue: VenueId, reason: String },
    /// Close everything.
    CloseAllPositions { reason: String },
}

/// Everything the engine depends on; tests build a fresh one.
pub struct EngineDeps {
    pub venues: HashMap<VenueId, Arc<dyn Venue>>,
    pub gate: Arc<ReliabilityGate>,
    pub scheduler: Arc<SettlementScheduler>,
    pub edge: EdgeCalculator,
    pub margin: Arc<MarginMonitor>,
    pub book: Arc<Mutex<PositionBook>>,
    pub alerts: Arc<dyn AlertSink>,
    pub metrics: Arc<MetricsRegistry>,
}

/// Shared point-in-time view of the engine for the health endpoints.
#[derive(Debug, Default)]
pub struct EngineStatus {
    inner: Mutex<EngineStatusSnapshot>,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct EngineStatusSnapshot {
    pub active: usize,
    pub pending: usize,
    pub closing: usize,
    pub archived: usize,
    pub unrealized_pnl: Decimal,
    pub realized_pnl: Decimal,
    pub ticks: u64,
    pub last_tick: Option<DateTime<Utc>>,
}

impl EngineStatus {
    pub fn snapshot(&self) -> EngineStatusSnapshot {
        self.inner.lock().expect("status lock").clone()
    }

    fn store(&self, snapshot: EngineStatusSnapshot) {
        *self.inner.lock().expect("status lock") = snapshot;
    }
}

/// The pipeline driver. Owns every live [`Arbitrage`].
pub struct LifecycleEngine {
    config: EngineConfig,
    deps: EngineDeps,
    risk: RiskManager,
    live: HashMap<String, Arbitrage>,
    archived: HashMap<String, Vec<Arbitrage>>,
    /// Risk-manager position ids per token: (long, short).
    risk_ids: HashMap<String, (String, String)>,
    funding_cache: HashMap<(VenueId, String), FundingInfo>,
    initial_balances: HashMap<(VenueId, String), Decimal>,
    events_tx: mpsc::UnboundedSender<VenueEvent>,
    events_rx: mpsc::UnboundedReceiver<VenueEvent>,
    commands_tx: mpsc::UnboundedSender<EngineCommand>,
    commands_rx: mpsc::UnboundedReceiver<EngineCommand>,
    status: Arc<EngineStatus>,
    realized_pnl: Decimal,
    last_stats_log: Option<DateTime<Utc>>,
    ticks: u64,
}

impl LifecycleEngine {
    pub fn new(config: EngineConfig, deps: EngineDeps) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let risk = RiskManager::new(config.risk.clone());
        Self {
            config,
            deps,
            risk,
            live: HashMap::new(),
            archived: HashMap::new(),
            risk_ids: HashMap::new(),
            funding_cache: HashMap::new(),
            initial_balances: HashMap::new(),
            events_tx,
            events_rx,
            commands_tx,
            commands_rx,
            status: Arc::new(EngineStatus::default()),
            realized_pnl: Decimal::ZERO,
            last_stats_log: None,
            ticks: 0,
        }
    }

    pub fn event_sender(&self) -> mpsc::UnboundedSender<VenueEvent> {
        self.events_tx.clone()
    }

    pub fn command_sender(&self) -> mpsc::UnboundedSender<EngineCommand> {
        self.commands_tx.clone()
    }

    pub fn status_handle(&self) -> Arc<EngineStatus> {
        self.status.clone()
    }

    fn pair_for(&self, venue: &Arc<dyn Venue>, token: &str) -> TradingPair {
        TradingPair::new(token, venue.quote_asset())
    }

    fn venue(&self, id: &VenueId) -> Option<Arc<dyn Venue>> {
        self.deps.venues.get(id).cloned()
    }

    /// Forward every venue's event stream into the engine mailbox.
    pub fn attach_venue_streams(&self) {
        for venue in self.deps.venues.values() {
            let mut rx = venue.subscribe();
            let tx = self.events_tx.clone();
            tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    if tx.send(event).is_err() {
                        break;
                    }
                }
            });
        }
    }

    /// Startup: warn on mixed quote currencies, then apply position mode
    /// and leverage per venue. Unsupported modes and leverage are logged
    /// and alerted, never fatal.
    pub async fn setup_venues(&self) {
        let quotes: HashSet<String> = self
            .deps
            .venues
            .values()
            .map(|v| v.quote_asset().to_string())
            .collect();
        if quotes.len() > 1 {
            warn!(
                quotes = ?quotes,
                "multiple quote currencies configured; stablecoin depegs can fake arbitrage"
            );
            self.deps.alerts.emit(
                Alert::new(
                    AlertSeverity::Medium,
                    "Multiple quote currencies",
                    format!("venues settle in different quotes: {quotes:?}"),
                )
                .with_tag("startup"),
            );
        } else {
            info!(quotes = ?quotes, "quote currency check passed");
        }

        if self.config.demo.demo_mode {
            info!("demo mode: skipping position mode and leverage setup");
            return;
        }

        for (venue_id, venue) in &self.deps.venues {
            let mode = if crate::venue::is_oneway_only(venue_id.as_str()) {
                PositionMode::Oneway
            } else {
                PositionMode::Hedge
            };
            match venue.set_position_mode(mode).await {
                Ok(()) => info!(venue = %venue_id, %mode, "position mode set"),
                Err(VenueError::UnsupportedMode) => {
                    warn!(venue = %venue_id, %mode, "position mode unsupported, continuing");
                }
                Err(e) => {
                    error!(venue = %venue_id, error = %e, "failed to set position mode");
                    self.deps.alerts.emit(
                        Alert::new(
                            AlertSeverity::High,
                            "Position mode setup failed",
                            format!("{venue_id}: {e}"),
                        )
                        .with_tag("startup"),
                    );
                }
            }

            for token in &self.config.tokens {
                let pair = self.pair_for(venue, token);
                match venue.set_leverage(&pair, self.config.leverage).await {
                    Ok(()) => debug!(venue = %venue_id, %pair, leverage = self.config.leverage, "leverage set"),
                    Err(VenueError::UnsupportedLeverage) => {
                        warn!(venue = %venue_id, %pair, "leverage unsupported, continuing");
                        self.deps.alerts.emit(
                            Alert::new(
                                AlertSeverity::Medium,
                                "Leverage setup failed",
                                format!("{venue_id} {pair}: unsupported leverage"),
                            )
                            .with_tag("startup"),
                        );
                    }
                    Err(e) => {
                        error!(venue = %venue_id, %pair, error = %e, "failed to set leverage");
                    }
                }
            }
        }
    }

    /// Main loop: tick until shutdown, then move every live arbitrage to
    /// CLOSING and confirm the closes.
    pub async fn run(&mut self, shutdown: Arc<AtomicBool>) {
        info!(
            venues = self.deps.venues.len(),
            tokens = self.config.tokens.len(),
            tick_secs = self.config.tick_interval_seconds,
            demo = self.config.demo.demo_mode,
            "lifecycle engine started"
        );
        while !shutdown.load(Ordering::SeqCst) {
            self.tick().await;
            sleep(Duration::from_secs(self.config.tick_interval_seconds)).await;
        }
        self.shutdown().await;
    }

    /// One cooperative turn of the pipeline.
    pub async fn tick(&mut self) {
        self.ticks += 1;
        self.deps.metrics.incr(names::TICKS);

        self.drain_events();
        self.process_commands().await;
        self.refresh_funding().await;
        self.maybe_log_statistics();
        self.validate_pending().await;
        self.confirm_closing().await;
        self.manage_active().await;
        self.scan_opportunities().await;
        self.publish_status();
    }

    /// Shutdown path: everything live transitions to CLOSING, then we
    /// confirm until done or the close timeout has long passed.
    async fn shutdown(&mut self) {
        info!("engine stopping, closing all live positions");
        let tokens: Vec<String> = self
            .live
            .iter()
            .filter(|(_, arb)| matches!(arb.state(), ArbState::Pending | ArbState::Active))
            .map(|(token, _)| token.clone())
            .collect();
        for token in tokens {
            let Some(mut arb) = self.live.remove(&token) else {
                continue;
            };
            self.close_arbitrage(&mut arb, "strategy stopping").await;
            self.live.insert(token, arb);
        }

        let deadline = Utc::now()
            + chrono::Duration::seconds(2 * self.config.close_validation_timeout_seconds as i64);
        while self.live.values().any(|a| a.is_live()) && Utc::now() < deadline {
            self.drain_events();
            self.confirm_closing().await;
            sleep(Duration::from_secs(1)).await;
        }
        self.publish_status();
        info!(remaining = self.live.len(), "lifecycle engine stopped");
    }

    // ------------------------------------------------------------------
    // Mailbox
    // ------------------------------------------------------------------

    /// Apply queued venue events. Runs at tick start so the rest of the
    /// tick sees a consistent snapshot.
    fn drain_events(&mut self) {
        while let Ok(event) = self.events_rx.try_recv() {
            match event {
                VenueEvent::Fill { venue, order, .. }
                | VenueEvent::OrderUpdate { venue, order } => {
                    self.apply_order_update(&venue, order);
                }
                VenueEvent::FundingPayment(payment) => {
                    let Some(pair) = TradingPair::parse(&payment.symbol) else {
                        warn!(symbol = %payment.symbol, "unparseable funding payment symbol");
                        continue;
                    };
                    if let Some(arb) = self.live.get_mut(&pair.base) {
                        if matches!(arb.state(), ArbState::Active | ArbState::Closing) {
                            arb.record_funding_payment(payment);
                            self.deps.metrics.incr(names::FUNDING_PAYMENTS);
                        }
                    }
                }
                VenueEvent::Connection {
                    venue,
                    channel,
                    state,
                } => {
                    self.deps
                        .gate
                        .readiness
                        .update_connection_status(&venue, channel, state, None);
                }
            }
        }
    }

    /// Apply queued control commands.
    async fn process_commands(&mut self) {
        while let Ok(command) = self.commands_rx.try_recv() {
            match command {
                EngineCommand::CloseVenuePositions { venue, reason } => {
                    let tokens: Vec<String> = self
                        .live
                        .iter()
                        .filter(|(_, arb)| {
                            matches!(arb.state(), ArbState::Pending | ArbState::Active)
                                && arb.involves_venue(&venue)
                        })
                        .map(|(token, _)| token.clone())
                        .collect();
                    for token in tokens {
                        let Some(mut arb) = self.live.remove(&token) else {
                            continue;
                        };
                        self.close_arbitrage(&mut arb, &reason).await;
                        self.live.insert(token, arb);
                    }
                }
                EngineCommand::CloseAllPositions { reason } => {
                    let tokens: Vec<String> = self
                        .live
                        .iter()
                        .filter(|(_, arb)| {
                            matches!(arb.state(), ArbState::Pending | ArbState::Active)
                        })
                        .map(|(token, _)| token.clone())
                        .collect();
                    for token in tokens {
                        let Some(mut arb) = self.live.remove(&token) else {
                            continue;
                        };
                        self.close_arbitrage(&mut arb, &reason).await;
                        self.live.insert(token, arb);
                    }
                }
            }
        }
    }

    fn apply_order_update(&mut self, venue: &VenueId, order: OrderState) {
        for arb in self.live.values_mut() {
            for leg in [&mut arb.long, &mut arb.short] {
                if &leg.venue != venue {
                    continue;
                }
                if leg.order_id.as_ref() == Some(&order.id) {
                    leg.filled_base = order.filled_base;
                    leg.filled_quote = order.filled_quote;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Funding cache
    // ------------------------------------------------------------------

    /// Refresh the funding cache for every venue x token. The latest
    /// observation supersedes prior ones; failures count toward the
    /// error-series breaker.
    async fn refresh_funding(&mut self) {
        for (venue_id, venue) in self.deps.venues.clone() {
            for token in self.config.tokens.clone() {
                if !self
                    .deps
                    .gate
                    .rate_limiter
                    .acquire(&venue_id, 1, false, READ_ACQUIRE_TIMEOUT)
                    .await
                {
                    continue;
                }
                let pair = self.pair_for(&venue, &token);
                match venue.get_funding_info(&pair).await {
                    Ok(info) => {
                        if info.interval_seconds == 0 {
                            warn!(venue = %venue_id, %pair, "funding info with zero interval dropped");
                            continue;
                        }
                        self.funding_cache
                            .insert((venue_id.clone(), token.clone()), info);
                    }
                    Err(e) => {
                        self.note_venue_error(&venue_id, &e, "get_funding_info");
                    }
                }
            }
        }
    }

    fn funding_report(
        &self,
        token: &str,
        venues: &HashSet<VenueId>,
    ) -> HashMap<VenueId, FundingInfo> {
        self.funding_cache
            .iter()
            .filter(|((venue, t), _)| t == token && venues.contains(venue))
            .map(|((venue, _), info)| (venue.clone(), info.clone()))
            .collect()
    }

    /// Funding rate per second for a held token on one venue, from the
    /// cache.
    fn cached_rate_per_second(&self, venue: &VenueId, token: &str) -> Option<Decimal> {
        self.funding_cache
            .get(&(venue.clone(), token.to_string()))
            .and_then(|info| info.rate_per_second())
    }

    fn note_venue_error(&self, venue: &VenueId, error: &VenueError, operation: &str) {
        warn!(venue = %venue, operation, error = %error, "venue call failed");
        self.deps.metrics.incr(names::ERRORS);
        self.deps.metrics.incr_labeled(names::ERRORS, venue.as_str());
        if error.feeds_error_breaker() {
            self.deps
                .gate
                .breakers
                .record_failure(BreakerKind::ErrorSeries);
        }
    }

    // ------------------------------------------------------------------
    // Safe venue reads
    // ------------------------------------------------------------------

    async fn safe_mid_price(&self, venue_id: &VenueId, pair: &TradingPair) -> Option<Decimal> {
        let venue = self.venue(venue_id)?;
        if !self
            .deps
            .gate
            .rate_limiter
            .acquire(venue_id, 1, false, READ_ACQUIRE_TIMEOUT)
            .await
        {
            return None;
        }
        match venue.get_mid_price(pair).await {
            Ok(price) if price > Decimal::ZERO => Some(price),
            Ok(_) => None,
            Err(e) => {
                self.note_venue_error(venue_id, &e, "get_mid_price");
                None
            }
        }
    }

    async fn safe_balance(&self, venue_id: &VenueId, asset: &str) -> Option<Decimal> {
        let venue = self.venue(venue_id)?;
        if !self
            .deps
            .gate
            .rate_limiter
            .acquire(venue_id, 1, false, READ_ACQUIRE_TIMEOUT)
            .await
        {
            return None;
        }
        match venue.get_balance(asset).await {
            Ok(balance) => Some(balance),
            Err(e) => {
                self.note_venue_error(venue_id, &e, "get_balance");
                None
            }
        }
    }

    /// Fee rate with a conservative fallback when the venue cannot answer.
    async fn safe_fee(
        &self,
        venue_id: &VenueId,
        pair: &TradingPair,
        side: OrderSide,
        action: PositionAction,
        amount: Decimal,
        price: Decimal,
    ) -> Decimal {
        let fallback = dec!(0.001);
        let Some(venue) = self.venue(venue_id) else {
            return fallback;
        };
        if !self
            .deps
            .gate
            .rate_limiter
            .acquire(venue_id, 1, false, READ_ACQUIRE_TIMEOUT)
            .await
        {
            return fallback;
        }
        match venue.get_fee(pair, side, action, amount, price, false).await {
            Ok(fee) => fee,
            Err(e) => {
                self.note_venue_error(venue_id, &e, "get_fee");
                fallback
            }
        }
    }

    async fn observe_order(
        &self,
        venue_id: &VenueId,
        pair: &TradingPair,
        order_id: &OrderId,
    ) -> Result<OrderState, String> {
        let venue = self
            .venue(venue_id)
            .ok_or_else(|| format!("venue {venue_id} not available"))?;
        if !self
            .deps
            .gate
            .rate_limiter
            .acquire(venue_id, 1, false, READ_ACQUIRE_TIMEOUT)
            .await
        {
            return Err(format!("rate limited on {venue_id}"));
        }
        match venue.get_order(pair, order_id).await {
            Ok(state) => Ok(state),
            Err(e) => {
                self.note_venue_error(venue_id, &e, "get_order");
                Err(format!("order state unavailable on {venue_id}: {e}"))
            }
        }
    }

    // ------------------------------------------------------------------
    // Orders
    // ------------------------------------------------------------------

    async fn place_order(
        &self,
        venue_id: &VenueId,
        request: OrderRequest,
    ) -> Result<OrderId, String> {
        let venue = self
            .venue(venue_id)
            .ok_or_else(|| format!("venue {venue_id} not available"))?;
        if !self
            .deps
            .gate
            .rate_limiter
            .acquire(venue_id, 1, true, ORDER_ACQUIRE_TIMEOUT)
            .await
        {
            return Err(format!("rate limit timeout on {venue_id}"));
        }
        match venue.place_order(&request).await {
            Ok(order_id) => {
                self.deps
                    .gate
                    .breakers
                    .record_success(BreakerKind::ErrorSeries);
                Ok(order_id)
            }
            Err(e) => {
                self.note_venue_error(venue_id, &e, "place_order");
                Err(format!("order failed on {venue_id}: {e}"))
            }
        }
    }

    async fn cancel_order(&self, venue_id: &VenueId, pair: &TradingPair, order_id: &OrderId) {
        let Some(venue) = self.venue(venue_id) else {
            return;
        };
        if !self
            .deps
            .gate
            .rate_limiter
            .acquire(venue_id, 1, true, ORDER_ACQUIRE_TIMEOUT)
            .await
        {
            self.deps
                .gate
                .breakers
                .record_failure(BreakerKind::OrderCancel);
            return;
        }
        match venue.cancel_order(pair, order_id).await {
            Ok(()) => {
                self.deps
                    .gate
                    .breakers
                    .record_success(BreakerKind::OrderCancel);
            }
            Err(e) => {
                warn!(venue = %venue_id, order_id = %order_id, error = %e, "cancel failed");
                self.deps
                    .gate
                    .breakers
                    .record_failure(BreakerKind::OrderCancel);
            }
        }
    }

    /// Transition an arbitrage to CLOSING and issue the exits: filled
    /// legs get reduce-only market orders, unfilled open orders get
    /// canceled. Fill state is re-observed first so a leg that filled
    /// between ticks is closed, not canceled.
    async fn close_arbitrage(&mut self, arb: &mut Arbitrage, reason: &str) {
        if !arb.begin_close(reason) {
            return;
        }
        info!(token = %arb.token, reason, "arbitrage closing");

        for leg_side in [PositionSide::Long, PositionSide::Short] {
            let (venue_id, pair, order_id) = {
                let leg = match leg_side {
                    PositionSide::Long => &arb.long,
                    PositionSide::Short => &arb.short,
                };
                (leg.venue.clone(), leg.pair.clone(), leg.order_id.clone())
            };
            if let Some(order_id) = &order_id {
                if let Ok(state) = self.observe_order(&venue_id, &pair, order_id).await {
                    let leg = match leg_side {
                        PositionSide::Long => &mut arb.long,
                        PositionSide::Short => &mut arb.short,
                    };
                    leg.filled_base = state.filled_base;
                    leg.filled_quote = state.filled_quote;
                }
            }
            let (filled_base, side) = {
                let leg = match leg_side {
                    PositionSide::Long => &arb.long,
                    PositionSide::Short => &arb.short,
                };
                (leg.filled_base, leg.side)
            };

            if filled_base > Decimal::ZERO {
                let request = OrderRequest {
                    pair: pair.clone(),
                    side: OrderSide::opening(side).opposite(),
                    order_type: OrderType::Market,
                    amount_base: filled_base,
                    price: None,
                    reduce_only: true,
                };
                match self.place_order(&venue_id, request).await {
                    Ok(close_id) => {
                        let leg = match leg_side {
                            PositionSide::Long => &mut arb.long,
                            PositionSide::Short => &mut arb.short,
                        };
                        leg.close_order_id = Some(close_id);
                    }
                    Err(e) => {
                        error!(token = %arb.token, venue = %venue_id, error = %e, "failed to issue close order");
                    }
                }
            } else if let Some(order_id) = order_id {
                self.cancel_order(&venue_id, &pair, &order_id).await;
            }
        }

        self.drop_tracking(arb);
    }

    /// Remove risk/margin/book tracking for an arbitrage's legs.
    fn drop_tracking(&mut self, arb: &Arbitrage) {
        if let Some((long_id, short_id)) = self.risk_ids.remove(&arb.token) {
            self.risk.remove_position(&long_id);
            self.risk.remove_position(&short_id);
            self.deps.margin.remove_position(&long_id);
            self.deps.margin.remove_position(&short_id);
        }
        let mut book = self.deps.book.lock().expect("book lock");
        for leg in [&arb.long, &arb.short] {
            book.drop_position(&PositionKey {
                venue: leg.venue.clone(),
                pair: leg.pair.clone(),
                side: leg.side,
            });
        }
    }

    // ------------------------------------------------------------------
    // Pending validation
    // ------------------------------------------------------------------

    async fn validate_pending(&mut self) {
        let tokens: Vec<String> = self
            .live
            .iter()
            .filter(|(_, arb)| arb.state() == ArbState::Pending)
            .map(|(token, _)| token.clone())
            .collect();

        for token in tokens {
            let Some(mut arb) = self.live.remove(&token) else {
                continue;
            };
            self.process_pending(&mut arb).await;
            self.live.insert(token, arb);
        }
    }

    async fn process_pending(&mut self, arb: &mut Arbitrage) {
        let now = Utc::now();
        let pending_secs = (now - arb.entry_time).num_seconds();
        let timeout = self.config.pending_validation_timeout_seconds as i64;
        if timeout > 0 && pending_secs > timeout {
            error!(
                token = %arb.token,
                pending_secs,
                "pending position timed out, emergency closing"
            );
            self.deps.metrics.incr(names::PENDING_TIMEOUTS);
            self.deps.alerts.emit(
                Alert::new(
                    AlertSeverity::Critical,
                    "Pending position timeout",
                    format!(
                        "{}: unvalidated after {pending_secs}s (limit {timeout}s)",
                        arb.token
                    ),
                )
                .with_tag("lifecycle")
                .with_metadata("token", arb.token.clone()),
            );
            self.close_arbitrage(arb, "pending validation timeout").await;
            return;
        }

        match self.check_hedge(arb).await {
            HedgeCheck::Ok { imbalance } => {
                arb.activate();
                info!(
                    token = %arb.token,
                    long_venue = %arb.long.venue,
                    short_venue = %arb.short.venue,
                    notional = %arb.notional_quote,
                    imbalance = %imbalance,
                    "position opened"
                );
                self.deps.metrics.incr(names::POSITIONS_OPENED);
                self.deps.alerts.emit(
                    Alert::new(
                        AlertSeverity::Info,
                        "Position opened",
                        format!(
                            "{}: long {} / short {} for {}",
                            arb.token, arb.long.venue, arb.short.venue, arb.notional_quote
                        ),
                    )
                    .with_tag("lifecycle")
                    .with_metadata("token", arb.token.clone()),
                );
                self.track_activated(arb);
                if arb.demo {
                    arb.demo_last_accrual = Some(now);
                }
            }
            HedgeCheck::NotYet { reason } => {
                arb.validation_attempts += 1;
                arb.last_validation_error = Some(reason.clone());
                debug!(
                    token = %arb.token,
                    attempt = arb.validation_attempts,
                    reason,
                    "pending validation waiting for fills"
                );
            }
            HedgeCheck::Failed { reason } => {
                arb.validation_attempts += 1;
                arb.last_validation_error = Some(reason.clone());
                if arb.validation_attempts < self.config.pending_validation_max_attempts {
                    warn!(
                        token = %arb.token,
                        attempt = arb.validation_attempts,
                        reason,
                        "pending validation failed, retrying"
                    );
                    return;
                }
                error!(token = %arb.token, reason, "position validation failed, emergency closing");
                self.deps.metrics.incr(names::VALIDATION_FAILURES);
                self.deps.alerts.emit(
                    Alert::new(
                        AlertSeverity::Critical,
                        "Position validation failed",
                        format!("{}: {reason}", arb.token),
                    )
                    .with_tag("lifecycle")
                    .with_metadata("token", arb.token.clone()),
                );
                self.close_arbitrage(arb, &format!("validation failed: {reason}"))
                    .await;
            }
        }
    }

    /// Register an activated arbitrage with the risk manager, margin
    /// monitor, and reconciliation book.
    fn track_activated(&mut self, arb: &Arbitrage) {
        let now = Utc::now();
        let mut ids = Vec::with_capacity(2);
        for leg in [&arb.long, &arb.short] {
            let id = self.risk.add_position(PositionRecord {
                venue: leg.venue.clone(),
                subaccount: None,
                pair: leg.pair.clone(),
                notional: leg.filled_quote,
                leverage: Decimal::from(arb.leverage),
                side: leg.side,
                opened_at: now,
            });
            self.deps.margin.update_position_margin(PositionMarginInfo {
                position_id: id.clone(),
                venue: leg.venue.clone(),
                pair: leg.pair.clone(),
                side: leg.side,
                size: leg.filled_base,
                notional_value: leg.filled_quote,
                leverage: Decimal::from(arb.leverage),
                initial_margin: leg.filled_quote / Decimal::from(arb.leverage.max(1)),
                maintenance_margin: leg.filled_quote * dec!(0.005),
                unrealized_pnl: Decimal::ZERO,
                liquidation_price: None,
                current_mark_price: None,
                adl_indicator: None,
                timestamp: now,
            });
            ids.push(id);

            let entry_price = if leg.filled_base > Decimal::ZERO {
                leg.filled_quote / leg.filled_base
            } else {
                Decimal::ZERO
            };
            self.deps
                .book
                .lock()
                .expect("book lock")
                .expect_position(ReconPositionSnapshot {
                    key: PositionKey {
                        venue: leg.venue.clone(),
                        pair: leg.pair.clone(),
                        side: leg.side,
                    },
                    size: leg.filled_base,
                    notional_value: leg.filled_quote,
                    entry_price,
                    mark_price: None,
                    unrealized_pnl: Some(Decimal::ZERO),
                    leverage: Decimal::from(arb.leverage),
                    timestamp: now,
                });
        }
        self.risk_ids
            .insert(arb.token.clone(), (ids[0].clone(), ids[1].clone()));
    }

    /// Observe both legs' fills and validate the hedge. Live and demo
    /// arbitrages run the identical imbalance check; only the fill source
    /// (real vs simulated orders) differs behind the venue trait.
    async fn check_hedge(&mut self, arb: &mut Arbitrage) -> HedgeCheck {
        for leg_side in [PositionSide::Long, PositionSide::Short] {
            let (venue_id, pair, order_id) = {
                let leg = match leg_side {
                    PositionSide::Long => &arb.long,
                    PositionSide::Short => &arb.short,
                };
                let Some(order_id) = leg.order_id.clone() else {
                    return HedgeCheck::Failed {
                        reason: format!("{} leg has no order", leg.venue),
                    };
                };
                (leg.venue.clone(), leg.pair.clone(), order_id)
            };
            match self.observe_order(&venue_id, &pair, &order_id).await {
                Ok(state) => {
                    let leg = match leg_side {
                        PositionSide::Long => &mut arb.long,
                        PositionSide::Short => &mut arb.short,
                    };
                    leg.filled_base = state.filled_base;
                    leg.filled_quote = state.filled_quote;
                }
                Err(reason) => return HedgeCheck::NotYet { reason },
            }
        }

        let filled_long = arb.long.filled_quote.abs();
        let filled_short = arb.short.filled_quote.abs();
        if filled_long <= Decimal::ZERO {
            return HedgeCheck::NotYet {
                reason: format!("{} position not filled yet", arb.long.venue),
            };
        }
        if filled_short <= Decimal::ZERO {
            return HedgeCheck::NotYet {
                reason: format!("{} position not filled yet", arb.short.venue),
            };
        }

        let imbalance = imbalance_pct(filled_long, filled_short);
        if imbalance > self.config.max_position_imbalance_pct {
            return HedgeCheck::Failed {
                reason: format!(
                    "position imbalance {imbalance:.4} > {:.4} (long {filled_long}, short {filled_short})",
                    self.config.max_position_imbalance_pct
                ),
            };
        }
        if imbalance > self.config.max_position_imbalance_pct * dec!(0.5) {
            warn!(
                token = %arb.token,
                imbalance = %imbalance,
                "hedge imbalance approaching limit"
            );
        }
        HedgeCheck::Ok { imbalance }
    }

    // ------------------------------------------------------------------
    // Close confirmation
    // ------------------------------------------------------------------

    async fn confirm_closing(&mut self) {
        let tokens: Vec<String> = self
            .live
            .iter()
            .filter(|(_, arb)| arb.state() == ArbState::Closing)
            .map(|(token, _)| token.clone())
            .collect();

        for token in tokens {
            let Some(mut arb) = self.live.remove(&token) else {
                continue;
            };
            let done = self.process_closing(&mut arb).await;
            if done {
                let total_pnl = arb.executors_pnl() + arb.funding_payments_pnl();
                self.realized_pnl += total_pnl;
                arb.mark_closed();
                info!(
                    token = %token,
                    reason = arb.close_reason.as_deref().unwrap_or("closed"),
                    pnl = %total_pnl,
                    funding_payments = arb.funding_payment_count(),
                    "position fully closed"
                );
                self.deps.metrics.incr(names::POSITIONS_CLOSED);
                self.deps
                    .metrics
                    .set_gauge(names::REALIZED_PNL, self.realized_pnl);
                self.deps.alerts.emit(
                    Alert::new(
                        AlertSeverity::Info,
                        "Position closed",
                        format!(
                            "{token}: {} (pnl {total_pnl})",
                            arb.close_reason.as_deref().unwrap_or("closed")
                        ),
                    )
                    .with_tag("lifecycle")
                    .with_metadata("token", token.clone()),
                );

                let archive = self.archived.entry(token).or_default();
                archive.push(arb);
                while archive.len() > MAX_ARCHIVED_PER_TOKEN {
                    archive.remove(0);
                }
            } else {
                self.live.insert(token, arb);
            }
        }
    }

    /// Returns `true` when every leg is confirmed terminal.
    async fn process_closing(&mut self, arb: &mut Arbitrage) -> bool {
        let mut all_closed = true;
        for leg_side in [PositionSide::Long, PositionSide::Short] {
            let leg = match leg_side {
                PositionSide::Long => arb.long.clone(),
                PositionSide::Short => arb.short.clone(),
            };
            if !self.leg_closed(&leg).await {
                all_closed = false;
            } else if let Some(pnl) = self.leg_final_pnl(&leg).await {
                let leg = match leg_side {
                    PositionSide::Long => &mut arb.long,
                    PositionSide::Short => &mut arb.short,
                };
                leg.last_pnl = pnl;
            }
        }
        if all_closed {
            return true;
        }

        let now = Utc::now();
        let close_time = arb.close_time.unwrap_or(now);
        let timeout = self.config.close_validation_timeout_seconds as i64;
        if (now - close_time).num_seconds() > timeout {
            let alert_due = arb
                .last_close_alert
                .map_or(true, |last| (now - last).num_seconds() >= timeout);
            if alert_due {
                error!(
                    token = %arb.token,
                    seconds_since_close = (now - close_time).num_seconds(),
                    "close validation timeout, re-issuing exits"
                );
                self.deps.alerts.emit(
                    Alert::new(
                        AlertSeverity::High,
                        "Close timeout",
                        format!("{}: close unconfirmed, re-issuing exits", arb.token),
                    )
                    .with_tag("lifecycle")
                    .with_metadata("token", arb.token.clone()),
                );
                arb.last_close_alert = Some(now);
                self.reissue_exits(arb).await;
            }
        }
        false
    }

    async fn leg_closed(&self, leg: &Leg) -> bool {
        // A close order that reached a terminal state settles the leg.
        if let Some(close_id) = &leg.close_order_id {
            match self.observe_order(&leg.venue, &leg.pair, close_id).await {
                Ok(state) if state.is_terminal() => {}
                _ => return false,
            }
        }
        // Open order must not be live either.
        if let Some(order_id) = &leg.order_id {
            match self.observe_order(&leg.venue, &leg.pair, order_id).await {
                Ok(state) if state.is_terminal() => {}
                _ => return false,
            }
        }
        // And the venue must report the pair flat.
        let Some(venue) = self.venue(&leg.venue) else {
            return false;
        };
        match venue.get_position(&leg.pair).await {
            Ok(None) => true,
            Ok(Some(position)) => position.size <= Decimal::ZERO,
            Err(_) => false,
        }
    }

    /// Realized PnL for a closed leg from its open/close fills.
    async fn leg_final_pnl(&self, leg: &Leg) -> Option<Decimal> {
        let close_id = leg.close_order_id.as_ref()?;
        let close = self
            .observe_order(&leg.venue, &leg.pair, close_id)
            .await
            .ok()?;
        if close.filled_base <= Decimal::ZERO || leg.filled_base <= Decimal::ZERO {
            return None;
        }
        let entry_price = leg.filled_quote / leg.filled_base;
        let exit_price = close.filled_quote / close.filled_base;
        let pnl = match leg.side {
            PositionSide::Long => (exit_price - entry_price) * close.filled_base,
            PositionSide::Short => (entry_price - exit_price) * close.filled_base,
        };
        Some(pnl)
    }

    async fn reissue_exits(&mut self, arb: &mut Arbitrage) {
        for leg_side in [PositionSide::Long, PositionSide::Short] {
            let leg = match leg_side {
                PositionSide::Long => arb.long.clone(),
                PositionSide::Short => arb.short.clone(),
            };
            if self.leg_closed(&leg).await {
                continue;
            }
            if leg.filled_base > Decimal::ZERO {
                let request = OrderRequest {
                    pair: leg.pair.clone(),
                    side: OrderSide::opening(leg.side).opposite(),
                    order_type: OrderType::Market,
                    amount_base: leg.filled_base,
                    price: None,
                    reduce_only: true,
                };
                if let Ok(close_id) = self.place_order(&leg.venue, request).await {
                    let leg = match leg_side {
                        PositionSide::Long => &mut arb.long,
                        PositionSide::Short => &mut arb.short,
                    };
                    leg.close_order_id = Some(close_id);
                }
            } else if let Some(order_id) = &leg.order_id {
                self.cancel_order(&leg.venue, &leg.pair, order_id).await;
            }
        }
    }

    // ------------------------------------------------------------------
    // Active management
    // ------------------------------------------------------------------

    async fn manage_active(&mut self) {
        let tokens: Vec<String> = self
            .live
            .iter()
            .filter(|(_, arb)| arb.state() == ArbState::Active)
            .map(|(token, _)| token.clone())
            .collect();

        for token in tokens {
            let Some(mut arb) = self.live.remove(&token) else {
                continue;
            };
            self.process_active(&mut arb).await;
            self.live.insert(token, arb);
        }
    }

    async fn process_active(&mut self, arb: &mut Arbitrage) {
        // Continuous hedge validation; a breach feeds the hedge-deviation
        // breaker and, when configured, force-closes the position.
        if self.config.position_validation_enabled {
            match self.check_hedge(arb).await {
                HedgeCheck::Ok { .. } => {
                    self.deps
                        .gate
                        .breakers
                        .record_success(BreakerKind::HedgeDeviation);
                }
                HedgeCheck::NotYet { reason } => {
                    debug!(token = %arb.token, reason, "hedge observation unavailable this tick");
                }
                HedgeCheck::Failed { reason } => {
                    self.deps
                        .gate
                        .breakers
                        .record_failure(BreakerKind::HedgeDeviation);
                    if self.config.emergency_close_on_imbalance {
                        error!(token = %arb.token, reason, "EMERGENCY close: hedge imbalance");
                        self.deps.metrics.incr(names::EMERGENCY_CLOSES);
                        self.deps.alerts.emit(
                            Alert::new(
                                AlertSeverity::Critical,
                                "Hedge imbalance",
                                format!("{}: {reason}", arb.token),
                            )
                            .with_tag("risk")
                            .with_metadata("token", arb.token.clone()),
                        );
                        self.close_arbitrage(arb, &format!("EMERGENCY: {reason}")).await;
                        return;
                    }
                    warn!(token = %arb.token, reason, "hedge imbalance warning");
                }
            }
        }

        self.update_leg_pnl(arb).await;
        if arb.demo {
            self.accrue_demo_funding(arb);
        }

        let executors_pnl = arb.executors_pnl();
        let funding_pnl = arb.funding_payments_pnl();

        // Take profit on combined PnL as a fraction of notional.
        let take_profit_at = self.config.profitability_to_take_profit * arb.notional_quote;
        if executors_pnl + funding_pnl > take_profit_at {
            info!(
                token = %arb.token,
                executors_pnl = %executors_pnl,
                funding_pnl = %funding_pnl,
                threshold = %take_profit_at,
                "take profit reached"
            );
            self.close_arbitrage(arb, "take profit target reached").await;
            return;
        }

        // Funding-rate stop loss on the held direction; missing rates
        // skip the check rather than force a close.
        let long_rate = self.cached_rate_per_second(&arb.long.venue, &arb.token);
        let short_rate = self.cached_rate_per_second(&arb.short.venue, &arb.token);
        match (long_rate, short_rate) {
            (Some(long_rate), Some(short_rate)) => {
                let daily_diff = (short_rate - long_rate)
                    * Decimal::from(crate::edge::FUNDING_PROFITABILITY_INTERVAL_SECONDS);
                if daily_diff < self.config.funding_rate_diff_stop_loss {
                    info!(
                        token = %arb.token,
                        daily_diff = %daily_diff,
                        threshold = %self.config.funding_rate_diff_stop_loss,
                        "funding rate stop loss triggered"
                    );
                    self.close_arbitrage(arb, "funding rate stop loss triggered")
                        .await;
                    return;
                }
            }
            _ => {
                debug!(token = %arb.token, "funding rates unavailable, skipping stop-loss check");
            }
        }

        // Settlement-window forced close.
        let venues = arb.venues();
        let (must_close, reason) = self.deps.scheduler.should_close(
            &venues,
            arb.age_minutes(Utc::now()),
            self.config.min_position_hold_time_minutes as i64,
            Utc::now(),
        );
        if must_close {
            info!(token = %arb.token, reason, "settlement-window close");
            self.close_arbitrage(arb, &reason).await;
        }
    }

    async fn update_leg_pnl(&mut self, arb: &mut Arbitrage) {
        let risk_ids = self.risk_ids.get(&arb.token).cloned();
        for leg_side in [PositionSide::Long, PositionSide::Short] {
            let (venue_id, pair) = {
                let leg = match leg_side {
                    PositionSide::Long => &arb.long,
                    PositionSide::Short => &arb.short,
                };
                (leg.venue.clone(), leg.pair.clone())
            };
            let Some(venue) = self.venue(&venue_id) else {
                continue;
            };
            match venue.get_position(&pair).await {
                Ok(Some(position)) => {
                    let leg = match leg_side {
                        PositionSide::Long => &mut arb.long,
                        PositionSide::Short => &mut arb.short,
                    };
                    if let Some(pnl) = position.unrealized_pnl {
                        leg.last_pnl = pnl;
                    }
                    if let Some((long_id, short_id)) = &risk_ids {
                        let id = match leg_side {
                            PositionSide::Long => long_id,
                            PositionSide::Short => short_id,
                        };
                        self.deps.margin.update_position_margin(PositionMarginInfo {
                            position_id: id.clone(),
                            venue: venue_id.clone(),
                            pair: pair.clone(),
                            side: leg.side,
                            size: position.size,
                            notional_value: position.notional_quote,
                            leverage: position.leverage,
                            initial_margin: if position.leverage > Decimal::ZERO {
                                position.notional_quote / position.leverage
                            } else {
                                position.notional_quote
                            },
                            maintenance_margin: position.notional_quote * dec!(0.005),
                            unrealized_pnl: position.unrealized_pnl.unwrap_or(Decimal::ZERO),
                            liquidation_price: position.liquidation_price,
                            current_mark_price: position.mark_price,
                            adl_indicator: position.adl_indicator,
                            timestamp: Utc::now(),
                        });
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    self.note_venue_error(&venue_id, &e, "get_position");
                }
            }
        }
    }

    /// Analytic demo funding accrual:
    /// `funding_diff_per_second * dt * notional` for the held direction.
    fn accrue_demo_funding(&mut self, arb: &mut Arbitrage) {
        let now = Utc::now();
        let Some(last) = arb.demo_last_accrual else {
            arb.demo_last_accrual = Some(now);
            return;
        };
        let dt = (now - last).num_seconds();
        if dt <= 0 {
            return;
        }
        let (Some(long_rate), Some(short_rate)) = (
            self.cached_rate_per_second(&arb.long.venue, &arb.token),
            self.cached_rate_per_second(&arb.short.venue, &arb.token),
        ) else {
            arb.demo_last_accrual = Some(now);
            return;
        };
        let accrued = (short_rate - long_rate) * Decimal::from(dt) * arb.notional_quote;
        let total = arb.demo_accrued_funding_pnl.unwrap_or(Decimal::ZERO) + accrued;
        arb.demo_accrued_funding_pnl = Some(total);
        arb.demo_last_accrual = Some(now);
    }

    // ------------------------------------------------------------------
    // Opportunity scan
    // ------------------------------------------------------------------

    fn available_venues(&self) -> HashSet<VenueId> {
        let cap = self.config.max_positions_per_connector;
        if cap == 0 {
            return self.deps.venues.keys().cloned().collect();
        }
        let mut counts: HashMap<&VenueId, u32> = HashMap::new();
        for arb in self.live.values().filter(|a| a.is_live()) {
            *counts.entry(&arb.long.venue).or_default() += 1;
            *counts.entry(&arb.short.venue).or_default() += 1;
        }
        self.deps
            .venues
            .keys()
            .filter(|venue| counts.get(venue).copied().unwrap_or(0) < cap)
            .cloned()
            .collect()
    }

    async fn scan_opportunities(&mut self) {
        let (can_trade, reason) = self.deps.gate.can_trade();
        if !can_trade {
            debug!(reason, "scan skipped: trading gated");
            return;
        }

        let mut available = self.available_venues();
        if available.len() < 2 {
            return;
        }

        for token in self.config.tokens.clone() {
            if self.live.get(&token).is_some_and(|arb| arb.is_live()) {
                continue;
            }
            self.deps.metrics.incr(names::OPPORTUNITIES_EVALUATED);
            match self.evaluate_token(&token, &available).await {
                Some(arb) => {
                    self.live.insert(token, arb);
                    available = self.available_venues();
                    if available.len() < 2 {
                        break;
                    }
                }
                None => {
                    self.deps.metrics.incr(names::OPPORTUNITIES_SKIPPED);
                }
            }
        }
    }

    /// Run the full gate ladder for one token; on success the legs are
    /// already submitted and a PENDING arbitrage is returned.
    async fn evaluate_token(
        &mut self,
        token: &str,
        available: &HashSet<VenueId>,
    ) -> Option<Arbitrage> {
        let report = self.funding_report(token, available);
        if report.len() < 2 {
            return None;
        }

        let combo = self.deps.edge.most_profitable_combination(&report)?;
        if combo.daily_rate_diff < self.config.min_funding_rate_diff {
            return None;
        }
        let VenueCombination {
            long_venue,
            short_venue,
            ..
        } = combo;

        let notional = self.position_size(&long_venue, &short_venue).await;
        if notional <= Decimal::ZERO {
            debug!(token, "skipping: position size is zero");
            return None;
        }

        let long_info = report.get(&long_venue)?.clone();
        let short_info = report.get(&short_venue)?.clone();
        let pair = long_info.pair.clone();

        // Risk-gated sizing: hard violations block, warnings shrink.
        let mut multiplier = Decimal::ONE;
        for (venue, leverage) in [
            (&long_venue, Decimal::from(self.config.leverage)),
            (&short_venue, Decimal::from(self.config.leverage)),
        ] {
            let check =
                self.risk
                    .check_position_limits(venue, None, &pair, notional, leverage);
            if !check.allow {
                warn!(token, venue = %venue, messages = ?check.messages, "skipping: risk limits");
                return None;
            }
            multiplier = multiplier.min(check.level.size_multiplier());
        }
        let notional = notional * multiplier;
        if notional <= Decimal::ZERO {
            return None;
        }

        // Gate 1: sufficient balance on both legs.
        if !self
            .validate_sufficient_balance(&long_venue, &short_venue, notional)
            .await
        {
            debug!(token, "skipping: insufficient balance");
            return None;
        }

        // Gate 2: settlement windows.
        let venues = [long_venue.clone(), short_venue.clone()];
        let (open_ok, open_reason) = self.deps.scheduler.should_open(
            &venues,
            self.config.min_position_hold_time_minutes as i64,
            Utc::now(),
        );
        if !open_ok {
            debug!(token, reason = open_reason, "skipping: settlement window");
            return None;
        }
        for info in [&long_info, &short_info] {
            if let Some(next) = info.next_settlement_utc {
                let seconds = (next - Utc::now()).num_seconds();
                if seconds >= 0 && (seconds as u64) < self.config.min_time_to_next_funding_seconds {
                    debug!(
                        token,
                        venue = %info.venue,
                        seconds,
                        "skipping: too close to funding settlement"
                    );
                    return None;
                }
            }
        }

        // Gate 3: decomposed edge.
        let funding_period_hours = Decimal::from(
            long_info.interval_seconds.min(short_info.interval_seconds),
        ) / dec!(3600);
        let decomposition = self.deps.edge.calculate_edge(&EdgeParams {
            pair: pair.clone(),
            long_venue: long_venue.clone(),
            short_venue: short_venue.clone(),
            funding_rate_long: long_info.rate,
            funding_rate_short: short_info.rate,
            notional,
            taker_fees: self.config.taker_fees.clone(),
            borrow_rates: self.config.borrow_rates.clone(),
            slippage_estimates: self.config.slippage_estimates.clone(),
            leverage_long: Decimal::from(self.config.leverage),
            leverage_short: Decimal::from(self.config.leverage),
            funding_period_hours,
        });
        if !decomposition.is_profitable {
            debug!(
                token,
                total_edge = %decomposition.total_edge,
                "skipping: edge below minimum"
            );
            return None;
        }
        if self.config.trade_profitability_condition_to_enter {
            let profitability = self
                .trade_profitability_after_fees(token, &long_venue, &short_venue, notional)
                .await?;
            if profitability < Decimal::ZERO {
                debug!(token, profitability = %profitability, "skipping: negative trade profitability");
                return None;
            }
        }

        // Gate 4: slippage vs the cached marks.
        let long_pair = self.pair_for(&self.venue(&long_venue)?, token);
        let short_pair = self.pair_for(&self.venue(&short_venue)?, token);
        let long_mid = self.safe_mid_price(&long_venue, &long_pair).await?;
        let short_mid = self.safe_mid_price(&short_venue, &short_pair).await?;
        let long_expected = long_info.mark_price.or(long_info.index_price)?;
        let short_expected = short_info.mark_price.or(short_info.index_price)?;
        if long_expected <= Decimal::ZERO || short_expected <= Decimal::ZERO {
            return None;
        }
        let slippage_long = (long_mid - long_expected).abs() / long_expected;
        let slippage_short = (short_mid - short_expected).abs() / short_expected;
        let worst = slippage_long.max(slippage_short);
        if worst > self.config.max_slippage_pct {
            debug!(token, slippage = %worst, "skipping: slippage too high");
            return None;
        }

        // Gate 5: order book depth on the side each venue must consume.
        if self.config.check_order_book_depth_enabled {
            if !self
                .check_depth(&long_venue, &long_pair, notional, long_mid, BookSide::Asks)
                .await
            {
                debug!(token, venue = %long_venue, "skipping: insufficient ask depth");
                return None;
            }
            if !self
                .check_depth(&short_venue, &short_pair, notional, short_mid, BookSide::Bids)
                .await
            {
                debug!(token, venue = %short_venue, "skipping: insufficient bid depth");
                return None;
            }
            for (venue, pair) in [(&long_venue, &long_pair), (&short_venue, &short_pair)] {
                let (ok, reason, _) = self.risk.check_liquidity_risk(venue, pair, notional);
                if !ok {
                    debug!(token, venue = %venue, reason, "skipping: liquidity risk");
                    return None;
                }
            }
        }

        // All gates passed: submit both legs at market.
        info!(
            token,
            long = %long_venue,
            short = %short_venue,
            notional = %notional,
            total_edge = %decomposition.total_edge,
            "entering delta-neutral pair"
        );
        let long_amount = notional / long_mid;
        let short_amount = notional / short_mid;

        let long_order = self
            .place_order(
                &long_venue,
                OrderRequest {
                    pair: long_pair.clone(),
                    side: OrderSide::Buy,
                    order_type: OrderType::Market,
                    amount_base: long_amount,
                    price: None,
                    reduce_only: false,
                },
            )
            .await;
        let long_order_id = match long_order {
            Ok(id) => id,
            Err(e) => {
                error!(token, error = %e, "long leg failed");
                return None;
            }
        };

        let short_order = self
            .place_order(
                &short_venue,
                OrderRequest {
                    pair: short_pair.clone(),
                    side: OrderSide::Sell,
                    order_type: OrderType::Market,
                    amount_base: short_amount,
                    price: None,
                    reduce_only: false,
                },
            )
            .await;
        let short_order_id = match short_order {
            Ok(id) => id,
            Err(e) => {
                // Unwind the long leg so no naked exposure survives.
                error!(token, error = %e, "short leg failed, unwinding long leg");
                let unwind = OrderRequest {
                    pair: long_pair.clone(),
                    side: OrderSide::Sell,
                    order_type: OrderType::Market,
                    amount_base: long_amount,
                    price: None,
                    reduce_only: true,
                };
                if let Err(unwind_err) = self.place_order(&long_venue, unwind).await {
                    error!(token, error = %unwind_err, "failed to unwind long leg");
                    self.deps.alerts.emit(
                        Alert::new(
                            AlertSeverity::Critical,
                            "Unwind failed",
                            format!("{token}: naked long on {long_venue}"),
                        )
                        .with_tag("execution"),
                    );
                }
                return None;
            }
        };

        let mut long_leg = Leg::new(long_venue, long_pair, PositionSide::Long);
        long_leg.order_id = Some(long_order_id);
        let mut short_leg = Leg::new(short_venue, short_pair, PositionSide::Short);
        short_leg.order_id = Some(short_order_id);

        Some(Arbitrage::new(
            token,
            long_leg,
            short_leg,
            notional,
            self.config.leverage,
            self.config.demo.demo_mode,
        ))
    }

    /// Both venues need `notional / leverage` margin plus a 10% buffer.
    async fn validate_sufficient_balance(
        &self,
        long_venue: &VenueId,
        short_venue: &VenueId,
        notional: Decimal,
    ) -> bool {
        let required =
            notional / Decimal::from(self.config.leverage.max(1)) * BALANCE_BUFFER;
        for venue_id in [long_venue, short_venue] {
            let Some(venue) = self.venue(venue_id) else {
                return false;
            };
            let asset = venue.quote_asset().to_string();
            match self.safe_balance(venue_id, &asset).await {
                Some(balance) if balance >= required => {}
                Some(balance) => {
                    debug!(venue = %venue_id, %balance, %required, "insufficient balance");
                    return false;
                }
                None => return false,
            }
        }
        true
    }

    /// Price-in both entries and the eventual exits at market, net of
    /// taker fees on all four fills.
    async fn trade_profitability_after_fees(
        &self,
        token: &str,
        long_venue: &VenueId,
        short_venue: &VenueId,
        notional: Decimal,
    ) -> Option<Decimal> {
        let long = self.venue(long_venue)?;
        let short = self.venue(short_venue)?;
        let long_pair = self.pair_for(&long, token);
        let short_pair = self.pair_for(&short, token);

        let long_price = long
            .get_price_for_quote_volume(&long_pair, notional, true)
            .await
            .ok()?;
        let short_price = short
            .get_price_for_quote_volume(&short_pair, notional, false)
            .await
            .ok()?;
        if long_price <= Decimal::ZERO || short_price <= Decimal::ZERO {
            return None;
        }

        let long_amount = notional / long_price;
        let short_amount = notional / short_price;
        let fees = self
            .safe_fee(
                long_venue,
                &long_pair,
                OrderSide::Buy,
                PositionAction::Open,
                long_amount,
                long_price,
            )
            .await
            + self
                .safe_fee(
                    long_venue,
                    &long_pair,
                    OrderSide::Sell,
                    PositionAction::Close,
                    long_amount,
                    long_price,
                )
                .await
            + self
                .safe_fee(
                    short_venue,
                    &short_pair,
                    OrderSide::Sell,
                    PositionAction::Open,
                    short_amount,
                    short_price,
                )
                .await
            + self
                .safe_fee(
                    short_venue,
                    &short_pair,
                    OrderSide::Buy,
                    PositionAction::Close,
                    short_amount,
                    short_price,
                )
                .await;

        // Long leg buys low on venue 1, short sells high on venue 2.
        let trade_pnl_pct = (short_price - long_price) / long_price;
        Some(trade_pnl_pct - fees)
    }

    async fn check_depth(
        &mut self,
        venue_id: &VenueId,
        pair: &TradingPair,
        notional: Decimal,
        mid: Decimal,
        side: BookSide,
    ) -> bool {
        let Some(venue) = self.venue(venue_id) else {
            return false;
        };
        if !self
            .deps
            .gate
            .rate_limiter
            .acquire(venue_id, 1, false, READ_ACQUIRE_TIMEOUT)
            .await
        {
            return false;
        }
        let book = match venue.get_order_book(pair).await {
            Ok(book) => book,
            Err(e) => {
                self.note_venue_error(venue_id, &e, "get_order_book");
                return false;
            }
        };
        if mid <= Decimal::ZERO {
            return false;
        }

        // Feed the risk manager's liquidity cache while the book is hot.
        let depth_quote = |levels: &[crate::venue::BookLevel], band: Decimal| -> Decimal {
            levels
                .iter()
                .filter(|l| (l.price - mid).abs() / mid <= band)
                .map(|l| l.price * l.amount)
                .sum()
        };
        self.risk.update_liquidity(LiquidityMetrics {
            venue: venue_id.clone(),
            pair: pair.clone(),
            bid_depth_1pct: depth_quote(&book.bids, dec!(0.01)),
            ask_depth_1pct: depth_quote(&book.asks, dec!(0.01)),
            bid_depth_5pct: depth_quote(&book.bids, dec!(0.05)),
            ask_depth_5pct: depth_quote(&book.asks, dec!(0.05)),
            avg_spread_bps: book
                .mid()
                .map(|m| {
                    let best_bid = book.bids.first().map(|l| l.price).unwrap_or(m);
                    let best_ask = book.asks.first().map(|l| l.price).unwrap_or(m);
                    (best_ask - best_bid) / m * dec!(10000)
                })
                .unwrap_or(Decimal::ZERO),
            timestamp: Utc::now(),
        });

        let Some(depth) = book.depth_base(side, DEPTH_LEVELS) else {
            return false;
        };
        let required_base = notional / mid;
        depth >= required_base * self.config.min_order_book_depth_multiplier
    }

    /// Position size in quote currency, from either the fixed size or
    /// the initial-balance percentage budget, capped by what balances and
    /// leverage can carry.
    async fn position_size(&mut self, long_venue: &VenueId, short_venue: &VenueId) -> Decimal {
        let leverage = Decimal::from(self.config.leverage.max(1));

        let pct = self.config.position_size_quote_pct;
        if pct > Decimal::ZERO {
            let per_position_pct = if self.config.max_positions_per_connector > 0 {
                pct / Decimal::from(self.config.max_positions_per_connector)
            } else {
                pct
            };
            let mut budget: Option<Decimal> = None;
            for venue_id in [long_venue, short_venue] {
                let Some(initial) = self.initial_balance(venue_id).await else {
                    warn!(venue = %venue_id, "initial balance unavailable for sizing");
                    return Decimal::ZERO;
                };
                let cap = initial * leverage * per_position_pct;
                budget = Some(budget.map_or(cap, |b| b.min(cap)));
            }
            let budget = budget.unwrap_or(Decimal::ZERO);
            if self.config.position_size_quote > Decimal::ZERO {
                return budget.min(self.config.position_size_quote);
            }
            return budget;
        }

        let mut size = self.config.position_size_quote;
        for venue_id in [long_venue, short_venue] {
            let Some(venue) = self.venue(venue_id) else {
                return Decimal::ZERO;
            };
            let asset = venue.quote_asset().to_string();
            let Some(balance) = self.safe_balance(venue_id, &asset).await else {
                return Decimal::ZERO;
            };
            size = size.min(balance * leverage * BALANCE_HEADROOM);
        }
        size
    }

    async fn initial_balance(&mut self, venue_id: &VenueId) -> Option<Decimal> {
        let asset = self.venue(venue_id)?.quote_asset().to_string();
        let key = (venue_id.clone(), asset.clone());
        if let Some(balance) = self.initial_balances.get(&key) {
            return Some(*balance);
        }
        let balance = self.safe_balance(venue_id, &asset).await?;
        self.initial_balances.insert(key, balance);
        Some(balance)
    }

    // ------------------------------------------------------------------
    // Statistics & status
    // ------------------------------------------------------------------

    fn counts(&self) -> (usize, usize, usize) {
        let mut active = 0;
        let mut pending = 0;
        let mut closing = 0;
        for arb in self.live.values() {
            match arb.state() {
                ArbState::Active => active += 1,
                ArbState::Pending => pending += 1,
                ArbState::Closing => closing += 1,
                ArbState::Closed => {}
            }
        }
        (active, pending, closing)
    }

    fn unrealized_pnl(&self) -> Decimal {
        self.live
            .values()
            .filter(|a| a.state() == ArbState::Active)
            .map(|a| a.executors_pnl() + a.funding_payments_pnl())
            .sum()
    }

    fn publish_status(&self) {
        let (active, pending, closing) = self.counts();
        let unrealized = self.unrealized_pnl();
        self.deps
            .metrics
            .set_gauge(names::UNREALIZED_PNL, unrealized);
        self.deps.metrics.set_gauge(
            names::TRADING_READY,
            if self.deps.gate.can_trade().0 {
                Decimal::ONE
            } else {
                Decimal::ZERO
            },
        );
        self.status.store(EngineStatusSnapshot {
            active,
            pending,
            closing,
            archived: self.archived.values().map(Vec::len).sum(),
            unrealized_pnl: unrealized,
            realized_pnl: self.realized_pnl,
            ticks: self.ticks,
            last_tick: Some(Utc::now()),
        });
    }

    fn maybe_log_statistics(&mut self) {
        let now = Utc::now();
        let due = self.last_stats_log.map_or(false, |last| {
            (now - last).num_seconds() >= self.config.stats_interval_seconds as i64
        });
        if self.last_stats_log.is_none() {
            self.last_stats_log = Some(now);
            return;
        }
        if !due {
            return;
        }
        self.last_stats_log = Some(now);

        let (active, pending, closing) = self.counts();
        let funding_payments: usize = self
            .live
            .values()
            .map(|a| a.funding_payment_count())
            .sum();
        info!(
            active,
            pending,
            closing,
            unrealized_pnl = %self.unrealized_pnl(),
            realized_pnl = %self.realized_pnl,
            funding_payments,
            errors = self.deps.metrics.counter(names::ERRORS),
            "periodic statistics"
        );
        for snapshot in self.deps.gate.rate_limiter.snapshots() {
            if snapshot.utilization > 0.0 {
                info!(
                    venue = %snapshot.venue,
                    utilization = format!("{:.0}%", snapshot.utilization * 100.0),
                    tokens = format!("{:.1}/{:.0}", snapshot.tokens_available, snapshot.capacity),
                    "rate limiter utilization"
                );
            }
        }
    }

    // ------------------------------------------------------------------
    // Test support
    // ------------------------------------------------------------------

    #[cfg(test)]
    pub(crate) fn insert_arbitrage_for_test(&mut self, arb: Arbitrage) {
        self.live.insert(arb.token.clone(), arb);
    }

    #[cfg(test)]
    pub(crate) fn arbitrage_state(&self, token: &str) -> Option<ArbState> {
        self.live.get(token).map(|a| a.state())
    }

    #[cfg(test)]
    pub(crate) fn arbitrage(&self, token: &str) -> Option<&Arbitrage> {
        self.live.get(token)
    }

    #[cfg(test)]
    pub(crate) fn archived_for(&self, token: &str) -> usize {
        self.archived.get(token).map(Vec::len).unwrap_or(0)
    }
}

enum HedgeCheck {
    Ok { imbalance: Decimal },
    NotYet { reason: String },
    Failed { reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::test_support::CapturingAlertSink;
    use crate::config::{DemoConfig, ReliabilityConfig};
    use crate::reliability::{
        BreakerThresholds, CircuitBreakerSet, NullResourceSampler, RateLimiter, TimeSyncMonitor,
        TradingReadiness,
    };
    use crate::venue::{SimVenue, SimVenueConfig};
    use rust_decimal_macros::dec;

    struct Harness {
        engine: LifecycleEngine,
        sim_a: Arc<SimVenue>,
        sim_b: Arc<SimVenue>,
        alerts: Arc<CapturingAlertSink>,
    }

    fn base_config() -> EngineConfig {
        let mut config = EngineConfig {
            venues: vec!["sim_a".to_string(), "sim_b".to_string()],
            tokens: vec!["BTC".to_string()],
            leverage: 1,
            min_funding_rate_diff: dec!(0.0003),
            min_edge_required: dec!(0.0005),
            profitability_to_take_profit: dec!(0.01),
            max_slippage_pct: dec!(0.005),
            check_order_book_depth_enabled: false,
            min_time_to_next_funding_seconds: 300,
            pending_validation_timeout_seconds: 10,
            position_size_quote: dec!(10000),
            min_position_hold_time_minutes: 0,
            demo: DemoConfig {
                demo_mode: false,
                ..Default::default()
            },
            ..Default::default()
        };
        config
            .taker_fees
            .insert("sim_a".to_string(), dec!(0.0005));
        config
            .taker_fees
            .insert("sim_b".to_string(), dec!(0.0005));
        config
            .slippage_estimates
            .insert("sim_a".to_string(), dec!(0.0003));
        config
            .slippage_estimates
            .insert("sim_b".to_string(), dec!(0.0003));
        config
    }

    fn harness_with(config: EngineConfig, thresholds: BreakerThresholds) -> Harness {
        let sim_config = SimVenueConfig {
            initial_balance: dec!(50000),
            taker_fee: dec!(0.0005),
            fill_delay: Duration::ZERO,
            close_delay: Duration::ZERO,
        };
        let sim_a = Arc::new(SimVenue::new(VenueId::from("sim_a"), sim_config.clone()));
        let sim_b = Arc::new(SimVenue::new(VenueId::from("sim_b"), sim_config));

        let alerts = Arc::new(CapturingAlertSink::default());
        let reliability = ReliabilityConfig::default();
        let readiness = Arc::new(TradingReadiness::new(
            reliability.connection_timeout_seconds,
            Arc::new(NullResourceSampler),
        ));
        readiness.run_all_checks();
        let gate = Arc::new(ReliabilityGate::new(
            Arc::new(TimeSyncMonitor::new(&reliability, alerts.clone())),
            Arc::new(CircuitBreakerSet::new(thresholds)),
            readiness,
            Arc::new(RateLimiter::new(&reliability)),
        ));

        let mut venues: HashMap<VenueId, Arc<dyn Venue>> = HashMap::new();
        venues.insert(VenueId::from("sim_a"), sim_a.clone());
        venues.insert(VenueId::from("sim_b"), sim_b.clone());

        let deps = EngineDeps {
            venues,
            gate,
            scheduler: Arc::new(SettlementScheduler::for_venues([
                "sim_a", "sim_b",
            ])),
            edge: EdgeCalculator::new(config.min_edge_required, config.settlement_buffer_rate),
            margin: Arc::new(MarginMonitor::new(
                dec!(0.2),
                dec!(5),
                false,
                Duration::from_secs(30),
            )),
            book: Arc::new(Mutex::new(PositionBook::default())),
            alerts: alerts.clone(),
            metrics: Arc::new(MetricsRegistry::new()),
        };

        Harness {
            engine: LifecycleEngine::new(config, deps),
            sim_a,
            sim_b,
            alerts,
        }
    }

    fn harness() -> Harness {
        harness_with(base_config(), BreakerThresholds::default())
    }

    fn pair() -> TradingPair {
        TradingPair::new("BTC", "USDT")
    }

    async fn seed_market(h: &Harness, rate_a: Decimal, rate_b: Decimal) {
        let next = Utc::now() + chrono::Duration::hours(4);
        h.sim_a.set_price(pair(), dec!(10000)).await;
        h.sim_b.set_price(pair(), dec!(10000)).await;
        h.sim_a.set_funding(pair(), rate_a, Some(next)).await;
        h.sim_b.set_funding(pair(), rate_b, Some(next)).await;
    }

    #[tokio::test]
    async fn test_unprofitable_spread_is_skipped() {
        let mut h = harness();
        // funding diff 0.0009 -> edge -18, below minimum.
        seed_market(&h, dec!(0.0001), dec!(0.0010)).await;
        h.engine.tick().await;
        assert!(h.engine.arbitrage("BTC").is_none());
        assert_eq!(
            h.engine.deps.metrics.counter(names::OPPORTUNITIES_SKIPPED),
            1
        );
    }

    #[tokio::test]
    async fn test_happy_path_open_validate_take_profit_close() {
        let mut h = harness();
        // Tick T1: profitable spread opens a PENDING pair.
        seed_market(&h, dec!(0.0001), dec!(0.0050)).await;
        h.engine.tick().await;
        assert_eq!(h.engine.arbitrage_state("BTC"), Some(ArbState::Pending));
        let arb = h.engine.arbitrage("BTC").unwrap();
        assert_eq!(arb.long.venue, VenueId::from("sim_a"));
        assert_eq!(arb.short.venue, VenueId::from("sim_b"));

        // Tick T2: instant fills validate into ACTIVE.
        h.engine.tick().await;
        assert_eq!(h.engine.arbitrage_state("BTC"), Some(ArbState::Active));
        assert!(h.alerts.contains_title("Position opened"));
        let arb = h.engine.arbitrage("BTC").unwrap();
        assert_eq!(arb.long.filled_quote, dec!(10000));
        assert_eq!(arb.short.filled_quote, dec!(10000));

        // Tick T3: long venue rallies 1.2% -> +120 on the long leg only,
        // clearing the 1%-of-notional take-profit bar.
        h.sim_a.set_price(pair(), dec!(10120)).await;
        h.engine.tick().await;
        assert_eq!(h.engine.arbitrage_state("BTC"), Some(ArbState::Closing));
        let arb = h.engine.arbitrage("BTC").unwrap();
        assert_eq!(
            arb.close_reason.as_deref(),
            Some("take profit target reached")
        );

        // Tick T4: close orders fill; the arbitrage is archived and
        // leaves the live table. The spread is narrowed first so the
        // same tick's scan does not immediately re-enter.
        seed_market(&h, dec!(0.0001), dec!(0.0010)).await;
        h.engine.tick().await;
        assert_eq!(h.engine.arbitrage_state("BTC"), None);
        assert_eq!(h.engine.archived_for("BTC"), 1);
        assert!(h.alerts.contains_title("Position closed"));
        assert!(h.engine.realized_pnl > dec!(100));
    }

    #[tokio::test]
    async fn test_only_one_live_arbitrage_per_token() {
        let mut h = harness();
        seed_market(&h, dec!(0.0001), dec!(0.0050)).await;
        h.engine.tick().await;
        h.engine.tick().await;
        assert_eq!(h.engine.arbitrage_state("BTC"), Some(ArbState::Active));
        // Further ticks with the spread still wide must not open another.
        h.engine.tick().await;
        assert_eq!(
            h.engine.deps.metrics.counter(names::POSITIONS_OPENED),
            1
        );
    }

    #[tokio::test]
    async fn test_pending_timeout_forces_close() {
        let mut config = base_config();
        config.pending_validation_timeout_seconds = 1;
        let mut h = harness_with(config, BreakerThresholds::default());
        seed_market(&h, dec!(0.0001), dec!(0.0050)).await;

        // Long leg fills instantly; the short venue never fills.
        h.sim_b.set_fail_orders(false);
        h.engine.tick().await;
        assert_eq!(h.engine.arbitrage_state("BTC"), Some(ArbState::Pending));

        // Strip the short fill by replacing its order with one that can
        // never fill: simulate by pointing the leg at an unknown order.
        // The venue then reports it unavailable and validation waits
        // until the timeout trips.
        {
            let arb = h.engine.live.get_mut("BTC").unwrap();
            arb.short.order_id = Some(OrderId::new("missing"));
        }
        sleep(Duration::from_millis(2200)).await;
        h.engine.tick().await;
        let state = h.engine.arbitrage_state("BTC");
        assert_eq!(state, Some(ArbState::Closing));
        assert!(h.alerts.contains_title("Pending position timeout"));
        assert_eq!(
            h.engine.deps.metrics.counter(names::PENDING_TIMEOUTS),
            1
        );
    }

    #[tokio::test]
    async fn test_hedge_imbalance_trips_breaker_and_kill_switch() {
        let mut h = harness_with(
            base_config(),
            BreakerThresholds {
                hedge_deviation: 1,
                ..Default::default()
            },
        );
        seed_market(&h, dec!(0.0001), dec!(0.0050)).await;
        h.engine.tick().await;
        h.engine.tick().await;
        assert_eq!(h.engine.arbitrage_state("BTC"), Some(ArbState::Active));

        // Force a 20% imbalance by shrinking the short leg's recorded
        // fill; the observation path re-reads it, so stub the order to a
        // smaller one on the venue.
        let small_short = h
            .sim_b
            .place_order(&OrderRequest {
                pair: pair(),
                side: OrderSide::Sell,
                order_type: OrderType::Market,
                amount_base: dec!(0.8),
                price: None,
                reduce_only: false,
            })
            .await
            .unwrap();
        {
            let arb = h.engine.live.get_mut("BTC").unwrap();
            arb.short.order_id = Some(small_short);
        }

        h.engine.tick().await;
        assert_eq!(h.engine.arbitrage_state("BTC"), Some(ArbState::Closing));
        assert!(h.alerts.contains_title("Hedge imbalance"));
        assert!(h.engine.deps.gate.breakers.kill_switch_active());

        // With the kill switch on, no new arbitrage may be created.
        h.engine.tick().await; // confirms close
        let mut waited = 0;
        while h.engine.arbitrage_state("BTC") == Some(ArbState::Closing) && waited < 5 {
            h.engine.tick().await;
            waited += 1;
        }
        let before = h.engine.deps.metrics.counter(names::POSITIONS_OPENED);
        h.engine.tick().await;
        assert_eq!(
            h.engine.deps.metrics.counter(names::POSITIONS_OPENED),
            before
        );
    }

    #[tokio::test]
    async fn test_funding_stop_loss_closes_position() {
        let mut config = base_config();
        config.funding_rate_diff_stop_loss = dec!(-0.001);
        let mut h = harness_with(config, BreakerThresholds::default());
        seed_market(&h, dec!(0.0001), dec!(0.0050)).await;
        h.engine.tick().await;
        h.engine.tick().await;
        assert_eq!(h.engine.arbitrage_state("BTC"), Some(ArbState::Active));

        // Funding flips: the held direction now pays heavily.
        seed_market(&h, dec!(0.0050), dec!(0.0001)).await;
        h.engine.tick().await;
        assert_eq!(h.engine.arbitrage_state("BTC"), Some(ArbState::Closing));
        let arb = h.engine.arbitrage("BTC").unwrap();
        assert_eq!(
            arb.close_reason.as_deref(),
            Some("funding rate stop loss triggered")
        );
    }

    #[tokio::test]
    async fn test_missing_funding_rates_skip_stop_loss() {
        let mut h = harness();
        seed_market(&h, dec!(0.0001), dec!(0.0050)).await;
        h.engine.tick().await;
        h.engine.tick().await;
        assert_eq!(h.engine.arbitrage_state("BTC"), Some(ArbState::Active));

        // Drop the cache: rates unavailable must not force a close.
        h.engine.funding_cache.clear();
        // Prevent refresh from repopulating by clearing sim rates is not
        // possible, so clear after refresh inside a manual sequence.
        h.engine.drain_events();
        h.engine.funding_cache.clear();
        h.engine.manage_active().await;
        assert_eq!(h.engine.arbitrage_state("BTC"), Some(ArbState::Active));
    }

    #[tokio::test]
    async fn test_scan_requires_two_available_venues() {
        let mut config = base_config();
        config.max_positions_per_connector = 1;
        let mut h = harness_with(config, BreakerThresholds::default());
        seed_market(&h, dec!(0.0001), dec!(0.0050)).await;
        h.engine.tick().await;
        assert!(h.engine.arbitrage("BTC").is_some());
        // Both venues are at their cap; nothing else can open.
        assert!(h.engine.available_venues().is_empty());
    }

    #[tokio::test]
    async fn test_balance_gate_blocks_entry() {
        let mut h = harness();
        seed_market(&h, dec!(0.0001), dec!(0.0050)).await;
        // Drain the long venue's balance below notional/leverage * 1.1.
        h.sim_a.set_balance(dec!(500)).await;
        h.engine.tick().await;
        assert!(h.engine.arbitrage("BTC").is_none());
    }

    #[tokio::test]
    async fn test_depth_gate_blocks_thin_books() {
        let mut config = base_config();
        config.check_order_book_depth_enabled = true;
        let mut h = harness_with(config, BreakerThresholds::default());
        seed_market(&h, dec!(0.0001), dec!(0.0050)).await;
        // Books exist but are far too thin for 3x the required base.
        for sim in [&h.sim_a, &h.sim_b] {
            sim.set_order_book(crate::venue::OrderBookSnapshot {
                venue: sim.id().clone(),
                pair: pair(),
                bids: vec![crate::venue::BookLevel {
                    price: dec!(9999),
                    amount: dec!(0.01),
                }],
                asks: vec![crate::venue::BookLevel {
                    price: dec!(10001),
                    amount: dec!(0.01),
                }],
            })
            .await;
        }
        h.engine.tick().await;
        assert!(h.engine.arbitrage("BTC").is_none());
    }

    #[tokio::test]
    async fn test_demo_funding_accrues_analytically() {
        let mut config = base_config();
        config.demo.demo_mode = true;
        let mut h = harness_with(config, BreakerThresholds::default());
        seed_market(&h, dec!(0.0001), dec!(0.0050)).await;
        h.engine.tick().await;
        h.engine.tick().await;
        assert_eq!(h.engine.arbitrage_state("BTC"), Some(ArbState::Active));
        let arb = h.engine.live.get_mut("BTC").unwrap();
        assert!(arb.demo);
        // Backdate the accrual clock one hour and accrue.
        arb.demo_last_accrual = Some(Utc::now() - chrono::Duration::hours(1));
        let long = arb.long.venue.clone();
        let short = arb.short.venue.clone();
        let long_rate = h.engine.cached_rate_per_second(&long, "BTC").unwrap();
        let short_rate = h.engine.cached_rate_per_second(&short, "BTC").unwrap();
        let mut arb = h.engine.live.remove("BTC").unwrap();
        h.engine.accrue_demo_funding(&mut arb);
        let accrued = arb.demo_accrued_funding_pnl.unwrap();
        let expected = (short_rate - long_rate) * dec!(3600) * dec!(10000);
        // One-second scheduling slop allowed.
        assert!((accrued - expected).abs() <= (short_rate - long_rate) * dec!(2) * dec!(10000));
        assert!(accrued > Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_shutdown_transitions_live_positions_to_closing() {
        let mut h = harness();
        seed_market(&h, dec!(0.0001), dec!(0.0050)).await;
        h.engine.tick().await;
        h.engine.tick().await;
        assert_eq!(h.engine.arbitrage_state("BTC"), Some(ArbState::Active));

        h.engine.shutdown().await;
        let state = h.engine.arbitrage_state("BTC");
        assert!(matches!(state, Some(ArbState::Closed) | None));
        if let Some(arb) = h
            .engine
            .archived
            .get("BTC")
            .and_then(|archive| archive.last())
        {
            assert_eq!(arb.close_reason.as_deref(), Some("strategy stopping"));
        } else {
            let arb = h.engine.arbitrage("BTC").unwrap();
            assert_eq!(arb.close_reason.as_deref(), Some("strategy stopping"));
        }
    }

    #[tokio::test]
    async fn test_funding_payment_events_land_in_ring() {
        let mut h = harness();
        seed_market(&h, dec!(0.0001), dec!(0.0050)).await;
        h.engine.tick().await;
        h.engine.tick().await;

        let tx = h.engine.event_sender();
        tx.send(VenueEvent::FundingPayment(crate::venue::FundingPayment {
            venue: VenueId::from("sim_b"),
            symbol: "BTC-USDT".to_string(),
            amount: Some(dec!(4)),
            rate: Some(dec!(0.0050)),
            timestamp: Utc::now(),
        }))
        .unwrap();
        h.engine.drain_events();
        let arb = h.engine.arbitrage("BTC").unwrap();
        assert_eq!(arb.funding_payment_count(), 1);
        assert_eq!(arb.funding_payments_pnl(), dec!(4));
    }

    #[tokio::test]
    async fn test_close_venue_command_closes_touching_positions() {
        let mut h = harness();
        seed_market(&h, dec!(0.0001), dec!(0.0050)).await;
        h.engine.tick().await;
        h.engine.tick().await;
        assert_eq!(h.engine.arbitrage_state("BTC"), Some(ArbState::Active));

        h.engine
            .command_sender()
            .send(EngineCommand::CloseVenuePositions {
                venue: VenueId::from("sim_b"),
                reason: "margin emergency exit".to_string(),
            })
            .unwrap();
        h.engine.process_commands().await;
        assert_eq!(h.engine.arbitrage_state("BTC"), Some(ArbState::Closing));
        assert_eq!(
            h.engine.arbitrage("BTC").unwrap().close_reason.as_deref(),
            Some("margin emergency exit")
        );
    }

    #[tokio::test]
    async fn test_setup_venues_tolerates_oneway_only() {
        let config = EngineConfig {
            venues: vec![
                "hyperliquid_perpetual".to_string(),
                "binance_perpetual".to_string(),
            ],
            tokens: vec!["BTC".to_string()],
            ..base_config()
        };
        let sim_config = SimVenueConfig::default();
        let hl = Arc::new(SimVenue::new(
            VenueId::from("hyperliquid_perpetual"),
            sim_config.clone(),
        ));
        let bn = Arc::new(SimVenue::new(
            VenueId::from("binance_perpetual"),
            sim_config,
        ));
        let mut h = harness();
        h.engine.deps.venues.clear();
        h.engine
            .deps
            .venues
            .insert(VenueId::from("hyperliquid_perpetual"), hl);
        h.engine
            .deps
            .venues
            .insert(VenueId::from("binance_perpetual"), bn);
        h.engine.config = config;
        // Must not panic or disable anything; ONEWAY-only venue gets
        // ONEWAY, the other HEDGE.
        h.engine.setup_venues().await;
        // Mixed quote currencies (USD vs USDT) produce the startup alert.
        assert!(h.alerts.contains_title("Multiple quote currencies"));
    }
}
