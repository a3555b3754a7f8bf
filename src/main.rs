//! Funding Arb Engine - main entry point.
//!
//! Wires the reliability plane, risk plane, settlement scheduler, and the
//! lifecycle engine together, runs the monitoring loops, and serves the
//! health endpoints. Live venue connectors attach externally through the
//! `Venue` trait; the binary itself runs against simulated venues in demo
//! mode.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use funding_arb_engine::alerts::{Alert, AlertSeverity, AlertSink, TracingAlertSink};
use funding_arb_engine::config::EngineConfig;
use funding_arb_engine::edge::EdgeCalculator;
use funding_arb_engine::engine::{EngineCommand, EngineDeps, LifecycleEngine};
use funding_arb_engine::health::{self, HealthState};
use funding_arb_engine::metrics::MetricsRegistry;
use funding_arb_engine::reliability::{
    BreakerThresholds, CircuitBreakerSet, HealthCheckResult, HealthLevel, NullResourceSampler,
    RateLimiter, ReliabilityGate, TimeSyncMonitor, TradingReadiness,
};
use funding_arb_engine::risk::{
    apply_leverage_reduction, MarginAction, MarginActionContext, MarginActionHandler,
    MarginMonitor, PositionBook, Reconciler,
};
use funding_arb_engine::scheduler::SettlementScheduler;
use funding_arb_engine::venue::{SimVenue, SimVenueConfig, TradingPair, Venue, VenueId};

/// Funding Arb Engine CLI
#[derive(Parser)]
#[command(name = "funding-arb-engine")]
#[command(version, about = "Cross-exchange funding-rate arbitrage engine")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Force demo mode (simulated fills, no real orders)
    #[arg(long)]
    demo: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the configuration and exit
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();
    let mut config = EngineConfig::load()?;
    if cli.demo {
        config.demo.demo_mode = true;
    }
    config.validate()?;

    if let Some(Commands::CheckConfig) = cli.command {
        info!(
            venues = ?config.venues,
            tokens = ?config.tokens,
            demo = config.demo.demo_mode,
            "configuration is valid"
        );
        return Ok(());
    }

    run(config).await
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

/// Build the venue fleet. Live connectors are external collaborators; the
/// binary can only run against simulated venues, so anything but demo
/// mode refuses to start here.
fn build_venues(config: &EngineConfig) -> Result<HashMap<VenueId, Arc<dyn Venue>>> {
    if !config.demo.demo_mode {
        anyhow::bail!(
            "no live venue connectors are linked into this binary; \
             enable demo_mode or embed the engine as a library with real connectors"
        );
    }
    let sim_config = SimVenueConfig {
        initial_balance: config.demo.demo_account_balance_quote,
        fill_delay: Duration::from_secs(config.demo.demo_fill_delay_seconds),
        close_delay: Duration::from_secs(config.demo.demo_close_delay_seconds),
        ..Default::default()
    };
    let mut venues: HashMap<VenueId, Arc<dyn Venue>> = HashMap::new();
    for name in &config.venues {
        let id = VenueId::new(name.clone());
        venues.insert(id.clone(), Arc::new(SimVenue::new(id, sim_config.clone())));
    }
    info!(
        venues = venues.len(),
        "demo mode: simulated venues created (no market data until fed)"
    );
    Ok(venues)
}

/// Executes margin actions against venues: leverage reductions go
/// straight to the venue (with partial-close fallback), close and exit
/// actions are routed into the engine as commands.
struct EngineMarginHandler {
    venues: HashMap<VenueId, Arc<dyn Venue>>,
    alerts: Arc<dyn AlertSink>,
    commands: tokio::sync::mpsc::UnboundedSender<EngineCommand>,
    auto_reduce: bool,
}

#[async_trait]
impl MarginActionHandler for EngineMarginHandler {
    async fn on_action(&self, action: MarginAction, context: MarginActionContext) {
        match action {
            MarginAction::ReduceLeverage => {
                let (Some(position), Some(target)) = (&context.position, context.target_leverage)
                else {
                    warn!(venue = %context.venue, reason = %context.reason, "leverage reduction advised");
                    return;
                };
                if !self.auto_reduce {
                    warn!(
                        venue = %context.venue,
                        position_id = %position.position_id,
                        target = %target,
                        "auto leverage reduction disabled, manual action required"
                    );
                    return;
                }
                let Some(venue) = self.venues.get(&context.venue) else {
                    return;
                };
                if let Err(e) = apply_leverage_reduction(venue.as_ref(), position, target).await {
                    error!(
                        venue = %context.venue,
                        position_id = %position.position_id,
                        error = %e,
                        "leverage reduction failed"
                    );
                    self.alerts.emit(
                        Alert::new(
                            AlertSeverity::High,
                            "Leverage reduction failed",
                            format!("{}: {e}", position.position_id),
                        )
                        .with_tag("margin"),
                    );
                }
            }
            MarginAction::ClosePositions => {
                self.alerts.emit(
                    Alert::new(
                        AlertSeverity::High,
                        "Margin close",
                        format!("{}: {}", context.venue, context.reason),
                    )
                    .with_tag("margin"),
                );
                let _ = self.commands.send(EngineCommand::CloseVenuePositions {
                    venue: context.venue,
                    reason: format!("margin: {}", context.reason),
                });
            }
            MarginAction::EmergencyExit => {
                self.alerts.emit(
                    Alert::new(
                        AlertSeverity::Critical,
                        "Margin emergency exit",
                        format!("{}: {}", context.venue, context.reason),
                    )
                    .with_tag("margin"),
                );
                let _ = self.commands.send(EngineCommand::CloseVenuePositions {
                    venue: context.venue,
                    reason: format!("EMERGENCY: {}", context.reason),
                });
            }
            MarginAction::AddMargin => {
                self.alerts.emit(
                    Alert::new(
                        AlertSeverity::High,
                        "Add margin",
                        format!("{}: {}", context.venue, context.reason),
                    )
                    .with_tag("margin"),
                );
            }
            MarginAction::Monitor => {}
        }
    }
}

async fn run(config: EngineConfig) -> Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        venues = ?config.venues,
        tokens = ?config.tokens,
        leverage = config.leverage,
        min_funding_rate_diff = %config.min_funding_rate_diff,
        take_profit = %config.profitability_to_take_profit,
        demo = config.demo.demo_mode,
        "funding arb engine starting"
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown signal received");
        shutdown_signal.store(true, Ordering::SeqCst);
    });

    let alerts: Arc<dyn AlertSink> = Arc::new(TracingAlertSink);
    let metrics = Arc::new(MetricsRegistry::new());

    // Reliability plane.
    let time_sync = Arc::new(TimeSyncMonitor::new(&config.reliability, alerts.clone()));
    let breakers = Arc::new(CircuitBreakerSet::new(BreakerThresholds {
        error_series: config.reliability.error_series_threshold,
        hedge_deviation: config.reliability.hedge_deviation_threshold,
        order_cancellation: config.reliability.order_cancellation_threshold,
    }));
    let readiness = Arc::new(TradingReadiness::new(
        config.reliability.connection_timeout_seconds,
        Arc::new(NullResourceSampler),
    ));
    let rate_limiter = Arc::new(RateLimiter::new(&config.reliability));
    let gate = Arc::new(ReliabilityGate::new(
        time_sync.clone(),
        breakers,
        readiness.clone(),
        rate_limiter,
    ));

    // Risk plane.
    let margin = Arc::new(MarginMonitor::new(
        config.margin.safety_buffer,
        config.margin.max_allowed_leverage,
        config.margin.auto_leverage_reduction,
        Duration::from_secs(config.margin.check_interval_seconds),
    ));
    let book = Arc::new(Mutex::new(PositionBook::default()));
    let reconciler = Arc::new(Reconciler::new(
        book.clone(),
        config.reconciliation.clone(),
        None,
        alerts.clone(),
    ));

    // A tripped reconciliation emergency stop blocks readiness.
    {
        let reconciler = reconciler.clone();
        readiness.register_custom_check(
            "reconciliation",
            Arc::new(move || {
                if reconciler.emergency_stop_triggered() {
                    HealthCheckResult::new(
                        "",
                        HealthLevel::Critical,
                        "reconciliation emergency stop active",
                    )
                } else {
                    HealthCheckResult::new("", HealthLevel::Healthy, "no emergency stop")
                }
            }),
        );
    }
    readiness.run_all_checks();

    let venues = build_venues(&config)?;
    let scheduler = Arc::new(SettlementScheduler::for_venues(
        config.venues.iter().map(String::as_str),
    ));

    let deps = EngineDeps {
        venues: venues.clone(),
        gate: gate.clone(),
        scheduler,
        edge: EdgeCalculator::new(config.min_edge_required, config.settlement_buffer_rate),
        margin: margin.clone(),
        book,
        alerts: alerts.clone(),
        metrics: metrics.clone(),
    };
    let mut engine = LifecycleEngine::new(config.clone(), deps);
    engine.attach_venue_streams();
    engine.setup_venues().await;

    // Monitoring loops.
    tokio::spawn(time_sync.run_loop(shutdown.clone()));
    tokio::spawn(readiness.clone().run_loop(
        Duration::from_secs(config.reliability.readiness_check_interval_seconds),
        shutdown.clone(),
    ));

    let margin_handler = Arc::new(EngineMarginHandler {
        venues: venues.clone(),
        alerts: alerts.clone(),
        commands: engine.command_sender(),
        auto_reduce: config.margin.auto_leverage_reduction,
    });
    tokio::spawn(margin.clone().run_loop(margin_handler, shutdown.clone()));

    // Keep readiness' margin view in sync with the monitor.
    {
        let margin = margin.clone();
        let readiness = readiness.clone();
        let shutdown = shutdown.clone();
        let venue_ids: Vec<VenueId> = venues.keys().cloned().collect();
        tokio::spawn(async move {
            while !shutdown.load(Ordering::SeqCst) {
                for venue in &venue_ids {
                    if let Some(health) = margin.worst_health(venue) {
                        readiness.update_margin_status(venue, health);
                    }
                }
                tokio::time::sleep(Duration::from_secs(10)).await;
            }
        });
    }

    let pairs_by_venue: HashMap<VenueId, Vec<TradingPair>> = venues
        .iter()
        .map(|(id, venue)| {
            let pairs = config
                .tokens
                .iter()
                .map(|token| TradingPair::new(token.clone(), venue.quote_asset()))
                .collect();
            (id.clone(), pairs)
        })
        .collect();
    tokio::spawn(
        reconciler
            .clone()
            .run_loop(venues.clone(), pairs_by_venue, shutdown.clone()),
    );

    if config.health.enabled {
        let state = HealthState {
            gate: gate.clone(),
            engine_status: engine.status_handle(),
            metrics: metrics.clone(),
            started_at: Utc::now(),
        };
        let host = config.health.host.clone();
        let port = config.health.port;
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = health::serve(state, &host, port, shutdown).await {
                error!(error = %e, "health server exited");
            }
        });
    }

    engine.run(shutdown).await;
    info!("funding arb engine stopped");
    Ok(())
}
