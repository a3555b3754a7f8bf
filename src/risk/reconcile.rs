//! Expected-vs-actual reconciliation of positions and balances.
//!
//! Periodically diffs the expected position book against venue-reported
//! state, classifies discrepancies, applies safe auto-fixes through a
//! pluggable fixer, and raises the emergency-stop flag when too many
//! critical discrepancies show up in one cycle. On a cold start with an
//! empty expected book the observed state is adopted as-is.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};

use crate::alerts::{Alert, AlertSeverity, AlertSink};
use crate::config::ReconciliationConfig;
use crate::venue::{PositionSide, TradingPair, Venue, VenueId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscrepancyKind {
    PositionMissing,
    PositionExtra,
    PositionSizeMismatch,
    BalanceMismatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscrepancySeverity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairAction {
    ManualReview,
    AutoOpenPosition,
    AutoClosePosition,
    AutoAdjustSize,
    EmergencyStop,
}

/// Identity of a position for reconciliation purposes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct PositionKey {
    pub venue: VenueId,
    pub pair: TradingPair,
    pub side: PositionSide,
}

impl std::fmt::Display for PositionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}_{}", self.venue, self.pair, self.side)
    }
}

/// Point-in-time view of one position.
#[derive(Debug, Clone, Serialize)]
pub struct ReconPositionSnapshot {
    pub key: PositionKey,
    pub size: Decimal,
    pub notional_value: Decimal,
    pub entry_price: Decimal,
    pub mark_price: Option<Decimal>,
    pub unrealized_pnl: Option<Decimal>,
    pub leverage: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Point-in-time view of one balance.
#[derive(Debug, Clone, Serialize)]
pub struct ReconBalanceSnapshot {
    pub venue: VenueId,
    pub asset: String,
    pub total_balance: Decimal,
    pub available_balance: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// The expected side of reconciliation, maintained by the engine as it
/// opens and closes positions. The reconciler holds a one-way handle and
/// never calls back into the engine.
#[derive(Debug, Default)]
pub struct PositionBook {
    expected_positions: HashMap<PositionKey, ReconPositionSnapshot>,
    expected_balances: HashMap<(VenueId, String), ReconBalanceSnapshot>,
}

impl PositionBook {
    pub fn expect_position(&mut self, snapshot: ReconPositionSnapshot) {
        debug!(key = %snapshot.key, "expecting position");
        self.expected_positions.insert(snapshot.key.clone(), snapshot);
    }

    pub fn drop_position(&mut self, key: &PositionKey) {
        if self.expected_positions.remove(key).is_some() {
            debug!(key = %key, "expected position dropped");
        }
    }

    pub fn expect_balance(&mut self, snapshot: ReconBalanceSnapshot) {
        self.expected_balances
            .insert((snapshot.venue.clone(), snapshot.asset.clone()), snapshot);
    }

    pub fn expected_positions(&self) -> HashMap<PositionKey, ReconPositionSnapshot> {
        self.expected_positions.clone()
    }

    pub fn expected_balances(&self) -> HashMap<(VenueId, String), ReconBalanceSnapshot> {
        self.expected_balances.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.expected_positions.is_empty()
    }
}

/// One detected discrepancy.
#[derive(Debug, Clone, Serialize)]
pub struct Discrepancy {
    pub kind: DiscrepancyKind,
    pub severity: DiscrepancySeverity,
    pub description: String,
    pub affected: String,
    pub auto_fixable: bool,
    pub action: RepairAction,
    pub detected_at: DateTime<Utc>,
}

/// Outcome of one reconciliation cycle.
#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationReport {
    pub timestamp: DateTime<Utc>,
    pub total_discrepancies: usize,
    pub counts_by_kind: HashMap<DiscrepancyKind, usize>,
    pub critical: Vec<Discrepancy>,
    pub auto_fixes_applied: Vec<String>,
    pub manual_review_required: Vec<Discrepancy>,
}

/// Applies safe repairs. Implementations must be idempotent: re-applying
/// the same fix without new external changes is a no-op.
#[async_trait]
pub trait AutoFixer: Send + Sync {
    async fn apply(&self, discrepancy: &Discrepancy) -> anyhow::Result<()>;
}

const HISTORY_RETENTION_HOURS: i64 = 24;
const EMERGENCY_CRITICAL_COUNT: usize = 3;

/// The reconciliation engine.
pub struct Reconciler {
    book: Arc<Mutex<PositionBook>>,
    config: ReconciliationConfig,
    fixer: Option<Arc<dyn AutoFixer>>,
    alerts: Arc<dyn AlertSink>,
    history: Mutex<Vec<Discrepancy>>,
    emergency_stop: AtomicBool,
    cold_start_done: AtomicBool,
}

impl Reconciler {
    pub fn new(
        book: Arc<Mutex<PositionBook>>,
        config: ReconciliationConfig,
        fixer: Option<Arc<dyn AutoFixer>>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            book,
            config,
            fixer,
            alerts,
            history: Mutex::new(Vec::new()),
            emergency_stop: AtomicBool::new(false),
            cold_start_done: AtomicBool::new(false),
        }
    }

    pub fn emergency_stop_triggered(&self) -> bool {
        self.emergency_stop.load(Ordering::SeqCst)
    }

    pub fn recent_discrepancies(&self) -> Vec<Discrepancy> {
        self.history.lock().expect("history lock").clone()
    }

    /// One reconciliation pass over venue-reported state.
    pub async fn run_cycle(
        &self,
        actual_positions: &HashMap<PositionKey, ReconPositionSnapshot>,
        actual_balances: &HashMap<(VenueId, String), ReconBalanceSnapshot>,
    ) -> ReconciliationReport {
        let now = Utc::now();

        // Cold start: adopt venue-reported state as the expectation
        // instead of flagging every observed position as extra.
        if !self.cold_start_done.swap(true, Ordering::SeqCst) {
            let mut book = self.book.lock().expect("book lock");
            if book.is_empty() && !actual_positions.is_empty() {
                info!(
                    positions = actual_positions.len(),
                    "cold start: adopting observed positions as expected state"
                );
                for snapshot in actual_positions.values() {
                    book.expect_position(snapshot.clone());
                }
                for snapshot in actual_balances.values() {
                    book.expect_balance(snapshot.clone());
                }
                return ReconciliationReport {
                    timestamp: now,
                    total_discrepancies: 0,
                    counts_by_kind: HashMap::new(),
                    critical: Vec::new(),
                    auto_fixes_applied: Vec::new(),
                    manual_review_required: Vec::new(),
                };
            }
        }

        let (expected_positions, expected_balances) = {
            let book = self.book.lock().expect("book lock");
            (book.expected_positions(), book.expected_balances())
        };

        let mut discrepancies = Vec::new();
        discrepancies.extend(self.diff_positions(&expected_positions, actual_positions, now));
        discrepancies.extend(self.diff_balances(&expected_balances, actual_balances, now));

        let mut auto_fixes_applied = Vec::new();
        if self.config.auto_fix_enabled {
            if let Some(fixer) = &self.fixer {
                for discrepancy in discrepancies.iter().filter(|d| d.auto_fixable) {
                    match fixer.apply(discrepancy).await {
                        Ok(()) => {
                            info!(affected = %discrepancy.affected, action = ?discrepancy.action, "auto-fix applied");
                            auto_fixes_applied.push(discrepancy.affected.clone());
                        }
                        Err(e) => {
                            warn!(affected = %discrepancy.affected, error = %e, "auto-fix failed");
                        }
                    }
                }
            }
        }

        let critical: Vec<Discrepancy> = discrepancies
            .iter()
            .filter(|d| d.severity == DiscrepancySeverity::Critical)
            .cloned()
            .collect();
        if critical.len() >= EMERGENCY_CRITICAL_COUNT
            && self.config.emergency_stop_on_critical_issues
        {
            self.emergency_stop.store(true, Ordering::SeqCst);
            error!(
                critical = critical.len(),
                "emergency stop: too many critical reconciliation discrepancies"
            );
            self.alerts.emit(
                Alert::new(
                    AlertSeverity::Critical,
                    "Reconciliation emergency stop",
                    format!("{} critical discrepancies in one cycle", critical.len()),
                )
                .with_tag("reconciliation"),
            );
        }

        let manual_review_required: Vec<Discrepancy> = discrepancies
            .iter()
            .filter(|d| {
                !d.auto_fixable || d.severity >= DiscrepancySeverity::High
            })
            .cloned()
            .collect();

        let mut counts_by_kind: HashMap<DiscrepancyKind, usize> = HashMap::new();
        for d in &discrepancies {
            *counts_by_kind.entry(d.kind).or_default() += 1;
        }

        {
            let mut history = self.history.lock().expect("history lock");
            history.extend(discrepancies.iter().cloned());
            let cutoff = now - ChronoDuration::hours(HISTORY_RETENTION_HOURS);
            history.retain(|d| d.detected_at > cutoff);
        }

        info!(
            discrepancies = discrepancies.len(),
            auto_fixes = auto_fixes_applied.len(),
            "reconciliation cycle complete"
        );

        ReconciliationReport {
            timestamp: now,
            total_discrepancies: discrepancies.len(),
            counts_by_kind,
            critical,
            auto_fixes_applied,
            manual_review_required,
        }
    }

    fn diff_positions(
        &self,
        expected: &HashMap<PositionKey, ReconPositionSnapshot>,
        actual: &HashMap<PositionKey, ReconPositionSnapshot>,
        now: DateTime<Utc>,
    ) -> Vec<Discrepancy> {
        let mut discrepancies = Vec::new();

        for (key, expected_position) in expected {
            if !actual.contains_key(key) {
                discrepancies.push(Discrepancy {
                    kind: DiscrepancyKind::PositionMissing,
                    severity: DiscrepancySeverity::High,
                    description: format!(
                        "expected position {key} (size {}) not found on venue",
                        expected_position.size
                    ),
                    affected: key.to_string(),
                    auto_fixable: true,
                    action: RepairAction::AutoOpenPosition,
                    detected_at: now,
                });
            }
        }

        for (key, actual_position) in actual {
            if !expected.contains_key(key) {
                discrepancies.push(Discrepancy {
                    kind: DiscrepancyKind::PositionExtra,
                    severity: DiscrepancySeverity::Medium,
                    description: format!(
                        "unexpected position {key} (size {}) found on venue",
                        actual_position.size
                    ),
                    affected: key.to_string(),
                    auto_fixable: true,
                    action: RepairAction::AutoClosePosition,
                    detected_at: now,
                });
            }
        }

        for (key, expected_position) in expected {
            let Some(actual_position) = actual.get(key) else {
                continue;
            };
            let size_diff = (expected_position.size - actual_position.size).abs();
            let tolerance = (expected_position.size * dec!(0.01)).min(dec!(0.001));
            if size_diff <= tolerance {
                continue;
            }
            let critical = size_diff > expected_position.size * dec!(0.1);
            let auto_fixable = !critical && size_diff <= self.config.max_auto_fix_amount;
            discrepancies.push(Discrepancy {
                kind: DiscrepancyKind::PositionSizeMismatch,
                severity: if critical {
                    DiscrepancySeverity::Critical
                } else {
                    DiscrepancySeverity::Medium
                },
                description: format!(
                    "size mismatch for {key}: expected {}, actual {}",
                    expected_position.size, actual_position.size
                ),
                affected: key.to_string(),
                auto_fixable,
                action: if critical {
                    RepairAction::ManualReview
                } else {
                    RepairAction::AutoAdjustSize
                },
                detected_at: now,
            });
        }

        discrepancies
    }

    fn diff_balances(
        &self,
        expected: &HashMap<(VenueId, String), ReconBalanceSnapshot>,
        actual: &HashMap<(VenueId, String), ReconBalanceSnapshot>,
        now: DateTime<Utc>,
    ) -> Vec<Discrepancy> {
        let mut discrepancies = Vec::new();
        for (key, expected_balance) in expected {
            let Some(actual_balance) = actual.get(key) else {
                continue; // balance may simply not exist yet
            };
            let diff = (expected_balance.total_balance - actual_balance.total_balance).abs();
            let tolerance = (expected_balance.total_balance * dec!(0.02)).max(Decimal::ONE);
            if diff <= tolerance {
                continue;
            }
            let severity = if diff > expected_balance.total_balance * dec!(0.1) {
                DiscrepancySeverity::High
            } else {
                DiscrepancySeverity::Medium
            };
            discrepancies.push(Discrepancy {
                kind: DiscrepancyKind::BalanceMismatch,
                severity,
                description: format!(
                    "balance mismatch for {}/{}: expected {}, actual {}",
                    key.0, key.1, expected_balance.total_balance, actual_balance.total_balance
                ),
                affected: format!("{}_{}", key.0, key.1),
                auto_fixable: false,
                action: RepairAction::ManualReview,
                detected_at: now,
            });
        }
        discrepancies
    }

    /// Periodic loop pulling actual state from venues.
    pub async fn run_loop(
        self: Arc<Self>,
        venues: HashMap<VenueId, Arc<dyn Venue>>,
        pairs_by_venue: HashMap<VenueId, Vec<TradingPair>>,
        shutdown: Arc<AtomicBool>,
    ) {
        if !self.config.auto_position_reconciliation {
            info!("position reconciliation disabled");
            return;
        }
        let interval = Duration::from_secs(self.config.interval_seconds);
        info!(interval_secs = interval.as_secs(), "reconciliation loop started");

        while !shutdown.load(Ordering::SeqCst) {
            let mut actual_positions = HashMap::new();
            let mut actual_balances = HashMap::new();

            for (venue_id, venue) in &venues {
                let Some(pairs) = pairs_by_venue.get(venue_id) else {
                    continue;
                };
                for pair in pairs {
                    match venue.get_position(pair).await {
                        Ok(Some(position)) => {
                            let key = PositionKey {
                                venue: venue_id.clone(),
                                pair: pair.clone(),
                                side: position.side,
                            };
                            actual_positions.insert(
                                key.clone(),
                                ReconPositionSnapshot {
                                    key,
                                    size: position.size,
                                    notional_value: position.notional_quote,
                                    entry_price: position.entry_price,
                                    mark_price: position.mark_price,
                                    unrealized_pnl: position.unrealized_pnl,
                                    leverage: position.leverage,
                                    timestamp: Utc::now(),
                                },
                            );
                        }
                        Ok(None) => {}
                        Err(e) => {
                            warn!(venue = %venue_id, pair = %pair, error = %e, "reconciliation position fetch failed");
                        }
                    }
                }
                let asset = venue.quote_asset().to_string();
                match venue.get_balance(&asset).await {
                    Ok(balance) => {
                        actual_balances.insert(
                            (venue_id.clone(), asset.clone()),
                            ReconBalanceSnapshot {
                                venue: venue_id.clone(),
                                asset,
                                total_balance: balance,
                                available_balance: balance,
                                timestamp: Utc::now(),
                            },
                        );
                    }
                    Err(e) => {
                        warn!(venue = %venue_id, error = %e, "reconciliation balance fetch failed");
                    }
                }
            }

            self.run_cycle(&actual_positions, &actual_balances).await;
            sleep(interval).await;
        }
        info!("reconciliation loop stopped");
    }
}
