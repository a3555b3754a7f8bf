//! Typed circuit breakers with a global kill switch.
//!
//! Three breakers guard the execution path: error series (any API/order
//! failure), hedge deviation (leg imbalance), and order-cancellation
//! failures. Failures are counted inside a sliding window; enough of them
//! trip the breaker OPEN, which blocks execution until a timeout admits a
//! HALF_OPEN probe. A tripped hedge-deviation breaker additionally
//! activates the global kill switch, which blocks everything until an
//! operator clears it.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerKind {
    ErrorSeries,
    HedgeDeviation,
    OrderCancel,
}

impl BreakerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerKind::ErrorSeries => "error_series",
            BreakerKind::HedgeDeviation => "hedge_deviation",
            BreakerKind::OrderCancel => "order_cancel",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub timeout_seconds: u64,
    pub window_seconds: u64,
}

impl BreakerConfig {
    /// Default tuning per breaker kind.
    pub fn default_for(kind: BreakerKind) -> Self {
        match kind {
            BreakerKind::ErrorSeries => Self {
                failure_threshold: 5,
                success_threshold: 3,
                timeout_seconds: 60,
                window_seconds: 300,
            },
            BreakerKind::HedgeDeviation => Self {
                failure_threshold: 3,
                success_threshold: 2,
                timeout_seconds: 30,
                window_seconds: 120,
            },
            BreakerKind::OrderCancel => Self {
                failure_threshold: 10,
                success_threshold: 5,
                timeout_seconds: 120,
                window_seconds: 600,
            },
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    /// Failure timestamps inside the sliding window.
    failures: VecDeque<DateTime<Utc>>,
    success_count: u32,
    trip_time: Option<DateTime<Utc>>,
}

/// Serializable status snapshot; readers get copies, never references.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStatus {
    pub kind: BreakerKind,
    pub state: BreakerState,
    pub failure_count: u32,
    pub success_count: u32,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub trip_time: Option<DateTime<Utc>>,
    pub can_execute: bool,
}

/// A single circuit breaker. Counter mutation happens under a per-breaker
/// mutex; the critical section contains no I/O.
#[derive(Debug)]
pub struct CircuitBreaker {
    kind: BreakerKind,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(kind: BreakerKind, config: BreakerConfig) -> Self {
        Self {
            kind,
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failures: VecDeque::new(),
                success_count: 0,
                trip_time: None,
            }),
        }
    }

    fn prune_window(&self, inner: &mut BreakerInner, now: DateTime<Utc>) {
        let cutoff = now - ChronoDuration::seconds(self.config.window_seconds as i64);
        while inner.failures.front().is_some_and(|t| *t < cutoff) {
            inner.failures.pop_front();
        }
    }

    /// Record a successful operation. In CLOSED, successes decrement the
    /// failure count toward zero; in HALF_OPEN, enough of them close the
    /// breaker.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock");
        match inner.state {
            BreakerState::Closed => {
                inner.failures.pop_front();
            }
            BreakerState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    inner.state = BreakerState::Closed;
                    inner.failures.clear();
                    inner.success_count = 0;
                    inner.trip_time = None;
                    info!(breaker = self.kind.as_str(), "circuit breaker reset");
                }
            }
            BreakerState::Open => {}
        }
    }

    /// Record a failed operation. Returns `true` when this failure tripped
    /// the breaker.
    pub fn record_failure(&self) -> bool {
        let now = Utc::now();
        let mut inner = self.inner.lock().expect("breaker lock");
        match inner.state {
            BreakerState::HalfOpen => {
                Self::trip(self.kind, &mut inner, now);
                true
            }
            BreakerState::Closed => {
                inner.failures.push_back(now);
                self.prune_window(&mut inner, now);
                if inner.failures.len() as u32 >= self.config.failure_threshold {
                    Self::trip(self.kind, &mut inner, now);
                    true
                } else {
                    false
                }
            }
            BreakerState::Open => false,
        }
    }

    fn trip(kind: BreakerKind, inner: &mut BreakerInner, now: DateTime<Utc>) {
        inner.state = BreakerState::Open;
        inner.trip_time = Some(now);
        inner.success_count = 0;
        error!(
            breaker = kind.as_str(),
            failures = inner.failures.len(),
            "circuit breaker TRIPPED"
        );
    }

    /// Whether execution is currently allowed. An OPEN breaker past its
    /// timeout transitions to HALF_OPEN here.
    pub fn can_execute(&self) -> bool {
        let now = Utc::now();
        let mut inner = self.inner.lock().expect("breaker lock");
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let timed_out = inner.trip_time.is_some_and(|t| {
                    now - t >= ChronoDuration::seconds(self.config.timeout_seconds as i64)
                });
                if timed_out {
                    inner.state = BreakerState::HalfOpen;
                    inner.success_count = 0;
                    info!(
                        breaker = self.kind.as_str(),
                        "circuit breaker entering HALF_OPEN"
                    );
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn status(&self) -> BreakerStatus {
        let inner = self.inner.lock().expect("breaker lock");
        let can_execute = match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => inner.trip_time.is_some_and(|t| {
                Utc::now() - t >= ChronoDuration::seconds(self.config.timeout_seconds as i64)
            }),
        };
        BreakerStatus {
            kind: self.kind,
            state: inner.state,
            failure_count: inner.failures.len() as u32,
            success_count: inner.success_count,
            failure_threshold: self.config.failure_threshold,
            success_threshold: self.config.success_threshold,
            trip_time: inner.trip_time,
            can_execute,
        }
    }

    #[cfg(test)]
    fn force_trip_at(&self, time: DateTime<Utc>) {
        let mut inner = self.inner.lock().expect("breaker lock");
        inner.state = BreakerState::Open;
        inner.trip_time = Some(time);
    }
}

/// Thresholds for the three built-in breakers.
#[derive(Debug, Clone, Copy)]
pub struct BreakerThresholds {
    pub error_series: u32,
    pub hedge_deviation: u32,
    pub order_cancellation: u32,
}

impl Default for BreakerThresholds {
    fn default() -> Self {
        Self {
            error_series: 5,
            hedge_deviation: 3,
            order_cancellation: 10,
        }
    }
}

/// The set of built-in breakers plus the global kill switch.
#[derive(Debug)]
pub struct CircuitBreakerSet {
    error_series: CircuitBreaker,
    hedge_deviation: CircuitBreaker,
    order_cancel: CircuitBreaker,
    kill_switch: AtomicBool,
}

impl CircuitBreakerSet {
    pub fn new(thresholds: BreakerThresholds) -> Self {
        let mut error_config = BreakerConfig::default_for(BreakerKind::ErrorSeries);
        error_config.failure_threshold = thresholds.error_series;
        let mut hedge_config = BreakerConfig::default_for(BreakerKind::HedgeDeviation);
        hedge_config.failure_threshold = thresholds.hedge_deviation;
        let mut cancel_config = BreakerConfig::default_for(BreakerKind::OrderCancel);
        cancel_config.failure_threshold = thresholds.order_cancellation;

        Self {
            error_series: CircuitBreaker::new(BreakerKind::ErrorSeries, error_config),
            hedge_deviation: CircuitBreaker::new(BreakerKind::HedgeDeviation, hedge_config),
            order_cancel: CircuitBreaker::new(BreakerKind::OrderCancel, cancel_config),
            kill_switch: AtomicBool::new(false),
        }
    }

    fn breaker(&self, kind: BreakerKind) -> &CircuitBreaker {
        match kind {
            BreakerKind::ErrorSeries => &self.error_series,
            BreakerKind::HedgeDeviation => &self.hedge_deviation,
            BreakerKind::OrderCancel => &self.order_cancel,
        }
    }

    pub fn record_success(&self, kind: BreakerKind) {
        self.breaker(kind).record_success();
    }

    /// Record a failure; a hedge-deviation trip activates the global kill
    /// switch.
    pub fn record_failure(&self, kind: BreakerKind) {
        let tripped = self.breaker(kind).record_failure();
        if tripped && kind == BreakerKind::HedgeDeviation {
            self.activate_kill_switch("hedge deviation breaker tripped");
        }
    }

    pub fn can_execute(&self, kind: BreakerKind) -> bool {
        if self.kill_switch.load(Ordering::SeqCst) {
            return false;
        }
        self.breaker(kind).can_execute()
    }

    /// All critical breakers must allow execution and the kill switch must
    /// be off.
    pub fn can_trade(&self) -> bool {
        if self.kill_switch.load(Ordering::SeqCst) {
            return false;
        }
        self.error_series.can_execute()
            && self.hedge_deviation.can_execute()
            && self.order_cancel.can_execute()
    }

    pub fn activate_kill_switch(&self, reason: &str) {
        if !self.kill_switch.swap(true, Ordering::SeqCst) {
            error!(reason, "GLOBAL KILL SWITCH ACTIVATED");
        }
    }

    /// Manual operator action; breakers keep their own state.
    pub fn clear_kill_switch(&self) {
        if self.kill_switch.swap(false, Ordering::SeqCst) {
            warn!("global kill switch deactivated by operator");
        }
    }

    pub fn kill_switch_active(&self) -> bool {
        self.kill_switch.load(Ordering::SeqCst)
    }

    pub fn statuses(&self) -> Vec<BreakerStatus> {
        vec![
            self.error_series.status(),
            self.hedge_deviation.status(),
            self.order_cancel.status(),
        ]
    }
}

impl Default for CircuitBreakerSet {
    fn default() -> Self {
        Self::new(BreakerThresholds::default())
    }
}
