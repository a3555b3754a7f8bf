//! Pull-based metrics registry.
//!
//! Counters and gauges keyed by name; the health endpoints and the
//! periodic statistics report read point-in-time snapshots. External
//! exporters scrape the snapshot, the engine never pushes.

use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;

/// Well-known metric names used across the engine.
pub mod names {
    pub const TICKS: &str = "engine.ticks";
    pub const ERRORS: &str = "engine.errors";
    pub const OPPORTUNITIES_EVALUATED: &str = "scan.opportunities_evaluated";
    pub const OPPORTUNITIES_SKIPPED: &str = "scan.opportunities_skipped";
    pub const POSITIONS_OPENED: &str = "positions.opened";
    pub const POSITIONS_CLOSED: &str = "positions.closed";
    pub const FUNDING_PAYMENTS: &str = "funding.payments_received";
    pub const PENDING_TIMEOUTS: &str = "positions.pending_timeouts";
    pub const VALIDATION_FAILURES: &str = "positions.validation_failures";
    pub const EMERGENCY_CLOSES: &str = "positions.emergency_closes";
    pub const UNREALIZED_PNL: &str = "pnl.unrealized_quote";
    pub const REALIZED_PNL: &str = "pnl.realized_quote";
    pub const TRADING_READY: &str = "readiness.trading_ready";
}

#[derive(Debug, Default)]
struct Inner {
    counters: HashMap<String, u64>,
    gauges: HashMap<String, Decimal>,
}

/// Thread-safe counter/gauge registry.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    inner: Mutex<Inner>,
}

/// Point-in-time view of all metrics.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub counters: HashMap<String, u64>,
    pub gauges: HashMap<String, Decimal>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(&self, name: &str) {
        self.incr_by(name, 1);
    }

    pub fn incr_by(&self, name: &str, by: u64) {
        let mut inner = self.inner.lock().expect("metrics lock");
        *inner.counters.entry(name.to_string()).or_insert(0) += by;
    }

    /// Counter with a dynamic suffix, e.g. per-venue error counts.
    pub fn incr_labeled(&self, name: &str, label: &str) {
        self.incr(&format!("{name}.{label}"));
    }

    pub fn set_gauge(&self, name: &str, value: Decimal) {
        let mut inner = self.inner.lock().expect("metrics lock");
        inner.gauges.insert(name.to_string(), value);
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.inner
            .lock()
            .expect("metrics lock")
            .counters
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    pub fn gauge(&self, name: &str) -> Option<Decimal> {
        self.inner
            .lock()
            .expect("metrics lock")
            .gauges
            .get(name)
            .copied()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.inner.lock().expect("metrics lock");
        MetricsSnapshot {
            counters: inner.counters.clone(),
            gauges: inner.gauges.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_counters() {
        let metrics = MetricsRegistry::new();
        metrics.incr(names::TICKS);
        metrics.incr(names::TICKS);
        metrics.incr_by(names::ERRORS, 3);
        assert_eq!(metrics.counter(names::TICKS), 2);
        assert_eq!(metrics.counter(names::ERRORS), 3);
        assert_eq!(metrics.counter("unknown"), 0);
    }

    #[test]
    fn test_labeled_counter() {
        let metrics = MetricsRegistry::new();
        metrics.incr_labeled(names::ERRORS, "binance_perpetual");
        assert_eq!(metrics.counter("engine.errors.binance_perpetual"), 1);
    }

    #[test]
    fn test_gauges_and_snapshot() {
        let metrics = MetricsRegistry::new();
        metrics.set_gauge(names::UNREALIZED_PNL, dec!(12.5));
        metrics.set_gauge(names::UNREALIZED_PNL, dec!(13.5));
        let snapshot = metrics.snapshot();
        assert_eq!(
            snapshot.gauges.get(names::UNREALIZED_PNL),
            Some(&dec!(13.5))
        );
    }
}
