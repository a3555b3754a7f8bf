//! Reliability plane: rate limiting, time sync, circuit breakers,
//! readiness, and the gate that aggregates them into one predicate.

pub mod circuit_breaker;
pub mod rate_limiter;
pub mod readiness;
pub mod time_sync;

pub use circuit_breaker::{
    BreakerKind, BreakerState, BreakerStatus, BreakerThresholds, CircuitBreaker,
    CircuitBreakerSet,
};
pub use rate_limiter::{BucketSnapshot, RateLimiter};
pub use readiness::{
    HealthCheckResult, HealthLevel, NullResourceSampler, ResourceSampler, ResourceUsage,
    TradingReadiness,
};
pub use time_sync::TimeSyncMonitor;

use serde_json::json;
use std::sync::Arc;

use crate::venue::VenueId;

/// Aggregates the reliability subsystems into a single
/// `can_trade() -> (ok, reason)` predicate consulted before any new order.
pub struct ReliabilityGate {
    pub time_sync: Arc<TimeSyncMonitor>,
    pub breakers: Arc<CircuitBreakerSet>,
    pub readiness: Arc<TradingReadiness>,
    pub rate_limiter: Arc<RateLimiter>,
}

impl ReliabilityGate {
    pub fn new(
        time_sync: Arc<TimeSyncMonitor>,
        breakers: Arc<CircuitBreakerSet>,
        readiness: Arc<TradingReadiness>,
        rate_limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            time_sync,
            breakers,
            readiness,
            rate_limiter,
        }
    }

    /// Evaluation order: time drift, circuit breakers, readiness.
    pub fn can_trade(&self) -> (bool, String) {
        if !self.time_sync.trading_allowed() {
            return (false, "time_drift".to_string());
        }
        if !self.breakers.can_trade() {
            return (false, "circuit_breaker".to_string());
        }
        let (ready, reason) = self.readiness.can_trade();
        if !ready {
            return (false, reason);
        }
        (true, "ok".to_string())
    }

    /// Non-blocking rate-limit probe; does not consume tokens' worth of
    /// sleeping, only the tokens themselves.
    pub fn can_pass_rate_limit(&self, venue: &VenueId, tokens: u32) -> bool {
        self.rate_limiter.try_acquire(venue, tokens)
    }

    /// Component-level summary for the health endpoints.
    pub fn status_summary(&self) -> serde_json::Value {
        let (ok, reason) = self.can_trade();
        json!({
            "can_trade": ok,
            "reason": reason,
            "time_sync": {
                "trading_allowed": self.time_sync.trading_allowed(),
                "statistics": self.time_sync.statistics(),
            },
            "circuit_breakers": {
                "kill_switch_active": self.breakers.kill_switch_active(),
                "breakers": self.breakers.statuses(),
            },
            "readiness": {
                "is_ready": self.readiness.is_ready(),
                "checks": self.readiness.latest_results(),
            },
            "rate_limiter": self.rate_limiter.snapshots(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::TracingAlertSink;
    use crate::config::ReliabilityConfig;

    fn gate() -> ReliabilityGate {
        let config = ReliabilityConfig::default();
        let readiness = Arc::new(TradingReadiness::new(
            config.connection_timeout_seconds,
            Arc::new(NullResourceSampler),
        ));
        readiness.run_all_checks();
        ReliabilityGate::new(
            Arc::new(TimeSyncMonitor::new(&config, Arc::new(TracingAlertSink))),
            Arc::new(CircuitBreakerSet::default()),
            readiness,
            Arc::new(RateLimiter::new(&config)),
        )
    }

    #[test]
    fn test_gate_allows_by_default() {
        let gate = gate();
        assert_eq!(gate.can_trade(), (true, "ok".to_string()));
    }

    #[test]
    fn test_kill_switch_blocks_with_breaker_reason() {
        let gate = gate();
        gate.breakers.activate_kill_switch("test");
        assert_eq!(gate.can_trade(), (false, "circuit_breaker".to_string()));
    }

    #[test]
    fn test_readiness_reason_propagates() {
        let gate = gate();
        gate.readiness.update_connection_status(
            &VenueId::from("okx_perpetual"),
            crate::venue::ConnectionChannel::Websocket,
            crate::venue::ConnectionState::Error,
            None,
        );
        gate.readiness.run_all_checks();
        assert_eq!(gate.can_trade(), (false, "connections".to_string()));
    }

    #[test]
    fn test_rate_limit_probe_consumes_tokens() {
        let gate = gate();
        let venue = VenueId::from("kraken_perpetual"); // 60-token bucket
        for _ in 0..60 {
            assert!(gate.can_pass_rate_limit(&venue, 1));
        }
        assert!(!gate.can_pass_rate_limit(&venue, 1));
    }

    #[test]
    fn test_status_summary_shape() {
        let gate = gate();
        let summary = gate.status_summary();
        assert!(summary["can_trade"].is_boolean());
        assert!(summary["circuit_breakers"]["breakers"].is_array());
    }
}
