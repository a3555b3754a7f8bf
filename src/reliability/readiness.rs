//! Trading readiness health checks.
//!
//! Aggregates connection freshness, margin health, system resources, and
//! registered custom checks into a single `is_ready` predicate. Readiness
//! transitions are edge-triggered: the hook fires exactly once per change.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

use crate::risk::margin::MarginStatus;
use crate::venue::{ConnectionChannel, ConnectionState, VenueId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthLevel {
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckResult {
    pub name: String,
    pub level: HealthLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl HealthCheckResult {
    pub fn new(name: impl Into<String>, level: HealthLevel, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            level,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// CPU/memory/disk usage percentages.
#[derive(Debug, Clone, Copy)]
pub struct ResourceUsage {
    pub cpu_pct: f64,
    pub memory_pct: f64,
    pub disk_pct: f64,
}

/// Pluggable resource sampling; the embedder supplies the platform
/// implementation. `None` means sampling is unavailable and the check
/// reports healthy.
pub trait ResourceSampler: Send + Sync {
    fn sample(&self) -> Option<ResourceUsage>;
}

/// Default sampler: no data, resource check stays healthy.
#[derive(Debug, Default)]
pub struct NullResourceSampler;

impl ResourceSampler for NullResourceSampler {
    fn sample(&self) -> Option<ResourceUsage> {
        None
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionRecord {
    pub state: ConnectionState,
    pub last_seen: DateTime<Utc>,
    pub latency_ms: Option<f64>,
    pub error_count: u64,
}

type CustomCheck = Arc<dyn Fn() -> HealthCheckResult + Send + Sync>;

#[derive(Default)]
struct ReadinessState {
    connections: HashMap<(VenueId, ConnectionChannel), ConnectionRecord>,
    margins: HashMap<VenueId, MarginStatus>,
    latest: HashMap<String, HealthCheckResult>,
}

/// Aggregated readiness checker.
pub struct TradingReadiness {
    connection_timeout: ChronoDuration,
    state: Mutex<ReadinessState>,
    is_ready: AtomicBool,
    resource_sampler: Arc<dyn ResourceSampler>,
    custom_checks: Mutex<Vec<(String, CustomCheck)>>,
    transition_hook: Mutex<Option<Box<dyn Fn(bool) + Send + Sync>>>,
}

impl TradingReadiness {
    pub fn new(connection_timeout_seconds: u64, resource_sampler: Arc<dyn ResourceSampler>) -> Self {
        Self {
            connection_timeout: ChronoDuration::seconds(connection_timeout_seconds as i64),
            state: Mutex::new(ReadinessState::default()),
            is_ready: AtomicBool::new(true),
            resource_sampler,
            custom_checks: Mutex::new(Vec::new()),
            transition_hook: Mutex::new(None),
        }
    }

    /// Hook fired exactly once per readiness transition, with the new
    /// readiness value.
    pub fn set_transition_hook(&self, hook: Box<dyn Fn(bool) + Send + Sync>) {
        *self.transition_hook.lock().expect("hook lock") = Some(hook);
    }

    pub fn register_custom_check(
        &self,
        name: impl Into<String>,
        check: CustomCheck,
    ) {
        self.custom_checks
            .lock()
            .expect("custom check lock")
            .push((name.into(), check));
    }

    pub fn update_connection_status(
        &self,
        venue: &VenueId,
        channel: ConnectionChannel,
        state: ConnectionState,
        latency_ms: Option<f64>,
    ) {
        let mut guard = self.state.lock().expect("readiness lock");
        let record = guard
            .connections
            .entry((venue.clone(), channel))
            .or_insert(ConnectionRecord {
                state,
                last_seen: Utc::now(),
                latency_ms,
                error_count: 0,
            });
        record.last_seen = Utc::now();
        record.latency_ms = latency_ms;
        if state == ConnectionState::Error {
            record.error_count += 1;
        }
        record.state = state;
    }

    pub fn update_margin_status(&self, venue: &VenueId, status: MarginStatus) {
        self.state
            .lock()
            .expect("readiness lock")
            .margins
            .insert(venue.clone(), status);
    }

    fn check_connections(&self, state: &ReadinessState) -> HealthCheckResult {
        let now = Utc::now();
        let mut stale = Vec::new();
        let mut errored = Vec::new();
        for ((venue, channel), record) in &state.connections {
            if record.state == ConnectionState::Error {
                errored.push(format!("{venue}/{channel}"));
            } else if now - record.last_seen > self.connection_timeout {
                stale.push(format!("{venue}/{channel}"));
            }
        }
        if !errored.is_empty() || !stale.is_empty() {
            HealthCheckResult::new(
                "connections",
                HealthLevel::Critical,
                format!("errored: [{}], stale: [{}]", errored.join(", "), stale.join(", ")),
            )
        } else {
            HealthCheckResult::new(
                "connections",
                HealthLevel::Healthy,
                format!("{} connections healthy", state.connections.len()),
            )
        }
    }

    fn check_margins(&self, state: &ReadinessState) -> HealthCheckResult {
        let mut critical = Vec::new();
        let mut danger = Vec::new();
        for (venue, status) in &state.margins {
            match status {
                MarginStatus::Critical | MarginStatus::LiquidationRisk => {
                    critical.push(venue.to_string())
                }
                MarginStatus::Danger => danger.push(venue.to_string()),
                _ => {}
            }
        }
        if !critical.is_empty() {
            HealthCheckResult::new(
                "margins",
                HealthLevel::Critical,
                format!("critical margin on [{}]", critical.join(", ")),
            )
        } else if !danger.is_empty() {
            HealthCheckResult::new(
                "margins",
                HealthLevel::Warning,
                format!("margin in danger on [{}]", danger.join(", ")),
            )
        } else {
            HealthCheckResult::new("margins", HealthLevel::Healthy, "all margins healthy")
        }
    }

    fn check_resources(&self) -> HealthCheckResult {
        let Some(usage) = self.resource_sampler.sample() else {
            return HealthCheckResult::new(
                "system_resources",
                HealthLevel::Healthy,
                "resource sampling unavailable",
            );
        };
        let message = format!(
            "cpu {:.0}%, mem {:.0}%, disk {:.0}%",
            usage.cpu_pct, usage.memory_pct, usage.disk_pct
        );
        if usage.cpu_pct >= 95.0 {
            HealthCheckResult::new("system_resources", HealthLevel::Critical, message)
        } else if usage.cpu_pct > 90.0 || usage.memory_pct > 90.0 || usage.disk_pct > 95.0 {
            HealthCheckResult::new("system_resources", HealthLevel::Warning, message)
        } else {
            HealthCheckResult::new("system_resources", HealthLevel::Healthy, message)
        }
    }

    /// Run all checks, update readiness, and fire the transition hook on
    /// an edge.
    pub fn run_all_checks(&self) -> Vec<HealthCheckResult> {
        let customs: Vec<(String, CustomCheck)> = self
            .custom_checks
            .lock()
            .expect("custom check lock")
            .clone();

        let mut results = Vec::new();
        {
            let state = self.state.lock().expect("readiness lock");
            results.push(self.check_connections(&state));
            results.push(self.check_margins(&state));
        }
        results.push(self.check_resources());
        for (name, check) in customs {
            let mut result = check();
            result.name = name;
            results.push(result);
        }

        let ready = results.iter().all(|r| r.level != HealthLevel::Critical);
        {
            let mut state = self.state.lock().expect("readiness lock");
            state.latest = results
                .iter()
                .map(|r| (r.name.clone(), r.clone()))
                .collect();
        }

        let was_ready = self.is_ready.swap(ready, Ordering::SeqCst);
        if was_ready != ready {
            if ready {
                info!("trading readiness restored");
            } else {
                warn!("trading readiness lost");
            }
            if let Some(hook) = self.transition_hook.lock().expect("hook lock").as_ref() {
                hook(ready);
            }
        }
        results
    }

    pub fn is_ready(&self) -> bool {
        self.is_ready.load(Ordering::SeqCst)
    }

    /// Readiness verdict with the failing check's name as reason.
    pub fn can_trade(&self) -> (bool, String) {
        if self.is_ready() {
            return (true, "ok".to_string());
        }
        let state = self.state.lock().expect("readiness lock");
        let reason = state
            .latest
            .values()
            .find(|r| r.level == HealthLevel::Critical)
            .map(|r| r.name.clone())
            .unwrap_or_else(|| "not_ready".to_string());
        (false, reason)
    }

    /// Latest results keyed by check name.
    pub fn latest_results(&self) -> HashMap<String, HealthCheckResult> {
        self.state.lock().expect("readiness lock").latest.clone()
    }

    /// Monitoring loop; exits on the shutdown flag.
    pub async fn run_loop(self: Arc<Self>, interval: Duration, shutdown: Arc<AtomicBool>) {
        info!(interval_secs = interval.as_secs(), "readiness monitoring started");
        while !shutdown.load(Ordering::SeqCst) {
            let results = self.run_all_checks();
            debug!(checks = results.len(), ready = self.is_ready(), "readiness cycle complete");
            sleep(interval).await;
        }
        info!("readiness monitoring stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct FixedSampler(ResourceUsage);

    impl ResourceSampler for FixedSampler {
        fn sample(&self) -> Option<ResourceUsage> {
            Some(self.0)
        }
    }

    fn readiness() -> TradingReadiness {
        TradingReadiness::new(60, Arc::new(NullResourceSampler))
    }

    #[test]
    fn test_ready_by_default() {
        let r = readiness();
        r.run_all_checks();
        assert!(r.is_ready());
        assert_eq!(r.can_trade(), (true, "ok".to_string()));
    }

    #[test]
    fn test_errored_connection_is_critical() {
        let r = readiness();
        r.update_connection_status(
            &VenueId::from("okx_perpetual"),
            ConnectionChannel::Rest,
            ConnectionState::Error,
            None,
        );
        r.run_all_checks();
        assert!(!r.is_ready());
        assert_eq!(r.can_trade().1, "connections");
    }

    #[test]
    fn test_critical_margin_blocks_readiness() {
        let r = readiness();
        r.update_margin_status(&VenueId::from("bybit_perpetual"), MarginStatus::Critical);
        r.run_all_checks();
        assert!(!r.is_ready());
        assert_eq!(r.can_trade().1, "margins");
    }

    #[test]
    fn test_danger_margin_is_warning_only() {
        let r = readiness();
        r.update_margin_status(&VenueId::from("bybit_perpetual"), MarginStatus::Danger);
        r.run_all_checks();
        assert!(r.is_ready());
    }

    #[test]
    fn test_resource_thresholds() {
        let r = TradingReadiness::new(
            60,
            Arc::new(FixedSampler(ResourceUsage {
                cpu_pct: 96.0,
                memory_pct: 10.0,
                disk_pct: 10.0,
            })),
        );
        r.run_all_checks();
        assert!(!r.is_ready());

        let r = TradingReadiness::new(
            60,
            Arc::new(FixedSampler(ResourceUsage {
                cpu_pct: 92.0,
                memory_pct: 10.0,
                disk_pct: 10.0,
            })),
        );
        r.run_all_checks();
        assert!(r.is_ready()); // warning only
    }

    #[test]
    fn test_custom_check_and_reason() {
        let r = readiness();
        r.register_custom_check(
            "feed_gap",
            Arc::new(|| {
                HealthCheckResult::new("", HealthLevel::Critical, "no ticks for 5m")
            }),
        );
        r.run_all_checks();
        assert!(!r.is_ready());
        assert_eq!(r.can_trade().1, "feed_gap");
    }

    #[test]
    fn test_transition_hook_fires_once_per_edge() {
        let r = readiness();
        let transitions = Arc::new(AtomicU32::new(0));
        let counter = transitions.clone();
        r.set_transition_hook(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        r.run_all_checks(); // ready -> ready, no edge
        assert_eq!(transitions.load(Ordering::SeqCst), 0);

        r.update_margin_status(&VenueId::from("v"), MarginStatus::LiquidationRisk);
        r.run_all_checks(); // edge: ready -> not ready
        r.run_all_checks(); // steady state, no new edge
        assert_eq!(transitions.load(Ordering::SeqCst), 1);

        r.update_margin_status(&VenueId::from("v"), MarginStatus::Healthy);
        r.run_all_checks(); // edge: not ready -> ready
        assert_eq!(transitions.load(Ordering::SeqCst), 2);
    }
}
