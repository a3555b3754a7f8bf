//! NTP clock-drift monitoring.
//!
//! Periodically measures local clock drift against a set of SNTP servers
//! (median of replies) and halts trading after enough consecutive
//! violations. Unreachable NTP is soft-allowed: an unobservable drift
//! must not block trading.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, error, info, warn};

use crate::alerts::{Alert, AlertSeverity, AlertSink};
use crate::config::ReliabilityConfig;

/// Seconds between the NTP epoch (1900) and the Unix epoch (1970).
const NTP_UNIX_OFFSET: f64 = 2_208_988_800.0;
const NTP_QUERY_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_DRIFT_HISTORY: usize = 100;

/// One SNTP mode-3 exchange. Returns the server's transmit timestamp as a
/// Unix timestamp, `None` on any failure.
async fn query_ntp(server: String) -> Option<f64> {
    let socket = UdpSocket::bind("0.0.0.0:0").await.ok()?;
    socket.connect(format!("{server}:123")).await.ok()?;

    let mut request = [0u8; 48];
    request[0] = 0x1b; // LI=0, VN=3, Mode=3 (client)
    socket.send(&request).await.ok()?;

    let mut response = [0u8; 512];
    let n = timeout(NTP_QUERY_TIMEOUT, socket.recv(&mut response))
        .await
        .ok()?
        .ok()?;
    if n < 48 {
        return None;
    }

    // Transmit timestamp: seconds at bytes 40..44, fraction at 44..48.
    let seconds = u32::from_be_bytes(response[40..44].try_into().ok()?) as f64;
    let fraction = u32::from_be_bytes(response[44..48].try_into().ok()?) as f64 / (1u64 << 32) as f64;
    Some(seconds + fraction - NTP_UNIX_OFFSET)
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct DriftSample {
    pub timestamp: DateTime<Utc>,
    pub drift_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DriftStatistics {
    pub current_drift_ms: f64,
    pub average_drift_ms: f64,
    pub max_drift_ms: f64,
    pub min_drift_ms: f64,
    pub trend: &'static str,
    pub samples: usize,
}

/// Clock drift monitor with a trading-halt latch.
pub struct TimeSyncMonitor {
    enabled: bool,
    drift_threshold_ms: f64,
    check_interval: Duration,
    max_violations: u32,
    ntp_servers: Vec<String>,
    trading_allowed: AtomicBool,
    violations: AtomicU32,
    history: Mutex<VecDeque<DriftSample>>,
    alerts: Arc<dyn AlertSink>,
}

impl TimeSyncMonitor {
    pub fn new(config: &ReliabilityConfig, alerts: Arc<dyn AlertSink>) -> Self {
        Self {
            enabled: config.time_sync_enabled,
            drift_threshold_ms: config.time_sync_drift_threshold_ms,
            check_interval: Duration::from_secs(config.time_sync_check_interval_seconds),
            max_violations: config.max_drift_violations,
            ntp_servers: config.ntp_servers.clone(),
            trading_allowed: AtomicBool::new(true),
            violations: AtomicU32::new(0),
            history: Mutex::new(VecDeque::new()),
            alerts,
        }
    }

    /// Whether trading is allowed from the time-sync perspective.
    pub fn trading_allowed(&self) -> bool {
        !self.enabled || self.trading_allowed.load(Ordering::SeqCst)
    }

    pub fn current_drift_ms(&self) -> Option<f64> {
        self.history
            .lock()
            .expect("drift history lock")
            .back()
            .map(|s| s.drift_ms)
    }

    /// Query all servers in parallel and take the median reply.
    async fn measure_drift(&self) -> Option<f64> {
        let handles: Vec<_> = self
            .ntp_servers
            .iter()
            .cloned()
            .map(|server| tokio::spawn(query_ntp(server)))
            .collect();

        let mut times = Vec::new();
        for handle in handles {
            if let Ok(Some(t)) = handle.await {
                times.push(t);
            }
        }
        if times.is_empty() {
            return None;
        }
        times.sort_by(|a, b| a.partial_cmp(b).expect("finite ntp time"));
        let median = if times.len() % 2 == 0 {
            (times[times.len() / 2 - 1] + times[times.len() / 2]) / 2.0
        } else {
            times[times.len() / 2]
        };

        let local = Utc::now().timestamp_micros() as f64 / 1e6;
        Some((local - median) * 1000.0)
    }

    fn record_sample(&self, drift_ms: f64) {
        let mut history = self.history.lock().expect("drift history lock");
        history.push_back(DriftSample {
            timestamp: Utc::now(),
            drift_ms,
        });
        while history.len() > MAX_DRIFT_HISTORY {
            history.pop_front();
        }
    }

    /// Apply one drift measurement (`None` = all servers unreachable).
    /// Returns whether trading remains allowed.
    fn process_measurement(&self, drift_ms: Option<f64>) -> bool {
        let Some(drift) = drift_ms else {
            warn!("unable to measure clock drift from any NTP server, allowing trading");
            return true;
        };

        self.record_sample(drift);

        if drift.abs() > self.drift_threshold_ms {
            let violations = self.violations.fetch_add(1, Ordering::SeqCst) + 1;
            warn!(
                drift_ms = drift,
                threshold_ms = self.drift_threshold_ms,
                violation = violations,
                max_violations = self.max_violations,
                "clock drift exceeds threshold"
            );
            if violations >= self.max_violations {
                let was_allowed = self.trading_allowed.swap(false, Ordering::SeqCst);
                if was_allowed {
                    error!(drift_ms = drift, "clock drift violations exceeded limit, halting trading");
                    self.alerts.emit(
                        Alert::new(
                            AlertSeverity::Critical,
                            "Clock drift halt",
                            format!(
                                "drift {:.2}ms exceeded {:.0}ms for {} consecutive checks",
                                drift, self.drift_threshold_ms, violations
                            ),
                        )
                        .with_tag("time_sync"),
                    );
                }
                return false;
            }
        } else {
            if self.violations.swap(0, Ordering::SeqCst) > 0 {
                info!(drift_ms = drift, "clock drift back to normal");
            }
            self.trading_allowed.store(true, Ordering::SeqCst);
        }
        self.trading_allowed.load(Ordering::SeqCst)
    }

    /// Run one measurement cycle.
    pub async fn check_time_sync(&self) -> bool {
        let drift = self.measure_drift().await;
        self.process_measurement(drift)
    }

    pub fn statistics(&self) -> Option<DriftStatistics> {
        let history = self.history.lock().expect("drift history lock");
        if history.is_empty() {
            return None;
        }
        let drifts: Vec<f64> = history.iter().map(|s| s.drift_ms).collect();
        let current = *drifts.last().expect("non-empty history");
        let average = drifts.iter().sum::<f64>() / drifts.len() as f64;
        let max = drifts.iter().cloned().fold(f64::MIN, f64::max);
        let min = drifts.iter().cloned().fold(f64::MAX, f64::min);

        let trend = if drifts.len() < 3 {
            "insufficient_data"
        } else {
            let recent = &drifts[drifts.len().saturating_sub(5)..];
            let first = recent[0];
            let last = recent[recent.len() - 1];
            if last > first + 10.0 {
                "increasing"
            } else if last < first - 10.0 {
                "decreasing"
            } else {
                "stable"
            }
        };

        Some(DriftStatistics {
            current_drift_ms: current,
            average_drift_ms: average,
            max_drift_ms: max,
            min_drift_ms: min,
            trend,
            samples: drifts.len(),
        })
    }

    /// Monitoring loop; exits on the shutdown flag.
    pub async fn run_loop(self: Arc<Self>, shutdown: Arc<AtomicBool>) {
        if !self.enabled {
            info!("time sync monitoring disabled");
            return;
        }
        info!(
            threshold_ms = self.drift_threshold_ms,
            interval_secs = self.check_interval.as_secs(),
            "time sync monitoring started"
        );
        while !shutdown.load(Ordering::SeqCst) {
            let allowed = self.check_time_sync().await;
            debug!(trading_allowed = allowed, "time sync check complete");
            sleep(self.check_interval).await;
        }
        info!("time sync monitoring stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::test_support::CapturingAlertSink;

    fn monitor(threshold_ms: f64, max_violations: u32) -> (TimeSyncMonitor, Arc<CapturingAlertSink>) {
        let sink = Arc::new(CapturingAlertSink::default());
        let config = ReliabilityConfig {
            time_sync_drift_threshold_ms: threshold_ms,
            max_drift_violations: max_violations,
            ..Default::default()
        };
        (TimeSyncMonitor::new(&config, sink.clone()), sink)
    }

    #[test]
    fn test_consecutive_violations_halt_trading() {
        let (monitor, sink) = monitor(500.0, 3);
        assert!(monitor.process_measurement(Some(700.0)));
        assert!(monitor.process_measurement(Some(800.0)));
        assert!(!monitor.process_measurement(Some(650.0)));
        assert!(!monitor.trading_allowed());
        assert!(sink.contains_title("Clock drift halt"));
    }

    #[test]
    fn test_clean_sample_clears_violations() {
        let (monitor, _) = monitor(500.0, 3);
        monitor.process_measurement(Some(700.0));
        monitor.process_measurement(Some(800.0));
        // One clean sample resets the counter.
        assert!(monitor.process_measurement(Some(50.0)));
        monitor.process_measurement(Some(700.0));
        monitor.process_measurement(Some(800.0));
        assert!(monitor.trading_allowed());
    }

    #[test]
    fn test_clean_sample_reallows_after_halt() {
        let (monitor, _) = monitor(500.0, 2);
        monitor.process_measurement(Some(700.0));
        monitor.process_measurement(Some(700.0));
        assert!(!monitor.trading_allowed());
        assert!(monitor.process_measurement(Some(10.0)));
        assert!(monitor.trading_allowed());
    }

    #[test]
    fn test_unreachable_ntp_is_soft_allowed() {
        let (monitor, _) = monitor(500.0, 1);
        assert!(monitor.process_measurement(None));
        assert!(monitor.trading_allowed());
    }

    #[test]
    fn test_history_is_bounded() {
        let (monitor, _) = monitor(1_000_000.0, 3);
        for i in 0..250 {
            monitor.process_measurement(Some(i as f64));
        }
        let stats = monitor.statistics().unwrap();
        assert_eq!(stats.samples, MAX_DRIFT_HISTORY);
        assert_eq!(stats.current_drift_ms, 249.0);
    }

    #[test]
    fn test_trend_detection() {
        let (monitor, _) = monitor(1_000_000.0, 3);
        for drift in [0.0, 20.0, 40.0, 60.0, 80.0] {
            monitor.process_measurement(Some(drift));
        }
        assert_eq!(monitor.statistics().unwrap().trend, "increasing");
    }
}
