//! Funding-settlement scheduling.
//!
//! Per-venue settlement calendars answer "safe to open?" and "must
//! close?" by proximity to the next funding settlement. Most venues
//! settle three times a day at 00:00/08:00/16:00 UTC; Hyperliquid settles
//! hourly.

use chrono::{DateTime, Duration as ChronoDuration, NaiveTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use tracing::warn;

use crate::venue::VenueId;

/// Settlement window status, ordered least to most restrictive for
/// aggregation purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementStatus {
    SafeToOpen,
    ClosingWindow,
    PostSettlement,
    SettlementImminent,
}

/// Fixed extra margin before the hard pre-settlement buffer during which
/// mature positions should start closing.
const CLOSING_WINDOW_EXTRA_MINUTES: i64 = 15;

/// Settlement calendar for one venue.
#[derive(Debug, Clone)]
pub struct VenueCalendar {
    pub settlement_times: Vec<NaiveTime>,
    pub pre_settlement_buffer_minutes: i64,
    pub post_settlement_delay_minutes: i64,
}

impl VenueCalendar {
    fn three_per_day(pre_buffer: i64, post_delay: i64) -> Self {
        Self {
            settlement_times: [0u32, 8, 16]
                .iter()
                .map(|h| NaiveTime::from_hms_opt(*h, 0, 0).expect("valid time"))
                .collect(),
            pre_settlement_buffer_minutes: pre_buffer,
            post_settlement_delay_minutes: post_delay,
        }
    }

    fn hourly(pre_buffer: i64, post_delay: i64) -> Self {
        Self {
            settlement_times: (0..24)
                .map(|h| NaiveTime::from_hms_opt(h, 0, 0).expect("valid time"))
                .collect(),
            pre_settlement_buffer_minutes: pre_buffer,
            post_settlement_delay_minutes: post_delay,
        }
    }

    /// Next settlement at or after `now`, searching today then tomorrow.
    fn next_settlement(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let today = now.date_naive();
        let mut candidates: Vec<DateTime<Utc>> = self
            .settlement_times
            .iter()
            .map(|t| today.and_time(*t).and_utc())
            .filter(|ts| *ts > now)
            .collect();
        if candidates.is_empty() {
            let tomorrow = today + ChronoDuration::days(1);
            candidates = self
                .settlement_times
                .iter()
                .map(|t| tomorrow.and_time(*t).and_utc())
                .collect();
        }
        candidates.into_iter().min().expect("non-empty calendar")
    }

    /// Most recent settlement at or before `now`.
    fn previous_settlement(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let today = now.date_naive();
        let mut candidates: Vec<DateTime<Utc>> = self
            .settlement_times
            .iter()
            .map(|t| today.and_time(*t).and_utc())
            .filter(|ts| *ts <= now)
            .collect();
        if candidates.is_empty() {
            let yesterday = today - ChronoDuration::days(1);
            candidates = self
                .settlement_times
                .iter()
                .map(|t| yesterday.and_time(*t).and_utc())
                .collect();
        }
        candidates.into_iter().max().expect("non-empty calendar")
    }

    fn status_at(&self, now: DateTime<Utc>) -> (SettlementStatus, i64) {
        let next = self.next_settlement(now);
        let prev = self.previous_settlement(now);
        let minutes_until = (next - now).num_minutes();
        let minutes_since = (now - prev).num_minutes();

        let status = if minutes_since <= self.post_settlement_delay_minutes {
            SettlementStatus::PostSettlement
        } else if minutes_until <= self.pre_settlement_buffer_minutes {
            SettlementStatus::SettlementImminent
        } else if minutes_until <= self.pre_settlement_buffer_minutes + CLOSING_WINDOW_EXTRA_MINUTES
        {
            SettlementStatus::ClosingWindow
        } else {
            SettlementStatus::SafeToOpen
        };
        (status, minutes_until)
    }
}

fn default_calendar(venue: &str) -> Option<VenueCalendar> {
    let calendar = if venue.starts_with("hyperliquid") {
        VenueCalendar::hourly(3, 2)
    } else if venue.starts_with("binance") {
        VenueCalendar::three_per_day(3, 2)
    } else if venue.starts_with("bybit") || venue.starts_with("gate") {
        VenueCalendar::three_per_day(5, 3)
    } else if venue.starts_with("okx") {
        VenueCalendar::three_per_day(4, 2)
    } else if venue.starts_with("kucoin") {
        VenueCalendar::three_per_day(6, 3)
    } else if venue.starts_with("bitget")
        || venue.starts_with("mexc")
        || venue.starts_with("phemex")
        || venue.starts_with("bingx")
    {
        VenueCalendar::three_per_day(5, 3)
    } else {
        return None;
    };
    Some(calendar)
}

/// Per-venue settlement calendars and the window logic over them.
#[derive(Debug, Default)]
pub struct SettlementScheduler {
    calendars: HashMap<String, VenueCalendar>,
}

impl SettlementScheduler {
    /// Scheduler seeded with built-in calendars for the given venues.
    pub fn for_venues<'a>(venues: impl IntoIterator<Item = &'a str>) -> Self {
        let mut scheduler = Self::default();
        for venue in venues {
            if let Some(calendar) = default_calendar(venue) {
                scheduler.calendars.insert(venue.to_string(), calendar);
            } else {
                warn!(venue, "no settlement calendar known, venue unscheduled");
            }
        }
        scheduler
    }

    pub fn register_calendar(&mut self, venue: impl Into<String>, calendar: VenueCalendar) {
        self.calendars.insert(venue.into(), calendar);
    }

    /// Combined status across venues (most restrictive wins) plus the
    /// minutes to next settlement per venue.
    pub fn status(
        &self,
        venues: &[VenueId],
        now: DateTime<Utc>,
    ) -> (SettlementStatus, HashMap<VenueId, i64>) {
        let mut minutes_map = HashMap::new();
        let mut statuses = Vec::new();

        for venue in venues {
            let Some(calendar) = self.calendars.get(venue.as_str()) else {
                warn!(venue = %venue, "no settlement calendar for venue");
                continue;
            };
            let (status, minutes) = calendar.status_at(now);
            minutes_map.insert(venue.clone(), minutes);
            statuses.push(status);
        }

        let overall = if statuses.contains(&SettlementStatus::SettlementImminent) {
            SettlementStatus::SettlementImminent
        } else if statuses.contains(&SettlementStatus::PostSettlement) {
            SettlementStatus::PostSettlement
        } else if statuses.contains(&SettlementStatus::ClosingWindow) {
            SettlementStatus::ClosingWindow
        } else {
            SettlementStatus::SafeToOpen
        };
        (overall, minutes_map)
    }

    /// Whether it is safe to open a position across `venues` with at
    /// least `min_time_horizon_minutes` before any settlement.
    pub fn should_open(
        &self,
        venues: &[VenueId],
        min_time_horizon_minutes: i64,
        now: DateTime<Utc>,
    ) -> (bool, String) {
        let (status, minutes_map) = self.status(venues, now);
        match status {
            SettlementStatus::SettlementImminent => {
                return (false, "settlement imminent on one or more venues".to_string())
            }
            SettlementStatus::PostSettlement => {
                return (
                    false,
                    "recently settled, waiting for fresh funding data".to_string(),
                )
            }
            SettlementStatus::ClosingWindow => {
                return (false, "inside closing window before settlement".to_string())
            }
            SettlementStatus::SafeToOpen => {}
        }
        // Venues without calendars impose no horizon constraint.
        let min_remaining = minutes_map.values().copied().min().unwrap_or(i64::MAX);
        if min_remaining < min_time_horizon_minutes {
            return (
                false,
                format!(
                    "insufficient time horizon: {min_remaining}m < {min_time_horizon_minutes}m required"
                ),
            );
        }
        if min_remaining == i64::MAX {
            return (true, "safe to open, no scheduled settlements".to_string());
        }
        (true, format!("safe to open, {min_remaining}m to next settlement"))
    }

    /// Whether settlement timing forces a close. Settlement-imminent
    /// always closes; a mature position also closes inside the closing
    /// window.
    pub fn should_close(
        &self,
        venues: &[VenueId],
        position_age_minutes: f64,
        min_hold_minutes: i64,
        now: DateTime<Utc>,
    ) -> (bool, String) {
        let (status, minutes_map) = self.status(venues, now);
        if status == SettlementStatus::SettlementImminent {
            return (true, "settlement imminent, closing positions".to_string());
        }
        if position_age_minutes < min_hold_minutes as f64 {
            return (
                false,
                format!(
                    "position too young: {position_age_minutes:.1}m < {min_hold_minutes}m minimum"
                ),
            );
        }
        if status == SettlementStatus::ClosingWindow {
            let min_remaining = minutes_map.values().copied().min().unwrap_or(0);
            return (
                true,
                format!("entering settlement window, {min_remaining}m remaining"),
            );
        }
        (false, "no timing-based reason to close".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, hour, minute, 0).unwrap()
    }

    fn scheduler() -> SettlementScheduler {
        SettlementScheduler::for_venues(["binance_perpetual", "hyperliquid_perpetual"])
    }

    #[test]
    fn test_safe_mid_window() {
        let s = scheduler();
        let venues = [VenueId::from("binance_perpetual")];
        let (status, minutes) = s.status(&venues, at(12, 0));
        assert_eq!(status, SettlementStatus::SafeToOpen);
        assert_eq!(minutes[&venues[0]], 240); // 16:00 is 4h away
    }

    #[test]
    fn test_settlement_imminent_inside_buffer() {
        let s = scheduler();
        let venues = [VenueId::from("binance_perpetual")];
        // 15:58 is 2 minutes before settlement with a 3-minute buffer.
        let (status, _) = s.status(&venues, at(15, 58));
        assert_eq!(status, SettlementStatus::SettlementImminent);
    }

    #[test]
    fn test_closing_window_before_buffer() {
        let s = scheduler();
        let venues = [VenueId::from("binance_perpetual")];
        // 15:50: 10 minutes out, inside buffer(3) + 15.
        let (status, _) = s.status(&venues, at(15, 50));
        assert_eq!(status, SettlementStatus::ClosingWindow);
    }

    #[test]
    fn test_post_settlement_right_after() {
        let s = scheduler();
        let venues = [VenueId::from("binance_perpetual")];
        let (status, _) = s.status(&venues, at(16, 1));
        assert_eq!(status, SettlementStatus::PostSettlement);
    }

    #[test]
    fn test_hourly_venue_dominates_aggregation() {
        let s = scheduler();
        let venues = [
            VenueId::from("binance_perpetual"),
            VenueId::from("hyperliquid_perpetual"),
        ];
        // 12:58 is fine for Binance (16:00 next) but imminent for the
        // hourly venue (13:00 next, 3m buffer).
        let (status, _) = s.status(&venues, at(12, 58));
        assert_eq!(status, SettlementStatus::SettlementImminent);
    }

    #[test]
    fn test_should_open_requires_horizon() {
        let s = scheduler();
        let venues = [VenueId::from("binance_perpetual")];
        let (ok, _) = s.should_open(&venues, 30, at(12, 0));
        assert!(ok);
        let (ok, reason) = s.should_open(&venues, 300, at(12, 0));
        assert!(!ok);
        assert!(reason.contains("insufficient time horizon"));
    }

    #[test]
    fn test_should_close_respects_min_hold_in_closing_window() {
        let s = scheduler();
        let venues = [VenueId::from("binance_perpetual")];
        // Inside closing window but too young to close.
        let (close, _) = s.should_close(&venues, 5.0, 10, at(15, 50));
        assert!(!close);
        // Mature position closes in the window.
        let (close, _) = s.should_close(&venues, 45.0, 10, at(15, 50));
        assert!(close);
    }

    #[test]
    fn test_should_close_on_imminent_ignores_min_hold() {
        let s = scheduler();
        let venues = [VenueId::from("binance_perpetual")];
        let (close, reason) = s.should_close(&venues, 1.0, 10, at(15, 58));
        assert!(close);
        assert!(reason.contains("settlement imminent"));
    }

    #[test]
    fn test_rollover_to_next_day() {
        let s = scheduler();
        let venues = [VenueId::from("binance_perpetual")];
        let (_, minutes) = s.status(&venues, at(23, 0));
        assert_eq!(minutes[&venues[0]], 60); // 00:00 tomorrow
    }
}
