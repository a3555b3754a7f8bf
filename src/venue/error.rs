//! Venue error taxonomy.
//!
//! Every fallible venue call returns one of these kinds so the engine can
//! route failures: transient kinds feed the error-series circuit breaker
//! and retry, auth failures disable the venue for the tick, missing data
//! degrades the opportunity to not-profitable instead of crashing.

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum VenueError {
    #[error("request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("rate limited by venue")]
    RateLimited,

    #[error("malformed venue response: {0}")]
    Parse(String),

    #[error("venue does not support the requested leverage")]
    UnsupportedLeverage,

    #[error("venue does not support the requested position mode")]
    UnsupportedMode,

    /// Missing-data sentinel: price, fee, balance or book not available.
    #[error("{0} unavailable")]
    Unavailable(&'static str),

    #[error("order rejected: {0}")]
    OrderRejected(String),
}

impl VenueError {
    /// Transient failures are retried with backoff and feed the
    /// error-series breaker.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            VenueError::Timeout | VenueError::Network(_) | VenueError::RateLimited
        )
    }

    /// Whether this failure should count toward the error-series breaker.
    /// Unsupported capabilities and missing data are expected conditions.
    pub fn feeds_error_breaker(&self) -> bool {
        !matches!(
            self,
            VenueError::UnsupportedLeverage
                | VenueError::UnsupportedMode
                | VenueError::Unavailable(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(VenueError::Timeout.is_transient());
        assert!(VenueError::RateLimited.is_transient());
        assert!(!VenueError::Auth("bad key".into()).is_transient());
        assert!(!VenueError::UnsupportedMode.is_transient());
    }

    #[test]
    fn test_breaker_classification() {
        assert!(VenueError::Timeout.feeds_error_breaker());
        assert!(VenueError::Parse("truncated".into()).feeds_error_breaker());
        assert!(!VenueError::Unavailable("mid price").feeds_error_breaker());
        assert!(!VenueError::UnsupportedLeverage.feeds_error_breaker());
    }
}
