//! Venue abstraction: data types, error taxonomy, the `Venue` trait the
//! engine consumes, and the simulated venue used by demo mode and tests.

pub mod error;
pub mod sim;
pub mod traits;
pub mod types;

pub use error::VenueError;
pub use sim::{SimVenue, SimVenueConfig};
pub use traits::{
    default_funding_interval_seconds, default_quote_asset, is_oneway_only, Venue,
};
pub use types::*;
