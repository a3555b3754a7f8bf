//! The lifecycle engine and its arbitrage entity.

pub mod arbitrage;
pub mod lifecycle;

pub use arbitrage::{ArbState, Arbitrage, Leg, MAX_ARCHIVED_PER_TOKEN, MAX_FUNDING_PAYMENTS};
pub use lifecycle::{EngineCommand, EngineDeps, EngineStatus, EngineStatusSnapshot, LifecycleEngine};
