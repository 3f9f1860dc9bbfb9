//! FudTrader Library
//!
//! Ichimoku + community-signal perpetual futures trading with a FUD-attack override

pub mod activity;
pub mod advisory;
pub mod config;
pub mod engine;
pub mod errors;
pub mod exchange;
pub mod features;
pub mod logging;
pub mod persistence;
pub mod risk;
pub mod strategy;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod types;

#[cfg(feature = "dashboard")]
pub mod dashboard;
