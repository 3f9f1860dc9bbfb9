//! Market and community features
//!
//! - Ichimoku cloud lines, directional signal and exit rules
//! - Activity trend over community message counts

pub mod activity;
pub mod ichimoku;

pub use activity::{analyze_activity_trend, analyze_fud_activity_trend, ActivityAnalysis, ActivityTrend};
pub use ichimoku::{
    calculate_ichimoku, close_reason, ClosePositionReason, IchimokuAnalysis, IchimokuLines,
    IchimokuResult, IchimokuSignal, LinePoint,
};
