//! Exit risk controls
//!
//! Implements:
//! - Moving-average P/L exit over the snapshot history (trailing-stop surrogate)
//! - Snapshot statistics and the milestone trigger for the AI close analysis

pub mod close_analysis;
pub mod ma_exit;

pub use close_analysis::{calculate_snapshot_statistics, is_close_analysis_milestone, SnapshotStatistics};
pub use ma_exit::{evaluate_ma_exit, MovingAverageSignal};
