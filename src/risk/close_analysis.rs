//! Snapshot statistics fed to the AI close analysis

use serde::{Deserialize, Serialize};

use crate::persistence::PositionSnapshot;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotStatistics {
    pub total_count: usize,
    pub min_pnl: f64,
    pub max_pnl: f64,
    pub mean_pnl: f64,
    pub median_pnl: f64,
    pub quantile_99_pnl: f64,
    pub quantile_01_pnl: f64,
}

/// Distribution of unrealized P/L across the snapshot history.
///
/// An empty history yields all zeros.
pub fn calculate_snapshot_statistics(snapshots: &[PositionSnapshot]) -> SnapshotStatistics {
    if snapshots.is_empty() {
        return SnapshotStatistics::default();
    }

    let mut pnls: Vec<f64> = snapshots.iter().map(|s| s.unrealized_pnl).collect();
    pnls.sort_by(|a, b| a.total_cmp(b));
    let n = pnls.len();

    let median = if n % 2 == 0 {
        (pnls[n / 2 - 1] + pnls[n / 2]) / 2.0
    } else {
        pnls[n / 2]
    };
    let q99 = ((n as f64 * 0.99).ceil() as usize).min(n - 1);
    let q01 = ((n as f64 * 0.01).floor() as usize).min(n - 1);

    SnapshotStatistics {
        total_count: n,
        min_pnl: pnls[0],
        max_pnl: pnls[n - 1],
        mean_pnl: pnls.iter().sum::<f64>() / n as f64,
        median_pnl: median,
        quantile_99_pnl: pnls[q99],
        quantile_01_pnl: pnls[q01],
    }
}

/// Every `every`-th snapshot triggers a close analysis
pub fn is_close_analysis_milestone(snapshot_count: usize, every: usize) -> bool {
    every > 0 && snapshot_count > 0 && snapshot_count % every == 0
}
