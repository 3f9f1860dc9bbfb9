use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::ExitConfig;
use crate::persistence::PositionSnapshot;

/// Moving-average exit verdict for an open position
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MovingAverageSignal {
    pub should_close: bool,
    pub current_pnl: f64,
    pub moving_average: f64,
    pub threshold: f64,
    pub percent_below_ma: f64,
    pub snapshots_count: usize,
    pub trigger_reason: String,
}

/// Compare current P/L with the mean unrealized P/L of every snapshot so far.
///
/// Inactive below `ma_min_snapshots` and whenever the average is not positive.
pub fn evaluate_ma_exit(
    snapshots: &[PositionSnapshot],
    current_pnl: f64,
    cfg: &ExitConfig,
) -> MovingAverageSignal {
    let mut signal = MovingAverageSignal {
        current_pnl,
        snapshots_count: snapshots.len(),
        ..Default::default()
    };

    if snapshots.is_empty() || snapshots.len() < cfg.ma_min_snapshots {
        signal.trigger_reason = format!(
            "Not enough snapshots for analysis ({} of {} required)",
            snapshots.len(),
            cfg.ma_min_snapshots
        );
        return signal;
    }

    let moving_average =
        snapshots.iter().map(|s| s.unrealized_pnl).sum::<f64>() / snapshots.len() as f64;
    signal.moving_average = moving_average;

    if moving_average <= 0.0 {
        signal.trigger_reason = "Moving average is zero or negative, no exit signal".into();
        return signal;
    }

    let threshold = moving_average * cfg.ma_threshold_ratio;
    signal.threshold = threshold;
    signal.percent_below_ma = (moving_average - current_pnl) / moving_average.abs() * 100.0;

    if current_pnl <= 0.0 {
        signal.should_close = true;
        signal.trigger_reason = "P/L turned negative while the moving average is positive".into();
    } else if current_pnl < threshold {
        signal.should_close = true;
        signal.trigger_reason = format!(
            "P/L fell below {:.0}% of its moving average",
            cfg.ma_threshold_ratio * 100.0
        );
    } else {
        signal.trigger_reason = "P/L within range of its moving average".into();
    }

    if signal.should_close {
        warn!(
            current_pnl,
            moving_average,
            threshold,
            percent_below = %format!("{:.1}", signal.percent_below_ma),
            "⚠️ MA exit signal"
        );
    }

    signal
}
