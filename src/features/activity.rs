//! Community activity trend
//!
//! Compares the average message count of the older half of a series with
//! the recent half.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::ActivityPoint;

/// Change (in percent) at which a trend counts as sharp
pub const SHARP_CHANGE_PCT: f64 = 50.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActivityTrend {
    SharpRise,
    SharpDrop,
    Plateau,
}

impl Default for ActivityTrend {
    fn default() -> Self {
        ActivityTrend::Plateau
    }
}

impl fmt::Display for ActivityTrend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActivityTrend::SharpRise => write!(f, "SHARP_RISE"),
            ActivityTrend::SharpDrop => write!(f, "SHARP_DROP"),
            ActivityTrend::Plateau => write!(f, "PLATEAU"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ActivityAnalysis {
    pub trend: ActivityTrend,
    /// Average of the older half
    pub average_count: f64,
    /// Average of the recent half
    pub recent_average_count: f64,
    pub change_percent: f64,
}

/// Classify a series of activity buckets, oldest first.
///
/// Zero or one point is always a plateau. A zero older average yields a
/// zero change rather than an infinite one.
pub fn analyze_activity_trend(points: &[ActivityPoint]) -> ActivityAnalysis {
    match points {
        [] => ActivityAnalysis::default(),
        [only] => ActivityAnalysis {
            trend: ActivityTrend::Plateau,
            average_count: only.message_count as f64,
            recent_average_count: only.message_count as f64,
            change_percent: 0.0,
        },
        _ => {
            let (older, recent) = points.split_at(points.len() / 2);
            let older_avg = average(older);
            let recent_avg = average(recent);

            let change_percent = if older_avg > 0.0 {
                (recent_avg - older_avg) / older_avg * 100.0
            } else {
                0.0
            };

            let trend = if change_percent >= SHARP_CHANGE_PCT {
                ActivityTrend::SharpRise
            } else if change_percent <= -SHARP_CHANGE_PCT {
                ActivityTrend::SharpDrop
            } else {
                ActivityTrend::Plateau
            };

            ActivityAnalysis {
                trend,
                average_count: older_avg,
                recent_average_count: recent_avg,
                change_percent,
            }
        }
    }
}

/// FUD-tagged message series use the same halves comparison.
pub fn analyze_fud_activity_trend(points: &[ActivityPoint]) -> ActivityAnalysis {
    analyze_activity_trend(points)
}

fn average(points: &[ActivityPoint]) -> f64 {
    if points.is_empty() {
        return 0.0;
    }
    let sum: u64 = points.iter().map(|p| p.message_count).sum();
    sum as f64 / points.len() as f64
}
