//! Ichimoku Kinko Hyo
//!
//! Tenkan (9), Kijun (26) and Senkou B (52) are rolling midpoints of the
//! high/low range; Senkou A is the Tenkan/Kijun midpoint. Classification
//! looks at the last two closes against the (unshifted) cloud.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::{Candle, PositionSide, TradeSignal};

pub const TENKAN_PERIOD: usize = 9;
pub const KIJUN_PERIOD: usize = 26;
pub const SENKOU_B_PERIOD: usize = 52;
/// Forward shift of the Senkou spans, backward shift of the Chikou span
pub const DISPLACEMENT: i64 = 26;

/// Minimum candles needed for a meaningful signal
pub const MIN_CANDLES: usize = SENKOU_B_PERIOD;

const NOT_ENOUGH_DATA: &str = "Not enough data for Ichimoku calculation (need at least 52 candles)";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IchimokuSignal {
    StrongLong,
    Long,
    StrongShort,
    Short,
    Neutral,
    Uncertain,
}

impl Default for IchimokuSignal {
    fn default() -> Self {
        IchimokuSignal::Neutral
    }
}

impl IchimokuSignal {
    pub fn is_bullish(&self) -> bool {
        matches!(self, IchimokuSignal::StrongLong | IchimokuSignal::Long)
    }

    pub fn is_bearish(&self) -> bool {
        matches!(self, IchimokuSignal::StrongShort | IchimokuSignal::Short)
    }

    /// Collapse to the three-valued layer signal used by the combinator
    pub fn to_trade_signal(&self) -> TradeSignal {
        if self.is_bullish() {
            TradeSignal::Long
        } else if self.is_bearish() {
            TradeSignal::Short
        } else {
            TradeSignal::Empty
        }
    }
}

impl fmt::Display for IchimokuSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IchimokuSignal::StrongLong => write!(f, "STRONG_LONG"),
            IchimokuSignal::Long => write!(f, "LONG"),
            IchimokuSignal::StrongShort => write!(f, "STRONG_SHORT"),
            IchimokuSignal::Short => write!(f, "SHORT"),
            IchimokuSignal::Neutral => write!(f, "NEUTRAL"),
            IchimokuSignal::Uncertain => write!(f, "UNCERTAIN"),
        }
    }
}

/// One point of a plotted line
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinePoint {
    pub timestamp: i64,
    pub value: f64,
}

/// Display-ready line series, one point per input candle
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IchimokuLines {
    pub tenkan: Vec<LinePoint>,
    pub kijun: Vec<LinePoint>,
    pub senkou_a: Vec<LinePoint>,
    pub senkou_b: Vec<LinePoint>,
    pub chikou: Vec<LinePoint>,
    pub price: Vec<LinePoint>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IchimokuAnalysis {
    pub signal: IchimokuSignal,
    pub last_close: f64,
    pub cloud_top: f64,
    pub cloud_bottom: f64,
    pub price_above_cloud: bool,
    pub price_below_cloud: bool,
    pub price_in_cloud: bool,
    pub bullish_cloud: bool,
    pub tenkan_above_kijun: bool,
    pub two_closes_above_cloud: bool,
    pub two_closes_below_cloud: bool,
    pub cloud_breakout_up: bool,
    pub cloud_breakout_down: bool,
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IchimokuResult {
    pub lines: IchimokuLines,
    pub analysis: IchimokuAnalysis,
}

/// Ichimoku-based exit verdict with the reasons that produced it
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClosePositionReason {
    pub should_close: bool,
    pub reasons: Vec<String>,
}

/// Compute all lines and the directional analysis for a candle series.
///
/// Short series are not an error: they yield a NEUTRAL analysis and empty lines.
pub fn calculate_ichimoku(candles: &[Candle]) -> IchimokuResult {
    if candles.len() < MIN_CANDLES {
        return IchimokuResult {
            lines: IchimokuLines::default(),
            analysis: IchimokuAnalysis {
                signal: IchimokuSignal::Neutral,
                description: NOT_ENOUGH_DATA.to_string(),
                ..Default::default()
            },
        };
    }

    let highs: Vec<f64> = candles.iter().map(|c| c.high).collect();
    let lows: Vec<f64> = candles.iter().map(|c| c.low).collect();
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();

    let tenkan = rolling_midpoint(&highs, &lows, TENKAN_PERIOD);
    let kijun = rolling_midpoint(&highs, &lows, KIJUN_PERIOD);
    let senkou_a: Vec<f64> = tenkan
        .iter()
        .zip(&kijun)
        .map(|(&t, &k)| if t == 0.0 || k == 0.0 { 0.0 } else { (t + k) / 2.0 })
        .collect();
    let senkou_b = rolling_midpoint(&highs, &lows, SENKOU_B_PERIOD);

    let lines = IchimokuLines {
        tenkan: to_line(candles, &tenkan, 0),
        kijun: to_line(candles, &kijun, 0),
        senkou_a: to_line(candles, &senkou_a, DISPLACEMENT),
        senkou_b: to_line(candles, &senkou_b, DISPLACEMENT),
        chikou: to_line(candles, &closes, -DISPLACEMENT),
        price: to_line(candles, &closes, 0),
    };

    IchimokuResult {
        lines,
        analysis: analyze(&closes, &tenkan, &kijun, &senkou_a, &senkou_b),
    }
}

/// (highest high + lowest low) / 2 over a trailing window, 0 until the window is full
fn rolling_midpoint(highs: &[f64], lows: &[f64], period: usize) -> Vec<f64> {
    (0..highs.len())
        .map(|i| {
            if i + 1 < period {
                return 0.0;
            }
            let window = i + 1 - period..=i;
            let max_high = highs[window.clone()]
                .iter()
                .copied()
                .fold(f64::MIN, f64::max);
            let min_low = lows[window].iter().copied().fold(f64::MAX, f64::min);
            (max_high + min_low) / 2.0
        })
        .collect()
}

/// Point i shows `values[i + shift]`, or 0 when that index is out of range
fn to_line(candles: &[Candle], values: &[f64], shift: i64) -> Vec<LinePoint> {
    candles
        .iter()
        .enumerate()
        .map(|(i, candle)| {
            let source = i as i64 + shift;
            let value = if source >= 0 && (source as usize) < values.len() {
                values[source as usize]
            } else {
                0.0
            };
            LinePoint {
                timestamp: candle.open_time,
                value,
            }
        })
        .collect()
}

fn analyze(
    closes: &[f64],
    tenkan: &[f64],
    kijun: &[f64],
    senkou_a: &[f64],
    senkou_b: &[f64],
) -> IchimokuAnalysis {
    let n = closes.len();
    let current = closes[n - 1];
    let previous = closes[n - 2];

    let cloud_top = senkou_a[n - 1].max(senkou_b[n - 1]);
    let cloud_bottom = senkou_a[n - 1].min(senkou_b[n - 1]);
    let prev_cloud_top = senkou_a[n - 2].max(senkou_b[n - 2]);
    let prev_cloud_bottom = senkou_a[n - 2].min(senkou_b[n - 2]);

    let price_above_cloud = current > cloud_top;
    let price_below_cloud = current < cloud_bottom;
    let bullish_cloud = senkou_a[n - 1] > senkou_b[n - 1];
    let tenkan_above_kijun = tenkan[n - 1] > kijun[n - 1];
    let prev_in_cloud = previous >= prev_cloud_bottom && previous <= prev_cloud_top;

    let mut analysis = IchimokuAnalysis {
        signal: IchimokuSignal::Neutral,
        last_close: current,
        cloud_top,
        cloud_bottom,
        price_above_cloud,
        price_below_cloud,
        price_in_cloud: !price_above_cloud && !price_below_cloud,
        bullish_cloud,
        tenkan_above_kijun,
        two_closes_above_cloud: price_above_cloud && previous > prev_cloud_top,
        two_closes_below_cloud: price_below_cloud && previous < prev_cloud_bottom,
        cloud_breakout_up: prev_in_cloud && price_above_cloud,
        cloud_breakout_down: prev_in_cloud && price_below_cloud,
        description: String::new(),
    };

    let (signal, description) = classify(&analysis);
    analysis.signal = signal;
    analysis.description = description.to_string();
    analysis
}

/// First matching rule wins.
fn classify(a: &IchimokuAnalysis) -> (IchimokuSignal, &'static str) {
    use IchimokuSignal::*;

    if a.cloud_breakout_up && a.bullish_cloud {
        (StrongLong, "Strong LONG: Price broke out above cloud with bullish cloud color")
    } else if a.two_closes_above_cloud && a.tenkan_above_kijun {
        (StrongLong, "Strong LONG: Two closes above cloud + Tenkan above Kijun")
    } else if a.price_above_cloud && a.tenkan_above_kijun {
        (Long, "LONG: Price above cloud and Tenkan above Kijun")
    } else if a.price_above_cloud {
        (Long, "LONG: Price above cloud")
    } else if a.cloud_breakout_down && !a.bullish_cloud {
        (StrongShort, "Strong SHORT: Price broke down below cloud with bearish cloud color")
    } else if a.two_closes_below_cloud && !a.tenkan_above_kijun {
        (StrongShort, "Strong SHORT: Two closes below cloud + Tenkan below Kijun")
    } else if a.price_below_cloud && !a.tenkan_above_kijun {
        (Short, "SHORT: Price below cloud and Tenkan below Kijun")
    } else if a.price_below_cloud {
        (Short, "SHORT: Price below cloud")
    } else if a.price_in_cloud {
        (Uncertain, "UNCERTAIN: Price is inside cloud - no clear signal")
    } else {
        (Neutral, "NEUTRAL: No clear signal")
    }
}

/// Exit rules for an open position based on the coin's own cloud.
///
/// A LONG closes when the coin turns bearish or price drops under the cloud;
/// a SHORT mirrors that.
pub fn close_reason(coin: &IchimokuAnalysis, side: PositionSide) -> ClosePositionReason {
    let mut reasons = Vec::new();

    match side {
        PositionSide::Long => {
            if coin.signal.is_bearish() {
                reasons.push(format!("Coin Ichimoku turned {}: {}", coin.signal, coin.description));
            }
            if coin.price_below_cloud {
                reasons.push(format!(
                    "Price {:.6} closed below cloud bottom {:.6}",
                    coin.last_close, coin.cloud_bottom
                ));
            }
        }
        PositionSide::Short => {
            if coin.signal.is_bullish() {
                reasons.push(format!("Coin Ichimoku turned {}: {}", coin.signal, coin.description));
            }
            if coin.price_above_cloud {
                reasons.push(format!(
                    "Price {:.6} closed above cloud top {:.6}",
                    coin.last_close, coin.cloud_top
                ));
            }
        }
        PositionSide::Flat => {}
    }

    ClosePositionReason {
        should_close: !reasons.is_empty(),
        reasons,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(i: usize, close: f64, spread: f64) -> Candle {
        Candle {
            open_time: i as i64 * 3_600_000,
            open: close,
            high: close + spread,
            low: close - spread,
            close,
            volume: 1_000.0,
        }
    }

    fn series(closes: &[f64]) -> Vec<Candle> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| candle(i, c, 0.5))
            .collect()
    }

    fn rising(n: usize) -> Vec<Candle> {
        series(&(0..n).map(|i| 100.0 + i as f64).collect::<Vec<_>>())
    }

    fn falling(n: usize) -> Vec<Candle> {
        series(&(0..n).map(|i| 500.0 - i as f64).collect::<Vec<_>>())
    }

    #[test]
    fn short_series_is_neutral_with_note() {
        for len in [0, 1, 26, 51] {
            let result = calculate_ichimoku(&rising(len));
            assert_eq!(result.analysis.signal, IchimokuSignal::Neutral);
            assert_eq!(result.analysis.description, NOT_ENOUGH_DATA);
            assert!(result.lines.tenkan.is_empty());
            assert_eq!(result.analysis.cloud_top, 0.0);
        }
    }

    #[test]
    fn rising_series_never_signals_short() {
        for len in [52, 53, 80, 200, 350] {
            let result = calculate_ichimoku(&rising(len));
            assert!(
                !result.analysis.signal.is_bearish(),
                "len {len} gave {}",
                result.analysis.signal
            );
            assert!(result.analysis.price_above_cloud);
        }
    }

    #[test]
    fn steady_uptrend_is_strong_long() {
        let analysis = calculate_ichimoku(&rising(120)).analysis;
        assert!(analysis.two_closes_above_cloud);
        assert!(analysis.tenkan_above_kijun);
        assert_eq!(analysis.signal, IchimokuSignal::StrongLong);
    }

    #[test]
    fn steady_downtrend_is_strong_short() {
        let analysis = calculate_ichimoku(&falling(120)).analysis;
        assert!(analysis.price_below_cloud);
        assert!(!analysis.tenkan_above_kijun);
        assert_eq!(analysis.signal, IchimokuSignal::StrongShort);
        assert_eq!(analysis.signal.to_trade_signal(), TradeSignal::Short);
    }

    #[test]
    fn flat_series_sits_in_cloud() {
        let analysis = calculate_ichimoku(&series(&[100.0; 60])).analysis;
        assert!(analysis.price_in_cloud);
        assert_eq!(analysis.signal, IchimokuSignal::Uncertain);
        assert_eq!(analysis.signal.to_trade_signal(), TradeSignal::Empty);
    }

    #[test]
    fn breakout_from_flat_cloud_is_detected() {
        // flat range then a jump; the cloud is flat so not bullish, the
        // breakout still lands above it
        let mut closes = vec![100.0; 60];
        closes.push(110.0);
        let analysis = calculate_ichimoku(&series(&closes)).analysis;
        assert!(analysis.cloud_breakout_up);
        assert!(analysis.price_above_cloud);
        assert!(analysis.signal.is_bullish());
    }

    #[test]
    fn midpoints_follow_window_lengths() {
        let candles = rising(60);
        let result = calculate_ichimoku(&candles);
        // tenkan at index 8 covers closes 100..=108 with spread 0.5
        assert_eq!(result.lines.tenkan[7].value, 0.0);
        assert!((result.lines.tenkan[8].value - 104.0).abs() < 1e-9);
        assert_eq!(result.lines.kijun[24].value, 0.0);
        assert!((result.lines.kijun[25].value - 112.5).abs() < 1e-9);
    }

    #[test]
    fn displaced_lines_pad_with_zero() {
        let result = calculate_ichimoku(&rising(60));
        let n = result.lines.senkou_b.len();
        // senkou spans shift forward: the last 26 points have nothing to show
        assert_eq!(result.lines.senkou_b[n - 1].value, 0.0);
        // chikou shifts backward: the first 26 points have nothing to show
        assert_eq!(result.lines.chikou[0].value, 0.0);
        assert!((result.lines.chikou[26].value - 100.0).abs() < 1e-9);
        assert_eq!(result.lines.price.len(), 60);
    }

    #[test]
    fn close_reason_for_long_on_bearish_coin() {
        let coin = calculate_ichimoku(&falling(120)).analysis;
        let reason = close_reason(&coin, PositionSide::Long);
        assert!(reason.should_close);
        assert_eq!(reason.reasons.len(), 2);

        let hold = close_reason(&coin, PositionSide::Short);
        assert!(!hold.should_close);
        assert!(hold.reasons.is_empty());
    }

    #[test]
    fn close_reason_is_empty_when_flat() {
        let coin = calculate_ichimoku(&rising(120)).analysis;
        assert_eq!(close_reason(&coin, PositionSide::Flat), ClosePositionReason::default());
    }
}
