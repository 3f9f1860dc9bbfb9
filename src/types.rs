//! Core types used throughout FudTrader
//!
//! Defines common data structures for candles, positions, signals and community data.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Side of a perpetual position as tracked by a symbol loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionSide {
    Long,
    Short,
    Flat,
}

impl Default for PositionSide {
    fn default() -> Self {
        PositionSide::Flat
    }
}

impl PositionSide {
    /// The side a position would have to close in order to flip to `self`.
    pub fn opposite(&self) -> Self {
        match self {
            PositionSide::Long => PositionSide::Short,
            PositionSide::Short => PositionSide::Long,
            PositionSide::Flat => PositionSide::Flat,
        }
    }

    pub fn is_flat(&self) -> bool {
        matches!(self, PositionSide::Flat)
    }

    /// Parse from string ("LONG", "short", "BOTH" is treated as flat)
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "LONG" => Some(PositionSide::Long),
            "SHORT" => Some(PositionSide::Short),
            "FLAT" | "BOTH" | "" => Some(PositionSide::Flat),
            _ => None,
        }
    }
}

impl fmt::Display for PositionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionSide::Long => write!(f, "LONG"),
            PositionSide::Short => write!(f, "SHORT"),
            PositionSide::Flat => write!(f, "FLAT"),
        }
    }
}

/// Per-layer and final trading signal.
///
/// `Empty` means "no opinion" for a layer and "no position" for a final decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeSignal {
    Long,
    Short,
    Empty,
}

impl Default for TradeSignal {
    fn default() -> Self {
        TradeSignal::Empty
    }
}

impl TradeSignal {
    pub fn is_directional(&self) -> bool {
        !matches!(self, TradeSignal::Empty)
    }

    /// Position side this signal asks for, `Flat` for `Empty`.
    pub fn as_side(&self) -> PositionSide {
        match self {
            TradeSignal::Long => PositionSide::Long,
            TradeSignal::Short => PositionSide::Short,
            TradeSignal::Empty => PositionSide::Flat,
        }
    }
}

impl fmt::Display for TradeSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradeSignal::Long => write!(f, "LONG"),
            TradeSignal::Short => write!(f, "SHORT"),
            TradeSignal::Empty => write!(f, "EMPTY"),
        }
    }
}

/// OHLCV candle
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Open time in unix milliseconds
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Live position as reported by the exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangePosition {
    pub symbol: String,
    pub side: PositionSide,
    pub leverage: u32,
    pub entry_price: f64,
    /// Signed position amount (negative for shorts on one-way accounts)
    pub amount: f64,
    pub unrealized_pnl: f64,
    /// When the exchange read was taken
    pub timestamp: DateTime<Utc>,
}

/// One bucket of community message counts
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ActivityPoint {
    /// Bucket start in unix milliseconds
    pub timestamp: i64,
    pub message_count: u64,
}

/// A recent community message, fed to the close analysis as context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommunityMessage {
    #[serde(alias = "tweet_id")]
    pub id: String,
    #[serde(default, alias = "username")]
    pub author: String,
    pub text: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_side_parses_exchange_labels() {
        assert_eq!(PositionSide::from_str("long"), Some(PositionSide::Long));
        assert_eq!(PositionSide::from_str("SHORT"), Some(PositionSide::Short));
        assert_eq!(PositionSide::from_str("BOTH"), Some(PositionSide::Flat));
        assert_eq!(PositionSide::from_str("sideways"), None);
    }

    #[test]
    fn signal_maps_to_side() {
        assert_eq!(TradeSignal::Long.as_side(), PositionSide::Long);
        assert_eq!(TradeSignal::Empty.as_side(), PositionSide::Flat);
        assert!(!TradeSignal::Empty.is_directional());
        assert_eq!(PositionSide::Short.opposite(), PositionSide::Long);
    }

    #[test]
    fn sides_serialize_uppercase() {
        let json = serde_json::to_string(&PositionSide::Short).unwrap();
        assert_eq!(json, "\"SHORT\"");
        assert_eq!(TradeSignal::Empty.to_string(), "EMPTY");
    }
}
