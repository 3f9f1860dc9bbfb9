//! Signal combinator
//!
//! Five layers are read in fixed order and folded left to right. The two
//! Ichimoku layers seed the working signal; every later layer abstains,
//! agrees or disagrees, and a disagreement collapses the result to EMPTY
//! for good.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::advisory::{SentimentResult, SentimentTrend};
use crate::features::{ActivityAnalysis, ActivityTrend, IchimokuAnalysis};
use crate::persistence::TradingDecisionRecord;
use crate::types::TradeSignal;

/// Sentiment at or above this never reads as bearish
pub const BEARISH_SENTIMENT_BELOW: i32 = 3;

pub const REASON_NO_ICHIMOKU_SIGNAL: &str = "no_ichimoku_signal";
pub const REASON_ICHIMOKU_CONFLICT: &str = "ichimoku_conflict";
pub const REASON_SIGNALS_ALIGNED: &str = "signals_aligned";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    BtcIchimoku,
    CoinIchimoku,
    Activity,
    FudActivity,
    Sentiment,
}

impl Layer {
    /// Layers that can only confirm or veto the Ichimoku signal, in fold order
    pub const CONFIRMATORY: [Layer; 3] = [Layer::Activity, Layer::FudActivity, Layer::Sentiment];

    fn conflict_reason(&self) -> &'static str {
        match self {
            Layer::BtcIchimoku | Layer::CoinIchimoku => REASON_ICHIMOKU_CONFLICT,
            Layer::Activity => "activity_conflict",
            Layer::FudActivity => "fud_activity_conflict",
            Layer::Sentiment => "sentiment_conflict",
        }
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Layer::BtcIchimoku => write!(f, "BTC Ichimoku"),
            Layer::CoinIchimoku => write!(f, "coin Ichimoku"),
            Layer::Activity => write!(f, "activity"),
            Layer::FudActivity => write!(f, "FUD activity"),
            Layer::Sentiment => write!(f, "sentiment"),
        }
    }
}

/// How a confirmatory layer related to the working signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerVerdict {
    Abstain,
    Agree,
    Disagree,
    /// Not evaluated because an earlier layer collapsed the decision
    Skipped,
}

/// Per-layer signals for one cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct LayerSignals {
    pub btc_ichimoku: TradeSignal,
    pub coin_ichimoku: TradeSignal,
    pub activity: TradeSignal,
    pub fud_activity: TradeSignal,
    pub sentiment: TradeSignal,
}

impl LayerSignals {
    pub fn read(
        btc: &IchimokuAnalysis,
        coin: &IchimokuAnalysis,
        activity: &ActivityAnalysis,
        fud_activity: &ActivityAnalysis,
        sentiment: Option<&SentimentResult>,
    ) -> Self {
        Self {
            btc_ichimoku: btc.signal.to_trade_signal(),
            coin_ichimoku: coin.signal.to_trade_signal(),
            activity: activity_signal(activity),
            fud_activity: fud_activity_signal(fud_activity),
            sentiment: sentiment.map(sentiment_signal).unwrap_or_default(),
        }
    }

    pub fn get(&self, layer: Layer) -> TradeSignal {
        match layer {
            Layer::BtcIchimoku => self.btc_ichimoku,
            Layer::CoinIchimoku => self.coin_ichimoku,
            Layer::Activity => self.activity,
            Layer::FudActivity => self.fud_activity,
            Layer::Sentiment => self.sentiment,
        }
    }
}

/// Rising chatter reads bullish, collapsing chatter bearish
pub fn activity_signal(analysis: &ActivityAnalysis) -> TradeSignal {
    match analysis.trend {
        ActivityTrend::SharpRise => TradeSignal::Long,
        ActivityTrend::SharpDrop => TradeSignal::Short,
        ActivityTrend::Plateau => TradeSignal::Empty,
    }
}

/// Only a surge of FUD-tagged messages has an opinion
pub fn fud_activity_signal(analysis: &ActivityAnalysis) -> TradeSignal {
    match analysis.trend {
        ActivityTrend::SharpRise => TradeSignal::Short,
        ActivityTrend::SharpDrop | ActivityTrend::Plateau => TradeSignal::Empty,
    }
}

/// Sentiment can veto a LONG but never asks for one
pub fn sentiment_signal(sentiment: &SentimentResult) -> TradeSignal {
    if sentiment.sentiment_trend == SentimentTrend::Declining
        && sentiment.overall_sentiment < BEARISH_SENTIMENT_BELOW
    {
        TradeSignal::Short
    } else {
        TradeSignal::Empty
    }
}

/// Identity of a decision's content, used for dedup and the rejection cooldown
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DecisionKey {
    pub layers: LayerSignals,
    pub fud_attack: bool,
    pub final_signal: TradeSignal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradingDecision {
    pub layers: LayerSignals,
    pub verdicts: Vec<(Layer, LayerVerdict)>,
    /// A fresh FUD attack was on record when the decision was made
    pub fud_attack: bool,
    pub final_signal: TradeSignal,
    pub reason: String,
    pub explanation: String,
}

impl TradingDecision {
    /// Decision imposed by the FUD override instead of the fold
    pub fn forced(
        layers: LayerSignals,
        final_signal: TradeSignal,
        reason: &str,
        explanation: impl Into<String>,
    ) -> Self {
        Self {
            layers,
            verdicts: Vec::new(),
            fud_attack: true,
            final_signal,
            reason: reason.to_string(),
            explanation: explanation.into(),
        }
    }

    pub fn with_fud_attack(mut self, fud_attack: bool) -> Self {
        self.fud_attack = fud_attack;
        self
    }

    pub fn key(&self) -> DecisionKey {
        DecisionKey {
            layers: self.layers,
            fud_attack: self.fud_attack,
            final_signal: self.final_signal,
        }
    }

    /// Audit row; the store assigns the id
    pub fn to_record(&self, symbol: &str, now: DateTime<Utc>) -> TradingDecisionRecord {
        TradingDecisionRecord {
            id: 0,
            position_uuid: None,
            symbol: symbol.to_string(),
            btc_ichimoku: self.layers.btc_ichimoku.to_string(),
            coin_ichimoku: self.layers.coin_ichimoku.to_string(),
            activity: self.layers.activity.to_string(),
            fud_activity: self.layers.fud_activity.to_string(),
            sentiment: self.layers.sentiment.to_string(),
            fud_attack: if self.fud_attack { "yes" } else { "no" }.to_string(),
            final_decision: self.final_signal.to_string(),
            reason: self.reason.clone(),
            explanation: self.explanation.clone(),
            created_at: now,
        }
    }
}

/// Fold the layers into one decision
pub fn combine(layers: LayerSignals) -> TradingDecision {
    let (btc, coin) = (layers.btc_ichimoku, layers.coin_ichimoku);
    let mut verdicts = Vec::with_capacity(5);

    let seed = match (btc, coin) {
        (TradeSignal::Empty, TradeSignal::Empty) => Err((
            REASON_NO_ICHIMOKU_SIGNAL,
            "Neither BTC nor coin Ichimoku is directional".to_string(),
        )),
        (a, b) if a.is_directional() && b.is_directional() && a != b => Err((
            REASON_ICHIMOKU_CONFLICT,
            format!("BTC Ichimoku says {a}, coin Ichimoku says {b}"),
        )),
        (a, TradeSignal::Empty) => Ok(a),
        (_, b) => Ok(b),
    };

    let working = match seed {
        Ok(signal) => signal,
        Err((reason, explanation)) => {
            verdicts.extend(Layer::CONFIRMATORY.iter().map(|l| (*l, LayerVerdict::Skipped)));
            return TradingDecision {
                layers,
                verdicts,
                fud_attack: false,
                final_signal: TradeSignal::Empty,
                reason: reason.to_string(),
                explanation,
            };
        }
    };

    let folded = Layer::CONFIRMATORY.iter().try_fold(working, |signal, layer| {
        let reading = layers.get(*layer);
        let verdict = if !reading.is_directional() {
            LayerVerdict::Abstain
        } else if reading == signal {
            LayerVerdict::Agree
        } else {
            LayerVerdict::Disagree
        };
        verdicts.push((*layer, verdict));
        match verdict {
            LayerVerdict::Disagree => Err((*layer, reading)),
            _ => Ok(signal),
        }
    });

    match folded {
        Ok(signal) => {
            let agreeing: Vec<String> = verdicts
                .iter()
                .filter(|(_, v)| *v == LayerVerdict::Agree)
                .map(|(l, _)| l.to_string())
                .collect();
            let explanation = if agreeing.is_empty() {
                format!("Ichimoku says {signal}, confirmatory layers abstain")
            } else {
                format!("Ichimoku says {signal}, confirmed by {}", agreeing.join(", "))
            };
            TradingDecision {
                layers,
                verdicts,
                fud_attack: false,
                final_signal: signal,
                reason: REASON_SIGNALS_ALIGNED.to_string(),
                explanation,
            }
        }
        Err((layer, reading)) => {
            let evaluated = verdicts.len();
            verdicts.extend(
                Layer::CONFIRMATORY[evaluated..]
                    .iter()
                    .map(|l| (*l, LayerVerdict::Skipped)),
            );
            TradingDecision {
                layers,
                verdicts,
                fud_attack: false,
                final_signal: TradeSignal::Empty,
                reason: layer.conflict_reason().to_string(),
                explanation: format!("Ichimoku says {working}, {layer} says {reading}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use TradeSignal::{Empty, Long, Short};

    fn layers(btc: TradeSignal, coin: TradeSignal, act: TradeSignal, fud: TradeSignal, sent: TradeSignal) -> LayerSignals {
        LayerSignals {
            btc_ichimoku: btc,
            coin_ichimoku: coin,
            activity: act,
            fud_activity: fud,
            sentiment: sent,
        }
    }

    #[test]
    fn aligned_ichimoku_with_abstaining_layers_passes() {
        let decision = combine(layers(Long, Long, Empty, Empty, Empty));
        assert_eq!(decision.final_signal, Long);
        assert_eq!(decision.reason, REASON_SIGNALS_ALIGNED);
        assert!(decision
            .verdicts
            .iter()
            .all(|(_, v)| *v == LayerVerdict::Abstain));
    }

    #[test]
    fn single_directional_ichimoku_wins() {
        assert_eq!(combine(layers(Empty, Short, Empty, Empty, Empty)).final_signal, Short);
        assert_eq!(combine(layers(Long, Empty, Empty, Empty, Empty)).final_signal, Long);
    }

    #[test]
    fn no_ichimoku_signal_is_empty() {
        let decision = combine(layers(Empty, Empty, Long, Empty, Empty));
        assert_eq!(decision.final_signal, Empty);
        assert_eq!(decision.reason, REASON_NO_ICHIMOKU_SIGNAL);
    }

    #[test]
    fn ichimoku_disagreement_stops_evaluation() {
        let decision = combine(layers(Long, Short, Short, Short, Short));
        assert_eq!(decision.final_signal, Empty);
        assert_eq!(decision.reason, REASON_ICHIMOKU_CONFLICT);
    }

    #[test]
    fn disagreement_is_absorbing() {
        // activity vetoes, later agreeing layers cannot revive the signal
        let decision = combine(layers(Short, Short, Long, Short, Short));
        assert_eq!(decision.final_signal, Empty);
        assert_eq!(decision.reason, "activity_conflict");
        assert_eq!(
            decision.verdicts,
            vec![
                (Layer::Activity, LayerVerdict::Disagree),
                (Layer::FudActivity, LayerVerdict::Skipped),
                (Layer::Sentiment, LayerVerdict::Skipped),
            ]
        );
    }

    #[test]
    fn fud_surge_and_bearish_sentiment_veto_long() {
        assert_eq!(
            combine(layers(Long, Long, Long, Short, Empty)).reason,
            "fud_activity_conflict"
        );
        assert_eq!(
            combine(layers(Long, Long, Empty, Empty, Short)).reason,
            "sentiment_conflict"
        );
    }

    #[test]
    fn every_agreeing_layer_keeps_direction() {
        let decision = combine(layers(Short, Short, Short, Short, Short));
        assert_eq!(decision.final_signal, Short);
        assert!(decision.explanation.contains("sentiment"));
    }

    #[test]
    fn layer_readings_follow_trend_rules() {
        let rise = ActivityAnalysis {
            trend: ActivityTrend::SharpRise,
            ..Default::default()
        };
        let drop = ActivityAnalysis {
            trend: ActivityTrend::SharpDrop,
            ..Default::default()
        };
        assert_eq!(activity_signal(&rise), Long);
        assert_eq!(activity_signal(&drop), Short);
        assert_eq!(fud_activity_signal(&rise), Short);
        assert_eq!(fud_activity_signal(&drop), Empty);

        let mut sentiment = SentimentResult::neutral("n/a");
        assert_eq!(sentiment_signal(&sentiment), Empty);
        sentiment.sentiment_trend = SentimentTrend::Declining;
        sentiment.overall_sentiment = 2;
        assert_eq!(sentiment_signal(&sentiment), Short);
        sentiment.overall_sentiment = 3;
        assert_eq!(sentiment_signal(&sentiment), Empty);
    }

    #[test]
    fn key_distinguishes_layer_content_not_prose() {
        let a = combine(layers(Long, Long, Empty, Empty, Empty));
        let mut b = a.clone();
        b.explanation = "reworded".into();
        assert_eq!(a.key(), b.key());

        let c = combine(layers(Long, Empty, Empty, Empty, Empty));
        assert_eq!(c.final_signal, a.final_signal);
        assert_ne!(a.key(), c.key());
        assert_ne!(a.key(), a.clone().with_fud_attack(true).key());
    }

    #[test]
    fn record_uses_layer_labels() {
        let decision = combine(layers(Long, Long, Empty, Empty, Empty));
        let record = decision.to_record("DOGEUSDT", Utc::now());
        assert_eq!(record.btc_ichimoku, "LONG");
        assert_eq!(record.activity, "EMPTY");
        assert_eq!(record.fud_attack, "no");
        assert_eq!(record.final_decision, "LONG");
    }
}
