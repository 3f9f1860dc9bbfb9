//! AI advisory collaborator
//!
//! Sentiment and FUD-attack detection per community, plus two judgement
//! calls made with full trading context: validating a new order and
//! recommending whether to close an open position.

pub mod cache;
pub mod client;

pub use cache::{fetch_with_policy, refresh_cached, CachedSignal, Confidence, FetchOutcome};
pub use client::HttpAdvisory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::TraderResult;
use crate::features::{ActivityAnalysis, ClosePositionReason, IchimokuAnalysis};
use crate::persistence::PositionRecord;
use crate::risk::{MovingAverageSignal, SnapshotStatistics};
use crate::strategy::TradingDecision;
use crate::types::{CommunityMessage, PositionSide};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SentimentTrend {
    Improving,
    Declining,
    Stable,
    /// Anything else the service reports, including its own fallback
    #[serde(other)]
    Neutral,
}

impl Default for SentimentTrend {
    fn default() -> Self {
        SentimentTrend::Neutral
    }
}

impl fmt::Display for SentimentTrend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SentimentTrend::Improving => write!(f, "improving"),
            SentimentTrend::Declining => write!(f, "declining"),
            SentimentTrend::Stable => write!(f, "stable"),
            SentimentTrend::Neutral => write!(f, "neutral"),
        }
    }
}

/// Community sentiment snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentimentResult {
    /// -10 (very negative) ..= 10 (very positive)
    pub overall_sentiment: i32,
    #[serde(default)]
    pub sentiment_trend: SentimentTrend,
    /// 0 ..= 10
    #[serde(default)]
    pub fud_level: i32,
    /// 0 ..= 1
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub key_themes: Vec<String>,
    #[serde(default)]
    pub recommendation: String,
}

impl SentimentResult {
    /// Stand-in used when the service cannot give a real answer
    pub fn neutral(reason: impl Into<String>) -> Self {
        Self {
            overall_sentiment: 5,
            sentiment_trend: SentimentTrend::Neutral,
            fud_level: 0,
            confidence: 0.0,
            key_themes: Vec::new(),
            recommendation: reason.into(),
        }
    }
}

impl Confidence for SentimentResult {
    fn confidence(&self) -> f64 {
        self.confidence
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FudParticipant {
    pub username: String,
    #[serde(default)]
    pub message_count: u32,
}

/// Coordinated FUD-attack detection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FudAttackResult {
    pub has_attack: bool,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub message_count: u32,
    #[serde(default)]
    pub participants: Vec<FudParticipant>,
    #[serde(default)]
    pub fud_type: String,
    #[serde(default)]
    pub theme: String,
    #[serde(default)]
    pub started_hours_ago: f64,
    #[serde(default)]
    pub justification: String,
    #[serde(default)]
    pub last_attack_time: Option<DateTime<Utc>>,
}

impl FudAttackResult {
    pub fn none(reason: impl Into<String>) -> Self {
        Self {
            has_attack: false,
            confidence: 0.0,
            message_count: 0,
            participants: Vec::new(),
            fud_type: String::new(),
            theme: String::new(),
            started_hours_ago: 0.0,
            justification: reason.into(),
            last_attack_time: None,
        }
    }

    /// Attack with a real confidence whose last message is within `window` of `now`
    pub fn is_fresh(&self, now: DateTime<Utc>, window: chrono::Duration) -> bool {
        self.has_attack
            && self.has_confidence()
            && self
                .last_attack_time
                .map(|at| now - at <= window)
                .unwrap_or(false)
    }
}

impl Confidence for FudAttackResult {
    fn confidence(&self) -> f64 {
        self.confidence
    }
}

/// Verdict on a proposed open
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderValidation {
    pub should_open_order: bool,
    #[serde(default)]
    pub confidence_percent: f64,
    #[serde(default)]
    pub justification: String,
}

/// Recommendation on an open position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloseRecommendation {
    pub should_close: bool,
    #[serde(default)]
    pub confidence_percent: f64,
    #[serde(default)]
    pub justification: String,
    #[serde(default)]
    pub expected_pnl: f64,
    #[serde(default)]
    pub risk_assessment: String,
}

/// Everything the validator sees about a proposed open
#[derive(Debug, Clone, Serialize)]
pub struct OrderValidationRequest {
    pub symbol: String,
    pub current_side: PositionSide,
    pub decision: TradingDecision,
    pub btc_ichimoku: IchimokuAnalysis,
    pub coin_ichimoku: IchimokuAnalysis,
    pub activity: ActivityAnalysis,
    pub fud_activity: ActivityAnalysis,
    pub sentiment: Option<SentimentResult>,
}

/// Everything the close analysis sees about an open position
#[derive(Debug, Clone, Serialize)]
pub struct CloseAnalysisRequest {
    pub position: PositionRecord,
    pub snapshot_statistics: SnapshotStatistics,
    pub recent_messages: Vec<CommunityMessage>,
    pub btc_ichimoku: IchimokuAnalysis,
    pub coin_ichimoku: IchimokuAnalysis,
    pub current_position_short_or_long: PositionSide,
    pub should_close_by_ichimoku: ClosePositionReason,
    pub moving_average_signal: MovingAverageSignal,
    pub current_date: String,
    pub position_open_date: String,
}

/// External AI advisory service
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AdvisoryService: Send + Sync {
    async fn analyze_sentiment(&self, community_id: &str) -> TraderResult<SentimentResult>;

    async fn analyze_fud_attack(&self, community_id: &str) -> TraderResult<FudAttackResult>;

    async fn validate_order(&self, request: &OrderValidationRequest)
        -> TraderResult<OrderValidation>;

    async fn recommend_close(
        &self,
        request: &CloseAnalysisRequest,
    ) -> TraderResult<CloseRecommendation>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn attack(minutes_ago: i64, now: DateTime<Utc>) -> FudAttackResult {
        FudAttackResult {
            has_attack: true,
            confidence: 0.85,
            message_count: 42,
            participants: vec![FudParticipant {
                username: "bagholder".into(),
                message_count: 17,
            }],
            fud_type: "coordinated".into(),
            theme: "rug pull rumours".into(),
            started_hours_ago: 2.0,
            justification: "burst of identical posts".into(),
            last_attack_time: Some(now - Duration::minutes(minutes_ago)),
        }
    }

    #[test]
    fn fresh_attack_requires_recent_message_and_confidence() {
        let now = Utc::now();
        assert!(attack(30, now).is_fresh(now, Duration::hours(1)));
        assert!(!attack(61, now).is_fresh(now, Duration::hours(1)));

        let mut unsure = attack(5, now);
        unsure.confidence = 0.0;
        assert!(!unsure.is_fresh(now, Duration::hours(1)));

        let mut undated = attack(5, now);
        undated.last_attack_time = None;
        assert!(!undated.is_fresh(now, Duration::hours(1)));
    }

    #[test]
    fn sentiment_parses_unknown_trend_as_neutral() {
        let json = r#"{"overall_sentiment": -3, "sentiment_trend": "sideways", "confidence": 0.4}"#;
        let parsed: SentimentResult = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.sentiment_trend, SentimentTrend::Neutral);
        assert_eq!(parsed.overall_sentiment, -3);
        assert!(parsed.key_themes.is_empty());
    }

    #[test]
    fn neutral_fallbacks_carry_no_confidence() {
        let sentiment = SentimentResult::neutral("status 502");
        assert_eq!(sentiment.overall_sentiment, 5);
        assert!(!sentiment.has_confidence());
        assert!(!FudAttackResult::none("status 502").has_confidence());
    }
}
