//! HTTP advisory client
//!
//! Sentiment and FUD alerts come from the community-analysis API as plain
//! GETs. Order validation and close recommendations go to a messages API
//! with a system prompt; the reply is prefilled with `{` so the model
//! answers with a bare JSON object.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use super::{
    AdvisoryService, CloseAnalysisRequest, CloseRecommendation, FudAttackResult,
    OrderValidation, OrderValidationRequest, SentimentResult,
};
use crate::config::AdvisoryConfig;
use crate::errors::{TraderError, TraderResult};

const ANTHROPIC_VERSION: &str = "2023-06-01";
/// Messages the community API looks at per analysis
const ANALYSIS_MESSAGE_LIMIT: u32 = 200;

const ORDER_VALIDATION_PROMPT: &str = r#"You validate automated crypto futures entries.
You receive the proposed decision (LONG or SHORT) with its per-layer reasoning, the BTC and coin
Ichimoku analyses, community activity and FUD-activity trends, and the latest sentiment.
Check whether the indicators agree, whether anything in sentiment or FUD activity is a red flag,
and whether the timing is reasonable.
Reply with JSON only:
{"should_open_order": true, "confidence_percent": 70.0, "justification": "..."}"#;

const CLOSE_ANALYSIS_PROMPT: &str = r#"You decide whether an open crypto futures position should be closed.
You receive the position, statistics of its unrealized P/L history (count, min, max, mean, median,
1st and 99th percentile), recent community messages, BTC (4h) and coin (1h) Ichimoku analyses,
the Ichimoku exit check and a moving-average P/L exit signal.
Mind the position side: a SHORT that keeps falling with supportive indicators should stay open,
as should a LONG that keeps rising.
If moving_average_signal.should_close is true the position will be closed regardless; set
should_close to true and mention the signal in the justification.
Reply with JSON only:
{"should_close": false, "confidence_percent": 60.0, "justification": "...", "expected_pnl": 0.0, "risk_assessment": "medium"}"#;

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: String,
}

/// reqwest-backed [`AdvisoryService`]
pub struct HttpAdvisory {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    messages_url: String,
    messages_api_key: Option<String>,
    model: String,
    max_tokens: u32,
}

impl HttpAdvisory {
    pub fn new(config: &AdvisoryConfig) -> TraderResult<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: std::env::var(&config.api_key_env).ok(),
            messages_url: config.messages_url.clone(),
            messages_api_key: std::env::var(&config.messages_api_key_env).ok(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
        })
    }

    /// GET an analysis endpoint. A non-200 or unparseable reply is `Ok(Err(reason))`
    /// so callers can substitute a neutral payload.
    async fn get_analysis<T: DeserializeOwned>(
        &self,
        path: &str,
        community_id: &str,
    ) -> TraderResult<Result<T, String>> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| TraderError::Config("advisory API key not set".into()))?;
        let url = format!("{}/{}/{}", self.base_url, path, community_id);
        let limit = ANALYSIS_MESSAGE_LIMIT.to_string();

        let response = self
            .client
            .get(&url)
            .query(&[("apikey", api_key), ("limit", limit.as_str())])
            .send()
            .await
            .map_err(|e| TraderError::advisory(format!("GET {path} failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            warn!(path, status = %status, "Advisory analysis unavailable");
            return Ok(Err(format!(
                "{path} API error (status {}): external service unavailable",
                status.as_u16()
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| TraderError::advisory(format!("reading {path} body failed: {e}")))?;
        Ok(serde_json::from_str(&body).map_err(|e| format!("{path} API parse error: {e}")))
    }

    async fn ask<T: DeserializeOwned>(&self, system: &str, user: String) -> TraderResult<T> {
        let api_key = self
            .messages_api_key
            .as_deref()
            .ok_or_else(|| TraderError::Config("messages API key not set".into()))?;

        let request = MessagesRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            system,
            messages: vec![
                ChatMessage {
                    role: "user",
                    content: user,
                },
                ChatMessage {
                    role: "assistant",
                    content: "{".to_string(),
                },
            ],
        };

        let response = self
            .client
            .post(&self.messages_url)
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&request)
            .send()
            .await
            .map_err(|e| TraderError::advisory(format!("messages request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TraderError::advisory(format!(
                "messages API error [{}]: {}",
                status.as_u16(),
                body
            )));
        }

        let parsed: MessagesResponse = response
            .json()
            .await
            .map_err(|e| TraderError::advisory(format!("messages response unreadable: {e}")))?;
        let text = parsed
            .content
            .first()
            .map(|block| block.text.as_str())
            .ok_or_else(|| TraderError::advisory("empty messages response"))?;

        debug!(chars = text.len(), "Advisory reply received");
        parse_prefilled_json(text)
    }
}

/// Parse a reply that continues an assistant turn prefilled with `{`.
///
/// Anything after the first complete JSON object is ignored.
pub(crate) fn parse_prefilled_json<T: DeserializeOwned>(continuation: &str) -> TraderResult<T> {
    let full = format!("{{{continuation}");
    serde_json::Deserializer::from_str(&full)
        .into_iter::<T>()
        .next()
        .ok_or_else(|| TraderError::advisory("no JSON object in advisory reply"))?
        .map_err(|e| TraderError::advisory(format!("advisory reply is not valid JSON: {e}")))
}

#[async_trait]
impl AdvisoryService for HttpAdvisory {
    async fn analyze_sentiment(&self, community_id: &str) -> TraderResult<SentimentResult> {
        Ok(self
            .get_analysis::<SentimentResult>("sentiment", community_id)
            .await?
            .unwrap_or_else(SentimentResult::neutral))
    }

    async fn analyze_fud_attack(&self, community_id: &str) -> TraderResult<FudAttackResult> {
        Ok(self
            .get_analysis::<FudAttackResult>("fud-alert", community_id)
            .await?
            .unwrap_or_else(FudAttackResult::none))
    }

    async fn validate_order(
        &self,
        request: &OrderValidationRequest,
    ) -> TraderResult<OrderValidation> {
        let payload = serde_json::to_string(request)?;
        self.ask(
            ORDER_VALIDATION_PROMPT,
            format!("Please validate this trading decision:\n\n{payload}"),
        )
        .await
    }

    async fn recommend_close(
        &self,
        request: &CloseAnalysisRequest,
    ) -> TraderResult<CloseRecommendation> {
        let payload = serde_json::to_string(request)?;
        self.ask(
            CLOSE_ANALYSIS_PROMPT,
            format!("Should we close this position? Analyze the data:\n\n{payload}"),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefilled_reply_is_completed_and_parsed() {
        let reply = r#""should_open_order": false, "confidence_percent": 35.5, "justification": "BTC diverges"}"#;
        let parsed: OrderValidation = parse_prefilled_json(reply).unwrap();
        assert!(!parsed.should_open_order);
        assert_eq!(parsed.confidence_percent, 35.5);
    }

    #[test]
    fn trailing_commentary_is_ignored() {
        let reply = r#""should_close": true, "expected_pnl": -1.5}

Closing because the average decayed."#;
        let parsed: CloseRecommendation = parse_prefilled_json(reply).unwrap();
        assert!(parsed.should_close);
        assert_eq!(parsed.expected_pnl, -1.5);
        assert!(parsed.risk_assessment.is_empty());
    }

    #[test]
    fn garbage_reply_is_an_advisory_error() {
        let result: TraderResult<OrderValidation> = parse_prefilled_json("not json at all");
        assert!(matches!(result, Err(TraderError::Advisory { .. })));
    }
}
