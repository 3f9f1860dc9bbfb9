//! REST client for the community activity service

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::ActivityService;
use crate::config::ActivityConfig;
use crate::errors::{TraderError, TraderResult};
use crate::types::{ActivityPoint, CommunityMessage};

/// `{status, data, message, error}` envelope used by every endpoint
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    status: String,
    data: Option<T>,
    #[serde(default)]
    message: String,
    #[serde(default)]
    error: String,
}

impl<T: Default> Envelope<T> {
    fn into_data(self) -> TraderResult<T> {
        if self.status == "error" {
            return Err(TraderError::activity(format!("{}: {}", self.message, self.error)));
        }
        Ok(self.data.unwrap_or_default())
    }
}

pub struct HttpActivityClient {
    client: Client,
    base_url: String,
    period: String,
}

impl HttpActivityClient {
    pub fn new(config: &ActivityConfig) -> TraderResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            period: config.period.clone(),
        })
    }

    async fn get<T: DeserializeOwned + Default>(
        &self,
        url: String,
        query: &[(&str, String)],
    ) -> TraderResult<T> {
        let response = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(|e| TraderError::activity(format!("GET {url} failed: {e}")))?;

        let envelope: Envelope<T> = response
            .json()
            .await
            .map_err(|e| TraderError::activity(format!("bad response from {url}: {e}")))?;
        envelope.into_data()
    }

    async fn fetch_series(
        &self,
        community_id: &str,
        endpoint: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> TraderResult<Vec<ActivityPoint>> {
        let url = format!(
            "{}/api/external/community/{}/{}",
            self.base_url, community_id, endpoint
        );
        let query = [
            ("timestamp_from", from.timestamp_millis().to_string()),
            ("timestamp_to", to.timestamp_millis().to_string()),
            ("period", self.period.clone()),
        ];
        let points: Vec<ActivityPoint> = self.get(url, &query).await?;
        debug!(community = community_id, endpoint, points = points.len(), "Activity fetched");
        Ok(points)
    }
}

#[async_trait]
impl ActivityService for HttpActivityClient {
    async fn get_activity(
        &self,
        community_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> TraderResult<Vec<ActivityPoint>> {
        self.fetch_series(community_id, "activity", from, to).await
    }

    async fn get_fud_activity(
        &self,
        community_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> TraderResult<Vec<ActivityPoint>> {
        self.fetch_series(community_id, "fud-activity", from, to).await
    }

    async fn get_recent_messages(
        &self,
        community_id: &str,
        limit: usize,
    ) -> TraderResult<Vec<CommunityMessage>> {
        let url = format!(
            "{}/api/external/community/{}/tweets",
            self.base_url, community_id
        );
        self.get(url, &[("limit", limit.to_string())]).await
    }
}
