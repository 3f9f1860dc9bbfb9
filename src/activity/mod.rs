//! Community activity collaborator
//!
//! Hourly message counts (all messages and FUD-tagged ones) plus the most
//! recent messages for a community.

pub mod client;

pub use client::HttpActivityClient;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::TraderResult;
use crate::types::{ActivityPoint, CommunityMessage};

#[async_trait]
pub trait ActivityService: Send + Sync {
    /// Message counts per bucket between `from` and `to`, oldest first
    async fn get_activity(
        &self,
        community_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> TraderResult<Vec<ActivityPoint>>;

    /// Counts of messages flagged as FUD, same bucketing
    async fn get_fud_activity(
        &self,
        community_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> TraderResult<Vec<ActivityPoint>>;

    async fn get_recent_messages(
        &self,
        community_id: &str,
        limit: usize,
    ) -> TraderResult<Vec<CommunityMessage>>;
}
