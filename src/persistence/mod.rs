//! Persistence Module
//!
//! Record types for positions, snapshots, decisions and advisory audit
//! trails, and the store the lifecycle manager writes them through.

mod csv_store;

pub use csv_store::CsvPersistence;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::TraderResult;
use crate::types::PositionSide;

/// One position from open to close, keyed by its correlation id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionRecord {
    pub uuid: String,
    pub symbol: String,
    pub side: PositionSide,
    pub leverage: u32,
    pub quantity: f64,
    pub entry_price: f64,
    pub opened_at: DateTime<Utc>,
    pub is_closed: bool,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub close_price: Option<f64>,
    #[serde(default)]
    pub realized_pnl: Option<f64>,
    pub current_pnl: f64,
    pub current_mark_price: f64,
    pub max_pnl: f64,
    pub min_pnl: f64,
    /// Milliseconds between open and close
    #[serde(default)]
    pub duration_ms: Option<i64>,
    pub open_reason: String,
    #[serde(default)]
    pub close_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Final numbers of a close
#[derive(Debug, Clone, PartialEq)]
pub struct PositionClose {
    pub close_price: f64,
    pub realized_pnl: f64,
    pub reason: String,
    pub closed_at: DateTime<Utc>,
}

/// Per-tick reading of an open position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub position_uuid: String,
    pub symbol: String,
    pub side: PositionSide,
    pub leverage: u32,
    pub entry_price: f64,
    pub amount: f64,
    pub unrealized_pnl: f64,
    pub mark_price: f64,
    pub position_opened_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Combinator output as persisted for audit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradingDecisionRecord {
    pub id: u64,
    #[serde(default)]
    pub position_uuid: Option<String>,
    pub symbol: String,
    pub btc_ichimoku: String,
    pub coin_ichimoku: String,
    pub activity: String,
    pub fud_activity: String,
    pub sentiment: String,
    /// "yes" / "no"
    pub fud_attack: String,
    pub final_decision: String,
    pub reason: String,
    pub explanation: String,
    pub created_at: DateTime<Utc>,
}

impl TradingDecisionRecord {
    /// Same layer readings and outcome; ids, timestamps and prose are ignored
    pub fn same_content(&self, other: &TradingDecisionRecord) -> bool {
        self.symbol == other.symbol
            && self.btc_ichimoku == other.btc_ichimoku
            && self.coin_ichimoku == other.coin_ichimoku
            && self.activity == other.activity
            && self.fud_activity == other.fud_activity
            && self.sentiment == other.sentiment
            && self.fud_attack == other.fud_attack
            && self.final_decision == other.final_decision
    }
}

/// Link from a decision to the position it produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionLink {
    pub decision_id: u64,
    pub position_uuid: String,
    pub linked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FudAttackRecord {
    #[serde(default)]
    pub position_uuid: Option<String>,
    pub symbol: String,
    pub has_attack: bool,
    pub confidence: f64,
    pub message_count: u32,
    pub fud_type: String,
    pub theme: String,
    pub started_hours_ago: f64,
    #[serde(default)]
    pub last_attack_time: Option<DateTime<Utc>>,
    pub justification: String,
    /// Comma-separated usernames
    pub participants: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderValidationRecord {
    pub symbol: String,
    #[serde(default)]
    pub decision_record_id: Option<u64>,
    /// "approved", "rejected" or "error"
    pub outcome: String,
    pub should_open_order: bool,
    pub confidence_percent: f64,
    pub justification: String,
    pub request_data: String,
    pub response_data: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloseAnalysisRecord {
    pub position_uuid: String,
    pub symbol: String,
    pub snapshot_count: usize,
    pub should_close: bool,
    pub confidence_percent: f64,
    pub justification: String,
    pub expected_pnl: f64,
    pub risk_assessment: String,
    pub ma_should_close: bool,
    pub request_data: String,
    pub response_data: String,
    pub created_at: DateTime<Utc>,
}

/// Durable store for everything the engine records.
///
/// The lifecycle manager is the only writer; the dashboard and reports read.
#[async_trait]
pub trait TradeStore: Send + Sync {
    /// Insert or replace a position record
    async fn save_position(&self, record: &PositionRecord) -> TraderResult<()>;

    async fn position(&self, uuid: &str) -> TraderResult<Option<PositionRecord>>;

    async fn open_positions(&self, symbol: &str) -> TraderResult<Vec<PositionRecord>>;

    /// Every record for a symbol, oldest first
    async fn positions(&self, symbol: &str) -> TraderResult<Vec<PositionRecord>>;

    /// Update current P/L and mark price; running max/min only widen
    async fn update_position_mark(
        &self,
        uuid: &str,
        current_pnl: f64,
        mark_price: f64,
        at: DateTime<Utc>,
    ) -> TraderResult<PositionRecord>;

    /// Close the record, taking max/min from its snapshot history
    async fn finalize_position(&self, uuid: &str, close: PositionClose)
        -> TraderResult<PositionRecord>;

    async fn delete_position(&self, uuid: &str) -> TraderResult<()>;

    /// Append a snapshot; returns how many the position now has
    async fn append_snapshot(&self, snapshot: &PositionSnapshot) -> TraderResult<usize>;

    async fn snapshots(&self, uuid: &str) -> TraderResult<Vec<PositionSnapshot>>;

    async fn latest_decision(&self, symbol: &str) -> TraderResult<Option<TradingDecisionRecord>>;

    /// Append a decision; the store assigns and returns its id
    async fn append_decision(&self, record: TradingDecisionRecord) -> TraderResult<u64>;

    async fn link_decision(&self, decision_id: u64, position_uuid: &str) -> TraderResult<()>;

    /// Most recent decisions first, optionally for one symbol
    async fn recent_decisions(
        &self,
        symbol: Option<&str>,
        limit: usize,
    ) -> TraderResult<Vec<TradingDecisionRecord>>;

    async fn append_fud_attack(&self, record: &FudAttackRecord) -> TraderResult<()>;

    async fn append_order_validation(&self, record: &OrderValidationRecord) -> TraderResult<()>;

    async fn append_close_analysis(&self, record: &CloseAnalysisRecord) -> TraderResult<()>;
}
