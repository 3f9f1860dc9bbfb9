//! Per-symbol trading state and the board that publishes it

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::advisory::{CachedSignal, FudAttackResult, SentimentResult};
use crate::strategy::{DecisionKey, FudMode, Rejection};
use crate::types::{PositionSide, TradeSignal};

/// The position a symbol loop currently holds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenPosition {
    pub side: PositionSide,
    pub opened_at: DateTime<Utc>,
    pub open_reason: String,
    /// Correlation id of the position record
    pub correlation_id: String,
}

/// State owned by one symbol loop. Nothing else mutates it.
///
/// FLAT is `position == None`, so a flat state can never carry a
/// correlation id or an open reason.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TradingState {
    pub symbol: String,
    pub position: Option<OpenPosition>,
    pub sentiment: CachedSignal<SentimentResult>,
    pub fud_attack: CachedSignal<FudAttackResult>,
    pub fud_mode: FudMode,
    pub rejection: Option<Rejection>,
    /// Content of the last decision whose cycle completed
    pub last_decision: Option<DecisionKey>,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl TradingState {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            ..Default::default()
        }
    }

    pub fn side(&self) -> PositionSide {
        self.position
            .as_ref()
            .map(|p| p.side)
            .unwrap_or(PositionSide::Flat)
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.position.as_ref().map(|p| p.correlation_id.as_str())
    }
}

/// Read-only copy of a symbol's state for the dashboard
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradingStateView {
    pub symbol: String,
    pub side: PositionSide,
    pub opened_at: Option<DateTime<Utc>>,
    pub open_reason: Option<String>,
    pub correlation_id: Option<String>,
    pub fud_mode: String,
    pub fud_last_attack_at: Option<DateTime<Utc>>,
    pub sentiment: Option<SentimentResult>,
    pub sentiment_fetched_at: Option<DateTime<Utc>>,
    pub fud_attack: Option<FudAttackResult>,
    pub fud_attack_fetched_at: Option<DateTime<Utc>>,
    pub last_decision: Option<TradeSignal>,
    pub rejected_at: Option<DateTime<Utc>>,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl From<&TradingState> for TradingStateView {
    fn from(state: &TradingState) -> Self {
        Self {
            symbol: state.symbol.clone(),
            side: state.side(),
            opened_at: state.position.as_ref().map(|p| p.opened_at),
            open_reason: state.position.as_ref().map(|p| p.open_reason.clone()),
            correlation_id: state.correlation_id().map(str::to_string),
            fud_mode: state.fud_mode.to_string(),
            fud_last_attack_at: state.fud_mode.last_attack_at(),
            sentiment: state.sentiment.value.clone(),
            sentiment_fetched_at: state.sentiment.fetched_at,
            fud_attack: state.fud_attack.value.clone(),
            fud_attack_fetched_at: state.fud_attack.fetched_at,
            last_decision: state.last_decision.map(|k| k.final_signal),
            rejected_at: state.rejection.map(|r| r.at),
            last_cycle_at: state.last_cycle_at,
            last_error: state.last_error.clone(),
        }
    }
}

/// Latest published state of every symbol.
///
/// Each loop only ever writes its own entry.
#[derive(Debug, Clone, Default)]
pub struct StateBoard {
    inner: Arc<RwLock<HashMap<String, TradingStateView>>>,
}

impl StateBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn publish(&self, state: &TradingState) {
        let view = TradingStateView::from(state);
        self.inner.write().await.insert(view.symbol.clone(), view);
    }

    pub async fn get(&self, symbol: &str) -> Option<TradingStateView> {
        self.inner.read().await.get(symbol).cloned()
    }

    /// All symbols, sorted
    pub async fn all(&self) -> Vec<TradingStateView> {
        let mut views: Vec<TradingStateView> = self.inner.read().await.values().cloned().collect();
        views.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        views
    }
}
