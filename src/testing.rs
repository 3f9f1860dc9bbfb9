//! Scripted collaborators for tests
//!
//! Stateful fakes for the exchange market data, the activity service and the
//! advisory service, plus candle series that produce known Ichimoku signals.
//! Used by unit tests and by the scenario tests under `tests/`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::activity::ActivityService;
use crate::advisory::{
    AdvisoryService, CloseAnalysisRequest, CloseRecommendation, FudAttackResult, OrderValidation,
    OrderValidationRequest, SentimentResult,
};
use crate::errors::{TraderError, TraderResult};
use crate::exchange::Exchange;
use crate::types::{ActivityPoint, Candle, CommunityMessage, ExchangePosition, PositionSide};

fn locked<T: Clone>(m: &Mutex<T>) -> T {
    match m.lock() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

fn update<T>(m: &Mutex<T>, apply: impl FnOnce(&mut T)) {
    match m.lock() {
        Ok(mut guard) => apply(&mut guard),
        Err(poisoned) => apply(&mut poisoned.into_inner()),
    }
}

fn store<T>(m: &Mutex<T>, value: T) {
    update(m, |slot| *slot = value);
}

/// Market data only: klines and mark prices set by the test. It never
/// holds positions, so wrap it in a `PaperExchange` to trade.
#[derive(Default)]
pub struct ScriptedMarket {
    klines: Mutex<HashMap<(String, String), Vec<Candle>>>,
    marks: Mutex<HashMap<String, f64>>,
    failing: AtomicBool,
}

impl ScriptedMarket {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_mark(&self, symbol: &str, price: f64) {
        update(&self.marks, |marks| {
            marks.insert(symbol.to_string(), price);
        });
    }

    pub fn set_klines(&self, symbol: &str, interval: &str, candles: Vec<Candle>) {
        update(&self.klines, |klines| {
            klines.insert((symbol.to_string(), interval.to_string()), candles);
        });
    }

    /// Make every call fail with a transient exchange error
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> TraderResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(TraderError::exchange("scripted outage"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Exchange for ScriptedMarket {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn get_position(&self, _symbol: &str) -> TraderResult<Option<ExchangePosition>> {
        self.check()?;
        Ok(None)
    }

    async fn open_position(
        &self,
        symbol: &str,
        _side: PositionSide,
        _leverage: u32,
        _quantity: f64,
    ) -> TraderResult<ExchangePosition> {
        Err(TraderError::OrderExecution {
            symbol: symbol.to_string(),
            reason: "scripted market does not trade".into(),
        })
    }

    async fn close_position(&self, symbol: &str, _side: PositionSide) -> TraderResult<()> {
        Err(TraderError::OrderExecution {
            symbol: symbol.to_string(),
            reason: "scripted market does not trade".into(),
        })
    }

    async fn get_mark_price(&self, symbol: &str) -> TraderResult<f64> {
        self.check()?;
        locked(&self.marks)
            .get(symbol)
            .copied()
            .ok_or_else(|| TraderError::exchange(format!("no mark price for {symbol}")))
    }

    async fn klines(&self, symbol: &str, interval: &str, limit: usize) -> TraderResult<Vec<Candle>> {
        self.check()?;
        let all = locked(&self.klines)
            .get(&(symbol.to_string(), interval.to_string()))
            .cloned()
            .unwrap_or_default();
        let skip = all.len().saturating_sub(limit);
        Ok(all.into_iter().skip(skip).collect())
    }
}

/// Activity service returning whatever series the test set
#[derive(Default)]
pub struct ScriptedActivity {
    activity: Mutex<Vec<ActivityPoint>>,
    fud_activity: Mutex<Vec<ActivityPoint>>,
    messages: Mutex<Vec<CommunityMessage>>,
    failing: AtomicBool,
}

impl ScriptedActivity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_activity(&self, points: Vec<ActivityPoint>) {
        store(&self.activity, points);
    }

    pub fn set_fud_activity(&self, points: Vec<ActivityPoint>) {
        store(&self.fud_activity, points);
    }

    pub fn set_messages(&self, messages: Vec<CommunityMessage>) {
        store(&self.messages, messages);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> TraderResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(TraderError::activity("scripted outage"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ActivityService for ScriptedActivity {
    async fn get_activity(
        &self,
        _community_id: &str,
        _from: DateTime<Utc>,
        _to: DateTime<Utc>,
    ) -> TraderResult<Vec<ActivityPoint>> {
        self.check()?;
        Ok(locked(&self.activity))
    }

    async fn get_fud_activity(
        &self,
        _community_id: &str,
        _from: DateTime<Utc>,
        _to: DateTime<Utc>,
    ) -> TraderResult<Vec<ActivityPoint>> {
        self.check()?;
        Ok(locked(&self.fud_activity))
    }

    async fn get_recent_messages(
        &self,
        _community_id: &str,
        limit: usize,
    ) -> TraderResult<Vec<CommunityMessage>> {
        self.check()?;
        Ok(locked(&self.messages).into_iter().take(limit).collect())
    }
}

/// Advisory service with settable answers and call counters.
///
/// `None` for validation or close answers makes those calls fail.
pub struct ScriptedAdvisory {
    sentiment: Mutex<SentimentResult>,
    fud_attack: Mutex<FudAttackResult>,
    validation: Mutex<Option<OrderValidation>>,
    close: Mutex<Option<CloseRecommendation>>,
    last_close_request: Mutex<Option<CloseAnalysisRequest>>,
    pub sentiment_calls: AtomicUsize,
    pub fud_calls: AtomicUsize,
    pub validation_calls: AtomicUsize,
    pub close_calls: AtomicUsize,
}

impl Default for ScriptedAdvisory {
    fn default() -> Self {
        Self {
            sentiment: Mutex::new(stable_sentiment()),
            fud_attack: Mutex::new(FudAttackResult {
                confidence: 0.8,
                ..FudAttackResult::none("no coordinated activity")
            }),
            validation: Mutex::new(Some(OrderValidation {
                should_open_order: true,
                confidence_percent: 75.0,
                justification: "signals consistent".into(),
            })),
            close: Mutex::new(Some(CloseRecommendation {
                should_close: false,
                confidence_percent: 60.0,
                justification: "trend intact".into(),
                expected_pnl: 0.0,
                risk_assessment: "moderate".into(),
            })),
            last_close_request: Mutex::new(None),
            sentiment_calls: AtomicUsize::new(0),
            fud_calls: AtomicUsize::new(0),
            validation_calls: AtomicUsize::new(0),
            close_calls: AtomicUsize::new(0),
        }
    }
}

impl ScriptedAdvisory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_sentiment(&self, sentiment: SentimentResult) {
        store(&self.sentiment, sentiment);
    }

    pub fn set_fud_attack(&self, attack: FudAttackResult) {
        store(&self.fud_attack, attack);
    }

    pub fn set_validation(&self, validation: Option<OrderValidation>) {
        store(&self.validation, validation);
    }

    pub fn set_close(&self, close: Option<CloseRecommendation>) {
        store(&self.close, close);
    }

    /// The request behind the most recent close analysis
    pub fn last_close_request(&self) -> Option<CloseAnalysisRequest> {
        locked(&self.last_close_request)
    }
}

#[async_trait]
impl AdvisoryService for ScriptedAdvisory {
    async fn analyze_sentiment(&self, _community_id: &str) -> TraderResult<SentimentResult> {
        self.sentiment_calls.fetch_add(1, Ordering::SeqCst);
        Ok(locked(&self.sentiment))
    }

    async fn analyze_fud_attack(&self, _community_id: &str) -> TraderResult<FudAttackResult> {
        self.fud_calls.fetch_add(1, Ordering::SeqCst);
        Ok(locked(&self.fud_attack))
    }

    async fn validate_order(
        &self,
        _request: &OrderValidationRequest,
    ) -> TraderResult<OrderValidation> {
        self.validation_calls.fetch_add(1, Ordering::SeqCst);
        locked(&self.validation).ok_or_else(|| TraderError::advisory("scripted validation outage"))
    }

    async fn recommend_close(
        &self,
        request: &CloseAnalysisRequest,
    ) -> TraderResult<CloseRecommendation> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        store(&self.last_close_request, Some(request.clone()));
        locked(&self.close).ok_or_else(|| TraderError::advisory("scripted close outage"))
    }
}

/// Neutral, stable sentiment with a real confidence
pub fn stable_sentiment() -> SentimentResult {
    SentimentResult {
        overall_sentiment: 6,
        sentiment_trend: crate::advisory::SentimentTrend::Stable,
        fud_level: 1,
        confidence: 0.7,
        key_themes: vec!["listing".into()],
        recommendation: "hold".into(),
    }
}

/// Fresh coordinated attack whose last message was at `last_attack_at`
pub fn fud_attack_at(last_attack_at: DateTime<Utc>) -> FudAttackResult {
    FudAttackResult {
        has_attack: true,
        confidence: 0.9,
        message_count: 40,
        participants: vec![crate::advisory::FudParticipant {
            username: "rugwatch".into(),
            message_count: 12,
        }],
        fud_type: "coordinated".into(),
        theme: "team dumping".into(),
        started_hours_ago: 2.0,
        justification: "burst of copy-pasted posts".into(),
        last_attack_time: Some(last_attack_at),
    }
}

fn series(closes: impl Iterator<Item = f64>) -> Vec<Candle> {
    closes
        .enumerate()
        .map(|(i, close)| Candle {
            open_time: i as i64 * 3_600_000,
            open: close,
            high: close * 1.002,
            low: close * 0.998,
            close,
            volume: 1_000.0,
        })
        .collect()
}

/// Steady uptrend; Ichimoku reads bullish for `n >= 52`
pub fn rising_candles(n: usize, start: f64) -> Vec<Candle> {
    series((0..n).map(move |i| start * 1.005f64.powi(i as i32)))
}

/// Steady downtrend; Ichimoku reads bearish for `n >= 52`
pub fn falling_candles(n: usize, start: f64) -> Vec<Candle> {
    series((0..n).map(move |i| start * 0.995f64.powi(i as i32)))
}

/// Constant activity buckets, which always read as a plateau
pub fn flat_activity(n: usize, count: u64) -> Vec<ActivityPoint> {
    (0..n)
        .map(|i| ActivityPoint {
            timestamp: i as i64 * 3_600_000,
            message_count: count,
        })
        .collect()
}

/// Quiet first half, loud second half
pub fn surging_activity(n: usize) -> Vec<ActivityPoint> {
    (0..n)
        .map(|i| ActivityPoint {
            timestamp: i as i64 * 3_600_000,
            message_count: if i < n / 2 { 10 } else { 40 },
        })
        .collect()
}
