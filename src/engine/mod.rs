//! Per-symbol control loop
//!
//! One `SymbolTrader` per traded pair, each owning its `TradingState`. A cycle:
//! 1. refresh the open position's snapshot
//! 2. refresh market, activity and advisory inputs (cache-aware)
//! 3. run the FUD override, or the combinator and order gate when it is inactive
//! 4. evaluate exits for a position that was open at the start of the cycle
//!
//! Any error aborts the rest of the cycle; state only changes after the
//! exchange call it depends on has succeeded.

pub mod lifecycle;
pub mod state;

pub use lifecycle::{
    PositionLifecycle, ReconcileReport, SnapshotOutcome, REASON_CLOSED_ON_EXCHANGE,
    REASON_NO_EXCHANGE_POSITION, REASON_RESTORED,
};
pub use state::{OpenPosition, StateBoard, TradingState, TradingStateView};

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::activity::ActivityService;
use crate::advisory::{
    refresh_cached, AdvisoryService, CloseAnalysisRequest, CloseRecommendation, FudAttackResult,
    OrderValidationRequest, SentimentResult,
};
use crate::config::{AppConfig, TradingPairConfig};
use crate::errors::{TraderError, TraderResult};
use crate::exchange::Exchange;
use crate::features::{
    analyze_activity_trend, analyze_fud_activity_trend, calculate_ichimoku, close_reason,
    ActivityAnalysis, ClosePositionReason, IchimokuAnalysis,
};
use crate::persistence::{
    CloseAnalysisRecord, FudAttackRecord, PositionRecord, PositionSnapshot, TradeStore,
};
use crate::risk::{
    calculate_snapshot_statistics, evaluate_ma_exit, is_close_analysis_milestone,
    MovingAverageSignal,
};
use crate::strategy::fud_mode::{REASON_FUD_ATTACK_FORCED, REASON_FUD_MODE_EXIT};
use crate::strategy::{
    combine, step_fud_mode, FudAction, FudStep, GateVerdict, LayerSignals, OrderGate,
    TradingDecision,
};
use crate::types::{PositionSide, TradeSignal};

pub const REASON_ICHIMOKU_EXIT: &str = "ichimoku_exit";
pub const REASON_MOVING_AVERAGE_EXIT: &str = "moving_average_exit";
pub const REASON_AI_CLOSE: &str = "ai_close_recommendation";

/// External collaborators shared by every symbol loop
#[derive(Clone)]
pub struct Collaborators {
    pub exchange: Arc<dyn Exchange>,
    pub advisory: Arc<dyn AdvisoryService>,
    pub activity: Arc<dyn ActivityService>,
    pub store: Arc<dyn TradeStore>,
}

/// Inputs refreshed at the start of every cycle
#[derive(Debug, Clone)]
pub struct CycleInputs {
    pub btc: IchimokuAnalysis,
    pub coin: IchimokuAnalysis,
    pub activity: ActivityAnalysis,
    pub fud_activity: ActivityAnalysis,
    pub sentiment: Option<SentimentResult>,
    pub fud_attack: Option<FudAttackResult>,
}

/// What one cycle did, for logging and tests
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub snapshot_count: Option<usize>,
    pub fud_action: Option<FudAction>,
    pub decision: Option<TradingDecision>,
    pub gate: Option<GateVerdict>,
    pub opened: Option<PositionRecord>,
    pub closed: Vec<PositionRecord>,
    pub close_recommendation: Option<CloseRecommendation>,
    pub ma_signal: Option<MovingAverageSignal>,
}

pub struct SymbolTrader {
    pair: TradingPairConfig,
    cfg: Arc<AppConfig>,
    exchange: Arc<dyn Exchange>,
    advisory: Arc<dyn AdvisoryService>,
    activity: Arc<dyn ActivityService>,
    store: Arc<dyn TradeStore>,
    lifecycle: PositionLifecycle,
    gate: OrderGate,
    board: StateBoard,
    state: TradingState,
    reconciled: bool,
}

impl SymbolTrader {
    pub fn new(
        pair: TradingPairConfig,
        cfg: Arc<AppConfig>,
        deps: Collaborators,
        board: StateBoard,
    ) -> Self {
        let lifecycle = PositionLifecycle::new(deps.exchange.clone(), deps.store.clone(), pair.clone());
        let gate = OrderGate::new(
            deps.advisory.clone(),
            deps.store.clone(),
            cfg.advisory.order_validation_enabled,
            cfg.advisory.rejection_cooldown(),
        );
        Self {
            state: TradingState::new(pair.symbol.clone()),
            pair,
            cfg,
            exchange: deps.exchange,
            advisory: deps.advisory,
            activity: deps.activity,
            store: deps.store,
            lifecycle,
            gate,
            board,
            reconciled: false,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.pair.symbol
    }

    pub fn state(&self) -> &TradingState {
        &self.state
    }

    pub async fn publish(&self) {
        self.board.publish(&self.state).await;
    }

    /// Poll until `shutdown` flips; the cycle in progress always completes
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let period = std::time::Duration::from_secs(self.cfg.bot.poll_interval_secs);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(symbol = %self.pair.symbol, every_secs = period.as_secs(), "🚀 Symbol loop started");

        while !*shutdown.borrow() {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = Utc::now();
                    if let Err(e) = self.run_cycle_at(now).await {
                        warn!(
                            symbol = %self.pair.symbol,
                            error = %e,
                            transient = e.is_transient(),
                            "Cycle aborted"
                        );
                        self.state.last_error = Some(e.to_string());
                        self.state.last_cycle_at = Some(now);
                    }
                    self.publish().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!(symbol = %self.pair.symbol, "🛑 Symbol loop stopped");
    }

    /// One full decision cycle at `now`
    pub async fn run_cycle_at(&mut self, now: DateTime<Utc>) -> TraderResult<CycleReport> {
        if !self.reconciled {
            let reconciled = self.lifecycle.reconcile(&mut self.state, now).await?;
            self.reconciled = true;
            info!(
                symbol = %self.pair.symbol,
                side = %self.state.side(),
                adopted = ?reconciled.adopted,
                restored = ?reconciled.restored,
                force_closed = reconciled.force_closed.len(),
                orphans = reconciled.orphans_deleted.len(),
                "🔄 Reconciled with exchange"
            );
        }

        let mut report = CycleReport::default();

        let tracked = match self.lifecycle.snapshot(&mut self.state, now).await? {
            SnapshotOutcome::Flat => None,
            SnapshotOutcome::Recorded {
                snapshot_count,
                current_pnl,
                record,
            } => {
                report.snapshot_count = Some(snapshot_count);
                Some((record.uuid, snapshot_count, current_pnl))
            }
            SnapshotOutcome::ClosedOnExchange(record) => {
                report.closed.push(record);
                None
            }
        };

        let inputs = self.refresh_inputs(now).await?;

        let layers = LayerSignals::read(
            &inputs.btc,
            &inputs.coin,
            &inputs.activity,
            &inputs.fud_activity,
            inputs.sentiment.as_ref(),
        );
        let fresh_attack = inputs
            .fud_attack
            .as_ref()
            .map_or(false, |a| a.is_fresh(now, self.cfg.fud.fresh_window()));
        let fud = step_fud_mode(
            self.state.fud_mode,
            inputs.fud_attack.as_ref(),
            layers.coin_ichimoku,
            now,
            &self.cfg.fud,
        );
        report.fud_action = Some(fud.action);

        if fud.action == FudAction::PassThrough {
            self.follow_combinator(layers, fresh_attack, &inputs, now, &mut report)
                .await?;
        } else {
            self.follow_fud_override(fud, layers, now, &mut report).await?;
        }

        // a position opened or replaced this cycle has no snapshot yet
        if let Some((uuid, count, current_pnl)) = tracked {
            if self.state.correlation_id() == Some(uuid.as_str()) {
                self.evaluate_exits(&uuid, count, current_pnl, &inputs, now, &mut report)
                    .await?;
            }
        }

        self.state.last_cycle_at = Some(now);
        self.state.last_error = None;
        debug!(
            symbol = %self.pair.symbol,
            side = %self.state.side(),
            fud_mode = %self.state.fud_mode,
            "Cycle complete"
        );
        Ok(report)
    }

    async fn refresh_inputs(&mut self, now: DateTime<Utc>) -> TraderResult<CycleInputs> {
        let market = &self.cfg.market;
        let btc_candles = self
            .exchange
            .klines(&market.btc_symbol, &market.btc_interval, market.btc_candles)
            .await?;
        let coin_candles = self
            .exchange
            .klines(&self.pair.symbol, &market.coin_interval, market.coin_candles)
            .await?;
        let btc = calculate_ichimoku(&btc_candles).analysis;
        let coin = calculate_ichimoku(&coin_candles).analysis;

        let community = self.pair.community_id.clone();
        let from = now - Duration::hours(self.cfg.activity.lookback_hours);
        // an empty series reads as a plateau; a failed call aborts the cycle
        let activity =
            analyze_activity_trend(&self.activity.get_activity(&community, from, now).await?);
        let fud_activity =
            analyze_fud_activity_trend(&self.activity.get_fud_activity(&community, from, now).await?);

        let advisory = self.advisory.clone();
        let ttl = self.cfg.advisory.cache_ttl();
        let retries = self.cfg.advisory.retries;
        let sentiment = refresh_cached(&mut self.state.sentiment, "sentiment", now, ttl, retries, || {
            advisory.analyze_sentiment(&community)
        })
        .await;
        let fud_attack = refresh_cached(&mut self.state.fud_attack, "fud_attack", now, ttl, retries, || {
            advisory.analyze_fud_attack(&community)
        })
        .await;

        if fud_attack.is_fetched() {
            if let Some(attack) = fud_attack.value() {
                self.record_fud_attack(attack, now).await;
            }
        }

        Ok(CycleInputs {
            btc,
            coin,
            activity,
            fud_activity,
            sentiment: sentiment.into_value(),
            fud_attack: fud_attack.into_value(),
        })
    }

    async fn follow_combinator(
        &mut self,
        layers: LayerSignals,
        fresh_attack: bool,
        inputs: &CycleInputs,
        now: DateTime<Utc>,
        report: &mut CycleReport,
    ) -> TraderResult<()> {
        let decision = combine(layers).with_fud_attack(fresh_attack);
        let key = decision.key();
        let decision_id = self.record_decision(&decision, now).await;
        report.decision = Some(decision.clone());

        let wanted = decision.final_signal.as_side();
        // an open position is only ever closed by the exit rules, never flipped here
        if wanted.is_flat() || !self.state.side().is_flat() {
            self.state.last_decision = Some(key);
            return Ok(());
        }

        if !self.gate.should_consult(
            &key,
            self.state.last_decision.as_ref(),
            self.state.rejection.as_ref(),
            now,
        ) {
            debug!(symbol = %self.pair.symbol, "Decision unchanged since last cycle, not re-submitting");
            return Ok(());
        }

        let request = OrderValidationRequest {
            symbol: self.pair.symbol.clone(),
            current_side: self.state.side(),
            decision: decision.clone(),
            btc_ichimoku: inputs.btc.clone(),
            coin_ichimoku: inputs.coin.clone(),
            activity: inputs.activity,
            fud_activity: inputs.fud_activity,
            sentiment: inputs.sentiment.clone(),
        };
        let verdict = self
            .gate
            .check(&request, &key, decision_id, &mut self.state.rejection, now)
            .await;
        let allowed = verdict.allows_open();
        report.gate = Some(verdict);

        if allowed {
            let record = self
                .lifecycle
                .open(&mut self.state, wanted, &decision.reason, decision_id, now)
                .await?;
            report.opened = Some(record);
        }
        self.state.last_decision = Some(key);
        Ok(())
    }

    async fn follow_fud_override(
        &mut self,
        fud: FudStep,
        layers: LayerSignals,
        now: DateTime<Utc>,
        report: &mut CycleReport,
    ) -> TraderResult<()> {
        let decision = fud.reason.map(|reason| {
            let signal = if fud.action == FudAction::ForceShort {
                TradeSignal::Short
            } else {
                TradeSignal::Empty
            };
            let explanation = match fud.action {
                FudAction::ForceShort => "FUD attack in progress and coin Ichimoku turned SHORT",
                FudAction::Exit => "FUD override finished",
                _ => "Fresh FUD attack detected, waiting for coin Ichimoku SHORT",
            };
            TradingDecision::forced(layers, signal, reason, explanation)
        });
        let decision_id = match &decision {
            Some(d) => self.record_decision(d, now).await,
            None => None,
        };

        match fud.action {
            FudAction::ForceShort => {
                if self.state.side() == PositionSide::Long {
                    let closed = self
                        .lifecycle
                        .close(&mut self.state, REASON_FUD_ATTACK_FORCED, now)
                        .await?;
                    report.closed.push(closed);
                }
                if self.state.side().is_flat() {
                    let opened = self
                        .lifecycle
                        .open(&mut self.state, PositionSide::Short, REASON_FUD_ATTACK_FORCED, decision_id, now)
                        .await?;
                    report.opened = Some(opened);
                }
            }
            FudAction::Exit => {
                if self.state.side() == PositionSide::Short {
                    let reason = fud.reason.unwrap_or(REASON_FUD_MODE_EXIT);
                    let closed = self.lifecycle.close(&mut self.state, reason, now).await?;
                    report.closed.push(closed);
                }
            }
            FudAction::Hold | FudAction::PassThrough => {}
        }

        if fud.next != self.state.fud_mode {
            info!(
                symbol = %self.pair.symbol,
                from = %self.state.fud_mode,
                to = %fud.next,
                reason = fud.reason.unwrap_or("-"),
                "🛡️ FUD override transition"
            );
        }
        self.state.fud_mode = fud.next;
        if let Some(decision) = decision {
            self.state.last_decision = Some(decision.key());
            report.decision = Some(decision);
        }
        Ok(())
    }

    async fn evaluate_exits(
        &mut self,
        uuid: &str,
        snapshot_count: usize,
        current_pnl: f64,
        inputs: &CycleInputs,
        now: DateTime<Utc>,
        report: &mut CycleReport,
    ) -> TraderResult<()> {
        let side = self.state.side();
        let snapshots = self.store.snapshots(uuid).await?;
        let ma = evaluate_ma_exit(&snapshots, current_pnl, &self.cfg.exit);
        let ichimoku_exit = close_reason(&inputs.coin, side);

        let mut close_with = None;
        if is_close_analysis_milestone(snapshot_count, self.cfg.advisory.close_analysis_every) {
            match self
                .close_analysis(uuid, &snapshots, &ma, &ichimoku_exit, inputs, now)
                .await
            {
                Ok(recommendation) => {
                    // the moving-average signal makes the close mandatory
                    if ma.should_close || recommendation.should_close {
                        close_with = Some(REASON_AI_CLOSE);
                    }
                    report.close_recommendation = Some(recommendation);
                }
                Err(e) => {
                    warn!(symbol = %self.pair.symbol, error = %e, "Close analysis unavailable");
                    if ma.should_close {
                        close_with = Some(REASON_MOVING_AVERAGE_EXIT);
                    }
                }
            }
        } else if ma.should_close {
            close_with = Some(REASON_MOVING_AVERAGE_EXIT);
        }

        if close_with.is_none() && ichimoku_exit.should_close {
            info!(
                symbol = %self.pair.symbol,
                reasons = %ichimoku_exit.reasons.join("; "),
                "☁️ Ichimoku exit"
            );
            close_with = Some(REASON_ICHIMOKU_EXIT);
        }
        report.ma_signal = Some(ma);

        if let Some(reason) = close_with {
            let closed = self.lifecycle.close(&mut self.state, reason, now).await?;
            report.closed.push(closed);
        }
        Ok(())
    }

    async fn close_analysis(
        &mut self,
        uuid: &str,
        snapshots: &[PositionSnapshot],
        ma: &MovingAverageSignal,
        ichimoku_exit: &ClosePositionReason,
        inputs: &CycleInputs,
        now: DateTime<Utc>,
    ) -> TraderResult<CloseRecommendation> {
        let position = self.store.position(uuid).await?.ok_or_else(|| TraderError::InconsistentState {
            symbol: self.pair.symbol.clone(),
            reason: format!("no record for position {uuid}"),
        })?;

        let messages = match self
            .activity
            .get_recent_messages(&self.pair.community_id, self.cfg.activity.recent_messages)
            .await
        {
            Ok(messages) => messages,
            Err(e) => {
                warn!(symbol = %self.pair.symbol, error = %e, "Recent messages unavailable");
                Vec::new()
            }
        };
        let request = CloseAnalysisRequest {
            snapshot_statistics: calculate_snapshot_statistics(snapshots),
            recent_messages: messages,
            btc_ichimoku: inputs.btc.clone(),
            coin_ichimoku: inputs.coin.clone(),
            current_position_short_or_long: position.side,
            should_close_by_ichimoku: ichimoku_exit.clone(),
            moving_average_signal: ma.clone(),
            current_date: now.to_rfc3339(),
            position_open_date: position.opened_at.to_rfc3339(),
            position,
        };

        let recommendation = self.advisory.recommend_close(&request).await?;
        info!(
            symbol = %self.pair.symbol,
            uuid,
            should_close = recommendation.should_close,
            ma_should_close = ma.should_close,
            confidence = recommendation.confidence_percent,
            "🤖 Close analysis"
        );

        let record = CloseAnalysisRecord {
            position_uuid: uuid.to_string(),
            symbol: self.pair.symbol.clone(),
            snapshot_count: snapshots.len(),
            should_close: recommendation.should_close,
            confidence_percent: recommendation.confidence_percent,
            justification: recommendation.justification.clone(),
            expected_pnl: recommendation.expected_pnl,
            risk_assessment: recommendation.risk_assessment.clone(),
            ma_should_close: ma.should_close,
            request_data: serde_json::to_string(&request).unwrap_or_default(),
            response_data: serde_json::to_string(&recommendation).unwrap_or_default(),
            created_at: now,
        };
        if let Err(e) = self.store.append_close_analysis(&record).await {
            warn!(symbol = %self.pair.symbol, error = %e, "Failed to record close analysis");
        }
        Ok(recommendation)
    }

    /// Persist a decision unless it repeats the latest one; returns its id
    async fn record_decision(&self, decision: &TradingDecision, now: DateTime<Utc>) -> Option<u64> {
        let record = decision.to_record(&self.pair.symbol, now);
        match self.store.latest_decision(&self.pair.symbol).await {
            Ok(Some(latest)) if latest.same_content(&record) => Some(latest.id),
            Ok(_) => match self.store.append_decision(record).await {
                Ok(id) => {
                    info!(
                        symbol = %self.pair.symbol,
                        decision_id = id,
                        signal = %decision.final_signal,
                        reason = %decision.reason,
                        "🧭 New trading decision"
                    );
                    Some(id)
                }
                Err(e) => {
                    warn!(symbol = %self.pair.symbol, error = %e, "Failed to record decision");
                    None
                }
            },
            Err(e) => {
                warn!(symbol = %self.pair.symbol, error = %e, "Failed to read latest decision");
                None
            }
        }
    }

    async fn record_fud_attack(&self, attack: &FudAttackResult, now: DateTime<Utc>) {
        let record = FudAttackRecord {
            position_uuid: self.state.correlation_id().map(str::to_string),
            symbol: self.pair.symbol.clone(),
            has_attack: attack.has_attack,
            confidence: attack.confidence,
            message_count: attack.message_count,
            fud_type: attack.fud_type.clone(),
            theme: attack.theme.clone(),
            started_hours_ago: attack.started_hours_ago,
            last_attack_time: attack.last_attack_time,
            justification: attack.justification.clone(),
            participants: attack
                .participants
                .iter()
                .map(|p| p.username.as_str())
                .collect::<Vec<_>>()
                .join(","),
            created_at: now,
        };
        if let Err(e) = self.store.append_fud_attack(&record).await {
            warn!(symbol = %self.pair.symbol, error = %e, "Failed to record FUD attack");
        }
    }
}
