//! Position lifecycle: FLAT -> OPEN(side) -> FLAT
//!
//! Every exchange call that can fail happens before the state is touched, so
//! a failed order leaves `TradingState` exactly as it was.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::state::{OpenPosition, TradingState};
use crate::config::TradingPairConfig;
use crate::errors::{TraderError, TraderResult};
use crate::exchange::Exchange;
use crate::persistence::{PositionClose, PositionRecord, PositionSnapshot, TradeStore};
use crate::types::{ExchangePosition, PositionSide};

pub const REASON_RESTORED: &str = "restored_from_exchange";
pub const REASON_NO_EXCHANGE_POSITION: &str = "no_exchange_position_on_init";
pub const REASON_CLOSED_ON_EXCHANGE: &str = "closed_on_exchange";

/// Result of a per-cycle position refresh
#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotOutcome {
    Flat,
    Recorded {
        snapshot_count: usize,
        current_pnl: f64,
        record: PositionRecord,
    },
    /// The tracked position is gone from the exchange; the record is finalized
    ClosedOnExchange(PositionRecord),
}

/// What startup reconciliation did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    pub adopted: Option<String>,
    pub restored: Option<String>,
    pub force_closed: Vec<String>,
    pub orphans_deleted: Vec<String>,
}

pub struct PositionLifecycle {
    exchange: Arc<dyn Exchange>,
    store: Arc<dyn TradeStore>,
    pair: TradingPairConfig,
}

impl PositionLifecycle {
    pub fn new(exchange: Arc<dyn Exchange>, store: Arc<dyn TradeStore>, pair: TradingPairConfig) -> Self {
        Self {
            exchange,
            store,
            pair,
        }
    }

    fn symbol(&self) -> &str {
        &self.pair.symbol
    }

    /// Market-open `side` and start a new position record
    pub async fn open(
        &self,
        state: &mut TradingState,
        side: PositionSide,
        reason: &str,
        decision_id: Option<u64>,
        now: DateTime<Utc>,
    ) -> TraderResult<PositionRecord> {
        if let Some(current) = &state.position {
            return Err(TraderError::InconsistentState {
                symbol: self.symbol().to_string(),
                reason: format!("cannot open {side} while {} is open", current.side),
            });
        }

        let live = self
            .exchange
            .open_position(self.symbol(), side, self.pair.leverage, self.pair.quantity)
            .await?;

        let uuid = Uuid::new_v4().to_string();
        let record = PositionRecord {
            uuid: uuid.clone(),
            symbol: self.symbol().to_string(),
            side,
            leverage: live.leverage,
            quantity: live.amount.abs(),
            entry_price: live.entry_price,
            opened_at: now,
            is_closed: false,
            closed_at: None,
            close_price: None,
            realized_pnl: None,
            current_pnl: live.unrealized_pnl,
            current_mark_price: live.entry_price,
            max_pnl: live.unrealized_pnl,
            min_pnl: live.unrealized_pnl,
            duration_ms: None,
            open_reason: reason.to_string(),
            close_reason: None,
            created_at: now,
            updated_at: now,
        };

        // untracked until the record exists; a live position without one is
        // adopted by the next startup reconcile
        if let Err(e) = self.store.save_position(&record).await {
            error!(
                symbol = %self.symbol(),
                side = %side,
                error = %e,
                "Opened on exchange but the position record could not be saved"
            );
            return Err(e);
        }
        state.position = Some(OpenPosition {
            side,
            opened_at: now,
            open_reason: reason.to_string(),
            correlation_id: uuid.clone(),
        });
        info!(
            symbol = %self.symbol(),
            uuid = %uuid,
            side = %side,
            entry = live.entry_price,
            reason,
            "📈 [{}] Opened {}",
            self.symbol(),
            side
        );

        if let Some(id) = decision_id {
            if let Err(e) = self.store.link_decision(id, &uuid).await {
                warn!(symbol = %self.symbol(), decision_id = id, error = %e, "Failed to link decision");
            }
        }
        Ok(record)
    }

    /// Read the live position, append a snapshot and update the record
    pub async fn snapshot(
        &self,
        state: &mut TradingState,
        now: DateTime<Utc>,
    ) -> TraderResult<SnapshotOutcome> {
        let tracked = match &state.position {
            Some(p) => p.clone(),
            None => return Ok(SnapshotOutcome::Flat),
        };

        let live = match self.exchange.get_position(self.symbol()).await? {
            Some(live) if live.side == tracked.side => live,
            Some(live) => {
                return Err(TraderError::InconsistentState {
                    symbol: self.symbol().to_string(),
                    reason: format!("tracking {} but exchange holds {}", tracked.side, live.side),
                })
            }
            None => {
                let record = self.position_record(&tracked.correlation_id).await?;
                warn!(
                    symbol = %self.symbol(),
                    uuid = %tracked.correlation_id,
                    "⚠️ Position no longer on exchange, finalizing"
                );
                state.position = None;
                let closed = self
                    .store
                    .finalize_position(
                        &tracked.correlation_id,
                        PositionClose {
                            close_price: record.current_mark_price,
                            realized_pnl: record.current_pnl,
                            reason: REASON_CLOSED_ON_EXCHANGE.to_string(),
                            closed_at: now,
                        },
                    )
                    .await?;
                return Ok(SnapshotOutcome::ClosedOnExchange(closed));
            }
        };

        let mark = self.exchange.get_mark_price(self.symbol()).await?;
        let snapshot = PositionSnapshot {
            position_uuid: tracked.correlation_id.clone(),
            symbol: self.symbol().to_string(),
            side: live.side,
            leverage: live.leverage,
            entry_price: live.entry_price,
            amount: live.amount,
            unrealized_pnl: live.unrealized_pnl,
            mark_price: mark,
            position_opened_at: tracked.opened_at,
            created_at: now,
        };
        let snapshot_count = self.store.append_snapshot(&snapshot).await?;
        let record = self
            .store
            .update_position_mark(&tracked.correlation_id, live.unrealized_pnl, mark, now)
            .await?;

        Ok(SnapshotOutcome::Recorded {
            snapshot_count,
            current_pnl: live.unrealized_pnl,
            record,
        })
    }

    /// Market-close the open position and finalize its record
    pub async fn close(
        &self,
        state: &mut TradingState,
        reason: &str,
        now: DateTime<Utc>,
    ) -> TraderResult<PositionRecord> {
        let tracked = state.position.clone().ok_or_else(|| TraderError::InconsistentState {
            symbol: self.symbol().to_string(),
            reason: "no open position to close".into(),
        })?;
        let record = self.position_record(&tracked.correlation_id).await?;

        // final read; the order itself is what has to succeed
        let final_pnl = match self.exchange.get_position(self.symbol()).await {
            Ok(Some(live)) => live.unrealized_pnl,
            Ok(None) => record.current_pnl,
            Err(e) => {
                warn!(symbol = %self.symbol(), error = %e, "Final position read failed, using last snapshot");
                record.current_pnl
            }
        };
        let close_price = match self.exchange.get_mark_price(self.symbol()).await {
            Ok(price) => price,
            Err(_) => record.current_mark_price,
        };

        self.exchange.close_position(self.symbol(), tracked.side).await?;
        state.position = None;

        let closed = self
            .store
            .finalize_position(
                &tracked.correlation_id,
                PositionClose {
                    close_price,
                    realized_pnl: final_pnl,
                    reason: reason.to_string(),
                    closed_at: now,
                },
            )
            .await?;

        let emoji = if final_pnl >= 0.0 { "💰" } else { "📉" };
        info!(
            symbol = %self.symbol(),
            uuid = %tracked.correlation_id,
            pnl = final_pnl,
            reason,
            "{} [{}] Closed {}",
            emoji,
            self.symbol(),
            tracked.side
        );
        Ok(closed)
    }

    /// Align persisted records and `state` with the exchange at loop start
    pub async fn reconcile(
        &self,
        state: &mut TradingState,
        now: DateTime<Utc>,
    ) -> TraderResult<ReconcileReport> {
        let live = self.exchange.get_position(self.symbol()).await?;
        let open_records = self.store.open_positions(self.symbol()).await?;
        let mut report = ReconcileReport::default();

        let Some(live) = live else {
            for record in open_records {
                warn!(
                    symbol = %self.symbol(),
                    uuid = %record.uuid,
                    "⚠️ Open record without exchange position, force-closing"
                );
                self.store
                    .finalize_position(
                        &record.uuid,
                        PositionClose {
                            close_price: record.current_mark_price,
                            realized_pnl: record.current_pnl,
                            reason: REASON_NO_EXCHANGE_POSITION.to_string(),
                            closed_at: now,
                        },
                    )
                    .await?;
                report.force_closed.push(record.uuid);
            }
            state.position = None;
            return Ok(report);
        };

        let (same_side, opposite): (Vec<PositionRecord>, Vec<PositionRecord>) =
            open_records.into_iter().partition(|r| r.side == live.side);

        for orphan in opposite {
            warn!(
                symbol = %self.symbol(),
                uuid = %orphan.uuid,
                side = %orphan.side,
                "⚠️ Deleting orphaned opposite-side record"
            );
            self.store.delete_position(&orphan.uuid).await?;
            report.orphans_deleted.push(orphan.uuid);
        }

        // newest same-side record wins, older duplicates are closed out
        let mut same_side = same_side;
        let adopted = same_side.pop();
        for stale in same_side {
            self.store
                .finalize_position(
                    &stale.uuid,
                    PositionClose {
                        close_price: stale.current_mark_price,
                        realized_pnl: stale.current_pnl,
                        reason: REASON_NO_EXCHANGE_POSITION.to_string(),
                        closed_at: now,
                    },
                )
                .await?;
            report.force_closed.push(stale.uuid);
        }

        let record = match adopted {
            Some(record) => {
                info!(symbol = %self.symbol(), uuid = %record.uuid, side = %record.side, "♻️ Adopted open position record");
                report.adopted = Some(record.uuid.clone());
                record
            }
            None => {
                let record = self.restored_record(&live, now);
                self.store.save_position(&record).await?;
                info!(symbol = %self.symbol(), uuid = %record.uuid, side = %record.side, "♻️ Restored position from exchange");
                report.restored = Some(record.uuid.clone());
                record
            }
        };

        state.position = Some(OpenPosition {
            side: record.side,
            opened_at: record.opened_at,
            open_reason: record.open_reason.clone(),
            correlation_id: record.uuid.clone(),
        });
        Ok(report)
    }

    fn restored_record(&self, live: &ExchangePosition, now: DateTime<Utc>) -> PositionRecord {
        PositionRecord {
            uuid: Uuid::new_v4().to_string(),
            symbol: self.symbol().to_string(),
            side: live.side,
            leverage: live.leverage,
            quantity: live.amount.abs(),
            entry_price: live.entry_price,
            opened_at: now,
            is_closed: false,
            closed_at: None,
            close_price: None,
            realized_pnl: None,
            current_pnl: live.unrealized_pnl,
            current_mark_price: live.entry_price,
            max_pnl: live.unrealized_pnl,
            min_pnl: live.unrealized_pnl,
            duration_ms: None,
            open_reason: REASON_RESTORED.to_string(),
            close_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    async fn position_record(&self, uuid: &str) -> TraderResult<PositionRecord> {
        self.store.position(uuid).await?.ok_or_else(|| {
            error!(symbol = %self.symbol(), uuid, "Tracked position has no record");
            TraderError::InconsistentState {
                symbol: self.symbol().to_string(),
                reason: format!("no record for position {uuid}"),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::PaperExchange;
    use crate::persistence::CsvPersistence;
    use crate::testing::ScriptedMarket;
    use chrono::Duration;

    fn temp_data_dir(test_name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!(
            "fudtrader_lifecycle_{}_{}",
            test_name,
            uuid::Uuid::new_v4()
        ))
    }

    fn pair() -> TradingPairConfig {
        TradingPairConfig {
            symbol: "DOGEUSDT".into(),
            community_id: "42".into(),
            leverage: 5,
            quantity: 100.0,
        }
    }

    struct Fixture {
        market: Arc<ScriptedMarket>,
        paper: Arc<PaperExchange>,
        store: Arc<CsvPersistence>,
        lifecycle: PositionLifecycle,
        dir: std::path::PathBuf,
    }

    fn fixture(name: &str) -> Fixture {
        let dir = temp_data_dir(name);
        let market = Arc::new(ScriptedMarket::new());
        market.set_mark("DOGEUSDT", 1.0);
        let paper = Arc::new(PaperExchange::new(market.clone()));
        let store = Arc::new(CsvPersistence::new(&dir).unwrap());
        let lifecycle = PositionLifecycle::new(paper.clone(), store.clone(), pair());
        Fixture {
            market,
            paper,
            store,
            lifecycle,
            dir,
        }
    }

    #[tokio::test]
    async fn open_snapshot_close_yields_one_closed_record() {
        let f = fixture("round_trip");
        let mut state = TradingState::new("DOGEUSDT");
        let t0 = Utc::now();

        let opened = f
            .lifecycle
            .open(&mut state, PositionSide::Long, "signals_aligned", None, t0)
            .await
            .unwrap();
        assert_eq!(state.side(), PositionSide::Long);

        for (i, mark) in [1.02, 0.97, 1.05].iter().enumerate() {
            f.market.set_mark("DOGEUSDT", *mark);
            let outcome = f
                .lifecycle
                .snapshot(&mut state, t0 + Duration::minutes(i as i64 + 1))
                .await
                .unwrap();
            assert!(matches!(outcome, SnapshotOutcome::Recorded { snapshot_count, .. } if snapshot_count == i + 1));
        }

        f.market.set_mark("DOGEUSDT", 1.01);
        let closed = f
            .lifecycle
            .close(&mut state, "ichimoku_exit", t0 + Duration::minutes(5))
            .await
            .unwrap();

        assert_eq!(state.side(), PositionSide::Flat);
        assert!(closed.is_closed);
        assert_eq!(closed.uuid, opened.uuid);
        assert!(closed.duration_ms.unwrap() >= 0);
        assert!((closed.max_pnl - 5.0).abs() < 1e-9);
        assert!((closed.min_pnl + 3.0).abs() < 1e-9);
        assert!((closed.realized_pnl.unwrap() - 1.0).abs() < 1e-9);

        let records = f.store.positions("DOGEUSDT").await.unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].is_closed);

        let _ = std::fs::remove_dir_all(&f.dir);
    }

    #[tokio::test]
    async fn failed_open_leaves_state_untouched() {
        let f = fixture("failed_open");
        let mut state = TradingState::new("DOGEUSDT");
        f.paper
            .open_position("DOGEUSDT", PositionSide::Short, 5, 1.0)
            .await
            .unwrap();

        // paper exchange refuses a second position on the symbol
        let err = f
            .lifecycle
            .open(&mut state, PositionSide::Long, "signals_aligned", None, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, TraderError::OrderExecution { .. }));
        assert!(state.position.is_none());
        assert!(f.store.positions("DOGEUSDT").await.unwrap().is_empty());

        let _ = std::fs::remove_dir_all(&f.dir);
    }

    #[tokio::test]
    async fn unsaved_record_leaves_state_flat() {
        let f = fixture("unsaved_record");
        let mut state = TradingState::new("DOGEUSDT");

        // positions.json can no longer be written
        std::fs::remove_dir_all(&f.dir).unwrap();
        let err = f
            .lifecycle
            .open(&mut state, PositionSide::Long, "signals_aligned", None, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, TraderError::Io(_)));
        assert!(state.position.is_none());
        assert!(f.store.open_positions("DOGEUSDT").await.unwrap().is_empty());

        // nothing is tracked, so the next refresh is a no-op rather than an error
        let outcome = f.lifecycle.snapshot(&mut state, Utc::now()).await.unwrap();
        assert_eq!(outcome, SnapshotOutcome::Flat);

        // the filled order is picked up on the next start
        std::fs::create_dir_all(&f.dir).unwrap();
        let report = f.lifecycle.reconcile(&mut state, Utc::now()).await.unwrap();
        assert!(report.restored.is_some());
        assert_eq!(state.side(), PositionSide::Long);

        let _ = std::fs::remove_dir_all(&f.dir);
    }

    #[tokio::test]
    async fn vanished_position_is_closed_on_exchange() {
        let f = fixture("vanished");
        let mut state = TradingState::new("DOGEUSDT");
        f.lifecycle
            .open(&mut state, PositionSide::Short, "fud_attack_forced", None, Utc::now())
            .await
            .unwrap();
        f.paper
            .close_position("DOGEUSDT", PositionSide::Short)
            .await
            .unwrap();

        let outcome = f.lifecycle.snapshot(&mut state, Utc::now()).await.unwrap();
        match outcome {
            SnapshotOutcome::ClosedOnExchange(record) => {
                assert_eq!(record.close_reason.as_deref(), Some(REASON_CLOSED_ON_EXCHANGE));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(state.position.is_none());

        let _ = std::fs::remove_dir_all(&f.dir);
    }

    #[tokio::test]
    async fn reconcile_restores_and_force_closes() {
        let f = fixture("reconcile");
        let mut state = TradingState::new("DOGEUSDT");

        // record left open by a previous run, nothing on the exchange
        f.lifecycle
            .open(&mut state, PositionSide::Long, "signals_aligned", None, Utc::now())
            .await
            .unwrap();
        f.paper
            .close_position("DOGEUSDT", PositionSide::Long)
            .await
            .unwrap();

        let mut fresh = TradingState::new("DOGEUSDT");
        let report = f.lifecycle.reconcile(&mut fresh, Utc::now()).await.unwrap();
        assert_eq!(report.force_closed.len(), 1);
        assert!(fresh.position.is_none());
        let closed = f.store.position(&report.force_closed[0]).await.unwrap().unwrap();
        assert_eq!(closed.close_reason.as_deref(), Some(REASON_NO_EXCHANGE_POSITION));

        // live position with no record gets a synthesized one
        f.paper
            .open_position("DOGEUSDT", PositionSide::Short, 5, 10.0)
            .await
            .unwrap();
        let mut restarted = TradingState::new("DOGEUSDT");
        let report = f.lifecycle.reconcile(&mut restarted, Utc::now()).await.unwrap();
        let restored = report.restored.unwrap();
        assert_eq!(restarted.side(), PositionSide::Short);
        assert_eq!(restarted.correlation_id(), Some(restored.as_str()));
        assert_eq!(restarted.position.unwrap().open_reason, REASON_RESTORED);

        let _ = std::fs::remove_dir_all(&f.dir);
    }

    #[tokio::test]
    async fn reconcile_adopts_same_side_and_deletes_opposite() {
        let f = fixture("adopt");
        let now = Utc::now();
        let mut first = TradingState::new("DOGEUSDT");
        let long = f
            .lifecycle
            .open(&mut first, PositionSide::Long, "signals_aligned", None, now)
            .await
            .unwrap();
        f.paper
            .close_position("DOGEUSDT", PositionSide::Long)
            .await
            .unwrap();

        let mut second = TradingState::new("DOGEUSDT");
        let short = f
            .lifecycle
            .open(&mut second, PositionSide::Short, "fud_attack_forced", None, now + Duration::seconds(1))
            .await
            .unwrap();

        let mut restarted = TradingState::new("DOGEUSDT");
        let report = f.lifecycle.reconcile(&mut restarted, now).await.unwrap();
        assert_eq!(report.adopted.as_deref(), Some(short.uuid.as_str()));
        assert_eq!(report.orphans_deleted, vec![long.uuid.clone()]);
        assert!(f.store.position(&long.uuid).await.unwrap().is_none());
        assert_eq!(restarted.position.unwrap().open_reason, "fud_attack_forced");

        let _ = std::fs::remove_dir_all(&f.dir);
    }
}
