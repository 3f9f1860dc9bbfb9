//! CSV-backed trade store
//!
//! Append-only CSV files for snapshots, decisions and advisory audit rows;
//! position records live in `positions.json`, rewritten through a temp file
//! on every change. Everything is loaded back into memory at startup.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use csv::{ReaderBuilder, WriterBuilder};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock as AsyncRwLock;
use tracing::{debug, info, warn};

use super::{
    CloseAnalysisRecord, DecisionLink, FudAttackRecord, OrderValidationRecord, PositionClose,
    PositionRecord, PositionSnapshot, TradeStore, TradingDecisionRecord,
};
use crate::errors::{TraderError, TraderResult};

const POSITIONS_FILE: &str = "positions.json";
const SNAPSHOTS_FILE: &str = "position_snapshots.csv";
const DECISIONS_FILE: &str = "trading_decisions.csv";
const DECISION_LINKS_FILE: &str = "decision_links.csv";
const FUD_ATTACKS_FILE: &str = "fud_attacks.csv";
const ORDER_VALIDATIONS_FILE: &str = "order_validations.csv";
const CLOSE_ANALYSES_FILE: &str = "close_analyses.csv";

/// Decisions kept in memory; older ones stay on disk only
const DEFAULT_DECISION_HISTORY: usize = 5_000;

type CsvWriter = Arc<AsyncRwLock<csv::Writer<fs::File>>>;

pub struct CsvPersistence {
    data_dir: PathBuf,
    positions: AsyncRwLock<HashMap<String, PositionRecord>>,
    snapshots: AsyncRwLock<HashMap<String, Vec<PositionSnapshot>>>,
    decisions: AsyncRwLock<Vec<TradingDecisionRecord>>,
    decision_history: usize,
    snapshot_writer: CsvWriter,
    decision_writer: CsvWriter,
    link_writer: CsvWriter,
    fud_writer: CsvWriter,
    validation_writer: CsvWriter,
    close_analysis_writer: CsvWriter,
}

impl CsvPersistence {
    /// Open (or create) the store under `data_dir` and load existing history.
    ///
    /// Snapshot history is only held for positions that are still open.
    pub fn new(data_dir: impl AsRef<Path>) -> TraderResult<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        fs::create_dir_all(&data_dir).map_err(|e| {
            TraderError::persistence(format!(
                "failed to create data directory {}: {e}",
                data_dir.display()
            ))
        })?;

        let positions = load_positions(&data_dir.join(POSITIONS_FILE))?;

        let mut snapshots: HashMap<String, Vec<PositionSnapshot>> = HashMap::new();
        for snapshot in load_rows::<PositionSnapshot>(&data_dir.join(SNAPSHOTS_FILE))? {
            let open = positions
                .get(&snapshot.position_uuid)
                .map_or(false, |p| !p.is_closed);
            if !open {
                continue;
            }
            snapshots
                .entry(snapshot.position_uuid.clone())
                .or_default()
                .push(snapshot);
        }

        let mut decisions = load_rows::<TradingDecisionRecord>(&data_dir.join(DECISIONS_FILE))?;
        let links = load_rows::<DecisionLink>(&data_dir.join(DECISION_LINKS_FILE))?;
        for link in links {
            if let Some(decision) = decisions.iter_mut().find(|d| d.id == link.decision_id) {
                decision.position_uuid = Some(link.position_uuid);
            }
        }
        trim_oldest(&mut decisions, DEFAULT_DECISION_HISTORY);

        info!(
            data_dir = %data_dir.display(),
            positions = positions.len(),
            snapshots = snapshots.values().map(Vec::len).sum::<usize>(),
            decisions = decisions.len(),
            "📁 Trade store initialized"
        );

        Ok(Self {
            snapshot_writer: create_writer(&data_dir, SNAPSHOTS_FILE)?,
            decision_writer: create_writer(&data_dir, DECISIONS_FILE)?,
            link_writer: create_writer(&data_dir, DECISION_LINKS_FILE)?,
            fud_writer: create_writer(&data_dir, FUD_ATTACKS_FILE)?,
            validation_writer: create_writer(&data_dir, ORDER_VALIDATIONS_FILE)?,
            close_analysis_writer: create_writer(&data_dir, CLOSE_ANALYSES_FILE)?,
            data_dir,
            positions: AsyncRwLock::new(positions),
            snapshots: AsyncRwLock::new(snapshots),
            decisions: AsyncRwLock::new(decisions),
            decision_history: DEFAULT_DECISION_HISTORY,
        })
    }

    /// Keep at most `limit` decisions in memory
    pub fn with_decision_history(mut self, limit: usize) -> Self {
        self.decision_history = limit.max(1);
        trim_oldest(self.decisions.get_mut(), self.decision_history);
        self
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Rewrite positions.json; caller holds the positions lock
    fn write_positions(&self, positions: &HashMap<String, PositionRecord>) -> TraderResult<()> {
        let mut records: Vec<&PositionRecord> = positions.values().collect();
        records.sort_by(|a, b| a.opened_at.cmp(&b.opened_at).then(a.uuid.cmp(&b.uuid)));

        let path = self.data_dir.join(POSITIONS_FILE);
        let tmp = self.data_dir.join(format!("{POSITIONS_FILE}.tmp"));
        let json = serde_json::to_string_pretty(&records)?;
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    async fn mutate_position<F>(&self, uuid: &str, apply: F) -> TraderResult<PositionRecord>
    where
        F: FnOnce(&mut PositionRecord) -> TraderResult<()>,
    {
        let mut positions = self.positions.write().await;
        let record = positions
            .get_mut(uuid)
            .ok_or_else(|| TraderError::persistence(format!("unknown position {uuid}")))?;
        apply(record)?;
        let updated = record.clone();
        self.write_positions(&positions)?;
        Ok(updated)
    }
}

fn trim_oldest<T>(rows: &mut Vec<T>, limit: usize) {
    if rows.len() > limit {
        rows.drain(..rows.len() - limit);
    }
}

fn create_writer(dir: &Path, filename: &str) -> TraderResult<CsvWriter> {
    let path = dir.join(filename);
    let file_has_data = path.exists() && fs::metadata(&path).map(|m| m.len() > 0).unwrap_or(false);

    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .append(true)
        .open(&path)?;

    let writer = WriterBuilder::new()
        .has_headers(!file_has_data)
        .from_writer(file);

    Ok(Arc::new(AsyncRwLock::new(writer)))
}

async fn append_row<T: Serialize>(writer: &CsvWriter, record: &T) -> TraderResult<()> {
    let mut writer = writer.write().await;
    writer.serialize(record)?;
    writer.flush()?;
    Ok(())
}

fn load_rows<T: DeserializeOwned>(path: &Path) -> TraderResult<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = fs::File::open(path)?;
    let mut reader = ReaderBuilder::new().has_headers(true).from_reader(file);

    let mut rows = Vec::new();
    for (line, result) in reader.deserialize().enumerate() {
        match result {
            Ok(row) => rows.push(row),
            Err(e) => warn!(path = %path.display(), line, error = %e, "Skipping unreadable row"),
        }
    }
    Ok(rows)
}

fn load_positions(path: &Path) -> TraderResult<HashMap<String, PositionRecord>> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let json = fs::read_to_string(path)?;
    let records: Vec<PositionRecord> = serde_json::from_str(&json)?;
    Ok(records.into_iter().map(|r| (r.uuid.clone(), r)).collect())
}

fn closed_error(record: &PositionRecord) -> TraderError {
    TraderError::InconsistentState {
        symbol: record.symbol.clone(),
        reason: format!("position {} is already closed", record.uuid),
    }
}

#[async_trait]
impl TradeStore for CsvPersistence {
    async fn save_position(&self, record: &PositionRecord) -> TraderResult<()> {
        let mut positions = self.positions.write().await;
        positions.insert(record.uuid.clone(), record.clone());
        self.write_positions(&positions)?;
        debug!(uuid = %record.uuid, symbol = %record.symbol, "Position record saved");
        Ok(())
    }

    async fn position(&self, uuid: &str) -> TraderResult<Option<PositionRecord>> {
        Ok(self.positions.read().await.get(uuid).cloned())
    }

    async fn open_positions(&self, symbol: &str) -> TraderResult<Vec<PositionRecord>> {
        let mut open: Vec<PositionRecord> = self
            .positions
            .read()
            .await
            .values()
            .filter(|p| p.symbol == symbol && !p.is_closed)
            .cloned()
            .collect();
        open.sort_by_key(|p| p.opened_at);
        Ok(open)
    }

    async fn positions(&self, symbol: &str) -> TraderResult<Vec<PositionRecord>> {
        let mut all: Vec<PositionRecord> = self
            .positions
            .read()
            .await
            .values()
            .filter(|p| p.symbol == symbol)
            .cloned()
            .collect();
        all.sort_by_key(|p| p.opened_at);
        Ok(all)
    }

    async fn update_position_mark(
        &self,
        uuid: &str,
        current_pnl: f64,
        mark_price: f64,
        at: DateTime<Utc>,
    ) -> TraderResult<PositionRecord> {
        self.mutate_position(uuid, |record| {
            if record.is_closed {
                return Err(closed_error(record));
            }
            record.current_pnl = current_pnl;
            record.current_mark_price = mark_price;
            record.max_pnl = record.max_pnl.max(current_pnl);
            record.min_pnl = record.min_pnl.min(current_pnl);
            record.updated_at = at;
            Ok(())
        })
        .await
    }

    async fn finalize_position(
        &self,
        uuid: &str,
        close: PositionClose,
    ) -> TraderResult<PositionRecord> {
        let extremes = {
            let snapshots = self.snapshots.read().await;
            snapshots.get(uuid).filter(|s| !s.is_empty()).map(|s| {
                s.iter().fold((f64::MIN, f64::MAX), |(max, min), snap| {
                    (max.max(snap.unrealized_pnl), min.min(snap.unrealized_pnl))
                })
            })
        };

        let record = self
            .mutate_position(uuid, |record| {
                if record.is_closed {
                    return Err(closed_error(record));
                }
                if let Some((max, min)) = extremes {
                    record.max_pnl = max;
                    record.min_pnl = min;
                }
                let duration = (close.closed_at - record.opened_at).num_milliseconds();
                record.is_closed = true;
                record.closed_at = Some(close.closed_at);
                record.close_price = Some(close.close_price);
                record.realized_pnl = Some(close.realized_pnl);
                record.current_pnl = close.realized_pnl;
                record.current_mark_price = close.close_price;
                record.duration_ms = Some(duration.max(0));
                record.close_reason = Some(close.reason.clone());
                record.updated_at = close.closed_at;
                Ok(())
            })
            .await?;
        self.snapshots.write().await.remove(uuid);

        info!(
            uuid = %record.uuid,
            symbol = %record.symbol,
            reason = %close.reason,
            pnl = close.realized_pnl,
            "📕 Position record finalized"
        );
        Ok(record)
    }

    async fn delete_position(&self, uuid: &str) -> TraderResult<()> {
        let mut positions = self.positions.write().await;
        if positions.remove(uuid).is_some() {
            self.write_positions(&positions)?;
        }
        self.snapshots.write().await.remove(uuid);
        Ok(())
    }

    async fn append_snapshot(&self, snapshot: &PositionSnapshot) -> TraderResult<usize> {
        append_row(&self.snapshot_writer, snapshot).await?;
        let mut snapshots = self.snapshots.write().await;
        let history = snapshots.entry(snapshot.position_uuid.clone()).or_default();
        history.push(snapshot.clone());
        Ok(history.len())
    }

    async fn snapshots(&self, uuid: &str) -> TraderResult<Vec<PositionSnapshot>> {
        Ok(self
            .snapshots
            .read()
            .await
            .get(uuid)
            .cloned()
            .unwrap_or_default())
    }

    async fn latest_decision(&self, symbol: &str) -> TraderResult<Option<TradingDecisionRecord>> {
        Ok(self
            .decisions
            .read()
            .await
            .iter()
            .rev()
            .find(|d| d.symbol == symbol)
            .cloned())
    }

    async fn append_decision(&self, mut record: TradingDecisionRecord) -> TraderResult<u64> {
        let mut decisions = self.decisions.write().await;
        record.id = decisions.iter().map(|d| d.id).max().unwrap_or(0) + 1;
        append_row(&self.decision_writer, &record).await?;
        let id = record.id;
        decisions.push(record);
        trim_oldest(&mut decisions, self.decision_history);
        Ok(id)
    }

    async fn link_decision(&self, decision_id: u64, position_uuid: &str) -> TraderResult<()> {
        let mut decisions = self.decisions.write().await;
        let decision = decisions
            .iter_mut()
            .find(|d| d.id == decision_id)
            .ok_or_else(|| TraderError::persistence(format!("unknown decision {decision_id}")))?;

        let link = DecisionLink {
            decision_id,
            position_uuid: position_uuid.to_string(),
            linked_at: Utc::now(),
        };
        append_row(&self.link_writer, &link).await?;
        decision.position_uuid = Some(position_uuid.to_string());
        Ok(())
    }

    async fn recent_decisions(
        &self,
        symbol: Option<&str>,
        limit: usize,
    ) -> TraderResult<Vec<TradingDecisionRecord>> {
        Ok(self
            .decisions
            .read()
            .await
            .iter()
            .rev()
            .filter(|d| symbol.map_or(true, |s| d.symbol == s))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn append_fud_attack(&self, record: &FudAttackRecord) -> TraderResult<()> {
        append_row(&self.fud_writer, record).await
    }

    async fn append_order_validation(&self, record: &OrderValidationRecord) -> TraderResult<()> {
        append_row(&self.validation_writer, record).await
    }

    async fn append_close_analysis(&self, record: &CloseAnalysisRecord) -> TraderResult<()> {
        append_row(&self.close_analysis_writer, record).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PositionSide;
    use chrono::Duration;

    fn temp_data_dir(test_name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "fudtrader_persistence_{}_{}",
            test_name,
            uuid::Uuid::new_v4()
        ))
    }

    fn position(uuid: &str, opened_at: DateTime<Utc>) -> PositionRecord {
        PositionRecord {
            uuid: uuid.to_string(),
            symbol: "DOGEUSDT".into(),
            side: PositionSide::Long,
            leverage: 5,
            quantity: 100.0,
            entry_price: 0.1,
            opened_at,
            is_closed: false,
            closed_at: None,
            close_price: None,
            realized_pnl: None,
            current_pnl: 0.0,
            current_mark_price: 0.1,
            max_pnl: 0.0,
            min_pnl: 0.0,
            duration_ms: None,
            open_reason: "signals_aligned".into(),
            close_reason: None,
            created_at: opened_at,
            updated_at: opened_at,
        }
    }

    fn snapshot(uuid: &str, pnl: f64, at: DateTime<Utc>) -> PositionSnapshot {
        PositionSnapshot {
            position_uuid: uuid.to_string(),
            symbol: "DOGEUSDT".into(),
            side: PositionSide::Long,
            leverage: 5,
            entry_price: 0.1,
            amount: 100.0,
            unrealized_pnl: pnl,
            mark_price: 0.1 + pnl / 100.0,
            position_opened_at: at,
            created_at: at,
        }
    }

    fn decision(symbol: &str, final_decision: &str) -> TradingDecisionRecord {
        TradingDecisionRecord {
            id: 0,
            position_uuid: None,
            symbol: symbol.into(),
            btc_ichimoku: "LONG".into(),
            coin_ichimoku: "LONG".into(),
            activity: "EMPTY".into(),
            fud_activity: "EMPTY".into(),
            sentiment: "EMPTY".into(),
            fud_attack: "no".into(),
            final_decision: final_decision.into(),
            reason: "signals_aligned".into(),
            explanation: "ichimoku agrees".into(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn finalize_takes_extremes_from_snapshots() {
        let dir = temp_data_dir("finalize");
        let store = CsvPersistence::new(&dir).unwrap();
        let opened = Utc::now() - Duration::minutes(30);
        store.save_position(&position("p1", opened)).await.unwrap();

        for (i, pnl) in [1.5, -2.0, 4.0, 0.5].iter().enumerate() {
            let count = store
                .append_snapshot(&snapshot("p1", *pnl, opened + Duration::minutes(i as i64)))
                .await
                .unwrap();
            assert_eq!(count, i + 1);
        }

        let closed_at = opened + Duration::minutes(30);
        let record = store
            .finalize_position(
                "p1",
                PositionClose {
                    close_price: 0.105,
                    realized_pnl: 0.5,
                    reason: "moving_average_exit".into(),
                    closed_at,
                },
            )
            .await
            .unwrap();

        assert!(record.is_closed);
        assert_eq!(record.max_pnl, 4.0);
        assert_eq!(record.min_pnl, -2.0);
        assert_eq!(record.duration_ms, Some(30 * 60 * 1000));
        assert_eq!(record.close_reason.as_deref(), Some("moving_average_exit"));
        assert!(store.open_positions("DOGEUSDT").await.unwrap().is_empty());
        assert!(store.snapshots("p1").await.unwrap().is_empty());

        let _ = fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn finalize_without_snapshots_keeps_running_extremes() {
        let dir = temp_data_dir("finalize_empty");
        let store = CsvPersistence::new(&dir).unwrap();
        let opened = Utc::now();
        store.save_position(&position("p2", opened)).await.unwrap();
        store
            .update_position_mark("p2", 3.0, 0.13, opened)
            .await
            .unwrap();
        store
            .update_position_mark("p2", -1.0, 0.09, opened)
            .await
            .unwrap();

        let record = store
            .finalize_position(
                "p2",
                PositionClose {
                    close_price: 0.09,
                    realized_pnl: -1.0,
                    reason: "ichimoku_exit".into(),
                    closed_at: opened - Duration::seconds(5),
                },
            )
            .await
            .unwrap();

        assert_eq!(record.max_pnl, 3.0);
        assert_eq!(record.min_pnl, -1.0);
        assert_eq!(record.duration_ms, Some(0));

        let err = store
            .finalize_position(
                "p2",
                PositionClose {
                    close_price: 0.09,
                    realized_pnl: -1.0,
                    reason: "ichimoku_exit".into(),
                    closed_at: opened,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TraderError::InconsistentState { .. }));

        let _ = fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn decisions_get_sequential_ids_and_links_survive_reload() {
        let dir = temp_data_dir("decisions");
        {
            let store = CsvPersistence::new(&dir).unwrap();
            let first = store.append_decision(decision("DOGEUSDT", "LONG")).await.unwrap();
            let second = store.append_decision(decision("PEPEUSDT", "EMPTY")).await.unwrap();
            assert_eq!((first, second), (1, 2));
            store.link_decision(first, "p9").await.unwrap();
            assert!(store.link_decision(42, "p9").await.is_err());
        }

        let store = CsvPersistence::new(&dir).unwrap();
        let latest = store.latest_decision("DOGEUSDT").await.unwrap().unwrap();
        assert_eq!(latest.id, 1);
        assert_eq!(latest.position_uuid.as_deref(), Some("p9"));

        let next = store.append_decision(decision("DOGEUSDT", "EMPTY")).await.unwrap();
        assert_eq!(next, 3);

        let recent = store.recent_decisions(Some("DOGEUSDT"), 10).await.unwrap();
        assert_eq!(recent.iter().map(|d| d.id).collect::<Vec<_>>(), vec![3, 1]);
        assert_eq!(store.recent_decisions(None, 1).await.unwrap()[0].id, 3);

        let _ = fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn positions_and_snapshots_reload_from_disk() {
        let dir = temp_data_dir("reload");
        let opened = Utc::now();
        {
            let store = CsvPersistence::new(&dir).unwrap();
            store.save_position(&position("p3", opened)).await.unwrap();
            store.append_snapshot(&snapshot("p3", 0.2, opened)).await.unwrap();
            store.append_snapshot(&snapshot("p3", 0.4, opened)).await.unwrap();
        }

        let store = CsvPersistence::new(&dir).unwrap();
        let open = store.open_positions("DOGEUSDT").await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].uuid, "p3");
        assert_eq!(store.snapshots("p3").await.unwrap().len(), 2);
        assert!(!dir.join(format!("{POSITIONS_FILE}.tmp")).exists());

        store.delete_position("p3").await.unwrap();
        assert!(store.position("p3").await.unwrap().is_none());

        let _ = fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn closed_history_is_not_held_in_memory() {
        let dir = temp_data_dir("bounded");
        let opened = Utc::now();
        {
            let store = CsvPersistence::new(&dir).unwrap();
            store.save_position(&position("old", opened)).await.unwrap();
            store.save_position(&position("live", opened)).await.unwrap();
            store.append_snapshot(&snapshot("old", 1.0, opened)).await.unwrap();
            store.append_snapshot(&snapshot("live", 2.0, opened)).await.unwrap();
            store
                .finalize_position(
                    "old",
                    PositionClose {
                        close_price: 0.11,
                        realized_pnl: 1.0,
                        reason: "ichimoku_exit".into(),
                        closed_at: opened,
                    },
                )
                .await
                .unwrap();
        }

        let store = CsvPersistence::new(&dir).unwrap().with_decision_history(3);
        assert!(store.snapshots("old").await.unwrap().is_empty());
        assert_eq!(store.snapshots("live").await.unwrap().len(), 1);
        let closed = store.position("old").await.unwrap().unwrap();
        assert_eq!(closed.max_pnl, 1.0);

        for _ in 0..5 {
            store.append_decision(decision("DOGEUSDT", "LONG")).await.unwrap();
        }
        let recent = store.recent_decisions(None, 10).await.unwrap();
        assert_eq!(recent.iter().map(|d| d.id).collect::<Vec<_>>(), vec![5, 4, 3]);
        // ids keep counting past the trimmed rows
        assert_eq!(store.append_decision(decision("DOGEUSDT", "EMPTY")).await.unwrap(), 6);
        assert_eq!(
            std::fs::read_to_string(dir.join(DECISIONS_FILE)).unwrap().lines().count(),
            7
        );

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn same_content_ignores_ids_and_prose() {
        let mut a = decision("DOGEUSDT", "LONG");
        let mut b = decision("DOGEUSDT", "LONG");
        a.id = 1;
        b.id = 7;
        b.explanation = "different words".into();
        assert!(a.same_content(&b));
        b.sentiment = "SHORT".into();
        assert!(!a.same_content(&b));
    }
}
