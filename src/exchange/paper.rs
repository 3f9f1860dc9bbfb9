//! Paper exchange
//!
//! Simulates market orders against the live mark price of an inner venue.
//! Market data (klines, mark price) passes straight through, positions live
//! in memory and optionally in a JSON state file so a restart resumes them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

use super::Exchange;
use crate::errors::{TraderError, TraderResult};
use crate::types::{Candle, ExchangePosition, PositionSide};

/// Simulated open position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaperPosition {
    pub side: PositionSide,
    pub leverage: u32,
    pub entry_price: f64,
    pub quantity: f64,
    pub opened_at: DateTime<Utc>,
}

impl PaperPosition {
    pub fn unrealized_pnl(&self, mark_price: f64) -> f64 {
        let direction = if self.side == PositionSide::Short { -1.0 } else { 1.0 };
        (mark_price - self.entry_price) * self.quantity * direction
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PaperStats {
    pub total_trades: u32,
    pub winning_trades: u32,
    pub realized_pnl: f64,
}

/// Serializable state for persistence across restarts
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PaperExchangeState {
    positions: HashMap<String, PaperPosition>,
    stats: PaperStats,
}

pub struct PaperExchange {
    market: Arc<dyn Exchange>,
    positions: RwLock<HashMap<String, PaperPosition>>,
    stats: RwLock<PaperStats>,
    state_file: Option<PathBuf>,
}

impl PaperExchange {
    pub fn new(market: Arc<dyn Exchange>) -> Self {
        Self {
            market,
            positions: RwLock::new(HashMap::new()),
            stats: RwLock::new(PaperStats::default()),
            state_file: None,
        }
    }

    /// Persist positions to `path` after every fill
    pub fn with_state_file(mut self, path: PathBuf) -> Self {
        self.state_file = Some(path);
        self
    }

    pub fn stats(&self) -> PaperStats {
        self.stats.read().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn save_state(&self) -> TraderResult<()> {
        let state_file = match &self.state_file {
            Some(p) => p,
            None => return Ok(()),
        };

        let state = PaperExchangeState {
            positions: self.read_positions()?.clone(),
            stats: self.stats(),
        };
        let json = serde_json::to_string_pretty(&state)?;
        fs::write(state_file, json)?;
        info!(path = %state_file.display(), "💾 [PAPER] State saved");
        Ok(())
    }

    pub fn load_state(&self) -> TraderResult<()> {
        let state_file = match &self.state_file {
            Some(p) => p,
            None => return Ok(()),
        };

        if !state_file.exists() {
            info!(path = %state_file.display(), "💾 [PAPER] No state file found, starting fresh");
            return Ok(());
        }

        let json = fs::read_to_string(state_file)?;
        let state: PaperExchangeState = serde_json::from_str(&json)?;
        let count = state.positions.len();
        *self.write_positions()? = state.positions;
        if let Ok(mut stats) = self.stats.write() {
            *stats = state.stats;
        }
        info!(path = %state_file.display(), positions = count, "💾 [PAPER] State loaded");
        Ok(())
    }

    fn read_positions(
        &self,
    ) -> TraderResult<std::sync::RwLockReadGuard<'_, HashMap<String, PaperPosition>>> {
        self.positions
            .read()
            .map_err(|_| TraderError::exchange("paper positions lock poisoned"))
    }

    fn write_positions(
        &self,
    ) -> TraderResult<std::sync::RwLockWriteGuard<'_, HashMap<String, PaperPosition>>> {
        self.positions
            .write()
            .map_err(|_| TraderError::exchange("paper positions lock poisoned"))
    }

    fn persist(&self) {
        if let Err(e) = self.save_state() {
            warn!(error = %e, "Failed to save paper exchange state");
        }
    }
}

#[async_trait]
impl Exchange for PaperExchange {
    fn name(&self) -> &'static str {
        "paper"
    }

    async fn get_position(&self, symbol: &str) -> TraderResult<Option<ExchangePosition>> {
        let position = match self.read_positions()?.get(symbol) {
            Some(p) => p.clone(),
            None => return Ok(None),
        };
        let mark = self.market.get_mark_price(symbol).await?;
        let signed = if position.side == PositionSide::Short {
            -position.quantity
        } else {
            position.quantity
        };

        Ok(Some(ExchangePosition {
            symbol: symbol.to_string(),
            side: position.side,
            leverage: position.leverage,
            entry_price: position.entry_price,
            amount: signed,
            unrealized_pnl: position.unrealized_pnl(mark),
            timestamp: Utc::now(),
        }))
    }

    async fn open_position(
        &self,
        symbol: &str,
        side: PositionSide,
        leverage: u32,
        quantity: f64,
    ) -> TraderResult<ExchangePosition> {
        if side.is_flat() || quantity <= 0.0 {
            return Err(TraderError::OrderExecution {
                symbol: symbol.to_string(),
                reason: format!("invalid paper order {side} x {quantity}"),
            });
        }
        if self.read_positions()?.contains_key(symbol) {
            return Err(TraderError::OrderExecution {
                symbol: symbol.to_string(),
                reason: "paper position already open".into(),
            });
        }

        let mark = self.market.get_mark_price(symbol).await?;
        let position = PaperPosition {
            side,
            leverage,
            entry_price: mark,
            quantity,
            opened_at: Utc::now(),
        };
        self.write_positions()?
            .insert(symbol.to_string(), position);
        info!(symbol, side = %side, entry = mark, quantity, "📝 [PAPER] Opened");
        self.persist();

        self.get_position(symbol)
            .await?
            .ok_or_else(|| TraderError::InconsistentState {
                symbol: symbol.to_string(),
                reason: "paper position vanished after open".into(),
            })
    }

    async fn close_position(&self, symbol: &str, side: PositionSide) -> TraderResult<()> {
        let mark = self.market.get_mark_price(symbol).await?;
        let closed = {
            let mut positions = self.write_positions()?;
            match positions.get(symbol) {
                Some(p) if p.side == side => positions.remove(symbol),
                _ => None,
            }
        };
        let position = closed.ok_or_else(|| TraderError::OrderExecution {
            symbol: symbol.to_string(),
            reason: format!("no paper {side} position to close"),
        })?;

        let pnl = position.unrealized_pnl(mark);
        if let Ok(mut stats) = self.stats.write() {
            stats.total_trades += 1;
            if pnl > 0.0 {
                stats.winning_trades += 1;
            }
            stats.realized_pnl += pnl;
        }
        info!(symbol, side = %side, exit = mark, pnl = %format!("{pnl:.4}"), "📝 [PAPER] Closed");
        self.persist();
        Ok(())
    }

    async fn get_mark_price(&self, symbol: &str) -> TraderResult<f64> {
        self.market.get_mark_price(symbol).await
    }

    async fn klines(&self, symbol: &str, interval: &str, limit: usize) -> TraderResult<Vec<Candle>> {
        self.market.klines(symbol, interval, limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedMarket;

    fn temp_state_file(test_name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "fudtrader_paper_{}_{}.json",
            test_name,
            uuid::Uuid::new_v4()
        ))
    }

    #[tokio::test]
    async fn pnl_follows_mark_price_for_both_sides() {
        let market = Arc::new(ScriptedMarket::new());
        market.set_mark("DOGEUSDT", 1.0);
        let paper = PaperExchange::new(market.clone());

        paper
            .open_position("DOGEUSDT", PositionSide::Short, 5, 100.0)
            .await
            .unwrap();
        market.set_mark("DOGEUSDT", 0.9);

        let position = paper.get_position("DOGEUSDT").await.unwrap().unwrap();
        assert_eq!(position.side, PositionSide::Short);
        assert_eq!(position.amount, -100.0);
        assert!((position.unrealized_pnl - 10.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn close_books_realized_pnl() {
        let market = Arc::new(ScriptedMarket::new());
        market.set_mark("DOGEUSDT", 2.0);
        let paper = PaperExchange::new(market.clone());

        paper
            .open_position("DOGEUSDT", PositionSide::Long, 3, 10.0)
            .await
            .unwrap();
        market.set_mark("DOGEUSDT", 2.5);
        paper
            .close_position("DOGEUSDT", PositionSide::Long)
            .await
            .unwrap();

        assert!(paper.get_position("DOGEUSDT").await.unwrap().is_none());
        let stats = paper.stats();
        assert_eq!(stats.total_trades, 1);
        assert_eq!(stats.winning_trades, 1);
        assert!((stats.realized_pnl - 5.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn closing_wrong_side_is_an_order_failure() {
        let market = Arc::new(ScriptedMarket::new());
        market.set_mark("DOGEUSDT", 1.0);
        let paper = PaperExchange::new(market);
        paper
            .open_position("DOGEUSDT", PositionSide::Long, 3, 10.0)
            .await
            .unwrap();

        let err = paper
            .close_position("DOGEUSDT", PositionSide::Short)
            .await
            .unwrap_err();
        assert!(matches!(err, TraderError::OrderExecution { .. }));
        assert!(paper.get_position("DOGEUSDT").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn state_file_restores_positions() {
        let path = temp_state_file("restore");
        let market = Arc::new(ScriptedMarket::new());
        market.set_mark("DOGEUSDT", 1.0);

        let paper = PaperExchange::new(market.clone()).with_state_file(path.clone());
        paper
            .open_position("DOGEUSDT", PositionSide::Long, 2, 50.0)
            .await
            .unwrap();

        let restored = PaperExchange::new(market).with_state_file(path.clone());
        restored.load_state().unwrap();
        let position = restored.get_position("DOGEUSDT").await.unwrap().unwrap();
        assert_eq!(position.leverage, 2);
        assert_eq!(position.entry_price, 1.0);

        let _ = fs::remove_file(&path);
    }
}
