//! Exchange collaborator
//!
//! Perpetual futures venue used for market data and market orders. The
//! live client signs requests; the paper exchange simulates fills against
//! live mark prices.

pub mod paper;
pub mod rest;

pub use paper::PaperExchange;
pub use rest::RestExchange;

use async_trait::async_trait;

use crate::errors::TraderResult;
use crate::types::{Candle, ExchangePosition, PositionSide};

#[async_trait]
pub trait Exchange: Send + Sync {
    /// Venue name for logging
    fn name(&self) -> &'static str;

    /// Open position for a symbol, `None` when flat
    async fn get_position(&self, symbol: &str) -> TraderResult<Option<ExchangePosition>>;

    /// Market order opening `side`; returns the resulting position
    async fn open_position(
        &self,
        symbol: &str,
        side: PositionSide,
        leverage: u32,
        quantity: f64,
    ) -> TraderResult<ExchangePosition>;

    /// Market order closing the whole `side` position
    async fn close_position(&self, symbol: &str, side: PositionSide) -> TraderResult<()>;

    async fn get_mark_price(&self, symbol: &str) -> TraderResult<f64>;

    /// Most recent `limit` candles, oldest first
    async fn klines(&self, symbol: &str, interval: &str, limit: usize) -> TraderResult<Vec<Candle>>;
}
