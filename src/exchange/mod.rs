// =============================================================================
// Exchange Adapter contract (C1)
// =============================================================================
//
// One uniform synchronous contract over a futures venue. All methods are
// blocking async calls; cancellation is the caller's responsibility (drop the
// future). No retries happen inside an adapter implementation.
// =============================================================================

pub mod binance_futures;
pub mod fake;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ExchangeError;
use crate::market_data::Candle;
use crate::types::{MarginMode, Position};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AccountInfo {
    pub total_equity: f64,
    pub available_balance: f64,
    pub total_unrealized_pnl: f64,
    pub total_margin_balance: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticker {
    pub last: f64,
    pub bid: f64,
    pub ask: f64,
    pub high: f64,
    pub low: f64,
    pub volume: f64,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FundingRate {
    pub rate: f64,
    pub next_ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OpenInterest {
    pub value: f64,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub symbol: String,
    pub side: String,
    pub order_type: String,
    pub price: f64,
    pub quantity: f64,
    pub reduce_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResult {
    pub order_id: String,
    pub filled_qty: f64,
    pub avg_price: f64,
}

/// Closed set of kline intervals the adapter must support.
pub const KLINE_INTERVALS: &[&str] = &[
    "1m", "3m", "5m", "15m", "30m", "1h", "2h", "4h", "6h", "8h", "12h", "1d", "3d", "1w", "1M",
];

#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    async fn get_account(&self) -> Result<AccountInfo, ExchangeError>;

    /// Positions with zero contracts MUST be filtered out by implementations.
    async fn get_positions(&self) -> Result<Vec<Position>, ExchangeError>;

    async fn get_open_orders(&self, symbol: Option<&str>) -> Result<Vec<Order>, ExchangeError>;

    async fn get_klines(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Candle>, ExchangeError>;

    async fn get_ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError>;

    async fn get_funding_rate(&self, symbol: &str) -> Result<FundingRate, ExchangeError>;

    async fn get_open_interest(&self, symbol: &str) -> Result<OpenInterest, ExchangeError>;

    /// Idempotent at the venue; caller treats failure as non-fatal.
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError>;

    async fn open_long(
        &self,
        symbol: &str,
        qty: f64,
        leverage: u32,
        margin_mode: MarginMode,
        sl_ref: Option<f64>,
        tp_ref: Option<f64>,
    ) -> Result<OrderResult, ExchangeError>;

    async fn open_short(
        &self,
        symbol: &str,
        qty: f64,
        leverage: u32,
        margin_mode: MarginMode,
        sl_ref: Option<f64>,
        tp_ref: Option<f64>,
    ) -> Result<OrderResult, ExchangeError>;

    /// Submitted with the venue's reduce-only flag; closes the full contract
    /// amount reported by `get_positions` when `qty` is `None`.
    async fn close_position(
        &self,
        symbol: &str,
        side: crate::types::PositionSide,
        qty: Option<f64>,
    ) -> Result<OrderResult, ExchangeError>;
}
