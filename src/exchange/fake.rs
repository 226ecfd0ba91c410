// =============================================================================
// In-memory fake Exchange Adapter — used by pipeline/risk-gate/supervisor
// tests so they never make network calls.
// =============================================================================

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use crate::error::ExchangeError;
use crate::exchange::{AccountInfo, ExchangeAdapter, FundingRate, OpenInterest, Order, OrderResult, Ticker};
use crate::market_data::Candle;
use crate::types::{MarginMode, Position, PositionSide};

/// A call recorded for assertions in tests (P6/P7: reduce-only close,
/// no resting TP/SL orders).
#[derive(Debug, Clone)]
pub enum RecordedCall {
    OpenLong { symbol: String, qty: f64, leverage: u32 },
    OpenShort { symbol: String, qty: f64, leverage: u32 },
    ClosePosition { symbol: String, side: PositionSide, qty: Option<f64>, reduce_only: bool },
}

pub struct FakeExchangeAdapter {
    pub account: Mutex<AccountInfo>,
    pub positions: Mutex<Vec<Position>>,
    pub klines: Mutex<Vec<Candle>>,
    pub ticker_price: Mutex<f64>,
    pub calls: Mutex<Vec<RecordedCall>>,
    pub fail_account: Mutex<bool>,
}

impl FakeExchangeAdapter {
    pub fn new(total_equity: f64) -> Self {
        Self {
            account: Mutex::new(AccountInfo {
                total_equity,
                available_balance: total_equity,
                total_unrealized_pnl: 0.0,
                total_margin_balance: total_equity,
            }),
            positions: Mutex::new(Vec::new()),
            klines: Mutex::new(Vec::new()),
            ticker_price: Mutex::new(100.0),
            calls: Mutex::new(Vec::new()),
            fail_account: Mutex::new(false),
        }
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl ExchangeAdapter for FakeExchangeAdapter {
    async fn get_account(&self) -> Result<AccountInfo, ExchangeError> {
        if *self.fail_account.lock() {
            return Err(ExchangeError::Network("fake network failure".into()));
        }
        Ok(*self.account.lock())
    }

    async fn get_positions(&self) -> Result<Vec<Position>, ExchangeError> {
        Ok(self.positions.lock().clone())
    }

    async fn get_open_orders(&self, _symbol: Option<&str>) -> Result<Vec<Order>, ExchangeError> {
        Ok(Vec::new())
    }

    async fn get_klines(&self, _symbol: &str, _interval: &str, limit: u32) -> Result<Vec<Candle>, ExchangeError> {
        let stored = self.klines.lock();
        if stored.is_empty() {
            let price = *self.ticker_price.lock();
            return Ok((0..limit)
                .map(|i| Candle::new(i as i64, price, price, price, price, 10.0, i as i64))
                .collect());
        }
        Ok(stored.clone())
    }

    async fn get_ticker(&self, _symbol: &str) -> Result<Ticker, ExchangeError> {
        let last = *self.ticker_price.lock();
        Ok(Ticker { last, bid: last, ask: last, high: last, low: last, volume: 0.0, ts: Utc::now() })
    }

    async fn get_funding_rate(&self, _symbol: &str) -> Result<FundingRate, ExchangeError> {
        Ok(FundingRate { rate: 0.0, next_ts: Utc::now() })
    }

    async fn get_open_interest(&self, _symbol: &str) -> Result<OpenInterest, ExchangeError> {
        Ok(OpenInterest { value: 0.0, ts: Utc::now() })
    }

    async fn set_leverage(&self, _symbol: &str, _leverage: u32) -> Result<(), ExchangeError> {
        Ok(())
    }

    async fn open_long(
        &self,
        symbol: &str,
        qty: f64,
        leverage: u32,
        _margin_mode: MarginMode,
        _sl_ref: Option<f64>,
        _tp_ref: Option<f64>,
    ) -> Result<OrderResult, ExchangeError> {
        self.calls.lock().push(RecordedCall::OpenLong { symbol: symbol.to_string(), qty, leverage });
        Ok(OrderResult { order_id: "fake-1".into(), filled_qty: qty, avg_price: *self.ticker_price.lock() })
    }

    async fn open_short(
        &self,
        symbol: &str,
        qty: f64,
        leverage: u32,
        _margin_mode: MarginMode,
        _sl_ref: Option<f64>,
        _tp_ref: Option<f64>,
    ) -> Result<OrderResult, ExchangeError> {
        self.calls.lock().push(RecordedCall::OpenShort { symbol: symbol.to_string(), qty, leverage });
        Ok(OrderResult { order_id: "fake-2".into(), filled_qty: qty, avg_price: *self.ticker_price.lock() })
    }

    async fn close_position(
        &self,
        symbol: &str,
        side: PositionSide,
        qty: Option<f64>,
    ) -> Result<OrderResult, ExchangeError> {
        let position = self.positions.lock().iter().find(|p| p.symbol == symbol).cloned();
        let resolved_qty = match qty.or_else(|| position.as_ref().map(|p| p.contracts)) {
            Some(q) => q,
            None => return Err(ExchangeError::InvalidOrder(format!("no open position for {symbol}"))),
        };
        self.calls.lock().push(RecordedCall::ClosePosition {
            symbol: symbol.to_string(),
            side,
            qty,
            reduce_only: true,
        });
        Ok(OrderResult { order_id: "fake-3".into(), filled_qty: resolved_qty, avg_price: *self.ticker_price.lock() })
    }
}
