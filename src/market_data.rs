// =============================================================================
// Market-Data Assembler (C2)
// =============================================================================
//
// Builds the per-cycle input bundle the LLM gateway consults: price,
// multi-timeframe indicators, funding rate, open interest, account equity and
// margin usage, and live positions with their linked TP/SL. Funding rate and
// open interest are best-effort — a fetch failure is logged and rendered as
// missing rather than aborting the cycle.
// =============================================================================

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};

use crate::exchange::ExchangeAdapter;
use crate::indicators::{atr, ema, macd, rsi};
use crate::types::{AccountSummary, Position};

/// A single OHLCV bar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: i64,
    pub close_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn new(open_time: i64, open: f64, high: f64, low: f64, close: f64, volume: f64, close_time: i64) -> Self {
        Self { open_time, close_time, open, high, low, close, volume }
    }
}

/// Minimum bars required at the intraday timeframe: the longest indicator
/// period (EMA-55) plus 20 look-back points for the model to see trend.
const INTRADAY_MIN_BARS: u32 = 75;
const CONTEXT_MIN_BARS: u32 = 75;

/// Per-instrument snapshot fed into the prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentSnapshot {
    pub symbol: String,
    pub last_price: f64,
    pub change_1h_pct: Option<f64>,
    pub change_4h_pct: Option<f64>,
    pub ema_short: Option<f64>,
    pub ema_long: Option<f64>,
    pub macd: Option<macd::MacdValue>,
    pub rsi_short: Option<f64>,
    pub rsi_long: Option<f64>,
    pub atr_short: Option<f64>,
    pub atr_long: Option<f64>,
    pub volume: f64,
    pub avg_volume: f64,
    pub funding_rate: Option<f64>,
    pub open_interest: Option<f64>,
    pub position: Option<Position>,
}

/// Canonical symbol for the always-on BTC market overview line every prompt
/// carries, independent of which instruments the session actually trades.
pub const BTC_SYMBOL: &str = "BTC/USDT:USDT";

/// Everything the prompt template (an external collaborator) needs to render
/// text for the model, plus the raw figures the pipeline needs for auditing.
#[derive(Debug, Clone)]
pub struct CycleContext {
    pub instruments: Vec<InstrumentSnapshot>,
    pub account: AccountSummary,
    pub positions: Vec<Position>,
    /// BTC market snapshot, fetched regardless of whether BTC is among the
    /// session's configured instruments (reused from `instruments` when it
    /// already is).
    pub btc_snapshot: InstrumentSnapshot,
}

pub struct Assembler<A: ExchangeAdapter> {
    adapter: std::sync::Arc<A>,
    /// Return history used for the Sharpe-ratio estimate; one entry per
    /// completed cycle, cleared only on process restart.
    cycle_returns: parking_lot::Mutex<Vec<f64>>,
    initial_capital: f64,
}

impl<A: ExchangeAdapter> Assembler<A> {
    pub fn new(adapter: std::sync::Arc<A>, initial_capital: f64) -> Self {
        Self {
            adapter,
            cycle_returns: parking_lot::Mutex::new(Vec::new()),
            initial_capital,
        }
    }

    /// Assemble one cycle's context for the given instrument list. Never
    /// errors for recoverable data gaps (funding/OI); surfaces any
    /// unrecoverable exchange failure (klines, account, positions).
    #[instrument(skip(self, instruments), fields(n = instruments.len()))]
    pub async fn assemble(&self, instruments: &[String]) -> Result<CycleContext> {
        let account = self
            .adapter
            .get_account()
            .await
            .context("failed to fetch account")?;

        let positions = self
            .adapter
            .get_positions()
            .await
            .context("failed to fetch positions")?;

        let mut snapshots = Vec::with_capacity(instruments.len());
        for symbol in instruments {
            snapshots.push(self.assemble_instrument(symbol, &positions).await?);
        }

        let btc_snapshot = match snapshots.iter().find(|s| s.symbol == BTC_SYMBOL) {
            Some(existing) => existing.clone(),
            None => self
                .assemble_instrument(BTC_SYMBOL, &positions)
                .await
                .context("failed to fetch BTC market overview")?,
        };

        let total_margin: f64 = positions
            .iter()
            .map(|p| (p.contracts * p.mark_price / p.leverage.max(1) as f64).abs())
            .sum();
        let margin_used_pct = if account.total_equity > 0.0 {
            total_margin / account.total_equity * 100.0
        } else {
            0.0
        };

        let cash_pct =
            if account.total_equity > 0.0 { account.available_balance / account.total_equity * 100.0 } else { 0.0 };

        let total_return_pct = if self.initial_capital > 0.0 {
            (account.total_equity - self.initial_capital) / self.initial_capital * 100.0
        } else {
            0.0
        };

        let sharpe_ratio = {
            let mut returns = self.cycle_returns.lock();
            returns.push(total_return_pct);
            sharpe_ratio(&returns)
        };

        let summary = AccountSummary {
            total_equity: account.total_equity,
            available_balance: account.available_balance,
            total_unrealized_pnl: account.total_unrealized_pnl,
            total_return_pct,
            sharpe_ratio,
            margin_used_pct,
            cash_pct,
            position_count: positions.len() as u32,
        };

        Ok(CycleContext {
            instruments: snapshots,
            account: summary,
            positions,
            btc_snapshot,
        })
    }

    async fn assemble_instrument(
        &self,
        symbol: &str,
        positions: &[Position],
    ) -> Result<InstrumentSnapshot> {
        let intraday = self
            .adapter
            .get_klines(symbol, "5m", INTRADAY_MIN_BARS)
            .await
            .with_context(|| format!("failed to fetch intraday klines for {symbol}"))?;
        let context = self
            .adapter
            .get_klines(symbol, "1h", CONTEXT_MIN_BARS)
            .await
            .with_context(|| format!("failed to fetch context klines for {symbol}"))?;

        let ticker = self
            .adapter
            .get_ticker(symbol)
            .await
            .with_context(|| format!("failed to fetch ticker for {symbol}"))?;

        let closes: Vec<f64> = intraday.iter().map(|c| c.close).collect();
        let ctx_closes: Vec<f64> = context.iter().map(|c| c.close).collect();

        let change_1h_pct = pct_change_back(&ctx_closes, 1);
        let change_4h_pct = pct_change_back(&ctx_closes, 4);

        let ema_short = ema::calculate_ema(&closes, 12).last().copied();
        let ema_long = ema::calculate_ema(&closes, 26).last().copied();
        let macd_value = macd::calculate_macd(&closes, 12, 26, 9);
        let rsi_short = rsi::calculate_rsi(&closes, 7).last().copied();
        let rsi_long = rsi::calculate_rsi(&closes, 14).last().copied();
        let atr_short = atr::calculate_atr(&intraday, 7);
        let atr_long = atr::calculate_atr(&intraday, 14);

        let avg_volume = if intraday.is_empty() {
            0.0
        } else {
            intraday.iter().map(|c| c.volume).sum::<f64>() / intraday.len() as f64
        };

        let funding_rate = match self.adapter.get_funding_rate(symbol).await {
            Ok(f) => Some(f.rate),
            Err(e) => {
                warn!(symbol, error = %e, "funding rate fetch failed, continuing without it");
                None
            }
        };
        let open_interest = match self.adapter.get_open_interest(symbol).await {
            Ok(oi) => Some(oi.value),
            Err(e) => {
                warn!(symbol, error = %e, "open interest fetch failed, continuing without it");
                None
            }
        };

        let position = positions.iter().find(|p| p.symbol == symbol).cloned();

        Ok(InstrumentSnapshot {
            symbol: symbol.to_string(),
            last_price: ticker.last,
            change_1h_pct,
            change_4h_pct,
            ema_short,
            ema_long,
            macd: macd_value,
            rsi_short,
            rsi_long,
            atr_short,
            atr_long,
            volume: intraday.last().map(|c| c.volume).unwrap_or(0.0),
            avg_volume,
            funding_rate,
            open_interest,
            position,
        })
    }
}

/// Percentage change between the last close and the close `bars_back` bars
/// earlier, guarding against division by zero and short series.
fn pct_change_back(closes: &[f64], bars_back: usize) -> Option<f64> {
    if closes.len() <= bars_back {
        return None;
    }
    let last = *closes.last()?;
    let prev = closes[closes.len() - 1 - bars_back];
    if prev == 0.0 {
        return None;
    }
    Some((last - prev) / prev * 100.0)
}

/// Mean / stddev of per-cycle returns; zero when fewer than two samples.
fn sharpe_ratio(returns: &[f64]) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }
    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / returns.len() as f64;
    let stddev = variance.sqrt();
    if stddev == 0.0 {
        return 0.0;
    }
    mean / stddev
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pct_change_back_guards_short_series() {
        assert!(pct_change_back(&[1.0, 2.0], 4).is_none());
    }

    #[test]
    fn pct_change_back_guards_zero_divisor() {
        assert!(pct_change_back(&[0.0, 1.0, 2.0], 2).is_none());
    }

    #[test]
    fn pct_change_back_computes_expected_value() {
        let closes = vec![100.0, 105.0, 110.0, 121.0];
        let change = pct_change_back(&closes, 2).unwrap();
        assert!((change - 10.0).abs() < 1e-9);
    }

    #[test]
    fn sharpe_ratio_zero_with_one_sample() {
        assert_eq!(sharpe_ratio(&[5.0]), 0.0);
    }

    #[test]
    fn sharpe_ratio_zero_when_flat() {
        assert_eq!(sharpe_ratio(&[1.0, 1.0, 1.0]), 0.0);
    }

    #[test]
    fn sharpe_ratio_positive_for_rising_returns() {
        let ratio = sharpe_ratio(&[1.0, 2.0, 3.0, 4.0]);
        assert!(ratio > 0.0);
    }
}
