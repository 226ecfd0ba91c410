// =============================================================================
// cycle-trader — composition root
// =============================================================================
//
// Thin wiring only: load configuration, construct the exchange adapter, the
// LLM gateway, the session store, and the supervisor, then either auto-start
// one session or just wait for Ctrl+C. No HTTP surface — the core exposes its
// operations as plain async methods on `Supervisor`; a front end that needs a
// network API is an external concern.
// =============================================================================

mod decision;
mod error;
mod exchange;
mod indicators;
mod llm;
mod market_data;
mod pipeline;
mod prompt;
mod risk;
mod session;
mod types;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use exchange::binance_futures::BinanceFuturesAdapter;
use exchange::ExchangeAdapter;
use llm::http_gateway::HttpLlmGateway;
use session::{store::SessionStore, supervisor::Supervisor};
use types::{MarginMode, RiskParams, StartSessionRequest};

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("starting cycle-trader");

    let api_key = std::env::var("EXCHANGE_API_KEY").context("EXCHANGE_API_KEY must be set")?;
    let api_secret = std::env::var("EXCHANGE_API_SECRET").context("EXCHANGE_API_SECRET must be set")?;

    let llm_api_key = std::env::var("LLM_API_KEY").context("LLM_API_KEY must be set")?;
    let llm_base_url = env_or("LLM_BASE_URL", "https://api.deepseek.com/v1");
    let llm_model = env_or("LLM_MODEL", "deepseek-chat");

    let db_url = env_or("DATABASE_URL", "sqlite://./cycle-trader.db");

    let adapter = Arc::new(BinanceFuturesAdapter::new(api_key, api_secret));
    let gateway = Arc::new(HttpLlmGateway::new(llm_api_key, llm_base_url, llm_model));
    let store = Arc::new(SessionStore::new(&db_url).await.context("failed to open session store")?);

    let supervisor = Arc::new(Supervisor::new(store, adapter.clone(), gateway));

    supervisor.reconcile_after_restart().await.context("restart reconciliation failed")?;

    if env_or("AUTO_START_SESSION", "false") == "true" {
        let account = adapter.get_account().await.context("balance pre-check failed")?;

        let instruments: Vec<String> = env_or("INSTRUMENTS", "BTC/USDT:USDT")
            .split(',')
            .map(|s| s.trim().to_string())
            .collect();

        let request = StartSessionRequest {
            instruments,
            initial_capital: account.total_equity,
            risk_params: RiskParams {
                max_notional_per_trade: env_f64("MAX_NOTIONAL_PER_TRADE", 1000.0),
                max_leverage: env_u32("MAX_LEVERAGE", 10),
                max_drawdown_pct: env_f64("MAX_DRAWDOWN_PCT", 10.0),
                max_total_exposure: env_f64("MAX_TOTAL_EXPOSURE", 5000.0),
                max_positions: env_u32("MAX_POSITIONS", 3),
                margin_mode: MarginMode::Crossed,
            },
            decision_interval_secs: env_u64("DECISION_INTERVAL_SECS", 60),
            auto_start_agent: true,
        };

        let session = supervisor.create(request).await.context("failed to auto-start session")?;
        info!(session_id = session.id, "session auto-started");
    }

    info!("cycle-trader running. Press Ctrl+C to stop.");

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    warn!("shutdown signal received, stopping sessions gracefully");

    if let Err(e) = supervisor.shutdown().await {
        error!(error = %e, "error during supervisor shutdown");
    }

    info!("cycle-trader shut down complete");
    Ok(())
}
