// =============================================================================
// Session Store (C8) — SQLite persistence
// =============================================================================
//
// Two tables: `sessions` (one row per session, mutated in place as cycles run)
// and `cycle_records` (append-only audit trail, one row per completed cycle
// attempt). Runtime-checked queries throughout rather than compile-time
// `sqlx::query!` macros.
// =============================================================================

use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteJournalMode};
use tracing::info;

use crate::types::{
    AssetTimelinePoint, BgStatus, CycleRecord, DecisionAction, RiskParams, Session, SessionStatus, StartSessionRequest,
};

pub struct SessionStore {
    pool: SqlitePool,
}

impl SessionStore {
    pub async fn new(db_url: &str) -> Result<Self> {
        if let Some(path_part) = db_url.strip_prefix("sqlite://") {
            let path = std::path::Path::new(path_part);
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .context("failed to create session store directory")?;
                }
            }
        }

        let options = SqliteConnectOptions::from_str(db_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("failed to connect to session store")?;

        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                created_at TEXT NOT NULL,
                initial_capital REAL NOT NULL,
                instruments_json TEXT NOT NULL,
                risk_params_json TEXT NOT NULL,
                decision_interval_secs INTEGER NOT NULL,
                session_status TEXT NOT NULL,
                bg_status TEXT NOT NULL,
                cycle_count INTEGER NOT NULL DEFAULT 0,
                last_cycle_at TEXT,
                last_error TEXT,
                started_at TEXT,
                stopped_at TEXT
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create sessions table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cycle_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id INTEGER NOT NULL,
                cycle_number INTEGER NOT NULL,
                timestamp TEXT NOT NULL,
                stage_error TEXT,
                record_json TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create cycle_records table")?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_cycle_records_session ON cycle_records (session_id, cycle_number)")
            .execute(&self.pool)
            .await
            .context("failed to create cycle_records index")?;

        info!("session store schema initialized");
        Ok(())
    }

    /// Insert a new session in `idle` state. Enforces P1 (at-most-one running
    /// session) by checking inside the same transaction that creates the row
    /// — a session is always created idle, so this only guards against a
    /// racing create landing between the check and the insert.
    pub async fn create_session(&self, req: &StartSessionRequest) -> Result<Session> {
        let mut tx = self.pool.begin().await.context("failed to open transaction")?;

        let running: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sessions WHERE session_status = 'running'")
            .fetch_one(&mut *tx)
            .await
            .context("failed to count running sessions")?;

        if running > 0 {
            anyhow::bail!("a session is already running; stop it before starting another");
        }

        let now = Utc::now();
        let instruments_json = serde_json::to_string(&req.instruments)?;
        let risk_params_json = serde_json::to_string(&req.risk_params)?;

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO sessions (
                created_at, initial_capital, instruments_json, risk_params_json,
                decision_interval_secs, session_status, bg_status, cycle_count
            ) VALUES ($1, $2, $3, $4, $5, 'stopped', 'idle', 0)
            RETURNING id
            "#,
        )
        .bind(now.to_rfc3339())
        .bind(req.initial_capital)
        .bind(&instruments_json)
        .bind(&risk_params_json)
        .bind(req.decision_interval_secs as i64)
        .fetch_one(&mut *tx)
        .await
        .context("failed to insert session")?;

        tx.commit().await.context("failed to commit session creation")?;

        Ok(Session {
            id,
            created_at: now,
            initial_capital: req.initial_capital,
            instruments: req.instruments.clone(),
            risk_params: req.risk_params.clone(),
            decision_interval_secs: req.decision_interval_secs,
            session_status: SessionStatus::Stopped,
            bg_status: BgStatus::Idle,
            cycle_count: 0,
            last_cycle_at: None,
            last_error: None,
            started_at: None,
            stopped_at: None,
        })
    }

    /// Transition a session to `running`/`starting`, enforcing P1 inside the
    /// transaction: the update only applies if no other session is already
    /// `running`.
    pub async fn try_mark_running(&self, session_id: i64) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let running: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sessions WHERE session_status = 'running' AND id != $1",
        )
        .bind(session_id)
        .fetch_one(&mut *tx)
        .await?;

        if running > 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "UPDATE sessions SET session_status = 'running', bg_status = 'running', started_at = $1, last_error = NULL WHERE id = $2",
        )
        .bind(&now)
        .bind(session_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    pub async fn mark_bg_status(&self, session_id: i64, status: BgStatus) -> Result<()> {
        sqlx::query("UPDATE sessions SET bg_status = $1 WHERE id = $2")
            .bind(status.to_string())
            .bind(session_id)
            .execute(&self.pool)
            .await
            .context("failed to update bg_status")?;
        Ok(())
    }

    pub async fn mark_stopped(&self, session_id: i64) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "UPDATE sessions SET session_status = 'stopped', bg_status = 'stopped', stopped_at = $1 WHERE id = $2",
        )
        .bind(&now)
        .bind(session_id)
        .execute(&self.pool)
        .await
        .context("failed to mark session stopped")?;
        Ok(())
    }

    pub async fn mark_crashed(&self, session_id: i64, error: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "UPDATE sessions SET session_status = 'crashed', bg_status = 'crashed', stopped_at = $1, last_error = $2 WHERE id = $3",
        )
        .bind(&now)
        .bind(error)
        .bind(session_id)
        .execute(&self.pool)
        .await
        .context("failed to mark session crashed")?;
        Ok(())
    }

    /// Atomically increment `cycle_count`, stamp `last_cycle_at`, and clear or
    /// set `last_error` (P2: cycle_count increments exactly once per attempt,
    /// success or failure; "last_error is null whenever a cycle succeeds").
    pub async fn record_cycle(&self, record: &CycleRecord) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let record_json = serde_json::to_string(record)?;
        sqlx::query(
            "INSERT INTO cycle_records (session_id, cycle_number, timestamp, stage_error, record_json) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(record.session_id)
        .bind(record.cycle_number as i64)
        .bind(record.timestamp.to_rfc3339())
        .bind(&record.stage_error)
        .bind(&record_json)
        .execute(&mut *tx)
        .await
        .context("failed to insert cycle record")?;

        sqlx::query(
            "UPDATE sessions SET cycle_count = cycle_count + 1, last_cycle_at = $1, last_error = $2 WHERE id = $3",
        )
        .bind(record.timestamp.to_rfc3339())
        .bind(&record.stage_error)
        .bind(record.session_id)
        .execute(&mut *tx)
        .await
        .context("failed to update session cycle counter")?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn get_by_id(&self, session_id: i64) -> Result<Option<Session>> {
        let row = sqlx::query_as::<_, SessionRow>("SELECT * FROM sessions WHERE id = $1")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to fetch session")?;
        row.map(Session::try_from).transpose()
    }

    pub async fn list_by_status(&self, status: SessionStatus) -> Result<Vec<Session>> {
        let rows = sqlx::query_as::<_, SessionRow>("SELECT * FROM sessions WHERE session_status = $1")
            .bind(status.to_string())
            .fetch_all(&self.pool)
            .await
            .context("failed to list sessions by status")?;
        rows.into_iter().map(Session::try_from).collect()
    }

    pub async fn list_recent(&self, limit: i64) -> Result<Vec<Session>> {
        let rows = sqlx::query_as::<_, SessionRow>("SELECT * FROM sessions ORDER BY id DESC LIMIT $1")
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .context("failed to list recent sessions")?;
        rows.into_iter().map(Session::try_from).collect()
    }

    pub async fn list_recent_cycles(&self, session_id: i64, limit: i64) -> Result<Vec<CycleRecord>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT record_json FROM cycle_records WHERE session_id = $1 ORDER BY cycle_number DESC LIMIT $2",
        )
        .bind(session_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("failed to list cycle records")?;

        rows.into_iter()
            .map(|(json,)| serde_json::from_str(&json).context("failed to decode cycle record"))
            .collect()
    }

    /// Project the asset-value timeline for a session: one point per recorded
    /// cycle, oldest first. `total_asset`/`account_balance` fall back to each
    /// other when a cycle aborted before the account snapshot was taken.
    pub async fn get_asset_timeline(&self, session_id: i64) -> Result<Vec<AssetTimelinePoint>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT timestamp, record_json FROM cycle_records WHERE session_id = $1 ORDER BY cycle_number ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to list cycle records for timeline")?;

        rows.into_iter()
            .map(|(ts, json)| {
                let record: CycleRecord = serde_json::from_str(&json).context("failed to decode cycle record")?;
                let ts = DateTime::parse_from_rfc3339(&ts)?.with_timezone(&Utc);

                let (account_balance, unrealized_pnl, total_asset) = match &record.account_summary {
                    Some(summary) => (summary.available_balance, summary.total_unrealized_pnl, summary.total_equity),
                    None => (0.0, 0.0, 0.0),
                };

                Ok(AssetTimelinePoint {
                    ts,
                    account_balance,
                    unrealized_pnl,
                    total_asset,
                    decision_type: summarize_decision_type(&record.decisions),
                })
            })
            .collect()
    }
}

/// Collapse a cycle's decisions to one coarse label, in the spirit of the
/// original buy/sell/hold/rebalance/close classification. The first
/// open/close decision wins; multiple simultaneous opens count as a
/// rebalance.
fn summarize_decision_type(decisions: &[crate::types::Decision]) -> String {
    let opens = decisions.iter().filter(|d| d.action.is_open()).count();
    let closes = decisions.iter().filter(|d| d.action.is_close()).count();

    if opens > 1 {
        return "rebalance".to_string();
    }
    if let Some(d) = decisions.iter().find(|d| d.action.is_open()) {
        return match d.action {
            DecisionAction::OpenLong => "buy",
            DecisionAction::OpenShort => "sell",
            _ => unreachable!(),
        }
        .to_string();
    }
    if closes > 0 {
        return "close".to_string();
    }
    "hold".to_string()
}

#[derive(sqlx::FromRow)]
struct SessionRow {
    id: i64,
    created_at: String,
    initial_capital: f64,
    instruments_json: String,
    risk_params_json: String,
    decision_interval_secs: i64,
    session_status: String,
    bg_status: String,
    cycle_count: i64,
    last_cycle_at: Option<String>,
    last_error: Option<String>,
    started_at: Option<String>,
    stopped_at: Option<String>,
}

impl TryFrom<SessionRow> for Session {
    type Error = anyhow::Error;

    fn try_from(row: SessionRow) -> Result<Self> {
        Ok(Session {
            id: row.id,
            created_at: DateTime::parse_from_rfc3339(&row.created_at)?.with_timezone(&Utc),
            initial_capital: row.initial_capital,
            instruments: serde_json::from_str(&row.instruments_json)?,
            risk_params: serde_json::from_str::<RiskParams>(&row.risk_params_json)?,
            decision_interval_secs: row.decision_interval_secs as u64,
            session_status: row.session_status.parse()?,
            bg_status: row.bg_status.parse()?,
            cycle_count: row.cycle_count as u64,
            last_cycle_at: row.last_cycle_at.map(|s| DateTime::parse_from_rfc3339(&s).map(|d| d.with_timezone(&Utc))).transpose()?,
            last_error: row.last_error,
            started_at: row.started_at.map(|s| DateTime::parse_from_rfc3339(&s).map(|d| d.with_timezone(&Utc))).transpose()?,
            stopped_at: row.stopped_at.map(|s| DateTime::parse_from_rfc3339(&s).map(|d| d.with_timezone(&Utc))).transpose()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MarginMode;

    fn req() -> StartSessionRequest {
        StartSessionRequest {
            instruments: vec!["BTC/USDT:USDT".to_string()],
            initial_capital: 10_000.0,
            risk_params: RiskParams {
                max_notional_per_trade: 1000.0,
                max_leverage: 5,
                max_drawdown_pct: 10.0,
                max_total_exposure: 5000.0,
                max_positions: 3,
                margin_mode: MarginMode::Crossed,
            },
            decision_interval_secs: 60,
            auto_start_agent: true,
        }
    }

    #[tokio::test]
    async fn create_and_fetch_roundtrips() {
        let store = SessionStore::new("sqlite::memory:").await.unwrap();
        let created = store.create_session(&req()).await.unwrap();
        let fetched = store.get_by_id(created.id).await.unwrap().unwrap();
        assert_eq!(fetched.instruments, vec!["BTC/USDT:USDT".to_string()]);
        assert_eq!(fetched.bg_status, BgStatus::Idle);
    }

    #[tokio::test]
    async fn only_one_running_session_allowed() {
        let store = SessionStore::new("sqlite::memory:").await.unwrap();
        let a = store.create_session(&req()).await.unwrap();
        let b = store.create_session(&req()).await.unwrap();

        assert!(store.try_mark_running(a.id).await.unwrap());
        assert!(!store.try_mark_running(b.id).await.unwrap());

        store.mark_stopped(a.id).await.unwrap();
        assert!(store.try_mark_running(b.id).await.unwrap());
    }

    #[tokio::test]
    async fn cycle_count_increments_and_last_error_tracks_stage_error() {
        let store = SessionStore::new("sqlite::memory:").await.unwrap();
        let session = store.create_session(&req()).await.unwrap();

        let record = CycleRecord {
            session_id: session.id,
            cycle_number: 1,
            timestamp: Utc::now(),
            user_prompt: String::new(),
            llm_reply: None,
            decisions: Vec::new(),
            parse_errors: Vec::new(),
            verdicts: Vec::new(),
            portfolio_verdict: None,
            execution_results: Vec::new(),
            account_summary: None,
            stage_error: Some("assemble_failed".to_string()),
        };
        store.record_cycle(&record).await.unwrap();

        let fetched = store.get_by_id(session.id).await.unwrap().unwrap();
        assert_eq!(fetched.cycle_count, 1);
        assert_eq!(fetched.last_error.as_deref(), Some("assemble_failed"));

        let cycles = store.list_recent_cycles(session.id, 10).await.unwrap();
        assert_eq!(cycles.len(), 1);
    }

    #[tokio::test]
    async fn asset_timeline_projects_balance_and_decision_type_oldest_first() {
        use crate::types::{AccountSummary, Decision, DecisionAction};

        let store = SessionStore::new("sqlite::memory:").await.unwrap();
        let session = store.create_session(&req()).await.unwrap();

        let open_decision = Decision {
            symbol: "BTC/USDT:USDT".to_string(),
            action: DecisionAction::OpenLong,
            leverage: 3,
            notional_usd: 500.0,
            stop_loss: None,
            take_profit: None,
            confidence: 80,
            rationale: String::new(),
            risk_usd: None,
        };

        let summary = AccountSummary {
            total_equity: 10_500.0,
            available_balance: 10_000.0,
            total_unrealized_pnl: 500.0,
            total_return_pct: 5.0,
            sharpe_ratio: 0.0,
            margin_used_pct: 0.0,
            cash_pct: 95.0,
            position_count: 1,
        };

        store
            .record_cycle(&CycleRecord {
                session_id: session.id,
                cycle_number: 1,
                timestamp: Utc::now(),
                user_prompt: String::new(),
                llm_reply: None,
                decisions: vec![open_decision],
                parse_errors: Vec::new(),
                verdicts: Vec::new(),
                portfolio_verdict: None,
                execution_results: Vec::new(),
                account_summary: Some(summary),
                stage_error: None,
            })
            .await
            .unwrap();

        store
            .record_cycle(&CycleRecord {
                session_id: session.id,
                cycle_number: 2,
                timestamp: Utc::now(),
                user_prompt: String::new(),
                llm_reply: None,
                decisions: Vec::new(),
                parse_errors: Vec::new(),
                verdicts: Vec::new(),
                portfolio_verdict: None,
                execution_results: Vec::new(),
                account_summary: None,
                stage_error: Some("assemble_failed".to_string()),
            })
            .await
            .unwrap();

        let timeline = store.get_asset_timeline(session.id).await.unwrap();
        assert_eq!(timeline.len(), 2);
        assert_eq!(timeline[0].decision_type, "buy");
        assert_eq!(timeline[0].total_asset, 10_500.0);
        assert_eq!(timeline[0].account_balance, 10_000.0);
        assert_eq!(timeline[1].decision_type, "hold");
        assert_eq!(timeline[1].total_asset, 0.0);
    }
}
