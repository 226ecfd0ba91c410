// =============================================================================
// Core domain types — Session, Decision, CycleRecord, Position
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Background worker lifecycle, per the supervisor's state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BgStatus {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
    Crashed,
}

impl std::fmt::Display for BgStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BgStatus::Idle => "idle",
            BgStatus::Starting => "starting",
            BgStatus::Running => "running",
            BgStatus::Stopping => "stopping",
            BgStatus::Stopped => "stopped",
            BgStatus::Crashed => "crashed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for BgStatus {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "idle" => BgStatus::Idle,
            "starting" => BgStatus::Starting,
            "running" => BgStatus::Running,
            "stopping" => BgStatus::Stopping,
            "stopped" => BgStatus::Stopped,
            "crashed" => BgStatus::Crashed,
            other => anyhow::bail!("unknown bg_status '{other}'"),
        })
    }
}

/// Session-level status, distinct from the worker's `bg_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Stopped,
    Crashed,
    Completed,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionStatus::Running => "running",
            SessionStatus::Stopped => "stopped",
            SessionStatus::Crashed => "crashed",
            SessionStatus::Completed => "completed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "running" => SessionStatus::Running,
            "stopped" => SessionStatus::Stopped,
            "crashed" => SessionStatus::Crashed,
            "completed" => SessionStatus::Completed,
            other => anyhow::bail!("unknown session_status '{other}'"),
        })
    }
}

/// Margin mode forwarded to `set_leverage` / order placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MarginMode {
    Crossed,
    Isolated,
}

impl Default for MarginMode {
    fn default() -> Self {
        MarginMode::Crossed
    }
}

/// Risk parameters configured at session creation; immutable afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskParams {
    pub max_notional_per_trade: f64,
    pub max_leverage: u32,
    pub max_drawdown_pct: f64,
    pub max_total_exposure: f64,
    pub max_positions: u32,
    #[serde(default)]
    pub margin_mode: MarginMode,
}

impl Default for RiskParams {
    fn default() -> Self {
        Self {
            max_notional_per_trade: 1000.0,
            max_leverage: 10,
            max_drawdown_pct: 10.0,
            max_total_exposure: 5000.0,
            max_positions: 3,
            margin_mode: MarginMode::Crossed,
        }
    }
}

/// The top-level unit of work: a user-initiated agent run over a set of
/// instruments with a fixed risk policy and cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub initial_capital: f64,
    pub instruments: Vec<String>,
    pub risk_params: RiskParams,
    pub decision_interval_secs: u64,

    pub session_status: SessionStatus,
    pub bg_status: BgStatus,
    pub cycle_count: u64,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
}

/// Request payload to start a new session.
#[derive(Debug, Clone, Deserialize)]
pub struct StartSessionRequest {
    pub instruments: Vec<String>,
    pub initial_capital: f64,
    pub risk_params: RiskParams,
    pub decision_interval_secs: u64,
    /// When true, the worker is spawned immediately; when false the session
    /// is created in `idle` and must be started explicitly.
    #[serde(default = "default_auto_start")]
    pub auto_start_agent: bool,
}

fn default_auto_start() -> bool {
    true
}

/// A model-emitted instruction for one instrument within one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAction {
    OpenLong,
    OpenShort,
    CloseLong,
    CloseShort,
    Hold,
    Wait,
}

impl DecisionAction {
    pub fn is_open(&self) -> bool {
        matches!(self, DecisionAction::OpenLong | DecisionAction::OpenShort)
    }

    pub fn is_close(&self) -> bool {
        matches!(self, DecisionAction::CloseLong | DecisionAction::CloseShort)
    }
}

/// Either an absolute price or a percentage distance from mark price; absolute
/// takes precedence when both are present on the same decision.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PriceRef {
    Absolute(f64),
    Percent(f64),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub symbol: String,
    pub action: DecisionAction,
    pub leverage: u32,
    pub notional_usd: f64,
    #[serde(default)]
    pub stop_loss: Option<PriceRef>,
    #[serde(default)]
    pub take_profit: Option<PriceRef>,
    pub confidence: u8,
    pub rationale: String,
    #[serde(default)]
    pub risk_usd: Option<f64>,
}

/// A risk-gate warning attached to a clamped or rejected decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Warning {
    pub code: String,
    pub message: String,
}

/// Verdict the risk gate assigns to a single decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Verdict {
    Approved(Decision),
    Clamped(Decision, Vec<Warning>),
    Rejected(Decision, String),
}

impl Verdict {
    pub fn decision(&self) -> &Decision {
        match self {
            Verdict::Approved(d) | Verdict::Clamped(d, _) | Verdict::Rejected(d, _) => d,
        }
    }

    pub fn is_approved(&self) -> bool {
        matches!(self, Verdict::Approved(_) | Verdict::Clamped(_, _))
    }
}

/// Outcome of the portfolio-level checks run once per cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioVerdict {
    pub approved: bool,
    pub warnings: Vec<Warning>,
    #[serde(default)]
    pub rejection_reason: Option<String>,
}

/// A live exchange position, read through from the adapter each cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: PositionSide,
    pub contracts: f64,
    pub entry_price: f64,
    pub mark_price: f64,
    pub unrealized_pnl: f64,
    pub leverage: u32,
    pub liquidation_price: Option<f64>,
    pub margin_mode: MarginMode,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub linked_take_profit: Option<OrderRef>,
    #[serde(default)]
    pub linked_stop_loss: Option<OrderRef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRef {
    pub order_id: String,
    pub order_type: String,
    pub price: f64,
}

/// Result of executing one approved (or rejected) decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub symbol: String,
    pub action: DecisionAction,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub order_id: Option<String>,
}

/// Account-level aggregate attached to every CycleRecord.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSummary {
    pub total_equity: f64,
    pub available_balance: f64,
    pub total_unrealized_pnl: f64,
    pub total_return_pct: f64,
    pub sharpe_ratio: f64,
    pub margin_used_pct: f64,
    pub cash_pct: f64,
    pub position_count: u32,
}

/// The audit trail for one decision cycle of one session. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleRecord {
    pub session_id: i64,
    pub cycle_number: u64,
    pub timestamp: DateTime<Utc>,
    pub user_prompt: String,
    pub llm_reply: Option<String>,
    pub decisions: Vec<Decision>,
    pub parse_errors: Vec<String>,
    pub verdicts: Vec<Verdict>,
    pub portfolio_verdict: Option<PortfolioVerdict>,
    pub execution_results: Vec<ExecutionResult>,
    pub account_summary: Option<AccountSummary>,
    /// Set when the cycle aborted early (assemble_failed / llm_failed /
    /// execute_failed); absent on a clean run.
    pub stage_error: Option<String>,
}

/// One point on a session's asset-value timeline, projected from a
/// `CycleRecord` for charting. `decision_type` collapses the cycle's
/// decisions down to a single coarse label.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetTimelinePoint {
    pub ts: DateTime<Utc>,
    pub account_balance: f64,
    pub unrealized_pnl: f64,
    pub total_asset: f64,
    pub decision_type: String,
}
