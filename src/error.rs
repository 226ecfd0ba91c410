// =============================================================================
// Error taxonomy
// =============================================================================
//
// `ExchangeError` is the closed set of failure kinds the exchange adapter
// contract can return. `CoreError` covers the handful of ways a cycle or a
// supervisor operation can fail at a level callers need to match on; anything
// below that boundary (wiring, IO, parsing glue) stays as `anyhow::Error`.
// =============================================================================

use thiserror::Error;

/// Failure kinds an exchange adapter call can return. No retries happen
/// inside the adapter — the caller decides what to do with these.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("network error: {0}")]
    Network(String),
    #[error("rate limited: {0}")]
    RateLimit(String),
    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),
    #[error("invalid order: {0}")]
    InvalidOrder(String),
    #[error("unsupported operation: {0}")]
    Unsupported(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("other exchange error: {0}")]
    Other(String),
}

impl ExchangeError {
    /// Transient errors are worth retrying on a later cycle without alarm.
    pub fn is_transient(&self) -> bool {
        matches!(self, ExchangeError::Network(_) | ExchangeError::RateLimit(_))
    }
}

/// Stage at which a pipeline cycle aborted, matching the CycleRecord's
/// stage-error field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum CycleStage {
    Assemble,
    Consult,
    Execute,
}

impl std::fmt::Display for CycleStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CycleStage::Assemble => write!(f, "assemble_failed"),
            CycleStage::Consult => write!(f, "llm_failed"),
            CycleStage::Execute => write!(f, "execute_failed"),
        }
    }
}

/// Errors the core's component boundaries surface to the supervisor / pipeline
/// runner in a form callers can match on.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("market data assembly failed: {0}")]
    Assemble(#[source] anyhow::Error),

    #[error("llm consult failed: {0}")]
    Llm(#[source] anyhow::Error),

    #[error("persistence failure: {0}")]
    Persistence(#[source] anyhow::Error),

    #[error("supervisor machinery failure: {0}")]
    Supervisor(#[source] anyhow::Error),
}

impl CoreError {
    /// Which pipeline stage this error aborted, if it is a pipeline-stage
    /// error at all (persistence/supervisor errors are not cycle stages).
    pub fn cycle_stage(&self) -> Option<CycleStage> {
        match self {
            CoreError::Assemble(_) => Some(CycleStage::Assemble),
            CoreError::Llm(_) => Some(CycleStage::Consult),
            _ => None,
        }
    }
}
