// =============================================================================
// Pipeline Runner (C6)
// =============================================================================
//
// One cycle, strictly sequential: Assemble -> Consult -> Parse -> Gate ->
// Execute -> Audit. A failure in executing decision N does not short-circuit
// decisions N+1..; each execution result is recorded independently. Between
// successful exchange calls the executor yields briefly (~500ms) to avoid
// bursting the venue, matching the source project's execution-agent pacing.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, instrument, warn};

use crate::decision::parse_response;
use crate::error::CycleStage;
use crate::exchange::ExchangeAdapter;
use crate::llm::LlmGateway;
use crate::market_data::Assembler;
use crate::prompt::render_prompt;
use crate::risk::RiskGate;
use crate::types::{CycleRecord, Decision, DecisionAction, ExecutionResult, PriceRef, Verdict};

/// Yield between successful exchange calls during execution, per the source
/// project's `execution_agent.py` pacing (only applied after success).
const INTER_ORDER_YIELD: Duration = Duration::from_millis(500);

pub struct PipelineRunner<A: ExchangeAdapter, L: LlmGateway> {
    adapter: Arc<A>,
    gateway: Arc<L>,
    assembler: Assembler<A>,
    risk_gate: RiskGate,
    started_at: chrono::DateTime<chrono::Utc>,
}

impl<A: ExchangeAdapter, L: LlmGateway> PipelineRunner<A, L> {
    pub fn new(
        adapter: Arc<A>,
        gateway: Arc<L>,
        risk_params: crate::types::RiskParams,
        initial_capital: f64,
        started_at: chrono::DateTime<chrono::Utc>,
    ) -> Self {
        Self {
            assembler: Assembler::new(adapter.clone(), initial_capital),
            adapter,
            gateway,
            risk_gate: RiskGate::new(risk_params),
            started_at,
        }
    }

    /// Run one cycle. Always returns a `CycleRecord` — a failure at the
    /// Assemble or Consult stage produces a partial record with `stage_error`
    /// set, per §4.6; the cycle counter still advances regardless (callers
    /// increment it around this call).
    #[instrument(skip(self, session_id, cycle_number), fields(session_id, cycle_number))]
    pub async fn run_cycle(&self, session_id: i64, cycle_number: u64, instruments: &[String]) -> CycleRecord {
        let timestamp = chrono::Utc::now();

        let context = match self.assembler.assemble(instruments).await {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "assemble stage failed, aborting cycle");
                return CycleRecord {
                    session_id,
                    cycle_number,
                    timestamp,
                    user_prompt: String::new(),
                    llm_reply: None,
                    decisions: Vec::new(),
                    parse_errors: Vec::new(),
                    verdicts: Vec::new(),
                    portfolio_verdict: None,
                    execution_results: Vec::new(),
                    account_summary: None,
                    stage_error: Some(CycleStage::Assemble.to_string()),
                };
            }
        };

        let user_prompt = render_prompt(session_id, cycle_number, self.started_at, timestamp, &context);

        let system_text = "You are a disciplined crypto-futures trading assistant. \
            Respond with your reasoning followed by a fenced ```json array of decisions.";

        let llm_reply = match self.gateway.chat(system_text, &user_prompt, 0.1).await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "llm consult stage failed, aborting cycle");
                return CycleRecord {
                    session_id,
                    cycle_number,
                    timestamp,
                    user_prompt,
                    llm_reply: None,
                    decisions: Vec::new(),
                    parse_errors: Vec::new(),
                    verdicts: Vec::new(),
                    portfolio_verdict: None,
                    execution_results: Vec::new(),
                    account_summary: Some(context.account.clone()),
                    stage_error: Some(CycleStage::Consult.to_string()),
                };
            }
        };

        let parsed = parse_response(&llm_reply);

        let mark_prices: HashMap<String, f64> =
            context.instruments.iter().map(|s| (s.symbol.clone(), s.last_price)).collect();

        let (verdicts, portfolio_verdict) = self.risk_gate.evaluate(
            parsed.decisions.clone(),
            context.account.total_equity,
            &context.positions,
            &mark_prices,
        );

        let execution_results = self.execute(&verdicts).await;

        CycleRecord {
            session_id,
            cycle_number,
            timestamp,
            user_prompt,
            llm_reply: Some(llm_reply),
            decisions: parsed.decisions,
            parse_errors: parsed.parse_errors,
            verdicts,
            portfolio_verdict: Some(portfolio_verdict),
            execution_results,
            account_summary: Some(context.account),
            stage_error: None,
        }
    }

    /// Execute every approved/clamped decision in list order. Errors on one
    /// decision are recorded, not propagated; the loop always continues.
    async fn execute(&self, verdicts: &[Verdict]) -> Vec<ExecutionResult> {
        let mut results = Vec::with_capacity(verdicts.len());

        for verdict in verdicts {
            let decision = match verdict {
                Verdict::Approved(d) | Verdict::Clamped(d, _) => d,
                Verdict::Rejected(d, reason) => {
                    results.push(ExecutionResult {
                        symbol: d.symbol.clone(),
                        action: d.action.clone(),
                        success: false,
                        error: Some(format!("rejected: {reason}")),
                        order_id: None,
                    });
                    continue;
                }
            };

            let result = self.execute_decision(decision).await;
            let succeeded = result.success;
            results.push(result);

            if succeeded {
                tokio::time::sleep(INTER_ORDER_YIELD).await;
            }
        }

        results
    }

    async fn execute_decision(&self, decision: &Decision) -> ExecutionResult {
        match decision.action {
            DecisionAction::OpenLong | DecisionAction::OpenShort => self.execute_open(decision).await,
            DecisionAction::CloseLong | DecisionAction::CloseShort => self.execute_close(decision).await,
            DecisionAction::Hold | DecisionAction::Wait => ExecutionResult {
                symbol: decision.symbol.clone(),
                action: decision.action.clone(),
                success: true,
                error: None,
                order_id: None,
            },
        }
    }

    async fn execute_open(&self, decision: &Decision) -> ExecutionResult {
        let ticker = match self.adapter.get_ticker(&decision.symbol).await {
            Ok(t) => t,
            Err(e) => {
                return ExecutionResult {
                    symbol: decision.symbol.clone(),
                    action: decision.action.clone(),
                    success: false,
                    error: Some(format!("price lookup failed: {e}")),
                    order_id: None,
                }
            }
        };

        let qty = if ticker.last > 0.0 { decision.notional_usd / ticker.last } else { 0.0 };
        if qty <= 0.0 {
            return ExecutionResult {
                symbol: decision.symbol.clone(),
                action: decision.action.clone(),
                success: false,
                error: Some("computed quantity <= 0".to_string()),
                order_id: None,
            };
        }

        if let Err(e) = self.adapter.set_leverage(&decision.symbol, decision.leverage).await {
            warn!(symbol = %decision.symbol, error = %e, "set_leverage failed, continuing (non-fatal)");
        }

        let sl_ref = as_advisory(decision.stop_loss);
        let tp_ref = as_advisory(decision.take_profit);

        let margin_mode = crate::types::MarginMode::Crossed;

        let result = match decision.action {
            DecisionAction::OpenLong => {
                self.adapter.open_long(&decision.symbol, qty, decision.leverage, margin_mode, sl_ref, tp_ref).await
            }
            DecisionAction::OpenShort => {
                self.adapter.open_short(&decision.symbol, qty, decision.leverage, margin_mode, sl_ref, tp_ref).await
            }
            _ => unreachable!(),
        };

        match result {
            Ok(r) => {
                info!(symbol = %decision.symbol, order_id = %r.order_id, "position opened");
                ExecutionResult {
                    symbol: decision.symbol.clone(),
                    action: decision.action.clone(),
                    success: true,
                    error: None,
                    order_id: Some(r.order_id),
                }
            }
            Err(e) => ExecutionResult {
                symbol: decision.symbol.clone(),
                action: decision.action.clone(),
                success: false,
                error: Some(e.to_string()),
                order_id: None,
            },
        }
    }

    async fn execute_close(&self, decision: &Decision) -> ExecutionResult {
        let positions = match self.adapter.get_positions().await {
            Ok(p) => p,
            Err(e) => {
                return ExecutionResult {
                    symbol: decision.symbol.clone(),
                    action: decision.action.clone(),
                    success: false,
                    error: Some(format!("position lookup failed: {e}")),
                    order_id: None,
                }
            }
        };

        let expected_side = if decision.action == DecisionAction::CloseLong {
            crate::types::PositionSide::Long
        } else {
            crate::types::PositionSide::Short
        };

        let position = positions.iter().find(|p| p.symbol == decision.symbol && p.side == expected_side);
        let position = match position {
            Some(p) => p,
            None => {
                return ExecutionResult {
                    symbol: decision.symbol.clone(),
                    action: decision.action.clone(),
                    success: false,
                    error: Some("position_not_found".to_string()),
                    order_id: None,
                }
            }
        };

        match self.adapter.close_position(&decision.symbol, expected_side, Some(position.contracts)).await {
            Ok(r) => ExecutionResult {
                symbol: decision.symbol.clone(),
                action: decision.action.clone(),
                success: true,
                error: None,
                order_id: Some(r.order_id),
            },
            Err(e) => ExecutionResult {
                symbol: decision.symbol.clone(),
                action: decision.action.clone(),
                success: false,
                error: Some(e.to_string()),
                order_id: None,
            },
        }
    }
}

/// Advisory TP/SL value passed to the adapter as a plain price hint; the
/// adapter never turns this into a resting order (§4.1/P7).
fn as_advisory(price_ref: Option<PriceRef>) -> Option<f64> {
    match price_ref? {
        PriceRef::Absolute(p) => Some(p),
        PriceRef::Percent(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::fake::{FakeExchangeAdapter, RecordedCall};
    use crate::llm::LlmGateway;
    use crate::types::{MarginMode, RiskParams};
    use async_trait::async_trait;

    struct FakeGateway {
        reply: String,
    }

    #[async_trait]
    impl LlmGateway for FakeGateway {
        async fn chat(&self, _system: &str, _user: &str, _temp: f64) -> anyhow::Result<String> {
            Ok(self.reply.clone())
        }
    }

    struct FailingGateway;

    #[async_trait]
    impl LlmGateway for FailingGateway {
        async fn chat(&self, _system: &str, _user: &str, _temp: f64) -> anyhow::Result<String> {
            anyhow::bail!("llm unreachable")
        }
    }

    fn risk_params() -> RiskParams {
        RiskParams {
            max_notional_per_trade: 1000.0,
            max_leverage: 5,
            max_drawdown_pct: 10.0,
            max_total_exposure: 5000.0,
            max_positions: 3,
            margin_mode: MarginMode::Crossed,
        }
    }

    #[tokio::test]
    async fn s1_clamps_and_opens_with_no_resting_orders() {
        let adapter = Arc::new(FakeExchangeAdapter::new(10_000.0));
        let gateway = Arc::new(FakeGateway {
            reply: "analysis…\n```json\n[{\"symbol\":\"BTC/USDT:USDT\",\"action\":\"open_long\",\"leverage\":10,\"position_size_usd\":2000,\"confidence\":80,\"reasoning\":\"x\"}]\n```".to_string(),
        });
        let runner = PipelineRunner::new(adapter.clone(), gateway, risk_params(), 10_000.0, chrono::Utc::now());

        let record = runner.run_cycle(1, 1, &["BTC/USDT:USDT".to_string()]).await;

        assert!(record.stage_error.is_none());
        assert_eq!(record.execution_results.len(), 1);
        assert!(record.execution_results[0].success);

        let calls = adapter.calls();
        assert_eq!(calls.len(), 1);
        match &calls[0] {
            RecordedCall::OpenLong { leverage, .. } => assert_eq!(*leverage, 5),
            other => panic!("expected OpenLong, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn s2_prose_only_reply_yields_zero_decisions_and_no_orders() {
        let adapter = Arc::new(FakeExchangeAdapter::new(10_000.0));
        let gateway = Arc::new(FakeGateway { reply: "just some prose, no json here".to_string() });
        let runner = PipelineRunner::new(adapter.clone(), gateway, risk_params(), 10_000.0, chrono::Utc::now());

        let record = runner.run_cycle(1, 2, &["BTC/USDT:USDT".to_string()]).await;

        assert!(record.stage_error.is_none());
        assert!(record.decisions.is_empty());
        assert!(!record.parse_errors.is_empty());
        assert!(adapter.calls().is_empty());
    }

    #[tokio::test]
    async fn s4_close_with_no_matching_position_records_position_not_found() {
        let adapter = Arc::new(FakeExchangeAdapter::new(10_000.0));
        let gateway = Arc::new(FakeGateway {
            reply: "```json\n[{\"symbol\":\"ETH/USDT:USDT\",\"action\":\"close_long\",\"reasoning\":\"x\"}]\n```".to_string(),
        });
        let runner = PipelineRunner::new(adapter, gateway, risk_params(), 10_000.0, chrono::Utc::now());

        let record = runner.run_cycle(1, 7, &["ETH/USDT:USDT".to_string()]).await;

        assert_eq!(record.execution_results.len(), 1);
        assert!(!record.execution_results[0].success);
        assert_eq!(record.execution_results[0].error.as_deref(), Some("position_not_found"));
    }

    #[tokio::test]
    async fn llm_failure_aborts_at_consult_stage() {
        let adapter = Arc::new(FakeExchangeAdapter::new(10_000.0));
        let gateway = Arc::new(FailingGateway);
        let runner = PipelineRunner::new(adapter, gateway, risk_params(), 10_000.0, chrono::Utc::now());

        let record = runner.run_cycle(1, 3, &["BTC/USDT:USDT".to_string()]).await;

        assert_eq!(record.stage_error.as_deref(), Some("llm_failed"));
        assert!(record.execution_results.is_empty());
    }

    #[tokio::test]
    async fn assemble_failure_aborts_before_consult() {
        let adapter = Arc::new(FakeExchangeAdapter::new(10_000.0));
        *adapter.fail_account.lock() = true;
        let gateway = Arc::new(FakeGateway { reply: "unused".to_string() });
        let runner = PipelineRunner::new(adapter, gateway, risk_params(), 10_000.0, chrono::Utc::now());

        let record = runner.run_cycle(1, 1, &["BTC/USDT:USDT".to_string()]).await;

        assert_eq!(record.stage_error.as_deref(), Some("assemble_failed"));
    }
}
