// =============================================================================
// Risk Gate (C5)
// =============================================================================
//
// Per-decision checks (open actions only; close/hold/wait pass through
// untouched as low-risk) followed by one portfolio-level pass applied once
// per cycle. Clamps compose: the per-trade notional cap and the drawdown
// re-solve both apply, taking the tighter of the two. Mutations are applied
// to decisions in place *after* the portfolio-level checks run, so clamping
// one decision cannot smuggle an over-exposed batch past the gate.
//
// Formulas are ported from the source project's risk-analysis agent, not
// re-derived: max_loss = notional * (|stop_loss_pct| / 100) * leverage, and
// the drawdown re-solve is `safe_notional = (equity * max_drawdown_pct/100) /
// (|stop_loss_pct|/100 * leverage)`.
// =============================================================================

use std::collections::HashMap;

use tracing::warn;

use crate::types::{Decision, DecisionAction, PortfolioVerdict, Position, PriceRef, RiskParams, Verdict, Warning};

const MIN_REWARD_RISK_RATIO: f64 = 1.5;
const MIN_CONFIDENCE: u8 = 60;
const MAX_WARNINGS_BEFORE_REJECT: usize = 3;

pub struct RiskGate {
    params: RiskParams,
}

impl RiskGate {
    pub fn new(params: RiskParams) -> Self {
        Self { params }
    }

    /// Run per-decision checks, then the portfolio-level pass, then apply
    /// the portfolio verdict's "reject all new opens" rule if it failed.
    /// `mark_prices` maps symbol -> last traded price, used to canonicalize
    /// absolute stop-loss/take-profit prices to a percentage (Open Question
    /// #3: `pct = |price - mark_price| / mark_price * 100`).
    pub fn evaluate(
        &self,
        decisions: Vec<Decision>,
        account_equity: f64,
        current_positions: &[Position],
        mark_prices: &HashMap<String, f64>,
    ) -> (Vec<Verdict>, PortfolioVerdict) {
        let portfolio_verdict = self.evaluate_portfolio(&decisions, account_equity, current_positions);

        let mut verdicts: Vec<Verdict> = decisions
            .into_iter()
            .map(|d| {
                let mark_price = mark_prices.get(&d.symbol).copied();
                self.evaluate_one(d, account_equity, mark_price)
            })
            .collect();

        if !portfolio_verdict.approved {
            for v in verdicts.iter_mut() {
                if v.decision().action.is_open() && v.is_approved() {
                    let reason = portfolio_verdict
                        .rejection_reason
                        .clone()
                        .unwrap_or_else(|| "portfolio risk check failed".to_string());
                    *v = Verdict::Rejected(v.decision().clone(), reason);
                }
            }
        }

        (verdicts, portfolio_verdict)
    }

    fn evaluate_one(&self, decision: Decision, account_equity: f64, mark_price: Option<f64>) -> Verdict {
        if !decision.action.is_open() {
            return Verdict::Approved(decision);
        }

        let mut d = decision;
        let mut warnings = Vec::new();

        if d.notional_usd > self.params.max_notional_per_trade {
            warnings.push(Warning {
                code: "notional_clamped".into(),
                message: format!(
                    "notional {} exceeds max_notional_per_trade {}, clamped",
                    d.notional_usd, self.params.max_notional_per_trade
                ),
            });
            d.notional_usd = self.params.max_notional_per_trade;
        }

        if d.leverage > self.params.max_leverage {
            warnings.push(Warning {
                code: "leverage_clamped".into(),
                message: format!(
                    "leverage {} exceeds max_leverage {}, clamped",
                    d.leverage, self.params.max_leverage
                ),
            });
            d.leverage = self.params.max_leverage;
        }

        if let Some(sl_pct) = canonical_pct(d.stop_loss, d.action, mark_price) {
            let max_loss = d.notional_usd * (sl_pct.abs() / 100.0) * d.leverage as f64;
            let drawdown_pct = if account_equity > 0.0 { max_loss / account_equity * 100.0 } else { 0.0 };

            if drawdown_pct > self.params.max_drawdown_pct && sl_pct.abs() > 0.0 && d.leverage > 0 {
                let safe_notional = (account_equity * self.params.max_drawdown_pct / 100.0)
                    / (sl_pct.abs() / 100.0 * d.leverage as f64);
                warnings.push(Warning {
                    code: "drawdown_resolved".into(),
                    message: format!(
                        "projected drawdown {drawdown_pct:.2}% exceeds max_drawdown_pct {:.2}%, notional re-solved",
                        self.params.max_drawdown_pct
                    ),
                });
                d.notional_usd = safe_notional.min(d.notional_usd);
            }
        }

        if let (Some(sl_pct), Some(tp_pct)) = (
            canonical_pct(d.stop_loss, d.action, mark_price),
            canonical_pct(d.take_profit, d.action, mark_price),
        ) {
            if sl_pct.abs() > 0.0 {
                let ratio = tp_pct.abs() / sl_pct.abs();
                if ratio < MIN_REWARD_RISK_RATIO {
                    warnings.push(Warning {
                        code: "low_reward_risk".into(),
                        message: format!("reward/risk ratio {ratio:.2} below {MIN_REWARD_RISK_RATIO}"),
                    });
                }
            }
        }

        if d.confidence < MIN_CONFIDENCE {
            warnings.push(Warning {
                code: "low_confidence".into(),
                message: format!("confidence {} below {MIN_CONFIDENCE}", d.confidence),
            });
        }

        if warnings.len() >= MAX_WARNINGS_BEFORE_REJECT {
            return Verdict::Rejected(d, "too many risk signals".to_string());
        }

        if warnings.is_empty() {
            Verdict::Approved(d)
        } else {
            Verdict::Clamped(d, warnings)
        }
    }

    /// Computed from the raw, pre-clamp decisions the gateway produced — not
    /// from `evaluate_one`'s output — so clamping one decision down to the
    /// per-trade caps cannot shrink an over-exposed batch into passing.
    fn evaluate_portfolio(
        &self,
        decisions: &[Decision],
        account_equity: f64,
        current_positions: &[Position],
    ) -> PortfolioVerdict {
        // USDT-M linear futures contracts are 1:1 with the underlying (no
        // multiplier term), unlike inverse/coin-margined contracts, so
        // exposure is contracts * mark_price with nothing else to fold in.
        let current_exposure: f64 = current_positions
            .iter()
            .map(|p| (p.contracts * p.mark_price).abs())
            .sum();

        let new_opens: Vec<&Decision> = decisions.iter().filter(|d| d.action.is_open()).collect();

        let new_exposure: f64 = new_opens.iter().map(|d| d.notional_usd * d.leverage as f64).sum();
        let total_exposure = current_exposure + new_exposure;

        let mut warnings = Vec::new();

        if total_exposure > self.params.max_total_exposure {
            return PortfolioVerdict {
                approved: false,
                warnings,
                rejection_reason: Some(format!(
                    "total exposure {total_exposure:.2} exceeds max_total_exposure {:.2}",
                    self.params.max_total_exposure
                )),
            };
        }

        let total_positions = current_positions.len() + new_opens.len();
        if total_positions as u32 > self.params.max_positions {
            return PortfolioVerdict {
                approved: false,
                warnings,
                rejection_reason: Some(format!(
                    "total positions {total_positions} exceeds max_positions {}",
                    self.params.max_positions
                )),
            };
        }

        let total_risk: f64 = new_opens.iter().filter_map(|d| d.risk_usd).sum();
        if account_equity > 0.0 {
            let risk_pct = total_risk / account_equity * 100.0;
            if risk_pct > self.params.max_drawdown_pct {
                warnings.push(Warning {
                    code: "portfolio_risk_high".into(),
                    message: format!("aggregate new-open risk {risk_pct:.2}% exceeds max_drawdown_pct"),
                });
            }
        }

        let long_count = new_opens.iter().filter(|d| d.action == DecisionAction::OpenLong).count();
        let short_count = new_opens.iter().filter(|d| d.action == DecisionAction::OpenShort).count();
        if !new_opens.is_empty() && (long_count == 0 || short_count == 0) {
            warnings.push(Warning {
                code: "low_diversification".into(),
                message: "new open batch is entirely one-directional".to_string(),
            });
        }

        if warnings.len() > 0 {
            warn!(count = warnings.len(), "portfolio-level warnings raised");
        }

        PortfolioVerdict { approved: true, warnings, rejection_reason: None }
    }
}

/// Canonicalize a stop-loss/take-profit `PriceRef` to a percentage,
/// resolving Open Question #3: call sites that pass an absolute price are
/// normalized via `pct = |price - mark_price| / mark_price * 100` before any
/// drawdown/reward-risk check runs.
fn canonical_pct(price_ref: Option<PriceRef>, _action: DecisionAction, mark_price: Option<f64>) -> Option<f64> {
    match price_ref? {
        PriceRef::Percent(pct) => Some(pct),
        PriceRef::Absolute(price) => {
            let mark = mark_price?;
            if mark == 0.0 {
                return None;
            }
            Some((price - mark).abs() / mark * 100.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MarginMode;

    fn params() -> RiskParams {
        RiskParams {
            max_notional_per_trade: 1000.0,
            max_leverage: 5,
            max_drawdown_pct: 10.0,
            max_total_exposure: 5000.0,
            max_positions: 3,
            margin_mode: MarginMode::Crossed,
        }
    }

    fn open_decision(leverage: u32, notional: f64) -> Decision {
        Decision {
            symbol: "BTC/USDT:USDT".into(),
            action: DecisionAction::OpenLong,
            leverage,
            notional_usd: notional,
            stop_loss: Some(PriceRef::Percent(2.0)),
            take_profit: Some(PriceRef::Percent(4.0)),
            confidence: 80,
            rationale: "x".into(),
            risk_usd: None,
        }
    }

    #[test]
    fn clamps_never_increase_notional_or_leverage() {
        let gate = RiskGate::new(params());
        let (verdicts, _) = gate.evaluate(vec![open_decision(10, 2000.0)], 10_000.0, &[], &HashMap::new());
        let d = verdicts[0].decision();
        assert!(d.leverage <= 5);
        assert!(d.notional_usd <= 2000.0);
    }

    #[test]
    fn clamp_scenario_s1() {
        // S1: leverage 10 -> 5, notional 2000 -> 1000.
        let gate = RiskGate::new(params());
        let (verdicts, portfolio) = gate.evaluate(vec![open_decision(10, 2000.0)], 10_000.0, &[], &HashMap::new());
        assert_eq!(verdicts.len(), 1);
        let d = verdicts[0].decision();
        assert_eq!(d.leverage, 5);
        assert_eq!(d.notional_usd, 1000.0);
        assert!(portfolio.approved);
    }

    #[test]
    fn close_hold_wait_pass_through_untouched() {
        let gate = RiskGate::new(params());
        let hold = Decision {
            symbol: "BTC".into(),
            action: DecisionAction::Hold,
            leverage: 0,
            notional_usd: 0.0,
            stop_loss: None,
            take_profit: None,
            confidence: 0,
            rationale: "x".into(),
            risk_usd: None,
        };
        let (verdicts, _) = gate.evaluate(vec![hold], 10_000.0, &[], &HashMap::new());
        assert!(matches!(verdicts[0], Verdict::Approved(_)));
    }

    #[test]
    fn too_many_warnings_rejects() {
        let gate = RiskGate::new(params());
        // leverage over cap, notional over cap, confidence low, low R/R -> 4 warnings.
        let decision = Decision {
            symbol: "BTC".into(),
            action: DecisionAction::OpenLong,
            leverage: 20,
            notional_usd: 5000.0,
            stop_loss: Some(PriceRef::Percent(5.0)),
            take_profit: Some(PriceRef::Percent(3.0)),
            confidence: 40,
            rationale: "x".into(),
            risk_usd: None,
        };
        let (verdicts, _) = gate.evaluate(vec![decision], 10_000.0, &[], &HashMap::new());
        assert!(matches!(verdicts[0], Verdict::Rejected(_, ref reason) if reason == "too many risk signals"));
    }

    #[test]
    fn portfolio_exposure_rejects_all_new_opens_but_not_closes() {
        let gate = RiskGate::new(params());
        let open_a = open_decision(5, 1000.0);
        let open_b = open_decision(5, 1000.0);
        let close = Decision {
            symbol: "ETH".into(),
            action: DecisionAction::CloseLong,
            leverage: 0,
            notional_usd: 0.0,
            stop_loss: None,
            take_profit: None,
            confidence: 0,
            rationale: "x".into(),
            risk_usd: None,
        };
        // total exposure = 1000*5 + 1000*5 = 10000 > max_total_exposure 5000.
        let (verdicts, portfolio) = gate.evaluate(vec![open_a, open_b, close], 10_000.0, &[], &HashMap::new());
        assert!(!portfolio.approved);
        assert!(matches!(verdicts[0], Verdict::Rejected(_, _)));
        assert!(matches!(verdicts[1], Verdict::Rejected(_, _)));
        assert!(matches!(verdicts[2], Verdict::Approved(_)));
    }

    #[test]
    fn portfolio_check_uses_pre_clamp_exposure_not_smuggled_via_clamping() {
        // Raw decisions: leverage 10, notional 1000 each, well over the caps
        // (max_leverage=3, max_notional_per_trade=2000) but the true
        // pre-clamp combined exposure is 1000*10*2 = 20000, over
        // max_total_exposure=7000. If the portfolio check ran on the
        // already-clamped values (leverage 10 -> 3) it would instead see
        // 1000*3*2 = 6000 < 7000 and wrongly approve the batch.
        let params = RiskParams {
            max_notional_per_trade: 2000.0,
            max_leverage: 3,
            max_drawdown_pct: 50.0,
            max_total_exposure: 7000.0,
            max_positions: 10,
            margin_mode: MarginMode::Crossed,
        };
        let gate = RiskGate::new(params);
        let open_a = open_decision(10, 1000.0);
        let open_b = open_decision(10, 1000.0);
        let (verdicts, portfolio) = gate.evaluate(vec![open_a, open_b], 10_000.0, &[], &HashMap::new());
        assert!(!portfolio.approved);
        assert!(matches!(verdicts[0], Verdict::Rejected(_, _)));
        assert!(matches!(verdicts[1], Verdict::Rejected(_, _)));
    }

    #[test]
    fn one_directional_batch_warns_low_diversification() {
        let gate = RiskGate::new(params());
        let (_, portfolio) = gate.evaluate(vec![open_decision(5, 100.0)], 10_000.0, &[], &HashMap::new());
        assert!(portfolio.warnings.iter().any(|w| w.code == "low_diversification"));
    }

    #[test]
    fn canonical_pct_from_absolute_price() {
        let pct = canonical_pct(Some(PriceRef::Absolute(95.0)), DecisionAction::OpenLong, Some(100.0));
        assert_eq!(pct, Some(5.0));
    }

    #[test]
    fn evaluate_canonicalizes_absolute_stop_loss_via_mark_price_map() {
        // stop_loss=90 on a 100 mark => 10% stop; with leverage 5 and notional
        // 1000, max_loss = 1000 * 0.10 * 5 = 500, i.e. 5% of a 10_000 equity,
        // under the 10% cap, so no drawdown_resolved warning fires.
        let gate = RiskGate::new(params());
        let decision = Decision {
            symbol: "BTC/USDT:USDT".into(),
            action: DecisionAction::OpenLong,
            leverage: 5,
            notional_usd: 1000.0,
            stop_loss: Some(PriceRef::Absolute(90.0)),
            take_profit: Some(PriceRef::Absolute(110.0)),
            confidence: 80,
            rationale: "x".into(),
            risk_usd: None,
        };
        let mut mark_prices = HashMap::new();
        mark_prices.insert("BTC/USDT:USDT".to_string(), 100.0);
        let (verdicts, _) = gate.evaluate(vec![decision], 10_000.0, &[], &mark_prices);
        assert!(matches!(verdicts[0], Verdict::Approved(_)));
    }

    #[test]
    fn evaluate_without_mark_price_skips_absolute_price_canonicalization() {
        // No entry in mark_prices for this symbol: absolute stop_loss/take_profit
        // cannot be canonicalized, so neither the drawdown re-solve nor the
        // reward/risk check fires on them.
        let gate = RiskGate::new(params());
        let decision = Decision {
            symbol: "BTC/USDT:USDT".into(),
            action: DecisionAction::OpenLong,
            leverage: 5,
            notional_usd: 1000.0,
            stop_loss: Some(PriceRef::Absolute(90.0)),
            take_profit: Some(PriceRef::Absolute(110.0)),
            confidence: 80,
            rationale: "x".into(),
            risk_usd: None,
        };
        let (verdicts, _) = gate.evaluate(vec![decision], 10_000.0, &[], &HashMap::new());
        assert!(matches!(verdicts[0], Verdict::Approved(_)));
    }
}
