// =============================================================================
// Response Parser (C4)
// =============================================================================
//
// Total function from an unstructured LLM reply to a `ParsedResponse`. Never
// raises: malformed input yields empty decisions plus a parse_errors entry,
// not an error return.
// =============================================================================

use serde::Deserialize;

use crate::types::{Decision, DecisionAction, PriceRef};

#[derive(Debug, Clone)]
pub struct ParsedResponse {
    pub thinking: String,
    pub decisions: Vec<Decision>,
    pub raw_json: String,
    pub parse_errors: Vec<String>,
}

/// Wire shape of one decision element as the model emits it; looser than
/// `Decision` so coercion/validation can happen explicitly below rather than
/// failing the whole parse on one bad field.
#[derive(Debug, Deserialize)]
struct RawDecision {
    symbol: String,
    action: String,
    #[serde(default)]
    leverage: Option<i64>,
    #[serde(default)]
    position_size_usd: Option<f64>,
    #[serde(default)]
    stop_loss_price: Option<f64>,
    #[serde(default)]
    stop_loss_pct: Option<f64>,
    #[serde(default)]
    take_profit_price: Option<f64>,
    #[serde(default)]
    take_profit_pct: Option<f64>,
    #[serde(default)]
    confidence: Option<i64>,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default)]
    risk_usd: Option<f64>,
}

/// Parse one LLM reply into a `ParsedResponse`. Never panics or returns `Err`.
pub fn parse_response(reply: &str) -> ParsedResponse {
    let (thinking, candidate) = extract_json_array(reply);

    let candidate = match candidate {
        Some(c) => c,
        None => {
            return ParsedResponse {
                thinking,
                decisions: Vec::new(),
                raw_json: String::new(),
                parse_errors: vec!["no JSON array found in reply".to_string()],
            }
        }
    };

    let raw: Vec<RawDecision> = match serde_json::from_str(&candidate) {
        Ok(v) => v,
        Err(_) => match serde_json::from_str(&strip_trailing_commas(&candidate)) {
            Ok(v) => v,
            Err(e) => {
                return ParsedResponse {
                    thinking,
                    decisions: Vec::new(),
                    raw_json: candidate,
                    parse_errors: vec![format!("json parse failed: {e}")],
                }
            }
        },
    };

    let mut decisions = Vec::with_capacity(raw.len());
    let mut parse_errors = Vec::new();

    for (i, r) in raw.into_iter().enumerate() {
        match coerce_decision(r) {
            Ok(d) => decisions.push(d),
            Err(e) => parse_errors.push(format!("decision[{i}]: {e}")),
        }
    }

    ParsedResponse { thinking, decisions, raw_json: candidate, parse_errors }
}

/// Locate a JSON array in `reply`, trying in order: a fenced ```json block,
/// any fenced block whose content starts with `[` and ends with `]`, and
/// finally the substring from the first `[` to the last `]`. Returns the text
/// preceding the match as "thinking".
fn extract_json_array(reply: &str) -> (String, Option<String>) {
    if let Some((thinking, body)) = extract_fenced(reply, "```json") {
        return (thinking, Some(body));
    }
    if let Some((thinking, body)) = extract_any_fenced_array(reply) {
        return (thinking, Some(body));
    }
    if let (Some(start), Some(end)) = (reply.find('['), reply.rfind(']')) {
        if end > start {
            return (reply[..start].to_string(), Some(reply[start..=end].to_string()));
        }
    }
    (reply.to_string(), None)
}

fn extract_fenced(reply: &str, fence: &str) -> Option<(String, String)> {
    let start = reply.find(fence)?;
    let body_start = start + fence.len();
    let rest = &reply[body_start..];
    let end = rest.find("```")?;
    let body = rest[..end].trim().to_string();
    if body.starts_with('[') && body.ends_with(']') {
        Some((reply[..start].to_string(), body))
    } else {
        None
    }
}

fn extract_any_fenced_array(reply: &str) -> Option<(String, String)> {
    let mut search_from = 0;
    while let Some(rel_start) = reply[search_from..].find("```") {
        let start = search_from + rel_start;
        let body_start = start + 3;
        // Skip an optional language tag on the same line as the fence.
        let body_start = reply[body_start..]
            .find('\n')
            .map(|nl| body_start + nl + 1)
            .unwrap_or(body_start);
        let rest = &reply[body_start..];
        if let Some(end) = rest.find("```") {
            let body = rest[..end].trim().to_string();
            if body.starts_with('[') && body.ends_with(']') {
                return Some((reply[..start].to_string(), body));
            }
            search_from = body_start + end + 3;
        } else {
            break;
        }
    }
    None
}

fn strip_trailing_commas(json: &str) -> String {
    let mut out = String::with_capacity(json.len());
    let chars: Vec<char> = json.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == ',' {
            let mut j = i + 1;
            while j < chars.len() && chars[j].is_whitespace() {
                j += 1;
            }
            if j < chars.len() && (chars[j] == ']' || chars[j] == '}') {
                i += 1;
                continue;
            }
        }
        out.push(chars[i]);
        i += 1;
    }
    out
}

fn coerce_decision(r: RawDecision) -> Result<Decision, String> {
    let action = match r.action.to_lowercase().as_str() {
        "open_long" => DecisionAction::OpenLong,
        "open_short" => DecisionAction::OpenShort,
        "close_long" => DecisionAction::CloseLong,
        "close_short" => DecisionAction::CloseShort,
        "hold" => DecisionAction::Hold,
        "wait" => DecisionAction::Wait,
        other => return Err(format!("unknown action '{other}'")),
    };

    let rationale = r.reasoning.unwrap_or_default();

    if !action.is_open() {
        return Ok(Decision {
            symbol: r.symbol,
            action,
            leverage: 0,
            notional_usd: 0.0,
            stop_loss: None,
            take_profit: None,
            confidence: 0,
            rationale,
            risk_usd: None,
        });
    }

    let leverage = r.leverage.ok_or("missing leverage for open action")?;
    if leverage <= 0 {
        return Err("leverage must be > 0".to_string());
    }
    let notional = r.position_size_usd.ok_or("missing position_size_usd for open action")?;
    if notional <= 0.0 {
        return Err("notional must be > 0".to_string());
    }
    let confidence = r.confidence.ok_or("missing confidence for open action")?;
    if !(0..=100).contains(&confidence) {
        return Err("confidence must be in [0,100]".to_string());
    }

    // Absolute price takes precedence over percentage when both are present.
    let stop_loss = match (r.stop_loss_price, r.stop_loss_pct) {
        (Some(p), _) if p > 0.0 => Some(PriceRef::Absolute(p)),
        (_, Some(pct)) => Some(PriceRef::Percent(pct)),
        _ => None,
    };
    let take_profit = match (r.take_profit_price, r.take_profit_pct) {
        (Some(p), _) if p > 0.0 => Some(PriceRef::Absolute(p)),
        (_, Some(pct)) => Some(PriceRef::Percent(pct)),
        _ => None,
    };

    Ok(Decision {
        symbol: r.symbol,
        action,
        leverage: leverage as u32,
        notional_usd: notional,
        stop_loss,
        take_profit,
        confidence: confidence as u8,
        rationale,
        risk_usd: r.risk_usd,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fenced_json_block() {
        let reply = "some analysis\n```json\n[{\"symbol\":\"BTC/USDT:USDT\",\"action\":\"open_long\",\"leverage\":10,\"position_size_usd\":2000,\"confidence\":80,\"reasoning\":\"x\"}]\n```";
        let parsed = parse_response(reply);
        assert_eq!(parsed.decisions.len(), 1);
        assert!(parsed.parse_errors.is_empty());
        assert_eq!(parsed.decisions[0].action, DecisionAction::OpenLong);
        assert_eq!(parsed.decisions[0].leverage, 10);
    }

    #[test]
    fn prose_only_reply_yields_empty_decisions_and_error() {
        let reply = "I think we should wait and see how the market develops.";
        let parsed = parse_response(reply);
        assert!(parsed.decisions.is_empty());
        assert!(!parsed.parse_errors.is_empty());
    }

    #[test]
    fn never_panics_on_garbage_input() {
        for s in ["", "[", "]", "{{{", "```json\n[\n```", "\u{0}\u{1}"] {
            let parsed = parse_response(s);
            let _ = parsed.decisions.len();
        }
    }

    #[test]
    fn repairs_trailing_comma() {
        let reply = "```json\n[{\"symbol\":\"BTC\",\"action\":\"hold\",\"reasoning\":\"x\"},]\n```";
        let parsed = parse_response(reply);
        assert_eq!(parsed.decisions.len(), 1);
    }

    #[test]
    fn rejects_open_action_missing_leverage() {
        let reply = "```json\n[{\"symbol\":\"BTC\",\"action\":\"open_long\",\"position_size_usd\":100,\"confidence\":50,\"reasoning\":\"x\"}]\n```";
        let parsed = parse_response(reply);
        assert!(parsed.decisions.is_empty());
        assert_eq!(parsed.parse_errors.len(), 1);
    }

    #[test]
    fn absolute_price_wins_over_percentage() {
        let reply = "```json\n[{\"symbol\":\"BTC\",\"action\":\"open_long\",\"leverage\":5,\"position_size_usd\":100,\"confidence\":50,\"stop_loss_price\":90.0,\"stop_loss_pct\":5.0,\"reasoning\":\"x\"}]\n```";
        let parsed = parse_response(reply);
        assert_eq!(parsed.decisions[0].stop_loss, Some(PriceRef::Absolute(90.0)));
    }

    #[test]
    fn close_action_only_requires_symbol_and_reasoning() {
        let reply = "```json\n[{\"symbol\":\"ETH\",\"action\":\"close_long\",\"reasoning\":\"target hit\"}]\n```";
        let parsed = parse_response(reply);
        assert_eq!(parsed.decisions.len(), 1);
        assert!(parsed.parse_errors.is_empty());
    }
}
