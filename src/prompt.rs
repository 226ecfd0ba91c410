// =============================================================================
// Prompt text layout
// =============================================================================
//
// Lays out the per-cycle `CycleContext` as plain text for the LLM gateway.
// This is deliberately a flat text formatter, not a templating engine — the
// actual placeholder vocabulary (account block, per-instrument block, open
// position block) is an external contract the model was trained against, not
// something this crate owns the rendering strategy for.
// =============================================================================

use std::fmt::Write as _;

use chrono::{DateTime, Utc};

use crate::market_data::CycleContext;

pub fn render_prompt(
    session_id: i64,
    cycle_number: u64,
    session_started_at: DateTime<Utc>,
    now: DateTime<Utc>,
    ctx: &CycleContext,
) -> String {
    let mut out = String::new();

    let uptime_minutes = (now - session_started_at).num_minutes().max(0);

    let _ = writeln!(out, "session {session_id}, cycle {cycle_number}");
    let _ = writeln!(out, "wall_clock_time: {}", now.to_rfc3339());
    let _ = writeln!(out, "session_uptime_minutes: {uptime_minutes}");
    let _ = writeln!(out);

    let _ = writeln!(out, "# btc overview");
    let _ = writeln!(
        out,
        "{} last_price={:.6} change_1h_pct={} change_4h_pct={}",
        ctx.btc_snapshot.symbol,
        ctx.btc_snapshot.last_price,
        fmt_opt(ctx.btc_snapshot.change_1h_pct),
        fmt_opt(ctx.btc_snapshot.change_4h_pct)
    );
    let _ = writeln!(out);

    let _ = writeln!(out, "# account");
    let _ = writeln!(out, "total_equity: {:.2}", ctx.account.total_equity);
    let _ = writeln!(out, "available_balance: {:.2}", ctx.account.available_balance);
    let _ = writeln!(out, "cash_pct: {:.2}", ctx.account.cash_pct);
    let _ = writeln!(out, "total_unrealized_pnl: {:.2}", ctx.account.total_unrealized_pnl);
    let _ = writeln!(out, "total_return_pct: {:.2}", ctx.account.total_return_pct);
    let _ = writeln!(out, "sharpe_ratio: {:.3}", ctx.account.sharpe_ratio);
    let _ = writeln!(out, "margin_used_pct: {:.2}", ctx.account.margin_used_pct);
    let _ = writeln!(out, "position_count: {}", ctx.account.position_count);
    let _ = writeln!(out);

    let _ = writeln!(out, "# open positions");
    if ctx.positions.is_empty() {
        let _ = writeln!(out, "(none)");
    } else {
        for p in &ctx.positions {
            let _ = writeln!(
                out,
                "{} {:?} contracts={:.4} entry={:.4} mark={:.4} upnl={:.2} leverage={}",
                p.symbol, p.side, p.contracts, p.entry_price, p.mark_price, p.unrealized_pnl, p.leverage
            );
        }
    }
    let _ = writeln!(out);

    let _ = writeln!(out, "# instruments");
    for snap in &ctx.instruments {
        let _ = writeln!(out, "## {}", snap.symbol);
        let _ = writeln!(out, "last_price: {:.6}", snap.last_price);
        let _ = writeln!(out, "change_1h_pct: {}", fmt_opt(snap.change_1h_pct));
        let _ = writeln!(out, "change_4h_pct: {}", fmt_opt(snap.change_4h_pct));
        let _ = writeln!(out, "ema_12: {}", fmt_opt(snap.ema_short));
        let _ = writeln!(out, "ema_26: {}", fmt_opt(snap.ema_long));
        if let Some(macd) = &snap.macd {
            let _ = writeln!(
                out,
                "macd: line={:.6} signal={:.6} histogram={:.6}",
                macd.macd, macd.signal, macd.histogram
            );
        } else {
            let _ = writeln!(out, "macd: n/a");
        }
        let _ = writeln!(out, "rsi_7: {}", fmt_opt(snap.rsi_short));
        let _ = writeln!(out, "rsi_14: {}", fmt_opt(snap.rsi_long));
        let _ = writeln!(out, "atr_7: {}", fmt_opt(snap.atr_short));
        let _ = writeln!(out, "atr_14: {}", fmt_opt(snap.atr_long));
        let _ = writeln!(out, "volume: {:.2} (avg {:.2})", snap.volume, snap.avg_volume);
        let _ = writeln!(out, "funding_rate: {}", fmt_opt(snap.funding_rate));
        let _ = writeln!(out, "open_interest: {}", fmt_opt(snap.open_interest));
        match &snap.position {
            Some(p) => {
                let _ = writeln!(out, "open_position: side={:?} contracts={:.4} entry={:.4}", p.side, p.contracts, p.entry_price);
            }
            None => {
                let _ = writeln!(out, "open_position: none");
            }
        }
        let _ = writeln!(out);
    }

    let _ = writeln!(
        out,
        "Respond with brief reasoning followed by a fenced ```json array of decisions, one per instrument you want to act on."
    );

    out
}

fn fmt_opt(v: Option<f64>) -> String {
    match v {
        Some(v) => format!("{v:.6}"),
        None => "n/a".to_string(),
    }
}
