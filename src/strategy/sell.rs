//! Sell-decision evaluator.
//!
//! Pure and deterministic: a position, a price, the options and the
//! position of the iteration within its cycle in, one decision out.
//! Rules are checked in priority order and the first match wins.

use crate::config::InvestConfig;
use crate::types::{CloseReason, Position, SellDecision, Urgency};

/// Fraction of the cycle after which the early take-profit rule applies.
pub const EARLY_EXIT_PROGRESS: f64 = 0.75;

/// Share of the take-profit threshold that triggers an early exit.
pub const EARLY_EXIT_TP_SHARE: f64 = 0.5;

/// Decide whether to hold or sell `position` at `current_price`.
///
/// `iteration_index` is 0-based; `total_iterations` is the number of
/// iterations scheduled for the cycle.
pub fn evaluate_sell_decision(
    position: &Position,
    current_price: f64,
    config: &InvestConfig,
    iteration_index: usize,
    total_iterations: usize,
) -> SellDecision {
    let pnl_pct = position.price_change_pct(current_price);
    let pnl_pct = if pnl_pct.is_finite() { pnl_pct } else { 0.0 };

    if pnl_pct <= -config.stop_loss_pct {
        return SellDecision::sell(
            CloseReason::StopLoss,
            format!("Stop loss: {pnl_pct:.2}% <= -{:.2}%", config.stop_loss_pct),
            Urgency::High,
            pnl_pct,
        );
    }

    if pnl_pct >= config.take_profit_pct {
        return SellDecision::sell(
            CloseReason::TakeProfit,
            format!("Take profit: {pnl_pct:.2}% >= {:.2}%", config.take_profit_pct),
            Urgency::High,
            pnl_pct,
        );
    }

    let predicted = position.predicted_change;
    if predicted > 0.0 && pnl_pct > 0.0 && pnl_pct >= predicted {
        return SellDecision::sell(
            CloseReason::TargetReached,
            format!("Prediction reached: {pnl_pct:.2}% >= predicted {predicted:.2}%"),
            Urgency::Medium,
            pnl_pct,
        );
    }

    let last_index = total_iterations.saturating_sub(1);
    if iteration_index >= last_index {
        let urgency = if pnl_pct > 0.0 { Urgency::Low } else { Urgency::Medium };
        return SellDecision::sell(
            CloseReason::CycleEnd,
            format!(
                "Cycle end: forced close at iteration {}/{} ({pnl_pct:+.2}%)",
                iteration_index + 1,
                total_iterations.max(1)
            ),
            urgency,
            pnl_pct,
        );
    }

    // last_index > 0 here, since iteration_index < last_index.
    let progress = iteration_index as f64 / last_index as f64;
    let early_threshold = config.take_profit_pct * EARLY_EXIT_TP_SHARE;
    if progress >= EARLY_EXIT_PROGRESS && pnl_pct >= early_threshold {
        return SellDecision::sell(
            CloseReason::EarlyTakeProfit,
            format!(
                "Early take profit: {:.0}% of cycle elapsed, {pnl_pct:.2}% >= {early_threshold:.2}%",
                progress * 100.0
            ),
            Urgency::Medium,
            pnl_pct,
        );
    }

    SellDecision::hold(
        format!("Hold: {pnl_pct:+.2}% at iteration {}/{}", iteration_index + 1, total_iterations),
        pnl_pct,
    )
}
