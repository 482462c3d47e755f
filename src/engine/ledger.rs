//! Position ledger: target selection, capital allocation, P&L and closing.
//!
//! Every operation is a pure function of its inputs: positions go in by
//! reference and updated copies come out. `close_position` is the only
//! place that writes realized P&L, `closed_at` and `close_reason`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use tracing::{debug, info};

use crate::config::InvestConfig;
use crate::types::{AssetSnapshot, Classification, CloseReason, EngineError, Position, PositionStatus};

// ---------------------------------------------------------------------------
// Selection
// ---------------------------------------------------------------------------

/// A snapshot asset chosen for investment, with its capital allocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvestmentTarget {
    pub asset: AssetSnapshot,
    #[serde(rename = "capitalUSD")]
    pub capital_usd: f64,
    /// 1-based rank after sorting.
    pub rank: usize,
}

/// Outcome of `select_targets`. A "do not invest" outcome is data, not an error.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionResult {
    pub should_invest: bool,
    pub reason: String,
    pub selected: Vec<InvestmentTarget>,
    /// Candidates that passed the filters, before exclusion and truncation.
    pub candidates: usize,
    pub cycle_capital: f64,
    pub capital_per_position: f64,
}

impl SelectionResult {
    fn skip(reason: String, candidates: usize, cycle_capital: f64) -> Self {
        Self {
            should_invest: false,
            reason,
            selected: Vec::new(),
            candidates,
            cycle_capital,
            capital_per_position: 0.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

pub struct PositionLedger;

impl PositionLedger {
    /// Pick the assets to invest in for a new cycle.
    ///
    /// Filter: INVERTIBLE, `boost_power >= min_boost_power`,
    /// `predicted_change >= min_predicted_change`. Rank by predicted change,
    /// then boost power, both descending.
    pub fn select_targets(
        snapshot: &[AssetSnapshot],
        config: &InvestConfig,
        existing_positions: &[Position],
    ) -> SelectionResult {
        let cycle_capital = config.cycle_capital();

        let mut candidates: Vec<&AssetSnapshot> = snapshot
            .iter()
            .filter(|a| a.classification == Classification::Invertible)
            .filter(|a| a.boost_power >= config.min_boost_power)
            .filter(|a| a.predicted_change >= config.min_predicted_change)
            .filter(|a| a.price.is_finite() && a.price > 0.0)
            .collect();

        candidates.sort_by(|a, b| {
            b.predicted_change
                .total_cmp(&a.predicted_change)
                .then_with(|| b.boost_power.total_cmp(&a.boost_power))
        });

        // Position ids are per asset, so a repeated id keeps only its best-ranked entry.
        let mut seen_ids = HashSet::new();
        candidates.retain(|&a| seen_ids.insert(a.id.as_str()));

        let n_candidates = candidates.len();
        if n_candidates < config.min_signals {
            let reason = format!(
                "Not enough signals: {n_candidates} candidate(s), need {}",
                config.min_signals
            );
            debug!(candidates = n_candidates, min_signals = config.min_signals, "Selection skipped");
            return SelectionResult::skip(reason, n_candidates, cycle_capital);
        }

        let held: HashSet<&str> = existing_positions
            .iter()
            .filter(|p| p.is_open())
            .map(|p| p.asset_id.as_str())
            .collect();
        candidates.retain(|a| !held.contains(a.id.as_str()));

        if candidates.is_empty() {
            return SelectionResult::skip(
                format!("All {n_candidates} candidate(s) already have open positions"),
                n_candidates,
                cycle_capital,
            );
        }

        let take = if config.diversification { config.max_positions } else { 1 };
        candidates.truncate(take);

        let capital_per_position = cycle_capital / candidates.len() as f64;
        let selected: Vec<InvestmentTarget> = candidates
            .into_iter()
            .enumerate()
            .map(|(i, asset)| InvestmentTarget {
                asset: asset.clone(),
                capital_usd: capital_per_position,
                rank: i + 1,
            })
            .collect();

        let symbols: Vec<&str> = selected.iter().map(|t| t.asset.symbol.as_str()).collect();
        info!(
            candidates = n_candidates,
            selected = selected.len(),
            cycle_capital = format!("${:.2}", cycle_capital),
            per_position = format!("${:.2}", capital_per_position),
            symbols = ?symbols,
            "Targets selected"
        );

        SelectionResult {
            should_invest: true,
            reason: format!("{} target(s) from {n_candidates} candidate(s)", selected.len()),
            selected,
            candidates: n_candidates,
            cycle_capital,
            capital_per_position,
        }
    }

    /// Build an open position from a target. Fees and P&L start at zero.
    pub fn create_position(
        target: &InvestmentTarget,
        cycle_id: &str,
        config: &InvestConfig,
        opened_at: DateTime<Utc>,
    ) -> Result<Position, EngineError> {
        let asset = &target.asset;
        let entry = asset.price;
        if !(entry.is_finite() && entry > 0.0) {
            return Err(EngineError::InvalidPosition(format!(
                "{}: entry price must be positive, got {entry}",
                asset.symbol
            )));
        }
        if !(target.capital_usd.is_finite() && target.capital_usd > 0.0) {
            return Err(EngineError::InvalidPosition(format!(
                "{}: capital must be positive, got {}",
                asset.symbol, target.capital_usd
            )));
        }

        Ok(Position {
            id: format!("{cycle_id}-{}", asset.id),
            cycle_id: cycle_id.to_string(),
            asset_id: asset.id.clone(),
            symbol: asset.symbol.clone(),
            classification: asset.classification,
            status: PositionStatus::Open,
            entry_price: entry,
            current_price: entry,
            units: target.capital_usd / entry,
            capital_usd: target.capital_usd,
            take_profit_price: entry * (1.0 + config.take_profit_pct / 100.0),
            stop_loss_price: entry * (1.0 - config.stop_loss_pct / 100.0),
            predicted_change: asset.predicted_change,
            boost_power: asset.boost_power,
            opened_at,
            closed_at: None,
            hold_cycles: 0,
            max_hold_cycles: config.max_hold_cycles,
            unrealized_pnl: 0.0,
            unrealized_pnl_pct: 0.0,
            realized_pnl: None,
            realized_pnl_pct: None,
            entry_fee_usd: 0.0,
            exit_fee_usd: 0.0,
            total_fees_usd: 0.0,
            close_reason: None,
            entry_order_id: None,
        })
    }

    /// Record the entry fill: fee and order id.
    pub fn record_entry_fill(position: &Position, fee_usd: f64, order_id: Option<String>) -> Position {
        let mut p = position.clone();
        let fee = if fee_usd.is_finite() { fee_usd.max(0.0) } else { 0.0 };
        p.entry_fee_usd = fee;
        p.total_fees_usd = fee + p.exit_fee_usd;
        p.entry_order_id = order_id;
        p.unrealized_pnl = (p.current_price - p.entry_price) * p.units - p.total_fees_usd;
        p
    }

    /// Mark-to-market copy of an open position. Closed positions are returned unchanged.
    pub fn update_position_pnl(position: &Position, current_price: f64) -> Position {
        let mut p = position.clone();
        if p.is_closed() || !(current_price.is_finite() && current_price > 0.0) {
            return p;
        }
        p.current_price = current_price;
        p.unrealized_pnl = (current_price - p.entry_price) * p.units - p.total_fees_usd;
        p.unrealized_pnl_pct = p.price_change_pct(current_price);
        p
    }

    /// Close a position at `exit_price`.
    ///
    /// `exit_fee = capital × fee_pct / 100`, added to the entry fee;
    /// `realized = (exit − entry) × units − total_fees`. The percentage is
    /// the raw price change since entry.
    pub fn close_position(
        position: &Position,
        exit_price: f64,
        reason: CloseReason,
        config: &InvestConfig,
        closed_at: DateTime<Utc>,
    ) -> Result<Position, EngineError> {
        if position.is_closed() {
            return Err(EngineError::PositionClosed(position.id.clone()));
        }
        if !(exit_price.is_finite() && exit_price > 0.0) {
            return Err(EngineError::InvalidPosition(format!(
                "{}: exit price must be positive, got {exit_price}",
                position.id
            )));
        }

        let mut p = position.clone();
        let exit_fee = config.fee_for(p.capital_usd);
        p.exit_fee_usd = exit_fee;
        p.total_fees_usd = p.entry_fee_usd + exit_fee;

        let realized = (exit_price - p.entry_price) * p.units - p.total_fees_usd;
        p.status = PositionStatus::Closed;
        p.current_price = exit_price;
        p.realized_pnl = Some(realized);
        p.realized_pnl_pct = Some(p.price_change_pct(exit_price));
        p.unrealized_pnl = 0.0;
        p.unrealized_pnl_pct = 0.0;
        p.closed_at = Some(closed_at);
        p.close_reason = Some(reason);

        info!(
            position = %p.id,
            symbol = %p.symbol,
            reason = %reason,
            entry = p.entry_price,
            exit = exit_price,
            pnl = format!("${:.2}", realized),
            fees = format!("${:.2}", p.total_fees_usd),
            "Position closed"
        );

        Ok(p)
    }

    /// Threshold check for watchdog paths: stop loss, take profit, max hold.
    pub fn evaluate_close_conditions(
        position: &Position,
        current_price: f64,
        config: &InvestConfig,
    ) -> Option<CloseReason> {
        if position.is_closed() {
            return None;
        }
        let pnl_pct = position.price_change_pct(current_price);
        if pnl_pct.is_finite() {
            if pnl_pct <= -config.stop_loss_pct {
                return Some(CloseReason::StopLoss);
            }
            if pnl_pct >= config.take_profit_pct {
                return Some(CloseReason::TakeProfit);
            }
        }
        if position.max_hold_cycles > 0 && position.hold_cycles >= position.max_hold_cycles {
            return Some(CloseReason::MaxHold);
        }
        None
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
