//! Accountant: capital, P&L and fee totals across all positions.
//!
//! Position math runs in f64; the report converts once and sums in
//! `Decimal`, rounded to cents, so totals add up exactly.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::*;
use serde::Serialize;
use std::fmt;
use tracing::info;

use crate::config::InvestConfig;
use crate::types::Position;

// ---------------------------------------------------------------------------
// Capital report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapitalReport {
    pub capital_total: Decimal,
    /// Capital tied up in open positions.
    pub committed: Decimal,
    /// Capital not committed, after realized P&L and open-position fees.
    pub available: Decimal,
    /// Net of all fees.
    pub realized_pnl: Decimal,
    /// Net of entry fees.
    pub unrealized_pnl: Decimal,
    pub fees_paid: Decimal,
    /// `capital_total + realized + unrealized`.
    pub equity: Decimal,
    pub open_positions: usize,
    pub closed_positions: usize,
    pub wins: usize,
    pub losses: usize,
    pub generated_at: DateTime<Utc>,
}

impl CapitalReport {
    /// Share of closed positions with positive realized P&L, 0..1.
    pub fn win_rate(&self) -> f64 {
        if self.closed_positions == 0 {
            0.0
        } else {
            self.wins as f64 / self.closed_positions as f64
        }
    }
}

impl fmt::Display for CapitalReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "equity=${} available=${} committed=${} realized=${} unrealized=${} fees=${} open={} closed={} ({}W/{}L)",
            self.equity,
            self.available,
            self.committed,
            self.realized_pnl,
            self.unrealized_pnl,
            self.fees_paid,
            self.open_positions,
            self.closed_positions,
            self.wins,
            self.losses,
        )
    }
}

fn usd(x: f64) -> Decimal {
    Decimal::from_f64(x).unwrap_or_default().round_dp(2)
}

// ---------------------------------------------------------------------------
// Accountant
// ---------------------------------------------------------------------------

pub struct Accountant;

impl Accountant {
    pub fn report(positions: &[Position], config: &InvestConfig, now: DateTime<Utc>) -> CapitalReport {
        let capital_total = usd(config.capital_total);
        let mut committed = Decimal::ZERO;
        let mut open_fees = Decimal::ZERO;
        let mut realized_pnl = Decimal::ZERO;
        let mut unrealized_pnl = Decimal::ZERO;
        let mut fees_paid = Decimal::ZERO;
        let (mut open, mut closed, mut wins, mut losses) = (0, 0, 0, 0);

        for p in positions {
            let fees = usd(p.total_fees_usd);
            fees_paid += fees;
            if p.is_open() {
                open += 1;
                committed += usd(p.capital_usd);
                open_fees += fees;
                unrealized_pnl += usd(p.unrealized_pnl);
            } else {
                closed += 1;
                let pnl = usd(p.realized_pnl.unwrap_or_default());
                realized_pnl += pnl;
                if pnl > Decimal::ZERO {
                    wins += 1;
                } else {
                    losses += 1;
                }
            }
        }

        CapitalReport {
            capital_total,
            committed,
            available: capital_total + realized_pnl - committed - open_fees,
            realized_pnl,
            unrealized_pnl,
            fees_paid,
            equity: capital_total + realized_pnl + unrealized_pnl,
            open_positions: open,
            closed_positions: closed,
            wins,
            losses,
            generated_at: now,
        }
    }

    /// Build and log a report.
    pub fn log_report(positions: &[Position], config: &InvestConfig, now: DateTime<Utc>) -> CapitalReport {
        let report = Self::report(positions, config, now);
        info!(
            equity = format!("${}", report.equity),
            available = format!("${}", report.available),
            committed = format!("${}", report.committed),
            realized = format!("${}", report.realized_pnl),
            unrealized = format!("${}", report.unrealized_pnl),
            fees = format!("${}", report.fees_paid),
            open = report.open_positions,
            closed = report.closed_positions,
            win_rate = format!("{:.0}%", report.win_rate() * 100.0),
            "Capital report"
        );
        report
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
