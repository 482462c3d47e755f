//! Iteration orchestrator.
//!
//! One call runs one iteration of one cycle: resolve prices, evaluate every
//! open position of the cycle, append an iteration record and save the
//! cycle under the store's version check. Positions are never closed here;
//! the sell list goes back to the caller.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::{debug, info};

use super::ledger::PositionLedger;
use super::schedule::total_iterations;
use crate::config::InvestConfig;
use crate::prices::resolver::PriceResolver;
use crate::storage::CycleStore;
use crate::strategy::evaluate_sell_decision;
use crate::types::{
    Cycle, CycleStatus, EngineError, IterationRecord, LastKnownPrice, Position, SellDecision,
};

/// A position the evaluator wants sold, with the price it was judged at.
#[derive(Debug, Clone)]
pub struct SellCandidate {
    pub position: Position,
    pub decision: SellDecision,
    pub price: f64,
}

#[derive(Debug, Clone)]
pub struct IterationOutcome {
    /// The cycle as saved, with its new version.
    pub cycle: Cycle,
    pub record: IterationRecord,
    /// Open positions of the cycle, marked to market, `hold_cycles` bumped.
    pub updated_positions: Vec<Position>,
    pub to_sell: Vec<SellCandidate>,
    pub iterations_complete: bool,
}

pub struct IterationOrchestrator {
    resolver: PriceResolver,
    config: InvestConfig,
}

impl IterationOrchestrator {
    pub fn new(resolver: PriceResolver, config: InvestConfig) -> Self {
        Self { resolver, config }
    }

    pub fn config(&self) -> &InvestConfig {
        &self.config
    }

    pub fn resolver(&self) -> &PriceResolver {
        &self.resolver
    }

    /// Run the next iteration of `cycle_id` at `now`.
    ///
    /// `positions` may contain positions of any cycle; only open positions
    /// of this cycle are evaluated.
    pub async fn run_iteration(
        &self,
        store: &dyn CycleStore,
        positions: &[Position],
        cycle_id: &str,
        now: DateTime<Utc>,
    ) -> Result<IterationOutcome, EngineError> {
        let mut cycle = store
            .load_cycle(cycle_id)
            .await?
            .ok_or_else(|| EngineError::CycleNotFound(cycle_id.to_string()))?;
        if cycle.is_completed() {
            return Err(EngineError::CycleCompleted(cycle_id.to_string()));
        }

        let iteration_index = cycle.iterations.len();
        let total = total_iterations(&cycle);
        let is_last = iteration_index + 1 >= total || now >= cycle.end_time;
        // The closing pass of an overdue cycle is evaluated as its final slot.
        let eval_index = if is_last {
            total.saturating_sub(1)
        } else {
            iteration_index
        };

        let open: Vec<&Position> = positions
            .iter()
            .filter(|p| p.cycle_id == cycle.id && p.is_open())
            .collect();

        let symbols = symbol_map(&cycle, &open);
        let last_known = last_known_prices(&cycle);
        let mut ids: Vec<String> = cycle.snapshot.iter().map(|a| a.id.clone()).collect();
        ids.extend(open.iter().map(|p| p.asset_id.clone()));

        let resolution = self.resolver.resolve(&ids, &symbols, &last_known, now).await;

        let mut decisions = HashMap::new();
        let mut updated_positions = Vec::with_capacity(open.len());
        let mut to_sell = Vec::new();

        for position in open {
            let (mut updated, decision, price) = match resolution.price_of(&position.asset_id) {
                Some(price) => {
                    let decision = evaluate_sell_decision(position, price, &self.config, eval_index, total);
                    (PositionLedger::update_position_pnl(position, price), decision, Some(price))
                }
                None => {
                    let decision =
                        SellDecision::hold("Hold: no price available", position.unrealized_pnl_pct);
                    (position.clone(), decision, None)
                }
            };
            updated.hold_cycles += 1;

            debug!(
                position = %updated.id,
                action = ?decision.action,
                pnl_pct = format!("{:+.2}%", decision.pnl_pct),
                reason = %decision.reason,
                "Position evaluated"
            );

            if let (true, Some(price)) = (decision.is_sell(), price) {
                to_sell.push(SellCandidate {
                    position: updated.clone(),
                    decision: decision.clone(),
                    price,
                });
            }
            decisions.insert(updated.asset_id.clone(), decision);
            updated_positions.push(updated);
        }

        let record = IterationRecord {
            iteration_index,
            timestamp: now,
            is_last,
            prices: resolution.prices,
            decisions,
            failed_ids: resolution.failed_ids,
            fetch_stats: resolution.stats,
        };

        cycle.iterations.push(record.clone());
        cycle.last_iteration_at = Some(now);
        if is_last {
            cycle.status = CycleStatus::Completed;
        }
        cycle.version = store.save_cycle(&cycle).await?;

        info!(
            cycle = %cycle.id,
            iteration = format!("{}/{}", iteration_index + 1, total),
            positions = updated_positions.len(),
            to_sell = to_sell.len(),
            stale = record.fetch_stats.stale_count,
            failed = record.failed_ids.len(),
            last = is_last,
            "Iteration recorded"
        );

        Ok(IterationOutcome {
            cycle,
            record,
            updated_positions,
            to_sell,
            iterations_complete: is_last,
        })
    }
}

fn symbol_map(cycle: &Cycle, open: &[&Position]) -> HashMap<String, String> {
    let mut symbols: HashMap<String, String> = open
        .iter()
        .map(|p| (p.asset_id.clone(), p.symbol.clone()))
        .collect();
    for asset in &cycle.snapshot {
        symbols.insert(asset.id.clone(), asset.symbol.clone());
    }
    symbols
}

/// Snapshot prices at cycle start, overridden by every fresh price recorded since.
pub fn last_known_prices(cycle: &Cycle) -> HashMap<String, LastKnownPrice> {
    let mut last_known: HashMap<String, LastKnownPrice> = cycle
        .snapshot
        .iter()
        .filter(|a| a.price.is_finite() && a.price > 0.0)
        .map(|a| {
            (
                a.id.clone(),
                LastKnownPrice {
                    price: a.price,
                    timestamp: cycle.start_time,
                },
            )
        })
        .collect();

    for record in &cycle.iterations {
        for (id, p) in &record.prices {
            if !p.is_stale {
                last_known.insert(
                    id.clone(),
                    LastKnownPrice {
                        price: p.price,
                        timestamp: record.timestamp,
                    },
                );
            }
        }
    }
    last_known
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
