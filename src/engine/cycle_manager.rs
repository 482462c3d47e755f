//! Cycle manager: drives the whole position lifecycle.
//!
//! open cycle → select targets → buy → iterate → sell → close → calibrate.
//!
//! Positions are read-modify-written as one list, so every path that
//! touches them holds `positions_lock`. Each close is persisted before the
//! next order goes out. A position that filled on the exchange but could
//! not be saved is kept under the same lock and written back on the next
//! pass instead of being traded again. Calibration updates are serialised
//! by their own lock and persisted after each close.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::accountant::{Accountant, CapitalReport};
use super::executor::Executor;
use super::ledger::{InvestmentTarget, PositionLedger, SelectionResult};
use super::orchestrator::{IterationOrchestrator, IterationOutcome};
use super::schedule::has_iteration_due;
use crate::calibration::{CalibrationEngine, CalibrationState, CorrectionFactors};
use crate::config::InvestConfig;
use crate::storage::{merge_positions, Store};
use crate::types::{AssetSnapshot, Classification, CloseReason, Cycle, EngineError, Position};

/// Result of opening a cycle.
#[derive(Debug, Clone)]
pub struct OpenedCycle {
    pub cycle: Cycle,
    pub selection: SelectionResult,
    pub positions: Vec<Position>,
    /// Symbols whose entry order failed.
    pub failed_orders: Vec<String>,
}

/// Result of one managed iteration.
#[derive(Debug, Clone)]
pub struct IterationReport {
    pub outcome: IterationOutcome,
    pub closed: Vec<Position>,
    /// Position ids whose sell order failed; they stay open.
    pub failed_sells: Vec<String>,
    pub capital: CapitalReport,
}

#[derive(Debug, Clone, Default)]
pub struct DueRunSummary {
    pub ran: Vec<String>,
    pub failed: Vec<(String, String)>,
}

pub struct CycleManager<S: Store> {
    store: Arc<S>,
    orchestrator: IterationOrchestrator,
    executor: Executor,
    calibration: CalibrationEngine,
    calibration_state: Mutex<CalibrationState>,
    /// Guards the position list; holds filled positions not yet persisted.
    positions_lock: Mutex<Vec<Position>>,
}

impl<S: Store> CycleManager<S> {
    /// Build a manager, restoring calibration from the store. Without a
    /// stored state, calibration is rebuilt from closed positions.
    pub async fn new(
        store: Arc<S>,
        orchestrator: IterationOrchestrator,
        executor: Executor,
        calibration: CalibrationEngine,
    ) -> Result<Self, EngineError> {
        let state = match store.load_calibration().await? {
            Some(state) => state,
            None => {
                let positions = store.get_positions().await?;
                let state = calibration.rebuild(&positions);
                if state.total_samples() > 0 {
                    store.save_calibration(&state).await?;
                }
                state
            }
        };
        info!(samples = state.total_samples(), "Calibration state ready");

        Ok(Self {
            store,
            orchestrator,
            executor,
            calibration,
            calibration_state: Mutex::new(state),
            positions_lock: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &InvestConfig {
        self.orchestrator.config()
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    // -- Opening ----------------------------------------------------------

    /// Create a cycle over `snapshot`, select targets and buy them.
    ///
    /// The cycle is created even when selection decides not to invest, so
    /// its prices are still tracked.
    pub async fn open_cycle(
        &self,
        snapshot: Vec<AssetSnapshot>,
        duration_ms: i64,
        now: DateTime<Utc>,
    ) -> Result<OpenedCycle, EngineError> {
        if duration_ms <= 0 {
            return Err(EngineError::Config(format!("cycle duration must be positive, got {duration_ms}ms")));
        }
        let config = self.config().clone();
        let mut unsaved = self.positions_lock.lock().await;
        let mut all = self.load_positions(&mut unsaved).await?;

        let selection = PositionLedger::select_targets(&snapshot, &config, &all);
        let mut cycle = Cycle::new(uuid::Uuid::new_v4().to_string(), now, duration_ms, snapshot);
        cycle.version = self.store.save_cycle(&cycle).await?;

        info!(
            cycle = %cycle.id,
            assets = cycle.snapshot.len(),
            duration_h = format!("{:.1}", duration_ms as f64 / 3_600_000.0),
            invest = selection.should_invest,
            reason = %selection.reason,
            "Cycle opened"
        );

        let mut opened = Vec::new();
        let mut failed_orders = Vec::new();
        for target in &selection.selected {
            match self.enter(target, &cycle.id, &config, now).await {
                Ok(position) => opened.push(position),
                Err(e) => {
                    warn!(cycle = %cycle.id, symbol = %target.asset.symbol, error = %e, "Entry skipped");
                    failed_orders.push(target.asset.symbol.clone());
                }
            }
        }

        if !opened.is_empty() {
            merge_positions(&mut all, &opened);
            if let Err(e) = self.store.save_positions(&all).await {
                error!(cycle = %cycle.id, positions = opened.len(), error = %e, "Entries filled but not persisted");
                unsaved.extend(opened);
                return Err(e);
            }
        }

        Ok(OpenedCycle {
            cycle,
            selection,
            positions: opened,
            failed_orders,
        })
    }

    async fn enter(
        &self,
        target: &InvestmentTarget,
        cycle_id: &str,
        config: &InvestConfig,
        now: DateTime<Utc>,
    ) -> Result<Position, EngineError> {
        let fill = self
            .executor
            .buy(&target.asset.symbol, target.capital_usd, target.asset.price)
            .await?;

        let mut filled = target.clone();
        if fill.avg_price > 0.0 {
            filled.asset.price = fill.avg_price;
        }
        let position = PositionLedger::create_position(&filled, cycle_id, config, now)?;
        let position = PositionLedger::record_entry_fill(&position, fill.fee_usd, fill.order_id);
        info!(
            position = %position.id,
            entry = position.entry_price,
            units = position.units,
            capital = format!("${:.2}", position.capital_usd),
            "Position opened"
        );
        Ok(position)
    }

    // -- Iterating --------------------------------------------------------

    /// Run the next iteration of `cycle_id` and act on its sell list.
    pub async fn run_iteration(&self, cycle_id: &str, now: DateTime<Utc>) -> Result<IterationReport, EngineError> {
        let config = self.config().clone();
        let mut unsaved = self.positions_lock.lock().await;
        let mut all = self.load_positions(&mut unsaved).await?;

        let outcome = self
            .orchestrator
            .run_iteration(self.store.as_ref(), &all, cycle_id, now)
            .await?;
        merge_positions(&mut all, &outcome.updated_positions);
        self.store.save_positions(&all).await?;

        let mut closed = Vec::new();
        let mut failed_sells = Vec::new();
        for candidate in &outcome.to_sell {
            let reason = candidate.decision.trigger.unwrap_or(CloseReason::Manual);
            match self.exit(&candidate.position, candidate.price, reason, &config, now).await {
                Ok(position) => {
                    self.record_close(&mut all, &mut unsaved, &position).await?;
                    closed.push(position);
                }
                Err(e) => {
                    warn!(position = %candidate.position.id, error = %e, "Sell failed, position stays open");
                    failed_sells.push(candidate.position.id.clone());
                }
            }
        }

        let capital = Accountant::log_report(&all, &config, now);
        Ok(IterationReport {
            outcome,
            closed,
            failed_sells,
            capital,
        })
    }

    async fn exit(
        &self,
        position: &Position,
        price: f64,
        reason: CloseReason,
        config: &InvestConfig,
        now: DateTime<Utc>,
    ) -> Result<Position, EngineError> {
        let fill = self.executor.sell(&position.symbol, position.units, price).await?;
        let exit_price = if fill.avg_price > 0.0 { fill.avg_price } else { price };
        PositionLedger::close_position(position, exit_price, reason, config, now)
    }

    /// Watchdog: close open positions that breach stop-loss, take-profit or
    /// max-hold at their last marked price, and positions whose cycle has
    /// already completed.
    pub async fn sweep_open_positions(&self, now: DateTime<Utc>) -> Result<Vec<Position>, EngineError> {
        let config = self.config().clone();
        let mut unsaved = self.positions_lock.lock().await;
        let mut all = self.load_positions(&mut unsaved).await?;

        let mut cycle_done: HashMap<String, bool> = HashMap::new();
        let mut to_close = Vec::new();
        for position in all.iter().filter(|p| p.is_open()) {
            let done = match cycle_done.get(&position.cycle_id) {
                Some(done) => *done,
                None => {
                    let done = self
                        .store
                        .load_cycle(&position.cycle_id)
                        .await?
                        .map_or(true, |c| c.is_completed());
                    cycle_done.insert(position.cycle_id.clone(), done);
                    done
                }
            };

            let price = position.current_price;
            let reason = match PositionLedger::evaluate_close_conditions(position, price, &config) {
                Some(reason) => reason,
                None if done => CloseReason::CycleEnd,
                None => continue,
            };

            to_close.push((position.clone(), reason));
        }

        let mut closed = Vec::new();
        for (position, reason) in to_close {
            match self.exit(&position, position.current_price, reason, &config, now).await {
                Ok(p) => {
                    self.record_close(&mut all, &mut unsaved, &p).await?;
                    closed.push(p);
                }
                Err(e) => warn!(position = %position.id, error = %e, "Watchdog close failed"),
            }
        }

        if !closed.is_empty() {
            info!(closed = closed.len(), "Watchdog closed positions");
        }
        Ok(closed)
    }

    /// Run one iteration for every active cycle that has one due. A failing
    /// cycle is logged and does not stop the others.
    pub async fn run_due_cycles(&self, now: DateTime<Utc>) -> Result<DueRunSummary, EngineError> {
        let cycles = self.store.list_active_cycles().await?;
        let mut summary = DueRunSummary::default();

        for cycle in cycles.iter().filter(|c| has_iteration_due(c, now)) {
            match self.run_iteration(&cycle.id, now).await {
                Ok(report) => {
                    debug!(cycle = %cycle.id, closed = report.closed.len(), "Due iteration done");
                    summary.ran.push(cycle.id.clone());
                }
                Err(e) => {
                    error!(cycle = %cycle.id, error = %e, "Iteration failed");
                    summary.failed.push((cycle.id.clone(), e.to_string()));
                }
            }
        }

        if !summary.ran.is_empty() || !summary.failed.is_empty() {
            info!(
                active = cycles.len(),
                ran = summary.ran.len(),
                failed = summary.failed.len(),
                "Due cycles processed"
            );
        }
        Ok(summary)
    }

    // -- Persistence ------------------------------------------------------

    /// Stored positions with any unsaved fills from an earlier pass written back.
    async fn load_positions(&self, unsaved: &mut Vec<Position>) -> Result<Vec<Position>, EngineError> {
        let mut all = self.store.get_positions().await?;
        if unsaved.is_empty() {
            return Ok(all);
        }

        merge_positions(&mut all, unsaved);
        self.store.save_positions(&all).await?;
        let recovered = std::mem::take(unsaved);
        warn!(positions = recovered.len(), "Recorded fills from an earlier failed save");

        let closed: Vec<Position> = recovered.into_iter().filter(|p| p.is_closed()).collect();
        self.observe_closed(&closed).await?;
        Ok(all)
    }

    /// Persist one close before anything else is traded. On failure the
    /// close is kept in `unsaved` so the position is never sold twice.
    async fn record_close(
        &self,
        all: &mut Vec<Position>,
        unsaved: &mut Vec<Position>,
        position: &Position,
    ) -> Result<(), EngineError> {
        merge_positions(all, std::slice::from_ref(position));
        if let Err(e) = self.store.save_positions(all).await {
            error!(position = %position.id, error = %e, "Sold but close not persisted");
            unsaved.push(position.clone());
            return Err(e);
        }
        self.observe_closed(std::slice::from_ref(position)).await
    }

    // -- Calibration ------------------------------------------------------

    async fn observe_closed(&self, closed: &[Position]) -> Result<(), EngineError> {
        if closed.is_empty() {
            return Ok(());
        }
        let mut state = self.calibration_state.lock().await;
        let used = closed.iter().filter(|p| self.calibration.observe(&mut state, p)).count();
        if used > 0 {
            self.store.save_calibration(&state).await?;
            info!(observed = used, samples = state.total_samples(), "Calibration updated");
        }
        Ok(())
    }

    pub async fn correction_factors(&self, category: Classification, boost_power: f64) -> Option<CorrectionFactors> {
        let state = self.calibration_state.lock().await;
        self.calibration.correction_factors(&state, category, boost_power)
    }

    pub async fn calibration_snapshot(&self) -> CalibrationState {
        self.calibration_state.lock().await.clone()
    }

    /// Replace calibration with a replay of every closed position.
    pub async fn rebuild_calibration(&self) -> Result<CalibrationState, EngineError> {
        let positions = {
            let mut unsaved = self.positions_lock.lock().await;
            self.load_positions(&mut unsaved).await?
        };
        let rebuilt = self.calibration.rebuild(&positions);
        let mut state = self.calibration_state.lock().await;
        *state = rebuilt.clone();
        self.store.save_calibration(&state).await?;
        info!(samples = rebuilt.total_samples(), "Calibration rebuilt");
        Ok(rebuilt)
    }

    pub async fn capital_report(&self, now: DateTime<Utc>) -> Result<CapitalReport, EngineError> {
        let positions = self.store.get_positions().await?;
        Ok(Accountant::report(&positions, self.config(), now))
    }
}
