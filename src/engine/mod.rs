//! Core engine: ledger, schedule, iteration loop and the manager that ties
//! them to the store and the exchange.

pub mod accountant;
pub mod cycle_manager;
pub mod executor;
pub mod ledger;
pub mod orchestrator;
pub mod schedule;
pub mod scheduler;

pub use cycle_manager::CycleManager;
pub use ledger::PositionLedger;
pub use orchestrator::IterationOrchestrator;
