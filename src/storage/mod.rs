//! Persistence layer.
//!
//! The engine talks to storage through three small traits. `JsonStore`
//! implements all of them on top of a directory of JSON files; tests use
//! an in-memory implementation.
//!
//! Cycles use optimistic versioning: `save_cycle` succeeds only when the
//! stored version matches the caller's copy, then bumps it. Whoever loses
//! a race gets `EngineError::VersionConflict` and must reload.

pub mod json;

use async_trait::async_trait;

use crate::calibration::CalibrationState;
use crate::types::{Cycle, EngineError, Position};

pub use json::JsonStore;

#[async_trait]
pub trait CycleStore: Send + Sync {
    async fn load_cycle(&self, id: &str) -> Result<Option<Cycle>, EngineError>;

    /// Persist `cycle` if its `version` matches the stored one (or the
    /// cycle is new and at version 0). Returns the new version.
    async fn save_cycle(&self, cycle: &Cycle) -> Result<u64, EngineError>;

    /// Cycles not yet completed, oldest first.
    async fn list_active_cycles(&self) -> Result<Vec<Cycle>, EngineError>;
}

#[async_trait]
pub trait PositionStore: Send + Sync {
    async fn get_positions(&self) -> Result<Vec<Position>, EngineError>;

    /// Replace the stored position list.
    async fn save_positions(&self, positions: &[Position]) -> Result<(), EngineError>;
}

#[async_trait]
pub trait CalibrationStore: Send + Sync {
    async fn load_calibration(&self) -> Result<Option<CalibrationState>, EngineError>;

    async fn save_calibration(&self, state: &CalibrationState) -> Result<(), EngineError>;
}

/// Everything the cycle manager needs from storage.
pub trait Store: CycleStore + PositionStore + CalibrationStore {}

impl<T: CycleStore + PositionStore + CalibrationStore> Store for T {}

/// Replace positions in `all` by id with those in `updated`; append new ones.
pub fn merge_positions(all: &mut Vec<Position>, updated: &[Position]) {
    for p in updated {
        match all.iter_mut().find(|existing| existing.id == p.id) {
            Some(existing) => *existing = p.clone(),
            None => all.push(p.clone()),
        }
    }
}

/// Version check shared by store implementations.
pub fn check_version(cycle: &Cycle, stored: Option<u64>) -> Result<u64, EngineError> {
    let found = stored.unwrap_or(0);
    if cycle.version != found {
        return Err(EngineError::VersionConflict {
            cycle_id: cycle.id.clone(),
            expected: cycle.version,
            found,
        });
    }
    Ok(found + 1)
}
