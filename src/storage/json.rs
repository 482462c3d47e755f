//! JSON-file store.
//!
//! Layout under the state directory:
//!
//! ```text
//! cycles/{id}.json
//! positions.json
//! calibration.json
//! ```
//!
//! Writes go to a temp file that is then renamed over the target, and all
//! writers are serialised behind one lock so the version check and the
//! write happen together.

use anyhow::Context;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{check_version, CalibrationStore, CycleStore, PositionStore};
use crate::calibration::CalibrationState;
use crate::types::{Cycle, EngineError, Position};

const CYCLES_DIR: &str = "cycles";
const POSITIONS_FILE: &str = "positions.json";
const CALIBRATION_FILE: &str = "calibration.json";

pub struct JsonStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonStore {
    /// Open (and create if needed) a store rooted at `dir`.
    pub async fn open(dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let root = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(root.join(CYCLES_DIR))
            .await
            .with_context(|| format!("Failed to create state directory {}", root.display()))?;
        info!(path = %root.display(), "JSON store opened");
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn cycle_path(&self, id: &str) -> PathBuf {
        self.root.join(CYCLES_DIR).join(format!("{id}.json"))
    }
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<Option<T>> {
    let json = match tokio::fs::read_to_string(path).await {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
    };
    let value = serde_json::from_str(&json).with_context(|| format!("Failed to parse {}", path.display()))?;
    Ok(Some(value))
}

async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialise state")?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, &json)
        .await
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("Failed to move {} into place", tmp.display()))?;
    Ok(())
}

#[async_trait]
impl CycleStore for JsonStore {
    async fn load_cycle(&self, id: &str) -> Result<Option<Cycle>, EngineError> {
        Ok(read_json(&self.cycle_path(id)).await?)
    }

    async fn save_cycle(&self, cycle: &Cycle) -> Result<u64, EngineError> {
        let _guard = self.write_lock.lock().await;
        let path = self.cycle_path(&cycle.id);

        let stored: Option<Cycle> = read_json(&path).await?;
        let next = check_version(cycle, stored.map(|c| c.version))?;

        let mut to_write = cycle.clone();
        to_write.version = next;
        write_json(&path, &to_write).await?;

        debug!(cycle = %cycle.id, version = next, iterations = cycle.iterations.len(), "Cycle saved");
        Ok(next)
    }

    async fn list_active_cycles(&self) -> Result<Vec<Cycle>, EngineError> {
        let dir = self.root.join(CYCLES_DIR);
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .with_context(|| format!("Failed to list {}", dir.display()))?;

        let mut cycles = Vec::new();
        while let Some(entry) = entries.next_entry().await.context("Failed to read cycle directory entry")? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(cycle) = read_json::<Cycle>(&path).await? {
                if !cycle.is_completed() {
                    cycles.push(cycle);
                }
            }
        }
        cycles.sort_by_key(|c| c.start_time);
        Ok(cycles)
    }
}

#[async_trait]
impl PositionStore for JsonStore {
    async fn get_positions(&self) -> Result<Vec<Position>, EngineError> {
        Ok(read_json(&self.root.join(POSITIONS_FILE)).await?.unwrap_or_default())
    }

    async fn save_positions(&self, positions: &[Position]) -> Result<(), EngineError> {
        let _guard = self.write_lock.lock().await;
        write_json(&self.root.join(POSITIONS_FILE), positions).await?;
        debug!(count = positions.len(), "Positions saved");
        Ok(())
    }
}

#[async_trait]
impl CalibrationStore for JsonStore {
    async fn load_calibration(&self) -> Result<Option<CalibrationState>, EngineError> {
        Ok(read_json(&self.root.join(CALIBRATION_FILE)).await?)
    }

    async fn save_calibration(&self, state: &CalibrationState) -> Result<(), EngineError> {
        let _guard = self.write_lock.lock().await;
        write_json(&self.root.join(CALIBRATION_FILE), state).await?;
        debug!(samples = state.total_samples(), "Calibration saved");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
