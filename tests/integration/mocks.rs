//! In-memory collaborators for integration testing.
//!
//! `MemoryStore` implements every storage trait with the same version
//! rules as the JSON store. `MockPriceFeed` serves a settable price book.
//! `FlakyGateway` fills orders at the reference price, counts filled sells
//! and can be told to reject them.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cycle_engine::calibration::{CalibrationEngine, CalibrationState};
use cycle_engine::config::InvestConfig;
use cycle_engine::engine::executor::{
    ExchangeGateway, Executor, OrderFill, OrderRequest, OrderSide, SimulatedGateway,
};
use cycle_engine::engine::{CycleManager, IterationOrchestrator};
use cycle_engine::prices::resolver::PriceResolver;
use cycle_engine::prices::retry::RetryPolicy;
use cycle_engine::prices::{AssetRef, PriceSource, SourceQuote};
use cycle_engine::storage::{check_version, CalibrationStore, CycleStore, PositionStore};
use cycle_engine::types::*;

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryStore {
    cycles: Mutex<HashMap<String, Cycle>>,
    positions: Mutex<Vec<Position>>,
    calibration: Mutex<Option<CalibrationState>>,
    /// Remaining successful position saves; `None` means unlimited.
    position_save_budget: Mutex<Option<usize>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Let the next `n` position saves succeed, then fail every one after.
    pub fn allow_position_saves(&self, n: usize) {
        *self.position_save_budget.lock().unwrap() = Some(n);
    }

    pub fn allow_all_position_saves(&self) {
        *self.position_save_budget.lock().unwrap() = None;
    }

    pub fn position(&self, id: &str) -> Option<Position> {
        self.positions.lock().unwrap().iter().find(|p| p.id == id).cloned()
    }

    pub fn cycle(&self, id: &str) -> Option<Cycle> {
        self.cycles.lock().unwrap().get(id).cloned()
    }
}

#[async_trait]
impl CycleStore for MemoryStore {
    async fn load_cycle(&self, id: &str) -> Result<Option<Cycle>, EngineError> {
        Ok(self.cycles.lock().unwrap().get(id).cloned())
    }

    async fn save_cycle(&self, cycle: &Cycle) -> Result<u64, EngineError> {
        let mut cycles = self.cycles.lock().unwrap();
        let next = check_version(cycle, cycles.get(&cycle.id).map(|c| c.version))?;
        let mut stored = cycle.clone();
        stored.version = next;
        cycles.insert(stored.id.clone(), stored);
        Ok(next)
    }

    async fn list_active_cycles(&self) -> Result<Vec<Cycle>, EngineError> {
        let mut active: Vec<Cycle> = self
            .cycles
            .lock()
            .unwrap()
            .values()
            .filter(|c| !c.is_completed())
            .cloned()
            .collect();
        active.sort_by_key(|c| c.start_time);
        Ok(active)
    }
}

#[async_trait]
impl PositionStore for MemoryStore {
    async fn get_positions(&self) -> Result<Vec<Position>, EngineError> {
        Ok(self.positions.lock().unwrap().clone())
    }

    async fn save_positions(&self, positions: &[Position]) -> Result<(), EngineError> {
        if let Some(budget) = self.position_save_budget.lock().unwrap().as_mut() {
            if *budget == 0 {
                return Err(EngineError::Other(anyhow!("disk full")));
            }
            *budget -= 1;
        }
        *self.positions.lock().unwrap() = positions.to_vec();
        Ok(())
    }
}

#[async_trait]
impl CalibrationStore for MemoryStore {
    async fn load_calibration(&self) -> Result<Option<CalibrationState>, EngineError> {
        Ok(self.calibration.lock().unwrap().clone())
    }

    async fn save_calibration(&self, state: &CalibrationState) -> Result<(), EngineError> {
        *self.calibration.lock().unwrap() = Some(state.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Price feed
// ---------------------------------------------------------------------------

/// Price book keyed by asset id. Clones share the same book.
#[derive(Clone, Default)]
pub struct MockPriceFeed {
    book: Arc<Mutex<HashMap<String, f64>>>,
    /// If set, every fetch fails with this error.
    force_error: Arc<Mutex<Option<String>>>,
}

impl MockPriceFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_price(&self, id: &str, price: f64) {
        self.book.lock().unwrap().insert(id.to_string(), price);
    }

    pub fn set_error(&self, msg: &str) {
        *self.force_error.lock().unwrap() = Some(msg.to_string());
    }

    pub fn clear_error(&self) {
        *self.force_error.lock().unwrap() = None;
    }
}

#[async_trait]
impl PriceSource for MockPriceFeed {
    fn name(&self) -> &str {
        "mock"
    }

    async fn fetch_quotes(&self, assets: &[AssetRef]) -> Result<HashMap<String, SourceQuote>> {
        if let Some(msg) = self.force_error.lock().unwrap().clone() {
            return Err(anyhow!(msg));
        }
        let book = self.book.lock().unwrap();
        Ok(assets
            .iter()
            .filter_map(|a| {
                book.get(&a.id).map(|&price| {
                    (
                        a.id.clone(),
                        SourceQuote {
                            price,
                            change_24h: None,
                        },
                    )
                })
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Exchange
// ---------------------------------------------------------------------------

/// Simulated fills, with a switch that makes every sell fail.
pub struct FlakyGateway {
    inner: SimulatedGateway,
    reject_sells: AtomicBool,
    filled_sells: AtomicUsize,
}

impl FlakyGateway {
    pub fn new(fee_pct: f64) -> Arc<Self> {
        Arc::new(Self {
            inner: SimulatedGateway::new(fee_pct),
            reject_sells: AtomicBool::new(false),
            filled_sells: AtomicUsize::new(0),
        })
    }

    pub fn filled_sells(&self) -> usize {
        self.filled_sells.load(Ordering::SeqCst)
    }

    pub fn reject_sells(&self, reject: bool) {
        self.reject_sells.store(reject, Ordering::SeqCst);
    }
}

#[async_trait]
impl ExchangeGateway for FlakyGateway {
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderFill> {
        if request.side == OrderSide::Sell && self.reject_sells.load(Ordering::SeqCst) {
            return Ok(OrderFill::failed("exchange unavailable"));
        }
        let fill = self.inner.place_order(request).await?;
        if request.side == OrderSide::Sell && fill.success {
            self.filled_sells.fetch_add(1, Ordering::SeqCst);
        }
        Ok(fill)
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub fn asset(id: &str, symbol: &str, price: f64, predicted: f64, class: Classification, bp: f64) -> AssetSnapshot {
    AssetSnapshot {
        id: id.to_string(),
        symbol: symbol.to_string(),
        price,
        predicted_change: predicted,
        classification: class,
        boost_power: bp,
    }
}

/// Three investable assets plus two that selection must filter out.
pub fn default_snapshot() -> Vec<AssetSnapshot> {
    vec![
        asset("alpha", "ALP", 100.0, 8.0, Classification::Invertible, 0.8),
        asset("beta", "BET", 50.0, 6.0, Classification::Invertible, 0.6),
        asset("gamma", "GAM", 10.0, 4.0, Classification::Invertible, 0.5),
        asset("delta", "DEL", 2.0, 12.0, Classification::Ruidoso, 0.9),
        asset("omega", "OMG", 5.0, 9.0, Classification::Invertible, 0.2),
    ]
}

pub fn seed_feed(feed: &MockPriceFeed, snapshot: &[AssetSnapshot]) {
    for a in snapshot {
        feed.set_price(&a.id, a.price);
    }
}

pub fn start_time() -> DateTime<Utc> {
    "2026-03-01T00:00:00Z".parse().unwrap()
}

pub async fn manager(
    store: Arc<MemoryStore>,
    feed: &MockPriceFeed,
    config: InvestConfig,
    gateway: Option<Arc<dyn ExchangeGateway>>,
) -> CycleManager<MemoryStore> {
    let resolver = PriceResolver::new(vec![Box::new(feed.clone())], RetryPolicy::once(Duration::from_secs(1)));
    let executor = Executor::new(&config, gateway).unwrap();
    CycleManager::new(
        store,
        IterationOrchestrator::new(resolver, config),
        executor,
        CalibrationEngine::default(),
    )
    .await
    .unwrap()
}
