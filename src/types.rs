//! Shared types for the cycle engine.
//!
//! These types form the data model used across all modules: the
//! immutable asset snapshot taken when a cycle opens, the mutable
//! position, the cycle aggregate with its append-only iteration log,
//! and the domain error enum.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Upstream classification of an asset. Normalised the moment data enters
/// the engine; nothing downstream inspects raw shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Classification {
    Invertible,
    Apalancado,
    Ruidoso,
}

impl Classification {
    pub const ALL: &'static [Classification] = &[
        Classification::Invertible,
        Classification::Apalancado,
        Classification::Ruidoso,
    ];

    /// Upper-case wire tag.
    pub fn as_tag(&self) -> &'static str {
        match self {
            Classification::Invertible => "INVERTIBLE",
            Classification::Apalancado => "APALANCADO",
            Classification::Ruidoso => "RUIDOSO",
        }
    }

    /// Categories the calibration engine tracks.
    pub fn is_calibrated(&self) -> bool {
        matches!(self, Classification::Invertible | Classification::Apalancado)
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_tag())
    }
}

impl std::str::FromStr for Classification {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "INVERTIBLE" => Ok(Classification::Invertible),
            "APALANCADO" => Ok(Classification::Apalancado),
            "RUIDOSO" => Ok(Classification::Ruidoso),
            _ => Err(anyhow::anyhow!("Unknown classification: {s}")),
        }
    }
}

impl Serialize for Classification {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_tag())
    }
}

/// Upstream sends either a bare tag or an object carrying the tag under
/// `category`, `classification` or `type`, checked in that order.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawClassification {
    Tag(String),
    Object {
        category: Option<String>,
        classification: Option<String>,
        #[serde(rename = "type")]
        kind: Option<String>,
    },
}

impl<'de> Deserialize<'de> for Classification {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tag = match RawClassification::deserialize(deserializer)? {
            RawClassification::Tag(s) => s,
            RawClassification::Object {
                category,
                classification,
                kind,
            } => category
                .or(classification)
                .or(kind)
                .ok_or_else(|| serde::de::Error::custom("classification object carries no tag"))?,
        };
        tag.parse().map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Asset snapshot
// ---------------------------------------------------------------------------

/// Per-cycle record of a candidate asset, frozen when the cycle opens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetSnapshot {
    pub id: String,
    pub symbol: String,
    /// Price at cycle start.
    pub price: f64,
    /// Predicted change over the cycle, in percent.
    pub predicted_change: f64,
    pub classification: Classification,
    /// Upstream confidence score, 0..1.
    pub boost_power: f64,
}

impl fmt::Display for AssetSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}) ${:.6} pred={:+.2}% bp={:.2} [{}]",
            self.symbol, self.id, self.price, self.predicted_change, self.boost_power, self.classification,
        )
    }
}

// ---------------------------------------------------------------------------
// Position
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Open,
    Closed,
}

/// Why a position was (or should be) closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    StopLoss,
    TakeProfit,
    TargetReached,
    CycleEnd,
    EarlyTakeProfit,
    MaxHold,
    Manual,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CloseReason::StopLoss => "stop_loss",
            CloseReason::TakeProfit => "take_profit",
            CloseReason::TargetReached => "target_reached",
            CloseReason::CycleEnd => "cycle_end",
            CloseReason::EarlyTakeProfit => "early_take_profit",
            CloseReason::MaxHold => "max_hold",
            CloseReason::Manual => "manual",
        };
        f.write_str(s)
    }
}

/// One open or closed bet on an asset.
///
/// `units` is fixed at creation. Only `PositionLedger::close_position`
/// writes `realized_pnl`, `closed_at` and `close_reason`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub id: String,
    pub cycle_id: String,
    pub asset_id: String,
    pub symbol: String,
    pub classification: Classification,
    pub status: PositionStatus,
    pub entry_price: f64,
    pub current_price: f64,
    pub units: f64,
    #[serde(rename = "capitalUSD")]
    pub capital_usd: f64,
    pub take_profit_price: f64,
    pub stop_loss_price: f64,
    pub predicted_change: f64,
    pub boost_power: f64,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    /// Iterations survived while open.
    pub hold_cycles: u32,
    pub max_hold_cycles: u32,
    #[serde(rename = "unrealizedPnL")]
    pub unrealized_pnl: f64,
    #[serde(rename = "unrealizedPnLPct")]
    pub unrealized_pnl_pct: f64,
    #[serde(rename = "realizedPnL")]
    pub realized_pnl: Option<f64>,
    #[serde(rename = "realizedPnLPct")]
    pub realized_pnl_pct: Option<f64>,
    #[serde(rename = "entryFeeUSD")]
    pub entry_fee_usd: f64,
    #[serde(rename = "exitFeeUSD")]
    pub exit_fee_usd: f64,
    #[serde(rename = "totalFeesUSD")]
    pub total_fees_usd: f64,
    pub close_reason: Option<CloseReason>,
    /// Exchange order id of the entry fill, if any.
    #[serde(default)]
    pub entry_order_id: Option<String>,
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            PositionStatus::Open => write!(
                f,
                "[open] {} entry={:.6} now={:.6} units={:.6} pnl=${:.2} ({:+.2}%)",
                self.symbol,
                self.entry_price,
                self.current_price,
                self.units,
                self.unrealized_pnl,
                self.unrealized_pnl_pct,
            ),
            PositionStatus::Closed => write!(
                f,
                "[closed:{}] {} entry={:.6} exit={:.6} pnl=${:.2} ({:+.2}%)",
                self.close_reason.map(|r| r.to_string()).unwrap_or_default(),
                self.symbol,
                self.entry_price,
                self.current_price,
                self.realized_pnl.unwrap_or_default(),
                self.realized_pnl_pct.unwrap_or_default(),
            ),
        }
    }
}

impl Position {
    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    pub fn is_closed(&self) -> bool {
        self.status == PositionStatus::Closed
    }

    /// Price change since entry, in percent.
    pub fn price_change_pct(&self, price: f64) -> f64 {
        if self.entry_price > 0.0 {
            (price - self.entry_price) / self.entry_price * 100.0
        } else {
            0.0
        }
    }
}

// ---------------------------------------------------------------------------
// Sell decisions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SellAction {
    Hold,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Low,
    Medium,
    High,
}

/// Outcome of evaluating one open position against a price.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SellDecision {
    pub action: SellAction,
    pub reason: String,
    pub urgency: Urgency,
    pub pnl_pct: f64,
    /// Set for sells; the close reason the ledger should record.
    #[serde(default)]
    pub trigger: Option<CloseReason>,
}

impl SellDecision {
    pub fn hold(reason: impl Into<String>, pnl_pct: f64) -> Self {
        Self {
            action: SellAction::Hold,
            reason: reason.into(),
            urgency: Urgency::Low,
            pnl_pct,
            trigger: None,
        }
    }

    pub fn sell(trigger: CloseReason, reason: impl Into<String>, urgency: Urgency, pnl_pct: f64) -> Self {
        Self {
            action: SellAction::Sell,
            reason: reason.into(),
            urgency,
            pnl_pct,
            trigger: Some(trigger),
        }
    }

    pub fn is_sell(&self) -> bool {
        self.action == SellAction::Sell
    }
}

// ---------------------------------------------------------------------------
// Prices
// ---------------------------------------------------------------------------

/// A price as recorded in an iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedPrice {
    pub price: f64,
    #[serde(rename = "change24h")]
    pub change_24h: Option<f64>,
    pub source: String,
    pub is_stale: bool,
    /// Age of a stale price in milliseconds.
    #[serde(default)]
    pub stale_ms: Option<i64>,
}

/// Aggregate counters for one price resolution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchStats {
    /// Sources that resolved at least one id, in cascade order.
    pub sources_used: Vec<String>,
    /// Attempts beyond the first, summed over every source step.
    pub retries: u32,
    pub resolved_count: usize,
    pub stale_count: usize,
    pub failed_count: usize,
}

/// Last successfully resolved price for an asset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LastKnownPrice {
    pub price: f64,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Cycle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleStatus {
    Pending,
    Completed,
}

/// Immutable record of one iteration pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IterationRecord {
    /// Equal to the number of iterations recorded before this one.
    pub iteration_index: usize,
    pub timestamp: DateTime<Utc>,
    pub is_last: bool,
    pub prices: HashMap<String, ResolvedPrice>,
    pub decisions: HashMap<String, SellDecision>,
    pub failed_ids: Vec<String>,
    pub fetch_stats: FetchStats,
}

/// Bounded investment window: a frozen snapshot plus an append-only
/// iteration log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cycle {
    pub id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_ms: i64,
    pub snapshot: Vec<AssetSnapshot>,
    pub iterations: Vec<IterationRecord>,
    pub status: CycleStatus,
    pub last_iteration_at: Option<DateTime<Utc>>,
    /// Optimistic-concurrency token, bumped by the store on every save.
    #[serde(default)]
    pub version: u64,
}

impl fmt::Display for Cycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Cycle {} [{:?}] {} → {} assets={} iterations={}",
            self.id,
            self.status,
            self.start_time.format("%Y-%m-%d %H:%M"),
            self.end_time.format("%Y-%m-%d %H:%M"),
            self.snapshot.len(),
            self.iterations.len(),
        )
    }
}

impl Cycle {
    /// Create a pending cycle starting at `start_time`.
    pub fn new(id: String, start_time: DateTime<Utc>, duration_ms: i64, snapshot: Vec<AssetSnapshot>) -> Self {
        Self {
            id,
            start_time,
            end_time: start_time + chrono::Duration::milliseconds(duration_ms),
            duration_ms,
            snapshot,
            iterations: Vec::new(),
            status: CycleStatus::Pending,
            last_iteration_at: None,
            version: 0,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == CycleStatus::Completed
    }

    pub fn asset(&self, id: &str) -> Option<&AssetSnapshot> {
        self.snapshot.iter().find(|a| a.id == id)
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Domain-specific errors raised by the engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Cycle not found: {0}")]
    CycleNotFound(String),

    #[error("Cycle already completed: {0}")]
    CycleCompleted(String),

    #[error("Position already closed: {0}")]
    PositionClosed(String),

    #[error("Invalid position: {0}")]
    InvalidPosition(String),

    #[error("Concurrent modification of cycle {cycle_id}: expected version {expected}, found {found}")]
    VersionConflict { cycle_id: String, expected: u64, found: u64 },

    #[error("Order failed ({symbol}): {message}")]
    OrderFailed { symbol: String, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
