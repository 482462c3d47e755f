//! Online calibration of predicted changes.
//!
//! Every closed position yields one (predicted, actual) pair. Per category
//! and per BoostPower sub-range we keep exponential moving averages of the
//! additive error, the multiplicative ratio and the absolute error, and
//! derive dampened correction factors from them.
//!
//! The state is a plain value: callers own it, pass it in, and persist it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use tracing::debug;

use crate::config::CalibrationConfig;
use crate::types::{Classification, Position};

/// Bounds applied to the actual/predicted ratio.
pub const SCALE_MIN: f64 = 0.1;
pub const SCALE_MAX: f64 = 5.0;

// ---------------------------------------------------------------------------
// BoostPower sub-ranges
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoostRange {
    /// [0, 0.4)
    Low,
    /// [0.4, 0.7)
    Mid,
    /// [0.7, 1.0]
    High,
}

impl BoostRange {
    pub fn of(boost_power: f64) -> Self {
        if boost_power < 0.4 {
            BoostRange::Low
        } else if boost_power < 0.7 {
            BoostRange::Mid
        } else {
            BoostRange::High
        }
    }
}

impl fmt::Display for BoostRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BoostRange::Low => write!(f, "low"),
            BoostRange::Mid => write!(f, "mid"),
            BoostRange::High => write!(f, "high"),
        }
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// The three moving averages plus their own sample count.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmaStats {
    pub samples: u32,
    /// EMA of `predicted − actual`.
    pub bias_ema: f64,
    /// EMA of `clamp(actual / predicted)`.
    pub scale_ema: f64,
    /// EMA of `|predicted − actual|`.
    pub mae_ema: f64,
}

impl EmaStats {
    /// The first observation seeds every average directly.
    fn update(&mut self, error: f64, scale: f64, alpha: f64) {
        if self.samples == 0 {
            self.bias_ema = error;
            self.scale_ema = scale;
            self.mae_ema = error.abs();
        } else {
            self.bias_ema = alpha * error + (1.0 - alpha) * self.bias_ema;
            self.scale_ema = alpha * scale + (1.0 - alpha) * self.scale_ema;
            self.mae_ema = alpha * error.abs() + (1.0 - alpha) * self.mae_ema;
        }
        self.samples += 1;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BoostBuckets {
    pub low: EmaStats,
    pub mid: EmaStats,
    pub high: EmaStats,
}

impl BoostBuckets {
    pub fn get(&self, range: BoostRange) -> &EmaStats {
        match range {
            BoostRange::Low => &self.low,
            BoostRange::Mid => &self.mid,
            BoostRange::High => &self.high,
        }
    }

    fn get_mut(&mut self, range: BoostRange) -> &mut EmaStats {
        match range {
            BoostRange::Low => &mut self.low,
            BoostRange::Mid => &mut self.mid,
            BoostRange::High => &mut self.high,
        }
    }
}

/// One observation kept for inspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalibrationSample {
    pub position_id: String,
    pub symbol: String,
    pub predicted: f64,
    pub actual: f64,
    pub error: f64,
    pub scale: f64,
    pub boost_power: f64,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryCalibration {
    #[serde(flatten)]
    pub overall: EmaStats,
    /// Most recent first.
    pub history: VecDeque<CalibrationSample>,
    pub by_boost: BoostBuckets,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalibrationState {
    pub invertible: CategoryCalibration,
    pub apalancado: CategoryCalibration,
    pub updated_at: Option<DateTime<Utc>>,
}

impl CalibrationState {
    pub fn category(&self, category: Classification) -> Option<&CategoryCalibration> {
        match category {
            Classification::Invertible => Some(&self.invertible),
            Classification::Apalancado => Some(&self.apalancado),
            Classification::Ruidoso => None,
        }
    }

    fn category_mut(&mut self, category: Classification) -> Option<&mut CategoryCalibration> {
        match category {
            Classification::Invertible => Some(&mut self.invertible),
            Classification::Apalancado => Some(&mut self.apalancado),
            Classification::Ruidoso => None,
        }
    }

    pub fn total_samples(&self) -> u32 {
        self.invertible.overall.samples + self.apalancado.overall.samples
    }
}

// ---------------------------------------------------------------------------
// Corrections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CorrectionScope {
    /// The BoostPower sub-range had enough samples of its own.
    Range,
    Category,
}

/// Dampened corrections for a future prediction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorrectionFactors {
    /// Additive correction, already scaled by `confidence`.
    pub bias: f64,
    /// Multiplicative correction, pulled toward 1.0 by `confidence`.
    pub scale: f64,
    pub confidence: f64,
    pub samples: u32,
    pub scope: CorrectionScope,
}

impl CorrectionFactors {
    /// Mean of the additive and multiplicative corrected estimates.
    pub fn apply(&self, predicted: f64) -> f64 {
        let additive = predicted - self.bias;
        let multiplicative = predicted * self.scale;
        (additive + multiplicative) / 2.0
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Stateless operations over a `CalibrationState`.
#[derive(Debug, Clone)]
pub struct CalibrationEngine {
    config: CalibrationConfig,
}

impl Default for CalibrationEngine {
    fn default() -> Self {
        Self::new(CalibrationConfig::default())
    }
}

impl CalibrationEngine {
    pub fn new(config: CalibrationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CalibrationConfig {
        &self.config
    }

    /// Fold one closed position into `state`. Returns whether it was used.
    ///
    /// Skipped: open positions, uncalibrated categories, zero predictions.
    pub fn observe(&self, state: &mut CalibrationState, position: &Position) -> bool {
        let Some(actual) = position.realized_pnl_pct.filter(|_| position.is_closed()) else {
            return false;
        };
        let predicted = position.predicted_change;
        if predicted == 0.0 || !predicted.is_finite() || !actual.is_finite() {
            return false;
        }
        let Some(cat) = state.category_mut(position.classification) else {
            return false;
        };

        let error = predicted - actual;
        let scale = (actual / predicted).clamp(SCALE_MIN, SCALE_MAX);
        let alpha = self.config.alpha;
        let range = BoostRange::of(position.boost_power);

        cat.overall.update(error, scale, alpha);
        cat.by_boost.get_mut(range).update(error, scale, alpha);

        let observed_at = position.closed_at.unwrap_or_else(Utc::now);
        cat.history.push_front(CalibrationSample {
            position_id: position.id.clone(),
            symbol: position.symbol.clone(),
            predicted,
            actual,
            error,
            scale,
            boost_power: position.boost_power,
            observed_at,
        });
        cat.history.truncate(self.config.history_cap);

        debug!(
            category = %position.classification,
            range = %range,
            predicted,
            actual,
            bias_ema = cat.overall.bias_ema,
            scale_ema = cat.overall.scale_ema,
            samples = cat.overall.samples,
            "Calibration observed"
        );

        state.updated_at = Some(observed_at);
        true
    }

    /// Correction factors for a prediction in `category` with `boost_power`,
    /// or `None` while the category has fewer than `min_samples`.
    pub fn correction_factors(
        &self,
        state: &CalibrationState,
        category: Classification,
        boost_power: f64,
    ) -> Option<CorrectionFactors> {
        let cat = state.category(category)?;
        let min = self.config.min_samples;
        if cat.overall.samples < min {
            return None;
        }

        let bucket = cat.by_boost.get(BoostRange::of(boost_power));
        let (stats, scope) = if bucket.samples >= min {
            (bucket, CorrectionScope::Range)
        } else {
            (&cat.overall, CorrectionScope::Category)
        };

        let full = self.config.full_confidence_samples.max(1) as f64;
        let confidence = (stats.samples as f64 / full).min(1.0);

        Some(CorrectionFactors {
            bias: stats.bias_ema * confidence,
            scale: 1.0 + (stats.scale_ema - 1.0) * confidence,
            confidence,
            samples: stats.samples,
            scope,
        })
    }

    /// Rebuild from scratch by replaying closed positions oldest-first.
    pub fn rebuild(&self, positions: &[Position]) -> CalibrationState {
        let mut closed: Vec<&Position> = positions.iter().filter(|p| p.is_closed()).collect();
        closed.sort_by_key(|p| p.closed_at);

        let mut state = CalibrationState::default();
        let used = closed.iter().filter(|p| self.observe(&mut state, p)).count();
        debug!(closed = closed.len(), used, "Calibration rebuilt");
        state
    }
}
