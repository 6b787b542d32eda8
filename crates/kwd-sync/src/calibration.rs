//! Benchmark calibration of displayed scores. Raw values are always kept alongside.

use kwd_core::Benchmark;
use serde::{Deserialize, Serialize};

use crate::metrics::{
    buying_intent, demand_over_time, format_demand, CategoryMetrics, MetricsConfig,
};

pub const DEFAULT_BLEND_ALPHA: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum CalibrationPolicy {
    None,
    Blend { alpha: f64 },
    Override,
}

impl Default for CalibrationPolicy {
    fn default() -> Self {
        CalibrationPolicy::Blend {
            alpha: DEFAULT_BLEND_ALPHA,
        }
    }
}

/// One calibration rule applied to each headline value.
pub trait Calibrator: Send + Sync {
    fn name(&self) -> &'static str;

    /// Display value for `raw` given the category's benchmark, when one exists.
    fn calibrate_value(&self, raw: f64, benchmark: Option<f64>) -> f64;
}

#[derive(Debug, Clone, Copy)]
pub struct BlendCalibrator {
    pub alpha: f64,
}

impl Calibrator for BlendCalibrator {
    fn name(&self) -> &'static str {
        "blend"
    }

    fn calibrate_value(&self, raw: f64, benchmark: Option<f64>) -> f64 {
        match benchmark {
            Some(reference) => self.alpha * raw + (1.0 - self.alpha) * reference,
            None => raw,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct OverrideCalibrator;

impl Calibrator for OverrideCalibrator {
    fn name(&self) -> &'static str {
        "override"
    }

    fn calibrate_value(&self, raw: f64, benchmark: Option<f64>) -> f64 {
        benchmark.unwrap_or(raw)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct IdentityCalibrator;

impl Calibrator for IdentityCalibrator {
    fn name(&self) -> &'static str {
        "none"
    }

    fn calibrate_value(&self, raw: f64, _benchmark: Option<f64>) -> f64 {
        raw
    }
}

pub fn calibrator_for(policy: CalibrationPolicy) -> Box<dyn Calibrator> {
    match policy {
        CalibrationPolicy::None => Box::new(IdentityCalibrator),
        CalibrationPolicy::Blend { alpha } => Box::new(BlendCalibrator { alpha }),
        CalibrationPolicy::Override => Box::new(OverrideCalibrator),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibratedValue {
    pub raw: f64,
    pub display: f64,
    pub calibrated: bool,
}

/// Raw metrics plus the calibrated view shown to users.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalibratedMetrics {
    pub policy: String,
    pub benchmark: Option<Benchmark>,
    pub demand_index: CalibratedValue,
    pub readiness_score: CalibratedValue,
    pub spread_score: CalibratedValue,
    pub raw: CategoryMetrics,
    pub display: CategoryMetrics,
}

fn calibrated(calibrator: &dyn Calibrator, raw: f64, benchmark: Option<f64>) -> CalibratedValue {
    let display = calibrator.calibrate_value(raw, benchmark);
    CalibratedValue {
        raw,
        display,
        calibrated: benchmark.is_some() && display.to_bits() != raw.to_bits(),
    }
}

/// Apply `calibrator` to the three headline scores. Demand-over-time and the
/// buying-intent index in `display` are recomputed from the calibrated values.
pub fn calibrate(
    metrics: &CategoryMetrics,
    benchmark: Option<&Benchmark>,
    calibrator: &dyn Calibrator,
    config: &MetricsConfig,
) -> CalibratedMetrics {
    let demand = calibrated(
        calibrator,
        metrics.demand_index.value,
        benchmark.map(|b| b.demand_mn),
    );
    let readiness = calibrated(
        calibrator,
        metrics.readiness_score.value,
        benchmark.map(|b| b.readiness),
    );
    let spread = calibrated(
        calibrator,
        metrics.spread_score.value,
        benchmark.map(|b| b.spread),
    );

    let mut display = metrics.clone();
    display.demand_index.value = demand.display;
    display.demand_index.display = format_demand(demand.display);
    display.readiness_score.value = readiness.display;
    display.readiness_score.label = config.score_label(readiness.display).to_string();
    display.spread_score.value = spread.display;
    display.spread_score.label = config.score_label(spread.display).to_string();
    display.demand_over_time = demand_over_time(demand.display, metrics.trend.value_percent);
    display.buying_intent_index.value = buying_intent(readiness.display, spread.display);

    CalibratedMetrics {
        policy: calibrator.name().to_string(),
        benchmark: benchmark.copied(),
        demand_index: demand,
        readiness_score: readiness,
        spread_score: spread,
        raw: metrics.clone(),
        display,
    }
}
