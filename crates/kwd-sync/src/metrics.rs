//! Demand / readiness / spread scoring over a snapshot's valid keywords.

use std::collections::BTreeMap;

use kwd_core::{CategorySnapshot, Lifecycle};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Valid / total below this marks the result partial.
    pub min_coverage: f64,
    /// Fewer valid keywords than this marks the result partial.
    pub min_valid_keywords: usize,
    pub high_label_at: f64,
    pub medium_label_at: f64,
    /// Trend percent at or above which the trend reads "Growing" (and at or below the negative, "Declining").
    pub trend_band_pct: f64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            min_coverage: 0.1,
            min_valid_keywords: 5,
            high_label_at: 7.5,
            medium_label_at: 4.5,
            trend_band_pct: 5.0,
        }
    }
}

impl MetricsConfig {
    pub fn score_label(&self, value: f64) -> &'static str {
        if value >= self.high_label_at {
            "High"
        } else if value >= self.medium_label_at {
            "Medium"
        } else {
            "Low"
        }
    }

    pub fn trend_label(&self, percent: f64) -> &'static str {
        if percent >= self.trend_band_pct {
            "Growing"
        } else if percent <= -self.trend_band_pct {
            "Declining"
        } else {
            "Stable"
        }
    }
}

/// Externally supplied historical trend signal.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrendInput {
    pub percent: f64,
    pub label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DemandIndex {
    pub value: f64,
    pub display: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelledScore {
    pub value: f64,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendSummary {
    pub label: String,
    pub value_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DemandOverTime {
    pub growth: f64,
    pub total: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuyingIntentIndex {
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricInputs {
    pub keyword_count_total: usize,
    pub keyword_count_validated: usize,
    pub volume_sum_validated: u64,
    pub coverage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsQuality {
    pub is_partial: bool,
    pub reasons: Vec<QualityReason>,
}

impl MetricsQuality {
    pub fn has(&self, code: &str) -> bool {
        self.reasons.iter().any(|r| r.code == code)
    }
}

/// Why a metrics object is partial: a stable code plus a human-readable message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReason {
    pub code: String,
    pub message: String,
}

impl QualityReason {
    fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

pub const NO_VALIDATED_KEYWORDS: &str = "NO_VALIDATED_KEYWORDS";
pub const COVERAGE_BELOW_THRESHOLD: &str = "COVERAGE_BELOW_THRESHOLD";
pub const BELOW_CERTIFICATION_MINIMUM: &str = "BELOW_CERTIFICATION_MINIMUM";
pub const VALIDATION_INCOMPLETE: &str = "VALIDATION_INCOMPLETE";

/// The metrics object handed to the display layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryMetrics {
    pub category_id: String,
    pub snapshot_id: Uuid,
    pub lifecycle: Lifecycle,
    pub demand_index: DemandIndex,
    pub readiness_score: LabelledScore,
    pub spread_score: LabelledScore,
    pub trend: TrendSummary,
    pub demand_over_time: DemandOverTime,
    pub buying_intent_index: BuyingIntentIndex,
    pub inputs: MetricInputs,
    pub quality: MetricsQuality,
}

pub fn format_demand(value: f64) -> String {
    format!("{value:.2} Mn")
}

fn clamp01(x: f64) -> f64 {
    x.clamp(0.0, 1.0)
}

pub fn readiness_from_intent(avg_intent: f64) -> f64 {
    1.0 + 9.0 * clamp01((avg_intent - 0.5) / 0.5).sqrt()
}

/// `10 * (1 - top-3 share)` over anchors with demand, clamped to [1, 10].
/// A single active anchor is maximally concentrated.
pub fn spread_from_anchor_volumes(volumes: &BTreeMap<String, u64>) -> f64 {
    let active: Vec<u64> = volumes.values().copied().filter(|v| *v > 0).collect();
    if active.len() <= 1 {
        return 1.0;
    }
    let total: u64 = active.iter().sum();
    let mut shares: Vec<f64> = active.iter().map(|v| *v as f64 / total as f64).collect();
    shares.sort_by(|a, b| b.total_cmp(a));
    let top3: f64 = shares.iter().take(3).sum();
    (10.0 * (1.0 - top3)).clamp(1.0, 10.0)
}

pub fn demand_over_time(demand_index: f64, trend_percent: f64) -> DemandOverTime {
    let growth = demand_index * (trend_percent / 100.0);
    DemandOverTime {
        growth,
        total: demand_index + growth,
    }
}

pub fn buying_intent(readiness: f64, spread: f64) -> f64 {
    if spread > 0.0 {
        readiness / spread
    } else {
        0.0
    }
}

fn quality(
    snapshot: &CategorySnapshot,
    valid: usize,
    coverage: f64,
    config: &MetricsConfig,
) -> MetricsQuality {
    let mut reasons = Vec::new();
    if valid == 0 {
        reasons.push(QualityReason::new(
            NO_VALIDATED_KEYWORDS,
            "no keyword has confirmed search volume",
        ));
    }
    if coverage < config.min_coverage {
        reasons.push(QualityReason::new(
            COVERAGE_BELOW_THRESHOLD,
            format!(
                "{:.1}% of keywords validated (minimum {:.1}%)",
                coverage * 100.0,
                config.min_coverage * 100.0
            ),
        ));
    }
    if valid > 0 && valid < config.min_valid_keywords {
        reasons.push(QualityReason::new(
            BELOW_CERTIFICATION_MINIMUM,
            format!("{valid} valid keywords (minimum {})", config.min_valid_keywords),
        ));
    }
    if !snapshot.lifecycle.is_certified() {
        reasons.push(QualityReason::new(
            VALIDATION_INCOMPLETE,
            format!("snapshot is {}", snapshot.lifecycle.as_str()),
        ));
    }
    MetricsQuality {
        is_partial: !reasons.is_empty(),
        reasons,
    }
}

/// Pure function of the snapshot's active VALID rows and the trend input.
pub fn compute_metrics(
    snapshot: &CategorySnapshot,
    trend: &TrendInput,
    config: &MetricsConfig,
) -> CategoryMetrics {
    let mut volume_sum: u64 = 0;
    let mut weighted_sum = 0.0;
    let mut valid = 0usize;
    let mut anchor_volumes: BTreeMap<String, u64> = snapshot
        .anchors
        .iter()
        .map(|a| (a.anchor_id.clone(), 0))
        .collect();

    for row in snapshot.valid_rows() {
        let volume = row.volume.unwrap_or(0);
        valid += 1;
        volume_sum += volume;
        weighted_sum += volume as f64 * row.intent_bucket.weight();
        *anchor_volumes.entry(row.anchor_id.clone()).or_default() += volume;
    }

    let demand = weighted_sum / 1_000_000.0;
    let avg_intent = if volume_sum > 0 {
        weighted_sum / volume_sum as f64
    } else {
        0.0
    };
    let readiness = readiness_from_intent(avg_intent);
    let spread = spread_from_anchor_volumes(&anchor_volumes);
    let total = snapshot.rows.len();
    let coverage = if total > 0 {
        valid as f64 / total as f64
    } else {
        0.0
    };

    CategoryMetrics {
        category_id: snapshot.category_id.clone(),
        snapshot_id: snapshot.snapshot_id,
        lifecycle: snapshot.lifecycle,
        demand_index: DemandIndex {
            value: demand,
            display: format_demand(demand),
        },
        readiness_score: LabelledScore {
            value: readiness,
            label: config.score_label(readiness).to_string(),
        },
        spread_score: LabelledScore {
            value: spread,
            label: config.score_label(spread).to_string(),
        },
        trend: TrendSummary {
            label: trend
                .label
                .clone()
                .unwrap_or_else(|| config.trend_label(trend.percent).to_string()),
            value_percent: trend.percent,
        },
        demand_over_time: demand_over_time(demand, trend.percent),
        buying_intent_index: BuyingIntentIndex {
            value: buying_intent(readiness, spread),
        },
        inputs: MetricInputs {
            keyword_count_total: total,
            keyword_count_validated: valid,
            volume_sum_validated: volume_sum,
            coverage,
        },
        quality: quality(snapshot, valid, coverage, config),
    }
}
