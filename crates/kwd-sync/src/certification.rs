//! Lifecycle gate: hydration and CERTIFIED_LITE / CERTIFIED_FULL promotion.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kwd_core::{AnchorTally, CategorySnapshot, Lifecycle, SnapshotTallies};
use serde::{Deserialize, Serialize};
use tracing::info;

fn default_min_valid_per_anchor() -> usize {
    2
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TierThresholds {
    pub min_anchors_passing: usize,
    pub min_coverage_pct: f64,
    pub min_valid_keywords_total: usize,
    pub max_zero_pct: f64,
    /// Valid keywords an anchor needs to count as passing.
    #[serde(default = "default_min_valid_per_anchor")]
    pub min_valid_per_anchor: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CertificationPolicy {
    pub full: TierThresholds,
    pub lite: TierThresholds,
}

impl Default for CertificationPolicy {
    fn default() -> Self {
        Self {
            full: TierThresholds {
                min_anchors_passing: 2,
                min_coverage_pct: 3.0,
                min_valid_keywords_total: 20,
                max_zero_pct: 98.0,
                min_valid_per_anchor: 2,
            },
            lite: TierThresholds {
                min_anchors_passing: 1,
                min_coverage_pct: 1.0,
                min_valid_keywords_total: 5,
                max_zero_pct: 99.0,
                min_valid_per_anchor: 2,
            },
        }
    }
}

impl CertificationPolicy {
    /// `lite` must be no stricter than `full` on every axis and looser on at least one.
    pub fn lite_is_looser(&self) -> Result<(), String> {
        let (f, l) = (&self.full, &self.lite);
        let mut problems = Vec::new();
        if l.min_anchors_passing > f.min_anchors_passing {
            problems.push("min_anchors_passing");
        }
        if l.min_coverage_pct > f.min_coverage_pct {
            problems.push("min_coverage_pct");
        }
        if l.min_valid_keywords_total > f.min_valid_keywords_total {
            problems.push("min_valid_keywords_total");
        }
        if l.max_zero_pct < f.max_zero_pct {
            problems.push("max_zero_pct");
        }
        if l.min_valid_per_anchor > f.min_valid_per_anchor {
            problems.push("min_valid_per_anchor");
        }
        if !problems.is_empty() {
            return Err(format!("lite is stricter on {}", problems.join(", ")));
        }
        if l == f {
            return Err("lite equals full".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HydrationThresholds {
    pub min_anchors: usize,
    pub min_valid_per_anchor: usize,
}

impl Default for HydrationThresholds {
    fn default() -> Self {
        Self {
            min_anchors: 1,
            min_valid_per_anchor: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CertificationTier {
    Lite,
    Full,
}

impl CertificationTier {
    pub fn lifecycle(self) -> Lifecycle {
        match self {
            CertificationTier::Lite => Lifecycle::CertifiedLite,
            CertificationTier::Full => Lifecycle::CertifiedFull,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierCheck {
    pub passed: bool,
    pub failures: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CertificationReport {
    pub tier: Option<CertificationTier>,
    pub full: TierCheck,
    pub lite: TierCheck,
    pub valid_total: usize,
    pub zero_total: usize,
    pub keyword_total: usize,
    pub coverage_pct: f64,
    pub zero_pct: f64,
    pub poisoned: bool,
}

fn pct(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 * 100.0 / whole as f64
    }
}

fn anchors_passing(anchors: &BTreeMap<String, AnchorTally>, min_valid: usize) -> usize {
    anchors.values().filter(|a| a.valid >= min_valid).count()
}

fn check_tier(
    t: &TierThresholds,
    tallies: &SnapshotTallies,
    anchors: &BTreeMap<String, AnchorTally>,
) -> TierCheck {
    let coverage = pct(tallies.valid, tallies.total);
    let zero = pct(tallies.zero, tallies.total);
    let passing = anchors_passing(anchors, t.min_valid_per_anchor);
    let mut failures = Vec::new();
    if passing < t.min_anchors_passing {
        failures.push(format!(
            "{passing} anchors passing < {}",
            t.min_anchors_passing
        ));
    }
    if coverage < t.min_coverage_pct {
        failures.push(format!("coverage {coverage:.1}% < {}%", t.min_coverage_pct));
    }
    if tallies.valid < t.min_valid_keywords_total {
        failures.push(format!(
            "{} valid keywords < {}",
            tallies.valid, t.min_valid_keywords_total
        ));
    }
    if zero > t.max_zero_pct {
        failures.push(format!("zero rate {zero:.1}% > {}%", t.max_zero_pct));
    }
    TierCheck {
        passed: failures.is_empty(),
        failures,
    }
}

/// Pure evaluation over tallies. A snapshot without any valid keyword never certifies.
pub fn evaluate(
    tallies: &SnapshotTallies,
    anchors: &BTreeMap<String, AnchorTally>,
    policy: &CertificationPolicy,
) -> CertificationReport {
    let poisoned = tallies.valid == 0;
    let mut full = check_tier(&policy.full, tallies, anchors);
    let mut lite = check_tier(&policy.lite, tallies, anchors);
    if poisoned {
        for check in [&mut full, &mut lite] {
            check.passed = false;
            check.failures.push("no valid keywords".to_string());
        }
    }
    let tier = if full.passed {
        Some(CertificationTier::Full)
    } else if lite.passed {
        Some(CertificationTier::Lite)
    } else {
        None
    };
    CertificationReport {
        tier,
        full,
        lite,
        valid_total: tallies.valid,
        zero_total: tallies.zero,
        keyword_total: tallies.total,
        coverage_pct: pct(tallies.valid, tallies.total),
        zero_pct: pct(tallies.zero, tallies.total),
        poisoned,
    }
}

pub fn evaluate_snapshot(
    snapshot: &CategorySnapshot,
    policy: &CertificationPolicy,
) -> CertificationReport {
    evaluate(&snapshot.tallies(), &snapshot.anchor_tallies(), policy)
}

/// Promote the snapshot when it qualifies. Certification only ever raises the
/// lifecycle; demotion goes through an explicit growth downgrade.
///
/// A DRAFT snapshot is logged through HYDRATED first, so the lifecycle log never
/// skips a step.
pub fn certify(
    snapshot: &mut CategorySnapshot,
    policy: &CertificationPolicy,
    now: DateTime<Utc>,
) -> CertificationReport {
    let report = evaluate_snapshot(snapshot, policy);
    if let Some(tier) = report.tier {
        let target = tier.lifecycle();
        if target > snapshot.lifecycle {
            let reason = format!(
                "{} valid / {} total, coverage {:.1}%, zero {:.1}%",
                report.valid_total, report.keyword_total, report.coverage_pct, report.zero_pct
            );
            info!(
                category_id = %snapshot.category_id,
                snapshot_id = %snapshot.snapshot_id,
                from = snapshot.lifecycle.as_str(),
                to = target.as_str(),
                "certifying snapshot"
            );
            if snapshot.lifecycle == Lifecycle::Draft {
                snapshot.transition(
                    Lifecycle::Hydrated,
                    format!("qualified for {} certification", target.as_str()),
                    now,
                );
            }
            snapshot.transition(target, reason, now);
        }
    }
    report
}

/// DRAFT -> HYDRATED once enough anchors carry valid keywords.
pub fn hydrate(
    snapshot: &mut CategorySnapshot,
    thresholds: &HydrationThresholds,
    now: DateTime<Utc>,
) -> bool {
    if snapshot.lifecycle != Lifecycle::Draft {
        return false;
    }
    let anchors = snapshot.anchor_tallies();
    let needed = thresholds.min_anchors.clamp(1, anchors.len().max(1));
    let passing = anchors_passing(&anchors, thresholds.min_valid_per_anchor);
    if passing < needed {
        return false;
    }
    info!(
        category_id = %snapshot.category_id,
        snapshot_id = %snapshot.snapshot_id,
        anchors_passing = passing,
        "snapshot hydrated"
    );
    snapshot.transition(
        Lifecycle::Hydrated,
        format!("{passing} anchors with >= {} valid keywords", thresholds.min_valid_per_anchor),
        now,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use kwd_core::{Anchor, CategoryConfig, IntentBucket, KeywordRow, VolumeRow};
    use std::collections::HashSet;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 4, 10, 0, 0).single().expect("ts")
    }

    fn anchors(n: usize) -> BTreeMap<String, AnchorTally> {
        (0..n)
            .map(|i| {
                (
                    format!("a{i}"),
                    AnchorTally {
                        total: 10,
                        valid: 5,
                        zero: 5,
                        unverified: 0,
                    },
                )
            })
            .collect()
    }

    #[test]
    fn three_passing_anchors_with_high_zero_rate_certify_full() {
        let policy = CertificationPolicy {
            full: TierThresholds {
                min_anchors_passing: 2,
                min_coverage_pct: 0.0,
                min_valid_keywords_total: 20,
                max_zero_pct: 98.0,
                min_valid_per_anchor: 2,
            },
            ..CertificationPolicy::default()
        };
        let tallies = SnapshotTallies {
            total: 250,
            valid: 25,
            zero: 225,
            unverified: 0,
        };
        let report = evaluate(&tallies, &anchors(3), &policy);
        assert_eq!(report.zero_pct, 90.0);
        assert_eq!(report.tier, Some(CertificationTier::Full));
    }

    #[test]
    fn lite_applies_when_full_fails() {
        let policy = CertificationPolicy::default();
        let tallies = SnapshotTallies {
            total: 100,
            valid: 8,
            zero: 92,
            unverified: 0,
        };
        let report = evaluate(&tallies, &anchors(1), &policy);
        assert!(!report.full.passed);
        assert_eq!(report.tier, Some(CertificationTier::Lite));
    }

    #[test]
    fn zero_valid_snapshots_are_never_certified() {
        let policy = CertificationPolicy {
            lite: TierThresholds {
                min_anchors_passing: 0,
                min_coverage_pct: 0.0,
                min_valid_keywords_total: 0,
                max_zero_pct: 100.0,
                min_valid_per_anchor: 0,
            },
            ..CertificationPolicy::default()
        };
        let tallies = SnapshotTallies {
            total: 40,
            valid: 0,
            zero: 40,
            unverified: 0,
        };
        let report = evaluate(&tallies, &BTreeMap::new(), &policy);
        assert!(report.poisoned);
        assert_eq!(report.tier, None);
    }

    #[test]
    fn lite_must_be_looser_than_full() {
        let mut policy = CertificationPolicy::default();
        assert!(policy.lite_is_looser().is_ok());
        policy.lite.min_valid_keywords_total = 50;
        assert!(policy.lite_is_looser().is_err());
        policy.lite = policy.full;
        assert!(policy.lite_is_looser().is_err());
    }

    fn category() -> CategoryConfig {
        CategoryConfig {
            id: "shaving".into(),
            display_name: "Shaving".into(),
            anchors: vec![
                Anchor {
                    anchor_id: "razors".into(),
                    label: "Razors".into(),
                    vocabulary: vec![],
                },
                Anchor {
                    anchor_id: "trimmers".into(),
                    label: "Trimmers".into(),
                    vocabulary: vec![],
                },
            ],
            curated_seeds: vec![],
            head_terms: vec![],
            brand_packs: vec![],
            problem_seeds: vec![],
            blocked_terms: vec![],
            benchmark: None,
        }
    }

    fn grown_snapshot(valid_per_anchor: usize) -> CategorySnapshot {
        let mut snap = CategorySnapshot::new_draft(&category(), ts());
        let mut rows = Vec::new();
        let mut volumes = Vec::new();
        for anchor in ["razors", "trimmers"] {
            for i in 0..valid_per_anchor {
                let kw = format!("{anchor} keyword {i}");
                rows.push(KeywordRow::unverified(
                    "shaving",
                    &kw,
                    anchor,
                    IntentBucket::Discovery,
                    ts(),
                ));
                volumes.push(VolumeRow {
                    keyword: kw,
                    volume: Some(100),
                    cpc: None,
                    competition_index: None,
                });
            }
        }
        snap.append_candidates(rows, ts());
        let resolved: HashSet<String> = snap.normalized_keywords();
        snap.apply_volumes(&resolved, &volumes, ts());
        snap
    }

    #[test]
    fn certification_promotes_and_never_demotes() {
        let policy = CertificationPolicy::default();
        let mut snap = grown_snapshot(12);
        let report = certify(&mut snap, &policy, ts());
        assert_eq!(report.tier, Some(CertificationTier::Full));
        assert_eq!(snap.lifecycle, Lifecycle::CertifiedFull);

        // Only Lite-worthy now, but the Full certificate is kept.
        snap.rows.truncate(6);
        let report = certify(&mut snap, &policy, ts());
        assert_eq!(report.tier, Some(CertificationTier::Lite));
        assert_eq!(snap.lifecycle, Lifecycle::CertifiedFull);
        assert_eq!(snap.lifecycle_log.len(), 2);
    }

    #[test]
    fn draft_snapshots_pass_through_hydrated_on_certification() {
        let policy = CertificationPolicy::default();
        let mut snap = grown_snapshot(12);
        assert_eq!(snap.lifecycle, Lifecycle::Draft);
        certify(&mut snap, &policy, ts());

        let steps: Vec<(Lifecycle, Lifecycle)> =
            snap.lifecycle_log.iter().map(|t| (t.from, t.to)).collect();
        assert_eq!(
            steps,
            vec![
                (Lifecycle::Draft, Lifecycle::Hydrated),
                (Lifecycle::Hydrated, Lifecycle::CertifiedFull),
            ]
        );

        // Already hydrated snapshots get a single step.
        let mut hydrated = grown_snapshot(12);
        hydrated.transition(Lifecycle::Hydrated, "grown", ts());
        certify(&mut hydrated, &policy, ts());
        assert_eq!(hydrated.lifecycle_log.len(), 2);
        assert_eq!(hydrated.lifecycle_log[1].from, Lifecycle::Hydrated);
        assert_eq!(hydrated.lifecycle_log[1].to, Lifecycle::CertifiedFull);
    }

    #[test]
    fn hydration_requires_enough_passing_anchors() {
        let thresholds = HydrationThresholds {
            min_anchors: 2,
            min_valid_per_anchor: 2,
        };
        let mut thin = grown_snapshot(1);
        assert!(!hydrate(&mut thin, &thresholds, ts()));
        assert_eq!(thin.lifecycle, Lifecycle::Draft);

        let mut enough = grown_snapshot(2);
        assert!(hydrate(&mut enough, &thresholds, ts()));
        assert_eq!(enough.lifecycle, Lifecycle::Hydrated);
        assert!(!hydrate(&mut enough, &thresholds, ts()));
    }
}
