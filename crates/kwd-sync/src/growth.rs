//! Growth orchestration: seed, guard, resolve and persist, pass after pass, for one category.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use kwd_adapters::{ResolveContext, ResolveError};
use kwd_core::{
    normalize_keyword, CategoryConfig, CategorySnapshot, IntentBucket, KeywordRow, Lifecycle,
    VolumeRow,
};
use kwd_storage::SnapshotStore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::anchoring::infer_anchor;
use crate::certification::{hydrate, HydrationThresholds};
use crate::gateway::{LostBatch, VolumeGateway};
use crate::guard::GuardFilter;
use crate::seeds::SeedGenerator;
use crate::stop::StopSignal;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GrowthSettings {
    pub target_valid_per_anchor: usize,
    /// Stop once this many valid keywords exist, even if some anchors lag.
    pub target_valid_total: Option<usize>,
    pub max_attempts: usize,
    pub deficit_multiplier: usize,
    pub min_batch_per_anchor: usize,
    pub max_batch_per_anchor: usize,
    pub max_candidates_per_pass: usize,
    pub discovery_min_candidates: usize,
    pub discovery_max_passes: usize,
    pub discovery_seeds_per_pass: usize,
}

impl Default for GrowthSettings {
    fn default() -> Self {
        Self {
            target_valid_per_anchor: 40,
            target_valid_total: None,
            max_attempts: 10,
            deficit_multiplier: 6,
            min_batch_per_anchor: 250,
            max_batch_per_anchor: 1000,
            max_candidates_per_pass: 5000,
            discovery_min_candidates: 200,
            discovery_max_passes: 2,
            discovery_seeds_per_pass: 20,
        }
    }
}

impl GrowthSettings {
    /// Candidates to request this pass given per-anchor deficits.
    pub fn pass_budget(&self, deficits: &BTreeMap<String, usize>) -> usize {
        let total: usize = deficits
            .values()
            .filter(|d| **d > 0)
            .map(|d| {
                d.saturating_mul(self.deficit_multiplier)
                    .clamp(self.min_batch_per_anchor, self.max_batch_per_anchor)
            })
            .sum();
        total.min(self.max_candidates_per_pass)
    }
}

/// What to do when asked to grow a snapshot that is already certified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecyclePolicy {
    #[default]
    RefuseCertified,
    /// Log a downgrade to `HYDRATED`, then grow.
    DowngradeAndGrow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GrowthState {
    Init,
    Seeding,
    Resolving,
    Persisting,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Termination {
    TargetReached,
    AttemptsExhausted,
    CandidatesExhausted,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassReport {
    pub pass: usize,
    pub budget: usize,
    pub generated: usize,
    pub guarded: usize,
    pub rejected: usize,
    pub discovered: usize,
    pub appended: usize,
    pub resolver_calls: usize,
    pub valid: usize,
    pub zero: usize,
    pub lost_batches: Vec<LostBatch>,
    pub unverified_remaining: usize,
}

#[derive(Debug, Clone)]
pub struct GrowthOutcome {
    pub snapshot: CategorySnapshot,
    pub termination: Termination,
    pub passes: Vec<PassReport>,
    pub states: Vec<GrowthState>,
}

#[derive(Debug, Error)]
pub enum GrowthError {
    /// Growth on a certified snapshot needs an explicit downgrade.
    #[error("category {category_id} snapshot is {lifecycle}; refusing to grow without a downgrade")]
    Certified {
        category_id: String,
        lifecycle: &'static str,
    },
    #[error("category {category_id} aborted: {source}")]
    Fatal {
        category_id: String,
        #[source]
        source: ResolveError,
    },
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

struct SeedPass {
    accepted: Vec<String>,
    discovered_rows: Vec<VolumeRow>,
    generated: usize,
    rejected: usize,
}

pub struct GrowthEngine {
    guard: Arc<GuardFilter>,
    seeds: Arc<SeedGenerator>,
    gateway: Arc<VolumeGateway>,
    store: SnapshotStore,
    settings: GrowthSettings,
    hydration: HydrationThresholds,
}

impl GrowthEngine {
    pub fn new(
        guard: Arc<GuardFilter>,
        seeds: Arc<SeedGenerator>,
        gateway: Arc<VolumeGateway>,
        store: SnapshotStore,
        settings: GrowthSettings,
        hydration: HydrationThresholds,
    ) -> Self {
        Self {
            guard,
            seeds,
            gateway,
            store,
            settings,
            hydration,
        }
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    pub fn settings(&self) -> &GrowthSettings {
        &self.settings
    }

    fn deficits(&self, snapshot: &CategorySnapshot) -> BTreeMap<String, usize> {
        snapshot
            .anchor_tallies()
            .into_iter()
            .map(|(anchor, tally)| {
                (
                    anchor,
                    self.settings.target_valid_per_anchor.saturating_sub(tally.valid),
                )
            })
            .collect()
    }

    fn target_reached(&self, snapshot: &CategorySnapshot) -> bool {
        let valid = snapshot.tallies().valid;
        if self
            .settings
            .target_valid_total
            .map(|t| valid >= t)
            .unwrap_or(false)
        {
            return true;
        }
        self.deficits(snapshot).values().all(|d| *d == 0)
    }

    fn fatal(category: &CategoryConfig, source: ResolveError) -> GrowthError {
        GrowthError::Fatal {
            category_id: category.id.clone(),
            source,
        }
    }

    /// Guarded, unseen candidates for this pass, plus discovery rows that came with volumes.
    async fn seed_pass(
        &self,
        category: &CategoryConfig,
        snapshot: &CategorySnapshot,
        pass: usize,
        budget: usize,
        ctx: &ResolveContext,
    ) -> Result<SeedPass, GrowthError> {
        let existing = snapshot.normalized_keywords();
        let generated = self.seeds.generate(category, &existing, pass, budget);
        let mut accepted: Vec<String> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut rejected = 0usize;
        for keyword in &generated {
            let verdict = self.guard.is_specific(keyword, &category.id);
            if verdict.ok {
                if seen.insert(keyword.clone()) {
                    accepted.push(keyword.clone());
                }
            } else {
                rejected += 1;
                debug!(keyword = %keyword, reason = verdict.reason.as_str(), "guard rejected candidate");
            }
        }

        let mut discovered_rows = Vec::new();
        if accepted.len() < self.settings.discovery_min_candidates
            && pass < self.settings.discovery_max_passes
        {
            let slice =
                self.seeds
                    .discovery_slice(category, pass, self.settings.discovery_seeds_per_pass);
            let rows = self
                .gateway
                .discover(&slice, ctx)
                .await
                .map_err(|err| Self::fatal(category, err))?;
            for row in rows {
                let normalized = normalize_keyword(&row.keyword);
                if normalized.is_empty()
                    || existing.contains(&normalized)
                    || !seen.insert(normalized.clone())
                {
                    continue;
                }
                if !self.guard.is_specific(&normalized, &category.id).ok {
                    rejected += 1;
                    continue;
                }
                accepted.push(normalized.clone());
                if row.volume.is_some() {
                    discovered_rows.push(VolumeRow {
                        keyword: normalized,
                        ..row
                    });
                }
            }
            info!(
                category_id = %category.id,
                pass,
                seeds = slice.len(),
                with_volume = discovered_rows.len(),
                "discovery fallback"
            );
        }
        Ok(SeedPass {
            accepted,
            discovered_rows,
            generated: generated.len(),
            rejected,
        })
    }

    /// Grow `snapshot` until the target, the attempt limit, candidate exhaustion or a stop.
    ///
    /// The snapshot is saved after every pass. Rows in batches the resolver never
    /// answered stay `UNVERIFIED` and are retried on the next pass.
    pub async fn grow(
        &self,
        category: &CategoryConfig,
        snapshot: CategorySnapshot,
        policy: LifecyclePolicy,
        ctx: &ResolveContext,
        stop: &StopSignal,
    ) -> Result<GrowthOutcome, GrowthError> {
        let span = info_span!("grow", category_id = %category.id, snapshot_id = %snapshot.snapshot_id);
        self.grow_inner(category, snapshot, policy, ctx, stop)
            .instrument(span)
            .await
    }

    async fn grow_inner(
        &self,
        category: &CategoryConfig,
        mut snapshot: CategorySnapshot,
        policy: LifecyclePolicy,
        ctx: &ResolveContext,
        stop: &StopSignal,
    ) -> Result<GrowthOutcome, GrowthError> {
        let mut states = vec![GrowthState::Init];
        let mut passes = Vec::new();

        self.gateway
            .resolver()
            .check_credentials()
            .await
            .map_err(|err| Self::fatal(category, err))?;

        if snapshot.lifecycle.is_certified() {
            match policy {
                LifecyclePolicy::RefuseCertified => {
                    return Err(GrowthError::Certified {
                        category_id: category.id.clone(),
                        lifecycle: snapshot.lifecycle.as_str(),
                    });
                }
                LifecyclePolicy::DowngradeAndGrow => {
                    let reason = format!(
                        "downgraded from {} for a requested growth run",
                        snapshot.lifecycle.as_str()
                    );
                    warn!(from = snapshot.lifecycle.as_str(), "downgrading certified snapshot before growth");
                    snapshot.transition(Lifecycle::Hydrated, reason, Utc::now());
                    self.store.save(&snapshot).await?;
                }
            }
        }

        let mut termination = Termination::AttemptsExhausted;
        for pass in 0..self.settings.max_attempts {
            if stop.is_stopped() {
                termination = Termination::Stopped;
                break;
            }
            if self.target_reached(&snapshot) {
                termination = Termination::TargetReached;
                break;
            }

            states.push(GrowthState::Seeding);
            let budget = self.settings.pass_budget(&self.deficits(&snapshot));
            let SeedPass {
                accepted,
                discovered_rows,
                generated,
                rejected,
            } = self.seed_pass(category, &snapshot, pass, budget, ctx).await?;

            let now = Utc::now();
            let candidates: Vec<KeywordRow> = accepted
                .iter()
                .filter_map(|keyword| {
                    let intent = IntentBucket::infer(keyword);
                    let anchor = infer_anchor(&category.id, keyword, &snapshot.anchors, intent)?;
                    Some(KeywordRow::unverified(&category.id, keyword, anchor, intent, now))
                })
                .collect();
            let appended = snapshot.append_candidates(candidates, now);
            if !discovered_rows.is_empty() {
                let known: HashSet<String> =
                    discovered_rows.iter().map(|r| r.keyword.clone()).collect();
                snapshot.apply_volumes(&known, &discovered_rows, now);
            }

            let pending = snapshot.unverified_keywords();
            if appended == 0 && pending.is_empty() {
                termination = Termination::CandidatesExhausted;
                break;
            }

            states.push(GrowthState::Resolving);
            let report = match self.gateway.resolve(&pending, ctx, stop).await {
                Ok(report) => report,
                Err(err) => {
                    self.store.save(&snapshot).await?;
                    return Err(Self::fatal(category, err));
                }
            };

            states.push(GrowthState::Persisting);
            let now = Utc::now();
            let applied = snapshot.apply_volumes(&report.resolved, &report.rows, now);
            hydrate(&mut snapshot, &self.hydration, now);
            let stored = self.store.save(&snapshot).await?;

            let pass_report = PassReport {
                pass,
                budget,
                generated,
                guarded: accepted.len(),
                rejected,
                discovered: discovered_rows.len(),
                appended,
                resolver_calls: report.calls,
                valid: applied.valid,
                zero: applied.zero,
                lost_batches: report.lost,
                unverified_remaining: snapshot.tallies().unverified,
            };
            info!(
                pass,
                appended,
                valid = applied.valid,
                zero = applied.zero,
                lost = pass_report.lost_batches.len(),
                unchanged = stored.unchanged,
                "growth pass persisted"
            );
            passes.push(pass_report);

            if report.stopped {
                termination = Termination::Stopped;
                break;
            }
        }

        if termination == Termination::AttemptsExhausted && self.target_reached(&snapshot) {
            termination = Termination::TargetReached;
        }
        states.push(GrowthState::Done);
        info!(termination = ?termination, passes = passes.len(), "growth finished");

        Ok(GrowthOutcome {
            snapshot,
            termination,
            passes,
            states,
        })
    }
}
