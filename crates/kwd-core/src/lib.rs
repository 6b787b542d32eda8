//! Core domain model for the keyword demand engine.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "kwd-core";

/// Lowercase, strip punctuation/symbols and collapse whitespace.
pub fn normalize_keyword(raw: &str) -> String {
    raw.to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Content-derived keyword identifier, stable for a (normalized keyword, category) pair.
pub fn keyword_id(category_id: &str, keyword: &str) -> Uuid {
    let source = format!("{}|{}", category_id, normalize_keyword(keyword));
    Uuid::new_v5(&Uuid::NAMESPACE_URL, source.as_bytes())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeywordStatus {
    Valid,
    Zero,
    Unverified,
}

/// Purchase-funnel stage of a keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IntentBucket {
    Decision,
    Consideration,
    Need,
    Problem,
    Habit,
    Aspirational,
    Discovery,
}

/// Three-tier collapse of [`IntentBucket`] used for scoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentTier {
    Transactional,
    Evaluative,
    Informational,
}

impl IntentTier {
    pub fn weight(self) -> f64 {
        match self {
            IntentTier::Transactional => 1.0,
            IntentTier::Evaluative => 0.7,
            IntentTier::Informational => 0.4,
        }
    }
}

const DECISION_CUES: &[&str] = &["buy", "price", "offer", "online", "cost", "amazon", "shop"];
const CONSIDERATION_CUES: &[&str] = &["best", "review", "vs", "top", "better", "brand"];
const PROBLEM_CUES: &[&str] = &[
    "burn",
    "irritation",
    "bump",
    "fix",
    "solution",
    "problem",
    "pain",
    "acne",
];

fn has_cue(tokens: &[&str], cues: &[&str]) -> bool {
    tokens.iter().any(|token| {
        cues.iter().any(|cue| {
            *token == *cue
                || token
                    .strip_suffix('s')
                    .is_some_and(|singular| singular == *cue)
        })
    })
}

impl IntentBucket {
    /// Infer the bucket from cue words; anything without a cue is `Discovery`.
    pub fn infer(keyword: &str) -> Self {
        let normalized = normalize_keyword(keyword);
        let tokens = normalized.split(' ').collect::<Vec<_>>();
        if has_cue(&tokens, DECISION_CUES) {
            IntentBucket::Decision
        } else if has_cue(&tokens, CONSIDERATION_CUES) {
            IntentBucket::Consideration
        } else if has_cue(&tokens, PROBLEM_CUES) {
            IntentBucket::Problem
        } else {
            IntentBucket::Discovery
        }
    }

    pub fn tier(self) -> IntentTier {
        match self {
            IntentBucket::Decision => IntentTier::Transactional,
            IntentBucket::Consideration | IntentBucket::Need | IntentBucket::Problem => {
                IntentTier::Evaluative
            }
            IntentBucket::Habit | IntentBucket::Aspirational | IntentBucket::Discovery => {
                IntentTier::Informational
            }
        }
    }

    pub fn weight(self) -> f64 {
        self.tier().weight()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Lifecycle {
    Draft,
    Hydrated,
    CertifiedLite,
    CertifiedFull,
}

impl Lifecycle {
    pub fn is_certified(self) -> bool {
        matches!(self, Lifecycle::CertifiedLite | Lifecycle::CertifiedFull)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Lifecycle::Draft => "DRAFT",
            Lifecycle::Hydrated => "HYDRATED",
            Lifecycle::CertifiedLite => "CERTIFIED_LITE",
            Lifecycle::CertifiedFull => "CERTIFIED_FULL",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Anchor {
    pub anchor_id: String,
    pub label: String,
    #[serde(default)]
    pub vocabulary: Vec<String>,
}

impl Anchor {
    /// Lowercased label and vocabulary tokens long enough to be distinctive.
    pub fn match_tokens(&self) -> Vec<String> {
        let mut tokens = Vec::new();
        for phrase in std::iter::once(&self.label).chain(self.vocabulary.iter()) {
            for token in normalize_keyword(phrase).split(' ') {
                if token.len() > 3 && !tokens.iter().any(|t| t == token) {
                    tokens.push(token.to_string());
                }
            }
        }
        tokens
    }
}

/// Reference values used by benchmark calibration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Benchmark {
    pub demand_mn: f64,
    pub readiness: f64,
    pub spread: f64,
    #[serde(default)]
    pub trend_5y: Option<f64>,
}

/// One cohesive configuration record per category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryConfig {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    pub anchors: Vec<Anchor>,
    #[serde(default)]
    pub curated_seeds: Vec<String>,
    #[serde(default)]
    pub head_terms: Vec<String>,
    #[serde(default)]
    pub brand_packs: Vec<String>,
    #[serde(default)]
    pub problem_seeds: Vec<String>,
    #[serde(default)]
    pub blocked_terms: Vec<String>,
    #[serde(default)]
    pub benchmark: Option<Benchmark>,
}

impl CategoryConfig {
    pub fn anchor(&self, anchor_id: &str) -> Option<&Anchor> {
        self.anchors.iter().find(|a| a.anchor_id == anchor_id)
    }
}

/// One candidate search phrase scoped to a category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeywordRow {
    pub keyword_id: Uuid,
    pub keyword_text: String,
    pub anchor_id: String,
    pub intent_bucket: IntentBucket,
    pub status: KeywordStatus,
    pub volume: Option<u64>,
    pub cpc: Option<f64>,
    pub competition: Option<f64>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl KeywordRow {
    pub fn unverified(
        category_id: &str,
        keyword: &str,
        anchor_id: impl Into<String>,
        intent_bucket: IntentBucket,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            keyword_id: keyword_id(category_id, keyword),
            keyword_text: normalize_keyword(keyword),
            anchor_id: anchor_id.into(),
            intent_bucket,
            status: KeywordStatus::Unverified,
            volume: None,
            cpc: None,
            competition: None,
            active: true,
            created_at,
            resolved_at: None,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.active && self.status == KeywordStatus::Valid
    }
}

/// Per-keyword result handed from volume resolvers to the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeRow {
    pub keyword: String,
    pub volume: Option<u64>,
    pub cpc: Option<f64>,
    pub competition_index: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleTransition {
    pub from: Lifecycle,
    pub to: Lifecycle,
    pub reason: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SnapshotTallies {
    pub total: usize,
    pub valid: usize,
    pub zero: usize,
    pub unverified: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AnchorTally {
    pub total: usize,
    pub valid: usize,
    pub zero: usize,
    pub unverified: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VolumeApplication {
    pub valid: usize,
    pub zero: usize,
}

/// Versioned container of all keyword rows for one category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategorySnapshot {
    pub snapshot_id: Uuid,
    pub category_id: String,
    pub lifecycle: Lifecycle,
    pub anchors: Vec<Anchor>,
    pub rows: Vec<KeywordRow>,
    #[serde(default)]
    pub lifecycle_log: Vec<LifecycleTransition>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CategorySnapshot {
    pub fn new_draft(category: &CategoryConfig, now: DateTime<Utc>) -> Self {
        Self {
            snapshot_id: Uuid::new_v4(),
            category_id: category.id.clone(),
            lifecycle: Lifecycle::Draft,
            anchors: category.anchors.clone(),
            rows: Vec::new(),
            lifecycle_log: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Normalized text of every row, active or not.
    pub fn normalized_keywords(&self) -> HashSet<String> {
        self.rows.iter().map(|r| r.keyword_text.clone()).collect()
    }

    /// Append rows whose keyword id is not already present. Returns the number appended.
    pub fn append_candidates(&mut self, rows: Vec<KeywordRow>, now: DateTime<Utc>) -> usize {
        let mut seen: HashSet<Uuid> = self.rows.iter().map(|r| r.keyword_id).collect();
        let mut appended = 0;
        for row in rows {
            if row.keyword_text.is_empty() || !seen.insert(row.keyword_id) {
                continue;
            }
            self.rows.push(row);
            appended += 1;
        }
        if appended > 0 {
            self.updated_at = now;
        }
        appended
    }

    /// Append one row unless its keyword id is already present.
    pub fn append_candidate(&mut self, row: KeywordRow, now: DateTime<Utc>) -> bool {
        self.append_candidates(vec![row], now) == 1
    }

    /// Record a resolver result for `keyword`. Returns the new status, or `None`
    /// when the snapshot holds no such keyword.
    pub fn record_volume(
        &mut self,
        keyword: &str,
        volume: Option<u64>,
        cpc: Option<f64>,
        competition: Option<f64>,
        now: DateTime<Utc>,
    ) -> Option<KeywordStatus> {
        let normalized = normalize_keyword(keyword);
        let row = self.rows.iter_mut().find(|r| r.keyword_text == normalized)?;
        let volume = volume.unwrap_or(0);
        row.volume = Some(volume);
        row.cpc = cpc;
        row.competition = competition;
        row.resolved_at = Some(now);
        if volume > 0 {
            row.status = KeywordStatus::Valid;
            row.active = true;
        } else {
            row.status = KeywordStatus::Zero;
            row.active = false;
        }
        self.updated_at = now;
        Some(row.status)
    }

    /// The resolver answered for this keyword's batch but returned no row for it.
    pub fn mark_unresolved_zero(&mut self, keyword: &str, now: DateTime<Utc>) -> bool {
        self.record_volume(keyword, Some(0), None, None, now).is_some()
    }

    /// Apply resolver output for keywords whose batch completed.
    ///
    /// Keywords in `resolved` without a matching row in `volumes` were not found by
    /// the resolver and become `ZERO`.
    pub fn apply_volumes(
        &mut self,
        resolved: &HashSet<String>,
        volumes: &[VolumeRow],
        now: DateTime<Utc>,
    ) -> VolumeApplication {
        let by_keyword: HashMap<String, &VolumeRow> = volumes
            .iter()
            .map(|v| (normalize_keyword(&v.keyword), v))
            .collect();

        let mut targets: Vec<String> = self
            .rows
            .iter()
            .filter(|r| resolved.contains(&r.keyword_text))
            .map(|r| r.keyword_text.clone())
            .collect();
        targets.sort();

        let mut applied = VolumeApplication::default();
        for keyword in targets {
            let status = match by_keyword.get(&keyword) {
                Some(hit) => {
                    self.record_volume(&keyword, hit.volume, hit.cpc, hit.competition_index, now)
                }
                None => self
                    .mark_unresolved_zero(&keyword, now)
                    .then_some(KeywordStatus::Zero),
            };
            match status {
                Some(KeywordStatus::Valid) => applied.valid += 1,
                Some(KeywordStatus::Zero) => applied.zero += 1,
                _ => {}
            }
        }
        applied
    }

    pub fn unverified_keywords(&self) -> Vec<String> {
        self.rows
            .iter()
            .filter(|r| r.status == KeywordStatus::Unverified)
            .map(|r| r.keyword_text.clone())
            .collect()
    }

    pub fn valid_rows(&self) -> impl Iterator<Item = &KeywordRow> {
        self.rows.iter().filter(|r| r.is_valid())
    }

    pub fn tallies(&self) -> SnapshotTallies {
        let mut tallies = SnapshotTallies {
            total: self.rows.len(),
            ..Default::default()
        };
        for row in &self.rows {
            match row.status {
                KeywordStatus::Valid if row.active => tallies.valid += 1,
                KeywordStatus::Valid => {}
                KeywordStatus::Zero => tallies.zero += 1,
                KeywordStatus::Unverified => tallies.unverified += 1,
            }
        }
        tallies
    }

    /// Tallies keyed by anchor id; every configured anchor is present even when empty.
    pub fn anchor_tallies(&self) -> BTreeMap<String, AnchorTally> {
        let mut map: BTreeMap<String, AnchorTally> = self
            .anchors
            .iter()
            .map(|a| (a.anchor_id.clone(), AnchorTally::default()))
            .collect();
        for row in &self.rows {
            let tally = map.entry(row.anchor_id.clone()).or_default();
            tally.total += 1;
            match row.status {
                KeywordStatus::Valid if row.active => tally.valid += 1,
                KeywordStatus::Valid => {}
                KeywordStatus::Zero => tally.zero += 1,
                KeywordStatus::Unverified => tally.unverified += 1,
            }
        }
        map
    }

    /// Move to `to`, recording the decision. No-op when already there.
    pub fn transition(&mut self, to: Lifecycle, reason: impl Into<String>, at: DateTime<Utc>) -> bool {
        if self.lifecycle == to {
            return false;
        }
        self.lifecycle_log.push(LifecycleTransition {
            from: self.lifecycle,
            to,
            reason: reason.into(),
            at,
        });
        self.lifecycle = to;
        self.updated_at = at;
        true
    }
}
