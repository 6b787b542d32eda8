//! Candidate keyword generation: curated lists, brand/head templates and discovery seeds.

use std::collections::HashSet;

use kwd_core::{normalize_keyword, CategoryConfig};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeedTemplates {
    /// Patterns using `{b}` (brand) and `{h}` (head term).
    pub brand_head: Vec<String>,
    /// Patterns using only `{h}`.
    pub head_only: Vec<String>,
    /// Discovery patterns over head terms.
    pub discovery: Vec<String>,
    pub intent_modifiers: Vec<String>,
    pub max_brands: usize,
    pub max_heads: usize,
    pub discovery_heads: usize,
    pub discovery_brands: usize,
    /// Pool cap per category.
    pub max_candidates: usize,
    pub min_chars: usize,
}

fn owned(words: &[&str]) -> Vec<String> {
    words.iter().map(|w| w.to_string()).collect()
}

impl Default for SeedTemplates {
    fn default() -> Self {
        Self {
            brand_head: owned(&[
                "{b} {h}",
                "{b} {h} price",
                "{b} {h} for men",
                "best {h} {b}",
                "{b} {h} online",
                "{b} {h} review",
                "{h} by {b}",
                "{b} new {h}",
                "{b} {h} combo",
                "{b} {h} kit",
            ]),
            head_only: owned(&[
                "best {h} in india",
                "{h} brands list",
                "{h} price list",
                "top 10 {h}",
            ]),
            discovery: owned(&["{h}", "{h} for men", "best {h}", "{h} india"]),
            intent_modifiers: owned(&[
                "price",
                "review",
                "vs",
                "alternative",
                "side effects",
                "how to use",
                "benefits",
                "for sensitive skin",
                "natural",
                "affordable",
                "premium",
                "recommended",
                "dermatologist",
            ]),
            max_brands: 25,
            max_heads: 15,
            discovery_heads: 8,
            discovery_brands: 10,
            max_candidates: 5000,
            min_chars: 5,
        }
    }
}

fn fill(template: &str, brand: Option<&str>, head: &str) -> String {
    let mut out = template.replace("{h}", head);
    if let Some(brand) = brand {
        out = out.replace("{b}", brand);
    }
    out
}

fn push_unique(out: &mut Vec<String>, seen: &mut HashSet<String>, raw: &str) {
    let normalized = normalize_keyword(raw);
    if !normalized.is_empty() && seen.insert(normalized.clone()) {
        out.push(normalized);
    }
}

/// Rotating slice of `pool` starting at `attempt * limit`, skipping anything in `existing`.
fn rotate(pool: &[String], existing: &HashSet<String>, attempt: usize, limit: usize) -> Vec<String> {
    if pool.is_empty() || limit == 0 {
        return Vec::new();
    }
    let offset = attempt.saturating_mul(limit) % pool.len();
    pool.iter()
        .cycle()
        .skip(offset)
        .take(pool.len())
        .filter(|k| !existing.contains(*k))
        .take(limit)
        .cloned()
        .collect()
}

#[derive(Debug, Clone, Default)]
pub struct SeedGenerator {
    templates: SeedTemplates,
}

impl SeedGenerator {
    pub fn new(templates: SeedTemplates) -> Self {
        Self { templates }
    }

    /// Ordered, normalized, de-duplicated candidate pool: curated seeds first, then template expansions.
    pub fn candidate_pool(&self, category: &CategoryConfig) -> Vec<String> {
        let t = &self.templates;
        let mut out = Vec::new();
        let mut seen = HashSet::new();

        for seed in &category.curated_seeds {
            push_unique(&mut out, &mut seen, seed);
        }

        let heads: Vec<&str> = category
            .head_terms
            .iter()
            .take(t.max_heads)
            .map(String::as_str)
            .collect();
        let brands: Vec<&str> = category
            .brand_packs
            .iter()
            .take(t.max_brands)
            .map(String::as_str)
            .collect();

        let mut expanded = Vec::new();
        for brand in &brands {
            for head in &heads {
                for template in &t.brand_head {
                    expanded.push(fill(template, Some(*brand), head));
                }
            }
        }
        for head in &heads {
            for template in &t.head_only {
                expanded.push(fill(template, None, head));
            }
        }

        for candidate in expanded {
            let normalized = normalize_keyword(&candidate);
            if normalized.chars().count() < t.min_chars || !normalized.contains(' ') {
                continue;
            }
            push_unique(&mut out, &mut seen, &normalized);
        }

        out.truncate(t.max_candidates);
        out
    }

    /// Up to `limit` unseen candidates; `attempt` rotates the starting point.
    pub fn generate(
        &self,
        category: &CategoryConfig,
        existing: &HashSet<String>,
        attempt: usize,
        limit: usize,
    ) -> Vec<String> {
        rotate(&self.candidate_pool(category), existing, attempt, limit)
    }

    /// Seeds for the resolver's keyword-discovery endpoint.
    pub fn discovery_seeds(&self, category: &CategoryConfig) -> Vec<String> {
        let t = &self.templates;
        let mut out = Vec::new();
        let mut seen = HashSet::new();

        for head in &category.head_terms {
            for template in &t.discovery {
                push_unique(&mut out, &mut seen, &fill(template, None, head));
            }
        }
        for head in category.head_terms.iter().take(t.discovery_heads) {
            for modifier in &t.intent_modifiers {
                push_unique(&mut out, &mut seen, &format!("{head} {modifier}"));
            }
        }
        if let Some(first_head) = category.head_terms.first() {
            for brand in category.brand_packs.iter().take(t.discovery_brands) {
                push_unique(&mut out, &mut seen, &format!("{brand} {first_head}"));
                push_unique(&mut out, &mut seen, &format!("{brand} products"));
            }
        }
        for problem in &category.problem_seeds {
            push_unique(&mut out, &mut seen, problem);
        }
        out
    }

    pub fn discovery_slice(
        &self,
        category: &CategoryConfig,
        attempt: usize,
        per_pass: usize,
    ) -> Vec<String> {
        rotate(&self.discovery_seeds(category), &HashSet::new(), attempt, per_pass)
    }
}
