//! Category specificity guard.
//!
//! Rules run in a fixed order and the first rejection wins:
//! `EMPTY`, `UNKNOWN_CATEGORY`, `TOO_SHORT`, `YEAR_TOKEN`, `BLOCKED_TERM`,
//! `SINGLE_TOKEN_UNKNOWN`, `GENERIC_COMPOSITION`, `BRAND_GENERIC`,
//! `NOT_CATEGORY_SPECIFIC`. The three noise rules (`TOO_SHORT`, `YEAR_TOKEN`,
//! `BLOCKED_TERM`) are all evaluated so a verdict lists every one that fired.

use std::collections::HashMap;

use kwd_core::{normalize_keyword, CategoryConfig};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct YearRange {
    pub min: u16,
    pub max: u16,
}

impl Default for YearRange {
    fn default() -> Self {
        Self {
            min: 2010,
            max: 2035,
        }
    }
}

/// Deployment-wide guard vocabulary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardTables {
    pub min_length: usize,
    pub year_range: YearRange,
    pub generic_terms: Vec<String>,
    pub stopwords: Vec<String>,
    pub commerce_terms: Vec<String>,
    /// Terms belonging to an orthogonal audience; merged with each category's own list.
    pub blocked_terms: Vec<String>,
}

fn owned(words: &[&str]) -> Vec<String> {
    words.iter().map(|w| w.to_string()).collect()
}

impl Default for GuardTables {
    fn default() -> Self {
        Self {
            min_length: 3,
            year_range: YearRange::default(),
            generic_terms: owned(&[
                "india", "online", "price", "review", "reviews", "offer", "offers", "benefit",
                "benefits", "best", "top", "cheap", "buy", "sale", "near me", "shop", "store",
                "cost", "how to", "what is", "years", "vs", "compare", "list", "guide", "men",
                "for men", "shopping", "products",
            ]),
            stopwords: owned(&["in", "for", "the", "and", "to", "with", "of", "on", "at", "by"]),
            commerce_terms: owned(&[
                "price", "cost", "buy", "online", "review", "reviews", "offer", "offers", "sale",
                "shop", "store", "best", "top", "products", "range", "combo", "kit", "new",
                "latest", "compare", "vs", "alternative", "near me",
            ]),
            blocked_terms: owned(&[
                "women", "womens", "woman", "female", "ladies", "girl", "girls", "she", "her",
                "bridal", "bride", "maternity", "pregnancy", "mom", "mother", "sister", "wife",
                "saree", "kurta", "lehenga", "makeup", "lipstick", "mascara", "foundation",
                "eyeliner", "blush", "bra", "panty", "lingerie", "sanitary", "period", "menstrual",
            ]),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GuardReason {
    Ok,
    Empty,
    UnknownCategory,
    TooShort,
    YearToken,
    BlockedTerm,
    SingleTokenUnknown,
    GenericComposition,
    BrandGeneric,
    NotCategorySpecific,
}

impl GuardReason {
    pub fn as_str(self) -> &'static str {
        match self {
            GuardReason::Ok => "OK",
            GuardReason::Empty => "EMPTY",
            GuardReason::UnknownCategory => "UNKNOWN_CATEGORY",
            GuardReason::TooShort => "TOO_SHORT",
            GuardReason::YearToken => "YEAR_TOKEN",
            GuardReason::BlockedTerm => "BLOCKED_TERM",
            GuardReason::SingleTokenUnknown => "SINGLE_TOKEN_UNKNOWN",
            GuardReason::GenericComposition => "GENERIC_COMPOSITION",
            GuardReason::BrandGeneric => "BRAND_GENERIC",
            GuardReason::NotCategorySpecific => "NOT_CATEGORY_SPECIFIC",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardVerdict {
    pub ok: bool,
    pub reason: GuardReason,
    /// Every noise rule that fired, in precedence order. `reason` is the first.
    pub triggered: Vec<GuardReason>,
    pub matched: Option<String>,
}

impl GuardVerdict {
    fn accept() -> Self {
        Self {
            ok: true,
            reason: GuardReason::Ok,
            triggered: Vec::new(),
            matched: None,
        }
    }

    fn reject(reason: GuardReason, matched: Option<String>) -> Self {
        Self {
            ok: false,
            reason,
            triggered: vec![reason],
            matched,
        }
    }
}

#[derive(Debug, Clone)]
struct CategoryVocabulary {
    heads: Vec<String>,
    brands: Vec<String>,
    blocked: Vec<String>,
}

/// Pure keyword filter; all tables are fixed at construction.
#[derive(Debug, Clone)]
pub struct GuardFilter {
    tables: GuardTables,
    categories: HashMap<String, CategoryVocabulary>,
}

/// Space-padded so phrase containment respects token boundaries.
fn padded(text: &str) -> String {
    format!(" {text} ")
}

fn contains_phrase(haystack_padded: &str, phrase: &str) -> bool {
    !phrase.is_empty() && haystack_padded.contains(&padded(phrase))
}

fn normalized_list(items: &[String]) -> Vec<String> {
    let mut out: Vec<String> = items
        .iter()
        .map(|s| normalize_keyword(s))
        .filter(|s| !s.is_empty())
        .collect();
    // Longest first so multi-word phrases are stripped before their parts.
    out.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
    out.dedup();
    out
}

fn strip_phrases(text_padded: &str, phrases: &[String]) -> String {
    let mut out = text_padded.to_string();
    for phrase in phrases {
        let needle = padded(phrase);
        while out.contains(&needle) {
            out = out.replacen(&needle, " ", 1);
        }
    }
    out
}

impl GuardFilter {
    pub fn new(tables: GuardTables, categories: &[CategoryConfig]) -> Self {
        let global_blocked = tables.blocked_terms.clone();
        let categories = categories
            .iter()
            .map(|c| {
                let mut blocked = global_blocked.clone();
                blocked.extend(c.blocked_terms.iter().cloned());
                (
                    c.id.clone(),
                    CategoryVocabulary {
                        heads: normalized_list(&c.head_terms),
                        brands: normalized_list(&c.brand_packs),
                        blocked: normalized_list(&blocked),
                    },
                )
            })
            .collect();
        let tables = GuardTables {
            generic_terms: normalized_list(&tables.generic_terms),
            stopwords: normalized_list(&tables.stopwords),
            commerce_terms: normalized_list(&tables.commerce_terms),
            blocked_terms: normalized_list(&tables.blocked_terms),
            ..tables
        };
        Self { tables, categories }
    }

    pub fn tables(&self) -> &GuardTables {
        &self.tables
    }

    fn year_token(&self, tokens: &[&str]) -> Option<String> {
        let range = self.tables.year_range;
        tokens
            .iter()
            .find(|t| {
                t.len() == 4
                    && t.chars().all(|c| c.is_ascii_digit())
                    && t.parse::<u16>()
                        .map(|y| y >= range.min && y <= range.max)
                        .unwrap_or(false)
            })
            .map(|t| t.to_string())
    }

    fn is_filler(&self, token: &str) -> bool {
        self.tables.stopwords.iter().any(|s| s == token)
            || self.tables.generic_terms.iter().any(|g| g == token)
    }

    pub fn is_specific(&self, keyword: &str, category_id: &str) -> GuardVerdict {
        let normalized = normalize_keyword(keyword);
        if normalized.is_empty() {
            return GuardVerdict::reject(GuardReason::Empty, None);
        }
        let Some(vocab) = self.categories.get(category_id) else {
            return GuardVerdict::reject(GuardReason::UnknownCategory, Some(category_id.to_string()));
        };

        let text = padded(&normalized);
        let tokens: Vec<&str> = normalized.split(' ').collect();

        let mut triggered = Vec::new();
        let mut matched = None;
        if normalized.chars().count() < self.tables.min_length {
            triggered.push(GuardReason::TooShort);
        }
        if let Some(year) = self.year_token(&tokens) {
            triggered.push(GuardReason::YearToken);
            matched = Some(year);
        }
        if let Some(term) = vocab.blocked.iter().find(|b| contains_phrase(&text, b)) {
            triggered.push(GuardReason::BlockedTerm);
            if matched.is_none() {
                matched = Some(term.clone());
            }
        }
        if let Some(first) = triggered.first().copied() {
            return GuardVerdict {
                ok: false,
                reason: first,
                triggered,
                matched,
            };
        }

        let head = vocab.heads.iter().find(|h| contains_phrase(&text, h));
        let brand = vocab.brands.iter().find(|b| contains_phrase(&text, b));

        if tokens.len() == 1 {
            return match head.or(brand) {
                Some(hit) if hit == &normalized => GuardVerdict::accept(),
                _ => GuardVerdict::reject(GuardReason::SingleTokenUnknown, None),
            };
        }

        let remainder = strip_phrases(&text, &self.tables.generic_terms);
        if remainder.split_whitespace().all(|t| self.is_filler(t)) {
            return GuardVerdict::reject(GuardReason::GenericComposition, None);
        }

        if head.is_some() {
            return GuardVerdict::accept();
        }

        if let Some(brand) = brand {
            let rest = strip_phrases(&text, std::slice::from_ref(brand));
            let rest_tokens: Vec<&str> = rest
                .split_whitespace()
                .filter(|t| !self.tables.stopwords.iter().any(|s| s == t))
                .collect();
            if rest_tokens.is_empty() {
                return GuardVerdict::accept();
            }
            let rest_padded = padded(&rest_tokens.join(" "));
            if self
                .tables
                .commerce_terms
                .iter()
                .any(|c| contains_phrase(&rest_padded, c))
            {
                return GuardVerdict::accept();
            }
            let generic_rest = strip_phrases(&rest_padded, &self.tables.generic_terms);
            if generic_rest.split_whitespace().all(|t| self.is_filler(t)) {
                return GuardVerdict::reject(GuardReason::BrandGeneric, Some(brand.clone()));
            }
            return GuardVerdict::accept();
        }

        GuardVerdict::reject(GuardReason::NotCategorySpecific, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kwd_core::Anchor;

    fn shaving() -> CategoryConfig {
        CategoryConfig {
            id: "shaving".into(),
            display_name: "Shaving".into(),
            anchors: vec![Anchor {
                anchor_id: "razors".into(),
                label: "Razors".into(),
                vocabulary: vec![],
            }],
            curated_seeds: vec![],
            head_terms: owned(&["razor", "trimmer", "shaving cream", "shaving", "blade"]),
            brand_packs: owned(&["gillette", "philips", "bombay shaving company"]),
            problem_seeds: vec![],
            blocked_terms: owned(&["epilator"]),
            benchmark: None,
        }
    }

    fn guard() -> GuardFilter {
        GuardFilter::new(GuardTables::default(), &[shaving()])
    }

    #[test]
    fn off_topic_year_keyword_reports_year_first_and_lists_both_rules() {
        let verdict = guard().is_specific("lipstick for women 2024", "shaving");
        assert!(!verdict.ok);
        assert_eq!(verdict.reason, GuardReason::YearToken);
        assert_eq!(
            verdict.triggered,
            vec![GuardReason::YearToken, GuardReason::BlockedTerm]
        );
        assert_eq!(verdict.reason.as_str(), "YEAR_TOKEN");
    }

    #[test]
    fn precedence_is_fixed() {
        let g = guard();
        assert_eq!(g.is_specific("   ", "shaving").reason, GuardReason::Empty);
        assert_eq!(g.is_specific("razor", "dental").reason, GuardReason::UnknownCategory);
        assert_eq!(g.is_specific("ab", "shaving").reason, GuardReason::TooShort);
        assert_eq!(g.is_specific("razor 2026", "shaving").reason, GuardReason::YearToken);
        assert_eq!(g.is_specific("razor for her", "shaving").reason, GuardReason::BlockedTerm);
        assert_eq!(g.is_specific("epilator", "shaving").reason, GuardReason::BlockedTerm);
        assert_eq!(g.is_specific("comb", "shaving").reason, GuardReason::SingleTokenUnknown);
        assert_eq!(
            g.is_specific("best price online", "shaving").reason,
            GuardReason::GenericComposition
        );
        assert_eq!(g.is_specific("gillette india", "shaving").reason, GuardReason::BrandGeneric);
        assert_eq!(
            g.is_specific("hair wax styling", "shaving").reason,
            GuardReason::NotCategorySpecific
        );
    }

    #[test]
    fn specific_keywords_pass() {
        let g = guard();
        for keyword in [
            "razor",
            "gillette",
            "gillette razor",
            "best trimmer under 2000",
            "gillette price",
            "bombay shaving company products",
            "philips oneblade",
            "shaving cream for sensitive skin",
        ] {
            let verdict = g.is_specific(keyword, "shaving");
            assert!(verdict.ok, "{keyword} rejected with {:?}", verdict.reason);
            assert_eq!(verdict.reason.as_str(), "OK");
        }
    }

    #[test]
    fn verdicts_are_deterministic() {
        let g = guard();
        for keyword in ["lipstick for women 2024", "gillette india", "razor", "", "x"] {
            assert_eq!(g.is_specific(keyword, "shaving"), g.is_specific(keyword, "shaving"));
        }
    }
}
