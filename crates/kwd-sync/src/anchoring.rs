//! Attribute keywords to category anchors.

use kwd_core::{keyword_id, normalize_keyword, Anchor, IntentBucket};
use strsim::jaro_winkler;

pub const FUZZY_TOKEN_THRESHOLD: f64 = 0.92;

fn token_matches(keyword_token: &str, anchor_token: &str) -> bool {
    keyword_token == anchor_token
        || keyword_token.strip_suffix('s') == Some(anchor_token)
        || anchor_token.strip_suffix('s') == Some(keyword_token)
}

/// Pick the anchor for `keyword`.
///
/// Order: exact token match against anchor label/vocabulary, then the best fuzzy
/// token match, then intent routing, then a stable hash spread. `None` only when
/// the category has no anchors.
pub fn infer_anchor(
    category_id: &str,
    keyword: &str,
    anchors: &[Anchor],
    intent: IntentBucket,
) -> Option<String> {
    if anchors.is_empty() {
        return None;
    }
    let normalized = normalize_keyword(keyword);
    let tokens: Vec<&str> = normalized.split(' ').filter(|t| !t.is_empty()).collect();
    let anchor_tokens: Vec<Vec<String>> = anchors.iter().map(Anchor::match_tokens).collect();

    for (anchor, vocab) in anchors.iter().zip(&anchor_tokens) {
        if vocab
            .iter()
            .any(|a| tokens.iter().any(|t| token_matches(t, a)))
        {
            return Some(anchor.anchor_id.clone());
        }
    }

    let mut best: Option<(f64, usize)> = None;
    for (index, vocab) in anchor_tokens.iter().enumerate() {
        for anchor_token in vocab {
            for token in tokens.iter().filter(|t| t.len() > 3) {
                let score = jaro_winkler(token, anchor_token);
                if score >= FUZZY_TOKEN_THRESHOLD && best.map(|(s, _)| score > s).unwrap_or(true) {
                    best = Some((score, index));
                }
            }
        }
    }
    if let Some((_, index)) = best {
        return Some(anchors[index].anchor_id.clone());
    }

    match intent {
        IntentBucket::Decision | IntentBucket::Consideration => {
            return Some(anchors[0].anchor_id.clone())
        }
        IntentBucket::Problem if anchors.len() > 1 => return Some(anchors[1].anchor_id.clone()),
        _ => {}
    }

    let bucket = keyword_id(category_id, &normalized).as_u128() % anchors.len() as u128;
    Some(anchors[bucket as usize].anchor_id.clone())
}
