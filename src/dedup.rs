//! Near-duplicate detection for short text items (headlines, titles).
//!
//! Similarity is a soft Jaccard index over word sets: two words count as
//! the same if one contains the other, so "regeln" matches
//! "regelnänderung" the way compound-forming languages need.
//!
//! [`cluster_all`] is greedy and seed-based. An item joins a cluster only if
//! it is close enough to the cluster's *seed*, not to any other member, so
//! the grouping is not transitive: C may be close to B and B close to seed
//! A, yet C ends up in a cluster of its own. Downstream consumers depend on
//! this grouping; switching to transitive clustering is a behavior change.

use std::collections::BTreeSet;

use opentelemetry::KeyValue;
use tracing::debug;

use crate::telemetry::metrics;

/// Default match threshold for titles.
pub const DEFAULT_THRESHOLD: f64 = 0.6;

/// Leading labels news sources put in front of the actual headline.
const EDITORIAL_PREFIXES: &[&str] = &[
    "aktuell:",
    "eilmeldung:",
    "breaking:",
    "update:",
    "exklusiv:",
    "liveblog:",
    "video:",
    "kommentar:",
    "analyse:",
    "interview:",
];

/// Words this short carry no signal.
const MIN_TOKEN_CHARS: usize = 3;

fn tokens(text: &str) -> BTreeSet<String> {
    text.to_lowercase()
        .split_whitespace()
        .filter(|t| t.chars().count() >= MIN_TOKEN_CHARS)
        .map(str::to_string)
        .collect()
}

fn soft_match(a: &str, b: &str) -> bool {
    a.contains(b) || b.contains(a)
}

/// Soft Jaccard similarity in `[0, 1]`.
///
/// Tokens are lowercased, whitespace-split words of three or more
/// characters. Each token of the smaller set counts as shared if it is a
/// substring of, or contains, some token of the larger set; the score is
/// `shared / (|small| + |large| - shared)`. The smaller set is picked by
/// size and then by content, so argument order never changes the result.
/// Returns 0.0 when either side has no tokens.
pub fn similarity(a: &str, b: &str) -> f64 {
    let ta = tokens(a);
    let tb = tokens(b);
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }

    let (small, large) = if (ta.len(), &ta) <= (tb.len(), &tb) {
        (&ta, &tb)
    } else {
        (&tb, &ta)
    };

    let shared = small
        .iter()
        .filter(|s| large.iter().any(|l| soft_match(s, l)))
        .count();
    let union = small.len() + large.len() - shared;
    shared as f64 / union as f64
}

fn fold_diacritic(c: char) -> Option<&'static str> {
    Some(match c {
        'ä' | 'à' | 'á' | 'â' | 'ã' | 'å' => "a",
        'ö' | 'ò' | 'ó' | 'ô' | 'õ' | 'ø' => "o",
        'ü' | 'ù' | 'ú' | 'û' => "u",
        'è' | 'é' | 'ê' | 'ë' => "e",
        'ì' | 'í' | 'î' | 'ï' => "i",
        'ç' => "c",
        'ñ' => "n",
        'ý' | 'ÿ' => "y",
        'ß' => "ss",
        _ => return None,
    })
}

/// Normalize a title for comparison.
///
/// Lowercases, strips leading editorial labels ("Aktuell:", "Breaking:",
/// ...), folds common diacritics, drops punctuation, and collapses
/// whitespace.
pub fn normalize_title(title: &str) -> String {
    let lowered = title.to_lowercase();
    let mut rest = lowered.trim_start();
    while let Some(stripped) = EDITORIAL_PREFIXES
        .iter()
        .find_map(|prefix| rest.strip_prefix(prefix))
    {
        rest = stripped.trim_start();
    }

    let mut cleaned = String::with_capacity(rest.len());
    for c in rest.chars() {
        if let Some(folded) = fold_diacritic(c) {
            cleaned.push_str(folded);
        } else if c.is_alphanumeric() || c.is_whitespace() {
            cleaned.push(c);
        }
    }
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// A duplicate found by [`find_duplicate`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DuplicateMatch {
    /// Position in the `existing` slice.
    pub index: usize,
    pub similarity: f64,
}

/// Return the first existing title whose normalized similarity to
/// `candidate` is at least `threshold`.
///
/// First match wins, not best match: when several titles clear the
/// threshold, the order of `existing` decides which one is reported.
pub fn find_duplicate<S: AsRef<str>>(
    candidate: &str,
    existing: &[S],
    threshold: f64,
) -> Option<DuplicateMatch> {
    let candidate = normalize_title(candidate);
    let found = existing.iter().enumerate().find_map(|(index, title)| {
        let similarity = similarity(&candidate, &normalize_title(title.as_ref()));
        (similarity >= threshold).then_some(DuplicateMatch { index, similarity })
    });

    if let Some(m) = found {
        debug!(index = m.index, similarity = m.similarity, "duplicate title");
        metrics::dedup_matches().add(1, &[KeyValue::new("op", "find_duplicate")]);
    }
    found
}

/// Greedy single-pass clustering. Returns clusters as lists of indices
/// into `items`; the first index of each cluster is its seed.
///
/// Items are visited in order. Each unassigned item seeds a new cluster and
/// pulls in every later unassigned item whose similarity to the seed
/// exceeds `threshold`. Every item lands in exactly one cluster.
///
/// Unlike [`find_duplicate`], a score equal to `threshold` does not join.
pub fn cluster_all<S: AsRef<str>>(items: &[S], threshold: f64) -> Vec<Vec<usize>> {
    let normalized: Vec<String> = items
        .iter()
        .map(|item| normalize_title(item.as_ref()))
        .collect();
    let mut assigned = vec![false; items.len()];
    let mut clusters = Vec::new();

    for seed in 0..normalized.len() {
        if assigned[seed] {
            continue;
        }
        assigned[seed] = true;
        let mut cluster = vec![seed];
        for other in seed + 1..normalized.len() {
            if !assigned[other] && similarity(&normalized[seed], &normalized[other]) > threshold {
                assigned[other] = true;
                cluster.push(other);
            }
        }
        if cluster.len() > 1 {
            metrics::dedup_matches().add(
                (cluster.len() - 1) as u64,
                &[KeyValue::new("op", "cluster_all")],
            );
        }
        clusters.push(cluster);
    }
    clusters
}

/// Threshold-carrying front end for callers that pass it around.
#[derive(Debug, Clone, Copy)]
pub struct SimilarityClusterer {
    pub threshold: f64,
}

impl Default for SimilarityClusterer {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
        }
    }
}

impl SimilarityClusterer {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    pub fn find_duplicate<S: AsRef<str>>(
        &self,
        candidate: &str,
        existing: &[S],
    ) -> Option<DuplicateMatch> {
        find_duplicate(candidate, existing, self.threshold)
    }

    pub fn cluster_all<S: AsRef<str>>(&self, items: &[S]) -> Vec<Vec<usize>> {
        cluster_all(items, self.threshold)
    }

    pub fn is_duplicate(&self, a: &str, b: &str) -> bool {
        similarity(&normalize_title(a), &normalize_title(b)) >= self.threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_and_diacritics_are_normalized_away() {
        assert_eq!(
            normalize_title("Aktuell: Neue Regeln für Ukrainer!"),
            "neue regeln fur ukrainer"
        );
        assert_eq!(
            normalize_title("  EILMELDUNG:  Update: Straße gesperrt"),
            "strasse gesperrt"
        );
    }

    #[test]
    fn prefixed_headline_is_a_duplicate() {
        let existing = ["Wetter: Sturm erwartet", "neue regeln fur ukrainer"];
        let m = find_duplicate("Aktuell: Neue Regeln für Ukrainer", &existing, 0.6).unwrap();
        assert_eq!(m.index, 1);
        assert!((m.similarity - 1.0).abs() < 1e-9);
    }

    #[test]
    fn compound_words_match_their_parts() {
        let s = similarity("steuer reform kommt", "steuerreform kommt bald");
        assert!(s > 0.0 && s < 1.0, "{s}");
        assert!(similarity("regeln", "regelnänderung") > 0.99);
    }

    #[test]
    fn similarity_is_symmetric() {
        let pairs = [
            ("abc abcd", "abcde xyz1"),
            ("neue regeln fur ukrainer", "regeln ukrainer"),
            ("the quick brown fox", "quick foxes jump"),
            ("", "something here"),
        ];
        for (a, b) in pairs {
            assert_eq!(similarity(a, b), similarity(b, a), "{a:?} vs {b:?}");
        }
    }

    #[test]
    fn short_tokens_are_ignored() {
        assert_eq!(similarity("an in of", "an in of"), 0.0);
        assert_eq!(similarity("ab cat", "cat xy"), 1.0);
    }

    #[test]
    fn first_match_wins_over_best_match() {
        let existing = ["regeln ukrainer neue heute", "neue regeln fur ukrainer"];
        let m = find_duplicate("neue regeln fur ukrainer", &existing, 0.5).unwrap();
        assert_eq!(m.index, 0);
    }

    #[test]
    fn clustering_compares_against_seed_only() {
        // B is close to both A and C; C is not close to A.
        let items = [
            "alpha beta gamma",
            "alpha beta gamma delta epsilon",
            "beta gamma delta epsilon",
        ];
        assert!(similarity(items[0], items[1]) > 0.5);
        assert!(similarity(items[1], items[2]) > 0.5);
        assert!(similarity(items[0], items[2]) < 0.5);

        let clusters = cluster_all(&items, 0.5);
        assert_eq!(clusters, vec![vec![0, 1], vec![2]]);
    }

    #[test]
    fn score_equal_to_threshold_does_not_join_a_cluster() {
        let items = ["aaa bbb ccc", "aaa bbb ccc ddd eee"];
        assert_eq!(similarity(items[0], items[1]), 0.6);

        assert_eq!(cluster_all(&items, 0.6), vec![vec![0], vec![1]]);
        // find_duplicate is inclusive at the threshold.
        assert_eq!(find_duplicate(items[1], &items[..1], 0.6).map(|m| m.index), Some(0));
    }

    #[test]
    fn every_item_lands_in_exactly_one_cluster() {
        let items = [
            "Aktuell: Neue Regeln für Ukrainer",
            "Sturm über Hamburg",
            "neue regeln fur ukrainer",
            "Breaking: Sturm über Hamburg erwartet",
            "Börse schließt im Plus",
        ];
        let clusters = cluster_all(&items, DEFAULT_THRESHOLD);
        let mut seen: Vec<usize> = clusters.iter().flatten().copied().collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        assert!(clusters.contains(&vec![0, 2]));
        assert!(clusters.contains(&vec![1, 3]));
    }
}
