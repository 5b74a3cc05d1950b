//! Identity matching of candidates against the canonical collection.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use anyhow::{Context, Result};
use cfp_core::Event;
use serde::{Deserialize, Serialize};
use strsim::normalized_levenshtein;

#[derive(Debug, Clone, Copy)]
pub struct MatcherConfig {
    /// Scores at or above this merge automatically.
    pub auto_match_threshold: f64,
    /// Scores in `[review_threshold, auto_match_threshold)` go to the review queue.
    pub review_threshold: f64,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            auto_match_threshold: 85.0,
            review_threshold: 60.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MatchOutcome {
    Matched { index: usize, score: f64 },
    Ambiguous { index: usize, score: f64 },
    New { best_score: f64 },
}

#[derive(Debug, Clone, Deserialize)]
struct AliasRulesFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    rules: Vec<AliasRule>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AliasRule {
    pub canonical: String,
    pub variants: Vec<String>,
}

/// Variant match key -> canonical match key.
#[derive(Debug, Clone, Default)]
pub struct AliasTable {
    entries: HashMap<String, String>,
}

impl AliasTable {
    pub fn from_rules(rules: &[AliasRule]) -> Self {
        let mut entries = HashMap::new();
        for rule in rules {
            let canonical = fold_name(&rule.canonical);
            for variant in &rule.variants {
                entries.insert(fold_name(variant), canonical.clone());
            }
        }
        Self { entries }
    }

    /// Reads `rules/aliases.yaml`; a workspace without the file has no aliases.
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join("rules").join("aliases.yaml");
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let file: AliasRulesFile =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Self::from_rules(&file.rules))
    }
}

/// Lowercase, punctuation to spaces, country abbreviations expanded and
/// filler tokens dropped.
fn fold_name(name: &str) -> String {
    let lowered: String = name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    let mut tokens: Vec<&str> = Vec::new();
    for token in lowered.split_whitespace() {
        match token {
            "us" | "usa" => tokens.extend(["united", "states"]),
            "uk" => tokens.extend(["united", "kingdom"]),
            "conference" | "conf" | "the" => {}
            other => tokens.push(other),
        }
    }
    tokens.join(" ")
}

fn sorted_tokens(key: &str) -> String {
    let mut tokens: Vec<&str> = key.split_whitespace().collect();
    tokens.sort_unstable();
    tokens.join(" ")
}

fn round_score(raw: f64) -> f64 {
    (raw * 100.0).round() / 100.0
}

/// Per-year candidate lists plus the exact identity-key lookup.
#[derive(Debug, Clone, Default)]
pub struct YearIndex {
    by_year: BTreeMap<i32, Vec<usize>>,
    by_key: HashMap<String, Vec<usize>>,
}

impl YearIndex {
    pub fn build(events: &[Event]) -> Self {
        let mut index = Self::default();
        for (position, event) in events.iter().enumerate() {
            index.insert(position, event);
        }
        index
    }

    pub fn insert(&mut self, position: usize, event: &Event) {
        self.by_year.entry(event.year).or_default().push(position);
        self.by_key
            .entry(event.identity_key())
            .or_default()
            .push(position);
    }

    /// Re-point the identity key after a merge renamed the record at `position`.
    pub fn rekey(&mut self, position: usize, old_key: &str, event: &Event) {
        if let Some(slots) = self.by_key.get_mut(old_key) {
            slots.retain(|p| *p != position);
        }
        self.by_key
            .entry(event.identity_key())
            .or_default()
            .push(position);
    }

    pub fn same_year(&self, year: i32) -> &[usize] {
        self.by_year.get(&year).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn exact(&self, identity_key: &str) -> &[usize] {
        self.by_key
            .get(identity_key)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default)]
pub struct IdentityMatcher {
    config: MatcherConfig,
    aliases: AliasTable,
}

impl IdentityMatcher {
    pub fn new(config: MatcherConfig, aliases: AliasTable) -> Self {
        Self { config, aliases }
    }

    /// Comparison key for a display name, after alias resolution.
    pub fn match_key(&self, name: &str) -> String {
        let folded = fold_name(name);
        self.aliases.entries.get(&folded).cloned().unwrap_or(folded)
    }

    /// Similarity on a 0..=100 scale, order-insensitive on tokens.
    pub fn similarity(&self, a: &str, b: &str) -> f64 {
        let (a, b) = (self.match_key(a), self.match_key(b));
        if a.is_empty() || b.is_empty() {
            return 0.0;
        }
        if a == b {
            return 100.0;
        }
        let direct = normalized_levenshtein(&a, &b);
        let reordered = normalized_levenshtein(&sorted_tokens(&a), &sorted_tokens(&b));
        round_score(direct.max(reordered) * 100.0)
    }

    /// Classify `candidate` against `collection`. Only same-year records are
    /// considered; an exact identity key short-circuits scoring.
    pub fn find_match(&self, candidate: &Event, collection: &[Event], index: &YearIndex) -> MatchOutcome {
        let exact = index.exact(&candidate.identity_key());
        if let Some(best) = pick_preferred(exact.iter().copied(), collection) {
            return MatchOutcome::Matched {
                index: best,
                score: 100.0,
            };
        }

        let scored: Vec<(usize, f64)> = index
            .same_year(candidate.year)
            .iter()
            .map(|&position| (position, self.similarity(&candidate.name, &collection[position].name)))
            .collect();
        let best_score = scored.iter().map(|(_, s)| *s).fold(0.0, f64::max);
        if best_score < self.config.review_threshold {
            return MatchOutcome::New { best_score };
        }
        let top = scored
            .iter()
            .filter(|(_, s)| *s == best_score)
            .map(|(position, _)| *position);
        let Some(index) = pick_preferred(top, collection) else {
            return MatchOutcome::New { best_score };
        };
        if best_score >= self.config.auto_match_threshold {
            MatchOutcome::Matched {
                index,
                score: best_score,
            }
        } else {
            MatchOutcome::Ambiguous {
                index,
                score: best_score,
            }
        }
    }
}

/// Tie-break: most sources first, then the earliest first-seen date, then position.
fn pick_preferred(positions: impl Iterator<Item = usize>, collection: &[Event]) -> Option<usize> {
    positions.min_by(|&a, &b| {
        let (ea, eb) = (&collection[a], &collection[b]);
        eb.source_provenance
            .len()
            .cmp(&ea.source_provenance.len())
            .then_with(|| match (ea.first_seen, eb.first_seen) {
                (Some(x), Some(y)) => x.cmp(&y),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            })
            .then_with(|| a.cmp(&b))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn matcher() -> IdentityMatcher {
        IdentityMatcher::default()
    }

    fn event(name: &str, year: i32) -> Event {
        Event::new(name, year)
    }

    #[test]
    fn country_abbreviations_fold_to_the_long_form() {
        let m = matcher();
        assert_eq!(m.match_key("PyCon US"), "pycon united states");
        assert_eq!(m.match_key("PyCon USA"), m.match_key("PyCon United States"));
        assert_eq!(m.similarity("PyCon US", "PyCon United States"), 100.0);
        assert_eq!(m.match_key("The Python Conference"), "python");
    }

    #[test]
    fn spacing_differences_score_high() {
        let score = matcher().similarity("EuroPython", "Euro Python");
        assert!(score >= 85.0, "{score}");
    }

    #[test]
    fn token_order_does_not_matter() {
        assert_eq!(matcher().similarity("Berlin PyData", "PyData Berlin"), 100.0);
    }

    #[test]
    fn different_regional_editions_stay_apart() {
        let m = matcher();
        assert!(m.similarity("PyCon US", "PyCon DE") < 60.0);
        assert!(m.similarity("DjangoCon Europe", "DjangoCon US") < 85.0);
    }

    #[test]
    fn aliases_resolve_before_scoring() {
        let table = AliasTable::from_rules(&[AliasRule {
            canonical: "PyCon US".into(),
            variants: vec!["PyCon North America".into()],
        }]);
        let m = IdentityMatcher::new(MatcherConfig::default(), table);
        assert_eq!(m.similarity("PyCon North America", "PyCon US"), 100.0);
    }

    #[test]
    fn exact_identity_short_circuits() {
        let collection = vec![event("PyCon US", 2024), event("PyCon US", 2025)];
        let index = YearIndex::build(&collection);
        let outcome = matcher().find_match(&event("pycon us", 2025), &collection, &index);
        assert_eq!(outcome, MatchOutcome::Matched { index: 1, score: 100.0 });
    }

    #[test]
    fn other_years_are_never_candidates() {
        let collection = vec![event("PyCon US", 2024)];
        let index = YearIndex::build(&collection);
        let outcome = matcher().find_match(&event("PyCon US", 2025), &collection, &index);
        assert_eq!(outcome, MatchOutcome::New { best_score: 0.0 });
    }

    #[test]
    fn middle_band_is_ambiguous() {
        let collection = vec![event("PyData Berlin", 2025)];
        let index = YearIndex::build(&collection);
        let outcome = matcher().find_match(&event("PyData Berlin Summit", 2025), &collection, &index);
        assert_eq!(outcome, MatchOutcome::Ambiguous { index: 0, score: 65.0 });
    }

    #[test]
    fn ties_prefer_more_sources_then_earlier_first_seen() {
        let mut a = event("Euro Python", 2025);
        a.first_seen = NaiveDate::from_ymd_opt(2025, 1, 2);
        let mut b = event("Euro-Python", 2025);
        b.first_seen = NaiveDate::from_ymd_opt(2025, 1, 1);
        let collection = vec![a.clone(), b.clone()];
        let index = YearIndex::build(&collection);
        let candidate = event("EuroPython", 2025);
        match matcher().find_match(&candidate, &collection, &index) {
            MatchOutcome::Matched { index, .. } => assert_eq!(index, 1),
            other => panic!("unexpected {other:?}"),
        }

        a.source_provenance.extend(["s1".to_string(), "s2".to_string()]);
        let collection = vec![a, b];
        let index = YearIndex::build(&collection);
        match matcher().find_match(&candidate, &collection, &index) {
            MatchOutcome::Matched { index, .. } => assert_eq!(index, 0),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn rekey_moves_exact_lookup() {
        let mut collection = vec![event("PyCon", 2025)];
        let mut index = YearIndex::build(&collection);
        let old = collection[0].identity_key();
        collection[0].name = "PyCon US".into();
        index.rekey(0, &old, &collection[0]);
        assert!(index.exact("pycon2025").is_empty());
        assert_eq!(index.exact("pycon us2025"), &[0]);
    }
}
