//! Sequential fold of normalized candidates into the canonical collection.
//!
//! Matching and merging are order-sensitive, so this stage is a plain loop
//! over candidates; the parallel stages run before and after it.

use std::collections::{BTreeMap, BTreeSet};

use cfp_core::Event;
use chrono::NaiveDate;
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::lifecycle::sort_archive_year;
use crate::matcher::{IdentityMatcher, MatchOutcome, YearIndex};
use crate::merge::{insert_new, merge_into, NameDiscrepancy, SourcePolicy};
use crate::validate::{validate, Violation};

#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub source_id: String,
    pub origin: Uuid,
    pub event: Event,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Contributor {
    pub source_id: String,
    pub origin: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReviewItem {
    AmbiguousMatch {
        source_id: String,
        origin: Uuid,
        score: f64,
        existing_name: String,
        existing_year: i32,
        archived: bool,
        candidate: Event,
    },
    /// The record every contributor folded into this run failed validation.
    Invalid {
        contributors: Vec<Contributor>,
        violations: Vec<Violation>,
        candidate: Event,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileCounts {
    pub inserted: usize,
    pub merged: usize,
    pub unchanged: usize,
    pub flagged: usize,
    pub invalid: usize,
    /// Source records for events already archived; left untouched.
    pub archived_skipped: usize,
    /// Curated corrections applied to archived events.
    pub archive_corrections: usize,
}

#[derive(Debug, Clone, Default)]
pub struct Reconciliation {
    pub collection: Vec<Event>,
    pub review: Vec<ReviewItem>,
    pub discrepancies: Vec<NameDiscrepancy>,
    pub counts: ReconcileCounts,
    pub archive_years_touched: BTreeSet<i32>,
}

/// A collection slot changed during this run, with what it was before.
#[derive(Debug)]
struct Touched {
    original: Option<Event>,
    contributors: Vec<Contributor>,
    merges: usize,
}

pub fn reconcile(
    canonical: Vec<Event>,
    archive: &mut BTreeMap<i32, Vec<Event>>,
    candidates: Vec<Candidate>,
    matcher: &IdentityMatcher,
    policy: &SourcePolicy,
    run_date: NaiveDate,
) -> Reconciliation {
    let mut out = Reconciliation {
        collection: canonical,
        ..Reconciliation::default()
    };
    let mut index = YearIndex::build(&out.collection);
    let mut touched: BTreeMap<usize, Touched> = BTreeMap::new();

    for Candidate {
        source_id,
        origin,
        event,
    } in candidates
    {
        if correct_archived(archive, &event, &source_id, origin, matcher, policy, &mut out) {
            continue;
        }

        let contributor = Contributor { source_id, origin };
        match matcher.find_match(&event, &out.collection, &index) {
            MatchOutcome::Matched { index: position, score } => {
                let before = &out.collection[position];
                let outcome = merge_into(before, &event, &contributor.source_id, policy);
                if let Some(discrepancy) = outcome.discrepancy.clone() {
                    out.discrepancies.push(discrepancy);
                }
                if outcome.is_unchanged(before) {
                    out.counts.unchanged += 1;
                    continue;
                }
                debug!(
                    name = %outcome.event.name,
                    year = outcome.event.year,
                    score,
                    changed = ?outcome.changed_fields,
                    "merged candidate"
                );
                let old_key = before.identity_key();
                let slot = touched.entry(position).or_insert_with(|| Touched {
                    original: Some(before.clone()),
                    contributors: Vec::new(),
                    merges: 0,
                });
                slot.contributors.push(contributor);
                slot.merges += 1;
                out.collection[position] = outcome.event;
                index.rekey(position, &old_key, &out.collection[position]);
            }
            MatchOutcome::Ambiguous { index: position, score } => {
                let existing = &out.collection[position];
                out.counts.flagged += 1;
                out.review.push(ReviewItem::AmbiguousMatch {
                    source_id: contributor.source_id,
                    origin: contributor.origin,
                    score,
                    existing_name: existing.name.clone(),
                    existing_year: existing.year,
                    archived: false,
                    candidate: event,
                });
            }
            MatchOutcome::New { .. } => {
                let fresh = insert_new(&event, &contributor.source_id, policy, run_date);
                let position = out.collection.len();
                index.insert(position, &fresh);
                out.collection.push(fresh);
                touched.insert(
                    position,
                    Touched {
                        original: None,
                        contributors: vec![contributor],
                        merges: 0,
                    },
                );
            }
        }
    }

    settle(&mut out, touched);
    out
}

/// Validate every record the fold changed. Failures fall back to their
/// pre-run version, or drop out if the run created them, and go to review.
fn settle(out: &mut Reconciliation, touched: BTreeMap<usize, Touched>) {
    let mut dropped = BTreeSet::new();
    for (position, slot) in touched {
        let violations = validate(&out.collection[position]);
        if violations.is_empty() {
            match slot.original {
                Some(_) => out.counts.merged += slot.merges,
                None => {
                    out.counts.inserted += 1;
                    out.counts.merged += slot.merges;
                }
            }
            continue;
        }
        out.counts.invalid += 1;
        let candidate = match slot.original {
            Some(original) => std::mem::replace(&mut out.collection[position], original),
            None => {
                dropped.insert(position);
                out.collection[position].clone()
            }
        };
        out.review.push(ReviewItem::Invalid {
            contributors: slot.contributors,
            violations,
            candidate,
        });
    }
    if !dropped.is_empty() {
        let mut position = 0;
        out.collection.retain(|_| {
            let keep = !dropped.contains(&position);
            position += 1;
            keep
        });
    }
}

/// Archived events are immutable except for curated corrections. Returns true
/// when the candidate belongs to, or may belong to, an archived event.
fn correct_archived(
    archive: &mut BTreeMap<i32, Vec<Event>>,
    event: &Event,
    source_id: &str,
    origin: Uuid,
    matcher: &IdentityMatcher,
    policy: &SourcePolicy,
    out: &mut Reconciliation,
) -> bool {
    let Some(year) = archive.get_mut(&event.year) else {
        return false;
    };
    let index = YearIndex::build(year.as_slice());
    let position = match matcher.find_match(event, year.as_slice(), &index) {
        MatchOutcome::New { .. } => return false,
        MatchOutcome::Ambiguous { index: position, score } => {
            let existing = &year[position];
            out.counts.flagged += 1;
            out.review.push(ReviewItem::AmbiguousMatch {
                source_id: source_id.to_string(),
                origin,
                score,
                existing_name: existing.name.clone(),
                existing_year: existing.year,
                archived: true,
                candidate: event.clone(),
            });
            return true;
        }
        MatchOutcome::Matched { index: position, .. } => position,
    };
    if !event.manually_edited {
        out.counts.archived_skipped += 1;
        return true;
    }
    let archived = &year[position];
    let outcome = merge_into(archived, event, source_id, policy);
    if outcome.is_unchanged(archived) {
        return true;
    }
    let violations = validate(&outcome.event);
    if !violations.is_empty() {
        out.counts.invalid += 1;
        out.review.push(ReviewItem::Invalid {
            contributors: vec![Contributor {
                source_id: source_id.to_string(),
                origin,
            }],
            violations,
            candidate: outcome.event,
        });
        return true;
    }
    year[position] = outcome.event;
    out.counts.archive_corrections += 1;
    out.archive_years_touched.insert(event.year);
    sort_archive_year(year);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::{archive_into, partition};
    use cfp_core::{Deadline, FieldCategory, SubmissionType};
    use chrono::NaiveDateTime;

    fn run_date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, 1).unwrap()
    }

    fn at(raw: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    fn complete(name: &str, deadline: &str) -> Event {
        let mut e = Event::new(name, 2025);
        e.primary_url = Some("https://example.org/2025/".into());
        e.cfp_deadline = Some(Deadline::At(at(deadline)));
        e.location_text = Some("Berlin, Germany".into());
        e.start_date = NaiveDate::from_ymd_opt(2025, 4, 22);
        e.end_date = NaiveDate::from_ymd_opt(2025, 4, 24);
        e.submission_types.insert(SubmissionType::Talks);
        e
    }

    fn candidate(source_id: &str, event: Event) -> Candidate {
        Candidate {
            source_id: source_id.into(),
            origin: Uuid::nil(),
            event,
        }
    }

    fn policy() -> SourcePolicy {
        SourcePolicy::default()
            .with_source("official", 10, [FieldCategory::Dates])
            .with_source("community", 1, [])
    }

    #[test]
    fn near_duplicates_across_sources_collapse() {
        let mut archive = BTreeMap::new();
        let out = reconcile(
            Vec::new(),
            &mut archive,
            vec![
                candidate("community", complete("PyCon US", "2025-01-10 23:59:00")),
                candidate("official", complete("PyCon United States", "2025-01-15 23:59:00")),
            ],
            &IdentityMatcher::default(),
            &policy(),
            run_date(),
        );
        assert_eq!(out.collection.len(), 1);
        assert_eq!(out.counts.inserted, 1);
        assert_eq!(out.counts.merged, 1);
        let event = &out.collection[0];
        assert_eq!(event.name, "PyCon US");
        assert_eq!(event.cfp_deadline, Some(Deadline::At(at("2025-01-15 23:59:00"))));
        assert_eq!(event.source_provenance.len(), 2);
        assert_eq!(out.discrepancies.len(), 1);
    }

    #[test]
    fn ambiguous_candidates_are_queued_not_merged() {
        let mut archive = BTreeMap::new();
        let out = reconcile(
            vec![complete("PyData Berlin", "2025-01-10 23:59:00")],
            &mut archive,
            vec![candidate("community", complete("PyData Berlin Summit", "2025-01-10 23:59:00"))],
            &IdentityMatcher::default(),
            &policy(),
            run_date(),
        );
        assert_eq!(out.collection.len(), 1);
        assert_eq!(out.counts.flagged, 1);
        assert!(matches!(out.review[0], ReviewItem::AmbiguousMatch { score, .. } if score == 65.0));
    }

    #[test]
    fn invalid_merges_keep_the_previous_version() {
        let mut archive = BTreeMap::new();
        let existing = complete("PyCon DE", "2025-01-10 23:59:00");
        let mut broken = Event::new("PyCon DE", 2025);
        broken.cfp_url = Some("http://pycon.de/cfp".into());
        let out = reconcile(
            vec![existing.clone()],
            &mut archive,
            vec![
                candidate("community", broken),
                candidate("community", Event::new("Unheard Of Conf", 2025)),
            ],
            &IdentityMatcher::default(),
            &policy(),
            run_date(),
        );
        assert_eq!(out.collection, vec![existing]);
        assert_eq!(out.counts.invalid, 2);
        assert_eq!(out.review.len(), 2);
    }

    #[test]
    fn incomplete_records_wait_for_complementary_sources() {
        let mut partial = complete("PyCon DE", "2025-01-10 23:59:00");
        partial.location_text = None;
        partial.submission_types = [SubmissionType::Posters].into_iter().collect();
        let full = complete("PyCon DE", "2025-01-15 23:59:00");

        let fold = |candidates: Vec<Candidate>| {
            reconcile(
                Vec::new(),
                &mut BTreeMap::new(),
                candidates,
                &IdentityMatcher::default(),
                &policy(),
                run_date(),
            )
        };
        let partial_first = fold(vec![
            candidate("community", partial.clone()),
            candidate("official", full.clone()),
        ]);
        let full_first = fold(vec![candidate("official", full), candidate("community", partial)]);

        assert_eq!(partial_first.collection, full_first.collection);
        assert!(partial_first.review.is_empty());
        assert_eq!(partial_first.counts.inserted, 1);
        assert_eq!(partial_first.counts.merged, 1);
        let event = &partial_first.collection[0];
        assert_eq!(event.submission_types.len(), 2);
        assert_eq!(event.source_provenance.len(), 2);
        assert_eq!(event.location_text.as_deref(), Some("Berlin, Germany"));
    }

    #[test]
    fn records_still_invalid_after_the_fold_name_every_contributor() {
        let mut first = Event::new("Half Known Conf", 2025);
        first.primary_url = Some("https://half.example.org/".into());
        let mut second = Event::new("Half Known Conf", 2025);
        second.location_text = Some("Lisbon, Portugal".into());
        let out = reconcile(
            Vec::new(),
            &mut BTreeMap::new(),
            vec![candidate("official", first), candidate("community", second)],
            &IdentityMatcher::default(),
            &policy(),
            run_date(),
        );
        assert!(out.collection.is_empty());
        assert_eq!(out.counts.invalid, 1);
        assert_eq!(out.counts.inserted, 0);
        match &out.review[..] {
            [ReviewItem::Invalid { contributors, candidate, .. }] => {
                let sources: Vec<_> = contributors.iter().map(|c| c.source_id.as_str()).collect();
                assert_eq!(sources, vec!["official", "community"]);
                assert_eq!(candidate.location_text.as_deref(), Some("Lisbon, Portugal"));
            }
            other => panic!("unexpected review queue {other:?}"),
        }
    }

    #[test]
    fn archived_name_variants_are_not_archived_twice() {
        let past = |name: &str| {
            let mut e = complete(name, "2024-01-15 23:59:00");
            e.year = 2024;
            e.start_date = NaiveDate::from_ymd_opt(2024, 5, 14);
            e.end_date = NaiveDate::from_ymd_opt(2024, 5, 22);
            e
        };
        let mut archive = BTreeMap::new();
        let matcher = IdentityMatcher::default();

        let first = reconcile(
            Vec::new(),
            &mut archive,
            vec![candidate("official", past("PyCon US"))],
            &matcher,
            &policy(),
            run_date(),
        );
        let split = partition(first.collection, run_date());
        archive_into(&mut archive, split.elapsed);
        assert_eq!(archive[&2024].len(), 1);

        let second = reconcile(
            split.active,
            &mut archive,
            vec![
                candidate("official", past("PyCon US")),
                candidate("community", past("PyCon USA")),
            ],
            &matcher,
            &policy(),
            run_date(),
        );
        assert!(second.collection.is_empty());
        assert_eq!(second.counts.archived_skipped, 2);
        let split = partition(second.collection, run_date());
        archive_into(&mut archive, split.elapsed);
        let names: Vec<_> = archive[&2024].iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["PyCon US"]);
    }

    #[test]
    fn near_archived_names_wait_for_review() {
        let mut past = complete("PyData Berlin", "2025-01-10 23:59:00");
        past.end_date = NaiveDate::from_ymd_opt(2024, 12, 1);
        let mut archive = BTreeMap::from([(2025, vec![past.clone()])]);
        let out = reconcile(
            Vec::new(),
            &mut archive,
            vec![candidate("community", complete("PyData Berlin Summit", "2025-01-10 23:59:00"))],
            &IdentityMatcher::default(),
            &policy(),
            run_date(),
        );
        assert!(out.collection.is_empty());
        assert_eq!(out.counts.flagged, 1);
        assert!(matches!(out.review[0], ReviewItem::AmbiguousMatch { archived: true, .. }));
        assert_eq!(archive[&2025], vec![past]);
    }

    #[test]
    fn archived_events_only_take_curated_corrections() {
        let past = complete("PyCon DE", "2025-01-10 23:59:00");
        let mut archive = BTreeMap::from([(2025, vec![past.clone()])]);

        let mut source_copy = past.clone();
        source_copy.note = Some("from a feed".into());
        let mut curated = past.clone();
        curated.note = Some("Talk recordings published".into());
        curated.manually_edited = true;

        let out = reconcile(
            Vec::new(),
            &mut archive,
            vec![candidate("community", source_copy), candidate("curated", curated)],
            &IdentityMatcher::default(),
            &policy(),
            run_date(),
        );
        assert!(out.collection.is_empty());
        assert_eq!(out.counts.archived_skipped, 1);
        assert_eq!(out.counts.archive_corrections, 1);
        assert_eq!(archive[&2025].len(), 1);
        assert_eq!(archive[&2025][0].note.as_deref(), Some("Talk recordings published"));
    }
}
