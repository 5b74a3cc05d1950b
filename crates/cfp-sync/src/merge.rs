//! Field-level merge of a matched candidate into its canonical record.
//!
//! Every populated field remembers the source that supplied it
//! (`field_sources`). A non-empty value is only displaced by a source that
//! outranks its owner, which makes the result independent of the order in
//! which sources arrive.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use cfp_core::{is_placeholder_name, Deadline, Event, FieldCategory};
use chrono::NaiveDate;
use serde::Serialize;

use crate::config::SourceRegistry;

#[derive(Debug, Clone, Default)]
struct SourceRank {
    priority: i32,
    authoritative_for: BTreeSet<FieldCategory>,
}

/// Precedence between sources, derived from the registry.
#[derive(Debug, Clone, Default)]
pub struct SourcePolicy {
    ranks: HashMap<String, SourceRank>,
}

impl SourcePolicy {
    pub fn from_registry(registry: &SourceRegistry) -> Self {
        let ranks = registry
            .sources
            .iter()
            .map(|source| {
                (
                    source.source_id.clone(),
                    SourceRank {
                        priority: source.priority,
                        authoritative_for: source.authoritative_for.clone(),
                    },
                )
            })
            .collect();
        Self { ranks }
    }

    pub fn with_source(
        mut self,
        source_id: &str,
        priority: i32,
        authoritative_for: impl IntoIterator<Item = FieldCategory>,
    ) -> Self {
        self.ranks.insert(
            source_id.to_string(),
            SourceRank {
                priority,
                authoritative_for: authoritative_for.into_iter().collect(),
            },
        );
        self
    }

    pub fn is_authoritative(&self, source_id: &str, category: FieldCategory) -> bool {
        self.ranks
            .get(source_id)
            .is_some_and(|rank| rank.authoritative_for.contains(&category))
    }

    fn rank(&self, source_id: &str, category: FieldCategory) -> (bool, i32) {
        match self.ranks.get(source_id) {
            Some(rank) => (rank.authoritative_for.contains(&category), rank.priority),
            None => (false, i32::MIN),
        }
    }

    /// Strict total order over sources for one field category. Values with no
    /// recorded owner only yield to an authoritative source.
    pub fn outranks(&self, challenger: &str, owner: Option<&str>, category: FieldCategory) -> bool {
        let Some(owner) = owner else {
            return self.is_authoritative(challenger, category);
        };
        if challenger == owner {
            return false;
        }
        let (c, o) = (self.rank(challenger, category), self.rank(owner, category));
        c > o || (c == o && challenger < owner)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NameDiscrepancy {
    pub year: i32,
    pub kept: String,
    pub offered: String,
    pub source_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub event: Event,
    pub changed_fields: Vec<&'static str>,
    pub discrepancy: Option<NameDiscrepancy>,
}

impl MergeOutcome {
    pub fn is_unchanged(&self, before: &Event) -> bool {
        &self.event == before
    }
}

struct FieldCtx<'a> {
    policy: &'a SourcePolicy,
    source_id: &'a str,
    locked: bool,
    changed: Vec<&'static str>,
}

impl FieldCtx<'_> {
    fn merge<T: PartialEq + Clone>(
        &mut self,
        field: &'static str,
        category: FieldCategory,
        owners: &mut BTreeMap<String, String>,
        current: &mut Option<T>,
        incoming: &Option<T>,
        is_empty: impl Fn(&T) -> bool,
    ) {
        let Some(new_value) = incoming else {
            return;
        };
        let locked = self.locked
            && matches!(
                category,
                FieldCategory::Name | FieldCategory::Links | FieldCategory::Dates
            );
        let outranks = self.policy.outranks(
            self.source_id,
            owners.get(field).map(String::as_str),
            category,
        );
        let replace = match current.as_ref() {
            None => true,
            Some(existing) if existing == new_value => {
                if !locked && outranks {
                    owners.insert(field.to_string(), self.source_id.to_string());
                }
                false
            }
            Some(_) if is_empty(new_value) => false,
            // Sentinels and blanks are filled even on locked records.
            Some(existing) if is_empty(existing) => true,
            Some(_) => !locked && outranks,
        };
        if replace {
            self.take(field, owners, current, new_value);
        }
    }

    fn take<T: Clone>(
        &mut self,
        field: &'static str,
        owners: &mut BTreeMap<String, String>,
        current: &mut Option<T>,
        value: &T,
    ) {
        *current = Some(value.clone());
        owners.insert(field.to_string(), self.source_id.to_string());
        self.changed.push(field);
    }
}

fn blank(value: &String) -> bool {
    value.trim().is_empty()
}

fn never_empty<T>(_: &T) -> bool {
    false
}

/// Start a canonical record from a candidate nobody has seen before.
pub fn insert_new(candidate: &Event, source_id: &str, policy: &SourcePolicy, run_date: NaiveDate) -> Event {
    let mut shell = Event::new(candidate.name.clone(), candidate.year);
    shell.first_seen = Some(candidate.first_seen.unwrap_or(run_date));
    shell
        .field_sources
        .insert("name".to_string(), source_id.to_string());
    let mut outcome = merge_into(&shell, candidate, source_id, policy);
    outcome.event.manually_edited = candidate.manually_edited;
    outcome.event
}

/// Fold `incoming` (from `source_id`) into `canonical`.
pub fn merge_into(canonical: &Event, incoming: &Event, source_id: &str, policy: &SourcePolicy) -> MergeOutcome {
    let mut merged = canonical.clone();
    let mut ctx = FieldCtx {
        policy,
        source_id,
        locked: canonical.manually_edited,
        changed: Vec::new(),
    };

    let discrepancy = merge_name(&mut merged, incoming, &mut ctx);

    let owners = &mut merged.field_sources;
    ctx.merge("primary_url", FieldCategory::Links, owners, &mut merged.primary_url, &incoming.primary_url, blank);
    ctx.merge("cfp_url", FieldCategory::Links, owners, &mut merged.cfp_url, &incoming.cfp_url, blank);
    ctx.merge("finaid_url", FieldCategory::Links, owners, &mut merged.finaid_url, &incoming.finaid_url, blank);
    ctx.merge("sponsor_url", FieldCategory::Links, owners, &mut merged.sponsor_url, &incoming.sponsor_url, blank);
    ctx.merge("mastodon", FieldCategory::Links, owners, &mut merged.mastodon, &incoming.mastodon, blank);
    ctx.merge(
        "cfp_deadline",
        FieldCategory::Dates,
        owners,
        &mut merged.cfp_deadline,
        &incoming.cfp_deadline,
        |d: &Deadline| *d == Deadline::Tba,
    );
    ctx.merge(
        "cfp_extended_deadline",
        FieldCategory::Dates,
        owners,
        &mut merged.cfp_extended_deadline,
        &incoming.cfp_extended_deadline,
        never_empty,
    );
    ctx.merge(
        "workshop_deadline",
        FieldCategory::Dates,
        owners,
        &mut merged.workshop_deadline,
        &incoming.workshop_deadline,
        never_empty,
    );
    ctx.merge(
        "tutorial_deadline",
        FieldCategory::Dates,
        owners,
        &mut merged.tutorial_deadline,
        &incoming.tutorial_deadline,
        never_empty,
    );
    ctx.merge("start_date", FieldCategory::Dates, owners, &mut merged.start_date, &incoming.start_date, never_empty);
    ctx.merge("end_date", FieldCategory::Dates, owners, &mut merged.end_date, &incoming.end_date, never_empty);

    let mut timezone = Some(merged.timezone.clone());
    ctx.merge(
        "timezone",
        FieldCategory::Dates,
        owners,
        &mut timezone,
        &Some(incoming.timezone.clone()),
        |tz: &cfp_core::EventTimezone| tz.is_aoe(),
    );
    if let Some(timezone) = timezone {
        merged.timezone = timezone;
    }

    ctx.merge(
        "location_text",
        FieldCategory::Location,
        owners,
        &mut merged.location_text,
        &incoming.location_text,
        blank,
    );
    ctx.merge(
        "coordinates",
        FieldCategory::Location,
        owners,
        &mut merged.coordinates,
        &incoming.coordinates,
        never_empty,
    );
    ctx.merge("note", FieldCategory::Details, owners, &mut merged.note, &incoming.note, blank);

    let before = merged.submission_types.len();
    merged
        .submission_types
        .extend(incoming.submission_types.iter().copied());
    if merged.submission_types.len() != before {
        ctx.changed.push("submission_types");
    }

    merged.source_provenance.insert(source_id.to_string());
    merged
        .source_provenance
        .extend(incoming.source_provenance.iter().cloned());
    merged.first_seen = match (merged.first_seen, incoming.first_seen) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    };
    merged.manually_edited |= incoming.manually_edited;

    MergeOutcome {
        event: merged,
        changed_fields: ctx.changed,
        discrepancy,
    }
}

fn merge_name(merged: &mut Event, incoming: &Event, ctx: &mut FieldCtx<'_>) -> Option<NameDiscrepancy> {
    const FIELD: &str = "name";
    let owner = merged.field_sources.get(FIELD).cloned();
    let outranks = ctx
        .policy
        .outranks(ctx.source_id, owner.as_deref(), FieldCategory::Name);

    if is_placeholder_name(&incoming.name) {
        return None;
    }
    if incoming.name == merged.name {
        if outranks && !ctx.locked {
            merged
                .field_sources
                .insert(FIELD.to_string(), ctx.source_id.to_string());
        }
        return None;
    }
    if is_placeholder_name(&merged.name) {
        merged.name = incoming.name.clone();
        merged
            .field_sources
            .insert(FIELD.to_string(), ctx.source_id.to_string());
        ctx.changed.push("name");
        return None;
    }
    if !ctx.locked && outranks && ctx.policy.is_authoritative(ctx.source_id, FieldCategory::Name) {
        merged.name = incoming.name.clone();
        merged
            .field_sources
            .insert(FIELD.to_string(), ctx.source_id.to_string());
        ctx.changed.push("name");
        return None;
    }
    Some(NameDiscrepancy {
        year: merged.year,
        kept: merged.name.clone(),
        offered: incoming.name.clone(),
        source_id: ctx.source_id.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use cfp_core::{Coordinates, EventTimezone, SubmissionType};
    use chrono::NaiveDateTime;
    use proptest::prelude::*;

    fn run_date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, 1).unwrap()
    }

    fn at(raw: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    fn policy() -> SourcePolicy {
        SourcePolicy::default()
            .with_source("official", 10, [FieldCategory::Dates, FieldCategory::Links])
            .with_source("community", 5, [])
            .with_source("aggregator", 1, [])
    }

    fn pycon(source_deadline: &str) -> Event {
        let mut e = Event::new("PyCon US", 2025);
        e.cfp_deadline = Some(Deadline::At(at(source_deadline)));
        e
    }

    #[test]
    fn fresh_records_own_their_populated_fields() {
        let mut candidate = pycon("2025-01-15 23:59:00");
        candidate.primary_url = Some("https://us.pycon.org/2025/".into());
        let event = insert_new(&candidate, "community", &policy(), run_date());
        assert_eq!(event.source_provenance.len(), 1);
        assert_eq!(event.first_seen, Some(run_date()));
        assert_eq!(event.field_sources["cfp_deadline"], "community");
        assert_eq!(event.field_sources["primary_url"], "community");
        assert!(!event.field_sources.contains_key("end_date"));
    }

    #[test]
    fn higher_ranked_source_wins_regardless_of_order() {
        let p = policy();
        let official = pycon("2025-01-15 23:59:00");
        let community = pycon("2025-01-20 23:59:00");

        let first = insert_new(&official, "official", &p, run_date());
        let ab = merge_into(&first, &community, "community", &p).event;

        let first = insert_new(&community, "community", &p, run_date());
        let ba = merge_into(&first, &official, "official", &p).event;

        assert_eq!(ab, ba);
        assert_eq!(ab.cfp_deadline, official.cfp_deadline);
        assert_eq!(ab.source_provenance.len(), 2);
    }

    #[test]
    fn empty_incoming_values_never_erase() {
        let p = policy();
        let mut canonical = insert_new(&pycon("2025-01-15 23:59:00"), "community", &p, run_date());
        canonical.location_text = Some("Pittsburgh, USA".into());
        let mut incoming = Event::new("PyCon US", 2025);
        incoming.cfp_deadline = Some(Deadline::Tba);
        let out = merge_into(&canonical, &incoming, "official", &p);
        assert_eq!(out.event.cfp_deadline, canonical.cfp_deadline);
        assert_eq!(out.event.location_text.as_deref(), Some("Pittsburgh, USA"));
    }

    #[test]
    fn sentinels_are_filled_by_any_source() {
        let p = policy();
        let mut canonical = Event::new("PyCon US", 2025);
        canonical.cfp_deadline = Some(Deadline::Tba);
        let canonical = insert_new(&canonical, "official", &p, run_date());
        let out = merge_into(&canonical, &pycon("2025-01-15 23:59:00"), "aggregator", &p);
        assert_eq!(out.event.cfp_deadline, Some(Deadline::At(at("2025-01-15 23:59:00"))));
        assert_eq!(out.changed_fields, vec!["cfp_deadline"]);
    }

    #[test]
    fn manual_lock_keeps_links_and_dates_but_not_details() {
        let p = policy();
        let mut manual = pycon("2025-01-15 23:59:00");
        manual.primary_url = Some("https://us.pycon.org/2025/".into());
        manual.manually_edited = true;
        let canonical = insert_new(&manual, "curated", &p, run_date());
        assert!(canonical.manually_edited);

        let mut incoming = pycon("2025-02-01 23:59:00");
        incoming.primary_url = Some("https://pycon.org/".into());
        incoming.note = Some("Financial aid available".into());
        incoming.coordinates = Some(Coordinates { lat: 40.44062, lon: -79.99588 });
        let out = merge_into(&canonical, &incoming, "official", &p);
        assert_eq!(out.event.cfp_deadline, canonical.cfp_deadline);
        assert_eq!(out.event.primary_url, canonical.primary_url);
        assert_eq!(out.event.note, incoming.note);
        assert_eq!(out.event.coordinates, incoming.coordinates);
    }

    #[test]
    fn non_authoritative_name_changes_are_reported_not_applied() {
        let p = policy();
        let canonical = insert_new(&Event::new("PyCon US", 2025), "community", &p, run_date());
        let out = merge_into(&canonical, &Event::new("PyCon United States", 2025), "official", &p);
        assert_eq!(out.event.name, "PyCon US");
        let discrepancy = out.discrepancy.expect("logged");
        assert_eq!(discrepancy.offered, "PyCon United States");

        let naming = policy().with_source("names", 0, [FieldCategory::Name]);
        let out = merge_into(&canonical, &Event::new("PyCon United States", 2025), "names", &naming);
        assert_eq!(out.event.name, "PyCon United States");
        assert!(out.discrepancy.is_none());
    }

    #[test]
    fn set_fields_union_and_timezone_fills_default() {
        let p = policy();
        let mut a = Event::new("EuroPython", 2025);
        a.submission_types.insert(SubmissionType::Talks);
        let canonical = insert_new(&a, "community", &p, run_date());
        let mut b = Event::new("EuroPython", 2025);
        b.submission_types.insert(SubmissionType::Posters);
        b.timezone = EventTimezone::Named("Europe/Prague".into());
        let out = merge_into(&canonical, &b, "aggregator", &p);
        assert_eq!(out.event.submission_types.len(), 2);
        assert_eq!(out.event.timezone.to_string(), "Europe/Prague");
    }

    #[test]
    fn merging_twice_is_a_no_op() {
        let p = policy();
        let canonical = insert_new(&pycon("2025-01-15 23:59:00"), "community", &p, run_date());
        let incoming = pycon("2025-01-20 23:59:00");
        let once = merge_into(&canonical, &incoming, "official", &p).event;
        let twice = merge_into(&once, &incoming, "official", &p);
        assert!(twice.is_unchanged(&once));
        assert!(twice.changed_fields.is_empty());
    }

    fn arb_name() -> impl Strategy<Value = String> {
        prop_oneof![
            Just(String::new()),
            Just("3".to_string()),
            Just("123".to_string()),
            Just("nan".to_string()),
            Just(" ".to_string()),
            "[A-Z][a-z]{2,8}( [A-Z][a-z]{1,6}){0,2}",
        ]
    }

    fn arb_deadline() -> impl Strategy<Value = Option<Deadline>> {
        prop_oneof![
            Just(None),
            Just(Some(Deadline::Tba)),
            Just(Some(Deadline::Cancelled)),
            (1u32..28).prop_map(|d| Some(Deadline::At(at(&format!("2025-02-{d:02} 23:59:00"))))),
        ]
    }

    proptest! {
        #[test]
        fn canonical_names_are_never_lost(
            existing in arb_name(),
            offered in arb_name(),
            official_names in any::<bool>(),
        ) {
            let p = if official_names {
                policy().with_source(
                    "official",
                    10,
                    [FieldCategory::Dates, FieldCategory::Links, FieldCategory::Name],
                )
            } else {
                policy()
            };
            let canonical = insert_new(&Event::new(existing.clone(), 2025), "community", &p, run_date());
            let out = merge_into(&canonical, &Event::new(offered.clone(), 2025), "official", &p);
            let name = out.event.name;

            let (existing_real, offered_real) = (!is_placeholder_name(&existing), !is_placeholder_name(&offered));
            if existing_real || offered_real {
                prop_assert!(!is_placeholder_name(&name), "{:?} + {:?} gave {:?}", existing, offered, name);
            }
            if existing_real && !(official_names && offered_real) {
                prop_assert_eq!(&name, &existing);
            }
            if offered_real && (!existing_real || official_names) {
                prop_assert_eq!(&name, &offered);
            }
        }

        #[test]
        fn two_source_merges_commute(a in arb_deadline(), b in arb_deadline(), pa in 0i32..3, pb in 0i32..3) {
            let p = SourcePolicy::default().with_source("a", pa, []).with_source("b", pb, []);
            let mut ea = Event::new("PyCon US", 2025);
            ea.cfp_deadline = a;
            let mut eb = Event::new("PyCon US", 2025);
            eb.cfp_deadline = b;
            let ab = merge_into(&insert_new(&ea, "a", &p, run_date()), &eb, "b", &p).event;
            let ba = merge_into(&insert_new(&eb, "b", &p, run_date()), &ea, "a", &p).event;
            prop_assert_eq!(ab, ba);
        }
    }
}
