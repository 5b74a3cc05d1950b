//! Active/archive partition and the deterministic ordering of both stores.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use cfp_core::Event;
use chrono::NaiveDate;
use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Partition {
    pub active: Vec<Event>,
    pub elapsed: Vec<Event>,
}

/// Split on `end_date < reference`. Undated events stay active.
pub fn partition(events: Vec<Event>, reference: NaiveDate) -> Partition {
    let (elapsed, mut active): (Vec<Event>, Vec<Event>) =
        events.into_iter().partition(|e| e.is_elapsed(reference));
    sort_active(&mut active);
    Partition { active, elapsed }
}

fn none_last<T: Ord>(a: &Option<T>, b: &Option<T>) -> Ordering {
    match (a, b) {
        (Some(x), Some(y)) => x.cmp(y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Soonest operative deadline (in UTC) first; TBA and cancelled entries last.
pub fn sort_active(events: &mut [Event]) {
    events.sort_by(|a, b| {
        none_last(&a.operative_deadline_utc(), &b.operative_deadline_utc())
            .then_with(|| none_last(&a.start_date, &b.start_date))
            .then_with(|| a.name.cmp(&b.name))
            .then_with(|| a.year.cmp(&b.year))
    });
}

/// Archive years list events by start date, then name.
pub fn sort_archive_year(events: &mut [Event]) {
    events.sort_by(|a, b| {
        none_last(&a.start_date, &b.start_date)
            .then_with(|| a.name.cmp(&b.name))
            .then_with(|| a.identity_key().cmp(&b.identity_key()))
    });
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ArchiveDelta {
    pub inserted: usize,
    pub updated: usize,
    pub touched_years: BTreeSet<i32>,
}

/// Upsert by identity key into the per-year archive partitions.
pub fn archive_into(archive: &mut BTreeMap<i32, Vec<Event>>, elapsed: Vec<Event>) -> ArchiveDelta {
    let mut delta = ArchiveDelta::default();
    for event in elapsed {
        let year = event.year;
        let key = event.identity_key();
        let slot = archive.entry(year).or_default();
        match slot.iter_mut().find(|archived| archived.identity_key() == key) {
            Some(existing) if *existing == event => continue,
            Some(existing) => {
                *existing = event;
                delta.updated += 1;
            }
            None => {
                slot.push(event);
                delta.inserted += 1;
            }
        }
        delta.touched_years.insert(year);
    }
    for year in &delta.touched_years {
        if let Some(events) = archive.get_mut(year) {
            sort_archive_year(events);
        }
    }
    delta
}
