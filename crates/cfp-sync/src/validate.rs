//! Declarative record validation. Every rule runs; a record is valid only
//! when none of them reports a violation.

use cfp_core::{is_placeholder_name, Deadline, Event, EventTimezone, MIN_YEAR};
use chrono_tz::TZ_VARIANTS;
use serde::Serialize;
use strsim::jaro_winkler;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleId {
    RequiredFields,
    YearFloor,
    DateOrder,
    AuxiliaryDeadlines,
    HttpsUrls,
    Timezone,
    Coordinates,
    NameSemantic,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Violation {
    pub rule: RuleId,
    pub field: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl Violation {
    fn new(rule: RuleId, field: &'static str, message: impl Into<String>) -> Self {
        Self {
            rule,
            field,
            message: message.into(),
            suggestion: None,
        }
    }

    fn suggest(mut self, suggestion: Option<String>) -> Self {
        self.suggestion = suggestion;
        self
    }
}

type Rule = fn(&Event) -> Vec<Violation>;

pub const RULES: &[(RuleId, Rule)] = &[
    (RuleId::RequiredFields, required_fields),
    (RuleId::YearFloor, year_floor),
    (RuleId::DateOrder, date_order),
    (RuleId::AuxiliaryDeadlines, auxiliary_deadlines),
    (RuleId::HttpsUrls, https_urls),
    (RuleId::Timezone, timezone),
    (RuleId::Coordinates, coordinates),
    (RuleId::NameSemantic, name_semantic),
];

pub fn validate(event: &Event) -> Vec<Violation> {
    RULES.iter().flat_map(|(_, rule)| rule(event)).collect()
}

fn required_fields(event: &Event) -> Vec<Violation> {
    let mut missing = Vec::new();
    if event.name.trim().is_empty() {
        missing.push("name");
    }
    if event.primary_url.is_none() {
        missing.push("primary_url");
    }
    if event.cfp_deadline.is_none() {
        missing.push("cfp_deadline");
    }
    if event.location_text.is_none() {
        missing.push("location_text");
    }
    if event.start_date.is_none() {
        missing.push("start_date");
    }
    if event.end_date.is_none() {
        missing.push("end_date");
    }
    if event.submission_types.is_empty() {
        missing.push("submission_types");
    }
    missing
        .into_iter()
        .map(|field| Violation::new(RuleId::RequiredFields, field, format!("{field} is required")))
        .collect()
}

fn year_floor(event: &Event) -> Vec<Violation> {
    if event.year < MIN_YEAR {
        return vec![Violation::new(
            RuleId::YearFloor,
            "year",
            format!("year {} is before {MIN_YEAR}", event.year),
        )];
    }
    Vec::new()
}

fn date_order(event: &Event) -> Vec<Violation> {
    let mut out = Vec::new();
    if let (Some(start), Some(end)) = (event.start_date, event.end_date) {
        if start > end {
            out.push(Violation::new(
                RuleId::DateOrder,
                "end_date",
                format!("end_date {end} is before start_date {start}"),
            ));
        }
    }
    if let (Some(Deadline::At(cfp)), Some(start)) = (event.cfp_deadline, event.start_date) {
        if cfp.date() > start {
            out.push(Violation::new(
                RuleId::DateOrder,
                "cfp_deadline",
                format!("cfp_deadline {cfp} falls after start_date {start}"),
            ));
        }
    }
    if let (Some(extended), Some(Deadline::At(cfp))) = (event.cfp_extended_deadline, event.cfp_deadline) {
        if extended <= cfp {
            out.push(Violation::new(
                RuleId::DateOrder,
                "cfp_extended_deadline",
                format!("cfp_extended_deadline {extended} does not follow cfp_deadline {cfp}"),
            ));
        }
    }
    out
}

fn auxiliary_deadlines(event: &Event) -> Vec<Violation> {
    let Some(end) = event.end_date else {
        return Vec::new();
    };
    [
        ("workshop_deadline", event.workshop_deadline),
        ("tutorial_deadline", event.tutorial_deadline),
    ]
    .into_iter()
    .filter_map(|(field, deadline)| {
        let deadline = deadline?;
        (deadline.date() > end).then(|| {
            Violation::new(
                RuleId::AuxiliaryDeadlines,
                field,
                format!("{field} {deadline} falls after end_date {end}"),
            )
        })
    })
    .collect()
}

fn https_urls(event: &Event) -> Vec<Violation> {
    event
        .url_fields()
        .into_iter()
        .filter_map(|(field, value)| {
            let value = value?;
            match Url::parse(value) {
                Err(err) => Some(Violation::new(
                    RuleId::HttpsUrls,
                    field,
                    format!("'{value}' is not a valid URL: {err}"),
                )),
                Ok(url) if url.scheme() != "https" => {
                    let upgraded = (url.scheme() == "http")
                        .then(|| format!("https{}", &value["http".len()..]));
                    Some(
                        Violation::new(
                            RuleId::HttpsUrls,
                            field,
                            format!("'{value}' does not use https"),
                        )
                        .suggest(upgraded),
                    )
                }
                Ok(_) => None,
            }
        })
        .collect()
}

fn timezone(event: &Event) -> Vec<Violation> {
    let EventTimezone::Named(name) = &event.timezone else {
        return Vec::new();
    };
    if event.timezone.resolve().is_some() {
        return Vec::new();
    }
    vec![Violation::new(
        RuleId::Timezone,
        "timezone",
        format!("'{name}' is not an IANA timezone"),
    )
    .suggest(nearest_timezone(name))]
}

/// Closest zone id by Jaro-Winkler similarity, if any is reasonably close.
pub fn nearest_timezone(name: &str) -> Option<String> {
    let needle = name.to_ascii_lowercase();
    TZ_VARIANTS
        .iter()
        .map(|tz| {
            let id = tz.name();
            (jaro_winkler(&needle, &id.to_ascii_lowercase()), id)
        })
        .filter(|(score, _)| *score >= 0.8)
        .max_by(|a, b| a.0.total_cmp(&b.0))
        .map(|(_, id)| id.to_string())
}

fn coordinates(event: &Event) -> Vec<Violation> {
    let Some(coords) = event.coordinates else {
        return Vec::new();
    };
    let mut out = Vec::new();
    if !coords.in_bounds() {
        out.push(Violation::new(
            RuleId::Coordinates,
            "coordinates",
            format!("({}, {}) is outside the valid range", coords.lat, coords.lon),
        ));
    }
    if !coords.within_precision() {
        out.push(
            Violation::new(
                RuleId::Coordinates,
                "coordinates",
                format!("({}, {}) has more than five decimals", coords.lat, coords.lon),
            )
            .suggest(Some(format!(
                "{}, {}",
                coords.truncated().lat,
                coords.truncated().lon
            ))),
        );
    }
    out
}

fn name_semantic(event: &Event) -> Vec<Violation> {
    if is_placeholder_name(&event.name) {
        return vec![Violation::new(
            RuleId::NameSemantic,
            "name",
            format!("'{}' is not a meaningful event name", event.name),
        )];
    }
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use cfp_core::{Coordinates, SubmissionType};
    use chrono::{NaiveDate, NaiveDateTime};

    fn at(raw: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    fn valid() -> Event {
        let mut e = Event::new("PyCon US", 2025);
        e.primary_url = Some("https://us.pycon.org/2025/".into());
        e.cfp_deadline = Some(Deadline::At(at("2024-12-18 23:59:00")));
        e.location_text = Some("Pittsburgh, USA".into());
        e.start_date = NaiveDate::from_ymd_opt(2025, 5, 14);
        e.end_date = NaiveDate::from_ymd_opt(2025, 5, 22);
        e.submission_types.insert(SubmissionType::Talks);
        e
    }

    fn rules_hit(event: &Event) -> Vec<RuleId> {
        validate(event).into_iter().map(|v| v.rule).collect()
    }

    #[test]
    fn complete_record_passes() {
        assert!(validate(&valid()).is_empty());
    }

    #[test]
    fn all_rules_run_and_report_together() {
        let mut e = valid();
        e.primary_url = None;
        e.year = 1980;
        e.start_date = NaiveDate::from_ymd_opt(2025, 5, 23);
        let hit = rules_hit(&e);
        assert!(hit.contains(&RuleId::RequiredFields));
        assert!(hit.contains(&RuleId::YearFloor));
        assert!(hit.contains(&RuleId::DateOrder));
    }

    #[test]
    fn cfp_after_start_is_rejected() {
        let mut e = valid();
        e.cfp_deadline = Some(Deadline::At(at("2025-05-15 23:59:00")));
        let violations = validate(&e);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].field, "cfp_deadline");

        e.cfp_deadline = Some(Deadline::At(at("2025-05-14 12:00:00")));
        assert!(validate(&e).is_empty());
    }

    #[test]
    fn extensions_must_come_after_the_original_deadline() {
        let mut e = valid();
        e.cfp_extended_deadline = Some(at("2024-12-18 23:59:00"));
        assert_eq!(rules_hit(&e), vec![RuleId::DateOrder]);
        e.cfp_extended_deadline = Some(at("2025-01-08 23:59:00"));
        assert!(validate(&e).is_empty());
    }

    #[test]
    fn sentinel_deadlines_satisfy_presence_and_skip_ordering() {
        let mut e = valid();
        e.cfp_deadline = Some(Deadline::Tba);
        assert!(validate(&e).is_empty());
        e.cfp_deadline = Some(Deadline::Cancelled);
        assert!(validate(&e).is_empty());
    }

    #[test]
    fn auxiliary_deadlines_must_precede_the_end() {
        let mut e = valid();
        e.workshop_deadline = Some(at("2025-05-20 23:59:00"));
        e.tutorial_deadline = Some(at("2025-06-01 23:59:00"));
        let violations = validate(&e);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].field, "tutorial_deadline");
    }

    #[test]
    fn plain_http_gets_an_https_suggestion() {
        let mut e = valid();
        e.cfp_url = Some("http://us.pycon.org/2025/cfp".into());
        e.sponsor_url = Some("not a url".into());
        let violations = validate(&e);
        assert_eq!(violations.len(), 2);
        assert_eq!(
            violations[0].suggestion.as_deref(),
            Some("https://us.pycon.org/2025/cfp")
        );
        assert_eq!(violations[1].field, "sponsor_url");
    }

    #[test]
    fn misspelled_timezones_suggest_the_nearest_zone() {
        let mut e = valid();
        e.timezone = EventTimezone::Named("Europe/Berlinn".into());
        let violations = validate(&e);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].rule, RuleId::Timezone);
        assert_eq!(violations[0].suggestion.as_deref(), Some("Europe/Berlin"));
    }

    #[test]
    fn coordinates_need_range_and_precision() {
        let mut e = valid();
        e.coordinates = Some(Coordinates { lat: 40.4406248, lon: -79.99588 });
        let violations = validate(&e);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].suggestion.as_deref(), Some("40.44062, -79.99588"));

        e.coordinates = Some(Coordinates { lat: -91.0, lon: 0.0 });
        assert_eq!(rules_hit(&e), vec![RuleId::Coordinates]);
    }

    #[test]
    fn placeholder_names_fail_the_semantic_rule() {
        let mut e = valid();
        e.name = "nan".into();
        assert_eq!(rules_hit(&e), vec![RuleId::NameSemantic]);
    }
}
