//! Raw source record -> canonical [`Event`] candidate.
//!
//! Parse problems on individual fields are recovered locally (sentinel or
//! absent value plus a warning); only a record without a usable name or year
//! is rejected outright.

use cfp_core::{
    is_placeholder_name, Coordinates, Deadline, Event, EventTimezone, RawEvent, RawScalar,
    SubmissionType,
};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use serde::Serialize;
use uuid::Uuid;

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
];

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%Y/%m/%d",
    "%d.%m.%Y",
    "%B %d, %Y",
    "%b %d, %Y",
    "%d %B %Y",
    "%d %b %Y",
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizeWarning {
    pub field: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rejection {
    pub source_id: String,
    pub origin: Uuid,
    pub name: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub source_id: String,
    pub origin: Uuid,
    pub event: Event,
    pub warnings: Vec<NormalizeWarning>,
}

pub fn normalize(raw: &RawEvent) -> Result<Normalized, Rejection> {
    let record = &raw.record;
    let reject = |reason: String| Rejection {
        source_id: raw.source_id.clone(),
        origin: raw.origin,
        name: record.name.clone(),
        reason,
    };

    let year = match record.year.as_ref().map(parse_year) {
        Some(Some(year)) => year,
        Some(None) => {
            let shown = record.year.as_ref().map(RawScalar::as_text).unwrap_or_default();
            return Err(reject(format!("unparsable year '{shown}'")));
        }
        None => return Err(reject("missing year".to_string())),
    };

    let name = clean_name(record.name.as_deref().unwrap_or_default(), year);
    if is_placeholder_name(&name) {
        return Err(reject(format!("name '{name}' is empty or a placeholder")));
    }

    let mut warnings = Vec::new();
    let mut event = Event::new(name, year);

    event.primary_url = clean_text(record.primary_url.as_deref());
    event.cfp_url = clean_text(record.cfp_url.as_deref());
    event.finaid_url = clean_text(record.finaid_url.as_deref());
    event.sponsor_url = clean_text(record.sponsor_url.as_deref());
    event.mastodon = clean_text(record.mastodon.as_deref());
    event.note = clean_text(record.note.as_deref());
    event.location_text = clean_text(record.location_text.as_deref());

    event.cfp_deadline = parse_cfp(record.cfp_deadline.as_ref(), &mut warnings);
    event.cfp_extended_deadline = parse_optional_timestamp(
        "cfp_extended_deadline",
        record.cfp_extended_deadline.as_ref(),
        &mut warnings,
    );
    event.workshop_deadline = parse_optional_timestamp(
        "workshop_deadline",
        record.workshop_deadline.as_ref(),
        &mut warnings,
    );
    event.tutorial_deadline = parse_optional_timestamp(
        "tutorial_deadline",
        record.tutorial_deadline.as_ref(),
        &mut warnings,
    );
    event.start_date = parse_optional_date("start_date", record.start_date.as_ref(), &mut warnings);
    event.end_date = parse_optional_date("end_date", record.end_date.as_ref(), &mut warnings);

    event.timezone = EventTimezone::parse(record.timezone.as_deref().unwrap_or_default());
    event.coordinates = parse_coordinates(
        record.latitude.as_ref(),
        record.longitude.as_ref(),
        &mut warnings,
    );

    for item in record.submission_types.items() {
        match item.parse::<SubmissionType>() {
            Ok(kind) => {
                event.submission_types.insert(kind);
            }
            Err(message) => warnings.push(NormalizeWarning {
                field: "submission_types",
                message,
            }),
        }
    }

    event.manually_edited = raw.manually_edited;

    Ok(Normalized {
        source_id: raw.source_id.clone(),
        origin: raw.origin,
        event,
        warnings,
    })
}

fn parse_year(raw: &RawScalar) -> Option<i32> {
    let year = match raw {
        RawScalar::Integer(v) => i32::try_from(*v).ok()?,
        RawScalar::Float(v) if v.fract() == 0.0 => *v as i32,
        RawScalar::Float(_) => return None,
        RawScalar::Text(text) => text.trim().parse().ok()?,
    };
    // Below the floor still normalizes; the validator reports it with context.
    (year > 0).then_some(year)
}

/// Display-name cleanup: whitespace, known abbreviations and a duplicated year token.
pub fn clean_name(raw: &str, year: i32) -> String {
    let year_token = year.to_string();
    let mut tokens: Vec<String> = raw
        .split_whitespace()
        .filter(|token| *token != year_token)
        .map(|token| match token {
            "Intl" | "Intl." | "Int'l" => "International".to_string(),
            other => other.to_string(),
        })
        .collect();
    if let Some(last) = tokens.last_mut() {
        if matches!(last.as_str(), "Conf" | "Conf." | "conf") {
            *last = "Conference".to_string();
        }
    }
    tokens.join(" ")
}

fn clean_text(raw: Option<&str>) -> Option<String> {
    let collapsed = raw?.split_whitespace().collect::<Vec<_>>().join(" ");
    (!collapsed.is_empty()).then_some(collapsed)
}

fn is_unscheduled_word(text: &str) -> bool {
    matches!(
        text.to_ascii_lowercase().as_str(),
        "tba" | "tbd" | "none" | "n/a" | "unknown"
    )
}

fn parse_cfp(raw: Option<&RawScalar>, warnings: &mut Vec<NormalizeWarning>) -> Option<Deadline> {
    let text = raw?.as_text();
    if text.is_empty() {
        return None;
    }
    if is_unscheduled_word(&text) {
        return Some(Deadline::Tba);
    }
    if matches!(text.to_ascii_lowercase().as_str(), "cancelled" | "canceled") {
        return Some(Deadline::Cancelled);
    }
    match parse_timestamp(&text) {
        Some(at) => Some(Deadline::At(at)),
        None => {
            warnings.push(NormalizeWarning {
                field: "cfp_deadline",
                message: format!("unparsable deadline '{text}', treated as TBA"),
            });
            Some(Deadline::Tba)
        }
    }
}

fn parse_optional_timestamp(
    field: &'static str,
    raw: Option<&RawScalar>,
    warnings: &mut Vec<NormalizeWarning>,
) -> Option<NaiveDateTime> {
    let text = raw?.as_text();
    if text.is_empty() || is_unscheduled_word(&text) {
        return None;
    }
    let parsed = parse_timestamp(&text);
    if parsed.is_none() {
        warnings.push(NormalizeWarning {
            field,
            message: format!("unparsable timestamp '{text}', dropped"),
        });
    }
    parsed
}

fn parse_optional_date(
    field: &'static str,
    raw: Option<&RawScalar>,
    warnings: &mut Vec<NormalizeWarning>,
) -> Option<NaiveDate> {
    let text = raw?.as_text();
    if text.is_empty() || is_unscheduled_word(&text) {
        return None;
    }
    let parsed = parse_date(&text);
    if parsed.is_none() {
        warnings.push(NormalizeWarning {
            field,
            message: format!("unparsable date '{text}', left unscheduled"),
        });
    }
    parsed
}

/// Deadline text in any accepted format; date-only values close at 23:59 that day.
pub fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim();
    DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .or_else(|| {
            DateTime::parse_from_rfc3339(text)
                .ok()
                .map(|at| at.naive_local())
        })
        .or_else(|| {
            let end_of_day = NaiveTime::from_hms_opt(23, 59, 0)?;
            parse_plain_date(text).map(|date| date.and_time(end_of_day))
        })
}

pub fn parse_date(text: &str) -> Option<NaiveDate> {
    let text = text.trim();
    parse_plain_date(text).or_else(|| {
        DATETIME_FORMATS
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
            .map(|at| at.date())
    })
}

fn parse_plain_date(text: &str) -> Option<NaiveDate> {
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(text, fmt).ok())
}

fn parse_coordinates(
    lat: Option<&RawScalar>,
    lon: Option<&RawScalar>,
    warnings: &mut Vec<NormalizeWarning>,
) -> Option<Coordinates> {
    let (lat, lon) = match (lat, lon) {
        (None, None) => return None,
        (Some(lat), Some(lon)) => (lat, lon),
        _ => {
            warnings.push(NormalizeWarning {
                field: "coordinates",
                message: "only one of latitude/longitude given, dropped".to_string(),
            });
            return None;
        }
    };
    let (Some(lat_value), Some(lon_value)) = (lat.as_f64(), lon.as_f64()) else {
        warnings.push(NormalizeWarning {
            field: "coordinates",
            message: format!(
                "unparsable coordinates ({}, {}), dropped",
                lat.as_text(),
                lon.as_text()
            ),
        });
        return None;
    };
    let coordinates = Coordinates {
        lat: lat_value,
        lon: lon_value,
    };
    if !coordinates.in_bounds() {
        warnings.push(NormalizeWarning {
            field: "coordinates",
            message: format!("coordinates ({lat_value}, {lon_value}) out of range, rejected"),
        });
        return None;
    }
    Some(coordinates.truncated())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cfp_core::{RawList, RawRecord};

    fn raw(record: RawRecord) -> RawEvent {
        RawEvent {
            source_id: "pycon-calendar".into(),
            origin: Uuid::nil(),
            manually_edited: false,
            record,
        }
    }

    fn text(value: &str) -> Option<RawScalar> {
        Some(RawScalar::Text(value.to_string()))
    }

    fn base() -> RawRecord {
        RawRecord {
            name: Some("  PyCon   US  2025 ".into()),
            year: Some(RawScalar::Integer(2025)),
            ..RawRecord::default()
        }
    }

    #[test]
    fn name_cleanup_collapses_whitespace_and_strips_year() {
        let out = normalize(&raw(base())).expect("normalized");
        assert_eq!(out.event.name, "PyCon US");
        assert_eq!(out.event.year, 2025);
        assert!(out.warnings.is_empty());
    }

    #[test]
    fn trailing_conf_and_intl_abbreviations_expand() {
        assert_eq!(clean_name("Data Science Conf", 2024), "Data Science Conference");
        assert_eq!(clean_name("Intl Python Conf.", 2024), "International Python Conference");
        assert_eq!(clean_name("Conf on Python", 2024), "Conf on Python");
        assert_eq!(clean_name("PyCon 2023", 2024), "PyCon 2023");
    }

    #[test]
    fn multiple_date_formats_parse() {
        let expected = NaiveDate::from_ymd_opt(2025, 5, 1).unwrap();
        for input in ["2025-05-01", "2025/05/01", "01.05.2025", "May 1, 2025", "1 May 2025"] {
            assert_eq!(parse_date(input), Some(expected), "{input}");
        }
        let at = parse_timestamp("2025-01-15").unwrap();
        assert_eq!(at.to_string(), "2025-01-15 23:59:00");
        let at = parse_timestamp("2025-01-15T12:30:00+02:00").unwrap();
        assert_eq!(at.to_string(), "2025-01-15 12:30:00");
    }

    #[test]
    fn unparsable_dates_become_sentinels_with_warnings() {
        let record = RawRecord {
            cfp_deadline: text("sometime in spring"),
            start_date: text("soon"),
            ..base()
        };
        let out = normalize(&raw(record)).expect("not fatal");
        assert_eq!(out.event.cfp_deadline, Some(Deadline::Tba));
        assert_eq!(out.event.start_date, None);
        let fields: Vec<_> = out.warnings.iter().map(|w| w.field).collect();
        assert_eq!(fields, vec!["cfp_deadline", "start_date"]);
    }

    #[test]
    fn cfp_sentinel_words_are_recognised() {
        let tba = normalize(&raw(RawRecord { cfp_deadline: text("TBD"), ..base() })).unwrap();
        assert_eq!(tba.event.cfp_deadline, Some(Deadline::Tba));
        assert!(tba.warnings.is_empty());
        let cancelled =
            normalize(&raw(RawRecord { cfp_deadline: text("Canceled"), ..base() })).unwrap();
        assert_eq!(cancelled.event.cfp_deadline, Some(Deadline::Cancelled));
    }

    #[test]
    fn missing_timezone_defaults_to_anywhere_on_earth() {
        let out = normalize(&raw(base())).unwrap();
        assert!(out.event.timezone.is_aoe());
        let named = normalize(&raw(RawRecord {
            timezone: Some("America/New_York".into()),
            ..base()
        }))
        .unwrap();
        assert_eq!(named.event.timezone.to_string(), "America/New_York");
    }

    #[test]
    fn coordinates_truncate_and_out_of_range_values_are_dropped() {
        let ok = normalize(&raw(RawRecord {
            latitude: Some(RawScalar::Float(40.4406248)),
            longitude: text("-79.9958864"),
            ..base()
        }))
        .unwrap();
        let coords = ok.event.coordinates.unwrap();
        assert_eq!(coords.lat, 40.44062);
        assert_eq!(coords.lon, -79.99588);

        let bad = normalize(&raw(RawRecord {
            latitude: Some(RawScalar::Float(95.0)),
            longitude: Some(RawScalar::Float(10.0)),
            ..base()
        }))
        .unwrap();
        assert_eq!(bad.event.coordinates, None);
        assert_eq!(bad.warnings[0].field, "coordinates");
    }

    #[test]
    fn unknown_submission_types_warn_and_known_ones_survive() {
        let out = normalize(&raw(RawRecord {
            submission_types: RawList::One("Talks, sprints, Posters".into()),
            ..base()
        }))
        .unwrap();
        assert_eq!(out.event.submission_types.len(), 2);
        assert_eq!(out.warnings.len(), 1);
    }

    #[test]
    fn records_without_name_or_year_are_rejected() {
        let no_year = RawRecord {
            year: None,
            ..base()
        };
        assert_eq!(normalize(&raw(no_year)).unwrap_err().reason, "missing year");

        let bad_year = RawRecord {
            year: text("next year"),
            ..base()
        };
        assert!(normalize(&raw(bad_year)).unwrap_err().reason.contains("unparsable year"));

        let index_name = RawRecord {
            name: Some("42".into()),
            ..base()
        };
        assert!(normalize(&raw(index_name)).is_err());

        let only_year = RawRecord {
            name: Some("2025".into()),
            ..base()
        };
        assert!(normalize(&raw(only_year)).is_err());
    }
}
