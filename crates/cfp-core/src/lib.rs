//! Core domain model for conference CFP records.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cfp-core";

/// Wire format for every deadline timestamp in the canonical store.
pub const DEADLINE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
/// Earliest edition year accepted anywhere in the pipeline.
pub const MIN_YEAR: i32 = 1989;
/// Decimal places kept for coordinates.
pub const COORDINATE_DECIMALS: i32 = 5;

const AOE_LABEL: &str = "AoE";
const TBA_LABEL: &str = "TBA";
const CANCELLED_LABEL: &str = "Cancelled";

/// CFP deadline: a concrete instant or one of the two sentinels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Deadline {
    At(NaiveDateTime),
    /// Unscheduled ("to be announced").
    Tba,
    Cancelled,
}

impl Deadline {
    /// Parse the canonical store representation only; adapters go through the normalizer.
    pub fn parse_canonical(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.eq_ignore_ascii_case(TBA_LABEL) {
            return Some(Self::Tba);
        }
        if raw.eq_ignore_ascii_case(CANCELLED_LABEL) {
            return Some(Self::Cancelled);
        }
        NaiveDateTime::parse_from_str(raw, DEADLINE_FORMAT)
            .ok()
            .map(Self::At)
    }

    pub fn instant(&self) -> Option<NaiveDateTime> {
        match self {
            Self::At(at) => Some(*at),
            Self::Tba | Self::Cancelled => None,
        }
    }
}

impl fmt::Display for Deadline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::At(at) => write!(f, "{}", at.format(DEADLINE_FORMAT)),
            Self::Tba => f.write_str(TBA_LABEL),
            Self::Cancelled => f.write_str(CANCELLED_LABEL),
        }
    }
}

impl Serialize for Deadline {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Deadline {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse_canonical(&raw)
            .ok_or_else(|| de::Error::custom(format!("invalid deadline '{raw}'")))
    }
}

/// Serde adapter for optional timestamps stored as [`DEADLINE_FORMAT`] strings.
pub mod opt_timestamp {
    use super::DEADLINE_FORMAT;
    use chrono::NaiveDateTime;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<NaiveDateTime>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(at) => serializer.collect_str(&at.format(DEADLINE_FORMAT)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<NaiveDateTime>, D::Error> {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        raw.map(|s| {
            NaiveDateTime::parse_from_str(s.trim(), DEADLINE_FORMAT)
                .map_err(|e| de::Error::custom(format!("invalid timestamp '{s}': {e}")))
        })
        .transpose()
    }
}

/// Deadline timezone. Anywhere-on-Earth (UTC-12) is the default.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum EventTimezone {
    #[default]
    AnywhereOnEarth,
    Named(String),
}

impl EventTimezone {
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        let aoe_spellings = ["aoe", "utc-12", "utc-12:00", "etc/gmt+12", "anywhere on earth"];
        if trimmed.is_empty() || aoe_spellings.contains(&trimmed.to_ascii_lowercase().as_str()) {
            Self::AnywhereOnEarth
        } else {
            Self::Named(trimmed.to_string())
        }
    }

    pub fn is_aoe(&self) -> bool {
        matches!(self, Self::AnywhereOnEarth)
    }

    /// Zone database entry, `None` when the name is not an IANA id.
    pub fn resolve(&self) -> Option<Tz> {
        match self {
            Self::AnywhereOnEarth => Some(Tz::Etc__GMTPlus12),
            Self::Named(name) => Tz::from_str(name).ok(),
        }
    }
}

impl fmt::Display for EventTimezone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AnywhereOnEarth => f.write_str(AOE_LABEL),
            Self::Named(name) => f.write_str(name),
        }
    }
}

impl Serialize for EventTimezone {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EventTimezone {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::parse(&raw))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lon: f64,
}

impl Coordinates {
    pub fn in_bounds(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && self.lat.abs() <= 90.0
            && self.lon.abs() <= 180.0
    }

    /// Truncate (not round) both axes to [`COORDINATE_DECIMALS`] places.
    pub fn truncated(&self) -> Self {
        Self {
            lat: truncate_decimals(self.lat),
            lon: truncate_decimals(self.lon),
        }
    }

    pub fn within_precision(&self) -> bool {
        has_at_most_decimals(self.lat) && has_at_most_decimals(self.lon)
    }
}

fn truncate_decimals(value: f64) -> f64 {
    let scale = 10f64.powi(COORDINATE_DECIMALS);
    let scaled = value * scale;
    // Representation noise only: 13.40495 * 1e5 = 1340494.9999999998.
    let nearest = scaled.round();
    let scaled = if (scaled - nearest).abs() < 1e-6 { nearest } else { scaled };
    scaled.trunc() / scale
}

fn has_at_most_decimals(value: f64) -> bool {
    let scaled = value * 10f64.powi(COORDINATE_DECIMALS);
    (scaled - scaled.round()).abs() < 1e-6
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmissionType {
    Talks,
    Workshops,
    Tutorials,
    Posters,
    Lightning,
    Panels,
    Keynotes,
}

impl FromStr for SubmissionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        let kind = match lower.trim_end_matches('s') {
            "talk" => Self::Talks,
            "workshop" => Self::Workshops,
            "tutorial" => Self::Tutorials,
            "poster" => Self::Posters,
            "lightning" | "lightning talk" => Self::Lightning,
            "panel" => Self::Panels,
            "keynote" => Self::Keynotes,
            _ => return Err(format!("unknown submission type '{}'", s.trim())),
        };
        Ok(kind)
    }
}

/// Field groups a source can be authoritative for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldCategory {
    Name,
    Links,
    Dates,
    Location,
    Details,
}

/// Canonical conference record as persisted in the active store and the archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(alias = "conference")]
    pub name: String,
    pub year: i32,
    #[serde(default, alias = "link", skip_serializing_if = "Option::is_none")]
    pub primary_url: Option<String>,
    #[serde(default, alias = "cfp_link", skip_serializing_if = "Option::is_none")]
    pub cfp_url: Option<String>,
    #[serde(default, alias = "cfp", skip_serializing_if = "Option::is_none")]
    pub cfp_deadline: Option<Deadline>,
    #[serde(
        default,
        alias = "cfp_ext",
        with = "opt_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub cfp_extended_deadline: Option<NaiveDateTime>,
    #[serde(default, with = "opt_timestamp", skip_serializing_if = "Option::is_none")]
    pub workshop_deadline: Option<NaiveDateTime>,
    #[serde(default, with = "opt_timestamp", skip_serializing_if = "Option::is_none")]
    pub tutorial_deadline: Option<NaiveDateTime>,
    #[serde(default, alias = "start", skip_serializing_if = "Option::is_none")]
    pub start_date: Option<NaiveDate>,
    #[serde(default, alias = "end", skip_serializing_if = "Option::is_none")]
    pub end_date: Option<NaiveDate>,
    #[serde(default, alias = "place", skip_serializing_if = "Option::is_none")]
    pub location_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinates: Option<Coordinates>,
    #[serde(default)]
    pub timezone: EventTimezone,
    #[serde(default, alias = "sub")]
    pub submission_types: BTreeSet<SubmissionType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finaid_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sponsor_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mastodon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub source_provenance: BTreeSet<String>,
    /// Which source supplied the current value of each field.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub field_sources: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_seen: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub manually_edited: bool,
}

impl Event {
    pub fn new(name: impl Into<String>, year: i32) -> Self {
        Self {
            name: name.into(),
            year,
            primary_url: None,
            cfp_url: None,
            cfp_deadline: None,
            cfp_extended_deadline: None,
            workshop_deadline: None,
            tutorial_deadline: None,
            start_date: None,
            end_date: None,
            location_text: None,
            coordinates: None,
            timezone: EventTimezone::default(),
            submission_types: BTreeSet::new(),
            finaid_url: None,
            sponsor_url: None,
            mastodon: None,
            note: None,
            source_provenance: BTreeSet::new(),
            field_sources: BTreeMap::new(),
            first_seen: None,
            manually_edited: false,
        }
    }

    /// Fast-path identity: lowercase name immediately followed by the year.
    pub fn identity_key(&self) -> String {
        format!("{}{}", self.name.to_lowercase(), self.year)
    }

    /// Extended CFP when present, else the CFP itself (possibly a sentinel).
    pub fn operative_deadline(&self) -> Option<Deadline> {
        self.cfp_extended_deadline
            .map(Deadline::At)
            .or(self.cfp_deadline)
    }

    /// Operative deadline as an absolute instant, `None` when unscheduled or cancelled.
    pub fn operative_deadline_utc(&self) -> Option<DateTime<Utc>> {
        let local = self.operative_deadline()?.instant()?;
        let resolved = self
            .timezone
            .resolve()
            .and_then(|tz| tz.from_local_datetime(&local).earliest())
            .map(|at| at.with_timezone(&Utc));
        Some(resolved.unwrap_or_else(|| Utc.from_utc_datetime(&local)))
    }

    /// True once the event ended strictly before `reference`.
    pub fn is_elapsed(&self, reference: NaiveDate) -> bool {
        self.end_date.is_some_and(|end| end < reference)
    }

    /// Every URL-bearing field with its key name.
    pub fn url_fields(&self) -> [(&'static str, Option<&str>); 5] {
        [
            ("primary_url", self.primary_url.as_deref()),
            ("cfp_url", self.cfp_url.as_deref()),
            ("finaid_url", self.finaid_url.as_deref()),
            ("sponsor_url", self.sponsor_url.as_deref()),
            ("mastodon", self.mastodon.as_deref()),
        ]
    }
}

/// Loosely typed scalar as emitted by sources (JSON numbers, YAML scalars, text).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawScalar {
    Integer(i64),
    Float(f64),
    Text(String),
}

impl RawScalar {
    pub fn as_text(&self) -> String {
        match self {
            Self::Integer(v) => v.to_string(),
            Self::Float(v) => v.to_string(),
            Self::Text(v) => v.trim().to_string(),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Integer(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            Self::Text(v) => v.trim().parse().ok(),
        }
    }
}

/// A list given either as a sequence or as one comma-separated string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawList {
    Many(Vec<String>),
    One(String),
}

impl Default for RawList {
    fn default() -> Self {
        Self::Many(Vec::new())
    }
}

impl RawList {
    pub fn items(&self) -> Vec<String> {
        let parts: Vec<&str> = match self {
            Self::Many(items) => items.iter().map(String::as_str).collect(),
            Self::One(joined) => joined.split(',').collect(),
        };
        parts
            .into_iter()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// Source-shaped record before normalization. Field names accept the common
/// source-native spellings so adapters only need to deserialize.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawRecord {
    #[serde(default, alias = "conference", alias = "title")]
    pub name: Option<String>,
    #[serde(default)]
    pub year: Option<RawScalar>,
    #[serde(default, alias = "link", alias = "url")]
    pub primary_url: Option<String>,
    #[serde(default, alias = "cfp_link")]
    pub cfp_url: Option<String>,
    #[serde(default, alias = "cfp")]
    pub cfp_deadline: Option<RawScalar>,
    #[serde(default, alias = "cfp_ext")]
    pub cfp_extended_deadline: Option<RawScalar>,
    #[serde(default)]
    pub workshop_deadline: Option<RawScalar>,
    #[serde(default)]
    pub tutorial_deadline: Option<RawScalar>,
    #[serde(default, alias = "start")]
    pub start_date: Option<RawScalar>,
    #[serde(default, alias = "end")]
    pub end_date: Option<RawScalar>,
    #[serde(default, alias = "place", alias = "location")]
    pub location_text: Option<String>,
    #[serde(default, alias = "lat")]
    pub latitude: Option<RawScalar>,
    #[serde(default, alias = "lon", alias = "lng")]
    pub longitude: Option<RawScalar>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default, alias = "sub")]
    pub submission_types: RawList,
    #[serde(default)]
    pub finaid_url: Option<String>,
    #[serde(default)]
    pub sponsor_url: Option<String>,
    #[serde(default)]
    pub mastodon: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
}

/// Handoff contract from source adapters into the reconciliation pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    pub source_id: String,
    /// Deterministic id of the record within its source payload.
    pub origin: Uuid,
    pub manually_edited: bool,
    pub record: RawRecord,
}

/// Names that carry no identity: blank, bare row indices, or spreadsheet nulls.
pub fn is_placeholder_name(name: &str) -> bool {
    let trimmed = name.trim();
    if trimmed.is_empty() || trimmed.chars().all(|c| c.is_ascii_digit()) {
        return true;
    }
    matches!(
        trimmed.to_ascii_lowercase().as_str(),
        "nan" | "none" | "null" | "unnamed" | "untitled" | "n/a" | "-"
    )
}
