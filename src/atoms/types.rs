// ── RU-PATH Atoms: Core Types ──────────────────────────────────────────────
// The data structures that flow through the entire engine. They are
// independent of any storage backend or capability provider.

use chrono::{NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ── Fact records ───────────────────────────────────────────────────────

/// Category tag for a fact record. Closed set — the eligibility engine and
/// the routing engine dispatch on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Lot,
    PermitRule,
    BusRoute,
    BusStop,
    Building,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Lot => "lot",
            Category::PermitRule => "permit_rule",
            Category::BusRoute => "bus_route",
            Category::BusStop => "bus_stop",
            Category::Building => "building",
        }
    }
}

/// Attribute value: scalar, or a list of text values (`allowed_permits`,
/// `stops`, `bus_stops`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Text(String),
    Number(f64),
    Flag(bool),
    List(Vec<String>),
}

impl AttrValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            AttrValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            AttrValue::List(v) => Some(v),
            _ => None,
        }
    }
}

/// A window during which a rule is effective. A record with no windows is
/// always-effective.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeWindow {
    #[serde(with = "weekday_list")]
    pub days: Vec<Weekday>,
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeWindow {
    /// Does this window cover the given time reference? Unknown components
    /// are treated as matching — a bare weekday only has to hit the day
    /// set, a bare clock time only has to fall inside the hours.
    pub fn covers(&self, at: &TimeRef) -> bool {
        if let Some(day) = at.weekday {
            if !self.days.contains(&day) {
                return false;
            }
        }
        if let Some(t) = at.time {
            if t < self.start || t >= self.end {
                return false;
            }
        }
        true
    }

    /// Total effective minutes per week — the specificity measure used for
    /// conflict resolution (narrower window = more specific).
    pub fn span_minutes(&self) -> i64 {
        let per_day = (self.end - self.start).num_minutes().max(0);
        per_day * self.days.len() as i64
    }

    /// True when the two windows share a weekday and their hours intersect.
    pub fn overlaps(&self, other: &TimeWindow) -> bool {
        let share_day = self.days.iter().any(|d| other.days.contains(d));
        share_day && self.start < other.end && other.start < self.end
    }
}

/// One normalized record of institutional data. Immutable after load and
/// owned exclusively by the fact store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactRecord {
    pub id: String,
    pub category: Category,
    #[serde(default)]
    pub campus: Option<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, AttrValue>,
    #[serde(default, rename = "effective_time_windows")]
    pub time_windows: Vec<TimeWindow>,
}

impl FactRecord {
    /// Human-readable name — `attributes.name`, falling back to the id.
    pub fn name(&self) -> &str {
        self.attributes
            .get("name")
            .and_then(|v| v.as_text())
            .unwrap_or(&self.id)
    }

    pub fn attr_text(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(|v| v.as_text())
    }

    pub fn attr_list(&self, key: &str) -> Option<&[String]> {
        self.attributes.get(key).and_then(|v| v.as_list())
    }

    /// Permits allowed to use this record (lots and permit rules).
    pub fn allowed_permits(&self) -> &[String] {
        self.attr_list("allowed_permits").unwrap_or(&[])
    }
}

// ── Slots & intents ────────────────────────────────────────────────────

/// A named piece of required information that may be missing from a query
/// and trigger a clarification turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Slot {
    PermitType,
    Campus,
    Time,
    Origin,
    Destination,
}

impl Slot {
    pub fn as_str(&self) -> &'static str {
        match self {
            Slot::PermitType => "permit_type",
            Slot::Campus => "campus",
            Slot::Time => "time",
            Slot::Origin => "origin",
            Slot::Destination => "destination",
        }
    }

    /// How the slot is named when asking the user for it.
    pub fn prompt_name(&self) -> &'static str {
        match self {
            Slot::PermitType => "permit type",
            Slot::Campus => "campus",
            Slot::Time => "day or time",
            Slot::Origin => "starting building",
            Slot::Destination => "destination building",
        }
    }

    pub fn parse(s: &str) -> Option<Slot> {
        match s {
            "permit_type" => Some(Slot::PermitType),
            "campus" => Some(Slot::Campus),
            "time" => Some(Slot::Time),
            "origin" => Some(Slot::Origin),
            "destination" => Some(Slot::Destination),
            _ => None,
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed set of intents the engine understands. Classified
/// deterministically — the generation capability never makes this call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    ParkingEligibility,
    BusRoute,
    BuildingInfo,
    Help,
    General,
}

// ── Resolved entities ──────────────────────────────────────────────────

/// A point-in-week reference extracted from user text ("Saturday at 6pm").
/// Either component may be unknown.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeRef {
    #[serde(default, with = "weekday_opt")]
    pub weekday: Option<Weekday>,
    #[serde(default)]
    pub time: Option<NaiveTime>,
}

impl TimeRef {
    pub fn is_empty(&self) -> bool {
        self.weekday.is_none() && self.time.is_none()
    }
}

/// Slot values resolved so far, either from the current turn or carried in
/// session state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Entities {
    #[serde(default)]
    pub permit_type: Option<String>,
    #[serde(default)]
    pub campus: Option<String>,
    #[serde(default)]
    pub time: Option<TimeRef>,
    /// Lot named explicitly in the query ("Lot 51"), resolved to a fact id.
    #[serde(default)]
    pub lot_id: Option<String>,
    #[serde(default)]
    pub origin: Option<String>,
    #[serde(default)]
    pub destination: Option<String>,
}

impl Entities {
    /// Merge newly extracted entities over the existing set. New values
    /// override old for the same slot. Switching campus clears the
    /// permit/time/lot context carried for the previous campus — slots are
    /// never unioned across unrelated campuses.
    pub fn merge(&self, new: &Entities) -> Entities {
        let mut out = self.clone();
        if let Some(campus) = &new.campus {
            if self.campus.as_deref().is_some_and(|c| c != campus) {
                out.permit_type = None;
                out.time = None;
                out.lot_id = None;
            }
            out.campus = Some(campus.clone());
        }
        if new.permit_type.is_some() {
            out.permit_type = new.permit_type.clone();
        }
        if new.time.is_some() {
            out.time = new.time.clone();
        }
        if new.lot_id.is_some() {
            out.lot_id = new.lot_id.clone();
        }
        // Origin/destination are per-turn; a new journey replaces the old.
        if new.origin.is_some() {
            out.origin = new.origin.clone();
        }
        if new.destination.is_some() {
            out.destination = new.destination.clone();
        }
        out
    }

    pub fn provides(&self, slot: Slot) -> bool {
        match slot {
            Slot::PermitType => self.permit_type.is_some(),
            Slot::Campus => self.campus.is_some(),
            Slot::Time => self.time.is_some(),
            Slot::Origin => self.origin.is_some(),
            Slot::Destination => self.destination.is_some(),
        }
    }

    /// Required slots still missing for an eligibility verdict. `time` is
    /// optional by design — a missing time never blocks a verdict.
    pub fn missing_for_eligibility(&self) -> Vec<Slot> {
        let mut missing = Vec::new();
        if self.permit_type.is_none() {
            missing.push(Slot::PermitType);
        }
        if self.campus.is_none() && self.lot_id.is_none() {
            missing.push(Slot::Campus);
        }
        missing
    }
}

// ── Per-turn structures ────────────────────────────────────────────────

/// One user turn as seen by the orchestrator. Created per request,
/// discarded after the turn; resolved entities fold into session state on
/// commit.
#[derive(Debug, Clone)]
pub struct Query {
    pub raw_text: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub intent: Intent,
    pub entities: Entities,
}

/// Deterministic eligibility verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "verdict")]
pub enum Verdict {
    Allowed,
    Denied { reason: String },
    Indeterminate { missing: Slot },
}

/// A validated fact inside a context bundle, with its retrieval score and
/// (for eligibility intents) its verdict.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedFact {
    pub fact_id: String,
    pub score: f64,
    pub verdict: Option<Verdict>,
    /// Time windows of the rule that decided the verdict. Empty when the
    /// winning rule is always-effective (or there is no verdict). An
    /// `Allowed` for a time-restricted rule is only valid inside these.
    pub effective_windows: Vec<TimeWindow>,
}

/// One leg of a bus journey: ride `route_id` from `from_stop` to `to_stop`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteLeg {
    pub route_id: Option<String>,
    pub from_stop: String,
    pub to_stop: String,
    pub stops: Vec<String>,
}

/// A planned building-to-building journey over the stop graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutePlan {
    pub origin_name: String,
    pub dest_name: String,
    pub origin_stop: String,
    pub dest_stop: String,
    pub stop_path: Vec<String>,
    pub legs: Vec<RouteLeg>,
    /// Fact ids the plan is grounded on (buildings + routes used).
    pub used_fact_ids: Vec<String>,
}

/// The validated, ranked context for a single turn. References facts by id
/// — it never owns records. Consumed once by the response composer.
#[derive(Debug, Clone, Default)]
pub struct ContextBundle {
    pub intent: Option<Intent>,
    pub validated: Vec<RankedFact>,
    /// Facts that were retrieved but rejected, with the reason.
    pub rejected: Vec<(String, String)>,
    /// Required slots that could not be resolved — drives clarification.
    pub missing_slots: Vec<Slot>,
    /// Bus journey plan, when the intent was routing.
    pub route_plan: Option<RoutePlan>,
    /// True when retrieval ran in keyword-fallback mode.
    pub degraded_retrieval: bool,
}

/// The composed reply for one turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub text: String,
    pub used_fact_ids: Vec<String>,
}

// ── Wire types (HTTP surface) ──────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatResponse {
    pub response: String,
    pub session_id: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StatsSnapshot {
    pub turns: u64,
    pub clarifications: u64,
    pub generation_fallbacks: u64,
    pub degraded_retrievals: u64,
}

// ── Weekday (de)serialization helpers ──────────────────────────────────
// Stable lowercase names in JSON regardless of chrono's own formats.

pub fn parse_weekday(s: &str) -> Option<Weekday> {
    match s.to_ascii_lowercase().as_str() {
        "monday" | "mon" => Some(Weekday::Mon),
        "tuesday" | "tue" => Some(Weekday::Tue),
        "wednesday" | "wed" => Some(Weekday::Wed),
        "thursday" | "thu" => Some(Weekday::Thu),
        "friday" | "fri" => Some(Weekday::Fri),
        "saturday" | "sat" => Some(Weekday::Sat),
        "sunday" | "sun" => Some(Weekday::Sun),
        _ => None,
    }
}

pub fn weekday_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "monday",
        Weekday::Tue => "tuesday",
        Weekday::Wed => "wednesday",
        Weekday::Thu => "thursday",
        Weekday::Fri => "friday",
        Weekday::Sat => "saturday",
        Weekday::Sun => "sunday",
    }
}

mod weekday_list {
    use super::{parse_weekday, weekday_name};
    use chrono::Weekday;
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(days: &[Weekday], ser: S) -> Result<S::Ok, S::Error> {
        ser.collect_seq(days.iter().map(|d| weekday_name(*d)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<Weekday>, D::Error> {
        let names = Vec::<String>::deserialize(de)?;
        names
            .iter()
            .map(|n| parse_weekday(n).ok_or_else(|| D::Error::custom(format!("unknown weekday '{n}'"))))
            .collect()
    }
}

mod weekday_opt {
    use super::{parse_weekday, weekday_name};
    use chrono::Weekday;
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(day: &Option<Weekday>, ser: S) -> Result<S::Ok, S::Error> {
        match day {
            Some(d) => ser.serialize_some(weekday_name(*d)),
            None => ser.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Option<Weekday>, D::Error> {
        let name = Option::<String>::deserialize(de)?;
        match name {
            Some(n) => parse_weekday(&n)
                .map(Some)
                .ok_or_else(|| D::Error::custom(format!("unknown weekday '{n}'"))),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;

    fn window(days: &[Weekday], start: &str, end: &str) -> TimeWindow {
        TimeWindow {
            days: days.to_vec(),
            start: NaiveTime::parse_from_str(start, "%H:%M:%S").unwrap(),
            end: NaiveTime::parse_from_str(end, "%H:%M:%S").unwrap(),
        }
    }

    #[test]
    fn window_covers_day_and_time() {
        let w = window(&[Weekday::Mon, Weekday::Tue], "06:00:00", "22:00:00");
        let hit = TimeRef {
            weekday: Some(Weekday::Mon),
            time: Some(NaiveTime::parse_from_str("09:30:00", "%H:%M:%S").unwrap()),
        };
        assert!(w.covers(&hit));

        let wrong_day = TimeRef { weekday: Some(Weekday::Sat), ..hit.clone() };
        assert!(!w.covers(&wrong_day));

        let too_late = TimeRef {
            weekday: Some(Weekday::Mon),
            time: Some(NaiveTime::parse_from_str("22:00:00", "%H:%M:%S").unwrap()),
        };
        assert!(!w.covers(&too_late));
    }

    #[test]
    fn window_covers_partial_time_ref() {
        let w = window(&[Weekday::Fri], "06:00:00", "22:00:00");
        // Day only — hours unknown, day matches.
        assert!(w.covers(&TimeRef { weekday: Some(Weekday::Fri), time: None }));
        // Time only — day unknown, hours match.
        assert!(w.covers(&TimeRef {
            weekday: None,
            time: Some(NaiveTime::parse_from_str("12:00:00", "%H:%M:%S").unwrap()),
        }));
    }

    #[test]
    fn window_overlap_detection() {
        let a = window(&[Weekday::Mon], "06:00:00", "12:00:00");
        let b = window(&[Weekday::Mon], "11:00:00", "18:00:00");
        let c = window(&[Weekday::Mon], "12:00:00", "18:00:00");
        let d = window(&[Weekday::Sun], "06:00:00", "12:00:00");
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // end is exclusive
        assert!(!a.overlaps(&d)); // disjoint days
    }

    #[test]
    fn merge_overrides_per_slot() {
        let old = Entities {
            permit_type: Some("Student B".into()),
            campus: Some("Busch".into()),
            ..Default::default()
        };
        let new = Entities { permit_type: Some("Faculty".into()), ..Default::default() };
        let merged = old.merge(&new);
        assert_eq!(merged.permit_type.as_deref(), Some("Faculty"));
        assert_eq!(merged.campus.as_deref(), Some("Busch"));
    }

    #[test]
    fn campus_switch_clears_carried_context() {
        let old = Entities {
            permit_type: Some("Student B".into()),
            campus: Some("Busch".into()),
            time: Some(TimeRef { weekday: Some(Weekday::Mon), time: None }),
            ..Default::default()
        };
        let new = Entities { campus: Some("Livingston".into()), ..Default::default() };
        let merged = old.merge(&new);
        assert_eq!(merged.campus.as_deref(), Some("Livingston"));
        assert!(merged.permit_type.is_none());
        assert!(merged.time.is_none());
    }

    #[test]
    fn same_campus_keeps_context() {
        let old = Entities {
            permit_type: Some("Student B".into()),
            campus: Some("Busch".into()),
            ..Default::default()
        };
        let new = Entities { campus: Some("Busch".into()), ..Default::default() };
        let merged = old.merge(&new);
        assert_eq!(merged.permit_type.as_deref(), Some("Student B"));
    }

    #[test]
    fn fact_record_round_trips_through_json() {
        let json = r#"{
            "id": "lot_51",
            "category": "lot",
            "campus": "Livingston",
            "attributes": {
                "name": "Lot 51",
                "allowed_permits": ["Student B", "Faculty"]
            },
            "effective_time_windows": [
                { "days": ["monday", "friday"], "start": "06:00:00", "end": "22:00:00" }
            ]
        }"#;
        let rec: FactRecord = serde_json::from_str(json).unwrap();
        assert_eq!(rec.category, Category::Lot);
        assert_eq!(rec.name(), "Lot 51");
        assert_eq!(rec.allowed_permits(), ["Student B", "Faculty"]);
        assert_eq!(rec.time_windows[0].days, vec![Weekday::Mon, Weekday::Fri]);

        let back = serde_json::to_string(&rec).unwrap();
        let rec2: FactRecord = serde_json::from_str(&back).unwrap();
        assert_eq!(rec, rec2);
    }
}
