// RU-PATH Engine — Intent Classifier & Slot Extraction
//
// Classifies each utterance into a small closed set of intents and pulls
// out slot values (permit, campus, time, origin/destination, named lot).
// Keyword/pattern heuristics — no model call, fast & deterministic. The
// generation capability is confined to composing replies; it never makes
// routing or eligibility decisions.
//
// Matching is word-level on a token set, so "bus" never fires inside
// "Busch".

use crate::atoms::types::{parse_weekday, Entities, Intent, TimeRef};
use crate::engine::facts::{tokenize, FactStore};
use chrono::NaiveTime;
use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

static FROM_TO: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bfrom\s+(.+?)\s+to\s+(.+)$").unwrap());
static CLOCK_12H: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(\d{1,2})(?::(\d{2}))?\s*(am|pm)\b").unwrap());
static CLOCK_24H: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d{1,2}):(\d{2})\b").unwrap());

const PARKING_TERMS: &[&str] =
    &["park", "parking", "lot", "lots", "permit", "permits", "eligible", "eligibility", "commuter", "resident"];
const BUS_TERMS: &[&str] =
    &["bus", "buses", "route", "routes", "shuttle", "shuttles", "stop", "stops", "ride"];
const HELP_TERMS: &[&str] = &["help", "menu", "options"];

/// Deterministic classifier over the dataset's vocabulary. Built once at
/// startup from the fact store (permit names, campus names, lot names).
pub struct IntentClassifier {
    permits: Vec<String>,
    campuses: Vec<String>,
    /// (normalized lot name, fact id, lot campus)
    lots: Vec<(String, String, Option<String>)>,
}

impl IntentClassifier {
    pub fn new(store: &FactStore) -> Self {
        let lots = store
            .by_category(crate::atoms::types::Category::Lot)
            .iter()
            .map(|r| (normalize(r.name()), r.id.clone(), r.campus.clone()))
            .collect();
        IntentClassifier {
            permits: store.permit_names(),
            campuses: store.campuses(),
            lots,
        }
    }

    /// Classify the utterance into the closed intent set.
    pub fn classify(&self, text: &str) -> Intent {
        let lower = text.to_lowercase();
        let tokens = tokenize(text);

        if tokens.is_empty() {
            return Intent::Help;
        }
        if tokens.len() <= 2 && tokens.iter().all(|t| HELP_TERMS.contains(&t.as_str())) {
            return Intent::Help;
        }

        let mut parking = 0.0f32;
        let mut bus = 0.0f32;
        let mut building = 0.0f32;

        parking += 0.5 * count_terms(&tokens, PARKING_TERMS) as f32;
        bus += 0.5 * count_terms(&tokens, BUS_TERMS) as f32;
        if FROM_TO.is_match(text) {
            bus += 0.6;
        }
        if lower.contains("which bus") || lower.contains("how do i get") {
            bus += 0.6;
        }
        if lower.starts_with("where is ") || lower.contains("located") {
            building += 0.7;
        }
        // A named lot is a strong parking signal even without other terms.
        if self.find_lot(text).is_some() {
            parking += 0.6;
        }

        if parking <= 0.0 && bus <= 0.0 && building <= 0.0 {
            return Intent::General;
        }
        if building > parking && building > bus {
            return Intent::BuildingInfo;
        }
        // Both parking and bus signals → parking, matching the assistant's
        // documented one-question-at-a-time behavior.
        if parking >= bus {
            Intent::ParkingEligibility
        } else {
            Intent::BusRoute
        }
    }

    /// Extract slot values from the utterance.
    pub fn extract(&self, text: &str) -> Entities {
        let mut entities = Entities::default();
        let norm_text = normalize(text);
        let tokens = tokenize(text);

        // Permit: normalized containment, so "Student B" matches "StudentB".
        for permit in &self.permits {
            if norm_text.contains(&normalize(permit)) {
                entities.permit_type = Some(permit.clone());
                break;
            }
        }

        // Campus: full-name containment or a distinctive name token.
        entities.campus = self.find_campus(&norm_text, &tokens);

        // Named lot: longest normalized match wins ("lot 51" over "lot 5").
        if let Some((id, campus)) = self.find_lot(text) {
            entities.lot_id = Some(id);
            // An explicitly named lot pins down the campus.
            if entities.campus.is_none() {
                entities.campus = campus;
            }
        }

        // Time: weekday word and/or clock time.
        let time_ref = self.find_time(text, &tokens);
        if !time_ref.is_empty() {
            entities.time = Some(time_ref);
        }

        // Journey: "from X to Y". The destination ends at the first comma
        // so trailing clauses ("..., which bus should I take?") drop off.
        if let Some(caps) = FROM_TO.captures(text) {
            entities.origin = Some(trim_place(&caps[1]));
            let dest = caps[2].split(',').next().unwrap_or(&caps[2]);
            entities.destination = Some(trim_place(dest));
        }

        entities
    }

    fn find_campus(&self, norm_text: &str, tokens: &HashSet<String>) -> Option<String> {
        for campus in &self.campuses {
            if norm_text.contains(&normalize(campus)) {
                return Some(campus.clone());
            }
            // Distinctive single tokens: "busch", "livingston", "cook",
            // "douglass", "college ave" (via the "ave" shorthand below).
            let campus_tokens: Vec<String> = tokenize(campus).into_iter().collect();
            for ct in &campus_tokens {
                if ct.len() >= 4 && ct != "avenue" && tokens.contains(ct) {
                    return Some(campus.clone());
                }
            }
        }
        // Common shorthand for College Avenue.
        if norm_text.contains("collegeave") {
            return self.campuses.iter().find(|c| normalize(c).contains("collegeave")).cloned();
        }
        None
    }

    fn find_lot(&self, text: &str) -> Option<(String, Option<String>)> {
        let norm_text = normalize(text);
        self.lots
            .iter()
            .filter(|(name, _, _)| !name.is_empty() && norm_text.contains(name.as_str()))
            .max_by_key(|(name, _, _)| name.len())
            .map(|(_, id, campus)| (id.clone(), campus.clone()))
    }

    fn find_time(&self, text: &str, tokens: &HashSet<String>) -> TimeRef {
        let mut time_ref = TimeRef::default();
        for token in tokens {
            if let Some(day) = parse_weekday(token) {
                time_ref.weekday = Some(day);
                break;
            }
        }
        if let Some(caps) = CLOCK_12H.captures(text) {
            let hour: u32 = caps[1].parse().unwrap_or(0);
            let minute: u32 = caps.get(2).map_or(0, |m| m.as_str().parse().unwrap_or(0));
            let pm = caps[3].eq_ignore_ascii_case("pm");
            let hour = match (hour % 12, pm) {
                (h, true) => h + 12,
                (h, false) => h,
            };
            time_ref.time = NaiveTime::from_hms_opt(hour, minute, 0);
        } else if let Some(caps) = CLOCK_24H.captures(text) {
            let hour: u32 = caps[1].parse().unwrap_or(0);
            let minute: u32 = caps[2].parse().unwrap_or(0);
            if hour < 24 && minute < 60 {
                time_ref.time = NaiveTime::from_hms_opt(hour, minute, 0);
            }
        }
        time_ref
    }
}

fn count_terms(tokens: &HashSet<String>, terms: &[&str]) -> usize {
    terms.iter().filter(|t| tokens.contains(**t)).count()
}

fn trim_place(s: &str) -> String {
    s.trim_matches(|c: char| c.is_whitespace() || ",.;:\"'?!".contains(c)).to_string()
}

/// Lowercased alphanumeric form for containment matching.
fn normalize(s: &str) -> String {
    s.chars().filter(|c| c.is_alphanumeric()).flat_map(|c| c.to_lowercase()).collect()
}
