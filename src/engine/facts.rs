// RU-PATH Engine — Fact Store
//
// Authoritative read-only repository of campus data records. Everything
// downstream (eligibility, retrieval, routing) trusts what is in here, so
// the load path validates hard and refuses to start on bad data.

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{AttrValue, Category, FactRecord};
use log::info;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;

#[derive(Debug, Deserialize)]
struct Dataset {
    records: Vec<FactRecord>,
}

/// Read-only store of fact records, in stable insertion order.
#[derive(Debug)]
pub struct FactStore {
    records: Vec<FactRecord>,
    by_id: HashMap<String, usize>,
}

impl FactStore {
    /// Load and validate a dataset file. Any schema violation aborts with
    /// `DataIntegrity` — the server never starts partially loaded.
    pub fn load_from_path(path: &Path) -> EngineResult<FactStore> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            EngineError::DataIntegrity(format!("cannot read dataset {}: {e}", path.display()))
        })?;
        let dataset: Dataset = serde_json::from_str(&raw).map_err(|e| {
            EngineError::DataIntegrity(format!("malformed dataset {}: {e}", path.display()))
        })?;
        let store = Self::from_records(dataset.records)?;
        info!("[facts] Loaded {} records from {}", store.len(), path.display());
        Ok(store)
    }

    /// Build a store from already-parsed records, running full validation.
    pub fn from_records(records: Vec<FactRecord>) -> EngineResult<FactStore> {
        let mut by_id = HashMap::with_capacity(records.len());
        for (idx, rec) in records.iter().enumerate() {
            validate_record(rec)?;
            if by_id.insert(rec.id.clone(), idx).is_some() {
                return Err(EngineError::DataIntegrity(format!(
                    "duplicate record id '{}'",
                    rec.id
                )));
            }
        }
        Ok(FactStore { records, by_id })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&FactRecord> {
        self.by_id.get(id).map(|&i| &self.records[i])
    }

    pub fn records(&self) -> &[FactRecord] {
        &self.records
    }

    /// Filtered view, deterministic (insertion order, stable).
    pub fn lookup<'a>(&'a self, pred: impl Fn(&FactRecord) -> bool + 'a) -> Vec<&'a FactRecord> {
        self.records.iter().filter(|r| pred(r)).collect()
    }

    pub fn by_category(&self, category: Category) -> Vec<&FactRecord> {
        self.lookup(move |r| r.category == category)
    }

    /// Permit rules whose `lot_ids` include the given lot.
    pub fn rules_for_lot<'a>(&'a self, lot_id: &str) -> Vec<&'a FactRecord> {
        self.records
            .iter()
            .filter(|r| {
                r.category == Category::PermitRule
                    && r.attr_list("lot_ids").is_some_and(|ids| ids.iter().any(|l| l == lot_id))
            })
            .collect()
    }

    /// Distinct permit names across lots and permit rules, sorted.
    pub fn permit_names(&self) -> Vec<String> {
        let mut names: HashSet<String> = HashSet::new();
        for r in &self.records {
            for p in r.allowed_permits() {
                names.insert(p.clone());
            }
            if r.category == Category::PermitRule {
                if let Some(p) = r.attr_text("permit_type") {
                    names.insert(p.to_string());
                }
            }
        }
        let mut out: Vec<String> = names.into_iter().collect();
        out.sort();
        out
    }

    /// Distinct campus names across all records, sorted.
    pub fn campuses(&self) -> Vec<String> {
        let mut names: HashSet<String> = HashSet::new();
        for r in &self.records {
            if let Some(c) = &r.campus {
                names.insert(c.clone());
            }
        }
        let mut out: Vec<String> = names.into_iter().collect();
        out.sort();
        out
    }

    // ── Keyword retrieval (degraded path) ──────────────────────────────

    /// Token-overlap scoring over each record's textual rendering. The
    /// fallback when the embedding capability is unreachable: degraded,
    /// but deterministic and never silent-wrong.
    pub fn keyword_search(&self, text: &str, k: usize) -> Vec<(&FactRecord, f64)> {
        let query_tokens = tokenize(text);
        if query_tokens.is_empty() {
            return Vec::new();
        }
        let mut scored: Vec<(&FactRecord, f64)> = self
            .records
            .iter()
            .filter_map(|r| {
                let rec_tokens = tokenize(&record_text(r));
                let hits = query_tokens.iter().filter(|t| rec_tokens.contains(*t)).count();
                if hits == 0 {
                    return None;
                }
                // Overlap relative to record size so short exact names beat
                // long vaguely-related blobs.
                let score = hits as f64 / (rec_tokens.len() as f64).sqrt();
                Some((r, score))
            })
            .collect();
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.id.cmp(&b.0.id))
        });
        scored.truncate(k);
        scored
    }
}

/// Textual rendering of a record — the input to both the embedding index
/// and keyword retrieval.
pub fn record_text(rec: &FactRecord) -> String {
    let mut parts: Vec<String> = Vec::new();
    parts.push(rec.name().to_string());
    parts.push(rec.category.as_str().replace('_', " "));
    if let Some(campus) = &rec.campus {
        parts.push(format!("{campus} campus"));
    }
    match rec.category {
        Category::Lot => {
            let permits = rec.allowed_permits();
            if !permits.is_empty() {
                parts.push(format!("permits {}", permits.join(" ")));
            }
        }
        Category::PermitRule => {
            if let Some(p) = rec.attr_text("permit_type") {
                parts.push(format!("permit {p}"));
            }
            if let Some(lots) = rec.attr_list("lot_ids") {
                parts.push(lots.join(" "));
            }
        }
        Category::BusRoute => {
            if let Some(stops) = rec.attr_list("stops") {
                parts.push(format!("stops {}", stops.join(" ")));
            }
        }
        Category::Building => {
            if let Some(stops) = rec.attr_list("bus_stops") {
                parts.push(format!("near {}", stops.join(" ")));
            }
            if let Some(aliases) = rec.attr_list("aliases") {
                parts.push(aliases.join(" "));
            }
        }
        Category::BusStop => {}
    }
    if let Some(notes) = rec.attr_text("notes") {
        parts.push(notes.to_string());
    }
    parts.join(". ")
}

/// Lowercased alphanumeric word set.
pub fn tokenize(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect()
}

// ── Validation ─────────────────────────────────────────────────────────

fn validate_record(rec: &FactRecord) -> EngineResult<()> {
    let fail = |msg: String| Err(EngineError::DataIntegrity(msg));

    if rec.id.trim().is_empty() {
        return fail("record with empty id".into());
    }

    let require_text = |key: &str| -> EngineResult<()> {
        match rec.attributes.get(key) {
            Some(AttrValue::Text(s)) if !s.trim().is_empty() => Ok(()),
            _ => Err(EngineError::DataIntegrity(format!(
                "record '{}' ({}) missing required text attribute '{key}'",
                rec.id,
                rec.category.as_str()
            ))),
        }
    };
    let require_list = |key: &str, min: usize| -> EngineResult<()> {
        match rec.attributes.get(key) {
            Some(AttrValue::List(v)) if v.len() >= min => Ok(()),
            _ => Err(EngineError::DataIntegrity(format!(
                "record '{}' ({}) missing required list attribute '{key}' (need ≥{min})",
                rec.id,
                rec.category.as_str()
            ))),
        }
    };

    match rec.category {
        Category::Lot => {
            require_text("name")?;
            require_list("allowed_permits", 1)?;
            if rec.campus.is_none() {
                return fail(format!("lot '{}' has no campus", rec.id));
            }
        }
        Category::PermitRule => {
            require_text("permit_type")?;
            require_list("lot_ids", 1)?;
        }
        Category::BusRoute => {
            require_text("route_id")?;
            require_list("stops", 2)?;
        }
        Category::BusStop => require_text("name")?,
        Category::Building => {
            require_text("name")?;
            if rec.campus.is_none() {
                return fail(format!("building '{}' has no campus", rec.id));
            }
        }
    }

    // Time window sanity: ordered hours, non-empty day sets, and no
    // overlapping windows within one record.
    for w in &rec.time_windows {
        if w.days.is_empty() {
            return fail(format!("record '{}' has a window with no days", rec.id));
        }
        if w.start >= w.end {
            return fail(format!(
                "record '{}' has a window with start >= end ({} >= {})",
                rec.id, w.start, w.end
            ));
        }
    }
    for (i, a) in rec.time_windows.iter().enumerate() {
        for b in rec.time_windows.iter().skip(i + 1) {
            if a.overlaps(b) {
                return fail(format!("record '{}' has overlapping time windows", rec.id));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::TimeWindow;
    use chrono::{NaiveTime, Weekday};
    use std::collections::BTreeMap;

    fn lot(id: &str, campus: &str, permits: &[&str]) -> FactRecord {
        let mut attributes = BTreeMap::new();
        attributes.insert("name".into(), AttrValue::Text(id.replace('_', " ")));
        attributes.insert(
            "allowed_permits".into(),
            AttrValue::List(permits.iter().map(|s| s.to_string()).collect()),
        );
        FactRecord {
            id: id.into(),
            category: Category::Lot,
            campus: Some(campus.into()),
            attributes,
            time_windows: vec![],
        }
    }

    #[test]
    fn duplicate_ids_rejected() {
        let err = FactStore::from_records(vec![
            lot("lot_51", "Livingston", &["Student B"]),
            lot("lot_51", "Livingston", &["Faculty"]),
        ])
        .unwrap_err();
        assert!(matches!(err, EngineError::DataIntegrity(_)), "{err}");
    }

    #[test]
    fn missing_required_attribute_rejected() {
        let mut rec = lot("lot_51", "Livingston", &["Student B"]);
        rec.attributes.remove("allowed_permits");
        let err = FactStore::from_records(vec![rec]).unwrap_err();
        assert!(err.to_string().contains("allowed_permits"), "{err}");
    }

    #[test]
    fn overlapping_windows_rejected() {
        let mut rec = lot("lot_8", "Busch", &["Commuter"]);
        let t = |s| NaiveTime::parse_from_str(s, "%H:%M:%S").unwrap();
        rec.time_windows = vec![
            TimeWindow { days: vec![Weekday::Mon], start: t("06:00:00"), end: t("12:00:00") },
            TimeWindow { days: vec![Weekday::Mon], start: t("10:00:00"), end: t("18:00:00") },
        ];
        let err = FactStore::from_records(vec![rec]).unwrap_err();
        assert!(err.to_string().contains("overlapping"), "{err}");
    }

    #[test]
    fn lookup_preserves_insertion_order() {
        let store = FactStore::from_records(vec![
            lot("lot_b", "Busch", &["Commuter"]),
            lot("lot_a", "Busch", &["Commuter"]),
        ])
        .unwrap();
        let lots = store.by_category(Category::Lot);
        assert_eq!(lots[0].id, "lot_b");
        assert_eq!(lots[1].id, "lot_a");
    }

    #[test]
    fn keyword_search_finds_named_lot() {
        let store = FactStore::from_records(vec![
            lot("lot_51", "Livingston", &["Student B", "Faculty"]),
            lot("yellow_lot", "College Avenue", &["Commuter"]),
        ])
        .unwrap();
        let hits = store.keyword_search("can I park in lot 51", 5);
        assert!(!hits.is_empty());
        assert_eq!(hits[0].0.id, "lot_51");
    }

    #[test]
    fn keyword_search_is_deterministic() {
        let store = FactStore::from_records(vec![
            lot("lot_a", "Busch", &["Commuter"]),
            lot("lot_b", "Busch", &["Commuter"]),
        ])
        .unwrap();
        let a: Vec<String> =
            store.keyword_search("busch lot", 5).iter().map(|(r, _)| r.id.clone()).collect();
        let b: Vec<String> =
            store.keyword_search("busch lot", 5).iter().map(|(r, _)| r.id.clone()).collect();
        assert_eq!(a, b);
    }
}
