// RU-PATH Engine — Eligibility Engine
//
// The single source of truth for yes/no parking legality. Pure functions
// of (record, entities): no hidden state, no I/O, reproducible. Missing
// required slots return `Indeterminate` naming the slot rather than a
// guess — this is what keeps hallucinated eligibility claims out of the
// pipeline.

use crate::atoms::types::{Entities, FactRecord, Slot, TimeWindow, Verdict};
use crate::engine::facts::FactStore;
use log::warn;

/// Reason string for the permit-mismatch denial. Fixed so callers and
/// tests can rely on it.
pub const REASON_PERMIT: &str = "permit not in allowed set";
pub const REASON_HOURS: &str = "outside permitted hours";

/// Evaluate one record against the resolved entities:
/// (a) campus must match exactly;
/// (b) permit must be in the record's allowed set;
/// (c) with a time entity present, at least one window (or the
///     always-effective no-window case) must cover it;
/// (d) missing permit/campus slots yield `Indeterminate`, never a guess.
pub fn evaluate(record: &FactRecord, entities: &Entities) -> Verdict {
    let Some(permit) = entities.permit_type.as_deref() else {
        return Verdict::Indeterminate { missing: Slot::PermitType };
    };
    let Some(campus) = entities.campus.as_deref() else {
        return Verdict::Indeterminate { missing: Slot::Campus };
    };

    if let Some(record_campus) = record.campus.as_deref() {
        if !record_campus.eq_ignore_ascii_case(campus) {
            return Verdict::Denied {
                reason: format!("located on the {record_campus} campus, not {campus}"),
            };
        }
    }

    if !permit_allowed(record.allowed_permits(), permit) {
        return Verdict::Denied { reason: REASON_PERMIT.into() };
    }

    window_verdict(record, entities)
}

/// Evaluate a lot together with every permit rule that applies to it.
/// When rules conflict, the most time-specific (narrowest window) wins;
/// equally specific conflicting rules fail closed to `Denied` and are
/// logged for data-quality follow-up.
///
/// The returned windows belong to the winning source — a composer needs
/// them to qualify an `Allowed` that only holds during certain hours.
pub fn evaluate_lot(
    store: &FactStore,
    lot: &FactRecord,
    entities: &Entities,
) -> (Verdict, Vec<TimeWindow>) {
    let Some(permit) = entities.permit_type.as_deref() else {
        return (Verdict::Indeterminate { missing: Slot::PermitType }, vec![]);
    };
    let Some(campus) = entities.campus.as_deref() else {
        return (Verdict::Indeterminate { missing: Slot::Campus }, vec![]);
    };

    if let Some(lot_campus) = lot.campus.as_deref() {
        if !lot_campus.eq_ignore_ascii_case(campus) {
            let reason = format!("located on the {lot_campus} campus, not {campus}");
            return (Verdict::Denied { reason }, vec![]);
        }
    }

    // Every source that grants this permit access to the lot, with its
    // time-window specificity.
    let mut verdicts: Vec<(i64, Verdict, Vec<TimeWindow>)> = Vec::new();
    if permit_allowed(lot.allowed_permits(), permit) {
        verdicts.push((specificity(lot), window_verdict(lot, entities), lot.time_windows.clone()));
    }
    for rule in store.rules_for_lot(&lot.id) {
        let rule_permit = rule.attr_text("permit_type").unwrap_or_default();
        if normalize(rule_permit) == normalize(permit) {
            verdicts.push((
                specificity(rule),
                window_verdict(rule, entities),
                rule.time_windows.clone(),
            ));
        }
    }

    if verdicts.is_empty() {
        return (Verdict::Denied { reason: REASON_PERMIT.into() }, vec![]);
    }
    resolve_conflicts(lot.name(), verdicts)
}

/// Pick the winning verdict among conflicting rules for one lot.
/// Narrowest window wins; an exact specificity tie with disagreement is a
/// data-quality problem and fails closed.
pub fn resolve_conflicts(
    lot_name: &str,
    mut verdicts: Vec<(i64, Verdict, Vec<TimeWindow>)>,
) -> (Verdict, Vec<TimeWindow>) {
    debug_assert!(!verdicts.is_empty());
    verdicts.sort_by_key(|(spec, _, _)| *spec);

    let (best_spec, winner, windows) = verdicts[0].clone();
    let conflicting_tie = verdicts
        .iter()
        .any(|(spec, v, _)| *spec == best_spec && *v != winner);
    if conflicting_tie {
        warn!(
            "[eligibility] Equally specific conflicting rules for '{lot_name}' — failing closed"
        );
        return (Verdict::Denied { reason: "conflicting rules for this lot".into() }, vec![]);
    }
    (winner, windows)
}

// ── Internals ──────────────────────────────────────────────────────────

/// Time-window check for a record whose campus/permit gates already
/// passed. No windows → always effective, independent of the time entity.
fn window_verdict(record: &FactRecord, entities: &Entities) -> Verdict {
    if record.time_windows.is_empty() {
        return Verdict::Allowed;
    }
    match entities.time.as_ref().filter(|t| !t.is_empty()) {
        None => Verdict::Allowed,
        Some(at) => {
            if record.time_windows.iter().any(|w| w.covers(at)) {
                Verdict::Allowed
            } else {
                Verdict::Denied { reason: REASON_HOURS.into() }
            }
        }
    }
}

/// Total effective minutes per week — lower is more specific. Records with
/// no windows are always-effective and therefore least specific.
pub fn specificity(record: &FactRecord) -> i64 {
    if record.time_windows.is_empty() {
        return i64::MAX;
    }
    record.time_windows.iter().map(|w| w.span_minutes()).sum()
}

fn permit_allowed(allowed: &[String], permit: &str) -> bool {
    let want = normalize(permit);
    allowed.iter().any(|p| normalize(p) == want)
}

/// Lowercased alphanumeric form, so "Student B" matches "StudentB".
fn normalize(s: &str) -> String {
    s.chars().filter(|c| c.is_alphanumeric()).flat_map(|c| c.to_lowercase()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::{AttrValue, Category, TimeRef, TimeWindow};
    use chrono::{NaiveTime, Weekday};
    use std::collections::BTreeMap;

    fn lot(id: &str, campus: &str, permits: &[&str], windows: Vec<TimeWindow>) -> FactRecord {
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
            time_windows: windows,
        }
    }

    fn entities(permit: Option<&str>, campus: Option<&str>) -> Entities {
        Entities {
            permit_type: permit.map(|s| s.to_string()),
            campus: campus.map(|s| s.to_string()),
            ..Default::default()
        }
    }

    fn t(s: &str) -> NaiveTime {
        NaiveTime::parse_from_str(s, "%H:%M:%S").unwrap()
    }

    #[test]
    fn student_b_allowed_in_lot_51() {
        let lot51 = lot("lot_51", "Livingston", &["Student B", "Faculty"], vec![]);
        let v = evaluate(&lot51, &entities(Some("Student B"), Some("Livingston")));
        assert_eq!(v, Verdict::Allowed);
    }

    #[test]
    fn commuter_denied_in_lot_51() {
        let lot51 = lot("lot_51", "Livingston", &["Student B", "Faculty"], vec![]);
        let v = evaluate(&lot51, &entities(Some("Commuter"), Some("Livingston")));
        assert_eq!(v, Verdict::Denied { reason: REASON_PERMIT.into() });
    }

    #[test]
    fn permit_match_ignores_spacing_and_case() {
        let lot51 = lot("lot_51", "Livingston", &["StudentB"], vec![]);
        let v = evaluate(&lot51, &entities(Some("student b"), Some("livingston")));
        assert_eq!(v, Verdict::Allowed);
    }

    #[test]
    fn missing_slots_are_indeterminate_not_guessed() {
        let lot51 = lot("lot_51", "Livingston", &["Student B"], vec![]);
        assert_eq!(
            evaluate(&lot51, &entities(None, Some("Livingston"))),
            Verdict::Indeterminate { missing: Slot::PermitType }
        );
        assert_eq!(
            evaluate(&lot51, &entities(Some("Student B"), None)),
            Verdict::Indeterminate { missing: Slot::Campus }
        );
    }

    #[test]
    fn campus_mismatch_is_denied() {
        let lot51 = lot("lot_51", "Livingston", &["Student B"], vec![]);
        let v = evaluate(&lot51, &entities(Some("Student B"), Some("Busch")));
        assert!(matches!(v, Verdict::Denied { .. }), "{v:?}");
    }

    #[test]
    fn no_window_record_ignores_time_entity() {
        let lot51 = lot("lot_51", "Livingston", &["Student B"], vec![]);
        let mut with_time = entities(Some("Student B"), Some("Livingston"));
        with_time.time = Some(TimeRef {
            weekday: Some(Weekday::Sun),
            time: Some(t("03:00:00")),
        });
        // Verdict must be identical with and without the time entity, and
        // never Indeterminate solely because of it.
        assert_eq!(evaluate(&lot51, &with_time), Verdict::Allowed);
        assert_eq!(
            evaluate(&lot51, &entities(Some("Student B"), Some("Livingston"))),
            Verdict::Allowed
        );
    }

    #[test]
    fn window_denies_outside_hours() {
        let windows = vec![TimeWindow {
            days: vec![Weekday::Mon, Weekday::Tue, Weekday::Wed, Weekday::Thu, Weekday::Fri],
            start: t("06:00:00"),
            end: t("22:00:00"),
        }];
        let lot8 = lot("lot_8", "Busch", &["Commuter"], windows);
        let mut e = entities(Some("Commuter"), Some("Busch"));

        e.time = Some(TimeRef { weekday: Some(Weekday::Mon), time: Some(t("09:00:00")) });
        assert_eq!(evaluate(&lot8, &e), Verdict::Allowed);

        e.time = Some(TimeRef { weekday: Some(Weekday::Sun), time: Some(t("09:00:00")) });
        assert_eq!(evaluate(&lot8, &e), Verdict::Denied { reason: REASON_HOURS.into() });

        // Without a time entity the rule is evaluated as effective.
        e.time = None;
        assert_eq!(evaluate(&lot8, &e), Verdict::Allowed);
    }

    #[test]
    fn narrowest_window_wins_conflicts() {
        let broad = (10_000i64, Verdict::Denied { reason: REASON_HOURS.into() }, vec![]);
        let narrow = (600i64, Verdict::Allowed, vec![]);
        let (v, _) = resolve_conflicts("lot 8", vec![broad, narrow]);
        assert_eq!(v, Verdict::Allowed);
    }

    #[test]
    fn equal_specificity_conflict_fails_closed() {
        let a = (600i64, Verdict::Allowed, vec![]);
        let b = (600i64, Verdict::Denied { reason: REASON_HOURS.into() }, vec![]);
        let (v, _) = resolve_conflicts("lot 8", vec![a, b]);
        assert!(matches!(v, Verdict::Denied { .. }), "{v:?}");
    }

    #[test]
    fn permit_rule_extends_lot_access() {
        let lot51 = lot("lot_51", "Livingston", &["Faculty"], vec![]);
        let mut attributes = BTreeMap::new();
        attributes.insert("permit_type".into(), AttrValue::Text("Commuter".into()));
        attributes.insert("lot_ids".into(), AttrValue::List(vec!["lot_51".into()]));
        let rule = FactRecord {
            id: "rule_evening".into(),
            category: Category::PermitRule,
            campus: Some("Livingston".into()),
            attributes,
            time_windows: vec![TimeWindow {
                days: vec![Weekday::Mon, Weekday::Tue, Weekday::Wed, Weekday::Thu, Weekday::Fri],
                start: t("17:00:00"),
                end: t("23:00:00"),
            }],
        };
        let store = FactStore::from_records(vec![lot51, rule]).unwrap();
        let lot51 = store.get("lot_51").unwrap();

        let mut e = entities(Some("Commuter"), Some("Livingston"));
        e.time = Some(TimeRef { weekday: Some(Weekday::Mon), time: Some(t("18:00:00")) });
        assert_eq!(evaluate_lot(&store, lot51, &e).0, Verdict::Allowed);

        e.time = Some(TimeRef { weekday: Some(Weekday::Mon), time: Some(t("10:00:00")) });
        assert_eq!(
            evaluate_lot(&store, lot51, &e).0,
            Verdict::Denied { reason: REASON_HOURS.into() }
        );
    }

    #[test]
    fn timeless_allowed_carries_the_winning_rule_windows() {
        let lot51 = lot("lot_51", "Livingston", &["Faculty"], vec![]);
        let mut attributes = BTreeMap::new();
        attributes.insert("permit_type".into(), AttrValue::Text("Commuter".into()));
        attributes.insert("lot_ids".into(), AttrValue::List(vec!["lot_51".into()]));
        let rule = FactRecord {
            id: "rule_evening".into(),
            category: Category::PermitRule,
            campus: Some("Livingston".into()),
            attributes,
            time_windows: vec![TimeWindow {
                days: vec![Weekday::Mon, Weekday::Tue, Weekday::Wed, Weekday::Thu, Weekday::Fri],
                start: t("17:00:00"),
                end: t("23:00:00"),
            }],
        };
        let store = FactStore::from_records(vec![lot51, rule]).unwrap();
        let lot51 = store.get("lot_51").unwrap();

        // No time entity: the verdict is Allowed, but only inside the
        // evening rule's windows — they must travel with it.
        let (v, windows) = evaluate_lot(&store, lot51, &entities(Some("Commuter"), Some("Livingston")));
        assert_eq!(v, Verdict::Allowed);
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].start, t("17:00:00"));

        // An unconditionally allowed permit carries no windows.
        let (v, windows) = evaluate_lot(&store, lot51, &entities(Some("Faculty"), Some("Livingston")));
        assert_eq!(v, Verdict::Allowed);
        assert!(windows.is_empty());
    }
}
