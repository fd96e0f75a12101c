// RU-PATH Engine — Response Composer
//
// Words each turn's reply from the validated context bundle and nothing
// else. The generation model, when configured, only rephrases facts the
// orchestrator already validated; its output is checked post-hoc against
// the bundle and discarded for the deterministic wording on any mismatch
// or failure. Compose never errors — the engine always answers in chat
// shape.

use crate::atoms::types::{
    weekday_name, Category, ContextBundle, FactRecord, Intent, Query, Reply, Slot, TimeWindow,
    Verdict,
};
use crate::engine::eligibility::{REASON_HOURS, REASON_PERMIT};
use crate::engine::facts::FactStore;
use crate::engine::generation::GenerationClient;
use crate::engine::routing::RoutingEngine;
use log::warn;
use std::sync::Arc;

pub struct Composer {
    store: Arc<FactStore>,
    generation: Option<Arc<GenerationClient>>,
}

impl Composer {
    pub fn new(store: Arc<FactStore>, generation: Option<Arc<GenerationClient>>) -> Self {
        Composer { store, generation }
    }

    pub fn has_generation(&self) -> bool {
        self.generation.is_some()
    }

    /// Compose the reply for a resolved bundle. Returns the reply plus
    /// whether the generation fallback path was taken. `history` gives the
    /// model short-range conversational context; the deterministic path
    /// ignores it.
    pub async fn compose(
        &self,
        query: &Query,
        bundle: &ContextBundle,
        history: &[(String, String)],
    ) -> (Reply, bool) {
        let deterministic = self.deterministic_reply(query, bundle);

        // Bus plans and scope replies are already exact; generation only
        // rephrases fact-heavy parking/building answers.
        let worth_generating = matches!(
            bundle.intent,
            Some(Intent::ParkingEligibility) | Some(Intent::BuildingInfo)
        ) && !bundle.validated.is_empty();

        let Some(generation) = self.generation.as_ref().filter(|_| worth_generating) else {
            return (deterministic, false);
        };

        let system = self.grounding_prompt(bundle);
        let user = conversation_text(history, &query.raw_text);
        match generation.complete(&system, &user).await {
            Ok(text) if self.stays_grounded(&text, bundle) => {
                let reply = Reply { text, used_fact_ids: deterministic.used_fact_ids.clone() };
                (reply, false)
            }
            Ok(_) => {
                warn!("[composer] Generated reply left the grounded context — using deterministic wording");
                (deterministic, true)
            }
            Err(e) => {
                warn!("[composer] Generation failed ({e}) — using deterministic wording");
                (deterministic, true)
            }
        }
    }

    /// Ask for the missing slots. All of them are named up front so the
    /// user knows what a full answer needs, but the question itself targets
    /// the first — slots are resolved one at a time.
    pub fn clarification(&self, missing: &[Slot]) -> Reply {
        let Some(&slot) = missing.first() else {
            return self.help();
        };
        let question = match slot {
            Slot::PermitType => {
                let permits = self.store.permit_names();
                if permits.is_empty() {
                    "Which permit type do you have?".to_string()
                } else {
                    format!("Which permit type do you have? For example: {}.", permits.join(", "))
                }
            }
            Slot::Campus => {
                let campuses = self.store.campuses();
                if campuses.is_empty() {
                    "Which campus are you asking about?".to_string()
                } else {
                    format!("Which campus are you asking about? ({})", campuses.join(", "))
                }
            }
            Slot::Origin => "Where will you be starting from?".to_string(),
            Slot::Destination => "Where are you headed?".to_string(),
            Slot::Time => "What day and time are you asking about?".to_string(),
        };
        let text = if missing.len() > 1 {
            let names: Vec<&str> = missing.iter().map(|s| s.prompt_name()).collect();
            format!("To answer that I need your {}. {question}", join_names(&names))
        } else {
            question
        };
        Reply { text, used_fact_ids: vec![] }
    }

    /// Second ask for the same slot, phrased once more before the engine
    /// stops pressing and answers best-effort.
    pub fn reask(&self, slot: Slot) -> Reply {
        Reply {
            text: format!(
                "Sorry, I still need your {} to give a definite answer. Could you tell me?",
                slot.prompt_name()
            ),
            used_fact_ids: vec![],
        }
    }

    /// Best-effort overview when clarification was missed twice: describe
    /// the candidate lots without claiming a verdict.
    pub fn overview(&self, bundle: &ContextBundle) -> Reply {
        let lots: Vec<&FactRecord> = bundle
            .validated
            .iter()
            .filter_map(|f| self.store.get(&f.fact_id))
            .filter(|r| r.category == Category::Lot)
            .collect();
        if lots.is_empty() {
            return Reply {
                text: "I can't give a definite answer without that detail, and I don't have \
                       matching parking facts to summarize."
                    .into(),
                used_fact_ids: vec![],
            };
        }
        let mut lines =
            vec!["I can't give a definite answer without that detail, but here is what I know:".to_string()];
        for lot in &lots {
            lines.push(format!("• {}", describe_lot(lot)));
        }
        Reply {
            text: lines.join("\n"),
            used_fact_ids: lots.iter().map(|r| r.id.clone()).collect(),
        }
    }

    pub fn help(&self) -> Reply {
        let campuses = self.store.campuses();
        let mut text = String::from(
            "I can help with two things:\n\
             • Parking — e.g. \"Can I park in Lot 51 with a Student B permit?\"\n\
             • Buses — e.g. \"How do I get from Hill Center to the Livingston Student Center?\"",
        );
        if !campuses.is_empty() {
            text.push_str(&format!("\nI cover these campuses: {}.", campuses.join(", ")));
        }
        Reply { text, used_fact_ids: vec![] }
    }

    pub fn out_of_scope(&self) -> Reply {
        Reply {
            text: "I can only answer campus parking and bus questions. \
                   Ask me about a lot, a permit, or how to get between buildings."
                .into(),
            used_fact_ids: vec![],
        }
    }

    /// Honest empty-handed reply for a question with no grounded facts.
    pub fn no_grounding(&self, detail: &str) -> Reply {
        Reply {
            text: format!("I don't have information about that — {detail}"),
            used_fact_ids: vec![],
        }
    }

    // ── Deterministic wording ──────────────────────────────────────────

    fn deterministic_reply(&self, query: &Query, bundle: &ContextBundle) -> Reply {
        match bundle.intent {
            Some(Intent::BusRoute) => self.bus_reply(bundle),
            Some(Intent::ParkingEligibility) => self.parking_reply(query, bundle),
            Some(Intent::BuildingInfo) => self.building_reply(bundle),
            Some(Intent::Help) => self.help(),
            Some(Intent::General) | None => self.out_of_scope(),
        }
    }

    fn bus_reply(&self, bundle: &ContextBundle) -> Reply {
        let Some(plan) = &bundle.route_plan else {
            return self.no_grounding("I couldn't plan that bus trip.");
        };
        Reply {
            text: RoutingEngine::describe(plan),
            used_fact_ids: plan.used_fact_ids.clone(),
        }
    }

    fn parking_reply(&self, query: &Query, bundle: &ContextBundle) -> Reply {
        // A lot the user named is the one they asked about — it leads the
        // answer even when an allowed alternative outranks it.
        let named = query
            .entities
            .lot_id
            .as_deref()
            .and_then(|id| bundle.validated.iter().find(|f| f.fact_id == id));
        let Some(lead) = named.or_else(|| bundle.validated.first()) else {
            return self.no_grounding("no parking facts matched your question.");
        };
        let Some(lot) = self.store.get(&lead.fact_id) else {
            return self.no_grounding("no parking facts matched your question.");
        };
        let permit = query.entities.permit_type.as_deref().unwrap_or("that permit");

        let mut used_fact_ids = vec![lot.id.clone()];
        let text = match &lead.verdict {
            Some(Verdict::Allowed) => {
                let mut text = format!("Yes — {} is valid in {}.", permit, lot.name());
                // The windows of the rule that granted access, not the
                // lot's own: evening-only access must say so.
                if let Some(hours) = describe_windows(&lead.effective_windows) {
                    text.push_str(&format!(" Hours: {hours}."));
                }
                text
            }
            Some(Verdict::Denied { reason }) => {
                let mut text = format!(
                    "No — you can't park in {} with {}: {}.",
                    lot.name(),
                    permit,
                    reason_phrase(reason)
                );
                // Offer the nearest allowed alternatives from the same bundle.
                let alternatives: Vec<&FactRecord> = bundle
                    .validated
                    .iter()
                    .filter(|f| f.verdict == Some(Verdict::Allowed))
                    .filter_map(|f| self.store.get(&f.fact_id))
                    .take(3)
                    .collect();
                if !alternatives.is_empty() {
                    let names: Vec<&str> = alternatives.iter().map(|r| r.name()).collect();
                    text.push_str(&format!(" You could park in {} instead.", names.join(" or ")));
                    used_fact_ids.extend(alternatives.iter().map(|r| r.id.clone()));
                }
                text
            }
            Some(Verdict::Indeterminate { missing }) => {
                return self.clarification(&[*missing]);
            }
            None => {
                return self.overview(bundle);
            }
        };
        Reply { text, used_fact_ids }
    }

    fn building_reply(&self, bundle: &ContextBundle) -> Reply {
        let facts: Vec<&FactRecord> = bundle
            .validated
            .iter()
            .filter_map(|f| self.store.get(&f.fact_id))
            .collect();
        let Some(lead) = facts.first() else {
            return self.no_grounding("I don't know that building.");
        };
        let mut text = match &lead.campus {
            Some(campus) => format!("{} is on the {} campus.", lead.name(), campus),
            None => format!("I know {}.", lead.name()),
        };
        if let Some(stops) = lead.attr_list("bus_stops").filter(|s| !s.is_empty()) {
            text.push_str(&format!(" Nearest bus stops: {}.", stops.join(", ")));
        }
        Reply { text, used_fact_ids: vec![lead.id.clone()] }
    }

    // ── Generation guardrails ──────────────────────────────────────────

    /// System prompt carrying only validated facts. The model is told to
    /// answer strictly from them.
    fn grounding_prompt(&self, bundle: &ContextBundle) -> String {
        let mut prompt = String::from(
            "You are a campus parking and bus assistant. Answer ONLY from the \
             facts below. If they don't answer the question, say you don't \
             know. Never invent lots, permits, routes, or hours.\n\nFACTS:\n",
        );
        for fact in &bundle.validated {
            if let Some(rec) = self.store.get(&fact.fact_id) {
                prompt.push_str("- ");
                prompt.push_str(&crate::engine::facts::record_text(rec));
                if let Some(verdict) = &fact.verdict {
                    prompt.push_str(&format!(" [verdict: {}]", verdict_phrase(verdict)));
                }
                prompt.push('\n');
            }
        }
        prompt
    }

    /// Post-hoc grounding check: the generated text must not name a lot
    /// that is outside the validated set, and must not flip the lead
    /// verdict.
    fn stays_grounded(&self, text: &str, bundle: &ContextBundle) -> bool {
        let lower = text.to_lowercase();
        let validated_ids: Vec<&str> =
            bundle.validated.iter().map(|f| f.fact_id.as_str()).collect();
        for rec in self.store.by_category(Category::Lot) {
            let name = rec.name().to_lowercase();
            if !name.is_empty()
                && mentions(&lower, &name)
                && !validated_ids.contains(&rec.id.as_str())
            {
                return false;
            }
        }
        // A definite yes over a denied lead verdict is a contradiction.
        if let Some(lead) = bundle.validated.first() {
            if matches!(lead.verdict, Some(Verdict::Denied { .. })) && lower.starts_with("yes") {
                return false;
            }
            if matches!(lead.verdict, Some(Verdict::Allowed)) && lower.starts_with("no") {
                return false;
            }
        }
        true
    }
}

/// Whole-word occurrence check: "lot 5" must not match inside "lot 51".
fn mentions(haystack: &str, needle: &str) -> bool {
    let mut start = 0;
    while let Some(pos) = haystack[start..].find(needle) {
        let at = start + pos;
        let end = at + needle.len();
        let before_ok = haystack[..at].chars().next_back().map_or(true, |c| !c.is_alphanumeric());
        let after_ok = haystack[end..].chars().next().map_or(true, |c| !c.is_alphanumeric());
        if before_ok && after_ok {
            return true;
        }
        start = end;
    }
    false
}

/// "a", "a and b", "a, b and c".
fn join_names(names: &[&str]) -> String {
    match names {
        [] => String::new(),
        [one] => (*one).to_string(),
        [head @ .., last] => format!("{} and {last}", head.join(", ")),
    }
}

/// The generation user message: the last few turns, then the current one.
fn conversation_text(history: &[(String, String)], current: &str) -> String {
    if history.is_empty() {
        return current.to_string();
    }
    let mut text = String::from("Recent conversation:\n");
    for (role, content) in history {
        text.push_str(&format!("{role}: {content}\n"));
    }
    text.push_str(&format!("user: {current}"));
    text
}

fn describe_lot(lot: &FactRecord) -> String {
    let mut text = match &lot.campus {
        Some(campus) => format!("{} ({} campus)", lot.name(), campus),
        None => lot.name().to_string(),
    };
    let permits = lot.allowed_permits();
    if !permits.is_empty() {
        text.push_str(&format!(" — permits: {}", permits.join(", ")));
    }
    if let Some(hours) = describe_windows(&lot.time_windows) {
        text.push_str(&format!("; hours: {hours}"));
    }
    text
}

/// "Mon–Fri 6:00–22:00" style summary; `None` for always-effective.
fn describe_windows(windows: &[TimeWindow]) -> Option<String> {
    if windows.is_empty() {
        return None;
    }
    let parts: Vec<String> = windows
        .iter()
        .map(|w| {
            let days: Vec<&str> = w.days.iter().map(|d| weekday_name(*d)).collect();
            format!(
                "{} {}–{}",
                days.join("/"),
                w.start.format("%H:%M"),
                w.end.format("%H:%M")
            )
        })
        .collect();
    Some(parts.join("; "))
}

fn verdict_phrase(verdict: &Verdict) -> String {
    match verdict {
        Verdict::Allowed => "allowed".into(),
        Verdict::Denied { reason } => format!("denied ({reason})"),
        Verdict::Indeterminate { missing } => format!("unknown, missing {missing}"),
    }
}

/// User-facing phrasing for the fixed denial reasons.
fn reason_phrase(reason: &str) -> String {
    match reason {
        REASON_PERMIT => "that permit isn't accepted there".into(),
        REASON_HOURS => "your permit isn't valid there at that time".into(),
        other => other.to_string(),
    }
}
