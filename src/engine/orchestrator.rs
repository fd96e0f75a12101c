// RU-PATH Engine — Query Orchestrator
//
// Turns a classified query into a validated, ranked ContextBundle:
// retrieve candidates (embedding index, keyword fallback), validate them
// against the deterministic eligibility engine, rank, and cap. The bundle
// is the only context the composer may speak from.

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{
    Category, ContextBundle, Entities, Intent, Query, RankedFact, Verdict,
};
use crate::engine::config::{RankingPolicy, RetrievalConfig};
use crate::engine::eligibility;
use crate::engine::embedding::EmbeddingClient;
use crate::engine::facts::FactStore;
use crate::engine::index::EmbeddingIndex;
use crate::engine::routing::RoutingEngine;
use log::{debug, warn};
use std::sync::Arc;

pub struct Orchestrator {
    store: Arc<FactStore>,
    index: Arc<EmbeddingIndex>,
    embedder: Option<Arc<EmbeddingClient>>,
    routing: Arc<RoutingEngine>,
    retrieval: RetrievalConfig,
    ranking: RankingPolicy,
}

impl Orchestrator {
    pub fn new(
        store: Arc<FactStore>,
        index: Arc<EmbeddingIndex>,
        embedder: Option<Arc<EmbeddingClient>>,
        routing: Arc<RoutingEngine>,
        retrieval: RetrievalConfig,
        ranking: RankingPolicy,
    ) -> Self {
        Orchestrator { store, index, embedder, routing, retrieval, ranking }
    }

    /// Resolve one query into its context bundle. Pure with respect to
    /// session state: same query + entities → same bundle (modulo
    /// retrieval degradation).
    pub async fn resolve(&self, query: &Query) -> EngineResult<ContextBundle> {
        match query.intent {
            Intent::ParkingEligibility => self.resolve_parking(query).await,
            Intent::BusRoute => self.resolve_bus(query),
            Intent::BuildingInfo => self.resolve_building(query).await,
            Intent::Help | Intent::General => Ok(ContextBundle {
                intent: Some(query.intent),
                ..Default::default()
            }),
        }
    }

    // ── Parking eligibility ────────────────────────────────────────────

    async fn resolve_parking(&self, query: &Query) -> EngineResult<ContextBundle> {
        let mut bundle = ContextBundle { intent: Some(query.intent), ..Default::default() };

        // An explicitly named lot pins down the campus before slot checks.
        let entities = self.fill_campus_from_lot(&query.entities);

        bundle.missing_slots = entities.missing_for_eligibility();

        let (candidates, degraded) = self.retrieve(&query.raw_text).await;
        bundle.degraded_retrieval = degraded;

        // The named lot is always a candidate, even if retrieval missed it.
        let mut candidates = candidates;
        if let Some(lot_id) = &entities.lot_id {
            if !candidates.iter().any(|(id, _)| id == lot_id) {
                candidates.insert(0, (lot_id.clone(), 1.0));
            }
        }

        if !bundle.missing_slots.is_empty() {
            // Clarification turn: carry the candidate lots unvalidated so a
            // best-effort overview is possible if the user never answers.
            for (id, score) in candidates {
                let Some(rec) = self.store.get(&id) else { continue };
                if rec.category == Category::Lot && bundle.validated.len() < self.retrieval.max_bundle_facts {
                    bundle.validated.push(RankedFact {
                        fact_id: id,
                        score,
                        verdict: None,
                        effective_windows: vec![],
                    });
                }
            }
            return Ok(bundle);
        }

        for (id, score) in candidates {
            let Some(rec) = self.store.get(&id) else { continue };
            if rec.category != Category::Lot {
                bundle.rejected.push((id, "not a parking lot record".into()));
                continue;
            }
            // The explicitly named lot bypasses the similarity floor.
            let named = entities.lot_id.as_deref() == Some(rec.id.as_str());
            if !named && score < self.retrieval.min_similarity {
                bundle.rejected.push((id, "below similarity floor".into()));
                continue;
            }
            let (verdict, effective_windows) = eligibility::evaluate_lot(&self.store, rec, &entities);
            bundle.validated.push(RankedFact {
                fact_id: id,
                score,
                verdict: Some(verdict),
                effective_windows,
            });
        }

        if bundle.validated.is_empty() {
            return Err(EngineError::NoGroundedContext(
                "no parking facts matched the question".into(),
            ));
        }

        self.rank(&mut bundle.validated);
        bundle.validated.truncate(self.retrieval.max_bundle_facts);
        debug!(
            "[orchestrator] Parking bundle: {} validated, {} rejected, degraded={}",
            bundle.validated.len(),
            bundle.rejected.len(),
            bundle.degraded_retrieval
        );
        Ok(bundle)
    }

    /// Rank verdicts per policy: Allowed first, then retrieval similarity,
    /// then the narrowest effective window, then fact id for determinism.
    fn rank(&self, validated: &mut [RankedFact]) {
        let verdict_rank = |v: &Option<Verdict>| match v {
            Some(Verdict::Allowed) => 0u8,
            Some(Verdict::Indeterminate { .. }) => 1,
            Some(Verdict::Denied { .. }) => 2,
            None => 3,
        };
        validated.sort_by(|a, b| {
            let mut ord = std::cmp::Ordering::Equal;
            if self.ranking.allowed_first {
                ord = verdict_rank(&a.verdict).cmp(&verdict_rank(&b.verdict));
            }
            ord = ord.then_with(|| {
                b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal)
            });
            if self.ranking.narrowest_window_tiebreak {
                ord = ord.then_with(|| {
                    let spec = |f: &RankedFact| {
                        self.store.get(&f.fact_id).map_or(i64::MAX, eligibility::specificity)
                    };
                    spec(a).cmp(&spec(b))
                });
            }
            ord.then_with(|| a.fact_id.cmp(&b.fact_id))
        });
    }

    // ── Bus routing ────────────────────────────────────────────────────

    fn resolve_bus(&self, query: &Query) -> EngineResult<ContextBundle> {
        let mut bundle = ContextBundle { intent: Some(query.intent), ..Default::default() };
        let entities = &query.entities;

        if entities.origin.is_none() {
            bundle.missing_slots.push(crate::atoms::types::Slot::Origin);
        }
        if entities.destination.is_none() {
            bundle.missing_slots.push(crate::atoms::types::Slot::Destination);
        }
        if !bundle.missing_slots.is_empty() {
            return Ok(bundle);
        }

        let plan = self.routing.plan(
            entities.origin.as_deref().unwrap_or_default(),
            entities.destination.as_deref().unwrap_or_default(),
        )?;
        bundle.validated = plan
            .used_fact_ids
            .iter()
            .map(|id| RankedFact {
                fact_id: id.clone(),
                score: 1.0,
                verdict: None,
                effective_windows: vec![],
            })
            .collect();
        bundle.route_plan = Some(plan);
        Ok(bundle)
    }

    // ── Building info ──────────────────────────────────────────────────

    async fn resolve_building(&self, query: &Query) -> EngineResult<ContextBundle> {
        let mut bundle = ContextBundle { intent: Some(query.intent), ..Default::default() };
        let (candidates, degraded) = self.retrieve(&query.raw_text).await;
        bundle.degraded_retrieval = degraded;

        for (id, score) in candidates {
            let Some(rec) = self.store.get(&id) else { continue };
            match rec.category {
                Category::Building | Category::BusStop if score >= self.retrieval.min_similarity => {
                    bundle.validated.push(RankedFact {
                        fact_id: id,
                        score,
                        verdict: None,
                        effective_windows: vec![],
                    });
                }
                _ => bundle.rejected.push((id, "not a building record".into())),
            }
        }
        if bundle.validated.is_empty() {
            return Err(EngineError::NoGroundedContext(
                "no building facts matched the question".into(),
            ));
        }
        bundle.validated.truncate(self.retrieval.max_bundle_facts);
        Ok(bundle)
    }

    // ── Retrieval ──────────────────────────────────────────────────────

    /// Candidate facts for a query: embedding index when available,
    /// keyword scoring otherwise. The second element reports degraded
    /// (keyword-fallback) mode.
    async fn retrieve(&self, text: &str) -> (Vec<(String, f64)>, bool) {
        if let Some(embedder) = &self.embedder {
            match self.index.query(text, self.retrieval.top_k, embedder).await {
                Ok(scored) => return (scored, false),
                Err(e) => {
                    warn!("[orchestrator] Embedding retrieval unavailable ({e}) — keyword fallback");
                }
            }
        }
        let scored = self
            .store
            .keyword_search(text, self.retrieval.top_k)
            .into_iter()
            .map(|(rec, score)| (rec.id.clone(), score))
            .collect();
        (scored, true)
    }

    /// A named lot implies its campus; resolve it from the record so the
    /// slot check and eligibility evaluation see a concrete campus.
    fn fill_campus_from_lot(&self, entities: &Entities) -> Entities {
        let mut out = entities.clone();
        if out.campus.is_none() {
            if let Some(lot) = out.lot_id.as_deref().and_then(|id| self.store.get(id)) {
                out.campus = lot.campus.clone();
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::{AttrValue, FactRecord, Slot, TimeWindow};
    use chrono::{NaiveTime, Utc, Weekday};
    use std::collections::BTreeMap;

    fn lot(id: &str, name: &str, campus: &str, permits: &[&str], windows: Vec<TimeWindow>) -> FactRecord {
        let mut attributes = BTreeMap::new();
        attributes.insert("name".into(), AttrValue::Text(name.into()));
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

    fn store() -> Arc<FactStore> {
        Arc::new(
            FactStore::from_records(vec![
                lot("lot_51", "Lot 51", "Livingston", &["Student B", "Faculty"], vec![]),
                lot(
                    "lot_8",
                    "Lot 8",
                    "Busch",
                    &["Commuter"],
                    vec![TimeWindow {
                        days: vec![
                            Weekday::Mon,
                            Weekday::Tue,
                            Weekday::Wed,
                            Weekday::Thu,
                            Weekday::Fri,
                        ],
                        start: NaiveTime::from_hms_opt(6, 0, 0).unwrap(),
                        end: NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
                    }],
                ),
            ])
            .unwrap(),
        )
    }

    fn orchestrator(store: Arc<FactStore>) -> Orchestrator {
        let routing = Arc::new(RoutingEngine::build(&store));
        Orchestrator::new(
            store,
            Arc::new(EmbeddingIndex::new()),
            None,
            routing,
            RetrievalConfig::default(),
            RankingPolicy::default(),
        )
    }

    fn query(text: &str, intent: Intent, entities: Entities) -> Query {
        Query { raw_text: text.into(), timestamp: Utc::now(), intent, entities }
    }

    #[tokio::test]
    async fn named_lot_yields_allowed_verdict() {
        let orch = orchestrator(store());
        let entities = Entities {
            permit_type: Some("Student B".into()),
            lot_id: Some("lot_51".into()),
            ..Default::default()
        };
        let bundle = orch
            .resolve(&query("Can I park in Lot 51 with a Student B permit?", Intent::ParkingEligibility, entities))
            .await
            .unwrap();

        assert!(bundle.missing_slots.is_empty(), "{:?}", bundle.missing_slots);
        assert_eq!(bundle.validated[0].fact_id, "lot_51");
        assert_eq!(bundle.validated[0].verdict, Some(Verdict::Allowed));
        assert!(bundle.degraded_retrieval, "no embedder configured");
    }

    #[tokio::test]
    async fn missing_permit_requests_clarification() {
        let orch = orchestrator(store());
        let entities = Entities { lot_id: Some("lot_51".into()), ..Default::default() };
        let bundle = orch
            .resolve(&query("Can I park in Lot 51?", Intent::ParkingEligibility, entities))
            .await
            .unwrap();

        assert_eq!(bundle.missing_slots, vec![Slot::PermitType]);
        // Candidates carried without verdicts for a later overview.
        assert!(bundle.validated.iter().all(|f| f.verdict.is_none()));
    }

    #[tokio::test]
    async fn allowed_ranks_above_denied() {
        let orch = orchestrator(store());
        let entities = Entities {
            permit_type: Some("Student B".into()),
            campus: Some("Livingston".into()),
            ..Default::default()
        };
        let bundle = orch
            .resolve(&query("parking lot permit", Intent::ParkingEligibility, entities))
            .await
            .unwrap();

        assert!(!bundle.validated.is_empty());
        assert_eq!(bundle.validated[0].fact_id, "lot_51");
        assert_eq!(bundle.validated[0].verdict, Some(Verdict::Allowed));
    }

    #[tokio::test]
    async fn unrelated_question_has_no_grounded_context() {
        let orch = orchestrator(store());
        let entities = Entities {
            permit_type: Some("Student B".into()),
            campus: Some("Livingston".into()),
            ..Default::default()
        };
        let err = orch
            .resolve(&query("zzz qqq xxx", Intent::ParkingEligibility, entities))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NoGroundedContext(_)), "{err}");
    }

    #[tokio::test]
    async fn bus_without_origin_asks_for_it() {
        let orch = orchestrator(store());
        let entities = Entities {
            destination: Some("Hill Center".into()),
            ..Default::default()
        };
        let bundle = orch
            .resolve(&query("which bus goes to Hill Center?", Intent::BusRoute, entities))
            .await
            .unwrap();
        assert_eq!(bundle.missing_slots, vec![Slot::Origin]);
        assert!(bundle.route_plan.is_none());
    }

    #[tokio::test]
    async fn resolve_is_deterministic() {
        let orch = orchestrator(store());
        let entities = Entities {
            permit_type: Some("Commuter".into()),
            campus: Some("Busch".into()),
            ..Default::default()
        };
        let q = query("can I park in a lot on Busch", Intent::ParkingEligibility, entities);
        let a = orch.resolve(&q).await.unwrap();
        let b = orch.resolve(&q).await.unwrap();
        assert_eq!(a.validated, b.validated);
        assert_eq!(a.missing_slots, b.missing_slots);
    }
}
