// RU-PATH Engine — Bus Routing
//
// Plans building-to-building journeys over a stop graph derived from the
// fact store's bus_route and building records.
//
// Strategy:
//   1. Resolve origin & destination free text — building (alias + fuzzy
//      match) or, failing that, a bus stop name directly.
//   2. Prefer a direct single-route path between any origin/destination
//      stop pair.
//   3. Otherwise BFS the stop graph for the fewest-hops path and compress
//      it into route legs via the edge→routes map.

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{Category, RouteLeg, RoutePlan};
use crate::engine::facts::{tokenize, FactStore};
use std::collections::{BTreeSet, HashMap, VecDeque};

struct BuildingEntry {
    name: String,
    stops: Vec<String>,
    record_id: String,
}

struct RouteEntry {
    tag: String,
    stops: Vec<String>,
    record_id: String,
}

/// Immutable routing tables, built once from the fact store.
pub struct RoutingEngine {
    routes: Vec<RouteEntry>,
    stop_graph: HashMap<String, BTreeSet<String>>,
    edge_routes: HashMap<(String, String), BTreeSet<String>>,
    buildings: HashMap<String, BuildingEntry>,
    aliases: HashMap<String, String>,
    stop_names: Vec<String>,
}

impl RoutingEngine {
    pub fn build(store: &FactStore) -> Self {
        let mut routes = Vec::new();
        let mut stop_graph: HashMap<String, BTreeSet<String>> = HashMap::new();
        let mut edge_routes: HashMap<(String, String), BTreeSet<String>> = HashMap::new();
        let mut stop_set: BTreeSet<String> = BTreeSet::new();

        for rec in store.by_category(Category::BusRoute) {
            let tag = rec.attr_text("route_id").unwrap_or(&rec.id).to_string();
            let stops: Vec<String> = rec
                .attr_list("stops")
                .unwrap_or(&[])
                .iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            for pair in stops.windows(2) {
                let (a, b) = (pair[0].clone(), pair[1].clone());
                stop_graph.entry(a.clone()).or_default().insert(b.clone());
                stop_graph.entry(b.clone()).or_default().insert(a.clone());
                edge_routes.entry((a.clone(), b.clone())).or_default().insert(tag.clone());
                edge_routes.entry((b, a)).or_default().insert(tag.clone());
            }
            stop_set.extend(stops.iter().cloned());
            routes.push(RouteEntry { tag, stops, record_id: rec.id.clone() });
        }
        for rec in store.by_category(Category::BusStop) {
            stop_set.insert(rec.name().to_string());
        }

        let stop_names: Vec<String> = stop_set.into_iter().collect();

        let mut buildings = HashMap::new();
        let mut aliases = HashMap::new();
        for rec in store.by_category(Category::Building) {
            let key = norm_key(rec.name());
            // Building stop labels resolved to canonical graph nodes up
            // front, unique in order.
            let mut stops = Vec::new();
            for label in rec.attr_list("bus_stops").unwrap_or(&[]) {
                if let Some(canon) = resolve_stop_label(label, &stop_names) {
                    if !stops.contains(&canon) {
                        stops.push(canon);
                    }
                }
            }
            for alias in rec.attr_list("aliases").unwrap_or(&[]) {
                aliases.insert(norm_key(alias), key.clone());
            }
            buildings.insert(
                key,
                BuildingEntry { name: rec.name().to_string(), stops, record_id: rec.id.clone() },
            );
        }

        RoutingEngine { routes, stop_graph, edge_routes, buildings, aliases, stop_names }
    }

    /// Plan a journey between two free-text places. All failures are
    /// `NoGroundedContext` with a user-facing message — the engine never
    /// fabricates a route.
    pub fn plan(&self, origin_text: &str, dest_text: &str) -> EngineResult<RoutePlan> {
        let (origin, origin_stops) = self.resolve_place(origin_text).ok_or_else(|| {
            EngineError::NoGroundedContext(format!(
                "I couldn't find a building or bus stop named \"{origin_text}\"."
            ))
        })?;
        let (dest, dest_stops) = self.resolve_place(dest_text).ok_or_else(|| {
            EngineError::NoGroundedContext(format!(
                "I couldn't find a building or bus stop named \"{dest_text}\"."
            ))
        })?;

        if origin_stops.is_empty() {
            return Err(EngineError::NoGroundedContext(format!(
                "I don't know any bus stops near {}.",
                origin.0
            )));
        }
        if dest_stops.is_empty() {
            return Err(EngineError::NoGroundedContext(format!(
                "I don't know any bus stops near {}.",
                dest.0
            )));
        }

        // 1) Direct single-route solution across all stop pairs.
        let mut best_direct: Option<(String, String, String, Vec<String>)> = None;
        for s in &origin_stops {
            for t in &dest_stops {
                if let Some((tag, path)) = self.direct_path(s, t) {
                    let better = best_direct.as_ref().map_or(true, |b| path.len() < b.3.len());
                    if better {
                        best_direct = Some((s.clone(), t.clone(), tag, path));
                    }
                }
            }
        }
        if let Some((start, end, tag, path)) = best_direct {
            let legs = vec![RouteLeg {
                route_id: Some(tag),
                from_stop: path[0].clone(),
                to_stop: path[path.len() - 1].clone(),
                stops: path.clone(),
            }];
            return Ok(self.finish_plan(origin, dest, start, end, path, legs));
        }

        // 2) Fallback: BFS over the stop graph + leg compression.
        let mut best: Option<(String, String, Vec<String>)> = None;
        for s in &origin_stops {
            for t in &dest_stops {
                if let Some(path) = self.shortest_path(s, t) {
                    let better = best.as_ref().map_or(true, |b| path.len() < b.2.len());
                    if better {
                        best = Some((s.clone(), t.clone(), path));
                    }
                }
            }
        }
        let Some((start, end, path)) = best else {
            return Err(EngineError::NoGroundedContext(format!(
                "I couldn't find any bus path between {} and {}.",
                origin.0, dest.0
            )));
        };
        let legs = self.build_legs(&path);
        Ok(self.finish_plan(origin, dest, start, end, path, legs))
    }

    /// Turn a plan into step-by-step directions, using only canonical stop
    /// names from the dataset.
    pub fn describe(plan: &RoutePlan) -> String {
        let mut lines = Vec::new();
        if plan.origin_name != plan.origin_stop {
            lines.push(format!("From {}, walk to the {} stop.", plan.origin_name, plan.origin_stop));
        } else {
            lines.push(format!("Start at the {} stop.", plan.origin_stop));
        }
        for (i, leg) in plan.legs.iter().enumerate() {
            match &leg.route_id {
                Some(tag) => lines.push(format!(
                    "{}. Take route {} from {} to {}.",
                    i + 1,
                    tag,
                    leg.from_stop,
                    leg.to_stop
                )),
                None => lines.push(format!(
                    "{}. Travel from {} to {}.",
                    i + 1,
                    leg.from_stop,
                    leg.to_stop
                )),
            }
        }
        if plan.dest_name != plan.dest_stop {
            lines.push(format!("Get off at {} and walk to {}.", plan.dest_stop, plan.dest_name));
        } else {
            lines.push(format!("Get off at {}.", plan.dest_stop));
        }
        lines.join("\n")
    }

    // ── Place & stop resolution ────────────────────────────────────────

    /// Resolve free text to ((display name, fact id), nearby stops).
    /// Buildings first (exact key, alias, fuzzy), then bus stops directly.
    fn resolve_place(&self, text: &str) -> Option<((String, Option<String>), Vec<String>)> {
        let key = norm_key(text);
        if key.is_empty() {
            return None;
        }

        let building_key = if self.buildings.contains_key(&key) {
            Some(key.clone())
        } else if let Some(canon) = self.aliases.get(&key) {
            Some(canon.clone())
        } else {
            self.fuzzy_building(&key)
        };
        if let Some(bk) = building_key {
            let b = &self.buildings[&bk];
            return Some(((b.name.clone(), Some(b.record_id.clone())), b.stops.clone()));
        }

        let stop = resolve_stop_label(text, &self.stop_names)?;
        Some(((stop.clone(), None), vec![stop]))
    }

    fn fuzzy_building(&self, key: &str) -> Option<String> {
        let mut best: Option<(f64, &String)> = None;
        for candidate in self.buildings.keys() {
            let score = text_similarity(key, candidate);
            let better = match best {
                None => true,
                // Tie-break by key for determinism.
                Some((s, k)) => score > s || (score == s && candidate < k),
            };
            if better {
                best = Some((score, candidate));
            }
        }
        best.filter(|(score, _)| *score >= 0.6).map(|(_, k)| k.clone())
    }

    // ── Graph search ───────────────────────────────────────────────────

    /// A single route containing both stops. Returns (route tag, stop
    /// sub-path) for the shortest such ride.
    fn direct_path(&self, start: &str, goal: &str) -> Option<(String, Vec<String>)> {
        let mut best: Option<(String, Vec<String>)> = None;
        for route in &self.routes {
            let Some(i1) = route.stops.iter().position(|s| s == start) else { continue };
            let Some(i2) = route.stops.iter().position(|s| s == goal) else { continue };
            let (lo, hi) = (i1.min(i2), i1.max(i2));
            let mut sub: Vec<String> = route.stops[lo..=hi].to_vec();
            if i1 > i2 {
                sub.reverse();
            }
            if best.as_ref().map_or(true, |b| sub.len() < b.1.len()) {
                best = Some((route.tag.clone(), sub));
            }
        }
        best
    }

    /// Unweighted shortest path (BFS) on the stop graph. Neighbor sets are
    /// ordered, so the result is deterministic.
    fn shortest_path(&self, start: &str, goal: &str) -> Option<Vec<String>> {
        if start == goal {
            return Some(vec![start.to_string()]);
        }
        if !self.stop_graph.contains_key(start) || !self.stop_graph.contains_key(goal) {
            return None;
        }

        let mut queue = VecDeque::from([start.to_string()]);
        let mut prev: HashMap<String, Option<String>> = HashMap::from([(start.to_string(), None)]);

        while let Some(u) = queue.pop_front() {
            for v in &self.stop_graph[&u] {
                if prev.contains_key(v) {
                    continue;
                }
                prev.insert(v.clone(), Some(u.clone()));
                if v == goal {
                    let mut path = vec![v.clone()];
                    while let Some(Some(p)) = prev.get(path.last().unwrap()) {
                        path.push(p.clone());
                    }
                    path.reverse();
                    return Some(path);
                }
                queue.push_back(v.clone());
            }
        }
        None
    }

    /// Compress a stop path into route legs, greedily extending each leg
    /// while a single route covers every edge in it.
    fn build_legs(&self, path: &[String]) -> Vec<RouteLeg> {
        let mut legs = Vec::new();
        if path.len() < 2 {
            return legs;
        }
        let edges: Vec<(&String, &String)> = path.iter().zip(path.iter().skip(1)).collect();
        let empty = BTreeSet::new();

        let mut i = 0;
        while i < edges.len() {
            let (a, b) = edges[i];
            let first_tags = self.edge_routes.get(&(a.clone(), b.clone())).unwrap_or(&empty);
            let mut shared: BTreeSet<String> = first_tags.clone();

            let mut j = i + 1;
            while j < edges.len() && !shared.is_empty() {
                let (c, d) = edges[j];
                let next_tags = self.edge_routes.get(&(c.clone(), d.clone())).unwrap_or(&empty);
                let narrowed: BTreeSet<String> =
                    shared.intersection(next_tags).cloned().collect();
                if narrowed.is_empty() {
                    break;
                }
                shared = narrowed;
                j += 1;
            }

            let stops: Vec<String> = path[i..=j].to_vec();
            legs.push(RouteLeg {
                route_id: shared.iter().next().cloned(),
                from_stop: stops[0].clone(),
                to_stop: stops[stops.len() - 1].clone(),
                stops,
            });
            i = j;
        }
        legs
    }

    fn finish_plan(
        &self,
        origin: (String, Option<String>),
        dest: (String, Option<String>),
        origin_stop: String,
        dest_stop: String,
        stop_path: Vec<String>,
        legs: Vec<RouteLeg>,
    ) -> RoutePlan {
        let mut used_fact_ids = Vec::new();
        for id in [&origin.1, &dest.1].into_iter().flatten() {
            if !used_fact_ids.contains(id) {
                used_fact_ids.push(id.clone());
            }
        }
        for leg in &legs {
            if let Some(tag) = &leg.route_id {
                if let Some(route) = self.routes.iter().find(|r| &r.tag == tag) {
                    if !used_fact_ids.contains(&route.record_id) {
                        used_fact_ids.push(route.record_id.clone());
                    }
                }
            }
        }
        RoutePlan {
            origin_name: origin.0,
            dest_name: dest.0,
            origin_stop,
            dest_stop,
            stop_path,
            legs,
            used_fact_ids,
        }
    }
}

/// Map a free-text stop label to the closest canonical stop name:
/// exact case-insensitive match first, then fuzzy with a looser cutoff.
fn resolve_stop_label(label: &str, stop_names: &[String]) -> Option<String> {
    let clean = label.trim();
    if clean.is_empty() {
        return None;
    }
    for s in stop_names {
        if s.eq_ignore_ascii_case(clean) {
            return Some(s.clone());
        }
    }
    let key = norm_key(clean);
    let mut best: Option<(f64, &String)> = None;
    for s in stop_names {
        let score = text_similarity(&key, &norm_key(s));
        let better = match best {
            None => true,
            Some((bs, bk)) => score > bs || (score == bs && s < bk),
        };
        if better {
            best = Some((score, s));
        }
    }
    best.filter(|(score, _)| *score >= 0.5).map(|(_, s)| s.clone())
}

/// Word-set Jaccard similarity over normalized tokens.
fn text_similarity(a: &str, b: &str) -> f64 {
    let a_words = tokenize(a);
    let b_words = tokenize(b);
    if a_words.is_empty() || b_words.is_empty() {
        return if a == b && !a.is_empty() { 1.0 } else { 0.0 };
    }
    let intersection = a_words.intersection(&b_words).count() as f64;
    let union = a_words.union(&b_words).count() as f64;
    intersection / union
}

/// Normalized lookup key: lowercase, alphanumeric words joined by single
/// spaces.
fn norm_key(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_space = true;
    for c in text.chars() {
        if c.is_alphanumeric() {
            out.extend(c.to_lowercase());
            last_space = false;
        } else if !last_space {
            out.push(' ');
            last_space = true;
        }
    }
    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::{AttrValue, FactRecord};
    use std::collections::BTreeMap;

    fn route(id: &str, tag: &str, stops: &[&str]) -> FactRecord {
        let mut attributes = BTreeMap::new();
        attributes.insert("route_id".into(), AttrValue::Text(tag.into()));
        attributes.insert(
            "stops".into(),
            AttrValue::List(stops.iter().map(|s| s.to_string()).collect()),
        );
        FactRecord {
            id: id.into(),
            category: Category::BusRoute,
            campus: None,
            attributes,
            time_windows: vec![],
        }
    }

    fn building(id: &str, name: &str, campus: &str, stops: &[&str], aliases: &[&str]) -> FactRecord {
        let mut attributes = BTreeMap::new();
        attributes.insert("name".into(), AttrValue::Text(name.into()));
        attributes.insert(
            "bus_stops".into(),
            AttrValue::List(stops.iter().map(|s| s.to_string()).collect()),
        );
        if !aliases.is_empty() {
            attributes.insert(
                "aliases".into(),
                AttrValue::List(aliases.iter().map(|s| s.to_string()).collect()),
            );
        }
        FactRecord {
            id: id.into(),
            category: Category::Building,
            campus: Some(campus.into()),
            attributes,
            time_windows: vec![],
        }
    }

    fn engine() -> RoutingEngine {
        let store = FactStore::from_records(vec![
            route("route_a", "A", &["Hill Center", "Busch Student Center", "Stadium"]),
            route(
                "route_lx",
                "LX",
                &["College Avenue Student Center", "The Yard", "Stadium", "Livingston Student Center"],
            ),
            building("bldg_hill", "Hill Center", "Busch", &["Hill Center"], &[]),
            building(
                "bldg_lsc",
                "Livingston Student Center",
                "Livingston",
                &["Livingston Student Center"],
                &[],
            ),
            building(
                "bldg_yard",
                "The Yard @ College Avenue",
                "College Avenue",
                &["The Yard"],
                &["the yard", "yard"],
            ),
        ])
        .unwrap();
        RoutingEngine::build(&store)
    }

    #[test]
    fn direct_route_preferred_over_transfers() {
        let e = engine();
        let plan = e.plan("The Yard @ College Avenue", "Livingston Student Center").unwrap();
        assert_eq!(plan.legs.len(), 1, "expected a single direct leg");
        assert_eq!(plan.legs[0].route_id.as_deref(), Some("LX"));
        assert_eq!(plan.origin_stop, "The Yard");
        assert_eq!(plan.dest_stop, "Livingston Student Center");
    }

    #[test]
    fn transfer_path_is_compressed_into_legs() {
        let e = engine();
        // Hill Center (route A only) to The Yard (route LX only); the
        // transfer happens at Stadium.
        let plan = e.plan("Hill Center", "The Yard @ College Avenue").unwrap();
        assert_eq!(plan.legs.len(), 2, "expected two legs: {:?}", plan.legs);
        assert_eq!(plan.legs[0].route_id.as_deref(), Some("A"));
        assert_eq!(plan.legs[1].route_id.as_deref(), Some("LX"));
        assert_eq!(plan.legs[0].to_stop, "Stadium");
        assert_eq!(plan.legs[1].from_stop, "Stadium");
    }

    #[test]
    fn alias_resolves_building() {
        let e = engine();
        let plan = e.plan("yard", "Hill Center").unwrap();
        assert_eq!(plan.origin_name, "The Yard @ College Avenue");
    }

    #[test]
    fn fuzzy_name_resolves_building() {
        let e = engine();
        let plan = e.plan("the hill center", "The Yard @ College Avenue").unwrap();
        assert_eq!(plan.origin_name, "Hill Center");
    }

    #[test]
    fn unknown_building_is_grounded_failure() {
        let e = engine();
        let err = e.plan("Atlantis Dome", "Hill Center").unwrap_err();
        assert!(matches!(err, EngineError::NoGroundedContext(_)), "{err}");
    }

    #[test]
    fn plan_records_grounding_fact_ids() {
        let e = engine();
        let plan = e.plan("The Yard @ College Avenue", "Livingston Student Center").unwrap();
        assert!(plan.used_fact_ids.contains(&"bldg_yard".to_string()));
        assert!(plan.used_fact_ids.contains(&"route_lx".to_string()));
    }

    #[test]
    fn describe_lists_walk_and_legs() {
        let e = engine();
        let plan = e.plan("Hill Center", "The Yard @ College Avenue").unwrap();
        let text = RoutingEngine::describe(&plan);
        assert!(text.contains("Take route A"), "{text}");
        assert!(text.contains("Take route LX"), "{text}");
        assert!(text.contains("walk to The Yard @ College Avenue"), "{text}");
    }
}
