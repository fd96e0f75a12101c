// RU-PATH Engine — Shared State
//
// Everything a request handler needs, built once at startup and shared
// behind an Arc. Holds the fact store, retrieval/eligibility machinery,
// the session store, and engine counters.

use crate::atoms::error::EngineResult;
use crate::atoms::types::StatsSnapshot;
use crate::engine::composer::Composer;
use crate::engine::config::EngineConfig;
use crate::engine::embedding::EmbeddingClient;
use crate::engine::facts::FactStore;
use crate::engine::generation::GenerationClient;
use crate::engine::index::EmbeddingIndex;
use crate::engine::intent::IntentClassifier;
use crate::engine::orchestrator::Orchestrator;
use crate::engine::routing::RoutingEngine;
use crate::engine::sessions::SessionStore;
use log::{info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Engine counters. Monotonic, lock-free.
#[derive(Default)]
pub struct Stats {
    pub turns: AtomicU64,
    pub clarifications: AtomicU64,
    pub generation_fallbacks: AtomicU64,
    pub degraded_retrievals: AtomicU64,
}

impl Stats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            turns: self.turns.load(Ordering::Relaxed),
            clarifications: self.clarifications.load(Ordering::Relaxed),
            generation_fallbacks: self.generation_fallbacks.load(Ordering::Relaxed),
            degraded_retrievals: self.degraded_retrievals.load(Ordering::Relaxed),
        }
    }
}

pub struct EngineState {
    pub config: EngineConfig,
    pub store: Arc<FactStore>,
    pub index: Arc<EmbeddingIndex>,
    pub embedder: Option<Arc<EmbeddingClient>>,
    pub routing: Arc<RoutingEngine>,
    pub sessions: SessionStore,
    pub classifier: IntentClassifier,
    pub orchestrator: Orchestrator,
    pub composer: Composer,
    pub stats: Stats,
    /// Per-session turn locks so concurrent requests for one session are
    /// serialized while different sessions proceed in parallel.
    turn_locks: parking_lot::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl EngineState {
    /// Load the dataset and wire up the whole engine. Embedding index
    /// build failures degrade to keyword retrieval instead of failing
    /// startup; dataset and session-store failures are fatal.
    pub async fn bootstrap(config: EngineConfig) -> EngineResult<Arc<Self>> {
        let store = Arc::new(FactStore::load_from_path(&config.dataset_path)?);
        info!("[engine] Loaded {} fact records from {:?}", store.len(), config.dataset_path);

        let routing = Arc::new(RoutingEngine::build(&store));
        let classifier = IntentClassifier::new(&store);
        let sessions = SessionStore::open(config.session_db_path.as_deref())?;

        let embedder = EmbeddingClient::from_config(&config.embedding).map(Arc::new);
        let index = Arc::new(EmbeddingIndex::new());
        match &embedder {
            Some(client) => match index.rebuild(&store, client).await {
                Ok(n) => info!("[engine] Embedding index ready with {n} vectors"),
                Err(e) => {
                    warn!("[engine] Embedding index build failed ({e}) — keyword retrieval only")
                }
            },
            None => info!("[engine] Embeddings disabled — keyword retrieval only"),
        }

        let generation = GenerationClient::from_config(&config.generation).map(Arc::new);
        if generation.is_none() {
            info!("[engine] No generation API key — deterministic replies only");
        }

        let orchestrator = Orchestrator::new(
            store.clone(),
            index.clone(),
            embedder.clone(),
            routing.clone(),
            config.retrieval.clone(),
            config.ranking.clone(),
        );
        let composer = Composer::new(store.clone(), generation);

        Ok(Arc::new(EngineState {
            config,
            store,
            index,
            embedder,
            routing,
            sessions,
            classifier,
            orchestrator,
            composer,
            stats: Stats::default(),
            turn_locks: parking_lot::Mutex::new(HashMap::new()),
        }))
    }

    /// The turn lock for one session. Locks are created on first use and
    /// dropped with the map; contention is per-session only.
    pub fn turn_lock(&self, session_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.turn_locks
            .lock()
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Drop the turn lock entry for a session that no longer exists.
    pub fn forget_turn_lock(&self, session_id: &str) {
        self.turn_locks.lock().remove(session_id);
    }

    /// Sweep idle sessions and their turn-lock entries. Failure here only
    /// delays cleanup, so it is logged rather than propagated.
    pub fn prune_sessions(&self, timeout_secs: u64) {
        match self.sessions.prune_expired(timeout_secs) {
            Ok(pruned) => {
                for id in &pruned {
                    self.forget_turn_lock(id);
                }
            }
            Err(e) => warn!("[engine] Session pruning failed: {e}"),
        }
    }
}
