// RU-PATH Engine — Configuration
//
// One plain struct tree with serde + Default. The binary layers CLI/env
// overrides on top; the library never reads the environment itself.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Dataset JSON (`{"records": [...]}`). Loaded once at startup.
    pub dataset_path: PathBuf,
    /// SQLite session store. `None` → in-memory (tests).
    pub session_db_path: Option<PathBuf>,
    /// Inactivity timeout after which a session is expired.
    pub session_timeout_secs: i64,
    pub embedding: EmbeddingConfig,
    pub generation: GenerationConfig,
    pub retrieval: RetrievalConfig,
    pub ranking: RankingPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            dataset_path: PathBuf::from("data/campus.json"),
            session_db_path: None,
            session_timeout_secs: 1800,
            embedding: EmbeddingConfig::default(),
            generation: GenerationConfig::default(),
            retrieval: RetrievalConfig::default(),
            ranking: RankingPolicy::default(),
        }
    }
}

/// Embedding capability endpoint. `base_url: None` disables semantic
/// retrieval entirely — the orchestrator then always uses keyword fallback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub base_url: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        EmbeddingConfig {
            base_url: Some("http://localhost:11434".into()),
            model: "nomic-embed-text".into(),
            timeout_secs: 30,
        }
    }
}

/// Generation capability endpoint (OpenAI-compatible chat completions).
/// No API key → the composer always takes the deterministic path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub max_tokens: u32,
    pub timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        GenerationConfig {
            base_url: "https://api.deepseek.com/v1".into(),
            api_key: None,
            model: "deepseek-chat".into(),
            max_tokens: 400,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Candidates fetched from the index before validation.
    pub top_k: usize,
    /// Hard cap on validated facts per bundle — bounds prompt size.
    pub max_bundle_facts: usize,
    /// Candidates scoring below this are not even considered.
    pub min_similarity: f64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        RetrievalConfig { top_k: 12, max_bundle_facts: 6, min_similarity: 0.15 }
    }
}

/// Ranking order for validated facts. The default is Allowed-first, then
/// similarity, then narrowest time window, then record id — a design
/// choice, kept configurable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankingPolicy {
    pub allowed_first: bool,
    pub narrowest_window_tiebreak: bool,
}

impl Default for RankingPolicy {
    fn default() -> Self {
        RankingPolicy { allowed_first: true, narrowest_window_tiebreak: true }
    }
}
