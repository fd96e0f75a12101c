// RU-PATH Engine — grounded campus parking & bus assistant
//
// Module map, roughly in pipeline order:
//   config       — engine configuration (dataset, sessions, embedding, generation)
//   facts        — validated fact store + keyword retrieval
//   embedding    — embedding API client (Ollama / OpenAI-compatible)
//   index        — versioned-snapshot vector index
//   intent       — deterministic intent classification + slot extraction
//   eligibility  — pure eligibility verdicts + conflict resolution
//   routing      — bus stop graph, direct-route preference, BFS + legs
//   sessions     — SQLite session & turn store
//   orchestrator — retrieve → validate → rank into a ContextBundle
//   generation   — chat-completions client for phrasing only
//   composer     — grounded reply wording, clarifications, fallbacks
//   state        — shared engine state + counters
//   chat         — per-turn pipeline
//   server       — HTTP surface

pub mod chat;
pub mod composer;
pub mod config;
pub mod eligibility;
pub mod embedding;
pub mod facts;
pub mod generation;
pub mod index;
pub mod intent;
pub mod orchestrator;
pub mod routing;
pub mod server;
pub mod sessions;
pub mod state;
