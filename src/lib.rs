// RU-PATH — grounded campus parking & bus navigation engine.
//
// Library surface for the server binary and integration tests. The
// interesting entry points are `engine::state::EngineState::bootstrap`
// and `engine::chat::handle_turn`.

pub mod atoms;
pub mod engine;

pub use atoms::error::{EngineError, EngineResult};
pub use atoms::types::{ChatRequest, ChatResponse, Verdict};
pub use engine::config::EngineConfig;
pub use engine::state::EngineState;
