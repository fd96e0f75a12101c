// ── RU-PATH Atoms: Error Types ─────────────────────────────────────────────
// Single canonical error enum for the engine, built with `thiserror`.
//
// Design rules:
//   • Variants follow the recoverability taxonomy: `DataIntegrity` is fatal
//     at load and blocks startup; everything else is recoverable and is
//     converted into a well-formed chat reply at the turn boundary.
//   • The `#[from]` attribute wires std/external error conversions
//     automatically.
//   • No variant carries secret material (API keys) in its message.

use thiserror::Error;

// ── Primary error enum ─────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum EngineError {
    /// Dataset failed validation at load. Fatal: the server must not start
    /// with a partially-loaded fact store.
    #[error("data integrity error: {0}")]
    DataIntegrity(String),

    /// The embedding capability is unreachable or returned garbage.
    /// Recoverable: retrieval falls back to keyword matching.
    #[error("embedding unavailable: {0}")]
    EmbeddingUnavailable(String),

    /// Zero candidates survived validation for this query.
    /// Recoverable: surfaces as a clarification turn, never a fabricated
    /// answer.
    #[error("no grounded context: {0}")]
    NoGroundedContext(String),

    /// The generation capability timed out or returned a malformed
    /// response. Recoverable: the composer builds a deterministic reply
    /// from the top validated fact instead.
    #[error("generation error: {0}")]
    Generation(String),

    /// The session passed its inactivity timeout. Recoverable: a fresh
    /// session is minted and the reply notes the restart.
    #[error("session expired: {0}")]
    SessionExpired(String),

    /// Filesystem or OS-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization / deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP / network failure (reqwest layer).
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// SQLite / rusqlite failure in the session store.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Engine configuration is invalid or missing.
    #[error("configuration error: {0}")]
    Config(String),
}

impl EngineError {
    /// True for errors the turn pipeline converts into a chat-shaped reply
    /// rather than propagating.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            EngineError::EmbeddingUnavailable(_)
                | EngineError::NoGroundedContext(_)
                | EngineError::Generation(_)
                | EngineError::SessionExpired(_)
        )
    }
}

// ── Convenience alias ──────────────────────────────────────────────────────

/// All engine operations return this type.
pub type EngineResult<T> = Result<T, EngineError>;
