// ── RU-PATH Atoms ──────────────────────────────────────────────────────────
// Foundational types shared by every engine module. No I/O, no async.

pub mod error;
pub mod types;
