// RU-PATH Engine — Session Store
//
// Persists dialogue sessions and turn history in SQLite via rusqlite.
// Each session carries the accumulated entity context and the
// clarification state machine. Turn commits are transactional: either the
// session update and both turn rows land, or none do, so a crash mid-turn
// never leaves a half-updated session.

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{Entities, Reply, Slot};
use chrono::Utc;
use log::info;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Clarification state machine for one session.
///
/// Fresh → Active on the first committed turn. A turn that needs a missing
/// slot moves to AwaitingClarification; a second miss on the same slot
/// (`reasked`) makes the next turn proceed best-effort instead of asking
/// again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    Fresh,
    Active,
    AwaitingClarification { slot: Slot, reasked: bool },
}

#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub entities: Entities,
    pub state: SessionState,
    pub turn_count: i64,
    pub updated_at: i64,
}

impl Session {
    fn fresh(id: String) -> Self {
        Session {
            id,
            entities: Entities::default(),
            state: SessionState::Fresh,
            turn_count: 0,
            updated_at: Utc::now().timestamp(),
        }
    }
}

/// Thread-safe database wrapper.
pub struct SessionStore {
    /// The SQLite connection, protected by a Mutex.
    /// `pub` for integration tests that need raw access (e.g. backdating
    /// `updated_at` to exercise expiry).
    pub conn: Mutex<Connection>,
}

impl SessionStore {
    /// Open (or create) the session database and initialize tables.
    /// `None` opens an in-memory database, used by tests and ephemeral
    /// deployments.
    pub fn open(path: Option<&Path>) -> EngineResult<Self> {
        let conn = match path {
            Some(p) => {
                if let Some(dir) = p.parent() {
                    std::fs::create_dir_all(dir)?;
                }
                info!("[sessions] Opening session store at {p:?}");
                let conn = Connection::open(p)?;
                conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
                conn
            }
            None => {
                info!("[sessions] Opening in-memory session store");
                Connection::open_in_memory()?
            }
        };

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                entities_json TEXT NOT NULL DEFAULT '{}',
                state_json TEXT NOT NULL,
                turn_count INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS turns (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL DEFAULT '',
                fact_ids_json TEXT,
                created_at INTEGER NOT NULL,
                FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_turns_session
                ON turns(session_id, id);
            ",
        )?;

        Ok(SessionStore { conn: Mutex::new(conn) })
    }

    /// Mint a fresh session with a random id. Persisted immediately so a
    /// concurrent request with the same id sees it.
    pub fn create(&self) -> EngineResult<Session> {
        let session = Session::fresh(uuid::Uuid::new_v4().to_string());
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sessions (id, entities_json, state_json, turn_count, created_at, updated_at)
             VALUES (?1, ?2, ?3, 0, ?4, ?4)",
            params![
                session.id,
                serde_json::to_string(&session.entities)?,
                serde_json::to_string(&session.state)?,
                session.updated_at,
            ],
        )?;
        Ok(session)
    }

    /// Fetch a live session. `Ok(None)` when the id is unknown;
    /// `SessionExpired` when it exists but idled past the timeout.
    pub fn fetch_active(&self, id: &str, timeout_secs: u64) -> EngineResult<Option<Session>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT entities_json, state_json, turn_count, updated_at
                 FROM sessions WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()?;

        let Some((entities_json, state_json, turn_count, updated_at)) = row else {
            return Ok(None);
        };

        let age = Utc::now().timestamp() - updated_at;
        if age > timeout_secs as i64 {
            return Err(EngineError::SessionExpired(id.to_string()));
        }

        Ok(Some(Session {
            id: id.to_string(),
            entities: serde_json::from_str(&entities_json)?,
            state: serde_json::from_str(&state_json)?,
            turn_count,
            updated_at,
        }))
    }

    /// Commit one completed turn: the updated session plus the user and
    /// assistant turn rows, in a single transaction.
    pub fn commit_turn(
        &self,
        session: &Session,
        user_text: &str,
        reply: &Reply,
    ) -> EngineResult<()> {
        let now = Utc::now().timestamp();
        let entities_json = serde_json::to_string(&session.entities)?;
        let state_json = serde_json::to_string(&session.state)?;
        let fact_ids_json = serde_json::to_string(&reply.used_fact_ids)?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE sessions
             SET entities_json = ?2, state_json = ?3, turn_count = ?4, updated_at = ?5
             WHERE id = ?1",
            params![session.id, entities_json, state_json, session.turn_count, now],
        )?;
        tx.execute(
            "INSERT INTO turns (session_id, role, content, created_at)
             VALUES (?1, 'user', ?2, ?3)",
            params![session.id, user_text, now],
        )?;
        tx.execute(
            "INSERT INTO turns (session_id, role, content, fact_ids_json, created_at)
             VALUES (?1, 'assistant', ?2, ?3, ?4)",
            params![session.id, reply.text, fact_ids_json, now],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Recent turns, oldest first. Used to give the composer short-range
    /// conversational context.
    pub fn history(&self, id: &str, limit: usize) -> EngineResult<Vec<(String, String)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT role, content FROM (
                 SELECT id, role, content FROM turns
                 WHERE session_id = ?1 ORDER BY id DESC LIMIT ?2
             ) ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map(params![id, limit as i64], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Clear a session in place: turn history and entity context gone, the
    /// identifier stays valid. Returns whether the session existed.
    pub fn clear(&self, id: &str) -> EngineResult<bool> {
        let now = Utc::now().timestamp();
        let fresh_state = serde_json::to_string(&SessionState::Fresh)?;
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM turns WHERE session_id = ?1", params![id])?;
        let n = tx.execute(
            "UPDATE sessions
             SET entities_json = '{}', state_json = ?2, turn_count = 0, updated_at = ?3
             WHERE id = ?1",
            params![id, fresh_state, now],
        )?;
        tx.commit()?;
        Ok(n > 0)
    }

    /// Drop a session and its turns entirely. Returns whether anything was
    /// deleted.
    pub fn delete(&self, id: &str) -> EngineResult<bool> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM turns WHERE session_id = ?1", params![id])?;
        let n = conn.execute("DELETE FROM sessions WHERE id = ?1", params![id])?;
        Ok(n > 0)
    }

    /// Delete sessions (and their turns) idle past the timeout. Returns
    /// the pruned ids so the caller can drop any per-session state keyed
    /// on them (turn locks).
    pub fn prune_expired(&self, timeout_secs: u64) -> EngineResult<Vec<String>> {
        let cutoff = Utc::now().timestamp() - timeout_secs as i64;
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT id FROM sessions WHERE updated_at < ?1")?;
        let ids = stmt
            .query_map(params![cutoff], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        if ids.is_empty() {
            return Ok(ids);
        }
        conn.execute(
            "DELETE FROM turns WHERE session_id IN
                 (SELECT id FROM sessions WHERE updated_at < ?1)",
            params![cutoff],
        )?;
        conn.execute("DELETE FROM sessions WHERE updated_at < ?1", params![cutoff])?;
        info!("[sessions] Pruned {} expired sessions", ids.len());
        Ok(ids)
    }

    pub fn session_count(&self) -> EngineResult<u64> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0))?;
        Ok(n as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SessionStore {
        SessionStore::open(None).expect("in-memory store")
    }

    fn reply(text: &str) -> Reply {
        Reply { text: text.into(), used_fact_ids: vec!["lot_51".into()] }
    }

    #[test]
    fn create_then_fetch_round_trips_state() {
        let store = store();
        let mut session = store.create().unwrap();
        session.entities.permit_type = Some("Student B".into());
        session.state = SessionState::AwaitingClarification { slot: Slot::Campus, reasked: false };
        session.turn_count = 1;
        store.commit_turn(&session, "can I park?", &reply("Which campus?")).unwrap();

        let loaded = store.fetch_active(&session.id, 3600).unwrap().expect("session exists");
        assert_eq!(loaded.entities.permit_type.as_deref(), Some("Student B"));
        assert_eq!(
            loaded.state,
            SessionState::AwaitingClarification { slot: Slot::Campus, reasked: false }
        );
        assert_eq!(loaded.turn_count, 1);
    }

    #[test]
    fn unknown_session_is_none() {
        let store = store();
        assert!(store.fetch_active("nope", 3600).unwrap().is_none());
    }

    #[test]
    fn idle_session_expires() {
        let store = store();
        let session = store.create().unwrap();
        // Backdate the session past any timeout.
        store
            .conn
            .lock()
            .execute(
                "UPDATE sessions SET updated_at = updated_at - 10000 WHERE id = ?1",
                params![session.id],
            )
            .unwrap();

        let err = store.fetch_active(&session.id, 1800).unwrap_err();
        assert!(matches!(err, EngineError::SessionExpired(_)), "{err}");
    }

    #[test]
    fn commit_records_both_turn_rows() {
        let store = store();
        let mut session = store.create().unwrap();
        session.turn_count = 1;
        store.commit_turn(&session, "hello", &reply("hi there")).unwrap();

        let history = store.history(&session.id, 10).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0], ("user".to_string(), "hello".to_string()));
        assert_eq!(history[1].0, "assistant");
    }

    #[test]
    fn clear_keeps_the_id_but_drops_context() {
        let store = store();
        let mut session = store.create().unwrap();
        session.entities.permit_type = Some("Student B".into());
        session.turn_count = 1;
        store.commit_turn(&session, "hello", &reply("hi")).unwrap();

        assert!(store.clear(&session.id).unwrap());
        let loaded = store.fetch_active(&session.id, 3600).unwrap().expect("id stays valid");
        assert_eq!(loaded.state, SessionState::Fresh);
        assert!(loaded.entities.permit_type.is_none());
        assert_eq!(loaded.turn_count, 0);
        assert!(store.history(&session.id, 10).unwrap().is_empty());
    }

    #[test]
    fn delete_removes_session_and_turns() {
        let store = store();
        let mut session = store.create().unwrap();
        session.turn_count = 1;
        store.commit_turn(&session, "hello", &reply("hi")).unwrap();

        assert!(store.delete(&session.id).unwrap());
        assert!(store.fetch_active(&session.id, 3600).unwrap().is_none());
        assert!(store.history(&session.id, 10).unwrap().is_empty());
        assert!(!store.delete(&session.id).unwrap(), "second delete finds nothing");
    }

    #[test]
    fn prune_removes_only_idle_sessions() {
        let store = store();
        let old = store.create().unwrap();
        let fresh = store.create().unwrap();
        store
            .conn
            .lock()
            .execute(
                "UPDATE sessions SET updated_at = updated_at - 10000 WHERE id = ?1",
                params![old.id],
            )
            .unwrap();

        assert_eq!(store.prune_expired(1800).unwrap(), vec![old.id.clone()]);
        assert!(store.fetch_active(&fresh.id, 1800).unwrap().is_some());
        assert!(store.fetch_active(&old.id, 1800).unwrap().is_none());
    }

    #[test]
    fn file_backed_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.db");

        let id = {
            let store = SessionStore::open(Some(&path)).unwrap();
            let mut session = store.create().unwrap();
            session.entities.permit_type = Some("Commuter".into());
            session.turn_count = 1;
            store.commit_turn(&session, "can I park in Lot 8?", &reply("Yes")).unwrap();
            session.id
        };

        let store = SessionStore::open(Some(&path)).unwrap();
        let loaded = store.fetch_active(&id, 3600).unwrap().expect("survives reopen");
        assert_eq!(loaded.entities.permit_type.as_deref(), Some("Commuter"));
        assert_eq!(loaded.turn_count, 1);
        assert_eq!(store.history(&id, 10).unwrap().len(), 2);
    }
}
