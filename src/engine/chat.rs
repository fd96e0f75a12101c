// RU-PATH Engine — Chat Turn Pipeline
//
// Drives one user turn end to end: session fetch/mint, intent
// classification, entity merge, the clarification state machine,
// orchestration, composition, and the transactional commit. Never errors
// outward — every failure becomes an honest chat-shaped reply, and a turn
// whose commit fails leaves the stored session as it was before the turn.

use crate::atoms::error::EngineError;
use crate::atoms::types::{ChatRequest, ChatResponse, Intent, Query, Reply, Slot};
use crate::engine::sessions::{Session, SessionState};
use crate::engine::state::EngineState;
use chrono::Utc;
use log::{error, info, warn};
use std::sync::atomic::Ordering;

const EXPIRED_NOTICE: &str =
    "Your previous conversation expired, so I've started a new one.\n\n";
const INTERNAL_ERROR_REPLY: &str = "Something went wrong on my end — please try again.";

/// Handle one chat turn. Always returns a response; the session id in it
/// is the one the caller should use for the next turn.
pub async fn handle_turn(state: &EngineState, request: ChatRequest) -> ChatResponse {
    let message = request.message.trim().to_string();
    let timeout = state.config.session_timeout_secs.max(0) as u64;
    let incoming = request.session_id.as_deref().filter(|s| !s.is_empty()).map(str::to_string);

    // One turn at a time per session; unrelated sessions run in parallel.
    // The lock is taken before the session is read so a concurrent turn's
    // commit is visible here instead of being clobbered by a stale
    // snapshot. A freshly minted id has no concurrent requesters yet.
    let _guard = match &incoming {
        Some(id) => Some(state.turn_lock(id).lock_owned().await),
        None => None,
    };

    // Session: reuse when live, replace when expired, mint when absent.
    let (mut session, notice) = match resolve_session(state, incoming.as_deref(), timeout) {
        Ok(pair) => pair,
        Err(e) => {
            error!("[chat] Session store failure: {e}");
            return ChatResponse {
                response: INTERNAL_ERROR_REPLY.into(),
                session_id: incoming.unwrap_or_default(),
            };
        }
    };

    let reply = process_message(state, &mut session, &message).await;
    state.stats.turns.fetch_add(1, Ordering::Relaxed);

    // All session mutations happened on the working copy; one transaction
    // makes them durable together with both turn rows.
    if let Err(e) = state.sessions.commit_turn(&session, &message, &reply) {
        error!("[chat] Turn commit failed — session left unchanged: {e}");
    }

    ChatResponse { response: format!("{notice}{}", reply.text), session_id: session.id }
}

/// Classify, merge, clarify or resolve, and compose. Works on a mutable
/// working copy of the session; the caller commits it.
async fn process_message(state: &EngineState, session: &mut Session, message: &str) -> Reply {
    session.turn_count += 1;

    if message.is_empty() {
        return state.composer.help();
    }

    let mut intent = state.classifier.classify(message);
    let extracted = state.classifier.extract(message);
    session.entities = session.entities.merge(&extracted);

    // Pending clarification: answered → proceed; topic switch → abandon;
    // first miss → re-ask once; second miss → best-effort answer.
    let mut best_effort = false;
    if let SessionState::AwaitingClarification { slot, reasked } = session.state.clone() {
        if intent == Intent::Help {
            session.state = SessionState::Active;
            return state.composer.help();
        }
        let answered = session.entities.provides(slot)
            || (slot == Slot::Campus && session.entities.lot_id.is_some());
        let switched_topic = intent != slot_family(slot) && intent != Intent::General;
        if answered || switched_topic {
            session.state = SessionState::Active;
            // A bare answer ("Student B") has no intent of its own; the
            // interrupted question resumes.
            if !switched_topic && intent == Intent::General {
                intent = slot_family(slot);
            }
        } else if !reasked {
            session.state = SessionState::AwaitingClarification { slot, reasked: true };
            state.stats.clarifications.fetch_add(1, Ordering::Relaxed);
            return state.composer.reask(slot);
        } else {
            best_effort = true;
            session.state = SessionState::Active;
            if intent == Intent::General {
                intent = slot_family(slot);
            }
        }
    }

    let query = Query {
        raw_text: message.to_string(),
        timestamp: Utc::now(),
        intent,
        entities: session.entities.clone(),
    };

    match state.orchestrator.resolve(&query).await {
        Ok(bundle) => {
            if bundle.degraded_retrieval {
                state.stats.degraded_retrievals.fetch_add(1, Ordering::Relaxed);
            }
            if let Some(&slot) = bundle.missing_slots.first() {
                if best_effort {
                    // The user declined to answer twice; answer from what
                    // is known without claiming a verdict.
                    return state.composer.overview(&bundle);
                }
                session.state = SessionState::AwaitingClarification { slot, reasked: false };
                state.stats.clarifications.fetch_add(1, Ordering::Relaxed);
                return state.composer.clarification(&bundle.missing_slots);
            }
            session.state = SessionState::Active;
            let history = state.sessions.history(&session.id, 6).unwrap_or_default();
            let (reply, fell_back) = state.composer.compose(&query, &bundle, &history).await;
            if fell_back {
                state.stats.generation_fallbacks.fetch_add(1, Ordering::Relaxed);
            }
            reply
        }
        Err(EngineError::NoGroundedContext(detail)) => {
            session.state = SessionState::Active;
            state.composer.no_grounding(&detail)
        }
        Err(e) => {
            if e.is_recoverable() {
                warn!("[chat] Turn degraded: {e}");
            } else {
                error!("[chat] Turn failed: {e}");
            }
            Reply { text: INTERNAL_ERROR_REPLY.into(), used_fact_ids: vec![] }
        }
    }
}

/// Which intent a clarification slot belongs to. A confident question in
/// another family abandons the pending clarification.
fn slot_family(slot: Slot) -> Intent {
    match slot {
        Slot::PermitType | Slot::Campus | Slot::Time => Intent::ParkingEligibility,
        Slot::Origin | Slot::Destination => Intent::BusRoute,
    }
}

fn resolve_session(
    state: &EngineState,
    id: Option<&str>,
    timeout: u64,
) -> Result<(Session, &'static str), EngineError> {
    match id {
        None => Ok((mint(state, timeout)?, "")),
        Some(id) => match state.sessions.fetch_active(id, timeout) {
            Ok(Some(session)) => Ok((session, "")),
            Ok(None) => Ok((mint(state, timeout)?, "")),
            Err(EngineError::SessionExpired(old)) => {
                info!("[chat] Session {old} expired — minting a fresh one");
                state.sessions.delete(&old)?;
                state.forget_turn_lock(&old);
                Ok((mint(state, timeout)?, EXPIRED_NOTICE))
            }
            Err(e) => Err(e),
        },
    }
}

/// Mint a fresh session, sweeping out idle ones on the way so neither the
/// sessions table nor the turn-lock map grows without bound.
fn mint(state: &EngineState, timeout: u64) -> Result<Session, EngineError> {
    state.prune_sessions(timeout);
    state.sessions.create()
}
