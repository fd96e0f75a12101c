// RU-PATH Engine — HTTP Surface
//
// A lightweight HTTP server over a plain TCP listener. JSON in, JSON out,
// permissive CORS so a campus web page can call it directly.
//
// Endpoints:
//   POST /api/chat   { message, session_id? } → { response, session_id }
//   POST /api/reset  { session_id }           → { cleared }
//   GET  /api/lots   → lot summaries from the fact store
//   GET  /api/stats  → engine counters + session/index state
//   GET  /api/test   → runs the built-in smoke questions through the engine
//   GET  /api/health → liveness probe

use crate::atoms::error::EngineResult;
use crate::atoms::types::{Category, ChatRequest};
use crate::engine::chat;
use crate::engine::state::EngineState;
use log::{debug, error, info, warn};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const MAX_REQUEST_BYTES: usize = 64 * 1024;

const SMOKE_QUESTIONS: &[&str] = &[
    "Can I park in Lot 51 with a Student B permit?",
    "Where can I park on Busch with a Commuter permit?",
    "How do I get from Hill Center to the Livingston Student Center?",
    "help",
];

/// Accept loop. Runs until the process exits.
pub async fn run(state: Arc<EngineState>, bind_address: &str, port: u16) -> EngineResult<()> {
    let listener = TcpListener::bind((bind_address, port)).await?;
    info!("[server] Listening on {bind_address}:{port}");

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!("[server] Accept failed: {e}");
                continue;
            }
        };
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, state).await {
                debug!("[server] Connection from {peer} failed: {e}");
            }
        });
    }
}

async fn handle_connection(mut stream: TcpStream, state: Arc<EngineState>) -> std::io::Result<()> {
    let request = match read_request(&mut stream).await? {
        Some(request) => request,
        None => return Ok(()),
    };

    let first_line = request.lines().next().unwrap_or("");
    let mut parts = first_line.split_whitespace();
    let method = parts.next().unwrap_or("");
    let path = parts.next().unwrap_or("").split('?').next().unwrap_or("");
    let body = request.split("\r\n\r\n").nth(1).unwrap_or("");

    let (status, payload) = match (method, path) {
        ("OPTIONS", _) => {
            return write_response(&mut stream, "204 No Content", None).await;
        }
        ("POST", "/api/chat") => handle_chat(&state, body).await,
        ("POST", "/api/reset") => handle_reset(&state, body),
        ("GET", "/api/lots") => ("200 OK", lots_payload(&state)),
        ("GET", "/api/stats") => ("200 OK", stats_payload(&state)),
        ("GET", "/api/test") => ("200 OK", smoke_payload(&state).await),
        ("GET", "/api/health") => ("200 OK", json!({ "status": "ok" })),
        _ => ("404 Not Found", json!({ "error": "not found" })),
    };

    write_response(&mut stream, status, Some(&payload)).await
}

/// Read the request head and, using Content-Length, the full body.
async fn read_request(stream: &mut TcpStream) -> std::io::Result<Option<String>> {
    let mut buf = Vec::with_capacity(8192);
    let mut chunk = [0u8; 8192];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.len() > MAX_REQUEST_BYTES {
            return Ok(None);
        }
        if let Some(head_end) = find_header_end(&buf) {
            let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
            let content_length = head
                .lines()
                .find(|l| l.to_ascii_lowercase().starts_with("content-length:"))
                .and_then(|l| l.split(':').nth(1))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if content_length > MAX_REQUEST_BYTES {
                return Ok(None);
            }
            if buf.len() >= head_end + 4 + content_length {
                return Ok(Some(String::from_utf8_lossy(&buf).to_string()));
            }
        }
    }
    if buf.is_empty() {
        Ok(None)
    } else {
        Ok(Some(String::from_utf8_lossy(&buf).to_string()))
    }
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

async fn write_response(
    stream: &mut TcpStream,
    status: &str,
    payload: Option<&Value>,
) -> std::io::Result<()> {
    let body = payload.map(|p| p.to_string()).unwrap_or_default();
    let response = format!(
        "HTTP/1.1 {status}\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         Access-Control-Allow-Origin: *\r\n\
         Access-Control-Allow-Methods: GET, POST, OPTIONS\r\n\
         Access-Control-Allow-Headers: Content-Type\r\n\
         Connection: close\r\n\r\n{body}",
        body.len(),
    );
    stream.write_all(response.as_bytes()).await
}

// ── Endpoint handlers ──────────────────────────────────────────────────

async fn handle_chat(state: &EngineState, body: &str) -> (&'static str, Value) {
    let request: ChatRequest = match serde_json::from_str(body) {
        Ok(request) => request,
        Err(e) => {
            return ("400 Bad Request", json!({ "error": format!("invalid request body: {e}") }))
        }
    };
    let response = chat::handle_turn(state, request).await;
    match serde_json::to_value(&response) {
        Ok(v) => ("200 OK", v),
        Err(e) => {
            error!("[server] Response serialization failed: {e}");
            ("500 Internal Server Error", json!({ "error": "internal error" }))
        }
    }
}

fn handle_reset(state: &EngineState, body: &str) -> (&'static str, Value) {
    let parsed: Value = serde_json::from_str(body).unwrap_or(json!({}));
    let session_id = parsed["session_id"].as_str().unwrap_or("");
    if session_id.is_empty() {
        return ("400 Bad Request", json!({ "error": "session_id required" }));
    }
    match state.sessions.clear(session_id) {
        Ok(cleared) => ("200 OK", json!({ "cleared": cleared })),
        Err(e) => {
            error!("[server] Reset failed: {e}");
            ("500 Internal Server Error", json!({ "error": "internal error" }))
        }
    }
}

fn lots_payload(state: &EngineState) -> Value {
    let lots: Vec<Value> = state
        .store
        .by_category(Category::Lot)
        .iter()
        .map(|lot| {
            json!({
                "id": lot.id,
                "name": lot.name(),
                "campus": lot.campus,
                "allowed_permits": lot.allowed_permits(),
            })
        })
        .collect();
    json!({ "lots": lots })
}

fn stats_payload(state: &EngineState) -> Value {
    let snapshot = state.stats.snapshot();
    json!({
        "stats": snapshot,
        "sessions": state.sessions.session_count().unwrap_or(0),
        "facts": state.store.len(),
        "index_version": state.index.version(),
        "embedding_index_ready": state.index.is_ready(),
        "generation_enabled": state.composer.has_generation(),
    })
}

/// Runs the built-in smoke questions through the full pipeline, each in
/// its own fresh session. Cheap end-to-end health signal.
async fn smoke_payload(state: &EngineState) -> Value {
    let mut results = Vec::new();
    for question in SMOKE_QUESTIONS {
        let request = ChatRequest { message: question.to_string(), session_id: None };
        let response = chat::handle_turn(state, request).await;
        let _ = state.sessions.delete(&response.session_id);
        state.forget_turn_lock(&response.session_id);
        results.push(json!({ "question": question, "response": response.response }));
    }
    json!({ "status": "ok", "results": results })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::config::EngineConfig;

    #[tokio::test]
    async fn stats_payload_reports_engine_state() {
        let state = EngineState::bootstrap(EngineConfig::default()).await.unwrap();
        let v = stats_payload(&state);
        assert_eq!(v["facts"].as_u64().unwrap() as usize, state.store.len());
        assert_eq!(v["generation_enabled"], json!(false));
        assert_eq!(v["embedding_index_ready"], json!(false));
    }

    #[tokio::test]
    async fn lots_payload_lists_every_lot() {
        let state = EngineState::bootstrap(EngineConfig::default()).await.unwrap();
        let v = lots_payload(&state);
        let lots = v["lots"].as_array().unwrap();
        assert_eq!(lots.len(), state.store.by_category(Category::Lot).len());
        assert!(lots.iter().any(|l| l["name"] == json!("Lot 51")));
    }
}
