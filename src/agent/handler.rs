//! HTTP and WebSocket surface for the agent module (spec §6.1/§6.2).
//!
//! REST endpoints manage session lifecycle (`/sessions/...`); the two
//! WebSocket endpoints (`/ws/agent/:id`, `/ws/browser/:id`) are the NDJSON
//! and whole-JSON wire protocols the bridge routes between.

use crate::agent::adapters::{JsonRpcAdapter, SseAdapter};
use crate::agent::bridge::AgentBridge;
use crate::agent::launcher::AgentLauncher;
use crate::agent::session_store::AgentSessionStore;
use crate::agent::types::{parse_ndjson, AgentFrame, BrowserOutgoingMessage, ProviderTag};
use crate::error::{Error, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Clone)]
pub struct AgentState {
    pub launcher: Arc<AgentLauncher>,
    pub bridge: Arc<AgentBridge>,
    pub store: Arc<AgentSessionStore>,
    pub sse_adapter: Option<Arc<SseAdapter>>,
    pub jsonrpc_adapter: Option<Arc<JsonRpcAdapter>>,
    pub base_cwd: String,
}

/// REST endpoints for session lifecycle, mounted under `/api` by the
/// caller (see `api.rs`).
pub fn agent_router(state: AgentState) -> Router {
    Router::new()
        .route("/sessions/create", post(create_session))
        .route("/sessions", get(list_sessions))
        .route("/sessions/:id", get(get_session).delete(delete_session))
        .route("/sessions/:id/kill", post(kill_session))
        .route("/sessions/:id/resume", post(resume_session))
        .route("/sessions/:id/name", patch(rename_session))
        .with_state(state)
}

/// The two socket endpoints, mounted at the bare paths the spec names
/// (no `/api` prefix, unlike the REST surface).
/// `/ws/agent/:id` needs no auth cookie (spec §6.1: only reachable from the
/// local agent process).
pub fn agent_ws_router(state: AgentState) -> Router {
    Router::new().route("/ws/agent/:id", get(ws_agent_upgrade)).with_state(state)
}

/// `/ws/browser/:id` requires a valid auth cookie (spec §6.1); callers
/// layer the auth middleware on top of this router.
pub fn browser_ws_router(state: AgentState) -> Router {
    Router::new().route("/ws/browser/:id", get(ws_browser_upgrade)).with_state(state)
}

#[derive(Debug, Deserialize)]
struct CreateSessionRequest {
    model: Option<String>,
    permission_mode: Option<String>,
    cwd: Option<String>,
    provider: Option<String>,
    resume_session_id: Option<String>,
    session_name: Option<String>,
}

async fn create_session(
    State(state): State<AgentState>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<impl IntoResponse> {
    if let Some(source_id) = req.resume_session_id {
        let (session_id, _record) = state.launcher.resume(&source_id).await?;
        state.bridge.ensure_session(&session_id).await;
        if let Some(name) = req.session_name {
            state.launcher.set_name(&session_id, name).await;
        }
        return Ok(Json(json!({ "session_id": session_id, "provider": "native" })));
    }

    let session_id = uuid::Uuid::new_v4().to_string();
    let cwd = req.cwd.unwrap_or_else(|| state.base_cwd.clone());
    let provider = req.provider.as_deref().unwrap_or("native");

    state.bridge.ensure_session(&session_id).await;

    let result = match provider {
        "native" => state
            .launcher
            .spawn(&session_id, req.model.clone(), req.permission_mode.clone(), cwd)
            .await
            .map(|_| ()),
        "sse-adapter" => spawn_sse_session(&state, &session_id, req.model.as_deref(), &cwd).await,
        "rpc-adapter" => spawn_rpc_session(&state, &session_id, req.model.as_deref(), &cwd).await,
        other => Err(Error::Validation(format!("unknown provider {other}"))),
    };

    if let Err(e) = result {
        state.bridge.remove_session(&session_id).await;
        return Err(e);
    }

    if let Some(name) = req.session_name {
        state.launcher.set_name(&session_id, name).await;
    }

    Ok(Json(json!({ "session_id": session_id, "provider": provider })))
}

async fn spawn_sse_session(state: &AgentState, session_id: &str, model: Option<&str>, cwd: &str) -> Result<()> {
    let adapter = state.sse_adapter.clone().ok_or_else(|| Error::DependencyMissing("sse-adapter not configured".to_string()))?;
    state.launcher.spawn_adapter(session_id, ProviderTag::SseAdapter, model.map(str::to_string), cwd.to_string()).await;
    adapter.create_session(session_id, model, cwd).await?;
    adapter.attach(session_id.to_string()).await;
    Ok(())
}

async fn spawn_rpc_session(state: &AgentState, session_id: &str, model: Option<&str>, cwd: &str) -> Result<()> {
    let adapter =
        state.jsonrpc_adapter.clone().ok_or_else(|| Error::DependencyMissing("rpc-adapter not configured".to_string()))?;
    state.launcher.spawn_adapter(session_id, ProviderTag::RpcAdapter, model.map(str::to_string), cwd.to_string()).await;
    adapter.create_session(session_id, model, cwd).await?;
    adapter.attach(session_id.to_string()).await;
    Ok(())
}

async fn list_sessions(State(state): State<AgentState>) -> impl IntoResponse {
    Json(state.launcher.all_sessions().await)
}

async fn get_session(State(state): State<AgentState>, Path(id): Path<String>) -> Result<impl IntoResponse> {
    state.launcher.get_session(&id).await.map(Json).ok_or_else(|| Error::NotFound(format!("session {id}")))
}

async fn delete_session(State(state): State<AgentState>, Path(id): Path<String>) -> Result<impl IntoResponse> {
    if state.launcher.get_session(&id).await.is_none() {
        return Err(Error::NotFound(format!("session {id}")));
    }
    let _ = state.launcher.kill(&id).await;
    state.launcher.remove_session(&id).await;
    state.bridge.remove_session(&id).await;
    state.store.remove(&id).await;
    Ok(Json(json!({ "ok": true })))
}

async fn kill_session(State(state): State<AgentState>, Path(id): Path<String>) -> Result<impl IntoResponse> {
    if state.launcher.get_session(&id).await.is_none() {
        return Err(Error::NotFound(format!("session {id}")));
    }
    state.launcher.kill(&id).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn resume_session(State(state): State<AgentState>, Path(id): Path<String>) -> Result<impl IntoResponse> {
    let (session_id, _record) = state.launcher.resume(&id).await?;
    state.bridge.ensure_session(&session_id).await;
    Ok(Json(json!({ "session_id": session_id })))
}

#[derive(Debug, Deserialize, Default)]
struct RenameRequest {
    name: Option<String>,
}

async fn rename_session(
    State(state): State<AgentState>,
    Path(id): Path<String>,
    Json(req): Json<RenameRequest>,
) -> Result<impl IntoResponse> {
    let Some(name) = req.name else {
        return Err(Error::Validation("name is required".to_string()));
    };
    if state.launcher.get_session(&id).await.is_none() {
        return Err(Error::NotFound(format!("session {id}")));
    }
    state.launcher.set_name(&id, name.clone()).await;
    Ok(Json(json!({ "ok": true, "session_name": name })))
}

// =============================================================================
// WebSocket handlers
// =============================================================================

async fn ws_agent_upgrade(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    State(state): State<AgentState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_agent_ws(socket, session_id, state))
}

/// NDJSON protocol: the agent process writes one JSON object per line.
/// Lines can straddle WebSocket text frames, so incoming text is
/// accumulated into a buffer and only complete lines are parsed.
async fn handle_agent_ws(socket: WebSocket, session_id: String, state: AgentState) {
    tracing::info!(session_id = %session_id, "agent socket connected");

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    state.bridge.handle_agent_open(&session_id, tx).await;
    state.launcher.mark_connected(&session_id).await;

    let send_session_id = session_id.clone();
    let send_task = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if ws_sender.send(Message::Text(line)).await.is_err() {
                tracing::debug!(session_id = %send_session_id, "agent socket send failed");
                break;
            }
        }
    });

    let recv_bridge = state.bridge.clone();
    let recv_launcher = state.launcher.clone();
    let recv_session_id = session_id.clone();
    let recv_task = tokio::spawn(async move {
        let mut buffer = String::new();

        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Text(text) => {
                    buffer.push_str(&text);
                    if let Some(last_newline) = buffer.rfind('\n') {
                        let complete = buffer[..last_newline].to_string();
                        buffer = buffer[last_newline + 1..].to_string();
                        for frame in parse_ndjson(&complete) {
                            sync_cli_session_id(&recv_launcher, &recv_session_id, &frame).await;
                            recv_bridge.route_agent_frame(&recv_session_id, frame).await;
                        }
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }

        if !buffer.trim().is_empty() {
            for frame in parse_ndjson(&buffer) {
                sync_cli_session_id(&recv_launcher, &recv_session_id, &frame).await;
                recv_bridge.route_agent_frame(&recv_session_id, frame).await;
            }
        }
    });

    tokio::select! {
        _ = send_task => {}
        _ = recv_task => {}
    }

    // A closed socket is not itself a process exit (the launcher's exit
    // watcher reports that separately and archives via the same call with
    // `true`); this path only clears the live connection.
    state.bridge.handle_agent_close(&session_id, false).await;
    tracing::info!(session_id = %session_id, "agent socket disconnected");
}

/// On `system/init`, sync the upstream CLI's own session id into the
/// launcher record so a future resume can pass `--resume`. The bridge
/// tracks its own copy of this internally; the launcher's copy is separate
/// because it is only needed at spawn time, long after the bridge's.
async fn sync_cli_session_id(launcher: &AgentLauncher, session_id: &str, frame: &AgentFrame) {
    if frame.type_tag() == Some("system") && frame.subtype() == Some("init") {
        if let Some(cli_sid) = frame.value.get("session_id").and_then(|v| v.as_str()) {
            launcher.set_cli_session_id(session_id, cli_sid.to_string()).await;
        }
    }
}

async fn ws_browser_upgrade(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    State(state): State<AgentState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_browser_ws(socket, session_id, state))
}

/// Whole-JSON protocol: one complete JSON value per WebSocket text frame,
/// both directions.
async fn handle_browser_ws(socket: WebSocket, session_id: String, state: AgentState) {
    let browser_id = uuid::Uuid::new_v4().to_string();
    tracing::info!(session_id = %session_id, browser_id = %browser_id, "browser socket connected");

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    // Spec §4.1 Browser attach: a missing session record is created, not
    // rejected, so a browser may be first to connect.
    state.bridge.handle_browser_open(&session_id, &browser_id, tx).await;

    let send_session_id = session_id.clone();
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sender.send(Message::Text(msg)).await.is_err() {
                tracing::debug!(session_id = %send_session_id, "browser socket send failed");
                break;
            }
        }
    });

    let recv_bridge = state.bridge.clone();
    let recv_session_id = session_id.clone();
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<BrowserOutgoingMessage>(&text) {
                    Ok(browser_msg) => recv_bridge.route_browser_message(&recv_session_id, browser_msg).await,
                    Err(e) => {
                        let snippet: String = text.chars().take(200).collect();
                        tracing::warn!(session_id = %recv_session_id, error = %e, raw = %snippet, "invalid browser message");
                    }
                },
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = send_task => {}
        _ = recv_task => {}
    }

    state.bridge.handle_browser_close(&session_id, &browser_id).await;
    tracing::info!(session_id = %session_id, browser_id = %browser_id, "browser socket disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_state() -> (AgentState, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(AgentSessionStore::new(dir.path().to_path_buf()));
        let (exit_tx, _exit_rx) = mpsc::unbounded_channel();
        let config = crate::config::Config::default();
        let launcher = Arc::new(AgentLauncher::new(&config, store.clone(), exit_tx));
        let (first_turn_tx, _first_turn_rx) = mpsc::channel(16);
        let (activity_tx, _activity_rx) = mpsc::unbounded_channel();
        let bridge = Arc::new(AgentBridge::new(store.clone(), first_turn_tx, activity_tx));
        let state = AgentState {
            launcher,
            bridge,
            store,
            sse_adapter: None,
            jsonrpc_adapter: None,
            base_cwd: dir.path().display().to_string(),
        };
        (state, dir)
    }

    #[test]
    fn test_agent_state_is_clone() {
        let (state, _dir) = make_state();
        let _cloned = state.clone();
    }

    #[test]
    fn test_agent_router_builds() {
        let (state, _dir) = make_state();
        let _router = agent_router(state);
    }

    #[test]
    fn test_agent_ws_router_builds() {
        let (state, _dir) = make_state();
        let _router = agent_ws_router(state);
    }

    #[test]
    fn test_browser_ws_router_builds() {
        let (state, _dir) = make_state();
        let _router = browser_ws_router(state);
    }

    #[tokio::test]
    async fn test_get_session_not_found() {
        let (state, _dir) = make_state();
        let err = match get_session(State(state), Path("missing".to_string())).await {
            Err(e) => e,
            Ok(_) => panic!("expected error"),
        };
        assert_eq!(err.status_code(), axum::http::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_delete_session_not_found() {
        let (state, _dir) = make_state();
        let err = match delete_session(State(state), Path("missing".to_string())).await {
            Err(e) => e,
            Ok(_) => panic!("expected error"),
        };
        assert_eq!(err.status_code(), axum::http::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_resume_session_not_found() {
        let (state, _dir) = make_state();
        let err = match resume_session(State(state), Path("missing".to_string())).await {
            Err(e) => e,
            Ok(_) => panic!("expected error"),
        };
        assert_eq!(err.status_code(), axum::http::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_rename_session_missing_name_is_bad_request() {
        let (state, _dir) = make_state();
        let err = match rename_session(State(state), Path("missing".to_string()), Json(RenameRequest { name: None }))
            .await
        {
            Err(e) => e,
            Ok(_) => panic!("expected error"),
        };
        assert_eq!(err.status_code(), axum::http::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_create_session_spawns_with_unknown_binary_fails_cleanly() {
        let (state, _dir) = make_state();
        let req = CreateSessionRequest {
            model: None,
            permission_mode: None,
            cwd: None,
            provider: Some("sse-adapter".to_string()),
            resume_session_id: None,
            session_name: None,
        };
        let err = match create_session(State(state.clone()), Json(req)).await {
            Err(e) => e,
            Ok(_) => panic!("expected error"),
        };
        assert_eq!(err.status_code(), axum::http::StatusCode::NOT_IMPLEMENTED);
        // cleanup on failed creation must not leave an orphaned bridge session
        assert!(!state.bridge.is_agent_connected("anything").await);
    }

    #[test]
    fn test_create_session_request_deserialization() {
        let json = r#"{"model":"sonnet","permission_mode":"default","provider":"native"}"#;
        let req: CreateSessionRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.model.as_deref(), Some("sonnet"));
        assert_eq!(req.provider.as_deref(), Some("native"));
        assert!(req.resume_session_id.is_none());
    }
}
