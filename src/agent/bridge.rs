//! Session bridge: routes messages between an agent socket (NDJSON) and a
//! session's browser sockets (whole-message JSON).
//!
//! Owns per-session state: message history, the pending-message queue, and
//! the permission map. Agent frames are forwarded verbatim whenever they
//! carry no session-state side effect the bridge needs to track; this keeps
//! the bridge protocol-agnostic to new agent frame types (see
//! `agent::types::AgentFrame`).

use crate::agent::session_store::{AgentSessionStore, PersistedSession};
use crate::agent::types::*;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

/// Core message router between an agent and a session's browsers.
pub struct AgentBridge {
    sessions: Arc<RwLock<HashMap<String, BridgeSession>>>,
    store: Arc<AgentSessionStore>,
    /// Sessions that have already triggered (or suppressed) auto-naming.
    auto_naming_attempted: Arc<RwLock<HashSet<String>>>,
    /// Fires once per session on its first user turn: (session_id, content).
    first_turn_tx: mpsc::Sender<(String, String)>,
    /// Fires on any activity-tracked frame: (session_id, last_activity_at).
    activity_tx: mpsc::UnboundedSender<(String, i64)>,
}

/// Internal per-session state held by the bridge.
struct BridgeSession {
    id: String,
    agent_sender: Option<mpsc::UnboundedSender<String>>,
    browser_senders: HashMap<String, mpsc::UnboundedSender<String>>,
    /// Set by an alternate-provider adapter via `register_external_handler`;
    /// when present, browser messages go here instead of the agent socket.
    external_handler: Option<mpsc::UnboundedSender<BrowserOutgoingMessage>>,
    state: SessionState,
    pending_permissions: HashMap<String, serde_json::Value>,
    message_history: Vec<serde_json::Value>,
    pending_messages: Vec<String>,
    cli_session_id: Option<String>,
    archived: bool,
}

impl BridgeSession {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            agent_sender: None,
            browser_senders: HashMap::new(),
            external_handler: None,
            state: SessionState::new(id.to_string()),
            pending_permissions: HashMap::new(),
            message_history: Vec::new(),
            pending_messages: Vec::new(),
            cli_session_id: None,
            archived: false,
        }
    }
}

impl AgentBridge {
    pub fn new(
        store: Arc<AgentSessionStore>,
        first_turn_tx: mpsc::Sender<(String, String)>,
        activity_tx: mpsc::UnboundedSender<(String, i64)>,
    ) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            store,
            auto_naming_attempted: Arc::new(RwLock::new(HashSet::new())),
            first_turn_tx,
            activity_tx,
        }
    }

    // =========================================================================
    // Connection lifecycle
    // =========================================================================

    /// Ensure a bridge session exists, creating an empty one if not.
    pub async fn ensure_session(&self, session_id: &str) {
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(session_id.to_string())
            .or_insert_with(|| BridgeSession::new(session_id));
    }

    /// Handle an agent socket attaching to a session. Replaces any previous
    /// agent socket (invariant: at most one agent attached per session),
    /// drains `pendingMessages` in FIFO order, and notifies browsers.
    pub async fn handle_agent_open(&self, session_id: &str, sender: mpsc::UnboundedSender<String>) {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| BridgeSession::new(session_id));

        session.agent_sender = Some(sender.clone());
        session.archived = false;

        let pending: Vec<String> = session.pending_messages.drain(..).collect();
        for msg in pending {
            if sender.send(msg).is_err() {
                tracing::warn!(session_id, "failed to flush pending message to agent");
                break;
            }
        }

        Self::broadcast_typed(&session.browser_senders, &BrowserIncomingMessage::CliConnected);
        tracing::info!(session_id, "agent attached to bridge");
    }

    /// Handle an agent socket detaching. `process_exited` distinguishes a
    /// transient socket close from the launcher reporting process exit —
    /// only the latter archives the session (spec §4.1 Agent detach, step 3).
    pub async fn handle_agent_close(&self, session_id: &str, process_exited: bool) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(session_id) {
            session.agent_sender = None;

            let cancelled_ids: Vec<String> = session.pending_permissions.keys().cloned().collect();
            session.pending_permissions.clear();
            for request_id in cancelled_ids {
                Self::broadcast_typed(
                    &session.browser_senders,
                    &BrowserIncomingMessage::PermissionCancelled { request_id },
                );
            }

            Self::broadcast_typed(&session.browser_senders, &BrowserIncomingMessage::CliDisconnected);

            if process_exited {
                session.archived = true;
            }

            self.persist_session_inner(session);
        }
        tracing::info!(session_id, process_exited, "agent detached from bridge");
    }

    /// Handle a browser socket attaching. Per spec §4.1 Browser attach, a
    /// missing session record is created (not rejected) so a browser may be
    /// first to connect.
    pub async fn handle_browser_open(
        &self,
        session_id: &str,
        browser_id: &str,
        sender: mpsc::UnboundedSender<String>,
    ) {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| BridgeSession::new(session_id));

        Self::send_typed(&sender, &BrowserIncomingMessage::SessionInit { session: session.state.clone() });

        if session.agent_sender.is_some() {
            Self::send_typed(&sender, &BrowserIncomingMessage::CliConnected);
        } else {
            Self::send_typed(&sender, &BrowserIncomingMessage::CliDisconnected);
        }

        Self::send_typed(
            &sender,
            &BrowserIncomingMessage::MessageHistory { messages: session.message_history.clone() },
        );

        for request in session.pending_permissions.values() {
            Self::send_typed(
                &sender,
                &BrowserIncomingMessage::PermissionRequest { request: request.clone() },
            );
        }

        session.browser_senders.insert(browser_id.to_string(), sender);
        tracing::info!(session_id, browser_id, "browser attached to bridge");
    }

    pub async fn handle_browser_close(&self, session_id: &str, browser_id: &str) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(session_id) {
            session.browser_senders.remove(browser_id);
        }
        tracing::debug!(session_id, browser_id, "browser detached from bridge");
    }

    /// Register an alternate-provider adapter's browser-message handler,
    /// diverting browser traffic for this session away from agent-socket
    /// framing (spec §4.1 External adapters).
    pub async fn register_external_handler(
        &self,
        session_id: &str,
        handler: mpsc::UnboundedSender<BrowserOutgoingMessage>,
    ) {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| BridgeSession::new(session_id));
        session.external_handler = Some(handler);
    }

    /// Suppress auto-naming for a session whose name has been set explicitly
    /// (e.g. via `PATCH /sessions/{id}/name`).
    pub async fn mark_named(&self, session_id: &str) {
        self.auto_naming_attempted.write().await.insert(session_id.to_string());
    }

    // =========================================================================
    // Agent -> browser routing
    // =========================================================================

    /// Route one parsed agent frame, or inject a synthetic one from an
    /// adapter — both paths share this dispatch (spec §4.1 External
    /// adapters: `injectToBrowsers` "the same routing the bridge applies to
    /// real agent frames").
    pub async fn route_agent_frame(&self, session_id: &str, frame: AgentFrame) {
        let mut sessions = self.sessions.write().await;
        let session = match sessions.get_mut(session_id) {
            Some(s) => s,
            None => {
                tracing::warn!(session_id, "agent frame for unknown session");
                return;
            }
        };

        match frame.type_tag() {
            Some("system") => self.handle_system_frame(session, &frame),
            Some("assistant") | Some("user") => {
                session.message_history.push(frame.value.clone());
                self.touch_activity(session);
                Self::broadcast_raw(&session.browser_senders, &frame.raw);
                self.persist_session_inner(session);
            }
            Some("result") => {
                self.handle_result_frame(session, &frame);
            }
            Some("stream_event") | Some("tool_progress") => {
                Self::broadcast_raw(&session.browser_senders, &frame.raw);
            }
            Some("control_request") => {
                if frame.subtype() == Some("can_use_tool") {
                    if let Some(request_id) = frame.request_id() {
                        session
                            .pending_permissions
                            .insert(request_id.to_string(), frame.value.clone());
                        Self::broadcast_typed(
                            &session.browser_senders,
                            &BrowserIncomingMessage::PermissionRequest { request: frame.value.clone() },
                        );
                        self.persist_session_inner(session);
                        return;
                    }
                }
                Self::broadcast_raw(&session.browser_senders, &frame.raw);
            }
            Some("control_cancel") => {
                if let Some(request_id) = frame.request_id() {
                    if session.pending_permissions.remove(request_id).is_some() {
                        Self::broadcast_typed(
                            &session.browser_senders,
                            &BrowserIncomingMessage::PermissionCancelled {
                                request_id: request_id.to_string(),
                            },
                        );
                        self.persist_session_inner(session);
                    }
                }
            }
            _ => {
                // Unrecognized type: forward verbatim (spec §9, "unknown tags
                // are forwarded verbatim on the agent->browser path").
                Self::broadcast_raw(&session.browser_senders, &frame.raw);
            }
        }
    }

    /// Equivalent entry point for adapters (spec's `injectToBrowsers`).
    pub async fn inject_to_browsers(&self, session_id: &str, frame: AgentFrame) {
        self.route_agent_frame(session_id, frame).await;
    }

    fn handle_system_frame(&self, session: &mut BridgeSession, frame: &AgentFrame) {
        match frame.subtype() {
            Some("init") => {
                if let Ok(fields) = serde_json::from_value::<SystemInitFields>(frame.value.clone()) {
                    session.state.merge_system_init(&fields);
                }
                if let Some(sid) = frame.value.get("session_id").and_then(|v| v.as_str()) {
                    session.cli_session_id = Some(sid.to_string());
                }
                Self::broadcast_typed(
                    &session.browser_senders,
                    &BrowserIncomingMessage::SessionInit { session: session.state.clone() },
                );
                self.persist_session_inner(session);
            }
            Some("status") => {
                let status = frame.value.get("status").and_then(|v| v.as_str()).map(String::from);
                session.state.is_compacting = status.as_deref() == Some("compacting");
                session.state.status = status.clone();
                Self::broadcast_typed(
                    &session.browser_senders,
                    &BrowserIncomingMessage::StatusChange { status },
                );
                self.persist_session_inner(session);
            }
            other => {
                tracing::debug!(subtype = ?other, "unrecognized system subtype");
            }
        }
    }

    /// `result` frames merge state and append a terminal history marker.
    /// They do NOT clear `pendingPermissions` — invariant #3 (spec §8) lists
    /// only browser approval, agent-cancel, and agent detach as the ways the
    /// map shrinks; a `result` landing mid-tool-use must not silently drop
    /// an unanswered permission request.
    fn handle_result_frame(&self, session: &mut BridgeSession, frame: &AgentFrame) {
        if let Ok(fields) = serde_json::from_value::<ResultFields>(frame.value.clone()) {
            session.state.merge_result(&fields);
        }
        session.message_history.push(frame.value.clone());
        self.touch_activity(session);
        Self::broadcast_raw(&session.browser_senders, &frame.raw);
        self.persist_session_inner(session);
    }

    fn touch_activity(&self, session: &BridgeSession) {
        let now = now_millis();
        let _ = self.activity_tx.send((session.id.clone(), now));
    }

    // =========================================================================
    // Browser -> agent routing
    // =========================================================================

    pub async fn route_browser_message(&self, session_id: &str, msg: BrowserOutgoingMessage) {
        let mut sessions = self.sessions.write().await;
        let session = match sessions.get_mut(session_id) {
            Some(s) => s,
            None => {
                tracing::warn!(session_id, "browser message for unknown session");
                return;
            }
        };

        if let Some(handler) = &session.external_handler {
            let _ = handler.send(msg);
            return;
        }

        match msg {
            BrowserOutgoingMessage::UserMessage { content, images } => {
                if session.archived {
                    Self::send_typed_to(
                        &session.browser_senders,
                        &BrowserIncomingMessage::StatusChange {
                            status: Some("error: session archived".to_string()),
                        },
                    );
                    return;
                }

                let is_first_turn = !session
                    .message_history
                    .iter()
                    .any(|m| m.get("type").and_then(|t| t.as_str()) == Some("user_message"));

                let echo = serde_json::json!({
                    "type": "user_message",
                    "content": user_message_content_value(&content, &images),
                    "timestamp": now_millis(),
                });
                session.message_history.push(echo);
                self.touch_activity(session);

                let ndjson = user_message_to_cli_ndjson(&content, &images);
                self.send_to_agent_inner(session, ndjson);
                self.persist_session_inner(session);

                if is_first_turn {
                    let session_id = session.id.clone();
                    let already = {
                        let attempted = self.auto_naming_attempted.read().await;
                        attempted.contains(&session_id)
                    };
                    if !already {
                        self.auto_naming_attempted.write().await.insert(session_id.clone());
                        let _ = self.first_turn_tx.send((session_id, content)).await;
                    }
                }
            }
            BrowserOutgoingMessage::PermissionResponse { request_id, behavior, updated_input, message } => {
                session.pending_permissions.remove(&request_id);
                let ndjson = permission_response_to_cli_ndjson(
                    &request_id,
                    &behavior,
                    updated_input.as_ref(),
                    message.as_deref(),
                );
                self.send_to_agent_inner(session, ndjson);
                self.persist_session_inner(session);
            }
            BrowserOutgoingMessage::Interrupt => {
                self.send_to_agent_inner(session, interrupt_to_cli_ndjson());
            }
            BrowserOutgoingMessage::SetModel { model } => {
                self.send_to_agent_inner(session, set_model_to_cli_ndjson(&model));
            }
        }
    }

    // =========================================================================
    // Session management
    // =========================================================================

    pub async fn remove_session(&self, session_id: &str) {
        self.sessions.write().await.remove(session_id);
    }

    pub async fn is_agent_connected(&self, session_id: &str) -> bool {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|s| s.agent_sender.is_some())
            .unwrap_or(false)
    }

    pub async fn get_cli_session_id(&self, session_id: &str) -> Option<String> {
        self.sessions.read().await.get(session_id).and_then(|s| s.cli_session_id.clone())
    }

    pub async fn is_archived(&self, session_id: &str) -> bool {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|s| s.archived)
            .unwrap_or(false)
    }

    /// Restore sessions from disk at startup (spec §4.4, `restoreSession(...,
    /// archived=true)`). Agents are not auto-respawned.
    pub async fn restore_from_disk(&self) {
        let persisted = self.store.load_all().await;
        let mut sessions = self.sessions.write().await;
        let mut auto_named = self.auto_naming_attempted.write().await;

        for p in persisted {
            if p.state.num_turns > 0 {
                auto_named.insert(p.id.clone());
            }
            sessions.insert(
                p.id.clone(),
                BridgeSession {
                    id: p.id,
                    agent_sender: None,
                    browser_senders: HashMap::new(),
                    external_handler: None,
                    state: p.state,
                    pending_permissions: p.pending_permissions,
                    message_history: p.message_history,
                    pending_messages: p.pending_messages,
                    cli_session_id: None,
                    archived: true,
                },
            );
        }

        tracing::info!(count = sessions.len(), "restored bridge sessions from disk");
    }

    // =========================================================================
    // Internal helpers
    // =========================================================================

    fn send_to_agent_inner(&self, session: &mut BridgeSession, ndjson: String) {
        let line = format!("{ndjson}\n");
        if let Some(sender) = &session.agent_sender {
            if sender.send(line).is_err() {
                tracing::warn!(session_id = %session.id, "agent sender closed");
                session.agent_sender = None;
                session.pending_messages.push(format!("{ndjson}\n"));
            }
        } else if !session.archived {
            session.pending_messages.push(line);
        } else {
            tracing::warn!(session_id = %session.id, "dropping message to archived session");
        }
    }

    fn broadcast_typed(
        senders: &HashMap<String, mpsc::UnboundedSender<String>>,
        msg: &BrowserIncomingMessage,
    ) {
        let json = match serde_json::to_string(msg) {
            Ok(j) => j,
            Err(e) => {
                tracing::warn!("failed to serialize browser message: {e}");
                return;
            }
        };
        for sender in senders.values() {
            let _ = sender.send(json.clone());
        }
    }

    fn broadcast_raw(senders: &HashMap<String, mpsc::UnboundedSender<String>>, raw: &str) {
        for sender in senders.values() {
            let _ = sender.send(raw.to_string());
        }
    }

    fn send_typed(sender: &mpsc::UnboundedSender<String>, msg: &BrowserIncomingMessage) {
        if let Ok(json) = serde_json::to_string(msg) {
            let _ = sender.send(json);
        }
    }

    fn send_typed_to(senders: &HashMap<String, mpsc::UnboundedSender<String>>, msg: &BrowserIncomingMessage) {
        Self::broadcast_typed(senders, msg);
    }

    fn persist_session_inner(&self, session: &BridgeSession) {
        let persisted = PersistedSession {
            id: session.id.clone(),
            state: session.state.clone(),
            message_history: session.message_history.clone(),
            pending_messages: session.pending_messages.clone(),
            pending_permissions: session.pending_permissions.clone(),
            cli_session_id: session.cli_session_id.clone(),
            archived: session.archived,
        };
        self.store.save(persisted);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_bridge() -> (AgentBridge, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(AgentSessionStore::new(dir.path().to_path_buf()));
        let (first_turn_tx, _rx) = mpsc::channel(10);
        let (activity_tx, _rx2) = mpsc::unbounded_channel();
        let bridge = AgentBridge::new(store, first_turn_tx, activity_tx);
        (bridge, dir)
    }

    #[tokio::test]
    async fn test_ensure_session() {
        let (bridge, _dir) = make_bridge();
        bridge.ensure_session("s1").await;
        assert!(bridge.sessions.read().await.contains_key("s1"));
    }

    #[tokio::test]
    async fn test_agent_open_and_close() {
        let (bridge, _dir) = make_bridge();
        bridge.ensure_session("s1").await;
        let (tx, _rx) = mpsc::unbounded_channel();
        bridge.handle_agent_open("s1", tx).await;
        assert!(bridge.is_agent_connected("s1").await);
        bridge.handle_agent_close("s1", false).await;
        assert!(!bridge.is_agent_connected("s1").await);
        assert!(!bridge.is_archived("s1").await);
    }

    #[tokio::test]
    async fn test_agent_close_with_process_exit_archives() {
        let (bridge, _dir) = make_bridge();
        bridge.ensure_session("s1").await;
        let (tx, _rx) = mpsc::unbounded_channel();
        bridge.handle_agent_open("s1", tx).await;
        bridge.handle_agent_close("s1", true).await;
        assert!(bridge.is_archived("s1").await);
    }

    // S1 — new session, first message: browser-attach ordering, then
    // user_message -> NDJSON with type:"user"/message.content:"hi", then
    // assistant frame forwarded verbatim.
    #[tokio::test]
    async fn test_s1_new_session_first_message() {
        let (bridge, _dir) = make_bridge();
        bridge.ensure_session("s1").await;

        let (browser_tx, mut browser_rx) = mpsc::unbounded_channel();
        bridge.handle_browser_open("s1", "b1", browser_tx).await;

        let init = browser_rx.recv().await.unwrap();
        assert!(init.contains("session_init"));
        let disconnected = browser_rx.recv().await.unwrap();
        assert!(disconnected.contains("cli_disconnected"));
        let history = browser_rx.recv().await.unwrap();
        assert!(history.contains("message_history"));
        assert!(history.contains("\"messages\":[]"));

        let (agent_tx, mut agent_rx) = mpsc::unbounded_channel();
        bridge.handle_agent_open("s1", agent_tx).await;
        let connected = browser_rx.recv().await.unwrap();
        assert!(connected.contains("cli_connected"));

        bridge
            .route_browser_message("s1", BrowserOutgoingMessage::UserMessage { content: "hi".to_string(), images: vec![] })
            .await;
        let agent_line = agent_rx.recv().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(agent_line.trim_end()).unwrap();
        assert_eq!(value["type"], "user");
        assert_eq!(value["message"]["content"], "hi");

        let assistant_frame = AgentFrame {
            raw: serde_json::json!({
                "type": "assistant",
                "message": {"content": [{"type": "text", "text": "hello"}]},
            })
            .to_string(),
            value: serde_json::json!({
                "type": "assistant",
                "message": {"content": [{"type": "text", "text": "hello"}]},
            }),
        };
        bridge.route_agent_frame("s1", assistant_frame).await;
        let forwarded = browser_rx.recv().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&forwarded).unwrap();
        assert_eq!(value["type"], "assistant");
        assert_eq!(value["message"]["content"][0]["type"], "text");
        assert_eq!(value["message"]["content"][0]["text"], "hello");
    }

    // S2 — queueing before agent attach: messages sent with no agent attached
    // are queued and delivered in FIFO order on attach.
    #[tokio::test]
    async fn test_s2_pending_fifo_on_agent_attach() {
        let (bridge, _dir) = make_bridge();
        bridge.ensure_session("s1").await;

        for content in ["a", "b", "c"] {
            bridge
                .route_browser_message(
                    "s1",
                    BrowserOutgoingMessage::UserMessage { content: content.to_string(), images: vec![] },
                )
                .await;
        }

        {
            let sessions = bridge.sessions.read().await;
            assert_eq!(sessions.get("s1").unwrap().pending_messages.len(), 3);
        }

        let (agent_tx, mut agent_rx) = mpsc::unbounded_channel();
        bridge.handle_agent_open("s1", agent_tx).await;

        for expected in ["a", "b", "c"] {
            let line = agent_rx.recv().await.unwrap();
            let value: serde_json::Value = serde_json::from_str(line.trim_end()).unwrap();
            assert_eq!(value["message"]["content"], expected);
        }
    }

    #[tokio::test]
    async fn test_user_message_history_echo_preserves_images() {
        let (bridge, _dir) = make_bridge();
        bridge.ensure_session("s1").await;

        let images = vec![ImageAttachment { media_type: "image/png".to_string(), data: "abc123".to_string() }];
        bridge
            .route_browser_message(
                "s1",
                BrowserOutgoingMessage::UserMessage { content: "caption".to_string(), images },
            )
            .await;

        let sessions = bridge.sessions.read().await;
        let echo = sessions.get("s1").unwrap().message_history.last().unwrap();
        assert_eq!(echo["type"], "user_message");
        assert_eq!(echo["content"][0]["type"], "image");
        assert_eq!(echo["content"][0]["source"]["data"], "abc123");
        assert_eq!(echo["content"][1]["type"], "text");
        assert_eq!(echo["content"][1]["text"], "caption");
    }

    // S3 — permission replay on browser reconnect.
    #[tokio::test]
    async fn test_s3_permission_replay_on_reconnect() {
        let (bridge, _dir) = make_bridge();
        bridge.ensure_session("s1").await;
        let (agent_tx, _agent_rx) = mpsc::unbounded_channel();
        bridge.handle_agent_open("s1", agent_tx).await;

        let (browser_a_tx, mut browser_a_rx) = mpsc::unbounded_channel();
        bridge.handle_browser_open("s1", "a", browser_a_tx).await;
        while let Ok(_) = browser_a_rx.try_recv() {}

        let cr = AgentFrame {
            raw: serde_json::json!({
                "type": "control_request",
                "subtype": "can_use_tool",
                "request_id": "req-1",
                "tool_name": "Bash",
                "input": {"command": "ls"},
            })
            .to_string(),
            value: serde_json::json!({
                "type": "control_request",
                "subtype": "can_use_tool",
                "request_id": "req-1",
                "tool_name": "Bash",
                "input": {"command": "ls"},
            }),
        };
        bridge.route_agent_frame("s1", cr).await;

        let perm = browser_a_rx.recv().await.unwrap();
        assert!(perm.contains("permission_request"));

        bridge.handle_browser_close("s1", "a").await;

        let (browser_b_tx, mut browser_b_rx) = mpsc::unbounded_channel();
        bridge.handle_browser_open("s1", "b", browser_b_tx).await;

        let _init = browser_b_rx.recv().await.unwrap();
        let _connected = browser_b_rx.recv().await.unwrap();
        let _history = browser_b_rx.recv().await.unwrap();
        let perm_replay = browser_b_rx.recv().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&perm_replay).unwrap();
        assert_eq!(value["type"], "permission_request");
        assert_eq!(value["request"]["request_id"], "req-1");
        assert_eq!(value["request"]["input"]["command"], "ls");
    }

    #[tokio::test]
    async fn test_agent_close_cancels_pending_permissions() {
        let (bridge, _dir) = make_bridge();
        bridge.ensure_session("s1").await;
        let (agent_tx, _agent_rx) = mpsc::unbounded_channel();
        bridge.handle_agent_open("s1", agent_tx).await;

        let cr = AgentFrame {
            raw: serde_json::json!({
                "type": "control_request", "subtype": "can_use_tool",
                "request_id": "req-1", "tool_name": "Bash", "input": {},
            })
            .to_string(),
            value: serde_json::json!({
                "type": "control_request", "subtype": "can_use_tool",
                "request_id": "req-1", "tool_name": "Bash", "input": {},
            }),
        };
        bridge.route_agent_frame("s1", cr).await;

        let (browser_tx, mut browser_rx) = mpsc::unbounded_channel();
        bridge.handle_browser_open("s1", "b1", browser_tx).await;
        while let Ok(_) = browser_rx.try_recv() {}

        bridge.handle_agent_close("s1", false).await;

        let mut got_cancelled = false;
        let mut got_disconnected = false;
        while let Ok(msg) = browser_rx.try_recv() {
            if msg.contains("permission_cancelled") {
                got_cancelled = true;
            }
            if msg.contains("cli_disconnected") {
                got_disconnected = true;
            }
        }
        assert!(got_cancelled);
        assert!(got_disconnected);

        let sessions = bridge.sessions.read().await;
        assert!(sessions.get("s1").unwrap().pending_permissions.is_empty());
    }

    #[tokio::test]
    async fn test_result_frame_does_not_clear_pending_permissions() {
        let (bridge, _dir) = make_bridge();
        bridge.ensure_session("s1").await;
        let (agent_tx, _agent_rx) = mpsc::unbounded_channel();
        bridge.handle_agent_open("s1", agent_tx).await;

        let cr = AgentFrame {
            raw: serde_json::json!({
                "type": "control_request", "subtype": "can_use_tool",
                "request_id": "req-1", "tool_name": "Bash", "input": {},
            })
            .to_string(),
            value: serde_json::json!({
                "type": "control_request", "subtype": "can_use_tool",
                "request_id": "req-1", "tool_name": "Bash", "input": {},
            }),
        };
        bridge.route_agent_frame("s1", cr).await;

        let result = AgentFrame {
            raw: serde_json::json!({"type": "result", "totalCostUsd": 0.1}).to_string(),
            value: serde_json::json!({"type": "result", "totalCostUsd": 0.1}),
        };
        bridge.route_agent_frame("s1", result).await;

        let sessions = bridge.sessions.read().await;
        assert_eq!(sessions.get("s1").unwrap().pending_permissions.len(), 1);
    }

    #[tokio::test]
    async fn test_control_cancel_removes_pending_permission() {
        let (bridge, _dir) = make_bridge();
        bridge.ensure_session("s1").await;
        let (agent_tx, _agent_rx) = mpsc::unbounded_channel();
        bridge.handle_agent_open("s1", agent_tx).await;

        let cr = AgentFrame {
            raw: serde_json::json!({
                "type": "control_request", "subtype": "can_use_tool",
                "request_id": "req-1", "tool_name": "Bash", "input": {},
            })
            .to_string(),
            value: serde_json::json!({
                "type": "control_request", "subtype": "can_use_tool",
                "request_id": "req-1", "tool_name": "Bash", "input": {},
            }),
        };
        bridge.route_agent_frame("s1", cr).await;

        let cancel = AgentFrame {
            raw: serde_json::json!({"type": "control_cancel", "request_id": "req-1"}).to_string(),
            value: serde_json::json!({"type": "control_cancel", "request_id": "req-1"}),
        };
        bridge.route_agent_frame("s1", cancel).await;

        let sessions = bridge.sessions.read().await;
        assert!(sessions.get("s1").unwrap().pending_permissions.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_agent_frame_forwarded_verbatim() {
        let (bridge, _dir) = make_bridge();
        bridge.ensure_session("s1").await;
        let (browser_tx, mut browser_rx) = mpsc::unbounded_channel();
        bridge.handle_browser_open("s1", "b1", browser_tx).await;
        while let Ok(_) = browser_rx.try_recv() {}

        let weird = AgentFrame {
            raw: r#"{"type":"from_the_future","payload":42}"#.to_string(),
            value: serde_json::json!({"type": "from_the_future", "payload": 42}),
        };
        bridge.route_agent_frame("s1", weird.clone()).await;

        let forwarded = browser_rx.recv().await.unwrap();
        assert_eq!(forwarded, weird.raw);
    }

    #[tokio::test]
    async fn test_browser_message_to_archived_session_is_dropped() {
        let (bridge, _dir) = make_bridge();
        bridge.ensure_session("s1").await;
        let (agent_tx, _agent_rx) = mpsc::unbounded_channel();
        bridge.handle_agent_open("s1", agent_tx).await;
        bridge.handle_agent_close("s1", true).await;
        assert!(bridge.is_archived("s1").await);

        bridge
            .route_browser_message("s1", BrowserOutgoingMessage::UserMessage { content: "hi".to_string(), images: vec![] })
            .await;

        let sessions = bridge.sessions.read().await;
        assert!(sessions.get("s1").unwrap().pending_messages.is_empty());
    }

    #[tokio::test]
    async fn test_remove_session() {
        let (bridge, _dir) = make_bridge();
        bridge.ensure_session("s1").await;
        bridge.remove_session("s1").await;
        assert!(!bridge.sessions.read().await.contains_key("s1"));
    }
}
