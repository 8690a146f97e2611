//! Request/response + server-sent-events adapter (spec §4.3.1).
//!
//! Talks to an external HTTP service that exposes `POST /sessions`,
//! `POST /sessions/{id}/messages`, `POST /sessions/{id}/interrupt`, and a
//! single `GET /events` SSE stream shared across every upstream session.
//! Each SSE payload is a JSON object carrying an upstream session id and an
//! event-type tag; the adapter maps each one to the same agent-frame
//! vocabulary a native process would emit, and feeds it through
//! `AgentBridge::inject_to_browsers`.

use crate::agent::bridge::AgentBridge;
use crate::agent::types::{AgentFrame, BrowserOutgoingMessage, ImageAttachment};
use crate::error::{Error, Result};
use futures::StreamExt;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};

const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(30);
const RECONNECT_MIN: Duration = Duration::from_secs(2);
const RECONNECT_MAX: Duration = Duration::from_secs(5);

pub struct SseAdapter {
    client: reqwest::Client,
    base_url: String,
    bridge: Arc<AgentBridge>,
    truncate_bytes: usize,
    /// fossclaw session id -> upstream session id.
    upstream_ids: Arc<RwLock<HashMap<String, String>>>,
}

impl SseAdapter {
    pub fn new(base_url: String, truncate_bytes: usize, bridge: Arc<AgentBridge>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            bridge,
            truncate_bytes,
            upstream_ids: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Poll `GET /health` until it succeeds or 30 seconds elapse.
    pub async fn wait_healthy(&self) -> Result<()> {
        let deadline = tokio::time::Instant::now() + HEALTH_CHECK_TIMEOUT;
        loop {
            if let Ok(resp) = self.client.get(format!("{}/health", self.base_url)).send().await {
                if resp.status().is_success() {
                    return Ok(());
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Upstream("SSE adapter upstream failed health check".to_string()));
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    /// Create an upstream session, record the mapping, and inject a
    /// synthetic `session_init` frame so the browser sees a connected
    /// session immediately.
    pub async fn create_session(
        &self,
        session_id: &str,
        model: Option<&str>,
        cwd: &str,
    ) -> Result<()> {
        let resp = self
            .client
            .post(format!("{}/sessions", self.base_url))
            .json(&json!({ "model": model, "cwd": cwd }))
            .send()
            .await?;
        let body: Value = resp.json().await?;
        let upstream_id = body
            .get("sessionId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::Upstream("upstream create-session response missing sessionId".to_string()))?
            .to_string();

        self.upstream_ids.write().await.insert(session_id.to_string(), upstream_id);

        let init = json!({
            "type": "system",
            "subtype": "init",
            "model": model,
            "cwd": cwd,
        });
        self.bridge
            .inject_to_browsers(session_id, AgentFrame { raw: init.to_string(), value: init })
            .await;

        Ok(())
    }

    /// Register this adapter as the browser-message handler for a session
    /// and return the join handle of the task that forwards browser
    /// messages to the upstream HTTP API.
    pub async fn attach(self: &Arc<Self>, session_id: String) -> tokio::task::JoinHandle<()> {
        let (tx, mut rx) = mpsc::unbounded_channel::<BrowserOutgoingMessage>();
        self.bridge.register_external_handler(&session_id, tx).await;

        let adapter = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                match msg {
                    BrowserOutgoingMessage::UserMessage { content, images } => {
                        if let Err(e) = adapter.send_message(&session_id, &content, &images).await {
                            tracing::warn!(session_id = %session_id, error = %e, "sse adapter send_message failed");
                        }
                    }
                    BrowserOutgoingMessage::Interrupt => {
                        if let Err(e) = adapter.send_interrupt(&session_id).await {
                            tracing::warn!(session_id = %session_id, error = %e, "sse adapter interrupt failed");
                        }
                    }
                    // Model changes and permission responses have no
                    // upstream counterpart in this adapter: permission asks
                    // are auto-approved by policy before the browser is ever
                    // asked (see `map_event`), so a response never arrives.
                    BrowserOutgoingMessage::SetModel { .. } | BrowserOutgoingMessage::PermissionResponse { .. } => {}
                }
            }
        })
    }

    async fn send_message(&self, session_id: &str, content: &str, images: &[ImageAttachment]) -> Result<()> {
        let upstream_id = self.upstream_id_for(session_id).await?;
        let mut parts: Vec<Value> = images
            .iter()
            .map(|img| json!({ "type": "image", "mediaType": img.media_type, "data": img.data }))
            .collect();
        parts.push(json!({ "type": "text", "text": content }));

        let client = self.client.clone();
        let url = format!("{}/sessions/{}/messages", self.base_url, upstream_id);
        let body = json!({ "parts": parts });
        tokio::spawn(async move {
            if let Err(e) = client.post(&url).json(&body).send().await {
                tracing::warn!(error = %e, "sse adapter sendMessage request failed");
            }
        });

        let start = json!({
            "type": "stream_event",
            "event": { "type": "message_start" },
        });
        self.bridge
            .inject_to_browsers(session_id, AgentFrame { raw: start.to_string(), value: start })
            .await;
        Ok(())
    }

    async fn send_interrupt(&self, session_id: &str) -> Result<()> {
        let upstream_id = self.upstream_id_for(session_id).await?;
        self.client
            .post(format!("{}/sessions/{}/interrupt", self.base_url, upstream_id))
            .send()
            .await?;
        Ok(())
    }

    async fn upstream_id_for(&self, session_id: &str) -> Result<String> {
        self.upstream_ids
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| Error::Upstream(format!("no upstream session for {session_id}")))
    }

    /// Background task: hold the `/events` SSE stream open, reconnecting
    /// with exponential backoff (2s, capped at 5s) for as long as the
    /// adapter is alive.
    pub fn start_event_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let adapter = Arc::clone(self);
        tokio::spawn(async move {
            let mut backoff = RECONNECT_MIN;
            loop {
                match adapter.run_event_stream().await {
                    Ok(()) => backoff = RECONNECT_MIN,
                    Err(e) => {
                        tracing::warn!(error = %e, "sse adapter event stream disconnected, reconnecting");
                    }
                }
                tokio::time::sleep(backoff).await;
                backoff = std::cmp::min(backoff * 2, RECONNECT_MAX);
            }
        })
    }

    async fn run_event_stream(&self) -> Result<()> {
        let resp = self.client.get(format!("{}/events", self.base_url)).send().await?;
        let mut stream = resp.bytes_stream();
        let mut buf = String::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            buf.push_str(&String::from_utf8_lossy(&chunk));

            for payload in drain_sse_payloads(&mut buf) {
                let Ok(event) = serde_json::from_str::<Value>(&payload) else {
                    tracing::warn!(payload = %payload, "dropping malformed sse payload");
                    continue;
                };
                self.dispatch_event(event).await;
            }
        }
        Ok(())
    }

    async fn dispatch_event(&self, event: Value) {
        let Some(upstream_id) = event.get("sessionId").and_then(|v| v.as_str()) else {
            return;
        };
        let session_id = {
            let map = self.upstream_ids.read().await;
            map.iter().find(|(_, v)| v.as_str() == upstream_id).map(|(k, _)| k.clone())
        };
        let Some(session_id) = session_id else {
            tracing::warn!(upstream_id, "sse event for unmapped upstream session");
            return;
        };

        match map_event(&event, self.truncate_bytes) {
            SseAction::Frame(frame) => {
                self.bridge.inject_to_browsers(&session_id, frame).await;
            }
            SseAction::AutoApprove { request_id } => {
                if let Ok(upstream) = self.upstream_id_for(&session_id).await {
                    let _ = self
                        .client
                        .post(format!("{}/sessions/{}/permissions/{}", self.base_url, upstream, request_id))
                        .json(&json!({ "behavior": "always_allow" }))
                        .send()
                        .await;
                }
            }
            SseAction::None => {}
        }
    }
}

/// What an incoming SSE event maps to.
#[derive(Debug)]
enum SseAction {
    Frame(AgentFrame),
    AutoApprove { request_id: String },
    None,
}

/// Pure event-type mapping (spec §4.3.1 event routing), split out from the
/// network loop so it can be unit tested without a live upstream.
fn map_event(event: &Value, truncate_bytes: usize) -> SseAction {
    let event_type = event.get("type").and_then(|v| v.as_str()).unwrap_or("");
    match event_type {
        "message_delta" => {
            let text = event.get("text").and_then(|v| v.as_str()).unwrap_or("");
            SseAction::Frame(frame(json!({
                "type": "stream_event",
                "event": { "type": "content_block_delta", "delta": { "type": "text_delta", "text": text } },
            })))
        }
        "message_final" => {
            let blocks = build_final_blocks(event, truncate_bytes);
            SseAction::Frame(frame(json!({ "type": "assistant", "message": { "content": blocks } })))
        }
        "tool_start" => {
            let tool_name = event.get("toolName").and_then(|v| v.as_str()).unwrap_or("");
            let tool_use_id = event.get("toolUseId").and_then(|v| v.as_str()).unwrap_or("");
            SseAction::Frame(frame(json!({
                "type": "tool_progress",
                "tool_name": tool_name,
                "tool_use_id": tool_use_id,
            })))
        }
        "idle" | "completion" => SseAction::Frame(frame(json!({ "type": "result" }))),
        "permission_ask" => {
            let request_id = event.get("requestId").and_then(|v| v.as_str()).unwrap_or("").to_string();
            SseAction::AutoApprove { request_id }
        }
        "error" => {
            let message = event.get("message").and_then(|v| v.as_str()).unwrap_or("upstream error");
            SseAction::Frame(frame(json!({
                "type": "assistant",
                "message": { "content": [{ "type": "text", "text": message }] },
            })))
        }
        _ => SseAction::None,
    }
}

/// Concatenate text, tool-use, and matched tool-result blocks for a
/// `message_final` event, truncating any tool output past the configured
/// byte budget.
fn build_final_blocks(event: &Value, truncate_bytes: usize) -> Vec<Value> {
    let mut blocks = Vec::new();
    let Some(raw_blocks) = event.get("blocks").and_then(|v| v.as_array()) else {
        return blocks;
    };

    for block in raw_blocks {
        match block.get("type").and_then(|v| v.as_str()) {
            Some("text") => blocks.push(block.clone()),
            Some("tool_use") => blocks.push(block.clone()),
            Some("tool_result") => {
                let mut truncated = block.clone();
                if let Some(content) = truncated.get("content").and_then(|v| v.as_str()) {
                    if content.len() > truncate_bytes {
                        let clipped: String = content.chars().take(truncate_bytes).collect();
                        truncated["content"] = json!(format!("{clipped}... [truncated]"));
                    }
                }
                blocks.push(truncated);
            }
            _ => {}
        }
    }
    blocks
}

fn frame(value: Value) -> AgentFrame {
    AgentFrame { raw: value.to_string(), value }
}

/// Extract complete `data: <json>\n\n` payloads from an accumulating
/// buffer, leaving any partial trailing event in place.
fn drain_sse_payloads(buf: &mut String) -> Vec<String> {
    let mut payloads = Vec::new();
    while let Some(end) = buf.find("\n\n") {
        let event_block: String = buf.drain(..end + 2).collect();
        for line in event_block.lines() {
            if let Some(data) = line.strip_prefix("data: ") {
                payloads.push(data.to_string());
            } else if let Some(data) = line.strip_prefix("data:") {
                payloads.push(data.trim_start().to_string());
            }
        }
    }
    payloads
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_sse_payloads_complete_event() {
        let mut buf = "data: {\"a\":1}\n\n".to_string();
        let payloads = drain_sse_payloads(&mut buf);
        assert_eq!(payloads, vec!["{\"a\":1}"]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_drain_sse_payloads_leaves_partial_event() {
        let mut buf = "data: {\"a\":1}\n\ndata: {\"b\":2".to_string();
        let payloads = drain_sse_payloads(&mut buf);
        assert_eq!(payloads, vec!["{\"a\":1}"]);
        assert_eq!(buf, "data: {\"b\":2");
    }

    #[test]
    fn test_map_event_message_delta() {
        let event = json!({"type": "message_delta", "sessionId": "u1", "text": "hel"});
        match map_event(&event, 8000) {
            SseAction::Frame(f) => {
                assert_eq!(f.value["event"]["delta"]["text"], "hel");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_map_event_message_final_truncates_tool_result() {
        let long_output = "x".repeat(20);
        let event = json!({
            "type": "message_final",
            "blocks": [
                {"type": "text", "text": "done"},
                {"type": "tool_result", "content": long_output},
            ],
        });
        match map_event(&event, 10) {
            SseAction::Frame(f) => {
                let blocks = f.value["message"]["content"].as_array().unwrap();
                assert_eq!(blocks.len(), 2);
                let truncated = blocks[1]["content"].as_str().unwrap();
                assert!(truncated.ends_with("... [truncated]"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_map_event_permission_ask_auto_approves() {
        let event = json!({"type": "permission_ask", "requestId": "req-1"});
        match map_event(&event, 8000) {
            SseAction::AutoApprove { request_id } => assert_eq!(request_id, "req-1"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_map_event_idle_emits_result() {
        let event = json!({"type": "idle"});
        match map_event(&event, 8000) {
            SseAction::Frame(f) => assert_eq!(f.value["type"], "result"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_map_event_unknown_type_is_noop() {
        assert!(matches!(map_event(&json!({"type": "mystery"}), 8000), SseAction::None));
    }
}
