//! JSON-RPC streaming adapter (spec §4.3.2).
//!
//! Holds a persistent duplex socket to an external process speaking
//! JSON-RPC 2.0. Requests carry monotonic numeric ids and are correlated to
//! their response with a timeout via a pending-request map; notifications
//! are routed straight into the same agent-frame vocabulary a native
//! process would emit.

use crate::agent::bridge::AgentBridge;
use crate::agent::types::{AgentFrame, BrowserOutgoingMessage};
use crate::error::{Error, Result};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;

const RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

pub struct JsonRpcAdapter {
    bridge: Arc<AgentBridge>,
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<Value>>>,
    outbound: mpsc::UnboundedSender<Message>,
    /// Upstream thread ids, keyed by our session id, handed back by
    /// `thread/start` and referenced by `turn/start`/`turn/interrupt`.
    threads: Arc<RwLock<HashMap<String, String>>>,
    /// Per-session in-progress assistant text, accumulated across
    /// `item/agentMessage/delta` notifications until the matching `final`.
    pending_text: Arc<RwLock<HashMap<String, String>>>,
}

impl JsonRpcAdapter {
    /// Connect to the external process's duplex socket and spawn the
    /// reader/writer plumbing. Returns the adapter plus a join handle for
    /// the socket pump task.
    pub async fn connect(url: &str, bridge: Arc<AgentBridge>) -> Result<(Arc<Self>, tokio::task::JoinHandle<()>)> {
        let (ws, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| Error::Upstream(format!("json-rpc adapter connect failed: {e}")))?;
        let (mut write, mut read) = ws.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

        let adapter = Arc::new(Self {
            bridge,
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            outbound: outbound_tx,
            threads: Arc::new(RwLock::new(HashMap::new())),
            pending_text: Arc::new(RwLock::new(HashMap::new())),
        });

        let writer_task = tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                if write.send(msg).await.is_err() {
                    break;
                }
            }
        });

        let reader_adapter = adapter.clone();
        let reader_task = tokio::spawn(async move {
            while let Some(Ok(msg)) = read.next().await {
                if let Message::Text(text) = msg {
                    reader_adapter.handle_incoming(&text).await;
                }
            }
        });

        let pump = tokio::spawn(async move {
            let _ = tokio::join!(writer_task, reader_task);
        });

        adapter.initialize().await?;
        Ok((adapter, pump))
    }

    async fn initialize(&self) -> Result<()> {
        self.call("initialize", json!({})).await?;
        Ok(())
    }

    /// Start an upstream thread for a session and inject a synthetic
    /// `session_init` frame.
    pub async fn create_session(&self, session_id: &str, model: Option<&str>, cwd: &str) -> Result<()> {
        let resp = self.call("thread/start", json!({ "model": model, "cwd": cwd })).await?;
        let thread_id = resp
            .get("threadId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::Upstream("thread/start response missing threadId".to_string()))?
            .to_string();
        self.threads.write().await.insert(session_id.to_string(), thread_id);

        let init = json!({ "type": "system", "subtype": "init", "model": model, "cwd": cwd });
        self.bridge
            .inject_to_browsers(session_id, AgentFrame { raw: init.to_string(), value: init })
            .await;
        Ok(())
    }

    /// Register this adapter as the browser-message handler for a session
    /// and return the task forwarding browser messages to `turn/start` /
    /// `turn/interrupt`.
    pub async fn attach(self: &Arc<Self>, session_id: String) -> tokio::task::JoinHandle<()> {
        let (tx, mut rx) = mpsc::unbounded_channel::<BrowserOutgoingMessage>();
        self.bridge.register_external_handler(&session_id, tx).await;

        let adapter = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let result = match msg {
                    BrowserOutgoingMessage::UserMessage { content, .. } => {
                        adapter.start_turn(&session_id, &content).await
                    }
                    BrowserOutgoingMessage::Interrupt => adapter.interrupt_turn(&session_id).await,
                    BrowserOutgoingMessage::SetModel { .. } | BrowserOutgoingMessage::PermissionResponse { .. } => {
                        Ok(())
                    }
                };
                if let Err(e) = result {
                    tracing::warn!(session_id = %session_id, error = %e, "json-rpc adapter request failed");
                }
            }
        })
    }

    async fn start_turn(&self, session_id: &str, content: &str) -> Result<()> {
        let thread_id = self.thread_id_for(session_id).await?;
        self.call("turn/start", json!({ "threadId": thread_id, "text": content })).await?;
        Ok(())
    }

    async fn interrupt_turn(&self, session_id: &str) -> Result<()> {
        let thread_id = self.thread_id_for(session_id).await?;
        self.call("turn/interrupt", json!({ "threadId": thread_id })).await?;
        Ok(())
    }

    async fn thread_id_for(&self, session_id: &str) -> Result<String> {
        self.threads
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| Error::Upstream(format!("no upstream thread for {session_id}")))
    }

    /// Send a JSON-RPC request and await its correlated response, or time
    /// out.
    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let request = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
        self.outbound
            .send(Message::Text(request.to_string()))
            .map_err(|_| Error::Upstream("json-rpc adapter socket closed".to_string()))?;

        match tokio::time::timeout(RESPONSE_TIMEOUT, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(Error::Upstream(format!("json-rpc request {method} dropped"))),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(Error::Upstream(format!("json-rpc request {method} timed out")))
            }
        }
    }

    async fn handle_incoming(&self, text: &str) {
        let Ok(value) = serde_json::from_str::<Value>(text) else {
            tracing::warn!(text, "dropping malformed json-rpc message");
            return;
        };

        if let Some(id) = value.get("id").and_then(|v| v.as_u64()) {
            let mut pending = self.pending.lock().await;
            if let Some(tx) = pending.remove(&id) {
                let result = value.get("result").cloned().unwrap_or(Value::Null);
                let _ = tx.send(result);
            } else {
                tracing::warn!(id, "unmatched json-rpc response, dropping");
            }
            return;
        }

        let Some(method) = value.get("method").and_then(|v| v.as_str()) else {
            return;
        };
        let params = value.get("params").cloned().unwrap_or(Value::Null);
        self.dispatch_notification(method, params).await;
    }

    async fn dispatch_notification(&self, method: &str, params: Value) {
        let Some(thread_id) = params.get("threadId").and_then(|v| v.as_str()) else {
            return;
        };
        let session_id = {
            let threads = self.threads.read().await;
            threads.iter().find(|(_, v)| v.as_str() == thread_id).map(|(k, _)| k.clone())
        };
        let Some(session_id) = session_id else {
            tracing::warn!(thread_id, method, "notification for unmapped thread");
            return;
        };

        match method {
            "turn/started" => {}
            "item/agentMessage/delta" => {
                let text = params.get("text").and_then(|v| v.as_str()).unwrap_or("");
                self.pending_text
                    .write()
                    .await
                    .entry(session_id.clone())
                    .or_default()
                    .push_str(text);
                let frame = json!({
                    "type": "stream_event",
                    "event": { "type": "content_block_delta", "delta": { "type": "text_delta", "text": text } },
                });
                self.bridge
                    .inject_to_browsers(&session_id, AgentFrame { raw: frame.to_string(), value: frame })
                    .await;
            }
            "item/agentMessage/final" => {
                let collected = self.pending_text.write().await.remove(&session_id).unwrap_or_default();
                let text = params.get("text").and_then(|v| v.as_str()).map(str::to_string).unwrap_or(collected);
                let frame = json!({
                    "type": "assistant",
                    "message": { "content": [{ "type": "text", "text": text }] },
                });
                self.bridge
                    .inject_to_browsers(&session_id, AgentFrame { raw: frame.to_string(), value: frame })
                    .await;
            }
            "turn/completed" => {
                let frame = json!({ "type": "result" });
                self.bridge
                    .inject_to_browsers(&session_id, AgentFrame { raw: frame.to_string(), value: frame })
                    .await;
            }
            "item/toolCall/start" => {
                let tool_name = params.get("toolName").and_then(|v| v.as_str()).unwrap_or("");
                let frame = json!({ "type": "tool_progress", "tool_name": tool_name });
                self.bridge
                    .inject_to_browsers(&session_id, AgentFrame { raw: frame.to_string(), value: frame })
                    .await;
            }
            "item/toolCall/final" => {
                let tool_name = params.get("toolName").and_then(|v| v.as_str()).unwrap_or("");
                let tool_use_id = params.get("toolCallId").and_then(|v| v.as_str()).unwrap_or("");
                let input = params.get("input").cloned().unwrap_or(Value::Null);
                let output = params.get("output").and_then(|v| v.as_str()).unwrap_or("");
                let frame = json!({
                    "type": "assistant",
                    "message": { "content": [
                        { "type": "tool_use", "id": tool_use_id, "name": tool_name, "input": input },
                        { "type": "tool_result", "tool_use_id": tool_use_id, "content": output },
                    ] },
                });
                self.bridge
                    .inject_to_browsers(&session_id, AgentFrame { raw: frame.to_string(), value: frame })
                    .await;
            }
            other => {
                tracing::debug!(method = other, "unhandled json-rpc notification");
            }
        }
    }
}
