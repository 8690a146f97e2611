//! Wire protocol types for the session bridge
//!
//! Two dialects meet at the bridge: line-delimited JSON from an attached
//! agent process, and whole-message JSON over a browser's duplex socket.
//! Agent frames are kept as loosely-typed [`AgentFrame`] values (a raw line
//! plus its parsed [`serde_json::Value`]) rather than a closed enum, because
//! the bridge must forward unknown agent frame types verbatim — a closed
//! sum type would force a decision on every new tag the agent ever emits.
//! Browser-originated messages are the opposite: a small, closed set, so
//! they are modeled as a proper tagged enum and unknown tags are rejected.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// =============================================================================
// Agent -> bridge (NDJSON)
// =============================================================================

/// One parsed NDJSON line from an agent socket: the original bytes (for
/// verbatim forwarding) alongside the parsed value (for dispatch).
#[derive(Debug, Clone)]
pub struct AgentFrame {
    pub raw: String,
    pub value: Value,
}

impl AgentFrame {
    pub fn type_tag(&self) -> Option<&str> {
        self.value.get("type").and_then(|v| v.as_str())
    }

    pub fn subtype(&self) -> Option<&str> {
        self.value.get("subtype").and_then(|v| v.as_str())
    }

    pub fn request_id(&self) -> Option<&str> {
        self.value.get("request_id").and_then(|v| v.as_str())
    }
}

/// Split a buffer of newline-delimited JSON into parsed frames. Malformed
/// lines are logged (first 200 bytes) and dropped; they do not poison the
/// rest of the buffer.
pub fn parse_ndjson(data: &str) -> Vec<AgentFrame> {
    data.lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match serde_json::from_str::<Value>(line) {
            Ok(value) => Some(AgentFrame {
                raw: line.to_string(),
                value,
            }),
            Err(e) => {
                let snippet: String = line.chars().take(200).collect();
                tracing::warn!(error = %e, line = %snippet, "dropping malformed agent frame");
                None
            }
        })
        .collect()
}

/// Fields present on a `system`/`init` frame. Every field is optional
/// because the agent may report only a subset; merging must overwrite only
/// the keys that are present (spec's duck-typed state merge), never the
/// whole state.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SystemInitFields {
    pub model: Option<String>,
    pub cwd: Option<String>,
    pub tools: Option<Vec<String>>,
    #[serde(rename = "permissionMode")]
    pub permission_mode: Option<String>,
    #[serde(rename = "claudeCodeVersion")]
    pub claude_code_version: Option<String>,
}

/// Fields present on a `result` frame, merged into session state.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResultFields {
    #[serde(rename = "totalCostUsd")]
    pub total_cost_usd: Option<f64>,
    #[serde(rename = "numTurns")]
    pub num_turns: Option<u32>,
    #[serde(rename = "contextUsedPercent")]
    pub context_used_percent: Option<f64>,
    #[serde(rename = "isCompacting")]
    pub is_compacting: Option<bool>,
}

// =============================================================================
// Session state snapshot (spec §3 "state")
// =============================================================================

/// Snapshot of agent-reported facts last seen for a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: String,
    pub model: Option<String>,
    pub cwd: Option<String>,
    pub tools: Vec<String>,
    pub permission_mode: String,
    pub claude_code_version: Option<String>,
    pub total_cost_usd: f64,
    pub num_turns: u32,
    pub context_used_percent: f64,
    pub is_compacting: bool,
    /// Transient status tag set by `system/status` frames (e.g. "compacting").
    pub status: Option<String>,
}

impl SessionState {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            model: None,
            cwd: None,
            tools: Vec::new(),
            permission_mode: "default".to_string(),
            claude_code_version: None,
            total_cost_usd: 0.0,
            num_turns: 0,
            context_used_percent: 0.0,
            is_compacting: false,
            status: None,
        }
    }

    /// Merge a `system/init` frame's fields, overwriting only present keys.
    pub fn merge_system_init(&mut self, fields: &SystemInitFields) {
        if let Some(model) = &fields.model {
            self.model = Some(model.clone());
        }
        if let Some(cwd) = &fields.cwd {
            self.cwd = Some(cwd.clone());
        }
        if let Some(tools) = &fields.tools {
            self.tools = tools.clone();
        }
        if let Some(mode) = &fields.permission_mode {
            self.permission_mode = mode.clone();
        }
        if let Some(version) = &fields.claude_code_version {
            self.claude_code_version = Some(version.clone());
        }
    }

    /// Merge a `result` frame's fields, overwriting only present keys.
    pub fn merge_result(&mut self, fields: &ResultFields) {
        if let Some(cost) = fields.total_cost_usd {
            self.total_cost_usd = cost;
        }
        if let Some(turns) = fields.num_turns {
            self.num_turns = turns;
        }
        if let Some(pct) = fields.context_used_percent {
            self.context_used_percent = pct;
        }
        if let Some(compacting) = fields.is_compacting {
            self.is_compacting = compacting;
        }
    }
}

// =============================================================================
// Browser -> bridge (whole-message JSON, closed vocabulary)
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageAttachment {
    pub media_type: String,
    pub data: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrowserOutgoingMessage {
    UserMessage {
        content: String,
        #[serde(default)]
        images: Vec<ImageAttachment>,
    },
    PermissionResponse {
        request_id: String,
        behavior: String,
        #[serde(default)]
        updated_input: Option<Value>,
        #[serde(default)]
        message: Option<String>,
    },
    Interrupt,
    SetModel {
        model: String,
    },
}

/// Build a message `content` value with any image blocks reordered ahead
/// of the text, per spec §4.1's browser-side translation rules. Plain text
/// with no images stays a bare string; shared by the agent-bound NDJSON
/// encoder and the bridge's history echo so both see the same shape.
pub fn user_message_content_value(content: &str, images: &[ImageAttachment]) -> Value {
    if images.is_empty() {
        Value::String(content.to_string())
    } else {
        let mut blocks: Vec<Value> = images
            .iter()
            .map(|img| {
                serde_json::json!({
                    "type": "image",
                    "source": { "media_type": img.media_type, "data": img.data },
                })
            })
            .collect();
        blocks.push(serde_json::json!({ "type": "text", "text": content }));
        Value::Array(blocks)
    }
}

/// Build the NDJSON line sent to the agent for a browser `user_message`.
/// Images precede text in the content array per spec §4.1.
pub fn user_message_to_cli_ndjson(content: &str, images: &[ImageAttachment]) -> String {
    serde_json::json!({
        "type": "user",
        "message": { "content": user_message_content_value(content, images) },
    })
    .to_string()
}

pub fn permission_response_to_cli_ndjson(
    request_id: &str,
    behavior: &str,
    updated_input: Option<&Value>,
    message: Option<&str>,
) -> String {
    serde_json::json!({
        "type": "control_response",
        "request_id": request_id,
        "response": {
            "behavior": behavior,
            "updatedInput": updated_input,
            "message": message,
        },
    })
    .to_string()
}

pub fn interrupt_to_cli_ndjson() -> String {
    serde_json::json!({ "type": "control", "action": "interrupt" }).to_string()
}

pub fn set_model_to_cli_ndjson(model: &str) -> String {
    serde_json::json!({ "type": "control", "action": "set_model", "model": model }).to_string()
}

/// Bridge-synthesized wrapper messages sent to browsers. Frames forwarded
/// verbatim from the agent (assistant, result, stream_event, tool_progress,
/// and anything unrecognized) are NOT modeled here — they go out as the
/// agent's own raw JSON text, untouched, per the bridge's forward-unknown
/// rule.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrowserIncomingMessage {
    SessionInit { session: SessionState },
    MessageHistory { messages: Vec<Value> },
    CliConnected,
    CliDisconnected,
    PermissionRequest { request: Value },
    PermissionCancelled { request_id: String },
    StatusChange { status: Option<String> },
}

// =============================================================================
// Launcher record (spec §3 "Launcher record")
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentProcessState {
    Starting,
    Connected,
    Running,
    Exited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderTag {
    Native,
    SseAdapter,
    RpcAdapter,
}

impl Default for ProviderTag {
    fn default() -> Self {
        ProviderTag::Native
    }
}

impl std::fmt::Display for ProviderTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProviderTag::Native => "native",
            ProviderTag::SseAdapter => "sse-adapter",
            ProviderTag::RpcAdapter => "rpc-adapter",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LauncherRecord {
    pub session_id: String,
    pub pid: Option<u32>,
    pub model: Option<String>,
    pub permission_mode: Option<String>,
    pub provider: ProviderTag,
    pub cwd: String,
    pub created_at: i64,
    pub last_activity_at: i64,
    pub session_name: Option<String>,
    pub state: AgentProcessState,
    pub archived: bool,
    pub cli_session_id: Option<String>,
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ndjson_skips_malformed() {
        let data = "{\"type\":\"user\"}\nnot json\n{\"type\":\"result\"}\n";
        let frames = parse_ndjson(data);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].type_tag(), Some("user"));
        assert_eq!(frames[1].type_tag(), Some("result"));
    }

    #[test]
    fn test_parse_ndjson_empty_lines_ignored() {
        let frames = parse_ndjson("\n\n{\"type\":\"user\"}\n\n");
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn test_user_message_to_cli_ndjson_plain_text() {
        let line = user_message_to_cli_ndjson("hi", &[]);
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["type"], "user");
        assert_eq!(value["message"]["content"], "hi");
    }

    #[test]
    fn test_user_message_to_cli_ndjson_images_precede_text() {
        let images = vec![ImageAttachment {
            media_type: "image/png".to_string(),
            data: "aGVsbG8=".to_string(),
        }];
        let line = user_message_to_cli_ndjson("caption", &images);
        let value: Value = serde_json::from_str(&line).unwrap();
        let content = value["message"]["content"].as_array().unwrap();
        assert_eq!(content.len(), 2);
        assert_eq!(content[0]["type"], "image");
        assert_eq!(content[1]["type"], "text");
        assert_eq!(content[1]["text"], "caption");
    }

    #[test]
    fn test_session_state_merge_system_init_partial() {
        let mut state = SessionState::new("s1");
        state.model = Some("old-model".to_string());
        let fields = SystemInitFields {
            model: None,
            cwd: Some("/tmp".to_string()),
            tools: None,
            permission_mode: None,
            claude_code_version: None,
        };
        state.merge_system_init(&fields);
        // model untouched because it was absent in this frame
        assert_eq!(state.model.as_deref(), Some("old-model"));
        assert_eq!(state.cwd.as_deref(), Some("/tmp"));
    }

    #[test]
    fn test_session_state_merge_result() {
        let mut state = SessionState::new("s1");
        state.merge_result(&ResultFields {
            total_cost_usd: Some(0.42),
            num_turns: Some(3),
            context_used_percent: Some(12.5),
            is_compacting: None,
        });
        assert_eq!(state.total_cost_usd, 0.42);
        assert_eq!(state.num_turns, 3);
        assert_eq!(state.context_used_percent, 12.5);
        assert!(!state.is_compacting);
    }

    #[test]
    fn test_permission_response_ndjson_shape() {
        let line = permission_response_to_cli_ndjson("req-1", "allow", None, None);
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["type"], "control_response");
        assert_eq!(value["request_id"], "req-1");
        assert_eq!(value["response"]["behavior"], "allow");
    }

    #[test]
    fn test_browser_outgoing_message_deserialize() {
        let json = serde_json::json!({"type": "user_message", "content": "hi"});
        let msg: BrowserOutgoingMessage = serde_json::from_value(json).unwrap();
        matches!(msg, BrowserOutgoingMessage::UserMessage { .. });
    }

    #[test]
    fn test_browser_outgoing_message_rejects_unknown_tag() {
        let json = serde_json::json!({"type": "not_a_real_message"});
        let result: Result<BrowserOutgoingMessage, _> = serde_json::from_value(json);
        assert!(result.is_err());
    }

    #[test]
    fn test_browser_incoming_message_tag() {
        let msg = BrowserIncomingMessage::PermissionCancelled {
            request_id: "req-1".to_string(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "permission_cancelled");
        assert_eq!(json["request_id"], "req-1");
    }

    #[test]
    fn test_provider_tag_display() {
        assert_eq!(ProviderTag::Native.to_string(), "native");
        assert_eq!(ProviderTag::SseAdapter.to_string(), "sse-adapter");
        assert_eq!(ProviderTag::RpcAdapter.to_string(), "rpc-adapter");
    }
}
