//! Session auto-naming (spec §4.1's `user_message` naming side effect,
//! §9 "naming-service error swallowing").
//!
//! `AgentBridge` pushes `(session_id, first_message)` onto a channel the
//! first time a session receives a user turn with no custom name set. This
//! module drains that channel and asks an optional local LLM endpoint for
//! a short title, best-effort: a failed or unconfigured naming call leaves
//! the session unnamed rather than failing the user's turn.

use crate::agent::launcher::AgentLauncher;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;

const NAMING_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);
const NAMING_PROMPT_PREFIX: &str = "Give a 3-5 word title for a coding session that starts with this request. Respond with the title only, no punctuation or quotes.\n\nRequest: ";

pub struct Namer {
    client: reqwest::Client,
    naming_url: Option<String>,
    naming_model: Option<String>,
    launcher: Arc<AgentLauncher>,
}

impl Namer {
    pub fn new(naming_url: Option<String>, naming_model: Option<String>, launcher: Arc<AgentLauncher>) -> Self {
        Self { client: reqwest::Client::new(), naming_url, naming_model, launcher }
    }

    /// Drain the first-turn channel forever, naming sessions best-effort.
    pub fn spawn(self: Arc<Self>, mut rx: mpsc::Receiver<(String, String)>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while let Some((session_id, first_message)) = rx.recv().await {
                if let Err(e) = self.name_session(&session_id, &first_message).await {
                    tracing::debug!(session_id, error = %e, "session naming skipped");
                }
            }
        })
    }

    async fn name_session(&self, session_id: &str, first_message: &str) -> anyhow::Result<()> {
        let Some(url) = &self.naming_url else {
            anyhow::bail!("no naming endpoint configured");
        };
        let model = self.naming_model.as_deref().unwrap_or("default");

        let body = json!({
            "model": model,
            "messages": [{ "role": "user", "content": format!("{NAMING_PROMPT_PREFIX}{first_message}") }],
            "stream": false,
        });

        let resp = self.client.post(url).json(&body).timeout(NAMING_TIMEOUT).send().await?;
        let value: serde_json::Value = resp.json().await?;
        let title = extract_title(&value).ok_or_else(|| anyhow::anyhow!("no title in naming response"))?;

        self.launcher.set_name(session_id, title).await;
        Ok(())
    }
}

/// Pulls a title out of an OpenAI-style chat-completion response shape
/// (`choices[0].message.content`), trimmed and capped at a sane length.
fn extract_title(value: &serde_json::Value) -> Option<String> {
    let content = value.get("choices")?.get(0)?.get("message")?.get("content")?.as_str()?;
    let trimmed = content.trim().trim_matches('"');
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.chars().take(80).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_title_from_chat_completion_shape() {
        let value = json!({ "choices": [{ "message": { "content": "Fix login bug" } }] });
        assert_eq!(extract_title(&value), Some("Fix login bug".to_string()));
    }

    #[test]
    fn test_extract_title_strips_quotes_and_whitespace() {
        let value = json!({ "choices": [{ "message": { "content": "  \"Refactor parser\"  " } }] });
        assert_eq!(extract_title(&value), Some("Refactor parser".to_string()));
    }

    #[test]
    fn test_extract_title_missing_shape_returns_none() {
        assert_eq!(extract_title(&json!({})), None);
    }

    #[test]
    fn test_extract_title_empty_content_returns_none() {
        let value = json!({ "choices": [{ "message": { "content": "   " } }] });
        assert_eq!(extract_title(&value), None);
    }
}
