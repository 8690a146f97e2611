//! Pluggable per-job-type checkers (spec §4.5).
//!
//! A checker consumes a job's typed `config` and returns a list of
//! triggers (possibly empty) plus an optional error. All external I/O for
//! a job type lives behind its checker; the scheduler loop itself never
//! talks to an external system directly.

use crate::scheduler::types::Trigger;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct CheckResult {
    pub triggers: Vec<Trigger>,
    pub error: Option<String>,
}

#[async_trait]
pub trait Checker: Send + Sync {
    /// The `type` tag jobs use to select this checker.
    fn job_type(&self) -> &'static str;
    async fn check(&self, config: &Value) -> CheckResult;
}

/// Checker registry keyed by `job_type()`.
pub type CheckerRegistry = HashMap<&'static str, Arc<dyn Checker>>;

pub fn default_registry() -> CheckerRegistry {
    let mut registry: CheckerRegistry = HashMap::new();
    let poll_feed = Arc::new(PollFeedChecker::new(reqwest::Client::new()));
    registry.insert(poll_feed.job_type(), poll_feed);
    let manual = Arc::new(ManualChecker);
    registry.insert(manual.job_type(), manual);
    registry
}

/// `type: "manual"` — never fires on the ticker; exists purely so a manual
/// trigger (`POST .../trigger`) has a well-defined, always-empty scheduled
/// check to bypass.
struct ManualChecker;

#[async_trait]
impl Checker for ManualChecker {
    fn job_type(&self) -> &'static str {
        "manual"
    }

    async fn check(&self, _config: &Value) -> CheckResult {
        CheckResult::default()
    }
}

/// `type: "poll-feed"` — GETs a JSON array of `{ "id": ..., "title": ... }`
/// items from a configured URL and spawns one session per unseen item.
/// Config shape: `{ "url": "...", "promptTemplate": "..." }`. The template
/// supports `{{item.id}}` and `{{item.title}}` placeholder tokens.
struct PollFeedChecker {
    client: reqwest::Client,
}

impl PollFeedChecker {
    fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Checker for PollFeedChecker {
    fn job_type(&self) -> &'static str {
        "poll-feed"
    }

    async fn check(&self, config: &Value) -> CheckResult {
        let Some(url) = config.get("url").and_then(|v| v.as_str()) else {
            return CheckResult { triggers: vec![], error: Some("poll-feed config missing url".to_string()) };
        };
        let template = config
            .get("promptTemplate")
            .and_then(|v| v.as_str())
            .unwrap_or("New item: {{item.title}}");

        let items = match self.client.get(url).send().await {
            Ok(resp) => match resp.json::<Vec<Value>>().await {
                Ok(items) => items,
                Err(e) => return CheckResult { triggers: vec![], error: Some(format!("invalid feed response: {e}")) },
            },
            Err(e) => return CheckResult { triggers: vec![], error: Some(format!("feed request failed: {e}")) },
        };

        let triggers = items
            .iter()
            .filter_map(|item| {
                let id = item.get("id").and_then(|v| v.as_str())?.to_string();
                let title = item.get("title").and_then(|v| v.as_str()).unwrap_or("").to_string();
                let seed_prompt = render_template(template, &id, &title);
                Some(Trigger { dedupe_key: id, seed_prompt, session_name: Some(title) })
            })
            .collect();

        CheckResult { triggers, error: None }
    }
}

fn render_template(template: &str, id: &str, title: &str) -> String {
    template.replace("{{item.id}}", id).replace("{{item.title}}", title)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_template_substitutes_tokens() {
        let rendered = render_template("Handle {{item.id}}: {{item.title}}", "42", "Build it");
        assert_eq!(rendered, "Handle 42: Build it");
    }

    #[tokio::test]
    async fn test_manual_checker_always_empty() {
        let checker = ManualChecker;
        let result = checker.check(&Value::Null).await;
        assert!(result.triggers.is_empty());
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn test_poll_feed_checker_requires_url() {
        let checker = PollFeedChecker::new(reqwest::Client::new());
        let result = checker.check(&serde_json::json!({})).await;
        assert!(result.triggers.is_empty());
        assert!(result.error.is_some());
    }

    #[test]
    fn test_default_registry_has_both_checkers() {
        let registry = default_registry();
        assert!(registry.contains_key("manual"));
        assert!(registry.contains_key("poll-feed"));
    }
}
