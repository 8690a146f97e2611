//! Durable, debounced, crash-safe persistence for bridge sessions.
//!
//! Each session gets a subdirectory holding `meta.json`, `state.json`, and
//! `history.json`. Writes are atomic (write to a temp file, then rename)
//! and debounced per file: a fresh write resets that file's quiet window,
//! so a burst of updates to the same session collapses into one write.

use crate::agent::types::SessionState;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const META_DEBOUNCE_MS: u64 = 500;
const STATE_DEBOUNCE_MS: u64 = 500;
const HISTORY_DEBOUNCE_MS: u64 = 1000;

/// Everything the bridge needs to reconstruct a `BridgeSession` on restore.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedSession {
    pub id: String,
    pub state: SessionState,
    pub message_history: Vec<serde_json::Value>,
    pub pending_messages: Vec<String>,
    pub pending_permissions: HashMap<String, serde_json::Value>,
    pub cli_session_id: Option<String>,
    pub archived: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct MetaFile {
    id: String,
    cli_session_id: Option<String>,
    archived: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct HistoryFile {
    message_history: Vec<serde_json::Value>,
    pending_messages: Vec<String>,
    pending_permissions: HashMap<String, serde_json::Value>,
}

pub struct AgentSessionStore {
    base_dir: PathBuf,
    /// Per (session id, file kind) write generation. A debounced write
    /// checks its captured generation against the current one before
    /// touching disk; a superseded write is a silent no-op.
    generations: Mutex<HashMap<(String, &'static str), Arc<AtomicU64>>>,
}

impl AgentSessionStore {
    pub fn new(base_dir: PathBuf) -> Self {
        Self {
            base_dir,
            generations: Mutex::new(HashMap::new()),
        }
    }

    fn session_dir(&self, id: &str) -> PathBuf {
        self.base_dir.join(id)
    }

    /// Enqueue debounced writes of all three files for a session. Returns
    /// immediately; writes land after their quiet window elapses.
    pub fn save(&self, persisted: PersistedSession) {
        let meta = MetaFile {
            id: persisted.id.clone(),
            cli_session_id: persisted.cli_session_id.clone(),
            archived: persisted.archived,
        };
        let history = HistoryFile {
            message_history: persisted.message_history,
            pending_messages: persisted.pending_messages,
            pending_permissions: persisted.pending_permissions,
        };

        self.schedule_write(&persisted.id, "meta", meta, META_DEBOUNCE_MS);
        self.schedule_write(&persisted.id, "state", persisted.state, STATE_DEBOUNCE_MS);
        self.schedule_write(&persisted.id, "history", history, HISTORY_DEBOUNCE_MS);
    }

    fn schedule_write<T>(&self, id: &str, kind: &'static str, value: T, debounce_ms: u64)
    where
        T: Serialize + Send + Sync + 'static,
    {
        let key = (id.to_string(), kind);
        let counter = {
            let mut generations = self.generations.lock().unwrap();
            let counter = generations
                .entry(key)
                .or_insert_with(|| Arc::new(AtomicU64::new(0)))
                .clone();
            counter
        };
        let generation = counter.fetch_add(1, Ordering::SeqCst) + 1;
        let path = self.session_dir(id).join(format!("{kind}.json"));

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(debounce_ms)).await;
            if counter.load(Ordering::SeqCst) != generation {
                return;
            }
            if let Err(e) = write_atomic(&path, &value).await {
                tracing::warn!(path = %path.display(), error = %e, "debounced write failed");
            }
        });
    }

    /// Load a single session's persisted record. Missing `state.json` or
    /// `history.json` is tolerated (spec §4.4); a missing `meta.json` means
    /// the session doesn't exist on disk.
    pub async fn load(&self, id: &str) -> Option<PersistedSession> {
        let dir = self.session_dir(id);
        let meta: MetaFile = read_json(&dir.join("meta.json")).await?;
        let state = read_json(&dir.join("state.json"))
            .await
            .unwrap_or_else(|| SessionState::new(id.to_string()));
        let history: HistoryFile = read_json(&dir.join("history.json")).await.unwrap_or_default();

        Some(PersistedSession {
            id: meta.id,
            state,
            message_history: history.message_history,
            pending_messages: history.pending_messages,
            pending_permissions: history.pending_permissions,
            cli_session_id: meta.cli_session_id,
            archived: meta.archived,
        })
    }

    /// Enumerate the base directory and load every session whose
    /// `meta.json` is readable. A corrupt session is skipped, not fatal.
    pub async fn load_all(&self) -> Vec<PersistedSession> {
        let mut out = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.base_dir).await {
            Ok(e) => e,
            Err(_) => return out,
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            if !entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let id = entry.file_name().to_string_lossy().to_string();
            match self.load(&id).await {
                Some(persisted) => out.push(persisted),
                None => tracing::warn!(session_id = %id, "skipping unreadable persisted session"),
            }
        }

        out
    }

    /// Cancel pending writes for a session and best-effort delete its
    /// directory.
    pub async fn remove(&self, id: &str) {
        {
            let mut generations = self.generations.lock().unwrap();
            for kind in ["meta", "state", "history"] {
                if let Some(counter) = generations.remove(&(id.to_string(), kind)) {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
        let _ = tokio::fs::remove_dir_all(self.session_dir(id)).await;
    }

    /// Best-effort wait for in-flight debounced writes to land. Used at
    /// graceful shutdown; not a strict barrier (a write scheduled after this
    /// call returns is not covered).
    pub async fn flush(&self) {
        tokio::time::sleep(Duration::from_millis(HISTORY_DEBOUNCE_MS + 100)).await;
    }
}

async fn write_atomic<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let bytes = serde_json::to_vec_pretty(value)?;
    let tmp_path = path.with_file_name(format!(
        "{}.tmp",
        path.file_name().unwrap_or_default().to_string_lossy()
    ));
    tokio::fs::write(&tmp_path, bytes).await?;
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

async fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Option<T> {
    let bytes = tokio::fs::read(path).await.ok()?;
    serde_json::from_slice(&bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample(id: &str) -> PersistedSession {
        PersistedSession {
            id: id.to_string(),
            state: SessionState::new(id.to_string()),
            message_history: vec![serde_json::json!({"type": "assistant"})],
            pending_messages: vec!["queued\n".to_string()],
            pending_permissions: HashMap::new(),
            cli_session_id: Some("cli-1".to_string()),
            archived: false,
        }
    }

    #[tokio::test]
    async fn test_save_then_load_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = AgentSessionStore::new(dir.path().to_path_buf());
        store.save(sample("s1"));
        store.flush().await;

        let loaded = store.load("s1").await.unwrap();
        assert_eq!(loaded.id, "s1");
        assert_eq!(loaded.cli_session_id.as_deref(), Some("cli-1"));
        assert_eq!(loaded.message_history.len(), 1);
        assert_eq!(loaded.pending_messages.len(), 1);
    }

    #[tokio::test]
    async fn test_load_missing_session_returns_none() {
        let dir = TempDir::new().unwrap();
        let store = AgentSessionStore::new(dir.path().to_path_buf());
        assert!(store.load("nonexistent").await.is_none());
    }

    #[tokio::test]
    async fn test_load_all_skips_nothing_readable() {
        let dir = TempDir::new().unwrap();
        let store = AgentSessionStore::new(dir.path().to_path_buf());
        store.save(sample("s1"));
        store.save(sample("s2"));
        store.flush().await;

        let mut all = store.load_all().await;
        all.sort_by(|a, b| a.id.cmp(&b.id));
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, "s1");
        assert_eq!(all[1].id, "s2");
    }

    #[tokio::test]
    async fn test_debounce_collapses_rapid_writes() {
        let dir = TempDir::new().unwrap();
        let store = AgentSessionStore::new(dir.path().to_path_buf());

        let mut s = sample("s1");
        for i in 0..5 {
            s.cli_session_id = Some(format!("cli-{i}"));
            store.save(s.clone());
        }
        store.flush().await;

        let loaded = store.load("s1").await.unwrap();
        assert_eq!(loaded.cli_session_id.as_deref(), Some("cli-4"));
    }

    #[tokio::test]
    async fn test_remove_cancels_pending_write_and_deletes_dir() {
        let dir = TempDir::new().unwrap();
        let store = AgentSessionStore::new(dir.path().to_path_buf());
        store.save(sample("s1"));
        store.remove("s1").await;
        store.flush().await;

        assert!(store.load("s1").await.is_none());
        assert!(!dir.path().join("s1").exists());
    }
}
