//! Agent process lifecycle management.
//!
//! Owns the launcher record for every session: spawning the native child
//! process, resuming an archived session under a new id, killing, and the
//! exit-monitor task that flips a session to `exited` and tells the bridge
//! to archive it.

use crate::agent::session_store::AgentSessionStore;
use crate::agent::types::{now_millis, AgentProcessState, LauncherRecord, ProviderTag};
use crate::config::Config;
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, RwLock};

/// Manages agent process lifecycles across all sessions.
pub struct AgentLauncher {
    records: Arc<RwLock<HashMap<String, LauncherRecord>>>,
    processes: Arc<RwLock<HashMap<String, Child>>>,
    port: u16,
    agent_binary: Option<String>,
    store: Arc<AgentSessionStore>,
    /// Notified with a session id when its agent process exits, so the
    /// caller (the gateway) can archive the corresponding bridge session.
    exit_tx: mpsc::UnboundedSender<String>,
}

impl AgentLauncher {
    pub fn new(
        config: &Config,
        store: Arc<AgentSessionStore>,
        exit_tx: mpsc::UnboundedSender<String>,
    ) -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
            processes: Arc::new(RwLock::new(HashMap::new())),
            port: config.port,
            agent_binary: config.agent_binary.clone(),
            store,
            exit_tx,
        }
    }

    /// Spawn a native agent process for a brand-new session id.
    pub async fn spawn(
        &self,
        session_id: &str,
        model: Option<String>,
        permission_mode: Option<String>,
        cwd: String,
    ) -> Result<LauncherRecord> {
        let binary = self.resolve_binary()?;
        let sdk_url = format!("ws://127.0.0.1:{}/ws/agent/{}", self.port, session_id);
        let child = self
            .spawn_child(&binary, &sdk_url, &model, &permission_mode, &cwd, None)
            .await?;
        let pid = child.id();
        let now = now_millis();

        let record = LauncherRecord {
            session_id: session_id.to_string(),
            pid,
            model,
            permission_mode,
            provider: ProviderTag::Native,
            cwd,
            created_at: now,
            last_activity_at: now,
            session_name: None,
            state: AgentProcessState::Starting,
            archived: false,
            cli_session_id: None,
        };

        self.records.write().await.insert(session_id.to_string(), record.clone());
        self.processes.write().await.insert(session_id.to_string(), child);
        self.spawn_exit_monitor(session_id.to_string());

        Ok(record)
    }

    /// Register a non-native (adapter-backed) session. No child process is
    /// started; the adapter owns the upstream connection and pushes frames
    /// through `AgentBridge::inject_to_browsers` directly.
    pub async fn spawn_adapter(
        &self,
        session_id: &str,
        provider: ProviderTag,
        model: Option<String>,
        cwd: String,
    ) -> LauncherRecord {
        let now = now_millis();
        let record = LauncherRecord {
            session_id: session_id.to_string(),
            pid: None,
            model,
            permission_mode: None,
            provider,
            cwd,
            created_at: now,
            last_activity_at: now,
            session_name: None,
            state: AgentProcessState::Connected,
            archived: false,
            cli_session_id: None,
        };
        self.records.write().await.insert(session_id.to_string(), record.clone());
        record
    }

    /// Resume an archived session under a new session id. The prior
    /// history is retained by the bridge for reference but is not replayed
    /// to the newly spawned process.
    pub async fn resume(&self, source_id: &str) -> Result<(String, LauncherRecord)> {
        let source = self
            .records
            .read()
            .await
            .get(source_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("session {source_id}")))?;

        if !source.archived {
            return Err(Error::Validation(format!(
                "session {source_id} is still running"
            )));
        }

        let new_id = uuid::Uuid::new_v4().to_string();
        let binary = self.resolve_binary()?;
        let sdk_url = format!("ws://127.0.0.1:{}/ws/agent/{}", self.port, new_id);
        let child = self
            .spawn_child(
                &binary,
                &sdk_url,
                &source.model,
                &source.permission_mode,
                &source.cwd,
                source.cli_session_id.as_deref(),
            )
            .await?;
        let pid = child.id();
        let now = now_millis();

        let record = LauncherRecord {
            session_id: new_id.clone(),
            pid,
            model: source.model.clone(),
            permission_mode: source.permission_mode.clone(),
            provider: ProviderTag::Native,
            cwd: source.cwd.clone(),
            created_at: now,
            last_activity_at: now,
            session_name: source.session_name.clone(),
            state: AgentProcessState::Starting,
            archived: false,
            cli_session_id: None,
        };

        self.records.write().await.insert(new_id.clone(), record.clone());
        self.processes.write().await.insert(new_id.clone(), child);
        self.spawn_exit_monitor(new_id.clone());

        Ok((new_id, record))
    }

    async fn spawn_child(
        &self,
        binary: &PathBuf,
        sdk_url: &str,
        model: &Option<String>,
        permission_mode: &Option<String>,
        cwd: &str,
        resume_cli_session_id: Option<&str>,
    ) -> Result<Child> {
        let mut args = vec![
            "--sdk-url".to_string(),
            sdk_url.to_string(),
            "--print".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--input-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
        ];
        if let Some(m) = model {
            args.push("--model".to_string());
            args.push(m.clone());
        }
        if let Some(pm) = permission_mode {
            args.push("--permission-mode".to_string());
            args.push(pm.clone());
        }
        if let Some(cli_sid) = resume_cli_session_id {
            args.push("--resume".to_string());
            args.push(cli_sid.to_string());
        }
        args.push("-p".to_string());
        args.push(String::new());

        tracing::info!(binary = %binary.display(), cwd, "spawning agent process");

        Command::new(binary)
            .args(&args)
            .current_dir(cwd)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Lifecycle(format!("failed to spawn agent at {}: {e}", binary.display())))
    }

    pub async fn mark_connected(&self, session_id: &str) {
        let mut records = self.records.write().await;
        if let Some(record) = records.get_mut(session_id) {
            record.state = AgentProcessState::Connected;
        }
    }

    pub async fn set_cli_session_id(&self, session_id: &str, cli_session_id: String) {
        let mut records = self.records.write().await;
        if let Some(record) = records.get_mut(session_id) {
            record.cli_session_id = Some(cli_session_id);
        }
    }

    pub async fn touch_activity(&self, session_id: &str, at_millis: i64) {
        let mut records = self.records.write().await;
        if let Some(record) = records.get_mut(session_id) {
            record.last_activity_at = at_millis;
        }
    }

    /// Kill a running agent process: graceful signal, then a 5 second grace
    /// period before forced termination.
    pub async fn kill(&self, session_id: &str) -> Result<()> {
        let mut processes = self.processes.write().await;
        if let Some(mut child) = processes.remove(session_id) {
            let _ = child.start_kill();
            if tokio::time::timeout(Duration::from_secs(5), child.wait()).await.is_err() {
                tracing::warn!(session_id, "force killing agent process");
                let _ = child.kill().await;
            }
        }
        drop(processes);

        let mut records = self.records.write().await;
        if let Some(record) = records.get_mut(session_id) {
            record.state = AgentProcessState::Exited;
        }
        Ok(())
    }

    pub async fn get_session(&self, session_id: &str) -> Option<LauncherRecord> {
        self.records.read().await.get(session_id).cloned()
    }

    pub async fn all_sessions(&self) -> Vec<LauncherRecord> {
        self.records.read().await.values().cloned().collect()
    }

    pub async fn remove_session(&self, session_id: &str) {
        self.records.write().await.remove(session_id);
        self.processes.write().await.remove(session_id);
    }

    pub async fn set_name(&self, session_id: &str, name: String) {
        let mut records = self.records.write().await;
        if let Some(record) = records.get_mut(session_id) {
            record.session_name = Some(name);
        }
    }

    pub async fn set_archived(&self, session_id: &str, archived: bool) {
        let mut records = self.records.write().await;
        if let Some(record) = records.get_mut(session_id) {
            record.archived = archived;
            if archived {
                record.state = AgentProcessState::Exited;
            }
        }
    }

    /// Reload launcher records for sessions the session store still has on
    /// disk, marking live PIDs `starting` (awaiting the agent's socket
    /// reconnect) and dead ones `exited`.
    pub async fn restore_from_disk(&self) {
        let persisted = self.store.load_all().await;
        let mut records = self.records.write().await;
        for session in persisted {
            let state = if session.archived {
                AgentProcessState::Exited
            } else {
                AgentProcessState::Starting
            };
            records.insert(
                session.id.clone(),
                LauncherRecord {
                    session_id: session.id,
                    pid: None,
                    model: session.state.model.clone(),
                    permission_mode: Some(session.state.permission_mode.clone()).filter(|m| m != "default"),
                    provider: ProviderTag::Native,
                    cwd: session.state.cwd.clone().unwrap_or_default(),
                    created_at: now_millis(),
                    last_activity_at: now_millis(),
                    session_name: None,
                    state,
                    archived: session.archived,
                    cli_session_id: session.cli_session_id,
                },
            );
        }
    }

    /// 10-second watchdog relaunching sessions stuck `starting` (process
    /// died without the exit monitor seeing it, e.g. across a restart).
    pub fn start_reconnect_watchdog(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let launcher = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(10));
            loop {
                interval.tick().await;

                let stale: Vec<String> = {
                    let records = launcher.records.read().await;
                    records
                        .iter()
                        .filter(|(_, r)| r.state == AgentProcessState::Starting && !r.archived)
                        .map(|(id, _)| id.clone())
                        .collect()
                };

                for session_id in stale {
                    let source = launcher.records.read().await.get(&session_id).cloned();
                    let Some(source) = source else { continue };
                    if is_process_alive_opt(source.pid) {
                        continue;
                    }
                    tracing::info!(session_id = %session_id, "reconnect watchdog relaunching stale session");
                    launcher.set_archived(&session_id, true).await;
                    if let Err(e) = launcher.resume(&session_id).await {
                        tracing::warn!(session_id = %session_id, error = %e, "reconnect watchdog relaunch failed");
                    }
                }
            }
        })
    }

    /// Spawn a task that waits for process exit, marks the record `exited`,
    /// and notifies the caller so the bridge can archive the session.
    fn spawn_exit_monitor(&self, session_id: String) {
        let records = self.records.clone();
        let processes = self.processes.clone();
        let exit_tx = self.exit_tx.clone();

        tokio::spawn(async move {
            let exit_code = {
                let mut procs = processes.write().await;
                match procs.get_mut(&session_id) {
                    Some(child) => match child.wait().await {
                        Ok(status) => status.code(),
                        Err(_) => Some(-1),
                    },
                    None => return,
                }
            };

            tracing::info!(session_id = %session_id, exit_code = ?exit_code, "agent process exited");

            {
                let mut guard = records.write().await;
                if let Some(record) = guard.get_mut(&session_id) {
                    record.state = AgentProcessState::Exited;
                    record.archived = true;
                }
            }
            processes.write().await.remove(&session_id);
            let _ = exit_tx.send(session_id);
        });
    }

    fn resolve_binary(&self) -> Result<PathBuf> {
        if let Some(path) = &self.agent_binary {
            return Ok(PathBuf::from(path));
        }

        if let Ok(output) = std::process::Command::new("which").arg("claude").output() {
            if output.status.success() {
                let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if !path.is_empty() {
                    return Ok(PathBuf::from(path));
                }
            }
        }

        let home = dirs_next::home_dir().unwrap_or_else(|| PathBuf::from("."));
        let candidates = [
            home.join(".claude").join("local").join("claude"),
            PathBuf::from("/usr/local/bin/claude"),
            PathBuf::from("/opt/homebrew/bin/claude"),
        ];
        for candidate in &candidates {
            if candidate.exists() {
                return Ok(candidate.clone());
            }
        }

        Err(Error::Lifecycle(
            "agent CLI binary not found; set AGENT_BINARY or install it on PATH".to_string(),
        ))
    }
}

fn is_process_alive_opt(pid: Option<u32>) -> bool {
    match pid {
        Some(pid) => is_process_alive(pid),
        None => false,
    }
}

/// Check process liveness by sending signal 0.
pub fn is_process_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_launcher() -> (AgentLauncher, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(AgentSessionStore::new(dir.path().to_path_buf()));
        let config = Config { port: 3456, ..Config::default() };
        let (tx, _rx) = mpsc::unbounded_channel();
        (AgentLauncher::new(&config, store, tx), dir)
    }

    #[tokio::test]
    async fn test_empty_launcher() {
        let (launcher, _dir) = make_launcher();
        assert!(launcher.all_sessions().await.is_empty());
        assert!(launcher.get_session("nonexistent").await.is_none());
    }

    #[tokio::test]
    async fn test_spawn_adapter_records_session() {
        let (launcher, _dir) = make_launcher();
        let record = launcher
            .spawn_adapter("s1", ProviderTag::SseAdapter, Some("gpt-4o".to_string()), "/tmp".to_string())
            .await;
        assert_eq!(record.provider, ProviderTag::SseAdapter);
        assert_eq!(record.state, AgentProcessState::Connected);
        assert!(launcher.get_session("s1").await.is_some());
    }

    #[tokio::test]
    async fn test_mark_connected() {
        let (launcher, _dir) = make_launcher();
        launcher.spawn_adapter("s1", ProviderTag::Native, None, "/tmp".to_string()).await;
        launcher.mark_connected("s1").await;
        assert_eq!(launcher.get_session("s1").await.unwrap().state, AgentProcessState::Connected);
    }

    #[tokio::test]
    async fn test_set_cli_session_id() {
        let (launcher, _dir) = make_launcher();
        launcher.spawn_adapter("s1", ProviderTag::Native, None, "/tmp".to_string()).await;
        launcher.set_cli_session_id("s1", "cli-abc".to_string()).await;
        assert_eq!(launcher.get_session("s1").await.unwrap().cli_session_id.as_deref(), Some("cli-abc"));
    }

    #[tokio::test]
    async fn test_set_name_and_archived() {
        let (launcher, _dir) = make_launcher();
        launcher.spawn_adapter("s1", ProviderTag::Native, None, "/tmp".to_string()).await;
        launcher.set_name("s1", "My Session".to_string()).await;
        launcher.set_archived("s1", true).await;

        let record = launcher.get_session("s1").await.unwrap();
        assert_eq!(record.session_name.as_deref(), Some("My Session"));
        assert!(record.archived);
        assert_eq!(record.state, AgentProcessState::Exited);
    }

    #[tokio::test]
    async fn test_resume_rejects_non_archived_session() {
        let (launcher, _dir) = make_launcher();
        launcher.spawn_adapter("s1", ProviderTag::Native, None, "/tmp".to_string()).await;
        let result = launcher.resume("s1").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_resume_rejects_unknown_session() {
        let (launcher, _dir) = make_launcher();
        let result = launcher.resume("nonexistent").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_remove_session() {
        let (launcher, _dir) = make_launcher();
        launcher.spawn_adapter("s1", ProviderTag::Native, None, "/tmp".to_string()).await;
        launcher.remove_session("s1").await;
        assert!(launcher.get_session("s1").await.is_none());
    }

    #[tokio::test]
    async fn test_restore_from_disk_empty() {
        let (launcher, _dir) = make_launcher();
        launcher.restore_from_disk().await;
        assert!(launcher.all_sessions().await.is_empty());
    }

    #[test]
    fn test_is_process_alive_self() {
        assert!(is_process_alive(std::process::id()));
    }

    #[test]
    fn test_is_process_alive_nonexistent() {
        assert!(!is_process_alive(99_999_999));
    }
}
