//! Durable, debounced, crash-safe persistence for cron jobs (spec §4.6).
//!
//! One file holds the job list (`cron-jobs.json`). Each job additionally
//! gets a `cron-runs/<jobId>/` directory with a run-history file (capped at
//! 100 entries) and a seen-dedupe-key file (capped at 5000 entries, oldest
//! evicted first). Writes are atomic (temp file + rename) and debounced per
//! file, mirroring `agent::session_store`.

use crate::scheduler::types::{CronJob, JobRun};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const JOB_LIST_DEBOUNCE_MS: u64 = 500;
const RUN_HISTORY_DEBOUNCE_MS: u64 = 500;
const SEEN_SET_DEBOUNCE_MS: u64 = 500;

pub const RUN_HISTORY_CAP: usize = 100;
pub const SEEN_SET_CAP: usize = 5000;

pub struct CronJobStore {
    base_dir: PathBuf,
    generations: Mutex<std::collections::HashMap<(String, &'static str), Arc<AtomicU64>>>,
}

impl CronJobStore {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir, generations: Mutex::new(std::collections::HashMap::new()) }
    }

    fn jobs_path(&self) -> PathBuf {
        self.base_dir.join("cron-jobs.json")
    }

    fn run_dir(&self, job_id: &str) -> PathBuf {
        self.base_dir.join("cron-runs").join(job_id)
    }

    fn runs_path(&self, job_id: &str) -> PathBuf {
        self.run_dir(job_id).join("runs.json")
    }

    fn seen_path(&self, job_id: &str) -> PathBuf {
        self.run_dir(job_id).join("seen-keys.json")
    }

    pub fn save_jobs(&self, jobs: Vec<CronJob>) {
        self.schedule_write("__jobs__", "jobs", self.jobs_path(), jobs, JOB_LIST_DEBOUNCE_MS);
    }

    pub async fn load_jobs(&self) -> Vec<CronJob> {
        read_json(&self.jobs_path()).await.unwrap_or_default()
    }

    pub fn save_runs(&self, job_id: &str, mut runs: Vec<JobRun>) {
        if runs.len() > RUN_HISTORY_CAP {
            let excess = runs.len() - RUN_HISTORY_CAP;
            runs.drain(0..excess);
        }
        self.schedule_write(job_id, "runs", self.runs_path(job_id), runs, RUN_HISTORY_DEBOUNCE_MS);
    }

    pub async fn load_runs(&self, job_id: &str) -> Vec<JobRun> {
        read_json(&self.runs_path(job_id)).await.unwrap_or_default()
    }

    pub fn save_seen(&self, job_id: &str, mut seen: VecDeque<String>) {
        while seen.len() > SEEN_SET_CAP {
            seen.pop_front();
        }
        let seen_vec: Vec<String> = seen.into_iter().collect();
        self.schedule_write(job_id, "seen", self.seen_path(job_id), seen_vec, SEEN_SET_DEBOUNCE_MS);
    }

    pub async fn load_seen(&self, job_id: &str) -> VecDeque<String> {
        let seen: Vec<String> = read_json(&self.seen_path(job_id)).await.unwrap_or_default();
        seen.into()
    }

    pub async fn remove_job(&self, job_id: &str) {
        {
            let mut generations = self.generations.lock().unwrap();
            for kind in ["runs", "seen"] {
                if let Some(counter) = generations.remove(&(job_id.to_string(), kind)) {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
        let _ = tokio::fs::remove_dir_all(self.run_dir(job_id)).await;
    }

    fn schedule_write<T>(&self, key_id: &str, kind: &'static str, path: PathBuf, value: T, debounce_ms: u64)
    where
        T: Serialize + Send + Sync + 'static,
    {
        let key = (key_id.to_string(), kind);
        let counter = {
            let mut generations = self.generations.lock().unwrap();
            generations.entry(key).or_insert_with(|| Arc::new(AtomicU64::new(0))).clone()
        };
        let generation = counter.fetch_add(1, Ordering::SeqCst) + 1;

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(debounce_ms)).await;
            if counter.load(Ordering::SeqCst) != generation {
                return;
            }
            if let Err(e) = write_atomic(&path, &value).await {
                tracing::warn!(path = %path.display(), error = %e, "debounced cron write failed");
            }
        });
    }

    /// Best-effort wait for in-flight debounced writes to land.
    pub async fn flush(&self) {
        let longest = JOB_LIST_DEBOUNCE_MS.max(RUN_HISTORY_DEBOUNCE_MS).max(SEEN_SET_DEBOUNCE_MS);
        tokio::time::sleep(Duration::from_millis(longest + 100)).await;
    }
}

async fn write_atomic<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let bytes = serde_json::to_vec_pretty(value)?;
    let tmp_path = path.with_file_name(format!("{}.tmp", path.file_name().unwrap_or_default().to_string_lossy()));
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
    use crate::scheduler::types::{JobRun, RunStatus};
    use tempfile::TempDir;

    fn sample_job(id: &str) -> CronJob {
        CronJob {
            id: id.to_string(),
            name: "test job".to_string(),
            job_type: "manual".to_string(),
            interval_seconds: 60,
            enabled: true,
            model: None,
            permission_mode: None,
            config: serde_json::json!({}),
            last_run_at: None,
            created_at: 0,
        }
    }

    fn sample_run(job_id: &str) -> JobRun {
        JobRun {
            id: "run-1".to_string(),
            job_id: job_id.to_string(),
            started_at: 0,
            finished_at: Some(1),
            status: RunStatus::Completed,
            trigger_count: 1,
            summary: None,
            first_session_id: None,
            error: None,
        }
    }

    #[tokio::test]
    async fn test_save_then_load_jobs_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = CronJobStore::new(dir.path().to_path_buf());
        store.save_jobs(vec![sample_job("j1"), sample_job("j2")]);
        store.flush().await;

        let loaded = store.load_jobs().await;
        assert_eq!(loaded.len(), 2);
    }

    #[tokio::test]
    async fn test_load_jobs_missing_file_returns_empty() {
        let dir = TempDir::new().unwrap();
        let store = CronJobStore::new(dir.path().to_path_buf());
        assert!(store.load_jobs().await.is_empty());
    }

    #[tokio::test]
    async fn test_save_runs_caps_at_100() {
        let dir = TempDir::new().unwrap();
        let store = CronJobStore::new(dir.path().to_path_buf());
        let runs: Vec<JobRun> = (0..150)
            .map(|i| JobRun { id: format!("run-{i}"), ..sample_run("j1") })
            .collect();
        store.save_runs("j1", runs);
        store.flush().await;

        let loaded = store.load_runs("j1").await;
        assert_eq!(loaded.len(), RUN_HISTORY_CAP);
        assert_eq!(loaded.last().unwrap().id, "run-149");
    }

    #[tokio::test]
    async fn test_save_seen_caps_and_evicts_oldest() {
        let dir = TempDir::new().unwrap();
        let store = CronJobStore::new(dir.path().to_path_buf());
        let seen: VecDeque<String> = (0..SEEN_SET_CAP + 10).map(|i| format!("key-{i}")).collect();
        store.save_seen("j1", seen);
        store.flush().await;

        let loaded = store.load_seen("j1").await;
        assert_eq!(loaded.len(), SEEN_SET_CAP);
        assert_eq!(loaded.front().unwrap(), "key-10");
    }

    #[tokio::test]
    async fn test_remove_job_deletes_run_dir() {
        let dir = TempDir::new().unwrap();
        let store = CronJobStore::new(dir.path().to_path_buf());
        store.save_runs("j1", vec![sample_run("j1")]);
        store.flush().await;
        store.remove_job("j1").await;

        assert!(store.load_runs("j1").await.is_empty());
        assert!(!store.run_dir("j1").exists());
    }
}
