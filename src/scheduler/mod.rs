//! Cron-style session scheduler (spec §4.5).
//!
//! A 15-second ticker walks the job list, skips jobs whose interval hasn't
//! elapsed or that are already running, and dispatches eligible jobs to
//! their `Checker`. Each trigger the checker returns that isn't in the
//! job's seen-set spawns a new agent session seeded with the trigger's
//! prompt. Manual triggers (`POST .../trigger`) bypass the interval check
//! but still go through the same dedup/dispatch pipeline.

pub mod checkers;
pub mod handler;
pub mod store;
pub mod types;

use crate::agent::bridge::AgentBridge;
use crate::agent::launcher::AgentLauncher;
use crate::agent::types::{now_millis, BrowserOutgoingMessage};
use crate::config::Config;
use checkers::CheckerRegistry;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use store::CronJobStore;
use tokio::sync::RwLock;
use types::{CronJob, JobRun, RunStatus, Trigger};

const TICK_INTERVAL: Duration = Duration::from_secs(15);

pub struct Scheduler {
    jobs: RwLock<HashMap<String, CronJob>>,
    active: RwLock<HashSet<String>>,
    checkers: CheckerRegistry,
    store: Arc<CronJobStore>,
    launcher: Arc<AgentLauncher>,
    bridge: Arc<AgentBridge>,
    base_cwd: String,
}

impl Scheduler {
    pub fn new(config: &Config, store: Arc<CronJobStore>, launcher: Arc<AgentLauncher>, bridge: Arc<AgentBridge>) -> Self {
        Self::with_checkers(config, store, launcher, bridge, checkers::default_registry())
    }

    /// Like [`Scheduler::new`] but with an explicit checker registry, so
    /// tests can register a stub checker instead of the real `poll-feed`/
    /// `manual` set.
    pub fn with_checkers(
        config: &Config,
        store: Arc<CronJobStore>,
        launcher: Arc<AgentLauncher>,
        bridge: Arc<AgentBridge>,
        checkers: CheckerRegistry,
    ) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            active: RwLock::new(HashSet::new()),
            checkers,
            store,
            launcher,
            bridge,
            base_cwd: config.base_cwd.to_string_lossy().to_string(),
        }
    }

    pub async fn restore_from_disk(&self) {
        let jobs = self.store.load_jobs().await;
        let mut guard = self.jobs.write().await;
        for job in jobs {
            guard.insert(job.id.clone(), job);
        }
    }

    async fn persist_jobs(&self) {
        let jobs: Vec<CronJob> = self.jobs.read().await.values().cloned().collect();
        self.store.save_jobs(jobs);
    }

    pub async fn add_job(&self, job: CronJob) {
        self.jobs.write().await.insert(job.id.clone(), job);
        self.persist_jobs().await;
    }

    pub async fn list_jobs(&self) -> Vec<CronJob> {
        self.jobs.read().await.values().cloned().collect()
    }

    pub async fn get_job(&self, job_id: &str) -> Option<CronJob> {
        self.jobs.read().await.get(job_id).cloned()
    }

    pub async fn update_job(&self, job_id: &str, f: impl FnOnce(&mut CronJob)) -> bool {
        let updated = {
            let mut jobs = self.jobs.write().await;
            match jobs.get_mut(job_id) {
                Some(job) => {
                    f(job);
                    true
                }
                None => false,
            }
        };
        if updated {
            self.persist_jobs().await;
        }
        updated
    }

    pub async fn delete_job(&self, job_id: &str) -> bool {
        let removed = self.jobs.write().await.remove(job_id).is_some();
        if removed {
            self.persist_jobs().await;
            self.store.remove_job(job_id).await;
        }
        removed
    }

    pub async fn job_runs(&self, job_id: &str, limit: usize) -> Vec<JobRun> {
        let mut runs = self.store.load_runs(job_id).await;
        if runs.len() > limit {
            let skip = runs.len() - limit;
            runs.drain(0..skip);
        }
        runs
    }

    pub async fn reset_job(&self, job_id: &str) -> bool {
        self.store.save_seen(job_id, Default::default());
        self.update_job(job_id, |job| job.last_run_at = None).await
    }

    /// Start the 15-second ticker. Returns the task handle.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK_INTERVAL);
            loop {
                interval.tick().await;
                scheduler.tick().await;
            }
        })
    }

    async fn tick(&self) {
        let now = now_millis();
        let due: Vec<String> = {
            let jobs = self.jobs.read().await;
            let active = self.active.read().await;
            jobs.values()
                .filter(|j| j.is_eligible(now) && !active.contains(&j.id))
                .map(|j| j.id.clone())
                .collect()
        };

        for job_id in due {
            self.dispatch(&job_id, false).await;
        }
    }

    /// Run a job now. Bypasses the interval-eligibility check but still
    /// respects the reentrancy guard — an already-running job cannot be
    /// double-triggered.
    pub async fn trigger(self: &Arc<Self>, job_id: &str) -> bool {
        let exists = self.jobs.read().await.contains_key(job_id);
        if !exists {
            return false;
        }
        if self.active.read().await.contains(job_id) {
            return false;
        }
        let scheduler = Arc::clone(self);
        let job_id = job_id.to_string();
        tokio::spawn(async move { scheduler.dispatch(&job_id, true).await });
        true
    }

    async fn dispatch(&self, job_id: &str, manual: bool) {
        {
            let mut active = self.active.write().await;
            if active.contains(job_id) {
                return;
            }
            active.insert(job_id.to_string());
        }

        if let Err(e) = self.run_job(job_id, manual).await {
            tracing::warn!(job_id, error = %e, "cron job dispatch failed");
        }

        self.active.write().await.remove(job_id);
    }

    async fn run_job(&self, job_id: &str, manual: bool) -> anyhow::Result<()> {
        let job = self
            .jobs
            .read()
            .await
            .get(job_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("job {job_id} disappeared before dispatch"))?;

        let started_at = now_millis();
        let run_id = uuid::Uuid::new_v4().to_string();
        tracing::info!(job_id, manual, "cron job run starting");

        let check = match self.checkers.get(job.job_type.as_str()) {
            Some(checker) => checker.check(&job.config).await,
            None => checkers::CheckResult {
                triggers: vec![],
                error: Some(format!("no checker registered for type {}", job.job_type)),
            },
        };

        let mut seen = self.store.load_seen(job_id).await;
        let fresh: Vec<Trigger> = check.triggers.into_iter().filter(|t| !seen.contains(&t.dedupe_key)).collect();

        let mut first_session_id = None;
        let mut spawned = 0usize;
        for trigger in &fresh {
            match self.spawn_for_trigger(&job, trigger).await {
                Ok(session_id) => {
                    if first_session_id.is_none() {
                        first_session_id = Some(session_id);
                    }
                    spawned += 1;
                    seen.push_back(trigger.dedupe_key.clone());
                }
                Err(e) => {
                    tracing::warn!(job_id, dedupe_key = %trigger.dedupe_key, error = %e, "failed to spawn session for trigger")
                }
            }
        }
        self.store.save_seen(job_id, seen);

        let finished_at = now_millis();
        let status = if check.error.is_some() && spawned == 0 { RunStatus::Failed } else { RunStatus::Completed };
        let mut runs = self.store.load_runs(job_id).await;
        runs.push(JobRun {
            id: run_id,
            job_id: job_id.to_string(),
            started_at,
            finished_at: Some(finished_at),
            status,
            trigger_count: spawned,
            summary: Some(format!("{spawned} session(s) spawned")),
            first_session_id,
            error: check.error,
        });
        self.store.save_runs(job_id, runs);

        self.update_job(job_id, |job| job.last_run_at = Some(finished_at)).await;

        Ok(())
    }

    async fn spawn_for_trigger(&self, job: &CronJob, trigger: &Trigger) -> anyhow::Result<String> {
        let session_id = uuid::Uuid::new_v4().to_string();
        self.launcher
            .spawn(&session_id, job.model.clone(), job.permission_mode.clone(), self.base_cwd.clone())
            .await?;
        self.bridge.ensure_session(&session_id).await;

        if let Some(name) = &trigger.session_name {
            self.launcher.set_name(&session_id, name.clone()).await;
        }

        self.bridge
            .route_browser_message(
                &session_id,
                BrowserOutgoingMessage::UserMessage { content: trigger.seed_prompt.clone(), images: vec![] },
            )
            .await;

        Ok(session_id)
    }
}
