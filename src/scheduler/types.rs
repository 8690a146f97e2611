//! Cron job and run-record types (spec §4.5/§4.6).

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronJob {
    pub id: String,
    pub name: String,
    /// Selects a `Checker` by its `job_type()` tag, e.g. `"poll-feed"`.
    pub job_type: String,
    pub interval_seconds: u64,
    pub enabled: bool,
    pub model: Option<String>,
    pub permission_mode: Option<String>,
    /// Checker-specific configuration, opaque to the scheduler itself.
    pub config: Value,
    /// `None` means never run — treated as `-infinity` for eligibility.
    pub last_run_at: Option<i64>,
    pub created_at: i64,
}

impl CronJob {
    pub fn is_eligible(&self, now_millis: i64) -> bool {
        if !self.enabled {
            return false;
        }
        match self.last_run_at {
            None => true,
            Some(last) => now_millis.saturating_sub(last) >= (self.interval_seconds as i64) * 1000,
        }
    }
}

/// One candidate session to spawn. `dedupe_key` is compared against the
/// job's seen-set so the same external event never spawns twice.
#[derive(Debug, Clone)]
pub struct Trigger {
    pub dedupe_key: String,
    pub seed_prompt: String,
    pub session_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRun {
    pub id: String,
    pub job_id: String,
    pub started_at: i64,
    pub finished_at: Option<i64>,
    pub status: RunStatus,
    pub trigger_count: usize,
    pub summary: Option<String>,
    pub first_session_id: Option<String>,
    pub error: Option<String>,
}
