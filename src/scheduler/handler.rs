//! REST API for cron jobs (spec §6.2).
//!
//! `GET/POST /cron/jobs`, `GET/PATCH/DELETE /cron/jobs/:id`,
//! `POST /cron/jobs/:id/toggle`, `POST /cron/jobs/:id/trigger`,
//! `GET /cron/jobs/:id/runs`, `POST /cron/jobs/:id/reset`, `GET /cron/status`.

use super::types::CronJob;
use super::Scheduler;
use crate::agent::types::now_millis;
use crate::error::{Error, Result};
use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

#[derive(Clone)]
pub struct SchedulerState {
    pub scheduler: Arc<Scheduler>,
}

pub fn scheduler_router(state: SchedulerState) -> Router {
    Router::new()
        .route("/cron/jobs", get(list_jobs).post(create_job))
        .route("/cron/jobs/:id", get(get_job).patch(update_job).delete(delete_job))
        .route("/cron/jobs/:id/toggle", post(toggle_job))
        .route("/cron/jobs/:id/trigger", post(trigger_job))
        .route("/cron/jobs/:id/runs", get(list_runs))
        .route("/cron/jobs/:id/reset", post(reset_job))
        .route("/cron/status", get(status))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    pub name: String,
    pub job_type: String,
    pub interval_seconds: u64,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub permission_mode: Option<String>,
    #[serde(default = "default_config")]
    pub config: serde_json::Value,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_config() -> serde_json::Value {
    json!({})
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Deserialize, Default)]
pub struct UpdateJobRequest {
    pub name: Option<String>,
    pub interval_seconds: Option<u64>,
    pub model: Option<String>,
    pub permission_mode: Option<String>,
    pub config: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct RunsQuery {
    #[serde(default = "default_runs_limit")]
    pub limit: usize,
}

fn default_runs_limit() -> usize {
    50
}

async fn list_jobs(State(state): State<SchedulerState>) -> impl IntoResponse {
    Json(state.scheduler.list_jobs().await)
}

async fn create_job(State(state): State<SchedulerState>, Json(req): Json<CreateJobRequest>) -> impl IntoResponse {
    let job = CronJob {
        id: uuid::Uuid::new_v4().to_string(),
        name: req.name,
        job_type: req.job_type,
        interval_seconds: req.interval_seconds,
        enabled: req.enabled,
        model: req.model,
        permission_mode: req.permission_mode,
        config: req.config,
        last_run_at: None,
        created_at: now_millis(),
    };
    state.scheduler.add_job(job.clone()).await;
    (axum::http::StatusCode::CREATED, Json(job))
}

async fn get_job(State(state): State<SchedulerState>, Path(id): Path<String>) -> Result<impl IntoResponse> {
    state
        .scheduler
        .get_job(&id)
        .await
        .map(Json)
        .ok_or_else(|| Error::NotFound(format!("cron job {id}")))
}

async fn update_job(
    State(state): State<SchedulerState>,
    Path(id): Path<String>,
    Json(req): Json<UpdateJobRequest>,
) -> Result<impl IntoResponse> {
    let updated = state
        .scheduler
        .update_job(&id, |job| {
            if let Some(name) = req.name {
                job.name = name;
            }
            if let Some(interval) = req.interval_seconds {
                job.interval_seconds = interval;
            }
            if req.model.is_some() {
                job.model = req.model;
            }
            if req.permission_mode.is_some() {
                job.permission_mode = req.permission_mode;
            }
            if let Some(config) = req.config {
                job.config = config;
            }
        })
        .await;

    if !updated {
        return Err(Error::NotFound(format!("cron job {id}")));
    }
    state.scheduler.get_job(&id).await.map(Json).ok_or_else(|| Error::NotFound(format!("cron job {id}")))
}

async fn delete_job(State(state): State<SchedulerState>, Path(id): Path<String>) -> Result<impl IntoResponse> {
    if state.scheduler.delete_job(&id).await {
        Ok(axum::http::StatusCode::NO_CONTENT)
    } else {
        Err(Error::NotFound(format!("cron job {id}")))
    }
}

async fn toggle_job(State(state): State<SchedulerState>, Path(id): Path<String>) -> Result<impl IntoResponse> {
    let mut enabled_after = false;
    let updated = state
        .scheduler
        .update_job(&id, |job| {
            job.enabled = !job.enabled;
            enabled_after = job.enabled;
        })
        .await;

    if !updated {
        return Err(Error::NotFound(format!("cron job {id}")));
    }
    Ok(Json(json!({ "id": id, "enabled": enabled_after })))
}

async fn trigger_job(State(state): State<SchedulerState>, Path(id): Path<String>) -> Result<impl IntoResponse> {
    if state.scheduler.trigger(&id).await {
        Ok(Json(json!({ "id": id, "triggered": true })))
    } else {
        Err(Error::NotFound(format!("cron job {id} (or already running)")))
    }
}

async fn list_runs(
    State(state): State<SchedulerState>,
    Path(id): Path<String>,
    Query(query): Query<RunsQuery>,
) -> impl IntoResponse {
    Json(state.scheduler.job_runs(&id, query.limit).await)
}

async fn reset_job(State(state): State<SchedulerState>, Path(id): Path<String>) -> Result<impl IntoResponse> {
    if state.scheduler.reset_job(&id).await {
        Ok(axum::http::StatusCode::NO_CONTENT)
    } else {
        Err(Error::NotFound(format!("cron job {id}")))
    }
}

async fn status(State(state): State<SchedulerState>) -> impl IntoResponse {
    let jobs = state.scheduler.list_jobs().await;
    let enabled = jobs.iter().filter(|j| j.enabled).count();
    Json(json!({ "job_count": jobs.len(), "enabled_count": enabled }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_job_request_defaults() {
        let json = json!({ "name": "watch", "job_type": "poll-feed", "interval_seconds": 300 });
        let req: CreateJobRequest = serde_json::from_value(json).unwrap();
        assert!(req.enabled);
        assert_eq!(req.config, serde_json::json!({}));
    }

    #[test]
    fn test_runs_query_default_limit() {
        let query: RunsQuery = serde_json::from_value(json!({})).unwrap();
        assert_eq!(query.limit, 50);
    }
}
