//! Unified API router.
//!
//! Merges every module's routes into one axum `Router` with CORS. Every
//! REST endpoint is mounted under `/api`; the two WebSocket endpoints are
//! mounted at the bare paths the agent module names, since a browser's
//! `new WebSocket(...)` URL isn't subject to the same API-versioning
//! concerns as the REST surface. Per spec §6.1/§6.2, `/health`,
//! `/auth/login`, `/auth/logout`, `/auth/status`, `/updates/check`, and
//! `/ws/agent/:id` are public; everything else requires the auth cookie,
//! enforced by `auth::middleware::require_auth`.
//!
//! ## Endpoint map
//!
//! | Prefix                  | Module    | Auth      | Description                 |
//! |--------------------------|----------|-----------|------------------------------|
//! | `/api/health`            | gateway  | public    | Health probe                 |
//! | `/api/updates/check`     | gateway  | public    | Update check                 |
//! | `/api/updates/install`   | gateway  | cookie    | Update install                |
//! | `/api/sessions/*`        | agent    | cookie    | Session CRUD, kill, resume    |
//! | `/api/auth/*`            | auth     | public    | Login, logout, status         |
//! | `/api/cron/*`            | scheduler| cookie    | Cron job CRUD, trigger, runs   |
//! | `/ws/agent/:id`          | agent    | public    | Agent NDJSON socket            |
//! | `/ws/browser/:id`        | agent    | cookie    | Browser whole-JSON socket       |

use crate::agent::{agent_router, agent_ws_router, browser_ws_router, AgentState};
use crate::auth::handler::{auth_router, AuthHttpState};
use crate::auth::middleware::require_auth;
use crate::gateway::{gateway_protected_router, gateway_router, GatewayHttpState};
use crate::scheduler::handler::{scheduler_router, SchedulerState};
use axum::http::{header, Method};
use axum::middleware::from_fn_with_state;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};

pub fn build_app(
    agent_state: AgentState,
    auth_state: AuthHttpState,
    scheduler_state: SchedulerState,
    gateway_state: GatewayHttpState,
    cors_origins: &[String],
) -> Router {
    let auth = auth_state.auth.clone();

    let public_api = Router::new().merge(gateway_router(gateway_state.clone())).merge(auth_router(auth_state));

    let protected_api = Router::new()
        .merge(gateway_protected_router(gateway_state))
        .merge(agent_router(agent_state.clone()))
        .merge(scheduler_router(scheduler_state))
        .layer(from_fn_with_state(auth.clone(), require_auth));

    let protected_browser_ws = browser_ws_router(agent_state.clone()).layer(from_fn_with_state(auth, require_auth));

    Router::new()
        .nest("/api", public_api.merge(protected_api))
        .merge(agent_ws_router(agent_state))
        .merge(protected_browser_ws)
        .layer(build_cors(cors_origins))
}

fn build_cors(origins: &[String]) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION, header::ACCEPT]);

    if origins.is_empty() {
        cors.allow_origin(Any)
    } else {
        let parsed: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();
        cors.allow_origin(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_cors_empty_origins() {
        let _cors = build_cors(&[]);
    }

    #[test]
    fn test_build_cors_with_origins() {
        let _cors = build_cors(&["http://localhost:1420".to_string()]);
    }
}
