//! REST API for auth (spec §6.2): `POST /auth/login`, `POST /auth/logout`,
//! `GET /auth/status`.

use super::{AuthState, COOKIE_NAME};
use axum::extract::State;
use axum::http::header::{HeaderMap, SET_COOKIE};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

#[derive(Clone)]
pub struct AuthHttpState {
    pub auth: Arc<AuthState>,
}

pub fn auth_router(state: AuthHttpState) -> Router {
    Router::new()
        .route("/auth/login", post(login))
        .route("/auth/logout", post(logout))
        .route("/auth/status", get(status))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

pub(crate) fn cookie_from_headers(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(axum::http::header::COOKIE)?.to_str().ok()?;
    raw.split(';').find_map(|part| {
        let (name, value) = part.trim().split_once('=')?;
        (name == COOKIE_NAME).then(|| value.to_string())
    })
}

async fn login(State(state): State<AuthHttpState>, Json(req): Json<LoginRequest>) -> impl IntoResponse {
    match state.auth.login(&req.username, &req.password) {
        Some(cookie) => {
            let set_cookie = format!("{COOKIE_NAME}={cookie}; Path=/; HttpOnly; SameSite=Lax; Max-Age=2592000");
            let mut headers = HeaderMap::new();
            headers.insert(SET_COOKIE, set_cookie.parse().unwrap());
            (axum::http::StatusCode::OK, headers, Json(json!({ "success": true }))).into_response()
        }
        None => (axum::http::StatusCode::UNAUTHORIZED, Json(json!({ "error": "invalid credentials" }))).into_response(),
    }
}

async fn logout(State(state): State<AuthHttpState>, headers: HeaderMap) -> impl IntoResponse {
    if let Some(cookie) = cookie_from_headers(&headers) {
        state.auth.logout(&cookie);
    }
    let clear_cookie = format!("{COOKIE_NAME}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0");
    let mut response_headers = HeaderMap::new();
    response_headers.insert(SET_COOKIE, clear_cookie.parse().unwrap());
    (axum::http::StatusCode::OK, response_headers, Json(json!({ "success": true })))
}

async fn status(State(state): State<AuthHttpState>) -> impl IntoResponse {
    Json(json!({ "authEnabled": state.auth.enabled() }))
}
