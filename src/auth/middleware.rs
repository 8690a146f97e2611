//! Axum middleware enforcing the cookie gate spec §6.2 puts on every
//! endpoint except `/health`, `/auth/login`, `/auth/logout`,
//! `/auth/status`, and `/updates/check`.

use super::handler::cookie_from_headers;
use super::AuthState;
use crate::error::Error;
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::sync::Arc;

pub async fn require_auth(State(auth): State<Arc<AuthState>>, request: Request, next: Next) -> Response {
    let valid = match cookie_from_headers(request.headers()) {
        Some(cookie) => auth.validate(&cookie).is_some(),
        None => !auth.enabled(),
    };
    if !valid {
        return Error::Unauthorized.into_response();
    }
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::COOKIE_NAME;
    use axum::body::Body;
    use axum::http::{Request as HttpRequest, StatusCode};
    use axum::middleware::from_fn_with_state;
    use axum::routing::get;
    use axum::Router;
    use tower::ServiceExt;

    fn router_with(auth: Arc<AuthState>) -> Router {
        Router::new().route("/protected", get(|| async { "ok" })).layer(from_fn_with_state(auth, require_auth))
    }

    #[tokio::test]
    async fn test_disabled_auth_allows_through() {
        let auth = Arc::new(AuthState::new(None, None, std::env::temp_dir().join("fossclaw-test-auth-disabled.json")));
        let app = router_with(auth);
        let response =
            app.oneshot(HttpRequest::builder().uri("/protected").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_missing_cookie_is_rejected() {
        let auth = Arc::new(AuthState::new(
            Some("admin".to_string()),
            Some("secret".to_string()),
            std::env::temp_dir().join("fossclaw-test-auth-missing.json"),
        ));
        let app = router_with(auth);
        let response =
            app.oneshot(HttpRequest::builder().uri("/protected").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_valid_cookie_is_accepted() {
        let auth = Arc::new(AuthState::new(
            Some("admin".to_string()),
            Some("secret".to_string()),
            std::env::temp_dir().join("fossclaw-test-auth-valid.json"),
        ));
        let cookie = auth.login("admin", "secret").unwrap();
        let app = router_with(auth);
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .uri("/protected")
                    .header(axum::http::header::COOKIE, format!("{COOKIE_NAME}={cookie}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
