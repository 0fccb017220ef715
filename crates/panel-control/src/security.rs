use axum::{
    body::Body,
    extract::State,
    http::{HeaderValue, Method, Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use axum_extra::headers::{Authorization, HeaderMapExt, authorization::Basic};

use crate::state::AppState;

const AUTH_CHALLENGE: &str = "Basic realm=\"Authorization Required\"";

fn is_read_only_method(method: &Method) -> bool {
    matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS)
}

fn unauthorized() -> Response {
    let mut res = StatusCode::UNAUTHORIZED.into_response();
    res.headers_mut().insert(
        header::WWW_AUTHENTICATE,
        HeaderValue::from_static(AUTH_CHALLENGE),
    );
    res
}

// Middleware: read-only methods pass; anything else needs the admin password
// via HTTP Basic auth. The username is not checked.
pub async fn admin_gate(State(state): State<AppState>, req: Request<Body>, next: Next) -> Response {
    if is_read_only_method(req.method()) {
        return next.run(req).await;
    }

    let password = req
        .headers()
        .typed_get::<Authorization<Basic>>()
        .map(|auth| auth.password().to_string())
        .unwrap_or_default();

    if !state.admin.verify(password).await {
        tracing::warn!(method = %req.method(), path = %req.uri().path(), "rejected unauthenticated request");
        return unauthorized();
    }

    next.run(req).await
}

// Middleware: one line per request, after the response head is produced.
pub async fn access_log(req: Request<Body>, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let started = tokio::time::Instant::now();

    let res = next.run(req).await;

    tracing::info!(
        %method,
        %path,
        status = res.status().as_u16(),
        latency_ms = started.elapsed().as_millis() as u64,
        "http request"
    );
    res
}
