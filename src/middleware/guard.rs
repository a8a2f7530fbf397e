//! API guard middleware
//!
//! Checks run in a fixed order: bearer token (401), IP allowlist (403),
//! rate limit (429). Each check is independently optional through
//! configuration.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::AppState;
use crate::utils::ApiError;

pub async fn api_guard(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let api = &state.config.api;

    if let Some(expected) = &api.token {
        let presented = bearer_token(&request);
        if !presented.is_some_and(|token| constant_time_eq(token.as_bytes(), expected.as_bytes()))
        {
            return ApiError::unauthorized("missing or invalid API token").into_response();
        }
    }

    let client_ip = client_ip(&request);

    if !api.ip_allowlist.is_empty() {
        let allowed = client_ip
            .as_deref()
            .is_some_and(|ip| api.ip_allowlist.iter().any(|entry| entry == ip));
        if !allowed {
            return ApiError::forbidden("client address is not allowed").into_response();
        }
    }

    let rate_key = client_ip.unwrap_or_else(|| "unknown".to_string());
    if !state.rate_limiter.check(&rate_key) {
        return ApiError::rate_limited("rate limit exceeded, retry in a minute").into_response();
    }

    next.run(request).await
}

fn bearer_token(request: &Request) -> Option<String> {
    request
        .headers()
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::to_string)
}

/// Client address, preferring the first `X-Forwarded-For` hop over the
/// socket peer.
fn client_ip(request: &Request) -> Option<String> {
    if let Some(forwarded) = request.headers().get("x-forwarded-for") {
        if let Ok(value) = forwarded.to_str() {
            if let Some(first) = value.split(',').next() {
                let trimmed = first.trim();
                if !trimmed.is_empty() {
                    return Some(trimmed.to_string());
                }
            }
        }
    }
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string())
}

/// Comparison whose running time does not depend on where the inputs
/// differ.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
