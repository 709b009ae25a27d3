use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;

use crate::AppState;

/// Guards admin routes with `Authorization: Bearer <token>`.
///
/// - missing header or another scheme: `401`
/// - dev mode: any bearer token passes
/// - no configured admin token, or a different one: `403`
pub async fn admin_auth_middleware(req: Request<Body>, next: Next) -> Result<Response, StatusCode> {
    let token = match req.headers().get(header::AUTHORIZATION) {
        Some(val) => {
            let val_str = val.to_str().map_err(|_| StatusCode::UNAUTHORIZED)?;
            val_str
                .strip_prefix("Bearer ")
                .ok_or(StatusCode::UNAUTHORIZED)?
                .trim()
                .to_string()
        }
        None => return Err(StatusCode::UNAUTHORIZED),
    };

    let state = req
        .extensions()
        .get::<Arc<AppState>>()
        .ok_or(StatusCode::INTERNAL_SERVER_ERROR)?
        .clone();

    let auth = &state.config.auth;
    if auth.dev_mode {
        tracing::debug!(path = %req.uri().path(), "dev mode: admin token not checked");
        return Ok(next.run(req).await);
    }

    match auth.admin_token.as_deref() {
        Some(expected) if constant_time_eq(expected.as_bytes(), token.as_bytes()) => {
            Ok(next.run(req).await)
        }
        Some(_) => {
            tracing::warn!(path = %req.uri().path(), "admin request with wrong token");
            Err(StatusCode::FORBIDDEN)
        }
        None => {
            tracing::warn!(path = %req.uri().path(), "admin request refused: no admin token configured");
            Err(StatusCode::FORBIDDEN)
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
