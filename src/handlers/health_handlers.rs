//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness that asks the storage backend to probe itself

use crate::services::gateway_service::GatewayService;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::collections::HashMap;

/// `GET /healthz`
///
/// Very small liveness probe. Always returns 200 OK and never touches the backend.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// Runs the backend's own checks (HeadBucket for S3; SQLite and disk I/O for
/// the local backend). HTTP 200 when all pass, 503 otherwise.
pub async fn readyz(State(service): State<GatewayService>) -> impl IntoResponse {
    let results = service.readiness().await;
    let overall_ok = results.iter().all(|check| check.ok());

    let checks = results
        .into_iter()
        .map(|check| {
            (
                check.name,
                CheckStatus {
                    ok: check.error.is_none(),
                    error: check.error,
                },
            )
        })
        .collect();

    let body = ReadyResponse {
        status: if overall_ok {
            "ok".into()
        } else {
            "error".into()
        },
        backend: service.backend_name(),
        checks,
    };

    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    backend: &'static str,
    checks: HashMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}
