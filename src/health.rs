//! Liveness endpoint.

use axum::http::StatusCode;
use axum::Json;
use fred::interfaces::ClientLike;
use serde::Serialize;

use crate::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub store: CheckResult,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

async fn check_store(pool: &fred::clients::Pool) -> CheckResult {
    match pool.ping::<String>(None).await {
        Ok(_) => CheckResult { ok: true, detail: None },
        Err(err) => CheckResult {
            ok: false,
            detail: Some(format!("PING failed: {err}")),
        },
    }
}

/// `GET /healthz` body. The store is required for the key-watcher, so a
/// failed ping reports unhealthy (503).
pub async fn health_response(state: &AppState) -> (StatusCode, Json<HealthResponse>) {
    let store = check_store(&state.store).await;
    let status = if store.ok {
        HealthStatus::Ok
    } else {
        HealthStatus::Unhealthy
    };
    let http_status = match status {
        HealthStatus::Ok => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (http_status, Json(HealthResponse { status, store }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&HealthStatus::Unhealthy).unwrap(),
            "\"unhealthy\""
        );
    }

    #[test]
    fn check_detail_omitted_when_healthy() {
        let body = serde_json::to_string(&CheckResult { ok: true, detail: None }).unwrap();
        assert_eq!(body, "{\"ok\":true}");
    }
}
