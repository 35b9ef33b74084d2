//! Liveness and readiness probes. Grounded on the reference server's
//! `health.rs` shape (`liveness`/`readiness`/`health` handlers returning
//! structured JSON), rebuilt against this service's own dependencies: the
//! state store and the subscription manager's parked-connection load.

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;

use crate::app_state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub checks: HealthChecks,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    pub store: CheckStatus,
    pub parked_subscriptions: usize,
}

#[derive(Debug, Serialize)]
pub struct CheckStatus {
    pub healthy: bool,
    pub detail: Option<String>,
}

/// `GET /healthz` — process is up and answering requests. Never touches the
/// store; a dependency outage should not make the process look dead.
pub async fn liveness() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "alive" })))
}

/// `GET /readyz` — the store answers a cheap query within budget. Used by
/// the orchestrator to gate traffic, not to decide whether to restart.
pub async fn readiness(State(state): State<AppState>) -> impl IntoResponse {
    let store_check = match state.store.get_entry_key("__healthcheck__").await {
        Ok(_) => CheckStatus { healthy: true, detail: None },
        Err(e) => CheckStatus { healthy: false, detail: Some(e.to_string()) },
    };

    let parked = state.subscriptions.total_parked();
    let overall_healthy = store_check.healthy;

    let body = HealthResponse {
        status: if overall_healthy { "ready" } else { "not_ready" },
        checks: HealthChecks {
            store: store_check,
            parked_subscriptions: parked,
        },
    };

    let code = if overall_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (code, Json(body))
}

/// `GET /health` — combined liveness/readiness detail for dashboards.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    readiness(State(state)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_checks_serialize_with_expected_shape() {
        let checks = HealthChecks {
            store: CheckStatus { healthy: true, detail: None },
            parked_subscriptions: 3,
        };
        let value = serde_json::to_value(&checks).unwrap();
        assert_eq!(value["parked_subscriptions"], 3);
        assert_eq!(value["store"]["healthy"], true);
    }
}
