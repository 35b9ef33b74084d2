//! `POST /notify-device` — forces a fan-out for a serial's already-cached
//! state, for test/debug use (spec §4.H). Useful to confirm a long-poll
//! wakes up without waiting for a real state change.

use axum::extract::State;
use serde::Deserialize;

use crate::app_state::AppState;
use crate::control::ApiKeyAuth;
use crate::error::{Error, Result};

#[derive(Debug, Deserialize)]
pub struct NotifyDeviceRequest {
    pub serial: String,
}

pub async fn notify_device(
    State(state): State<AppState>,
    ApiKeyAuth(caller): ApiKeyAuth,
    axum::Json(body): axum::Json<NotifyDeviceRequest>,
) -> Result<axum::Json<serde_json::Value>> {
    if !caller.scopes.allows_serial(&body.serial) {
        return Err(Error::Unauthorized(format!(
            "api key is not scoped to serial {}",
            body.serial
        )));
    }

    let objects = state.state.get_all_for_device(&body.serial).await?;
    let result = state.subscriptions.notify_all(&body.serial, &objects).await;

    Ok(axum::Json(serde_json::json!({
        "notified": result.notified,
        "removed": result.removed,
    })))
}
