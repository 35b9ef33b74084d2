//! `GET /api/devices` — every serial the caller's user owns or has shared
//! access to (spec §4.H).

use axum::extract::State;
use serde::Serialize;

use crate::app_state::AppState;
use crate::control::ApiKeyAuth;
use crate::error::Result;

#[derive(Debug, Serialize)]
pub struct DeviceEntry {
    pub serial: String,
    pub shared: bool,
}

#[derive(Debug, Serialize)]
pub struct DevicesResponse {
    pub devices: Vec<DeviceEntry>,
}

pub async fn devices(
    State(state): State<AppState>,
    ApiKeyAuth(caller): ApiKeyAuth,
) -> Result<axum::Json<DevicesResponse>> {
    let owned = state.store.list_user_devices(&caller.user_id).await?;
    let shared = state.store.get_shared_with_me(&caller.user_id).await?;

    let mut devices: Vec<DeviceEntry> = owned
        .into_iter()
        .filter(|serial| caller.scopes.allows_serial(serial))
        .map(|serial| DeviceEntry { serial, shared: false })
        .collect();
    devices.extend(
        shared
            .into_iter()
            .filter(|serial| caller.scopes.allows_serial(serial))
            .map(|serial| DeviceEntry { serial, shared: true }),
    );

    Ok(axum::Json(DevicesResponse { devices }))
}
