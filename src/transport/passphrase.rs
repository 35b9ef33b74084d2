//! `GET /nest/passphrase` — entry-code generation for the requesting
//! serial. The firmware displays this on the thermostat's screen during
//! first-contact setup so the owner can type it into the dashboard.

use axum::{extract::State, Json};
use serde::Serialize;

use crate::app_state::AppState;
use crate::device_utils::DeviceSerial;
use crate::error::{Error, Result};

#[derive(Debug, Serialize)]
pub struct PassphraseResponse {
    pub passphrase: String,
    pub expires_at: i64,
}

pub async fn passphrase(
    State(state): State<AppState>,
    DeviceSerial(serial): DeviceSerial,
) -> Result<Json<PassphraseResponse>> {
    let key = crate::pairing::generate_entry_key(
        state.store.as_ref(),
        &serial,
        state.config.entry_key_ttl_seconds,
    )
    .await
    .map_err(|err| Error::StoreUnavailable(err.to_string()))?;

    Ok(Json(PassphraseResponse {
        passphrase: key.code,
        expires_at: key.expires_at,
    }))
}
