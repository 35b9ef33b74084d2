//! `POST /nest/upload` — opaque firmware log blob. Filename is derived from
//! request headers (spec §6: "filename derived from request headers")
//! rather than trusted client input, so two concurrent uploads never clash
//! and a malicious filename can't escape the upload directory.

use axum::{body::Bytes, extract::State, http::HeaderMap, Json};
use serde::Serialize;

use crate::app_state::AppState;
use crate::device_utils::{DeviceSerial, DEVICE_IDENTITY_HEADER};
use crate::error::{Error, Result};

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub blob_id: String,
}

pub async fn upload(
    State(state): State<AppState>,
    DeviceSerial(serial): DeviceSerial,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<UploadResponse>> {
    let declared_name = headers
        .get("x-nl-log-filename")
        .and_then(|v| v.to_str().ok());
    let upload_id = format!(
        "{serial}-{}-{}",
        chrono::Utc::now().timestamp_millis(),
        uuid::Uuid::new_v4()
    );
    let blob_id = crate::blob_store::derive_blob_filename(declared_name, &upload_id);

    state
        .blobs
        .store_blob(&blob_id, body.to_vec())
        .await
        .map_err(|err| Error::Internal(err.to_string()))?;

    tracing::info!(
        serial,
        device_identity = headers
            .get(DEVICE_IDENTITY_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("unknown"),
        blob_id,
        size = body.len(),
        "received device log upload"
    );

    Ok(Json(UploadResponse { blob_id }))
}
