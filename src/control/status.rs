//! `GET /status?serial=…` — read-only projection of the cache for a single
//! device, scoped to whatever the caller's API key is authorized to see
//! (spec §4.H).

use axum::extract::{Query, State};
use serde::{Deserialize, Serialize};

use crate::app_state::AppState;
use crate::control::ApiKeyAuth;
use crate::error::{Error, Result};
use crate::model::ObjectWire;

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    pub serial: String,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub serial: String,
    pub objects: Vec<ObjectWire>,
}

pub async fn status(
    State(state): State<AppState>,
    ApiKeyAuth(caller): ApiKeyAuth,
    Query(params): Query<StatusQuery>,
) -> Result<axum::Json<StatusResponse>> {
    if !caller.scopes.allows_serial(&params.serial) {
        return Err(Error::Unauthorized(format!(
            "api key is not scoped to serial {}",
            params.serial
        )));
    }

    let objects = state.state.get_all_for_device(&params.serial).await?;
    Ok(axum::Json(StatusResponse {
        serial: params.serial,
        objects: objects.iter().map(crate::model::Object::as_wire).collect(),
    }))
}
