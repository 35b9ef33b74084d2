//! `GET /nest/transport/device/{serial}` — lets a reconnecting device
//! discover what state the server already knows about. No `value` fields:
//! just enough for the firmware to decide which objects to probe in its
//! next subscribe call.

use axum::{extract::{Path, State}, Json};
use serde::Serialize;

use crate::app_state::AppState;
use crate::error::Result;
use crate::model::ObjectSummary;

#[derive(Debug, Serialize)]
pub struct ListResponse {
    pub objects: Vec<ObjectSummary>,
}

pub async fn list_device_objects(
    State(state): State<AppState>,
    Path(serial): Path<String>,
) -> Result<Json<ListResponse>> {
    crate::pairing::ensure_device_alert_dialog(state.store.as_ref(), &serial)
        .await
        .map_err(|err| crate::error::Error::StoreUnavailable(err.to_string()))?;

    let objects = state.state.get_all_for_device(&serial).await?;
    Ok(Json(ListResponse {
        objects: objects.iter().map(crate::model::Object::as_summary).collect(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_response_omits_value_field() {
        let response = ListResponse {
            objects: vec![ObjectSummary {
                object_key: "shared.ABC".into(),
                object_revision: 1,
                object_timestamp: 1000,
            }],
        };
        let value = serde_json::to_value(&response).unwrap();
        assert!(value["objects"][0].get("value").is_none());
    }
}
