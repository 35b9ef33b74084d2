//! `GET /nest/pro_info` — static pro-install info the firmware fetches
//! during setup. No per-device state; content is fixed per deployment.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::app_state::AppState;

pub async fn pro_info(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "pro_install": false,
        "tier_name": state.config.tier_name,
        "server_version": state.config.server_version,
    }))
}
