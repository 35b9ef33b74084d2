//! `GET /nest/ping` — bare liveness check for firmware that polls before
//! attempting a subscribe. Deliberately does not touch the store: a device
//! should be able to tell the gateway process is up even if the store is
//! momentarily unavailable.

use axum::Json;
use serde_json::{json, Value};

pub async fn ping() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
