//! `POST /nest/transport/put` — device push. Each object is merged into
//! server state and every subscriber parked on the serial is woken in one
//! batch once all writes complete (spec §4.D "Put").

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::app_state::AppState;
use crate::device_utils::{DeviceSerial, DEVICE_IDENTITY_HEADER};
use crate::error::Result;
use crate::model::ObjectWire;

use super::common::apply_update;

#[derive(Debug, Deserialize)]
pub struct PutObject {
    pub object_key: String,
    pub value: Value,
}

#[derive(Debug, Deserialize)]
pub struct PutRequest {
    pub objects: Vec<PutObject>,
}

#[derive(Debug, Serialize)]
pub struct PutResponse {
    pub objects: Vec<ObjectWire>,
}

pub async fn put(
    State(state): State<AppState>,
    DeviceSerial(serial): DeviceSerial,
    headers: axum::http::HeaderMap,
    Json(body): Json<PutRequest>,
) -> Result<Json<PutResponse>> {
    let device_identity = headers
        .get(DEVICE_IDENTITY_HEADER)
        .and_then(|v| v.to_str().ok());
    let now_ms = chrono::Utc::now().timestamp_millis();

    let mut written = Vec::with_capacity(body.objects.len());
    for object in body.objects {
        let result = apply_update(
            &state,
            &serial,
            &object.object_key,
            object.value,
            device_identity,
            now_ms,
        )
        .await;
        written.push(result);
    }

    state.subscriptions.notify_all(&serial, &written).await;

    Ok(Json(PutResponse {
        objects: written.iter().map(|object| object.as_wire()).collect(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app_state::AppServices;
    use crate::integrations::IntegrationManager;
    use crate::state::DeviceStateService;
    use crate::store::sqlite_store::SqliteStore;
    use crate::subscription::SubscriptionManager;
    use crate::weather::WeatherCache;
    use axum::extract::State;
    use std::sync::Arc;
    use std::time::Duration;

    async fn test_state() -> AppState {
        let store: Arc<dyn crate::store::StateStore> =
            Arc::new(SqliteStore::connect("sqlite::memory:", 5).await.unwrap());
        let integrations = Arc::new(IntegrationManager::new(store.clone()));
        let service = Arc::new(DeviceStateService::new(store.clone(), integrations.clone()));
        AppState(Arc::new(AppServices {
            state: service,
            subscriptions: Arc::new(SubscriptionManager::new(4, Duration::from_secs(300))),
            store,
            weather: WeatherCache::new(Duration::from_secs(1800), "http://127.0.0.1:1".into()),
            integrations,
            blobs: crate::blob_store::BlobStore::new(crate::blob_store::BlobStoreConfig {
                base_dir: std::env::temp_dir().join(format!("gw-put-test-{}", uuid::Uuid::new_v4())),
            })
            .await
            .unwrap(),
            config: crate::config::GatewayConfig::from_env(),
        }))
    }

    #[tokio::test]
    async fn put_wakes_parked_subscribers_in_one_batch() {
        let state = test_state().await;

        let (tx, rx) = tokio::sync::oneshot::channel();
        state
            .subscriptions
            .add(crate::model::Subscription {
                session: None,
                serial: "ABC".into(),
                interests: vec![crate::model::ProbedObject {
                    object_key: "shared.ABC".into(),
                    object_revision: 0,
                    object_timestamp: 0,
                    value: None,
                }],
                connected_at: tokio::time::Instant::now(),
                deadline: state.subscriptions.new_deadline(),
                responder: Some(tx),
            })
            .await;

        let headers = axum::http::HeaderMap::new();
        let body = PutRequest {
            objects: vec![PutObject {
                object_key: "shared.ABC".into(),
                value: serde_json::json!({"t": 21}),
            }],
        };

        put(
            State(state.clone()),
            crate::device_utils::DeviceSerial("ABC".into()),
            headers,
            Json(body),
        )
        .await
        .unwrap();

        let outcome = rx.await.unwrap();
        assert_eq!(outcome.objects[0].object_key, "shared.ABC");
        assert_eq!(outcome.objects[0].object_revision, 1);
    }
}
