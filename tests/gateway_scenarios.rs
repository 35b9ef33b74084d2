//! End-to-end scenario tests (S1-S6) driving the full axum router over an
//! in-memory `SqliteStore`, mirroring `main.rs`'s router assembly without
//! binding a socket. One `#[tokio::test]` per scenario, matching the
//! reference server's black-box-over-`tower::ServiceExt::oneshot` style for
//! its own route-level tests.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::routing::{get, post};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use thermo_gateway::app_state::{AppServices, AppState};
use thermo_gateway::config::GatewayConfig;
use thermo_gateway::integrations::IntegrationManager;
use thermo_gateway::state::DeviceStateService;
use thermo_gateway::store::sqlite_store::SqliteStore;
use thermo_gateway::store::StateStore;
use thermo_gateway::subscription::SubscriptionManager;
use thermo_gateway::weather::WeatherCache;
use thermo_gateway::{control, health, transport};

const DEVICE_IDENTITY_HEADER: &str = "x-nl-device-id";
const TEST_API_KEY: &str = "test-api-key-for-scenarios";

async fn test_app() -> (Router, AppState) {
    let store: Arc<dyn StateStore> =
        Arc::new(SqliteStore::connect("sqlite::memory:", 5).await.unwrap());
    let integrations = Arc::new(IntegrationManager::new(store.clone()));
    let device_state = Arc::new(DeviceStateService::new(store.clone(), integrations.clone()));

    let services = AppServices {
        state: device_state,
        subscriptions: Arc::new(SubscriptionManager::new(4, Duration::from_secs(300))),
        store,
        weather: WeatherCache::new(Duration::from_secs(1800), "http://127.0.0.1:1".into()),
        integrations,
        blobs: thermo_gateway::blob_store::BlobStore::new(thermo_gateway::blob_store::BlobStoreConfig {
            base_dir: std::env::temp_dir().join(format!("gw-scenario-{}", uuid::Uuid::new_v4())),
        })
        .await
        .unwrap(),
        config: GatewayConfig::from_env(),
    };
    let state = AppState(Arc::new(services));

    let router = Router::new()
        .route("/nest/entry", get(transport::entry))
        .route("/nest/passphrase", get(transport::passphrase))
        .route(
            "/nest/transport/device/{serial}",
            get(transport::list_device_objects),
        )
        .route("/nest/transport", post(transport::subscribe))
        .route("/nest/transport/put", post(transport::put))
        .route("/command", post(control::command))
        .route("/api/claim", post(control::claim))
        .route("/status", get(control::status))
        .route("/health", get(health::health))
        .with_state(state.clone());

    (router, state)
}

async fn seed_api_key(state: &AppState, user_id: &str) {
    let key = thermo_gateway::model::ApiKey {
        key_hash: thermo_gateway::crypto::hash_api_key(TEST_API_KEY),
        key_preview: thermo_gateway::crypto::key_preview(TEST_API_KEY),
        user_id: user_id.to_string(),
        name: "scenario test key".into(),
        scopes: thermo_gateway::model::ApiKeyScopes::default(),
        created_at: chrono::Utc::now(),
        last_used_at: None,
    };
    state.store.create_api_key(&key).await.unwrap();
}

fn device_request(method: &str, uri: &str, serial: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(DEVICE_IDENTITY_HEADER, format!("{serial}|rev4|us"))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn control_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {TEST_API_KEY}"))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn s1_first_contact() {
    let (router, state) = test_app().await;

    let entry = router
        .clone()
        .oneshot(Request::get("/nest/entry").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(entry.status(), StatusCode::OK);
    let entry_doc = json_body(entry).await;
    assert!(entry_doc["transport_url"].as_str().unwrap().ends_with("/nest/transport"));
    assert!(entry_doc["passphrase_url"].as_str().unwrap().ends_with("/nest/passphrase"));

    let list = router
        .clone()
        .oneshot(
            Request::get("/nest/transport/device/ABC")
                .header(DEVICE_IDENTITY_HEADER, "ABC|rev4|us")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(list.status(), StatusCode::OK);
    let list_body = json_body(list).await;
    assert_eq!(list_body["objects"], json!([]));
    assert!(state
        .store
        .get_state("ABC", "device_alert_dialog.ABC")
        .await
        .unwrap()
        .is_some());

    let passphrase = router
        .clone()
        .oneshot(
            Request::get("/nest/passphrase")
                .header(DEVICE_IDENTITY_HEADER, "ABC|rev4|us")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(passphrase.status(), StatusCode::OK);
    let passphrase_body = json_body(passphrase).await;
    let code = passphrase_body["passphrase"].as_str().unwrap();
    assert!(thermo_gateway::model::EntryKey::matches_format(code), "bad code: {code}");
}

#[tokio::test]
async fn s2_claim_and_materialize() {
    let (router, state) = test_app().await;
    seed_api_key(&state, "user_xyz").await;

    let key = thermo_gateway::pairing::generate_entry_key(state.store.as_ref(), "ABC", 3600)
        .await
        .unwrap();

    let claim = router
        .clone()
        .oneshot(control_request("POST", "/api/claim", json!({ "code": key.code })))
        .await
        .unwrap();
    assert_eq!(claim.status(), StatusCode::OK);
    let claim_body = json_body(claim).await;
    assert_eq!(claim_body["serial"], json!("ABC"));

    let device = state.store.get_state("ABC", "device.ABC").await.unwrap().unwrap();
    assert_eq!(device.value["structure_id"], json!("xyz"));
    assert!(state
        .store
        .get_state("user_xyz", "structure.user_xyz")
        .await
        .unwrap()
        .is_some());
    assert!(state.store.get_state("ABC", "link.ABC").await.unwrap().is_some());
    assert!(state
        .store
        .get_state("user_xyz", "user.user_xyz")
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn s3_subscribe_and_wake() {
    let (router, state) = test_app().await;
    seed_api_key(&state, "user_xyz").await;
    state.store.set_device_owner("ABC", "user_xyz").await.unwrap();

    // Seed shared.ABC at revision 5 so the probe below is actually stale by
    // one after the command below bumps it to 6.
    state
        .state
        .upsert("ABC", "shared.ABC", 5, 1000, json!({"target_temperature": 20.0}))
        .await;

    let subscribe_request = device_request(
        "POST",
        "/nest/transport",
        "ABC",
        json!({
            "chunked": true,
            "objects": [{"object_key": "shared.ABC", "object_revision": 5, "object_timestamp": 1000}],
        }),
    );

    let router_for_subscribe = router.clone();
    let subscribe_handle =
        tokio::spawn(async move { router_for_subscribe.oneshot(subscribe_request).await.unwrap() });

    // Give the subscribe handler a moment to park before the wake arrives.
    tokio::time::sleep(Duration::from_millis(20)).await;

    let command = router
        .clone()
        .oneshot(control_request(
            "POST",
            "/command",
            json!({"serial": "ABC", "action": "temp", "mode": "heat", "value": 22}),
        ))
        .await
        .unwrap();
    assert_eq!(command.status(), StatusCode::OK);

    let response = subscribe_handle.await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    let objects = body["objects"].as_array().unwrap();
    assert_eq!(objects.len(), 1);
    assert_eq!(objects[0]["object_key"], json!("shared.ABC"));
    assert_eq!(objects[0]["object_revision"], json!(6));
}

#[tokio::test]
async fn s4_partial_merge_preserves_fan_timer_and_recomputes_away() {
    let (router, state) = test_app().await;
    state.store.set_device_owner("ABC", "user_xyz").await.unwrap();
    state
        .state
        .upsert(
            "ABC",
            "device.ABC",
            1,
            1000,
            json!({"away": false, "fan_timer_duration": 900, "postal_code": "94107"}),
        )
        .await;

    let response = router
        .clone()
        .oneshot(device_request(
            "POST",
            "/nest/transport/put",
            "ABC",
            json!({"objects": [{"object_key": "device.ABC", "value": {"away": true}}]}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    let merged = &body["objects"][0]["value"];
    assert_eq!(merged["away"], json!(true));
    assert_eq!(merged["fan_timer_duration"], json!(900));
    assert_eq!(merged["postal_code"], json!("94107"));
    assert_eq!(body["objects"][0]["object_revision"], json!(2));

    let user = state.state.get("user_xyz", "user.user_xyz").await.unwrap().unwrap();
    assert_eq!(user.value["away"], json!(true));
}

#[tokio::test]
async fn s5_dashboard_race_produces_two_revisions_never_a_blend() {
    let (router, state) = test_app().await;
    seed_api_key(&state, "user_xyz").await;
    state
        .state
        .upsert("ABC", "shared.ABC", 1, 1000, json!({"target_temperature": 20.0}))
        .await;

    // Spawned onto separate tokio tasks (not `tokio::join!` on the same
    // task) so the two writers can genuinely interleave their read-modify-
    // write — this is what actually exercises the per-key serialization
    // this scenario is meant to test.
    let router_a = router.clone();
    let router_b = router.clone();
    let first = tokio::spawn(router_a.oneshot(control_request(
        "POST",
        "/command",
        json!({"serial": "ABC", "action": "temp", "mode": "heat", "value": 21}),
    )));
    let second = tokio::spawn(router_b.oneshot(control_request(
        "POST",
        "/command",
        json!({"serial": "ABC", "action": "temp", "mode": "heat", "value": 25}),
    )));

    let (first_response, second_response) = tokio::join!(first, second);
    assert_eq!(first_response.unwrap().unwrap().status(), StatusCode::OK);
    assert_eq!(second_response.unwrap().unwrap().status(), StatusCode::OK);

    let final_object = state.state.get("ABC", "shared.ABC").await.unwrap().unwrap();
    assert_eq!(final_object.object_revision, 3);
    let final_temp = final_object.value["target_temperature"].as_f64().unwrap();
    assert!(final_temp == 21.0 || final_temp == 25.0, "value must not be a blend: {final_temp}");
}

#[tokio::test]
async fn s6_integration_fan_out_reconciles_on_enable_and_disable() {
    let (_router, state) = test_app().await;

    let config = thermo_gateway::model::IntegrationConfig {
        user_id: "user_xyz".into(),
        r#type: thermo_gateway::integrations::broker::BROKER_TYPE.into(),
        enabled: true,
        config: json!({"broker_url": "127.0.0.1", "broker_port": 18883, "topic_prefix": "nest"}),
        updated_at: chrono::Utc::now(),
    };
    state.store.upsert_integration_config(&config).await.unwrap();

    state.integrations.reconcile().await;
    assert_eq!(state.integrations.loaded_count(), 1);

    let mut disabled = config.clone();
    disabled.enabled = false;
    state.store.upsert_integration_config(&disabled).await.unwrap();

    state.integrations.reconcile().await;
    assert_eq!(state.integrations.loaded_count(), 0);
}
