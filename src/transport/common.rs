//! Shared merge/derive write pipeline used by both `subscribe.rs` and
//! `put.rs`: deep-merge, fan-timer preservation, structure-id backfill,
//! then the away/weather derived-state fan-out.
//!
//! Kept as free functions over `AppState` rather than a method on
//! `DeviceStateService` because the away/weather propagation rules (§4.G)
//! need `StateStore` reads `DeviceStateService` itself has no reason to know
//! about — they belong to the transport layer, not the cache. The merge,
//! fan-timer preservation, and structure-id backfill steps do live on
//! `DeviceStateService` (`merge_and_upsert_device_update`), because they
//! must run inside the same per-key write-lock scope as the revision
//! comparison to avoid a lost-update race between concurrent writers.

use serde_json::Value;

use crate::app_state::AppState;
use crate::model::Object;

/// Deep-merges `incoming` onto the server's current value for
/// `(serial, object_key)`, applies fan-timer preservation and structure-id
/// backfill when the key is a `device.` object, bumps the revision iff the
/// merged value differs from the prior one, and upserts — all atomically
/// under `(serial, object_key)`'s write lock. Also triggers the
/// away-aggregate recompute and postal-code-driven weather propagation
/// when a `device.` object actually changed.
pub async fn apply_update(
    state: &AppState,
    serial: &str,
    object_key: &str,
    incoming: serde_json::Value,
    device_identity: Option<&str>,
    timestamp: i64,
) -> Object {
    let is_device_object = object_key.starts_with("device.");

    let (object, changed, prior_value) = state
        .state
        .merge_and_upsert_device_update(serial, object_key, incoming, device_identity, timestamp)
        .await;

    if changed && is_device_object {
        recompute_away_for_owner(state, serial).await;
        propagate_weather_on_postal_change(state, serial, &prior_value, &object.value).await;
    }

    object
}

/// Recomputes and writes the `user.{id}` away aggregate for whoever owns
/// `serial`, if anyone does (spec §4.G "Away aggregation"). Goes through
/// `merge_and_upsert` rather than a manual get-then-upsert so this write
/// participates in the same per-key write-lock serialization as every other
/// writer of `user.{id}` — two devices owned by the same user changing
/// `away` concurrently must not race each other's aggregate write.
async fn recompute_away_for_owner(state: &AppState, serial: &str) {
    let Ok(Some(owner)) = state.store.get_device_owner(serial).await else {
        return;
    };
    let Some(aggregate) = crate::derive::recompute_user_away(state.store.as_ref(), &owner.user_id).await else {
        return;
    };

    let user_key = format!("user.{}", owner.user_id);
    let now_ms = chrono::Utc::now().timestamp_millis();
    state
        .state
        .merge_and_upsert(&owner.user_id, &user_key, &aggregate, now_ms)
        .await;
}

/// If this update changed `postal_code`, push the owner's cached weather for
/// the new postal code into their `user.{id}` object (spec §4.G "Weather
/// propagation"). `StateStore` has no "list all users" primitive, so this
/// scoped single-owner push is the trigger for both halves of §4.G's
/// wording ("a device reports a new postal code" directly, and "an upstream
/// fetch succeeds" transitively, since the fetch below is the same call
/// that would otherwise populate the cache) — see DESIGN.md.
async fn propagate_weather_on_postal_change(state: &AppState, serial: &str, prior_value: &Value, merged_value: &Value) {
    let new_postal = merged_value.get("postal_code").and_then(Value::as_str);
    let Some(postal) = new_postal else { return };
    if prior_value.get("postal_code").and_then(Value::as_str) == Some(postal) {
        return;
    }

    let Ok(Some(owner)) = state.store.get_device_owner(serial).await else {
        return;
    };
    let country = state
        .store
        .get_state(&owner.user_id, &format!("structure.{}", owner.user_id))
        .await
        .ok()
        .flatten()
        .and_then(|s| s.value.get("country_code").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| "US".to_string());

    // `requesting_serial: None` — this call site already propagates
    // explicitly below; wiring `get`'s own propagation here too would push
    // the same payload into the owner's `user.{id}` object twice.
    if let Some(payload) = state.weather.get(state.store.as_ref(), postal, &country, None).await {
        state
            .weather
            .propagate(state.store.as_ref(), &[owner.user_id], postal, &payload)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrations::IntegrationManager;
    use crate::state::DeviceStateService;
    use crate::store::sqlite_store::SqliteStore;
    use crate::subscription::SubscriptionManager;
    use crate::weather::WeatherCache;
    use std::sync::Arc;
    use std::time::Duration;

    async fn test_state() -> AppState {
        let store: Arc<dyn crate::store::StateStore> =
            Arc::new(SqliteStore::connect("sqlite::memory:", 5).await.unwrap());
        let integrations = Arc::new(IntegrationManager::new(store.clone()));
        let state = Arc::new(DeviceStateService::new(store.clone(), integrations.clone()));
        AppState(Arc::new(crate::app_state::AppServices {
            state,
            subscriptions: Arc::new(SubscriptionManager::new(4, Duration::from_secs(300))),
            store,
            weather: WeatherCache::new(Duration::from_secs(1800), "http://127.0.0.1:1".into()),
            integrations,
            blobs: crate::blob_store::BlobStore::new(crate::blob_store::BlobStoreConfig {
                base_dir: std::env::temp_dir().join(format!("gw-test-{}", uuid::Uuid::new_v4())),
            })
            .await
            .unwrap(),
            config: crate::config::GatewayConfig::from_env(),
        }))
    }

    #[tokio::test]
    async fn device_update_recomputes_owner_away_aggregate() {
        let state = test_state().await;
        state.store.set_device_owner("ABC", "user_xyz").await.unwrap();

        apply_update(
            &state,
            "ABC",
            "device.ABC",
            serde_json::json!({"away": true}),
            None,
            1000,
        )
        .await;

        let user = state.state.get("user_xyz", "user.user_xyz").await.unwrap();
        assert!(user.is_some(), "away recompute should have written user.user_xyz");
        assert_eq!(user.unwrap().value["away"], serde_json::json!(true));
    }

    #[tokio::test]
    async fn fan_timer_fields_survive_through_apply_update() {
        let state = test_state().await;
        apply_update(
            &state,
            "ABC",
            "device.ABC",
            serde_json::json!({"fan_mode": "auto", "fan_timer_duration": 900}),
            None,
            1000,
        )
        .await;

        let object = apply_update(
            &state,
            "ABC",
            "device.ABC",
            serde_json::json!({"away": true}),
            None,
            2000,
        )
        .await;

        assert_eq!(object.value["fan_mode"], serde_json::json!("auto"));
        assert_eq!(object.value["fan_timer_duration"], serde_json::json!(900));
    }
}
