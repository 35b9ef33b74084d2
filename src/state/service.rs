//! Authoritative in-memory cache over `StateStore`.
//!
//! Grounded on the reference server's `DashMap`-keyed `ActorRegistry`: a
//! `DashMap` gives lock-free concurrency across different `(serial,
//! object_key)` pairs, while an `RwLock` per cached `Object` gives the
//! required per-key write serialization — readers see either the pre- or
//! post-image, never a half-merged value.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::RwLock;

use async_trait::async_trait;

use crate::integrations::{CommandSink, IntegrationManager};
use crate::model::Object;
use crate::store::StateStore;

use super::value::{merge_values, values_equal};

type DeviceObjects = DashMap<String, Arc<RwLock<Object>>>;

/// `true` iff `server_obj` is strictly newer than the client-claimed
/// revision/timestamp pair. Revision dominates timestamp.
pub fn is_server_newer(server_obj: &Object, client_rev: i64, client_ts: i64) -> bool {
    server_obj.object_revision > client_rev
        || (server_obj.object_revision == client_rev && server_obj.object_timestamp > client_ts)
}

/// Authoritative in-memory map `serial -> object_key -> Object`, lazily
/// hydrated from the `StateStore` on first access to a serial.
pub struct DeviceStateService {
    cache: DashMap<String, Arc<DeviceObjects>>,
    store: Arc<dyn StateStore>,
    integrations: Arc<IntegrationManager>,
}

impl DeviceStateService {
    pub fn new(store: Arc<dyn StateStore>, integrations: Arc<IntegrationManager>) -> Self {
        Self {
            cache: DashMap::new(),
            store,
            integrations,
        }
    }

    fn device_slot(&self, serial: &str) -> Arc<DeviceObjects> {
        self.cache
            .entry(serial.to_string())
            .or_insert_with(|| Arc::new(DashMap::new()))
            .clone()
    }

    /// The cached `Arc<RwLock<Object>>` handle for `(serial, key)`, reading
    /// through to `StateStore` on a true cache miss exactly as `get` does.
    /// `DashMap::entry`'s `or_insert_with` only runs its closure for the
    /// caller that actually wins the race to create the slot, so concurrent
    /// first-touches of the same key all end up sharing one handle —
    /// whoever calls `.write()` on it next simply queues behind the others.
    async fn hydrated_slot(&self, serial: &str, key: &str) -> Arc<RwLock<Object>> {
        let slot = self.device_slot(serial);
        if let Some(entry) = slot.get(key) {
            return entry.clone();
        }

        let hydrated = self.store.get_state(serial, key).await.unwrap_or(None);
        let placeholder = hydrated.unwrap_or_else(|| Object::new(serial, key, Value::Null));
        slot.entry(key.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(placeholder)))
            .clone()
    }

    /// Spawns the background `StateStore` persistence write and fans the
    /// change out to `IntegrationManager`. Split out of `upsert` /
    /// `read_modify_write` so both share the exact same post-write behavior.
    fn persist_and_notify(&self, object: &Object) {
        let store = self.store.clone();
        let persist_serial = object.serial.clone();
        let persist_key = object.object_key.clone();
        let persist_value = object.value.clone();
        let persist_revision = object.object_revision;
        let persist_timestamp = object.object_timestamp;
        tokio::spawn(async move {
            if let Err(err) = store
                .upsert_state(
                    &persist_serial,
                    &persist_key,
                    persist_revision,
                    persist_timestamp,
                    &persist_value,
                )
                .await
            {
                tracing::error!(
                    serial = %persist_serial,
                    key = %persist_key,
                    error = %err,
                    "background persistence write failed"
                );
            }
        });

        metrics::counter!("gateway_object_upserts_total", 1);
        self.integrations.notify(
            object.serial.clone(),
            object.object_key.clone(),
            object.object_revision,
            object.object_timestamp,
            object.value.clone(),
        );
    }

    /// Serializes an entire read-merge-compare-write cycle for `(serial,
    /// key)` under that object's write lock, so two concurrent writers can
    /// never both observe the same prior revision and both compute the same
    /// `R+1` — the lost-update race the per-key total-order guarantee (§4.B,
    /// §5) forbids. `modify` receives the prior value (by the time it runs,
    /// no other writer can be mid-write on this key) and returns the value to
    /// write; it may itself await `StateStore` reads (e.g. the derivation
    /// rules' owner lookups) without breaking the guarantee, since those are
    /// reads of *other* keys, not this one.
    async fn read_modify_write<D, Fut>(
        &self,
        serial: &str,
        key: &str,
        timestamp: i64,
        modify: D,
    ) -> (Object, bool, Value)
    where
        D: FnOnce(Value) -> Fut,
        Fut: std::future::Future<Output = Value>,
    {
        let handle = self.hydrated_slot(serial, key).await;
        let mut guard = handle.write().await;

        let prior_value = guard.value.clone();
        let prior_revision = guard.object_revision;

        let merged = modify(prior_value.clone()).await;
        let changed = !values_equal(&prior_value, &merged);
        let revision = if changed { prior_revision + 1 } else { prior_revision };
        if changed {
            metrics::counter!("gateway_revision_bumps_total", 1);
        }

        guard.object_revision = revision;
        guard.object_timestamp = timestamp;
        guard.value = merged;
        guard.updated_at = chrono::Utc::now();
        let object = guard.clone();
        drop(guard);

        self.persist_and_notify(&object);
        (object, changed, prior_value)
    }

    /// Cache-first read; on miss, reads through `StateStore` and caches the
    /// result so subsequent calls for the same `(serial, key)` don't repeat
    /// the store round trip.
    pub async fn get(&self, serial: &str, key: &str) -> crate::error::Result<Option<Object>> {
        let slot = self.device_slot(serial);
        if let Some(entry) = slot.get(key) {
            return Ok(Some(entry.read().await.clone()));
        }

        match self.store.get_state(serial, key).await {
            Ok(Some(object)) => {
                slot.insert(key.to_string(), Arc::new(RwLock::new(object.clone())));
                Ok(Some(object))
            }
            Ok(None) => Ok(None),
            Err(err) => {
                tracing::warn!(serial, key, error = %err, "store read-through failed");
                Err(crate::error::Error::StoreUnavailable(err.to_string()))
            }
        }
    }

    /// All cached objects for a device. If nothing is cached yet, loads the
    /// full device state from `StateStore` and caches it atomically (a
    /// deprecated "get all state" query in the source always returned
    /// empty; this must never silently return an empty set for a device
    /// that genuinely has state — see the behavior described below).
    pub async fn get_all_for_device(&self, serial: &str) -> crate::error::Result<Vec<Object>> {
        let slot = self.device_slot(serial);
        if !slot.is_empty() {
            let mut out = Vec::with_capacity(slot.len());
            for entry in slot.iter() {
                out.push(entry.value().read().await.clone());
            }
            return Ok(out);
        }

        let objects = self
            .store
            .get_device_state(serial)
            .await
            .map_err(|err| crate::error::Error::StoreUnavailable(err.to_string()))?;

        for object in &objects {
            slot.entry(object.object_key.clone())
                .or_insert_with(|| Arc::new(RwLock::new(object.clone())));
        }
        Ok(objects)
    }

    /// Compose, cache, asynchronously persist, and fan out a new `Object`
    /// value for `(serial, key)`.
    ///
    /// Persistence failures are logged, never surfaced to the caller — the
    /// cache is authoritative for the transport (the behavior described below propagation
    /// policy).
    pub async fn upsert(
        &self,
        serial: &str,
        key: &str,
        revision: i64,
        timestamp: i64,
        value: Value,
    ) -> Object {
        let slot = self.device_slot(serial);
        let entry = slot
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(RwLock::new(Object::new(serial, key, Value::Null)))
            })
            .clone();

        let object = {
            let mut guard = entry.write().await;
            guard.object_revision = revision;
            guard.object_timestamp = timestamp;
            guard.value = value;
            guard.updated_at = chrono::Utc::now();
            guard.clone()
        };

        self.persist_and_notify(&object);
        object
    }

    /// Merge `incoming` onto the server's current value for `(serial, key)`
    /// (creating the object if absent with an all-zero prior value), then
    /// write it back with a revision that increments iff the merged value
    /// differs from the prior value. `timestamp` is the caller-supplied
    /// wall clock (server time for device-originated writes). Returns
    /// `(object, changed)`.
    ///
    /// The whole read-merge-compare-write cycle runs under `(serial, key)`'s
    /// write lock (`read_modify_write`), so two concurrent callers merging
    /// onto the same key can never both read the same prior revision.
    pub async fn merge_and_upsert(
        &self,
        serial: &str,
        key: &str,
        incoming: &Value,
        timestamp: i64,
    ) -> (Object, bool) {
        let incoming = incoming.clone();
        let (object, changed, _prior_value) = self
            .read_modify_write(serial, key, timestamp, move |prior_value| async move {
                merge_values(&prior_value, &incoming)
            })
            .await;
        (object, changed)
    }

    /// Like [`Self::merge_and_upsert`], but also applies the device-update
    /// derivation rules (§4.G: fan-timer preservation, structure-id
    /// backfill, device-identity annotation) post-merge, before the
    /// revision comparison — all still inside the same per-key write-lock
    /// scope, so the derivation reads/writes participate in the same total
    /// order as the merge itself. Returns `(object, changed, prior_value)`;
    /// the prior value is handed back because callers (weather/away
    /// propagation) need to diff it against the new value themselves.
    pub async fn merge_and_upsert_device_update(
        &self,
        serial: &str,
        key: &str,
        incoming: Value,
        device_identity: Option<&str>,
        timestamp: i64,
    ) -> (Object, bool, Value) {
        let is_device_object = key.starts_with("device.");
        let store = self.store.clone();
        let serial_owned = serial.to_string();
        let identity_owned = device_identity.map(str::to_string);

        self.read_modify_write(serial, key, timestamp, move |prior_value| async move {
            let mut merged = merge_values(&prior_value, &incoming);
            if is_device_object {
                merged = crate::derive::preserve_fan_timer_fields(merged, &prior_value);
                merged =
                    crate::derive::backfill_structure_id(store.as_ref(), &serial_owned, merged)
                        .await;
                merged = crate::derive::annotate_device_identity(merged, identity_owned.as_deref());
            }
            merged
        })
        .await
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }
}

/// Lets a loaded `Integration` (e.g. the MQTT broker publisher) translate an
/// inbound command back into device state, and checks ownership/sharing
/// before accepting one.
#[async_trait]
impl CommandSink for DeviceStateService {
    async fn apply_command(&self, serial: &str, key: &str, value: Value) -> anyhow::Result<()> {
        let object_key = format!("{key}.{serial}");
        let timestamp = chrono::Utc::now().timestamp_millis();
        self.merge_and_upsert(serial, &object_key, &value, timestamp).await;
        Ok(())
    }

    async fn is_authorized(&self, user_id: &str, serial: &str) -> bool {
        match self.store.get_device_owner(serial).await {
            Ok(Some(owner)) if owner.user_id == user_id => return true,
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(serial, user_id, error = %err, "ownership check failed");
                return false;
            }
        }
        self.store
            .get_shared_with_me(user_id)
            .await
            .map(|shared| shared.iter().any(|s| s == serial))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::sqlite_store::SqliteStore;

    async fn test_service() -> DeviceStateService {
        let store = SqliteStore::connect("sqlite::memory:", 5).await.unwrap();
        let integrations = Arc::new(IntegrationManager::new_inert());
        DeviceStateService::new(Arc::new(store), integrations)
    }

    #[tokio::test]
    async fn upsert_then_get_reads_from_cache() {
        let svc = test_service().await;
        svc.upsert("ABC", "device.ABC", 1, 1000, serde_json::json!({"away": true}))
            .await;
        let fetched = svc.get("ABC", "device.ABC").await.unwrap().unwrap();
        assert_eq!(fetched.object_revision, 1);
        assert_eq!(fetched.value, serde_json::json!({"away": true}));
    }

    #[tokio::test]
    async fn merge_and_upsert_increments_revision_only_on_change() {
        let svc = test_service().await;
        let (obj1, changed1) = svc
            .merge_and_upsert("ABC", "shared.ABC", &serde_json::json!({"t": 20}), 1000)
            .await;
        assert!(changed1);
        assert_eq!(obj1.object_revision, 1);

        let (obj2, changed2) = svc
            .merge_and_upsert("ABC", "shared.ABC", &serde_json::json!({"t": 20}), 2000)
            .await;
        assert!(!changed2, "identical merge must not bump revision");
        assert_eq!(obj2.object_revision, 1);

        let (obj3, changed3) = svc
            .merge_and_upsert("ABC", "shared.ABC", &serde_json::json!({"t": 21}), 3000)
            .await;
        assert!(changed3);
        assert_eq!(obj3.object_revision, 2);
    }

    #[tokio::test]
    async fn merge_and_upsert_preserves_fields_incoming_omits() {
        let svc = test_service().await;
        svc.merge_and_upsert(
            "ABC",
            "device.ABC",
            &serde_json::json!({"away": false, "fan_timer_duration": 900}),
            1000,
        )
        .await;

        let (merged, _) = svc
            .merge_and_upsert("ABC", "device.ABC", &serde_json::json!({"away": true}), 2000)
            .await;
        assert_eq!(
            merged.value,
            serde_json::json!({"away": true, "fan_timer_duration": 900})
        );
    }

    #[tokio::test]
    async fn concurrent_merges_on_the_same_key_never_lose_an_update() {
        let svc = Arc::new(test_service().await);
        svc.upsert("ABC", "shared.ABC", 1, 1000, serde_json::json!({"count": 0}))
            .await;

        let mut tasks = Vec::new();
        for i in 0..8 {
            let svc = svc.clone();
            tasks.push(tokio::spawn(async move {
                svc.merge_and_upsert("ABC", "shared.ABC", &serde_json::json!({"writer": i}), 2000 + i)
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let final_object = svc.get("ABC", "shared.ABC").await.unwrap().unwrap();
        assert_eq!(
            final_object.object_revision, 9,
            "every distinct writer's merge must bump the revision exactly once — a lost update would under-count"
        );
    }

    #[test]
    fn is_server_newer_favors_revision_over_timestamp() {
        let obj = Object {
            serial: "ABC".into(),
            object_key: "shared.ABC".into(),
            object_revision: 5,
            object_timestamp: 100,
            value: serde_json::json!({}),
            updated_at: chrono::Utc::now(),
        };
        assert!(is_server_newer(&obj, 4, 999));
        assert!(!is_server_newer(&obj, 5, 999));
        assert!(is_server_newer(&obj, 5, 50));
        assert!(!is_server_newer(&obj, 6, 0));
    }
}
