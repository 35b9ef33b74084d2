//! Pairing & ownership: entry-code generation/redemption and the
//! first-contact materialization of structure/link/user objects.
//!
//! Grounded on the reference server's multi-statement transactional helpers
//! in `db.rs` (e.g. conversation + membership creation sequences) — each
//! materialization step here is similarly idempotent, so a retried claim
//! never double-creates a record.

use rand::Rng;
use serde_json::json;

use crate::derive::strip_user_id_prefix;
use crate::model::EntryKey;
use crate::store::{StateStore, StoreError, StoreResult};

#[derive(Debug)]
pub enum ClaimError {
    NotFound,
    AlreadyClaimedByOther,
    Expired,
    AlreadyLinked,
    Store(StoreError),
}

impl std::fmt::Display for ClaimError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClaimError::NotFound => write!(f, "entry key not found"),
            ClaimError::AlreadyClaimedByOther => write!(f, "entry key already claimed"),
            ClaimError::Expired => write!(f, "entry key expired"),
            ClaimError::AlreadyLinked => write!(f, "device already linked to another user"),
            ClaimError::Store(err) => write!(f, "{err}"),
        }
    }
}

impl From<StoreError> for ClaimError {
    fn from(err: StoreError) -> Self {
        ClaimError::Store(err)
    }
}

/// A fresh seven-character code: 3 digits + 4 uppercase letters, ≈17.5M
/// combinations (the behavior described below/§4.F).
pub fn random_entry_code() -> String {
    let mut rng = rand::thread_rng();
    let digits: String = (0..3).map(|_| rng.gen_range(0..10).to_string()).collect();
    let letters: String = (0..4)
        .map(|_| (b'A' + rng.gen_range(0..26)) as char)
        .collect();
    format!("{digits}{letters}")
}

pub async fn generate_entry_key(
    store: &dyn StateStore,
    serial: &str,
    ttl_seconds: i64,
) -> StoreResult<EntryKey> {
    store.generate_entry_key(serial, ttl_seconds).await
}

/// Redeem `code` for `user_id`. Rejects an unknown, expired, or
/// other-user-claimed code. On success, materializes every side effect
/// listed in the behavior described below, each written so a retried claim (same code, same
/// user) is a no-op rather than a double-create.
pub async fn claim_entry_key(
    store: &dyn StateStore,
    code: &str,
    user_id: &str,
) -> Result<EntryKey, ClaimError> {
    let existing = store.get_entry_key(code).await?.ok_or(ClaimError::NotFound)?;
    let now_ms = chrono::Utc::now().timestamp_millis();
    if existing.is_expired(now_ms) {
        return Err(ClaimError::Expired);
    }
    if let Some(claimed_by) = &existing.claimed_by {
        if claimed_by != user_id {
            return Err(ClaimError::AlreadyClaimedByOther);
        }
    }

    let claimed = store
        .claim_entry_key_row(code, user_id, now_ms)
        .await?
        .ok_or(ClaimError::NotFound)?;
    if claimed.claimed_by.as_deref() != Some(user_id) {
        return Err(ClaimError::AlreadyClaimedByOther);
    }

    let serial = claimed.serial.clone();

    if let Some(owner) = store.get_device_owner(&serial).await? {
        if owner.user_id != user_id {
            return Err(ClaimError::AlreadyLinked);
        }
    } else {
        store.set_device_owner(&serial, user_id).await?;
    }

    materialize_pairing(store, &serial, user_id).await?;

    Ok(claimed)
}

/// Ensures `device_alert_dialog.{serial}`, `device.{serial}`,
/// `structure.{user_id}`, `link.{serial}`, and `user.{user_id}` all exist,
/// in that order, each step idempotent under retry.
async fn materialize_pairing(
    store: &dyn StateStore,
    serial: &str,
    user_id: &str,
) -> StoreResult<()> {
    let now_ms = chrono::Utc::now().timestamp_millis();
    let structure_short_id = strip_user_id_prefix(user_id);

    ensure_device_alert_dialog_with(store, serial, now_ms).await?;

    let device_key = format!("device.{serial}");
    if store.get_state(serial, &device_key).await?.is_none() {
        store
            .upsert_state(
                serial,
                &device_key,
                1,
                now_ms,
                &json!({ "structure_id": structure_short_id }),
            )
            .await?;
    }

    let structure_key = format!("structure.{user_id}");
    if store.get_state(user_id, &structure_key).await?.is_none() {
        store
            .upsert_state(
                user_id,
                &structure_key,
                1,
                now_ms,
                &json!({
                    "device": serial,
                    "time_zone": "America/Los_Angeles",
                    "country_code": "US",
                }),
            )
            .await?;
    }

    let link_key = format!("link.{serial}");
    if store.get_state(serial, &link_key).await?.is_none() {
        store
            .upsert_state(serial, &link_key, 1, now_ms, &json!({ "structure": user_id }))
            .await?;
    }

    let user_key = format!("user.{user_id}");
    match store.get_state(user_id, &user_key).await? {
        None => {
            store
                .upsert_state(
                    user_id,
                    &user_key,
                    1,
                    now_ms,
                    &json!({
                        "structures": [user_id],
                        "membership": [user_id],
                        "away": false,
                        "onboarded": true,
                    }),
                )
                .await?;
        }
        Some(existing) => {
            let structures_has = existing
                .value
                .get("structures")
                .and_then(|v| v.as_array())
                .map(|arr| arr.iter().any(|s| s.as_str() == Some(user_id)))
                .unwrap_or(false);
            if !structures_has {
                let mut structures: Vec<serde_json::Value> = existing
                    .value
                    .get("structures")
                    .and_then(|v| v.as_array())
                    .cloned()
                    .unwrap_or_default();
                structures.push(json!(user_id));
                let mut membership: Vec<serde_json::Value> = existing
                    .value
                    .get("membership")
                    .and_then(|v| v.as_array())
                    .cloned()
                    .unwrap_or_default();
                if !membership.iter().any(|m| m.as_str() == Some(user_id)) {
                    membership.push(json!(user_id));
                }
                let merged = crate::state::value::merge_values(
                    &existing.value,
                    &json!({ "structures": structures, "membership": membership }),
                );
                store
                    .upsert_state(user_id, &user_key, existing.object_revision + 1, now_ms, &merged)
                    .await?;
            }
        }
    }

    Ok(())
}

/// Creates `device_alert_dialog.{serial}` with the pairing-confirm payload
/// if it doesn't already exist. Also called directly by the transport
/// `list` handler on every reconnect.
pub async fn ensure_device_alert_dialog(store: &dyn StateStore, serial: &str) -> StoreResult<()> {
    let now_ms = chrono::Utc::now().timestamp_millis();
    ensure_device_alert_dialog_with(store, serial, now_ms).await
}

async fn ensure_device_alert_dialog_with(
    store: &dyn StateStore,
    serial: &str,
    now_ms: i64,
) -> StoreResult<()> {
    let key = format!("device_alert_dialog.{serial}");
    if store.get_state(serial, &key).await?.is_some() {
        return Ok(());
    }
    store
        .upsert_state(serial, &key, 1, now_ms, &json!({ "dialog_type": "pairing_confirm" }))
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::sqlite_store::SqliteStore;

    #[test]
    fn random_entry_code_matches_the_wire_format() {
        for _ in 0..100 {
            let code = random_entry_code();
            assert!(EntryKey::matches_format(&code), "bad code: {code}");
        }
    }

    #[tokio::test]
    async fn claim_materializes_every_side_effect() {
        let store = SqliteStore::connect("sqlite::memory:", 1).await.unwrap();
        let key = generate_entry_key(&store, "ABC", 3600).await.unwrap();

        let claimed = claim_entry_key(&store, &key.code, "user_xyz").await.unwrap();
        assert_eq!(claimed.claimed_by.as_deref(), Some("user_xyz"));

        assert!(store.get_state("ABC", "device.ABC").await.unwrap().is_some());
        assert!(store
            .get_state("user_xyz", "structure.user_xyz")
            .await
            .unwrap()
            .is_some());
        assert!(store.get_state("ABC", "link.ABC").await.unwrap().is_some());
        assert!(store
            .get_state("user_xyz", "user.user_xyz")
            .await
            .unwrap()
            .is_some());
        assert!(store
            .get_state("ABC", "device_alert_dialog.ABC")
            .await
            .unwrap()
            .is_some());

        let device = store.get_state("ABC", "device.ABC").await.unwrap().unwrap();
        assert_eq!(device.value["structure_id"], json!("xyz"));
    }

    #[tokio::test]
    async fn reclaiming_the_same_code_is_rejected() {
        let store = SqliteStore::connect("sqlite::memory:", 1).await.unwrap();
        let key = generate_entry_key(&store, "ABC", 3600).await.unwrap();
        claim_entry_key(&store, &key.code, "user_xyz").await.unwrap();

        let second = claim_entry_key(&store, &key.code, "user_other").await;
        assert!(matches!(second, Err(ClaimError::AlreadyClaimedByOther)));
    }

    #[tokio::test]
    async fn same_user_claiming_a_fresh_code_for_the_same_serial_is_idempotent() {
        let store = SqliteStore::connect("sqlite::memory:", 1).await.unwrap();
        let key1 = generate_entry_key(&store, "ABC", 3600).await.unwrap();
        claim_entry_key(&store, &key1.code, "user_xyz").await.unwrap();

        let key2 = generate_entry_key(&store, "ABC", 3600).await.unwrap();
        let result = claim_entry_key(&store, &key2.code, "user_xyz").await;
        assert!(result.is_ok());

        let device = store.get_state("ABC", "device.ABC").await.unwrap().unwrap();
        assert_eq!(device.object_revision, 1, "second claim must not re-create device state");
    }
}
