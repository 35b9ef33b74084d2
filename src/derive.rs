//! Derived-state rules: fan-timer preservation, structure-id
//! backfill, user-away aggregation, weather propagation. Pure functions
//! over `serde_json::Value` plus the small set of `StateStore` reads each
//! rule needs; no direct coupling to the transport layer.

use serde_json::{json, Value};

use crate::state::value::preserve_missing_keys;
use crate::store::StateStore;

/// Fan control fields a partial `device.{serial}` update must not clobber
/// merely by omitting them.
pub const FAN_TIMER_FIELDS: &[&str] = &[
    "fan_timer_timeout",
    "fan_control_state",
    "fan_timer_duration",
    "fan_current_speed",
    "fan_mode",
];

/// Applied post-merge, before revision comparison: if the incoming update
/// didn't mention a fan-timer field, the prior server value survives
/// bit-exactly.
pub fn preserve_fan_timer_fields(merged: Value, prior: &Value) -> Value {
    preserve_missing_keys(merged, prior, FAN_TIMER_FIELDS)
}

/// The well-known prefix structure/user ids carry ahead of the bare id —
/// `device.{serial}.structure_id` is the user id with this prefix stripped.
const USER_ID_PREFIX: &str = "user_";

pub fn strip_user_id_prefix(user_id: &str) -> &str {
    user_id.strip_prefix(USER_ID_PREFIX).unwrap_or(user_id)
}

/// If the merged `device.{serial}` value lacks `structure_id`, look up the
/// owner and set it from `owner.user_id` (minus the well-known prefix).
pub async fn backfill_structure_id(
    store: &dyn StateStore,
    serial: &str,
    mut merged: Value,
) -> Value {
    let has_structure_id = merged
        .get("structure_id")
        .map(|v| !v.is_null())
        .unwrap_or(false);
    if has_structure_id {
        return merged;
    }

    match store.get_device_owner(serial).await {
        Ok(Some(owner)) => {
            if let Value::Object(map) = &mut merged {
                map.insert(
                    "structure_id".to_string(),
                    json!(strip_user_id_prefix(&owner.user_id)),
                );
            }
            merged
        }
        _ => merged,
    }
}

/// Stamps the extracted device-identity header onto a merged `device.`
/// value, when the caller's request carried one. A no-op when the device
/// sent no identity header (older firmware) or the value isn't an object.
pub fn annotate_device_identity(mut merged: Value, device_identity: Option<&str>) -> Value {
    let Some(identity) = device_identity else {
        return merged;
    };
    if let Value::Object(map) = &mut merged {
        map.insert("device_identity".to_string(), json!(identity));
    }
    merged
}

/// The subset of a `device.{serial}` object's fields the away aggregate
/// depends on.
#[derive(Debug, Clone, Default)]
pub struct AwaySignal {
    pub away: bool,
    pub away_timestamp: Option<i64>,
    pub vacation_mode: bool,
    pub manual_away_timestamp: Option<i64>,
    pub away_setter: Option<String>,
}

fn extract_away_signal(value: &Value) -> AwaySignal {
    AwaySignal {
        away: value.get("away").and_then(Value::as_bool).unwrap_or(false),
        away_timestamp: value.get("away_timestamp").and_then(Value::as_i64),
        vacation_mode: value
            .get("vacation_mode")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        manual_away_timestamp: value.get("manual_away_timestamp").and_then(Value::as_i64),
        away_setter: value
            .get("away_setter")
            .and_then(Value::as_str)
            .map(str::to_string),
    }
}

/// Recompute the `user.{id}` away aggregate from every device the user
/// owns: `away` iff *all* owned devices report away, `vacation_mode` iff
/// *any* does, and the most recent `away_timestamp`/
/// `manual_away_timestamp`/`away_setter` across all of them.
pub async fn recompute_user_away(store: &dyn StateStore, user_id: &str) -> Option<Value> {
    let serials = store.list_user_devices(user_id).await.ok()?;
    if serials.is_empty() {
        return None;
    }

    let mut all_away = true;
    let mut any_vacation = false;
    let mut latest_away_ts: Option<i64> = None;
    let mut latest_manual_ts: Option<i64> = None;
    let mut latest_setter: Option<String> = None;

    let mut saw_any_device = false;
    for serial in &serials {
        let Ok(Some(object)) = store.get_state(serial, &format!("device.{serial}")).await else {
            continue;
        };
        saw_any_device = true;
        let signal = extract_away_signal(&object.value);
        all_away &= signal.away;
        any_vacation |= signal.vacation_mode;
        if signal.away_timestamp > latest_away_ts {
            latest_away_ts = signal.away_timestamp;
        }
        if signal.manual_away_timestamp > latest_manual_ts {
            latest_manual_ts = signal.manual_away_timestamp;
            latest_setter = signal.away_setter.clone();
        }
    }

    if !saw_any_device {
        return None;
    }

    let mut aggregate = json!({
        "away": all_away,
        "vacation_mode": any_vacation,
    });
    if let Value::Object(map) = &mut aggregate {
        if let Some(ts) = latest_away_ts {
            map.insert("away_timestamp".into(), json!(ts));
        }
        if let Some(ts) = latest_manual_ts {
            map.insert("manual_away_timestamp".into(), json!(ts));
        }
        if let Some(setter) = latest_setter {
            map.insert("away_setter".into(), json!(setter));
        }
    }
    Some(aggregate)
}

/// After an upstream weather fetch succeeds or a device reports a new
/// postal code, find every user who owns a device reporting `postal_code`.
pub async fn users_for_postal_code(
    store: &dyn StateStore,
    all_owned_users: &[String],
    postal_code: &str,
) -> Vec<String> {
    let mut matches = Vec::new();
    for user_id in all_owned_users {
        let Ok(serials) = store.list_user_devices(user_id).await else {
            continue;
        };
        for serial in serials {
            if let Ok(Some(device)) = store.get_state(&serial, &format!("device.{serial}")).await {
                if device.value.get("postal_code").and_then(Value::as_str) == Some(postal_code) {
                    matches.push(user_id.clone());
                    break;
                }
            }
        }
    }
    matches
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::sqlite_store::SqliteStore;

    #[test]
    fn fan_timer_fields_survive_a_partial_update() {
        let prior = json!({
            "fan_timer_timeout": 900,
            "fan_control_state": true,
            "fan_timer_duration": 1800,
            "fan_current_speed": 2,
            "fan_mode": "auto",
            "away": false,
        });
        let merged = json!({"away": true});
        let result = preserve_fan_timer_fields(merged, &prior);
        assert_eq!(
            result,
            json!({
                "away": true,
                "fan_timer_timeout": 900,
                "fan_control_state": true,
                "fan_timer_duration": 1800,
                "fan_current_speed": 2,
                "fan_mode": "auto",
            })
        );
    }

    #[test]
    fn fan_timer_fields_present_in_update_are_not_overwritten() {
        let prior = json!({"fan_mode": "auto"});
        let merged = json!({"fan_mode": "off"});
        assert_eq!(preserve_fan_timer_fields(merged, &prior), json!({"fan_mode": "off"}));
    }

    #[tokio::test]
    async fn backfill_structure_id_uses_owner_minus_prefix() {
        let store = SqliteStore::connect("sqlite::memory:", 1).await.unwrap();
        store.set_device_owner("ABC", "user_xyz").await.unwrap();

        let merged = json!({"away": false});
        let result = backfill_structure_id(&store, "ABC", merged).await;
        assert_eq!(result.get("structure_id").unwrap(), "xyz");
    }

    #[tokio::test]
    async fn backfill_structure_id_is_noop_when_already_present() {
        let store = SqliteStore::connect("sqlite::memory:", 1).await.unwrap();
        let merged = json!({"structure_id": "already-set"});
        let result = backfill_structure_id(&store, "ABC", merged).await;
        assert_eq!(result.get("structure_id").unwrap(), "already-set");
    }

    #[tokio::test]
    async fn away_aggregate_is_all_of_away_any_of_vacation() {
        let store = SqliteStore::connect("sqlite::memory:", 1).await.unwrap();
        store.set_device_owner("A", "user_xyz").await.unwrap();
        store.set_device_owner("B", "user_xyz").await.unwrap();
        store
            .upsert_state("A", "device.A", 1, 1000, &json!({"away": true, "vacation_mode": false}))
            .await
            .unwrap();
        store
            .upsert_state("B", "device.B", 1, 2000, &json!({"away": true, "vacation_mode": true}))
            .await
            .unwrap();

        let aggregate = recompute_user_away(&store, "user_xyz").await.unwrap();
        assert_eq!(aggregate["away"], json!(true));
        assert_eq!(aggregate["vacation_mode"], json!(true));
    }

    #[tokio::test]
    async fn away_aggregate_is_false_if_any_device_is_present() {
        let store = SqliteStore::connect("sqlite::memory:", 1).await.unwrap();
        store.set_device_owner("A", "user_xyz").await.unwrap();
        store.set_device_owner("B", "user_xyz").await.unwrap();
        store
            .upsert_state("A", "device.A", 1, 1000, &json!({"away": true}))
            .await
            .unwrap();
        store
            .upsert_state("B", "device.B", 1, 1000, &json!({"away": false}))
            .await
            .unwrap();

        let aggregate = recompute_user_away(&store, "user_xyz").await.unwrap();
        assert_eq!(aggregate["away"], json!(false));
    }
}
