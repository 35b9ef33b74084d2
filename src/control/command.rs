//! `POST /command` — the control API's single write endpoint. Every branch
//! ultimately goes through `DeviceStateService::upsert` (via the same merge
//! pipeline the transport handlers use), so a device observes a dashboard
//! command through the identical long-poll wakeup it gets for its own
//! writes (spec §4.H).

use serde::Deserialize;
use serde_json::{json, Value};

use axum::extract::State;

use crate::app_state::AppState;
use crate::control::ApiKeyAuth;
use crate::error::{Error, Result};
use crate::transport::apply_update;

/// Thermostats don't accept arbitrary setpoints; clamp to a safe range
/// before writing, regardless of what the dashboard requested.
const MIN_SAFE_TEMP_C: f64 = 9.0;
const MAX_SAFE_TEMP_C: f64 = 32.0;

fn clamp_safe_temperature(value: f64) -> f64 {
    value.clamp(MIN_SAFE_TEMP_C, MAX_SAFE_TEMP_C)
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum CommandAction {
    #[serde(alias = "temperature")]
    Temp {
        #[serde(default)]
        mode: Option<String>,
        value: f64,
        #[serde(default)]
        value_low: Option<f64>,
        #[serde(default)]
        value_high: Option<f64>,
    },
    Away {
        away: bool,
    },
    Set {
        object: String,
        field: String,
        value: Value,
    },
}

#[derive(Debug, Deserialize)]
pub struct CommandRequest {
    pub serial: String,
    #[serde(flatten)]
    pub action: CommandAction,
}

pub async fn command(
    State(state): State<AppState>,
    ApiKeyAuth(caller): ApiKeyAuth,
    axum::Json(body): axum::Json<CommandRequest>,
) -> Result<axum::Json<Value>> {
    if !caller.scopes.allows_serial(&body.serial) {
        return Err(Error::Unauthorized(format!(
            "api key is not scoped to serial {}",
            body.serial
        )));
    }

    let now_ms = chrono::Utc::now().timestamp_millis();
    let serial = body.serial.clone();

    let written = match body.action {
        CommandAction::Temp {
            mode,
            value,
            value_low,
            value_high,
        } => {
            if !caller.scopes.allows_scope("temp") {
                return Err(Error::Unauthorized("api key lacks the temp scope".into()));
            }
            let clamped = clamp_safe_temperature(value);
            let mut patch = json!({
                "target_temperature": clamped,
                "target_temperature_type": mode.unwrap_or_else(|| "heat".to_string()),
                "touched_by": caller.user_id,
                "touched_at": now_ms,
            });
            if let Value::Object(map) = &mut patch {
                if let Some(low) = value_low {
                    map.insert("target_temperature_low".into(), json!(clamp_safe_temperature(low)));
                }
                if let Some(high) = value_high {
                    map.insert("target_temperature_high".into(), json!(clamp_safe_temperature(high)));
                }
            }
            apply_update(&state, &serial, &format!("shared.{serial}"), patch, None, now_ms).await
        }
        CommandAction::Away { away } => {
            if !caller.scopes.allows_scope("away") {
                return Err(Error::Unauthorized("api key lacks the away scope".into()));
            }
            apply_update(
                &state,
                &serial,
                &format!("device.{serial}"),
                json!({ "auto_away": away, "away": away, "away_timestamp": now_ms }),
                None,
                now_ms,
            )
            .await
        }
        CommandAction::Set { object, field, value } => {
            if !caller.scopes.allows_scope("set") {
                return Err(Error::Unauthorized("api key lacks the set scope".into()));
            }
            apply_update(
                &state,
                &serial,
                &format!("{object}.{serial}"),
                json!({ field: value }),
                None,
                now_ms,
            )
            .await
        }
    };

    state.subscriptions.notify(&serial, &written).await;

    Ok(axum::Json(serde_json::to_value(written.as_wire()).unwrap_or(Value::Null)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temperature_clamps_to_safe_range() {
        assert_eq!(clamp_safe_temperature(50.0), MAX_SAFE_TEMP_C);
        assert_eq!(clamp_safe_temperature(-10.0), MIN_SAFE_TEMP_C);
        assert_eq!(clamp_safe_temperature(21.0), 21.0);
    }

    #[test]
    fn temp_action_accepts_legacy_temperature_alias() {
        let request: CommandRequest = serde_json::from_value(serde_json::json!({
            "serial": "ABC",
            "action": "temperature",
            "mode": "heat",
            "value": 22.0
        }))
        .unwrap();
        assert!(matches!(request.action, CommandAction::Temp { .. }));
    }
}
