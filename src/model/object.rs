use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The atomic unit of the state engine: a versioned value under
/// `(serial, object_key)`.
///
/// `object_key` is typed by prefix (`device.`, `shared.`, `link.`,
/// `structure.`, `user.`, `schedule.`, `device_alert_dialog.`, `weather.`);
/// the suffix is usually the device serial or a user id. Revision never
/// decreases for a given `(serial, object_key)`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Object {
    pub serial: String,
    pub object_key: String,
    pub object_revision: i64,
    pub object_timestamp: i64,
    pub value: Value,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl Object {
    pub fn new(serial: impl Into<String>, object_key: impl Into<String>, value: Value) -> Self {
        Self {
            serial: serial.into(),
            object_key: object_key.into(),
            object_revision: 0,
            object_timestamp: 0,
            value,
            updated_at: chrono::Utc::now(),
        }
    }

    /// `true` iff this object's prefix matches `device.`, `shared.`, etc.
    pub fn prefix(&self) -> &str {
        self.object_key
            .split_once('.')
            .map(|(prefix, _)| prefix)
            .unwrap_or(&self.object_key)
    }

    /// The portion of the key after the first `.`, typically a serial or
    /// user id.
    pub fn key_suffix(&self) -> &str {
        self.object_key
            .split_once('.')
            .map(|(_, suffix)| suffix)
            .unwrap_or("")
    }

    /// Trimmed wire representation (no `value`) used by the list endpoint.
    pub fn as_summary(&self) -> ObjectSummary {
        ObjectSummary {
            object_key: self.object_key.clone(),
            object_revision: self.object_revision,
            object_timestamp: self.object_timestamp,
        }
    }

    /// Full wire representation (with `value`) used by subscribe/put
    /// responses.
    pub fn as_wire(&self) -> ObjectWire {
        ObjectWire {
            object_key: self.object_key.clone(),
            object_revision: self.object_revision,
            object_timestamp: self.object_timestamp,
            value: Some(self.value.clone()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectSummary {
    pub object_key: String,
    pub object_revision: i64,
    pub object_timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectWire {
    pub object_key: String,
    pub object_revision: i64,
    pub object_timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_and_suffix_split_on_first_dot() {
        let obj = Object::new("ABC123", "device.ABC123", serde_json::json!({}));
        assert_eq!(obj.prefix(), "device");
        assert_eq!(obj.key_suffix(), "ABC123");
    }

    #[test]
    fn user_keys_split_the_same_way() {
        let obj = Object::new("ABC123", "user.user_xyz", serde_json::json!({}));
        assert_eq!(obj.prefix(), "user");
        assert_eq!(obj.key_suffix(), "user_xyz");
    }
}
