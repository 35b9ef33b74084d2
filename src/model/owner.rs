use serde::{Deserialize, Serialize};

/// `(serial → user_id)` ownership record. At most one owner per serial.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeviceOwner {
    pub serial: String,
    pub user_id: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}
