use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `(user_id, type)` integration configuration. Secrets embedded in
/// `config` are stored encrypted (see [`crate::secrets`]) and decrypted only
/// when constructing a live [`crate::integrations::Integration`].
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct IntegrationConfig {
    pub user_id: String,
    #[sqlx(rename = "integration_type")]
    pub r#type: String,
    pub enabled: bool,
    pub config: Value,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl IntegrationConfig {
    pub fn identity(&self) -> (String, String) {
        (self.user_id.clone(), self.r#type.clone())
    }
}
