use serde::{Deserialize, Serialize};

/// Scoped permissions attached to an [`ApiKey`]: which device serials the
/// key may act on, and which control-API scopes it's allowed to call.
/// An empty `serials` list means "all serials the owning user has access
/// to" rather than "none" — enforced at the call site, not here.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ApiKeyScopes {
    #[serde(default)]
    pub serials: Vec<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl ApiKeyScopes {
    pub fn allows_serial(&self, serial: &str) -> bool {
        self.serials.is_empty() || self.serials.iter().any(|s| s == serial)
    }

    pub fn allows_scope(&self, scope: &str) -> bool {
        self.scopes.is_empty() || self.scopes.iter().any(|s| s == scope)
    }
}

/// A control-API bearer credential. `key_hash` is the SHA-256 digest of the
/// raw key (see [`crate::crypto::hash_api_key`]); the raw key itself is
/// never persisted. `key_preview` is safe to display in a dashboard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub key_hash: String,
    pub key_preview: String,
    pub user_id: String,
    pub name: String,
    pub scopes: ApiKeyScopes,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub last_used_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Authenticated context returned by `StateStore::validate_api_key`, handed
/// to control-API handlers by the `ApiKeyAuth` extractor.
#[derive(Debug, Clone)]
pub struct ApiKeyContext {
    pub user_id: String,
    pub scopes: ApiKeyScopes,
}
