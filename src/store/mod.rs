//! The `StateStore` trait: the external persistence collaborator
//! the core consumes. Not itself the hard part — the interface is.

pub mod postgres_store;
pub mod sqlite_store;

pub use postgres_store::PostgresStore;
pub use sqlite_store::SqliteStore;

use async_trait::async_trait;
use serde_json::Value;

use crate::model::{ApiKeyContext, DeviceOwner, EntryKey, IntegrationConfig, Object, WeatherCacheEntry};

#[derive(Debug)]
pub enum StoreError {
    Unavailable(String),
    Conflict(String),
    NotFound(String),
    ExhaustedCodes,
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Unavailable(msg) => write!(f, "store unavailable: {msg}"),
            StoreError::Conflict(msg) => write!(f, "conflict: {msg}"),
            StoreError::NotFound(msg) => write!(f, "not found: {msg}"),
            StoreError::ExhaustedCodes => write!(f, "exhausted entry-key code space"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound("row not found".into()),
            other => StoreError::Unavailable(other.to_string()),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Durable persistence for objects, pairing codes, ownership, the weather
/// cache, integration configs, and API keys. Every operation must be
/// idempotent under retry — callers (notably `DeviceStateService::upsert`)
/// retry on transient failure without additional bookkeeping.
///
/// At least two plug-compatible implementations exist: [`SqliteStore`] (a
/// local embedded relational store) and [`PostgresStore`] (a remote
/// document-oriented store, values kept as JSONB).
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn upsert_state(
        &self,
        serial: &str,
        key: &str,
        revision: i64,
        timestamp: i64,
        value: &Value,
    ) -> StoreResult<Object>;

    async fn get_state(&self, serial: &str, key: &str) -> StoreResult<Option<Object>>;

    async fn get_device_state(&self, serial: &str) -> StoreResult<Vec<Object>>;

    /// Atomically replaces any prior code for `serial`. Retries internally
    /// on code collision up to a small bound, failing with
    /// `StoreError::ExhaustedCodes` rather than looping forever.
    async fn generate_entry_key(&self, serial: &str, ttl_seconds: i64) -> StoreResult<EntryKey>;

    async fn get_entry_key(&self, code: &str) -> StoreResult<Option<EntryKey>>;

    /// Marks `code` claimed by `user_id` at `claimed_at_ms`, unless it is
    /// already claimed (by anyone) — in which case the existing row is
    /// returned unchanged so repeated claims of the same code are a no-op
    /// rather than overwriting the original claimant.
    async fn claim_entry_key_row(
        &self,
        code: &str,
        user_id: &str,
        claimed_at_ms: i64,
    ) -> StoreResult<Option<EntryKey>>;

    async fn get_device_owner(&self, serial: &str) -> StoreResult<Option<DeviceOwner>>;

    async fn set_device_owner(&self, serial: &str, user_id: &str) -> StoreResult<DeviceOwner>;

    async fn list_user_devices(&self, user_id: &str) -> StoreResult<Vec<String>>;

    async fn get_shared_with_me(&self, user_id: &str) -> StoreResult<Vec<String>>;

    async fn get_weather(
        &self,
        postal: &str,
        country: &str,
    ) -> StoreResult<Option<WeatherCacheEntry>>;

    async fn upsert_weather(
        &self,
        postal: &str,
        country: &str,
        fetched_at: i64,
        payload: &Value,
    ) -> StoreResult<WeatherCacheEntry>;

    async fn list_enabled_integrations(
        &self,
        integration_type: &str,
    ) -> StoreResult<Vec<IntegrationConfig>>;

    async fn list_all_enabled_integrations(&self) -> StoreResult<Vec<IntegrationConfig>>;

    async fn upsert_integration_config(&self, config: &IntegrationConfig) -> StoreResult<()>;

    async fn validate_api_key(&self, raw_key: &str) -> StoreResult<Option<ApiKeyContext>>;

    async fn touch_api_key_last_used(&self, key_hash: &str) -> StoreResult<()>;

    async fn create_api_key(&self, key: &crate::model::ApiKey) -> StoreResult<()>;

    /// Garbage-collect expired entry keys; returns the count removed.
    async fn delete_expired_entry_keys(&self, now_ms: i64) -> StoreResult<u64>;
}
