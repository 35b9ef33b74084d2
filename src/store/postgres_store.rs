//! Remote document-oriented `StateStore` implementation, over
//! `sqlx::PgPool`, values kept as `jsonb`. A horizontally shareable
//! counterpart to [`super::SqliteStore`] for multi-node deployments.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use std::time::Duration;

use crate::model::{
    ApiKey, ApiKeyContext, ApiKeyScopes, DeviceOwner, EntryKey, IntegrationConfig, Object,
    WeatherCacheEntry,
};

use super::{StateStore, StoreError, StoreResult};

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS objects (
                serial TEXT NOT NULL,
                object_key TEXT NOT NULL,
                object_revision BIGINT NOT NULL,
                object_timestamp BIGINT NOT NULL,
                value JSONB NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (serial, object_key)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS entry_keys (
                code TEXT PRIMARY KEY,
                serial TEXT NOT NULL,
                created_at BIGINT NOT NULL,
                expires_at BIGINT NOT NULL,
                claimed_by TEXT,
                claimed_at BIGINT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_entry_keys_serial ON entry_keys(serial)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS device_owners (
                serial TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS weather_cache (
                postal_code TEXT NOT NULL,
                country TEXT NOT NULL,
                fetched_at BIGINT NOT NULL,
                payload JSONB NOT NULL,
                PRIMARY KEY (postal_code, country)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS integration_configs (
                user_id TEXT NOT NULL,
                integration_type TEXT NOT NULL,
                enabled BOOLEAN NOT NULL,
                config JSONB NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (user_id, integration_type)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS api_keys (
                key_hash TEXT PRIMARY KEY,
                key_preview TEXT NOT NULL,
                user_id TEXT NOT NULL,
                name TEXT NOT NULL,
                scopes JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                last_used_at TIMESTAMPTZ
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn row_to_object(row: &PgRow) -> StoreResult<Object> {
        let value: Value = row.try_get("value")?;
        Ok(Object {
            serial: row.try_get("serial")?,
            object_key: row.try_get("object_key")?,
            object_revision: row.try_get("object_revision")?,
            object_timestamp: row.try_get("object_timestamp")?,
            value,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_entry_key(row: &PgRow) -> StoreResult<EntryKey> {
        Ok(EntryKey {
            code: row.try_get("code")?,
            serial: row.try_get("serial")?,
            created_at: row.try_get("created_at")?,
            expires_at: row.try_get("expires_at")?,
            claimed_by: row.try_get("claimed_by")?,
            claimed_at: row.try_get("claimed_at")?,
        })
    }

    fn row_to_integration_config(row: &PgRow) -> StoreResult<IntegrationConfig> {
        let config: Value = row.try_get("config")?;
        Ok(IntegrationConfig {
            user_id: row.try_get("user_id")?,
            r#type: row.try_get("integration_type")?,
            enabled: row.try_get("enabled")?,
            config,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl StateStore for PostgresStore {
    async fn upsert_state(
        &self,
        serial: &str,
        key: &str,
        revision: i64,
        timestamp: i64,
        value: &Value,
    ) -> StoreResult<Object> {
        let now = chrono::Utc::now();
        sqlx::query(
            r#"
            INSERT INTO objects (serial, object_key, object_revision, object_timestamp, value, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (serial, object_key) DO UPDATE SET
                object_revision = excluded.object_revision,
                object_timestamp = excluded.object_timestamp,
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(serial)
        .bind(key)
        .bind(revision)
        .bind(timestamp)
        .bind(value)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(Object {
            serial: serial.to_string(),
            object_key: key.to_string(),
            object_revision: revision,
            object_timestamp: timestamp,
            value: value.clone(),
            updated_at: now,
        })
    }

    async fn get_state(&self, serial: &str, key: &str) -> StoreResult<Option<Object>> {
        let row = sqlx::query("SELECT * FROM objects WHERE serial = $1 AND object_key = $2")
            .bind(serial)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| Self::row_to_object(&r)).transpose()
    }

    async fn get_device_state(&self, serial: &str) -> StoreResult<Vec<Object>> {
        let rows = sqlx::query("SELECT * FROM objects WHERE serial = $1")
            .bind(serial)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_object).collect()
    }

    async fn generate_entry_key(&self, serial: &str, ttl_seconds: i64) -> StoreResult<EntryKey> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM entry_keys WHERE serial = $1")
            .bind(serial)
            .execute(&mut *tx)
            .await?;

        let created_at = chrono::Utc::now().timestamp_millis();
        let expires_at = created_at + ttl_seconds * 1000;

        const MAX_ATTEMPTS: usize = 8;
        for _ in 0..MAX_ATTEMPTS {
            let code = crate::pairing::random_entry_code();
            let inserted = sqlx::query(
                "INSERT INTO entry_keys (code, serial, created_at, expires_at, claimed_by, claimed_at)
                 VALUES ($1, $2, $3, $4, NULL, NULL)
                 ON CONFLICT (code) DO NOTHING",
            )
            .bind(&code)
            .bind(serial)
            .bind(created_at)
            .bind(expires_at)
            .execute(&mut *tx)
            .await?;

            if inserted.rows_affected() == 1 {
                tx.commit().await?;
                return Ok(EntryKey {
                    code,
                    serial: serial.to_string(),
                    created_at,
                    expires_at,
                    claimed_by: None,
                    claimed_at: None,
                });
            }
        }
        Err(StoreError::ExhaustedCodes)
    }

    async fn get_entry_key(&self, code: &str) -> StoreResult<Option<EntryKey>> {
        let row = sqlx::query("SELECT * FROM entry_keys WHERE code = $1")
            .bind(code)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| Self::row_to_entry_key(&r)).transpose()
    }

    async fn claim_entry_key_row(
        &self,
        code: &str,
        user_id: &str,
        claimed_at_ms: i64,
    ) -> StoreResult<Option<EntryKey>> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT * FROM entry_keys WHERE code = $1 FOR UPDATE")
            .bind(code)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let existing = Self::row_to_entry_key(&row)?;
        if existing.is_claimed() {
            tx.commit().await?;
            return Ok(Some(existing));
        }

        sqlx::query("UPDATE entry_keys SET claimed_by = $1, claimed_at = $2 WHERE code = $3")
            .bind(user_id)
            .bind(claimed_at_ms)
            .bind(code)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(Some(EntryKey {
            claimed_by: Some(user_id.to_string()),
            claimed_at: Some(claimed_at_ms),
            ..existing
        }))
    }

    async fn get_device_owner(&self, serial: &str) -> StoreResult<Option<DeviceOwner>> {
        let row = sqlx::query("SELECT * FROM device_owners WHERE serial = $1")
            .bind(serial)
            .fetch_optional(&self.pool)
            .await?;
        Ok(match row {
            Some(row) => Some(DeviceOwner {
                serial: row.try_get("serial")?,
                user_id: row.try_get("user_id")?,
                created_at: row.try_get("created_at")?,
            }),
            None => None,
        })
    }

    async fn set_device_owner(&self, serial: &str, user_id: &str) -> StoreResult<DeviceOwner> {
        let now = chrono::Utc::now();
        sqlx::query(
            "INSERT INTO device_owners (serial, user_id, created_at) VALUES ($1, $2, $3)
             ON CONFLICT (serial) DO NOTHING",
        )
        .bind(serial)
        .bind(user_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get_device_owner(serial)
            .await?
            .ok_or_else(|| StoreError::Unavailable("owner row vanished after insert".into()))
    }

    async fn list_user_devices(&self, user_id: &str) -> StoreResult<Vec<String>> {
        let rows = sqlx::query("SELECT serial FROM device_owners WHERE user_id = $1")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(|r| r.try_get("serial").map_err(Into::into)).collect()
    }

    async fn get_shared_with_me(&self, _user_id: &str) -> StoreResult<Vec<String>> {
        Ok(Vec::new())
    }

    async fn get_weather(
        &self,
        postal: &str,
        country: &str,
    ) -> StoreResult<Option<WeatherCacheEntry>> {
        let row = sqlx::query("SELECT * FROM weather_cache WHERE postal_code = $1 AND country = $2")
            .bind(postal)
            .bind(country)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let payload: Value = row.try_get("payload")?;
                Ok(Some(WeatherCacheEntry {
                    postal_code: row.try_get("postal_code")?,
                    country: row.try_get("country")?,
                    fetched_at: row.try_get("fetched_at")?,
                    payload,
                }))
            }
            None => Ok(None),
        }
    }

    async fn upsert_weather(
        &self,
        postal: &str,
        country: &str,
        fetched_at: i64,
        payload: &Value,
    ) -> StoreResult<WeatherCacheEntry> {
        sqlx::query(
            r#"
            INSERT INTO weather_cache (postal_code, country, fetched_at, payload)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (postal_code, country) DO UPDATE SET
                fetched_at = excluded.fetched_at,
                payload = excluded.payload
            "#,
        )
        .bind(postal)
        .bind(country)
        .bind(fetched_at)
        .bind(payload)
        .execute(&self.pool)
        .await?;

        Ok(WeatherCacheEntry {
            postal_code: postal.to_string(),
            country: country.to_string(),
            fetched_at,
            payload: payload.clone(),
        })
    }

    async fn list_enabled_integrations(
        &self,
        integration_type: &str,
    ) -> StoreResult<Vec<IntegrationConfig>> {
        let rows = sqlx::query(
            "SELECT * FROM integration_configs WHERE integration_type = $1 AND enabled = true",
        )
        .bind(integration_type)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_integration_config).collect()
    }

    async fn list_all_enabled_integrations(&self) -> StoreResult<Vec<IntegrationConfig>> {
        let rows = sqlx::query("SELECT * FROM integration_configs WHERE enabled = true")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_integration_config).collect()
    }

    async fn upsert_integration_config(&self, config: &IntegrationConfig) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO integration_configs (user_id, integration_type, enabled, config, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (user_id, integration_type) DO UPDATE SET
                enabled = excluded.enabled,
                config = excluded.config,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&config.user_id)
        .bind(&config.r#type)
        .bind(config.enabled)
        .bind(&config.config)
        .bind(config.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn validate_api_key(&self, raw_key: &str) -> StoreResult<Option<ApiKeyContext>> {
        let key_hash = crate::crypto::hash_api_key(raw_key);
        let row = sqlx::query("SELECT * FROM api_keys WHERE key_hash = $1")
            .bind(&key_hash)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let scopes: ApiKeyScopes = {
            let raw: Value = row.try_get("scopes")?;
            serde_json::from_value(raw)
                .map_err(|e| StoreError::Unavailable(format!("corrupt scopes column: {e}")))?
        };
        self.touch_api_key_last_used(&key_hash).await?;
        Ok(Some(ApiKeyContext {
            user_id: row.try_get("user_id")?,
            scopes,
        }))
    }

    async fn touch_api_key_last_used(&self, key_hash: &str) -> StoreResult<()> {
        sqlx::query("UPDATE api_keys SET last_used_at = $1 WHERE key_hash = $2")
            .bind(chrono::Utc::now())
            .bind(key_hash)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn create_api_key(&self, key: &ApiKey) -> StoreResult<()> {
        let scopes = serde_json::to_value(&key.scopes)
            .map_err(|e| StoreError::Unavailable(format!("serialize scopes: {e}")))?;
        sqlx::query(
            r#"
            INSERT INTO api_keys (key_hash, key_preview, user_id, name, scopes, created_at, last_used_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&key.key_hash)
        .bind(&key.key_preview)
        .bind(&key.user_id)
        .bind(&key.name)
        .bind(&scopes)
        .bind(key.created_at)
        .bind(key.last_used_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_expired_entry_keys(&self, now_ms: i64) -> StoreResult<u64> {
        let result = sqlx::query(
            "DELETE FROM entry_keys WHERE claimed_by IS NULL AND expires_at < $1",
        )
        .bind(now_ms)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
