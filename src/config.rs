//! Environment-variable configuration surface.
//!
//! Mirrors the teacher's `db::DbConfig::default()` pattern — every field
//! falls back to a sane default when the environment variable is absent or
//! unparsable, so the gateway boots in a local/dev configuration with no
//! environment set at all.

use std::time::Duration;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(default)
}

/// Which `StateStore` implementation to construct at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Sqlite,
    Postgres,
}

impl StoreBackend {
    fn from_env() -> Self {
        match std::env::var("STORE_BACKEND").as_deref() {
            Ok("postgres") | Ok("postgresql") => StoreBackend::Postgres,
            _ => StoreBackend::Sqlite,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Device-facing port (TLS if `cert_dir` is set, else plain HTTP).
    pub transport_port: u16,
    /// Dashboard/control-plane port (plain HTTP, local-only by convention).
    pub control_port: u16,
    /// Directory containing `cert.pem`/`key.pem`; absent disables TLS.
    pub cert_dir: Option<String>,

    pub entry_key_ttl_seconds: i64,
    pub weather_cache_ttl_ms: i64,
    pub subscription_timeout_ms: i64,
    pub max_subscriptions_per_device: usize,

    pub debug_logging: bool,
    pub enable_metrics: bool,

    pub store_backend: StoreBackend,
    pub database_url: String,
    pub sqlite_path: String,
    pub store_max_connections: u32,

    pub server_version: String,
    pub tier_name: String,

    pub upload_dir: String,

    /// Secret key material for `secrets::encrypt`/`decrypt` (32 bytes, hex).
    pub secrets_key_hex: Option<String>,
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        Self {
            transport_port: env_or("TRANSPORT_PORT", 8443),
            control_port: env_or("CONTROL_PORT", 9090),
            cert_dir: std::env::var("CERT_DIR").ok().filter(|s| !s.is_empty()),

            // Milliseconds throughout per the behavior described below's invariant; the entry-key
            // TTL is configured in seconds for operator ergonomics and
            // converted at the pairing boundary.
            entry_key_ttl_seconds: env_or("ENTRY_KEY_TTL_SECONDS", 3600),
            weather_cache_ttl_ms: env_or("WEATHER_CACHE_TTL_MS", 30 * 60 * 1000),
            subscription_timeout_ms: env_or("SUBSCRIPTION_TIMEOUT_MS", 5 * 60 * 1000),
            max_subscriptions_per_device: env_or("MAX_SUBSCRIPTIONS_PER_DEVICE", 4),

            debug_logging: env_flag("DEBUG_LOGGING", cfg!(debug_assertions)),
            enable_metrics: env_flag("ENABLE_METRICS", false),

            store_backend: StoreBackend::from_env(),
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgres://localhost/thermo_gateway".to_string()),
            sqlite_path: std::env::var("SQLITE_PATH")
                .unwrap_or_else(|_| "thermo_gateway.sqlite3".to_string()),
            store_max_connections: env_or("STORE_MAX_CONNECTIONS", 10),

            server_version: std::env::var("SERVER_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            tier_name: std::env::var("TIER_NAME").unwrap_or_else(|_| "production".to_string()),

            upload_dir: std::env::var("UPLOAD_DIR").unwrap_or_else(|_| "uploads".to_string()),

            secrets_key_hex: std::env::var("SECRETS_KEY_HEX").ok(),
        }
    }

    pub fn subscription_timeout(&self) -> Duration {
        Duration::from_millis(self.subscription_timeout_ms.max(0) as u64)
    }

    pub fn weather_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.weather_cache_ttl_ms.max(0) as u64)
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane_with_empty_env() {
        let config = GatewayConfig {
            transport_port: 8443,
            control_port: 9090,
            cert_dir: None,
            entry_key_ttl_seconds: 3600,
            weather_cache_ttl_ms: 1_800_000,
            subscription_timeout_ms: 300_000,
            max_subscriptions_per_device: 4,
            debug_logging: false,
            enable_metrics: false,
            store_backend: StoreBackend::Sqlite,
            database_url: "postgres://localhost/thermo_gateway".into(),
            sqlite_path: "thermo_gateway.sqlite3".into(),
            store_max_connections: 10,
            server_version: "0.1.0".into(),
            tier_name: "production".into(),
            upload_dir: "uploads".into(),
            secrets_key_hex: None,
        };
        assert_eq!(config.subscription_timeout(), Duration::from_secs(300));
    }
}
