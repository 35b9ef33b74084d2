//! `GET /nest/entry` — the service-discovery document. The firmware fetches
//! this once on first contact and caches every URL below for the rest of
//! its lifetime, so the field set and naming are part of the non-negotiable
//! wire contract (spec §6): real firmware parses these exact keys.

use axum::{
    extract::State,
    http::{header, HeaderMap},
    Json,
};
use serde::Serialize;

use crate::app_state::AppState;

#[derive(Debug, Serialize)]
pub struct EntryDocument {
    pub czfe_url: String,
    pub transport_url: String,
    pub direct_transport_url: String,
    pub passphrase_url: String,
    pub ping_url: String,
    pub pro_info_url: String,
    pub weather_url: String,
    pub upload_url: String,
    pub software_update_url: String,
    pub server_version: String,
    pub tier_name: String,
}

fn request_scheme(config: &crate::config::GatewayConfig) -> &'static str {
    if config.cert_dir.is_some() {
        "https"
    } else {
        "http"
    }
}

fn request_host(headers: &HeaderMap, config: &crate::config::GatewayConfig) -> String {
    headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| format!("127.0.0.1:{}", config.transport_port))
}

pub async fn entry(State(state): State<AppState>, headers: HeaderMap) -> Json<EntryDocument> {
    let scheme = request_scheme(&state.config);
    let host = request_host(&headers, &state.config);
    let base = format!("{scheme}://{host}/nest");

    Json(EntryDocument {
        czfe_url: base.clone(),
        transport_url: format!("{base}/transport"),
        direct_transport_url: format!("{base}/transport"),
        passphrase_url: format!("{base}/passphrase"),
        ping_url: format!("{base}/ping"),
        pro_info_url: format!("{base}/pro_info"),
        weather_url: format!("{base}/weather/v1?query="),
        upload_url: format!("{base}/upload"),
        software_update_url: String::new(),
        server_version: state.config.server_version.clone(),
        tier_name: state.config.tier_name.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weather_url_carries_trailing_query_marker() {
        let config = crate::config::GatewayConfig {
            cert_dir: None,
            ..test_config()
        };
        let headers = HeaderMap::new();
        let host = request_host(&headers, &config);
        assert_eq!(host, format!("127.0.0.1:{}", config.transport_port));
        let base = format!("{}://{}/nest", request_scheme(&config), host);
        assert!(format!("{base}/weather/v1?query=").ends_with("?query="));
    }

    #[test]
    fn tls_cert_dir_selects_https_scheme() {
        let config = crate::config::GatewayConfig {
            cert_dir: Some("/etc/certs".into()),
            ..test_config()
        };
        assert_eq!(request_scheme(&config), "https");
    }

    fn test_config() -> crate::config::GatewayConfig {
        crate::config::GatewayConfig {
            transport_port: 8443,
            control_port: 9090,
            cert_dir: None,
            entry_key_ttl_seconds: 3600,
            weather_cache_ttl_ms: 1_800_000,
            subscription_timeout_ms: 300_000,
            max_subscriptions_per_device: 4,
            debug_logging: false,
            enable_metrics: false,
            store_backend: crate::config::StoreBackend::Sqlite,
            database_url: String::new(),
            sqlite_path: String::new(),
            store_max_connections: 5,
            server_version: "0.1.0".into(),
            tier_name: "production".into(),
            upload_dir: "uploads".into(),
            secrets_key_hex: None,
        }
    }
}
