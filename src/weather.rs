//! TTL-gated proxy to the upstream weather feed.
//!
//! Grounded on the reference server's `auth::AuthMiddleware::did_cache`
//! (`moka::future::Cache` with `time_to_live`) — same cache shape,
//! postal/country in place of a DID and a weather payload in place of a DID
//! document.

use std::time::Duration;

use moka::future::Cache;
use serde_json::Value;

use crate::derive::users_for_postal_code;
use crate::model::WeatherCacheEntry;
use crate::store::StateStore;

/// `true` for queries that look like an IP address rather than a postal
/// code — the behavior described below: "IP-form queries bypass the cache."
pub fn is_ip_form_query(query: &str) -> bool {
    query.parse::<std::net::IpAddr>().is_ok()
}

pub struct WeatherCache {
    cache: Cache<(String, String), Value>,
    http: reqwest::Client,
    upstream_base: String,
}

impl WeatherCache {
    pub fn new(ttl: Duration, upstream_base: String) -> Self {
        Self {
            cache: Cache::builder().time_to_live(ttl).build(),
            http: reqwest::Client::new(),
            upstream_base,
        }
    }

    /// `now - fetched_at < ttl` → cached payload. Otherwise fetch from
    /// upstream, persist into `StateStore`, and return the fresh payload.
    /// Fetch failures return `None` without poisoning the cache — a later
    /// call may still succeed and populate it.
    ///
    /// `requesting_serial`, when given, identifies the device whose owner
    /// triggered this lookup (e.g. a dashboard or firmware hitting
    /// `/nest/weather/v1` directly, not via a postal-code change). On a
    /// genuine upstream refresh — cache miss, fetch succeeds — that owner's
    /// `user.{id}.weather` is refreshed too (spec §4.E), since a cache hit
    /// or a stale-cache fallback carries nothing new to push.
    pub async fn get(
        &self,
        store: &dyn StateStore,
        postal: &str,
        country: &str,
        requesting_serial: Option<&str>,
    ) -> Option<Value> {
        let key = (postal.to_string(), country.to_string());
        if let Some(cached) = self.cache.get(&key).await {
            metrics::counter!("gateway_weather_cache_hit_total", 1);
            return Some(cached);
        }
        metrics::counter!("gateway_weather_cache_miss_total", 1);

        let fetched = self.fetch_upstream(postal, country).await;
        match fetched {
            Some(payload) => {
                self.cache.insert(key, payload.clone()).await;
                let now_ms = chrono::Utc::now().timestamp_millis();
                if let Err(err) = store.upsert_weather(postal, country, now_ms, &payload).await {
                    tracing::warn!(postal, country, error = %err, "weather persist failed");
                }
                if let Some(serial) = requesting_serial {
                    if let Ok(Some(owner)) = store.get_device_owner(serial).await {
                        self.propagate(store, &[owner.user_id], postal, &payload).await;
                    }
                }
                Some(payload)
            }
            None => {
                // Fall back to whatever's durably cached, even if stale —
                // the behavior described below: UpstreamUnavailable returns cached data if present.
                match store.get_weather(postal, country).await {
                    Ok(Some(WeatherCacheEntry { payload, .. })) => Some(payload),
                    _ => None,
                }
            }
        }
    }

    /// Bypasses the cache entirely — used for IP-form queries, which never
    /// get a cache entry of their own.
    pub async fn fetch_uncached(&self, postal: &str, country: &str) -> Option<Value> {
        self.fetch_upstream(postal, country).await
    }

    async fn fetch_upstream(&self, postal: &str, country: &str) -> Option<Value> {
        let url = format!("{}?postal={postal}&country={country}", self.upstream_base);
        let response = self
            .http
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            return None;
        }
        response.json::<Value>().await.ok()
    }

    /// After a successful refresh, push `payload` into every `user.{id}`
    /// object whose owner has a device reporting `postal_code` (spec
    /// §4.G "Weather propagation").
    pub async fn propagate(
        &self,
        store: &dyn StateStore,
        all_owned_users: &[String],
        postal_code: &str,
        payload: &Value,
    ) {
        let users = users_for_postal_code(store, all_owned_users, postal_code).await;
        for user_id in users {
            let key = format!("user.{user_id}");
            let existing = store
                .get_state(&user_id, &key)
                .await
                .ok()
                .flatten()
                .map(|o| o.value)
                .unwrap_or_else(|| Value::Object(Default::default()));
            let merged = crate::state::value::merge_values(&existing, &serde_json::json!({"weather": payload}));
            let revision = store
                .get_state(&user_id, &key)
                .await
                .ok()
                .flatten()
                .map(|o| o.object_revision + 1)
                .unwrap_or(1);
            let now_ms = chrono::Utc::now().timestamp_millis();
            if let Err(err) = store.upsert_state(&user_id, &key, revision, now_ms, &merged).await {
                tracing::warn!(user_id, error = %err, "weather propagation write failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ip_form_bypasses_cache() {
        assert!(is_ip_form_query("203.0.113.5"));
        assert!(is_ip_form_query("::1"));
        assert!(!is_ip_form_query("94107"));
    }

    #[tokio::test]
    async fn fetch_failure_falls_back_to_stored_cache() {
        let cache = WeatherCache::new(Duration::from_millis(10), "http://127.0.0.1:1".into());
        let store = crate::store::sqlite_store::SqliteStore::connect("sqlite::memory:", 1)
            .await
            .unwrap();
        store
            .upsert_weather("94107", "US", 1000, &serde_json::json!({"temp": 70}))
            .await
            .unwrap();

        let result = cache.get(&store, "94107", "US", None).await;
        assert_eq!(result, Some(serde_json::json!({"temp": 70})));
    }
}
