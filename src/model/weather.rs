use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `(postal_code, country) → (fetched_at, payload)`. `fetched_at` is a
/// millisecond epoch used to decide TTL expiry in [`crate::weather::WeatherCache`].
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct WeatherCacheEntry {
    pub postal_code: String,
    pub country: String,
    pub fetched_at: i64,
    pub payload: Value,
}
