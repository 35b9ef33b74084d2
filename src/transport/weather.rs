//! `GET /nest/weather/v1?query=…` — cached proxy to the upstream weather
//! feed. `query` is either `{postal},{country}` or a bare IP address; IP-form
//! queries bypass the cache entirely (spec §4.E).

use axum::{
    extract::{Query, State},
    http::HeaderMap,
    Json,
};
use serde::Deserialize;
use serde_json::Value;

use crate::app_state::AppState;
use crate::device_utils::resolve_serial;
use crate::error::{Error, Result};

#[derive(Debug, Deserialize)]
pub struct WeatherQuery {
    pub query: String,
}

/// Splits `"{postal},{country}"` into its parts, defaulting country to `US`
/// when the query carries no comma (the firmware's older query form).
fn parse_postal_country(query: &str) -> (String, String) {
    match query.split_once(',') {
        Some((postal, country)) => (postal.trim().to_string(), country.trim().to_uppercase()),
        None => (query.trim().to_string(), "US".to_string()),
    }
}

pub async fn weather(
    State(state): State<AppState>,
    Query(params): Query<WeatherQuery>,
    headers: HeaderMap,
) -> Result<Json<Value>> {
    if crate::weather::is_ip_form_query(&params.query) {
        let payload = state.weather.fetch_uncached(&params.query, "").await;
        return match payload {
            Some(payload) => Ok(Json(payload)),
            None => Err(Error::UpstreamUnavailable("weather upstream unreachable".into())),
        };
    }

    // Best-effort: this endpoint doesn't require device auth, but when the
    // caller does carry a device identity, a cache-miss refresh should still
    // push the owner's `user.{id}.weather` (spec §4.E).
    let requesting_serial = resolve_serial(&headers, None);

    let (postal, country) = parse_postal_country(&params.query);
    match state
        .weather
        .get(state.store.as_ref(), &postal, &country, requesting_serial.as_deref())
        .await
    {
        Some(payload) => Ok(Json(payload)),
        None => Err(Error::UpstreamUnavailable("weather unavailable".into())),
    }
}
