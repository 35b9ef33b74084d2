//! Shared error taxonomy for gateway handlers.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::fmt;

/// Error taxonomy shared by transport and control handlers.
///
/// Device-facing write paths never fail merely because the persistent store
/// is momentarily unavailable: the cache is authoritative for the
/// transport, so a handler that successfully updates `DeviceStateService`
/// does not surface `StoreUnavailable` to the device even if the background
/// persistence write later fails. This enum covers the cases where the
/// caller genuinely cannot proceed (reads with nothing cached, auth
/// failures, malformed input, rate limits, conflicts).
#[derive(Debug)]
pub enum Error {
    BadRequest(String),
    Unauthorized(String),
    RateLimited { retry_after_secs: u64 },
    NotFound(String),
    StoreUnavailable(String),
    UpstreamUnavailable(String),
    Conflict(String),
    Internal(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::BadRequest(msg) => write!(f, "Bad request: {msg}"),
            Error::Unauthorized(msg) => write!(f, "Unauthorized: {msg}"),
            Error::RateLimited { retry_after_secs } => {
                write!(f, "Rate limited, retry after {retry_after_secs}s")
            }
            Error::NotFound(msg) => write!(f, "Not found: {msg}"),
            Error::StoreUnavailable(msg) => write!(f, "Store unavailable: {msg}"),
            Error::UpstreamUnavailable(msg) => write!(f, "Upstream unavailable: {msg}"),
            Error::Conflict(msg) => write!(f, "Conflict: {msg}"),
            Error::Internal(msg) => write!(f, "Internal error: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            Error::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            Error::Unauthorized(_) => (StatusCode::UNAUTHORIZED, self.to_string()),
            Error::RateLimited { .. } => (StatusCode::TOO_MANY_REQUESTS, self.to_string()),
            Error::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            Error::StoreUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, self.to_string()),
            Error::UpstreamUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, self.to_string()),
            Error::Conflict(_) => (StatusCode::CONFLICT, self.to_string()),
            Error::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
        };

        if let Error::RateLimited { retry_after_secs } = &self {
            let mut response = (status, Json(json!({ "error": message }))).into_response();
            if let Ok(value) = axum::http::HeaderValue::from_str(&retry_after_secs.to_string()) {
                response
                    .headers_mut()
                    .insert(axum::http::header::RETRY_AFTER, value);
            }
            return response;
        }

        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Error::NotFound("row not found".into()),
            other => Error::StoreUnavailable(other.to_string()),
        }
    }
}

impl From<crate::store::StoreError> for Error {
    fn from(err: crate::store::StoreError) -> Self {
        match err {
            crate::store::StoreError::NotFound(msg) => Error::NotFound(msg),
            crate::store::StoreError::Conflict(msg) => Error::Conflict(msg),
            crate::store::StoreError::Unavailable(msg) => Error::StoreUnavailable(msg),
            crate::store::StoreError::ExhaustedCodes => {
                Error::Internal("entry-key code space exhausted".into())
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_sets_retry_after_header() {
        let response = Error::RateLimited { retry_after_secs: 5 }.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response
                .headers()
                .get(axum::http::header::RETRY_AFTER)
                .unwrap(),
            "5"
        );
    }

    #[test]
    fn not_found_maps_to_404() {
        let response = Error::NotFound("device.ABC".into()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
