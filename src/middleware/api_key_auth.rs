//! Bearer-token authentication for the control API, grounded on the
//! reference server's `auth::AuthUser: FromRequestParts` extractor.

use axum::{
    extract::{FromRef, FromRequestParts},
    http::{header, request::Parts},
};

use crate::app_state::AppState;
use crate::error::Error;
use crate::model::ApiKeyContext;

/// Authenticated control-API caller, extracted from an `Authorization:
/// Bearer <key>` header and validated against the store's API key table.
#[derive(Debug, Clone)]
pub struct ApiKeyAuth(pub ApiKeyContext);

impl<S> FromRequestParts<S> for ApiKeyAuth
where
    AppState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let app_state = AppState::from_ref(state);

        let raw_key = bearer_token(parts)
            .ok_or_else(|| Error::Unauthorized("missing bearer token".into()))?;

        let context = app_state
            .store
            .validate_api_key(&raw_key)
            .await
            .map_err(|e| Error::StoreUnavailable(e.to_string()))?
            .ok_or_else(|| Error::Unauthorized("invalid or revoked api key".into()))?;

        let key_hash = crate::crypto::hash_api_key(&raw_key);
        if let Err(e) = app_state.store.touch_api_key_last_used(&key_hash).await {
            tracing::warn!(error = %e, "failed to record api key use");
        }

        Ok(ApiKeyAuth(context))
    }
}

fn bearer_token(parts: &mut Parts) -> Option<String> {
    let value = parts.headers.get(header::AUTHORIZATION)?;
    let value = value.to_str().ok()?;
    value.strip_prefix("Bearer ").map(|s| s.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::bearer_token;
    use axum::http::{HeaderMap, HeaderValue, Method, Uri};

    fn parts_with_auth(value: Option<&str>) -> axum::http::request::Parts {
        let mut headers = HeaderMap::new();
        if let Some(v) = value {
            headers.insert("authorization", HeaderValue::from_str(v).unwrap());
        }
        let mut req = axum::http::Request::builder()
            .method(Method::GET)
            .uri(Uri::from_static("/status"))
            .body(())
            .unwrap();
        *req.headers_mut() = headers;
        req.into_parts().0
    }

    #[test]
    fn extracts_bearer_token() {
        let mut parts = parts_with_auth(Some("Bearer abc123"));
        assert_eq!(bearer_token(&mut parts), Some("abc123".to_string()));
    }

    #[test]
    fn rejects_missing_header() {
        let mut parts = parts_with_auth(None);
        assert_eq!(bearer_token(&mut parts), None);
    }

    #[test]
    fn rejects_non_bearer_scheme() {
        let mut parts = parts_with_auth(Some("Basic abc123"));
        assert_eq!(bearer_token(&mut parts), None);
    }
}
