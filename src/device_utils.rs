//! Device-serial resolution: every device-facing request carries its serial
//! either in a device-identity header or in the client certificate's CN.
//! Requests that resolve to neither receive 401.

use axum::extract::FromRequestParts;
use axum::http::{request::Parts, HeaderMap};

use crate::error::Error;

/// The firmware's identity header. Its value is a pipe-delimited identifier
/// whose first segment is the device serial, e.g. `ABC123|rev4|us`.
pub const DEVICE_IDENTITY_HEADER: &str = "x-nl-device-id";

/// Extension type inserted by the TLS-accepting layer when a client
/// certificate was presented; `subject_cn` is the certificate's Subject
/// Common Name.
#[derive(Debug, Clone)]
pub struct ClientCertIdentity {
    pub subject_cn: String,
}

/// Resolve the requesting device's serial from the identity header, falling
/// back to the client certificate's CN. Returns `None` if neither is
/// present or well-formed — the caller maps that to a 401.
pub fn resolve_serial(headers: &HeaderMap, client_cert: Option<&ClientCertIdentity>) -> Option<String> {
    if let Some(value) = headers.get(DEVICE_IDENTITY_HEADER) {
        if let Ok(raw) = value.to_str() {
            if let Some(serial) = parse_device_identity_header(raw) {
                return Some(serial);
            }
        }
    }

    client_cert
        .map(|cert| cert.subject_cn.trim())
        .filter(|cn| !cn.is_empty())
        .map(str::to_string)
}

/// The identity header's first `|`-delimited segment is the serial; it must
/// be non-empty and free of path-unsafe characters.
fn parse_device_identity_header(raw: &str) -> Option<String> {
    let serial = raw.split('|').next()?.trim();
    if serial.is_empty() || !serial.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(serial.to_string())
}

/// Extractor pulling the resolved device serial out of a request, or
/// rejecting with 401 when neither the identity header nor a client
/// certificate identifies the caller.
#[derive(Debug, Clone)]
pub struct DeviceSerial(pub String);

impl<S> FromRequestParts<S> for DeviceSerial
where
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let client_cert = parts.extensions.get::<ClientCertIdentity>();
        resolve_serial(&parts.headers, client_cert)
            .map(DeviceSerial)
            .ok_or_else(|| Error::Unauthorized("no device identity presented".into()))
    }
}
