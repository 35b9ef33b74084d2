//! `POST /nest/transport` — the protocol's core reconciliation endpoint:
//! processes device-originated updates, classifies subscription probes
//! against current server state, and optionally parks the response as a
//! long-poll.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::app_state::AppState;
use crate::device_utils::{DeviceSerial, DEVICE_IDENTITY_HEADER};
use crate::error::Error;
use crate::model::{Object, ObjectWire, ProbedObject, Subscription, SubscriptionOutcome};
use crate::state::service::is_server_newer;
use crate::state::value::{empty_object, merge_values};
use crate::subscription::AddOutcome;

use super::common::apply_update;

const SERVER_TIMESTAMP_HEADER: &str = "x-server-timestamp";
const SUBSCRIBE_RATE_LIMIT_RETRY_SECS: u64 = 5;

#[derive(Debug, Deserialize)]
pub struct SubscribeRequest {
    pub session: Option<String>,
    #[serde(default)]
    pub chunked: bool,
    pub objects: Vec<ProbedObject>,
}

#[derive(Debug, Serialize)]
struct SubscribeResponse {
    objects: Vec<ObjectWire>,
}

/// `true` iff an incoming probe is actually a device-originated update: it
/// carries a value and the probe's revision/timestamp are both zero
/// (per spec §4.D step 1 — absent fields default to zero via `ProbedObject`'s
/// `#[serde(default)]`, collapsing "both absent" into this same check).
fn is_update(probed: &ProbedObject) -> bool {
    probed.value.is_some() && probed.object_revision == 0 && probed.object_timestamp == 0
}

/// `true` iff the client-claimed revision/timestamp beat whatever the server
/// currently holds (or the server holds nothing at all).
fn client_is_newer(current: Option<&Object>, client_rev: i64, client_ts: i64) -> bool {
    match current {
        Some(object) => {
            client_rev > object.object_revision
                || (client_rev == object.object_revision && client_ts > object.object_timestamp)
        }
        None => true,
    }
}

pub async fn subscribe(
    State(state): State<AppState>,
    DeviceSerial(serial): DeviceSerial,
    headers: HeaderMap,
    Json(body): Json<SubscribeRequest>,
) -> Response {
    let device_identity = headers
        .get(DEVICE_IDENTITY_HEADER)
        .and_then(|v| v.to_str().ok());
    let now_ms = chrono::Utc::now().timestamp_millis();

    let mut outdated: Vec<ObjectWire> = Vec::new();
    let mut probe_interests: Vec<ProbedObject> = Vec::new();

    for probed in body.objects {
        if is_update(&probed) {
            let value = probed.value.clone().unwrap_or_else(empty_object);
            let object = apply_update(
                &state,
                &serial,
                &probed.object_key,
                value,
                device_identity,
                now_ms,
            )
            .await;
            outdated.push(object.as_wire());
            continue;
        }

        let current = state.state.get(&serial, &probed.object_key).await.ok().flatten();

        if probed.object_revision == 0 && probed.object_timestamp == 0 {
            if let Some(object) = &current {
                outdated.push(object.as_wire());
            }
            continue;
        }

        if let Some(object) = &current {
            if is_server_newer(object, probed.object_revision, probed.object_timestamp) {
                outdated.push(object.as_wire());
                continue;
            }
        }

        if client_is_newer(current.as_ref(), probed.object_revision, probed.object_timestamp) {
            let prior_value = current
                .as_ref()
                .map(|o| o.value.clone())
                .unwrap_or_else(empty_object);
            let client_value = probed.value.clone().unwrap_or_else(empty_object);
            let merged = merge_values(&prior_value, &client_value);
            state
                .state
                .upsert(
                    &serial,
                    &probed.object_key,
                    probed.object_revision,
                    probed.object_timestamp,
                    merged,
                )
                .await;
            continue;
        }

        probe_interests.push(probed);
    }

    if !outdated.is_empty() {
        let mut response =
            (StatusCode::OK, Json(SubscribeResponse { objects: outdated })).into_response();
        if let Ok(value) = HeaderValue::from_str(&now_ms.to_string()) {
            response
                .headers_mut()
                .insert(HeaderName::from_static(SERVER_TIMESTAMP_HEADER), value);
        }
        return response;
    }

    if !body.chunked {
        return StatusCode::OK.into_response();
    }

    let (responder, receiver) = oneshot::channel();
    let deadline = state.subscriptions.new_deadline();
    let subscription = Subscription {
        session: body.session,
        serial: serial.clone(),
        interests: probe_interests,
        connected_at: Instant::now(),
        deadline,
        responder: Some(responder),
    };

    match state.subscriptions.add(subscription).await {
        AddOutcome::RateLimited => {
            return Error::RateLimited {
                retry_after_secs: SUBSCRIBE_RATE_LIMIT_RETRY_SECS,
            }
            .into_response();
        }
        AddOutcome::Parked => {}
    }

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::TRANSFER_ENCODING, "chunked")
        .body(Body::from_stream(ChunkedSubscriptionBody::new(receiver)))
        .unwrap_or_else(|_| Error::Internal("failed to build chunked response".into()).into_response())
}

/// Hand-rolled chunked body: emits one empty keep-alive chunk immediately,
/// then a single JSON chunk once the parked subscription's oneshot resolves
/// (by notify or by the sweeper's timeout close), then ends the stream. No
/// `async-stream` dependency — a 3-state poll is simple enough to write by
/// hand and keeps the dependency list aligned with what the rest of the
/// crate actually uses.
enum ChunkedState {
    KeepAlive(oneshot::Receiver<SubscriptionOutcome>),
    Waiting(oneshot::Receiver<SubscriptionOutcome>),
    Done,
}

struct ChunkedSubscriptionBody {
    state: ChunkedState,
}

impl ChunkedSubscriptionBody {
    fn new(receiver: oneshot::Receiver<SubscriptionOutcome>) -> Self {
        Self {
            state: ChunkedState::KeepAlive(receiver),
        }
    }
}

impl Stream for ChunkedSubscriptionBody {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match std::mem::replace(&mut this.state, ChunkedState::Done) {
            ChunkedState::KeepAlive(receiver) => {
                this.state = ChunkedState::Waiting(receiver);
                Poll::Ready(Some(Ok(Bytes::new())))
            }
            ChunkedState::Waiting(mut receiver) => match Pin::new(&mut receiver).poll(cx) {
                Poll::Ready(Ok(outcome)) => {
                    this.state = ChunkedState::Done;
                    let body = serde_json::to_vec(&SubscribeResponse {
                        objects: outcome.objects,
                    })
                    .unwrap_or_default();
                    Poll::Ready(Some(Ok(Bytes::from(body))))
                }
                Poll::Ready(Err(_)) => {
                    this.state = ChunkedState::Done;
                    Poll::Ready(None)
                }
                Poll::Pending => {
                    this.state = ChunkedState::Waiting(receiver);
                    Poll::Pending
                }
            },
            ChunkedState::Done => Poll::Ready(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(rev: i64, ts: i64) -> Object {
        Object {
            serial: "ABC".into(),
            object_key: "shared.ABC".into(),
            object_revision: rev,
            object_timestamp: ts,
            value: json!({}),
            updated_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn zero_zero_with_value_is_an_update() {
        let probed = ProbedObject {
            object_key: "device.ABC".into(),
            object_revision: 0,
            object_timestamp: 0,
            value: Some(json!({"away": true})),
        };
        assert!(is_update(&probed));
    }

    #[test]
    fn nonzero_revision_with_value_is_not_an_update() {
        let probed = ProbedObject {
            object_key: "shared.ABC".into(),
            object_revision: 3,
            object_timestamp: 100,
            value: Some(json!({"t": 20})),
        };
        assert!(!is_update(&probed));
    }

    #[test]
    fn client_is_newer_than_missing_server_object() {
        assert!(client_is_newer(None, 1, 0));
    }

    #[test]
    fn client_is_newer_by_revision() {
        assert!(client_is_newer(Some(&obj(5, 1000)), 6, 0));
    }

    #[test]
    fn client_is_not_newer_when_equal() {
        assert!(!client_is_newer(Some(&obj(5, 1000)), 5, 1000));
    }
}
