//! Long-poll subscription manager: parks device HTTP responses
//! until relevant objects advance.
//!
//! Grounded on the reference server's `DashMap`-keyed registry pattern
//! (`actors::ActorRegistry`), substituting a `tokio::sync::oneshot` sender
//! per parked response for the `ActorRef` the reference caches — a parked
//! subscription must not occupy a worker, so it lives as a table entry plus
//! a deadline, not a blocked task.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;

use crate::model::{Object, ObjectWire, ProbedObject, Subscription, SubscriptionOutcome};
use crate::state::service::is_server_newer;

/// Result of a single `add` call.
pub enum AddOutcome {
    Parked,
    RateLimited,
}

/// Result of a `notify`/`notify_all` call: how many parked subscriptions
/// were woken, and how many were removed from the table (wakeups plus
/// already-expired entries reaped along the way).
#[derive(Debug, Clone, Copy, Default)]
pub struct NotifyResult {
    pub notified: usize,
    pub removed: usize,
}

pub struct SubscriptionManager {
    /// `serial -> parked list`. The `Mutex` enforces the total write order
    /// the behavior described below/§5 require: all reads and writes to one serial's parked
    /// list, and the deltas its subscribers observe, respect submission
    /// order.
    table: DashMap<String, Arc<Mutex<Vec<Subscription>>>>,
    max_per_device: usize,
    timeout: Duration,
}

impl SubscriptionManager {
    pub fn new(max_per_device: usize, timeout: Duration) -> Self {
        Self {
            table: DashMap::new(),
            max_per_device,
            timeout,
        }
    }

    fn slot(&self, serial: &str) -> Arc<Mutex<Vec<Subscription>>> {
        self.table
            .entry(serial.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Vec::new())))
            .clone()
    }

    /// Park `subscription`, rejecting with `RateLimited` if the device is
    /// already at `MAX_SUBSCRIPTIONS_PER_DEVICE`.
    pub async fn add(&self, subscription: Subscription) -> AddOutcome {
        let slot = self.slot(&subscription.serial);
        let mut guard = slot.lock().await;
        if guard.len() >= self.max_per_device {
            return AddOutcome::RateLimited;
        }
        metrics::counter!("gateway_subscriptions_parked_total", 1);
        guard.push(subscription);
        AddOutcome::Parked
    }

    pub fn new_deadline(&self) -> Instant {
        Instant::now() + self.timeout
    }

    /// Wake every subscription parked on `serial` whose declared interest
    /// list is now outdated relative to `object`. Returns how many were
    /// notified and how many were removed from the table in the process
    /// (notified + any stale/closed entries reaped along the way).
    pub async fn notify(&self, serial: &str, object: &Object) -> NotifyResult {
        self.notify_all(serial, std::slice::from_ref(object)).await
    }

    /// Batch form of [`notify`](Self::notify) — used by the `put` handler,
    /// which writes several objects in one request and must wake every
    /// subscriber once, not once per object.
    pub async fn notify_all(&self, serial: &str, objects: &[Object]) -> NotifyResult {
        let Some(slot) = self.table.get(serial).map(|e| e.clone()) else {
            return NotifyResult::default();
        };

        let mut guard = slot.lock().await;
        let mut result = NotifyResult::default();
        let mut remaining = Vec::with_capacity(guard.len());

        for mut sub in guard.drain(..) {
            if sub.responder.is_none() {
                result.removed += 1;
                continue;
            }

            let outdated: Vec<ObjectWire> = objects
                .iter()
                .filter(|object| subscription_cares_about(&sub, object))
                .map(Object::as_wire)
                .collect();

            if outdated.is_empty() {
                remaining.push(sub);
                continue;
            }

            if let Some(responder) = sub.responder.take() {
                let _ = responder.send(SubscriptionOutcome::with_objects(outdated));
            }
            result.notified += 1;
            result.removed += 1;
        }

        *guard = remaining;
        if result.notified > 0 {
            metrics::counter!("gateway_subscriptions_notified_total", result.notified as u64);
        }
        result
    }

    /// Sweep every serial's parked list, closing (and removing) any
    /// subscription past its deadline with an empty result. Run
    /// periodically by `jobs::subscription_sweeper`.
    pub async fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut reaped = 0usize;

        for entry in self.table.iter() {
            let slot = entry.value().clone();
            let mut guard = slot.lock().await;
            let mut remaining = Vec::with_capacity(guard.len());
            for mut sub in guard.drain(..) {
                if sub.is_expired(now) {
                    if let Some(responder) = sub.responder.take() {
                        let _ = responder.send(SubscriptionOutcome::empty());
                    }
                    reaped += 1;
                } else {
                    remaining.push(sub);
                }
            }
            *guard = remaining;
        }

        if reaped > 0 {
            metrics::counter!("gateway_subscription_timeouts_total", reaped as u64);
        }
        reaped
    }

    /// Drain every parked subscription with an empty result. Called during
    /// process shutdown; the caller is responsible for giving in-flight
    /// transport writes a bounded window to observe the close before exit.
    pub async fn shutdown(&self) {
        for entry in self.table.iter() {
            let slot = entry.value().clone();
            let mut guard = slot.lock().await;
            for mut sub in guard.drain(..) {
                if let Some(responder) = sub.responder.take() {
                    let _ = responder.send(SubscriptionOutcome::empty());
                }
            }
        }
    }

    /// Total parked subscriptions across all devices — used by the health
    /// endpoint as a load signal.
    pub fn total_parked(&self) -> usize {
        // Best-effort snapshot; a subscription mid-notify may be briefly
        // double-counted or missed, which is fine for a health gauge.
        self.table
            .iter()
            .map(|entry| entry.value().try_lock().map(|g| g.len()).unwrap_or(0))
            .sum()
    }

    #[cfg(test)]
    pub async fn parked_count(&self, serial: &str) -> usize {
        match self.table.get(serial) {
            Some(slot) => slot.lock().await.len(),
            None => 0,
        }
    }
}

/// `true` iff the subscription declared interest in `object.object_key` with
/// a client revision/timestamp that `object`'s current server state now
/// dominates (the behavior described below `is_server_newer`).
fn subscription_cares_about(sub: &Subscription, object: &Object) -> bool {
    sub.interests.iter().any(|interest: &ProbedObject| {
        interest.object_key == object.object_key
            && is_server_newer(object, interest.object_revision, interest.object_timestamp)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(serial: &str, key: &str, rev: i64, ts: i64) -> Object {
        Object {
            serial: serial.into(),
            object_key: key.into(),
            object_revision: rev,
            object_timestamp: ts,
            value: json!({"ok": true}),
            updated_at: chrono::Utc::now(),
        }
    }

    fn park(serial: &str, key: &str, client_rev: i64, client_ts: i64) -> (Subscription, oneshot::Receiver<SubscriptionOutcome>) {
        let (tx, rx) = oneshot::channel();
        let sub = Subscription {
            session: None,
            serial: serial.into(),
            interests: vec![ProbedObject {
                object_key: key.into(),
                object_revision: client_rev,
                object_timestamp: client_ts,
                value: None,
            }],
            connected_at: Instant::now(),
            deadline: Instant::now() + Duration::from_secs(300),
            responder: Some(tx),
        };
        (sub, rx)
    }

    #[tokio::test]
    async fn notify_wakes_only_subscribers_whose_interest_is_stale() {
        let mgr = SubscriptionManager::new(4, Duration::from_secs(300));
        let (sub, rx) = park("ABC", "shared.ABC", 5, 1000);
        mgr.add(sub).await;

        let result = mgr.notify("ABC", &object("ABC", "shared.ABC", 5, 1000)).await;
        assert_eq!(result.notified, 0);
        assert_eq!(mgr.parked_count("ABC").await, 1);

        let result = mgr.notify("ABC", &object("ABC", "shared.ABC", 6, 1000)).await;
        assert_eq!(result.notified, 1);
        assert_eq!(mgr.parked_count("ABC").await, 0);

        let outcome = rx.await.unwrap();
        assert_eq!(outcome.objects[0].object_revision, 6);
    }

    #[tokio::test]
    async fn add_enforces_per_device_cap() {
        let mgr = SubscriptionManager::new(1, Duration::from_secs(300));
        let (sub1, _rx1) = park("ABC", "shared.ABC", 0, 0);
        let (sub2, _rx2) = park("ABC", "shared.ABC", 0, 0);
        assert!(matches!(mgr.add(sub1).await, AddOutcome::Parked));
        assert!(matches!(mgr.add(sub2).await, AddOutcome::RateLimited));
    }

    #[tokio::test]
    async fn sweep_closes_expired_subscriptions_with_empty_result() {
        let mgr = SubscriptionManager::new(4, Duration::from_millis(0));
        let (sub, rx) = park("ABC", "shared.ABC", 0, 0);
        mgr.add(sub).await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        let reaped = mgr.sweep_expired().await;
        assert_eq!(reaped, 1);
        let outcome = rx.await.unwrap();
        assert!(outcome.objects.is_empty());
    }

    #[tokio::test]
    async fn shutdown_drains_all_parked_subscriptions() {
        let mgr = SubscriptionManager::new(4, Duration::from_secs(300));
        let (sub, rx) = park("ABC", "shared.ABC", 0, 0);
        mgr.add(sub).await;
        mgr.shutdown().await;
        let outcome = rx.await.unwrap();
        assert!(outcome.objects.is_empty());
    }
}
