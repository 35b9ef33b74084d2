//! Pluggable outbound integration fan-out.
//!
//! Directly grounded on the reference server's `fanout::MailboxBackend`
//! trait + `MailboxFactory`: the same shape, generalized from one fixed
//! CloudKit backend into a store-driven, per-`(user_id, type)`
//! hot-reloadable set reconciled on a periodic loop instead of being wired
//! once at startup. `DashMap` gives the reconciliation loop and the hot
//! `notify` fan-out path lock-free concurrent access to the loaded set, the
//! same pattern the reference's `ActorRegistry` uses for actors.

pub mod broker;

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use crate::model::IntegrationConfig;
use crate::store::StateStore;

/// One loaded outbound adapter. Implementations translate internal object
/// events into an external protocol (message-broker topics, discovery
/// payloads) and translate inbound commands back into
/// `DeviceStateService::upsert` calls.
#[async_trait]
pub trait Integration: Send + Sync {
    async fn initialize(&self) -> anyhow::Result<()>;

    async fn on_state_change(
        &self,
        serial: &str,
        key: &str,
        revision: i64,
        timestamp: i64,
        value: &Value,
    ) -> anyhow::Result<()>;

    async fn on_device_connected(&self, serial: &str) -> anyhow::Result<()>;

    async fn on_device_disconnected(&self, serial: &str) -> anyhow::Result<()>;

    async fn shutdown(&self) -> anyhow::Result<()>;

    /// The integration type string this instance was constructed for
    /// (matches `IntegrationConfig::type`), used for logging.
    fn integration_type(&self) -> &'static str;
}

/// Narrow write surface an `Integration` needs to translate an inbound
/// command back into device state, without depending on the whole
/// `state::DeviceStateService` type (which itself holds an
/// `IntegrationManager`). Implemented by `DeviceStateService` in
/// `state/service.rs`.
#[async_trait]
pub trait CommandSink: Send + Sync {
    async fn apply_command(&self, serial: &str, key: &str, value: Value) -> anyhow::Result<()>;
    /// `true` iff `user_id` owns or has shared access to `serial` — checked
    /// before an inbound command topic is allowed to mutate state.
    async fn is_authorized(&self, user_id: &str, serial: &str) -> bool;
}

type IntegrationKey = (String, String); // (user_id, type)

struct LoadedIntegration {
    integration: Arc<dyn Integration>,
    /// Hash of the config blob this instance was constructed from, used to
    /// detect "both present, but config changed" during reconciliation
    /// without re-diffing the whole `Value` on every pass.
    config_fingerprint: String,
}

/// Holds every currently-loaded integration and reconciles the set against
/// `StateStore::list_all_enabled_integrations` on a periodic loop
/// (`jobs::integration_reconciler`, ~10s per the behavior described below).
pub struct IntegrationManager {
    loaded: DashMap<IntegrationKey, LoadedIntegration>,
    store: Option<Arc<dyn StateStore>>,
    command_sink: tokio::sync::OnceCell<Arc<dyn CommandSink>>,
}

impl IntegrationManager {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            loaded: DashMap::new(),
            store: Some(store),
            command_sink: tokio::sync::OnceCell::new(),
        }
    }

    /// An `IntegrationManager` with no backing store — fans out to nothing.
    /// Used by `DeviceStateService` unit tests that don't exercise the
    /// integration surface.
    pub fn new_inert() -> Self {
        Self {
            loaded: DashMap::new(),
            store: None,
            command_sink: tokio::sync::OnceCell::new(),
        }
    }

    /// Wires the `DeviceStateService` back in once it exists — `main.rs`
    /// constructs the `IntegrationManager` first (so it can hand a clone to
    /// `DeviceStateService::new`), then calls this once the service is
    /// built. Integrations loaded before this call simply can't accept
    /// inbound commands yet; reconciliation re-checks `command_sink()` on
    /// every subscribe, so there's no missed-wiring window in practice
    /// since `main.rs` wires it before binding any listener.
    pub fn set_command_sink(&self, sink: Arc<dyn CommandSink>) {
        let _ = self.command_sink.set(sink);
    }

    pub fn command_sink(&self) -> Option<Arc<dyn CommandSink>> {
        self.command_sink.get().cloned()
    }

    /// Fan `on_state_change` out to every loaded integration concurrently.
    /// Per-integration failures are logged and isolated — they must never
    /// propagate into the device-facing response path (the behavior described below/§7).
    pub fn notify(&self, serial: String, key: String, revision: i64, timestamp: i64, value: Value) {
        if self.loaded.is_empty() {
            return;
        }
        let integrations: Vec<Arc<dyn Integration>> = self
            .loaded
            .iter()
            .map(|entry| entry.value().integration.clone())
            .collect();

        tokio::spawn(async move {
            let mut handles = Vec::with_capacity(integrations.len());
            for integration in integrations {
                let serial = serial.clone();
                let key = key.clone();
                let value = value.clone();
                handles.push(tokio::spawn(async move {
                    let integration_type = integration.integration_type();
                    if let Err(err) = integration
                        .on_state_change(&serial, &key, revision, timestamp, &value)
                        .await
                    {
                        tracing::warn!(
                            serial, key, integration_type, error = %err,
                            "integration publish failed, isolated from caller"
                        );
                        metrics::counter!("gateway_integration_publish_failure_total", 1);
                    } else {
                        metrics::counter!("gateway_integration_publish_success_total", 1);
                    }
                }));
            }
            for handle in handles {
                let _ = handle.await;
            }
        });
    }

    /// One reconciliation pass: present-in-store-not-loaded ->
    /// construct+initialize; loaded-absent-from-store -> shutdown+remove;
    /// both-but-config-changed -> shutdown old, construct new.
    pub async fn reconcile(&self) {
        let Some(store) = &self.store else { return };
        let configs = match store.list_all_enabled_integrations().await {
            Ok(configs) => configs,
            Err(err) => {
                tracing::warn!(error = %err, "integration reconciliation: store read failed");
                return;
            }
        };

        let mut desired = std::collections::HashMap::with_capacity(configs.len());
        for config in configs {
            desired.insert(config.identity(), config);
        }

        let stale_keys: Vec<IntegrationKey> = self
            .loaded
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|key| !desired.contains_key(key))
            .collect();
        for key in stale_keys {
            if let Some((_, entry)) = self.loaded.remove(&key) {
                let _ = entry.integration.shutdown().await;
                tracing::info!(user_id = %key.0, integration_type = %key.1, "integration unloaded");
            }
        }

        for (key, config) in desired {
            let fingerprint = crate::crypto::hash_for_log(&config.config.to_string());
            let needs_reload = match self.loaded.get(&key) {
                None => true,
                Some(existing) => existing.config_fingerprint != fingerprint,
            };
            if !needs_reload {
                continue;
            }
            if let Some((_, existing)) = self.loaded.remove(&key) {
                let _ = existing.integration.shutdown().await;
            }

            match broker::build_integration(&config, self.command_sink()) {
                Ok(integration) => {
                    if let Err(err) = integration.initialize().await {
                        tracing::warn!(
                            user_id = %key.0, integration_type = %key.1, error = %err,
                            "integration initialization failed"
                        );
                        continue;
                    }
                    tracing::info!(user_id = %key.0, integration_type = %key.1, "integration loaded");
                    self.loaded.insert(
                        key,
                        LoadedIntegration {
                            integration,
                            config_fingerprint: fingerprint,
                        },
                    );
                }
                Err(err) => {
                    tracing::warn!(
                        user_id = %key.0, integration_type = %key.1, error = %err,
                        "unsupported integration type, skipped"
                    );
                }
            }
        }
    }

    pub fn loaded_count(&self) -> usize {
        self.loaded.len()
    }

    pub async fn shutdown(&self) {
        let keys: Vec<IntegrationKey> = self.loaded.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, entry)) = self.loaded.remove(&key) {
                let _ = entry.integration.shutdown().await;
            }
        }
    }
}
