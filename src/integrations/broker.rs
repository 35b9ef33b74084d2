//! The canonical message-broker `Integration`: publishes object
//! changes as both a raw-object topic shape and a normalized discovery
//! shape, and subscribes to inbound command topics to translate dashboard-
//! style commands back into device state.
//!
//! No MQTT crate appears anywhere in the retrieved reference pack;
//! `rumqttc` is the actively-maintained ecosystem MQTT client, used here as
//! the natural substitute (see DESIGN.md).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, LastWill, MqttOptions, Packet, QoS};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::model::IntegrationConfig;

use super::{CommandSink, Integration};

pub const BROKER_TYPE: &str = "mqtt_broker";

#[derive(Debug, Clone, Deserialize)]
struct BrokerConfig {
    broker_url: String,
    #[serde(default = "default_port")]
    broker_port: u16,
    #[serde(default = "default_prefix")]
    topic_prefix: String,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

fn default_port() -> u16 {
    1883
}

fn default_prefix() -> String {
    "nest".to_string()
}

pub fn build_integration(
    config: &IntegrationConfig,
    command_sink: Option<Arc<dyn CommandSink>>,
) -> anyhow::Result<Arc<dyn Integration>> {
    match config.r#type.as_str() {
        BROKER_TYPE => {
            let parsed: BrokerConfig = serde_json::from_value(config.config.clone())?;
            Ok(Arc::new(BrokerIntegration::new(
                config.user_id.clone(),
                parsed,
                command_sink,
            )))
        }
        other => anyhow::bail!("unsupported integration type: {other}"),
    }
}

/// Maps `object_key`'s prefix to the raw-topic `object_type` segment and, if
/// recognized, a normalized discovery capability for each top-level field.
fn capability_for_field(object_type: &str, field: &str) -> Option<&'static str> {
    match (object_type, field) {
        ("device", "away") | ("user", "away") => Some("presence/away"),
        ("shared", "target_temperature") => Some("climate/target_temperature"),
        ("shared", "target_temperature_type") => Some("climate/mode"),
        ("device", "fan_mode") | ("device", "fan_control_state") => Some("fan/mode"),
        ("weather", _) => Some("weather/current"),
        _ => None,
    }
}

pub struct BrokerIntegration {
    user_id: String,
    config: BrokerConfig,
    client: Mutex<Option<AsyncClient>>,
    command_sink: Option<Arc<dyn CommandSink>>,
}

impl BrokerIntegration {
    fn new(user_id: String, config: BrokerConfig, command_sink: Option<Arc<dyn CommandSink>>) -> Self {
        Self {
            user_id,
            config,
            client: Mutex::new(None),
            command_sink,
        }
    }

    fn availability_topic(&self) -> String {
        format!("{}/availability", self.config.topic_prefix)
    }

    fn command_topic_filter(&self) -> String {
        format!("{}/+/cmd/+", self.config.topic_prefix)
    }

    fn raw_topics(&self, serial: &str, object_type: &str, field: Option<&str>) -> String {
        match field {
            Some(field) => format!("{}/{}/{}/{}", self.config.topic_prefix, serial, object_type, field),
            None => format!("{}/{}/{}", self.config.topic_prefix, serial, object_type),
        }
    }

    fn discovery_topic(&self, serial: &str, capability: &str) -> String {
        format!("{}/{}/ha/{}", self.config.topic_prefix, serial, capability)
    }
}

#[async_trait]
impl Integration for BrokerIntegration {
    async fn initialize(&self) -> anyhow::Result<()> {
        let client_id = format!("thermo-gateway-{}", self.user_id);
        let mut options = MqttOptions::new(client_id, self.config.broker_url.clone(), self.config.broker_port);
        options.set_keep_alive(Duration::from_secs(30));
        if let (Some(username), Some(password)) = (&self.config.username, &self.config.password) {
            options.set_credentials(username.clone(), password.clone());
        }
        options.set_last_will(LastWill::new(
            self.availability_topic(),
            "offline",
            QoS::AtLeastOnce,
            true,
        ));

        let (client, mut event_loop) = AsyncClient::new(options, 64);
        client
            .publish(self.availability_topic(), QoS::AtLeastOnce, true, "online")
            .await?;
        client
            .subscribe(self.command_topic_filter(), QoS::AtLeastOnce)
            .await?;

        let user_id = self.user_id.clone();
        let command_sink = self.command_sink.clone();
        let prefix = self.config.topic_prefix.clone();
        tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        handle_inbound_command(&prefix, &user_id, &command_sink, &publish.topic, &publish.payload)
                            .await;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!(user_id = %user_id, error = %err, "mqtt event loop error");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        });

        *self.client.lock().await = Some(client);
        Ok(())
    }

    async fn on_state_change(
        &self,
        serial: &str,
        key: &str,
        revision: i64,
        timestamp: i64,
        value: &Value,
    ) -> anyhow::Result<()> {
        let guard = self.client.lock().await;
        let Some(client) = guard.as_ref() else {
            anyhow::bail!("broker client not initialized");
        };

        let object_type = key.split_once('.').map(|(p, _)| p).unwrap_or(key);
        let envelope = serde_json::json!({
            "object_revision": revision,
            "object_timestamp": timestamp,
            "value": value,
        });
        client
            .publish(
                self.raw_topics(serial, object_type, None),
                QoS::AtLeastOnce,
                false,
                envelope.to_string(),
            )
            .await?;

        if let Value::Object(fields) = value {
            for (field, field_value) in fields {
                client
                    .publish(
                        self.raw_topics(serial, object_type, Some(field)),
                        QoS::AtLeastOnce,
                        false,
                        field_value.to_string(),
                    )
                    .await?;

                if let Some(capability) = capability_for_field(object_type, field) {
                    client
                        .publish(
                            self.discovery_topic(serial, capability),
                            QoS::AtLeastOnce,
                            false,
                            field_value.to_string(),
                        )
                        .await?;
                }
            }
        }

        Ok(())
    }

    async fn on_device_connected(&self, serial: &str) -> anyhow::Result<()> {
        let guard = self.client.lock().await;
        if let Some(client) = guard.as_ref() {
            client
                .publish(
                    format!("{}/{}/connected", self.config.topic_prefix, serial),
                    QoS::AtLeastOnce,
                    false,
                    "true",
                )
                .await?;
        }
        Ok(())
    }

    async fn on_device_disconnected(&self, serial: &str) -> anyhow::Result<()> {
        let guard = self.client.lock().await;
        if let Some(client) = guard.as_ref() {
            client
                .publish(
                    format!("{}/{}/connected", self.config.topic_prefix, serial),
                    QoS::AtLeastOnce,
                    false,
                    "false",
                )
                .await?;
        }
        Ok(())
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        let mut guard = self.client.lock().await;
        if let Some(client) = guard.take() {
            client
                .publish(self.availability_topic(), QoS::AtLeastOnce, true, "offline")
                .await?;
            client.disconnect().await?;
        }
        Ok(())
    }

    fn integration_type(&self) -> &'static str {
        BROKER_TYPE
    }
}

/// `{prefix}/{serial}/cmd/{field}` -> `DeviceStateService::upsert` on
/// `shared.{serial}`, after checking `user_id` owns or shares `serial`.
async fn handle_inbound_command(
    prefix: &str,
    user_id: &str,
    command_sink: &Option<Arc<dyn CommandSink>>,
    topic: &str,
    payload: &[u8],
) {
    let Some(sink) = command_sink else { return };
    let Some(rest) = topic.strip_prefix(&format!("{prefix}/")) else {
        return;
    };
    let mut parts = rest.splitn(3, '/');
    let (Some(serial), Some("cmd"), Some(field)) = (parts.next(), parts.next(), parts.next()) else {
        return;
    };

    if !sink.is_authorized(user_id, serial).await {
        tracing::warn!(user_id, serial, "inbound command rejected: not authorized");
        return;
    }

    let Ok(raw) = std::str::from_utf8(payload) else {
        return;
    };
    let value: Value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));

    if let Err(err) = sink
        .apply_command(serial, "shared", serde_json::json!({ field: value }))
        .await
    {
        tracing::warn!(user_id, serial, field, error = %err, "failed to apply inbound command");
    }
}
