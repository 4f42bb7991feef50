//! ThingsBoard MQTT gateway client.
//!
//! One MQTT session authenticated with the gateway access token carries all
//! sub-device traffic. A background task drives the `rumqttc` event loop,
//! renews the RPC subscriptions on every CONNACK and answers RPC requests
//! through the [`CommandChannel`].

use super::{DiscoveryAttributes, TelemetryEnvelope, TelemetrySink, TransportError};
use crate::command::{CommandChannel, DEVICE_RPC_REQUEST_FILTER, GATEWAY_RPC_TOPIC};
use futures::FutureExt;
use futures::future::BoxFuture;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use serde_json::{Map, Value, json};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub const CONNECT_TOPIC: &str = "v1/gateway/connect";
pub const DISCONNECT_TOPIC: &str = "v1/gateway/disconnect";
pub const ATTRIBUTES_TOPIC: &str = "v1/gateway/attributes";
pub const TELEMETRY_TOPIC: &str = "v1/gateway/telemetry";

const KEEP_ALIVE: Duration = Duration::from_secs(60);
const CONNACK_TIMEOUT: Duration = Duration::from_secs(10);
const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const REQUEST_CAPACITY: usize = 64;

/// Where and as whom to connect.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayConfig {
    pub server: String,
    pub port: u16,
    /// Gateway device access token, sent as the MQTT username
    pub token: String,
}

/// `{"device": name}` for the connect and disconnect topics.
pub fn device_payload(name: &str) -> Value {
    json!({ "device": name })
}

/// `{name: attributes}`
pub fn attributes_payload(
    name: &str,
    attributes: &DiscoveryAttributes,
) -> Result<Value, TransportError> {
    let mut body = Map::new();
    body.insert(name.to_string(), serde_json::to_value(attributes)?);
    Ok(Value::Object(body))
}

/// `{name: [{ts, values}]}`
pub fn telemetry_payload(
    name: &str,
    envelope: &TelemetryEnvelope,
) -> Result<Value, TransportError> {
    let mut body = Map::new();
    body.insert(
        name.to_string(),
        Value::Array(vec![serde_json::to_value(envelope)?]),
    );
    Ok(Value::Object(body))
}

pub struct GatewayClient {
    client: AsyncClient,
    events: JoinHandle<()>,
}

impl GatewayClient {
    /// Open the session and wait for the broker to accept it.
    pub async fn connect(
        config: &GatewayConfig,
        commands: CommandChannel,
    ) -> Result<Self, TransportError> {
        let client_id = format!("tb-ble-bridge-{}", std::process::id());
        let mut options = MqttOptions::new(client_id, config.server.as_str(), config.port);
        options.set_keep_alive(KEEP_ALIVE);
        options.set_credentials(config.token.as_str(), "");

        log::info!("Connecting to gateway at {}:{}", config.server, config.port);
        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let (ready_tx, ready_rx) = oneshot::channel();
        let events = tokio::spawn(drive(eventloop, client.clone(), commands, ready_tx));

        let outcome = match tokio::time::timeout(CONNACK_TIMEOUT, ready_rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err("event loop stopped".to_string()),
            Err(_) => Err(format!("no CONNACK within {CONNACK_TIMEOUT:?}")),
        };

        match outcome {
            Ok(()) => Ok(Self { client, events }),
            Err(reason) => {
                events.abort();
                Err(TransportError::Connect(format!(
                    "{}:{}: {reason}",
                    config.server, config.port
                )))
            }
        }
    }

    /// Close the MQTT session and wait for the event loop to send DISCONNECT.
    pub async fn disconnect(mut self) {
        if let Err(e) = self.client.disconnect().await {
            log::warn!("Failed to disconnect from gateway: {e}");
            return;
        }
        match tokio::time::timeout(DISCONNECT_TIMEOUT, &mut self.events).await {
            Ok(Ok(())) => log::info!("Gateway session closed"),
            Ok(Err(e)) => log::warn!("Gateway event loop failed: {e}"),
            Err(_) => log::warn!("DISCONNECT not sent within {DISCONNECT_TIMEOUT:?}"),
        }
    }

    async fn publish_json(&self, topic: &str, payload: Value) -> Result<(), TransportError> {
        let bytes = serde_json::to_vec(&payload)?;
        log::debug!("{topic} <- {payload}");
        self.client
            .publish(topic, QoS::AtLeastOnce, false, bytes)
            .await
            .map_err(|e| TransportError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }
}

impl Drop for GatewayClient {
    fn drop(&mut self) {
        self.events.abort();
    }
}

impl TelemetrySink for GatewayClient {
    fn register_device<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<(), TransportError>> {
        self.publish_json(CONNECT_TOPIC, device_payload(name)).boxed()
    }

    fn send_attributes<'a>(
        &'a self,
        name: &'a str,
        attributes: &'a DiscoveryAttributes,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        async move {
            let payload = attributes_payload(name, attributes)?;
            self.publish_json(ATTRIBUTES_TOPIC, payload).await
        }
        .boxed()
    }

    fn send_telemetry<'a>(
        &'a self,
        name: &'a str,
        envelope: &'a TelemetryEnvelope,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        async move {
            let payload = telemetry_payload(name, envelope)?;
            self.publish_json(TELEMETRY_TOPIC, payload).await
        }
        .boxed()
    }

    fn unregister_device<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<(), TransportError>> {
        self.publish_json(DISCONNECT_TOPIC, device_payload(name)).boxed()
    }
}

/// Drive the MQTT event loop until DISCONNECT is sent or the task is aborted.
///
/// Reports the outcome of the first connection attempt on `ready`; after
/// that, connection errors are logged and the loop reconnects.
async fn drive(
    mut eventloop: EventLoop,
    client: AsyncClient,
    commands: CommandChannel,
    ready: oneshot::Sender<Result<(), String>>,
) {
    let mut ready = Some(ready);

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                log::info!("Gateway session established");
                for filter in [DEVICE_RPC_REQUEST_FILTER, GATEWAY_RPC_TOPIC] {
                    if let Err(e) = client.try_subscribe(filter, QoS::AtLeastOnce) {
                        log::error!("Failed to subscribe to {filter}: {e}");
                    }
                }
                if let Some(ready) = ready.take() {
                    let _ = ready.send(Ok(()));
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                answer_rpc(&client, &commands, &publish.topic, &publish.payload);
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => return,
            Ok(_) => {}
            Err(e) => {
                if let Some(ready) = ready.take() {
                    let _ = ready.send(Err(e.to_string()));
                    return;
                }
                log::warn!("Gateway connection error: {e}");
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

fn answer_rpc(client: &AsyncClient, commands: &CommandChannel, topic: &str, payload: &[u8]) {
    let reply = match commands.on_message(topic, payload) {
        Ok(reply) => reply,
        Err(e) => {
            log::warn!("Dropping message on {topic}: {e}");
            return;
        }
    };

    let body = match serde_json::to_vec(&reply.payload) {
        Ok(body) => body,
        Err(e) => {
            log::error!("Failed to encode RPC reply: {e}");
            return;
        }
    };
    if let Err(e) = client.try_publish(reply.topic.as_str(), QoS::AtLeastOnce, false, body) {
        log::error!("Failed to send RPC reply on {}: {e}", reply.topic);
    }
}
