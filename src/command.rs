//! Inbound RPC handling.
//!
//! Requests reach the bridge either addressed to the gateway device itself
//! (`v1/devices/me/rpc/request/<id>`) or through the gateway RPC topic. The
//! only supported method is `doRescan`, which schedules a rescan and is
//! acknowledged immediately; the rescan itself runs on the main loop.

use crate::signal::RescanSignal;
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;

/// Subscription filter for RPC requests addressed to the gateway device.
pub const DEVICE_RPC_REQUEST_FILTER: &str = "v1/devices/me/rpc/request/+";

/// RPC requests relayed to sub-devices; also carries the replies.
pub const GATEWAY_RPC_TOPIC: &str = "v1/gateway/rpc";

const DEVICE_RPC_REQUEST_PREFIX: &str = "v1/devices/me/rpc/request/";
const DEVICE_RPC_RESPONSE_PREFIX: &str = "v1/devices/me/rpc/response/";

pub const RESCAN_METHOD: &str = "doRescan";

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("not an RPC topic: {0}")]
    UnknownTopic(String),
    #[error("malformed RPC body: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// An RPC call, independent of the topic it came in on.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Deserialize)]
struct GatewayRpc {
    device: String,
    data: GatewayRpcData,
}

#[derive(Debug, Deserialize)]
struct GatewayRpcData {
    id: Value,
    method: String,
    #[serde(default)]
    params: Value,
}

/// Response to publish for a handled request.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub topic: String,
    pub payload: Value,
}

/// Turns RPC requests into signals for the main loop.
#[derive(Debug, Clone)]
pub struct CommandChannel {
    rescan: RescanSignal,
}

impl CommandChannel {
    pub fn new(rescan: RescanSignal) -> Self {
        Self { rescan }
    }

    /// Dispatch one request and build its result body.
    pub fn handle(&self, request: &RpcRequest) -> Value {
        match request.method.as_str() {
            RESCAN_METHOD => {
                log::info!("Rescan requested over RPC");
                self.rescan.request();
                json!({ "rescan": "scheduled" })
            }
            other => {
                log::warn!("Unsupported RPC method '{other}' (params: {})", request.params);
                json!({ "error": "unsupported method" })
            }
        }
    }

    /// Handle a raw MQTT message, returning where and what to reply.
    pub fn on_message(&self, topic: &str, payload: &[u8]) -> Result<Reply, CommandError> {
        if let Some(request_id) = topic.strip_prefix(DEVICE_RPC_REQUEST_PREFIX) {
            let request: RpcRequest = serde_json::from_slice(payload)?;
            log::debug!("RPC {request_id}: {request:?}");
            return Ok(Reply {
                topic: format!("{DEVICE_RPC_RESPONSE_PREFIX}{request_id}"),
                payload: self.handle(&request),
            });
        }

        if topic == GATEWAY_RPC_TOPIC {
            let rpc: GatewayRpc = serde_json::from_slice(payload)?;
            log::debug!("Gateway RPC {} for {}: {}", rpc.data.id, rpc.device, rpc.data.method);
            let request = RpcRequest {
                method: rpc.data.method,
                params: rpc.data.params,
            };
            return Ok(Reply {
                topic: GATEWAY_RPC_TOPIC.to_string(),
                payload: json!({
                    "device": rpc.device,
                    "id": rpc.data.id,
                    "data": self.handle(&request),
                }),
            });
        }

        Err(CommandError::UnknownTopic(topic.to_string()))
    }
}
