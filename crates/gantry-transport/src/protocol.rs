//! Session wire protocol.
//!
//! Every websocket text message carries a `channel` field that routes it:
//! RPC frames travel on per-plugin secret channels, control operations on
//! the reserved `engine` channel. Binary messages belong to the most
//! recent text frame of the connection (see [`gantry_rpc::wire`]).

use serde::{Deserialize, Serialize};

use gantry_core::{Error, Result};
use gantry_rpc::{Packet, Reassembler, wire};

/// Reserved channel for session control operations.
pub const ENGINE_CHANNEL: &str = "engine";

/// Channel carrying frames a plugin worker emits.
pub fn from_plugin(secret: &str) -> String {
    format!("from_plugin_{secret}")
}

/// Channel carrying frames addressed to a plugin worker.
pub fn to_plugin(secret: &str) -> String {
    format!("to_plugin_{secret}")
}

/// Channel carrying plugin output towards the owning session.
pub fn message_from_plugin(secret: &str) -> String {
    format!("message_from_plugin_{secret}")
}

/// Channel carrying session input towards the plugin.
pub fn message_to_plugin(secret: &str) -> String {
    format!("message_to_plugin_{secret}")
}

/// Extracts the secret out of a channel name with the given prefix.
pub fn channel_secret<'a>(channel: &'a str, prefix: &str) -> Option<&'a str> {
    channel.strip_prefix(prefix)
}

// =============================================================================
// Control operations
// =============================================================================

/// Control operation sent on the `engine` channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op")]
pub enum ControlRequest {
    /// Authenticate the session against the engine token.
    #[serde(rename = "register_client")]
    RegisterClient {
        /// Client id; generated when absent.
        id: Option<String>,
        /// Target workspace, `"default"` when absent.
        workspace: Option<String>,
        /// Session id; generated when absent.
        session_id: Option<String>,
        /// Engine connection token.
        token: Option<String>,
    },

    /// Start (or resume) a plugin worker.
    #[serde(rename = "init_plugin")]
    InitPlugin {
        /// Plugin id chosen by the session.
        id: String,
        /// Plugin config (name, type, env, requirements, flags, ...).
        #[serde(default)]
        config: serde_json::Value,
    },

    /// Gracefully stop a plugin, force-killing after the timeout.
    #[serde(rename = "kill_plugin")]
    KillPlugin {
        /// Plugin id.
        id: String,
    },

    /// Kill a raw worker process by pid (admin use).
    #[serde(rename = "kill_plugin_process")]
    KillPluginProcess {
        /// OS process id.
        pid: u32,
        /// Kill every known worker process instead.
        #[serde(default)]
        all: bool,
    },

    /// Report engine status (plugin count, processes).
    #[serde(rename = "get_engine_status")]
    EngineStatus,

    /// Kill all plugins of this session and reset session state.
    #[serde(rename = "reset_engine")]
    ResetEngine,
}

/// Envelope pairing a control request with its correlation id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlEnvelope {
    /// Correlation id echoed on the reply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u64>,
    /// The operation.
    #[serde(flatten)]
    pub request: ControlRequest,
}

/// Reply to a control operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlReply {
    /// Correlation id from the request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u64>,
    /// Whether the operation succeeded.
    pub success: bool,
    /// Operation-specific payload.
    #[serde(flatten)]
    pub payload: serde_json::Value,
}

impl ControlReply {
    /// Successful reply with a payload.
    pub fn ok(request_id: Option<u64>, payload: serde_json::Value) -> Self {
        Self {
            request_id,
            success: true,
            payload,
        }
    }

    /// Failed reply carrying the error kind and message.
    pub fn error(request_id: Option<u64>, error: &Error) -> Self {
        Self {
            request_id,
            success: false,
            payload: serde_json::json!({
                "error": error.kind(),
                "detail": error.to_string(),
                "reason": error.to_string(),
            }),
        }
    }
}

// =============================================================================
// Connection codec
// =============================================================================

/// One inbound message, decoded.
#[derive(Debug)]
pub enum Inbound {
    /// A control operation on the engine channel.
    Control(ControlEnvelope),
    /// An RPC packet on a named channel.
    Channel {
        /// Routing channel name.
        channel: String,
        /// The reassembled packet.
        packet: Packet,
    },
    /// Message incomplete (more binary attachments expected).
    Incomplete,
}

/// Decodes the channel-tagged message stream of one websocket connection.
#[derive(Default)]
pub struct ConnectionCodec {
    reassembler: Reassembler,
    pending_channel: Option<String>,
}

impl ConnectionCodec {
    /// Creates an empty codec.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a text message.
    pub fn push_text(&mut self, text: &str) -> Result<Inbound> {
        let mut value: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| Error::BadRequest(format!("malformed message: {e}")))?;
        let channel = value
            .as_object_mut()
            .and_then(|map| map.remove("channel"))
            .and_then(|v| v.as_str().map(String::from))
            .ok_or_else(|| Error::BadRequest("message without channel".into()))?;
        if channel == ENGINE_CHANNEL {
            let envelope: ControlEnvelope = serde_json::from_value(value)
                .map_err(|e| Error::BadRequest(format!("malformed control message: {e}")))?;
            return Ok(Inbound::Control(envelope));
        }
        match self.reassembler.push_json(value)? {
            Some(packet) => Ok(Inbound::Channel { channel, packet }),
            None => {
                self.pending_channel = Some(channel);
                Ok(Inbound::Incomplete)
            }
        }
    }

    /// Feeds a binary message belonging to the pending frame.
    pub fn push_binary(&mut self, data: &[u8]) -> Result<Inbound> {
        match self.reassembler.push_binary(data)? {
            Some(packet) => {
                let channel = self.pending_channel.take().ok_or_else(|| {
                    Error::BadRequest("binary message without a pending channel".into())
                })?;
                Ok(Inbound::Channel { channel, packet })
            }
            None => Ok(Inbound::Incomplete),
        }
    }
}

/// Serializes a packet for a channel into websocket payloads.
pub fn encode_channel_message(
    channel: &str,
    packet: &Packet,
) -> Result<(String, Vec<Vec<u8>>)> {
    wire::serialize_tagged(packet, Some(channel))
}

/// Serializes a control reply for the engine channel.
pub fn encode_control_reply(reply: &ControlReply) -> Result<String> {
    let mut value = serde_json::to_value(reply)
        .map_err(|e| Error::Internal(format!("reply serialization failed: {e}")))?;
    if let serde_json::Value::Object(map) = &mut value {
        map.insert(
            "channel".into(),
            serde_json::Value::String(ENGINE_CHANNEL.into()),
        );
        map.insert("op".into(), serde_json::Value::String("reply".into()));
    }
    serde_json::to_string(&value).map_err(|e| Error::Internal(format!("{e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_rpc::Frame;

    #[test]
    fn control_message_round_trip() {
        let mut codec = ConnectionCodec::new();
        let inbound = codec
            .push_text(
                r#"{"channel":"engine","op":"init_plugin","request_id":7,
                    "id":"p1","config":{"name":"counter"}}"#,
            )
            .unwrap();
        match inbound {
            Inbound::Control(envelope) => {
                assert_eq!(envelope.request_id, Some(7));
                match envelope.request {
                    ControlRequest::InitPlugin { id, config } => {
                        assert_eq!(id, "p1");
                        assert_eq!(config["name"], "counter");
                    }
                    other => panic!("unexpected request: {other:?}"),
                }
            }
            other => panic!("unexpected inbound: {other:?}"),
        }
    }

    #[test]
    fn channel_frame_round_trip() {
        let packet = Packet::frame(Frame::GetInterface);
        let (text, binaries) = encode_channel_message("to_plugin_abc", &packet).unwrap();
        assert!(binaries.is_empty());
        assert!(text.contains("\"channel\":\"to_plugin_abc\""));

        let mut codec = ConnectionCodec::new();
        match codec.push_text(&text).unwrap() {
            Inbound::Channel { channel, packet } => {
                assert_eq!(channel, "to_plugin_abc");
                assert_eq!(packet.frame, Some(Frame::GetInterface));
            }
            other => panic!("unexpected inbound: {other:?}"),
        }
    }

    #[test]
    fn message_without_channel_is_rejected() {
        let mut codec = ConnectionCodec::new();
        assert!(codec.push_text(r#"{"type":"getInterface"}"#).is_err());
    }

    #[test]
    fn channel_names_embed_the_secret() {
        assert_eq!(from_plugin("s3"), "from_plugin_s3");
        assert_eq!(to_plugin("s3"), "to_plugin_s3");
        assert_eq!(message_from_plugin("s3"), "message_from_plugin_s3");
        assert_eq!(
            channel_secret("from_plugin_s3", "from_plugin_"),
            Some("s3")
        );
    }
}
