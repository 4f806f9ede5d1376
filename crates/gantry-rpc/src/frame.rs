//! Wire frame types.
//!
//! Every websocket text message is one JSON frame with a top-level `type`
//! field. Binary payloads (ndarray chunks, non-UTF-8 bytes) travel as
//! separate length-prefixed binary messages referenced by index from the
//! JSON side; [`crate::wire`] handles the pairing.

use serde::{Deserialize, Serialize};

/// One entry of a published interface.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InterfaceEntry {
    /// Exported name.
    pub name: String,
    /// Inline data for non-callable slots; nested callables are marked
    /// with `"**@@FUNCTION@@**:<key>"` strings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// A protocol frame. Unknown `type` values are ignored with a log by the
/// dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum Frame {
    /// Peer is up; carries its effective config.
    #[serde(rename = "initialized")]
    Initialized {
        /// Peer configuration (name, type, flags, ...).
        #[serde(default)]
        config: serde_json::Value,
        /// Set when initialization failed peer-side.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Ask the other side to publish its interface.
    #[serde(rename = "getInterface")]
    GetInterface,

    /// Publish the local interface.
    #[serde(rename = "setInterface")]
    SetInterface {
        /// Exported names.
        api: Vec<InterfaceEntry>,
    },

    /// Acknowledge that the received interface was mirrored.
    #[serde(rename = "interfaceSetAsRemote")]
    InterfaceSetAsRemote,

    /// Invoke a named method on the receiving side.
    #[serde(rename = "method")]
    Method {
        /// Exported method name (may be dotted for nested slots).
        name: String,
        /// Target plugin id for plugin-interface calls.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pid: Option<String>,
        /// Encoded positional arguments.
        args: serde_json::Value,
        /// Encoded `[resolve, reject]` pair when the caller awaits a
        /// result.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        promise: Option<serde_json::Value>,
    },

    /// Invoke an anonymous function by its reference-store id.
    #[serde(rename = "callback")]
    Callback {
        /// Reference-store id on the receiving side.
        id: u64,
        /// Encoded positional arguments.
        args: serde_json::Value,
        /// Encoded `[resolve, reject]` pair.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        promise: Option<serde_json::Value>,
    },

    /// Run a script in the peer (native plugins only).
    #[serde(rename = "execute")]
    Execute {
        /// `{type, content}` script descriptor.
        code: serde_json::Value,
    },

    /// The script finished successfully.
    #[serde(rename = "executeSuccess")]
    ExecuteSuccess,

    /// The script failed.
    #[serde(rename = "executeFailure")]
    ExecuteFailure {
        /// Failure description.
        #[serde(default)]
        error: String,
    },

    /// Graceful shutdown request.
    #[serde(rename = "disconnect")]
    Disconnect,

    /// Shutdown confirmation emitted towards the session.
    #[serde(rename = "disconnected")]
    Disconnected {
        /// `{success, message}` details.
        #[serde(default)]
        details: serde_json::Value,
    },

    /// Log line or progress report from the supervisor pipeline.
    #[serde(rename = "logging")]
    Logging {
        /// `{type, value}` record.
        details: serde_json::Value,
    },

    /// Opaque payload routed between a session and its plugin.
    #[serde(rename = "message")]
    Message {
        /// Inner frame or payload.
        data: serde_json::Value,
    },
}

impl Frame {
    /// Wire name of the frame type.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Initialized { .. } => "initialized",
            Frame::GetInterface => "getInterface",
            Frame::SetInterface { .. } => "setInterface",
            Frame::InterfaceSetAsRemote => "interfaceSetAsRemote",
            Frame::Method { .. } => "method",
            Frame::Callback { .. } => "callback",
            Frame::Execute { .. } => "execute",
            Frame::ExecuteSuccess => "executeSuccess",
            Frame::ExecuteFailure { .. } => "executeFailure",
            Frame::Disconnect => "disconnect",
            Frame::Disconnected { .. } => "disconnected",
            Frame::Logging { .. } => "logging",
            Frame::Message { .. } => "message",
        }
    }
}

/// A frame plus its binary attachments, in index order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Packet {
    /// The JSON frame.
    pub frame: Option<Frame>,
    /// Binary payloads referenced by `{"__index__": n}` markers.
    pub attachments: Vec<Vec<u8>>,
}

impl Packet {
    /// Wraps a frame without attachments.
    pub fn frame(frame: Frame) -> Self {
        Self {
            frame: Some(frame),
            attachments: Vec::new(),
        }
    }

    /// Wraps a frame with attachments.
    pub fn with_attachments(frame: Frame, attachments: Vec<Vec<u8>>) -> Self {
        Self {
            frame: Some(frame),
            attachments,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trips_through_json() {
        let frame = Frame::Method {
            name: "echo".into(),
            pid: None,
            args: serde_json::json!([{ "__jailed_type__": "argument", "__value__": "hi" }]),
            promise: None,
        };
        let text = serde_json::to_string(&frame).unwrap();
        assert!(text.contains("\"type\":\"method\""));
        assert!(!text.contains("pid"));
        let back: Frame = serde_json::from_str(&text).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn unknown_frame_type_fails_to_parse() {
        let err = serde_json::from_str::<Frame>(r#"{"type":"mystery"}"#);
        assert!(err.is_err());
    }
}
