//! Frame ↔ websocket message codec.
//!
//! A [`Packet`] becomes one JSON text message plus one length-delimited
//! binary message per attachment; each binary message is prefixed with a
//! 4-byte big-endian attachment index. The text side announces how many
//! attachments follow via a `__attachments__` count so the receiver knows
//! when the packet is complete.

use tracing::warn;

use gantry_core::{Error, Result};

use crate::frame::{Frame, Packet};

const ATTACHMENTS_KEY: &str = "__attachments__";

/// Serializes a packet into its text frame and binary messages.
pub fn serialize(packet: &Packet) -> Result<(String, Vec<Vec<u8>>)> {
    serialize_tagged(packet, None)
}

/// Like [`serialize`], stamping a routing channel onto the text frame.
pub fn serialize_tagged(packet: &Packet, channel: Option<&str>) -> Result<(String, Vec<Vec<u8>>)> {
    let frame = packet
        .frame
        .as_ref()
        .ok_or_else(|| Error::Internal("cannot serialize empty packet".into()))?;
    let mut value = serde_json::to_value(frame)
        .map_err(|e| Error::Internal(format!("frame serialization failed: {e}")))?;
    if let serde_json::Value::Object(map) = &mut value {
        if !packet.attachments.is_empty() {
            map.insert(
                ATTACHMENTS_KEY.to_string(),
                serde_json::Value::from(packet.attachments.len()),
            );
        }
        if let Some(channel) = channel {
            map.insert(
                "channel".to_string(),
                serde_json::Value::String(channel.to_string()),
            );
        }
    }
    let text = serde_json::to_string(&value)
        .map_err(|e| Error::Internal(format!("frame serialization failed: {e}")))?;
    let binaries = packet
        .attachments
        .iter()
        .enumerate()
        .map(|(index, data)| {
            let mut message = Vec::with_capacity(4 + data.len());
            message.extend_from_slice(&(index as u32).to_be_bytes());
            message.extend_from_slice(data);
            message
        })
        .collect();
    Ok((text, binaries))
}

/// Rebuilds packets from interleaved text and binary messages of one
/// websocket connection.
#[derive(Default)]
pub struct Reassembler {
    pending: Option<PendingPacket>,
}

struct PendingPacket {
    frame: Frame,
    expected: usize,
    attachments: Vec<Option<Vec<u8>>>,
}

impl Reassembler {
    /// Creates an empty reassembler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a text message. Returns a completed packet when the frame has
    /// no attachments. Frames with an unknown `type` are dropped with a
    /// log; malformed JSON is a protocol violation.
    pub fn push_text(&mut self, text: &str) -> Result<Option<Packet>> {
        let value: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| Error::BadRequest(format!("malformed frame: {e}")))?;
        self.push_json(value)
    }

    /// Feeds an already parsed frame value (used when an outer codec has
    /// stripped routing fields off the message first).
    pub fn push_json(&mut self, mut value: serde_json::Value) -> Result<Option<Packet>> {
        let expected = value
            .as_object_mut()
            .and_then(|map| map.remove(ATTACHMENTS_KEY))
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as usize;
        let frame: Frame = match serde_json::from_value(value.clone()) {
            Ok(frame) => frame,
            Err(_) => {
                let kind = value
                    .get("type")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or("<missing>");
                warn!(frame_type = %kind, "Ignoring frame with unknown type");
                return Ok(None);
            }
        };
        if expected == 0 {
            return Ok(Some(Packet::frame(frame)));
        }
        self.pending = Some(PendingPacket {
            frame,
            expected,
            attachments: vec![None; expected],
        });
        Ok(None)
    }

    /// Feeds a binary message. Returns the completed packet once every
    /// announced attachment has arrived.
    pub fn push_binary(&mut self, data: &[u8]) -> Result<Option<Packet>> {
        let Some(pending) = &mut self.pending else {
            return Err(Error::BadRequest(
                "binary message without a pending frame".into(),
            ));
        };
        if data.len() < 4 {
            return Err(Error::BadRequest("binary message too short".into()));
        }
        let mut prefix = [0u8; 4];
        prefix.copy_from_slice(&data[..4]);
        let index = u32::from_be_bytes(prefix) as usize;
        if index >= pending.expected {
            return Err(Error::BadRequest(format!(
                "attachment index {index} out of range"
            )));
        }
        pending.attachments[index] = Some(data[4..].to_vec());
        if pending.attachments.iter().all(Option::is_some) {
            let Some(done) = self.pending.take() else {
                unreachable!()
            };
            let attachments = done
                .attachments
                .into_iter()
                .map(|a| a.unwrap_or_default())
                .collect();
            return Ok(Some(Packet::with_attachments(done.frame, attachments)));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_without_attachments_is_one_text_message() {
        let packet = Packet::frame(Frame::GetInterface);
        let (text, binaries) = serialize(&packet).unwrap();
        assert!(binaries.is_empty());
        let mut reassembler = Reassembler::new();
        let back = reassembler.push_text(&text).unwrap().unwrap();
        assert_eq!(back, packet);
    }

    #[test]
    fn attachments_round_trip_in_any_order() {
        let packet = Packet::with_attachments(
            Frame::Method {
                name: "ingest".into(),
                pid: None,
                args: serde_json::json!([]),
                promise: None,
            },
            vec![vec![1, 2, 3], vec![4, 5]],
        );
        let (text, binaries) = serialize(&packet).unwrap();
        assert_eq!(binaries.len(), 2);

        let mut reassembler = Reassembler::new();
        assert!(reassembler.push_text(&text).unwrap().is_none());
        // deliver out of order; the index prefix restores placement
        assert!(reassembler.push_binary(&binaries[1]).unwrap().is_none());
        let back = reassembler.push_binary(&binaries[0]).unwrap().unwrap();
        assert_eq!(back, packet);
    }

    #[test]
    fn unknown_frame_type_is_dropped() {
        let mut reassembler = Reassembler::new();
        let out = reassembler.push_text(r#"{"type":"mystery","data":1}"#).unwrap();
        assert!(out.is_none());
    }

    #[test]
    fn malformed_json_is_a_protocol_violation() {
        let mut reassembler = Reassembler::new();
        assert!(reassembler.push_text("{not json").is_err());
    }

    #[test]
    fn stray_binary_message_is_rejected() {
        let mut reassembler = Reassembler::new();
        assert!(reassembler.push_binary(&[0, 0, 0, 0, 1]).is_err());
    }
}
