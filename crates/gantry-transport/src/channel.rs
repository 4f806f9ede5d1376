//! Per-secret channel fan-out.
//!
//! The router owns the mapping from channel name to the queue draining it:
//! each plugin peer subscribes `from_plugin_<secret>`, each worker
//! connection subscribes `to_plugin_<secret>`, each session subscribes the
//! `message_from_plugin_<secret>` channels of its plugins.
//!
//! Packets for a channel nobody subscribes to yet are buffered (bounded)
//! and flushed on registration, so frames addressed to a plugin that is
//! still starting are delivered once it comes up.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use gantry_core::{Error, Result};
use gantry_rpc::Packet;

/// Upper bound on buffered packets per unregistered channel.
const PENDING_LIMIT: usize = 256;

/// Routes packets to channel subscribers.
#[derive(Default)]
pub struct ChannelRouter {
    channels: Mutex<HashMap<String, mpsc::Sender<Packet>>>,
    pending: Mutex<HashMap<String, Vec<Packet>>>,
}

impl ChannelRouter {
    /// Creates an empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes a queue to a channel, replacing any previous subscriber
    /// and flushing packets buffered while the channel was down.
    pub fn register(&self, channel: impl Into<String>, tx: mpsc::Sender<Packet>) {
        let channel = channel.into();
        debug!(channel = %channel, "Registering channel");
        let buffered = self.pending.lock().remove(&channel).unwrap_or_default();
        for packet in buffered {
            if let Err(e) = tx.try_send(packet) {
                warn!(channel = %channel, error = %e, "Dropping buffered packet");
            }
        }
        self.channels.lock().insert(channel, tx);
    }

    /// Removes a channel subscription.
    pub fn unregister(&self, channel: &str) {
        if self.channels.lock().remove(channel).is_some() {
            debug!(channel = %channel, "Unregistered channel");
        }
        self.pending.lock().remove(channel);
    }

    /// True when someone subscribes to the channel.
    pub fn has_channel(&self, channel: &str) -> bool {
        self.channels.lock().contains_key(channel)
    }

    /// Delivers a packet to the channel's subscriber, or parks it until
    /// one registers.
    pub async fn dispatch(&self, channel: &str, packet: Packet) -> Result<()> {
        let tx = self.channels.lock().get(channel).cloned();
        match tx {
            Some(tx) => {
                trace!(channel = %channel, "Dispatching packet");
                tx.send(packet)
                    .await
                    .map_err(|_| Error::PluginGone(format!("channel {channel} closed")))
            }
            None => {
                let mut pending = self.pending.lock();
                let queue = pending.entry(channel.to_string()).or_default();
                if queue.len() >= PENDING_LIMIT {
                    return Err(Error::TooManyInFlight);
                }
                trace!(channel = %channel, buffered = queue.len(), "Buffering packet");
                queue.push(packet);
                Ok(())
            }
        }
    }

    /// Number of live channels.
    pub fn len(&self) -> usize {
        self.channels.lock().len()
    }

    /// True when no channel is registered.
    pub fn is_empty(&self) -> bool {
        self.channels.lock().is_empty()
    }
}

impl std::fmt::Debug for ChannelRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ChannelRouter({} channels)", self.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_rpc::Frame;

    #[tokio::test]
    async fn dispatch_reaches_the_subscriber() {
        let router = ChannelRouter::new();
        let (tx, mut rx) = mpsc::channel(4);
        router.register("to_plugin_abc", tx);
        router
            .dispatch("to_plugin_abc", Packet::frame(Frame::Disconnect))
            .await
            .unwrap();
        let packet = rx.recv().await.unwrap();
        assert_eq!(packet.frame, Some(Frame::Disconnect));
    }

    #[tokio::test]
    async fn early_packets_are_flushed_on_registration() {
        let router = ChannelRouter::new();
        router
            .dispatch("to_plugin_late", Packet::frame(Frame::GetInterface))
            .await
            .unwrap();
        router
            .dispatch("to_plugin_late", Packet::frame(Frame::Disconnect))
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        router.register("to_plugin_late", tx);
        assert_eq!(
            rx.recv().await.unwrap().frame,
            Some(Frame::GetInterface)
        );
        assert_eq!(rx.recv().await.unwrap().frame, Some(Frame::Disconnect));
    }

    #[tokio::test]
    async fn buffering_is_bounded() {
        let router = ChannelRouter::new();
        for _ in 0..PENDING_LIMIT {
            router
                .dispatch("to_plugin_full", Packet::frame(Frame::GetInterface))
                .await
                .unwrap();
        }
        let err = router
            .dispatch("to_plugin_full", Packet::frame(Frame::GetInterface))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "TooManyInFlight");
    }

    #[tokio::test]
    async fn unregister_closes_the_route() {
        let router = ChannelRouter::new();
        let (tx, _rx) = mpsc::channel(4);
        router.register("from_plugin_abc", tx);
        assert!(router.has_channel("from_plugin_abc"));
        router.unregister("from_plugin_abc");
        assert!(!router.has_channel("from_plugin_abc"));
    }
}
