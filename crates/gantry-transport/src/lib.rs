//! # Gantry Transport
//!
//! The connection layer of the gantry broker: one axum websocket endpoint
//! multiplexing many plugin and session streams over named channels keyed
//! by per-plugin secrets.
//!
//! - [`protocol`]: the channel-tagged message dialect and control
//!   operations (`register_client`, `init_plugin`, ...).
//! - [`channel`]: the per-secret fan-out router.
//! - [`session`]: authenticated client sessions, plugin/session binding,
//!   resume signatures and the bad-token attempt backstop.
//! - [`server`]: the websocket endpoint delegating to the runtime's
//!   [`EngineHandler`].

pub mod channel;
pub mod protocol;
pub mod server;
pub mod session;

pub use channel::ChannelRouter;
pub use protocol::{
    ConnectionCodec, ControlEnvelope, ControlReply, ControlRequest, ENGINE_CHANNEL, Inbound,
    channel_secret, encode_channel_message, encode_control_reply, from_plugin,
    message_from_plugin, message_to_plugin, to_plugin,
};
pub use server::{EngineHandler, websocket_router};
pub use session::{
    ClientSession, EXIT_ATTEMPTS_EXHAUSTED, MAX_ATTEMPTS, RawMessage, SessionManager,
    SessionTeardown, mint_secret,
};
