//! # Gantry RPC
//!
//! The symmetric, peer-to-peer message protocol of the gantry broker,
//! carried over any full-duplex byte stream (the connection layer provides
//! one stream per plugin, keyed by its secret).
//!
//! ## Pieces
//!
//! - **Frames** ([`Frame`], [`Packet`]): the JSON envelope every message
//!   travels in, plus indexed binary attachments.
//! - **Value envelopes** ([`envelope`]): the tagged
//!   `{"__jailed_type__": ...}` dialect values are encoded in, including
//!   chunked ndarrays and callable references.
//! - **Reference store** ([`ReferenceStore`]): dense numeric ids for
//!   callables passed across the wire, one-shot by default.
//! - **Completer** ([`Completer`]): the `[resolve, reject]` promise pair
//!   as one atomically settled cell with two surfaces.
//! - **Peer** ([`RpcPeer`]): lifecycle state machine, interface sync,
//!   pending-call correlation and remote proxies for one plugin.
//! - **Wire codec** ([`wire`]): pairing of JSON text messages with
//!   length-prefixed binary messages.

pub mod completer;
pub mod envelope;
pub mod frame;
pub mod interface;
pub mod peer;
pub mod store;
pub mod wire;

pub use completer::{Completer, error_from_value, error_to_fault};
pub use envelope::{ARRAY_CHUNK, DecodeContext, EncodeContext, decode, encode};
pub use frame::{Frame, InterfaceEntry, Packet};
pub use interface::{FUNCTION_MARKER, LocalInterface, ProxyFactory, build_remote};
pub use peer::{
    DEFAULT_MAX_IN_FLIGHT, DEFAULT_READY_TIMEOUT, PeerEvents, PeerPhase, PeerProxies, RpcPeer,
    kwargs,
};
pub use store::ReferenceStore;
pub use wire::{Reassembler, serialize};
