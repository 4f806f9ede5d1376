//! # Gantry Gateway
//!
//! The workspace-aware HTTP face of the broker: service listings,
//! introspection, function invocation with JSON/msgpack negotiation, and
//! ASGI-style sub-application mounts that forward whole HTTP requests as
//! single RPC calls.

pub mod asgi;
pub mod content;
pub mod routes;

pub use content::{BodyFormat, normalize};
pub use routes::{GatewayState, gateway_router};
