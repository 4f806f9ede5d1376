//! # Gantry
//!
//! A plugin broker and service gateway: a long-running server that admits
//! sandboxed plugin processes over websockets, authenticates callers,
//! isolates them into workspaces, multiplexes a bidirectional RPC
//! protocol, and re-exposes plugin-registered services over HTTP.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐  ws   ┌───────────────────────────────┐  http  ┌─────────┐
//! │  worker  │──────▶│  engine                       │◀───────│ client  │
//! │ (plugin) │       │  transport ─ rpc ─ registry   │        └─────────┘
//! └──────────┘       │      │            │           │
//!      ▲             │  supervisor    gateway        │
//!      └─────────────│  (launch/kill) (services)     │
//!        subprocess  └───────────────────────────────┘
//! ```
//!
//! - **Core** ([`gantry_core`]): workspaces, plugins, services, events.
//! - **RPC** ([`gantry_rpc`]): frames, envelopes, reference store, peers.
//! - **Auth** ([`gantry_auth`]): bearer validation and presigned tokens.
//! - **Transport** ([`gantry_transport`]): websocket sessions and channel
//!   fan-out.
//! - **Supervisor** ([`gantry_supervisor`]): worker process lifecycle.
//! - **Gateway** ([`gantry_gateway`]): HTTP service endpoints and ASGI
//!   mounts.
//! - **Runtime** ([`gantry_runtime`]): the [`Engine`] root object,
//!   configuration and logging.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use gantry::{ConfigLoader, Engine, logging};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = ConfigLoader::new().with_current_dir().load().unwrap();
//!     logging::init_from_level(&config.logging.level);
//!     let engine = Engine::new(config).unwrap();
//!     std::process::exit(engine.serve().await.unwrap_or(1));
//! }
//! ```

pub use gantry_auth as auth;
pub use gantry_core as model;
pub use gantry_gateway as gateway;
pub use gantry_rpc as rpc;
pub use gantry_runtime as runtime;
pub use gantry_supervisor as supervisor;
pub use gantry_transport as transport;

pub use gantry_core::{
    CallContext, Error, EventBus, Plugin, PluginFlags, Registry, Result, RpcValue, ServiceInfo,
    UserInfo, Visibility, WorkspaceInfo,
};
pub use gantry_runtime::{ConfigLoader, Engine, GantryConfig, logging};

/// Prelude for common imports.
pub mod prelude {
    pub use gantry_core::{
        CallContext, Callable, Error, Event, EventBus, Plugin, PluginFlags, PluginState,
        Registry, Result, RpcValue, ServiceInfo, ServiceQuery, ServiceSpec, UserInfo,
        Visibility, Workspace, WorkspaceInfo,
    };
    pub use gantry_rpc::{Frame, LocalInterface, Packet, ReferenceStore, RpcPeer};
    pub use gantry_runtime::{ConfigLoader, Engine, GantryConfig};
}
