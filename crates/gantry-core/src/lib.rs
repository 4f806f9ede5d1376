//! # Gantry Core
//!
//! Core data model and in-memory authority of the gantry plugin broker.
//!
//! This crate answers three questions for every other subsystem: who
//! exists (users, workspaces, plugins), who owns what (services and their
//! providers), and who may call what (visibility and membership).
//!
//! ## Layers
//!
//! - **Model**: plain records for users, workspaces, plugins and services
//!   ([`UserInfo`], [`WorkspaceInfo`], [`Plugin`], [`ServiceInfo`]).
//! - **Registry**: the process-global map of workspaces with service and
//!   plugin ownership rules ([`Registry`], [`Workspace`]).
//! - **Value model**: the tree every payload is expressed in, including
//!   live callables ([`RpcValue`], [`Callable`]).
//! - **Event bus**: synchronous lifecycle pub/sub ([`EventBus`]).
//! - **Context**: explicit caller identity threaded through every registry
//!   operation ([`CallContext`]).
//!
//! All registry state is process-local and lost on restart; the broker
//! persists nothing here.

pub mod context;
pub mod error;
pub mod event;
pub mod model;
pub mod registry;
pub mod value;

pub use context::CallContext;
pub use error::{Error, Result, WireError};
pub use event::{Event, EventBus, ListenerId};
pub use model::{
    LogRecord, Plugin, PluginFlags, PluginState, ServiceConfig, ServiceInfo, UserInfo,
    Visibility, WorkspaceInfo, plugin_signature,
};
pub use registry::{
    PUBLIC_WORKSPACE, ROOT_WORKSPACE, Registry, ServiceQuery, ServiceSpec, Workspace,
};
pub use value::{BoxFuture, Callable, NdArray, RpcValue};
