//! # Gantry Runtime
//!
//! Orchestration layer of the gantry broker: the [`Engine`] root object,
//! configuration loading, logging setup, on-disk workspace state and the
//! object-store bridge.
//!
//! ```rust,ignore
//! use gantry_runtime::{ConfigLoader, Engine, logging};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ConfigLoader::new().with_current_dir().load()?;
//!     logging::init_from_level(&config.logging.level);
//!     let engine = Engine::new(config)?;
//!     let exit_code = engine.serve().await?;
//!     std::process::exit(exit_code);
//! }
//! ```

pub mod builtin;
pub mod config;
pub mod engine;
pub mod logging;
pub mod objectstore;
pub mod workdir;

pub use config::{ConfigLoader, GantryConfig};
pub use engine::{Engine, EngineBridge};
pub use logging::LoggingBuilder;
pub use objectstore::{LocalObjectStore, ObjectStore, StoreCredential, check_object_prefix};
pub use workdir::EngineWorkdir;
