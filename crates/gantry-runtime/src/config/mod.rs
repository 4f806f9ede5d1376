//! Configuration: schema and loader.

mod loader;
mod schema;

pub use loader::ConfigLoader;
pub use schema::{AuthSection, GantryConfig, LoggingSection, ServerConfig, SupervisorSection};
