pub mod config;
pub mod connection;
pub mod origin;
pub mod registry;
pub mod relay;
pub mod router;
pub mod server;

pub use config::{ConfigError, ServerConfig};
pub use registry::{Audience, ConnectionRegistry, ConnectionState, RegistryStats, HEARTBEAT_INTERVAL};
pub use server::{start, AppState, ServerError, ServerHandle};
