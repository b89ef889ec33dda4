pub mod access;
pub mod api;
pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod mcp_client;
pub mod registry;
pub mod router;
pub mod server;
pub mod types;

pub use access::{AccessControl, TenantCredentials};
pub use auth::{AuthConfig, Identity, IdentityResolver};
pub use config::{BackendConfig, BackendSet, GatewayConfig, load_backends};
pub use db::{AccessSeed, AccessStore, DatabaseConfig, create_connection, ensure_schema};
pub use error::{GatewayError, GatewayResult};
pub use registry::{CatalogMode, ToolRegistry};
pub use router::Dispatcher;
pub use server::{Gateway, serve};
