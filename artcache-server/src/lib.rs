//! Shared artifact cache server.
//!
//! One storage core ([`ArtifactStore`]) serves two transports: an HTTP API
//! and a framed binary RPC protocol. Both verify content hashes on store and
//! on fetch, and both report misses for corrupt content.

pub mod config;
pub mod core;
pub mod server;

// Re-export commonly used types
pub use config::ServerConfig;
pub use core::{ArtifactStore, CacheService, ServerError, StoreConfig, StoreStats};
pub use server::{AppState, RpcServer, RpcServerConfig, create_router};
