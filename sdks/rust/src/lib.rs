//! # artcache Rust SDK
//!
//! Build-side half of artcache: turns build actions into content-addressed
//! artifacts and caches them across a local directory and remote servers.
//!
//! ## Features
//!
//! - **Content addressing**: keys derived from a build action's inputs
//! - **Directory cache**: atomic local store with high/low water mark cleaning
//! - **HTTP and RPC tiers**: clients for `artcache-server`
//! - **Multiplexer**: ordered reads with back-fill, concurrent writes
//!
//! Failures of any tier are logged and treated as misses; a broken cache
//! never fails the build.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use artcache_sdk::{BuildAction, CacheConfig, address, collect_outputs};
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = CacheConfig::directory_only(".artcache").with_http("http://localhost:15600");
//!     let cache = artcache_sdk::open(&config)?;
//!
//!     let action = BuildAction {
//!         label: "//src/core:lib".into(),
//!         os_arch: "linux_amd64".into(),
//!         declared_outputs: vec!["lib/libcore.a".into()],
//!         ..Default::default()
//!     };
//!     let outputs = collect_outputs(Path::new("build"), &action.declared_outputs)?;
//!     let addressed = address(&action, &outputs)?;
//!
//!     if cache.get(&addressed.key).await.is_none() {
//!         cache.store(&addressed.key, &addressed.artifact).await?;
//!     }
//!     Ok(())
//! }
//! ```

pub mod address;
pub mod config;
pub mod dir;
pub mod error;
pub mod http;
pub mod multiplexer;
pub mod rpc;
pub mod tier;

pub use address::{
    AddressedArtifact, BuildAction, OutputSet, action_hash, action_key, address, collect_outputs,
    label_path, restore_outputs,
};
pub use artcache_protocol::{Artifact, ArtifactFile, ArtifactKey, ContentHash, HashedArtifact};
pub use config::{CacheConfig, DirectoryConfig, HttpConfig, RpcConfig, TierKind};
pub use dir::{CleanPolicy, CleanReport, Cleaner, DirectoryCache};
pub use error::{CacheError, Result};
pub use http::HttpTier;
pub use multiplexer::{BuildCache, DisabledCache, Multiplexer, StoreReport, open};
pub use rpc::RpcTier;
pub use tier::{CacheTier, DirectoryTier};
