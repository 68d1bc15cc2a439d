mod disk;
pub mod error;
pub mod service;
pub mod store;
pub mod types;

pub use error::{Result, ServerError};
pub use service::CacheService;
pub use store::ArtifactStore;
pub use types::{StoreConfig, StoreStats};
