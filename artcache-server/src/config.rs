use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::core::StoreConfig;

const MB: u64 = 1024 * 1024;

/// Main server configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub server: Server,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
    pub protocols: ProtocolsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Server {
    pub host: String,
    pub http_port: u16,
    pub rpc_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Content directory; content is kept in memory when unset
    pub directory: Option<PathBuf>,
    pub high_water_mark_mb: u64,
    pub low_water_mark_mb: u64,
    pub max_artifact_mb: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// `json` or `pretty`
    pub format: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolsConfig {
    pub http: HttpConfig,
    pub rpc: RpcConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub enabled: bool,
    pub max_body_mb: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    pub enabled: bool,
    pub max_frame_mb: u64,
    pub idle_timeout_secs: u64,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            http_port: 15600,
            rpc_port: 15601,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            directory: None,
            high_water_mark_mb: 10 * 1024,
            low_water_mark_mb: 8 * 1024,
            max_artifact_mb: 1024,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_body_mb: 1024,
        }
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_frame_mb: 1024,
            idle_timeout_secs: 300,
        }
    }
}

impl ServerConfig {
    /// Load configuration from YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: ServerConfig = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let storage = &self.storage;
        if storage.high_water_mark_mb == 0 {
            anyhow::bail!("storage.high_water_mark_mb must be greater than zero");
        }
        if storage.low_water_mark_mb > storage.high_water_mark_mb {
            anyhow::bail!(
                "storage.low_water_mark_mb ({}) exceeds storage.high_water_mark_mb ({})",
                storage.low_water_mark_mb,
                storage.high_water_mark_mb
            );
        }
        if !self.protocols.http.enabled && !self.protocols.rpc.enabled {
            anyhow::bail!("at least one of protocols.http and protocols.rpc must be enabled");
        }
        Ok(())
    }

    /// Convert to StoreConfig
    pub fn to_store_config(&self) -> StoreConfig {
        StoreConfig {
            directory: self.storage.directory.clone(),
            high_water_mark: self.storage.high_water_mark_mb * MB,
            low_water_mark: self.storage.low_water_mark_mb * MB,
            max_artifact_bytes: self.storage.max_artifact_mb * MB,
        }
    }

    /// Get HTTP listen address
    pub fn http_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.http_port)
    }

    /// Get RPC listen address
    pub fn rpc_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.rpc_port)
    }

    pub fn max_body_bytes(&self) -> usize {
        (self.protocols.http.max_body_mb * MB) as usize
    }

    pub fn max_frame_bytes(&self) -> u64 {
        self.protocols.rpc.max_frame_mb * MB
    }
}
