//! Client-side cache configuration

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{CacheError, Result};

/// Kind of cache tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierKind {
    Directory,
    Http,
    Rpc,
}

impl TierKind {
    /// Whether the tier lives on another machine
    pub fn is_remote(self) -> bool {
        !matches!(self, TierKind::Directory)
    }
}

impl fmt::Display for TierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TierKind::Directory => "directory",
            TierKind::Http => "http",
            TierKind::Rpc => "rpc",
        })
    }
}

/// Cache configuration handed to [`crate::open`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Disable every tier; lookups always miss and stores are no-ops
    pub disabled: bool,
    /// Read order of the enabled tiers
    pub precedence: Vec<TierKind>,
    /// Upper bound of every remote call, in milliseconds
    pub request_timeout_ms: u64,
    pub directory: DirectoryConfig,
    pub http: HttpConfig,
    pub rpc: RpcConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    pub enabled: bool,
    pub path: PathBuf,
    /// Bytes; 0 disables cleaning
    pub high_water_mark: u64,
    pub low_water_mark: u64,
    /// Run the cleaner once when the cache is opened
    pub clean_on_start: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub enabled: bool,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    pub enabled: bool,
    /// `host:port`
    pub address: String,
    pub max_idle_connections: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            disabled: false,
            precedence: vec![TierKind::Directory, TierKind::Rpc, TierKind::Http],
            request_timeout_ms: 5_000,
            directory: DirectoryConfig::default(),
            http: HttpConfig::default(),
            rpc: RpcConfig::default(),
        }
    }
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: PathBuf::from(".artcache"),
            high_water_mark: 10 * 1024 * 1024 * 1024,
            low_water_mark: 8 * 1024 * 1024 * 1024,
            clean_on_start: true,
        }
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: String::new(),
            max_idle_connections: 8,
        }
    }
}

impl CacheConfig {
    /// Load configuration from YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: CacheConfig = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Only a directory tier, rooted at `path`
    pub fn directory_only(path: impl Into<PathBuf>) -> Self {
        Self {
            directory: DirectoryConfig {
                path: path.into(),
                ..DirectoryConfig::default()
            },
            ..Self::default()
        }
    }

    /// Set the HTTP tier URL and enable it
    pub fn with_http(mut self, url: impl Into<String>) -> Self {
        self.http = HttpConfig {
            enabled: true,
            url: url.into(),
        };
        self
    }

    /// Set the RPC tier address and enable it
    pub fn with_rpc(mut self, address: impl Into<String>) -> Self {
        self.rpc.enabled = true;
        self.rpc.address = address.into();
        self
    }

    /// Set the request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn is_enabled(&self, kind: TierKind) -> bool {
        match kind {
            TierKind::Directory => self.directory.enabled,
            TierKind::Http => self.http.enabled,
            TierKind::Rpc => self.rpc.enabled,
        }
    }

    /// Enabled tiers in read order.
    ///
    /// Tiers left out of `precedence` are appended in their default order.
    pub fn tier_order(&self) -> Vec<TierKind> {
        let mut order: Vec<TierKind> = Vec::new();
        let defaults = [TierKind::Directory, TierKind::Rpc, TierKind::Http];
        for kind in self.precedence.iter().chain(defaults.iter()) {
            if !order.contains(kind) {
                order.push(*kind);
            }
        }
        order.retain(|kind| self.is_enabled(*kind));
        order
    }

    pub fn validate(&self) -> Result<()> {
        if self.disabled {
            return Ok(());
        }
        if self.request_timeout_ms == 0 {
            return Err(CacheError::Config(
                "request_timeout_ms must be greater than zero".into(),
            ));
        }
        let dir = &self.directory;
        if dir.enabled && dir.high_water_mark > 0 && dir.low_water_mark > dir.high_water_mark {
            return Err(CacheError::Config(format!(
                "directory.low_water_mark ({}) exceeds directory.high_water_mark ({})",
                dir.low_water_mark, dir.high_water_mark
            )));
        }
        if self.http.enabled {
            let url = url::Url::parse(&self.http.url)?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(CacheError::Config(format!(
                    "http.url must be http or https, got {}",
                    self.http.url
                )));
            }
        }
        if self.rpc.enabled && self.rpc.address.is_empty() {
            return Err(CacheError::Config("rpc.address is required".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_order_is_local_first() {
        let config = CacheConfig::default()
            .with_http("http://cache:15600")
            .with_rpc("cache:15601");
        assert_eq!(
            config.tier_order(),
            vec![TierKind::Directory, TierKind::Rpc, TierKind::Http]
        );
    }

    #[test]
    fn test_custom_order_skips_disabled() {
        let mut config = CacheConfig::default().with_http("http://cache:15600");
        config.precedence = vec![TierKind::Http, TierKind::Directory];
        assert_eq!(config.tier_order(), vec![TierKind::Http, TierKind::Directory]);

        config.directory.enabled = false;
        assert_eq!(config.tier_order(), vec![TierKind::Http]);
    }

    #[test]
    fn test_yaml_parsing() {
        let config: CacheConfig = serde_yaml::from_str(
            r#"
precedence: [rpc, directory]
request_timeout_ms: 250
directory:
  path: /tmp/artcache
  high_water_mark: 1000
  low_water_mark: 500
rpc:
  enabled: true
  address: "10.0.0.5:15601"
"#,
        )
        .unwrap();

        assert!(config.validate().is_ok());
        assert_eq!(config.request_timeout(), Duration::from_millis(250));
        assert_eq!(config.directory.path, PathBuf::from("/tmp/artcache"));
        assert!(config.directory.clean_on_start);
        assert!(!config.http.enabled);
        assert_eq!(config.rpc.max_idle_connections, 8);
        assert_eq!(config.tier_order(), vec![TierKind::Rpc, TierKind::Directory]);
    }

    #[test]
    fn test_validation_errors() {
        let mut config = CacheConfig::default();
        config.directory.low_water_mark = config.directory.high_water_mark + 1;
        assert!(matches!(config.validate(), Err(CacheError::Config(_))));

        let config = CacheConfig::default().with_http("not a url");
        assert!(config.validate().is_err());

        let mut config = CacheConfig::default();
        config.rpc.enabled = true;
        assert!(config.validate().is_err());

        // Nothing is checked once the cache is disabled
        let mut config = CacheConfig::default().with_http("not a url");
        config.disabled = true;
        assert!(config.validate().is_ok());
    }
}
