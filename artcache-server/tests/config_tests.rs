// Configuration Module Tests
// Tests for ServerConfig, loading, defaults, and conversions

use artcache_server::ServerConfig;
use std::fs;

#[test]
fn test_config_default_values() {
    let config = ServerConfig::default();

    assert_eq!(config.server.host, "0.0.0.0");
    assert_eq!(config.server.http_port, 15600);
    assert_eq!(config.server.rpc_port, 15601);

    assert!(config.storage.directory.is_none());
    assert_eq!(config.storage.high_water_mark_mb, 10 * 1024);
    assert_eq!(config.storage.low_water_mark_mb, 8 * 1024);

    assert_eq!(config.logging.level, "info");
    assert_eq!(config.logging.format, "json");

    assert!(config.protocols.http.enabled);
    assert!(config.protocols.rpc.enabled);
    assert_eq!(config.protocols.rpc.idle_timeout_secs, 300);
}

#[test]
fn test_config_addrs() {
    let mut config = ServerConfig::default();
    config.server.host = "127.0.0.1".to_string();
    config.server.http_port = 8080;
    config.server.rpc_port = 8081;

    assert_eq!(config.http_addr(), "127.0.0.1:8080");
    assert_eq!(config.rpc_addr(), "127.0.0.1:8081");
}

#[test]
fn test_config_to_store_config() {
    let mut config = ServerConfig::default();
    config.storage.high_water_mark_mb = 100;
    config.storage.low_water_mark_mb = 80;
    config.storage.max_artifact_mb = 10;

    let store = config.to_store_config();
    assert_eq!(store.high_water_mark, 100 * 1024 * 1024);
    assert_eq!(store.low_water_mark, 80 * 1024 * 1024);
    assert_eq!(store.max_artifact_bytes, 10 * 1024 * 1024);
    assert!(store.directory.is_none());
}

#[test]
fn test_config_from_partial_yaml() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.yml");
    fs::write(
        &path,
        r#"
server:
  host: "127.0.0.1"
  http_port: 9000
storage:
  directory: "/var/cache/artcache"
  high_water_mark_mb: 2048
  low_water_mark_mb: 1024
logging:
  format: "pretty"
"#,
    )
    .unwrap();

    let config = ServerConfig::from_file(&path).unwrap();
    assert_eq!(config.server.host, "127.0.0.1");
    assert_eq!(config.server.http_port, 9000);
    assert_eq!(config.server.rpc_port, 15601);
    assert_eq!(
        config.storage.directory.as_deref(),
        Some(std::path::Path::new("/var/cache/artcache"))
    );
    assert_eq!(config.storage.high_water_mark_mb, 2048);
    assert_eq!(config.logging.level, "info");
    assert_eq!(config.logging.format, "pretty");
}

#[test]
fn test_config_rejects_inverted_water_marks() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.yml");
    fs::write(
        &path,
        "storage:\n  high_water_mark_mb: 10\n  low_water_mark_mb: 20\n",
    )
    .unwrap();

    assert!(ServerConfig::from_file(&path).is_err());
}

#[test]
fn test_config_rejects_no_protocols() {
    let mut config = ServerConfig::default();
    config.protocols.http.enabled = false;
    config.protocols.rpc.enabled = false;
    assert!(config.validate().is_err());
}

#[test]
fn test_config_from_missing_file() {
    assert!(ServerConfig::from_file("/nonexistent/artcache.yml").is_err());
}
