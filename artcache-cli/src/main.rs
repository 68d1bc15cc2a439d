use anyhow::{Context, Result};
use artcache_sdk::{
    Artifact, ArtifactFile, ArtifactKey, BuildCache, CacheConfig, CleanPolicy, DirectoryCache,
    HashedArtifact, collect_outputs, restore_outputs,
};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "artcache-cli")]
#[command(about = "artcache CLI - inspect and manage build artifact caches", long_about = None)]
struct Args {
    /// Client configuration file (YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Local cache directory
    #[arg(short, long)]
    directory: Option<PathBuf>,

    /// HTTP cache server URL
    #[arg(long)]
    http: Option<String>,

    /// RPC cache server address (host:port)
    #[arg(long)]
    rpc: Option<String>,

    /// Remote request timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch an artifact (KEY is os_arch/artifact)
    Get {
        key: String,
        /// Restore the files below this directory
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Store files as an artifact
    Put {
        key: String,
        /// Directory the paths are relative to
        #[arg(short, long, default_value = ".")]
        root: PathBuf,
        /// Files or directories to include
        #[arg(required = true)]
        paths: Vec<String>,
    },
    /// Delete an artifact, or everything with --all
    Delete {
        #[arg(required_unless_present = "all")]
        key: Option<String>,
        #[arg(long)]
        all: bool,
    },
    /// Bound the local cache directory
    Clean {
        /// High water mark in bytes (defaults to the configured value)
        #[arg(long)]
        high: Option<u64>,
        /// Low water mark in bytes (defaults to the configured value)
        #[arg(long)]
        low: Option<u64>,
    },
    /// Show local cache size and server statistics
    Stats,
}

fn load_config(args: &Args) -> Result<CacheConfig> {
    let mut config = match &args.config {
        Some(path) => CacheConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => CacheConfig::default(),
    };

    if let Some(directory) = &args.directory {
        config.directory.path = directory.clone();
    }
    if let Some(url) = &args.http {
        config = config.with_http(url.clone());
    }
    if let Some(address) = &args.rpc {
        config = config.with_rpc(address.clone());
    }
    if let Some(timeout) = args.timeout_ms {
        config = config.with_timeout(Duration::from_millis(timeout));
    }
    // Cleaning is an explicit command here
    config.directory.clean_on_start = false;

    config.validate()?;
    Ok(config)
}

fn parse_key(key: &str) -> Result<ArtifactKey> {
    ArtifactKey::from_path(key).with_context(|| format!("invalid key '{key}'"))
}

async fn cmd_get(cache: Arc<dyn BuildCache>, key: &str, out: Option<PathBuf>) -> Result<String> {
    let key = parse_key(key)?;
    let Some(hit) = cache.get(&key).await else {
        return Ok("(miss)".dimmed().to_string());
    };

    let mut lines = vec![format!("{} {}", "hash".bold(), hit.hash)];
    for file in hit.artifact.files() {
        lines.push(format!("  {} ({} bytes)", file.path, file.data.len()));
    }
    if let Some(out) = out {
        restore_outputs(&out, &hit.artifact)?;
        lines.push(format!("Restored to {}", out.display()).green().to_string());
    }
    Ok(lines.join("\n"))
}

async fn cmd_put(
    cache: Arc<dyn BuildCache>,
    key: &str,
    root: PathBuf,
    paths: Vec<String>,
) -> Result<String> {
    let key = parse_key(key)?;
    let outputs = collect_outputs(&root, &paths)?;
    if outputs.is_empty() {
        anyhow::bail!("no files found under {}", root.display());
    }

    let files = outputs
        .into_iter()
        .map(|(path, data)| ArtifactFile::new(path, data))
        .collect();
    let artifact = HashedArtifact::seal(Artifact::new(files)?);
    let report = cache.store(&key, &artifact).await?;

    let mut lines = vec![format!(
        "{} {} ({} files, {} bytes)",
        "stored".green(),
        artifact.hash,
        artifact.artifact.len(),
        artifact.artifact.total_size()
    )];
    for tier in &report.stored {
        lines.push(format!("  {} {}", "ok".green(), tier));
    }
    for (tier, reason) in &report.failed {
        lines.push(format!("  {} {}: {}", "failed".red(), tier, reason));
    }
    Ok(lines.join("\n"))
}

async fn cmd_delete(cache: Arc<dyn BuildCache>, key: Option<String>, all: bool) -> Result<String> {
    if all {
        cache.delete_all().await;
        return Ok("OK".green().to_string());
    }
    let key = parse_key(key.as_deref().unwrap_or_default())?;
    cache.delete(&key).await;
    Ok("OK".green().to_string())
}

fn cmd_clean(config: &CacheConfig, high: Option<u64>, low: Option<u64>) -> Result<String> {
    let policy = CleanPolicy::new(
        high.unwrap_or(config.directory.high_water_mark),
        low.unwrap_or(config.directory.low_water_mark),
    )?;
    let cache = DirectoryCache::open(&config.directory.path)?;
    let report = cache.cleaner(policy).run();

    let mut lines = vec![format!(
        "{} {} entries, {} -> {} bytes ({} freed, {} in progress)",
        "cleaned".green(),
        report.deleted,
        report.total_before,
        report.total_after,
        report.bytes_freed,
        report.in_progress
    )];
    for err in &report.errors {
        lines.push(format!("  {}", err.red()));
    }
    Ok(lines.join("\n"))
}

async fn cmd_stats(config: &CacheConfig) -> Result<String> {
    let mut lines = Vec::new();

    if config.directory.enabled {
        let cache = DirectoryCache::open(&config.directory.path)?;
        let entries = cache.cleaner(CleanPolicy::unbounded()).scan();
        let total: u64 = entries.iter().map(|e| e.size).sum();
        lines.push(format!("{}", "Directory:".bold()));
        lines.push(format!("  path:    {}", config.directory.path.display()));
        lines.push(format!("  entries: {}", entries.len()));
        lines.push(format!(
            "  bytes:   {} (high {}, low {})",
            total, config.directory.high_water_mark, config.directory.low_water_mark
        ));
    }

    if config.http.enabled {
        let url = format!("{}/stats", config.http.url.trim_end_matches('/'));
        let stats = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json::<serde_json::Value>()
            .await?;
        lines.push(format!("{} {}", "Server:".bold(), config.http.url));
        lines.push(serde_json::to_string_pretty(&stats)?);
    }

    if lines.is_empty() {
        lines.push("(no directory or HTTP tier configured)".dimmed().to_string());
    }
    Ok(lines.join("\n"))
}

async fn execute(args: Args) -> Result<String> {
    let config = load_config(&args)?;
    match args.command {
        Command::Get { key, out } => cmd_get(artcache_sdk::open(&config)?, &key, out).await,
        Command::Put { key, root, paths } => {
            cmd_put(artcache_sdk::open(&config)?, &key, root, paths).await
        }
        Command::Delete { key, all } => cmd_delete(artcache_sdk::open(&config)?, key, all).await,
        Command::Clean { high, low } => cmd_clean(&config, high, low),
        Command::Stats => cmd_stats(&config).await,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // User-facing output goes through the subscriber at info level
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_writer(std::io::stdout)
        .with_env_filter(tracing_subscriber::EnvFilter::new(log_level))
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    let args = Args::parse();
    let start = Instant::now();

    match execute(args).await {
        Ok(output) => {
            info!("{}\n{}", output, format!("({:.2?})", start.elapsed()).dimmed());
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "{}", format!("Error: {:#}", e).red());
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["artcache-cli"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn test_flags_override_config() {
        let dir = tempdir().unwrap();
        let dir_arg = dir.path().to_str().unwrap();
        let args = args(&[
            "--directory",
            dir_arg,
            "--http",
            "http://cache.local:15600",
            "--timeout-ms",
            "750",
            "stats",
        ]);

        let config = load_config(&args).unwrap();
        assert_eq!(config.directory.path, dir.path());
        assert!(config.http.enabled);
        assert_eq!(config.request_timeout(), Duration::from_millis(750));
        assert!(!config.directory.clean_on_start);
    }

    #[test]
    fn test_delete_requires_key_or_all() {
        assert!(Args::try_parse_from(["artcache-cli", "delete"]).is_err());
        assert!(Args::try_parse_from(["artcache-cli", "delete", "--all"]).is_ok());
    }

    #[tokio::test]
    async fn test_put_then_get_restores_files() {
        let cache_dir = tempdir().unwrap();
        let src = tempdir().unwrap();
        std::fs::create_dir_all(src.path().join("lib")).unwrap();
        std::fs::write(src.path().join("lib/a.so"), b"shared").unwrap();

        let config = CacheConfig::directory_only(cache_dir.path());
        let cache = artcache_sdk::open(&config).unwrap();
        cmd_put(
            Arc::clone(&cache),
            "linux_amd64/lib/a/01",
            src.path().to_path_buf(),
            vec!["lib".into()],
        )
        .await
        .unwrap();

        let out = tempdir().unwrap();
        cmd_get(cache, "linux_amd64/lib/a/01", Some(out.path().to_path_buf()))
            .await
            .unwrap();
        assert_eq!(std::fs::read(out.path().join("lib/a.so")).unwrap(), b"shared");
    }

    #[test]
    fn test_invalid_key_is_rejected() {
        assert!(parse_key("linux amd64/x").is_err());
    }
}
