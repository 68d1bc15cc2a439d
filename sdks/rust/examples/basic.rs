//! Basic Cache Example
//!
//! Caches the outputs of a fake build action in a local directory and,
//! when `ARTCACHE_URL` is set, a shared artcache server.
//!
//! Usage:
//!   cargo run --example basic

use artcache_sdk::{BuildAction, CacheConfig, address, collect_outputs, restore_outputs};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    let workspace = std::env::temp_dir().join("artcache-basic-example");
    let build_dir = workspace.join("build");
    std::fs::create_dir_all(build_dir.join("lib"))?;
    std::fs::write(build_dir.join("lib/libgreet.a"), b"!<arch>\ngreet")?;

    let mut config = CacheConfig::directory_only(workspace.join("cache"));
    if let Ok(url) = std::env::var("ARTCACHE_URL") {
        config = config.with_http(url);
    }
    let cache = artcache_sdk::open(&config)?;

    // 1. Address the action's outputs
    let action = BuildAction {
        label: "//greet:lib".into(),
        os_arch: "linux_amd64".into(),
        toolchain: "cc 13.2".into(),
        command: vec!["cc".into(), "-c".into(), "greet.c".into()],
        declared_outputs: vec!["lib/libgreet.a".into()],
        ..Default::default()
    };
    let outputs = collect_outputs(&build_dir, &action.declared_outputs)?;
    let addressed = address(&action, &outputs)?;
    println!("1. Key: {}", addressed.key);
    println!("   Hash: {}\n", addressed.artifact.hash);

    // 2. Store
    let report = cache.store(&addressed.key, &addressed.artifact).await?;
    println!("2. Stored in {:?}, failed: {:?}\n", report.stored, report.failed);

    // 3. Fetch and restore elsewhere
    match cache.get(&addressed.key).await {
        Some(hit) => {
            let restore_dir = workspace.join("restored");
            restore_outputs(&restore_dir, &hit.artifact)?;
            println!("3. Hit, restored {} files to {:?}\n", hit.artifact.len(), restore_dir);
        }
        None => println!("3. Miss\n"),
    }

    // 4. Delete
    cache.delete(&addressed.key).await;
    println!("4. Deleted, lookup now: {:?}", cache.get(&addressed.key).await.map(|a| a.hash));

    Ok(())
}
