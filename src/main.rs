//! bucketcache - operator CLI
//!
//! Inspects and maintains the on-disk cache of one bucket.
//!
//! ```text
//! bucketcache --config cache.yaml scan       # compare data and stat subtrees
//! bucketcache --config cache.yaml evict      # run eviction / expiry now
//! bucketcache --config cache.yaml verify     # check cached copies against a mirror
//! bucketcache --config cache.yaml stats      # usage gauges, Prometheus text
//! bucketcache --config cache.yaml validate   # check config and credentials
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use futures::stream::{self, StreamExt};
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use bucketcache::adapters::{DirectoryRemote, LoggingEventPublisher};
use bucketcache::domain::ports::EventPublisher;
use bucketcache::{Cache, CacheConfig, CacheContext, CacheKey, Credentials, Error};

/// Entries checked at once by `verify`
const VERIFY_CONCURRENCY: usize = 4;

// =============================================================================
// CLI Arguments
// =============================================================================

/// Local disk cache for a remote object store
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, env = "BUCKETCACHE_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Cache root directory (overrides the config file)
    #[arg(long, env = "BUCKETCACHE_ROOT", global = true)]
    cache_root: Option<PathBuf>,

    /// Bucket name (overrides the config file)
    #[arg(long, env = "BUCKETCACHE_BUCKET", global = true)]
    bucket: Option<String>,

    /// Size limit in bytes; zero or negative disables eviction
    #[arg(long, env = "BUCKETCACHE_SIZE_LIMIT", global = true, allow_hyphen_values = true)]
    size_limit: Option<i64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON", global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compare the data and stat subtrees path-for-path
    Scan,

    /// Run an eviction pass, plus idle expiry when configured
    Evict,

    /// Verify cached copies against a local mirror of the bucket
    Verify {
        /// Directory holding one subdirectory per bucket
        #[arg(long, env = "BUCKETCACHE_REMOTE_DIR")]
        remote_dir: PathBuf,

        /// Treat the mirror as having no server-side checksums
        #[arg(long, env = "BUCKETCACHE_NO_REMOTE_CRC")]
        no_remote_crc: bool,

        /// Keys to verify (default: every resident entry)
        keys: Vec<String>,
    },

    /// Print usage gauges (bytes, entries, limit) in Prometheus text format
    Stats,

    /// Validate the configuration and, optionally, a credentials file
    Validate {
        /// passwd-style file with `bucket:secret_id:secret_key` lines
        #[arg(long, env = "BUCKETCACHE_PASSWD_FILE")]
        passwd_file: Option<PathBuf>,
    },
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let config = load_config(&args)?;
    config.validate().context("invalid configuration")?;

    match &args.command {
        Command::Validate { passwd_file } => validate(&config, passwd_file.as_deref()),
        Command::Scan => scan(&config).await,
        Command::Evict => evict(&config).await,
        Command::Stats => stats(&config).await,
        Command::Verify {
            remote_dir,
            no_remote_crc,
            keys,
        } => verify(config, remote_dir, *no_remote_crc, keys).await,
    }
}

fn load_config(args: &Args) -> anyhow::Result<CacheConfig> {
    let mut config = match &args.config {
        Some(path) => CacheConfig::from_yaml_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => CacheConfig::default(),
    };
    if let Some(root) = &args.cache_root {
        config.cache_root = root.clone();
    }
    if let Some(bucket) = &args.bucket {
        config.bucket_name = bucket.clone();
    }
    if args.size_limit.is_some() {
        config.size_limit_bytes = args.size_limit;
    }
    if config.bucket_endpoint.is_empty() {
        config.bucket_endpoint = "http://localhost".to_string();
    }
    Ok(config)
}

fn publisher() -> Arc<dyn EventPublisher> {
    Arc::new(LoggingEventPublisher::info_level())
}

// =============================================================================
// Commands
// =============================================================================

fn validate(config: &CacheConfig, passwd_file: Option<&std::path::Path>) -> anyhow::Result<()> {
    if let Some(path) = passwd_file {
        let credentials = Credentials::from_passwd_file(path, &config.bucket_name)?;
        info!(secret_id = %credentials.secret_id, "Credentials found");
    }
    println!(
        "ok: bucket={} root={} limit={}",
        config.bucket_name,
        config.cache_root.display(),
        config
            .limit()
            .max_total_bytes
            .map(|b| b.to_string())
            .unwrap_or_else(|| "unbounded".to_string())
    );
    Ok(())
}

async fn scan(config: &CacheConfig) -> anyhow::Result<()> {
    let cache = Cache::open(config, publisher()).await?;
    let report = cache.scan().await?;
    cache.shutdown().await;

    println!("entries:     {}", report.entries);
    println!("total_bytes: {}", report.total_bytes);
    for key in &report.data_only {
        println!("data-only:   {}", key);
    }
    for key in &report.meta_only {
        println!("stat-only:   {}", key);
    }
    for key in &report.size_mismatch {
        println!("size-differs: {}", key);
    }
    if !report.is_consistent() {
        bail!("cache subtrees disagree");
    }
    Ok(())
}

async fn evict(config: &CacheConfig) -> anyhow::Result<()> {
    let cache = Cache::open(config, publisher()).await?;
    let evicted = cache.evict_now().await;
    let expired = cache.expire_now().await;
    cache.shutdown().await;

    println!(
        "evicted {} entries ({} bytes), expired {} entries ({} bytes); {} bytes in use",
        evicted.removed.len(),
        evicted.freed_bytes(),
        expired.removed.len(),
        expired.freed_bytes(),
        cache.total_bytes()
    );
    if evicted.failures + expired.failures > 0 {
        warn!(
            failures = evicted.failures + expired.failures,
            "Some entries could not be removed"
        );
    }
    Ok(())
}

async fn stats(config: &CacheConfig) -> anyhow::Result<()> {
    let cache = Cache::open(config, publisher()).await?;
    print!("{}", cache.render_usage()?);
    cache.shutdown().await;
    Ok(())
}

async fn verify(
    config: CacheConfig,
    remote_dir: &std::path::Path,
    no_remote_crc: bool,
    keys: &[String],
) -> anyhow::Result<()> {
    let remote = Arc::new(DirectoryRemote::new(remote_dir).with_checksums(!no_remote_crc));
    let ctx = CacheContext::open(config, remote, publisher()).await?;

    let keys: Vec<CacheKey> = if keys.is_empty() {
        ctx.cache()
            .entries()
            .into_iter()
            .filter(|e| e.is_resident())
            .map(|e| e.relative_path)
            .collect()
    } else {
        keys.iter()
            .map(CacheKey::new)
            .collect::<bucketcache::Result<_>>()?
    };

    let ctx = &ctx;
    let results: Vec<_> = stream::iter(&keys)
        .map(|key| async move { (key, ctx.verify_cached(key).await) })
        .buffer_unordered(VERIFY_CONCURRENCY)
        .collect()
        .await;

    let mut failed = 0usize;
    for (key, result) in results {
        match result {
            Ok(Some(report)) => println!(
                "ok       {} len={} crc64={:016x} mode={:?}",
                key, report.local_len, report.local_crc64, report.mode
            ),
            Ok(None) => println!("uncached {}", key),
            Err(e @ Error::ChecksumMismatch { .. }) => {
                failed += 1;
                println!("MISMATCH {}: {}", key, e);
            }
            Err(e) => {
                failed += 1;
                println!("error    {}: {}", key, e);
            }
        }
    }
    ctx.shutdown().await;

    if failed > 0 {
        bail!("{} of {} entries failed verification", failed, keys.len());
    }
    Ok(())
}

// =============================================================================
// Logging
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
