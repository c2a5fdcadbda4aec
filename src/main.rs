use anyhow::{bail, Context};
use async_trait::async_trait;
use centinela::cache::{Session, SessionStore};
use centinela::config::{Config, ConfigError};
use centinela::error::CacheResult;
use centinela::Centinela;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "centinela")]
#[command(about = "A resilient session cache in front of a Redis Sentinel cluster")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the cache and report health until Ctrl-C
    Run {
        /// Path to configuration file
        #[arg(short, long, default_value = "config/dev.toml")]
        config: PathBuf,
        /// Seconds between health log lines
        #[arg(long, default_value_t = 30)]
        report_interval: u64,
    },
    /// Generate an example configuration file
    Config {
        /// Profile (sentinel or passthrough)
        #[arg(short, long, default_value = "sentinel")]
        profile: String,
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Validate configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Resolve the topology once and print the health document
    Health {
        /// Path to configuration file
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Show version information
    Version,
}

/// Store used when the binary runs on its own. It knows no sessions, so
/// every lookup is a miss; applications embed the library with their own
/// store of record.
struct DetachedStore;

#[async_trait]
impl SessionStore for DetachedStore {
    async fn validate_session_from_source(&self, _token: &str) -> CacheResult<Option<Session>> {
        Ok(None)
    }

    async fn revoke_session(&self, _session_id: &str) -> CacheResult<bool> {
        Ok(false)
    }

    async fn revoke_all_user_sessions(&self, _user_id: &str) -> CacheResult<u64> {
        Ok(0)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            report_interval,
        } => run(config, report_interval).await,
        Commands::Config { profile, output } => generate_config(profile, output),
        Commands::Validate { config } => validate_config(config),
        Commands::Health { config } => health(config).await,
        Commands::Version => {
            show_version();
            Ok(())
        }
    }
}

async fn run(config_path: PathBuf, report_interval: u64) -> anyhow::Result<()> {
    let config = Config::load_from_file(&config_path)
        .with_context(|| format!("failed to load config from {:?}", config_path))?;
    init_logging(&config)?;

    info!(version = env!("CARGO_PKG_VERSION"), config = ?config_path, "starting centinela");
    info!(
        seeds = ?config.sentinel.seeds,
        master = %config.sentinel.master_name,
        enabled = config.cache.enabled,
        "configuration loaded"
    );

    let mut node = Centinela::new(config, Arc::new(DetachedStore))?;
    node.start().await?;

    let mut ticker = tokio::time::interval(Duration::from_secs(report_interval.max(1)));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let report = node.health();
                match report.to_json() {
                    Ok(json) => info!(status = %report.status, "health: {}", json),
                    Err(e) => warn!(error = %e, "failed to serialise health report"),
                }
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for Ctrl-C")?;
                info!("shutdown requested");
                break;
            }
        }
    }

    node.shutdown().await;
    Ok(())
}

async fn health(config_path: PathBuf) -> anyhow::Result<()> {
    let mut config = Config::load_from_file(&config_path)
        .with_context(|| format!("failed to load config from {:?}", config_path))?;
    config.logging.level = "warn".to_string();
    init_logging(&config)?;

    let mut node = Centinela::new(config, Arc::new(DetachedStore))?;
    node.start().await?;
    let report = node.health();
    println!("{}", report.to_json()?);
    node.shutdown().await;
    Ok(())
}

fn generate_config(profile: String, output: PathBuf) -> anyhow::Result<()> {
    println!("Generating {} configuration file: {:?}", profile, output);

    Config::create_example_config(&output, &profile).context("failed to generate config")?;

    println!("Configuration file generated successfully!");
    println!("Edit the file to match your environment and run:");
    println!("  centinela run --config {:?}", output);
    Ok(())
}

fn validate_config(config_path: PathBuf) -> anyhow::Result<()> {
    println!("Validating configuration file: {:?}", config_path);

    match Config::load_from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration file is valid");
            println!("  Cache enabled: {}", config.cache.enabled);
            println!("  Session TTL: {}s", config.cache.session_ttl_sec);
            println!("  Key prefix: {}", config.cache.key_prefix);
            println!("  Master name: {}", config.sentinel.master_name);
            println!("  Sentinels: {} instances", config.sentinel.seeds.len());
            for (i, seed) in config.sentinel.seeds.iter().enumerate() {
                println!("    {}: {}", i + 1, seed);
            }
            println!(
                "  Pools: read max {} / write max {}",
                config.pool.read.max_size, config.pool.write.max_size
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration file validation failed:");
            match &e {
                ConfigError::IoError(msg) => eprintln!("  File error: {}", msg),
                ConfigError::ParseError(msg) => eprintln!("  Parse error: {}", msg),
                ConfigError::ValidationError(msg) => eprintln!("  Validation error: {}", msg),
                ConfigError::SerializeError(msg) => eprintln!("  Serialization error: {}", msg),
            }
            bail!(e)
        }
    }
}

fn show_version() {
    println!("centinela v{}", env!("CARGO_PKG_VERSION"));
    println!("A resilient session cache in front of a Redis Sentinel cluster");
    println!();
    println!("Target: {}", std::env::consts::ARCH);
    println!();
    println!("Features:");
    println!("  • Sentinel topology discovery with failover notifications");
    println!("  • Separate read and write pools with primary role verification");
    println!("  • Per-role circuit breakers with exponential open backoff");
    println!("  • Cache-aside session validation with fenced invalidation");
}

fn init_logging(config: &Config) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))
        .context("invalid log level")?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = match config.logging.format.as_str() {
        "json" => builder.json().try_init(),
        _ => builder.try_init(),
    };
    result.map_err(|e| anyhow::anyhow!("failed to initialise logging: {}", e))
}
