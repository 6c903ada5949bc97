use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use graphpool::config::{Config, ConfigError};
use graphpool::core::{annotations, EndpointSelector};
use graphpool::filter::FilterChain;
use graphpool::utils::format_duration;
use graphpool::{GraphPool, RefreshAgent, RequestMessage};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::runtime::Handle;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "graphpool")]
#[command(about = "Topology-aware connection pooling for clustered graph databases")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve the endpoints a selector yields from the configured topology
    Endpoints {
        /// Path to configuration file
        #[arg(short, long, default_value = "config/dev.toml")]
        config: PathBuf,
        /// Selector to apply instead of the configured one
        #[arg(short, long)]
        selector: Option<EndpointSelector>,
    },
    /// Open pools to the configured cluster and acquire one connection
    Probe {
        /// Path to configuration file
        #[arg(short, long, default_value = "config/dev.toml")]
        config: PathBuf,
    },
    /// Generate example configuration files
    Config {
        /// Topology source (static or file)
        #[arg(short, long)]
        source: String,
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
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Endpoints { config, selector } => show_endpoints(config, selector).await?,
        Commands::Probe { config } => probe(config).await?,
        Commands::Config { source, output } => generate_config(source, output)?,
        Commands::Validate { config } => validate_config(config)?,
        Commands::Version => show_version(),
    }

    Ok(())
}

fn load_config(config_path: &Path) -> Result<Config> {
    let config = Config::load_from_file(config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;
    init_logging(&config)?;
    info!("Configuration loaded from: {:?}", config_path);
    Ok(config)
}

async fn show_endpoints(config_path: PathBuf, selector: Option<EndpointSelector>) -> Result<()> {
    let config = load_config(&config_path)?;
    let selector = selector.unwrap_or(config.refresh.selector);

    let agent = RefreshAgent::new(config.refresh.fetcher(), Handle::current());
    let endpoints = agent.get_endpoints(selector, true).await?;
    let filter = FilterChain::baseline(Some(config.filter.build()));
    let partition = endpoints.partition(&filter);

    println!(
        "Selector {} yields {} endpoints ({} rejected)",
        selector,
        partition.accepted.len(),
        partition.rejected.len()
    );
    for (i, endpoint) in partition.accepted.iter().enumerate() {
        println!("  {}: {}", i + 1, endpoint);
    }
    for endpoint in partition.rejected.iter() {
        println!(
            "  ✗ {} ({})",
            endpoint.address(),
            endpoint
                .annotation(annotations::REJECTED_REASON)
                .unwrap_or("unknown")
        );
    }
    Ok(())
}

async fn probe(config_path: PathBuf) -> Result<()> {
    let config = load_config(&config_path)?;
    let started = Instant::now();

    let mut pool = GraphPool::start(config)
        .await
        .context("Failed to start graphpool")?;
    let request = RequestMessage::new("probe");
    let result = pool.client().acquire(&request).await;
    let elapsed = started.elapsed();

    let outcome = match result {
        Ok(connection) => {
            pool.client().complete_request(request.trace_id(), elapsed);
            println!(
                "✓ Acquired a connection to {} in {}",
                connection.address(),
                format_duration(elapsed)
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ No connection after {}: {}", format_duration(elapsed), e);
            Err(e.into())
        }
    };

    let rejected = pool.client().rejected_endpoints();
    if !rejected.is_empty() {
        println!("  Rejected endpoints:");
        for endpoint in rejected.iter() {
            println!("    {}", endpoint);
        }
    }
    pool.shutdown().await;
    outcome
}

fn generate_config(source: String, output: PathBuf) -> Result<()> {
    println!("Generating {} configuration file: {:?}", source, output);

    Config::create_example_config(&output, &source).context("Failed to generate config")?;

    println!("Configuration file generated successfully!");
    println!("Edit the file to match your environment and run:");
    println!("  graphpool probe --config {:?}", output);

    Ok(())
}

fn validate_config(config_path: PathBuf) -> Result<()> {
    println!("Validating configuration file: {:?}", config_path);

    match Config::load_from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration file is valid");
            println!("  Selector: {}", config.refresh.selector);
            println!("  Topology source: {:?}", config.refresh.source);
            println!("  Refresh interval: {}s", config.refresh.interval_sec);
            println!("  Strategy: {}", config.strategy.build().name());
            println!(
                "  Max wait: {}",
                format_duration(config.client.acquire_settings().max_wait)
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration file validation failed:");
            match &e {
                ConfigError::IoError(msg) => eprintln!("  File error: {}", msg),
                ConfigError::ParseError(msg) => eprintln!("  Parse error: {}", msg),
                ConfigError::ValidationError(msg) => eprintln!("  Validation error: {}", msg),
                other => eprintln!("  {}", other),
            }
            Err(e.into())
        }
    }
}

fn show_version() {
    println!("graphpool v{}", env!("CARGO_PKG_VERSION"));
    println!("Topology-aware connection pooling for clustered graph databases");
    println!();
    println!("Target: {}", std::env::consts::ARCH);
    println!();
    println!("Selectors:");
    for selector in EndpointSelector::ALL_VARIANTS {
        println!("  • {}", selector);
    }
}

fn init_logging(config: &Config) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = if config.logging.format == "json" {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    info!("Logging initialized at level: {}", config.logging.level);
    Ok(())
}
