//! WolfRepl - Replication Transport
//!
//! Runs one site of a replication group: accepts and opens connections to
//! the configured sites and logs the replication traffic it receives.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfrepl::config::RepConfig;
use wolfrepl::error::Result;
use wolfrepl::transport::RepTransport;

/// WolfRepl - Replication Transport
#[derive(Parser)]
#[command(name = "wolfrepl")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfrepl.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run this site until interrupted
    Start,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfrepl.toml")]
        output: PathBuf,

        /// Advertised host name of this site
        #[arg(long, default_value = "localhost")]
        host: String,

        /// Listen port of this site
        #[arg(long, default_value_t = 6000)]
        port: u16,
    },

    /// Validate configuration file
    Validate,

    /// Print the effective configuration as JSON
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start => {
            let config = RepConfig::from_file(&cli.config)?;
            let level = cli.log_level.unwrap_or_else(|| config.logging.level.clone());
            init_logging(&level, &config.logging.format);
            run_start(config).await
        }
        Commands::Init { output, host, port } => {
            init_logging(cli.log_level.as_deref().unwrap_or("info"), "pretty");
            run_init(output, host, port)
        }
        Commands::Validate => run_validate(cli.config),
        Commands::Info => run_info(cli.config),
    }
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "compact" {
        registry.with(tracing_subscriber::fmt::layer().compact()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Run the transport until Ctrl+C
async fn run_start(config: RepConfig) -> Result<()> {
    tracing::info!(
        "Starting site {}:{} (priority {}, {} policy)",
        config.node.host,
        config.node.port,
        config.node.priority,
        config.replication.ack_policy
    );

    let (incoming_tx, mut incoming_rx) = mpsc::channel(1024);
    let transport = RepTransport::new(config, incoming_tx, None)?;
    let addr = transport.start().await?;
    tracing::info!("Replication transport listening on {}", addr);

    loop {
        tokio::select! {
            msg = incoming_rx.recv() => match msg {
                Some(msg) => tracing::info!(
                    "Replication message from site {}: {} control / {} payload bytes",
                    msg.eid,
                    msg.control.len(),
                    msg.payload.len()
                ),
                None => break,
            },
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    tracing::error!("Failed to listen for Ctrl+C: {}", e);
                }
                break;
            }
        }
    }

    let stats = transport.stats().await;
    transport.shutdown().await;
    tracing::info!(
        "Stopped: {} queued, {} dropped, {} connection(s) dropped, {} perm failure(s)",
        stats.messages_queued,
        stats.messages_dropped,
        stats.connections_dropped,
        stats.perm_failed
    );
    Ok(())
}

/// Generate a new configuration file
fn run_init(output: PathBuf, host: String, port: u16) -> Result<()> {
    let config_content = format!(
        r#"# WolfRepl Configuration
# Generated configuration file

[node]
host = "{host}"
port = {port}
# Election priority; 0 makes this site a client that never counts toward quorum
priority = 100
# bind_address = "0.0.0.0:{port}"

[sites]
remotes = []
# remotes = ["db-2.example.com:6000", "db-3.example.com:6000"]

[replication]
# none, one, one_peer, all, all_peers, quorum
ack_policy = "quorum"
ack_timeout_ms = 1000
queue_limit = 10
two_site_strict = false
connect_timeout_ms = 2000
connection_retry_ms = 30000
heartbeat_interval_ms = 0

[logging]
level = "info"
format = "pretty"
"#
    );

    std::fs::write(&output, config_content)?;
    tracing::info!("Created configuration file: {:?}", output);
    println!("Configuration file created: {:?}", output);
    println!("Edit the file to list the other sites, then run: wolfrepl start");

    Ok(())
}

/// Validate configuration file
fn run_validate(config_path: PathBuf) -> Result<()> {
    match RepConfig::from_file(&config_path) {
        Ok(config) => {
            let policy = config.perm_policy();
            let site_count = config.sites.remotes.len() + 1;
            println!("✓ Configuration is valid");
            println!("  Site: {}:{}", config.node.host, config.node.port);
            println!("  Remote Sites: {}", config.sites.remotes.len());
            println!("  Ack Policy: {}", policy.ack_policy);
            match policy.required_ack_count(site_count) {
                Some(required) => println!("  Required Acks: {:?}", required),
                None => println!("  Required Acks: (not precomputed)"),
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Show the effective configuration
fn run_info(config_path: PathBuf) -> Result<()> {
    let config = RepConfig::from_file(&config_path)?;
    let json = serde_json::to_string_pretty(&config)
        .map_err(|e| wolfrepl::Error::Config(e.to_string()))?;
    println!("{}", json);
    Ok(())
}
