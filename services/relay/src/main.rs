//! uproxy
//!
//! Multi-protocol relay.
//!
//! This binary:
//! - Loads routes from a JSON config file (or builds one interactively)
//! - Relays TCP and UDP traffic with PROXY protocol v2 client identity
//! - Terminates TLS with per-domain certificates and forwards HTTP by Host
//! - Runs until Ctrl-C or until every route has stopped

use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use clap::{Parser, ValueEnum};
use colored::Colorize;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use uproxy_relay::{Config, RelaySupervisor};

mod prompt;

/// Relay TCP, UDP and HTTPS traffic to configured backends.
#[derive(Debug, Parser)]
#[command(name = "uproxy")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(long, short, env = "UPROXY_CONFIG", default_value = "config.json")]
    config: PathBuf,

    /// Log level used when RUST_LOG is not set.
    #[arg(long, env = "UPROXY_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Validate the configuration and exit.
    #[arg(long)]
    check: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    init_tracing(&cli);

    let config = load_or_create_config(&cli.config)?;

    if cli.check {
        println!(
            "{} {} ({} routes)",
            "Configuration OK:".green().bold(),
            cli.config.display(),
            config.route_count()
        );
        return Ok(());
    }

    info!("Starting uproxy");
    info!(
        config = %cli.config.display(),
        debug_mode = config.debug_mode,
        l4_routes = config.proxies.len(),
        https_routes = config.reverse_proxies.len(),
        "Configuration loaded"
    );

    let supervisor = RelaySupervisor::from_config(&config)?;

    tokio::select! {
        result = supervisor.run() => result?,
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Shutdown requested");
        }
    }

    Ok(())
}

// Prefer RUST_LOG, fall back to --log-level / UPROXY_LOG_LEVEL.
fn init_tracing(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    let registry = tracing_subscriber::registry().with(filter);

    match cli.log_format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }
}

fn load_or_create_config(path: &Path) -> Result<Config> {
    if path.exists() {
        return Config::load(path);
    }

    if !io::stdin().is_terminal() {
        bail!(
            "config file {} not found and stdin is not interactive",
            path.display()
        );
    }

    warn!(path = %path.display(), "Config file not found, starting setup");
    let config = prompt::Wizard::new(io::stdin().lock(), io::stdout()).run()?;
    config.validate()?;
    config.save(path)?;
    info!(path = %path.display(), "Configuration saved");

    Ok(config)
}
