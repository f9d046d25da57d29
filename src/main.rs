//! # Cadence: paced outbound campaign runner
//!
//! Usage:
//!   cadence serve                       # Start the gateway and the periodic trigger
//!   cadence serve --port 8080           # Custom port
//!   cadence trigger --max-runs 10       # Invoke the tick once through the HTTP endpoint
//!   cadence init-config                 # Write ~/.cadence/config.toml with defaults

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use cadence_core::config::CadenceConfig;
use cadence_trigger::InvocationSource;

#[derive(Parser)]
#[command(name = "cadence", version, about = "📬 Cadence: paced outbound campaign runner")]
struct Cli {
    /// Config file (default: ~/.cadence/config.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the HTTP gateway and the periodic tick trigger
    Serve {
        /// Gateway port (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Invoke the tick once through the configured endpoint
    Trigger {
        /// Runs to advance (default: scheduler.max_runs_per_tick)
        #[arg(long)]
        max_runs: Option<u32>,
    },
    /// Write a default config file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn expand_path(p: &str) -> String {
    shellexpand::tilde(p).to_string()
}

fn config_path(cli: &Cli) -> PathBuf {
    cli.config
        .as_deref()
        .map(|p| PathBuf::from(expand_path(p)))
        .unwrap_or_else(CadenceConfig::default_path)
}

fn load_config(cli: &Cli) -> Result<CadenceConfig> {
    let path = config_path(cli);
    let mut config = if path.exists() {
        tracing::info!("📂 Config: {}", path.display());
        CadenceConfig::load_from(&path)?
    } else {
        if cli.config.is_some() {
            anyhow::bail!("config file not found: {}", path.display());
        }
        tracing::info!("📂 No config at {}, using defaults", path.display());
        CadenceConfig::default().with_env_overrides()
    };
    config.scheduler.db_path = expand_path(&config.scheduler.db_path);
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        "cadence=debug,tower_http=debug"
    } else {
        "cadence=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    match &cli.command {
        Command::Serve { port } => {
            let mut config = load_config(&cli)?;
            if let Some(port) = port {
                config.gateway.port = *port;
            }
            cadence_gateway::start(config).await
        }
        Command::Trigger { max_runs } => {
            let config = load_config(&cli)?;
            let max_runs = max_runs.unwrap_or(config.scheduler.max_runs_per_tick);
            let invoker = cadence_trigger::http_invoker(&config.trigger, max_runs);
            let result = invoker.invoke(InvocationSource::Manual).await;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.ok {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::InitConfig { force } => {
            let path = config_path(&cli);
            if path.exists() && !force {
                println!("⚠️  {} already exists (use --force to overwrite)", path.display());
                return Ok(());
            }
            CadenceConfig::default().save_to(&path)?;
            println!("✅ Config written to {}", path.display());
            Ok(())
        }
    }
}
