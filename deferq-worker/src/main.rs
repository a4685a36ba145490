//! deferq worker
//!
//! Entry point with configuration loading, tracing setup and the
//! `check-config` and `demo` commands.

use std::time::Duration;

use deferq_config::{validate_config, Backend, Config};
use deferq_worker::{apply_demo_defaults, run_demo};

mod cli;
mod tracing_setup;

use cli::{CliArgs, Command};
use tracing_setup::install_tracing_from_config;

const DEFAULT_DEMO_SECONDS: u64 = 5;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    eprintln!("[STARTUP] deferq worker starting...");
    let args = match CliArgs::parse() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{e}");
            CliArgs::print_help();
            std::process::exit(2);
        }
    };

    let command = match args.command {
        Some(command) if !args.help_requested => command,
        _ => {
            CliArgs::print_help();
            return Ok(());
        }
    };

    // Resolve config path: CLI > environment variable
    let config_path = args
        .config_path
        .or_else(|| std::env::var("DEFERQ_CONFIG_PATH").ok());

    eprintln!("[STARTUP] Loading config from: {:?}", config_path);
    let mut config = load_config(&config_path)?;
    if let Some(backend) = args.backend.as_deref() {
        config.monitor.backend = backend.parse::<Backend>().map_err(anyhow::Error::msg)?;
    }
    if command == Command::Demo {
        apply_demo_defaults(&mut config);
    }
    validate_config(&config).map_err(|e| {
        eprintln!("invalid configuration: {e}");
        anyhow::anyhow!(e.to_string())
    })?;
    eprintln!("[STARTUP] Config loaded successfully");

    match command {
        Command::CheckConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Command::Demo => {
            eprintln!("[STARTUP] Initializing tracing...");
            install_tracing_from_config(&config.logging);
            eprintln!("[STARTUP] Tracing initialized");

            let seconds = args.seconds.unwrap_or(DEFAULT_DEMO_SECONDS);
            tracing::info!(
                backend = %config.monitor.backend,
                queue = %config.monitor.queue_name,
                seconds,
                "starting demo"
            );
            let report = run_demo(&config, Duration::from_secs(seconds)).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}

/// Load configuration from file or defaults.
fn load_config(path: &Option<String>) -> anyhow::Result<Config> {
    deferq_config::load_config(path.as_deref()).map_err(|e| {
        eprintln!("failed to load configuration: {e}");
        anyhow::anyhow!(e.to_string())
    })
}
