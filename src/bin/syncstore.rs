//! syncstore CLI binary

use clap::Parser;
use std::process;
use syncable_store::cli::{init_workspace, load_config, Cli, Commands, RunContext};
use syncable_store::logging::{init_logging, LoggingConfig};
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let logging_config = build_logging_config(&cli);
    if let Err(e) = init_logging(Some(&logging_config)) {
        eprintln!("Failed to initialize logging: {}", e);
        process::exit(1);
    }
    info!("syncstore starting");

    match run(&cli).await {
        Ok(output) => println!("{}", output),
        Err(e) => {
            error!("Command failed: {:#}", e);
            eprintln!("Error: {:#}", e);
            process::exit(1);
        }
    }
}

async fn run(cli: &Cli) -> anyhow::Result<String> {
    let config_path = cli.config.as_deref();
    if let Commands::Init {
        name,
        storage_root,
        creator,
        force,
    } = &cli.command
    {
        return init_workspace(
            &cli.workspace,
            config_path,
            name.as_deref(),
            storage_root.as_deref(),
            creator.as_deref(),
            *force,
        )
        .await;
    }

    let context = RunContext::open(&cli.workspace, config_path).await?;
    let result = context.execute(&cli.command).await;
    context.shutdown().await;
    result
}

/// Logging from the config file, overridden by command line flags. Off
/// unless `--verbose` is given.
fn build_logging_config(cli: &Cli) -> LoggingConfig {
    if !cli.verbose {
        return LoggingConfig {
            level: "off".to_string(),
            ..LoggingConfig::default()
        };
    }

    let mut config = load_config(&cli.workspace, cli.config.as_deref())
        .map(|c| c.logging)
        .unwrap_or_default();
    if let Some(level) = &cli.log_level {
        config.level = level.clone();
    }
    if let Some(format) = &cli.log_format {
        config.format = format.clone();
    }
    config
}
