//! Publishing CLI - Main entry point

use clap::Parser;
use publish_cli::{commands, Cli, Commands};
use publish_common::logging::{init_logging, LogConfig, LogLevel, LogOutput};
use publish_server::{config::Config, publishing::PublishKind};
use std::process;
use tracing::error;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_config = LogConfig::builder()
        .level(if cli.verbose { LogLevel::Debug } else { LogLevel::Warn })
        .output(LogOutput::Console)
        .log_file_prefix("publish-cli".to_string())
        .build();

    // Environment variables take precedence
    let log_config = LogConfig::from_env().unwrap_or(log_config);

    // The CLI works without logging
    let _ = init_logging(&log_config);

    if let Err(e) = execute_command(&cli).await {
        error!(error = %format!("{:#}", e), "Command failed");
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

async fn execute_command(cli: &Cli) -> anyhow::Result<()> {
    let config = Config::load()?;

    match &cli.command {
        Commands::Publish { resource_id, run } => {
            commands::publish(&config, *resource_id, PublishKind::Full, run).await
        },
        Commands::Traits { resource_id, run } => {
            commands::publish(&config, *resource_id, PublishKind::TraitsOnly, run).await
        },
        Commands::LoadFile {
            resource_id,
            entity,
            path,
        } => commands::load_file(&config, *resource_id, *entity, path).await,
        Commands::UpdateAttributes {
            resource_id,
            entity,
            fields,
            from_dir,
        } => commands::update_attributes(&config, *resource_id, *entity, fields, from_dir.clone()).await,
        Commands::AllClear { yes } => commands::all_clear(&config, *yes).await,
        Commands::Status {
            resource_id,
            events,
            json,
        } => commands::status(&config, *resource_id, *events, *json).await,
    }
}
