// SPDX-FileCopyrightText: © 2025 StreamScribe Contributors
//
// SPDX-License-Identifier: MPL-2.0

use clap::{Parser, Subcommand};
use tracing::{error, info};

use crate::config;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Starts the transcription proxy (default)
    Serve,
    /// Manage configuration
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Print the default configuration as TOML
    Default,
}

/// Handle the "serve" command - start the server.
/// Exits the process on error with status code 1.
// Allow eprintln before logging is initialized (CLI output)
#[allow(clippy::disallowed_macros)]
async fn handle_serve_command() {
    let config = match config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            std::process::exit(1);
        },
    };

    let _log_guard = match crate::logging::init_logging(&config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            std::process::exit(1);
        },
    };

    let _meter_provider = match crate::telemetry::init_metrics(config.otlp_endpoint.as_deref()) {
        Ok(provider) => Some(provider),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to initialize metrics");
            None
        },
    };

    // Without a single usable provider the proxy cannot do anything.
    let Some(default_provider) = config.default_provider() else {
        error!(
            priority = %config.providers_priority,
            "no transcription provider has credentials; set OPENAI_API_KEY, GEMINI_API_KEY, \
             DEEPGRAM_API_KEY or ENABLE_DUMMY_PROVIDER"
        );
        std::process::exit(1);
    };

    info!(
        host = %config.host,
        port = config.port,
        default_provider = %default_provider,
        session_resume = config.session_resume_enabled,
        broadcast_transcripts = config.broadcast_transcripts,
        "Starting streamscribe proxy"
    );

    if let Err(e) = crate::server::start_server(config).await {
        error!(error = %e, "Failed to start server");
        std::process::exit(1);
    }
}

/// Handle the "config default" command - print default config to stdout.
// Allow println for CLI output to stdout (intentional)
#[allow(clippy::disallowed_macros)]
fn handle_config_default_command() {
    match config::generate_default() {
        Ok(toml_string) => {
            println!("# Default streamscribe configuration (set via environment)");
            println!("{toml_string}");
        },
        Err(e) => {
            eprintln!("Failed to generate default config: {e}");
            std::process::exit(1);
        },
    }
}

pub async fn handle_command(cli: &Cli) {
    match cli.command.as_ref().unwrap_or(&Commands::Serve) {
        Commands::Serve => handle_serve_command().await,
        Commands::Config(ConfigCommands::Default) => handle_config_default_command(),
    }
}
