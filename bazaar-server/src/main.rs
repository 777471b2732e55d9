#![cfg_attr(not(test), forbid(unsafe_code))]

//! Command-line entry point for the Bazaar server.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use server::server;
use shared::config::server::Config;

mod commands;

/// Bazaar chat, notifications and payments backend
#[derive(Parser)]
#[command(name = "bazaar")]
#[command(about = "Backend server and tools for Bazaar", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the backend server
    Serve {
        /// The port number to bind the server to (e.g., 8080)
        #[arg(long, short, help = "The port number to bind the server to (e.g., 8080)")]
        port: Option<u16>,

        /// Path to the configuration file (optional)
        #[arg(
            long,
            short,
            help = "Path to the configuration file (config.yaml or config.json). Defaults are used when omitted."
        )]
        config: Option<PathBuf>,
    },
    /// Generate the OpenAPI specification
    Openapi {
        /// Output path (format from the extension), or "json"/"yaml" to stream to stdout
        output_path: Option<String>,
    },
    /// Write a configuration file with the default values
    Config {
        /// Format of the configuration file (yaml or json)
        #[arg(long, short, default_value = "yaml")]
        format: String,

        /// Where to write the file
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { port, config } => {
            let resolved = Config::load_config(config, port).context("invalid configuration")?;
            server::run(resolved).await.context("server exited")?;
        }
        Commands::Openapi { output_path } => {
            commands::spec::generate_spec(output_path.as_deref())?;
        }
        Commands::Config { format, output } => {
            let path = commands::config::generate_config(&format, output)?;
            println!("Configuration file '{}' generated.", path.display());
        }
    }

    Ok(())
}
