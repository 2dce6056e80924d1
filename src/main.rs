//! listenerd
//!
//! Thin entry points over one reusable lifecycle: `serve` runs the main
//! server, `orders` runs the orders server (no health listener, no cache),
//! and `check-config` validates a configuration file without serving.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use listenerd::config::{load_config, ServeConfig};
use listenerd::lifecycle::{prepare, Profile};
use listenerd::observability::logging;
use listenerd::BuildInfo;

#[derive(Parser)]
#[command(name = "listenerd")]
#[command(about = "Multi-listener server with coordinated graceful shutdown", long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the main server
    Serve,
    /// Start the orders server
    Orders,
    /// Validate the configuration and print it
    CheckConfig,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match read_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let profile = match cli.command {
        Commands::Serve => Profile::Serve,
        Commands::Orders => Profile::Orders,
        Commands::CheckConfig => return check_config(&config),
    };

    if let Err(e) = logging::init_logging(&config.observability) {
        eprintln!("Error: {}", e);
        return ExitCode::FAILURE;
    }

    let build = BuildInfo::from_env();
    tracing::info!(
        service = profile.service_name(),
        version = %build.version,
        git_branch = %build.git_branch,
        git_commit = %build.git_commit,
        "Starting"
    );

    let lifecycle = match prepare(&config, profile, build).await {
        Ok(lifecycle) => lifecycle,
        Err(e) => {
            tracing::error!(error = %e, "Startup failed");
            logging::flush();
            return ExitCode::FAILURE;
        }
    };

    match lifecycle.run().await {
        Ok(completion) => ExitCode::from(completion.exit_code()),
        Err(e) => {
            tracing::error!(error = %e, "Failed to register signal handlers");
            logging::flush();
            ExitCode::FAILURE
        }
    }
}

fn read_config(path: Option<&Path>) -> Result<ServeConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => Ok(load_config(path)?),
        None => Ok(ServeConfig::default()),
    }
}

fn check_config(config: &ServeConfig) -> ExitCode {
    match toml::to_string_pretty(config) {
        Ok(rendered) => {
            println!("{}", rendered);
            println!("# configuration OK");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
