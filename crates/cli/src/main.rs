mod commands;
mod config;
mod progress;

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::config::AppConfig;

#[derive(Parser)]
#[command(
    name = "partstore",
    version,
    about = "Move backup parts between local, S3 and Azure Blob storage"
)]
struct Cli {
    #[command(subcommand)]
    command: commands::Command,

    /// Log debug detail from the storage backends
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    log_json: bool,

    /// Config file (default: partstore.toml in the user config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

/// Env var holding a tracing filter; overrides `--verbose`.
const LOG_ENV: &str = "PARTSTORE_LOG";

fn log_filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("warn,partstore=debug,partstore_core=debug")
        } else {
            EnvFilter::new("warn,partstore=info,partstore_core=info")
        }
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // stdout carries command output (`ls --json`); logs go to stderr.
    let logs = tracing_subscriber::fmt()
        .with_env_filter(log_filter(cli.verbose))
        .with_writer(std::io::stderr);
    if cli.log_json {
        logs.json().init();
    } else {
        logs.with_target(cli.verbose).init();
    }

    let config_path = cli.config.unwrap_or_else(AppConfig::default_path);

    match cli.command {
        commands::Command::Remote(args) => commands::remote::run(args, &config_path).await,
        commands::Command::Ls(args) => commands::ls::run(args, &config_path).await,
        commands::Command::Put(args) => commands::put::run(args, &config_path).await,
        commands::Command::Get(args) => commands::get::run(args, &config_path).await,
        commands::Command::Cp(args) => commands::cp::run(args, &config_path).await,
        commands::Command::Rm(args) => commands::rm::run(args, &config_path).await,
        commands::Command::Cleanup(args) => commands::cleanup::run(args, &config_path).await,
    }
}
