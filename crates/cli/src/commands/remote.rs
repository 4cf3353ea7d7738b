use std::path::Path;

use anyhow::Result;
use clap::{Args, Subcommand};
use console::style;

use partstore_core::BackendConfig;
use partstore_core::backend::azure::AzureConfig;
use partstore_core::backend::local::LocalConfig;
use partstore_core::backend::s3::S3Config;

use crate::config::{AppConfig, RemoteConfig};

#[derive(Args)]
pub struct RemoteArgs {
    #[command(subcommand)]
    action: RemoteAction,
}

#[derive(Subcommand)]
enum RemoteAction {
    /// Add a new remote
    Add(AddArgs),
    /// List configured remotes
    List,
    /// Remove a remote
    Remove {
        /// Remote name to remove
        name: String,
    },
}

#[derive(Args)]
struct AddArgs {
    /// Remote name
    name: String,

    /// Backend type: local, s3 or azure
    #[arg(long = "type")]
    kind: String,

    /// Directory for local remotes
    #[arg(long)]
    path: Option<String>,

    /// S3 endpoint URL (empty for AWS)
    #[arg(long)]
    endpoint: Option<String>,

    /// S3 region
    #[arg(long, default_value = "auto")]
    region: String,

    /// S3 bucket name
    #[arg(long)]
    bucket: Option<String>,

    /// Azure storage account (default: $AZURE_STORAGE_ACCOUNT)
    #[arg(long)]
    account: Option<String>,

    /// Azure container name
    #[arg(long)]
    container: Option<String>,

    /// Access key (default: from the environment)
    #[arg(long)]
    access_key: Option<String>,

    /// S3 secret key (default: $AWS_SECRET_ACCESS_KEY)
    #[arg(long)]
    secret_key: Option<String>,

    /// Root directory inside the bucket or container
    #[arg(long, default_value = "")]
    dir: String,
}

fn backend_config(args: AddArgs) -> Result<BackendConfig> {
    let config = match args.kind.as_str() {
        "local" => {
            let path = args
                .path
                .ok_or_else(|| anyhow::anyhow!("--path required for local remote"))?;
            BackendConfig::Local(LocalConfig { path })
        }
        "s3" => {
            let bucket = args
                .bucket
                .ok_or_else(|| anyhow::anyhow!("--bucket required for S3 remote"))?;
            BackendConfig::S3(S3Config {
                endpoint: args.endpoint.unwrap_or_default(),
                region: args.region,
                bucket,
                access_key: args.access_key.unwrap_or_default(),
                secret_key: args.secret_key.unwrap_or_default(),
                dir: args.dir,
                page_size: None,
            })
        }
        "azure" => {
            let container = args
                .container
                .ok_or_else(|| anyhow::anyhow!("--container required for Azure remote"))?;
            BackendConfig::Azure(AzureConfig {
                account: args.account.unwrap_or_default(),
                access_key: args.access_key.unwrap_or_default(),
                container,
                dir: args.dir,
                page_size: None,
            })
        }
        other => anyhow::bail!("unknown backend: {other} (supported: local, s3, azure)"),
    };
    Ok(config)
}

pub async fn run(args: RemoteArgs, config_path: &Path) -> Result<()> {
    match args.action {
        RemoteAction::Add(add) => {
            let mut config = AppConfig::load_or_default(config_path)?;
            let name = add.name.clone();
            if config.find_remote(&name).is_some() {
                anyhow::bail!("remote '{name}' already exists");
            }
            let backend = backend_config(add)?;
            let shown = backend.build().to_string();
            config.remotes.push(RemoteConfig {
                name: name.clone(),
                backend,
            });
            config.save(config_path)?;
            println!("Remote '{name}' added: {shown}");
        }
        RemoteAction::List => {
            let config = AppConfig::load_or_default(config_path)?;
            if config.remotes.is_empty() {
                println!("No remotes configured.");
            } else {
                println!("{:<20} {:<8} {}", "NAME", "TYPE", "LOCATION");
                println!("{}", "-".repeat(70));
                for r in &config.remotes {
                    println!(
                        "{:<20} {:<8} {}",
                        style(&r.name).bold(),
                        r.backend.kind(),
                        r.backend.build()
                    );
                }
            }
        }
        RemoteAction::Remove { name } => {
            let mut config = AppConfig::load(config_path)?;
            let before = config.remotes.len();
            config
                .remotes
                .retain(|r| !r.name.eq_ignore_ascii_case(&name));
            if config.remotes.len() == before {
                anyhow::bail!("remote '{name}' not found");
            }
            config.save(config_path)?;
            println!("Remote '{name}' removed.");
        }
    }
    Ok(())
}
