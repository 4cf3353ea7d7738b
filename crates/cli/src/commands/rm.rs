use std::path::Path;

use anyhow::{Context, Result};
use clap::Args;
use dialoguer::Confirm;
use futures::TryStreamExt;
use tracing::info;

use partstore_core::{Backend, Part};

use crate::config::AppConfig;
use crate::progress;

#[derive(Args)]
pub struct RmArgs {
    /// Remote name
    remote: String,

    /// Only parts whose path starts with this prefix
    #[arg(long, default_value = "")]
    prefix: String,

    /// Skip the confirmation prompt
    #[arg(long)]
    yes: bool,
}

pub async fn delete_all(backend: &dyn Backend, parts: &[Part]) -> Result<u64> {
    let pb = progress::part_counter(parts.len() as u64, "rm");
    for part in parts {
        backend
            .delete_part(part)
            .await
            .with_context(|| format!("failed to delete {}", part.path))?;
        pb.inc(1);
    }
    pb.finish_and_clear();
    backend.remove_empty_dirs().await?;
    Ok(parts.len() as u64)
}

pub async fn run(args: RmArgs, config_path: &Path) -> Result<()> {
    let config = AppConfig::load(config_path)?;
    let backend = config.open_remote(&args.remote).await?;
    let parts: Vec<Part> = backend
        .list_parts(&args.prefix)
        .try_collect()
        .await
        .with_context(|| format!("failed to list {backend}"))?;
    if parts.is_empty() {
        println!("Nothing to delete.");
        backend.stop();
        return Ok(());
    }

    let total: u64 = parts.iter().map(|p| p.size).sum();
    if !args.yes {
        let confirmed = Confirm::new()
            .with_prompt(format!(
                "Delete {} parts ({}) from {}?",
                parts.len(),
                progress::size(total),
                args.remote
            ))
            .default(false)
            .interact()?;
        if !confirmed {
            println!("Aborted.");
            backend.stop();
            return Ok(());
        }
    }

    let deleted = delete_all(backend.as_ref(), &parts).await?;
    info!(remote = %args.remote, deleted, "parts deleted");
    println!("Deleted {deleted} parts.");
    backend.stop();
    Ok(())
}
