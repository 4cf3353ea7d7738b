use std::path::Path;

use anyhow::{Context, Result};
use clap::Args;

use crate::config::AppConfig;
use crate::progress;

#[derive(Args)]
pub struct CleanupArgs {
    /// Remote name
    remote: String,
}

pub async fn run(args: CleanupArgs, config_path: &Path) -> Result<()> {
    let config = AppConfig::load(config_path)?;
    let backend = config.open_remote(&args.remote).await?;

    let spinner = progress::spinner("Removing empty directories...");
    backend
        .remove_empty_dirs()
        .await
        .with_context(|| format!("cleanup of {backend} failed"))?;
    spinner.finish_with_message("done");

    backend.stop();
    Ok(())
}
