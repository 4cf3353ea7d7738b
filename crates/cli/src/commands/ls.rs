use std::path::Path;

use anyhow::{Context, Result};
use clap::Args;
use console::style;
use futures::{StreamExt, TryStreamExt};

use partstore_core::Part;

use crate::config::AppConfig;
use crate::progress;

#[derive(Args)]
pub struct LsArgs {
    /// Remote name
    remote: String,

    /// Only parts whose path starts with this prefix
    #[arg(long, default_value = "")]
    prefix: String,

    /// Print parts as JSON
    #[arg(long)]
    json: bool,
}

pub async fn run(args: LsArgs, config_path: &Path) -> Result<()> {
    let config = AppConfig::load(config_path)?;
    let backend = config.open_remote(&args.remote).await?;

    if args.json {
        let parts: Vec<Part> = backend
            .list_parts(&args.prefix)
            .try_collect()
            .await
            .with_context(|| format!("failed to list {backend}"))?;
        println!("{}", serde_json::to_string_pretty(&parts)?);
        backend.stop();
        return Ok(());
    }

    println!("{:<60} {:>10}  {}", "PATH", "SIZE", "FINGERPRINT");
    println!("{}", "-".repeat(100));
    let mut count = 0u64;
    let mut total = 0u64;
    let mut parts = backend.list_parts(&args.prefix);
    while let Some(part) = parts.next().await {
        let part = part.with_context(|| format!("failed to list {backend}"))?;
        println!(
            "{:<60} {:>10}  {}",
            part.path,
            progress::size(part.size),
            style(&part.fingerprint).dim()
        );
        count += 1;
        total += part.size;
    }
    drop(parts);
    println!(
        "\n{} parts, {}",
        style(count).bold(),
        style(progress::size(total)).bold()
    );
    backend.stop();
    Ok(())
}
