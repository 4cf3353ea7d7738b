use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use partstore_core::{Backend, Part};

use crate::config::AppConfig;
use crate::progress;

#[derive(Args)]
pub struct GetArgs {
    /// Remote name
    remote: String,

    /// Part path on the remote
    path: String,

    /// Local file to write
    target: PathBuf,
}

/// Downloads `path` into `target`, replacing it only once the body is complete.
///
/// The body lands in `<target>.partial` first, which is removed again on any
/// failure.
pub async fn fetch(backend: &dyn Backend, path: &str, target: &Path) -> Result<Part> {
    let size = backend
        .stat(path)
        .await?
        .ok_or_else(|| anyhow::anyhow!("part '{path}' not found on {backend}"))?;
    let part = Part::new(path, size, "");

    let mut partial = target.as_os_str().to_owned();
    partial.push(".partial");
    let partial = PathBuf::from(partial);

    let pb = progress::part_bar(&part, "get");
    let file = tokio::fs::File::create(&partial)
        .await
        .with_context(|| format!("failed to create {}", partial.display()))?;
    let mut writer = pb.wrap_async_write(file);
    let written = async {
        backend
            .download_part(&part, &mut writer)
            .await
            .with_context(|| format!("failed to download {path}"))?;
        writer
            .flush()
            .await
            .with_context(|| format!("failed to write {}", partial.display()))
    }
    .await;
    pb.finish_and_clear();
    drop(writer);

    let placed = match written {
        Ok(()) => tokio::fs::rename(&partial, target)
            .await
            .with_context(|| format!("failed to write {}", target.display())),
        Err(e) => Err(e),
    };
    if let Err(e) = placed {
        discard_partial(&partial).await;
        return Err(e);
    }
    Ok(part)
}

async fn discard_partial(partial: &Path) {
    if let Err(e) = tokio::fs::remove_file(partial).await {
        debug!(path = %partial.display(), error = %e, "partial download not removed");
    }
}

pub async fn run(args: GetArgs, config_path: &Path) -> Result<()> {
    let config = AppConfig::load(config_path)?;
    let backend = config.open_remote(&args.remote).await?;
    let part = fetch(backend.as_ref(), &args.path, &args.target).await?;
    info!(path = %part.path, size = part.size, target = %args.target.display(), "part fetched");
    backend.stop();
    Ok(())
}
