use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use tokio::io::AsyncReadExt;
use tracing::info;

use partstore_core::Part;

use crate::config::AppConfig;
use crate::progress;

#[derive(Args)]
pub struct PutArgs {
    /// Remote name
    remote: String,

    /// Local file to upload
    file: PathBuf,

    /// Part path on the remote (default: the file name)
    #[arg(long = "as")]
    path: Option<String>,
}

/// Describes a local file as a part, fingerprinted by its BLAKE3 hash.
pub async fn describe(file: &Path, path: String) -> Result<Part> {
    let mut f = tokio::fs::File::open(file)
        .await
        .with_context(|| format!("failed to open {}", file.display()))?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let n = f.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    let part = Part::new(path, size, hasher.finalize().to_hex().to_string());
    part.validate()?;
    Ok(part)
}

fn default_path(file: &Path) -> Result<String> {
    file.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("cannot derive a part path from {}", file.display()))
}

pub async fn run(args: PutArgs, config_path: &Path) -> Result<()> {
    let config = AppConfig::load(config_path)?;
    let path = match args.path {
        Some(path) => path,
        None => default_path(&args.file)?,
    };
    let part = describe(&args.file, path).await?;
    let backend = config.open_remote(&args.remote).await?;

    let pb = progress::part_bar(&part, "put");
    let file = tokio::fs::File::open(&args.file)
        .await
        .with_context(|| format!("failed to open {}", args.file.display()))?;
    let mut reader = pb.wrap_async_read(file);
    backend
        .upload_part(&part, &mut reader)
        .await
        .with_context(|| format!("failed to upload {} to {backend}", part.path))?;
    pb.finish_and_clear();

    info!(path = %part.path, size = part.size, remote = %args.remote, "part stored");
    println!("{} ({} bytes, {})", part.path, part.size, part.fingerprint);
    backend.stop();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn describe_hashes_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("disk.img");
        std::fs::write(&file, b"some bytes").unwrap();

        let part = describe(&file, default_path(&file).unwrap()).await.unwrap();
        assert_eq!(part, Part::from_data("disk.img", b"some bytes"));
        assert!(describe(&file, "/abs".into()).await.is_err());
    }
}
