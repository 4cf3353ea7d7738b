use std::path::Path;

use anyhow::{Context, Result};
use clap::Args;
use console::style;
use futures::{StreamExt, TryStreamExt};
use tracing::{info, warn};

use tokio::sync::watch;

use partstore_core::cancel::cancellable;
use partstore_core::{Backend, BackendError, Part};

use crate::config::AppConfig;
use crate::progress;

#[derive(Args)]
pub struct CpArgs {
    /// Source remote
    src: String,

    /// Destination remote
    dst: String,

    /// Only parts whose path starts with this prefix
    #[arg(long, default_value = "")]
    prefix: String,

    /// Parallel transfers
    #[arg(long, default_value_t = 4)]
    jobs: usize,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct CopySummary {
    pub copied: u64,
    pub bytes: u64,
    pub failed: Vec<String>,
    /// Parts not started, or cut off, because of an interrupt.
    pub skipped: u64,
}

/// Resolves once `stop` turns true; never if its sender goes away first.
async fn interrupted(mut stop: watch::Receiver<bool>) {
    if stop.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Copies every part under `prefix` with at most `jobs` transfers in flight.
///
/// Once `stop` turns true no further parts start and the transfers still
/// running are cancelled; finished parts stay copied.
pub async fn copy_all(
    src: &dyn Backend,
    dst: &dyn Backend,
    prefix: &str,
    jobs: usize,
    stop: watch::Receiver<bool>,
) -> Result<CopySummary> {
    let parts: Vec<Part> = src
        .list_parts(prefix)
        .try_collect()
        .await
        .with_context(|| format!("failed to list {src}"))?;
    let count = parts.len() as u64;
    let total: u64 = parts.iter().map(|p| p.size).sum();
    let pb = progress::transfer_bar(total, "copy");

    let results = futures::stream::iter(parts)
        .take_until(interrupted(stop.clone()))
        .map(|part| {
            let stop = stop.clone();
            async move {
                let res = cancellable(&part.path, interrupted(stop), src.copy_part(dst, &part)).await;
                (part, res)
            }
        })
        .buffer_unordered(jobs.max(1));
    let mut results = std::pin::pin!(results);

    let mut summary = CopySummary::default();
    let mut finished = 0u64;
    while let Some((part, res)) = results.next().await {
        pb.inc(part.size);
        finished += 1;
        match res {
            Ok(()) => {
                summary.copied += 1;
                summary.bytes += part.size;
            }
            Err(BackendError::Cancelled { .. }) => summary.skipped += 1,
            Err(e) => {
                warn!(path = %part.path, error = %e, "copy failed");
                summary.failed.push(part.path);
            }
        }
    }
    summary.skipped += count - finished;
    pb.finish_and_clear();
    Ok(summary)
}

pub async fn run(args: CpArgs, config_path: &Path) -> Result<()> {
    let config = AppConfig::load(config_path)?;
    let src = config.open_remote(&args.src).await?;
    let dst = config.open_remote(&args.dst).await?;

    let (stop_tx, stop) = watch::channel(false);
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupted, cancelling transfers...");
            stop_tx.send_replace(true);
        }
    });
    let summary = copy_all(src.as_ref(), dst.as_ref(), &args.prefix, args.jobs, stop).await;
    ctrl_c.abort();
    let summary = summary?;
    info!(
        copied = summary.copied,
        bytes = summary.bytes,
        failed = summary.failed.len(),
        skipped = summary.skipped,
        "copy finished"
    );
    src.stop();
    dst.stop();

    println!(
        "Copied {} parts ({}) from {} to {}.",
        style(summary.copied).bold(),
        progress::size(summary.bytes),
        args.src,
        args.dst
    );
    if !summary.failed.is_empty() {
        for path in &summary.failed {
            eprintln!("  {} {path}", style("failed").red());
        }
        anyhow::bail!("{} parts failed to copy", summary.failed.len());
    }
    if summary.skipped > 0 {
        anyhow::bail!("interrupted, {} parts not copied", summary.skipped);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use partstore_core::backend::local::LocalBackend;
    use partstore_core::backend::memory::MemoryBackend;

    use super::*;

    /// A stop signal that never fires.
    fn running() -> watch::Receiver<bool> {
        watch::channel(false).1
    }

    #[tokio::test]
    async fn copies_prefix_between_backends() {
        let src = MemoryBackend::new();
        src.init().await.unwrap();
        for (path, data) in [("vm/a", &b"aaaa"[..]), ("vm/b", &b"bb"[..]), ("other/c", &b"c"[..])] {
            let mut reader = data;
            src.upload_part(&Part::from_data(path, data), &mut reader)
                .await
                .unwrap();
        }
        let dir = tempfile::tempdir().unwrap();
        let dst = LocalBackend::new(dir.path());
        dst.init().await.unwrap();

        let summary = copy_all(&src, &dst, "vm/", 2, running()).await.unwrap();
        assert_eq!(summary.copied, 2);
        assert_eq!(summary.bytes, 6);
        assert!(summary.failed.is_empty());
        assert!(dst.has_file("vm/a").await.unwrap());
        assert!(!dst.has_file("other/c").await.unwrap());

        // Second run finds everything in place.
        let again = copy_all(&src, &dst, "vm/", 2, running()).await.unwrap();
        assert_eq!(again.copied, 2);
    }

    #[tokio::test]
    async fn conflicting_parts_are_reported() {
        let src = MemoryBackend::new();
        let dst = MemoryBackend::new();
        src.init().await.unwrap();
        dst.init().await.unwrap();
        let mut reader: &[u8] = b"long body";
        src.upload_part(&Part::from_data("p", b"long body"), &mut reader)
            .await
            .unwrap();
        let mut reader: &[u8] = b"short";
        dst.upload_part(&Part::from_data("p", b"short"), &mut reader)
            .await
            .unwrap();

        let summary = copy_all(&src, &dst, "", 1, running()).await.unwrap();
        assert_eq!(summary.copied, 0);
        assert_eq!(summary.failed, vec!["p".to_string()]);
    }

    #[tokio::test]
    async fn interrupt_stops_remaining_parts() {
        let src = MemoryBackend::new();
        let dst = MemoryBackend::new();
        src.init().await.unwrap();
        dst.init().await.unwrap();
        for path in ["a", "b", "c"] {
            let mut reader: &[u8] = b"data";
            src.upload_part(&Part::from_data(path, b"data"), &mut reader)
                .await
                .unwrap();
        }

        let (_stop_tx, stop) = watch::channel(true);
        let summary = copy_all(&src, &dst, "", 2, stop).await.unwrap();
        assert_eq!(summary.copied, 0);
        assert_eq!(summary.skipped, 3);
        assert!(summary.failed.is_empty());
        assert!(!dst.has_file("a").await.unwrap());
    }
}
