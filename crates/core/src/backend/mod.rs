pub mod azure;
pub mod local;
pub mod memory;
pub mod s3;

use std::any::Any;
use std::fmt;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

use crate::error::{BackendError, Result};
use crate::pager::PartStream;
use crate::part::Part;

/// Capacity of the in-memory pipe used by streamed copies.
pub const COPY_BUFFER_SIZE: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Local,
    S3,
    Azure,
    Memory,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Local => write!(f, "local"),
            BackendKind::S3 => write!(f, "s3"),
            BackendKind::Azure => write!(f, "azure"),
            BackendKind::Memory => write!(f, "memory"),
        }
    }
}

/// A directory tree of immutable parts on some store.
///
/// Backends are built from configuration, opened once with [`Backend::init`]
/// and shared between tasks. After [`Backend::stop`] every operation fails
/// with [`BackendError::Misuse`].
#[async_trait]
pub trait Backend: Send + Sync + fmt::Display {
    fn kind(&self) -> BackendKind;

    /// Used to detect same-store pairs for server-side copies.
    fn as_any(&self) -> &dyn Any;

    /// Resolves credentials and opens the connection handle.
    async fn init(&self) -> Result<()>;

    /// Drops the connection handle. Terminal.
    fn stop(&self);

    /// Parts whose path starts with `prefix`, in the store's key order.
    fn list_parts(&self, prefix: &str) -> PartStream<'_>;

    /// Size of the object at `path`, if present.
    async fn stat(&self, path: &str) -> Result<Option<u64>>;

    /// Streams `part.size` bytes from `reader` to the part's key.
    ///
    /// An object of the same size already at the key counts as success; one
    /// with a different size is [`BackendError::ContentMismatch`].
    async fn upload_part(
        &self,
        part: &Part,
        reader: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<()>;

    /// Streams the part's content into `writer`.
    async fn download_part(
        &self,
        part: &Part,
        writer: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<()>;

    /// Copies one part into `dst`, server side when both share a store.
    async fn copy_part(&self, dst: &dyn Backend, part: &Part) -> Result<()>;

    /// Removes the part. Absent parts are not an error.
    async fn delete_part(&self, part: &Part) -> Result<()>;

    /// Best effort; a no-op on stores without directories.
    async fn remove_empty_dirs(&self) -> Result<()>;

    async fn has_file(&self, path: &str) -> Result<bool>;

    /// Writes a small control file, replacing any previous content.
    async fn create_file(&self, path: &str, data: &[u8]) -> Result<()>;

    async fn delete_file(&self, path: &str) -> Result<()>;
}

/// Decides whether an upload to `key` can be skipped.
///
/// Returns `true` when an object of the expected size is already there.
pub(crate) fn check_existing(key: &str, part: &Part, existing: Option<u64>) -> Result<bool> {
    match existing {
        None => Ok(false),
        Some(size) if size == part.size => {
            debug!(key, size, "part already present");
            Ok(true)
        }
        Some(size) => Err(BackendError::mismatch(key, part.size, size)),
    }
}

/// Copies a part between arbitrary backends through a bounded pipe.
///
/// The download and upload run concurrently; at most [`COPY_BUFFER_SIZE`]
/// bytes are buffered in between.
pub async fn copy_streamed(src: &dyn Backend, dst: &dyn Backend, part: &Part) -> Result<()> {
    part.validate()?;
    if check_existing(&part.path, part, dst.stat(&part.path).await?)? {
        return Ok(());
    }
    let (mut tx, mut rx) = tokio::io::duplex(COPY_BUFFER_SIZE);
    let download = async move {
        let res = src.download_part(part, &mut tx).await;
        drop(tx);
        res
    };
    let upload = dst.upload_part(part, &mut rx);
    tokio::try_join!(download, upload)?;
    info!(path = %part.path, src = %src, dst = %dst, size = part.size, "part copied");
    Ok(())
}

#[cfg(test)]
pub(crate) mod contract;
