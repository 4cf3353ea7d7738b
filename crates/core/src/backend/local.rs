use std::any::Any;
use std::cmp::Reverse;
use std::fs::Metadata;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures::{StreamExt, stream};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

use super::{Backend, BackendKind, check_existing, copy_streamed};
use crate::error::{BackendError, Result};
use crate::io::{CountingReader, CountingWriter};
use crate::pager::{Marker, Page, PageSource, PartStream, paginate};
use crate::part::{Part, validate_path};
use crate::session::Session;

/// In-flight uploads are written as `.<name>.<uuid>.partstore.tmp` and renamed.
const TEMP_SUFFIX: &str = ".partstore.tmp";

/// Temp files untouched for this long are swept by `remove_empty_dirs`.
const STALE_TEMP_AGE: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalConfig {
    pub path: String,
}

/// Parts stored as plain files below a root directory.
pub struct LocalBackend {
    root: PathBuf,
    session: Session<PathBuf>,
}

impl LocalBackend {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            root: path.as_ref().to_path_buf(),
            session: Session::new("local"),
        }
    }

    pub fn from_config(config: &LocalConfig) -> Self {
        Self::new(&config.path)
    }

    fn full_path(&self, path: &str) -> Result<PathBuf> {
        validate_path(path)?;
        Ok(self.session.get()?.join(path))
    }

    async fn write_atomic(
        &self,
        full: &Path,
        size: u64,
        reader: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<()> {
        let key = display(full);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| BackendError::io(&key, e))?;
        }
        let tmp = TempFile::new(temp_path(full));
        let written = async {
            let mut file = fs::File::create(tmp.path()).await?;
            let mut counted = CountingReader::new((&mut *reader).take(size));
            tokio::io::copy(&mut counted, &mut file).await?;
            file.sync_all().await?;
            Ok::<_, std::io::Error>(counted.count())
        }
        .await;
        match written {
            Ok(n) if n == size => {
                fs::rename(tmp.path(), full)
                    .await
                    .map_err(|e| BackendError::io(&key, e))?;
                tmp.keep();
                Ok(())
            }
            Ok(n) => Err(BackendError::truncated(key, size, n)),
            Err(e) => Err(BackendError::io(key, e)),
        }
    }
}

impl std::fmt::Display for LocalBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LOCAL{{dir: {:?}}}", self.root.display().to_string())
    }
}

#[async_trait]
impl Backend for LocalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    async fn init(&self) -> Result<()> {
        self.session.ensure_unopened()?;
        fs::create_dir_all(&self.root).await.map_err(|e| {
            BackendError::InvalidConfig(format!("cannot create {}: {e}", self.root.display()))
        })?;
        self.session.open(self.root.clone())?;
        info!(dir = %self.root.display(), "local backend ready");
        Ok(())
    }

    fn stop(&self) {
        self.session.close();
    }

    fn list_parts(&self, prefix: &str) -> PartStream<'_> {
        match self.session.get() {
            Ok(root) => paginate(LocalPages {
                root,
                prefix: prefix.to_string(),
            }),
            Err(e) => stream::iter([Err(e)]).boxed(),
        }
    }

    async fn stat(&self, path: &str) -> Result<Option<u64>> {
        let full = self.full_path(path)?;
        file_size(&full).await
    }

    async fn upload_part(
        &self,
        part: &Part,
        reader: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<()> {
        let full = self.full_path(&part.path)?;
        if check_existing(&display(&full), part, file_size(&full).await?)? {
            return Ok(());
        }
        self.write_atomic(&full, part.size, reader).await?;
        debug!(path = %part.path, size = part.size, "part uploaded");
        Ok(())
    }

    async fn download_part(
        &self,
        part: &Part,
        writer: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<()> {
        let full = self.full_path(&part.path)?;
        let key = display(&full);
        let file = fs::File::open(&full)
            .await
            .map_err(|e| BackendError::io(&key, e))?;
        let stored = file
            .metadata()
            .await
            .map_err(|e| BackendError::io(&key, e))?
            .len();
        if stored > part.size {
            return Err(BackendError::mismatch(key, part.size, stored));
        }
        let mut counted = CountingWriter::new(writer);
        tokio::io::copy(&mut file.take(part.size), &mut counted)
            .await
            .map_err(|e| BackendError::transfer(&key, e, true))?;
        counted
            .flush()
            .await
            .map_err(|e| BackendError::transfer(&key, e, true))?;
        if counted.count() != part.size {
            return Err(BackendError::truncated(key, part.size, counted.count()));
        }
        Ok(())
    }

    async fn copy_part(&self, dst: &dyn Backend, part: &Part) -> Result<()> {
        let Some(local) = dst.as_any().downcast_ref::<LocalBackend>() else {
            return copy_streamed(self, dst, part).await;
        };
        let src = self.full_path(&part.path)?;
        let target = local.full_path(&part.path)?;
        let key = display(&target);
        if check_existing(&key, part, file_size(&target).await?)? {
            return Ok(());
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| BackendError::io(&key, e))?;
        }
        let tmp = TempFile::new(temp_path(&target));
        match fs::copy(&src, tmp.path()).await {
            Ok(n) if n == part.size => {}
            Ok(n) => return Err(BackendError::mismatch(display(&src), part.size, n)),
            Err(e) => return Err(BackendError::io(display(&src), e)),
        }
        fs::rename(tmp.path(), &target)
            .await
            .map_err(|e| BackendError::io(&key, e))?;
        tmp.keep();
        info!(path = %part.path, dst = %local, "part copied");
        Ok(())
    }

    async fn delete_part(&self, part: &Part) -> Result<()> {
        self.delete_file(&part.path).await
    }

    async fn remove_empty_dirs(&self) -> Result<()> {
        let root = self.session.get()?;
        let now = SystemTime::now();
        let mut dirs = Vec::new();
        let mut swept = 0usize;
        let mut stack = vec![root.to_path_buf()];
        while let Some(dir) = stack.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(BackendError::io(display(&dir), e)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| BackendError::io(display(&dir), e))?
            {
                let path = entry.path();
                let Ok(meta) = entry.metadata().await else {
                    continue;
                };
                if meta.is_dir() {
                    stack.push(path.clone());
                    dirs.push(path);
                } else if is_temp(&entry.file_name().to_string_lossy()) && is_stale(&meta, now) {
                    match fs::remove_file(&path).await {
                        Ok(()) => swept += 1,
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => return Err(BackendError::io(display(&path), e)),
                    }
                }
            }
        }

        // Deepest first, so parents emptied by this pass go too.
        dirs.sort_by_key(|dir| Reverse(dir.components().count()));
        let mut removed = 0usize;
        for dir in dirs {
            if !is_empty_dir(&dir).await? {
                continue;
            }
            match fs::remove_dir(&dir).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(BackendError::io(display(&dir), e)),
            }
        }
        info!(removed, swept, dir = %root.display(), "removed empty directories");
        Ok(())
    }

    async fn has_file(&self, path: &str) -> Result<bool> {
        Ok(self.stat(path).await?.is_some())
    }

    async fn create_file(&self, path: &str, data: &[u8]) -> Result<()> {
        let full = self.full_path(path)?;
        let mut reader = data;
        self.write_atomic(&full, data.len() as u64, &mut reader)
            .await
    }

    async fn delete_file(&self, path: &str) -> Result<()> {
        let full = self.full_path(path)?;
        match fs::remove_file(&full).await {
            Ok(()) => {
                debug!(path, "deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BackendError::io(display(&full), e)),
        }
    }
}

/// The whole tree in a single page; the filesystem has no listing cursor.
struct LocalPages {
    root: Arc<PathBuf>,
    prefix: String,
}

#[async_trait]
impl PageSource for LocalPages {
    async fn fetch_page(&self, _marker: &Marker) -> Result<Page> {
        let mut parts = Vec::new();
        let mut stack = vec![self.root.to_path_buf()];
        while let Some(dir) = stack.pop() {
            let mut entries = fs::read_dir(&dir)
                .await
                .map_err(|e| BackendError::io(display(&dir), e))?;
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| BackendError::io(display(&dir), e))?
            {
                let path = entry.path();
                let Some(rel) = relative_key(&self.root, &path) else {
                    continue;
                };
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| BackendError::io(display(&path), e))?;
                if file_type.is_dir() {
                    if may_contain(&rel, &self.prefix) {
                        stack.push(path);
                    }
                    continue;
                }
                if !file_type.is_file() || is_temp(&rel) || !rel.starts_with(&self.prefix) {
                    continue;
                }
                let meta = entry
                    .metadata()
                    .await
                    .map_err(|e| BackendError::io(display(&path), e))?;
                let stamp = modification_stamp(&meta);
                parts.push(Part::new(rel, meta.len(), stamp));
            }
        }
        parts.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(Page {
            parts,
            next: Marker::after(None),
        })
    }
}

fn display(path: &Path) -> String {
    path.display().to_string()
}

fn temp_path(full: &Path) -> PathBuf {
    let name = full
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    full.with_file_name(format!(".{name}.{}{TEMP_SUFFIX}", uuid::Uuid::new_v4()))
}

fn is_temp(rel: &str) -> bool {
    let name = rel.rsplit('/').next().unwrap_or(rel);
    name.starts_with('.') && name.ends_with(TEMP_SUFFIX)
}

/// Forward-slash key of `path` relative to `root`.
fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let mut segments = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(s) => segments.push(s.to_str()?),
            _ => return None,
        }
    }
    Some(segments.join("/"))
}

/// Whether a directory key can hold keys starting with `prefix`.
fn may_contain(dir: &str, prefix: &str) -> bool {
    let dir = format!("{dir}/");
    dir.starts_with(prefix) || prefix.starts_with(&dir)
}

fn modification_stamp(meta: &Metadata) -> String {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| format!("{}.{:09}", d.as_secs(), d.subsec_nanos()))
        .unwrap_or_default()
}

async fn file_size(full: &Path) -> Result<Option<u64>> {
    match fs::metadata(full).await {
        Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
        Ok(_) => Ok(None),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(BackendError::io(display(full), e)),
    }
}

async fn is_empty_dir(dir: &Path) -> Result<bool> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(BackendError::io(display(dir), e)),
    };
    let first = entries
        .next_entry()
        .await
        .map_err(|e| BackendError::io(display(dir), e))?;
    Ok(first.is_none())
}

/// An upload's temp file, removed on drop unless it was renamed into place.
///
/// Dropping covers cancellation too: an aborted upload future takes its temp
/// file with it.
struct TempFile {
    path: PathBuf,
    published: bool,
}

impl TempFile {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            published: false,
        }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    /// Call after the rename; the path no longer names a temp file.
    fn keep(mut self) {
        self.published = true;
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        if self.published {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => debug!(path = %self.path.display(), error = %e, "temporary file not removed"),
        }
    }
}

/// Whether a temp file was left behind by a crashed process rather than
/// belonging to an upload still in flight.
fn is_stale(meta: &Metadata, now: SystemTime) -> bool {
    meta.modified()
        .ok()
        .and_then(|t| now.duration_since(t).ok())
        .is_some_and(|age| age >= STALE_TEMP_AGE)
}
