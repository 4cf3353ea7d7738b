use std::any::Any;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, stream};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use super::{Backend, BackendKind, check_existing, copy_streamed};
use crate::error::{BackendError, Result};
use crate::io::read_chunk;
use crate::pager::{Marker, Page, PageSource, PartStream, paginate};
use crate::part::{Part, validate_path};
use crate::path::RootDir;
use crate::session::Session;

pub const DEFAULT_PAGE_SIZE: usize = 1000;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default)]
    pub dir: String,
    #[serde(default)]
    pub page_size: Option<usize>,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    fingerprint: String,
}

/// Process-local object store. Clones share the same objects, so several
/// backends can point at one store like clients of one bucket.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    objects: Arc<RwLock<BTreeMap<String, StoredObject>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every key currently stored, in order.
    pub fn keys(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    pub fn same_store(&self, other: &MemoryStore) -> bool {
        Arc::ptr_eq(&self.objects, &other.objects)
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, StoredObject>> {
        self.objects.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, StoredObject>> {
        self.objects.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn get(&self, key: &str) -> Option<StoredObject> {
        self.read().get(key).cloned()
    }

    fn put(&self, key: String, data: Bytes) {
        let fingerprint = blake3::hash(&data).to_hex().to_string();
        self.write().insert(key, StoredObject { data, fingerprint });
    }

    fn remove(&self, key: &str) {
        self.write().remove(key);
    }
}

pub struct MemoryBackend {
    root: RootDir,
    page_size: usize,
    store: MemoryStore,
    session: Session<MemoryStore>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_store(MemoryStore::new(), &MemoryConfig::default())
    }

    pub fn from_config(config: &MemoryConfig) -> Self {
        Self::with_store(MemoryStore::new(), config)
    }

    pub fn with_store(store: MemoryStore, config: &MemoryConfig) -> Self {
        Self {
            root: RootDir::new(&config.dir),
            page_size: config.page_size.unwrap_or(DEFAULT_PAGE_SIZE).max(1),
            store,
            session: Session::new("memory"),
        }
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    fn key(&self, path: &str) -> Result<String> {
        validate_path(path)?;
        Ok(self.root.key(path))
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MEMORY{{dir: {:?}}}", self.root.as_str())
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    async fn init(&self) -> Result<()> {
        self.session.open(self.store.clone())
    }

    fn stop(&self) {
        self.session.close();
    }

    fn list_parts(&self, prefix: &str) -> PartStream<'_> {
        match self.session.get() {
            Ok(store) => paginate(MemoryPages {
                store,
                root: self.root.clone(),
                prefix: self.root.key(prefix),
                page_size: self.page_size,
            }),
            Err(e) => stream::iter([Err(e)]).boxed(),
        }
    }

    async fn stat(&self, path: &str) -> Result<Option<u64>> {
        let store = self.session.get()?;
        let key = self.key(path)?;
        Ok(store.get(&key).map(|obj| obj.data.len() as u64))
    }

    async fn upload_part(
        &self,
        part: &Part,
        reader: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<()> {
        let store = self.session.get()?;
        let key = self.key(&part.path)?;
        let existing = store.get(&key).map(|obj| obj.data.len() as u64);
        if check_existing(&key, part, existing)? {
            return Ok(());
        }
        let data = read_chunk(reader, part.size)
            .await
            .map_err(|e| BackendError::transfer(&key, e, true))?;
        if data.len() as u64 != part.size {
            return Err(BackendError::truncated(key, part.size, data.len() as u64));
        }
        store.put(key, Bytes::from(data));
        Ok(())
    }

    async fn download_part(
        &self,
        part: &Part,
        writer: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<()> {
        let store = self.session.get()?;
        let key = self.key(&part.path)?;
        let obj = store.get(&key).ok_or_else(|| BackendError::not_found(&key))?;
        let stored = obj.data.len() as u64;
        if stored > part.size {
            return Err(BackendError::mismatch(key, part.size, stored));
        }
        writer
            .write_all(&obj.data)
            .await
            .map_err(|e| BackendError::transfer(&key, e, true))?;
        writer
            .flush()
            .await
            .map_err(|e| BackendError::transfer(&key, e, true))?;
        if stored < part.size {
            return Err(BackendError::truncated(key, part.size, stored));
        }
        Ok(())
    }

    async fn copy_part(&self, dst: &dyn Backend, part: &Part) -> Result<()> {
        let shared = dst
            .as_any()
            .downcast_ref::<MemoryBackend>()
            .filter(|other| other.store.same_store(&self.store));
        let Some(other) = shared else {
            return copy_streamed(self, dst, part).await;
        };
        let store = self.session.get()?;
        let dst_store = other.session.get()?;
        let src_key = self.key(&part.path)?;
        let dst_key = other.key(&part.path)?;
        if check_existing(&dst_key, part, dst_store.get(&dst_key).map(|o| o.data.len() as u64))? {
            return Ok(());
        }
        let obj = store
            .get(&src_key)
            .ok_or_else(|| BackendError::not_found(&src_key))?;
        if obj.data.len() as u64 != part.size {
            return Err(BackendError::mismatch(src_key, part.size, obj.data.len() as u64));
        }
        dst_store.put(dst_key, obj.data);
        debug!(path = %part.path, "part copied within store");
        Ok(())
    }

    async fn delete_part(&self, part: &Part) -> Result<()> {
        self.delete_file(&part.path).await
    }

    async fn remove_empty_dirs(&self) -> Result<()> {
        self.session.get()?;
        Ok(())
    }

    async fn has_file(&self, path: &str) -> Result<bool> {
        Ok(self.stat(path).await?.is_some())
    }

    async fn create_file(&self, path: &str, data: &[u8]) -> Result<()> {
        let store = self.session.get()?;
        let key = self.key(path)?;
        store.put(key, Bytes::copy_from_slice(data));
        Ok(())
    }

    async fn delete_file(&self, path: &str) -> Result<()> {
        let store = self.session.get()?;
        let key = self.key(path)?;
        store.remove(&key);
        Ok(())
    }
}

struct MemoryPages {
    store: Arc<MemoryStore>,
    root: RootDir,
    prefix: String,
    page_size: usize,
}

impl MemoryPages {
    fn page(&self, marker: &Marker) -> Page {
        let objects = self.store.read();
        let start = match marker.token() {
            Some(token) => Bound::Excluded(token.to_string()),
            None => Bound::Included(self.prefix.clone()),
        };
        let mut parts = Vec::new();
        let mut last = None;
        let mut more = false;
        for (key, obj) in objects.range((start, Bound::Unbounded)) {
            if !key.starts_with(&self.prefix) {
                break;
            }
            if parts.len() == self.page_size {
                more = true;
                break;
            }
            let path = self.root.strip(key).unwrap_or(key.as_str());
            parts.push(Part::new(
                path,
                obj.data.len() as u64,
                obj.fingerprint.clone(),
            ));
            last = Some(key.clone());
        }
        Page {
            parts,
            next: Marker::after(if more { last } else { None }),
        }
    }
}

#[async_trait]
impl PageSource for MemoryPages {
    async fn fetch_page(&self, marker: &Marker) -> Result<Page> {
        Ok(self.page(marker))
    }
}
