use std::any::Any;
use std::num::NonZeroU32;
use std::sync::Arc;

use async_trait::async_trait;
use azure_core::StatusCode;
use azure_core::error::ErrorKind;
use azure_core::request_options::{MaxResults, NextMarker};
use azure_storage::StorageCredentials;
use azure_storage_blobs::prelude::*;
use bytes::Bytes;
use futures::{StreamExt, stream};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

use super::{Backend, BackendKind, check_existing, copy_streamed};
use crate::credentials::{AZURE_ENV, Credentials};
use crate::error::{BackendError, Result, is_retryable_status};
use crate::io::{CountingWriter, read_chunk};
use crate::pager::{Marker, Page, PageSource, PartStream, paginate};
use crate::part::{Part, validate_path};
use crate::path::RootDir;
use crate::session::Session;

/// Bodies up to this size go up in a single request; larger ones as blocks.
pub const BLOCK_SIZE: u64 = 4 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AzureConfig {
    /// Falls back to `AZURE_STORAGE_ACCOUNT` when blank.
    #[serde(default)]
    pub account: String,
    /// Base64 shared key. Falls back to `AZURE_STORAGE_ACCESS_KEY` when blank.
    #[serde(default)]
    pub access_key: String,
    pub container: String,
    #[serde(default)]
    pub dir: String,
    #[serde(default)]
    pub page_size: Option<usize>,
}

pub struct AzureBackend {
    config: AzureConfig,
    root: RootDir,
    session: Session<ContainerClient>,
}

impl AzureBackend {
    pub fn new(config: AzureConfig) -> Self {
        Self {
            root: RootDir::new(&config.dir),
            config,
            session: Session::new("azure"),
        }
    }

    pub fn init_with(&self, credentials: Credentials) -> Result<()> {
        self.session.ensure_unopened()?;
        if self.config.container.is_empty() {
            return Err(BackendError::InvalidConfig(
                "azure container name is empty".into(),
            ));
        }
        credentials.ensure_base64_secret()?;
        let storage =
            StorageCredentials::access_key(credentials.account.clone(), credentials.secret);
        let client = ClientBuilder::new(credentials.account, storage)
            .container_client(self.config.container.clone());
        self.session.open(client)?;
        info!(container = %self.config.container, dir = %self.root, "azure backend ready");
        Ok(())
    }

    fn key(&self, path: &str) -> Result<String> {
        validate_path(path)?;
        Ok(self.root.key(path))
    }

    async fn head(client: &ContainerClient, key: &str) -> Result<Option<u64>> {
        match client.blob_client(key).get_properties().await {
            Ok(props) => Ok(Some(props.blob.properties.content_length)),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(azure_error(key, e)),
        }
    }

    /// Stages `reader` as numbered blocks after `first`, then commits them.
    async fn upload_blocks(
        blob: &BlobClient,
        key: &str,
        first: Vec<u8>,
        reader: &mut (dyn AsyncRead + Unpin + Send),
        expected: u64,
    ) -> Result<()> {
        let mut sent = first.len() as u64;
        let mut blocks = Vec::new();
        let mut chunk = first;
        while !chunk.is_empty() {
            let id = BlockId::new(format!("{:08}", blocks.len()));
            blob.put_block(id.clone(), Bytes::from(chunk))
                .await
                .map_err(|e| azure_error(key, e))?;
            blocks.push(BlobBlockType::new_uncommitted(id));
            let remaining = expected - sent;
            chunk = read_chunk(&mut *reader, remaining.min(BLOCK_SIZE))
                .await
                .map_err(|e| BackendError::io(key, e))?;
            sent += chunk.len() as u64;
        }
        // Uncommitted blocks are discarded by the service.
        if sent != expected {
            return Err(BackendError::truncated(key, expected, sent));
        }
        blob.put_block_list(BlockList { blocks })
            .await
            .map_err(|e| azure_error(key, e))?;
        debug!(key, size = expected, "committed block list");
        Ok(())
    }
}

fn is_not_found(err: &azure_core::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::HttpResponse {
            status: StatusCode::NotFound,
            ..
        }
    )
}

fn azure_error(key: &str, err: azure_core::Error) -> BackendError {
    match err.kind() {
        ErrorKind::HttpResponse {
            status: StatusCode::NotFound,
            ..
        } => BackendError::not_found(key),
        ErrorKind::HttpResponse { status, .. } => {
            let retryable = is_retryable_status(u16::from(*status));
            BackendError::transfer(key, err, retryable)
        }
        ErrorKind::Io => BackendError::transfer(key, err, true),
        _ => BackendError::transfer(key, err, false),
    }
}

impl std::fmt::Display for AzureBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "AZUREBLOB{{container: {:?}, dir: {:?}}}",
            self.config.container,
            self.root.as_str()
        )
    }
}

#[async_trait]
impl Backend for AzureBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Azure
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    async fn init(&self) -> Result<()> {
        self.session.ensure_unopened()?;
        let credentials = Credentials::resolve_env(
            &self.config.account,
            &self.config.access_key,
            AZURE_ENV,
        )?;
        self.init_with(credentials)
    }

    fn stop(&self) {
        self.session.close();
    }

    fn list_parts(&self, prefix: &str) -> PartStream<'_> {
        match self.session.get() {
            Ok(client) => paginate(AzurePages {
                client,
                root: self.root.clone(),
                prefix: self.root.key(prefix),
                page_size: self
                    .config
                    .page_size
                    .and_then(|n| u32::try_from(n).ok())
                    .and_then(NonZeroU32::new),
            }),
            Err(e) => stream::iter([Err(e)]).boxed(),
        }
    }

    async fn stat(&self, path: &str) -> Result<Option<u64>> {
        let client = self.session.get()?;
        let key = self.key(path)?;
        Self::head(&client, &key).await
    }

    async fn upload_part(
        &self,
        part: &Part,
        reader: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<()> {
        let client = self.session.get()?;
        let key = self.key(&part.path)?;
        if check_existing(&key, part, Self::head(&client, &key).await?)? {
            return Ok(());
        }
        let blob = client.blob_client(&key);
        let first = read_chunk(&mut *reader, part.size.min(BLOCK_SIZE))
            .await
            .map_err(|e| BackendError::io(&key, e))?;
        let len = first.len() as u64;
        if len == part.size {
            blob.put_block_blob(Bytes::from(first))
                .await
                .map_err(|e| azure_error(&key, e))?;
        } else if len < BLOCK_SIZE {
            return Err(BackendError::truncated(key, part.size, len));
        } else {
            Self::upload_blocks(&blob, &key, first, reader, part.size).await?;
        }
        debug!(key, size = part.size, "part uploaded");
        Ok(())
    }

    async fn download_part(
        &self,
        part: &Part,
        writer: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<()> {
        let client = self.session.get()?;
        let key = self.key(&part.path)?;
        let mut responses = client.blob_client(&key).get().into_stream();
        let mut counted = CountingWriter::new(writer);
        while let Some(response) = responses.next().await {
            let response = response.map_err(|e| azure_error(&key, e))?;
            let data = response
                .data
                .collect()
                .await
                .map_err(|e| azure_error(&key, e))?;
            counted
                .write_all(&data)
                .await
                .map_err(|e| BackendError::transfer(&key, e, true))?;
        }
        counted
            .flush()
            .await
            .map_err(|e| BackendError::transfer(&key, e, true))?;
        match counted.count() {
            n if n < part.size => Err(BackendError::truncated(key, part.size, n)),
            n if n > part.size => Err(BackendError::mismatch(key, part.size, n)),
            _ => Ok(()),
        }
    }

    async fn copy_part(&self, dst: &dyn Backend, part: &Part) -> Result<()> {
        // Copy Blob completes asynchronously on the service, so parts are
        // always piped through this process.
        copy_streamed(self, dst, part).await
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
        let client = self.session.get()?;
        let key = self.key(path)?;
        client
            .blob_client(&key)
            .put_block_blob(Bytes::copy_from_slice(data))
            .await
            .map_err(|e| azure_error(&key, e))?;
        Ok(())
    }

    async fn delete_file(&self, path: &str) -> Result<()> {
        let client = self.session.get()?;
        let key = self.key(path)?;
        match client.blob_client(&key).delete().await {
            Ok(_) => {
                debug!(key, "deleted");
                Ok(())
            }
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(azure_error(&key, e)),
        }
    }
}

struct AzurePages {
    client: Arc<ContainerClient>,
    root: RootDir,
    prefix: String,
    page_size: Option<NonZeroU32>,
}

#[async_trait]
impl PageSource for AzurePages {
    async fn fetch_page(&self, marker: &Marker) -> Result<Page> {
        let mut request = self.client.list_blobs().prefix(self.prefix.clone());
        if let Some(size) = self.page_size {
            request = request.max_results(MaxResults::new(size));
        }
        if let Some(token) = marker.token() {
            request = request.marker(NextMarker::new(token.to_string()));
        }
        let page = request
            .into_stream()
            .next()
            .await
            .ok_or_else(|| BackendError::transfer(&self.prefix, "empty listing response", true))?
            .map_err(|e| azure_error(&self.prefix, e))?;
        let parts = page
            .blobs
            .blobs()
            .filter(|blob| !blob.name.ends_with('/'))
            .map(|blob| {
                let path = self.root.strip(&blob.name).unwrap_or(blob.name.as_str());
                Part::new(
                    path,
                    blob.properties.content_length,
                    blob.properties.etag.to_string().trim_matches('"'),
                )
            })
            .collect();
        let next = page.next_marker.map(|m| m.as_str().to_string());
        Ok(Page {
            parts,
            next: Marker::after(next),
        })
    }
}
