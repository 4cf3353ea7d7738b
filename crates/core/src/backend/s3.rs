use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{StreamExt, stream};
use s3::bucket::Bucket;
use s3::creds::Credentials as S3Credentials;
use s3::error::S3Error;
use s3::region::Region;
use s3::serde_types::Part as UploadedChunk;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use super::{Backend, BackendKind, check_existing, copy_streamed};
use crate::credentials::{Credentials, S3_ENV};
use crate::error::{BackendError, Result, is_retryable_status};
use crate::io::{CountingWriter, read_chunk};
use crate::pager::{Marker, Page, PageSource, PartStream, paginate};
use crate::part::{Part, validate_path};
use crate::path::RootDir;
use crate::session::Session;

/// Bodies up to this size go up in one PUT; larger ones as multipart chunks.
/// S3 requires every chunk but the last to be at least 5 MiB.
pub const CHUNK_SIZE: u64 = 8 * 1024 * 1024;

const CONTENT_TYPE: &str = "application/octet-stream";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct S3Config {
    /// Custom endpoint (MinIO, R2, ...). Empty selects AWS by region name.
    #[serde(default)]
    pub endpoint: String,
    #[serde(default = "default_region")]
    pub region: String,
    pub bucket: String,
    /// Falls back to `AWS_ACCESS_KEY_ID` when blank.
    #[serde(default)]
    pub access_key: String,
    /// Falls back to `AWS_SECRET_ACCESS_KEY` when blank.
    #[serde(default)]
    pub secret_key: String,
    #[serde(default)]
    pub dir: String,
    #[serde(default)]
    pub page_size: Option<usize>,
}

fn default_region() -> String {
    "auto".to_string()
}

pub struct S3Backend {
    config: S3Config,
    root: RootDir,
    session: Session<Bucket>,
}

impl S3Backend {
    pub fn new(config: S3Config) -> Self {
        Self {
            root: RootDir::new(&config.dir),
            config,
            session: Session::new("s3"),
        }
    }

    /// Opens the handle with already resolved credentials.
    pub fn init_with(&self, credentials: &Credentials) -> Result<()> {
        self.session.ensure_unopened()?;
        let bucket = connect(&self.config, credentials)?;
        self.session.open(bucket)?;
        info!(bucket = %self.config.bucket, dir = %self.root, "s3 backend ready");
        Ok(())
    }

    fn key(&self, path: &str) -> Result<String> {
        validate_path(path)?;
        Ok(self.root.key(path))
    }

    fn same_bucket(&self, other: &S3Backend) -> bool {
        self.config.endpoint == other.config.endpoint
            && self.config.region == other.config.region
            && self.config.bucket == other.config.bucket
    }

    async fn head(bucket: &Bucket, key: &str) -> Result<Option<u64>> {
        match bucket.head_object(key).await {
            Ok((_, 404)) => Ok(None),
            Ok((head, status)) if is_success(status) => Ok(Some(
                head.content_length
                    .and_then(|len| u64::try_from(len).ok())
                    .unwrap_or(0),
            )),
            Ok((_, status)) => Err(status_error(key, status)),
            Err(e) if http_status(&e) == Some(404) => Ok(None),
            Err(e) => Err(s3_error(key, e)),
        }
    }

    /// Multipart upload of `first` followed by the rest of `reader`.
    ///
    /// Nothing is visible under `key` until the upload is completed; any
    /// failure aborts it.
    async fn upload_multipart(
        bucket: &Bucket,
        key: &str,
        first: Vec<u8>,
        reader: &mut (dyn AsyncRead + Unpin + Send),
        expected: u64,
    ) -> Result<()> {
        let upload = bucket
            .initiate_multipart_upload(key, CONTENT_TYPE)
            .await
            .map_err(|e| s3_error(key, e))?;
        let upload_id = upload.upload_id;
        let result = Self::send_chunks(bucket, key, &upload_id, first, reader, expected).await;
        if result.is_err()
            && let Err(e) = bucket.abort_upload(key, &upload_id).await
        {
            warn!(key, upload_id, error = %e, "failed to abort multipart upload");
        }
        result
    }

    async fn send_chunks(
        bucket: &Bucket,
        key: &str,
        upload_id: &str,
        first: Vec<u8>,
        reader: &mut (dyn AsyncRead + Unpin + Send),
        expected: u64,
    ) -> Result<()> {
        let mut sent = first.len() as u64;
        let mut chunks: Vec<UploadedChunk> = Vec::new();
        let mut chunk = first;
        while !chunk.is_empty() {
            let number = chunks.len() as u32 + 1;
            let uploaded = bucket
                .put_multipart_chunk(chunk, key, number, upload_id, CONTENT_TYPE)
                .await
                .map_err(|e| s3_error(key, e))?;
            chunks.push(uploaded);
            let remaining = expected - sent;
            chunk = read_chunk(&mut *reader, remaining.min(CHUNK_SIZE))
                .await
                .map_err(|e| BackendError::io(key, e))?;
            sent += chunk.len() as u64;
        }
        if sent != expected {
            return Err(BackendError::truncated(key, expected, sent));
        }
        let response = bucket
            .complete_multipart_upload(key, upload_id, chunks)
            .await
            .map_err(|e| s3_error(key, e))?;
        match response.status_code() {
            status if is_success(status) => {
                debug!(key, size = expected, "completed multipart upload");
                Ok(())
            }
            status => Err(status_error(key, status)),
        }
    }
}

/// How an upload proceeds once the first chunk of the body has been read.
#[derive(Debug, PartialEq, Eq)]
enum UploadPlan {
    /// The whole body fit; one PUT.
    Single,
    /// The body continues; upload it in chunks.
    Multipart,
    /// The reader ended before the declared size.
    Truncated,
}

fn plan_upload(first: u64, size: u64) -> UploadPlan {
    if first == size {
        UploadPlan::Single
    } else if first < CHUNK_SIZE {
        UploadPlan::Truncated
    } else {
        UploadPlan::Multipart
    }
}

fn connect(config: &S3Config, credentials: &Credentials) -> Result<Bucket> {
    if config.bucket.is_empty() {
        return Err(BackendError::InvalidConfig("s3 bucket name is empty".into()));
    }
    let region = if config.endpoint.is_empty() {
        config
            .region
            .parse::<Region>()
            .map_err(|e| BackendError::InvalidConfig(format!("s3 region: {e}")))?
    } else {
        Region::Custom {
            region: config.region.clone(),
            endpoint: config.endpoint.clone(),
        }
    };
    let creds = S3Credentials::new(
        Some(credentials.account.as_str()),
        Some(credentials.secret.as_str()),
        None,
        None,
        None,
    )
    .map_err(|e| BackendError::InvalidConfig(format!("s3 credentials: {e}")))?;
    let bucket = Bucket::new(&config.bucket, region, creds)
        .map_err(|e| BackendError::InvalidConfig(format!("s3 bucket: {e}")))?;
    let bucket = if config.endpoint.is_empty() {
        bucket
    } else {
        bucket.with_path_style()
    };
    Ok(*bucket)
}

fn is_success(status: u16) -> bool {
    (200..300).contains(&status)
}

fn http_status(err: &S3Error) -> Option<u16> {
    match err {
        S3Error::HttpFailWithBody(status, _) => Some(*status),
        _ => None,
    }
}

fn status_error(key: &str, status: u16) -> BackendError {
    if status == 404 {
        return BackendError::not_found(key);
    }
    BackendError::transfer(
        key,
        format!("unexpected HTTP status {status}"),
        is_retryable_status(status),
    )
}

fn s3_error(key: &str, err: S3Error) -> BackendError {
    match http_status(&err) {
        Some(404) => BackendError::not_found(key),
        Some(status) => BackendError::transfer(key, err, is_retryable_status(status)),
        None => BackendError::transfer(key, err, true),
    }
}

impl std::fmt::Display for S3Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "S3{{bucket: {:?}, dir: {:?}}}",
            self.config.bucket,
            self.root.as_str()
        )
    }
}

#[async_trait]
impl Backend for S3Backend {
    fn kind(&self) -> BackendKind {
        BackendKind::S3
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    async fn init(&self) -> Result<()> {
        self.session.ensure_unopened()?;
        let credentials = Credentials::resolve_env(
            &self.config.access_key,
            &self.config.secret_key,
            S3_ENV,
        )?;
        self.init_with(&credentials)
    }

    fn stop(&self) {
        self.session.close();
    }

    fn list_parts(&self, prefix: &str) -> PartStream<'_> {
        match self.session.get() {
            Ok(bucket) => paginate(S3Pages {
                bucket,
                root: self.root.clone(),
                prefix: self.root.key(prefix),
                page_size: self.config.page_size,
            }),
            Err(e) => stream::iter([Err(e)]).boxed(),
        }
    }

    async fn stat(&self, path: &str) -> Result<Option<u64>> {
        let bucket = self.session.get()?;
        let key = self.key(path)?;
        Self::head(&bucket, &key).await
    }

    async fn upload_part(
        &self,
        part: &Part,
        reader: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<()> {
        let bucket = self.session.get()?;
        let key = self.key(&part.path)?;
        if check_existing(&key, part, Self::head(&bucket, &key).await?)? {
            return Ok(());
        }
        let first = read_chunk(&mut *reader, part.size.min(CHUNK_SIZE))
            .await
            .map_err(|e| BackendError::io(&key, e))?;
        let len = first.len() as u64;
        match plan_upload(len, part.size) {
            UploadPlan::Single => {
                let response = bucket
                    .put_object(&key, &first)
                    .await
                    .map_err(|e| s3_error(&key, e))?;
                let status = response.status_code();
                if !is_success(status) {
                    return Err(status_error(&key, status));
                }
            }
            UploadPlan::Truncated => {
                return Err(BackendError::truncated(key, part.size, len));
            }
            UploadPlan::Multipart => {
                Self::upload_multipart(&bucket, &key, first, reader, part.size).await?;
            }
        }
        debug!(key, size = part.size, "part uploaded");
        Ok(())
    }

    async fn download_part(
        &self,
        part: &Part,
        writer: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<()> {
        let bucket = self.session.get()?;
        let key = self.key(&part.path)?;
        let mut response = bucket
            .get_object_stream(&key)
            .await
            .map_err(|e| s3_error(&key, e))?;
        if !is_success(response.status_code) {
            return Err(status_error(&key, response.status_code));
        }
        let mut counted = CountingWriter::new(writer);
        while let Some(chunk) = response.bytes.next().await {
            let chunk = chunk.map_err(|e| s3_error(&key, e))?;
            counted
                .write_all(&chunk)
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
        let same = dst
            .as_any()
            .downcast_ref::<S3Backend>()
            .filter(|other| other.same_bucket(self));
        let Some(other) = same else {
            return copy_streamed(self, dst, part).await;
        };
        let bucket = self.session.get()?;
        let dst_bucket = other.session.get()?;
        let src_key = self.key(&part.path)?;
        let dst_key = other.key(&part.path)?;
        if check_existing(&dst_key, part, Self::head(&dst_bucket, &dst_key).await?)? {
            return Ok(());
        }
        match Self::head(&bucket, &src_key).await? {
            None => return Err(BackendError::not_found(src_key)),
            Some(size) if size != part.size => {
                return Err(BackendError::mismatch(src_key, part.size, size));
            }
            Some(_) => {}
        }
        let status = dst_bucket
            .copy_object_internal(&src_key, &dst_key)
            .await
            .map_err(|e| s3_error(&dst_key, e))?;
        if !is_success(status) {
            return Err(status_error(&dst_key, status));
        }
        info!(src = %src_key, dst = %dst_key, "part copied server side");
        Ok(())
    }

    async fn delete_part(&self, part: &Part) -> Result<()> {
        self.delete_file(&part.path).await
    }

    async fn remove_empty_dirs(&self) -> Result<()> {
        // Prefixes are not objects; nothing to prune.
        self.session.get()?;
        Ok(())
    }

    async fn has_file(&self, path: &str) -> Result<bool> {
        Ok(self.stat(path).await?.is_some())
    }

    async fn create_file(&self, path: &str, data: &[u8]) -> Result<()> {
        let bucket = self.session.get()?;
        let key = self.key(path)?;
        let response = bucket
            .put_object(&key, data)
            .await
            .map_err(|e| s3_error(&key, e))?;
        match response.status_code() {
            status if is_success(status) => Ok(()),
            status => Err(status_error(&key, status)),
        }
    }

    async fn delete_file(&self, path: &str) -> Result<()> {
        let bucket = self.session.get()?;
        let key = self.key(path)?;
        match bucket.delete_object(&key).await {
            Ok(response) => match response.status_code() {
                404 => Ok(()),
                status if is_success(status) => {
                    debug!(key, "deleted");
                    Ok(())
                }
                status => Err(status_error(&key, status)),
            },
            Err(e) if http_status(&e) == Some(404) => Ok(()),
            Err(e) => Err(s3_error(&key, e)),
        }
    }
}

struct S3Pages {
    bucket: Arc<Bucket>,
    root: RootDir,
    prefix: String,
    page_size: Option<usize>,
}

#[async_trait]
impl PageSource for S3Pages {
    async fn fetch_page(&self, marker: &Marker) -> Result<Page> {
        let (result, status) = self
            .bucket
            .list_page(
                self.prefix.clone(),
                None,
                marker.token().map(str::to_string),
                None,
                self.page_size,
            )
            .await
            .map_err(|e| s3_error(&self.prefix, e))?;
        if !is_success(status) {
            return Err(status_error(&self.prefix, status));
        }
        let parts = result
            .contents
            .into_iter()
            .filter(|obj| !obj.key.ends_with('/'))
            .map(|obj| {
                let path = self.root.strip(&obj.key).unwrap_or(obj.key.as_str()).to_string();
                let etag = obj.e_tag.unwrap_or_default();
                Part::new(path, obj.size, etag.trim_matches('"'))
            })
            .collect();
        let next = if result.is_truncated {
            result.next_continuation_token
        } else {
            None
        };
        Ok(Page {
            parts,
            next: Marker::after(next),
        })
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    fn config() -> S3Config {
        S3Config {
            endpoint: "http://127.0.0.1:9000".into(),
            region: "us-east-1".into(),
            bucket: "backups".into(),
            access_key: String::new(),
            secret_key: String::new(),
            dir: "//vm/daily".into(),
            page_size: Some(2),
        }
    }

    fn credentials() -> Credentials {
        Credentials {
            account: "minio".into(),
            secret: "minio123".into(),
        }
    }

    #[test]
    fn config_defaults() {
        let config: S3Config = toml::from_str("bucket = \"b\"").unwrap();
        assert_eq!(config.region, "auto");
        assert!(config.endpoint.is_empty());
        assert!(config.dir.is_empty());
        assert_eq!(config.page_size, None);
    }

    #[test]
    fn keys_use_normalized_dir() {
        let backend = S3Backend::new(config());
        assert_eq!(backend.key("p/1").unwrap(), "vm/daily/p/1");
        assert!(backend.key("/p/1").is_err());
        assert_eq!(backend.to_string(), "S3{bucket: \"backups\", dir: \"vm/daily/\"}");
    }

    #[test]
    fn empty_bucket_is_a_config_error() {
        let mut config = config();
        config.bucket.clear();
        let backend = S3Backend::new(config);
        let err = backend.init_with(&credentials()).unwrap_err();
        assert!(matches!(err, BackendError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn operations_before_init_are_misuse() {
        let backend = S3Backend::new(config());
        let part = Part::new("p", 1, "f");
        let mut reader: &[u8] = b"x";
        assert!(matches!(
            backend.upload_part(&part, &mut reader).await,
            Err(BackendError::Misuse(_))
        ));
        let items: Vec<_> = backend.list_parts("").collect().await;
        assert!(matches!(items.as_slice(), [Err(BackendError::Misuse(_))]));
    }

    #[tokio::test]
    async fn lifecycle_without_network() {
        let backend = S3Backend::new(config());
        backend.init_with(&credentials()).unwrap();
        assert!(matches!(
            backend.init_with(&credentials()),
            Err(BackendError::Misuse(_))
        ));
        backend.stop();
        assert!(matches!(
            backend.has_file("p").await,
            Err(BackendError::Misuse(_))
        ));
        // Blank credentials in the config are never consulted once stopped.
        assert!(matches!(backend.init().await, Err(BackendError::Misuse(_))));
    }

    #[test]
    fn same_bucket_detection() {
        let a = S3Backend::new(config());
        let mut other = config();
        other.dir = "elsewhere".into();
        assert!(a.same_bucket(&S3Backend::new(other.clone())));
        other.bucket = "other".into();
        assert!(!a.same_bucket(&S3Backend::new(other)));
    }

    #[test]
    fn short_bodies_never_reach_the_bucket() {
        assert_eq!(plan_upload(10, 10), UploadPlan::Single);
        assert_eq!(plan_upload(0, 0), UploadPlan::Single);
        assert_eq!(plan_upload(CHUNK_SIZE, CHUNK_SIZE), UploadPlan::Single);
        assert_eq!(plan_upload(3, 10), UploadPlan::Truncated);
        assert_eq!(plan_upload(0, 10), UploadPlan::Truncated);
        assert_eq!(plan_upload(CHUNK_SIZE, 3 * CHUNK_SIZE), UploadPlan::Multipart);
    }

    #[test]
    fn error_classification() {
        let err = s3_error("k", S3Error::HttpFailWithBody(404, String::new()));
        assert!(err.is_not_found());
        let err = s3_error("k", S3Error::HttpFailWithBody(503, "slow down".into()));
        assert!(err.is_retryable());
        let err = s3_error("k", S3Error::HttpFailWithBody(403, "denied".into()));
        assert!(!err.is_retryable());
        assert!(status_error("k", 500).is_retryable());
        assert!(status_error("k", 404).is_not_found());
    }
}
