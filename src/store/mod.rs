//! Raw object-store access
//!
//! The S3 backend talks to the store only through [`ObjectStore`], so the
//! directory emulation can run against aws-sdk-s3 or against the in-memory
//! store used by tests. Every container-scoped call takes the region the
//! caller resolved for that container.

pub mod memory;
pub mod s3;

use std::fmt;
use std::pin::Pin;
use std::time::SystemTime;

use async_stream::try_stream;
use async_trait::async_trait;
use aws_smithy_types::base64;
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use md5::{Digest, Md5};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::backend::DataStream;

/// Smallest part size accepted by S3 multipart uploads (except the last part)
pub const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

/// Errors reported by an object store, before classification
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    /// The service answered with an error code
    #[error("{code}: {message}")]
    Service { code: String, message: String },

    /// The request never got a service answer (network, timeout, construction)
    #[error("transport error: {0}")]
    Transport(String),

    /// Reading a request or response body failed
    #[error("body error: {0}")]
    Body(String),
}

impl StoreError {
    pub fn service(code: impl Into<String>, message: impl Into<String>) -> Self {
        StoreError::Service {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Service error code, if the service answered
    pub fn code(&self) -> Option<&str> {
        match self {
            StoreError::Service { code, .. } => Some(code),
            _ => None,
        }
    }

    pub fn message(&self) -> String {
        match self {
            StoreError::Service { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Customer-provided encryption key (SSE-C, AES256)
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SseKey {
    raw: Vec<u8>,
}

impl SseKey {
    pub const ALGORITHM: &'static str = "AES256";
    pub const LEN: usize = 32;

    /// Wrap a key; it must be exactly 32 bytes
    pub fn new(raw: impl Into<Vec<u8>>) -> Option<Self> {
        let raw = raw.into();
        (raw.len() == Self::LEN).then_some(Self { raw })
    }

    pub fn algorithm(&self) -> &'static str {
        Self::ALGORITHM
    }

    /// Base64 of the raw key, as sent in the request headers
    pub fn key_base64(&self) -> String {
        base64::encode(&self.raw)
    }

    /// Base64 of the key's MD5 digest
    pub fn key_md5_base64(&self) -> String {
        base64::encode(Md5::digest(&self.raw))
    }
}

impl fmt::Debug for SseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SseKey(<redacted>)")
    }
}

/// A container visible to the credential set
#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub name: String,
    pub created: Option<SystemTime>,
}

/// An object returned by a listing
#[derive(Debug, Clone)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub last_modified: Option<SystemTime>,
}

/// Result of a delimited listing, all pages merged
#[derive(Debug, Clone, Default)]
pub struct Listing {
    pub objects: Vec<ObjectInfo>,
    pub common_prefixes: Vec<String>,
}

/// Operations the S3 backend needs from an object store
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Location constraint of a container; `None` means the legacy default
    async fn container_region(&self, container: &str) -> StoreResult<Option<String>>;

    async fn list_containers(&self) -> StoreResult<Vec<ContainerInfo>>;

    async fn create_container(&self, region: &str, container: &str) -> StoreResult<()>;

    async fn delete_container(&self, region: &str, container: &str) -> StoreResult<()>;

    /// List keys under `prefix`, grouped on `delimiter` when given
    async fn list_objects(
        &self,
        region: &str,
        container: &str,
        prefix: &str,
        delimiter: Option<&str>,
    ) -> StoreResult<Listing>;

    async fn get_object(
        &self,
        region: &str,
        container: &str,
        key: &str,
        sse: Option<&SseKey>,
    ) -> StoreResult<DataStream>;

    async fn put_object(
        &self,
        region: &str,
        container: &str,
        key: &str,
        body: Bytes,
        sse: Option<&SseKey>,
    ) -> StoreResult<()>;

    /// Server-side copy; `sse` applies to both the source and the destination
    async fn copy_object(
        &self,
        region: &str,
        from: (&str, &str),
        to: (&str, &str),
        sse: Option<&SseKey>,
    ) -> StoreResult<()>;

    async fn delete_object(&self, region: &str, container: &str, key: &str) -> StoreResult<()>;

    /// Stream `body` into an object without buffering all of it
    async fn upload(
        &self,
        region: &str,
        container: &str,
        key: &str,
        body: DataStream,
        sse: Option<&SseKey>,
    ) -> StoreResult<()>;
}

/// Regroup an arbitrary byte stream into parts of `part_size` bytes.
///
/// Every part but the last is exactly `part_size` long. The input is only
/// polled when the current part is not full yet, so the consumer's pace
/// bounds memory use.
pub fn part_chunks(
    mut body: DataStream,
    part_size: usize,
) -> impl Stream<Item = StoreResult<Bytes>> + Send {
    try_stream! {
        let mut buffer = BytesMut::with_capacity(part_size);
        while let Some(chunk) = body.next().await {
            let mut chunk = chunk.map_err(|e| StoreError::Body(e.to_string()))?;
            while !chunk.is_empty() {
                let take = (part_size - buffer.len()).min(chunk.len());
                buffer.extend_from_slice(&chunk.split_to(take));
                if buffer.len() == part_size {
                    yield buffer.split().freeze();
                }
            }
        }
        if !buffer.is_empty() {
            yield buffer.freeze();
        }
    }
}

type PartStream = Pin<Box<dyn Stream<Item = StoreResult<Bytes>> + Send>>;

/// A part accepted by a multipart upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedPart {
    pub part_number: i32,
    pub e_tag: Option<String>,
}

/// Destination object of a streamed upload
#[async_trait]
pub trait MultipartTarget: Send + Sync {
    /// Store the whole object in one request
    async fn put(&self, body: Bytes) -> StoreResult<()>;

    /// Start a multipart upload, returning its id
    async fn create(&self) -> StoreResult<String>;

    async fn upload_part(
        &self,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> StoreResult<UploadedPart>;

    async fn complete(&self, upload_id: &str, parts: Vec<UploadedPart>) -> StoreResult<()>;

    async fn abort(&self, upload_id: &str) -> StoreResult<()>;
}

/// Stream `body` into `target`.
///
/// Input shorter than one part goes out as a single put. Otherwise parts are
/// uploaded one at a time and the next part is only read from `body` once
/// the previous one is stored. Any failure after the upload was created
/// aborts it.
pub async fn upload_streamed(
    target: &dyn MultipartTarget,
    body: DataStream,
    part_size: usize,
) -> StoreResult<()> {
    let mut parts: PartStream = Box::pin(part_chunks(body, part_size));

    let first = match parts.next().await.transpose()? {
        Some(first) => first,
        None => return target.put(Bytes::new()).await,
    };
    if first.len() < part_size {
        return target.put(first).await;
    }

    let upload_id = target.create().await?;
    debug!("multipart upload started: id={}", upload_id);

    let result = match upload_parts(target, &upload_id, first, &mut parts).await {
        Ok(completed) => target.complete(&upload_id, completed).await,
        Err(e) => Err(e),
    };

    if let Err(e) = &result {
        warn!("aborting multipart upload {}: {}", upload_id, e);
        if let Err(abort_err) = target.abort(&upload_id).await {
            warn!("abort of upload {} failed: {}", upload_id, abort_err);
        }
    }
    result
}

async fn upload_parts(
    target: &dyn MultipartTarget,
    upload_id: &str,
    first: Bytes,
    rest: &mut PartStream,
) -> StoreResult<Vec<UploadedPart>> {
    let mut completed = Vec::new();
    let mut next = Some(first);
    let mut part_number = 1;

    while let Some(data) = next.take() {
        trace!("upload_part: id={} part={} size={}", upload_id, part_number, data.len());
        completed.push(target.upload_part(upload_id, part_number, data).await?);
        part_number += 1;

        // Pull the next part only once this one is stored
        next = rest.next().await.transpose()?;
    }

    Ok(completed)
}
