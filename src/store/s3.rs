//! aws-sdk-s3 object store
//!
//! Works against Amazon S3 and S3-compatible stores (MinIO, Ceph, ...).
//! One SDK client is kept per region, since the region of each container is
//! only known after a location lookup.

use std::time::{Duration, SystemTime};

use async_stream::try_stream;
use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::{BehaviorVersion, Region};
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{
    BucketLocationConstraint, CompletedMultipartUpload, CompletedPart, CreateBucketConfiguration,
};
use aws_sdk_s3::Client;
use bytes::Bytes;
use dashmap::DashMap;
use tracing::debug;

use crate::backend::s3::S3Credentials;
use crate::backend::DataStream;
use crate::error::AdapterError;
use crate::store::{
    upload_streamed, ContainerInfo, Listing, MultipartTarget, ObjectInfo, ObjectStore, SseKey,
    StoreError, StoreResult, UploadedPart, MIN_PART_SIZE,
};

/// Region S3 treats as the location of buckets without a constraint
const LEGACY_REGION: &str = "us-east-1";

/// Convert an SDK error, keeping the service code when there is one
fn store_error<E, R>(err: SdkError<E, R>) -> StoreError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug,
{
    match &err {
        SdkError::ServiceError(_) => {
            let code = err.code().unwrap_or("Unknown").to_string();
            let message = err.message().unwrap_or_default().to_string();
            StoreError::Service { code, message }
        }
        SdkError::TimeoutError(_) => StoreError::Transport("request timeout".to_string()),
        SdkError::DispatchFailure(e) => StoreError::Transport(format!("{:?}", e)),
        _ => StoreError::Transport(format!("{:?}", err)),
    }
}

fn to_system_time(dt: &aws_sdk_s3::primitives::DateTime) -> Option<SystemTime> {
    let secs = u64::try_from(dt.secs()).ok()?;
    SystemTime::UNIX_EPOCH.checked_add(Duration::from_secs(secs))
}

/// `x-amz-copy-source` value: bucket and URL-encoded key, `/` kept
fn copy_source(container: &str, key: &str) -> String {
    let key = key
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/");
    format!("{}/{}", container, key)
}

/// S3 object store for one credential set
pub struct S3ObjectStore {
    config: aws_sdk_s3::Config,
    endpoint: Option<String>,
    default_region: String,
    part_size: usize,
    clients: DashMap<String, Client>,
}

impl S3ObjectStore {
    /// Build a store for a credential set on top of a shared SDK config.
    /// Nothing is loaded from the environment and no request is made.
    pub fn new(shared: &SdkConfig, credentials: &S3Credentials, part_size: usize) -> Self {
        let provider = Credentials::new(
            credentials.access_key_id.clone(),
            credentials.secret_access_key.clone(),
            credentials.session_token.clone(),
            None,
            "storage-adapter",
        );

        let config = aws_sdk_s3::config::Builder::from(shared)
            .behavior_version(BehaviorVersion::latest())
            .credentials_provider(provider)
            .region(Region::new(credentials.region.clone()))
            .build();

        Self {
            config,
            endpoint: credentials.endpoint.clone(),
            default_region: credentials.region.clone(),
            part_size: part_size.max(MIN_PART_SIZE),
            clients: DashMap::new(),
        }
    }

    /// Client bound to a region, created on first use
    fn client(&self, region: &str) -> Client {
        if let Some(client) = self.clients.get(region) {
            return client.clone();
        }

        let mut builder = self
            .config
            .to_builder()
            .region(Region::new(region.to_string()))
            .force_path_style(true);
        if let Some(endpoint) = &self.endpoint {
            builder = builder.endpoint_url(endpoint);
        }
        let client = Client::from_conf(builder.build());

        self.clients
            .entry(region.to_string())
            .or_insert(client)
            .clone()
    }
}

/// One object being written through a region client
struct S3Upload<'a> {
    client: Client,
    container: &'a str,
    key: &'a str,
    sse: Option<&'a SseKey>,
}

#[async_trait]
impl MultipartTarget for S3Upload<'_> {
    async fn put(&self, body: Bytes) -> StoreResult<()> {
        let sse = self.sse;
        self.client
            .put_object()
            .bucket(self.container)
            .key(self.key)
            .content_length(body.len() as i64)
            .body(ByteStream::from(body))
            .set_sse_customer_algorithm(sse.map(|k| k.algorithm().to_string()))
            .set_sse_customer_key(sse.map(SseKey::key_base64))
            .set_sse_customer_key_md5(sse.map(SseKey::key_md5_base64))
            .send()
            .await
            .map_err(store_error)?;
        Ok(())
    }

    async fn create(&self) -> StoreResult<String> {
        let sse = self.sse;
        let created = self
            .client
            .create_multipart_upload()
            .bucket(self.container)
            .key(self.key)
            .set_sse_customer_algorithm(sse.map(|k| k.algorithm().to_string()))
            .set_sse_customer_key(sse.map(SseKey::key_base64))
            .set_sse_customer_key_md5(sse.map(SseKey::key_md5_base64))
            .send()
            .await
            .map_err(store_error)?;
        created
            .upload_id()
            .map(str::to_string)
            .ok_or_else(|| StoreError::Transport("no upload id returned".to_string()))
    }

    async fn upload_part(
        &self,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> StoreResult<UploadedPart> {
        let sse = self.sse;
        let output = self
            .client
            .upload_part()
            .bucket(self.container)
            .key(self.key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(body))
            .set_sse_customer_algorithm(sse.map(|k| k.algorithm().to_string()))
            .set_sse_customer_key(sse.map(SseKey::key_base64))
            .set_sse_customer_key_md5(sse.map(SseKey::key_md5_base64))
            .send()
            .await
            .map_err(store_error)?;
        Ok(UploadedPart {
            part_number,
            e_tag: output.e_tag().map(str::to_string),
        })
    }

    async fn complete(&self, upload_id: &str, parts: Vec<UploadedPart>) -> StoreResult<()> {
        let parts = parts
            .into_iter()
            .map(|p| {
                CompletedPart::builder()
                    .part_number(p.part_number)
                    .set_e_tag(p.e_tag)
                    .build()
            })
            .collect();

        self.client
            .complete_multipart_upload()
            .bucket(self.container)
            .key(self.key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(store_error)?;
        debug!(
            "multipart upload completed: container={} key={}",
            self.container, self.key
        );
        Ok(())
    }

    async fn abort(&self, upload_id: &str) -> StoreResult<()> {
        self.client
            .abort_multipart_upload()
            .bucket(self.container)
            .key(self.key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(store_error)?;
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn container_region(&self, container: &str) -> StoreResult<Option<String>> {
        let output = self
            .client(&self.default_region)
            .get_bucket_location()
            .bucket(container)
            .send()
            .await
            .map_err(store_error)?;

        Ok(output
            .location_constraint()
            .map(|c| c.as_str().to_string())
            .filter(|c| !c.is_empty()))
    }

    async fn list_containers(&self) -> StoreResult<Vec<ContainerInfo>> {
        let output = self
            .client(&self.default_region)
            .list_buckets()
            .send()
            .await
            .map_err(store_error)?;

        Ok(output
            .buckets()
            .iter()
            .map(|b| ContainerInfo {
                name: b.name().unwrap_or_default().to_string(),
                created: b.creation_date().and_then(to_system_time),
            })
            .collect())
    }

    async fn create_container(&self, region: &str, container: &str) -> StoreResult<()> {
        let mut request = self.client(region).create_bucket().bucket(container);
        if region != LEGACY_REGION {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(region))
                    .build(),
            );
        }
        request.send().await.map_err(store_error)?;
        Ok(())
    }

    async fn delete_container(&self, region: &str, container: &str) -> StoreResult<()> {
        self.client(region)
            .delete_bucket()
            .bucket(container)
            .send()
            .await
            .map_err(store_error)?;
        Ok(())
    }

    async fn list_objects(
        &self,
        region: &str,
        container: &str,
        prefix: &str,
        delimiter: Option<&str>,
    ) -> StoreResult<Listing> {
        let client = self.client(region);
        let mut listing = Listing::default();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = client
                .list_objects_v2()
                .bucket(container)
                .prefix(prefix)
                .set_delimiter(delimiter.map(str::to_string));

            if let Some(token) = continuation_token.take() {
                request = request.continuation_token(token);
            }

            let result = request.send().await.map_err(store_error)?;

            for obj in result.contents() {
                if let Some(key) = obj.key() {
                    listing.objects.push(ObjectInfo {
                        key: key.to_string(),
                        size: obj.size().unwrap_or(0).max(0) as u64,
                        last_modified: obj.last_modified().and_then(to_system_time),
                    });
                }
            }
            listing.common_prefixes.extend(
                result
                    .common_prefixes()
                    .iter()
                    .filter_map(|p| p.prefix().map(str::to_string)),
            );

            if result.is_truncated().unwrap_or(false) {
                continuation_token = result.next_continuation_token().map(str::to_string);
                if continuation_token.is_none() {
                    break;
                }
            } else {
                break;
            }
        }

        Ok(listing)
    }

    async fn get_object(
        &self,
        region: &str,
        container: &str,
        key: &str,
        sse: Option<&SseKey>,
    ) -> StoreResult<DataStream> {
        let output = self
            .client(region)
            .get_object()
            .bucket(container)
            .key(key)
            .set_sse_customer_algorithm(sse.map(|k| k.algorithm().to_string()))
            .set_sse_customer_key(sse.map(SseKey::key_base64))
            .set_sse_customer_key_md5(sse.map(SseKey::key_md5_base64))
            .send()
            .await
            .map_err(store_error)?;

        let mut body = output.body;
        Ok(Box::pin(try_stream! {
            while let Some(chunk) = body.next().await {
                let chunk = chunk.map_err(|e| {
                    AdapterError::Upstream(format!("S3 read body error: {}", e))
                })?;
                yield chunk;
            }
        }))
    }

    async fn put_object(
        &self,
        region: &str,
        container: &str,
        key: &str,
        body: Bytes,
        sse: Option<&SseKey>,
    ) -> StoreResult<()> {
        S3Upload {
            client: self.client(region),
            container,
            key,
            sse,
        }
        .put(body)
        .await
    }

    async fn copy_object(
        &self,
        region: &str,
        from: (&str, &str),
        to: (&str, &str),
        sse: Option<&SseKey>,
    ) -> StoreResult<()> {
        self.client(region)
            .copy_object()
            .copy_source(copy_source(from.0, from.1))
            .bucket(to.0)
            .key(to.1)
            .set_copy_source_sse_customer_algorithm(sse.map(|k| k.algorithm().to_string()))
            .set_copy_source_sse_customer_key(sse.map(SseKey::key_base64))
            .set_copy_source_sse_customer_key_md5(sse.map(SseKey::key_md5_base64))
            .set_sse_customer_algorithm(sse.map(|k| k.algorithm().to_string()))
            .set_sse_customer_key(sse.map(SseKey::key_base64))
            .set_sse_customer_key_md5(sse.map(SseKey::key_md5_base64))
            .send()
            .await
            .map_err(store_error)?;
        Ok(())
    }

    async fn delete_object(&self, region: &str, container: &str, key: &str) -> StoreResult<()> {
        self.client(region)
            .delete_object()
            .bucket(container)
            .key(key)
            .send()
            .await
            .map_err(store_error)?;
        Ok(())
    }

    async fn upload(
        &self,
        region: &str,
        container: &str,
        key: &str,
        body: DataStream,
        sse: Option<&SseKey>,
    ) -> StoreResult<()> {
        let target = S3Upload {
            client: self.client(region),
            container,
            key,
            sse,
        };
        upload_streamed(&target, body, self.part_size).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials(region: &str) -> S3Credentials {
        S3Credentials::new("AKIDEXAMPLE", "secret", region)
    }

    #[test]
    fn test_copy_source_encodes_key_segments() {
        assert_eq!(
            copy_source("bucket", "Résumé 100%.pdf"),
            "bucket/R%C3%A9sum%C3%A9%20100%25.pdf"
        );
        assert_eq!(
            copy_source("bucket", "a b/c+d/e?.txt"),
            "bucket/a%20b/c%2Bd/e%3F.txt"
        );
        assert_eq!(copy_source("bucket", "dir/plain.txt"), "bucket/dir/plain.txt");
    }

    #[test]
    fn test_store_built_without_loading_environment() {
        let shared = SdkConfig::builder().build();
        let store = S3ObjectStore::new(&shared, &credentials("eu-west-1"), 1024);

        assert_eq!(store.part_size, MIN_PART_SIZE);
        assert_eq!(
            store.client("eu-west-1").config().region(),
            Some(&Region::new("eu-west-1"))
        );
        assert_eq!(
            store.client("ap-south-1").config().region(),
            Some(&Region::new("ap-south-1"))
        );
        // Region clients are reused
        store.client("eu-west-1");
        assert_eq!(store.clients.len(), 2);
    }
}
