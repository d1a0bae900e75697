//! In-memory object store
//!
//! Mirrors the S3 semantics the backends depend on: delimited listings with
//! common prefixes, idempotent deletes, SSE-C key checks with S3's error
//! codes, and non-empty container deletion refusal. It also records every
//! delete call and region lookup so callers can assert on ordering and
//! round trips, and can be told to fail copies, region lookups or a given
//! upload part. Streamed uploads go through the same multipart driver as
//! the S3 store, with a configurable part size.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use tracing::trace;

use crate::backend::{stream_from_bytes, DataStream};
use crate::store::{
    upload_streamed, ContainerInfo, Listing, MultipartTarget, ObjectInfo, ObjectStore, SseKey,
    StoreError, StoreResult, UploadedPart, MIN_PART_SIZE,
};

/// A recorded delete call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Deletion {
    Object { container: String, key: String },
    Container(String),
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    modified: SystemTime,
    /// MD5 of the SSE-C key the object was written with
    key_md5: Option<String>,
}

#[derive(Debug, Clone)]
struct StoredContainer {
    region: Option<String>,
    created: SystemTime,
    objects: BTreeMap<String, StoredObject>,
}

/// Object store held entirely in memory
#[derive(Default)]
pub struct MemoryObjectStore {
    containers: RwLock<BTreeMap<String, StoredContainer>>,
    deletions: Mutex<Vec<Deletion>>,
    region_lookups: AtomicUsize,
    deny_region_lookup: AtomicBool,
    fail_copies: AtomicBool,
    /// Zero means `MIN_PART_SIZE`
    part_size: AtomicUsize,
    fail_part: Mutex<Option<i32>>,
    next_upload: AtomicUsize,
    /// Parts of multipart uploads not yet completed or aborted
    uploads: Mutex<BTreeMap<String, BTreeMap<i32, Bytes>>>,
}

fn no_such_bucket(container: &str) -> StoreError {
    StoreError::service(
        "NoSuchBucket",
        format!("The specified bucket does not exist: {}", container),
    )
}

fn no_such_key(key: &str) -> StoreError {
    StoreError::service(
        "NoSuchKey",
        format!("The specified key does not exist: {}", key),
    )
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an empty container in the legacy default region
    pub fn with_container(self, name: &str) -> Self {
        self.add_container(name, None);
        self
    }

    pub fn add_container(&self, name: &str, region: Option<&str>) {
        self.containers.write().insert(
            name.to_string(),
            StoredContainer {
                region: region.map(str::to_string),
                created: SystemTime::now(),
                objects: BTreeMap::new(),
            },
        );
    }

    /// Seed an unencrypted object, creating the container if needed
    pub fn insert_object(&self, container: &str, key: &str, data: impl Into<Bytes>) {
        let mut containers = self.containers.write();
        let entry = containers
            .entry(container.to_string())
            .or_insert_with(|| StoredContainer {
                region: None,
                created: SystemTime::now(),
                objects: BTreeMap::new(),
            });
        entry.objects.insert(
            key.to_string(),
            StoredObject {
                data: data.into(),
                modified: SystemTime::now(),
                key_md5: None,
            },
        );
    }

    /// Raw object content, ignoring encryption
    pub fn object(&self, container: &str, key: &str) -> Option<Bytes> {
        self.containers
            .read()
            .get(container)
            .and_then(|c| c.objects.get(key))
            .map(|o| o.data.clone())
    }

    pub fn is_encrypted(&self, container: &str, key: &str) -> bool {
        self.containers
            .read()
            .get(container)
            .and_then(|c| c.objects.get(key))
            .map(|o| o.key_md5.is_some())
            .unwrap_or(false)
    }

    pub fn has_container(&self, container: &str) -> bool {
        self.containers.read().contains_key(container)
    }

    /// All keys of a container, sorted
    pub fn keys(&self, container: &str) -> Vec<String> {
        self.containers
            .read()
            .get(container)
            .map(|c| c.objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Every delete call so far, in call order
    pub fn deletions(&self) -> Vec<Deletion> {
        self.deletions.lock().clone()
    }

    /// Number of region lookups served (or refused)
    pub fn region_lookups(&self) -> usize {
        self.region_lookups.load(Ordering::SeqCst)
    }

    /// Make region lookups fail with AccessDenied
    pub fn deny_region_lookup(&self, deny: bool) {
        self.deny_region_lookup.store(deny, Ordering::SeqCst);
    }

    /// Make server-side copies fail
    pub fn fail_copies(&self, fail: bool) {
        self.fail_copies.store(fail, Ordering::SeqCst);
    }

    /// Part size used by streamed uploads
    pub fn set_part_size(&self, part_size: usize) {
        self.part_size.store(part_size, Ordering::SeqCst);
    }

    /// Make the given part number of every multipart upload fail
    pub fn fail_upload_part(&self, part_number: Option<i32>) {
        *self.fail_part.lock() = part_number;
    }

    /// Multipart uploads started but neither completed nor aborted
    pub fn pending_uploads(&self) -> usize {
        self.uploads.lock().len()
    }

    fn load(&self, container: &str, key: &str, sse: Option<&SseKey>) -> StoreResult<Bytes> {
        let containers = self.containers.read();
        let stored = containers
            .get(container)
            .ok_or_else(|| no_such_bucket(container))?;
        let object = stored.objects.get(key).ok_or_else(|| no_such_key(key))?;

        match (&object.key_md5, sse) {
            (None, None) => Ok(object.data.clone()),
            (None, Some(_)) => Err(StoreError::service(
                "InvalidRequest",
                "The encryption parameters are not applicable to this object.",
            )),
            (Some(_), None) => Err(StoreError::service(
                "InvalidRequest",
                "The object was stored using a form of Server Side Encryption. \
                 The correct parameters must be provided to retrieve the object.",
            )),
            (Some(stored_md5), Some(given)) if *stored_md5 == given.key_md5_base64() => {
                Ok(object.data.clone())
            }
            (Some(_), Some(_)) => Err(StoreError::service(
                "InvalidArgument",
                "The secret key was invalid for the specified algorithm.",
            )),
        }
    }

    fn store(
        &self,
        container: &str,
        key: &str,
        data: Bytes,
        sse: Option<&SseKey>,
    ) -> StoreResult<()> {
        let mut containers = self.containers.write();
        let stored = containers
            .get_mut(container)
            .ok_or_else(|| no_such_bucket(container))?;
        stored.objects.insert(
            key.to_string(),
            StoredObject {
                data,
                modified: SystemTime::now(),
                key_md5: sse.map(SseKey::key_md5_base64),
            },
        );
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn container_region(&self, container: &str) -> StoreResult<Option<String>> {
        self.region_lookups.fetch_add(1, Ordering::SeqCst);
        if self.deny_region_lookup.load(Ordering::SeqCst) {
            return Err(StoreError::service("AccessDenied", "Access Denied"));
        }
        self.containers
            .read()
            .get(container)
            .map(|c| c.region.clone())
            .ok_or_else(|| no_such_bucket(container))
    }

    async fn list_containers(&self) -> StoreResult<Vec<ContainerInfo>> {
        Ok(self
            .containers
            .read()
            .iter()
            .map(|(name, c)| ContainerInfo {
                name: name.clone(),
                created: Some(c.created),
            })
            .collect())
    }

    async fn create_container(&self, region: &str, container: &str) -> StoreResult<()> {
        if self.has_container(container) {
            return Err(StoreError::service(
                "BucketAlreadyOwnedByYou",
                format!("Bucket already exists: {}", container),
            ));
        }
        let region = (region != "us-east-1").then_some(region);
        self.add_container(container, region);
        Ok(())
    }

    async fn delete_container(&self, _region: &str, container: &str) -> StoreResult<()> {
        let mut containers = self.containers.write();
        let stored = containers
            .get(container)
            .ok_or_else(|| no_such_bucket(container))?;
        if !stored.objects.is_empty() {
            return Err(StoreError::service(
                "BucketNotEmpty",
                "The bucket you tried to delete is not empty",
            ));
        }
        containers.remove(container);
        self.deletions
            .lock()
            .push(Deletion::Container(container.to_string()));
        Ok(())
    }

    async fn list_objects(
        &self,
        _region: &str,
        container: &str,
        prefix: &str,
        delimiter: Option<&str>,
    ) -> StoreResult<Listing> {
        let containers = self.containers.read();
        let stored = containers
            .get(container)
            .ok_or_else(|| no_such_bucket(container))?;

        let mut listing = Listing::default();
        let mut prefixes = BTreeSet::new();
        for (key, object) in stored.objects.range(prefix.to_string()..) {
            let Some(rest) = key.strip_prefix(prefix) else {
                break;
            };
            let grouped = delimiter
                .filter(|d| !d.is_empty())
                .and_then(|d| rest.find(d).map(|idx| idx + d.len()));
            match grouped {
                Some(end) => {
                    prefixes.insert(format!("{}{}", prefix, &rest[..end]));
                }
                None => listing.objects.push(ObjectInfo {
                    key: key.clone(),
                    size: object.data.len() as u64,
                    last_modified: Some(object.modified),
                }),
            }
        }
        listing.common_prefixes = prefixes.into_iter().collect();
        trace!(
            "memory list: container={} prefix={} objects={} prefixes={}",
            container,
            prefix,
            listing.objects.len(),
            listing.common_prefixes.len()
        );
        Ok(listing)
    }

    async fn get_object(
        &self,
        _region: &str,
        container: &str,
        key: &str,
        sse: Option<&SseKey>,
    ) -> StoreResult<DataStream> {
        let data = self.load(container, key, sse)?;
        Ok(stream_from_bytes(data))
    }

    async fn put_object(
        &self,
        _region: &str,
        container: &str,
        key: &str,
        body: Bytes,
        sse: Option<&SseKey>,
    ) -> StoreResult<()> {
        self.store(container, key, body, sse)
    }

    async fn copy_object(
        &self,
        _region: &str,
        from: (&str, &str),
        to: (&str, &str),
        sse: Option<&SseKey>,
    ) -> StoreResult<()> {
        if self.fail_copies.load(Ordering::SeqCst) {
            return Err(StoreError::service(
                "InternalError",
                "We encountered an internal error. Please try again.",
            ));
        }
        let data = self.load(from.0, from.1, sse)?;
        self.store(to.0, to.1, data, sse)
    }

    async fn delete_object(&self, _region: &str, container: &str, key: &str) -> StoreResult<()> {
        {
            let mut containers = self.containers.write();
            let stored = containers
                .get_mut(container)
                .ok_or_else(|| no_such_bucket(container))?;
            stored.objects.remove(key);
        }
        self.deletions.lock().push(Deletion::Object {
            container: container.to_string(),
            key: key.to_string(),
        });
        Ok(())
    }

    async fn upload(
        &self,
        _region: &str,
        container: &str,
        key: &str,
        body: DataStream,
        sse: Option<&SseKey>,
    ) -> StoreResult<()> {
        let part_size = match self.part_size.load(Ordering::SeqCst) {
            0 => MIN_PART_SIZE,
            n => n,
        };
        let target = MemoryUpload {
            store: self,
            container,
            key,
            sse,
        };
        upload_streamed(&target, body, part_size).await
    }
}

struct MemoryUpload<'a> {
    store: &'a MemoryObjectStore,
    container: &'a str,
    key: &'a str,
    sse: Option<&'a SseKey>,
}

#[async_trait]
impl MultipartTarget for MemoryUpload<'_> {
    async fn put(&self, body: Bytes) -> StoreResult<()> {
        self.store.store(self.container, self.key, body, self.sse)
    }

    async fn create(&self) -> StoreResult<String> {
        if !self.store.has_container(self.container) {
            return Err(no_such_bucket(self.container));
        }
        let id = format!(
            "upload-{}",
            self.store.next_upload.fetch_add(1, Ordering::SeqCst)
        );
        self.store.uploads.lock().insert(id.clone(), BTreeMap::new());
        Ok(id)
    }

    async fn upload_part(
        &self,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> StoreResult<UploadedPart> {
        if *self.store.fail_part.lock() == Some(part_number) {
            return Err(StoreError::service(
                "InternalError",
                "We encountered an internal error. Please try again.",
            ));
        }
        let mut uploads = self.store.uploads.lock();
        let parts = uploads
            .get_mut(upload_id)
            .ok_or_else(|| StoreError::service("NoSuchUpload", upload_id))?;
        parts.insert(part_number, body);
        Ok(UploadedPart {
            part_number,
            e_tag: Some(format!("\"{}-{}\"", upload_id, part_number)),
        })
    }

    async fn complete(&self, upload_id: &str, parts: Vec<UploadedPart>) -> StoreResult<()> {
        let stored = self
            .store
            .uploads
            .lock()
            .remove(upload_id)
            .ok_or_else(|| StoreError::service("NoSuchUpload", upload_id))?;

        let mut data = BytesMut::new();
        for part in &parts {
            let body = stored
                .get(&part.part_number)
                .ok_or_else(|| StoreError::service("InvalidPart", part.part_number.to_string()))?;
            data.extend_from_slice(body);
        }
        self.store
            .store(self.container, self.key, data.freeze(), self.sse)
    }

    async fn abort(&self, upload_id: &str) -> StoreResult<()> {
        self.store.uploads.lock().remove(upload_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::collect;

    #[tokio::test]
    async fn test_delimited_listing() {
        let store = MemoryObjectStore::new().with_container("b");
        store.insert_object("b", "dir/", "");
        store.insert_object("b", "dir/a.txt", "a");
        store.insert_object("b", "dir/sub/b.txt", "b");
        store.insert_object("b", "dir/sub/c/d.txt", "d");
        store.insert_object("b", "dirx", "x");
        store.insert_object("b", "top.txt", "t");

        let listing = store.list_objects("r", "b", "dir/", Some("/")).await.unwrap();
        let keys: Vec<_> = listing.objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["dir/", "dir/a.txt"]);
        assert_eq!(listing.common_prefixes, vec!["dir/sub/".to_string()]);

        let listing = store.list_objects("r", "b", "", Some("/")).await.unwrap();
        let keys: Vec<_> = listing.objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["dirx", "top.txt"]);
        assert_eq!(listing.common_prefixes, vec!["dir/".to_string()]);

        let listing = store.list_objects("r", "b", "dir/", None).await.unwrap();
        assert_eq!(listing.objects.len(), 4);
        assert!(listing.common_prefixes.is_empty());
    }

    #[tokio::test]
    async fn test_encryption_checks() {
        let store = MemoryObjectStore::new().with_container("b");
        let key = SseKey::new(vec![7u8; 32]).unwrap();
        let wrong = SseKey::new(vec![8u8; 32]).unwrap();
        store
            .put_object("r", "b", "secret", Bytes::from_static(b"s"), Some(&key))
            .await
            .unwrap();
        assert!(store.is_encrypted("b", "secret"));

        let body = store.get_object("r", "b", "secret", Some(&key)).await.unwrap();
        assert_eq!(collect(body).await.unwrap(), Bytes::from_static(b"s"));

        let err = store
            .get_object("r", "b", "secret", Some(&wrong))
            .await
            .err()
            .unwrap();
        assert_eq!(err.code(), Some("InvalidArgument"));

        store.insert_object("b", "plain", "p");
        let err = store
            .get_object("r", "b", "plain", Some(&key))
            .await
            .err()
            .unwrap();
        assert_eq!(err.code(), Some("InvalidRequest"));
    }

    #[tokio::test]
    async fn test_delete_container_requires_empty() {
        let store = MemoryObjectStore::new().with_container("b");
        store.insert_object("b", "k", "v");
        let err = store.delete_container("r", "b").await.unwrap_err();
        assert_eq!(err.code(), Some("BucketNotEmpty"));

        store.delete_object("r", "b", "k").await.unwrap();
        store.delete_container("r", "b").await.unwrap();
        assert!(!store.has_container("b"));
        assert_eq!(
            store.deletions(),
            vec![
                Deletion::Object {
                    container: "b".into(),
                    key: "k".into()
                },
                Deletion::Container("b".into()),
            ]
        );
    }

    #[tokio::test]
    async fn test_region_lookup_counter() {
        let store = MemoryObjectStore::new();
        store.add_container("eu", Some("eu-west-1"));
        assert_eq!(
            store.container_region("eu").await.unwrap(),
            Some("eu-west-1".to_string())
        );
        store.deny_region_lookup(true);
        assert!(store.container_region("eu").await.is_err());
        assert_eq!(store.region_lookups(), 2);
    }

    #[tokio::test]
    async fn test_multipart_upload_assembles_parts() {
        let store = MemoryObjectStore::new().with_container("b");
        store.set_part_size(4);
        let body = crate::backend::stream_from_chunks(vec![
            Bytes::from_static(b"abc"),
            Bytes::from_static(b"defgh"),
            Bytes::from_static(b"ij"),
        ]);

        store.upload("r", "b", "k", body, None).await.unwrap();
        assert_eq!(store.object("b", "k"), Some(Bytes::from_static(b"abcdefghij")));
        assert_eq!(store.pending_uploads(), 0);
    }

    #[tokio::test]
    async fn test_failed_part_leaves_no_upload_behind() {
        let store = MemoryObjectStore::new().with_container("b");
        store.set_part_size(4);
        store.fail_upload_part(Some(2));
        let body = crate::backend::stream_from_bytes(Bytes::from_static(b"0123456789"));

        let err = store.upload("r", "b", "k", body, None).await.unwrap_err();
        assert_eq!(err.code(), Some("InternalError"));
        assert_eq!(store.object("b", "k"), None);
        assert_eq!(store.pending_uploads(), 0);
    }
}
