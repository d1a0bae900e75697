//! S3 backend
//!
//! Presents a flat object store as a filesystem. The root lists containers
//! (buckets); below that, keys are grouped on `/` to emulate directories.
//! Directory markers are zero-byte objects whose key ends in `/`.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, SdkConfig};
use aws_sdk_s3::config::Region;
use bytes::Bytes;
use futures::future::{try_join_all, BoxFuture};
use tokio::sync::OnceCell;
use tracing::{debug, trace, warn};

use crate::backend::{BackendProvisioner, DataStream, Entry, FilesystemBackend};
use crate::cache::{SessionCache, SessionCacheConfig};
use crate::config::S3Settings;
use crate::error::{AdapterError, Result};
use crate::form::{Form, FormElement};
use crate::path::{base_name, decompose, is_dir_path, SEPARATOR};
use crate::registry::{param, BackendFactory, BackendParams};
use crate::store::s3::S3ObjectStore;
use crate::store::{ObjectStore, SseKey, StoreError};

/// Credential set an S3 backend instance is bound to
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct S3Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
    pub encryption_key: Option<SseKey>,
    /// Region used for calls that are not scoped to a container
    pub region: String,
    pub endpoint: Option<String>,
}

impl S3Credentials {
    /// Plain access key credentials in the given region
    pub fn new(
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token: None,
            encryption_key: None,
            region: region.into(),
            endpoint: None,
        }
    }

    /// Read and validate credentials from login parameters
    pub fn from_params(params: &BackendParams, settings: &S3Settings) -> Result<Self> {
        let encryption_key = match param(params, "encryption_key") {
            None => None,
            Some(raw) => Some(SseKey::new(raw.as_bytes().to_vec()).ok_or_else(|| {
                AdapterError::Validation(format!(
                    "Encryption key needs to be {} characters (current: {})",
                    SseKey::LEN,
                    raw.len()
                ))
            })?),
        };

        Ok(Self {
            access_key_id: param(params, "access_key_id").unwrap_or_default().to_string(),
            secret_access_key: param(params, "secret_access_key")
                .unwrap_or_default()
                .to_string(),
            session_token: param(params, "session_token").map(str::to_string),
            encryption_key,
            region: param(params, "region")
                .unwrap_or(&settings.default_region)
                .to_string(),
            endpoint: param(params, "endpoint").map(str::to_string),
        })
    }
}

impl fmt::Debug for S3Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .field("encryption_key", &self.encryption_key)
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

/// Region cache key: a credential set looking at one container
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RegionKey {
    credentials: S3Credentials,
    container: String,
}

/// Resolved container regions, shared by every S3 backend of a process
pub type RegionCache = SessionCache<RegionKey, String>;

/// Map a store failure onto the adapter's error kinds
fn classify(err: StoreError, path: &str) -> AdapterError {
    match err.code() {
        Some("NoSuchKey") | Some("NoSuchBucket") | Some("NotFound") => {
            AdapterError::NotFound(path.to_string())
        }
        Some("AccessDenied") | Some("Forbidden") => AdapterError::Forbidden(path.to_string()),
        Some("InvalidArgument") if err.message().contains("secret key was invalid") => {
            AdapterError::EncryptionKeyMismatch(path.to_string())
        }
        _ => AdapterError::Upstream(format!("{}: {}", path, err)),
    }
}

/// The store refused encryption parameters for an object stored in clear
fn is_encryption_mismatch(err: &StoreError) -> bool {
    err.code() == Some("InvalidRequest") && err.message().to_lowercase().contains("encryption")
}

/// Filesystem backend over an object store
pub struct S3Backend {
    store: Arc<dyn ObjectStore>,
    credentials: S3Credentials,
    regions: Arc<RegionCache>,
    fallback_region: String,
}

impl S3Backend {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        credentials: S3Credentials,
        regions: Arc<RegionCache>,
        fallback_region: impl Into<String>,
    ) -> Self {
        Self {
            store,
            credentials,
            regions,
            fallback_region: fallback_region.into(),
        }
    }

    pub fn credentials(&self) -> &S3Credentials {
        &self.credentials
    }

    fn sse(&self) -> Option<&SseKey> {
        self.credentials.encryption_key.as_ref()
    }

    fn region_key(&self, container: &str) -> RegionKey {
        RegionKey {
            credentials: self.credentials.clone(),
            container: container.to_string(),
        }
    }

    /// Region of a container, looked up at most once per cache lifetime.
    ///
    /// A failed lookup is not an error: stores that refuse to disclose a
    /// location are assumed to live in the fallback region.
    pub async fn resolve_region(&self, container: &str) -> String {
        let key = self.region_key(container);
        if let Some(region) = self.regions.get(&key) {
            trace!("resolve_region: container={} cached={}", container, region);
            return region;
        }

        let region = match self.store.container_region(container).await {
            Ok(Some(region)) => region,
            Ok(None) => self.fallback_region.clone(),
            Err(e) => {
                warn!(
                    "region lookup for {} failed, using {}: {}",
                    container, self.fallback_region, e
                );
                self.fallback_region.clone()
            }
        };
        debug!("resolve_region: container={} region={}", container, region);
        self.regions.insert(key, region.clone());
        region
    }

    /// Delete everything below `prefix`, leaving the marker at `prefix` itself
    fn delete_children<'a>(
        &'a self,
        region: &'a str,
        container: &'a str,
        prefix: &'a str,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let path = format!("/{}/{}", container, prefix);
            let listing = self
                .store
                .list_objects(region, container, prefix, Some("/"))
                .await
                .map_err(|e| classify(e, &path))?;

            for object in listing.objects.iter().filter(|o| o.key != prefix) {
                trace!("delete: container={} key={}", container, object.key);
                self.store
                    .delete_object(region, container, &object.key)
                    .await
                    .map_err(|e| classify(e, &path))?;
            }

            // Sibling prefixes cover disjoint key ranges; all of them must be
            // gone before the caller removes the parent marker.
            try_join_all(listing.common_prefixes.iter().map(|sub| async move {
                self.delete_children(region, container, sub).await?;
                self.delete_marker(region, container, sub).await
            }))
            .await?;

            Ok(())
        })
    }

    /// Delete a directory marker; a marker that is already gone is fine
    async fn delete_marker(&self, region: &str, container: &str, key: &str) -> Result<()> {
        match self.store.delete_object(region, container, key).await {
            Ok(()) => Ok(()),
            Err(e) => match classify(e, key) {
                AdapterError::NotFound(_) => Ok(()),
                other => Err(other),
            },
        }
    }
}

#[async_trait]
impl FilesystemBackend for S3Backend {
    async fn list(&self, path: &str) -> Result<Vec<Entry>> {
        let p = decompose(path);
        debug!("list: path={} container={} key={}", path, p.container, p.key);

        if p.is_root() {
            let containers = self
                .store
                .list_containers()
                .await
                .map_err(|e| classify(e, path))?;
            return Ok(containers
                .into_iter()
                .map(|c| Entry::directory(c.name).with_mtime(c.created).pinned())
                .collect());
        }

        let region = self.resolve_region(&p.container).await;
        let listing = self
            .store
            .list_objects(&region, &p.container, &p.key, Some("/"))
            .await
            .map_err(|e| classify(e, path))?;

        let mut entries = Vec::with_capacity(listing.objects.len() + listing.common_prefixes.len());
        for object in listing.objects {
            // The directory's own marker is not a child of itself
            if object.key == p.key {
                continue;
            }
            entries.push(Entry::file(
                base_name(&object.key),
                object.size,
                object.last_modified,
            ));
        }
        for prefix in listing.common_prefixes {
            entries.push(Entry::directory(base_name(&prefix)));
        }
        Ok(entries)
    }

    async fn read(&self, path: &str) -> Result<DataStream> {
        let p = decompose(path);
        debug!("read: path={} container={} key={}", path, p.container, p.key);
        if p.is_root() {
            return Err(AdapterError::NotFound(path.to_string()));
        }

        let region = self.resolve_region(&p.container).await;
        match self
            .store
            .get_object(&region, &p.container, &p.key, self.sse())
            .await
        {
            Ok(body) => Ok(body),
            Err(e) if self.sse().is_some() && is_encryption_mismatch(&e) => {
                debug!("read: {} is not encrypted, retrying without key", path);
                self.store
                    .get_object(&region, &p.container, &p.key, None)
                    .await
                    .map_err(|e| classify(e, path))
            }
            Err(e) => Err(classify(e, path)),
        }
    }

    async fn create_dir(&self, path: &str) -> Result<()> {
        let p = decompose(path);
        debug!("create_dir: path={} container={} key={}", path, p.container, p.key);
        if p.is_root() {
            return Err(AdapterError::InvalidPath(path.to_string()));
        }

        if p.key.is_empty() {
            // A new container lives in the configured region
            let region = self.credentials.region.clone();
            self.store
                .create_container(&region, &p.container)
                .await
                .map_err(|e| classify(e, path))?;
            self.regions.insert(self.region_key(&p.container), region);
            return Ok(());
        }

        let mut key = p.key;
        if !key.ends_with(SEPARATOR) {
            key.push(SEPARATOR);
        }
        let region = self.resolve_region(&p.container).await;
        self.store
            .put_object(&region, &p.container, &key, Bytes::new(), None)
            .await
            .map_err(|e| classify(e, path))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let p = decompose(path);
        debug!("delete: path={} container={} key={}", path, p.container, p.key);
        if p.is_root() {
            return Err(AdapterError::NotFound(path.to_string()));
        }

        if p.key.is_empty() && !is_dir_path(path) {
            // Removing a whole container needs the explicit `/bucket/` form
            return Err(AdapterError::InvalidPath(path.to_string()));
        }

        let region = self.resolve_region(&p.container).await;

        if !is_dir_path(path) {
            return self
                .store
                .delete_object(&region, &p.container, &p.key)
                .await
                .map_err(|e| classify(e, path));
        }

        self.delete_children(&region, &p.container, &p.key).await?;

        if p.key.is_empty() {
            self.regions.remove(&self.region_key(&p.container));
            return self
                .store
                .delete_container(&region, &p.container)
                .await
                .map_err(|e| classify(e, path));
        }

        self.delete_marker(&region, &p.container, &p.key).await
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let f = decompose(from);
        let t = decompose(to);
        debug!("rename: from={} to={}", from, to);

        if f.key.is_empty() || is_dir_path(from) {
            return Err(AdapterError::Unimplemented(format!(
                "renaming directories is not supported: {}",
                from
            )));
        }
        if t.key.is_empty() || is_dir_path(to) {
            return Err(AdapterError::InvalidPath(to.to_string()));
        }

        let region = self.resolve_region(&f.container).await;
        self.store
            .copy_object(
                &region,
                (&f.container, &f.key),
                (&t.container, &t.key),
                self.sse(),
            )
            .await
            .map_err(|e| classify(e, from))?;

        self.delete(from).await
    }

    async fn touch(&self, path: &str) -> Result<()> {
        let p = decompose(path);
        debug!("touch: path={} container={} key={}", path, p.container, p.key);
        if p.is_root() || p.key.is_empty() {
            return Err(AdapterError::InvalidPath(path.to_string()));
        }

        let region = self.resolve_region(&p.container).await;
        self.store
            .put_object(&region, &p.container, &p.key, Bytes::new(), self.sse())
            .await
            .map_err(|e| classify(e, path))
    }

    async fn write(&self, path: &str, data: DataStream) -> Result<()> {
        let p = decompose(path);
        debug!("write: path={} container={} key={}", path, p.container, p.key);
        if p.is_root() || p.key.is_empty() {
            return Err(AdapterError::InvalidPath(path.to_string()));
        }

        let region = self.resolve_region(&p.container).await;
        self.store
            .upload(&region, &p.container, &p.key, data, self.sse())
            .await
            .map_err(|e| classify(e, path))
    }
}

/// Registry entry for the `s3` backend type
pub struct S3BackendFactory {
    settings: S3Settings,
    regions: Arc<RegionCache>,
    shared: OnceCell<SdkConfig>,
}

impl S3BackendFactory {
    pub fn new(settings: S3Settings, cache: &SessionCacheConfig) -> Self {
        Self {
            settings,
            regions: Arc::new(SessionCache::new(cache)),
            shared: OnceCell::new(),
        }
    }

    pub fn settings(&self) -> &S3Settings {
        &self.settings
    }

    /// SDK settings shared by every backend, loaded on first use.
    /// Credentials are always overridden per backend.
    pub async fn shared_config(&self) -> &SdkConfig {
        self.shared
            .get_or_init(|| async {
                debug!("loading shared aws sdk config");
                aws_config::defaults(BehaviorVersion::latest())
                    .region(Region::new(self.settings.default_region.clone()))
                    .load()
                    .await
            })
            .await
    }

    /// Build a backend for a credential set against the real store
    pub async fn backend(&self, credentials: S3Credentials) -> S3Backend {
        let shared = self.shared_config().await;
        let store = S3ObjectStore::new(shared, &credentials, self.settings.part_size);
        S3Backend::new(
            Arc::new(store),
            credentials,
            self.regions.clone(),
            self.settings.fallback_region.clone(),
        )
    }
}

#[async_trait]
impl BackendFactory for S3BackendFactory {
    fn backend_type(&self) -> &'static str {
        "s3"
    }

    fn login_form(&self) -> Form {
        Form::new(vec![
            FormElement::hidden("type", "s3"),
            FormElement::text("access_key_id", "Access Key ID*"),
            FormElement::text("secret_access_key", "Secret Access Key*"),
            FormElement::toggle(
                "advanced",
                "Advanced",
                &[
                    "s3_path",
                    "s3_session_token",
                    "s3_encryption_key",
                    "s3_region",
                    "s3_endpoint",
                ],
            ),
            FormElement::text("session_token", "Session Token").with_id("s3_session_token"),
            FormElement::text("path", "Path").with_id("s3_path"),
            FormElement::text("encryption_key", "Encryption Key").with_id("s3_encryption_key"),
            FormElement::text("region", "Region").with_id("s3_region"),
            FormElement::text("endpoint", "Endpoint").with_id("s3_endpoint"),
        ])
    }

    async fn init(&self, params: &BackendParams) -> Result<Arc<dyn FilesystemBackend>> {
        let credentials = S3Credentials::from_params(params, &self.settings)?;
        debug!("init s3 backend: {:?}", credentials);
        Ok(Arc::new(self.backend(credentials).await))
    }
}

#[async_trait]
impl BackendProvisioner for S3BackendFactory {
    async fn provision(&self, credentials: S3Credentials) -> Result<Arc<dyn FilesystemBackend>> {
        Ok(Arc::new(self.backend(credentials).await))
    }
}
