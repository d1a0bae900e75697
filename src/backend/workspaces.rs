//! Workspaces backend
//!
//! Logical workspaces managed by a separate service. The root lists the
//! workspaces; any deeper path is exchanged for short-lived credentials and
//! a physical location, and the operation is forwarded to an S3 backend
//! provisioned with those credentials.

use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use tracing::{debug, info, trace};

use crate::auth::{Authenticator, WorkspaceMapping, WorkspacesApi, WorkspacesConfig};
use crate::backend::s3::S3Credentials;
use crate::backend::{BackendProvisioner, DataStream, Entry, FilesystemBackend};
use crate::cache::{SessionCache, SessionCacheConfig};
use crate::error::{AdapterError, Result};
use crate::form::{Form, FormElement};
use crate::path::{is_dir_path, join, SEPARATOR};
use crate::registry::{BackendFactory, BackendParams};

/// Parse a workspace creation time; the service omits the offset
fn parse_created(created: &str) -> Option<SystemTime> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(created) {
        return Some(dt.with_timezone(&Utc).into());
    }
    NaiveDateTime::parse_from_str(created, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc().into())
}

/// Physical path of a searched logical path.
///
/// A trailing separator on the logical path is kept, so directory
/// operations stay directory operations after translation.
pub fn physical_path(mapping: &WorkspaceMapping, directory: bool) -> String {
    let workspace = &mapping.workspace;
    let joined = join([
        workspace.root.bucket.as_str(),
        workspace.root.base_path.as_str(),
        workspace.base_path.as_str(),
        mapping.path.as_str(),
    ]);

    let mut path = format!("{}{}", SEPARATOR, joined);
    if directory && !path.ends_with(SEPARATOR) {
        path.push(SEPARATOR);
    }
    path
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

/// Filesystem backend over a management service session
pub struct WorkspacesBackend {
    api: Arc<dyn WorkspacesApi>,
    provisioner: Arc<dyn BackendProvisioner>,
}

impl WorkspacesBackend {
    pub fn new(api: Arc<dyn WorkspacesApi>, provisioner: Arc<dyn BackendProvisioner>) -> Self {
        Self { api, provisioner }
    }

    /// Exchange a logical path for its physical path and a backend scoped to it
    async fn resolve(&self, path: &str) -> Result<(String, Arc<dyn FilesystemBackend>)> {
        let mut response = self.api.search_tokens(&[path.to_string()]).await?;

        let grant = response.tokens.into_iter().next().ok_or_else(|| {
            AdapterError::Upstream(format!("token search returned no credentials for {}", path))
        })?;
        let mapping = match response.workspaces.remove(path) {
            Some(mapping) => mapping,
            None => response
                .workspaces
                .into_values()
                .next()
                .ok_or_else(|| {
                    AdapterError::Upstream(format!("token search returned no workspace for {}", path))
                })?,
        };

        let physical = physical_path(&mapping, is_dir_path(path));
        debug!(
            "resolve: path={} workspace={} physical={} node={}",
            path, mapping.workspace.name, physical, grant.node.name
        );

        let credentials = S3Credentials {
            access_key_id: grant.token.access_key_id,
            secret_access_key: grant.token.secret_access_key,
            session_token: non_empty(&grant.token.session_token),
            encryption_key: None,
            region: grant.node.region_name,
            endpoint: non_empty(&grant.node.api_url),
        };
        let backend = self.provisioner.provision(credentials).await?;
        Ok((physical, backend))
    }
}

#[async_trait]
impl FilesystemBackend for WorkspacesBackend {
    async fn list(&self, path: &str) -> Result<Vec<Entry>> {
        debug!("list: path={}", path);
        if path == "/" {
            let workspaces = self.api.list_workspaces().await?;
            return Ok(workspaces
                .into_iter()
                .map(|ws| {
                    Entry::directory(ws.name)
                        .with_mtime(parse_created(&ws.created))
                        .pinned()
                })
                .collect());
        }

        let (mut physical, backend) = self.resolve(path).await?;
        if !physical.ends_with(SEPARATOR) {
            physical.push(SEPARATOR);
        }
        backend.list(&physical).await
    }

    async fn read(&self, path: &str) -> Result<DataStream> {
        debug!("read: path={}", path);
        let (physical, backend) = self.resolve(path).await?;
        backend.read(&physical).await
    }

    async fn create_dir(&self, path: &str) -> Result<()> {
        debug!("create_dir: path={}", path);
        let (physical, backend) = self.resolve(path).await?;
        backend.create_dir(&physical).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        debug!("delete: path={}", path);
        let (physical, backend) = self.resolve(path).await?;
        backend.delete(&physical).await
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        // Moves are not offered across workspaces; accepted and ignored
        debug!("rename: from={} to={} (ignored)", from, to);
        Ok(())
    }

    async fn touch(&self, path: &str) -> Result<()> {
        debug!("touch: path={}", path);
        let (physical, backend) = self.resolve(path).await?;
        backend.touch(&physical).await
    }

    async fn write(&self, path: &str, data: DataStream) -> Result<()> {
        debug!("write: path={}", path);
        let (physical, backend) = self.resolve(path).await?;
        backend.write(&physical, data).await
    }
}

/// Registry entry for the `workspaces` backend type.
///
/// Sessions are cached per configuration, so repeated inits with the same
/// login reuse one authentication until the cache entry expires.
pub struct WorkspacesBackendFactory {
    authenticator: Arc<dyn Authenticator>,
    provisioner: Arc<dyn BackendProvisioner>,
    sessions: SessionCache<WorkspacesConfig, Arc<WorkspacesBackend>>,
}

impl WorkspacesBackendFactory {
    pub fn new(
        authenticator: Arc<dyn Authenticator>,
        provisioner: Arc<dyn BackendProvisioner>,
        cache: &SessionCacheConfig,
    ) -> Self {
        Self {
            authenticator,
            provisioner,
            sessions: SessionCache::new(cache),
        }
    }

    /// Cached backend for a configuration, authenticating on a miss
    pub async fn connect(&self, config: WorkspacesConfig) -> Result<Arc<WorkspacesBackend>> {
        if let Some(backend) = self.sessions.get(&config) {
            trace!("reusing workspaces session for {}", config.endpoint);
            return Ok(backend);
        }

        let api = self.authenticator.authenticate(&config).await?;
        info!("workspaces session opened for {}", config.endpoint);

        let backend = Arc::new(WorkspacesBackend::new(api, self.provisioner.clone()));
        self.sessions.insert(config, backend.clone());
        Ok(backend)
    }
}

#[async_trait]
impl BackendFactory for WorkspacesBackendFactory {
    fn backend_type(&self) -> &'static str {
        "workspaces"
    }

    fn login_form(&self) -> Form {
        Form::new(vec![
            FormElement::hidden("type", "workspaces"),
            FormElement::text("username", "Username").required(),
            FormElement::password("password", "Password").required(),
            FormElement::toggle("advanced", "Advanced", &["wio_endpoint"]),
            FormElement::text("endpoint", "Endpoint").with_id("wio_endpoint"),
        ])
    }

    async fn init(&self, params: &BackendParams) -> Result<Arc<dyn FilesystemBackend>> {
        let config = WorkspacesConfig::from_params(params)?;
        let backend: Arc<dyn FilesystemBackend> = self.connect(config).await?;
        Ok(backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{
        NodeResponse, RootResponse, TokenGrant, TokenResponse, TokenSearchResponse,
        WorkspaceResponse,
    };
    use crate::backend::s3::S3Backend;
    use crate::backend::{collect, stream_from_bytes};
    use crate::store::memory::MemoryObjectStore;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct FakeApi {
        workspaces: Vec<WorkspaceResponse>,
        search: TokenSearchResponse,
        searches: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl WorkspacesApi for FakeApi {
        async fn list_workspaces(&self) -> Result<Vec<WorkspaceResponse>> {
            Ok(self.workspaces.clone())
        }

        async fn search_tokens(&self, terms: &[String]) -> Result<TokenSearchResponse> {
            self.searches.lock().push(terms.to_vec());
            Ok(self.search.clone())
        }
    }

    struct FakeAuthenticator {
        api: Arc<FakeApi>,
        calls: AtomicUsize,
        fail: AtomicBool,
    }

    #[async_trait]
    impl Authenticator for FakeAuthenticator {
        async fn authenticate(&self, _config: &WorkspacesConfig) -> Result<Arc<dyn WorkspacesApi>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(AdapterError::Upstream("login refused".to_string()));
            }
            let api: Arc<dyn WorkspacesApi> = self.api.clone();
            Ok(api)
        }
    }

    /// Hands out S3 backends over one in-memory store, recording the credentials
    struct MemoryProvisioner {
        store: Arc<MemoryObjectStore>,
        provisioned: Mutex<Vec<S3Credentials>>,
    }

    #[async_trait]
    impl BackendProvisioner for MemoryProvisioner {
        async fn provision(
            &self,
            credentials: S3Credentials,
        ) -> Result<Arc<dyn FilesystemBackend>> {
            self.provisioned.lock().push(credentials.clone());
            Ok(Arc::new(S3Backend::new(
                self.store.clone(),
                credentials,
                Arc::new(SessionCache::new(&SessionCacheConfig::default())),
                "us-east-1",
            )))
        }
    }

    fn workspace(name: &str) -> WorkspaceResponse {
        WorkspaceResponse {
            name: name.to_string(),
            base_path: format!("spaces/{}", name),
            id: format!("id-{}", name),
            created: "2020-09-09T20:43:54.368144".to_string(),
            root: RootResponse {
                root_type: "s3".to_string(),
                bucket: "data".to_string(),
                base_path: "root".to_string(),
                id: "r1".to_string(),
            },
            ..Default::default()
        }
    }

    fn search_response(term: &str, sub_path: &str) -> TokenSearchResponse {
        let mut response = TokenSearchResponse {
            tokens: vec![TokenGrant {
                token: TokenResponse {
                    access_key_id: "AK".to_string(),
                    secret_access_key: "SK".to_string(),
                    session_token: "ST".to_string(),
                    ..Default::default()
                },
                node: NodeResponse {
                    name: "node-1".to_string(),
                    api_url: "http://node-1:9000".to_string(),
                    region_name: "us-west-1".to_string(),
                },
            }],
            ..Default::default()
        };
        response.workspaces.insert(
            term.to_string(),
            WorkspaceMapping {
                path: sub_path.to_string(),
                workspace: workspace("proj"),
            },
        );
        response
    }

    struct Fixture {
        store: Arc<MemoryObjectStore>,
        api: Arc<FakeApi>,
        authenticator: Arc<FakeAuthenticator>,
        provisioner: Arc<MemoryProvisioner>,
        factory: WorkspacesBackendFactory,
    }

    fn fixture(search: TokenSearchResponse) -> Fixture {
        let store = Arc::new(MemoryObjectStore::new().with_container("data"));
        let api = Arc::new(FakeApi {
            workspaces: vec![workspace("proj"), workspace("other")],
            search,
            searches: Mutex::new(Vec::new()),
        });
        let authenticator = Arc::new(FakeAuthenticator {
            api: api.clone(),
            calls: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
        });
        let provisioner = Arc::new(MemoryProvisioner {
            store: store.clone(),
            provisioned: Mutex::new(Vec::new()),
        });
        let factory = WorkspacesBackendFactory::new(
            authenticator.clone(),
            provisioner.clone(),
            &SessionCacheConfig::default(),
        );
        Fixture {
            store,
            api,
            authenticator,
            provisioner,
            factory,
        }
    }

    fn params(username: &str) -> BackendParams {
        [
            ("username", username),
            ("password", "hunter2"),
            ("endpoint", "https://ws.example.com"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    #[test]
    fn test_physical_path() {
        let mapping = WorkspaceMapping {
            path: "docs/".to_string(),
            workspace: workspace("proj"),
        };
        assert_eq!(physical_path(&mapping, true), "/data/root/spaces/proj/docs/");
        assert_eq!(physical_path(&mapping, false), "/data/root/spaces/proj/docs");

        let mapping = WorkspaceMapping {
            path: String::new(),
            workspace: workspace("proj"),
        };
        assert_eq!(physical_path(&mapping, true), "/data/root/spaces/proj/");
    }

    #[test]
    fn test_parse_created() {
        assert!(parse_created("2020-09-09T20:43:54.368144").is_some());
        assert!(parse_created("2020-09-09T20:43:54Z").is_some());
        assert!(parse_created("yesterday").is_none());
    }

    #[tokio::test]
    async fn test_init_authenticates_once() {
        let f = fixture(search_response("/proj/", ""));

        f.factory.init(&params("alice")).await.unwrap();
        f.factory.init(&params("alice")).await.unwrap();
        assert_eq!(f.authenticator.calls.load(Ordering::SeqCst), 1);

        f.factory.init(&params("bob")).await.unwrap();
        assert_eq!(f.authenticator.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_authentication_not_cached() {
        let f = fixture(search_response("/proj/", ""));
        f.authenticator.fail.store(true, Ordering::SeqCst);
        let err = f.factory.init(&params("alice")).await.err().unwrap();
        assert!(matches!(err, AdapterError::Upstream(_)));

        f.authenticator.fail.store(false, Ordering::SeqCst);
        f.factory.init(&params("alice")).await.unwrap();
        assert_eq!(f.authenticator.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalid_params() {
        let f = fixture(search_response("/proj/", ""));
        let mut p = params("alice");
        p.remove("endpoint");
        let err = f.factory.init(&p).await.err().unwrap();
        assert!(matches!(err, AdapterError::Validation(_)));
        assert_eq!(f.authenticator.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_list_root_lists_workspaces() {
        let f = fixture(search_response("/proj/", ""));
        let backend = f.factory.init(&params("alice")).await.unwrap();

        let entries = backend.list("/").await.unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["proj", "other"]);
        assert!(entries.iter().all(|e| e.is_dir() && e.can_move == Some(false)));
        assert!(entries.iter().all(|e| e.mtime.is_some()));
        assert!(f.api.searches.lock().is_empty());
    }

    #[tokio::test]
    async fn test_list_forwards_to_physical_path() {
        let f = fixture(search_response("/proj/docs/", "docs"));
        f.store.insert_object("data", "root/spaces/proj/docs/a.txt", "a");
        f.store.insert_object("data", "root/spaces/proj/docs/img/b.png", "b");
        f.store.insert_object("data", "root/spaces/other/c.txt", "c");
        let backend = f.factory.init(&params("alice")).await.unwrap();

        let entries = backend.list("/proj/docs/").await.unwrap();
        let mut names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        names.sort();
        assert_eq!(names, vec!["a.txt", "img"]);

        assert_eq!(
            f.api.searches.lock().as_slice(),
            &[vec!["/proj/docs/".to_string()]]
        );
        let provisioned = f.provisioner.provisioned.lock();
        assert_eq!(provisioned.len(), 1);
        assert_eq!(provisioned[0].access_key_id, "AK");
        assert_eq!(provisioned[0].session_token.as_deref(), Some("ST"));
        assert_eq!(provisioned[0].region, "us-west-1");
        assert_eq!(provisioned[0].endpoint.as_deref(), Some("http://node-1:9000"));
        assert!(provisioned[0].encryption_key.is_none());
    }

    #[tokio::test]
    async fn test_file_operations_forward() {
        let f = fixture(search_response("/proj/notes.txt", "notes.txt"));
        let backend = f.factory.init(&params("alice")).await.unwrap();

        backend
            .write("/proj/notes.txt", stream_from_bytes("remember"))
            .await
            .unwrap();
        assert!(f
            .store
            .object("data", "root/spaces/proj/notes.txt")
            .is_some());

        let data = collect(backend.read("/proj/notes.txt").await.unwrap())
            .await
            .unwrap();
        assert_eq!(&data[..], b"remember");

        backend.delete("/proj/notes.txt").await.unwrap();
        assert!(f.store.object("data", "root/spaces/proj/notes.txt").is_none());

        // Inner errors come through unchanged
        let err = backend.read("/proj/notes.txt").await.err().unwrap();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_delete_mapped_to_bare_bucket_is_refused() {
        let mut search = search_response("/proj", "");
        let mapping = search.workspaces.get_mut("/proj").unwrap();
        mapping.workspace.root.base_path.clear();
        mapping.workspace.base_path.clear();
        let f = fixture(search);
        f.store.insert_object("data", "keep/me.txt", "k");
        let backend = f.factory.init(&params("alice")).await.unwrap();

        let err = backend.delete("/proj").await.unwrap_err();
        assert!(matches!(err, AdapterError::InvalidPath(_)));
        assert!(f.store.has_container("data"));
        assert_eq!(f.store.keys("data"), vec!["keep/me.txt".to_string()]);
    }

    #[tokio::test]
    async fn test_create_dir_forwards_directory_path() {
        let f = fixture(search_response("/proj/new/", "new"));
        let backend = f.factory.init(&params("alice")).await.unwrap();

        backend.create_dir("/proj/new/").await.unwrap();
        assert_eq!(
            f.store.keys("data"),
            vec!["root/spaces/proj/new/".to_string()]
        );
    }

    #[tokio::test]
    async fn test_rename_is_a_no_op() {
        let f = fixture(search_response("/proj/a.txt", "a.txt"));
        f.store.insert_object("data", "root/spaces/proj/a.txt", "a");
        let backend = f.factory.init(&params("alice")).await.unwrap();

        backend.rename("/proj/a.txt", "/proj/b.txt").await.unwrap();
        assert_eq!(
            f.store.keys("data"),
            vec!["root/spaces/proj/a.txt".to_string()]
        );
        assert!(f.api.searches.lock().is_empty());
    }

    #[tokio::test]
    async fn test_empty_search_is_upstream_error() {
        let f = fixture(TokenSearchResponse::default());
        let backend = f.factory.init(&params("alice")).await.unwrap();
        let err = backend.list("/proj/").await.unwrap_err();
        assert!(matches!(err, AdapterError::Upstream(_)));
        assert_eq!(err.status_code(), 502);

        let mut no_mapping = search_response("/proj/", "");
        no_mapping.workspaces.clear();
        let f = fixture(no_mapping);
        let backend = f.factory.init(&params("alice")).await.unwrap();
        let err = backend.touch("/proj/x").await.unwrap_err();
        assert!(matches!(err, AdapterError::Upstream(_)));
        assert!(f.provisioner.provisioned.lock().is_empty());
    }

    #[test]
    fn test_root_capabilities() {
        let f = fixture(TokenSearchResponse::default());
        let backend = WorkspacesBackend::new(f.api.clone(), f.provisioner.clone());
        assert_eq!(backend.capabilities("/").can_upload, Some(false));
        assert_eq!(backend.capabilities("/proj/").can_upload, None);
    }

    #[test]
    fn test_login_form() {
        let f = fixture(TokenSearchResponse::default());
        let form = f.factory.login_form();
        assert!(form.field("username").unwrap().required);
        assert!(form.field("password").unwrap().required);
        assert_eq!(
            form.field("advanced").unwrap().target,
            vec!["wio_endpoint".to_string()]
        );
        assert!(form.dangling_targets().is_empty());
    }
}
