//! Backend registry
//!
//! Maps a backend type name ("s3", "workspaces") to the factory that builds
//! instances of it. The registry is assembled once at start-up and then
//! installed as the process-wide registry, after which it is only read.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use tracing::{debug, info};

use crate::auth::HttpAuthenticator;
use crate::backend::s3::S3BackendFactory;
use crate::backend::workspaces::WorkspacesBackendFactory;
use crate::backend::FilesystemBackend;
use crate::config::{Config, ConfigError};
use crate::error::{AdapterError, Result};
use crate::form::Form;

/// Login parameters, as submitted by the user
pub type BackendParams = HashMap<String, String>;

/// A non-blank parameter value
pub fn param<'a>(params: &'a BackendParams, name: &str) -> Option<&'a str> {
    params
        .get(name)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
}

/// Builds backends of one type
#[async_trait]
pub trait BackendFactory: Send + Sync {
    /// Name the type is registered under
    fn backend_type(&self) -> &'static str;

    /// Fields the login screen should offer for this type
    fn login_form(&self) -> Form;

    /// Validate parameters and return a ready backend
    async fn init(&self, params: &BackendParams) -> Result<Arc<dyn FilesystemBackend>>;
}

static GLOBAL: OnceCell<BackendRegistry> = OnceCell::new();

#[derive(Default)]
pub struct BackendRegistry {
    factories: BTreeMap<&'static str, Arc<dyn BackendFactory>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in backend type, wired from configuration
    pub fn from_config(config: &Config) -> Self {
        let s3 = Arc::new(S3BackendFactory::new(
            config.s3.clone(),
            &config.session_cache,
        ));
        let workspaces = WorkspacesBackendFactory::new(
            Arc::new(HttpAuthenticator::new()),
            s3.clone(),
            &config.session_cache,
        );

        let mut registry = Self::new();
        registry.register(s3);
        registry.register(Arc::new(workspaces));
        registry
    }

    /// Add a factory; a later registration of the same type replaces the earlier one
    pub fn register(&mut self, factory: Arc<dyn BackendFactory>) -> &mut Self {
        debug!("registering backend type {}", factory.backend_type());
        self.factories.insert(factory.backend_type(), factory);
        self
    }

    pub fn get(&self, backend_type: &str) -> Option<&Arc<dyn BackendFactory>> {
        self.factories.get(backend_type)
    }

    /// Registered type names, sorted
    pub fn types(&self) -> Vec<&'static str> {
        self.factories.keys().copied().collect()
    }

    fn factory(&self, backend_type: &str) -> Result<&Arc<dyn BackendFactory>> {
        self.get(backend_type).ok_or_else(|| {
            AdapterError::Validation(format!("unknown backend type: {}", backend_type))
        })
    }

    /// Build a backend of the given type
    pub async fn init(
        &self,
        backend_type: &str,
        params: &BackendParams,
    ) -> Result<Arc<dyn FilesystemBackend>> {
        self.factory(backend_type)?.init(params).await
    }

    pub fn login_form(&self, backend_type: &str) -> Result<Form> {
        Ok(self.factory(backend_type)?.login_form())
    }
}

/// Install the process-wide registry; only the first call succeeds
pub fn install(registry: BackendRegistry) -> Result<&'static BackendRegistry> {
    let types = registry.types();
    GLOBAL.set(registry).map_err(|_| {
        AdapterError::Config(ConfigError::ValidationError(
            "backend registry is already installed".to_string(),
        ))
    })?;
    info!("backend registry installed: {}", types.join(", "));
    global().ok_or_else(|| {
        AdapterError::Config(ConfigError::ValidationError(
            "backend registry is not installed".to_string(),
        ))
    })
}

/// The installed registry, if any
pub fn global() -> Option<&'static BackendRegistry> {
    GLOBAL.get()
}
