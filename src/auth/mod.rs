//! Workspace management service client
//!
//! The workspaces backend never holds long-lived store credentials. It logs
//! into a management service once per configuration, then asks it for
//! short-lived, path-scoped object-store credentials on every operation.
//!
//! - [`Authenticator`] turns a [`WorkspacesConfig`] into an authenticated
//!   [`WorkspacesApi`] session.
//! - [`http`] implements both over the service's HTTP API.

pub mod http;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::error::{AdapterError, Result};
use crate::registry::{param, BackendParams};

pub use http::{HttpAuthenticator, HttpWorkspacesApi};

/// How to reach and log into a management service
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct WorkspacesConfig {
    pub endpoint: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Pre-issued bearer token, used instead of a login
    pub access_token: Option<String>,
}

impl WorkspacesConfig {
    /// Read and validate login parameters
    pub fn from_params(params: &BackendParams) -> Result<Self> {
        let endpoint = param(params, "endpoint")
            .ok_or_else(|| AdapterError::Validation("endpoint is required".to_string()))?;
        let url = Url::parse(endpoint).map_err(|e| {
            AdapterError::Validation(format!("invalid endpoint {:?}: {}", endpoint, e))
        })?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(AdapterError::Validation(format!(
                "endpoint must be an http(s) URL: {}",
                endpoint
            )));
        }

        let config = Self {
            endpoint: endpoint.to_string(),
            username: param(params, "username").map(str::to_string),
            password: param(params, "password").map(str::to_string),
            access_token: param(params, "access_token").map(str::to_string),
        };

        let has_login = config.username.is_some() && config.password.is_some();
        if !has_login && config.access_token.is_none() {
            return Err(AdapterError::Validation(
                "username and password are required".to_string(),
            ));
        }
        Ok(config)
    }

    pub fn url(&self) -> Result<Url> {
        Url::parse(&self.endpoint)
            .map_err(|e| AdapterError::Validation(format!("invalid endpoint: {}", e)))
    }
}

impl fmt::Debug for WorkspacesConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkspacesConfig")
            .field("endpoint", &self.endpoint)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Storage root a workspace lives in
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RootResponse {
    pub root_type: String,
    pub bucket: String,
    pub base_path: String,
    pub id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WorkspaceResponse {
    pub name: String,
    pub base_path: String,
    pub id: String,
    /// Creation time, e.g. "2020-09-09T20:43:54.368144"
    pub created: String,
    pub owner_id: String,
    pub root_id: String,
    pub root: RootResponse,
}

/// Short-lived store credentials
#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct TokenResponse {
    pub expiration: String,
    pub id: String,
    pub created: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: String,
}

impl fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenResponse")
            .field("id", &self.id)
            .field("expiration", &self.expiration)
            .field("access_key_id", &self.access_key_id)
            .finish_non_exhaustive()
    }
}

/// Store node the credentials are valid for
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NodeResponse {
    pub name: String,
    pub api_url: String,
    pub region_name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenGrant {
    pub token: TokenResponse,
    pub node: NodeResponse,
}

/// Where a searched logical path lands inside a workspace
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WorkspaceMapping {
    /// Path below the workspace base path
    pub path: String,
    pub workspace: WorkspaceResponse,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TokenSearchResponse {
    pub tokens: Vec<TokenGrant>,
    /// Search term to mapping
    pub workspaces: BTreeMap<String, WorkspaceMapping>,
}

#[derive(Debug, Serialize)]
pub(crate) struct TokenSearchRequest<'a> {
    pub search_terms: &'a [String],
}

#[derive(Debug, Deserialize)]
pub(crate) struct AuthResponse {
    pub access_token: String,
}

/// An authenticated management service session
#[async_trait]
pub trait WorkspacesApi: Send + Sync {
    /// Workspaces visible to the logged-in user
    async fn list_workspaces(&self) -> Result<Vec<WorkspaceResponse>>;

    /// Exchange logical paths for scoped credentials and their physical location
    async fn search_tokens(&self, terms: &[String]) -> Result<TokenSearchResponse>;
}

/// Opens management service sessions
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, config: &WorkspacesConfig) -> Result<Arc<dyn WorkspacesApi>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> BackendParams {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_config_from_params() {
        let config = WorkspacesConfig::from_params(&params(&[
            ("endpoint", "https://ws.example.com"),
            ("username", "alice"),
            ("password", "hunter2"),
        ]))
        .unwrap();
        assert_eq!(config.username.as_deref(), Some("alice"));
        assert_eq!(config.url().unwrap().host_str(), Some("ws.example.com"));
        assert!(!format!("{:?}", config).contains("hunter2"));

        let config = WorkspacesConfig::from_params(&params(&[
            ("endpoint", "http://localhost:8080"),
            ("access_token", "jwt"),
        ]))
        .unwrap();
        assert_eq!(config.access_token.as_deref(), Some("jwt"));
    }

    #[test]
    fn test_config_validation() {
        let err = WorkspacesConfig::from_params(&params(&[("username", "a"), ("password", "b")]))
            .unwrap_err();
        assert_eq!(err.status_code(), 400);

        let err = WorkspacesConfig::from_params(&params(&[
            ("endpoint", "not a url"),
            ("username", "a"),
            ("password", "b"),
        ]))
        .unwrap_err();
        assert!(matches!(err, AdapterError::Validation(_)));

        let err = WorkspacesConfig::from_params(&params(&[
            ("endpoint", "ftp://ws.example.com"),
            ("username", "a"),
            ("password", "b"),
        ]))
        .unwrap_err();
        assert!(matches!(err, AdapterError::Validation(_)));

        let err = WorkspacesConfig::from_params(&params(&[
            ("endpoint", "https://ws.example.com"),
            ("username", "a"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("password"));
    }

    #[test]
    fn test_parse_token_search_response() {
        let body = r#"{
            "tokens": [{
                "token": {
                    "expiration": "2021-01-01T00:00:00",
                    "id": "t1",
                    "created": "2020-12-31T23:00:00",
                    "access_key_id": "AK",
                    "secret_access_key": "SK",
                    "session_token": "ST"
                },
                "node": {"name": "n1", "api_url": "http://node:9000", "region_name": "us-west-1"}
            }],
            "workspaces": {
                "/proj/docs": {
                    "path": "docs",
                    "workspace": {
                        "name": "proj",
                        "base_path": "ws/proj",
                        "id": "w1",
                        "created": "2020-09-09T20:43:54.368144",
                        "owner_id": "u1",
                        "root_id": "r1",
                        "root": {"root_type": "s3", "bucket": "data", "base_path": "roots/a", "id": "r1"}
                    }
                }
            }
        }"#;
        let response: TokenSearchResponse = serde_json::from_str(body).unwrap();
        assert_eq!(response.tokens[0].token.session_token, "ST");
        assert_eq!(response.tokens[0].node.region_name, "us-west-1");
        let mapping = &response.workspaces["/proj/docs"];
        assert_eq!(mapping.workspace.root.bucket, "data");
        assert!(!format!("{:?}", response.tokens[0].token).contains("SK"));
    }
}
