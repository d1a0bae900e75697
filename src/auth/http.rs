//! HTTP client for the workspace management service.
//!
//! Logging in posts the username and password as a form to
//! `/api/auth/jwt/login` and keeps the returned bearer token. Every later
//! call sends that token; the session itself is cached by the caller.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, Response, Url};
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use super::{
    AuthResponse, Authenticator, TokenSearchRequest, TokenSearchResponse, WorkspaceResponse,
    WorkspacesApi, WorkspacesConfig,
};
use crate::error::{AdapterError, Result};

const LOGIN_PATH: &str = "/api/auth/jwt/login";
const WORKSPACES_PATH: &str = "/api/workspace";
const TOKEN_SEARCH_PATH: &str = "/api/token/search";

fn upstream(context: &str, err: impl std::fmt::Display) -> AdapterError {
    AdapterError::Upstream(format!("{}: {}", context, err))
}

/// Decode a JSON body, turning error statuses into upstream errors
async fn decode<T: DeserializeOwned>(context: &str, response: Response) -> Result<T> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(upstream(
            context,
            format!("service returned {}: {}", status, body),
        ));
    }
    response.json().await.map_err(|e| upstream(context, e))
}

fn endpoint_url(base: &Url, path: &str) -> Result<Url> {
    base.join(path)
        .map_err(|e| AdapterError::Validation(format!("invalid endpoint: {}", e)))
}

/// Logs into the management service over HTTP
#[derive(Clone, Default)]
pub struct HttpAuthenticator {
    client: Client,
}

impl HttpAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    async fn login(&self, base: &Url, config: &WorkspacesConfig) -> Result<String> {
        let url = endpoint_url(base, LOGIN_PATH)?;
        let form = [
            ("username", config.username.as_deref().unwrap_or_default()),
            ("password", config.password.as_deref().unwrap_or_default()),
        ];

        debug!("login: url={}", url);
        let response = self
            .client
            .post(url)
            .form(&form)
            .send()
            .await
            .map_err(|e| upstream("login", e))?;
        let auth: AuthResponse = decode("login", response).await?;
        Ok(auth.access_token)
    }
}

#[async_trait]
impl Authenticator for HttpAuthenticator {
    async fn authenticate(&self, config: &WorkspacesConfig) -> Result<Arc<dyn WorkspacesApi>> {
        let base = config.url()?;
        let token = match &config.access_token {
            Some(token) => token.clone(),
            None => self.login(&base, config).await?,
        };

        info!(
            "authenticated against {} as {}",
            base,
            config.username.as_deref().unwrap_or("<token>")
        );
        Ok(Arc::new(HttpWorkspacesApi::new(
            self.client.clone(),
            base,
            token,
        )))
    }
}

/// Authenticated management service session
pub struct HttpWorkspacesApi {
    client: Client,
    base: Url,
    token: String,
}

impl HttpWorkspacesApi {
    pub fn new(client: Client, base: Url, token: String) -> Self {
        Self {
            client,
            base,
            token,
        }
    }
}

#[async_trait]
impl WorkspacesApi for HttpWorkspacesApi {
    async fn list_workspaces(&self) -> Result<Vec<WorkspaceResponse>> {
        let url = endpoint_url(&self.base, WORKSPACES_PATH)?;
        debug!("list_workspaces: url={}", url);
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| upstream("list workspaces", e))?;
        decode("list workspaces", response).await
    }

    async fn search_tokens(&self, terms: &[String]) -> Result<TokenSearchResponse> {
        let url = endpoint_url(&self.base, TOKEN_SEARCH_PATH)?;
        debug!("search_tokens: url={} terms={:?}", url, terms);
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.token)
            .json(&TokenSearchRequest {
                search_terms: terms,
            })
            .send()
            .await
            .map_err(|e| upstream("token search", e))?;
        decode("token search", response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_url_replaces_path() {
        let base = Url::parse("https://ws.example.com/ui/login").unwrap();
        assert_eq!(
            endpoint_url(&base, TOKEN_SEARCH_PATH).unwrap().as_str(),
            "https://ws.example.com/api/token/search"
        );
        let base = Url::parse("http://localhost:8080").unwrap();
        assert_eq!(
            endpoint_url(&base, LOGIN_PATH).unwrap().as_str(),
            "http://localhost:8080/api/auth/jwt/login"
        );
    }

    #[tokio::test]
    async fn test_access_token_skips_login() {
        // No request is made when a token is supplied, so an unroutable
        // endpoint still yields a session
        let config = WorkspacesConfig {
            endpoint: "http://127.0.0.1:9".to_string(),
            username: None,
            password: None,
            access_token: Some("jwt".to_string()),
        };
        assert!(HttpAuthenticator::new().authenticate(&config).await.is_ok());
    }

    #[tokio::test]
    async fn test_unreachable_service_is_upstream_error() {
        let config = WorkspacesConfig {
            endpoint: "http://127.0.0.1:9".to_string(),
            username: Some("alice".to_string()),
            password: Some("hunter2".to_string()),
            access_token: None,
        };
        let err = HttpAuthenticator::new()
            .authenticate(&config)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, AdapterError::Upstream(_)));
    }
}
