//! Credential sources.
//!
//! The compute API takes an OAuth access token; the registry proxy takes an
//! identity token minted for its own URL as audience. On GCE both come from
//! the instance metadata server.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result, Service};

/// Source of bearer tokens for the external APIs.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// OAuth access token for the compute API.
    async fn access_token(&self) -> Result<String>;

    /// Identity token with `audience` as its audience.
    async fn identity_token(&self, audience: &str) -> Result<String>;
}

/// Token source backed by the GCE metadata server.
pub struct MetadataTokenSource {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct AccessTokenResponse {
    access_token: String,
}

impl MetadataTokenSource {
    /// Create a token source for the metadata server at `base_url`
    /// (normally `http://metadata.google.internal/computeMetadata/v1`).
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::transport(Service::Credentials, e))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn get(&self, url: &str, query: &[(&str, &str)]) -> Result<reqwest::Response> {
        let response = self
            .client
            .get(url)
            .header("Metadata-Flavor", "Google")
            .query(query)
            .send()
            .await
            .map_err(|e| Error::transport(Service::Credentials, e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::http(Service::Credentials, status, body));
        }

        Ok(response)
    }
}

#[async_trait]
impl TokenSource for MetadataTokenSource {
    async fn access_token(&self) -> Result<String> {
        let url = format!(
            "{}/instance/service-accounts/default/token",
            self.base_url
        );
        debug!("Fetching access token from metadata server");

        let token: AccessTokenResponse = self
            .get(&url, &[])
            .await?
            .json()
            .await
            .map_err(|e| Error::transport(Service::Credentials, e))?;

        Ok(token.access_token)
    }

    async fn identity_token(&self, audience: &str) -> Result<String> {
        let url = format!(
            "{}/instance/service-accounts/default/identity",
            self.base_url
        );
        debug!(audience = %audience, "Fetching identity token from metadata server");

        let token = self
            .get(&url, &[("audience", audience), ("format", "full")])
            .await?
            .text()
            .await
            .map_err(|e| Error::transport(Service::Credentials, e))?;

        Ok(token.trim().to_string())
    }
}

/// Token source returning fixed tokens (local runs and tests).
#[derive(Debug, Clone)]
pub struct StaticTokenSource {
    token: String,
}

impl StaticTokenSource {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn access_token(&self) -> Result<String> {
        Ok(self.token.clone())
    }

    async fn identity_token(&self, _audience: &str) -> Result<String> {
        Ok(self.token.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_access_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/instance/service-accounts/default/token"))
            .and(header("Metadata-Flavor", "Google"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "ya29.token",
                "expires_in": 3599,
                "token_type": "Bearer"
            })))
            .mount(&server)
            .await;

        let source = MetadataTokenSource::new(server.uri()).unwrap();
        assert_eq!(source.access_token().await.unwrap(), "ya29.token");
    }

    #[tokio::test]
    async fn test_identity_token_uses_audience() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/instance/service-accounts/default/identity"))
            .and(query_param("audience", "https://proxy.example.com/github"))
            .respond_with(ResponseTemplate::new(200).set_body_string("eyJhbGci.id\n"))
            .mount(&server)
            .await;

        let source = MetadataTokenSource::new(server.uri()).unwrap();
        let token = source
            .identity_token("https://proxy.example.com/github")
            .await
            .unwrap();
        assert_eq!(token, "eyJhbGci.id");
    }

    #[tokio::test]
    async fn test_metadata_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let source = MetadataTokenSource::new(server.uri()).unwrap();
        let err = source.access_token().await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_static_source() {
        let source = StaticTokenSource::new("local");
        assert_eq!(source.access_token().await.unwrap(), "local");
        assert_eq!(source.identity_token("any").await.unwrap(), "local");
    }
}
