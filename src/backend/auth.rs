//! Credentials for outbound Google API calls.
//!
//! Production runs on Cloud Run, where the instance metadata server hands out
//! short-lived tokens for the attached service account. Developers can set
//! `ACCESS_TOKEN` instead (e.g. from `gcloud auth print-access-token`).

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::config::MonitorConfig;
use crate::error::AppError;

/// Refresh cached tokens this long before they actually expire.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

#[async_trait]
pub trait TokenSource: Send + Sync {
    /// OAuth2 access token for Google REST APIs.
    async fn access_token(&self) -> Result<String, AppError>;

    /// OpenID identity token for calling a private service at `audience`.
    async fn identity_token(&self, audience: &str) -> Result<String, AppError>;
}

pub fn token_source_from_config(config: &MonitorConfig) -> Result<Arc<dyn TokenSource>, AppError> {
    match &config.access_token {
        Some(token) => {
            tracing::info!("Using static ACCESS_TOKEN for Google API calls");
            Ok(Arc::new(StaticToken(token.clone())))
        }
        None => Ok(Arc::new(MetadataServerTokens::new(config.endpoints.metadata.clone())?)),
    }
}

// ── Static ─────────────────────────────────────────────────────────

pub struct StaticToken(pub String);

#[async_trait]
impl TokenSource for StaticToken {
    async fn access_token(&self) -> Result<String, AppError> {
        Ok(self.0.clone())
    }

    async fn identity_token(&self, _audience: &str) -> Result<String, AppError> {
        Ok(self.0.clone())
    }
}

// ── Metadata server ────────────────────────────────────────────────

#[derive(Deserialize)]
struct MetadataTokenResponse {
    access_token: String,
    expires_in: u64,
}

struct CachedToken {
    token: String,
    expires_at: Instant,
}

pub struct MetadataServerTokens {
    http: reqwest::Client,
    base_url: String,
    cached: Mutex<Option<CachedToken>>,
}

impl MetadataServerTokens {
    pub fn new(base_url: String) -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            cached: Mutex::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/computeMetadata/v1/instance/service-accounts/default/{}",
            self.base_url, path
        )
    }

    async fn fetch_text(&self, req: reqwest::RequestBuilder) -> Result<String, AppError> {
        let response = req
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|e| AppError::Auth(format!("Metadata server unreachable: {e}")))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AppError::Auth(format!("Metadata server read failed: {e}")))?;
        if !status.is_success() {
            return Err(AppError::Auth(format!(
                "Metadata server returned {status}: {}",
                body.trim()
            )));
        }
        Ok(body)
    }
}

#[async_trait]
impl TokenSource for MetadataServerTokens {
    async fn access_token(&self) -> Result<String, AppError> {
        let mut cached = self.cached.lock().await;
        if let Some(c) = cached.as_ref() {
            if c.expires_at > Instant::now() + EXPIRY_MARGIN {
                return Ok(c.token.clone());
            }
        }

        let body = self.fetch_text(self.http.get(self.url("token"))).await?;
        let parsed: MetadataTokenResponse = serde_json::from_str(&body)
            .map_err(|e| AppError::malformed(format!("Invalid token response: {e}"), &body))?;

        tracing::debug!(expires_in = parsed.expires_in, "Fetched access token from metadata server");
        *cached = Some(CachedToken {
            token: parsed.access_token.clone(),
            expires_at: Instant::now() + Duration::from_secs(parsed.expires_in),
        });
        Ok(parsed.access_token)
    }

    async fn identity_token(&self, audience: &str) -> Result<String, AppError> {
        let req = self
            .http
            .get(self.url("identity"))
            .query(&[("audience", audience), ("format", "full")]);
        let token = self.fetch_text(req).await?;
        Ok(token.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TOKEN_PATH: &str = "/computeMetadata/v1/instance/service-accounts/default/token";

    #[tokio::test]
    async fn test_static_token() {
        let source = StaticToken("abc".into());
        assert_eq!(source.access_token().await.unwrap(), "abc");
        assert_eq!(source.identity_token("https://x").await.unwrap(), "abc");
    }

    #[tokio::test]
    async fn test_metadata_token_is_cached() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(TOKEN_PATH))
            .and(header("Metadata-Flavor", "Google"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "ya29.token",
                "expires_in": 3599,
                "token_type": "Bearer"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let source = MetadataServerTokens::new(server.uri()).unwrap();
        assert_eq!(source.access_token().await.unwrap(), "ya29.token");
        assert_eq!(source.access_token().await.unwrap(), "ya29.token");
    }

    #[tokio::test]
    async fn test_metadata_short_lived_token_is_refetched() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(TOKEN_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "short",
                "expires_in": 30
            })))
            .expect(2)
            .mount(&server)
            .await;

        let source = MetadataServerTokens::new(server.uri()).unwrap();
        source.access_token().await.unwrap();
        source.access_token().await.unwrap();
    }

    #[tokio::test]
    async fn test_metadata_error_maps_to_auth() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(TOKEN_PATH))
            .respond_with(ResponseTemplate::new(404).set_body_string("not on GCE"))
            .mount(&server)
            .await;

        let source = MetadataServerTokens::new(server.uri()).unwrap();
        assert!(matches!(source.access_token().await, Err(AppError::Auth(_))));
    }

    #[tokio::test]
    async fn test_identity_token_passes_audience() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/computeMetadata/v1/instance/service-accounts/default/identity"))
            .and(query_param("audience", "https://config.example"))
            .respond_with(ResponseTemplate::new(200).set_body_string("eyJ.jwt\n"))
            .mount(&server)
            .await;

        let source = MetadataServerTokens::new(server.uri()).unwrap();
        assert_eq!(
            source.identity_token("https://config.example").await.unwrap(),
            "eyJ.jwt"
        );
    }
}
