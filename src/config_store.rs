//! Read/write access to the job's JSON configuration blob.
//!
//! Locally the blob is a file. In the cloud it is read from a GCS object and
//! updates are forwarded to a separate configuration service with an identity
//! token, which owns validation and the actual write.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::backend::auth::{token_source_from_config, TokenSource};
use crate::config::{ConfigSource, MonitorConfig};
use crate::error::AppError;

const READ_RETRIES: usize = 3;
const READ_RETRY_DELAY: Duration = Duration::from_millis(100);
const FORWARD_TIMEOUT: Duration = Duration::from_secs(15);

/// HTTP status and body to hand back to the caller of `save-config`.
#[derive(Debug, Clone, PartialEq)]
pub struct SaveOutcome {
    pub status: u16,
    pub body: Value,
}

#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// `Ok(None)` when no configuration exists yet.
    async fn load(&self) -> Result<Option<Value>, AppError>;

    async fn save(&self, payload: Value) -> Result<SaveOutcome, AppError>;
}

pub fn build_config_store(config: &MonitorConfig) -> Result<Arc<dyn ConfigStore>, AppError> {
    match &config.config_source {
        ConfigSource::File(path) => {
            tracing::info!(path = %path.display(), "Using local config file");
            Ok(Arc::new(FileConfigStore::new(path.clone())))
        }
        ConfigSource::Gcs { bucket, object } => {
            tracing::info!(bucket = %bucket, object = %object, "Using GCS config object");
            Ok(Arc::new(GcsConfigStore::new(
                config.endpoints.storage.clone(),
                bucket.clone(),
                object.clone(),
                config.config_service_url.clone(),
                token_source_from_config(config)?,
            )?))
        }
    }
}

// ── File ───────────────────────────────────────────────────────────

pub struct FileConfigStore {
    path: PathBuf,
}

impl FileConfigStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    async fn read_once(&self) -> Result<Option<Value>, AppError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if content.trim().is_empty() {
            return Err(AppError::Config(format!(
                "Config file is empty: {}",
                self.path.display()
            )));
        }
        Ok(Some(serde_json::from_str(&content)?))
    }
}

#[async_trait]
impl ConfigStore for FileConfigStore {
    /// Retries a few times: editors and the job itself may hold the file
    /// mid-write when we read it.
    async fn load(&self) -> Result<Option<Value>, AppError> {
        let mut attempt = 1;
        loop {
            match self.read_once().await {
                Ok(v) => return Ok(v),
                Err(e) if attempt < READ_RETRIES => {
                    tracing::debug!(attempt, "Config read failed, retrying: {}", e);
                    attempt += 1;
                    tokio::time::sleep(READ_RETRY_DELAY).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn save(&self, payload: Value) -> Result<SaveOutcome, AppError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let text = serde_json::to_string_pretty(&payload)?;
        tokio::fs::write(&self.path, text).await?;
        tracing::info!(path = %self.path.display(), "Local config saved");
        Ok(SaveOutcome {
            status: 200,
            body: serde_json::json!({ "success": true, "message": "Local config saved" }),
        })
    }
}

// ── GCS + config service ───────────────────────────────────────────

pub struct GcsConfigStore {
    http: reqwest::Client,
    storage_base: String,
    bucket: String,
    object: String,
    service_url: Option<String>,
    tokens: Arc<dyn TokenSource>,
}

impl GcsConfigStore {
    pub fn new(
        storage_base: String,
        bucket: String,
        object: String,
        service_url: Option<String>,
        tokens: Arc<dyn TokenSource>,
    ) -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .timeout(FORWARD_TIMEOUT)
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self { http, storage_base, bucket, object, service_url, tokens })
    }
}

#[async_trait]
impl ConfigStore for GcsConfigStore {
    async fn load(&self) -> Result<Option<Value>, AppError> {
        let url = format!(
            "{}/storage/v1/b/{}/o/{}?alt=media",
            self.storage_base,
            urlencoding::encode(&self.bucket),
            urlencoding::encode(&self.object)
        );
        let token = self.tokens.access_token().await?;
        let response = self
            .http
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| AppError::Backend(format!("GCS request failed: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AppError::Backend(format!("GCS read failed: {e}")))?;
        if status == reqwest::StatusCode::NOT_FOUND {
            tracing::warn!(bucket = %self.bucket, object = %self.object, "Config file not found in GCS");
            return Ok(None);
        }
        if !status.is_success() {
            return Err(AppError::Backend(format!("GCS returned {status}: {}", body.trim())));
        }
        serde_json::from_str(&body)
            .map(Some)
            .map_err(|e| AppError::malformed(format!("Config object is not JSON: {e}"), &body))
    }

    async fn save(&self, payload: Value) -> Result<SaveOutcome, AppError> {
        let url = self
            .service_url
            .as_deref()
            .ok_or_else(|| AppError::Config("CONFIG_SERVICE_URL is not set".into()))?;

        let token = self.tokens.identity_token(url).await?;
        tracing::info!(url = %url, "Forwarding configuration update");
        let response = self
            .http
            .post(url)
            .bearer_auth(token)
            .json(&payload)
            .send()
            .await
            .map_err(|e| AppError::Backend(format!("Config service unreachable: {e}")))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| AppError::Backend(format!("Config service read failed: {e}")))?;
        let body = serde_json::from_str(&text).unwrap_or(Value::String(text));
        tracing::info!(status = status.as_u16(), "Config service responded");

        if status.is_success() {
            Ok(SaveOutcome { status: status.as_u16(), body })
        } else {
            Ok(SaveOutcome {
                status: status.as_u16(),
                body: serde_json::json!({ "error": "Configuration Update Failed", "details": body }),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::auth::StaticToken;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("jobwatch-test-{}-{}", std::process::id(), name))
            .join("aim-config.json")
    }

    #[tokio::test]
    async fn test_file_missing_is_none() {
        let store = FileConfigStore::new(temp_path("missing"));
        assert_eq!(store.load().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_file_save_then_load() {
        let path = temp_path("roundtrip");
        let store = FileConfigStore::new(path.clone());
        let payload = serde_json::json!({ "RUN_MODE": "GLOBAL", "BATCH_SIZE": 50 });

        let outcome = store.save(payload.clone()).await.unwrap();
        assert_eq!(outcome.status, 200);
        assert_eq!(outcome.body["success"], true);
        assert_eq!(store.load().await.unwrap(), Some(payload));

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[tokio::test]
    async fn test_file_empty_is_error() {
        let path = temp_path("empty");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "  \n").unwrap();

        let store = FileConfigStore::new(path.clone());
        assert!(matches!(store.load().await, Err(AppError::Config(_))));

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    fn gcs_store(server: &MockServer, service_url: Option<String>) -> GcsConfigStore {
        GcsConfigStore::new(
            server.uri(),
            "aim-home".into(),
            "aim-config-files/aim-config.json".into(),
            service_url,
            Arc::new(StaticToken("tok".into())),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_gcs_load() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/storage/v1/b/aim-home/o/aim-config-files%2Faim-config.json"))
            .and(query_param("alt", "media"))
            .and(header("authorization", "Bearer tok"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "SEASON": "Winter" })))
            .mount(&server)
            .await;

        let loaded = gcs_store(&server, None).load().await.unwrap();
        assert_eq!(loaded, Some(serde_json::json!({ "SEASON": "Winter" })));
    }

    #[tokio::test]
    async fn test_gcs_missing_object_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        assert_eq!(gcs_store(&server, None).load().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_save_without_service_url_fails() {
        let server = MockServer::start().await;
        assert!(matches!(
            gcs_store(&server, None).save(serde_json::json!({})).await,
            Err(AppError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_save_forwards_upstream_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/update"))
            .and(header("authorization", "Bearer tok"))
            .respond_with(ResponseTemplate::new(422).set_body_json(serde_json::json!({ "reason": "bad batch size" })))
            .mount(&server)
            .await;

        let store = gcs_store(&server, Some(format!("{}/update", server.uri())));
        let outcome = store.save(serde_json::json!({ "BATCH_SIZE": -1 })).await.unwrap();
        assert_eq!(outcome.status, 422);
        assert_eq!(outcome.body["error"], "Configuration Update Failed");
        assert_eq!(outcome.body["details"]["reason"], "bad batch size");
    }

    #[tokio::test]
    async fn test_save_truncated_reply_is_backend_error() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        // Promises 64 bytes, sends 8, then hangs up.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request);
                if n == 0 || text.contains("\r\n\r\n{}") {
                    break;
                }
            }
            socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 64\r\n\r\n{\"ok\":tr")
                .await
                .unwrap();
        });

        let server = MockServer::start().await;
        let store = gcs_store(&server, Some(format!("http://{addr}/update")));
        match store.save(serde_json::json!({})).await {
            Err(AppError::Backend(msg)) => assert!(msg.contains("read failed"), "{msg}"),
            other => panic!("expected backend error, got {other:?}"),
        }
    }
}
