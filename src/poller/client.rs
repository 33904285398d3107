use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::engine::{JobStatus, TriggerOutcome};
use crate::error::AppError;

fn backend_err(e: impl std::fmt::Display) -> AppError {
    AppError::Backend(e.to_string())
}

/// What the poller needs from the monitoring API.
#[async_trait]
pub trait StatusClient: Send + Sync {
    async fn job_status(&self, since: Option<DateTime<Utc>>) -> Result<JobStatus, AppError>;

    async fn trigger(&self) -> Result<TriggerOutcome, AppError>;
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConflictBody {
    #[serde(default)]
    execution_id: String,
    start_time: Option<String>,
}

#[derive(Deserialize)]
struct FailureBody {
    error: String,
    details: Option<String>,
}

/// HTTP client for the `/api/job-status` and `/api/trigger-job` routes.
pub struct HttpStatusClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpStatusClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Send, then map non-2xx bodies back into structured errors.
    async fn send_json<T: DeserializeOwned>(&self, req: reqwest::RequestBuilder) -> Result<T, AppError> {
        let response = req.send().await.map_err(backend_err)?;
        let status = response.status();
        let body = response.text().await.map_err(backend_err)?;

        if status == reqwest::StatusCode::CONFLICT {
            let conflict: ConflictBody = serde_json::from_str(&body)
                .map_err(|e| AppError::malformed(format!("Unreadable conflict body: {e}"), &body))?;
            return Err(AppError::Conflict {
                execution_id: conflict.execution_id,
                start_time: conflict.start_time,
            });
        }
        if !status.is_success() {
            return Err(match serde_json::from_str::<FailureBody>(&body) {
                Ok(FailureBody { error, details: Some(details) }) => {
                    AppError::Backend(format!("{error}: {details}"))
                }
                Ok(FailureBody { error, details: None }) => AppError::Backend(error),
                Err(_) => AppError::Backend(format!("Server returned {status}")),
            });
        }

        serde_json::from_str(&body).map_err(|e| AppError::malformed(e, &body))
    }
}

#[async_trait]
impl StatusClient for HttpStatusClient {
    /// `GET /api/job-status?since=...`
    async fn job_status(&self, since: Option<DateTime<Utc>>) -> Result<JobStatus, AppError> {
        let mut req = self.http.get(format!("{}/api/job-status", self.base_url));
        if let Some(since) = since {
            req = req.query(&[("since", since.to_rfc3339_opts(SecondsFormat::AutoSi, true))]);
        }
        self.send_json(req).await
    }

    /// `POST /api/trigger-job`
    async fn trigger(&self) -> Result<TriggerOutcome, AppError> {
        self.send_json(self.http.post(format!("{}/api/trigger-job", self.base_url)))
            .await
    }
}
