use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::auth::TokenSource;
use super::{log_filter, short_id, ExecutionBackend, ExecutionDescriptor, JobRef, RawLogRecord};
use crate::config::ApiEndpoints;
use crate::error::AppError;

/// Executions requested per page from the Admin API.
const EXECUTIONS_PAGE_SIZE: u32 = 100;
/// Upper bound on pages followed per listing.
const MAX_EXECUTION_PAGES: usize = 10;

// ============================================================================
// Wire types (Cloud Run Admin API v2 / Cloud Logging v2)
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecutionResource {
    name: String,
    create_time: Option<String>,
    completion_time: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListExecutionsResponse {
    #[serde(default)]
    executions: Vec<ExecutionResource>,
    next_page_token: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ListEntriesBody<'a> {
    resource_names: Vec<String>,
    filter: &'a str,
    order_by: &'static str,
    page_size: usize,
}

#[derive(Debug, Deserialize)]
struct ListEntriesResponse {
    #[serde(default)]
    entries: Vec<RawLogRecord>,
}

#[derive(Debug, Deserialize)]
struct Operation {
    name: String,
}

fn parse_time(value: &str, raw: &str) -> Result<DateTime<Utc>, AppError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| AppError::malformed(format!("Invalid timestamp '{value}': {e}"), raw))
}

impl ExecutionResource {
    fn into_descriptor(self, raw: &str) -> Result<ExecutionDescriptor, AppError> {
        let create_time = match self.create_time.as_deref() {
            Some(t) => parse_time(t, raw)?,
            None => DateTime::<Utc>::UNIX_EPOCH,
        };
        let completion_time = match self.completion_time.as_deref() {
            Some(t) => Some(parse_time(t, raw)?),
            None => None,
        };
        Ok(ExecutionDescriptor {
            id: short_id(&self.name).to_string(),
            create_time,
            completion_time,
        })
    }
}

// ============================================================================
// CloudRunBackend
// ============================================================================

/// Talks to the Cloud Run Admin and Cloud Logging REST APIs directly.
pub struct CloudRunBackend {
    http: reqwest::Client,
    endpoints: ApiEndpoints,
    tokens: Arc<dyn TokenSource>,
}

impl CloudRunBackend {
    /// The underlying `reqwest::Client` is configured with a 30-second timeout.
    pub fn new(endpoints: ApiEndpoints, tokens: Arc<dyn TokenSource>) -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self { http, endpoints, tokens })
    }

    /// Build an authenticated request to `url`.
    async fn authed(
        &self,
        method: reqwest::Method,
        url: String,
    ) -> Result<reqwest::RequestBuilder, AppError> {
        let token = self.tokens.access_token().await?;
        Ok(self.http.request(method, url).bearer_auth(token))
    }

    /// Send a request and deserialize the JSON response. Unparseable bodies
    /// surface as `MalformedResponse` with the raw text attached.
    async fn send_json<T: DeserializeOwned>(
        &self,
        req: reqwest::RequestBuilder,
    ) -> Result<(T, String), AppError> {
        let response = req
            .send()
            .await
            .map_err(|e| AppError::Backend(format!("Request failed: {e}")))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AppError::Backend(format!("Failed to read response body: {e}")))?;

        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(AppError::Auth(format!("API returned {status}: {}", body.trim())));
        }
        if !status.is_success() {
            return Err(AppError::Backend(format!("API returned {status}: {}", body.trim())));
        }

        let parsed = serde_json::from_str(&body)
            .map_err(|e| AppError::malformed(format!("Unexpected API response: {e}"), &body))?;
        Ok((parsed, body))
    }
}

#[async_trait]
impl ExecutionBackend for CloudRunBackend {
    fn name(&self) -> &'static str {
        "cloud_run"
    }

    async fn list_executions(&self, job: &JobRef) -> Result<Vec<ExecutionDescriptor>, AppError> {
        let url = format!("{}/v2/{}/executions", self.endpoints.run, job.resource_name());
        let mut executions = Vec::new();
        let mut page_token: Option<String> = None;

        for _ in 0..MAX_EXECUTION_PAGES {
            let mut req = self
                .authed(reqwest::Method::GET, url.clone())
                .await?
                .query(&[("pageSize", EXECUTIONS_PAGE_SIZE.to_string())]);
            if let Some(token) = &page_token {
                req = req.query(&[("pageToken", token)]);
            }

            let (page, raw): (ListExecutionsResponse, String) = self.send_json(req).await?;
            for resource in page.executions {
                executions.push(resource.into_descriptor(&raw)?);
            }

            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }

        tracing::debug!(job = %job.name, count = executions.len(), "Listed executions");
        Ok(executions)
    }

    async fn get_logs(
        &self,
        job: &JobRef,
        execution_id: &str,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<RawLogRecord>, AppError> {
        let filter = log_filter(job, execution_id, since);
        let url = format!("{}/v2/entries:list", self.endpoints.logging);
        let req = self
            .authed(reqwest::Method::POST, url)
            .await?
            .json(&ListEntriesBody {
                resource_names: vec![format!("projects/{}", job.project)],
                filter: &filter,
                order_by: "timestamp desc",
                page_size: limit,
            });

        let (response, _): (ListEntriesResponse, String) = self.send_json(req).await?;
        Ok(response.entries)
    }

    async fn run_job(&self, job: &JobRef) -> Result<String, AppError> {
        let url = format!("{}/v2/{}:run", self.endpoints.run, job.resource_name());
        let req = self
            .authed(reqwest::Method::POST, url)
            .await?
            .json(&serde_json::json!({}));
        let (operation, _): (Operation, String) = self.send_json(req).await?;
        tracing::info!(operation = %operation.name, "Cloud Run job started");
        Ok(operation.name)
    }
}
