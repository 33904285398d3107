//! Process configuration, read once from the environment at startup.
//!
//! `.env` files are honoured via `dotenvy`. Defaults match the production
//! deployment of the monitored job.

use std::path::PathBuf;

use crate::backend::JobRef;
use crate::error::AppError;

const DEFAULT_PROJECT_ID: &str = "bqsqltesting";
const DEFAULT_REGION: &str = "europe-west2";
const DEFAULT_JOB_NAME: &str = "aim-growth-job";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_CONFIG_GCS_URI: &str = "gs://aim-home/aim-config-files/aim-config.json";
const DEFAULT_CONFIG_SERVICE_URL: &str = "https://update-aim-config-829092209663.europe-west1.run.app";

pub const DEFAULT_LOG_PAGE_SIZE: usize = 50;
pub const MAX_LOG_PAGE_SIZE: usize = 200;

/// Where the job's JSON configuration blob lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    File(PathBuf),
    Gcs { bucket: String, object: String },
}

impl ConfigSource {
    /// Parse a `gs://bucket/path/to/object` URI.
    pub fn parse_gcs_uri(uri: &str) -> Result<Self, AppError> {
        let rest = uri
            .strip_prefix("gs://")
            .ok_or_else(|| AppError::Config("Invalid GCS URI format. Must start with gs://".into()))?;
        let (bucket, object) = rest
            .split_once('/')
            .filter(|(b, o)| !b.is_empty() && !o.is_empty())
            .ok_or_else(|| AppError::Config(format!("GCS URI has no object path: {uri}")))?;
        Ok(ConfigSource::Gcs {
            bucket: bucket.to_string(),
            object: object.to_string(),
        })
    }
}

/// Endpoints for the managed Google APIs. Overridable so tests can point
/// them at a local mock server.
#[derive(Debug, Clone)]
pub struct ApiEndpoints {
    pub run: String,
    pub logging: String,
    pub storage: String,
    pub metadata: String,
}

impl Default for ApiEndpoints {
    fn default() -> Self {
        Self {
            run: "https://run.googleapis.com".into(),
            logging: "https://logging.googleapis.com".into(),
            storage: "https://storage.googleapis.com".into(),
            metadata: "http://metadata.google.internal".into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub job: JobRef,
    pub port: u16,
    /// `USE_GCLOUD_CLI`: `Some(true)` forces the CLI backend, `Some(false)`
    /// forces the managed API, `None` picks by platform.
    pub use_gcloud_cli: Option<bool>,
    pub gcloud_path: Option<String>,
    /// Static bearer token. When unset, tokens come from the metadata server.
    pub access_token: Option<String>,
    pub endpoints: ApiEndpoints,
    pub log_page_size: usize,
    pub config_source: ConfigSource,
    /// Service that accepts configuration updates on `save-config`.
    /// Defaults to the production updater when the config lives in GCS.
    pub config_service_url: Option<String>,
}

impl MonitorConfig {
    /// Load `.env` (if any) and read the process environment.
    pub fn from_env() -> Result<Self, AppError> {
        if let Ok(path) = dotenvy::dotenv() {
            tracing::debug!(path = %path.display(), "Loaded .env file");
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the config from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let job = JobRef {
            project: get("PROJECT_ID").unwrap_or_else(|| DEFAULT_PROJECT_ID.into()),
            region: get("REGION").unwrap_or_else(|| DEFAULT_REGION.into()),
            name: get("JOB_NAME").unwrap_or_else(|| DEFAULT_JOB_NAME.into()),
        };

        let port = match get("PORT") {
            Some(p) => p
                .parse()
                .map_err(|_| AppError::Config(format!("PORT is not a valid port: {p}")))?,
            None => DEFAULT_PORT,
        };

        let use_gcloud_cli = match get("USE_GCLOUD_CLI").as_deref() {
            Some("true") => Some(true),
            Some("false") => Some(false),
            Some(other) => {
                tracing::warn!(value = other, "Ignoring unrecognised USE_GCLOUD_CLI value");
                None
            }
            None => None,
        };

        let log_page_size = match get("LOG_PAGE_SIZE") {
            Some(v) => v
                .parse::<usize>()
                .map_err(|_| AppError::Config(format!("LOG_PAGE_SIZE is not a number: {v}")))?
                .clamp(1, MAX_LOG_PAGE_SIZE),
            None => DEFAULT_LOG_PAGE_SIZE,
        };

        let mut endpoints = ApiEndpoints::default();
        if let Some(v) = get("RUN_API_URL") {
            endpoints.run = v;
        }
        if let Some(v) = get("LOGGING_API_URL") {
            endpoints.logging = v;
        }
        if let Some(v) = get("STORAGE_API_URL") {
            endpoints.storage = v;
        }
        if let Some(v) = get("METADATA_URL") {
            endpoints.metadata = v;
        }

        let local_mode = get("AIM_MODE").is_some_and(|m| m.eq_ignore_ascii_case("local"));
        let config_source = if let Some(path) = get("CONFIG_PATH") {
            ConfigSource::File(PathBuf::from(path))
        } else if local_mode {
            let root = get("AIM_LOCAL_ROOT").unwrap_or_else(|| "./demo".into());
            ConfigSource::File(PathBuf::from(root).join("config").join("aim-config.json"))
        } else {
            let uri = get("CONFIG_GCS_URI").unwrap_or_else(|| DEFAULT_CONFIG_GCS_URI.into());
            ConfigSource::parse_gcs_uri(&uri)?
        };
        let config_service_url = get("CONFIG_SERVICE_URL").or_else(|| {
            matches!(config_source, ConfigSource::Gcs { .. }).then(|| DEFAULT_CONFIG_SERVICE_URL.into())
        });

        Ok(Self {
            job,
            port,
            use_gcloud_cli,
            gcloud_path: get("GCLOUD_PATH"),
            access_token: get("ACCESS_TOKEN"),
            endpoints,
            log_page_size,
            config_source,
            config_service_url,
        })
    }
}
