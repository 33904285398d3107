use serde::Serialize;

/// App-wide error type. Every fallible function returns `Result<T, AppError>`.
/// Serializes as `{ error, kind }` so API clients get structured error messages.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// Network failure or non-success status reaching the execution or log backend.
    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    /// Raised only by the trigger guard when an execution is already running.
    #[error("Job is already running")]
    Conflict {
        execution_id: String,
        start_time: Option<String>,
    },

    /// The backend answered with data we could not parse. `raw` keeps the
    /// (possibly truncated) response body for diagnostics.
    #[error("Malformed response: {message}")]
    MalformedResponse { message: String, raw: String },

    #[error("Process spawn error: {0}")]
    ProcessSpawn(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("{0}")]
    Internal(String),
}

impl AppError {
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Backend(_) => "backend",
            AppError::Auth(_) => "auth",
            AppError::Conflict { .. } => "conflict",
            AppError::MalformedResponse { .. } => "malformed_response",
            AppError::ProcessSpawn(_) => "process_spawn",
            AppError::Config(_) => "config",
            AppError::Io(_) => "io",
            AppError::Serde(_) => "serde",
            AppError::Internal(_) => "internal",
        }
    }

    /// Build a `MalformedResponse`, keeping at most the first 500 chars of the body.
    pub fn malformed(message: impl std::fmt::Display, raw: &str) -> Self {
        AppError::MalformedResponse {
            message: message.to_string(),
            raw: raw.chars().take(500).collect(),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, AppError::Conflict { .. })
    }

    /// Raw backend body kept by `MalformedResponse`.
    pub fn raw_response(&self) -> Option<&str> {
        match self {
            AppError::MalformedResponse { raw, .. } => Some(raw),
            _ => None,
        }
    }

    /// Message for API `details` fields. Includes the raw body of a
    /// malformed backend response.
    pub fn details(&self) -> String {
        match self.raw_response() {
            Some(raw) => format!("{self} (raw response: {raw})"),
            None => self.to_string(),
        }
    }
}

impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut s = serializer.serialize_struct("AppError", 2)?;
        s.serialize_field("error", &self.to_string())?;
        s.serialize_field("kind", self.kind())?;
        s.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_keeps_structure() {
        let err = AppError::Conflict {
            execution_id: "exec-9".into(),
            start_time: Some("T0".into()),
        };
        assert!(err.is_conflict());
        assert_eq!(err.kind(), "conflict");
        assert_eq!(err.to_string(), "Job is already running");
    }

    #[test]
    fn test_malformed_truncates_raw_body() {
        let body = "x".repeat(2000);
        match AppError::malformed("bad json", &body) {
            AppError::MalformedResponse { raw, message } => {
                assert_eq!(raw.len(), 500);
                assert_eq!(message, "bad json");
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn test_details_carry_raw_body() {
        let err = AppError::malformed("expected value", "<html>proxy error 502</html>");
        assert_eq!(err.raw_response(), Some("<html>proxy error 502</html>"));
        assert_eq!(
            err.details(),
            "Malformed response: expected value (raw response: <html>proxy error 502</html>)"
        );
        assert_eq!(AppError::Backend("x".into()).details(), "Backend error: x");
    }

    #[test]
    fn test_serializes_error_and_kind() {
        let json = serde_json::to_value(AppError::Backend("timeout".into())).unwrap();
        assert_eq!(json["error"], "Backend error: timeout");
        assert_eq!(json["kind"], "backend");
    }
}
