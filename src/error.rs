use std::time::Duration;
use thiserror::Error;
use tokio::sync::AcquireError;

#[derive(Debug, Clone, Error)]
pub enum VizzlyError {
    #[error("Validation failed for {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Path escapes workspace: {0}")]
    Security(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("API request failed: {status}")]
    Network { status: String, message: String },

    #[error("API token required. Set VIZZLY_TOKEN or run `vizzly auth login`.")]
    AuthRequired,

    #[error("Authentication failed: {0}. Run `vizzly auth login` to refresh credentials.")]
    AuthFailed(String),

    #[error("{operation} timed out after {duration:?}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Browser launch failed: {0}")]
    BrowserLaunchFailed(String),

    #[error("Page error: {0}")]
    Page(String),

    #[error("Screenshot capture failed: {0}")]
    CaptureFailed(String),

    #[error("Tab pool drained")]
    PoolDrained,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Semaphore acquire error: {0}")]
    Semaphore(String),
}

impl VizzlyError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        VizzlyError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn network(status: impl Into<String>, message: impl Into<String>) -> Self {
        VizzlyError::Network {
            status: status.into(),
            message: message.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        VizzlyError::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            VizzlyError::Network { .. }
                | VizzlyError::Timeout { .. }
                | VizzlyError::Page(_)
                | VizzlyError::CaptureFailed(_)
        )
    }

    /// HTTP status this error maps to at the server boundary.
    pub fn status_code(&self) -> u16 {
        match self {
            VizzlyError::Validation { .. } => 400,
            VizzlyError::Security(_) => 400,
            VizzlyError::AuthRequired | VizzlyError::AuthFailed(_) => 401,
            VizzlyError::Timeout { .. } => 408,
            _ => 500,
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            VizzlyError::Validation { .. } => ErrorSeverity::Low,
            VizzlyError::Security(_) => ErrorSeverity::High,
            VizzlyError::AuthRequired | VizzlyError::AuthFailed(_) => ErrorSeverity::High,
            VizzlyError::Configuration(_) => ErrorSeverity::High,
            VizzlyError::BrowserLaunchFailed(_) => ErrorSeverity::High,
            _ => ErrorSeverity::Medium,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// Extracts the status code from an "API request failed: <code>" message,
/// or "unknown" when the message has a different shape.
pub fn extract_status_code(message: &str) -> String {
    message
        .rsplit_once("API request failed: ")
        .map(|(_, code)| {
            code.split_whitespace()
                .next()
                .unwrap_or("unknown")
                .to_string()
        })
        .unwrap_or_else(|| "unknown".to_string())
}

impl From<AcquireError> for VizzlyError {
    fn from(err: AcquireError) -> Self {
        VizzlyError::Semaphore(err.to_string())
    }
}

impl From<std::io::Error> for VizzlyError {
    fn from(err: std::io::Error) -> Self {
        VizzlyError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for VizzlyError {
    fn from(err: serde_json::Error) -> Self {
        VizzlyError::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for VizzlyError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return VizzlyError::timeout("API request", Duration::from_secs(30));
        }
        let status = err
            .status()
            .map(|s| s.as_u16().to_string())
            .unwrap_or_else(|| "unknown".to_string());
        VizzlyError::Network {
            status,
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code_mapping() {
        assert_eq!(VizzlyError::validation("name", "bad").status_code(), 400);
        assert_eq!(VizzlyError::Security("escape".into()).status_code(), 400);
        assert_eq!(VizzlyError::AuthRequired.status_code(), 401);
        assert_eq!(VizzlyError::Io("disk".into()).status_code(), 500);
    }

    #[test]
    fn test_retryable() {
        assert!(VizzlyError::network("503", "unavailable").is_retryable());
        assert!(VizzlyError::timeout("upload", Duration::from_secs(30)).is_retryable());
        assert!(!VizzlyError::validation("name", "bad").is_retryable());
        assert!(!VizzlyError::AuthRequired.is_retryable());
    }

    #[test]
    fn test_extract_status_code() {
        assert_eq!(extract_status_code("API request failed: 422"), "422");
        assert_eq!(
            extract_status_code("upload error: API request failed: 500 Internal"),
            "500"
        );
        assert_eq!(extract_status_code("connection reset"), "unknown");
    }

    #[test]
    fn test_auth_message_names_remediation() {
        let msg = VizzlyError::AuthRequired.to_string();
        assert!(msg.contains("VIZZLY_TOKEN"));
        assert!(msg.contains("vizzly auth login"));
    }
}
