//! Error types for the Alibaba Cloud provider.

use thiserror::Error;

use crate::client::ApiError;

/// Errors that can occur when implementing a provider.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The requested resource was not found.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// A validation error occurred.
    #[error("Validation error: {0}")]
    Validation(String),

    /// An internal provider error occurred.
    #[error("SDK error: {0}")]
    Sdk(String),

    /// An Alibaba Cloud API call failed.
    #[error("API error: {0}")]
    Api(#[from] ApiError),

    /// A configuration error occurred.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The requested resource type is unknown.
    #[error("Unknown resource type: {0}")]
    UnknownResource(String),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Resource already exists (create conflict).
    #[error("Resource already exists: {0}")]
    AlreadyExists(String),

    /// Permission denied (authentication/authorization failure).
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Quota or rate limit exceeded.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Service temporarily unavailable.
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    /// Operation timed out.
    #[error("Deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// Operation failed due to current state (precondition not met).
    #[error("Failed precondition: {0}")]
    FailedPrecondition(String),

    /// Operation not implemented.
    #[error("Unimplemented: {0}")]
    Unimplemented(String),

    /// Invalid request from client.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The object exists but a later step of the operation failed.
    ///
    /// `state` describes what was created so the host can keep tracking it.
    #[error("{source}")]
    Incomplete {
        /// State of the object as far as it got.
        state: Box<serde_json::Value>,
        /// The failure.
        source: Box<ProviderError>,
    },
}

impl ProviderError {
    /// The message without the variant prefix.
    pub fn message(&self) -> &str {
        match self {
            Self::NotFound(msg) => msg,
            Self::Validation(msg) => msg,
            Self::Sdk(msg) => msg,
            Self::Api(err) => &err.message,
            Self::Configuration(msg) => msg,
            Self::UnknownResource(msg) => msg,
            Self::Serialization(_err) => "serialization error (see Debug output)",
            Self::AlreadyExists(msg) => msg,
            Self::PermissionDenied(msg) => msg,
            Self::ResourceExhausted(msg) => msg,
            Self::Unavailable(msg) => msg,
            Self::DeadlineExceeded(msg) => msg,
            Self::FailedPrecondition(msg) => msg,
            Self::Unimplemented(msg) => msg,
            Self::InvalidRequest(msg) => msg,
            Self::Incomplete { source, .. } => source.message(),
        }
    }

    /// Attach the state of an object that exists despite this failure.
    pub fn with_state(self, state: serde_json::Value) -> Self {
        let source = match self {
            Self::Incomplete { source, .. } => source,
            other => Box::new(other),
        };
        Self::Incomplete {
            state: Box::new(state),
            source,
        }
    }

    /// The state attached with [`ProviderError::with_state`].
    pub fn partial_state(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Incomplete { state, .. } => Some(state.as_ref()),
            _ => None,
        }
    }

    /// The underlying failure, looking through [`ProviderError::Incomplete`].
    pub fn root(&self) -> &ProviderError {
        match self {
            Self::Incomplete { source, .. } => source.root(),
            other => other,
        }
    }

    /// The vendor error code, if this is an API error.
    pub fn api_code(&self) -> Option<&str> {
        match self.root() {
            Self::Api(err) => Some(&err.code),
            _ => None,
        }
    }

    /// Whether this is a `NotFound` error.
    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), Self::NotFound(_))
    }

    /// Whether this is an API error with one of `codes`.
    pub fn is_expected(&self, codes: &[&str]) -> bool {
        matches!(self.root(), Self::Api(err) if err.is_expected(codes))
    }
}

impl From<ProviderError> for tonic::Status {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::NotFound(msg) => tonic::Status::not_found(msg),
            ProviderError::Validation(msg) => tonic::Status::invalid_argument(msg),
            ProviderError::Configuration(msg) => tonic::Status::failed_precondition(msg),
            ProviderError::UnknownResource(msg) => tonic::Status::not_found(msg),
            ProviderError::Sdk(msg) => tonic::Status::internal(msg),
            ProviderError::Serialization(err) => {
                tonic::Status::invalid_argument(format!("Serialization error: {}", err))
            },
            ProviderError::Api(err) => match err.http_status {
                0 => tonic::Status::unavailable(err.to_string()),
                400 => tonic::Status::invalid_argument(err.to_string()),
                401 | 403 => tonic::Status::permission_denied(err.to_string()),
                404 => tonic::Status::not_found(err.to_string()),
                409 => tonic::Status::already_exists(err.to_string()),
                429 => tonic::Status::resource_exhausted(err.to_string()),
                500..=599 => tonic::Status::unavailable(err.to_string()),
                _ => tonic::Status::unknown(err.to_string()),
            },
            ProviderError::AlreadyExists(msg) => tonic::Status::already_exists(msg),
            ProviderError::PermissionDenied(msg) => tonic::Status::permission_denied(msg),
            ProviderError::ResourceExhausted(msg) => tonic::Status::resource_exhausted(msg),
            ProviderError::Unavailable(msg) => tonic::Status::unavailable(msg),
            ProviderError::DeadlineExceeded(msg) => tonic::Status::deadline_exceeded(msg),
            ProviderError::FailedPrecondition(msg) => tonic::Status::failed_precondition(msg),
            ProviderError::Unimplemented(msg) => tonic::Status::unimplemented(msg),
            ProviderError::InvalidRequest(msg) => tonic::Status::invalid_argument(msg),
            ProviderError::Incomplete { source, .. } => (*source).into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code(err: ProviderError) -> tonic::Code {
        tonic::Status::from(err).code()
    }

    #[test]
    fn test_display_and_message() {
        let err = ProviderError::NotFound("i-bp1abc".to_string());
        assert_eq!(err.to_string(), "Resource not found: i-bp1abc");
        assert_eq!(err.message(), "i-bp1abc");
        assert!(err.is_not_found());

        let err = ProviderError::UnknownResource("alicloud_oss_bucket".to_string());
        assert_eq!(err.to_string(), "Unknown resource type: alicloud_oss_bucket");
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(code(ProviderError::Validation("x".into())), tonic::Code::InvalidArgument);
        assert_eq!(code(ProviderError::InvalidRequest("x".into())), tonic::Code::InvalidArgument);
        assert_eq!(code(ProviderError::Configuration("x".into())), tonic::Code::FailedPrecondition);
        assert_eq!(code(ProviderError::Sdk("x".into())), tonic::Code::Internal);
        assert_eq!(code(ProviderError::DeadlineExceeded("x".into())), tonic::Code::DeadlineExceeded);
        assert_eq!(code(ProviderError::Unimplemented("x".into())), tonic::Code::Unimplemented);
        assert_eq!(code(ProviderError::AlreadyExists("x".into())), tonic::Code::AlreadyExists);
    }

    #[test]
    fn test_api_error_conversion() {
        let err: ProviderError = ApiError::new("InvalidInstanceId.NotFound", "no such instance", 404).into();
        assert_eq!(err.api_code(), Some("InvalidInstanceId.NotFound"));
        assert_eq!(err.message(), "no such instance");
        assert!(err.is_expected(&["InvalidInstanceId.NotFound", "Forbidden.InstanceNotFound"]));
        assert!(!err.is_expected(&["IncorrectInstanceStatus"]));
        assert!(err.to_string().starts_with("API error: [InvalidInstanceId.NotFound]"));
        assert_eq!(code(err), tonic::Code::NotFound);

        assert_eq!(
            code(ApiError::new("Throttling.User", "slow down", 429).into()),
            tonic::Code::ResourceExhausted
        );
        assert_eq!(
            code(ApiError::new("Forbidden.RAM", "not authorized", 403).into()),
            tonic::Code::PermissionDenied
        );
        assert_eq!(code(ApiError::unreachable("connection refused").into()), tonic::Code::Unavailable);
        assert_eq!(ProviderError::NotFound("x".to_string()).api_code(), None);
    }

    #[test]
    fn test_incomplete_keeps_state_and_cause() {
        let err = ProviderError::from(ApiError::new("IncorrectInstanceStatus", "still stopping", 403))
            .with_state(serde_json::json!({"id": "i-1"}));
        assert_eq!(err.partial_state().unwrap()["id"], "i-1");
        assert_eq!(err.api_code(), Some("IncorrectInstanceStatus"));
        assert_eq!(err.message(), "still stopping");
        assert!(err.to_string().starts_with("API error: [IncorrectInstanceStatus]"));

        let err = err.with_state(serde_json::json!({"id": "i-1", "status": "Stopped"}));
        assert!(matches!(err.root(), ProviderError::Api(_)));
        assert_eq!(err.partial_state().unwrap()["status"], "Stopped");
        assert_eq!(code(err), tonic::Code::PermissionDenied);
        assert!(ProviderError::Sdk("x".into()).partial_state().is_none());

        let gone = ProviderError::NotFound("i-1".into()).with_state(serde_json::json!({}));
        assert!(gone.is_not_found());
    }
}
