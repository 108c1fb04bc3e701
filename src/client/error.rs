//! Errors returned by Alibaba Cloud APIs.

use serde_json::Value;
use thiserror::Error;

/// Code attached to errors raised before a response was received.
pub const SERVER_UNREACHABLE: &str = "ServerUnreachable";

/// Code attached to requests that timed out while awaiting the response.
pub const CLIENT_TIMEOUT: &str = "Client.Timeout exceeded while awaiting headers";

/// An error reported by (or while talking to) an Alibaba Cloud API.
///
/// `http_status` is `0` when no response was received at all.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("[{code}] {message} (RequestId: {request_id}, HTTP {http_status})")]
pub struct ApiError {
    /// The vendor error code, e.g. `InvalidInstanceId.NotFound`.
    pub code: String,
    /// Human-readable message from the response.
    pub message: String,
    /// Request id echoed by the API, empty if unknown.
    pub request_id: String,
    /// HTTP status of the response.
    pub http_status: u16,
}

impl ApiError {
    /// Create an error with the given code and message.
    pub fn new(code: impl Into<String>, message: impl Into<String>, http_status: u16) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            request_id: String::new(),
            http_status,
        }
    }

    /// Error for a request that never produced a response.
    pub fn unreachable(message: impl Into<String>) -> Self {
        Self::new(SERVER_UNREACHABLE, message, 0)
    }

    /// Error for a request that timed out.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(CLIENT_TIMEOUT, message, 0)
    }

    /// Decode an error from a response body.
    ///
    /// RPC products answer with `Code`/`Message`/`RequestId`; ROA products
    /// (Function Compute, Log Service) use `ErrorCode`/`ErrorMessage` or the
    /// lower-camel variants.
    pub fn from_body(http_status: u16, body: &[u8]) -> Self {
        let parsed: Value = serde_json::from_slice(body).unwrap_or(Value::Null);
        let field = |names: &[&str]| -> String {
            names
                .iter()
                .find_map(|name| parsed.get(*name).and_then(Value::as_str))
                .unwrap_or_default()
                .to_string()
        };

        let mut code = field(&["Code", "ErrorCode", "errorCode", "code"]);
        let mut message = field(&["Message", "ErrorMessage", "errorMessage", "message"]);
        if code.is_empty() {
            code = format!("HTTP{}", http_status);
        }
        if message.is_empty() {
            message = String::from_utf8_lossy(body).into_owned();
        }

        Self {
            code,
            message,
            request_id: field(&["RequestId", "requestId", "x-acs-request-id"]),
            http_status,
        }
    }

    /// Attach the request id taken from response headers when the body lacks one.
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        if self.request_id.is_empty() {
            self.request_id = request_id.into();
        }
        self
    }

    /// Whether the error code equals one of `codes`, or the message contains it.
    pub fn is_expected(&self, codes: &[&str]) -> bool {
        codes
            .iter()
            .any(|code| self.code == *code || self.message.contains(code))
    }

    /// Error raised locally before the request was sent.
    pub fn client(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(code, message, 0)
    }

    /// Whether the request failed in transit.
    pub fn is_transport(&self) -> bool {
        self.http_status == 0 && (self.code == SERVER_UNREACHABLE || self.code == CLIENT_TIMEOUT)
    }

    /// Whether the error is a throttling response.
    pub fn is_throttling(&self) -> bool {
        self.code.starts_with("Throttling") || self.code == "Rejected.Throttling"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_rpc_body() {
        let body = br#"{"Code":"InvalidInstanceId.NotFound","Message":"The specified instance does not exist.","RequestId":"req-1"}"#;
        let err = ApiError::from_body(404, body);
        assert_eq!(err.code, "InvalidInstanceId.NotFound");
        assert_eq!(err.request_id, "req-1");
        assert_eq!(err.http_status, 404);
        assert!(err.is_expected(&["InvalidInstanceId.NotFound"]));
    }

    #[test]
    fn test_from_roa_body() {
        let body = br#"{"ErrorCode":"ServiceNotFound","ErrorMessage":"service 'svc' does not exist"}"#;
        let err = ApiError::from_body(404, body);
        assert_eq!(err.code, "ServiceNotFound");
        assert!(err.message.contains("svc"));

        let body = br#"{"errorCode":"SavedSearchNotExist","errorMessage":"saved search not exist"}"#;
        let err = ApiError::from_body(404, body).with_request_id("hdr-req");
        assert_eq!(err.code, "SavedSearchNotExist");
        assert_eq!(err.request_id, "hdr-req");
    }

    #[test]
    fn test_from_garbage_body() {
        let err = ApiError::from_body(502, b"Bad Gateway");
        assert_eq!(err.code, "HTTP502");
        assert_eq!(err.message, "Bad Gateway");
    }

    #[test]
    fn test_classification() {
        assert!(ApiError::new("Throttling.User", "slow down", 400).is_throttling());
        assert!(ApiError::new("Rejected.Throttling", "slow down", 400).is_throttling());
        assert!(!ApiError::new("InvalidParameter", "bad", 400).is_throttling());
        assert!(ApiError::unreachable("connection refused").is_transport());
        assert!(ApiError::timeout("deadline").is_expected(&[CLIENT_TIMEOUT]));
        assert!(!ApiError::client("SDK.InvalidRequest", "bad body").is_transport());
    }

    #[test]
    fn test_display() {
        let err = ApiError::new("Forbidden", "denied", 403);
        assert_eq!(
            err.to_string(),
            "[Forbidden] denied (RequestId: , HTTP 403)"
        );
    }
}
