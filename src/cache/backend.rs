//! Boundary to the REST backend.

use std::fmt;

use async_trait::async_trait;
use serde_json::Value;

use super::keys::{Endpoint, Method, Params};

/// One HTTP call as the cache layer sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl BackendRequest {
    pub fn new(endpoint: &Endpoint, params: &Params, body: Option<Value>) -> Self {
        Self {
            method: endpoint.method(),
            path: endpoint.path().to_string(),
            query: params.query_pairs(),
            body,
        }
    }
}

impl fmt::Display for BackendRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.path)
    }
}

/// A failed fetch or mutation.
///
/// `status` is `None` when the request never produced an HTTP response
/// (connection refused, timeout). `body` is the backend's error payload,
/// passed through untouched.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{}", self.describe())]
pub struct BackendError {
    pub status: Option<u16>,
    pub message: String,
    pub body: Option<Value>,
}

impl BackendError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
            body: None,
        }
    }

    pub fn http(status: u16, message: impl Into<String>, body: Option<Value>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
            body,
        }
    }

    /// Network failures and 5xx responses.
    pub fn is_transient(&self) -> bool {
        self.status.is_none_or(|status| status >= 500)
    }

    /// 4xx responses, usually validation failures on a mutation.
    pub fn is_client_error(&self) -> bool {
        self.status.is_some_and(|status| (400..500).contains(&status))
    }

    fn describe(&self) -> String {
        match self.status {
            Some(status) => format!("status {status}: {}", self.message),
            None => format!("transport: {}", self.message),
        }
    }
}

/// Executes requests against the portal backend.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    async fn execute(&self, request: BackendRequest) -> Result<Value, BackendError>;
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn request_carries_endpoint_and_query() {
        let endpoint = Endpoint::parse("GET /leaves").expect("endpoint");
        let params = Params::new(json!({ "page": 1 })).expect("params");

        let request = BackendRequest::new(&endpoint, &params, None);

        assert_eq!(request.method, Method::Get);
        assert_eq!(request.path, "/leaves");
        assert_eq!(request.query, vec![("page".to_string(), "1".to_string())]);
        assert_eq!(request.to_string(), "GET /leaves");
    }

    #[test]
    fn error_classification() {
        assert!(BackendError::transport("connection refused").is_transient());
        assert!(BackendError::http(503, "unavailable", None).is_transient());
        assert!(!BackendError::http(422, "invalid", None).is_transient());
        assert!(BackendError::http(422, "invalid", None).is_client_error());
        assert!(!BackendError::transport("timeout").is_client_error());
    }

    #[test]
    fn error_display_includes_status() {
        let err = BackendError::http(404, "leave not found", Some(json!({ "message": "leave not found" })));
        assert_eq!(err.to_string(), "status 404: leave not found");
        assert_eq!(
            BackendError::transport("timed out").to_string(),
            "transport: timed out"
        );
    }
}
