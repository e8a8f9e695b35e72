use axum::{
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::proxy::ProxyError;
use crate::registry::RegistryError;

/// RFC 7807 problem document. Every error response carries a stable `code`,
/// the request id, and an explicit retry hint so callers never have to guess
/// from the status alone.
#[derive(Debug, Serialize)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub r#type: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    pub code: String,
    pub request_id: String,
    pub retryable: bool,
    pub retry_after_seconds: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Vec<FieldError>>,
    /// Catalog of currently routable services, attached when a requested
    /// service is unknown or exhausted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub available_services: Option<Vec<String>>,
    /// Healthy candidates left after a failed forward.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub healthy_remaining: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl ProblemDetails {
    fn new(status: StatusCode, code: impl Into<String>, detail: impl Into<String>) -> Self {
        let code = code.into();
        let title = status
            .canonical_reason()
            .unwrap_or("Unknown Error")
            .to_string();
        Self {
            r#type: format!("https://switchboard.dev/problems/{code}"),
            title,
            status: status.as_u16(),
            detail: detail.into(),
            instance: None,
            code,
            request_id: "unknown".to_string(),
            retryable: false,
            retry_after_seconds: 0,
            details: None,
            available_services: None,
            healthy_remaining: None,
            worker_id: None,
            service: None,
        }
    }

    fn set_request_id(&mut self, request_id: impl Into<String>) {
        let request_id = request_id.into();
        self.request_id = request_id.clone();
        if self.instance.is_none() {
            self.instance = Some(request_id);
        }
    }

    fn set_retryable(&mut self, retryable: bool) {
        self.retryable = retryable;
    }

    fn set_retry_after_seconds(&mut self, seconds: u32) {
        self.retry_after_seconds = seconds;
        if seconds > 0 {
            self.retryable = true;
        }
    }

    fn set_details(&mut self, details: Vec<FieldError>) {
        self.details = Some(details);
    }
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub problem: Box<ProblemDetails>,
}

impl ApiError {
    pub fn bad_request(code: impl Into<String>, message: impl Into<String>) -> Self {
        let status = StatusCode::BAD_REQUEST;
        let problem = Box::new(ProblemDetails::new(status, code, message));
        Self { status, problem }
    }

    pub fn not_found(code: impl Into<String>, message: impl Into<String>) -> Self {
        let status = StatusCode::NOT_FOUND;
        let problem = Box::new(ProblemDetails::new(status, code, message));
        Self { status, problem }
    }

    pub fn internal(code: impl Into<String>, message: impl Into<String>) -> Self {
        let status = StatusCode::INTERNAL_SERVER_ERROR;
        let problem = Box::new(ProblemDetails::new(status, code, message));
        Self { status, problem }
    }

    pub fn service_unavailable(code: impl Into<String>, message: impl Into<String>) -> Self {
        let status = StatusCode::SERVICE_UNAVAILABLE;
        let problem = Box::new(ProblemDetails::new(status, code, message));
        Self { status, problem }
    }

    pub fn bad_gateway(code: impl Into<String>, message: impl Into<String>) -> Self {
        let status = StatusCode::BAD_GATEWAY;
        let problem = Box::new(ProblemDetails::new(status, code, message));
        Self { status, problem }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.problem.set_request_id(request_id);
        self
    }

    pub fn with_details(mut self, details: Vec<FieldError>) -> Self {
        self.problem.set_details(details);
        self
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.problem.set_retryable(retryable);
        self
    }

    pub fn with_retry_after_seconds(mut self, seconds: u32) -> Self {
        self.problem.set_retry_after_seconds(seconds);
        self
    }

    pub fn with_available_services(mut self, services: Vec<String>) -> Self {
        self.problem.available_services = Some(services);
        self
    }

    /// Map a registry failure onto the wire taxonomy.
    pub fn from_registry(err: RegistryError, request_id: &str) -> Self {
        let api_error = match err {
            RegistryError::NotFound(worker_id) => {
                let mut e = Self::not_found("worker_not_found", format!("Worker {worker_id} is not registered"));
                e.problem.worker_id = Some(worker_id.to_string());
                e
            }
            RegistryError::InvalidRegistration { violations } => Self::bad_request(
                "invalid_registration",
                "Registration payload failed validation",
            )
            .with_details(
                violations
                    .into_iter()
                    .map(|v| FieldError {
                        field: v.field,
                        message: v.message,
                    })
                    .collect(),
            ),
            RegistryError::Store(e) => {
                Self::internal("store_error", format!("Store operation failed: {e}"))
            }
        };
        api_error.with_request_id(request_id)
    }

    /// Map a proxy failure onto the wire taxonomy.
    pub fn from_proxy(err: ProxyError, request_id: &str) -> Self {
        let api_error = match err {
            ProxyError::ServiceUnavailable { service, available } => {
                let mut e = Self::service_unavailable(
                    "service_unavailable",
                    format!("No healthy workers provide service '{service}'"),
                );
                e.problem.service = Some(service);
                e.with_available_services(available)
            }
            ProxyError::Retryable {
                service,
                healthy_remaining,
            } => {
                let mut e = Self::bad_gateway(
                    "worker_unreachable",
                    format!("A worker for '{service}' failed; other healthy workers remain"),
                )
                .with_retry_after_seconds(1);
                e.problem.service = Some(service);
                e.problem.healthy_remaining = Some(healthy_remaining);
                e
            }
            ProxyError::Transport {
                service,
                worker,
                source,
            } => {
                let mut e = Self::bad_gateway(
                    "proxy_transport_failure",
                    format!("Forwarding to worker {worker} failed: {source}"),
                );
                e.problem.service = Some(service);
                e.problem.worker_id = Some(worker.to_string());
                e.problem.healthy_remaining = Some(0);
                e
            }
        };
        api_error.with_request_id(request_id)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(self.problem)).into_response();
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::FieldViolation;

    #[test]
    fn test_invalid_registration_carries_field_details() {
        let err = ApiError::from_registry(
            RegistryError::InvalidRegistration {
                violations: vec![FieldViolation {
                    field: "endpoint".to_string(),
                    message: "must not be empty".to_string(),
                }],
            },
            "req_test",
        );
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.problem.code, "invalid_registration");
        assert_eq!(err.problem.request_id, "req_test");
        let details = err.problem.details.as_ref().unwrap();
        assert_eq!(details[0].field, "endpoint");
    }

    #[test]
    fn test_service_unavailable_carries_catalog() {
        let err = ApiError::from_proxy(
            ProxyError::ServiceUnavailable {
                service: "transcode".to_string(),
                available: vec!["ocr".to_string(), "embeddings".to_string()],
            },
            "req_test",
        );
        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(!err.problem.retryable);
        assert_eq!(
            err.problem.available_services.as_ref().unwrap(),
            &["ocr", "embeddings"]
        );
    }

    #[test]
    fn test_retryable_failure_is_marked_retryable() {
        let err = ApiError::from_proxy(
            ProxyError::Retryable {
                service: "ocr".to_string(),
                healthy_remaining: 2,
            },
            "req_test",
        );
        assert_eq!(err.status, StatusCode::BAD_GATEWAY);
        assert!(err.problem.retryable);
        assert_eq!(err.problem.healthy_remaining, Some(2));
    }
}
