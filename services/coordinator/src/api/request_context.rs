//! Request-scoped context extracted from HTTP requests.

use std::convert::Infallible;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use swb_id::RequestId;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Per-request context. The request id is taken from the `x-request-id`
/// header when the caller supplies one, otherwise minted fresh so every
/// problem document can reference it.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

impl<S> FromRequestParts<S> for RequestContext
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let request_id = header_string(&parts.headers, REQUEST_ID_HEADER)
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| RequestId::new().to_string());

        Ok(Self { request_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    async fn context_for(request: Request<()>) -> RequestContext {
        let (mut parts, _) = request.into_parts();
        RequestContext::from_request_parts(&mut parts, &())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_uses_caller_request_id_when_present() {
        let request = Request::builder()
            .header(REQUEST_ID_HEADER, "req_caller")
            .body(())
            .unwrap();
        let ctx = context_for(request).await;
        assert_eq!(ctx.request_id, "req_caller");
    }

    #[tokio::test]
    async fn test_mints_request_id_when_absent() {
        let request = Request::builder().body(()).unwrap();
        let ctx = context_for(request).await;
        assert!(ctx.request_id.starts_with("req_"));
    }
}
