//! Request router/proxy.
//!
//! Resolves a service name to a healthy worker, forwards the request with a
//! bounded timeout, and maps transport failures into the caller-facing
//! taxonomy. The coordinator never retries on the caller's behalf: a
//! `Retryable` error tells the caller a retry is safe because other healthy
//! candidates remain, a `Transport` error says there was no alternative.

use std::time::Duration;

use axum::http::{HeaderMap, HeaderName, Method, StatusCode};
use bytes::Bytes;
use rand::Rng;
use swb_id::WorkerId;
use thiserror::Error;
use tracing::{debug, warn};

use crate::registry::Registry;

/// Default bound on a proxied call, connection through body.
pub const DEFAULT_PROXY_TIMEOUT: Duration = Duration::from_secs(30);

/// Headers that must not be forwarded in either direction.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

/// An inbound request to forward to a service worker.
#[derive(Debug)]
pub struct ProxyRequest {
    pub service: String,
    pub path: String,
    pub query: Option<String>,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// The upstream response, passed through verbatim.
#[derive(Debug)]
pub struct ProxyResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Debug, Error)]
pub enum ProxyError {
    /// Unknown service name or zero healthy providers. Carries the current
    /// catalog so callers can discover alternatives instead of guessing.
    #[error("service '{service}' has no healthy providers")]
    ServiceUnavailable {
        service: String,
        available: Vec<String>,
    },

    /// Transport failure with other healthy candidates remaining; the caller
    /// may safely retry.
    #[error("worker for '{service}' failed, {healthy_remaining} healthy candidates remain")]
    Retryable {
        service: String,
        healthy_remaining: usize,
    },

    /// Transport failure with no alternative candidate.
    #[error("proxy to worker {worker} for '{service}' failed: {source}")]
    Transport {
        service: String,
        worker: WorkerId,
        #[source]
        source: reqwest::Error,
    },
}

/// Forwards client requests to healthy workers.
#[derive(Clone)]
pub struct Proxy {
    client: reqwest::Client,
}

impl Proxy {
    /// Build a proxy with the given total timeout per forwarded call.
    ///
    /// A timed-out call is abandoned, never reused, and surfaces as a
    /// transport failure.
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        // Redirects pass through to the caller untouched.
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { client })
    }

    /// Resolve, select, and forward one request.
    pub async fn invoke(
        &self,
        registry: &Registry,
        req: ProxyRequest,
    ) -> Result<ProxyResponse, ProxyError> {
        let resolved = registry.resolve(&req.service).await;

        if resolved.healthy.is_empty() {
            // Unknown name and exhausted name are the same failure to the
            // caller; both carry the catalog.
            return Err(ProxyError::ServiceUnavailable {
                service: req.service,
                available: registry.available_service_names().await,
            });
        }

        // Uniform random among healthy candidates. Load is tracked on the
        // records but does not weight the pick.
        let healthy_count = resolved.healthy.len();
        let pick = rand::rng().random_range(0..healthy_count);
        let candidate = &resolved.healthy[pick];

        let url = build_target_url(&candidate.endpoint, &req.path, req.query.as_deref());
        debug!(
            service = %req.service,
            worker_id = %candidate.id,
            url = %url,
            "Forwarding request"
        );

        let outbound = self
            .client
            .request(req.method, &url)
            .headers(filter_headers(&req.headers))
            .body(req.body)
            .send()
            .await;

        match outbound {
            Ok(response) => {
                let status = response.status();
                let headers = filter_headers(response.headers());
                let body = response.bytes().await.map_err(|source| {
                    transport_error(&req.service, candidate.id, healthy_count, source)
                })?;
                Ok(ProxyResponse {
                    status,
                    headers,
                    body,
                })
            }
            Err(source) => {
                warn!(
                    service = %req.service,
                    worker_id = %candidate.id,
                    error = %source,
                    "Proxy transport failure"
                );
                Err(transport_error(
                    &req.service,
                    candidate.id,
                    healthy_count,
                    source,
                ))
            }
        }
    }
}

fn transport_error(
    service: &str,
    worker: WorkerId,
    healthy_count: usize,
    source: reqwest::Error,
) -> ProxyError {
    if healthy_count > 1 {
        ProxyError::Retryable {
            service: service.to_string(),
            healthy_remaining: healthy_count - 1,
        }
    } else {
        ProxyError::Transport {
            service: service.to_string(),
            worker,
            source,
        }
    }
}

/// Substitute the worker's endpoint for the service prefix of the path.
fn build_target_url(endpoint: &str, path: &str, query: Option<&str>) -> String {
    let base = endpoint.trim_end_matches('/');
    let path = path.trim_start_matches('/');

    let mut url = if path.is_empty() {
        format!("{base}/")
    } else {
        format!("{base}/{path}")
    };
    if let Some(query) = query {
        if !query.is_empty() {
            url.push('?');
            url.push_str(query);
        }
    }
    url
}

/// Drop hop-by-hop headers; everything else passes through verbatim.
fn filter_headers(headers: &HeaderMap) -> HeaderMap {
    let mut filtered = HeaderMap::new();
    for (name, value) in headers {
        if HOP_BY_HOP.contains(&name.as_str()) {
            continue;
        }
        if let Ok(name) = HeaderName::try_from(name.as_str()) {
            filtered.append(name, value.clone());
        }
    }
    filtered
}
