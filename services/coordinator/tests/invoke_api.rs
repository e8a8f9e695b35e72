//! Service invocation integration tests.
//!
//! Runs the full router against wiremock upstreams to exercise request
//! forwarding and the failure taxonomy.

use std::sync::Arc;

use swb_coordinator::{
    api,
    config::Windows,
    coordinators::CoordinatorRegistry,
    proxy::Proxy,
    registry::{Registry, RegistryConfig},
    state::AppState,
    store::{KvStore, MemoryStore},
};
use tokio::net::TcpListener;
use tokio::sync::watch;
use wiremock::matchers::{body_string, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Harness {
    base_url: String,
    client: reqwest::Client,
    shutdown_tx: watch::Sender<bool>,
}

impl Harness {
    async fn new() -> Self {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let windows = Windows::default();

        let registry = Registry::load(
            store.clone(),
            RegistryConfig {
                staleness: windows.staleness,
                persist_throttle: windows.persist_throttle,
                heartbeat_interval: windows.heartbeat_interval,
            },
        )
        .await
        .unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (coordinators, _handle) =
            CoordinatorRegistry::spawn(store.clone(), windows.coordinator_activity, shutdown_rx)
                .await
                .unwrap();

        let proxy = Proxy::new(windows.proxy_timeout).unwrap();
        let state = AppState::new(registry, coordinators, proxy, store);
        let app = api::create_router(state);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{addr}");

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            client: reqwest::Client::new(),
            shutdown_tx,
        }
    }

    async fn register_worker(&self, service: &str, endpoint: &str) -> String {
        let resp = self
            .client
            .post(format!("{}/v1/workers/register", self.base_url))
            .json(&serde_json::json!({
                "services": [{ "name": service }],
                "endpoint": endpoint
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 201);
        let body: serde_json::Value = resp.json().await.unwrap();
        body["worker_id"].as_str().unwrap().to_string()
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

#[tokio::test]
async fn test_invoke_forwards_method_path_query_and_body() {
    let harness = Harness::new().await;
    let upstream = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v2/analyze"))
        .and(query_param("lang", "en"))
        .and(header("x-custom", "yes"))
        .and(body_string("payload-bytes"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("x-upstream", "worker-7")
                .set_body_string("analyzed"),
        )
        .mount(&upstream)
        .await;

    harness.register_worker("ocr", &upstream.uri()).await;

    let resp = harness
        .client
        .post(format!(
            "{}/v1/services/ocr/invoke/v2/analyze?lang=en",
            harness.base_url
        ))
        .header("x-custom", "yes")
        .body("payload-bytes")
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["x-upstream"], "worker-7");
    assert_eq!(resp.text().await.unwrap(), "analyzed");
}

#[tokio::test]
async fn test_invoke_at_service_root() {
    let harness = Harness::new().await;
    let upstream = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&upstream)
        .await;

    harness.register_worker("ocr", &upstream.uri()).await;

    let resp = harness
        .client
        .get(format!("{}/v1/services/ocr/invoke", harness.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);
}

#[tokio::test]
async fn test_upstream_errors_pass_through_verbatim() {
    let harness = Harness::new().await;
    let upstream = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/broken"))
        .respond_with(ResponseTemplate::new(422).set_body_string("bad input"))
        .mount(&upstream)
        .await;

    harness.register_worker("ocr", &upstream.uri()).await;

    // A worker-level application error is the worker's answer, not a routing
    // failure.
    let resp = harness
        .client
        .get(format!(
            "{}/v1/services/ocr/invoke/broken",
            harness.base_url
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 422);
    assert_eq!(resp.text().await.unwrap(), "bad input");
}

#[tokio::test]
async fn test_unknown_service_returns_catalog() {
    let harness = Harness::new().await;
    let upstream = MockServer::start().await;
    harness.register_worker("ocr", &upstream.uri()).await;

    let resp = harness
        .client
        .post(format!(
            "{}/v1/services/transcode/invoke/run",
            harness.base_url
        ))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 503);
    let problem: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(problem["code"], "service_unavailable");
    assert_eq!(problem["retryable"], false);
    assert_eq!(
        problem["available_services"],
        serde_json::json!(["ocr"])
    );
}

#[tokio::test]
async fn test_sole_unreachable_worker_is_hard_failure() {
    let harness = Harness::new().await;

    // Nothing listens on this port.
    let worker_id = harness
        .register_worker("ocr", "http://127.0.0.1:1")
        .await;

    let resp = harness
        .client
        .get(format!("{}/v1/services/ocr/invoke/run", harness.base_url))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 502);
    let problem: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(problem["code"], "proxy_transport_failure");
    assert_eq!(problem["retryable"], false);
    assert_eq!(problem["worker_id"], worker_id);
    assert_eq!(problem["healthy_remaining"], 0);
}

#[tokio::test]
async fn test_failure_with_alternatives_is_retryable() {
    let harness = Harness::new().await;

    // Two providers, both unreachable, so whichever is picked fails while
    // another healthy candidate remains.
    harness.register_worker("ocr", "http://127.0.0.1:1").await;
    harness.register_worker("ocr", "http://127.0.0.1:1").await;

    let resp = harness
        .client
        .get(format!("{}/v1/services/ocr/invoke/run", harness.base_url))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 502);
    let problem: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(problem["code"], "worker_unreachable");
    assert_eq!(problem["retryable"], true);
    assert_eq!(problem["healthy_remaining"], 1);
}
