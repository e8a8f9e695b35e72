//! Worker API integration tests.
//!
//! Exercises registration, heartbeats, liveness derivation, the durable
//! write-throttling policy, and heartbeat-leader election over HTTP.

use std::sync::Arc;
use std::time::Duration;

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

/// Test harness binding a full router to an ephemeral port.
struct Harness {
    base_url: String,
    client: reqwest::Client,
    store: Arc<MemoryStore>,
    shutdown_tx: watch::Sender<bool>,
}

impl Harness {
    async fn new(windows: Windows) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info,swb_coordinator=debug".into()),
            )
            .with_test_writer()
            .try_init();

        let store = Arc::new(MemoryStore::new());
        let dyn_store: Arc<dyn KvStore> = store.clone();

        let registry = Registry::load(
            dyn_store.clone(),
            RegistryConfig {
                staleness: windows.staleness,
                persist_throttle: windows.persist_throttle,
                heartbeat_interval: windows.heartbeat_interval,
            },
        )
        .await
        .unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (coordinators, _handle) = CoordinatorRegistry::spawn(
            dyn_store.clone(),
            windows.coordinator_activity,
            shutdown_rx,
        )
        .await
        .unwrap();

        let proxy = Proxy::new(windows.proxy_timeout).unwrap();
        let state = AppState::new(registry, coordinators, proxy, dyn_store);
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
            store,
            shutdown_tx,
        }
    }

    fn register_payload(&self, service: &str) -> serde_json::Value {
        serde_json::json!({
            "capabilities": { "cpu_cores": 8 },
            "services": [{ "name": service }],
            "endpoint": "http://10.0.0.9:9000",
            "ip_address": "10.0.0.9"
        })
    }

    async fn register(&self, payload: &serde_json::Value) -> serde_json::Value {
        let resp = self
            .client
            .post(format!("{}/v1/workers/register", self.base_url))
            .json(payload)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 201, "registration should succeed");
        resp.json().await.unwrap()
    }

    async fn heartbeat(&self, worker_id: &str, body: serde_json::Value) -> reqwest::Response {
        self.client
            .post(format!(
                "{}/v1/workers/{worker_id}/heartbeat",
                self.base_url
            ))
            .json(&body)
            .send()
            .await
            .unwrap()
    }

    async fn get_worker(&self, worker_id: &str) -> reqwest::Response {
        self.client
            .get(format!("{}/v1/workers/{worker_id}", self.base_url))
            .send()
            .await
            .unwrap()
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

#[tokio::test]
async fn test_register_heartbeat_lifecycle() {
    let harness = Harness::new(Windows::default()).await;

    let body = harness.register(&harness.register_payload("ocr")).await;
    let worker_id = body["worker_id"].as_str().expect("missing worker_id");
    assert!(worker_id.starts_with("wkr_"));
    assert_eq!(body["tier"], 2, "8 cpu cores with no gpu is the compute tier");
    assert_eq!(body["heartbeat_interval_seconds"], 30);
    assert_eq!(body["services_registered_count"], 1);

    let resp = harness
        .heartbeat(worker_id, serde_json::json!({ "current_load": 0.4 }))
        .await;
    assert_eq!(resp.status(), 200);
    let hb: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(hb["accepted"], true);

    let resp = harness.get_worker(worker_id).await;
    assert_eq!(resp.status(), 200);
    let view: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(view["status"], "healthy");
    assert_eq!(view["current_load"], 0.4);

    let resp = harness
        .client
        .get(format!("{}/v1/workers", harness.base_url))
        .send()
        .await
        .unwrap();
    let list: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(list["count"], 1);
}

#[tokio::test]
async fn test_invalid_registration_reports_violations() {
    let harness = Harness::new(Windows::default()).await;

    let resp = harness
        .client
        .post(format!("{}/v1/workers/register", harness.base_url))
        .json(&serde_json::json!({
            "services": [],
            "endpoint": ""
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    assert_eq!(
        resp.headers()["content-type"],
        "application/problem+json"
    );

    let problem: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(problem["code"], "invalid_registration");
    let fields: Vec<&str> = problem["details"]
        .as_array()
        .unwrap()
        .iter()
        .map(|d| d["field"].as_str().unwrap())
        .collect();
    assert!(fields.contains(&"endpoint"));
    assert!(fields.contains(&"services"));
}

#[tokio::test]
async fn test_silent_worker_reads_as_offline() {
    let windows = Windows {
        staleness: Duration::from_millis(150),
        ..Windows::default()
    };
    let harness = Harness::new(windows).await;

    let body = harness.register(&harness.register_payload("ocr")).await;
    let worker_id = body["worker_id"].as_str().unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;

    let view: serde_json::Value = harness.get_worker(worker_id).await.json().await.unwrap();
    assert_eq!(view["status"], "offline");

    // A heartbeat brings it straight back.
    harness.heartbeat(worker_id, serde_json::json!({})).await;
    let view: serde_json::Value = harness.get_worker(worker_id).await.json().await.unwrap();
    assert_eq!(view["status"], "healthy");
}

#[tokio::test]
async fn test_unchanged_heartbeats_do_not_write_durably() {
    let harness = Harness::new(Windows::default()).await;

    let body = harness.register(&harness.register_payload("ocr")).await;
    let worker_id = body["worker_id"].as_str().unwrap();

    let writes_after_register = harness.store.write_count();
    for _ in 0..5 {
        let resp = harness.heartbeat(worker_id, serde_json::json!({})).await;
        assert_eq!(resp.status(), 200);
    }
    assert_eq!(
        harness.store.write_count(),
        writes_after_register,
        "steady-state heartbeats must not reach the store"
    );

    // A status change is persisted immediately.
    harness
        .heartbeat(worker_id, serde_json::json!({ "status": "draining" }))
        .await;
    assert_eq!(harness.store.write_count(), writes_after_register + 1);
}

#[tokio::test]
async fn test_heartbeat_leadership_is_exclusive() {
    let harness = Harness::new(Windows::default()).await;

    let mut volunteer = harness.register_payload("ocr");
    volunteer["wants_heartbeat_leadership"] = serde_json::json!(true);

    let first = harness.register(&volunteer).await;
    let second = harness.register(&volunteer).await;
    assert_eq!(first["leadership_granted"], true);
    assert_eq!(second["leadership_granted"], false);

    // Unregistering the leader frees the slot for the next volunteer.
    let leader_id = first["worker_id"].as_str().unwrap();
    let resp = harness
        .client
        .delete(format!("{}/v1/workers/{leader_id}", harness.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);

    let third = harness.register(&volunteer).await;
    assert_eq!(third["leadership_granted"], true);
}

#[tokio::test]
async fn test_stats_aggregates_by_tier() {
    let harness = Harness::new(Windows::default()).await;

    harness.register(&harness.register_payload("ocr")).await;
    harness
        .register(&serde_json::json!({
            "capabilities": { "gpu_memory": 16384, "gpu_type": "a100" },
            "services": [{ "name": "embeddings" }],
            "endpoint": "http://10.0.0.10:9000"
        }))
        .await;

    let stats: serde_json::Value = harness
        .client
        .get(format!("{}/v1/workers/stats", harness.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(stats["total_workers"], 2);
    assert_eq!(stats["by_tier"]["1"], 1, "one gpu tier worker");
    assert_eq!(stats["by_tier"]["2"], 1, "one compute tier worker");
}

#[tokio::test]
async fn test_unknown_worker_heartbeat_is_problem_not_found() {
    let harness = Harness::new(Windows::default()).await;

    let resp = harness
        .heartbeat("wkr_01K00000000000000000000000", serde_json::json!({}))
        .await;
    assert_eq!(resp.status(), 404);
    let problem: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(problem["code"], "worker_not_found");
    assert!(problem["request_id"].as_str().is_some());
}
