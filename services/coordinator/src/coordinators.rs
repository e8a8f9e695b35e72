//! Regional coordinator registry.
//!
//! Independently deployed coordinator instances register themselves here so
//! peers can bootstrap discovery. Unlike the worker registry, this state is
//! strongly consistent: a single actor task owns it and processes one
//! message at a time, so no compare-and-swap is needed.
//!
//! Entries silent for longer than the activity window are pruned on every
//! read, and the pruned list is persisted back, mirroring the service
//! directory's lazy-cleanup-on-read pattern.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use swb_id::CoordinatorId;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::store::{get_typed, keys, put_typed, KvStore, StoreError};

/// A registered regional coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorRecord {
    pub id: CoordinatorId,
    pub endpoint: String,
    pub location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discovery_port: Option<u16>,
    pub registered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Seed-node descriptor handed to peers bootstrapping discovery. Only
/// coordinators that expose a discovery port become seeds.
#[derive(Debug, Clone, Serialize)]
pub struct SeedNode {
    pub node_id: CoordinatorId,
    pub endpoint: String,
    pub discovery_port: u16,
    pub location: String,
}

/// Registration input; an upsert keyed by the caller-minted id.
#[derive(Debug, Clone)]
pub struct RegisterCoordinator {
    pub id: CoordinatorId,
    pub endpoint: String,
    pub location: String,
    pub discovery_port: Option<u16>,
}

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("coordinator registry is shut down")]
    Closed,

    #[error(transparent)]
    Store(#[from] StoreError),
}

enum Command {
    Register {
        req: RegisterCoordinator,
        reply: oneshot::Sender<Result<CoordinatorRecord, StoreError>>,
    },
    List {
        reply: oneshot::Sender<Vec<CoordinatorRecord>>,
    },
    Bootstrap {
        reply: oneshot::Sender<Vec<SeedNode>>,
    },
}

/// Handle to the single-writer registry actor.
#[derive(Clone)]
pub struct CoordinatorRegistry {
    tx: mpsc::Sender<Command>,
}

impl CoordinatorRegistry {
    /// Cold-load persisted entries and start the actor task.
    pub async fn spawn(
        store: Arc<dyn KvStore>,
        activity_window: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(Self, JoinHandle<()>), StoreError> {
        let entries: Vec<CoordinatorRecord> = get_typed(store.as_ref(), keys::COORDINATORS)
            .await?
            .unwrap_or_default();
        let entries: BTreeMap<CoordinatorId, CoordinatorRecord> = entries
            .into_iter()
            .map(|record| (record.id, record))
            .collect();
        info!(coordinators = entries.len(), "Coordinator registry loaded");

        let (tx, rx) = mpsc::channel(64);
        let actor = RegistryActor {
            store,
            entries,
            activity_window: chrono::Duration::from_std(activity_window)
                .unwrap_or_else(|_| chrono::Duration::minutes(5)),
        };
        let handle = tokio::spawn(actor.run(rx, shutdown));

        Ok((Self { tx }, handle))
    }

    /// Upsert a coordinator, refreshing its `last_seen`.
    pub async fn register(
        &self,
        req: RegisterCoordinator,
    ) -> Result<CoordinatorRecord, CoordinatorError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Register { req, reply })
            .await
            .map_err(|_| CoordinatorError::Closed)?;
        rx.await.map_err(|_| CoordinatorError::Closed)?.map_err(Into::into)
    }

    /// Active coordinators, pruned of entries past the activity window.
    pub async fn list(&self) -> Result<Vec<CoordinatorRecord>, CoordinatorError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::List { reply })
            .await
            .map_err(|_| CoordinatorError::Closed)?;
        rx.await.map_err(|_| CoordinatorError::Closed)
    }

    /// Seed nodes for peer discovery: active coordinators with a discovery
    /// port.
    pub async fn bootstrap_seeds(&self) -> Result<Vec<SeedNode>, CoordinatorError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Bootstrap { reply })
            .await
            .map_err(|_| CoordinatorError::Closed)?;
        rx.await.map_err(|_| CoordinatorError::Closed)
    }
}

struct RegistryActor {
    store: Arc<dyn KvStore>,
    entries: BTreeMap<CoordinatorId, CoordinatorRecord>,
    activity_window: chrono::Duration,
}

impl RegistryActor {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                command = rx.recv() => {
                    match command {
                        Some(command) => self.handle(command).await,
                        None => break,
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Coordinator registry shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Register { req, reply } => {
                let result = self.register(req).await;
                let _ = reply.send(result);
            }
            Command::List { reply } => {
                self.prune().await;
                let _ = reply.send(self.entries.values().cloned().collect());
            }
            Command::Bootstrap { reply } => {
                self.prune().await;
                let seeds = self
                    .entries
                    .values()
                    .filter_map(|record| {
                        record.discovery_port.map(|port| SeedNode {
                            node_id: record.id,
                            endpoint: record.endpoint.clone(),
                            discovery_port: port,
                            location: record.location.clone(),
                        })
                    })
                    .collect();
                let _ = reply.send(seeds);
            }
        }
    }

    async fn register(&mut self, req: RegisterCoordinator) -> Result<CoordinatorRecord, StoreError> {
        let now = Utc::now();
        let record = match self.entries.get(&req.id) {
            Some(existing) => CoordinatorRecord {
                id: req.id,
                endpoint: req.endpoint,
                location: req.location,
                discovery_port: req.discovery_port,
                registered_at: existing.registered_at,
                last_seen: now,
            },
            None => CoordinatorRecord {
                id: req.id,
                endpoint: req.endpoint,
                location: req.location,
                discovery_port: req.discovery_port,
                registered_at: now,
                last_seen: now,
            },
        };

        self.entries.insert(record.id, record.clone());
        self.persist().await?;

        info!(coordinator_id = %record.id, location = %record.location, "Coordinator registered");
        Ok(record)
    }

    /// Drop entries not seen within the activity window. Persist-back is
    /// best effort: a lost write resurfaces the entry for one more read.
    async fn prune(&mut self) {
        let now = Utc::now();
        let before = self.entries.len();
        self.entries
            .retain(|_, record| now.signed_duration_since(record.last_seen) < self.activity_window);

        if self.entries.len() != before {
            debug!(pruned = before - self.entries.len(), "Pruned inactive coordinators");
            if let Err(e) = self.persist().await {
                warn!(error = %e, "Coordinator prune write-back failed");
            }
        }
    }

    async fn persist(&self) -> Result<(), StoreError> {
        let records: Vec<&CoordinatorRecord> = self.entries.values().collect();
        put_typed(self.store.as_ref(), keys::COORDINATORS, &records).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    async fn spawn_registry(
        window: Duration,
    ) -> (CoordinatorRegistry, Arc<MemoryStore>, watch::Sender<bool>) {
        let store = Arc::new(MemoryStore::new());
        let (shutdown_tx, shutdown) = watch::channel(false);
        let (registry, _handle) =
            CoordinatorRegistry::spawn(store.clone(), window, shutdown).await.unwrap();
        (registry, store, shutdown_tx)
    }

    fn coordinator(discovery_port: Option<u16>) -> RegisterCoordinator {
        RegisterCoordinator {
            id: CoordinatorId::new(),
            endpoint: "http://coordinator-eu.example:8080".to_string(),
            location: "eu-central".to_string(),
            discovery_port,
        }
    }

    #[tokio::test]
    async fn test_register_is_upsert_by_id() {
        let (registry, _store, _shutdown) = spawn_registry(Duration::from_secs(300)).await;

        let mut req = coordinator(None);
        let first = registry.register(req.clone()).await.unwrap();

        req.location = "eu-west".to_string();
        let second = registry.register(req).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.registered_at, second.registered_at);
        assert_eq!(second.location, "eu-west");
        assert_eq!(registry.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_bootstrap_only_includes_discovery_ports() {
        let (registry, _store, _shutdown) = spawn_registry(Duration::from_secs(300)).await;

        registry.register(coordinator(Some(4100))).await.unwrap();
        registry.register(coordinator(None)).await.unwrap();

        let seeds = registry.bootstrap_seeds().await.unwrap();
        assert_eq!(seeds.len(), 1);
        assert_eq!(seeds[0].discovery_port, 4100);
        assert_eq!(registry.list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_reads_prune_inactive_entries() {
        let (registry, store, _shutdown) = spawn_registry(Duration::from_millis(20)).await;

        registry.register(coordinator(Some(4100))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        let fresh = registry.register(coordinator(Some(4200))).await.unwrap();

        let listed = registry.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, fresh.id);

        // The pruned list is what survives a cold restart.
        let persisted: Vec<CoordinatorRecord> =
            get_typed(store.as_ref(), keys::COORDINATORS).await.unwrap().unwrap();
        assert_eq!(persisted.len(), 1);
    }

    #[tokio::test]
    async fn test_cold_load_restores_entries() {
        let store = Arc::new(MemoryStore::new());
        let (_shutdown_tx, shutdown) = watch::channel(false);

        let (registry, _handle) = CoordinatorRegistry::spawn(
            store.clone(),
            Duration::from_secs(300),
            shutdown.clone(),
        )
        .await
        .unwrap();
        let record = registry.register(coordinator(Some(4100))).await.unwrap();

        let (reloaded, _handle) =
            CoordinatorRegistry::spawn(store, Duration::from_secs(300), shutdown).await.unwrap();
        let listed = reloaded.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, record.id);
    }
}
