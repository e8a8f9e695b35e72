//! Worker registry: records, liveness, leadership, and the service
//! directory.
//!
//! The registry holds the live view of every worker in memory and writes a
//! lagging durable copy through the injected [`KvStore`]. Liveness is never
//! stored: a worker silent for longer than the staleness window is reported
//! offline by every read path, while its record stays in storage until an
//! explicit unregister.
//!
//! Concurrency model: no lock is held across a store write. Whole-record
//! overwrites are last-writer-wins; the only true atomic is leadership
//! acquisition, delegated to the store's `put_if_absent`.

mod directory;
mod tier;

pub use directory::Directory;
pub use tier::{Capabilities, Tier};

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use swb_id::WorkerId;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::store::{get_typed, keys, put_typed, KvStore, StoreError};

/// Status string reported by a worker that has gone silent past the
/// staleness window. Derived at read time, never stored.
pub const STATUS_OFFLINE: &str = "offline";

/// Initial self-reported status for a fresh registration.
pub const STATUS_HEALTHY: &str = "healthy";

/// A service declared at registration. Only the name is interpreted by the
/// coordinator; other descriptor fields are carried opaquely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub name: String,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Durable worker record. `status` is the last self-reported string and is
/// advisory; readers must derive the effective status from `last_heartbeat`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub id: WorkerId,
    pub tier: Tier,
    pub status: String,
    pub capabilities: Capabilities,
    pub services: Vec<ServiceDescriptor>,
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub current_load: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available_memory: Option<u64>,
    pub is_heartbeat_leader: bool,
}

/// Per-worker bookkeeping for the write-throttling policy. Internal only;
/// never exposed or persisted.
#[derive(Debug, Clone)]
struct PersistenceMark {
    last_persisted_status: String,
    last_persisted_at: DateTime<Utc>,
}

struct WorkerEntry {
    record: WorkerRecord,
    mark: PersistenceMark,
}

/// A worker record with its status derived against the staleness window.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerView {
    pub id: WorkerId,
    pub tier: Tier,
    pub status: String,
    pub capabilities: Capabilities,
    pub services: Vec<ServiceDescriptor>,
    pub endpoint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub current_load: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub available_memory: Option<u64>,
    pub is_heartbeat_leader: bool,
}

/// Registration input, already shape-validated at the HTTP boundary but
/// revalidated here so the registry is safe to drive from any caller.
#[derive(Debug, Clone)]
pub struct NewWorker {
    pub capabilities: Capabilities,
    pub services: Vec<ServiceDescriptor>,
    pub endpoint: String,
    pub ip_address: Option<String>,
    pub wants_heartbeat_leadership: bool,
}

/// Successful registration outcome.
#[derive(Debug, Clone)]
pub struct Registered {
    pub worker_id: WorkerId,
    pub tier: Tier,
    pub heartbeat_interval: Duration,
    pub leadership_granted: bool,
    pub services_registered: usize,
}

/// Fields a heartbeat may update. Absent fields leave the live record
/// untouched.
#[derive(Debug, Clone, Default)]
pub struct HeartbeatUpdate {
    pub status: Option<String>,
    pub current_load: Option<f64>,
    pub available_memory: Option<u64>,
}

/// Registry-wide counters, computed on read, never stored.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub total_workers: usize,
    pub by_tier: BTreeMap<u8, usize>,
    pub by_status: BTreeMap<String, usize>,
    pub average_load_by_tier: BTreeMap<u8, f64>,
}

/// Healthy routing candidate for a service.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub id: WorkerId,
    pub endpoint: String,
}

/// Result of resolving a service against the directory and liveness.
#[derive(Debug, Clone)]
pub struct ResolvedService {
    /// Whether the service name was present in the directory at all.
    pub known: bool,
    /// Member count before pruning.
    pub total: usize,
    /// Healthy candidates after pruning.
    pub healthy: Vec<Candidate>,
}

/// Per-service availability summary for discovery.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub name: String,
    pub total: usize,
    pub healthy: usize,
    pub available: bool,
}

/// A single rejected registration field.
#[derive(Debug, Clone, Serialize)]
pub struct FieldViolation {
    pub field: String,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("worker {0} is not registered")]
    NotFound(WorkerId),

    #[error("invalid registration payload")]
    InvalidRegistration { violations: Vec<FieldViolation> },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Timing windows driving liveness, throttling, and heartbeat cadence.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Silence beyond this window makes a worker offline for every read.
    pub staleness: Duration,
    /// Minimum spacing between durable writes for an unchanged status.
    pub persist_throttle: Duration,
    /// Cadence handed to workers at registration.
    pub heartbeat_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            staleness: Duration::from_secs(90),
            persist_throttle: Duration::from_secs(300),
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

pub struct Registry {
    store: Arc<dyn KvStore>,
    config: RegistryConfig,
    staleness: chrono::Duration,
    persist_throttle: chrono::Duration,
    workers: RwLock<HashMap<WorkerId, WorkerEntry>>,
    directory: Directory,
    leader: RwLock<Option<WorkerId>>,
}

impl Registry {
    /// Create an empty registry over a store.
    pub fn new(store: Arc<dyn KvStore>, config: RegistryConfig) -> Self {
        let staleness = chrono::Duration::from_std(config.staleness)
            .unwrap_or_else(|_| chrono::Duration::seconds(90));
        let persist_throttle = chrono::Duration::from_std(config.persist_throttle)
            .unwrap_or_else(|_| chrono::Duration::minutes(5));

        Self {
            store,
            config,
            staleness,
            persist_throttle,
            workers: RwLock::new(HashMap::new()),
            directory: Directory::new(),
            leader: RwLock::new(None),
        }
    }

    /// Create a registry and cold-load the persisted copy.
    ///
    /// This is the only read path that prefers the store over live state:
    /// there is no live state yet.
    pub async fn load(store: Arc<dyn KvStore>, config: RegistryConfig) -> Result<Self, StoreError> {
        let registry = Self::new(store, config);

        let ids: Vec<WorkerId> = get_typed(registry.store.as_ref(), keys::WORKER_INDEX)
            .await?
            .unwrap_or_default();

        let mut workers = HashMap::new();
        for id in ids {
            let Some(record) =
                get_typed::<WorkerRecord>(registry.store.as_ref(), &keys::worker(&id)).await?
            else {
                // Index ahead of records is the expected eventual-consistency
                // gap; the id falls out of the index on the next persist.
                debug!(worker_id = %id, "Indexed worker has no persisted record");
                continue;
            };

            let mark = PersistenceMark {
                last_persisted_status: record.status.clone(),
                last_persisted_at: record.last_heartbeat,
            };
            workers.insert(id, WorkerEntry { record, mark });
        }

        let mut snapshot = BTreeMap::new();
        for (key, value) in registry.store.scan_prefix("service/").await? {
            let name = key.trim_start_matches("service/").to_string();
            let members: BTreeSet<WorkerId> =
                serde_json::from_value(value).map_err(|source| StoreError::Decode { key, source })?;
            snapshot.insert(name, members);
        }

        let leader: Option<WorkerId> = get_typed(registry.store.as_ref(), keys::LEADER).await?;

        let worker_count = workers.len();
        *registry.workers.write().await = workers;
        registry.directory.load(snapshot).await;
        *registry.leader.write().await = leader;

        info!(workers = worker_count, "Registry cold-loaded from store");
        Ok(registry)
    }

    /// Heartbeat cadence handed to workers.
    pub fn heartbeat_interval(&self) -> Duration {
        self.config.heartbeat_interval
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Register a worker: mint a fresh id, derive its tier, enter it into
    /// every declared service's directory set, and optionally acquire the
    /// heartbeat-leader slot.
    ///
    /// A fresh id is minted on every call; re-registration never mutates an
    /// existing record's tier.
    pub async fn register(&self, new: NewWorker) -> Result<Registered, RegistryError> {
        let violations = validate_registration(&new);
        if !violations.is_empty() {
            return Err(RegistryError::InvalidRegistration { violations });
        }

        let id = WorkerId::new();
        let tier = Tier::classify(&new.capabilities);
        let now = Utc::now();

        let leadership_granted = if new.wants_heartbeat_leadership {
            self.try_acquire_leadership(id).await?
        } else {
            false
        };

        let mut service_names: Vec<&str> =
            new.services.iter().map(|s| s.name.as_str()).collect();
        service_names.sort_unstable();
        service_names.dedup();
        let services_registered = service_names.len();

        let record = WorkerRecord {
            id,
            tier,
            status: STATUS_HEALTHY.to_string(),
            capabilities: new.capabilities,
            services: new.services.clone(),
            endpoint: new.endpoint,
            ip_address: new.ip_address,
            registered_at: now,
            last_heartbeat: now,
            current_load: 0.0,
            available_memory: None,
            is_heartbeat_leader: leadership_granted,
        };

        {
            let mut workers = self.workers.write().await;
            workers.insert(
                id,
                WorkerEntry {
                    record: record.clone(),
                    mark: PersistenceMark {
                        last_persisted_status: record.status.clone(),
                        last_persisted_at: now,
                    },
                },
            );
        }

        for name in &service_names {
            let members = self.directory.add(name, id).await;
            put_typed(self.store.as_ref(), &keys::service(name), &members).await?;
        }

        put_typed(self.store.as_ref(), &keys::worker(&id), &record).await?;
        self.persist_index().await?;

        info!(
            worker_id = %id,
            tier = tier.rank(),
            services = services_registered,
            leader = leadership_granted,
            "Worker registered"
        );

        Ok(Registered {
            worker_id: id,
            tier,
            heartbeat_interval: self.config.heartbeat_interval,
            leadership_granted,
            services_registered,
        })
    }

    /// Process a heartbeat: the live view updates unconditionally, a durable
    /// write happens only when the reported status changed since the last
    /// persisted copy or the throttle window elapsed.
    pub async fn heartbeat(
        &self,
        id: WorkerId,
        update: HeartbeatUpdate,
    ) -> Result<(), RegistryError> {
        let now = Utc::now();

        let to_persist = {
            let mut workers = self.workers.write().await;
            let entry = workers.get_mut(&id).ok_or(RegistryError::NotFound(id))?;

            entry.record.last_heartbeat = now;
            if let Some(status) = update.status {
                entry.record.status = status;
            }
            if let Some(load) = update.current_load {
                entry.record.current_load = load.clamp(0.0, 1.0);
            }
            if let Some(memory) = update.available_memory {
                entry.record.available_memory = Some(memory);
            }

            let status_changed = entry.record.status != entry.mark.last_persisted_status;
            let window_elapsed =
                now.signed_duration_since(entry.mark.last_persisted_at) > self.persist_throttle;

            if status_changed || window_elapsed {
                Some(entry.record.clone())
            } else {
                None
            }
        };

        if let Some(record) = to_persist {
            // The live view already carries this heartbeat; a lost durable
            // write only widens the persisted lag, so it is logged rather
            // than failed back to the worker. The mark moves only on a write
            // that landed, so a failed write leaves the throttle open and
            // the next heartbeat retries.
            match put_typed(self.store.as_ref(), &keys::worker(&id), &record).await {
                Ok(()) => {
                    let mut workers = self.workers.write().await;
                    if let Some(entry) = workers.get_mut(&id) {
                        entry.mark = PersistenceMark {
                            last_persisted_status: record.status.clone(),
                            last_persisted_at: now,
                        };
                    }
                    debug!(worker_id = %id, status = %record.status, "Heartbeat persisted");
                }
                Err(e) => {
                    warn!(worker_id = %id, error = %e, "Durable heartbeat write failed");
                }
            }
        }

        Ok(())
    }

    /// Remove a worker. Idempotent: unregistering an absent id succeeds and
    /// still sweeps the directory and leader slot for the id.
    pub async fn unregister(&self, id: WorkerId) -> Result<(), RegistryError> {
        let existed = self.workers.write().await.remove(&id).is_some();

        for (name, remaining) in self.directory.remove_worker(id).await {
            if remaining.is_empty() {
                self.store.delete(&keys::service(&name)).await?;
            } else {
                put_typed(self.store.as_ref(), &keys::service(&name), &remaining).await?;
            }
        }

        let held_leadership = *self.leader.read().await == Some(id);
        if held_leadership {
            *self.leader.write().await = None;
            self.store.delete(keys::LEADER).await?;
        }

        self.store.delete(&keys::worker(&id)).await?;
        self.persist_index().await?;

        info!(worker_id = %id, existed, "Worker unregistered");
        Ok(())
    }

    /// A single worker with derived status, if registered.
    pub async fn get(&self, id: WorkerId) -> Option<WorkerView> {
        self.expire_stale_leader().await;
        let now = Utc::now();
        let workers = self.workers.read().await;
        workers.get(&id).map(|entry| self.view_of(&entry.record, now))
    }

    /// All workers with status recomputed against the staleness window.
    pub async fn list(&self) -> Vec<WorkerView> {
        let now = Utc::now();
        let mut views: Vec<WorkerView> = {
            let workers = self.workers.read().await;
            workers
                .values()
                .map(|entry| self.view_of(&entry.record, now))
                .collect()
        };
        views.sort_by_key(|view| view.id);

        // A stale leader loses the slot on the read that discovers it.
        if let Some(expired) = self.expire_stale_leader().await {
            for view in &mut views {
                if view.id == expired {
                    view.is_heartbeat_leader = false;
                }
            }
        }

        views
    }

    /// Counts by tier and derived status, plus average load per tier.
    pub async fn stats(&self) -> RegistryStats {
        let now = Utc::now();
        let (by_tier, by_status, load_sums, total) = {
            let workers = self.workers.read().await;
            let mut by_tier: BTreeMap<u8, usize> = BTreeMap::new();
            let mut by_status: BTreeMap<String, usize> = BTreeMap::new();
            let mut load_sums: BTreeMap<u8, f64> = BTreeMap::new();

            for entry in workers.values() {
                let rank = entry.record.tier.rank();
                *by_tier.entry(rank).or_default() += 1;
                *load_sums.entry(rank).or_default() += entry.record.current_load;
                let status = self.effective_status(&entry.record, now);
                *by_status.entry(status).or_default() += 1;
            }

            (by_tier, by_status, load_sums, workers.len())
        };
        self.expire_stale_leader().await;

        let average_load_by_tier = load_sums
            .into_iter()
            .map(|(rank, sum)| {
                let count = by_tier.get(&rank).copied().unwrap_or(1).max(1);
                (rank, sum / count as f64)
            })
            .collect();

        RegistryStats {
            total_workers: total,
            by_tier,
            by_status,
            average_load_by_tier,
        }
    }

    /// Resolve a service to healthy candidates, pruning not-healthy ids from
    /// the directory as a side effect of the lookup.
    ///
    /// The pruning write-back is best effort: a lost write only lets a stale
    /// id survive one more lookup cycle.
    pub async fn resolve(&self, service: &str) -> ResolvedService {
        let Some(members) = self.directory.members(service).await else {
            return ResolvedService {
                known: false,
                total: 0,
                healthy: Vec::new(),
            };
        };

        let now = Utc::now();
        let total = members.len();
        let (healthy, keep) = {
            let workers = self.workers.read().await;
            let mut healthy = Vec::new();
            let mut keep = BTreeSet::new();

            for id in &members {
                let Some(entry) = workers.get(id) else {
                    continue;
                };
                if self.is_stale(&entry.record, now) || entry.record.endpoint.is_empty() {
                    continue;
                }
                keep.insert(*id);
                healthy.push(Candidate {
                    id: *id,
                    endpoint: entry.record.endpoint.clone(),
                });
            }

            (healthy, keep)
        };

        if keep != members {
            let pruned = total - keep.len();
            debug!(service, pruned, "Pruning directory entry on lookup");
            let key = keys::service(service);
            self.directory.replace(service, keep.clone()).await;
            let write = if keep.is_empty() {
                self.store.delete(&key).await
            } else {
                put_typed(self.store.as_ref(), &key, &keep).await
            };
            if let Err(e) = write {
                warn!(service, error = %e, "Directory prune write-back failed");
            }
        }

        ResolvedService {
            known: true,
            total,
            healthy,
        }
    }

    /// Availability summary for every known service. Applies the same
    /// prune-on-lookup side effect as routing.
    pub async fn service_overview(&self) -> Vec<ServiceStatus> {
        let mut overview = Vec::new();
        for name in self.directory.service_names().await {
            let resolved = self.resolve(&name).await;
            overview.push(ServiceStatus {
                healthy: resolved.healthy.len(),
                available: !resolved.healthy.is_empty(),
                total: resolved.total,
                name,
            });
        }
        overview
    }

    /// Names of services with at least one healthy provider, for the
    /// self-recovery catalog in ServiceUnavailable errors. Read-only: the
    /// error path must not be delayed by pruning writes.
    pub async fn available_service_names(&self) -> Vec<String> {
        let now = Utc::now();
        let snapshot = self.directory.snapshot().await;
        let workers = self.workers.read().await;

        snapshot
            .into_iter()
            .filter(|(_, members)| {
                members.iter().any(|id| {
                    workers.get(id).is_some_and(|entry| {
                        !self.is_stale(&entry.record, now) && !entry.record.endpoint.is_empty()
                    })
                })
            })
            .map(|(name, _)| name)
            .collect()
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn is_stale(&self, record: &WorkerRecord, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(record.last_heartbeat) > self.staleness
    }

    fn effective_status(&self, record: &WorkerRecord, now: DateTime<Utc>) -> String {
        if self.is_stale(record, now) {
            STATUS_OFFLINE.to_string()
        } else {
            record.status.clone()
        }
    }

    fn view_of(&self, record: &WorkerRecord, now: DateTime<Utc>) -> WorkerView {
        WorkerView {
            id: record.id,
            tier: record.tier,
            status: self.effective_status(record, now),
            capabilities: record.capabilities.clone(),
            services: record.services.clone(),
            endpoint: record.endpoint.clone(),
            ip_address: record.ip_address.clone(),
            registered_at: record.registered_at,
            last_heartbeat: record.last_heartbeat,
            current_load: record.current_load,
            available_memory: record.available_memory,
            is_heartbeat_leader: record.is_heartbeat_leader,
        }
    }

    /// Acquire the heartbeat-leader slot for a new registration.
    ///
    /// The slot is first lazily cleared if its current holder went stale;
    /// acquisition itself is the store's compare-and-swap, so two concurrent
    /// registrations cannot both win.
    async fn try_acquire_leadership(&self, id: WorkerId) -> Result<bool, StoreError> {
        self.expire_stale_leader().await;

        let won = self
            .store
            .put_if_absent(keys::LEADER, serde_json::json!(id.to_string()))
            .await?;

        if won {
            *self.leader.write().await = Some(id);
            info!(worker_id = %id, "Heartbeat leadership granted");
        }
        Ok(won)
    }

    /// Clear the leader slot if its holder is stale or gone. Returns the
    /// expired id, if any. Never reassigns: the next registration asking for
    /// leadership acquires the emptied slot.
    async fn expire_stale_leader(&self) -> Option<WorkerId> {
        let current = *self.leader.read().await;
        let id = current?;

        let now = Utc::now();
        let holder_alive = {
            let workers = self.workers.read().await;
            workers
                .get(&id)
                .is_some_and(|entry| !self.is_stale(&entry.record, now))
        };
        if holder_alive {
            return None;
        }

        {
            let mut leader = self.leader.write().await;
            // Another task may have raced the clear; only act on the same id.
            if *leader != Some(id) {
                return None;
            }
            *leader = None;
        }
        if let Some(entry) = self.workers.write().await.get_mut(&id) {
            entry.record.is_heartbeat_leader = false;
        }
        if let Err(e) = self.store.delete(keys::LEADER).await {
            warn!(worker_id = %id, error = %e, "Leader slot clear failed");
        }

        info!(worker_id = %id, "Stale heartbeat leader expired");
        Some(id)
    }

    async fn persist_index(&self) -> Result<(), StoreError> {
        let mut ids: Vec<WorkerId> = self.workers.read().await.keys().copied().collect();
        ids.sort_unstable();
        put_typed(self.store.as_ref(), keys::WORKER_INDEX, &ids).await
    }
}

fn validate_registration(new: &NewWorker) -> Vec<FieldViolation> {
    let mut violations = Vec::new();

    if new.endpoint.is_empty() {
        violations.push(FieldViolation {
            field: "endpoint".to_string(),
            message: "endpoint cannot be empty".to_string(),
        });
    } else if !new.endpoint.starts_with("http://") && !new.endpoint.starts_with("https://") {
        violations.push(FieldViolation {
            field: "endpoint".to_string(),
            message: "endpoint must be an http(s) URL".to_string(),
        });
    }

    if new.services.is_empty() {
        violations.push(FieldViolation {
            field: "services".to_string(),
            message: "at least one service must be declared".to_string(),
        });
    }
    for (index, service) in new.services.iter().enumerate() {
        if service.name.trim().is_empty() {
            violations.push(FieldViolation {
                field: format!("services[{index}].name"),
                message: "service name cannot be empty".to_string(),
            });
        }
    }

    if new.capabilities.gpu_memory == Some(0) {
        violations.push(FieldViolation {
            field: "capabilities.gpu_memory".to_string(),
            message: "gpu_memory must be positive when present".to_string(),
        });
    }

    violations
}

#[cfg(test)]
impl Registry {
    /// Test hook: move a worker's last heartbeat into the past.
    pub async fn rewind_heartbeat(&self, id: WorkerId, by: Duration) {
        let mut workers = self.workers.write().await;
        if let Some(entry) = workers.get_mut(&id) {
            entry.record.last_heartbeat -= chrono::Duration::from_std(by).unwrap();
        }
    }

    /// Test hook: move a worker's last persisted-at mark into the past.
    pub async fn rewind_persist_mark(&self, id: WorkerId, by: Duration) {
        let mut workers = self.workers.write().await;
        if let Some(entry) = workers.get_mut(&id) {
            entry.mark.last_persisted_at -= chrono::Duration::from_std(by).unwrap();
        }
    }

    /// Test hook: current live leader id.
    pub async fn leader_id(&self) -> Option<WorkerId> {
        *self.leader.read().await
    }
}
