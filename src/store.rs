//! Shared store of the latest snapshot and online flag per host

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{RwLock, broadcast};
use tracing::trace;

use crate::SystemMetrics;

/// Default capacity of the snapshot broadcast channel
const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Published whenever a host's snapshot is replaced
#[derive(Debug, Clone)]
pub struct SnapshotEvent {
    pub host_id: String,
    pub snapshot: Arc<SystemMetrics>,
}

#[derive(Debug, Clone, Default)]
struct HostEntry {
    snapshot: Option<Arc<SystemMetrics>>,
    online: bool,
    last_change: Option<DateTime<Utc>>,
}

/// Everything the store knows about one host
#[derive(Debug, Clone)]
pub struct HostStatus {
    pub host_id: String,
    pub online: bool,
    pub last_change: Option<DateTime<Utc>>,
    pub snapshot: Option<Arc<SystemMetrics>>,
}

/// Latest known state per host
///
/// Each connection only writes its own host's key; snapshots are replaced,
/// never merged. Cloning the store yields another handle to the same data.
#[derive(Debug, Clone)]
pub struct MetricsStore {
    hosts: Arc<RwLock<HashMap<String, HostEntry>>>,
    snapshot_tx: broadcast::Sender<SnapshotEvent>,
}

impl MetricsStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    /// Create a store whose snapshot channel buffers `capacity` events
    pub fn with_capacity(capacity: usize) -> Self {
        let (snapshot_tx, _) = broadcast::channel(capacity.max(1));
        Self {
            hosts: Arc::new(RwLock::new(HashMap::new())),
            snapshot_tx,
        }
    }

    /// Replace the snapshot of `host_id` and notify subscribers
    pub async fn set_snapshot(&self, host_id: &str, snapshot: SystemMetrics) -> Arc<SystemMetrics> {
        let snapshot = Arc::new(snapshot);

        {
            let mut hosts = self.hosts.write().await;
            hosts.entry(host_id.to_string()).or_default().snapshot = Some(snapshot.clone());
        }

        // no subscribers is fine
        let receivers = self
            .snapshot_tx
            .send(SnapshotEvent {
                host_id: host_id.to_string(),
                snapshot: snapshot.clone(),
            })
            .unwrap_or_default();
        trace!("{host_id}: published snapshot {} to {receivers} receivers", snapshot.timestamp);

        snapshot
    }

    pub async fn get_snapshot(&self, host_id: &str) -> Option<Arc<SystemMetrics>> {
        let hosts = self.hosts.read().await;
        hosts.get(host_id).and_then(|entry| entry.snapshot.clone())
    }

    /// Update the online flag; the change timestamp moves only when the flag flips
    pub async fn set_online(&self, host_id: &str, online: bool) {
        let mut hosts = self.hosts.write().await;
        let entry = hosts.entry(host_id.to_string()).or_default();

        if entry.online != online || entry.last_change.is_none() {
            entry.online = online;
            entry.last_change = Some(Utc::now());
        }
    }

    pub async fn is_online(&self, host_id: &str) -> bool {
        let hosts = self.hosts.read().await;
        hosts.get(host_id).is_some_and(|entry| entry.online)
    }

    pub async fn last_change(&self, host_id: &str) -> Option<DateTime<Utc>> {
        let hosts = self.hosts.read().await;
        hosts.get(host_id).and_then(|entry| entry.last_change)
    }

    pub async fn status(&self, host_id: &str) -> Option<HostStatus> {
        let hosts = self.hosts.read().await;
        hosts.get(host_id).map(|entry| to_status(host_id, entry))
    }

    /// Status of every known host, ordered by id
    pub async fn hosts(&self) -> Vec<HostStatus> {
        let hosts = self.hosts.read().await;
        let mut statuses: Vec<HostStatus> = hosts
            .iter()
            .map(|(host_id, entry)| to_status(host_id, entry))
            .collect();
        statuses.sort_by(|a, b| a.host_id.cmp(&b.host_id));
        statuses
    }

    /// Forget everything about `host_id`
    pub async fn remove(&self, host_id: &str) -> bool {
        let mut hosts = self.hosts.write().await;
        hosts.remove(host_id).is_some()
    }

    /// Receive every snapshot published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<SnapshotEvent> {
        self.snapshot_tx.subscribe()
    }
}

impl Default for MetricsStore {
    fn default() -> Self {
        Self::new()
    }
}

fn to_status(host_id: &str, entry: &HostEntry) -> HostStatus {
    HostStatus {
        host_id: host_id.to_string(),
        online: entry.online,
        last_change: entry.last_change,
        snapshot: entry.snapshot.clone(),
    }
}
