//! ConnectionRegistry - the set of configured hosts and their actors
//!
//! For every configured [`HostTarget`] the registry runs one connection actor
//! and one history correlator bound to it. Hosts and actors are kept in
//! lockstep: adding a host spawns and enables its actors, removing it disables
//! and stops them before its state is dropped from the [`MetricsStore`].
//!
//! The host list is persisted through an injected [`HostRepository`]. It is
//! read once by [`ConnectionRegistry::load`] and written by every
//! `upsert`/`remove` before the running hosts change. A failed save leaves
//! both the running hosts and the stored list as they were.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::SystemMetrics;
use crate::config::{HostTarget, LinkConfig};
use crate::connection::{ConnectionHandle, ConnectionStatus};
use crate::correlator::CorrelatorHandle;
use crate::error::{LinkError, LinkResult};
use crate::history::{HistoryPoint, HistoryRange, HistoryView};
use crate::repository::HostRepository;
use crate::store::{HostStatus, MetricsStore};
use crate::transport::Connector;

/// Change to the host list that is saved before it is applied
enum PendingChange<'a> {
    Upsert(&'a HostTarget),
    Remove(&'a str),
}

/// Actors of one configured host
struct HostEntry {
    target: HostTarget,
    connection: ConnectionHandle,
    correlator: CorrelatorHandle,
}

pub struct ConnectionRegistry {
    store: MetricsStore,
    connector: Arc<dyn Connector>,
    repository: Arc<dyn HostRepository>,
    config: LinkConfig,

    /// Ordered by host id; mutations hold the lock until the list is saved
    hosts: Mutex<BTreeMap<String, HostEntry>>,
}

impl ConnectionRegistry {
    /// Create an empty registry
    pub fn new(
        store: MetricsStore,
        connector: Arc<dyn Connector>,
        repository: Arc<dyn HostRepository>,
        config: LinkConfig,
    ) -> Self {
        Self {
            store,
            connector,
            repository,
            config,
            hosts: Mutex::new(BTreeMap::new()),
        }
    }

    /// Create a registry from the hosts stored in `repository` and enable
    /// a connection for each of them
    pub async fn load(
        store: MetricsStore,
        connector: Arc<dyn Connector>,
        repository: Arc<dyn HostRepository>,
        config: LinkConfig,
    ) -> LinkResult<Self> {
        let targets = repository.load().await?;
        let registry = Self::new(store, connector, repository, config);

        {
            let mut hosts = registry.hosts.lock().await;
            for target in targets {
                let entry = registry.spawn_entry(target).await?;
                hosts.insert(entry.target.id.clone(), entry);
            }
            info!("loaded {} hosts", hosts.len());
        }

        Ok(registry)
    }

    pub fn store(&self) -> &MetricsStore {
        &self.store
    }

    /// Add a host, or update the parameters of an existing one.
    ///
    /// A new host is connected immediately. For a known host, a changed
    /// address, port, secret or scheme restarts the handshake; a changed
    /// display name is applied in place.
    #[instrument(skip(self, target), fields(host = %target.id))]
    pub async fn upsert(&self, target: HostTarget) -> LinkResult<()> {
        let mut hosts = self.hosts.lock().await;

        if hosts.get(&target.id).is_some_and(|entry| entry.target == target) {
            debug!("host unchanged");
            return Ok(());
        }

        self.save(&hosts, PendingChange::Upsert(&target)).await?;

        match hosts.get_mut(&target.id) {
            Some(entry) => {
                if entry.target.endpoint_differs(&target) {
                    info!("updating endpoint of {} to {}", target.id, target.url());
                } else {
                    debug!("updating host details");
                }

                entry
                    .connection
                    .update_target(target.clone())
                    .await
                    .map_err(|_| LinkError::ActorStopped(target.id.clone()))?;
                entry.target = target;
            }

            None => {
                info!("adding host {} ({})", target.display_name(), target.url());
                let entry = self.spawn_entry(target).await?;
                hosts.insert(entry.target.id.clone(), entry);
            }
        }

        Ok(())
    }

    /// Remove a host, stopping its actors and dropping its state
    #[instrument(skip(self))]
    pub async fn remove(&self, host_id: &str) -> LinkResult<()> {
        let mut hosts = self.hosts.lock().await;

        if !hosts.contains_key(host_id) {
            return Err(LinkError::UnknownHost(host_id.to_string()));
        }

        self.save(&hosts, PendingChange::Remove(host_id)).await?;

        if let Some(entry) = hosts.remove(host_id) {
            info!("removing host {}", entry.target.display_name());
            stop_entry(&entry).await;
        }
        self.store.remove(host_id).await;

        Ok(())
    }

    /// Resume connecting to a host
    pub async fn enable(&self, host_id: &str) -> LinkResult<()> {
        let connection = self.connection(host_id).await?;
        connection
            .enable()
            .await
            .map_err(|_| LinkError::ActorStopped(host_id.to_string()))
    }

    /// Stop connecting to a host without removing it
    pub async fn disable(&self, host_id: &str) -> LinkResult<()> {
        let connection = self.connection(host_id).await?;
        connection
            .disable()
            .await
            .map_err(|_| LinkError::ActorStopped(host_id.to_string()))
    }

    pub async fn get_snapshot(&self, host_id: &str) -> Option<Arc<SystemMetrics>> {
        self.store.get_snapshot(host_id).await
    }

    pub async fn is_online(&self, host_id: &str) -> bool {
        self.store.is_online(host_id).await
    }

    /// Store view of a host: online flag, last change and latest snapshot
    pub async fn status(&self, host_id: &str) -> Option<HostStatus> {
        self.store.status(host_id).await
    }

    pub async fn connection_status(&self, host_id: &str) -> LinkResult<ConnectionStatus> {
        Ok(self.connection(host_id).await?.status())
    }

    /// Buffered history points of a host, oldest first
    pub async fn get_history_buffer(&self, host_id: &str) -> LinkResult<Vec<HistoryPoint>> {
        Ok(self.correlator(host_id).await?.points().await)
    }

    pub async fn history(&self, host_id: &str) -> LinkResult<HistoryView> {
        Ok(self.correlator(host_id).await?.view().await)
    }

    /// Select the history range of a host and request it
    pub async fn set_range(&self, host_id: &str, range: HistoryRange) -> LinkResult<()> {
        self.correlator(host_id)
            .await?
            .set_range(range)
            .await
            .map_err(|_| LinkError::ActorStopped(host_id.to_string()))
    }

    /// Register a callback run after every history change of a host
    pub async fn on_history_update<F>(&self, host_id: &str, observer: F) -> LinkResult<()>
    where
        F: Fn(&HistoryView) + Send + Sync + 'static,
    {
        self.correlator(host_id).await?.on_update(observer);
        Ok(())
    }

    /// Configured hosts, ordered by id
    pub async fn hosts(&self) -> Vec<HostTarget> {
        let hosts = self.hosts.lock().await;
        hosts.values().map(|entry| entry.target.clone()).collect()
    }

    pub async fn contains(&self, host_id: &str) -> bool {
        self.hosts.lock().await.contains_key(host_id)
    }

    pub async fn target(&self, host_id: &str) -> Option<HostTarget> {
        let hosts = self.hosts.lock().await;
        hosts.get(host_id).map(|entry| entry.target.clone())
    }

    /// Stop every actor. The stored host list is left untouched.
    pub async fn shutdown(&self) {
        let mut hosts = self.hosts.lock().await;

        info!("shutting down {} connections", hosts.len());
        for entry in hosts.values() {
            stop_entry(entry).await;
        }
        hosts.clear();
    }

    async fn spawn_entry(&self, target: HostTarget) -> LinkResult<HostEntry> {
        let connection = ConnectionHandle::spawn(
            target.clone(),
            self.connector.clone(),
            self.store.clone(),
            &self.config,
        );
        let correlator =
            CorrelatorHandle::spawn(connection.clone(), HistoryRange::default(), &self.config);

        connection
            .enable()
            .await
            .map_err(|_| LinkError::ActorStopped(target.id.clone()))?;

        Ok(HostEntry {
            target,
            connection,
            correlator,
        })
    }

    async fn connection(&self, host_id: &str) -> LinkResult<ConnectionHandle> {
        let hosts = self.hosts.lock().await;
        hosts
            .get(host_id)
            .map(|entry| entry.connection.clone())
            .ok_or_else(|| LinkError::UnknownHost(host_id.to_string()))
    }

    async fn correlator(&self, host_id: &str) -> LinkResult<CorrelatorHandle> {
        let hosts = self.hosts.lock().await;
        hosts
            .get(host_id)
            .map(|entry| entry.correlator.clone())
            .ok_or_else(|| LinkError::UnknownHost(host_id.to_string()))
    }

    /// Store the host list as it is after `change`, without touching `hosts`
    async fn save(
        &self,
        hosts: &BTreeMap<String, HostEntry>,
        change: PendingChange<'_>,
    ) -> LinkResult<()> {
        let mut targets: BTreeMap<&str, &HostTarget> = hosts
            .iter()
            .map(|(id, entry)| (id.as_str(), &entry.target))
            .collect();

        match change {
            PendingChange::Upsert(target) => {
                targets.insert(target.id.as_str(), target);
            }
            PendingChange::Remove(host_id) => {
                targets.remove(host_id);
            }
        }

        let targets: Vec<HostTarget> = targets.into_values().cloned().collect();
        if let Err(e) = self.repository.save(&targets).await {
            warn!("failed to save host list, keeping running hosts unchanged: {e}");
            return Err(e);
        }
        Ok(())
    }
}

/// Disable and stop both actors of a host
async fn stop_entry(entry: &HostEntry) {
    if let Err(e) = entry.connection.shutdown().await {
        warn!("{}: connection already stopped: {e:#}", entry.target.id);
    }
    if let Err(e) = entry.correlator.shutdown().await {
        warn!("{}: correlator already stopped: {e:#}", entry.target.id);
    }
}
