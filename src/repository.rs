//! Persistence of the configured host list
//!
//! The registry loads its hosts from a [`HostRepository`] on startup and saves
//! the full list after every mutation. Two implementations exist:
//!
//! - [`JsonFileRepository`]: a pretty-printed JSON array on disk
//! - [`MemoryRepository`]: keeps the list in memory (tests, ephemeral setups)

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::HostTarget;
use crate::error::LinkResult;

/// Storage for the list of configured hosts
///
/// Implementations must be `Send + Sync`; the registry shares one instance
/// across tasks.
#[async_trait]
pub trait HostRepository: Send + Sync {
    /// Load every stored host. A repository that was never written is empty.
    async fn load(&self) -> LinkResult<Vec<HostTarget>>;

    /// Replace the stored list with `hosts`
    async fn save(&self, hosts: &[HostTarget]) -> LinkResult<()>;
}

/// Host list stored as a JSON array in a single file
#[derive(Debug, Clone)]
pub struct JsonFileRepository {
    path: PathBuf,
}

impl JsonFileRepository {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl HostRepository for JsonFileRepository {
    async fn load(&self) -> LinkResult<Vec<HostTarget>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("no host list at {}, starting empty", self.path.display());
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        if content.trim().is_empty() {
            return Ok(Vec::new());
        }

        let hosts: Vec<HostTarget> = serde_json::from_str(&content)?;
        debug!("loaded {} hosts from {}", hosts.len(), self.path.display());

        Ok(dedup_by_id(hosts))
    }

    async fn save(&self, hosts: &[HostTarget]) -> LinkResult<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let content = serde_json::to_string_pretty(hosts)?;

        // write next to the target and rename so readers never see half a file
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        debug!("saved {} hosts to {}", hosts.len(), self.path.display());
        Ok(())
    }
}

/// Host list kept in memory only
#[derive(Debug, Default)]
pub struct MemoryRepository {
    hosts: Mutex<Vec<HostTarget>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hosts(hosts: Vec<HostTarget>) -> Self {
        Self {
            hosts: Mutex::new(hosts),
        }
    }

    /// Current contents, as last saved
    pub fn snapshot(&self) -> Vec<HostTarget> {
        self.hosts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl HostRepository for MemoryRepository {
    async fn load(&self) -> LinkResult<Vec<HostTarget>> {
        Ok(dedup_by_id(self.snapshot()))
    }

    async fn save(&self, hosts: &[HostTarget]) -> LinkResult<()> {
        *self
            .hosts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = hosts.to_vec();
        Ok(())
    }
}

/// Keep the last entry for every id, in first-seen order
fn dedup_by_id(hosts: Vec<HostTarget>) -> Vec<HostTarget> {
    let mut unique: Vec<HostTarget> = Vec::with_capacity(hosts.len());

    for host in hosts {
        match unique.iter_mut().find(|existing| existing.id == host.id) {
            Some(existing) => {
                warn!("host {} listed more than once, keeping the last entry", host.id);
                *existing = host;
            }
            None => unique.push(host),
        }
    }

    unique
}
