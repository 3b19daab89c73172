//! Concurrent registry of proxied clusters
//!
//! Entries are built completely (target plus handler) before they touch the
//! map, and are shared as `Arc<RegistryEntry>`. A reader holding an entry
//! keeps using it even if the name is replaced or removed concurrently, so
//! nobody ever observes a half-updated cluster.

use crate::error::{ConfigError, RegistryError};
use crate::factory::{ProxyFactory, ProxyHandler};
use crate::target::{ClusterSummary, Provenance, ProxyTarget};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, info};

/// A registered cluster with its proxy handler
#[derive(Debug)]
pub struct RegistryEntry {
    target: ProxyTarget,
    handler: ProxyHandler,
}

impl RegistryEntry {
    pub fn target(&self) -> &ProxyTarget {
        &self.target
    }

    pub fn handler(&self) -> &ProxyHandler {
        &self.handler
    }

    pub fn provenance(&self) -> Provenance {
        self.target.provenance()
    }
}

/// Result of re-applying the static cluster list
#[derive(Debug, Clone, Default)]
pub struct ReloadResult {
    /// Newly added clusters
    pub added: Vec<String>,
    /// Static clusters no longer present in the configuration
    pub removed: Vec<String>,
    /// Clusters whose definition was rebuilt
    pub updated: Vec<String>,
    /// Clusters whose new definition was rejected (previous entry kept)
    pub failed: Vec<String>,
}

/// Maps cluster names to their proxy handlers.
///
/// Like the other shared managers, the constructor returns `Arc<Self>`.
pub struct ProxyRegistry {
    entries: DashMap<String, Arc<RegistryEntry>>,
    factory: ProxyFactory,
}

impl ProxyRegistry {
    pub fn new(factory: ProxyFactory) -> Arc<Self> {
        Arc::new(Self {
            entries: DashMap::new(),
            factory,
        })
    }

    /// Register a cluster, replacing an existing entry of the same name.
    ///
    /// Runtime additions may not shadow static or discovered clusters.
    pub fn add(&self, target: ProxyTarget) -> Result<(), RegistryError> {
        let handler = self.factory.build(&target)?;
        let name = target.name().to_string();
        let provenance = target.provenance();
        let server = target.server().to_string();
        let entry = Arc::new(RegistryEntry { target, handler });

        let replaced = match self.entries.entry(name.clone()) {
            Entry::Occupied(mut occupied) => {
                let existing = occupied.get().provenance();
                if provenance == Provenance::RuntimeAdded && existing != Provenance::RuntimeAdded {
                    return Err(RegistryError::Conflict {
                        name,
                        provenance: existing,
                    });
                }
                occupied.insert(entry);
                true
            }
            Entry::Vacant(vacant) => {
                vacant.insert(entry);
                false
            }
        };

        if replaced {
            info!(cluster = %name, %provenance, server = %server, "Replaced cluster proxy");
        } else {
            info!(cluster = %name, %provenance, server = %server, "Created cluster proxy");
        }
        Ok(())
    }

    /// Register a batch of clusters; bad definitions are logged and skipped
    pub fn add_all<I>(&self, targets: I) -> usize
    where
        I: IntoIterator<Item = Result<ProxyTarget, ConfigError>>,
    {
        let mut registered = 0;
        for target in targets {
            match target.map_err(RegistryError::from).and_then(|t| self.add(t)) {
                Ok(()) => registered += 1,
                Err(e) => error!(error = %e, "Error setting up proxy for cluster"),
            }
        }
        registered
    }

    /// Remove a runtime-added cluster
    pub fn remove(&self, name: &str) -> Result<ProxyTarget, RegistryError> {
        match self.entries.entry(name.to_string()) {
            Entry::Occupied(occupied) => {
                let provenance = occupied.get().provenance();
                if provenance != Provenance::RuntimeAdded {
                    return Err(RegistryError::NotRemovable {
                        name: name.to_string(),
                        provenance,
                    });
                }
                let entry = occupied.remove();
                info!(cluster = name, "Removed cluster proxy");
                Ok(entry.target.clone())
            }
            Entry::Vacant(_) => Err(RegistryError::NotFound(name.to_string())),
        }
    }

    /// Look up a cluster by name
    pub fn lookup(&self, name: &str) -> Option<Arc<RegistryEntry>> {
        self.entries.get(name).map(|e| Arc::clone(e.value()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Snapshot of all registered clusters, sorted by name
    pub fn list(&self) -> Vec<ProxyTarget> {
        let mut targets: Vec<ProxyTarget> = self
            .entries
            .iter()
            .map(|e| e.value().target.clone())
            .collect();
        targets.sort_by(|a, b| a.name().cmp(b.name()));
        targets
    }

    /// The `/config` view of all clusters
    pub fn summaries(&self) -> Vec<ClusterSummary> {
        self.list().iter().map(ProxyTarget::summary).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Re-apply the static cluster list from a reloaded configuration.
    ///
    /// Runtime and discovered clusters are never touched.
    pub fn sync_static(&self, definitions: Vec<(String, Result<ProxyTarget, ConfigError>)>) -> ReloadResult {
        let mut result = ReloadResult::default();
        let wanted: HashSet<&str> = definitions.iter().map(|(name, _)| name.as_str()).collect();

        let stale: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.value().provenance() == Provenance::StaticConfig)
            .filter(|e| !wanted.contains(e.key().as_str()))
            .map(|e| e.key().clone())
            .collect();

        for name in stale {
            let removed = self
                .entries
                .remove_if(&name, |_, entry| entry.provenance() == Provenance::StaticConfig);
            if removed.is_some() {
                info!(cluster = %name, "Removing cluster (config reload)");
                result.removed.push(name);
            }
        }

        for (name, definition) in definitions {
            let existed = self.contains(&name);
            match definition.map_err(RegistryError::from).and_then(|t| self.add(t)) {
                Ok(()) if existed => result.updated.push(name),
                Ok(()) => result.added.push(name),
                Err(e) => {
                    error!(cluster = %name, error = %e, "Keeping previous cluster definition");
                    result.failed.push(name);
                }
            }
        }

        info!(
            added = result.added.len(),
            removed = result.removed.len(),
            updated = result.updated.len(),
            failed = result.failed.len(),
            "Static clusters reloaded"
        );

        result
    }
}
