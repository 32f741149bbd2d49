use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::ArcSwap;
use imbl::OrdMap;
use tracing::debug;

use crate::chunk::{Chunk, CollectionMetadata};
use crate::error::RoutingError;
use crate::namespace::{CollectionUuid, Namespace, ShardId};
use crate::table::RoutingTable;
use crate::version::{ChunkVersion, Epoch, ShardVersion};

/// Authoritative answer for one namespace, as served by the config server.
#[derive(Debug, Clone)]
pub enum CollectionEntry {
    Unsharded {
        uuid: CollectionUuid,
        primary: ShardId,
    },
    Sharded(CollectionMetadata),
}

/// Where a [`CatalogCache`] loads routing metadata from.
pub trait RoutingSource: Send + Sync {
    /// `Ok(None)` when the namespace does not exist.
    fn fetch_collection(&self, ns: &Namespace) -> Result<Option<CollectionEntry>, RoutingError>;

    /// Chunks of `ns` in `epoch`; with `since`, only chunks whose version is
    /// newer. Fails with `StaleEpoch` if `epoch` is no longer current.
    fn fetch_chunks(
        &self,
        ns: &Namespace,
        epoch: Epoch,
        since: Option<ChunkVersion>,
    ) -> Result<Vec<Chunk>, RoutingError>;
}

/// Cached routing for one namespace.
#[derive(Debug, Clone)]
pub enum RoutingInfo {
    Unsharded {
        namespace: Namespace,
        uuid: CollectionUuid,
        primary: ShardId,
    },
    Sharded(Arc<RoutingTable>),
}

impl RoutingInfo {
    pub fn namespace(&self) -> &Namespace {
        match self {
            RoutingInfo::Unsharded { namespace, .. } => namespace,
            RoutingInfo::Sharded(t) => t.namespace(),
        }
    }

    pub fn uuid(&self) -> CollectionUuid {
        match self {
            RoutingInfo::Unsharded { uuid, .. } => *uuid,
            RoutingInfo::Sharded(t) => t.uuid(),
        }
    }

    pub fn table(&self) -> Option<&Arc<RoutingTable>> {
        match self {
            RoutingInfo::Unsharded { .. } => None,
            RoutingInfo::Sharded(t) => Some(t),
        }
    }

    /// Collection-level version.
    pub fn version(&self) -> ShardVersion {
        match self {
            RoutingInfo::Unsharded { .. } => ShardVersion::Unsharded,
            RoutingInfo::Sharded(t) => ShardVersion::Sharded(t.version()),
        }
    }

    /// Version a request to `shard` must carry.
    pub fn shard_version(&self, shard: &ShardId) -> ShardVersion {
        match self {
            RoutingInfo::Unsharded { .. } => ShardVersion::Unsharded,
            RoutingInfo::Sharded(t) => t.shard_version_for(shard),
        }
    }

    /// Shards that may hold data for this namespace.
    pub fn shards(&self) -> Vec<ShardId> {
        match self {
            RoutingInfo::Unsharded { primary, .. } => vec![primary.clone()],
            RoutingInfo::Sharded(t) => t.shards(),
        }
    }
}

/// Process-local routing cache.
///
/// The whole map is an immutable snapshot behind an `ArcSwap`: readers never
/// block, refreshes build a new entry and swap it in. An entry is only ever
/// replaced wholesale, so a reader sees either the old or the new
/// generation of a collection, never a mix.
pub struct CatalogCache {
    source: Arc<dyn RoutingSource>,
    entries: ArcSwap<OrdMap<Namespace, RoutingInfo>>,
    refreshes: AtomicU64,
}

const MAX_REFRESH_ATTEMPTS: usize = 3;

impl CatalogCache {
    pub fn new(source: Arc<dyn RoutingSource>) -> Self {
        Self {
            source,
            entries: ArcSwap::from_pointee(OrdMap::new()),
            refreshes: AtomicU64::new(0),
        }
    }

    /// Cached routing, loading it on first use.
    pub fn get(&self, ns: &Namespace) -> Result<RoutingInfo, RoutingError> {
        if let Some(info) = self.cached(ns) {
            return Ok(info);
        }
        self.refresh(ns)
    }

    pub fn cached(&self, ns: &Namespace) -> Option<RoutingInfo> {
        self.entries.load().get(ns).cloned()
    }

    /// Re-read `ns` from the source. Same-epoch tables are patched with the
    /// chunks changed since the cached version; anything else is reloaded.
    pub fn refresh(&self, ns: &Namespace) -> Result<RoutingInfo, RoutingError> {
        self.refreshes.fetch_add(1, Ordering::Relaxed);
        let mut last_err = None;
        for _ in 0..MAX_REFRESH_ATTEMPTS {
            match self.load(ns) {
                Ok(info) => return Ok(self.install(info)),
                // The collection changed generation between our two reads.
                Err(e @ RoutingError::StaleEpoch { .. }) => last_err = Some(e),
                Err(RoutingError::NamespaceNotFound(name)) => {
                    self.invalidate(ns);
                    return Err(RoutingError::NamespaceNotFound(name));
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| RoutingError::NamespaceNotFound(ns.to_string())))
    }

    /// Refresh unless the cache already moved past `observed`, the version a
    /// caller saw rejected. Concurrent callers that observed the same stale
    /// version end up sharing one newer snapshot.
    pub fn refresh_if_stale(
        &self,
        ns: &Namespace,
        observed: &ShardVersion,
    ) -> Result<RoutingInfo, RoutingError> {
        if let Some(info) = self.cached(ns)
            && info.version().is_newer_than(observed)
        {
            return Ok(info);
        }
        self.refresh(ns)
    }

    pub fn invalidate(&self, ns: &Namespace) {
        self.entries.rcu(|current| {
            let mut next = (**current).clone();
            next.remove(ns);
            next
        });
    }

    /// Number of refreshes issued, for tests and diagnostics.
    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }

    fn load(&self, ns: &Namespace) -> Result<RoutingInfo, RoutingError> {
        let entry = self
            .source
            .fetch_collection(ns)?
            .ok_or_else(|| RoutingError::NamespaceNotFound(ns.to_string()))?;
        let meta = match entry {
            CollectionEntry::Unsharded { uuid, primary } => {
                return Ok(RoutingInfo::Unsharded {
                    namespace: ns.clone(),
                    uuid,
                    primary,
                });
            }
            CollectionEntry::Sharded(meta) => meta,
        };

        if let Some(RoutingInfo::Sharded(current)) = self.cached(ns)
            && current.epoch() == meta.epoch
        {
            let changes = self
                .source
                .fetch_chunks(ns, meta.epoch, Some(current.version()))?;
            match current.apply_changes(meta.clone(), changes) {
                Ok(table) => return Ok(RoutingInfo::Sharded(Arc::new(table))),
                Err(e) => {
                    debug!(ns = %ns, error = %e, "incremental refresh failed, reloading");
                }
            }
        }

        let chunks = self.source.fetch_chunks(ns, meta.epoch, None)?;
        let table = RoutingTable::new(meta, chunks)?;
        debug!(ns = %ns, version = %table.version(), chunks = table.num_chunks(), "loaded routing table");
        Ok(RoutingInfo::Sharded(Arc::new(table)))
    }

    /// Swap in `fresh` unless a racing refresh already installed something
    /// newer within the same epoch. Returns whatever ends up cached.
    fn install(&self, fresh: RoutingInfo) -> RoutingInfo {
        let ns = fresh.namespace().clone();
        let previous = self.entries.rcu(|current| {
            let mut next = (**current).clone();
            let keep_existing = matches!(
                (current.get(&ns), &fresh),
                (Some(RoutingInfo::Sharded(old)), RoutingInfo::Sharded(new))
                    if old.version().is_newer_than(&new.version())
            );
            if !keep_existing {
                next.insert(ns.clone(), fresh.clone());
            }
            next
        });
        match previous.get(&ns) {
            Some(RoutingInfo::Sharded(old)) => match &fresh {
                RoutingInfo::Sharded(new) if old.version().is_newer_than(&new.version()) => {
                    RoutingInfo::Sharded(old.clone())
                }
                _ => fresh,
            },
            _ => fresh,
        }
    }
}
