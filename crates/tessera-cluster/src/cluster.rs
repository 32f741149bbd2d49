use std::sync::Arc;

use arc_swap::ArcSwap;
use bson::Document;
use tessera_routing::{
    CatalogCache, Chunk, ChunkRange, CollectionMetadata, KeyPattern, Namespace, RoutingInfo,
    RoutingSource, ShardId, ShardKey,
};
use tessera_shard::{FailPointMode, FailPoints, LogicalClock, SessionInfo, Shard};
use tracing::{info, warn};

use crate::change_stream::{ChangeStream, ResumeToken};
use crate::config::ClusterConfig;
use crate::config_server::{ConfigServer, PlacementEntry};
use crate::error::ClusterError;
use crate::logs::LogFactory;
use crate::migration::{MigrationManager, MigrationSettings, MoveRangeOutcome};
use crate::registry::ShardRegistry;
use crate::resharding::{ReshardingCoordinator, ReshardingPhase, ReshardingSettings};
use crate::router::Router;
use crate::transaction_coordinator::{CommitDecision, CoordinatorState, TransactionCoordinator};

const CATALOG_LOG: &str = "catalog";
const COORDINATOR_LOG: &str = "coordinator";
const MIGRATION_LOG: &str = "migrations";
const RESHARDING_LOG: &str = "resharding";

/// A whole cluster in one process: config server, shards, coordinators and
/// a default router.
pub struct Cluster {
    config: ClusterConfig,
    clock: Arc<LogicalClock>,
    failpoints: Arc<FailPoints>,
    logs: LogFactory,
    catalog: Arc<ConfigServer>,
    registry: Arc<ShardRegistry>,
    coordinator: Arc<ArcSwap<TransactionCoordinator>>,
    migrations: ArcSwap<MigrationManager>,
    resharding: ArcSwap<ReshardingCoordinator>,
    router: Router,
}

impl Cluster {
    /// Start every component and settle whatever the logs show unfinished.
    pub fn start(config: ClusterConfig) -> Result<Self, ClusterError> {
        let clock = Arc::new(LogicalClock::new());
        let failpoints = Arc::new(FailPoints::new());
        let logs = LogFactory::new(config.data_dir.clone());
        let ids = config.shard_ids();

        let catalog = Arc::new(ConfigServer::open(
            ids.clone(),
            clock.clone(),
            logs.open(CATALOG_LOG)?,
        )?);
        let source: Arc<dyn RoutingSource> = catalog.clone();
        let registry = Arc::new(ShardRegistry::start(
            &ids,
            &config.shard_config(),
            &clock,
            source,
            &failpoints,
        )?);
        let coordinator = Arc::new(ArcSwap::from_pointee(TransactionCoordinator::new(
            registry.clone(),
            clock.clone(),
            failpoints.clone(),
            logs.open(COORDINATOR_LOG)?,
        )));
        let migrations = ArcSwap::from_pointee(MigrationManager::new(
            catalog.clone(),
            registry.clone(),
            failpoints.clone(),
            logs.open(MIGRATION_LOG)?,
            migration_settings(&config),
        ));
        let resharding = ArcSwap::from_pointee(ReshardingCoordinator::new(
            catalog.clone(),
            registry.clone(),
            failpoints.clone(),
            logs.open(RESHARDING_LOG)?,
            resharding_settings(&config),
        ));
        let router = Router::new(
            catalog.clone(),
            registry.clone(),
            coordinator.clone(),
            config.max_stale_retries,
        );

        let cluster = Self {
            config,
            clock,
            failpoints,
            logs,
            catalog,
            registry,
            coordinator,
            migrations,
            resharding,
            router,
        };
        let txns = cluster.coordinator.load().recover()?;
        let moves = cluster.migrations.load().recover()?;
        let reshards = cluster.resharding.load().recover()?;
        if !txns.is_empty() || moves > 0 || !reshards.is_empty() {
            info!(transactions = txns.len(), migrations = moves, resharding = reshards.len(),
                "recovered unfinished operations");
        }
        if cluster.config.background_maintenance {
            cluster.registry.start_maintenance();
        }
        info!(shards = cluster.registry.ids().len(), "cluster started");
        Ok(cluster)
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<LogicalClock> {
        &self.clock
    }

    pub fn catalog(&self) -> &Arc<ConfigServer> {
        &self.catalog
    }

    pub fn logs(&self) -> &LogFactory {
        &self.logs
    }

    /// The cluster's default router.
    pub fn router(&self) -> &Router {
        &self.router
    }

    /// An independent router with its own, initially empty, routing cache.
    pub fn new_router(&self) -> Router {
        Router::new(
            self.catalog.clone(),
            self.registry.clone(),
            self.coordinator.clone(),
            self.config.max_stale_retries,
        )
    }

    pub fn shard(&self, id: &ShardId) -> Result<Arc<Shard>, ClusterError> {
        self.registry.get(id)
    }

    pub fn shard_ids(&self) -> Vec<ShardId> {
        self.registry.ids()
    }

    // ── Catalog operations ──────────────────────────────────────

    /// Shard `ns` on `key_pattern`, creating it first if needed. Existing
    /// documents must all have a valid key.
    pub fn shard_collection(
        &self,
        ns: &Namespace,
        key_pattern: KeyPattern,
        unique: bool,
        split_points: &[ShardKey],
    ) -> Result<CollectionMetadata, ClusterError> {
        if ns.is_internal() || ns.is_resharding_temp() {
            return Err(ClusterError::IllegalOperation(format!("cannot shard {ns}")));
        }
        let record = self.catalog.create_unsharded(ns)?;
        if record.sharding.is_some() {
            return self.catalog.shard_collection(ns, key_pattern, unique, split_points);
        }
        let primary = self.registry.get(&record.primary)?;
        primary.ensure_collection(ns, record.uuid, None)?;
        primary.set_shard_key(ns, key_pattern.clone())?;
        let meta = self
            .catalog
            .shard_collection(ns, key_pattern, unique, split_points)?;
        primary.refresh_filtering(ns)?;
        Ok(meta)
    }

    pub fn split_chunk(&self, ns: &Namespace, at: &ShardKey) -> Result<(Chunk, Chunk), ClusterError> {
        let (left, right) = self.catalog.split_chunk(ns, at)?;
        self.registry.get(&left.shard)?.refresh_filtering(ns)?;
        Ok((left, right))
    }

    pub fn merge_chunks(&self, ns: &Namespace, range: &ChunkRange) -> Result<Chunk, ClusterError> {
        let merged = self.catalog.merge_chunks(ns, range)?;
        self.registry.get(&merged.shard)?.refresh_filtering(ns)?;
        Ok(merged)
    }

    pub fn move_range(
        &self,
        ns: &Namespace,
        range: &ChunkRange,
        to: &ShardId,
    ) -> Result<MoveRangeOutcome, ClusterError> {
        self.migrations.load().move_range(ns, range, to)
    }

    pub fn reshard_collection(
        &self,
        ns: &Namespace,
        key_pattern: KeyPattern,
        split_points: &[ShardKey],
    ) -> Result<CollectionMetadata, ClusterError> {
        self.resharding
            .load()
            .reshard_collection(ns, key_pattern, split_points)
    }

    pub fn abort_reshard_collection(&self, ns: &Namespace) -> Result<(), ClusterError> {
        self.resharding.load().abort_reshard_collection(ns)
    }

    pub fn resharding_phase(&self, ns: &Namespace) -> Result<Option<ReshardingPhase>, ClusterError> {
        self.resharding.load().phase(ns)
    }

    /// Delete every orphaned document of `ns` whose range is not still
    /// waiting on a migration. Returns how many were removed.
    pub fn cleanup_orphaned(&self, ns: &Namespace) -> Result<u64, ClusterError> {
        let mut deleted = 0;
        for shard in self.registry.all() {
            deleted += shard.cleanup_orphaned(ns)?;
        }
        Ok(deleted)
    }

    /// Drop `ns` everywhere. Returns whether anything existed.
    pub fn drop_collection(&self, ns: &Namespace) -> Result<bool, ClusterError> {
        if self.resharding.load().phase(ns)?.is_some() {
            return Err(ClusterError::ConflictingOperation(format!(
                "{ns} is being resharded"
            )));
        }
        let mut existed = self.catalog.drop_collection(ns)?;
        for shard in self.registry.all() {
            existed |= shard.drop_collection(ns, false)?;
            shard.refresh_filtering(ns)?;
        }
        info!(ns = %ns, existed, "dropped collection");
        Ok(existed)
    }

    /// Authoritative routing for `ns`, read straight from the catalog.
    pub fn routing_info(&self, ns: &Namespace) -> Result<RoutingInfo, ClusterError> {
        let source: Arc<dyn RoutingSource> = self.catalog.clone();
        Ok(CatalogCache::new(source).get(ns)?)
    }

    pub fn chunks(&self, ns: &Namespace) -> Result<Vec<Chunk>, ClusterError> {
        self.catalog.chunks(ns)
    }

    /// `config.chunks`-style listing of `ns`.
    pub fn chunk_documents(&self, ns: &Namespace) -> Result<Vec<Document>, ClusterError> {
        let info = self.routing_info(ns)?;
        let Some(table) = info.table() else {
            return Ok(Vec::new());
        };
        Ok(table
            .chunks()
            .map(|c| c.to_document(ns, table.key_pattern()))
            .collect())
    }

    pub fn placement_history(&self, ns: &Namespace) -> Result<Vec<PlacementEntry>, ClusterError> {
        self.catalog.placement_history(ns)
    }

    // ── Change streams ─────────────────────────────────────────

    /// Watch `ns` from now on, or from just after `resume_after`.
    pub fn open_change_stream(
        &self,
        ns: &Namespace,
        resume_after: Option<ResumeToken>,
    ) -> Result<ChangeStream, ClusterError> {
        if ns.is_internal() {
            return Err(ClusterError::IllegalOperation(format!("cannot watch {ns}")));
        }
        Ok(ChangeStream::open(
            self.catalog.clone(),
            self.registry.clone(),
            ns.clone(),
            resume_after,
            self.clock.now(),
        ))
    }

    // ── Fault injection and restarts ────────────────────────────

    pub fn configure_failpoint(&self, name: &str, mode: FailPointMode, data: Option<Document>) {
        self.failpoints.configure(name, mode, data);
    }

    pub fn failpoint_hits(&self, name: &str) -> u64 {
        self.failpoints.hits(name)
    }

    pub fn coordinator_state(&self, session: &SessionInfo) -> Option<CoordinatorState> {
        self.coordinator.load().state(session)
    }

    /// Replace the transaction coordinator with one rebuilt from its log,
    /// finishing every transaction the old one left open.
    pub fn restart_transaction_coordinator(
        &self,
    ) -> Result<Vec<(SessionInfo, CommitDecision)>, ClusterError> {
        let fresh = Arc::new(TransactionCoordinator::new(
            self.registry.clone(),
            self.clock.clone(),
            self.failpoints.clone(),
            self.logs.open(COORDINATOR_LOG)?,
        ));
        self.coordinator.store(fresh.clone());
        let recovered = fresh.recover()?;
        info!(recovered = recovered.len(), "transaction coordinator restarted");
        Ok(recovered)
    }

    pub fn restart_migration_manager(&self) -> Result<usize, ClusterError> {
        let fresh = Arc::new(MigrationManager::new(
            self.catalog.clone(),
            self.registry.clone(),
            self.failpoints.clone(),
            self.logs.open(MIGRATION_LOG)?,
            migration_settings(&self.config),
        ));
        self.migrations.store(fresh.clone());
        let settled = fresh.recover()?;
        info!(settled, "migration manager restarted");
        Ok(settled)
    }

    pub fn restart_resharding_coordinator(
        &self,
    ) -> Result<Vec<(Namespace, ReshardingPhase)>, ClusterError> {
        let fresh = Arc::new(ReshardingCoordinator::new(
            self.catalog.clone(),
            self.registry.clone(),
            self.failpoints.clone(),
            self.logs.open(RESHARDING_LOG)?,
            resharding_settings(&self.config),
        ));
        self.resharding.store(fresh.clone());
        let resumed = fresh.recover()?;
        info!(resumed = resumed.len(), "resharding coordinator restarted");
        Ok(resumed)
    }

    // ── Maintenance ─────────────────────────────────────────────

    /// One synchronous maintenance pass over every shard, the same work the
    /// background threads do. Returns the orphans deleted.
    pub fn run_maintenance(&self, ignore_delay: bool) -> Result<u64, ClusterError> {
        let mut deleted = 0;
        for shard in self.registry.all() {
            deleted += shard.run_range_deletions(ignore_delay)?;
            shard.expire_transactions();
            shard.trim_oplog()?;
        }
        Ok(deleted)
    }

    pub fn shutdown(&self) {
        self.registry.stop_maintenance();
        info!("cluster stopped");
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.registry.stop_maintenance();
    }
}

fn migration_settings(config: &ClusterConfig) -> MigrationSettings {
    if config.migration_max_catchup_rounds == 0 {
        warn!("migration_max_catchup_rounds is 0; migrations go straight to their critical section");
    }
    MigrationSettings {
        catchup_threshold: config.migration_catchup_threshold,
        max_catchup_rounds: config.migration_max_catchup_rounds,
        orphan_cleanup_delay: config.orphan_cleanup_delay(),
        critical_section_timeout: config.critical_section_timeout(),
    }
}

fn resharding_settings(config: &ClusterConfig) -> ReshardingSettings {
    ReshardingSettings {
        catchup_threshold: config.resharding_catchup_threshold,
        max_catchup_rounds: config.migration_max_catchup_rounds,
        critical_section_timeout: config.critical_section_timeout(),
    }
}
