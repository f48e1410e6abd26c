//! Namespace mutation engine.
//!
//! [`FileSystemMaster`] owns the namespace tree, the lock manager, the mount
//! table and the persistence queue, and implements every namespace
//! operation. Each mutation follows the same shape:
//!
//! 1. Return early when the call's operation id was already applied.
//! 2. Sync the path with under storage (failures are logged only).
//! 3. Open a [`TransactionContext`] and lock the path.
//! 4. Re-validate existence and permissions under the lock.
//! 5. Mutate the tree; every change is journaled through the context.
//! 6. Record the operation id, release the locks, then close the context
//!    (journal flush first, block deletion after).
//!
//! A lock walk that races with a concurrent rename or delete fails with
//! [`CanopyError::PathChanged`]; the whole operation is retried a bounded
//! number of times before the error is surfaced as an invalid path.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

mod attribute;
mod create;
mod delete;
mod free;
mod mount;
mod options;
mod persist;
mod rename;
mod ttl;

pub use options::*;
pub use ttl::TtlChecker;

use crate::block::{BlockMaster, InMemoryBlockMaster};
use crate::config::{CanopyConfig, HeartbeatConfig, JournalKind, MasterConfig, PersistenceConfig};
use crate::dedup::{OperationCache, OperationCacheStats};
use crate::error::{CanopyError, Result};
use crate::heartbeat::{self, HeartbeatHandle};
use crate::job::{InMemoryJobService, JobService};
use crate::journal::{FileJournal, Journal, MemoryJournal, TransactionContext};
use crate::lock::{LockManager, LockPattern, LockStats, PathLockGuard};
use crate::metadata::{FileInfo, Inode, InodeTree, PermissionChecker, UserInfo};
use crate::mount::{MountInfo, MountTable};
use crate::path::NamespacePath;
use crate::persistence::{ExponentialTimer, PersistQueue, PersistRequest, PersistenceChecker, PersistenceScheduler};
use crate::shutdown::ShutdownCoordinator;
use crate::sync::{ActiveSyncManager, MetadataSyncer, NoopSyncer, SyncOptions, SyncStatus};
use crate::types::{DescendantType, InodeId, Mode, ModeBits, OperationId, PersistenceState};
use crate::ufs::{AbsentPathCache, DefaultUfsFactory, UfsFactory, UfsManager};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Cooperative cancellation of a long-running call.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Fail with [`CanopyError::Cancelled`] once cancelled.
    pub fn check(&self, path: &NamespacePath) -> Result<()> {
        if self.is_cancelled() {
            return Err(CanopyError::Cancelled(format!("call cancelled while processing {}", path)));
        }
        Ok(())
    }
}

/// Per-call context: who is calling and how.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub user: UserInfo,
    /// Client token of a retriable call.
    pub operation_id: Option<OperationId>,
    pub sync: SyncOptions,
    pub cancel: CancelToken,
}

impl CallContext {
    pub fn new(user: UserInfo) -> Self {
        Self {
            user,
            operation_id: None,
            sync: SyncOptions::default(),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_operation_id(mut self, id: OperationId) -> Self {
        self.operation_id = Some(id);
        self
    }

    pub fn with_sync(mut self, sync: SyncOptions) -> Self {
        self.sync = sync;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Builder of a [`FileSystemMaster`].
///
/// Collaborators that are not set get in-process defaults: a journal per
/// the configuration, an in-memory block master and job service, a syncer
/// that never syncs, and the default under storage factory.
pub struct FileSystemMasterBuilder {
    config: CanopyConfig,
    journal: Option<Arc<dyn Journal>>,
    block_master: Option<Arc<dyn BlockMaster>>,
    job_service: Option<Arc<dyn JobService>>,
    syncer: Option<Arc<dyn MetadataSyncer>>,
    ufs_factory: Option<Arc<dyn UfsFactory>>,
}

impl FileSystemMasterBuilder {
    pub fn new(config: CanopyConfig) -> Self {
        Self {
            config,
            journal: None,
            block_master: None,
            job_service: None,
            syncer: None,
            ufs_factory: None,
        }
    }

    pub fn journal(mut self, journal: Arc<dyn Journal>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn block_master(mut self, blocks: Arc<dyn BlockMaster>) -> Self {
        self.block_master = Some(blocks);
        self
    }

    pub fn job_service(mut self, jobs: Arc<dyn JobService>) -> Self {
        self.job_service = Some(jobs);
        self
    }

    pub fn syncer(mut self, syncer: Arc<dyn MetadataSyncer>) -> Self {
        self.syncer = Some(syncer);
        self
    }

    pub fn ufs_factory(mut self, factory: Arc<dyn UfsFactory>) -> Self {
        self.ufs_factory = Some(factory);
        self
    }

    /// Build the master and replay its journal.
    pub fn build(self) -> Result<Arc<FileSystemMaster>> {
        self.config.validate()?;
        let CanopyConfig {
            master: config,
            persistence,
            journal: journal_config,
            ..
        } = self.config;

        let journal: Arc<dyn Journal> = match self.journal {
            Some(journal) => journal,
            None => match journal_config.kind {
                JournalKind::Memory => Arc::new(MemoryJournal::new()),
                JournalKind::File => Arc::new(FileJournal::open(&journal_config.path)?),
            },
        };
        let factory = self
            .ufs_factory
            .unwrap_or_else(|| Arc::new(DefaultUfsFactory::new()));
        let ufs_manager = Arc::new(UfsManager::new(factory));
        let mounts = MountTable::new(
            Arc::clone(&ufs_manager),
            &config.root_ufs_uri,
            config.root_mount_options.clone(),
        )?;
        let blocks = self
            .block_master
            .unwrap_or_else(|| Arc::new(InMemoryBlockMaster::new()));
        let jobs = self
            .job_service
            .unwrap_or_else(|| Arc::new(InMemoryJobService::new().with_ufs(Arc::clone(&ufs_manager))));
        let syncer = self.syncer.unwrap_or_else(|| Arc::new(NoopSyncer));

        let tree = Arc::new(InodeTree::new(
            &config.root_owner,
            &config.root_group,
            Mode::new(config.root_mode),
        ));
        let master = FileSystemMaster {
            locks: LockManager::new(Arc::clone(&tree)),
            tree,
            mounts,
            journal,
            blocks,
            jobs,
            syncer,
            sync_manager: ActiveSyncManager::new(),
            permissions: PermissionChecker::new(
                config.permission_enabled,
                config.super_user.clone(),
                config.super_group.clone(),
            ),
            op_cache: OperationCache::new(config.operation_cache_capacity, config.operation_cache_max_age),
            absent_cache: AbsentPathCache::new(config.absent_cache_capacity),
            persist_queue: PersistQueue::new(),
            config,
            persistence,
        };
        master.replay_journal()?;
        Ok(Arc::new(master))
    }
}

/// The namespace master.
pub struct FileSystemMaster {
    config: MasterConfig,
    persistence: PersistenceConfig,
    tree: Arc<InodeTree>,
    locks: LockManager,
    mounts: MountTable,
    journal: Arc<dyn Journal>,
    blocks: Arc<dyn BlockMaster>,
    jobs: Arc<dyn JobService>,
    syncer: Arc<dyn MetadataSyncer>,
    sync_manager: ActiveSyncManager,
    permissions: PermissionChecker,
    op_cache: OperationCache,
    absent_cache: AbsentPathCache,
    persist_queue: PersistQueue,
}

impl FileSystemMaster {
    /// Start building a master from `config`.
    pub fn builder(config: CanopyConfig) -> FileSystemMasterBuilder {
        FileSystemMasterBuilder::new(config)
    }

    fn replay_journal(&self) -> Result<()> {
        let entries = self.journal.replay()?;
        for entry in &entries {
            self.tree.apply(entry)?;
            self.mounts.apply(entry)?;
            self.sync_manager.apply(entry)?;
        }

        let mut requeued = 0;
        for inode in self.tree.snapshot().into_values() {
            if inode.is_file() && inode.persistence_state == PersistenceState::ToBePersisted {
                self.schedule_persist_request(inode.id, None);
                requeued += 1;
            }
        }
        info!(
            entries = entries.len(),
            inodes = self.tree.len(),
            mounts = self.mounts.mount_points().len(),
            requeued,
            "Namespace recovered from journal"
        );
        Ok(())
    }

    /// Start the persistence and TTL heartbeats.
    pub fn start_heartbeats(self: &Arc<Self>, intervals: &HeartbeatConfig, shutdown: &ShutdownCoordinator) -> Vec<HeartbeatHandle> {
        vec![
            heartbeat::spawn(
                Arc::new(PersistenceScheduler::new(Arc::clone(self))),
                intervals.persistence_scheduler_interval,
                shutdown.clone(),
            ),
            heartbeat::spawn(
                Arc::new(PersistenceChecker::new(Arc::clone(self))),
                intervals.persistence_checker_interval,
                shutdown.clone(),
            ),
            heartbeat::spawn(
                Arc::new(TtlChecker::new(Arc::clone(self))),
                intervals.ttl_check_interval,
                shutdown.clone(),
            ),
        ]
    }

    pub fn tree(&self) -> &Arc<InodeTree> {
        &self.tree
    }

    pub fn mount_table(&self) -> &MountTable {
        &self.mounts
    }

    pub fn persist_queue(&self) -> &PersistQueue {
        &self.persist_queue
    }

    pub fn sync_manager(&self) -> &ActiveSyncManager {
        &self.sync_manager
    }

    pub fn absent_cache(&self) -> &AbsentPathCache {
        &self.absent_cache
    }

    pub fn lock_stats(&self) -> LockStats {
        self.locks.stats()
    }

    pub fn operation_cache_stats(&self) -> OperationCacheStats {
        self.op_cache.stats()
    }

    pub fn config(&self) -> &MasterConfig {
        &self.config
    }

    pub(crate) fn persistence_config(&self) -> &PersistenceConfig {
        &self.persistence
    }

    pub(crate) fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub(crate) fn jobs(&self) -> &Arc<dyn JobService> {
        &self.jobs
    }

    /// Context of calls the master makes on its own behalf.
    pub(crate) fn system_context(&self) -> CallContext {
        CallContext::new(UserInfo::new(self.config.super_user.clone(), &[self.config.super_group.as_str()]))
    }

    pub(crate) fn transaction(&self) -> TransactionContext {
        TransactionContext::new(Arc::clone(&self.journal), Arc::clone(&self.blocks))
    }

    /// Run `attempt` until it stops failing with a changed path.
    async fn retry<T, F, Fut>(&self, operation: &'static str, path: &NamespacePath, mut attempt: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.config.lock_retry_attempts.max(1);
        let mut tried = 0;
        loop {
            tried += 1;
            match attempt().await {
                Err(CanopyError::PathChanged(reason)) if tried < attempts => {
                    debug!(operation, path = %path, attempt = tried, reason = %reason, "Path changed while locked, retrying");
                }
                Err(CanopyError::PathChanged(reason)) => {
                    warn!(operation, path = %path, attempts, "Giving up after repeated concurrent modification");
                    return Err(CanopyError::InvalidPath(format!(
                        "{} on {} kept racing with concurrent changes: {}",
                        operation, path, reason
                    )));
                }
                other => return other,
            }
        }
    }

    /// Close `tx` after the call's locks are released.
    ///
    /// A failed close fails a successful call; after a failed call the close
    /// error is only logged.
    async fn finish<T>(&self, tx: TransactionContext, result: Result<T>) -> Result<T> {
        match (result, tx.close().await) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(close)) => {
                warn!(error = %close, "Failed to close transaction of a failed call");
                Err(e)
            }
        }
    }

    /// Whether the call's operation id was already applied.
    fn is_applied(&self, ctx: &CallContext) -> bool {
        match &ctx.operation_id {
            Some(id) if self.op_cache.contains(id) => {
                debug!(operation_id = %id, "Operation already applied");
                true
            }
            _ => false,
        }
    }

    fn record_applied(&self, ctx: &CallContext) {
        if let Some(id) = ctx.operation_id {
            self.op_cache.record(id);
        }
    }

    async fn sync_path(&self, ctx: &CallContext, path: &NamespacePath, descendants: DescendantType) {
        if !ctx.sync.is_enabled() {
            return;
        }
        if self.syncer.sync(path, descendants, &ctx.sync).await == SyncStatus::Failed {
            warn!(path = %path, "Metadata sync failed, proceeding without it");
        }
    }

    /// Check `bits` on the parent of the guarded path.
    fn check_parent_permission(&self, ctx: &CallContext, guard: &PathLockGuard, bits: ModeBits) -> Result<()> {
        let path = guard.path();
        self.permissions
            .check_parent(&ctx.user, &guard.inodes(), path.depth(), bits, path.as_str())
    }

    /// Check `bits` on the guarded target, which must exist.
    fn check_permission(&self, ctx: &CallContext, guard: &PathLockGuard, bits: ModeBits) -> Result<()> {
        guard.target()?;
        self.permissions
            .check_chain(&ctx.user, &guard.inodes(), bits, guard.path().as_str())
    }

    pub(crate) fn file_info(&self, inode: &Inode, path: &NamespacePath) -> Result<FileInfo> {
        let resolution = self.mounts.resolve(path)?;
        Ok(FileInfo::from_inode(
            inode,
            path.as_str(),
            resolution.mount_id,
            resolution.ufs_path,
        ))
    }

    pub(crate) fn new_persist_timer(&self, initial_wait: Option<Duration>) -> ExponentialTimer {
        ExponentialTimer::new(
            self.persistence.initial_interval,
            self.persistence.max_interval,
            initial_wait.unwrap_or(self.persistence.initial_wait),
            self.persistence.max_total_wait,
        )
    }

    /// Queue a persist request with a fresh timer.
    pub(crate) fn schedule_persist_request(&self, file_id: InodeId, initial_wait: Option<Duration>) {
        let request = PersistRequest::new(file_id, self.new_persist_timer(initial_wait));
        if self.persist_queue.schedule(request) {
            debug!(file_id, "Scheduled persist request");
        }
    }

    /// Info of `path` without permission checks, for replies to applied
    /// operations.
    async fn lookup_file_info(&self, path: &NamespacePath) -> Result<FileInfo> {
        let guard = self.locks.lock_path(path, LockPattern::Read).await?;
        let inode = guard.target()?;
        self.file_info(&inode, path)
    }

    /// Info of the file or directory at `path`.
    pub async fn get_file_info(&self, ctx: &CallContext, path: &NamespacePath) -> Result<FileInfo> {
        self.sync_path(ctx, path, DescendantType::None).await;
        self.retry("get_file_info", path, move || async move {
            let guard = self.locks.lock_path(path, LockPattern::Read).await?;
            self.check_permission(ctx, &guard, ModeBits::READ)?;
            self.file_info(&guard.target()?, path)
        })
        .await
    }

    /// Info of a file, or of the children of a directory in name order.
    ///
    /// With `recursive` every descendant is listed in pre-order.
    pub async fn list_status(&self, ctx: &CallContext, path: &NamespacePath, options: ListStatusOptions) -> Result<Vec<FileInfo>> {
        let descendants = if options.recursive {
            DescendantType::All
        } else {
            DescendantType::One
        };
        self.sync_path(ctx, path, descendants).await;
        let options = &options;
        self.retry("list_status", path, move || async move {
            let guard = self.locks.lock_path(path, LockPattern::Read).await?;
            let target = guard.target()?;
            if target.is_file() {
                self.check_permission(ctx, &guard, ModeBits::READ)?;
                return Ok(vec![self.file_info(&target, path)?]);
            }
            self.check_permission(ctx, &guard, ModeBits::READ_EXECUTE)?;
            let mut infos = Vec::new();
            if options.recursive {
                for descendant in guard.lock_descendants().await? {
                    ctx.cancel.check(&descendant.path)?;
                    infos.push(self.file_info(&descendant.inode, &descendant.path)?);
                }
            } else {
                for (name, id) in guard.children()? {
                    if let Some(child) = self.tree.get(id) {
                        infos.push(self.file_info(&child, &path.join(&name)?)?);
                    }
                }
            }
            Ok(infos)
        })
        .await
    }

    /// Whether `path` exists.
    pub async fn exists(&self, ctx: &CallContext, path: &NamespacePath) -> Result<bool> {
        self.sync_path(ctx, path, DescendantType::None).await;
        self.retry("exists", path, move || async move {
            let guard = self.locks.lock_path(path, LockPattern::Read).await?;
            Ok(guard.full_path_exists())
        })
        .await
    }

    /// Every mount, sorted by path.
    pub fn get_mount_points(&self) -> Vec<MountInfo> {
        self.mounts.mount_points()
    }
}
