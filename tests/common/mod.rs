//! Common test utilities for integration tests.

use canopy::block::{BlockMaster, InMemoryBlockMaster};
use canopy::config::CanopyConfig;
use canopy::heartbeat::HeartbeatExecutor;
use canopy::job::{InMemoryJobService, JobService};
use canopy::journal::{Journal, MemoryJournal};
use canopy::master::{CompleteFileOptions, CreateDirectoryOptions, CreateFileOptions, FileSystemMaster};
use canopy::metadata::{FileInfo, UserInfo};
use canopy::persistence::{PersistenceChecker, PersistenceScheduler};
use canopy::types::JobId;
use canopy::ufs::{DefaultUfsFactory, MemoryUfs, StorageAdapter, UfsFactory, OBJECT_SCHEME};
use canopy::{CallContext, NamespacePath};
use std::sync::Arc;
use tempfile::TempDir;

/// Under storage URI of the root mount in tests.
pub const ROOT_UFS: &str = "mem://root";

pub fn path(p: &str) -> NamespacePath {
    NamespacePath::new(p).expect("valid test path")
}

/// Under storage path of a namespace path below the root mount.
pub fn ufs_path(p: &str) -> String {
    format!("{}{}", ROOT_UFS, p)
}

/// Context of the super user.
pub fn root_ctx() -> CallContext {
    CallContext::new(UserInfo::new("root", &["supergroup"]))
}

/// Context of an ordinary user whose primary group has the same name.
pub fn user_ctx(name: &str) -> CallContext {
    CallContext::new(UserInfo::new(name, &[name]))
}

/// A master wired to in-memory collaborators the test can inspect.
pub struct TestEnv {
    pub temp_dir: TempDir,
    pub config: CanopyConfig,
    pub factory: Arc<DefaultUfsFactory>,
    pub blocks: Arc<InMemoryBlockMaster>,
    pub jobs: Arc<InMemoryJobService>,
    pub journal: Arc<MemoryJournal>,
    pub master: Arc<FileSystemMaster>,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_config(CanopyConfig::testing())
    }

    pub fn with_config(config: CanopyConfig) -> Self {
        canopy::observability::init_for_tests();
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let factory = Arc::new(DefaultUfsFactory::new());
        let blocks = Arc::new(InMemoryBlockMaster::new());
        let jobs = Arc::new(InMemoryJobService::new());
        let journal = Arc::new(MemoryJournal::new());
        let master = Self::build(&config, &factory, &blocks, &jobs, &journal);
        Self {
            temp_dir,
            config,
            factory,
            blocks,
            jobs,
            journal,
            master,
        }
    }

    fn build(
        config: &CanopyConfig,
        factory: &Arc<DefaultUfsFactory>,
        blocks: &Arc<InMemoryBlockMaster>,
        jobs: &Arc<InMemoryJobService>,
        journal: &Arc<MemoryJournal>,
    ) -> Arc<FileSystemMaster> {
        FileSystemMaster::builder(config.clone())
            .ufs_factory(Arc::clone(factory) as Arc<dyn UfsFactory>)
            .block_master(Arc::clone(blocks) as Arc<dyn BlockMaster>)
            .job_service(Arc::clone(jobs) as Arc<dyn JobService>)
            .journal(Arc::clone(journal) as Arc<dyn Journal>)
            .build()
            .expect("Failed to build master")
    }

    /// A fresh master recovered from this environment's journal.
    pub fn restart(&self) -> Arc<FileSystemMaster> {
        Self::build(&self.config, &self.factory, &self.blocks, &self.jobs, &self.journal)
    }

    /// The store behind every `mem://` URI.
    pub fn ufs(&self) -> Arc<MemoryUfs> {
        self.factory.memory()
    }

    /// The store behind every `obj://` URI.
    pub fn object_store(&self) -> Arc<MemoryUfs> {
        self.factory.object()
    }

    pub async fn ufs_exists(&self, ufs_path: &str) -> bool {
        self.ufs().exists(ufs_path).await.expect("ufs exists")
    }

    pub async fn mkdir(&self, p: &str) -> u64 {
        self.master
            .create_directory(
                &root_ctx(),
                &path(p),
                CreateDirectoryOptions {
                    recursive: true,
                    ..Default::default()
                },
            )
            .await
            .expect("create directory")
    }

    /// Create a directory that also exists in under storage.
    pub async fn mkdir_persisted(&self, p: &str) -> u64 {
        self.master
            .create_directory(
                &root_ctx(),
                &path(p),
                CreateDirectoryOptions {
                    recursive: true,
                    persisted: true,
                    ..Default::default()
                },
            )
            .await
            .expect("create persisted directory")
    }

    /// Create and complete a namespace-only file of `length` bytes.
    pub async fn write_file(&self, p: &str, length: u64) -> FileInfo {
        let ctx = root_ctx();
        let target = path(p);
        self.master
            .create_file(
                &ctx,
                &target,
                CreateFileOptions {
                    recursive: true,
                    ..Default::default()
                },
            )
            .await
            .expect("create file");
        let block_size = self.config.master.block_size_bytes;
        let mut remaining = length;
        while remaining > 0 {
            let block = self
                .master
                .get_new_block_id_for_file(&ctx, &target)
                .await
                .expect("allocate block");
            let len = remaining.min(block_size);
            self.blocks.commit_block(block, len);
            remaining -= len;
        }
        self.master
            .complete_file(&ctx, &target, CompleteFileOptions::default())
            .await
            .expect("complete file");
        self.info(p).await
    }

    /// Create a file written through to under storage.
    pub async fn write_persisted_file(&self, p: &str, length: u64) -> FileInfo {
        let ctx = root_ctx();
        let target = path(p);
        self.master
            .create_file(
                &ctx,
                &target,
                CreateFileOptions {
                    recursive: true,
                    persisted: true,
                    ..Default::default()
                },
            )
            .await
            .expect("create persisted file");
        self.ufs().write_file(&ufs_path(p), length);
        self.master
            .complete_file(
                &ctx,
                &target,
                CompleteFileOptions {
                    ufs_length: length as i64,
                    ..Default::default()
                },
            )
            .await
            .expect("complete persisted file");
        self.info(p).await
    }

    pub async fn info(&self, p: &str) -> FileInfo {
        self.master
            .get_file_info(&root_ctx(), &path(p))
            .await
            .expect("file info")
    }

    pub async fn exists(&self, p: &str) -> bool {
        self.master.exists(&root_ctx(), &path(p)).await.expect("exists")
    }

    pub fn scheduler(&self) -> PersistenceScheduler {
        PersistenceScheduler::new(Arc::clone(&self.master))
    }

    pub fn checker(&self) -> PersistenceChecker {
        PersistenceChecker::new(Arc::clone(&self.master))
    }

    pub async fn run_scheduler(&self) {
        self.scheduler().heartbeat().await.expect("scheduler heartbeat");
    }

    pub async fn run_checker(&self) {
        self.checker().heartbeat().await.expect("checker heartbeat");
    }

    /// Write the output object of a submitted job, as a real job would.
    pub fn materialize(&self, job_id: JobId) {
        let (_, spec) = self
            .jobs
            .submitted()
            .into_iter()
            .find(|(id, _)| *id == job_id)
            .expect("submitted job");
        let store = if spec.ufs_path.starts_with(OBJECT_SCHEME) {
            self.object_store()
        } else {
            self.ufs()
        };
        store.write_file(&spec.ufs_path, spec.length);
    }

    /// Submit, materialize and finalize every pending persist request.
    pub async fn persist_all(&self) {
        self.run_scheduler().await;
        let queue = self.master.persist_queue();
        for file_id in queue.tracked_ids() {
            if let Some(job_id) = queue.job_id(file_id) {
                self.materialize(job_id);
            }
        }
        self.run_checker().await;
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}
