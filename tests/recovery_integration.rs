//! Integration tests for journal recovery and operation deduplication.

#[allow(dead_code)]
mod common;

use canopy::config::{CanopyConfig, JournalKind};
use canopy::master::{
    CreateFileOptions, DeleteOptions, RenameOptions, ScheduleAsyncPersistenceOptions, SetAttributeOptions,
};
use canopy::mount::MountOptions;
use canopy::types::{Mode, OperationId, PersistenceState};
use canopy::ufs::{DefaultUfsFactory, UfsFactory};
use canopy::{CanopyError, FileSystemMaster};
use common::*;
use std::sync::Arc;

#[tokio::test]
async fn test_restart_replays_namespace() {
    let env = TestEnv::new();
    env.write_file("/a/f", 1500).await;
    env.mkdir_persisted("/p").await;
    env.mkdir("/gone").await;
    env.master
        .mount(&root_ctx(), &path("/mnt"), "mem://ext", MountOptions::default())
        .await
        .unwrap();
    env.master
        .rename(&root_ctx(), &path("/a/f"), &path("/a/g"), RenameOptions::default())
        .await
        .unwrap();
    env.master
        .delete(&root_ctx(), &path("/gone"), DeleteOptions::default())
        .await
        .unwrap();
    env.master
        .set_attribute(
            &root_ctx(),
            &path("/a/g"),
            SetAttributeOptions {
                mode: Some(Mode::new(0o600)),
                pinned: Some(true),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let before = env.info("/a/g").await;

    let master = env.restart();
    let ctx = root_ctx();

    let after = master.get_file_info(&ctx, &path("/a/g")).await.unwrap();
    assert_eq!(after.id, before.id);
    assert_eq!(after.length, 1500);
    assert_eq!(after.block_ids, before.block_ids);
    assert_eq!(after.mode, Mode::new(0o600));
    assert!(after.pinned);
    assert!(after.completed);
    assert!(!master.exists(&ctx, &path("/a/f")).await.unwrap());
    assert!(!master.exists(&ctx, &path("/gone")).await.unwrap());
    assert_eq!(
        master.get_file_info(&ctx, &path("/p")).await.unwrap().persistence_state,
        PersistenceState::Persisted
    );
    let mount = master.get_file_info(&ctx, &path("/mnt")).await.unwrap();
    assert!(mount.mount_point);
    assert_eq!(mount.ufs_path, "mem://ext");
    assert_eq!(master.get_mount_points().len(), 2);

    // New inodes do not collide with replayed ones.
    let created = master
        .create_file(&ctx, &path("/a/new"), CreateFileOptions::default())
        .await
        .unwrap();
    assert!(created.id != before.id && created.id != after.id);
}

#[tokio::test]
async fn test_restart_requeues_files_waiting_for_persistence() {
    let env = TestEnv::new();
    let file = env.write_file("/f", 10).await;
    env.master
        .schedule_async_persistence(&root_ctx(), &path("/f"), ScheduleAsyncPersistenceOptions::default())
        .await
        .unwrap();
    let done = env.write_file("/done", 10).await;

    let master = env.restart();

    assert!(master.persist_queue().is_pending(file.id));
    assert!(!master.persist_queue().is_pending(done.id));
    assert_eq!(
        master.get_file_info(&root_ctx(), &path("/f")).await.unwrap().persistence_state,
        PersistenceState::ToBePersisted
    );
}

#[tokio::test]
async fn test_file_journal_survives_restart() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let mut config = CanopyConfig::testing();
    config.journal.kind = JournalKind::File;
    config.journal.path = temp_dir.path().join("journal").join("canopy.journal");
    let factory: Arc<dyn UfsFactory> = Arc::new(DefaultUfsFactory::new());
    let ctx = root_ctx();

    let id = {
        let master = FileSystemMaster::builder(config.clone())
            .ufs_factory(Arc::clone(&factory))
            .build()
            .unwrap();
        master
            .create_file(
                &ctx,
                &path("/logs/today"),
                CreateFileOptions {
                    recursive: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .id
    };
    assert!(config.journal.path.exists());

    let master = FileSystemMaster::builder(config)
        .ufs_factory(factory)
        .build()
        .unwrap();
    let info = master.get_file_info(&ctx, &path("/logs/today")).await.unwrap();
    assert_eq!(info.id, id);
    assert!(!info.completed);
}

#[tokio::test]
async fn test_journal_outage_fails_the_call() {
    let env = TestEnv::new();
    env.journal.set_available(false);

    let err = env
        .master
        .create_file(&root_ctx(), &path("/f"), CreateFileOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CanopyError::Unavailable(_)), "{:?}", err);

    env.journal.set_available(true);
    env.master
        .create_directory(&root_ctx(), &path("/d"), Default::default())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_retried_rename_is_not_applied_twice() {
    let env = TestEnv::new();
    env.write_file("/a", 0).await;
    let ctx = root_ctx().with_operation_id(OperationId::random());

    env.master
        .rename(&ctx, &path("/a"), &path("/b"), RenameOptions::default())
        .await
        .unwrap();
    env.master
        .rename(&ctx, &path("/a"), &path("/b"), RenameOptions::default())
        .await
        .unwrap();

    assert!(env.exists("/b").await);
    let stats = env.master.operation_cache_stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.entries, 1);

    // Without an operation id the same call is a plain failure.
    let err = env
        .master
        .rename(&root_ctx(), &path("/a"), &path("/b"), RenameOptions::default())
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_retried_create_returns_existing_file() {
    let env = TestEnv::new();
    let ctx = root_ctx().with_operation_id(OperationId::random());

    let first = env
        .master
        .create_file(&ctx, &path("/f"), CreateFileOptions::default())
        .await
        .unwrap();
    let second = env
        .master
        .create_file(&ctx, &path("/f"), CreateFileOptions::default())
        .await
        .unwrap();

    assert_eq!(first.id, second.id);
}

#[tokio::test]
async fn test_retried_delete_succeeds() {
    let env = TestEnv::new();
    env.write_file("/f", 0).await;
    let ctx = root_ctx().with_operation_id(OperationId::random());

    let first = env
        .master
        .delete(&ctx, &path("/f"), DeleteOptions::default())
        .await
        .unwrap();
    let second = env
        .master
        .delete(&ctx, &path("/f"), DeleteOptions::default())
        .await
        .unwrap();

    assert_eq!(first.deleted, vec!["/f".to_string()]);
    assert!(second.deleted.is_empty());
}

#[tokio::test]
async fn test_failed_operation_is_not_recorded() {
    let env = TestEnv::new();
    let ctx = root_ctx().with_operation_id(OperationId::random());

    let err = env
        .master
        .rename(&ctx, &path("/a"), &path("/b"), RenameOptions::default())
        .await
        .unwrap_err();
    assert!(err.is_not_found());

    env.write_file("/a", 0).await;
    env.master
        .rename(&ctx, &path("/a"), &path("/b"), RenameOptions::default())
        .await
        .unwrap();
    assert!(env.exists("/b").await);
}

#[tokio::test]
async fn test_operation_cache_evicts_oldest() {
    let mut config = CanopyConfig::testing();
    config.master.operation_cache_capacity = 1;
    let env = TestEnv::with_config(config);
    env.write_file("/a", 0).await;
    env.write_file("/c", 0).await;
    let first = root_ctx().with_operation_id(OperationId::random());
    let second = root_ctx().with_operation_id(OperationId::random());

    env.master
        .rename(&first, &path("/a"), &path("/b"), RenameOptions::default())
        .await
        .unwrap();
    env.master
        .rename(&second, &path("/c"), &path("/d"), RenameOptions::default())
        .await
        .unwrap();

    let err = env
        .master
        .rename(&first, &path("/a"), &path("/b"), RenameOptions::default())
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}
