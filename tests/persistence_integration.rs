//! Integration tests for the asynchronous persistence pipeline.

#[allow(dead_code)]
mod common;

use canopy::config::CanopyConfig;
use canopy::heartbeat::HeartbeatExecutor;
use canopy::job::JobStatus;
use canopy::master::{DeleteOptions, FreeOptions, ScheduleAsyncPersistenceOptions, SetAttributeOptions, TtlChecker};
use canopy::mount::MountOptions;
use canopy::types::{PersistenceState, TtlAction, NO_TTL};
use canopy::CanopyError;
use canopy::ufs::StorageAdapter;
use common::*;
use std::sync::Arc;
use std::time::Duration;

async fn schedule(env: &TestEnv, p: &str) {
    env.master
        .schedule_async_persistence(&root_ctx(), &path(p), ScheduleAsyncPersistenceOptions::default())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_persist_file_end_to_end() {
    let env = TestEnv::new();
    let file = env.write_file("/d/f", 100).await;
    schedule(&env, "/d/f").await;
    assert_eq!(env.info("/d/f").await.persistence_state, PersistenceState::ToBePersisted);
    assert!(env.master.persist_queue().is_pending(file.id));

    env.run_scheduler().await;
    let queue = env.master.persist_queue();
    assert!(queue.is_tracked(file.id));
    let submitted = env.jobs.submitted();
    assert_eq!(submitted.len(), 1);
    let (job_id, spec) = &submitted[0];
    assert_eq!(queue.job_id(file.id), Some(*job_id));
    assert_eq!(spec.length, 100);
    assert_eq!(spec.path, "/d/f");

    env.materialize(*job_id);
    env.run_checker().await;

    assert_eq!(queue.tracked_len(), 0);
    let info = env.info("/d/f").await;
    assert_eq!(info.persistence_state, PersistenceState::Persisted);
    assert!(!info.ufs_fingerprint.is_empty());
    assert_eq!(env.info("/d").await.persistence_state, PersistenceState::Persisted);
    assert!(env.ufs_exists(&ufs_path("/d/f")).await);
    assert!(!env.ufs_exists(&spec.ufs_path).await);
}

#[tokio::test]
async fn test_persist_job_writes_unique_temporary_object() {
    let env = TestEnv::new();
    env.write_file("/f", 10).await;
    env.write_file("/g", 10).await;
    schedule(&env, "/f").await;
    schedule(&env, "/g").await;

    env.run_scheduler().await;

    let submitted = env.jobs.submitted();
    assert_eq!(submitted.len(), 2);
    let temp_dir = ufs_path("/.persist_tmp");
    for (_, spec) in &submitted {
        let name = spec.path.trim_start_matches('/');
        assert!(spec.ufs_path.starts_with(&format!("{}/{}.", temp_dir, name)), "{}", spec.ufs_path);
        assert!(spec.ufs_path.ends_with(".tmp"));
    }
    assert_ne!(submitted[0].1.ufs_path, submitted[1].1.ufs_path);
    assert!(env.ufs_exists(&temp_dir).await);
}

#[tokio::test]
async fn test_schedule_requires_completed_file() {
    let env = TestEnv::new();
    env.master
        .create_file(&root_ctx(), &path("/f"), Default::default())
        .await
        .unwrap();

    let err = env
        .master
        .schedule_async_persistence(&root_ctx(), &path("/f"), ScheduleAsyncPersistenceOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CanopyError::PreconditionFailed(_)));
}

#[tokio::test]
async fn test_schedule_persisted_file_is_noop() {
    let env = TestEnv::new();
    let file = env.write_persisted_file("/f", 10).await;

    schedule(&env, "/f").await;

    assert_eq!(env.info("/f").await.persistence_state, PersistenceState::Persisted);
    assert!(!env.master.persist_queue().is_pending(file.id));
}

#[tokio::test(start_paused = true)]
async fn test_failed_job_is_requeued_with_its_timer() {
    let env = TestEnv::new();
    let file = env.write_file("/f", 10).await;
    schedule(&env, "/f").await;
    env.run_scheduler().await;
    let queue = env.master.persist_queue();
    let job_id = queue.job_id(file.id).unwrap();
    env.jobs.script(
        job_id,
        vec![
            JobStatus::Created,
            JobStatus::Running,
            JobStatus::Failed("worker lost".to_string()),
        ],
    );

    env.run_checker().await;
    env.run_checker().await;
    assert!(queue.is_tracked(file.id));

    env.run_checker().await;
    assert!(!queue.is_tracked(file.id));
    assert!(queue.is_pending(file.id));
    assert_eq!(env.info("/f").await.persistence_state, PersistenceState::ToBePersisted);

    // The request keeps the timer of the first submission.
    let request = queue.take_pending(file.id).unwrap();
    assert_eq!(request.timer.attempts(), 1);
    assert_eq!(request.timer.current_interval(), Duration::from_millis(20));
    queue.requeue(request);

    // No time has passed since the first attempt.
    env.run_scheduler().await;
    assert_eq!(env.jobs.submitted().len(), 1);
    assert!(queue.is_pending(file.id));

    tokio::time::advance(Duration::from_millis(10)).await;
    env.run_scheduler().await;
    assert_eq!(env.jobs.submitted().len(), 2);
    let retry_job = queue.job_id(file.id).unwrap();
    assert_ne!(retry_job, job_id);
    assert_eq!(queue.tracked(file.id).unwrap().timer.attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_expired_request_demotes_file() {
    let mut config = CanopyConfig::testing();
    config.persistence.max_total_wait = Duration::from_millis(50);
    let env = TestEnv::with_config(config);
    let file = env.write_file("/f", 10).await;
    schedule(&env, "/f").await;

    tokio::time::advance(Duration::from_millis(60)).await;
    env.run_scheduler().await;

    let queue = env.master.persist_queue();
    assert!(!queue.is_pending(file.id));
    assert!(!queue.is_tracked(file.id));
    assert!(env.jobs.submitted().is_empty());
    assert_eq!(env.info("/f").await.persistence_state, PersistenceState::NotPersisted);
}

#[tokio::test(start_paused = true)]
async fn test_initial_wait_delays_first_submission() {
    let env = TestEnv::new();
    let file = env.write_file("/f", 10).await;
    env.master
        .schedule_async_persistence(
            &root_ctx(),
            &path("/f"),
            ScheduleAsyncPersistenceOptions {
                initial_wait: Some(Duration::from_secs(5)),
            },
        )
        .await
        .unwrap();

    env.run_scheduler().await;
    assert!(env.jobs.submitted().is_empty());
    assert!(env.master.persist_queue().is_pending(file.id));

    tokio::time::advance(Duration::from_secs(5)).await;
    env.run_scheduler().await;
    assert_eq!(env.jobs.submitted().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_resource_exhaustion_backs_off_globally() {
    let mut config = CanopyConfig::testing();
    config.persistence.max_quiet_period = Duration::from_millis(1500);
    let env = TestEnv::with_config(config);
    let first = env.write_file("/a", 10).await;
    let second = env.write_file("/b", 10).await;
    schedule(&env, "/a").await;
    schedule(&env, "/b").await;
    let scheduler = env.scheduler();
    let queue = env.master.persist_queue();

    env.jobs.reject_next(2);
    scheduler.heartbeat().await.unwrap();
    assert_eq!(scheduler.quiet_period(), Duration::from_secs(1));
    assert!(queue.is_pending(first.id));
    assert!(queue.is_pending(second.id));
    assert!(env.jobs.submitted().is_empty());

    scheduler.heartbeat().await.unwrap();
    assert_eq!(scheduler.quiet_period(), Duration::from_millis(1500));
    assert!(env.jobs.submitted().is_empty());

    // Every successful submission halves the quiet period.
    scheduler.heartbeat().await.unwrap();
    assert_eq!(env.jobs.submitted().len(), 2);
    assert_eq!(scheduler.quiet_period(), Duration::from_millis(375));
    assert!(queue.is_tracked(first.id));
    assert!(queue.is_tracked(second.id));
}

#[tokio::test]
async fn test_delete_cancels_submitted_job() {
    let env = TestEnv::new();
    let file = env.write_file("/f", 10).await;
    schedule(&env, "/f").await;
    env.run_scheduler().await;
    let queue = env.master.persist_queue();
    let job_id = queue.job_id(file.id).unwrap();

    env.master
        .delete(&root_ctx(), &path("/f"), DeleteOptions::default())
        .await
        .unwrap();
    assert!(queue.is_tracked(file.id));

    env.run_checker().await;

    assert!(!queue.is_tracked(file.id));
    assert!(!queue.is_pending(file.id));
    assert_eq!(env.jobs.last_status(job_id), Some(JobStatus::Canceled));
}

#[tokio::test]
async fn test_length_mismatch_retries_and_removes_temporary_object() {
    let env = TestEnv::new();
    let file = env.write_file("/f", 100).await;
    schedule(&env, "/f").await;
    env.run_scheduler().await;
    let (_, spec) = env.jobs.submitted().remove(0);
    env.ufs().write_file(&spec.ufs_path, 7);

    env.run_checker().await;

    let queue = env.master.persist_queue();
    assert!(queue.is_pending(file.id));
    assert!(!env.ufs_exists(&spec.ufs_path).await);
    assert!(!env.ufs_exists(&ufs_path("/f")).await);
    assert_eq!(env.info("/f").await.persistence_state, PersistenceState::ToBePersisted);
}

#[tokio::test]
async fn test_read_only_mount_keeps_request() {
    let env = TestEnv::new();
    env.master
        .mount(&root_ctx(), &path("/m"), "mem://ext", MountOptions::default())
        .await
        .unwrap();
    let file = env.write_file("/m/f", 10).await;
    schedule(&env, "/m/f").await;
    env.master
        .update_mount(
            &root_ctx(),
            &path("/m"),
            MountOptions {
                read_only: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    env.run_scheduler().await;

    assert!(env.jobs.submitted().is_empty());
    assert!(env.master.persist_queue().is_pending(file.id));
}

#[tokio::test]
async fn test_object_store_direct_persist() {
    let mut config = CanopyConfig::testing();
    config.persistence.object_store_direct_persist = true;
    let env = TestEnv::with_config(config);
    env.master
        .mount(&root_ctx(), &path("/s3"), "obj://bucket", MountOptions::default())
        .await
        .unwrap();
    env.write_file("/s3/dir/f", 10).await;
    schedule(&env, "/s3/dir/f").await;

    env.run_scheduler().await;
    let (job_id, spec) = env.jobs.submitted().remove(0);
    assert_eq!(spec.ufs_path, "obj://bucket/dir/f");
    env.materialize(job_id);
    env.run_checker().await;

    assert_eq!(env.info("/s3/dir/f").await.persistence_state, PersistenceState::Persisted);
    assert!(env.object_store().exists("obj://bucket/dir/f").await.unwrap());
    assert!(env.object_store().paths().iter().all(|p| !p.contains(".persist_tmp")));
}

#[tokio::test]
async fn test_complete_file_can_schedule_persistence() {
    let env = TestEnv::new();
    let ctx = root_ctx();
    let created = env
        .master
        .create_file(&ctx, &path("/f"), Default::default())
        .await
        .unwrap();

    env.master
        .complete_file(
            &ctx,
            &path("/f"),
            canopy::master::CompleteFileOptions {
                async_persist: Some(ScheduleAsyncPersistenceOptions::default()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert!(env.master.persist_queue().is_pending(created.id));
    env.persist_all().await;
    assert_eq!(env.info("/f").await.persistence_state, PersistenceState::Persisted);
}

#[tokio::test]
async fn test_ttl_checker_deletes_expired_file() {
    let env = TestEnv::new();
    env.master
        .create_file(
            &root_ctx(),
            &path("/d/f"),
            canopy::master::CreateFileOptions {
                recursive: true,
                ttl: 1,
                ttl_action: TtlAction::Delete,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    env.write_file("/d/keep", 0).await;
    tokio::time::sleep(Duration::from_millis(5)).await;

    TtlChecker::new(Arc::clone(&env.master)).heartbeat().await.unwrap();

    assert!(!env.exists("/d/f").await);
    assert!(env.exists("/d/keep").await);
}

#[tokio::test]
async fn test_ttl_checker_frees_and_clears_ttl() {
    let env = TestEnv::new();
    env.write_persisted_file("/f", 10).await;
    env.master
        .set_attribute(
            &root_ctx(),
            &path("/f"),
            SetAttributeOptions {
                ttl: Some(1),
                ttl_action: Some(TtlAction::Free),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    TtlChecker::new(Arc::clone(&env.master)).heartbeat().await.unwrap();

    let info = env.info("/f").await;
    assert_eq!(info.ttl, NO_TTL);
    assert_eq!(info.ttl_action, TtlAction::Delete);
    assert!(env.ufs_exists(&ufs_path("/f")).await);

    // Freeing again is still allowed since the file stays persisted.
    env.master
        .free(&root_ctx(), &path("/f"), FreeOptions::default())
        .await
        .unwrap();
}
