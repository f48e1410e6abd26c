//! Integration tests for mount table operations.

#[allow(dead_code)]
mod common;

use canopy::master::{CreateFileOptions, DeleteOptions, RenameOptions};
use canopy::mount::MountOptions;
use canopy::types::PersistenceState;
use canopy::ufs::{MkdirsOptions, StorageAdapter};
use canopy::CanopyError;
use common::*;

const EXT: &str = "mem://ext";

async fn mount(env: &TestEnv, p: &str, uri: &str) -> u64 {
    env.master
        .mount(&root_ctx(), &path(p), uri, MountOptions::default())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_mount_creates_persisted_mount_point() {
    let env = TestEnv::new();
    let mount_id = mount(&env, "/mnt", EXT).await;

    let info = env.info("/mnt").await;
    assert!(info.is_directory);
    assert!(info.mount_point);
    assert_eq!(info.mount_id, mount_id);
    assert_eq!(info.persistence_state, PersistenceState::Persisted);
    assert_eq!(info.ufs_path, EXT);

    let mounts = env.master.get_mount_points();
    assert_eq!(mounts.len(), 2);
    assert!(mounts.iter().any(|m| m.path == "/mnt" && m.ufs_uri == EXT));

    env.mkdir_persisted("/mnt/dir").await;
    assert!(env.ufs_exists("mem://ext/dir").await);
    assert!(!env.ufs_exists(&ufs_path("/mnt/dir")).await);
    assert_eq!(env.info("/mnt/dir").await.ufs_path, "mem://ext/dir");
}

#[tokio::test]
async fn test_mount_rejects_invalid_targets() {
    let env = TestEnv::new();
    env.mkdir("/d").await;
    env.write_file("/f", 0).await;

    let err = env
        .master
        .mount(&root_ctx(), &path("/"), EXT, MountOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CanopyError::InvalidPath(_)));

    let err = env
        .master
        .mount(&root_ctx(), &path("/d"), EXT, MountOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CanopyError::AlreadyExists(_)));

    let err = env
        .master
        .mount(&root_ctx(), &path("/missing/mnt"), EXT, MountOptions::default())
        .await
        .unwrap_err();
    assert!(err.is_not_found(), "{:?}", err);

    let err = env
        .master
        .mount(&root_ctx(), &path("/f/mnt"), EXT, MountOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CanopyError::NotADirectory(_)));

    let err = env
        .master
        .mount(&root_ctx(), &path("/mnt"), "mem://ext/missing", MountOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CanopyError::InvalidPath(_)));
    assert!(!env.exists("/mnt").await);
    assert_eq!(env.master.get_mount_points().len(), 1);
}

#[tokio::test]
async fn test_mount_rejects_overlapping_under_storage() {
    let env = TestEnv::new();
    mount(&env, "/a", EXT).await;
    env.ufs().mkdirs("mem://ext/sub", &MkdirsOptions::default()).await.unwrap();

    let err = env
        .master
        .mount(&root_ctx(), &path("/b"), "mem://ext/sub", MountOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, CanopyError::InvalidPath(_)));
    assert!(!env.exists("/b").await);
}

#[tokio::test]
async fn test_mount_requires_parent_write() {
    let env = TestEnv::new();

    let err = env
        .master
        .mount(&user_ctx("alice"), &path("/mnt"), EXT, MountOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, CanopyError::AccessDenied(_)));
    assert_eq!(env.master.get_mount_points().len(), 1);
}

#[tokio::test]
async fn test_delete_mount_point_requires_flag() {
    let env = TestEnv::new();
    mount(&env, "/mnt", EXT).await;

    let err = env
        .master
        .delete(
            &root_ctx(),
            &path("/mnt"),
            DeleteOptions {
                recursive: true,
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    match err {
        CanopyError::AccessDenied(message) => assert!(message.contains("/mnt"), "{}", message),
        other => panic!("unexpected error {:?}", other),
    }
    assert!(env.exists("/mnt").await);
}

#[tokio::test]
async fn test_delete_ancestor_of_mount_point_requires_flag() {
    let env = TestEnv::new();
    env.mkdir("/a").await;
    mount(&env, "/a/mnt", EXT).await;

    let err = env
        .master
        .delete(
            &root_ctx(),
            &path("/a"),
            DeleteOptions {
                recursive: true,
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    match err {
        CanopyError::AccessDenied(message) => assert!(message.contains("/a/mnt"), "{}", message),
        other => panic!("unexpected error {:?}", other),
    }
}

#[tokio::test]
async fn test_delete_with_mount_point_flag_unmounts() {
    let env = TestEnv::new();
    mount(&env, "/mnt", EXT).await;
    env.mkdir_persisted("/mnt/dir").await;

    let result = env
        .master
        .delete(
            &root_ctx(),
            &path("/mnt"),
            DeleteOptions {
                recursive: true,
                alluxio_only: true,
                delete_mount_point: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(result.deleted, vec!["/mnt/dir".to_string(), "/mnt".to_string()]);
    assert!(!env.exists("/mnt").await);
    assert_eq!(env.master.get_mount_points().len(), 1);
    assert!(env.ufs_exists("mem://ext/dir").await);
}

#[tokio::test]
async fn test_delete_over_read_only_mount_removes_nothing() {
    let env = TestEnv::new();
    env.mkdir_persisted("/a").await;
    env.mkdir_persisted("/a/sibling").await;
    env.master
        .mount(
            &root_ctx(),
            &path("/a/ro"),
            EXT,
            MountOptions {
                read_only: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let err = env
        .master
        .delete(
            &root_ctx(),
            &path("/a"),
            DeleteOptions {
                recursive: true,
                delete_mount_point: true,
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    match err {
        CanopyError::AccessDenied(message) => {
            assert!(message.contains("Failed to delete children"), "{}", message);
            assert!(message.contains("/a/ro"), "{}", message);
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert!(env.exists("/a/sibling").await);
    assert!(env.exists("/a/ro").await);
    assert_eq!(env.master.get_mount_points().len(), 2);

    // Namespace-only deletes do not touch under storage and may proceed.
    env.master
        .delete(
            &root_ctx(),
            &path("/a"),
            DeleteOptions {
                recursive: true,
                alluxio_only: true,
                delete_mount_point: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(!env.exists("/a").await);
    assert_eq!(env.master.get_mount_points().len(), 1);
}

#[tokio::test]
async fn test_unmount_keeps_under_storage() {
    let env = TestEnv::new();
    mount(&env, "/mnt", EXT).await;
    env.mkdir_persisted("/mnt/dir").await;
    env.write_file("/mnt/dir/cached", 2048).await;

    env.master.unmount(&root_ctx(), &path("/mnt")).await.unwrap();

    assert!(!env.exists("/mnt").await);
    assert!(env.ufs_exists("mem://ext/dir").await);
    assert_eq!(env.master.get_mount_points().len(), 1);
    assert_eq!(env.blocks.deleted_blocks().len(), 2);

    let err = env.master.unmount(&root_ctx(), &path("/mnt")).await.unwrap_err();
    assert!(err.is_not_found(), "{:?}", err);
}

#[tokio::test]
async fn test_unmount_rejects_root_and_plain_directories() {
    let env = TestEnv::new();
    env.mkdir("/d").await;

    let err = env.master.unmount(&root_ctx(), &path("/")).await.unwrap_err();
    assert!(matches!(err, CanopyError::InvalidPath(_)));

    let err = env.master.unmount(&root_ctx(), &path("/d")).await.unwrap_err();
    assert!(matches!(err, CanopyError::InvalidPath(_)));
    assert!(env.exists("/d").await);
}

#[tokio::test]
async fn test_nested_mounts_unmount_innermost_first() {
    let env = TestEnv::new();
    mount(&env, "/mnt", EXT).await;
    mount(&env, "/mnt/inner", "mem://other").await;
    assert_eq!(env.info("/mnt/inner").await.ufs_path, "mem://other");

    let err = env.master.unmount(&root_ctx(), &path("/mnt")).await.unwrap_err();
    assert!(matches!(err, CanopyError::InvalidPath(_)));

    env.master.unmount(&root_ctx(), &path("/mnt/inner")).await.unwrap();
    env.master.unmount(&root_ctx(), &path("/mnt")).await.unwrap();
    assert_eq!(env.master.get_mount_points().len(), 1);
}

#[tokio::test]
async fn test_remount_replaces_under_storage() {
    let env = TestEnv::new();
    let first = mount(&env, "/mnt", EXT).await;

    let second = env
        .master
        .remount(&root_ctx(), &path("/mnt"), "mem://other", MountOptions::default())
        .await
        .unwrap();

    assert_ne!(first, second);
    let info = env.info("/mnt").await;
    assert_eq!(info.mount_id, second);
    assert_eq!(info.ufs_path, "mem://other");

    // Remount of a path that is not mounted is a plain mount.
    env.master
        .remount(&root_ctx(), &path("/fresh"), EXT, MountOptions::default())
        .await
        .unwrap();
    assert!(env.info("/fresh").await.mount_point);
}

#[tokio::test]
async fn test_read_only_mount_rejects_writes() {
    let env = TestEnv::new();
    env.master
        .mount(
            &root_ctx(),
            &path("/ro"),
            EXT,
            MountOptions {
                read_only: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    env.write_file("/f", 0).await;

    let err = env
        .master
        .create_file(&root_ctx(), &path("/ro/f"), CreateFileOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CanopyError::AccessDenied(_)));

    let err = env
        .master
        .rename(&root_ctx(), &path("/f"), &path("/ro/f"), RenameOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CanopyError::AccessDenied(_)));

    // Making the mount writable again lifts the restriction.
    env.master
        .update_mount(&root_ctx(), &path("/ro"), MountOptions::default())
        .await
        .unwrap();
    env.master
        .create_file(&root_ctx(), &path("/ro/f"), CreateFileOptions::default())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_update_mount_requires_mount_point() {
    let env = TestEnv::new();
    env.mkdir("/d").await;

    let err = env
        .master
        .update_mount(&root_ctx(), &path("/d"), MountOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CanopyError::InvalidPath(_)));
}

#[tokio::test]
async fn test_rename_across_mounts_is_rejected() {
    let env = TestEnv::new();
    mount(&env, "/mnt", EXT).await;
    env.mkdir("/mnt/dir").await;

    let err = env
        .master
        .rename(&root_ctx(), &path("/mnt/dir"), &path("/dir"), RenameOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CanopyError::InvalidPath(_)));

    let err = env
        .master
        .rename(&root_ctx(), &path("/mnt"), &path("/moved"), RenameOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CanopyError::InvalidPath(_)));

    // Renames within one mount are fine.
    env.master
        .rename(&root_ctx(), &path("/mnt/dir"), &path("/mnt/renamed"), RenameOptions::default())
        .await
        .unwrap();
    assert!(env.exists("/mnt/renamed").await);
}

#[tokio::test]
async fn test_rename_onto_mount_point_is_rejected() {
    let env = TestEnv::new();
    mount(&env, "/mnt", EXT).await;
    mount(&env, "/mnt/inner", "mem://other").await;
    env.mkdir("/mnt/dir").await;

    let err = env
        .master
        .rename(&root_ctx(), &path("/mnt/dir"), &path("/mnt/inner"), RenameOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CanopyError::InvalidPath(_)));
}
