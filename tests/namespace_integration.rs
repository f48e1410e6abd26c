//! Integration tests for namespace mutations.

#[allow(dead_code)]
mod common;

use canopy::acl::{AclEntry, SetAclAction};
use canopy::config::CanopyConfig;
use canopy::master::{
    CompleteFileOptions, CreateDirectoryOptions, CreateFileOptions, DeleteOptions, FreeOptions, ListStatusOptions,
    RenameOptions, SetAclOptions, SetAttributeOptions,
};
use canopy::types::{Mode, ModeBits, PersistenceState, ETAG_XATTR_KEY};
use canopy::ufs::UfsOperation;
use canopy::CanopyError;
use common::*;

#[tokio::test]
async fn test_create_file_without_parent_is_not_found() {
    let env = TestEnv::new();

    let err = env
        .master
        .create_file(&root_ctx(), &path("/a/b.txt"), CreateFileOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, CanopyError::NotFound(ref p) if p == "/a"), "{:?}", err);
    assert!(!env.exists("/a").await);
}

#[tokio::test]
async fn test_create_file_recursive_creates_parents() {
    let env = TestEnv::new();

    let info = env
        .master
        .create_file(
            &root_ctx(),
            &path("/a/b/c.txt"),
            CreateFileOptions {
                recursive: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert!(!info.is_directory);
    assert!(!info.completed);
    assert_eq!(info.mode, Mode::FILE_DEFAULT);
    assert_eq!(info.owner, "root");
    assert_eq!(info.persistence_state, PersistenceState::NotPersisted);
    assert!(env.info("/a").await.is_directory);
    assert!(env.info("/a/b").await.is_directory);
    // Nothing reaches under storage for a namespace-only file.
    assert!(!env.ufs_exists(&ufs_path("/a")).await);
}

#[tokio::test]
async fn test_create_existing_file() {
    let env = TestEnv::new();
    env.write_file("/f", 10).await;

    let err = env
        .master
        .create_file(&root_ctx(), &path("/f"), CreateFileOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CanopyError::AlreadyExists(_)));

    let err = env
        .master
        .create_file(&root_ctx(), &path("/"), CreateFileOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CanopyError::AlreadyExists(_)));
}

#[tokio::test]
async fn test_create_file_overwrite_releases_blocks() {
    let env = TestEnv::new();
    let old = env.write_file("/f", 2048).await;
    assert_eq!(old.block_ids.len(), 2);

    let new = env
        .master
        .create_file(
            &root_ctx(),
            &path("/f"),
            CreateFileOptions {
                overwrite: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_ne!(new.id, old.id);
    assert!(!new.completed);
    let deleted = env.blocks.deleted_blocks();
    for block in &old.block_ids {
        assert!(deleted.contains(block));
    }
}

#[tokio::test]
async fn test_create_file_under_file_is_not_a_directory() {
    let env = TestEnv::new();
    env.write_file("/f", 0).await;

    let err = env
        .master
        .create_file(&root_ctx(), &path("/f/g"), CreateFileOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CanopyError::NotADirectory(_)));
}

#[tokio::test]
async fn test_create_directory_allow_exists() {
    let env = TestEnv::new();
    let id = env.mkdir("/d").await;

    let err = env
        .master
        .create_directory(&root_ctx(), &path("/d"), CreateDirectoryOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CanopyError::AlreadyExists(_)));

    let again = env
        .master
        .create_directory(
            &root_ctx(),
            &path("/d"),
            CreateDirectoryOptions {
                allow_exists: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(again, id);
}

#[tokio::test]
async fn test_create_persisted_directory_reaches_ufs() {
    let env = TestEnv::new();
    env.mkdir_persisted("/p/q").await;

    assert!(env.ufs_exists(&ufs_path("/p")).await);
    assert!(env.ufs_exists(&ufs_path("/p/q")).await);
    let info = env.info("/p/q").await;
    assert_eq!(info.persistence_state, PersistenceState::Persisted);
    assert!(!info.ufs_fingerprint.is_empty());
    assert_eq!(env.info("/p").await.persistence_state, PersistenceState::Persisted);
}

#[tokio::test]
async fn test_create_requires_parent_write() {
    let env = TestEnv::new();
    env.mkdir("/d").await;

    let err = env
        .master
        .create_file(&user_ctx("alice"), &path("/d/f"), CreateFileOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CanopyError::AccessDenied(_)));
}

#[tokio::test]
async fn test_complete_file_computes_length_from_blocks() {
    let env = TestEnv::new();
    let info = env.write_file("/f", 2500).await;

    assert!(info.completed);
    assert_eq!(info.length, 2500);
    assert_eq!(info.block_ids.len(), 3);
}

#[tokio::test]
async fn test_complete_file_twice_fails() {
    let env = TestEnv::new();
    env.write_file("/f", 100).await;

    let err = env
        .master
        .complete_file(&root_ctx(), &path("/f"), CompleteFileOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CanopyError::FileAlreadyCompleted(_)));
}

#[tokio::test]
async fn test_complete_file_rejects_uncommitted_or_short_blocks() {
    let env = TestEnv::new();
    let ctx = root_ctx();
    let f = path("/f");
    env.master.create_file(&ctx, &f, CreateFileOptions::default()).await.unwrap();
    let first = env.master.get_new_block_id_for_file(&ctx, &f).await.unwrap();
    let second = env.master.get_new_block_id_for_file(&ctx, &f).await.unwrap();

    env.blocks.commit_block(first, 1024);
    let err = env
        .master
        .complete_file(&ctx, &f, CompleteFileOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CanopyError::BlockInfo(_)));

    // A short block is only allowed at the end.
    env.blocks.commit_block(first, 10);
    env.blocks.commit_block(second, 10);
    let err = env
        .master
        .complete_file(&ctx, &f, CompleteFileOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CanopyError::BlockInfo(_)));
    assert!(!env.info("/f").await.completed);
}

#[tokio::test]
async fn test_complete_file_records_content_hash() {
    let env = TestEnv::new();
    let ctx = root_ctx();
    env.master.create_file(&ctx, &path("/f"), CreateFileOptions::default()).await.unwrap();

    env.master
        .complete_file(
            &ctx,
            &path("/f"),
            CompleteFileOptions {
                content_hash: Some("abc123".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let info = env.info("/f").await;
    assert_eq!(info.length, 0);
    assert_eq!(info.xattr.get(ETAG_XATTR_KEY), Some(&b"abc123".to_vec()));
}

#[tokio::test]
async fn test_block_ids_follow_container_sequence() {
    let env = TestEnv::new();
    let ctx = root_ctx();
    env.master.create_file(&ctx, &path("/f"), CreateFileOptions::default()).await.unwrap();

    let a = env.master.get_new_block_id_for_file(&ctx, &path("/f")).await.unwrap();
    let b = env.master.get_new_block_id_for_file(&ctx, &path("/f")).await.unwrap();
    assert_eq!(b, a + 1);
    assert_eq!(a >> 24, b >> 24);

    env.blocks.commit_block(a, 1024);
    env.blocks.commit_block(b, 1);
    env.master
        .complete_file(&ctx, &path("/f"), CompleteFileOptions::default())
        .await
        .unwrap();
    let err = env.master.get_new_block_id_for_file(&ctx, &path("/f")).await.unwrap_err();
    assert!(matches!(err, CanopyError::FileAlreadyCompleted(_)));
}

#[tokio::test]
async fn test_delete_non_empty_directory_requires_recursive() {
    let env = TestEnv::new();
    env.write_file("/d/f", 1).await;

    let err = env
        .master
        .delete(&root_ctx(), &path("/d"), DeleteOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CanopyError::DirectoryNotEmpty(_)));

    let err = env
        .master
        .delete(&root_ctx(), &path("/"), DeleteOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CanopyError::InvalidPath(_)));
}

#[tokio::test]
async fn test_delete_recursive_removes_subtree_and_ufs() {
    let env = TestEnv::new();
    let file = env.write_file("/d/sub/f", 1500).await;
    env.write_persisted_file("/d/p", 5).await;
    assert!(env.ufs_exists(&ufs_path("/d/p")).await);

    let result = env
        .master
        .delete(
            &root_ctx(),
            &path("/d"),
            DeleteOptions {
                recursive: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(result.deleted.len(), 4);
    assert_eq!(result.deleted.last().map(String::as_str), Some("/d"));
    assert!(result.skipped.is_empty());
    assert!(!env.exists("/d").await);
    assert!(!env.ufs_exists(&ufs_path("/d/p")).await);
    assert!(!env.ufs_exists(&ufs_path("/d")).await);
    let deleted = env.blocks.deleted_blocks();
    for block in &file.block_ids {
        assert!(deleted.contains(block));
    }
}

#[tokio::test]
async fn test_delete_alluxio_only_keeps_ufs() {
    let env = TestEnv::new();
    env.write_persisted_file("/p", 5).await;

    env.master
        .delete(
            &root_ctx(),
            &path("/p"),
            DeleteOptions {
                alluxio_only: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert!(!env.exists("/p").await);
    assert!(env.ufs_exists(&ufs_path("/p")).await);
}

#[tokio::test]
async fn test_delete_skips_protected_descendants() {
    let env = TestEnv::new();
    env.mkdir("/d/mine").await;
    env.mkdir("/d/locked").await;
    env.write_file("/d/locked/f", 1).await;
    env.write_file("/d/mine/f", 1).await;
    let ctx = root_ctx();
    for (p, owner) in [("/d", "alice"), ("/d/mine", "alice"), ("/d/mine/f", "alice")] {
        env.master
            .set_attribute(
                &ctx,
                &path(p),
                SetAttributeOptions {
                    owner: Some(owner.to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }
    // Let alice write to the root so that the target itself may be removed.
    env.master
        .set_attribute(
            &ctx,
            &path("/"),
            SetAttributeOptions {
                mode: Some(Mode::new(0o777)),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let result = env
        .master
        .delete(
            &user_ctx("alice"),
            &path("/d"),
            DeleteOptions {
                recursive: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert!(result.deleted.contains(&"/d/mine/f".to_string()));
    assert!(result.deleted.contains(&"/d/mine".to_string()));
    assert!(result.skipped.contains(&"/d/locked".to_string()));
    assert!(result.skipped.contains(&"/d".to_string()));
    // Denied nodes are skipped, not failed.
    assert!(result.failures.is_empty());
    assert!(env.exists("/d/locked/f").await);
    assert!(!env.exists("/d/mine").await);
}

#[tokio::test]
async fn test_delete_ufs_failure_keeps_ancestors() {
    let env = TestEnv::new();
    env.write_persisted_file("/d/a", 1).await;
    env.write_persisted_file("/d/b", 1).await;
    env.ufs().inject_failure(UfsOperation::Delete, &ufs_path("/d/a"));

    let err = env
        .master
        .delete(
            &root_ctx(),
            &path("/d"),
            DeleteOptions {
                recursive: true,
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CanopyError::PreconditionFailed(ref m) if m.contains("/d/a")), "{:?}", err);

    assert!(env.exists("/d/a").await);
    assert!(env.exists("/d").await);
    assert!(!env.exists("/d/b").await);
    assert!(!env.ufs_exists(&ufs_path("/d/b")).await);
}

#[tokio::test]
async fn test_delete_ufs_failure_reported_when_skipping() {
    let env = TestEnv::new();
    env.write_persisted_file("/d/a", 1).await;
    env.ufs().inject_failure(UfsOperation::Delete, &ufs_path("/d/a"));

    let result = env
        .master
        .delete(
            &root_ctx(),
            &path("/d"),
            DeleteOptions {
                recursive: true,
                skip_not_persisted: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(result.failures.len(), 1);
    assert_eq!(result.failures[0].0, "/d/a");
    assert_eq!(result.skipped, vec!["/d/a".to_string(), "/d".to_string()]);
}

#[tokio::test]
async fn test_delete_cancels_pending_persistence() {
    let env = TestEnv::new();
    let file = env.write_file("/f", 10).await;
    env.master
        .schedule_async_persistence(&root_ctx(), &path("/f"), Default::default())
        .await
        .unwrap();
    assert!(env.master.persist_queue().is_pending(file.id));

    env.master.delete(&root_ctx(), &path("/f"), DeleteOptions::default()).await.unwrap();

    assert!(!env.master.persist_queue().is_pending(file.id));
}

#[tokio::test]
async fn test_rename_into_own_subtree_is_invalid() {
    let env = TestEnv::new();
    env.mkdir("/a/sub").await;

    let err = env
        .master
        .rename(&root_ctx(), &path("/a"), &path("/a/sub/a"), RenameOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CanopyError::InvalidPath(_)));
    assert!(env.exists("/a/sub").await);
}

#[tokio::test]
async fn test_rename_moves_subtree() {
    let env = TestEnv::new();
    let file = env.write_file("/a/b/f", 10).await;
    env.mkdir("/x").await;

    env.master
        .rename(&root_ctx(), &path("/a/b"), &path("/x/c"), RenameOptions::default())
        .await
        .unwrap();

    assert!(!env.exists("/a/b").await);
    let moved = env.info("/x/c/f").await;
    assert_eq!(moved.id, file.id);
    assert_eq!(moved.path, "/x/c/f");
}

#[tokio::test]
async fn test_rename_to_itself_is_noop() {
    let env = TestEnv::new();
    env.write_file("/f", 1).await;

    env.master
        .rename(&root_ctx(), &path("/f"), &path("/f"), RenameOptions::default())
        .await
        .unwrap();
    assert!(env.exists("/f").await);
}

#[tokio::test]
async fn test_rename_errors() {
    let env = TestEnv::new();
    env.write_file("/f", 1).await;
    env.write_file("/g", 1).await;

    let err = env
        .master
        .rename(&root_ctx(), &path("/f"), &path("/g"), RenameOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CanopyError::AlreadyExists(_)));

    let err = env
        .master
        .rename(&root_ctx(), &path("/missing"), &path("/h"), RenameOptions::default())
        .await
        .unwrap_err();
    assert!(err.is_not_found());

    let err = env
        .master
        .rename(&root_ctx(), &path("/f"), &path("/g/h"), RenameOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CanopyError::NotADirectory(_)));

    let err = env
        .master
        .rename(&root_ctx(), &path("/"), &path("/r"), RenameOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CanopyError::InvalidPath(_)));
}

#[tokio::test]
async fn test_rename_under_missing_shared_parent_is_not_found() {
    let env = TestEnv::new();
    env.write_file("/f", 1).await;

    for (src, dst) in [("/missing/a", "/missing/b"), ("/missing/x/a", "/missing/y/b"), ("/f/a", "/f/b")] {
        let renamed = tokio::time::timeout(
            std::time::Duration::from_secs(3),
            env.master
                .rename(&root_ctx(), &path(src), &path(dst), RenameOptions::default()),
        )
        .await
        .unwrap_or_else(|_| panic!("rename {} -> {} did not finish", src, dst));
        let err = renamed.unwrap_err();
        assert!(err.is_not_found(), "{} -> {}: {:?}", src, dst, err);
    }
    assert!(!env.exists("/missing").await);

    // The namespace stays usable afterwards.
    env.mkdir("/missing").await;
    assert!(env.exists("/missing").await);
}

#[tokio::test]
async fn test_rename_s3_overwrite_replaces_file() {
    let env = TestEnv::new();
    let src = env.write_file("/f", 1).await;
    let dst = env.write_file("/g", 1).await;

    env.master
        .rename(
            &root_ctx(),
            &path("/f"),
            &path("/g"),
            RenameOptions {
                s3_syntax: true,
                overwrite: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(env.info("/g").await.id, src.id);
    assert!(env.master.tree().get(dst.id).is_none());
}

#[tokio::test]
async fn test_rename_persisted_moves_ufs_copy() {
    let env = TestEnv::new();
    env.write_persisted_file("/d/f", 3).await;
    env.mkdir("/e").await;

    env.master
        .rename(&root_ctx(), &path("/d/f"), &path("/e/f"), RenameOptions::default())
        .await
        .unwrap();

    assert!(!env.ufs_exists(&ufs_path("/d/f")).await);
    assert!(env.ufs_exists(&ufs_path("/e/f")).await);
    // The destination parent was persisted on the way.
    assert_eq!(env.info("/e").await.persistence_state, PersistenceState::Persisted);
}

#[tokio::test]
async fn test_rename_reverted_when_ufs_fails() {
    let env = TestEnv::new();
    let file = env.write_persisted_file("/f", 3).await;
    env.ufs().inject_failure(UfsOperation::Rename, &ufs_path("/f"));

    let err = env
        .master
        .rename(&root_ctx(), &path("/f"), &path("/g"), RenameOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CanopyError::Ufs(_)));

    assert_eq!(env.info("/f").await.id, file.id);
    assert!(!env.exists("/g").await);
    assert!(env.ufs_exists(&ufs_path("/f")).await);
}

#[tokio::test]
async fn test_rename_with_persist_schedules_completed_files() {
    let mut config = CanopyConfig::testing();
    config.master.persist_blacklist = vec!["_skip".to_string()];
    let env = TestEnv::with_config(config);
    let done = env.write_file("/d/done", 10).await;
    let skipped = env.write_file("/d/tmp_skip", 10).await;
    let open = env
        .master
        .create_file(&root_ctx(), &path("/d/open"), CreateFileOptions::default())
        .await
        .unwrap();

    env.master
        .rename(
            &root_ctx(),
            &path("/d"),
            &path("/e"),
            RenameOptions {
                persist: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let queue = env.master.persist_queue();
    assert!(queue.is_pending(done.id));
    assert!(!queue.is_pending(skipped.id));
    assert!(!queue.is_pending(open.id));
    assert_eq!(env.info("/e/done").await.persistence_state, PersistenceState::ToBePersisted);
    assert_eq!(env.info("/e/tmp_skip").await.persistence_state, PersistenceState::NotPersisted);
}

#[tokio::test]
async fn test_free_requires_persisted_files() {
    let env = TestEnv::new();
    env.write_file("/d/f", 10).await;

    let err = env
        .master
        .free(&root_ctx(), &path("/d/f"), FreeOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CanopyError::PreconditionFailed(_)));

    let err = env
        .master
        .free(&root_ctx(), &path("/d"), FreeOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CanopyError::PreconditionFailed(ref m) if m.contains("recursive")));
}

#[tokio::test]
async fn test_free_pinned_needs_force() {
    let env = TestEnv::new();
    let ctx = root_ctx();
    let file = env.write_file("/f", 10).await;
    env.master
        .set_attribute(
            &ctx,
            &path("/f"),
            SetAttributeOptions {
                pinned: Some(true),
                persisted: Some(true),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let err = env.master.free(&ctx, &path("/f"), FreeOptions::default()).await.unwrap_err();
    assert!(matches!(err, CanopyError::PreconditionFailed(_)));

    env.master
        .free(
            &ctx,
            &path("/f"),
            FreeOptions {
                forced: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert!(!env.info("/f").await.pinned);
    assert_eq!(env.blocks.freed_blocks(), file.block_ids);
    assert!(env.exists("/f").await);
}

#[tokio::test]
async fn test_set_attribute_recursive_skips_foreign_descendants() {
    let env = TestEnv::new();
    let ctx = root_ctx();
    env.write_file("/d/mine", 1).await;
    env.write_file("/d/theirs", 1).await;
    for p in ["/d", "/d/mine"] {
        env.master
            .set_attribute(
                &ctx,
                &path(p),
                SetAttributeOptions {
                    owner: Some("alice".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }

    let result = env
        .master
        .set_attribute(
            &user_ctx("alice"),
            &path("/d"),
            SetAttributeOptions {
                recursive: true,
                mode: Some(Mode::new(0o700)),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(result.updated, vec!["/d".to_string(), "/d/mine".to_string()]);
    assert_eq!(result.skipped, vec!["/d/theirs".to_string()]);
    assert_eq!(env.info("/d/mine").await.mode, Mode::new(0o700));
    assert_eq!(env.info("/d/theirs").await.mode, Mode::FILE_DEFAULT);
}

#[tokio::test]
async fn test_set_attribute_owner_needs_super_user() {
    let env = TestEnv::new();
    env.write_file("/f", 1).await;

    let err = env
        .master
        .set_attribute(
            &user_ctx("alice"),
            &path("/f"),
            SetAttributeOptions {
                owner: Some("alice".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CanopyError::AccessDenied(_)));
    assert_eq!(env.info("/f").await.owner, "root");
}

#[tokio::test]
async fn test_set_mode_rolled_back_when_ufs_rejects_it() {
    let env = TestEnv::new();
    env.write_persisted_file("/f", 4).await;
    env.ufs().inject_failure(UfsOperation::SetMode, &ufs_path("/f"));

    let err = env
        .master
        .set_attribute(
            &root_ctx(),
            &path("/f"),
            SetAttributeOptions {
                mode: Some(Mode::new(0o600)),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();

    assert!(matches!(err, CanopyError::AccessDenied(_)));
    assert_eq!(env.info("/f").await.mode, Mode::FILE_DEFAULT);
}

#[tokio::test]
async fn test_set_persisted_propagates_to_ancestors() {
    let env = TestEnv::new();
    env.write_file("/a/b/f", 1).await;

    env.master
        .set_attribute(
            &root_ctx(),
            &path("/a/b/f"),
            SetAttributeOptions {
                persisted: Some(true),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    for p in ["/a", "/a/b", "/a/b/f"] {
        assert_eq!(env.info(p).await.persistence_state, PersistenceState::Persisted, "{}", p);
    }
}

#[tokio::test]
async fn test_set_persisted_on_incomplete_file_fails() {
    let env = TestEnv::new();
    env.master
        .create_file(&root_ctx(), &path("/f"), CreateFileOptions::default())
        .await
        .unwrap();

    let err = env
        .master
        .set_attribute(
            &root_ctx(),
            &path("/f"),
            SetAttributeOptions {
                persisted: Some(true),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CanopyError::PreconditionFailed(_)));
}

#[tokio::test]
async fn test_set_acl_modify_and_remove() {
    let env = TestEnv::new();
    env.write_file("/f", 1).await;
    let ctx = root_ctx();

    env.master
        .set_acl(
            &ctx,
            &path("/f"),
            SetAclAction::Modify,
            vec![AclEntry::user("bob", ModeBits::READ)],
            SetAclOptions::default(),
        )
        .await
        .unwrap();
    let inode = env.master.tree().get(env.info("/f").await.id).unwrap();
    assert_eq!(inode.acl.named_users.get("bob"), Some(&ModeBits::READ));

    env.master
        .set_acl(&ctx, &path("/f"), SetAclAction::RemoveAll, Vec::new(), SetAclOptions::default())
        .await
        .unwrap();
    let inode = env.master.tree().get(inode.id).unwrap();
    assert!(inode.acl.named_users.is_empty());
}

#[tokio::test]
async fn test_default_acl_inherited_by_new_children() {
    let env = TestEnv::new();
    env.mkdir("/d").await;
    let ctx = root_ctx();

    env.master
        .set_acl(
            &ctx,
            &path("/d"),
            SetAclAction::Modify,
            vec![AclEntry::user("bob", ModeBits::READ_EXECUTE).default_entry()],
            SetAclOptions::default(),
        )
        .await
        .unwrap();
    let child = env.write_file("/d/f", 1).await;

    let inode = env.master.tree().get(child.id).unwrap();
    assert_eq!(inode.acl.named_users.get("bob"), Some(&ModeBits::READ_EXECUTE));
}

#[tokio::test]
async fn test_set_acl_recursive_ignores_default_entries_on_files() {
    let env = TestEnv::new();
    env.write_file("/d/f", 1).await;

    let result = env
        .master
        .set_acl(
            &root_ctx(),
            &path("/d"),
            SetAclAction::Modify,
            vec![
                AclEntry::user("bob", ModeBits::READ),
                AclEntry::user("carol", ModeBits::READ).default_entry(),
            ],
            SetAclOptions { recursive: true },
        )
        .await
        .unwrap();

    assert_eq!(result.updated, vec!["/d".to_string(), "/d/f".to_string()]);
    let file = env.master.tree().get(env.info("/d/f").await.id).unwrap();
    assert!(file.acl.named_users.contains_key("bob"));
    assert!(!file.acl.named_users.contains_key("carol"));
}

#[tokio::test]
async fn test_list_status() {
    let env = TestEnv::new();
    env.write_file("/d/b", 1).await;
    env.write_file("/d/a", 1).await;
    env.write_file("/d/sub/c", 1).await;

    let children = env
        .master
        .list_status(&root_ctx(), &path("/d"), ListStatusOptions::default())
        .await
        .unwrap();
    let names: Vec<&str> = children.iter().map(|i| i.name.as_str()).collect();
    assert_eq!(names, vec!["a", "b", "sub"]);

    let all = env
        .master
        .list_status(&root_ctx(), &path("/d"), ListStatusOptions { recursive: true })
        .await
        .unwrap();
    assert_eq!(all.len(), 4);

    let file = env
        .master
        .list_status(&root_ctx(), &path("/d/a"), ListStatusOptions::default())
        .await
        .unwrap();
    assert_eq!(file.len(), 1);
    assert_eq!(file[0].path, "/d/a");
}
