//! Options and results of namespace operations.

use crate::error::CanopyError;
use crate::types::{Mode, TtlAction, XAttrUpdateStrategy, NO_TTL};
use std::collections::HashMap;
use std::time::Duration;

/// Options of [`FileSystemMaster::create_file`](super::FileSystemMaster::create_file).
#[derive(Debug, Clone)]
pub struct CreateFileOptions {
    /// Create missing parent directories.
    pub recursive: bool,
    /// Replace an existing file.
    pub overwrite: bool,
    pub mode: Mode,
    /// Block size; the configured default when `None`.
    pub block_size_bytes: Option<u64>,
    /// The file is written through to under storage by the client.
    pub persisted: bool,
    pub ttl: i64,
    pub ttl_action: TtlAction,
    pub xattr: HashMap<String, Vec<u8>>,
}

impl Default for CreateFileOptions {
    fn default() -> Self {
        Self {
            recursive: false,
            overwrite: false,
            mode: Mode::FILE_DEFAULT,
            block_size_bytes: None,
            persisted: false,
            ttl: NO_TTL,
            ttl_action: TtlAction::Delete,
            xattr: HashMap::new(),
        }
    }
}

/// Options of [`FileSystemMaster::create_directory`](super::FileSystemMaster::create_directory).
#[derive(Debug, Clone)]
pub struct CreateDirectoryOptions {
    pub recursive: bool,
    /// Succeed when the directory already exists.
    pub allow_exists: bool,
    pub mode: Mode,
    /// Create the directory in under storage as well.
    pub persisted: bool,
    pub ttl: i64,
    pub ttl_action: TtlAction,
    pub xattr: HashMap<String, Vec<u8>>,
}

impl Default for CreateDirectoryOptions {
    fn default() -> Self {
        Self {
            recursive: false,
            allow_exists: false,
            mode: Mode::DIRECTORY_DEFAULT,
            persisted: false,
            ttl: NO_TTL,
            ttl_action: TtlAction::Delete,
            xattr: HashMap::new(),
        }
    }
}

/// Options of [`FileSystemMaster::schedule_async_persistence`](super::FileSystemMaster::schedule_async_persistence).
#[derive(Debug, Clone, Default)]
pub struct ScheduleAsyncPersistenceOptions {
    /// Delay before the first attempt; the configured default when `None`.
    pub initial_wait: Option<Duration>,
}

/// Options of [`FileSystemMaster::complete_file`](super::FileSystemMaster::complete_file).
#[derive(Debug, Clone, Default)]
pub struct CompleteFileOptions {
    /// Length written to under storage, used for persisted files.
    pub ufs_length: i64,
    /// Content hash reported by the writer.
    pub content_hash: Option<String>,
    /// Schedule persistence once the file is completed.
    pub async_persist: Option<ScheduleAsyncPersistenceOptions>,
}

/// Options of [`FileSystemMaster::delete`](super::FileSystemMaster::delete).
#[derive(Debug, Clone, Default)]
pub struct DeleteOptions {
    pub recursive: bool,
    /// Remove from the namespace only, leaving under storage untouched.
    pub alluxio_only: bool,
    /// Skip permission checks on the subtree.
    pub unchecked: bool,
    /// Allow removing mount points inside the subtree.
    pub delete_mount_point: bool,
    /// Report under storage failures as skipped paths instead of failing.
    pub skip_not_persisted: bool,
}

/// Options of [`FileSystemMaster::rename`](super::FileSystemMaster::rename).
#[derive(Debug, Clone, Default)]
pub struct RenameOptions {
    /// Schedule the renamed files for persistence.
    pub persist: bool,
    /// Object-store semantics: with `overwrite`, an existing destination file
    /// is replaced.
    pub s3_syntax: bool,
    pub overwrite: bool,
}

/// Options of [`FileSystemMaster::free`](super::FileSystemMaster::free).
#[derive(Debug, Clone, Default)]
pub struct FreeOptions {
    pub recursive: bool,
    /// Free pinned files too, unpinning them.
    pub forced: bool,
}

/// Options of [`FileSystemMaster::set_attribute`](super::FileSystemMaster::set_attribute).
///
/// `None` fields are left unchanged.
#[derive(Debug, Clone, Default)]
pub struct SetAttributeOptions {
    /// Apply to every descendant as well.
    pub recursive: bool,
    pub pinned: Option<bool>,
    pub ttl: Option<i64>,
    pub ttl_action: Option<TtlAction>,
    /// Only `Some(true)` has an effect.
    pub persisted: Option<bool>,
    pub owner: Option<String>,
    pub group: Option<String>,
    pub mode: Option<Mode>,
    pub xattr: Option<HashMap<String, Vec<u8>>>,
    pub xattr_strategy: XAttrUpdateStrategy,
}

impl SetAttributeOptions {
    pub(crate) fn changes_ownership(&self) -> bool {
        self.owner.is_some() || self.group.is_some() || self.mode.is_some()
    }
}

/// Options of [`FileSystemMaster::set_acl`](super::FileSystemMaster::set_acl).
#[derive(Debug, Clone, Default)]
pub struct SetAclOptions {
    pub recursive: bool,
}

/// Options of [`FileSystemMaster::list_status`](super::FileSystemMaster::list_status).
#[derive(Debug, Clone, Default)]
pub struct ListStatusOptions {
    pub recursive: bool,
}

/// Outcome of a delete.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteResult {
    /// Paths removed from the namespace, deepest first.
    pub deleted: Vec<String>,
    /// Paths kept because they or a descendant could not be removed.
    pub skipped: Vec<String>,
    /// Under storage failures, as `(path, reason)`.
    pub failures: Vec<(String, String)>,
}

/// Outcome of a recursive attribute or ACL change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttributeResult {
    /// Paths whose metadata changed, in pre-order.
    pub updated: Vec<String>,
    /// Descendants left unchanged because the caller may not modify them.
    pub skipped: Vec<String>,
}

/// Number of failures listed in the error of a partially failed delete.
const LISTED_DELETE_FAILURES: usize = 20;

impl DeleteResult {
    /// The aggregated error of the under storage failures, if any.
    pub(crate) fn failure_error(&self) -> Option<CanopyError> {
        if self.failures.is_empty() {
            return None;
        }
        let listed: Vec<String> = self
            .failures
            .iter()
            .take(LISTED_DELETE_FAILURES)
            .map(|(path, reason)| format!("{} ({})", path, reason))
            .collect();
        let mut message = format!(
            "Failed to delete {} paths from the under file system: {}",
            self.failures.len(),
            listed.join(", ")
        );
        if self.failures.len() > LISTED_DELETE_FAILURES {
            message.push_str(&format!(" ...(only {} errors shown)", LISTED_DELETE_FAILURES));
        }
        Some(CanopyError::PreconditionFailed(message))
    }
}
