//! Journal entry kinds.
//!
//! Every namespace mutation is expressed as one or more [`JournalEntry`]
//! values. Applying the same entries in order to an empty namespace
//! reproduces the state.

use crate::acl::{DefaultAcl, ExtendedAcl};
use crate::metadata::inode::Inode;
use crate::mount::{MountInfo, MountOptions};
use crate::types::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A journaled namespace mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JournalEntry {
    /// A new inode attached to its parent.
    CreateInode { inode: Inode },
    /// Patch of attributes shared by files and directories.
    UpdateInode { id: InodeId, update: InodeUpdate },
    /// Patch of file attributes.
    UpdateInodeFile { id: InodeId, update: FileUpdate },
    /// Patch of directory attributes.
    UpdateInodeDirectory { id: InodeId, update: DirectoryUpdate },
    /// Move an inode to a new parent under a new name.
    Rename {
        id: InodeId,
        new_parent_id: InodeId,
        new_name: String,
        op_time_ms: i64,
    },
    /// Detach and drop an inode.
    DeleteInode { id: InodeId, op_time_ms: i64 },
    /// Append a block id to a file.
    NewBlock { id: InodeId, block_id: BlockId },
    /// A new mount.
    AddMountPoint { info: MountInfo },
    /// New options of an existing mount.
    UpdateMountPoint { path: String, options: MountOptions },
    /// A removed mount.
    DeleteMountPoint { path: String },
    /// A new active sync point.
    AddSyncPoint { path: String, mount_id: MountId },
    /// A removed active sync point.
    RemoveSyncPoint { path: String },
}

impl JournalEntry {
    /// Short kind name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            JournalEntry::CreateInode { .. } => "create_inode",
            JournalEntry::UpdateInode { .. } => "update_inode",
            JournalEntry::UpdateInodeFile { .. } => "update_inode_file",
            JournalEntry::UpdateInodeDirectory { .. } => "update_inode_directory",
            JournalEntry::Rename { .. } => "rename",
            JournalEntry::DeleteInode { .. } => "delete_inode",
            JournalEntry::NewBlock { .. } => "new_block",
            JournalEntry::AddMountPoint { .. } => "add_mount_point",
            JournalEntry::UpdateMountPoint { .. } => "update_mount_point",
            JournalEntry::DeleteMountPoint { .. } => "delete_mount_point",
            JournalEntry::AddSyncPoint { .. } => "add_sync_point",
            JournalEntry::RemoveSyncPoint { .. } => "remove_sync_point",
        }
    }
}

/// Extended attribute patch with its merge strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct XAttrPatch {
    pub strategy: XAttrUpdateStrategy,
    pub values: HashMap<String, Vec<u8>>,
}

/// Patch of shared inode attributes. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InodeUpdate {
    pub owner: Option<String>,
    pub group: Option<String>,
    pub mode: Option<Mode>,
    pub acl: Option<ExtendedAcl>,
    pub pinned: Option<bool>,
    pub ttl: Option<i64>,
    pub ttl_action: Option<TtlAction>,
    pub persistence_state: Option<PersistenceState>,
    pub ufs_fingerprint: Option<String>,
    pub last_modification_time_ms: Option<i64>,
    pub last_access_time_ms: Option<i64>,
    pub xattr: Option<XAttrPatch>,
}

impl InodeUpdate {
    /// Patch that only changes the persistence state.
    pub fn persistence(state: PersistenceState) -> Self {
        Self {
            persistence_state: Some(state),
            ..Default::default()
        }
    }

    /// Whether the patch changes anything.
    pub fn is_empty(&self) -> bool {
        *self == InodeUpdate::default()
    }
}

/// Patch of file attributes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileUpdate {
    pub completed: Option<bool>,
    pub length: Option<i64>,
    pub block_ids: Option<Vec<BlockId>>,
    pub persist_job_id: Option<JobId>,
    /// `Some(None)` clears the temp path.
    pub temp_ufs_path: Option<Option<String>>,
}

impl FileUpdate {
    /// Patch that clears persist job pointers.
    pub fn clear_persist_job() -> Self {
        Self {
            persist_job_id: Some(INVALID_JOB_ID),
            temp_ufs_path: Some(None),
            ..Default::default()
        }
    }
}

/// Patch of directory attributes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DirectoryUpdate {
    pub mount_point: Option<bool>,
    pub direct_children_loaded: Option<bool>,
    pub default_acl: Option<DefaultAcl>,
}
