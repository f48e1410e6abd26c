//! Namespace metadata.
//!
//! The inode model, the in-memory namespace tree rebuilt from the journal,
//! and permission checks over inodes.

// Panics while mutating the namespace leave it half-applied.
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod inode;
pub mod permission;
pub mod tree;

pub use inode::{DirectoryAttributes, FileAttributes, FileInfo, Inode, InodeKind, NewInode};
pub use permission::{PermissionChecker, UserInfo};
pub use tree::InodeTree;
