//! Core types shared across the namespace master.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Inode identifier.
pub type InodeId = u64;

/// Block identifier (container id in the high bits, sequence in the low 24).
pub type BlockId = u64;

/// Block container identifier.
pub type ContainerId = u64;

/// Mount identifier.
pub type MountId = u64;

/// Persist job identifier assigned by the job service.
pub type JobId = u64;

/// The root inode id.
pub const ROOT_INODE_ID: InodeId = 1;

/// Mount id reserved for the root mount.
pub const ROOT_MOUNT_ID: MountId = 1;

/// Length of a file whose size is not known yet.
pub const LENGTH_UNKNOWN: i64 = -1;

/// Job id value for "no job".
pub const INVALID_JOB_ID: JobId = 0;

/// Fingerprint value for "no fingerprint".
pub const INVALID_UFS_FINGERPRINT: &str = "";

/// Extended attribute key holding the content hash of a completed file.
pub const ETAG_XATTR_KEY: &str = "s3_etag";

const SEQUENCE_BITS: u32 = 24;
const MAX_SEQUENCE: u64 = (1 << SEQUENCE_BITS) - 1;

/// Build a block id from a container and a sequence number.
pub fn block_id(container: ContainerId, sequence: u64) -> BlockId {
    (container << SEQUENCE_BITS) | (sequence & MAX_SEQUENCE)
}

/// The largest sequence number a container can hold.
pub fn max_block_sequence() -> u64 {
    MAX_SEQUENCE
}

/// Current time as epoch milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Client-supplied token used to detect retried calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationId(pub Uuid);

impl OperationId {
    /// Generate a fresh operation id.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Persistence state of an inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PersistenceState {
    /// Only present in the namespace.
    NotPersisted,
    /// Waiting for the persistence pipeline.
    ToBePersisted,
    /// Durably present in under storage.
    Persisted,
    /// Data is gone; externally reported.
    Lost,
}

impl fmt::Display for PersistenceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PersistenceState::NotPersisted => "NOT_PERSISTED",
            PersistenceState::ToBePersisted => "TO_BE_PERSISTED",
            PersistenceState::Persisted => "PERSISTED",
            PersistenceState::Lost => "LOST",
        };
        f.write_str(s)
    }
}

/// What happens to an inode when its TTL expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TtlAction {
    /// Delete the inode and its under storage copy.
    #[default]
    Delete,
    /// Delete the inode only.
    DeleteAlluxio,
    /// Free the cached blocks.
    Free,
}

/// TTL value meaning "never expires".
pub const NO_TTL: i64 = -1;

/// How an extended attribute update is merged into the existing map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum XAttrUpdateStrategy {
    /// Replace the whole map.
    ReplaceAll,
    /// Insert new keys and overwrite existing ones.
    #[default]
    UnionReplace,
    /// Insert new keys, keep existing values.
    UnionPreserve,
    /// Remove the listed keys.
    DeleteKeys,
}

/// Permission bits of an inode (the lower nine bits of a POSIX mode).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Mode(u16);

impl Mode {
    /// Default mode for new directories.
    pub const DIRECTORY_DEFAULT: Mode = Mode(0o755);
    /// Default mode for new files.
    pub const FILE_DEFAULT: Mode = Mode(0o644);

    /// Create from raw bits.
    pub fn new(bits: u16) -> Self {
        Mode(bits & 0o777)
    }

    /// Raw permission bits.
    pub fn bits(&self) -> u16 {
        self.0
    }

    /// Owner bits.
    pub fn owner(&self) -> ModeBits {
        ModeBits::from_bits(((self.0 >> 6) & 0o7) as u8)
    }

    /// Group bits.
    pub fn group(&self) -> ModeBits {
        ModeBits::from_bits(((self.0 >> 3) & 0o7) as u8)
    }

    /// Other bits.
    pub fn other(&self) -> ModeBits {
        ModeBits::from_bits((self.0 & 0o7) as u8)
    }

    /// Apply a umask.
    pub fn apply_umask(&self, umask: u16) -> Mode {
        Mode(self.0 & !umask & 0o777)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04o}", self.0)
    }
}

/// A read/write/execute triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModeBits(u8);

impl ModeBits {
    pub const NONE: ModeBits = ModeBits(0);
    pub const EXECUTE: ModeBits = ModeBits(1);
    pub const WRITE: ModeBits = ModeBits(2);
    pub const WRITE_EXECUTE: ModeBits = ModeBits(3);
    pub const READ: ModeBits = ModeBits(4);
    pub const READ_EXECUTE: ModeBits = ModeBits(5);
    pub const READ_WRITE: ModeBits = ModeBits(6);
    pub const ALL: ModeBits = ModeBits(7);

    /// Create from raw bits.
    pub fn from_bits(bits: u8) -> Self {
        ModeBits(bits & 0o7)
    }

    /// Raw bits.
    pub fn bits(&self) -> u8 {
        self.0
    }

    /// Check if these bits include every requested bit.
    pub fn implies(&self, requested: ModeBits) -> bool {
        (self.0 & requested.0) == requested.0
    }

    /// Bitwise intersection.
    pub fn and(&self, other: ModeBits) -> ModeBits {
        ModeBits(self.0 & other.0)
    }

    /// Bitwise union.
    pub fn or(&self, other: ModeBits) -> ModeBits {
        ModeBits(self.0 | other.0)
    }
}

impl fmt::Display for ModeBits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let r = if self.0 & 4 != 0 { 'r' } else { '-' };
        let w = if self.0 & 2 != 0 { 'w' } else { '-' };
        let x = if self.0 & 1 != 0 { 'x' } else { '-' };
        write!(f, "{}{}{}", r, w, x)
    }
}

/// Which descendants a sync or listing covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DescendantType {
    /// The path only.
    None,
    /// The path and its direct children.
    One,
    /// The whole subtree.
    All,
}
