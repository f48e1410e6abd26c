//! Configuration module for Canopy.

use crate::error::{CanopyError, Result};
use crate::mount::MountOptions;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration for a namespace master.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CanopyConfig {
    /// Namespace master configuration.
    pub master: MasterConfig,
    /// Persistence pipeline configuration.
    pub persistence: PersistenceConfig,
    /// Journal configuration.
    pub journal: JournalConfig,
    /// Periodic task intervals.
    pub heartbeat: HeartbeatConfig,
    /// Observability configuration.
    pub observability: ObservabilityConfig,
}

impl CanopyConfig {
    /// Load configuration from a file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CanopyError::Config(format!("Failed to read config file: {}", e)))?;

        let config: Self = serde_json::from_str(&content)
            .map_err(|e| CanopyError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.master.root_ufs_uri.is_empty() {
            return Err(CanopyError::InvalidConfig {
                field: "master.root_ufs_uri".to_string(),
                reason: "The root mount needs an under storage URI".to_string(),
            });
        }

        if self.master.block_size_bytes == 0 {
            return Err(CanopyError::InvalidConfig {
                field: "master.block_size_bytes".to_string(),
                reason: "Block size must be non-zero".to_string(),
            });
        }

        if self.master.lock_retry_attempts == 0 {
            return Err(CanopyError::InvalidConfig {
                field: "master.lock_retry_attempts".to_string(),
                reason: "At least one attempt is required".to_string(),
            });
        }

        if self.master.root_mode > 0o777 {
            return Err(CanopyError::InvalidConfig {
                field: "master.root_mode".to_string(),
                reason: format!("{:o} is not a permission mode", self.master.root_mode),
            });
        }

        let persistence = &self.persistence;
        if persistence.initial_interval.is_zero() || persistence.initial_interval > persistence.max_interval {
            return Err(CanopyError::InvalidConfig {
                field: "persistence.initial_interval".to_string(),
                reason: "Must be non-zero and not above persistence.max_interval".to_string(),
            });
        }

        if persistence.max_quiet_period.is_zero() {
            return Err(CanopyError::InvalidConfig {
                field: "persistence.max_quiet_period".to_string(),
                reason: "Must be non-zero".to_string(),
            });
        }

        if self.journal.kind == JournalKind::File && self.journal.path.as_os_str().is_empty() {
            return Err(CanopyError::InvalidConfig {
                field: "journal.path".to_string(),
                reason: "A file journal needs a path".to_string(),
            });
        }

        Ok(())
    }

    /// Create a minimal development configuration.
    pub fn development() -> Self {
        Self {
            master: MasterConfig {
                root_ufs_uri: "/tmp/canopy/underfs".to_string(),
                permission_enabled: false,
                ..Default::default()
            },
            persistence: PersistenceConfig {
                initial_interval: Duration::from_millis(500),
                max_interval: Duration::from_secs(60),
                max_total_wait: Duration::from_secs(3600),
                ..Default::default()
            },
            journal: JournalConfig {
                kind: JournalKind::File,
                path: PathBuf::from("/tmp/canopy/journal.log"),
            },
            heartbeat: HeartbeatConfig {
                persistence_scheduler_interval: Duration::from_millis(500),
                persistence_checker_interval: Duration::from_millis(500),
                ttl_check_interval: Duration::from_secs(10),
            },
            observability: ObservabilityConfig {
                log_level: "debug".to_string(),
                json_logs: false,
            },
        }
    }

    /// Configuration for tests: in-memory root mount and journal, small
    /// intervals.
    pub fn testing() -> Self {
        Self {
            master: MasterConfig {
                root_ufs_uri: "mem://root".to_string(),
                block_size_bytes: 1024,
                ..Default::default()
            },
            persistence: PersistenceConfig {
                initial_interval: Duration::from_millis(10),
                max_interval: Duration::from_millis(80),
                max_total_wait: Duration::from_secs(60),
                ..Default::default()
            },
            journal: JournalConfig {
                kind: JournalKind::Memory,
                path: PathBuf::new(),
            },
            heartbeat: HeartbeatConfig {
                persistence_scheduler_interval: Duration::from_millis(20),
                persistence_checker_interval: Duration::from_millis(20),
                ttl_check_interval: Duration::from_millis(50),
            },
            observability: ObservabilityConfig::default(),
        }
    }
}

/// Namespace master configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterConfig {
    /// Under storage URI of the root mount.
    pub root_ufs_uri: String,
    /// Options of the root mount.
    #[serde(default)]
    pub root_mount_options: MountOptions,
    /// Owner of the root directory.
    pub root_owner: String,
    /// Group of the root directory.
    pub root_group: String,
    /// Permission bits of the root directory.
    pub root_mode: u16,
    /// Whether permission checks are enforced.
    pub permission_enabled: bool,
    /// User that bypasses permission checks.
    pub super_user: String,
    /// Group whose members bypass permission checks.
    pub super_group: String,
    /// Block size of new files.
    pub block_size_bytes: u64,
    /// Attempts of an operation whose path changed while being locked.
    pub lock_retry_attempts: usize,
    /// Journal entries buffered by a recursive operation before a flush.
    pub recursive_flush_batch: usize,
    /// Capacity of the operation dedup cache.
    pub operation_cache_capacity: usize,
    /// How long an applied operation id is remembered.
    #[serde(with = "humantime_serde")]
    pub operation_cache_max_age: Duration,
    /// Capacity of the absent path cache.
    pub absent_cache_capacity: usize,
    /// Paths containing any of these strings are not persisted on rename.
    #[serde(default)]
    pub persist_blacklist: Vec<String>,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            root_ufs_uri: "/var/lib/canopy/underfs".to_string(),
            root_mount_options: MountOptions::default(),
            root_owner: "root".to_string(),
            root_group: "supergroup".to_string(),
            root_mode: 0o755,
            permission_enabled: true,
            super_user: "root".to_string(),
            super_group: "supergroup".to_string(),
            block_size_bytes: 64 * 1024 * 1024, // 64MB
            lock_retry_attempts: 3,
            recursive_flush_batch: 100,
            operation_cache_capacity: 10_000,
            operation_cache_max_age: Duration::from_secs(300),
            absent_cache_capacity: 10_000,
            persist_blacklist: Vec::new(),
        }
    }
}

/// Persistence pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// First retry interval of a persist request.
    #[serde(with = "humantime_serde")]
    pub initial_interval: Duration,
    /// Upper bound of the retry interval.
    #[serde(with = "humantime_serde")]
    pub max_interval: Duration,
    /// Delay before the first submission of a request.
    #[serde(with = "humantime_serde")]
    pub initial_wait: Duration,
    /// Total time after which a request gives up.
    #[serde(with = "humantime_serde")]
    pub max_total_wait: Duration,
    /// Upper bound of the scheduler quiet period under job service
    /// backpressure.
    #[serde(with = "humantime_serde")]
    pub max_quiet_period: Duration,
    /// Directory below the mount root holding temporary persist files.
    pub temp_dir: String,
    /// Write directly to the final path on object storage.
    pub object_store_direct_persist: bool,
    /// Compare the persisted length with the committed length.
    pub validate_length: bool,
    /// Journal flush interval of the scheduler, in processed requests.
    pub journal_flush_batch: usize,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(3600),
            initial_wait: Duration::ZERO,
            max_total_wait: Duration::from_secs(24 * 3600),
            max_quiet_period: Duration::from_secs(64),
            temp_dir: ".persist_tmp".to_string(),
            object_store_direct_persist: false,
            validate_length: true,
            journal_flush_batch: 100,
        }
    }
}

/// Journal backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JournalKind {
    /// Entries kept in memory only.
    Memory,
    /// Length-prefixed frames in a local file.
    File,
}

/// Journal configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalConfig {
    pub kind: JournalKind,
    /// Journal file of the file backend.
    pub path: PathBuf,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            kind: JournalKind::File,
            path: PathBuf::from("/var/lib/canopy/journal.log"),
        }
    }
}

/// Periodic task intervals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(with = "humantime_serde")]
    pub persistence_scheduler_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub persistence_checker_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub ttl_check_interval: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            persistence_scheduler_interval: Duration::from_secs(1),
            persistence_checker_interval: Duration::from_secs(1),
            ttl_check_interval: Duration::from_secs(3600),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level.
    pub log_level: String,
    /// Enable JSON logging.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Serde helper for Duration using humantime format.
pub mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}ms", duration.as_millis()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub(super) fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string())
        } else if let Some(s_val) = s.strip_suffix('s') {
            s_val
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|e| e.to_string())
        } else if let Some(m) = s.strip_suffix('m') {
            m.parse::<u64>()
                .map(|v| Duration::from_secs(v * 60))
                .map_err(|e| e.to_string())
        } else if let Some(h) = s.strip_suffix('h') {
            h.parse::<u64>()
                .map(|v| Duration::from_secs(v * 3600))
                .map_err(|e| e.to_string())
        } else {
            s.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string())
        }
    }
}
