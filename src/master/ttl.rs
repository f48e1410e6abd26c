//! TTL expiry heartbeat.

use super::{DeleteOptions, FileSystemMaster, FreeOptions, SetAttributeOptions};
use crate::error::Result;
use crate::heartbeat::HeartbeatExecutor;
use crate::metadata::Inode;
use crate::types::{now_ms, TtlAction, NO_TTL};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Deletes or frees inodes whose TTL has elapsed.
pub struct TtlChecker {
    master: Arc<FileSystemMaster>,
}

impl TtlChecker {
    pub fn new(master: Arc<FileSystemMaster>) -> Self {
        Self { master }
    }

    async fn expire(&self, inode: &Inode) -> Result<()> {
        let master = &self.master;
        let ctx = master.system_context();
        let path = master.tree().path_of(inode.id)?;
        match inode.ttl_action {
            TtlAction::Delete | TtlAction::DeleteAlluxio => {
                let options = DeleteOptions {
                    recursive: true,
                    alluxio_only: inode.ttl_action == TtlAction::DeleteAlluxio,
                    unchecked: true,
                    ..Default::default()
                };
                master.delete(&ctx, &path, options).await?;
            }
            TtlAction::Free => {
                let options = FreeOptions {
                    recursive: true,
                    forced: true,
                };
                master.free(&ctx, &path, options).await?;
                let clear = SetAttributeOptions {
                    ttl: Some(NO_TTL),
                    ttl_action: Some(TtlAction::Delete),
                    ..Default::default()
                };
                master.set_attribute(&ctx, &path, clear).await?;
            }
        }
        info!(path = %path, action = ?inode.ttl_action, "Expired inode");
        Ok(())
    }
}

#[async_trait]
impl HeartbeatExecutor for TtlChecker {
    fn name(&self) -> &str {
        "ttl-checker"
    }

    async fn heartbeat(&self) -> Result<()> {
        let now = now_ms();
        let mut expired: Vec<Inode> = self
            .master
            .tree()
            .inodes_with_ttl()
            .into_iter()
            .filter(|inode| inode.creation_time_ms.saturating_add(inode.ttl) <= now)
            .collect();
        // Oldest first; inodes removed with an expired ancestor are skipped.
        expired.sort_by_key(|inode| inode.creation_time_ms);

        for inode in expired {
            if !self.master.tree().contains(inode.id) {
                continue;
            }
            match self.expire(&inode).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {
                    debug!(inode = inode.id, "Expired inode already gone");
                }
                Err(e) => warn!(inode = inode.id, error = %e, "Failed to expire inode"),
            }
        }
        Ok(())
    }
}
