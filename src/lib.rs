//! Canopy - the namespace mutation engine of a metadata master.
//!
//! Canopy keeps a hierarchical namespace of files and directories in
//! memory, journals every change, and mirrors the namespace into one or
//! more under storage systems mounted at namespace paths.
//!
//! # Features
//!
//! - **Path locking**: per-inode and per-edge read/write locks taken in
//!   path order, with rename locking two paths without deadlock.
//! - **Journaled mutations**: create, complete, delete, rename, free,
//!   attribute and ACL updates, mount and unmount, each applied under a
//!   transaction context that flushes the journal before locks are dropped.
//! - **Asynchronous persistence**: files are copied to under storage by an
//!   external job service, driven by a scheduler and a checker heartbeat
//!   with per-file exponential backoff.
//! - **Operation dedup**: retried client calls carrying the same operation
//!   id are not applied twice.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      FileSystemMaster                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Operations: create | delete | rename | free | attrs | mount │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Lock manager | Inode tree | Mount table | Journal           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Heartbeats: persistence scheduler | checker | TTL           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Under storage adapters | Job service | Block master         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use canopy::config::CanopyConfig;
//!
//! #[tokio::main]
//! async fn main() -> canopy::Result<()> {
//!     let config = CanopyConfig::development();
//!     canopy::run(config).await
//! }
//! ```

pub mod acl;
pub mod block;
pub mod cli;
pub mod config;
pub mod dedup;
pub mod error;
pub mod heartbeat;
pub mod job;
pub mod journal;
pub mod lock;
pub mod master;
pub mod metadata;
pub mod mount;
pub mod observability;
pub mod path;
pub mod persistence;
pub mod shutdown;
pub mod sync;
pub mod types;
pub mod ufs;

// Re-exports
pub use error::{CanopyError, Result};
pub use master::{CallContext, FileSystemMaster};
pub use path::NamespacePath;

use config::CanopyConfig;
use shutdown::{ShutdownCoordinator, SignalHandler};
use tracing::{error, info};

/// Run a namespace master until SIGTERM or SIGINT.
pub async fn run(config: CanopyConfig) -> Result<()> {
    observability::init(&config.observability)?;
    info!(root_ufs = %config.master.root_ufs_uri, "Starting Canopy master");

    if config.master.root_ufs_uri.starts_with('/') {
        std::fs::create_dir_all(&config.master.root_ufs_uri)?;
    }

    let master = FileSystemMaster::builder(config.clone()).build()?;
    let coordinator = ShutdownCoordinator::new();
    let heartbeats = master.start_heartbeats(&config.heartbeat, &coordinator);

    let signal_coordinator = coordinator.clone();
    tokio::spawn(async move {
        if let Err(e) = SignalHandler::new(signal_coordinator).run().await {
            error!(error = %e, "Signal handler failed");
        }
    });

    coordinator.wait_for_shutdown().await;
    info!("Shutting down Canopy gracefully...");

    for handle in heartbeats {
        handle.join(coordinator.timeout()).await;
    }

    info!(
        inodes = master.tree().len(),
        pending_persists = master.persist_queue().pending_len(),
        "Canopy shutdown complete"
    );
    Ok(())
}
