//! Path locking for the namespace tree.
//!
//! Every inode and every parent/child edge has a read/write lock. A walk from
//! the root to a path takes, for each component, the edge lock and then the
//! child inode lock, always parent before child. Two walks therefore either
//! touch disjoint locks or meet on a shared prefix in the same order, which
//! rules out deadlock. The result of a walk is a [`PathLockGuard`] that
//! releases its locks leaf to root when dropped.
//!
//! Lock records live in a pool and are dropped from it once no guard or
//! waiter references them.

use crate::error::{CanopyError, Result};
use crate::metadata::inode::Inode;
use crate::metadata::tree::InodeTree;
use crate::path::NamespacePath;
use crate::types::{InodeId, ROOT_INODE_ID};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::debug;

/// Attempts made by [`LockManager::lock_full_path_by_id`] when the inode
/// moves during the walk.
const LOCK_BY_ID_ATTEMPTS: usize = 3;

/// How a path is locked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockPattern {
    /// Every edge and inode shared.
    Read,
    /// Ancestors shared; the final edge and the target inode (if present)
    /// exclusive. The target need not exist.
    WriteEdge,
    /// Ancestors shared; the target inode exclusive.
    WriteInode,
}

/// Lock mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Shared lock (multiple readers).
    Read,
    /// Exclusive lock (single writer).
    Write,
}

/// What a lock protects.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LockKey {
    /// An inode's attributes and child set.
    Inode(InodeId),
    /// The link from a directory to the child with a given name.
    Edge { parent: InodeId, name: String },
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockKey::Inode(id) => write!(f, "inode:{}", id),
            LockKey::Edge { parent, name } => write!(f, "edge:{}/{}", parent, name),
        }
    }
}

#[derive(Debug, Default)]
struct LockCounters {
    acquired: AtomicU64,
    contended: AtomicU64,
    path_changed: AtomicU64,
    exclusive_held: AtomicU64,
}

/// Lock statistics.
#[derive(Debug, Clone, Default)]
pub struct LockStats {
    /// Locks granted.
    pub acquired: u64,
    /// Locks that had to wait.
    pub contended: u64,
    /// Walks aborted because the path changed.
    pub path_changed: u64,
    /// Exclusive locks currently held.
    pub exclusive_held: u64,
    /// Lock records currently pooled.
    pub pooled: usize,
}

struct LockPool {
    locks: Mutex<HashMap<LockKey, Arc<RwLock<()>>>>,
    counters: LockCounters,
}

impl LockPool {
    async fn acquire(self: &Arc<Self>, key: LockKey, mode: LockMode) -> LockHandle {
        let lock = self
            .locks
            .lock()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone();

        let held = match mode {
            LockMode::Read => match lock.clone().try_read_owned() {
                Ok(guard) => Held::Read(guard),
                Err(_) => {
                    self.counters.contended.fetch_add(1, Ordering::Relaxed);
                    Held::Read(lock.read_owned().await)
                }
            },
            LockMode::Write => match lock.clone().try_write_owned() {
                Ok(guard) => Held::Write(guard),
                Err(_) => {
                    self.counters.contended.fetch_add(1, Ordering::Relaxed);
                    Held::Write(lock.write_owned().await)
                }
            },
        };
        self.counters.acquired.fetch_add(1, Ordering::Relaxed);
        if mode == LockMode::Write {
            self.counters.exclusive_held.fetch_add(1, Ordering::Relaxed);
        }

        LockHandle {
            key,
            mode,
            held: Some(held),
            pool: Arc::clone(self),
        }
    }

    fn release(&self, key: &LockKey) {
        let mut locks = self.locks.lock();
        if let Some(lock) = locks.get(key) {
            if Arc::strong_count(lock) == 1 {
                locks.remove(key);
            }
        }
    }
}

#[allow(dead_code)]
enum Held {
    Read(OwnedRwLockReadGuard<()>),
    Write(OwnedRwLockWriteGuard<()>),
}

/// One held lock.
struct LockHandle {
    key: LockKey,
    mode: LockMode,
    held: Option<Held>,
    pool: Arc<LockPool>,
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        self.held.take();
        if self.mode == LockMode::Write {
            self.pool.counters.exclusive_held.fetch_sub(1, Ordering::Relaxed);
        }
        self.pool.release(&self.key);
    }
}

/// A descendant visited by [`PathLockGuard::lock_descendants`].
#[derive(Debug, Clone)]
pub struct Descendant {
    pub path: NamespacePath,
    pub inode: Inode,
}

/// Grants path locks over one namespace tree.
pub struct LockManager {
    tree: Arc<InodeTree>,
    pool: Arc<LockPool>,
}

impl LockManager {
    pub fn new(tree: Arc<InodeTree>) -> Self {
        Self {
            tree,
            pool: Arc::new(LockPool {
                locks: Mutex::new(HashMap::new()),
                counters: LockCounters::default(),
            }),
        }
    }

    pub fn tree(&self) -> &Arc<InodeTree> {
        &self.tree
    }

    fn empty_guard(&self, path: NamespacePath, pattern: LockPattern) -> PathLockGuard {
        PathLockGuard {
            tree: Arc::clone(&self.tree),
            pool: Arc::clone(&self.pool),
            path,
            pattern,
            ids: Vec::new(),
            locks: Vec::new(),
        }
    }

    /// Lock `path` with `pattern`.
    ///
    /// The walk stops at the first missing component; the guard then covers
    /// the existing prefix. Fails with [`CanopyError::PathChanged`] when a
    /// component is detached while the walk is in flight.
    pub async fn lock_path(&self, path: &NamespacePath, pattern: LockPattern) -> Result<PathLockGuard> {
        let mut guard = self.empty_guard(path.clone(), pattern);
        let root_mode = if path.is_root() && pattern != LockPattern::Read {
            LockMode::Write
        } else {
            LockMode::Read
        };
        guard.push_lock(LockKey::Inode(ROOT_INODE_ID), root_mode).await;
        guard.ids.push(ROOT_INODE_ID);
        guard.walk().await?;
        Ok(guard)
    }

    /// Lock two paths for a rename.
    ///
    /// The common ancestor chain of both parents is read-locked once, then
    /// both branches are walked in name order of their first differing
    /// component. Neither path may be a prefix of the other.
    pub async fn lock_path_pair(
        &self,
        src: &NamespacePath,
        dst: &NamespacePath,
        pattern: LockPattern,
    ) -> Result<LockedPathPair> {
        if src.is_prefix_of(dst) {
            return Err(CanopyError::InvalidPath(format!(
                "Cannot rename because {} is a prefix of {}",
                src, dst
            )));
        }
        if dst.is_ancestor_of(src) {
            // The destination exists exactly when the source does.
            let existing = self.lock_path(src, LockPattern::Read).await?;
            return Err(if existing.full_path_exists() {
                CanopyError::AlreadyExists(dst.to_string())
            } else {
                CanopyError::NotFound(src.to_string())
            });
        }

        let (src_parent, dst_parent) = match (src.parent(), dst.parent()) {
            (Some(s), Some(d)) => (s, d),
            _ => {
                return Err(CanopyError::InvalidPath(
                    "Cannot rename to or from the root".to_string(),
                ))
            }
        };
        let common = src_parent.common_depth(&dst_parent);
        let prefix = self.lock_path(&src_parent.prefix(common), LockPattern::Read).await?;
        if !prefix.full_path_exists() {
            // Both parents lie below a missing or file component, so the
            // source cannot exist. The branches would re-lock edges the
            // prefix already holds.
            return Err(CanopyError::NotFound(src.to_string()));
        }

        let src_components = src.components();
        let dst_components = dst.components();
        let src_first = src_components.get(common) <= dst_components.get(common);

        let mut first = prefix.branch(if src_first { src } else { dst }, pattern);
        first.walk().await?;
        let mut second = prefix.branch(if src_first { dst } else { src }, pattern);
        second.walk().await?;

        Ok(LockedPathPair {
            second,
            first,
            prefix,
            src_first,
        })
    }

    /// Lock the current path of inode `id`.
    pub async fn lock_full_path_by_id(&self, id: InodeId, pattern: LockPattern) -> Result<PathLockGuard> {
        for attempt in 1..=LOCK_BY_ID_ATTEMPTS {
            let path = self.tree.path_of(id)?;
            match self.lock_path(&path, pattern).await {
                Ok(guard) if guard.target_id() == Some(id) => return Ok(guard),
                Ok(_) | Err(CanopyError::PathChanged(_)) => {
                    self.pool.counters.path_changed.fetch_add(1, Ordering::Relaxed);
                    debug!(inode = id, attempt, "Inode moved while locking, retrying");
                }
                Err(e) => return Err(e),
            }
        }
        Err(CanopyError::PathChanged(format!(
            "inode {} kept moving while being locked",
            id
        )))
    }

    pub fn stats(&self) -> LockStats {
        let counters = &self.pool.counters;
        LockStats {
            acquired: counters.acquired.load(Ordering::Relaxed),
            contended: counters.contended.load(Ordering::Relaxed),
            path_changed: counters.path_changed.load(Ordering::Relaxed),
            exclusive_held: counters.exclusive_held.load(Ordering::Relaxed),
            pooled: self.pool.locks.lock().len(),
        }
    }
}

/// A locked walk from the root towards a path.
///
/// Holds the ids of the existing components (root first) and the locks this
/// guard acquired. Locks are released leaf to root on drop.
pub struct PathLockGuard {
    tree: Arc<InodeTree>,
    pool: Arc<LockPool>,
    path: NamespacePath,
    pattern: LockPattern,
    ids: Vec<InodeId>,
    locks: Vec<LockHandle>,
}

impl PathLockGuard {
    pub fn path(&self) -> &NamespacePath {
        &self.path
    }

    pub fn pattern(&self) -> LockPattern {
        self.pattern
    }

    /// Ids of the existing components, root first.
    pub fn inode_ids(&self) -> &[InodeId] {
        &self.ids
    }

    /// The existing components, root first.
    pub fn inodes(&self) -> Vec<Inode> {
        self.ids.iter().filter_map(|id| self.tree.get(*id)).collect()
    }

    /// Whether every component of the path exists.
    pub fn full_path_exists(&self) -> bool {
        self.ids.len() == self.path.depth() + 1
    }

    /// Id of the target, if it exists.
    pub fn target_id(&self) -> Option<InodeId> {
        if self.full_path_exists() {
            self.ids.last().copied()
        } else {
            None
        }
    }

    /// The target inode.
    pub fn target(&self) -> Result<Inode> {
        self.target_id()
            .and_then(|id| self.tree.get(id))
            .ok_or_else(|| CanopyError::NotFound(self.path.to_string()))
    }

    /// The parent inode of the target.
    pub fn parent(&self) -> Result<Inode> {
        let depth = self.path.depth();
        if depth == 0 || self.ids.len() < depth {
            let parent = self.path.parent().unwrap_or_else(NamespacePath::root);
            return Err(CanopyError::NotFound(parent.to_string()));
        }
        self.tree
            .get(self.ids[depth - 1])
            .ok_or_else(|| CanopyError::NotFound(self.path.to_string()))
    }

    /// The deepest existing component.
    pub fn last_existing(&self) -> Result<Inode> {
        self.ids
            .last()
            .and_then(|id| self.tree.get(*id))
            .ok_or_else(|| CanopyError::NotFound(self.path.to_string()))
    }

    /// Number of existing components below the root.
    pub fn existing_depth(&self) -> usize {
        self.ids.len().saturating_sub(1)
    }

    /// Forget the last inode after it was deleted, releasing its lock.
    pub fn remove_last_inode(&mut self) {
        if let Some(id) = self.ids.pop() {
            if self.locks.last().map(|h| &h.key) == Some(&LockKey::Inode(id)) {
                self.locks.pop();
            }
        }
    }

    /// Extend the view by an inode created below the locked prefix.
    ///
    /// No lock is taken: a new inode is only reachable through the edge
    /// this guard holds exclusively.
    pub fn add_created_inode(&mut self, id: InodeId) {
        if self.ids.len() <= self.path.depth() {
            self.ids.push(id);
        }
    }

    /// Children of the target in name order.
    pub fn children(&self) -> Result<Vec<(String, InodeId)>> {
        let id = self
            .target_id()
            .ok_or_else(|| CanopyError::NotFound(self.path.to_string()))?;
        Ok(self.tree.children(id))
    }

    /// Lock the child `name` of the target.
    ///
    /// The returned guard shares this guard's view and owns only the locks
    /// of the extra component, so it must be dropped first.
    pub async fn lock_child(&self, name: &str, pattern: LockPattern) -> Result<PathLockGuard> {
        if !self.full_path_exists() {
            return Err(CanopyError::NotFound(self.path.to_string()));
        }
        let mut child = PathLockGuard {
            tree: Arc::clone(&self.tree),
            pool: Arc::clone(&self.pool),
            path: self.path.join(name)?,
            pattern,
            ids: self.ids.clone(),
            locks: Vec::new(),
        };
        child.walk().await?;
        Ok(child)
    }

    /// Visit every descendant of the target in pre-order.
    ///
    /// Each child is locked for reading only while it is visited. The target
    /// lock keeps the subtree stable for writers holding it.
    pub async fn lock_descendants(&self) -> Result<Vec<Descendant>> {
        let target = self
            .target_id()
            .ok_or_else(|| CanopyError::NotFound(self.path.to_string()))?;
        let mut visited = Vec::new();
        let mut stack: Vec<(NamespacePath, InodeId, String)> = Vec::new();
        for (name, _) in self.tree.children(target).into_iter().rev() {
            stack.push((self.path.join(&name)?, target, name));
        }

        while let Some((path, parent, name)) = stack.pop() {
            let _edge = self
                .pool
                .acquire(LockKey::Edge { parent, name: name.clone() }, LockMode::Read)
                .await;
            let Some(child) = self.tree.child_id(parent, &name) else {
                continue;
            };
            let _inode = self.pool.acquire(LockKey::Inode(child), LockMode::Read).await;
            let Some(inode) = self.tree.get(child) else {
                continue;
            };
            for (grandchild, _) in self.tree.children(child).into_iter().rev() {
                stack.push((path.join(&grandchild)?, child, grandchild));
            }
            visited.push(Descendant { path, inode });
        }
        Ok(visited)
    }

    /// A guard for `path` that continues from this guard's locked prefix.
    fn branch(&self, path: &NamespacePath, pattern: LockPattern) -> PathLockGuard {
        PathLockGuard {
            tree: Arc::clone(&self.tree),
            pool: Arc::clone(&self.pool),
            path: path.clone(),
            pattern,
            ids: self.ids.clone(),
            locks: Vec::new(),
        }
    }

    async fn push_lock(&mut self, key: LockKey, mode: LockMode) {
        let handle = self.pool.acquire(key, mode).await;
        self.locks.push(handle);
    }

    /// Walk from the deepest locked component towards the target.
    async fn walk(&mut self) -> Result<()> {
        let components: Vec<String> = self.path.components().iter().map(|c| c.to_string()).collect();
        let depth = components.len();

        while self.ids.len() <= depth {
            let index = self.ids.len() - 1;
            let parent = self.ids[index];
            let name = components[index].as_str();
            let is_last = index + 1 == depth;

            match self.tree.is_directory(parent) {
                Some(true) => {}
                Some(false) => return Ok(()),
                None => return Err(self.path_changed(parent)),
            }

            let edge_key = LockKey::Edge {
                parent,
                name: name.to_string(),
            };
            let write_edge = is_last && self.pattern == LockPattern::WriteEdge;
            let mut edge = self
                .pool
                .acquire(edge_key.clone(), if write_edge { LockMode::Write } else { LockMode::Read })
                .await;
            let mut child = self.tree.child_id(parent, name);
            if child.is_none() && self.pattern == LockPattern::WriteEdge && !write_edge {
                // The first missing edge is taken exclusively so the caller
                // can create the rest of the path.
                drop(edge);
                edge = self.pool.acquire(edge_key, LockMode::Write).await;
                child = self.tree.child_id(parent, name);
            }
            self.locks.push(edge);

            let Some(child) = child else {
                return Ok(());
            };
            let inode_mode = if is_last && self.pattern != LockPattern::Read {
                LockMode::Write
            } else {
                LockMode::Read
            };
            self.push_lock(LockKey::Inode(child), inode_mode).await;
            if !self.tree.is_attached(child, parent, name) {
                return Err(self.path_changed(child));
            }
            self.ids.push(child);
        }
        Ok(())
    }

    fn path_changed(&self, id: InodeId) -> CanopyError {
        self.pool.counters.path_changed.fetch_add(1, Ordering::Relaxed);
        CanopyError::PathChanged(format!("{} (inode {})", self.path, id))
    }

    #[cfg(test)]
    fn held(&self) -> Vec<(LockKey, LockMode)> {
        self.locks.iter().map(|h| (h.key.clone(), h.mode)).collect()
    }
}

impl Drop for PathLockGuard {
    fn drop(&mut self) {
        while let Some(handle) = self.locks.pop() {
            drop(handle);
        }
    }
}

/// Locks of a rename source and destination.
///
/// Fields drop in declaration order, which releases the branch locked last
/// first and the shared prefix at the end.
pub struct LockedPathPair {
    second: PathLockGuard,
    first: PathLockGuard,
    prefix: PathLockGuard,
    src_first: bool,
}

impl std::fmt::Debug for LockedPathPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockedPathPair")
            .field("src", self.src().path())
            .field("dst", self.dst().path())
            .finish_non_exhaustive()
    }
}

impl LockedPathPair {
    pub fn src(&self) -> &PathLockGuard {
        if self.src_first {
            &self.first
        } else {
            &self.second
        }
    }

    pub fn dst(&self) -> &PathLockGuard {
        if self.src_first {
            &self.second
        } else {
            &self.first
        }
    }

    pub fn src_mut(&mut self) -> &mut PathLockGuard {
        if self.src_first {
            &mut self.first
        } else {
            &mut self.second
        }
    }

    pub fn dst_mut(&mut self) -> &mut PathLockGuard {
        if self.src_first {
            &mut self.second
        } else {
            &mut self.first
        }
    }

    /// Depth of the shared, read-locked prefix.
    pub fn prefix_depth(&self) -> usize {
        self.prefix.path().depth()
    }
}
