//! Namespace tree.
//!
//! Holds every inode and the parent/child edges. The tree is only changed by
//! applying [`JournalEntry`] values: mutators apply an entry and append it to
//! the caller's [`JournalContext`], and replay applies the same entries to a
//! fresh tree. Callers must hold the matching path locks; the internal
//! `RwLock` only protects the maps and is never held across an await.

use super::inode::{Inode, InodeKind};
use crate::error::{CanopyError, Result};
use crate::journal::{DirectoryUpdate, FileUpdate, InodeUpdate, JournalContext, JournalEntry, XAttrPatch};
use crate::path::NamespacePath;
use crate::types::*;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, trace};

struct InodeStore {
    inodes: HashMap<InodeId, Inode>,
    next_id: InodeId,
}

/// The in-memory namespace.
pub struct InodeTree {
    store: RwLock<InodeStore>,
}

impl InodeTree {
    /// Create a tree holding only the root directory.
    pub fn new(root_owner: &str, root_group: &str, root_mode: Mode) -> Self {
        let mut inodes = HashMap::new();
        inodes.insert(ROOT_INODE_ID, Inode::root(root_owner, root_group, root_mode));
        Self {
            store: RwLock::new(InodeStore {
                inodes,
                next_id: ROOT_INODE_ID + 1,
            }),
        }
    }

    /// Allocate a fresh inode id.
    pub fn next_inode_id(&self) -> InodeId {
        let mut store = self.store.write();
        let id = store.next_id;
        store.next_id += 1;
        id
    }

    pub fn get(&self, id: InodeId) -> Option<Inode> {
        self.store.read().inodes.get(&id).cloned()
    }

    pub fn root(&self) -> Option<Inode> {
        self.get(ROOT_INODE_ID)
    }

    pub fn contains(&self, id: InodeId) -> bool {
        self.store.read().inodes.contains_key(&id)
    }

    /// Number of inodes, root included.
    pub fn len(&self) -> usize {
        self.store.read().inodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `Some(true)` for a directory, `None` if the inode is gone.
    pub fn is_directory(&self, id: InodeId) -> Option<bool> {
        self.store.read().inodes.get(&id).map(|i| i.is_directory())
    }

    /// Id of the child `name` of directory `parent`.
    pub fn child_id(&self, parent: InodeId, name: &str) -> Option<InodeId> {
        match self.store.read().inodes.get(&parent).map(|i| &i.kind) {
            Some(InodeKind::Directory(dir)) => dir.children.get(name).copied(),
            _ => None,
        }
    }

    /// Whether `id` exists and is the child `name` of `parent`.
    pub fn is_attached(&self, id: InodeId, parent: InodeId, name: &str) -> bool {
        let store = self.store.read();
        let attached = store
            .inodes
            .get(&id)
            .map(|i| i.parent_id == parent && i.name == name)
            .unwrap_or(false);
        let listed = match store.inodes.get(&parent).map(|i| &i.kind) {
            Some(InodeKind::Directory(dir)) => dir.children.get(name) == Some(&id),
            _ => false,
        };
        attached && listed
    }

    /// Children of a directory in name order; empty for files.
    pub fn children(&self, id: InodeId) -> Vec<(String, InodeId)> {
        match self.store.read().inodes.get(&id).map(|i| &i.kind) {
            Some(InodeKind::Directory(dir)) => dir
                .children
                .iter()
                .map(|(name, child)| (name.clone(), *child))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Current path of an inode.
    pub fn path_of(&self, id: InodeId) -> Result<NamespacePath> {
        let store = self.store.read();
        let mut names = Vec::new();
        let mut current = id;
        while current != ROOT_INODE_ID {
            let inode = store
                .inodes
                .get(&current)
                .ok_or(CanopyError::InodeNotFound(current))?;
            names.push(inode.name.clone());
            current = inode.parent_id;
            if names.len() > store.inodes.len() {
                return Err(CanopyError::Internal(format!("Cycle above inode {}", id)));
            }
        }
        names.reverse();
        NamespacePath::new(format!("/{}", names.join("/")))
    }

    /// Every inode with a TTL set.
    pub fn inodes_with_ttl(&self) -> Vec<Inode> {
        self.store
            .read()
            .inodes
            .values()
            .filter(|i| i.ttl != NO_TTL)
            .cloned()
            .collect()
    }

    /// Copy of every inode keyed by id.
    pub fn snapshot(&self) -> BTreeMap<InodeId, Inode> {
        self.store
            .read()
            .inodes
            .iter()
            .map(|(id, inode)| (*id, inode.clone()))
            .collect()
    }

    /// Attach a new inode to its parent.
    pub fn create_inode(&self, ctx: &mut JournalContext, inode: Inode) -> Result<()> {
        self.apply_and_journal(ctx, JournalEntry::CreateInode { inode })
    }

    pub fn update_inode(&self, ctx: &mut JournalContext, id: InodeId, update: InodeUpdate) -> Result<()> {
        if update.is_empty() {
            return Ok(());
        }
        self.apply_and_journal(ctx, JournalEntry::UpdateInode { id, update })
    }

    pub fn update_file(&self, ctx: &mut JournalContext, id: InodeId, update: FileUpdate) -> Result<()> {
        self.apply_and_journal(ctx, JournalEntry::UpdateInodeFile { id, update })
    }

    pub fn update_directory(&self, ctx: &mut JournalContext, id: InodeId, update: DirectoryUpdate) -> Result<()> {
        self.apply_and_journal(ctx, JournalEntry::UpdateInodeDirectory { id, update })
    }

    /// Move an inode under a new parent and name.
    pub fn rename(
        &self,
        ctx: &mut JournalContext,
        id: InodeId,
        new_parent_id: InodeId,
        new_name: &str,
        op_time_ms: i64,
    ) -> Result<()> {
        self.apply_and_journal(
            ctx,
            JournalEntry::Rename {
                id,
                new_parent_id,
                new_name: new_name.to_string(),
                op_time_ms,
            },
        )
    }

    /// Detach and drop an inode. Directories must be empty.
    pub fn delete_inode(&self, ctx: &mut JournalContext, id: InodeId, op_time_ms: i64) -> Result<()> {
        self.apply_and_journal(ctx, JournalEntry::DeleteInode { id, op_time_ms })
    }

    /// Append a block to a file.
    pub fn add_block(&self, ctx: &mut JournalContext, id: InodeId, block_id: BlockId) -> Result<()> {
        self.apply_and_journal(ctx, JournalEntry::NewBlock { id, block_id })
    }

    fn apply_and_journal(&self, ctx: &mut JournalContext, entry: JournalEntry) -> Result<()> {
        self.apply(&entry)?;
        ctx.append(entry);
        Ok(())
    }

    /// Apply one entry. Mount and sync point entries are ignored.
    pub fn apply(&self, entry: &JournalEntry) -> Result<()> {
        let mut store = self.store.write();
        trace!(kind = entry.kind(), "Applying journal entry");
        match entry {
            JournalEntry::CreateInode { inode } => {
                if store.inodes.contains_key(&inode.id) {
                    return Err(CanopyError::Internal(format!("Inode {} already exists", inode.id)));
                }
                let parent = store
                    .inodes
                    .get_mut(&inode.parent_id)
                    .ok_or(CanopyError::InodeNotFound(inode.parent_id))?;
                parent.last_modification_time_ms = parent.last_modification_time_ms.max(inode.creation_time_ms);
                match &mut parent.kind {
                    InodeKind::Directory(dir) => {
                        if dir.children.contains_key(&inode.name) {
                            return Err(CanopyError::AlreadyExists(inode.name.clone()));
                        }
                        dir.children.insert(inode.name.clone(), inode.id);
                    }
                    InodeKind::File(_) => {
                        return Err(CanopyError::NotADirectory(parent.name.clone()));
                    }
                }
                store.next_id = store.next_id.max(inode.id + 1);
                store.inodes.insert(inode.id, inode.clone());
            }
            JournalEntry::UpdateInode { id, update } => {
                let inode = store.inodes.get_mut(id).ok_or(CanopyError::InodeNotFound(*id))?;
                apply_inode_update(inode, update);
            }
            JournalEntry::UpdateInodeFile { id, update } => {
                let inode = store.inodes.get_mut(id).ok_or(CanopyError::InodeNotFound(*id))?;
                let InodeKind::File(file) = &mut inode.kind else {
                    return Err(CanopyError::NotAFile(inode.name.clone()));
                };
                if let Some(completed) = update.completed {
                    file.completed = completed;
                }
                if let Some(length) = update.length {
                    file.length = length;
                }
                if let Some(block_ids) = &update.block_ids {
                    file.block_ids = block_ids.clone();
                }
                if let Some(job_id) = update.persist_job_id {
                    file.persist_job_id = job_id;
                }
                if let Some(temp) = &update.temp_ufs_path {
                    file.temp_ufs_path = temp.clone();
                }
            }
            JournalEntry::UpdateInodeDirectory { id, update } => {
                let inode = store.inodes.get_mut(id).ok_or(CanopyError::InodeNotFound(*id))?;
                let InodeKind::Directory(dir) = &mut inode.kind else {
                    return Err(CanopyError::NotADirectory(inode.name.clone()));
                };
                if let Some(mount_point) = update.mount_point {
                    dir.mount_point = mount_point;
                }
                if let Some(loaded) = update.direct_children_loaded {
                    dir.direct_children_loaded = loaded;
                }
                if let Some(default_acl) = &update.default_acl {
                    dir.default_acl = default_acl.clone();
                }
            }
            JournalEntry::Rename {
                id,
                new_parent_id,
                new_name,
                op_time_ms,
            } => {
                let (old_parent_id, old_name) = {
                    let inode = store.inodes.get(id).ok_or(CanopyError::InodeNotFound(*id))?;
                    (inode.parent_id, inode.name.clone())
                };
                match store.inodes.get(new_parent_id).map(|p| &p.kind) {
                    Some(InodeKind::Directory(dir)) if !dir.children.contains_key(new_name) => {}
                    Some(InodeKind::Directory(_)) => return Err(CanopyError::AlreadyExists(new_name.clone())),
                    Some(InodeKind::File(_)) => return Err(CanopyError::NotADirectory(new_name.clone())),
                    None => return Err(CanopyError::InodeNotFound(*new_parent_id)),
                }
                detach(&mut store, old_parent_id, &old_name, *op_time_ms);
                if let Some(InodeKind::Directory(dir)) = store.inodes.get_mut(new_parent_id).map(|p| &mut p.kind) {
                    dir.children.insert(new_name.clone(), *id);
                }
                touch(&mut store, *new_parent_id, *op_time_ms);
                if let Some(inode) = store.inodes.get_mut(id) {
                    inode.parent_id = *new_parent_id;
                    inode.name = new_name.clone();
                }
            }
            JournalEntry::DeleteInode { id, op_time_ms } => {
                if *id == ROOT_INODE_ID {
                    return Err(CanopyError::InvalidPath("Cannot delete the root inode".to_string()));
                }
                let inode = store.inodes.get(id).ok_or(CanopyError::InodeNotFound(*id))?;
                if inode.child_count() > 0 {
                    return Err(CanopyError::DirectoryNotEmpty(inode.name.clone()));
                }
                let (parent_id, name) = (inode.parent_id, inode.name.clone());
                detach(&mut store, parent_id, &name, *op_time_ms);
                store.inodes.remove(id);
            }
            JournalEntry::NewBlock { id, block_id } => {
                let inode = store.inodes.get_mut(id).ok_or(CanopyError::InodeNotFound(*id))?;
                match &mut inode.kind {
                    InodeKind::File(file) => file.block_ids.push(*block_id),
                    InodeKind::Directory(_) => return Err(CanopyError::NotAFile(inode.name.clone())),
                }
            }
            JournalEntry::AddMountPoint { .. }
            | JournalEntry::UpdateMountPoint { .. }
            | JournalEntry::DeleteMountPoint { .. }
            | JournalEntry::AddSyncPoint { .. }
            | JournalEntry::RemoveSyncPoint { .. } => {}
        }
        Ok(())
    }

    /// Rebuild the namespace from journal entries.
    pub fn replay<'a, I>(&self, entries: I) -> Result<usize>
    where
        I: IntoIterator<Item = &'a JournalEntry>,
    {
        let mut applied = 0;
        for entry in entries {
            self.apply(entry)?;
            applied += 1;
        }
        debug!(entries = applied, inodes = self.len(), "Replayed namespace journal");
        Ok(applied)
    }
}

fn detach(store: &mut InodeStore, parent_id: InodeId, name: &str, op_time_ms: i64) {
    if let Some(InodeKind::Directory(dir)) = store.inodes.get_mut(&parent_id).map(|p| &mut p.kind) {
        dir.children.remove(name);
    }
    touch(store, parent_id, op_time_ms);
}

fn touch(store: &mut InodeStore, id: InodeId, op_time_ms: i64) {
    if let Some(inode) = store.inodes.get_mut(&id) {
        inode.last_modification_time_ms = inode.last_modification_time_ms.max(op_time_ms);
    }
}

fn apply_inode_update(inode: &mut Inode, update: &InodeUpdate) {
    if let Some(owner) = &update.owner {
        inode.owner = owner.clone();
    }
    if let Some(group) = &update.group {
        inode.group = group.clone();
    }
    if let Some(mode) = update.mode {
        inode.mode = mode;
    }
    if let Some(acl) = &update.acl {
        inode.acl = acl.clone();
    }
    if let Some(pinned) = update.pinned {
        inode.pinned = pinned;
    }
    if let Some(ttl) = update.ttl {
        inode.ttl = ttl;
    }
    if let Some(action) = update.ttl_action {
        inode.ttl_action = action;
    }
    if let Some(state) = update.persistence_state {
        inode.persistence_state = state;
    }
    if let Some(fingerprint) = &update.ufs_fingerprint {
        inode.ufs_fingerprint = fingerprint.clone();
    }
    if let Some(mtime) = update.last_modification_time_ms {
        inode.last_modification_time_ms = mtime;
    }
    if let Some(atime) = update.last_access_time_ms {
        inode.last_access_time_ms = atime;
    }
    if let Some(patch) = &update.xattr {
        apply_xattr(&mut inode.xattr, patch);
    }
}

fn apply_xattr(xattr: &mut HashMap<String, Vec<u8>>, patch: &XAttrPatch) {
    match patch.strategy {
        XAttrUpdateStrategy::ReplaceAll => {
            *xattr = patch.values.clone();
        }
        XAttrUpdateStrategy::UnionReplace => {
            for (key, value) in &patch.values {
                xattr.insert(key.clone(), value.clone());
            }
        }
        XAttrUpdateStrategy::UnionPreserve => {
            for (key, value) in &patch.values {
                xattr.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }
        XAttrUpdateStrategy::DeleteKeys => {
            for key in patch.values.keys() {
                xattr.remove(key);
            }
        }
    }
}
