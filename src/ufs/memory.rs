//! In-memory under storage.

use super::{MkdirsOptions, SpaceType, StorageAdapter, UfsStatus};
use crate::acl::AclEntry;
use crate::error::{CanopyError, Result};
use crate::path::ufs_parent;
use crate::types::{now_ms, Mode};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashSet};
use uuid::Uuid;

/// Capacity reported by [`MemoryUfs::get_space`].
const MEMORY_CAPACITY_BYTES: u64 = 1 << 40;

/// Operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UfsOperation {
    GetStatus,
    Delete,
    Rename,
    Mkdirs,
    SetOwner,
    SetMode,
    SetAcl,
}

#[derive(Debug, Clone)]
struct MemEntry {
    is_directory: bool,
    length: u64,
    owner: String,
    group: String,
    mode: Mode,
    last_modified_ms: i64,
    content_hash: Option<String>,
    acl: Vec<AclEntry>,
}

impl MemEntry {
    fn directory(owner: &str, group: &str, mode: Mode) -> Self {
        Self {
            is_directory: true,
            length: 0,
            owner: owner.to_string(),
            group: group.to_string(),
            mode,
            last_modified_ms: now_ms(),
            content_hash: None,
            acl: Vec::new(),
        }
    }

    fn status(&self, path: &str) -> UfsStatus {
        UfsStatus {
            name: name_of(path).to_string(),
            is_directory: self.is_directory,
            length: self.length,
            owner: self.owner.clone(),
            group: self.group.clone(),
            mode: self.mode,
            last_modified_ms: self.last_modified_ms,
            content_hash: self.content_hash.clone(),
        }
    }
}

fn name_of(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn normalize(path: &str) -> &str {
    path.trim_end_matches('/')
}

fn child_prefix(path: &str) -> String {
    format!("{}/", normalize(path))
}

/// In-memory store keyed by full UFS path.
///
/// The hierarchical flavour requires parents to exist; the object-store
/// flavour treats every key prefix as an implicit directory.
pub struct MemoryUfs {
    entries: RwLock<BTreeMap<String, MemEntry>>,
    object_store: bool,
    failures: RwLock<HashSet<(UfsOperation, String)>>,
}

impl MemoryUfs {
    /// Hierarchical store.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            object_store: false,
            failures: RwLock::new(HashSet::new()),
        }
    }

    /// Object-store flavoured store.
    pub fn object_store() -> Self {
        Self {
            object_store: true,
            ..Self::new()
        }
    }

    /// Write a file of `length` bytes, creating parents.
    pub fn write_file(&self, path: &str, length: u64) {
        let path = normalize(path);
        let mut entries = self.entries.write();
        if !self.object_store {
            let mut parent = ufs_parent(path);
            while let Some(dir) = parent {
                if ufs_parent(&dir).is_none() {
                    break;
                }
                entries
                    .entry(dir.clone())
                    .or_insert_with(|| MemEntry::directory("", "", Mode::DIRECTORY_DEFAULT));
                parent = ufs_parent(&dir);
            }
        }
        entries.insert(
            path.to_string(),
            MemEntry {
                is_directory: false,
                length,
                owner: String::new(),
                group: String::new(),
                mode: Mode::FILE_DEFAULT,
                last_modified_ms: now_ms(),
                content_hash: Some(Uuid::new_v4().simple().to_string()),
                acl: Vec::new(),
            },
        );
    }

    /// Every stored path, sorted.
    pub fn paths(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    /// ACL entries last set on a path.
    pub fn acl_entries(&self, path: &str) -> Vec<AclEntry> {
        self.entries
            .read()
            .get(normalize(path))
            .map(|e| e.acl.clone())
            .unwrap_or_default()
    }

    /// Make `operation` fail on `path` until [`MemoryUfs::clear_failures`].
    pub fn inject_failure(&self, operation: UfsOperation, path: &str) {
        self.failures
            .write()
            .insert((operation, normalize(path).to_string()));
    }

    pub fn clear_failures(&self) {
        self.failures.write().clear();
    }

    fn check_failure(&self, operation: UfsOperation, path: &str) -> Result<()> {
        if self
            .failures
            .read()
            .contains(&(operation, normalize(path).to_string()))
        {
            return Err(CanopyError::Ufs(format!(
                "Injected {:?} failure on {}",
                operation, path
            )));
        }
        Ok(())
    }

    fn has_children(entries: &BTreeMap<String, MemEntry>, path: &str) -> bool {
        let prefix = child_prefix(path);
        entries
            .range(prefix.clone()..)
            .next()
            .map(|(k, _)| k.starts_with(&prefix))
            .unwrap_or(false)
    }

    fn lookup(&self, entries: &BTreeMap<String, MemEntry>, path: &str) -> Option<MemEntry> {
        let path = normalize(path);
        if let Some(entry) = entries.get(path) {
            return Some(entry.clone());
        }
        // Scheme roots always exist; object stores have implicit directories.
        if ufs_parent(path).is_none() || (self.object_store && Self::has_children(entries, path)) {
            return Some(MemEntry::directory("", "", Mode::DIRECTORY_DEFAULT));
        }
        None
    }

    fn parent_is_directory(&self, entries: &BTreeMap<String, MemEntry>, path: &str) -> bool {
        if self.object_store {
            return true;
        }
        match ufs_parent(path) {
            None => true,
            Some(parent) => self
                .lookup(entries, &parent)
                .map(|e| e.is_directory)
                .unwrap_or(false),
        }
    }

    fn rename_entry(&self, src: &str, dst: &str, directory: bool) -> Result<bool> {
        self.check_failure(UfsOperation::Rename, src)?;
        let (src, dst) = (normalize(src), normalize(dst));
        let mut entries = self.entries.write();
        let source = match self.lookup(&entries, src) {
            Some(entry) if entry.is_directory == directory => entry,
            _ => return Ok(false),
        };
        if entries.contains_key(dst) || !self.parent_is_directory(&entries, dst) {
            return Ok(false);
        }

        if directory {
            let prefix = child_prefix(src);
            let moved: Vec<String> = entries
                .keys()
                .filter(|k| k.starts_with(&prefix))
                .cloned()
                .collect();
            for key in moved {
                if let Some(entry) = entries.remove(&key) {
                    entries.insert(format!("{}/{}", dst, &key[prefix.len()..]), entry);
                }
            }
        }
        entries.remove(src);
        entries.insert(dst.to_string(), source);
        Ok(true)
    }

    fn update<F: FnOnce(&mut MemEntry)>(&self, path: &str, f: F) -> Result<()> {
        let path = normalize(path);
        let mut entries = self.entries.write();
        if let Some(entry) = entries.get_mut(path) {
            f(entry);
            return Ok(());
        }
        if self.lookup(&entries, path).is_some() {
            return Ok(());
        }
        Err(CanopyError::NotFound(path.to_string()))
    }
}

impl Default for MemoryUfs {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageAdapter for MemoryUfs {
    fn scheme(&self) -> &str {
        if self.object_store {
            "obj"
        } else {
            "mem"
        }
    }

    fn is_object_storage(&self) -> bool {
        self.object_store
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        self.check_failure(UfsOperation::GetStatus, path)?;
        Ok(self.lookup(&self.entries.read(), path).is_some())
    }

    async fn create_file(&self, path: &str, length: u64) -> Result<()> {
        if !self.object_store {
            let parent = ufs_parent(normalize(path));
            let exists = match &parent {
                Some(parent) => self.lookup(&self.entries.read(), parent).is_some(),
                None => true,
            };
            if !exists {
                return Err(CanopyError::NotFound(format!("parent of {}", path)));
            }
        }
        self.write_file(path, length);
        Ok(())
    }

    async fn get_status(&self, path: &str) -> Result<UfsStatus> {
        self.check_failure(UfsOperation::GetStatus, path)?;
        self.lookup(&self.entries.read(), path)
            .map(|entry| entry.status(normalize(path)))
            .ok_or_else(|| CanopyError::NotFound(path.to_string()))
    }

    async fn list_status(&self, path: &str) -> Result<Option<Vec<UfsStatus>>> {
        let entries = self.entries.read();
        match self.lookup(&entries, path) {
            Some(entry) if entry.is_directory => {}
            _ => return Ok(None),
        }
        let prefix = child_prefix(path);
        let mut children: BTreeMap<String, UfsStatus> = BTreeMap::new();
        for (key, entry) in entries.range(prefix.clone()..) {
            if !key.starts_with(&prefix) {
                break;
            }
            let rest = &key[prefix.len()..];
            match rest.split_once('/') {
                None => {
                    children.insert(rest.to_string(), entry.status(key));
                }
                Some((dir, _)) => {
                    children.entry(dir.to_string()).or_insert_with(|| {
                        MemEntry::directory("", "", Mode::DIRECTORY_DEFAULT)
                            .status(&format!("{}{}", prefix, dir))
                    });
                }
            }
        }
        Ok(Some(children.into_values().collect()))
    }

    async fn is_directory(&self, path: &str) -> Result<bool> {
        Ok(self
            .lookup(&self.entries.read(), path)
            .map(|e| e.is_directory)
            .unwrap_or(false))
    }

    async fn is_file(&self, path: &str) -> Result<bool> {
        Ok(self
            .lookup(&self.entries.read(), path)
            .map(|e| !e.is_directory)
            .unwrap_or(false))
    }

    async fn delete_file(&self, path: &str) -> Result<bool> {
        self.check_failure(UfsOperation::Delete, path)?;
        let mut entries = self.entries.write();
        match entries.get(normalize(path)) {
            Some(entry) if !entry.is_directory => {
                entries.remove(normalize(path));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_directory(&self, path: &str, recursive: bool) -> Result<bool> {
        self.check_failure(UfsOperation::Delete, path)?;
        let path = normalize(path);
        let mut entries = self.entries.write();
        match self.lookup(&entries, path) {
            Some(entry) if entry.is_directory => {}
            _ => return Ok(false),
        }
        if Self::has_children(&entries, path) {
            if !recursive {
                return Ok(false);
            }
            let prefix = child_prefix(path);
            entries.retain(|k, _| !k.starts_with(&prefix));
        }
        entries.remove(path);
        Ok(true)
    }

    async fn rename_file(&self, src: &str, dst: &str) -> Result<bool> {
        self.rename_entry(src, dst, false)
    }

    async fn rename_directory(&self, src: &str, dst: &str) -> Result<bool> {
        self.rename_entry(src, dst, true)
    }

    async fn mkdirs(&self, path: &str, options: &MkdirsOptions) -> Result<bool> {
        self.check_failure(UfsOperation::Mkdirs, path)?;
        let path = normalize(path);
        let mut entries = self.entries.write();
        if self.lookup(&entries, path).is_some() {
            return Ok(false);
        }
        if !self.parent_is_directory(&entries, path) {
            if !options.create_parent {
                return Ok(false);
            }
            let mut missing = Vec::new();
            let mut parent = ufs_parent(path);
            while let Some(dir) = parent {
                if self.lookup(&entries, &dir).is_some() {
                    break;
                }
                parent = ufs_parent(&dir);
                missing.push(dir);
            }
            for dir in missing.into_iter().rev() {
                entries.insert(dir, MemEntry::directory(&options.owner, &options.group, options.mode));
            }
        }
        entries.insert(
            path.to_string(),
            MemEntry::directory(&options.owner, &options.group, options.mode),
        );
        Ok(true)
    }

    async fn set_owner(&self, path: &str, owner: &str, group: &str) -> Result<()> {
        self.check_failure(UfsOperation::SetOwner, path)?;
        self.update(path, |entry| {
            if !owner.is_empty() {
                entry.owner = owner.to_string();
            }
            if !group.is_empty() {
                entry.group = group.to_string();
            }
        })
    }

    async fn set_mode(&self, path: &str, mode: Mode) -> Result<()> {
        self.check_failure(UfsOperation::SetMode, path)?;
        self.update(path, |entry| entry.mode = mode)
    }

    async fn set_acl_entries(&self, path: &str, entries: &[AclEntry]) -> Result<()> {
        self.check_failure(UfsOperation::SetAcl, path)?;
        self.update(path, |entry| entry.acl = entries.to_vec())
    }

    async fn get_space(&self, _path: &str, space: SpaceType) -> Result<u64> {
        let used: u64 = self.entries.read().values().map(|e| e.length).sum();
        Ok(match space {
            SpaceType::Total => MEMORY_CAPACITY_BYTES,
            SpaceType::Used => used,
            SpaceType::Free => MEMORY_CAPACITY_BYTES.saturating_sub(used),
        })
    }
}
