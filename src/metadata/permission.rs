//! Permission enforcement.
//!
//! POSIX-style checks over the owner/group/mode triple, refined by the
//! named entries and mask of an inode's extended ACL. The super user and
//! members of the super group bypass every check.

use super::inode::Inode;
use crate::error::{CanopyError, Result};
use crate::types::ModeBits;
use serde::{Deserialize, Serialize};

/// Caller identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    /// User name.
    pub user: String,
    /// Groups, primary group first.
    pub groups: Vec<String>,
}

impl UserInfo {
    pub fn new(user: impl Into<String>, groups: &[&str]) -> Self {
        Self {
            user: user.into(),
            groups: groups.iter().map(|g| g.to_string()).collect(),
        }
    }

    /// Primary group, empty if the user has none.
    pub fn primary_group(&self) -> &str {
        self.groups.first().map(String::as_str).unwrap_or("")
    }

    pub fn in_group(&self, group: &str) -> bool {
        self.groups.iter().any(|g| g == group)
    }
}

/// Checks caller permissions against inodes.
#[derive(Debug, Clone)]
pub struct PermissionChecker {
    enabled: bool,
    super_user: String,
    super_group: String,
}

impl PermissionChecker {
    pub fn new(enabled: bool, super_user: impl Into<String>, super_group: impl Into<String>) -> Self {
        Self {
            enabled,
            super_user: super_user.into(),
            super_group: super_group.into(),
        }
    }

    /// Whether checks are enforced at all.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_super_user(&self, user: &UserInfo) -> bool {
        user.user == self.super_user || user.in_group(&self.super_group)
    }

    /// Effective bits of `user` on `inode`.
    pub fn effective_bits(&self, user: &UserInfo, inode: &Inode) -> ModeBits {
        if user.user == inode.owner {
            return inode.mode.owner();
        }
        let acl = &inode.acl;
        let mask = acl.mask.unwrap_or(ModeBits::ALL);
        if let Some(bits) = acl.named_users.get(&user.user) {
            return bits.and(mask);
        }

        let mut group_matched = false;
        let mut group_bits = ModeBits::NONE;
        if user.in_group(&inode.group) {
            group_matched = true;
            group_bits = group_bits.or(inode.mode.group());
        }
        for (group, bits) in &acl.named_groups {
            if user.in_group(group) {
                group_matched = true;
                group_bits = group_bits.or(*bits);
            }
        }
        if group_matched {
            return group_bits.and(mask);
        }
        inode.mode.other()
    }

    /// Check `bits` on a single inode.
    pub fn check_inode(&self, user: &UserInfo, inode: &Inode, bits: ModeBits, path: &str) -> Result<()> {
        if !self.enabled || self.is_super_user(user) {
            return Ok(());
        }
        if self.effective_bits(user, inode).implies(bits) {
            return Ok(());
        }
        Err(CanopyError::AccessDenied(format!(
            "user={}, access={}, path={}: failed at {}, inode owner={}, inode group={}, inode mode={}",
            user.user,
            bits,
            path,
            if inode.name.is_empty() { "/" } else { &inode.name },
            inode.owner,
            inode.group,
            inode.mode
        )))
    }

    /// Check traversal of every ancestor and `bits` on the last inode of
    /// `chain` (root first).
    pub fn check_chain(&self, user: &UserInfo, chain: &[Inode], bits: ModeBits, path: &str) -> Result<()> {
        if !self.enabled || self.is_super_user(user) {
            return Ok(());
        }
        let Some((last, ancestors)) = chain.split_last() else {
            return Ok(());
        };
        for ancestor in ancestors {
            self.check_inode(user, ancestor, ModeBits::EXECUTE, path)?;
        }
        self.check_inode(user, last, bits, path)
    }

    /// Check `bits` on the parent of a path of `depth` components.
    ///
    /// When the parent does not exist the deepest existing ancestor is
    /// checked instead.
    pub fn check_parent(&self, user: &UserInfo, chain: &[Inode], depth: usize, bits: ModeBits, path: &str) -> Result<()> {
        let end = chain.len().min(depth);
        self.check_chain(user, &chain[..end], bits, path)
    }

    /// Ownership rules for owner, group and mode changes.
    ///
    /// Only the super user changes the owner. The owner (or super user)
    /// changes the mode and the group, and a non super user can only move a
    /// file to a group it belongs to.
    pub fn check_set_attribute(
        &self,
        user: &UserInfo,
        inode: &Inode,
        owner: Option<&str>,
        group: Option<&str>,
        mode_changed: bool,
        path: &str,
    ) -> Result<()> {
        if !self.enabled || self.is_super_user(user) {
            return Ok(());
        }
        if owner.is_some() {
            return Err(CanopyError::AccessDenied(format!(
                "user={} is not a super user and cannot change the owner of {}",
                user.user, path
            )));
        }
        if (group.is_some() || mode_changed) && user.user != inode.owner {
            return Err(CanopyError::AccessDenied(format!(
                "user={} is not the owner of {}",
                user.user, path
            )));
        }
        if let Some(group) = group {
            if !user.in_group(group) {
                return Err(CanopyError::AccessDenied(format!(
                    "user={} is not in group {} and cannot set it on {}",
                    user.user, group, path
                )));
            }
        }
        Ok(())
    }
}

impl Default for PermissionChecker {
    fn default() -> Self {
        Self::new(true, "root", "supergroup")
    }
}
