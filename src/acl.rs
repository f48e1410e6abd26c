//! Access control lists.
//!
//! POSIX-style extended ACLs on top of the owner/group/mode triple. The base
//! entries (owning user, owning group, other) live in the inode mode; this
//! module keeps the named entries, the mask and the default ACL of
//! directories.

use crate::error::{CanopyError, Result};
use crate::types::{Mode, ModeBits};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Type of an ACL entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AclEntryType {
    /// Owner of the inode.
    OwningUser,
    /// A named user.
    NamedUser,
    /// Owning group of the inode.
    OwningGroup,
    /// A named group.
    NamedGroup,
    /// Upper bound for named entries and the owning group.
    Mask,
    /// Everyone else.
    Other,
}

/// A single ACL entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclEntry {
    /// Type of the entry.
    pub entry_type: AclEntryType,
    /// User or group name for named entries, empty otherwise.
    pub subject: String,
    /// Granted actions.
    pub actions: ModeBits,
    /// Whether this entry belongs to the default ACL.
    pub is_default: bool,
}

impl AclEntry {
    /// Create an access entry.
    pub fn new(entry_type: AclEntryType, subject: impl Into<String>, actions: ModeBits) -> Self {
        Self {
            entry_type,
            subject: subject.into(),
            actions,
            is_default: false,
        }
    }

    /// Mark the entry as a default entry.
    pub fn default_entry(mut self) -> Self {
        self.is_default = true;
        self
    }

    /// Shorthand for a named user entry.
    pub fn user(name: impl Into<String>, actions: ModeBits) -> Self {
        Self::new(AclEntryType::NamedUser, name, actions)
    }

    /// Shorthand for a named group entry.
    pub fn group(name: impl Into<String>, actions: ModeBits) -> Self {
        Self::new(AclEntryType::NamedGroup, name, actions)
    }
}

impl fmt::Display for AclEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = if self.is_default { "default:" } else { "" };
        let kind = match self.entry_type {
            AclEntryType::OwningUser | AclEntryType::NamedUser => "user",
            AclEntryType::OwningGroup | AclEntryType::NamedGroup => "group",
            AclEntryType::Mask => "mask",
            AclEntryType::Other => "other",
        };
        write!(f, "{}{}:{}:{}", prefix, kind, self.subject, self.actions)
    }
}

/// How a `set_acl` call changes the existing ACL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SetAclAction {
    /// Replace every entry; base entries are required.
    Replace,
    /// Add or update the given entries.
    Modify,
    /// Remove the given entries.
    Remove,
    /// Remove every extended entry, keeping the base entries.
    RemoveAll,
    /// Remove the default ACL.
    RemoveDefault,
}

/// Named entries and mask of an access or default ACL.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtendedAcl {
    /// Named user entries.
    pub named_users: BTreeMap<String, ModeBits>,
    /// Named group entries.
    pub named_groups: BTreeMap<String, ModeBits>,
    /// Mask entry.
    pub mask: Option<ModeBits>,
}

impl ExtendedAcl {
    /// Whether there are named entries.
    pub fn has_named_entries(&self) -> bool {
        !self.named_users.is_empty() || !self.named_groups.is_empty()
    }

    /// Whether nothing beyond the base entries is set.
    pub fn is_empty(&self) -> bool {
        !self.has_named_entries() && self.mask.is_none()
    }

    /// Union of every named entry and the owning group bits, used as the
    /// implicit mask.
    fn union_of_group_class(&self, owning_group: ModeBits) -> ModeBits {
        self.named_users
            .values()
            .chain(self.named_groups.values())
            .fold(owning_group, |acc, bits| acc.or(*bits))
    }

    /// Set the mask to the union of the group class when named entries
    /// exist and no explicit mask was given.
    fn recompute_mask(&mut self, owning_group: ModeBits) {
        if self.has_named_entries() && self.mask.is_none() {
            self.mask = Some(self.union_of_group_class(owning_group));
        }
    }
}

/// Default ACL of a directory, inherited by new children.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultAcl {
    /// Default owning user bits.
    pub owning_user: Option<ModeBits>,
    /// Default owning group bits.
    pub owning_group: Option<ModeBits>,
    /// Default other bits.
    pub other: Option<ModeBits>,
    /// Default named entries and mask.
    pub extended: ExtendedAcl,
}

impl DefaultAcl {
    /// Whether no default entries are present.
    pub fn is_empty(&self) -> bool {
        self.owning_user.is_none()
            && self.owning_group.is_none()
            && self.other.is_none()
            && self.extended.is_empty()
    }

    /// Mode a new child gets when this default ACL applies.
    pub fn child_mode(&self, requested: Mode) -> Mode {
        let user = self.owning_user.unwrap_or(requested.owner());
        let group = self.owning_group.unwrap_or(requested.group());
        let other = self.other.unwrap_or(requested.other());
        Mode::new(
            ((user.bits() as u16) << 6) | ((group.bits() as u16) << 3) | other.bits() as u16,
        )
    }

    /// Entries in display form.
    pub fn entries(&self) -> Vec<AclEntry> {
        let mut entries = Vec::new();
        if let Some(bits) = self.owning_user {
            entries.push(AclEntry::new(AclEntryType::OwningUser, "", bits).default_entry());
        }
        for (name, bits) in &self.extended.named_users {
            entries.push(AclEntry::user(name.clone(), *bits).default_entry());
        }
        if let Some(bits) = self.owning_group {
            entries.push(AclEntry::new(AclEntryType::OwningGroup, "", bits).default_entry());
        }
        for (name, bits) in &self.extended.named_groups {
            entries.push(AclEntry::group(name.clone(), *bits).default_entry());
        }
        if let Some(bits) = self.extended.mask {
            entries.push(AclEntry::new(AclEntryType::Mask, "", bits).default_entry());
        }
        if let Some(bits) = self.other {
            entries.push(AclEntry::new(AclEntryType::Other, "", bits).default_entry());
        }
        entries
    }
}

/// Full ACL state of an inode after applying a `set_acl` action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AclUpdate {
    /// New permission bits.
    pub mode: Mode,
    /// New access ACL.
    pub acl: ExtendedAcl,
    /// New default ACL, `None` when the inode is not a directory.
    pub default_acl: Option<DefaultAcl>,
}

/// Access entries of an inode in display form.
pub fn access_entries(mode: Mode, acl: &ExtendedAcl) -> Vec<AclEntry> {
    let mut entries = vec![AclEntry::new(AclEntryType::OwningUser, "", mode.owner())];
    for (name, bits) in &acl.named_users {
        entries.push(AclEntry::user(name.clone(), *bits));
    }
    entries.push(AclEntry::new(AclEntryType::OwningGroup, "", mode.group()));
    for (name, bits) in &acl.named_groups {
        entries.push(AclEntry::group(name.clone(), *bits));
    }
    if let Some(mask) = acl.mask {
        entries.push(AclEntry::new(AclEntryType::Mask, "", mask));
    }
    entries.push(AclEntry::new(AclEntryType::Other, "", mode.other()));
    entries
}

fn set_mode_part(mode: Mode, entry_type: AclEntryType, bits: ModeBits) -> Mode {
    let (user, group, other) = (mode.owner(), mode.group(), mode.other());
    let (user, group, other) = match entry_type {
        AclEntryType::OwningUser => (bits, group, other),
        AclEntryType::OwningGroup => (user, bits, other),
        AclEntryType::Other => (user, group, bits),
        _ => (user, group, other),
    };
    Mode::new(((user.bits() as u16) << 6) | ((group.bits() as u16) << 3) | other.bits() as u16)
}

/// Apply a `set_acl` action to the current ACL state of an inode.
///
/// `is_directory` controls whether default entries are accepted.
pub fn apply_set_acl(
    action: SetAclAction,
    entries: &[AclEntry],
    mode: Mode,
    acl: &ExtendedAcl,
    default_acl: Option<&DefaultAcl>,
    is_directory: bool,
) -> Result<AclUpdate> {
    if !is_directory && entries.iter().any(|e| e.is_default) {
        return Err(CanopyError::InvalidArgument(
            "Default ACL entries can only be set on directories".to_string(),
        ));
    }

    let mut mode = mode;
    let mut acl = acl.clone();
    let mut default_acl = if is_directory {
        Some(default_acl.cloned().unwrap_or_default())
    } else {
        None
    };

    match action {
        SetAclAction::Replace => {
            let access: Vec<&AclEntry> = entries.iter().filter(|e| !e.is_default).collect();
            let mut missing = Vec::new();
            for required in [AclEntryType::OwningUser, AclEntryType::OwningGroup, AclEntryType::Other] {
                if !access.iter().any(|e| e.entry_type == required) {
                    missing.push(format!("{:?}", required));
                }
            }
            if !missing.is_empty() {
                return Err(CanopyError::InvalidArgument(format!(
                    "Replacing ACL requires the 3 base entries, missing: {}",
                    missing.join(", ")
                )));
            }
            acl = ExtendedAcl::default();
            for entry in access {
                apply_access_entry(&mut mode, &mut acl, entry);
            }
            acl.recompute_mask(mode.group());
            if let Some(defaults) = default_acl.as_mut() {
                let new_defaults: Vec<&AclEntry> = entries.iter().filter(|e| e.is_default).collect();
                if !new_defaults.is_empty() {
                    *defaults = DefaultAcl::default();
                    for entry in new_defaults {
                        apply_default_entry(defaults, entry);
                    }
                }
            }
        }
        SetAclAction::Modify => {
            for entry in entries {
                if entry.is_default {
                    if let Some(defaults) = default_acl.as_mut() {
                        apply_default_entry(defaults, entry);
                    }
                } else {
                    apply_access_entry(&mut mode, &mut acl, entry);
                }
            }
            acl.recompute_mask(mode.group());
        }
        SetAclAction::Remove => {
            for entry in entries {
                if entry.is_default {
                    if let Some(defaults) = default_acl.as_mut() {
                        remove_default_entry(defaults, entry)?;
                    }
                } else {
                    remove_access_entry(&mut acl, entry)?;
                }
            }
        }
        SetAclAction::RemoveAll => {
            acl = ExtendedAcl::default();
        }
        SetAclAction::RemoveDefault => {
            if let Some(defaults) = default_acl.as_mut() {
                *defaults = DefaultAcl::default();
            }
        }
    }

    Ok(AclUpdate {
        mode,
        acl,
        default_acl,
    })
}

fn apply_access_entry(mode: &mut Mode, acl: &mut ExtendedAcl, entry: &AclEntry) {
    match entry.entry_type {
        AclEntryType::OwningUser | AclEntryType::OwningGroup | AclEntryType::Other => {
            *mode = set_mode_part(*mode, entry.entry_type, entry.actions);
        }
        AclEntryType::NamedUser => {
            acl.named_users.insert(entry.subject.clone(), entry.actions);
        }
        AclEntryType::NamedGroup => {
            acl.named_groups.insert(entry.subject.clone(), entry.actions);
        }
        AclEntryType::Mask => {
            acl.mask = Some(entry.actions);
        }
    }
}

fn apply_default_entry(defaults: &mut DefaultAcl, entry: &AclEntry) {
    match entry.entry_type {
        AclEntryType::OwningUser => defaults.owning_user = Some(entry.actions),
        AclEntryType::OwningGroup => defaults.owning_group = Some(entry.actions),
        AclEntryType::Other => defaults.other = Some(entry.actions),
        AclEntryType::NamedUser => {
            defaults
                .extended
                .named_users
                .insert(entry.subject.clone(), entry.actions);
        }
        AclEntryType::NamedGroup => {
            defaults
                .extended
                .named_groups
                .insert(entry.subject.clone(), entry.actions);
        }
        AclEntryType::Mask => defaults.extended.mask = Some(entry.actions),
    }
}

fn remove_access_entry(acl: &mut ExtendedAcl, entry: &AclEntry) -> Result<()> {
    match entry.entry_type {
        AclEntryType::NamedUser => {
            acl.named_users.remove(&entry.subject);
        }
        AclEntryType::NamedGroup => {
            acl.named_groups.remove(&entry.subject);
        }
        AclEntryType::Mask => {
            if acl.has_named_entries() {
                return Err(CanopyError::InvalidArgument(
                    "Deleting the mask for an extended ACL is not allowed".to_string(),
                ));
            }
            acl.mask = None;
        }
        AclEntryType::OwningUser | AclEntryType::OwningGroup | AclEntryType::Other => {
            return Err(CanopyError::InvalidArgument(format!(
                "Base ACL entry {} cannot be removed",
                entry
            )));
        }
    }
    if !acl.has_named_entries() {
        acl.mask = None;
    }
    Ok(())
}

fn remove_default_entry(defaults: &mut DefaultAcl, entry: &AclEntry) -> Result<()> {
    match entry.entry_type {
        AclEntryType::OwningUser => defaults.owning_user = None,
        AclEntryType::OwningGroup => defaults.owning_group = None,
        AclEntryType::Other => defaults.other = None,
        AclEntryType::NamedUser => {
            defaults.extended.named_users.remove(&entry.subject);
        }
        AclEntryType::NamedGroup => {
            defaults.extended.named_groups.remove(&entry.subject);
        }
        AclEntryType::Mask => {
            if defaults.extended.has_named_entries() {
                return Err(CanopyError::InvalidArgument(
                    "Deleting the mask for an extended ACL is not allowed".to_string(),
                ));
            }
            defaults.extended.mask = None;
        }
    }
    Ok(())
}
