//! The fixed vocabulary of filesystem capabilities.
//!
//! A provider declares the capabilities it supports as a [`CapabilitySet`].
//! Callers test membership before relying on provider-specific behavior.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// A filesystem capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Capability {
    // Node-tree extras
    Thumbnail,
    Uuid,
    OperationTrace,
    ReaddirUuidMode,
    CopyTree,

    // Standard
    Read,
    Write,
    Symlink,
    Trash,

    // Behavioral
    CaseSensitive,

    // POSIX-ish
    ReaddirInodeNumbers,
    UnixPerms,
}

impl Capability {
    /// Every capability, in declaration order.
    pub const ALL: [Capability; 12] = [
        Capability::Thumbnail,
        Capability::Uuid,
        Capability::OperationTrace,
        Capability::ReaddirUuidMode,
        Capability::CopyTree,
        Capability::Read,
        Capability::Write,
        Capability::Symlink,
        Capability::Trash,
        Capability::CaseSensitive,
        Capability::ReaddirInodeNumbers,
        Capability::UnixPerms,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Thumbnail => "thumbnail",
            Capability::Uuid => "uuid",
            Capability::OperationTrace => "operation-trace",
            Capability::ReaddirUuidMode => "readdir-uuid-mode",
            Capability::CopyTree => "copy-tree",
            Capability::Read => "read",
            Capability::Write => "write",
            Capability::Symlink => "symlink",
            Capability::Trash => "trash",
            Capability::CaseSensitive => "case-sensitive",
            Capability::ReaddirInodeNumbers => "readdir-inode-numbers",
            Capability::UnixPerms => "unix-perms",
        }
    }

    fn bit(self) -> u16 {
        1 << (self as u16)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = crate::CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Capability::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| crate::CoreError::InvalidInput(format!("unknown capability: {}", s)))
    }
}

/// An unordered, duplicate-free set of capabilities.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CapabilitySet(u16);

impl CapabilitySet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn all() -> Self {
        Capability::ALL.into_iter().collect()
    }

    pub fn contains(&self, cap: Capability) -> bool {
        self.0 & cap.bit() != 0
    }

    pub fn insert(&mut self, cap: Capability) -> bool {
        let had = self.contains(cap);
        self.0 |= cap.bit();
        !had
    }

    pub fn remove(&mut self, cap: Capability) -> bool {
        let had = self.contains(cap);
        self.0 &= !cap.bit();
        had
    }

    /// Builder-style insert.
    pub fn with(mut self, cap: Capability) -> Self {
        self.insert(cap);
        self
    }

    /// Builder-style remove.
    pub fn without(mut self, cap: Capability) -> Self {
        self.remove(cap);
        self
    }

    pub fn union(&self, other: &CapabilitySet) -> CapabilitySet {
        CapabilitySet(self.0 | other.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        Capability::ALL.into_iter().filter(|c| self.contains(*c))
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        let mut set = CapabilitySet::empty();
        for cap in iter {
            set.insert(cap);
        }
        set
    }
}

impl fmt::Debug for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter().map(|c| c.as_str())).finish()
    }
}

impl Serialize for CapabilitySet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.iter().map(|c| c.as_str()))
    }
}

impl<'de> Deserialize<'de> for CapabilitySet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let names = Vec::<String>::deserialize(deserializer)?;
        names
            .iter()
            .map(|n| n.parse::<Capability>().map_err(serde::de::Error::custom))
            .collect()
    }
}
