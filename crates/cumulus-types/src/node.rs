//! Node identification and stat records.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::actor::UserId;
use crate::error::{CoreError, CoreResult};

/// How a caller identifies a filesystem node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "kebab-case")]
pub enum Selector {
    /// The filesystem root.
    Root,
    /// Globally unique node id.
    Uid(Uuid),
    /// Absolute path, `/`-separated.
    Path(String),
    /// Backend-specific internal id.
    InternalId(i64),
}

impl Selector {
    /// Build a path selector, normalizing `.`/`..` and duplicate slashes.
    ///
    /// Relative paths are rejected; `/` becomes [`Selector::Root`].
    pub fn path(path: impl AsRef<str>) -> CoreResult<Self> {
        let path = path.as_ref();
        if !path.starts_with('/') {
            return Err(CoreError::InvalidInput(format!(
                "path selector must be absolute: {}",
                path
            )));
        }
        let normalized = normalize_path(path);
        if normalized == "/" {
            Ok(Selector::Root)
        } else {
            Ok(Selector::Path(normalized))
        }
    }

    /// The path carried by this selector, if any. Root reports `/`.
    pub fn as_path(&self) -> Option<&str> {
        match self {
            Selector::Root => Some("/"),
            Selector::Path(p) => Some(p),
            _ => None,
        }
    }

    /// Human-readable description for logs and errors.
    pub fn describe(&self) -> String {
        match self {
            Selector::Root => "[root]".to_string(),
            Selector::Uid(uid) => format!("[uid:{}]", uid),
            Selector::Path(p) => p.clone(),
            Selector::InternalId(id) => format!("[id:{}]", id),
        }
    }
}

impl std::fmt::Display for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.describe())
    }
}

/// Normalize an absolute path: collapse `//`, resolve `.` and `..`, strip
/// the trailing slash.
pub fn normalize_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    format!("/{}", parts.join("/"))
}

/// Join a directory path and a child name.
pub fn join_path(dir: &str, name: &str) -> String {
    if dir == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", dir.trim_end_matches('/'), name)
    }
}

/// Check a single path component supplied by a caller.
pub fn validate_file_name(name: &str) -> CoreResult<()> {
    if name.is_empty() || name == "." || name == ".." {
        return Err(CoreError::InvalidFileName(format!("{:?}", name)));
    }
    if name.contains('/') || name.contains('\0') {
        return Err(CoreError::InvalidFileName(name.to_string()));
    }
    if name.len() > 255 {
        return Err(CoreError::InvalidFileName(format!(
            "name exceeds 255 bytes: {}…",
            &name[..name.char_indices().nth(32).map(|(i, _)| i).unwrap_or(name.len())]
        )));
    }
    Ok(())
}

/// A prior version of a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryVersion {
    pub id: String,
    pub timestamp: i64,
    pub user_id: Option<UserId>,
}

/// Users and apps a node has been shared with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryShares {
    pub users: Vec<ShareHolder>,
    pub apps: Vec<ShareHolder>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareHolder {
    pub name: String,
    pub permission: String,
}

/// The result of stat: one persisted node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsEntry {
    pub uid: Uuid,
    /// Backend-internal id, when the backend has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub name: String,
    pub path: String,
    /// `None` only for the root.
    pub parent_uid: Option<Uuid>,
    pub size: u64,
    pub is_dir: bool,
    #[serde(default)]
    pub immutable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<UserId>,
    /// Epoch seconds.
    pub modified: i64,
    /// Epoch seconds.
    pub created: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub versions: Option<Vec<EntryVersion>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shares: Option<EntryShares>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subdomains: Option<Vec<String>>,
}

impl FsEntry {
    pub fn is_root(&self) -> bool {
        self.parent_uid.is_none() && self.path == "/"
    }

    /// Check the persisted-entry invariant: non-empty uid, name and path,
    /// and a parent for everything but the root.
    pub fn validate(&self) -> CoreResult<()> {
        if self.uid.is_nil() {
            return Err(CoreError::Internal(format!("entry at {} has a nil uid", self.path)));
        }
        if self.path.is_empty() || !self.path.starts_with('/') {
            return Err(CoreError::Internal(format!("entry {} has no absolute path", self.uid)));
        }
        if self.path == "/" {
            return Ok(());
        }
        if self.name.is_empty() {
            return Err(CoreError::Internal(format!("entry {} has an empty name", self.uid)));
        }
        if self.parent_uid.is_none() {
            return Err(CoreError::Internal(format!("entry {} has no parent", self.path)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_selector_normalizes() {
        assert_eq!(Selector::path("/a/./b//c/../d/").unwrap(), Selector::Path("/a/b/d".into()));
        assert_eq!(Selector::path("/").unwrap(), Selector::Root);
        assert_eq!(Selector::path("/..").unwrap(), Selector::Root);
    }

    #[test]
    fn relative_path_selector_is_invalid() {
        let err = Selector::path("a/b").unwrap_err();
        assert_eq!(err.code(), "invalid_input");
    }

    #[test]
    fn join_handles_root() {
        assert_eq!(join_path("/", "x"), "/x");
        assert_eq!(join_path("/a/", "x"), "/a/x");
    }

    #[test]
    fn file_names_are_checked() {
        assert!(validate_file_name("notes.txt").is_ok());
        for bad in ["", ".", "..", "a/b", "nul\0byte"] {
            assert_eq!(validate_file_name(bad).unwrap_err().code(), "invalid_file_name");
        }
        assert!(validate_file_name(&"x".repeat(256)).is_err());
    }

    #[test]
    fn entry_invariant() {
        let mut entry = FsEntry {
            uid: Uuid::new_v4(),
            id: None,
            name: "doc".into(),
            path: "/doc".into(),
            parent_uid: Some(Uuid::new_v4()),
            size: 0,
            is_dir: false,
            immutable: false,
            owner_id: None,
            modified: 0,
            created: 0,
            thumbnail: None,
            versions: None,
            shares: None,
            subdomains: None,
        };
        assert!(entry.validate().is_ok());
        entry.parent_uid = None;
        assert!(entry.validate().is_err());
        entry.path = "/".into();
        entry.name = String::new();
        assert!(entry.validate().is_ok());
        assert!(entry.is_root());
    }
}
