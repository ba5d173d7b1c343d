//! Rewriters, implicators and exploders.
//!
//! These are the pluggable rules the resolver consults. Other subsystems
//! register them once at startup, in order; the order is part of the
//! resolution semantics.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;

use cumulus_types::{Actor, CoreResult};

use super::util;

/// Canonicalizes a permission, e.g. path-based `fs:` permissions to uid-based.
#[async_trait]
pub trait PermissionRewriter: Send + Sync {
    fn id(&self) -> &str;
    fn matches(&self, permission: &str) -> bool;
    async fn rewrite(&self, permission: &str) -> CoreResult<String>;
}

/// Asserts a grant without a stored delegation record.
#[async_trait]
pub trait PermissionImplicator: Send + Sync {
    fn id(&self) -> &str;
    fn matches(&self, permission: &str) -> bool;

    /// Grant data when `actor` implicitly holds `permission`.
    async fn check(&self, actor: &Actor, permission: &str) -> CoreResult<Option<Value>>;

    /// A shortcut implicator's affirmative answer ends a check or a scan
    /// immediately.
    fn is_shortcut(&self) -> bool {
        false
    }
}

/// Expands a permission into permissions that imply it.
#[async_trait]
pub trait PermissionExploder: Send + Sync {
    fn id(&self) -> &str;
    fn matches(&self, permission: &str) -> bool;
    async fn explode(&self, permission: &str) -> CoreResult<Vec<String>>;
}

type Matcher = Box<dyn Fn(&str) -> bool + Send + Sync>;

/// Rewriter built from two closures.
pub struct FnRewriter {
    id: String,
    matcher: Matcher,
    rewriter: Box<dyn Fn(&str) -> String + Send + Sync>,
}

impl FnRewriter {
    pub fn new(
        id: impl Into<String>,
        matcher: impl Fn(&str) -> bool + Send + Sync + 'static,
        rewriter: impl Fn(&str) -> String + Send + Sync + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            matcher: Box::new(matcher),
            rewriter: Box::new(rewriter),
        }
    }
}

#[async_trait]
impl PermissionRewriter for FnRewriter {
    fn id(&self) -> &str {
        &self.id
    }

    fn matches(&self, permission: &str) -> bool {
        (self.matcher)(permission)
    }

    async fn rewrite(&self, permission: &str) -> CoreResult<String> {
        Ok((self.rewriter)(permission))
    }
}

/// Implicator built from two closures.
pub struct FnImplicator {
    id: String,
    matcher: Matcher,
    checker: Box<dyn Fn(&Actor, &str) -> Option<Value> + Send + Sync>,
    shortcut: bool,
}

impl FnImplicator {
    pub fn new(
        id: impl Into<String>,
        matcher: impl Fn(&str) -> bool + Send + Sync + 'static,
        checker: impl Fn(&Actor, &str) -> Option<Value> + Send + Sync + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            matcher: Box::new(matcher),
            checker: Box::new(checker),
            shortcut: false,
        }
    }

    /// Mark as a shortcut implicator.
    pub fn shortcut(mut self) -> Self {
        self.shortcut = true;
        self
    }
}

#[async_trait]
impl PermissionImplicator for FnImplicator {
    fn id(&self) -> &str {
        &self.id
    }

    fn matches(&self, permission: &str) -> bool {
        (self.matcher)(permission)
    }

    async fn check(&self, actor: &Actor, permission: &str) -> CoreResult<Option<Value>> {
        Ok((self.checker)(actor, permission))
    }

    fn is_shortcut(&self) -> bool {
        self.shortcut
    }
}

/// Exploder built from two closures.
pub struct FnExploder {
    id: String,
    matcher: Matcher,
    exploder: Box<dyn Fn(&str) -> Vec<String> + Send + Sync>,
}

impl FnExploder {
    pub fn new(
        id: impl Into<String>,
        matcher: impl Fn(&str) -> bool + Send + Sync + 'static,
        exploder: impl Fn(&str) -> Vec<String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            matcher: Box::new(matcher),
            exploder: Box::new(exploder),
        }
    }
}

#[async_trait]
impl PermissionExploder for FnExploder {
    fn id(&self) -> &str {
        &self.id
    }

    fn matches(&self, permission: &str) -> bool {
        (self.matcher)(permission)
    }

    async fn explode(&self, permission: &str) -> CoreResult<Vec<String>> {
        Ok((self.exploder)(permission))
    }
}

/// Filesystem access modes, weakest first.
pub const FS_MODES: [&str; 4] = ["see", "list", "read", "write"];

/// Expands `fs:<uid>:<mode>` to every stronger mode on the same node.
#[derive(Debug, Default)]
pub struct FsModeExploder;

#[async_trait]
impl PermissionExploder for FsModeExploder {
    fn id(&self) -> &str {
        "fs-mode"
    }

    fn matches(&self, permission: &str) -> bool {
        let parts = util::split(permission);
        parts.len() == 3 && parts[0] == "fs" && FS_MODES.contains(&parts[2].as_str())
    }

    async fn explode(&self, permission: &str) -> CoreResult<Vec<String>> {
        let parts = util::split(permission);
        let Some(pos) = FS_MODES.iter().position(|m| *m == parts[2]) else {
            return Ok(Vec::new());
        };
        Ok(FS_MODES[pos + 1..]
            .iter()
            .map(|mode| util::join(&[parts[0].as_str(), parts[1].as_str(), mode]))
            .collect())
    }
}

/// A group whose membership is computed from the actor instead of stored.
///
/// Members hold every permission listed on the group.
pub struct VirtualGroup {
    id: String,
    membership: Box<dyn Fn(&Actor) -> bool + Send + Sync>,
    permissions: BTreeMap<String, Value>,
}

impl VirtualGroup {
    pub fn new(id: impl Into<String>, membership: impl Fn(&Actor) -> bool + Send + Sync + 'static) -> Self {
        Self {
            id: id.into(),
            membership: Box::new(membership),
            permissions: BTreeMap::new(),
        }
    }

    /// List `permission` on the group with its grant data.
    pub fn permission(mut self, permission: impl Into<String>, data: Value) -> Self {
        self.permissions.insert(permission.into(), data);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn contains(&self, actor: &Actor) -> bool {
        (self.membership)(actor)
    }

    /// Grant data for `permission`, if the group lists it.
    pub fn grant(&self, permission: &str) -> Option<&Value> {
        self.permissions.get(permission)
    }
}
