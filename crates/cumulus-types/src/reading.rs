//! Readings: the evidence tree produced by a full permission scan.
//!
//! A reading explains one fact discovered while resolving a permission. The
//! tree is for audit and debugging; the grant decision itself is only
//! "is there at least one terminal reading".

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::actor::GroupId;

/// Where a direct grant came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OptionSource {
    /// Asserted by a permission implicator.
    Implied,
    /// A stored grant with no further delegation.
    Explicit,
    /// Configured per-user or default-user permission.
    Hardcoded,
    /// The system actor holds everything.
    System,
    /// Listed in a virtual group the actor belongs to.
    VirtualGroup,
}

/// The kind of delegation hop a path reading records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PathVia {
    User,
    UserGroup,
    UserApp,
    /// A configured grant to a group the holder belongs to.
    HcUserGroup,
    /// A configured app permission, justified by the app's user.
    UserAppImplied,
}

/// One evidence record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "$", rename_all = "kebab-case")]
pub enum Reading {
    /// A direct grant.
    Option {
        permission: String,
        source: OptionSource,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        by: Option<String>,
        #[serde(default)]
        data: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        holder_username: Option<String>,
    },
    /// A delegation hop, justified by the issuer's own nested reading.
    Path {
        via: PathVia,
        permission: String,
        #[serde(default)]
        data: Value,
        holder_username: String,
        issuer_username: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group_id: Option<GroupId>,
        has_terminal: bool,
        reading: Vec<Reading>,
    },
    /// The requested permission was rewritten to a canonical form.
    Rewrite { old: String, new: String },
    /// A permission was expanded into the options that imply it.
    Explode { permission: String, options: Vec<String> },
    /// Wall-clock duration of the scan, in milliseconds.
    Time { value: u64 },
}

impl Reading {
    /// True for readings that, on their own, satisfy the query.
    pub fn is_terminal(&self) -> bool {
        match self {
            Reading::Option { .. } => true,
            Reading::Path { has_terminal, .. } => *has_terminal,
            _ => false,
        }
    }
}

/// Does any reading at this level grant the permission?
pub fn reading_has_terminal(reading: &[Reading]) -> bool {
    reading.iter().any(Reading::is_terminal)
}

/// One hop on the way to a satisfying option.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionPathItem {
    pub permission: String,
    pub holder: Option<String>,
    pub data: Value,
}

/// A satisfying option extracted from a reading tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedOption {
    pub permission: String,
    pub source: OptionSource,
    pub by: Option<String>,
    /// Grant data along the path, innermost first; null data is skipped.
    pub data: Vec<Value>,
    /// Hops from the satisfying option back out to the query.
    pub path: Vec<OptionPathItem>,
}

/// Flatten a reading tree into the options that satisfy it.
///
/// Only path readings that lead to a terminal are descended into.
pub fn reading_to_options(reading: &[Reading]) -> Vec<ResolvedOption> {
    let mut out = Vec::new();
    collect_options(reading, &[], &[], &mut out);
    out
}

fn collect_options(
    reading: &[Reading],
    extras: &[Value],
    path: &[OptionPathItem],
    out: &mut Vec<ResolvedOption>,
) {
    for finding in reading {
        match finding {
            Reading::Option {
                permission,
                source,
                by,
                data,
                holder_username,
            } => {
                let mut option_path = vec![OptionPathItem {
                    permission: permission.clone(),
                    holder: holder_username.clone(),
                    data: data.clone(),
                }];
                option_path.extend_from_slice(path);

                let mut option_data = Vec::new();
                if !data.is_null() {
                    option_data.push(data.clone());
                }
                option_data.extend_from_slice(extras);

                out.push(ResolvedOption {
                    permission: permission.clone(),
                    source: *source,
                    by: by.clone(),
                    data: option_data,
                    path: option_path,
                });
            }
            Reading::Path {
                permission,
                data,
                holder_username,
                has_terminal: true,
                reading: inner,
                ..
            } => {
                let mut next_extras = Vec::with_capacity(extras.len() + 1);
                if !data.is_null() {
                    next_extras.push(data.clone());
                }
                next_extras.extend_from_slice(extras);

                let mut next_path = vec![OptionPathItem {
                    permission: permission.clone(),
                    holder: Some(holder_username.clone()),
                    data: data.clone(),
                }];
                next_path.extend_from_slice(path);

                collect_options(inner, &next_extras, &next_path, out);
            }
            _ => {}
        }
    }
}
