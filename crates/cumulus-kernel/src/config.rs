//! Configuration for the cumulus core.
//!
//! Configuration is loaded from `~/.config/cumulus/core.toml`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Core configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Username of the distinguished system principal.
    #[serde(default = "default_system_username")]
    pub system_username: String,

    /// Maximum number of delegation hops followed while resolving a grant.
    #[serde(default = "default_max_delegation_depth")]
    pub max_delegation_depth: usize,

    /// Copy by walking the tree when a provider lacks `copy-tree`.
    #[serde(default = "default_copy_fallback")]
    pub copy_fallback: bool,

    /// Largest file `write` accepts, in bytes. Unlimited when absent.
    #[serde(default)]
    pub max_file_size: Option<u64>,

    /// SQLite database for delegation records. In-memory when absent.
    #[serde(default)]
    pub database_path: Option<PathBuf>,

    /// Per-user permissions: username → permission → grant data.
    #[serde(default)]
    pub hardcoded_permissions: BTreeMap<String, BTreeMap<String, Value>>,

    /// Permissions every user actor holds.
    #[serde(default)]
    pub default_user_permissions: BTreeMap<String, Value>,

    /// Grants to stored groups: issuer username → group uid → permission →
    /// grant data. Members hold them while the issuer does.
    #[serde(default)]
    pub hardcoded_group_permissions: BTreeMap<String, BTreeMap<String, BTreeMap<String, Value>>>,

    /// Permissions every app holds, while its user does.
    #[serde(default)]
    pub default_app_permissions: BTreeMap<String, Value>,

    /// Permissions implied for specific apps, while their user holds them.
    #[serde(default)]
    pub implicit_app_permissions: Vec<ImplicitAppPermissions>,
}

/// Permissions implied for the listed app uids.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImplicitAppPermissions {
    pub apps: Vec<String>,
    pub permissions: BTreeMap<String, Value>,
}

fn default_system_username() -> String {
    "system".to_string()
}

fn default_max_delegation_depth() -> usize {
    16
}

fn default_copy_fallback() -> bool {
    true
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            system_username: default_system_username(),
            max_delegation_depth: default_max_delegation_depth(),
            copy_fallback: default_copy_fallback(),
            max_file_size: None,
            database_path: None,
            hardcoded_permissions: BTreeMap::new(),
            default_user_permissions: BTreeMap::new(),
            hardcoded_group_permissions: BTreeMap::new(),
            default_app_permissions: BTreeMap::new(),
            implicit_app_permissions: Vec::new(),
        }
    }
}

impl CoreConfig {
    /// Load configuration from the default path.
    ///
    /// If the config file doesn't exist, returns default configuration.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;

        if !path.exists() {
            tracing::debug!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        Self::load_from(&path)
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Get the default config file path.
    pub fn config_path() -> Result<PathBuf> {
        let dirs = ProjectDirs::from("", "", "cumulus")
            .context("Could not determine config directory")?;

        Ok(dirs.config_dir().join("core.toml"))
    }

    /// Hardcoded grant data for `username` holding `permission`, if any.
    pub fn hardcoded_grant(&self, username: &str, permission: &str) -> Option<&Value> {
        self.hardcoded_permissions
            .get(username)
            .and_then(|perms| perms.get(permission))
    }

    /// Configured group grants of `permission` to `group_uid`, as
    /// (issuer username, grant data).
    pub fn hardcoded_group_grants<'a>(
        &'a self,
        group_uid: &'a str,
        permission: &'a str,
    ) -> impl Iterator<Item = (&'a str, &'a Value)> + 'a {
        self.hardcoded_group_permissions
            .iter()
            .filter_map(move |(issuer, groups)| {
                groups
                    .get(group_uid)
                    .and_then(|perms| perms.get(permission))
                    .map(|data| (issuer.as_str(), data))
            })
    }

    /// Implied grant data for the app `app_uid` holding `permission`: the
    /// every-app defaults first, then the per-app entries.
    pub fn implied_app_grant(&self, app_uid: &str, permission: &str) -> Option<&Value> {
        self.default_app_permissions.get(permission).or_else(|| {
            self.implicit_app_permissions
                .iter()
                .filter(|entry| entry.apps.iter().any(|uid| uid == app_uid))
                .find_map(|entry| entry.permissions.get(permission))
        })
    }
}
