//! Permission resolution.
//!
//! [`PermissionService`] answers "does this actor hold this permission?"
//! in two ways:
//!
//! - [`check`](PermissionService::check): the hot path. Stops at the first
//!   source that grants the permission and returns its grant data.
//! - [`scan`](PermissionService::scan): the audit path. Runs every scanner
//!   concurrently and returns the full [`Reading`] evidence tree.
//!
//! Both pipelines rewrite the permission to canonical form, explode it into
//! the permissions that would also satisfy it, then consult configured
//! grants, implicators and the delegation tables. Delegation is gated live:
//! an issuer's grant only counts while the issuer still holds the
//! permission, and every hop is guarded by a visited set and a depth cap.

mod check;
pub mod rules;
mod scan;
pub mod scanners;
pub mod util;

pub use rules::{
    FnExploder, FnImplicator, FnRewriter, FsModeExploder, PermissionExploder,
    PermissionImplicator, PermissionRewriter, VirtualGroup, FS_MODES,
};
pub use scanners::{PermissionScanner, ScanContext, default_scanners};

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Value, json};

use cumulus_types::{Actor, AppRecord, CoreError, CoreResult, UserId, UserRecord};

use crate::config::CoreConfig;
use crate::db::{AppLookup, Database, Directory, row_i64, row_str};
use crate::sequence::Sequence;

/// Cycle and depth bookkeeping carried through delegation hops.
#[derive(Debug, Clone, Default)]
pub struct ResolveState {
    visited: HashSet<UserId>,
    depth: usize,
}

impl ResolveState {
    /// Fresh state for a top-level query by `actor`.
    ///
    /// App actors start with nothing visited: their one hop is to their own
    /// user.
    pub fn for_actor(actor: &Actor) -> Self {
        let mut visited = HashSet::new();
        if let Some(user) = actor.as_user() {
            visited.insert(user.id);
        }
        Self { visited, depth: 0 }
    }

    /// State for following a delegation to `issuer`, or `None` when that
    /// hop would revisit a user or exceed `max_depth`.
    pub fn descend(&self, issuer: UserId, max_depth: usize) -> Option<Self> {
        if self.visited.contains(&issuer) {
            tracing::debug!(issuer, depth = self.depth, "delegation cycle, skipping issuer");
            return None;
        }
        if self.depth + 1 > max_depth {
            tracing::debug!(issuer, depth = self.depth, "delegation depth limit reached");
            return None;
        }
        let mut visited = self.visited.clone();
        visited.insert(issuer);
        Some(Self {
            visited,
            depth: self.depth + 1,
        })
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn has_visited(&self, user: UserId) -> bool {
        self.visited.contains(&user)
    }
}

/// Grants one issuer has handed out under a permission prefix.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IssuedPermissions {
    pub users: Vec<(UserRecord, String)>,
    pub apps: Vec<(AppRecord, String)>,
}

/// The permission resolver and grant store.
pub struct PermissionService {
    db: Arc<dyn Database>,
    directory: Directory,
    config: CoreConfig,
    rewriters: Vec<Arc<dyn PermissionRewriter>>,
    implicators: Vec<Arc<dyn PermissionImplicator>>,
    exploders: Vec<Arc<dyn PermissionExploder>>,
    scanners: Vec<Arc<dyn PermissionScanner>>,
    virtual_groups: Vec<Arc<VirtualGroup>>,
    check_sequence: Sequence<PermissionService, Value>,
    scan_sequence: Sequence<PermissionService, ()>,
}

/// Registers rules before the service is frozen.
pub struct PermissionServiceBuilder {
    db: Arc<dyn Database>,
    config: CoreConfig,
    rewriters: Vec<Arc<dyn PermissionRewriter>>,
    implicators: Vec<Arc<dyn PermissionImplicator>>,
    exploders: Vec<Arc<dyn PermissionExploder>>,
    scanners: Vec<Arc<dyn PermissionScanner>>,
    virtual_groups: Vec<Arc<VirtualGroup>>,
}

impl PermissionServiceBuilder {
    pub fn rewriter(mut self, rewriter: impl PermissionRewriter + 'static) -> Self {
        self.rewriters.push(Arc::new(rewriter));
        self
    }

    pub fn implicator(mut self, implicator: impl PermissionImplicator + 'static) -> Self {
        self.implicators.push(Arc::new(implicator));
        self
    }

    pub fn exploder(mut self, exploder: impl PermissionExploder + 'static) -> Self {
        self.exploders.push(Arc::new(exploder));
        self
    }

    /// Add a scanner after the default set.
    pub fn scanner(mut self, scanner: impl PermissionScanner + 'static) -> Self {
        self.scanners.push(Arc::new(scanner));
        self
    }

    pub fn virtual_group(mut self, group: VirtualGroup) -> Self {
        self.virtual_groups.push(Arc::new(group));
        self
    }

    pub fn build(self) -> Arc<PermissionService> {
        Arc::new(PermissionService {
            directory: Directory::new(Arc::clone(&self.db)),
            db: self.db,
            config: self.config,
            rewriters: self.rewriters,
            implicators: self.implicators,
            exploders: self.exploders,
            scanners: self.scanners,
            virtual_groups: self.virtual_groups,
            check_sequence: check::check_sequence(),
            scan_sequence: scan::scan_sequence(),
        })
    }
}

impl PermissionService {
    /// Start building a service. The filesystem mode exploder and the
    /// default scanners are pre-registered.
    pub fn builder(db: Arc<dyn Database>, config: CoreConfig) -> PermissionServiceBuilder {
        PermissionServiceBuilder {
            db,
            config,
            rewriters: Vec::new(),
            implicators: Vec::new(),
            exploders: vec![Arc::new(FsModeExploder)],
            scanners: default_scanners(),
            virtual_groups: Vec::new(),
        }
    }

    pub fn db(&self) -> &Arc<dyn Database> {
        &self.db
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn implicators(&self) -> &[Arc<dyn PermissionImplicator>] {
        &self.implicators
    }

    pub fn scanners(&self) -> &[Arc<dyn PermissionScanner>] {
        &self.scanners
    }

    /// Virtual groups `actor` is a member of. Only user actors belong to
    /// any.
    pub fn virtual_groups_of<'a>(&'a self, actor: &'a Actor) -> impl Iterator<Item = &'a VirtualGroup> + 'a {
        let is_user = actor.as_user().is_some();
        self.virtual_groups
            .iter()
            .map(|g| g.as_ref())
            .filter(move |g| is_user && g.contains(actor))
    }

    /// Implied grant data for an app actor, from configuration.
    pub fn implied_app_grant(&self, actor: &Actor, permission: &str) -> Option<Value> {
        let app_actor = actor.as_app()?;
        self.config
            .implied_app_grant(&app_actor.app.uid, permission)
            .cloned()
    }

    /// The issuer named in configuration, or `None` when no such user
    /// exists.
    pub(crate) async fn configured_issuer(&self, username: &str) -> CoreResult<Option<Actor>> {
        match self.directory.user_by_username(username).await? {
            Some(user) => Ok(Some(self.actor_for(user))),
            None => {
                tracing::warn!(issuer = username, "configured group grant names an unknown issuer");
                Ok(None)
            }
        }
    }

    /// Apply every matching rewriter, in registration order.
    pub async fn rewrite_permission(&self, permission: &str) -> CoreResult<String> {
        let mut permission = permission.to_string();
        for rewriter in &self.rewriters {
            if !rewriter.matches(&permission) {
                continue;
            }
            permission = rewriter.rewrite(&permission).await?;
        }
        Ok(permission)
    }

    /// The permission, its parent prefixes and every exploder expansion of
    /// those, de-duplicated in first-seen order.
    pub async fn get_higher_permissions(&self, permission: &str) -> CoreResult<Vec<String>> {
        let mut seen = HashSet::new();
        let mut higher = Vec::new();
        let mut add = |p: String, higher: &mut Vec<String>| {
            if seen.insert(p.clone()) {
                higher.push(p);
            }
        };

        add(permission.to_string(), &mut higher);
        for parent in util::parent_permissions(permission) {
            add(parent.clone(), &mut higher);
            for exploder in &self.exploders {
                if !exploder.matches(&parent) {
                    continue;
                }
                for p in exploder.explode(&parent).await? {
                    add(p, &mut higher);
                }
            }
        }
        Ok(higher)
    }

    /// Configured grant for this actor, checking the per-user table then
    /// the every-user defaults.
    pub fn hardcoded_grant(&self, actor: &Actor, permission: &str) -> Option<Value> {
        let user = actor.as_user()?;
        self.config
            .hardcoded_grant(&user.username, permission)
            .or_else(|| self.config.default_user_permissions.get(permission))
            .cloned()
    }

    pub(crate) async fn issuer_actor(&self, issuer_id: UserId) -> CoreResult<Actor> {
        let user = self
            .directory
            .user_by_id(issuer_id)
            .await?
            .ok_or_else(|| CoreError::Internal(format!("grant issuer {} does not exist", issuer_id)))?;
        Ok(self.actor_for(user))
    }

    /// The actor a user resolves as. The configured system user is the
    /// system actor; everyone else is a plain user.
    pub fn actor_for(&self, user: UserRecord) -> Actor {
        if user.username == self.config.system_username {
            Actor::system(user)
        } else {
            Actor::user(user)
        }
    }

    /// The system actor, creating the system user on first use.
    pub async fn system_actor(&self) -> CoreResult<Actor> {
        let username = &self.config.system_username;
        let user = match self.directory.user_by_username(username).await? {
            Some(user) => user,
            None => self.directory.create_user(username, None).await?,
        };
        Ok(Actor::system(user))
    }

    // ----------------------------------------------------------------
    // Grant management
    // ----------------------------------------------------------------

    /// Grant `permission` from `issuer` to the user named `username`.
    pub async fn grant_user_user_permission(
        &self,
        issuer: &Actor,
        username: &str,
        permission: &str,
        extra: Value,
        reason: Option<&str>,
    ) -> CoreResult<()> {
        let permission = self.rewrite_permission(permission).await?;
        let holder = self.directory.require_user(username).await?;
        let issuer = issuer.user_record();
        if holder.id == issuer.id {
            return Err(CoreError::InvalidInput(
                "cannot grant permissions to yourself".to_string(),
            ));
        }

        self.db
            .write(
                "INSERT INTO user_to_user_permissions (holder_user_id, issuer_user_id, permission, extra) \
                 VALUES (?, ?, ?, ?) \
                 ON CONFLICT(holder_user_id, issuer_user_id, permission) DO UPDATE SET extra = ?",
                &[
                    json!(holder.id),
                    json!(issuer.id),
                    json!(permission),
                    json!(extra.to_string()),
                    json!(extra.to_string()),
                ],
            )
            .await?;

        self.audit_user_user(holder.id, issuer.id, &permission, "grant", reason.unwrap_or("granted via PermissionService"))
            .await?;
        tracing::info!(holder = %holder.username, issuer = %issuer.username, %permission, "granted user permission");
        Ok(())
    }

    pub async fn revoke_user_user_permission(
        &self,
        issuer: &Actor,
        username: &str,
        permission: &str,
        reason: Option<&str>,
    ) -> CoreResult<()> {
        let permission = self.rewrite_permission(permission).await?;
        let holder = self.directory.require_user(username).await?;
        let issuer = issuer.user_record();

        self.db
            .write(
                "DELETE FROM user_to_user_permissions \
                 WHERE holder_user_id = ? AND issuer_user_id = ? AND permission = ?",
                &[json!(holder.id), json!(issuer.id), json!(permission)],
            )
            .await?;

        self.audit_user_user(holder.id, issuer.id, &permission, "revoke", reason.unwrap_or("revoked via PermissionService"))
            .await?;
        tracing::info!(holder = %holder.username, issuer = %issuer.username, %permission, "revoked user permission");
        Ok(())
    }

    async fn audit_user_user(
        &self,
        holder: UserId,
        issuer: UserId,
        permission: &str,
        action: &str,
        reason: &str,
    ) -> CoreResult<()> {
        self.db
            .write(
                "INSERT INTO audit_user_to_user_permissions \
                 (holder_user_id, holder_user_id_keep, issuer_user_id, issuer_user_id_keep, permission, action, reason) \
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
                &[
                    json!(holder),
                    json!(holder),
                    json!(issuer),
                    json!(issuer),
                    json!(permission),
                    json!(action),
                    json!(reason),
                ],
            )
            .await?;
        Ok(())
    }

    /// Grant `permission` from `issuer` to every member of group `group_uid`.
    pub async fn grant_user_group_permission(
        &self,
        issuer: &Actor,
        group_uid: &str,
        permission: &str,
        extra: Value,
        reason: Option<&str>,
    ) -> CoreResult<()> {
        let permission = self.rewrite_permission(permission).await?;
        let group = self.directory.require_group(group_uid).await?;
        let issuer = issuer.user_record();

        self.db
            .write(
                "INSERT INTO user_to_group_permissions (user_id, group_id, permission, extra) \
                 VALUES (?, ?, ?, ?) \
                 ON CONFLICT(user_id, group_id, permission) DO UPDATE SET extra = ?",
                &[
                    json!(issuer.id),
                    json!(group),
                    json!(permission),
                    json!(extra.to_string()),
                    json!(extra.to_string()),
                ],
            )
            .await?;

        self.audit_user_group(issuer.id, group, &permission, "grant", reason.unwrap_or("granted via PermissionService"))
            .await
    }

    pub async fn revoke_user_group_permission(
        &self,
        issuer: &Actor,
        group_uid: &str,
        permission: &str,
        reason: Option<&str>,
    ) -> CoreResult<()> {
        let permission = self.rewrite_permission(permission).await?;
        let group = self.directory.require_group(group_uid).await?;
        let issuer = issuer.user_record();

        self.db
            .write(
                "DELETE FROM user_to_group_permissions \
                 WHERE user_id = ? AND group_id = ? AND permission = ?",
                &[json!(issuer.id), json!(group), json!(permission)],
            )
            .await?;

        self.audit_user_group(issuer.id, group, &permission, "revoke", reason.unwrap_or("revoked via PermissionService"))
            .await
    }

    async fn audit_user_group(
        &self,
        user: UserId,
        group: i64,
        permission: &str,
        action: &str,
        reason: &str,
    ) -> CoreResult<()> {
        self.db
            .write(
                "INSERT INTO audit_user_to_group_permissions \
                 (user_id, user_id_keep, group_id, group_id_keep, permission, action, reason) \
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
                &[
                    json!(user),
                    json!(user),
                    json!(group),
                    json!(group),
                    json!(permission),
                    json!(action),
                    json!(reason),
                ],
            )
            .await?;
        Ok(())
    }

    /// Let an app act on `permission` for the granting user. The app still
    /// needs the user to hold the permission at resolution time.
    pub async fn grant_user_app_permission(
        &self,
        user: &Actor,
        app: &str,
        permission: &str,
        extra: Value,
        reason: Option<&str>,
    ) -> CoreResult<()> {
        let permission = self.rewrite_permission(permission).await?;
        let app = self.directory.require_app(&AppLookup::UidOrName(app.to_string())).await?;
        let user = user.user_record();

        self.db
            .write(
                "INSERT INTO user_to_app_permissions (user_id, app_id, permission, extra) \
                 VALUES (?, ?, ?, ?) \
                 ON CONFLICT(user_id, app_id, permission) DO UPDATE SET extra = ?",
                &[
                    json!(user.id),
                    json!(app.id),
                    json!(permission),
                    json!(extra.to_string()),
                    json!(extra.to_string()),
                ],
            )
            .await?;

        self.audit_user_app(user.id, app.id, &permission, "grant", reason.unwrap_or("granted via PermissionService"))
            .await
    }

    pub async fn revoke_user_app_permission(
        &self,
        user: &Actor,
        app: &str,
        permission: &str,
        reason: Option<&str>,
    ) -> CoreResult<()> {
        let permission = self.rewrite_permission(permission).await?;
        let user = user
            .as_user()
            .ok_or_else(|| CoreError::InvalidInput("actor must be a user".to_string()))?;
        let app = self.directory.require_app(&AppLookup::UidOrName(app.to_string())).await?;

        self.db
            .write(
                "DELETE FROM user_to_app_permissions \
                 WHERE user_id = ? AND app_id = ? AND permission = ?",
                &[json!(user.id), json!(app.id), json!(permission)],
            )
            .await?;

        self.audit_user_app(user.id, app.id, &permission, "revoke", reason.unwrap_or("revoked via PermissionService"))
            .await
    }

    /// Revoke everything `user` granted to `app`.
    pub async fn revoke_user_app_all(&self, user: &Actor, app: &str, reason: Option<&str>) -> CoreResult<()> {
        let user = user
            .as_user()
            .ok_or_else(|| CoreError::InvalidInput("actor must be a user".to_string()))?;
        let app = self.directory.require_app(&AppLookup::UidOrName(app.to_string())).await?;

        self.db
            .write(
                "DELETE FROM user_to_app_permissions WHERE user_id = ? AND app_id = ?",
                &[json!(user.id), json!(app.id)],
            )
            .await?;

        self.audit_user_app(user.id, app.id, "*", "revoke", reason.unwrap_or("revoked all via PermissionService"))
            .await
    }

    async fn audit_user_app(
        &self,
        user: UserId,
        app: i64,
        permission: &str,
        action: &str,
        reason: &str,
    ) -> CoreResult<()> {
        self.db
            .write(
                "INSERT INTO audit_user_to_app_permissions \
                 (user_id, user_id_keep, app_id, app_id_keep, permission, action, reason) \
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
                &[
                    json!(user),
                    json!(user),
                    json!(app),
                    json!(app),
                    json!(permission),
                    json!(action),
                    json!(reason),
                ],
            )
            .await?;
        Ok(())
    }

    // ----------------------------------------------------------------
    // Flat (non-cascading) queries
    // ----------------------------------------------------------------

    /// Users who have granted anything directly to `holder`.
    pub async fn list_user_permission_issuers(&self, holder: &UserRecord) -> CoreResult<Vec<UserRecord>> {
        let rows = self
            .db
            .read(
                "SELECT DISTINCT issuer_user_id FROM user_to_user_permissions WHERE holder_user_id = ?",
                &[json!(holder.id)],
            )
            .await?;

        let mut users = Vec::with_capacity(rows.len());
        for row in &rows {
            if let Some(user) = self.directory.user_by_id(row_i64(row, "issuer_user_id")?).await? {
                users.push(user);
            }
        }
        Ok(users)
    }

    /// Grants `issuer` has made whose permission starts with `prefix`,
    /// e.g. every share of one file (`fs:<uid>`).
    pub async fn query_issuer_permissions_by_prefix(
        &self,
        issuer: &UserRecord,
        prefix: &str,
    ) -> CoreResult<IssuedPermissions> {
        let pattern = format!("{}%", prefix);
        let user_rows = self
            .db
            .read(
                "SELECT DISTINCT holder_user_id, permission FROM user_to_user_permissions \
                 WHERE issuer_user_id = ? AND permission LIKE ?",
                &[json!(issuer.id), json!(pattern)],
            )
            .await?;
        let app_rows = self
            .db
            .read(
                "SELECT DISTINCT app_id, permission FROM user_to_app_permissions \
                 WHERE user_id = ? AND permission LIKE ?",
                &[json!(issuer.id), json!(pattern)],
            )
            .await?;

        let mut issued = IssuedPermissions::default();
        for row in &user_rows {
            if let Some(user) = self.directory.user_by_id(row_i64(row, "holder_user_id")?).await? {
                issued.users.push((user, row_str(row, "permission")?.to_string()));
            }
        }
        for row in &app_rows {
            let app_id = row_i64(row, "app_id")?;
            let apps = self
                .db
                .read("SELECT uid FROM app WHERE id = ?", &[json!(app_id)])
                .await?;
            if let Some(app_row) = apps.first() {
                let uid = row_str(app_row, "uid")?.to_string();
                if let Some(app) = self.directory.app(&AppLookup::Uid(uid)).await? {
                    issued.apps.push((app, row_str(row, "permission")?.to_string()));
                }
            }
        }
        Ok(issued)
    }
}
