//! Scanners: the pluggable sources a full scan consults.
//!
//! Each scanner inspects one kind of evidence (implicators, configured
//! grants, virtual groups, one delegation table) and reports what it found
//! as readings.
//! All scanners of a scan run concurrently; they only ever append.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use cumulus_types::{
    Actor, CoreResult, OptionSource, PathVia, Reading, reading_has_terminal,
};

use super::{PermissionService, ResolveState};
use crate::db::{any_of, row_extra, row_i64, row_str};

/// Everything a scanner needs to know about the query in flight.
pub struct ScanContext {
    pub service: Arc<PermissionService>,
    pub actor: Actor,
    /// The exploded permission options; any one of them satisfies the query.
    pub options: Vec<String>,
    pub state: ResolveState,
}

impl ScanContext {
    fn option_params(&self, leading: Vec<Value>) -> Vec<Value> {
        let mut params = leading;
        params.extend(self.options.iter().map(|o| json!(o)));
        params
    }
}

/// A source of permission evidence.
#[async_trait]
pub trait PermissionScanner: Send + Sync {
    fn name(&self) -> &str;

    async fn scan(&self, cx: &ScanContext) -> CoreResult<Vec<Reading>>;
}

/// The built-in scanners, in the order their readings are reported.
pub fn default_scanners() -> Vec<Arc<dyn PermissionScanner>> {
    vec![
        Arc::new(ImpliedScanner),
        Arc::new(HardcodedScanner),
        Arc::new(UserUserScanner),
        Arc::new(UserGroupUserScanner),
        Arc::new(HcUserGroupScanner),
        Arc::new(VirtualGroupScanner),
        Arc::new(UserAppScanner),
    ]
}

/// Every implicator against every option.
pub struct ImpliedScanner;

#[async_trait]
impl PermissionScanner for ImpliedScanner {
    fn name(&self) -> &str {
        "implied"
    }

    async fn scan(&self, cx: &ScanContext) -> CoreResult<Vec<Reading>> {
        let mut reading = Vec::new();
        let holder = cx.actor.as_user().map(|u| u.username.clone());
        for implicator in cx.service.implicators() {
            for option in &cx.options {
                if !implicator.matches(option) {
                    continue;
                }
                if let Some(data) = implicator.check(&cx.actor, option).await? {
                    reading.push(Reading::Option {
                        permission: option.clone(),
                        source: OptionSource::Implied,
                        by: Some(implicator.id().to_string()),
                        data,
                        holder_username: holder.clone(),
                    });
                }
            }
        }
        Ok(reading)
    }
}

/// Configured per-user and every-user grants.
pub struct HardcodedScanner;

#[async_trait]
impl PermissionScanner for HardcodedScanner {
    fn name(&self) -> &str {
        "hardcoded"
    }

    async fn scan(&self, cx: &ScanContext) -> CoreResult<Vec<Reading>> {
        let Some(user) = cx.actor.as_user() else {
            return Ok(Vec::new());
        };
        Ok(cx
            .options
            .iter()
            .filter_map(|option| {
                cx.service
                    .hardcoded_grant(&cx.actor, option)
                    .map(|data| Reading::Option {
                        permission: option.clone(),
                        source: OptionSource::Hardcoded,
                        by: None,
                        data,
                        holder_username: Some(user.username.clone()),
                    })
            })
            .collect())
    }
}

/// Direct user-to-user delegations, each justified by the issuer's own scan.
pub struct UserUserScanner;

#[async_trait]
impl PermissionScanner for UserUserScanner {
    fn name(&self) -> &str {
        "user-user"
    }

    async fn scan(&self, cx: &ScanContext) -> CoreResult<Vec<Reading>> {
        let Some(holder) = cx.actor.as_user() else {
            return Ok(Vec::new());
        };
        let sql = format!(
            "SELECT issuer_user_id, permission, extra FROM user_to_user_permissions \
             WHERE holder_user_id = ? AND {}",
            any_of("permission", cx.options.len())
        );
        let rows = cx
            .service
            .db()
            .read(&sql, &cx.option_params(vec![json!(holder.id)]))
            .await?;

        let max_depth = cx.service.config().max_delegation_depth;
        let mut reading = Vec::new();
        for row in &rows {
            let issuer_id = row_i64(row, "issuer_user_id")?;
            let Some(next) = cx.state.descend(issuer_id, max_depth) else {
                continue;
            };
            let issuer = cx.service.issuer_actor(issuer_id).await?;
            let permission = row_str(row, "permission")?.to_string();
            let issuer_reading = cx
                .service
                .scan_with_state(issuer.clone(), permission.clone(), next)
                .await?;

            reading.push(Reading::Path {
                via: PathVia::User,
                permission,
                data: row_extra(row),
                holder_username: holder.username.clone(),
                issuer_username: issuer.user_record().username.clone(),
                group_id: None,
                has_terminal: reading_has_terminal(&issuer_reading),
                reading: issuer_reading,
            });
        }
        Ok(reading)
    }
}

/// Grants made to a group the actor belongs to.
pub struct UserGroupUserScanner;

#[async_trait]
impl PermissionScanner for UserGroupUserScanner {
    fn name(&self) -> &str {
        "user-group-user"
    }

    async fn scan(&self, cx: &ScanContext) -> CoreResult<Vec<Reading>> {
        let Some(holder) = cx.actor.as_user() else {
            return Ok(Vec::new());
        };
        let sql = format!(
            "SELECT p.user_id, p.group_id, p.permission, p.extra \
             FROM user_to_group_permissions p \
             JOIN jct_user_group ug ON p.group_id = ug.group_id \
             WHERE ug.user_id = ? AND {}",
            any_of("p.permission", cx.options.len())
        );
        let rows = cx
            .service
            .db()
            .read(&sql, &cx.option_params(vec![json!(holder.id)]))
            .await?;

        let max_depth = cx.service.config().max_delegation_depth;
        let mut reading = Vec::new();
        for row in &rows {
            let issuer_id = row_i64(row, "user_id")?;
            let Some(next) = cx.state.descend(issuer_id, max_depth) else {
                continue;
            };
            let issuer = cx.service.issuer_actor(issuer_id).await?;
            let permission = row_str(row, "permission")?.to_string();
            let issuer_reading = cx
                .service
                .scan_with_state(issuer.clone(), permission.clone(), next)
                .await?;

            reading.push(Reading::Path {
                via: PathVia::UserGroup,
                permission,
                data: row_extra(row),
                holder_username: holder.username.clone(),
                issuer_username: issuer.user_record().username.clone(),
                group_id: Some(row_i64(row, "group_id")?),
                has_terminal: reading_has_terminal(&issuer_reading),
                reading: issuer_reading,
            });
        }
        Ok(reading)
    }
}

/// Configured grants to stored groups the actor belongs to, each justified
/// by the configured issuer's own scan.
pub struct HcUserGroupScanner;

#[async_trait]
impl PermissionScanner for HcUserGroupScanner {
    fn name(&self) -> &str {
        "hc-user-group-user"
    }

    async fn scan(&self, cx: &ScanContext) -> CoreResult<Vec<Reading>> {
        let Some(holder) = cx.actor.as_user() else {
            return Ok(Vec::new());
        };
        if cx.service.config().hardcoded_group_permissions.is_empty() {
            return Ok(Vec::new());
        }

        let max_depth = cx.service.config().max_delegation_depth;
        let mut reading = Vec::new();
        for (group_uid, group_id) in cx.service.directory().groups_of(holder.id).await? {
            for option in &cx.options {
                for (issuer_username, data) in cx.service.config().hardcoded_group_grants(&group_uid, option) {
                    let Some(issuer) = cx.service.configured_issuer(issuer_username).await? else {
                        continue;
                    };
                    let Some(next) = cx.state.descend(issuer.user_record().id, max_depth) else {
                        continue;
                    };
                    let issuer_reading = cx
                        .service
                        .scan_with_state(issuer.clone(), option.clone(), next)
                        .await?;

                    reading.push(Reading::Path {
                        via: PathVia::HcUserGroup,
                        permission: option.clone(),
                        data: data.clone(),
                        holder_username: holder.username.clone(),
                        issuer_username: issuer_username.to_string(),
                        group_id: Some(group_id),
                        has_terminal: reading_has_terminal(&issuer_reading),
                        reading: issuer_reading,
                    });
                }
            }
        }
        Ok(reading)
    }
}

/// Permissions listed on the virtual groups the actor belongs to.
pub struct VirtualGroupScanner;

#[async_trait]
impl PermissionScanner for VirtualGroupScanner {
    fn name(&self) -> &str {
        "user-virtual-group-user"
    }

    async fn scan(&self, cx: &ScanContext) -> CoreResult<Vec<Reading>> {
        let holder = cx.actor.as_user().map(|u| u.username.clone());
        let mut reading = Vec::new();
        for group in cx.service.virtual_groups_of(&cx.actor) {
            for option in &cx.options {
                if let Some(data) = group.grant(option) {
                    reading.push(Reading::Option {
                        permission: option.clone(),
                        source: OptionSource::VirtualGroup,
                        by: Some(group.id().to_string()),
                        data: data.clone(),
                        holder_username: holder.clone(),
                    });
                }
            }
        }
        Ok(reading)
    }
}

/// App actors: what the user let this app do, and what configuration
/// implies for it, gated by what the user holds.
pub struct UserAppScanner;

#[async_trait]
impl PermissionScanner for UserAppScanner {
    fn name(&self) -> &str {
        "user-app"
    }

    async fn scan(&self, cx: &ScanContext) -> CoreResult<Vec<Reading>> {
        let Some(app_actor) = cx.actor.as_app() else {
            return Ok(Vec::new());
        };
        let sql = format!(
            "SELECT permission, extra FROM user_to_app_permissions \
             WHERE user_id = ? AND app_id = ? AND {}",
            any_of("permission", cx.options.len())
        );
        let rows = cx
            .service
            .db()
            .read(
                &sql,
                &cx.option_params(vec![json!(app_actor.user.id), json!(app_actor.app.id)]),
            )
            .await?;

        let mut grants = Vec::with_capacity(rows.len());
        for row in &rows {
            grants.push((PathVia::UserApp, row_str(row, "permission")?.to_string(), row_extra(row)));
        }
        for option in &cx.options {
            if let Some(data) = cx.service.implied_app_grant(&cx.actor, option) {
                grants.push((PathVia::UserAppImplied, option.clone(), data));
            }
        }
        if grants.is_empty() {
            return Ok(Vec::new());
        }

        let max_depth = cx.service.config().max_delegation_depth;
        let Some(next) = cx.state.descend(app_actor.user.id, max_depth) else {
            return Ok(Vec::new());
        };
        let user = cx.actor.related_user_actor();

        let mut reading = Vec::new();
        for (via, permission, data) in grants {
            let user_reading = cx
                .service
                .scan_with_state(user.clone(), permission.clone(), next.clone())
                .await?;

            reading.push(Reading::Path {
                via,
                permission,
                data,
                holder_username: app_actor.app.name.clone(),
                issuer_username: app_actor.user.username.clone(),
                group_id: None,
                has_terminal: reading_has_terminal(&user_reading),
                reading: user_reading,
            });
        }
        Ok(reading)
    }
}
