//! The fast check pipeline.
//!
//! Each step stops the run with grant data as soon as it finds a source
//! that satisfies the query. Delegations are followed with a live,
//! recursive check of the issuer.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{Value, json};

use cumulus_types::{Actor, CoreResult};

use super::{PermissionService, ResolveState};
use crate::db::{any_of, row_extra, row_i64, row_str};
use crate::sequence::{Sequence, SequenceState, Step, StepFuture, scope_value};

type St = SequenceState<PermissionService, Value>;

fn option_params(leading: Vec<Value>, options: &[String]) -> Vec<Value> {
    let mut params = leading;
    params.extend(options.iter().map(|o| json!(o)));
    params
}

fn is_system<'a>(a: &'a St) -> BoxFuture<'a, CoreResult<bool>> {
    Box::pin(async move { Ok(a.require::<Actor>("actor")?.is_system()) })
}

fn is_user<'a>(a: &'a St) -> BoxFuture<'a, CoreResult<bool>> {
    Box::pin(async move { Ok(a.require::<Actor>("actor")?.as_user().is_some()) })
}

fn is_app<'a>(a: &'a St) -> BoxFuture<'a, CoreResult<bool>> {
    Box::pin(async move { Ok(a.require::<Actor>("actor")?.as_app().is_some()) })
}

fn grant_if_system<'a>(a: &'a mut St) -> StepFuture<'a, Value> {
    Box::pin(async move { Ok(a.stop(json!({}))) })
}

fn rewrite_permission<'a>(a: &'a mut St) -> StepFuture<'a, Value> {
    Box::pin(async move {
        let permission = a.require::<String>("permission")?.clone();
        let permission = a.host().rewrite_permission(&permission).await?;
        a.set("permission", permission);
        Ok(None)
    })
}

fn explode_permission<'a>(a: &'a mut St) -> StepFuture<'a, Value> {
    Box::pin(async move {
        let permission = a.require::<String>("permission")?.clone();
        let options = a.host().get_higher_permissions(&permission).await?;
        a.set("options", options);
        Ok(None)
    })
}

fn check_hardcoded<'a>(a: &'a mut St) -> StepFuture<'a, Value> {
    Box::pin(async move {
        let actor = a.require::<Actor>("actor")?;
        let options = a.require::<Vec<String>>("options")?;
        let found = options
            .iter()
            .find_map(|option| a.host().hardcoded_grant(actor, option));
        Ok(match found {
            Some(data) => a.stop(data),
            None => None,
        })
    })
}

fn check_virtual_groups<'a>(a: &'a mut St) -> StepFuture<'a, Value> {
    Box::pin(async move {
        let actor = a.require::<Actor>("actor")?;
        let options = a.require::<Vec<String>>("options")?;
        let found = a.host().virtual_groups_of(actor).find_map(|group| {
            options
                .iter()
                .find_map(|option| group.grant(option))
                .cloned()
        });
        Ok(match found {
            Some(data) => a.stop(data),
            None => None,
        })
    })
}

/// Shortcut implicators end resolution on the first option they grant,
/// the same pass a scan makes before its scanners run.
fn check_shortcut_implicators<'a>(a: &'a mut St) -> StepFuture<'a, Value> {
    Box::pin(async move {
        let actor = a.require::<Actor>("actor")?.clone();
        let options = a.require::<Vec<String>>("options")?.clone();
        let host = Arc::clone(a.host());

        for implicator in host.implicators().iter().filter(|i| i.is_shortcut()) {
            for option in &options {
                if !implicator.matches(option) {
                    continue;
                }
                if let Some(data) = implicator.check(&actor, option).await? {
                    tracing::debug!(implicator = implicator.id(), %option, "shortcut implicator granted");
                    return Ok(a.stop(data));
                }
            }
        }
        Ok(None)
    })
}

/// Non-shortcut implicators against the rewritten permission only.
/// Exploded options are not offered to implicators here, unlike in a scan.
fn check_implicators<'a>(a: &'a mut St) -> StepFuture<'a, Value> {
    Box::pin(async move {
        let actor = a.require::<Actor>("actor")?.clone();
        let permission = a.require::<String>("permission")?.clone();
        let host = Arc::clone(a.host());

        for implicator in host.implicators().iter().filter(|i| !i.is_shortcut()) {
            if !implicator.matches(&permission) {
                continue;
            }
            if let Some(data) = implicator.check(&actor, &permission).await? {
                tracing::debug!(implicator = implicator.id(), %permission, "implicator granted");
                return Ok(a.stop(data));
            }
        }
        Ok(None)
    })
}

fn check_user_user<'a>(a: &'a mut St) -> StepFuture<'a, Value> {
    Box::pin(async move {
        let actor = a.require::<Actor>("actor")?.clone();
        let options = a.require::<Vec<String>>("options")?.clone();
        let state = a.require::<ResolveState>("state")?.clone();
        let host = Arc::clone(a.host());
        let Some(holder) = actor.as_user() else {
            return Ok(None);
        };

        let sql = format!(
            "SELECT issuer_user_id, permission, extra FROM user_to_user_permissions \
             WHERE holder_user_id = ? AND {}",
            any_of("permission", options.len())
        );
        let rows = host
            .db()
            .read(&sql, &option_params(vec![json!(holder.id)], &options))
            .await?;

        for row in &rows {
            let issuer_id = row_i64(row, "issuer_user_id")?;
            let Some(next) = state.descend(issuer_id, host.config().max_delegation_depth) else {
                continue;
            };
            let issuer = host.issuer_actor(issuer_id).await?;
            let permission = row_str(row, "permission")?.to_string();
            if host.check_with_state(issuer, permission, next).await?.is_some() {
                return Ok(a.stop(row_extra(row)));
            }
        }
        Ok(None)
    })
}

fn check_user_group<'a>(a: &'a mut St) -> StepFuture<'a, Value> {
    Box::pin(async move {
        let actor = a.require::<Actor>("actor")?.clone();
        let options = a.require::<Vec<String>>("options")?.clone();
        let state = a.require::<ResolveState>("state")?.clone();
        let host = Arc::clone(a.host());
        let Some(holder) = actor.as_user() else {
            return Ok(None);
        };

        let sql = format!(
            "SELECT p.user_id, p.permission, p.extra \
             FROM user_to_group_permissions p \
             JOIN jct_user_group ug ON p.group_id = ug.group_id \
             WHERE ug.user_id = ? AND {}",
            any_of("p.permission", options.len())
        );
        let rows = host
            .db()
            .read(&sql, &option_params(vec![json!(holder.id)], &options))
            .await?;

        for row in &rows {
            let issuer_id = row_i64(row, "user_id")?;
            let Some(next) = state.descend(issuer_id, host.config().max_delegation_depth) else {
                continue;
            };
            let issuer = host.issuer_actor(issuer_id).await?;
            let permission = row_str(row, "permission")?.to_string();
            if host.check_with_state(issuer, permission, next).await?.is_some() {
                return Ok(a.stop(row_extra(row)));
            }
        }
        Ok(None)
    })
}

/// Configured grants to the actor's groups, gated live on the issuer.
fn check_hardcoded_group<'a>(a: &'a mut St) -> StepFuture<'a, Value> {
    Box::pin(async move {
        let actor = a.require::<Actor>("actor")?.clone();
        let options = a.require::<Vec<String>>("options")?.clone();
        let state = a.require::<ResolveState>("state")?.clone();
        let host = Arc::clone(a.host());
        let Some(holder) = actor.as_user() else {
            return Ok(None);
        };
        if host.config().hardcoded_group_permissions.is_empty() {
            return Ok(None);
        }

        for (group_uid, _) in host.directory().groups_of(holder.id).await? {
            for option in &options {
                for (issuer_username, data) in host.config().hardcoded_group_grants(&group_uid, option) {
                    let Some(issuer) = host.configured_issuer(issuer_username).await? else {
                        continue;
                    };
                    let Some(next) = state.descend(issuer.user_record().id, host.config().max_delegation_depth)
                    else {
                        continue;
                    };
                    if host.check_with_state(issuer, option.clone(), next).await?.is_some() {
                        return Ok(a.stop(data.clone()));
                    }
                }
            }
        }
        Ok(None)
    })
}

/// An app holds a permission only if its user does, and the user granted
/// it to the app or configuration implies it for the app.
fn check_user_app<'a>(a: &'a mut St) -> StepFuture<'a, Value> {
    Box::pin(async move {
        let actor = a.require::<Actor>("actor")?.clone();
        let permission = a.require::<String>("permission")?.clone();
        let options = a.require::<Vec<String>>("options")?.clone();
        let state = a.require::<ResolveState>("state")?.clone();
        let host = Arc::clone(a.host());
        let Some(app_actor) = actor.as_app() else {
            return Ok(None);
        };

        let Some(next) = state.descend(app_actor.user.id, host.config().max_delegation_depth) else {
            return Ok(a.stop_empty());
        };
        if host
            .check_with_state(actor.related_user_actor(), permission, next)
            .await?
            .is_none()
        {
            return Ok(a.stop_empty());
        }

        let sql = format!(
            "SELECT permission, extra FROM user_to_app_permissions \
             WHERE user_id = ? AND app_id = ? AND {}",
            any_of("permission", options.len())
        );
        let rows = host
            .db()
            .read(
                &sql,
                &option_params(vec![json!(app_actor.user.id), json!(app_actor.app.id)], &options),
            )
            .await?;

        if let Some(row) = rows.first() {
            return Ok(a.stop(row_extra(row)));
        }
        let implied = options
            .iter()
            .find_map(|option| host.implied_app_grant(&actor, option));
        Ok(match implied {
            Some(data) => a.stop(data),
            None => None,
        })
    })
}

pub(super) fn check_sequence() -> Sequence<PermissionService, Value> {
    Sequence::new(
        "permission-check",
        vec![
            Step::new("grant_if_system", grant_if_system).when(is_system),
            Step::new("rewrite_permission", rewrite_permission),
            Step::new("explode_permission", explode_permission),
            Step::new("check_shortcut_implicators", check_shortcut_implicators),
            Step::new("check_hardcoded", check_hardcoded).when(is_user),
            Step::new("check_virtual_groups", check_virtual_groups).when(is_user),
            Step::new("check_implicators", check_implicators),
            Step::new("check_user_user", check_user_user).when(is_user),
            Step::new("check_user_group", check_user_group).when(is_user),
            Step::new("check_hardcoded_group", check_hardcoded_group).when(is_user),
            Step::new("check_user_app", check_user_app).when(is_app),
        ],
    )
}

impl PermissionService {
    /// Grant data if `actor` holds `permission`, `None` otherwise.
    ///
    /// Returns at the first satisfying source. Use [`scan`](Self::scan) to
    /// see every reason.
    #[tracing::instrument(level = "debug", skip(self, actor), fields(actor = %actor.uid()))]
    pub async fn check(self: &Arc<Self>, actor: &Actor, permission: &str) -> CoreResult<Option<Value>> {
        self.check_with_state(
            actor.clone(),
            permission.to_string(),
            ResolveState::for_actor(actor),
        )
        .await
    }

    /// Convenience wrapper over [`check`](Self::check).
    pub async fn has(self: &Arc<Self>, actor: &Actor, permission: &str) -> CoreResult<bool> {
        Ok(self.check(actor, permission).await?.is_some())
    }

    /// Check on behalf of a delegation hop already in progress.
    pub fn check_with_state(
        self: &Arc<Self>,
        actor: Actor,
        permission: String,
        state: ResolveState,
    ) -> BoxFuture<'static, CoreResult<Option<Value>>> {
        let service = Arc::clone(self);
        Box::pin(async move {
            tracing::debug!(actor = %actor, %permission, depth = state.depth(), "checking permission");
            service
                .check_sequence
                .call_with(
                    Arc::clone(&service),
                    [
                        ("actor", scope_value(actor)),
                        ("permission", scope_value(permission)),
                        ("state", scope_value(state)),
                    ],
                )
                .await
        })
    }
}
