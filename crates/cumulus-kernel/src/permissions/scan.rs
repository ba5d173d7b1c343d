//! The full scan pipeline.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures::future::{BoxFuture, join_all};
use serde_json::json;

use cumulus_types::{Actor, CoreResult, OptionSource, Reading};

use super::{PermissionService, ResolveState, ScanContext};
use crate::sequence::{Sequence, SequenceState, Step, StepFuture, scope_value};

/// Shared sink the steps append readings to.
type ReadingLog = Arc<Mutex<Vec<Reading>>>;

type St = SequenceState<PermissionService, ()>;

fn push(a: &St, readings: impl IntoIterator<Item = Reading>) -> CoreResult<()> {
    let log = a.require::<ReadingLog>("reading")?;
    log.lock()
        .unwrap_or_else(|e| e.into_inner())
        .extend(readings);
    Ok(())
}

fn is_system<'a>(a: &'a St) -> BoxFuture<'a, CoreResult<bool>> {
    Box::pin(async move { Ok(a.require::<Actor>("actor")?.is_system()) })
}

fn grant_if_system<'a>(a: &'a mut St) -> StepFuture<'a, ()> {
    Box::pin(async move {
        let permission = a.require::<String>("permission")?.clone();
        push(
            a,
            [Reading::Option {
                permission,
                source: OptionSource::System,
                by: Some("system".to_string()),
                data: json!({}),
                holder_username: None,
            }],
        )?;
        Ok(a.stop(()))
    })
}

fn rewrite_permission<'a>(a: &'a mut St) -> StepFuture<'a, ()> {
    Box::pin(async move {
        let old = a.require::<String>("permission")?.clone();
        let new = a.host().rewrite_permission(&old).await?;
        if new != old {
            push(a, [Reading::Rewrite { old, new: new.clone() }])?;
        }
        a.set("permission", new);
        Ok(None)
    })
}

fn explode_permission<'a>(a: &'a mut St) -> StepFuture<'a, ()> {
    Box::pin(async move {
        let permission = a.require::<String>("permission")?.clone();
        let options = a.host().get_higher_permissions(&permission).await?;
        if options.len() > 1 {
            push(
                a,
                [Reading::Explode {
                    permission,
                    options: options.clone(),
                }],
            )?;
        }
        a.set("options", options);
        Ok(None)
    })
}

fn shortcut_implicators<'a>(a: &'a mut St) -> StepFuture<'a, ()> {
    Box::pin(async move {
        let actor = a.require::<Actor>("actor")?.clone();
        let options = a.require::<Vec<String>>("options")?.clone();
        let host = Arc::clone(a.host());

        for implicator in host.implicators().iter().filter(|i| i.is_shortcut()) {
            for option in &options {
                if !implicator.matches(option) {
                    continue;
                }
                let Some(data) = implicator.check(&actor, option).await? else {
                    continue;
                };
                tracing::debug!(implicator = implicator.id(), %option, "shortcut implicator granted");
                push(
                    a,
                    [Reading::Option {
                        permission: option.clone(),
                        source: OptionSource::Implied,
                        by: Some(implicator.id().to_string()),
                        data,
                        holder_username: actor.as_user().map(|u| u.username.clone()),
                    }],
                )?;
                return Ok(a.stop(()));
            }
        }
        Ok(None)
    })
}

fn run_scanners<'a>(a: &'a mut St) -> StepFuture<'a, ()> {
    Box::pin(async move {
        let cx = ScanContext {
            service: Arc::clone(a.host()),
            actor: a.require::<Actor>("actor")?.clone(),
            options: a.require::<Vec<String>>("options")?.clone(),
            state: a.require::<ResolveState>("state")?.clone(),
        };

        let results = join_all(cx.service.scanners().iter().map(|scanner| {
            let cx = &cx;
            async move {
                let found = scanner.scan(cx).await;
                tracing::trace!(scanner = scanner.name(), ok = found.is_ok(), "scanner finished");
                found
            }
        }))
        .await;

        for found in results {
            push(a, found?)?;
        }
        Ok(None)
    })
}

pub(super) fn scan_sequence() -> Sequence<PermissionService, ()> {
    Sequence::new(
        "permission-scan",
        vec![
            Step::new("grant_if_system", grant_if_system).when(is_system),
            Step::new("rewrite_permission", rewrite_permission),
            Step::new("explode_permission", explode_permission),
            Step::new("shortcut_implicators", shortcut_implicators),
            Step::new("run_scanners", run_scanners),
        ],
    )
}

impl PermissionService {
    /// Collect every piece of evidence for `actor` holding `permission`.
    ///
    /// Slower than [`check`](Self::check): all scanners run to completion.
    /// The permission is granted iff the result has a terminal reading.
    #[tracing::instrument(level = "debug", skip(self, actor), fields(actor = %actor.uid()))]
    pub async fn scan(self: &Arc<Self>, actor: &Actor, permission: &str) -> CoreResult<Vec<Reading>> {
        self.scan_with_state(
            actor.clone(),
            permission.to_string(),
            ResolveState::for_actor(actor),
        )
        .await
    }

    /// Scan on behalf of a delegation hop already in progress.
    pub fn scan_with_state(
        self: &Arc<Self>,
        actor: Actor,
        permission: String,
        state: ResolveState,
    ) -> BoxFuture<'static, CoreResult<Vec<Reading>>> {
        let service = Arc::clone(self);
        Box::pin(async move {
            let start = Instant::now();
            let log: ReadingLog = Arc::new(Mutex::new(Vec::new()));
            tracing::debug!(actor = %actor, %permission, depth = state.depth(), "scanning permission");

            service
                .scan_sequence
                .call_with(
                    Arc::clone(&service),
                    [
                        ("actor", scope_value(actor)),
                        ("permission", scope_value(permission)),
                        ("state", scope_value(state)),
                        ("reading", scope_value(Arc::clone(&log))),
                    ],
                )
                .await?;

            let mut reading = std::mem::take(&mut *log.lock().unwrap_or_else(|e| e.into_inner()));
            reading.push(Reading::Time {
                value: start.elapsed().as_millis() as u64,
            });
            Ok(reading)
        })
    }
}
