//! Sharing files with other users.
//!
//! A share request names recipients (usernames or emails) and shares
//! (`fs-share` objects with a path and an access mode). Both lists are
//! validated, snapshotted into locked-in [`WorkList`]s and processed item by
//! item; a bad item is reported in its slot of the [`ShareReport`] rather
//! than failing the whole request. In `strict` mode any bad item aborts the
//! request before anything is granted.
//!
//! Every valid (recipient, share) pair becomes a user-to-user grant of
//! `fs:<uid>:<access>` from the sharing user.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use cumulus_types::{Actor, CoreError, CoreResult, Selector, UserRecord};

use crate::fs::{MountTable, StatOptions};
use crate::permissions::PermissionService;
use crate::sequence::{Sequence, SequenceState, Step, StepFuture, scope_value};
use crate::worklist::{WorkItem, WorkList};

type St = SequenceState<ShareService, ShareReport>;

/// The body of a share request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ShareRequest {
    /// A username, an email, or a list of them.
    #[serde(default)]
    pub recipients: Value,
    /// One share object or a list of them.
    #[serde(default)]
    pub shares: Value,
    /// `strict` or `best-effort` (the default).
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ShareStatus {
    Ok,
    Mixed,
    Aborted,
}

/// Outcome for one recipient or share.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "$")]
pub enum ItemReport {
    #[serde(rename = "api:status-report")]
    Success {
        #[serde(skip_serializing_if = "Option::is_none")]
        permission: Option<String>,
    },
    #[serde(rename = "api:error")]
    Error { code: String, message: String },
}

impl ItemReport {
    fn error(code: &str, message: impl Into<String>) -> Self {
        ItemReport::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ItemReport::Error { .. })
    }
}

/// Per-item results, index-aligned with the request's lists.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShareReport {
    pub status: ShareStatus,
    pub recipients: Vec<Option<ItemReport>>,
    pub shares: Vec<Option<ItemReport>>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub dry_run: bool,
}

impl ShareReport {
    fn new(recipients: usize, shares: usize) -> Self {
        Self {
            status: ShareStatus::Ok,
            recipients: vec![None; recipients],
            shares: vec![None; shares],
            dry_run: false,
        }
    }

    fn has_errors(&self) -> bool {
        self.recipients
            .iter()
            .chain(self.shares.iter())
            .flatten()
            .any(ItemReport::is_error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecipientKind {
    Username,
    Email,
}

#[derive(Debug, Clone)]
struct RecipientItem {
    i: usize,
    value: Value,
    kind: Option<RecipientKind>,
    user: Option<UserRecord>,
    invalid: bool,
}

impl WorkItem for RecipientItem {
    fn is_invalid(&self) -> bool {
        self.invalid
    }
}

#[derive(Debug, Clone)]
struct ShareItem {
    i: usize,
    value: Value,
    path: Option<String>,
    access: String,
    permission: Option<String>,
    invalid: bool,
}

impl WorkItem for ShareItem {
    fn is_invalid(&self) -> bool {
        self.invalid
    }
}

fn is_username(value: &str) -> bool {
    !value.is_empty() && value.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn is_email(value: &str) -> bool {
    let Some((local, domain)) = value.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && domain.split('.').count() >= 2
        && domain.split('.').all(|part| !part.is_empty())
        && !value.chars().any(char::is_whitespace)
}

// ----------------------------------------------------------------
// Request validation
// ----------------------------------------------------------------

fn validate_mode<'a>(a: &'a mut St) -> StepFuture<'a, ShareReport> {
    Box::pin(async move {
        let strict = match a.require::<ShareRequest>("request")?.mode.as_deref() {
            Some("strict") => true,
            None | Some("best-effort") => false,
            Some(other) => {
                return Err(CoreError::InvalidInput(format!(
                    "mode: expected `strict`, `best-effort` or nothing, got {}",
                    other
                )));
            }
        };
        a.set("strict", strict);
        Ok(None)
    })
}

fn validate_recipients<'a>(a: &'a mut St) -> StepFuture<'a, ShareReport> {
    Box::pin(async move {
        let recipients = match &a.require::<ShareRequest>("request")?.recipients {
            Value::String(s) => vec![Value::String(s.clone())],
            Value::Array(items) => items.clone(),
            other => {
                return Err(CoreError::InvalidInput(format!(
                    "recipients: expected array or string, got {}",
                    json_type(other)
                )));
            }
        };
        if recipients.is_empty() {
            return Err(CoreError::InvalidInput(
                "recipients: expected at least one".to_string(),
            ));
        }
        a.set("req_recipients", recipients);
        Ok(None)
    })
}

fn validate_shares<'a>(a: &'a mut St) -> StepFuture<'a, ShareReport> {
    Box::pin(async move {
        let shares = match &a.require::<ShareRequest>("request")?.shares {
            Value::Array(items) => items.clone(),
            Value::Null => Vec::new(),
            other => vec![other.clone()],
        };
        if shares.is_empty() {
            return Err(CoreError::InvalidInput("shares: expected at least one".to_string()));
        }
        a.set("req_shares", shares);
        Ok(None)
    })
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn initialize_worklists<'a>(a: &'a mut St) -> StepFuture<'a, ShareReport> {
    Box::pin(async move {
        let req_recipients = a.require::<Vec<Value>>("req_recipients")?.clone();
        let req_shares = a.require::<Vec<Value>>("req_shares")?.clone();

        let mut recipients = WorkList::new();
        for (i, value) in req_recipients.into_iter().enumerate() {
            recipients.push(RecipientItem {
                i,
                value,
                kind: None,
                user: None,
                invalid: false,
            })?;
        }
        let mut shares = WorkList::new();
        for (i, value) in req_shares.into_iter().enumerate() {
            shares.push(ShareItem {
                i,
                value,
                path: None,
                access: "read".to_string(),
                permission: None,
                invalid: false,
            })?;
        }
        recipients.lockin();
        shares.lockin();

        a.set("report", ShareReport::new(recipients.len(), shares.len()));
        a.set("recipients_work", recipients);
        a.set("shares_work", shares);
        Ok(None)
    })
}

/// Takes the work list and report out of the scope for editing. Invalid
/// items left by the previous step are dropped first.
fn take_recipients(a: &St) -> CoreResult<(WorkList<RecipientItem>, ShareReport)> {
    let mut work = a.require::<WorkList<RecipientItem>>("recipients_work")?.clone();
    work.clear_invalid();
    Ok((work, a.require::<ShareReport>("report")?.clone()))
}

fn take_shares(a: &St) -> CoreResult<(WorkList<ShareItem>, ShareReport)> {
    let mut work = a.require::<WorkList<ShareItem>>("shares_work")?.clone();
    work.clear_invalid();
    Ok((work, a.require::<ShareReport>("report")?.clone()))
}

// ----------------------------------------------------------------
// Recipients
// ----------------------------------------------------------------

fn classify_recipients<'a>(a: &'a mut St) -> StepFuture<'a, ShareReport> {
    Box::pin(async move {
        let (mut work, mut report) = take_recipients(a)?;
        for item in work.iter_mut() {
            let kind = match item.value.as_str() {
                Some(v) if is_username(v) => Some(RecipientKind::Username),
                Some(v) if is_email(v) => Some(RecipientKind::Email),
                _ => None,
            };
            match kind {
                Some(kind) => item.kind = Some(kind),
                None => {
                    item.invalid = true;
                    report.recipients[item.i] = Some(ItemReport::error(
                        "invalid_username_or_email",
                        format!("{} is not a username or email", item.value),
                    ));
                }
            }
        }
        a.set("recipients_work", work);
        a.set("report", report);
        Ok(None)
    })
}

fn resolve_email_recipients<'a>(a: &'a mut St) -> StepFuture<'a, ShareReport> {
    Box::pin(async move {
        let (mut work, mut report) = take_recipients(a)?;
        let host = Arc::clone(a.host());
        for item in work.iter_mut() {
            if item.kind != Some(RecipientKind::Email) {
                continue;
            }
            let email = item.value.as_str().unwrap_or_default().to_string();
            match host.permissions.directory().user_by_email(&email).await? {
                Some(user) => {
                    item.kind = Some(RecipientKind::Username);
                    item.value = Value::String(user.username.clone());
                }
                None => {
                    item.invalid = true;
                    report.recipients[item.i] = Some(ItemReport::error(
                        "user_does_not_exist",
                        format!("no user has the email {}", email),
                    ));
                }
            }
        }
        a.set("recipients_work", work);
        a.set("report", report);
        Ok(None)
    })
}

fn resolve_username_recipients<'a>(a: &'a mut St) -> StepFuture<'a, ShareReport> {
    Box::pin(async move {
        let (mut work, mut report) = take_recipients(a)?;
        let host = Arc::clone(a.host());
        for item in work.iter_mut() {
            let username = item.value.as_str().unwrap_or_default().to_string();
            match host.permissions.directory().user_by_username(&username).await? {
                Some(user) => item.user = Some(user),
                None => {
                    item.invalid = true;
                    report.recipients[item.i] = Some(ItemReport::error(
                        "user_does_not_exist",
                        format!("user {} does not exist", username),
                    ));
                }
            }
        }
        work.clear_invalid();
        a.set("recipients_work", work);
        a.set("report", report);
        Ok(None)
    })
}

// ----------------------------------------------------------------
// Shares
// ----------------------------------------------------------------

fn validate_share_types<'a>(a: &'a mut St) -> StepFuture<'a, ShareReport> {
    Box::pin(async move {
        let (mut work, mut report) = take_shares(a)?;
        for item in work.iter_mut() {
            let tag = item.value.get("$").and_then(Value::as_str);
            let error = match tag {
                None => Some(ItemReport::error(
                    "format_error",
                    "share must be an object with a `$` type tag",
                )),
                Some("fs-share") => None,
                Some(other) => Some(ItemReport::error(
                    "disallowed_thing",
                    format!("{} is not accepted; expected fs-share", other),
                )),
            };
            if let Some(error) = error {
                item.invalid = true;
                report.shares[item.i] = Some(error);
            }
        }
        a.set("shares_work", work);
        a.set("report", report);
        Ok(None)
    })
}

fn create_file_share_intents<'a>(a: &'a mut St) -> StepFuture<'a, ShareReport> {
    Box::pin(async move {
        let (mut work, mut report) = take_shares(a)?;
        for item in work.iter_mut() {
            let mut errors = Vec::new();
            let path = item.value.get("path").and_then(Value::as_str);
            if path.is_none() {
                errors.push("`path` is required");
            }
            match item.value.get("access").and_then(Value::as_str) {
                None => {}
                Some(access @ ("read" | "write")) => item.access = access.to_string(),
                Some(_) => errors.push("`access` should be `read` or `write`"),
            }

            if !errors.is_empty() {
                item.invalid = true;
                report.shares[item.i] = Some(ItemReport::error(
                    "field_errors",
                    format!("shares[{}]: {}", item.i, errors.join("; ")),
                ));
                continue;
            }
            item.path = path.map(str::to_string);
        }
        a.set("shares_work", work);
        a.set("report", report);
        Ok(None)
    })
}

fn fetch_nodes_for_file_shares<'a>(a: &'a mut St) -> StepFuture<'a, ShareReport> {
    Box::pin(async move {
        let (mut work, mut report) = take_shares(a)?;
        let host = Arc::clone(a.host());
        for item in work.iter_mut() {
            let path = item.path.clone().unwrap_or_default();
            let node = match Selector::path(&path) {
                Ok(selector) => host.mounts.stat(&selector, &StatOptions::default()).await?,
                Err(_) => None,
            };
            let Some(node) = node else {
                item.invalid = true;
                report.shares[item.i] = Some(ItemReport::error(
                    "subject_does_not_exist",
                    format!("{} does not exist", path),
                ));
                continue;
            };
            item.permission = Some(format!("fs:{}:{}", node.uid, item.access));
        }
        work.clear_invalid();
        for item in work.iter() {
            report.shares[item.i] = Some(ItemReport::Success {
                permission: item.permission.clone(),
            });
        }
        a.set("shares_work", work);
        a.set("report", report);
        Ok(None)
    })
}

// ----------------------------------------------------------------
// Outcome
// ----------------------------------------------------------------

fn is_strict<'a>(a: &'a St) -> futures::future::BoxFuture<'a, CoreResult<bool>> {
    Box::pin(async move { Ok(*a.require::<bool>("strict")?) })
}

fn is_dry_run<'a>(a: &'a St) -> futures::future::BoxFuture<'a, CoreResult<bool>> {
    Box::pin(async move { Ok(a.require::<ShareRequest>("request")?.dry_run) })
}

fn abort_on_error<'a>(a: &'a mut St) -> StepFuture<'a, ShareReport> {
    Box::pin(async move {
        let mut report = a.require::<ShareReport>("report")?.clone();
        if !report.has_errors() {
            return Ok(None);
        }
        report.status = ShareStatus::Aborted;
        tracing::info!("share aborted in strict mode");
        Ok(a.stop(report))
    })
}

fn early_return_on_dry_run<'a>(a: &'a mut St) -> StepFuture<'a, ShareReport> {
    Box::pin(async move {
        let (work, mut report) = take_recipients(a)?;
        for item in work.iter() {
            report.recipients[item.i] = Some(ItemReport::Success { permission: None });
        }
        report.dry_run = true;
        report.status = final_status(&report);
        Ok(a.stop(report))
    })
}

fn grant_permissions<'a>(a: &'a mut St) -> StepFuture<'a, ShareReport> {
    Box::pin(async move {
        let (recipients, mut report) = take_recipients(a)?;
        let (shares, _) = take_shares(a)?;
        let actor = a.require::<Actor>("actor")?.clone();
        let host = Arc::clone(a.host());

        for recipient in recipients.iter() {
            let Some(user) = &recipient.user else {
                continue;
            };
            let holder = Actor::user(user.clone());
            let mut outcome = ItemReport::Success { permission: None };

            for share in shares.iter() {
                let Some(permission) = &share.permission else {
                    continue;
                };
                // Only grant when the recipient does not already hold it.
                if host.permissions.has(&holder, permission).await? {
                    continue;
                }
                if let Err(err) = host
                    .permissions
                    .grant_user_user_permission(&actor, &user.username, permission, json!({}), Some("shared"))
                    .await
                {
                    if !err.is_api_error() {
                        return Err(err);
                    }
                    outcome = ItemReport::error(err.code(), err.to_string());
                }
            }
            report.recipients[recipient.i] = Some(outcome);
        }

        report.status = final_status(&report);
        Ok(a.stop(report))
    })
}

fn final_status(report: &ShareReport) -> ShareStatus {
    if report.has_errors() {
        ShareStatus::Mixed
    } else {
        ShareStatus::Ok
    }
}

/// Runs share requests on behalf of users.
pub struct ShareService {
    permissions: Arc<PermissionService>,
    mounts: Arc<MountTable>,
    sequence: Sequence<ShareService, ShareReport>,
}

impl ShareService {
    pub fn new(permissions: Arc<PermissionService>, mounts: Arc<MountTable>) -> Arc<Self> {
        let sequence = Sequence::new(
            "share",
            vec![
                Step::new("validate_mode", validate_mode),
                Step::new("validate_recipients", validate_recipients),
                Step::new("validate_shares", validate_shares),
                Step::new("initialize_worklists", initialize_worklists),
                Step::new("classify_recipients", classify_recipients),
                Step::new("resolve_email_recipients", resolve_email_recipients),
                Step::new("resolve_username_recipients", resolve_username_recipients),
                Step::new("validate_share_types", validate_share_types),
                Step::new("create_file_share_intents", create_file_share_intents),
                Step::new("fetch_nodes_for_file_shares", fetch_nodes_for_file_shares),
                Step::new("abort_on_error", abort_on_error).when(is_strict),
                Step::new("early_return_on_dry_run", early_return_on_dry_run).when(is_dry_run),
                Step::new("grant_permissions", grant_permissions),
            ],
        );
        Arc::new(Self {
            permissions,
            mounts,
            sequence,
        })
    }

    /// Share on behalf of `actor`, which must be a user.
    ///
    /// Malformed requests (bad mode, no recipients, no shares) fail with
    /// `invalid_input`; problems with individual items are reported in the
    /// returned [`ShareReport`].
    #[tracing::instrument(level = "debug", skip(self, actor, request), fields(actor = %actor.uid()))]
    pub async fn share(self: &Arc<Self>, actor: &Actor, request: ShareRequest) -> CoreResult<ShareReport> {
        if actor.as_user().is_none() {
            return Err(CoreError::PermissionDenied(
                "only users can share files".to_string(),
            ));
        }
        self.sequence
            .call_with(
                Arc::clone(self),
                [
                    ("actor", scope_value(actor.clone())),
                    ("request", scope_value(request)),
                ],
            )
            .await?
            .ok_or_else(|| CoreError::Internal("share sequence produced no report".to_string()))
    }
}
