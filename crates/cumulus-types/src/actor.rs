//! Actors: "who is asking".
//!
//! An [`Actor`] wraps exactly one of a user, an app running on behalf of a
//! user, or the distinguished system principal. Actors are built per request
//! and never mutated afterwards.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Database id of a user row.
pub type UserId = i64;
/// Database id of an app row.
pub type AppId = i64;
/// Database id of a group row.
pub type GroupId = i64;

/// A persisted user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: UserId,
    pub uuid: Uuid,
    pub username: String,
}

/// A persisted app.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AppRecord {
    pub id: AppId,
    pub uid: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserActor {
    pub user: UserRecord,
}

/// An app acting under a user's session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppActor {
    pub user: UserRecord,
    pub app: AppRecord,
}

/// The system principal. Carries the system user's record so that grants
/// issued by the system resolve like any other user's.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemActor {
    pub user: UserRecord,
}

/// Closed set of actor variants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ActorKind {
    User(UserActor),
    App(AppActor),
    System(SystemActor),
}

/// The authenticated principal an operation runs on behalf of.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    kind: ActorKind,
}

impl Actor {
    pub fn user(user: UserRecord) -> Self {
        Self {
            kind: ActorKind::User(UserActor { user }),
        }
    }

    pub fn app(user: UserRecord, app: AppRecord) -> Self {
        Self {
            kind: ActorKind::App(AppActor { user, app }),
        }
    }

    pub fn system(user: UserRecord) -> Self {
        Self {
            kind: ActorKind::System(SystemActor { user }),
        }
    }

    pub fn kind(&self) -> &ActorKind {
        &self.kind
    }

    /// The user record behind this actor. Every variant has one.
    pub fn user_record(&self) -> &UserRecord {
        match &self.kind {
            ActorKind::User(u) => &u.user,
            ActorKind::App(a) => &a.user,
            ActorKind::System(s) => &s.user,
        }
    }

    /// The user record, for actors that resolve grants as a plain user.
    ///
    /// Delegation tables are keyed by user id; the system actor never
    /// reaches them because it is granted everything up front.
    pub fn as_user(&self) -> Option<&UserRecord> {
        match &self.kind {
            ActorKind::User(u) => Some(&u.user),
            _ => None,
        }
    }

    pub fn as_app(&self) -> Option<&AppActor> {
        match &self.kind {
            ActorKind::App(a) => Some(a),
            _ => None,
        }
    }

    pub fn is_system(&self) -> bool {
        matches!(self.kind, ActorKind::System(_))
    }

    /// A plain user actor for the same user (the issuer behind an app).
    pub fn related_user_actor(&self) -> Actor {
        Actor::user(self.user_record().clone())
    }

    /// Stable textual id, used in logs and frame attributes.
    pub fn uid(&self) -> String {
        match &self.kind {
            ActorKind::User(u) => format!("user:{}", u.user.uuid),
            ActorKind::App(a) => format!("app-under-user:{}:{}", a.user.uuid, a.app.uid),
            ActorKind::System(_) => "system".to_string(),
        }
    }
}

impl std::fmt::Display for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ActorKind::User(u) => write!(f, "user {}", u.user.username),
            ActorKind::App(a) => write!(f, "app {} (user {})", a.app.name, a.user.username),
            ActorKind::System(_) => write!(f, "system"),
        }
    }
}
