//! Principal lookups: users, apps and groups.

use std::sync::Arc;

use serde_json::{Value, json};
use uuid::Uuid;

use cumulus_types::{AppRecord, CoreError, CoreResult, GroupId, UserId, UserRecord};

use super::{Database, Row, row_i64, row_str};

/// How a caller names an app.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppLookup {
    Uid(String),
    Name(String),
    /// Try as a uid first, then as a name.
    UidOrName(String),
}

/// Reads and creates principals in a [`Database`].
#[derive(Clone)]
pub struct Directory {
    db: Arc<dyn Database>,
}

impl Directory {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &Arc<dyn Database> {
        &self.db
    }

    async fn one_user(&self, column: &str, value: Value) -> CoreResult<Option<UserRecord>> {
        let sql = format!("SELECT id, uuid, username FROM user WHERE {} = ? LIMIT 1", column);
        let rows = self.db.read(&sql, &[value]).await?;
        rows.first().map(user_from_row).transpose()
    }

    pub async fn user_by_id(&self, id: UserId) -> CoreResult<Option<UserRecord>> {
        self.one_user("id", json!(id)).await
    }

    pub async fn user_by_username(&self, username: &str) -> CoreResult<Option<UserRecord>> {
        self.one_user("username", json!(username)).await
    }

    pub async fn user_by_email(&self, email: &str) -> CoreResult<Option<UserRecord>> {
        self.one_user("email", json!(email)).await
    }

    /// Like [`user_by_username`](Self::user_by_username), but absence is an error.
    pub async fn require_user(&self, username: &str) -> CoreResult<UserRecord> {
        self.user_by_username(username)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("user {}", username)))
    }

    pub async fn create_user(&self, username: &str, email: Option<&str>) -> CoreResult<UserRecord> {
        let uuid = Uuid::new_v4();
        self.db
            .write(
                "INSERT INTO user (uuid, username, email) VALUES (?, ?, ?)",
                &[json!(uuid.to_string()), json!(username), json!(email)],
            )
            .await?;
        self.require_user(username).await
    }

    pub async fn app(&self, lookup: &AppLookup) -> CoreResult<Option<AppRecord>> {
        match lookup {
            AppLookup::Uid(uid) => self.one_app("uid", uid).await,
            AppLookup::Name(name) => self.one_app("name", name).await,
            AppLookup::UidOrName(s) => match self.one_app("uid", s).await? {
                Some(app) => Ok(Some(app)),
                None => self.one_app("name", s).await,
            },
        }
    }

    async fn one_app(&self, column: &str, value: &str) -> CoreResult<Option<AppRecord>> {
        let sql = format!("SELECT id, uid, name FROM app WHERE {} = ? LIMIT 1", column);
        let rows = self.db.read(&sql, &[json!(value)]).await?;
        rows.first().map(app_from_row).transpose()
    }

    pub async fn require_app(&self, lookup: &AppLookup) -> CoreResult<AppRecord> {
        self.app(lookup)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("app {:?}", lookup)))
    }

    pub async fn create_app(&self, name: &str, owner: Option<UserId>) -> CoreResult<AppRecord> {
        let uid = format!("app-{}", Uuid::new_v4());
        self.db
            .write(
                "INSERT INTO app (uid, name, owner_user_id) VALUES (?, ?, ?)",
                &[json!(uid), json!(name), json!(owner)],
            )
            .await?;
        self.require_app(&AppLookup::Uid(uid)).await
    }

    /// Database id of the group with this uid.
    pub async fn group_id(&self, uid: &str) -> CoreResult<Option<GroupId>> {
        let rows = self
            .db
            .read("SELECT id FROM \"group\" WHERE uid = ? LIMIT 1", &[json!(uid)])
            .await?;
        rows.first().map(|row| row_i64(row, "id")).transpose()
    }

    pub async fn require_group(&self, uid: &str) -> CoreResult<GroupId> {
        self.group_id(uid)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("group {}", uid)))
    }

    /// Create a group and return its (uid, id).
    pub async fn create_group(&self, owner: Option<UserId>) -> CoreResult<(String, GroupId)> {
        let uid = Uuid::new_v4().to_string();
        self.db
            .write(
                "INSERT INTO \"group\" (uid, owner_user_id) VALUES (?, ?)",
                &[json!(uid), json!(owner)],
            )
            .await?;
        let id = self.require_group(&uid).await?;
        Ok((uid, id))
    }

    pub async fn add_member(&self, group: GroupId, user: UserId) -> CoreResult<()> {
        self.db
            .write(
                "INSERT OR IGNORE INTO jct_user_group (user_id, group_id) VALUES (?, ?)",
                &[json!(user), json!(group)],
            )
            .await?;
        Ok(())
    }

    /// Every stored group `user` belongs to, as (uid, id).
    pub async fn groups_of(&self, user: UserId) -> CoreResult<Vec<(String, GroupId)>> {
        let rows = self
            .db
            .read(
                "SELECT g.uid, g.id FROM \"group\" g \
                 JOIN jct_user_group ug ON ug.group_id = g.id \
                 WHERE ug.user_id = ? ORDER BY g.id",
                &[json!(user)],
            )
            .await?;
        rows.iter()
            .map(|row| Ok((row_str(row, "uid")?.to_string(), row_i64(row, "id")?)))
            .collect()
    }

    pub async fn remove_member(&self, group: GroupId, user: UserId) -> CoreResult<()> {
        self.db
            .write(
                "DELETE FROM jct_user_group WHERE user_id = ? AND group_id = ?",
                &[json!(user), json!(group)],
            )
            .await?;
        Ok(())
    }
}

fn user_from_row(row: &Row) -> CoreResult<UserRecord> {
    let uuid = row_str(row, "uuid")?;
    Ok(UserRecord {
        id: row_i64(row, "id")?,
        uuid: Uuid::parse_str(uuid)
            .map_err(|e| CoreError::Internal(format!("bad user uuid {}: {}", uuid, e)))?,
        username: row_str(row, "username")?.to_string(),
    })
}

fn app_from_row(row: &Row) -> CoreResult<AppRecord> {
    Ok(AppRecord {
        id: row_i64(row, "id")?,
        uid: row_str(row, "uid")?.to_string(),
        name: row_str(row, "name")?.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteDatabase;

    fn directory() -> Directory {
        Directory::new(Arc::new(SqliteDatabase::in_memory().unwrap()))
    }

    #[tokio::test]
    async fn users_round_trip_through_lookups() {
        let dir = directory();
        let alice = dir.create_user("alice", Some("alice@example.com")).await.unwrap();
        assert_eq!(dir.user_by_id(alice.id).await.unwrap(), Some(alice.clone()));
        assert_eq!(dir.user_by_email("alice@example.com").await.unwrap(), Some(alice));
        assert!(dir.user_by_username("nobody").await.unwrap().is_none());
        assert_eq!(dir.require_user("nobody").await.unwrap_err().code(), "not_found");
    }

    #[tokio::test]
    async fn apps_resolve_by_uid_or_name() {
        let dir = directory();
        let app = dir.create_app("editor", None).await.unwrap();
        let by_name = dir.app(&AppLookup::UidOrName("editor".into())).await.unwrap();
        let by_uid = dir.app(&AppLookup::UidOrName(app.uid.clone())).await.unwrap();
        assert_eq!(by_name, Some(app.clone()));
        assert_eq!(by_uid, Some(app));
    }

    #[tokio::test]
    async fn groups_and_membership() {
        let dir = directory();
        let bob = dir.create_user("bob", None).await.unwrap();
        let (uid, id) = dir.create_group(Some(bob.id)).await.unwrap();
        assert_eq!(dir.group_id(&uid).await.unwrap(), Some(id));
        dir.add_member(id, bob.id).await.unwrap();
        dir.add_member(id, bob.id).await.unwrap();
        let rows = dir
            .db()
            .read("SELECT user_id FROM jct_user_group", &[])
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(dir.groups_of(bob.id).await.unwrap(), vec![(uid, id)]);

        dir.remove_member(id, bob.id).await.unwrap();
        assert!(dir.groups_of(bob.id).await.unwrap().is_empty());
    }
}
