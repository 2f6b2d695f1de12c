//! Users, friendships and group membership.
//!
//! These gate delivery: private messages require an accepted friendship,
//! and group fan-out expands to the current member list.

use chrono::Utc;
use parley_shared::{Friendship, GroupId, UserId};
use rusqlite::params;
use uuid::Uuid;

use crate::database::{ts_from_sql, ts_to_sql, Database};
use crate::error::{Result, StoreError};
use crate::models::{Group, User};

impl Database {
    pub fn create_user(&self, user: &User) -> Result<()> {
        self.conn().execute(
            "INSERT INTO users (id, display_name, created_at) VALUES (?1, ?2, ?3)",
            params![
                user.id.as_str(),
                user.display_name,
                ts_to_sql(&user.created_at)
            ],
        )?;
        Ok(())
    }

    pub fn user_exists(&self, id: &UserId) -> Result<bool> {
        let exists: bool = self.conn().query_row(
            "SELECT EXISTS(SELECT 1 FROM users WHERE id = ?1)",
            params![id.as_str()],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    /// The identity key is immutable; only the display name can change.
    pub fn rename_user(&self, id: &UserId, display_name: &str) -> Result<bool> {
        let updated = self.conn().execute(
            "UPDATE users SET display_name = ?1 WHERE id = ?2",
            params![display_name, id.as_str()],
        )?;
        Ok(updated > 0)
    }

    pub fn get_user(&self, id: &UserId) -> Result<User> {
        self.conn()
            .query_row(
                "SELECT id, display_name, created_at FROM users WHERE id = ?1",
                params![id.as_str()],
                |row| {
                    let id: String = row.get(0)?;
                    let display_name: String = row.get(1)?;
                    let ts: String = row.get(2)?;
                    Ok((id, display_name, ts))
                },
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
            .and_then(|(id, display_name, ts)| {
                Ok(User {
                    id: UserId::new(id),
                    display_name,
                    created_at: ts_from_sql(&ts)
                        .map_err(|e| StoreError::Corrupt(e.to_string()))?,
                })
            })
    }

    // -----------------------------------------------------------------
    // Friendships
    // -----------------------------------------------------------------

    /// Record a friend request. Repeating an existing request is a no-op.
    pub fn add_friend_request(&self, requester: &UserId, addressee: &UserId) -> Result<()> {
        self.conn().execute(
            "INSERT OR IGNORE INTO friendships (requester, addressee, accepted, created_at)
             VALUES (?1, ?2, 0, ?3)",
            params![
                requester.as_str(),
                addressee.as_str(),
                ts_to_sql(&Utc::now())
            ],
        )?;
        Ok(())
    }

    /// `addressee` accepts the pending request from `requester`.
    pub fn accept_friend(&self, requester: &UserId, addressee: &UserId) -> Result<bool> {
        let updated = self.conn().execute(
            "UPDATE friendships SET accepted = 1 WHERE requester = ?1 AND addressee = ?2",
            params![requester.as_str(), addressee.as_str()],
        )?;
        Ok(updated > 0)
    }

    /// Whether an accepted friendship exists in either direction.
    pub fn are_friends(&self, a: &UserId, b: &UserId) -> Result<bool> {
        let exists: bool = self.conn().query_row(
            "SELECT EXISTS(
                SELECT 1 FROM friendships
                 WHERE accepted = 1
                   AND ((requester = ?1 AND addressee = ?2)
                     OR (requester = ?2 AND addressee = ?1)))",
            params![a.as_str(), b.as_str()],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    /// All accepted friends of `user`.
    pub fn list_friends(&self, user: &UserId) -> Result<Vec<UserId>> {
        let mut stmt = self.conn().prepare(
            "SELECT CASE WHEN requester = ?1 THEN addressee ELSE requester END
               FROM friendships
              WHERE accepted = 1 AND (requester = ?1 OR addressee = ?1)",
        )?;
        let rows = stmt.query_map(params![user.as_str()], |row| {
            row.get::<_, String>(0).map(UserId::new)
        })?;

        let mut friends = Vec::new();
        for row in rows {
            friends.push(row?);
        }
        Ok(friends)
    }

    pub fn list_friendships(&self, user: &UserId) -> Result<Vec<Friendship>> {
        let mut stmt = self.conn().prepare(
            "SELECT requester, addressee, accepted, created_at
               FROM friendships
              WHERE requester = ?1 OR addressee = ?1",
        )?;
        let rows = stmt.query_map(params![user.as_str()], |row| {
            let requester: String = row.get(0)?;
            let addressee: String = row.get(1)?;
            let accepted: bool = row.get(2)?;
            let ts: String = row.get(3)?;
            Ok((requester, addressee, accepted, ts))
        })?;

        let mut friendships = Vec::new();
        for row in rows {
            let (requester, addressee, accepted, ts) = row?;
            friendships.push(Friendship {
                requester: UserId::new(requester),
                addressee: UserId::new(addressee),
                accepted,
                created_at: ts_from_sql(&ts).map_err(|e| StoreError::Corrupt(e.to_string()))?,
            });
        }
        Ok(friendships)
    }

    // -----------------------------------------------------------------
    // Groups
    // -----------------------------------------------------------------

    pub fn create_group(&self, group: &Group) -> Result<()> {
        self.conn().execute(
            "INSERT INTO groups (id, name, created_at) VALUES (?1, ?2, ?3)",
            params![
                group.id.to_string(),
                group.name,
                ts_to_sql(&group.created_at)
            ],
        )?;
        Ok(())
    }

    pub fn group_exists(&self, id: GroupId) -> Result<bool> {
        let exists: bool = self.conn().query_row(
            "SELECT EXISTS(SELECT 1 FROM groups WHERE id = ?1)",
            params![id.to_string()],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    /// Joining twice is a no-op.
    pub fn add_group_member(&self, group: GroupId, member: &UserId) -> Result<()> {
        self.conn().execute(
            "INSERT OR IGNORE INTO group_members (group_id, member_id) VALUES (?1, ?2)",
            params![group.to_string(), member.as_str()],
        )?;
        Ok(())
    }

    pub fn is_group_member(&self, group: GroupId, member: &UserId) -> Result<bool> {
        let exists: bool = self.conn().query_row(
            "SELECT EXISTS(SELECT 1 FROM group_members WHERE group_id = ?1 AND member_id = ?2)",
            params![group.to_string(), member.as_str()],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    pub fn list_group_members(&self, group: GroupId) -> Result<Vec<UserId>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT member_id FROM group_members WHERE group_id = ?1 ORDER BY member_id")?;
        let rows = stmt.query_map(params![group.to_string()], |row| {
            row.get::<_, String>(0).map(UserId::new)
        })?;

        let mut members = Vec::new();
        for row in rows {
            members.push(row?);
        }
        Ok(members)
    }

    pub fn get_group(&self, id: GroupId) -> Result<Group> {
        self.conn()
            .query_row(
                "SELECT id, name, created_at FROM groups WHERE id = ?1",
                params![id.to_string()],
                |row| {
                    let id: String = row.get(0)?;
                    let name: String = row.get(1)?;
                    let ts: String = row.get(2)?;
                    Ok((id, name, ts))
                },
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
            .and_then(|(id, name, ts)| {
                let id = Uuid::parse_str(&id).map_err(|e| StoreError::Corrupt(e.to_string()))?;
                Ok(Group {
                    id: GroupId(id),
                    name,
                    created_at: ts_from_sql(&ts)
                        .map_err(|e| StoreError::Corrupt(e.to_string()))?,
                })
            })
    }
}
