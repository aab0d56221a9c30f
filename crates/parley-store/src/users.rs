use rusqlite::{params, ErrorCode};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{Identity, IdentityId, NewUser};

const IDENTITY_COLUMNS: &str = "id, username, name, avatar, about";

impl Database {
    pub fn insert_user(&self, user: &NewUser) -> Result<()> {
        let identity = &user.identity;
        self.conn()
            .execute(
                "INSERT INTO users (id, username, name, avatar, about, password_hash, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    identity.id.as_str(),
                    identity.username,
                    identity.name,
                    identity.avatar,
                    identity.about,
                    user.password_hash,
                    user.created_at.to_rfc3339(),
                ],
            )
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(err, _)
                    if err.code == ErrorCode::ConstraintViolation =>
                {
                    StoreError::UsernameTaken(identity.username.clone())
                }
                other => StoreError::Sqlite(other),
            })?;
        Ok(())
    }

    pub fn get_user(&self, id: &IdentityId) -> Result<Identity> {
        self.conn()
            .query_row(
                &format!("SELECT {IDENTITY_COLUMNS} FROM users WHERE id = ?1"),
                params![id.as_str()],
                row_to_identity,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// Every identity except `excluding`, ordered by display name.
    pub fn list_users_except(&self, excluding: &IdentityId) -> Result<Vec<Identity>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {IDENTITY_COLUMNS} FROM users WHERE id != ?1 ORDER BY name, id"
        ))?;

        let rows = stmt.query_map(params![excluding.as_str()], row_to_identity)?;

        let mut users = Vec::new();
        for row in rows {
            users.push(row?);
        }
        Ok(users)
    }
}

fn row_to_identity(row: &rusqlite::Row<'_>) -> rusqlite::Result<Identity> {
    let id: String = row.get(0)?;
    Ok(Identity {
        id: IdentityId(id),
        username: row.get(1)?,
        name: row.get(2)?,
        avatar: row.get(3)?,
        about: row.get(4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(id: &str, name: &str) -> Identity {
        Identity {
            id: IdentityId::from(id),
            username: id.to_string(),
            name: name.to_string(),
            avatar: None,
            about: Some("hey there".into()),
        }
    }

    #[test]
    fn insert_and_get_user() {
        let db = Database::open_in_memory().unwrap();
        let alice = identity("alice", "Alice");
        db.insert_user(&NewUser::new(alice.clone(), "hash")).unwrap();

        assert_eq!(db.get_user(&alice.id).unwrap(), alice);
        assert!(matches!(
            db.get_user(&IdentityId::from("nobody")),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn duplicate_username_is_rejected() {
        let db = Database::open_in_memory().unwrap();
        db.insert_user(&NewUser::new(identity("alice", "Alice"), "hash"))
            .unwrap();

        let mut clash = identity("alice2", "Other Alice");
        clash.username = "alice".into();
        assert!(matches!(
            db.insert_user(&NewUser::new(clash, "hash")),
            Err(StoreError::UsernameTaken(name)) if name == "alice"
        ));
    }

    #[test]
    fn list_excludes_caller() {
        let db = Database::open_in_memory().unwrap();
        for (id, name) in [("alice", "Alice"), ("bob", "Bob"), ("carol", "Carol")] {
            db.insert_user(&NewUser::new(identity(id, name), "hash"))
                .unwrap();
        }

        let others = db.list_users_except(&IdentityId::from("bob")).unwrap();
        let names: Vec<_> = others.iter().map(|u| u.name.as_str()).collect();
        assert_eq!(names, vec!["Alice", "Carol"]);
    }
}
