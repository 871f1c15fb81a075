use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};

use super::{UID_RETRIES, format_datetime, is_constraint_violation, parse_datetime, random_uid};
use crate::error::{Error, Result};
use crate::types::{Group, User};

fn user_from_row(row: &rusqlite::Row) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        is_admin: row.get(2)?,
        ctime: parse_datetime(&row.get::<_, String>(3)?),
    })
}

/// Word characters and dashes, 3 to 40 long. Keeps usernames safe to
/// embed in paths and URLs without escaping.
fn validate_username(username: &str) -> Result<()> {
    let valid_chars = username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !valid_chars || !(3..=40).contains(&username.len()) {
        return Err(Error::BadRequest(format!(
            "invalid username: {username}"
        )));
    }
    Ok(())
}

pub fn create(conn: &Connection, username: &str, is_admin: bool) -> Result<i64> {
    validate_username(username)?;
    let ctime = format_datetime(&Utc::now());
    for _ in 0..UID_RETRIES {
        let user_id = random_uid();
        let result = conn.execute(
            "INSERT INTO users (user_id, username, is_admin, ctime) VALUES (?1, ?2, ?3, ?4)",
            params![user_id, username, is_admin, ctime],
        );
        match result {
            Ok(_) => return Ok(user_id),
            Err(e) if is_constraint_violation(&e, "users.username") => {
                return Err(Error::Conflict(format!("username {username} is taken")));
            }
            Err(e) if is_constraint_violation(&e, "users.user_id") => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(Error::Internal(
        "failed to allocate a user id after repeated collisions".to_string(),
    ))
}

pub fn get(conn: &Connection, user_id: i64) -> Result<User> {
    conn.query_row(
        "SELECT user_id, username, is_admin, ctime FROM users WHERE user_id = ?1",
        params![user_id],
        user_from_row,
    )
    .optional()?
    .ok_or(Error::NotFound)
}

pub fn get_by_username(conn: &Connection, username: &str) -> Result<User> {
    conn.query_row(
        "SELECT user_id, username, is_admin, ctime FROM users WHERE username = ?1",
        params![username],
        user_from_row,
    )
    .optional()?
    .ok_or(Error::NotFound)
}

pub fn list(conn: &Connection) -> Result<Vec<User>> {
    let mut stmt = conn
        .prepare("SELECT user_id, username, is_admin, ctime FROM users ORDER BY username")?;
    let users = stmt
        .query_map([], user_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(users)
}

/// Deletes the account. Scenes and versions they authored survive with
/// their author reference cleared; their explicit grants cascade away.
pub fn remove(conn: &Connection, user_id: i64) -> Result<()> {
    let changed = conn.execute("DELETE FROM users WHERE user_id = ?1", params![user_id])?;
    if changed == 0 {
        return Err(Error::NotFound);
    }
    Ok(())
}

pub fn set_admin(conn: &Connection, user_id: i64, is_admin: bool) -> Result<()> {
    let changed = conn.execute(
        "UPDATE users SET is_admin = ?1 WHERE user_id = ?2",
        params![is_admin, user_id],
    )?;
    if changed == 0 {
        return Err(Error::NotFound);
    }
    Ok(())
}

pub fn create_group(conn: &Connection, name: &str) -> Result<i64> {
    if name.is_empty() {
        return Err(Error::BadRequest("group name must not be empty".to_string()));
    }
    let result = conn.execute(
        "INSERT INTO groups (group_name) VALUES (?1)",
        params![name],
    );
    match result {
        Ok(_) => Ok(conn.last_insert_rowid()),
        Err(e) if is_constraint_violation(&e, "groups.group_name") => {
            Err(Error::Conflict(format!("a group named {name} already exists")))
        }
        Err(e) => Err(e.into()),
    }
}

pub fn remove_group(conn: &Connection, group_id: i64) -> Result<()> {
    let changed = conn.execute("DELETE FROM groups WHERE group_id = ?1", params![group_id])?;
    if changed == 0 {
        return Err(Error::NotFound);
    }
    Ok(())
}

pub fn list_groups(conn: &Connection) -> Result<Vec<Group>> {
    let mut stmt = conn.prepare("SELECT group_id, group_name FROM groups ORDER BY group_name")?;
    let groups = stmt
        .query_map([], |row| {
            Ok(Group {
                id: row.get(0)?,
                name: row.get(1)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(groups)
}

/// Adding twice is a no-op, not an error.
pub fn add_member(conn: &Connection, group_id: i64, user_id: i64) -> Result<()> {
    let result = conn.execute(
        "INSERT OR IGNORE INTO groups_membership (fk_group_id, fk_user_id) VALUES (?1, ?2)",
        params![group_id, user_id],
    );
    match result {
        Ok(_) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(err, _))
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Err(Error::NotFound)
        }
        Err(e) => Err(e.into()),
    }
}

pub fn remove_member(conn: &Connection, group_id: i64, user_id: i64) -> Result<()> {
    let changed = conn.execute(
        "DELETE FROM groups_membership WHERE fk_group_id = ?1 AND fk_user_id = ?2",
        params![group_id, user_id],
    )?;
    if changed == 0 {
        return Err(Error::NotFound);
    }
    Ok(())
}

pub fn group_members(conn: &Connection, group_id: i64) -> Result<Vec<User>> {
    let mut stmt = conn.prepare(
        "SELECT users.user_id, users.username, users.is_admin, users.ctime
         FROM groups_membership
         JOIN users ON users.user_id = groups_membership.fk_user_id
         WHERE groups_membership.fk_group_id = ?1
         ORDER BY users.username",
    )?;
    let members = stmt
        .query_map(params![group_id], user_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(members)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_conn;

    #[test]
    fn test_username_rules() {
        let conn = test_conn();
        create(&conn, "alice_01", false).unwrap();
        create(&conn, "bob-smith", false).unwrap();

        for bad in ["ab", "has space", "semi;colon", &"x".repeat(41)] {
            assert!(
                matches!(create(&conn, bad, false), Err(Error::BadRequest(_))),
                "accepted {bad:?}"
            );
        }
    }

    #[test]
    fn test_duplicate_username_is_conflict() {
        let conn = test_conn();
        create(&conn, "alice", false).unwrap();
        assert!(matches!(
            create(&conn, "alice", false),
            Err(Error::Conflict(_))
        ));
    }

    #[test]
    fn test_lookup_roundtrip() {
        let conn = test_conn();
        let id = create(&conn, "alice", true).unwrap();
        let user = get(&conn, id).unwrap();
        assert_eq!(user.username, "alice");
        assert!(user.is_admin);
        assert_eq!(get_by_username(&conn, "alice").unwrap().id, id);
        assert!(matches!(get_by_username(&conn, "bob"), Err(Error::NotFound)));
    }

    #[test]
    fn test_remove_user_clears_memberships() {
        let conn = test_conn();
        let id = create(&conn, "alice", false).unwrap();
        let group_id = create_group(&conn, "team").unwrap();
        add_member(&conn, group_id, id).unwrap();

        remove(&conn, id).unwrap();
        assert!(group_members(&conn, group_id).unwrap().is_empty());
        assert!(matches!(remove(&conn, id), Err(Error::NotFound)));
    }

    #[test]
    fn test_membership_is_idempotent() {
        let conn = test_conn();
        let id = create(&conn, "alice", false).unwrap();
        let group_id = create_group(&conn, "team").unwrap();
        add_member(&conn, group_id, id).unwrap();
        add_member(&conn, group_id, id).unwrap();
        assert_eq!(group_members(&conn, group_id).unwrap().len(), 1);

        assert!(matches!(
            add_member(&conn, group_id, 999),
            Err(Error::NotFound)
        ));
    }

    #[test]
    fn test_set_admin() {
        let conn = test_conn();
        let id = create(&conn, "alice", false).unwrap();
        set_admin(&conn, id, true).unwrap();
        assert!(get(&conn, id).unwrap().is_admin);
        assert!(matches!(set_admin(&conn, 999, true), Err(Error::NotFound)));
    }
}
