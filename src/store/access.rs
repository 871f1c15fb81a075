use rusqlite::{Connection, OptionalExtension, params};

use crate::error::{Error, Result};
use crate::types::{AccessLevel, GrantEntry, Subject};

/// Resolves the access a requester effectively holds on a scene: the
/// maximum over their user entry, their group entries, the scene's
/// default level (authenticated users only) and its public level.
/// Global administrators always resolve to admin.
///
/// Fails NotFound when the scene does not exist, so callers cannot
/// distinguish "no scene" from "no access" by error shape alone.
pub fn effective_access(
    conn: &Connection,
    scene_id: i64,
    requester: Option<i64>,
) -> Result<AccessLevel> {
    let Some(user_id) = requester else {
        return conn
            .query_row(
                "SELECT public_access FROM scenes WHERE scene_id = ?1",
                params![scene_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or(Error::NotFound);
    };

    // Unknown user ids (e.g. a deleted account) fall back to the public
    // level, like anonymous requests.
    let is_known: Option<bool> = conn
        .query_row(
            "SELECT is_admin FROM users WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )
        .optional()?;
    match is_known {
        None => return effective_access(conn, scene_id, None),
        Some(true) => {
            // Scene existence still gates the result.
            let exists: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM scenes WHERE scene_id = ?1",
                    params![scene_id],
                    |row| row.get(0),
                )
                .optional()?;
            return exists.map(|_| AccessLevel::Admin).ok_or(Error::NotFound);
        }
        Some(false) => {}
    }

    conn.query_row(
        "SELECT MAX(level) FROM (
             SELECT public_access AS level FROM scenes WHERE scene_id = ?1
             UNION ALL
             SELECT default_access FROM scenes WHERE scene_id = ?1
             UNION ALL
             SELECT access_level FROM users_acl
             WHERE fk_scene_id = ?1 AND fk_user_id = ?2
             UNION ALL
             SELECT groups_acl.access_level FROM groups_acl
             JOIN groups_membership ON groups_membership.fk_group_id = groups_acl.fk_group_id
             WHERE groups_acl.fk_scene_id = ?1 AND groups_membership.fk_user_id = ?2
         )",
        params![scene_id, user_id],
        |row| row.get::<_, Option<AccessLevel>>(0),
    )?
    .ok_or(Error::NotFound)
}

/// Convenience gate: NotFound when the requester cannot see the scene,
/// Unauthorized when they can see it but hold less than `required`.
pub fn check(
    conn: &Connection,
    scene_id: i64,
    requester: Option<i64>,
    required: AccessLevel,
) -> Result<AccessLevel> {
    let held = effective_access(conn, scene_id, requester)?;
    if held == AccessLevel::None {
        return Err(Error::NotFound);
    }
    if held < required {
        return Err(Error::Unauthorized);
    }
    Ok(held)
}

/// Sets or clears one explicit entry. `Some(level)` upserts, including
/// `Some(None)` which records an explicit "no access" entry; `None`
/// removes the entry entirely.
pub fn grant(
    conn: &Connection,
    scene_id: i64,
    subject: Subject,
    level: Option<AccessLevel>,
) -> Result<()> {
    let (table, column, id) = match subject {
        Subject::User(id) => ("users_acl", "fk_user_id", id),
        Subject::Group(id) => ("groups_acl", "fk_group_id", id),
    };

    match level {
        Some(level) => {
            let result = conn.execute(
                &format!(
                    "INSERT INTO {table} ({column}, fk_scene_id, access_level)
                     VALUES (?1, ?2, ?3)
                     ON CONFLICT DO UPDATE SET access_level = excluded.access_level"
                ),
                params![id, scene_id, level],
            );
            match result {
                Ok(_) => Ok(()),
                // Unknown subject or unknown scene
                Err(rusqlite::Error::SqliteFailure(err, _))
                    if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    Err(Error::NotFound)
                }
                Err(e) => Err(e.into()),
            }
        }
        None => {
            let changed = conn.execute(
                &format!("DELETE FROM {table} WHERE {column} = ?1 AND fk_scene_id = ?2"),
                params![id, scene_id],
            )?;
            if changed == 0 {
                return Err(Error::NotFound);
            }
            Ok(())
        }
    }
}

/// Every explicit entry on a scene, users then groups, each with its
/// grantee's display name.
pub fn list_grants(conn: &Connection, scene_id: i64) -> Result<Vec<GrantEntry>> {
    let mut entries = Vec::new();

    let mut stmt = conn.prepare(
        "SELECT users.user_id, users.username, users_acl.access_level
         FROM users_acl JOIN users ON users.user_id = users_acl.fk_user_id
         WHERE users_acl.fk_scene_id = ?1
         ORDER BY users.username",
    )?;
    let users = stmt.query_map(params![scene_id], |row| {
        Ok(GrantEntry {
            subject: Subject::User(row.get(0)?),
            name: row.get(1)?,
            level: row.get(2)?,
        })
    })?;
    for entry in users {
        entries.push(entry?);
    }

    let mut stmt = conn.prepare(
        "SELECT groups.group_id, groups.group_name, groups_acl.access_level
         FROM groups_acl JOIN groups ON groups.group_id = groups_acl.fk_group_id
         WHERE groups_acl.fk_scene_id = ?1
         ORDER BY groups.group_name",
    )?;
    let groups = stmt.query_map(params![scene_id], |row| {
        Ok(GrantEntry {
            subject: Subject::Group(row.get(0)?),
            name: row.get(1)?,
            level: row.get(2)?,
        })
    })?;
    for entry in groups {
        entries.push(entry?);
    }

    Ok(entries)
}

/// Anonymous requests are capped at read; the schema CHECK backs this up.
pub fn set_public_access(conn: &Connection, scene_id: i64, level: AccessLevel) -> Result<()> {
    if level > AccessLevel::Read {
        return Err(Error::BadRequest(format!(
            "public access cannot exceed read, got {level}"
        )));
    }
    update_baseline(conn, scene_id, "public_access", level)
}

/// The authenticated default is capped at write; admin stays explicit.
pub fn set_default_access(conn: &Connection, scene_id: i64, level: AccessLevel) -> Result<()> {
    if level > AccessLevel::Write {
        return Err(Error::BadRequest(format!(
            "default access cannot exceed write, got {level}"
        )));
    }
    update_baseline(conn, scene_id, "default_access", level)
}

fn update_baseline(
    conn: &Connection,
    scene_id: i64,
    column: &str,
    level: AccessLevel,
) -> Result<()> {
    let changed = conn.execute(
        &format!("UPDATE scenes SET {column} = ?1 WHERE scene_id = ?2"),
        params![level, scene_id],
    )?;
    if changed == 0 {
        return Err(Error::NotFound);
    }
    Ok(())
}
