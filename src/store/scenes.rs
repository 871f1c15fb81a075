use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use super::{
    UID_RETRIES, access, format_datetime, is_constraint_violation, parse_datetime, random_uid,
};
use crate::error::{Error, Result};
use crate::types::{AccessLevel, OrderBy, OrderDirection, SCENE_DOCUMENT, Scene, SceneQuery, SceneRef};

const DEFAULT_PAGE: u32 = 10;
const MAX_PAGE: u32 = 100;

/// `#` is reserved: archiving mangles the stored name to `name#id`.
fn validate_scene_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::BadRequest("scene name must not be empty".to_string()));
    }
    if name.contains('#') {
        return Err(Error::BadRequest(format!(
            "scene names must not contain '#': {name}"
        )));
    }
    Ok(())
}

/// Creates a scene with a fresh random id. An owner, when given, receives
/// an implicit admin entry so authorship survives later default changes.
pub fn create(conn: &Connection, name: &str, author_id: Option<i64>) -> Result<i64> {
    validate_scene_name(name)?;
    let ctime = format_datetime(&Utc::now());
    for _ in 0..UID_RETRIES {
        let scene_id = random_uid();
        let result = conn.execute(
            "INSERT INTO scenes (scene_id, scene_name, fk_author_id, ctime) VALUES (?1, ?2, ?3, ?4)",
            params![scene_id, name, author_id, ctime],
        );
        match result {
            Ok(_) => {
                if let Some(owner) = author_id {
                    conn.execute(
                        "INSERT INTO users_acl (fk_user_id, fk_scene_id, access_level)
                         VALUES (?1, ?2, ?3)",
                        params![owner, scene_id, AccessLevel::Admin],
                    )?;
                }
                return Ok(scene_id);
            }
            Err(e) if is_constraint_violation(&e, "scenes.scene_name") => {
                return Err(Error::Conflict(format!(
                    "a scene named {name} already exists"
                )));
            }
            Err(e) if is_constraint_violation(&e, "scenes.scene_id") => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(Error::Internal(
        "failed to allocate a scene id after repeated collisions".to_string(),
    ))
}

pub fn resolve(conn: &Connection, scene: SceneRef<'_>) -> Result<i64> {
    let id = match scene {
        SceneRef::Id(id) => conn
            .query_row(
                "SELECT scene_id FROM scenes WHERE scene_id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?,
        SceneRef::Name(name) => conn
            .query_row(
                "SELECT scene_id FROM scenes WHERE scene_name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?,
    };
    id.ok_or(Error::NotFound)
}

/// Soft-delete. The name is mangled to `name#id` so the bare name frees
/// up immediately; `archived` records when. Already-archived scenes fail
/// NotFound.
pub fn archive(conn: &Connection, scene: SceneRef<'_>) -> Result<()> {
    let scene_id = resolve(conn, scene)?;
    let changed = conn.execute(
        "UPDATE scenes
         SET archived = ?1, scene_name = scene_name || '#' || scene_id
         WHERE scene_id = ?2 AND archived IS NULL",
        params![format_datetime(&Utc::now()), scene_id],
    )?;
    if changed == 0 {
        return Err(Error::NotFound);
    }
    Ok(())
}

/// Reverses an archive. The original name is recovered by stripping the
/// exact `#<id>` suffix the archive appended, never by searching for a
/// separator; a caller-supplied name overrides it.
pub fn unarchive(conn: &Connection, scene: SceneRef<'_>, new_name: Option<&str>) -> Result<()> {
    let scene_id = resolve(conn, scene)?;
    let (stored_name, archived): (String, Option<String>) = conn.query_row(
        "SELECT scene_name, archived FROM scenes WHERE scene_id = ?1",
        params![scene_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    if archived.is_none() {
        return Err(Error::Conflict(format!(
            "scene {scene_id} is not archived"
        )));
    }

    let restored = match new_name {
        Some(name) => {
            validate_scene_name(name)?;
            name.to_string()
        }
        None => stored_name
            .strip_suffix(&format!("#{scene_id}"))
            .ok_or_else(|| {
                Error::Internal(format!(
                    "archived scene {scene_id} has unexpected name {stored_name}"
                ))
            })?
            .to_string(),
    };

    let result = conn.execute(
        "UPDATE scenes SET archived = NULL, scene_name = ?1 WHERE scene_id = ?2",
        params![restored, scene_id],
    );
    match result {
        Ok(_) => Ok(()),
        Err(e) if is_constraint_violation(&e, "scenes.scene_name") => Err(Error::Conflict(
            format!("a scene named {restored} already exists"),
        )),
        Err(e) => Err(e.into()),
    }
}

/// Archived scenes cannot be renamed: their stored name is the mangled
/// `name#id` form unarchive recovers the original from, so it must stay
/// untouched until the scene is live again.
pub fn rename(conn: &Connection, scene: SceneRef<'_>, new_name: &str) -> Result<()> {
    validate_scene_name(new_name)?;
    let scene_id = resolve(conn, scene)?;
    let result = conn.execute(
        "UPDATE scenes SET scene_name = ?1 WHERE scene_id = ?2 AND archived IS NULL",
        params![new_name, scene_id],
    );
    match result {
        Ok(0) => Err(Error::Conflict(format!(
            "scene {scene_id} is archived; unarchive it to rename"
        ))),
        Ok(_) => Ok(()),
        Err(e) if is_constraint_violation(&e, "scenes.scene_name") => Err(Error::Conflict(
            format!("a scene named {new_name} already exists"),
        )),
        Err(e) => Err(e.into()),
    }
}

/// Hard-delete, administrative and irreversible. Versions, grants and
/// tags cascade away; published objects stay in the content store.
pub fn remove(conn: &Connection, scene: SceneRef<'_>) -> Result<()> {
    let scene_id = resolve(conn, scene)?;
    let changed = conn.execute("DELETE FROM scenes WHERE scene_id = ?1", params![scene_id])?;
    if changed == 0 {
        return Err(Error::NotFound);
    }
    Ok(())
}

struct SceneRow {
    id: i64,
    name: String,
    ctime: DateTime<Utc>,
    author_id: Option<i64>,
    author: Option<String>,
    public_access: AccessLevel,
    default_access: AccessLevel,
    archived: Option<DateTime<Utc>>,
}

const SCENE_COLUMNS: &str = "scenes.scene_id, scenes.scene_name, scenes.ctime, \
     scenes.fk_author_id, users.username, scenes.public_access, scenes.default_access, \
     scenes.archived";

fn scene_from_row(row: &rusqlite::Row) -> rusqlite::Result<SceneRow> {
    Ok(SceneRow {
        id: row.get(0)?,
        name: row.get(1)?,
        ctime: parse_datetime(&row.get::<_, String>(2)?),
        author_id: row.get(3)?,
        author: row.get(4)?,
        public_access: row.get(5)?,
        default_access: row.get(6)?,
        archived: row
            .get::<_, Option<String>>(7)?
            .map(|s| parse_datetime(&s)),
    })
}

/// Derived fields: mtime from the newest version row, the conventional
/// thumbnail, and the tag list.
fn hydrate(conn: &Connection, row: SceneRow, held: Option<AccessLevel>) -> Result<Scene> {
    let mtime: Option<String> = conn.query_row(
        "SELECT MAX(ctime) FROM files WHERE fk_scene_id = ?1 AND hash IS NOT NULL",
        params![row.id],
        |r| r.get(0),
    )?;

    // Ties between the jpg and png names settle on recency, then name.
    let thumbnail: Option<String> = conn
        .query_row(
            "SELECT name FROM current_files
             WHERE fk_scene_id = ?1
               AND name IN ('scene-image-thumb.jpg', 'scene-image-thumb.png')
               AND hash IS NOT NULL AND size > 0
             ORDER BY ctime DESC, name ASC LIMIT 1",
            params![row.id],
            |r| r.get(0),
        )
        .optional()?;

    let mut stmt = conn.prepare(
        "SELECT tag_name FROM tags WHERE fk_scene_id = ?1 ORDER BY tag_name",
    )?;
    let tags = stmt
        .query_map(params![row.id], |r| r.get(0))?
        .collect::<std::result::Result<Vec<String>, _>>()?;

    Ok(Scene {
        id: row.id,
        name: row.name,
        ctime: row.ctime,
        mtime: mtime.map(|s| parse_datetime(&s)).unwrap_or(row.ctime),
        author_id: row.author_id,
        author: row.author,
        public_access: row.public_access,
        default_access: row.default_access,
        access: held,
        archived: row.archived,
        thumbnail,
        tags,
    })
}

/// Fetches a scene as seen by `requester`. A scene the requester holds no
/// access on reads as NotFound, indistinguishable from a missing one.
pub fn get(conn: &Connection, scene: SceneRef<'_>, requester: Option<i64>) -> Result<Scene> {
    let scene_id = resolve(conn, scene)?;
    let held = access::effective_access(conn, scene_id, requester)?;
    if held == AccessLevel::None {
        return Err(Error::NotFound);
    }
    let row = base_row(conn, scene_id)?;
    hydrate(conn, row, Some(held))
}

/// Fetches a scene without an access gate, for internal readbacks where
/// the caller just created or already authorized it. The `access` field
/// stays unset.
pub fn peek(conn: &Connection, scene: SceneRef<'_>) -> Result<Scene> {
    let scene_id = resolve(conn, scene)?;
    let row = base_row(conn, scene_id)?;
    hydrate(conn, row, None)
}

fn base_row(conn: &Connection, scene_id: i64) -> Result<SceneRow> {
    Ok(conn.query_row(
        &format!(
            "SELECT {SCENE_COLUMNS} FROM scenes
             LEFT JOIN users ON users.user_id = scenes.fk_author_id
             WHERE scenes.scene_id = ?1"
        ),
        params![scene_id],
        scene_from_row,
    )?)
}

/// Lists the scenes `requester` can see, filtered, optionally ranked by a
/// free-text term, and paginated. Ranking and ordering happen after the
/// access filter, in memory; candidate sets are per-instance small.
pub fn list(conn: &Connection, requester: Option<i64>, query: &SceneQuery) -> Result<Vec<Scene>> {
    let limit = query.limit.unwrap_or(DEFAULT_PAGE);
    if !(1..=MAX_PAGE).contains(&limit) {
        return Err(Error::BadRequest(format!(
            "limit must be between 1 and {MAX_PAGE}, got {limit}"
        )));
    }

    let mut sql = format!(
        "SELECT {SCENE_COLUMNS} FROM scenes
         LEFT JOIN users ON users.user_id = scenes.fk_author_id
         WHERE scenes.archived IS {} NULL",
        if query.archived == Some(true) { "NOT" } else { "" }
    );
    let rows = if let Some(author) = query.author {
        sql.push_str(" AND scenes.fk_author_id = ?1");
        let mut stmt = conn.prepare(&sql)?;
        stmt.query_map(params![author], scene_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?
    } else {
        let mut stmt = conn.prepare(&sql)?;
        stmt.query_map([], scene_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?
    };

    let min_access = query.min_access.unwrap_or(AccessLevel::Read);
    let terms: Vec<String> = query
        .search
        .as_deref()
        .unwrap_or("")
        .split_whitespace()
        .map(str::to_lowercase)
        .collect();

    let mut scored = Vec::new();
    for row in rows {
        let held = access::effective_access(conn, row.id, requester)?;
        if held < min_access || held == AccessLevel::None {
            continue;
        }
        let score = if terms.is_empty() {
            0
        } else {
            match relevance(conn, &row, &terms)? {
                Some(score) => score,
                None => continue,
            }
        };
        scored.push((score, hydrate(conn, row, Some(held))?));
    }

    if terms.is_empty() {
        scored.sort_by(|(_, a), (_, b)| {
            let ordering = match query.order_by {
                OrderBy::Name => a
                    .name
                    .to_lowercase()
                    .cmp(&b.name.to_lowercase())
                    .then_with(|| a.name.cmp(&b.name)),
                OrderBy::Ctime => a.ctime.cmp(&b.ctime),
                OrderBy::Mtime => a.mtime.cmp(&b.mtime),
            };
            match query.direction {
                OrderDirection::Asc => ordering,
                OrderDirection::Desc => ordering.reverse(),
            }
        });
    } else {
        // Relevance wins; name breaks ties so pages stay stable.
        scored.sort_by(|(sa, a), (sb, b)| sb.cmp(sa).then_with(|| a.name.cmp(&b.name)));
    }

    Ok(scored
        .into_iter()
        .map(|(_, scene)| scene)
        .skip(query.offset as usize)
        .take(limit as usize)
        .collect())
}

/// Tiered match: scene name above document metadata above author name.
/// Every term must match somewhere or the scene drops out.
fn relevance(conn: &Connection, row: &SceneRow, terms: &[String]) -> Result<Option<u32>> {
    let name = row.name.to_lowercase();
    let author = row.author.as_deref().unwrap_or("").to_lowercase();
    let metas = document_metas(conn, row.id)?;

    let mut score = 0;
    for term in terms {
        let tier = if name.contains(term) {
            4
        } else if metas.iter().any(|m| m.contains(term)) {
            2
        } else if author.contains(term) {
            1
        } else {
            return Ok(None);
        };
        score += tier;
    }
    Ok(Some(score))
}

/// String leaves under the current document's "metas" collection,
/// lowercased. Missing or unparsable documents match nothing.
fn document_metas(conn: &Connection, scene_id: i64) -> Result<Vec<String>> {
    let data: Option<String> = conn
        .query_row(
            "SELECT data FROM current_files
             WHERE fk_scene_id = ?1 AND name = ?2 AND hash IS NOT NULL",
            params![scene_id, SCENE_DOCUMENT],
            |row| row.get(0),
        )
        .optional()?
        .flatten();

    let Some(data) = data else { return Ok(Vec::new()) };
    let Ok(doc) = serde_json::from_str::<serde_json::Value>(&data) else {
        return Ok(Vec::new());
    };
    let mut out = Vec::new();
    if let Some(metas) = doc.get("metas") {
        collect_strings(metas, &mut out);
    }
    Ok(out)
}

fn collect_strings(value: &serde_json::Value, out: &mut Vec<String>) {
    match value {
        serde_json::Value::String(s) => out.push(s.to_lowercase()),
        serde_json::Value::Array(items) => {
            for item in items {
                collect_strings(item, out);
            }
        }
        serde_json::Value::Object(map) => {
            for item in map.values() {
                collect_strings(item, out);
            }
        }
        _ => {}
    }
}
