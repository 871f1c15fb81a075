use rusqlite::{Connection, params};

use crate::error::{Error, Result};
use crate::types::{Scene, TagCount};

/// Tags are stored trimmed and lowercased so "Dragon" and "dragon" label
/// the same thing.
fn normalize(tag: &str) -> Result<String> {
    let tag = tag.trim().to_lowercase();
    if tag.is_empty() {
        return Err(Error::BadRequest("tag must not be empty".to_string()));
    }
    Ok(tag)
}

/// Returns false when the scene already carried the tag.
pub fn add(conn: &Connection, scene_id: i64, tag: &str) -> Result<bool> {
    let tag = normalize(tag)?;
    let result = conn.execute(
        "INSERT OR IGNORE INTO tags (tag_name, fk_scene_id) VALUES (?1, ?2)",
        params![tag, scene_id],
    );
    match result {
        Ok(changed) => Ok(changed > 0),
        Err(rusqlite::Error::SqliteFailure(err, _))
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Err(Error::NotFound)
        }
        Err(e) => Err(e.into()),
    }
}

/// Returns false when the scene did not carry the tag.
pub fn remove(conn: &Connection, scene_id: i64, tag: &str) -> Result<bool> {
    let tag = normalize(tag)?;
    let changed = conn.execute(
        "DELETE FROM tags WHERE tag_name = ?1 AND fk_scene_id = ?2",
        params![tag, scene_id],
    )?;
    Ok(changed > 0)
}

pub fn for_scene(conn: &Connection, scene_id: i64) -> Result<Vec<String>> {
    let mut stmt =
        conn.prepare("SELECT tag_name FROM tags WHERE fk_scene_id = ?1 ORDER BY tag_name")?;
    let tags = stmt
        .query_map(params![scene_id], |row| row.get(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(tags)
}

/// Every tag in use with how many scenes carry it, optionally restricted
/// to a name prefix.
pub fn list(conn: &Connection, prefix: Option<&str>) -> Result<Vec<TagCount>> {
    let mut sql = String::from(
        "SELECT tag_name, COUNT(fk_scene_id) FROM tags",
    );
    let map_row = |row: &rusqlite::Row| -> rusqlite::Result<TagCount> {
        Ok(TagCount {
            name: row.get(0)?,
            scenes: row.get(1)?,
        })
    };
    let counts = match prefix {
        Some(prefix) => {
            sql.push_str(" WHERE tag_name LIKE ?1 || '%' GROUP BY tag_name ORDER BY tag_name");
            let mut stmt = conn.prepare(&sql)?;
            stmt.query_map(params![prefix.trim().to_lowercase()], map_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?
        }
        None => {
            sql.push_str(" GROUP BY tag_name ORDER BY tag_name");
            let mut stmt = conn.prepare(&sql)?;
            stmt.query_map([], map_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?
        }
    };
    Ok(counts)
}

/// The scenes carrying a tag, restricted to what `requester` can see.
pub fn scenes_with_tag(
    conn: &Connection,
    tag: &str,
    requester: Option<i64>,
) -> Result<Vec<Scene>> {
    let tag = normalize(tag)?;
    let mut stmt = conn.prepare(
        "SELECT fk_scene_id FROM tags WHERE tag_name = ?1 ORDER BY fk_scene_id",
    )?;
    let ids = stmt
        .query_map(params![tag], |row| row.get::<_, i64>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut scenes = Vec::new();
    for id in ids {
        match super::scenes::get(conn, id.into(), requester) {
            Ok(scene) => scenes.push(scene),
            Err(Error::NotFound) => continue,
            Err(e) => return Err(e),
        }
    }
    scenes.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(scenes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{access, scenes, test_conn, users};
    use crate::types::AccessLevel;

    #[test]
    fn test_add_normalizes_and_dedupes() {
        let conn = test_conn();
        let scene_id = scenes::create(&conn, "dragon", None).unwrap();
        assert!(add(&conn, scene_id, " Medieval ").unwrap());
        assert!(!add(&conn, scene_id, "medieval").unwrap());
        assert_eq!(for_scene(&conn, scene_id).unwrap(), vec!["medieval"]);
    }

    #[test]
    fn test_add_to_missing_scene() {
        let conn = test_conn();
        assert!(matches!(add(&conn, 42, "x"), Err(Error::NotFound)));
        assert!(matches!(add(&conn, 42, "  "), Err(Error::BadRequest(_))));
    }

    #[test]
    fn test_remove_reports_presence() {
        let conn = test_conn();
        let scene_id = scenes::create(&conn, "dragon", None).unwrap();
        add(&conn, scene_id, "medieval").unwrap();
        assert!(remove(&conn, scene_id, "medieval").unwrap());
        assert!(!remove(&conn, scene_id, "medieval").unwrap());
    }

    #[test]
    fn test_list_counts_and_prefix() {
        let conn = test_conn();
        let a = scenes::create(&conn, "a", None).unwrap();
        let b = scenes::create(&conn, "b", None).unwrap();
        add(&conn, a, "medieval").unwrap();
        add(&conn, b, "medieval").unwrap();
        add(&conn, a, "metal").unwrap();
        add(&conn, b, "wood").unwrap();

        let all = list(&conn, None).unwrap();
        let summary: Vec<(&str, i64)> = all.iter().map(|t| (t.name.as_str(), t.scenes)).collect();
        assert_eq!(summary, vec![("medieval", 2), ("metal", 1), ("wood", 1)]);

        let me = list(&conn, Some("me")).unwrap();
        assert_eq!(me.len(), 2);
    }

    #[test]
    fn test_scenes_with_tag_respects_access() {
        let conn = test_conn();
        let owner = users::create(&conn, "owner", false).unwrap();
        let open = scenes::create(&conn, "open", Some(owner)).unwrap();
        let hidden = scenes::create(&conn, "hidden", Some(owner)).unwrap();
        access::set_default_access(&conn, hidden, AccessLevel::None).unwrap();
        add(&conn, open, "shared").unwrap();
        add(&conn, hidden, "shared").unwrap();

        let visitor = users::create(&conn, "visitor", false).unwrap();
        let seen = scenes_with_tag(&conn, "shared", Some(visitor)).unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].name, "open");

        let owned = scenes_with_tag(&conn, "shared", Some(owner)).unwrap();
        assert_eq!(owned.len(), 2);
    }
}
