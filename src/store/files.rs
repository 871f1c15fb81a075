use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};

use super::{format_datetime, parse_datetime};
use crate::error::{Error, Result};
use crate::types::{FOLDER_HASH, FOLDER_MIME, FileVersion};

/// Column list shared by every query returning full version rows.
const VERSION_COLUMNS: &str =
    "file_id, fk_scene_id, name, mime, generation, hash, data, size, ctime, fk_author_id";

fn version_from_row(row: &rusqlite::Row) -> rusqlite::Result<FileVersion> {
    Ok(FileVersion {
        id: row.get(0)?,
        scene_id: row.get(1)?,
        name: row.get(2)?,
        mime: row.get(3)?,
        generation: row.get(4)?,
        hash: row.get(5)?,
        data: row.get(6)?,
        size: row.get(7)?,
        ctime: parse_datetime(&row.get::<_, String>(8)?),
        author_id: row.get(9)?,
    })
}

/// Content and metadata for one new version row.
#[derive(Debug, Clone, Copy, Default)]
pub struct NewVersion<'a> {
    pub hash: Option<&'a str>,
    pub data: Option<&'a str>,
    pub size: i64,
    pub mime: &'a str,
    pub author_id: Option<i64>,
}

impl<'a> NewVersion<'a> {
    /// A deletion marker. Mime is kept so listings with tombstones stay
    /// classifiable.
    pub fn tombstone(mime: &'a str, author_id: Option<i64>) -> Self {
        Self {
            hash: None,
            data: None,
            size: 0,
            mime,
            author_id,
        }
    }
}

/// Appends a version for `name`, computing its generation inside the same
/// INSERT so concurrent writers serialize to distinct generations. Fails
/// NotFound when the scene does not exist.
pub fn append(
    conn: &Connection,
    scene_id: i64,
    name: &str,
    version: &NewVersion<'_>,
) -> Result<FileVersion> {
    let ctime = format_datetime(&Utc::now());
    let inserted = conn.query_row(
        "INSERT INTO files (fk_scene_id, name, mime, generation, hash, data, size, fk_author_id, ctime)
         SELECT
             scene_id, ?2, ?3,
             COALESCE((SELECT MAX(generation) FROM files
                       WHERE fk_scene_id = scenes.scene_id AND name = ?2), 0) + 1,
             ?4, ?5, ?6, ?7, ?8
         FROM scenes WHERE scene_id = ?1
         RETURNING file_id, generation",
        params![
            scene_id,
            name,
            version.mime,
            version.hash,
            version.data,
            version.size,
            version.author_id,
            ctime,
        ],
        |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
    );

    match inserted {
        Ok((id, generation)) => Ok(FileVersion {
            id,
            scene_id,
            name: name.to_string(),
            mime: version.mime.to_string(),
            generation,
            hash: version.hash.map(str::to_string),
            data: version.data.map(str::to_string),
            size: version.size,
            ctime: parse_datetime(&ctime),
            author_id: version.author_id,
        }),
        Err(rusqlite::Error::QueryReturnedNoRows) => Err(Error::NotFound),
        Err(e) => Err(e.into()),
    }
}

/// The one permitted update of a version row: attaching the content hash
/// right after insert, once the object is durably published. Must run in
/// the same transaction as the insert.
pub fn attach_hash(conn: &Connection, file_id: i64, hash: &str, size: i64) -> Result<()> {
    let changed = conn.execute(
        "UPDATE files SET hash = ?1, size = ?2 WHERE file_id = ?3",
        params![hash, size, file_id],
    )?;
    if changed != 1 {
        return Err(Error::Internal(format!(
            "failed to attach content hash to version {file_id}"
        )));
    }
    Ok(())
}

/// Current state of a name: its highest generation. NotFound when the name
/// never existed, or is tombstoned and `include_deleted` is false.
pub fn current(
    conn: &Connection,
    scene_id: i64,
    name: &str,
    include_deleted: bool,
) -> Result<FileVersion> {
    let version = conn
        .query_row(
            &format!(
                "SELECT {VERSION_COLUMNS} FROM files
                 WHERE fk_scene_id = ?1 AND name = ?2
                 ORDER BY generation DESC LIMIT 1"
            ),
            params![scene_id, name],
            version_from_row,
        )
        .optional()?;

    match version {
        Some(v) if v.is_live() || include_deleted => Ok(v),
        _ => Err(Error::NotFound),
    }
}

/// A specific historical generation of a name. Out-of-range generations
/// fail NotFound.
pub fn at_generation(
    conn: &Connection,
    scene_id: i64,
    name: &str,
    generation: i64,
) -> Result<FileVersion> {
    conn.query_row(
        &format!(
            "SELECT {VERSION_COLUMNS} FROM files
             WHERE fk_scene_id = ?1 AND name = ?2 AND generation = ?3"
        ),
        params![scene_id, name, generation],
        version_from_row,
    )
    .optional()?
    .ok_or(Error::NotFound)
}

pub fn by_id(conn: &Connection, file_id: i64) -> Result<FileVersion> {
    conn.query_row(
        &format!("SELECT {VERSION_COLUMNS} FROM files WHERE file_id = ?1"),
        params![file_id],
        version_from_row,
    )
    .optional()?
    .ok_or(Error::NotFound)
}

/// Every version of a name, newest first. Tombstones included: they are
/// part of the audit trail.
pub fn history(conn: &Connection, scene_id: i64, name: &str) -> Result<Vec<FileVersion>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {VERSION_COLUMNS} FROM files
         WHERE fk_scene_id = ?1 AND name = ?2
         ORDER BY generation DESC"
    ))?;
    let rows = stmt
        .query_map(params![scene_id, name], version_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    if rows.is_empty() {
        return Err(Error::NotFound);
    }
    Ok(rows)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ListOptions {
    pub with_deleted: bool,
    pub with_folders: bool,
}

/// One row per name in its current state, most recently modified first.
/// Live files only unless `with_deleted` is set.
pub fn list_current(
    conn: &Connection,
    scene_id: i64,
    opts: ListOptions,
) -> Result<Vec<FileVersion>> {
    let mut sql = format!("SELECT {VERSION_COLUMNS} FROM current_files WHERE fk_scene_id = ?1");
    if !opts.with_deleted {
        sql.push_str(" AND hash IS NOT NULL");
    }
    if !opts.with_folders {
        sql.push_str(" AND mime != 'text/directory'");
    }
    sql.push_str(" ORDER BY ctime DESC, name ASC");

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![scene_id], version_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Full version log of a scene, ordered by name then generation. Used by
/// the restore reconciliation.
pub fn all_versions(conn: &Connection, scene_id: i64) -> Result<Vec<FileVersion>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {VERSION_COLUMNS} FROM files
         WHERE fk_scene_id = ?1
         ORDER BY name ASC, generation ASC"
    ))?;
    let rows = stmt
        .query_map(params![scene_id], version_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Paginated walk over a scene's whole version log across every name,
/// newest first unless asked otherwise. Tombstones included.
pub fn scene_history(
    conn: &Connection,
    scene_id: i64,
    query: &crate::types::HistoryQuery,
) -> Result<Vec<crate::types::HistoryEntry>> {
    let limit = query.limit.unwrap_or(10);
    if !(1..=100).contains(&limit) {
        return Err(Error::BadRequest(format!(
            "limit must be between 1 and 100, got {limit}"
        )));
    }
    let order = match query.direction.unwrap_or(crate::types::OrderDirection::Desc) {
        crate::types::OrderDirection::Asc => "ASC",
        crate::types::OrderDirection::Desc => "DESC",
    };

    let mut stmt = conn.prepare(&format!(
        "SELECT file_id, name, mime, generation, size, ctime, fk_author_id
         FROM files WHERE fk_scene_id = ?1
         ORDER BY ctime {order}, file_id {order}
         LIMIT ?2 OFFSET ?3"
    ))?;
    let rows = stmt
        .query_map(params![scene_id, limit, query.offset], |row| {
            Ok(crate::types::HistoryEntry {
                id: row.get(0)?,
                name: row.get(1)?,
                mime: row.get(2)?,
                generation: row.get(3)?,
                size: row.get(4)?,
                ctime: parse_datetime(&row.get::<_, String>(5)?),
                author_id: row.get(6)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Deletes a name by appending a tombstone. The name must currently be
/// live; deleting twice is a conflict.
pub fn remove(
    conn: &Connection,
    scene_id: i64,
    name: &str,
    author_id: Option<i64>,
) -> Result<FileVersion> {
    let prev = current(conn, scene_id, name, true)?;
    if !prev.is_live() {
        return Err(Error::Conflict(format!("{name} is already deleted")));
    }
    append(
        conn,
        scene_id,
        name,
        &NewVersion::tombstone(&prev.mime, author_id),
    )
}

/// Renames by tombstoning the old name and appending a copy of its content
/// reference at the new name. Both appends belong to the caller's
/// transaction scope.
pub fn rename(
    conn: &Connection,
    scene_id: i64,
    name: &str,
    next_name: &str,
    author_id: Option<i64>,
) -> Result<FileVersion> {
    let source = current(conn, scene_id, name, false)?;
    match current(conn, scene_id, next_name, true) {
        Ok(dest) if dest.is_live() => {
            return Err(Error::Conflict(format!("{next_name} already exists")));
        }
        Ok(_) | Err(Error::NotFound) => {}
        Err(e) => return Err(e),
    }

    append(
        conn,
        scene_id,
        name,
        &NewVersion::tombstone(&source.mime, author_id),
    )?;
    append(
        conn,
        scene_id,
        next_name,
        &NewVersion {
            hash: source.hash.as_deref(),
            data: source.data.as_deref(),
            size: source.size,
            mime: &source.mime,
            author_id,
        },
    )
}

/// Creates a folder placeholder entry. Folders carry no content object.
pub fn create_folder(
    conn: &Connection,
    scene_id: i64,
    name: &str,
    author_id: Option<i64>,
) -> Result<FileVersion> {
    if name.starts_with('/') {
        return Err(Error::BadRequest(
            "folders must be relative to the scene root".to_string(),
        ));
    }
    if name.ends_with('/') {
        return Err(Error::BadRequest(
            "folder names must not end with a slash".to_string(),
        ));
    }
    match current(conn, scene_id, name, false) {
        Ok(_) => return Err(Error::Conflict(format!("{name} already exists"))),
        Err(Error::NotFound) => {}
        Err(e) => return Err(e),
    }
    append(
        conn,
        scene_id,
        name,
        &NewVersion {
            hash: Some(FOLDER_HASH),
            data: None,
            size: 0,
            mime: FOLDER_MIME,
            author_id,
        },
    )
}

/// Removes a folder and cascade-tombstones every live entry nested under
/// it, in one transaction scope. Returns the tombstoned names, folder
/// marker first.
pub fn remove_folder(
    conn: &Connection,
    scene_id: i64,
    name: &str,
    author_id: Option<i64>,
) -> Result<Vec<String>> {
    let marker = current(conn, scene_id, name, true)?;
    if !marker.is_live() {
        return Err(Error::Conflict(format!("{name} is already deleted")));
    }
    if !marker.is_folder() {
        return Err(Error::BadRequest(format!("{name} is not a folder")));
    }

    let prefix = format!("{}/", escape_like(name));
    let mut stmt = conn.prepare(
        "SELECT name FROM current_files
         WHERE fk_scene_id = ?1 AND hash IS NOT NULL AND name LIKE ?2 || '%' ESCAPE '\\'
         ORDER BY name ASC",
    )?;
    let nested = stmt
        .query_map(params![scene_id, prefix], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut removed = vec![name.to_string()];
    remove(conn, scene_id, name, author_id)?;
    for child in nested {
        remove(conn, scene_id, &child, author_id)?;
        removed.push(child);
    }
    Ok(removed)
}

fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

/// All current folder entries of a scene.
pub fn list_folders(conn: &Connection, scene_id: i64) -> Result<Vec<FileVersion>> {
    let all = list_current(
        conn,
        scene_id,
        ListOptions {
            with_deleted: false,
            with_folders: true,
        },
    )?;
    Ok(all.into_iter().filter(FileVersion::is_folder).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{scenes, test_conn};

    fn seed_scene(conn: &Connection) -> i64 {
        scenes::create(conn, "test-scene", None).unwrap()
    }

    fn write(conn: &Connection, scene_id: i64, name: &str, hash: &str) -> FileVersion {
        append(
            conn,
            scene_id,
            name,
            &NewVersion {
                hash: Some(hash),
                data: None,
                size: 3,
                mime: "model/gltf-binary",
                author_id: None,
            },
        )
        .unwrap()
    }

    const HASH_A: &str = "a665a45920422f9d417e4867efdc4fb8a04a1f3fff1fa07e998e86f7f7a27ae3";
    const HASH_B: &str = "b665a45920422f9d417e4867efdc4fb8a04a1f3fff1fa07e998e86f7f7a27ae3";

    #[test]
    fn test_generations_are_dense() {
        let conn = test_conn();
        let scene_id = seed_scene(&conn);

        for expected in 1..=4 {
            let v = write(&conn, scene_id, "models/a.glb", HASH_A);
            assert_eq!(v.generation, expected);
        }
        let history = history(&conn, scene_id, "models/a.glb").unwrap();
        let generations: Vec<i64> = history.iter().map(|v| v.generation).collect();
        assert_eq!(generations, vec![4, 3, 2, 1]);
    }

    #[test]
    fn test_append_unknown_scene_not_found() {
        let conn = test_conn();
        let result = append(
            &conn,
            42,
            "a.glb",
            &NewVersion {
                hash: Some(HASH_A),
                mime: "model/gltf-binary",
                ..Default::default()
            },
        );
        assert!(matches!(result, Err(Error::NotFound)));
    }

    #[test]
    fn test_current_skips_tombstone_unless_requested() {
        let conn = test_conn();
        let scene_id = seed_scene(&conn);
        write(&conn, scene_id, "a.txt", HASH_A);
        remove(&conn, scene_id, "a.txt", None).unwrap();

        assert!(matches!(
            current(&conn, scene_id, "a.txt", false),
            Err(Error::NotFound)
        ));
        let tombstone = current(&conn, scene_id, "a.txt", true).unwrap();
        assert!(!tombstone.is_live());
        assert_eq!(tombstone.generation, 2);
    }

    #[test]
    fn test_double_delete_is_conflict() {
        let conn = test_conn();
        let scene_id = seed_scene(&conn);
        write(&conn, scene_id, "a.txt", HASH_A);
        remove(&conn, scene_id, "a.txt", None).unwrap();
        assert!(matches!(
            remove(&conn, scene_id, "a.txt", None),
            Err(Error::Conflict(_))
        ));
    }

    #[test]
    fn test_tombstone_round_trip_keeps_history() {
        let conn = test_conn();
        let scene_id = seed_scene(&conn);
        write(&conn, scene_id, "a.txt", HASH_A);
        remove(&conn, scene_id, "a.txt", None).unwrap();
        write(&conn, scene_id, "a.txt", HASH_B);

        let live = current(&conn, scene_id, "a.txt", false).unwrap();
        assert_eq!(live.generation, 3);
        assert_eq!(live.hash.as_deref(), Some(HASH_B));

        let history = history(&conn, scene_id, "a.txt").unwrap();
        assert_eq!(history.len(), 3);
        assert!(!history[1].is_live());
    }

    #[test]
    fn test_rename_moves_content_and_blocks_live_destination() {
        let conn = test_conn();
        let scene_id = seed_scene(&conn);
        write(&conn, scene_id, "old.glb", HASH_A);

        let renamed = rename(&conn, scene_id, "old.glb", "new.glb", None).unwrap();
        assert_eq!(renamed.name, "new.glb");
        assert_eq!(renamed.hash.as_deref(), Some(HASH_A));
        assert!(matches!(
            current(&conn, scene_id, "old.glb", false),
            Err(Error::NotFound)
        ));

        write(&conn, scene_id, "other.glb", HASH_B);
        assert!(matches!(
            rename(&conn, scene_id, "other.glb", "new.glb", None),
            Err(Error::Conflict(_))
        ));
    }

    #[test]
    fn test_list_current_one_row_per_live_name() {
        let conn = test_conn();
        let scene_id = seed_scene(&conn);
        write(&conn, scene_id, "a.glb", HASH_A);
        write(&conn, scene_id, "a.glb", HASH_B);
        write(&conn, scene_id, "b.glb", HASH_A);
        write(&conn, scene_id, "gone.glb", HASH_A);
        remove(&conn, scene_id, "gone.glb", None).unwrap();

        let listed = list_current(&conn, scene_id, ListOptions::default()).unwrap();
        let names: Vec<&str> = listed.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["b.glb", "a.glb"]);
        assert_eq!(listed[1].generation, 2);
    }

    #[test]
    fn test_folder_cascade_remove() {
        let conn = test_conn();
        let scene_id = seed_scene(&conn);
        create_folder(&conn, scene_id, "articles", None).unwrap();
        write(&conn, scene_id, "articles/hello.txt", HASH_A);
        write(&conn, scene_id, "articles/world.txt", HASH_B);
        write(&conn, scene_id, "outside.txt", HASH_A);

        let removed = remove_folder(&conn, scene_id, "articles", None).unwrap();
        assert_eq!(
            removed,
            vec!["articles", "articles/hello.txt", "articles/world.txt"]
        );
        assert!(matches!(
            current(&conn, scene_id, "articles/hello.txt", false),
            Err(Error::NotFound)
        ));
        assert!(current(&conn, scene_id, "outside.txt", false).is_ok());
    }

    #[test]
    fn test_folder_name_validation() {
        let conn = test_conn();
        let scene_id = seed_scene(&conn);
        assert!(matches!(
            create_folder(&conn, scene_id, "/abs", None),
            Err(Error::BadRequest(_))
        ));
        assert!(matches!(
            create_folder(&conn, scene_id, "trailing/", None),
            Err(Error::BadRequest(_))
        ));
        create_folder(&conn, scene_id, "ok", None).unwrap();
        assert!(matches!(
            create_folder(&conn, scene_id, "ok", None),
            Err(Error::Conflict(_))
        ));
    }

    #[test]
    fn test_attach_hash_after_insert() {
        let conn = test_conn();
        let scene_id = seed_scene(&conn);
        let pending = append(
            &conn,
            scene_id,
            "streamed.bin",
            &NewVersion {
                mime: "application/octet-stream",
                ..Default::default()
            },
        )
        .unwrap();
        assert!(!pending.is_live());

        attach_hash(&conn, pending.id, HASH_A, 3).unwrap();
        let live = current(&conn, scene_id, "streamed.bin", false).unwrap();
        assert_eq!(live.hash.as_deref(), Some(HASH_A));
        assert_eq!(live.size, 3);
    }
}
