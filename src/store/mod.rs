pub mod access;
pub mod files;
pub mod scenes;
mod schema;
pub mod tags;
pub mod txn;
pub mod users;

use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use rand::Rng;
use rusqlite::Connection;

use crate::error::Result;

pub use schema::SCHEMA;

/// Opens (or creates) the backing database and applies the schema.
/// Pragmas must be set on every new connection.
pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Connection> {
    let conn = Connection::open(db_path)?;
    configure(&conn)?;
    conn.execute_batch(SCHEMA)?;
    Ok(conn)
}

fn configure(conn: &Connection) -> Result<()> {
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    Ok(())
}

/// Random 48-bit id for scenes and users. Small enough to stay a safe
/// integer everywhere, large enough that collisions are handled by a
/// bounded insert-and-retry rather than avoided.
pub(crate) fn random_uid() -> i64 {
    rand::thread_rng().gen_range(1..(1i64 << 48))
}

/// How many times insert-and-retry attempts a fresh random id before
/// giving up with a Conflict.
pub(crate) const UID_RETRIES: u32 = 3;

/// Fixed fractional precision so the stored text orders the same way the
/// timestamps do.
pub(crate) fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            // SQLite's default datetime format: "YYYY-MM-DD HH:MM:SS"
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .unwrap_or_else(|e| {
            tracing::error!("Invalid datetime in database: '{}' - {}", s, e);
            Utc::now()
        })
}

/// True when `e` is a UNIQUE (or other constraint) violation whose message
/// names `column`, e.g. "scenes.scene_name".
pub(crate) fn is_constraint_violation(e: &rusqlite::Error, column: &str) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, Some(msg))
            if err.code == rusqlite::ErrorCode::ConstraintViolation && msg.contains(column)
    )
}

#[cfg(test)]
pub(crate) fn test_conn() -> Connection {
    let conn = Connection::open_in_memory().unwrap();
    conn.pragma_update(None, "foreign_keys", "ON").unwrap();
    conn.execute_batch(SCHEMA).unwrap();
    conn
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_creates_tables() {
        let temp = TempDir::new().unwrap();
        let conn = open(temp.path().join("test.db")).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();

        for table in [
            "users",
            "groups",
            "groups_membership",
            "scenes",
            "files",
            "users_acl",
            "groups_acl",
            "tags",
        ] {
            assert!(tables.contains(&table.to_string()), "missing {table}");
        }
    }

    #[test]
    fn test_random_uid_fits_48_bits() {
        for _ in 0..1000 {
            let id = random_uid();
            assert!(0 < id && id < (1i64 << 48));
        }
    }

    #[test]
    fn test_datetime_text_ordering() {
        let early = Utc::now();
        let late = early + chrono::Duration::microseconds(1);
        assert!(format_datetime(&early) < format_datetime(&late));
        // Round trip is stable at the stored precision.
        let stored = format_datetime(&early);
        assert_eq!(format_datetime(&parse_datetime(&stored)), stored);
    }
}
