use rusqlite::Connection;

use crate::error::Result;

const SAVEPOINT: &str = "SAVEPOINT scenevault_txn";
const RELEASE: &str = "RELEASE SAVEPOINT scenevault_txn";
const ROLLBACK: &str = "ROLLBACK TO scenevault_txn; RELEASE scenevault_txn";

/// Runs `f` inside a savepoint scope on the connection.
///
/// SQLite stacks savepoints that reuse a name, so nested `isolate` calls
/// issue nested savepoints on the one physical transaction: an error in an
/// inner scope rolls back only that scope and propagates, leaving the outer
/// scope free to continue or abort. The top-level scope commits the whole
/// transaction on success.
pub fn isolate<T>(conn: &Connection, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
    conn.execute_batch(SAVEPOINT)?;
    match f(conn) {
        Ok(value) => {
            conn.execute_batch(RELEASE)?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback_err) = conn.execute_batch(ROLLBACK) {
                tracing::error!("failed to roll back savepoint: {}", rollback_err);
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::store::test_conn;

    fn count_users(conn: &Connection) -> i64 {
        conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))
            .unwrap()
    }

    fn insert_user(conn: &Connection, id: i64) -> Result<()> {
        conn.execute(
            "INSERT INTO users (user_id, username, ctime) VALUES (?1, ?2, ?3)",
            rusqlite::params![id, format!("user-{id}"), "2024-01-01T00:00:00.000000Z"],
        )?;
        Ok(())
    }

    #[test]
    fn test_commit_on_success() {
        let conn = test_conn();
        isolate(&conn, |tx| insert_user(tx, 1)).unwrap();
        assert_eq!(count_users(&conn), 1);
    }

    #[test]
    fn test_rollback_on_error() {
        let conn = test_conn();
        let result: Result<()> = isolate(&conn, |tx| {
            insert_user(tx, 1)?;
            Err(Error::Conflict("abort".into()))
        });
        assert!(result.is_err());
        assert_eq!(count_users(&conn), 0);
    }

    #[test]
    fn test_inner_failure_keeps_outer_writes() {
        let conn = test_conn();
        isolate(&conn, |tx| {
            insert_user(tx, 1)?;
            let inner: Result<()> = isolate(tx, |inner_tx| {
                insert_user(inner_tx, 2)?;
                Err(Error::Conflict("inner abort".into()))
            });
            assert!(inner.is_err());
            Ok(())
        })
        .unwrap();
        // Outer scope committed, inner rolled back.
        assert_eq!(count_users(&conn), 1);
    }

    #[test]
    fn test_outer_failure_discards_inner_success() {
        let conn = test_conn();
        let result: Result<()> = isolate(&conn, |tx| {
            isolate(tx, |inner_tx| insert_user(inner_tx, 1))?;
            Err(Error::Conflict("outer abort".into()))
        });
        assert!(result.is_err());
        assert_eq!(count_users(&conn), 0);
    }
}
