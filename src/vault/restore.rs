//! Point-in-time restore: replays a scene back to the instant a chosen
//! version was written, by appending compensating versions rather than
//! rewriting history.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rusqlite::Connection;

use crate::error::{Error, Result};
use crate::store::files;
use crate::types::{FileVersion, SCENE_DOCUMENT};

/// Identifies the instant to restore to: a version row, directly by id
/// or as a (name, generation) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreTarget<'a> {
    Version(i64),
    Generation { name: &'a str, generation: i64 },
}

/// Runs the restore against an already-authorized scene. Must be called
/// inside a transaction scope: the compensating appends are all-or-nothing.
///
/// Returns the names that changed, in name order; an empty list means the
/// scene already matched the target instant.
pub fn run(
    conn: &Connection,
    scene_id: i64,
    target: RestoreTarget<'_>,
    author_id: Option<i64>,
) -> Result<Vec<String>> {
    let reference = resolve_target(conn, scene_id, target)?;
    let plan = reconcile(&files::all_versions(conn, scene_id)?, reference.ctime)?;

    let mut changed = Vec::with_capacity(plan.len());
    for (name, state) in plan {
        match state {
            Step::Reinstate(version) => {
                files::append(
                    conn,
                    scene_id,
                    &name,
                    &files::NewVersion {
                        hash: version.hash.as_deref(),
                        data: version.data.as_deref(),
                        size: version.size,
                        mime: &version.mime,
                        author_id,
                    },
                )?;
            }
            Step::Tombstone { mime } => {
                files::append(
                    conn,
                    scene_id,
                    &name,
                    &files::NewVersion::tombstone(&mime, author_id),
                )?;
            }
        }
        changed.push(name);
    }
    Ok(changed)
}

fn resolve_target(
    conn: &Connection,
    scene_id: i64,
    target: RestoreTarget<'_>,
) -> Result<FileVersion> {
    match target {
        RestoreTarget::Version(id) => {
            if id <= 0 {
                return Err(Error::BadRequest(format!("invalid version id: {id}")));
            }
            // An id matching no row at all is a malformed identifier, not
            // a miss on this scene's history.
            let version = match files::by_id(conn, id) {
                Ok(version) => version,
                Err(Error::NotFound) => {
                    return Err(Error::BadRequest(format!("no version with id {id}")));
                }
                Err(e) => return Err(e),
            };
            // A version id belonging to another scene must read as absent.
            if version.scene_id != scene_id {
                return Err(Error::NotFound);
            }
            Ok(version)
        }
        RestoreTarget::Generation { name, generation } => {
            if name.is_empty() {
                return Err(Error::BadRequest("missing file name".to_string()));
            }
            if generation < 1 {
                return Err(Error::BadRequest(format!(
                    "invalid generation: {generation}"
                )));
            }
            files::at_generation(conn, scene_id, name, generation)
        }
    }
}

enum Step {
    /// Append a copy of this historical version's content reference.
    Reinstate(FileVersion),
    /// The name did not exist at the reference instant; delete it.
    Tombstone { mime: String },
}

/// Compares every name's state at the reference instant against its
/// current state and plans one compensating append per differing name.
/// Pure: performs no writes, so a guard failure leaves nothing behind.
fn reconcile(log: &[FileVersion], reference: DateTime<Utc>) -> Result<BTreeMap<String, Step>> {
    let mut by_name: BTreeMap<&str, Vec<&FileVersion>> = BTreeMap::new();
    for version in log {
        by_name.entry(&version.name).or_default().push(version);
    }

    let mut plan = BTreeMap::new();
    for (name, versions) in by_name {
        // all_versions orders by generation, so the last row ≤ T is the
        // state at T and the last row overall is the current state.
        let then = versions.iter().rev().find(|v| v.ctime <= reference);
        let now = versions.last().ok_or_else(|| {
            Error::Internal(format!("empty version list for {name}"))
        })?;

        let then_content = then.filter(|v| v.is_live()).map(|v| (&v.hash, &v.data));
        let now_content = now_live(now);
        if then_content == now_content {
            continue;
        }

        match then.filter(|v| v.is_live()) {
            Some(version) => {
                plan.insert(name.to_string(), Step::Reinstate((*version).clone()));
            }
            None => {
                if name == SCENE_DOCUMENT {
                    return Err(Error::Conflict(format!(
                        "restore would remove {SCENE_DOCUMENT}"
                    )));
                }
                plan.insert(
                    name.to_string(),
                    Step::Tombstone {
                        mime: now.mime.clone(),
                    },
                );
            }
        }
    }
    Ok(plan)
}

fn now_live(version: &FileVersion) -> Option<(&Option<String>, &Option<String>)> {
    version.is_live().then_some((&version.hash, &version.data))
}
