//! The vault facade: one handle tying together the scene directory, the
//! version log, the content store and the access resolver. Every public
//! operation takes the requester's identity and applies access control
//! before touching anything.

mod restore;

use std::io::SeekFrom;
use std::sync::{Mutex, MutexGuard};

use rusqlite::Connection;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt};

pub use restore::RestoreTarget;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::objects::ObjectStore;
use crate::store::{self, access, files, scenes, tags, txn, users};
use crate::types::{
    AccessLevel, DOCUMENT_MIME, FileVersion, GrantEntry, Group, HistoryEntry, HistoryQuery,
    SCENE_DOCUMENT, Scene, SceneQuery, SceneRef, Subject, TagCount, User,
};

/// Streamed file content handed out by read operations. The caller owns
/// the handle and releases it by dropping.
pub type FileReader = Box<dyn AsyncRead + Send + Unpin>;

pub struct SceneVault {
    conn: Mutex<Connection>,
    objects: ObjectStore,
}

impl SceneVault {
    /// Opens (or creates) a vault under `config.data_dir`.
    pub fn open(config: &Config) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let objects = ObjectStore::new(&config.data_dir);
        objects.init()?;
        let conn = store::open(config.db_path())?;
        tracing::info!("opened vault at {:?}", config.data_dir);
        Ok(Self {
            conn: Mutex::new(conn),
            objects,
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ----- scenes -----

    pub fn create_scene(&self, name: &str, author_id: Option<i64>) -> Result<Scene> {
        let conn = self.conn();
        let scene_id = txn::isolate(&conn, |conn| scenes::create(conn, name, author_id))?;
        tracing::info!(scene_id, name, "created scene");
        scenes::peek(&conn, scene_id.into())
    }

    pub fn get_scene(&self, scene: SceneRef<'_>, requester: Option<i64>) -> Result<Scene> {
        scenes::get(&self.conn(), scene, requester)
    }

    pub fn list_scenes(&self, requester: Option<i64>, query: &SceneQuery) -> Result<Vec<Scene>> {
        scenes::list(&self.conn(), requester, query)
    }

    pub fn archive_scene(&self, scene: SceneRef<'_>, requester: Option<i64>) -> Result<()> {
        let conn = self.conn();
        let scene_id = scenes::resolve(&conn, scene)?;
        access::check(&conn, scene_id, requester, AccessLevel::Admin)?;
        txn::isolate(&conn, |conn| scenes::archive(conn, scene_id.into()))?;
        tracing::info!(scene_id, "archived scene");
        Ok(())
    }

    pub fn unarchive_scene(
        &self,
        scene: SceneRef<'_>,
        new_name: Option<&str>,
        requester: Option<i64>,
    ) -> Result<()> {
        let conn = self.conn();
        let scene_id = scenes::resolve(&conn, scene)?;
        access::check(&conn, scene_id, requester, AccessLevel::Admin)?;
        txn::isolate(&conn, |conn| scenes::unarchive(conn, scene_id.into(), new_name))?;
        tracing::info!(scene_id, "unarchived scene");
        Ok(())
    }

    pub fn rename_scene(
        &self,
        scene: SceneRef<'_>,
        new_name: &str,
        requester: Option<i64>,
    ) -> Result<()> {
        let conn = self.conn();
        let scene_id = scenes::resolve(&conn, scene)?;
        access::check(&conn, scene_id, requester, AccessLevel::Admin)?;
        txn::isolate(&conn, |conn| scenes::rename(conn, scene_id.into(), new_name))
    }

    /// Hard-delete, reserved for global administrators. Version history
    /// and grants go with the scene; published objects stay.
    pub fn remove_scene(&self, scene: SceneRef<'_>, requester: Option<i64>) -> Result<()> {
        let conn = self.conn();
        self.require_global_admin(&conn, requester)?;
        let scene_id = scenes::resolve(&conn, scene)?;
        txn::isolate(&conn, |conn| scenes::remove(conn, scene_id.into()))?;
        tracing::warn!(scene_id, "permanently removed scene");
        Ok(())
    }

    fn require_global_admin(&self, conn: &Connection, requester: Option<i64>) -> Result<i64> {
        let user_id = requester.ok_or(Error::Unauthorized)?;
        let user = users::get(conn, user_id).map_err(|_| Error::Unauthorized)?;
        if !user.is_admin {
            return Err(Error::Unauthorized);
        }
        Ok(user_id)
    }

    // ----- file content -----

    /// Streams content in, then records it as the next version of `name`.
    /// The version row starts hashless and only points at the object once
    /// it is durably published, so an interrupted upload can never leave a
    /// live version referencing missing bytes.
    pub async fn write_file<R: AsyncRead + Unpin>(
        &self,
        scene: SceneRef<'_>,
        name: &str,
        mime: &str,
        requester: Option<i64>,
        reader: R,
    ) -> Result<FileVersion> {
        validate_file_name(name)?;
        reject_document_name(name)?;
        let scene_id = {
            let conn = self.conn();
            let scene_id = scenes::resolve(&conn, scene)?;
            access::check(&conn, scene_id, requester, AccessLevel::Write)?;
            scene_id
        };

        // Stage outside the lock: uploads are slow and touch no state.
        let staged = self.objects.stage(reader).await?;

        let conn = self.conn();
        // Re-resolve: the scene may have been removed while streaming.
        scenes::resolve(&conn, scene_id.into())?;
        let version = txn::isolate(&conn, |conn| {
            let pending = files::append(
                conn,
                scene_id,
                name,
                &files::NewVersion {
                    hash: None,
                    data: None,
                    size: staged.size(),
                    mime,
                    author_id: requester,
                },
            )?;
            self.objects.publish(&staged)?;
            files::attach_hash(conn, pending.id, staged.hash(), staged.size())?;
            Ok(FileVersion {
                hash: Some(staged.hash().to_string()),
                ..pending
            })
        })?;
        tracing::debug!(scene_id, name, generation = version.generation, "wrote file");
        Ok(version)
    }

    /// Opens the current content of `name` for streaming.
    pub async fn read_file(
        &self,
        scene: SceneRef<'_>,
        name: &str,
        requester: Option<i64>,
    ) -> Result<(FileVersion, FileReader)> {
        self.read_file_range(scene, name, requester, 0, None).await
    }

    /// Like [`read_file`](Self::read_file), limited to `length` bytes from
    /// `offset`. A window beyond the end yields an empty stream.
    pub async fn read_file_range(
        &self,
        scene: SceneRef<'_>,
        name: &str,
        requester: Option<i64>,
        offset: u64,
        length: Option<u64>,
    ) -> Result<(FileVersion, FileReader)> {
        let version = {
            let conn = self.conn();
            let scene_id = scenes::resolve(&conn, scene)?;
            access::check(&conn, scene_id, requester, AccessLevel::Read)?;
            files::current(&conn, scene_id, name, false)?
        };
        if version.is_folder() {
            return Err(Error::BadRequest(format!("{name} is a folder")));
        }

        if let Some(data) = &version.data {
            let bytes = data.as_bytes();
            let start = (offset as usize).min(bytes.len());
            let end = match length {
                Some(length) => (start + length as usize).min(bytes.len()),
                None => bytes.len(),
            };
            let window = bytes[start..end].to_vec();
            return Ok((version, Box::new(std::io::Cursor::new(window))));
        }

        let hash = version
            .hash
            .as_deref()
            .ok_or_else(|| Error::Internal(format!("live version of {name} has no hash")))?;
        let mut file = self.objects.open(hash).await?;
        if offset > 0 {
            file.seek(SeekFrom::Start(offset)).await?;
        }
        let reader: FileReader = match length {
            Some(length) => Box::new(file.take(length)),
            None => Box::new(file),
        };
        Ok((version, reader))
    }

    pub fn remove_file(
        &self,
        scene: SceneRef<'_>,
        name: &str,
        requester: Option<i64>,
    ) -> Result<FileVersion> {
        let conn = self.conn();
        let scene_id = scenes::resolve(&conn, scene)?;
        access::check(&conn, scene_id, requester, AccessLevel::Write)?;
        txn::isolate(&conn, |conn| files::remove(conn, scene_id, name, requester))
    }

    pub fn rename_file(
        &self,
        scene: SceneRef<'_>,
        name: &str,
        next_name: &str,
        requester: Option<i64>,
    ) -> Result<FileVersion> {
        validate_file_name(next_name)?;
        reject_document_name(next_name)?;
        let conn = self.conn();
        let scene_id = scenes::resolve(&conn, scene)?;
        access::check(&conn, scene_id, requester, AccessLevel::Write)?;
        txn::isolate(&conn, |conn| {
            files::rename(conn, scene_id, name, next_name, requester)
        })
    }

    pub fn list_files(
        &self,
        scene: SceneRef<'_>,
        requester: Option<i64>,
        opts: files::ListOptions,
    ) -> Result<Vec<FileVersion>> {
        let conn = self.conn();
        let scene_id = scenes::resolve(&conn, scene)?;
        access::check(&conn, scene_id, requester, AccessLevel::Read)?;
        files::list_current(&conn, scene_id, opts)
    }

    pub fn file_history(
        &self,
        scene: SceneRef<'_>,
        name: &str,
        requester: Option<i64>,
    ) -> Result<Vec<FileVersion>> {
        let conn = self.conn();
        let scene_id = scenes::resolve(&conn, scene)?;
        access::check(&conn, scene_id, requester, AccessLevel::Read)?;
        files::history(&conn, scene_id, name)
    }

    pub fn scene_history(
        &self,
        scene: SceneRef<'_>,
        requester: Option<i64>,
        query: &HistoryQuery,
    ) -> Result<Vec<HistoryEntry>> {
        let conn = self.conn();
        let scene_id = scenes::resolve(&conn, scene)?;
        access::check(&conn, scene_id, requester, AccessLevel::Read)?;
        files::scene_history(&conn, scene_id, query)
    }

    // ----- documents and folders -----

    /// Writes the primary document. Documents are small structured text,
    /// stored inline next to their hash rather than in the object store.
    pub fn write_document(
        &self,
        scene: SceneRef<'_>,
        data: &str,
        requester: Option<i64>,
    ) -> Result<FileVersion> {
        if serde_json::from_str::<serde_json::Value>(data).is_err() {
            return Err(Error::BadRequest(
                "document is not valid JSON".to_string(),
            ));
        }
        let hash = hex::encode(Sha256::digest(data.as_bytes()));

        let conn = self.conn();
        let scene_id = scenes::resolve(&conn, scene)?;
        access::check(&conn, scene_id, requester, AccessLevel::Write)?;
        txn::isolate(&conn, |conn| {
            files::append(
                conn,
                scene_id,
                SCENE_DOCUMENT,
                &files::NewVersion {
                    hash: Some(&hash),
                    data: Some(data),
                    size: data.len() as i64,
                    mime: DOCUMENT_MIME,
                    author_id: requester,
                },
            )
        })
    }

    pub fn read_document(&self, scene: SceneRef<'_>, requester: Option<i64>) -> Result<String> {
        let conn = self.conn();
        let scene_id = scenes::resolve(&conn, scene)?;
        access::check(&conn, scene_id, requester, AccessLevel::Read)?;
        let version = files::current(&conn, scene_id, SCENE_DOCUMENT, false)?;
        version.data.ok_or_else(|| {
            Error::Internal(format!("document {} has no inline data", version.id))
        })
    }

    pub fn create_folder(
        &self,
        scene: SceneRef<'_>,
        name: &str,
        requester: Option<i64>,
    ) -> Result<FileVersion> {
        let conn = self.conn();
        let scene_id = scenes::resolve(&conn, scene)?;
        access::check(&conn, scene_id, requester, AccessLevel::Write)?;
        txn::isolate(&conn, |conn| {
            files::create_folder(conn, scene_id, name, requester)
        })
    }

    /// Removes a folder and everything under it, atomically.
    pub fn remove_folder(
        &self,
        scene: SceneRef<'_>,
        name: &str,
        requester: Option<i64>,
    ) -> Result<Vec<String>> {
        let conn = self.conn();
        let scene_id = scenes::resolve(&conn, scene)?;
        access::check(&conn, scene_id, requester, AccessLevel::Write)?;
        txn::isolate(&conn, |conn| {
            files::remove_folder(conn, scene_id, name, requester)
        })
    }

    pub fn list_folders(
        &self,
        scene: SceneRef<'_>,
        requester: Option<i64>,
    ) -> Result<Vec<FileVersion>> {
        let conn = self.conn();
        let scene_id = scenes::resolve(&conn, scene)?;
        access::check(&conn, scene_id, requester, AccessLevel::Read)?;
        files::list_folders(&conn, scene_id)
    }

    // ----- access management -----

    pub fn effective_access(
        &self,
        scene: SceneRef<'_>,
        requester: Option<i64>,
    ) -> Result<AccessLevel> {
        let conn = self.conn();
        let scene_id = scenes::resolve(&conn, scene)?;
        access::effective_access(&conn, scene_id, requester)
    }

    pub fn grant(
        &self,
        scene: SceneRef<'_>,
        subject: Subject,
        level: Option<AccessLevel>,
        requester: Option<i64>,
    ) -> Result<()> {
        let conn = self.conn();
        let scene_id = scenes::resolve(&conn, scene)?;
        access::check(&conn, scene_id, requester, AccessLevel::Admin)?;
        txn::isolate(&conn, |conn| access::grant(conn, scene_id, subject, level))
    }

    pub fn list_grants(
        &self,
        scene: SceneRef<'_>,
        requester: Option<i64>,
    ) -> Result<Vec<GrantEntry>> {
        let conn = self.conn();
        let scene_id = scenes::resolve(&conn, scene)?;
        access::check(&conn, scene_id, requester, AccessLevel::Admin)?;
        access::list_grants(&conn, scene_id)
    }

    pub fn set_public_access(
        &self,
        scene: SceneRef<'_>,
        level: AccessLevel,
        requester: Option<i64>,
    ) -> Result<()> {
        let conn = self.conn();
        let scene_id = scenes::resolve(&conn, scene)?;
        access::check(&conn, scene_id, requester, AccessLevel::Admin)?;
        access::set_public_access(&conn, scene_id, level)
    }

    pub fn set_default_access(
        &self,
        scene: SceneRef<'_>,
        level: AccessLevel,
        requester: Option<i64>,
    ) -> Result<()> {
        let conn = self.conn();
        let scene_id = scenes::resolve(&conn, scene)?;
        access::check(&conn, scene_id, requester, AccessLevel::Admin)?;
        access::set_default_access(&conn, scene_id, level)
    }

    // ----- restore -----

    /// Restores a scene to the instant `target` was written. Requires
    /// admin on the scene; reconciliation and the compensating appends
    /// run as one transaction.
    pub fn restore(
        &self,
        scene: SceneRef<'_>,
        target: RestoreTarget<'_>,
        requester: Option<i64>,
    ) -> Result<Vec<String>> {
        let conn = self.conn();
        let scene_id = scenes::resolve(&conn, scene)?;
        access::check(&conn, scene_id, requester, AccessLevel::Admin)?;
        let changed = txn::isolate(&conn, |conn| {
            restore::run(conn, scene_id, target, requester)
        })?;
        tracing::info!(scene_id, changed = changed.len(), "restored scene");
        Ok(changed)
    }

    // ----- users, groups, tags -----

    pub fn create_user(&self, username: &str, is_admin: bool) -> Result<User> {
        let conn = self.conn();
        let user_id = txn::isolate(&conn, |conn| users::create(conn, username, is_admin))?;
        users::get(&conn, user_id)
    }

    pub fn get_user(&self, user_id: i64) -> Result<User> {
        users::get(&self.conn(), user_id)
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<User> {
        users::get_by_username(&self.conn(), username)
    }

    pub fn list_users(&self) -> Result<Vec<User>> {
        users::list(&self.conn())
    }

    pub fn remove_user(&self, user_id: i64) -> Result<()> {
        users::remove(&self.conn(), user_id)
    }

    pub fn set_user_admin(&self, user_id: i64, is_admin: bool) -> Result<()> {
        users::set_admin(&self.conn(), user_id, is_admin)
    }

    pub fn create_group(&self, name: &str) -> Result<i64> {
        users::create_group(&self.conn(), name)
    }

    pub fn remove_group(&self, group_id: i64) -> Result<()> {
        users::remove_group(&self.conn(), group_id)
    }

    pub fn list_groups(&self) -> Result<Vec<Group>> {
        users::list_groups(&self.conn())
    }

    pub fn add_group_member(&self, group_id: i64, user_id: i64) -> Result<()> {
        users::add_member(&self.conn(), group_id, user_id)
    }

    pub fn remove_group_member(&self, group_id: i64, user_id: i64) -> Result<()> {
        users::remove_member(&self.conn(), group_id, user_id)
    }

    pub fn group_members(&self, group_id: i64) -> Result<Vec<User>> {
        users::group_members(&self.conn(), group_id)
    }

    pub fn add_tag(&self, scene: SceneRef<'_>, tag: &str, requester: Option<i64>) -> Result<bool> {
        let conn = self.conn();
        let scene_id = scenes::resolve(&conn, scene)?;
        access::check(&conn, scene_id, requester, AccessLevel::Write)?;
        tags::add(&conn, scene_id, tag)
    }

    pub fn remove_tag(
        &self,
        scene: SceneRef<'_>,
        tag: &str,
        requester: Option<i64>,
    ) -> Result<bool> {
        let conn = self.conn();
        let scene_id = scenes::resolve(&conn, scene)?;
        access::check(&conn, scene_id, requester, AccessLevel::Write)?;
        tags::remove(&conn, scene_id, tag)
    }

    pub fn list_tags(&self, prefix: Option<&str>) -> Result<Vec<TagCount>> {
        tags::list(&self.conn(), prefix)
    }

    pub fn scenes_with_tag(&self, tag: &str, requester: Option<i64>) -> Result<Vec<Scene>> {
        tags::scenes_with_tag(&self.conn(), tag, requester)
    }
}

/// The primary document is inline text with invariants of its own; it
/// only ever goes through [`SceneVault::write_document`], so a live
/// version of it always carries inline data.
fn reject_document_name(name: &str) -> Result<()> {
    if name == SCENE_DOCUMENT {
        return Err(Error::BadRequest(format!(
            "{SCENE_DOCUMENT} is written through write_document"
        )));
    }
    Ok(())
}

/// File names are scene-relative paths. Absolute paths, traversal steps
/// and the folder sentinel shape are all rejected up front.
fn validate_file_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 1024 {
        return Err(Error::BadRequest("invalid file name".to_string()));
    }
    if name.starts_with('/') || name.ends_with('/') {
        return Err(Error::BadRequest(format!(
            "file names must be relative: {name}"
        )));
    }
    if name.split('/').any(|part| part.is_empty() || part == "." || part == "..") {
        return Err(Error::BadRequest(format!("invalid file name: {name}")));
    }
    Ok(())
}
