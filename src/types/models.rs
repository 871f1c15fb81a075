use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::AccessLevel;

/// Identifies a scene either by its random id or by its unique name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SceneRef<'a> {
    Id(i64),
    Name(&'a str),
}

impl From<i64> for SceneRef<'_> {
    fn from(id: i64) -> Self {
        Self::Id(id)
    }
}

impl<'a> From<&'a str> for SceneRef<'a> {
    fn from(name: &'a str) -> Self {
        Self::Name(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scene {
    pub id: i64,
    pub name: String,
    pub ctime: DateTime<Utc>,
    /// Time of the most recent live file version, falling back to `ctime`
    /// for empty scenes.
    pub mtime: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    pub public_access: AccessLevel,
    pub default_access: AccessLevel,
    /// Effective access of the requester this scene was fetched for.
    /// `None` when fetched without a requester context.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access: Option<AccessLevel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archived: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    pub tags: Vec<String>,
}

/// One immutable row of a scene's version log.
///
/// A version with a null hash is a tombstone: the name is deleted as of
/// `ctime`. The highest generation of a name is its current state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileVersion {
    pub id: i64,
    pub scene_id: i64,
    pub name: String,
    pub mime: String,
    pub generation: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    /// Inline payload for small text content (scene documents). Still
    /// hashed like on-disk objects.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    pub size: i64,
    pub ctime: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author_id: Option<i64>,
}

impl FileVersion {
    /// A name is live when its current version carries content.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.hash.is_some()
    }

    #[must_use]
    pub fn is_folder(&self) -> bool {
        self.mime == super::FOLDER_MIME
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub is_admin: bool,
    pub ctime: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: i64,
    pub name: String,
}

/// One explicit access-control entry on a scene, with the grantee's
/// display name resolved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrantEntry {
    pub subject: super::Subject,
    pub name: String,
    pub level: AccessLevel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagCount {
    pub name: String,
    pub scenes: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderBy {
    #[default]
    Name,
    Ctime,
    Mtime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderDirection {
    #[default]
    Asc,
    Desc,
}

/// Filters for scene listing. Unset values mean "return everything the
/// requester can see".
#[derive(Debug, Clone, Default)]
pub struct SceneQuery {
    /// `None` lists non-archived scenes; `Some(true)` only archived ones.
    pub archived: Option<bool>,
    pub author: Option<i64>,
    pub min_access: Option<AccessLevel>,
    /// Free-text term; results are ranked by relevance when set.
    pub search: Option<String>,
    pub limit: Option<u32>,
    pub offset: u32,
    pub order_by: OrderBy,
    pub direction: OrderDirection,
}

/// Pagination window over a scene's full version history.
#[derive(Debug, Clone, Default)]
pub struct HistoryQuery {
    pub limit: Option<u32>,
    pub offset: u32,
    pub direction: Option<OrderDirection>,
}

/// One entry of a scene's full history, newest first by default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: i64,
    pub name: String,
    pub mime: String,
    pub generation: i64,
    pub size: i64,
    pub ctime: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author_id: Option<i64>,
}
