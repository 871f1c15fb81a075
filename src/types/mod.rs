mod access;
mod models;

pub use access::{AccessLevel, Subject};
pub use models::*;

/// Name of the primary structured document of every scene. A scene must
/// never lose a live version of this file.
pub const SCENE_DOCUMENT: &str = "scene.svx.json";

/// Mime type of the primary structured document.
pub const DOCUMENT_MIME: &str = "application/si-dpo-3d.document+json";

/// Mime type marking folder placeholder entries in the version log.
pub const FOLDER_MIME: &str = "text/directory";

/// Sentinel stored in the hash column of folder entries. Folders carry no
/// content object.
pub const FOLDER_HASH: &str = "directory";
