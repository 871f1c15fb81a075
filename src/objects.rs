use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Content-addressable blob store.
///
/// Objects are keyed by the lowercase hex sha256 of their bytes and are
/// immutable once published: writers stream into a uniquely named upload
/// file, then atomically publish it under the hash name. Partial writes
/// never exist inside the addressable namespace.
pub struct ObjectStore {
    objects_dir: PathBuf,
    uploads_dir: PathBuf,
}

/// A fully received upload, hashed but not yet published. Dropping it
/// removes the staging file, so an abandoned upload (error or client
/// disconnect) leaves nothing behind.
pub struct StagedObject {
    hash: String,
    size: i64,
    path: PathBuf,
}

impl StagedObject {
    #[must_use]
    pub fn hash(&self) -> &str {
        &self.hash
    }

    #[must_use]
    pub fn size(&self) -> i64 {
        self.size
    }
}

impl Drop for StagedObject {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("failed to remove staged upload {:?}: {}", self.path, e);
            }
        }
    }
}

impl ObjectStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            objects_dir: data_dir.join("objects"),
            uploads_dir: data_dir.join("uploads"),
        }
    }

    pub fn init(&self) -> Result<()> {
        std::fs::create_dir_all(&self.objects_dir)?;
        std::fs::create_dir_all(&self.uploads_dir)?;
        Ok(())
    }

    fn object_path(&self, hash: &str) -> Result<PathBuf> {
        validate_hash(hash)?;
        let prefix1 = &hash[0..2];
        let prefix2 = &hash[2..4];
        Ok(self.objects_dir.join(prefix1).join(prefix2).join(hash))
    }

    /// Streams a reader to a staging file, hashing as bytes arrive.
    /// Nothing is visible under the hash namespace until [`publish`] runs.
    ///
    /// [`publish`]: Self::publish
    pub async fn stage<R: AsyncRead + Unpin>(&self, mut reader: R) -> Result<StagedObject> {
        fs::create_dir_all(&self.uploads_dir).await?;
        let mut staged = StagedObject {
            hash: String::new(),
            size: 0,
            path: self.uploads_dir.join(Uuid::new_v4().to_string()),
        };
        let mut file = File::create(&staged.path).await?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            file.write_all(&buf[..n]).await?;
            staged.size += n as i64;
        }
        file.sync_all().await?;
        staged.hash = hex::encode(hasher.finalize());
        Ok(staged)
    }

    /// Atomically publishes a staged upload under its hash name.
    ///
    /// An existing destination is success: content is immutable, so the same
    /// hash already holds the same bytes. Synchronous so callers can run it
    /// between the version-row insert and the hash attach of the enclosing
    /// transaction.
    pub fn publish(&self, staged: &StagedObject) -> Result<()> {
        let dest = self.object_path(&staged.hash)?;
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match std::fs::hard_link(&staged.path, &dest) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    pub async fn exists(&self, hash: &str) -> Result<bool> {
        let path = self.object_path(hash)?;
        Ok(fs::try_exists(&path).await?)
    }

    pub async fn size(&self, hash: &str) -> Result<i64> {
        let path = self.object_path(hash)?;
        let metadata = fs::metadata(&path).await.map_err(Error::from_io)?;
        Ok(metadata.len() as i64)
    }

    /// Opens an object for reading. Objects are immutable, so concurrent
    /// readers need no synchronization; the caller owns the handle and
    /// releases it by dropping.
    pub async fn open(&self, hash: &str) -> Result<File> {
        let path = self.object_path(hash)?;
        File::open(&path).await.map_err(Error::from_io)
    }
}

fn validate_hash(hash: &str) -> Result<()> {
    let valid = hash.len() == 64
        && hash
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase());
    if valid {
        Ok(())
    } else {
        Err(Error::BadRequest(format!("invalid content hash: {hash}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, ObjectStore) {
        let temp = TempDir::new().unwrap();
        let store = ObjectStore::new(temp.path());
        store.init().unwrap();
        (temp, store)
    }

    // sha256("123")
    const HASH_123: &str = "a665a45920422f9d417e4867efdc4fb8a04a1f3fff1fa07e998e86f7f7a27ae3";

    #[tokio::test]
    async fn test_stage_and_publish() {
        let (_temp, store) = store();

        let staged = store.stage(&b"123"[..]).await.unwrap();
        assert_eq!(staged.hash(), HASH_123);
        assert_eq!(staged.size(), 3);
        assert!(!store.exists(HASH_123).await.unwrap());

        store.publish(&staged).unwrap();
        assert!(store.exists(HASH_123).await.unwrap());
        assert_eq!(store.size(HASH_123).await.unwrap(), 3);

        let mut content = Vec::new();
        let mut file = store.open(HASH_123).await.unwrap();
        file.read_to_end(&mut content).await.unwrap();
        assert_eq!(content, b"123");
    }

    #[tokio::test]
    async fn test_publish_existing_is_success() {
        let (_temp, store) = store();

        let first = store.stage(&b"123"[..]).await.unwrap();
        store.publish(&first).unwrap();

        let second = store.stage(&b"123"[..]).await.unwrap();
        assert_eq!(second.hash(), first.hash());
        store.publish(&second).unwrap();
        assert_eq!(store.size(HASH_123).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_drop_removes_staging_file() {
        let (temp, store) = store();

        let staged = store.stage(&b"abc"[..]).await.unwrap();
        let path = staged.path.clone();
        assert!(path.exists());
        drop(staged);
        assert!(!path.exists());
        // The uploads dir holds nothing else either.
        let left = std::fs::read_dir(temp.path().join("uploads")).unwrap().count();
        assert_eq!(left, 0);
    }

    #[tokio::test]
    async fn test_invalid_hash_rejected() {
        let (_temp, store) = store();
        assert!(matches!(
            store.exists("short").await,
            Err(Error::BadRequest(_))
        ));
        let upper = HASH_123.to_uppercase();
        assert!(matches!(
            store.open(&upper).await,
            Err(Error::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_open_missing_is_not_found() {
        let (_temp, store) = store();
        assert!(matches!(store.open(HASH_123).await, Err(Error::NotFound)));
        assert!(matches!(store.size(HASH_123).await, Err(Error::NotFound)));
    }
}
