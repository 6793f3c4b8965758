use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tempfile::NamedTempFile;

use super::{CasError, Digest, FileStore, Result};

/// Filesystem-backed content-addressed store with git-style 2-char sharding.
///
/// Layout: `<root>/objects/<first 2 hex chars>/<remaining hex chars>`
///
/// Writes go through a temp file in the shard directory followed by a rename,
/// so concurrent `put`s of identical bytes never expose a partial blob.
#[derive(Debug, Clone)]
pub struct FsFileStore {
    objects_dir: PathBuf,
}

impl FsFileStore {
    /// Create a new `FsFileStore` rooted at `root`. Creates `root/objects/` if needed.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let objects_dir = root.as_ref().join("objects");
        std::fs::create_dir_all(&objects_dir)?;
        Ok(Self { objects_dir })
    }

    fn blob_path(&self, digest: &Digest) -> PathBuf {
        let hex = digest.to_hex();
        self.objects_dir.join(&hex[..2]).join(&hex[2..])
    }

    fn put_blocking(path: PathBuf, data: Vec<u8>) -> Result<()> {
        if path.exists() {
            return Ok(());
        }
        let Some(shard_dir) = path.parent() else {
            return Err(CasError::Io(std::io::Error::other("blob path has no parent")));
        };
        std::fs::create_dir_all(shard_dir)?;

        let mut tmp = NamedTempFile::new_in(shard_dir)?;
        tmp.write_all(&data)?;
        tmp.persist(&path).map_err(|e| e.error)?;
        Ok(())
    }
}

#[async_trait]
impl FileStore for FsFileStore {
    async fn put(&self, data: &[u8]) -> Result<Digest> {
        let digest = Digest::compute(data);
        let path = self.blob_path(&digest);
        let data = data.to_vec();

        tokio::task::spawn_blocking(move || Self::put_blocking(path, data))
            .await
            .map_err(|e| CasError::Io(std::io::Error::other(e)))??;

        crate::metrics::METRICS.inc_blobs_stored();
        Ok(digest)
    }

    async fn get(&self, digest: &Digest) -> Result<Vec<u8>> {
        let path = self.blob_path(digest);
        tokio::fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CasError::NotFound(*digest)
            } else {
                CasError::Io(e)
            }
        })
    }

    async fn exists(&self, digest: &Digest) -> Result<bool> {
        let path = self.blob_path(digest);
        Ok(tokio::fs::try_exists(&path).await?)
    }
}
