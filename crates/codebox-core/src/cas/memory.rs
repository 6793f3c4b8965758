//! In-memory file store, for tests and the local development backend.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{CasError, Digest, FileStore, Result};

/// In-memory content-addressed store backed by a `HashMap<Digest, bytes>`.
#[derive(Debug, Default)]
pub struct MemoryFileStore {
    blobs: Mutex<HashMap<Digest, Vec<u8>>>,
}

impl MemoryFileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct blobs held.
    pub fn len(&self) -> usize {
        self.blobs.lock().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned() -> CasError {
    CasError::Io(std::io::Error::other("memory store lock poisoned"))
}

#[async_trait]
impl FileStore for MemoryFileStore {
    async fn put(&self, data: &[u8]) -> Result<Digest> {
        let digest = Digest::compute(data);
        let mut blobs = self.blobs.lock().map_err(|_| poisoned())?;
        blobs.entry(digest).or_insert_with(|| data.to_vec());
        Ok(digest)
    }

    async fn get(&self, digest: &Digest) -> Result<Vec<u8>> {
        let blobs = self.blobs.lock().map_err(|_| poisoned())?;
        blobs.get(digest).cloned().ok_or(CasError::NotFound(*digest))
    }

    async fn exists(&self, digest: &Digest) -> Result<bool> {
        let blobs = self.blobs.lock().map_err(|_| poisoned())?;
        Ok(blobs.contains_key(digest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_twice_stores_once() {
        let store = MemoryFileStore::new();
        let a = store.put(b"same").await.unwrap();
        let b = store.put(b"same").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&a).await.unwrap(), b"same");
    }

    #[tokio::test]
    async fn unknown_digest_is_not_found() {
        let store = MemoryFileStore::new();
        let d = Digest::compute(b"nope");
        assert!(matches!(store.get(&d).await, Err(CasError::NotFound(_))));
    }
}
