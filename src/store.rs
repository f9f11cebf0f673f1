//! Content-addressed blob store.
//!
//! The store owns one record per distinct content digest. Peers hold
//! counted references ([`Rc`] clones) to blob records; the store keeps the
//! one owning copy in its table. A blob whose last outside reference is
//! released is removed from the table, closing its descriptor exactly once
//! via `OwnedFd` drop.

use rustix::fd::{AsFd, BorrowedFd, OwnedFd};
use std::collections::HashMap;
use std::rc::Rc;
use tracing::debug;

/// One deduplicated blob: a sealed read-only descriptor keyed by the
/// lowercase hex SHA-256 of its content.
pub struct Blob {
    digest: String,
    len: u64,
    fd: OwnedFd,
}

impl Blob {
    /// The content digest this blob is stored under.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Content length in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether the blob is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Borrow the canonical sealed descriptor.
    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// Table of live blobs keyed by content digest.
#[derive(Default)]
pub struct BlobStore {
    blobs: HashMap<String, Rc<Blob>>,
    real_size: u64,
}

impl BlobStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a blob by digest, taking a new counted reference on hit.
    pub fn lookup(&self, digest: &str) -> Option<Rc<Blob>> {
        self.blobs.get(digest).map(Rc::clone)
    }

    /// Insert a new blob under `digest`, taking ownership of `fd`.
    ///
    /// The digest must not already be present (callers look up first).
    /// The blob's length is read from the descriptor; a failing `fstat`
    /// records a zero length rather than failing the insert.
    pub fn insert(&mut self, fd: OwnedFd, digest: String) -> Rc<Blob> {
        debug_assert!(!self.blobs.contains_key(&digest));

        let len = rustix::fs::fstat(&fd).map(|st| st.st_size as u64).unwrap_or(0);
        let blob = Rc::new(Blob {
            digest: digest.clone(),
            len,
            fd,
        });

        self.real_size += len;
        self.blobs.insert(digest, Rc::clone(&blob));

        debug!(digest = %blob.digest, len, "created new blob");
        blob
    }

    /// Release one counted reference to `blob`.
    ///
    /// When no outside reference remains the blob is removed from the
    /// table and its descriptor closed.
    pub fn release(&mut self, blob: Rc<Blob>) {
        let digest = blob.digest.clone();
        let len = blob.len;
        drop(blob);

        let last = self
            .blobs
            .get(&digest)
            .is_some_and(|owned| Rc::strong_count(owned) == 1);
        if last {
            self.blobs.remove(&digest);
            self.real_size -= len;
            debug!(digest = %digest, "blob destroyed");
        }
    }

    /// Number of outside references currently held to `digest`.
    pub fn refcount(&self, digest: &str) -> Option<usize> {
        self.blobs.get(digest).map(|b| Rc::strong_count(b) - 1)
    }

    /// Number of live blobs.
    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    /// Whether the store holds no blobs.
    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    /// Sum of `len` over live blobs.
    pub fn real_size(&self) -> u64 {
        self.real_size
    }

    /// Iterate over the live blobs.
    pub fn iter(&self) -> impl Iterator<Item = &Rc<Blob>> {
        self.blobs.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sealed::{digest_fd, SealedMemfd};

    fn sealed(data: &[u8]) -> (OwnedFd, String) {
        let memfd = SealedMemfd::for_bytes(data).unwrap();
        let digest = digest_fd(&memfd).unwrap();
        (memfd.into_fd(), digest)
    }

    #[test]
    fn test_insert_then_lookup() {
        let mut store = BlobStore::new();
        let (fd, digest) = sealed(b"some bytes");

        let blob = store.insert(fd, digest.clone());
        assert_eq!(blob.len(), 10);
        assert_eq!(store.real_size(), 10);
        assert_eq!(store.refcount(&digest), Some(1));

        let again = store.lookup(&digest).unwrap();
        assert_eq!(store.refcount(&digest), Some(2));
        assert!(Rc::ptr_eq(&blob, &again));
    }

    #[test]
    fn test_lookup_miss() {
        let store = BlobStore::new();
        assert!(store.lookup("no such digest").is_none());
    }

    #[test]
    fn test_release_destroys_at_zero() {
        let mut store = BlobStore::new();
        let (fd, digest) = sealed(b"short-lived");

        let blob = store.insert(fd, digest.clone());
        let second = store.lookup(&digest).unwrap();

        store.release(blob);
        assert_eq!(store.len(), 1);
        assert_eq!(store.refcount(&digest), Some(1));
        assert_eq!(store.real_size(), 11);

        store.release(second);
        assert!(store.is_empty());
        assert_eq!(store.real_size(), 0);
        assert!(store.lookup(&digest).is_none());
    }

    #[test]
    fn test_stored_key_matches_content_hash() {
        let mut store = BlobStore::new();
        let (fd, digest) = sealed(b"hash me again");
        store.insert(fd, digest.clone());

        let blob = store.lookup(&digest).unwrap();
        assert_eq!(digest_fd(blob.fd()).unwrap(), digest);
        store.release(blob);
    }

    #[test]
    fn test_zero_length_blob() {
        let mut store = BlobStore::new();
        let (fd, digest) = sealed(b"");

        let blob = store.insert(fd, digest);
        assert!(blob.is_empty());
        assert_eq!(store.real_size(), 0);
        assert_eq!(store.len(), 1);
    }
}
