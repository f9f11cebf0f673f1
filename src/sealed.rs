//! Sealed anonymous memory files.
//!
//! Every blob submitted for deduplication travels as a memfd carrying the
//! full seal set {`SEAL`, `SHRINK`, `GROW`, `WRITE`}. Once sealed, the
//! kernel guarantees the content can never change, which is what makes it
//! safe for the daemon to hash a submission once and key its table on the
//! digest forever after.
//!
//! This module provides the three primitives both halves of the service
//! share: building a sealed memfd from caller bytes, verifying the seal set
//! on a received descriptor, and streaming a descriptor's content into a
//! SHA-256 digest.

use crate::error::{Error, Result};
use rustix::fd::{AsFd, OwnedFd};
use rustix::fs::{MemfdFlags, SealFlags};
use sha2::{Digest, Sha256};
use std::ffi::CString;
use std::sync::atomic::{AtomicU32, Ordering};

/// The seal set required on every submitted descriptor.
pub const REQUIRED_SEALS: SealFlags = SealFlags::SEAL
    .union(SealFlags::SHRINK)
    .union(SealFlags::GROW)
    .union(SealFlags::WRITE);

/// Chunk size for streaming a descriptor into the hasher.
const DIGEST_CHUNK: usize = 64 * 1024;

/// Counter feeding per-process unique memfd names.
static MEMFD_COUNT: AtomicU32 = AtomicU32::new(0);

/// An anonymous in-memory file whose content is immutable.
///
/// Created with close-on-exec and sealing allowed, truncated to the
/// content length, filled, then fully sealed. The descriptor can be
/// passed to the daemon or mapped read-only; nobody can alter the bytes
/// behind either view.
pub struct SealedMemfd {
    fd: OwnedFd,
    len: usize,
}

impl SealedMemfd {
    /// Build a sealed memfd holding a copy of `data`.
    ///
    /// Zero-length contents are legal and produce a sealed empty file.
    ///
    /// # Errors
    ///
    /// Returns an error if `memfd_create`, `ftruncate`, writing, or
    /// sealing fails. On failure the descriptor is closed; nothing leaks.
    pub fn for_bytes(data: &[u8]) -> Result<Self> {
        let count = MEMFD_COUNT.fetch_add(1, Ordering::Relaxed);
        let name = CString::new(format!("unique-{}-{}", std::process::id(), count))
            .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, e)))?;

        let fd = rustix::fs::memfd_create(&name, MemfdFlags::CLOEXEC | MemfdFlags::ALLOW_SEALING)?;

        rustix::fs::ftruncate(&fd, data.len() as u64)?;
        write_all(&fd, data)?;
        rustix::fs::fcntl_add_seals(&fd, REQUIRED_SEALS)?;

        Ok(Self {
            fd,
            len: data.len(),
        })
    }

    /// Length of the sealed content in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the sealed content is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Take ownership of the underlying descriptor.
    pub fn into_fd(self) -> OwnedFd {
        self.fd
    }
}

impl AsFd for SealedMemfd {
    fn as_fd(&self) -> rustix::fd::BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// Verify that `fd` carries the full required seal set.
///
/// # Errors
///
/// Returns [`Error::NotSealed`] if any seal is missing, or the underlying
/// errno if the seal set cannot be queried (e.g. the descriptor is not a
/// memfd).
pub fn require_sealed<Fd: AsFd>(fd: Fd) -> Result<()> {
    let seals = rustix::fs::fcntl_get_seals(fd)?;
    if !seals.contains(REQUIRED_SEALS) {
        return Err(Error::NotSealed);
    }
    Ok(())
}

/// Stream the content behind `fd` into SHA-256 and return the lowercase
/// hex digest.
///
/// Reads positionally from offset 0 to EOF in 64 KiB chunks, so the
/// descriptor's file offset is left untouched.
///
/// # Errors
///
/// Returns an error if any read fails.
pub fn digest_fd<Fd: AsFd>(fd: Fd) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; DIGEST_CHUNK];
    let mut offset: u64 = 0;

    loop {
        let n = match rustix::io::pread(&fd, &mut buf, offset) {
            Ok(n) => n,
            Err(rustix::io::Errno::INTR) => continue,
            Err(e) => return Err(e.into()),
        };
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        offset += n as u64;
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Write the whole of `data` to `fd`, retrying on interrupted writes.
fn write_all<Fd: AsFd>(fd: Fd, mut data: &[u8]) -> Result<()> {
    while !data.is_empty() {
        match rustix::io::write(&fd, data) {
            Ok(n) => data = &data[n..],
            Err(rustix::io::Errno::INTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_bytes_is_fully_sealed() {
        let memfd = SealedMemfd::for_bytes(b"hello sealed world").unwrap();
        assert_eq!(memfd.len(), 18);
        require_sealed(&memfd).unwrap();
    }

    #[test]
    fn test_zero_length_is_legal() {
        let memfd = SealedMemfd::for_bytes(b"").unwrap();
        assert!(memfd.is_empty());
        require_sealed(&memfd).unwrap();
        assert_eq!(
            digest_fd(&memfd).unwrap(),
            // SHA-256 of the empty string.
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_unsealed_memfd_is_rejected() {
        let name = CString::new("unique-test-unsealed").unwrap();
        let fd = rustix::fs::memfd_create(&name, MemfdFlags::CLOEXEC | MemfdFlags::ALLOW_SEALING)
            .unwrap();
        rustix::fs::ftruncate(&fd, 16).unwrap();

        match require_sealed(&fd) {
            Err(Error::NotSealed) => {}
            other => panic!("expected NotSealed, got {other:?}"),
        }
    }

    #[test]
    fn test_partially_sealed_memfd_is_rejected() {
        let name = CString::new("unique-test-partial").unwrap();
        let fd = rustix::fs::memfd_create(&name, MemfdFlags::CLOEXEC | MemfdFlags::ALLOW_SEALING)
            .unwrap();
        rustix::fs::fcntl_add_seals(&fd, SealFlags::SHRINK | SealFlags::GROW).unwrap();

        assert!(matches!(require_sealed(&fd), Err(Error::NotSealed)));
    }

    #[test]
    fn test_digest_matches_in_memory_hash() {
        let data = vec![0xabu8; 200 * 1024]; // spans several read chunks
        let memfd = SealedMemfd::for_bytes(&data).unwrap();

        let expected = hex::encode(Sha256::digest(&data));
        assert_eq!(digest_fd(&memfd).unwrap(), expected);
    }

    #[test]
    fn test_digest_leaves_offset_untouched() {
        let memfd = SealedMemfd::for_bytes(b"offset check").unwrap();
        digest_fd(&memfd).unwrap();

        // A positional read at 0 must still see the start of the file, and
        // the shared offset must not have advanced.
        let mut buf = [0u8; 6];
        let n = rustix::io::pread(&memfd, &mut buf, 0).unwrap();
        assert_eq!(&buf[..n], b"offset");
        assert_eq!(rustix::fs::seek(&memfd, rustix::fs::SeekFrom::Current(0)).unwrap(), 0);
    }

    #[test]
    fn test_distinct_contents_distinct_digests() {
        let a = SealedMemfd::for_bytes(b"aaaa").unwrap();
        let b = SealedMemfd::for_bytes(b"aaab").unwrap();
        assert_ne!(digest_fd(&a).unwrap(), digest_fd(&b).unwrap());
    }
}
