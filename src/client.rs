//! Client-side deduplication.
//!
//! [`Unique`] wraps an (optional) daemon connection and turns caller
//! bytes into [`UniqueBytes`] buffers. Deduplication is best-effort:
//! every failure (no daemon, sealing failure, timeout, error reply)
//! degrades to a plain heap copy that honors the same buffer contract.
//! Callers cannot tell the difference and never see a dedup error.
//!
//! The asynchronous path returns a buffer over the caller's own sealed
//! file immediately and re-points the pages at the daemon's canonical
//! copy in place once the reply arrives; the virtual address callers
//! observed never changes.

use crate::bus::{steal_fd_from_list, Body, Connection, SYNC_CALL_TIMEOUT_MS};
use crate::error::{Error, Result};
use crate::mapping::Mapping;
use crate::sealed::SealedMemfd;
use rustix::fd::AsFd;
use std::cell::Cell;
use std::ops::Deref;
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;
use tracing::debug;

/// A read-only mapping plus the daemon bookkeeping needed to let go of it.
///
/// The final drop unmaps and, when a daemon handle was assigned, issues a
/// fire-and-forget `Forget`. While an asynchronous `MakeUnique` is in
/// flight the pending callback holds one reference, so a reply arriving
/// after the caller dropped every buffer still records the handle and the
/// `Forget` still goes out.
struct MappedData {
    mapping: Mapping,
    handle: Cell<u32>,
    conn: Option<Rc<Connection>>,
}

impl Drop for MappedData {
    fn drop(&mut self) {
        let handle = self.handle.get();
        if handle == 0 {
            return;
        }
        if let Some(conn) = &self.conn {
            if let Err(e) = conn.send_oneway("Forget", &Body::handle(handle)) {
                debug!(handle, error = %e, "could not send Forget");
            }
        }
    }
}

#[derive(Clone)]
enum Inner {
    Heap(Rc<[u8]>),
    Mapped(Rc<MappedData>),
}

/// A read-only byte buffer, deduplicated across the session when possible.
///
/// Cheap to clone; the backing storage is released when the last clone
/// drops. Dereferences to `[u8]`.
#[derive(Clone)]
pub struct UniqueBytes {
    inner: Inner,
}

impl UniqueBytes {
    fn heap(data: &[u8]) -> Self {
        Self {
            inner: Inner::Heap(Rc::from(data)),
        }
    }

    fn mapped(record: Rc<MappedData>) -> Self {
        Self {
            inner: Inner::Mapped(record),
        }
    }

    /// Whether the buffer is backed by a sealed memory file (as opposed
    /// to a plain heap copy).
    pub fn is_memfd_backed(&self) -> bool {
        matches!(self.inner, Inner::Mapped(_))
    }

    /// The daemon-assigned handle for this buffer's reference.
    ///
    /// `None` for heap-backed buffers; `Some(0)` while an asynchronous
    /// submission has not been answered yet.
    pub fn daemon_handle(&self) -> Option<u32> {
        match &self.inner {
            Inner::Heap(_) => None,
            Inner::Mapped(record) => Some(record.handle.get()),
        }
    }
}

impl Deref for UniqueBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match &self.inner {
            Inner::Heap(data) => data,
            Inner::Mapped(record) => record.mapping.as_slice(),
        }
    }
}

impl AsRef<[u8]> for UniqueBytes {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl std::fmt::Debug for UniqueBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UniqueBytes")
            .field("len", &self.len())
            .field("memfd_backed", &self.is_memfd_backed())
            .finish()
    }
}

/// Session handle for creating deduplicated buffers.
pub struct Unique {
    conn: Option<Rc<Connection>>,
}

impl Unique {
    /// Connect to the session daemon at its default socket.
    pub fn session() -> Self {
        Self::connect(&crate::bus::default_socket_path())
    }

    /// Connect to a daemon at `path`.
    ///
    /// A missing or unreachable daemon is not an error; the handle simply
    /// serves heap copies.
    pub fn connect(path: &Path) -> Self {
        let conn = match Connection::connect(path) {
            Ok(conn) => Some(conn),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "no dedup daemon");
                None
            }
        };
        Self { conn }
    }

    /// Wrap an existing connection.
    pub fn from_connection(conn: Rc<Connection>) -> Self {
        Self { conn: Some(conn) }
    }

    /// Whether a daemon connection is established.
    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    /// Create a deduplicated buffer, blocking on the daemon round-trip.
    ///
    /// Never fails: any dedup problem falls back to a heap copy.
    pub fn bytes_sync(&self, data: &[u8]) -> UniqueBytes {
        match self.try_sync(data) {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!(error = %e, "sync dedup failed, using heap copy");
                UniqueBytes::heap(data)
            }
        }
    }

    /// Create a buffer immediately and deduplicate it in the background.
    ///
    /// The returned buffer is usable at once. When the daemon replies
    /// (during a later [`dispatch`](Self::dispatch)), an existing copy is
    /// swapped in at the same address and the reference is registered for
    /// eventual `Forget`. Never fails; falls back to a heap copy.
    pub fn bytes_async(&self, data: &[u8]) -> UniqueBytes {
        match self.try_async(data) {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!(error = %e, "async dedup failed, using heap copy");
                UniqueBytes::heap(data)
            }
        }
    }

    /// Process outstanding asynchronous replies.
    ///
    /// Waits up to `timeout` for the first reply (`None`: do not wait).
    /// Returns the number of replies processed; transport failures count
    /// as zero (the affected buffers simply stay un-deduplicated).
    pub fn dispatch(&self, timeout: Option<Duration>) -> usize {
        let Some(conn) = &self.conn else {
            return 0;
        };
        match conn.dispatch(timeout) {
            Ok(n) => n,
            Err(e) => {
                debug!(error = %e, "dispatch failed");
                0
            }
        }
    }

    fn try_sync(&self, data: &[u8]) -> Result<UniqueBytes> {
        let conn = self.conn.as_ref().ok_or(Error::Disconnected)?;
        let memfd = SealedMemfd::for_bytes(data)?;

        let (body, mut reply_fds) = conn.call_sync(
            "MakeUnique",
            &Body::fd_index(0),
            &[memfd.as_fd()],
            Duration::from_millis(SYNC_CALL_TIMEOUT_MS),
        )?;
        let (indexes, handle) = body
            .as_fds_and_handle()
            .ok_or_else(|| Error::Malformed("bad MakeUnique reply".into()))?;

        // On a hit the daemon returns its canonical descriptor; adopt it
        // and let the original (and any unexpected extras) close.
        let mut fd = memfd.into_fd();
        if let Some(&index) = indexes.first() {
            if let Some(canonical) = steal_fd_from_list(&mut reply_fds, index) {
                fd = canonical;
            }
        }
        drop(reply_fds);

        let mapping = Mapping::map(&fd, data.len())?;
        drop(fd); // the mapping keeps the file alive

        let record = Rc::new(MappedData {
            mapping,
            handle: Cell::new(handle),
            conn: Some(Rc::clone(conn)),
        });
        Ok(UniqueBytes::mapped(record))
    }

    fn try_async(&self, data: &[u8]) -> Result<UniqueBytes> {
        let memfd = SealedMemfd::for_bytes(data)?;
        let mapping = Mapping::map(&memfd, data.len())?;

        let record = Rc::new(MappedData {
            mapping,
            handle: Cell::new(0),
            conn: self.conn.clone(),
        });

        if let Some(conn) = &self.conn {
            let pending = Rc::clone(&record);
            conn.call_async(
                "MakeUnique",
                &Body::fd_index(0),
                &[memfd.as_fd()],
                Box::new(move |result| complete_async(&pending, result)),
            )?;
        }

        drop(memfd); // the mapping keeps the file alive
        Ok(UniqueBytes::mapped(record))
    }
}

/// Apply a `MakeUnique` reply to an asynchronously submitted mapping.
fn complete_async(record: &Rc<MappedData>, result: crate::bus::CallResult) {
    let (body, mut reply_fds) = match result {
        Ok(reply) => reply,
        Err(e) => {
            debug!(error = %e, "async MakeUnique failed, keeping own mapping");
            return;
        }
    };

    let Some((indexes, handle)) = body.as_fds_and_handle() else {
        debug!("bad MakeUnique reply, keeping own mapping");
        return;
    };

    if let Some(&index) = indexes.first() {
        if let Some(canonical) = steal_fd_from_list(&mut reply_fds, index) {
            // Swap the pages for the canonical copy at the same address.
            if let Err(e) = record.mapping.remap_fixed(&canonical) {
                debug!(error = %e, "in-place remap failed, keeping own mapping");
            }
        }
    }
    drop(reply_fds);

    // Record the handle even if every buffer is already gone; the final
    // drop issues the Forget.
    record.handle.set(handle);
}
