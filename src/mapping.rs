//! Read-only private mappings of sealed descriptors.
//!
//! The client hands callers views into these mappings, so a mapping's base
//! address is load-bearing: once a buffer has been returned, its pages may
//! be replaced (to point at the daemon's canonical copy) but never moved.

use crate::error::{Error, Result};
use rustix::fd::AsFd;
use rustix::mm::{MapFlags, ProtFlags};
use std::ptr::NonNull;

/// A read-only `MAP_PRIVATE` mapping of a sealed file.
///
/// Zero-length content is represented without a kernel mapping; the
/// pointer is dangling and never dereferenced.
pub struct Mapping {
    ptr: NonNull<u8>,
    len: usize,
}

impl Mapping {
    /// Map `len` bytes of `fd` read-only and private.
    ///
    /// # Errors
    ///
    /// Returns an error if `mmap` fails.
    pub fn map<Fd: AsFd>(fd: Fd, len: usize) -> Result<Self> {
        if len == 0 {
            return Ok(Self {
                ptr: NonNull::dangling(),
                len: 0,
            });
        }

        let ptr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                len,
                ProtFlags::READ,
                MapFlags::PRIVATE,
                fd,
                0,
            )?
        };

        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| Error::Malformed("mmap returned null".into()))?;

        Ok(Self { ptr, len })
    }

    /// Replace the mapped pages in place with the content behind `fd`.
    ///
    /// Uses `MAP_FIXED` at the existing base address, which the kernel
    /// performs atomically. Callers already hold pointers into the range,
    /// so a mapping that lands anywhere else is unrecoverable: the process
    /// aborts. A plain `mmap` failure leaves the original mapping intact
    /// and is reported to the caller.
    pub fn remap_fixed<Fd: AsFd>(&self, fd: Fd) -> Result<()> {
        if self.len == 0 {
            return Ok(());
        }

        let ptr = unsafe {
            rustix::mm::mmap(
                self.ptr.as_ptr().cast(),
                self.len,
                ProtFlags::READ,
                MapFlags::PRIVATE | MapFlags::FIXED,
                fd,
                0,
            )?
        };

        if ptr.cast::<u8>() != self.ptr.as_ptr() {
            // Callers hold pointers into the original range; there is no
            // way to continue if the kernel moved it.
            std::process::abort();
        }

        Ok(())
    }

    /// Base address of the mapping.
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Length of the mapping in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the mapping is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// View the mapped content as a byte slice.
    pub fn as_slice(&self) -> &[u8] {
        if self.len == 0 {
            return &[];
        }
        // SAFETY: ptr/len describe a live read-only mapping for self's
        // whole lifetime; the pages are sealed so the content is stable.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        if self.len > 0 {
            unsafe {
                let _ = rustix::mm::munmap(self.ptr.as_ptr().cast(), self.len);
            }
        }
    }
}
