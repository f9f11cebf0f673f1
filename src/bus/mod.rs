//! Session-bus collaborator.
//!
//! The daemon core is written against a small request/response vocabulary
//! with descriptor passing: method calls carry a type signature, a few
//! 32-bit words, and an attached descriptor list; replies carry the same
//! plus an error channel. This module defines that vocabulary and ships a
//! concrete session-scoped transport over a `SOCK_SEQPACKET` unix socket,
//! one frame per datagram, descriptors in `SCM_RIGHTS` ancillary data.
//!
//! Peers are identified by transport-assigned sender names of the form
//! `:1.<n>`; a peer's socket teardown is reported to the core exactly once,
//! which is the transport's rendition of a name-owner-changed broadcast to
//! the empty owner.

mod client;
mod server;
mod transport;
mod wire;

pub use client::{CallResult, Connection};
pub use server::{Server, ShutdownHandle};
pub use transport::{recv_frame, send_frame, MAX_FDS_PER_FRAME};
pub use wire::{Body, ErrorCode, Frame};

use rustix::fd::OwnedFd;
use std::path::PathBuf;

/// Well-known service name the daemon claims on the session bus.
pub const BUS_NAME: &str = "org.freedesktop.portal.Unique";

/// Object path the deduplication interface lives on.
pub const OBJECT_PATH: &str = "/org/freedesktop/portal/unique";

/// Interface the two methods belong to.
pub const INTERFACE: &str = "org.freedesktop.portal.Unique";

/// Introspection description of the deduplication interface.
pub const INTERFACE_XML: &str = "\
<node>
  <interface name='org.freedesktop.portal.Unique'>
    <method name='MakeUnique'>
      <arg type='h' name='memfd'  direction='in'/>
      <arg type='ah' name='content' direction='out'/>
      <arg type='u' name='handle' direction='out'/>
    </method>
    <method name='Forget'>
      <arg type='u' name='handle' direction='in'/>
    </method>
  </interface>
</node>
";

/// Default timeout for synchronous client calls.
pub const SYNC_CALL_TIMEOUT_MS: u64 = 3000;

/// Where the session socket lives: `$XDG_RUNTIME_DIR/uniqued.sock`, with a
/// per-uid tempdir fallback for sessions without a runtime directory.
pub fn default_socket_path() -> PathBuf {
    if let Some(dir) = std::env::var_os("XDG_RUNTIME_DIR") {
        return PathBuf::from(dir).join("uniqued.sock");
    }
    let uid = rustix::process::getuid().as_raw();
    std::env::temp_dir().join(format!("uniqued-{uid}.sock"))
}

/// Take the descriptor at `index` out of a received descriptor list.
///
/// Every descriptor left behind in `fds` stays owned by the list and is
/// closed when the caller drops it; nothing leaks on the non-adopted path.
pub fn steal_fd_from_list(fds: &mut Vec<OwnedFd>, index: u32) -> Option<OwnedFd> {
    let index = index as usize;
    if index >= fds.len() {
        return None;
    }
    Some(fds.swap_remove(index))
}
