//! Per-peer handle accounting.
//!
//! Each connected sender gets a lazily created record mapping small
//! integer handles to blob references. Handle numbering starts at 1 and
//! only grows; a handle freed by `Forget` is never re-issued to the same
//! peer, which keeps late duplicate `Forget`s harmless.

use crate::store::Blob;
use std::collections::HashMap;
use std::rc::Rc;
use tracing::debug;

struct Peer {
    next_handle: u32,
    entries: HashMap<u32, Rc<Blob>>,
}

impl Peer {
    fn new() -> Self {
        Self {
            next_handle: 1,
            entries: HashMap::new(),
        }
    }
}

/// Table of peers keyed by the sender name the transport assigned them.
#[derive(Default)]
pub struct PeerTable {
    peers: HashMap<String, Peer>,
}

impl PeerTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a blob reference for `sender`, allocating the next handle.
    ///
    /// The peer record is created on first use.
    pub fn add(&mut self, sender: &str, blob: Rc<Blob>) -> u32 {
        let peer = self
            .peers
            .entry(sender.to_owned())
            .or_insert_with(Peer::new);

        let handle = peer.next_handle;
        peer.next_handle += 1;

        debug!(handle, digest = %blob.digest(), peer = sender, "added blob for peer");
        peer.entries.insert(handle, blob);

        handle
    }

    /// Drop the reference `sender` holds under `handle`.
    ///
    /// Returns the reference if the handle was known. Unknown senders and
    /// unknown handles are a silent no-op; a `Forget` racing a peer-death
    /// sweep must not fail.
    pub fn remove(&mut self, sender: &str, handle: u32) -> Option<Rc<Blob>> {
        let removed = self
            .peers
            .get_mut(sender)
            .and_then(|peer| peer.entries.remove(&handle));
        if removed.is_some() {
            debug!(handle, peer = sender, "removed blob for peer");
        }
        removed
    }

    /// Remove `sender` entirely, yielding every reference it held.
    ///
    /// Returns `None` if the sender was never seen (or already swept).
    pub fn drop_peer(&mut self, sender: &str) -> Option<Vec<Rc<Blob>>> {
        self.peers
            .remove(sender)
            .map(|peer| peer.entries.into_values().collect())
    }

    /// Whether a record exists for `sender`.
    pub fn contains(&self, sender: &str) -> bool {
        self.peers.contains_key(sender)
    }

    /// Number of handle entries held by `sender`.
    pub fn handle_count(&self, sender: &str) -> usize {
        self.peers.get(sender).map_or(0, |p| p.entries.len())
    }

    /// Total handle entries across all peers.
    pub fn total_entries(&self) -> usize {
        self.peers.values().map(|p| p.entries.len()).sum()
    }

    /// Iterate over all handle entries as `(sender, handle, blob)`.
    pub fn iter_entries(&self) -> impl Iterator<Item = (&str, u32, &Rc<Blob>)> {
        self.peers.iter().flat_map(|(name, peer)| {
            peer.entries
                .iter()
                .map(move |(handle, blob)| (name.as_str(), *handle, blob))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sealed::{digest_fd, SealedMemfd};
    use crate::store::BlobStore;

    fn blob(store: &mut BlobStore, data: &[u8]) -> Rc<Blob> {
        let memfd = SealedMemfd::for_bytes(data).unwrap();
        let digest = digest_fd(&memfd).unwrap();
        store.insert(memfd.into_fd(), digest)
    }

    #[test]
    fn test_handles_start_at_one_and_grow() {
        let mut store = BlobStore::new();
        let mut peers = PeerTable::new();
        let b = blob(&mut store, b"x");

        assert_eq!(peers.add(":1.1", Rc::clone(&b)), 1);
        assert_eq!(peers.add(":1.1", Rc::clone(&b)), 2);
        assert_eq!(peers.add(":1.2", b), 1); // independent numbering per peer
    }

    #[test]
    fn test_handles_are_never_reused() {
        let mut store = BlobStore::new();
        let mut peers = PeerTable::new();
        let b = blob(&mut store, b"y");

        let h = peers.add(":1.7", Rc::clone(&b));
        peers.remove(":1.7", h).unwrap();
        assert_eq!(peers.add(":1.7", b), h + 1);
    }

    #[test]
    fn test_remove_unknown_handle_is_noop() {
        let mut peers = PeerTable::new();
        assert!(peers.remove(":1.9", 42).is_none());
        assert!(!peers.contains(":1.9")); // a Forget does not create peers

        let mut store = BlobStore::new();
        let b = blob(&mut store, b"z");
        let h = peers.add(":1.9", b);
        assert!(peers.remove(":1.9", h).is_some());
        assert!(peers.remove(":1.9", h).is_none()); // duplicate Forget
    }

    #[test]
    fn test_drop_peer_yields_all_references() {
        let mut store = BlobStore::new();
        let mut peers = PeerTable::new();
        let a = blob(&mut store, b"first");
        let b = blob(&mut store, b"second");

        peers.add(":1.3", Rc::clone(&a));
        peers.add(":1.3", Rc::clone(&b));
        peers.add(":1.3", a);

        let refs = peers.drop_peer(":1.3").unwrap();
        assert_eq!(refs.len(), 3);
        assert!(!peers.contains(":1.3"));
        assert!(peers.drop_peer(":1.3").is_none());
    }
}
