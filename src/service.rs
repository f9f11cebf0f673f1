//! Method dispatcher for the deduplication service.
//!
//! [`Service`] owns the authoritative state: the blob store, the peer
//! table, and the two size counters. It is single-threaded; handlers take
//! `&mut self` and run to completion, so no call ever observes partially
//! mutated state. Every received descriptor is either adopted into a blob
//! or closed before the handler returns.

use crate::bus::{steal_fd_from_list, Body, ErrorCode, INTERFACE};
use crate::peer::PeerTable;
use crate::sealed;
use crate::store::BlobStore;
use rustix::fd::OwnedFd;
use std::rc::Rc;
use tracing::debug;

/// An error reply to a method call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodError {
    /// Error category.
    pub code: ErrorCode,
    /// Human-readable detail.
    pub message: String,
}

impl MethodError {
    fn invalid_args(message: &str) -> Self {
        Self {
            code: ErrorCode::InvalidArgs,
            message: message.into(),
        }
    }

    fn failed(message: &str) -> Self {
        Self {
            code: ErrorCode::Failed,
            message: message.into(),
        }
    }

    fn unknown_method(method: &str) -> Self {
        Self {
            code: ErrorCode::UnknownMethod,
            message: format!("Method {method} is not implemented on interface {INTERFACE}"),
        }
    }
}

/// Outcome of a dispatched call: a reply body plus descriptors to attach.
pub type MethodResult = std::result::Result<(Body, Vec<OwnedFd>), MethodError>;

/// The daemon core.
#[derive(Default)]
pub struct Service {
    store: BlobStore,
    peers: PeerTable,
    apparent_size: u64,
}

impl Service {
    /// Create a service with empty tables.
    pub fn new() -> Self {
        Self::default()
    }

    /// Dispatch one method call from `sender`.
    ///
    /// Ownership of `fds` transfers to the handler; descriptors that are
    /// not adopted are closed here.
    pub fn dispatch(&mut self, sender: &str, method: &str, body: &Body, fds: Vec<OwnedFd>) -> MethodResult {
        match method {
            "MakeUnique" => self.make_unique(sender, body, fds),
            "Forget" => self.forget(sender, body),
            _ => Err(MethodError::unknown_method(method)),
        }
    }

    fn make_unique(&mut self, sender: &str, body: &Body, mut fds: Vec<OwnedFd>) -> MethodResult {
        debug!(peer = sender, "got MakeUnique request");

        let index = body
            .as_fd_index()
            .ok_or_else(|| MethodError::invalid_args("Wrong argument types"))?;

        let fd = steal_fd_from_list(&mut fds, index)
            .ok_or_else(|| MethodError::invalid_args("No fd passed"))?;
        drop(fds);

        sealed::require_sealed(&fd)
            .map_err(|_| MethodError::invalid_args("Fd not sealed"))?;

        let digest = sealed::digest_fd(&fd)
            .map_err(|_| MethodError::invalid_args("Can't read data"))?;

        let (blob, reply_fds) = match self.store.lookup(&digest) {
            Some(blob) => {
                let dup = rustix::io::fcntl_dupfd_cloexec(blob.fd(), 0)
                    .map_err(|_| MethodError::failed("Failed to dup fd"))?;
                debug!(digest = %digest, "reusing old blob");
                (blob, vec![dup])
            }
            None => (self.store.insert(fd, digest), Vec::new()),
        };

        let handle = self.peers.add(sender, Rc::clone(&blob));
        self.apparent_size += blob.len();
        self.log_stats();

        let indexes: Vec<u32> = (0..reply_fds.len() as u32).collect();
        Ok((Body::fds_and_handle(&indexes, handle), reply_fds))
    }

    fn forget(&mut self, sender: &str, body: &Body) -> MethodResult {
        debug!(peer = sender, "got Forget request");

        let handle = body
            .as_handle()
            .ok_or_else(|| MethodError::invalid_args("Wrong argument types"))?;

        if let Some(blob) = self.peers.remove(sender, handle) {
            self.apparent_size -= blob.len();
            self.store.release(blob);
        }
        self.log_stats();

        Ok((Body::unit(), Vec::new()))
    }

    /// Release every reference held by a vanished peer.
    ///
    /// The transport reports each teardown once, but calling this again
    /// for an unknown sender is harmless.
    pub fn peer_vanished(&mut self, sender: &str) {
        let Some(blobs) = self.peers.drop_peer(sender) else {
            return;
        };
        debug!(peer = sender, "peer died");
        for blob in blobs {
            self.apparent_size -= blob.len();
            self.store.release(blob);
        }
        self.log_stats();
    }

    fn log_stats(&self) {
        debug!(
            apparent = self.apparent_size,
            real = self.store.real_size(),
            "total blob sizes"
        );
    }

    /// Cumulative bytes callers would hold without deduplication.
    pub fn apparent_size(&self) -> u64 {
        self.apparent_size
    }

    /// Cumulative bytes actually resident.
    pub fn real_size(&self) -> u64 {
        self.store.real_size()
    }

    /// The blob table.
    pub fn store(&self) -> &BlobStore {
        &self.store
    }

    /// The peer table.
    pub fn peers(&self) -> &PeerTable {
        &self.peers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sealed::{digest_fd, SealedMemfd};
    use proptest::prelude::*;
    use std::rc::Rc;

    const PEER_A: &str = ":1.10";
    const PEER_B: &str = ":1.11";

    fn submit(service: &mut Service, sender: &str, data: &[u8]) -> (Vec<u32>, u32, Vec<OwnedFd>) {
        let memfd = SealedMemfd::for_bytes(data).unwrap();
        let (body, fds) = service
            .dispatch(sender, "MakeUnique", &Body::fd_index(0), vec![memfd.into_fd()])
            .unwrap();
        let (indexes, handle) = body.as_fds_and_handle().unwrap();
        (indexes.to_vec(), handle, fds)
    }

    fn forget(service: &mut Service, sender: &str, handle: u32) {
        let (body, fds) = service
            .dispatch(sender, "Forget", &Body::handle(handle), Vec::new())
            .unwrap();
        assert_eq!(body, Body::unit());
        assert!(fds.is_empty());
    }

    /// Counters match the tables, every handle entry is counted in its
    /// blob's refcount, every key re-hashes to itself.
    fn check_invariants(service: &Service) {
        let real: u64 = service.store().iter().map(|b| b.len()).sum();
        assert_eq!(service.real_size(), real);

        let apparent: u64 = service
            .peers()
            .iter_entries()
            .map(|(_, _, blob)| blob.len())
            .sum();
        assert_eq!(service.apparent_size(), apparent);
        assert!(service.apparent_size() >= service.real_size());

        for blob in service.store().iter() {
            let entries = service
                .peers()
                .iter_entries()
                .filter(|(_, _, b)| Rc::ptr_eq(b, blob))
                .count();
            assert_eq!(service.store().refcount(blob.digest()), Some(entries));
            assert_eq!(digest_fd(blob.fd()).unwrap(), blob.digest());
        }
    }

    #[test]
    fn test_first_submission_creates_blob() {
        let mut service = Service::new();
        let (indexes, handle, fds) = submit(&mut service, PEER_A, b"Hello, World!\0");

        assert!(indexes.is_empty());
        assert!(fds.is_empty());
        assert_eq!(handle, 1);
        assert_eq!(service.store().len(), 1);
        assert_eq!(service.real_size(), 14);
        assert_eq!(service.apparent_size(), 14);
        check_invariants(&service);
    }

    #[test]
    fn test_second_submission_returns_canonical_fd() {
        let mut service = Service::new();
        submit(&mut service, PEER_A, b"Hello, World!\0");
        let (indexes, handle, fds) = submit(&mut service, PEER_B, b"Hello, World!\0");

        assert_eq!(indexes, vec![0]);
        assert_eq!(fds.len(), 1);
        assert_eq!(handle, 1); // first handle for B
        assert_eq!(service.store().len(), 1);
        assert_eq!(service.real_size(), 14);
        assert_eq!(service.apparent_size(), 28);

        // The returned descriptor is the canonical sealed content.
        assert_eq!(digest_fd(&fds[0]).unwrap(), {
            let memfd = SealedMemfd::for_bytes(b"Hello, World!\0").unwrap();
            digest_fd(&memfd).unwrap()
        });
        check_invariants(&service);
    }

    #[test]
    fn test_forget_releases_one_reference() {
        let mut service = Service::new();
        let (_, handle_a, _) = submit(&mut service, PEER_A, b"Hello, World!\0");
        submit(&mut service, PEER_B, b"Hello, World!\0");

        forget(&mut service, PEER_A, handle_a);
        assert_eq!(service.peers().handle_count(PEER_A), 0);
        assert_eq!(service.store().len(), 1);
        assert_eq!(service.real_size(), 14);
        assert_eq!(service.apparent_size(), 14);
        check_invariants(&service);
    }

    #[test]
    fn test_peer_death_destroys_last_reference() {
        let mut service = Service::new();
        let (_, handle_a, _) = submit(&mut service, PEER_A, b"Hello, World!\0");
        submit(&mut service, PEER_B, b"Hello, World!\0");
        forget(&mut service, PEER_A, handle_a);

        service.peer_vanished(PEER_B);
        assert!(service.store().is_empty());
        assert_eq!(service.real_size(), 0);
        assert_eq!(service.apparent_size(), 0);
        assert!(!service.peers().contains(PEER_B));
        check_invariants(&service);
    }

    #[test]
    fn test_unsealed_fd_is_rejected() {
        use rustix::fs::{memfd_create, MemfdFlags};
        let mut service = Service::new();

        let name = std::ffi::CString::new("unique-test-raw").unwrap();
        let fd = memfd_create(&name, MemfdFlags::CLOEXEC | MemfdFlags::ALLOW_SEALING).unwrap();
        rustix::fs::ftruncate(&fd, 4).unwrap();

        let err = service
            .dispatch(PEER_A, "MakeUnique", &Body::fd_index(0), vec![fd])
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidArgs);
        assert_eq!(err.message, "Fd not sealed");
        assert!(service.store().is_empty());
        assert_eq!(service.apparent_size(), 0);
    }

    #[test]
    fn test_missing_fd_is_rejected() {
        let mut service = Service::new();
        let err = service
            .dispatch(PEER_A, "MakeUnique", &Body::fd_index(0), Vec::new())
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidArgs);
        assert_eq!(err.message, "No fd passed");

        // Index past the end of a non-empty list is the same failure, and
        // the attached descriptor must still be closed (dropped).
        let memfd = SealedMemfd::for_bytes(b"data").unwrap();
        let err = service
            .dispatch(PEER_A, "MakeUnique", &Body::fd_index(3), vec![memfd.into_fd()])
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidArgs);
        assert!(service.store().is_empty());
    }

    #[test]
    fn test_wrong_signatures_are_rejected() {
        let mut service = Service::new();
        let memfd = SealedMemfd::for_bytes(b"data").unwrap();

        let err = service
            .dispatch(PEER_A, "MakeUnique", &Body::handle(0), vec![memfd.into_fd()])
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidArgs);
        assert_eq!(err.message, "Wrong argument types");

        let err = service
            .dispatch(PEER_A, "Forget", &Body::fd_index(0), Vec::new())
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidArgs);
        assert_eq!(err.message, "Wrong argument types");

        assert!(service.store().is_empty());
        assert_eq!(service.apparent_size(), 0);
    }

    #[test]
    fn test_unknown_method() {
        let mut service = Service::new();
        let err = service
            .dispatch(PEER_A, "Frobnicate", &Body::unit(), Vec::new())
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::UnknownMethod);
    }

    #[test]
    fn test_duplicate_forget_is_silent() {
        let mut service = Service::new();
        let (_, handle, _) = submit(&mut service, PEER_A, b"payload");
        forget(&mut service, PEER_A, handle);
        forget(&mut service, PEER_A, handle);
        forget(&mut service, PEER_B, 12345); // never-issued handle, unseen peer
        check_invariants(&service);
    }

    #[test]
    fn test_zero_length_submission() {
        let mut service = Service::new();
        let (indexes, handle, _) = submit(&mut service, PEER_A, b"");
        assert!(indexes.is_empty());
        assert_eq!(handle, 1);
        assert_eq!(service.store().len(), 1);
        assert_eq!(service.real_size(), 0);
        check_invariants(&service);
    }

    #[test]
    fn test_submit_forget_round_trip_restores_state() {
        let mut service = Service::new();
        let (_, handle, _) = submit(&mut service, PEER_A, b"transient");
        forget(&mut service, PEER_A, handle);

        assert!(service.store().is_empty());
        assert_eq!(service.real_size(), 0);
        assert_eq!(service.apparent_size(), 0);
    }

    #[test]
    fn test_same_peer_resubmission_gets_fresh_handle() {
        let mut service = Service::new();
        let (_, h1, _) = submit(&mut service, PEER_A, b"twice");
        let (indexes, h2, _) = submit(&mut service, PEER_A, b"twice");

        assert_eq!(indexes, vec![0]); // hit against its own earlier copy
        assert_ne!(h1, h2);
        assert_eq!(service.store().len(), 1);
        check_invariants(&service);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Submit { peer: usize, content: usize },
        Forget { peer: usize, nth: usize },
        PeerDeath { peer: usize },
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            4 => (0..4usize, 0..6usize).prop_map(|(peer, content)| Op::Submit { peer, content }),
            2 => (0..4usize, 0..8usize).prop_map(|(peer, nth)| Op::Forget { peer, nth }),
            1 => (0..4usize).prop_map(|peer| Op::PeerDeath { peer }),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Invariants 1-5: counters, refcounts, and digests stay
        /// consistent across arbitrary operation sequences.
        #[test]
        fn prop_invariants_hold(ops in proptest::collection::vec(op_strategy(), 1..40)) {
            let peers = [":1.0", ":1.1", ":1.2", ":1.3"];
            let contents: Vec<Vec<u8>> = (0..6u8)
                .map(|i| vec![i; (i as usize + 1) * 3])
                .collect();
            let mut issued: Vec<Vec<u32>> = vec![Vec::new(); peers.len()];

            let mut service = Service::new();
            for op in ops {
                match op {
                    Op::Submit { peer, content } => {
                        let (_, handle, _) =
                            submit(&mut service, peers[peer], &contents[content]);
                        issued[peer].push(handle);
                    }
                    Op::Forget { peer, nth } => {
                        // Sometimes a live handle, sometimes stale or unknown.
                        let handle = issued[peer].get(nth).copied().unwrap_or(nth as u32 + 90);
                        forget(&mut service, peers[peer], handle);
                        if let Some(pos) = issued[peer].iter().position(|&h| h == handle) {
                            issued[peer].remove(pos);
                        }
                    }
                    Op::PeerDeath { peer } => {
                        service.peer_vanished(peers[peer]);
                        issued[peer].clear();
                        prop_assert_eq!(service.peers().handle_count(peers[peer]), 0);
                    }
                }
                check_invariants(&service);

                // Identical content never occupies two store entries.
                let total: usize = service.store().len();
                let distinct: std::collections::HashSet<&str> =
                    service.store().iter().map(|b| b.digest()).collect();
                prop_assert_eq!(total, distinct.len());
            }
        }
    }
}
