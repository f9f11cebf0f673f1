//! Datagram transport with descriptor passing.
//!
//! Frames travel one per `SOCK_SEQPACKET` datagram; attached descriptors
//! ride in `SCM_RIGHTS` ancillary data of the same datagram, so a frame
//! and its descriptor list arrive together or not at all.

use crate::bus::wire::{Frame, MAX_FRAME_LEN};
use crate::error::{Error, Result};
use rustix::fd::{AsFd, BorrowedFd, OwnedFd};
use rustix::net::{
    recvmsg, sendmsg, RecvAncillaryBuffer, RecvAncillaryMessage, RecvFlags, SendAncillaryBuffer,
    SendAncillaryMessage, SendFlags,
};
use std::io::{IoSlice, IoSliceMut};

/// Maximum number of descriptors attached to a single frame.
pub const MAX_FDS_PER_FRAME: usize = 8;

const ANCILLARY_SPACE: usize = 256;

/// Send one frame with `fds` attached.
///
/// # Errors
///
/// Returns an error if the descriptor list is over-long, the ancillary
/// buffer cannot hold it, or the send fails (a closed peer surfaces as
/// [`Error::Disconnected`]).
pub fn send_frame<Sock: AsFd>(sock: Sock, frame: &Frame, fds: &[BorrowedFd<'_>]) -> Result<()> {
    if fds.len() > MAX_FDS_PER_FRAME {
        return Err(Error::Malformed(format!(
            "too many fds: {} > {}",
            fds.len(),
            MAX_FDS_PER_FRAME
        )));
    }

    let payload = frame.encode();

    let mut ancillary_space = [0u8; ANCILLARY_SPACE];
    let mut ancillary = SendAncillaryBuffer::new(&mut ancillary_space);

    if !fds.is_empty() && !ancillary.push(SendAncillaryMessage::ScmRights(fds)) {
        return Err(Error::Malformed(
            "failed to add fds to ancillary buffer".into(),
        ));
    }

    let iov = [IoSlice::new(&payload)];
    match sendmsg(&sock, &iov, &mut ancillary, SendFlags::NOSIGNAL) {
        Ok(_) => Ok(()),
        Err(rustix::io::Errno::PIPE) | Err(rustix::io::Errno::CONNRESET) => {
            Err(Error::Disconnected)
        }
        Err(e) => Err(e.into()),
    }
}

/// Receive one frame and its attached descriptors.
///
/// Returns `Ok(None)` on orderly end-of-stream. All received descriptors
/// are returned owned; the caller is responsible for every one of them,
/// adopted or not.
///
/// # Errors
///
/// Returns an error on transport failure or an undecodable payload.
pub fn recv_frame<Sock: AsFd>(sock: Sock) -> Result<Option<(Frame, Vec<OwnedFd>)>> {
    let mut payload = [0u8; MAX_FRAME_LEN];

    let mut ancillary_space = [0u8; ANCILLARY_SPACE];
    let mut ancillary = RecvAncillaryBuffer::new(&mut ancillary_space);

    let mut iov = [IoSliceMut::new(&mut payload)];
    let result = loop {
        match recvmsg(&sock, &mut iov, &mut ancillary, RecvFlags::CMSG_CLOEXEC) {
            Ok(r) => break r,
            Err(rustix::io::Errno::INTR) => continue,
            Err(rustix::io::Errno::CONNRESET) => return Ok(None),
            Err(e) => return Err(e.into()),
        }
    };

    // Collect descriptors first so they are owned (and closed on the error
    // paths below) no matter what the payload turns out to be.
    let mut fds = Vec::new();
    for msg in ancillary.drain() {
        if let RecvAncillaryMessage::ScmRights(rights) = msg {
            fds.extend(rights);
        }
    }

    if result.bytes == 0 {
        return Ok(None);
    }

    let frame = Frame::decode(&iov[0][..result.bytes])?;
    Ok(Some((frame, fds)))
}
