//! Client-side connection to the daemon.
//!
//! One connection per client process. Calls are matched to replies by
//! serial; synchronous calls block on a millisecond deadline while
//! asynchronous calls park a completion callback in a pending table that
//! [`Connection::dispatch`] drains. A reply that arrives after the caller
//! lost interest still runs its callback; the callback owns whatever it
//! needs to finish the job (recording a handle so the eventual drop can
//! issue `Forget`).

use crate::bus::transport::{recv_frame, send_frame};
use crate::bus::wire::{Body, Frame};
use crate::error::{Error, Result};
use rustix::event::{PollFd, PollFlags};
use rustix::fd::{BorrowedFd, OwnedFd};
use rustix::net::{AddressFamily, SocketAddrUnix, SocketFlags, SocketType};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::path::Path;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Outcome of a method call: reply body plus attached descriptors.
pub type CallResult = Result<(Body, Vec<OwnedFd>)>;

type Callback = Box<dyn FnOnce(CallResult)>;

/// A connection to the deduplication daemon.
///
/// Single-threaded by design; the service model is a cooperative event
/// loop with suspension points only at send/receive boundaries.
pub struct Connection {
    sock: OwnedFd,
    next_serial: Cell<u32>,
    pending: RefCell<HashMap<u32, Callback>>,
}

impl Connection {
    /// Connect to the daemon socket at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be created or connected.
    pub fn connect(path: &Path) -> Result<Rc<Self>> {
        let addr = SocketAddrUnix::new(path)?;
        let sock = rustix::net::socket_with(
            AddressFamily::UNIX,
            SocketType::SEQPACKET,
            SocketFlags::CLOEXEC,
            None,
        )?;
        rustix::net::connect_unix(&sock, &addr)?;
        Ok(Self::from_socket(sock))
    }

    /// Wrap an already-connected socket (e.g. one half of a socketpair).
    pub fn from_socket(sock: OwnedFd) -> Rc<Self> {
        Rc::new(Self {
            sock,
            next_serial: Cell::new(1),
            pending: RefCell::new(HashMap::new()),
        })
    }

    fn allocate_serial(&self) -> u32 {
        let serial = self.next_serial.get();
        self.next_serial.set(serial.checked_add(1).unwrap_or(1));
        serial
    }

    fn send_call(&self, method: &str, body: &Body, fds: &[BorrowedFd<'_>]) -> Result<u32> {
        let serial = self.allocate_serial();
        let frame = Frame::Call {
            serial,
            method: method.into(),
            body: body.clone(),
        };
        send_frame(&self.sock, &frame, fds)?;
        Ok(serial)
    }

    /// Invoke `method` and block for the reply, up to `timeout`.
    ///
    /// Replies to other (asynchronous) calls that arrive in the meantime
    /// are dispatched to their callbacks.
    ///
    /// # Errors
    ///
    /// [`Error::Timeout`] when the deadline passes, [`Error::Call`] for an
    /// error reply, [`Error::Disconnected`] if the daemon goes away.
    pub fn call_sync(
        &self,
        method: &str,
        body: &Body,
        fds: &[BorrowedFd<'_>],
        timeout: Duration,
    ) -> CallResult {
        let serial = self.send_call(method, body, fds)?;
        let deadline = Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || !self.wait_readable(Some(remaining))? {
                return Err(Error::Timeout);
            }

            let Some((frame, received_fds)) = recv_frame(&self.sock)? else {
                return Err(Error::Disconnected);
            };

            if frame.serial() == serial {
                return match frame {
                    Frame::Reply { body, .. } => Ok((body, received_fds)),
                    Frame::Error { code, message, .. } => Err(Error::Call { code, message }),
                    Frame::Call { .. } => Err(Error::Malformed("call frame from daemon".into())),
                };
            }
            self.complete(frame, received_fds);
        }
    }

    /// Invoke `method` and register `callback` for the eventual reply.
    ///
    /// The descriptors are sent immediately; the callback fires from a
    /// later [`dispatch`](Self::dispatch) (or from inside a concurrent
    /// [`call_sync`](Self::call_sync)) on this same thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the call cannot be sent; the callback is not
    /// registered in that case.
    pub fn call_async(
        &self,
        method: &str,
        body: &Body,
        fds: &[BorrowedFd<'_>],
        callback: Callback,
    ) -> Result<()> {
        let serial = self.send_call(method, body, fds)?;
        self.pending.borrow_mut().insert(serial, callback);
        Ok(())
    }

    /// Invoke `method` without caring about the outcome.
    ///
    /// The reply is consumed and discarded whenever it arrives.
    ///
    /// # Errors
    ///
    /// Returns an error if the call cannot be sent.
    pub fn send_oneway(&self, method: &str, body: &Body) -> Result<()> {
        let serial = self.send_call(method, body, &[])?;
        self.pending.borrow_mut().insert(serial, Box::new(|_| {}));
        Ok(())
    }

    /// Process incoming replies.
    ///
    /// Waits up to `timeout` for the first frame (`None` means do not
    /// wait), then drains everything already readable. Returns the number
    /// of frames processed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disconnected`] if the daemon goes away, or the
    /// underlying transport error.
    pub fn dispatch(&self, timeout: Option<Duration>) -> Result<usize> {
        let mut processed = 0;
        let mut wait = timeout;

        loop {
            if !self.wait_readable(wait.take().or(Some(Duration::ZERO)))? {
                return Ok(processed);
            }
            let Some((frame, fds)) = recv_frame(&self.sock)? else {
                return Err(Error::Disconnected);
            };
            self.complete(frame, fds);
            processed += 1;
        }
    }

    /// Number of calls still waiting for a reply.
    pub fn pending_calls(&self) -> usize {
        self.pending.borrow().len()
    }

    fn complete(&self, frame: Frame, fds: Vec<OwnedFd>) {
        let serial = frame.serial();
        // Take the callback out before invoking it: the callback may well
        // re-enter this connection (e.g. to send a Forget).
        let Some(callback) = self.pending.borrow_mut().remove(&serial) else {
            return;
        };
        match frame {
            Frame::Reply { body, .. } => callback(Ok((body, fds))),
            Frame::Error { code, message, .. } => callback(Err(Error::Call { code, message })),
            Frame::Call { .. } => {}
        }
    }

    fn wait_readable(&self, timeout: Option<Duration>) -> Result<bool> {
        let timeout_ms = match timeout {
            None => -1,
            Some(t) => i32::try_from(t.as_millis()).unwrap_or(i32::MAX),
        };
        let mut pollfds = [PollFd::new(&self.sock, PollFlags::IN)];
        loop {
            match rustix::event::poll(&mut pollfds, timeout_ms) {
                Ok(0) => return Ok(false),
                Ok(_) => return Ok(true),
                Err(rustix::io::Errno::INTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}
