//! Daemon-side transport loop.
//!
//! Single-threaded: one `poll` across the listening socket, every peer
//! connection, and a shutdown pipe. Calls are dispatched to the
//! [`Service`] one at a time in arrival order, which gives each peer
//! send-order handling for free.

use crate::bus::transport::{recv_frame, send_frame};
use crate::bus::wire::Frame;
use crate::error::{Error, Result};
use crate::service::Service;
use rustix::event::{PollFd, PollFlags};
use rustix::fd::{AsFd, OwnedFd};
use rustix::net::{AddressFamily, SocketAddrUnix, SocketFlags, SocketType};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Signals a running [`Server`] loop to exit cleanly.
pub struct ShutdownHandle {
    tx: OwnedFd,
}

impl ShutdownHandle {
    /// Ask the server loop to stop after the current poll round.
    pub fn shutdown(&self) {
        let _ = rustix::io::write(&self.tx, &[1]);
    }
}

struct PeerConn {
    name: String,
    sock: OwnedFd,
}

/// The daemon's listening endpoint plus its event loop.
pub struct Server {
    listener: OwnedFd,
    socket_path: PathBuf,
    conns: Vec<PeerConn>,
    service: Service,
    next_peer: u64,
    shutdown_rx: OwnedFd,
    shutdown_tx: OwnedFd,
}

impl Server {
    /// Bind the session socket at `path` and prepare an empty service.
    ///
    /// A stale socket file with no listener behind it is swept and
    /// rebound. A live listener keeps the name unless `replace` is set,
    /// in which case the socket is taken over (the previous daemon stops
    /// receiving new connections).
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyRunning`] when the name is taken and
    /// `replace` is not set, or the underlying errno for other failures.
    pub fn bind(path: &Path, replace: bool) -> Result<Self> {
        let addr = SocketAddrUnix::new(path)?;
        let listener = rustix::net::socket_with(
            AddressFamily::UNIX,
            SocketType::SEQPACKET,
            SocketFlags::CLOEXEC | SocketFlags::NONBLOCK,
            None,
        )?;

        let mut bound = rustix::net::bind_unix(&listener, &addr);
        if bound == Err(rustix::io::Errno::ADDRINUSE) && (replace || Self::is_stale(&addr)?) {
            std::fs::remove_file(path)?;
            bound = rustix::net::bind_unix(&listener, &addr);
        }
        bound.map_err(|_| Error::AlreadyRunning(path.display().to_string()))?;

        rustix::net::listen(&listener, 8)?;

        let (shutdown_rx, shutdown_tx) = rustix::pipe::pipe_with(rustix::pipe::PipeFlags::CLOEXEC)?;

        Ok(Self {
            listener,
            socket_path: path.to_path_buf(),
            conns: Vec::new(),
            service: Service::new(),
            next_peer: 0,
            shutdown_rx,
            shutdown_tx,
        })
    }

    /// Whether the bound socket file has no listener behind it.
    fn is_stale(addr: &SocketAddrUnix) -> Result<bool> {
        let probe = rustix::net::socket_with(
            AddressFamily::UNIX,
            SocketType::SEQPACKET,
            SocketFlags::CLOEXEC,
            None,
        )?;
        Ok(rustix::net::connect_unix(&probe, addr).is_err())
    }

    /// Path of the bound session socket.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Obtain a handle that can stop the loop from another thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the shutdown pipe cannot be duplicated.
    pub fn shutdown_handle(&self) -> Result<ShutdownHandle> {
        let tx = rustix::io::fcntl_dupfd_cloexec(&self.shutdown_tx, 0)?;
        Ok(ShutdownHandle { tx })
    }

    /// The service state (stats and tables).
    pub fn service(&self) -> &Service {
        &self.service
    }

    /// Run the event loop until a shutdown is signalled.
    ///
    /// # Errors
    ///
    /// Returns an error only on unrecoverable poll failure; individual
    /// peer failures tear down that peer and keep the loop running.
    pub fn run(&mut self) -> Result<()> {
        loop {
            let mut pollfds = Vec::with_capacity(2 + self.conns.len());
            pollfds.push(PollFd::new(&self.shutdown_rx, PollFlags::IN));
            pollfds.push(PollFd::new(&self.listener, PollFlags::IN));
            for conn in &self.conns {
                pollfds.push(PollFd::new(&conn.sock, PollFlags::IN | PollFlags::HUP));
            }

            match rustix::event::poll(&mut pollfds, -1) {
                Ok(_) => {}
                Err(rustix::io::Errno::INTR) => continue,
                Err(e) => return Err(e.into()),
            }

            let stop = !pollfds[0].revents().is_empty();
            let accept_ready = !pollfds[1].revents().is_empty();
            let ready: Vec<bool> = pollfds[2..]
                .iter()
                .map(|p| !p.revents().is_empty())
                .collect();
            drop(pollfds);

            if stop {
                debug!("shutdown requested");
                return Ok(());
            }

            if accept_ready {
                self.accept_one();
            }

            let mut dead = Vec::new();
            for (i, is_ready) in ready.iter().enumerate() {
                if *is_ready && !self.service_conn(i) {
                    dead.push(i);
                }
            }
            for i in dead.into_iter().rev() {
                let conn = self.conns.remove(i);
                self.service.peer_vanished(&conn.name);
            }
        }
    }

    fn accept_one(&mut self) {
        match rustix::net::accept_with(&self.listener, SocketFlags::CLOEXEC) {
            Ok(sock) => {
                self.next_peer += 1;
                let name = format!(":1.{}", self.next_peer);
                debug!(peer = %name, "peer connected");
                self.conns.push(PeerConn { name, sock });
            }
            Err(rustix::io::Errno::AGAIN) => {}
            Err(e) => warn!(error = %e, "accept failed"),
        }
    }

    /// Service one readable connection. Returns false when the peer is
    /// gone and must be swept.
    fn service_conn(&mut self, i: usize) -> bool {
        let (frame, fds) = match recv_frame(&self.conns[i].sock) {
            Ok(Some(received)) => received,
            Ok(None) => return false,
            Err(e) => {
                debug!(peer = %self.conns[i].name, error = %e, "receive failed");
                return false;
            }
        };

        let Frame::Call {
            serial,
            method,
            body,
        } = frame
        else {
            debug!(peer = %self.conns[i].name, "unexpected non-call frame");
            return false;
        };

        let sender = self.conns[i].name.clone();
        let reply = match self.service.dispatch(&sender, &method, &body, fds) {
            Ok((body, reply_fds)) => {
                let borrowed: Vec<_> = reply_fds.iter().map(AsFd::as_fd).collect();
                send_frame(&self.conns[i].sock, &Frame::Reply { serial, body }, &borrowed)
            }
            Err(e) => send_frame(
                &self.conns[i].sock,
                &Frame::Error {
                    serial,
                    code: e.code,
                    message: e.message,
                },
                &[],
            ),
        };

        if let Err(e) = &reply {
            debug!(peer = %sender, error = %e, "reply failed");
        }
        reply.is_ok()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.socket_path);
    }
}
