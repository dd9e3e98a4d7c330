// SPDX-FileCopyrightText: 2025 Contributors to the vsink project.
// SPDX-License-Identifier: Apache-2.0

//! Consumer side of the protocol.
//!
//! [`ConsumerListener`] and [`ConsumerConnection`] implement the display
//! consumer's end of the socket: they receive frames together with their
//! descriptors and send releases and status back. Tools, tests and simple
//! consumers use them instead of reimplementing the framing.

use std::{
    collections::VecDeque,
    io::{IoSlice, IoSliceMut},
    os::{
        fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd},
        unix::net::{UnixListener, UnixStream},
    },
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use nix::{
    errno::Errno,
    poll::{PollFd, PollFlags, PollTimeout, poll},
    sys::socket::{self, ControlMessageOwned, MsgFlags},
};
use tracing::{debug, error, info, warn};
use vsink_proto::{ClientMessage, Decoder, MAX_PLANES, ServerMessage, encode};

use crate::{Error, Result};

/// A listening consumer socket. The socket file is removed on drop.
#[derive(Debug)]
pub struct ConsumerListener {
    listener: UnixListener,
    path: PathBuf,
}

impl ConsumerListener {
    /// Binds a listening socket at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the path is in use or not writable.
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let listener = UnixListener::bind(&path)?;
        info!("Consumer listening at {}", path.display());
        Ok(Self { listener, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Blocks until a sink connects.
    pub fn accept(&self) -> Result<ConsumerConnection> {
        let (stream, _) = self.listener.accept()?;
        debug!("Sink connected");
        Ok(ConsumerConnection::from_stream(stream))
    }
}

impl Drop for ConsumerListener {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            error!(
                "Failed to remove consumer socket {}: {}",
                self.path.display(),
                err
            );
        }
    }
}

/// A message received from the sink, with the descriptors that came with
/// it (one per plane for frames, none otherwise).
#[derive(Debug)]
pub struct Received {
    pub message: ClientMessage,
    pub fds: Vec<OwnedFd>,
}

/// One accepted sink connection.
#[derive(Debug)]
pub struct ConsumerConnection {
    stream: UnixStream,
    decoder: Decoder<ClientMessage>,
    fds: VecDeque<OwnedFd>,
    closed: bool,
}

impl ConsumerConnection {
    pub fn from_stream(stream: UnixStream) -> Self {
        Self {
            stream,
            decoder: Decoder::new(),
            fds: VecDeque::new(),
            closed: false,
        }
    }

    /// Receives the next message, waiting up to `timeout` (forever when
    /// `None`). Returns `Ok(None)` on timeout.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PeerGone`] once the sink closed the connection and
    /// every buffered message was returned.
    pub fn recv(&mut self, timeout: Option<Duration>) -> Result<Option<Received>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            while let Some(decoded) = self.decoder.next_message() {
                match decoded {
                    Ok(message) => return Ok(Some(self.attach_fds(message))),
                    Err(err) => warn!("Dropping malformed sink message: {}", err),
                }
            }
            if self.closed {
                return Err(Error::PeerGone);
            }

            let wait = match deadline {
                None => PollTimeout::NONE,
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return Ok(None);
                    }
                    PollTimeout::try_from(left).unwrap_or(PollTimeout::MAX)
                }
            };
            let ready = {
                let mut fds = [PollFd::new(self.stream.as_fd(), PollFlags::POLLIN)];
                poll(&mut fds, wait)
            };
            match ready {
                Ok(0) => continue,
                Ok(_) => self.read()?,
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(errno.into()),
            }
        }
    }

    fn attach_fds(&mut self, message: ClientMessage) -> Received {
        let wanted = match &message {
            ClientMessage::Frame(frame) => frame.plane_count(),
            _ => 0,
        };
        if self.fds.len() < wanted {
            warn!(
                "Frame expects {} descriptor(s), only {} received",
                wanted,
                self.fds.len()
            );
        }
        let take = wanted.min(self.fds.len());
        Received {
            message,
            fds: self.fds.drain(..take).collect(),
        }
    }

    fn read(&mut self) -> Result<()> {
        let mut buf = [0u8; 512];
        let mut iov = [IoSliceMut::new(&mut buf)];
        let mut cmsg = nix::cmsg_space!([RawFd; 4 * MAX_PLANES]);
        let received = match socket::recvmsg::<socket::UnixAddr>(
            self.stream.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg),
            MsgFlags::MSG_CMSG_CLOEXEC,
        ) {
            Ok(msg) => msg,
            Err(Errno::EINTR | Errno::EAGAIN) => return Ok(()),
            Err(Errno::ECONNRESET) => {
                self.closed = true;
                return Ok(());
            }
            Err(errno) => return Err(errno.into()),
        };

        for cmsg in received.cmsgs()? {
            match cmsg {
                ControlMessageOwned::ScmRights(fds) => {
                    self.fds.extend(fds.into_iter().map(|fd| unsafe {
                        // Safety: the descriptor was just received and is owned by no one else
                        OwnedFd::from_raw_fd(fd)
                    }));
                }
                other => warn!("Unexpected control message: {:?}", other),
            }
        }

        let bytes = received.bytes;
        if bytes == 0 {
            debug!("Sink closed the connection");
            self.closed = true;
        }
        self.decoder.extend(&buf[..bytes]);
        Ok(())
    }

    /// Sends one message to the sink.
    pub fn send(&mut self, message: &ServerMessage) -> Result<()> {
        let bytes = encode(message);
        let mut sent = 0;
        while sent < bytes.len() {
            let iov = [IoSlice::new(&bytes[sent..])];
            match socket::sendmsg::<()>(
                self.stream.as_raw_fd(),
                &iov,
                &[],
                MsgFlags::MSG_NOSIGNAL,
                None,
            ) {
                Ok(n) => sent += n,
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(Error::SendFailed(errno)),
            }
        }
        Ok(())
    }

    /// Tells the sink it may reuse `buffer_id`.
    pub fn release(&mut self, buffer_id: u32) -> Result<()> {
        self.send(&ServerMessage::BufferRelease { buffer_id })
    }
}
