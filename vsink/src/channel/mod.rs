// SPDX-FileCopyrightText: 2025 Contributors to the vsink project.
// SPDX-License-Identifier: Apache-2.0

//! Delivery of frames to the display consumer over a Unix stream socket.

pub mod consumer;

use std::{
    collections::HashMap,
    io::IoSlice,
    os::{
        fd::{AsFd, AsRawFd, BorrowedFd, RawFd},
        unix::net::UnixStream,
    },
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
};

use nix::{
    errno::Errno,
    sys::socket::{self, ControlMessage, MsgFlags},
};
use tracing::{debug, info, trace, warn};
use vsink_proto::{ClientMessage, Decoder, FrameInfo, Rect, ServerMessage, encode};

use crate::{
    Error, Result,
    buffer::{BufferPool, SlotRef},
    context::SinkContext,
};

const RECV_CHUNK: usize = 256;

/// Client side of the consumer protocol.
///
/// A channel is created connected and becomes terminal after
/// [`DeliveryChannel::disconnect`]. It owns no buffers: it records which
/// buffer ids are in flight and, when the consumer releases one, completes
/// the matching pool slot. Clones share the same socket.
#[derive(Clone)]
pub struct DeliveryChannel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    stream: UnixStream,
    path: Option<PathBuf>,
    pool: BufferPool,
    ctx: SinkContext,
    writer: Mutex<()>,
    state: Mutex<ChannelState>,
}

#[derive(Default)]
struct ChannelState {
    decoder: Decoder<ServerMessage>,
    /// Buffer id to number of sends not yet released.
    in_flight: HashMap<u32, u32>,
    peer_gone: bool,
    disconnected: bool,
}

impl DeliveryChannel {
    /// Connects to the consumer listening at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectFailed`] if nothing accepts connections there.
    pub fn connect(path: impl AsRef<Path>, pool: BufferPool, ctx: SinkContext) -> Result<Self> {
        let path = path.as_ref();
        let stream = UnixStream::connect(path).map_err(|source| Error::ConnectFailed {
            path: path.to_path_buf(),
            source,
        })?;
        info!("Connected to consumer at {}", path.display());
        Ok(Self::new(stream, Some(path.to_path_buf()), pool, ctx))
    }

    /// Wraps an already connected stream.
    pub fn from_stream(stream: UnixStream, pool: BufferPool, ctx: SinkContext) -> Self {
        Self::new(stream, None, pool, ctx)
    }

    fn new(stream: UnixStream, path: Option<PathBuf>, pool: BufferPool, ctx: SinkContext) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                stream,
                path,
                pool,
                ctx,
                writer: Mutex::new(()),
                state: Mutex::new(ChannelState::default()),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, ChannelState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    pub fn is_connected(&self) -> bool {
        let state = self.state();
        !state.disconnected && !state.peer_gone
    }

    pub fn is_peer_gone(&self) -> bool {
        self.state().peer_gone
    }

    /// Number of sends the consumer has not released yet.
    pub fn in_flight(&self) -> usize {
        self.state().in_flight.values().map(|&n| n as usize).sum()
    }

    fn check_usable(&self) -> Result<()> {
        let state = self.state();
        if state.disconnected {
            Err(Error::Disconnected)
        } else if state.peer_gone {
            Err(Error::PeerGone)
        } else {
            Ok(())
        }
    }

    /// Sends `slot` to the consumer for display at `frame_time_us`.
    ///
    /// The slot's plane descriptors are duplicated and passed as
    /// `SCM_RIGHTS`; the duplicates are closed once sent. The caller is
    /// expected to hold a pool lock on the slot for the consumer's
    /// reference, and to complete it if this fails.
    ///
    /// # Errors
    ///
    /// - [`Error::Disconnected`] / [`Error::PeerGone`] when the channel is no
    ///   longer usable
    /// - [`Error::SendFailed`] if `sendmsg` fails; a hang-up also marks the
    ///   peer gone
    pub fn send_frame(&self, slot: SlotRef, rect: Rect, frame_time_us: i64) -> Result<()> {
        self.check_usable()?;
        let descriptor = self.inner.pool.snapshot(slot)?;
        let frame = FrameInfo {
            width: descriptor.width,
            height: descriptor.height,
            format: descriptor.format,
            rect,
            planes: descriptor.planes,
            buffer_id: descriptor.slot.buffer_id,
            frame_time_us,
        };
        let bytes = encode(&ClientMessage::Frame(frame));
        let fds: Vec<RawFd> = descriptor.fds.iter().map(|fd| fd.as_raw_fd()).collect();

        *self.state().in_flight.entry(frame.buffer_id).or_default() += 1;
        if let Err(err) = self.send_bytes(&bytes, &fds) {
            let mut state = self.state();
            if let Some(count) = state.in_flight.get_mut(&frame.buffer_id) {
                *count -= 1;
                if *count == 0 {
                    state.in_flight.remove(&frame.buffer_id);
                }
            }
            return Err(err);
        }
        trace!(
            "Sent buffer {} at {} us with {} fd(s)",
            frame.buffer_id,
            frame_time_us,
            fds.len()
        );
        Ok(())
    }

    /// Sends a control message. Frames must go through
    /// [`Self::send_frame`].
    pub fn send_control(&self, message: &ClientMessage) -> Result<()> {
        if matches!(message, ClientMessage::Frame(_)) {
            return Err(Error::InvalidArg("frames carry descriptors, use send_frame".into()));
        }
        self.check_usable()?;
        debug!("Sending {:?}", message);
        self.send_bytes(&encode(message), &[])
    }

    fn send_bytes(&self, bytes: &[u8], fds: &[RawFd]) -> Result<()> {
        let _writer = self.inner.writer.lock().unwrap_or_else(|e| e.into_inner());
        let rights = [ControlMessage::ScmRights(fds)];
        let mut sent = 0;
        while sent < bytes.len() {
            let iov = [IoSlice::new(&bytes[sent..])];
            // descriptors ride along with the first byte only
            let cmsgs: &[ControlMessage] = if sent == 0 && !fds.is_empty() {
                &rights
            } else {
                &[]
            };
            match socket::sendmsg::<()>(
                self.inner.stream.as_raw_fd(),
                &iov,
                cmsgs,
                MsgFlags::MSG_NOSIGNAL,
                None,
            ) {
                Ok(n) => sent += n,
                Err(Errno::EINTR) => continue,
                Err(errno) => {
                    let err = Error::SendFailed(errno);
                    if err.is_peer_gone() {
                        warn!("Consumer hung up: {}", errno);
                        self.state().peer_gone = true;
                    }
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Reads and handles everything the consumer has sent, without blocking.
    ///
    /// Buffer releases complete the matching pool slot; releases for
    /// buffers not in flight are ignored. Rate, status and underflow
    /// messages update the playback state and notify the host. Returns the
    /// messages handled, in order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disconnected`] after [`Self::disconnect`], and
    /// [`Error::Errno`] for unexpected socket errors. A hang-up is not an
    /// error: it marks the peer gone, see [`Self::is_peer_gone`].
    pub fn poll(&self) -> Result<Vec<ServerMessage>> {
        let (messages, releases) = {
            let mut state = self.state();
            if state.disconnected {
                return Err(Error::Disconnected);
            }
            self.receive(&mut state)?;

            let mut messages = Vec::new();
            let mut releases = Vec::new();
            while let Some(decoded) = state.decoder.next_message() {
                let message = match decoded {
                    Ok(message) => message,
                    Err(err) => {
                        warn!("Dropping malformed consumer message: {}", err);
                        continue;
                    }
                };
                if let ServerMessage::BufferRelease { buffer_id } = message {
                    match state.in_flight.get_mut(&buffer_id) {
                        Some(count) => {
                            *count -= 1;
                            if *count == 0 {
                                state.in_flight.remove(&buffer_id);
                            }
                            releases.push(buffer_id);
                        }
                        None => debug!("Ignoring release of buffer {} not in flight", buffer_id),
                    }
                }
                messages.push(message);
            }
            (messages, releases)
        };

        for buffer_id in releases {
            self.complete(buffer_id);
        }
        for message in &messages {
            self.notify(message);
        }
        Ok(messages)
    }

    fn receive(&self, state: &mut ChannelState) -> Result<()> {
        if state.peer_gone {
            return Ok(());
        }
        let mut buf = [0u8; RECV_CHUNK];
        loop {
            match socket::recv(
                self.inner.stream.as_raw_fd(),
                &mut buf,
                MsgFlags::MSG_DONTWAIT,
            ) {
                Ok(0) => {
                    info!("Consumer closed the connection");
                    state.peer_gone = true;
                    return Ok(());
                }
                Ok(n) => state.decoder.extend(&buf[..n]),
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => return Ok(()),
                Err(Errno::ECONNRESET) => {
                    info!("Consumer reset the connection");
                    state.peer_gone = true;
                    return Ok(());
                }
                Err(errno) => return Err(errno.into()),
            }
        }
    }

    fn complete(&self, buffer_id: u32) {
        let pool = &self.inner.pool;
        let Some(slot) = pool.find_by_buffer_id(buffer_id) else {
            warn!("Release of unknown buffer {}", buffer_id);
            return;
        };
        match pool.complete(slot) {
            Ok(released) => trace!("Buffer {} released (slot free: {})", buffer_id, released),
            Err(err) => warn!("Failed to complete buffer {}: {}", buffer_id, err),
        }
    }

    fn notify(&self, message: &ServerMessage) {
        let ctx = &self.inner.ctx;
        match *message {
            ServerMessage::RateInfo { refresh_rate_hz } => {
                ctx.playback().set_refresh_rate(refresh_rate_hz);
            }
            ServerMessage::StatusUpdate {
                frame_time_us,
                num_dropped,
            } => {
                ctx.playback().set_dropped_frames(num_dropped);
                ctx.host().consumer_status(frame_time_us, num_dropped);
            }
            ServerMessage::Underflow { frame_time_us } => {
                debug!("Consumer underflow at {} us", frame_time_us);
                ctx.host().underflow(frame_time_us);
            }
            ServerMessage::BufferRelease { .. } => {}
        }
    }

    /// Shuts the socket down, waking any thread polling it. Sends and
    /// receives fail afterwards.
    pub fn shutdown(&self) {
        match self.inner.stream.shutdown(std::net::Shutdown::Both) {
            Err(err) if err.kind() != std::io::ErrorKind::NotConnected => {
                warn!("Failed to shut down consumer socket: {}", err);
            }
            _ => {}
        }
    }

    /// Shuts the socket down and force-releases every buffer still in
    /// flight. The channel cannot be used afterwards. Idempotent.
    pub fn disconnect(&self) {
        let in_flight = {
            let mut state = self.state();
            if state.disconnected {
                return;
            }
            state.disconnected = true;
            state.decoder.clear();
            std::mem::take(&mut state.in_flight)
        };
        self.shutdown();
        for (buffer_id, count) in in_flight {
            debug!("Force-releasing buffer {} ({} reference(s))", buffer_id, count);
            for _ in 0..count {
                self.complete(buffer_id);
            }
        }
        info!("Disconnected from consumer");
    }
}

impl AsFd for DeliveryChannel {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.inner.stream.as_fd()
    }
}

impl std::fmt::Debug for DeliveryChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("DeliveryChannel")
            .field("path", &self.inner.path)
            .field("in_flight", &state.in_flight)
            .field("peer_gone", &state.peer_gone)
            .field("disconnected", &state.disconnected)
            .finish()
    }
}

impl Drop for ChannelInner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|e| e.into_inner());
        if state.disconnected || state.in_flight.is_empty() {
            return;
        }
        warn!(
            "Channel dropped with {} buffer(s) in flight, releasing",
            state.in_flight.len()
        );
        for (buffer_id, count) in state.in_flight.drain() {
            let Some(slot) = self.pool.find_by_buffer_id(buffer_id) else {
                continue;
            };
            for _ in 0..count {
                if let Err(err) = self.pool.complete(slot) {
                    warn!("Failed to complete buffer {}: {}", buffer_id, err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use tracing_test::traced_test;

    use super::{consumer::ConsumerConnection, *};
    use crate::{
        buffer::{DumbAllocator, MemfdDevice, format::DRM_FORMAT_NV12},
        config::SinkSettings,
        host::NullHost,
    };

    const WAIT: Duration = Duration::from_secs(2);

    fn setup(pool_size: usize) -> (DeliveryChannel, ConsumerConnection, BufferPool) {
        let pool =
            BufferPool::new(Box::new(DumbAllocator::new(MemfdDevice::new())), pool_size).unwrap();
        let ctx = SinkContext::new(SinkSettings::default(), Arc::new(NullHost));
        let (client, server) = UnixStream::pair().unwrap();
        (
            DeliveryChannel::from_stream(client, pool.clone(), ctx),
            ConsumerConnection::from_stream(server),
            pool,
        )
    }

    fn poll_until(channel: &DeliveryChannel, done: impl Fn() -> bool) {
        let deadline = std::time::Instant::now() + WAIT;
        while !done() && std::time::Instant::now() < deadline {
            channel.poll().unwrap();
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn frame_release_returns_slot() {
        let (channel, mut consumer, pool) = setup(2);
        let slot = pool.acquire(64, 32, DRM_FORMAT_NV12).unwrap();
        pool.lock(slot).unwrap();
        channel
            .send_frame(slot, Rect::new(0, 0, 64, 32), 1_000)
            .unwrap();
        assert_eq!(channel.in_flight(), 1);

        let received = consumer.recv(Some(WAIT)).unwrap().unwrap();
        let ClientMessage::Frame(frame) = received.message else {
            panic!("expected a frame, got {:?}", received.message);
        };
        assert_eq!(frame.buffer_id, slot.buffer_id);
        assert_eq!(frame.frame_time_us, 1_000);
        assert_eq!(received.fds.len(), 2);

        consumer.release(frame.buffer_id).unwrap();
        consumer.release(frame.buffer_id).unwrap();
        poll_until(&channel, || pool.available() == 2);

        assert_eq!(pool.available(), 2);
        assert_eq!(pool.lock_count(slot).unwrap(), 0);
        assert_eq!(channel.in_flight(), 0);
    }

    #[test]
    fn disconnect_releases_in_flight_frames() {
        let (channel, _consumer, pool) = setup(1);
        let slot = pool.acquire(16, 16, DRM_FORMAT_NV12).unwrap();
        pool.lock(slot).unwrap();
        channel.send_frame(slot, Rect::default(), 0).unwrap();
        assert_eq!(pool.available(), 0);

        channel.disconnect();
        assert_eq!(pool.available(), 1);
        assert!(matches!(
            channel.send_control(&ClientMessage::Flush),
            Err(Error::Disconnected)
        ));
        assert!(matches!(channel.poll(), Err(Error::Disconnected)));
        channel.disconnect();
    }

    #[test]
    fn rate_info_updates_frame_period() {
        let (channel, mut consumer, _pool) = setup(1);
        consumer
            .send(&ServerMessage::RateInfo {
                refresh_rate_hz: 50,
            })
            .unwrap();
        let ctx_period = || channel.inner.ctx.playback().frame_period();
        poll_until(&channel, || ctx_period() == Duration::from_millis(20));
        assert_eq!(ctx_period(), Duration::from_millis(20));
    }

    #[test]
    fn control_messages_reach_consumer() {
        let (channel, mut consumer, _pool) = setup(1);
        channel.send_control(&ClientMessage::Hide(true)).unwrap();
        channel
            .send_control(&ClientMessage::SessionInfo {
                sync_type: 1,
                session_id: 4,
            })
            .unwrap();

        let first = consumer.recv(Some(WAIT)).unwrap().unwrap();
        assert_eq!(first.message, ClientMessage::Hide(true));
        let second = consumer.recv(Some(WAIT)).unwrap().unwrap();
        assert!(matches!(second.message, ClientMessage::SessionInfo { .. }));
        assert!(second.fds.is_empty());
    }

    #[test]
    fn hang_up_marks_peer_gone() {
        let (channel, consumer, pool) = setup(1);
        drop(consumer);
        channel.poll().unwrap();
        assert!(channel.is_peer_gone());

        let slot = pool.acquire(16, 16, DRM_FORMAT_NV12).unwrap();
        assert!(matches!(
            channel.send_frame(slot, Rect::default(), 0),
            Err(Error::PeerGone)
        ));
    }

    #[traced_test]
    #[test]
    fn release_of_unknown_buffer_is_ignored() {
        let (channel, mut consumer, pool) = setup(2);
        let slot = pool.acquire(16, 16, DRM_FORMAT_NV12).unwrap();
        pool.lock(slot).unwrap();

        consumer.release(slot.buffer_id).unwrap();
        consumer.release(42).unwrap();
        poll_until(&channel, || logs_contain("buffer 42 not in flight"));

        assert!(logs_contain("Ignoring release of buffer 42 not in flight"));
        assert_eq!(pool.lock_count(slot).unwrap(), 1);
        assert_eq!(pool.available(), 1);
    }
}
