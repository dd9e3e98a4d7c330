// SPDX-FileCopyrightText: 2025 Contributors to the vsink project.
// SPDX-License-Identifier: Apache-2.0

//! Background threads servicing the display connection, the consumer
//! channel and end-of-stream detection.

use std::{
    io,
    os::fd::AsFd,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
};

use nix::{
    errno::Errno,
    poll::{PollFd, PollFlags, PollTimeout, poll},
};
use tracing::{debug, error, info, trace, warn};

use crate::{Error, Result, channel::DeliveryChannel, context::SinkContext};

/// A display server connection whose events need pumping, e.g. the
/// compositor connection the sink's surface lives on.
pub trait DisplayConnection: Send {
    /// Dispatches already queued events without blocking. Returns how many
    /// were dispatched.
    fn dispatch_pending(&mut self) -> io::Result<usize>;

    /// Flushes requests and waits for the server to process them.
    fn roundtrip(&mut self) -> io::Result<()>;
}

/// Set of cooperatively cancellable service threads.
///
/// Every thread sleeps at most one frame period between checks of the
/// shared stop flag; the channel thread is additionally woken by shutting
/// the socket down.
#[derive(Debug)]
pub struct DispatchLoop {
    stop: Arc<AtomicBool>,
    channel: Option<DeliveryChannel>,
    threads: Vec<JoinHandle<()>>,
}

impl DispatchLoop {
    /// Starts the EOS thread, plus the channel thread when a consumer is
    /// connected and the display thread when a display is given.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if a thread cannot be spawned; threads already
    /// started are stopped again.
    pub fn start(
        ctx: SinkContext,
        channel: Option<DeliveryChannel>,
        display: Option<Box<dyn DisplayConnection>>,
    ) -> Result<Self> {
        let mut dispatch = Self {
            stop: Arc::new(AtomicBool::new(false)),
            channel: channel.clone(),
            threads: Vec::new(),
        };

        let spawned = (|| -> Result<()> {
            if let Some(display) = display {
                let (ctx, stop) = (ctx.clone(), dispatch.stop.clone());
                dispatch.spawn("vsink-display", move || display_loop(ctx, stop, display))?;
            }
            if let Some(channel) = channel {
                let (ctx, stop) = (ctx.clone(), dispatch.stop.clone());
                dispatch.spawn("vsink-channel", move || channel_loop(ctx, stop, channel))?;
            }
            let stop = dispatch.stop.clone();
            dispatch.spawn("vsink-eos", move || eos_loop(ctx, stop))?;
            Ok(())
        })();

        if let Err(err) = spawned {
            dispatch.stop();
            return Err(err);
        }
        debug!("Started {} dispatch thread(s)", dispatch.threads.len());
        Ok(dispatch)
    }

    fn spawn(&mut self, name: &str, body: impl FnOnce() + Send + 'static) -> Result<()> {
        let handle = thread::Builder::new().name(name.to_owned()).spawn(body)?;
        self.threads.push(handle);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        !self.threads.is_empty()
    }

    /// Stops and joins every thread. Idempotent.
    pub fn stop(&mut self) {
        if self.threads.is_empty() {
            return;
        }
        self.stop.store(true, Ordering::Release);
        if let Some(channel) = &self.channel {
            channel.shutdown();
        }
        for handle in self.threads.drain(..) {
            let name = handle.thread().name().unwrap_or("?").to_owned();
            if handle.join().is_err() {
                error!("Dispatch thread {} panicked", name);
            }
        }
        debug!("Dispatch threads stopped");
    }
}

impl Drop for DispatchLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

fn stopped(stop: &AtomicBool) -> bool {
    stop.load(Ordering::Acquire)
}

fn display_loop(ctx: SinkContext, stop: Arc<AtomicBool>, mut display: Box<dyn DisplayConnection>) {
    while !stopped(&stop) {
        match display.dispatch_pending() {
            Ok(0) if !ctx.playback().upstream_eos() => {
                if let Err(err) = display.roundtrip() {
                    warn!("Display roundtrip failed: {}", err);
                    break;
                }
            }
            Ok(n) => trace!("Dispatched {} display event(s)", n),
            Err(err) => {
                warn!("Display dispatch failed: {}", err);
                break;
            }
        }
        thread::sleep(ctx.playback().frame_period());
    }
    debug!("Display thread exiting");
}

fn channel_loop(ctx: SinkContext, stop: Arc<AtomicBool>, channel: DeliveryChannel) {
    while !stopped(&stop) {
        let timeout =
            PollTimeout::try_from(ctx.playback().frame_period()).unwrap_or(PollTimeout::MAX);
        let ready = {
            let mut fds = [PollFd::new(channel.as_fd(), PollFlags::POLLIN)];
            poll(&mut fds, timeout)
        };
        match ready {
            Ok(0) => continue,
            Ok(_) => {}
            Err(Errno::EINTR) => continue,
            Err(errno) => {
                error!("Polling consumer socket failed: {}", errno);
                break;
            }
        }

        match channel.poll() {
            Ok(_) => {}
            Err(Error::Disconnected) => break,
            Err(err) => warn!("Consumer channel error: {}", err),
        }
        if channel.is_peer_gone() {
            if !stopped(&stop) {
                info!("Consumer hung up");
                // its buffers will never come back
                channel.disconnect();
            }
            break;
        }
    }
    debug!("Channel thread exiting");
}

/// Posts end-of-stream once upstream finished and the presented-frame
/// counter stopped moving for `eos_detect_frames` periods while playing.
fn eos_loop(ctx: SinkContext, stop: Arc<AtomicBool>) {
    let threshold = ctx.settings().eos_detect_frames.max(1);
    let playback = ctx.playback();
    let mut last = playback.frames_presented();
    let mut stalled = 0u32;
    while !stopped(&stop) {
        thread::sleep(playback.frame_period());
        let presented = playback.frames_presented();
        if playback.is_playing() && playback.upstream_eos() && !playback.eos_posted() {
            if presented == last {
                stalled += 1;
                if stalled >= threshold && playback.mark_eos_posted() {
                    info!("End of stream after {} frame(s)", presented);
                    ctx.host().end_of_stream();
                }
            } else {
                stalled = 0;
            }
        } else {
            stalled = 0;
        }
        last = presented;
    }
    debug!("EOS thread exiting");
}
