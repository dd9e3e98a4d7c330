// SPDX-FileCopyrightText: 2025 Contributors to the vsink project.
// SPDX-License-Identifier: Apache-2.0

//! A minimal display consumer.
//!
//! Listens on a socket, reports a refresh rate to every sink that connects,
//! logs what it receives and releases each frame after holding it for one
//! refresh period. Run it next to the `test-pattern` example:
//!
//! ```text
//! cargo run --example loopback-consumer -- --socket /tmp/vsink.sock
//! cargo run --example test-pattern -- --socket /tmp/vsink.sock
//! ```

mod common;

use std::{path::PathBuf, time::Duration};

use clap::Parser;
use tracing::{info, warn};
use vsink::{
    Error,
    buffer::format::fourcc_name,
    channel::consumer::{ConsumerConnection, ConsumerListener},
    proto::{ClientMessage, ServerMessage},
};

#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Socket path to listen on
    #[arg(short, long, default_value = "/tmp/vsink.sock")]
    socket: PathBuf,

    /// Refresh rate reported to the sink, in Hz
    #[arg(short, long, default_value_t = 60)]
    rate: u32,

    /// Report a status update every this many frames
    #[arg(long, default_value_t = 30)]
    status_interval: u32,

    /// Exit after the first sink disconnects
    #[arg(long)]
    once: bool,
}

fn serve(mut conn: ConsumerConnection, args: &Args) -> vsink::Result<()> {
    conn.send(&ServerMessage::RateInfo {
        refresh_rate_hz: args.rate,
    })?;
    let period = Duration::from_secs(1) / args.rate.max(1);
    let mut frames = 0u32;
    let mut last_time = None;

    loop {
        let received = match conn.recv(Some(Duration::from_secs(1))) {
            Ok(Some(received)) => received,
            Ok(None) => {
                if let Some(frame_time_us) = last_time.take() {
                    warn!("No frame for a second");
                    conn.send(&ServerMessage::Underflow { frame_time_us })?;
                }
                continue;
            }
            Err(Error::PeerGone) => break,
            Err(err) => return Err(err),
        };

        match received.message {
            ClientMessage::Frame(frame) => {
                frames += 1;
                info!(
                    "Frame {} buffer {}: {}x{} {} at {} us, {} plane(s)",
                    frames,
                    frame.buffer_id,
                    frame.width,
                    frame.height,
                    fourcc_name(frame.format),
                    frame.frame_time_us,
                    received.fds.len()
                );
                std::thread::sleep(period);
                // closing our descriptors before the release
                drop(received.fds);
                conn.release(frame.buffer_id)?;
                last_time = Some(frame.frame_time_us);

                if args.status_interval > 0 && frames % args.status_interval == 0 {
                    conn.send(&ServerMessage::StatusUpdate {
                        frame_time_us: frame.frame_time_us,
                        num_dropped: 0,
                    })?;
                }
            }
            other => info!("Control: {:?}", other),
        }
    }
    info!("Sink disconnected after {} frame(s)", frames);
    Ok(())
}

fn main() -> vsink::Result<()> {
    common::setup_logging();
    let args = Args::parse();

    let listener = ConsumerListener::bind(&args.socket)?;
    loop {
        let conn = listener.accept()?;
        if let Err(err) = serve(conn, &args) {
            warn!("Session ended with error: {}", err);
        }
        if args.once {
            return Ok(());
        }
    }
}
