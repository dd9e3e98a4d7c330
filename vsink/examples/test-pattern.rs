// SPDX-FileCopyrightText: 2025 Contributors to the vsink project.
// SPDX-License-Identifier: Apache-2.0

//! Plays a moving test pattern through the sink.
//!
//! Generates XRGB8888 frames in system memory and submits them at the
//! requested rate. Without a consumer on the socket the sink falls back to
//! local-only presentation and the example only logs positions.

mod common;

use std::{
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use clap::Parser;
use tracing::info;
use vsink::{
    buffer::format::DRM_FORMAT_XRGB8888,
    config::SinkSettings,
    context::SinkContext,
    host::PipelineHost,
    lifecycle::{LifecycleController, State},
    producer::{FrameData, RawPlane, Submitted, VideoFrame},
    time,
};

#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Consumer socket path
    #[arg(short, long, default_value = "/tmp/vsink.sock")]
    socket: PathBuf,

    /// Frame width
    #[arg(long, default_value_t = 320)]
    width: u32,

    /// Frame height
    #[arg(long, default_value_t = 240)]
    height: u32,

    /// Number of frames to play
    #[arg(short, long, default_value_t = 120)]
    frames: u32,

    /// Frames per second
    #[arg(long, default_value_t = 30)]
    fps: u32,

    /// Buffer pool size
    #[arg(long, default_value_t = 4)]
    pool_size: usize,

    /// Allocate from this DRM device instead of memfd
    #[arg(long)]
    device: Option<PathBuf>,

    /// Load the sink settings from a JSON file; command line options
    /// override the socket and pool size
    #[arg(long)]
    config: Option<PathBuf>,
}

struct LoggingHost;

impl PipelineHost for LoggingHost {
    fn end_of_stream(&self) {
        info!("End of stream");
    }

    fn underflow(&self, frame_time_us: i64) {
        info!("Consumer underflow at {} us", frame_time_us);
    }

    fn consumer_status(&self, frame_time_us: i64, num_dropped: u32) {
        info!("Consumer at {} us, {} dropped", frame_time_us, num_dropped);
    }
}

fn pattern(buf: &mut [u8], width: u32, height: u32, frame: u32) {
    let stride = width as usize * 4;
    for y in 0..height as usize {
        for x in 0..width as usize {
            let px = &mut buf[y * stride + x * 4..][..4];
            let band = ((x as u32 + frame * 4) / 32) % 3;
            px.copy_from_slice(&match band {
                0 => [0x20, 0x20, 0xe0, 0xff],
                1 => [0x20, 0xe0, 0x20, 0xff],
                _ => [0xe0, 0x20, 0x20, 0xff],
            });
            if y as u32 == frame % height {
                px.copy_from_slice(&[0xff; 4]);
            }
        }
    }
}

fn main() -> vsink::Result<()> {
    common::setup_logging();
    let args = Args::parse();

    let mut settings = match &args.config {
        Some(path) => SinkSettings::from_json(&std::fs::read_to_string(path)?)?,
        None => SinkSettings::default(),
    };
    settings.socket_path = Some(args.socket.clone());
    settings.pool_size = args.pool_size;
    if let Some(device) = &args.device {
        settings.device_path = device.clone();
    }

    let ctx = SinkContext::new(settings, Arc::new(LoggingHost));
    let mut sink = if args.device.is_some() {
        LifecycleController::with_dumb_buffers(ctx)
    } else {
        LifecycleController::with_memfd_buffers(ctx)
    };
    sink.set_state(State::Playing)?;
    info!("Playing in {:?} mode", sink.output_mode());

    let producer = sink
        .producer()
        .ok_or_else(|| vsink::Error::InvalidState("no producer while playing".into()))?;
    let interval = Duration::from_secs(1) / args.fps.max(1);
    let start = Instant::now();
    let start_us = time::monotonic_us()?;
    let mut pixels = vec![0u8; args.width as usize * args.height as usize * 4];

    for n in 0..args.frames {
        pattern(&mut pixels, args.width, args.height, n);
        let timestamp_us = start_us + time::to_frame_time_us(interval * n);
        let submitted = producer.submit(&VideoFrame {
            width: args.width,
            height: args.height,
            format: DRM_FORMAT_XRGB8888,
            timestamp_us: Some(timestamp_us),
            data: FrameData::Raw(vec![RawPlane {
                data: &pixels,
                stride: args.width as usize * 4,
            }]),
        })?;
        if let Submitted::LocalOnly { frame_time_us } = submitted {
            info!("Frame {} presented locally at {} us", n, frame_time_us);
        }

        if let Some(wait) = (interval * (n + 1)).checked_sub(start.elapsed()) {
            std::thread::sleep(wait);
        }
    }

    sink.signal_eos();
    // leave the EOS thread time to notice the stall
    std::thread::sleep(sink.context().playback().frame_period() * 20);
    sink.set_state(State::Null)?;
    Ok(())
}
