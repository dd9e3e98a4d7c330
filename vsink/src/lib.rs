// SPDX-FileCopyrightText: 2025 Contributors to the vsink project.
// SPDX-License-Identifier: Apache-2.0

//! # vsink - video sink core
//!
//! Frame buffer lifecycle and cross-process delivery for a video sink that
//! presents decoded frames through an external display consumer (a
//! compositor or video server process).
//!
//! ## Overview
//!
//! Frames are written into a fixed pool of plane-backed buffers, handed to
//! the consumer by sending their geometry together with duplicated dma-buf
//! descriptors over a Unix stream socket, and recycled when the consumer
//! releases them. The wire format lives in [`vsink_proto`].
//!
//! ### Key Concepts
//!
//! - **Slot**: one pool entry holding a multi-plane buffer ([`buffer::BufferPool`])
//! - **Strategy**: where slot storage comes from, local dumb buffers or
//!   imported upstream dma-bufs ([`buffer::BufferStrategy`])
//! - **Channel**: the consumer connection ([`channel::DeliveryChannel`])
//! - **Producer**: writes frames into slots and sends them ([`producer::FrameProducer`])
//! - **Controller**: the Null/Ready/Paused/Playing lifecycle
//!   ([`lifecycle::LifecycleController`])
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────┐
//! │ LifecycleController │──► DispatchLoop (display, channel, EOS threads)
//! └──────────┬──────────┘
//!            │
//!            ├─► BufferPool ◄── BufferStrategy (DumbAllocator / ImportStrategy)
//!            │       ▲
//!            │       │ complete(slot) on BufferRelease
//!            │       │
//!            └─► FrameProducer ──► DeliveryChannel ══ socket ══► consumer
//! ```
//!
//! Without a reachable consumer the sink keeps running in a local-only mode
//! in which frames only advance the presentation position.
//!
//! ## Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use vsink::{
//!     buffer::format::DRM_FORMAT_XRGB8888,
//!     config::SinkSettings,
//!     context::SinkContext,
//!     host::NullHost,
//!     lifecycle::{LifecycleController, State},
//!     producer::{FrameData, RawPlane, VideoFrame},
//! };
//!
//! # fn main() -> Result<(), vsink::Error> {
//! let ctx = SinkContext::new(SinkSettings::default(), Arc::new(NullHost));
//! let mut sink = LifecycleController::with_dumb_buffers(ctx);
//! sink.set_state(State::Playing)?;
//!
//! let pixels = vec![0u8; 640 * 480 * 4];
//! let producer = sink.producer().expect("pool exists while playing");
//! producer.submit(&VideoFrame {
//!     width: 640,
//!     height: 480,
//!     format: DRM_FORMAT_XRGB8888,
//!     timestamp_us: Some(0),
//!     data: FrameData::Raw(vec![RawPlane { data: &pixels, stride: 640 * 4 }]),
//! })?;
//!
//! sink.signal_eos();
//! sink.set_state(State::Null)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Thread Safety
//!
//! - [`buffer::BufferPool`], [`channel::DeliveryChannel`] and
//!   [`producer::FrameProducer`] are cheap clones over shared state and may
//!   be used from any thread
//! - [`lifecycle::LifecycleController`] is driven from one thread at a time

mod error;

pub mod buffer;
pub mod channel;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod host;
pub mod lifecycle;
pub mod producer;
pub mod time;

pub use error::{Error, Result};
pub use vsink_proto as proto;
