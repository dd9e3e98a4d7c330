// SPDX-FileCopyrightText: 2025 Contributors to the vsink project.
// SPDX-License-Identifier: Apache-2.0

//! Turning upstream frames into pool slots sent to the consumer.

use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, trace, warn};
use vsink_proto::Rect;

use crate::{
    Error, Result,
    buffer::{BufferPool, ExternalBuffer, MappedPlane, PlaneMapping, SlotRef, format},
    channel::DeliveryChannel,
    context::SinkContext,
};

/// One plane of a frame in system memory.
#[derive(Debug, Clone, Copy)]
pub struct RawPlane<'a> {
    pub data: &'a [u8],
    /// Bytes between the starts of two consecutive rows.
    pub stride: usize,
}

/// Pixel data of a frame.
#[derive(Clone)]
pub enum FrameData<'a> {
    /// Planes in system memory, copied into a locally allocated slot.
    Raw(Vec<RawPlane<'a>>),
    /// An upstream dma-buf, imported without copying when the pool uses an
    /// import strategy and copied otherwise.
    DmaBuf(Arc<dyn ExternalBuffer>),
}

impl std::fmt::Debug for FrameData<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameData::Raw(planes) => f.debug_tuple("Raw").field(&planes.len()).finish(),
            FrameData::DmaBuf(buffer) => f
                .debug_tuple("DmaBuf")
                .field(&buffer.planes().len())
                .finish(),
        }
    }
}

/// A decoded frame handed to the sink by the host pipeline.
#[derive(Debug, Clone)]
pub struct VideoFrame<'a> {
    pub width: u32,
    pub height: u32,
    /// DRM fourcc code.
    pub format: u32,
    /// Presentation timestamp in microseconds, if upstream provided one.
    pub timestamp_us: Option<i64>,
    pub data: FrameData<'a>,
}

/// What happened to a submitted frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submitted {
    /// The frame went to the consumer in `slot`.
    Sent { slot: SlotRef, frame_time_us: i64 },
    /// No consumer is connected; only the position advanced.
    LocalOnly { frame_time_us: i64 },
}

impl Submitted {
    pub fn frame_time_us(&self) -> i64 {
        match *self {
            Submitted::Sent { frame_time_us, .. } | Submitted::LocalOnly { frame_time_us } => {
                frame_time_us
            }
        }
    }
}

#[derive(Debug, Default)]
struct Session {
    channel: Option<DeliveryChannel>,
    rect: Rect,
}

/// Fills pool slots with frames and hands them to the delivery channel.
///
/// Cloneable; the lifecycle controller keeps one clone to attach and detach
/// the channel while the host's streaming thread submits through another.
#[derive(Debug, Clone)]
pub struct FrameProducer {
    ctx: SinkContext,
    pool: BufferPool,
    session: Arc<Mutex<Session>>,
}

impl FrameProducer {
    pub fn new(ctx: SinkContext, pool: BufferPool) -> Self {
        let rect = ctx.settings().render_rect;
        Self {
            ctx,
            pool,
            session: Arc::new(Mutex::new(Session {
                channel: None,
                rect,
            })),
        }
    }

    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Attaches or detaches the consumer connection.
    pub fn set_channel(&self, channel: Option<DeliveryChannel>) {
        self.session().channel = channel;
    }

    pub fn channel(&self) -> Option<DeliveryChannel> {
        self.session().channel.clone()
    }

    pub fn set_render_rect(&self, rect: Rect) {
        self.session().rect = rect;
    }

    pub fn render_rect(&self) -> Rect {
        self.session().rect
    }

    /// Presents one frame.
    ///
    /// Stamps the frame with its presentation time, then either sends it to
    /// the consumer in a pool slot or, without a connected consumer, only
    /// publishes the new position to the host.
    ///
    /// While every slot is in use this blocks, polling the channel for
    /// releases once per frame period, until a slot frees up or the pool is
    /// set flushing.
    ///
    /// # Errors
    ///
    /// - [`Error::Flushing`] if the wait was interrupted
    /// - [`Error::AllocationFailed`] / [`Error::InvalidArg`] if the frame
    ///   could not be written to a slot; the slot is returned first
    /// - [`Error::SendFailed`] if the consumer could not be reached; the slot
    ///   is returned first
    pub fn submit(&self, frame: &VideoFrame<'_>) -> Result<Submitted> {
        let frame_time_us = self.ctx.playback().next_frame_time(frame.timestamp_us);

        let Some(channel) = self.channel().filter(DeliveryChannel::is_connected) else {
            return Ok(self.present_locally(frame_time_us));
        };

        let slot = self.acquire(&channel, frame)?;
        if !channel.is_connected() {
            self.pool.release(slot)?;
            return Ok(self.present_locally(frame_time_us));
        }

        if let Err(err) = self.write(slot, frame) {
            self.pool.release(slot)?;
            return Err(err);
        }

        self.pool.lock(slot)?;
        let rect = self.render_rect();
        if let Err(err) = channel.send_frame(slot, rect, frame_time_us) {
            warn!("Failed to send buffer {}: {}", slot.buffer_id, err);
            self.pool.complete(slot)?;
            return Err(err);
        }

        self.ctx.playback().note_frame_presented();
        Ok(Submitted::Sent {
            slot,
            frame_time_us,
        })
    }

    fn present_locally(&self, frame_time_us: i64) -> Submitted {
        trace!("No consumer, advancing position to {} us", frame_time_us);
        self.ctx.playback().note_frame_presented();
        self.ctx.host().position_changed(frame_time_us);
        Submitted::LocalOnly { frame_time_us }
    }

    /// Waits for a free slot, draining consumer releases between attempts.
    fn acquire(&self, channel: &DeliveryChannel, frame: &VideoFrame<'_>) -> Result<SlotRef> {
        loop {
            let period = self.ctx.playback().frame_period();
            if let Some(slot) =
                self.pool
                    .try_acquire_for(frame.width, frame.height, frame.format, period)?
            {
                return Ok(slot);
            }
            trace!("No free slot, polling consumer");
            if let Err(err) = channel.poll() {
                debug!("Poll while waiting for a slot failed: {}", err);
            }
            if channel.is_peer_gone() {
                // its buffers will never come back
                channel.disconnect();
            }
        }
    }

    fn write(&self, slot: SlotRef, frame: &VideoFrame<'_>) -> Result<()> {
        match &frame.data {
            FrameData::DmaBuf(buffer) if !self.pool.is_local() => {
                self.pool.import(slot, buffer.clone())
            }
            FrameData::DmaBuf(buffer) => {
                let mappings = buffer
                    .planes()
                    .iter()
                    .map(|plane| {
                        let map = PlaneMapping::new(
                            plane.fd,
                            0,
                            plane.offset as usize + plane.size as usize,
                        )?;
                        Ok((map, plane.offset as usize, plane.stride as usize))
                    })
                    .collect::<Result<Vec<_>>>()?;
                let sources: Vec<RawPlane<'_>> = mappings
                    .iter()
                    .map(|(map, offset, stride)| RawPlane {
                        data: &map.as_slice()[*offset..],
                        stride: *stride,
                    })
                    .collect();
                self.copy(slot, frame, &sources)
            }
            FrameData::Raw(_) if !self.pool.is_local() => {
                Err(Error::Unsupported("system memory frames on an import pool"))
            }
            FrameData::Raw(planes) => self.copy(slot, frame, planes),
        }
    }

    fn copy(&self, slot: SlotRef, frame: &VideoFrame<'_>, sources: &[RawPlane<'_>]) -> Result<()> {
        let geometry =
            format::plane_geometry(frame.format, frame.width, frame.height).ok_or_else(|| {
                Error::InvalidArg(format!(
                    "unsupported format {}",
                    format::fourcc_name(frame.format)
                ))
            })?;
        if sources.len() != geometry.len() {
            return Err(Error::InvalidArg(format!(
                "{} planes supplied, format needs {}",
                sources.len(),
                geometry.len()
            )));
        }
        self.pool.fill(slot, |planes: &mut [MappedPlane]| {
            for ((dst, src), plane) in planes.iter_mut().zip(sources).zip(&geometry) {
                copy_plane(dst, src, plane.row_bytes(), plane.height as usize)?;
            }
            Ok(())
        })?
    }
}

/// Copies `rows` rows of `row_bytes` from `src` into `dst`, honouring both
/// strides.
fn copy_plane(dst: &mut MappedPlane, src: &RawPlane<'_>, row_bytes: usize, rows: usize) -> Result<()> {
    let dst_stride = dst.stride as usize;
    if rows == 0 {
        return Ok(());
    }
    let needed = |stride: usize| (rows - 1) * stride + row_bytes;
    if src.stride < row_bytes || src.data.len() < needed(src.stride) {
        return Err(Error::InvalidArg(format!(
            "source plane of {} bytes with stride {} too small for {} rows of {} bytes",
            src.data.len(),
            src.stride,
            rows,
            row_bytes
        )));
    }
    let out = dst.map.as_mut_slice();
    if dst_stride < row_bytes || out.len() < needed(dst_stride) {
        return Err(Error::InvalidArg(format!(
            "slot plane of {} bytes too small for {} rows of {} bytes",
            out.len(),
            rows,
            row_bytes
        )));
    }
    for row in 0..rows {
        let from = &src.data[row * src.stride..][..row_bytes];
        out[row * dst_stride..][..row_bytes].copy_from_slice(from);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{
        os::unix::net::UnixStream,
        sync::atomic::{AtomicI64, AtomicUsize, Ordering},
        time::Duration,
    };

    use super::*;
    use crate::{
        buffer::{DumbAllocator, MemfdDevice, format::DRM_FORMAT_NV12},
        channel::consumer::ConsumerConnection,
        config::SinkSettings,
        host::PipelineHost,
    };

    #[derive(Default)]
    struct RecordingHost {
        positions: AtomicUsize,
        last_position: AtomicI64,
    }

    impl PipelineHost for RecordingHost {
        fn position_changed(&self, frame_time_us: i64) {
            self.positions.fetch_add(1, Ordering::SeqCst);
            self.last_position.store(frame_time_us, Ordering::SeqCst);
        }
    }

    fn producer(host: Arc<RecordingHost>, pool_size: usize) -> FrameProducer {
        let ctx = SinkContext::new(SinkSettings::default(), host);
        let pool =
            BufferPool::new(Box::new(DumbAllocator::new(MemfdDevice::new())), pool_size).unwrap();
        FrameProducer::new(ctx, pool)
    }

    fn nv12_frame<'a>(luma: &'a [u8], chroma: &'a [u8], ts: Option<i64>) -> VideoFrame<'a> {
        VideoFrame {
            width: 8,
            height: 4,
            format: DRM_FORMAT_NV12,
            timestamp_us: ts,
            data: FrameData::Raw(vec![
                RawPlane {
                    data: luma,
                    stride: 8,
                },
                RawPlane {
                    data: chroma,
                    stride: 8,
                },
            ]),
        }
    }

    #[test]
    fn without_consumer_only_position_advances() {
        let host = Arc::new(RecordingHost::default());
        let producer = producer(host.clone(), 2);
        let (luma, chroma) = ([0u8; 32], [0u8; 16]);

        for ts in [0, 33_000, 66_000] {
            let submitted = producer.submit(&nv12_frame(&luma, &chroma, Some(ts))).unwrap();
            assert_eq!(submitted, Submitted::LocalOnly { frame_time_us: ts });
        }
        assert_eq!(host.positions.load(Ordering::SeqCst), 3);
        assert_eq!(host.last_position.load(Ordering::SeqCst), 66_000);
        assert_eq!(producer.pool().available(), 2);
    }

    #[test]
    fn frame_is_copied_row_by_row() {
        let host = Arc::new(RecordingHost::default());
        let producer = producer(host, 1);
        let (client, server) = UnixStream::pair().unwrap();
        let mut consumer = ConsumerConnection::from_stream(server);
        producer.set_channel(Some(DeliveryChannel::from_stream(
            client,
            producer.pool().clone(),
            producer.ctx.clone(),
        )));

        let luma: Vec<u8> = (0..32).collect();
        let chroma = [0x80u8; 16];
        let Submitted::Sent { slot, .. } = producer
            .submit(&nv12_frame(&luma, &chroma, Some(5)))
            .unwrap()
        else {
            panic!("frame was not sent");
        };

        let received = consumer
            .recv(Some(Duration::from_secs(2)))
            .unwrap()
            .unwrap();
        assert_eq!(received.fds.len(), 2);
        // locked while the consumer holds it
        assert!(producer.pool().fill(slot, |_| ()).is_err());

        let luma_map = PlaneMapping::new(&received.fds[0], 0, 64 * 4).unwrap();
        let luma_stride = match received.message {
            vsink_proto::ClientMessage::Frame(frame) => frame.planes[0].stride as usize,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(&luma_map.as_slice()[..8], &luma[..8]);
        assert_eq!(&luma_map.as_slice()[luma_stride..luma_stride + 8], &luma[8..16]);
    }

    #[test]
    fn short_plane_is_rejected_and_slot_returned() {
        let host = Arc::new(RecordingHost::default());
        let producer = producer(host, 1);
        let (client, _server) = UnixStream::pair().unwrap();
        producer.set_channel(Some(DeliveryChannel::from_stream(
            client,
            producer.pool().clone(),
            producer.ctx.clone(),
        )));

        let (luma, chroma) = ([0u8; 31], [0u8; 16]);
        let err = producer
            .submit(&nv12_frame(&luma, &chroma, None))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArg(_)));
        assert_eq!(producer.pool().available(), 1);
    }

    #[test]
    fn failed_send_returns_slot_at_once() {
        let host = Arc::new(RecordingHost::default());
        let producer = producer(host, 2);
        let (client, server) = UnixStream::pair().unwrap();
        producer.set_channel(Some(DeliveryChannel::from_stream(
            client,
            producer.pool().clone(),
            producer.ctx.clone(),
        )));
        drop(server);

        let (luma, chroma) = ([0u8; 32], [0u8; 16]);
        let err = producer
            .submit(&nv12_frame(&luma, &chroma, Some(0)))
            .unwrap_err();
        assert!(matches!(err, Error::SendFailed(nix::errno::Errno::EPIPE)));
        assert_eq!(producer.pool().available(), 2);
        assert_eq!(producer.channel().unwrap().in_flight(), 0);
    }

    #[test]
    fn blocked_submit_collects_releases_itself() {
        let host = Arc::new(RecordingHost::default());
        let producer = producer(host, 1);
        let (client, server) = UnixStream::pair().unwrap();
        let mut consumer = ConsumerConnection::from_stream(server);
        producer.set_channel(Some(DeliveryChannel::from_stream(
            client,
            producer.pool().clone(),
            producer.ctx.clone(),
        )));
        let (luma, chroma) = ([0u8; 32], [0u8; 16]);

        let Submitted::Sent { slot: first, .. } = producer
            .submit(&nv12_frame(&luma, &chroma, Some(0)))
            .unwrap()
        else {
            panic!("first frame was not sent");
        };
        assert_eq!(producer.pool().available(), 0);

        // no dispatch thread: only the waiting producer reads the release
        let received = consumer
            .recv(Some(Duration::from_secs(2)))
            .unwrap()
            .unwrap();
        let vsink_proto::ClientMessage::Frame(frame) = received.message else {
            panic!("expected a frame");
        };
        consumer.release(frame.buffer_id).unwrap();

        let second = producer
            .submit(&nv12_frame(&luma, &chroma, Some(33_000)))
            .unwrap();
        assert_eq!(
            second,
            Submitted::Sent {
                slot: first,
                frame_time_us: 33_000
            }
        );
    }
}
