// SPDX-FileCopyrightText: 2025 Contributors to the vsink project.
// SPDX-License-Identifier: Apache-2.0

//! Notifications sent from the sink core to the host media pipeline.

/// The host media pipeline, as seen from the sink core.
///
/// The host delivers frames and drives lifecycle transitions by calling into
/// the core; this trait is the opposite direction. Callbacks run on whichever
/// sink thread observed the event (producer, channel or EOS thread) and must
/// not call back into the lifecycle controller.
///
/// Every method has a no-op default so hosts only implement what they use.
pub trait PipelineHost: Send + Sync {
    /// Playback reached end-of-stream: upstream signalled EOS and the
    /// consumer stopped presenting new frames.
    fn end_of_stream(&self) {}

    /// The presentation position advanced to `frame_time_us`.
    fn position_changed(&self, frame_time_us: i64) {
        let _ = frame_time_us;
    }

    /// The consumer ran out of frames at `frame_time_us`.
    fn underflow(&self, frame_time_us: i64) {
        let _ = frame_time_us;
    }

    /// The consumer presented `frame_time_us` and has dropped `num_dropped`
    /// frames so far.
    fn consumer_status(&self, frame_time_us: i64, num_dropped: u32) {
        let _ = (frame_time_us, num_dropped);
    }
}

/// A host that ignores every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullHost;

impl PipelineHost for NullHost {}
