// SPDX-FileCopyrightText: 2025 Contributors to the vsink project.
// SPDX-License-Identifier: Apache-2.0

//! Shared context handed to every sink component.
//!
//! A [`SinkContext`] bundles the settings, the host callbacks and the
//! playback state that the producer, the delivery channel and the dispatch
//! threads all observe. It is created by the lifecycle controller and cloned
//! into each component; clones share the same state.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    },
    time::Duration,
};

use tracing::debug;

use crate::{config::SinkSettings, host::PipelineHost, time};

/// Cheaply cloneable handle to the per-sink shared state.
#[derive(Clone)]
pub struct SinkContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    settings: SinkSettings,
    host: Arc<dyn PipelineHost>,
    playback: Playback,
}

impl SinkContext {
    /// Creates a context for one sink instance.
    pub fn new(settings: SinkSettings, host: Arc<dyn PipelineHost>) -> Self {
        let playback = Playback::new(settings.frame_period());
        Self {
            inner: Arc::new(ContextInner {
                settings,
                host,
                playback,
            }),
        }
    }

    pub fn settings(&self) -> &SinkSettings {
        &self.inner.settings
    }

    pub fn host(&self) -> &dyn PipelineHost {
        self.inner.host.as_ref()
    }

    pub fn playback(&self) -> &Playback {
        &self.inner.playback
    }
}

impl std::fmt::Debug for SinkContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkContext")
            .field("settings", &self.inner.settings)
            .field("playback", &self.inner.playback)
            .finish_non_exhaustive()
    }
}

/// Playback progress shared between the producer and the dispatch threads.
///
/// Flags and counters are atomics; the presentation clock sits behind its
/// own mutex so that stamping a frame is a single critical section.
#[derive(Debug)]
pub struct Playback {
    playing: AtomicBool,
    upstream_eos: AtomicBool,
    eos_posted: AtomicBool,
    frames_presented: AtomicU64,
    frame_period_us: AtomicU64,
    dropped_frames: AtomicU32,
    clock: Mutex<PresentationClock>,
}

#[derive(Debug, Default)]
struct PresentationClock {
    last_frame_time_us: Option<i64>,
}

impl Playback {
    fn new(frame_period: Duration) -> Self {
        let frame_period_us = u64::try_from(frame_period.as_micros()).unwrap_or(u64::MAX);
        Self {
            playing: AtomicBool::new(false),
            upstream_eos: AtomicBool::new(false),
            eos_posted: AtomicBool::new(false),
            frames_presented: AtomicU64::new(0),
            frame_period_us: AtomicU64::new(frame_period_us.max(1)),
            dropped_frames: AtomicU32::new(0),
            clock: Mutex::new(PresentationClock::default()),
        }
    }

    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::Acquire)
    }

    pub fn set_playing(&self, playing: bool) {
        self.playing.store(playing, Ordering::Release);
    }

    /// Records that upstream delivered end-of-stream.
    pub fn signal_upstream_eos(&self) {
        self.upstream_eos.store(true, Ordering::Release);
    }

    pub fn upstream_eos(&self) -> bool {
        self.upstream_eos.load(Ordering::Acquire)
    }

    /// Marks EOS as posted to the host. Returns true only for the first call
    /// since the last [`Self::reset`].
    pub fn mark_eos_posted(&self) -> bool {
        !self.eos_posted.swap(true, Ordering::AcqRel)
    }

    pub fn eos_posted(&self) -> bool {
        self.eos_posted.load(Ordering::Acquire)
    }

    /// Number of frames handed to the consumer (or presented locally).
    pub fn frames_presented(&self) -> u64 {
        self.frames_presented.load(Ordering::Acquire)
    }

    /// Counts one presented frame.
    pub fn note_frame_presented(&self) {
        self.frames_presented.fetch_add(1, Ordering::AcqRel);
    }

    /// Current frame period, learned from the consumer's refresh rate.
    pub fn frame_period(&self) -> Duration {
        Duration::from_micros(self.frame_period_us.load(Ordering::Acquire))
    }

    /// Updates the frame period from a consumer refresh rate in Hz. A rate of
    /// zero is ignored.
    pub fn set_refresh_rate(&self, refresh_rate_hz: u32) {
        let Some(period) = time::frame_period(refresh_rate_hz) else {
            return;
        };
        let period_us = period.as_micros() as u64;
        debug!(
            "Consumer refresh rate {} Hz, frame period {} us",
            refresh_rate_hz, period_us
        );
        self.frame_period_us
            .store(period_us.max(1), Ordering::Release);
    }

    pub fn dropped_frames(&self) -> u32 {
        self.dropped_frames.load(Ordering::Acquire)
    }

    pub fn set_dropped_frames(&self, dropped: u32) {
        self.dropped_frames.store(dropped, Ordering::Release);
    }

    /// Derives the presentation time for the next frame.
    ///
    /// Uses the frame timestamp when present, otherwise the previous time
    /// plus one frame period. The result never goes backwards.
    pub fn next_frame_time(&self, timestamp_us: Option<i64>) -> i64 {
        let period = self.frame_period_us.load(Ordering::Acquire) as i64;
        let mut clock = self.clock.lock().unwrap_or_else(|e| e.into_inner());
        let candidate = match (timestamp_us, clock.last_frame_time_us) {
            (Some(ts), _) => ts,
            (None, Some(last)) => last.saturating_add(period),
            (None, None) => 0,
        };
        let frame_time = clock
            .last_frame_time_us
            .map_or(candidate, |last| candidate.max(last));
        clock.last_frame_time_us = Some(frame_time);
        frame_time
    }

    /// Presentation time of the most recent frame.
    pub fn position(&self) -> Option<i64> {
        self.clock
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .last_frame_time_us
    }

    /// Forgets position and EOS state, e.g. after a flush.
    pub fn reset(&self) {
        self.upstream_eos.store(false, Ordering::Release);
        self.eos_posted.store(false, Ordering::Release);
        self.dropped_frames.store(0, Ordering::Release);
        self.clock
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .last_frame_time_us = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::NullHost;

    fn context() -> SinkContext {
        SinkContext::new(SinkSettings::default(), Arc::new(NullHost))
    }

    #[test]
    fn initial_period_comes_from_settings() {
        let settings = SinkSettings {
            frame_period_us: 40_000,
            ..Default::default()
        };
        let expected = settings.frame_period();
        let ctx = SinkContext::new(settings, Arc::new(NullHost));
        assert_eq!(ctx.playback().frame_period(), expected);
        assert_eq!(expected, Duration::from_millis(40));
    }

    #[test]
    fn presentation_time_never_goes_backwards() {
        let ctx = context();
        let playback = ctx.playback();
        assert_eq!(playback.next_frame_time(Some(1_000)), 1_000);
        assert_eq!(playback.next_frame_time(Some(500)), 1_000);
        assert_eq!(playback.next_frame_time(Some(2_000)), 2_000);
        assert_eq!(playback.position(), Some(2_000));
    }

    #[test]
    fn missing_timestamp_advances_by_one_period() {
        let ctx = context();
        let playback = ctx.playback();
        playback.set_refresh_rate(50);
        assert_eq!(playback.next_frame_time(None), 0);
        assert_eq!(playback.next_frame_time(None), 20_000);
        assert_eq!(playback.next_frame_time(Some(10)), 20_000);
    }

    #[test]
    fn eos_is_posted_once_until_reset() {
        let ctx = context();
        let playback = ctx.playback();
        assert!(playback.mark_eos_posted());
        assert!(!playback.mark_eos_posted());
        playback.reset();
        assert!(playback.mark_eos_posted());
    }
}
