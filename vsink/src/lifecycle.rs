// SPDX-FileCopyrightText: 2025 Contributors to the vsink project.
// SPDX-License-Identifier: Apache-2.0

//! Sink lifecycle: building the pool, opening and tearing down the
//! consumer session.

use tracing::{debug, error, info, warn};
use vsink_proto::{ClientMessage, Rect};

use crate::{
    Error, Result,
    buffer::{BufferPool, BufferStrategy, DrmDevice, DumbAllocator, ImportStrategy, MemfdDevice},
    channel::DeliveryChannel,
    config::SinkSettings,
    context::SinkContext,
    dispatch::{DispatchLoop, DisplayConnection},
    producer::FrameProducer,
};

/// Sink states, in the order the host walks through them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum State {
    Null,
    Ready,
    Paused,
    Playing,
}

/// A single step between adjacent [`State`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateChange {
    NullToReady,
    ReadyToPaused,
    PausedToPlaying,
    PlayingToPaused,
    PausedToReady,
    ReadyToNull,
}

impl StateChange {
    /// The step leaving `from` towards `to`, if they differ.
    pub fn towards(from: State, to: State) -> Option<Self> {
        use State::*;
        Some(match (from, to) {
            (Null, Ready | Paused | Playing) => StateChange::NullToReady,
            (Ready, Paused | Playing) => StateChange::ReadyToPaused,
            (Paused, Playing) => StateChange::PausedToPlaying,
            (Playing, Paused | Ready | Null) => StateChange::PlayingToPaused,
            (Paused, Ready | Null) => StateChange::PausedToReady,
            (Ready, Null) => StateChange::ReadyToNull,
            _ => return None,
        })
    }

    pub fn from_state(&self) -> State {
        match self {
            StateChange::NullToReady => State::Null,
            StateChange::ReadyToPaused | StateChange::ReadyToNull => State::Ready,
            StateChange::PausedToPlaying | StateChange::PausedToReady => State::Paused,
            StateChange::PlayingToPaused => State::Playing,
        }
    }

    pub fn to_state(&self) -> State {
        match self {
            StateChange::ReadyToNull => State::Null,
            StateChange::NullToReady | StateChange::PausedToReady => State::Ready,
            StateChange::ReadyToPaused | StateChange::PlayingToPaused => State::Paused,
            StateChange::PausedToPlaying => State::Playing,
        }
    }
}

/// Where presented frames go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// No session is open.
    Inactive,
    /// Frames are sent to the consumer.
    Consumer,
    /// No consumer could be reached; only the position advances.
    LocalOnly,
}

/// Builds the buffer strategy when the sink goes to [`State::Ready`].
pub type StrategyFactory =
    Box<dyn FnMut(&SinkSettings) -> Result<Box<dyn BufferStrategy>> + Send>;

/// Opens a display connection each time a session starts.
pub type DisplayFactory = Box<dyn FnMut() -> Result<Box<dyn DisplayConnection>> + Send>;

/// Drives the sink through its states, owning the pool, the consumer
/// session and the dispatch threads.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use vsink::{
///     config::SinkSettings, context::SinkContext, host::NullHost,
///     lifecycle::{LifecycleController, OutputMode, State},
/// };
///
/// # fn main() -> Result<(), vsink::Error> {
/// let settings = SinkSettings {
///     socket_path: Some("/nonexistent/vsink-doc".into()),
///     ..Default::default()
/// };
/// let ctx = SinkContext::new(settings, Arc::new(NullHost));
/// let mut sink = LifecycleController::with_memfd_buffers(ctx);
///
/// sink.set_state(State::Playing)?;
/// assert_eq!(sink.output_mode(), OutputMode::LocalOnly);
/// sink.set_state(State::Null)?;
/// # Ok(())
/// # }
/// ```
pub struct LifecycleController {
    ctx: SinkContext,
    strategy_factory: StrategyFactory,
    display_factory: Option<DisplayFactory>,
    state: State,
    mode: OutputMode,
    producer: Option<FrameProducer>,
    channel: Option<DeliveryChannel>,
    dispatch: Option<DispatchLoop>,
}

impl LifecycleController {
    pub fn new(ctx: SinkContext, strategy_factory: StrategyFactory) -> Self {
        Self {
            ctx,
            strategy_factory,
            display_factory: None,
            state: State::Null,
            mode: OutputMode::Inactive,
            producer: None,
            channel: None,
            dispatch: None,
        }
    }

    /// A controller allocating dumb buffers on the configured DRM device.
    pub fn with_dumb_buffers(ctx: SinkContext) -> Self {
        Self::new(
            ctx,
            Box::new(|settings: &SinkSettings| -> Result<Box<dyn BufferStrategy>> {
                let device = DrmDevice::open(&settings.device_path)?;
                Ok(Box::new(DumbAllocator::new(device)))
            }),
        )
    }

    /// A controller allocating shared-memory buffers, for hosts without a
    /// DRM device.
    pub fn with_memfd_buffers(ctx: SinkContext) -> Self {
        Self::new(
            ctx,
            Box::new(|_: &SinkSettings| -> Result<Box<dyn BufferStrategy>> {
                Ok(Box::new(DumbAllocator::new(MemfdDevice::new())))
            }),
        )
    }

    /// A controller that imports upstream dma-bufs without copying.
    pub fn with_imported_buffers(ctx: SinkContext) -> Self {
        Self::new(
            ctx,
            Box::new(|_: &SinkSettings| -> Result<Box<dyn BufferStrategy>> {
                Ok(Box::new(ImportStrategy::new()))
            }),
        )
    }

    /// Pumps the given display connection while a session is open.
    pub fn set_display_factory(&mut self, factory: DisplayFactory) {
        self.display_factory = Some(factory);
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn output_mode(&self) -> OutputMode {
        self.mode
    }

    pub fn context(&self) -> &SinkContext {
        &self.ctx
    }

    /// The producer frames are submitted through; `None` in [`State::Null`].
    pub fn producer(&self) -> Option<FrameProducer> {
        self.producer.clone()
    }

    pub fn pool(&self) -> Option<&BufferPool> {
        self.producer.as_ref().map(FrameProducer::pool)
    }

    /// Walks one step at a time until `target` is reached.
    ///
    /// # Errors
    ///
    /// Stops at the first failing step and returns its error; the sink
    /// stays in the last state reached.
    pub fn set_state(&mut self, target: State) -> Result<()> {
        while let Some(step) = StateChange::towards(self.state, target) {
            self.change_state(step)?;
        }
        Ok(())
    }

    /// Performs one transition.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidState`] if the sink is not in the step's source
    ///   state
    /// - [`Error::TransitionFailed`] if Null→Ready cannot build the pool, or
    ///   Ready→Paused cannot reach a required consumer
    pub fn change_state(&mut self, transition: StateChange) -> Result<()> {
        if transition.from_state() != self.state {
            return Err(Error::InvalidState(format!(
                "{transition:?} requested in state {:?}",
                self.state
            )));
        }
        debug!("State change {:?}", transition);
        match transition {
            StateChange::NullToReady => self.build_pool(transition)?,
            StateChange::ReadyToPaused => self.open_session(transition)?,
            StateChange::PausedToPlaying => self.start_playing(transition)?,
            StateChange::PlayingToPaused => {
                self.send_control(&ClientMessage::Pause(true));
                self.teardown_session();
            }
            StateChange::PausedToReady => self.teardown_session(),
            StateChange::ReadyToNull => {
                self.teardown_session();
                self.producer = None;
                self.mode = OutputMode::Inactive;
            }
        }
        self.state = transition.to_state();
        Ok(())
    }

    fn build_pool(&mut self, transition: StateChange) -> Result<()> {
        let failed = |reason: String| Error::TransitionFailed { transition, reason };
        let settings = self.ctx.settings();
        settings.validate().map_err(|e| failed(e.to_string()))?;
        let strategy = (self.strategy_factory)(settings).map_err(|e| failed(e.to_string()))?;
        info!(
            "Using {} buffers, pool of {}",
            strategy.name(),
            settings.pool_size
        );
        let pool = BufferPool::new(strategy, settings.pool_size).map_err(|e| failed(e.to_string()))?;
        self.producer = Some(FrameProducer::new(self.ctx.clone(), pool));
        Ok(())
    }

    /// Connects to the consumer unless a session is already open, then
    /// (re)starts the dispatch threads.
    fn open_session(&mut self, transition: StateChange) -> Result<()> {
        if self.channel.as_ref().is_some_and(DeliveryChannel::is_connected) {
            return Ok(());
        }
        let producer = self
            .producer
            .clone()
            .ok_or_else(|| Error::InvalidState("no pool".into()))?;
        let pool = producer.pool().clone();
        pool.set_flushing(false);

        let path = self.ctx.settings().socket_path();
        self.stop_dispatch();
        let channel = match DeliveryChannel::connect(&path, pool.clone(), self.ctx.clone()) {
            Ok(channel) => Some(channel),
            Err(err) if self.ctx.settings().consumer_required => {
                return Err(Error::TransitionFailed {
                    transition,
                    reason: err.to_string(),
                });
            }
            Err(err) => {
                warn!("{}; presenting without a consumer", err);
                None
            }
        };

        if let (Some(channel), Some(session)) = (&channel, self.ctx.settings().session) {
            let info = ClientMessage::SessionInfo {
                sync_type: session.sync_type,
                session_id: session.session_id,
            };
            if let Err(err) = channel.send_control(&info) {
                warn!("Failed to send session info: {}", err);
            }
        }

        self.mode = if channel.is_some() {
            OutputMode::Consumer
        } else {
            OutputMode::LocalOnly
        };
        producer.set_channel(channel.clone());
        self.channel = channel;

        let display = match self.display_factory.as_mut().map(|open| open()) {
            Some(Ok(display)) => Some(display),
            Some(Err(err)) => {
                warn!("No display connection: {}", err);
                None
            }
            None => None,
        };
        self.dispatch = Some(
            DispatchLoop::start(self.ctx.clone(), self.channel.clone(), display)
                .map_err(|e| Error::TransitionFailed {
                    transition,
                    reason: e.to_string(),
                })?,
        );
        Ok(())
    }

    fn start_playing(&mut self, transition: StateChange) -> Result<()> {
        self.open_session(transition)?;
        self.ctx.playback().set_playing(true);
        let rect = self
            .producer
            .as_ref()
            .map_or(self.ctx.settings().render_rect, FrameProducer::render_rect);
        self.send_control(&ClientMessage::Pause(false));
        self.send_control(&ClientMessage::Rect(rect));
        Ok(())
    }

    fn stop_dispatch(&mut self) {
        if let Some(mut dispatch) = self.dispatch.take() {
            dispatch.stop();
        }
    }

    /// Stops dispatch, drops every consumer reference and disconnects.
    /// Failures are logged only. Idempotent.
    fn teardown_session(&mut self) {
        self.ctx.playback().set_playing(false);
        let pool = self.producer.as_ref().map(|p| p.pool().clone());
        if let Some(pool) = &pool {
            // wakes a producer blocked waiting for a slot
            pool.set_flushing(true);
        }
        self.stop_dispatch();
        if let Some(producer) = &self.producer {
            producer.set_channel(None);
        }
        if let Some(channel) = self.channel.take() {
            channel.disconnect();
        }
        if let Some(pool) = &pool {
            pool.release_all();
        }
        if self.mode != OutputMode::Inactive {
            debug!("Session closed");
        }
        self.mode = OutputMode::Inactive;
    }

    fn send_control(&self, message: &ClientMessage) {
        let Some(channel) = self.channel.as_ref().filter(|c| c.is_connected()) else {
            return;
        };
        if let Err(err) = channel.send_control(message) {
            warn!("Failed to send {:?}: {}", message, err);
        }
    }

    /// Sets the destination rectangle for subsequent frames and tells the
    /// consumer.
    pub fn set_render_rect(&mut self, rect: Rect) {
        if let Some(producer) = &self.producer {
            producer.set_render_rect(rect);
        }
        self.send_control(&ClientMessage::Rect(rect));
    }

    /// Shows or hides the video surface on the consumer.
    pub fn set_visible(&mut self, visible: bool) {
        self.send_control(&ClientMessage::Hide(!visible));
    }

    /// Drops queued frames on the consumer and forgets position and EOS
    /// state.
    pub fn flush(&mut self) {
        self.send_control(&ClientMessage::Flush);
        self.ctx.playback().reset();
        if let Some(pool) = self.pool() {
            pool.drain_releases();
        }
    }

    /// Records that upstream has no more frames. End-of-stream is posted to
    /// the host once the consumer stops presenting.
    pub fn signal_eos(&self) {
        info!("Upstream end of stream");
        self.ctx.playback().signal_upstream_eos();
    }

    /// Presentation time of the last frame, in microseconds.
    pub fn position(&self) -> Option<i64> {
        self.ctx.playback().position()
    }
}

impl std::fmt::Debug for LifecycleController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleController")
            .field("state", &self.state)
            .field("mode", &self.mode)
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

impl Drop for LifecycleController {
    fn drop(&mut self) {
        if let Err(err) = self.set_state(State::Null) {
            error!("Failed to shut the sink down: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tracing_test::traced_test;

    use super::*;
    use crate::host::NullHost;

    fn unreachable_consumer(required: bool) -> SinkContext {
        let settings = SinkSettings {
            socket_path: Some("/nonexistent/vsink-consumer".into()),
            consumer_required: required,
            ..Default::default()
        };
        SinkContext::new(settings, Arc::new(NullHost))
    }

    #[test]
    fn steps_towards_target() {
        assert_eq!(
            StateChange::towards(State::Null, State::Playing),
            Some(StateChange::NullToReady)
        );
        assert_eq!(
            StateChange::towards(State::Playing, State::Null),
            Some(StateChange::PlayingToPaused)
        );
        assert_eq!(StateChange::towards(State::Paused, State::Paused), None);
    }

    #[traced_test]
    #[test]
    fn missing_consumer_degrades_to_local_only() {
        let mut sink = LifecycleController::with_memfd_buffers(unreachable_consumer(false));
        sink.set_state(State::Paused).unwrap();
        assert_eq!(sink.output_mode(), OutputMode::LocalOnly);
        assert!(sink.producer().is_some());
        assert!(logs_contain("presenting without a consumer"));
    }

    #[test]
    fn required_consumer_fails_transition() {
        let mut sink = LifecycleController::with_memfd_buffers(unreachable_consumer(true));
        let err = sink.set_state(State::Paused).unwrap_err();
        assert!(matches!(
            err,
            Error::TransitionFailed {
                transition: StateChange::ReadyToPaused,
                ..
            }
        ));
        assert_eq!(sink.state(), State::Ready);
    }

    #[test]
    fn bad_device_fails_null_to_ready() {
        let settings = SinkSettings {
            device_path: "/nonexistent/dri/card0".into(),
            ..Default::default()
        };
        let mut sink =
            LifecycleController::with_dumb_buffers(SinkContext::new(settings, Arc::new(NullHost)));
        assert!(matches!(
            sink.change_state(StateChange::NullToReady),
            Err(Error::TransitionFailed { .. })
        ));
        assert_eq!(sink.state(), State::Null);
    }

    #[test]
    fn out_of_order_transition_is_rejected() {
        let mut sink = LifecycleController::with_memfd_buffers(unreachable_consumer(false));
        assert!(matches!(
            sink.change_state(StateChange::PausedToPlaying),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn teardown_is_idempotent() {
        let mut sink = LifecycleController::with_memfd_buffers(unreachable_consumer(false));
        sink.set_state(State::Playing).unwrap();
        sink.set_state(State::Ready).unwrap();
        sink.teardown_session();
        sink.set_state(State::Null).unwrap();
        assert!(sink.producer().is_none());
        assert_eq!(sink.output_mode(), OutputMode::Inactive);
    }
}
