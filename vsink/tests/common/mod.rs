// SPDX-FileCopyrightText: 2025 Contributors to the vsink project.
// SPDX-License-Identifier: Apache-2.0

//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use vsink::{
    config::SinkSettings,
    context::SinkContext,
    host::PipelineHost,
    lifecycle::LifecycleController,
};

/// Ensures logging is initialized only once across all tests.
static LOG_ONCE: std::sync::Once = std::sync::Once::new();

pub fn setup_logging() {
    // Respects RUST_LOG
    LOG_ONCE.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::builder()
                    .with_default_directive(tracing::level_filters::LevelFilter::INFO.into())
                    .from_env_lossy(),
            )
            .with_test_writer()
            .try_init();
    });
}

/// RAII guard for a consumer socket path.
///
/// Hands out a unique path under the temporary directory and removes
/// whatever is left there when dropped.
pub struct TestSocketGuard {
    path: PathBuf,
}

impl TestSocketGuard {
    pub fn new(test: &str) -> Self {
        let path = std::env::temp_dir().join(format!(
            "vsink_test_{}_{}.sock",
            test,
            uuid::Uuid::new_v4()
        ));
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TestSocketGuard {
    fn drop(&mut self) {
        // the listener usually removed it already
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Host that records every notification it receives.
#[derive(Debug, Default)]
pub struct RecordingHost {
    pub positions: Mutex<Vec<i64>>,
    pub eos: Mutex<usize>,
    pub underflows: Mutex<Vec<i64>>,
}

impl PipelineHost for RecordingHost {
    fn end_of_stream(&self) {
        *self.eos.lock().unwrap() += 1;
    }

    fn position_changed(&self, frame_time_us: i64) {
        self.positions.lock().unwrap().push(frame_time_us);
    }

    fn underflow(&self, frame_time_us: i64) {
        self.underflows.lock().unwrap().push(frame_time_us);
    }
}

/// Settings pointing at `socket` with a short frame period so that the
/// dispatch threads react quickly.
pub fn settings(socket: &Path, pool_size: usize) -> SinkSettings {
    SinkSettings {
        socket_path: Some(socket.to_path_buf()),
        pool_size,
        frame_period_us: 1_000,
        eos_detect_frames: 3,
        ..Default::default()
    }
}

/// A controller over memfd-backed buffers reporting to a fresh
/// [`RecordingHost`].
pub fn controller(settings: SinkSettings) -> (LifecycleController, Arc<RecordingHost>) {
    let host = Arc::new(RecordingHost::default());
    let ctx = SinkContext::new(settings, host.clone());
    (LifecycleController::with_memfd_buffers(ctx), host)
}

/// Polls `cond` until it holds or two seconds passed.
pub fn wait_for(cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !cond() {
        if Instant::now() > deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    true
}
