// SPDX-FileCopyrightText: 2025 Contributors to the vsink project.
// SPDX-License-Identifier: Apache-2.0

//! Runtime configuration of the video sink.
//!
//! [`SinkSettings`] carries everything the lifecycle controller needs to
//! build its pool and reach the consumer. Settings are plain data: they can be
//! built in code, or loaded from JSON with [`SinkSettings::from_json`], where
//! any missing field falls back to its default.

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use vsink_proto::Rect;

use crate::Result;

/// Default consumer server name, resolved under `$XDG_RUNTIME_DIR`.
pub const DEFAULT_SERVER_NAME: &str = "video";

/// Default DRM device used for dumb buffer allocation.
pub const DEFAULT_DEVICE_PATH: &str = "/dev/dri/card0";

/// Default number of slots in the buffer pool.
pub const DEFAULT_POOL_SIZE: usize = 4;

/// Consecutive stalled frame periods before end-of-stream is posted.
pub const DEFAULT_EOS_DETECT_FRAMES: u32 = 10;

/// Frame period assumed until the consumer reports its refresh rate (60 Hz).
pub const DEFAULT_FRAME_PERIOD_US: u64 = 16_667;

/// Session parameters forwarded to the consumer right after connecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSettings {
    /// AV sync mode understood by the consumer.
    pub sync_type: u8,
    /// Audio/video session the consumer should attach to.
    pub session_id: u32,
}

/// User-configurable settings for the video sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkSettings {
    /// Consumer socket name under `$XDG_RUNTIME_DIR`.
    pub server_name: String,

    /// Absolute consumer socket path, overriding `server_name`.
    pub socket_path: Option<PathBuf>,

    /// Device node opened for local buffer allocation.
    pub device_path: PathBuf,

    /// Number of slots in the buffer pool.
    pub pool_size: usize,

    /// Fail Ready→Paused when the consumer is unreachable instead of falling
    /// back to the local-only mode.
    pub consumer_required: bool,

    /// Stalled frame periods after upstream EOS before EOS is posted.
    pub eos_detect_frames: u32,

    /// Frame period in microseconds until the consumer reports its rate.
    pub frame_period_us: u64,

    /// Optional session info sent on connect.
    pub session: Option<SessionSettings>,

    /// Destination rectangle sent when playback starts.
    pub render_rect: Rect,
}

impl Default for SinkSettings {
    fn default() -> Self {
        SinkSettings {
            server_name: DEFAULT_SERVER_NAME.to_owned(),
            socket_path: None,
            device_path: PathBuf::from(DEFAULT_DEVICE_PATH),
            pool_size: DEFAULT_POOL_SIZE,
            consumer_required: false,
            eos_detect_frames: DEFAULT_EOS_DETECT_FRAMES,
            frame_period_us: DEFAULT_FRAME_PERIOD_US,
            session: None,
            render_rect: Rect::new(0, 0, 1920, 1080),
        }
    }
}

impl SinkSettings {
    /// Parses settings from a JSON document.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Settings`] for malformed JSON and
    /// [`crate::Error::InvalidArg`] for out-of-range values.
    ///
    /// # Examples
    ///
    /// ```
    /// use vsink::config::SinkSettings;
    ///
    /// # fn main() -> Result<(), vsink::Error> {
    /// let settings = SinkSettings::from_json(r#"{"server_name": "westeros", "pool_size": 3}"#)?;
    /// assert_eq!(settings.pool_size, 3);
    /// assert_eq!(settings.eos_detect_frames, 10);
    /// # Ok(())
    /// # }
    /// ```
    pub fn from_json(json: &str) -> Result<Self> {
        let settings: SinkSettings = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Checks value ranges.
    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            return Err(crate::Error::InvalidArg("pool_size must be at least 1".into()));
        }
        if self.frame_period_us == 0 {
            return Err(crate::Error::InvalidArg(
                "frame_period_us must be positive".into(),
            ));
        }
        if self.socket_path.is_none() && self.server_name.is_empty() {
            return Err(crate::Error::InvalidArg("server_name is empty".into()));
        }
        Ok(())
    }

    /// Resolves the consumer socket path.
    ///
    /// Uses [`Self::socket_path`] when set, otherwise
    /// `$XDG_RUNTIME_DIR/<server_name>`. Without `XDG_RUNTIME_DIR` the name is
    /// resolved relative to `/run/user/<uid>`.
    pub fn socket_path(&self) -> PathBuf {
        if let Some(path) = &self.socket_path {
            return path.clone();
        }
        let runtime_dir = std::env::var_os("XDG_RUNTIME_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(format!("/run/user/{}", nix::unistd::getuid())));
        runtime_dir.join(&self.server_name)
    }

    /// Frame period as a [`Duration`].
    pub fn frame_period(&self) -> Duration {
        Duration::from_micros(self.frame_period_us)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let settings = SinkSettings::from_json("{}").unwrap();
        assert_eq!(settings, SinkSettings::default());
    }

    #[test]
    fn explicit_socket_path_wins() {
        let settings = SinkSettings {
            socket_path: Some(PathBuf::from("/tmp/consumer")),
            ..Default::default()
        };
        assert_eq!(settings.socket_path(), PathBuf::from("/tmp/consumer"));
    }

    #[test]
    fn server_name_resolves_under_runtime_dir() {
        let settings = SinkSettings {
            server_name: "westeros-video".into(),
            ..Default::default()
        };
        assert!(settings.socket_path().ends_with("westeros-video"));
    }

    #[test]
    fn zero_pool_is_rejected() {
        assert!(matches!(
            SinkSettings::from_json(r#"{"pool_size": 0}"#),
            Err(crate::Error::InvalidArg(_))
        ));
    }

    #[test]
    fn session_round_trips_through_json() {
        let settings = SinkSettings {
            session: Some(SessionSettings {
                sync_type: 1,
                session_id: 12,
            }),
            ..Default::default()
        };
        let json = serde_json::to_string(&settings).unwrap();
        assert_eq!(SinkSettings::from_json(&json).unwrap(), settings);
    }
}
