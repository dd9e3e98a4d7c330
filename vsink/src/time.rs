// SPDX-FileCopyrightText: 2025 Contributors to the vsink project.
// SPDX-License-Identifier: Apache-2.0

//! Clock helpers for presentation timestamps.
//!
//! Frame times on the wire are signed microseconds. Timestamps produced
//! locally come from the monotonic clock so they never step backwards when
//! wall time is adjusted.

use std::time::Duration;

use nix::time::{ClockId, clock_gettime};

use crate::Result;

/// Current `CLOCK_MONOTONIC` time in microseconds.
///
/// # Errors
///
/// Returns [`crate::Error::Errno`] if the clock cannot be read.
pub fn monotonic_us() -> Result<i64> {
    let now = clock_gettime(ClockId::CLOCK_MONOTONIC)?;
    Ok(i64::from(now.tv_sec()) * 1_000_000 + i64::from(now.tv_nsec()) / 1_000)
}

/// Frame period of a display refreshing at `refresh_rate_hz`.
///
/// Returns `None` for a rate of zero.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use vsink::time::frame_period;
///
/// assert_eq!(frame_period(50), Some(Duration::from_millis(20)));
/// assert_eq!(frame_period(0), None);
/// ```
pub fn frame_period(refresh_rate_hz: u32) -> Option<Duration> {
    (refresh_rate_hz != 0).then(|| Duration::from_micros(1_000_000 / u64::from(refresh_rate_hz)))
}

/// Converts a duration to wire microseconds, saturating at `i64::MAX`.
pub fn to_frame_time_us(duration: Duration) -> i64 {
    i64::try_from(duration.as_micros()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_clock_advances() {
        let first = monotonic_us().unwrap();
        std::thread::sleep(Duration::from_millis(2));
        assert!(monotonic_us().unwrap() > first);
    }

    #[test]
    fn sixty_hertz_period() {
        assert_eq!(frame_period(60), Some(Duration::from_micros(16_666)));
        assert_eq!(to_frame_time_us(Duration::from_secs(2)), 2_000_000);
    }
}
